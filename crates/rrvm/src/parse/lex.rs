//! Line-oriented tokenizer.
//!
//! Each source line is tokenized independently. A `#` begins a comment: if
//! the first non-space character of the line is `#`, the whole line is a
//! comment and yields no tokens; a `#` after code starts a trailing comment
//! and only the tokens before it are returned. Tokens are separated by
//! whitespace; consecutive whitespace collapses.

/// True when `line` is an entire-line comment.
///
/// Leading whitespace is allowed; empty lines are not comments.
pub fn is_comment_line(line: &str) -> bool {
    line.trim_start().starts_with('#')
}

/// Split one line into tokens, honoring `#` comments.
///
/// A trailing `\r` (CRLF input) is stripped. Empty lines and comment lines
/// yield an empty vector.
pub fn tokenize_line(line: &str) -> Vec<&str> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let code = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    code.split_whitespace().collect()
}
