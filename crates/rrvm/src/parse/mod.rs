//! Parser for `.rr` assembly source.
//!
//! Converts source text to bytecode, one instruction per line.
//!
//! # Grammar
//!
//! ```text
//! push <type> <imm>         set <type> <imm>
//! add | sub | mul | div | rem
//! move <imm>                offset <imm>
//! load | store | print | printchar
//! deref | refer | where | index
//! func <name>               call <name>
//! ret | return
//! if | else | end
//! while <label>             label <name>   |   <name>:
//! halt
//! or | and | not
//! bitand | bitor | bitxor
//! lsh | lrsh | arsh | gez
//! ```
//!
//! Mnemonics are case-insensitive. Types are `i8 u8 i16 u16 i32 u32 i64
//! u64 f32 f64 bool ptr void`. Integer immediates are decimal or C-hex;
//! float immediates are either a numeric literal (bit-cast into the word)
//! or a `0x…` raw IEEE 754 bit pattern. Comments start with `#`.
//!
//! Function names map to indices allocated on first reference; a name that
//! is never defined is an error at end of parse. `while` takes a label
//! naming the first instruction of its condition region; forward references
//! are backpatched when the label is defined.

pub mod lex;

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fs;
use std::io::{self, Read};

use crate::core::{TypeTag, Word, f32_to_word, f64_to_word};
use crate::vm::Vm;
use crate::vm::bytecode::{Opcode, emit0, emit1, emit2};

/// Parse error with a human-readable message and source location.
#[derive(Clone, Debug)]
pub struct ParseError {
    /// Human-readable error message.
    pub message: String,
    /// 1-based source line, or 0 for errors without a line (I/O failures).
    pub line: usize,
}

impl ParseError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line,
        }
    }
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.line > 0 {
            write!(f, "line {}: {}", self.line, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for ParseError {}

/// Function table entry.
struct FuncDef {
    index: usize,
    defined: bool,
    /// Line of the first reference, for end-of-parse diagnostics.
    first_line: usize,
}

/// A `while` immediate waiting for its label.
struct WhilePatch {
    label: String,
    /// Index in `code` of the placeholder immediate.
    imm_pos: usize,
    line: usize,
}

/// Parser state: the output buffer plus the three symbol tables.
#[derive(Default)]
struct Parser {
    code: Vec<Word>,
    labels: HashMap<String, usize>,
    funcs: HashMap<String, FuncDef>,
    next_func: usize,
    patches: Vec<WhilePatch>,
}

impl Parser {
    /// Define a label at the current code position and fill any pending
    /// `while` placeholders that reference it.
    fn define_label(&mut self, name: &str, line: usize) -> Result<(), ParseError> {
        let pos = self.code.len();
        if self.labels.insert(name.to_string(), pos).is_some() {
            return Err(ParseError::new(line, format!("label '{name}' redefined")));
        }
        let code = &mut self.code;
        self.patches.retain(|patch| {
            if patch.label == name {
                code[patch.imm_pos] = pos as Word;
                false
            } else {
                true
            }
        });
        Ok(())
    }

    /// Allocate (or look up) the index for a function name.
    fn func_index(&mut self, name: &str, line: usize) -> usize {
        match self.funcs.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.get().index,
            Entry::Vacant(entry) => {
                let index = self.next_func;
                self.next_func += 1;
                entry.insert(FuncDef {
                    index,
                    defined: false,
                    first_line: line,
                });
                index
            }
        }
    }

    /// Mark a function as defined, allocating its index if needed.
    fn define_func(&mut self, name: &str, line: usize) -> Result<usize, ParseError> {
        match self.funcs.entry(name.to_string()) {
            Entry::Occupied(mut entry) => {
                let def = entry.get_mut();
                if def.defined {
                    return Err(ParseError::new(line, format!("function '{name}' redefined")));
                }
                def.defined = true;
                Ok(def.index)
            }
            Entry::Vacant(entry) => {
                let index = self.next_func;
                self.next_func += 1;
                entry.insert(FuncDef {
                    index,
                    defined: true,
                    first_line: line,
                });
                Ok(index)
            }
        }
    }

    fn parse_line(&mut self, raw: &str, line: usize) -> Result<(), ParseError> {
        let tokens = lex::tokenize_line(raw);
        let Some(&first) = tokens.first() else {
            return Ok(());
        };

        // `name:` label form
        if first.len() > 1 && first.ends_with(':') {
            if tokens.len() > 1 {
                return Err(ParseError::new(
                    line,
                    "tokens after a label on the same line are not allowed",
                ));
            }
            return self.define_label(&first[..first.len() - 1], line);
        }

        let keyword = first.to_ascii_lowercase();
        match keyword.as_str() {
            "push" | "set" => {
                let op = if keyword == "push" { Opcode::Push } else { Opcode::Set };
                if tokens.len() != 3 {
                    return Err(ParseError::new(
                        line,
                        format!("{keyword} expects: {keyword} <type> <imm>"),
                    ));
                }
                let ty = TypeTag::from_name(tokens[1]).unwrap_or(TypeTag::Unknown);
                let imm = parse_typed_imm(ty, tokens[2]).ok_or_else(|| {
                    ParseError::new(
                        line,
                        match ty {
                            TypeTag::F32 => format!("invalid f32 immediate '{}'", tokens[2]),
                            TypeTag::F64 => format!("invalid f64 immediate '{}'", tokens[2]),
                            _ => format!("invalid immediate '{}'", tokens[2]),
                        },
                    )
                })?;
                emit2(&mut self.code, op, ty.as_word(), imm);
            }
            "add" => self.simple(&tokens, line, Opcode::Add)?,
            "sub" => self.simple(&tokens, line, Opcode::Sub)?,
            "mul" => self.simple(&tokens, line, Opcode::Mul)?,
            "div" => self.simple(&tokens, line, Opcode::Div)?,
            "rem" => self.simple(&tokens, line, Opcode::Rem)?,
            "move" | "offset" => {
                let op = if keyword == "move" { Opcode::Move } else { Opcode::Offset };
                if tokens.len() != 2 {
                    return Err(ParseError::new(
                        line,
                        format!("{keyword} expects a signed immediate"),
                    ));
                }
                let imm = parse_int(tokens[1]).ok_or_else(|| {
                    ParseError::new(line, format!("invalid immediate '{}'", tokens[1]))
                })?;
                emit1(&mut self.code, op, imm);
            }
            "load" => self.simple(&tokens, line, Opcode::Load)?,
            "store" => self.simple(&tokens, line, Opcode::Store)?,
            "print" => self.simple(&tokens, line, Opcode::Print)?,
            "printchar" | "print_char" => self.simple(&tokens, line, Opcode::PrintChar)?,
            "deref" => self.simple(&tokens, line, Opcode::Deref)?,
            "refer" => self.simple(&tokens, line, Opcode::Refer)?,
            "where" => self.simple(&tokens, line, Opcode::Where)?,
            "index" => self.simple(&tokens, line, Opcode::Index)?,
            "func" => {
                if tokens.len() != 2 {
                    return Err(ParseError::new(line, "func expects: func <name>"));
                }
                let index = self.define_func(tokens[1], line)?;
                emit1(&mut self.code, Opcode::Function, index as Word);
            }
            "call" => {
                if tokens.len() != 2 {
                    return Err(ParseError::new(line, "call expects: call <name>"));
                }
                let index = self.func_index(tokens[1], line);
                emit1(&mut self.code, Opcode::Call, index as Word);
            }
            "ret" | "return" => self.simple(&tokens, line, Opcode::Return)?,
            "if" => self.simple(&tokens, line, Opcode::If)?,
            "else" => self.simple(&tokens, line, Opcode::Else)?,
            "end" => self.simple(&tokens, line, Opcode::Endblock)?,
            "while" => {
                if tokens.len() != 2 {
                    return Err(ParseError::new(line, "while expects: while <label>"));
                }
                // emit the opcode with a placeholder immediate, then either
                // resolve it now or record a patch
                self.code.push(Opcode::While.as_word());
                let imm_pos = self.code.len();
                self.code.push(0);
                match self.labels.get(tokens[1]) {
                    Some(&pos) => self.code[imm_pos] = pos as Word,
                    None => self.patches.push(WhilePatch {
                        label: tokens[1].to_string(),
                        imm_pos,
                        line,
                    }),
                }
            }
            "label" => {
                if tokens.len() != 2 {
                    return Err(ParseError::new(line, "label expects: label <name>"));
                }
                self.define_label(tokens[1], line)?;
            }
            "halt" => self.simple(&tokens, line, Opcode::Halt)?,
            "or" | "orassign" => self.simple(&tokens, line, Opcode::OrAssign)?,
            "and" | "andassign" => self.simple(&tokens, line, Opcode::AndAssign)?,
            "not" => self.simple(&tokens, line, Opcode::Not)?,
            "bitand" => self.simple(&tokens, line, Opcode::BitAnd)?,
            "bitor" => self.simple(&tokens, line, Opcode::BitOr)?,
            "bitxor" => self.simple(&tokens, line, Opcode::BitXor)?,
            "lsh" => self.simple(&tokens, line, Opcode::Lsh)?,
            "lrsh" => self.simple(&tokens, line, Opcode::Lrsh)?,
            "arsh" => self.simple(&tokens, line, Opcode::Arsh)?,
            "gez" => self.simple(&tokens, line, Opcode::Gez)?,
            _ => {
                return Err(ParseError::new(line, format!("unknown keyword '{first}'")));
            }
        }
        Ok(())
    }

    /// Emit a 0-immediate instruction, rejecting stray operands.
    fn simple(&mut self, tokens: &[&str], line: usize, op: Opcode) -> Result<(), ParseError> {
        if tokens.len() != 1 {
            return Err(ParseError::new(
                line,
                format!("'{}' takes no operands", tokens[0]),
            ));
        }
        emit0(&mut self.code, op);
        Ok(())
    }

    fn finish(self) -> Result<Vm, ParseError> {
        // every while must have found its label
        if let Some(patch) = self.patches.first() {
            return Err(ParseError::new(
                patch.line,
                format!("undefined label referenced by while: '{}'", patch.label),
            ));
        }
        // every referenced function must have been defined
        for (name, def) in &self.funcs {
            if !def.defined {
                return Err(ParseError::new(
                    def.first_line,
                    format!("undefined function referenced: '{name}'"),
                ));
            }
        }
        Ok(Vm::new(self.code))
    }
}

/// Parse `.rr` source text into a VM owning the resulting bytecode.
pub fn parse(source: &str) -> Result<Vm, ParseError> {
    let mut parser = Parser::default();
    for (idx, raw) in source.lines().enumerate() {
        parser.parse_line(raw, idx + 1)?;
    }
    parser.finish()
}

/// Parse the `.rr` source at `path`, or standard input when `path` is `-`.
pub fn parse_file(path: &str) -> Result<Vm, ParseError> {
    let source = if path == "-" {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| ParseError::new(0, format!("cannot read stdin: {e}")))?;
        buf
    } else {
        fs::read_to_string(path)
            .map_err(|e| ParseError::new(0, format!("cannot open '{path}': {e}")))?
    };
    parse(&source)
}

// --- Immediate parsing ---

/// Parse an integer immediate: decimal or C-hex, optionally signed.
fn parse_int(s: &str) -> Option<Word> {
    let (negative, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let magnitude = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok()?,
        None if body.is_empty() => return None,
        None => body.parse::<u64>().ok()?,
    };
    // full-width hex bit patterns wrap into the signed word
    let word = magnitude as Word;
    Some(if negative { word.wrapping_neg() } else { word })
}

/// Parse an immediate according to its type tag.
///
/// Float immediates accept either a raw `0x…` bit pattern or a numeric
/// literal which is bit-cast into the word; everything else parses as an
/// integer.
fn parse_typed_imm(ty: TypeTag, s: &str) -> Option<Word> {
    match ty {
        TypeTag::F32 => {
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                let bits = u64::from_str_radix(hex, 16).ok()?;
                Some((bits as u32) as Word)
            } else {
                s.parse::<f64>().ok().map(|v| f32_to_word(v as f32))
            }
        }
        TypeTag::F64 => {
            if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
                let bits = u64::from_str_radix(hex, 16).ok()?;
                Some(bits as Word)
            } else {
                s.parse::<f64>().ok().map(f64_to_word)
            }
        }
        _ => parse_int(s),
    }
}
