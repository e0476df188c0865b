//! TAC serialization.
//!
//! Writes the lowered program as block-structured labelled clauses, the
//! exact surface form the downstream term-rewriting passes consume:
//!
//! ```text
//! l0 :-
//!   const(t0, i64, 3),
//!   const(t1, i64, 4),
//!   add(t2, i64, t0, t1),
//!   print(t2).
//! ```
//!
//! A clause begins at every `label` instruction; instructions before the
//! first label (or following a `ret`) form an implicit `l0` clause. A
//! `ret` terminates its clause early. An empty labelled block emits the
//! single goal `true`.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::core::{TypeTag, f32_from_word, f64_from_word};
use crate::tac::{BinOp, TacInstr, TacProgram};

/// Directory the raw TAC dump is written to.
pub const RAW_DUMP_DIR: &str = "opt/tmp/raw";

/// Serialize a program to a writer.
pub fn write_program<W: Write>(out: &mut W, prog: &TacProgram) -> io::Result<()> {
    let instrs = prog.instrs();
    let mut i = 0;
    let mut first_clause = true;

    while i < instrs.len() {
        if !first_clause {
            writeln!(out)?;
        }
        first_clause = false;

        // clause header: an explicit label, or the implicit entry block
        match &instrs[i] {
            TacInstr::Label(label) => {
                writeln!(out, "{label} :-")?;
                i += 1;
            }
            _ => writeln!(out, "l0 :-")?,
        }

        // a label with no body (next is a label, or end of stream)
        if i >= instrs.len() || matches!(instrs[i], TacInstr::Label(_)) {
            writeln!(out, "  true.")?;
            continue;
        }

        // goals until the next label, end of stream, or a ret
        loop {
            write!(out, "  ")?;
            write_goal(out, &instrs[i])?;
            let was_ret = matches!(instrs[i], TacInstr::Ret);
            i += 1;
            if was_ret || i >= instrs.len() || matches!(instrs[i], TacInstr::Label(_)) {
                writeln!(out, ".")?;
                break;
            }
            writeln!(out, ",")?;
        }
    }

    Ok(())
}

/// Serialize a program to a string.
pub fn program_to_string(prog: &TacProgram) -> String {
    let mut buf = Vec::new();
    write_program(&mut buf, prog).expect("write to Vec failed");
    String::from_utf8(buf).expect("serialized TAC is not UTF-8")
}

/// Write the raw TAC dump for a source file.
///
/// The output lands at `opt/tmp/raw/<basename>.pl`, where the basename is
/// the source file name without directories or extension; `parsed` is used
/// when no usable name exists (empty path or stdin).
pub fn dump_to_file(prog: &TacProgram, source_path: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(RAW_DUMP_DIR)?;

    let stem = Path::new(source_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty() && *s != "-")
        .unwrap_or("parsed");

    let path = Path::new(RAW_DUMP_DIR).join(format!("{stem}.pl"));
    let mut file = fs::File::create(&path)?;
    write_program(&mut file, prog)?;
    Ok(path)
}

/// Write one goal, without trailing separator.
fn write_goal<W: Write>(out: &mut W, instr: &TacInstr) -> io::Result<()> {
    match instr {
        TacInstr::Const { dst, ty, imm } => match ty {
            // float constants as bit patterns, with the decimal value as a
            // comment for readability
            TypeTag::F32 => {
                let bits = (*imm as u64 & 0xFFFF_FFFF) as u32;
                write!(out, "const({dst}, f32, 0x{bits:08x} /* {:.6} */)", f32_from_word(*imm))
            }
            TypeTag::F64 => {
                let bits = *imm as u64;
                write!(out, "const({dst}, f64, 0x{bits:016x} /* {:.6} */)", f64_from_word(*imm))
            }
            _ => write!(out, "const({dst}, {ty}, {imm})"),
        },
        TacInstr::Bin { op, dst, ty, lhs, rhs } => match op {
            // logical ops are always boolean-typed in the surface form
            BinOp::Or | BinOp::And => write!(out, "{}({dst}, bool, {lhs}, {rhs})", op.name()),
            _ => write!(out, "{}({dst}, {ty}, {lhs}, {rhs})", op.name()),
        },
        TacInstr::Not { dst, src } => write!(out, "not({dst}, bool, {src})"),
        TacInstr::Gez { dst, src } => write!(out, "gez({dst}, bool, {src})"),
        TacInstr::Move { imm } => write!(out, "move({imm})"),
        TacInstr::Load { dst } => write!(out, "load({dst})"),
        TacInstr::Store { src } => write!(out, "store({src})"),
        TacInstr::Print { src } => write!(out, "print({src})"),
        TacInstr::PrintChar { src } => write!(out, "printchar({src})"),
        TacInstr::Deref { dst, ptr } => write!(out, "deref({dst}, {ptr})"),
        TacInstr::Refer { dst, ptr } => write!(out, "refer({dst}, {ptr})"),
        TacInstr::Where { dst } => write!(out, "where({dst})"),
        TacInstr::Offset { dst, ptr, imm } => write!(out, "offset({dst}, {ptr}, {imm})"),
        TacInstr::Index { dst, ptr, idx } => write!(out, "index({dst}, {ptr}, {idx})"),
        TacInstr::Set { ptr, val } => write!(out, "set({ptr}, {val})"),
        TacInstr::Jmp(label) => write!(out, "jmp({label})"),
        TacInstr::Jz { cond, target } => write!(out, "jz({cond}, {target})"),
        TacInstr::Call { dst: Some(dst), target } => write!(out, "call({target}, {dst})"),
        TacInstr::Call { dst: None, target } => write!(out, "call({target})"),
        TacInstr::Ret => write!(out, "ret"),
        // labels are clause boundaries and handled by the caller
        TacInstr::Label(_) => write!(out, "true"),
    }
}
