//! RRVM: a zero-address tape+stack virtual machine that can be re-lifted
//! into three-address code.
//!
//! The pipeline is:
//!
//! ```text
//! .rr source → lexer → parser → bytecode → dispatcher ─┬→ interpreter
//!                                                      └→ TAC → serializer
//! ```
//!
//! The dispatcher is the single choke point: it decodes opcodes and
//! immediates and calls one [`vm::Backend`] hook per opcode. The
//! interpreter evaluates the hooks against VM state; the TAC backend
//! observes the *same* execution sequence but emits SSA-style
//! three-address instructions instead, shadowing the operand stack with
//! temp ids. Lowering is not a separate pass over bytecode — it is a
//! second interpretation that happens to produce IR.
//!
//! # Example
//!
//! ```
//! let output = rrvm::run_source("push i64 3\npush i64 4\nadd\nprint\nhalt\n").unwrap();
//! assert_eq!(output, "35\n");
//! ```

pub mod core;
pub mod interp;
pub mod parse;
pub mod tac;
pub mod vm;

pub use crate::core::{TypeTag, Word};
pub use interp::Interp;
pub use parse::ParseError;
pub use tac::{TacLower, TacProgram};
pub use vm::{Backend, Value, Vm, VmError, run};

/// Parse and interpret `.rr` source, returning everything it printed.
pub fn run_source(source: &str) -> Result<String, String> {
    let mut vm = parse::parse(source).map_err(|e| format!("parse error: {e}"))?;
    let mut interp = Interp::with_output(Vec::new());
    run(&mut vm, &mut interp).map_err(|e| format!("runtime error: {e}"))?;
    String::from_utf8(interp.into_output()).map_err(|e| format!("output was not UTF-8: {e}"))
}

/// Parse and lower `.rr` source to a TAC program.
pub fn lower_source(source: &str) -> Result<TacProgram, String> {
    let mut vm = parse::parse(source).map_err(|e| format!("parse error: {e}"))?;
    let mut tac = TacLower::new();
    run(&mut vm, &mut tac).map_err(|e| format!("lowering error: {e}"))?;
    Ok(tac.into_program())
}
