//! The RRVM virtual machine.
//!
//! The VM executes bytecode produced by the parser. It maintains:
//! - A value stack of typed words
//! - A typed linear tape with a tape pointer and a push-down pointer history
//! - A call stack of (return IP, frame pointer) entries
//! - A block stack for structured control flow
//! - A function table mapping indices to entry IPs
//!
//! The dispatcher ([`run`]) is purely structural: it decodes opcodes, reads
//! inline immediates and calls one [`Backend`] hook per opcode. All
//! semantics live in the hooks, which is what lets the TAC lowering reuse
//! the same dispatcher as the interpreter.

pub mod bytecode;

use smallvec::SmallVec;
use thiserror::Error;

use crate::core::{TypeTag, Word};
use bytecode::Opcode;

/// Maximum depth of the value stack.
pub const STACK_SIZE: usize = 1024;
/// Number of tape cells.
pub const TAPE_SIZE: usize = 4096;
/// Maximum call depth.
pub const CALL_STACK_SIZE: usize = 256;
/// Maximum depth of the structured-control block stack.
pub const BLOCK_STACK_SIZE: usize = 256;
/// Maximum depth of the pointer history.
pub const PTR_STACK_SIZE: usize = 256;
/// Number of function table slots.
pub const FUNC_MAX: usize = 256;

/// A machine word together with its type tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Value {
    pub word: Word,
    pub ty: TypeTag,
}

impl Value {
    pub fn new(word: Word, ty: TypeTag) -> Self {
        Self { word, ty }
    }
}

/// Call stack entry.
#[derive(Clone, Copy, Debug)]
pub struct Frame {
    /// IP to resume at after `return`.
    pub return_ip: usize,
    /// Frame pointer of the caller.
    pub old_fp: usize,
}

/// Kind of an open structured-control construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockKind {
    If,
    Else,
    While,
    Function,
}

/// Block stack entry.
///
/// For `While` blocks, `ip` is the bytecode IP of the first instruction of
/// the condition-producing region (supplied by the parser via the `while`
/// immediate); `endblock` jumps back to it.
#[derive(Clone, Copy, Debug)]
pub struct BlockEntry {
    pub kind: BlockKind,
    pub ip: usize,
}

/// VM execution error.
///
/// These are the only recoverable runtime failures: malformed bytecode
/// reaching the dispatcher. Invariant violations inside backend hooks
/// (type mismatches, stack underflow, tape bounds) are programming errors
/// and fail fast instead.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("unknown opcode: {0}")]
    InvalidOpcode(Word),
    #[error("unexpected end of code")]
    UnexpectedEnd,
}

/// The virtual machine state.
#[derive(Debug)]
pub struct Vm {
    /// Bytecode, immutable after parsing.
    pub code: Vec<Word>,
    /// Instruction pointer.
    pub ip: usize,
    /// Value stack.
    pub stack: Vec<Value>,
    /// The typed tape.
    pub tape: Vec<Value>,
    /// Tape pointer.
    pub tp: usize,
    /// Pointer history for `deref`/`refer`.
    pub ptr_stack: SmallVec<[usize; 8]>,
    /// Call stack.
    pub call_stack: Vec<Frame>,
    /// Frame pointer: stack depth at entry of the current call.
    pub fp: usize,
    /// Block stack for structured control flow.
    pub block_stack: SmallVec<[BlockEntry; 8]>,
    /// Function index -> entry IP.
    pub functions: [usize; FUNC_MAX],
    /// High-water mark of defined function indices.
    pub functions_count: usize,
}

impl Vm {
    /// Create a VM owning the given bytecode.
    pub fn new(code: Vec<Word>) -> Self {
        Self {
            code,
            ip: 0,
            stack: Vec::new(),
            tape: vec![Value::default(); TAPE_SIZE],
            tp: 0,
            ptr_stack: SmallVec::new(),
            call_stack: Vec::new(),
            fp: 0,
            block_stack: SmallVec::new(),
            functions: [0; FUNC_MAX],
            functions_count: 0,
        }
    }

    /// Reset all execution state, keeping the bytecode.
    pub fn reset(&mut self) {
        self.ip = 0;
        self.stack.clear();
        self.tape.fill(Value::default());
        self.tp = 0;
        self.ptr_stack.clear();
        self.call_stack.clear();
        self.fp = 0;
        self.block_stack.clear();
        self.functions = [0; FUNC_MAX];
        self.functions_count = 0;
    }

    // --- Stack helpers ---

    pub fn push(&mut self, value: Value) {
        assert!(self.stack.len() < STACK_SIZE, "stack overflow");
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    /// Save a tape pointer onto the pointer history.
    pub fn push_tp(&mut self, tp: usize) {
        assert!(self.ptr_stack.len() < PTR_STACK_SIZE, "pointer history overflow");
        self.ptr_stack.push(tp);
    }

    /// Restore the most recently saved tape pointer.
    pub fn pop_tp(&mut self) -> usize {
        self.ptr_stack.pop().expect("pointer history underflow")
    }

    pub fn push_block(&mut self, entry: BlockEntry) {
        assert!(self.block_stack.len() < BLOCK_STACK_SIZE, "block stack overflow");
        self.block_stack.push(entry);
    }

    // --- Immediate reading ---

    fn imm(&mut self) -> Result<Word, VmError> {
        let word = *self.code.get(self.ip).ok_or(VmError::UnexpectedEnd)?;
        self.ip += 1;
        Ok(word)
    }
}

/// One hook per opcode.
///
/// Every opcode has a required method so a backend that misses one fails to
/// compile. The dispatcher advances `vm.ip` past the opcode and its
/// immediates *before* invoking the hook; a hook can therefore compute the
/// opcode's origin IP as `vm.ip - encoded_words`.
#[allow(unused_variables)]
pub trait Backend {
    /// Called once before execution starts.
    fn setup(&mut self, vm: &mut Vm) {}
    /// Called once after the dispatcher loop exits.
    fn finalize(&mut self, vm: &mut Vm) {}

    fn op_push(&mut self, vm: &mut Vm, ty: TypeTag, imm: Word);
    fn op_add(&mut self, vm: &mut Vm);
    fn op_sub(&mut self, vm: &mut Vm);
    fn op_mul(&mut self, vm: &mut Vm);
    fn op_div(&mut self, vm: &mut Vm);
    fn op_rem(&mut self, vm: &mut Vm);

    fn op_move(&mut self, vm: &mut Vm, imm: Word);
    fn op_load(&mut self, vm: &mut Vm);
    fn op_store(&mut self, vm: &mut Vm);
    fn op_print(&mut self, vm: &mut Vm);
    fn op_printchar(&mut self, vm: &mut Vm);

    fn op_deref(&mut self, vm: &mut Vm);
    fn op_refer(&mut self, vm: &mut Vm);
    fn op_where(&mut self, vm: &mut Vm);
    fn op_offset(&mut self, vm: &mut Vm, imm: Word);
    fn op_index(&mut self, vm: &mut Vm);
    fn op_set(&mut self, vm: &mut Vm, ty: TypeTag, imm: Word);

    fn op_function(&mut self, vm: &mut Vm, index: Word);
    fn op_call(&mut self, vm: &mut Vm, index: Word);
    fn op_return(&mut self, vm: &mut Vm);
    fn op_while(&mut self, vm: &mut Vm, cond_ip: Word);
    fn op_if(&mut self, vm: &mut Vm);
    fn op_else(&mut self, vm: &mut Vm);
    fn op_endblock(&mut self, vm: &mut Vm);

    fn op_orassign(&mut self, vm: &mut Vm);
    fn op_andassign(&mut self, vm: &mut Vm);
    fn op_not(&mut self, vm: &mut Vm);
    fn op_bitand(&mut self, vm: &mut Vm);
    fn op_bitor(&mut self, vm: &mut Vm);
    fn op_bitxor(&mut self, vm: &mut Vm);
    fn op_lsh(&mut self, vm: &mut Vm);
    fn op_lrsh(&mut self, vm: &mut Vm);
    fn op_arsh(&mut self, vm: &mut Vm);
    fn op_gez(&mut self, vm: &mut Vm);
}

/// Run the dispatcher until `halt` or end of code.
///
/// The dispatcher contains no semantics beyond decoding: it reads the
/// opcode, reads its immediates, advances `ip` past the full encoding and
/// calls the matching hook. `nop` does nothing and `halt` exits the loop.
pub fn run<B: Backend>(vm: &mut Vm, backend: &mut B) -> Result<(), VmError> {
    backend.setup(vm);
    vm.reset();

    while vm.ip < vm.code.len() {
        let word = vm.code[vm.ip];
        let op = Opcode::from_word(word).ok_or(VmError::InvalidOpcode(word))?;
        vm.ip += 1;

        match op {
            Opcode::Nop => {}
            Opcode::Halt => break,

            Opcode::Push => {
                let ty = TypeTag::from_word(vm.imm()?).unwrap_or_default();
                let imm = vm.imm()?;
                backend.op_push(vm, ty, imm);
            }
            Opcode::Set => {
                let ty = TypeTag::from_word(vm.imm()?).unwrap_or_default();
                let imm = vm.imm()?;
                backend.op_set(vm, ty, imm);
            }

            Opcode::Move => {
                let imm = vm.imm()?;
                backend.op_move(vm, imm);
            }
            Opcode::Offset => {
                let imm = vm.imm()?;
                backend.op_offset(vm, imm);
            }
            Opcode::Function => {
                let index = vm.imm()?;
                backend.op_function(vm, index);
            }
            Opcode::Call => {
                let index = vm.imm()?;
                backend.op_call(vm, index);
            }
            Opcode::While => {
                let cond_ip = vm.imm()?;
                backend.op_while(vm, cond_ip);
            }

            Opcode::Add => backend.op_add(vm),
            Opcode::Sub => backend.op_sub(vm),
            Opcode::Mul => backend.op_mul(vm),
            Opcode::Div => backend.op_div(vm),
            Opcode::Rem => backend.op_rem(vm),
            Opcode::Load => backend.op_load(vm),
            Opcode::Store => backend.op_store(vm),
            Opcode::Print => backend.op_print(vm),
            Opcode::PrintChar => backend.op_printchar(vm),
            Opcode::Deref => backend.op_deref(vm),
            Opcode::Refer => backend.op_refer(vm),
            Opcode::Where => backend.op_where(vm),
            Opcode::Index => backend.op_index(vm),
            Opcode::Return => backend.op_return(vm),
            Opcode::If => backend.op_if(vm),
            Opcode::Else => backend.op_else(vm),
            Opcode::Endblock => backend.op_endblock(vm),
            Opcode::OrAssign => backend.op_orassign(vm),
            Opcode::AndAssign => backend.op_andassign(vm),
            Opcode::Not => backend.op_not(vm),
            Opcode::BitAnd => backend.op_bitand(vm),
            Opcode::BitOr => backend.op_bitor(vm),
            Opcode::BitXor => backend.op_bitxor(vm),
            Opcode::Lsh => backend.op_lsh(vm),
            Opcode::Lrsh => backend.op_lrsh(vm),
            Opcode::Arsh => backend.op_arsh(vm),
            Opcode::Gez => backend.op_gez(vm),
        }
    }

    backend.finalize(vm);
    Ok(())
}

// ============================================================================
// Forward scanners
// ============================================================================

/// Scan forward from `start` to just past the `endblock` matching an
/// already-consumed block opener.
///
/// `if`, `while` and `function` open nested blocks; `else` does not affect
/// nesting. Returns `code.len()` when no matching `endblock` exists, which
/// ends execution.
pub fn find_block_end(code: &[Word], start: usize) -> usize {
    let mut depth = 1usize;
    let mut ip = start;

    while ip < code.len() {
        let Some(op) = Opcode::from_word(code[ip]) else {
            return code.len();
        };
        ip += op.encoded_words();

        match op {
            Opcode::If | Opcode::While | Opcode::Function => depth += 1,
            Opcode::Endblock => {
                depth -= 1;
                if depth == 0 {
                    return ip;
                }
            }
            _ => {}
        }
    }

    code.len()
}

/// Scan the body of an `if` whose opcode was already consumed.
///
/// Returns `(else_pos, end_pos)`: the IP just past the matching `else` at
/// this nesting level (if any) and the IP just past the matching
/// `endblock`. Either defaults to `code.len()` when missing.
pub fn find_if_branch(code: &[Word], start: usize) -> (Option<usize>, usize) {
    let mut depth = 1usize;
    let mut ip = start;
    let mut else_pos = None;

    while ip < code.len() {
        let Some(op) = Opcode::from_word(code[ip]) else {
            return (else_pos, code.len());
        };
        ip += op.encoded_words();

        match op {
            Opcode::If | Opcode::While | Opcode::Function => depth += 1,
            Opcode::Else if depth == 1 => else_pos = Some(ip),
            Opcode::Endblock => {
                depth -= 1;
                if depth == 0 {
                    return (else_pos, ip);
                }
            }
            _ => {}
        }
    }

    (else_pos, code.len())
}
