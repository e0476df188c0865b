//! TAC lowering backend.
//!
//! Re-runs the program's structure through the same dispatcher as the
//! interpreter, but instead of computing values it emits three-address,
//! SSA-style instructions. The VM's operand stack is shadowed by a stack of
//! temp ids: each slot identifies which temp holds the corresponding value.
//!
//! # Retroactive label insertion
//!
//! When `while` executes, the instructions computing the loop condition
//! have already been emitted; the `while` opcode only carries the bytecode
//! IP of the first condition instruction. Every hook therefore records a
//! VM-IP → TAC-index entry at emission time. On `while`, the condition IP
//! is looked up in that map and a fresh `label` instruction is spliced into
//! the TAC stream at the mapped index; all later map entries pointing at or
//! past the insertion index shift by one. This is what makes structured
//! loops in zero-address bytecode translatable to labelled SSA in a single
//! pass.

pub mod dump;

use std::fmt;

use smallvec::SmallVec;

use crate::core::{TypeTag, Word};
use crate::vm::bytecode::Opcode;
use crate::vm::{Backend, FUNC_MAX, Vm};

/// Enable verbose lowering diagnostics on stderr.
const TAC_DEBUG: bool = false;

/// An SSA temp, assigned exactly once.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Temp(pub u32);

impl fmt::Display for Temp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// A position in the TAC stream, the target of `jmp`/`jz`/`call`.
///
/// Label 0 is reserved for the implicit entry block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "l{}", self.0)
    }
}

/// Binary TAC operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    BitAnd,
    BitOr,
    BitXor,
    Lsh,
    Lrsh,
    Arsh,
    /// Logical or, produces 0/1.
    Or,
    /// Logical and, produces 0/1.
    And,
}

impl BinOp {
    pub fn name(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::Rem => "rem",
            BinOp::BitAnd => "bitand",
            BinOp::BitOr => "bitor",
            BinOp::BitXor => "bitxor",
            BinOp::Lsh => "lsh",
            BinOp::Lrsh => "lrsh",
            BinOp::Arsh => "arsh",
            BinOp::Or => "or",
            BinOp::And => "and",
        }
    }
}

/// A single three-address instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TacInstr {
    /// `dst <- imm` with an explicit type.
    Const { dst: Temp, ty: TypeTag, imm: Word },
    /// `dst <- lhs op rhs`; `ty` is inherited from the left operand.
    Bin { op: BinOp, dst: Temp, ty: TypeTag, lhs: Temp, rhs: Temp },
    /// `dst <- !src` (boolean negation).
    Not { dst: Temp, src: Temp },
    /// `dst <- src >= 0`.
    Gez { dst: Temp, src: Temp },
    /// Tape pointer adjustment by a constant.
    Move { imm: Word },
    /// `dst <- tape cell`.
    Load { dst: Temp },
    /// tape cell `<- src`.
    Store { src: Temp },
    Print { src: Temp },
    PrintChar { src: Temp },
    /// Pointer chase: `dst <- *ptr`.
    Deref { dst: Temp, ptr: Temp },
    /// Pointer unwind: `dst <- restored pointer`.
    Refer { dst: Temp, ptr: Temp },
    /// `dst <- current tape pointer`.
    Where { dst: Temp },
    /// `dst <- ptr + imm`.
    Offset { dst: Temp, ptr: Temp, imm: Word },
    /// `dst <- ptr[idx]`.
    Index { dst: Temp, ptr: Temp, idx: Temp },
    /// `*ptr <- val`.
    Set { ptr: Temp, val: Temp },
    Label(Label),
    Jmp(Label),
    /// Jump to `target` when `cond` is zero.
    Jz { cond: Temp, target: Label },
    Call { dst: Option<Temp>, target: Label },
    Ret,
}

impl TacInstr {
    /// The temp this instruction assigns, if any.
    pub fn dst(&self) -> Option<Temp> {
        match *self {
            TacInstr::Const { dst, .. }
            | TacInstr::Bin { dst, .. }
            | TacInstr::Not { dst, .. }
            | TacInstr::Gez { dst, .. }
            | TacInstr::Load { dst }
            | TacInstr::Deref { dst, .. }
            | TacInstr::Refer { dst, .. }
            | TacInstr::Where { dst }
            | TacInstr::Offset { dst, .. }
            | TacInstr::Index { dst, .. } => Some(dst),
            TacInstr::Call { dst, .. } => dst,
            _ => None,
        }
    }
}

/// A lowered TAC program.
#[derive(Clone, Debug, Default)]
pub struct TacProgram {
    instrs: Vec<TacInstr>,
}

impl TacProgram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.instrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instrs.is_empty()
    }

    pub fn instrs(&self) -> &[TacInstr] {
        &self.instrs
    }

    fn push(&mut self, instr: TacInstr) {
        self.instrs.push(instr);
    }

    /// Splice an instruction into the middle of the stream, shifting the
    /// tail right by one.
    fn insert(&mut self, index: usize, instr: TacInstr) {
        let index = index.min(self.instrs.len());
        self.instrs.insert(index, instr);
    }
}

/// Open structured-control construct during lowering.
#[derive(Clone, Copy, Debug)]
enum TacBlock {
    If { else_label: Label, end_label: Label },
    Else { end_label: Label },
    While { cond_label: Label, end_label: Label },
    Function,
}

/// The lowering backend.
pub struct TacLower {
    prog: TacProgram,
    /// Shadow operand stack of temp ids.
    stack: Vec<Temp>,
    next_temp: u32,
    /// Virtual tape pointer, validated against the same bounds as the
    /// interpreter's.
    vtp: usize,
    /// Next label id; 0 is the implicit entry label.
    next_label: u32,
    blocks: SmallVec<[TacBlock; 8]>,
    /// Function index -> label, shared between `function` and `call`.
    func_labels: [Option<Label>; FUNC_MAX],
    /// VM opcode-origin IP -> TAC instruction index.
    ip_to_index: Vec<Option<usize>>,
    /// VM opcode-origin IP -> inserted condition label.
    ip_to_label: Vec<Option<Label>>,
    /// Inferred type per temp, indexed by temp id.
    temp_types: Vec<TypeTag>,
}

impl TacLower {
    pub fn new() -> Self {
        Self {
            prog: TacProgram::new(),
            stack: Vec::new(),
            next_temp: 0,
            vtp: 0,
            next_label: 1,
            blocks: SmallVec::new(),
            func_labels: [None; FUNC_MAX],
            ip_to_index: Vec::new(),
            ip_to_label: Vec::new(),
            temp_types: Vec::new(),
        }
    }

    /// The lowered program.
    pub fn program(&self) -> &TacProgram {
        &self.prog
    }

    pub fn into_program(self) -> TacProgram {
        self.prog
    }

    /// The inferred type of a temp.
    pub fn temp_type(&self, temp: Temp) -> TypeTag {
        self.temp_types
            .get(temp.0 as usize)
            .copied()
            .unwrap_or_default()
    }

    /// The condition label inserted for a VM IP, if any.
    pub fn label_for_ip(&self, vm_ip: usize) -> Option<Label> {
        self.ip_to_label.get(vm_ip).copied().flatten()
    }

    // --- Allocation ---

    fn alloc_temp(&mut self, ty: TypeTag) -> Temp {
        let temp = Temp(self.next_temp);
        self.next_temp += 1;
        self.temp_types.push(ty);
        temp
    }

    fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    fn pop_temp(&mut self, what: &str) -> Temp {
        self.stack.pop().unwrap_or_else(|| panic!("{what}"))
    }

    // --- VM-IP bookkeeping ---

    /// Record that the opcode ending at `vm.ip` lowers to the instruction
    /// about to be emitted. The origin IP is `vm.ip` minus the encoded
    /// length (the dispatcher advances past the encoding before the hook).
    fn record(&mut self, vm: &Vm, encoded_words: usize) {
        let origin = vm.ip - encoded_words;
        if let Some(slot) = self.ip_to_index.get_mut(origin) {
            *slot = Some(self.prog.len());
        }
    }

    /// Splice `label` in at TAC index `idx`, reattaching VM-IP mappings.
    fn insert_label_at(&mut self, idx: usize, label: Label) {
        if TAC_DEBUG {
            eprintln!("[tac] inserting {label} at tac index {idx} (len {})", self.prog.len());
        }
        // the vm ips that lowered to `idx` now resolve to this label
        for (vm_ip, mapped) in self.ip_to_index.iter().enumerate() {
            if *mapped == Some(idx) {
                self.ip_to_label[vm_ip] = Some(label);
            }
        }
        self.prog.insert(idx, TacInstr::Label(label));
        // everything at or past the insertion point shifted right by one
        for mapped in self.ip_to_index.iter_mut() {
            if let Some(i) = mapped
                && *i >= idx
            {
                *i += 1;
            }
        }
    }

    // --- Shared emit shapes ---

    fn lower_binary(&mut self, vm: &Vm, op: BinOp) {
        self.record(vm, 1);
        let rhs = self.pop_temp("binary op: missing right operand temp");
        let lhs = self.pop_temp("binary op: missing left operand temp");
        let ty = self.temp_type(lhs);
        let dst = self.alloc_temp(ty);
        self.prog.push(TacInstr::Bin { op, dst, ty, lhs, rhs });
        self.stack.push(dst);
    }

    fn lower_unary(&mut self, vm: &Vm, gez: bool) {
        self.record(vm, 1);
        let src = self.pop_temp("unary op: missing operand temp");
        let dst = self.alloc_temp(TypeTag::Unknown);
        self.prog.push(if gez {
            TacInstr::Gez { dst, src }
        } else {
            TacInstr::Not { dst, src }
        });
        self.stack.push(dst);
    }
}

impl Default for TacLower {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for TacLower {
    fn setup(&mut self, vm: &mut Vm) {
        self.prog = TacProgram::new();
        self.stack.clear();
        self.next_temp = 0;
        self.vtp = 0;
        self.next_label = 1;
        self.blocks.clear();
        self.func_labels = [None; FUNC_MAX];
        self.ip_to_index = vec![None; vm.code.len()];
        self.ip_to_label = vec![None; vm.code.len()];
        self.temp_types.clear();
    }

    fn op_push(&mut self, vm: &mut Vm, ty: TypeTag, imm: Word) {
        self.record(vm, Opcode::Push.encoded_words());
        let dst = self.alloc_temp(ty);
        self.prog.push(TacInstr::Const { dst, ty, imm });
        self.stack.push(dst);
    }

    fn op_add(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::Add);
    }

    fn op_sub(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::Sub);
    }

    fn op_mul(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::Mul);
    }

    fn op_div(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::Div);
    }

    fn op_rem(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::Rem);
    }

    fn op_move(&mut self, vm: &mut Vm, imm: Word) {
        self.record(vm, Opcode::Move.encoded_words());
        self.prog.push(TacInstr::Move { imm });
        // keep the virtual tape pointer honest
        if imm < 0 {
            let step = imm.unsigned_abs() as usize;
            assert!(self.vtp >= step, "lowering: tape pointer underflow");
            self.vtp -= step;
        } else {
            self.vtp += imm as usize;
            assert!(self.vtp < crate::vm::TAPE_SIZE, "lowering: tape pointer overflow");
        }
    }

    fn op_load(&mut self, vm: &mut Vm) {
        self.record(vm, 1);
        let dst = self.alloc_temp(TypeTag::Unknown);
        self.prog.push(TacInstr::Load { dst });
        self.stack.push(dst);
    }

    fn op_store(&mut self, vm: &mut Vm) {
        self.record(vm, 1);
        let src = self.pop_temp("store: missing value temp");
        self.prog.push(TacInstr::Store { src });
    }

    fn op_print(&mut self, vm: &mut Vm) {
        self.record(vm, 1);
        let src = self.pop_temp("print: missing value temp");
        self.prog.push(TacInstr::Print { src });
    }

    fn op_printchar(&mut self, vm: &mut Vm) {
        self.record(vm, 1);
        let src = self.pop_temp("printchar: missing value temp");
        self.prog.push(TacInstr::PrintChar { src });
    }

    fn op_deref(&mut self, vm: &mut Vm) {
        self.record(vm, 1);
        let ptr = self.pop_temp("deref: missing pointer temp");
        let dst = self.alloc_temp(TypeTag::Unknown);
        self.prog.push(TacInstr::Deref { dst, ptr });
        self.stack.push(dst);
    }

    fn op_refer(&mut self, vm: &mut Vm) {
        self.record(vm, 1);
        let ptr = self.pop_temp("refer: missing value temp");
        let dst = self.alloc_temp(TypeTag::Unknown);
        self.prog.push(TacInstr::Refer { dst, ptr });
        self.stack.push(dst);
    }

    fn op_where(&mut self, vm: &mut Vm) {
        self.record(vm, 1);
        let dst = self.alloc_temp(TypeTag::Unknown);
        self.prog.push(TacInstr::Where { dst });
        self.stack.push(dst);
    }

    fn op_offset(&mut self, vm: &mut Vm, imm: Word) {
        self.record(vm, Opcode::Offset.encoded_words());
        let ptr = self.pop_temp("offset: missing pointer temp");
        let dst = self.alloc_temp(TypeTag::Unknown);
        self.prog.push(TacInstr::Offset { dst, ptr, imm });
        self.stack.push(dst);
    }

    fn op_index(&mut self, vm: &mut Vm) {
        self.record(vm, 1);
        let idx = self.pop_temp("index: missing index temp");
        let ptr = self.pop_temp("index: missing pointer temp");
        let dst = self.alloc_temp(TypeTag::Unknown);
        self.prog.push(TacInstr::Index { dst, ptr, idx });
        self.stack.push(dst);
    }

    fn op_set(&mut self, vm: &mut Vm, ty: TypeTag, imm: Word) {
        self.record(vm, Opcode::Set.encoded_words());
        let val = self.alloc_temp(ty);
        self.prog.push(TacInstr::Const { dst: val, ty, imm });
        // Peek the pointer temp without popping: the pointer is not
        // consumed by a store. Materialize the current pointer when the
        // shadow stack is empty.
        let ptr = match self.stack.last() {
            Some(&ptr) => ptr,
            None => {
                let ptr = self.alloc_temp(TypeTag::Ptr);
                self.prog.push(TacInstr::Where { dst: ptr });
                self.stack.push(ptr);
                ptr
            }
        };
        self.prog.push(TacInstr::Set { ptr, val });
    }

    fn op_function(&mut self, vm: &mut Vm, index: Word) {
        self.record(vm, Opcode::Function.encoded_words());
        let idx = index as usize;
        assert!(idx < FUNC_MAX, "function index out of range");
        // a forward call may already have allocated this function's label
        let label = match self.func_labels[idx] {
            Some(label) => label,
            None => {
                let label = self.new_label();
                self.func_labels[idx] = Some(label);
                label
            }
        };
        self.prog.push(TacInstr::Label(label));
        self.blocks.push(TacBlock::Function);
    }

    fn op_call(&mut self, vm: &mut Vm, index: Word) {
        self.record(vm, Opcode::Call.encoded_words());
        let idx = index as usize;
        assert!(idx < FUNC_MAX, "function index out of range");
        let target = match self.func_labels[idx] {
            Some(label) => label,
            None => {
                // forward call: allocate a placeholder the definition reuses
                let label = self.new_label();
                self.func_labels[idx] = Some(label);
                label
            }
        };
        let dst = self.alloc_temp(TypeTag::Unknown);
        self.prog.push(TacInstr::Call { dst: Some(dst), target });
        self.stack.push(dst);
    }

    fn op_return(&mut self, vm: &mut Vm) {
        self.record(vm, 1);
        self.prog.push(TacInstr::Ret);
    }

    fn op_while(&mut self, vm: &mut Vm, cond_ip: Word) {
        self.record(vm, Opcode::While.encoded_words());
        let cond = self.pop_temp("while: missing condition temp");

        // splice a label in front of the already-emitted condition code
        let cond_vm_ip = cond_ip as usize;
        let mapped = self.ip_to_index.get(cond_vm_ip).copied().flatten();
        let cond_label = match mapped {
            Some(idx) => {
                let label = self.new_label();
                self.insert_label_at(idx, label);
                label
            }
            None => {
                debug_assert!(false, "while: condition ip {cond_vm_ip} was never lowered");
                self.new_label()
            }
        };
        // downstream passes look the condition label up by VM IP
        if let Some(slot) = self.ip_to_label.get_mut(cond_vm_ip) {
            *slot = Some(cond_label);
        }

        let end_label = self.new_label();
        self.prog.push(TacInstr::Jz { cond, target: end_label });
        let body_label = self.new_label();
        self.prog.push(TacInstr::Label(body_label));
        self.blocks.push(TacBlock::While { cond_label, end_label });
    }

    fn op_if(&mut self, vm: &mut Vm) {
        self.record(vm, 1);
        let cond = self.pop_temp("if: missing condition temp");
        let else_label = self.new_label();
        let end_label = self.new_label();
        self.prog.push(TacInstr::Jz { cond, target: else_label });
        self.blocks.push(TacBlock::If { else_label, end_label });
    }

    fn op_else(&mut self, vm: &mut Vm) {
        self.record(vm, 1);
        let block = self.blocks.pop().expect("else without open block");
        let TacBlock::If { else_label, end_label } = block else {
            panic!("else without matching if");
        };
        self.prog.push(TacInstr::Jmp(end_label));
        self.prog.push(TacInstr::Label(else_label));
        self.blocks.push(TacBlock::Else { end_label });
    }

    fn op_endblock(&mut self, vm: &mut Vm) {
        self.record(vm, 1);
        let block = self.blocks.pop().expect("endblock without open block");
        match block {
            TacBlock::While { cond_label, end_label } => {
                self.prog.push(TacInstr::Jmp(cond_label));
                self.prog.push(TacInstr::Label(end_label));
            }
            TacBlock::If { end_label, .. } | TacBlock::Else { end_label } => {
                self.prog.push(TacInstr::Label(end_label));
            }
            TacBlock::Function => {}
        }
    }

    fn op_orassign(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::Or);
    }

    fn op_andassign(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::And);
    }

    fn op_not(&mut self, vm: &mut Vm) {
        self.lower_unary(vm, false);
    }

    fn op_bitand(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::BitAnd);
    }

    fn op_bitor(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::BitOr);
    }

    fn op_bitxor(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::BitXor);
    }

    fn op_lsh(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::Lsh);
    }

    fn op_lrsh(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::Lrsh);
    }

    fn op_arsh(&mut self, vm: &mut Vm) {
        self.lower_binary(vm, BinOp::Arsh);
    }

    fn op_gez(&mut self, vm: &mut Vm) {
        self.lower_unary(vm, true);
    }
}
