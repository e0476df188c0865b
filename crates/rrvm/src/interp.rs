//! The interpreting backend.
//!
//! Evaluates every opcode directly against VM state, maintaining strict
//! type discipline: binary operations require both operand tags to be
//! identical, and division or remainder by zero is a fault. Invariant
//! violations panic (fail fast); they are programming errors, not user
//! errors, and cannot be reached from well-formed programs.
//!
//! The interpreter is generic over its output sink so tests can capture
//! what `print`/`printchar` produce.

use std::io::{self, Write};

use crate::core::{TypeTag, Word, f32_from_word, f64_from_word};
use crate::vm::{Backend, BlockEntry, BlockKind, FUNC_MAX, Frame, TAPE_SIZE, Value, Vm};
use crate::vm::{CALL_STACK_SIZE, find_block_end, find_if_branch};

/// The evaluating backend.
pub struct Interp<W: Write = io::Stdout> {
    out: W,
}

impl Interp<io::Stdout> {
    /// Interpreter printing to standard output.
    pub fn new() -> Self {
        Self { out: io::stdout() }
    }
}

impl Default for Interp<io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> Interp<W> {
    /// Interpreter printing to an arbitrary sink.
    pub fn with_output(out: W) -> Self {
        Self { out }
    }

    /// Consume the interpreter and return its sink.
    pub fn into_output(self) -> W {
        self.out
    }

    /// Pop two operands, check their types match and push `f(next, top)`.
    ///
    /// The result carries the common operand type.
    fn binary(&mut self, vm: &mut Vm, f: impl FnOnce(Word, Word) -> Word) {
        let top = vm.pop();
        let next = vm.pop();
        assert!(
            top.ty == next.ty,
            "binary op type mismatch: {} vs {}",
            next.ty,
            top.ty
        );
        vm.push(Value::new(f(next.word, top.word), top.ty));
    }

    /// Adjust the tape pointer by a signed amount, faulting on either bound.
    fn shift_tp(vm: &mut Vm, delta: Word) {
        if delta < 0 {
            let step = delta.unsigned_abs() as usize;
            assert!(vm.tp >= step, "tape pointer underflow");
            vm.tp -= step;
        } else {
            vm.tp += delta as usize;
            assert!(vm.tp < TAPE_SIZE, "tape pointer overflow");
        }
    }
}

impl<W: Write> Backend for Interp<W> {
    fn op_push(&mut self, vm: &mut Vm, ty: TypeTag, imm: Word) {
        vm.push(Value::new(imm, ty));
    }

    fn op_add(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| a.wrapping_add(b));
    }

    fn op_sub(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| a.wrapping_sub(b));
    }

    fn op_mul(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| a.wrapping_mul(b));
    }

    fn op_div(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| {
            assert!(b != 0, "division by zero");
            a.wrapping_div(b)
        });
    }

    fn op_rem(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| {
            assert!(b != 0, "remainder by zero");
            a.wrapping_rem(b)
        });
    }

    fn op_move(&mut self, vm: &mut Vm, imm: Word) {
        Self::shift_tp(vm, imm);
    }

    fn op_load(&mut self, vm: &mut Vm) {
        let cell = vm.tape[vm.tp];
        vm.push(cell);
    }

    fn op_store(&mut self, vm: &mut Vm) {
        let value = vm.pop();
        vm.tape[vm.tp] = value;
    }

    fn op_print(&mut self, vm: &mut Vm) {
        let value = vm.pop();
        match value.ty {
            TypeTag::F32 => {
                writeln!(self.out, "{:.6}", f32_from_word(value.word))
            }
            TypeTag::F64 => {
                writeln!(self.out, "{:.6}", f64_from_word(value.word))
            }
            ty if ty.is_unsigned() => writeln!(self.out, "{}", value.word as u64),
            _ => writeln!(self.out, "{}", value.word),
        }
        .expect("print: write failed");
    }

    fn op_printchar(&mut self, vm: &mut Vm) {
        let value = vm.pop();
        self.out
            .write_all(&[value.word as u8])
            .expect("printchar: write failed");
    }

    fn op_deref(&mut self, vm: &mut Vm) {
        vm.push_tp(vm.tp);
        let target = vm.tape[vm.tp].word;
        assert!(
            target >= 0 && (target as usize) < TAPE_SIZE,
            "deref produced invalid tape index"
        );
        vm.tp = target as usize;
    }

    fn op_refer(&mut self, vm: &mut Vm) {
        vm.tp = vm.pop_tp();
    }

    fn op_where(&mut self, vm: &mut Vm) {
        vm.push(Value::new(vm.tp as Word, TypeTag::Ptr));
    }

    fn op_offset(&mut self, vm: &mut Vm, imm: Word) {
        Self::shift_tp(vm, imm);
    }

    fn op_index(&mut self, vm: &mut Vm) {
        let delta = vm.tape[vm.tp].word;
        Self::shift_tp(vm, delta);
    }

    fn op_set(&mut self, vm: &mut Vm, ty: TypeTag, imm: Word) {
        vm.tape[vm.tp] = Value::new(imm, ty);
    }

    fn op_function(&mut self, vm: &mut Vm, index: Word) {
        let idx = index as usize;
        assert!(idx < FUNC_MAX, "function index out of range");
        // record the entry IP, then skip the body at top level
        vm.functions[idx] = vm.ip;
        if vm.functions_count <= idx {
            vm.functions_count = idx + 1;
        }
        vm.ip = find_block_end(&vm.code, vm.ip);
    }

    fn op_call(&mut self, vm: &mut Vm, index: Word) {
        let idx = index as usize;
        assert!(vm.call_stack.len() < CALL_STACK_SIZE, "call stack overflow");
        assert!(idx < vm.functions_count, "call to unknown function index");
        vm.call_stack.push(Frame {
            return_ip: vm.ip,
            old_fp: vm.fp,
        });
        vm.fp = vm.stack.len();
        vm.ip = vm.functions[idx];
    }

    fn op_return(&mut self, vm: &mut Vm) {
        assert!(!vm.call_stack.is_empty(), "return with empty call stack");
        // an empty frame returns 0
        let ret = if vm.stack.len() > vm.fp {
            vm.pop()
        } else {
            Value::default()
        };
        vm.stack.truncate(vm.fp);
        let frame = vm.call_stack.pop().expect("return with empty call stack");
        vm.fp = frame.old_fp;
        vm.ip = frame.return_ip;
        vm.push(ret);
    }

    fn op_while(&mut self, vm: &mut Vm, cond_ip: Word) {
        // the condition code has already run; its result is on the stack
        let cond = vm.pop();
        if cond.word == 0 {
            vm.ip = find_block_end(&vm.code, vm.ip);
        } else {
            vm.push_block(BlockEntry {
                kind: BlockKind::While,
                ip: cond_ip as usize,
            });
        }
    }

    fn op_if(&mut self, vm: &mut Vm) {
        let cond = vm.pop();
        if cond.word == 0 {
            let (else_pos, end_pos) = find_if_branch(&vm.code, vm.ip);
            match else_pos {
                Some(pos) => {
                    // execute the else branch; its endblock pops this marker
                    vm.ip = pos;
                    vm.push_block(BlockEntry {
                        kind: BlockKind::If,
                        ip: end_pos,
                    });
                }
                None => vm.ip = end_pos,
            }
        } else {
            vm.push_block(BlockEntry {
                kind: BlockKind::If,
                ip: vm.ip,
            });
        }
    }

    fn op_else(&mut self, vm: &mut Vm) {
        // reached after the then-branch: skip over the else branch
        vm.ip = find_block_end(&vm.code, vm.ip);
        if !vm.block_stack.is_empty() {
            vm.block_stack.pop();
        }
    }

    fn op_endblock(&mut self, vm: &mut Vm) {
        match vm.block_stack.last().copied() {
            Some(entry) if entry.kind == BlockKind::While => {
                // loop back to re-evaluate the condition
                vm.block_stack.pop();
                vm.ip = entry.ip;
            }
            Some(_) => {
                vm.block_stack.pop();
            }
            // a function body falling through its endblock (no marker)
            None => {}
        }
    }

    fn op_orassign(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| (a != 0 || b != 0) as Word);
    }

    fn op_andassign(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| (a != 0 && b != 0) as Word);
    }

    fn op_not(&mut self, vm: &mut Vm) {
        let value = vm.pop();
        vm.push(Value::new((value.word == 0) as Word, TypeTag::Bool));
    }

    fn op_bitand(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| a & b);
    }

    fn op_bitor(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| a | b);
    }

    fn op_bitxor(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| a ^ b);
    }

    fn op_lsh(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| a.wrapping_shl(b as u32));
    }

    fn op_lrsh(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| ((a as u64) >> (b as u64 & 63)) as Word);
    }

    fn op_arsh(&mut self, vm: &mut Vm) {
        self.binary(vm, |a, b| a.wrapping_shr(b as u32));
    }

    fn op_gez(&mut self, vm: &mut Vm) {
        let value = vm.pop();
        vm.push(Value::new((value.word >= 0) as Word, TypeTag::Bool));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::f32_to_word;
    use crate::vm::bytecode::{Opcode, emit0, emit1, emit2};
    use crate::vm::run;

    fn exec(build: impl FnOnce(&mut Vec<Word>)) -> String {
        let mut code = Vec::new();
        build(&mut code);
        let mut vm = Vm::new(code);
        let mut interp = Interp::with_output(Vec::new());
        run(&mut vm, &mut interp).unwrap();
        String::from_utf8(interp.into_output()).unwrap()
    }

    fn push_i64(code: &mut Vec<Word>, value: Word) {
        emit2(code, Opcode::Push, TypeTag::I64.as_word(), value);
    }

    #[test]
    fn arithmetic() {
        let out = exec(|c| {
            push_i64(c, 3);
            push_i64(c, 4);
            emit0(c, Opcode::Add);
            push_i64(c, 5);
            emit0(c, Opcode::Mul);
            emit0(c, Opcode::Print);
            emit0(c, Opcode::Halt);
        });
        assert_eq!(out, "35\n");
    }

    #[test]
    fn sub_div_rem_operand_order() {
        let out = exec(|c| {
            push_i64(c, 10);
            push_i64(c, 3);
            emit0(c, Opcode::Sub);
            emit0(c, Opcode::Print);
            push_i64(c, 10);
            push_i64(c, 3);
            emit0(c, Opcode::Div);
            emit0(c, Opcode::Print);
            push_i64(c, 10);
            push_i64(c, 3);
            emit0(c, Opcode::Rem);
            emit0(c, Opcode::Print);
        });
        assert_eq!(out, "7\n3\n1\n");
    }

    #[test]
    #[should_panic(expected = "type mismatch")]
    fn binary_type_mismatch_faults() {
        exec(|c| {
            emit2(c, Opcode::Push, TypeTag::I64.as_word(), 1);
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), 2);
            emit0(c, Opcode::Add);
        });
    }

    #[test]
    #[should_panic(expected = "division by zero")]
    fn div_by_zero_faults() {
        exec(|c| {
            push_i64(c, 1);
            push_i64(c, 0);
            emit0(c, Opcode::Div);
        });
    }

    #[test]
    fn print_respects_type_tags() {
        let out = exec(|c| {
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), -1);
            emit0(c, Opcode::Print);
            push_i64(c, -1);
            emit0(c, Opcode::Print);
            emit2(c, Opcode::Push, TypeTag::F32.as_word(), f32_to_word(1.5));
            emit0(c, Opcode::Print);
        });
        assert_eq!(out, "18446744073709551615\n-1\n1.500000\n");
    }

    #[test]
    fn printchar_writes_raw_byte() {
        let out = exec(|c| {
            emit2(c, Opcode::Push, TypeTag::U8.as_word(), b'A' as Word);
            emit0(c, Opcode::PrintChar);
        });
        assert_eq!(out, "A");
    }

    #[test]
    fn tape_store_load() {
        let out = exec(|c| {
            push_i64(c, 7);
            emit0(c, Opcode::Store);
            emit1(c, Opcode::Move, 1);
            push_i64(c, 35);
            emit0(c, Opcode::Store);
            emit1(c, Opcode::Move, -1);
            emit0(c, Opcode::Load);
            emit1(c, Opcode::Move, 1);
            emit0(c, Opcode::Load);
            emit0(c, Opcode::Add);
            emit0(c, Opcode::Print);
        });
        assert_eq!(out, "42\n");
    }

    #[test]
    fn load_propagates_tape_type() {
        let out = exec(|c| {
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), -1);
            emit0(c, Opcode::Store);
            emit0(c, Opcode::Load);
            emit0(c, Opcode::Print);
        });
        assert_eq!(out, "18446744073709551615\n");
    }

    #[test]
    fn pointer_ops() {
        let out = exec(|c| {
            emit2(c, Opcode::Set, TypeTag::Ptr.as_word(), 1);
            emit0(c, Opcode::Deref);
            emit2(c, Opcode::Set, TypeTag::I64.as_word(), 123);
            emit0(c, Opcode::Refer);
            emit1(c, Opcode::Offset, 1);
            emit0(c, Opcode::Load);
            emit0(c, Opcode::Print);
            emit1(c, Opcode::Offset, -1);
            emit0(c, Opcode::Where);
            emit0(c, Opcode::Print);
            emit0(c, Opcode::Halt);
        });
        assert_eq!(out, "123\n0\n");
    }

    #[test]
    fn index_shifts_by_cell_value() {
        let out = exec(|c| {
            emit2(c, Opcode::Set, TypeTag::I64.as_word(), 3);
            emit0(c, Opcode::Index); // tp = 0 + 3
            emit0(c, Opcode::Where);
            emit0(c, Opcode::Print);
        });
        assert_eq!(out, "3\n");
    }

    #[test]
    fn if_true_runs_then_branch() {
        let out = exec(|c| {
            push_i64(c, 1);
            emit0(c, Opcode::If);
            push_i64(c, 100);
            emit0(c, Opcode::Print);
            emit0(c, Opcode::Else);
            push_i64(c, 200);
            emit0(c, Opcode::Print);
            emit0(c, Opcode::Endblock);
            emit0(c, Opcode::Halt);
        });
        assert_eq!(out, "100\n");
    }

    #[test]
    fn if_false_runs_else_branch() {
        let out = exec(|c| {
            push_i64(c, 0);
            emit0(c, Opcode::If);
            push_i64(c, 100);
            emit0(c, Opcode::Print);
            emit0(c, Opcode::Else);
            push_i64(c, 200);
            emit0(c, Opcode::Print);
            emit0(c, Opcode::Endblock);
            emit0(c, Opcode::Halt);
        });
        assert_eq!(out, "200\n");
    }

    #[test]
    fn if_false_without_else_skips_body() {
        let out = exec(|c| {
            push_i64(c, 0);
            emit0(c, Opcode::If);
            push_i64(c, 100);
            emit0(c, Opcode::Print);
            emit0(c, Opcode::Endblock);
            push_i64(c, 7);
            emit0(c, Opcode::Print);
        });
        assert_eq!(out, "7\n");
    }

    #[test]
    fn else_branch_inside_while_does_not_break_the_loop() {
        // two iterations; each takes the else branch, then decrements
        let out = exec(|c| {
            push_i64(c, 2);
            emit0(c, Opcode::Store);
            let cond_ip = c.len();
            emit0(c, Opcode::Load);
            emit1(c, Opcode::While, cond_ip as Word);
            push_i64(c, 0);
            emit0(c, Opcode::If);
            push_i64(c, 111);
            emit0(c, Opcode::Print);
            emit0(c, Opcode::Else);
            emit0(c, Opcode::Load);
            emit0(c, Opcode::Print);
            emit0(c, Opcode::Endblock);
            emit0(c, Opcode::Load);
            push_i64(c, 1);
            emit0(c, Opcode::Sub);
            emit0(c, Opcode::Store);
            emit0(c, Opcode::Endblock);
            emit0(c, Opcode::Halt);
        });
        assert_eq!(out, "2\n1\n");
    }

    #[test]
    fn while_countdown() {
        let out = exec(|c| {
            push_i64(c, 4);
            emit0(c, Opcode::Store);
            let cond_ip = c.len();
            emit0(c, Opcode::Load);
            emit1(c, Opcode::While, cond_ip as Word);
            emit0(c, Opcode::Load);
            emit0(c, Opcode::Print);
            emit0(c, Opcode::Load);
            push_i64(c, 1);
            emit0(c, Opcode::Sub);
            emit0(c, Opcode::Store);
            emit0(c, Opcode::Endblock);
            emit0(c, Opcode::Halt);
        });
        assert_eq!(out, "4\n3\n2\n1\n");
    }

    #[test]
    fn while_keeps_block_stack_bounded() {
        // count a long loop down; the block stack must not grow per iteration
        let mut code = Vec::new();
        push_i64(&mut code, 600);
        emit0(&mut code, Opcode::Store);
        let cond_ip = code.len();
        emit0(&mut code, Opcode::Load);
        emit1(&mut code, Opcode::While, cond_ip as Word);
        emit0(&mut code, Opcode::Load);
        push_i64(&mut code, 1);
        emit0(&mut code, Opcode::Sub);
        emit0(&mut code, Opcode::Store);
        emit0(&mut code, Opcode::Endblock);
        emit0(&mut code, Opcode::Halt);

        let mut vm = Vm::new(code);
        let mut interp = Interp::with_output(Vec::new());
        run(&mut vm, &mut interp).unwrap();
        assert!(vm.block_stack.is_empty());
        assert_eq!(vm.tape[0].word, 0);
    }

    #[test]
    fn functions_and_calls() {
        let out = exec(|c| {
            emit1(c, Opcode::Function, 0);
            push_i64(c, 7);
            push_i64(c, 35);
            emit0(c, Opcode::Add);
            emit0(c, Opcode::Return);
            emit0(c, Opcode::Endblock);
            emit1(c, Opcode::Function, 1);
            push_i64(c, 5);
            push_i64(c, 3);
            emit0(c, Opcode::Mul);
            emit0(c, Opcode::Return);
            emit0(c, Opcode::Endblock);
            emit1(c, Opcode::Call, 0);
            emit1(c, Opcode::Call, 1);
            emit0(c, Opcode::Add);
            emit0(c, Opcode::Print);
            emit0(c, Opcode::Halt);
        });
        assert_eq!(out, "57\n");
    }

    #[test]
    fn empty_return_pushes_zero() {
        let out = exec(|c| {
            emit1(c, Opcode::Function, 0);
            emit0(c, Opcode::Return);
            emit0(c, Opcode::Endblock);
            emit1(c, Opcode::Call, 0);
            emit0(c, Opcode::Print);
        });
        assert_eq!(out, "0\n");
    }

    #[test]
    fn return_discards_callee_locals() {
        let out = exec(|c| {
            emit1(c, Opcode::Function, 0);
            push_i64(c, 1);
            push_i64(c, 2);
            push_i64(c, 3);
            emit0(c, Opcode::Return); // returns 3, drops 1 and 2
            emit0(c, Opcode::Endblock);
            emit1(c, Opcode::Call, 0);
            emit0(c, Opcode::Print);
        });
        assert_eq!(out, "3\n");
    }

    #[test]
    fn logical_and_bitwise() {
        let out = exec(|c| {
            push_i64(c, 10);
            push_i64(c, 3);
            emit0(c, Opcode::Rem);
            emit0(c, Opcode::Print); // 1
            emit2(c, Opcode::Push, TypeTag::Bool.as_word(), 0);
            emit0(c, Opcode::Not);
            emit0(c, Opcode::Print); // 1
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), 5);
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), 3);
            emit0(c, Opcode::BitAnd);
            emit0(c, Opcode::Print); // 1
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), 5);
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), 2);
            emit0(c, Opcode::BitOr);
            emit0(c, Opcode::Print); // 7
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), 6);
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), 3);
            emit0(c, Opcode::BitXor);
            emit0(c, Opcode::Print); // 5
        });
        assert_eq!(out, "1\n1\n1\n7\n5\n");
    }

    #[test]
    fn shifts() {
        let out = exec(|c| {
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), 1);
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), 3);
            emit0(c, Opcode::Lsh);
            emit0(c, Opcode::Print); // 8
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), 16);
            emit2(c, Opcode::Push, TypeTag::U64.as_word(), 2);
            emit0(c, Opcode::Lrsh);
            emit0(c, Opcode::Print); // 4
            push_i64(c, -8);
            push_i64(c, 1);
            emit0(c, Opcode::Arsh);
            emit0(c, Opcode::Print); // -4
        });
        assert_eq!(out, "8\n4\n-4\n");
    }

    #[test]
    fn lrsh_zero_extends() {
        let out = exec(|c| {
            push_i64(c, -8);
            push_i64(c, 1);
            emit0(c, Opcode::Lrsh);
            emit0(c, Opcode::Print);
        });
        assert_eq!(out, format!("{}\n", ((-8i64) as u64 >> 1) as i64));
    }

    #[test]
    fn gez() {
        let out = exec(|c| {
            push_i64(c, -1);
            emit0(c, Opcode::Gez);
            emit0(c, Opcode::Print);
            push_i64(c, 0);
            emit0(c, Opcode::Gez);
            emit0(c, Opcode::Print);
        });
        assert_eq!(out, "0\n1\n");
    }

    #[test]
    fn or_and_produce_zero_one() {
        let out = exec(|c| {
            push_i64(c, 7);
            push_i64(c, 0);
            emit0(c, Opcode::OrAssign);
            emit0(c, Opcode::Print); // 1
            push_i64(c, 7);
            push_i64(c, 0);
            emit0(c, Opcode::AndAssign);
            emit0(c, Opcode::Print); // 0
        });
        assert_eq!(out, "1\n0\n");
    }

    #[test]
    fn nested_pointer_chase() {
        let out = exec(|c| {
            emit2(c, Opcode::Set, TypeTag::Ptr.as_word(), 1);
            emit1(c, Opcode::Offset, 1);
            emit2(c, Opcode::Set, TypeTag::Ptr.as_word(), 2);
            emit1(c, Opcode::Offset, 1);
            emit2(c, Opcode::Set, TypeTag::Ptr.as_word(), 3);
            emit1(c, Opcode::Offset, -2);
            emit0(c, Opcode::Deref);
            emit0(c, Opcode::Deref);
            emit0(c, Opcode::Deref);
            emit2(c, Opcode::Set, TypeTag::I64.as_word(), 999);
            emit0(c, Opcode::Refer);
            emit0(c, Opcode::Refer);
            emit0(c, Opcode::Refer);
            emit0(c, Opcode::Where);
            emit0(c, Opcode::Print);
            emit1(c, Opcode::Offset, 3);
            emit0(c, Opcode::Load);
            emit0(c, Opcode::Print);
            emit0(c, Opcode::Halt);
        });
        assert_eq!(out, "0\n999\n");
    }
}
