//! The interpreter: fetch, decode and execute one instruction per
//! iteration.
//!
//! The loop runs until a `ret` pops the return-to-native sentinel. When an
//! instruction faults, the loop records the faulting pc, advances the
//! context past the instruction and routes the error through the exception
//! subsystem; a handler that clears the exception state resumes the loop.
//! Opcode handlers are grouped by category in the submodules.

mod alloc_ops;
mod arithmetic;
mod control;
mod movement;

use crate::error::{VmError, VmResult};
use crate::execution_engine::Vm;
use crate::handle::{HandleRef, SlotBody, TypeFamily};
use crate::op_code::{OpCode, OperandKind};

use arithmetic::{Binary, Compare, Num, Unary};

/// Where control goes after an instruction.
pub(crate) enum Flow {
    /// Advance to the next instruction.
    Next,
    /// Jump to an absolute code address.
    Branch(i32),
    /// A `ret` popped the return-to-native sentinel: leave the interpreter.
    Return,
    /// `resume`/`yield` switched contexts; the new context's pc is current.
    Switched,
}

/// A resolved effective address: the location of one handle reference.
#[derive(Clone)]
pub(crate) enum Slot {
    /// Register `n`.
    Reg(usize),
    /// Absolute data-stack index.
    Stack(usize),
    /// Member `disp` of a class instance body.
    Member(SlotBody, usize),
    /// Element `index` of an array body.
    Element(SlotBody, usize),
}

impl Vm {
    /// Enters the interpreter loop. Balanced run-level tracking keeps
    /// `running` true across re-entrant native calls.
    pub(crate) fn run(&mut self) -> VmResult<()> {
        self.run_level += 1;
        self.running = true;
        let result = self.interpret();
        self.run_level -= 1;
        self.running = self.run_level > 0;
        result
    }

    fn interpret(&mut self) -> VmResult<()> {
        loop {
            match self.dispatch_until_return() {
                Ok(()) => return Ok(()),
                Err(e) => match self.generate_exception(e) {
                    None => continue,
                    Some(err) => return Err(err),
                },
            }
        }
    }

    fn dispatch_until_return(&mut self) -> VmResult<()> {
        loop {
            let pc = self.current_context().borrow().pc;
            if self.trace_flag {
                self.err_pc = pc;
                if let Some(err) = self.generate_exception(VmError::TraceException) {
                    return Err(err);
                }
            }
            self.instruction_counter += 1;
            match self.step(pc) {
                Ok(Flow::Return) => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    self.err_pc = pc;
                    let word = self.image.code.get(pc as usize).copied().unwrap_or(-1);
                    let size = OpCode::instruction_size(word).max(1) as i32;
                    self.current_context().borrow_mut().pc = pc + size;
                    return Err(e);
                }
            }
        }
    }

    fn step(&mut self, pc: i32) -> VmResult<Flow> {
        let word = *self
            .image
            .code
            .get(pc as usize)
            .ok_or(VmError::InvalidCodeAddress { address: pc })?;
        let op = OpCode::from_word(word).ok_or(VmError::IllegalInstruction { word })?;
        let size = op.size();
        let end = pc as usize + size;
        if end > self.image.code.len() {
            return Err(VmError::InvalidCodeAddress { address: pc });
        }
        let mut words = [0i32; 8];
        words[..size - 1].copy_from_slice(&self.image.code[pc as usize + 1..end]);
        let flow = self.exec(op, &words[..size - 1], pc)?;
        match flow {
            Flow::Next => self.current_context().borrow_mut().pc = pc + size as i32,
            Flow::Branch(target) => self.current_context().borrow_mut().pc = target,
            Flow::Return | Flow::Switched => {}
        }
        Ok(flow)
    }

    fn exec(&mut self, op: OpCode, w: &[i32], pc: i32) -> VmResult<Flow> {
        use OpCode as O;
        match op.base() {
            O::Nop => Ok(Flow::Next),

            // movement
            O::MoveRR => movement::move_op(self, op, w),
            O::CopyRR => movement::copy_op(self, op, w),
            O::WrefRR => movement::wref_op(self, op, w),
            O::MovehR => movement::moveh_op(self, op, w),
            O::CopyhR => movement::copyh_op(self, op, w),
            O::LdzR => movement::ldz_op(self, op, w),

            // stack
            O::PushR => movement::push_op(self, op, w),
            O::PopR => movement::pop_op(self, op, w),
            O::Pushm => movement::pushm_op(self, w),
            O::Popm => movement::popm_op(self, w),
            O::PushRange => movement::push_range_op(self, w),
            O::PopRange => movement::pop_range_op(self, w),

            // queries
            O::Size => movement::size_op(self, op, w),
            O::Type => movement::type_op(self, op, w),
            O::RtchkR => movement::rtchk_op(self, op, w),
            O::Dcvt => movement::dcvt_op(self, op, w),

            // arithmetic, generic / int / float
            O::AddRR => arithmetic::binary(self, op, w, Binary::Add, Num::Generic),
            O::SubRR => arithmetic::binary(self, op, w, Binary::Sub, Num::Generic),
            O::MulRR => arithmetic::binary(self, op, w, Binary::Mul, Num::Generic),
            O::DivRR => arithmetic::binary(self, op, w, Binary::Div, Num::Generic),
            O::ModRR => arithmetic::binary(self, op, w, Binary::Mod, Num::Generic),
            O::AddlRR => arithmetic::binary(self, op, w, Binary::Add, Num::Int),
            O::SublRR => arithmetic::binary(self, op, w, Binary::Sub, Num::Int),
            O::MullRR => arithmetic::binary(self, op, w, Binary::Mul, Num::Int),
            O::DivlRR => arithmetic::binary(self, op, w, Binary::Div, Num::Int),
            O::ModlRR => arithmetic::binary(self, op, w, Binary::Mod, Num::Int),
            O::AddfRR => arithmetic::binary(self, op, w, Binary::Add, Num::Float),
            O::SubfRR => arithmetic::binary(self, op, w, Binary::Sub, Num::Float),
            O::MulfRR => arithmetic::binary(self, op, w, Binary::Mul, Num::Float),
            O::DivfRR => arithmetic::binary(self, op, w, Binary::Div, Num::Float),
            O::ModfRR => arithmetic::binary(self, op, w, Binary::Mod, Num::Float),

            // bitwise, int only
            O::AndRR => arithmetic::binary(self, op, w, Binary::And, Num::Int),
            O::OrRR => arithmetic::binary(self, op, w, Binary::Or, Num::Int),
            O::XorRR => arithmetic::binary(self, op, w, Binary::Xor, Num::Int),
            O::AslRR => arithmetic::binary(self, op, w, Binary::Asl, Num::Int),
            O::AsrRR => arithmetic::binary(self, op, w, Binary::Asr, Num::Int),
            O::LslRR => arithmetic::binary(self, op, w, Binary::Lsl, Num::Int),
            O::LsrRR => arithmetic::binary(self, op, w, Binary::Lsr, Num::Int),

            // in-place unary
            O::IncR => arithmetic::unary(self, op, w, Unary::Inc, Num::Generic),
            O::DecR => arithmetic::unary(self, op, w, Unary::Dec, Num::Generic),
            O::NegR => arithmetic::unary(self, op, w, Unary::Neg, Num::Generic),
            O::InclR => arithmetic::unary(self, op, w, Unary::Inc, Num::Int),
            O::DeclR => arithmetic::unary(self, op, w, Unary::Dec, Num::Int),
            O::NeglR => arithmetic::unary(self, op, w, Unary::Neg, Num::Int),
            O::IncfR => arithmetic::unary(self, op, w, Unary::Inc, Num::Float),
            O::DecfR => arithmetic::unary(self, op, w, Unary::Dec, Num::Float),
            O::NegfR => arithmetic::unary(self, op, w, Unary::Neg, Num::Float),
            O::NotR => arithmetic::unary(self, op, w, Unary::Not, Num::Int),
            O::UnotR => arithmetic::unary(self, op, w, Unary::Unot, Num::Int),

            // conversions
            O::Cvf => arithmetic::cvf_op(self, op, w),
            O::Cvl => arithmetic::cvl_op(self, op, w),

            // compare-and-set
            O::CseqRR => arithmetic::compare(self, op, w, Compare::Eq, Num::Generic),
            O::CsneRR => arithmetic::compare(self, op, w, Compare::Ne, Num::Generic),
            O::CsgtRR => arithmetic::compare(self, op, w, Compare::Gt, Num::Generic),
            O::CsgeRR => arithmetic::compare(self, op, w, Compare::Ge, Num::Generic),
            O::CsltRR => arithmetic::compare(self, op, w, Compare::Lt, Num::Generic),
            O::CsleRR => arithmetic::compare(self, op, w, Compare::Le, Num::Generic),
            O::CseqlRR => arithmetic::compare(self, op, w, Compare::Eq, Num::Int),
            O::CsnelRR => arithmetic::compare(self, op, w, Compare::Ne, Num::Int),
            O::CsgtlRR => arithmetic::compare(self, op, w, Compare::Gt, Num::Int),
            O::CsgelRR => arithmetic::compare(self, op, w, Compare::Ge, Num::Int),
            O::CsltlRR => arithmetic::compare(self, op, w, Compare::Lt, Num::Int),
            O::CslelRR => arithmetic::compare(self, op, w, Compare::Le, Num::Int),
            O::CseqfRR => arithmetic::compare(self, op, w, Compare::Eq, Num::Float),
            O::CsnefRR => arithmetic::compare(self, op, w, Compare::Ne, Num::Float),
            O::CsgtfRR => arithmetic::compare(self, op, w, Compare::Gt, Num::Float),
            O::CsgefRR => arithmetic::compare(self, op, w, Compare::Ge, Num::Float),
            O::CsltfRR => arithmetic::compare(self, op, w, Compare::Lt, Num::Float),
            O::CslefRR => arithmetic::compare(self, op, w, Compare::Le, Num::Float),

            // reference and string tests
            O::SnulRR => arithmetic::snul_op(self, op, w, true),
            O::SnnulRR => arithmetic::snul_op(self, op, w, false),
            O::CmprefRR => arithmetic::cmpref_op(self, op, w),
            O::StreqRR => arithmetic::strcmp_op(self, op, w, true),
            O::StrneRR => arithmetic::strcmp_op(self, op, w, false),
            O::StraddRR => arithmetic::stradd_op(self, op, w),
            O::ArrcpRR => arithmetic::arradd_op(self, op, w, true),
            O::ArrmvRR => arithmetic::arradd_op(self, op, w, false),

            // control
            O::Bra => control::bra_op(self, w, pc),
            O::TsteqR => control::tst_op(self, op, w, pc, true),
            O::TstneR => control::tst_op(self, op, w, pc, false),
            O::Calls => control::calls_op(self, w, pc, op.size()),
            O::Callm => control::callm_op(self, w, pc, op.size()),
            O::Calln => control::calln_op(self, w, pc, op.size()),
            O::Jsr => control::jsr_op(self, op, w, pc),
            O::Jmp => control::jmp_op(self, w),
            O::Ret => control::ret_op(self, pc),
            O::Brk => Err(VmError::BreakException),
            O::Throw => control::throw_op(self),
            O::CalldgR => control::calldg_op(self, op, w, pc),
            O::Calli => control::calli_op(self, w, pc, op.size()),

            // coroutines
            O::Newctx => control::newctx_op(self, op, w),
            O::ResumeR => control::resume_op(self, op, w, pc),
            O::Yield => control::yield_op(self, pc),

            // allocation
            O::Alloc => alloc_ops::alloc_op(self, op, w),
            O::Allocn => alloc_ops::allocn_op(self, op, w),
            O::Alloca => alloc_ops::alloca_op(self, op, w),
            O::Alloci => alloc_ops::alloci_op(self, op, w),
            O::Newdg => alloc_ops::newdg_op(self, op, w),
            O::Newdgm => alloc_ops::newdgm_op(self, op, w),
            O::Newdgc => alloc_ops::newdgc_op(self, op, w),

            _ => Err(VmError::IllegalInstruction { word: op as i32 }),
        }
    }

    // ------------------------------------------------------------------
    // effective addresses
    // ------------------------------------------------------------------

    /// Resolves the operand at `*cursor` to a slot, advancing the cursor.
    pub(crate) fn ea(
        &mut self,
        kind: OperandKind,
        w: &[i32],
        cursor: &mut usize,
    ) -> VmResult<Slot> {
        match kind {
            OperandKind::Reg => {
                let n = w[*cursor];
                *cursor += 1;
                if n < 0 || n as usize >= crate::execution_context::NUM_REGISTERS {
                    return Err(VmError::invalid_operand(format!("register r{}", n)));
                }
                Ok(Slot::Reg(n as usize))
            }
            OperandKind::StackDisp => {
                let d = w[*cursor];
                *cursor += 1;
                let ctx = self.current_context();
                let c = ctx.borrow();
                let at = c.data_sp as i64 + d as i64;
                if d < 0 || at as usize >= c.data_stack_size() {
                    return Err(VmError::StackOverflow {
                        pointer: at,
                        limit: c.data_stack_size(),
                    });
                }
                Ok(Slot::Stack(at as usize))
            }
            OperandKind::RegDisp => {
                let n = w[*cursor] as usize;
                let disp = w[*cursor + 1];
                *cursor += 2;
                let obj = self.reg(n)?;
                let h = self.pool.handle(obj);
                if h.is_null() {
                    return Err(VmError::null_reference("member access"));
                }
                if self.config.runtime_checks {
                    let info = self.image.type_info(h.type_id)?;
                    if info.family != TypeFamily::Class || info.native {
                        return Err(VmError::unsupported_type(h.type_id, "member access"));
                    }
                }
                let body = h
                    .as_object()
                    .cloned()
                    .ok_or_else(|| VmError::unsupported_type(h.type_id, "member access"))?;
                if disp < 0 || disp as usize >= body.borrow().len() {
                    return Err(VmError::invalid_operand(format!("member slot {}", disp)));
                }
                Ok(Slot::Member(body, disp as usize))
            }
            OperandKind::RegIdx => {
                let n = w[*cursor] as usize;
                let m = w[*cursor + 1] as usize;
                *cursor += 2;
                let arr = self.reg(n)?;
                let idx_h = self.reg(m)?;
                if self.pool.handle(arr).is_null() {
                    return Err(VmError::null_reference("array access"));
                }
                let body = self
                    .pool
                    .handle(arr)
                    .as_array()
                    .cloned()
                    .ok_or_else(|| {
                        VmError::unsupported_type(self.pool.handle(arr).type_id, "array access")
                    })?;
                let idx = self
                    .pool
                    .handle(idx_h)
                    .as_int()
                    .ok_or_else(|| VmError::unsupported_type(self.pool.handle(idx_h).type_id, "array index"))?;
                if idx < 0 {
                    return Err(VmError::invalid_operand(format!("array index {}", idx)));
                }
                let idx = idx as usize;
                // arrays grow on demand; new slots reference null
                let len = body.borrow().len();
                if idx >= len {
                    let null = self.pool.null_ref();
                    self.pool.add_ref_n(null, (idx + 1 - len) as u32);
                    body.borrow_mut().resize(idx + 1, null);
                }
                Ok(Slot::Element(body, idx))
            }
            _ => Err(VmError::invalid_operand("operand is not an address")),
        }
    }

    /// The handle currently stored at a slot.
    pub(crate) fn load(&self, slot: &Slot) -> HandleRef {
        match slot {
            Slot::Reg(n) => self.current_context().borrow().register(*n),
            Slot::Stack(at) => self.current_context().borrow().data_at(*at),
            Slot::Member(body, i) | Slot::Element(body, i) => body.borrow()[*i],
        }
    }

    /// Stores a handle at a slot: the new reference is added before the old
    /// one is released.
    pub(crate) fn store(&mut self, slot: &Slot, h: HandleRef) {
        self.pool.add_ref(h);
        let old = match slot {
            Slot::Reg(n) => {
                let ctx = self.current_context();
                let mut c = ctx.borrow_mut();
                let old = c.register(*n);
                c.set_register(*n, h);
                old
            }
            Slot::Stack(at) => {
                let ctx = self.current_context();
                let mut c = ctx.borrow_mut();
                let old = c.data_at(*at);
                c.set_data_at(*at, h);
                old
            }
            Slot::Member(body, i) | Slot::Element(body, i) => {
                std::mem::replace(&mut body.borrow_mut()[*i], h)
            }
        };
        self.release_handle(old);
    }

    /// The handle in register `n`.
    pub(crate) fn reg(&self, n: usize) -> VmResult<HandleRef> {
        if n >= crate::execution_context::NUM_REGISTERS {
            return Err(VmError::invalid_operand(format!("register r{}", n)));
        }
        Ok(self.current_context().borrow().register(n))
    }
}
