//! Per-fiber execution state: program counter, call stack, data stack and
//! the register window.
//!
//! Registers are not separate storage: the top `NUM_REGISTERS` slots of the
//! data stack form the register window, so marking or releasing the live
//! part of the stack covers the registers for free. Both stacks grow
//! downward — the pointer decreases on push.

use crate::error::{VmError, VmResult};
use crate::handle::{ContextBody, HandleRef};

/// Number of registers in the register window.
pub const NUM_REGISTERS: usize = 32;
/// Register holding `this` during method calls.
pub const THIS_REGISTER: usize = 0;
/// Register receiving function return values.
pub const RETURN_REGISTER: usize = 1;
/// Register holding the module-global object.
pub const GLOBAL_REGISTER: usize = 2;
/// First register subject to save/restore around function bodies.
pub const FIRST_SAVED_REGISTER: usize = 3;
/// Call-stack sentinel: `ret` popping this address leaves the interpreter.
pub const RETURN_TO_NATIVE: i32 = -1;

/// One cooperative execution unit.
#[derive(Debug)]
pub struct ExecutionContext {
    /// The program counter, a word index into the code segment.
    pub pc: i32,
    /// Return addresses; `call_sp` decreases on push.
    call_stack: Vec<i32>,
    /// Call stack pointer (index of the most recent entry).
    pub call_sp: usize,
    /// Handle references; `data_sp` decreases on push. The last
    /// `NUM_REGISTERS` slots are the register window.
    data_stack: Vec<HandleRef>,
    /// Data stack pointer (index of the most recent entry).
    pub data_sp: usize,
    /// The context to switch back to on `yield`.
    pub yield_to: Option<ContextBody>,
}

impl ExecutionContext {
    /// Creates a context with the given stack capacities. Every data slot,
    /// including the register window, starts out referencing `null_ref`;
    /// the caller is responsible for the null handle's reference count.
    pub fn new(call_stack_size: usize, data_stack_size: usize, null_ref: HandleRef) -> Self {
        debug_assert!(data_stack_size > NUM_REGISTERS);
        Self {
            pc: 0,
            call_stack: vec![0; call_stack_size],
            call_sp: call_stack_size,
            data_stack: vec![null_ref; data_stack_size],
            data_sp: data_stack_size - NUM_REGISTERS,
            yield_to: None,
        }
    }

    /// Index of the first register-window slot.
    pub fn reg_base(&self) -> usize {
        self.data_stack.len() - NUM_REGISTERS
    }

    /// The handle currently in register `n`.
    pub fn register(&self, n: usize) -> HandleRef {
        self.data_stack[self.reg_base() + n]
    }

    /// Overwrites register `n` without touching reference counts.
    pub fn set_register(&mut self, n: usize, h: HandleRef) {
        let base = self.reg_base();
        self.data_stack[base + n] = h;
    }

    /// The handle in data-stack slot `sp + offset`.
    pub fn stack_slot(&self, offset: usize) -> HandleRef {
        self.data_stack[self.data_sp + offset]
    }

    /// The handle at an absolute data-stack index.
    pub(crate) fn data_at(&self, at: usize) -> HandleRef {
        self.data_stack[at]
    }

    /// Overwrites an absolute data-stack index without touching reference
    /// counts.
    pub(crate) fn set_data_at(&mut self, at: usize, h: HandleRef) {
        self.data_stack[at] = h;
    }

    /// Overwrites data-stack slot `sp + offset` without touching reference
    /// counts.
    pub fn set_stack_slot(&mut self, offset: usize, h: HandleRef) {
        self.data_stack[self.data_sp + offset] = h;
    }

    /// Pushes a return address onto the call stack.
    pub fn push_call(&mut self, addr: i32) -> VmResult<()> {
        if self.call_sp == 0 {
            return Err(VmError::StackOverflow {
                pointer: -1,
                limit: self.call_stack.len(),
            });
        }
        self.call_sp -= 1;
        self.call_stack[self.call_sp] = addr;
        Ok(())
    }

    /// Pops a return address from the call stack.
    pub fn pop_call(&mut self) -> i32 {
        let addr = self.call_stack[self.call_sp];
        self.call_sp += 1;
        addr
    }

    /// Pushes a handle reference; the caller has already added a reference.
    pub fn push_data(&mut self, h: HandleRef) -> VmResult<()> {
        if self.data_sp == 0 {
            return Err(VmError::StackOverflow {
                pointer: -1,
                limit: self.data_stack.len(),
            });
        }
        self.data_sp -= 1;
        self.data_stack[self.data_sp] = h;
        Ok(())
    }

    /// Pops a handle reference; the caller takes over the reference.
    pub fn pop_data(&mut self) -> VmResult<HandleRef> {
        if self.data_sp >= self.data_stack.len() {
            return Err(VmError::StackOverflow {
                pointer: self.data_sp as i64,
                limit: self.data_stack.len(),
            });
        }
        let h = self.data_stack[self.data_sp];
        self.data_sp += 1;
        Ok(h)
    }

    /// All live data-stack slots (from the stack pointer to the end,
    /// register window included).
    pub fn live_slots(&self) -> &[HandleRef] {
        &self.data_stack[self.data_sp..]
    }

    /// Total data stack capacity.
    pub fn data_stack_size(&self) -> usize {
        self.data_stack.len()
    }

    /// Total call stack capacity.
    pub fn call_stack_size(&self) -> usize {
        self.call_stack.len()
    }
}

/// Snapshot of the machine state a re-entrant host call must preserve:
/// program counter, both stack pointers, and registers r0/r1 (which are
/// parked on the data stack between push and pop).
#[derive(Debug)]
pub struct StackFrame {
    pub(crate) ctx: ContextBody,
    pub(crate) pc: i32,
    pub(crate) call_sp: usize,
    pub(crate) data_sp: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null() -> HandleRef {
        HandleRef(0)
    }

    #[test]
    fn test_register_window_is_stack_top() {
        let ctx = ExecutionContext::new(16, 64, null());
        assert_eq!(ctx.reg_base(), 64 - NUM_REGISTERS);
        assert_eq!(ctx.data_sp, ctx.reg_base());
        assert_eq!(ctx.live_slots().len(), NUM_REGISTERS);
    }

    #[test]
    fn test_push_pop_data() {
        let mut ctx = ExecutionContext::new(16, 64, null());
        ctx.push_data(HandleRef(7)).unwrap();
        ctx.push_data(HandleRef(8)).unwrap();
        assert_eq!(ctx.stack_slot(0), HandleRef(8));
        assert_eq!(ctx.stack_slot(1), HandleRef(7));
        assert_eq!(ctx.pop_data().unwrap(), HandleRef(8));
        assert_eq!(ctx.pop_data().unwrap(), HandleRef(7));
    }

    #[test]
    fn test_call_stack_overflow() {
        let mut ctx = ExecutionContext::new(2, 64, null());
        ctx.push_call(10).unwrap();
        ctx.push_call(20).unwrap();
        assert!(ctx.push_call(30).is_err());
        assert_eq!(ctx.pop_call(), 20);
        assert_eq!(ctx.pop_call(), 10);
    }

    #[test]
    fn test_data_stack_overflow() {
        let mut ctx = ExecutionContext::new(4, NUM_REGISTERS + 2, null());
        ctx.push_data(HandleRef(1)).unwrap();
        ctx.push_data(HandleRef(2)).unwrap();
        assert!(ctx.push_data(HandleRef(3)).is_err());
    }

    #[test]
    fn test_registers_addressable() {
        let mut ctx = ExecutionContext::new(4, 64, null());
        ctx.set_register(RETURN_REGISTER, HandleRef(42));
        assert_eq!(ctx.register(RETURN_REGISTER), HandleRef(42));
        assert_eq!(ctx.register(THIS_REGISTER), null());
    }
}
