//! Exception generation, user handlers and the recorded error state.
//!
//! When an instruction faults, the interpreter records the faulting pc,
//! advances past the instruction and routes the error through the handler
//! installed for its kind. A handler that calls
//! [`Vm::clear_exception_state`] resumes execution at the next instruction;
//! otherwise the interpreter unwinds to the host with the error. Abort
//! exceptions never invoke handlers. A fault raised while a handler runs is
//! returned as-is, ending execution immediately.

use log::error;

use crate::error::VmError;
use crate::execution_engine::{ExceptionCallback, Vm};
use crate::op_code::OpCode;

impl Vm {
    /// Routes an exception through the installed handlers. Returns `None`
    /// if a handler cleared the exception state (execution resumes), or
    /// the error to unwind with.
    pub(crate) fn generate_exception(&mut self, e: VmError) -> Option<VmError> {
        // rethrow: an error is already recorded
        if self.err.is_some() {
            return self.err.clone();
        }
        // a fault inside a handler ends execution immediately
        if self.exception_flag {
            return Some(e);
        }
        {
            let ctx = self.current_context();
            let c = ctx.borrow();
            self.err_call_sp = c.call_sp;
            self.err_data_sp = c.data_sp;
        }
        self.err = Some(e.clone());
        self.exception_flag = true;
        match e {
            VmError::SoftwareException => self.invoke_handler(Handler::Software),
            VmError::TraceException => self.invoke_handler(Handler::Trace),
            VmError::BreakException => self.invoke_handler(Handler::Break),
            VmError::AbortException => {}
            _ => self.invoke_handler(Handler::Machine),
        }
        self.exception_flag = false;
        self.err.clone()
    }

    fn invoke_handler(&mut self, which: Handler) {
        let taken = self.handler_slot(which).take();
        if let Some(mut cb) = taken {
            cb(self);
            let slot = self.handler_slot(which);
            if slot.is_none() {
                *slot = Some(cb);
            }
        }
    }

    fn handler_slot(&mut self, which: Handler) -> &mut Option<ExceptionCallback> {
        match which {
            Handler::Software => &mut self.handlers.software,
            Handler::Trace => &mut self.handlers.trace,
            Handler::Break => &mut self.handlers.brk,
            Handler::Machine => &mut self.handlers.machine,
        }
    }

    /// Clears the recorded exception so the interpreter resumes at the
    /// instruction after the fault. Releases the pending throw handle.
    pub fn clear_exception_state(&mut self) {
        self.err = None;
        if let Some(t) = self.throw_handle.take() {
            self.release_handle(t);
        }
    }

    /// The recorded exception, if any.
    pub fn err_exception(&self) -> Option<&VmError> {
        self.err.as_ref()
    }

    /// Program counter of the faulting instruction.
    pub fn err_pc(&self) -> i32 {
        self.err_pc
    }

    /// Call stack pointer at the time of the fault.
    pub fn err_call_stack_pointer(&self) -> usize {
        self.err_call_sp
    }

    /// Data stack pointer at the time of the fault.
    pub fn err_data_stack_pointer(&self) -> usize {
        self.err_data_sp
    }

    /// Writes the recorded error state to the log.
    pub fn output_crash_log(&self) {
        let Some(err) = &self.err else {
            return;
        };
        let mnemonic = self
            .image
            .code
            .get(self.err_pc as usize)
            .and_then(|&w| OpCode::from_word(w))
            .map_or("<invalid>", |op| op.mnemonic());
        error!(
            "VM exception {} (code {}) at pc {} ({}), call sp {}, data sp {}",
            err,
            err.code(),
            self.err_pc,
            mnemonic,
            self.err_call_sp,
            self.err_data_sp
        );
    }
}

#[derive(Clone, Copy)]
enum Handler {
    Software,
    Trace,
    Break,
    Machine,
}
