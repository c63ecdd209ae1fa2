//! Control-flow handlers: branches, calls, returns, exceptions and
//! coroutine switching.

use crate::error::{VmError, VmResult};
use crate::execution_context::{RETURN_REGISTER, RETURN_TO_NATIVE, THIS_REGISTER};
use crate::execution_engine::Vm;
use crate::handle::{HandleRef, Payload, TypeFamily};
use crate::op_code::{OpCode, OperandKind};

use super::Flow;

/// `bra OFFSET`: unconditional branch, offset relative to the instruction.
pub(super) fn bra_op(_vm: &mut Vm, w: &[i32], pc: i32) -> VmResult<Flow> {
    Ok(Flow::Branch(pc + w[0]))
}

/// `tsteq`/`tstne` `EA, OFFSET`: branch if the int at EA is zero/non-zero.
pub(super) fn tst_op(vm: &mut Vm, op: OpCode, w: &[i32], pc: i32, on_zero: bool) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let slot = vm.ea(kinds[0], w, &mut c)?;
    let offset = w[c];
    let h = vm.load(&slot);
    let v = vm
        .pool
        .handle(h)
        .as_int()
        .ok_or_else(|| VmError::unsupported_type(vm.pool.handle(h).type_id, op.mnemonic()))?;
    if (v == 0) == on_zero {
        Ok(Flow::Branch(pc + offset))
    } else {
        Ok(Flow::Next)
    }
}

/// `calls FN`: calls a global function by function id.
pub(super) fn calls_op(vm: &mut Vm, w: &[i32], pc: i32, size: usize) -> VmResult<Flow> {
    let func = vm.image.func_info(w[0])?.clone();
    let ctx = vm.current_context();
    ctx.borrow_mut().push_call(pc + size as i32)?;
    Ok(Flow::Branch(func.code_addr))
}

/// `callm TYPE, SLOT`: member call through the v-table of r0's class.
pub(super) fn callm_op(vm: &mut Vm, w: &[i32], pc: i32, size: usize) -> VmResult<Flow> {
    let declared = w[0];
    let slot = w[1];
    let this = vm.reg(THIS_REGISTER)?;
    let type_id = vm.pool.handle(this).type_id;
    let info = vm.image.type_info(type_id)?.clone();
    if vm.config.runtime_checks {
        if info.family != TypeFamily::Class {
            return Err(VmError::unsupported_type(type_id, "callm"));
        }
        if declared != type_id && declared != info.base {
            return Err(VmError::type_mismatch(
                vm.image.type_name(declared),
                vm.image.type_name(type_id),
            ));
        }
    }
    if info.native {
        vm.err_pc = pc;
        let ctx = vm.current_context();
        ctx.borrow_mut().push_call(pc + size as i32)?;
        let proc_ = vm.native_proc(type_id)?;
        let body = vm
            .pool
            .handle(this)
            .as_native()
            .cloned()
            .ok_or(VmError::InvalidHandleType { type_id })?;
        let result = proc_.borrow().call_member(vm, slot, &body);
        ctx.borrow_mut().pop_call();
        result?;
        Ok(Flow::Next)
    } else {
        let vtab = info.vtable_offset;
        if vtab < 0 {
            return Err(VmError::InvalidMemberIndex {
                index: slot,
                type_id,
            });
        }
        let fn_id = vm.image.cstr.vtable_entry(vtab as usize, slot as usize)?;
        let func = vm.image.func_info(fn_id)?.clone();
        let ctx = vm.current_context();
        ctx.borrow_mut().push_call(pc + size as i32)?;
        Ok(Flow::Branch(func.code_addr))
    }
}

/// `calln TYPE, SLOT`: static call into a native type.
pub(super) fn calln_op(vm: &mut Vm, w: &[i32], pc: i32, size: usize) -> VmResult<Flow> {
    let type_id = w[0];
    let slot = w[1];
    if vm.config.runtime_checks {
        let info = vm.image.type_info(type_id)?;
        if info.family != TypeFamily::Class || !info.native {
            return Err(VmError::unsupported_type(type_id, "calln"));
        }
    }
    vm.err_pc = pc;
    let ctx = vm.current_context();
    ctx.borrow_mut().push_call(pc + size as i32)?;
    let proc_ = vm.native_proc(type_id)?;
    let result = proc_.borrow().call_static(vm, slot);
    ctx.borrow_mut().pop_call();
    result?;
    Ok(Flow::Next)
}

/// `jsr ADDR` / `jsr EA`: direct-address subroutine call.
pub(super) fn jsr_op(vm: &mut Vm, op: OpCode, w: &[i32], pc: i32) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let addr = if kinds[0] == OperandKind::Imm {
        w[0]
    } else {
        let mut c = 0;
        let slot = vm.ea(kinds[0], w, &mut c)?;
        let h = vm.load(&slot);
        vm.pool
            .handle(h)
            .as_int()
            .ok_or_else(|| VmError::unsupported_type(vm.pool.handle(h).type_id, "jsr"))? as i32
    };
    let ctx = vm.current_context();
    ctx.borrow_mut().push_call(pc + op.size() as i32)?;
    Ok(Flow::Branch(addr))
}

/// `jmp ADDR`: direct tail-jump (pure method inheritance).
pub(super) fn jmp_op(_vm: &mut Vm, w: &[i32]) -> VmResult<Flow> {
    Ok(Flow::Branch(w[0]))
}

/// `ret`: pops the call stack; the return-to-native sentinel leaves the
/// interpreter.
pub(super) fn ret_op(vm: &mut Vm, pc: i32) -> VmResult<Flow> {
    let ctx = vm.current_context();
    let addr = {
        let mut c = ctx.borrow_mut();
        if c.call_sp >= c.call_stack_size() {
            return Err(VmError::InvalidCodeAddress { address: pc });
        }
        c.pop_call()
    };
    if addr == RETURN_TO_NATIVE {
        ctx.borrow_mut().pc = pc;
        Ok(Flow::Return)
    } else {
        Ok(Flow::Branch(addr))
    }
}

/// `throw`: raises a software exception carrying r1.
pub(super) fn throw_op(vm: &mut Vm) -> VmResult<Flow> {
    let h = vm.reg(RETURN_REGISTER)?;
    vm.pool.add_ref(h);
    if let Some(old) = vm.throw_handle.replace(h) {
        vm.release_handle(old);
    }
    Err(VmError::SoftwareException)
}

/// `calldg EA`: calls the delegate at EA. A null delegate stores null into
/// the return register and continues.
pub(super) fn calldg_op(vm: &mut Vm, op: OpCode, w: &[i32], pc: i32) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let slot = vm.ea(kinds[0], w, &mut c)?;
    let h = vm.load(&slot);
    if vm.pool.handle(h).is_null() {
        let null = vm.pool.null_ref();
        vm.pool.add_ref(null);
        vm.set_return_register_raw(null);
        return Ok(Flow::Next);
    }
    if vm.config.runtime_checks {
        let type_id = vm.pool.handle(h).type_id;
        if vm.image.type_info(type_id)?.family != TypeFamily::Delegate {
            return Err(VmError::unsupported_type(type_id, "calldg"));
        }
    }
    vm.err_pc = pc;
    let ctx = vm.current_context();
    ctx.borrow_mut().push_call(pc + op.size() as i32)?;
    let result = vm.call_delegate(h);
    ctx.borrow_mut().pop_call();
    result?;
    Ok(Flow::Next)
}

/// `calli IFACE, SLOT`: invokes `SLOT` on every element of the interface
/// factory array in r0, preserving r0 and r1 around the loop.
pub(super) fn calli_op(vm: &mut Vm, w: &[i32], pc: i32, size: usize) -> VmResult<Flow> {
    let iface = w[0];
    let slot = w[1];
    let arr = vm.reg(THIS_REGISTER)?;
    if vm.config.runtime_checks {
        if vm.image.type_info(iface)?.family != TypeFamily::Interface {
            return Err(VmError::unsupported_type(iface, "calli"));
        }
        if vm.pool.handle(arr).as_array().is_none() {
            return Err(VmError::unsupported_type(vm.pool.handle(arr).type_id, "calli"));
        }
    }
    let elems: Vec<HandleRef> = vm
        .pool
        .handle(arr)
        .as_array()
        .cloned()
        .ok_or_else(|| VmError::unsupported_type(vm.pool.handle(arr).type_id, "calli"))?
        .borrow()
        .clone();
    vm.err_pc = pc;
    let ctx = vm.current_context();
    ctx.borrow_mut().push_call(pc + size as i32)?;
    let result = call_factory(vm, &elems, slot);
    ctx.borrow_mut().pop_call();
    result?;
    Ok(Flow::Next)
}

/// Invokes `slot` on each instance in order, with the instance in r0;
/// r0 and r1 are saved and restored around the loop.
fn call_factory(vm: &mut Vm, elems: &[HandleRef], slot: i32) -> VmResult<()> {
    let ctx = vm.current_context();
    let (save_r0, save_r1) = {
        let c = ctx.borrow();
        (c.register(THIS_REGISTER), c.register(RETURN_REGISTER))
    };
    vm.pool.add_ref(save_r0);
    vm.pool.add_ref(save_r1);
    let mut result = Ok(());
    for &obj in elems {
        vm.pool.add_ref(obj);
        let old = {
            let mut c = ctx.borrow_mut();
            let old = c.register(THIS_REGISTER);
            c.set_register(THIS_REGISTER, obj);
            old
        };
        vm.release_handle(old);
        result = vm.call_method(obj, slot);
        if result.is_err() {
            break;
        }
    }
    for (reg, saved) in [(THIS_REGISTER, save_r0), (RETURN_REGISTER, save_r1)] {
        let old = {
            let mut c = ctx.borrow_mut();
            let old = c.register(reg);
            c.set_register(reg, saved);
            old
        };
        vm.release_handle(old);
    }
    result
}

/// `newctx TYPE, FN, ARGC, DST`: spawns a coroutine context primed at the
/// function's entry, with ARGC arguments copied from the caller's stack.
pub(super) fn newctx_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let type_id = w[0];
    let func = vm.image.func_info(w[1])?.clone();
    let argc = w[2];
    if argc < 0 {
        return Err(VmError::invalid_operand("negative argument count"));
    }
    let mut c = 3;
    let dst = vm.ea(kinds[3], w, &mut c)?;
    let body = vm.alloc_context(argc as usize, func.code_addr)?;
    let h = vm.pool.acquire_with(type_id, Payload::Context(body));
    vm.store(&dst, h);
    vm.release_handle(h);
    Ok(Flow::Next)
}

/// `resume EA`: transfers control into another context.
pub(super) fn resume_op(vm: &mut Vm, op: OpCode, w: &[i32], pc: i32) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let slot = vm.ea(kinds[0], w, &mut c)?;
    let h = vm.load(&slot);
    if vm.config.runtime_checks {
        let type_id = vm.pool.handle(h).type_id;
        let family = vm.image.type_info(type_id)?.family;
        if family != TypeFamily::Thread {
            return Err(VmError::unsupported_type(type_id, "resume"));
        }
    }
    let target = vm
        .pool
        .handle(h)
        .as_context()
        .cloned()
        .ok_or_else(|| VmError::unsupported_type(vm.pool.handle(h).type_id, "resume"))?;
    let current = vm.current_context();
    current.borrow_mut().pc = pc + op.size() as i32;
    target.borrow_mut().yield_to = Some(current);
    vm.current = Some(target);
    Ok(Flow::Switched)
}

/// `yield`: returns control to the resumer, transferring r1.
pub(super) fn yield_op(vm: &mut Vm, pc: i32) -> VmResult<Flow> {
    let current = vm.current_context();
    let target = current
        .borrow()
        .yield_to
        .clone()
        .ok_or_else(|| VmError::invalid_operand("yield without a resumer"))?;
    current.borrow_mut().pc = pc + 1;
    let value = current.borrow().register(RETURN_REGISTER);
    vm.current = Some(target.clone());
    // transfer the return register into the resumer
    vm.pool.add_ref(value);
    let old = {
        let mut t = target.borrow_mut();
        let old = t.register(RETURN_REGISTER);
        t.set_register(RETURN_REGISTER, value);
        old
    };
    vm.release_handle(old);
    Ok(Flow::Switched)
}
