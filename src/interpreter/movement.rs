//! Movement, stack and query handlers: move/copy/wref, literal
//! materialization, push/pop families, size/type queries, runtime type
//! checks and dynamic conversion.

use crate::error::{VmError, VmResult};
use crate::execution_engine::Vm;
use crate::handle::Payload;
use crate::op_code::OpCode;

use super::Flow;

/// `move SRC, DST`: transfers a reference.
pub(super) fn move_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let h = vm.load(&src);
    vm.store(&dst, h);
    Ok(Flow::Next)
}

/// `copy SRC, DST`: int and float get a fresh physical copy, everything
/// else goes through the deep copy.
pub(super) fn copy_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let sh = vm.load(&src);
    let payload = vm.pool.handle(sh).payload.clone();
    let new = match payload {
        Payload::Int(v) => vm.pool.new_int(v),
        Payload::Float(v) => vm.pool.new_float(v),
        _ => vm.copy_handle(sh)?,
    };
    vm.store(&dst, new);
    vm.release_handle(new);
    Ok(Flow::Next)
}

/// `wref SRC, DST`: stores a weak reference to the source.
pub(super) fn wref_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let sh = vm.load(&src);
    let weak = vm.pool.weak_ref(sh);
    vm.store(&dst, weak);
    vm.release_handle(weak);
    Ok(Flow::Next)
}

/// `moveh LIT, DST`: stores the materialized data-segment handle.
pub(super) fn moveh_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let ix = w[0] as usize;
    let mut c = 1;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let h = data_handle(vm, ix)?;
    vm.store(&dst, h);
    Ok(Flow::Next)
}

/// `copyh LIT, DST`: stores a deep copy of the data-segment handle.
pub(super) fn copyh_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let ix = w[0] as usize;
    let mut c = 1;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let h = data_handle(vm, ix)?;
    let new = vm.copy_handle(h)?;
    vm.store(&dst, new);
    vm.release_handle(new);
    Ok(Flow::Next)
}

fn data_handle(vm: &Vm, ix: usize) -> VmResult<crate::handle::HandleRef> {
    vm.image
        .data
        .get(ix)
        .and_then(|d| d.handle)
        .ok_or_else(|| VmError::invalid_operand(format!("data handle {}", ix)))
}

/// `ldz DST`: stores a fresh integer zero.
pub(super) fn ldz_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let dst = vm.ea(kinds[0], w, &mut c)?;
    let new = vm.pool.new_int(0);
    vm.store(&dst, new);
    vm.release_handle(new);
    Ok(Flow::Next)
}

/// `push` (bare): pushes one null reference. `push EA`: pushes the EA's
/// handle.
pub(super) fn push_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let h = if kinds.is_empty() {
        vm.pool.null_ref()
    } else {
        let mut c = 0;
        let slot = vm.ea(kinds[0], w, &mut c)?;
        vm.load(&slot)
    };
    vm.pool.add_ref(h);
    let ctx = vm.current_context();
    let pushed = ctx.borrow_mut().push_data(h);
    if pushed.is_err() {
        vm.release_handle(h);
    }
    pushed?;
    Ok(Flow::Next)
}

/// `pop` (bare): pops and releases. `pop EA`: pops into the EA.
pub(super) fn pop_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    if kinds.is_empty() {
        let ctx = vm.current_context();
        let h = ctx.borrow_mut().pop_data()?;
        vm.release_handle(h);
    } else {
        let mut c = 0;
        let slot = vm.ea(kinds[0], w, &mut c)?;
        let ctx = vm.current_context();
        let h = ctx.borrow_mut().pop_data()?;
        vm.store(&slot, h);
        vm.release_handle(h);
    }
    Ok(Flow::Next)
}

/// `pushm N`: pushes N null references.
pub(super) fn pushm_op(vm: &mut Vm, w: &[i32]) -> VmResult<Flow> {
    let n = w[0];
    if n < 0 {
        return Err(VmError::invalid_operand("negative push count"));
    }
    let null = vm.pool.null_ref();
    let ctx = vm.current_context();
    for _ in 0..n {
        ctx.borrow_mut().push_data(null)?;
        vm.pool.add_ref(null);
    }
    Ok(Flow::Next)
}

/// `popm N`: pops and releases N entries.
pub(super) fn popm_op(vm: &mut Vm, w: &[i32]) -> VmResult<Flow> {
    let n = w[0];
    if n < 0 {
        return Err(VmError::invalid_operand("negative pop count"));
    }
    let ctx = vm.current_context();
    for _ in 0..n {
        let h = ctx.borrow_mut().pop_data()?;
        vm.release_handle(h);
    }
    Ok(Flow::Next)
}

/// `pushr rF-rL`: pushes a register range, first register first.
pub(super) fn push_range_op(vm: &mut Vm, w: &[i32]) -> VmResult<Flow> {
    let first = w[0] as usize;
    let count = w[1] as usize;
    let ctx = vm.current_context();
    for i in 0..count {
        let h = vm.reg(first + i)?;
        vm.pool.add_ref(h);
        ctx.borrow_mut().push_data(h)?;
    }
    Ok(Flow::Next)
}

/// `popr rF-rL`: pops a register range, last register first.
pub(super) fn pop_range_op(vm: &mut Vm, w: &[i32]) -> VmResult<Flow> {
    let first = w[0] as usize;
    let count = w[1] as usize;
    let ctx = vm.current_context();
    for i in (0..count).rev() {
        let reg = first + i;
        if reg >= crate::execution_context::NUM_REGISTERS {
            return Err(VmError::invalid_operand(format!("register r{}", reg)));
        }
        let h = ctx.borrow_mut().pop_data()?;
        let old = {
            let mut c = ctx.borrow_mut();
            let old = c.register(reg);
            c.set_register(reg, h);
            old
        };
        vm.release_handle(old);
    }
    Ok(Flow::Next)
}

/// `size SRC, DST`: string length or array element count.
pub(super) fn size_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let sh = vm.load(&src);
    let size = match &vm.pool.handle(sh).payload {
        Payload::Str(s) => s.borrow().len() as i64,
        Payload::Array(a) => a.borrow().len() as i64,
        _ => {
            return Err(VmError::unsupported_type(
                vm.pool.handle(sh).type_id,
                "size",
            ))
        }
    };
    super::arithmetic::store_int_result(vm, &dst, size);
    Ok(Flow::Next)
}

/// `type SRC, DST`: the source handle's type id as an int.
pub(super) fn type_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let type_id = vm.pool.handle(vm.load(&src)).type_id;
    super::arithmetic::store_int_result(vm, &dst, type_id as i64);
    Ok(Flow::Next)
}

/// `rtchk TYPE, EA`: runtime type assertion.
pub(super) fn rtchk_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let type_id = w[0];
    let mut c = 1;
    let slot = vm.ea(kinds[1], w, &mut c)?;
    let h = vm.load(&slot);
    if !vm.rt_check(type_id, h) {
        return Err(VmError::type_mismatch(
            vm.image.type_name(type_id),
            vm.handle_type_name(h),
        ));
    }
    Ok(Flow::Next)
}

/// `dcvt TYPE, SRC, DST`: dynamic conversion.
pub(super) fn dcvt_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let type_id = w[0];
    let mut c = 1;
    let src = vm.ea(kinds[1], w, &mut c)?;
    let dst = vm.ea(kinds[2], w, &mut c)?;
    let sh = vm.load(&src);
    let new = vm.dynamic_convert(type_id, sh)?;
    vm.store(&dst, new);
    vm.release_handle(new);
    Ok(Flow::Next)
}
