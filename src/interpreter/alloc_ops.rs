//! Allocation handlers: class instances, arrays, interface factories and
//! delegates.

use crate::error::{VmError, VmResult};
use crate::execution_engine::Vm;
use crate::handle::TypeFamily;
use crate::op_code::OpCode;

use super::Flow;

/// `alloc TYPE, DST`: a zero-initialized script class instance.
pub(super) fn alloc_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let type_id = w[0];
    if vm.config.runtime_checks {
        let info = vm.image.type_info(type_id)?;
        if info.family != TypeFamily::Class || info.native {
            return Err(VmError::unsupported_type(type_id, "alloc"));
        }
    }
    let mut c = 1;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let h = vm.alloc_object(type_id)?;
    vm.store(&dst, h);
    vm.release_handle(h);
    Ok(Flow::Next)
}

/// `allocn TYPE, DST`: a native class instance.
pub(super) fn allocn_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let type_id = w[0];
    if vm.config.runtime_checks {
        let info = vm.image.type_info(type_id)?;
        if info.family != TypeFamily::Class || !info.native {
            return Err(VmError::unsupported_type(type_id, "allocn"));
        }
    }
    let mut c = 1;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let h = vm.alloc_native_object(type_id)?;
    vm.store(&dst, h);
    vm.release_handle(h);
    Ok(Flow::Next)
}

/// `alloca TYPE, DIM, DST`: a multi-dimensional array; one dimension count
/// per level is read from the caller's stack.
pub(super) fn alloca_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let elem_type = w[0];
    let dim = w[1];
    let mut c = 2;
    let dst = vm.ea(kinds[2], w, &mut c)?;
    let h = vm.alloc_array_multi(elem_type, dim, 0)?;
    vm.store(&dst, h);
    vm.release_handle(h);
    Ok(Flow::Next)
}

/// `alloci IFACE, DST`: an interface factory array.
pub(super) fn alloci_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let iface = w[0];
    if vm.config.runtime_checks && vm.image.type_info(iface)?.family != TypeFamily::Interface {
        return Err(VmError::unsupported_type(iface, "alloci"));
    }
    let mut c = 1;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let h = vm.alloc_factory(iface)?;
    vm.store(&dst, h);
    vm.release_handle(h);
    Ok(Flow::Next)
}

/// `newdg TYPE, FN, DST`: a plain function delegate.
pub(super) fn newdg_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let type_id = w[0];
    let index = w[1];
    let mut c = 2;
    let dst = vm.ea(kinds[2], w, &mut c)?;
    let h = vm.alloc_delegate(type_id, index, None);
    vm.store(&dst, h);
    vm.release_handle(h);
    Ok(Flow::Next)
}

/// `newdgm TYPE, SLOT, OBJ, DST`: a method delegate bound to OBJ.
pub(super) fn newdgm_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let type_id = w[0];
    let index = w[1];
    let mut c = 2;
    let obj_slot = vm.ea(kinds[2], w, &mut c)?;
    let dst = vm.ea(kinds[3], w, &mut c)?;
    let obj = vm.load(&obj_slot);
    if vm.pool.handle(obj).is_null() {
        return Err(VmError::null_reference("newdgm"));
    }
    let h = vm.alloc_delegate(type_id, index, Some(obj));
    vm.store(&dst, h);
    vm.release_handle(h);
    Ok(Flow::Next)
}

/// `newdgc TYPE, COUNT, FN, DST`: a closure delegate capturing COUNT stack
/// slots.
pub(super) fn newdgc_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let type_id = w[0];
    let count = w[1];
    let index = w[2];
    if count < 0 {
        return Err(VmError::invalid_operand("negative capture count"));
    }
    let mut c = 3;
    let dst = vm.ea(kinds[3], w, &mut c)?;
    let h = vm.alloc_closure(type_id, index, count as usize, None)?;
    vm.store(&dst, h);
    vm.release_handle(h);
    Ok(Flow::Next)
}
