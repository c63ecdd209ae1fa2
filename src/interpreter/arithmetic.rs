//! Arithmetic, bitwise, comparison and string/array accumulation handlers.
//!
//! Binary operations are `op SRC, DST` with the result written into the
//! destination handle's payload in place; the compiler guarantees the
//! destination is a private copy wherever that matters. Compare-and-set
//! writes a fresh 0/1 int handle into its third operand.

use crate::error::{VmError, VmResult};
use crate::execution_engine::Vm;
use crate::handle::Payload;
use crate::op_code::OpCode;

use super::Flow;

/// Numeric mode of an opcode family: generic dispatches on the operand
/// type, the suffixed families assert int or float.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum Num {
    Generic,
    Int,
    Float,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum Binary {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    And,
    Or,
    Xor,
    Asl,
    Asr,
    Lsl,
    Lsr,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum Unary {
    Inc,
    Dec,
    Neg,
    Not,
    Unot,
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum Compare {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Binary {
    fn int(self, lhs: i64, rhs: i64) -> VmResult<i64> {
        Ok(match self {
            Binary::Add => lhs.wrapping_add(rhs),
            Binary::Sub => lhs.wrapping_sub(rhs),
            Binary::Mul => lhs.wrapping_mul(rhs),
            Binary::Div => {
                if rhs == 0 {
                    return Err(VmError::division_by_zero("div"));
                }
                lhs.wrapping_div(rhs)
            }
            Binary::Mod => {
                if rhs == 0 {
                    return Err(VmError::division_by_zero("mod"));
                }
                lhs.wrapping_rem(rhs)
            }
            Binary::And => lhs & rhs,
            Binary::Or => lhs | rhs,
            Binary::Xor => lhs ^ rhs,
            Binary::Asl | Binary::Lsl => lhs.wrapping_shl(rhs as u32),
            Binary::Asr => lhs.wrapping_shr(rhs as u32),
            Binary::Lsr => (lhs as u64).wrapping_shr(rhs as u32) as i64,
        })
    }

    fn float(self, lhs: f64, rhs: f64) -> VmResult<f64> {
        Ok(match self {
            Binary::Add => lhs + rhs,
            Binary::Sub => lhs - rhs,
            Binary::Mul => lhs * rhs,
            Binary::Div => {
                if rhs == 0.0 {
                    return Err(VmError::division_by_zero("div"));
                }
                lhs / rhs
            }
            Binary::Mod => {
                if rhs == 0.0 {
                    return Err(VmError::division_by_zero("mod"));
                }
                lhs % rhs
            }
            _ => return Err(VmError::unsupported_type(crate::handle::TYPE_FLOAT, "bitwise")),
        })
    }
}

/// `op SRC, DST`: `DST = DST op SRC`, mutated in place.
pub(super) fn binary(vm: &mut Vm, op: OpCode, w: &[i32], bin: Binary, num: Num) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let sh = vm.load(&src);
    let dh = vm.load(&dst);
    let sv = vm.pool.handle(sh).payload.clone();
    let dv = vm.pool.handle(dh).payload.clone();
    match (dv, sv) {
        (Payload::Int(d), Payload::Int(s)) if num != Num::Float => {
            let v = bin.int(d, s)?;
            vm.pool.handle_mut(dh).payload = Payload::Int(v);
            Ok(Flow::Next)
        }
        (Payload::Float(d), Payload::Float(s)) if num != Num::Int => {
            let v = bin.float(d, s)?;
            vm.pool.handle_mut(dh).payload = Payload::Float(v);
            Ok(Flow::Next)
        }
        _ => Err(VmError::type_mismatch(
            match num {
                Num::Int => "int",
                Num::Float => "float",
                Num::Generic => "matching numeric operands",
            },
            format!(
                "{}, {}",
                vm.handle_type_name(dh),
                vm.handle_type_name(sh)
            ),
        )),
    }
}

/// In-place unary operation on one EA.
pub(super) fn unary(vm: &mut Vm, op: OpCode, w: &[i32], un: Unary, num: Num) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let slot = vm.ea(kinds[0], w, &mut c)?;
    let h = vm.load(&slot);
    let payload = vm.pool.handle(h).payload.clone();
    let new = match (payload, un, num) {
        (Payload::Int(v), Unary::Inc, n) if n != Num::Float => Payload::Int(v.wrapping_add(1)),
        (Payload::Int(v), Unary::Dec, n) if n != Num::Float => Payload::Int(v.wrapping_sub(1)),
        (Payload::Int(v), Unary::Neg, n) if n != Num::Float => Payload::Int(v.wrapping_neg()),
        (Payload::Int(v), Unary::Not, _) => Payload::Int(!v),
        (Payload::Int(v), Unary::Unot, _) => Payload::Int((v == 0) as i64),
        (Payload::Float(v), Unary::Inc, n) if n != Num::Int => Payload::Float(v + 1.0),
        (Payload::Float(v), Unary::Dec, n) if n != Num::Int => Payload::Float(v - 1.0),
        (Payload::Float(v), Unary::Neg, n) if n != Num::Int => Payload::Float(-v),
        _ => {
            return Err(VmError::unsupported_type(
                vm.pool.handle(h).type_id,
                op.mnemonic(),
            ))
        }
    };
    vm.pool.handle_mut(h).payload = new;
    Ok(Flow::Next)
}

/// `cmp SRC, LHS, DST`: writes `LHS op SRC` as a 0/1 int into DST.
pub(super) fn compare(vm: &mut Vm, op: OpCode, w: &[i32], cmp: Compare, num: Num) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let lhs = vm.ea(kinds[1], w, &mut c)?;
    let dst = vm.ea(kinds[2], w, &mut c)?;
    let sh = vm.load(&src);
    let lh = vm.load(&lhs);
    let sv = vm.pool.handle(sh).payload.clone();
    let lv = vm.pool.handle(lh).payload.clone();
    let result = match (lv, sv) {
        (Payload::Int(l), Payload::Int(s)) if num != Num::Float => match cmp {
            Compare::Eq => l == s,
            Compare::Ne => l != s,
            Compare::Gt => l > s,
            Compare::Ge => l >= s,
            Compare::Lt => l < s,
            Compare::Le => l <= s,
        },
        (Payload::Float(l), Payload::Float(s)) if num != Num::Int => match cmp {
            Compare::Eq => l == s,
            Compare::Ne => l != s,
            Compare::Gt => l > s,
            Compare::Ge => l >= s,
            Compare::Lt => l < s,
            Compare::Le => l <= s,
        },
        _ => {
            return Err(VmError::type_mismatch(
                "matching numeric operands",
                format!("{}, {}", vm.handle_type_name(lh), vm.handle_type_name(sh)),
            ))
        }
    };
    store_int_result(vm, &dst, result as i64);
    Ok(Flow::Next)
}

/// `snul`/`snnul`: tests whether the source handle is null.
pub(super) fn snul_op(vm: &mut Vm, op: OpCode, w: &[i32], want_null: bool) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let is_null = vm.pool.handle(vm.load(&src)).is_null();
    store_int_result(vm, &dst, (is_null == want_null) as i64);
    Ok(Flow::Next)
}

/// `cmpref`: reference identity of two registers.
pub(super) fn cmpref_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let a = vm.ea(kinds[0], w, &mut c)?;
    let b = vm.ea(kinds[1], w, &mut c)?;
    let dst = vm.ea(kinds[2], w, &mut c)?;
    let equal = vm.load(&a) == vm.load(&b);
    store_int_result(vm, &dst, equal as i64);
    Ok(Flow::Next)
}

/// `streq`/`strne`: string content comparison.
pub(super) fn strcmp_op(vm: &mut Vm, op: OpCode, w: &[i32], want_equal: bool) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let lhs = vm.ea(kinds[1], w, &mut c)?;
    let dst = vm.ea(kinds[2], w, &mut c)?;
    let sh = vm.load(&src);
    let lh = vm.load(&lhs);
    let sb = vm
        .pool
        .handle(sh)
        .as_str()
        .cloned()
        .ok_or_else(|| VmError::type_mismatch("string", vm.handle_type_name(sh)))?;
    let lb = vm
        .pool
        .handle(lh)
        .as_str()
        .cloned()
        .ok_or_else(|| VmError::type_mismatch("string", vm.handle_type_name(lh)))?;
    let equal = *sb.borrow() == *lb.borrow();
    store_int_result(vm, &dst, (equal == want_equal) as i64);
    Ok(Flow::Next)
}

/// `stradd SRC, DST`: appends the source string to the destination string
/// in place.
pub(super) fn stradd_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let sh = vm.load(&src);
    let dh = vm.load(&dst);
    let sb = vm
        .pool
        .handle(sh)
        .as_str()
        .cloned()
        .ok_or_else(|| VmError::type_mismatch("string", vm.handle_type_name(sh)))?;
    let db = vm
        .pool
        .handle(dh)
        .as_str()
        .cloned()
        .ok_or_else(|| VmError::type_mismatch("string", vm.handle_type_name(dh)))?;
    let text = sb.borrow().clone();
    db.borrow_mut().push_str(&text);
    Ok(Flow::Next)
}

/// `arrcp`/`arrmv` `SRC, DST`: appends to the destination array. An array
/// source is appended element-wise; `arrcp` appends value-type copies,
/// `arrmv` appends references.
pub(super) fn arradd_op(vm: &mut Vm, op: OpCode, w: &[i32], copy: bool) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let sh = vm.load(&src);
    let dh = vm.load(&dst);
    let db = vm
        .pool
        .handle(dh)
        .as_array()
        .cloned()
        .ok_or_else(|| VmError::type_mismatch("array", vm.handle_type_name(dh)))?;
    let incoming: Vec<crate::handle::HandleRef> = match vm.pool.handle(sh).as_array() {
        Some(sb) => sb.borrow().clone(),
        None => vec![sh],
    };
    let mut appended = Vec::with_capacity(incoming.len());
    for h in incoming {
        if copy {
            appended.push(vm.pool.copy_value_type(h));
        } else {
            vm.pool.add_ref(h);
            appended.push(h);
        }
    }
    db.borrow_mut().extend(appended);
    Ok(Flow::Next)
}

/// `cvf`: int to float.
pub(super) fn cvf_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let sh = vm.load(&src);
    let v = vm
        .pool
        .handle(sh)
        .as_int()
        .ok_or_else(|| VmError::type_mismatch("int", vm.handle_type_name(sh)))?;
    let new = vm.pool.new_float(v as f64);
    vm.store(&dst, new);
    vm.release_handle(new);
    Ok(Flow::Next)
}

/// `cvl`: float to int, truncating.
pub(super) fn cvl_op(vm: &mut Vm, op: OpCode, w: &[i32]) -> VmResult<Flow> {
    let kinds = op.operand_kinds();
    let mut c = 0;
    let src = vm.ea(kinds[0], w, &mut c)?;
    let dst = vm.ea(kinds[1], w, &mut c)?;
    let sh = vm.load(&src);
    let v = vm
        .pool
        .handle(sh)
        .as_float()
        .ok_or_else(|| VmError::type_mismatch("float", vm.handle_type_name(sh)))?;
    let new = vm.pool.new_int(v as i64);
    vm.store(&dst, new);
    vm.release_handle(new);
    Ok(Flow::Next)
}

pub(super) fn store_int_result(vm: &mut Vm, dst: &super::Slot, v: i64) {
    let new = vm.pool.new_int(v);
    vm.store(dst, new);
    vm.release_handle(new);
}
