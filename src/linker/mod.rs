//! The linker: turns compiled per-function bytecode into the executable
//! program image.
//!
//! [`link_main`] walks every class in definition order, fixes instance
//! sizes and v-tables in the runtime type info, links each function
//! (synthesizing stubs for bodies the code generator left empty), copies
//! the finished code into the code segment and records addresses in the
//! function segment. [`post_link`] then rewrites `calls` into direct
//! `jsr`s and patches `jmp` operands to code addresses — a one-way
//! transformation; there is no unlinking.

pub mod code_block;
pub mod optimizer;

use log::warn;

use crate::error::{VmError, VmResult};
use crate::execution_context::{
    FIRST_SAVED_REGISTER, NUM_REGISTERS, RETURN_REGISTER, THIS_REGISTER,
};
use crate::handle::TypeFamily;
use crate::op_code::{OpCode, OperandKind};
use crate::program::{DataValue, ProgramImage};

pub use code_block::CodeBlock;
pub use optimizer::OptimizeReport;

/// A literal referenced by a function body.
#[derive(Debug, Clone)]
pub enum LiteralValue {
    /// An int literal.
    Int(i64),
    /// A float literal.
    Float(f64),
    /// A string literal.
    Str(String),
    /// A delegate literal whose data handle already exists.
    DelegateData(i32),
}

/// One literal patch site: the `moveh`/`copyh` operand at `offset` receives
/// the data-segment index of the literal.
#[derive(Debug, Clone)]
pub struct Literal {
    /// The literal value.
    pub value: LiteralValue,
    /// Word index of the operand to patch inside the function body.
    pub offset: usize,
    /// Data-segment index once created (0 = not yet).
    pub data_index: i32,
}

impl Literal {
    /// Creates an unresolved literal patch site.
    pub fn new(value: LiteralValue, offset: usize) -> Self {
        Self {
            value,
            offset,
            data_index: 0,
        }
    }
}

/// A compiled function awaiting linking.
#[derive(Debug, Clone)]
pub struct FuncDef {
    /// Function id (index into the function segment).
    pub fn_id: i32,
    /// Pretty-printed declaration for diagnostics.
    pub name: String,
    /// Number of stack arguments.
    pub args: usize,
    /// The function body; may be empty for stubs and inherited methods.
    pub code: Vec<i32>,
    /// Literal patch sites in the body.
    pub literals: Vec<Literal>,
    /// Coroutine body (gets the yield-forever stub, no register saving).
    pub is_cofunc: bool,
    /// Member function (affects the delegate-forward stub).
    pub is_method: bool,
    /// Excluded from register saving (module init code).
    pub naked: bool,
    /// Strict functions never get an auto-completed body.
    pub strict: bool,
    /// Declared through an interface; affects the missing-body diagnostic.
    pub inherited: bool,
    /// Source class for relocation / base-method / base-delegate links.
    pub link_class: i32,
    /// Function index in the source class to relocate, or -1.
    pub link_rel_idx: i32,
    /// Base method index to tail-jump into, or -1.
    pub link_method: i32,
    /// Member slot of the base delegate to forward to, or -1.
    pub link_delegate: i32,
    /// Offset of the base class's members inside this class's layout.
    pub var_offset: i32,
    /// Bitmask of registers used as local variables.
    pub local_regs: u32,
    /// Optimization level 0-3.
    pub opt_level: u8,
    /// Set once the function has been linked.
    pub linked: bool,
    /// Code segment address after linking.
    pub link_addr: i32,
}

impl FuncDef {
    /// Creates a plain function definition with a body.
    pub fn new(fn_id: i32, name: impl Into<String>, args: usize, code: Vec<i32>) -> Self {
        Self {
            fn_id,
            name: name.into(),
            args,
            code,
            literals: Vec::new(),
            is_cofunc: false,
            is_method: false,
            naked: false,
            strict: false,
            inherited: false,
            link_class: -1,
            link_rel_idx: -1,
            link_method: -1,
            link_delegate: -1,
            var_offset: 0,
            local_regs: 0,
            opt_level: 0,
            linked: false,
            link_addr: 0,
        }
    }
}

/// A compiled class awaiting linking. `type_id` must reference an entry
/// the host already added to the image's type segment.
#[derive(Debug, Clone)]
pub struct ClassDef {
    /// The runtime type id.
    pub type_id: i32,
    /// Number of member variables (becomes the instance size).
    pub var_count: usize,
    /// Member functions, in v-table slot order.
    pub funcs: Vec<FuncDef>,
}

/// A compiled module: classes in definition order.
#[derive(Debug, Clone, Default)]
pub struct Module {
    /// The classes, global functions living in a class of their own.
    pub classes: Vec<ClassDef>,
}

/// Links every class and function of `module` into `image`.
pub fn link_main(module: &mut Module, image: &mut ProgramImage) -> VmResult<()> {
    let mut address = image.code.len() as i32;
    for class_idx in 0..module.classes.len() {
        let (type_id, family, native) = {
            let class = &module.classes[class_idx];
            let info = image.type_info(class.type_id)?;
            (class.type_id, info.family, info.native)
        };
        if family != TypeFamily::Class && family != TypeFamily::Thread {
            continue;
        }
        if !native {
            // fix the instance size and populate the v-table
            let class = &module.classes[class_idx];
            let vtable: Vec<i32> = class.funcs.iter().map(|f| f.fn_id).collect();
            let var_count = class.var_count;
            let vtab_offset = if vtable.is_empty() {
                -1
            } else {
                image.cstr.add_vtable(&vtable) as i32
            };
            let info = &mut image.types[type_id as usize];
            if family == TypeFamily::Class {
                info.instance_size = var_count;
            }
            info.vtable_offset = vtab_offset;
        }
        for func_idx in 0..module.classes[class_idx].funcs.len() {
            if native {
                continue;
            }
            link_function(module, image, class_idx, func_idx)?;
            let func = &mut module.classes[class_idx].funcs[func_idx];
            if func.code.is_empty() {
                return Err(if func.inherited {
                    VmError::InterfaceNotComplete {
                        decl: func.name.clone(),
                    }
                } else {
                    VmError::NoFunctionBody {
                        decl: func.name.clone(),
                    }
                });
            }
            // copy the finished body into the code segment
            image.code.extend_from_slice(&func.code);
            let fn_id = func.fn_id as usize;
            if fn_id >= image.functions.len() {
                return Err(VmError::InvalidFunctionIndex { index: func.fn_id });
            }
            image.functions[fn_id].code_addr = address;
            image.functions[fn_id].code_size = func.code.len() as i32;
            image.functions[fn_id].args = func.args;
            func.link_addr = address;
            address += func.code.len() as i32;
        }
    }
    Ok(())
}

/// Links one function: synthesizes a stub if the body is empty, creates
/// literal handles, inserts register saving and runs the optimizer.
/// Idempotent.
pub fn link_function(
    module: &mut Module,
    image: &mut ProgramImage,
    class_idx: usize,
    func_idx: usize,
) -> VmResult<()> {
    {
        let func = &module.classes[class_idx].funcs[func_idx];
        if func.linked {
            return Ok(());
        }
    }
    let needs_stub = {
        let func = &module.classes[class_idx].funcs[func_idx];
        func.code.is_empty()
            && (!func.strict
                || func.link_delegate >= 0
                || func.link_method >= 0
                || func.link_rel_idx >= 0)
    };
    if needs_stub {
        let (cofunc, rel_idx, method, delegate) = {
            let f = &module.classes[class_idx].funcs[func_idx];
            (f.is_cofunc, f.link_rel_idx, f.link_method, f.link_delegate)
        };
        if rel_idx < 0 && method < 0 && delegate < 0 {
            let f = &module.classes[class_idx].funcs[func_idx];
            warn!("function body auto-completed: {}", f.name);
        }
        if cofunc {
            let null_ix = ensure_null_literal(image) as i32;
            let func = &mut module.classes[class_idx].funcs[func_idx];
            func.code = vec![
                OpCode::MovehR as i32,
                null_ix,
                RETURN_REGISTER as i32,
                OpCode::Yield as i32,
                OpCode::Bra as i32,
                -1,
            ];
        } else if rel_idx >= 0 {
            relocate_function(module, image, class_idx, func_idx)?;
            module.classes[class_idx].funcs[func_idx].linked = true;
            return Ok(());
        } else if method >= 0 {
            let link_class = module.classes[class_idx].funcs[func_idx].link_class;
            let base_fn = base_func_id(module, link_class, method)?;
            let func = &mut module.classes[class_idx].funcs[func_idx];
            func.code = vec![OpCode::Jmp as i32, base_fn];
        } else if delegate >= 0 {
            let (is_method, args) = {
                let f = &module.classes[class_idx].funcs[func_idx];
                (f.is_method, f.args)
            };
            let func = &mut module.classes[class_idx].funcs[func_idx];
            func.code = delegate_forward_stub(is_method, args, delegate);
        } else {
            let null_ix = ensure_null_literal(image) as i32;
            let func = &mut module.classes[class_idx].funcs[func_idx];
            func.code = vec![
                OpCode::MovehR as i32,
                null_ix,
                RETURN_REGISTER as i32,
                OpCode::Ret as i32,
            ];
        }
    }
    create_literals(image, &mut module.classes[class_idx].funcs[func_idx]);
    insert_register_saving(&mut module.classes[class_idx].funcs[func_idx]);
    {
        let func = &mut module.classes[class_idx].funcs[func_idx];
        let mut block = CodeBlock::new(std::mem::take(&mut func.code));
        let mut report = OptimizeReport::default();
        optimizer::optimize(&mut block, func.opt_level, func.local_regs, &mut report)?;
        func.code = block.code;
        func.linked = true;
    }
    Ok(())
}

fn base_func_id(module: &Module, link_class: i32, method: i32) -> VmResult<i32> {
    let base = module
        .classes
        .iter()
        .find(|c| c.type_id == link_class)
        .ok_or_else(|| VmError::RelocationFailed {
            reason: format!("unknown base class {}", link_class),
        })?;
    base.funcs
        .get(method as usize)
        .map(|f| f.fn_id)
        .ok_or_else(|| VmError::RelocationFailed {
            reason: format!("base method {} out of range", method),
        })
}

/// The stub forwarding a call to a base-class delegate stored in member
/// slot `slot` of `this`: push r0, re-push the shifted arguments, call the
/// delegate through the member, pop everything and return.
fn delegate_forward_stub(is_method: bool, args: usize, slot: i32) -> Vec<i32> {
    let mut code = Vec::new();
    let mut shift = 0;
    if is_method {
        code.extend_from_slice(&[OpCode::PushR as i32, THIS_REGISTER as i32]);
        shift += 1;
        if args > 0 {
            if args > 1 {
                code.extend_from_slice(&[OpCode::Pushm as i32, args as i32]);
            } else {
                code.push(OpCode::Push as i32);
            }
            for i in 0..args {
                code.extend_from_slice(&[
                    OpCode::MoveSS as i32,
                    (args + shift + i) as i32,
                    i as i32,
                ]);
            }
        }
    }
    code.extend_from_slice(&[OpCode::CalldgD as i32, 0, slot]);
    if is_method {
        if args > 0 {
            if args > 1 {
                code.extend_from_slice(&[OpCode::Popm as i32, args as i32]);
            } else {
                code.push(OpCode::Pop as i32);
            }
        }
        code.extend_from_slice(&[OpCode::PopR as i32, THIS_REGISTER as i32]);
    }
    code.push(OpCode::Ret as i32);
    code
}

/// Ensures the data segment holds a null literal and returns its index.
fn ensure_null_literal(image: &mut ProgramImage) -> usize {
    for (i, d) in image.data.iter().enumerate() {
        if d.value == DataValue::Null {
            return i;
        }
    }
    image.add_data(DataValue::Null)
}

/// Creates data-segment entries for the function's literals and patches
/// the `moveh`/`copyh` operands in its body.
fn create_literals(image: &mut ProgramImage, func: &mut FuncDef) {
    for lit in &mut func.literals {
        if lit.data_index == 0 {
            let ix = match &lit.value {
                LiteralValue::Int(v) => image.add_data(DataValue::Int(*v)),
                LiteralValue::Float(v) => image.add_data(DataValue::Float(*v)),
                LiteralValue::Str(s) => image.add_string_literal(s),
                LiteralValue::DelegateData(ix) => *ix as usize,
            };
            lit.data_index = ix as i32;
        }
        func.code[lit.offset] = lit.data_index;
    }
}

/// Determines which of r3..r31 the body initializes and wraps the function
/// in matching save/restore code, fixing stack-relative operands for the
/// grown frame.
fn insert_register_saving(func: &mut FuncDef) {
    if func.is_cofunc || func.naked {
        return;
    }
    let mut block = CodeBlock::new(std::mem::take(&mut func.code));
    let mut to_save: Vec<i32> = Vec::new();
    for reg in FIRST_SAVED_REGISTER..NUM_REGISTERS {
        if register_initialized_anywhere(&block, reg) {
            to_save.push(reg as i32);
        }
    }
    if !to_save.is_empty() {
        // contiguous save range starting at r3
        let first = FIRST_SAVED_REGISTER as i32;
        let count = to_save.last().expect("non-empty") - first + 1;
        let mut visited = Vec::new();
        let block_len = block.len();
        optimizer::fix_stack_offsets(&mut block, 0, block_len, count, 0, &mut visited);
        if count == 1 {
            block.insert_code(0, 2, false);
            block.write(0, &[OpCode::PushR as i32, first]);
        } else {
            block.insert_code(0, 3, false);
            block.write(0, &[OpCode::PushRange as i32, first, count]);
        }
        let mut addr = 0;
        while addr < block.len() {
            let size = block.instr_size_at(addr);
            if size == 0 {
                break;
            }
            if block.opcode_at(addr) == Some(OpCode::Ret) {
                if count == 1 {
                    block.insert_code(addr, 2, false);
                    block.write(addr, &[OpCode::PopR as i32, first]);
                    addr += 2 + size;
                    continue;
                } else {
                    block.insert_code(addr, 3, false);
                    block.write(addr, &[OpCode::PopRange as i32, first, count]);
                    addr += 3 + size;
                    continue;
                }
            }
            addr += size;
        }
    }
    func.code = block.code;
}

fn register_initialized_anywhere(block: &CodeBlock, reg: usize) -> bool {
    let mut addr = 0;
    while addr < block.len() {
        let size = block.instr_size_at(addr);
        if size == 0 {
            return false;
        }
        if optimizer::init_register(block, addr) == Some(reg) {
            return true;
        }
        addr += size;
    }
    false
}

/// Rewrites every `calls FN` into `jsr ADDR` and patches `jmp FN` operands
/// to code addresses. Destructive: the function segment must not change
/// afterwards.
pub fn post_link(module: &Module, image: &mut ProgramImage) -> VmResult<()> {
    for class in &module.classes {
        for func in &class.funcs {
            let mut addr = func.link_addr as usize;
            let end = addr + func.code.len();
            while addr < end {
                let word = image.code[addr];
                let size = OpCode::instruction_size(word);
                if size == 0 {
                    break;
                }
                match OpCode::from_word(word) {
                    Some(OpCode::Calls) => {
                        let target = image.func_info(image.code[addr + 1])?.code_addr;
                        image.code[addr] = OpCode::Jsr as i32;
                        image.code[addr + 1] = target;
                    }
                    Some(OpCode::Jmp) => {
                        let target = image.func_info(image.code[addr + 1])?.code_addr;
                        image.code[addr + 1] = target;
                    }
                    _ => {}
                }
                addr += size;
            }
        }
    }
    Ok(())
}

/// Fills a derived class's slot by cloning the base function's code and
/// retargeting type ids, member displacements and call targets to the
/// derived class (inheritance by code duplication).
fn relocate_function(
    module: &mut Module,
    image: &ProgramImage,
    class_idx: usize,
    func_idx: usize,
) -> VmResult<()> {
    let (src_type, src_func_idx, dst_type, var_offset, func_name) = {
        let class = &module.classes[class_idx];
        let f = &class.funcs[func_idx];
        (
            f.link_class,
            f.link_rel_idx,
            class.type_id,
            f.var_offset,
            f.name.clone(),
        )
    };
    let src_code = {
        let src_class = module
            .classes
            .iter()
            .find(|c| c.type_id == src_type)
            .ok_or_else(|| VmError::RelocationFailed {
                reason: format!("unknown source class {}", src_type),
            })?;
        src_class
            .funcs
            .get(src_func_idx as usize)
            .ok_or_else(|| VmError::RelocationFailed {
                reason: format!("source function {} out of range", src_func_idx),
            })?
            .code
            .clone()
    };

    // map of (relocated-from slot) -> (slot, fn_id) in the derived class
    let slot_map: Vec<(i32, i32, i32)> = module.classes[class_idx]
        .funcs
        .iter()
        .enumerate()
        .filter(|(_, f)| f.link_class == src_type && f.link_rel_idx >= 0)
        .map(|(slot, f)| (f.link_rel_idx, slot as i32, f.fn_id))
        .collect();
    let find_slot = |src_slot: i32| -> VmResult<(i32, i32)> {
        slot_map
            .iter()
            .find(|(from, _, _)| *from == src_slot)
            .map(|(_, slot, fn_id)| (*slot, *fn_id))
            .ok_or_else(|| VmError::RelocationFailed {
                reason: format!("no derived counterpart for slot {}", src_slot),
            })
    };

    let mut block = CodeBlock::new(src_code);
    let mut addr = 0;
    while addr < block.len() {
        let size = block.instr_size_at(addr);
        if size == 0 {
            break;
        }
        let mut info = block.decode(addr)?;
        if moves_this_unsafely(&info) {
            warn!("unsafe operation on this reference: {}", func_name);
        }
        let op = block.opcode_at(addr).expect("decoded above");
        let mut update = false;
        match op.base() {
            OpCode::Callm => {
                if info.operands[0].data[0] == src_type {
                    let (slot, _) = find_slot(info.operands[1].data[0])?;
                    info.operands[0].data[0] = dst_type;
                    info.operands[1].data[0] = slot;
                    update = true;
                }
            }
            OpCode::Calls => {
                let callee = image.func_info(info.operands[0].data[0])?;
                if callee.type_id == src_type {
                    let (_, fn_id) = find_slot(callee.member_idx)?;
                    info.operands[0].data[0] = fn_id;
                    update = true;
                }
            }
            OpCode::Newdgm => {
                // a delegate bound to `this` follows the relocation
                if info.operands[2].data[0] == THIS_REGISTER as i32 {
                    let (slot, _) = find_slot(info.operands[1].data[0])?;
                    info.operands[1].data[0] = slot;
                    update = true;
                }
            }
            OpCode::Newdg => {
                let callee = image.func_info(info.operands[1].data[0])?;
                if callee.type_id == src_type {
                    let (_, fn_id) = find_slot(callee.member_idx)?;
                    info.operands[1].data[0] = fn_id;
                    update = true;
                }
            }
            _ => {
                for operand in info.operands.iter_mut() {
                    match operand.kind {
                        Some(OperandKind::Type) => {
                            if operand.data[0] == src_type {
                                operand.data[0] = dst_type;
                                update = true;
                            }
                        }
                        Some(OperandKind::RegDisp) => {
                            // member access through `this` shifts by the
                            // derived class's variable offset
                            if operand.data[0] == THIS_REGISTER as i32 {
                                operand.data[1] += var_offset;
                                update = true;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        if update {
            let words = info.encode()?;
            if words.len() != size {
                return Err(VmError::RelocationFailed {
                    reason: format!("re-encoding changed size at {}", addr),
                });
            }
            block.write(addr, &words);
        }
        addr += size;
    }
    module.classes[class_idx].funcs[func_idx].code = block.code;
    Ok(())
}

/// True if the instruction moves r0 anywhere other than into r1.
fn moves_this_unsafely(info: &crate::instruction::OpcodeInfo) -> bool {
    if !matches!(info.base, OpCode::MoveRR | OpCode::CopyRR | OpCode::WrefRR) {
        return false;
    }
    let src = &info.operands[0];
    if src.kind != Some(OperandKind::Reg) || src.data[0] != THIS_REGISTER as i32 {
        return false;
    }
    !info.operands[1].is_reg(RETURN_REGISTER as i32)
}
