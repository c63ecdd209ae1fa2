//! The peephole optimizer: eight local rewrite passes over a function's
//! instruction array, gated by optimization level.
//!
//! Level 1 runs the push/pop combiner and the move merger; level 2 adds
//! temp-register copying, math/compare merging and operation-move
//! swapping; level 3 adds register replacing and register-saving cleanup.
//! Every rewrite goes through the code block's editing primitives, which
//! keep branch targets stable.

use crate::error::VmResult;
use crate::execution_context::NUM_REGISTERS;
use crate::instruction::{operands_independent, OpcodeInfo};
use crate::op_code::{OpCode, OperandKind};

use super::code_block::CodeBlock;

/// Operand roles of two-operand instructions.
const SRC: usize = 0;
const DST: usize = 1;

/// Counters reported by an optimization run.
#[derive(Debug, Clone, Copy, Default)]
pub struct OptimizeReport {
    /// Passes that changed something.
    pub passes_run: usize,
    /// Passes attempted.
    pub total_passes: usize,
    /// Instructions emitted by rewrites.
    pub instr_added: usize,
    /// Instructions removed by rewrites.
    pub instr_removed: usize,
}

/// Runs the passes selected by `opt_level` (0 disables everything).
/// `local_regs` is a bitmask of registers holding local variables; those
/// are never treated as mergeable temporaries.
pub fn optimize(
    block: &mut CodeBlock,
    opt_level: u8,
    local_regs: u32,
    report: &mut OptimizeReport,
) -> VmResult<()> {
    if opt_level == 0 || block.is_empty() {
        return Ok(());
    }
    combine_push_pop(block, report)?;
    move_operations(block, local_regs, report)?;
    if opt_level > 1 {
        temp_reg_copying(block, report)?;
        math_operations(block, report)?;
        compare_operations(block, report)?;
        operation_and_move(block, local_regs, report)?;
        if opt_level > 2 {
            register_replacing(block, report)?;
            register_saving(block, report)?;
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------
// instruction classification helpers
// ----------------------------------------------------------------------

fn get_move_to_register(block: &CodeBlock, addr: usize) -> Option<OpcodeInfo> {
    match block.opcode_at(addr)? {
        OpCode::MoveRR | OpCode::MoveDR | OpCode::MoveXR | OpCode::MoveSR | OpCode::MovehR => {
            block.decode(addr).ok()
        }
        _ => None,
    }
}

fn get_copy_to_register(block: &CodeBlock, addr: usize) -> Option<OpcodeInfo> {
    match block.opcode_at(addr)? {
        OpCode::CopyRR | OpCode::CopyDR | OpCode::CopyXR | OpCode::CopySR | OpCode::CopyhR => {
            block.decode(addr).ok()
        }
        _ => None,
    }
}

fn get_wref_to_register(block: &CodeBlock, addr: usize) -> Option<OpcodeInfo> {
    match block.opcode_at(addr)? {
        OpCode::WrefRR | OpCode::WrefDR | OpCode::WrefXR | OpCode::WrefSR => {
            block.decode(addr).ok()
        }
        _ => None,
    }
}

fn get_move_from_register(block: &CodeBlock, addr: usize) -> Option<OpcodeInfo> {
    let op = block.opcode_at(addr)?;
    let base = op.base();
    if !matches!(base, OpCode::MoveRR | OpCode::CopyRR | OpCode::WrefRR) {
        return None;
    }
    if op.operand_kinds().first() != Some(&OperandKind::Reg) {
        return None;
    }
    block.decode(addr).ok()
}

fn get_math_from_register(block: &CodeBlock, addr: usize) -> Option<OpcodeInfo> {
    let base = block.opcode_at(addr)?.base();
    let is_math = matches!(
        base,
        OpCode::AddRR
            | OpCode::SubRR
            | OpCode::MulRR
            | OpCode::DivRR
            | OpCode::ModRR
            | OpCode::AddlRR
            | OpCode::SublRR
            | OpCode::MullRR
            | OpCode::DivlRR
            | OpCode::ModlRR
            | OpCode::AddfRR
            | OpCode::SubfRR
            | OpCode::MulfRR
            | OpCode::DivfRR
            | OpCode::ModfRR
            | OpCode::StraddRR
            | OpCode::ArrcpRR
            | OpCode::ArrmvRR
    );
    if !is_math {
        return None;
    }
    block.decode(addr).ok()
}

fn get_compare_register(block: &CodeBlock, addr: usize) -> Option<OpcodeInfo> {
    let op = block.opcode_at(addr)?;
    let base = op.base();
    let is_cmp = matches!(
        base,
        OpCode::CseqRR
            | OpCode::CsneRR
            | OpCode::CsgtRR
            | OpCode::CsgeRR
            | OpCode::CsltRR
            | OpCode::CsleRR
            | OpCode::CseqlRR
            | OpCode::CsnelRR
            | OpCode::CsgtlRR
            | OpCode::CsgelRR
            | OpCode::CsltlRR
            | OpCode::CslelRR
            | OpCode::CseqfRR
            | OpCode::CsnefRR
            | OpCode::CsgtfRR
            | OpCode::CsgefRR
            | OpCode::CsltfRR
            | OpCode::CslefRR
            | OpCode::StreqRR
            | OpCode::StrneRR
    );
    // only the all-register variant is a candidate
    if !is_cmp || op.operand_kinds().iter().any(|k| *k != OperandKind::Reg) {
        return None;
    }
    block.decode(addr).ok()
}

/// The register an instruction initializes (overwrites with a fresh
/// reference), if any. Pop instructions are deliberately excluded; the
/// code generator never initializes a register through them.
pub(super) fn init_register(block: &CodeBlock, addr: usize) -> Option<usize> {
    let op = block.opcode_at(addr)?;
    let written = match op.base() {
        OpCode::LdzR => 0,
        OpCode::MoveRR
        | OpCode::CopyRR
        | OpCode::WrefRR
        | OpCode::MovehR
        | OpCode::CopyhR
        | OpCode::Alloc
        | OpCode::Allocn
        | OpCode::Alloci
        | OpCode::Cvf
        | OpCode::Cvl
        | OpCode::SnulRR
        | OpCode::SnnulRR
        | OpCode::Size
        | OpCode::Type => 1,
        OpCode::Alloca
        | OpCode::Newdg
        | OpCode::Dcvt
        | OpCode::CseqRR
        | OpCode::CsneRR
        | OpCode::CsgtRR
        | OpCode::CsgeRR
        | OpCode::CsltRR
        | OpCode::CsleRR
        | OpCode::CseqlRR
        | OpCode::CsnelRR
        | OpCode::CsgtlRR
        | OpCode::CsgelRR
        | OpCode::CsltlRR
        | OpCode::CslelRR
        | OpCode::CseqfRR
        | OpCode::CsnefRR
        | OpCode::CsgtfRR
        | OpCode::CsgefRR
        | OpCode::CsltfRR
        | OpCode::CslefRR
        | OpCode::StreqRR
        | OpCode::StrneRR
        | OpCode::CmprefRR => 2,
        OpCode::Newctx | OpCode::Newdgm | OpCode::Newdgc => 3,
        _ => return None,
    };
    let info = block.decode(addr).ok()?;
    let operand = &info.operands[written];
    if operand.kind == Some(OperandKind::Reg) {
        Some(operand.data[0] as usize)
    } else {
        None
    }
}

fn is_register_initialized(block: &CodeBlock, from: usize, reg: usize) -> bool {
    let mut addr = from;
    while addr < block.len() {
        let size = block.instr_size_at(addr);
        if size == 0 {
            break;
        }
        if init_register(block, addr) == Some(reg) {
            return true;
        }
        addr += size;
    }
    false
}

fn instruction_uses_register(block: &CodeBlock, addr: usize, reg: i32) -> bool {
    let Some(op) = block.opcode_at(addr) else {
        return false;
    };
    let mut at = addr + 1;
    for kind in op.operand_kinds() {
        match kind {
            OperandKind::Reg | OperandKind::RegDisp => {
                if block.words()[at] == reg {
                    return true;
                }
            }
            OperandKind::RegIdx => {
                if block.words()[at] == reg || block.words()[at + 1] == reg {
                    return true;
                }
            }
            _ => {}
        }
        at += kind.size();
    }
    false
}

/// Replaces references to `find` with `repl` in the instruction at `addr`.
/// Refuses the rewrite when it would collapse the two registers of an
/// indexed operand into one.
fn instruction_replace_register(block: &mut CodeBlock, addr: usize, find: i32, repl: i32) -> bool {
    let Some(op) = block.opcode_at(addr) else {
        return false;
    };
    let mut found = false;
    let mut at = addr + 1;
    for kind in op.operand_kinds() {
        match kind {
            OperandKind::Reg | OperandKind::RegDisp => {
                if block.words()[at] == find {
                    found = true;
                }
            }
            OperandKind::RegIdx => {
                if block.words()[at] == find {
                    if block.words()[at + 1] == repl {
                        return false;
                    }
                    found = true;
                } else if block.words()[at + 1] == find {
                    if block.words()[at] == repl {
                        return false;
                    }
                    found = true;
                }
            }
            _ => {}
        }
        at += kind.size();
    }
    if !found {
        return false;
    }
    let mut at = addr + 1;
    for kind in op.operand_kinds() {
        match kind {
            OperandKind::Reg | OperandKind::RegDisp => {
                if block.words()[at] == find {
                    block.code[at] = repl;
                }
            }
            OperandKind::RegIdx => {
                if block.words()[at] == find {
                    block.code[at] = repl;
                } else if block.words()[at + 1] == find {
                    block.code[at + 1] = repl;
                }
            }
            _ => {}
        }
        at += kind.size();
    }
    true
}

fn is_push_null(block: &CodeBlock, addr: usize) -> Option<i32> {
    match block.opcode_at(addr)? {
        OpCode::Push => Some(1),
        OpCode::Pushm => Some(block.words()[addr + 1]),
        _ => None,
    }
}

fn is_pop_forget(block: &CodeBlock, addr: usize) -> Option<i32> {
    match block.opcode_at(addr)? {
        OpCode::Pop => Some(1),
        OpCode::Popm => Some(block.words()[addr + 1]),
        _ => None,
    }
}

fn is_push_register(block: &CodeBlock, addr: usize) -> Option<i32> {
    match block.opcode_at(addr)? {
        OpCode::PushR => Some(block.words()[addr + 1]),
        _ => None,
    }
}

fn is_pop_register(block: &CodeBlock, addr: usize, reg: i32) -> bool {
    block.opcode_at(addr) == Some(OpCode::PopR) && block.words()[addr + 1] == reg
}

fn push_multi_regs(block: &CodeBlock, addr: usize) -> Vec<i32> {
    if block.opcode_at(addr) == Some(OpCode::PushRange) {
        let first = block.words()[addr + 1];
        let count = block.words()[addr + 2];
        (first..first + count).collect()
    } else {
        Vec::new()
    }
}

fn is_pop_multi(block: &CodeBlock, addr: usize, reg: i32) -> bool {
    if block.opcode_at(addr) == Some(OpCode::PopRange) {
        let first = block.words()[addr + 1];
        let count = block.words()[addr + 2];
        reg >= first && reg < first + count
    } else {
        false
    }
}

/// Removes `reg` from a `pushr`/`popr` if it is the highest saved
/// register; returns the new count, or -1 if the register cannot be
/// removed here.
fn push_multi_decrement(block: &mut CodeBlock, addr: usize, reg: i32) -> i32 {
    if matches!(
        block.opcode_at(addr),
        Some(OpCode::PushRange) | Some(OpCode::PopRange)
    ) {
        let first = block.words()[addr + 1];
        let count = block.words()[addr + 2];
        if reg == first + count - 1 {
            block.code[addr + 2] -= 1;
            return block.code[addr + 2];
        }
    }
    -1
}

/// Net stack-pointer change of push/pop instructions (positive = push).
fn stack_modifier(block: &CodeBlock, addr: usize) -> Option<i32> {
    let op = block.opcode_at(addr)?;
    match op.base() {
        OpCode::PushR => Some(1),
        OpCode::PopR => Some(-1),
        OpCode::Pushm => Some(block.words()[addr + 1]),
        OpCode::Popm => Some(-block.words()[addr + 1]),
        OpCode::PushRange => Some(block.words()[addr + 2]),
        OpCode::PopRange => Some(-block.words()[addr + 2]),
        _ => None,
    }
}

fn branch_offset(block: &CodeBlock, addr: usize) -> Option<(i32, bool)> {
    let conditional = block.branch_is_conditional(addr)?;
    let target = block.branch_target(addr)?;
    Some(((target - addr as i64) as i32, conditional))
}

/// Fixes every `(sp+d)` operand reaching caller arguments by `fixup`,
/// tracing execution paths: conditional branch bodies are recursed into,
/// unconditional forward branches are followed, and a visited bitmap
/// prevents retracing. The closure-capture count of `newdgc` gets the
/// same fixup.
pub(super) fn fix_stack_offsets(
    block: &mut CodeBlock,
    addr: usize,
    stop: usize,
    fixup: i32,
    mut stack_pointer: i32,
    visited: &mut Vec<bool>,
) {
    visited.resize(block.len(), false);
    let mut addr = addr;
    while addr < stop {
        let Some(op) = block.opcode_at(addr) else {
            break;
        };
        let size = op.size();
        if op == OpCode::Ret || visited[addr] {
            break;
        }
        visited[addr] = true;
        // fix stack-relative operands that reach beyond this frame's pushes
        let mut at = addr + 1;
        for kind in op.operand_kinds() {
            if *kind == OperandKind::StackDisp && block.words()[at] >= stack_pointer {
                block.code[at] += fixup;
            }
            at += kind.size();
        }
        if op.base() == OpCode::Newdgc {
            block.code[addr + 2] += fixup;
        }
        if let Some(amount) = stack_modifier(block, addr) {
            stack_pointer += amount;
        } else if let Some((offset, conditional)) = branch_offset(block, addr) {
            if offset > 0 {
                let target = (addr as i64 + offset as i64) as usize;
                if conditional {
                    fix_stack_offsets(block, addr + size, block.len(), fixup, stack_pointer, visited);
                }
                addr = target;
                continue;
            }
        }
        addr += size;
    }
}

// ----------------------------------------------------------------------
// instruction merging
// ----------------------------------------------------------------------

/// Merges `move/copy/wref/moveh SRC, rn` + `move/copy/wref rn, DST` into a
/// single instruction. Returns the new words; an empty vector means both
/// instructions cancel out (a degenerate `move rn, rn`).
fn create_combined_move(mtr: &OpcodeInfo, mfr: &OpcodeInfo) -> Option<Vec<i32>> {
    if mtr.operands[DST].kind != Some(OperandKind::Reg)
        || mfr.operands[SRC].kind != Some(OperandKind::Reg)
        || mtr.operands[DST].data[0] != mfr.operands[SRC].data[0]
    {
        return None;
    }
    let base = match mtr.base {
        OpCode::MoveRR => mfr.base,
        OpCode::WrefRR => OpCode::WrefRR,
        OpCode::MovehR => match mfr.base {
            OpCode::MoveRR => OpCode::MovehR,
            OpCode::CopyRR => OpCode::CopyhR,
            _ => return None,
        },
        OpCode::CopyRR | OpCode::CopyhR => match mfr.base {
            OpCode::MoveRR => mtr.base,
            _ => return None,
        },
        _ => return None,
    };
    let mut merged = *mtr;
    merged.base = base;
    merged.operands[DST] = mfr.operands[DST];
    if merged.base == OpCode::MoveRR
        && merged.operands[SRC].kind == Some(OperandKind::Reg)
        && merged.operands[DST].kind == Some(OperandKind::Reg)
        && merged.operands[SRC].data[0] == merged.operands[DST].data[0]
    {
        return Some(Vec::new());
    }
    merged.encode().ok()
}

/// Merges `move SRC, rn` + `math rn, DST` into `math SRC, DST`.
fn create_combined_math(mov: &OpcodeInfo, math: &OpcodeInfo) -> Option<Vec<i32>> {
    if mov.operands[DST].kind != Some(OperandKind::Reg)
        || math.operands[SRC].kind != Some(OperandKind::Reg)
        || mov.operands[DST].data[0] != math.operands[SRC].data[0]
        || mov.base == OpCode::MovehR
    {
        return None;
    }
    let mut merged = *math;
    merged.operands[SRC] = mov.operands[SRC];
    merged.encode().ok()
}

/// Merges two temp-register moves and a register compare into one move and
/// a direct-operand compare, honoring operand independence.
fn create_combined_compare(
    m1: &OpcodeInfo,
    m2: &OpcodeInfo,
    cmp: &OpcodeInfo,
) -> Option<Vec<i32>> {
    if m1.operands[DST].kind != Some(OperandKind::Reg)
        || cmp.operands[1].kind != Some(OperandKind::Reg)
        || m1.operands[DST].data[0] != cmp.operands[1].data[0]
        || m2.operands[DST].kind != Some(OperandKind::Reg)
        || cmp.operands[0].kind != Some(OperandKind::Reg)
        || m2.operands[DST].data[0] != cmp.operands[0].data[0]
    {
        return None;
    }
    if m2.base != OpCode::MovehR {
        if !operands_independent(m1, DST, m2, SRC) {
            return None;
        }
        let mut cmp = *cmp;
        cmp.operands[0] = m2.operands[SRC];
        let mut words = m1.encode().ok()?;
        words.extend(cmp.encode().ok()?);
        Some(words)
    } else if m1.base != OpCode::MovehR {
        if !operands_independent(m2, DST, m1, SRC) {
            return None;
        }
        let mut cmp = *cmp;
        cmp.operands[1] = m1.operands[SRC];
        let mut words = m2.encode().ok()?;
        words.extend(cmp.encode().ok()?);
        Some(words)
    } else {
        None
    }
}

// ----------------------------------------------------------------------
// the passes
// ----------------------------------------------------------------------

/// Pass 1: consecutive `push`/`pushm` become one `pushm`; same for pops.
fn combine_push_pop(block: &mut CodeBlock, report: &mut OptimizeReport) -> VmResult<()> {
    report.total_passes += 1;
    let mut changed = false;
    let mut addr = 0;
    while addr < block.len() {
        let mut size = block.instr_size_at(addr);
        if size == 0 {
            break;
        }
        for (probe, make) in [
            (is_push_null as fn(&CodeBlock, usize) -> Option<i32>, OpCode::Pushm),
            (is_pop_forget, OpCode::Popm),
        ] {
            if let Some(first) = probe(block, addr) {
                let mut sum = first;
                let mut count = 1;
                let mut next = addr + size;
                while next < block.len() {
                    match probe(block, next) {
                        Some(c) if !block.is_branch_target(next) => {
                            sum += c;
                            count += 1;
                            next += block.instr_size_at(next);
                        }
                        _ => break,
                    }
                }
                if sum > first {
                    block.replace_code(addr, next - addr, 2);
                    block.write(addr, &[make as i32, sum]);
                    size = 2;
                    report.instr_added += 1;
                    report.instr_removed += count;
                    changed = true;
                }
                break;
            }
        }
        addr += size;
    }
    if changed {
        report.passes_run += 1;
    }
    Ok(())
}

/// Pass 2: `move SRC, rn` + `move/copy/wref rn, DST` becomes one
/// instruction when `rn` is a pure temporary and the second instruction is
/// not a branch target. Iterates to fixpoint.
fn move_operations(
    block: &mut CodeBlock,
    local_regs: u32,
    report: &mut OptimizeReport,
) -> VmResult<()> {
    loop {
        report.total_passes += 1;
        let mut changed = false;
        let mut addr = 0;
        while addr < block.len() {
            let mut size = block.instr_size_at(addr);
            if size == 0 {
                break;
            }
            let mtr = get_move_to_register(block, addr)
                .or_else(|| get_copy_to_register(block, addr))
                .or_else(|| get_wref_to_register(block, addr));
            if let Some(mtr) = mtr {
                let temp = mtr.operands[DST].data[0];
                let addr2 = addr + size;
                if is_temp_register(temp, local_regs) && addr2 < block.len() {
                    let size2 = block.instr_size_at(addr2);
                    if let Some(mfr) = get_move_from_register(block, addr2) {
                        if !block.is_branch_target(addr2) {
                            if let Some(words) = create_combined_move(&mtr, &mfr) {
                                block.replace_code(addr, size + size2, words.len());
                                block.write(addr, &words);
                                size = words.len();
                                if !words.is_empty() {
                                    report.instr_added += 1;
                                }
                                report.instr_removed += 2;
                                changed = true;
                            }
                        }
                    }
                }
            }
            if size == 0 {
                continue;
            }
            addr += size;
        }
        if changed {
            report.passes_run += 1;
        } else {
            return Ok(());
        }
    }
}

fn is_temp_register(reg: i32, local_regs: u32) -> bool {
    reg >= 3 && (reg as usize) < NUM_REGISTERS && local_regs & (1 << reg) == 0
}

/// Pass 3: `move SRC, rn … copy rn, rn` becomes `copy SRC, rn` with the
/// redundant self-copy deleted. `copy rn, rn` is the code generator's mark
/// for "now make it a real copy".
fn temp_reg_copying(block: &mut CodeBlock, report: &mut OptimizeReport) -> VmResult<()> {
    report.total_passes += 1;
    let mut changed = false;
    let mut addr = 0;
    while addr < block.len() {
        let size = block.instr_size_at(addr);
        if size == 0 {
            break;
        }
        if let Some(mtr) = get_move_to_register(block, addr) {
            let reg = mtr.operands[DST].data[0];
            let mut addr2 = addr + size;
            while addr2 < block.len() {
                let size2 = block.instr_size_at(addr2);
                if size2 == 0 {
                    break;
                }
                if instruction_uses_register(block, addr2, reg) {
                    let words = block.words();
                    if block.opcode_at(addr2) == Some(OpCode::CopyRR)
                        && words[addr2 + 1] == reg
                        && words[addr2 + 2] == reg
                    {
                        block.delete_code(addr2, size2);
                        report.instr_removed += 1;
                        let move_op = block.opcode_at(addr).expect("decoded above");
                        if let Some(copy_op) = move_to_copy(move_op) {
                            block.code[addr] = copy_op as i32;
                        }
                        changed = true;
                    }
                    break;
                }
                addr2 += size2;
            }
        }
        addr += size;
    }
    if changed {
        report.passes_run += 1;
    }
    Ok(())
}

fn move_to_copy(op: OpCode) -> Option<OpCode> {
    let kinds = op.operand_kinds();
    let base = match op.base() {
        OpCode::MoveRR => OpCode::CopyRR,
        OpCode::MovehR => OpCode::CopyhR,
        _ => return None,
    };
    OpCode::from_base_and_kinds(base, kinds)
}

/// Pass 4: `move SRC, rn` + `math rn, rm` becomes `math SRC, rm`.
fn math_operations(block: &mut CodeBlock, report: &mut OptimizeReport) -> VmResult<()> {
    report.total_passes += 1;
    let mut changed = false;
    let mut addr = 0;
    while addr < block.len() {
        let mut size = block.instr_size_at(addr);
        if size == 0 {
            break;
        }
        if let Some(mov) = get_move_to_register(block, addr) {
            let addr2 = addr + size;
            if addr2 < block.len() {
                let size2 = block.instr_size_at(addr2);
                if let Some(math) = get_math_from_register(block, addr2) {
                    if !block.is_branch_target(addr2) {
                        if let Some(words) = create_combined_math(&mov, &math) {
                            block.replace_code(addr, size + size2, words.len());
                            block.write(addr, &words);
                            size = words.len();
                            report.instr_added += 1;
                            report.instr_removed += 2;
                            changed = true;
                        }
                    }
                }
            }
        }
        addr += size;
    }
    if changed {
        report.passes_run += 1;
    }
    Ok(())
}

/// Pass 5: two temp moves plus a register compare become one move and a
/// direct-operand compare.
fn compare_operations(block: &mut CodeBlock, report: &mut OptimizeReport) -> VmResult<()> {
    report.total_passes += 1;
    let mut changed = false;
    let mut addr = 0;
    while addr < block.len() {
        let mut size = block.instr_size_at(addr);
        if size == 0 {
            break;
        }
        if let Some(m1) = get_move_to_register(block, addr) {
            let addr2 = addr + size;
            let size2 = block.instr_size_at(addr2);
            if size2 > 0 {
                if let Some(m2) = get_move_to_register(block, addr2) {
                    let addr3 = addr2 + size2;
                    let size3 = block.instr_size_at(addr3);
                    if size3 > 0 && !block.is_branch_target(addr2) && !block.is_branch_target(addr3)
                    {
                        if let Some(cmp) = get_compare_register(block, addr3) {
                            if let Some(words) = create_combined_compare(&m1, &m2, &cmp) {
                                block.replace_code(addr, size + size2 + size3, words.len());
                                block.write(addr, &words);
                                size = words.len();
                                report.instr_added += 2;
                                report.instr_removed += 3;
                                changed = true;
                            }
                        }
                    }
                }
            }
        }
        addr += size;
    }
    if changed {
        report.passes_run += 1;
    }
    Ok(())
}

/// Pass 6: for swappable operations, `op X, rn` + `move rn, X` becomes
/// `op rn, X`.
fn operation_and_move(
    block: &mut CodeBlock,
    local_regs: u32,
    report: &mut OptimizeReport,
) -> VmResult<()> {
    report.total_passes += 1;
    let mut changed = false;
    let mut addr = 0;
    while addr < block.len() {
        let mut size = block.instr_size_at(addr);
        if size == 0 {
            break;
        }
        if let Ok(info) = block.decode(addr) {
            if info.operands[DST].kind == Some(OperandKind::Reg)
                && is_swappable(info.base)
                && is_temp_register(info.operands[DST].data[0], local_regs)
            {
                let addr2 = addr + size;
                let size2 = block.instr_size_at(addr2);
                if size2 > 0 && !block.is_branch_target(addr2) {
                    if let Ok(info2) = block.decode(addr2) {
                        if info2.base == OpCode::MoveRR
                            && crate::instruction::operands_equal(&info, SRC, &info2, DST)
                            && crate::instruction::operands_equal(&info, DST, &info2, SRC)
                        {
                            let mut merged = info;
                            merged.operands.swap(SRC, DST);
                            if let Ok(words) = merged.encode() {
                                block.replace_code(addr, size + size2, words.len());
                                block.write(addr, &words);
                                size = words.len();
                                report.instr_removed += 1;
                                changed = true;
                            }
                        }
                    }
                }
            }
        }
        addr += size;
    }
    if changed {
        report.passes_run += 1;
    }
    Ok(())
}

fn is_swappable(base: OpCode) -> bool {
    matches!(
        base,
        OpCode::AddRR
            | OpCode::MulRR
            | OpCode::AddlRR
            | OpCode::MullRR
            | OpCode::AddfRR
            | OpCode::MulfRR
            | OpCode::AndRR
            | OpCode::OrRR
            | OpCode::XorRR
    )
}

/// Pass 7: when a register initialized earlier is no longer referenced at
/// a later program point, a later initialization of a different register
/// is rewritten to reuse the older one.
fn register_replacing(block: &mut CodeBlock, report: &mut OptimizeReport) -> VmResult<()> {
    report.total_passes += 1;
    let mut changed = false;
    let mut initial = [true; NUM_REGISTERS];

    // the saved-register set comes from the push instructions at function
    // entry
    let mut regmap = push_multi_regs(block, 0);
    let mut addr = 0;
    if regmap.is_empty() {
        while addr < block.len() {
            let size = block.instr_size_at(addr);
            if size == 0 {
                break;
            }
            match is_push_register(block, addr) {
                Some(reg) => regmap.push(reg),
                None => break,
            }
            addr += size;
        }
    } else {
        addr = 0;
    }

    while addr < block.len() {
        let size = block.instr_size_at(addr);
        if size == 0 {
            break;
        }
        if let Some(new_reg) = init_register(block, addr) {
            if new_reg >= 3 && initial[new_reg] {
                initial[new_reg] = false;
                for i in 0..regmap.len() {
                    let current = regmap[i];
                    if current as usize != new_reg && !initial[current as usize] {
                        let mut still_used = false;
                        let mut addr2 = addr;
                        while addr2 < block.len() {
                            let size2 = block.instr_size_at(addr2);
                            if size2 == 0 {
                                break;
                            }
                            if instruction_uses_register(block, addr2, current)
                                && !is_pop_register(block, addr2, current)
                            {
                                still_used = true;
                                break;
                            }
                            addr2 += size2;
                        }
                        if !still_used {
                            let mut addr2 = addr;
                            while addr2 < block.len() {
                                let size2 = block.instr_size_at(addr2);
                                if size2 == 0 {
                                    break;
                                }
                                if !is_pop_register(block, addr2, new_reg as i32) {
                                    instruction_replace_register(
                                        block,
                                        addr2,
                                        new_reg as i32,
                                        current,
                                    );
                                }
                                addr2 += size2;
                            }
                            changed = true;
                            initial[new_reg] = true;
                            break;
                        }
                    }
                }
            }
        }
        addr += size;
    }
    if changed {
        report.passes_run += 1;
    }
    Ok(())
}

/// Pass 8: removes `pushr`/`popr` (or single pushes) for registers no
/// longer initialized in the body, converting a one-register range to
/// `push`/`pop` and fixing stack displacements for the removed words.
fn register_saving(block: &mut CodeBlock, report: &mut OptimizeReport) -> VmResult<()> {
    report.total_passes += 1;
    let mut fixup = 0i32;
    let mut regmap = push_multi_regs(block, 0);
    if !regmap.is_empty() {
        let entry_size = block.instr_size_at(0);
        for i in (0..regmap.len()).rev() {
            let mut reg = regmap[i];
            if is_register_initialized(block, entry_size, reg as usize) {
                continue;
            }
            // swap with the highest saved register so the range can shrink
            let last = *regmap.last().expect("non-empty");
            if reg != last {
                regmap[i] = last;
                *regmap.last_mut().expect("non-empty") = reg;
                let doomed = last;
                let mut addr2 = 0;
                while addr2 < block.len() {
                    let size2 = block.instr_size_at(addr2);
                    if size2 == 0 {
                        break;
                    }
                    if !is_pop_multi(block, addr2, doomed) {
                        instruction_replace_register(block, addr2, doomed, reg);
                    }
                    addr2 += size2;
                }
                reg = doomed;
            }
            let cnt = push_multi_decrement(block, 0, reg);
            if cnt < 0 {
                break;
            }
            fixup -= 1;
            regmap.pop();
            if cnt == 0 {
                // the whole pushr goes, and every popr with it
                let size0 = block.instr_size_at(0);
                block.delete_code(0, size0);
                report.instr_removed += 1;
                let mut addr2 = 0;
                while addr2 < block.len() {
                    let size2 = block.instr_size_at(addr2);
                    if size2 == 0 {
                        break;
                    }
                    if is_pop_multi(block, addr2, reg) {
                        block.delete_code(addr2, size2);
                        report.instr_removed += 1;
                        continue;
                    }
                    addr2 += size2;
                }
                break;
            } else {
                let mut addr2 = block.instr_size_at(0);
                while addr2 < block.len() {
                    let size2 = block.instr_size_at(addr2);
                    if size2 == 0 {
                        break;
                    }
                    if is_pop_multi(block, addr2, reg) {
                        push_multi_decrement(block, addr2, reg);
                    }
                    addr2 += size2;
                }
                // a single leftover register becomes plain push/pop
                if regmap.len() == 1 {
                    let only = regmap[0];
                    let size0 = block.instr_size_at(0);
                    block.replace_code(0, size0, 2);
                    block.write(0, &[OpCode::PushR as i32, only]);
                    report.instr_removed += 1;
                    report.instr_added += 1;
                    let mut addr2 = 2;
                    while addr2 < block.len() {
                        let size2 = block.instr_size_at(addr2);
                        if size2 == 0 {
                            break;
                        }
                        if is_pop_multi(block, addr2, only) {
                            block.replace_code(addr2, size2, 2);
                            block.write(addr2, &[OpCode::PopR as i32, only]);
                            report.instr_removed += 1;
                            report.instr_added += 1;
                            addr2 += 2;
                            continue;
                        }
                        addr2 += size2;
                    }
                }
            }
        }
    } else {
        // single-push prologue
        let mut addr = 0;
        while addr < block.len() {
            let size = block.instr_size_at(addr);
            if size == 0 {
                break;
            }
            let Some(reg) = is_push_register(block, addr) else {
                break;
            };
            if reg == 0 {
                break;
            }
            if !is_register_initialized(block, addr + size, reg as usize) {
                block.delete_code(addr, size);
                report.instr_removed += 1;
                fixup -= 1;
                let mut addr2 = 0;
                while addr2 < block.len() {
                    let size2 = block.instr_size_at(addr2);
                    if size2 == 0 {
                        break;
                    }
                    if is_pop_register(block, addr2, reg) {
                        block.delete_code(addr2, size2);
                        report.instr_removed += 1;
                        continue;
                    }
                    addr2 += size2;
                }
                continue;
            }
            addr += size;
        }
    }
    if fixup != 0 {
        report.passes_run += 1;
        let mut visited = Vec::new();
        fix_stack_offsets(block, 0, block.len(), fixup, 0, &mut visited);
    }
    Ok(())
}
