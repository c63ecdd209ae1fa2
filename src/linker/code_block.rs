//! The mutable per-function instruction array and its editing primitives.
//!
//! All code edits go through [`CodeBlock::insert_code`],
//! [`CodeBlock::delete_code`] and [`CodeBlock::replace_code`], which fix
//! every branch offset in the function so that each branch keeps pointing
//! at the same logical target instruction.

use crate::error::VmResult;
use crate::instruction::OpcodeInfo;
use crate::op_code::{OpCode, OperandKind};

/// A function's instruction words during linking and optimization.
#[derive(Debug, Clone, Default)]
pub struct CodeBlock {
    pub(crate) code: Vec<i32>,
}

impl CodeBlock {
    /// Wraps an instruction array.
    pub fn new(code: Vec<i32>) -> Self {
        Self { code }
    }

    /// Length in words.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// True if the block holds no code.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// The instruction words.
    pub fn words(&self) -> &[i32] {
        &self.code
    }

    /// The opcode at `addr`, if the word is defined.
    pub fn opcode_at(&self, addr: usize) -> Option<OpCode> {
        self.code.get(addr).and_then(|&w| OpCode::from_word(w))
    }

    /// Size in words of the instruction at `addr`; 0 for an undefined word.
    pub fn instr_size_at(&self, addr: usize) -> usize {
        self.code.get(addr).map_or(0, |&w| OpCode::instruction_size(w))
    }

    /// Decodes the instruction at `addr`.
    pub fn decode(&self, addr: usize) -> VmResult<OpcodeInfo> {
        OpcodeInfo::decode(&self.code, addr)
    }

    /// Overwrites words starting at `addr`.
    pub fn write(&mut self, addr: usize, words: &[i32]) {
        self.code[addr..addr + words.len()].copy_from_slice(words);
    }

    /// Iterates instruction start addresses. Stops early on an undefined
    /// word.
    pub fn instr_addrs(&self) -> impl Iterator<Item = usize> + '_ {
        let mut addr = 0;
        std::iter::from_fn(move || {
            if addr >= self.code.len() {
                return None;
            }
            let size = self.instr_size_at(addr);
            if size == 0 {
                return None;
            }
            let current = addr;
            addr += size;
            Some(current)
        })
    }

    /// Word index of the branch-offset operand of the instruction at
    /// `addr`, if it is a branch.
    fn label_word_at(&self, addr: usize) -> Option<usize> {
        let op = self.opcode_at(addr)?;
        let mut at = addr + 1;
        for kind in op.operand_kinds() {
            if *kind == OperandKind::Label {
                return Some(at);
            }
            at += kind.size();
        }
        None
    }

    /// The absolute branch target of the instruction at `addr`, if it is a
    /// branch.
    pub fn branch_target(&self, addr: usize) -> Option<i64> {
        self.label_word_at(addr)
            .map(|at| addr as i64 + self.code[at] as i64)
    }

    /// Rewrites the branch at `addr` to target `new_target`.
    pub fn set_branch_target(&mut self, addr: usize, new_target: i64) -> bool {
        match self.label_word_at(addr) {
            Some(at) => {
                self.code[at] = (new_target - addr as i64) as i32;
                true
            }
            None => false,
        }
    }

    /// True if a conditional branch; false for `bra`; `None` for
    /// non-branches.
    pub fn branch_is_conditional(&self, addr: usize) -> Option<bool> {
        match self.opcode_at(addr)?.base() {
            OpCode::Bra => Some(false),
            OpCode::TsteqR | OpCode::TstneR => Some(true),
            _ => None,
        }
    }

    /// True if any branch in the block targets `addr`.
    pub fn is_branch_target(&self, addr: usize) -> bool {
        self.instr_addrs()
            .filter_map(|a| self.branch_target(a))
            .any(|t| t == addr as i64)
    }

    /// Inserts `n` zero words (`nop`s) at `point`, shifting branch targets.
    /// If `fix_ins_point` is false, branches landing exactly on the
    /// insertion point keep pointing at the insertion — they will execute
    /// the inserted code.
    pub fn insert_code(&mut self, point: usize, n: usize, fix_ins_point: bool) {
        if point > self.code.len() || n == 0 {
            return;
        }
        let addrs: Vec<usize> = self.instr_addrs().collect();
        for addr in addrs {
            let Some(target) = self.branch_target(addr) else {
                continue;
            };
            if target == point as i64 && !fix_ins_point {
                continue;
            }
            if addr < point && target >= point as i64 {
                self.set_branch_target(addr, target + n as i64);
            } else if addr >= point && target < point as i64 {
                self.set_branch_target(addr, target - n as i64);
            }
        }
        self.code.splice(point..point, std::iter::repeat(0).take(n));
    }

    /// Deletes `n` words at `point`, shifting branch targets; branches into
    /// the deleted range are redirected to the deletion point.
    pub fn delete_code(&mut self, point: usize, n: usize) {
        if point > self.code.len() || n == 0 {
            return;
        }
        let n = n.min(self.code.len() - point);
        let addrs: Vec<usize> = self.instr_addrs().collect();
        for addr in addrs {
            let Some(target) = self.branch_target(addr) else {
                continue;
            };
            let (point, end) = (point as i64, (point + n) as i64);
            if (addr as i64) < point && target >= end {
                self.set_branch_target(addr, target - n as i64);
            } else if addr as i64 >= end && target < point {
                self.set_branch_target(addr, target + n as i64);
            } else if target >= point && target < end {
                self.set_branch_target(addr, point);
            }
        }
        self.code.drain(point..point + n);
    }

    /// Replaces `old_n` words at `addr` with room for `new_n` words,
    /// zero-filling the area and fixing branches.
    pub fn replace_code(&mut self, addr: usize, old_n: usize, new_n: usize) {
        if addr > self.code.len() {
            return;
        }
        let old_n = old_n.min(self.code.len() - addr);
        for w in &mut self.code[addr..addr + old_n] {
            *w = 0;
        }
        if old_n < new_n {
            self.insert_code(addr + old_n, new_n - old_n, true);
        } else if old_n > new_n {
            self.delete_code(addr + new_n, old_n - new_n);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // bra +4 over a nop to a second nop, then ret
    fn sample() -> CodeBlock {
        CodeBlock::new(vec![
            OpCode::Bra as i32,
            4, // -> addr 4
            OpCode::Nop as i32,
            OpCode::Nop as i32,
            OpCode::Nop as i32,
            OpCode::Ret as i32,
        ])
    }

    #[test]
    fn test_branch_target() {
        let block = sample();
        assert_eq!(block.branch_target(0), Some(4));
        assert_eq!(block.branch_target(2), None);
        assert!(block.is_branch_target(4));
        assert!(!block.is_branch_target(3));
    }

    #[test]
    fn test_insert_shifts_forward_branch() {
        let mut block = sample();
        block.insert_code(2, 3, true);
        assert_eq!(block.len(), 9);
        assert_eq!(block.branch_target(0), Some(7));
        // inserted words read as nops
        assert_eq!(block.opcode_at(2), Some(OpCode::Nop));
    }

    #[test]
    fn test_insert_at_target_without_fixup() {
        let mut block = sample();
        // branch lands on 4; inserting at 4 without fixup keeps the branch
        // pointing at the inserted code
        block.insert_code(4, 2, false);
        assert_eq!(block.branch_target(0), Some(4));
        // with fixup the branch follows the old instruction
        let mut block = sample();
        block.insert_code(4, 2, true);
        assert_eq!(block.branch_target(0), Some(6));
    }

    #[test]
    fn test_delete_shifts_and_redirects() {
        let mut block = sample();
        block.delete_code(2, 1);
        assert_eq!(block.branch_target(0), Some(3));
        // deleting the target range redirects to the deletion point
        let mut block = sample();
        block.delete_code(4, 1);
        assert_eq!(block.branch_target(0), Some(4));
    }

    #[test]
    fn test_backward_branch_fixed_on_insert() {
        // layout: nop, nop, bra -2
        let mut block = CodeBlock::new(vec![
            OpCode::Nop as i32,
            OpCode::Nop as i32,
            OpCode::Bra as i32,
            -2,
        ]);
        assert_eq!(block.branch_target(2), Some(0));
        block.insert_code(1, 2, true);
        // the branch moved to addr 4 and still targets addr 0
        assert_eq!(block.branch_target(4), Some(0));
    }

    #[test]
    fn test_replace_grow_and_shrink() {
        let mut block = sample();
        block.replace_code(2, 1, 3);
        assert_eq!(block.len(), 8);
        assert_eq!(block.branch_target(0), Some(6));
        block.replace_code(2, 3, 1);
        assert_eq!(block.len(), 6);
        assert_eq!(block.branch_target(0), Some(4));
    }
}
