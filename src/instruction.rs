//! Decoded-instruction representation.
//!
//! The interpreter reads operand words straight out of the code segment, but
//! the linker and the peephole optimizer need to inspect and rewrite
//! instructions structurally. [`OpcodeInfo`] is that structural view: the
//! base opcode (addressing modes factored out) plus up to four operands with
//! their raw words. [`OpcodeInfo::encode`] re-selects the concrete opcode
//! variant from the operand kinds, so a decode/encode round trip reproduces
//! the original words bit for bit.

use crate::error::{VmError, VmResult};
use crate::op_code::{OpCode, OperandKind};

/// Maximum number of operands of any instruction.
pub const MAX_OPERANDS: usize = 4;

/// One decoded operand: its kind and its raw words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OperandInfo {
    /// The operand kind, or `None` for an absent operand slot.
    pub kind: Option<OperandKind>,
    /// Raw operand words; only the first `kind.size()` entries are valid.
    pub data: [i32; 2],
}

impl OperandInfo {
    /// Creates an operand of the given kind from its raw words.
    pub fn new(kind: OperandKind, data: &[i32]) -> Self {
        let mut words = [0; 2];
        words[..data.len()].copy_from_slice(data);
        Self {
            kind: Some(kind),
            data: words,
        }
    }

    /// Creates a register-direct operand.
    pub fn reg(n: i32) -> Self {
        Self::new(OperandKind::Reg, &[n])
    }

    /// True if this operand is register-direct for register `n`.
    pub fn is_reg(&self, n: i32) -> bool {
        self.kind == Some(OperandKind::Reg) && self.data[0] == n
    }
}

/// A fully decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeInfo {
    /// The base opcode (simplest addressing-mode variant of the mnemonic).
    pub base: OpCode,
    /// The operands in encoding order.
    pub operands: [OperandInfo; MAX_OPERANDS],
}

impl OpcodeInfo {
    /// Decodes the instruction at `addr` in `code`.
    ///
    /// Fails if the opcode word is not defined or the operand words run past
    /// the end of the code block.
    pub fn decode(code: &[i32], addr: usize) -> VmResult<OpcodeInfo> {
        let word = *code
            .get(addr)
            .ok_or(VmError::InvalidCodeAddress { address: addr as i32 })?;
        let op = OpCode::from_word(word).ok_or(VmError::IllegalInstruction { word })?;
        if addr + op.size() > code.len() {
            return Err(VmError::InvalidCodeAddress {
                address: addr as i32,
            });
        }
        let mut operands = [OperandInfo::default(); MAX_OPERANDS];
        let mut cursor = addr + 1;
        for (i, &kind) in op.operand_kinds().iter().enumerate() {
            operands[i] = OperandInfo::new(kind, &code[cursor..cursor + kind.size()]);
            cursor += kind.size();
        }
        Ok(OpcodeInfo {
            base: op.base(),
            operands,
        })
    }

    /// Re-encodes this instruction, selecting the opcode variant that
    /// matches the current operand kinds.
    ///
    /// Returns the instruction words. Fails if the mnemonic has no variant
    /// with this addressing-mode combination.
    pub fn encode(&self) -> VmResult<Vec<i32>> {
        let kinds: Vec<OperandKind> = self
            .operands
            .iter()
            .filter_map(|o| o.kind)
            .collect();
        let op = OpCode::from_base_and_kinds(self.base, &kinds).ok_or_else(|| {
            VmError::invalid_operand(format!(
                "no {} variant for operand kinds {:?}",
                self.base.mnemonic(),
                kinds
            ))
        })?;
        let mut words = vec![op as i32];
        for operand in self.operands.iter() {
            if let Some(kind) = operand.kind {
                words.extend_from_slice(&operand.data[..kind.size()]);
            }
        }
        Ok(words)
    }

    /// Number of present operands.
    pub fn num_operands(&self) -> usize {
        self.operands.iter().filter(|o| o.kind.is_some()).count()
    }

    /// The kind of operand `i`, if present.
    pub fn kind(&self, i: usize) -> Option<OperandKind> {
        self.operands[i].kind
    }
}

/// Compares two EA operands for identity (same kind, same registers and
/// displacements). Non-EA operands never compare equal.
pub fn operands_equal(a: &OpcodeInfo, ai: usize, b: &OpcodeInfo, bi: usize) -> bool {
    let (oa, ob) = (&a.operands[ai], &b.operands[bi]);
    match (oa.kind, ob.kind) {
        (Some(ka), Some(kb)) if ka == kb => match ka {
            OperandKind::Reg | OperandKind::StackDisp => oa.data[0] == ob.data[0],
            OperandKind::RegDisp | OperandKind::RegIdx => {
                oa.data[0] == ob.data[0] && oa.data[1] == ob.data[1]
            }
            _ => false,
        },
        _ => false,
    }
}

/// Checks whether two EA operands are independent: neither references a
/// register the other one uses.
pub fn operands_independent(a: &OpcodeInfo, ai: usize, b: &OpcodeInfo, bi: usize) -> bool {
    fn regs(op: &OperandInfo) -> &[i32] {
        match op.kind {
            Some(OperandKind::Reg) | Some(OperandKind::RegDisp) => &op.data[..1],
            Some(OperandKind::RegIdx) => &op.data[..2],
            _ => &[],
        }
    }
    let (ra, rb) = (regs(&a.operands[ai]), regs(&b.operands[bi]));
    !ra.iter().any(|r| rb.contains(r))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_simple() {
        let code = [OpCode::MoveRR as i32, 4, 5];
        let info = OpcodeInfo::decode(&code, 0).unwrap();
        assert_eq!(info.base, OpCode::MoveRR);
        assert_eq!(info.operands[0], OperandInfo::reg(4));
        assert_eq!(info.operands[1], OperandInfo::reg(5));
    }

    #[test]
    fn test_decode_rejects_bad_word() {
        let code = [-5];
        assert!(matches!(
            OpcodeInfo::decode(&code, 0),
            Err(VmError::IllegalInstruction { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let code = [OpCode::MoveRR as i32, 4];
        assert!(OpcodeInfo::decode(&code, 0).is_err());
    }

    #[test]
    fn test_encode_round_trip_all_modes() {
        // Exercise one representative of every addressing-mode family.
        let samples: &[&[i32]] = &[
            &[OpCode::Nop as i32],
            &[OpCode::Bra as i32, -6],
            &[OpCode::MoveSD as i32, 2, 3, 1],
            &[OpCode::MoveXX as i32, 3, 4, 5, 6],
            &[OpCode::AddDR as i32, 0, 2, 7],
            &[OpCode::CseqSR as i32, 1, 4, 3],
            &[OpCode::MovehS as i32, 9, 0],
            &[OpCode::TstneD as i32, 0, 1, 12],
            &[OpCode::PushRange as i32, 3, 5],
            &[OpCode::Newctx as i32, 8, 2, 1, 4],
            &[OpCode::RtchkX as i32, 7, 3, 4],
        ];
        for sample in samples {
            let info = OpcodeInfo::decode(sample, 0).unwrap();
            let encoded = info.encode().unwrap();
            assert_eq!(&encoded[..], *sample, "round trip failed for {:?}", info);
        }
    }

    #[test]
    fn test_encode_rejects_missing_variant() {
        // add has no (d, d) variant.
        let mut info = OpcodeInfo::decode(&[OpCode::AddRR as i32, 3, 4], 0).unwrap();
        info.operands[0] = OperandInfo::new(OperandKind::RegDisp, &[3, 0]);
        info.operands[1] = OperandInfo::new(OperandKind::RegDisp, &[4, 0]);
        assert!(info.encode().is_err());
    }

    #[test]
    fn test_operands_equal() {
        let a = OpcodeInfo::decode(&[OpCode::MoveRR as i32, 4, 4], 0).unwrap();
        assert!(operands_equal(&a, 0, &a, 1));
        let b = OpcodeInfo::decode(&[OpCode::MoveDD as i32, 1, 2, 1, 2], 0).unwrap();
        assert!(operands_equal(&b, 0, &b, 1));
        let c = OpcodeInfo::decode(&[OpCode::MoveDD as i32, 1, 2, 1, 3], 0).unwrap();
        assert!(!operands_equal(&c, 0, &c, 1));
    }

    #[test]
    fn test_operands_independent() {
        let info = OpcodeInfo::decode(&[OpCode::MoveXR as i32, 3, 4, 5], 0).unwrap();
        // (r3+r4) vs r5: independent
        assert!(operands_independent(&info, 0, &info, 1));
        let info2 = OpcodeInfo::decode(&[OpCode::MoveXR as i32, 3, 4, 3], 0).unwrap();
        // (r3+r4) vs r3: not independent
        assert!(!operands_independent(&info2, 0, &info2, 1));
    }
}
