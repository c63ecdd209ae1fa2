//! Operand kinds and their encoded sizes.

/// The kind of a single instruction operand.
///
/// Each kind has a fixed size in instruction words; the total size of an
/// instruction is one word for the opcode plus the sizes of its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// Immediate integer number.
    Imm,
    /// Index into the data segment (a literal handle).
    Lit,
    /// Immediate type identifier.
    Type,
    /// A pc-relative branch offset.
    Label,
    /// Register direct, `rn`.
    Reg,
    /// Register indirect with displacement, `(rn+d)` — a class member slot.
    RegDisp,
    /// Register indirect indexed, `(rn+rm)` — an array element.
    RegIdx,
    /// Stack slot with displacement, `(sp+d)`.
    StackDisp,
    /// A register range, `rn-rm`, encoded as first register plus count.
    RegRange,
}

impl OperandKind {
    /// Returns the size of an operand of this kind in instruction words.
    pub fn size(self) -> usize {
        match self {
            OperandKind::Imm
            | OperandKind::Lit
            | OperandKind::Type
            | OperandKind::Label
            | OperandKind::Reg
            | OperandKind::StackDisp => 1,
            OperandKind::RegDisp | OperandKind::RegIdx | OperandKind::RegRange => 2,
        }
    }

    /// Returns true if this kind resolves to an effective address.
    pub fn is_ea(self) -> bool {
        matches!(
            self,
            OperandKind::Reg | OperandKind::RegDisp | OperandKind::RegIdx | OperandKind::StackDisp
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_sizes() {
        assert_eq!(OperandKind::Imm.size(), 1);
        assert_eq!(OperandKind::Reg.size(), 1);
        assert_eq!(OperandKind::StackDisp.size(), 1);
        assert_eq!(OperandKind::RegDisp.size(), 2);
        assert_eq!(OperandKind::RegIdx.size(), 2);
        assert_eq!(OperandKind::RegRange.size(), 2);
    }

    #[test]
    fn test_ea_kinds() {
        assert!(OperandKind::Reg.is_ea());
        assert!(OperandKind::RegDisp.is_ea());
        assert!(!OperandKind::Imm.is_ea());
        assert!(!OperandKind::RegRange.is_ea());
    }
}
