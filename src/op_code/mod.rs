//! Opcode definitions and the instruction info table.
//!
//! Every combination of operation and addressing mode is a distinct opcode,
//! so the external bytecode format stays flat: one opcode word followed by
//! the operand words. The table below is the single source of truth for
//! mnemonics, operand kinds and instruction sizes; the interpreter, the
//! linker and the peephole optimizer all decode against it.

mod operand_size;

pub use operand_size::OperandKind;

use hashbrown::HashMap;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive as _;
use once_cell::sync::Lazy;

/// Static description of one opcode: its mnemonic and operand kinds.
#[derive(Debug, Clone, Copy)]
pub struct InstrInfo {
    /// The opcode this entry describes.
    pub opcode: OpCode,
    /// Assembler mnemonic, shared across addressing-mode variants.
    pub mnemonic: &'static str,
    /// Operand kinds in encoding order (at most four).
    pub kinds: &'static [OperandKind],
}

impl InstrInfo {
    /// Number of operands of the instruction.
    pub fn num_operands(&self) -> usize {
        self.kinds.len()
    }

    /// Total instruction size in words, including the opcode word.
    pub fn size(&self) -> usize {
        1 + self.kinds.iter().map(|k| k.size()).sum::<usize>()
    }
}

macro_rules! op_codes {
    ($(($name:ident, $mn:literal, [$($kind:ident),* $(,)?]),)+) => {
        /// A virtual machine opcode.
        ///
        /// Discriminants are the instruction words as they appear in the
        /// code segment; the enum is ordered exactly like the info table.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, FromPrimitive)]
        #[repr(i32)]
        pub enum OpCode {
            $($name,)+
        }

        const INFO: &[InstrInfo] = &[
            $(InstrInfo {
                opcode: OpCode::$name,
                mnemonic: $mn,
                kinds: &[$(OperandKind::$kind),*],
            },)+
        ];
    };
}

op_codes! {
    (Nop, "nop", []),
    (Alloc, "alloc", [Type, Reg]),
    (Alloca, "alloca", [Type, Imm, Reg]),
    (Allocn, "allocn", [Type, Reg]),
    (Bra, "bra", [Label]),
    (Brk, "brk", []),
    (Callm, "callm", [Type, Imm]),
    (Calls, "calls", [Imm]),
    (Calln, "calln", [Type, Imm]),
    (Cvf, "cvf", [Reg, Reg]),
    (Cvl, "cvl", [Reg, Reg]),
    (Popm, "popm", [Imm]),
    (PopRange, "popr", [RegRange]),
    (Pushm, "pushm", [Imm]),
    (PushRange, "pushr", [RegRange]),
    (Ret, "ret", []),
    (Size, "size", [Reg, Reg]),
    (Type, "type", [Reg, Reg]),
    (DecR, "dec", [Reg]),
    (DecD, "dec", [RegDisp]),
    (DecX, "dec", [RegIdx]),
    (DecS, "dec", [StackDisp]),
    (IncR, "inc", [Reg]),
    (IncD, "inc", [RegDisp]),
    (IncX, "inc", [RegIdx]),
    (IncS, "inc", [StackDisp]),
    (MovehR, "moveh", [Lit, Reg]),
    (MovehD, "moveh", [Lit, RegDisp]),
    (MovehX, "moveh", [Lit, RegIdx]),
    (MovehS, "moveh", [Lit, StackDisp]),
    (NegR, "neg", [Reg]),
    (NegD, "neg", [RegDisp]),
    (NegX, "neg", [RegIdx]),
    (NegS, "neg", [StackDisp]),
    (NotR, "not", [Reg]),
    (NotD, "not", [RegDisp]),
    (NotX, "not", [RegIdx]),
    (NotS, "not", [StackDisp]),
    (TsteqR, "tsteq", [Reg, Label]),
    (TsteqD, "tsteq", [RegDisp, Label]),
    (TsteqX, "tsteq", [RegIdx, Label]),
    (TsteqS, "tsteq", [StackDisp, Label]),
    (TstneR, "tstne", [Reg, Label]),
    (TstneD, "tstne", [RegDisp, Label]),
    (TstneX, "tstne", [RegIdx, Label]),
    (TstneS, "tstne", [StackDisp, Label]),
    (AddRR, "add", [Reg, Reg]),
    (AddRD, "add", [Reg, RegDisp]),
    (AddRX, "add", [Reg, RegIdx]),
    (AddRS, "add", [Reg, StackDisp]),
    (AddDR, "add", [RegDisp, Reg]),
    (AddXR, "add", [RegIdx, Reg]),
    (AddSR, "add", [StackDisp, Reg]),
    (AndRR, "and", [Reg, Reg]),
    (AndRD, "and", [Reg, RegDisp]),
    (AndRX, "and", [Reg, RegIdx]),
    (AndRS, "and", [Reg, StackDisp]),
    (AndDR, "and", [RegDisp, Reg]),
    (AndXR, "and", [RegIdx, Reg]),
    (AndSR, "and", [StackDisp, Reg]),
    (AslRR, "asl", [Reg, Reg]),
    (AslRD, "asl", [Reg, RegDisp]),
    (AslRX, "asl", [Reg, RegIdx]),
    (AslRS, "asl", [Reg, StackDisp]),
    (AslDR, "asl", [RegDisp, Reg]),
    (AslXR, "asl", [RegIdx, Reg]),
    (AslSR, "asl", [StackDisp, Reg]),
    (AsrRR, "asr", [Reg, Reg]),
    (AsrRD, "asr", [Reg, RegDisp]),
    (AsrRX, "asr", [Reg, RegIdx]),
    (AsrRS, "asr", [Reg, StackDisp]),
    (AsrDR, "asr", [RegDisp, Reg]),
    (AsrXR, "asr", [RegIdx, Reg]),
    (AsrSR, "asr", [StackDisp, Reg]),
    (DivRR, "div", [Reg, Reg]),
    (DivRD, "div", [Reg, RegDisp]),
    (DivRX, "div", [Reg, RegIdx]),
    (DivRS, "div", [Reg, StackDisp]),
    (DivDR, "div", [RegDisp, Reg]),
    (DivXR, "div", [RegIdx, Reg]),
    (DivSR, "div", [StackDisp, Reg]),
    (LslRR, "lsl", [Reg, Reg]),
    (LslRD, "lsl", [Reg, RegDisp]),
    (LslRX, "lsl", [Reg, RegIdx]),
    (LslRS, "lsl", [Reg, StackDisp]),
    (LslDR, "lsl", [RegDisp, Reg]),
    (LslXR, "lsl", [RegIdx, Reg]),
    (LslSR, "lsl", [StackDisp, Reg]),
    (LsrRR, "lsr", [Reg, Reg]),
    (LsrRD, "lsr", [Reg, RegDisp]),
    (LsrRX, "lsr", [Reg, RegIdx]),
    (LsrRS, "lsr", [Reg, StackDisp]),
    (LsrDR, "lsr", [RegDisp, Reg]),
    (LsrXR, "lsr", [RegIdx, Reg]),
    (LsrSR, "lsr", [StackDisp, Reg]),
    (ModRR, "mod", [Reg, Reg]),
    (ModRD, "mod", [Reg, RegDisp]),
    (ModRX, "mod", [Reg, RegIdx]),
    (ModRS, "mod", [Reg, StackDisp]),
    (ModDR, "mod", [RegDisp, Reg]),
    (ModXR, "mod", [RegIdx, Reg]),
    (ModSR, "mod", [StackDisp, Reg]),
    (MulRR, "mul", [Reg, Reg]),
    (MulRD, "mul", [Reg, RegDisp]),
    (MulRX, "mul", [Reg, RegIdx]),
    (MulRS, "mul", [Reg, StackDisp]),
    (MulDR, "mul", [RegDisp, Reg]),
    (MulXR, "mul", [RegIdx, Reg]),
    (MulSR, "mul", [StackDisp, Reg]),
    (OrRR, "or", [Reg, Reg]),
    (OrRD, "or", [Reg, RegDisp]),
    (OrRX, "or", [Reg, RegIdx]),
    (OrRS, "or", [Reg, StackDisp]),
    (OrDR, "or", [RegDisp, Reg]),
    (OrXR, "or", [RegIdx, Reg]),
    (OrSR, "or", [StackDisp, Reg]),
    (SubRR, "sub", [Reg, Reg]),
    (SubRD, "sub", [Reg, RegDisp]),
    (SubRX, "sub", [Reg, RegIdx]),
    (SubRS, "sub", [Reg, StackDisp]),
    (SubDR, "sub", [RegDisp, Reg]),
    (SubXR, "sub", [RegIdx, Reg]),
    (SubSR, "sub", [StackDisp, Reg]),
    (XorRR, "xor", [Reg, Reg]),
    (XorRD, "xor", [Reg, RegDisp]),
    (XorRX, "xor", [Reg, RegIdx]),
    (XorRS, "xor", [Reg, StackDisp]),
    (XorDR, "xor", [RegDisp, Reg]),
    (XorXR, "xor", [RegIdx, Reg]),
    (XorSR, "xor", [StackDisp, Reg]),
    (MoveRR, "move", [Reg, Reg]),
    (MoveRD, "move", [Reg, RegDisp]),
    (MoveRX, "move", [Reg, RegIdx]),
    (MoveRS, "move", [Reg, StackDisp]),
    (MoveDR, "move", [RegDisp, Reg]),
    (MoveDD, "move", [RegDisp, RegDisp]),
    (MoveDX, "move", [RegDisp, RegIdx]),
    (MoveDS, "move", [RegDisp, StackDisp]),
    (MoveXR, "move", [RegIdx, Reg]),
    (MoveXD, "move", [RegIdx, RegDisp]),
    (MoveXX, "move", [RegIdx, RegIdx]),
    (MoveXS, "move", [RegIdx, StackDisp]),
    (MoveSR, "move", [StackDisp, Reg]),
    (MoveSD, "move", [StackDisp, RegDisp]),
    (MoveSX, "move", [StackDisp, RegIdx]),
    (MoveSS, "move", [StackDisp, StackDisp]),
    (LdzR, "ldz", [Reg]),
    (CopyRR, "copy", [Reg, Reg]),
    (CopyRD, "copy", [Reg, RegDisp]),
    (CopyRX, "copy", [Reg, RegIdx]),
    (CopyRS, "copy", [Reg, StackDisp]),
    (CopyDR, "copy", [RegDisp, Reg]),
    (CopyDD, "copy", [RegDisp, RegDisp]),
    (CopyDX, "copy", [RegDisp, RegIdx]),
    (CopyDS, "copy", [RegDisp, StackDisp]),
    (CopyXR, "copy", [RegIdx, Reg]),
    (CopyXD, "copy", [RegIdx, RegDisp]),
    (CopyXX, "copy", [RegIdx, RegIdx]),
    (CopyXS, "copy", [RegIdx, StackDisp]),
    (CopySR, "copy", [StackDisp, Reg]),
    (CopySD, "copy", [StackDisp, RegDisp]),
    (CopySX, "copy", [StackDisp, RegIdx]),
    (CopySS, "copy", [StackDisp, StackDisp]),
    (PopR, "pop", [Reg]),
    (PopD, "pop", [RegDisp]),
    (PopX, "pop", [RegIdx]),
    (PopS, "pop", [StackDisp]),
    (PushR, "push", [Reg]),
    (PushD, "push", [RegDisp]),
    (PushX, "push", [RegIdx]),
    (PushS, "push", [StackDisp]),
    (CopyhR, "copyh", [Lit, Reg]),
    (CopyhD, "copyh", [Lit, RegDisp]),
    (CopyhX, "copyh", [Lit, RegIdx]),
    (CopyhS, "copyh", [Lit, StackDisp]),
    (CseqRR, "cseq", [Reg, Reg, Reg]),
    (CseqRD, "cseq", [Reg, RegDisp, Reg]),
    (CseqRX, "cseq", [Reg, RegIdx, Reg]),
    (CseqRS, "cseq", [Reg, StackDisp, Reg]),
    (CseqDR, "cseq", [RegDisp, Reg, Reg]),
    (CseqXR, "cseq", [RegIdx, Reg, Reg]),
    (CseqSR, "cseq", [StackDisp, Reg, Reg]),
    (CsneRR, "csne", [Reg, Reg, Reg]),
    (CsneRD, "csne", [Reg, RegDisp, Reg]),
    (CsneRX, "csne", [Reg, RegIdx, Reg]),
    (CsneRS, "csne", [Reg, StackDisp, Reg]),
    (CsneDR, "csne", [RegDisp, Reg, Reg]),
    (CsneXR, "csne", [RegIdx, Reg, Reg]),
    (CsneSR, "csne", [StackDisp, Reg, Reg]),
    (CsgtRR, "csgt", [Reg, Reg, Reg]),
    (CsgtRD, "csgt", [Reg, RegDisp, Reg]),
    (CsgtRX, "csgt", [Reg, RegIdx, Reg]),
    (CsgtRS, "csgt", [Reg, StackDisp, Reg]),
    (CsgtDR, "csgt", [RegDisp, Reg, Reg]),
    (CsgtXR, "csgt", [RegIdx, Reg, Reg]),
    (CsgtSR, "csgt", [StackDisp, Reg, Reg]),
    (CsgeRR, "csge", [Reg, Reg, Reg]),
    (CsgeRD, "csge", [Reg, RegDisp, Reg]),
    (CsgeRX, "csge", [Reg, RegIdx, Reg]),
    (CsgeRS, "csge", [Reg, StackDisp, Reg]),
    (CsgeDR, "csge", [RegDisp, Reg, Reg]),
    (CsgeXR, "csge", [RegIdx, Reg, Reg]),
    (CsgeSR, "csge", [StackDisp, Reg, Reg]),
    (CsltRR, "cslt", [Reg, Reg, Reg]),
    (CsltRD, "cslt", [Reg, RegDisp, Reg]),
    (CsltRX, "cslt", [Reg, RegIdx, Reg]),
    (CsltRS, "cslt", [Reg, StackDisp, Reg]),
    (CsltDR, "cslt", [RegDisp, Reg, Reg]),
    (CsltXR, "cslt", [RegIdx, Reg, Reg]),
    (CsltSR, "cslt", [StackDisp, Reg, Reg]),
    (CsleRR, "csle", [Reg, Reg, Reg]),
    (CsleRD, "csle", [Reg, RegDisp, Reg]),
    (CsleRX, "csle", [Reg, RegIdx, Reg]),
    (CsleRS, "csle", [Reg, StackDisp, Reg]),
    (CsleDR, "csle", [RegDisp, Reg, Reg]),
    (CsleXR, "csle", [RegIdx, Reg, Reg]),
    (CsleSR, "csle", [StackDisp, Reg, Reg]),
    (SnulRR, "snul", [Reg, Reg]),
    (SnnulRR, "snnul", [Reg, Reg]),
    (UnotR, "unot", [Reg]),
    (UnotD, "unot", [RegDisp]),
    (UnotX, "unot", [RegIdx]),
    (UnotS, "unot", [StackDisp]),
    (StreqRR, "streq", [Reg, Reg, Reg]),
    (StreqRD, "streq", [Reg, RegDisp, Reg]),
    (StreqRX, "streq", [Reg, RegIdx, Reg]),
    (StreqRS, "streq", [Reg, StackDisp, Reg]),
    (StreqDR, "streq", [RegDisp, Reg, Reg]),
    (StreqXR, "streq", [RegIdx, Reg, Reg]),
    (StreqSR, "streq", [StackDisp, Reg, Reg]),
    (StrneRR, "strne", [Reg, Reg, Reg]),
    (StrneRD, "strne", [Reg, RegDisp, Reg]),
    (StrneRX, "strne", [Reg, RegIdx, Reg]),
    (StrneRS, "strne", [Reg, StackDisp, Reg]),
    (StrneDR, "strne", [RegDisp, Reg, Reg]),
    (StrneXR, "strne", [RegIdx, Reg, Reg]),
    (StrneSR, "strne", [StackDisp, Reg, Reg]),
    (StraddRR, "stradd", [Reg, Reg]),
    (StraddRD, "stradd", [Reg, RegDisp]),
    (StraddRX, "stradd", [Reg, RegIdx]),
    (StraddRS, "stradd", [Reg, StackDisp]),
    (StraddDR, "stradd", [RegDisp, Reg]),
    (StraddXR, "stradd", [RegIdx, Reg]),
    (StraddSR, "stradd", [StackDisp, Reg]),
    (ArrcpRR, "arrcp", [Reg, Reg]),
    (ArrcpRD, "arrcp", [Reg, RegDisp]),
    (ArrcpRX, "arrcp", [Reg, RegIdx]),
    (ArrcpRS, "arrcp", [Reg, StackDisp]),
    (ArrcpDR, "arrcp", [RegDisp, Reg]),
    (ArrcpXR, "arrcp", [RegIdx, Reg]),
    (ArrcpSR, "arrcp", [StackDisp, Reg]),
    (ArrmvRR, "arrmv", [Reg, Reg]),
    (ArrmvRD, "arrmv", [Reg, RegDisp]),
    (ArrmvRX, "arrmv", [Reg, RegIdx]),
    (ArrmvRS, "arrmv", [Reg, StackDisp]),
    (ArrmvDR, "arrmv", [RegDisp, Reg]),
    (ArrmvXR, "arrmv", [RegIdx, Reg]),
    (ArrmvSR, "arrmv", [StackDisp, Reg]),
    (AddlRR, "addl", [Reg, Reg]),
    (AddlRD, "addl", [Reg, RegDisp]),
    (AddlRX, "addl", [Reg, RegIdx]),
    (AddlRS, "addl", [Reg, StackDisp]),
    (AddlDR, "addl", [RegDisp, Reg]),
    (AddlXR, "addl", [RegIdx, Reg]),
    (AddlSR, "addl", [StackDisp, Reg]),
    (SublRR, "subl", [Reg, Reg]),
    (SublRD, "subl", [Reg, RegDisp]),
    (SublRX, "subl", [Reg, RegIdx]),
    (SublRS, "subl", [Reg, StackDisp]),
    (SublDR, "subl", [RegDisp, Reg]),
    (SublXR, "subl", [RegIdx, Reg]),
    (SublSR, "subl", [StackDisp, Reg]),
    (MullRR, "mull", [Reg, Reg]),
    (MullRD, "mull", [Reg, RegDisp]),
    (MullRX, "mull", [Reg, RegIdx]),
    (MullRS, "mull", [Reg, StackDisp]),
    (MullDR, "mull", [RegDisp, Reg]),
    (MullXR, "mull", [RegIdx, Reg]),
    (MullSR, "mull", [StackDisp, Reg]),
    (DivlRR, "divl", [Reg, Reg]),
    (DivlRD, "divl", [Reg, RegDisp]),
    (DivlRX, "divl", [Reg, RegIdx]),
    (DivlRS, "divl", [Reg, StackDisp]),
    (DivlDR, "divl", [RegDisp, Reg]),
    (DivlXR, "divl", [RegIdx, Reg]),
    (DivlSR, "divl", [StackDisp, Reg]),
    (ModlRR, "modl", [Reg, Reg]),
    (ModlRD, "modl", [Reg, RegDisp]),
    (ModlRX, "modl", [Reg, RegIdx]),
    (ModlRS, "modl", [Reg, StackDisp]),
    (ModlDR, "modl", [RegDisp, Reg]),
    (ModlXR, "modl", [RegIdx, Reg]),
    (ModlSR, "modl", [StackDisp, Reg]),
    (DeclR, "decl", [Reg]),
    (DeclD, "decl", [RegDisp]),
    (DeclX, "decl", [RegIdx]),
    (DeclS, "decl", [StackDisp]),
    (InclR, "incl", [Reg]),
    (InclD, "incl", [RegDisp]),
    (InclX, "incl", [RegIdx]),
    (InclS, "incl", [StackDisp]),
    (NeglR, "negl", [Reg]),
    (NeglD, "negl", [RegDisp]),
    (NeglX, "negl", [RegIdx]),
    (NeglS, "negl", [StackDisp]),
    (CseqlRR, "cseql", [Reg, Reg, Reg]),
    (CseqlRD, "cseql", [Reg, RegDisp, Reg]),
    (CseqlRX, "cseql", [Reg, RegIdx, Reg]),
    (CseqlRS, "cseql", [Reg, StackDisp, Reg]),
    (CseqlDR, "cseql", [RegDisp, Reg, Reg]),
    (CseqlXR, "cseql", [RegIdx, Reg, Reg]),
    (CseqlSR, "cseql", [StackDisp, Reg, Reg]),
    (CsnelRR, "csnel", [Reg, Reg, Reg]),
    (CsnelRD, "csnel", [Reg, RegDisp, Reg]),
    (CsnelRX, "csnel", [Reg, RegIdx, Reg]),
    (CsnelRS, "csnel", [Reg, StackDisp, Reg]),
    (CsnelDR, "csnel", [RegDisp, Reg, Reg]),
    (CsnelXR, "csnel", [RegIdx, Reg, Reg]),
    (CsnelSR, "csnel", [StackDisp, Reg, Reg]),
    (CsgtlRR, "csgtl", [Reg, Reg, Reg]),
    (CsgtlRD, "csgtl", [Reg, RegDisp, Reg]),
    (CsgtlRX, "csgtl", [Reg, RegIdx, Reg]),
    (CsgtlRS, "csgtl", [Reg, StackDisp, Reg]),
    (CsgtlDR, "csgtl", [RegDisp, Reg, Reg]),
    (CsgtlXR, "csgtl", [RegIdx, Reg, Reg]),
    (CsgtlSR, "csgtl", [StackDisp, Reg, Reg]),
    (CsgelRR, "csgel", [Reg, Reg, Reg]),
    (CsgelRD, "csgel", [Reg, RegDisp, Reg]),
    (CsgelRX, "csgel", [Reg, RegIdx, Reg]),
    (CsgelRS, "csgel", [Reg, StackDisp, Reg]),
    (CsgelDR, "csgel", [RegDisp, Reg, Reg]),
    (CsgelXR, "csgel", [RegIdx, Reg, Reg]),
    (CsgelSR, "csgel", [StackDisp, Reg, Reg]),
    (CsltlRR, "csltl", [Reg, Reg, Reg]),
    (CsltlRD, "csltl", [Reg, RegDisp, Reg]),
    (CsltlRX, "csltl", [Reg, RegIdx, Reg]),
    (CsltlRS, "csltl", [Reg, StackDisp, Reg]),
    (CsltlDR, "csltl", [RegDisp, Reg, Reg]),
    (CsltlXR, "csltl", [RegIdx, Reg, Reg]),
    (CsltlSR, "csltl", [StackDisp, Reg, Reg]),
    (CslelRR, "cslel", [Reg, Reg, Reg]),
    (CslelRD, "cslel", [Reg, RegDisp, Reg]),
    (CslelRX, "cslel", [Reg, RegIdx, Reg]),
    (CslelRS, "cslel", [Reg, StackDisp, Reg]),
    (CslelDR, "cslel", [RegDisp, Reg, Reg]),
    (CslelXR, "cslel", [RegIdx, Reg, Reg]),
    (CslelSR, "cslel", [StackDisp, Reg, Reg]),
    (AddfRR, "addf", [Reg, Reg]),
    (AddfRD, "addf", [Reg, RegDisp]),
    (AddfRX, "addf", [Reg, RegIdx]),
    (AddfRS, "addf", [Reg, StackDisp]),
    (AddfDR, "addf", [RegDisp, Reg]),
    (AddfXR, "addf", [RegIdx, Reg]),
    (AddfSR, "addf", [StackDisp, Reg]),
    (SubfRR, "subf", [Reg, Reg]),
    (SubfRD, "subf", [Reg, RegDisp]),
    (SubfRX, "subf", [Reg, RegIdx]),
    (SubfRS, "subf", [Reg, StackDisp]),
    (SubfDR, "subf", [RegDisp, Reg]),
    (SubfXR, "subf", [RegIdx, Reg]),
    (SubfSR, "subf", [StackDisp, Reg]),
    (MulfRR, "mulf", [Reg, Reg]),
    (MulfRD, "mulf", [Reg, RegDisp]),
    (MulfRX, "mulf", [Reg, RegIdx]),
    (MulfRS, "mulf", [Reg, StackDisp]),
    (MulfDR, "mulf", [RegDisp, Reg]),
    (MulfXR, "mulf", [RegIdx, Reg]),
    (MulfSR, "mulf", [StackDisp, Reg]),
    (DivfRR, "divf", [Reg, Reg]),
    (DivfRD, "divf", [Reg, RegDisp]),
    (DivfRX, "divf", [Reg, RegIdx]),
    (DivfRS, "divf", [Reg, StackDisp]),
    (DivfDR, "divf", [RegDisp, Reg]),
    (DivfXR, "divf", [RegIdx, Reg]),
    (DivfSR, "divf", [StackDisp, Reg]),
    (ModfRR, "modf", [Reg, Reg]),
    (ModfRD, "modf", [Reg, RegDisp]),
    (ModfRX, "modf", [Reg, RegIdx]),
    (ModfRS, "modf", [Reg, StackDisp]),
    (ModfDR, "modf", [RegDisp, Reg]),
    (ModfXR, "modf", [RegIdx, Reg]),
    (ModfSR, "modf", [StackDisp, Reg]),
    (DecfR, "decf", [Reg]),
    (DecfD, "decf", [RegDisp]),
    (DecfX, "decf", [RegIdx]),
    (DecfS, "decf", [StackDisp]),
    (IncfR, "incf", [Reg]),
    (IncfD, "incf", [RegDisp]),
    (IncfX, "incf", [RegIdx]),
    (IncfS, "incf", [StackDisp]),
    (NegfR, "negf", [Reg]),
    (NegfD, "negf", [RegDisp]),
    (NegfX, "negf", [RegIdx]),
    (NegfS, "negf", [StackDisp]),
    (CseqfRR, "cseqf", [Reg, Reg, Reg]),
    (CseqfRD, "cseqf", [Reg, RegDisp, Reg]),
    (CseqfRX, "cseqf", [Reg, RegIdx, Reg]),
    (CseqfRS, "cseqf", [Reg, StackDisp, Reg]),
    (CseqfDR, "cseqf", [RegDisp, Reg, Reg]),
    (CseqfXR, "cseqf", [RegIdx, Reg, Reg]),
    (CseqfSR, "cseqf", [StackDisp, Reg, Reg]),
    (CsnefRR, "csnef", [Reg, Reg, Reg]),
    (CsnefRD, "csnef", [Reg, RegDisp, Reg]),
    (CsnefRX, "csnef", [Reg, RegIdx, Reg]),
    (CsnefRS, "csnef", [Reg, StackDisp, Reg]),
    (CsnefDR, "csnef", [RegDisp, Reg, Reg]),
    (CsnefXR, "csnef", [RegIdx, Reg, Reg]),
    (CsnefSR, "csnef", [StackDisp, Reg, Reg]),
    (CsgtfRR, "csgtf", [Reg, Reg, Reg]),
    (CsgtfRD, "csgtf", [Reg, RegDisp, Reg]),
    (CsgtfRX, "csgtf", [Reg, RegIdx, Reg]),
    (CsgtfRS, "csgtf", [Reg, StackDisp, Reg]),
    (CsgtfDR, "csgtf", [RegDisp, Reg, Reg]),
    (CsgtfXR, "csgtf", [RegIdx, Reg, Reg]),
    (CsgtfSR, "csgtf", [StackDisp, Reg, Reg]),
    (CsgefRR, "csgef", [Reg, Reg, Reg]),
    (CsgefRD, "csgef", [Reg, RegDisp, Reg]),
    (CsgefRX, "csgef", [Reg, RegIdx, Reg]),
    (CsgefRS, "csgef", [Reg, StackDisp, Reg]),
    (CsgefDR, "csgef", [RegDisp, Reg, Reg]),
    (CsgefXR, "csgef", [RegIdx, Reg, Reg]),
    (CsgefSR, "csgef", [StackDisp, Reg, Reg]),
    (CsltfRR, "csltf", [Reg, Reg, Reg]),
    (CsltfRD, "csltf", [Reg, RegDisp, Reg]),
    (CsltfRX, "csltf", [Reg, RegIdx, Reg]),
    (CsltfRS, "csltf", [Reg, StackDisp, Reg]),
    (CsltfDR, "csltf", [RegDisp, Reg, Reg]),
    (CsltfXR, "csltf", [RegIdx, Reg, Reg]),
    (CsltfSR, "csltf", [StackDisp, Reg, Reg]),
    (CslefRR, "cslef", [Reg, Reg, Reg]),
    (CslefRD, "cslef", [Reg, RegDisp, Reg]),
    (CslefRX, "cslef", [Reg, RegIdx, Reg]),
    (CslefRS, "cslef", [Reg, StackDisp, Reg]),
    (CslefDR, "cslef", [RegDisp, Reg, Reg]),
    (CslefXR, "cslef", [RegIdx, Reg, Reg]),
    (CslefSR, "cslef", [StackDisp, Reg, Reg]),
    (Pop, "pop", []),
    (Push, "push", []),
    (RtchkR, "rtchk", [Type, Reg]),
    (RtchkD, "rtchk", [Type, RegDisp]),
    (RtchkX, "rtchk", [Type, RegIdx]),
    (RtchkS, "rtchk", [Type, StackDisp]),
    (Jsr, "jsr", [Imm]),
    (JsrR, "jsr", [Reg]),
    (JsrD, "jsr", [RegDisp]),
    (JsrX, "jsr", [RegIdx]),
    (JsrS, "jsr", [StackDisp]),
    (Newctx, "newctx", [Type, Imm, Imm, Reg]),
    (ResumeR, "resume", [Reg]),
    (ResumeD, "resume", [RegDisp]),
    (ResumeX, "resume", [RegIdx]),
    (ResumeS, "resume", [StackDisp]),
    (Yield, "yield", []),
    (WrefRR, "wref", [Reg, Reg]),
    (WrefRD, "wref", [Reg, RegDisp]),
    (WrefRX, "wref", [Reg, RegIdx]),
    (WrefRS, "wref", [Reg, StackDisp]),
    (WrefDR, "wref", [RegDisp, Reg]),
    (WrefDD, "wref", [RegDisp, RegDisp]),
    (WrefDX, "wref", [RegDisp, RegIdx]),
    (WrefDS, "wref", [RegDisp, StackDisp]),
    (WrefXR, "wref", [RegIdx, Reg]),
    (WrefXD, "wref", [RegIdx, RegDisp]),
    (WrefXX, "wref", [RegIdx, RegIdx]),
    (WrefXS, "wref", [RegIdx, StackDisp]),
    (WrefSR, "wref", [StackDisp, Reg]),
    (WrefSD, "wref", [StackDisp, RegDisp]),
    (WrefSX, "wref", [StackDisp, RegIdx]),
    (WrefSS, "wref", [StackDisp, StackDisp]),
    (CmprefRR, "cmpref", [Reg, Reg, Reg]),
    (Newdg, "newdg", [Type, Imm, Reg]),
    (Newdgm, "newdgm", [Type, Imm, Reg, Reg]),
    (CalldgR, "calldg", [Reg]),
    (CalldgD, "calldg", [RegDisp]),
    (CalldgX, "calldg", [RegIdx]),
    (CalldgS, "calldg", [StackDisp]),
    (Throw, "throw", []),
    (Alloci, "alloci", [Type, Reg]),
    (Calli, "calli", [Type, Imm]),
    (Jmp, "jmp", [Imm]),
    (Dcvt, "dcvt", [Type, Reg, Reg]),
    (Newdgc, "newdgc", [Type, Imm, Imm, Reg]),
}

/// Mnemonic to first (base) opcode of that mnemonic.
static BASE_INDEX: Lazy<HashMap<&'static str, OpCode>> = Lazy::new(|| {
    let mut map = HashMap::new();
    for info in INFO {
        map.entry(info.mnemonic).or_insert(info.opcode);
    }
    map
});

impl OpCode {
    /// Every opcode, in table order.
    pub fn all() -> impl Iterator<Item = OpCode> {
        INFO.iter().map(|i| i.opcode)
    }

    /// Converts a raw instruction word into an opcode.
    pub fn from_word(word: i32) -> Option<OpCode> {
        OpCode::from_i32(word)
    }

    /// The info table entry for this opcode.
    pub fn info(self) -> &'static InstrInfo {
        &INFO[self as usize]
    }

    /// Assembler mnemonic of this opcode.
    pub fn mnemonic(self) -> &'static str {
        self.info().mnemonic
    }

    /// Operand kinds of this opcode in encoding order.
    pub fn operand_kinds(self) -> &'static [OperandKind] {
        self.info().kinds
    }

    /// Instruction size in words, including the opcode word.
    pub fn size(self) -> usize {
        self.info().size()
    }

    /// The base opcode: the variant of this mnemonic with the simplest
    /// addressing modes (the first table entry with the same mnemonic).
    pub fn base(self) -> OpCode {
        BASE_INDEX[self.mnemonic()]
    }

    /// Finds the opcode with the given base mnemonic and exact operand
    /// kind signature, if the combination exists in the table.
    pub fn from_base_and_kinds(base: OpCode, kinds: &[OperandKind]) -> Option<OpCode> {
        let mn = base.mnemonic();
        INFO[base as usize..]
            .iter()
            .take_while(|i| i.mnemonic == mn)
            .find(|i| i.kinds == kinds)
            .map(|i| i.opcode)
    }

    /// Size in words of an instruction starting with the given raw word,
    /// or 0 if the word is not a valid opcode.
    pub fn instruction_size(word: i32) -> usize {
        OpCode::from_word(word).map_or(0, |op| op.size())
    }
}

/// Verifies the instruction info table: entries indexed by their own
/// opcode, sizes consistent with the operand kinds, at most four operands.
pub fn check_instruction_tables() -> crate::error::VmResult<()> {
    for (i, info) in INFO.iter().enumerate() {
        if info.opcode as usize != i {
            return Err(crate::error::VmError::InstructionTableCorrupt {
                reason: format!("entry {} holds opcode {:?}", i, info.opcode),
            });
        }
        if info.kinds.len() > 4 {
            return Err(crate::error::VmError::InstructionTableCorrupt {
                reason: format!("{:?} has {} operands", info.opcode, info.kinds.len()),
            });
        }
        let size = 1 + info.kinds.iter().map(|k| k.size()).sum::<usize>();
        if size != info.size() {
            return Err(crate::error::VmError::InstructionTableCorrupt {
                reason: format!("{:?} size {} != {}", info.opcode, info.size(), size),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_indexed_by_opcode() {
        for (i, info) in INFO.iter().enumerate() {
            assert_eq!(info.opcode as usize, i, "entry {} out of order", i);
        }
    }

    #[test]
    fn test_size_consistency() {
        for op in OpCode::all() {
            let expected = 1 + op
                .operand_kinds()
                .iter()
                .map(|k| k.size())
                .sum::<usize>();
            assert_eq!(op.size(), expected, "size mismatch for {:?}", op);
        }
    }

    #[test]
    fn test_from_word_round_trip() {
        for op in OpCode::all() {
            assert_eq!(OpCode::from_word(op as i32), Some(op));
        }
        assert_eq!(OpCode::from_word(-1), None);
        assert_eq!(OpCode::from_word(INFO.len() as i32), None);
    }

    #[test]
    fn test_base_lookup() {
        assert_eq!(OpCode::MoveSS.base(), OpCode::MoveRR);
        assert_eq!(OpCode::AddXR.base(), OpCode::AddRR);
        assert_eq!(OpCode::Nop.base(), OpCode::Nop);
        // `pop` and `push` have both a bare form and EA forms under one
        // mnemonic; the bare form comes later in the table, so the EA form
        // is the base.
        assert_eq!(OpCode::Pop.base(), OpCode::PopR);
    }

    #[test]
    fn test_from_base_and_kinds() {
        let found = OpCode::from_base_and_kinds(
            OpCode::MoveRR,
            &[OperandKind::StackDisp, OperandKind::RegDisp],
        );
        assert_eq!(found, Some(OpCode::MoveSD));
        let none = OpCode::from_base_and_kinds(
            OpCode::AddRR,
            &[OperandKind::RegDisp, OperandKind::RegDisp],
        );
        assert_eq!(none, None);
    }

    #[test]
    fn test_well_known_sizes() {
        assert_eq!(OpCode::Nop.size(), 1);
        assert_eq!(OpCode::Bra.size(), 2);
        assert_eq!(OpCode::MoveRR.size(), 3);
        assert_eq!(OpCode::MoveDD.size(), 5);
        assert_eq!(OpCode::CseqRD.size(), 5);
        assert_eq!(OpCode::Newctx.size(), 5);
        assert_eq!(OpCode::PushRange.size(), 3);
    }
}
