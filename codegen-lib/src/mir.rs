//! The target instruction stream produced by the backend: a flat list of
//! tagged records mixing real AArch64 forms with pseudo-ops for the
//! downstream emit stage and the linker.
//!
//! Branch targets are indices into the same list. During generation a
//! branch may carry [`UNDEFINED_TARGET`] while its index sits on a
//! relocation list; every such target is patched in place before the
//! stream leaves the backend.

use crate::registers::Register;
use air::CmpOp;
use strum_macros::EnumDiscriminants;

/// Index of an instruction within the stream.
pub type MirIdx = u32;

/// Placeholder target of a not-yet-patched branch.
pub const UNDEFINED_TARGET: MirIdx = MirIdx::max_value();

/// AArch64 condition codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    Cs,
    Cc,
    Mi,
    Pl,
    Vs,
    Vc,
    Hi,
    Ls,
    Ge,
    Lt,
    Gt,
    Le,
}

impl Cond {
    pub fn negate(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Cs => Cond::Cc,
            Cond::Cc => Cond::Cs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
        }
    }

    /// Condition under which `a op b` holds after `cmp a, b` on signed
    /// operands.
    pub fn from_cmp_op_signed(op: CmpOp) -> Cond {
        match op {
            CmpOp::Lt => Cond::Lt,
            CmpOp::Lte => Cond::Le,
            CmpOp::Eq => Cond::Eq,
            CmpOp::Gte => Cond::Ge,
            CmpOp::Gt => Cond::Gt,
            CmpOp::Neq => Cond::Ne,
        }
    }

    /// Condition under which `a op b` holds after `cmp a, b` on unsigned
    /// operands.
    pub fn from_cmp_op_unsigned(op: CmpOp) -> Cond {
        match op {
            CmpOp::Lt => Cond::Cc,
            CmpOp::Lte => Cond::Ls,
            CmpOp::Eq => Cond::Eq,
            CmpOp::Gte => Cond::Cs,
            CmpOp::Gt => Cond::Hi,
            CmpOp::Neq => Cond::Ne,
        }
    }
}

#[derive(Debug, Clone, PartialEq, EnumDiscriminants)]
pub enum Inst {
    AddImmediate { rd: Register, rn: Register, imm12: u16 },
    /// Register form with `lsl #imm6` shift encoding.
    AddShiftedRegister { rd: Register, rn: Register, rm: Register, imm6: u8 },
    SubImmediate { rd: Register, rn: Register, imm12: u16 },
    SubShiftedRegister { rd: Register, rn: Register, rm: Register, imm6: u8 },
    Mul { rd: Register, rn: Register, rm: Register },
    AndShiftedRegister { rd: Register, rn: Register, rm: Register, imm6: u8 },
    OrrShiftedRegister { rd: Register, rn: Register, rm: Register, imm6: u8 },
    EorShiftedRegister { rd: Register, rn: Register, rm: Register, imm6: u8 },
    /// Logical immediate; `imm` is encoded as a bitmask by the emit stage.
    AndImmediate { rd: Register, rn: Register, imm: u64 },
    EorImmediate { rd: Register, rn: Register, imm: u64 },
    Mvn { rd: Register, rm: Register, imm6: u8 },
    CmpImmediate { rn: Register, imm12: u16 },
    CmpShiftedRegister { rn: Register, rm: Register, imm6: u8 },
    Movz { rd: Register, imm16: u16, hw: u8 },
    Movk { rd: Register, imm16: u16, hw: u8 },
    MovRegister { rd: Register, rm: Register },
    /// Register move encoded via `add #0`, usable with sp.
    MovToFromSp { rd: Register, rn: Register },
    /// Conditional set. The condition is stored pre-negated, matching the
    /// csinc encoding the emit stage lowers this to.
    Cset { rd: Register, cond: Cond },
    Ldr { rt: Register, rn: Register, offset: i32 },
    Ldrh { rt: Register, rn: Register, offset: i32 },
    Ldrb { rt: Register, rn: Register, offset: i32 },
    /// Register-offset byte load, `ldrb rt, [rn, rm]`.
    LdrbRegister { rt: Register, rn: Register, rm: Register },
    Str { rt: Register, rn: Register, offset: i32 },
    Strh { rt: Register, rn: Register, offset: i32 },
    Strb { rt: Register, rn: Register, offset: i32 },
    StrbRegister { rt: Register, rn: Register, rm: Register },
    LdpPostIndex { rt: Register, rt2: Register, rn: Register, offset: i16 },
    StpPreIndex { rt: Register, rt2: Register, rn: Register, offset: i16 },
    B { target: MirIdx },
    BCond { cond: Cond, target: MirIdx },
    Cbz { rt: Register, target: MirIdx },
    Blr { rn: Register },
    Ret { rn: Register },
    Brk { imm16: u16 },
    Svc { imm16: u16 },
    /// Placeholder overwritten by the prologue back-patcher.
    Nop,
    /// Save the callee-preserved registers named by `mask` (bit i is the
    /// i-th allocatable register).
    PushRegs { mask: u32 },
    PopRegs { mask: u32 },
    DbgLine { line: u32, column: u32 },
    DbgPrologueEnd,
    DbgEpilogueBegin,
    /// Load the value behind a GOT entry the linker resolves later.
    LoadMemoryGot { rt: Register, atom_index: u32, sym_index: u32 },
    LoadMemoryDirect { rt: Register, atom_index: u32, sym_index: u32 },
    /// Load the address of a GOT-resolved symbol.
    LoadMemoryPtrGot { rt: Register, atom_index: u32, sym_index: u32 },
    LoadMemoryPtrDirect { rt: Register, atom_index: u32, sym_index: u32 },
    CallExtern { atom_index: u32, sym_index: u32 },
}

/// The finished per-function instruction stream.
#[derive(Debug)]
pub struct Mir {
    pub instructions: Vec<Inst>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negation_is_an_involution() {
        let all = [
            Cond::Eq,
            Cond::Ne,
            Cond::Cs,
            Cond::Cc,
            Cond::Mi,
            Cond::Pl,
            Cond::Vs,
            Cond::Vc,
            Cond::Hi,
            Cond::Ls,
            Cond::Ge,
            Cond::Lt,
            Cond::Gt,
            Cond::Le,
        ];
        for cond in &all {
            assert_ne!(cond.negate(), *cond);
            assert_eq!(cond.negate().negate(), *cond);
        }
    }

    #[test]
    fn unsigned_comparisons_use_unsigned_conditions() {
        assert_eq!(Cond::from_cmp_op_unsigned(CmpOp::Gt), Cond::Hi);
        assert_eq!(Cond::from_cmp_op_unsigned(CmpOp::Lte), Cond::Ls);
        assert_eq!(Cond::from_cmp_op_signed(CmpOp::Gt), Cond::Gt);
        assert_eq!(Cond::from_cmp_op_signed(CmpOp::Lte), Cond::Le);
    }
}
