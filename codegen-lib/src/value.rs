//! Machine values: where an IR value currently lives.

use crate::registers::Register;
use air::CmpOp;
use strum_macros::EnumDiscriminants;

/// The tagged description of an IR value's current location. Every variant
/// must be covered by the predicates below and by the value movers; all
/// matches are exhaustive so a new variant fails to compile until it is.
#[derive(Debug, Clone, Copy, PartialEq, EnumDiscriminants)]
pub enum MachineValue {
    /// Zero-sized type; no storage.
    None,
    /// Control flow cannot observe this value.
    Unreach,
    /// No longer live.
    Dead,
    /// Explicitly undefined.
    Undef,
    /// Fits in a general-purpose register, used as a literal.
    Immediate(u64),
    /// Currently in a register, tracked in its 64-bit form.
    Register(Register),
    /// At `offset` bytes below the frame pointer.
    StackOffset(u32),
    /// The *address* of the stack slot `offset` bytes below the frame
    /// pointer.
    PtrStackOffset(u32),
    /// At a hard-coded absolute address.
    Memory(u64),
    /// Placed inside the emitted code stream.
    EmbeddedInCode(u32),
    /// The address of a spot inside the emitted code stream.
    PtrEmbeddedInCode(u32),
    /// Loaded through a GOT entry the linker resolves.
    GotLoad(u32),
    /// Loaded through a direct relocation the linker resolves.
    DirectLoad(u32),
    /// Whatever the condition flags report for `op` after a signed compare.
    CompareFlagsSigned(CmpOp),
    /// Whatever the condition flags report for `op` after an unsigned
    /// compare.
    CompareFlagsUnsigned(CmpOp),
}

impl MachineValue {
    pub fn is_memory(&self) -> bool {
        match self {
            MachineValue::StackOffset(_)
            | MachineValue::Memory(_)
            | MachineValue::EmbeddedInCode(_)
            | MachineValue::GotLoad(_)
            | MachineValue::DirectLoad(_) => true,
            MachineValue::None
            | MachineValue::Unreach
            | MachineValue::Dead
            | MachineValue::Undef
            | MachineValue::Immediate(_)
            | MachineValue::Register(_)
            | MachineValue::PtrStackOffset(_)
            | MachineValue::PtrEmbeddedInCode(_)
            | MachineValue::CompareFlagsSigned(_)
            | MachineValue::CompareFlagsUnsigned(_) => false,
        }
    }

    pub fn is_immediate(&self) -> bool {
        match self {
            MachineValue::Immediate(_) => true,
            MachineValue::None
            | MachineValue::Unreach
            | MachineValue::Dead
            | MachineValue::Undef
            | MachineValue::Register(_)
            | MachineValue::StackOffset(_)
            | MachineValue::PtrStackOffset(_)
            | MachineValue::Memory(_)
            | MachineValue::EmbeddedInCode(_)
            | MachineValue::PtrEmbeddedInCode(_)
            | MachineValue::GotLoad(_)
            | MachineValue::DirectLoad(_)
            | MachineValue::CompareFlagsSigned(_)
            | MachineValue::CompareFlagsUnsigned(_) => false,
        }
    }

    pub fn is_register(&self) -> bool {
        match self {
            MachineValue::Register(_) => true,
            MachineValue::None
            | MachineValue::Unreach
            | MachineValue::Dead
            | MachineValue::Undef
            | MachineValue::Immediate(_)
            | MachineValue::StackOffset(_)
            | MachineValue::PtrStackOffset(_)
            | MachineValue::Memory(_)
            | MachineValue::EmbeddedInCode(_)
            | MachineValue::PtrEmbeddedInCode(_)
            | MachineValue::GotLoad(_)
            | MachineValue::DirectLoad(_)
            | MachineValue::CompareFlagsSigned(_)
            | MachineValue::CompareFlagsUnsigned(_) => false,
        }
    }

    /// Can a mover write through this location?
    pub fn is_mutable(&self) -> bool {
        match self {
            MachineValue::Register(_)
            | MachineValue::StackOffset(_)
            | MachineValue::Memory(_) => true,
            MachineValue::None
            | MachineValue::Unreach
            | MachineValue::Dead
            | MachineValue::Undef
            | MachineValue::Immediate(_)
            | MachineValue::PtrStackOffset(_)
            | MachineValue::EmbeddedInCode(_)
            | MachineValue::PtrEmbeddedInCode(_)
            | MachineValue::GotLoad(_)
            | MachineValue::DirectLoad(_)
            | MachineValue::CompareFlagsSigned(_)
            | MachineValue::CompareFlagsUnsigned(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::Register as R;

    #[test]
    fn predicates_partition_the_variants() {
        assert!(MachineValue::StackOffset(8).is_memory());
        assert!(!MachineValue::PtrStackOffset(8).is_memory());
        assert!(MachineValue::Immediate(7).is_immediate());
        assert!(MachineValue::Register(R::x19).is_register());
        assert!(MachineValue::Register(R::x19).is_mutable());
        assert!(!MachineValue::Immediate(7).is_mutable());
        assert!(!MachineValue::CompareFlagsUnsigned(CmpOp::Gt).is_mutable());
    }
}
