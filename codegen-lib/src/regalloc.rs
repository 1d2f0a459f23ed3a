//! Bookkeeping for the fixed pool of allocatable registers.
//!
//! The manager only records who holds what; it never emits code. Spilling
//! is a capability of the owning codegen context, which picks a victim via
//! [`RegisterManager::owner`] and stores it out itself.
//!
//! Registers handed out without an owner stay in the free set: they are
//! momentary scratch values, protected from reuse only by a freeze. Every
//! freeze returns a token that must be given back; dropping an unreleased
//! token trips a debug assertion, so a leaked freeze fails loudly in tests.

use crate::registers::{Register, ALLOCATABLE_REGS};
use air::InstIdx;

const POOL: usize = ALLOCATABLE_REGS.len();

#[derive(Debug)]
pub struct RegisterManager {
    /// Owner of each pool register while it is allocated.
    owners: [Option<InstIdx>; POOL],
    /// Bit i set means pool register i is free.
    free: u16,
    /// Freeze depth per pool register.
    frozen: [u8; POOL],
    /// Every pool register ever handed out; drives the prologue save mask.
    allocated_ever: u16,
}

/// Snapshot of the allocation state taken before a conditional branch.
#[derive(Debug, Clone, Copy)]
pub struct RegisterSnapshot {
    owners: [Option<InstIdx>; POOL],
    free: u16,
}

/// Token for a set of frozen registers.
#[must_use]
#[derive(Debug)]
pub struct FrozenRegs {
    mask: u16,
}

impl Drop for FrozenRegs {
    fn drop(&mut self) {
        debug_assert!(self.mask == 0, "frozen registers were never released");
    }
}

impl Default for RegisterManager {
    fn default() -> RegisterManager {
        RegisterManager {
            owners: [None; POOL],
            free: (1 << POOL) - 1,
            frozen: [0; POOL],
            allocated_ever: 0,
        }
    }
}

impl RegisterManager {
    pub fn new() -> RegisterManager {
        RegisterManager::default()
    }

    /// Hand out a free register without spilling. With an owner the
    /// register leaves the free set until [`free_reg`]; without one it is
    /// momentary scratch (see module docs).
    pub fn try_alloc(&mut self, owner: Option<InstIdx>) -> Option<Register> {
        for (i, reg) in ALLOCATABLE_REGS.iter().enumerate() {
            if self.free & (1 << i) == 0 || self.frozen[i] > 0 {
                continue;
            }
            self.allocated_ever |= 1 << i;
            if let Some(inst) = owner {
                self.free &= !(1 << i);
                self.owners[i] = Some(inst);
                log::debug!("alloc {} for {}", reg, inst);
            } else {
                log::debug!("alloc {} as scratch", reg);
            }
            return Some(*reg);
        }
        None
    }

    /// Atomically hand out one distinct register per requested owner.
    pub fn try_alloc_many(&mut self, owners: &[Option<InstIdx>]) -> Option<Vec<Register>> {
        let mut picked = Vec::with_capacity(owners.len());
        let mut taken = 0u16;
        for (i, reg) in ALLOCATABLE_REGS.iter().enumerate() {
            if picked.len() == owners.len() {
                break;
            }
            if self.free & (1 << i) == 0 || self.frozen[i] > 0 || taken & (1 << i) != 0 {
                continue;
            }
            taken |= 1 << i;
            picked.push(*reg);
        }
        if picked.len() < owners.len() {
            return None;
        }
        self.allocated_ever |= taken;
        for (reg, owner) in picked.iter().zip(owners) {
            if let Some(inst) = *owner {
                let i = reg.alloc_index().unwrap();
                self.free &= !(1 << i);
                self.owners[i] = Some(inst);
            }
        }
        Some(picked)
    }

    /// Claim a register the caller knows to be free, e.g. when an
    /// instruction's result reuses the register of an operand that just
    /// died.
    pub fn get_assume_free(&mut self, reg: Register, owner: InstIdx) {
        let i = match reg.alloc_index() {
            Some(i) => i,
            None => return,
        };
        debug_assert!(self.free & (1 << i) != 0);
        self.free &= !(1 << i);
        self.owners[i] = Some(owner);
        self.allocated_ever |= 1 << i;
    }

    pub fn free_reg(&mut self, reg: Register) {
        if let Some(i) = reg.alloc_index() {
            log::debug!("free {}", reg);
            self.free |= 1 << i;
            self.owners[i] = None;
        }
    }

    pub fn is_free(&self, reg: Register) -> bool {
        match reg.alloc_index() {
            Some(i) => self.free & (1 << i) != 0,
            None => true,
        }
    }

    pub fn is_allocated(&self, reg: Register) -> bool {
        !self.is_free(reg)
    }

    pub fn is_frozen(&self, reg: Register) -> bool {
        match reg.alloc_index() {
            Some(i) => self.frozen[i] > 0,
            None => false,
        }
    }

    pub fn owner(&self, reg: Register) -> Option<InstIdx> {
        reg.alloc_index().and_then(|i| self.owners[i])
    }

    /// Transfer ownership of an allocated register to another instruction.
    pub fn set_owner(&mut self, reg: Register, owner: InstIdx) {
        if let Some(i) = reg.alloc_index() {
            self.owners[i] = Some(owner);
        }
    }

    /// Exclude `regs` from allocation and from spill victim selection until
    /// the returned token is passed to [`unfreeze_regs`]. Nesting is fine;
    /// a register is thawed when every freeze covering it is released.
    pub fn freeze_regs(&mut self, regs: &[Register]) -> FrozenRegs {
        let mut mask = 0u16;
        for reg in regs {
            if let Some(i) = reg.alloc_index() {
                self.frozen[i] += 1;
                mask |= 1 << i;
            }
        }
        FrozenRegs { mask }
    }

    pub fn unfreeze_regs(&mut self, mut token: FrozenRegs) {
        for i in 0..POOL {
            if token.mask & (1 << i) != 0 {
                debug_assert!(self.frozen[i] > 0);
                self.frozen[i] -= 1;
            }
        }
        token.mask = 0;
    }

    /// Holds at every instruction boundary.
    pub fn frozen_regs_exist(&self) -> bool {
        self.frozen.iter().any(|depth| *depth > 0)
    }

    /// Bitmask over the pool of every register handed out during the
    /// function, for the prologue's save list.
    pub fn allocated_mask(&self) -> u32 {
        u32::from(self.allocated_ever)
    }

    pub fn snapshot(&self) -> RegisterSnapshot {
        RegisterSnapshot { owners: self.owners, free: self.free }
    }

    /// Roll back to `snapshot`. The ever-allocated mask is deliberately
    /// kept; the prologue must save everything either branch touched.
    pub fn restore(&mut self, snapshot: RegisterSnapshot) {
        self.owners = snapshot.owners;
        self.free = snapshot.free;
    }
}
