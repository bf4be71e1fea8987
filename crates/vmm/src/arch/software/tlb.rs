//! Emulated TLB.

use crate::arch::{TLB_SLOTS, TLB_WIRED_SLOTS};
use crate::tlb::{Tlb, TlbEntry};
use crate::{PhysicalAddress, VirtualAddress};

/// A software model of the R3000 TLB.
///
/// The Random register counts down from the top slot to the first unwired slot
/// and then wraps, so random writes never land in a wired slot.
pub struct SoftTlb {
    entries: [TlbEntry; TLB_SLOTS],
    random: usize,
}

impl SoftTlb {
    /// Creates a TLB with every slot invalid.
    pub fn new() -> Self {
        Self {
            entries: core::array::from_fn(TlbEntry::invalid),
            random: TLB_SLOTS - 1,
        }
    }

    /// Returns the slot holding a translation for `address`, if any.
    pub fn probe(&self, address: VirtualAddress) -> Option<usize> {
        self.entries.iter().position(|entry| entry.matches(address))
    }

    /// Translates `address` the way the hardware would on a TLB hit.
    pub fn translate(&self, address: VirtualAddress) -> Option<PhysicalAddress> {
        self.entries
            .iter()
            .find_map(|entry| entry.translate(address))
    }

    pub fn entry(&self, slot: usize) -> TlbEntry {
        self.entries[slot]
    }

    pub fn entries(&self) -> &[TlbEntry] {
        &self.entries
    }

    /// Returns the number of slots holding a valid translation.
    pub fn valid_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.lo.is_valid()).count()
    }

    fn advance_random(&mut self) {
        self.random = if self.random <= TLB_WIRED_SLOTS {
            TLB_SLOTS - 1
        } else {
            self.random - 1
        };
    }
}

impl Default for SoftTlb {
    fn default() -> Self {
        Self::new()
    }
}

impl Tlb for SoftTlb {
    fn write(&mut self, slot: usize, entry: TlbEntry) {
        assert!(slot < TLB_SLOTS, "tlb slot out of range");
        self.entries[slot] = entry;
    }

    fn write_random(&mut self, entry: TlbEntry) {
        let slot = self.random;
        self.entries[slot] = entry;
        self.advance_random();
    }
}
