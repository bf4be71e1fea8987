//! The translation lookaside buffer and the interrupt state that guards it.
//!
//! The TLB is refilled by software: on a miss the fault handler looks up the page
//! table and writes an entry pair into a slot chosen by the hardware's Random
//! register. Everything that touches the TLB goes through an [`Mmu`], which owns
//! both the TLB and the interrupt controller and keeps interrupts off for the
//! duration of every TLB write.

use core::fmt;

use crate::{PageEntry, PhysicalAddress, VirtualAddress, arch};

/// The EntryHi half of a TLB entry: the virtual page it translates.
///
/// ```text
///  31                      12 11    6 5      0
/// +--------------------------+-------+--------+
/// |      virtual page        |  PID  |  zero  |
/// +--------------------------+-------+--------+
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct EntryHi(u32);

impl EntryHi {
    /// Mask selecting the virtual page.
    pub const VPAGE: u32 = arch::PAGE_FRAME as u32;
    /// Mask selecting the address-space identifier.
    pub const PID: u32 = 0x0000_0FC0;
    /// Shift of the address-space identifier.
    pub const PID_SHIFT: u32 = 6;

    /// Creates an EntryHi matching the page that contains `address`.
    pub const fn new(address: VirtualAddress) -> Self {
        Self(address.as_usize() as u32 & Self::VPAGE)
    }

    /// Returns an EntryHi that can never match a user or kernel lookup.
    ///
    /// Each slot gets a distinct page inside the unmapped kernel segment so that
    /// no two invalidated slots ever match the same address.
    pub const fn invalid(slot: usize) -> Self {
        Self(((0x80000 + slot) << arch::PAGE_SHIFT) as u32)
    }

    /// Reinterprets a raw EntryHi value.
    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw EntryHi value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the virtual page this entry matches.
    pub const fn page(self) -> VirtualAddress {
        VirtualAddress::new((self.0 & Self::VPAGE) as usize)
    }

    /// Returns the address-space identifier field.
    pub const fn pid(self) -> u32 {
        (self.0 & Self::PID) >> Self::PID_SHIFT
    }
}

impl fmt::Debug for EntryHi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryHi({:#010x}, pid={})", self.0 & Self::VPAGE, self.pid())
    }
}

/// A complete TLB entry: the page it matches and the translation it supplies.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct TlbEntry {
    pub hi: EntryHi,
    pub lo: PageEntry,
}

impl TlbEntry {
    /// Creates an entry translating the page containing `page` with `lo`.
    pub const fn new(page: VirtualAddress, lo: PageEntry) -> Self {
        Self {
            hi: EntryHi::new(page),
            lo,
        }
    }

    /// Returns the invalid entry written into `slot` when the TLB is flushed.
    pub const fn invalid(slot: usize) -> Self {
        Self {
            hi: EntryHi::invalid(slot),
            lo: PageEntry::EMPTY,
        }
    }

    /// Returns true if this entry translates `address`.
    pub fn matches(&self, address: VirtualAddress) -> bool {
        self.lo.is_valid() && self.hi.page() == address.page_base()
    }

    /// Translates `address` through this entry, if it matches.
    pub fn translate(&self, address: VirtualAddress) -> Option<PhysicalAddress> {
        if !self.matches(address) {
            return None;
        }
        self.lo
            .address()
            .map(|frame| frame + address.page_offset())
    }
}

/// A software-refilled translation lookaside buffer.
pub trait Tlb {
    /// Writes `entry` into `slot`.
    fn write(&mut self, slot: usize, entry: TlbEntry);

    /// Writes `entry` into the slot selected by the hardware's Random register.
    fn write_random(&mut self, entry: TlbEntry);

    /// Invalidates every slot.
    fn invalidate_all(&mut self) {
        for slot in 0..arch::TLB_SLOTS {
            self.write(slot, TlbEntry::invalid(slot));
        }
    }
}

/// Processor interrupt control.
pub trait Interrupts {
    /// Disables interrupts, returning whether they were enabled before.
    fn disable(&self) -> bool;

    /// Re-enables interrupts if `enabled` is true; leaves them off otherwise.
    fn restore(&self, enabled: bool);
}

impl<I: Interrupts + ?Sized> Interrupts for &I {
    fn disable(&self) -> bool {
        (**self).disable()
    }

    fn restore(&self, enabled: bool) {
        (**self).restore(enabled)
    }
}

/// Keeps interrupts disabled until dropped, then restores the previous state.
pub struct InterruptGuard<'a, I: Interrupts + ?Sized> {
    interrupts: &'a I,
    enabled: bool,
}

impl<'a, I: Interrupts + ?Sized> InterruptGuard<'a, I> {
    pub fn new(interrupts: &'a I) -> Self {
        let enabled = interrupts.disable();
        Self {
            interrupts,
            enabled,
        }
    }
}

impl<I: Interrupts + ?Sized> Drop for InterruptGuard<'_, I> {
    fn drop(&mut self) {
        self.interrupts.restore(self.enabled);
    }
}

/// The memory-management unit of one processor: its TLB and interrupt control.
pub struct Mmu<T: Tlb, I: Interrupts> {
    tlb: T,
    interrupts: I,
}

impl<T: Tlb, I: Interrupts> Mmu<T, I> {
    pub const fn new(tlb: T, interrupts: I) -> Self {
        Self { tlb, interrupts }
    }

    /// Installs `entry` into a random TLB slot with interrupts disabled.
    pub fn install(&mut self, entry: TlbEntry) {
        let _guard = InterruptGuard::new(&self.interrupts);
        log::trace!("tlb: install {:?} -> {:?}", entry.hi, entry.lo);
        self.tlb.write_random(entry);
    }

    /// Invalidates every TLB slot with interrupts disabled.
    pub fn invalidate_all(&mut self) {
        let _guard = InterruptGuard::new(&self.interrupts);
        self.tlb.invalidate_all();
    }

    pub fn tlb(&self) -> &T {
        &self.tlb
    }

    pub fn interrupts(&self) -> &I {
        &self.interrupts
    }
}
