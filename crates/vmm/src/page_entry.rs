//! Leaf page table entries.
//!
//! A leaf entry is stored in exactly the format the TLB expects in its EntryLo
//! register, so a refill copies it into the TLB without any conversion:
//!
//! ```text
//!  31                      12 11  10  9   8   7      0
//! +--------------------------+---+---+---+---+--------+
//! |    physical frame        | N | D | V | G |  zero  |
//! +--------------------------+---+---+---+---+--------+
//! ```
//!
//! `D` ("dirty") is the write-enable bit: a page whose entry lacks it traps on store.

use core::fmt;
use core::ops::{BitOr, BitOrAssign};

use crate::{PhysicalAddress, arch};

/// Flag bits of a leaf page table entry.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageFlags(u32);

impl PageFlags {
    /// Translation is cached without going through the data cache.
    pub const NOCACHE: Self = Self(1 << 11);
    /// Writes are permitted.
    pub const DIRTY: Self = Self(1 << 10);
    /// The entry holds a translation.
    pub const VALID: Self = Self(1 << 9);
    /// The translation matches every address-space identifier.
    pub const GLOBAL: Self = Self(1 << 8);

    const ALL: u32 = Self::NOCACHE.0 | Self::DIRTY.0 | Self::VALID.0 | Self::GLOBAL.0;

    /// Returns an empty set of flags.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Returns flags for a valid mapping, writable if `writable` is set.
    pub const fn mapped(writable: bool) -> Self {
        if writable {
            Self(Self::VALID.0 | Self::DIRTY.0)
        } else {
            Self::VALID
        }
    }

    /// Builds flags from raw bits, discarding anything that is not a flag.
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::ALL)
    }

    /// Returns the raw flag bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns true if every flag in `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for PageFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for PageFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::NOCACHE, "NOCACHE"),
            (Self::DIRTY, "DIRTY"),
            (Self::VALID, "VALID"),
            (Self::GLOBAL, "GLOBAL"),
        ];

        let mut set = f.debug_set();
        for (flag, name) in names {
            if self.contains(flag) {
                set.entry(&format_args!("{name}"));
            }
        }
        set.finish()
    }
}

/// A leaf page table entry (and TLB EntryLo value).
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u32);

impl PageEntry {
    /// An entry that maps nothing.
    pub const EMPTY: Self = Self(0);

    /// Mask selecting the physical frame.
    const ADDRESS_MASK: u32 = arch::PAGE_FRAME as u32;

    /// Creates a new entry mapping the frame at `address`.
    ///
    /// # Panics
    ///
    /// Panics if `address` is not page-aligned.
    pub fn new(address: PhysicalAddress, flags: PageFlags) -> Self {
        assert!(
            address.is_aligned(arch::PAGE_SIZE),
            "physical address must be page-aligned"
        );
        Self((address.as_usize() as u32 & Self::ADDRESS_MASK) | flags.bits())
    }

    /// Reinterprets a raw EntryLo value.
    pub const fn from_u32(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw EntryLo value.
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the physical frame stored in this entry, or `None` if the entry is not valid.
    pub fn address(self) -> Option<PhysicalAddress> {
        if self.is_valid() {
            Some(PhysicalAddress::from(self.0 & Self::ADDRESS_MASK))
        } else {
            None
        }
    }

    /// Returns the flags for this entry.
    pub const fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    /// Returns whether the entry holds a translation.
    pub const fn is_valid(self) -> bool {
        self.flags().contains(PageFlags::VALID)
    }

    /// Returns whether the entry permits writes.
    pub const fn is_dirty(self) -> bool {
        self.flags().contains(PageFlags::DIRTY)
    }

    /// Removes write permission, keeping the translation.
    pub fn write_protect(&mut self) {
        self.0 &= !PageFlags::DIRTY.bits();
    }

    /// Clears this entry.
    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageEntry")
            .field("frame", &format_args!("{:#010x}", self.0 & Self::ADDRESS_MASK))
            .field("flags", &self.flags())
            .finish()
    }
}
