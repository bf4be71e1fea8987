//! Regions of a user address space.

use core::fmt;
use core::ops::BitOr;

use crate::arch::PAGE_SIZE;
use crate::{PageNumber, VirtualAddress};

/// Access permissions of a region.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct Permissions(u8);

impl Permissions {
    pub const NONE: Self = Self(0);
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const EXECUTE: Self = Self(1 << 2);

    /// Builds permissions from the three loader flags.
    pub const fn new(readable: bool, writable: bool, executable: bool) -> Self {
        let mut bits = 0;
        if readable {
            bits |= Self::READ.0;
        }
        if writable {
            bits |= Self::WRITE.0;
        }
        if executable {
            bits |= Self::EXECUTE.0;
        }
        Self(bits)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_readable(self) -> bool {
        self.contains(Self::READ)
    }

    pub const fn is_writable(self) -> bool {
        self.contains(Self::WRITE)
    }

    pub const fn is_executable(self) -> bool {
        self.contains(Self::EXECUTE)
    }
}

impl BitOr for Permissions {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Debug for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |set: bool, c: char| if set { c } else { '-' };
        write!(
            f,
            "{}{}{}",
            flag(self.is_readable(), 'r'),
            flag(self.is_writable(), 'w'),
            flag(self.is_executable(), 'x')
        )
    }
}

/// A page-aligned, permission-tagged range of user addresses.
///
/// A region remembers the permissions it was defined with so that the loader can
/// open it up for writing while filling it and put things back afterwards.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Region {
    base: VirtualAddress,
    size: usize,
    permissions: Permissions,
    original: Permissions,
}

impl Region {
    /// Creates a region covering `[base, base + size)`.
    ///
    /// # Panics
    ///
    /// Panics if `base` or `size` is not page-aligned.
    pub fn new(base: VirtualAddress, size: usize, permissions: Permissions) -> Self {
        assert!(base.is_aligned(PAGE_SIZE), "region base must be page-aligned");
        assert!(size % PAGE_SIZE == 0, "region size must be a whole number of pages");
        Self {
            base,
            size,
            permissions,
            original: permissions,
        }
    }

    pub fn base(&self) -> VirtualAddress {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the first address past the region.
    pub fn end(&self) -> usize {
        self.base.as_usize() + self.size
    }

    /// Returns the permissions currently in force.
    pub fn permissions(&self) -> Permissions {
        self.permissions
    }

    /// Returns the permissions the region was defined with.
    pub fn original_permissions(&self) -> Permissions {
        self.original
    }

    pub fn contains(&self, address: VirtualAddress) -> bool {
        address >= self.base && address.as_usize() < self.end()
    }

    /// Iterates over the pages the region covers.
    pub fn pages(&self) -> impl Iterator<Item = PageNumber> {
        self.base
            .page_number()
            .up_to(PageNumber::new(self.end() / PAGE_SIZE))
    }

    /// Grants write access until [`restore`](Self::restore) is called.
    pub fn make_writable(&mut self) {
        self.permissions = self.permissions | Permissions::WRITE;
    }

    /// Puts back the permissions the region was defined with.
    pub fn restore(&mut self) {
        self.permissions = self.original;
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Region({}..{:#010x} {:?})",
            self.base,
            self.end(),
            self.permissions
        )
    }
}
