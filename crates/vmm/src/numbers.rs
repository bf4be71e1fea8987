//! Page and frame number types for memory management.
//!
//! A frame number indexes physical memory (and the frame table); a page number
//! indexes the virtual address space and splits into the two page table indices.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{
    address::{PhysicalAddress, VirtualAddress},
    arch,
};

/// Macro to define common page/frame number functionality.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Iterates over the numbers from `self` up to, but excluding, `end`.
            pub fn up_to(self, end: Self) -> impl Iterator<Item = Self> {
                (self.0..end.0).map(Self)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frame numbers are zero-indexed and double as the index of the frame's record\n\
     in the frame table."
);

impl FrameNumber {
    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 * arch::PAGE_SIZE)
    }

    /// Returns the number of frames needed to hold `bytes` bytes.
    #[inline]
    pub const fn count_for(bytes: usize) -> usize {
        bytes.div_ceil(arch::PAGE_SIZE)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        addr.frame_number()
    }
}

impl_page_number_common!(
    PageNumber,
    "A virtual memory page number.\n\n\
     The upper ten bits select a page directory slot and the lower ten bits an\n\
     entry in that slot's second-level table."
);

impl PageNumber {
    /// Returns the page at the given page table position.
    ///
    /// # Panics
    ///
    /// Panics if either index is out of range.
    #[inline]
    pub const fn from_indices(directory: usize, table: usize) -> Self {
        assert!(directory < arch::DIRECTORY_ENTRIES, "directory index out of range");
        assert!(table < arch::TABLE_ENTRIES, "table index out of range");
        Self(directory * arch::TABLE_ENTRIES + table)
    }

    /// Returns the virtual address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * arch::PAGE_SIZE)
    }

    #[inline]
    pub const fn directory_index(self) -> usize {
        self.0 / arch::TABLE_ENTRIES
    }

    #[inline]
    pub const fn table_index(self) -> usize {
        self.0 % arch::TABLE_ENTRIES
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        addr.page_number()
    }
}
