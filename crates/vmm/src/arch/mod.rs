//! Machine parameters and platform backends.
//!
//! The memory-management unit this crate drives is a 32-bit, software-refilled
//! TLB in the style of the MIPS R3000: the kernel walks its own page tables on a
//! translation miss and writes the result into the TLB itself. The constants here
//! describe that machine; the submodules provide the pieces of the platform that
//! differ between a real kernel and the software emulation used for tests.

// NOTE: We DO include the x86_64 module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "x86_64")]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use self::x86_64::*;

// Software emulation is used when running tests, or when explicitly requested.
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Number of bits in the page offset.
pub const PAGE_SHIFT: usize = 12;

/// Page (and frame) size in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask selecting the page-aligned part of a 32-bit address.
pub const PAGE_FRAME: usize = 0xFFFF_F000;

/// Shift of the directory index within a virtual address.
pub const DIRECTORY_SHIFT: usize = 22;

/// Number of slots in the top-level page directory.
pub const DIRECTORY_ENTRIES: usize = 1024;

/// Number of entries in each second-level page table.
pub const TABLE_ENTRIES: usize = 1024;

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 32;

/// Maximum number of bits in a virtual address.
pub const MAX_VIRTUAL_BITS: usize = 32;

/// Largest amount of RAM the frame allocator will manage.
///
/// Physical memory is reached through the direct-mapped kernel segment, which is
/// only 512 MiB wide. Anything above it is ignored at bootstrap.
pub const MAX_RAM: usize = 512 * 1024 * 1024;

/// Start of the kernel segment. User addresses are strictly below it.
pub const KERNEL_SEGMENT: usize = 0x8000_0000;

/// Initial user stack pointer. The stack grows down from here.
pub const USER_STACK_TOP: usize = KERNEL_SEGMENT;

/// Pages below [`USER_STACK_TOP`] that may be faulted in without a defined region.
pub const STACK_GROWTH_PAGES: usize = 16;

/// Number of slots in the hardware TLB.
pub const TLB_SLOTS: usize = 64;

/// Low TLB slots reserved for wired entries; random writes never choose them.
pub const TLB_WIRED_SLOTS: usize = 8;

/// Returns the page directory index for a virtual address (bits 22-31).
#[inline]
pub const fn directory_index(address: usize) -> usize {
    (address >> DIRECTORY_SHIFT) & (DIRECTORY_ENTRIES - 1)
}

/// Returns the second-level table index for a virtual address (bits 12-21).
#[inline]
pub const fn table_index(address: usize) -> usize {
    (address >> PAGE_SHIFT) & (TABLE_ENTRIES - 1)
}

/// Validates a physical address: it must fit in 32 bits.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr as u64 <= u32::MAX as u64
}

/// Validates a virtual address: it must fit in 32 bits.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    addr as u64 <= u32::MAX as u64
}
