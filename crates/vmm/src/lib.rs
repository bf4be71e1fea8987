#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Virtual Memory Manager (VMM)
//!
//! The virtual memory manager of a small teaching kernel running on a 32-bit,
//! software-refilled TLB. It provides:
//!
//! - A physical frame allocator, with single-frame and contiguous allocations.
//! - Two-level page tables whose storage comes from the frame allocator.
//! - Per-process address spaces built from permission-tagged regions.
//! - The TLB miss handler that ties them together.
//! - Software emulation of physical memory, the TLB and interrupt control for
//!   testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod error;
mod fault;
mod frame;
mod frame_allocator;
mod frame_box;
mod global;
mod numbers;
mod page_entry;
mod page_table;
mod region;
mod tlb;

#[cfg(test)]
mod testing;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, activate};
pub use error::VmError;
pub use fault::{FaultKind, handle_fault};
pub use frame::{Frame, FrameFlag, FrameFlags};
pub use frame_allocator::{FrameAllocator, alloc_kpages, free_kpages};
pub use frame_box::FrameBox;
pub use numbers::{FrameNumber, PageNumber};
pub use page_entry::{PageEntry, PageFlags};
pub use page_table::{LeafTable, PageTable};
pub use region::{Permissions, Region};
pub use tlb::{EntryHi, InterruptGuard, Interrupts, Mmu, Tlb, TlbEntry};

pub use arch::{
    DIRECTORY_ENTRIES, KERNEL_SEGMENT, MAX_RAM, PAGE_SIZE, STACK_GROWTH_PAGES, TABLE_ENTRIES,
    TLB_SLOTS, TLB_WIRED_SLOTS, USER_STACK_TOP,
};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, SoftInterrupts, SoftTlb};

#[cfg(all(target_arch = "x86_64", not(test), not(feature = "software-emulation")))]
pub use arch::HardwareInterrupts;
