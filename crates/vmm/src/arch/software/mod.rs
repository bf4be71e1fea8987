//! Software emulation implementation for testing and development.
//!
//! This module provides a software-emulated machine that can run on any host.
//! Physical memory is a zeroed, page-aligned host allocation; the TLB is a plain
//! array with an R3000-style Random register; interrupt control is a flag that
//! records how often it was switched off.

mod interrupts;
mod tlb;

pub use interrupts::SoftInterrupts;
pub use tlb::SoftTlb;

use core::ptr::NonNull;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};

use super::PAGE_SIZE;

/// Emulated memory for software simulation.
///
/// This provides a simulated physical memory space so that frames, page tables
/// and the frame table itself can live "in RAM" without any hardware support.
pub struct EmulatedMemory {
    /// The underlying memory buffer.
    base: NonNull<u8>,
    /// Size of the buffer in bytes.
    size: usize,
}

// SAFETY: The buffer is owned by this value and only ever reached through raw
// pointers handed out by `translate`; synchronisation is the caller's concern.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    /// Creates a new emulated memory region of the specified size.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or not a multiple of the page size.
    pub fn new(size: usize) -> Self {
        assert!(
            size > 0 && size % PAGE_SIZE == 0,
            "emulated memory must be a non-zero number of pages"
        );

        let layout = Self::layout(size);
        // SAFETY: The layout has a non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let Some(base) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };

        Self { base, size }
    }

    fn layout(size: usize) -> Layout {
        match Layout::from_size_align(size, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("emulated memory size overflows a layout"),
        }
    }

    /// Translates a physical address to a virtual address (pointer into the buffer).
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size, "physical address out of bounds");
        // SAFETY: `phys` is within the allocation.
        unsafe { self.base.as_ptr().add(phys) }
    }

    /// Translates a virtual address (pointer) back to a physical address.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> usize {
        let offset = (ptr as usize).wrapping_sub(self.base.as_ptr() as usize);
        assert!(offset < self.size, "pointer not within emulated memory");
        offset
    }

    /// Returns the size of the emulated memory region.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        // SAFETY: `base` was allocated in `new` with exactly this layout.
        unsafe { dealloc(self.base.as_ptr(), Self::layout(self.size)) }
    }
}
