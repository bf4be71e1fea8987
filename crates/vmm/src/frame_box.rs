//! Owned values stored in a single physical frame.

use core::fmt;
use core::marker::PhantomData;
use core::mem::{align_of, size_of};
use core::num::NonZeroU32;
use core::ops::{Deref, DerefMut};

use crate::arch::PAGE_SIZE;
use crate::{FrameAllocator, PhysicalAddress, VirtualAddress, VmError};

/// A `T` living in a frame obtained from the [`FrameAllocator`].
///
/// The box owns its frame: dropping it drops the value and returns the frame to the
/// allocator. Page tables are built from these, so their storage is accounted for by
/// the same allocator that backs user pages.
///
/// The frame address is held as a non-zero 32-bit value. Frame zero is always
/// reserved, and the niche keeps `Option<FrameBox<T>>` the size of a page table entry.
pub struct FrameBox<T> {
    frame: NonZeroU32,
    _marker: PhantomData<T>,
}

// SAFETY: A FrameBox uniquely owns its T, exactly like Box<T>.
unsafe impl<T: Send> Send for FrameBox<T> {}
unsafe impl<T: Sync> Sync for FrameBox<T> {}

impl<T> FrameBox<T> {
    const FITS_IN_FRAME: () = assert!(
        size_of::<T>() <= PAGE_SIZE && align_of::<T>() <= PAGE_SIZE,
        "type does not fit in a frame"
    );

    /// Moves `value` into a freshly allocated frame.
    pub fn new(value: T) -> Result<Self, VmError> {
        let frame = Self::allocate()?;
        // SAFETY: The frame is ours, large enough and suitably aligned for T.
        unsafe { Self::ptr_of(frame).write(value) };
        Ok(Self::from_frame(frame))
    }

    /// Returns the physical address of the frame holding the value.
    pub fn frame(&self) -> PhysicalAddress {
        PhysicalAddress::from(self.frame.get())
    }

    fn allocate() -> Result<PhysicalAddress, VmError> {
        let () = Self::FITS_IN_FRAME;
        FrameAllocator::current().allocate(1)
    }

    fn from_frame(frame: PhysicalAddress) -> Self {
        let Some(frame) = NonZeroU32::new(frame.as_usize() as u32) else {
            panic!("frame allocator handed out frame zero");
        };
        Self {
            frame,
            _marker: PhantomData,
        }
    }

    fn ptr_of(frame: PhysicalAddress) -> *mut T {
        VirtualAddress::direct_mapped(frame).as_mut_ptr()
    }

    fn as_ptr(&self) -> *mut T {
        Self::ptr_of(self.frame())
    }
}

impl<E, const N: usize> FrameBox<[E; N]> {
    /// Builds an array in a fresh frame, element by element.
    ///
    /// The array is written in place, so it never exists on the stack.
    pub fn from_fn(mut f: impl FnMut(usize) -> E) -> Result<Self, VmError> {
        let frame = Self::allocate()?;
        let base = Self::ptr_of(frame).cast::<E>();
        for index in 0..N {
            // SAFETY: The frame holds N elements of E; each is written exactly once.
            unsafe { base.add(index).write(f(index)) };
        }
        Ok(Self::from_frame(frame))
    }
}

impl<T> Deref for FrameBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: The value was initialised on construction and is owned by self.
        unsafe { &*self.as_ptr() }
    }
}

impl<T> DerefMut for FrameBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: As above; &mut self guarantees exclusive access.
        unsafe { &mut *self.as_ptr() }
    }
}

impl<T> Drop for FrameBox<T> {
    fn drop(&mut self) {
        // SAFETY: The value is initialised and never used again.
        unsafe { core::ptr::drop_in_place(self.as_ptr()) };
        FrameAllocator::current().free(self.frame());
    }
}

impl<T: fmt::Debug> fmt::Debug for FrameBox<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBox")
            .field("frame", &self.frame())
            .field("value", &**self)
            .finish()
    }
}
