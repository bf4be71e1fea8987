//! Physical frame allocator.
//!
//! Every frame of managed RAM has a one-byte record in the frame table, which is
//! itself stored in RAM directly after everything the kernel claimed before the
//! allocator came up. Allocation is first-fit: a single frame is the first free
//! record, a run of frames is the first window of free records long enough. The
//! last frame of a run has its `Continues` bit clear, so freeing the first frame
//! of a run releases the whole run.
//!
//! The table sits behind one spin lock. Scans are linear in the number of frames.

use core::mem::size_of;

use spin::Mutex;

use crate::arch::{MAX_RAM, PAGE_SIZE};
use crate::frame::{Frame, FrameFlag};
use crate::global::{self, global_slot};
use crate::{FrameNumber, PhysicalAddress, VirtualAddress, VmError};

global_slot!(FRAME_ALLOCATOR: FrameAllocator);

/// The physical frame allocator.
pub struct FrameAllocator {
    table: Mutex<FrameTable>,
}

struct FrameTable {
    /// One record per frame of managed RAM.
    frames: &'static mut [Frame],
    /// Frames below this index hold the kernel and the frame table and are never handed out.
    first_usable: usize,
}

impl FrameAllocator {
    /// Builds the frame table for `ram_size` bytes of RAM.
    ///
    /// The table is placed at `first_free`, the first physical address not yet claimed
    /// by the kernel. Every frame below the end of the table is marked allocated and
    /// will never be handed out or accepted by [`free`](Self::free).
    ///
    /// # Panics
    ///
    /// Panics if either argument is not page-aligned, or if the table does not leave
    /// at least one frame free.
    pub fn bootstrap(ram_size: usize, first_free: PhysicalAddress) -> Self {
        assert!(ram_size % PAGE_SIZE == 0, "RAM size must be page-aligned");
        assert!(
            first_free.is_aligned(PAGE_SIZE),
            "first free address must be page-aligned"
        );

        let ram_size = if ram_size > MAX_RAM {
            log::info!(
                "frame allocator: ignoring {} KiB of RAM above {} MiB",
                (ram_size - MAX_RAM) / 1024,
                MAX_RAM / (1024 * 1024)
            );
            MAX_RAM
        } else {
            ram_size
        };

        let total = ram_size / PAGE_SIZE;
        let table_bytes = total * size_of::<Frame>();
        let first_usable = FrameNumber::count_for(first_free.as_usize() + table_bytes);
        if first_usable >= total {
            panic!("frame table took up all of physical memory");
        }

        let base = VirtualAddress::direct_mapped(first_free).as_mut_ptr::<Frame>();
        for index in 0..total {
            let mut frame = Frame::default();
            if index < first_usable {
                frame.flags.set(FrameFlag::Allocated);
            }
            // SAFETY: `[first_free, first_free + table_bytes)` lies inside RAM, is claimed
            // by nobody else, and is marked allocated so it is never handed out.
            unsafe { base.add(index).write(frame) };
        }
        // SAFETY: Every record was initialised above, and the memory stays reserved
        // for as long as the kernel runs.
        let frames = unsafe { core::slice::from_raw_parts_mut(base, total) };

        log::info!(
            "frame allocator: {} frames ({} KiB), table at {}, {} frames reserved",
            total,
            ram_size / 1024,
            first_free,
            first_usable
        );

        Self {
            table: Mutex::new(FrameTable {
                frames,
                first_usable,
            }),
        }
    }

    /// Bootstraps the allocator and installs it as the current one.
    ///
    /// # Panics
    ///
    /// Panics if an allocator has already been installed, or under the same
    /// conditions as [`bootstrap`](Self::bootstrap).
    pub fn init(ram_size: usize, first_free: PhysicalAddress) -> &'static Self {
        if Self::try_current().is_some() {
            panic!("frame allocator already set");
        }
        Self::set_current(Self::bootstrap(ram_size, first_free));
        Self::current()
    }

    /// Sets the global frame allocator.
    ///
    /// # Panics
    ///
    /// Panics if the allocator has already been set.
    pub fn set_current(allocator: FrameAllocator) {
        global::install(&FRAME_ALLOCATOR, allocator, "frame allocator");
    }

    /// Returns the global frame allocator.
    ///
    /// # Panics
    ///
    /// Panics if the allocator has not been bootstrapped yet.
    pub fn current() -> &'static FrameAllocator {
        match Self::try_current() {
            Some(allocator) => allocator,
            None => panic!("frame allocator not set; call FrameAllocator::init during boot"),
        }
    }

    /// Returns the global frame allocator if it has been set.
    pub fn try_current() -> Option<&'static FrameAllocator> {
        global::get(&FRAME_ALLOCATOR)
    }

    /// Allocates `count` physically contiguous frames and returns the address of the first.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::OutOfMemory`] if no run of `count` free frames exists.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn allocate(&self, count: usize) -> Result<PhysicalAddress, VmError> {
        assert!(count > 0, "cannot allocate zero frames");

        let mut table = self.table.lock();
        let start = if count == 1 {
            table.find_free()
        } else {
            table.find_run(count)
        };
        let Some(start) = start else {
            log::trace!("frame allocator: no run of {count} free frames");
            return Err(VmError::OutOfMemory);
        };

        table.claim(start, count);
        let address = FrameNumber::new(start).start();
        log::trace!("frame allocator: allocated {count} frame(s) at {address}");
        Ok(address)
    }

    /// Allocates `count` contiguous frames and fills them with zeroes.
    pub fn allocate_zeroed(&self, count: usize) -> Result<PhysicalAddress, VmError> {
        let address = self.allocate(count)?;
        let ptr = VirtualAddress::direct_mapped(address).as_mut_ptr::<u8>();
        // SAFETY: The frames were just handed out to us and nobody else can reach them.
        unsafe { core::ptr::write_bytes(ptr, 0, count * PAGE_SIZE) };
        Ok(address)
    }

    /// Frees the allocation starting at `address`, returning how many frames were released.
    ///
    /// Freeing the first frame of a multi-frame allocation releases the whole run.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::BadAddress`] if `address` is not page-aligned, is not a frame
    /// the allocator hands out, or lies inside a multi-frame allocation rather than at
    /// its start. Returns [`VmError::DoubleFree`] if the frame is not allocated.
    pub fn try_free(&self, address: PhysicalAddress) -> Result<usize, VmError> {
        if !address.is_aligned(PAGE_SIZE) {
            return Err(VmError::BadAddress);
        }

        let mut table = self.table.lock();
        let index = address.frame_number().as_usize();
        if index < table.first_usable || index >= table.frames.len() {
            return Err(VmError::BadAddress);
        }
        if !table.frames[index].is_allocated() {
            return Err(VmError::DoubleFree);
        }
        if table.frames[index - 1].continues() {
            return Err(VmError::BadAddress);
        }

        let released = table.release(index);
        log::trace!("frame allocator: freed {released} frame(s) at {address}");
        Ok(released)
    }

    /// Frees the allocation starting at `address`.
    ///
    /// # Panics
    ///
    /// Panics if the frame is not currently allocated, or if `address` was never
    /// handed out by this allocator.
    pub fn free(&self, address: PhysicalAddress) {
        if let Err(err) = self.try_free(address) {
            panic!("cannot free frame {address}: {err}");
        }
    }

    /// Returns the number of frames of managed RAM.
    pub fn total_frames(&self) -> usize {
        self.table.lock().frames.len()
    }

    /// Returns the number of frames reserved for the kernel and the frame table.
    pub fn reserved_frames(&self) -> usize {
        self.table.lock().first_usable
    }

    /// Returns the number of frames available for allocation.
    pub fn free_frames(&self) -> usize {
        let table = self.table.lock();
        table.frames.iter().filter(|f| !f.is_allocated()).count()
    }

    /// Returns the number of frames currently handed out (reserved frames excluded).
    pub fn allocated_frames(&self) -> usize {
        let table = self.table.lock();
        table.frames[table.first_usable..]
            .iter()
            .filter(|f| f.is_allocated())
            .count()
    }

    /// Returns true if the frame containing `address` is allocated or reserved.
    pub fn is_allocated(&self, address: PhysicalAddress) -> bool {
        let table = self.table.lock();
        table
            .frames
            .get(address.frame_number().as_usize())
            .is_some_and(|f| f.is_allocated())
    }
}

impl FrameTable {
    fn find_free(&self) -> Option<usize> {
        self.frames[self.first_usable..]
            .iter()
            .position(|f| !f.is_allocated())
            .map(|offset| self.first_usable + offset)
    }

    /// Finds the first window of `count` free frames.
    ///
    /// The window restarts just past any allocated frame it runs into.
    fn find_run(&self, count: usize) -> Option<usize> {
        let mut start = self.first_usable;
        let mut run = 0;
        while run < count && start + count <= self.frames.len() {
            if self.frames[start + run].is_allocated() {
                start += run + 1;
                run = 0;
            } else {
                run += 1;
            }
        }
        (run == count).then_some(start)
    }

    fn claim(&mut self, start: usize, count: usize) {
        for (offset, frame) in self.frames[start..start + count].iter_mut().enumerate() {
            debug_assert!(!frame.is_allocated(), "claiming an allocated frame");
            frame.flags.set(FrameFlag::Allocated);
            if offset + 1 < count {
                frame.flags.set(FrameFlag::Continues);
            } else {
                frame.flags.clear(FrameFlag::Continues);
            }
        }
    }

    fn release(&mut self, start: usize) -> usize {
        let mut released = 0;
        for frame in &mut self.frames[start..] {
            let continues = frame.continues();
            frame.flags.clear(FrameFlag::Allocated);
            frame.flags.clear(FrameFlag::Continues);
            released += 1;
            if !continues {
                break;
            }
        }
        released
    }
}

/// Allocates `count` contiguous frames for kernel use and returns their
/// direct-mapped address, or `None` if memory is exhausted.
pub fn alloc_kpages(count: usize) -> Option<VirtualAddress> {
    match FrameAllocator::current().allocate(count) {
        Ok(frame) => Some(VirtualAddress::direct_mapped(frame)),
        Err(err) => {
            log::warn!("alloc_kpages({count}): {err}");
            None
        }
    }
}

/// Frees pages obtained from [`alloc_kpages`].
pub fn free_kpages(address: VirtualAddress) {
    FrameAllocator::current().free(PhysicalAddress::from_direct_mapped(address));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    const RAM: usize = 64 * PAGE_SIZE;

    #[test]
    fn bootstrap_reserves_kernel_and_table() {
        let allocator = testing::boot(RAM);
        let reserved = FrameNumber::count_for(testing::KERNEL_RESERVED + 64);

        assert_eq!(allocator.total_frames(), 64);
        assert_eq!(allocator.reserved_frames(), reserved);
        assert_eq!(allocator.free_frames(), 64 - reserved);
        assert_eq!(allocator.allocated_frames(), 0);
        assert!(allocator.is_allocated(PhysicalAddress::new(0)));
        assert!(allocator.is_allocated(PhysicalAddress::new(testing::KERNEL_RESERVED)));
    }

    #[test]
    fn single_frames_are_first_fit() {
        let allocator = testing::boot(RAM);
        let first = allocator.allocate(1).unwrap();
        let second = allocator.allocate(1).unwrap();
        assert_eq!(
            first.frame_number().as_usize(),
            allocator.reserved_frames()
        );
        assert_eq!(second, first + PAGE_SIZE);

        allocator.free(first);
        assert_eq!(allocator.allocate(1).unwrap(), first);
    }

    #[test]
    fn never_issues_a_live_frame_twice() {
        let allocator = testing::boot(RAM);
        let mut live = Vec::new();

        for round in 0..200usize {
            if round % 3 == 2 && !live.is_empty() {
                let victim = live.swap_remove(round % live.len());
                allocator.free(victim);
            } else if let Ok(frame) = allocator.allocate(1) {
                assert!(!live.contains(&frame), "frame {frame} issued twice");
                live.push(frame);
            }
        }

        assert_eq!(allocator.allocated_frames(), live.len());
    }

    #[test]
    fn multi_frame_block_is_not_reissued() {
        let allocator = testing::boot(RAM);
        let block = allocator.allocate(4).unwrap();
        let block_frames: Vec<_> = (0..4).map(|i| block + i * PAGE_SIZE).collect();

        while let Ok(frame) = allocator.allocate(1) {
            assert!(!block_frames.contains(&frame));
        }

        assert_eq!(allocator.try_free(block), Ok(4));
        for frame in block_frames {
            assert!(!allocator.is_allocated(frame));
        }
    }

    #[test]
    fn run_skips_past_allocated_frames() {
        let allocator = testing::boot(RAM);
        let a = allocator.allocate(1).unwrap();
        let b = allocator.allocate(1).unwrap();
        let c = allocator.allocate(1).unwrap();
        allocator.free(a);
        allocator.free(c);

        // [a free][b taken][c free][...free]: a 3-frame run must start at c.
        let run = allocator.allocate(3).unwrap();
        assert_eq!(run, c);
        assert!(allocator.is_allocated(b));
    }

    #[test]
    fn run_may_end_at_last_frame() {
        let allocator = testing::boot(RAM);
        let free = allocator.free_frames();
        let all = allocator.allocate(free).unwrap();
        assert_eq!(allocator.free_frames(), 0);
        assert_eq!(allocator.try_free(all), Ok(free));
    }

    #[test]
    fn run_too_long_is_out_of_memory() {
        let allocator = testing::boot(RAM);
        let free = allocator.free_frames();
        assert_eq!(allocator.allocate(free + 1), Err(VmError::OutOfMemory));
        assert_eq!(allocator.free_frames(), free);
    }

    #[test]
    fn exhaust_free_one_then_reuse_it() {
        let allocator = testing::boot(RAM);
        let mut frames = Vec::new();
        while let Ok(frame) = allocator.allocate(1) {
            frames.push(frame);
        }
        assert_eq!(allocator.allocate(1), Err(VmError::OutOfMemory));

        let freed = frames[frames.len() / 2];
        allocator.free(freed);
        assert_eq!(allocator.allocate(1), Ok(freed));
    }

    #[test]
    fn double_free_is_reported() {
        let allocator = testing::boot(RAM);
        let frame = allocator.allocate(1).unwrap();
        allocator.free(frame);
        assert_eq!(allocator.try_free(frame), Err(VmError::DoubleFree));
    }

    #[test]
    #[should_panic(expected = "frame freed twice")]
    fn double_free_panics() {
        let allocator = testing::boot(RAM);
        let frame = allocator.allocate(1).unwrap();
        allocator.free(frame);
        allocator.free(frame);
    }

    #[test]
    fn rejects_frames_it_does_not_manage() {
        let allocator = testing::boot(RAM);
        assert_eq!(
            allocator.try_free(PhysicalAddress::new(0)),
            Err(VmError::BadAddress)
        );
        assert_eq!(
            allocator.try_free(PhysicalAddress::new(RAM)),
            Err(VmError::BadAddress)
        );
        let frame = allocator.allocate(1).unwrap();
        assert_eq!(allocator.try_free(frame + 8), Err(VmError::BadAddress));
    }

    #[test]
    fn mid_block_free_is_rejected() {
        let allocator = testing::boot(RAM);
        let block = allocator.allocate(4).unwrap();
        assert_eq!(allocator.try_free(block + PAGE_SIZE), Err(VmError::BadAddress));

        // The block stays whole, so a single-frame allocation lands after it.
        let single = allocator.allocate(1).unwrap();
        assert_eq!(single, block + 4 * PAGE_SIZE);
        assert_eq!(allocator.try_free(block), Ok(4));
        assert!(allocator.is_allocated(single));
    }

    #[test]
    #[should_panic(expected = "cannot free frame")]
    fn mid_block_free_panics() {
        let allocator = testing::boot(RAM);
        let block = allocator.allocate(4).unwrap();
        allocator.free(block + 2 * PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "cannot allocate zero frames")]
    fn zero_frames_panics() {
        testing::boot(RAM).allocate(0).ok();
    }

    #[test]
    fn allocate_zeroed_clears_old_contents() {
        let allocator = testing::boot(RAM);
        let frame = allocator.allocate(1).unwrap();
        testing::fill_frame(frame, 0xAB);
        allocator.free(frame);

        let again = allocator.allocate_zeroed(1).unwrap();
        assert_eq!(again, frame);
        assert!(testing::frame_bytes(again).iter().all(|b| *b == 0));
    }

    #[test]
    fn kpages_are_direct_mapped() {
        let allocator = testing::boot(RAM);
        let pages = alloc_kpages(2).unwrap();
        let frame = PhysicalAddress::from_direct_mapped(pages);
        assert!(allocator.is_allocated(frame));
        assert!(allocator.is_allocated(frame + PAGE_SIZE));

        free_kpages(pages);
        assert_eq!(allocator.allocated_frames(), 0);
    }

    #[test]
    fn kpages_report_exhaustion_as_none() {
        let allocator = testing::boot(RAM);
        assert_eq!(alloc_kpages(allocator.free_frames() + 1), None);
    }

    #[test]
    #[should_panic(expected = "frame table took up all of physical memory")]
    fn table_must_leave_room() {
        crate::AddressTranslator::set_current(crate::AddressTranslator::emulated(RAM));
        FrameAllocator::bootstrap(RAM, PhysicalAddress::new(RAM - PAGE_SIZE));
    }

    #[test]
    #[should_panic(expected = "first free address must be page-aligned")]
    fn bootstrap_rejects_unaligned_first_free() {
        crate::AddressTranslator::set_current(crate::AddressTranslator::emulated(RAM));
        FrameAllocator::bootstrap(RAM, PhysicalAddress::new(0x1001));
    }

    #[test]
    #[should_panic(expected = "frame allocator already set")]
    fn bootstraps_only_once() {
        testing::boot(RAM);
        FrameAllocator::init(RAM, PhysicalAddress::new(testing::KERNEL_RESERVED));
    }
}
