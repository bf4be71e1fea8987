//! Address space management.
//!
//! An address space is one process's view of memory: the regions the program
//! loader defined, the heap bounds, the top of the user stack, and the page table
//! holding the pages that have been faulted in so far.

use alloc::vec::Vec;

use crate::arch::{PAGE_SIZE, STACK_GROWTH_PAGES, USER_STACK_TOP};
use crate::tlb::{Interrupts, Mmu, Tlb};
use crate::{PageTable, Permissions, Region, VirtualAddress, VmError};

/// A user address space.
pub struct AddressSpace {
    /// Regions in the order they were defined.
    regions: Vec<Region>,
    heap_start: VirtualAddress,
    heap_end: VirtualAddress,
    stack_top: VirtualAddress,
    page_table: PageTable,
}

impl AddressSpace {
    /// Creates an empty address space with an empty page directory.
    pub fn create() -> Result<Self, VmError> {
        let page_table = PageTable::new()?;
        log::debug!(
            "address space: created (directory at {})",
            page_table.directory_frame()
        );
        Ok(Self {
            regions: Vec::new(),
            heap_start: VirtualAddress::new(0),
            heap_end: VirtualAddress::new(0),
            stack_top: VirtualAddress::new(USER_STACK_TOP),
            page_table,
        })
    }

    /// Defines a region covering `[vaddr, vaddr + size)`, widened to whole pages.
    ///
    /// The heap is placed directly after the region, whatever regions were
    /// defined before it. Overlap with earlier regions is not checked; lookups
    /// prefer the most recently defined region.
    ///
    /// # Errors
    ///
    /// Returns [`VmError::InvalidRegion`] if the region would reach the stack top.
    pub fn define_region(
        &mut self,
        vaddr: VirtualAddress,
        size: usize,
        permissions: Permissions,
    ) -> Result<(), VmError> {
        let base = vaddr.align_down(PAGE_SIZE);
        let end = size
            .checked_add(vaddr.page_offset())
            .and_then(|size| size.checked_next_multiple_of(PAGE_SIZE))
            .and_then(|size| base.as_usize().checked_add(size))
            .filter(|end| *end < self.stack_top.as_usize());
        let Some(end) = end else {
            log::debug!(
                "address space: rejected region {vaddr} + {size:#x}, stack top is {}",
                self.stack_top
            );
            return Err(VmError::InvalidRegion);
        };

        let region = Region::new(base, end - base.as_usize(), permissions);
        log::debug!("address space: defined {region:?}");
        self.regions.push(region);

        let heap = VirtualAddress::new(end);
        self.heap_start = heap;
        self.heap_end = heap;
        Ok(())
    }

    /// Makes every region writable so the loader can fill it.
    pub fn prepare_load(&mut self) {
        for region in &mut self.regions {
            region.make_writable();
        }
    }

    /// Restores every region's permissions after loading and flushes the TLB, so no
    /// writable translation made during loading survives.
    ///
    /// Pages faulted in while loading keep their frames, but lose write access in the
    /// page table when the region covering them is not writable.
    pub fn complete_load<T: Tlb, I: Interrupts>(&mut self, mmu: &mut Mmu<T, I>) {
        for region in &mut self.regions {
            region.restore();
        }

        let read_only: Vec<VirtualAddress> = self
            .page_table
            .mappings()
            .filter(|(page, entry)| {
                entry.is_dirty()
                    && self
                        .find_region(*page)
                        .is_some_and(|region| !region.permissions().is_writable())
            })
            .map(|(page, _)| page)
            .collect();
        for page in &read_only {
            self.page_table.write_protect(*page);
        }
        if !read_only.is_empty() {
            log::debug!("address space: write-protected {} loaded pages", read_only.len());
        }

        mmu.invalidate_all();
    }

    /// Returns the initial user stack pointer.
    pub fn define_stack(&self) -> VirtualAddress {
        self.stack_top
    }

    /// Creates a deep copy of this address space.
    ///
    /// Every resident page is copied into a frame of its own. If memory runs out
    /// part way, everything allocated for the copy is released again.
    pub fn copy(&self) -> Result<AddressSpace, VmError> {
        let mut copy = Self::create()?;
        copy.regions = self.regions.clone();
        copy.heap_start = self.heap_start;
        copy.heap_end = self.heap_end;
        copy.stack_top = self.stack_top;

        if let Err(err) = self.page_table.copy_into(&mut copy.page_table) {
            log::warn!(
                "address space: copy failed after {} of {} pages: {err}",
                copy.page_table.resident_pages(),
                self.page_table.resident_pages()
            );
            copy.destroy();
            return Err(err);
        }

        log::debug!(
            "address space: copied {} regions, {} pages",
            copy.regions.len(),
            copy.page_table.resident_pages()
        );
        Ok(copy)
    }

    /// Tears down the address space, returning every frame it holds.
    pub fn destroy(self) {
        let Self {
            regions,
            page_table,
            ..
        } = self;
        log::debug!(
            "address space: destroying {} regions, {} pages",
            regions.len(),
            page_table.resident_pages()
        );
        drop(regions);
        page_table.release_all();
    }

    /// Makes this the address space the TLB translates for.
    ///
    /// TLB entries carry no address-space tag, so this flushes the whole TLB.
    pub fn activate<T: Tlb, I: Interrupts>(&self, mmu: &mut Mmu<T, I>) {
        mmu.invalidate_all();
    }

    /// Stops this address space from being used for translation.
    pub fn deactivate<T: Tlb, I: Interrupts>(&self, mmu: &mut Mmu<T, I>) {
        mmu.invalidate_all();
    }

    /// Returns the regions in the order they were defined.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Returns the most recently defined region containing `address`.
    pub fn find_region(&self, address: VirtualAddress) -> Option<&Region> {
        self.regions.iter().rev().find(|region| region.contains(address))
    }

    /// Returns true if `address` lies in the window below the stack top that may be
    /// faulted in without a region.
    pub fn in_stack_window(&self, address: VirtualAddress) -> bool {
        let floor = self.stack_top.as_usize() - STACK_GROWTH_PAGES * PAGE_SIZE;
        address.as_usize() >= floor && address < self.stack_top
    }

    /// Returns the heap start and end.
    pub fn heap_bounds(&self) -> (VirtualAddress, VirtualAddress) {
        (self.heap_start, self.heap_end)
    }

    pub fn stack_top(&self) -> VirtualAddress {
        self.stack_top
    }

    pub fn page_table(&self) -> &PageTable {
        &self.page_table
    }

    pub fn page_table_mut(&mut self) -> &mut PageTable {
        &mut self.page_table
    }
}

/// Activates the current process's address space, if it has one.
///
/// Kernel-only threads have no address space; for them this does nothing.
pub fn activate<T: Tlb, I: Interrupts>(space: Option<&AddressSpace>, mmu: &mut Mmu<T, I>) {
    if let Some(space) = space {
        space.activate(mmu);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::TLB_SLOTS;
    use crate::{FaultKind, handle_fault, testing};

    const RAM: usize = 128 * PAGE_SIZE;

    fn rw() -> Permissions {
        Permissions::new(true, true, false)
    }

    #[test]
    fn create_uses_one_frame() {
        let allocator = testing::boot(RAM);
        let space = AddressSpace::create().unwrap();
        assert_eq!(allocator.allocated_frames(), 1);
        assert!(space.regions().is_empty());
        assert_eq!(space.stack_top(), VirtualAddress::new(USER_STACK_TOP));
        assert_eq!(space.define_stack(), VirtualAddress::new(0x8000_0000));
    }

    #[test]
    fn define_region_rounds_to_pages() {
        testing::boot(RAM);
        let mut space = AddressSpace::create().unwrap();
        space
            .define_region(VirtualAddress::new(0x0040_0f00), 0x200, rw())
            .unwrap();

        let region = space.regions()[0];
        assert_eq!(region.base(), VirtualAddress::new(0x0040_0000));
        assert_eq!(region.size(), 2 * PAGE_SIZE);
    }

    #[test]
    fn heap_follows_last_defined_region() {
        testing::boot(RAM);
        let mut space = AddressSpace::create().unwrap();
        space
            .define_region(VirtualAddress::new(0x1000_0000), PAGE_SIZE, rw())
            .unwrap();
        space
            .define_region(VirtualAddress::new(0x0040_0000), 3 * PAGE_SIZE, rw())
            .unwrap();

        let heap = VirtualAddress::new(0x0040_3000);
        assert_eq!(space.heap_bounds(), (heap, heap));
    }

    #[test]
    fn region_may_not_reach_stack_top() {
        testing::boot(RAM);
        let mut space = AddressSpace::create().unwrap();
        assert_eq!(
            space.define_region(VirtualAddress::new(0x7fff_f000), PAGE_SIZE, rw()),
            Err(VmError::InvalidRegion)
        );
        assert_eq!(
            space.define_region(VirtualAddress::new(0x7fff_e000), PAGE_SIZE, rw()),
            Ok(())
        );
        assert_eq!(
            space.define_region(VirtualAddress::new(0x1000), usize::MAX, rw()),
            Err(VmError::InvalidRegion)
        );
        assert_eq!(space.regions().len(), 1);
    }

    #[test]
    fn newest_region_wins_on_overlap() {
        testing::boot(RAM);
        let mut space = AddressSpace::create().unwrap();
        space
            .define_region(VirtualAddress::new(0x1000), 4 * PAGE_SIZE, Permissions::READ)
            .unwrap();
        space
            .define_region(VirtualAddress::new(0x2000), PAGE_SIZE, rw())
            .unwrap();

        let found = space.find_region(VirtualAddress::new(0x2010)).unwrap();
        assert!(found.permissions().is_writable());
        let found = space.find_region(VirtualAddress::new(0x3010)).unwrap();
        assert!(!found.permissions().is_writable());
        assert!(space.find_region(VirtualAddress::new(0x5000)).is_none());
    }

    #[test]
    fn stack_window_is_sixteen_pages() {
        testing::boot(RAM);
        let space = AddressSpace::create().unwrap();
        let floor = USER_STACK_TOP - STACK_GROWTH_PAGES * PAGE_SIZE;
        assert!(space.in_stack_window(VirtualAddress::new(USER_STACK_TOP - 1)));
        assert!(space.in_stack_window(VirtualAddress::new(floor)));
        assert!(!space.in_stack_window(VirtualAddress::new(floor - 1)));
        assert!(!space.in_stack_window(VirtualAddress::new(USER_STACK_TOP)));
    }

    #[test]
    fn load_widens_then_restores_and_flushes() {
        testing::boot(RAM);
        let mut mmu = testing::mmu();
        let mut space = AddressSpace::create().unwrap();
        let text = VirtualAddress::new(0x0040_0000);
        space
            .define_region(text, PAGE_SIZE, Permissions::READ | Permissions::EXECUTE)
            .unwrap();

        space.prepare_load();
        assert!(space.regions()[0].permissions().is_writable());
        handle_fault(Some(&mut space), FaultKind::Write as u32, text, &mut mmu).unwrap();
        assert!(mmu.tlb().entry(TLB_SLOTS - 1).lo.is_dirty());

        space.complete_load(&mut mmu);
        assert!(!space.regions()[0].permissions().is_writable());
        assert_eq!(mmu.tlb().valid_entries(), 0);

        // The loaded page keeps its contents but comes back read-only.
        let frame = space.page_table().translate(text);
        assert!(!space.page_table().entry(text).is_dirty());
        handle_fault(Some(&mut space), FaultKind::Read as u32, text, &mut mmu).unwrap();
        assert_eq!(space.page_table().translate(text), frame);
        let slot = mmu.tlb().probe(text).unwrap();
        assert!(!mmu.tlb().entry(slot).lo.is_dirty());
    }

    #[test]
    fn complete_load_leaves_writable_pages_alone() {
        testing::boot(RAM);
        let mut mmu = testing::mmu();
        let mut space = AddressSpace::create().unwrap();
        let data = VirtualAddress::new(0x1000_0000);
        space.define_region(data, PAGE_SIZE, rw()).unwrap();
        let stack = VirtualAddress::new(USER_STACK_TOP - 8);

        space.prepare_load();
        handle_fault(Some(&mut space), FaultKind::Write as u32, data, &mut mmu).unwrap();
        handle_fault(Some(&mut space), FaultKind::Write as u32, stack, &mut mmu).unwrap();
        space.complete_load(&mut mmu);

        assert!(space.page_table().entry(data).is_dirty());
        assert!(space.page_table().entry(stack).is_dirty());
    }

    #[test]
    fn activate_flushes_only_with_a_space() {
        testing::boot(RAM);
        let mut mmu = testing::mmu();
        let mut space = AddressSpace::create().unwrap();
        space.define_region(VirtualAddress::new(0x1000), PAGE_SIZE, rw()).unwrap();
        handle_fault(Some(&mut space), 0, VirtualAddress::new(0x1000), &mut mmu).unwrap();

        activate(None, &mut mmu);
        assert_eq!(mmu.tlb().valid_entries(), 1);
        assert_eq!(mmu.interrupts().disabled_windows(), 1);

        activate(Some(&space), &mut mmu);
        assert_eq!(mmu.tlb().valid_entries(), 0);

        handle_fault(Some(&mut space), 0, VirtualAddress::new(0x1000), &mut mmu).unwrap();
        space.deactivate(&mut mmu);
        assert_eq!(mmu.tlb().valid_entries(), 0);
    }

    #[test]
    fn copy_has_same_contents_in_disjoint_frames() {
        let allocator = testing::boot(RAM);
        let mut mmu = testing::mmu();
        let mut parent = AddressSpace::create().unwrap();
        parent
            .define_region(VirtualAddress::new(0x1000), 3 * PAGE_SIZE, rw())
            .unwrap();
        for (page, byte) in [(0x1000, 0x11), (0x2000, 0x22), (0x3000, 0x33)] {
            let address = VirtualAddress::new(page);
            handle_fault(Some(&mut parent), 1, address, &mut mmu).unwrap();
            testing::write_user(&parent, address, &[byte; 16]);
        }

        let child = parent.copy().unwrap();
        assert_eq!(child.regions(), parent.regions());
        assert_eq!(child.heap_bounds(), parent.heap_bounds());
        assert_eq!(child.page_table().resident_pages(), 3);

        let parent_frames: Vec<_> = parent.page_table().mappings().map(|(_, e)| e).collect();
        let child_frames: Vec<_> = child.page_table().mappings().map(|(_, e)| e).collect();
        for (p, c) in parent_frames.iter().zip(&child_frames) {
            assert_ne!(p.address(), c.address());
            assert!(!parent_frames.iter().any(|other| other.address() == c.address()));
            assert_eq!(
                testing::frame_bytes(p.address().unwrap()),
                testing::frame_bytes(c.address().unwrap())
            );
        }

        // Writes after the copy stay on their own side.
        testing::write_user(&child, VirtualAddress::new(0x2000), b"child");
        assert_eq!(testing::read_user(&parent, VirtualAddress::new(0x2000), 5), [0x22; 5]);
        assert_eq!(testing::read_user(&child, VirtualAddress::new(0x2000), 5), b"child");

        // Releasing a child page leaves the parent's frame alone.
        let mut child = child;
        let child_dir = VirtualAddress::new(0x2000).directory_index();
        child.page_table_mut().release_directory_slot(child_dir);
        for entry in &parent_frames {
            assert!(allocator.is_allocated(entry.address().unwrap()));
        }
        assert_eq!(testing::read_user(&parent, VirtualAddress::new(0x2000), 5), [0x22; 5]);
    }

    #[test]
    fn destroy_returns_every_frame() {
        let allocator = testing::boot(RAM);
        let mut mmu = testing::mmu();
        let baseline = allocator.free_frames();

        let mut space = AddressSpace::create().unwrap();
        space
            .define_region(VirtualAddress::new(0x0040_0000), 4 * PAGE_SIZE, rw())
            .unwrap();
        for page in 0..4 {
            let address = VirtualAddress::new(0x0040_0000 + page * PAGE_SIZE);
            handle_fault(Some(&mut space), 0, address, &mut mmu).unwrap();
        }
        handle_fault(Some(&mut space), 1, VirtualAddress::new(USER_STACK_TOP - 8), &mut mmu)
            .unwrap();
        let copy = space.copy().unwrap();
        assert_eq!(allocator.free_frames(), baseline - 2 * (1 + 2 + 5));

        space.destroy();
        assert_eq!(allocator.free_frames(), baseline - (1 + 2 + 5));
        copy.destroy();
        assert_eq!(allocator.free_frames(), baseline);
    }

    #[test]
    fn failed_copy_leaks_nothing() {
        let allocator = testing::boot(RAM);
        let mut mmu = testing::mmu();
        let mut space = AddressSpace::create().unwrap();
        space
            .define_region(VirtualAddress::new(0x1000), 4 * PAGE_SIZE, rw())
            .unwrap();
        for page in 1..=4 {
            handle_fault(Some(&mut space), 1, VirtualAddress::new(page * PAGE_SIZE), &mut mmu)
                .unwrap();
        }
        let free = allocator.free_frames();

        // Leave room for the directory, one table and one page of the copy.
        let hog = allocator.allocate(free - 3).unwrap();
        assert_eq!(space.copy().err(), Some(VmError::OutOfMemory));
        assert_eq!(allocator.free_frames(), 3);

        allocator.free(hog);
        assert_eq!(allocator.free_frames(), free);
    }
}
