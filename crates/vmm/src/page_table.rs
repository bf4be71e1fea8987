//! Two-level page tables.
//!
//! The directory is a frame of 1024 optional second-level tables, indexed by the
//! top ten bits of a virtual address. Each second-level table is a frame of 1024
//! [`PageEntry`] values, indexed by the next ten bits. Second-level tables are only
//! created when an address they cover is first faulted in.
//!
//! Ownership follows the structure: the page table owns its directory frame, the
//! directory owns its second-level tables, and a second-level table owns the frame
//! behind every valid entry it holds. Dropping the page table therefore returns
//! every frame it ever obtained, user pages first, then second-level tables, then
//! the directory.

use core::ptr;

use crate::arch::{DIRECTORY_ENTRIES, PAGE_SIZE, TABLE_ENTRIES};
use crate::frame_box::FrameBox;
use crate::{
    FrameAllocator, PageEntry, PageFlags, PageNumber, PhysicalAddress, VirtualAddress, VmError,
};

type Directory = [Option<LeafTable>; DIRECTORY_ENTRIES];

/// A per-address-space page table.
pub struct PageTable {
    directory: FrameBox<Directory>,
}

/// A second-level table.
pub struct LeafTable {
    entries: FrameBox<[PageEntry; TABLE_ENTRIES]>,
}

impl LeafTable {
    fn new() -> Result<Self, VmError> {
        Ok(Self {
            entries: FrameBox::from_fn(|_| PageEntry::EMPTY)?,
        })
    }

    /// Returns the frame holding this table.
    pub fn frame(&self) -> PhysicalAddress {
        self.entries.frame()
    }

    pub fn entry(&self, index: usize) -> PageEntry {
        self.entries[index]
    }
}

impl Drop for LeafTable {
    fn drop(&mut self) {
        let allocator = FrameAllocator::current();
        for entry in self.entries.iter_mut() {
            if let Some(frame) = entry.address() {
                allocator.free(frame);
                entry.clear();
            }
        }
    }
}

impl PageTable {
    /// Creates a page table with an empty directory.
    pub fn new() -> Result<Self, VmError> {
        Ok(Self {
            directory: FrameBox::from_fn(|_| None)?,
        })
    }

    /// Returns the frame holding the directory.
    pub fn directory_frame(&self) -> PhysicalAddress {
        self.directory.frame()
    }

    /// Makes sure the second-level table for directory slot `index` exists.
    ///
    /// Returns `true` if the table was created by this call.
    pub fn ensure_directory_slot(&mut self, index: usize) -> Result<bool, VmError> {
        let slot = &mut self.directory[index];
        if slot.is_some() {
            return Ok(false);
        }

        let table = LeafTable::new()?;
        log::trace!(
            "page table: directory slot {index} -> table at {}",
            table.frame()
        );
        *slot = Some(table);
        Ok(true)
    }

    /// Removes the second-level table in directory slot `index`, releasing it and
    /// every frame it maps.
    pub fn release_directory_slot(&mut self, index: usize) {
        if let Some(table) = self.directory[index].take() {
            log::trace!(
                "page table: releasing directory slot {index} (table at {})",
                table.frame()
            );
        }
    }

    /// Makes sure entry `index` of directory slot `directory` maps a frame.
    ///
    /// A new entry gets a freshly zeroed frame and is writable if `writable` is set.
    /// An entry that is already valid is returned unchanged.
    ///
    /// # Panics
    ///
    /// Panics if the directory slot has no second-level table.
    pub fn ensure_entry(
        &mut self,
        directory: usize,
        index: usize,
        writable: bool,
    ) -> Result<PageEntry, VmError> {
        let Some(table) = self.directory[directory].as_mut() else {
            panic!("directory slot {directory} has no second-level table");
        };

        let entry = &mut table.entries[index];
        if entry.is_valid() {
            return Ok(*entry);
        }

        let frame = FrameAllocator::current().allocate_zeroed(1)?;
        *entry = PageEntry::new(frame, PageFlags::mapped(writable));
        log::trace!(
            "page table: mapped {} -> {}",
            PageNumber::from_indices(directory, index).start(),
            frame
        );
        Ok(*entry)
    }

    /// Returns true if directory slot `index` has a second-level table.
    pub fn has_directory_slot(&self, index: usize) -> bool {
        self.directory[index].is_some()
    }

    /// Returns the entry covering `address`, or [`PageEntry::EMPTY`] if there is none.
    pub fn entry(&self, address: VirtualAddress) -> PageEntry {
        match &self.directory[address.directory_index()] {
            Some(table) => table.entry(address.table_index()),
            None => PageEntry::EMPTY,
        }
    }

    /// Clears the dirty bit of the entry covering `address`, if it is mapped.
    ///
    /// Returns true if the entry was writable before.
    pub fn write_protect(&mut self, address: VirtualAddress) -> bool {
        let Some(table) = self.directory[address.directory_index()].as_mut() else {
            return false;
        };
        let entry = &mut table.entries[address.table_index()];
        if !entry.is_dirty() {
            return false;
        }
        entry.write_protect();
        true
    }

    /// Translates `address` through the table.
    pub fn translate(&self, address: VirtualAddress) -> Option<PhysicalAddress> {
        self.entry(address)
            .address()
            .map(|frame| frame + address.page_offset())
    }

    /// Iterates over every valid mapping as (page address, entry) pairs.
    pub fn mappings(&self) -> impl Iterator<Item = (VirtualAddress, PageEntry)> + '_ {
        self.directory
            .iter()
            .enumerate()
            .filter_map(|(directory, slot)| slot.as_ref().map(|table| (directory, table)))
            .flat_map(|(directory, table)| {
                table
                    .entries
                    .iter()
                    .enumerate()
                    .filter(|(_, entry)| entry.is_valid())
                    .map(move |(index, entry)| {
                        (PageNumber::from_indices(directory, index).start(), *entry)
                    })
            })
    }

    /// Returns the number of pages backed by a frame.
    pub fn resident_pages(&self) -> usize {
        self.mappings().count()
    }

    /// Returns the number of second-level tables.
    pub fn table_count(&self) -> usize {
        self.directory.iter().filter(|slot| slot.is_some()).count()
    }

    /// Duplicates every mapping of `self` into `dest`, copying page contents into
    /// fresh frames. Entries keep their flags, dirty bit included.
    ///
    /// On failure `dest` holds whatever was copied so far; every frame it holds is
    /// owned by it and is released when it is dropped.
    ///
    /// # Panics
    ///
    /// Panics if `dest` already maps one of the pages being copied.
    pub fn copy_into(&self, dest: &mut PageTable) -> Result<(), VmError> {
        for (directory, slot) in self.directory.iter().enumerate() {
            let Some(table) = slot else {
                continue;
            };

            dest.ensure_directory_slot(directory)?;
            for (index, entry) in table.entries.iter().enumerate() {
                if let Some(frame) = entry.address() {
                    dest.map_copy(directory, index, frame, entry.flags())?;
                }
            }
        }
        Ok(())
    }

    fn map_copy(
        &mut self,
        directory: usize,
        index: usize,
        source: PhysicalAddress,
        flags: PageFlags,
    ) -> Result<(), VmError> {
        let Some(table) = self.directory[directory].as_mut() else {
            panic!("directory slot {directory} has no second-level table");
        };
        let entry = &mut table.entries[index];
        assert!(!entry.is_valid(), "copy target is already mapped");

        let frame = FrameAllocator::current().allocate(1)?;
        // SAFETY: Both frames are allocated, distinct, and a page long.
        unsafe {
            ptr::copy_nonoverlapping(
                VirtualAddress::direct_mapped(source).as_ptr::<u8>(),
                VirtualAddress::direct_mapped(frame).as_mut_ptr::<u8>(),
                PAGE_SIZE,
            );
        }
        *entry = PageEntry::new(frame, flags);
        Ok(())
    }

    /// Releases every frame the table holds: mapped pages, second-level tables and
    /// finally the directory.
    pub fn release_all(self) {
        log::trace!(
            "page table: releasing {} tables (directory at {})",
            self.table_count(),
            self.directory_frame()
        );
        drop(self);
    }
}
