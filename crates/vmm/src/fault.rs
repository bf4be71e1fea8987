//! TLB miss handling.
//!
//! A fault is serviced in four stages. Classification rejects faults that can
//! never be serviced. Region lookup decides whether the address is part of the
//! address space and whether it is writable. Mapping makes sure the page table
//! has an entry for the page, allocating a second-level table and a zeroed frame
//! if needed. Installation writes the entry into the TLB.
//!
//! A fault that fails leaves the page table exactly as it found it.

use core::fmt;

use crate::tlb::{Interrupts, Mmu, Tlb, TlbEntry};
use crate::{AddressSpace, PageEntry, PageTable, VirtualAddress, VmError};

/// The kind of access that missed in the TLB, as reported by the trap handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum FaultKind {
    /// A load missed.
    Read = 0,
    /// A store missed.
    Write = 1,
    /// A store hit a TLB entry without the dirty bit.
    ReadOnly = 2,
}

impl TryFrom<u32> for FaultKind {
    type Error = VmError;

    fn try_from(raw: u32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::ReadOnly),
            _ => Err(VmError::InvalidFault),
        }
    }
}

/// The stage a fault is in; used to label log output.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Stage {
    Classify,
    LocateRegion,
    EnsureMapping,
    Install,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Classify => "classify",
            Self::LocateRegion => "locate region",
            Self::EnsureMapping => "ensure mapping",
            Self::Install => "install",
        };
        f.write_str(name)
    }
}

/// Services a TLB miss at `address` in `space`.
///
/// `kind` is the raw fault code from the trap frame. `space` is the current
/// process's address space, or `None` if the faulting thread has none.
///
/// # Errors
///
/// - [`VmError::InvalidFault`] if `kind` is not a known fault code.
/// - [`VmError::PermissionViolation`] for a store to a read-only page.
/// - [`VmError::BadAddress`] for a null address, a thread without an address space,
///   or an address outside every region and the stack window.
/// - [`VmError::OutOfMemory`] if a page table or page frame could not be allocated.
pub fn handle_fault<T: Tlb, I: Interrupts>(
    space: Option<&mut AddressSpace>,
    kind: u32,
    address: VirtualAddress,
    mmu: &mut Mmu<T, I>,
) -> Result<(), VmError> {
    let result = service(space, kind, address, mmu);
    if let Err((stage, err)) = result {
        log::warn!("fault: {kind} at {address} rejected in {stage}: {err}");
        return Err(err);
    }
    Ok(())
}

fn service<T: Tlb, I: Interrupts>(
    space: Option<&mut AddressSpace>,
    kind: u32,
    address: VirtualAddress,
    mmu: &mut Mmu<T, I>,
) -> Result<(), (Stage, VmError)> {
    log::trace!("fault: {kind} at {address}: {}", Stage::Classify);
    let kind = classify(kind).map_err(|err| (Stage::Classify, err))?;

    log::trace!("fault: {kind:?} at {address}: {}", Stage::LocateRegion);
    let Some(space) = space else {
        return Err((Stage::LocateRegion, VmError::BadAddress));
    };
    let writable = locate(space, address).map_err(|err| (Stage::LocateRegion, err))?;

    log::trace!("fault: {kind:?} at {address}: {}", Stage::EnsureMapping);
    let entry = ensure_mapping(space.page_table_mut(), address, writable)
        .map_err(|err| (Stage::EnsureMapping, err))?;

    log::trace!("fault: {kind:?} at {address}: {}", Stage::Install);
    mmu.install(TlbEntry::new(address, entry));
    Ok(())
}

fn classify(raw: u32) -> Result<FaultKind, VmError> {
    match FaultKind::try_from(raw)? {
        // No copy-on-write: a store to a clean page is always an error.
        FaultKind::ReadOnly => Err(VmError::PermissionViolation),
        kind => Ok(kind),
    }
}

/// Returns whether the page containing `address` should be mapped writable.
fn locate(space: &AddressSpace, address: VirtualAddress) -> Result<bool, VmError> {
    if address.as_usize() == 0 {
        return Err(VmError::BadAddress);
    }
    if let Some(region) = space.find_region(address) {
        return Ok(region.permissions().is_writable());
    }
    if space.in_stack_window(address) {
        return Ok(true);
    }
    Err(VmError::BadAddress)
}

fn ensure_mapping(
    table: &mut PageTable,
    address: VirtualAddress,
    writable: bool,
) -> Result<PageEntry, VmError> {
    let directory = address.directory_index();
    let created = table.ensure_directory_slot(directory)?;

    match table.ensure_entry(directory, address.table_index(), writable) {
        Ok(entry) => Ok(entry),
        Err(err) => {
            if created {
                table.release_directory_slot(directory);
            }
            Err(err)
        }
    }
}
