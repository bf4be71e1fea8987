//! Helpers for booting an emulated machine in unit tests.

use std::fmt::Write;
use std::sync::Once;

use log::LevelFilter;

use crate::arch::{PAGE_SIZE, SoftInterrupts, SoftTlb};
use crate::tlb::Mmu;
use crate::{AddressSpace, AddressTranslator, FrameAllocator, PhysicalAddress, VirtualAddress};

/// Bytes of RAM the "kernel image" occupies below the frame table.
pub(crate) const KERNEL_RESERVED: usize = 4 * PAGE_SIZE;

/// Boots an emulated machine with `ram_size` bytes of RAM on the current thread.
pub(crate) fn boot(ram_size: usize) -> &'static FrameAllocator {
    TestConsole::install();
    AddressTranslator::set_current(AddressTranslator::emulated(ram_size));
    FrameAllocator::init(ram_size, PhysicalAddress::new(KERNEL_RESERVED))
}

/// Returns an MMU with an empty TLB and interrupts enabled.
pub(crate) fn mmu() -> Mmu<SoftTlb, SoftInterrupts> {
    Mmu::new(SoftTlb::new(), SoftInterrupts::new())
}

fn frame_ptr(frame: PhysicalAddress) -> *mut u8 {
    VirtualAddress::direct_mapped(frame).as_mut_ptr()
}

/// Fills a whole frame with `byte`.
pub(crate) fn fill_frame(frame: PhysicalAddress, byte: u8) {
    // SAFETY: Tests only pass frames inside emulated RAM.
    unsafe { core::ptr::write_bytes(frame_ptr(frame), byte, PAGE_SIZE) }
}

/// Returns a copy of a frame's contents.
pub(crate) fn frame_bytes(frame: PhysicalAddress) -> Vec<u8> {
    // SAFETY: As above.
    unsafe { core::slice::from_raw_parts(frame_ptr(frame), PAGE_SIZE) }.to_vec()
}

/// Writes `bytes` at a user address through the address space's page table.
///
/// # Panics
///
/// Panics if the page is not resident or the write crosses into the next page.
pub(crate) fn write_user(space: &AddressSpace, address: VirtualAddress, bytes: &[u8]) {
    let phys = user_frame(space, address, bytes.len());
    // SAFETY: The range lies within one resident frame.
    unsafe {
        core::ptr::copy_nonoverlapping(
            bytes.as_ptr(),
            VirtualAddress::direct_mapped(phys).as_mut_ptr(),
            bytes.len(),
        )
    }
}

/// Reads `len` bytes at a user address through the address space's page table.
pub(crate) fn read_user(space: &AddressSpace, address: VirtualAddress, len: usize) -> Vec<u8> {
    let phys = user_frame(space, address, len);
    // SAFETY: The range lies within one resident frame.
    unsafe { core::slice::from_raw_parts(VirtualAddress::direct_mapped(phys).as_ptr(), len) }
        .to_vec()
}

fn user_frame(space: &AddressSpace, address: VirtualAddress, len: usize) -> PhysicalAddress {
    assert!(
        address.page_offset() + len <= PAGE_SIZE,
        "user access crosses a page boundary"
    );
    match space.page_table().translate(address) {
        Some(phys) => phys,
        None => panic!("{address} is not resident"),
    }
}

/// Console logger for tests, printing each record on its own line.
///
/// Records go through `eprintln!` so the harness captures them per test.
struct TestConsole;

static CONSOLE: TestConsole = TestConsole;
static INSTALL: Once = Once::new();

impl TestConsole {
    fn install() {
        INSTALL.call_once(|| {
            if log::set_logger(&CONSOLE).is_ok() {
                log::set_max_level(LevelFilter::Trace);
            }
        });
    }
}

impl log::Log for TestConsole {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let mut line = String::new();
        if write_log_entry_to(&mut line, record).is_ok() {
            eprintln!("{line}");
        }
    }

    fn flush(&self) {}
}

fn write_log_entry_to(writer: &mut impl Write, record: &log::Record) -> std::fmt::Result {
    #[cfg(feature = "detailed-logging")]
    return write!(
        writer,
        "[{} {}:{} {}] {}",
        record.level(),
        record.file().unwrap_or("unknown"),
        record.line().unwrap_or(0),
        record.target(),
        record.args()
    );
    #[cfg(not(feature = "detailed-logging"))]
    return write!(writer, "[{:5}] {}", record.level(), record.args());
}
