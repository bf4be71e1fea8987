//! x86_64 host backend.
//!
//! When the kernel is built for an x86_64 host the TLB itself is supplied by the
//! kernel's machine layer, but interrupt control is the processor's own.

use ::x86_64::instructions::interrupts;

use crate::tlb::Interrupts;

/// Interrupt control through the processor's interrupt flag.
#[derive(Debug, Default, Clone, Copy)]
pub struct HardwareInterrupts;

impl Interrupts for HardwareInterrupts {
    fn disable(&self) -> bool {
        let enabled = interrupts::are_enabled();
        if enabled {
            interrupts::disable();
        }
        enabled
    }

    fn restore(&self, enabled: bool) {
        if enabled {
            interrupts::enable();
        }
    }
}
