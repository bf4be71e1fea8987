//! Emulated interrupt control.

use core::cell::Cell;

use crate::tlb::Interrupts;

/// Interrupt control for the emulated processor.
///
/// Interrupts start enabled. Each transition from enabled to disabled is counted,
/// which lets tests check that a TLB update happened inside exactly one
/// interrupts-off window.
pub struct SoftInterrupts {
    enabled: Cell<bool>,
    disabled_windows: Cell<usize>,
}

impl SoftInterrupts {
    pub const fn new() -> Self {
        Self {
            enabled: Cell::new(true),
            disabled_windows: Cell::new(0),
        }
    }

    pub fn are_enabled(&self) -> bool {
        self.enabled.get()
    }

    /// Returns how many times interrupts went from enabled to disabled.
    pub fn disabled_windows(&self) -> usize {
        self.disabled_windows.get()
    }
}

impl Default for SoftInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupts for SoftInterrupts {
    fn disable(&self) -> bool {
        let was_enabled = self.enabled.replace(false);
        if was_enabled {
            self.disabled_windows.set(self.disabled_windows.get() + 1);
        }
        was_enabled
    }

    fn restore(&self, enabled: bool) {
        self.enabled.set(enabled);
    }
}
