//! Per-frame metadata kept in the frame table.

/// Holds metadata for a physical memory frame.
///
/// One record exists for every frame of managed RAM. The whole table sits behind
/// the allocator's lock, so the flags are plain bits rather than atomics.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
}

impl Frame {
    /// Returns true if the frame is handed out or reserved.
    pub const fn is_allocated(self) -> bool {
        self.flags.test(FrameFlag::Allocated)
    }

    /// Returns true if the next frame belongs to the same allocation.
    pub const fn continues(self) -> bool {
        self.flags.test(FrameFlag::Continues)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameFlag {
    /// Frame is allocated (or reserved for the kernel and the frame table).
    Allocated = 1 << 0,
    /// The following frame is part of the same multi-frame allocation.
    Continues = 1 << 1,
}

/// Flags for a physical memory frame.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(0)
    }

    /// Creates a new `FrameFlags` instance with the given initial flags.
    pub const fn from_bits(initial: u8) -> Self {
        Self(initial)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Sets the given flag.
    pub fn set(&mut self, flag: FrameFlag) {
        self.0 |= flag as u8;
    }

    /// Clears the given flag.
    pub fn clear(&mut self, flag: FrameFlag) {
        self.0 &= !(flag as u8);
    }

    /// Tests if the given flag is set.
    pub const fn test(self, flag: FrameFlag) -> bool {
        self.0 & flag as u8 != 0
    }

    /// Tests the given flag and sets it, returning the previous value.
    pub fn test_and_set(&mut self, flag: FrameFlag) -> bool {
        let old = self.test(flag);
        self.set(flag);
        old
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_independent() {
        let mut flags = FrameFlags::new();
        flags.set(FrameFlag::Continues);
        assert!(flags.test(FrameFlag::Continues));
        assert!(!flags.test(FrameFlag::Allocated));

        assert!(!flags.test_and_set(FrameFlag::Allocated));
        assert!(flags.test_and_set(FrameFlag::Allocated));

        flags.clear(FrameFlag::Continues);
        assert_eq!(flags.bits(), FrameFlag::Allocated as u8);
    }

    #[test]
    fn frame_record_is_one_byte() {
        assert_eq!(core::mem::size_of::<Frame>(), 1);
        let frame = Frame {
            flags: FrameFlags::from_bits(0b11),
        };
        assert!(frame.is_allocated());
        assert!(frame.continues());
        assert!(!Frame::default().is_allocated());
    }
}
