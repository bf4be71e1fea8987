//! Errors reported by the virtual memory manager.

use core::fmt;

/// Errors that can occur during virtual memory operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No free frame (or run of frames) was available.
    OutOfMemory,
    /// The address is not covered by any region or the stack, or no address space is active.
    BadAddress,
    /// A store hit a page whose entry does not permit writes.
    PermissionViolation,
    /// The fault kind reported by the trap handler is not one the kernel understands.
    InvalidFault,
    /// A frame was freed while it was not allocated.
    DoubleFree,
    /// A region could not be defined at the requested location.
    InvalidRegion,
}

impl VmError {
    /// Returns the kernel errno value a system call should report for this error.
    pub const fn errno(self) -> i32 {
        match self {
            Self::OutOfMemory => 3, // ENOMEM
            Self::BadAddress => 6, // EFAULT
            Self::PermissionViolation => 6, // EFAULT
            Self::InvalidFault => 8, // EINVAL
            Self::DoubleFree => 8, // EINVAL
            Self::InvalidRegion => 3, // ENOMEM
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            Self::OutOfMemory => "out of memory",
            Self::BadAddress => "bad address",
            Self::PermissionViolation => "write to read-only page",
            Self::InvalidFault => "invalid fault type",
            Self::DoubleFree => "frame freed twice",
            Self::InvalidRegion => "region does not fit below the stack",
        };
        f.write_str(message)
    }
}

#[cfg(any(test, feature = "software-emulation"))]
impl std::error::Error for VmError {}
