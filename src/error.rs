//! Error kinds reported by spaces, and the per-space policy deciding what
//! happens when the caller or the heap itself is found misbehaving.

use crate::params::Param;

/// Failure of a heap operation.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapError {
    /// The memory source could not provide more memory.
    #[error("the memory source is exhausted")]
    OutOfMemory,
    /// Growing would exceed the footprint limit of the space.
    #[error("the footprint limit would be exceeded")]
    FootprintLimit,
    /// The request overflows the size arithmetic.
    #[error("the requested size is too large")]
    RequestTooLarge,
    /// A pointer that is not an in-use chunk of this space was passed in.
    #[error("invalid pointer {addr:#x} passed to the space")]
    Usage { addr: usize },
    /// Internal bookkeeping was found inconsistent.
    #[error("heap corruption detected near {addr:#x}")]
    Corruption { addr: usize },
    /// A tunable was given a value it cannot take.
    #[error("{value} is not a valid value for {param:?}")]
    InvalidParam { param: Param, value: isize },
    /// An output slice cannot hold one pointer per requested block.
    #[error("{needed} pointer slots are needed but only {given} were given")]
    TooFewSlots { needed: usize, given: usize },
    /// The space handle does not refer to a live space.
    #[error("the space failed validation")]
    BadInstance,
}

impl HeapError {
    #[inline]
    pub(crate) fn usage(ptr: *const u8) -> Self {
        Self::Usage { addr: ptr as usize }
    }

    #[inline]
    pub(crate) fn corruption<T>(ptr: *const T) -> Self {
        Self::Corruption { addr: ptr as usize }
    }

    /// Whether the error leaves the space exactly as it was before the call.
    pub const fn is_allocation_failure(&self) -> bool {
        matches!(self, Self::OutOfMemory | Self::FootprintLimit | Self::RequestTooLarge)
    }
}

/// What to do when a caller hands the space a pointer it does not own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum UsageAction {
    /// Log the error and abort the process.
    #[default]
    Abort = 0,
    /// Log the error and return it, leaving the space untouched.
    Ignore = 1,
}

/// What to do when the space finds its own bookkeeping inconsistent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CorruptionAction {
    /// Log the error and abort the process.
    #[default]
    Abort,
    /// Forget every segment and free structure, then carry on with an empty heap.
    ///
    /// The forgotten segments are leaked, the one holding the space itself included,
    /// so destroying the space afterwards only releases memory obtained since.
    /// Memory still handed out is leaked and its headers are no longer trustworthy.
    /// Freeing such memory afterwards is undefined behavior. Only intended for
    /// crash-tolerant experimentation.
    Reset,
}

/// Per-space reactions to usage and corruption errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ErrorPolicy {
    pub usage: UsageAction,
    pub corruption: CorruptionAction,
}

impl ErrorPolicy {
    /// Abort on every error. This is the default.
    pub const STRICT: Self = Self { usage: UsageAction::Abort, corruption: CorruptionAction::Abort };

    /// Ignore usage errors and reset on corruption.
    pub const LENIENT: Self = Self { usage: UsageAction::Ignore, corruption: CorruptionAction::Reset };
}

/// Terminates the process without unwinding.
#[cold]
pub(crate) fn abort() -> ! {
    #[cfg(all(feature = "system-backed", unix))]
    unsafe {
        libc::abort()
    }

    #[cfg(not(all(feature = "system-backed", unix)))]
    panic!("segheap: unrecoverable heap error")
}
