//! Strategies for obtaining memory from the system.
//!
//! A space holds its [`Source`] and calls it whenever its segments cannot
//! satisfy a request, and when whole segments or large chunks are released.

use core::ptr::NonNull;

#[cfg(all(feature = "system-backed", unix))]
mod unix;

#[cfg(all(feature = "system-backed", unix))]
pub use unix::{Mmap, Sbrk};

/// Source and release regions of memory for a space.
///
/// # Safety
///
/// Implementations must not allocate through the space that owns them,
/// directly or indirectly. The owning space is locked while its source is
/// called, so doing so deadlocks or corrupts the heap. Keep this in mind when
/// logging from a source if the space is also the global allocator.
///
/// Regions returned by [`Source::map`] must be readable, writable, page aligned,
/// at least `size` bytes long, and must not overlap any other live region.
pub unsafe trait Source: core::fmt::Debug + Sized {
    /// Freshly mapped memory is zero-filled, so zeroed allocations served
    /// from a dedicated mapping need no clearing.
    const MAP_CLEARS: bool = false;

    /// [`Source::morecore`] is supported.
    const HAS_MORECORE: bool = false;

    /// Maps a region of `size` bytes, a multiple of the page size.
    fn map(&mut self, size: usize) -> Option<NonNull<u8>>;

    /// Unmaps `size` bytes at `base`, which lie within a region returned by
    /// [`Source::map`]. Returns whether the memory was released.
    ///
    /// # Safety
    /// The memory must not be used afterwards.
    unsafe fn unmap(&mut self, base: NonNull<u8>, size: usize) -> bool;

    /// Resizes the mapping at `base` from `old_size` to `new_size` bytes,
    /// moving it only if `may_move`. Unsupported by default.
    ///
    /// # Safety
    /// `base` and `old_size` must describe a live mapping.
    unsafe fn remap(
        &mut self,
        base: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        may_move: bool,
    ) -> Option<NonNull<u8>> {
        let _ = (base, old_size, new_size, may_move);
        None
    }

    /// Moves the break by `increment` bytes and returns the previous break,
    /// like `sbrk(2)`. An increment of zero queries the current break.
    ///
    /// Only called if [`Source::HAS_MORECORE`] is set, and always through
    /// [`Source::with_global_lock`].
    ///
    /// # Safety
    /// Shrinking must only give back memory the caller no longer uses.
    unsafe fn morecore(&mut self, increment: isize) -> Option<NonNull<u8>> {
        let _ = increment;
        None
    }

    /// Runs `f` while holding whatever lock serializes the system resources
    /// this source shares with other spaces.
    fn with_global_lock<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        f(self)
    }
}

/// Does not provide or reclaim memory.
///
/// Spaces over caller-supplied memory that must never grow use this source,
/// see [`Space::create_with_base`](crate::Space::create_with_base).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Manual;

// SAFETY: never touches any allocator.
unsafe impl Source for Manual {
    #[inline]
    fn map(&mut self, _size: usize) -> Option<NonNull<u8>> {
        None
    }

    #[inline]
    unsafe fn unmap(&mut self, _base: NonNull<u8>, _size: usize) -> bool {
        false
    }
}
