//! Generic utilities for pointer handling and sizing.

/// Aligns `ptr` up to the next `align_mask + 1`.
///
/// `align_mask` must be a power of two minus one.
#[inline]
pub fn align_up_by(ptr: *mut u8, align_mask: usize) -> *mut u8 {
    debug_assert!((align_mask + 1).is_power_of_two());

    // keeps the provenance of `ptr`
    ptr.wrapping_add(((ptr as usize + align_mask) & !align_mask) - ptr as usize)
}

/// Aligns `ptr` down to `align_mask + 1`.
///
/// `align_mask` must be a power of two minus one.
#[inline]
pub fn align_down_by(ptr: *mut u8, align_mask: usize) -> *mut u8 {
    debug_assert!((align_mask + 1).is_power_of_two());

    ptr.wrapping_sub(ptr as usize & align_mask)
}

/// Rounds `size` up to a multiple of `unit`, wrapping on overflow.
///
/// `unit` must be a power of two.
#[inline]
pub const fn align_size_up(size: usize, unit: usize) -> usize {
    size.wrapping_add(unit - 1) & !(unit - 1)
}

#[inline]
pub fn is_aligned_to(ptr: *const u8, align: usize) -> bool {
    ptr as usize & (align - 1) == 0
}
