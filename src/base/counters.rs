//! Track allocation statistics for a space.

/// Allocation statistics of a [`Heap`](crate::Heap).
///
/// Byte counts are in chunk sizes, which include the per-chunk overhead.
///
/// # Example
///
/// ```
/// # use segheap::{Manual, NoLock, Space};
/// let mut arena = vec![0u8; 1 << 16];
/// let space = unsafe {
///     Space::<NoLock, Manual>::create_with_base(arena.as_mut_ptr(), arena.len(), Manual)
/// }
/// .unwrap();
/// let counters = *space.lock().counters();
/// assert_eq!(counters.allocation_count, 0);
/// eprintln!("{}", counters);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Counters {
    /// Number of active allocations.
    pub allocation_count: usize,
    /// Total number of allocations.
    pub total_allocation_count: u64,

    /// Sum of active allocations' chunk sizes.
    pub allocated_bytes: usize,
    /// Sum of all allocations' maximum chunk sizes.
    ///
    /// In-place reallocations' unchanged bytes are not recounted.
    pub total_allocated_bytes: u64,

    /// Number of live chunks in dedicated mappings.
    pub mapped_chunk_count: usize,
    /// Total number of chunks placed in dedicated mappings.
    pub total_mapped_chunk_count: u64,
    /// Bytes in dedicated mappings.
    pub mapped_bytes: usize,

    /// Number of active segments.
    pub segment_count: usize,
    /// Total number of segments established.
    pub total_segment_count: u64,

    /// Sum of bytes held in segments.
    pub segment_bytes: usize,
    /// Sum of bytes ever added to segments. Released bytes included.
    pub total_segment_bytes: u64,
}

impl Counters {
    #[inline]
    pub(crate) const fn new() -> Self {
        Self {
            allocation_count: 0,
            total_allocation_count: 0,
            allocated_bytes: 0,
            total_allocated_bytes: 0,
            mapped_chunk_count: 0,
            total_mapped_chunk_count: 0,
            mapped_bytes: 0,
            segment_count: 0,
            total_segment_count: 0,
            segment_bytes: 0,
            total_segment_bytes: 0,
        }
    }

    /// Returns the total number of allocated bytes that have been freed.
    #[inline]
    pub const fn total_freed_bytes(&self) -> u64 {
        self.total_allocated_bytes - self.allocated_bytes as u64
    }

    /// Returns the total number of segment bytes that have been released.
    #[inline]
    pub const fn total_released_bytes(&self) -> u64 {
        self.total_segment_bytes - self.segment_bytes as u64
    }

    #[inline]
    pub(crate) fn account_alloc(&mut self, size: usize) {
        self.allocation_count += 1;
        self.allocated_bytes += size;

        self.total_allocation_count += 1;
        self.total_allocated_bytes += size as u64;
    }

    #[inline]
    pub(crate) fn account_dealloc(&mut self, size: usize) {
        self.allocation_count -= 1;
        self.allocated_bytes -= size;
    }

    #[inline]
    pub(crate) fn account_resize(&mut self, old_size: usize, new_size: usize) {
        if new_size >= old_size {
            self.allocated_bytes += new_size - old_size;
            self.total_allocated_bytes += (new_size - old_size) as u64;
        } else {
            self.allocated_bytes -= old_size - new_size;
            self.total_allocated_bytes -= (old_size - new_size) as u64;
        }
    }

    #[inline]
    pub(crate) fn account_map_chunk(&mut self, map_size: usize) {
        self.mapped_chunk_count += 1;
        self.total_mapped_chunk_count += 1;
        self.mapped_bytes += map_size;
    }

    #[inline]
    pub(crate) fn account_unmap_chunk(&mut self, map_size: usize) {
        self.mapped_chunk_count -= 1;
        self.mapped_bytes -= map_size;
    }

    #[inline]
    pub(crate) fn account_remap_chunk(&mut self, old_size: usize, new_size: usize) {
        self.mapped_bytes = self.mapped_bytes - old_size + new_size;
    }

    #[inline]
    pub(crate) fn account_segment(&mut self, size: usize) {
        self.segment_count += 1;
        self.total_segment_count += 1;
        self.segment_bytes += size;
        self.total_segment_bytes += size as u64;
    }

    #[inline]
    pub(crate) fn account_segment_growth(&mut self, size: usize) {
        self.segment_bytes += size;
        self.total_segment_bytes += size as u64;
    }

    #[inline]
    pub(crate) fn account_segment_release(&mut self, size: usize) {
        self.segment_count -= 1;
        self.segment_bytes -= size;
    }

    #[inline]
    pub(crate) fn account_trim(&mut self, size: usize) {
        self.segment_bytes -= size;
    }
}

impl core::fmt::Display for Counters {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            r#"Stat                 | Current Total       | Accumulative Total
---------------------|---------------------|--------------------
# of Allocations     | {:>19} | {:>19}
# of Allocated Bytes | {:>19} | {:>19}
# of Mapped Chunks   | {:>19} | {:>19}
# of Mapped Bytes    | {:>19} |                 N/A
# of Segments        | {:>19} | {:>19}
# of Segment Bytes   | {:>19} | {:>19}"#,
            self.allocation_count,
            self.total_allocation_count,
            self.allocated_bytes,
            self.total_allocated_bytes,
            self.mapped_chunk_count,
            self.total_mapped_chunk_count,
            self.mapped_bytes,
            self.segment_count,
            self.total_segment_count,
            self.segment_bytes,
            self.total_segment_bytes,
        )
    }
}
