//! This module provides the core allocation mechanism via the [`Heap`] type.
//!
//! A [`Heap`] manages the segments of one space. It does no locking of its own;
//! it lives inside its first segment and is reached through a
//! [`Space`](crate::Space), which wraps it in a mutex.
//!
//! Free chunks smaller than [`MIN_LARGE_SIZE`](chunk::MIN_LARGE_SIZE) sit in
//! exact-size circular lists. Larger ones sit in bitwise tries, one per size
//! class. Two chunks are kept out of the bins: the designated victim, the
//! remainder of the last split used for small requests, and the top chunk,
//! which borders the end of the newest segment.

use core::{
    fmt::Debug,
    ptr::{addr_of, null_mut, NonNull},
};

use crate::{
    error::{abort, CorruptionAction, ErrorPolicy, HeapError, UsageAction},
    params::{Param, Tuning},
    source::Source,
};

pub(crate) mod bitfield;
pub(crate) mod chunk;
mod inspect;
mod segment;
mod smallbin;
mod treebin;

#[cfg(feature = "counters")]
mod counters;
#[cfg(feature = "counters")]
pub use counters::Counters;

pub use chunk::MALLOC_ALIGNMENT;
pub use inspect::{MemInfo, Stats};

use bitfield::BinMap;
use chunk::*;

/// Dedicated mappings may be used for large requests.
const USE_MMAP: u32 = 1 << 0;
/// Contiguous growth through [`Source::morecore`] is not attempted.
const NONCONTIGUOUS: u32 = 1 << 2;

/// Frees of large chunks between scans for segments that became entirely free.
const MAX_RELEASE_CHECK_RATE: usize = 4095;

/// Where a freed chunk ended up after merging with its neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Coalesced {
    Unmapped,
    Top,
    Victim,
    Binned(usize),
}

#[derive(Clone, Copy)]
enum Sizes<'a> {
    Same(usize),
    Each(&'a [usize]),
}

/// The allocator state of one space.
///
/// Obtained by locking a [`Space`](crate::Space).
pub struct Heap<S: Source> {
    smallmap: BinMap,
    treemap: BinMap,
    smallbins: [*mut Chunk; NSMALLBINS],
    treebins: [*mut TreeChunk; NTREEBINS],

    dvsize: usize,
    topsize: usize,
    dv: *mut Chunk,
    top: *mut Chunk,

    least_addr: *mut u8,
    trim_check: usize,
    release_checks: usize,

    footprint: usize,
    max_footprint: usize,
    footprint_limit: usize,

    mflags: u32,
    seg: Segment,

    tuning: Tuning,
    page_size: usize,
    /// Written into the footer of every in-use chunk to identify its owner.
    tag: usize,

    policy: ErrorPolicy,
    reset_count: usize,

    /// Allocation statistics for this space.
    #[cfg(feature = "counters")]
    counters: Counters,

    source: S,
}

unsafe impl<S: Source + Send> Send for Heap<S> {}

impl<S: Source> Debug for Heap<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut debug_struct = f.debug_struct("Heap");

        debug_struct
            .field("smallmap", &self.smallmap)
            .field("treemap", &self.treemap)
            .field("dv", &self.dv)
            .field("dvsize", &self.dvsize)
            .field("top", &self.top)
            .field("topsize", &self.topsize)
            .field("footprint", &self.footprint)
            .field("max_footprint", &self.max_footprint)
            .field("tuning", &self.tuning)
            .field("policy", &self.policy)
            .field("source", &self.source);

        #[cfg(feature = "counters")]
        {
            debug_struct.field("counters", &self.counters);
        }

        debug_struct.finish()
    }
}

impl<S: Source> Heap<S> {
    /// Sets up a heap over its first segment, `size` bytes at `base`.
    ///
    /// `state_chunk` is the in-use chunk at the start of the segment
    /// that will hold the heap. Everything after it becomes the top chunk.
    pub(crate) unsafe fn new_in_segment(
        source: S,
        tuning: Tuning,
        tag: usize,
        base: *mut u8,
        size: usize,
        flags: u32,
        state_chunk: *mut Chunk,
    ) -> Self {
        let mut heap = Self {
            smallmap: BinMap::EMPTY,
            treemap: BinMap::EMPTY,
            smallbins: [null_mut(); NSMALLBINS],
            treebins: [null_mut(); NTREEBINS],
            dvsize: 0,
            topsize: 0,
            dv: null_mut(),
            top: null_mut(),
            least_addr: base,
            trim_check: 0,
            release_checks: MAX_RELEASE_CHECK_RATE,
            footprint: size,
            max_footprint: size,
            footprint_limit: 0,
            mflags: if S::HAS_MORECORE { USE_MMAP } else { USE_MMAP | NONCONTIGUOUS },
            seg: Segment { base, size, next: null_mut(), flags },
            tuning,
            page_size: crate::params::page_size(),
            tag,
            policy: ErrorPolicy::STRICT,
            reset_count: 0,
            #[cfg(feature = "counters")]
            counters: Counters::new(),
            source,
        };

        #[cfg(feature = "counters")]
        heap.counters.account_segment(size);

        let first = Chunk::next(state_chunk);
        let end = crate::ptr_utils::align_down_by(base.add(size), CHUNK_ALIGN_MASK);
        heap.init_top(first, end as usize - first as usize - TOP_FOOT_SIZE);
        Chunk::mark_inuse_foot(state_chunk, Chunk::size(state_chunk), tag);

        heap
    }

    #[inline]
    pub(crate) fn is_initialized(&self) -> bool {
        !self.top.is_null()
    }

    #[inline]
    fn ok_address<T>(&self, p: *const T) -> bool {
        p as usize >= self.least_addr as usize
    }

    /// Returns the memory source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Returns how usage and corruption errors are handled.
    pub fn error_policy(&self) -> ErrorPolicy {
        self.policy
    }

    /// Changes how usage and corruption errors are handled.
    pub fn set_error_policy(&mut self, policy: ErrorPolicy) {
        self.policy = policy;
    }

    /// Number of times the space was reset after detecting corruption.
    pub fn reset_count(&self) -> usize {
        self.reset_count
    }

    /// Returns the tunables of this space.
    pub fn tuning(&self) -> Tuning {
        self.tuning
    }

    /// Changes a tunable of this space. A `value` of `-1` means the maximum.
    pub fn set_param(&mut self, param: Param, value: isize) -> Result<(), HeapError> {
        self.tuning.set(param, value)
    }

    /// Returns the allocation statistics of this space.
    #[cfg(feature = "counters")]
    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    /// Bytes currently obtained from the system.
    pub fn footprint(&self) -> usize {
        self.footprint
    }

    /// The highest value [`Heap::footprint`] ever reached.
    pub fn max_footprint(&self) -> usize {
        self.max_footprint
    }

    /// The footprint limit, or `usize::MAX` if unlimited.
    pub fn footprint_limit(&self) -> usize {
        if self.footprint_limit == 0 { usize::MAX } else { self.footprint_limit }
    }

    /// Limits how many bytes may be obtained from the system.
    ///
    /// `usize::MAX` removes the limit, zero requests the smallest possible limit,
    /// and anything else is rounded up to the granularity.
    /// Returns the resulting limit as reported by [`Heap::footprint_limit`].
    pub fn set_footprint_limit(&mut self, bytes: usize) -> usize {
        self.footprint_limit = match bytes {
            0 => self.tuning.granularity_align(1),
            usize::MAX => 0,
            _ => self.tuning.granularity_align(bytes),
        };

        self.footprint_limit()
    }

    /// Sets whether large chunks are carved from the segments instead of dedicated mappings.
    ///
    /// Chunks in segments are reachable by [`Heap::inspect_all`] and are
    /// released when the space is destroyed. Returns the previous setting.
    pub fn track_large_chunks(&mut self, enable: bool) -> bool {
        let was_tracking = self.mflags & USE_MMAP == 0;

        if enable {
            self.mflags &= !USE_MMAP;
        } else {
            self.mflags |= USE_MMAP;
        }

        was_tracking
    }

    /// Applies the error policy to `err` and hands it back.
    #[cold]
    fn on_error(&mut self, err: HeapError) -> HeapError {
        match err {
            HeapError::Usage { .. } | HeapError::BadInstance => match self.policy.usage {
                UsageAction::Abort => {
                    log::error!("segheap: {}, aborting", err);
                    abort();
                }
                UsageAction::Ignore => log::warn!("segheap: {}, ignored", err),
            },
            HeapError::Corruption { .. } => match self.policy.corruption {
                CorruptionAction::Abort => {
                    log::error!("segheap: {}, aborting", err);
                    abort();
                }
                CorruptionAction::Reset => {
                    log::error!("segheap: {}, resetting the space", err);
                    self.reset_on_error();
                }
            },
            _ => {}
        }

        err
    }

    /// The usage action of a heap whose space failed validation.
    ///
    /// Only the raw byte is read, anything but [`UsageAction::Ignore`] aborts.
    pub(crate) unsafe fn stored_usage_action(heap: *const Self) -> UsageAction {
        match addr_of!((*heap).policy.usage).cast::<u8>().read() {
            byte if byte == UsageAction::Ignore as u8 => UsageAction::Ignore,
            _ => UsageAction::Abort,
        }
    }

    // ----- allocation -----

    /// Allocates at least `bytes` bytes aligned to [`MALLOC_ALIGNMENT`].
    pub fn malloc(&mut self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        match unsafe { self.allocate_chunk(bytes) } {
            Ok(p) => unsafe {
                #[cfg(feature = "counters")]
                self.counters.account_alloc(Chunk::size(p));

                self.scan_for_errors();
                Ok(NonNull::new_unchecked(Chunk::to_mem(p)))
            },
            Err(e) => Err(self.on_error(e)),
        }
    }

    /// Allocates zeroed memory for `count` elements of `size` bytes.
    pub fn calloc(&mut self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        let req = count.checked_mul(size).ok_or(HeapError::RequestTooLarge)?;
        let mem = self.malloc(req)?;

        unsafe {
            if !(S::MAP_CLEARS && Chunk::mmapped(Chunk::from_mem(mem.as_ptr()))) {
                mem.as_ptr().write_bytes(0, req);
            }
        }

        Ok(mem)
    }

    /// Allocates at least `bytes` bytes aligned to `alignment`.
    ///
    /// Alignments below the minimum chunk size are raised,
    /// and alignments that are not a power of two are rounded up to one.
    pub fn memalign(&mut self, alignment: usize, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        if alignment <= MALLOC_ALIGNMENT {
            return self.malloc(bytes);
        }

        match unsafe { self.memalign_chunk(alignment, bytes) } {
            Ok(p) => unsafe {
                #[cfg(feature = "counters")]
                self.counters.account_alloc(Chunk::size(p));

                self.scan_for_errors();
                Ok(NonNull::new_unchecked(Chunk::to_mem(p)))
            },
            Err(e) => Err(self.on_error(e)),
        }
    }

    /// Carves `chunks.len()` individually freeable zeroed blocks of
    /// `elem_size` bytes out of one allocation, writing them to `chunks`.
    pub fn independent_calloc(
        &mut self,
        elem_size: usize,
        chunks: &mut [*mut u8],
    ) -> Result<(), HeapError> {
        match unsafe { self.independent_alloc(Sizes::Same(elem_size), true, chunks) } {
            Ok(()) => {
                self.scan_for_errors();
                Ok(())
            }
            Err(e) => Err(self.on_error(e)),
        }
    }

    /// Carves one individually freeable block per entry of `sizes` out of
    /// one allocation, writing them to the start of `chunks`.
    ///
    /// Fails with [`HeapError::TooFewSlots`], allocating nothing, if `chunks`
    /// is shorter than `sizes`.
    pub fn independent_comalloc(
        &mut self,
        sizes: &[usize],
        chunks: &mut [*mut u8],
    ) -> Result<(), HeapError> {
        if chunks.len() < sizes.len() {
            return Err(HeapError::TooFewSlots { needed: sizes.len(), given: chunks.len() });
        }
        let chunks = &mut chunks[..sizes.len()];

        match unsafe { self.independent_alloc(Sizes::Each(sizes), false, chunks) } {
            Ok(()) => {
                self.scan_for_errors();
                Ok(())
            }
            Err(e) => Err(self.on_error(e)),
        }
    }

    /// The allocation dispatcher. Returns an in-use chunk of at least `bytes` usable bytes.
    unsafe fn allocate_chunk(&mut self, bytes: usize) -> Result<*mut Chunk, HeapError> {
        let nb;

        if bytes <= MAX_SMALL_REQUEST {
            nb = request_to_size(bytes);
            let mut idx = small_index(nb);
            let smallbits = self.smallmap.from_bit(idx);

            if smallbits & 0b11 != 0 {
                // exact fit, or the bin just above, where a remainder cannot form a chunk
                idx += !smallbits & 1;
                let size = small_index_to_size(idx);
                let p = self.unlink_first_small_chunk(idx)?;
                Chunk::set_inuse_and_pinuse(p, size, self.tag);
                return Ok(p);
            }

            if nb > self.dvsize {
                if let Some(i) = self.smallmap.bit_scan_above(idx) {
                    let size = small_index_to_size(i);
                    let p = self.unlink_first_small_chunk(i)?;
                    let rsize = size - nb;

                    if rsize < MIN_CHUNK_SIZE {
                        Chunk::set_inuse_and_pinuse(p, size, self.tag);
                    } else {
                        Chunk::set_size_and_pinuse_of_inuse_chunk(p, nb, self.tag);
                        let r = Chunk::plus_offset(p, nb);
                        Chunk::set_size_and_pinuse_of_free_chunk(r, rsize);
                        self.replace_dv(r, rsize)?;
                    }

                    return Ok(p);
                }

                if !self.treemap.is_empty() {
                    return self.tmalloc_small(nb);
                }
            }
        } else if bytes >= MAX_REQUEST {
            return Err(HeapError::RequestTooLarge);
        } else {
            nb = pad_request(bytes);

            if !self.treemap.is_empty() {
                if let Some(p) = self.tmalloc_large(nb)? {
                    return Ok(p);
                }
            }
        }

        if nb <= self.dvsize {
            Ok(self.take_from_dv(nb))
        } else if nb < self.topsize {
            Ok(self.take_from_top(nb))
        } else {
            self.sys_alloc(nb)
        }
    }

    unsafe fn take_from_dv(&mut self, nb: usize) -> *mut Chunk {
        let rsize = self.dvsize - nb;
        let p = self.dv;

        if rsize >= MIN_CHUNK_SIZE {
            let r = Chunk::plus_offset(p, nb);
            self.dv = r;
            self.dvsize = rsize;
            Chunk::set_size_and_pinuse_of_free_chunk(r, rsize);
            Chunk::set_size_and_pinuse_of_inuse_chunk(p, nb, self.tag);
        } else {
            // exhaust the victim rather than leave an unusable sliver
            let dvs = self.dvsize;
            self.dvsize = 0;
            self.dv = null_mut();
            Chunk::set_inuse_and_pinuse(p, dvs, self.tag);
        }

        p
    }

    unsafe fn take_from_top(&mut self, nb: usize) -> *mut Chunk {
        self.topsize -= nb;
        let rsize = self.topsize;
        let p = self.top;
        let r = Chunk::plus_offset(p, nb);
        self.top = r;
        (*r).head = rsize | PINUSE;
        Chunk::set_size_and_pinuse_of_inuse_chunk(p, nb, self.tag);
        p
    }

    /// Makes `p` the designated victim, filing the previous one into a bin.
    unsafe fn replace_dv(&mut self, p: *mut Chunk, size: usize) -> Result<(), HeapError> {
        let dvs = self.dvsize;
        if dvs != 0 {
            let dv = self.dv;
            self.insert_chunk(dv, dvs)?;
        }

        self.dvsize = size;
        self.dv = p;
        Ok(())
    }

    unsafe fn memalign_chunk(
        &mut self,
        alignment: usize,
        bytes: usize,
    ) -> Result<*mut Chunk, HeapError> {
        let mut alignment = alignment.max(MIN_CHUNK_SIZE);
        if !alignment.is_power_of_two() {
            alignment = alignment
                .checked_next_power_of_two()
                .ok_or(HeapError::RequestTooLarge)?
                .max(MALLOC_ALIGNMENT << 1);
        }

        if alignment >= MAX_REQUEST || bytes >= MAX_REQUEST - alignment {
            return Err(HeapError::RequestTooLarge);
        }

        let nb = request_to_size(bytes);
        // enough to find an aligned spot with room for a leading free chunk
        let req = nb + alignment + MIN_CHUNK_SIZE - CHUNK_OVERHEAD;
        let mut p = self.allocate_chunk(req)?;
        let mem = Chunk::to_mem(p);

        if !crate::ptr_utils::is_aligned_to(mem, alignment) {
            let br = Chunk::from_mem(crate::ptr_utils::align_up_by(mem, alignment - 1));
            let pos = if br as usize - p as usize >= MIN_CHUNK_SIZE {
                br
            } else {
                Chunk::plus_offset(br, alignment)
            };

            let leadsize = pos as usize - p as usize;
            let newsize = Chunk::size(p) - leadsize;

            if Chunk::mmapped(p) {
                (*pos).prev_foot = (*p).prev_foot + leadsize;
                (*pos).head = newsize;
            } else {
                Chunk::set_inuse(pos, newsize, self.tag);
                Chunk::set_inuse(p, leadsize, self.tag);
                self.dispose_chunk(p, leadsize)?;
            }

            p = pos;
        }

        if !Chunk::mmapped(p) {
            let size = Chunk::size(p);

            if size > nb + MIN_CHUNK_SIZE {
                let remainder_size = size - nb;
                let remainder = Chunk::plus_offset(p, nb);
                Chunk::set_inuse(p, nb, self.tag);
                Chunk::set_inuse(remainder, remainder_size, self.tag);
                self.dispose_chunk(remainder, remainder_size)?;
            }
        }

        Ok(p)
    }

    unsafe fn independent_alloc(
        &mut self,
        sizes: Sizes<'_>,
        zero: bool,
        chunks: &mut [*mut u8],
    ) -> Result<(), HeapError> {
        let n = chunks.len();
        if n == 0 {
            return Ok(());
        }

        let size_at = |i: usize| match sizes {
            Sizes::Same(size) => size,
            Sizes::Each(sizes) => sizes[i],
        };

        let contents_size = match sizes {
            Sizes::Same(size) if size < MAX_REQUEST => n.checked_mul(request_to_size(size)),
            Sizes::Each(sizes) => sizes.iter().try_fold(0usize, |sum, &size| {
                if size < MAX_REQUEST { sum.checked_add(request_to_size(size)) } else { None }
            }),
            _ => None,
        };

        let contents_size = match contents_size {
            Some(size) if size < MAX_REQUEST => size,
            _ => return Err(HeapError::RequestTooLarge),
        };

        // the pieces must share one segment chunk, never a dedicated mapping
        let was_enabled = self.mflags & USE_MMAP != 0;
        self.mflags &= !USE_MMAP;
        let result = self.allocate_chunk(contents_size - CHUNK_OVERHEAD);
        if was_enabled {
            self.mflags |= USE_MMAP;
        }

        let mut p = result?;
        let mut remainder_size = Chunk::size(p);
        debug_assert!(!Chunk::mmapped(p));

        if zero {
            Chunk::to_mem(p).write_bytes(0, remainder_size - CHUNK_OVERHEAD);
        }

        for (i, slot) in chunks.iter_mut().enumerate() {
            *slot = Chunk::to_mem(p);

            // the last piece takes whatever the allocation rounded up to
            let size = if i != n - 1 { request_to_size(size_at(i)) } else { remainder_size };
            remainder_size -= size;
            Chunk::set_size_and_pinuse_of_inuse_chunk(p, size, self.tag);

            #[cfg(feature = "counters")]
            self.counters.account_alloc(size);

            p = Chunk::plus_offset(p, size);
        }

        Ok(())
    }

    // ----- freeing -----

    /// Frees memory returned by this space. Null is ignored.
    ///
    /// # Safety
    /// `mem` must be null or a live allocation of this space.
    /// Passing anything else is detected on a best-effort basis only.
    pub unsafe fn free(&mut self, mem: *mut u8) -> Result<(), HeapError> {
        if mem.is_null() {
            return Ok(());
        }

        match self.free_chunk(Chunk::from_mem(mem)) {
            Ok(()) => {
                self.scan_for_errors();
                Ok(())
            }
            Err(e) => Err(self.on_error(e)),
        }
    }

    /// Frees every pointer in `ptrs` owned by this space, nulling its slot.
    ///
    /// Runs of pointers to physically adjacent chunks are merged before being freed.
    /// Returns the number of non-null pointers not owned by this space, which are left in place.
    ///
    /// # Safety
    /// Every non-null pointer must be a live allocation of some space.
    pub unsafe fn bulk_free(&mut self, ptrs: &mut [*mut u8]) -> Result<usize, HeapError> {
        match self.bulk_free_chunks(ptrs) {
            Ok(unfreed) => {
                self.scan_for_errors();
                Ok(unfreed)
            }
            Err(e) => Err(self.on_error(e)),
        }
    }

    /// Validates that `p` is an in-use chunk of this space, before anything is touched.
    unsafe fn check_owned(&self, p: *mut Chunk) -> Result<(), HeapError> {
        let mem = Chunk::to_mem(p);

        if !self.ok_address(p) || !Chunk::is_inuse(p) || Chunk::owner_tag(p) != self.tag {
            return Err(HeapError::usage(mem));
        }

        if !Chunk::mmapped(p) {
            let next = Chunk::next(p);
            if next <= p || !Chunk::pinuse(next) {
                return Err(HeapError::usage(mem));
            }

            if !Chunk::pinuse(p) && !self.ok_address(Chunk::prev(p)) {
                return Err(HeapError::usage(mem));
            }
        }

        Ok(())
    }

    unsafe fn free_chunk(&mut self, p: *mut Chunk) -> Result<(), HeapError> {
        self.check_owned(p)?;
        let psize = Chunk::size(p);

        #[cfg(feature = "counters")]
        self.counters.account_dealloc(psize);

        match self.coalesce(p, psize)? {
            Coalesced::Top => {
                if self.topsize > self.trim_check {
                    self.sys_trim(0)?;
                }
            }
            Coalesced::Binned(size) if !is_small(size) => {
                self.release_checks -= 1;
                if self.release_checks == 0 {
                    self.release_unused_segments()?;
                }
            }
            _ => {}
        }

        Ok(())
    }

    /// Gives the in-use chunk `p` of `psize` bytes back, without trimming.
    #[inline]
    unsafe fn dispose_chunk(&mut self, p: *mut Chunk, psize: usize) -> Result<(), HeapError> {
        self.coalesce(p, psize).map(|_| ())
    }

    /// Merges `p` with its free neighbors and files the result.
    unsafe fn coalesce(
        &mut self,
        mut p: *mut Chunk,
        mut psize: usize,
    ) -> Result<Coalesced, HeapError> {
        let next = Chunk::plus_offset(p, psize);

        if !Chunk::pinuse(p) {
            let prevsize = (*p).prev_foot;

            if Chunk::mmapped(p) {
                self.unmap_chunk(p, psize);
                return Ok(Coalesced::Unmapped);
            }

            let prev = Chunk::minus_offset(p, prevsize);
            if !self.ok_address(prev) {
                return Err(HeapError::corruption(prev));
            }

            psize += prevsize;
            p = prev;

            if p != self.dv {
                self.unlink_chunk(p, prevsize)?;
            } else if (*next).head & INUSE == INUSE {
                self.dvsize = psize;
                Chunk::set_free_with_pinuse(p, psize, next);
                return Ok(Coalesced::Victim);
            }
        }

        if !self.ok_address(next) {
            return Err(HeapError::corruption(next));
        }

        if !Chunk::cinuse(next) {
            if next == self.top {
                self.topsize += psize;
                self.top = p;
                (*p).head = self.topsize | PINUSE;

                if p == self.dv {
                    self.dv = null_mut();
                    self.dvsize = 0;
                }

                return Ok(Coalesced::Top);
            } else if next == self.dv {
                self.dvsize += psize;
                self.dv = p;
                Chunk::set_size_and_pinuse_of_free_chunk(p, self.dvsize);
                return Ok(Coalesced::Victim);
            }

            let nsize = Chunk::size(next);
            psize += nsize;
            self.unlink_chunk(next, nsize)?;
            Chunk::set_size_and_pinuse_of_free_chunk(p, psize);

            if p == self.dv {
                self.dvsize = psize;
                return Ok(Coalesced::Victim);
            }
        } else {
            Chunk::set_free_with_pinuse(p, psize, next);
        }

        self.insert_chunk(p, psize)?;
        Ok(Coalesced::Binned(psize))
    }

    unsafe fn bulk_free_chunks(&mut self, ptrs: &mut [*mut u8]) -> Result<usize, HeapError> {
        let mut unfreed = 0;
        #[cfg(feature = "counters")]
        let mut carried = 0;

        for i in 0..ptrs.len() {
            let mem = ptrs[i];
            if mem.is_null() {
                continue;
            }

            let p = Chunk::from_mem(mem);
            let psize = Chunk::size(p);

            if Chunk::owner_tag(p) != self.tag {
                unfreed += 1;
                continue;
            }

            ptrs[i] = null_mut();

            if !self.ok_address(p) || !Chunk::is_inuse(p) {
                return Err(HeapError::corruption(p));
            }

            #[cfg(feature = "counters")]
            {
                self.counters.account_dealloc(psize - carried);
                carried = 0;
            }

            let next = Chunk::next(p);
            if i + 1 < ptrs.len() && ptrs[i + 1] == Chunk::to_mem(next) {
                // absorb into the next pointer's chunk, which is freed in turn
                Chunk::set_inuse(p, Chunk::size(next) + psize, self.tag);
                ptrs[i + 1] = Chunk::to_mem(p);

                #[cfg(feature = "counters")]
                {
                    carried = psize;
                }
            } else {
                self.dispose_chunk(p, psize)?;
            }
        }

        if self.topsize > self.trim_check {
            self.sys_trim(0)?;
        }

        Ok(unfreed)
    }

    // ----- reallocation -----

    /// Resizes the allocation at `mem`, moving it if needed.
    ///
    /// A null `mem` allocates. On failure the original allocation is left intact.
    ///
    /// # Safety
    /// `mem` must be null or a live allocation of this space.
    pub unsafe fn realloc(&mut self, mem: *mut u8, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        if mem.is_null() {
            return self.malloc(bytes);
        }

        if let Some(resized) = self.try_realloc(mem, bytes, true)? {
            return Ok(resized);
        }

        let new = self.malloc(bytes)?;
        let copy = usable_size(mem).min(bytes);
        new.as_ptr().copy_from_nonoverlapping(mem, copy);
        self.free(mem)?;
        Ok(new)
    }

    /// Resizes the allocation at `mem` without moving it.
    ///
    /// Returns whether the allocation now holds at least `bytes` bytes.
    ///
    /// # Safety
    /// `mem` must be a live allocation of this space.
    pub unsafe fn realloc_in_place(&mut self, mem: *mut u8, bytes: usize) -> Result<bool, HeapError> {
        Ok(self.try_realloc(mem, bytes, false)?.is_some())
    }

    /// Resizes the chunk in place, or by remapping if `can_move`.
    ///
    /// Returns `None` if the contents would have to be copied.
    ///
    /// # Safety
    /// `mem` must be a live allocation of this space.
    pub unsafe fn try_realloc(
        &mut self,
        mem: *mut u8,
        bytes: usize,
        can_move: bool,
    ) -> Result<Option<NonNull<u8>>, HeapError> {
        if bytes >= MAX_REQUEST {
            return Err(HeapError::RequestTooLarge);
        }

        let oldp = Chunk::from_mem(mem);

        match self.try_realloc_chunk(oldp, request_to_size(bytes), can_move) {
            Ok(Some((newp, _old_size))) => {
                #[cfg(feature = "counters")]
                self.counters.account_resize(_old_size, Chunk::size(newp));

                self.scan_for_errors();
                Ok(Some(NonNull::new_unchecked(Chunk::to_mem(newp))))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(self.on_error(e)),
        }
    }

    /// Returns the resized chunk and its previous size.
    unsafe fn try_realloc_chunk(
        &mut self,
        p: *mut Chunk,
        nb: usize,
        can_move: bool,
    ) -> Result<Option<(*mut Chunk, usize)>, HeapError> {
        self.check_owned(p)?;

        let oldsize = Chunk::size(p);
        let next = Chunk::plus_offset(p, oldsize);

        if Chunk::mmapped(p) {
            return Ok(self.mmap_resize(p, nb, can_move).map(|newp| (newp, oldsize)));
        }

        if oldsize >= nb {
            let rsize = oldsize - nb;

            if rsize >= MIN_CHUNK_SIZE {
                let r = Chunk::plus_offset(p, nb);
                Chunk::set_inuse(p, nb, self.tag);
                Chunk::set_inuse(r, rsize, self.tag);
                self.dispose_chunk(r, rsize)?;
            }
        } else if next == self.top {
            if oldsize + self.topsize <= nb {
                return Ok(None);
            }

            let newtopsize = oldsize + self.topsize - nb;
            let newtop = Chunk::plus_offset(p, nb);
            Chunk::set_inuse(p, nb, self.tag);
            (*newtop).head = newtopsize | PINUSE;
            self.top = newtop;
            self.topsize = newtopsize;
        } else if next == self.dv {
            let dvs = self.dvsize;
            if oldsize + dvs < nb {
                return Ok(None);
            }

            let dsize = oldsize + dvs - nb;
            if dsize >= MIN_CHUNK_SIZE {
                let r = Chunk::plus_offset(p, nb);
                let n = Chunk::plus_offset(r, dsize);
                Chunk::set_inuse(p, nb, self.tag);
                Chunk::set_size_and_pinuse_of_free_chunk(r, dsize);
                Chunk::clear_pinuse(n);
                self.dvsize = dsize;
                self.dv = r;
            } else {
                Chunk::set_inuse(p, oldsize + dvs, self.tag);
                self.dvsize = 0;
                self.dv = null_mut();
            }
        } else if !Chunk::cinuse(next) {
            let nextsize = Chunk::size(next);
            if oldsize + nextsize < nb {
                return Ok(None);
            }

            let rsize = oldsize + nextsize - nb;
            self.unlink_chunk(next, nextsize)?;

            if rsize < MIN_CHUNK_SIZE {
                Chunk::set_inuse(p, oldsize + nextsize, self.tag);
            } else {
                let r = Chunk::plus_offset(p, nb);
                Chunk::set_inuse(p, nb, self.tag);
                Chunk::set_inuse(r, rsize, self.tag);
                self.dispose_chunk(r, rsize)?;
            }
        } else {
            return Ok(None);
        }

        Ok(Some((p, oldsize)))
    }

    // ----- queries -----

    /// Returns memory to the system, keeping at least `pad` bytes free in the top chunk.
    ///
    /// Returns whether any memory was released.
    pub fn trim(&mut self, pad: usize) -> bool {
        match unsafe { self.sys_trim(pad) } {
            Ok(released) => {
                self.scan_for_errors();
                released
            }
            Err(e) => {
                self.on_error(e);
                false
            }
        }
    }

    /// Releases every segment this space mapped, returning the number of bytes released.
    ///
    /// Caller-supplied segments and dedicated mappings of live chunks are left alone.
    pub(crate) unsafe fn release_all(mut self) -> usize {
        let head: *mut Segment = &mut self.seg;
        let mut freed = 0;

        // Records live inside segments, not necessarily their own. Only release
        // a segment once no other listed record is stored in it. Such a segment
        // always exists, as there is one fewer stored record than segments.
        loop {
            let mut prev: *mut Segment = null_mut();
            let mut node = head;
            let mut victim = None;

            while !node.is_null() && !(*node).base.is_null() {
                let seg = *node;
                let owned = seg.is_mmapped() && !seg.is_extern();

                if !owned || !segment::holds_other_record(head, node, &seg) {
                    victim = Some((prev, node, owned));
                    break;
                }

                prev = node;
                node = seg.next;
            }

            let Some((prev, node, owned)) = victim else { break };
            let seg = *node;

            if prev.is_null() {
                *head = if seg.next.is_null() { Segment::EMPTY } else { *seg.next };
            } else {
                (*prev).next = seg.next;
            }

            if owned && self.source.unmap(NonNull::new_unchecked(seg.base), seg.size) {
                freed += seg.size;
            }
        }

        log::debug!("segheap: space destroyed, {:#x} bytes released", freed);
        freed
    }
}

/// Bytes usable in the allocation at `mem`, or zero for null or a free chunk.
///
/// Works for allocations of any space without locking it.
///
/// # Safety
/// `mem` must be null or a pointer returned by a space.
pub unsafe fn usable_size(mem: *const u8) -> usize {
    if mem.is_null() {
        return 0;
    }

    let p = Chunk::from_mem(mem.cast_mut());
    if Chunk::is_inuse(p) { Chunk::size(p) - Chunk::overhead_for(p) } else { 0 }
}

#[cfg(test)]
mod tests;
