//! [`Space`] wraps a [`Heap`] in a lock, making it usable as a Rust
//! allocator or from multiple threads.
//!
//! See [`Space`].

use core::{
    marker::PhantomData,
    mem::{size_of, ManuallyDrop},
    ptr::{null_mut, NonNull},
};

use allocator_api2::alloc::{AllocError, Allocator, GlobalAlloc, Layout};

use crate::{
    base::{chunk::*, usable_size, Heap, MemInfo, Stats},
    error::{abort, ErrorPolicy, HeapError, UsageAction},
    params::{params, Param, Tuning},
    ptr_utils::{align_down_by, is_aligned_to},
    source::Source,
};

mod nolock;
pub use nolock::NoLock;

#[cfg(all(feature = "system-backed", unix))]
pub(crate) mod unix;
#[cfg(all(feature = "system-backed", unix))]
pub use unix::{GlobalLock, PthreadMutex};

#[cfg(all(feature = "system-backed", unix))]
mod default;
#[cfg(all(feature = "system-backed", unix))]
pub use default::DefaultSpace;

/// Copies larger than this are done with the lock released.
const RELEASE_LOCK_ON_REALLOC_LIMIT: usize = 0x4000;

/// What lives at the start of a space's first segment.
struct SpaceState<R: lock_api::RawMutex, S: Source> {
    /// The process magic while the space is alive, zero once destroyed.
    magic: usize,
    mutex: lock_api::Mutex<R, Heap<S>>,
}

/// An independent allocator over its own segments, guarded by the lock `R`,
/// obtaining memory from `S`.
///
/// The heap and its lock are stored inside the space's first segment.
/// Dropping the space releases every segment it mapped, see [`Space::destroy`].
///
/// Every chunk carries a tag identifying its space, so handing a pointer to
/// the wrong space is detected and treated as a usage error.
///
/// # Example
/// ```rust
/// use segheap::{Manual, Space};
///
/// let mut arena = vec![0u8; 1 << 16];
/// let space = unsafe {
///     Space::<spin::Mutex<()>, Manual>::create_with_base(arena.as_mut_ptr(), arena.len(), Manual)
/// }
/// .unwrap();
///
/// let p = space.malloc(100).unwrap();
/// assert!(unsafe { segheap::usable_size(p.as_ptr()) } >= 100);
/// unsafe { space.free(p.as_ptr()).unwrap() };
/// ```
pub struct Space<R: lock_api::RawMutex, S: Source> {
    state: NonNull<SpaceState<R, S>>,
    _phantom: PhantomData<SpaceState<R, S>>,
}

unsafe impl<R: lock_api::RawMutex + Send, S: Source + Send> Send for Space<R, S> {}
unsafe impl<R: lock_api::RawMutex + Sync, S: Source + Send> Sync for Space<R, S> {}

impl<R: lock_api::RawMutex, S: Source> core::fmt::Debug for Space<R, S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Space").field("state", &self.state).finish()
    }
}

impl<R: lock_api::RawMutex, S: Source> Space<R, S> {
    /// Bytes taken from the first segment by the heap and its lock.
    const STATE_SIZE: usize = pad_request(size_of::<SpaceState<R, S>>());

    const STATE_FITS_CHUNK: () = assert!(
        core::mem::align_of::<SpaceState<R, S>>() <= MALLOC_ALIGNMENT,
        "the space state must fit the alignment of a chunk"
    );

    /// Creates a space over a fresh region of at least `capacity` bytes mapped by `source`.
    ///
    /// A `capacity` of zero maps one granularity unit.
    /// The space grows beyond its capacity as needed, as far as `source` allows.
    pub fn create(capacity: usize, mut source: S) -> Result<Self, HeapError> {
        let tuning = params().tuning();

        let size = if capacity == 0 {
            tuning.granularity
        } else {
            capacity
                .checked_add(TOP_FOOT_SIZE + Self::STATE_SIZE)
                .filter(|&size| size < MAX_REQUEST)
                .map(|size| tuning.granularity_align(size))
                .filter(|&size| size > capacity)
                .ok_or(HeapError::RequestTooLarge)?
        };

        let base = source.map(size).ok_or(HeapError::OutOfMemory)?;

        // SAFETY: the source handed over `size` writable bytes
        Ok(unsafe { Self::init(base.as_ptr(), size, SEG_MMAP, source, tuning) })
    }

    /// Creates a space over `capacity` bytes at `base`.
    ///
    /// The memory is never released by the space. Growth beyond it is up to `source`,
    /// use [`Manual`](crate::Manual) to stay within it.
    ///
    /// Fails with [`HeapError::OutOfMemory`] if `capacity` leaves no room
    /// for any allocation after the space's own bookkeeping.
    ///
    /// # Safety
    /// The `capacity` bytes at `base` must be valid for reads and writes,
    /// and must not be used for anything else until the space is dropped.
    pub unsafe fn create_with_base(
        base: *mut u8,
        capacity: usize,
        source: S,
    ) -> Result<Self, HeapError> {
        let first = (Chunk::align_as_chunk(base) as usize).checked_add(Self::STATE_SIZE);
        let end = (base as usize).checked_add(capacity).map(|end| end & !CHUNK_ALIGN_MASK);

        match (first, end) {
            (Some(first), Some(end)) if end >= first && end - first >= TOP_FOOT_SIZE + MIN_CHUNK_SIZE => {
                let size = align_down_by(base.add(capacity), CHUNK_ALIGN_MASK) as usize - base as usize;
                Ok(Self::init(base, size, SEG_EXTERN, source, params().tuning()))
            }
            _ => Err(HeapError::OutOfMemory),
        }
    }

    /// Writes the space state into the start of the segment at `base` and
    /// hands the rest to a new heap.
    unsafe fn init(base: *mut u8, size: usize, flags: u32, source: S, tuning: Tuning) -> Self {
        let () = Self::STATE_FITS_CHUNK;

        let magic = params().magic;
        let msp = Chunk::align_as_chunk(base);
        (*msp).head = Self::STATE_SIZE | INUSE;

        let state = Chunk::to_mem(msp).cast::<SpaceState<R, S>>();
        let tag = state as usize ^ magic;
        let heap = Heap::new_in_segment(source, tuning, tag, base, size, flags, msp);

        state.write(SpaceState { magic, mutex: lock_api::Mutex::new(heap) });
        log::debug!("segheap: created space {:p} over {:p}..{:p}", state, base, base.add(size));

        Self { state: NonNull::new_unchecked(state), _phantom: PhantomData }
    }

    #[inline]
    fn state(&self) -> &SpaceState<R, S> {
        // SAFETY: the state stays valid until the space is dropped
        unsafe { self.state.as_ref() }
    }

    /// Destroys the space, returning the number of bytes given back to the source.
    ///
    /// Caller-supplied memory is never released. Neither are the dedicated mappings
    /// of large chunks that are still allocated, unless [`Space::track_large_chunks`]
    /// was enabled before they were allocated.
    ///
    /// A space whose state was overwritten is a usage error. Unless the stored
    /// policy ignores usage errors this aborts, otherwise nothing is released and
    /// [`HeapError::BadInstance`] is returned.
    pub fn destroy(self) -> Result<usize, HeapError> {
        let this = ManuallyDrop::new(self);
        // SAFETY: `this` is never used again
        unsafe { this.release() }
    }

    /// Tears the space down. Must only be called once.
    unsafe fn release(&self) -> Result<usize, HeapError> {
        let state = self.state.as_ptr();

        if (*state).magic != params().magic {
            match Heap::<S>::stored_usage_action((*state).mutex.data_ptr().cast_const()) {
                UsageAction::Abort => {
                    log::error!("segheap: space {:p} failed validation, aborting", state);
                    abort();
                }
                UsageAction::Ignore => {
                    log::warn!("segheap: space {:p} failed validation, not releasing it", state)
                }
            }
            return Err(HeapError::BadInstance);
        }

        (*state).magic = 0;
        let SpaceState { mutex, .. } = state.read();
        Ok(mutex.into_inner().release_all())
    }

    /// Lock the mutex and access the inner [`Heap`].
    #[track_caller]
    pub fn lock(&self) -> lock_api::MutexGuard<'_, R, Heap<S>> {
        self.state().mutex.lock()
    }

    /// Try to lock the mutex and access the inner [`Heap`].
    pub fn try_lock(&self) -> Option<lock_api::MutexGuard<'_, R, Heap<S>>> {
        self.state().mutex.try_lock()
    }

    /// Returns a mutable reference to the inner [`Heap`].
    ///
    /// This avoids locking, as having a mutable reference statically
    /// guarantees that `self` is not locked.
    pub fn get_mut(&mut self) -> &mut Heap<S> {
        // SAFETY: the state stays valid until the space is dropped
        unsafe { self.state.as_mut() }.mutex.get_mut()
    }

    /// See [`Heap::malloc`].
    pub fn malloc(&self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        self.lock().malloc(bytes)
    }

    /// Like [`Space::malloc`], but returns `None` instead of waiting for the lock.
    pub fn try_malloc(&self, bytes: usize) -> Option<Result<NonNull<u8>, HeapError>> {
        self.try_lock().map(|mut heap| heap.malloc(bytes))
    }

    /// See [`Heap::calloc`].
    pub fn calloc(&self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.lock().calloc(count, size)
    }

    /// See [`Heap::memalign`].
    pub fn memalign(&self, alignment: usize, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        self.lock().memalign(alignment, bytes)
    }

    /// See [`Heap::independent_calloc`].
    pub fn independent_calloc(&self, elem_size: usize, chunks: &mut [*mut u8]) -> Result<(), HeapError> {
        self.lock().independent_calloc(elem_size, chunks)
    }

    /// See [`Heap::independent_comalloc`].
    pub fn independent_comalloc(&self, sizes: &[usize], chunks: &mut [*mut u8]) -> Result<(), HeapError> {
        self.lock().independent_comalloc(sizes, chunks)
    }

    /// See [`Heap::free`].
    ///
    /// # Safety
    /// `mem` must be null or a live allocation of this space.
    pub unsafe fn free(&self, mem: *mut u8) -> Result<(), HeapError> {
        self.lock().free(mem)
    }

    /// Like [`Space::free`], but returns `None` instead of waiting for the lock.
    ///
    /// # Safety
    /// `mem` must be null or a live allocation of this space.
    pub unsafe fn try_free(&self, mem: *mut u8) -> Option<Result<(), HeapError>> {
        self.try_lock().map(|mut heap| heap.free(mem))
    }

    /// See [`Heap::bulk_free`].
    ///
    /// # Safety
    /// Every non-null pointer must be a live allocation of some space.
    pub unsafe fn bulk_free(&self, ptrs: &mut [*mut u8]) -> Result<usize, HeapError> {
        self.lock().bulk_free(ptrs)
    }

    /// Resizes the allocation at `mem`, moving it if needed.
    ///
    /// Large copies are done without holding the lock.
    ///
    /// # Safety
    /// `mem` must be null or a live allocation of this space.
    pub unsafe fn realloc(&self, mem: *mut u8, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        if mem.is_null() {
            return self.malloc(bytes);
        }

        let mut heap = self.lock();
        if let Some(resized) = heap.try_realloc(mem, bytes, true)? {
            return Ok(resized);
        }

        let copy = usable_size(mem).min(bytes);
        self.relocate(heap, mem, copy, MALLOC_ALIGNMENT, bytes)
    }

    /// See [`Heap::realloc_in_place`].
    ///
    /// # Safety
    /// `mem` must be a live allocation of this space.
    pub unsafe fn realloc_in_place(&self, mem: *mut u8, bytes: usize) -> Result<bool, HeapError> {
        self.lock().realloc_in_place(mem, bytes)
    }

    /// Moves the allocation at `mem` into a new one of `bytes` bytes aligned to
    /// `align`, copying `copy` bytes over.
    unsafe fn relocate<'a>(
        &'a self,
        mut heap: lock_api::MutexGuard<'a, R, Heap<S>>,
        mem: *mut u8,
        copy: usize,
        align: usize,
        bytes: usize,
    ) -> Result<NonNull<u8>, HeapError> {
        let allocation =
            if align <= MALLOC_ALIGNMENT { heap.malloc(bytes)? } else { heap.memalign(align, bytes)? };

        if copy > RELEASE_LOCK_ON_REALLOC_LIMIT {
            drop(heap);
            allocation.as_ptr().copy_from_nonoverlapping(mem, copy);
            heap = self.lock();
        } else {
            allocation.as_ptr().copy_from_nonoverlapping(mem, copy);
        }

        heap.free(mem)?;
        Ok(allocation)
    }

    /// See [`Heap::trim`].
    pub fn trim(&self, pad: usize) -> bool {
        self.lock().trim(pad)
    }

    /// See [`Heap::footprint`].
    pub fn footprint(&self) -> usize {
        self.lock().footprint()
    }

    /// See [`Heap::max_footprint`].
    pub fn max_footprint(&self) -> usize {
        self.lock().max_footprint()
    }

    /// See [`Heap::footprint_limit`].
    pub fn footprint_limit(&self) -> usize {
        self.lock().footprint_limit()
    }

    /// See [`Heap::set_footprint_limit`].
    pub fn set_footprint_limit(&self, bytes: usize) -> usize {
        self.lock().set_footprint_limit(bytes)
    }

    /// See [`Heap::set_param`].
    pub fn set_param(&self, param: Param, value: isize) -> Result<(), HeapError> {
        self.lock().set_param(param, value)
    }

    /// See [`Heap::track_large_chunks`].
    pub fn track_large_chunks(&self, enable: bool) -> bool {
        self.lock().track_large_chunks(enable)
    }

    /// See [`Heap::set_error_policy`].
    pub fn set_error_policy(&self, policy: ErrorPolicy) {
        self.lock().set_error_policy(policy)
    }

    /// See [`Heap::mem_info`].
    pub fn mem_info(&self) -> MemInfo {
        self.lock().mem_info()
    }

    /// See [`Heap::stats`].
    pub fn stats(&self) -> Stats {
        self.lock().stats()
    }

    /// See [`Heap::inspect_all`].
    ///
    /// The space stays locked while `f` runs, so `f` must not use it.
    pub fn inspect_all(&self, f: impl FnMut(*mut u8, *mut u8, usize)) {
        self.lock().inspect_all(f)
    }
}

#[cfg(all(feature = "system-backed", unix))]
impl<S: Source> Space<PthreadMutex, S> {
    /// Puts the lock back into its initial state in a forked child.
    ///
    /// # Safety
    /// See [`PthreadMutex::reinit_after_fork`].
    pub unsafe fn reinit_after_fork(&self) {
        self.state().mutex.raw().reinit_after_fork();
    }
}

impl<R: lock_api::RawMutex, S: Source> Drop for Space<R, S> {
    fn drop(&mut self) {
        // SAFETY: the space is not used after being dropped
        let _ = unsafe { self.release() };
    }
}

unsafe impl<R: lock_api::RawMutex, S: Source> GlobalAlloc for Space<R, S> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.lock();

        let res = if layout.align() <= MALLOC_ALIGNMENT {
            heap.malloc(layout.size())
        } else {
            heap.memalign(layout.align(), layout.size())
        };

        res.map_or(null_mut(), NonNull::as_ptr)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= MALLOC_ALIGNMENT {
            return self.lock().calloc(1, layout.size()).map_or(null_mut(), NonNull::as_ptr);
        }

        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            ptr.write_bytes(0, layout.size());
        }
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        let _ = self.lock().free(ptr);
    }

    unsafe fn realloc(&self, ptr: *mut u8, old_layout: Layout, new_size: usize) -> *mut u8 {
        if old_layout.align() <= MALLOC_ALIGNMENT {
            return Space::realloc(self, ptr, new_size).map_or(null_mut(), NonNull::as_ptr);
        }

        // remapping could lose the alignment
        let mut heap = self.lock();
        match heap.try_realloc(ptr, new_size, false) {
            Ok(Some(resized)) => resized.as_ptr(),
            Ok(None) => {
                let copy = old_layout.size().min(new_size);
                self.relocate(heap, ptr, copy, old_layout.align(), new_size)
                    .map_or(null_mut(), NonNull::as_ptr)
            }
            Err(_) => null_mut(),
        }
    }
}

#[inline(always)]
fn nonnull_slice_from_raw_parts(nn: NonNull<u8>, len: usize) -> NonNull<[u8]> {
    // SAFETY: if `nn` is non-null, then the resulting slice is non-null
    unsafe { NonNull::new_unchecked(core::ptr::slice_from_raw_parts_mut(nn.as_ptr(), len)) }
}

/// A well-aligned pointer for zero-sized allocations.
#[inline(always)]
fn dangling_for(layout: Layout) -> NonNull<[u8]> {
    // SAFETY: alignments are never zero
    let nn = unsafe { NonNull::new_unchecked(layout.align() as *mut u8) };
    nonnull_slice_from_raw_parts(nn, 0)
}

unsafe impl<R: lock_api::RawMutex, S: Source> Allocator for Space<R, S> {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        if layout.size() == 0 {
            return Ok(dangling_for(layout));
        }

        // SAFETY: Ensured the size is not zero above.
        let ptr = unsafe { GlobalAlloc::alloc(self, layout) };
        NonNull::new(ptr).map(|nn| nonnull_slice_from_raw_parts(nn, layout.size())).ok_or(AllocError)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() != 0 {
            let _ = self.lock().free(ptr.as_ptr());
        }
    }

    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() >= old_layout.size());

        if old_layout.size() == 0 {
            return self.allocate(new_layout);
        }

        let mut heap = self.lock();

        if is_aligned_to(ptr.as_ptr(), new_layout.align())
            && heap.realloc_in_place(ptr.as_ptr(), new_layout.size()) == Ok(true)
        {
            return Ok(nonnull_slice_from_raw_parts(ptr, new_layout.size()));
        }

        // can't grow in place, reallocate manually
        self.relocate(heap, ptr.as_ptr(), old_layout.size(), new_layout.align(), new_layout.size())
            .map(|nn| nonnull_slice_from_raw_parts(nn, new_layout.size()))
            .map_err(|_| AllocError)
    }

    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        let res = self.grow(ptr, old_layout, new_layout);

        if let Ok(allocation) = res {
            allocation
                .as_ptr()
                .cast::<u8>()
                .add(old_layout.size())
                .write_bytes(0, new_layout.size() - old_layout.size());
        }

        res
    }

    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        debug_assert!(new_layout.size() <= old_layout.size());

        if new_layout.size() == 0 {
            if old_layout.size() > 0 {
                let _ = self.lock().free(ptr.as_ptr());
            }

            return Ok(dangling_for(new_layout));
        }

        let mut heap = self.lock();

        // dedicated mappings may refuse to shrink without moving
        if is_aligned_to(ptr.as_ptr(), new_layout.align())
            && heap.realloc_in_place(ptr.as_ptr(), new_layout.size()) == Ok(true)
        {
            return Ok(nonnull_slice_from_raw_parts(ptr, new_layout.size()));
        }

        self.relocate(heap, ptr.as_ptr(), new_layout.size(), new_layout.align(), new_layout.size())
            .map(|nn| nonnull_slice_from_raw_parts(nn, new_layout.size()))
            .map_err(|_| AllocError)
    }
}

#[cfg(test)]
mod tests {
    use core::ptr::null_mut;

    use super::*;
    use crate::{
        error::UsageAction,
        ptr_utils::align_size_up,
        source::Manual,
    };

    type ArenaSpace = Space<spin::Mutex<()>, Manual>;

    /// The arena must outlive the space.
    fn arena_space(arena: &mut [u8]) -> ArenaSpace {
        unsafe { ArenaSpace::create_with_base(arena.as_mut_ptr(), arena.len(), Manual) }.unwrap()
    }

    /// A program break over a buffer, for exercising contiguous growth.
    #[derive(Debug)]
    struct Brk {
        base: *mut u8,
        len: usize,
        brk: usize,
    }

    unsafe impl Source for Brk {
        const HAS_MORECORE: bool = true;

        fn map(&mut self, _size: usize) -> Option<NonNull<u8>> {
            None
        }

        unsafe fn unmap(&mut self, _base: NonNull<u8>, _size: usize) -> bool {
            false
        }

        unsafe fn morecore(&mut self, increment: isize) -> Option<NonNull<u8>> {
            let old = self.brk;
            let new = old.checked_add_signed(increment).filter(|&new| new <= self.len)?;
            self.brk = new;
            NonNull::new(self.base.add(old))
        }
    }

    #[test]
    fn create_with_base_needs_room() {
        let mut arena = std::vec![0u8; 256];
        let res = unsafe { ArenaSpace::create_with_base(arena.as_mut_ptr(), arena.len(), Manual) };
        assert_eq!(res.unwrap_err(), HeapError::OutOfMemory);

        let res = unsafe { ArenaSpace::create_with_base(arena.as_mut_ptr(), usize::MAX, Manual) };
        assert_eq!(res.unwrap_err(), HeapError::OutOfMemory);
    }

    #[test]
    fn allocations_are_usable_and_aligned() {
        let mut arena = std::vec![0u8; 1 << 20];
        let space = arena_space(&mut arena);
        let mut live = std::vec::Vec::new();

        for i in 0..400usize {
            let size = fastrand::usize(0..3000);
            let p = space.malloc(size).unwrap();
            let usable = unsafe { usable_size(p.as_ptr()) };

            assert!(usable >= size);
            assert!(is_aligned_to(p.as_ptr(), MALLOC_ALIGNMENT));

            unsafe { p.as_ptr().write_bytes(i as u8, usable) };
            live.push((p, usable, i as u8));

            if fastrand::bool() {
                let (p, usable, fill) = live.swap_remove(fastrand::usize(..live.len()));
                let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), usable) };
                assert!(bytes.iter().all(|&b| b == fill));
                unsafe { space.free(p.as_ptr()).unwrap() };
            }
        }

        for (p, usable, fill) in live {
            let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), usable) };
            assert!(bytes.iter().all(|&b| b == fill));
            unsafe { space.free(p.as_ptr()).unwrap() };
        }

        assert_eq!(space.mem_info().free_chunks, 1);
    }

    #[test]
    fn freed_neighbors_are_reused() {
        let mut arena = std::vec![0u8; 64 << 10];
        let space = arena_space(&mut arena);

        let a = space.malloc(100).unwrap();
        let b = space.malloc(100).unwrap();
        let c = space.malloc(100).unwrap();
        let footprint = space.footprint();

        unsafe { space.free(b.as_ptr()).unwrap() };
        let d = space.malloc(150).unwrap();
        assert_ne!(d, a);
        assert_ne!(d, c);
        assert_eq!(space.footprint(), footprint);

        // a and b together hold more than 150 bytes
        unsafe {
            space.free(d.as_ptr()).unwrap();
            let b = space.malloc(100).unwrap();
            space.free(b.as_ptr()).unwrap();
            space.free(a.as_ptr()).unwrap();
        }
        assert_eq!(space.malloc(150).unwrap(), a);
        assert_eq!(space.footprint(), footprint);
    }

    #[test]
    fn realloc_in_place_and_moving() {
        let mut arena = std::vec![0u8; 1 << 16];
        let space = arena_space(&mut arena);

        unsafe {
            // a free successor that is big enough is absorbed
            let x = space.malloc(64).unwrap();
            let y = space.malloc(400).unwrap();
            let z = space.malloc(64).unwrap();
            space.free(y.as_ptr()).unwrap();
            x.as_ptr().write_bytes(0xAB, 64);
            assert_eq!(space.realloc_in_place(x.as_ptr(), 300), Ok(true));
            assert!(usable_size(x.as_ptr()) >= 300);
            assert!(core::slice::from_raw_parts(x.as_ptr(), 64).iter().all(|&b| b == 0xAB));

            space.free(x.as_ptr()).unwrap();
            space.free(z.as_ptr()).unwrap();
            assert_eq!(space.mem_info().free_chunks, 1);

            // followed by the top chunk
            let a = space.malloc(100).unwrap();
            assert_eq!(space.realloc(a.as_ptr(), 200).unwrap(), a);

            let guard = space.malloc(100).unwrap();
            for i in 0..200 {
                a.as_ptr().add(i).write(i as u8);
            }

            // shrinking never moves
            assert_eq!(space.realloc(a.as_ptr(), 180).unwrap(), a);

            // blocked by `guard`
            assert_eq!(space.realloc_in_place(a.as_ptr(), 1000), Ok(false));
            let moved = space.realloc(a.as_ptr(), 1000).unwrap();
            assert_ne!(moved, a);
            for i in 0..180 {
                assert_eq!(moved.as_ptr().add(i).read(), i as u8);
            }

            space.free(guard.as_ptr()).unwrap();
            space.free(moved.as_ptr()).unwrap();

            assert_eq!(space.realloc(null_mut(), 10).map(|p| usable_size(p.as_ptr()) >= 10), Ok(true));
        }
    }

    #[test]
    fn large_copies_release_the_lock() {
        let mut arena = std::vec![0u8; 1 << 20];
        let space = arena_space(&mut arena);

        unsafe {
            let a = space.malloc(RELEASE_LOCK_ON_REALLOC_LIMIT * 2).unwrap();
            let guard = space.malloc(16).unwrap();
            a.as_ptr().write_bytes(7, RELEASE_LOCK_ON_REALLOC_LIMIT * 2);

            let b = space.realloc(a.as_ptr(), RELEASE_LOCK_ON_REALLOC_LIMIT * 4).unwrap();
            assert_ne!(a, b);
            assert!(core::slice::from_raw_parts(b.as_ptr(), RELEASE_LOCK_ON_REALLOC_LIMIT * 2)
                .iter()
                .all(|&x| x == 7));
            assert!(space.try_lock().is_some());

            space.free(b.as_ptr()).unwrap();
            space.free(guard.as_ptr()).unwrap();
        }
    }

    #[test]
    fn spaces_are_independent() {
        let mut arena_a = std::vec![0u8; 1 << 16];
        let mut arena_b = std::vec![0u8; 1 << 16];
        let a = arena_space(&mut arena_a);
        let b = arena_space(&mut arena_b);
        b.set_error_policy(ErrorPolicy { usage: UsageAction::Ignore, ..ErrorPolicy::STRICT });

        let pa = a.malloc(64).unwrap();
        let pb = b.malloc(64).unwrap();
        assert!(!(arena_b.as_ptr_range().contains(&pa.as_ptr().cast_const())));

        // freeing through the wrong space leaves both untouched
        let before = b.mem_info();
        assert!(matches!(unsafe { b.free(pa.as_ptr()) }, Err(HeapError::Usage { .. })));
        assert_eq!(b.mem_info(), before);

        let mut ptrs = [pa.as_ptr(), pb.as_ptr()];
        assert_eq!(unsafe { b.bulk_free(&mut ptrs) }, Ok(1));
        assert_eq!(ptrs, [pa.as_ptr(), null_mut()]);

        unsafe { pa.as_ptr().write_bytes(3, 64) };
        let pb = b.malloc(64).unwrap();
        unsafe { pb.as_ptr().write_bytes(4, 64) };

        assert_eq!(a.destroy(), Ok(0));
        assert!(unsafe { core::slice::from_raw_parts(pb.as_ptr(), 64) }.iter().all(|&x| x == 4));
        unsafe { b.free(pb.as_ptr()).unwrap() };
    }

    #[test]
    fn usage_errors_can_be_ignored() {
        let mut arena = std::vec![0u8; 1 << 16];
        let space = arena_space(&mut arena);
        space.set_error_policy(ErrorPolicy::LENIENT);

        let p = space.malloc(48).unwrap();
        let q = space.malloc(48).unwrap();
        unsafe {
            space.free(p.as_ptr()).unwrap();
            assert_eq!(space.free(p.as_ptr()), Err(HeapError::usage(p.as_ptr())));
            assert!(matches!(space.realloc(p.as_ptr(), 10), Err(HeapError::Usage { .. })));

            let mut unaligned = [0usize; 8];
            let fake = unaligned.as_mut_ptr().add(4).cast::<u8>();
            assert!(space.free(fake).is_err());
        }

        assert_eq!(space.lock().reset_count(), 0);
        unsafe { space.free(q.as_ptr()).unwrap() };
        space.lock().scan_for_errors();
    }

    #[test]
    fn corruption_resets_the_space() {
        let mut arena = std::vec![0u8; 1 << 16];
        let space = arena_space(&mut arena);
        space.set_error_policy(ErrorPolicy::LENIENT);

        let a = space.malloc(64).unwrap();
        let _g1 = space.malloc(8).unwrap();
        let b = space.malloc(64).unwrap();
        let _g2 = space.malloc(8).unwrap();
        let c = space.malloc(64).unwrap();

        unsafe {
            space.free(a.as_ptr()).unwrap();
            space.free(b.as_ptr()).unwrap();

            // b is taken first, and a no longer points back at it
            (*Chunk::from_mem(a.as_ptr())).bk = Chunk::from_mem(c.as_ptr());
        }

        assert!(matches!(space.malloc(64), Err(HeapError::Corruption { .. })));
        assert_eq!(space.lock().reset_count(), 1);
        assert_eq!(space.mem_info(), MemInfo::default());

        // nothing to grow into
        assert_eq!(space.malloc(64), Err(HeapError::OutOfMemory));
        assert_eq!(space.destroy(), Ok(0));
    }

    #[test]
    fn footprint_limit() {
        let mut arena = std::vec![0u8; 1 << 16];
        let space = arena_space(&mut arena);
        let granularity = params().tuning().granularity;

        assert_eq!(space.footprint_limit(), usize::MAX);
        assert_eq!(space.set_footprint_limit(0), granularity);
        assert_eq!(space.set_footprint_limit(granularity + 1), granularity * 2);

        space.set_footprint_limit(space.footprint());
        let err = space.malloc(100_000).unwrap_err();
        assert_eq!(err, HeapError::FootprintLimit);
        assert!(err.is_allocation_failure());

        assert_eq!(space.set_footprint_limit(usize::MAX), usize::MAX);
        assert_eq!(space.malloc(100_000), Err(HeapError::OutOfMemory));
        assert_eq!(space.malloc(usize::MAX - 8), Err(HeapError::RequestTooLarge));
        assert_eq!(space.calloc(usize::MAX / 2, 3), Err(HeapError::RequestTooLarge));
    }

    #[test]
    fn trim_returns_to_baseline() {
        let mut arena = std::vec![0u8; 8 << 10];
        let mut brk_buf = std::vec![0u8; 4 << 20];
        let brk = Brk { base: brk_buf.as_mut_ptr(), len: brk_buf.len(), brk: 0 };
        let space = unsafe {
            Space::<spin::Mutex<()>, Brk>::create_with_base(arena.as_mut_ptr(), arena.len(), brk)
        }
        .unwrap();

        // establish the break-backed segment
        let p = space.malloc(20_000).unwrap();
        unsafe { space.free(p.as_ptr()).unwrap() };
        space.trim(0);
        let baseline = space.footprint();
        assert!(baseline > arena.len());

        let mut ptrs: std::vec::Vec<_> = (0..64).map(|_| space.malloc(4000).unwrap()).collect();
        assert!(space.footprint() > baseline);

        fastrand::shuffle(&mut ptrs);
        for p in ptrs {
            unsafe { space.free(p.as_ptr()).unwrap() };
        }

        assert!(space.trim(0));
        assert_eq!(space.footprint(), baseline);
        assert!(space.max_footprint() > baseline);
        assert!(!space.trim(0));
    }

    #[test]
    fn aligned_and_independent_allocations() {
        let mut arena = std::vec![0u8; 1 << 18];
        let space = arena_space(&mut arena);

        for align in [32, 64, 100, 4096] {
            let p = space.memalign(align, 200).unwrap();
            assert!(is_aligned_to(p.as_ptr(), align.next_power_of_two()));
            assert!(unsafe { usable_size(p.as_ptr()) } >= 200);
            unsafe { space.free(p.as_ptr()).unwrap() };
        }

        let mut chunks = [null_mut(); 5];
        space.independent_calloc(24, &mut chunks).unwrap();
        for pair in chunks.windows(2) {
            assert!(pair[0] < pair[1]);
            assert_eq!(unsafe { usable_size(pair[0]) }, request_to_size(24) - CHUNK_OVERHEAD);
        }
        assert!(chunks.iter().all(|&p| unsafe { *p.cast::<[u8; 24]>() } == [0; 24]));

        let sizes = [8, 300, 40];
        let mut parts = [null_mut(); 4];
        space.independent_comalloc(&sizes, &mut parts).unwrap();
        assert!(parts[3].is_null());
        for (&p, &size) in parts.iter().zip(&sizes) {
            assert!(unsafe { usable_size(p) } >= size);
        }

        // the space's own state is an in-use chunk as well
        let mut seen = 0;
        space.inspect_all(|_, _, used| seen += (used != 0) as usize);
        assert_eq!(seen, 1 + 5 + 3);

        assert_eq!(unsafe { space.bulk_free(&mut chunks) }, Ok(0));
        assert_eq!(unsafe { space.bulk_free(&mut parts) }, Ok(0));
        assert_eq!(space.mem_info().total_allocated, space.lock().stats().in_use_bytes);
    }

    #[test]
    fn try_variants_respect_the_lock() {
        let mut arena = std::vec![0u8; 1 << 16];
        let space = arena_space(&mut arena);

        let p = space.try_malloc(10).unwrap().unwrap();
        {
            let _heap = space.lock();
            assert!(space.try_malloc(10).is_none());
            assert!(unsafe { space.try_free(p.as_ptr()) }.is_none());
        }
        assert_eq!(unsafe { space.try_free(p.as_ptr()) }, Some(Ok(())));
    }

    #[test]
    fn threads_share_a_space() {
        let mut arena = std::vec![0u8; 4 << 20];
        let space = arena_space(&mut arena);

        std::thread::scope(|scope| {
            for t in 0..4u8 {
                let space = &space;
                scope.spawn(move || {
                    let rng = fastrand::Rng::with_seed(t as u64);
                    let mut live: std::vec::Vec<(NonNull<u8>, usize)> = std::vec::Vec::new();

                    for _ in 0..2000 {
                        match rng.usize(0..4) {
                            0 | 1 => {
                                let size = rng.usize(1..1000);
                                if let Ok(p) = space.malloc(size) {
                                    unsafe { p.as_ptr().write_bytes(t, size) };
                                    live.push((p, size));
                                }
                            }
                            2 if !live.is_empty() => {
                                let (p, size) = live.swap_remove(rng.usize(..live.len()));
                                let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), size) };
                                assert!(bytes.iter().all(|&b| b == t));
                                unsafe { space.free(p.as_ptr()).unwrap() };
                            }
                            3 if !live.is_empty() => {
                                let i = rng.usize(..live.len());
                                let (p, size) = live[i];
                                let new_size = rng.usize(1..2000);
                                if let Ok(q) = unsafe { space.realloc(p.as_ptr(), new_size) } {
                                    let kept = size.min(new_size);
                                    let bytes = unsafe { core::slice::from_raw_parts(q.as_ptr(), kept) };
                                    assert!(bytes.iter().all(|&b| b == t));
                                    unsafe { q.as_ptr().write_bytes(t, new_size) };
                                    live[i] = (q, new_size);
                                }
                            }
                            _ => {}
                        }
                    }

                    for (p, _) in live {
                        unsafe { space.free(p.as_ptr()).unwrap() };
                    }
                });
            }
        });

        let heap = space.lock();
        heap.scan_for_errors();
        assert_eq!(heap.mem_info().free_chunks, 1);
    }

    #[test]
    fn allocator_traits() {
        let mut arena = std::vec![0u8; 1 << 18];
        let space = arena_space(&mut arena);

        let mut v = allocator_api2::vec::Vec::new_in(&space);
        for i in 0..1000u32 {
            v.push(i);
        }
        assert!(v.iter().copied().eq(0..1000));
        v.shrink_to_fit();
        drop(v);

        unsafe {
            let layout = Layout::from_size_align(100, 256).unwrap();
            let p = GlobalAlloc::alloc_zeroed(&space, layout);
            assert!(is_aligned_to(p, 256));
            assert!(core::slice::from_raw_parts(p, 100).iter().all(|&b| b == 0));
            p.write_bytes(9, 100);

            let q = GlobalAlloc::realloc(&space, p, layout, 5000);
            assert!(is_aligned_to(q, 256));
            assert!(core::slice::from_raw_parts(q, 100).iter().all(|&b| b == 9));
            GlobalAlloc::dealloc(&space, q, Layout::from_size_align(5000, 256).unwrap());

            let zst = space.allocate(Layout::from_size_align(0, 64).unwrap()).unwrap();
            assert!(is_aligned_to(zst.as_ptr().cast::<u8>(), 64));

            let layout = Layout::from_size_align(40, 8).unwrap();
            let p = space.allocate(layout).unwrap().cast::<u8>();
            let grown = space.grow_zeroed(p, layout, Layout::from_size_align(400, 8).unwrap()).unwrap();
            assert!(core::slice::from_raw_parts(grown.as_ptr().cast::<u8>().add(40), 360)
                .iter()
                .all(|&b| b == 0));
            let shrunk = space
                .shrink(grown.cast(), Layout::from_size_align(400, 8).unwrap(), Layout::from_size_align(10, 64).unwrap())
                .unwrap();
            assert!(is_aligned_to(shrunk.as_ptr().cast::<u8>(), 64));
            space.deallocate(shrunk.cast(), Layout::from_size_align(10, 64).unwrap());
        }

        assert_eq!(space.mem_info().free_chunks, 1);
    }

    #[test]
    fn destroyed_state_is_rejected() {
        let mut arena = std::vec![0u8; 1 << 16];
        let space = arena_space(&mut arena);
        space.set_error_policy(ErrorPolicy::LENIENT);

        unsafe {
            (*space.state.as_ptr()).magic ^= 1;
            assert_eq!(space.release(), Err(HeapError::BadInstance));
            (*space.state.as_ptr()).magic ^= 1;
        }

        assert_eq!(space.destroy(), Ok(0));
    }

    #[test]
    fn dropping_a_corrupted_space_releases_nothing() {
        let mut arena = std::vec![0u8; 1 << 16];
        let space = arena_space(&mut arena);
        space.set_error_policy(ErrorPolicy::LENIENT);

        let state = space.state;
        unsafe { (*state.as_ptr()).magic ^= 1 };
        drop(space);

        // a successful release zeroes the magic
        assert_ne!(unsafe { (*state.as_ptr()).magic }, 0);
        assert_ne!(unsafe { (*state.as_ptr()).magic }, params().magic);
    }

    #[cfg(all(feature = "system-backed", unix))]
    mod system {
        use super::*;
        use crate::{params::page_size, source::Mmap};

        type MmapSpace = Space<PthreadMutex, Mmap>;

        #[test]
        fn dropping_a_corrupted_space_aborts() {
            let mut arena = std::vec![0u8; 1 << 16];
            let space = arena_space(&mut arena);
            unsafe { (*space.state.as_ptr()).magic ^= 1 };

            let pid = unsafe { libc::fork() };
            assert!(pid >= 0);
            if pid == 0 {
                drop(space);
                unsafe { libc::_exit(0) };
            }

            let mut status = 0;
            assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
            assert!(libc::WIFSIGNALED(status));
            assert_eq!(libc::WTERMSIG(status), libc::SIGABRT);

            unsafe { (*space.state.as_ptr()).magic ^= 1 };
            assert_eq!(space.destroy(), Ok(0));
        }

        #[test]
        fn scenario_in_64k_space() {
            let space = MmapSpace::create(64 << 10, Mmap).unwrap();
            let footprint = space.footprint();
            assert!(footprint >= 64 << 10);

            let _a = space.malloc(100).unwrap();
            let b = space.malloc(100).unwrap();
            let _c = space.malloc(100).unwrap();
            unsafe { space.free(b.as_ptr()).unwrap() };
            let _d = space.malloc(150).unwrap();

            assert_eq!(space.footprint(), footprint);
            assert_eq!(space.destroy(), Ok(footprint));
        }

        #[test]
        fn mapped_chunks_are_unmapped_on_free() {
            let space = MmapSpace::create(0, Mmap).unwrap();
            let threshold = space.lock().tuning().mmap_threshold;
            let before = space.footprint();

            let p = space.malloc(threshold).unwrap();
            let mapped = align_size_up(pad_request(threshold) + 6 * WORD + CHUNK_ALIGN_MASK, page_size());
            assert_eq!(space.footprint(), before + mapped);
            assert_eq!(space.mem_info().mapped_space, mapped);

            // calloc skips clearing fresh mappings
            let z = space.calloc(threshold, 1).unwrap();
            assert!(unsafe { core::slice::from_raw_parts(z.as_ptr(), threshold) }.iter().all(|&b| b == 0));

            unsafe {
                space.free(p.as_ptr()).unwrap();
                space.free(z.as_ptr()).unwrap();
            }
            assert_eq!(space.footprint(), before);

            // small blocks stay for reuse
            let small = space.malloc(1000).unwrap();
            let grown = space.footprint();
            unsafe { space.free(small.as_ptr()).unwrap() };
            assert_eq!(space.footprint(), grown);
        }

        #[test]
        fn tracked_large_chunks_live_in_segments() {
            let space = MmapSpace::create(0, Mmap).unwrap();
            assert!(!space.track_large_chunks(true));

            let p = space.malloc(1 << 20).unwrap();
            assert!(space.mem_info().mapped_space < 1 << 20);

            let mut found = false;
            space.inspect_all(|start, _, used| found |= start == p.as_ptr() && used >= 1 << 20);
            assert!(found);

            // released along with the segments
            let footprint = space.footprint();
            assert_eq!(space.destroy(), Ok(footprint));
        }

        #[test]
        fn grows_across_segments() {
            let space = MmapSpace::create(0, Mmap).unwrap();
            let baseline = space.footprint();

            let ptrs: std::vec::Vec<_> = (0..200).map(|_| space.malloc(10_000).unwrap()).collect();
            assert!(space.footprint() >= 200 * 10_000);

            for p in ptrs {
                unsafe { space.free(p.as_ptr()).unwrap() };
            }
            assert!(space.trim(0));
            space.lock().scan_for_errors();

            // mappings placed below, above or apart from the first all go back
            assert_eq!(space.footprint(), baseline);
            assert_eq!(space.mem_info().free_chunks, 1);
            assert_eq!(space.destroy(), Ok(baseline));
        }

        #[test]
        fn trim_releases_prepended_and_added_segments() {
            let space = MmapSpace::create(0, Mmap).unwrap();
            let baseline = space.footprint();

            // interleave a second space so that some mappings are not adjacent
            let other = MmapSpace::create(0, Mmap).unwrap();
            let mut mine = std::vec::Vec::new();
            let mut theirs = std::vec::Vec::new();
            for i in 0..100 {
                mine.push(space.malloc(20_000).unwrap());
                if i % 3 == 0 {
                    theirs.push(other.malloc(30_000).unwrap());
                }
            }

            // free out of order, trimming in between
            for (i, p) in mine.iter().enumerate().rev() {
                unsafe { space.free(p.as_ptr()).unwrap() };
                if i % 17 == 0 {
                    space.trim(0);
                }
            }
            space.trim(0);
            space.lock().scan_for_errors();
            assert_eq!(space.footprint(), baseline);

            let p = space.malloc(50_000).unwrap();
            unsafe { p.as_ptr().write_bytes(7, 50_000) };
            unsafe { space.free(p.as_ptr()).unwrap() };

            for p in theirs {
                unsafe { other.free(p.as_ptr()).unwrap() };
            }
            other.trim(0);
            assert_eq!(other.footprint(), baseline);
        }

        #[test]
        fn reset_space_keeps_serving() {
            let space = MmapSpace::create(0, Mmap).unwrap();
            space.set_error_policy(ErrorPolicy::LENIENT);
            let granularity = space.lock().tuning().granularity;

            let a = space.malloc(64).unwrap();
            let _g = space.malloc(8).unwrap();
            let b = space.malloc(64).unwrap();
            let _g = space.malloc(8).unwrap();

            unsafe {
                space.free(a.as_ptr()).unwrap();
                space.free(b.as_ptr()).unwrap();
                (*Chunk::from_mem(b.as_ptr())).fd = Chunk::from_mem(b.as_ptr());
            }

            assert!(space.malloc(64).is_err());
            assert_eq!(space.lock().reset_count(), 1);

            let p = space.malloc(64).unwrap();
            unsafe { p.as_ptr().write_bytes(1, 64) };
            space.lock().scan_for_errors();

            // the segment holding the space was forgotten along with the rest
            assert_eq!(space.destroy(), Ok(granularity));
        }

        #[test]
        fn set_param_per_space() {
            let space = MmapSpace::create(0, Mmap).unwrap();
            space.set_param(Param::MmapThreshold, -1).unwrap();
            assert_eq!(space.lock().tuning().mmap_threshold, usize::MAX);

            let p = space.malloc(1 << 20).unwrap();
            assert!(space.mem_info().mapped_space < 1 << 20);
            unsafe { space.free(p.as_ptr()).unwrap() };

            assert!(space.set_param(Param::Granularity, 3).is_err());
            assert!(space.stats().system_bytes >= 1 << 20);
        }
    }
}
