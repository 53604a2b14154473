use core::ptr::{null_mut, NonNull};

use allocator_api2::alloc::{AllocError, Allocator, GlobalAlloc, Layout};

use super::{PthreadMutex, Space};
use crate::{error::HeapError, source::Mmap};

/// A space created on first use, suitable as the `#[global_allocator]`.
///
/// Creation maps one granularity unit through [`Mmap`] and is retried on later
/// calls if it fails. Everything else behaves like the [`Space`] returned by
/// [`DefaultSpace::get`].
///
/// A logger installed for the `log` crate must not allocate through this space
/// while it is being created.
///
/// # Example
/// ```rust,no_run
/// #[global_allocator]
/// static ALLOCATOR: segheap::DefaultSpace = segheap::DefaultSpace::new();
///
/// let v = vec![1, 2, 3];
/// assert!(ALLOCATOR.get().unwrap().footprint() > 0);
/// ```
pub struct DefaultSpace {
    space: spin::Once<Space<PthreadMutex, Mmap>>,
}

impl core::fmt::Debug for DefaultSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DefaultSpace").field("space", &self.space.get()).finish()
    }
}

impl Default for DefaultSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl DefaultSpace {
    /// Create a new [`DefaultSpace`]. The space itself is created on first use.
    pub const fn new() -> Self {
        Self { space: spin::Once::new() }
    }

    /// Returns the space, creating it if this is the first use.
    pub fn get(&self) -> Result<&Space<PthreadMutex, Mmap>, HeapError> {
        self.space.try_call_once(|| Space::create(0, Mmap))
    }

    /// See [`Space::malloc`].
    pub fn malloc(&self, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        self.get()?.malloc(bytes)
    }

    /// See [`Space::calloc`].
    pub fn calloc(&self, count: usize, size: usize) -> Result<NonNull<u8>, HeapError> {
        self.get()?.calloc(count, size)
    }

    /// See [`Space::memalign`].
    pub fn memalign(&self, alignment: usize, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        self.get()?.memalign(alignment, bytes)
    }

    /// See [`Space::free`].
    ///
    /// # Safety
    /// `mem` must be null or a live allocation of this space.
    pub unsafe fn free(&self, mem: *mut u8) -> Result<(), HeapError> {
        match self.space.get() {
            Some(space) => space.free(mem),
            None if mem.is_null() => Ok(()),
            None => Err(HeapError::usage(mem)),
        }
    }

    /// See [`Space::realloc`].
    ///
    /// # Safety
    /// `mem` must be null or a live allocation of this space.
    pub unsafe fn realloc(&self, mem: *mut u8, bytes: usize) -> Result<NonNull<u8>, HeapError> {
        self.get()?.realloc(mem, bytes)
    }

    /// See [`Space::trim`].
    pub fn trim(&self, pad: usize) -> bool {
        self.space.get().is_some_and(|space| space.trim(pad))
    }
}

unsafe impl GlobalAlloc for DefaultSpace {
    #[inline]
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.get().map_or(null_mut(), |space| space.alloc(layout))
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.get().map_or(null_mut(), |space| space.alloc_zeroed(layout))
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(space) = self.space.get() {
            space.dealloc(ptr, layout)
        }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        self.get().map_or(null_mut(), |space| GlobalAlloc::realloc(space, ptr, layout, new_size))
    }
}

unsafe impl Allocator for DefaultSpace {
    #[inline]
    fn allocate(&self, layout: Layout) -> Result<NonNull<[u8]>, AllocError> {
        self.get().map_err(|_| AllocError)?.allocate(layout)
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if let Some(space) = self.space.get() {
            space.deallocate(ptr, layout)
        }
    }

    #[inline]
    unsafe fn grow(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.get().map_err(|_| AllocError)?.grow(ptr, old_layout, new_layout)
    }

    #[inline]
    unsafe fn grow_zeroed(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.get().map_err(|_| AllocError)?.grow_zeroed(ptr, old_layout, new_layout)
    }

    #[inline]
    unsafe fn shrink(
        &self,
        ptr: NonNull<u8>,
        old_layout: Layout,
        new_layout: Layout,
    ) -> Result<NonNull<[u8]>, AllocError> {
        self.get().map_err(|_| AllocError)?.shrink(ptr, old_layout, new_layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn created_lazily() {
        let default = DefaultSpace::new();
        assert!(default.space.get().is_none());
        assert!(!default.trim(0));
        assert_eq!(unsafe { default.free(null_mut()) }, Ok(()));

        let p = default.malloc(1000).unwrap();
        let space = default.get().unwrap();
        assert!(core::ptr::eq(space, default.get().unwrap()));

        let p = unsafe { default.realloc(p.as_ptr(), 5000) }.unwrap();
        unsafe { default.free(p.as_ptr()).unwrap() };

        let z = default.calloc(10, 10).unwrap();
        assert!(unsafe { core::slice::from_raw_parts(z.as_ptr(), 100) }.iter().all(|&b| b == 0));
        unsafe { default.free(z.as_ptr()).unwrap() };
    }

    #[test]
    fn as_allocator() {
        static DEFAULT: DefaultSpace = DefaultSpace::new();

        let mut v = allocator_api2::vec::Vec::new_in(&DEFAULT);
        v.extend(0..10_000u64);
        assert_eq!(v.iter().sum::<u64>(), 10_000 * 9_999 / 2);
        drop(v);

        let a = DEFAULT.memalign(4096, 10).unwrap();
        assert_eq!(a.as_ptr() as usize % 4096, 0);
        unsafe { DEFAULT.free(a.as_ptr()).unwrap() };

        let layout = Layout::from_size_align(64, 64).unwrap();
        unsafe {
            let p = GlobalAlloc::alloc(&DEFAULT, layout);
            assert!(!p.is_null());
            GlobalAlloc::dealloc(&DEFAULT, p, layout);
        }
    }
}
