use core::ptr::NonNull;

use super::Source;

/// Obtains memory through anonymous private mappings.
///
/// Every segment and every large chunk is a mapping of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Mmap;

unsafe fn mmap(size: usize) -> Option<NonNull<u8>> {
    let x = libc::mmap(
        core::ptr::null_mut(),
        size,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
        -1,
        0,
    );

    if x == libc::MAP_FAILED {
        log::debug!("segheap: mmap of {:#x} bytes failed", size);
        return None;
    }

    log::trace!("segheap: mapped {:p}..{:p}", x, x.cast::<u8>().wrapping_add(size));
    NonNull::new(x.cast())
}

unsafe fn munmap(base: NonNull<u8>, size: usize) -> bool {
    let result = libc::munmap(base.as_ptr().cast(), size);

    log::trace!("segheap: unmapped {:p}..{:p}", base, base.as_ptr().wrapping_add(size));
    result == 0
}

#[cfg(target_os = "linux")]
unsafe fn mremap(
    base: NonNull<u8>,
    old_size: usize,
    new_size: usize,
    may_move: bool,
) -> Option<NonNull<u8>> {
    let flags = if may_move { libc::MREMAP_MAYMOVE } else { 0 };
    let x = libc::mremap(base.as_ptr().cast(), old_size, new_size, flags);

    if x == libc::MAP_FAILED {
        return None;
    }

    log::trace!("segheap: remapped {:p}+{:#x} to {:p}+{:#x}", base, old_size, x, new_size);
    NonNull::new(x.cast())
}

#[cfg(not(target_os = "linux"))]
unsafe fn mremap(
    _base: NonNull<u8>,
    _old_size: usize,
    _new_size: usize,
    _may_move: bool,
) -> Option<NonNull<u8>> {
    None
}

unsafe impl Source for Mmap {
    const MAP_CLEARS: bool = true;

    #[inline]
    fn map(&mut self, size: usize) -> Option<NonNull<u8>> {
        unsafe { mmap(size) }
    }

    #[inline]
    unsafe fn unmap(&mut self, base: NonNull<u8>, size: usize) -> bool {
        munmap(base, size)
    }

    #[inline]
    unsafe fn remap(
        &mut self,
        base: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        may_move: bool,
    ) -> Option<NonNull<u8>> {
        mremap(base, old_size, new_size, may_move)
    }
}

/// Grows contiguously through `sbrk(2)`, falling back to mappings.
///
/// The program break is shared by the whole process, so every call moving
/// it holds the global lock, see [`GlobalLock`](crate::sync::GlobalLock).
/// Nothing else in the process may move the break concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sbrk;

unsafe impl Source for Sbrk {
    const MAP_CLEARS: bool = true;
    const HAS_MORECORE: bool = true;

    #[inline]
    fn map(&mut self, size: usize) -> Option<NonNull<u8>> {
        unsafe { mmap(size) }
    }

    #[inline]
    unsafe fn unmap(&mut self, base: NonNull<u8>, size: usize) -> bool {
        munmap(base, size)
    }

    #[inline]
    unsafe fn remap(
        &mut self,
        base: NonNull<u8>,
        old_size: usize,
        new_size: usize,
        may_move: bool,
    ) -> Option<NonNull<u8>> {
        mremap(base, old_size, new_size, may_move)
    }

    unsafe fn morecore(&mut self, increment: isize) -> Option<NonNull<u8>> {
        let old_brk = libc::sbrk(increment as libc::intptr_t);

        if old_brk as isize == -1 {
            log::debug!("segheap: sbrk({}) failed", increment);
            return None;
        }

        if increment != 0 {
            log::trace!("segheap: moved break from {:p} by {}", old_brk, increment);
        }

        NonNull::new(old_brk.cast())
    }

    fn with_global_lock<T>(&mut self, f: impl FnOnce(&mut Self) -> T) -> T {
        crate::sync::unix::with_global_lock(|| f(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_write_unmap() {
        let size = crate::params::page_size() * 3;
        let mut src = Mmap;

        let base = src.map(size).unwrap();
        assert!(crate::ptr_utils::is_aligned_to(base.as_ptr(), crate::params::page_size()));

        unsafe {
            // mappings arrive zeroed
            assert!(core::slice::from_raw_parts(base.as_ptr(), size).iter().all(|&b| b == 0));
            base.as_ptr().write_bytes(0xAB, size);

            // give back the tail only
            let page = crate::params::page_size();
            assert!(src.unmap(NonNull::new_unchecked(base.as_ptr().add(page * 2)), page));
            assert!(src.unmap(base, page * 2));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn remap_in_place_shrinks() {
        let page = crate::params::page_size();
        let mut src = Mmap;

        let base = src.map(page * 4).unwrap();
        unsafe {
            let shrunk = src.remap(base, page * 4, page * 2, false).unwrap();
            assert_eq!(shrunk, base);
            assert!(src.unmap(base, page * 2));
        }
    }
}
