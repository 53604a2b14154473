//! Process-wide parameters, established once on first use.
//!
//! The page size and the ownership magic never change afterwards.
//! The tunables are defaults copied into every space on creation;
//! [`set_param`] only affects spaces created after the call.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::error::HeapError;

const DEFAULT_GRANULARITY: usize = 64 << 10;
const DEFAULT_TRIM_THRESHOLD: usize = 2 << 20;
const DEFAULT_MMAP_THRESHOLD: usize = 256 << 10;
const FALLBACK_PAGE_SIZE: usize = 4096;

/// A tunable, see [`set_param`] and [`Space::set_param`](crate::Space::set_param).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Param {
    /// Free space in the top chunk beyond which the space returns memory to the system.
    TrimThreshold,
    /// Unit by which the space acquires and releases memory. Must be a
    /// power of two no smaller than the page size.
    Granularity,
    /// Request size at or above which a dedicated mapping is used.
    MmapThreshold,
}

/// The tunables of one space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tuning {
    pub granularity: usize,
    pub trim_threshold: usize,
    pub mmap_threshold: usize,
}

impl Tuning {
    /// Applies `value` to `param`, where `-1` stands for the maximum.
    pub(crate) fn set(&mut self, param: Param, value: isize) -> Result<(), HeapError> {
        let val = if value == -1 { usize::MAX } else { value as usize };

        match param {
            Param::TrimThreshold => self.trim_threshold = val,
            Param::MmapThreshold => self.mmap_threshold = val,
            Param::Granularity => {
                if val < page_size() || !val.is_power_of_two() {
                    return Err(HeapError::InvalidParam { param, value });
                }
                self.granularity = val;
            }
        }

        Ok(())
    }

    /// Rounds `size` up to a multiple of the granularity, wrapping on overflow.
    #[inline]
    pub(crate) fn granularity_align(&self, size: usize) -> usize {
        crate::ptr_utils::align_size_up(size, self.granularity)
    }
}

#[derive(Debug)]
pub(crate) struct Params {
    pub page_size: usize,
    pub magic: usize,
    granularity: AtomicUsize,
    trim_threshold: AtomicUsize,
    mmap_threshold: AtomicUsize,
}

static PARAMS: spin::Once<Params> = spin::Once::new();

/// The process-wide parameters, initializing them if necessary.
#[inline]
pub(crate) fn params() -> &'static Params {
    PARAMS.call_once(Params::init)
}

impl Params {
    fn init() -> Self {
        let page_size = system_page_size();
        let magic = (random_word() | 8) & !7;

        log::debug!("segheap: page size {:#x}", page_size);

        Self {
            page_size,
            magic,
            granularity: AtomicUsize::new(DEFAULT_GRANULARITY.max(page_size)),
            trim_threshold: AtomicUsize::new(DEFAULT_TRIM_THRESHOLD),
            mmap_threshold: AtomicUsize::new(DEFAULT_MMAP_THRESHOLD),
        }
    }

    pub fn tuning(&self) -> Tuning {
        Tuning {
            granularity: self.granularity.load(Ordering::Relaxed),
            trim_threshold: self.trim_threshold.load(Ordering::Relaxed),
            mmap_threshold: self.mmap_threshold.load(Ordering::Relaxed),
        }
    }
}

/// The system page size.
pub fn page_size() -> usize {
    params().page_size
}

/// The tunables new spaces start out with.
pub fn default_tuning() -> Tuning {
    params().tuning()
}

/// Changes the tunables used by spaces created from now on.
///
/// A `value` of `-1` means the maximum. Existing spaces are unaffected.
pub fn set_param(param: Param, value: isize) -> Result<(), HeapError> {
    let p = params();
    let mut tuning = p.tuning();
    tuning.set(param, value)?;

    p.granularity.store(tuning.granularity, Ordering::Relaxed);
    p.trim_threshold.store(tuning.trim_threshold, Ordering::Relaxed);
    p.mmap_threshold.store(tuning.mmap_threshold, Ordering::Relaxed);
    Ok(())
}

#[cfg(all(feature = "system-backed", unix))]
fn system_page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if size > 0 && (size as usize).is_power_of_two() { size as usize } else { FALLBACK_PAGE_SIZE }
}

#[cfg(not(all(feature = "system-backed", unix)))]
fn system_page_size() -> usize {
    FALLBACK_PAGE_SIZE
}

#[cfg(all(feature = "system-backed", unix))]
fn random_word() -> usize {
    let mut buf = [0u8; core::mem::size_of::<usize>()];

    unsafe {
        let fd = libc::open(b"/dev/urandom\0".as_ptr().cast(), libc::O_RDONLY);

        if fd >= 0 {
            let read = libc::read(fd, buf.as_mut_ptr().cast(), buf.len());
            libc::close(fd);

            if read == buf.len() as isize {
                return usize::from_ne_bytes(buf);
            }
        }

        libc::time(core::ptr::null_mut()) as usize ^ 0x5555_5555
    }
}

#[cfg(not(all(feature = "system-backed", unix)))]
fn random_word() -> usize {
    static SEED: u8 = 0;
    core::ptr::addr_of!(SEED) as usize ^ 0x5555_5555
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialized_once() {
        let a = params();
        let b = params();

        assert!(core::ptr::eq(a, b));
        assert!(a.page_size.is_power_of_two());
        assert_eq!(a.magic & 7, 0);
        assert_ne!(a.magic, 0);
    }

    #[test]
    fn tuning_validation() {
        let mut tuning = default_tuning();
        assert!(tuning.granularity >= page_size());

        assert!(tuning.set(Param::Granularity, 3 * page_size() as isize).is_err());
        assert!(tuning.set(Param::Granularity, (page_size() / 2) as isize).is_err());
        tuning.set(Param::Granularity, (page_size() * 4) as isize).unwrap();
        assert_eq!(tuning.granularity, page_size() * 4);

        tuning.set(Param::TrimThreshold, -1).unwrap();
        assert_eq!(tuning.trim_threshold, usize::MAX);
        tuning.set(Param::MmapThreshold, 1 << 20).unwrap();
        assert_eq!(tuning.mmap_threshold, 1 << 20);

        assert_eq!(tuning.granularity_align(1), tuning.granularity);
        assert_eq!(tuning.granularity_align(0), 0);
    }

    #[test]
    fn process_defaults() {
        let err = set_param(Param::Granularity, 12345).unwrap_err();
        assert_eq!(err, HeapError::InvalidParam { param: Param::Granularity, value: 12345 });

        // rewriting the current value keeps other tests unaffected
        let current = default_tuning();
        set_param(Param::TrimThreshold, current.trim_threshold as isize).unwrap();
        assert_eq!(default_tuning(), current);
    }
}
