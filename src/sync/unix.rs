use core::cell::UnsafeCell;

static mut GLOBAL_PTHREAD_MUTEX: libc::pthread_mutex_t = libc::PTHREAD_MUTEX_INITIALIZER;

static GLOBAL: lock_api::Mutex<GlobalLock, ()> = lock_api::Mutex::const_new(GlobalLock, ());

/// Runs `f` while holding the process-wide lock that serializes moving the program break.
pub(crate) fn with_global_lock<T>(f: impl FnOnce() -> T) -> T {
    let _guard = GLOBAL.lock();
    f()
}

/// The process-wide lock held around calls that move the program break,
/// which is shared by every space using [`Sbrk`](crate::Sbrk).
pub struct GlobalLock;

unsafe impl lock_api::RawMutex for GlobalLock {
    const INIT: Self = Self;

    type GuardMarker = lock_api::GuardNoSend;

    #[inline]
    fn lock(&self) {
        unsafe {
            libc::pthread_mutex_lock(core::ptr::addr_of_mut!(GLOBAL_PTHREAD_MUTEX));
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        unsafe { libc::pthread_mutex_trylock(core::ptr::addr_of_mut!(GLOBAL_PTHREAD_MUTEX)) == 0 }
    }

    #[inline]
    unsafe fn unlock(&self) {
        libc::pthread_mutex_unlock(core::ptr::addr_of_mut!(GLOBAL_PTHREAD_MUTEX));
    }
}

impl GlobalLock {
    /// Allows the global lock to remain usable in the child process after a call to `fork(2)`
    ///
    /// It's instead recommended to immediately call `exec*` after `fork` in the child
    /// process, in which case you shouldn't need this. Spaces locked with a
    /// [`PthreadMutex`] need [`PthreadMutex::reinit_after_fork`] as well.
    pub fn enable_child_alloc_after_fork() {
        // atfork must only be called once, to avoid a deadlock,
        // where the handler attempts to acquire the global lock twice
        static FORK_PROTECTED: core::sync::atomic::AtomicBool =
            core::sync::atomic::AtomicBool::new(false);

        unsafe extern "C" fn lock_mutex() {
            libc::pthread_mutex_lock(core::ptr::addr_of_mut!(GLOBAL_PTHREAD_MUTEX));
        }

        unsafe extern "C" fn unlock_mutex() {
            libc::pthread_mutex_unlock(core::ptr::addr_of_mut!(GLOBAL_PTHREAD_MUTEX));
        }

        if !FORK_PROTECTED.swap(true, core::sync::atomic::Ordering::AcqRel) {
            // acquired before forking, released in both parent and child afterwards
            let result =
                unsafe { libc::pthread_atfork(Some(lock_mutex), Some(unlock_mutex), Some(unlock_mutex)) };

            debug_assert_eq!(result, 0);
        }
    }
}

/// A lock backed by a `pthread_mutex_t`.
///
/// The mutex lives inside the space's first segment and must not be moved
/// while in use, which [`Space`](crate::Space) guarantees.
pub struct PthreadMutex(UnsafeCell<libc::pthread_mutex_t>);

unsafe impl Send for PthreadMutex {}
unsafe impl Sync for PthreadMutex {}

impl core::fmt::Debug for PthreadMutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("PthreadMutex")
    }
}

unsafe impl lock_api::RawMutex for PthreadMutex {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));

    type GuardMarker = lock_api::GuardNoSend;

    #[inline]
    fn lock(&self) {
        unsafe {
            libc::pthread_mutex_lock(self.0.get());
        }
    }

    #[inline]
    fn try_lock(&self) -> bool {
        unsafe { libc::pthread_mutex_trylock(self.0.get()) == 0 }
    }

    #[inline]
    unsafe fn unlock(&self) {
        libc::pthread_mutex_unlock(self.0.get());
    }
}

impl PthreadMutex {
    /// Puts the mutex back into its initial, unlocked state.
    ///
    /// # Safety
    /// Only to be called in a freshly forked child, before any other use of
    /// the space, when the parent may have held the lock during `fork(2)`.
    pub unsafe fn reinit_after_fork(&self) {
        self.0.get().write(libc::PTHREAD_MUTEX_INITIALIZER);
    }
}

impl Drop for PthreadMutex {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_mutex_destroy(self.0.get());
        }
    }
}
