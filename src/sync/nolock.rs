use core::cell::Cell;

/// A lock for spaces that are only ever used from one thread.
///
/// `NoLock` is not [`Sync`], so a space using it cannot be shared between threads
/// and locking costs nothing. Locking twice at once, for example from inside a
/// [`Heap::inspect_all`](crate::Heap::inspect_all) visitor, is detected when
/// debug assertions are enabled.
#[derive(Debug)]
pub struct NoLock {
    locked: Cell<bool>,
}

unsafe impl lock_api::RawMutex for NoLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self { locked: Cell::new(false) };

    type GuardMarker = lock_api::GuardNoSend;

    #[inline]
    fn lock(&self) {
        let was_locked = self.locked.replace(true);
        debug_assert!(!was_locked, "NoLock space locked twice");
    }

    #[inline]
    fn try_lock(&self) -> bool {
        !self.locked.replace(true)
    }

    #[inline]
    unsafe fn unlock(&self) {
        self.locked.set(false);
    }

    #[inline]
    fn is_locked(&self) -> bool {
        self.locked.get()
    }
}

#[cfg(test)]
mod tests {
    use lock_api::RawMutex;

    use super::*;

    #[test]
    fn try_lock_reports_held() {
        let lock = NoLock::INIT;

        assert!(lock.try_lock());
        assert!(lock.is_locked());
        assert!(!lock.try_lock());

        unsafe { lock.unlock() };
        assert!(!lock.is_locked());
        lock.lock();
        unsafe { lock.unlock() };
    }
}
