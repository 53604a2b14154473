//! Exact-size bins for chunks below [`MIN_LARGE_SIZE`], and the dispatch
//! between them and the tree bins.
//!
//! Each bin is a circular doubly linked list threaded through the free chunks
//! themselves. The bin array only holds the most recently inserted chunk, so
//! the heap contains no pointers to itself and can be moved freely.

use core::ptr::null_mut;

use super::*;

impl<S: Source> Heap<S> {
    pub(super) unsafe fn insert_chunk(&mut self, p: *mut Chunk, size: usize) -> Result<(), HeapError> {
        if is_small(size) {
            self.insert_small_chunk(p, size)
        } else {
            self.insert_large_chunk(p.cast(), size)
        }
    }

    pub(super) unsafe fn unlink_chunk(&mut self, p: *mut Chunk, size: usize) -> Result<(), HeapError> {
        if is_small(size) {
            self.unlink_small_chunk(p, size)
        } else {
            self.unlink_large_chunk(p.cast())
        }
    }

    unsafe fn insert_small_chunk(&mut self, p: *mut Chunk, size: usize) -> Result<(), HeapError> {
        debug_assert!(size >= MIN_CHUNK_SIZE);

        let idx = small_index(size);
        let head = self.smallbins[idx as usize];

        if head.is_null() {
            self.smallmap.set_bit(idx);
            (*p).fd = p;
            (*p).bk = p;
        } else {
            if !self.ok_address(head) {
                return Err(HeapError::corruption(head));
            }

            let tail = (*head).bk;
            (*p).fd = head;
            (*p).bk = tail;
            (*tail).fd = p;
            (*head).bk = p;
        }

        self.smallbins[idx as usize] = p;
        Ok(())
    }

    unsafe fn unlink_small_chunk(&mut self, p: *mut Chunk, size: usize) -> Result<(), HeapError> {
        let idx = small_index(size);
        let f = (*p).fd;
        let b = (*p).bk;

        if f == p {
            if b != p || self.smallbins[idx as usize] != p {
                return Err(HeapError::corruption(p));
            }

            self.smallbins[idx as usize] = null_mut();
            self.smallmap.clear_bit(idx);
        } else {
            if !self.ok_address(f) || (*f).bk != p || !self.ok_address(b) || (*b).fd != p {
                return Err(HeapError::corruption(p));
            }

            (*f).bk = b;
            (*b).fd = f;

            if self.smallbins[idx as usize] == p {
                self.smallbins[idx as usize] = f;
            }
        }

        Ok(())
    }

    /// Removes the most recently inserted chunk of small bin `idx`, which must not be empty.
    pub(super) unsafe fn unlink_first_small_chunk(&mut self, idx: u32) -> Result<*mut Chunk, HeapError> {
        let p = self.smallbins[idx as usize];
        debug_assert!(!p.is_null());

        let size = Chunk::size(p);
        if size != small_index_to_size(idx) {
            return Err(HeapError::corruption(p));
        }

        self.unlink_small_chunk(p, size)?;
        Ok(p)
    }
}
