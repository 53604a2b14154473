//! Bitwise tries of free chunks at or above [`MIN_LARGE_SIZE`].
//!
//! Each tree bin holds one size class. Within a bin, a node's children are
//! chosen by successive size bits below the ones the class already fixes,
//! so every subtree holds a contiguous range of sizes. Chunks of a size
//! already present in the trie hang off that node in a circular list, with
//! a null `parent` and no children. The root of a bin has a null `parent`
//! as well and is told apart by being the bin's head.

use core::ptr::null_mut;

use super::*;

impl<S: Source> Heap<S> {
    pub(super) unsafe fn insert_large_chunk(
        &mut self,
        x: *mut TreeChunk,
        size: usize,
    ) -> Result<(), HeapError> {
        let idx = compute_tree_index(size);

        (*x).index = idx;
        (*x).child = [null_mut(); 2];

        if !self.treemap.read_bit(idx) {
            self.treemap.set_bit(idx);
            self.treebins[idx as usize] = x;
            (*x).parent = null_mut();
            (*x).chunk.fd = x.cast();
            (*x).chunk.bk = x.cast();
            return Ok(());
        }

        let mut t = self.treebins[idx as usize];
        let mut k = size << leftshift_for_tree_index(idx);

        loop {
            if TreeChunk::size(t) != size {
                let dir = k >> (usize::BITS - 1);
                let c = (*t).child[dir];
                k <<= 1;

                if !c.is_null() {
                    t = c;
                } else if self.ok_address(t) {
                    (*t).child[dir] = x;
                    (*x).parent = t;
                    (*x).chunk.fd = x.cast();
                    (*x).chunk.bk = x.cast();
                    return Ok(());
                } else {
                    return Err(HeapError::corruption(t));
                }
            } else {
                let f = TreeChunk::next(t);

                if !self.ok_address(t) || !self.ok_address(f) {
                    return Err(HeapError::corruption(t));
                }

                // join the chain of equal sized chunks right after the node
                (*t).chunk.fd = x.cast();
                (*f).chunk.bk = x.cast();
                (*x).chunk.fd = f.cast();
                (*x).chunk.bk = t.cast();
                (*x).parent = null_mut();
                return Ok(());
            }
        }
    }

    #[inline]
    fn is_tree_root(&self, x: *mut TreeChunk, idx: u32) -> bool {
        self.treebins[idx as usize] == x
    }

    pub(super) unsafe fn unlink_large_chunk(&mut self, x: *mut TreeChunk) -> Result<(), HeapError> {
        let xp = (*x).parent;
        let idx = (*x).index;
        let is_root = self.is_tree_root(x, idx);
        let mut r: *mut TreeChunk;

        if TreeChunk::prev(x) != x {
            let f = TreeChunk::next(x);
            r = TreeChunk::prev(x);

            if !self.ok_address(f) || (*f).chunk.bk != x.cast() || (*r).chunk.fd != x.cast() {
                return Err(HeapError::corruption(x));
            }

            // a chain member takes the place of a tree node below, validate first
            if (!xp.is_null() || is_root) && !self.ok_address(r) {
                return Err(HeapError::corruption(r));
            }

            (*f).chunk.bk = r.cast();
            (*r).chunk.fd = f.cast();
        } else {
            // the rightmost-then-leftmost leaf under x replaces it
            let mut rp: *mut *mut TreeChunk = null_mut();
            r = (*x).child[1];
            if !r.is_null() {
                rp = &mut (*x).child[1];
            } else {
                r = (*x).child[0];
                if !r.is_null() {
                    rp = &mut (*x).child[0];
                }
            }

            if !r.is_null() {
                loop {
                    if !(*r).child[1].is_null() {
                        rp = &mut (*r).child[1];
                    } else if !(*r).child[0].is_null() {
                        rp = &mut (*r).child[0];
                    } else {
                        break;
                    }
                    r = *rp;
                }

                if !self.ok_address(r) {
                    return Err(HeapError::corruption(r));
                }

                *rp = null_mut();
            }
        }

        if xp.is_null() && !is_root {
            // a chain member, no tree links to fix
            return Ok(());
        }

        if is_root {
            self.treebins[idx as usize] = r;
            if r.is_null() {
                self.treemap.clear_bit(idx);
            }
        } else if self.ok_address(xp) {
            if (*xp).child[0] == x {
                (*xp).child[0] = r;
            } else {
                (*xp).child[1] = r;
            }
        } else {
            return Err(HeapError::corruption(xp));
        }

        if !r.is_null() {
            (*r).parent = xp;

            // read after detaching r, which may have been a direct child
            let [c0, c1] = (*x).child;
            if !c0.is_null() {
                (*r).child[0] = c0;
                (*c0).parent = r;
            }
            if !c1.is_null() {
                (*r).child[1] = c1;
                (*c1).parent = r;
            }
        }

        Ok(())
    }

    /// Allocates a small request from the smallest chunk of the smallest
    /// non-empty tree bin, making the remainder the designated victim.
    pub(super) unsafe fn tmalloc_small(&mut self, nb: usize) -> Result<*mut Chunk, HeapError> {
        let idx = match self.treemap.lowest() {
            Some(idx) => idx,
            None => return Err(HeapError::corruption(core::ptr::null::<u8>())),
        };

        let mut t = self.treebins[idx as usize];
        let mut v = t;
        let mut rsize = TreeChunk::size(t) - nb;

        loop {
            t = TreeChunk::leftmost_child(t);
            if t.is_null() {
                break;
            }

            let trem = TreeChunk::size(t) - nb;
            if trem < rsize {
                rsize = trem;
                v = t;
            }
        }

        let v_chunk = v.cast::<Chunk>();
        let r = Chunk::plus_offset(v_chunk, nb);

        if !self.ok_address(v) || r <= v_chunk {
            return Err(HeapError::corruption(v));
        }

        self.unlink_large_chunk(v)?;

        if rsize < MIN_CHUNK_SIZE {
            Chunk::set_inuse_and_pinuse(v_chunk, rsize + nb, self.tag);
        } else {
            Chunk::set_size_and_pinuse_of_inuse_chunk(v_chunk, nb, self.tag);
            Chunk::set_size_and_pinuse_of_free_chunk(r, rsize);
            self.replace_dv(r, rsize)?;
        }

        Ok(v_chunk)
    }

    /// Allocates a large request from the best fitting tree chunk, if it
    /// fits better than the designated victim.
    pub(super) unsafe fn tmalloc_large(&mut self, nb: usize) -> Result<Option<*mut Chunk>, HeapError> {
        let mut v: *mut TreeChunk = null_mut();
        let mut rsize = nb.wrapping_neg();
        let idx = compute_tree_index(nb);
        let mut t = self.treebins[idx as usize];

        if !t.is_null() {
            // descend along the bits of nb, remembering the last right subtree skipped
            let mut sizebits = nb << leftshift_for_tree_index(idx);
            let mut rst: *mut TreeChunk = null_mut();

            loop {
                let trem = TreeChunk::size(t).wrapping_sub(nb);
                if trem < rsize {
                    v = t;
                    rsize = trem;
                    if rsize == 0 {
                        break;
                    }
                }

                let rt = (*t).child[1];
                t = (*t).child[sizebits >> (usize::BITS - 1)];

                if !rt.is_null() && rt != t {
                    rst = rt;
                }

                if t.is_null() {
                    t = rst;
                    break;
                }

                sizebits <<= 1;
            }
        }

        if t.is_null() && v.is_null() {
            if let Some(i) = self.treemap.bit_scan_above(idx) {
                t = self.treebins[i as usize];
            }
        }

        while !t.is_null() {
            let trem = TreeChunk::size(t).wrapping_sub(nb);
            if trem < rsize {
                rsize = trem;
                v = t;
            }
            t = TreeChunk::leftmost_child(t);
        }

        if v.is_null() || rsize >= self.dvsize.wrapping_sub(nb) {
            return Ok(None);
        }

        let v_chunk = v.cast::<Chunk>();
        let r = Chunk::plus_offset(v_chunk, nb);

        if !self.ok_address(v) || r <= v_chunk {
            return Err(HeapError::corruption(v));
        }

        self.unlink_large_chunk(v)?;

        if rsize < MIN_CHUNK_SIZE {
            Chunk::set_inuse_and_pinuse(v_chunk, rsize + nb, self.tag);
        } else {
            Chunk::set_size_and_pinuse_of_inuse_chunk(v_chunk, nb, self.tag);
            Chunk::set_size_and_pinuse_of_free_chunk(r, rsize);
            self.insert_chunk(r, rsize)?;
        }

        Ok(Some(v_chunk))
    }
}
