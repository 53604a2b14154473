//! Reporting on the state of a heap: summaries, chunk traversal,
//! consistency checking, and the reset applied after corruption.

use core::fmt::Display;

use super::*;

/// A summary of a space's memory, as reported by [`Heap::mem_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MemInfo {
    /// Bytes in segments, excluding dedicated mappings.
    pub arena: usize,
    /// Number of free chunks, the top chunk included.
    pub free_chunks: usize,
    /// Bytes in dedicated mappings.
    pub mapped_space: usize,
    /// The highest footprint reached.
    pub max_total_allocated: usize,
    /// Bytes in in-use chunks, overhead included.
    pub total_allocated: usize,
    /// Bytes in free chunks.
    pub total_free: usize,
    /// Bytes that could be released by trimming, at most.
    pub keep_cost: usize,
}

impl Display for MemInfo {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "arena:          {:>12}", self.arena)?;
        writeln!(f, "free chunks:    {:>12}", self.free_chunks)?;
        writeln!(f, "mapped space:   {:>12}", self.mapped_space)?;
        writeln!(f, "max allocated:  {:>12}", self.max_total_allocated)?;
        writeln!(f, "allocated:      {:>12}", self.total_allocated)?;
        writeln!(f, "free:           {:>12}", self.total_free)?;
        write!(f, "keep cost:      {:>12}", self.keep_cost)
    }
}

/// System-level totals, as reported by [`Heap::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Stats {
    pub max_system_bytes: usize,
    pub system_bytes: usize,
    pub in_use_bytes: usize,
}

impl Display for Stats {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "max system bytes = {:>10}", self.max_system_bytes)?;
        writeln!(f, "system bytes     = {:>10}", self.system_bytes)?;
        write!(f, "in use bytes     = {:>10}", self.in_use_bytes)
    }
}

impl<S: Source> Heap<S> {
    /// Calls `f` on every chunk in the segments, in address order within each segment.
    ///
    /// Receives the start and end of the usable region and the number of bytes in use,
    /// which is zero for free chunks. Regions consisting only of bookkeeping are skipped.
    /// Chunks in dedicated mappings are not visited, see [`Heap::track_large_chunks`].
    pub fn inspect_all(&self, mut f: impl FnMut(*mut u8, *mut u8, usize)) {
        if !self.is_initialized() {
            return;
        }

        for seg in self.segments() {
            let mut q = Chunk::align_as_chunk(seg.base);

            unsafe {
                while seg.holds(q as *const u8) && (*q).head != FENCEPOST_HEAD {
                    let next = Chunk::next(q);
                    let size = Chunk::size(q);

                    let (start, used) = if Chunk::is_inuse(q) {
                        (Chunk::to_mem(q), size - CHUNK_OVERHEAD)
                    } else if is_small(size) {
                        (q.cast::<u8>().wrapping_add(core::mem::size_of::<Chunk>()), 0)
                    } else {
                        (q.cast::<u8>().wrapping_add(core::mem::size_of::<TreeChunk>()), 0)
                    };

                    if start < next.cast() {
                        f(start, next.cast(), used);
                    }

                    if q == self.top {
                        break;
                    }
                    q = next;
                }
            }
        }
    }

    /// Summarizes the memory of this space by walking all segments.
    pub fn mem_info(&self) -> MemInfo {
        if !self.is_initialized() {
            return MemInfo::default();
        }

        let mut free_chunks = 1;
        let mut total_free = self.topsize + TOP_FOOT_SIZE;
        let mut arena = total_free;

        self.walk_segment_chunks(|q, size| {
            arena += size;
            if unsafe { !Chunk::is_inuse(q) } {
                total_free += size;
                free_chunks += 1;
            }
        });

        MemInfo {
            arena,
            free_chunks,
            mapped_space: self.footprint - arena,
            max_total_allocated: self.max_footprint,
            total_allocated: self.footprint - total_free,
            total_free,
            keep_cost: self.topsize,
        }
    }

    /// Reports how much memory was obtained and how much of it is in use.
    pub fn stats(&self) -> Stats {
        if !self.is_initialized() {
            return Stats::default();
        }

        let mut in_use = self.footprint - (self.topsize + TOP_FOOT_SIZE);
        self.walk_segment_chunks(|q, size| {
            if unsafe { !Chunk::is_inuse(q) } {
                in_use -= size;
            }
        });

        Stats {
            max_system_bytes: self.max_footprint,
            system_bytes: self.footprint,
            in_use_bytes: in_use,
        }
    }

    /// Visits every chunk in the segments except the top chunk and fence posts.
    fn walk_segment_chunks(&self, mut f: impl FnMut(*mut Chunk, usize)) {
        for seg in self.segments() {
            let mut q = Chunk::align_as_chunk(seg.base);

            unsafe {
                while seg.holds(q as *const u8) && q != self.top && (*q).head != FENCEPOST_HEAD {
                    let size = Chunk::size(q);
                    f(q, size);
                    q = Chunk::next(q);
                }
            }
        }
    }

    /// Forgets all segments and free chunks, leaving an empty heap that
    /// obtains fresh memory on the next allocation. The forgotten segments,
    /// the one holding the space included, are never released.
    #[cold]
    pub(super) fn reset_on_error(&mut self) {
        self.reset_count += 1;

        self.smallmap = BinMap::EMPTY;
        self.treemap = BinMap::EMPTY;
        self.smallbins = [null_mut(); NSMALLBINS];
        self.treebins = [null_mut(); NTREEBINS];
        self.dvsize = 0;
        self.topsize = 0;
        self.dv = null_mut();
        self.top = null_mut();
        self.seg = Segment::EMPTY;
    }

    #[cfg(not(any(test, feature = "error-scanning")))]
    #[inline]
    pub fn scan_for_errors(&self) {}

    /// Checks the heap's bookkeeping thoroughly, panicking on any inconsistency.
    ///
    /// Called after every operation when the `error-scanning` feature is enabled.
    #[cfg(any(test, feature = "error-scanning"))]
    pub fn scan_for_errors(&self) {
        if !self.is_initialized() {
            assert!(self.smallmap.is_empty() && self.treemap.is_empty());
            assert!(self.dv.is_null() && self.dvsize == 0);
            return;
        }

        assert!(self.max_footprint >= self.footprint);

        let mut segment_bytes = 0;
        let mut free_in_segments = 0;
        let mut top_found = false;
        let mut dv_found = self.dv.is_null();

        for seg in self.segments() {
            segment_bytes += seg.size;
            assert!(seg.base >= self.least_addr, "segment {:p} below least address", seg.base);

            let mut q = Chunk::align_as_chunk(seg.base);
            let mut prev_inuse = true;

            unsafe {
                while seg.holds(q as *const u8) && (*q).head != FENCEPOST_HEAD {
                    assert!(is_aligned(Chunk::to_mem(q) as usize), "misaligned chunk {:p}", q);
                    assert_eq!(Chunk::pinuse(q), prev_inuse, "stale PINUSE at {:p}", q);

                    if q == self.top {
                        assert!(prev_inuse, "free chunk before top");
                        assert_eq!((*q).head, self.topsize | PINUSE);
                        let foot = Chunk::plus_offset(q, self.topsize);
                        assert_eq!((*foot).head, TOP_FOOT_SIZE, "top foot overwritten");
                        assert!(foot.cast::<u8>().wrapping_add(TOP_FOOT_SIZE) <= seg.end());
                        top_found = true;
                        break;
                    }

                    let size = Chunk::size(q);
                    assert!(size >= MIN_CHUNK_SIZE, "undersized chunk {:p}", q);
                    let next = Chunk::next(q);

                    if Chunk::cinuse(q) {
                        assert_eq!(Chunk::owner_tag(q), self.tag, "foreign tag on {:p}", q);
                    } else {
                        assert!(Chunk::pinuse(q), "adjacent free chunks at {:p}", q);
                        assert!(Chunk::cinuse(next), "free chunk {:p} not followed by an in-use one", q);
                        assert_eq!((*next).prev_foot, size, "bad footer on {:p}", q);

                        if q == self.dv {
                            assert_eq!(size, self.dvsize);
                            dv_found = true;
                        }

                        free_in_segments += 1;
                    }

                    prev_inuse = Chunk::cinuse(q);
                    q = next;
                }
            }
        }

        assert!(top_found, "top {:p} is not in any segment", self.top);
        assert!(dv_found, "designated victim {:p} is not in any segment", self.dv);
        assert!(self.footprint >= segment_bytes);

        let mut binned = 0;

        unsafe {
            for i in 0..NSMALLBINS as u32 {
                let head = self.smallbins[i as usize];
                assert_eq!(head.is_null(), !self.smallmap.read_bit(i), "small bin {} out of sync", i);
                if head.is_null() {
                    continue;
                }

                let mut c = head;
                loop {
                    assert_eq!(Chunk::size(c), small_index_to_size(i));
                    assert!(!Chunk::is_inuse(c));
                    assert!(c != self.dv && c != self.top);
                    assert_eq!((*(*c).fd).bk, c);
                    assert_eq!((*(*c).bk).fd, c);

                    binned += 1;
                    assert!(binned <= free_in_segments, "small bin {} does not terminate", i);

                    c = (*c).fd;
                    if c == head {
                        break;
                    }
                }
            }

            for i in 0..NTREEBINS as u32 {
                let root = self.treebins[i as usize];
                assert_eq!(root.is_null(), !self.treemap.read_bit(i), "tree bin {} out of sync", i);
                if root.is_null() {
                    continue;
                }

                assert!((*root).parent.is_null());
                binned += self.check_tree(root, i, 0, 0);
            }
        }

        let expected = free_in_segments - usize::from(!self.dv.is_null());
        assert_eq!(binned, expected, "free chunks missing from the bins");
    }

    /// Validates the subtree at `t`, whose sizes share their top `depth`
    /// bits past the class bits with `prefix`. Returns the chunks in it.
    #[cfg(any(test, feature = "error-scanning"))]
    unsafe fn check_tree(&self, t: *mut TreeChunk, idx: u32, prefix: usize, depth: u32) -> usize {
        let size = TreeChunk::size(t);
        let shift = leftshift_for_tree_index(idx);

        assert_eq!((*t).index, idx);
        assert_eq!(compute_tree_index(size), idx, "chunk {:p} in the wrong tree bin", t);
        if depth > 0 {
            assert_eq!((size << shift) >> (usize::BITS - depth), prefix, "trie order broken at {:p}", t);
        }

        let mut count = 0;
        let mut u = t;
        loop {
            assert!(!Chunk::is_inuse(u.cast()));
            assert_eq!(TreeChunk::size(u), size);
            assert_eq!((*TreeChunk::next(u)).chunk.bk, u.cast());
            assert_eq!((*TreeChunk::prev(u)).chunk.fd, u.cast());
            if u != t {
                assert!((*u).parent.is_null() && (*u).child == [null_mut(); 2]);
            }

            count += 1;
            u = TreeChunk::next(u);
            if u == t {
                break;
            }
        }

        for dir in 0..2 {
            let c = (*t).child[dir];
            if !c.is_null() {
                assert_eq!((*c).parent, t);
                count += self.check_tree(c, idx, (prefix << 1) | dir, depth + 1);
            }
        }

        count
    }
}
