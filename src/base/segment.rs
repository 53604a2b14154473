//! Growing and shrinking the heap: segments, the top chunk, and chunks
//! living in dedicated mappings.

use core::{marker::PhantomData, ptr::NonNull};

use super::*;
use crate::ptr_utils::{align_size_up, align_up_by};

/// Sizes beyond this would turn negative when handed to [`Source::morecore`].
const HALF_MAX_SIZE: usize = usize::MAX / 2;

/// Words spent around a dedicated mapping's chunk: header, footer, and fence posts.
const MMAP_CHUNK_PADDING: usize = 6 * WORD + CHUNK_ALIGN_MASK;

/// Walks the segment records, newest first.
pub(crate) struct Segments<'a> {
    next: *const Segment,
    _marker: PhantomData<&'a Segment>,
}

impl Iterator for Segments<'_> {
    type Item = Segment;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.is_null() {
            return None;
        }

        let seg = unsafe { *self.next };
        if seg.base.is_null() {
            return None;
        }

        self.next = seg.next;
        Some(seg)
    }
}

/// Whether any listed record other than `node` and the inline `head` is stored inside `seg`.
pub(super) unsafe fn holds_other_record(head: *mut Segment, node: *mut Segment, seg: &Segment) -> bool {
    let mut r = (*head).next;

    while !r.is_null() {
        if r != node && seg.holds(r as *const u8) {
            return true;
        }
        r = (*r).next;
    }

    false
}

/// Result of trying to extend the break-backed memory.
enum Contiguous {
    Grown(*mut u8, usize),
    /// The break moved unexpectedly, stop trying.
    Disable,
}

/// What the contiguous growth path needs to know about the heap, copied out
/// so the source can be borrowed on its own.
struct ContiguousRequest {
    nb: usize,
    asize: usize,
    top_segment_end: Option<*mut u8>,
    topsize: usize,
    footprint: usize,
    footprint_limit: usize,
    tuning: Tuning,
    page_size: usize,
}

/// Extends the break, either right after the top segment or wherever it is
/// if no segment holds the top. Must be called under the global lock.
unsafe fn grow_contiguous<S: Source>(src: &mut S, req: ContiguousRequest) -> Contiguous {
    let mut br = None;
    let mut ssize = req.asize;

    match req.top_segment_end {
        None => {
            if let Some(base) = src.morecore(0) {
                let base = base.as_ptr();
                let aligned = align_up_by(base, req.page_size - 1);
                ssize += aligned as usize - base as usize;

                let fp = req.footprint.wrapping_add(ssize);
                if ssize > req.nb
                    && ssize < HALF_MAX_SIZE
                    && (req.footprint_limit == 0 || (fp > req.footprint && fp <= req.footprint_limit))
                {
                    br = src.morecore(ssize as isize).map(NonNull::as_ptr);
                    if br == Some(base) {
                        return Contiguous::Grown(base, ssize);
                    }
                }
            }
        }
        Some(end) => {
            ssize = req.tuning.granularity_align(req.nb - req.topsize + SYS_ALLOC_PADDING);
            if ssize < HALF_MAX_SIZE {
                br = src.morecore(ssize as isize).map(NonNull::as_ptr);
                if br == Some(end) {
                    return Contiguous::Grown(end, ssize);
                }
            }
        }
    }

    // someone else moved the break, try to make use of what was obtained
    let Some(got) = br else {
        return Contiguous::Disable;
    };

    if ssize < HALF_MAX_SIZE && ssize < req.nb + SYS_ALLOC_PADDING {
        let esize = req.tuning.granularity_align(req.nb + SYS_ALLOC_PADDING - ssize);
        if esize < HALF_MAX_SIZE {
            if src.morecore(esize as isize).is_some() {
                ssize += esize;
            } else {
                src.morecore(-(ssize as isize));
                return Contiguous::Disable;
            }
        }
    }

    Contiguous::Grown(got, ssize)
}

impl<S: Source> Heap<S> {
    /// The segment records, newest first.
    pub(crate) fn segments(&self) -> Segments<'_> {
        Segments { next: &self.seg, _marker: PhantomData }
    }

    /// The record of the segment holding `addr`, or null.
    pub(super) fn segment_holding(&mut self, addr: *const u8) -> *mut Segment {
        let mut sp: *mut Segment = &mut self.seg;

        unsafe {
            while !sp.is_null() && !(*sp).base.is_null() {
                if (*sp).holds(addr) {
                    return sp;
                }
                sp = (*sp).next;
            }
        }

        core::ptr::null_mut()
    }

    /// Whether a segment record is stored inside `seg`, which then cannot shrink.
    fn has_segment_link(&self, seg: &Segment) -> bool {
        let mut sp = self.seg.next;

        unsafe {
            while !sp.is_null() {
                if seg.holds(sp as *const u8) {
                    return true;
                }
                sp = (*sp).next;
            }
        }

        false
    }

    #[inline]
    fn grew_footprint(&mut self, size: usize) {
        self.footprint += size;
        if self.footprint > self.max_footprint {
            self.max_footprint = self.footprint;
        }
    }

    #[inline]
    fn exceeds_footprint_limit(&self, size: usize) -> bool {
        if self.footprint_limit == 0 {
            return false;
        }

        let fp = self.footprint.wrapping_add(size);
        fp <= self.footprint || fp > self.footprint_limit
    }

    /// Makes the `psize` bytes at `p` the top chunk, fencing off its end.
    pub(super) unsafe fn init_top(&mut self, p: *mut Chunk, psize: usize) {
        let offset = align_offset(Chunk::to_mem(p) as usize);
        let p = Chunk::plus_offset(p, offset);
        let psize = psize - offset;

        self.top = p;
        self.topsize = psize;
        (*p).head = psize | PINUSE;
        (*Chunk::plus_offset(p, psize)).head = TOP_FOOT_SIZE;
        self.trim_check = self.tuning.trim_threshold;
    }

    /// Obtains memory from the source and allocates `nb` bytes from it.
    pub(super) unsafe fn sys_alloc(&mut self, nb: usize) -> Result<*mut Chunk, HeapError> {
        if self.mflags & USE_MMAP != 0 && nb >= self.tuning.mmap_threshold && self.topsize != 0 {
            if let Some(p) = self.mmap_alloc(nb) {
                return Ok(p);
            }
        }

        let asize = self.tuning.granularity_align(nb + SYS_ALLOC_PADDING);
        if asize <= nb {
            return Err(HeapError::RequestTooLarge);
        }

        if self.exceeds_footprint_limit(asize) {
            return Err(HeapError::FootprintLimit);
        }

        let mut grown = None;

        if S::HAS_MORECORE && self.mflags & NONCONTIGUOUS == 0 {
            let top_segment_end = if self.top.is_null() {
                None
            } else {
                let sp = self.segment_holding(self.top as *const u8);
                if sp.is_null() { None } else { Some((*sp).end()) }
            };

            let req = ContiguousRequest {
                nb,
                asize,
                top_segment_end,
                topsize: self.topsize,
                footprint: self.footprint,
                footprint_limit: self.footprint_limit,
                tuning: self.tuning,
                page_size: self.page_size,
            };

            match self.source.with_global_lock(|src| grow_contiguous(src, req)) {
                Contiguous::Grown(base, size) => grown = Some((base, size, 0)),
                Contiguous::Disable => {
                    log::debug!("segheap: break moved by someone else, no longer growing contiguously");
                    self.mflags |= NONCONTIGUOUS;
                }
            }
        }

        if grown.is_none() {
            if let Some(base) = self.source.map(asize) {
                grown = Some((base.as_ptr(), asize, SEG_MMAP));
            }
        }

        if grown.is_none() && S::HAS_MORECORE && asize < HALF_MAX_SIZE {
            let (br, end) = self.source.with_global_lock(|src| {
                (src.morecore(asize as isize), src.morecore(0))
            });

            if let (Some(br), Some(end)) = (br, end) {
                let (br, end) = (br.as_ptr(), end.as_ptr());
                if br < end && end as usize - br as usize > nb + TOP_FOOT_SIZE {
                    grown = Some((br, end as usize - br as usize, 0));
                }
            }
        }

        let Some((tbase, tsize, flags)) = grown else {
            return Err(HeapError::OutOfMemory);
        };

        log::debug!("segheap: obtained {:p}..{:p}", tbase, tbase.wrapping_add(tsize));
        self.grew_footprint(tsize);

        if !self.is_initialized() {
            if self.least_addr.is_null() || tbase < self.least_addr {
                self.least_addr = tbase;
            }

            self.seg = Segment { base: tbase, size: tsize, next: core::ptr::null_mut(), flags };
            self.release_checks = MAX_RELEASE_CHECK_RATE;
            self.init_top(tbase.cast(), tsize - TOP_FOOT_SIZE);

            #[cfg(feature = "counters")]
            self.counters.account_segment(tsize);
        } else {
            let mut sp: *mut Segment = &mut self.seg;
            while !sp.is_null() && (*sp).end() != tbase {
                sp = (*sp).next;
            }

            if !sp.is_null()
                && !(*sp).is_extern()
                && (*sp).flags & SEG_MMAP == flags
                && (*sp).holds(self.top as *const u8)
            {
                // appended to the segment holding the top
                (*sp).size += tsize;
                self.init_top(self.top, self.topsize + tsize);

                #[cfg(feature = "counters")]
                self.counters.account_segment_growth(tsize);
            } else {
                if tbase < self.least_addr {
                    self.least_addr = tbase;
                }

                let mut sp: *mut Segment = &mut self.seg;
                while !sp.is_null() && (*sp).base != tbase.wrapping_add(tsize) {
                    sp = (*sp).next;
                }

                if !sp.is_null() && !(*sp).is_extern() && (*sp).flags & SEG_MMAP == flags {
                    let oldbase = (*sp).base;
                    (*sp).base = tbase;
                    (*sp).size += tsize;

                    #[cfg(feature = "counters")]
                    self.counters.account_segment_growth(tsize);

                    return self.prepend_alloc(tbase, oldbase, nb);
                }

                self.add_segment(tbase, tsize, flags)?;
            }
        }

        if nb < self.topsize {
            Ok(self.take_from_top(nb))
        } else {
            Err(HeapError::OutOfMemory)
        }
    }

    /// Allocates `nb` bytes at the start of memory just prepended to a segment,
    /// merging the rest with the segment's old first chunk.
    unsafe fn prepend_alloc(
        &mut self,
        newbase: *mut u8,
        oldbase: *mut u8,
        nb: usize,
    ) -> Result<*mut Chunk, HeapError> {
        let p = Chunk::align_as_chunk(newbase);
        let mut oldfirst = Chunk::align_as_chunk(oldbase);
        let psize = oldfirst as usize - p as usize;
        let q = Chunk::plus_offset(p, nb);
        let mut qsize = psize - nb;

        Chunk::set_size_and_pinuse_of_inuse_chunk(p, nb, self.tag);

        if oldfirst == self.top {
            self.topsize += qsize;
            self.top = q;
            (*q).head = self.topsize | PINUSE;
        } else if oldfirst == self.dv {
            self.dvsize += qsize;
            self.dv = q;
            Chunk::set_size_and_pinuse_of_free_chunk(q, self.dvsize);
        } else {
            if !Chunk::is_inuse(oldfirst) {
                let nsize = Chunk::size(oldfirst);
                self.unlink_chunk(oldfirst, nsize)?;
                oldfirst = Chunk::plus_offset(oldfirst, nsize);
                qsize += nsize;
            }

            Chunk::set_free_with_pinuse(q, qsize, oldfirst);
            self.insert_chunk(q, qsize)?;
        }

        Ok(p)
    }

    /// Starts a new segment at `tbase`, moving the top there. The record of
    /// the current segment is pushed into the end of the old top's segment.
    unsafe fn add_segment(&mut self, tbase: *mut u8, tsize: usize, flags: u32) -> Result<(), HeapError> {
        let old_top = self.top.cast::<u8>();
        let oldsp = self.segment_holding(old_top);
        if oldsp.is_null() {
            return Err(HeapError::corruption(old_top));
        }

        let old_end = (*oldsp).end();
        let ssize = pad_request(core::mem::size_of::<Segment>());
        let rawsp = old_end.wrapping_sub(ssize + 4 * WORD + CHUNK_ALIGN_MASK);
        let asp = rawsp.wrapping_add(align_offset(Chunk::to_mem(rawsp.cast()) as usize));
        let csp = if asp < old_top.wrapping_add(MIN_CHUNK_SIZE) { old_top } else { asp };
        let sp = csp.cast::<Chunk>();
        let ss = Chunk::to_mem(sp).cast::<Segment>();
        let mut p = Chunk::plus_offset(sp, ssize);

        self.init_top(tbase.cast(), tsize - TOP_FOOT_SIZE);

        Chunk::set_size_and_pinuse_of_inuse_chunk(sp, ssize, self.tag);
        ss.write(self.seg);
        self.seg = Segment { base: tbase, size: tsize, next: ss, flags };

        // fence posts up to the old end so nothing walks past it
        loop {
            let nextp = Chunk::plus_offset(p, WORD);
            (*p).head = FENCEPOST_HEAD;

            if nextp.cast::<u8>().wrapping_add(WORD) < old_end {
                p = nextp;
            } else {
                break;
            }
        }

        if csp != old_top {
            let q = old_top.cast::<Chunk>();
            let psize = csp as usize - old_top as usize;
            let tn = Chunk::plus_offset(q, psize);
            Chunk::set_free_with_pinuse(q, psize, tn);
            self.insert_chunk(q, psize)?;
        }

        #[cfg(feature = "counters")]
        self.counters.account_segment(tsize);

        Ok(())
    }

    /// Unmaps mapped segments that consist of a single free chunk.
    ///
    /// The newest segment is never released. Returns the number of bytes released.
    pub(super) unsafe fn release_unused_segments(&mut self) -> Result<usize, HeapError> {
        let head: *mut Segment = &mut self.seg;
        let mut released = 0;
        let mut nsegs = 0;
        let mut pred = head;
        let mut sp = (*pred).next;

        while !sp.is_null() {
            let seg = *sp;
            let next = seg.next;
            nsegs += 1;

            if seg.is_mmapped() && !seg.is_extern() {
                let p = Chunk::align_as_chunk(seg.base);
                let psize = Chunk::size(p);

                let whole = !Chunk::is_inuse(p)
                    && p != self.top
                    && p as usize + psize >= seg.end() as usize - TOP_FOOT_SIZE;

                if whole && !holds_other_record(head, sp, &seg) {
                    let tp = p.cast::<TreeChunk>();

                    if p == self.dv {
                        self.dv = core::ptr::null_mut();
                        self.dvsize = 0;
                    } else {
                        self.unlink_large_chunk(tp)?;
                    }

                    if self.source.unmap(NonNull::new_unchecked(seg.base), seg.size) {
                        log::debug!("segheap: released unused segment {:p}", seg.base);
                        released += seg.size;
                        self.footprint -= seg.size;

                        #[cfg(feature = "counters")]
                        self.counters.account_segment_release(seg.size);

                        (*pred).next = next;
                        sp = next;
                        continue;
                    }

                    self.insert_large_chunk(tp, psize)?;
                }
            }

            pred = sp;
            sp = next;
        }

        self.release_checks = nsegs.max(MAX_RELEASE_CHECK_RATE);
        Ok(released)
    }

    /// Unmaps the newest segment if the top chunk spans all of it and it holds
    /// no other record. The free chunk ending the next segment becomes the top,
    /// provided it keeps more than `pad` bytes. Returns the bytes released.
    unsafe fn release_top_segment(&mut self, pad: usize) -> Result<usize, HeapError> {
        let seg = self.seg;

        if seg.next.is_null()
            || !seg.is_mmapped()
            || seg.is_extern()
            || self.top != Chunk::align_as_chunk(seg.base)
            || self.has_segment_link(&seg)
        {
            return Ok(0);
        }

        // the next record sits in the top foot of its own segment, right after its old top
        let next = *seg.next;
        let rec = Chunk::from_mem(seg.next.cast());
        if rec.cast::<u8>().wrapping_add(TOP_FOOT_SIZE) != next.end() || Chunk::pinuse(rec) {
            return Ok(0);
        }

        let qsize = (*rec).prev_foot;
        let q = Chunk::minus_offset(rec, qsize);
        if qsize <= pad || !next.holds(q as *const u8) || Chunk::is_inuse(q) {
            return Ok(0);
        }

        let was_dv = q == self.dv;
        self.detach_free_chunk(q, qsize, was_dv)?;

        if !self.source.unmap(NonNull::new_unchecked(seg.base), seg.size) {
            self.refile_free_chunk(q, qsize, was_dv)?;
            return Ok(0);
        }

        log::debug!("segheap: released top segment {:p}", seg.base);

        self.seg = next;
        self.footprint -= seg.size;
        self.init_top(q, qsize);

        #[cfg(feature = "counters")]
        self.counters.account_segment_release(seg.size);

        Ok(seg.size)
    }

    /// Unmaps whole granularity units off the start of mapped segments that
    /// begin with a free chunk, as left behind once memory prepended to a
    /// segment is freed. Returns the bytes released.
    unsafe fn release_free_prefixes(&mut self) -> Result<usize, HeapError> {
        let unit = self.tuning.granularity;
        let mut released = 0;
        let mut sp: *mut Segment = &mut self.seg;

        while !sp.is_null() && !(*sp).base.is_null() {
            let seg = *sp;
            let p = seg.base.cast::<Chunk>();

            if seg.is_mmapped()
                && !seg.is_extern()
                && Chunk::align_as_chunk(seg.base) == p
                && p != self.top
                && !Chunk::is_inuse(p)
            {
                let psize = Chunk::size(p);
                let next = Chunk::plus_offset(p, psize);

                let mut cut = psize / unit * unit;
                if psize - cut != 0 && psize - cut < MIN_CHUNK_SIZE {
                    cut = cut.saturating_sub(unit);
                }

                // wholly free segments are left to release_unused_segments
                if cut != 0 && (next as usize) < seg.end() as usize - TOP_FOOT_SIZE {
                    let was_dv = p == self.dv;
                    self.detach_free_chunk(p, psize, was_dv)?;

                    if self.source.unmap(NonNull::new_unchecked(seg.base), cut) {
                        log::debug!("segheap: released {:#x} bytes off the start of {:p}", cut, seg.base);

                        (*sp).base = seg.base.add(cut);
                        (*sp).size -= cut;
                        self.footprint -= cut;
                        released += cut;

                        #[cfg(feature = "counters")]
                        self.counters.account_trim(cut);

                        let rest = psize - cut;
                        if rest == 0 {
                            (*next).head |= PINUSE;
                        } else {
                            let r = Chunk::plus_offset(p, cut);
                            Chunk::set_size_and_pinuse_of_free_chunk(r, rest);
                            self.refile_free_chunk(r, rest, was_dv)?;
                        }
                    } else {
                        self.refile_free_chunk(p, psize, was_dv)?;
                    }
                }
            }

            sp = seg.next;
        }

        Ok(released)
    }

    /// Takes the free chunk `p` out of the bins, or out of the victim slot.
    unsafe fn detach_free_chunk(&mut self, p: *mut Chunk, size: usize, is_dv: bool) -> Result<(), HeapError> {
        if is_dv {
            self.dv = core::ptr::null_mut();
            self.dvsize = 0;
            Ok(())
        } else {
            self.unlink_chunk(p, size)
        }
    }

    /// Puts back a chunk taken out by [`Heap::detach_free_chunk`].
    unsafe fn refile_free_chunk(&mut self, p: *mut Chunk, size: usize, as_dv: bool) -> Result<(), HeapError> {
        if as_dv {
            self.dv = p;
            self.dvsize = size;
            Ok(())
        } else {
            self.insert_chunk(p, size)
        }
    }

    /// Returns unused memory at the end of the top chunk to the source,
    /// keeping at least `pad` bytes. Returns whether anything was released.
    pub(super) unsafe fn sys_trim(&mut self, pad: usize) -> Result<bool, HeapError> {
        if pad >= MAX_REQUEST || !self.is_initialized() {
            return Ok(false);
        }

        let pad = pad + TOP_FOOT_SIZE;
        let mut released = 0;

        loop {
            match self.release_top_segment(pad)? {
                0 => break,
                size => released += size,
            }
        }

        if self.topsize > pad {
            let mut trimmed = 0;
            // whole units only, keeping at least one
            let unit = self.tuning.granularity;
            let mut extra = ((self.topsize - pad).div_ceil(unit) - 1) * unit;
            let sp = self.segment_holding(self.top as *const u8);

            if sp.is_null() {
                return Err(HeapError::corruption(self.top));
            }

            let seg = *sp;

            if extra != 0 && !seg.is_extern() && !self.has_segment_link(&seg) {
                if seg.is_mmapped() {
                    if seg.size >= extra {
                        let newsize = seg.size - extra;
                        let base = NonNull::new_unchecked(seg.base);

                        if self.source.remap(base, seg.size, newsize, false).is_some()
                            || self
                                .source
                                .unmap(NonNull::new_unchecked(seg.base.add(newsize)), extra)
                        {
                            trimmed = extra;
                        }
                    }
                } else if S::HAS_MORECORE {
                    if extra >= HALF_MAX_SIZE {
                        extra = HALF_MAX_SIZE + 1 - unit;
                    }

                    let end = seg.end();
                    trimmed = self.source.with_global_lock(|src| {
                        // only give back memory if the break is where we left it
                        match src.morecore(0) {
                            Some(old_br) if old_br.as_ptr() == end => {
                                let rel = src.morecore(-(extra as isize));
                                match (rel, src.morecore(0)) {
                                    (Some(_), Some(new_br)) if new_br < old_br => {
                                        old_br.as_ptr() as usize - new_br.as_ptr() as usize
                                    }
                                    _ => 0,
                                }
                            }
                            _ => 0,
                        }
                    });
                }
            }

            if trimmed != 0 {
                log::debug!("segheap: trimmed {:#x} bytes off {:p}", trimmed, seg.base);

                (*sp).size -= trimmed;
                self.footprint -= trimmed;
                self.init_top(self.top, self.topsize - trimmed);
                released += trimmed;

                #[cfg(feature = "counters")]
                self.counters.account_trim(trimmed);
            }
        }

        released += self.release_free_prefixes()?;
        released += self.release_unused_segments()?;

        // stop trying on every free if nothing can be given back
        if released == 0 && self.topsize > self.trim_check {
            self.trim_check = usize::MAX;
        }

        Ok(released != 0)
    }

    #[inline]
    fn mmap_size(&self, nb: usize) -> usize {
        align_size_up(nb + MMAP_CHUNK_PADDING, self.page_size)
    }

    /// Places a chunk of `nb` bytes in a mapping of its own.
    unsafe fn mmap_alloc(&mut self, nb: usize) -> Option<*mut Chunk> {
        let mmsize = self.mmap_size(nb);

        if mmsize <= nb || self.exceeds_footprint_limit(mmsize) {
            return None;
        }

        let mm = self.source.map(mmsize)?.as_ptr();
        let offset = align_offset(Chunk::to_mem(mm.cast()) as usize);
        let psize = mmsize - offset - MMAP_FOOT_PAD;
        let p = mm.add(offset).cast::<Chunk>();

        (*p).prev_foot = offset;
        (*p).head = psize;
        Chunk::mark_inuse_foot(p, psize, self.tag);
        (*Chunk::plus_offset(p, psize)).head = FENCEPOST_HEAD;
        (*Chunk::plus_offset(p, psize + WORD)).head = 0;

        if self.least_addr.is_null() || mm < self.least_addr {
            self.least_addr = mm;
        }
        self.grew_footprint(mmsize);

        #[cfg(feature = "counters")]
        self.counters.account_map_chunk(mmsize);

        log::trace!("segheap: mapped chunk {:p} of {:#x} bytes", p, psize);
        Some(p)
    }

    /// Releases the mapping of the mapped chunk `p` of `psize` bytes.
    pub(super) unsafe fn unmap_chunk(&mut self, p: *mut Chunk, psize: usize) {
        let offset = (*p).prev_foot;
        let size = psize + offset + MMAP_FOOT_PAD;

        if self.source.unmap(NonNull::new_unchecked(p.cast::<u8>().sub(offset)), size) {
            self.footprint -= size;

            #[cfg(feature = "counters")]
            self.counters.account_unmap_chunk(size);
        }
    }

    /// Resizes a mapped chunk, keeping it if it is big enough but not too big.
    pub(super) unsafe fn mmap_resize(
        &mut self,
        oldp: *mut Chunk,
        nb: usize,
        can_move: bool,
    ) -> Option<*mut Chunk> {
        let oldsize = Chunk::size(oldp);

        if is_small(nb) {
            return None;
        }

        if oldsize >= nb + WORD && oldsize - nb <= self.tuning.granularity.saturating_mul(2) {
            return Some(oldp);
        }

        let offset = (*oldp).prev_foot;
        let oldmmsize = oldsize + offset + MMAP_FOOT_PAD;
        let newmmsize = self.mmap_size(nb);

        if newmmsize > oldmmsize && self.exceeds_footprint_limit(newmmsize - oldmmsize) {
            return None;
        }

        let base = NonNull::new_unchecked(oldp.cast::<u8>().sub(offset));
        let cp = self.source.remap(base, oldmmsize, newmmsize, can_move)?.as_ptr();

        let newp = cp.add(offset).cast::<Chunk>();
        let psize = newmmsize - offset - MMAP_FOOT_PAD;

        (*newp).head = psize;
        Chunk::mark_inuse_foot(newp, psize, self.tag);
        (*Chunk::plus_offset(newp, psize)).head = FENCEPOST_HEAD;
        (*Chunk::plus_offset(newp, psize + WORD)).head = 0;

        if cp < self.least_addr {
            self.least_addr = cp;
        }

        self.footprint = self.footprint.wrapping_add(newmmsize.wrapping_sub(oldmmsize));
        if self.footprint > self.max_footprint {
            self.max_footprint = self.footprint;
        }

        #[cfg(feature = "counters")]
        self.counters.account_remap_chunk(oldmmsize, newmmsize);

        Some(newp)
    }
}
