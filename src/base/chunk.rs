//! Chunk headers live in-band, directly in front of every allocation.
//!
//! A chunk's `head` holds its size with the low three bits used as flags:
//! - [`PINUSE`]: the physically preceding chunk is in use.
//! - [`CINUSE`]: this chunk is in use.
//! - [`FLAG4`]: unused, reserved.
//!
//! A chunk with neither in-use bit set is a directly mapped chunk, whose
//! `prev_foot` holds the offset back to the start of its mapping.
//!
//! The `prev_foot` word of a chunk belongs to the chunk before it.
//! It holds the size of the previous chunk while that chunk is free,
//! and the owner tag of the instance while that chunk is in use.

use core::mem::size_of;

pub(crate) const WORD: usize = size_of::<usize>();

/// Alignment of every pointer handed out by the allocator.
pub const MALLOC_ALIGNMENT: usize = WORD * 2;
pub(crate) const CHUNK_ALIGN_MASK: usize = MALLOC_ALIGNMENT - 1;

/// The header word plus the owner tag word of the following chunk.
pub(crate) const CHUNK_OVERHEAD: usize = WORD * 2;
pub(crate) const MMAP_CHUNK_OVERHEAD: usize = WORD * 2;
/// Room at the end of a mapping for the fake next-chunk headers.
pub(crate) const MMAP_FOOT_PAD: usize = WORD * 4;

pub(crate) const MIN_CHUNK_SIZE: usize =
    (size_of::<Chunk>() + CHUNK_ALIGN_MASK) & !CHUNK_ALIGN_MASK;

pub(crate) const MAX_REQUEST: usize = 0usize.wrapping_sub(MIN_CHUNK_SIZE) << 2;
pub(crate) const MIN_REQUEST: usize = MIN_CHUNK_SIZE - CHUNK_OVERHEAD - 1;

pub(crate) const PINUSE: usize = 1 << 0;
pub(crate) const CINUSE: usize = 1 << 1;
pub(crate) const FLAG4: usize = 1 << 2;
pub(crate) const INUSE: usize = PINUSE | CINUSE;
pub(crate) const FLAG_BITS: usize = PINUSE | CINUSE | FLAG4;

/// Head of the zero-payload in-use sentinels terminating each segment.
pub(crate) const FENCEPOST_HEAD: usize = INUSE | WORD;

pub(crate) const NSMALLBINS: usize = 32;
pub(crate) const NTREEBINS: usize = 32;
pub(crate) const SMALLBIN_SHIFT: usize = 3;
pub(crate) const TREEBIN_SHIFT: usize = 8;
pub(crate) const MIN_LARGE_SIZE: usize = 1 << TREEBIN_SHIFT;
pub(crate) const MAX_SMALL_SIZE: usize = MIN_LARGE_SIZE - 1;
pub(crate) const MAX_SMALL_REQUEST: usize = MAX_SMALL_SIZE - CHUNK_ALIGN_MASK - CHUNK_OVERHEAD;

/// Space kept at the end of every segment for a segment record and fence posts.
pub(crate) const TOP_FOOT_SIZE: usize =
    align_offset(CHUNK_OVERHEAD) + pad_request(size_of::<Segment>()) + MIN_CHUNK_SIZE;

/// Padding that guarantees a request can be carved after a successful system allocation.
pub(crate) const SYS_ALLOC_PADDING: usize = TOP_FOOT_SIZE + MALLOC_ALIGNMENT;

/// The segment was obtained through [`Source::map`](crate::source::Source::map).
pub(crate) const SEG_MMAP: u32 = 1 << 0;
/// The segment was supplied by the caller and is never released.
pub(crate) const SEG_EXTERN: u32 = 1 << 3;

#[inline]
pub(crate) const fn pad_request(req: usize) -> usize {
    (req + CHUNK_OVERHEAD + CHUNK_ALIGN_MASK) & !CHUNK_ALIGN_MASK
}

/// Converts a request into a chunk size, not checking for overflow.
#[inline]
pub(crate) const fn request_to_size(req: usize) -> usize {
    if req < MIN_REQUEST { MIN_CHUNK_SIZE } else { pad_request(req) }
}

/// Bytes needed to bring `addr` up to [`MALLOC_ALIGNMENT`].
#[inline]
pub(crate) const fn align_offset(addr: usize) -> usize {
    if addr & CHUNK_ALIGN_MASK == 0 {
        0
    } else {
        (MALLOC_ALIGNMENT - (addr & CHUNK_ALIGN_MASK)) & CHUNK_ALIGN_MASK
    }
}

#[inline]
pub(crate) const fn is_aligned(addr: usize) -> bool {
    addr & CHUNK_ALIGN_MASK == 0
}

#[inline]
pub(crate) const fn is_small(size: usize) -> bool {
    size >> SMALLBIN_SHIFT < NSMALLBINS
}

#[inline]
pub(crate) const fn small_index(size: usize) -> u32 {
    (size >> SMALLBIN_SHIFT) as u32
}

#[inline]
pub(crate) const fn small_index_to_size(idx: u32) -> usize {
    (idx as usize) << SMALLBIN_SHIFT
}

/// Size class of a chunk at least [`MIN_LARGE_SIZE`] bytes in size.
///
/// Each power of two is split into two classes by the bit below the leading one.
#[inline]
pub(crate) const fn compute_tree_index(size: usize) -> u32 {
    let x = size >> TREEBIN_SHIFT;

    if x == 0 {
        0
    } else if x > 0xFFFF {
        NTREEBINS as u32 - 1
    } else {
        let k = usize::BITS - 1 - x.leading_zeros();
        (k << 1) + ((size >> (k as usize + (TREEBIN_SHIFT - 1))) & 1) as u32
    }
}

/// Shift placing the highest size bit resolved by tree bin `idx` at the sign position.
#[inline]
pub(crate) const fn leftshift_for_tree_index(idx: u32) -> u32 {
    if idx as usize == NTREEBINS - 1 {
        0
    } else {
        usize::BITS - 1 - ((idx >> 1) + TREEBIN_SHIFT as u32 - 2)
    }
}

/// The smallest chunk size held by tree bin `idx`.
#[inline]
pub(crate) const fn min_size_for_tree_index(idx: u32) -> usize {
    let shift = (idx >> 1) as usize + TREEBIN_SHIFT;
    (1 << shift) | (((idx & 1) as usize) << (shift - 1))
}

/// Free chunk layout. In-use chunks only have `prev_foot` and `head` valid.
#[repr(C)]
pub(crate) struct Chunk {
    pub prev_foot: usize,
    pub head: usize,
    pub fd: *mut Chunk,
    pub bk: *mut Chunk,
}

/// Free chunk layout for sizes at or above [`MIN_LARGE_SIZE`].
#[repr(C)]
pub(crate) struct TreeChunk {
    pub chunk: Chunk,
    pub child: [*mut TreeChunk; 2],
    pub parent: *mut TreeChunk,
    pub index: u32,
}

/// A contiguous region of address space owned or borrowed by an instance.
///
/// The record for the most recent segment lives inside the instance;
/// the others live at the end of their own segments, in the chunk
/// reserved for them by [`TOP_FOOT_SIZE`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub(crate) struct Segment {
    pub base: *mut u8,
    pub size: usize,
    pub next: *mut Segment,
    pub flags: u32,
}

impl Chunk {
    #[inline]
    pub unsafe fn size(p: *mut Chunk) -> usize {
        (*p).head & !FLAG_BITS
    }

    #[inline]
    pub unsafe fn cinuse(p: *mut Chunk) -> bool {
        (*p).head & CINUSE != 0
    }

    #[inline]
    pub unsafe fn pinuse(p: *mut Chunk) -> bool {
        (*p).head & PINUSE != 0
    }

    #[inline]
    pub unsafe fn is_inuse(p: *mut Chunk) -> bool {
        (*p).head & INUSE != PINUSE
    }

    #[inline]
    pub unsafe fn mmapped(p: *mut Chunk) -> bool {
        (*p).head & INUSE == 0
    }

    #[inline]
    pub unsafe fn clear_pinuse(p: *mut Chunk) {
        (*p).head &= !PINUSE;
    }

    #[inline]
    pub unsafe fn next(p: *mut Chunk) -> *mut Chunk {
        p.cast::<u8>().add(Chunk::size(p)).cast()
    }

    #[inline]
    pub unsafe fn prev(p: *mut Chunk) -> *mut Chunk {
        p.cast::<u8>().sub((*p).prev_foot).cast()
    }

    #[inline]
    pub unsafe fn next_pinuse(p: *mut Chunk) -> bool {
        Chunk::pinuse(Chunk::next(p))
    }

    #[inline]
    pub fn plus_offset(p: *mut Chunk, offset: usize) -> *mut Chunk {
        p.cast::<u8>().wrapping_add(offset).cast()
    }

    #[inline]
    pub fn minus_offset(p: *mut Chunk, offset: usize) -> *mut Chunk {
        p.cast::<u8>().wrapping_sub(offset).cast()
    }

    #[inline]
    pub fn to_mem(p: *mut Chunk) -> *mut u8 {
        p.cast::<u8>().wrapping_add(2 * WORD)
    }

    #[inline]
    pub fn from_mem(mem: *mut u8) -> *mut Chunk {
        mem.wrapping_sub(2 * WORD).cast()
    }

    /// The first properly aligned chunk at or above `ptr`.
    #[inline]
    pub fn align_as_chunk(ptr: *mut u8) -> *mut Chunk {
        let chunk = ptr.cast::<Chunk>();
        ptr.wrapping_add(align_offset(Chunk::to_mem(chunk) as usize)).cast()
    }

    #[inline]
    pub unsafe fn set_foot(p: *mut Chunk, size: usize) {
        (*Chunk::plus_offset(p, size)).prev_foot = size;
    }

    /// Marks `p` free with a preceding in-use chunk and writes its footer.
    #[inline]
    pub unsafe fn set_size_and_pinuse_of_free_chunk(p: *mut Chunk, size: usize) {
        (*p).head = size | PINUSE;
        Chunk::set_foot(p, size);
    }

    #[inline]
    pub unsafe fn set_free_with_pinuse(p: *mut Chunk, size: usize, next: *mut Chunk) {
        Chunk::clear_pinuse(next);
        Chunk::set_size_and_pinuse_of_free_chunk(p, size);
    }

    /// Writes the owner tag into the footer position of an in-use chunk.
    #[inline]
    pub unsafe fn mark_inuse_foot(p: *mut Chunk, size: usize, tag: usize) {
        (*Chunk::plus_offset(p, size)).prev_foot = tag;
    }

    /// Marks `p` in use, keeping its own `PINUSE`, and sets the next chunk's `PINUSE`.
    #[inline]
    pub unsafe fn set_inuse(p: *mut Chunk, size: usize, tag: usize) {
        (*p).head = ((*p).head & PINUSE) | size | CINUSE;
        (*Chunk::plus_offset(p, size)).head |= PINUSE;
        Chunk::mark_inuse_foot(p, size, tag);
    }

    #[inline]
    pub unsafe fn set_inuse_and_pinuse(p: *mut Chunk, size: usize, tag: usize) {
        (*p).head = size | PINUSE | CINUSE;
        (*Chunk::plus_offset(p, size)).head |= PINUSE;
        Chunk::mark_inuse_foot(p, size, tag);
    }

    /// Like [`Chunk::set_inuse_and_pinuse`] but leaves the next chunk's head untouched.
    #[inline]
    pub unsafe fn set_size_and_pinuse_of_inuse_chunk(p: *mut Chunk, size: usize, tag: usize) {
        (*p).head = size | PINUSE | CINUSE;
        Chunk::mark_inuse_foot(p, size, tag);
    }

    /// Recovers the owner tag stored by [`Chunk::mark_inuse_foot`].
    #[inline]
    pub unsafe fn owner_tag(p: *mut Chunk) -> usize {
        (*Chunk::plus_offset(p, Chunk::size(p))).prev_foot
    }

    #[inline]
    pub unsafe fn overhead_for(p: *mut Chunk) -> usize {
        if Chunk::mmapped(p) { MMAP_CHUNK_OVERHEAD } else { CHUNK_OVERHEAD }
    }
}

impl TreeChunk {
    #[inline]
    pub unsafe fn leftmost_child(t: *mut TreeChunk) -> *mut TreeChunk {
        let left = (*t).child[0];
        if left.is_null() { (*t).child[1] } else { left }
    }

    #[inline]
    pub unsafe fn size(t: *mut TreeChunk) -> usize {
        Chunk::size(t.cast())
    }

    #[inline]
    pub unsafe fn next(t: *mut TreeChunk) -> *mut TreeChunk {
        (*t).chunk.fd.cast()
    }

    #[inline]
    pub unsafe fn prev(t: *mut TreeChunk) -> *mut TreeChunk {
        (*t).chunk.bk.cast()
    }
}

impl Segment {
    pub const EMPTY: Segment = Segment {
        base: core::ptr::null_mut(),
        size: 0,
        next: core::ptr::null_mut(),
        flags: 0,
    };

    #[inline]
    pub fn is_mmapped(&self) -> bool {
        self.flags & SEG_MMAP != 0
    }

    #[inline]
    pub fn is_extern(&self) -> bool {
        self.flags & SEG_EXTERN != 0
    }

    #[inline]
    pub fn end(&self) -> *mut u8 {
        self.base.wrapping_add(self.size)
    }

    #[inline]
    pub fn holds(&self, addr: *const u8) -> bool {
        self.base as *const u8 <= addr && addr < self.end() as *const u8
    }
}
