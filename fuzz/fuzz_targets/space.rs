#![no_main]

use std::ptr::null_mut;

use libfuzzer_sys::arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;

use segheap::{usable_size, Mmap, Param, Space};

#[derive(Arbitrary, Debug)]
enum Actions {
    /// Allocate memory with the given size
    Malloc { size: u16 },
    /// Allocate zeroed memory for `count` elements of `size` bytes
    Calloc { count: u8, size: u8 },
    /// Allocate memory with the given size and align of 1 << (align_bit % 16)
    Memalign { size: u16, align_bit: u8 },
    /// Free the ith allocation
    Free { index: u8 },
    /// Free `count` allocations starting at the ith at once
    BulkFree { index: u8, count: u8 },
    /// Resize the ith allocation
    Realloc { index: u8, new_size: u16 },
    /// Resize the ith allocation without moving it
    ReallocInPlace { index: u8, new_size: u16 },
    /// Allocate one oversized chunk, served by its own mapping unless tracked
    Large { size: u8 },
    /// Toggle tracking of large chunks in segments
    TrackLarge { enable: bool },
    /// Return memory to the system
    Trim { pad: u16 },
}
use Actions::*;

fuzz_target!(|actions: Vec<Actions>| fuzz_space(actions));

fn fill(ptr: *mut u8, size: usize, byte: u8) {
    unsafe { ptr.write_bytes(byte, size) };
}

fn check(ptr: *mut u8, size: usize, byte: u8) {
    let bytes = unsafe { std::slice::from_raw_parts(ptr, size) };
    assert!(bytes.iter().all(|&b| b == byte), "contents of {ptr:p} were clobbered");
}

fn fuzz_space(actions: Vec<Actions>) {
    let space = Space::<spin::Mutex<()>, Mmap>::create(0, Mmap).unwrap();
    space.set_param(Param::MmapThreshold, 1 << 18).unwrap();
    space.set_footprint_limit(64 << 20);

    // (pointer, requested size, fill byte)
    let mut allocations: Vec<(*mut u8, usize, u8)> = vec![];

    for (i, action) in actions.into_iter().enumerate() {
        let byte = i as u8;

        match action {
            Malloc { size } => {
                if let Ok(p) = space.malloc(size as usize) {
                    fill(p.as_ptr(), size as usize, byte);
                    allocations.push((p.as_ptr(), size as usize, byte));
                }
            }
            Calloc { count, size } => {
                let bytes = count as usize * size as usize;
                if let Ok(p) = space.calloc(count as usize, size as usize) {
                    check(p.as_ptr(), bytes, 0);
                    fill(p.as_ptr(), bytes, byte);
                    allocations.push((p.as_ptr(), bytes, byte));
                }
            }
            Memalign { size, align_bit } => {
                let align = 1 << (align_bit % 16);
                if let Ok(p) = space.memalign(align, size as usize) {
                    assert_eq!(p.as_ptr() as usize % align, 0);
                    fill(p.as_ptr(), size as usize, byte);
                    allocations.push((p.as_ptr(), size as usize, byte));
                }
            }
            Free { index } => {
                if !allocations.is_empty() {
                    let (p, size, b) = allocations.swap_remove(index as usize % allocations.len());
                    check(p, size, b);
                    unsafe { space.free(p).unwrap() };
                }
            }
            BulkFree { index, count } => {
                if !allocations.is_empty() {
                    let start = index as usize % allocations.len();
                    let end = (start + count as usize % 8).min(allocations.len());
                    let mut ptrs: Vec<*mut u8> = allocations
                        .drain(start..end)
                        .map(|(p, size, b)| {
                            check(p, size, b);
                            p
                        })
                        .collect();

                    assert_eq!(unsafe { space.bulk_free(&mut ptrs) }, Ok(0));
                    assert!(ptrs.iter().all(|p| p.is_null()));
                }
            }
            Realloc { index, new_size } => {
                if !allocations.is_empty() {
                    let index = index as usize % allocations.len();
                    let (p, size, b) = allocations[index];

                    if let Ok(new) = unsafe { space.realloc(p, new_size as usize) } {
                        let kept = size.min(new_size as usize);
                        check(new.as_ptr(), kept, b);
                        fill(new.as_ptr(), new_size as usize, b);
                        allocations[index] = (new.as_ptr(), new_size as usize, b);
                    }
                }
            }
            ReallocInPlace { index, new_size } => {
                if !allocations.is_empty() {
                    let index = index as usize % allocations.len();
                    let (p, size, b) = allocations[index];

                    if unsafe { space.realloc_in_place(p, new_size as usize) } == Ok(true) {
                        assert!(unsafe { usable_size(p) } >= new_size as usize);
                        check(p, size.min(new_size as usize), b);
                        fill(p, new_size as usize, b);
                        allocations[index] = (p, new_size as usize, b);
                    }
                }
            }
            Large { size } => {
                let size = (size as usize + 1) << 12;
                if let Ok(p) = space.malloc(size) {
                    fill(p.as_ptr(), size, byte);
                    allocations.push((p.as_ptr(), size, byte));
                }
            }
            TrackLarge { enable } => {
                space.track_large_chunks(enable);
            }
            Trim { pad } => {
                space.trim(pad as usize);
            }
        }

        let info = space.mem_info();
        assert!(info.total_allocated <= space.footprint());
        assert!(space.footprint() <= space.max_footprint());
    }

    let mut ptrs = vec![null_mut(); allocations.len()];
    for ((p, size, b), slot) in allocations.into_iter().zip(ptrs.iter_mut()) {
        check(p, size, b);
        *slot = p;
    }
    assert_eq!(unsafe { space.bulk_free(&mut ptrs) }, Ok(0));

    let footprint = space.footprint();
    assert_eq!(space.destroy(), Ok(footprint));
}
