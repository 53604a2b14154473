use core::ptr::null_mut;

use super::*;
use crate::{params::default_tuning, source::Manual, sync::NoLock, Space};

fn with_heap(size: usize, f: impl FnOnce(&mut Heap<Manual>)) {
    let mut arena = std::vec![0u8; size];
    let mut space =
        unsafe { Space::<NoLock, Manual>::create_with_base(arena.as_mut_ptr(), arena.len(), Manual) }
            .unwrap();

    f(space.get_mut());
    space.get_mut().scan_for_errors();
}

#[test]
fn victim_serves_small_requests() {
    with_heap(1 << 16, |heap| {
        let a = heap.malloc(200).unwrap();
        let _guard = heap.malloc(8).unwrap();
        unsafe { heap.free(a.as_ptr()).unwrap() };
        assert!(heap.dv.is_null());

        // split off the binned chunk, the rest becomes the victim
        let b = heap.malloc(16).unwrap();
        assert_eq!(b, a);
        assert_eq!(heap.dv, Chunk::plus_offset(Chunk::from_mem(a.as_ptr()), 32));
        assert_eq!(heap.dvsize, request_to_size(200) - 32);

        let c = heap.malloc(16).unwrap();
        assert_eq!(Chunk::from_mem(c.as_ptr()), Chunk::plus_offset(Chunk::from_mem(a.as_ptr()), 32));
        assert_eq!(heap.dvsize, request_to_size(200) - 64);

        // freeing next to the victim grows it
        unsafe { heap.free(c.as_ptr()).unwrap() };
        assert_eq!(heap.dvsize, request_to_size(200) - 32);
    });
}

#[test]
fn calloc_clears_reused_memory() {
    with_heap(1 << 16, |heap| {
        let p = heap.malloc(100).unwrap();
        let _guard = heap.malloc(8).unwrap();
        unsafe {
            p.as_ptr().write_bytes(0xFF, 100);
            heap.free(p.as_ptr()).unwrap();
        }

        let q = heap.calloc(10, 10).unwrap();
        assert_eq!(q, p);
        assert!(unsafe { core::slice::from_raw_parts(q.as_ptr(), 100) }.iter().all(|&b| b == 0));
    });
}

#[test]
fn null_and_freed_pointers() {
    with_heap(1 << 16, |heap| unsafe {
        assert_eq!(heap.free(null_mut()), Ok(()));
        assert_eq!(usable_size(null_mut()), 0);

        let p = heap.malloc(24).unwrap();
        assert_eq!(usable_size(p.as_ptr()), request_to_size(24) - CHUNK_OVERHEAD);
        heap.free(p.as_ptr()).unwrap();

        // merged into the top chunk
        assert_eq!(usable_size(p.as_ptr()), 0);
    });
}

#[test]
fn bulk_free_merges_neighbors() {
    with_heap(1 << 16, |heap| unsafe {
        let mut ptrs = [null_mut(); 3];
        for p in ptrs.iter_mut() {
            *p = heap.malloc(40).unwrap().as_ptr();
        }
        let _guard = heap.malloc(8).unwrap();
        let first = ptrs[0];

        assert_eq!(heap.bulk_free(&mut ptrs), Ok(0));
        assert_eq!(ptrs, [null_mut(); 3]);
        assert_eq!(heap.mem_info().free_chunks, 2);

        // one chunk spanning all three
        let merged = heap.malloc(3 * request_to_size(40) - CHUNK_OVERHEAD).unwrap();
        assert_eq!(merged.as_ptr(), first);
    });
}

#[test]
fn shrinking_splits_off_the_tail() {
    with_heap(1 << 16, |heap| unsafe {
        let a = heap.malloc(1000).unwrap();
        let _guard = heap.malloc(8).unwrap();

        assert_eq!(heap.realloc(a.as_ptr(), 100).unwrap(), a);
        assert_eq!(usable_size(a.as_ptr()), request_to_size(100) - CHUNK_OVERHEAD);

        // the tail is reusable
        let b = heap.malloc(600).unwrap();
        assert_eq!(b.as_ptr(), a.as_ptr().add(request_to_size(100)));

        assert_eq!(heap.realloc_in_place(a.as_ptr(), 101), Ok(true));
        assert_eq!(heap.realloc_in_place(a.as_ptr(), 200), Ok(false));
    });
}

#[test]
fn comalloc_needs_room_for_every_pointer() {
    with_heap(1 << 16, |heap| {
        let before = heap.mem_info();
        let mut chunks = [null_mut(); 2];

        assert_eq!(
            heap.independent_comalloc(&[1, 2, 3], &mut chunks),
            Err(HeapError::TooFewSlots { needed: 3, given: 2 })
        );
        assert_eq!(chunks, [null_mut(); 2]);
        assert_eq!(heap.mem_info(), before);

        // extra slots are left alone
        let mut chunks = [null_mut(); 4];
        heap.independent_comalloc(&[1, 2, 3], &mut chunks).unwrap();
        assert!(chunks[..3].iter().all(|p| !p.is_null()));
        assert!(chunks[3].is_null());
    });
}

#[test]
fn settings_are_per_heap() {
    with_heap(1 << 16, |heap| {
        assert!(!heap.track_large_chunks(true));
        assert!(heap.track_large_chunks(false));
        assert!(!heap.track_large_chunks(false));

        heap.set_param(Param::TrimThreshold, 1234).unwrap();
        assert_eq!(heap.tuning().trim_threshold, 1234);
        assert_ne!(default_tuning().trim_threshold, 1234);

        assert_eq!(heap.error_policy(), ErrorPolicy::STRICT);
        heap.set_error_policy(ErrorPolicy::LENIENT);
        assert_eq!(heap.error_policy(), ErrorPolicy::LENIENT);

        assert_eq!(heap.source(), &Manual);
        assert!(heap.max_footprint() >= heap.footprint());
    });
}

#[test]
fn random_sequences_stay_consistent() {
    with_heap(1 << 20, |heap| {
        let mut live: std::vec::Vec<*mut u8> = std::vec::Vec::new();

        for _ in 0..3000 {
            match fastrand::usize(0..6) {
                0 | 1 => {
                    if let Ok(p) = heap.malloc(fastrand::usize(0..5000)) {
                        live.push(p.as_ptr());
                    }
                }
                2 => {
                    if let Ok(p) = heap.memalign(1 << fastrand::usize(4..10), fastrand::usize(0..500)) {
                        live.push(p.as_ptr());
                    }
                }
                3 if !live.is_empty() => {
                    let i = fastrand::usize(..live.len());
                    if let Ok(p) = unsafe { heap.realloc(live[i], fastrand::usize(0..5000)) } {
                        live[i] = p.as_ptr();
                    }
                }
                4 if live.len() > 4 => {
                    let at = fastrand::usize(..live.len() - 4);
                    let mut batch: std::vec::Vec<_> = live.drain(at..at + 4).collect();
                    assert_eq!(unsafe { heap.bulk_free(&mut batch) }, Ok(0));
                }
                _ if !live.is_empty() => {
                    let p = live.swap_remove(fastrand::usize(..live.len()));
                    unsafe { heap.free(p).unwrap() };
                }
                _ => {}
            }
        }

        for p in live {
            unsafe { heap.free(p).unwrap() };
        }

        assert_eq!(heap.mem_info().free_chunks, 1);
    });
}
