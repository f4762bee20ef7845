//! End-to-end exercise of the public allocator surface.
//!
//! The heap is a process-wide singleton with a one-shot definition, so the
//! whole sequence lives in a single test function: default-table setup,
//! page reservation, lazy definition, allocation in every flavour, dynamic
//! region donation and the failure hook.

use core::alloc::{GlobalAlloc, Layout};
use std::sync::atomic::{AtomicUsize, Ordering};

use emberrt_mem::{
    GlobalHeap, HEADER_SIZE, HeapRegion, add_region, allocate, allocate_aligned,
    allocate_reserved_aligned, free, free_bytes, min_ever_free_bytes, print_free_list, reallocate,
    reserve_pages, set_alloc_fail_hook, set_default_regions, total_heap_bytes,
};

static FAILED_SIZE: AtomicUsize = AtomicUsize::new(0);

fn record_failure(size: usize) {
    FAILED_SIZE.store(size, Ordering::SeqCst);
}

/// Leaks a page-aligned, zeroed arena standing in for donated RAM.
fn leak_arena(size: usize) -> usize {
    let layout = Layout::from_size_align(size, 4096).unwrap();
    let base = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!base.is_null());
    base as usize
}

#[test]
fn global_heap_end_to_end() {
    let arena = leak_arena(64 * 1024);

    // Bring-up order: program the default table, reserve a page for the
    // MMU, then let the first allocation define the heap lazily.
    unsafe { set_default_regions(&[HeapRegion { start: arena as *mut u8, len: 8 * 1024 }]) };
    let reserved = reserve_pages(4096);
    assert_eq!(reserved as usize, arena);

    let p = allocate(100);
    assert_eq!(p as usize, arena + 4096 + HEADER_SIZE);
    assert_eq!(total_heap_bytes(), 4096 - HEADER_SIZE);
    assert!(min_ever_free_bytes() <= free_bytes());

    let aligned = allocate_aligned(64, 1023);
    assert!(!aligned.is_null());
    assert_eq!(aligned as usize % 1024, 0);

    let p2 = unsafe { reallocate(p, 200) };
    assert!(!p2.is_null());
    unsafe { free(p2) };
    unsafe { free(aligned) };
    assert_eq!(free_bytes(), total_heap_bytes());

    // A one-shot reserved carve: block-aligned, never freed.
    let carve = allocate_reserved_aligned(256, 255);
    assert!(!carve.is_null());
    assert_eq!(carve as usize % 256, 0);

    // Totals only ever grow, and only on region donation.
    let total_before = total_heap_bytes();
    unsafe { add_region((arena + 16 * 1024) as *mut u8, 16 * 1024) };
    assert_eq!(total_heap_bytes(), total_before + 16 * 1024 - HEADER_SIZE);

    // Too big for the first region: first-fit walks into the donation.
    let big = allocate(8 * 1024);
    assert_eq!(big as usize, arena + 16 * 1024 + HEADER_SIZE);
    unsafe { free(big) };

    // The failure hook fires once per null return, after the critical
    // section has been left.
    set_alloc_fail_hook(record_failure);
    assert!(allocate(1 << 30).is_null());
    assert_eq!(FAILED_SIZE.load(Ordering::SeqCst), 1 << 30);

    // The GlobalAlloc adapter routes strong alignments through the
    // aligned path.
    let layout = Layout::from_size_align(96, 64).unwrap();
    let g = unsafe { GlobalHeap.alloc(layout) };
    assert!(!g.is_null());
    assert_eq!(g as usize % 64, 0);
    unsafe { GlobalHeap.dealloc(g, layout) };

    assert!(min_ever_free_bytes() <= free_bytes());
    print_free_list();
}
