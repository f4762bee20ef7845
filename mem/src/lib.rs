// =============================================================================
// EmberRT — Memory Core
// =============================================================================
//
// The dynamic memory allocator of the EmberRT real-time environment for
// bare-metal ARM/ARM64/RISC-V/Xtensa targets. One logical heap is assembled
// from any number of physically disjoint RAM regions and serves
// arbitrary-size, arbitrarily-aligned allocations to kernel and application
// code alike.
//
// Subsystems:
//   memory — multi-region first-fit free-list engine with splitting,
//            coalescing, aligned and reserved carves, page reservation and
//            dynamic region donation; plus the opt-in error-detection layer
//            (canaries, per-allocation tracking, conservative leak scan).
//   sync   — the critical-section shim every public entry point runs under.
//   arch   — per-target interrupt masking (ARM/ARM64) or scheduler
//            suspension (everything else).
//   rtos   — the one trait through which the surrounding RTOS provides
//            scheduler state, task identity, backtraces and the platform
//            halt services; plus the IRQ shadow bitmap.
//
// The allocator never blocks and never yields: a call either succeeds,
// returns null, or asserts on a caller bug (double free, corrupt header,
// misuse of a one-shot API). See each module header for the details.
//
// =============================================================================

#![no_std]

mod arch;
pub mod memory;
pub mod rtos;
pub mod sync;

pub use memory::{
    GlobalHeap, HEADER_SIZE, HeapRegion, MIN_BLOCK_SIZE, PLATFORM_ALIGNMENT, add_region, allocate,
    allocate_aligned, allocate_reserved_aligned, define_regions, free, free_bytes,
    min_ever_free_bytes, print_free_list, reallocate, reserve_pages, set_alloc_fail_hook,
    set_default_regions, total_heap_bytes,
};

#[cfg(feature = "memory-error-detection")]
pub use memory::{ScanRegion, check_integrity, check_node, declare_static_regions, memory_scan};
