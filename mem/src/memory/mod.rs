// =============================================================================
// EmberRT — Memory Subsystem
// =============================================================================
//
// The allocator core, organized into layers:
//
//   block.rs     — block header, size word with packed allocated flag
//   free_list.rs — first-fit engine: search, split, coalesce, realloc
//   region.rs    — region registry: definition, donation, page reservation
//   detect.rs    — canaries, allocation tracking, leak scanning (feature)
//
// This module owns the heap singleton and the public entry points. Every
// entry point enters the critical-section shim (`sync::irqlock`) before
// touching heap state; the malloc-failure hook is the one thing that runs
// outside it.
//
// The heap initialises lazily: the first allocator call installs whatever
// the default region table holds at that point (`set_default_regions`,
// pre-heap `add_region` donations, minus `reserve_pages` carves). Bring-up
// code may instead call `define_regions` explicitly.
// =============================================================================

mod block;
#[cfg(feature = "memory-error-detection")]
mod detect;
mod free_list;
mod region;

pub use block::{HEADER_SIZE, MIN_BLOCK_SIZE, PLATFORM_ALIGNMENT};
#[cfg(feature = "memory-error-detection")]
pub use detect::ScanRegion;
pub use region::HeapRegion;

use core::alloc::{GlobalAlloc, Layout};

use crate::sync::irqlock::IrqLock;
use free_list::Heap;

/// The heap singleton. One address space, one heap.
static HEAP: IrqLock<Heap> = IrqLock::new(Heap::new());

/// Invoked once per failed allocation, outside the critical section.
static ALLOC_FAIL_HOOK: spin::Mutex<Option<fn(usize)>> = spin::Mutex::new(None);

// =============================================================================
// Allocation
// =============================================================================

/// Allocates `size` bytes aligned to [`PLATFORM_ALIGNMENT`].
///
/// Returns null when `size` is zero, unrepresentably large, or no free
/// block can satisfy it. On failure the allocation-failed hook runs after
/// the critical section ends; heap state is unchanged.
pub fn allocate(size: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    let ptr = HEAP.lock().allocate(size);
    if ptr.is_null() {
        notify_alloc_failed(size);
    }
    ptr
}

/// Allocates `size` bytes whose payload address is aligned to
/// `align_mask + 1`, which must be a power of two (asserted). The platform
/// alignment is the floor: weaker requests are strengthened to it.
pub fn allocate_aligned(size: usize, align_mask: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    let ptr = HEAP.lock().allocate_aligned(size, align_mask);
    if ptr.is_null() {
        notify_alloc_failed(size);
    }
    ptr
}

/// Carves `size` bytes aligned to `align_mask + 1` with **no** header
/// offset: the returned pointer is the block itself.
///
/// The carve is one-shot and non-collectable — it never re-enters the free
/// list, carries no canaries and no tracking record, and passing it to
/// [`free`] is a fatal error. Intended for MMU-adjacent structures reserved
/// after the heap has gone live; prefer [`reserve_pages`] before it.
pub fn allocate_reserved_aligned(size: usize, align_mask: usize) -> *mut u8 {
    if size == 0 {
        return core::ptr::null_mut();
    }
    HEAP.lock().allocate_reserved_aligned(size, align_mask)
}

/// Returns an allocation to the heap. Null is tolerated as a no-op.
///
/// # Safety
/// `ptr` must be null or a pointer previously returned by [`allocate`],
/// [`allocate_aligned`] or [`reallocate`] and not freed since.
///
/// # Panics
/// Asserts on double frees and corrupted headers.
pub unsafe fn free(ptr: *mut u8) {
    unsafe { HEAP.lock().free(ptr) }
}

/// Grows or shrinks an allocation, copying the payload and zero-filling any
/// growth. Null `ptr` behaves like [`allocate`]; zero `size` behaves like
/// [`free`] and returns null. When the new allocation fails, null is
/// returned and the old block remains valid.
///
/// # Safety
/// As for [`free`].
pub unsafe fn reallocate(ptr: *mut u8, size: usize) -> *mut u8 {
    let result = unsafe { HEAP.lock().reallocate(ptr, size) };
    if result.is_null() && size != 0 {
        notify_alloc_failed(size);
    }
    result
}

// =============================================================================
// Region management
// =============================================================================

/// One-shot heap definition from `regions` (ascending address order, an
/// entry with `len == 0` terminates early), or from the default table when
/// `None`.
///
/// # Safety
/// Every region must be exclusively owned, writable RAM reserved for the
/// heap's lifetime.
///
/// # Panics
/// Panics when called twice or when nothing usable was supplied.
pub unsafe fn define_regions(regions: Option<&[HeapRegion]>) {
    unsafe { HEAP.lock().define_regions(regions) }
}

/// Replaces the default region table consumed by lazy initialisation and
/// [`reserve_pages`]. Typically called by bring-up code with the span the
/// linker script reserved (`_heap_start`/`_heap_len`).
///
/// # Safety
/// As for [`define_regions`].
pub unsafe fn set_default_regions(regions: &[HeapRegion]) {
    unsafe { HEAP.lock().set_default_regions(regions) }
}

/// Donates a contiguous region to the heap. Before first use the region
/// only joins the default table; on a live heap it is spliced into the free
/// list (interior) or appended by relocating the end sentinel.
///
/// # Safety
/// The region must be exclusively owned, writable RAM disjoint from all
/// previously donated regions.
pub unsafe fn add_region(start: *mut u8, len: usize) {
    unsafe { HEAP.lock().add_region(start, len) }
}

/// Reserves page-granular memory from the default regions before the heap
/// is defined. Returns a 4096-aligned base, or null when no pending region
/// can satisfy the reservation.
///
/// # Panics
/// Panics when `size` is not a multiple of 4096 or the heap already exists.
pub fn reserve_pages(size: usize) -> *mut u8 {
    HEAP.lock().reserve_pages(size)
}

// =============================================================================
// Statistics and diagnostics
// =============================================================================

/// Free bytes remaining (free-block headers included).
pub fn free_bytes() -> usize {
    HEAP.lock().free_bytes()
}

/// The low-water mark of [`free_bytes`] since the heap was defined.
pub fn min_ever_free_bytes() -> usize {
    HEAP.lock().min_ever_free_bytes()
}

/// Total bytes donated to the heap, after alignment.
pub fn total_heap_bytes() -> usize {
    HEAP.lock().total_bytes()
}

/// Dumps the free-list chain and its total through the log sink.
pub fn print_free_list() {
    HEAP.lock().print_free_list();
}

/// Installs the allocation-failure hook, invoked exactly once per failed
/// allocation with the requested size, outside the critical section.
pub fn set_alloc_fail_hook(hook: fn(usize)) {
    *ALLOC_FAIL_HOOK.lock() = Some(hook);
}

fn notify_alloc_failed(size: usize) {
    log::error!("heap allocation of {size} bytes failed");
    print_free_list();
    let hook = *ALLOC_FAIL_HOOK.lock();
    if let Some(hook) = hook {
        hook(size);
    }
}

// =============================================================================
// Error detection entry points
// =============================================================================

/// Checks every free-list header and every tracked allocation against the
/// canary patterns. Returns the number of violations found in tracked
/// blocks (each one logged); free-list corruption asserts.
#[cfg(feature = "memory-error-detection")]
pub fn check_integrity() -> usize {
    HEAP.lock().check_integrity()
}

/// Checks one allocation's canaries. Returns 1 (and logs the damage, with
/// owner and backtrace when tracked) on a violation, else 0.
///
/// # Safety
/// `payload` must point at a live allocation of this heap.
#[cfg(feature = "memory-error-detection")]
pub unsafe fn check_node(payload: *mut u8) -> usize {
    unsafe { HEAP.lock().check_node(payload) }
}

/// Conservative leak scan: reports and counts every tracked allocation
/// whose payload address appears in no other live payload and no declared
/// static region. References held only in registers or unscanned task
/// stacks are invisible to the scan, so findings are advisory.
#[cfg(feature = "memory-error-detection")]
pub fn memory_scan() -> usize {
    HEAP.lock().memory_scan()
}

/// Declares the static RAM regions (BSS/DATA) the leak scanner searches.
///
/// # Safety
/// Every region must stay readable for the program's lifetime.
#[cfg(feature = "memory-error-detection")]
pub unsafe fn declare_static_regions(regions: &[ScanRegion]) {
    HEAP.lock().declare_static_regions(regions)
}

// =============================================================================
// GlobalAlloc adapter
// =============================================================================

/// Adapter exposing the heap as a [`GlobalAlloc`], so the embedder can
/// back `alloc::boxed::Box`, `alloc::vec::Vec` and friends with it:
///
/// ```ignore
/// #[global_allocator]
/// static ALLOCATOR: emberrt_mem::GlobalHeap = emberrt_mem::GlobalHeap;
///
/// extern crate alloc;
/// ```
///
/// The heap must have regions donated before the first allocation arrives.
pub struct GlobalHeap;

// SAFETY: The heap singleton behind the critical-section shim satisfies the
// GlobalAlloc contract: unique live pointers, layout-compatible alignment.
unsafe impl GlobalAlloc for GlobalHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= PLATFORM_ALIGNMENT {
            allocate(layout.size())
        } else {
            allocate_aligned(layout.size(), layout.align() - 1)
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { free(ptr) }
    }
}
