// =============================================================================
// EmberRT — Memory-Error Detection Layer
// =============================================================================
//
// Compiled in only with the `memory-error-detection` feature. Three weapons
// against heap corruption and leaks:
//
// CANARIES:
//   Every block header carries a fixed 64-bit head pattern; every allocated
//   block additionally carries a tail pattern in its last machine word. An
//   out-of-bounds write lands on a canary long before it reaches the next
//   header's link words, so corruption is caught while the evidence still
//   points at the culprit. The free list is re-stamped on every insertion,
//   so freed memory keeps a detectable pattern as well.
//
// TRACKING TABLE:
//   A fixed pool of records, one per outstanding allocation: block address,
//   cached sizes, owning task and a short backtrace captured at allocation
//   time (skipping the allocator's own frames). Tracking is best-effort —
//   when the pool is exhausted further allocations simply go unrecorded.
//
// LEAK SCANNING:
//   A conservative mark-scan. An allocation counts as referenced when its
//   payload address appears, as a machine word, anywhere in another live
//   allocation's payload or in a declared static RAM region (BSS/DATA). The
//   bytes of the tracking table itself are excluded so its own records
//   cannot mask a leak. Values only held in CPU registers or unscanned task
//   stacks produce false leak reports; false "no leak" results do not occur
//   for scanned memory.
//
// Violations are diagnostics, not failures: they are counted and logged,
// and the allocator keeps running. Corruption of the free list itself is
// the one exception — that asserts, because every later operation would
// walk the damaged chain.
//
// =============================================================================

use core::mem;
use core::ptr::NonNull;

use super::block::{
    BlockHeader, HEAD_CANARY_PATTERN, HEADER_SIZE, Link, TAIL_CANARY_PATTERN, WORD_SIZE,
};
use super::free_list::Heap;
use crate::rtos::{self, TaskHandle};

/// Number of simultaneously tracked allocations.
pub(crate) const TRACK_CAPACITY: usize = 128;

/// Frames captured per allocation.
pub(crate) const BACKTRACE_DEPTH: usize = 5;

/// The allocator's own frames on top of every capture.
const BACKTRACE_SKIP: usize = 2;

/// Declarable static RAM regions (BSS, DATA, and friends).
const STATIC_REGION_SLOTS: usize = 4;

// =============================================================================
// ScanRegion
// =============================================================================

/// A static RAM span searched by the leak scanner, typically the BSS and
/// DATA segments as delimited by linker symbols.
#[derive(Clone, Copy, Debug)]
pub struct ScanRegion {
    /// Lowest address of the span.
    pub start: usize,
    /// Length of the span in bytes.
    pub len: usize,
}

impl ScanRegion {
    const EMPTY: Self = Self { start: 0, len: 0 };
}

// =============================================================================
// Tracking records
// =============================================================================

/// One outstanding allocation. A `None` block marks a free slot.
#[derive(Clone, Copy)]
struct TrackRecord {
    /// Header address of the tracked block.
    block: Option<NonNull<BlockHeader>>,
    /// Task that performed the allocation, when the scheduler was running.
    owner: Option<TaskHandle>,
    /// Cached block size (header and padding included).
    block_size: usize,
    /// The size the caller originally asked for.
    request_size: usize,
    /// Return addresses captured at allocation time; all-zero when no
    /// backtrace provider is installed.
    back_trace: [usize; BACKTRACE_DEPTH],
}

impl TrackRecord {
    const EMPTY: Self = Self {
        block: None,
        owner: None,
        block_size: 0,
        request_size: 0,
        back_trace: [0; BACKTRACE_DEPTH],
    };
}

/// The tracking pool plus the declared static scan regions.
pub(crate) struct TrackTable {
    records: [TrackRecord; TRACK_CAPACITY],
    static_regions: [ScanRegion; STATIC_REGION_SLOTS],
}

impl TrackTable {
    pub(crate) const fn new() -> Self {
        Self {
            records: [TrackRecord::EMPTY; TRACK_CAPACITY],
            static_regions: [ScanRegion::EMPTY; STATIC_REGION_SLOTS],
        }
    }
}

// =============================================================================
// Detection operations on the heap
// =============================================================================

impl Heap {
    /// Declares the static RAM regions the leak scanner walks.
    pub(crate) fn declare_static_regions(&mut self, regions: &[ScanRegion]) {
        assert!(regions.len() <= STATIC_REGION_SLOTS, "too many static scan regions");
        self.track.static_regions = [ScanRegion::EMPTY; STATIC_REGION_SLOTS];
        self.track.static_regions[..regions.len()].copy_from_slice(regions);
    }

    /// Stamps both canaries on a fresh allocation and records it in the
    /// first empty tracking slot, then re-stamps the free list.
    ///
    /// # Safety
    /// `block` must be a live allocated block of this heap.
    pub(crate) unsafe fn track_alloc(&mut self, block: NonNull<BlockHeader>, request: usize) {
        // SAFETY: The block was just carved out of a donated region.
        unsafe {
            let header = block.as_ptr();
            (*header).head_canary = HEAD_CANARY_PATTERN;
            let tail = (header as usize + (*header).size.bytes() - WORD_SIZE) as *mut usize;
            tail.write(TAIL_CANARY_PATTERN);

            let block_size = (*header).size.bytes();
            for record in &mut self.track.records {
                if record.block.is_none() {
                    record.block = Some(block);
                    record.block_size = block_size;
                    record.request_size = request;
                    record.back_trace = [0; BACKTRACE_DEPTH];
                    rtos::hooks().capture_backtrace(BACKTRACE_SKIP, &mut record.back_trace);
                    record.owner = if rtos::hooks().scheduler_started() {
                        rtos::hooks().current_task()
                    } else {
                        None
                    };
                    break;
                }
            }
            // Pool exhausted: the allocation still succeeds, just untracked.
        }

        self.refresh_free_canaries();
    }

    /// Drops the tracking record of a freed block. Owner handles equal to
    /// the freed payload address are scrubbed first — the buffer being freed
    /// may itself have been a task handle.
    ///
    /// # Safety
    /// `block` must be the header of the block being freed.
    pub(crate) unsafe fn track_free(&mut self, block: NonNull<BlockHeader>) {
        let payload = block.as_ptr() as usize + HEADER_SIZE;
        for record in &mut self.track.records {
            if record.owner == Some(TaskHandle(payload)) {
                record.owner = None;
            }
        }
        for record in &mut self.track.records {
            if record.block == Some(block) {
                *record = TrackRecord::EMPTY;
                break;
            }
        }
    }

    /// Rewrites the head canary of the list-head sentinel and every free
    /// block. Idempotent: a second pass leaves every header bit-identical.
    pub(crate) fn refresh_free_canaries(&mut self) {
        let mut node: *mut BlockHeader = &mut self.start;
        // SAFETY: The walk follows free-list links, which only reach live
        // headers; it stops before the end sentinel.
        unsafe {
            loop {
                (*node).head_canary = HEAD_CANARY_PATTERN;
                match (*node).link() {
                    Link::Next(next) => {
                        node = next.as_ptr();
                        if (*node).link() == Link::End {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }
    }

    /// Checks every free-list header and every tracked allocation.
    ///
    /// Returns the number of canary violations found in tracked blocks;
    /// each violation is logged with owner, addresses, sizes and backtrace.
    ///
    /// # Panics
    /// Asserts when a free-list header's canary is destroyed — the chain
    /// itself is no longer trustworthy at that point.
    pub(crate) fn check_integrity(&self) -> usize {
        let mut node: *const BlockHeader = &self.start;
        // SAFETY: As in `refresh_free_canaries`.
        unsafe {
            loop {
                assert!(
                    (*node).head_canary == HEAD_CANARY_PATTERN,
                    "free-list header canary destroyed"
                );
                match (*node).link() {
                    Link::Next(next) => {
                        node = next.as_ptr();
                        if (*node).link() == Link::End {
                            break;
                        }
                    }
                    _ => break,
                }
            }
        }

        let mut failures = 0;
        for record in &self.track.records {
            failures += self.check_record(record);
        }
        failures
    }

    /// Checks a single allocation's canaries, for callers at suspect sites.
    /// Returns 1 and logs the damage when either canary is broken, else 0.
    ///
    /// # Safety
    /// `payload` must point at a live allocation of this heap.
    pub(crate) unsafe fn check_node(&self, payload: *mut u8) -> usize {
        // SAFETY: Caller contract; the header prefixes the payload.
        unsafe {
            let header = payload.sub(HEADER_SIZE) as *const BlockHeader;
            let tail = (header as usize + (*header).size.bytes() - WORD_SIZE) as *const usize;
            if (*header).head_canary == HEAD_CANARY_PATTERN && tail.read() == TAIL_CANARY_PATTERN {
                return 0;
            }

            // Report through the tracking record when one exists; an
            // untracked block still counts, it just has no provenance.
            match self
                .track
                .records
                .iter()
                .find(|record| record.block.is_some_and(|block| block.as_ptr().cast_const() == header))
            {
                Some(record) => {
                    self.check_record(record);
                }
                None => {
                    log::error!(
                        "buffer overflow: untracked block, payload {:#x}",
                        payload as usize
                    );
                }
            }
            1
        }
    }

    /// Compares one record's canaries against the expected patterns,
    /// logging each mismatch. Returns the number of mismatches.
    fn check_record(&self, record: &TrackRecord) -> usize {
        let Some(block) = record.block else { return 0 };
        let header = block.as_ptr();
        let mut failures = 0;
        // SAFETY: Tracked blocks stay live until `track_free` clears the
        // record, and the cached size locates the tail inside the block.
        unsafe {
            if (*header).head_canary != HEAD_CANARY_PATTERN {
                self.report_overflow("HEAD", record);
                failures += 1;
            }
            let tail = (header as usize + record.block_size - WORD_SIZE) as *const usize;
            if tail.read() != TAIL_CANARY_PATTERN {
                self.report_overflow("TAIL", record);
                failures += 1;
            }
        }
        failures
    }

    /// Conservative leak scan over every tracked allocation.
    ///
    /// For each live allocation, its payload address is searched for in
    /// every other live payload, then in the declared static regions
    /// (excluding the tracking table's own bytes). Allocations with no
    /// reference anywhere are reported and counted.
    pub(crate) fn memory_scan(&self) -> usize {
        let mut leaks = 0;
        for (position, record) in self.track.records.iter().enumerate() {
            let Some(block) = record.block else { continue };
            let payload = block.as_ptr() as usize + HEADER_SIZE;

            let mut referenced = self.scan_live_allocations(position, payload);
            if !referenced {
                referenced = self.scan_static_regions(payload);
            }
            if !referenced {
                self.report_leak(record, payload);
                leaks += 1;
            }
        }
        leaks
    }

    /// Searches every other live payload for `needle`, word by word.
    fn scan_live_allocations(&self, skip: usize, needle: usize) -> bool {
        for (position, record) in self.track.records.iter().enumerate() {
            if position == skip {
                continue;
            }
            let Some(block) = record.block else { continue };
            let mut addr = block.as_ptr() as usize + HEADER_SIZE;
            let end = addr + record.request_size;
            while addr < end {
                // SAFETY: The span is the payload of a live allocation;
                // payloads are word-aligned.
                if unsafe { (addr as *const usize).read() } == needle {
                    return true;
                }
                addr += WORD_SIZE;
            }
        }
        false
    }

    /// Searches the declared static regions for `needle`, skipping the byte
    /// range of the tracking table so its records cannot mask a leak.
    fn scan_static_regions(&self, needle: usize) -> bool {
        let table_start = self.track.records.as_ptr() as usize;
        let table_end = table_start + mem::size_of_val(&self.track.records);

        for region in &self.track.static_regions {
            if region.len == 0 {
                continue;
            }
            let mut addr = (region.start + WORD_SIZE - 1) & !(WORD_SIZE - 1);
            let end = region.start + region.len;
            while addr + WORD_SIZE <= end {
                if addr < table_start || addr >= table_end {
                    // SAFETY: The embedder declared the span as readable
                    // static RAM; reads are word-aligned.
                    if unsafe { (addr as *const usize).read() } == needle {
                        return true;
                    }
                }
                addr += WORD_SIZE;
            }
        }
        false
    }

    fn report_overflow(&self, zone: &str, record: &TrackRecord) {
        let Some(block) = record.block else { return };
        let payload = block.as_ptr() as usize + HEADER_SIZE;
        // SAFETY: Tracked blocks stay live until their record is cleared.
        let block_size = unsafe { (*block.as_ptr()).size.bytes() };
        log::error!(
            "detected buffer overflow ({zone}): task owner ({}), buffer address {payload:#x}, request size {}, block size {block_size}",
            owner_name(record.owner),
            record.request_size,
        );
        log_backtrace(&record.back_trace);
    }

    fn report_leak(&self, record: &TrackRecord, payload: usize) {
        log::warn!(
            "detected buffer leak: task owner ({}), buffer address {payload:#x}, request size {}, block size {}",
            owner_name(record.owner),
            record.request_size,
            record.block_size,
        );
        log_backtrace(&record.back_trace);
    }
}

/// Resolves an owner handle to a printable name.
fn owner_name(owner: Option<TaskHandle>) -> &'static str {
    owner
        .and_then(|task| rtos::hooks().task_name(task))
        .unwrap_or("NULL")
}

/// Logs the non-zero frames of a captured backtrace.
fn log_backtrace(trace: &[usize; BACKTRACE_DEPTH]) {
    for &frame in trace.iter().filter(|&&frame| frame != 0) {
        log::error!("    call trace: {frame:#x}");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::region::HeapRegion;
    use crate::rtos::RtosHooks;
    use core::sync::atomic::{AtomicUsize, Ordering};

    /// Hook stub with a settable current task and a deterministic fake
    /// unwinder. Installed once for the whole test binary; tests that do
    /// not touch `CURRENT_TASK` see no owner, as without a scheduler.
    static CURRENT_TASK: AtomicUsize = AtomicUsize::new(0);

    struct TestHooks;

    impl RtosHooks for TestHooks {
        fn scheduler_started(&self) -> bool {
            true
        }

        fn current_task(&self) -> Option<TaskHandle> {
            match CURRENT_TASK.load(Ordering::Relaxed) {
                0 => None,
                handle => Some(TaskHandle(handle)),
            }
        }

        fn task_name(&self, _task: TaskHandle) -> Option<&'static str> {
            Some("worker")
        }

        fn capture_backtrace(&self, skip: usize, frames: &mut [usize]) -> usize {
            for (index, frame) in frames.iter_mut().enumerate() {
                *frame = 0x1000 + (skip + index) * 0x10;
            }
            frames.len()
        }
    }

    static TEST_HOOKS: TestHooks = TestHooks;

    #[repr(C, align(4096))]
    struct Arena<const N: usize>([u8; N]);

    impl<const N: usize> Arena<N> {
        fn new() -> Self {
            Self([0; N])
        }

        fn region(&mut self) -> HeapRegion {
            HeapRegion { start: self.0.as_mut_ptr(), len: N }
        }
    }

    fn heap_over(region: HeapRegion) -> Heap {
        let mut heap = Heap::new();
        unsafe { heap.define_regions(Some(&[region])) };
        heap
    }

    /// Offset of the tail canary within the payload of an allocation,
    /// read back from the block header in front of it.
    fn tail_offset(payload: *mut u8) -> usize {
        let header = (payload as usize - HEADER_SIZE) as *const BlockHeader;
        let size = unsafe { (*header).size.bytes() };
        size - HEADER_SIZE - WORD_SIZE
    }

    #[test]
    fn round_trip_keeps_canaries_intact() {
        let mut arena = Arena::<4096>::new();
        let mut heap = heap_over(arena.region());
        assert_eq!(heap.check_integrity(), 0);

        let payload = heap.allocate(48);
        // Writing exactly the requested bytes never touches a canary.
        unsafe { core::ptr::write_bytes(payload, 0xA5, 48) };
        assert_eq!(heap.check_integrity(), 0);
        assert_eq!(unsafe { heap.check_node(payload) }, 0);

        unsafe { heap.free(payload) };
        assert_eq!(heap.check_integrity(), 0);
    }

    #[test]
    fn tail_overflow_is_detected_and_counted() {
        let mut arena = Arena::<4096>::new();
        let mut heap = heap_over(arena.region());

        let payload = heap.allocate(16);
        let offset = tail_offset(payload);
        let original = unsafe { *payload.add(offset) };

        unsafe { *payload.add(offset) = !original };
        assert_eq!(unsafe { heap.check_node(payload) }, 1);
        assert_eq!(heap.check_integrity(), 1);

        // Restoring the byte clears the finding; detection is non-fatal.
        unsafe { *payload.add(offset) = original };
        assert_eq!(unsafe { heap.check_node(payload) }, 0);
        assert_eq!(heap.check_integrity(), 0);
        unsafe { heap.free(payload) };
    }

    #[test]
    fn head_underflow_is_detected() {
        let mut arena = Arena::<4096>::new();
        let mut heap = heap_over(arena.region());

        let payload = heap.allocate(16);
        let canary_offset =
            HEADER_SIZE - core::mem::offset_of!(BlockHeader, head_canary);
        let original = unsafe { *payload.sub(canary_offset) };

        unsafe { *payload.sub(canary_offset) = !original };
        assert_eq!(unsafe { heap.check_node(payload) }, 1);

        unsafe { *payload.sub(canary_offset) = original };
        assert_eq!(unsafe { heap.check_node(payload) }, 0);
        unsafe { heap.free(payload) };
    }

    #[test]
    fn canary_refresh_is_idempotent() {
        let mut arena = Arena::<4096>::new();
        let mut heap = heap_over(arena.region());

        let payload = heap.allocate(64);
        unsafe { heap.free(payload) };
        assert_eq!(heap.check_integrity(), 0);
        heap.refresh_free_canaries();
        heap.refresh_free_canaries();
        assert_eq!(heap.check_integrity(), 0);
    }

    #[test]
    fn conservative_scan_finds_orphaned_buffers() {
        let mut arena = Arena::<4096>::new();
        let mut heap = heap_over(arena.region());

        let a = heap.allocate(48);
        let b = heap.allocate(48);

        // Simulated BSS holding the only reference to b.
        let mut statics: [usize; 4] = [b as usize, 0, 0, 0];
        heap.declare_static_regions(&[ScanRegion {
            start: statics.as_ptr() as usize,
            len: core::mem::size_of_val(&statics),
        }]);

        // b's payload holds the only reference to a: nothing leaks.
        unsafe { (b as *mut usize).write(a as usize) };
        assert_eq!(heap.memory_scan(), 0);

        // Clearing b's payload orphans a.
        unsafe { (b as *mut usize).write(0) };
        assert_eq!(heap.memory_scan(), 1);

        // Dropping the static reference orphans b as well.
        statics[0] = 0;
        assert_eq!(heap.memory_scan(), 2);

        unsafe { heap.free(a) };
        unsafe { heap.free(b) };
        assert_eq!(heap.memory_scan(), 0);
    }

    #[test]
    fn tracking_pool_exhaustion_is_tolerated() {
        let mut arena = Arena::<{ 16 * 4096 }>::new();
        let mut heap = heap_over(arena.region());

        let mut blocks = [core::ptr::null_mut(); TRACK_CAPACITY + 2];
        for slot in blocks.iter_mut() {
            *slot = heap.allocate(16);
            assert!(!slot.is_null());
        }
        // The pool overflowed by two; allocation and integrity both survive.
        assert_eq!(heap.check_integrity(), 0);
        for &block in blocks.iter() {
            unsafe { heap.free(block) };
        }
        assert_eq!(heap.check_integrity(), 0);
        assert_eq!(heap.memory_scan(), 0);
    }

    #[test]
    fn owner_handles_are_scrubbed_when_their_buffer_is_freed() {
        rtos::set_hooks(&TEST_HOOKS);
        let mut arena = Arena::<4096>::new();
        let mut heap = heap_over(arena.region());

        // A heap-allocated buffer standing in for a task control block,
        // whose payload address doubles as the task handle.
        let task_buffer = heap.allocate(32);
        CURRENT_TASK.store(task_buffer as usize, Ordering::Relaxed);
        let tracked = heap.allocate(16);
        CURRENT_TASK.store(0, Ordering::Relaxed);

        let tracked_header = (tracked as usize - HEADER_SIZE) as *mut BlockHeader;
        let record_of = |heap: &Heap| {
            heap.track
                .records
                .iter()
                .find(|record| record.block.is_some_and(|block| block.as_ptr() == tracked_header))
                .copied()
                .expect("allocation is tracked")
        };

        let record = record_of(&heap);
        assert_eq!(record.owner, Some(TaskHandle(task_buffer as usize)));
        // The fake unwinder filled the whole capture.
        assert!(record.back_trace.iter().all(|&frame| frame != 0));

        // Freeing the task's own buffer must not leave dangling owner
        // handles behind in other records.
        unsafe { heap.free(task_buffer) };
        assert_eq!(record_of(&heap).owner, None);
        unsafe { heap.free(tracked) };
    }

    #[test]
    fn request_sized_payload_is_what_reallocate_copies() {
        // The payload available to the caller is the canonical block minus
        // header and tail word; reallocate must never copy the canary.
        let mut arena = Arena::<4096>::new();
        let mut heap = heap_over(arena.region());

        let p = heap.allocate(16);
        unsafe { core::ptr::write_bytes(p, 0x7E, 16) };
        let p2 = unsafe { heap.reallocate(p, 16) };
        assert_eq!(unsafe { heap.check_node(p2) }, 0);
        for i in 0..16 {
            assert_eq!(unsafe { *p2.add(i) }, 0x7E);
        }
        unsafe { heap.free(p2) };
    }
}
