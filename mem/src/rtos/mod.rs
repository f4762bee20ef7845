// =============================================================================
// EmberRT — RTOS Collaborator Surface
// =============================================================================
//
// The allocator sits below the rest of the system, so everything it needs
// from above arrives through one trait: scheduler state for the critical
// section and ownership records, task identity for diagnostics, a backtrace
// provider for the tracking layer, and the platform services consumed by
// the halt path.
//
// REGISTRATION:
//   The embedder installs its implementation once, early in bring-up, the
//   same way a `log` backend is installed:
//
//     struct Hooks;
//     impl RtosHooks for Hooks { /* ... */ }
//     static HOOKS: Hooks = Hooks;
//     emberrt_mem::rtos::set_hooks(&HOOKS);
//
//   Every method has a do-nothing default and the crate falls back to a
//   no-op implementation when none is registered, so the allocator works
//   before (and without) the scheduler — tracking records then simply carry
//   no owner and an all-zero backtrace.
//
// =============================================================================

pub mod irq;

use spin::Once;

// =============================================================================
// TaskHandle
// =============================================================================

/// Opaque handle of an RTOS task, as a raw handle address.
///
/// The tracking layer compares handles against freed payload addresses to
/// scrub owners whose task-control buffer was itself heap-allocated, so the
/// representation is deliberately the handle's address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TaskHandle(pub usize);

// =============================================================================
// RtosHooks
// =============================================================================

/// Services the surrounding RTOS provides to the memory core.
///
/// All methods are optional; the defaults describe a system with no
/// scheduler, no backtrace support and no platform power control.
pub trait RtosHooks: Sync {
    /// Whether the task scheduler has started. Gates scheduler suspension
    /// and owner recording.
    fn scheduler_started(&self) -> bool {
        false
    }

    /// Handle of the task currently executing, if any.
    fn current_task(&self) -> Option<TaskHandle> {
        None
    }

    /// Printable name of a task, for diagnostics.
    fn task_name(&self, _task: TaskHandle) -> Option<&'static str> {
        None
    }

    /// Captures up to `frames.len()` return addresses into `frames`,
    /// skipping the topmost `skip` frames (the allocator's own). Returns
    /// the number of frames written; zero (leaving the buffer untouched)
    /// is a legal answer for systems without an unwinder.
    fn capture_backtrace(&self, _skip: usize, _frames: &mut [usize]) -> usize {
        0
    }

    /// Suspends all task switching (critical-section backend on targets
    /// without interrupt masking).
    fn suspend_all(&self) {}

    /// Undoes [`suspend_all`](Self::suspend_all).
    fn resume_all(&self) {}

    /// Whether the caller is running in interrupt context, from the
    /// platform's interrupt-nesting counter.
    fn is_isr_context(&self) -> bool {
        false
    }

    /// Unregisters one IRQ at the interrupt controller. Called by the halt
    /// path for every IRQ still set in the shadow bitmap.
    fn unregister_irq(&self, _irq: u32) {}

    /// Publishes the final RTOS status word where the platform (and the
    /// cache-coherent outside world) can see it.
    fn publish_halt_status(&self) {}

    /// Releases any platform hardware this RTOS claimed during bring-up.
    fn release_hardware(&self) {}

    /// Raises the soft IRQ that tells the secure-monitor side we are done.
    fn raise_monitor_softirq(&self) {}
}

/// The fallback used until `set_hooks` is called.
struct NoopHooks;

impl RtosHooks for NoopHooks {}

static NOOP_HOOKS: NoopHooks = NoopHooks;
static HOOKS: Once<&'static dyn RtosHooks> = Once::new();

/// Installs the RTOS hooks. Only the first call takes effect.
pub fn set_hooks(hooks: &'static dyn RtosHooks) {
    HOOKS.call_once(|| hooks);
}

/// The registered hooks, or the no-op fallback.
pub(crate) fn hooks() -> &'static dyn RtosHooks {
    match HOOKS.get() {
        Some(hooks) => *hooks,
        None => &NOOP_HOOKS,
    }
}

/// Whether the current context is an interrupt handler, per the hooks.
pub fn is_isr_context() -> bool {
    hooks().is_isr_context()
}
