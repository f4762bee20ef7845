// =============================================================================
// EmberRT — Critical Section Primitives (scheduler suspension)
// =============================================================================
//
// Targets without the interrupt-masking backend (RISC-V, Xtensa, and hosted
// test builds) form the critical section by suspending the cooperative
// scheduler through the RTOS hooks. The allocator is not interrupt-safe in
// this mode — interrupt handlers must not allocate.
//
// Whether a suspension is needed is decided from the live scheduler state,
// so bring-up code can reach the allocator before scheduling starts.
//
// =============================================================================

use crate::rtos;

/// Remembers whether this section actually suspended the scheduler.
pub(crate) struct IrqState {
    suspended: bool,
}

/// Suspends the scheduler when it is running.
#[inline]
pub(crate) fn critical_enter() -> IrqState {
    let hooks = rtos::hooks();
    let suspended = hooks.scheduler_started();
    if suspended {
        hooks.suspend_all();
    }
    IrqState { suspended }
}

/// Resumes the scheduler when this section suspended it.
#[inline]
pub(crate) fn critical_exit(state: IrqState) {
    if state.suspended {
        rtos::hooks().resume_all();
    }
}

/// Idles briefly; there is no interrupt to wait for in this mode.
#[inline]
pub(crate) fn wait_for_interrupt() {
    core::hint::spin_loop();
}
