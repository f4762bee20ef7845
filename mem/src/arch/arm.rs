// =============================================================================
// EmberRT — Critical Section Primitives (ARM, 32-bit)
// =============================================================================
//
// The 32-bit scheme mirrors ARM64: save CPSR, set the I bit with `cpsid i`,
// and restore only the control field on exit so the saved interrupt state
// comes back without touching the condition flags.
//
// =============================================================================

/// Saved CPSR to restore on critical-section exit.
pub(crate) struct IrqState(u32);

/// Saves CPSR and masks IRQs on this core.
#[inline(always)]
pub(crate) fn critical_enter() -> IrqState {
    let cpsr: u32;
    // SAFETY: Reading CPSR has no side effects; masking IRQs is undone by
    // `critical_exit`.
    unsafe {
        core::arch::asm!(
            "mrs {}, cpsr",
            out(reg) cpsr,
            options(nomem, nostack, preserves_flags)
        );
        core::arch::asm!("cpsid i", options(nomem, nostack));
    }
    IrqState(cpsr)
}

/// Restores the interrupt masks saved by [`critical_enter`].
#[inline(always)]
pub(crate) fn critical_exit(state: IrqState) {
    // SAFETY: Restoring the control field of a previously read CPSR value
    // returns the core to its prior mask state.
    unsafe {
        core::arch::asm!(
            "msr cpsr_c, {}",
            in(reg) state.0,
            options(nomem, nostack)
        );
    }
}

/// Parks the core until an interrupt arrives.
#[inline(always)]
pub(crate) fn wait_for_interrupt() {
    // SAFETY: WFI is a hint instruction with no architectural side effects.
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
    }
}
