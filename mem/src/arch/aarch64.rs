// =============================================================================
// EmberRT — Critical Section Primitives (ARM64)
// =============================================================================
//
// On ARM64 the critical section is built on the DAIF register: the four
// PSTATE exception-mask bits (Debug, SError, IRQ, FIQ). Entering saves the
// whole register and sets the IRQ mask; leaving restores the saved value
// exactly, so nested enter/exit pairs compose — a section opened with IRQs
// already masked leaves them masked.
//
// These compile to single MRS/MSR instructions with no function call
// overhead in release builds.
//
// =============================================================================

use bitflags::bitflags;

bitflags! {
    /// The PSTATE.DAIF exception-mask bits, as read by `mrs _, daif`.
    #[derive(Clone, Copy, Debug)]
    pub(crate) struct Daif: u64 {
        /// Debug exceptions masked.
        const DEBUG = 1 << 9;
        /// SError (asynchronous abort) masked.
        const SERROR = 1 << 8;
        /// IRQ masked.
        const IRQ = 1 << 7;
        /// FIQ masked.
        const FIQ = 1 << 6;
    }
}

/// Saved interrupt state to restore on critical-section exit.
pub(crate) struct IrqState(Daif);

/// Saves the current exception masks and masks IRQs on this core.
#[inline(always)]
pub(crate) fn critical_enter() -> IrqState {
    let daif: u64;
    // SAFETY: Reading DAIF is a side-effect-free observation; setting the
    // IRQ mask is always legal at the kernel's exception level and is
    // undone by `critical_exit`.
    unsafe {
        core::arch::asm!(
            "mrs {}, daif",
            out(reg) daif,
            options(nomem, nostack, preserves_flags)
        );
        core::arch::asm!("msr daifset, #2", options(nomem, nostack));
    }
    IrqState(Daif::from_bits_retain(daif))
}

/// Restores the exception masks saved by [`critical_enter`].
#[inline(always)]
pub(crate) fn critical_exit(state: IrqState) {
    // SAFETY: Writing back a previously read DAIF value returns the core to
    // the exact mask state it had before the critical section.
    unsafe {
        core::arch::asm!(
            "msr daif, {}",
            in(reg) state.0.bits(),
            options(nomem, nostack)
        );
    }
}

/// Parks the core until an interrupt (or a pending wake event) arrives.
#[inline(always)]
pub(crate) fn wait_for_interrupt() {
    // SAFETY: WFI is a hint instruction; it has no architectural effect
    // other than possibly entering a low-power state.
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
    }
}
