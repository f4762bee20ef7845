// =============================================================================
// EmberRT — Architecture Layer
// =============================================================================
//
// Per-target primitives for the critical-section shim. Exactly one backend
// is compiled in, selected by the target architecture:
//
//   aarch64   — save the DAIF exception masks and set the IRQ mask bit.
//               Allocator calls are legal from interrupt handlers, because
//               a handler that allocates cannot be re-entered while the
//               masks are set.
//   arm       — same scheme via CPSR/`cpsid i` on 32-bit ARM.
//   (others)  — RISC-V, Xtensa and hosted test builds suspend the
//               cooperative scheduler through the RTOS hooks instead. The
//               allocator is NOT interrupt-safe in this mode.
//
// Each backend exposes the same three functions; the `sync` layer composes
// them with a spin mutex into the `IrqLock` guarding the heap singleton.
// The suspension decision is made from the live scheduler state, so
// bring-up code may call into the allocator before scheduling starts.
//
// =============================================================================

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::{IrqState, critical_enter, critical_exit, wait_for_interrupt};

#[cfg(target_arch = "arm")]
mod arm;
#[cfg(target_arch = "arm")]
pub(crate) use arm::{IrqState, critical_enter, critical_exit, wait_for_interrupt};

#[cfg(not(any(target_arch = "aarch64", target_arch = "arm")))]
mod suspend;
#[cfg(not(any(target_arch = "aarch64", target_arch = "arm")))]
pub(crate) use suspend::{IrqState, critical_enter, critical_exit, wait_for_interrupt};
