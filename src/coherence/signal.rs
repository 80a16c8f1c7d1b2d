//! SIGSEGV shim
//!
//! Installs the process-wide fault handler over the reserved range and
//! chains any fault outside it to the previously installed handler. The
//! handler body does nothing but extract the faulting address and call
//! [`Engine::handle_access`]; the primitives reachable from there are the
//! cache lock, the one-sided serializer and the backend's window
//! operations, which this engine permits in signal context the same way the
//! faulting thread could call them directly.
//!
//! [`Engine::handle_access`]: crate::runtime::Engine::handle_access

use once_cell::sync::OnceCell;

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

use crate::types::{DsmError, DsmResult};

/// The handler installed before ours, for chaining
static PREVIOUS: OnceCell<SigAction> = OnceCell::new();

/// Install the fault handler; call once, after the engine is installed
pub fn install_fault_handler() -> DsmResult<()> {
    let action = SigAction::new(
        SigHandler::SigAction(fault_handler),
        SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    let previous = unsafe { signal::sigaction(Signal::SIGSEGV, &action) }
        .map_err(|err| DsmError::Config(format!("installing the fault handler failed: {}", err)))?;
    PREVIOUS
        .set(previous)
        .map_err(|_| DsmError::Config("the fault handler is already installed".to_string()))?;
    Ok(())
}

extern "C" fn fault_handler(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    context: *mut libc::c_void,
) {
    let addr = unsafe { (*info).si_addr() } as usize;

    if let Some(engine) = crate::runtime::engine_opt() {
        if engine.owns_address(addr) {
            match engine.handle_access(addr) {
                Ok(()) => return,
                Err(err) => {
                    // The distributed state cannot be resumed; restoring the
                    // default disposition makes the retried access stop the
                    // process (and a debugger) at the original fault site
                    log::error!("fault at {:#x} could not be handled: {}", addr, err);
                    restore_default();
                    return;
                }
            }
        }
    }
    chain_previous(signum, info, context);
}

/// Forward a non-engine fault to whatever handler was there before
fn chain_previous(signum: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    match PREVIOUS.get().map(SigAction::handler) {
        Some(SigHandler::Handler(handler)) => handler(signum),
        Some(SigHandler::SigAction(handler)) => handler(signum, info, context),
        Some(SigHandler::SigIgn) => {}
        Some(SigHandler::SigDfl) | None => restore_default(),
    }
}

/// Restore the default disposition; returning re-runs the faulting access
fn restore_default() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    let _ = unsafe { signal::sigaction(Signal::SIGSEGV, &default) };
}
