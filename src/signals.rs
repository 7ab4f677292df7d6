//! Signal handling.
//!
//! Signals whose default action terminates the process are routed through the
//! event loop: the handler only records the exit status and stops the loop,
//! so cleanup runs on the main control flow. Signals whose default action
//! dumps core get a real handler that removes the diagnostic log and
//! re-raises with the default action restored.

use std::{io, ptr};

use calloop::{
    LoopHandle, RegistrationToken,
    signals::{Signal, Signals},
};

use crate::{ManagerError, Result, diagnostics};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalDisposition {
    GracefulTerminate,
    AbortWithCleanup,
}

pub const TERMINATE_SIGNALS: [Signal; 5] = [
    Signal::SIGHUP,
    Signal::SIGINT,
    Signal::SIGALRM,
    Signal::SIGTERM,
    Signal::SIGUSR1,
];

pub const CORE_SIGNALS: [libc::c_int; 5] = [
    libc::SIGQUIT,
    libc::SIGILL,
    libc::SIGABRT,
    libc::SIGFPE,
    libc::SIGSEGV,
];

pub fn disposition(signo: libc::c_int) -> Option<SignalDisposition> {
    if TERMINATE_SIGNALS.iter().any(|&signal| signal as libc::c_int == signo) {
        Some(SignalDisposition::GracefulTerminate)
    } else if CORE_SIGNALS.contains(&signo) {
        Some(SignalDisposition::AbortWithCleanup)
    } else {
        None
    }
}

/// Exit status of a process terminated by `signo`, shell convention.
pub fn exit_status(signo: libc::c_int) -> i32 {
    128 + signo
}

/// Loop state that can be asked to terminate.
pub trait Terminate {
    fn terminate(&mut self, exit_code: i32);
}

/// Route the terminate-class signals through the loop. The source does not
/// keep the loop alive.
pub fn install_terminate_handlers<D: Terminate + 'static>(
    handle: &LoopHandle<'static, D>,
) -> Result<RegistrationToken> {
    let signals = Signals::new(&TERMINATE_SIGNALS)
        .map_err(|err| ManagerError::EventLoop(format!("failed to create signal source: {err}")))?;
    handle
        .insert_source(signals, |event, _, state: &mut D| {
            let signo = event.signal() as libc::c_int;
            tracing::info!(signal = ?event.signal(), "terminating on signal");
            state.terminate(exit_status(signo));
        })
        .map_err(|err| ManagerError::EventLoop(format!("failed to watch signals: {err}")))
}

extern "C" fn handle_core_signal(
    signo: libc::c_int,
    _info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    diagnostics::remove_artifact();
    // SA_RESETHAND restored the default action; SA_NODEFER lets it through.
    // Safety: raise is async-signal-safe.
    unsafe {
        libc::raise(signo);
    }
}

fn core_action() -> libc::sigaction {
    // Safety: an all-zero sigaction is a valid starting point.
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    action.sa_sigaction = handle_core_signal as *const () as libc::sighandler_t;
    action.sa_flags = libc::SA_SIGINFO | libc::SA_RESETHAND | libc::SA_NODEFER;
    // Safety: sa_mask is valid storage for a sigset_t.
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
    }
    action
}

/// Install the core-class handlers. The diagnostic log must already be
/// registered so the handler has nothing to allocate.
pub fn install_core_handlers() -> Result<()> {
    let action = core_action();
    for signo in CORE_SIGNALS {
        // Safety: `action` points to a fully initialized sigaction whose
        // handler only calls async-signal-safe functions.
        if unsafe { libc::sigaction(signo, &action, ptr::null_mut()) } != 0 {
            let err = io::Error::last_os_error();
            return Err(ManagerError::EventLoop(format!(
                "failed to install handler for signal {signo}: {err}"
            )));
        }
    }
    tracing::debug!("core signal handlers installed");
    Ok(())
}
