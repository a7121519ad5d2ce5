//! Signal handling for duosh
//!
//! Provides the signal plumbing used by pipelines and job control:
//! - SIGINT (Ctrl+C): raises the session interrupt flag
//! - SIGTSTP (Ctrl+Z): noted so the foreground job can be stopped
//! - kill/killpg helpers for stop, continue, interrupt and terminate

use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Flag indicating SIGTSTP was received (set by signal handler)
pub static SIGTSTP_RECEIVED: AtomicBool = AtomicBool::new(false);

/// Shared interrupt request.
///
/// One lives on each session (raised by Ctrl+C) and one on each pipeline
/// (raised to cancel its in-process stages).
#[derive(Debug, Clone, Default)]
pub struct InterruptFlag(Arc<AtomicBool>);

impl InterruptFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag, returning whether it was raised.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Install the shell's handlers. SIGINT raises `interrupt`.
pub fn setup_signal_handlers(interrupt: InterruptFlag, job_control: bool) {
    if let Err(e) = ctrlc::set_handler(move || interrupt.raise()) {
        tracing::debug!("interrupt handler not installed: {}", e);
    }

    // Register SIGTSTP handler that sets the flag
    unsafe {
        let _ = signal_hook::low_level::register(signal_hook::consts::SIGTSTP, || {
            SIGTSTP_RECEIVED.store(true, Ordering::SeqCst);
        });
    }

    if job_control {
        // The shell must survive writing to the terminal while a job owns it
        unsafe {
            libc::signal(libc::SIGTTOU, libc::SIG_IGN);
            libc::signal(libc::SIGTTIN, libc::SIG_IGN);
        }
    }
}

/// Check if SIGTSTP was received and clear the flag
pub fn check_sigtstp() -> bool {
    SIGTSTP_RECEIVED.swap(false, Ordering::SeqCst)
}

/// Restore default dispositions in a freshly forked child.
///
/// Runs between fork and exec, so it only makes async-signal-safe calls.
pub(crate) fn reset_child_signals() {
    unsafe {
        for sig in [
            libc::SIGINT,
            libc::SIGQUIT,
            libc::SIGTSTP,
            libc::SIGTTOU,
            libc::SIGTTIN,
            libc::SIGPIPE,
        ] {
            libc::signal(sig, libc::SIG_DFL);
        }
    }
}

/// Send `sig` to a single process
pub fn signal_process(pid: i32, sig: Signal) -> Result<(), String> {
    kill(Pid::from_raw(pid), sig)
        .map_err(|e| format!("Failed to send {} to process {}: {}", sig.as_str(), pid, e))
}

/// Send `sig` to every process in a process group
pub fn signal_group(pgid: i32, sig: Signal) -> Result<(), String> {
    killpg(Pid::from_raw(pgid), sig)
        .map_err(|e| format!("Failed to send {} to group {}: {}", sig.as_str(), pgid, e))
}

/// Symbolic name for a signal number, e.g. `SIGTERM`.
pub fn signal_name(signo: i32) -> String {
    Signal::try_from(signo)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{}", signo))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_flag_take_clears() {
        let flag = InterruptFlag::new();
        let other = flag.clone();
        assert!(!flag.take());
        other.raise();
        assert!(flag.is_raised());
        assert!(flag.take());
        assert!(!other.is_raised());
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(signal_name(libc::SIGTERM), "SIGTERM");
        assert_eq!(signal_name(libc::SIGKILL), "SIGKILL");
        assert_eq!(signal_name(1000), "SIG1000");
    }
}
