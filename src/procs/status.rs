//! Exit outcomes of pipeline stages.

use crate::signals::signal_name;
use nix::sys::wait::WaitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    Exited(i32),
    Signaled { signo: i32, core: bool },
}

impl ExitOutcome {
    pub fn from_wait(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitOutcome::Exited(code)),
            WaitStatus::Signaled(_, sig, core) => Some(ExitOutcome::Signaled {
                signo: sig as i32,
                core,
            }),
            _ => None,
        }
    }

    /// Return code in the subprocess convention: negative signal number
    /// for signal deaths.
    pub fn returncode(&self) -> i32 {
        match self {
            ExitOutcome::Exited(code) => *code,
            ExitOutcome::Signaled { signo, .. } => -signo,
        }
    }

    pub fn is_signaled(&self) -> bool {
        matches!(self, ExitOutcome::Signaled { .. })
    }

    pub fn signal(&self) -> Option<(String, bool)> {
        match self {
            ExitOutcome::Signaled { signo, core } => Some((signal_name(*signo), *core)),
            ExitOutcome::Exited(_) => None,
        }
    }
}

/// Process exit status for a return code: 128+N for signal deaths.
pub fn shell_exit_code(returncode: i32) -> i32 {
    if returncode < 0 {
        128 - returncode
    } else {
        returncode
    }
}

/// Terminal message for a signal death, or `None` for signals that are
/// reported silently (interrupts and broken pipes).
pub fn signal_message(signo: i32, core: bool) -> Option<String> {
    let base = match signo {
        libc::SIGINT | libc::SIGPIPE => return None,
        libc::SIGABRT => "Aborted".to_string(),
        libc::SIGBUS => "Bus error".to_string(),
        libc::SIGFPE => "Floating point exception".to_string(),
        libc::SIGHUP => "Hangup".to_string(),
        libc::SIGILL => "Illegal instruction".to_string(),
        libc::SIGKILL => "Killed".to_string(),
        libc::SIGQUIT => "Quit".to_string(),
        libc::SIGSEGV => "Segmentation fault".to_string(),
        libc::SIGSTOP | libc::SIGTSTP => "Stopped".to_string(),
        libc::SIGTERM => "Terminated".to_string(),
        libc::SIGTRAP => "Trace/breakpoint trap".to_string(),
        other => format!("Killed by {}", signal_name(other)),
    };
    Some(if core {
        format!("{} (core dumped)", base)
    } else {
        base
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_returncode_conventions() {
        assert_eq!(ExitOutcome::Exited(3).returncode(), 3);
        let killed = ExitOutcome::Signaled {
            signo: libc::SIGTERM,
            core: false,
        };
        assert_eq!(killed.returncode(), -libc::SIGTERM);
        assert_eq!(shell_exit_code(killed.returncode()), 128 + libc::SIGTERM);
        assert_eq!(killed.signal(), Some(("SIGTERM".to_string(), false)));
    }

    #[test]
    fn test_signal_messages() {
        assert_eq!(signal_message(libc::SIGTERM, false).as_deref(), Some("Terminated"));
        assert_eq!(
            signal_message(libc::SIGSEGV, true).as_deref(),
            Some("Segmentation fault (core dumped)")
        );
        assert_eq!(signal_message(libc::SIGPIPE, false), None);
        assert_eq!(signal_message(libc::SIGINT, false), None);
    }
}
