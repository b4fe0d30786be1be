//! Process identity and termination types

use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ProcessId(i32);

impl ProcessId {
    /// Create from raw PID
    #[must_use]
    pub const fn from_raw(pid: i32) -> Self {
        Self(pid)
    }

    /// Get the current process ID
    ///
    /// Inside a PID namespace this is the namespace-local identifier.
    #[must_use]
    pub fn current() -> Self {
        nix::unistd::getpid().into()
    }

    /// Convert to `nix::unistd::Pid`
    #[must_use]
    pub const fn as_nix_pid(self) -> nix::unistd::Pid {
        nix::unistd::Pid::from_raw(self.0)
    }

    /// Get raw PID value
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// Namespace-init of a PID namespace
    #[must_use]
    pub const fn is_init(self) -> bool {
        self.0 == 1
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<nix::unistd::Pid> for ProcessId {
    fn from(pid: nix::unistd::Pid) -> Self {
        Self(pid.as_raw())
    }
}

impl From<ProcessId> for nix::unistd::Pid {
    fn from(pid: ProcessId) -> Self {
        Self::from_raw(pid.0)
    }
}

/// How a waited-for child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// Normal exit with a status code
    Exited(i32),
    /// Killed by a signal
    Signaled(Signal),
}

impl ChildExit {
    /// Shell-style exit code: the status itself, or 128 + signal number
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => 128 + signal as i32,
        }
    }

    /// True for a zero exit status
    #[must_use]
    pub const fn success(self) -> bool {
        matches!(self, Self::Exited(0))
    }
}

impl fmt::Display for ChildExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "terminated by {signal}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_id() {
        let pid = ProcessId::from_raw(123);
        assert_eq!(pid.as_raw(), 123);
        assert!(!pid.is_init());

        let nix_pid = pid.as_nix_pid();
        assert_eq!(nix_pid.as_raw(), 123);
        assert_eq!(ProcessId::from(nix_pid), pid);
    }

    #[test]
    fn test_process_id_serde() {
        let pid = ProcessId::from_raw(1);
        let json = serde_json::to_string(&pid).unwrap();
        assert_eq!(json, "1");
        assert!(serde_json::from_str::<ProcessId>(&json).unwrap().is_init());
    }

    #[test]
    fn test_current_matches_std() {
        #[allow(clippy::cast_possible_wrap)]
        let expected = std::process::id() as i32;
        assert_eq!(ProcessId::current().as_raw(), expected);
    }

    #[test]
    fn test_child_exit_codes() {
        assert_eq!(ChildExit::Exited(3).code(), 3);
        assert!(ChildExit::Exited(0).success());
        assert_eq!(ChildExit::Signaled(Signal::SIGKILL).code(), 137);
        assert!(!ChildExit::Signaled(Signal::SIGTERM).success());
        assert_eq!(
            ChildExit::Signaled(Signal::SIGTERM).to_string(),
            "terminated by SIGTERM"
        );
    }
}
