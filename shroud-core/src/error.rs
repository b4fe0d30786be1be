//! Error types for Shroud

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Shroud error types
///
/// Everything except [`Error::Configuration`] is raised while executing a
/// plan, after earlier steps may already have changed the process. Those
/// changes are never rolled back.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The isolation request is contradictory or incomplete
    #[error("Invalid isolation request: {reason}")]
    Configuration {
        /// Why the request was rejected
        reason: String,
    },

    /// Entering an existing namespace failed
    #[error("Failed to join {kind} namespace via {}: {source}", reference.display())]
    NamespaceJoin {
        /// Namespace kind being joined
        kind: &'static str,
        /// Namespace handle that was opened
        reference: PathBuf,
        /// Underlying OS error
        source: io::Error,
    },

    /// unshare(2) failed
    #[error("Failed to create namespaces [{namespaces}]: {source}")]
    NamespaceCreate {
        /// Namespace kinds requested in the single unshare call
        namespaces: String,
        /// Underlying OS error
        source: io::Error,
    },

    /// fork(2) failed; no child exists
    #[error("Fork failed: {source}")]
    Fork {
        /// Underlying OS error
        source: io::Error,
    },

    /// A mount operation failed
    #[error("Failed to mount {}: {source}", target.display())]
    Mount {
        /// Mount point
        target: PathBuf,
        /// Underlying OS error
        source: io::Error,
    },

    /// chroot(2) or the following chdir(2) failed
    #[error("Failed to switch root to {}: {source}", path.display())]
    RootSwitch {
        /// Target directory
        path: PathBuf,
        /// Underlying OS error
        source: io::Error,
    },

    /// Writing time namespace offsets failed
    #[error("Failed to set time namespace offsets: {source}")]
    TimeOffsets {
        /// Underlying OS error
        source: io::Error,
    },

    /// Writing a uid/gid map or the setgroups control failed
    #[error("Failed to write {}: {source}", file.display())]
    IdMapping {
        /// Control file under /proc/self
        file: PathBuf,
        /// Underlying OS error
        source: io::Error,
    },

    /// Changing process credentials or attributes failed
    #[error("{operation} failed: {source}")]
    Credentials {
        /// Operation that failed
        operation: &'static str,
        /// Underlying OS error
        source: io::Error,
    },

    /// Setting the hostname or domain name failed
    #[error("Failed to set {field}: {source}")]
    Hostname {
        /// `hostname` or `domainname`
        field: &'static str,
        /// Underlying OS error
        source: io::Error,
    },

    /// Bind-mounting a namespace file for persistence failed
    #[error("Failed to persist namespace: {message}")]
    Persist {
        /// Error message
        message: String,
    },

    /// Waiting for the forked child failed
    #[error("Wait failed: {source}")]
    Wait {
        /// Underlying OS error
        source: io::Error,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// System error from nix
    #[error("System error: {0}")]
    System(#[from] nix::Error),
}

impl Error {
    /// Build a configuration error
    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    /// Name of the step class that produced this error
    #[must_use]
    pub const fn step_name(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "plan",
            Self::NamespaceJoin { .. } => "join-namespace",
            Self::NamespaceCreate { .. } => "create-namespaces",
            Self::Fork { .. } => "fork",
            Self::Mount { .. } => "mount",
            Self::RootSwitch { .. } => "switch-root",
            Self::TimeOffsets { .. } => "time-offsets",
            Self::IdMapping { .. } => "id-mapping",
            Self::Credentials { .. } => "credentials",
            Self::Hostname { .. } => "hostname",
            Self::Persist { .. } => "persist",
            Self::Wait { .. } => "wait",
            Self::Io(_) | Self::System(_) => "system",
        }
    }

    /// Raw OS error code, when one is attached
    #[must_use]
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::NamespaceJoin { source, .. }
            | Self::NamespaceCreate { source, .. }
            | Self::Fork { source }
            | Self::Mount { source, .. }
            | Self::RootSwitch { source, .. }
            | Self::TimeOffsets { source }
            | Self::IdMapping { source, .. }
            | Self::Credentials { source, .. }
            | Self::Hostname { source, .. }
            | Self::Wait { source }
            | Self::Io(source) => source.raw_os_error(),
            Self::System(errno) => Some(*errno as i32),
            Self::Configuration { .. } | Self::Persist { .. } => None,
        }
    }

    /// True if the error was raised before any syscall was issued
    #[must_use]
    pub const fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }
}

/// Result type alias for Shroud operations
pub type Result<T> = std::result::Result<T, Error>;
