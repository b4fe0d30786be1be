//! Namespace kinds and sets of them

use nix::sched::CloneFlags;
use serde::{Deserialize, Serialize};
use shroud_core::{Error, Result};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// A kind of Linux namespace
///
/// Variants are declared in the order existing namespaces are joined: the
/// user namespace first so the capabilities it grants apply to the rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    /// User and group ids
    User,
    /// Cgroup root directory
    Cgroup,
    /// System V IPC and POSIX message queues
    Ipc,
    /// Hostname and NIS domain name
    Uts,
    /// Network stack
    Net,
    /// Process ids
    Pid,
    /// Mount table
    Mount,
    /// Boot and monotonic clocks
    Time,
}

impl NamespaceKind {
    /// Every kind, in join order
    pub const ALL: [Self; 8] = [
        Self::User,
        Self::Cgroup,
        Self::Ipc,
        Self::Uts,
        Self::Net,
        Self::Pid,
        Self::Mount,
        Self::Time,
    ];

    /// Flag passed to unshare(2) and setns(2)
    #[must_use]
    pub const fn clone_flag(self) -> CloneFlags {
        match self {
            Self::User => CloneFlags::CLONE_NEWUSER,
            Self::Cgroup => CloneFlags::CLONE_NEWCGROUP,
            Self::Ipc => CloneFlags::CLONE_NEWIPC,
            Self::Uts => CloneFlags::CLONE_NEWUTS,
            Self::Net => CloneFlags::CLONE_NEWNET,
            Self::Pid => CloneFlags::CLONE_NEWPID,
            Self::Mount => CloneFlags::CLONE_NEWNS,
            Self::Time => CloneFlags::from_bits_retain(libc::CLONE_NEWTIME),
        }
    }

    /// Entry name under `/proc/<pid>/ns/`
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Cgroup => "cgroup",
            Self::Ipc => "ipc",
            Self::Uts => "uts",
            Self::Net => "net",
            Self::Pid => "pid",
            Self::Mount => "mnt",
            Self::Time => "time",
        }
    }

    /// Entry that refers to the namespace new children will be placed in
    ///
    /// PID and time namespaces created by unshare(2) only apply to children,
    /// so the caller's own `pid`/`time` entries still point at the old ones.
    #[must_use]
    pub const fn children_proc_name(self) -> &'static str {
        match self {
            Self::Pid => "pid_for_children",
            Self::Time => "time_for_children",
            other => other.proc_name(),
        }
    }

    /// Whether unshare(2) of this kind only affects processes forked later
    #[must_use]
    pub const fn applies_to_children_only(self) -> bool {
        matches!(self, Self::Pid | Self::Time)
    }

    /// Path of this namespace's handle for a process
    #[must_use]
    pub fn proc_path(self, pid: &str) -> PathBuf {
        PathBuf::from(format!("/proc/{pid}/ns/{}", self.proc_name()))
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

impl FromStr for NamespaceKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "cgroup" => Ok(Self::Cgroup),
            "ipc" => Ok(Self::Ipc),
            "uts" => Ok(Self::Uts),
            "net" | "network" => Ok(Self::Net),
            "pid" => Ok(Self::Pid),
            "mnt" | "mount" => Ok(Self::Mount),
            "time" => Ok(Self::Time),
            other => Err(Error::configuration(format!(
                "unknown namespace kind '{other}'"
            ))),
        }
    }
}

/// A set of namespace kinds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<NamespaceKind>", into = "Vec<NamespaceKind>")]
pub struct NamespaceSet(u8);

impl NamespaceSet {
    /// No namespaces
    pub const NONE: Self = Self(0);

    const fn bit(kind: NamespaceKind) -> u8 {
        1 << kind as u8
    }

    /// Set holding a single kind
    #[must_use]
    pub const fn only(kind: NamespaceKind) -> Self {
        Self(Self::bit(kind))
    }

    /// Check if a kind is in the set
    #[must_use]
    pub const fn contains(self, kind: NamespaceKind) -> bool {
        self.0 & Self::bit(kind) != 0
    }

    /// Add a kind
    pub const fn insert(&mut self, kind: NamespaceKind) {
        self.0 |= Self::bit(kind);
    }

    /// Remove a kind
    pub const fn remove(&mut self, kind: NamespaceKind) {
        self.0 &= !Self::bit(kind);
    }

    /// Check if the set is empty
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of kinds in the set
    #[must_use]
    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// Kinds in join order
    pub fn iter(self) -> impl Iterator<Item = NamespaceKind> {
        NamespaceKind::ALL
            .into_iter()
            .filter(move |kind| self.contains(*kind))
    }

    /// Combined flags for a single unshare(2) call
    #[must_use]
    pub fn to_clone_flags(self) -> CloneFlags {
        self.iter()
            .fold(CloneFlags::empty(), |flags, kind| flags | kind.clone_flag())
    }
}

impl std::ops::BitOr for NamespaceSet {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOr<NamespaceKind> for NamespaceSet {
    type Output = Self;

    fn bitor(self, rhs: NamespaceKind) -> Self {
        Self(self.0 | Self::bit(rhs))
    }
}

impl FromIterator<NamespaceKind> for NamespaceSet {
    fn from_iter<I: IntoIterator<Item = NamespaceKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::NONE, |set, kind| set | kind)
    }
}

impl From<Vec<NamespaceKind>> for NamespaceSet {
    fn from(kinds: Vec<NamespaceKind>) -> Self {
        kinds.into_iter().collect()
    }
}

impl From<NamespaceSet> for Vec<NamespaceKind> {
    fn from(set: NamespaceSet) -> Self {
        set.iter().collect()
    }
}

impl fmt::Display for NamespaceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(NamespaceKind::proc_name).collect();
        f.write_str(&names.join(","))
    }
}
