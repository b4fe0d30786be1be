//! Isolation request configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::kind::{NamespaceKind, NamespaceSet};

/// Mount propagation applied to `/` after creating a mount namespace
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    /// Nothing propagates in either direction
    #[default]
    Private,
    /// Mount events propagate both ways
    Shared,
    /// Mount events propagate from the host only
    Slave,
    /// Leave the inherited propagation alone
    Unchanged,
}

/// Id mapped to inside a new user namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdTarget {
    /// Map to 0
    Root,
    /// Map to the caller's effective id
    Current,
    /// Map to a specific id
    Id(u32),
}

/// `/proc/self/setgroups` control inside a new user namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SetGroups {
    /// Allow setgroups(2)
    Allow,
    /// Permanently deny setgroups(2)
    Deny,
}

impl SetGroups {
    /// Value written to the control file
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// What to isolate and how to prepare the isolated environment
///
/// Passed to [`Planner::plan`](crate::Planner::plan), which validates it
/// before anything touches the process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IsolationRequest {
    /// New namespaces to create
    pub namespaces: NamespaceSet,

    /// Existing namespaces to join, by handle path
    pub join: BTreeMap<NamespaceKind, PathBuf>,

    /// Bind-mount targets keeping created namespaces alive
    pub persist: BTreeMap<NamespaceKind, PathBuf>,

    /// Fork after the namespace operations
    pub fork: bool,

    /// Parent waits for the forked child
    pub wait: bool,

    /// Signal delivered to the child when the parent dies; forces a fork
    pub kill_child: Option<i32>,

    /// Mount a fresh proc filesystem here
    pub mount_proc: Option<PathBuf>,

    /// New filesystem root
    pub root: Option<PathBuf>,

    /// Working directory after the root switch
    pub working_dir: Option<PathBuf>,

    /// Propagation for a new mount namespace
    pub propagation: Propagation,

    /// Hostname for the UTS namespace
    pub hostname: Option<String>,

    /// Domain name for the UTS namespace
    pub domainname: Option<String>,

    /// Uid mapped inside a new user namespace
    pub map_user: Option<IdTarget>,

    /// Gid mapped inside a new user namespace
    pub map_group: Option<IdTarget>,

    /// setgroups(2) control for a new user namespace
    pub setgroups: Option<SetGroups>,

    /// Uid to switch to at the end of setup
    pub set_uid: Option<u32>,

    /// Gid to switch to at the end of setup
    pub set_gid: Option<u32>,

    /// Monotonic clock offset in seconds for a new time namespace
    pub monotonic_offset: Option<i64>,

    /// Boot-time clock offset in seconds for a new time namespace
    pub boottime_offset: Option<i64>,

    /// Raise the permitted capabilities as ambient ones in a new user
    /// namespace, so they survive exec
    pub keep_caps: bool,
}

impl IsolationRequest {
    /// Create an empty request
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request or drop creation of a namespace kind
    #[must_use]
    pub fn with_namespace(mut self, kind: NamespaceKind, enable: bool) -> Self {
        if enable {
            self.namespaces.insert(kind);
        } else {
            self.namespaces.remove(kind);
        }
        self
    }

    /// Create a new PID namespace
    #[must_use]
    pub fn with_pid(self, enable: bool) -> Self {
        self.with_namespace(NamespaceKind::Pid, enable)
    }

    /// Create a new mount namespace
    #[must_use]
    pub fn with_mount(self, enable: bool) -> Self {
        self.with_namespace(NamespaceKind::Mount, enable)
    }

    /// Create a new cgroup namespace
    #[must_use]
    pub fn with_cgroup(self, enable: bool) -> Self {
        self.with_namespace(NamespaceKind::Cgroup, enable)
    }

    /// Create a new IPC namespace
    #[must_use]
    pub fn with_ipc(self, enable: bool) -> Self {
        self.with_namespace(NamespaceKind::Ipc, enable)
    }

    /// Create a new UTS namespace
    #[must_use]
    pub fn with_uts(self, enable: bool) -> Self {
        self.with_namespace(NamespaceKind::Uts, enable)
    }

    /// Create a new network namespace
    #[must_use]
    pub fn with_net(self, enable: bool) -> Self {
        self.with_namespace(NamespaceKind::Net, enable)
    }

    /// Create a new time namespace
    #[must_use]
    pub fn with_time(self, enable: bool) -> Self {
        self.with_namespace(NamespaceKind::Time, enable)
    }

    /// Create a new user namespace
    #[must_use]
    pub fn with_user(self, enable: bool) -> Self {
        self.with_namespace(NamespaceKind::User, enable)
    }

    /// Join an existing namespace through its handle
    #[must_use]
    pub fn with_join(mut self, kind: NamespaceKind, reference: impl Into<PathBuf>) -> Self {
        self.join.insert(kind, reference.into());
        self
    }

    /// Keep a created namespace alive by bind-mounting it onto `target`
    #[must_use]
    pub fn with_persist(mut self, kind: NamespaceKind, target: impl Into<PathBuf>) -> Self {
        self.persist.insert(kind, target.into());
        self
    }

    /// Fork after the namespace operations
    #[must_use]
    pub fn with_fork(mut self, enable: bool) -> Self {
        self.fork = enable;
        self
    }

    /// Have the parent wait for the child
    #[must_use]
    pub fn with_wait(mut self, enable: bool) -> Self {
        self.wait = enable;
        self
    }

    /// Kill the child with `signal` when the parent dies
    #[must_use]
    pub fn with_kill_child(mut self, signal: i32) -> Self {
        self.kill_child = Some(signal);
        self
    }

    /// Mount a fresh proc filesystem at `path`
    #[must_use]
    pub fn with_mount_proc(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_proc = Some(path.into());
        self
    }

    /// Switch the filesystem root to `path`
    #[must_use]
    pub fn with_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.root = Some(path.into());
        self
    }

    /// Change to `path` once setup is done
    #[must_use]
    pub fn with_working_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(path.into());
        self
    }

    /// Set mount propagation for a new mount namespace
    #[must_use]
    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Set hostname for the UTS namespace
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Set domain name for the UTS namespace
    #[must_use]
    pub fn with_domainname(mut self, domainname: impl Into<String>) -> Self {
        self.domainname = Some(domainname.into());
        self
    }

    /// Map the caller to root in a new user namespace
    #[must_use]
    pub fn with_map_root_user(mut self) -> Self {
        self.map_user = Some(IdTarget::Root);
        self.map_group = Some(IdTarget::Root);
        self
    }

    /// Map the caller to its own ids in a new user namespace
    #[must_use]
    pub fn with_map_current_user(mut self) -> Self {
        self.map_user = Some(IdTarget::Current);
        self.map_group = Some(IdTarget::Current);
        self
    }

    /// Set the `/proc/self/setgroups` control
    #[must_use]
    pub fn with_setgroups(mut self, setgroups: SetGroups) -> Self {
        self.setgroups = Some(setgroups);
        self
    }

    /// Switch credentials at the end of setup
    #[must_use]
    pub fn with_credentials(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.set_uid = uid;
        self.set_gid = gid;
        self
    }

    /// Set time namespace clock offsets in seconds
    #[must_use]
    pub fn with_time_offsets(mut self, monotonic: Option<i64>, boottime: Option<i64>) -> Self {
        self.monotonic_offset = monotonic;
        self.boottime_offset = boottime;
        self
    }

    /// Keep capabilities across exec in a new user namespace
    #[must_use]
    pub fn with_keep_caps(mut self, keep_caps: bool) -> Self {
        self.keep_caps = keep_caps;
        self
    }

    /// Check if any namespace is created or joined
    #[must_use]
    pub fn has_any(&self) -> bool {
        !self.namespaces.is_empty() || !self.join.is_empty()
    }

    /// Kinds that are created or joined
    #[must_use]
    pub fn changed_namespaces(&self) -> NamespaceSet {
        self.join
            .keys()
            .copied()
            .fold(self.namespaces, |set, kind| set | kind)
    }
}
