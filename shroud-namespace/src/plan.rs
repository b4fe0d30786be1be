//! Turning an isolation request into an ordered list of steps
//!
//! Planning never touches the process: every rejection happens here, before
//! the first syscall, so a rejected request leaves no partial state behind.

use nix::sys::signal::Signal;
use serde::Serialize;
use shroud_core::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{IdTarget, IsolationRequest, Propagation, SetGroups};
use crate::kind::{NamespaceKind, NamespaceSet};

/// One primitive operation of a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// setns(2) into an existing namespace
    JoinNamespace {
        /// Namespace kind
        kind: NamespaceKind,
        /// Handle to open, usually `/proc/<pid>/ns/<kind>`
        reference: PathBuf,
    },
    /// Fork a helper that bind-mounts namespace files from the original
    /// mount namespace once the caller has unshared
    SpawnPersistHelper {
        /// Namespace kind to bind target
        bindings: BTreeMap<NamespaceKind, PathBuf>,
    },
    /// A single unshare(2) with every requested kind
    CreateNamespaces {
        /// Kinds to create
        namespaces: NamespaceSet,
    },
    /// Write `/proc/self/timens_offsets`
    SetTimeOffsets {
        /// Monotonic clock offset in seconds
        monotonic: Option<i64>,
        /// Boot-time clock offset in seconds
        boottime: Option<i64>,
    },
    /// fork(2)
    Fork,
    /// Bind-mount namespace files onto their targets
    PersistNamespaces {
        /// Namespace kind to bind target
        bindings: BTreeMap<NamespaceKind, PathBuf>,
    },
    /// Block until the forked child terminates
    WaitChild,
    /// prctl(PR_SET_PDEATHSIG)
    SetParentDeathSignal {
        /// Raw signal number
        signal: i32,
    },
    /// Write `/proc/self/uid_map`
    MapUser {
        /// Id inside the namespace
        target: IdTarget,
    },
    /// Deny setgroups(2), then write `/proc/self/gid_map`
    MapGroup {
        /// Id inside the namespace
        target: IdTarget,
    },
    /// Write `/proc/self/setgroups`
    SetGroups {
        /// Value to write
        control: SetGroups,
    },
    /// Recursively change propagation of `/`
    SetPropagation {
        /// New propagation
        propagation: Propagation,
    },
    /// chroot(2)
    SwitchRoot {
        /// New root
        path: PathBuf,
    },
    /// chdir(2)
    ChangeDirectory {
        /// New working directory
        path: PathBuf,
    },
    /// Mount a fresh proc filesystem
    RemountProcFs {
        /// Mount point, resolved after any root switch
        path: PathBuf,
        /// Make the mount point private before mounting
        make_private: bool,
    },
    /// sethostname(2)
    SetHostname {
        /// New hostname
        hostname: String,
    },
    /// setdomainname(2)
    SetDomainname {
        /// New domain name
        domainname: String,
    },
    /// Drop supplementary groups and setgid(2)
    SetGid {
        /// New gid
        gid: u32,
    },
    /// setuid(2)
    SetUid {
        /// New uid
        uid: u32,
    },
    /// Copy permitted capabilities to the inheritable and ambient sets
    RaiseAmbientCaps,
}

/// Which process runs a step once the plan has forked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Runs before any fork
    Shared,
    /// Runs in the process keeping its original namespaces
    Origin,
    /// Runs only in the parent of a fork
    Parent,
    /// Runs in the process continuing inside the new namespaces
    Isolated,
}

/// Which process the executor is currently running as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// No fork happened (yet)
    Unforked,
    /// Parent side of the fork
    Parent,
    /// Child side of the fork
    Child,
}

impl Scope {
    /// Whether a process in `role` runs steps of this scope
    #[must_use]
    pub const fn applies_to(self, role: Role) -> bool {
        match self {
            Self::Shared => true,
            Self::Origin => !matches!(role, Role::Child),
            Self::Parent => matches!(role, Role::Parent),
            Self::Isolated => !matches!(role, Role::Parent),
        }
    }
}

impl Step {
    /// Scope of this step
    #[must_use]
    pub const fn scope(&self) -> Scope {
        match self {
            Self::JoinNamespace { .. }
            | Self::SpawnPersistHelper { .. }
            | Self::CreateNamespaces { .. }
            | Self::SetTimeOffsets { .. }
            | Self::Fork => Scope::Shared,
            Self::PersistNamespaces { .. } => Scope::Origin,
            Self::WaitChild => Scope::Parent,
            _ => Scope::Isolated,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JoinNamespace { kind, reference } => {
                write!(f, "join {kind} namespace via {}", reference.display())
            }
            Self::SpawnPersistHelper { .. } => f.write_str("spawn persist helper"),
            Self::CreateNamespaces { namespaces } => write!(f, "create namespaces [{namespaces}]"),
            Self::SetTimeOffsets { .. } => f.write_str("set time offsets"),
            Self::Fork => f.write_str("fork"),
            Self::PersistNamespaces { bindings } => {
                write!(f, "persist {} namespace(s)", bindings.len())
            }
            Self::WaitChild => f.write_str("wait for child"),
            Self::SetParentDeathSignal { signal } => write!(f, "set parent death signal {signal}"),
            Self::MapUser { target } => write!(f, "map user to {target:?}"),
            Self::MapGroup { target } => write!(f, "map group to {target:?}"),
            Self::SetGroups { control } => write!(f, "setgroups {}", control.as_str()),
            Self::SetPropagation { propagation } => write!(f, "set propagation {propagation:?}"),
            Self::SwitchRoot { path } => write!(f, "switch root to {}", path.display()),
            Self::ChangeDirectory { path } => write!(f, "chdir to {}", path.display()),
            Self::RemountProcFs { path, .. } => write!(f, "mount proc at {}", path.display()),
            Self::SetHostname { hostname } => write!(f, "set hostname {hostname}"),
            Self::SetDomainname { domainname } => write!(f, "set domain name {domainname}"),
            Self::SetGid { gid } => write!(f, "setgid {gid}"),
            Self::SetUid { uid } => write!(f, "setuid {uid}"),
            Self::RaiseAmbientCaps => f.write_str("raise ambient capabilities"),
        }
    }
}

/// A validated, ordered sequence of steps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    /// Steps in execution order
    #[must_use]
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if executing the plan does nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// True if the plan contains a fork
    #[must_use]
    pub fn forks(&self) -> bool {
        self.steps.contains(&Step::Fork)
    }
}

/// Validates requests and orders their steps
#[derive(Debug, Clone, Copy, Default)]
pub struct Planner;

impl Planner {
    /// Build the plan for a request
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] for contradictory or incomplete
    /// requests. No syscall is issued either way.
    pub fn plan(request: &IsolationRequest) -> Result<Plan> {
        let mut create = request.namespaces;
        let mut fork = request.fork;

        for (kind, reference) in &request.join {
            if create.contains(*kind) {
                return Err(Error::configuration(format!(
                    "{kind} namespace cannot be both created and joined"
                )));
            }
            require_path("join reference", reference)?;
        }

        if request.map_user.is_some() || request.map_group.is_some() {
            if request.join.contains_key(&NamespaceKind::User) {
                return Err(Error::configuration(
                    "id mapping requires a new user namespace, but the user namespace is joined",
                ));
            }
            create.insert(NamespaceKind::User);
        }

        if let Some(signal) = request.kill_child {
            Signal::try_from(signal).map_err(|_| {
                Error::configuration(format!("kill_child: invalid signal number {signal}"))
            })?;
            fork = true;
        }

        if let Some(ref path) = request.mount_proc {
            require_path("mount_proc", path)?;
            let changed = request.changed_namespaces() | create;
            if !changed.contains(NamespaceKind::Pid) && !changed.contains(NamespaceKind::Mount) {
                return Err(Error::configuration(
                    "mount_proc requires a new or joined pid or mount namespace",
                ));
            }
            if !changed.contains(NamespaceKind::Mount) {
                debug!("mount_proc implies a new mount namespace");
                create.insert(NamespaceKind::Mount);
            }
        }

        if let Some(ref path) = request.root {
            require_path("root", path)?;
        }
        if let Some(ref path) = request.working_dir {
            require_path("working_dir", path)?;
        }

        if (request.monotonic_offset.is_some() || request.boottime_offset.is_some())
            && !create.contains(NamespaceKind::Time)
        {
            return Err(Error::configuration(
                "time offsets require a new time namespace",
            ));
        }

        let changed = request.changed_namespaces() | create;
        if (request.hostname.is_some() || request.domainname.is_some())
            && !changed.contains(NamespaceKind::Uts)
        {
            return Err(Error::configuration(
                "hostname and domainname require a new or joined uts namespace",
            ));
        }

        for (kind, target) in &request.persist {
            if !create.contains(*kind) {
                return Err(Error::configuration(format!(
                    "cannot persist {kind} namespace: it is not created"
                )));
            }
            require_path("persist target", target)?;
        }

        if request.wait && !fork {
            return Err(Error::configuration("wait requires fork"));
        }

        if let Some(control) = request.setgroups {
            if !create.contains(NamespaceKind::User) {
                return Err(Error::configuration(
                    "setgroups requires a new user namespace",
                ));
            }
            if control == SetGroups::Allow && request.map_group.is_some() {
                return Err(Error::configuration(
                    "setgroups=allow and map_group are mutually exclusive",
                ));
            }
        }

        if request.keep_caps && !create.contains(NamespaceKind::User) {
            return Err(Error::configuration(
                "keep_caps requires a new user namespace",
            ));
        }

        if !fork {
            for kind in create.iter().filter(|kind| kind.applies_to_children_only()) {
                warn!(
                    namespace = %kind,
                    "namespace only applies to children forked later; request fork to enter it"
                );
            }
            if request.join.contains_key(&NamespaceKind::Pid) {
                warn!("joined pid namespace only applies to children forked later");
            }
        }

        let steps = order_steps(request, create, fork);
        debug!(steps = steps.len(), namespaces = %create, fork, "plan built");

        Ok(Plan { steps })
    }
}

fn require_path(what: &str, path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        return Err(Error::configuration(format!(
            "{what} path must not be empty"
        )));
    }
    Ok(())
}

fn order_steps(request: &IsolationRequest, create: NamespaceSet, fork: bool) -> Vec<Step> {
    let mut steps = Vec::new();

    // BTreeMap iterates in join order
    for (kind, reference) in &request.join {
        steps.push(Step::JoinNamespace {
            kind: *kind,
            reference: reference.clone(),
        });
    }

    let persist = !request.persist.is_empty();
    if persist && create.contains(NamespaceKind::Mount) {
        steps.push(Step::SpawnPersistHelper {
            bindings: request.persist.clone(),
        });
    }

    if !create.is_empty() {
        steps.push(Step::CreateNamespaces { namespaces: create });
    }

    if request.monotonic_offset.is_some() || request.boottime_offset.is_some() {
        steps.push(Step::SetTimeOffsets {
            monotonic: request.monotonic_offset,
            boottime: request.boottime_offset,
        });
    }

    if fork {
        steps.push(Step::Fork);
    }

    if persist {
        steps.push(Step::PersistNamespaces {
            bindings: request.persist.clone(),
        });
    }

    if request.wait {
        steps.push(Step::WaitChild);
    }

    if let Some(signal) = request.kill_child {
        steps.push(Step::SetParentDeathSignal { signal });
    }

    if let Some(target) = request.map_user {
        steps.push(Step::MapUser { target });
    }
    if let Some(target) = request.map_group {
        steps.push(Step::MapGroup { target });
    } else if let Some(control) = request.setgroups {
        steps.push(Step::SetGroups { control });
    }

    let new_mount = create.contains(NamespaceKind::Mount);
    if new_mount && request.propagation != Propagation::Unchanged {
        steps.push(Step::SetPropagation {
            propagation: request.propagation,
        });
    }

    if let Some(ref root) = request.root {
        steps.push(Step::SwitchRoot { path: root.clone() });
        steps.push(Step::ChangeDirectory {
            path: request
                .working_dir
                .clone()
                .unwrap_or_else(|| PathBuf::from("/")),
        });
    } else if let Some(ref dir) = request.working_dir {
        steps.push(Step::ChangeDirectory { path: dir.clone() });
    }

    if let Some(ref path) = request.mount_proc {
        let private_root = new_mount && request.propagation == Propagation::Private;
        steps.push(Step::RemountProcFs {
            path: path.clone(),
            make_private: request.root.is_none() && !private_root,
        });
    }

    if let Some(ref hostname) = request.hostname {
        steps.push(Step::SetHostname {
            hostname: hostname.clone(),
        });
    }
    if let Some(ref domainname) = request.domainname {
        steps.push(Step::SetDomainname {
            domainname: domainname.clone(),
        });
    }

    if let Some(gid) = request.set_gid {
        steps.push(Step::SetGid { gid });
    }
    if let Some(uid) = request.set_uid {
        steps.push(Step::SetUid { uid });
    }

    if request.keep_caps {
        steps.push(Step::RaiseAmbientCaps);
    }

    steps
}
