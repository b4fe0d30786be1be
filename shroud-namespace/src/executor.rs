//! Executing plans against the live process
//!
//! This module uses `unsafe` for fork() which is inherently unsafe
//! but necessary for proper PID namespace isolation.
//!
//! Execution only moves forward. When a step fails, whatever earlier steps
//! changed (namespace membership, mounts, a forked child) stays changed and
//! the error names the step that failed.

#![allow(unsafe_code)]

use nix::errno::Errno;
use nix::mount::{MsFlags, mount};
use nix::sched::{setns, unshare};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{
    ForkResult, Gid, Pid, Uid, chdir, chroot, fork, getegid, geteuid, getpid, getppid,
};
use shroud_core::{ChildExit, Error, ProcessId, Result};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, PipeReader, PipeWriter, Read, Write};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

use crate::config::{IdTarget, Propagation, SetGroups};
use crate::kind::{NamespaceKind, NamespaceSet};
use crate::plan::{Plan, Role, Step};

const SYNC_BYTE: u8 = 0x06;

/// `_LINUX_CAPABILITY_VERSION_3`
const CAPABILITY_VERSION_3: u32 = 0x2008_0522;

#[repr(C)]
struct CapHeader {
    version: u32,
    pid: libc::c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct CapData {
    effective: u32,
    permitted: u32,
    inheritable: u32,
}

/// What the calling code observes once a plan has run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionResult {
    /// No fork; the calling process itself is now isolated
    Joined,
    /// This process is the parent and kept its original namespaces
    ForkedParent {
        /// The isolated child
        child: ProcessId,
        /// How the child terminated, when the plan waited for it
        exit: Option<ChildExit>,
    },
    /// This process is the freshly forked, isolated child
    ForkedChild,
}

impl ExecutionResult {
    /// The child's PID on the parent side
    #[must_use]
    pub const fn child(&self) -> Option<ProcessId> {
        match self {
            Self::ForkedParent { child, .. } => Some(*child),
            _ => None,
        }
    }

    /// True for the process that continues inside the new namespaces
    #[must_use]
    pub const fn is_isolated(&self) -> bool {
        !matches!(self, Self::ForkedParent { .. })
    }

    /// fork(2)-style integer: the child PID in the parent, 0 otherwise
    #[must_use]
    pub const fn as_raw(&self) -> i32 {
        match self {
            Self::ForkedParent { child, .. } => child.as_raw(),
            Self::Joined | Self::ForkedChild => 0,
        }
    }
}

/// Where an executor is in its plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Nothing has run yet
    Planned,
    /// The step at this index is running
    Executing {
        /// Step index
        step: usize,
    },
    /// The step at this index failed; earlier steps stay applied
    Failed {
        /// Step index
        step: usize,
    },
    /// Every step for this process ran
    Completed,
}

/// Helper process that bind-mounts namespace files from outside a new
/// mount namespace
#[derive(Debug)]
struct PersistHelper {
    pid: Pid,
    sync: Option<PipeWriter>,
    reap: bool,
}

impl PersistHelper {
    /// Let the helper run and collect its result
    fn release(mut self) -> Result<()> {
        let Some(mut sync) = self.sync.take() else {
            return Err(Error::Persist {
                message: "helper already released".to_string(),
            });
        };
        sync.write_all(&[SYNC_BYTE])?;
        drop(sync);

        self.reap = false;
        match wait_for_child(self.pid.into())? {
            ChildExit::Exited(0) => Ok(()),
            exit => Err(Error::Persist {
                message: format!("helper {exit}"),
            }),
        }
    }

    /// Forget the helper without waiting for it (it is not our child)
    fn detach(mut self) {
        self.reap = false;
    }
}

impl Drop for PersistHelper {
    fn drop(&mut self) {
        // Closing the pipe unblocks the helper, which then exits
        drop(self.sync.take());
        if self.reap {
            let _ = waitpid(self.pid, None);
        }
    }
}

/// Runs a [`Plan`] on the calling thread
#[derive(Debug)]
pub struct Executor {
    plan: Plan,
    state: ExecutionState,
    role: Role,
    child: Option<Pid>,
    origin: Option<Pid>,
    exit: Option<ChildExit>,
    helper: Option<PersistHelper>,
    euid: u32,
    egid: u32,
}

impl Executor {
    /// Create an executor for a plan
    #[must_use]
    pub const fn new(plan: Plan) -> Self {
        Self {
            plan,
            state: ExecutionState::Planned,
            role: Role::Unforked,
            child: None,
            origin: None,
            exit: None,
            helper: None,
            euid: 0,
            egid: 0,
        }
    }

    /// Get the plan
    #[must_use]
    pub const fn plan(&self) -> &Plan {
        &self.plan
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ExecutionState {
        self.state
    }

    /// Which side of the fork this process is on
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// Run every step that applies to this process, in order
    ///
    /// If the plan forks, this returns twice: once in the parent and once
    /// in the child.
    ///
    /// # Errors
    /// Returns the error of the first failing step. Nothing done by earlier
    /// steps is undone.
    pub fn execute(&mut self) -> Result<ExecutionResult> {
        if self.state != ExecutionState::Planned {
            return Err(Error::configuration("plan has already been executed"));
        }

        // Ids outside a new user namespace must be read before unsharing it
        self.euid = geteuid().as_raw();
        self.egid = getegid().as_raw();

        let steps = self.plan.steps().to_vec();
        for (index, step) in steps.iter().enumerate() {
            if !step.scope().applies_to(self.role) {
                debug!(step = index, %step, role = ?self.role, "skipping step");
                continue;
            }

            self.state = ExecutionState::Executing { step: index };
            debug!(step = index, %step, "executing step");

            if let Err(e) = self.apply(step) {
                error!(step = index, %step, error = %e, "step failed");
                self.state = ExecutionState::Failed { step: index };
                return Err(e);
            }
        }

        self.state = ExecutionState::Completed;

        Ok(match (self.role, self.child) {
            (Role::Parent, Some(child)) => ExecutionResult::ForkedParent {
                child: child.into(),
                exit: self.exit,
            },
            (Role::Child, _) => ExecutionResult::ForkedChild,
            _ => ExecutionResult::Joined,
        })
    }

    fn apply(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::JoinNamespace { kind, reference } => join_namespace(*kind, reference),
            Step::SpawnPersistHelper { bindings } => {
                self.helper = Some(spawn_persist_helper(bindings)?);
                Ok(())
            }
            Step::CreateNamespaces { namespaces } => create_namespaces(*namespaces),
            Step::SetTimeOffsets {
                monotonic,
                boottime,
            } => set_time_offsets(*monotonic, *boottime),
            Step::Fork => self.fork(),
            Step::PersistNamespaces { bindings } => match self.helper.take() {
                Some(helper) => helper.release(),
                None => bind_namespace_files("self", bindings),
            },
            Step::WaitChild => {
                if let Some(child) = self.child {
                    self.exit = Some(wait_for_child(child.into())?);
                }
                Ok(())
            }
            Step::SetParentDeathSignal { signal } => {
                set_parent_death_signal(*signal, self.origin)
            }
            Step::MapUser { target } => {
                let inside = resolve_id(*target, self.euid);
                write_id_map(Path::new("/proc/self/uid_map"), inside, self.euid)
            }
            Step::MapGroup { target } => {
                // Unprivileged gid_map writes need setgroups denied first
                write_setgroups(SetGroups::Deny)?;
                let inside = resolve_id(*target, self.egid);
                write_id_map(Path::new("/proc/self/gid_map"), inside, self.egid)
            }
            Step::SetGroups { control } => write_setgroups(*control),
            Step::SetPropagation { propagation } => set_propagation(*propagation),
            Step::SwitchRoot { path } => switch_root(path),
            Step::ChangeDirectory { path } => {
                chdir(path.as_path()).map_err(|e| Error::RootSwitch {
                    path: path.clone(),
                    source: e.into(),
                })
            }
            Step::RemountProcFs { path, make_private } => remount_proc(path, *make_private),
            Step::SetHostname { hostname } => set_hostname(hostname),
            Step::SetDomainname { domainname } => set_domainname(domainname),
            Step::SetGid { gid } => set_gid(*gid),
            Step::SetUid { uid } => {
                nix::unistd::setuid(Uid::from_raw(*uid)).map_err(|e| Error::Credentials {
                    operation: "setuid",
                    source: e.into(),
                })
            }
            Step::RaiseAmbientCaps => raise_ambient_caps(),
        }
    }

    fn fork(&mut self) -> Result<()> {
        debug!("Forking process...");
        self.origin = Some(getpid());

        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                info!(child = %child, "forked isolated child");
                self.role = Role::Parent;
                self.child = Some(child);
                Ok(())
            }
            Ok(ForkResult::Child) => {
                self.role = Role::Child;
                if let Some(helper) = self.helper.take() {
                    helper.detach();
                }
                debug!(pid = %getpid(), "running as isolated child");
                Ok(())
            }
            Err(e) => Err(Error::Fork { source: e.into() }),
        }
    }
}

const fn resolve_id(target: IdTarget, current: u32) -> u32 {
    match target {
        IdTarget::Root => 0,
        IdTarget::Current => current,
        IdTarget::Id(id) => id,
    }
}

fn join_namespace(kind: NamespaceKind, reference: &Path) -> Result<()> {
    let join_error = |source: io::Error| Error::NamespaceJoin {
        kind: kind.proc_name(),
        reference: reference.to_path_buf(),
        source,
    };

    let handle = File::open(reference).map_err(join_error)?;
    setns(&handle, kind.clone_flag()).map_err(|e| join_error(e.into()))?;

    info!(namespace = %kind, reference = %reference.display(), "joined namespace");
    Ok(())
}

fn create_namespaces(namespaces: NamespaceSet) -> Result<()> {
    info!(namespaces = %namespaces, "Creating namespaces");

    unshare(namespaces.to_clone_flags()).map_err(|e| {
        error!(
            error = %e,
            namespaces = %namespaces,
            "Failed to create namespaces"
        );
        Error::NamespaceCreate {
            namespaces: namespaces.to_string(),
            source: e.into(),
        }
    })?;

    if namespaces.contains(NamespaceKind::Pid) {
        debug!("PID namespace will be active in child processes");
    }
    Ok(())
}

fn set_time_offsets(monotonic: Option<i64>, boottime: Option<i64>) -> Result<()> {
    let offsets = [
        (libc::CLOCK_BOOTTIME, boottime),
        (libc::CLOCK_MONOTONIC, monotonic),
    ];

    for (clock, offset) in offsets {
        let Some(seconds) = offset else { continue };
        debug!(clock, seconds, "setting time namespace offset");
        write_proc_file(
            Path::new("/proc/self/timens_offsets"),
            &format!("{clock} {seconds} 0"),
        )
        .map_err(|source| Error::TimeOffsets { source })?;
    }
    Ok(())
}

fn spawn_persist_helper(bindings: &BTreeMap<NamespaceKind, PathBuf>) -> Result<PersistHelper> {
    let parent = getpid();
    let original = mount_namespace_inode(parent)?;
    let (reader, writer) = io::pipe()?;

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            drop(reader);
            debug!(helper = %child, "spawned namespace persist helper");
            Ok(PersistHelper {
                pid: child,
                sync: Some(writer),
                reap: true,
            })
        }
        Ok(ForkResult::Child) => {
            drop(writer);
            let code = run_persist_helper(reader, parent, original, bindings);
            std::process::exit(code);
        }
        Err(e) => Err(Error::Fork { source: e.into() }),
    }
}

fn run_persist_helper(
    mut reader: PipeReader,
    parent: Pid,
    original: u64,
    bindings: &BTreeMap<NamespaceKind, PathBuf>,
) -> i32 {
    let mut byte = [0_u8; 1];
    if reader.read_exact(&mut byte).is_err() || byte[0] != SYNC_BYTE {
        return 1;
    }

    // The parent never unshared its mount namespace; nothing to persist
    match mount_namespace_inode(parent) {
        Ok(inode) if inode != original => {}
        _ => return 1,
    }

    match bind_namespace_files(&parent.to_string(), bindings) {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "persist helper failed");
            1
        }
    }
}

fn mount_namespace_inode(pid: Pid) -> Result<u64> {
    let path = NamespaceKind::Mount.proc_path(&pid.to_string());
    Ok(std::fs::metadata(path)?.ino())
}

fn bind_namespace_files(pid: &str, bindings: &BTreeMap<NamespaceKind, PathBuf>) -> Result<()> {
    for (kind, target) in bindings {
        let source = format!("/proc/{pid}/ns/{}", kind.children_proc_name());
        mount(
            Some(source.as_str()),
            target.as_path(),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| Error::Mount {
            target: target.clone(),
            source: e.into(),
        })?;
        info!(namespace = %kind, target = %target.display(), "persisted namespace");
    }
    Ok(())
}

/// Wait for a forked child to terminate
///
/// Stops and continues are ignored; interrupted waits are retried.
///
/// # Errors
/// Returns [`Error::Wait`] if waitpid(2) fails, e.g. when `child` is not a
/// child of this process.
pub fn wait_for_child(child: ProcessId) -> Result<ChildExit> {
    debug!(child = %child, "waiting for child to exit");

    loop {
        match waitpid(child.as_nix_pid(), None) {
            Ok(WaitStatus::Exited(_, exit_code)) => {
                info!(child = %child, exit_code, "child exited");
                return Ok(ChildExit::Exited(exit_code));
            }
            Ok(WaitStatus::Signaled(_, signal, _)) => {
                warn!(child = %child, ?signal, "child terminated by signal");
                return Ok(ChildExit::Signaled(signal));
            }
            Ok(status) => {
                debug!(?status, "child status changed, still waiting");
            }
            Err(Errno::EINTR) => {
                debug!("Wait interrupted by signal, continuing...");
            }
            Err(e) => {
                error!(child = %child, error = %e, "Wait failed");
                return Err(Error::Wait { source: e.into() });
            }
        }
    }
}

fn set_parent_death_signal(signal: i32, origin: Option<Pid>) -> Result<()> {
    let signal = Signal::try_from(signal)?;
    nix::sys::prctl::set_pdeathsig(signal).map_err(|e| Error::Credentials {
        operation: "prctl(PR_SET_PDEATHSIG)",
        source: e.into(),
    })?;

    // The parent may have exited between fork and prctl
    if origin.is_some_and(|origin| parent_gone(getppid(), origin)) {
        warn!(?signal, "parent exited before the death signal was armed");
        kill(getpid(), signal).map_err(|e| Error::Credentials {
            operation: "kill",
            source: e.into(),
        })?;
    }
    Ok(())
}

/// A child in a new PID namespace sees its parent as 0, which tells nothing
const fn parent_gone(ppid: Pid, origin: Pid) -> bool {
    ppid.as_raw() != 0 && ppid.as_raw() != origin.as_raw()
}

fn write_id_map(file: &Path, inside: u32, outside: u32) -> Result<()> {
    debug!(file = %file.display(), inside, outside, "writing id map");
    write_proc_file(file, &format!("{inside} {outside} 1")).map_err(|source| Error::IdMapping {
        file: file.to_path_buf(),
        source,
    })
}

fn write_setgroups(control: SetGroups) -> Result<()> {
    let file = Path::new("/proc/self/setgroups");
    match write_proc_file(file, control.as_str()) {
        Ok(()) => Ok(()),
        // Kernels before 3.19 have no setgroups control
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(Error::IdMapping {
            file: file.to_path_buf(),
            source,
        }),
    }
}

fn write_proc_file(path: &Path, contents: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).open(path)?;
    file.write_all(contents.as_bytes())
}

fn set_propagation(propagation: Propagation) -> Result<()> {
    let flags = match propagation {
        Propagation::Private => MsFlags::MS_PRIVATE,
        Propagation::Shared => MsFlags::MS_SHARED,
        Propagation::Slave => MsFlags::MS_SLAVE,
        Propagation::Unchanged => return Ok(()),
    };

    debug!(?propagation, "changing root filesystem propagation");
    mount(
        Some("none"),
        "/",
        None::<&str>,
        flags | MsFlags::MS_REC,
        None::<&str>,
    )
    .map_err(|e| Error::Mount {
        target: PathBuf::from("/"),
        source: e.into(),
    })
}

fn switch_root(path: &Path) -> Result<()> {
    info!(root = %path.display(), "switching root");
    chroot(path).map_err(|e| Error::RootSwitch {
        path: path.to_path_buf(),
        source: e.into(),
    })
}

fn remount_proc(path: &Path, make_private: bool) -> Result<()> {
    let mount_error = |e: Errno| Error::Mount {
        target: path.to_path_buf(),
        source: e.into(),
    };

    if make_private {
        // EINVAL: nothing is mounted there yet
        match mount(
            Some("none"),
            path,
            None::<&str>,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None::<&str>,
        ) {
            Ok(()) | Err(Errno::EINVAL) => {}
            Err(e) => return Err(mount_error(e)),
        }
    }

    // MS_NOSUID | MS_NODEV | MS_NOEXEC for security
    let flags = MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC;
    mount(Some("proc"), path, Some("proc"), flags, None::<&str>).map_err(mount_error)?;

    info!(target = %path.display(), "mounted fresh proc filesystem");
    Ok(())
}

fn set_hostname(hostname: &str) -> Result<()> {
    debug!(hostname = %hostname, "Setting hostname");

    nix::unistd::sethostname(hostname).map_err(|e| {
        error!(
            hostname = %hostname,
            error = %e,
            "Failed to set hostname"
        );
        Error::Hostname {
            field: "hostname",
            source: e.into(),
        }
    })
}

fn set_domainname(domainname: &str) -> Result<()> {
    debug!(domainname = %domainname, "Setting domain name");

    let c_domainname = std::ffi::CString::new(domainname)
        .map_err(|e| Error::configuration(format!("invalid domain name: {e}")))?;

    // nix doesn't expose setdomainname
    if unsafe { libc::setdomainname(c_domainname.as_ptr(), domainname.len()) } != 0 {
        let err = io::Error::last_os_error();
        error!(
            domainname = %domainname,
            error = %err,
            "Failed to set domain name"
        );
        return Err(Error::Hostname {
            field: "domainname",
            source: err,
        });
    }
    Ok(())
}

fn set_gid(gid: u32) -> Result<()> {
    nix::unistd::setgroups(&[]).map_err(|e| Error::Credentials {
        operation: "setgroups",
        source: e.into(),
    })?;
    nix::unistd::setgid(Gid::from_raw(gid)).map_err(|e| Error::Credentials {
        operation: "setgid",
        source: e.into(),
    })
}

fn raise_ambient_caps() -> Result<()> {
    let caps_error = |operation: &'static str| Error::Credentials {
        operation,
        source: io::Error::last_os_error(),
    };

    let mut header = CapHeader {
        version: CAPABILITY_VERSION_3,
        pid: 0,
    };
    let mut data = [CapData::default(); 2];

    // SAFETY: header and data follow the kernel's version 3 layout
    if unsafe { libc::syscall(libc::SYS_capget, &raw mut header, data.as_mut_ptr()) } != 0 {
        return Err(caps_error("capget"));
    }

    // Ambient capabilities must be both permitted and inheritable
    for set in &mut data {
        set.inheritable = set.permitted;
    }
    // SAFETY: as above
    if unsafe { libc::syscall(libc::SYS_capset, &raw mut header, data.as_ptr()) } != 0 {
        return Err(caps_error("capset"));
    }

    let effective = (u64::from(data[1].effective) << 32) | u64::from(data[0].effective);
    let last = last_capability().map_err(|source| Error::Credentials {
        operation: "read cap_last_cap",
        source,
    })?;

    for cap in (0..=last.min(63)).filter(|cap| effective & (1 << cap) != 0) {
        // SAFETY: PR_CAP_AMBIENT takes plain integer arguments
        let raised = unsafe {
            libc::prctl(
                libc::PR_CAP_AMBIENT,
                libc::PR_CAP_AMBIENT_RAISE as libc::c_ulong,
                libc::c_ulong::from(cap),
                0 as libc::c_ulong,
                0 as libc::c_ulong,
            )
        };
        if raised != 0 {
            return Err(caps_error("prctl(PR_CAP_AMBIENT_RAISE)"));
        }
    }

    debug!(effective = format_args!("{effective:#x}"), "raised ambient capabilities");
    Ok(())
}

fn last_capability() -> io::Result<u32> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/cap_last_cap")?;
    raw.trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
