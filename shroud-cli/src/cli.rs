//! CLI argument definitions

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use nix::sys::signal::Signal;
use shroud_namespace::{IdTarget, IsolationRequest, NamespaceKind, Propagation, SetGroups};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "shroud")]
#[command(
    about = "Run programs in new or existing Linux namespaces",
    long_about = None
)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a command inside new or joined namespaces
    Run {
        #[command(flatten)]
        isolation: IsolationArgs,

        /// Print the child PID and exit instead of waiting for it
        #[arg(long)]
        no_wait: bool,

        /// Command to run
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Print the steps a request would execute, without running them
    Plan {
        #[command(flatten)]
        isolation: IsolationArgs,
    },

    /// Show namespace information
    Namespaces {
        /// Process ID (default: current process)
        #[arg(short, long)]
        pid: Option<i32>,
    },
}

/// Options describing what to isolate
#[derive(Args, Debug, Default)]
#[allow(clippy::struct_excessive_bools)]
pub struct IsolationArgs {
    /// Create a PID namespace
    #[arg(long)]
    pub pid: bool,

    /// Create a mount namespace
    #[arg(long)]
    pub mount: bool,

    /// Create a cgroup namespace
    #[arg(long)]
    pub cgroup: bool,

    /// Create an IPC namespace
    #[arg(long)]
    pub ipc: bool,

    /// Create a UTS namespace
    #[arg(long)]
    pub uts: bool,

    /// Create a network namespace
    #[arg(long)]
    pub net: bool,

    /// Create a time namespace
    #[arg(long)]
    pub time: bool,

    /// Create a user namespace
    #[arg(long)]
    pub user: bool,

    /// Join an existing namespace (e.g. net=/proc/42/ns/net)
    #[arg(long, value_name = "KIND=PATH", value_parser = parse_binding)]
    pub join: Vec<(NamespaceKind, PathBuf)>,

    /// Keep a created namespace alive by bind-mounting it onto an existing file
    #[arg(long, value_name = "KIND=PATH", value_parser = parse_binding)]
    pub persist: Vec<(NamespaceKind, PathBuf)>,

    /// Fork after the namespace operations
    #[arg(short, long)]
    pub fork: bool,

    /// Signal the child receives when the parent dies (implies --fork)
    #[arg(
        long,
        value_name = "SIGNAL",
        num_args = 0..=1,
        default_missing_value = "SIGKILL",
        value_parser = parse_signal
    )]
    pub kill_child: Option<Signal>,

    /// Mount a fresh proc filesystem (default: /proc)
    #[arg(
        long,
        value_name = "PATH",
        num_args = 0..=1,
        default_missing_value = "/proc"
    )]
    pub mount_proc: Option<PathBuf>,

    /// Switch the filesystem root
    #[arg(long, value_name = "PATH")]
    pub root: Option<PathBuf>,

    /// Working directory once setup is done
    #[arg(long = "wd", value_name = "PATH")]
    pub working_dir: Option<PathBuf>,

    /// Mount propagation for a new mount namespace
    #[arg(long, value_enum)]
    pub propagation: Option<PropagationArg>,

    /// Hostname for the UTS namespace
    #[arg(long)]
    pub hostname: Option<String>,

    /// Domain name for the UTS namespace
    #[arg(long)]
    pub domainname: Option<String>,

    /// Map the current user to root in a new user namespace
    #[arg(long, conflicts_with_all = ["map_current_user", "map_user", "map_group"])]
    pub map_root_user: bool,

    /// Map the current user to itself in a new user namespace
    #[arg(long, conflicts_with_all = ["map_user", "map_group"])]
    pub map_current_user: bool,

    /// Uid the current user maps to in a new user namespace
    #[arg(long, value_name = "UID")]
    pub map_user: Option<u32>,

    /// Gid the current group maps to in a new user namespace
    #[arg(long, value_name = "GID")]
    pub map_group: Option<u32>,

    /// setgroups(2) control in a new user namespace
    #[arg(long, value_enum)]
    pub setgroups: Option<SetGroupsArg>,

    /// Uid to switch to before running the command
    #[arg(long = "setuid", value_name = "UID")]
    pub set_uid: Option<u32>,

    /// Gid to switch to before running the command
    #[arg(long = "setgid", value_name = "GID")]
    pub set_gid: Option<u32>,

    /// Keep the permitted capabilities across exec in a new user namespace
    #[arg(long)]
    pub keep_caps: bool,

    /// Monotonic clock offset in seconds for a new time namespace
    #[arg(long, value_name = "SECS", allow_negative_numbers = true)]
    pub monotonic: Option<i64>,

    /// Boot-time clock offset in seconds for a new time namespace
    #[arg(long, value_name = "SECS", allow_negative_numbers = true)]
    pub boottime: Option<i64>,

    /// JSON isolation request used as the base for these options
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum PropagationArg {
    Private,
    Shared,
    Slave,
    Unchanged,
}

impl From<PropagationArg> for Propagation {
    fn from(arg: PropagationArg) -> Self {
        match arg {
            PropagationArg::Private => Self::Private,
            PropagationArg::Shared => Self::Shared,
            PropagationArg::Slave => Self::Slave,
            PropagationArg::Unchanged => Self::Unchanged,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum SetGroupsArg {
    Allow,
    Deny,
}

impl From<SetGroupsArg> for SetGroups {
    fn from(arg: SetGroupsArg) -> Self {
        match arg {
            SetGroupsArg::Allow => Self::Allow,
            SetGroupsArg::Deny => Self::Deny,
        }
    }
}

impl IsolationArgs {
    /// Build the request: the config file first, flags layered on top
    pub fn into_request(self) -> Result<IsolationRequest> {
        let mut request = match self.config {
            Some(ref path) => {
                let file = File::open(path)
                    .with_context(|| format!("Failed to open config {}", path.display()))?;
                serde_json::from_reader(BufReader::new(file))
                    .with_context(|| format!("Invalid config {}", path.display()))?
            }
            None => IsolationRequest::new(),
        };

        let flags = [
            (self.pid, NamespaceKind::Pid),
            (self.mount, NamespaceKind::Mount),
            (self.cgroup, NamespaceKind::Cgroup),
            (self.ipc, NamespaceKind::Ipc),
            (self.uts, NamespaceKind::Uts),
            (self.net, NamespaceKind::Net),
            (self.time, NamespaceKind::Time),
            (self.user, NamespaceKind::User),
        ];
        for (_, kind) in flags.into_iter().filter(|(enabled, _)| *enabled) {
            request.namespaces.insert(kind);
        }

        request.join.extend(self.join);
        request.persist.extend(self.persist);
        request.fork |= self.fork;
        request.keep_caps |= self.keep_caps;

        if let Some(signal) = self.kill_child {
            request.kill_child = Some(signal as i32);
        }
        if self.mount_proc.is_some() {
            request.mount_proc = self.mount_proc;
        }
        if self.root.is_some() {
            request.root = self.root;
        }
        if self.working_dir.is_some() {
            request.working_dir = self.working_dir;
        }
        if let Some(propagation) = self.propagation {
            request.propagation = propagation.into();
        }
        if self.hostname.is_some() {
            request.hostname = self.hostname;
        }
        if self.domainname.is_some() {
            request.domainname = self.domainname;
        }

        if self.map_root_user {
            request = request.with_map_root_user();
        } else if self.map_current_user {
            request = request.with_map_current_user();
        }
        if let Some(uid) = self.map_user {
            request.map_user = Some(IdTarget::Id(uid));
        }
        if let Some(gid) = self.map_group {
            request.map_group = Some(IdTarget::Id(gid));
        }
        if let Some(setgroups) = self.setgroups {
            request.setgroups = Some(setgroups.into());
        }

        request.set_uid = self.set_uid.or(request.set_uid);
        request.set_gid = self.set_gid.or(request.set_gid);
        request.monotonic_offset = self.monotonic.or(request.monotonic_offset);
        request.boottime_offset = self.boottime.or(request.boottime_offset);

        Ok(request)
    }
}

fn parse_binding(value: &str) -> Result<(NamespaceKind, PathBuf), String> {
    let (kind, path) = value
        .split_once('=')
        .ok_or_else(|| format!("expected KIND=PATH, got '{value}'"))?;
    let kind = kind.parse::<NamespaceKind>().map_err(|e| e.to_string())?;
    if path.is_empty() {
        return Err(format!("expected KIND=PATH, got '{value}'"));
    }
    Ok((kind, PathBuf::from(path)))
}

fn parse_signal(value: &str) -> Result<Signal, String> {
    if let Ok(number) = value.parse::<i32>() {
        return Signal::try_from(number).map_err(|e| e.to_string());
    }
    let name = value.to_ascii_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{name}")
    };
    name.parse::<Signal>()
        .map_err(|_| format!("unknown signal '{value}'"))
}
