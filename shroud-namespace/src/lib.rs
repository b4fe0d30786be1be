//! Namespace isolation for a process or a freshly forked child
//!
//! A request goes through two stages:
//! - [`Planner`] validates an [`IsolationRequest`] and orders its steps
//!   without touching the process
//! - [`Executor`] runs those steps: joining namespaces, a single combined
//!   unshare(2), the fork, then proc remount and root switch in whichever
//!   process continues inside the new namespaces
//!
//! Namespaces are never torn down here; the kernel drops one once nothing
//! refers to it anymore.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod config;
pub mod executor;
pub mod info;
pub mod kind;
pub mod plan;

pub use config::{IdTarget, IsolationRequest, Propagation, SetGroups};
pub use executor::{ExecutionResult, ExecutionState, Executor, wait_for_child};
pub use info::NamespaceInfo;
pub use kind::{NamespaceKind, NamespaceSet};
pub use plan::{Plan, Planner, Role, Scope, Step};

use shroud_core::Result;

/// Plan and execute a request on the calling thread
///
/// With `fork` set this returns in both processes; branch on the result.
///
/// ```no_run
/// use shroud_namespace::{ExecutionResult, IsolationRequest, isolate};
///
/// let request = IsolationRequest::new()
///     .with_pid(true)
///     .with_fork(true)
///     .with_mount_proc("/proc");
///
/// match isolate(&request)? {
///     ExecutionResult::ForkedChild => { /* PID 1 of the new namespace */ }
///     ExecutionResult::ForkedParent { child, .. } => println!("child {child}"),
///     ExecutionResult::Joined => unreachable!(),
/// }
/// # Ok::<(), shroud_core::Error>(())
/// ```
pub fn isolate(request: &IsolationRequest) -> Result<ExecutionResult> {
    let plan = Planner::plan(request)?;
    Executor::new(plan).execute()
}
