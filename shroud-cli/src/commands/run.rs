//! Run command implementation

use crate::cli::IsolationArgs;
use anyhow::{Context, Result};
use nix::sys::signal::{Signal, kill};
use shroud_core::ProcessId;
use shroud_namespace::{ExecutionResult, Executor, Planner, Role, wait_for_child};
use std::ffi::CString;
use tracing::{debug, info, warn};

/// Exit code when setup fails inside the isolated process
const SETUP_FAILED: i32 = 125;

/// Exit code when the command cannot be executed
const EXEC_FAILED: i32 = 127;

pub fn execute(isolation: IsolationArgs, no_wait: bool, command: &[String]) -> Result<i32> {
    let (program, args) = command.split_first().context("No command given")?;
    let argv = build_command(program, args);

    let mut request = isolation.into_request()?;
    // Waiting happens here so interrupts can be forwarded to the child
    request.wait = false;

    let plan = Planner::plan(&request)?;
    info!(
        namespaces = %request.namespaces,
        joined = request.join.len(),
        fork = plan.forks(),
        steps = plan.len(),
        "🔒 Isolating process"
    );

    let mut executor = Executor::new(plan);
    let result = match executor.execute() {
        Ok(result) => result,
        Err(e) if executor.role() == Role::Child => {
            eprintln!("❌ Failed to set up isolated process: {e}");
            std::process::exit(SETUP_FAILED);
        }
        Err(e) => {
            let step = e.step_name();
            return Err(e).with_context(|| format!("Isolation failed at step '{step}'"));
        }
    };

    match result {
        ExecutionResult::ForkedParent { child, .. } => {
            if no_wait {
                println!("{child}");
                return Ok(0);
            }

            forward_interrupts(child);
            let exit = wait_for_child(child).context("Failed to wait for child")?;
            info!(%child, "👋 Child {exit}");
            Ok(exit.code())
        }
        ExecutionResult::ForkedChild | ExecutionResult::Joined => exec_command(&argv),
    }
}

/// Send SIGTERM to the child on Ctrl+C instead of dying with it
fn forward_interrupts(child: ProcessId) {
    let result = ctrlc::set_handler(move || {
        warn!(%child, "⚠️  Interrupted, terminating child");
        if let Err(e) = kill(child.as_nix_pid(), Signal::SIGTERM) {
            warn!(%child, error = %e, "Failed to signal child");
        }
    });

    if let Err(e) = result {
        warn!(error = %e, "Could not install interrupt handler");
    }
}

/// Replace the current process with `argv`, whose first entry is the program
fn exec_command(argv: &[String]) -> ! {
    debug!(?argv, "Executing command");

    let args_cstrings: Vec<CString> = match argv
        .iter()
        .map(|arg| CString::new(arg.as_bytes()))
        .collect()
    {
        Ok(v) => v,
        Err(e) => {
            eprintln!("❌ Invalid argument: {e}");
            std::process::exit(EXEC_FAILED);
        }
    };

    let Some(program) = args_cstrings.first() else {
        std::process::exit(EXEC_FAILED);
    };
    let Err(e) = nix::unistd::execvp(program, &args_cstrings);
    eprintln!("❌ Failed to execute {}: {e}", program.to_string_lossy());
    std::process::exit(EXEC_FAILED);
}

/// Full argument vector for the program
///
/// A bare shell gets `-i` so it stays interactive.
fn build_command(program: &str, args: &[String]) -> Vec<String> {
    let mut argv = Vec::with_capacity(args.len() + 2);
    argv.push(program.to_string());
    argv.extend_from_slice(args);

    if (program == "/bin/bash" || program == "/bin/sh") && args.is_empty() {
        argv.push("-i".to_string());
    }

    argv
}
