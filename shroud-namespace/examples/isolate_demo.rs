//! Namespace isolation walkthrough
//!
//! Run with: cargo run --example isolate_demo
//! Run as root: sudo cargo run --example isolate_demo

use shroud_namespace::{
    ExecutionResult, IsolationRequest, NamespaceInfo, NamespaceKind, Planner, isolate,
};

fn main() {
    println!("🔒 Shroud Isolation Demo\n");

    tracing_subscriber::fmt::init();

    demo_current_namespaces();
    demo_plans();

    if nix::unistd::geteuid().is_root() {
        println!("\n🔐 Running with root privileges - demonstrating isolation\n");
        demo_pid_namespace();
    } else {
        println!("\n⚠️  Run with sudo to see namespace isolation demos");
    }
}

fn demo_current_namespaces() {
    println!("📊 Current Process Namespaces:");
    println!("{:-<60}", "");

    match NamespaceInfo::current() {
        Ok(ns_info) => {
            print!("{ns_info}");

            match ns_info.is_isolated() {
                Ok(true) => println!("✅ Process is isolated"),
                Ok(false) => println!("⚠️  Process is in host namespaces"),
                Err(e) => println!("❌ Failed to check: {e}"),
            }
        }
        Err(e) => println!("❌ Failed to get namespaces: {e}"),
    }
    println!();
}

fn demo_plans() {
    println!("⚙️  Planned Steps:\n");

    let requests = vec![
        (
            "PID + proc",
            IsolationRequest::new()
                .with_pid(true)
                .with_fork(true)
                .with_mount_proc("/proc"),
        ),
        (
            "Join host network",
            IsolationRequest::new()
                .with_join(NamespaceKind::Net, "/proc/1/ns/net")
                .with_uts(true)
                .with_hostname("demo"),
        ),
        (
            "Rejected",
            IsolationRequest::new()
                .with_ipc(true)
                .with_mount_proc("/proc"),
        ),
    ];

    for (name, request) in requests {
        match Planner::plan(&request) {
            Ok(plan) => {
                println!("  {name}:");
                for step in plan.steps() {
                    println!("    - {step}");
                }
            }
            Err(e) => println!("  {name}: ❌ {e}"),
        }
    }
}

fn demo_pid_namespace() {
    println!("🚀 Forking into a new PID namespace:");
    println!("{:-<60}", "");

    let request = IsolationRequest::new()
        .with_pid(true)
        .with_fork(true)
        .with_wait(true)
        .with_mount_proc("/proc");

    match isolate(&request) {
        Ok(ExecutionResult::ForkedChild) => {
            println!("  👶 child sees itself as PID {}", std::process::id());
            std::process::exit(0);
        }
        Ok(ExecutionResult::ForkedParent { child, exit }) => {
            println!("  👨‍👦 parent forked child {child}");
            if let Some(exit) = exit {
                println!("  👋 child {exit}");
            }
        }
        Ok(ExecutionResult::Joined) => println!("  ⚠️  no fork happened"),
        Err(e) => println!("  ❌ {e} (step: {})", e.step_name()),
    }
}
