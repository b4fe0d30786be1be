//! Namespaces command implementation

use anyhow::{Context, Result};
use shroud_core::ProcessId;
use shroud_namespace::{NamespaceInfo, NamespaceKind};

pub fn execute(pid: Option<i32>) -> Result<i32> {
    let target = pid.map_or_else(ProcessId::current, ProcessId::from_raw);

    println!("\n🔒 Namespace Information for PID {target}");
    println!("{:-<60}", "");

    let ns_info = NamespaceInfo::for_pid(target).context("Failed to get namespace information")?;

    print!("{ns_info}");

    match ns_info.is_isolated() {
        Ok(true) => println!("\n✅ Process is in isolated namespaces"),
        Ok(false) => println!("\n⚠️  Process is in host namespaces"),
        Err(e) => println!("\n❌ Failed to check isolation: {e}"),
    }

    // Only meaningful for ourselves; another process may sit in a different UTS namespace
    if pid.is_none() && ns_info.get(NamespaceKind::Uts).is_some() {
        if let Ok(hostname) = std::fs::read_to_string("/proc/sys/kernel/hostname") {
            println!("Hostname: {}", hostname.trim());
        }
    }

    Ok(0)
}
