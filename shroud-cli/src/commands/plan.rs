//! Plan command implementation

use crate::cli::IsolationArgs;
use anyhow::{Context, Result};
use shroud_namespace::Planner;
use tracing::debug;

pub fn execute(isolation: IsolationArgs) -> Result<i32> {
    let request = isolation.into_request()?;
    let plan = Planner::plan(&request)?;
    debug!(steps = plan.len(), forks = plan.forks(), "Planned request");

    let json = serde_json::to_string_pretty(&plan).context("Failed to serialize plan")?;
    println!("{json}");

    Ok(0)
}
