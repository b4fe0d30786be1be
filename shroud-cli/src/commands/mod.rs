use crate::cli::Commands;
use anyhow::Result;

pub mod namespaces;
pub mod plan;
pub mod run;

/// Dispatch command to appropriate handler, returning the process exit code
pub fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Run {
            isolation,
            no_wait,
            command,
        } => run::execute(isolation, no_wait, &command),

        Commands::Plan { isolation } => plan::execute(isolation),

        Commands::Namespaces { pid } => namespaces::execute(pid),
    }
}
