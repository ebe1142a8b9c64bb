use anyhow::Result;
use runscope::{logging, Supervisor};
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use tracing::info;

use crate::args::RunArgs;

/// Supervise the program and return the exit code to leave with
pub async fn run_program(args: RunArgs) -> Result<i32> {
    // The terminal belongs to the supervised program, so only log to file
    let log_path = args.logging.log_dir()?.join("runscope_run.log");
    match &args.logging.log_filter {
        Some(filter) => logging::setup_global_logging_with_filter(&log_path, filter, false)?,
        None => logging::setup_global_logging(&log_path, &args.logging.level(), false)?,
    }

    let config = args.config()?;
    info!("Recording {:?} into {:?}", args.program, config.samples_root);

    let outcome = Supervisor::new(config, args.program)
        .args(args.args)
        .run()
        .await?;

    info!(
        "Run {} finished with {} ({} processes, {} activities)",
        outcome.location,
        outcome.status,
        outcome.summary.processes.len(),
        outcome.summary.activities.len()
    );
    Ok(exit_code(outcome.status))
}

fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mirrors_program() {
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        // Killed by SIGTERM
        assert_eq!(exit_code(ExitStatus::from_raw(15)), 143);
    }
}
