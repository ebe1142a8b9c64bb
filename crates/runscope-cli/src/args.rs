use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;

use runscope::config::get_runscope_home;
use runscope::RunscopeConfig;

/// Runscope - record what a process tree does over time and watch it live
#[derive(Debug, Parser)]
#[command(name = "runscope")]
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Serve recorded and in-progress runs to viewers
    Serve(ServeArgs),
    /// Run a program under supervision and record it
    Run(RunArgs),
}

#[derive(Debug, Args)]
pub struct LogArgs {
    /// Logging level (simple version, e.g. 'info', 'debug')
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Advanced logging filter (e.g. "runscope=debug,notify=info")
    /// This overrides log_level if provided
    #[arg(long)]
    pub log_filter: Option<String>,

    /// Log directory [default: $RUNSCOPE_HOME/logs]
    #[arg(long)]
    pub log_dir: Option<String>,
}

impl LogArgs {
    pub fn level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or_else(|_| {
            eprintln!(
                "Invalid log level: {}. Defaulting to 'info'.",
                self.log_level
            );
            tracing::Level::INFO
        })
    }

    pub fn log_dir(&self) -> Result<PathBuf> {
        match &self.log_dir {
            Some(dir) => {
                let dir = shellexpand::full(dir)
                    .map_err(|e| anyhow!("Failed to expand log directory: {}", e))?;
                Ok(PathBuf::from(dir.as_ref()))
            }
            None => Ok(get_runscope_home().join("logs")),
        }
    }
}

#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Address to bind the server to [default: from config, 127.0.0.1:3010]
    #[arg(short, long)]
    pub address: Option<SocketAddr>,

    /// Directory holding the recorded runs [default: from config]
    #[arg(long)]
    pub samples_root: Option<String>,

    /// Configuration file [default: $RUNSCOPE_HOME/config.toml]
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LogArgs,

    /// Log to stdout
    #[arg(long)]
    pub log_stdout: bool,
}

impl ServeArgs {
    /// Configuration file overlaid with the command line
    pub fn config(&self) -> Result<RunscopeConfig> {
        let mut config = RunscopeConfig::load(self.config.as_deref())?;
        if let Some(address) = self.address {
            config.server_address = address;
        }
        if let Some(root) = &self.samples_root {
            let root = shellexpand::full(root)
                .map_err(|e| anyhow!("Failed to expand samples root: {}", e))?;
            config.samples_root = PathBuf::from(root.as_ref());
        }
        Ok(config)
    }
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Configuration file [default: $RUNSCOPE_HOME/config.toml]
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Tag the supervised program registers under
    #[arg(long)]
    pub tag: Option<String>,

    /// How long to keep collecting after the program exits, in milliseconds
    #[arg(long)]
    pub grace_period_ms: Option<u64>,

    #[command(flatten)]
    pub logging: LogArgs,

    /// Program to run
    #[arg(required = true)]
    pub program: OsString,

    /// Arguments passed to the program
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<OsString>,
}

impl RunArgs {
    pub fn config(&self) -> Result<RunscopeConfig> {
        let mut config = RunscopeConfig::load(self.config.as_deref())?;
        if let Some(tag) = &self.tag {
            config.main_tag = tag.clone();
        }
        if let Some(grace) = self.grace_period_ms {
            config.grace_period_ms = grace;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_passes_program_arguments_through() {
        let cli = Cli::try_parse_from([
            "runscope", "run", "--tag", "build", "--", "cargo", "build", "--release",
        ])
        .unwrap();
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.program, "cargo");
                assert_eq!(args.args, vec!["build", "--release"]);
                assert_eq!(args.tag.as_deref(), Some("build"));
            }
            other => panic!("expected run, got {:?}", other),
        }
    }

    #[test]
    fn test_run_requires_a_program() {
        assert!(Cli::try_parse_from(["runscope", "run"]).is_err());
    }

    #[test]
    fn test_serve_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.toml");
        std::fs::write(
            &config_path,
            "server_address = \"127.0.0.1:4000\"\ntail_poll_ms = 100\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "runscope",
            "serve",
            "--config",
            config_path.to_str().unwrap(),
            "--address",
            "127.0.0.1:5000",
        ])
        .unwrap();
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.config().unwrap();
        assert_eq!(config.server_address.port(), 5000);
        assert_eq!(config.tail_poll_ms, 100);
    }

    #[test]
    fn test_log_dir_expands_variables() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("RUNSCOPE_CLI_TEST_LOGS", dir.path());
        let logging = LogArgs {
            log_level: "debug".to_string(),
            log_filter: None,
            log_dir: Some("$RUNSCOPE_CLI_TEST_LOGS/runs".to_string()),
        };
        assert_eq!(logging.log_dir().unwrap(), dir.path().join("runs"));
        assert_eq!(logging.level(), tracing::Level::DEBUG);
    }
}
