//! # Supervisor
//!
//! Launches one program as a run and collects its telemetry:
//!
//! 1. derive the project id and run timestamp, create and anchor the log
//! 2. start the collector and the registration channel
//! 3. spawn the program with the channel id in its environment and register
//!    it under the main tag, then record `IN_PROGRESS`
//! 4. when it exits, record `DONE`, close the time axis and stop sampling
//! 5. keep the channel open for the grace period so trailing probe flushes
//!    from the process tree still land
//! 6. close the channel and write the run summary into the run meta

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitStatus;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::channel::{ChannelId, ChannelServer};
use crate::collector::Collector;
use crate::config::{RunscopeConfig, CHANNEL_ENV_VAR};
use crate::event_log::EventLog;
use crate::events::{now_millis, EventTime, RunStatus};
use crate::meta::{save_meta, MetaUpdate};
use crate::project::{ProjectId, RunLocation};
use crate::registry::Registration;
use crate::sampler::{ResourceSource, Sampler, SysinfoSource};
use crate::summary::RunSummary;

#[derive(Debug)]
pub struct RunOutcome {
    pub location: RunLocation,
    pub log_path: PathBuf,
    pub status: ExitStatus,
    pub summary: RunSummary,
}

pub struct Supervisor<S: ResourceSource = SysinfoSource> {
    config: RunscopeConfig,
    program: OsString,
    args: Vec<OsString>,
    working_dir: Option<PathBuf>,
    sampler: Sampler<S>,
}

impl Supervisor<SysinfoSource> {
    pub fn new(config: RunscopeConfig, program: impl Into<OsString>) -> Self {
        Self::with_sampler(config, program, Sampler::system())
    }
}

impl<S: ResourceSource> Supervisor<S> {
    pub fn with_sampler(
        config: RunscopeConfig,
        program: impl Into<OsString>,
        sampler: Sampler<S>,
    ) -> Self {
        Self {
            config,
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            sampler,
        }
    }

    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn argv(&self) -> Vec<String> {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    fn recorded_env(&self) -> BTreeMap<String, String> {
        self.config
            .record_env
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.clone(), value)))
            .collect()
    }

    pub async fn run(self) -> Result<RunOutcome> {
        let working_dir = match &self.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        let root = self.config.samples_root.clone();
        let started = now_millis();
        let location = RunLocation::new(ProjectId::for_working_dir(&working_dir), started as u64);
        let log_path = location.log_path(&root);
        info!("Starting run {} at {:?}", location, log_path);

        let mut log = EventLog::create(&log_path)
            .with_context(|| format!("Failed to create run log {:?}", log_path))?;
        log.anchor(started);

        let (collector, handle) =
            Collector::new(log, self.sampler.clone(), self.config.sample_interval());
        let collector_task = tokio::spawn(collector.run());

        let channel_id = ChannelId::for_run(location.timestamp);
        let channel = ChannelServer::bind(&channel_id, handle.clone())?.spawn();

        let argv = self.argv();
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .current_dir(&working_dir)
            .env(CHANNEL_ENV_VAR, channel_id.as_str());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to launch {:?}: {}", self.program, e);
                handle.finish().await?;
                channel.stop().await?;
                handle.shutdown().await?;
                return Err(e).with_context(|| format!("Failed to launch {:?}", self.program));
            }
        };

        if let Some(pid) = child.id() {
            handle
                .register(Registration {
                    pid,
                    tag: self.config.main_tag.clone(),
                    label: None,
                    command: Some(argv.join(" ")),
                    argv,
                })
                .await?;
        }
        handle.status(RunStatus::InProgress, EventTime::Now).await?;

        let (status, interrupted) = tokio::select! {
            status = child.wait() => (status?, false),
            _ = tokio::signal::ctrl_c() => {
                // The terminal delivers the interrupt to the child as well
                info!("Interrupted, waiting for the supervised process");
                (child.wait().await?, true)
            }
        };
        info!("Supervised process exited with {}", status);

        let ceiling = handle.finish().await?;
        debug!("Run closed at {}ms", ceiling);

        if !interrupted && !self.config.grace_period().is_zero() {
            debug!(
                "Waiting {:?} for trailing probe flushes",
                self.config.grace_period()
            );
            tokio::time::sleep(self.config.grace_period()).await;
        }

        channel.stop().await?;
        let summary = handle.shutdown().await?;
        drop(handle);
        collector_task.await?;

        let meta_path = location.meta_path(&root);
        save_meta(&meta_path, MetaUpdate::RecordSummary(summary.clone()))?;
        let env_vars = self.recorded_env();
        if !env_vars.is_empty() {
            save_meta(&meta_path, MetaUpdate::SetEnvVars(env_vars))?;
        }

        Ok(RunOutcome {
            location,
            log_path,
            status,
            summary,
        })
    }
}
