//! # Collector
//!
//! The one task that writes a run's log. Registrations, probe batches,
//! activity edges, status changes and resource samples all arrive here as
//! commands and are appended in arrival order, so the log has a single
//! serialized writer without any locking.
//!
//! Callers talk to the task through a cloneable [`CollectorHandle`]. Every
//! command carries a oneshot reply, so a caller knows its events were written
//! (or dropped by the ceiling) before it acks its own peer.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, trace};

use crate::errors::{Result, RunscopeError};
use crate::event_log::EventLog;
use crate::events::{DelayReading, EventData, EventTime, PendingEvent, RunStatus};
use crate::registry::{ProcessRegistry, Registration};
use crate::sampler::{ResourceSource, Sampler, SysinfoSource};
use crate::summary::RunSummary;

const COMMAND_BUFFER: usize = 256;

#[derive(Debug)]
pub enum CollectorCommand {
    Register {
        registration: Registration,
        response_tx: oneshot::Sender<bool>,
    },
    DelaySamples {
        samples: Vec<DelayReading>,
        response_tx: oneshot::Sender<usize>,
    },
    /// An activity edge; triggers an immediate resource sample
    Activity {
        event: PendingEvent,
        response_tx: oneshot::Sender<bool>,
    },
    /// A status change; triggers an immediate resource sample
    Status {
        status: RunStatus,
        time: EventTime,
        response_tx: oneshot::Sender<bool>,
    },
    /// The supervised process exited: record `Done`, close the time axis and
    /// stop sampling. Replies with the ceiling.
    Finish { response_tx: oneshot::Sender<u64> },
    Shutdown {
        response_tx: oneshot::Sender<RunSummary>,
    },
}

#[derive(Clone)]
pub struct CollectorHandle {
    command_tx: mpsc::Sender<CollectorCommand>,
}

impl CollectorHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> CollectorCommand,
    ) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build(response_tx))
            .await
            .map_err(|_| RunscopeError::ChannelClosed("collector"))?;
        response_rx
            .await
            .map_err(|_| RunscopeError::ChannelClosed("collector reply"))
    }

    /// Returns false if the pid was already registered
    pub async fn register(&self, registration: Registration) -> Result<bool> {
        self.request(|response_tx| CollectorCommand::Register {
            registration,
            response_tx,
        })
        .await
    }

    /// Returns how many samples were kept
    pub async fn push_delay_samples(&self, samples: Vec<DelayReading>) -> Result<usize> {
        self.request(|response_tx| CollectorCommand::DelaySamples {
            samples,
            response_tx,
        })
        .await
    }

    pub async fn activity(&self, data: EventData, time: EventTime) -> Result<bool> {
        self.request(|response_tx| CollectorCommand::Activity {
            event: PendingEvent { data, time },
            response_tx,
        })
        .await
    }

    pub async fn status(&self, status: RunStatus, time: EventTime) -> Result<bool> {
        self.request(|response_tx| CollectorCommand::Status {
            status,
            time,
            response_tx,
        })
        .await
    }

    pub async fn finish(&self) -> Result<u64> {
        self.request(|response_tx| CollectorCommand::Finish { response_tx })
            .await
    }

    pub async fn shutdown(&self) -> Result<RunSummary> {
        self.request(|response_tx| CollectorCommand::Shutdown { response_tx })
            .await
    }
}

pub struct Collector<S: ResourceSource = SysinfoSource> {
    log: EventLog,
    registry: ProcessRegistry,
    sampler: Sampler<S>,
    summary: RunSummary,
    interval: Duration,
    sampling: bool,
    command_rx: mpsc::Receiver<CollectorCommand>,
}

impl<S: ResourceSource> Collector<S> {
    pub fn new(log: EventLog, sampler: Sampler<S>, interval: Duration) -> (Self, CollectorHandle) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let collector = Self {
            log,
            registry: ProcessRegistry::new(),
            sampler,
            summary: RunSummary::new(),
            interval,
            sampling: true,
            command_rx,
        };
        (collector, CollectorHandle { command_tx })
    }

    /// Process commands until shutdown or until every handle is dropped.
    /// Returns the summary of everything written.
    pub async fn run(mut self) -> RunSummary {
        info!("Collector started for {:?}", self.log.path());
        let mut next_tick = Instant::now() + self.interval;

        loop {
            tokio::select! {
                command = self.command_rx.recv() => {
                    let Some(command) = command else {
                        debug!("All collector handles dropped");
                        break;
                    };
                    match command {
                        CollectorCommand::Shutdown { response_tx } => {
                            self.close();
                            let _ = response_tx.send(self.summary.clone());
                            break;
                        }
                        command => {
                            if self.handle_command(command).await {
                                next_tick = Instant::now() + self.interval;
                            }
                        }
                    }
                }
                _ = sleep_until(next_tick), if self.sampling => {
                    self.sample().await;
                    // Armed only after the poll returned
                    next_tick = Instant::now() + self.interval;
                }
            }
        }

        self.close();
        self.summary
    }

    /// Returns true if the command caused a resource sample
    async fn handle_command(&mut self, command: CollectorCommand) -> bool {
        match command {
            CollectorCommand::Register {
                registration,
                response_tx,
            } => {
                let added = match self.registry.register(registration) {
                    Some(data) => {
                        self.append(PendingEvent::now(data));
                        true
                    }
                    None => false,
                };
                let _ = response_tx.send(added);
                false
            }
            CollectorCommand::DelaySamples {
                samples,
                response_tx,
            } => {
                trace!("Received {} delay samples", samples.len());
                let kept = samples
                    .into_iter()
                    .filter(|reading| self.append(reading.clone().into()))
                    .count();
                let _ = response_tx.send(kept);
                false
            }
            CollectorCommand::Activity { event, response_tx } => {
                let kept = self.append(event);
                let _ = response_tx.send(kept);
                self.sample_now().await
            }
            CollectorCommand::Status {
                status,
                time,
                response_tx,
            } => {
                let kept = self.append(PendingEvent {
                    data: EventData::StatusChange { status },
                    time,
                });
                let _ = response_tx.send(kept);
                self.sample_now().await
            }
            CollectorCommand::Finish { response_tx } => {
                let ceiling = self.log.mark_finished();
                self.append(PendingEvent::with_elapsed(
                    EventData::StatusChange {
                        status: RunStatus::Done,
                    },
                    ceiling,
                ));
                self.sampling = false;
                self.registry.clear_active();
                info!("Run finished at {}ms", ceiling);
                let _ = response_tx.send(ceiling);
                false
            }
            CollectorCommand::Shutdown { .. } => false,
        }
    }

    async fn sample_now(&mut self) -> bool {
        if !self.sampling {
            return false;
        }
        self.sample().await;
        true
    }

    async fn sample(&mut self) {
        let pids = self.registry.active_pids();
        if pids.is_empty() {
            return;
        }
        let readings = self.sampler.poll(pids.clone()).await;
        for data in Sampler::<S>::collect(&mut self.registry, &pids, &readings) {
            self.append(PendingEvent::now(data));
        }
    }

    /// Returns true if the event was written
    fn append(&mut self, event: PendingEvent) -> bool {
        match self.log.append(event) {
            Ok(Some(record)) => {
                self.summary.apply(&record);
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!("Failed to append to run log: {}", e);
                false
            }
        }
    }

    fn close(&mut self) {
        if let Err(e) = self.log.flush() {
            error!("Failed to flush run log: {}", e);
        }
        debug!(
            "Collector closing: {} written, {} dropped",
            self.log.written(),
            self.log.dropped()
        );
    }
}
