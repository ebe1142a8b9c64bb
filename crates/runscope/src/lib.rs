//! # Runscope
//!
//! Runscope records what a supervised build or dev-server process tree does
//! over time and keeps it readable while the run is still going.
//!
//! ## Core Features
//!
//! * **Run Logs**: one append-only JSON-lines file per run, on a run-relative time axis
//! * **Resource Sampling**: batched CPU and memory polling for a changing set of pids
//! * **Delay Probe**: in-process responsiveness measurement, flushed even on exit
//! * **Registration Channel**: short-lived local sessions workers use to join a run
//! * **Run Index**: filesystem-driven project/run map with change notifications
//! * **Tailing**: incremental readers for logs another process is still writing
//!
//! ## Architecture
//!
//! * `Supervisor`: launches the program and drives one run end to end
//! * `Collector`: the single writer of a run log
//! * `ChannelServer` / `ChannelClient`: the registration channel
//! * `IndexService`: watches the samples root and owns the `RunIndex`
//! * `RunTail`: per-subscriber reader used by the live-tail server

pub mod channel;
pub mod collector;
pub mod config;
pub mod errors;
pub mod event_log;
pub mod events;
pub mod index;
pub mod logging;
pub mod meta;
pub mod probe;
pub mod project;
pub mod registry;
pub mod sampler;
pub mod summary;
pub mod supervisor;
pub mod tail;

pub use channel::{ChannelClient, ChannelId, ChannelMessage, ChannelServer};
pub use collector::{Collector, CollectorHandle};
pub use config::RunscopeConfig;
pub use errors::{Result, RunscopeError};
pub use event_log::EventLog;
pub use events::{DelayReading, Event, EventData, EventTime, PendingEvent, RunStatus};
pub use index::{IndexEvent, IndexHandle, IndexService, ProjectInfo, ProjectSummary, RunIndex, RunInfo};
pub use meta::{MetaUpdate, RunMeta};
pub use probe::{ProbeConfig, ProbeGuard};
pub use project::{ProjectId, RunLocation};
pub use registry::{ProcessRegistry, Registration};
pub use sampler::{ResourceSource, ResourceUsage, Sampler, SysinfoSource};
pub use summary::{Activity, ProcessStats, RunSummary};
pub use supervisor::{RunOutcome, Supervisor};
pub use tail::{RunTail, TailOptions, TailState};
