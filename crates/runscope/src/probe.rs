//! # Delay Probe
//!
//! Runs inside an instrumented process. A background task sleeps for the
//! sample interval and records how late each wake-up was; a busy runtime
//! shows up as growing delay. Readings are buffered and pushed to the
//! supervisor about once per second, and whatever is still buffered is
//! flushed on the way out: when the guard drops, on panic, and on
//! SIGINT/SIGTERM.
//!
//! The probe only ever holds channel connections for the length of one send,
//! and its task is a plain tokio task, so it never keeps the host alive.
//!
//! ```ignore
//! let _probe = runscope::probe::install(ProbeConfig::new("Worker"));
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::channel::{ChannelClient, ChannelMessage};
use crate::config::{RunscopeConfig, DEFAULT_SAMPLE_INTERVAL_MS};
use crate::events::{now_millis, DelayReading, RunStatus};
use crate::registry::Registration;

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub tag: String,
    pub label: Option<String>,
    pub command: Option<String>,
    pub interval: Duration,
    /// Buffered readings that trigger a flush
    pub flush_threshold: usize,
    /// Flush and exit on SIGINT/SIGTERM
    pub handle_signals: bool,
}

impl ProbeConfig {
    pub fn new(tag: impl Into<String>) -> Self {
        let interval = Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS);
        Self {
            tag: tag.into(),
            label: None,
            command: None,
            interval,
            flush_threshold: (1000 / DEFAULT_SAMPLE_INTERVAL_MS) as usize,
            handle_signals: true,
        }
    }

    pub fn from_config(tag: impl Into<String>, config: &RunscopeConfig) -> Self {
        Self {
            interval: config.sample_interval(),
            flush_threshold: config.probe_flush_threshold(),
            ..Self::new(tag)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn without_signal_handlers(mut self) -> Self {
        self.handle_signals = false;
        self
    }
}

struct ProbeShared {
    client: ChannelClient,
    pid: u32,
    buffer: Mutex<Vec<DelayReading>>,
    flush_threshold: usize,
}

impl ProbeShared {
    fn take_buffer(&self) -> Vec<DelayReading> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *buffer)
    }

    /// Returns a full batch when the threshold is reached
    fn record(&self, reading: DelayReading) -> Option<Vec<DelayReading>> {
        let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
        buffer.push(reading);
        if buffer.len() >= self.flush_threshold {
            Some(std::mem::take(&mut *buffer))
        } else {
            None
        }
    }

    fn flush_blocking(&self) {
        let samples = self.take_buffer();
        if samples.is_empty() {
            return;
        }
        let count = samples.len();
        match self
            .client
            .send_blocking(&ChannelMessage::DelaySamples { samples })
        {
            Ok(()) => debug!("Flushed {} delay samples on exit", count),
            Err(e) => debug!("Lost {} delay samples on exit: {}", count, e),
        }
    }
}

/// Keeps the probe running. Dropping it stops measuring and flushes.
pub struct ProbeGuard {
    shared: Arc<ProbeShared>,
    measure_task: JoinHandle<()>,
}

/// Start probing if this process was launched under a supervisor. Must be
/// called from within a tokio runtime.
pub fn install(config: ProbeConfig) -> Option<ProbeGuard> {
    let client = ChannelClient::from_env()?;
    Some(install_with_client(config, client))
}

pub fn install_with_client(config: ProbeConfig, client: ChannelClient) -> ProbeGuard {
    let pid = std::process::id();
    let shared = Arc::new(ProbeShared {
        client,
        pid,
        buffer: Mutex::new(Vec::new()),
        flush_threshold: config.flush_threshold.max(1),
    });
    info!("Delay probe installed for pid {} ({})", pid, config.tag);

    let registration = Registration {
        pid,
        tag: config.tag,
        label: config.label,
        argv: std::env::args().collect(),
        command: config.command,
    };

    let measure_task = tokio::spawn(measure(Arc::clone(&shared), registration, config.interval));
    if config.handle_signals {
        // Outlives the guard: once tokio owns a signal the default action is
        // gone, so this task has to keep turning it into an exit.
        tokio::spawn(flush_on_signal(Arc::clone(&shared)));
    }
    install_panic_hook(Arc::clone(&shared));

    ProbeGuard {
        shared,
        measure_task,
    }
}

async fn measure(shared: Arc<ProbeShared>, registration: Registration, interval: Duration) {
    // Registration goes first so the collector knows the pid before any sample
    shared
        .client
        .send_quietly(&ChannelMessage::Register(registration))
        .await;

    let mut expected = Instant::now() + interval;
    loop {
        sleep_until(expected).await;
        let woke = Instant::now();
        let reading = DelayReading {
            pid: shared.pid,
            delay_millis: woke.saturating_duration_since(expected).as_millis() as u64,
            timestamp: now_millis(),
        };

        if let Some(samples) = shared.record(reading) {
            shared
                .client
                .send_quietly(&ChannelMessage::DelaySamples { samples })
                .await;
        }
        expected = woke + interval;
    }
}

async fn flush_on_signal(shared: Arc<ProbeShared>) {
    use tokio::signal::unix::{signal, SignalKind};

    let (Ok(mut interrupt), Ok(mut terminate)) = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) else {
        debug!("Could not install probe signal handlers");
        return;
    };

    let signo = tokio::select! {
        _ = interrupt.recv() => 2,
        _ = terminate.recv() => 15,
    };
    shared.flush_blocking();
    std::process::exit(128 + signo);
}

fn install_panic_hook(shared: Arc<ProbeShared>) {
    let previous = std::panic::take_hook();
    let weak = Arc::downgrade(&shared);
    std::panic::set_hook(Box::new(move |info| {
        if let Some(shared) = weak.upgrade() {
            shared.flush_blocking();
        }
        previous(info);
    }));
}

impl ProbeGuard {
    fn spawn_send(&self, message: ChannelMessage) {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            shared.client.send_quietly(&message).await;
        });
    }

    /// Mark the start of a named span of work. Returns the span's uuid.
    pub fn activity_start(&self, label: impl Into<String>) -> String {
        let uuid = Uuid::new_v4().to_string();
        self.spawn_send(ChannelMessage::ActivityStart {
            uuid: uuid.clone(),
            label: label.into(),
            timestamp: now_millis(),
        });
        uuid
    }

    pub fn activity_end(&self, uuid: impl Into<String>) {
        self.spawn_send(ChannelMessage::ActivityEnd {
            uuid: uuid.into(),
            label: None,
            timestamp: now_millis(),
        });
    }

    pub fn set_status(&self, status: RunStatus) {
        self.spawn_send(ChannelMessage::Status {
            status,
            timestamp: now_millis(),
        });
    }

    /// Push buffered readings now instead of waiting for the threshold
    pub async fn flush(&self) -> bool {
        let samples = self.shared.take_buffer();
        if samples.is_empty() {
            return true;
        }
        self.shared
            .client
            .send_quietly(&ChannelMessage::DelaySamples { samples })
            .await
    }

    pub fn pending(&self) -> usize {
        self.shared
            .buffer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Drop for ProbeGuard {
    fn drop(&mut self) {
        self.measure_task.abort();
        self.shared.flush_blocking();
    }
}
