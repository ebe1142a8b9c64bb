//! # Resource Sampler
//!
//! Polls OS resource usage for every active pid in one batched call. The
//! collector drives it with a self-rescheduling timer: the next tick is only
//! armed after the previous poll has returned, so two polls never run against
//! the process table at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::events::EventData;
use crate::registry::ProcessRegistry;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceUsage {
    pub cpu_percent: f64,
    pub memory_bytes: u64,
}

/// Batched source of per-process resource readings. Pids missing from the
/// returned map no longer resolve.
#[cfg_attr(test, mockall::automock)]
pub trait ResourceSource: Send + 'static {
    fn poll(&mut self, pids: &[u32]) -> HashMap<u32, ResourceUsage>;
}

pub struct SysinfoSource {
    system: System,
}

impl SysinfoSource {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSource for SysinfoSource {
    fn poll(&mut self, pids: &[u32]) -> HashMap<u32, ResourceUsage> {
        let targets: Vec<Pid> = pids.iter().map(|pid| Pid::from_u32(*pid)).collect();
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&targets),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );

        targets
            .iter()
            .filter_map(|pid| {
                let process = self.system.process(*pid)?;
                // An exited child that has not been reaped yet
                if process.status() == ProcessStatus::Zombie {
                    return None;
                }
                Some((
                    pid.as_u32(),
                    ResourceUsage {
                        cpu_percent: process.cpu_usage() as f64,
                        memory_bytes: process.memory(),
                    },
                ))
            })
            .collect()
    }
}

/// Owns a resource source and turns its readings into events
pub struct Sampler<S: ResourceSource = SysinfoSource> {
    source: Arc<Mutex<S>>,
}

impl<S: ResourceSource> Clone for Sampler<S> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
        }
    }
}

impl Sampler<SysinfoSource> {
    pub fn system() -> Self {
        Self::new(SysinfoSource::new())
    }
}

impl<S: ResourceSource> Sampler<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Arc::new(Mutex::new(source)),
        }
    }

    /// Run one poll on the blocking pool
    pub async fn poll(&self, pids: Vec<u32>) -> HashMap<u32, ResourceUsage> {
        if pids.is_empty() {
            return HashMap::new();
        }

        let source = Arc::clone(&self.source);
        let result = tokio::task::spawn_blocking(move || {
            let mut source = source.lock().unwrap_or_else(|e| e.into_inner());
            source.poll(&pids)
        })
        .await;

        match result {
            Ok(readings) => readings,
            Err(e) => {
                warn!("Resource poll failed: {}", e);
                HashMap::new()
            }
        }
    }

    /// Turn the readings for `polled` into samples. Any polled pid without a
    /// reading has exited and is dropped from the registry.
    pub fn collect(
        registry: &mut ProcessRegistry,
        polled: &[u32],
        readings: &HashMap<u32, ResourceUsage>,
    ) -> Vec<EventData> {
        let mut samples = Vec::with_capacity(readings.len());
        for pid in polled {
            match readings.get(pid) {
                Some(usage) => samples.push(EventData::ResourceSample {
                    pid: *pid,
                    cpu_percent: usage.cpu_percent,
                    memory_bytes: usage.memory_bytes,
                }),
                None => {
                    if registry.deactivate(*pid) {
                        debug!("Process {} no longer resolves, stopped sampling", pid);
                    }
                }
            }
        }
        samples
    }
}
