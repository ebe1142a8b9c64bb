#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use runscope::{Event, ResourceSource, ResourceUsage};

/// Reports the same usage for every pid it is asked about
pub struct StaticSource {
    pub usage: ResourceUsage,
}

impl StaticSource {
    pub fn new() -> Self {
        Self {
            usage: ResourceUsage {
                cpu_percent: 1.0,
                memory_bytes: 4096,
            },
        }
    }
}

impl ResourceSource for StaticSource {
    fn poll(&mut self, pids: &[u32]) -> HashMap<u32, ResourceUsage> {
        pids.iter().map(|pid| (*pid, self.usage)).collect()
    }
}

pub fn append_events(path: &Path, events: &[Event]) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    for event in events {
        file.write_all(event.to_line().unwrap().as_bytes()).unwrap();
    }
    file.flush().unwrap();
}

pub fn read_events(path: &Path) -> Vec<Event> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| Event::from_line(line).unwrap())
        .collect()
}

/// Poll `check` until it returns `Some` or the timeout passes
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
