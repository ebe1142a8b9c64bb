//! # Run Summary
//!
//! Folds a stream of run events into the view a front end draws: registered
//! processes, activity spans, per-process maxima and the overall start/end
//! markers. The supervisor runs the same fold over what it writes so the
//! maxima can be persisted into the run meta without re-reading the log.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::events::{Event, EventData, RunStatus};

/// Running maxima and lifetime markers for one process
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    pub cpu_max: f64,
    pub mem_max: u64,
    pub delay_max: u64,
    /// Elapsed at registration
    pub start: u64,
    /// Elapsed of the last sample seen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessEntry {
    /// Registration order within the run
    pub index: usize,
    pub pid: u32,
    pub tag: String,
    pub label: String,
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    pub registered_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activity {
    pub uuid: String,
    pub label: String,
    pub start: u64,
    pub end: Option<u64>,
}

impl Activity {
    /// Span length, once the activity has ended
    pub fn duration(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub processes: Vec<ProcessEntry>,
    pub activities: Vec<Activity>,
    pub stats: BTreeMap<u32, ProcessStats>,
    pub main_start: Option<u64>,
    pub main_end: Option<u64>,
    /// Largest elapsed seen in any event
    pub last_elapsed: u64,
    #[serde(skip)]
    open_activities: HashMap<String, usize>,
}

impl RunSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Event>) -> Self {
        let mut summary = Self::new();
        for event in events {
            summary.apply(event);
        }
        summary
    }

    pub fn apply(&mut self, event: &Event) {
        let elapsed = event.elapsed;
        self.last_elapsed = self.last_elapsed.max(elapsed);

        match &event.data {
            EventData::ProcessRegister {
                pid,
                tag,
                label,
                argv,
                command,
            } => {
                self.processes.push(ProcessEntry {
                    index: self.processes.len(),
                    pid: *pid,
                    tag: tag.clone(),
                    label: label.clone(),
                    argv: argv.clone(),
                    command: command.clone(),
                    registered_at: elapsed,
                });
                self.stats.insert(
                    *pid,
                    ProcessStats {
                        start: elapsed,
                        ..Default::default()
                    },
                );
            }
            EventData::ActivityStart { uuid, label } => {
                self.open_activities
                    .insert(uuid.clone(), self.activities.len());
                self.activities.push(Activity {
                    uuid: uuid.clone(),
                    label: label.clone(),
                    start: elapsed,
                    end: None,
                });
            }
            EventData::ActivityEnd { uuid, .. } => match self.open_activities.remove(uuid) {
                Some(index) => self.activities[index].end = Some(elapsed),
                None => debug!("Activity {} ended without starting", uuid),
            },
            EventData::ResourceSample {
                pid,
                cpu_percent,
                memory_bytes,
            } => {
                let stats = self.stats.entry(*pid).or_default();
                stats.cpu_max = stats.cpu_max.max(*cpu_percent);
                stats.mem_max = stats.mem_max.max(*memory_bytes);
                stats.end = Some(elapsed);
            }
            EventData::DelaySample { pid, delay_millis } => {
                let stats = self.stats.entry(*pid).or_default();
                stats.delay_max = stats.delay_max.max(*delay_millis);
                stats.end = Some(elapsed);
            }
            EventData::StatusChange { status } => {
                let marker = match status {
                    RunStatus::InProgress => &mut self.main_start,
                    RunStatus::Done => &mut self.main_end,
                };
                if marker.is_none() {
                    *marker = Some(elapsed);
                }
            }
        }
    }

    pub fn activity(&self, uuid: &str) -> Option<&Activity> {
        self.activities.iter().find(|a| a.uuid == uuid)
    }

    pub fn process(&self, pid: u32) -> Option<&ProcessEntry> {
        self.processes.iter().find(|p| p.pid == pid)
    }

    pub fn is_done(&self) -> bool {
        self.main_end.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn register(pid: u32, label: &str, elapsed: u64) -> Event {
        Event::new(
            EventData::ProcessRegister {
                pid,
                tag: "Main".to_string(),
                label: label.to_string(),
                argv: vec![],
                command: None,
            },
            elapsed,
        )
    }

    #[test]
    fn test_activity_duration() {
        let events = vec![
            Event::new(
                EventData::ActivityStart {
                    uuid: "a".to_string(),
                    label: "build".to_string(),
                },
                5,
            ),
            Event::new(
                EventData::ActivityEnd {
                    uuid: "a".to_string(),
                    label: None,
                },
                50,
            ),
        ];
        let summary = RunSummary::from_events(&events);
        assert_eq!(summary.activity("a").and_then(Activity::duration), Some(45));
    }

    #[test]
    fn test_unmatched_end_is_ignored() {
        let events = vec![Event::new(
            EventData::ActivityEnd {
                uuid: "ghost".to_string(),
                label: None,
            },
            10,
        )];
        let summary = RunSummary::from_events(&events);
        assert!(summary.activities.is_empty());
    }

    #[test]
    fn test_maxima_and_markers() {
        let events = vec![
            register(100, "Main", 0),
            Event::new(
                EventData::ResourceSample {
                    pid: 100,
                    cpu_percent: 5.0,
                    memory_bytes: 1000,
                },
                10,
            ),
            Event::new(
                EventData::ResourceSample {
                    pid: 100,
                    cpu_percent: 2.0,
                    memory_bytes: 3000,
                },
                260,
            ),
            Event::new(
                EventData::DelaySample {
                    pid: 100,
                    delay_millis: 40,
                },
                300,
            ),
        ];
        let summary = RunSummary::from_events(&events);
        let stats = &summary.stats[&100];
        assert_eq!(stats.cpu_max, 5.0);
        assert_eq!(stats.mem_max, 3000);
        assert_eq!(stats.delay_max, 40);
        assert_eq!(stats.start, 0);
        assert_eq!(stats.end, Some(300));
        assert_eq!(summary.process(100).map(|p| p.index), Some(0));
    }

    #[test]
    fn test_first_status_wins() {
        let status = |status, elapsed| Event::new(EventData::StatusChange { status }, elapsed);
        let events = vec![
            status(RunStatus::InProgress, 1),
            status(RunStatus::InProgress, 5),
            status(RunStatus::Done, 90),
            status(RunStatus::Done, 95),
        ];
        let summary = RunSummary::from_events(&events);
        assert_eq!(summary.main_start, Some(1));
        assert_eq!(summary.main_end, Some(90));
        assert!(summary.is_done());
    }
}
