//! # Run Events
//!
//! The closed set of facts recorded in a run log. Every record carries
//! `elapsed`, the number of milliseconds since the run's start anchor, which is
//! the canonical time axis of the log. Records are serialized as one JSON object
//! per line with a `type` discriminator:
//!
//! ```json
//! {"type":"RESOURCE_SAMPLE","pid":100,"cpu_percent":5.0,"memory_bytes":1000,"elapsed":10}
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status reported for the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    InProgress,
    Done,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::InProgress => write!(f, "in progress"),
            RunStatus::Done => write!(f, "done"),
        }
    }
}

/// Payload of a run event, without its position on the time axis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventData {
    /// A process joined the run and is now being sampled
    ProcessRegister {
        pid: u32,
        tag: String,
        label: String,
        argv: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },

    /// A named span of work began. Spans are matched by `uuid` only.
    ActivityStart { uuid: String, label: String },

    /// The span with this `uuid` finished
    ActivityEnd {
        uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },

    /// One OS-level resource reading for a registered process
    ResourceSample {
        pid: u32,
        cpu_percent: f64,
        memory_bytes: u64,
    },

    /// Responsiveness lag measured inside an instrumented process
    DelaySample { pid: u32, delay_millis: u64 },

    StatusChange { status: RunStatus },
}

impl EventData {
    pub fn kind(&self) -> &'static str {
        match self {
            EventData::ProcessRegister { .. } => "process_register",
            EventData::ActivityStart { .. } => "activity_start",
            EventData::ActivityEnd { .. } => "activity_end",
            EventData::ResourceSample { .. } => "resource_sample",
            EventData::DelaySample { .. } => "delay_sample",
            EventData::StatusChange { .. } => "status_change",
        }
    }

    /// The process this event is about, if any
    pub fn pid(&self) -> Option<u32> {
        match self {
            EventData::ProcessRegister { pid, .. }
            | EventData::ResourceSample { pid, .. }
            | EventData::DelaySample { pid, .. } => Some(*pid),
            EventData::ActivityStart { .. }
            | EventData::ActivityEnd { .. }
            | EventData::StatusChange { .. } => None,
        }
    }
}

/// A record as it appears in the run log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub data: EventData,
    /// Milliseconds since the run's start anchor
    pub elapsed: u64,
}

impl Event {
    pub fn new(data: EventData, elapsed: u64) -> Self {
        Self { data, elapsed }
    }

    /// Serialize as one log line, trailing newline included
    pub fn to_line(&self) -> Result<String, serde_json::Error> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end_matches('\r'))
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}ms {}", self.elapsed, self.data.kind())?;
        if let Some(pid) = self.data.pid() {
            write!(f, " pid={}", pid)?;
        }
        Ok(())
    }
}

/// Where an incoming event sits in time before the log assigns `elapsed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventTime {
    /// Stamp with the writer's wall clock at append time
    Now,
    /// Wall-clock unix milliseconds observed by the producer
    At(i64),
    /// Already on the run's time axis
    Elapsed(u64),
}

/// An event waiting to be appended to the log
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub data: EventData,
    pub time: EventTime,
}

impl PendingEvent {
    pub fn now(data: EventData) -> Self {
        Self {
            data,
            time: EventTime::Now,
        }
    }

    pub fn at(data: EventData, timestamp_ms: i64) -> Self {
        Self {
            data,
            time: EventTime::At(timestamp_ms),
        }
    }

    pub fn with_elapsed(data: EventData, elapsed: u64) -> Self {
        Self {
            data,
            time: EventTime::Elapsed(elapsed),
        }
    }
}

/// A delay measurement as pushed by the in-process probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayReading {
    pub pid: u32,
    pub delay_millis: u64,
    /// Wall-clock unix milliseconds at which the reading was taken
    pub timestamp: i64,
}

impl From<DelayReading> for PendingEvent {
    fn from(reading: DelayReading) -> Self {
        PendingEvent::at(
            EventData::DelaySample {
                pid: reading.pid,
                delay_millis: reading.delay_millis,
            },
            reading.timestamp,
        )
    }
}

/// Current wall clock as unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_line_format_uses_type_tag() {
        let event = Event::new(
            EventData::ResourceSample {
                pid: 100,
                cpu_percent: 5.0,
                memory_bytes: 1000,
            },
            10,
        );
        let line = event.to_line().unwrap();
        assert!(line.ends_with('\n'));

        let value: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
        assert_eq!(value["type"], "RESOURCE_SAMPLE");
        assert_eq!(value["pid"], 100);
        assert_eq!(value["elapsed"], 10);
    }

    #[test]
    fn test_parse_status_change() {
        let event = Event::from_line(r#"{"type":"STATUS_CHANGE","status":"IN_PROGRESS","elapsed":3}"#)
            .unwrap();
        assert_eq!(
            event,
            Event::new(
                EventData::StatusChange {
                    status: RunStatus::InProgress
                },
                3
            )
        );
    }

    #[test]
    fn test_parse_tolerates_carriage_return() {
        let event =
            Event::from_line("{\"type\":\"ACTIVITY_END\",\"uuid\":\"a\",\"elapsed\":50}\r").unwrap();
        assert_eq!(event.elapsed, 50);
        assert_eq!(event.data.pid(), None);
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Event::from_line(r#"{"type":"CPU_MEM","elapsed":1}"#).is_err());
    }

    #[test]
    fn test_delay_reading_keeps_timestamp() {
        let pending: PendingEvent = DelayReading {
            pid: 7,
            delay_millis: 12,
            timestamp: 1_000,
        }
        .into();
        assert_eq!(pending.time, EventTime::At(1_000));
        assert_eq!(pending.data.pid(), Some(7));
    }
}
