//! # Event Log
//!
//! Append-only, newline-delimited JSON record store for a single run.
//!
//! The writer assigns `elapsed` to every incoming event relative to the run's
//! start anchor, which is captured on the first append unless the supervisor
//! sets it explicitly. Two rules keep the time axis usable:
//!
//! * **Floor**: `elapsed` never goes backwards in write order. An event whose
//!   own timestamp precedes the anchor, or the last written record, is clamped
//!   up to that floor.
//! * **Ceiling**: once the run is marked finished, any event whose computed
//!   `elapsed` is past the ceiling is dropped. Late probe flushes that arrive
//!   after the supervised process exited therefore cannot extend the run.
//!
//! `EventLog` is not shared. The collector task owns it and is the only
//! writer for a run.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::errors::Result;
use crate::events::{now_millis, Event, EventTime, PendingEvent};

pub struct EventLog<W: Write = File> {
    writer: W,
    path: Option<PathBuf>,
    /// Unix milliseconds that map to elapsed 0
    start: Option<i64>,
    last_elapsed: u64,
    ceiling: Option<u64>,
    written: u64,
    dropped: u64,
}

impl EventLog<File> {
    /// Create (or truncate) the log file for a run
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        debug!("Created run log at {:?}", path);

        let mut log = Self::new(file);
        log.path = Some(path.to_path_buf());
        Ok(log)
    }
}

impl<W: Write> EventLog<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            path: None,
            start: None,
            last_elapsed: 0,
            ceiling: None,
            written: 0,
            dropped: 0,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Fix the start anchor. Has no effect once an anchor exists.
    pub fn anchor(&mut self, start_ms: i64) {
        if self.start.is_none() {
            self.start = Some(start_ms);
        }
    }

    pub fn start(&self) -> Option<i64> {
        self.start
    }

    pub fn ceiling(&self) -> Option<u64> {
        self.ceiling
    }

    pub fn is_finished(&self) -> bool {
        self.ceiling.is_some()
    }

    pub fn last_elapsed(&self) -> u64 {
        self.last_elapsed
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Elapsed time on this run's axis for a wall-clock instant
    pub fn elapsed_at(&self, now_ms: i64) -> u64 {
        match self.start {
            Some(start) => now_ms.saturating_sub(start).max(0) as u64,
            None => 0,
        }
    }

    pub fn append(&mut self, event: PendingEvent) -> Result<Option<Event>> {
        self.append_at(event, now_millis())
    }

    /// Append using `now_ms` as the writer's wall clock. Returns the record as
    /// written, or `None` if the ceiling dropped it.
    pub fn append_at(&mut self, event: PendingEvent, now_ms: i64) -> Result<Option<Event>> {
        let start = *self.start.get_or_insert(now_ms);

        let computed = match event.time {
            EventTime::Now => now_ms.saturating_sub(start).max(0) as u64,
            EventTime::At(timestamp) => timestamp.saturating_sub(start).max(0) as u64,
            EventTime::Elapsed(elapsed) => elapsed,
        };

        if let Some(ceiling) = self.ceiling {
            if computed > ceiling {
                self.dropped += 1;
                trace!(
                    "Dropping {} at {}ms past ceiling {}ms",
                    event.data.kind(),
                    computed,
                    ceiling
                );
                return Ok(None);
            }
        }

        let record = Event::new(event.data, computed.max(self.last_elapsed));
        self.writer.write_all(record.to_line()?.as_bytes())?;
        self.writer.flush()?;

        self.last_elapsed = record.elapsed;
        self.written += 1;
        Ok(Some(record))
    }

    /// Close the time axis at the current wall clock
    pub fn mark_finished(&mut self) -> u64 {
        self.mark_finished_at(now_millis())
    }

    pub fn mark_finished_at(&mut self, now_ms: i64) -> u64 {
        let ceiling = self.elapsed_at(now_ms).max(self.last_elapsed);
        self.set_ceiling(ceiling);
        ceiling
    }

    /// Close the time axis at an explicit elapsed value
    pub fn set_ceiling(&mut self, ceiling: u64) {
        debug!("Run log ceiling set at {}ms", ceiling);
        self.ceiling = Some(ceiling);
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventData, RunStatus};
    use pretty_assertions::assert_eq;

    fn delay(pid: u32) -> EventData {
        EventData::DelaySample {
            pid,
            delay_millis: 1,
        }
    }

    fn lines(log: EventLog<Vec<u8>>) -> Vec<Event> {
        String::from_utf8(log.into_inner())
            .unwrap()
            .lines()
            .map(|l| Event::from_line(l).unwrap())
            .collect()
    }

    #[test]
    fn test_anchor_captured_on_first_append() {
        let mut log = EventLog::new(Vec::new());
        let first = log.append_at(PendingEvent::now(delay(1)), 10_000).unwrap();
        let second = log.append_at(PendingEvent::now(delay(1)), 10_250).unwrap();

        assert_eq!(log.start(), Some(10_000));
        assert_eq!(first.unwrap().elapsed, 0);
        assert_eq!(second.unwrap().elapsed, 250);
    }

    #[test]
    fn test_own_timestamp_is_used() {
        let mut log = EventLog::new(Vec::new());
        log.anchor(1_000);
        let event = log
            .append_at(PendingEvent::at(delay(1), 1_400), 2_000)
            .unwrap()
            .unwrap();
        assert_eq!(event.elapsed, 400);
    }

    #[test]
    fn test_timestamp_before_anchor_is_clamped() {
        let mut log = EventLog::new(Vec::new());
        log.anchor(5_000);
        let event = log
            .append_at(PendingEvent::at(delay(1), 4_000), 5_000)
            .unwrap()
            .unwrap();
        assert_eq!(event.elapsed, 0);
    }

    #[test]
    fn test_elapsed_is_non_decreasing() {
        let mut log = EventLog::new(Vec::new());
        log.anchor(0);
        log.append_at(PendingEvent::now(delay(1)), 800).unwrap();
        // A batched probe reading taken earlier than the last record
        log.append_at(PendingEvent::at(delay(2), 300), 900).unwrap();
        log.append_at(PendingEvent::now(delay(1)), 1_000).unwrap();

        let elapsed: Vec<u64> = lines(log).iter().map(|e| e.elapsed).collect();
        assert_eq!(elapsed, vec![800, 800, 1_000]);
    }

    #[test]
    fn test_ceiling_drops_late_events() {
        let mut log = EventLog::new(Vec::new());
        log.anchor(0);
        log.append_at(
            PendingEvent::now(EventData::StatusChange {
                status: RunStatus::InProgress,
            }),
            10,
        )
        .unwrap();
        log.set_ceiling(1_000);

        let late = log.append_at(PendingEvent::at(delay(1), 1_200), 1_300).unwrap();
        let kept = log.append_at(PendingEvent::at(delay(1), 999), 1_300).unwrap();
        let edge = log.append_at(PendingEvent::at(delay(1), 1_000), 1_300).unwrap();

        assert!(late.is_none());
        assert_eq!(kept.map(|e| e.elapsed), Some(999));
        assert_eq!(edge.map(|e| e.elapsed), Some(1_000));
        assert_eq!(log.dropped(), 1);
        assert_eq!(log.written(), 3);
    }

    #[test]
    fn test_mark_finished_uses_wall_clock() {
        let mut log = EventLog::new(Vec::new());
        log.anchor(100);
        assert_eq!(log.mark_finished_at(1_100), 1_000);
        assert!(log.is_finished());
    }

    #[test]
    fn test_create_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("project").join("1.jsonl");
        let mut log = EventLog::create(&path).unwrap();
        log.append(PendingEvent::with_elapsed(delay(3), 7)).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert_eq!(Event::from_line(content.trim()).unwrap().elapsed, 7);
    }
}
