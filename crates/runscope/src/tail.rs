//! # Run Tail
//!
//! Incremental reader for a run log that another process is still writing.
//! Each subscription owns one `RunTail`: its own file handle, read offset and
//! held-back partial line, so concurrent viewers never share state.
//!
//! The tail is an explicit state machine:
//!
//! * `Reading`: read the next chunk, split complete lines off, parse them
//! * `WaitingForMore`: at end of file; nothing to do until the poll deadline
//! * `Closed`: file handle released, never reads again
//!
//! Parsed events are buffered and handed out in batches of at most
//! `max_batch`. Whatever is buffered is handed out as soon as end of file is
//! reached, before the tail starts waiting.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use crate::config::RunscopeConfig;
use crate::errors::Result;
use crate::events::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailOptions {
    pub chunk_bytes: usize,
    pub max_batch: usize,
    pub poll: Duration,
}

impl TailOptions {
    pub fn from_config(config: &RunscopeConfig) -> Self {
        Self {
            chunk_bytes: config.tail_chunk_bytes.max(1),
            max_batch: config.tail_max_batch.max(1),
            poll: config.tail_poll(),
        }
    }
}

impl Default for TailOptions {
    fn default() -> Self {
        Self::from_config(&RunscopeConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailState {
    Reading,
    WaitingForMore { until: Instant },
    Closed,
}

pub struct RunTail {
    path: PathBuf,
    file: Option<File>,
    options: TailOptions,
    state: TailState,
    offset: u64,
    partial: Vec<u8>,
    pending: Vec<Event>,
    chunk: Vec<u8>,
    skipped_lines: u64,
}

impl RunTail {
    pub async fn open(path: impl AsRef<Path>, options: TailOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        debug!("Tailing {:?}", path);

        Ok(Self {
            path,
            file: Some(file),
            chunk: vec![0; options.chunk_bytes],
            options,
            state: TailState::Reading,
            offset: 0,
            partial: Vec::new(),
            pending: Vec::new(),
            skipped_lines: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> TailState {
        self.state
    }

    /// Bytes consumed so far
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Lines that could not be parsed
    pub fn skipped_lines(&self) -> u64 {
        self.skipped_lines
    }

    /// When a waiting tail should be stepped again
    pub fn deadline(&self) -> Option<Instant> {
        match self.state {
            TailState::WaitingForMore { until } => Some(until),
            _ => None,
        }
    }

    pub fn is_reading(&self) -> bool {
        self.state == TailState::Reading
    }

    /// Advance by at most one chunk. Returns a batch when one is ready.
    pub async fn step(&mut self) -> Result<Option<Vec<Event>>> {
        match self.state {
            TailState::Closed => return Ok(None),
            TailState::WaitingForMore { until } => {
                if Instant::now() < until {
                    return Ok(None);
                }
                self.state = TailState::Reading;
            }
            TailState::Reading => {}
        }

        let Some(file) = self.file.as_mut() else {
            self.state = TailState::Closed;
            return Ok(None);
        };

        let read = file.read(&mut self.chunk).await?;
        if read == 0 {
            if self.pending.is_empty() {
                self.state = TailState::WaitingForMore {
                    until: Instant::now() + self.options.poll,
                };
                return Ok(None);
            }
            // Flush before waiting; stay in Reading while a backlog remains
            return Ok(Some(self.take_batch()));
        }

        self.offset += read as u64;
        self.partial.extend_from_slice(&self.chunk[..read]);
        self.split_lines();

        if self.pending.len() >= self.options.max_batch {
            return Ok(Some(self.take_batch()));
        }
        Ok(None)
    }

    fn take_batch(&mut self) -> Vec<Event> {
        if self.pending.len() > self.options.max_batch {
            let rest = self.pending.split_off(self.options.max_batch);
            std::mem::replace(&mut self.pending, rest)
        } else {
            std::mem::take(&mut self.pending)
        }
    }

    fn split_lines(&mut self) {
        let Some(last_newline) = self.partial.iter().rposition(|b| *b == b'\n') else {
            return;
        };
        let rest = self.partial.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.partial, rest);

        for line in complete.split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let parsed = std::str::from_utf8(line)
                .map_err(|e| e.to_string())
                .and_then(|line| Event::from_line(line).map_err(|e| e.to_string()));
            match parsed {
                Ok(event) => self.pending.push(event),
                Err(e) => {
                    self.skipped_lines += 1;
                    warn!("Skipping unreadable line in {:?}: {}", self.path, e);
                }
            }
        }
    }

    /// Wait for and return the next batch, or `None` once closed
    pub async fn next_batch(&mut self) -> Result<Option<Vec<Event>>> {
        loop {
            match self.state {
                TailState::Closed => return Ok(None),
                TailState::WaitingForMore { until } => sleep_until(until).await,
                TailState::Reading => {}
            }
            if let Some(batch) = self.step().await? {
                return Ok(Some(batch));
            }
        }
    }

    /// Release the file handle. No further reads happen after this returns.
    pub fn close(&mut self) {
        if self.file.take().is_some() {
            debug!("Closed tail of {:?} at offset {}", self.path, self.offset);
        }
        self.state = TailState::Closed;
        self.pending.clear();
        self.partial.clear();
    }
}

impl Drop for RunTail {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventData;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn line(elapsed: u64) -> String {
        Event::new(
            EventData::DelaySample {
                pid: 1,
                delay_millis: elapsed,
            },
            elapsed,
        )
        .to_line()
        .unwrap()
    }

    fn options() -> TailOptions {
        TailOptions {
            chunk_bytes: 16,
            max_batch: 1000,
            poll: Duration::from_millis(10),
        }
    }

    #[tokio::test]
    async fn test_partial_line_is_held_back() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let full = line(1);
        let (head, tail) = full.split_at(10);
        write!(file, "{}", head).unwrap();
        file.flush().unwrap();

        let mut run_tail = RunTail::open(file.path(), options()).await.unwrap();
        assert_eq!(run_tail.step().await.unwrap(), None);
        assert_eq!(run_tail.step().await.unwrap(), None);
        assert!(run_tail.deadline().is_some());

        write!(file, "{}", tail).unwrap();
        file.flush().unwrap();
        let batch = run_tail.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].elapsed, 1);
    }

    #[tokio::test]
    async fn test_bad_line_is_skipped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}not json\n{}", line(1), line(2)).unwrap();
        file.flush().unwrap();

        let mut run_tail = RunTail::open(file.path(), options()).await.unwrap();
        let batch = run_tail.next_batch().await.unwrap().unwrap();
        let elapsed: Vec<u64> = batch.iter().map(|e| e.elapsed).collect();
        assert_eq!(elapsed, vec![1, 2]);
        assert_eq!(run_tail.skipped_lines(), 1);
    }

    #[tokio::test]
    async fn test_batches_are_capped() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for n in 0..5 {
            write!(file, "{}", line(n)).unwrap();
        }
        file.flush().unwrap();

        let mut run_tail = RunTail::open(
            file.path(),
            TailOptions {
                chunk_bytes: 4096,
                max_batch: 2,
                poll: Duration::from_millis(10),
            },
        )
        .await
        .unwrap();

        let mut sizes = Vec::new();
        let mut total = 0;
        while total < 5 {
            let batch = run_tail.next_batch().await.unwrap().unwrap();
            total += batch.len();
            sizes.push(batch.len());
        }
        assert!(sizes.iter().all(|size| *size <= 2));
        assert_eq!(total, 5);
    }

    #[tokio::test]
    async fn test_closed_tail_stops() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut run_tail = RunTail::open(file.path(), options()).await.unwrap();
        run_tail.close();
        assert_eq!(run_tail.state(), TailState::Closed);
        assert_eq!(run_tail.next_batch().await.unwrap(), None);
    }
}
