use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio_util::codec::Framed;
use tracing::debug;

use super::{codec, ChannelId, ChannelMessage, ChannelReply, MAX_FRAME_LENGTH};

/// Bounded exponential backoff for reaching the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

/// Client side of the registration channel.
///
/// Every send is its own session. Only the connect step is retried: once a
/// message has been written it is never sent again, so a slow ack cannot
/// duplicate samples in the log.
#[derive(Debug, Clone)]
pub struct ChannelClient {
    path: PathBuf,
    retry: RetryPolicy,
    ack_timeout: Duration,
}

impl ChannelClient {
    pub fn new(id: &ChannelId) -> Self {
        Self::with_path(id.socket_path())
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            retry: RetryPolicy::default(),
            ack_timeout: Duration::from_secs(2),
        }
    }

    /// Client for the channel named in the environment, if any
    pub fn from_env() -> Option<Self> {
        ChannelId::from_env().map(|id| Self::new(&id))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn connect(&self) -> Result<UnixStream> {
        let mut attempt = 0;
        loop {
            match UnixStream::connect(&self.path).await {
                Ok(stream) => return Ok(stream),
                Err(e) if attempt + 1 < self.retry.attempts => {
                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        "Channel {:?} not reachable ({}), retrying in {:?}",
                        self.path, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Open a session, send one message, wait for its ack and close
    pub async fn send(&self, message: &ChannelMessage) -> Result<()> {
        let stream = self.connect().await?;
        let mut framed = Framed::new(stream, codec());
        framed
            .send(Bytes::from(serde_json::to_vec(message)?))
            .await?;

        let reply = tokio::time::timeout(self.ack_timeout, framed.next())
            .await
            .map_err(|_| anyhow!("Timed out waiting for channel ack"))?;

        match reply {
            Some(Ok(bytes)) => match serde_json::from_slice::<ChannelReply>(&bytes)? {
                ChannelReply::Ack => Ok(()),
                ChannelReply::Error { message } => Err(anyhow!("Channel error: {}", message)),
            },
            Some(Err(e)) => Err(e.into()),
            None => Err(anyhow!("Channel closed before ack")),
        }
    }

    /// Send and swallow failures. Telemetry loss must never fail the caller.
    pub async fn send_quietly(&self, message: &ChannelMessage) -> bool {
        match self.send(message).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping {} message: {}", message.kind(), e);
                false
            }
        }
    }

    /// Blocking variant for exit paths where no runtime can be relied on:
    /// drop guards, panic hooks, signal handlers. Retries are capped at a few
    /// short sleeps so shutdown is not held up.
    pub fn send_blocking(&self, message: &ChannelMessage) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        let length = u32::try_from(payload.len())
            .ok()
            .filter(|len| (*len as usize) <= MAX_FRAME_LENGTH)
            .ok_or_else(|| anyhow!("Message too large: {} bytes", payload.len()))?;

        let attempts = self.retry.attempts.min(3);
        let mut attempt = 0;
        let mut stream = loop {
            match std::os::unix::net::UnixStream::connect(&self.path) {
                Ok(stream) => break stream,
                Err(_) if attempt + 1 < attempts => {
                    std::thread::sleep(self.retry.delay_for(attempt));
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_read_timeout(Some(self.ack_timeout))?;
        stream.set_write_timeout(Some(self.ack_timeout))?;

        stream.write_all(&length.to_be_bytes())?;
        stream.write_all(&payload)?;
        stream.flush()?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header)?;
        let reply_length = u32::from_be_bytes(header) as usize;
        if reply_length > MAX_FRAME_LENGTH {
            return Err(anyhow!("Reply frame too large: {} bytes", reply_length));
        }
        let mut body = vec![0u8; reply_length];
        stream.read_exact(&mut body)?;

        match serde_json::from_slice::<ChannelReply>(&body)? {
            ChannelReply::Ack => Ok(()),
            ChannelReply::Error { message } => Err(anyhow!("Channel error: {}", message)),
        }
    }
}
