//! # Registration Channel
//!
//! Local socket the supervisor exposes to the processes it launches. Workers
//! find it through the run-scoped id in `RUNSCOPE_IPC_ID` and talk to it in
//! short sessions: connect, send one message, wait for the ack, disconnect.
//! No worker ever holds a connection open.
//!
//! Frames use the same length-delimited JSON encoding as the viewer protocol:
//! a 4-byte big-endian length followed by the serialized message.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio_util::codec::LengthDelimitedCodec;
use uuid::Uuid;

use crate::config::CHANNEL_ENV_VAR;
use crate::events::{DelayReading, RunStatus};
use crate::registry::Registration;

pub mod client;
pub mod server;

pub use client::{ChannelClient, RetryPolicy};
pub use server::{ChannelServer, ChannelServerHandle};

/// Largest frame either side will accept
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Run-scoped address of a registration channel
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh id for the run started at `timestamp` by this supervisor process
    pub fn for_run(timestamp: u64) -> Self {
        let nonce = Uuid::new_v4().simple().to_string();
        Self(format!(
            "runscope_{}_{}_{}",
            timestamp,
            std::process::id(),
            &nonce[..8]
        ))
    }

    /// Id handed down by a supervisor, if this process is being supervised
    pub fn from_env() -> Option<Self> {
        std::env::var(CHANNEL_ENV_VAR)
            .ok()
            .filter(|id| !id.is_empty())
            .map(Self)
    }

    pub fn socket_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("{}.sock", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message from an instrumented process to the supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelMessage {
    Register(Registration),
    DelaySamples {
        samples: Vec<DelayReading>,
    },
    ActivityStart {
        uuid: String,
        label: String,
        timestamp: i64,
    },
    ActivityEnd {
        uuid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        timestamp: i64,
    },
    Status {
        status: RunStatus,
        timestamp: i64,
    },
}

impl ChannelMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMessage::Register(_) => "register",
            ChannelMessage::DelaySamples { .. } => "delay_samples",
            ChannelMessage::ActivityStart { .. } => "activity_start",
            ChannelMessage::ActivityEnd { .. } => "activity_end",
            ChannelMessage::Status { .. } => "status",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelReply {
    Ack,
    Error { message: String },
}

pub(crate) fn codec() -> LengthDelimitedCodec {
    let mut codec = LengthDelimitedCodec::new();
    codec.set_max_frame_length(MAX_FRAME_LENGTH);
    codec
}
