use anyhow::Result;
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use super::{codec, ChannelId, ChannelMessage, ChannelReply};
use crate::collector::CollectorHandle;
use crate::events::{EventData, EventTime};

/// Accepts short sessions from instrumented processes and forwards each
/// message to the collector
pub struct ChannelServer {
    listener: UnixListener,
    path: PathBuf,
    collector: CollectorHandle,
}

impl ChannelServer {
    pub fn bind(id: &ChannelId, collector: CollectorHandle) -> Result<Self> {
        Self::bind_path(id.socket_path(), collector)
    }

    pub fn bind_path(path: impl AsRef<Path>, collector: CollectorHandle) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        // A socket left behind by a crashed supervisor with the same id
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!("Registration channel listening on {:?}", path);

        Ok(Self {
            listener,
            path,
            collector,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn spawn(self) -> ChannelServerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let path = self.path.clone();
        let task = tokio::spawn(self.run(shutdown_rx));
        ChannelServerHandle {
            path,
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    async fn run(self, mut shutdown_rx: oneshot::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let collector = self.collector.clone();
                        tokio::spawn(async move {
                            if let Err(e) = Self::handle_session(stream, collector).await {
                                debug!("Channel session ended with error: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Failed to accept channel connection: {}", e),
                },
            }
        }

        drop(self.listener);
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Could not remove channel socket {:?}: {}", self.path, e);
        }
        info!("Registration channel closed");
        Ok(())
    }

    async fn handle_session(stream: UnixStream, collector: CollectorHandle) -> Result<()> {
        let mut framed = Framed::new(stream, codec());

        while let Some(frame) = framed.next().await {
            let frame = frame?;
            let reply = match serde_json::from_slice::<ChannelMessage>(&frame) {
                Ok(message) => {
                    debug!("Channel message: {}", message.kind());
                    match Self::dispatch(&collector, message).await {
                        Ok(()) => ChannelReply::Ack,
                        Err(e) => {
                            error!("Failed to record channel message: {}", e);
                            ChannelReply::Error {
                                message: e.to_string(),
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!("Malformed channel message: {}", e);
                    ChannelReply::Error {
                        message: format!("Malformed message: {}", e),
                    }
                }
            };
            framed.send(Bytes::from(serde_json::to_vec(&reply)?)).await?;
        }

        Ok(())
    }

    async fn dispatch(collector: &CollectorHandle, message: ChannelMessage) -> Result<()> {
        match message {
            ChannelMessage::Register(registration) => {
                // A repeat registration is acked like the first one
                collector.register(registration).await?;
            }
            ChannelMessage::DelaySamples { samples } => {
                collector.push_delay_samples(samples).await?;
            }
            ChannelMessage::ActivityStart {
                uuid,
                label,
                timestamp,
            } => {
                collector
                    .activity(
                        EventData::ActivityStart { uuid, label },
                        EventTime::At(timestamp),
                    )
                    .await?;
            }
            ChannelMessage::ActivityEnd {
                uuid,
                label,
                timestamp,
            } => {
                collector
                    .activity(
                        EventData::ActivityEnd { uuid, label },
                        EventTime::At(timestamp),
                    )
                    .await?;
            }
            ChannelMessage::Status { status, timestamp } => {
                collector.status(status, EventTime::At(timestamp)).await?;
            }
        }
        Ok(())
    }
}

pub struct ChannelServerHandle {
    path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl ChannelServerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting sessions and remove the socket
    pub async fn stop(mut self) -> Result<()> {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
        (&mut self.task).await?
    }
}

impl Drop for ChannelServerHandle {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some() {
            self.task.abort();
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
