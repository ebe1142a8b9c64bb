//! # TCP Connection for Runscope
//!
//! Low-level viewer connection to a runscope server with send and receive
//! methods that can be used with tokio::select!

use anyhow::{anyhow, Result};
use bytes::Bytes;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info};
use uuid::Uuid;

use runscope::ProjectId;
use runscope_server::{ViewerRequest, ViewerResponse, MAX_FRAME_LENGTH};

/// A viewer connection to a runscope server.
///
/// Subscriptions share the one connection, so pushed responses for all of
/// them arrive interleaved through [`ViewerConnection::receive`]. Use the id
/// returned by each subscribe call to tell them apart.
pub struct ViewerConnection {
    address: SocketAddr,
    connection: Option<Framed<TcpStream, LengthDelimitedCodec>>,
}

impl ViewerConnection {
    /// Create a connection to `address`. Nothing is dialled until the first
    /// send or an explicit [`connect`](Self::connect).
    pub fn new(address: SocketAddr) -> Self {
        Self {
            address,
            connection: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub async fn connect(&mut self) -> Result<()> {
        if self.connection.is_some() {
            return Ok(());
        }

        info!("Connecting to runscope server at {}", self.address);
        let socket = TcpStream::connect(self.address).await?;

        let mut codec = LengthDelimitedCodec::new();
        codec.set_max_frame_length(MAX_FRAME_LENGTH);
        self.connection = Some(Framed::new(socket, codec));
        info!("Connected to runscope server");

        Ok(())
    }

    pub async fn send(&mut self, request: ViewerRequest) -> Result<()> {
        if self.connection.is_none() {
            self.connect().await?;
        }

        debug!("Sending request: {:?}", request);
        let request_bytes = serde_json::to_vec(&request)?;

        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow!("Connection lost"))?;

        if let Err(e) = connection.send(Bytes::from(request_bytes)).await {
            self.connection = None;
            return Err(anyhow!("Failed to send request: {}", e));
        }
        Ok(())
    }

    /// Wait for the next response or push from the server
    pub async fn receive(&mut self) -> Result<ViewerResponse> {
        let connection = self
            .connection
            .as_mut()
            .ok_or_else(|| anyhow!("Not connected"))?;

        match connection.next().await {
            Some(Ok(bytes)) => {
                let response: ViewerResponse = serde_json::from_slice(&bytes)?;
                debug!("Received response: {:?}", response);
                Ok(response)
            }
            Some(Err(e)) => {
                error!("Error receiving response: {}", e);
                self.connection = None;
                Err(anyhow!("Connection error: {}", e))
            }
            None => {
                debug!("Connection closed by server");
                self.connection = None;
                Err(anyhow!("Connection closed by server"))
            }
        }
    }

    /// Subscribe to the project list. Returns the subscription id.
    pub async fn list_projects(&mut self) -> Result<Uuid> {
        let subscription_id = Uuid::new_v4();
        self.send(ViewerRequest::ListProjects { subscription_id })
            .await?;
        Ok(subscription_id)
    }

    pub async fn project_info(&mut self, project: ProjectId) -> Result<Uuid> {
        let subscription_id = Uuid::new_v4();
        self.send(ViewerRequest::ProjectInfo {
            subscription_id,
            project,
        })
        .await?;
        Ok(subscription_id)
    }

    /// Tail a run's log from the start. Returns the subscription id.
    pub async fn project_samples(&mut self, project: ProjectId, timestamp: u64) -> Result<Uuid> {
        let subscription_id = Uuid::new_v4();
        self.send(ViewerRequest::ProjectSamples {
            subscription_id,
            project,
            timestamp,
        })
        .await?;
        Ok(subscription_id)
    }

    pub async fn add_tag(
        &mut self,
        project: ProjectId,
        timestamp: u64,
        tag: impl Into<String>,
    ) -> Result<Uuid> {
        let request_id = Uuid::new_v4();
        self.send(ViewerRequest::RunAddTag {
            request_id,
            project,
            timestamp,
            tag: tag.into(),
        })
        .await?;
        Ok(request_id)
    }

    pub async fn remove_tag(
        &mut self,
        project: ProjectId,
        timestamp: u64,
        tag: impl Into<String>,
    ) -> Result<Uuid> {
        let request_id = Uuid::new_v4();
        self.send(ViewerRequest::RunRemoveTag {
            request_id,
            project,
            timestamp,
            tag: tag.into(),
        })
        .await?;
        Ok(request_id)
    }

    pub async fn set_remote_id(
        &mut self,
        project: ProjectId,
        timestamp: u64,
        remote_id: Option<String>,
    ) -> Result<Uuid> {
        let request_id = Uuid::new_v4();
        self.send(ViewerRequest::SetRemoteId {
            request_id,
            project,
            timestamp,
            remote_id,
        })
        .await?;
        Ok(request_id)
    }

    pub async fn unsubscribe(&mut self, subscription_id: Uuid) -> Result<()> {
        self.send(ViewerRequest::Unsubscribe { subscription_id })
            .await
    }

    /// Receive until a response for `id` arrives, dropping anything else
    pub async fn receive_for(&mut self, id: Uuid) -> Result<ViewerResponse> {
        loop {
            let response = self.receive().await?;
            if response.id() == Some(id) {
                return Ok(response);
            }
            debug!("Skipping response for {:?} while waiting for {}", response.id(), id);
        }
    }

    pub fn close(&mut self) {
        if self.connection.take().is_some() {
            debug!("Closed connection to {}", self.address);
        }
    }
}
