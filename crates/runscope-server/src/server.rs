use anyhow::Result;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use runscope::{IndexHandle, IndexService, RunscopeConfig, TailOptions};

use crate::session::ViewerSession;

/// Serves the run index and live run logs to viewers over TCP
pub struct RunscopeServer {
    listener: TcpListener,
    index: IndexHandle,
    index_task: JoinHandle<()>,
    tail_options: TailOptions,
}

impl RunscopeServer {
    /// Bind to `config.server_address` and start indexing `config.samples_root`
    pub async fn new(config: &RunscopeConfig) -> Result<Self> {
        Self::bind(
            config.server_address,
            &config.samples_root,
            TailOptions::from_config(config),
        )
        .await
    }

    pub async fn bind(
        address: SocketAddr,
        samples_root: &Path,
        tail_options: TailOptions,
    ) -> Result<Self> {
        let (index, index_task) = IndexService::start(samples_root)?;
        let listener = TcpListener::bind(address).await?;

        Ok(Self {
            listener,
            index,
            index_task,
            tail_options,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn index(&self) -> &IndexHandle {
        &self.index
    }

    pub async fn run(self) -> Result<()> {
        info!("Runscope server listening on {:?}", self.listener.local_addr()?);

        while let Ok((socket, addr)) = self.listener.accept().await {
            info!("New viewer connection from {}", addr);
            let session =
                ViewerSession::new(socket, addr.to_string(), self.index.clone(), self.tail_options);

            tokio::spawn(async move {
                if let Err(e) = session.run().await {
                    error!("Error handling viewer connection {}: {}", addr, e);
                }
            });
        }

        self.index_task.abort();
        Ok(())
    }
}
