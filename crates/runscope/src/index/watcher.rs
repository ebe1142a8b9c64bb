use anyhow::Result;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace};

use super::{IndexEvent, ProjectInfo, ProjectSummary, RunIndex};
use crate::errors::{Result as RunscopeResult, RunscopeError};
use crate::meta::{MetaUpdate, RunMeta};
use crate::project::ProjectId;

const EVENT_BUFFER: usize = 1024;

#[derive(Debug)]
pub enum IndexCommand {
    ListProjects {
        response_tx: oneshot::Sender<Vec<ProjectSummary>>,
    },
    ProjectInfo {
        project: ProjectId,
        response_tx: oneshot::Sender<RunscopeResult<ProjectInfo>>,
    },
    RunLogPath {
        project: ProjectId,
        timestamp: u64,
        response_tx: oneshot::Sender<RunscopeResult<PathBuf>>,
    },
    SaveMeta {
        project: ProjectId,
        timestamp: u64,
        update: MetaUpdate,
        response_tx: oneshot::Sender<RunscopeResult<RunMeta>>,
    },
}

/// Cloneable access to a running [`IndexService`]
#[derive(Clone)]
pub struct IndexHandle {
    command_tx: mpsc::Sender<IndexCommand>,
    events_tx: broadcast::Sender<IndexEvent>,
}

impl IndexHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> IndexCommand,
    ) -> RunscopeResult<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build(response_tx))
            .await
            .map_err(|_| RunscopeError::ChannelClosed("index"))?;
        response_rx
            .await
            .map_err(|_| RunscopeError::ChannelClosed("index reply"))
    }

    /// Receive every index change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.events_tx.subscribe()
    }

    pub async fn list_projects(&self) -> RunscopeResult<Vec<ProjectSummary>> {
        self.request(|response_tx| IndexCommand::ListProjects { response_tx })
            .await
    }

    pub async fn project_info(&self, project: ProjectId) -> RunscopeResult<ProjectInfo> {
        self.request(|response_tx| IndexCommand::ProjectInfo {
            project,
            response_tx,
        })
        .await?
    }

    pub async fn run_log_path(&self, project: ProjectId, timestamp: u64) -> RunscopeResult<PathBuf> {
        self.request(|response_tx| IndexCommand::RunLogPath {
            project,
            timestamp,
            response_tx,
        })
        .await?
    }

    pub async fn save_meta(
        &self,
        project: ProjectId,
        timestamp: u64,
        update: MetaUpdate,
    ) -> RunscopeResult<RunMeta> {
        self.request(|response_tx| IndexCommand::SaveMeta {
            project,
            timestamp,
            update,
            response_tx,
        })
        .await?
    }
}

/// Owns the [`RunIndex`] and keeps it in step with the samples root
pub struct IndexService {
    index: RunIndex,
    command_rx: mpsc::Receiver<IndexCommand>,
    fs_rx: mpsc::Receiver<notify::Result<Event>>,
    events_tx: broadcast::Sender<IndexEvent>,
    _watcher: RecommendedWatcher,
}

impl IndexService {
    /// Watch `root`, index what is already there and serve requests
    pub fn start(root: impl AsRef<Path>) -> Result<(IndexHandle, JoinHandle<()>)> {
        let root = root.as_ref();
        std::fs::create_dir_all(root)?;
        // Watcher events carry resolved paths
        let root = dunce::canonicalize(root)?;

        let (fs_tx, fs_rx) = mpsc::channel(EVENT_BUFFER);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Err(e) = fs_tx.blocking_send(res) {
                trace!("Index service gone, dropping watch event: {}", e);
            }
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        info!("Watching {:?} for runs", root);

        let mut index = RunIndex::new(root);
        // Scan after the watch is in place so nothing created in between is missed
        index.scan()?;

        let (command_tx, command_rx) = mpsc::channel(64);
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);
        let handle = IndexHandle {
            command_tx,
            events_tx: events_tx.clone(),
        };

        let service = Self {
            index,
            command_rx,
            fs_rx,
            events_tx,
            _watcher: watcher,
        };
        Ok((handle, tokio::spawn(service.run())))
    }

    async fn run(mut self) {
        loop {
            tokio::select! {
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All index handles dropped");
                        break;
                    }
                },
                Some(res) = self.fs_rx.recv() => match res {
                    Ok(event) => self.handle_fs_event(event),
                    Err(e) => error!("File watcher error: {}", e),
                },
            }
        }
    }

    fn publish(&self, events: Vec<IndexEvent>) {
        for event in events {
            trace!("Index event: {:?}", event);
            // No receivers is fine
            let _ = self.events_tx.send(event);
        }
    }

    fn handle_fs_event(&mut self, event: Event) {
        if event.kind.is_access() {
            return;
        }
        for path in event.paths {
            let changes = if path.is_dir() {
                // A new project directory may already hold runs
                match self.index.scan_project_dir(&path) {
                    Ok(changes) => changes,
                    Err(e) => {
                        debug!("Could not scan {:?}: {}", path, e);
                        Vec::new()
                    }
                }
            } else if path.exists() {
                match self.index.add_run_file(&path) {
                    Ok(changes) => changes,
                    Err(_) => self.index.reload_meta(&path).unwrap_or_default(),
                }
            } else {
                self.index.remove_path(&path)
            };
            self.publish(changes);
        }
    }

    fn handle_command(&mut self, command: IndexCommand) {
        match command {
            IndexCommand::ListProjects { response_tx } => {
                let _ = response_tx.send(self.index.projects());
            }
            IndexCommand::ProjectInfo {
                project,
                response_tx,
            } => {
                let _ = response_tx.send(self.index.project(&project));
            }
            IndexCommand::RunLogPath {
                project,
                timestamp,
                response_tx,
            } => {
                let result = self
                    .index
                    .run(&project, timestamp)
                    .map(|run| run.log_path.clone());
                let _ = response_tx.send(result);
            }
            IndexCommand::SaveMeta {
                project,
                timestamp,
                update,
                response_tx,
            } => match self.index.save_meta(&project, timestamp, update) {
                Ok((meta, changes)) => {
                    let _ = response_tx.send(Ok(meta));
                    self.publish(changes);
                }
                Err(e) => {
                    let _ = response_tx.send(Err(e));
                }
            },
        }
    }
}
