use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::{sleep_until, Instant};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use runscope::{
    IndexEvent, IndexHandle, MetaUpdate, ProjectId, RunTail, RunscopeError, TailOptions,
};

use crate::protocol::{ViewerRequest, ViewerResponse, MAX_FRAME_LENGTH};

/// Chunks a tail may read before the session checks the connection again
const STEPS_PER_PUMP: usize = 16;

enum Subscription {
    Projects,
    Project(ProjectId),
    Samples(RunTail),
}

impl Subscription {
    fn kind(&self) -> &'static str {
        match self {
            Subscription::Projects => "projects",
            Subscription::Project(_) => "project",
            Subscription::Samples(_) => "samples",
        }
    }
}

/// What an index change should push to one subscription
enum Push {
    ProjectList,
    /// Skipped once the project is gone, its `ProjectRemoved` event follows
    ProjectInfo(ProjectId),
    ProjectRemoved(ProjectId),
    /// Full resend after missed events, a vanished project reads as removed
    ProjectResync(ProjectId),
}

pub(crate) fn codec() -> LengthDelimitedCodec {
    let mut codec = LengthDelimitedCodec::new();
    codec.set_max_frame_length(MAX_FRAME_LENGTH);
    codec
}

/// One viewer connection and everything it is subscribed to.
///
/// All subscriptions of a viewer live in this session and are released when
/// it ends, whichever way the connection goes away.
pub struct ViewerSession<T> {
    framed: Framed<T, LengthDelimitedCodec>,
    peer: String,
    index: IndexHandle,
    index_rx: broadcast::Receiver<IndexEvent>,
    subscriptions: HashMap<Uuid, Subscription>,
    tail_options: TailOptions,
}

impl<T> ViewerSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(
        io: T,
        peer: impl Into<String>,
        index: IndexHandle,
        tail_options: TailOptions,
    ) -> Self {
        let index_rx = index.subscribe();
        Self {
            framed: Framed::new(io, codec()),
            peer: peer.into(),
            index,
            index_rx,
            subscriptions: HashMap::new(),
            tail_options,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        let result = self.serve().await;
        self.release_all();
        result
    }

    async fn serve(&mut self) -> Result<()> {
        loop {
            // Tails are stepped outside the select so a read is never
            // abandoned halfway
            self.pump_tails().await?;

            let deadline = self.next_deadline();
            let reading = self.any_reading();
            let wake_at = deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                frame = self.framed.next() => match frame {
                    Some(Ok(bytes)) => self.handle_frame(&bytes).await?,
                    Some(Err(e)) => {
                        warn!("Connection from {} failed: {}", self.peer, e);
                        return Ok(());
                    }
                    None => {
                        info!("Viewer {} disconnected", self.peer);
                        return Ok(());
                    }
                },
                event = self.index_rx.recv() => match event {
                    Ok(event) => self.handle_index_event(event).await?,
                    Err(RecvError::Lagged(missed)) => {
                        warn!("Viewer {} missed {} index events, resending snapshots", self.peer, missed);
                        self.resend_snapshots().await?;
                    }
                    Err(RecvError::Closed) => {
                        info!("Index service stopped, closing viewer {}", self.peer);
                        return Ok(());
                    }
                },
                _ = sleep_until(wake_at), if deadline.is_some() => {}
                _ = tokio::task::yield_now(), if reading => {}
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.subscriptions
            .values()
            .filter_map(|subscription| match subscription {
                Subscription::Samples(tail) => tail.deadline(),
                _ => None,
            })
            .min()
    }

    fn any_reading(&self) -> bool {
        self.subscriptions.values().any(|subscription| match subscription {
            Subscription::Samples(tail) => tail.is_reading(),
            _ => false,
        })
    }

    async fn send(&mut self, response: ViewerResponse) -> Result<()> {
        let bytes = serde_json::to_vec(&response)?;
        self.framed.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    async fn send_error(&mut self, id: Option<Uuid>, message: String) -> Result<()> {
        debug!("Error for viewer {} ({:?}): {}", self.peer, id, message);
        self.send(ViewerResponse::Error { id, message }).await
    }

    async fn pump_tails(&mut self) -> Result<()> {
        let now = Instant::now();
        let mut batches = Vec::new();
        let mut failed = Vec::new();

        for (id, subscription) in self.subscriptions.iter_mut() {
            let tail = match subscription {
                Subscription::Samples(tail) => tail,
                _ => continue,
            };
            let due = tail.is_reading() || tail.deadline().is_some_and(|until| until <= now);
            if !due {
                continue;
            }
            for _ in 0..STEPS_PER_PUMP {
                match tail.step().await {
                    Ok(Some(events)) => batches.push((*id, events)),
                    Ok(None) => {}
                    Err(e) => {
                        failed.push((*id, format!("Failed to read run log: {}", e)));
                        break;
                    }
                }
                if !tail.is_reading() {
                    break;
                }
            }
        }

        for (id, message) in failed {
            error!("Tail {} for viewer {} failed: {}", id, self.peer, message);
            self.subscriptions.remove(&id);
            self.send_error(Some(id), message).await?;
        }
        for (subscription_id, events) in batches {
            debug!("Sending {} events to {}", events.len(), subscription_id);
            self.send(ViewerResponse::Samples {
                subscription_id,
                events,
            })
            .await?;
        }
        Ok(())
    }

    async fn handle_frame(&mut self, bytes: &[u8]) -> Result<()> {
        let request: ViewerRequest = match serde_json::from_slice(bytes) {
            Ok(request) => request,
            Err(e) => {
                warn!("Unreadable request from {}: {}", self.peer, e);
                return self
                    .send_error(None, format!("Invalid request: {}", e))
                    .await;
            }
        };
        debug!("Request from {}: {:?}", self.peer, request);

        match request {
            ViewerRequest::ListProjects { subscription_id } => {
                self.subscribe(subscription_id, Subscription::Projects);
                self.send_project_list(subscription_id).await
            }
            ViewerRequest::ProjectInfo {
                subscription_id,
                project,
            } => {
                self.subscribe(subscription_id, Subscription::Project(project.clone()));
                self.send_project_info(subscription_id, project).await
            }
            ViewerRequest::ProjectSamples {
                subscription_id,
                project,
                timestamp,
            } => {
                // A reused id ends the previous subscription first
                self.subscriptions.remove(&subscription_id);
                let tail = match self.index.run_log_path(project, timestamp).await {
                    Ok(path) => RunTail::open(path, self.tail_options).await,
                    Err(e) => Err(e),
                };
                match tail {
                    Ok(tail) => {
                        info!("Viewer {} tailing {:?}", self.peer, tail.path());
                        self.subscribe(subscription_id, Subscription::Samples(tail));
                        Ok(())
                    }
                    Err(e) => self.send_error(Some(subscription_id), e.to_string()).await,
                }
            }
            ViewerRequest::RunAddTag {
                request_id,
                project,
                timestamp,
                tag,
            } => {
                self.save_meta(request_id, project, timestamp, MetaUpdate::AddTag(tag))
                    .await
            }
            ViewerRequest::RunRemoveTag {
                request_id,
                project,
                timestamp,
                tag,
            } => {
                self.save_meta(request_id, project, timestamp, MetaUpdate::RemoveTag(tag))
                    .await
            }
            ViewerRequest::SetRemoteId {
                request_id,
                project,
                timestamp,
                remote_id,
            } => {
                self.save_meta(
                    request_id,
                    project,
                    timestamp,
                    MetaUpdate::SetRemoteId(remote_id),
                )
                .await
            }
            ViewerRequest::Unsubscribe { subscription_id } => {
                match self.subscriptions.remove(&subscription_id) {
                    Some(subscription) => {
                        debug!("Released {} subscription {}", subscription.kind(), subscription_id);
                        // Dropping a tail closes its file before the reply goes out
                        drop(subscription);
                    }
                    None => debug!("Unsubscribe for unknown id {}", subscription_id),
                }
                self.send(ViewerResponse::Unsubscribed { subscription_id })
                    .await
            }
        }
    }

    fn subscribe(&mut self, id: Uuid, subscription: Subscription) {
        debug!("Viewer {} subscribed to {} as {}", self.peer, subscription.kind(), id);
        if let Some(previous) = self.subscriptions.insert(id, subscription) {
            debug!("Replaced {} subscription {}", previous.kind(), id);
        }
    }

    async fn save_meta(
        &mut self,
        request_id: Uuid,
        project: ProjectId,
        timestamp: u64,
        update: MetaUpdate,
    ) -> Result<()> {
        match self
            .index
            .save_meta(project.clone(), timestamp, update)
            .await
        {
            Ok(meta) => {
                self.send(ViewerResponse::MetaSaved {
                    request_id,
                    project,
                    timestamp,
                    meta,
                })
                .await
            }
            Err(e) => self.send_error(Some(request_id), e.to_string()).await,
        }
    }

    async fn send_project_list(&mut self, subscription_id: Uuid) -> Result<()> {
        match self.index.list_projects().await {
            Ok(projects) => {
                self.send(ViewerResponse::ProjectList {
                    subscription_id,
                    projects,
                })
                .await
            }
            Err(e) => self.send_error(Some(subscription_id), e.to_string()).await,
        }
    }

    async fn send_project_info(&mut self, subscription_id: Uuid, project: ProjectId) -> Result<()> {
        match self.index.project_info(project).await {
            Ok(project) => {
                self.send(ViewerResponse::ProjectInfo {
                    subscription_id,
                    project,
                })
                .await
            }
            Err(e) => self.send_error(Some(subscription_id), e.to_string()).await,
        }
    }

    async fn handle_index_event(&mut self, event: IndexEvent) -> Result<()> {
        // Run count and latest run show up in the list as well
        let list_changed = !matches!(event, IndexEvent::MetaSaved { .. });
        let mut pushes = Vec::new();
        for (id, subscription) in &self.subscriptions {
            match subscription {
                Subscription::Projects if list_changed => pushes.push((*id, Push::ProjectList)),
                Subscription::Project(project) if project == event.project() => {
                    let push = match event {
                        IndexEvent::ProjectRemoved { .. } => Push::ProjectRemoved(project.clone()),
                        _ => Push::ProjectInfo(project.clone()),
                    };
                    pushes.push((*id, push));
                }
                _ => {}
            }
        }
        self.push_all(pushes).await
    }

    async fn resend_snapshots(&mut self) -> Result<()> {
        let pushes = self
            .subscriptions
            .iter()
            .filter_map(|(id, subscription)| match subscription {
                Subscription::Projects => Some((*id, Push::ProjectList)),
                Subscription::Project(project) => {
                    Some((*id, Push::ProjectResync(project.clone())))
                }
                Subscription::Samples(_) => None,
            })
            .collect();
        self.push_all(pushes).await
    }

    async fn push_all(&mut self, pushes: Vec<(Uuid, Push)>) -> Result<()> {
        for (subscription_id, push) in pushes {
            match push {
                Push::ProjectList => self.send_project_list(subscription_id).await?,
                Push::ProjectInfo(project) => {
                    self.push_project_info(subscription_id, project, false).await?
                }
                Push::ProjectRemoved(project) => {
                    self.send(ViewerResponse::ProjectRemoved {
                        subscription_id,
                        project,
                    })
                    .await?
                }
                Push::ProjectResync(project) => {
                    self.push_project_info(subscription_id, project, true).await?
                }
            }
        }
        Ok(())
    }

    async fn push_project_info(
        &mut self,
        subscription_id: Uuid,
        project: ProjectId,
        resync: bool,
    ) -> Result<()> {
        match self.index.project_info(project.clone()).await {
            Ok(project) => {
                self.send(ViewerResponse::ProjectInfo {
                    subscription_id,
                    project,
                })
                .await
            }
            Err(RunscopeError::ProjectNotFound(_)) if resync => {
                self.send(ViewerResponse::ProjectRemoved {
                    subscription_id,
                    project,
                })
                .await
            }
            Err(RunscopeError::ProjectNotFound(_)) => {
                debug!("Project {} is gone, its removal push follows", project);
                Ok(())
            }
            Err(e) => self.send_error(Some(subscription_id), e.to_string()).await,
        }
    }

    fn release_all(&mut self) {
        if !self.subscriptions.is_empty() {
            info!(
                "Releasing {} subscriptions of viewer {}",
                self.subscriptions.len(),
                self.peer
            );
        }
        self.subscriptions.clear();
    }
}
