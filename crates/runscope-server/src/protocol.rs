use serde::{Deserialize, Serialize};
use uuid::Uuid;

use runscope::{Event, ProjectId, ProjectInfo, ProjectSummary, RunMeta};

/// Largest frame either side will accept
pub const MAX_FRAME_LENGTH: usize = 32 * 1024 * 1024;

/// A request from a viewer.
///
/// Subscriptions are keyed by a viewer-chosen `subscription_id` and keep
/// pushing until unsubscribed or the connection drops. Meta edits are one-shot
/// and answered under their `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerRequest {
    ListProjects {
        subscription_id: Uuid,
    },
    ProjectInfo {
        subscription_id: Uuid,
        project: ProjectId,
    },
    ProjectSamples {
        subscription_id: Uuid,
        project: ProjectId,
        timestamp: u64,
    },
    RunAddTag {
        request_id: Uuid,
        project: ProjectId,
        timestamp: u64,
        tag: String,
    },
    RunRemoveTag {
        request_id: Uuid,
        project: ProjectId,
        timestamp: u64,
        tag: String,
    },
    SetRemoteId {
        request_id: Uuid,
        project: ProjectId,
        timestamp: u64,
        #[serde(rename = "remoteID")]
        remote_id: Option<String>,
    },
    Unsubscribe {
        subscription_id: Uuid,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ViewerResponse {
    ProjectList {
        subscription_id: Uuid,
        projects: Vec<ProjectSummary>,
    },
    ProjectInfo {
        subscription_id: Uuid,
        project: ProjectInfo,
    },
    /// The project a `ProjectInfo` subscription follows lost its last run
    ProjectRemoved {
        subscription_id: Uuid,
        project: ProjectId,
    },
    /// One batch of a run log, in file order
    Samples {
        subscription_id: Uuid,
        events: Vec<Event>,
    },
    MetaSaved {
        request_id: Uuid,
        project: ProjectId,
        timestamp: u64,
        meta: RunMeta,
    },
    Unsubscribed {
        subscription_id: Uuid,
    },
    Error {
        /// Subscription or request the failure belongs to
        id: Option<Uuid>,
        message: String,
    },
}

impl ViewerResponse {
    /// The subscription or request this response answers
    pub fn id(&self) -> Option<Uuid> {
        match self {
            ViewerResponse::ProjectList {
                subscription_id, ..
            }
            | ViewerResponse::ProjectInfo {
                subscription_id, ..
            }
            | ViewerResponse::ProjectRemoved {
                subscription_id, ..
            }
            | ViewerResponse::Samples {
                subscription_id, ..
            }
            | ViewerResponse::Unsubscribed { subscription_id } => Some(*subscription_id),
            ViewerResponse::MetaSaved { request_id, .. } => Some(*request_id),
            ViewerResponse::Error { id, .. } => *id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_set_remote_id_wire_name() {
        let request: ViewerRequest = serde_json::from_str(&format!(
            r#"{{"type":"set_remote_id","request_id":"{}","project":"p","timestamp":1,"remoteID":"abc"}}"#,
            Uuid::nil()
        ))
        .unwrap();
        assert_eq!(
            request,
            ViewerRequest::SetRemoteId {
                request_id: Uuid::nil(),
                project: ProjectId::new("p"),
                timestamp: 1,
                remote_id: Some("abc".to_string()),
            }
        );
    }

    #[test]
    fn test_error_carries_id() {
        let id = Uuid::new_v4();
        let response = ViewerResponse::Error {
            id: Some(id),
            message: "Run not found".to_string(),
        };
        assert_eq!(response.id(), Some(id));
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["type"], "error");
    }
}
