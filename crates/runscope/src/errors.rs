//! # Runscope Errors
//!
//! Structured error conditions for the telemetry pipeline. Failures are always
//! scoped to one run, one pid or one subscription; nothing in here is meant to
//! take down the supervised process or a viewer connection.

use std::path::PathBuf;
use thiserror::Error;

use crate::project::ProjectId;

#[derive(Error, Debug)]
pub enum RunscopeError {
    /// No project with this id is indexed
    #[error("Project not found: {0}")]
    ProjectNotFound(ProjectId),

    /// The project exists but has no run at this timestamp
    #[error("Run not found: {project}/{timestamp}")]
    RunNotFound { project: ProjectId, timestamp: u64 },

    /// A path under the samples root that does not look like a run log
    #[error("Not a run log path: {0:?}")]
    InvalidRunPath(PathBuf),

    /// The owning task went away before answering
    #[error("Channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = RunscopeError> = std::result::Result<T, E>;
