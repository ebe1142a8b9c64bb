//! # Projects and Run Locations
//!
//! A project id is derived from the working directory so that repeated runs
//! of the same project land in the same directory. The derivation is URL-safe
//! unpadded base64 of the directory path relative to the home directory, which
//! keeps the id usable as a single path component and lets the index recover
//! the human-readable project name.
//!
//! On disk a run is `<samples_root>/<project id>/<timestamp>.jsonl`, with its
//! sidecar meta at `<samples_root>/<project id>/<timestamp>.meta.json`.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::config::home_dir;
use crate::errors::{Result, RunscopeError};

pub const LOG_EXTENSION: &str = "jsonl";
pub const META_SUFFIX: &str = ".meta.json";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(String);

impl ProjectId {
    /// Wrap an id read from disk or the wire without re-deriving it
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id from a project path that is already home-relative
    pub fn from_project_path(project_path: &Path) -> Self {
        let path = project_path.to_string_lossy();
        Self(URL_SAFE_NO_PAD.encode(path.as_bytes()))
    }

    /// Derive the id for a working directory
    pub fn for_working_dir(cwd: &Path) -> Self {
        let cwd = dunce::canonicalize(cwd).unwrap_or_else(|_| cwd.to_path_buf());
        let relative = match home_dir() {
            Some(home) => {
                let home = dunce::canonicalize(&home).unwrap_or(home);
                cwd.strip_prefix(&home)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|_| cwd.clone())
            }
            None => cwd.clone(),
        };
        Self::from_project_path(&relative)
    }

    /// Recover the project path this id was derived from
    pub fn name(&self) -> Option<String> {
        let bytes = URL_SAFE_NO_PAD.decode(self.0.as_bytes()).ok()?;
        String::from_utf8(bytes).ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one run on disk
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunLocation {
    pub project: ProjectId,
    /// Unix milliseconds at which the supervisor started
    pub timestamp: u64,
}

impl RunLocation {
    pub fn new(project: ProjectId, timestamp: u64) -> Self {
        Self { project, timestamp }
    }

    pub fn project_dir(&self, samples_root: &Path) -> PathBuf {
        samples_root.join(self.project.as_str())
    }

    pub fn log_path(&self, samples_root: &Path) -> PathBuf {
        self.project_dir(samples_root)
            .join(format!("{}.{}", self.timestamp, LOG_EXTENSION))
    }

    pub fn meta_path(&self, samples_root: &Path) -> PathBuf {
        self.project_dir(samples_root)
            .join(format!("{}{}", self.timestamp, META_SUFFIX))
    }

    /// Parse `<root>/<project>/<timestamp>.jsonl`. Anything else, sidecar meta
    /// files included, is rejected.
    pub fn from_log_path(samples_root: &Path, path: &Path) -> Result<Self> {
        Self::parse(samples_root, path, &format!(".{}", LOG_EXTENSION))
    }

    /// Parse `<root>/<project>/<timestamp>.meta.json`
    pub fn from_meta_path(samples_root: &Path, path: &Path) -> Result<Self> {
        Self::parse(samples_root, path, META_SUFFIX)
    }

    fn parse(samples_root: &Path, path: &Path, suffix: &str) -> Result<Self> {
        let invalid = || RunscopeError::InvalidRunPath(path.to_path_buf());

        let relative = path.strip_prefix(samples_root).map_err(|_| invalid())?;
        let parts: Vec<&str> = relative
            .components()
            .map(|c| match c {
                Component::Normal(part) => part.to_str(),
                _ => None,
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(invalid)?;

        let [project, file] = parts.as_slice() else {
            return Err(invalid());
        };

        let stem = file.strip_suffix(suffix).ok_or_else(invalid)?;
        if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let timestamp = stem.parse().map_err(|_| invalid())?;

        Ok(Self::new(ProjectId::new(*project), timestamp))
    }
}

impl fmt::Display for RunLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.project, self.timestamp)
    }
}
