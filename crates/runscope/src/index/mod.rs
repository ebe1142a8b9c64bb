//! # Run Index
//!
//! In-memory map of project → run → meta for everything under the samples
//! root. The map itself is plain synchronous state; [`watcher::IndexService`]
//! owns one and feeds it filesystem changes.
//!
//! Every mutation returns the [`IndexEvent`]s it caused so the owner can
//! publish them. A run exists exactly as long as its log file does, and a
//! project exists exactly as long as it has at least one run.

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::{Result, RunscopeError};
use crate::meta::{self, MetaUpdate, RunMeta};
use crate::project::{ProjectId, RunLocation};

pub mod watcher;

pub use watcher::{IndexHandle, IndexService};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub timestamp: u64,
    /// Local start time, for display
    pub label: String,
    pub meta: RunMeta,
    #[serde(skip)]
    pub log_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: ProjectId,
    pub name: Option<String>,
    pub run_count: usize,
    pub latest_run: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub id: ProjectId,
    pub name: Option<String>,
    /// Oldest first
    pub runs: Vec<RunInfo>,
}

/// A change in the index, published to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IndexEvent {
    NewProject { project: ProjectId },
    ProjectRemoved { project: ProjectId },
    NewRun { project: ProjectId, timestamp: u64 },
    RunRemoved { project: ProjectId, timestamp: u64 },
    MetaSaved { project: ProjectId, timestamp: u64 },
}

impl IndexEvent {
    /// True for changes to the set of projects
    pub fn affects_project_list(&self) -> bool {
        matches!(
            self,
            IndexEvent::NewProject { .. } | IndexEvent::ProjectRemoved { .. }
        )
    }

    pub fn project(&self) -> &ProjectId {
        match self {
            IndexEvent::NewProject { project }
            | IndexEvent::ProjectRemoved { project }
            | IndexEvent::NewRun { project, .. }
            | IndexEvent::RunRemoved { project, .. }
            | IndexEvent::MetaSaved { project, .. } => project,
        }
    }
}

pub fn run_label(timestamp: u64) -> String {
    match Local.timestamp_millis_opt(timestamp as i64).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => timestamp.to_string(),
    }
}

pub struct RunIndex {
    root: PathBuf,
    projects: BTreeMap<ProjectId, BTreeMap<u64, RunInfo>>,
}

impl RunIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            projects: BTreeMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the root once and add every run log found
    pub fn scan(&mut self) -> Result<Vec<IndexEvent>> {
        let mut events = Vec::new();
        if !self.root.exists() {
            return Ok(events);
        }
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                events.extend(self.scan_project_dir(&path)?);
            }
        }
        info!(
            "Indexed {} projects under {:?}",
            self.projects.len(),
            self.root
        );
        Ok(events)
    }

    /// Add every run log in one project directory
    pub fn scan_project_dir(&mut self, dir: &Path) -> Result<Vec<IndexEvent>> {
        let mut events = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if let Ok(location) = RunLocation::from_log_path(&self.root, &path) {
                events.extend(self.insert_run(location, path));
            }
        }
        Ok(events)
    }

    /// A run log appeared. Paths that are not run logs are rejected with
    /// `InvalidRunPath`.
    pub fn add_run_file(&mut self, path: &Path) -> Result<Vec<IndexEvent>> {
        let location = RunLocation::from_log_path(&self.root, path)?;
        Ok(self.insert_run(location, path.to_path_buf()))
    }

    fn insert_run(&mut self, location: RunLocation, log_path: PathBuf) -> Vec<IndexEvent> {
        let mut events = Vec::new();
        if !self.projects.contains_key(&location.project) {
            info!("New project {}", location.project);
            events.push(IndexEvent::NewProject {
                project: location.project.clone(),
            });
        }
        let runs = self.projects.entry(location.project.clone()).or_default();

        if runs.contains_key(&location.timestamp) {
            return events;
        }

        debug!("New run {}", location);
        let meta = meta::read_meta(&location.meta_path(&self.root));
        runs.insert(
            location.timestamp,
            RunInfo {
                timestamp: location.timestamp,
                label: run_label(location.timestamp),
                meta,
                log_path,
            },
        );
        events.push(IndexEvent::NewRun {
            project: location.project,
            timestamp: location.timestamp,
        });
        events
    }

    /// A path disappeared. Handles run logs and whole project directories;
    /// anything else is ignored.
    pub fn remove_path(&mut self, path: &Path) -> Vec<IndexEvent> {
        if let Ok(location) = RunLocation::from_log_path(&self.root, path) {
            return self.remove_run(&location);
        }

        let is_project_dir = path.parent() == Some(self.root.as_path());
        let project = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(ProjectId::new);
        match project {
            Some(project) if is_project_dir && self.projects.contains_key(&project) => {
                let timestamps: Vec<u64> = self.projects[&project].keys().copied().collect();
                timestamps
                    .into_iter()
                    .flat_map(|timestamp| {
                        self.remove_run(&RunLocation::new(project.clone(), timestamp))
                    })
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    fn remove_run(&mut self, location: &RunLocation) -> Vec<IndexEvent> {
        let mut events = Vec::new();
        let Some(runs) = self.projects.get_mut(&location.project) else {
            return events;
        };
        if runs.remove(&location.timestamp).is_none() {
            return events;
        }

        debug!("Run removed {}", location);
        events.push(IndexEvent::RunRemoved {
            project: location.project.clone(),
            timestamp: location.timestamp,
        });

        if runs.is_empty() {
            info!("Project {} has no runs left", location.project);
            self.projects.remove(&location.project);
            events.push(IndexEvent::ProjectRemoved {
                project: location.project.clone(),
            });
        }
        events
    }

    pub fn projects(&self) -> Vec<ProjectSummary> {
        self.projects
            .iter()
            .map(|(id, runs)| ProjectSummary {
                id: id.clone(),
                name: id.name(),
                run_count: runs.len(),
                latest_run: runs.keys().next_back().copied(),
            })
            .collect()
    }

    pub fn project(&self, project: &ProjectId) -> Result<ProjectInfo> {
        let runs = self
            .projects
            .get(project)
            .ok_or_else(|| RunscopeError::ProjectNotFound(project.clone()))?;
        Ok(ProjectInfo {
            id: project.clone(),
            name: project.name(),
            runs: runs.values().cloned().collect(),
        })
    }

    pub fn run(&self, project: &ProjectId, timestamp: u64) -> Result<&RunInfo> {
        self.projects
            .get(project)
            .ok_or_else(|| RunscopeError::ProjectNotFound(project.clone()))?
            .get(&timestamp)
            .ok_or_else(|| RunscopeError::RunNotFound {
                project: project.clone(),
                timestamp,
            })
    }

    /// A sidecar was written by another process, typically the supervisor
    /// recording its summary. Returns `MetaSaved` only if the indexed copy
    /// changed, so saves made through this index are not announced twice.
    pub fn reload_meta(&mut self, path: &Path) -> Result<Vec<IndexEvent>> {
        let location = RunLocation::from_meta_path(&self.root, path)?;
        let Some(run) = self
            .projects
            .get_mut(&location.project)
            .and_then(|runs| runs.get_mut(&location.timestamp))
        else {
            // Meta for a run whose log has not shown up yet is read on insert
            return Ok(Vec::new());
        };

        let meta = meta::read_meta(path);
        if meta == run.meta {
            return Ok(Vec::new());
        }
        debug!("Meta changed on disk for {}", location);
        run.meta = meta;
        Ok(vec![IndexEvent::MetaSaved {
            project: location.project,
            timestamp: location.timestamp,
        }])
    }

    /// Read-modify-write a run's sidecar meta and refresh the indexed copy
    pub fn save_meta(
        &mut self,
        project: &ProjectId,
        timestamp: u64,
        update: MetaUpdate,
    ) -> Result<(RunMeta, Vec<IndexEvent>)> {
        self.run(project, timestamp)?;
        let location = RunLocation::new(project.clone(), timestamp);
        let saved = meta::save_meta(&location.meta_path(&self.root), update)?;

        if let Some(run) = self
            .projects
            .get_mut(project)
            .and_then(|runs| runs.get_mut(&timestamp))
        {
            run.meta = saved.clone();
        } else {
            warn!("Run {} vanished while saving meta", location);
        }

        Ok((
            saved,
            vec![IndexEvent::MetaSaved {
                project: project.clone(),
                timestamp,
            }],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn touch(root: &Path, project: &str, timestamp: u64) -> PathBuf {
        let location = RunLocation::new(ProjectId::new(project), timestamp);
        let path = location.log_path(root);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "").unwrap();
        path
    }

    #[test]
    fn test_first_run_creates_project() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = RunIndex::new(dir.path());
        let path = touch(dir.path(), "p", 10);

        let events = index.add_run_file(&path).unwrap();
        assert_eq!(
            events,
            vec![
                IndexEvent::NewProject {
                    project: ProjectId::new("p")
                },
                IndexEvent::NewRun {
                    project: ProjectId::new("p"),
                    timestamp: 10
                },
            ]
        );
        assert!(index.add_run_file(&path).unwrap().is_empty());
    }

    #[test]
    fn test_removing_last_run_removes_project() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = RunIndex::new(dir.path());
        let first = touch(dir.path(), "p", 1);
        let second = touch(dir.path(), "p", 2);
        index.scan().unwrap();
        assert_eq!(index.project(&ProjectId::new("p")).unwrap().runs.len(), 2);

        assert_eq!(index.remove_path(&first).len(), 1);
        assert_eq!(index.project(&ProjectId::new("p")).unwrap().runs.len(), 1);

        let events = index.remove_path(&second);
        assert!(events.iter().any(IndexEvent::affects_project_list));
        assert!(matches!(
            index.project(&ProjectId::new("p")),
            Err(RunscopeError::ProjectNotFound(_))
        ));

        // Re-creating the file reinstates both
        index.add_run_file(&second).unwrap();
        assert_eq!(index.projects().len(), 1);
    }

    #[test]
    fn test_removing_project_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = RunIndex::new(dir.path());
        touch(dir.path(), "p", 1);
        touch(dir.path(), "p", 2);
        index.scan().unwrap();

        let events = index.remove_path(&dir.path().join("p"));
        assert_eq!(events.len(), 3);
        assert!(index.projects().is_empty());
    }

    #[test]
    fn test_ignores_sidecars_and_strays() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = RunIndex::new(dir.path());
        let location = RunLocation::new(ProjectId::new("p"), 5);
        fs::create_dir_all(location.project_dir(dir.path())).unwrap();
        fs::write(location.meta_path(dir.path()), "{}").unwrap();
        fs::write(dir.path().join("p").join("notes.txt"), "").unwrap();

        assert!(index.add_run_file(&location.meta_path(dir.path())).is_err());
        index.scan().unwrap();
        assert!(index.projects().is_empty());
    }

    #[test]
    fn test_save_meta_updates_index() {
        let dir = tempfile::tempdir().unwrap();
        let mut index = RunIndex::new(dir.path());
        let path = touch(dir.path(), "p", 7);
        index.add_run_file(&path).unwrap();

        let project = ProjectId::new("p");
        let (meta, events) = index
            .save_meta(&project, 7, MetaUpdate::AddTag("slow".to_string()))
            .unwrap();
        assert_eq!(meta.tags, vec!["slow".to_string()]);
        assert_eq!(events.len(), 1);
        assert_eq!(index.run(&project, 7).unwrap().meta.tags, meta.tags);

        assert!(matches!(
            index.save_meta(&project, 8, MetaUpdate::AddTag("x".to_string())),
            Err(RunscopeError::RunNotFound { .. })
        ));
    }

    #[test]
    fn test_meta_loaded_on_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let location = RunLocation::new(ProjectId::new("p"), 3);
        meta::save_meta(
            &location.meta_path(dir.path()),
            MetaUpdate::AddTag("kept".to_string()),
        )
        .unwrap();
        let path = touch(dir.path(), "p", 3);

        let mut index = RunIndex::new(dir.path());
        index.add_run_file(&path).unwrap();
        assert_eq!(
            index.run(&ProjectId::new("p"), 3).unwrap().meta.tags,
            vec!["kept".to_string()]
        );
    }

    #[test]
    fn test_meta_written_elsewhere_is_picked_up_once() {
        let dir = tempfile::tempdir().unwrap();
        let project = ProjectId::new("p");
        let location = RunLocation::new(project.clone(), 5);
        let path = touch(dir.path(), "p", 5);
        let mut index = RunIndex::new(dir.path());
        index.add_run_file(&path).unwrap();

        let meta_path = location.meta_path(dir.path());
        meta::save_meta(&meta_path, MetaUpdate::AddTag("from-run".to_string())).unwrap();

        assert_eq!(
            index.reload_meta(&meta_path).unwrap(),
            vec![IndexEvent::MetaSaved {
                project: project.clone(),
                timestamp: 5
            }]
        );
        assert_eq!(
            index.run(&project, 5).unwrap().meta.tags,
            vec!["from-run".to_string()]
        );
        // Unchanged on disk, nothing to announce
        assert!(index.reload_meta(&meta_path).unwrap().is_empty());
        assert!(index.reload_meta(&path).is_err());
    }
}
