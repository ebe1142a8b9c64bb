//! # Run Meta
//!
//! Small mutable side-record stored next to a run's immutable event log.
//! Every change is a read-modify-write of the whole sidecar file. A missing or
//! corrupt sidecar reads as empty meta, so meta problems never block serving
//! the log itself.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::summary::{ProcessStats, RunSummary};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMeta {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "remoteID", default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env_vars: Option<BTreeMap<String, String>>,
    /// Per-process maxima keyed by pid, written when the run finishes
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "pid_keyed"
    )]
    pub processes: BTreeMap<u32, ProcessStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_start: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main_end: Option<u64>,
    /// Keys written by other tools, carried through every save
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Pid keys arrive as JSON strings. The flattened `extra` map buffers the
/// whole object first, so they have to be parsed by hand.
fn pid_keyed<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<u32, ProcessStats>, D::Error>
where
    D: Deserializer<'de>,
{
    BTreeMap::<String, ProcessStats>::deserialize(deserializer)?
        .into_iter()
        .map(|(pid, stats)| {
            pid.parse()
                .map(|pid| (pid, stats))
                .map_err(|_| serde::de::Error::custom(format!("invalid pid key: {}", pid)))
        })
        .collect()
}

impl RunMeta {
    /// Returns false if the tag was already present
    pub fn add_tag(&mut self, tag: &str) -> bool {
        if self.tags.iter().any(|t| t == tag) {
            return false;
        }
        self.tags.push(tag.to_string());
        true
    }

    /// Returns false if the tag was absent
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        let before = self.tags.len();
        self.tags.retain(|t| t != tag);
        self.tags.len() != before
    }

    pub fn record_summary(&mut self, summary: &RunSummary) {
        self.processes = summary.stats.clone();
        self.main_start = summary.main_start;
        self.main_end = summary.main_end;
    }
}

/// A single change to a run's meta
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaUpdate {
    AddTag(String),
    RemoveTag(String),
    SetRemoteId(Option<String>),
    SetEnvVars(BTreeMap<String, String>),
    RecordSummary(RunSummary),
}

impl MetaUpdate {
    pub fn apply(self, meta: &mut RunMeta) {
        match self {
            MetaUpdate::AddTag(tag) => {
                meta.add_tag(&tag);
            }
            MetaUpdate::RemoveTag(tag) => {
                meta.remove_tag(&tag);
            }
            MetaUpdate::SetRemoteId(remote_id) => meta.remote_id = remote_id,
            MetaUpdate::SetEnvVars(vars) => meta.env_vars = Some(vars),
            MetaUpdate::RecordSummary(summary) => meta.record_summary(&summary),
        }
    }
}

/// Read the sidecar, treating absence or corruption as empty meta
pub fn read_meta(path: &Path) -> RunMeta {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return RunMeta::default(),
        Err(e) => {
            warn!("Failed to read meta file {:?}: {}", path, e);
            return RunMeta::default();
        }
    };

    match serde_json::from_str(&content) {
        Ok(meta) => meta,
        Err(e) => {
            warn!("Ignoring corrupt meta file {:?}: {}", path, e);
            RunMeta::default()
        }
    }
}

/// Read-modify-write the sidecar and return the stored meta
pub fn save_meta(path: &Path, update: MetaUpdate) -> Result<RunMeta> {
    let mut meta = read_meta(path);
    update.apply(&mut meta);
    write_meta(path, &meta)?;
    Ok(meta)
}

fn write_meta(path: &Path, meta: &RunMeta) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    // Write beside the target and rename so readers never see half a file
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, serde_json::to_vec_pretty(meta)?)?;
    fs::rename(&tmp_path, path)?;
    debug!("Saved meta {:?}", path);
    Ok(())
}
