use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use crate::events::EventData;

/// What a process announces about itself when it joins a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub pid: u32,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub argv: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl Registration {
    pub fn new(pid: u32, tag: impl Into<String>) -> Self {
        Self {
            pid,
            tag: tag.into(),
            label: None,
            argv: Vec::new(),
            command: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_argv(mut self, argv: Vec<String>) -> Self {
        self.argv = argv;
        self
    }
}

/// The set of processes a run is sampling.
///
/// A pid joins through [`register`](Self::register) and stays known for the
/// rest of the run, so a re-announcement never produces a second
/// registration. It leaves the active set once the sampler can no longer
/// resolve it.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    labels: HashMap<u32, String>,
    active: BTreeSet<u32>,
    tag_counters: HashMap<String, u32>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a process. Returns the event to record, or `None` if the pid
    /// was already registered in this run.
    pub fn register(&mut self, registration: Registration) -> Option<EventData> {
        if let Some(label) = self.labels.get(&registration.pid) {
            debug!(
                "Process {} already registered as {:?}",
                registration.pid, label
            );
            return None;
        }

        let label = match registration.label {
            Some(label) => label,
            None => self.next_label(&registration.tag),
        };
        info!("Registered process {} as {:?}", registration.pid, label);

        self.labels.insert(registration.pid, label.clone());
        self.active.insert(registration.pid);

        Some(EventData::ProcessRegister {
            pid: registration.pid,
            tag: registration.tag,
            label,
            argv: registration.argv,
            command: registration.command,
        })
    }

    fn next_label(&mut self, tag: &str) -> String {
        let count = self.tag_counters.entry(tag.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            tag.to_string()
        } else {
            format!("{} #{}", tag, count)
        }
    }

    /// Stop sampling a pid. Returns false if it was not active.
    pub fn deactivate(&mut self, pid: u32) -> bool {
        self.active.remove(&pid)
    }

    pub fn active_pids(&self) -> Vec<u32> {
        self.active.iter().copied().collect()
    }

    pub fn is_active(&self, pid: u32) -> bool {
        self.active.contains(&pid)
    }

    pub fn label(&self, pid: u32) -> Option<&str> {
        self.labels.get(&pid).map(String::as_str)
    }

    pub fn clear_active(&mut self) {
        self.active.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn label_of(event: Option<EventData>) -> String {
        match event {
            Some(EventData::ProcessRegister { label, .. }) => label,
            other => panic!("expected a registration, got {:?}", other),
        }
    }

    #[test]
    fn test_labels_count_per_tag() {
        let mut registry = ProcessRegistry::new();
        let labels: Vec<String> = (0..4)
            .map(|n| label_of(registry.register(Registration::new(100 + n, "Main"))))
            .collect();
        assert_eq!(labels, vec!["Main", "Main #2", "Main #3", "Main #4"]);

        assert_eq!(
            label_of(registry.register(Registration::new(200, "Worker"))),
            "Worker"
        );
    }

    #[test]
    fn test_explicit_label_does_not_consume_counter() {
        let mut registry = ProcessRegistry::new();
        let explicit = registry.register(Registration::new(1, "Worker").with_label("cache"));
        assert_eq!(label_of(explicit), "cache");
        assert_eq!(label_of(registry.register(Registration::new(2, "Worker"))), "Worker");
    }

    #[test]
    fn test_second_registration_is_ignored() {
        let mut registry = ProcessRegistry::new();
        assert!(registry.register(Registration::new(7, "Main")).is_some());
        assert!(registry
            .register(Registration::new(7, "Main").with_label("again"))
            .is_none());
        assert_eq!(registry.label(7), Some("Main"));
        assert_eq!(registry.active_pids(), vec![7]);
    }

    #[test]
    fn test_deactivated_pid_stays_known() {
        let mut registry = ProcessRegistry::new();
        registry.register(Registration::new(7, "Main"));
        assert!(registry.deactivate(7));
        assert!(!registry.is_active(7));
        assert!(registry.register(Registration::new(7, "Main")).is_none());
        assert!(registry.active_pids().is_empty());
    }
}
