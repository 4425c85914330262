use crate::JobInfo;
use std::collections::{HashMap, HashSet};

/// Project -> threads with a pending or running job.
///
/// A project key exists only while its thread set is non-empty, so key
/// presence answers "does this project have anything running".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActiveJobIndex {
    projects: HashMap<String, HashSet<String>>,
}

impl ActiveJobIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole index from a full `active_jobs` listing.
    pub fn apply_full_list(&mut self, jobs: &[JobInfo]) {
        self.projects.clear();
        for job in jobs.iter().filter(|job| job.status.is_active()) {
            self.projects
                .entry(job.project_id.clone())
                .or_default()
                .insert(job.thread_id.clone());
        }
    }

    /// Moves one (project, thread) pair in or out of the active set. Returns
    /// whether the index changed.
    pub fn apply_update(&mut self, job: &JobInfo) -> bool {
        if job.status.is_active() {
            return self
                .projects
                .entry(job.project_id.clone())
                .or_default()
                .insert(job.thread_id.clone());
        }

        let Some(threads) = self.projects.get_mut(&job.project_id) else {
            return false;
        };
        let removed = threads.remove(&job.thread_id);
        if threads.is_empty() {
            self.projects.remove(&job.project_id);
        }
        removed
    }

    pub fn has_active_job(&self, project_id: &str, thread_id: &str) -> bool {
        self.projects
            .get(project_id)
            .map(|threads| threads.contains(thread_id))
            .unwrap_or(false)
    }

    pub fn has_project(&self, project_id: &str) -> bool {
        self.projects.contains_key(project_id)
    }

    pub fn threads(&self, project_id: &str) -> Option<&HashSet<String>> {
        self.projects.get(project_id)
    }

    pub fn projects(&self) -> impl Iterator<Item = &String> {
        self.projects.keys()
    }

    pub fn as_map(&self) -> &HashMap<String, HashSet<String>> {
        &self.projects
    }

    /// Total number of active threads across all projects.
    pub fn active_count(&self) -> usize {
        self.projects.values().map(HashSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.is_empty()
    }
}
