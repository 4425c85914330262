use crate::connection::ConnectionEvent;
use chrono::{DateTime, Utc};
use jobsync_core::reducer::is_stale;
use jobsync_core::{accumulate, reduce, ActiveJobIndex, JobEvent, JobState, ThreadRef};
use std::sync::Arc;
use tracing::debug;

/// Everything the facade exposes, updated one [`ConnectionEvent`] at a time.
///
/// Single-threaded on purpose: all mutation goes through [`SyncState::apply`]
/// in the order events arrived from the transport.
#[derive(Debug, Default)]
pub struct SyncState {
    ws_connected: bool,
    active_jobs: ActiveJobIndex,
    watched: Option<ThreadRef>,
    current_job_state: Option<Arc<JobState>>,
    current_job_event: Option<JobEvent>,
    snapshot_stale: bool,
}

impl SyncState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ws_connected(&self) -> bool {
        self.ws_connected
    }

    pub fn active_jobs(&self) -> &ActiveJobIndex {
        &self.active_jobs
    }

    pub fn watched(&self) -> Option<&ThreadRef> {
        self.watched.as_ref()
    }

    pub fn current_job_state(&self) -> Option<&Arc<JobState>> {
        self.current_job_state.as_ref()
    }

    pub fn current_job_event(&self) -> Option<&JobEvent> {
        self.current_job_event.as_ref()
    }

    pub fn has_active_job(&self, project_id: &str, thread_id: &str) -> bool {
        self.active_jobs.has_active_job(project_id, thread_id)
    }

    /// True once the watched thread's snapshot has been confirmed by the
    /// server over the current connection.
    pub fn is_live(&self) -> bool {
        self.ws_connected && self.watched.is_some() && !self.snapshot_stale
    }

    /// Switches to `thread`, dropping whatever was mirrored for the previous
    /// one. Until the server answers with a snapshot the state is not live.
    pub fn watch(&mut self, thread: ThreadRef) {
        self.watched = Some(thread);
        self.current_job_state = None;
        self.current_job_event = None;
        self.snapshot_stale = true;
    }

    pub fn unwatch(&mut self) {
        self.watched = None;
        self.current_job_state = None;
        self.current_job_event = None;
        self.snapshot_stale = false;
    }

    /// Applies one transport event. Returns whether anything observable
    /// changed.
    pub fn apply(&mut self, event: ConnectionEvent, now: DateTime<Utc>) -> bool {
        match event {
            ConnectionEvent::Connection(connected) => self.apply_connection(connected),
            ConnectionEvent::ActiveJobs(jobs) => {
                self.active_jobs.apply_full_list(&jobs);
                debug!(event = "active_jobs_replaced", count = self.active_jobs.active_count());
                true
            }
            ConnectionEvent::JobUpdate(job) => self.active_jobs.apply_update(&job),
            ConnectionEvent::JobState {
                project_id,
                thread_id,
                state,
            } => {
                let Some(watched) = self.watched.as_ref() else {
                    return false;
                };
                // The frame-level identity wins; the snapshot's own is the fallback.
                let project_id = project_id
                    .or_else(|| state.as_ref().and_then(|frame| frame.project_id.clone()));
                let thread_id =
                    thread_id.or_else(|| state.as_ref().and_then(|frame| frame.thread_id.clone()));
                if !concerns(watched, project_id.as_deref(), thread_id.as_deref()) {
                    debug!(event = "snapshot_ignored", thread_id = ?thread_id);
                    return false;
                }
                let next = state.map(|frame| Arc::new(JobState::from_frame(frame, watched, now)));
                debug!(
                    event = "snapshot_adopted",
                    thread = %watched,
                    phase = ?next.as_ref().map(|state| state.current_phase),
                );
                self.current_job_state = next;
                self.snapshot_stale = false;
                true
            }
            ConnectionEvent::JobEvent(event) => self.apply_job_event(event, now),
        }
    }

    fn apply_connection(&mut self, connected: bool) -> bool {
        if self.ws_connected == connected {
            return false;
        }
        self.ws_connected = connected;
        if !connected && self.watched.is_some() {
            self.snapshot_stale = true;
        }
        true
    }

    fn apply_job_event(&mut self, event: JobEvent, now: DateTime<Utc>) -> bool {
        let Some(watched) = self.watched.as_ref() else {
            return false;
        };
        match event.thread_id.as_deref() {
            Some(thread_id) if thread_id != watched.thread_id => {
                debug!(event = "job_event_ignored", thread_id, kind = event.kind());
                return false;
            }
            // Untagged events may still be in flight from the previous
            // subscription until the new snapshot lands.
            None if self.snapshot_stale => {
                debug!(event = "untagged_event_ignored", kind = event.kind());
                return false;
            }
            _ => {}
        }
        if let Some(state) = self.current_job_state.as_ref() {
            if is_stale(state, &event) {
                debug!(
                    event = "stale_job_event",
                    job_id = ?event.job_id,
                    kind = event.kind(),
                );
                return false;
            }
        }

        let reduced = reduce(self.current_job_state.as_ref(), &event, watched, now);
        let next = accumulate(reduced.as_ref(), &event);
        let state_changed = match (&self.current_job_state, &next) {
            (Some(before), Some(after)) => !Arc::ptr_eq(before, after),
            (None, None) => false,
            _ => true,
        };
        if state_changed {
            debug!(
                event = "job_state_changed",
                kind = event.kind(),
                phase = ?next.as_ref().map(|state| state.current_phase),
            );
        }
        self.current_job_state = next;
        self.current_job_event = Some(event);
        true
    }
}

fn concerns(watched: &ThreadRef, project_id: Option<&str>, thread_id: Option<&str>) -> bool {
    project_id.map_or(true, |project_id| project_id == watched.project_id)
        && thread_id.map_or(true, |thread_id| thread_id == watched.thread_id)
}
