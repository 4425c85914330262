//! The one object UI code talks to.
//!
//! [`JobSync`] owns the connection manager and the mirrored state. Transport
//! events queue up on a channel and are applied by whoever drives
//! [`JobSync::next_change`] or [`JobSync::drain_pending`], so every state
//! transition happens on the caller's task in arrival order.

use crate::config::ClientConfig;
use crate::connection::{ConnectionEvent, ConnectionManager};
use crate::state::SyncState;
use chrono::Utc;
use jobsync_core::{ActiveJobIndex, JobEvent, JobState, ThreadRef};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub struct JobSync {
    manager: ConnectionManager,
    events: Option<mpsc::UnboundedReceiver<ConnectionEvent>>,
    callbacks_registered: bool,
    state: SyncState,
}

impl JobSync {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            manager: ConnectionManager::new(config),
            events: None,
            callbacks_registered: false,
            state: SyncState::new(),
        }
    }

    /// Registers with the connection manager (once) and starts the
    /// transport. Calling it again while running is harmless.
    pub fn start(&mut self) {
        self.register_callbacks();
        self.manager.connect();
    }

    fn register_callbacks(&mut self) {
        if self.callbacks_registered {
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.manager.set_callbacks(tx);
        self.events = Some(rx);
        self.callbacks_registered = true;
        debug!(event = "callbacks_registered");
    }

    pub fn subscribe_thread(&mut self, project_id: &str, thread_id: &str) {
        let thread = ThreadRef::new(project_id, thread_id);
        info!(event = "subscribe", thread = %thread);
        self.state.watch(thread.clone());
        self.manager.subscribe_thread(thread);
    }

    pub fn unsubscribe_from_thread(&mut self) {
        if let Some(thread) = self.state.watched() {
            info!(event = "unsubscribe", thread = %thread);
        }
        self.manager.unsubscribe_thread();
        self.state.unwatch();
    }

    pub fn ws_connected(&self) -> bool {
        self.state.ws_connected()
    }

    pub fn active_jobs(&self) -> &HashMap<String, HashSet<String>> {
        self.state.active_jobs().as_map()
    }

    pub fn active_job_index(&self) -> &ActiveJobIndex {
        self.state.active_jobs()
    }

    pub fn current_job_state(&self) -> Option<&Arc<JobState>> {
        self.state.current_job_state()
    }

    pub fn current_job_event(&self) -> Option<&JobEvent> {
        self.state.current_job_event()
    }

    pub fn current_subscription(&self) -> Option<&ThreadRef> {
        self.state.watched()
    }

    pub fn has_active_job(&self, project_id: &str, thread_id: &str) -> bool {
        self.state.has_active_job(project_id, thread_id)
    }

    pub fn is_live(&self) -> bool {
        self.state.is_live()
    }

    /// Waits for inbound events and applies them until one changes
    /// something. Returns `None` once the event stream has ended.
    pub async fn next_change(&mut self) -> Option<()> {
        loop {
            let event = self.events.as_mut()?.recv().await?;
            if self.state.apply(event, Utc::now()) {
                return Some(());
            }
        }
    }

    /// Applies every event already queued without waiting. Returns whether
    /// any of them changed something.
    pub fn drain_pending(&mut self) -> bool {
        let Some(events) = self.events.as_mut() else {
            return false;
        };
        let mut changed = false;
        while let Ok(event) = events.try_recv() {
            changed |= self.state.apply(event, Utc::now());
        }
        changed
    }

    /// Detaches from the transport and stops it. Any reconnect in progress
    /// is cancelled.
    pub async fn shutdown(&mut self) {
        self.manager.clear_callbacks();
        self.callbacks_registered = false;
        self.events = None;
        self.manager.disconnect().await;
        self.state.apply(ConnectionEvent::Connection(false), Utc::now());
        info!(event = "shutdown");
    }
}
