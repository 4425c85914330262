use jobsync_core::{OutboundFrame, ThreadRef};

/// Remembers the single thread this client is watching and produces the
/// control frames that go with changes to it.
///
/// The registry is the source of truth for reconnects: whatever it holds is
/// replayed as a fresh `subscribe` so the server answers with a new snapshot.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    current: Option<ThreadRef>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&ThreadRef> {
        self.current.as_ref()
    }

    /// Replaces any previous subscription. The server treats a new
    /// `subscribe` as an implicit unsubscribe of the old thread, so only one
    /// frame is produced. Subscribing to the same thread again still yields
    /// a frame, which asks for a fresh snapshot.
    pub fn subscribe(&mut self, thread: ThreadRef) -> OutboundFrame {
        let frame = subscribe_frame(&thread);
        self.current = Some(thread);
        frame
    }

    /// Clears the subscription. Returns `None` when nothing was subscribed.
    pub fn unsubscribe(&mut self) -> Option<OutboundFrame> {
        self.current.take().map(|_| OutboundFrame::Unsubscribe)
    }

    /// Frame to re-issue after the transport comes back.
    pub fn replay(&self) -> Option<OutboundFrame> {
        self.current.as_ref().map(subscribe_frame)
    }
}

fn subscribe_frame(thread: &ThreadRef) -> OutboundFrame {
    OutboundFrame::Subscribe {
        project_id: thread.project_id.clone(),
        thread_id: thread.thread_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_replaces_previous_thread() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe(ThreadRef::new("P1", "T1"));
        let frame = registry.subscribe(ThreadRef::new("P1", "T2"));

        assert_eq!(
            frame,
            OutboundFrame::Subscribe {
                project_id: "P1".to_string(),
                thread_id: "T2".to_string(),
            }
        );
        assert_eq!(registry.current(), Some(&ThreadRef::new("P1", "T2")));
    }

    #[test]
    fn unsubscribe_only_emits_when_subscribed() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.unsubscribe(), None);

        registry.subscribe(ThreadRef::new("P1", "T1"));
        assert_eq!(registry.unsubscribe(), Some(OutboundFrame::Unsubscribe));
        assert_eq!(registry.current(), None);
        assert_eq!(registry.replay(), None);
    }

    #[test]
    fn replay_reissues_current_subscription() {
        let mut registry = SubscriptionRegistry::new();
        let original = registry.subscribe(ThreadRef::new("P1", "T1"));
        assert_eq!(registry.replay(), Some(original));
    }
}
