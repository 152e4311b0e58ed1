//! Best-effort interaction tracking.
//!
//! Events are queued on an unbounded channel and forwarded by a single worker
//! task, so delivery follows send order. Delivery is at-most-once: a failed
//! submission is logged by the client and dropped, never retried, and never
//! reported to the caller.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::CognitiveApi;
use crate::models::{EventSubmission, Session};

/// Delivery counts reported when the tracker shuts down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub delivered: u64,
    pub dropped: u64,
}

pub struct EventTracker {
    sender: mpsc::UnboundedSender<EventSubmission>,
    worker: JoinHandle<TrackerStats>,
    session_id: Option<String>,
}

impl EventTracker {
    /// Spawn the forwarding worker. Must be called inside a tokio runtime.
    pub fn new(api: Arc<dyn CognitiveApi>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = tokio::spawn(forward(api, receiver));
        Self {
            sender,
            worker,
            session_id: None,
        }
    }

    /// Bind the tracker to `session` and queue a `session_started` event.
    pub fn start(&mut self, session: &Session) {
        self.session_id = Some(session.session_id.clone());
        info!(session_id = %session.session_id, "tracking started");
        self.track(
            "session_started",
            serde_json::json!({
                "puzzleType": session.puzzle_type,
                "resolution": session.resolution,
                "userAgent": session.user_agent,
            }),
        );
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Queue an event for the current session. Returns whether it was queued.
    pub fn track(&self, event_type: &str, data: serde_json::Value) -> bool {
        let Some(session_id) = self.session_id.as_ref() else {
            debug!(event_type = %event_type, "no active session, event ignored");
            return false;
        };
        let event = EventSubmission {
            session_id: session_id.clone(),
            event_type: event_type.to_string(),
            payload: data,
            timestamp: Some(Utc::now()),
        };
        if self.sender.send(event).is_err() {
            warn!(event_type = %event_type, "tracker worker stopped, event dropped");
            return false;
        }
        true
    }

    /// Unbind from the current session. Events already queued are still
    /// forwarded; later `track` calls are no-ops until the next `start`.
    pub fn stop(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            info!(session_id = %session_id, "tracking stopped");
        }
    }

    /// Close the queue and wait for queued events to be forwarded.
    pub async fn shutdown(self) -> TrackerStats {
        drop(self.sender);
        match self.worker.await {
            Ok(stats) => {
                info!(delivered = stats.delivered, dropped = stats.dropped, "tracker stopped");
                stats
            }
            Err(e) => {
                warn!(error = %e, "tracker worker failed");
                TrackerStats::default()
            }
        }
    }
}

async fn forward(
    api: Arc<dyn CognitiveApi>,
    mut receiver: mpsc::UnboundedReceiver<EventSubmission>,
) -> TrackerStats {
    let mut stats = TrackerStats::default();
    while let Some(event) = receiver.recv().await {
        match api.submit_event(&event).await {
            Some(_) => stats.delivered += 1,
            None => stats.dropped += 1,
        }
    }
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockCognitiveApi;
    use crate::models::{EventReceipt, SessionStatus};
    use std::sync::Mutex;

    fn session() -> Session {
        Session {
            session_id: "s1".into(),
            user_id: "u1".into(),
            puzzle_type: "ego_labyrinth".into(),
            started_at: Utc::now(),
            resolution: Some("800x600".into()),
            user_agent: None,
            status: SessionStatus::Active,
            completed_at: None,
            final_state: None,
            metrics: None,
        }
    }

    fn receipt() -> Option<EventReceipt> {
        Some(EventReceipt {
            success: true,
            event_id: "e".into(),
        })
    }

    #[tokio::test]
    async fn test_track_without_session_is_noop() {
        let mut api = MockCognitiveApi::new();
        api.expect_submit_event().never();
        let tracker = EventTracker::new(Arc::new(api));
        assert!(!tracker.track("click", serde_json::json!({})));
        assert_eq!(tracker.shutdown().await, TrackerStats::default());
    }

    #[tokio::test]
    async fn test_events_forwarded_in_send_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut api = MockCognitiveApi::new();
        api.expect_submit_event().times(4).returning(move |event| {
            sink.lock().unwrap().push(event.event_type.clone());
            receipt()
        });

        let mut tracker = EventTracker::new(Arc::new(api));
        tracker.start(&session());
        assert_eq!(tracker.session_id(), Some("s1"));
        for kind in ["move", "hint", "undo"] {
            assert!(tracker.track(kind, serde_json::json!({"k": kind})));
        }
        let stats = tracker.shutdown().await;

        assert_eq!(stats.delivered, 4);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["session_started", "move", "hint", "undo"]
        );
    }

    #[tokio::test]
    async fn test_failures_are_dropped_not_raised() {
        let mut api = MockCognitiveApi::new();
        let mut calls = 0;
        api.expect_submit_event().times(3).returning(move |_| {
            calls += 1;
            if calls == 2 {
                None
            } else {
                receipt()
            }
        });

        let mut tracker = EventTracker::new(Arc::new(api));
        tracker.start(&session());
        tracker.track("move", serde_json::json!({}));
        tracker.track("move", serde_json::json!({}));
        let stats = tracker.shutdown().await;
        assert_eq!(stats, TrackerStats { delivered: 2, dropped: 1 });
    }

    #[tokio::test]
    async fn test_stop_unbinds_session() {
        let mut api = MockCognitiveApi::new();
        api.expect_submit_event().times(2).returning(|_| receipt());

        let mut tracker = EventTracker::new(Arc::new(api));
        tracker.start(&session());
        assert!(tracker.track("move", serde_json::json!({})));
        tracker.stop();
        assert_eq!(tracker.session_id(), None);
        assert!(!tracker.track("move", serde_json::json!({})));
        assert_eq!(tracker.shutdown().await.delivered, 2);
    }

    #[tokio::test]
    async fn test_events_carry_session_id() {
        let mut api = MockCognitiveApi::new();
        api.expect_submit_event()
            .withf(|event| event.session_id == "s1" && event.timestamp.is_some())
            .times(2)
            .returning(|_| receipt());

        let mut tracker = EventTracker::new(Arc::new(api));
        tracker.start(&session());
        tracker.track("click", serde_json::json!({"x": 1}));
        assert_eq!(tracker.shutdown().await.delivered, 2);
    }
}
