//! # Engine Event Bus
//!
//! Correlated structured events published on every observed transition.
//! Subscribers attach through a broadcast channel and consume on their own
//! tasks, so a slow or faulty consumer can never stall the orchestrator; a
//! lagging subscriber drops events instead of applying backpressure.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default bus capacity before the slowest subscriber starts lagging
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

/// One correlated engine event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    /// Owning job
    pub job_id: String,

    /// Target involved, when the event is target-scoped
    pub target_id: Option<String>,

    /// Event kind tag (see [`crate::model::kind`])
    pub kind: String,

    /// State before the transition, when applicable
    pub from_state: Option<String>,

    /// State after the transition, when applicable
    pub to_state: Option<String>,

    /// Duration of the operation that triggered the event, in milliseconds
    pub duration_ms: Option<u64>,

    /// Stable error code, when the event records a failure
    pub error_code: Option<String>,

    /// Emission timestamp (UTC)
    pub timestamp: DateTime<Utc>,
}

impl EngineEvent {
    /// Create a job-scoped transition event
    pub fn job_transition(job_id: &str, kind: &str, from: &str, to: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            target_id: None,
            kind: kind.to_string(),
            from_state: Some(from.to_string()),
            to_state: Some(to.to_string()),
            duration_ms: None,
            error_code: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a target-scoped transition event
    pub fn target_transition(
        job_id: &str,
        target_id: &str,
        kind: &str,
        from: &str,
        to: &str,
    ) -> Self {
        Self {
            job_id: job_id.to_string(),
            target_id: Some(target_id.to_string()),
            kind: kind.to_string(),
            from_state: Some(from.to_string()),
            to_state: Some(to.to_string()),
            duration_ms: None,
            error_code: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach an operation duration
    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as u64);
        self
    }

    /// Attach a stable error code
    pub fn with_error_code(mut self, code: impl Into<String>) -> Self {
        self.error_code = Some(code.into());
        self
    }
}

/// Broadcast fan-out of engine events
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus with the given buffered capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; succeeds even with zero subscribers
    pub fn publish(&self, event: EngineEvent) {
        // A send error only means nobody is listening right now
        let _ = self.sender.send(event);
    }

    /// Attach a new subscriber
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::kind;

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::default();
        let mut receiver = bus.subscribe();

        bus.publish(EngineEvent::job_transition(
            "job-1",
            kind::JOB_STATE_CHANGED,
            "queued",
            "in_progress",
        ));

        let event = receiver.recv().await.unwrap();
        assert_eq!(event.job_id, "job-1");
        assert_eq!(event.from_state.as_deref(), Some("queued"));
        assert_eq!(event.to_state.as_deref(), Some("in_progress"));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let bus = EventBus::new(4);
        bus.publish(EngineEvent::job_transition(
            "job-1",
            kind::JOB_STATE_CHANGED,
            "discovered",
            "queued",
        ));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_slow_subscriber_lags_instead_of_blocking() {
        let bus = EventBus::new(2);
        let mut receiver = bus.subscribe();

        for i in 0..10 {
            bus.publish(
                EngineEvent::job_transition("job-1", kind::JOB_STATE_CHANGED, "a", "b")
                    .with_duration(std::time::Duration::from_millis(i)),
            );
        }

        // The oldest events were dropped; the receiver reports the lag
        match receiver.recv().await {
            Err(broadcast::error::RecvError::Lagged(skipped)) => assert!(skipped > 0),
            other => panic!("expected lag, got {:?}", other),
        }
    }
}
