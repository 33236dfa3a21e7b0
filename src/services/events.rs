//! Event system for lead mutations
//!
//! Provides an event bus for notifying listeners about mutations and cache
//! invalidation. Useful for:
//! - Audit logging
//! - Refreshing dashboards after bulk actions

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

/// Events emitted by services
#[derive(Debug, Clone, PartialEq)]
pub enum LeadEvent {
    LeadsImported {
        job_id: String,
        inserted: u64,
        failed: u64,
    },
    LeadsAssigned {
        job_id: String,
        user_id: String,
        count: u64,
    },
    LeadsDeleted {
        job_id: String,
        count: u64,
    },
    /// Every count/unique/list cache was cleared
    CachesInvalidated {
        reason: String,
    },
}

/// Trait for event listeners
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &LeadEvent);
}

/// Event bus for broadcasting lead events
pub struct EventBus {
    sender: broadcast::Sender<LeadEvent>,
}

impl EventBus {
    /// Create a new event bus with default capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all subscribers
    pub fn emit(&self, event: LeadEvent) {
        trace!(event = ?event, "Emitting lead event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LeadEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Logging event listener for audit trails
pub struct LoggingEventListener;

impl EventListener for LoggingEventListener {
    fn on_event(&self, event: &LeadEvent) {
        match event {
            LeadEvent::LeadsImported { job_id, inserted, failed } => {
                info!(job_id = %job_id, inserted, failed, "Leads imported");
            }
            LeadEvent::LeadsAssigned { job_id, user_id, count } => {
                info!(job_id = %job_id, user_id = %user_id, count, "Leads assigned");
            }
            LeadEvent::LeadsDeleted { job_id, count } => {
                info!(job_id = %job_id, count, "Leads deleted");
            }
            LeadEvent::CachesInvalidated { reason } => {
                debug!(reason = %reason, "Caches invalidated");
            }
        }
    }
}

/// Spawn a background task that logs all events
pub fn spawn_logging_listener(event_bus: Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut receiver = event_bus.subscribe();
    let listener = LoggingEventListener;

    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(event) => listener.on_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "Event listener lagged, skipped events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Event bus closed, stopping listener");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_event_bus_emit_receive() {
        let bus = EventBus::new();
        let mut receiver = bus.subscribe();

        bus.emit(LeadEvent::LeadsDeleted {
            job_id: "job-1".into(),
            count: 150,
        });

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .expect("timeout")
            .expect("receive error");
        assert_eq!(
            event,
            LeadEvent::LeadsDeleted {
                job_id: "job-1".into(),
                count: 150
            }
        );
    }

    #[test]
    fn test_event_bus_no_subscribers() {
        let bus = EventBus::new();
        // Should not panic even with no subscribers
        bus.emit(LeadEvent::CachesInvalidated { reason: "test".into() });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
