//! Job progress reporter
//!
//! Watches one job over two channels at once: the `ProgressHub` push stream
//! and a periodic `JobStore` poll. Whichever arrives first wins; stale
//! updates (lower `processed`) are dropped and the terminal state is
//! delivered exactly once, after which both channels are torn down.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::job_state::BulkJobState;
use crate::lead_store::JobStore;
use crate::progress_hub::ProgressHub;

pub struct JobProgressReporter {
    hub: Arc<ProgressHub>,
    jobs: Arc<dyn JobStore>,
    poll_interval: Duration,
}

/// Running subscription; dropping it cancels delivery
pub struct JobSubscription {
    job_id: String,
    handle: Option<JoinHandle<()>>,
}

impl JobSubscription {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Whether the terminal state has been delivered (or the task cancelled)
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn unsubscribe(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Wait until the terminal state has been delivered
    pub async fn finished(mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    warn!(job_id = %self.job_id, error = %e, "Progress subscription task panicked");
                }
            }
        }
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Delivery filter shared by both channels
struct UpdateGate {
    last: Option<BulkJobState>,
}

impl UpdateGate {
    /// Deliver `state` if it is new and not stale; true once terminal
    fn offer<F>(&mut self, state: BulkJobState, on_update: &mut F) -> bool
    where
        F: FnMut(BulkJobState),
    {
        if let Some(last) = &self.last {
            if state.processed < last.processed || *last == state {
                return false;
            }
        }
        let terminal = state.is_terminal();
        self.last = Some(state.clone());
        on_update(state);
        terminal
    }
}

impl JobProgressReporter {
    pub fn new(hub: Arc<ProgressHub>, jobs: Arc<dyn JobStore>, poll_interval: Duration) -> Self {
        Self {
            hub,
            jobs,
            poll_interval,
        }
    }

    /// Deliver every progress change of `job_id` to `on_update` until it
    /// finishes. There is no deadline; callers cancel by dropping the
    /// subscription.
    pub fn subscribe<F>(&self, job_id: &str, mut on_update: F) -> JobSubscription
    where
        F: FnMut(BulkJobState) + Send + 'static,
    {
        let hub = Arc::clone(&self.hub);
        let jobs = Arc::clone(&self.jobs);
        let poll_interval = self.poll_interval;
        let id = job_id.to_string();
        // Subscribe before the first poll so nothing published in between is missed
        let mut push = hub.subscribe();

        let handle = tokio::spawn(async move {
            let mut gate = UpdateGate { last: None };
            if let Some(state) = hub.get_job(&id).await {
                if gate.offer(state, &mut on_update) {
                    return;
                }
            }

            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut push_open = true;

            loop {
                tokio::select! {
                    message = push.recv(), if push_open => match message {
                        Ok(message) => {
                            if message.job().job_id == id && gate.offer(message.into_job(), &mut on_update) {
                                break;
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(job_id = %id, skipped, "Progress push lagged, relying on poll");
                        }
                        Err(RecvError::Closed) => {
                            debug!(job_id = %id, "Progress push closed, polling only");
                            push_open = false;
                        }
                    },
                    _ = ticker.tick() => match jobs.get_job(&id).await {
                        Ok(Some(state)) => {
                            if gate.offer(state, &mut on_update) {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!(job_id = %id, error = %e, "Job status poll failed"),
                    },
                }
            }
            debug!(job_id = %id, "Job finished, progress subscription closed");
        });

        JobSubscription {
            job_id: job_id.to_string(),
            handle: Some(handle),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_state::{JobKind, JobStatus};

    fn state(processed: u64, status: JobStatus) -> BulkJobState {
        let mut s = BulkJobState::new("job-1", JobKind::Delete);
        s.total = 10;
        s.processed = processed;
        s.success_count = processed;
        s.status = status;
        s
    }

    #[test]
    fn test_gate_drops_stale_and_duplicate_updates() {
        let mut gate = UpdateGate { last: None };
        let mut seen = Vec::new();
        let mut record = |s: BulkJobState| seen.push(s.processed);

        assert!(!gate.offer(state(5, JobStatus::Processing), &mut record));
        assert!(!gate.offer(state(3, JobStatus::Processing), &mut record));
        assert!(!gate.offer(state(5, JobStatus::Processing), &mut record));
        assert!(gate.offer(state(10, JobStatus::Completed), &mut record));

        assert_eq!(seen, vec![5, 10]);
    }
}
