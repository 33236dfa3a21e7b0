//! Global progress aggregator for bulk jobs
//!
//! Collects state snapshots from every running import, assign and delete
//! job and broadcasts them to subscribers.
//!
//! ## Architecture
//!
//! ```text
//! ImportRunner / BulkService (JobTracker snapshots)
//!     │
//!     └─► ProgressHub (global broadcast)
//!              │
//!              └─► JobProgressReporter (filters to one job)
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::job_state::{BulkJobState, JobStatus};

/// Configuration for the progress hub
#[derive(Debug, Clone)]
pub struct ProgressHubConfig {
    /// How long to retain finished job states (default: 5 minutes)
    pub job_retention: Duration,
    /// Broadcast channel capacity (default: 256)
    pub channel_capacity: usize,
    /// How often expired jobs are swept (default: 60s)
    pub cleanup_interval: Duration,
}

impl Default for ProgressHubConfig {
    fn default() -> Self {
        Self {
            job_retention: Duration::from_secs(300),
            channel_capacity: 256,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

/// Broadcast message types
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressMessage {
    Progress { job: BulkJobState, elapsed_ms: u64 },
    Complete { job: BulkJobState, elapsed_ms: u64 },
    Error { job: BulkJobState },
}

impl ProgressMessage {
    fn for_state(job: BulkJobState, elapsed_ms: u64) -> Self {
        match job.status {
            JobStatus::Completed => ProgressMessage::Complete { job, elapsed_ms },
            JobStatus::Failed => ProgressMessage::Error { job },
            JobStatus::Pending | JobStatus::Processing => ProgressMessage::Progress { job, elapsed_ms },
        }
    }

    pub fn job(&self) -> &BulkJobState {
        match self {
            ProgressMessage::Progress { job, .. }
            | ProgressMessage::Complete { job, .. }
            | ProgressMessage::Error { job } => job,
        }
    }

    pub fn into_job(self) -> BulkJobState {
        match self {
            ProgressMessage::Progress { job, .. }
            | ProgressMessage::Complete { job, .. }
            | ProgressMessage::Error { job } => job,
        }
    }
}

struct TrackedJob {
    state: BulkJobState,
    started_at: Instant,
    completed_at: Option<Instant>,
}

/// Global progress hub for bulk jobs
pub struct ProgressHub {
    progress_tx: broadcast::Sender<ProgressMessage>,
    jobs: Arc<RwLock<HashMap<String, TrackedJob>>>,
    cleanup: JoinHandle<()>,
}

impl ProgressHub {
    /// Create a hub and start its cleanup task; needs a running runtime
    pub fn new(config: ProgressHubConfig) -> Self {
        let (progress_tx, _) = broadcast::channel(config.channel_capacity);
        let jobs = Arc::new(RwLock::new(HashMap::new()));
        let cleanup = Self::start_cleanup_task(Arc::clone(&jobs), &config);

        info!("ProgressHub initialized");
        Self {
            progress_tx,
            jobs,
            cleanup,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressMessage> {
        self.progress_tx.subscribe()
    }

    /// Latest known state of a tracked job
    pub async fn get_job(&self, job_id: &str) -> Option<BulkJobState> {
        self.jobs.read().await.get(job_id).map(|j| j.state.clone())
    }

    pub async fn tracked_jobs(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Record the newest snapshot of a job and broadcast it
    pub async fn publish(&self, state: &BulkJobState) {
        let message = {
            let mut jobs = self.jobs.write().await;
            let tracked = jobs.entry(state.job_id.clone()).or_insert_with(|| TrackedJob {
                state: state.clone(),
                started_at: Instant::now(),
                completed_at: None,
            });
            tracked.state = state.clone();
            if state.is_terminal() && tracked.completed_at.is_none() {
                tracked.completed_at = Some(Instant::now());
            }
            let elapsed_ms = tracked.started_at.elapsed().as_millis() as u64;
            ProgressMessage::for_state(state.clone(), elapsed_ms)
        };

        debug!(
            job_id = %state.job_id,
            status = %state.status,
            processed = state.processed,
            total = state.total,
            "Job progress"
        );
        // No subscribers is fine
        let _ = self.progress_tx.send(message);
    }

    fn start_cleanup_task(jobs: Arc<RwLock<HashMap<String, TrackedJob>>>, config: &ProgressHubConfig) -> JoinHandle<()> {
        let retention = config.job_retention;
        let every = config.cleanup_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;

                let mut jobs = jobs.write().await;
                let before = jobs.len();
                jobs.retain(|_, job| match job.completed_at {
                    Some(completed) => completed.elapsed() < retention,
                    None => true,
                });

                let removed = before - jobs.len();
                if removed > 0 {
                    debug!(removed, "Cleaned up expired jobs from ProgressHub");
                }
            }
        })
    }
}

impl Drop for ProgressHub {
    fn drop(&mut self) {
        self.cleanup.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_state::JobKind;

    #[tokio::test]
    async fn test_publish_tracks_and_broadcasts() {
        let hub = ProgressHub::new(ProgressHubConfig::default());
        let mut rx = hub.subscribe();

        let mut state = BulkJobState::new("job-1", JobKind::Delete);
        state.status = JobStatus::Processing;
        state.total = 100;
        state.processed = 50;
        hub.publish(&state).await;

        assert_eq!(hub.get_job("job-1").await.unwrap().processed, 50);
        let message = rx.recv().await.unwrap();
        assert!(matches!(message, ProgressMessage::Progress { .. }));
        assert_eq!(message.job().job_id, "job-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_jobs_expire() {
        let hub = ProgressHub::new(ProgressHubConfig {
            job_retention: Duration::from_secs(10),
            channel_capacity: 16,
            cleanup_interval: Duration::from_secs(1),
        });

        let mut done = BulkJobState::new("done", JobKind::Import);
        done.status = JobStatus::Completed;
        hub.publish(&done).await;
        let mut running = BulkJobState::new("running", JobKind::Import);
        running.status = JobStatus::Processing;
        hub.publish(&running).await;
        assert_eq!(hub.tracked_jobs().await, 2);

        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(hub.get_job("done").await.is_none());
        assert!(hub.get_job("running").await.is_some());
        assert_eq!(hub.tracked_jobs().await, 1);
    }

    #[test]
    fn test_progress_message_serialization() {
        let message = ProgressMessage::for_state(BulkJobState::new("job-1", JobKind::Assign), 20);
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"type\":\"progress\""));
        assert!(json.contains("\"job_id\":\"job-1\""));
    }
}
