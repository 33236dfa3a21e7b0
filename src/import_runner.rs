//! Background lead import
//!
//! `start_import` validates the caller, records a pending job and returns its
//! id immediately; a spawned task inserts rows in chunks, reporting each
//! chunk through the job record and the `ProgressHub`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::AuthProvider;
use crate::config::Config;
use crate::db::models::NewLeadInput;
use crate::error::{LeadError, LeadResult};
use crate::job_state::{BulkJobState, JobKind, JobTracker};
use crate::lead_store::{JobStore, LeadStore};
use crate::progress_hub::ProgressHub;
use crate::services::{CacheRegistry, EventBus, LeadEvent};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportRequest {
    /// Applied to rows that do not name a bucket themselves
    #[serde(default)]
    pub bucket_id: Option<String>,
    pub rows: Vec<NewLeadInput>,
}

#[derive(Clone)]
pub struct ImportRunner {
    store: Arc<dyn LeadStore>,
    jobs: Arc<dyn JobStore>,
    auth: Arc<dyn AuthProvider>,
    caches: Arc<CacheRegistry>,
    events: Arc<EventBus>,
    hub: Arc<ProgressHub>,
    chunk_size: usize,
    max_errors: usize,
}

impl ImportRunner {
    pub fn new(
        store: Arc<dyn LeadStore>,
        jobs: Arc<dyn JobStore>,
        auth: Arc<dyn AuthProvider>,
        caches: Arc<CacheRegistry>,
        events: Arc<EventBus>,
        hub: Arc<ProgressHub>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            jobs,
            auth,
            caches,
            events,
            hub,
            chunk_size: config.import_chunk_size.max(1),
            max_errors: config.max_reported_errors,
        }
    }

    /// Queue an import and return its job id
    pub async fn start_import(&self, request: ImportRequest) -> LeadResult<String> {
        let caller = self.auth.current_caller().await?;
        if !caller.role.is_admin() {
            return Err(LeadError::AuthorizationRequired(format!("{} may not import leads", caller)));
        }
        if request.rows.is_empty() {
            return Err(LeadError::InvalidInput("import contains no rows".into()));
        }

        let tracker = JobTracker::new(uuid::Uuid::new_v4().to_string(), JobKind::Import, self.max_errors);
        let job_id = tracker.job_id();
        self.jobs
            .create_job(&tracker.snapshot(), request.bucket_id.as_deref(), Some(&caller.user_id))
            .await?;
        self.hub.publish(&tracker.snapshot()).await;
        info!(job_id = %job_id, rows = request.rows.len(), user_id = %caller.user_id, "Import queued");

        let runner = self.clone();
        tokio::spawn(async move { runner.run(tracker, request).await });
        Ok(job_id)
    }

    async fn run(&self, tracker: JobTracker, request: ImportRequest) {
        let job_id = tracker.job_id();
        let state = match self.process(&tracker, request).await {
            Ok(state) => state,
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Import aborted");
                if let Err(e) = tracker.fail(e.to_string()) {
                    warn!(job_id = %job_id, error = %e, "Import job already finished");
                }
                tracker.snapshot()
            }
        };
        self.report(&state).await;
        info!(job_id = %job_id, status = %state.status, summary = %state.summary(), "Import finished");
    }

    async fn process(&self, tracker: &JobTracker, request: ImportRequest) -> LeadResult<BulkJobState> {
        let ImportRequest { bucket_id, mut rows } = request;
        if let Some(bucket_id) = &bucket_id {
            for row in rows.iter_mut().filter(|r| r.bucket_id.is_none()) {
                row.bucket_id = Some(bucket_id.clone());
            }
        }

        tracker.start(rows.len() as u64)?;
        self.report(&tracker.snapshot()).await;

        let mut inserted = 0u64;
        for (chunk_no, chunk) in rows.chunks(self.chunk_size).enumerate() {
            let base = chunk_no * self.chunk_size;
            match self.store.insert_leads(chunk.to_vec()).await {
                Ok(outcome) => {
                    inserted += outcome.inserted.len() as u64;
                    tracker.record_success(outcome.inserted.len() as u64)?;
                    for failure in outcome.errors {
                        tracker.record_failure(format!("row {}", base + failure.index + 1), &failure.message)?;
                    }
                }
                Err(e) => {
                    warn!(job_id = %tracker.job_id(), chunk = chunk_no, error = %e, "Import chunk failed");
                    let refs = (0..chunk.len()).map(|i| format!("row {}", base + i + 1));
                    tracker.record_failures(refs, &e.to_string())?;
                }
            }
            self.report(&tracker.snapshot()).await;
        }

        if inserted > 0 {
            self.caches.invalidate_all("lead import");
        }
        let summary = tracker.snapshot().summary();
        tracker.complete(Some(summary))?;

        let state = tracker.snapshot();
        self.events.emit(LeadEvent::LeadsImported {
            job_id: state.job_id.clone(),
            inserted: state.success_count,
            failed: state.failed_count,
        });
        Ok(state)
    }

    async fn report(&self, state: &BulkJobState) {
        if let Err(e) = self.jobs.update_job(state).await {
            warn!(job_id = %state.job_id, error = %e, "Failed to persist import progress");
        }
        self.hub.publish(state).await;
    }
}
