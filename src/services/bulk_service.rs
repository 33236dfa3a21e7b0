//! Bulk mutation coordinator
//!
//! Resolves a selection to concrete ids at mutation time, then assigns or
//! deletes them in sequential partitions/batches. Partial failures are
//! accumulated in the job state; the job only fails outright when nothing
//! could be attempted. Caches are invalidated once per operation.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::cache::CacheRegistry;
use super::events::{EventBus, LeadEvent};
use crate::auth::AuthProvider;
use crate::config::Config;
use crate::db::scope::{CallerIdentity, RowScope};
use crate::error::{LeadError, LeadResult};
use crate::filters::CommittedFilters;
use crate::job_state::{BulkJobState, JobKind, JobTracker};
use crate::lead_store::{JobStore, LeadStore};
use crate::progress_hub::ProgressHub;

const NOT_VISIBLE: &str = "lead not found or not visible to caller";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignTarget {
    pub user_id: String,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionMode {
    /// Each target takes its own `count`, in order
    Explicit,
    /// Resolved ids split evenly; earlier targets take the remainder
    Equal,
}

/// Which leads a bulk operation applies to
#[derive(Debug, Clone)]
pub enum Selection {
    Ids(Vec<String>),
    /// The newest `count` rows matching the committed filters
    Filter { criteria: CommittedFilters, count: u32 },
}

#[derive(Debug, Clone)]
pub struct BulkAssignRequest {
    pub targets: Vec<AssignTarget>,
    pub selection: Selection,
    pub mode: DistributionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkAssignResult {
    pub job: BulkJobState,
    /// Rows actually assigned per target
    pub distribution: Vec<AssignTarget>,
}

#[derive(Debug, Clone)]
pub struct BulkDeleteRequest {
    pub selection: Selection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkDeleteResult {
    pub deleted_count: u64,
    pub job: BulkJobState,
}

/// Limits for bulk resolution and batching
#[derive(Debug, Clone, Copy)]
pub struct BulkLimits {
    pub id_ceiling: u32,
    pub delete_batch_size: usize,
    pub server_side_threshold: usize,
    pub max_reported_errors: usize,
}

impl BulkLimits {
    pub fn from_config(config: &Config) -> Self {
        Self {
            id_ceiling: config.bulk_id_ceiling.max(1),
            delete_batch_size: config.delete_batch_size.max(1),
            server_side_threshold: config.server_side_delete_threshold,
            max_reported_errors: config.max_reported_errors,
        }
    }
}

impl Default for BulkLimits {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// `floor(n/k)` each, plus one for the first `n mod k` targets
pub fn equal_distribution(total: usize, targets: usize) -> Vec<usize> {
    if targets == 0 {
        return Vec::new();
    }
    let base = total / targets;
    let extra = total % targets;
    (0..targets).map(|i| base + usize::from(i < extra)).collect()
}

/// Ids the selection resolved to, plus requested ids that did not resolve
struct Resolution {
    ids: Vec<String>,
    missing: Vec<String>,
}

impl Resolution {
    /// Distinct ids the selection named, found or not
    fn requested(&self) -> usize {
        self.ids.len() + self.missing.len()
    }
}

pub struct BulkService {
    store: Arc<dyn LeadStore>,
    jobs: Arc<dyn JobStore>,
    auth: Arc<dyn AuthProvider>,
    caches: Arc<CacheRegistry>,
    events: Arc<EventBus>,
    hub: Arc<ProgressHub>,
    limits: BulkLimits,
}

impl BulkService {
    pub fn new(
        store: Arc<dyn LeadStore>,
        jobs: Arc<dyn JobStore>,
        auth: Arc<dyn AuthProvider>,
        caches: Arc<CacheRegistry>,
        events: Arc<EventBus>,
        hub: Arc<ProgressHub>,
        limits: BulkLimits,
    ) -> Self {
        Self {
            store,
            jobs,
            auth,
            caches,
            events,
            hub,
            limits,
        }
    }

    pub async fn bulk_assign(&self, request: BulkAssignRequest) -> LeadResult<BulkAssignResult> {
        let tracker = self.begin(JobKind::Assign).await;
        let job_id = tracker.job_id();

        let scope = self.authorize(&tracker).await?;
        if let Err(e) = self.validate_targets(&request.targets).await {
            return Err(self.abort(&tracker, e).await);
        }

        let wanted = match request.mode {
            DistributionMode::Equal => None,
            DistributionMode::Explicit => Some(request.targets.iter().map(|t| u64::from(t.count)).sum::<u64>()),
        };
        let resolution = self.resolve(&tracker, &request.selection, &scope, wanted).await?;

        let sizes = match request.mode {
            DistributionMode::Equal => equal_distribution(resolution.ids.len(), request.targets.len()),
            DistributionMode::Explicit => {
                let mut remaining = resolution.ids.len();
                request
                    .targets
                    .iter()
                    .map(|t| {
                        let take = (t.count as usize).min(remaining);
                        remaining -= take;
                        take
                    })
                    .collect()
            }
        };
        let planned: usize = sizes.iter().sum();
        self.start(&tracker, planned, &resolution.missing).await?;

        let mut distribution = Vec::with_capacity(request.targets.len());
        let mut mutated = 0u64;
        let mut offset = 0;
        for (target, size) in request.targets.iter().zip(sizes) {
            let slice = &resolution.ids[offset..offset + size];
            offset += size;
            if slice.is_empty() {
                distribution.push(AssignTarget {
                    user_id: target.user_id.clone(),
                    count: 0,
                });
                continue;
            }

            let assigned = match self.store.assign_ids(slice, &target.user_id).await {
                Ok(updated) => {
                    let updated = updated.min(slice.len() as u64);
                    tracker.record_success(updated)?;
                    let vanished = slice.len() as u64 - updated;
                    if vanished > 0 {
                        tracker.record_failed_batch(
                            format!("assign:{}", target.user_id),
                            vanished,
                            "rows removed before assignment",
                        )?;
                    }
                    updated
                }
                Err(e) => {
                    warn!(job_id = %job_id, user_id = %target.user_id, error = %e, "Assignment partition failed");
                    tracker.record_failures(slice.iter().cloned(), &e.to_string())?;
                    0
                }
            };
            self.publish(&tracker).await;

            if assigned > 0 {
                self.events.emit(LeadEvent::LeadsAssigned {
                    job_id: job_id.clone(),
                    user_id: target.user_id.clone(),
                    count: assigned,
                });
            }
            mutated += assigned;
            distribution.push(AssignTarget {
                user_id: target.user_id.clone(),
                count: assigned as u32,
            });
        }

        let job = self.finish(&tracker, mutated, "bulk assign").await?;
        info!(job_id = %job_id, summary = %job.summary(), "Bulk assign finished");
        Ok(BulkAssignResult { job, distribution })
    }

    pub async fn bulk_delete(&self, request: BulkDeleteRequest) -> LeadResult<BulkDeleteResult> {
        let tracker = self.begin(JobKind::Delete).await;
        let job_id = tracker.job_id();

        let scope = self.authorize(&tracker).await?;
        let resolution = self.resolve(&tracker, &request.selection, &scope, None).await?;
        let server_side = matches!(request.selection, Selection::Ids(_))
            && resolution.requested() > self.limits.server_side_threshold;
        self.start(&tracker, resolution.ids.len(), &resolution.missing).await?;

        let mut deleted_count = 0u64;
        if server_side {
            debug!(job_id = %job_id, ids = resolution.ids.len(), "Using server-side bulk delete");
            match self.store.delete_ids_bulk(&resolution.ids).await {
                Ok(_) => {
                    deleted_count = resolution.ids.len() as u64;
                    tracker.record_success(deleted_count)?;
                }
                Err(e) => {
                    warn!(job_id = %job_id, error = %e, "Server-side bulk delete failed");
                    tracker.record_failures(resolution.ids.iter().cloned(), &e.to_string())?;
                }
            }
            self.publish(&tracker).await;
        } else {
            for (batch_no, batch) in resolution.ids.chunks(self.limits.delete_batch_size).enumerate() {
                match self.store.delete_ids(batch).await {
                    Ok(_) => {
                        deleted_count += batch.len() as u64;
                        tracker.record_success(batch.len() as u64)?;
                    }
                    Err(e) => {
                        warn!(job_id = %job_id, batch = batch_no, error = %e, "Delete batch failed");
                        tracker.record_failures(batch.iter().cloned(), &e.to_string())?;
                    }
                }
                self.publish(&tracker).await;
            }
        }

        if deleted_count > 0 {
            self.events.emit(LeadEvent::LeadsDeleted {
                job_id: job_id.clone(),
                count: deleted_count,
            });
        }
        let job = self.finish(&tracker, deleted_count, "bulk delete").await?;
        info!(job_id = %job_id, deleted_count, summary = %job.summary(), "Bulk delete finished");
        Ok(BulkDeleteResult { deleted_count, job })
    }

    /// New pending job, persisted and announced
    async fn begin(&self, kind: JobKind) -> JobTracker {
        let tracker = JobTracker::new(uuid::Uuid::new_v4().to_string(), kind, self.limits.max_reported_errors);
        let state = tracker.snapshot();
        if let Err(e) = self.jobs.create_job(&state, None, None).await {
            warn!(job_id = %state.job_id, error = %e, "Failed to persist job record");
        }
        self.hub.publish(&state).await;
        tracker
    }

    async fn authorize(&self, tracker: &JobTracker) -> LeadResult<RowScope> {
        let caller: CallerIdentity = match self.auth.current_caller().await {
            Ok(caller) => caller,
            Err(e) => return Err(self.abort(tracker, e).await),
        };
        if !caller.role.is_admin() {
            let e = LeadError::AuthorizationRequired(format!("{} may not run bulk operations", caller));
            return Err(self.abort(tracker, e).await);
        }
        Ok(caller.scope())
    }

    async fn validate_targets(&self, targets: &[AssignTarget]) -> LeadResult<()> {
        if targets.is_empty() {
            return Err(LeadError::InvalidInput("at least one assignment target is required".into()));
        }
        for target in targets {
            let known = self
                .store
                .user_exists(&target.user_id)
                .await
                .map_err(|e| LeadError::MutationFailed(e.to_string()))?;
            if !known {
                return Err(LeadError::InvalidInput(format!("unknown user {}", target.user_id)));
            }
        }
        Ok(())
    }

    /// Fresh id resolution, bounded by the selection count and the ceiling
    async fn resolve(
        &self,
        tracker: &JobTracker,
        selection: &Selection,
        scope: &RowScope,
        wanted: Option<u64>,
    ) -> LeadResult<Resolution> {
        let ceiling = u64::from(self.limits.id_ceiling);
        let result = match selection {
            Selection::Filter { criteria, count } => {
                let limit = wanted.unwrap_or(u64::MAX).min(u64::from(*count)).min(ceiling) as u32;
                self.store
                    .resolve_ids(criteria, scope, limit)
                    .await
                    .map(|ids| Resolution { ids, missing: Vec::new() })
            }
            Selection::Ids(requested) => {
                let mut seen = HashSet::new();
                let requested: Vec<String> = requested.iter().filter(|id| seen.insert(id.as_str())).cloned().collect();
                if requested.len() as u64 > ceiling {
                    let e = LeadError::InvalidInput(format!(
                        "selection of {} ids exceeds the limit of {}",
                        requested.len(),
                        ceiling
                    ));
                    return Err(self.abort(tracker, e).await);
                }
                self.store.resolve_explicit_ids(&requested, scope).await.map(|mut ids| {
                    let found: HashSet<&str> = ids.iter().map(String::as_str).collect();
                    let missing = requested.iter().filter(|id| !found.contains(id.as_str())).cloned().collect();
                    if let Some(wanted) = wanted {
                        ids.truncate(wanted.min(ceiling) as usize);
                    }
                    Resolution { ids, missing }
                })
            }
        };

        let resolution = match result {
            Ok(resolution) => resolution,
            Err(e) => return Err(self.abort(tracker, LeadError::MutationFailed(e.to_string())).await),
        };
        if resolution.ids.is_empty() {
            let e = LeadError::MutationFailed("no leads matched the selection".into());
            return Err(self.abort(tracker, e).await);
        }
        debug!(job_id = %tracker.job_id(), resolved = resolution.ids.len(), missing = resolution.missing.len(), "Resolved bulk selection");
        Ok(resolution)
    }

    async fn start(&self, tracker: &JobTracker, planned: usize, missing: &[String]) -> LeadResult<()> {
        tracker.start((planned + missing.len()) as u64)?;
        if !missing.is_empty() {
            tracker.record_failures(missing.iter().cloned(), NOT_VISIBLE)?;
        }
        self.publish(tracker).await;
        Ok(())
    }

    /// Complete the job and invalidate caches once if anything changed
    async fn finish(&self, tracker: &JobTracker, mutated: u64, reason: &str) -> LeadResult<BulkJobState> {
        if mutated > 0 {
            self.caches.invalidate_all(reason);
        }
        let summary = tracker.snapshot().summary();
        tracker.complete(Some(summary))?;
        self.publish(tracker).await;
        Ok(tracker.snapshot())
    }

    /// Mark the job failed and hand back the error for the caller
    async fn abort(&self, tracker: &JobTracker, error: LeadError) -> LeadError {
        warn!(job_id = %tracker.job_id(), error = %error, "Bulk operation failed");
        if let Err(e) = tracker.fail(error.to_string()) {
            debug!(error = %e, "Job already terminal");
        }
        self.publish(tracker).await;
        error
    }

    async fn publish(&self, tracker: &JobTracker) {
        let state = tracker.snapshot();
        self.hub.publish(&state).await;
        if let Err(e) = self.jobs.update_job(&state).await {
            warn!(job_id = %state.job_id, error = %e, "Failed to persist job progress");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_distribution_remainder_goes_first() {
        assert_eq!(equal_distribution(10, 2), vec![5, 5]);
        assert_eq!(equal_distribution(11, 2), vec![6, 5]);
        assert_eq!(equal_distribution(7, 3), vec![3, 2, 2]);
        assert_eq!(equal_distribution(2, 3), vec![1, 1, 0]);
        assert!(equal_distribution(5, 0).is_empty());
    }

    #[test]
    fn test_equal_distribution_sums_to_total() {
        for total in 0..40 {
            for targets in 1..7 {
                let sizes = equal_distribution(total, targets);
                assert_eq!(sizes.iter().sum::<usize>(), total);
                let max = sizes.iter().max().unwrap();
                let min = sizes.iter().min().unwrap();
                assert!(max - min <= 1);
            }
        }
    }
}
