//! Bulk job state machine
//!
//! `pending -> processing -> {completed | failed}`. Counters only grow and a
//! terminal state rejects every further transition. `JobTracker` publishes
//! each accepted transition on a `watch` channel.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::LeadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = LeadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(LeadError::InvalidInput(format!("unknown job status: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Import,
    Assign,
    Delete,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Import => "import",
            JobKind::Assign => "assign",
            JobKind::Delete => "delete",
        }
    }
}

impl FromStr for JobKind {
    type Err = LeadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "import" => Ok(JobKind::Import),
            "assign" => Ok(JobKind::Assign),
            "delete" => Ok(JobKind::Delete),
            other => Err(LeadError::InvalidInput(format!("unknown job type: {}", other))),
        }
    }
}

/// One failed row (or batch) in a job report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub row_ref: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkJobState {
    pub job_id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    pub total: u64,
    pub processed: u64,
    pub success_count: u64,
    pub failed_count: u64,
    pub errors: Vec<JobError>,
    /// Failures beyond the reported cap
    pub omitted_errors: u64,
    pub message: Option<String>,
}

impl BulkJobState {
    pub fn new(job_id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            status: JobStatus::Pending,
            total: 0,
            processed: 0,
            success_count: 0,
            failed_count: 0,
            errors: Vec::new(),
            omitted_errors: 0,
            message: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// "X succeeded, Y failed"
    pub fn summary(&self) -> String {
        format!("{} succeeded, {} failed", self.success_count, self.failed_count)
    }

    /// Reported errors as lines, with a "+N more" tail when capped
    pub fn error_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.row_ref, e.message))
            .collect();
        if self.omitted_errors > 0 {
            lines.push(format!("+{} more", self.omitted_errors));
        }
        lines
    }
}

/// Owner of one job's state; every accepted change is published
pub struct JobTracker {
    tx: watch::Sender<BulkJobState>,
    max_errors: usize,
}

impl JobTracker {
    pub fn new(job_id: impl Into<String>, kind: JobKind, max_errors: usize) -> Self {
        let (tx, _) = watch::channel(BulkJobState::new(job_id, kind));
        Self { tx, max_errors }
    }

    pub fn job_id(&self) -> String {
        self.tx.borrow().job_id.clone()
    }

    pub fn snapshot(&self) -> BulkJobState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<BulkJobState> {
        self.tx.subscribe()
    }

    fn apply<F>(&self, f: F) -> Result<(), LeadError>
    where
        F: FnOnce(&mut BulkJobState) -> Result<(), LeadError>,
    {
        let mut outcome = Ok(());
        self.tx.send_if_modified(|state| {
            if state.is_terminal() {
                outcome = Err(LeadError::InvalidInput(format!(
                    "job {} is already {}",
                    state.job_id, state.status
                )));
                return false;
            }
            match f(state) {
                Ok(()) => true,
                Err(e) => {
                    outcome = Err(e);
                    false
                }
            }
        });
        outcome
    }

    /// pending -> processing with a known total
    pub fn start(&self, total: u64) -> Result<(), LeadError> {
        self.apply(|state| {
            if state.status != JobStatus::Pending {
                return Err(LeadError::InvalidInput(format!(
                    "job {} already started",
                    state.job_id
                )));
            }
            state.status = JobStatus::Processing;
            state.total = total;
            Ok(())
        })
    }

    fn check_room(state: &BulkJobState, n: u64) -> Result<(), LeadError> {
        if state.status != JobStatus::Processing {
            return Err(LeadError::InvalidInput(format!(
                "job {} is not processing",
                state.job_id
            )));
        }
        if state.processed + n > state.total {
            return Err(LeadError::InvalidInput(format!(
                "job {} would exceed its total of {}",
                state.job_id, state.total
            )));
        }
        Ok(())
    }

    pub fn record_success(&self, n: u64) -> Result<(), LeadError> {
        self.apply(|state| {
            Self::check_room(state, n)?;
            state.processed += n;
            state.success_count += n;
            Ok(())
        })
    }

    /// Record failed rows sharing one message; returns after a single publish
    pub fn record_failures<I, S>(&self, row_refs: I, message: &str) -> Result<(), LeadError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let refs: Vec<String> = row_refs.into_iter().map(Into::into).collect();
        let max_errors = self.max_errors;
        self.apply(|state| {
            let n = refs.len() as u64;
            Self::check_room(state, n)?;
            state.processed += n;
            state.failed_count += n;
            for row_ref in refs {
                if state.errors.len() < max_errors {
                    state.errors.push(JobError {
                        row_ref,
                        message: message.to_string(),
                    });
                } else {
                    state.omitted_errors += 1;
                }
            }
            Ok(())
        })
    }

    pub fn record_failure(&self, row_ref: impl Into<String>, message: &str) -> Result<(), LeadError> {
        self.record_failures([row_ref.into()], message)
    }

    /// `n` failed rows reported as one batch-level error
    pub fn record_failed_batch(&self, batch_ref: impl Into<String>, n: u64, message: &str) -> Result<(), LeadError> {
        let batch_ref = batch_ref.into();
        let max_errors = self.max_errors;
        self.apply(|state| {
            Self::check_room(state, n)?;
            state.processed += n;
            state.failed_count += n;
            if state.errors.len() < max_errors {
                state.errors.push(JobError {
                    row_ref: batch_ref,
                    message: message.to_string(),
                });
            } else {
                state.omitted_errors += 1;
            }
            Ok(())
        })
    }

    pub fn complete(&self, message: Option<String>) -> Result<(), LeadError> {
        self.apply(|state| {
            state.status = JobStatus::Completed;
            state.message = message;
            Ok(())
        })
    }

    /// Terminal failure; allowed from pending or processing
    pub fn fail(&self, message: impl Into<String>) -> Result<(), LeadError> {
        let message = message.into();
        self.apply(|state| {
            state.status = JobStatus::Failed;
            state.message = Some(message);
            Ok(())
        })
    }
}
