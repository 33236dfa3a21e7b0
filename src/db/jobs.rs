//! Persisted job progress records

use diesel::prelude::*;

use super::diesel_schema::import_jobs;
use super::models::{current_timestamp, ImportJobChanges, ImportJobRow, NewImportJob};
use crate::error::LeadError;
use crate::job_state::{BulkJobState, JobError};

impl TryFrom<ImportJobRow> for BulkJobState {
    type Error = LeadError;

    fn try_from(row: ImportJobRow) -> Result<Self, Self::Error> {
        let errors: Vec<JobError> = serde_json::from_str(&row.errors_json)?;
        Ok(BulkJobState {
            job_id: row.id,
            kind: row.job_type.parse()?,
            status: row.status.parse()?,
            total: row.total.max(0) as u64,
            processed: row.processed.max(0) as u64,
            success_count: row.success_count.max(0) as u64,
            failed_count: row.failed_count.max(0) as u64,
            errors,
            omitted_errors: row.omitted_errors.max(0) as u64,
            message: row.message,
        })
    }
}

pub fn create_job(
    conn: &mut SqliteConnection,
    state: &BulkJobState,
    bucket_id: Option<&str>,
    created_by: Option<&str>,
) -> Result<(), LeadError> {
    let now = current_timestamp();
    diesel::insert_into(import_jobs::table)
        .values(&NewImportJob {
            id: &state.job_id,
            job_type: state.kind.as_str(),
            status: state.status.as_str(),
            total: state.total as i64,
            bucket_id,
            created_by,
            created_at: &now,
            updated_at: &now,
        })
        .execute(conn)
        .map_err(|e| LeadError::from_diesel("Failed to create job", e))?;
    Ok(())
}

pub fn update_job(conn: &mut SqliteConnection, state: &BulkJobState) -> Result<(), LeadError> {
    let errors_json = serde_json::to_string(&state.errors)?;
    let now = current_timestamp();
    let updated = diesel::update(import_jobs::table.filter(import_jobs::id.eq(&state.job_id)))
        .set(&ImportJobChanges {
            status: state.status.as_str(),
            total: state.total as i64,
            processed: state.processed as i64,
            success_count: state.success_count as i64,
            failed_count: state.failed_count as i64,
            errors_json: &errors_json,
            omitted_errors: state.omitted_errors as i64,
            message: state.message.as_deref(),
            updated_at: &now,
        })
        .execute(conn)
        .map_err(|e| LeadError::from_diesel("Failed to update job", e))?;

    if updated == 0 {
        return Err(LeadError::NotFound(format!("job {}", state.job_id)));
    }
    Ok(())
}

pub fn get_job(conn: &mut SqliteConnection, id: &str) -> Result<Option<BulkJobState>, LeadError> {
    import_jobs::table
        .filter(import_jobs::id.eq(id))
        .select(ImportJobRow::as_select())
        .first(conn)
        .optional()
        .map_err(|e| LeadError::from_diesel("Job lookup failed", e))?
        .map(BulkJobState::try_from)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LeadDb;
    use crate::job_state::{JobKind, JobStatus, JobTracker};

    #[test]
    fn test_job_record_round_trip() {
        let db = LeadDb::open_in_memory().unwrap();
        db.with_conn(|conn| {
            let tracker = JobTracker::new("job-1", JobKind::Import, 100);
            create_job(conn, &tracker.snapshot(), None, Some("admin"))?;

            tracker.start(2).unwrap();
            tracker.record_success(1).unwrap();
            tracker.record_failure("row 2", "name is required").unwrap();
            tracker.complete(Some("done".into())).unwrap();
            update_job(conn, &tracker.snapshot())?;

            let stored = get_job(conn, "job-1")?.unwrap();
            assert_eq!(stored, tracker.snapshot());
            assert_eq!(stored.status, JobStatus::Completed);
            assert!(get_job(conn, "job-2")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_update_missing_job_is_not_found() {
        let db = LeadDb::open_in_memory().unwrap();
        let state = BulkJobState::new("ghost", JobKind::Delete);
        let err = db.with_conn(|conn| update_job(conn, &state)).unwrap_err();
        assert!(matches!(err, LeadError::NotFound(_)));
    }
}
