//! Reconciliation store adapter over Postgres/PostGIS.
//!
//! Upsert contract: the `service_requests` table is matched on `request_id`
//! (the source-assigned external id). Sync-owned columns are `status`,
//! `priority`, `problem_code`, `description`, `prob_address`, `prob_city`,
//! `prob_zip`, `prob_add_type`, `submit_to`, `neighborhood`, `ward`, the
//! four date columns, and `geometry`. Staff-workflow columns (assigned_to,
//! internal_notes, estimated_completion, citizen_updates, validation flags)
//! are locally owned and never appear in any statement here. Schema and
//! migrations belong to the surrounding application.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::Row;
use stl311_core::{
    Priority, ProjectedPoint, RecordSource, RequestStatus, RetryDisposition, RunCounts, RunState,
    ServiceRequestRecord, SyncRunSummary, UpsertCounts,
};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

pub const CRATE_NAME: &str = "stl311-store";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("stored row is malformed: {0}")]
    RowShape(String),
}

impl StoreError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Sqlx(err) => classify_sqlx_error(err),
            Self::RowShape(_) => RetryDisposition::NonRetryable,
        }
    }
}

pub fn classify_sqlx_error(err: &sqlx::Error) -> RetryDisposition {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

/// Page-atomic reconciliation writes keyed by external id.
#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn upsert_page(
        &self,
        records: &[ServiceRequestRecord],
    ) -> Result<UpsertCounts, StoreError>;
}

/// Persisted run summaries: the last-success lookup feeds
/// "sync since last success" windows, pruning feeds the cleanup job.
#[async_trait]
pub trait RunHistory: Send + Sync {
    async fn record_run(&self, summary: &SyncRunSummary) -> Result<(), StoreError>;
    async fn recent_runs(&self, limit: i64) -> Result<Vec<SyncRunSummary>, StoreError>;
    async fn last_success(&self) -> Result<Option<DateTime<Utc>>, StoreError>;
    async fn prune_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl RequestStore for PgStore {
    async fn upsert_page(
        &self,
        records: &[ServiceRequestRecord],
    ) -> Result<UpsertCounts, StoreError> {
        let mut counts = UpsertCounts::default();
        let mut tx = self.pool.begin().await?;

        for record in records {
            match fetch_existing(&mut tx, record.external_id).await? {
                None => {
                    insert_record(&mut tx, record).await?;
                    counts.inserted += 1;
                }
                Some(existing) if existing.source != RecordSource::Open311 => {
                    debug!(
                        external_id = record.external_id,
                        source = existing.source.as_str(),
                        "skipping row sync does not own"
                    );
                    counts.skipped += 1;
                }
                Some(existing) if !sync_fields_differ(&existing, record) => {
                    counts.unchanged += 1;
                }
                Some(_) => {
                    update_record(&mut tx, record).await?;
                    counts.updated += 1;
                }
            }
        }

        tx.commit().await?;
        debug!(
            inserted = counts.inserted,
            updated = counts.updated,
            unchanged = counts.unchanged,
            skipped = counts.skipped,
            "page committed"
        );
        Ok(counts)
    }
}

async fn fetch_existing(
    conn: &mut PgConnection,
    external_id: i64,
) -> Result<Option<ServiceRequestRecord>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT request_id, source, status, priority, problem_code, description,
               prob_address, prob_city, prob_zip, prob_add_type, submit_to,
               neighborhood, ward, datetime_init, datetime_closed,
               date_cancelled, prj_complete_date,
               ST_X(geometry) AS loc_x, ST_Y(geometry) AS loc_y
        FROM service_requests
        WHERE request_id = $1
        FOR UPDATE
        "#,
    )
    .bind(external_id)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let status: String = row.try_get("status")?;
    let priority: String = row.try_get("priority")?;
    let source: String = row.try_get("source")?;
    let loc_x: Option<f64> = row.try_get("loc_x")?;
    let loc_y: Option<f64> = row.try_get("loc_y")?;
    let location = match (loc_x, loc_y) {
        (Some(x), Some(y)) => Some(ProjectedPoint { x, y }),
        _ => None,
    };

    Ok(Some(ServiceRequestRecord {
        external_id: row.try_get("request_id")?,
        status: RequestStatus::from_stored(&status),
        priority: Priority::parse(&priority),
        problem_code: row.try_get("problem_code")?,
        description: row.try_get("description")?,
        address: row.try_get("prob_address")?,
        city: row.try_get("prob_city")?,
        zipcode: row.try_get("prob_zip")?,
        address_type: row.try_get("prob_add_type")?,
        agency: row.try_get("submit_to")?,
        neighborhood: row.try_get("neighborhood")?,
        ward: row.try_get("ward")?,
        submitted_at: row.try_get("datetime_init")?,
        closed_at: row.try_get("datetime_closed")?,
        cancelled_at: row.try_get("date_cancelled")?,
        completed_at: row.try_get("prj_complete_date")?,
        location,
        source: RecordSource::parse(&source),
    }))
}

async fn insert_record(
    conn: &mut PgConnection,
    record: &ServiceRequestRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO service_requests (
            request_id, source, status, priority, problem_code, description,
            prob_address, prob_city, prob_zip, prob_add_type, submit_to,
            neighborhood, ward, datetime_init, datetime_closed,
            date_cancelled, prj_complete_date, geometry, created_at, updated_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
            $14, $15, $16, $17,
            CASE WHEN $18::double precision IS NULL THEN NULL
                 ELSE ST_SetSRID(ST_MakePoint($18, $19), 3857) END,
            NOW(), NOW()
        )
        "#,
    )
    .bind(record.external_id)
    .bind(record.source.as_str())
    .bind(record.status.as_str())
    .bind(record.priority.as_str())
    .bind(record.problem_code.as_deref())
    .bind(record.description.as_deref())
    .bind(record.address.as_deref())
    .bind(record.city.as_deref())
    .bind(record.zipcode.as_deref())
    .bind(record.address_type.as_deref())
    .bind(record.agency.as_deref())
    .bind(record.neighborhood.as_deref())
    .bind(record.ward)
    .bind(record.submitted_at)
    .bind(record.closed_at)
    .bind(record.cancelled_at)
    .bind(record.completed_at)
    .bind(record.location.map(|p| p.x))
    .bind(record.location.map(|p| p.y))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update_record(
    conn: &mut PgConnection,
    record: &ServiceRequestRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE service_requests SET
            status = $2, priority = $3, problem_code = $4, description = $5,
            prob_address = $6, prob_city = $7, prob_zip = $8,
            prob_add_type = $9, submit_to = $10, neighborhood = $11,
            ward = $12, datetime_init = $13, datetime_closed = $14,
            date_cancelled = $15, prj_complete_date = $16,
            geometry = CASE WHEN $17::double precision IS NULL THEN NULL
                            ELSE ST_SetSRID(ST_MakePoint($17, $18), 3857) END,
            updated_at = NOW()
        WHERE request_id = $1
        "#,
    )
    .bind(record.external_id)
    .bind(record.status.as_str())
    .bind(record.priority.as_str())
    .bind(record.problem_code.as_deref())
    .bind(record.description.as_deref())
    .bind(record.address.as_deref())
    .bind(record.city.as_deref())
    .bind(record.zipcode.as_deref())
    .bind(record.address_type.as_deref())
    .bind(record.agency.as_deref())
    .bind(record.neighborhood.as_deref())
    .bind(record.ward)
    .bind(record.submitted_at)
    .bind(record.closed_at)
    .bind(record.cancelled_at)
    .bind(record.completed_at)
    .bind(record.location.map(|p| p.x))
    .bind(record.location.map(|p| p.y))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// True when any sync-owned field would change. Locally-owned columns are
/// outside the comparison by construction.
pub fn sync_fields_differ(existing: &ServiceRequestRecord, incoming: &ServiceRequestRecord) -> bool {
    existing.status != incoming.status
        || existing.priority != incoming.priority
        || existing.problem_code != incoming.problem_code
        || existing.description != incoming.description
        || existing.address != incoming.address
        || existing.city != incoming.city
        || existing.zipcode != incoming.zipcode
        || existing.address_type != incoming.address_type
        || existing.agency != incoming.agency
        || existing.neighborhood != incoming.neighborhood
        || existing.ward != incoming.ward
        || existing.submitted_at != incoming.submitted_at
        || existing.closed_at != incoming.closed_at
        || existing.cancelled_at != incoming.cancelled_at
        || existing.completed_at != incoming.completed_at
        || existing.location != incoming.location
}

#[async_trait]
impl RunHistory for PgStore {
    async fn record_run(&self, summary: &SyncRunSummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (
                run_id, window_label, window_start, window_end, started_at,
                finished_at, state, attempts, fetched, accepted, corrected,
                rejected, inserted, updated, unchanged, skipped,
                last_error, publish_error
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                $14, $15, $16, $17, $18
            )
            "#,
        )
        .bind(summary.run_id)
        .bind(&summary.window)
        .bind(summary.window_start)
        .bind(summary.window_end)
        .bind(summary.started_at)
        .bind(summary.finished_at)
        .bind(summary.state.as_str())
        .bind(summary.attempts as i32)
        .bind(summary.counts.fetched as i64)
        .bind(summary.counts.accepted as i64)
        .bind(summary.counts.corrected as i64)
        .bind(summary.counts.rejected as i64)
        .bind(summary.counts.inserted as i64)
        .bind(summary.counts.updated as i64)
        .bind(summary.counts.unchanged as i64)
        .bind(summary.counts.skipped as i64)
        .bind(summary.last_error.as_deref())
        .bind(summary.publish_error.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<SyncRunSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, window_label, window_start, window_end, started_at,
                   finished_at, state, attempts, fetched, accepted, corrected,
                   rejected, inserted, updated, unchanged, skipped,
                   last_error, publish_error
            FROM sync_runs
            ORDER BY started_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(summary_from_row).collect()
    }

    async fn last_success(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT finished_at FROM sync_runs
            WHERE state = 'completed'
            ORDER BY finished_at DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(row) => Some(row.try_get("finished_at")?),
            None => None,
        })
    }

    async fn prune_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sync_runs WHERE started_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        let pruned = result.rows_affected();
        if pruned > 0 {
            info!(pruned, "pruned stale sync runs");
        }
        Ok(pruned)
    }
}

fn summary_from_row(row: &sqlx::postgres::PgRow) -> Result<SyncRunSummary, StoreError> {
    let state: String = row.try_get("state")?;
    let state = RunState::from_stored(&state)
        .ok_or_else(|| StoreError::RowShape(format!("unknown run state {state:?}")))?;
    let attempts: i32 = row.try_get("attempts")?;

    Ok(SyncRunSummary {
        run_id: row.try_get::<Uuid, _>("run_id")?,
        window: row.try_get("window_label")?,
        window_start: row.try_get("window_start")?,
        window_end: row.try_get("window_end")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        state,
        attempts: attempts.max(0) as u32,
        counts: RunCounts {
            fetched: count_column(row, "fetched")?,
            accepted: count_column(row, "accepted")?,
            corrected: count_column(row, "corrected")?,
            rejected: count_column(row, "rejected")?,
            inserted: count_column(row, "inserted")?,
            updated: count_column(row, "updated")?,
            unchanged: count_column(row, "unchanged")?,
            skipped: count_column(row, "skipped")?,
        },
        last_error: row.try_get("last_error")?,
        publish_error: row.try_get("publish_error")?,
    })
}

fn count_column(row: &sqlx::postgres::PgRow, name: &str) -> Result<u64, StoreError> {
    let value: i64 = row.try_get(name)?;
    Ok(value.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stl311_core::{RequestStatus, ServiceRequestRecord};

    fn record(external_id: i64) -> ServiceRequestRecord {
        ServiceRequestRecord {
            external_id,
            status: RequestStatus::Open,
            priority: Priority::Normal,
            problem_code: Some("POTHOLE".to_string()),
            description: Some("Pothole".to_string()),
            address: Some("1200 Market St".to_string()),
            city: Some("St. Louis".to_string()),
            zipcode: Some("63103".to_string()),
            address_type: Some("Street".to_string()),
            agency: Some("Streets".to_string()),
            neighborhood: Some("Downtown West".to_string()),
            ward: Some(7),
            submitted_at: None,
            closed_at: None,
            cancelled_at: None,
            completed_at: None,
            location: Some(ProjectedPoint {
                x: -10_040_000.0,
                y: 4_650_000.0,
            }),
            source: RecordSource::Open311,
        }
    }

    #[test]
    fn identical_records_do_not_differ() {
        let existing = record(1);
        let incoming = record(1);
        assert!(!sync_fields_differ(&existing, &incoming));
    }

    #[test]
    fn status_change_marks_the_record_changed() {
        let existing = record(1);
        let mut incoming = record(1);
        incoming.status = RequestStatus::Closed;
        assert!(sync_fields_differ(&existing, &incoming));
    }

    #[test]
    fn dropped_geometry_marks_the_record_changed() {
        let existing = record(1);
        let mut incoming = record(1);
        incoming.location = None;
        assert!(sync_fields_differ(&existing, &incoming));
    }

    #[test]
    fn io_failures_are_retryable_and_shape_defects_are_not() {
        let io = StoreError::Sqlx(sqlx::Error::Io(std::io::Error::other("boom")));
        assert_eq!(io.disposition(), RetryDisposition::Retryable);

        let timeout = StoreError::Sqlx(sqlx::Error::PoolTimedOut);
        assert_eq!(timeout.disposition(), RetryDisposition::Retryable);

        let shape = StoreError::RowShape("bad".to_string());
        assert_eq!(shape.disposition(), RetryDisposition::NonRetryable);
    }
}
