//! Core domain model for the St. Louis 311 sync pipeline.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "stl311-core";

/// Whether a failed operation is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

/// Fixed status vocabulary; anything the source invents maps to `Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestStatus {
    New,
    Open,
    InProgress,
    Closed,
    Cancelled,
    Unknown,
}

impl RequestStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "new" => Self::New,
            "open" => Self::Open,
            "in progress" | "in-progress" | "in_progress" => Self::InProgress,
            "closed" | "resolved" => Self::Closed,
            "cancelled" | "canceled" => Self::Cancelled,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Open => "open",
            Self::InProgress => "in-progress",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    pub fn from_stored(raw: &str) -> Self {
        Self::parse(raw)
    }
}

/// Fixed priority vocabulary with the same `Unknown` sentinel rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
    Unknown,
}

impl Priority {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Self::Low,
            "normal" | "medium" => Self::Normal,
            "high" => Self::High,
            "urgent" | "emergency" => Self::Urgent,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
            Self::Unknown => "unknown",
        }
    }
}

/// Who created a stored row. Sync only ever touches rows it owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordSource {
    Open311,
    Citizen,
}

impl RecordSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open311 => "open311",
            Self::Citizen => "citizen",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "citizen" => Self::Citizen,
            _ => Self::Open311,
        }
    }
}

/// Planar point in EPSG:3857 meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProjectedPoint {
    pub x: f64,
    pub y: f64,
}

/// Normalized service-request record, keyed by the source-assigned id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRequestRecord {
    pub external_id: i64,
    pub status: RequestStatus,
    pub priority: Priority,
    pub problem_code: Option<String>,
    pub description: Option<String>,
    pub address: Option<String>,
    pub city: Option<String>,
    pub zipcode: Option<String>,
    pub address_type: Option<String>,
    pub agency: Option<String>,
    pub neighborhood: Option<String>,
    pub ward: Option<i32>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub location: Option<ProjectedPoint>,
    pub source: RecordSource,
}

impl ServiceRequestRecord {
    pub fn has_location(&self) -> bool {
        self.location.is_some()
    }
}

/// Requested sync time window, resolved lazily against the wall clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncWindow {
    Yesterday,
    LastDays(u32),
    Range { start: NaiveDate, end: NaiveDate },
    SinceLastSuccess,
}

/// Concrete UTC range a run operates on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl SyncWindow {
    /// Resolve to a concrete UTC range. `last_success` feeds the
    /// `SinceLastSuccess` variant; without one it falls back to yesterday,
    /// matching a first-ever run.
    pub fn resolve_at(
        &self,
        now: DateTime<Utc>,
        last_success: Option<DateTime<Utc>>,
    ) -> ResolvedWindow {
        match self {
            Self::Yesterday => ResolvedWindow {
                start: start_of_day(now - Duration::days(1)),
                end: now,
            },
            Self::LastDays(days) => ResolvedWindow {
                start: start_of_day(now - Duration::days(i64::from(*days))),
                end: now,
            },
            Self::Range { start, end } => ResolvedWindow {
                start: start
                    .and_hms_opt(0, 0, 0)
                    .expect("midnight always exists")
                    .and_utc(),
                end: end
                    .and_hms_opt(23, 59, 59)
                    .expect("end of day always exists")
                    .and_utc(),
            },
            Self::SinceLastSuccess => match last_success {
                Some(since) => ResolvedWindow { start: since, end: now },
                None => Self::Yesterday.resolve_at(now, None),
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Yesterday => "yesterday".to_string(),
            Self::LastDays(days) => format!("last-{days}-days"),
            Self::Range { start, end } => format!("{start}..{end}"),
            Self::SinceLastSuccess => "since-last-success".to_string(),
        }
    }
}

fn start_of_day(at: DateTime<Utc>) -> DateTime<Utc> {
    at.date_naive()
        .and_hms_opt(0, 0, 0)
        .expect("midnight always exists")
        .and_utc()
}

/// Orchestrator run states. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Pending,
    Fetching,
    Validating,
    Upserting,
    RetryWait,
    Publishing,
    Completed,
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Validating => "validating",
            Self::Upserting => "upserting",
            Self::RetryWait => "retry-wait",
            Self::Publishing => "publishing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_stored(raw: &str) -> Option<Self> {
        Some(match raw {
            "pending" => Self::Pending,
            "fetching" => Self::Fetching,
            "validating" => Self::Validating,
            "upserting" => Self::Upserting,
            "retry-wait" => Self::RetryWait,
            "publishing" => Self::Publishing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => return None,
        })
    }
}

/// Per-page reconciliation counts reported by the store adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
}

impl UpsertCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.unchanged + self.skipped
    }
}

/// Whole-run tallies. `accepted` includes corrected records, since both
/// enter the store; `corrected` is additionally broken out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounts {
    pub fetched: u64,
    pub accepted: u64,
    pub corrected: u64,
    pub rejected: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub skipped: u64,
}

impl RunCounts {
    pub fn absorb_upsert(&mut self, counts: UpsertCounts) {
        self.inserted += counts.inserted;
        self.updated += counts.updated;
        self.unchanged += counts.unchanged;
        self.skipped += counts.skipped;
    }
}

/// Record of one orchestrator run, persisted to run history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub window: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
    pub attempts: u32,
    pub counts: RunCounts,
    pub last_error: Option<String>,
    pub publish_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 10, 12, 30, 0).single().unwrap()
    }

    #[test]
    fn yesterday_window_spans_midnight_to_now() {
        let resolved = SyncWindow::Yesterday.resolve_at(noon(), None);
        assert_eq!(
            resolved.start,
            Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).single().unwrap()
        );
        assert_eq!(resolved.end, noon());
    }

    #[test]
    fn last_days_window_counts_back_whole_days() {
        let resolved = SyncWindow::LastDays(7).resolve_at(noon(), None);
        assert_eq!(
            resolved.start,
            Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 0).single().unwrap()
        );
        assert_eq!(resolved.end, noon());
    }

    #[test]
    fn explicit_range_is_inclusive_of_both_days() {
        let window = SyncWindow::Range {
            start: NaiveDate::from_ymd_opt(2026, 1, 1).unwrap(),
            end: NaiveDate::from_ymd_opt(2026, 1, 31).unwrap(),
        };
        let resolved = window.resolve_at(noon(), None);
        assert_eq!(
            resolved.start,
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap()
        );
        assert_eq!(
            resolved.end,
            Utc.with_ymd_and_hms(2026, 1, 31, 23, 59, 59).single().unwrap()
        );
    }

    #[test]
    fn since_last_success_uses_the_persisted_timestamp() {
        let since = Utc.with_ymd_and_hms(2026, 3, 8, 2, 0, 0).single().unwrap();
        let resolved = SyncWindow::SinceLastSuccess.resolve_at(noon(), Some(since));
        assert_eq!(resolved.start, since);
        assert_eq!(resolved.end, noon());
    }

    #[test]
    fn since_last_success_without_history_falls_back_to_yesterday() {
        let resolved = SyncWindow::SinceLastSuccess.resolve_at(noon(), None);
        assert_eq!(resolved, SyncWindow::Yesterday.resolve_at(noon(), None));
    }

    #[test]
    fn status_vocabulary_maps_unknowns_to_sentinel() {
        assert_eq!(RequestStatus::parse("Open"), RequestStatus::Open);
        assert_eq!(RequestStatus::parse("IN PROGRESS"), RequestStatus::InProgress);
        assert_eq!(RequestStatus::parse("canceled"), RequestStatus::Cancelled);
        assert_eq!(RequestStatus::parse("weird"), RequestStatus::Unknown);
        assert_eq!(Priority::parse("URGENT"), Priority::Urgent);
        assert_eq!(Priority::parse("p1"), Priority::Unknown);
    }

    #[test]
    fn run_state_storage_round_trips() {
        for state in [
            RunState::Pending,
            RunState::Fetching,
            RunState::Validating,
            RunState::Upserting,
            RunState::RetryWait,
            RunState::Publishing,
            RunState::Completed,
            RunState::Failed,
        ] {
            assert_eq!(RunState::from_stored(state.as_str()), Some(state));
        }
        assert_eq!(RunState::from_stored("nope"), None);
    }

    #[test]
    fn run_counts_absorb_upsert_totals() {
        let mut counts = RunCounts::default();
        counts.absorb_upsert(UpsertCounts {
            inserted: 3,
            updated: 2,
            unchanged: 1,
            skipped: 1,
        });
        counts.absorb_upsert(UpsertCounts {
            inserted: 1,
            ..Default::default()
        });
        assert_eq!(counts.inserted, 4);
        assert_eq!(counts.updated, 2);
        assert_eq!(counts.unchanged, 1);
        assert_eq!(counts.skipped, 1);
    }
}
