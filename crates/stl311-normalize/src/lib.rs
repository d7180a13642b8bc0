//! Validation and normalization of raw Open311 records.
//!
//! Every record is judged on its own: one malformed entry downgrades or
//! rejects itself, never the page around it.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::Serialize;
use stl311_client::RawServiceRequest;
use stl311_core::{
    Priority, ProjectedPoint, RecordSource, RequestStatus, ServiceRequestRecord,
};
use tracing::debug;

pub const CRATE_NAME: &str = "stl311-normalize";

/// Ordered date-format ladder; first match wins. RFC3339 is tried before
/// any of these.
const DATE_FORMATS: &[&str] = &["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"];
const DAY_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y"];

const MAX_TEXT_LEN: usize = 255;

/// Service-area bounding box in EPSG:3857 meters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServiceAreaBounds {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Default for ServiceAreaBounds {
    fn default() -> Self {
        // City of St. Louis extent.
        Self {
            min_x: -10_060_000.0,
            max_x: -10_020_000.0,
            min_y: 4_600_000.0,
            max_y: 4_700_000.0,
        }
    }
}

impl ServiceAreaBounds {
    pub fn contains(&self, point: ProjectedPoint) -> bool {
        point.x >= self.min_x
            && point.x <= self.max_x
            && point.y >= self.min_y
            && point.y <= self.max_y
    }
}

/// Data dropped while salvaging a record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CorrectionNote {
    UnparsableDate { field: &'static str, raw: String },
    OutOfAreaLocation { x: f64, y: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    MissingRequiredField,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingRequiredField => "missing-required-field",
        }
    }
}

/// Per-record outcome of normalization.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Normalized {
    Accepted(ServiceRequestRecord),
    Corrected {
        record: ServiceRequestRecord,
        notes: Vec<CorrectionNote>,
    },
    Rejected {
        external_id: Option<i64>,
        reason: RejectReason,
    },
}

impl Normalized {
    /// The record entering the store, if any.
    pub fn record(&self) -> Option<&ServiceRequestRecord> {
        match self {
            Self::Accepted(record) | Self::Corrected { record, .. } => Some(record),
            Self::Rejected { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Normalizer {
    bounds: ServiceAreaBounds,
}

impl Normalizer {
    pub fn new(bounds: ServiceAreaBounds) -> Self {
        Self { bounds }
    }

    /// Normalize a whole page, yielding one outcome per input record.
    pub fn normalize_page(&self, raw_records: &[RawServiceRequest]) -> Vec<Normalized> {
        raw_records.iter().map(|raw| self.normalize(raw)).collect()
    }

    pub fn normalize(&self, raw: &RawServiceRequest) -> Normalized {
        let external_id = raw
            .service_request_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .and_then(|id| id.parse::<i64>().ok());

        let status_raw = raw
            .status
            .as_deref()
            .map(str::trim)
            .filter(|status| !status.is_empty());

        let (external_id, status_raw) = match (external_id, status_raw) {
            (Some(id), Some(status)) => (id, status),
            (id, _) => {
                debug!(external_id = ?id, "rejecting record lacking id or status");
                return Normalized::Rejected {
                    external_id: id,
                    reason: RejectReason::MissingRequiredField,
                };
            }
        };

        let mut notes = Vec::new();

        let submitted_at = parse_date("requested_datetime", &raw.requested_datetime, &mut notes);
        let closed_at = parse_date("updated_datetime", &raw.updated_datetime, &mut notes);
        let cancelled_at = parse_date("cancelled_datetime", &raw.cancelled_datetime, &mut notes);
        let completed_at = parse_date("expected_datetime", &raw.expected_datetime, &mut notes);

        let location = match extract_point(raw) {
            Some(point) if self.bounds.contains(point) => Some(point),
            Some(point) => {
                notes.push(CorrectionNote::OutOfAreaLocation {
                    x: point.x,
                    y: point.y,
                });
                None
            }
            None => None,
        };

        let address = clean_text(&raw.address);
        let record = ServiceRequestRecord {
            external_id,
            status: RequestStatus::parse(status_raw),
            priority: raw
                .priority
                .as_deref()
                .map(Priority::parse)
                .unwrap_or(Priority::Normal),
            problem_code: clean_text(&raw.service_code),
            description: clean_text(&raw.service_name),
            city: Some("St. Louis".to_string()),
            zipcode: clean_text(&raw.zipcode),
            address_type: address.as_deref().map(infer_address_type),
            agency: clean_text(&raw.agency_responsible),
            neighborhood: clean_text(&raw.neighborhood)
                .or_else(|| neighborhood_from_address(address.as_deref())),
            ward: raw
                .ward
                .as_deref()
                .and_then(|ward| ward.trim().parse::<i32>().ok())
                .or_else(|| ward_from_address(address.as_deref())),
            address,
            submitted_at,
            closed_at,
            cancelled_at,
            completed_at,
            location,
            source: RecordSource::Open311,
        };

        if notes.is_empty() {
            Normalized::Accepted(record)
        } else {
            Normalized::Corrected { record, notes }
        }
    }
}

fn parse_date(
    field: &'static str,
    raw: &Option<String>,
    notes: &mut Vec<CorrectionNote>,
) -> Option<DateTime<Utc>> {
    let text = raw.as_deref().map(str::trim).filter(|t| !t.is_empty())?;

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in DATE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(text, format) {
            return Some(parsed.and_utc());
        }
    }
    for format in DAY_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(text, format) {
            return parsed.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
        }
    }

    notes.push(CorrectionNote::UnparsableDate {
        field,
        raw: text.to_string(),
    });
    None
}

/// SRX/SRY preferred, LAT/LONG as fallback; both pairs are EPSG:3857 meters
/// in the source feed. Zero pairs mean "no geometry".
fn extract_point(raw: &RawServiceRequest) -> Option<ProjectedPoint> {
    let pair = parse_pair(&raw.srx, &raw.sry).or_else(|| parse_pair(&raw.lat, &raw.long))?;
    Some(ProjectedPoint {
        x: pair.0,
        y: pair.1,
    })
}

fn parse_pair(x: &Option<String>, y: &Option<String>) -> Option<(f64, f64)> {
    let x = x.as_deref()?.trim().parse::<f64>().ok()?;
    let y = y.as_deref()?.trim().parse::<f64>().ok()?;
    if x == 0.0 || y == 0.0 {
        return None;
    }
    Some((x, y))
}

fn clean_text(raw: &Option<String>) -> Option<String> {
    let text = raw.as_deref()?.trim();
    if text.is_empty() {
        return None;
    }
    let mut cleaned = text.to_string();
    if cleaned.len() > MAX_TEXT_LEN {
        let mut cut = MAX_TEXT_LEN;
        while !cleaned.is_char_boundary(cut) {
            cut -= 1;
        }
        cleaned.truncate(cut);
    }
    Some(cleaned)
}

fn infer_address_type(address: &str) -> String {
    let upper = address.to_ascii_uppercase();
    if ["STREET", "AVE", "BLVD", "DR"].iter().any(|w| upper.contains(w)) {
        "Street".to_string()
    } else if ["ALLEY", "LANE"].iter().any(|w| upper.contains(w)) {
        "Alley".to_string()
    } else {
        "Address".to_string()
    }
}

fn neighborhood_from_address(address: Option<&str>) -> Option<String> {
    let (_, tail) = address?.split_once(',')?;
    let tail = tail.trim();
    if tail.is_empty() {
        None
    } else {
        Some(tail.to_string())
    }
}

fn ward_from_address(address: Option<&str>) -> Option<i32> {
    let upper = address?.to_ascii_uppercase();
    let position = upper.find("WARD")?;
    let digits: String = upper[position + 4..]
        .chars()
        .skip_while(|c| c.is_whitespace())
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}
