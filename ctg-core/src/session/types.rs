//! Session domain model.
//!
//! These are the cache/durable shapes, independent of any wire format.
//! The server crate converts analysis RPC responses into
//! [`AnalysisUpdate`] before they reach the manager.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::store::StoreError;

/// Lifecycle of a monitoring episode.
///
/// `Active → Stopped` on explicit stop; `Stopped → Saved` once the
/// durable snapshot lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Active,
    Stopped,
    Saved,
}

impl SessionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Stopped => "STOPPED",
            Self::Saved => "SAVED",
        }
    }

    /// Parse the durable-store representation.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(Self::Active),
            "STOPPED" => Some(Self::Stopped),
            "SAVED" => Some(Self::Saved),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator-supplied context attached to a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub patient_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub doctor_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub facility_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<serde_json::Value>,
    /// Origin of the session: "web", "emulator", or "auto-created".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub created_from: String,
}

/// A monitoring episode, the unit of aggregation and persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub total_duration_ms: i64,
    #[serde(default)]
    pub total_data_points: i64,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Current aggregate metrics for a session. Overwritten wholesale on
/// every analysis response; never merged field by field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub session_id: String,
    pub stv: f64,
    pub ltv: f64,
    pub baseline_heart_rate: f64,
    pub total_accelerations: i32,
    pub total_decelerations: i32,
    pub late_decelerations: i32,
    pub late_deceleration_ratio: f64,
    pub total_contractions: i32,
    pub accel_decel_ratio: f64,
    pub stv_trend: f64,
    pub bpm_trend: f64,
    pub data_points: i32,
    pub time_span_sec: f64,
    pub updated_at: DateTime<Utc>,
}

/// Catalogued event class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Acceleration,
    Deceleration,
    Contraction,
}

impl EventKind {
    pub const ALL: [Self; 3] = [Self::Acceleration, Self::Deceleration, Self::Contraction];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Acceleration => "acceleration",
            Self::Deceleration => "deceleration",
            Self::Contraction => "contraction",
        }
    }
}

/// One catalogued event. Appended once per distinct `(kind, start_time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    pub amplitude: f64,
    #[serde(default)]
    pub is_late: bool,
    pub created_at: DateTime<Utc>,
}

/// Variability series identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeriesKind {
    Stv,
    Ltv,
}

impl SeriesKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stv => "stv",
            Self::Ltv => "ltv",
        }
    }
}

/// One windowed variability value, appended at a monotonic index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: SeriesKind,
    pub time_index: i64,
    pub value: f64,
    pub window_duration: f64,
}

/// Filtered trace identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceKind {
    Bpm,
    Uterus,
}

impl TraceKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bpm => "bpm",
            Self::Uterus => "uterus",
        }
    }
}

/// One point on a filtered trace. The trace is keyed by `time_sec`;
/// re-submissions overwrite.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilteredDataPoint {
    pub time_sec: f64,
    pub value: f64,
}

/// Composite read of everything known about a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionData {
    pub session: Session,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SessionMetrics>,
    #[serde(default)]
    pub events: Vec<SessionEvent>,
    #[serde(default)]
    pub time_series_stv: Vec<TimeSeriesPoint>,
    #[serde(default)]
    pub time_series_ltv: Vec<TimeSeriesPoint>,
    #[serde(default)]
    pub filtered_bpm_data: Vec<FilteredDataPoint>,
    #[serde(default)]
    pub filtered_uterus_data: Vec<FilteredDataPoint>,
}

/// Body of `POST /api/sessions`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub patient_id: String,
    #[serde(default)]
    pub doctor_id: String,
    #[serde(default)]
    pub facility_id: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub custom_data: Option<serde_json::Value>,
    #[serde(default)]
    pub created_from: String,
}

/// Body of `POST /api/sessions/{id}/save`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SaveSessionRequest {
    #[serde(default)]
    pub notes: String,
}

/// Session plus its current metrics, as returned by the control plane.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub session: Session,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<SessionMetrics>,
}

/// A labeled interval reported by the analysis service.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EventSpan {
    pub start: f64,
    pub end: f64,
    pub duration: f64,
    pub amplitude: f64,
    /// Only meaningful for decelerations.
    pub is_late: bool,
}

impl EventSpan {
    fn into_event(self, session_id: &str, kind: EventKind, now: DateTime<Utc>) -> SessionEvent {
        SessionEvent {
            session_id: session_id.to_string(),
            kind,
            start_time: self.start,
            end_time: self.end,
            duration: self.duration,
            amplitude: self.amplitude,
            is_late: self.is_late,
            created_at: now,
        }
    }
}

/// Domain mirror of one analysis RPC response: the cumulative feature
/// snapshot the manager merges into cached session state.
#[derive(Debug, Clone, Default)]
pub struct AnalysisUpdate {
    pub session_id: String,
    pub batch_ts_ms: u64,
    pub stv: f64,
    pub ltv: f64,
    pub baseline_heart_rate: f64,
    pub total_accelerations: i32,
    pub total_decelerations: i32,
    pub late_decelerations: i32,
    pub late_deceleration_ratio: f64,
    pub total_contractions: i32,
    pub accel_decel_ratio: f64,
    pub stv_trend: f64,
    pub bpm_trend: f64,
    pub data_points: i32,
    pub time_span_sec: f64,
    pub accelerations: Vec<EventSpan>,
    pub decelerations: Vec<EventSpan>,
    pub contractions: Vec<EventSpan>,
    pub stvs: Vec<f64>,
    pub stvs_window_duration: f64,
    pub ltvs: Vec<f64>,
    pub ltvs_window_duration: f64,
    pub filtered_bpm: Vec<FilteredDataPoint>,
    pub filtered_uterus: Vec<FilteredDataPoint>,
}

impl AnalysisUpdate {
    /// Full metrics row for the overwrite-on-update path.
    #[must_use]
    pub fn metrics_snapshot(&self, now: DateTime<Utc>) -> SessionMetrics {
        SessionMetrics {
            session_id: self.session_id.clone(),
            stv: self.stv,
            ltv: self.ltv,
            baseline_heart_rate: self.baseline_heart_rate,
            total_accelerations: self.total_accelerations,
            total_decelerations: self.total_decelerations,
            late_decelerations: self.late_decelerations,
            late_deceleration_ratio: self.late_deceleration_ratio,
            total_contractions: self.total_contractions,
            accel_decel_ratio: self.accel_decel_ratio,
            stv_trend: self.stv_trend,
            bpm_trend: self.bpm_trend,
            data_points: self.data_points,
            time_span_sec: self.time_span_sec,
            updated_at: now,
        }
    }

    /// Every reported interval as a typed event, in catalogue order.
    pub(super) fn event_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = SessionEvent> + '_ {
        let id = &self.session_id;
        self.accelerations
            .iter()
            .map(move |span| span.into_event(id, EventKind::Acceleration, now))
            .chain(
                self.decelerations
                    .iter()
                    .map(move |span| span.into_event(id, EventKind::Deceleration, now)),
            )
            .chain(
                self.contractions
                    .iter()
                    .map(move |span| span.into_event(id, EventKind::Contraction, now)),
            )
    }
}

/// Failures surfaced by the session manager.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session {id} is not active (status: {status})")]
    NotActive { id: String, status: SessionStatus },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_status_round_trips_through_storage_form() {
        for status in [SessionStatus::Active, SessionStatus::Stopped, SessionStatus::Saved] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SessionStatus::parse("PAUSED"), None);
    }

    #[test]
    fn session_serializes_with_wire_field_names() {
        let session = Session {
            id: "abc".to_string(),
            status: SessionStatus::Active,
            started_at: Utc::now(),
            stopped_at: None,
            saved_at: None,
            total_duration_ms: 0,
            total_data_points: 42,
            metadata: Metadata {
                created_from: "emulator".to_string(),
                ..Metadata::default()
            },
        };

        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["status"], "ACTIVE");
        assert_eq!(json["total_data_points"], 42);
        assert_eq!(json["metadata"]["created_from"], "emulator");
        // Unset optional timestamps stay off the wire.
        assert!(json.get("stopped_at").is_none());
    }

    #[test]
    fn event_kind_serializes_as_type_field() {
        let event = SessionEvent {
            session_id: "abc".to_string(),
            kind: EventKind::Deceleration,
            start_time: 12.5,
            end_time: 20.0,
            duration: 7.5,
            amplitude: -15.0,
            is_late: true,
            created_at: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "deceleration");
        assert_eq!(json["is_late"], true);
    }

    #[test]
    fn event_candidates_cover_all_three_catalogues() {
        let update = AnalysisUpdate {
            session_id: "s1".to_string(),
            accelerations: vec![EventSpan { start: 1.0, ..EventSpan::default() }],
            decelerations: vec![EventSpan { start: 2.0, is_late: true, ..EventSpan::default() }],
            contractions: vec![EventSpan { start: 3.0, ..EventSpan::default() }],
            ..AnalysisUpdate::default()
        };

        let events: Vec<SessionEvent> = update.event_candidates(Utc::now()).collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].kind, EventKind::Acceleration);
        assert_eq!(events[1].kind, EventKind::Deceleration);
        assert!(events[1].is_late);
        assert_eq!(events[2].kind, EventKind::Contraction);
    }
}
