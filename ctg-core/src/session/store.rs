//! Storage capability traits and their shared error type.
//!
//! The cache holds the live copy of every session; the repository is the
//! durable home a session moves to on save. Both are expressed as
//! capability traits so the manager can be exercised against in-memory
//! doubles.

use async_trait::async_trait;
use thiserror::Error;

use super::types::{
    EventKind, FilteredDataPoint, Session, SessionData, SessionEvent, SessionMetrics, SeriesKind,
    TimeSeriesPoint, TraceKind,
};

/// Failures from either storage tier.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("metrics not found for session: {0}")]
    MetricsNotFound(String),
    #[error("cache error: {0}")]
    Cache(#[from] redis::RedisError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// True when the failure is a plain miss rather than an I/O fault.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound(_) | Self::MetricsNotFound(_))
    }
}

/// Fast live store for per-session state. Authoritative while a session
/// is active.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Write the session blob, replacing any previous value.
    async fn set_session(&self, session: &Session) -> Result<(), StoreError>;

    async fn session(&self, session_id: &str) -> Result<Session, StoreError>;

    /// Remove every key carrying the session's prefix.
    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;

    /// Apply a TTL to every key carrying the session's prefix.
    async fn expire_session(&self, session_id: &str, ttl_seconds: i64) -> Result<(), StoreError>;

    /// Overwrite the metrics snapshot atomically.
    async fn set_metrics(&self, metrics: &SessionMetrics) -> Result<(), StoreError>;

    async fn metrics(&self, session_id: &str) -> Result<SessionMetrics, StoreError>;

    /// Append events to their per-kind catalogues. No dedup here; the
    /// manager probes with [`CacheStore::event_exists`] first.
    async fn append_events(
        &self,
        session_id: &str,
        events: &[SessionEvent],
    ) -> Result<(), StoreError>;

    async fn events(
        &self,
        session_id: &str,
        kind: EventKind,
    ) -> Result<Vec<SessionEvent>, StoreError>;

    /// All catalogues concatenated, acceleration → deceleration →
    /// contraction.
    async fn all_events(&self, session_id: &str) -> Result<Vec<SessionEvent>, StoreError>;

    async fn event_exists(
        &self,
        session_id: &str,
        kind: EventKind,
        start_time: f64,
    ) -> Result<bool, StoreError>;

    async fn append_time_series(
        &self,
        session_id: &str,
        kind: SeriesKind,
        points: &[TimeSeriesPoint],
    ) -> Result<(), StoreError>;

    async fn time_series(
        &self,
        session_id: &str,
        kind: SeriesKind,
    ) -> Result<Vec<TimeSeriesPoint>, StoreError>;

    /// Current series length; the suffix-append merge reads this before
    /// deciding what is new.
    async fn time_series_len(
        &self,
        session_id: &str,
        kind: SeriesKind,
    ) -> Result<usize, StoreError>;

    /// Upsert filtered points keyed by `time_sec` (last write wins).
    async fn update_filtered(
        &self,
        session_id: &str,
        kind: TraceKind,
        points: &[FilteredDataPoint],
    ) -> Result<(), StoreError>;

    /// Filtered trace ordered by `time_sec`.
    async fn filtered(
        &self,
        session_id: &str,
        kind: TraceKind,
    ) -> Result<Vec<FilteredDataPoint>, StoreError>;

    /// Composite read of everything cached for the session. Sub-reads
    /// other than the session blob are best-effort.
    async fn session_data(&self, session_id: &str) -> Result<SessionData, StoreError>;
}

/// Durable home for saved sessions.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn session(&self, session_id: &str) -> Result<Session, StoreError>;

    /// Sessions ordered by `started_at` descending.
    async fn list_sessions(&self, limit: i64, offset: i64) -> Result<Vec<Session>, StoreError>;

    /// Remove the session and cascade across its sub-tables in one
    /// transaction.
    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError>;

    /// Write the full snapshot in one transaction.
    async fn save_session_data(&self, data: &SessionData) -> Result<(), StoreError>;
}
