//! Session lifecycle and the idempotent merge of analysis results.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use super::store::{CacheStore, SessionRepository, StoreError};
use super::types::{
    AnalysisUpdate, CreateSessionRequest, Metadata, Session, SessionData, SessionError,
    SessionEvent, SessionMetrics, SessionStatus, SeriesKind, TimeSeriesPoint, TraceKind,
};

/// Owns the in-memory index of active sessions and coordinates the cache
/// and durable tiers.
///
/// The merge path is eventually consistent: sub-step failures are logged
/// and skipped, and the next analysis response carries the full snapshot
/// again, so state reconverges without retries.
pub struct SessionManager {
    cache: Arc<dyn CacheStore>,
    repository: Arc<dyn SessionRepository>,
    session_ttl_seconds: i64,
    active: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        cache: Arc<dyn CacheStore>,
        repository: Arc<dyn SessionRepository>,
        session_ttl_seconds: i64,
    ) -> Self {
        Self {
            cache,
            repository,
            session_ttl_seconds,
            active: RwLock::new(HashMap::new()),
        }
    }

    /// Create a fresh session, cache it, and index it as active.
    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<Session, SessionError> {
        let session = Session {
            id: Uuid::new_v4().to_string(),
            status: SessionStatus::Active,
            started_at: Utc::now(),
            stopped_at: None,
            saved_at: None,
            total_duration_ms: 0,
            total_data_points: 0,
            metadata: Metadata {
                patient_id: request.patient_id.clone(),
                doctor_id: request.doctor_id.clone(),
                facility_id: request.facility_id.clone(),
                notes: request.notes.clone(),
                custom_data: request.custom_data.clone(),
                created_from: request.created_from.clone(),
            },
        };

        self.cache.set_session(&session).await?;
        self.index_active(&session);

        info!(session = %session.id, "created session");
        Ok(session)
    }

    /// Look a session up: in-memory index, then cache, then durable
    /// store. First hit wins.
    pub async fn get_session(&self, session_id: &str) -> Result<Session, SessionError> {
        if let Some(session) = self.active.read().unwrap().get(session_id) {
            return Ok(session.clone());
        }

        if let Ok(session) = self.cache.session(session_id).await {
            return Ok(session);
        }

        match self.repository.session(session_id).await {
            Ok(session) => Ok(session),
            Err(err) if err.is_not_found() => Err(SessionError::NotFound(session_id.to_string())),
            Err(err) => Err(err.into()),
        }
    }

    /// Stop an active session and start its cache TTL countdown.
    pub async fn stop_session(&self, session_id: &str) -> Result<(), SessionError> {
        let mut session = self.get_session(session_id).await?;

        if session.status != SessionStatus::Active {
            return Err(SessionError::NotActive {
                id: session_id.to_string(),
                status: session.status,
            });
        }

        let now = Utc::now();
        session.status = SessionStatus::Stopped;
        session.stopped_at = Some(now);
        session.total_duration_ms = (now - session.started_at).num_milliseconds();

        self.cache.set_session(&session).await?;
        if let Err(err) = self
            .cache
            .expire_session(session_id, self.session_ttl_seconds)
            .await
        {
            warn!(session = session_id, %err, "failed to apply cache TTL");
        }

        self.active.write().unwrap().remove(session_id);

        info!(
            session = session_id,
            duration_ms = session.total_duration_ms,
            "stopped session"
        );
        Ok(())
    }

    /// Persist the full cached snapshot to the durable store in one
    /// transaction and mark the session saved.
    ///
    /// On durable failure the cache status is left unchanged, so the
    /// session stays eligible for another save attempt.
    pub async fn save_session(&self, session_id: &str, notes: &str) -> Result<(), SessionError> {
        let mut data = self.cache.session_data(session_id).await.map_err(|err| {
            if err.is_not_found() {
                SessionError::NotFound(session_id.to_string())
            } else {
                SessionError::Store(err)
            }
        })?;

        if !notes.is_empty() {
            data.session.metadata.notes = notes.to_string();
        }
        data.session.status = SessionStatus::Saved;
        data.session.saved_at = Some(Utc::now());

        self.repository.save_session_data(&data).await?;

        if let Err(err) = self.cache.set_session(&data.session).await {
            warn!(session = session_id, %err, "failed to update session status in cache");
        }

        info!(session = session_id, "saved session to durable store");
        Ok(())
    }

    /// Remove the session from every tier. Partial failure can leave
    /// orphans in the cache; the durable delete is the one that counts.
    pub async fn delete_session(&self, session_id: &str) -> Result<(), SessionError> {
        self.active.write().unwrap().remove(session_id);

        if let Err(err) = self.cache.delete_session(session_id).await {
            warn!(session = session_id, %err, "failed to delete session from cache");
        }

        self.repository.delete_session(session_id).await?;

        info!(session = session_id, "deleted session");
        Ok(())
    }

    /// Saved sessions ordered by `started_at` descending.
    pub async fn list_sessions(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Session>, SessionError> {
        Ok(self.repository.list_sessions(limit, offset).await?)
    }

    pub async fn session_metrics(&self, session_id: &str) -> Result<SessionMetrics, SessionError> {
        self.cache.metrics(session_id).await.map_err(|err| {
            if err.is_not_found() {
                SessionError::NotFound(session_id.to_string())
            } else {
                SessionError::Store(err)
            }
        })
    }

    pub async fn session_data(&self, session_id: &str) -> Result<SessionData, SessionError> {
        self.cache.session_data(session_id).await.map_err(|err| {
            if err.is_not_found() {
                SessionError::NotFound(session_id.to_string())
            } else {
                SessionError::Store(err)
            }
        })
    }

    #[must_use]
    pub fn is_session_active(&self, session_id: &str) -> bool {
        self.active.read().unwrap().contains_key(session_id)
    }

    /// Merge one analysis response into cached session state.
    ///
    /// Write order: metrics → events → time series → filtered traces →
    /// session counters. Each sub-step failure is logged and skipped; no
    /// rollback is attempted across cache keys.
    pub async fn apply_analysis(&self, update: &AnalysisUpdate) -> Result<(), SessionError> {
        let session_id = &update.session_id;
        let mut session = self.get_or_create_session(session_id).await?;

        if session.status != SessionStatus::Active {
            warn!(
                session = %session_id,
                status = %session.status,
                "ignoring batch for non-active session"
            );
            return Ok(());
        }

        let now = Utc::now();

        let metrics = update.metrics_snapshot(now);
        if let Err(err) = self.cache.set_metrics(&metrics).await {
            warn!(session = %session_id, %err, "failed to save metrics");
        }

        if let Err(err) = self.merge_events(update).await {
            warn!(session = %session_id, %err, "failed to process events");
        }

        if let Err(err) = self.merge_time_series(update).await {
            warn!(session = %session_id, %err, "failed to process time series");
        }

        if let Err(err) = self.merge_filtered(update).await {
            warn!(session = %session_id, %err, "failed to process filtered data");
        }

        session.total_data_points += i64::from(update.data_points);
        if let Err(err) = self.cache.set_session(&session).await {
            warn!(session = %session_id, %err, "failed to update session");
        }
        self.index_active(&session);

        info!(
            session = %session_id,
            stv = update.stv,
            ltv = update.ltv,
            points = update.data_points,
            "merged analysis batch"
        );
        Ok(())
    }

    /// Append only events whose `(kind, start_time)` is unseen. A failed
    /// existence probe counts as "not exists": a duplicate is cheaper
    /// than a lost event.
    async fn merge_events(&self, update: &AnalysisUpdate) -> Result<(), StoreError> {
        let session_id = &update.session_id;
        let mut fresh: Vec<SessionEvent> = Vec::new();

        for event in update.event_candidates(Utc::now()) {
            let exists = self
                .cache
                .event_exists(session_id, event.kind, event.start_time)
                .await
                .unwrap_or(false);
            if !exists {
                fresh.push(event);
            }
        }

        if !fresh.is_empty() {
            let added = fresh.len();
            self.cache.append_events(session_id, &fresh).await?;
            info!(session = %session_id, added, "appended new events");
        }

        Ok(())
    }

    /// Append the suffix of each series beyond the cached length.
    /// Re-delivery of the same prefix appends nothing.
    async fn merge_time_series(&self, update: &AnalysisUpdate) -> Result<(), StoreError> {
        self.append_series_suffix(
            &update.session_id,
            SeriesKind::Stv,
            &update.stvs,
            update.stvs_window_duration,
        )
        .await?;
        self.append_series_suffix(
            &update.session_id,
            SeriesKind::Ltv,
            &update.ltvs,
            update.ltvs_window_duration,
        )
        .await
    }

    async fn append_series_suffix(
        &self,
        session_id: &str,
        kind: SeriesKind,
        values: &[f64],
        window_duration: f64,
    ) -> Result<(), StoreError> {
        let current = self
            .cache
            .time_series_len(session_id, kind)
            .await
            .unwrap_or(0);

        if values.len() <= current {
            return Ok(());
        }

        let points: Vec<TimeSeriesPoint> = values[current..]
            .iter()
            .enumerate()
            .map(|(offset, value)| TimeSeriesPoint {
                session_id: session_id.to_string(),
                kind,
                time_index: (current + offset) as i64,
                value: *value,
                window_duration,
            })
            .collect();

        self.cache.append_time_series(session_id, kind, &points).await
    }

    async fn merge_filtered(&self, update: &AnalysisUpdate) -> Result<(), StoreError> {
        if !update.filtered_bpm.is_empty() {
            self.cache
                .update_filtered(&update.session_id, TraceKind::Bpm, &update.filtered_bpm)
                .await?;
        }
        if !update.filtered_uterus.is_empty() {
            self.cache
                .update_filtered(&update.session_id, TraceKind::Uterus, &update.filtered_uterus)
                .await?;
        }
        Ok(())
    }

    /// Find the session wherever it lives, or auto-create it for data
    /// arriving ahead of any explicit control-plane call.
    async fn get_or_create_session(&self, session_id: &str) -> Result<Session, SessionError> {
        if let Some(session) = self.active.read().unwrap().get(session_id) {
            return Ok(session.clone());
        }

        if let Ok(session) = self.cache.session(session_id).await {
            self.index_active(&session);
            return Ok(session);
        }

        if let Ok(session) = self.repository.session(session_id).await {
            info!(
                session = %session_id,
                status = %session.status,
                "loaded existing session from durable store"
            );
            if let Err(err) = self.cache.set_session(&session).await {
                warn!(session = %session_id, %err, "failed to re-cache session");
            }
            self.index_active(&session);
            return Ok(session);
        }

        info!(session = %session_id, "auto-creating session from incoming data");
        let session = Session {
            id: session_id.to_string(),
            status: SessionStatus::Active,
            started_at: Utc::now(),
            stopped_at: None,
            saved_at: None,
            total_duration_ms: 0,
            total_data_points: 0,
            metadata: Metadata {
                created_from: "auto-created".to_string(),
                notes: "Automatically created from device/emulator data".to_string(),
                ..Metadata::default()
            },
        };

        self.cache.set_session(&session).await?;
        self.index_active(&session);

        Ok(session)
    }

    fn index_active(&self, session: &Session) {
        if session.status == SessionStatus::Active {
            self.active
                .write()
                .unwrap()
                .insert(session.id.clone(), session.clone());
        }
    }
}
