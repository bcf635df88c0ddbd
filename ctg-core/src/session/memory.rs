//! In-memory stand-ins for the cache and durable store.
//!
//! Used by tests and by deployments that run the receiver without
//! backing infrastructure (demo rigs, CI). Semantics match the real
//! adapters: last-write-wins filtered traces, append-only catalogues,
//! prefix-wide delete.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use ordered_float::OrderedFloat;

use super::store::{CacheStore, SessionRepository, StoreError};
use super::types::{
    EventKind, FilteredDataPoint, Session, SessionData, SessionEvent, SessionMetrics, SeriesKind,
    TimeSeriesPoint, TraceKind,
};

#[derive(Default)]
struct CacheInner {
    sessions: HashMap<String, Session>,
    ttls: HashMap<String, i64>,
    metrics: HashMap<String, SessionMetrics>,
    events: HashMap<(String, EventKind), Vec<SessionEvent>>,
    series: HashMap<(String, SeriesKind), Vec<TimeSeriesPoint>>,
    filtered: HashMap<(String, TraceKind), BTreeMap<OrderedFloat<f64>, f64>>,
}

/// Hash-map backed [`CacheStore`].
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<CacheInner>,
}

impl MemoryCache {
    /// TTL recorded for a session by [`CacheStore::expire_session`], if
    /// any. Test visibility only; nothing actually expires.
    #[must_use]
    pub fn ttl_seconds(&self, session_id: &str) -> Option<i64> {
        self.inner.lock().unwrap().ttls.get(session_id).copied()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn set_session(&self, session: &Session) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn session(&self, session_id: &str) -> Result<Session, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(session_id);
        inner.ttls.remove(session_id);
        inner.metrics.remove(session_id);
        inner.events.retain(|(id, _), _| id != session_id);
        inner.series.retain(|(id, _), _| id != session_id);
        inner.filtered.retain(|(id, _), _| id != session_id);
        Ok(())
    }

    async fn expire_session(&self, session_id: &str, ttl_seconds: i64) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .ttls
            .insert(session_id.to_string(), ttl_seconds);
        Ok(())
    }

    async fn set_metrics(&self, metrics: &SessionMetrics) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .metrics
            .insert(metrics.session_id.clone(), metrics.clone());
        Ok(())
    }

    async fn metrics(&self, session_id: &str) -> Result<SessionMetrics, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .metrics
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::MetricsNotFound(session_id.to_string()))
    }

    async fn append_events(
        &self,
        session_id: &str,
        events: &[SessionEvent],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        for event in events {
            inner
                .events
                .entry((session_id.to_string(), event.kind))
                .or_default()
                .push(event.clone());
        }
        Ok(())
    }

    async fn events(
        &self,
        session_id: &str,
        kind: EventKind,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .events
            .get(&(session_id.to_string(), kind))
            .cloned()
            .unwrap_or_default())
    }

    async fn all_events(&self, session_id: &str) -> Result<Vec<SessionEvent>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut all = Vec::new();
        for kind in EventKind::ALL {
            if let Some(events) = inner.events.get(&(session_id.to_string(), kind)) {
                all.extend(events.iter().cloned());
            }
        }
        Ok(all)
    }

    async fn event_exists(
        &self,
        session_id: &str,
        kind: EventKind,
        start_time: f64,
    ) -> Result<bool, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .events
            .get(&(session_id.to_string(), kind))
            .is_some_and(|events| events.iter().any(|e| e.start_time == start_time)))
    }

    async fn append_time_series(
        &self,
        session_id: &str,
        kind: SeriesKind,
        points: &[TimeSeriesPoint],
    ) -> Result<(), StoreError> {
        self.inner
            .lock()
            .unwrap()
            .series
            .entry((session_id.to_string(), kind))
            .or_default()
            .extend(points.iter().cloned());
        Ok(())
    }

    async fn time_series(
        &self,
        session_id: &str,
        kind: SeriesKind,
    ) -> Result<Vec<TimeSeriesPoint>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .series
            .get(&(session_id.to_string(), kind))
            .cloned()
            .unwrap_or_default())
    }

    async fn time_series_len(
        &self,
        session_id: &str,
        kind: SeriesKind,
    ) -> Result<usize, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .series
            .get(&(session_id.to_string(), kind))
            .map_or(0, Vec::len))
    }

    async fn update_filtered(
        &self,
        session_id: &str,
        kind: TraceKind,
        points: &[FilteredDataPoint],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let trace = inner
            .filtered
            .entry((session_id.to_string(), kind))
            .or_default();
        for point in points {
            trace.insert(OrderedFloat(point.time_sec), point.value);
        }
        Ok(())
    }

    async fn filtered(
        &self,
        session_id: &str,
        kind: TraceKind,
    ) -> Result<Vec<FilteredDataPoint>, StoreError> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .filtered
            .get(&(session_id.to_string(), kind))
            .map(|trace| {
                trace
                    .iter()
                    .map(|(time_sec, value)| FilteredDataPoint {
                        time_sec: time_sec.into_inner(),
                        value: *value,
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn session_data(&self, session_id: &str) -> Result<SessionData, StoreError> {
        let session = self.session(session_id).await?;
        Ok(SessionData {
            session,
            metrics: self.metrics(session_id).await.ok(),
            events: self.all_events(session_id).await.unwrap_or_default(),
            time_series_stv: self
                .time_series(session_id, SeriesKind::Stv)
                .await
                .unwrap_or_default(),
            time_series_ltv: self
                .time_series(session_id, SeriesKind::Ltv)
                .await
                .unwrap_or_default(),
            filtered_bpm_data: self
                .filtered(session_id, TraceKind::Bpm)
                .await
                .unwrap_or_default(),
            filtered_uterus_data: self
                .filtered(session_id, TraceKind::Uterus)
                .await
                .unwrap_or_default(),
        })
    }
}

#[derive(Default)]
struct RepoInner {
    sessions: HashMap<String, Session>,
    snapshots: HashMap<String, SessionData>,
}

/// Hash-map backed [`SessionRepository`].
#[derive(Default)]
pub struct MemoryRepository {
    inner: Mutex<RepoInner>,
}

impl MemoryRepository {
    /// Seed a session directly, bypassing the save path.
    pub fn insert_session(&self, session: Session) {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .insert(session.id.clone(), session);
    }

    /// The last snapshot written for a session, if any.
    #[must_use]
    pub fn saved_data(&self, session_id: &str) -> Option<SessionData> {
        self.inner.lock().unwrap().snapshots.get(session_id).cloned()
    }
}

#[async_trait]
impl SessionRepository for MemoryRepository {
    async fn session(&self, session_id: &str) -> Result<Session, StoreError> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))
    }

    async fn list_sessions(&self, limit: i64, offset: i64) -> Result<Vec<Session>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut sessions: Vec<Session> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(session_id);
        inner.snapshots.remove(session_id);
        Ok(())
    }

    async fn save_session_data(&self, data: &SessionData) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .sessions
            .insert(data.session.id.clone(), data.session.clone());
        inner
            .snapshots
            .insert(data.session.id.clone(), data.clone());
        Ok(())
    }
}
