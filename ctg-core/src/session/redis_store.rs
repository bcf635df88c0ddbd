//! Redis-backed [`CacheStore`].
//!
//! Key layout, all namespaced under the session id:
//!
//! ```text
//! session:{id}:metadata            serialized session blob
//! session:{id}:features:current    metrics hash
//! session:{id}:events:{type}       per-kind event list (RPUSH/LRANGE)
//! session:{id}:timeseries:{kind}   series list (RPUSH/LRANGE)
//! session:{id}:filtered:{trace}    sorted set scored by time_sec
//! ```
//!
//! Session-wide delete and TTL walk the prefix with SCAN and apply the
//! operation through a pipeline.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::store::{CacheStore, StoreError};
use super::types::{
    EventKind, FilteredDataPoint, Session, SessionData, SessionEvent, SessionMetrics, SeriesKind,
    TimeSeriesPoint, TraceKind,
};

pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Connect and build the shared connection manager. The manager
    /// reconnects internally, so clones are handed to each operation.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::Cache)?;
        let conn = ConnectionManager::new(client).await.map_err(StoreError::Cache)?;
        Ok(Self { conn })
    }

    #[must_use]
    pub fn with_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    async fn scan_session_keys(&self, session_id: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("session:{session_id}:*");
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut iter = conn.scan_match::<_, String>(pattern).await?;
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }
}

fn session_key(session_id: &str) -> String {
    format!("session:{session_id}:metadata")
}

fn metrics_key(session_id: &str) -> String {
    format!("session:{session_id}:features:current")
}

fn events_key(session_id: &str, kind: EventKind) -> String {
    format!("session:{session_id}:events:{}", kind.as_str())
}

fn time_series_key(session_id: &str, kind: SeriesKind) -> String {
    format!("session:{session_id}:timeseries:{}", kind.as_str())
}

fn filtered_key(session_id: &str, kind: TraceKind) -> String {
    format!("session:{session_id}:filtered:{}", kind.as_str())
}

fn parse_f64(fields: &HashMap<String, String>, name: &str) -> f64 {
    fields.get(name).and_then(|v| v.parse().ok()).unwrap_or(0.0)
}

fn parse_i32(fields: &HashMap<String, String>, name: &str) -> i32 {
    fields.get(name).and_then(|v| v.parse().ok()).unwrap_or(0)
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn set_session(&self, session: &Session) -> Result<(), StoreError> {
        let blob = serde_json::to_string(session)?;
        let mut conn = self.conn.clone();
        let _: () = conn.set(session_key(&session.id), blob).await?;
        Ok(())
    }

    async fn session(&self, session_id: &str) -> Result<Session, StoreError> {
        let mut conn = self.conn.clone();
        let blob: Option<String> = conn.get(session_key(session_id)).await?;
        let blob = blob.ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
        Ok(serde_json::from_str(&blob)?)
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let keys = self.scan_session_keys(session_id).await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.del(key).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn expire_session(&self, session_id: &str, ttl_seconds: i64) -> Result<(), StoreError> {
        let keys = self.scan_session_keys(session_id).await?;
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for key in &keys {
            pipe.expire(key, ttl_seconds).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn set_metrics(&self, metrics: &SessionMetrics) -> Result<(), StoreError> {
        // A hash rather than a blob, so individual fields stay readable
        // from redis-cli during a live session.
        let fields: Vec<(&str, String)> = vec![
            ("stv", metrics.stv.to_string()),
            ("ltv", metrics.ltv.to_string()),
            ("baseline_heart_rate", metrics.baseline_heart_rate.to_string()),
            ("total_accelerations", metrics.total_accelerations.to_string()),
            ("total_decelerations", metrics.total_decelerations.to_string()),
            ("late_decelerations", metrics.late_decelerations.to_string()),
            (
                "late_deceleration_ratio",
                metrics.late_deceleration_ratio.to_string(),
            ),
            ("total_contractions", metrics.total_contractions.to_string()),
            ("accel_decel_ratio", metrics.accel_decel_ratio.to_string()),
            ("stv_trend", metrics.stv_trend.to_string()),
            ("bpm_trend", metrics.bpm_trend.to_string()),
            ("data_points", metrics.data_points.to_string()),
            ("time_span_sec", metrics.time_span_sec.to_string()),
            ("updated_at", metrics.updated_at.timestamp().to_string()),
        ];

        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(metrics_key(&metrics.session_id), &fields)
            .await?;
        Ok(())
    }

    async fn metrics(&self, session_id: &str) -> Result<SessionMetrics, StoreError> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn.hgetall(metrics_key(session_id)).await?;
        if fields.is_empty() {
            return Err(StoreError::MetricsNotFound(session_id.to_string()));
        }

        let updated_at = fields
            .get("updated_at")
            .and_then(|v| v.parse::<i64>().ok())
            .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(chrono::Utc::now);

        Ok(SessionMetrics {
            session_id: session_id.to_string(),
            stv: parse_f64(&fields, "stv"),
            ltv: parse_f64(&fields, "ltv"),
            baseline_heart_rate: parse_f64(&fields, "baseline_heart_rate"),
            total_accelerations: parse_i32(&fields, "total_accelerations"),
            total_decelerations: parse_i32(&fields, "total_decelerations"),
            late_decelerations: parse_i32(&fields, "late_decelerations"),
            late_deceleration_ratio: parse_f64(&fields, "late_deceleration_ratio"),
            total_contractions: parse_i32(&fields, "total_contractions"),
            accel_decel_ratio: parse_f64(&fields, "accel_decel_ratio"),
            stv_trend: parse_f64(&fields, "stv_trend"),
            bpm_trend: parse_f64(&fields, "bpm_trend"),
            data_points: parse_i32(&fields, "data_points"),
            time_span_sec: parse_f64(&fields, "time_span_sec"),
            updated_at,
        })
    }

    async fn append_events(
        &self,
        session_id: &str,
        events: &[SessionEvent],
    ) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for event in events {
            let blob = serde_json::to_string(event)?;
            pipe.rpush(events_key(session_id, event.kind), blob).ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn events(
        &self,
        session_id: &str,
        kind: EventKind,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        let mut conn = self.conn.clone();
        let blobs: Vec<String> = conn.lrange(events_key(session_id, kind), 0, -1).await?;
        // Corrupt entries are skipped rather than failing the read.
        Ok(blobs
            .iter()
            .filter_map(|blob| serde_json::from_str(blob).ok())
            .collect())
    }

    async fn all_events(&self, session_id: &str) -> Result<Vec<SessionEvent>, StoreError> {
        let mut all = Vec::new();
        for kind in EventKind::ALL {
            match self.events(session_id, kind).await {
                Ok(events) => all.extend(events),
                Err(_) => continue,
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
        let events = self.events(session_id, kind).await?;
        Ok(events.iter().any(|event| event.start_time == start_time))
    }

    async fn append_time_series(
        &self,
        session_id: &str,
        kind: SeriesKind,
        points: &[TimeSeriesPoint],
    ) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }
        let key = time_series_key(session_id, kind);
        let mut pipe = redis::pipe();
        for point in points {
            let blob = serde_json::to_string(point)?;
            pipe.rpush(&key, blob).ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn time_series(
        &self,
        session_id: &str,
        kind: SeriesKind,
    ) -> Result<Vec<TimeSeriesPoint>, StoreError> {
        let mut conn = self.conn.clone();
        let blobs: Vec<String> = conn.lrange(time_series_key(session_id, kind), 0, -1).await?;
        Ok(blobs
            .iter()
            .filter_map(|blob| serde_json::from_str(blob).ok())
            .collect())
    }

    async fn time_series_len(
        &self,
        session_id: &str,
        kind: SeriesKind,
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(time_series_key(session_id, kind)).await?;
        Ok(len)
    }

    async fn update_filtered(
        &self,
        session_id: &str,
        kind: TraceKind,
        points: &[FilteredDataPoint],
    ) -> Result<(), StoreError> {
        if points.is_empty() {
            return Ok(());
        }
        // Sorted set scored by time_sec: re-submissions of the same
        // second replace the member in place.
        let key = filtered_key(session_id, kind);
        let mut pipe = redis::pipe();
        for point in points {
            let blob = serde_json::to_string(point)?;
            pipe.zadd(&key, blob, point.time_sec).ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn filtered(
        &self,
        session_id: &str,
        kind: TraceKind,
    ) -> Result<Vec<FilteredDataPoint>, StoreError> {
        let mut conn = self.conn.clone();
        let blobs: Vec<String> = conn.zrange(filtered_key(session_id, kind), 0, -1).await?;
        Ok(blobs
            .iter()
            .filter_map(|blob| serde_json::from_str(blob).ok())
            .collect())
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
