//! Postgres-backed [`SessionRepository`].
//!
//! Five tables: `sessions`, `session_metrics` (upsert on session_id),
//! `session_events`, `session_timeseries`, and `session_raw_data` for
//! the filtered traces. Save writes all of them in one transaction;
//! delete cascades across them explicitly in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::Row;

use super::store::{SessionRepository, StoreError};
use super::types::{
    FilteredDataPoint, Metadata, Session, SessionData, SessionStatus, TimeSeriesPoint,
};

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    /// Connect with the pool sizing the receiver runs in production.
    pub async fn connect(dsn: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(25)
            .connect(dsn)
            .await?;
        Ok(Self { pool })
    }

    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn session_from_row(row: &PgRow) -> Result<Session, StoreError> {
    let status_text: String = row.try_get("status")?;
    let status: SessionStatus =
        serde_json::from_value(serde_json::Value::String(status_text))?;
    let metadata: Json<Metadata> = row.try_get("metadata")?;

    Ok(Session {
        id: row.try_get("id")?,
        status,
        started_at: row.try_get("started_at")?,
        stopped_at: row.try_get("stopped_at")?,
        saved_at: row.try_get("saved_at")?,
        total_duration_ms: row.try_get("total_duration_ms")?,
        total_data_points: row.try_get("total_data_points")?,
        metadata: metadata.0,
    })
}

const SESSION_COLUMNS: &str =
    "id, status, started_at, stopped_at, saved_at, total_duration_ms, total_data_points, metadata";

#[async_trait]
impl SessionRepository for PostgresRepository {
    async fn session(&self, session_id: &str) -> Result<Session, StoreError> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => session_from_row(&row),
            None => Err(StoreError::SessionNotFound(session_id.to_string())),
        }
    }

    async fn list_sessions(&self, limit: i64, offset: i64) -> Result<Vec<Session>, StoreError> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY started_at DESC LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query(&query)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await?;

        // Rows that fail to decode are skipped rather than failing the
        // whole listing.
        Ok(rows
            .iter()
            .filter_map(|row| session_from_row(row).ok())
            .collect())
    }

    async fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        for table in [
            "DELETE FROM session_raw_data WHERE session_id = $1",
            "DELETE FROM session_timeseries WHERE session_id = $1",
            "DELETE FROM session_events WHERE session_id = $1",
            "DELETE FROM session_metrics WHERE session_id = $1",
            "DELETE FROM sessions WHERE id = $1",
        ] {
            sqlx::query(table).bind(session_id).execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn save_session_data(&self, data: &SessionData) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let session = &data.session;

        sqlx::query(
            "INSERT INTO sessions \
                 (id, status, started_at, stopped_at, saved_at, total_duration_ms, total_data_points, metadata) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             ON CONFLICT (id) DO UPDATE SET \
                 status = EXCLUDED.status, \
                 stopped_at = EXCLUDED.stopped_at, \
                 saved_at = EXCLUDED.saved_at, \
                 total_duration_ms = EXCLUDED.total_duration_ms, \
                 total_data_points = EXCLUDED.total_data_points, \
                 metadata = EXCLUDED.metadata",
        )
        .bind(&session.id)
        .bind(session.status.as_str())
        .bind(session.started_at)
        .bind(session.stopped_at)
        .bind(session.saved_at)
        .bind(session.total_duration_ms)
        .bind(session.total_data_points)
        .bind(Json(&session.metadata))
        .execute(&mut *tx)
        .await?;

        if let Some(metrics) = &data.metrics {
            sqlx::query(
                "INSERT INTO session_metrics ( \
                     session_id, stv, ltv, baseline_heart_rate, \
                     total_accelerations, total_decelerations, late_decelerations, late_deceleration_ratio, \
                     total_contractions, accel_decel_ratio, stv_trend, bpm_trend, \
                     data_points, time_span_sec, updated_at \
                 ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
                 ON CONFLICT (session_id) DO UPDATE SET \
                     stv = EXCLUDED.stv, \
                     ltv = EXCLUDED.ltv, \
                     baseline_heart_rate = EXCLUDED.baseline_heart_rate, \
                     total_accelerations = EXCLUDED.total_accelerations, \
                     total_decelerations = EXCLUDED.total_decelerations, \
                     late_decelerations = EXCLUDED.late_decelerations, \
                     late_deceleration_ratio = EXCLUDED.late_deceleration_ratio, \
                     total_contractions = EXCLUDED.total_contractions, \
                     accel_decel_ratio = EXCLUDED.accel_decel_ratio, \
                     stv_trend = EXCLUDED.stv_trend, \
                     bpm_trend = EXCLUDED.bpm_trend, \
                     data_points = EXCLUDED.data_points, \
                     time_span_sec = EXCLUDED.time_span_sec, \
                     updated_at = EXCLUDED.updated_at",
            )
            .bind(&metrics.session_id)
            .bind(metrics.stv)
            .bind(metrics.ltv)
            .bind(metrics.baseline_heart_rate)
            .bind(metrics.total_accelerations)
            .bind(metrics.total_decelerations)
            .bind(metrics.late_decelerations)
            .bind(metrics.late_deceleration_ratio)
            .bind(metrics.total_contractions)
            .bind(metrics.accel_decel_ratio)
            .bind(metrics.stv_trend)
            .bind(metrics.bpm_trend)
            .bind(metrics.data_points)
            .bind(metrics.time_span_sec)
            .bind(metrics.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        for event in &data.events {
            sqlx::query(
                "INSERT INTO session_events \
                     (session_id, event_type, start_time, end_time, duration, amplitude, is_late, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&event.session_id)
            .bind(event.kind.as_str())
            .bind(event.start_time)
            .bind(event.end_time)
            .bind(event.duration)
            .bind(event.amplitude)
            .bind(event.is_late)
            .bind(event.created_at)
            .execute(&mut *tx)
            .await?;
        }

        for point in data
            .time_series_stv
            .iter()
            .chain(data.time_series_ltv.iter())
        {
            insert_time_series_point(&mut tx, point).await?;
        }

        insert_raw_trace(&mut tx, &session.id, "FHR", &data.filtered_bpm_data).await?;
        insert_raw_trace(&mut tx, &session.id, "UC", &data.filtered_uterus_data).await?;

        tx.commit().await?;
        Ok(())
    }
}

async fn insert_time_series_point(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    point: &TimeSeriesPoint,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO session_timeseries (session_id, metric_type, time_index, value, window_duration) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(&point.session_id)
    .bind(point.kind.as_str())
    .bind(point.time_index)
    .bind(point.value)
    .bind(point.window_duration)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_raw_trace(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    session_id: &str,
    metric_type: &str,
    points: &[FilteredDataPoint],
) -> Result<(), StoreError> {
    if points.is_empty() {
        return Ok(());
    }

    let now: DateTime<Utc> = Utc::now();
    sqlx::query(
        "INSERT INTO session_raw_data (session_id, batch_ts_ms, metric_type, data, created_at) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(session_id)
    .bind(now.timestamp_millis())
    .bind(metric_type)
    .bind(Json(points))
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
