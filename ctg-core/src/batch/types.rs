//! Batch data model and the sink capability.

use thiserror::Error;

/// Physiological channel a sample belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    /// Fetal heart rate, beats/min, sampled ~4 Hz.
    Fhr,
    /// Uterine contraction pressure.
    Uc,
}

impl Metric {
    /// Short lowercase label for logs and keys.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Fhr => "fhr",
            Self::Uc => "uc",
        }
    }
}

/// A sample as it arrives off the wire, before validation.
///
/// `metric` is `None` when the wire value did not decode to a known
/// channel; validation rejects it.
#[derive(Debug, Clone)]
pub struct RawSample {
    pub session_id: String,
    pub ts_ms: u64,
    pub metric: Option<Metric>,
    pub value: f32,
}

impl RawSample {
    #[must_use]
    pub fn new(session_id: impl Into<String>, ts_ms: u64, metric: Metric, value: f32) -> Self {
        Self {
            session_id: session_id.into(),
            ts_ms,
            metric: Some(metric),
            value,
        }
    }
}

/// Why a sample was rejected. Rejections are counted and logged, never
/// surfaced to the stream.
#[derive(Debug, Error)]
pub enum InvalidSample {
    #[error("empty session_id")]
    EmptySessionId,
    #[error("unrecognized metric")]
    UnknownMetric,
    #[error("zero timestamp")]
    ZeroTimestamp,
    #[error("non-finite value: {0}")]
    NonFiniteValue(f32),
}

/// One accepted data point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub ts_ms: u64,
    pub value: f32,
}

/// Identifies the open batch a sample accumulates into.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    pub session_id: String,
    pub metric: Metric,
}

/// A flushed group of same-key points, in arrival order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub key: BatchKey,
    /// Minimum point timestamp.
    pub t0_ms: u64,
    /// Maximum point timestamp.
    pub t1_ms: u64,
    pub points: Vec<Point>,
}

impl Batch {
    #[must_use]
    pub fn span_ms(&self) -> u64 {
        self.t1_ms.saturating_sub(self.t0_ms)
    }
}

/// Consumer of flushed batches. The pipeline is best-effort at this seam:
/// callers log errors and move on.
#[async_trait::async_trait]
pub trait Sink: Send + Sync {
    async fn consume(&self, batch: Batch) -> anyhow::Result<()>;
}

/// Open batch being accumulated for one key. Reset in place on flush so
/// the points buffer keeps its capacity.
#[derive(Debug)]
pub(super) struct OpenBatch {
    pub key: BatchKey,
    pub t0_ms: u64,
    pub t1_ms: u64,
    pub points: Vec<Point>,
    /// Timestamp of the most recently appended point; staleness is judged
    /// against wall clock by the timer flusher.
    pub last_added_ms: i64,
}

impl OpenBatch {
    pub fn new(key: BatchKey) -> Self {
        Self {
            key,
            t0_ms: 0,
            t1_ms: 0,
            points: Vec::new(),
            last_added_ms: 0,
        }
    }

    pub fn push(&mut self, point: Point) {
        if self.points.is_empty() {
            self.t0_ms = point.ts_ms;
            self.t1_ms = point.ts_ms;
        } else {
            self.t0_ms = self.t0_ms.min(point.ts_ms);
            self.t1_ms = self.t1_ms.max(point.ts_ms);
        }
        self.last_added_ms = point.ts_ms as i64;
        self.points.push(point);
    }

    /// Span the batch would cover if `ts_ms` were appended.
    pub fn span_with(&self, ts_ms: u64) -> i64 {
        let t0 = self.t0_ms.min(ts_ms) as i64;
        let t1 = self.t1_ms.max(ts_ms) as i64;
        t1 - t0
    }

    pub fn snapshot(&self) -> Batch {
        Batch {
            key: self.key.clone(),
            t0_ms: self.t0_ms,
            t1_ms: self.t1_ms,
            points: self.points.clone(),
        }
    }

    pub fn reset(&mut self) {
        self.t0_ms = 0;
        self.t1_ms = 0;
        self.points.clear();
        self.last_added_ms = 0;
    }
}
