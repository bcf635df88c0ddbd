//! Protocol buffer definitions for the ctg telemetry pipeline.
//!
//! Three wire surfaces are generated here: the device-facing telemetry
//! ingest stream, the feature-extraction analysis service, and the ML
//! prediction service. Hand-written helpers below keep call sites terse.

/// Device-facing ingest stream: samples in, periodic acks out.
pub mod telemetry {
    pub mod v1 {
        tonic::include_proto!("ctg.telemetry.v1");
    }
}

/// Feature-extraction request/response pair.
pub mod analysis {
    pub mod v1 {
        tonic::include_proto!("ctg.analysis.v1");
    }
}

/// ML prediction request/response pair.
pub mod prediction {
    pub mod v1 {
        tonic::include_proto!("ctg.prediction.v1");
    }
}

use telemetry::v1::{Metric, Sample};

impl Sample {
    /// Create an FHR sample.
    pub fn fhr(session_id: impl Into<String>, ts_ms: u64, value: f32) -> Self {
        Self {
            session_id: session_id.into(),
            ts_ms,
            metric: Metric::Fhr as i32,
            value,
        }
    }

    /// Create a UC sample.
    pub fn uc(session_id: impl Into<String>, ts_ms: u64, value: f32) -> Self {
        Self {
            session_id: session_id.into(),
            ts_ms,
            metric: Metric::Uc as i32,
            value,
        }
    }

    /// Decode the metric field, mapping unknown values to `Unspecified`.
    #[must_use]
    pub fn metric_kind(&self) -> Metric {
        Metric::try_from(self.metric).unwrap_or(Metric::Unspecified)
    }
}

impl analysis::v1::DataPoint {
    /// Point on a trace, time in seconds.
    #[must_use]
    pub const fn new(time_sec: f64, value: f64) -> Self {
        Self { time_sec, value }
    }
}

impl Metric {
    /// Short lowercase label used in logs and batch keys.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Fhr => "fhr",
            Self::Uc => "uc",
            Self::Unspecified => "unspecified",
        }
    }
}
