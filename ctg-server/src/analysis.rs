//! Sink that hands flushed batches to the feature-extraction service.
//!
//! On success the response takes two paths: the session manager's merge
//! hook (errors logged, never propagated) and the processed-batch
//! broadcast consumed by the WebSocket hub and the prediction client.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::broadcast;
use tonic::transport::Channel;
use tracing::{debug, error, info};

use ctg_core::batch::{Batch, Metric, Sink};
use ctg_core::session::{AnalysisUpdate, EventSpan, FilteredDataPoint, SessionManager};
use ctg_proto::analysis::v1::feature_extractor_client::FeatureExtractorClient;
use ctg_proto::analysis::v1::{DataPoint, ProcessBatchRequest, ProcessBatchResponse};

/// Ring capacity of the processed-batch broadcast. Slow subscribers lag
/// and lose the oldest entries rather than stalling the sink.
const PROCESSED_CHANNEL_CAPACITY: usize = 100;

pub struct AnalysisSink {
    client: FeatureExtractorClient<Channel>,
    manager: Option<Arc<SessionManager>>,
    processed_tx: broadcast::Sender<ProcessBatchResponse>,
}

impl AnalysisSink {
    /// Connect to the feature extractor. `manager` is optional so the
    /// sink can run without session state (smoke rigs, benchmarks).
    pub async fn connect(
        addr: &str,
        manager: Option<Arc<SessionManager>>,
    ) -> anyhow::Result<Self> {
        let client = FeatureExtractorClient::connect(addr.to_string()).await?;
        let (processed_tx, _) = broadcast::channel(PROCESSED_CHANNEL_CAPACITY);
        Ok(Self {
            client,
            manager,
            processed_tx,
        })
    }

    /// Subscribe to the stream of analysis responses.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProcessBatchResponse> {
        self.processed_tx.subscribe()
    }
}

#[async_trait::async_trait]
impl Sink for AnalysisSink {
    async fn consume(&self, batch: Batch) -> anyhow::Result<()> {
        debug!(
            session = %batch.key.session_id,
            metric = batch.key.metric.label(),
            points = batch.points.len(),
            "sending batch to feature extractor"
        );

        let request = batch_request(&batch);
        let mut client = self.client.clone();
        let response = client.process_batch(request).await?.into_inner();

        if let Some(manager) = &self.manager {
            if let Err(err) = manager.apply_analysis(&analysis_update(&response)).await {
                error!(session = %response.session_id, %err, "session merge failed");
            }
        }

        info!(
            session = %response.session_id,
            stv = response.stv,
            ltv = response.ltv,
            baseline = response.baseline_heart_rate,
            "batch processed"
        );

        if self.processed_tx.send(response).is_err() {
            debug!("no subscribers for processed batches");
        }

        Ok(())
    }
}

/// Shape a flushed batch into the analysis request: FHR points become
/// `bpm_data`, UC points `uterus_data`, timestamps ms → seconds.
fn batch_request(batch: &Batch) -> ProcessBatchRequest {
    let mut request = ProcessBatchRequest {
        session_id: batch.key.session_id.clone(),
        batch_ts_ms: Utc::now().timestamp_millis() as u64,
        bpm_data: Vec::new(),
        uterus_data: Vec::new(),
    };

    for point in &batch.points {
        let data_point = DataPoint::new(point.ts_ms as f64 / 1000.0, f64::from(point.value));
        match batch.key.metric {
            Metric::Fhr => request.bpm_data.push(data_point),
            Metric::Uc => request.uterus_data.push(data_point),
        }
    }

    request
}

/// Lower the wire response into the domain shape the manager merges.
pub fn analysis_update(response: &ProcessBatchResponse) -> AnalysisUpdate {
    AnalysisUpdate {
        session_id: response.session_id.clone(),
        batch_ts_ms: response.batch_ts_ms,
        stv: response.stv,
        ltv: response.ltv,
        baseline_heart_rate: response.baseline_heart_rate,
        total_accelerations: response.total_accelerations,
        total_decelerations: response.total_decelerations,
        late_decelerations: response.late_decelerations,
        late_deceleration_ratio: response.late_deceleration_ratio,
        total_contractions: response.total_contractions,
        accel_decel_ratio: response.accel_decel_ratio,
        stv_trend: response.stv_trend,
        bpm_trend: response.bpm_trend,
        data_points: response.data_points,
        time_span_sec: response.time_span_sec,
        accelerations: response
            .accelerations
            .iter()
            .map(|span| EventSpan {
                start: span.start,
                end: span.end,
                duration: span.duration,
                amplitude: span.amplitude,
                is_late: false,
            })
            .collect(),
        decelerations: response
            .decelerations
            .iter()
            .map(|span| EventSpan {
                start: span.start,
                end: span.end,
                duration: span.duration,
                amplitude: span.amplitude,
                is_late: span.is_late,
            })
            .collect(),
        contractions: response
            .contractions
            .iter()
            .map(|span| EventSpan {
                start: span.start,
                end: span.end,
                duration: span.duration,
                amplitude: span.amplitude,
                is_late: false,
            })
            .collect(),
        stvs: response.stvs.clone(),
        stvs_window_duration: response.stvs_window_duration,
        ltvs: response.ltvs.clone(),
        ltvs_window_duration: response.ltvs_window_duration,
        filtered_bpm: response
            .filtered_bpm_batch
            .iter()
            .map(|point| FilteredDataPoint {
                time_sec: point.time_sec,
                value: point.value,
            })
            .collect(),
        filtered_uterus: response
            .filtered_uterus_batch
            .iter()
            .map(|point| FilteredDataPoint {
                time_sec: point.time_sec,
                value: point.value,
            })
            .collect(),
    }
}
