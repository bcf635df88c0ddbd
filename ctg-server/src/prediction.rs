//! Prediction client: distills analysis responses into scalar features
//! and fires the ML RPC without blocking the processing path.

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tonic::transport::Channel;
use tracing::{error, info, warn};

use ctg_proto::analysis::v1::ProcessBatchResponse;
use ctg_proto::prediction::v1::predictor_client::PredictorClient;
use ctg_proto::prediction::v1::{PredictRequest, PredictResponse};

/// Bound on the outbound predictions queue.
const PREDICTION_CHANNEL_CAPACITY: usize = 100;

pub struct PredictionClient {
    client: PredictorClient<Channel>,
    prediction_tx: mpsc::Sender<PredictResponse>,
}

impl PredictionClient {
    /// Connect to the ML service. Returns the client and the receiving
    /// end of the predictions queue.
    pub async fn connect(addr: &str) -> anyhow::Result<(Self, mpsc::Receiver<PredictResponse>)> {
        let client = PredictorClient::connect(addr.to_string()).await?;
        let (prediction_tx, prediction_rx) = mpsc::channel(PREDICTION_CHANNEL_CAPACITY);
        Ok((
            Self {
                client,
                prediction_tx,
            },
            prediction_rx,
        ))
    }

    /// Consume the processed-batch stream, requesting a prediction for
    /// each response. A lagged subscription skips to the newest entries.
    pub fn spawn_consumer(
        self,
        mut processed_rx: broadcast::Receiver<ProcessBatchResponse>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match processed_rx.recv().await {
                    Ok(features) => self.request_prediction(&features),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "prediction consumer lagged, skipping batches");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Fire the RPC on its own task. Errors become a zero prediction
    /// with `status = "error"` so downstream consumers always hear back.
    fn request_prediction(&self, features: &ProcessBatchResponse) {
        let request = predict_request(features);
        let mut client = self.client.clone();
        let prediction_tx = self.prediction_tx.clone();

        tokio::spawn(async move {
            let session_id = request.session_id.clone();
            let batch_ts_ms = request.batch_ts_ms;

            let response = match client.predict_from_features(request).await {
                Ok(response) => response.into_inner(),
                Err(status) => {
                    error!(session = %session_id, %status, "prediction request failed");
                    PredictResponse {
                        session_id,
                        batch_ts_ms,
                        prediction: 0.0,
                        status: "error".to_string(),
                        message: status.to_string(),
                        has_enough_data: false,
                    }
                }
            };

            info!(
                session = %response.session_id,
                prediction = response.prediction,
                status = %response.status,
                "prediction ready"
            );

            if prediction_tx.try_send(response).is_err() {
                warn!("prediction channel full, dropping prediction");
            }
        });
    }
}

/// Scalar features the ML model consumes, straight off the analysis
/// response.
fn predict_request(features: &ProcessBatchResponse) -> PredictRequest {
    PredictRequest {
        session_id: features.session_id.clone(),
        batch_ts_ms: features.batch_ts_ms,
        stv: features.stv,
        ltv: features.ltv,
        baseline_heart_rate: features.baseline_heart_rate,
        total_decelerations: features.total_decelerations,
        late_decelerations: features.late_decelerations,
        late_deceleration_ratio: features.late_deceleration_ratio,
        total_accelerations: features.total_accelerations,
        accel_decel_ratio: features.accel_decel_ratio,
        total_contractions: features.total_contractions,
        stv_trend: features.stv_trend,
        bpm_trend: features.bpm_trend,
        data_points: features.data_points,
        time_span_sec: features.time_span_sec,
    }
}
