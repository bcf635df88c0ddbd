//! WebSocket fan-out of processed batches and predictions.
//!
//! Every connected client receives every broadcast; the `session_id`
//! query parameter is recorded as a tag, not a filter. Each client owns
//! a bounded outbound queue — a slow reader loses frames, it never
//! stalls the pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use ctg_proto::analysis::v1::{Acceleration, Contraction, Deceleration, ProcessBatchResponse};
use ctg_proto::prediction::v1::PredictResponse;

use crate::api::ApiState;

/// Bound on each client's outbound frame queue.
const CLIENT_QUEUE_CAPACITY: usize = 256;

struct Client {
    session_id: String,
    outbound: mpsc::Sender<String>,
}

/// Connected-client registry plus the last prediction seen per session.
pub struct Hub {
    clients: RwLock<HashMap<u64, Client>>,
    next_client_id: AtomicU64,
    predictions: RwLock<HashMap<String, f64>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            predictions: RwLock::new(HashMap::new()),
        }
    }

    /// Add a client and hand back its id and outbound queue.
    pub fn register(&self, session_id: String) -> (u64, mpsc::Receiver<String>) {
        let (outbound, receiver) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().unwrap().insert(
            client_id,
            Client {
                session_id: session_id.clone(),
                outbound,
            },
        );
        info!(client = client_id, session = %session_id, "websocket client registered");
        (client_id, receiver)
    }

    pub fn unregister(&self, client_id: u64) {
        if self.clients.write().unwrap().remove(&client_id).is_some() {
            info!(client = client_id, "websocket client unregistered");
        }
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.clients.read().unwrap().len()
    }

    /// Record the newest prediction for a session.
    pub fn update_prediction(&self, session_id: &str, prediction: f64) {
        self.predictions
            .write()
            .unwrap()
            .insert(session_id.to_string(), prediction);
        debug!(session = session_id, prediction, "prediction updated");
    }

    /// Last prediction recorded for a session, zero before the first one
    /// arrives.
    #[must_use]
    pub fn last_prediction(&self, session_id: &str) -> f64 {
        self.predictions
            .read()
            .unwrap()
            .get(session_id)
            .copied()
            .unwrap_or(0.0)
    }

    /// Reshape an analysis response and enqueue it on every client.
    /// A full client queue drops this frame for that client only.
    pub fn broadcast_processed(&self, response: &ProcessBatchResponse) {
        let frame = match serde_json::to_string(&self.processed_frame(response)) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(%err, "failed to serialize broadcast frame");
                return;
            }
        };

        let clients = self.clients.read().unwrap();
        for (client_id, client) in clients.iter() {
            if client.outbound.try_send(frame.clone()).is_err() {
                warn!(
                    client = client_id,
                    session = %client.session_id,
                    "client queue full, frame dropped"
                );
            }
        }
    }

    fn processed_frame(&self, response: &ProcessBatchResponse) -> ProcessedData {
        let mut bpm = FilteredBatchData::default();
        for point in &response.filtered_bpm_batch {
            bpm.time_sec.push(point.time_sec);
            bpm.value.push(point.value);
        }

        let mut uterus = FilteredBatchData::default();
        for point in &response.filtered_uterus_batch {
            uterus.time_sec.push(point.time_sec);
            uterus.value.push(point.value);
        }

        ProcessedData {
            message: "Done".to_string(),
            prediction: self.last_prediction(&response.session_id),
            session_id: response.session_id.clone(),
            status: "processed".to_string(),
            records: RecordsData {
                stv: response.stv,
                ltv: response.ltv,
                baseline_heart_rate: response.baseline_heart_rate,
                accelerations: response.accelerations.clone(),
                decelerations: response.decelerations.clone(),
                contractions: response.contractions.clone(),
                stvs: response.stvs.clone(),
                stvs_window_duration: response.stvs_window_duration,
                ltvs: response.ltvs.clone(),
                ltvs_window_duration: response.ltvs_window_duration,
                total_decelerations: response.total_decelerations,
                late_decelerations: response.late_decelerations,
                late_deceleration_ratio: response.late_deceleration_ratio,
                total_accelerations: response.total_accelerations,
                accel_decel_ratio: response.accel_decel_ratio,
                total_contractions: response.total_contractions,
                stv_trend: response.stv_trend,
                bpm_trend: response.bpm_trend,
                data_points: response.data_points,
                time_span_sec: response.time_span_sec,
                filtered_bpm_batch: bpm,
                filtered_uterus_batch: uterus,
            },
        }
    }
}

/// Frame shape delivered to UI clients.
#[derive(Debug, Serialize)]
struct ProcessedData {
    message: String,
    prediction: f64,
    records: RecordsData,
    session_id: String,
    status: String,
}

#[derive(Debug, Serialize)]
struct RecordsData {
    stv: f64,
    ltv: f64,
    baseline_heart_rate: f64,
    accelerations: Vec<Acceleration>,
    decelerations: Vec<Deceleration>,
    contractions: Vec<Contraction>,
    stvs: Vec<f64>,
    stvs_window_duration: f64,
    ltvs: Vec<f64>,
    ltvs_window_duration: f64,
    total_decelerations: i32,
    late_decelerations: i32,
    late_deceleration_ratio: f64,
    total_accelerations: i32,
    accel_decel_ratio: f64,
    total_contractions: i32,
    stv_trend: f64,
    bpm_trend: f64,
    data_points: i32,
    time_span_sec: f64,
    filtered_bpm_batch: FilteredBatchData,
    filtered_uterus_batch: FilteredBatchData,
}

/// Parallel-array trace window, the shape the frontend plots directly.
#[derive(Debug, Default, Serialize)]
struct FilteredBatchData {
    time_sec: Vec<f64>,
    value: Vec<f64>,
}

/// Drains the processed-batch broadcast into client queues.
pub async fn run_processed_consumer(
    hub: Arc<Hub>,
    mut processed_rx: broadcast::Receiver<ProcessBatchResponse>,
) {
    loop {
        match processed_rx.recv().await {
            Ok(response) => hub.broadcast_processed(&response),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "hub lagged behind processed batches");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Keeps the per-session prediction table current.
pub async fn run_prediction_consumer(
    hub: Arc<Hub>,
    mut prediction_rx: mpsc::Receiver<PredictResponse>,
) {
    while let Some(prediction) = prediction_rx.recv().await {
        hub.update_prediction(&prediction.session_id, prediction.prediction);
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    session_id: Option<String>,
}

/// `GET /ws?session_id=` upgrade endpoint.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsQuery>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    let session_id = params.session_id.unwrap_or_else(|| "default".to_string());
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| handle_socket(socket, hub, session_id))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>, session_id: String) {
    let (client_id, mut outbound) = hub.register(session_id);
    let (mut sender, mut receiver) = socket.split();

    // Writer task: any send failure tears this client down.
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    // Clients only listen; inbound traffic is drained until close.
    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    hub.unregister(client_id);
    writer.abort();
}

#[cfg(test)]
mod tests {
    use ctg_proto::analysis::v1::DataPoint;

    use super::*;

    fn response() -> ProcessBatchResponse {
        ProcessBatchResponse {
            session_id: "s1".to_string(),
            stv: 5.2,
            ltv: 14.8,
            baseline_heart_rate: 140.0,
            decelerations: vec![Deceleration {
                start: 10.0,
                end: 18.0,
                duration: 8.0,
                amplitude: -20.0,
                is_late: true,
            }],
            stvs: vec![5.0, 5.2],
            stvs_window_duration: 60.0,
            total_decelerations: 1,
            late_decelerations: 1,
            late_deceleration_ratio: 1.0,
            data_points: 80,
            time_span_sec: 20.0,
            filtered_bpm_batch: vec![
                DataPoint::new(1.0, 120.0),
                DataPoint::new(1.25, 121.0),
            ],
            ..ProcessBatchResponse::default()
        }
    }

    #[test]
    fn frame_reshapes_traces_into_parallel_arrays() {
        let hub = Hub::new();
        let frame = serde_json::to_value(hub.processed_frame(&response())).unwrap();

        assert_eq!(frame["message"], "Done");
        assert_eq!(frame["status"], "processed");
        assert_eq!(frame["session_id"], "s1");
        assert_eq!(frame["prediction"], 0.0);
        assert_eq!(frame["records"]["stv"], 5.2);
        assert_eq!(
            frame["records"]["filtered_bpm_batch"]["time_sec"],
            serde_json::json!([1.0, 1.25])
        );
        assert_eq!(
            frame["records"]["filtered_bpm_batch"]["value"],
            serde_json::json!([120.0, 121.0])
        );
        assert_eq!(frame["records"]["decelerations"][0]["is_late"], true);
    }

    #[test]
    fn frame_carries_last_prediction_for_the_session() {
        let hub = Hub::new();
        hub.update_prediction("s1", 0.87);
        hub.update_prediction("other", 0.12);

        let frame = serde_json::to_value(hub.processed_frame(&response())).unwrap();
        assert_eq!(frame["prediction"], 0.87);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_client() {
        let hub = Hub::new();
        let (_a, mut rx_a) = hub.register("s1".to_string());
        let (_b, mut rx_b) = hub.register("other".to_string());

        hub.broadcast_processed(&response());

        let frame_a = rx_a.try_recv().unwrap();
        let frame_b = rx_b.try_recv().unwrap();
        // Global fan-out: the tag does not filter.
        assert_eq!(frame_a, frame_b);
        assert!(frame_a.contains("\"session_id\":\"s1\""));
    }

    #[tokio::test]
    async fn unregistered_client_stops_receiving() {
        let hub = Hub::new();
        let (id, mut rx) = hub.register("s1".to_string());
        assert_eq!(hub.client_count(), 1);

        hub.unregister(id);
        assert_eq!(hub.client_count(), 0);

        hub.broadcast_processed(&response());
        assert!(rx.try_recv().is_err());
    }
}
