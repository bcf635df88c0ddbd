//! Streaming ingest service: samples in, periodic acks out.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt, wrappers::ReceiverStream};
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, warn};

use ctg_core::batch::{Batcher, Metric, RawSample};
use ctg_proto::telemetry::v1::telemetry_ingest_server::TelemetryIngest;
use ctg_proto::telemetry::v1::{Ack, Metric as WireMetric, Sample};

/// Bound on the per-stream ack bookkeeping queue. When full, the sample
/// is still batched; only its ack accounting is skipped.
const ACK_QUEUE_CAPACITY: usize = 100;

pub struct TelemetryService {
    batcher: Arc<Batcher>,
    ack_every_n: u64,
}

impl TelemetryService {
    #[must_use]
    pub fn new(batcher: Arc<Batcher>, ack_every_n: u64) -> Self {
        Self {
            batcher,
            ack_every_n: ack_every_n.max(1),
        }
    }
}

#[tonic::async_trait]
impl TelemetryIngest for TelemetryService {
    type PushSamplesStream = Pin<Box<dyn Stream<Item = Result<Ack, Status>> + Send>>;

    async fn push_samples(
        &self,
        request: Request<Streaming<Sample>>,
    ) -> Result<Response<Self::PushSamplesStream>, Status> {
        info!("ingest stream started");

        let mut stream = request.into_inner();
        let (ack_tx, ack_rx) = mpsc::channel::<String>(ACK_QUEUE_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(32);

        tokio::spawn(ack_worker(ack_rx, out_tx.clone(), self.ack_every_n));

        let batcher = Arc::clone(&self.batcher);
        tokio::spawn(async move {
            while let Some(result) = stream.next().await {
                match result {
                    Ok(sample) => {
                        batcher.add(&raw_sample(&sample));
                        if ack_tx.try_send(sample.session_id).is_err() {
                            warn!("ack queue full, skipping ack bookkeeping for sample");
                        }
                    }
                    Err(status) => {
                        warn!(%status, "ingest stream receive error");
                        let _ = out_tx.send(Err(status)).await;
                        break;
                    }
                }
            }
            info!("ingest stream finished");
            // ack_tx drops here, which winds the ack worker down.
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(out_rx))))
    }
}

/// Lower a wire sample for the validator. Unknown metric values become
/// `None` and are rejected there, keeping the drop counter accurate.
fn raw_sample(sample: &Sample) -> RawSample {
    let metric = match WireMetric::try_from(sample.metric) {
        Ok(WireMetric::Fhr) => Some(Metric::Fhr),
        Ok(WireMetric::Uc) => Some(Metric::Uc),
        _ => None,
    };
    RawSample {
        session_id: sample.session_id.clone(),
        ts_ms: sample.ts_ms,
        metric,
        value: sample.value,
    }
}

/// Tracks per-session receive counters and emits an ack every
/// `ack_every_n` samples globally. The ack names the session of the
/// triggering sample and reports that session's counter.
async fn ack_worker(
    mut ack_rx: mpsc::Receiver<String>,
    out_tx: mpsc::Sender<Result<Ack, Status>>,
    ack_every_n: u64,
) {
    let mut total_received: u64 = 0;
    let mut session_counters: HashMap<String, u64> = HashMap::new();

    while let Some(session_id) = ack_rx.recv().await {
        total_received += 1;
        let counter = session_counters.entry(session_id.clone()).or_insert(0);
        *counter += 1;

        if total_received % ack_every_n == 0 {
            let ack = Ack {
                session_id,
                received_cnt: *counter,
            };
            if out_tx.send(Ok(ack)).await.is_err() {
                // Client gone; a send failure terminates the stream.
                warn!("failed to send ack, stopping ack worker");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acks_fire_on_the_global_cadence() {
        let (ack_tx, ack_rx) = mpsc::channel(100);
        let (out_tx, mut out_rx) = mpsc::channel(32);
        let worker = tokio::spawn(ack_worker(ack_rx, out_tx, 3));

        for _ in 0..7 {
            ack_tx.send("s1".to_string()).await.unwrap();
        }
        drop(ack_tx);
        worker.await.unwrap();

        let first = out_rx.recv().await.unwrap().unwrap();
        assert_eq!(first.session_id, "s1");
        assert_eq!(first.received_cnt, 3);

        let second = out_rx.recv().await.unwrap().unwrap();
        assert_eq!(second.received_cnt, 6);

        // Seventh sample does not reach a multiple of three.
        assert!(out_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn ack_reports_the_triggering_sessions_counter() {
        let (ack_tx, ack_rx) = mpsc::channel(100);
        let (out_tx, mut out_rx) = mpsc::channel(32);
        let worker = tokio::spawn(ack_worker(ack_rx, out_tx, 2));

        // Interleaved sessions: the second global sample belongs to "b"
        // with a per-session count of 1.
        ack_tx.send("a".to_string()).await.unwrap();
        ack_tx.send("b".to_string()).await.unwrap();
        ack_tx.send("a".to_string()).await.unwrap();
        ack_tx.send("a".to_string()).await.unwrap();
        drop(ack_tx);
        worker.await.unwrap();

        let first = out_rx.recv().await.unwrap().unwrap();
        assert_eq!(first.session_id, "b");
        assert_eq!(first.received_cnt, 1);

        let second = out_rx.recv().await.unwrap().unwrap();
        assert_eq!(second.session_id, "a");
        assert_eq!(second.received_cnt, 3);
    }

    #[test]
    fn unknown_wire_metric_lowers_to_none() {
        let sample = Sample {
            session_id: "s1".to_string(),
            ts_ms: 1000,
            metric: 99,
            value: 120.0,
        };
        assert!(raw_sample(&sample).metric.is_none());

        let sample = Sample::fhr("s1", 1000, 120.0);
        assert_eq!(raw_sample(&sample).metric, Some(Metric::Fhr));
    }
}
