//! Built-in sinks: logging and fan-out composition.

use std::sync::Arc;

use tracing::{error, info};

use super::types::{Batch, Sink};

/// Logs one line per flushed batch. Wired as the first child of the
/// composite sink so every batch leaves a trace even when downstream
/// analytics are unreachable.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait::async_trait]
impl Sink for LogSink {
    async fn consume(&self, batch: Batch) -> anyhow::Result<()> {
        info!(
            session = %batch.key.session_id,
            metric = batch.key.metric.label(),
            points = batch.points.len(),
            span_ms = batch.span_ms(),
            t0 = batch.t0_ms,
            t1 = batch.t1_ms,
            "batch flushed"
        );
        Ok(())
    }
}

/// Fans a flushed batch into child sinks in construction order.
///
/// One child's failure is logged and swallowed; siblings still run. No
/// child observes another's outcome.
pub struct CompositeSink {
    sinks: Vec<Arc<dyn Sink>>,
}

impl CompositeSink {
    #[must_use]
    pub fn new(sinks: Vec<Arc<dyn Sink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait::async_trait]
impl Sink for CompositeSink {
    async fn consume(&self, batch: Batch) -> anyhow::Result<()> {
        for sink in &self.sinks {
            if let Err(err) = sink.consume(batch.clone()).await {
                error!(%err, "sink failed to consume batch");
            }
        }
        Ok(())
    }
}
