//! Per-(session, metric) sample batching with bounded hand-off.
//!
//! The batcher is a transport, not a diagnostic: it validates incoming
//! samples, accumulates one open batch per key, flushes on size, span, or
//! wall-clock staleness, and hands flushed batches to a [`Sink`] through a
//! bounded queue. Loss is counted, never propagated.

mod batcher;
mod clock;
mod sinks;
mod types;

pub use batcher::{Batcher, BatcherStats};
pub use clock::{Clock, ManualClock, SystemClock};
pub use sinks::{CompositeSink, LogSink};
pub use types::{Batch, BatchKey, InvalidSample, Metric, Point, RawSample, Sink};
