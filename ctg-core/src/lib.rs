//! Core engine for the ctg telemetry pipeline.
//!
//! This crate owns the parts of the receiver that do not touch a wire
//! format: sample validation and batching, the per-session state manager
//! with its idempotent merge, the storage capability traits, and the
//! cache/durable adapters behind them. The `ctg-server` crate layers the
//! gRPC, HTTP, and WebSocket surfaces on top.

pub mod batch;
pub mod config;
pub mod session;

pub use batch::{Batch, BatchKey, Batcher, BatcherStats, Metric, Point, RawSample, Sink};
pub use config::{BatcherConfig, Config};
pub use session::{Session, SessionData, SessionManager, SessionMetrics, SessionStatus};
