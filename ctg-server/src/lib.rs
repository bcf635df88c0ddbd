//! Receiver surfaces for the ctg telemetry pipeline.
//!
//! Wires the `ctg-core` engine to its three fronts: the tonic ingest
//! stream, the axum session control plane with its WebSocket fan-out,
//! and the outbound analysis/prediction RPC clients.

pub mod analysis;
pub mod api;
pub mod grpc;
pub mod hub;
pub mod prediction;
