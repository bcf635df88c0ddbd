//! Per-session live state: the idempotent merge of analysis results, the
//! lifecycle operations behind the HTTP control plane, and the two-tier
//! cache/durable storage behind them.

mod manager;
mod memory;
mod postgres_repo;
mod redis_store;
mod store;
mod types;

pub use manager::SessionManager;
pub use memory::{MemoryCache, MemoryRepository};
pub use postgres_repo::PostgresRepository;
pub use redis_store::RedisStore;
pub use store::{CacheStore, SessionRepository, StoreError};
pub use types::{
    AnalysisUpdate, CreateSessionRequest, EventKind, EventSpan, FilteredDataPoint, Metadata,
    SaveSessionRequest, SeriesKind, Session, SessionData, SessionError, SessionEvent,
    SessionMetrics, SessionResponse, SessionStatus, TimeSeriesPoint, TraceKind,
};
