//! Per-tenant trace ingestion engine for the parallax tracing backend.
//!
//! Each tenant gets a [`TenantInstance`] that accumulates pushed span
//! batches in memory, periodically freezes completed traces into an
//! append-only write-ahead block, and advances those blocks through a
//! lifecycle that ends in object storage. The [`Ingester`] hosts the
//! instances and runs the background loops that drive it all.
//!
//! ## Data flow
//!
//! ```text
//! push → live traces → (cut) → head block → (cut) → completing block
//!                                                        ↓ (rebuild)
//!             backend object store ← (flush) ← complete block
//! ```
//!
//! The find path reads every stage at once, newest first, and merges all
//! occurrences of the trace ID.

pub mod block;
pub mod config;
pub mod error;
pub mod ingester;
pub mod instance;
pub mod limiter;
pub mod live_traces;
pub mod metrics;
pub mod wal;

#[cfg(test)]
pub mod test_fixtures;

pub use config::IngesterConfig;
pub use error::IngestError;
pub use ingester::{start_background_sweep, Ingester, IngesterHandle};
pub use instance::{PushRequest, TenantInstance};
pub use limiter::{Limiter, RingCount, StaticRingCount};
