//! Candle Storage
//!
//! Durable sinks for completed candles plus the read path used by the
//! history endpoint.
//!
//! # Backends
//! - `clickhouse`: ClickHouse over its HTTP interface
//! - `journal`: append-only local file with CRC32C-checked frames
//! - `memory`: process-local store for tests and development
//!
//! Backends are selected by identifier through [`registry`]; the set is
//! closed and validated at startup.

pub mod clickhouse;
pub mod journal;
pub mod memory;
pub mod reader;
pub mod registry;
pub mod repository;

pub use registry::{open_repository, BackendKind, StorageConfig};
pub use repository::{QueryRepository, Repository, SaveRepository, StorageError};
