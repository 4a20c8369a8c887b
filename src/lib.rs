//! Dataset registry crawl pipeline.
//!
//! Tracks external dataset repositories and keeps their recorded state fresh
//! through durable, lease-based jobs run by a worker pool, a scheduler and a
//! monitor that share one SQLite store.

pub mod config;
pub mod execution;
pub mod metrics;
pub mod monitor;
pub mod registry;
pub mod registry_store;
pub mod retry_policy;
pub mod scheduler;
pub mod sqlite_persistence;
pub mod worker;

pub use registry::DatasetRegistry;
pub use registry_store::{RegistryStore, SqliteRegistryStore};
