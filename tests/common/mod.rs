//! Common test infrastructure
//!
//! Integration tests import fakes and fixtures from here only.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{ScriptedAdapter, TestEnv};
//!
//! #[tokio::test]
//! async fn test_register() {
//!     let env = TestEnv::new();
//!     let dataset = env.registry().register_dataset("https://example.org/ds", None).unwrap();
//!     let pool = env.worker_pool(ScriptedAdapter::always_healthy("abc"));
//!     assert!(pool.process_next(0).await.unwrap());
//! }
//! ```

mod fakes;
mod fixtures;

#[allow(unused_imports)]
pub use fakes::{healthy_result, RecordingNotifier, ScriptedAdapter};
#[allow(unused_imports)]
pub use fixtures::{fast_retry_policy, monitor_settings, worker_settings, TestEnv, HOUR_MS};
