//! # suitesync Testkit
//!
//! Test utilities for suitesync.
//!
//! This crate provides:
//! - Document and feed frame fixtures
//! - Property-based generators for update histories
//! - `MemoryBackend`, an in-memory server implementing the snapshot API and
//!   the change feed
//! - `EngineHarness`, which runs a sync engine against that backend
//!
//! ## Usage
//!
//! ```rust,ignore
//! use suitesync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn suites_sync() {
//!     let backend = Arc::new(MemoryBackend::new());
//!     backend.seed(Collection::Suites, suite_doc("s1", 1));
//!     let harness = EngineHarness::spawn(test_config(), backend);
//!     harness.wait_live().await;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod fixtures;
pub mod generators;
pub mod harness;

use tracing_subscriber::{fmt, EnvFilter};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::harness::*;
    pub use crate::init_test_logging;
}

pub use backend::*;
pub use fixtures::*;
pub use generators::*;
pub use harness::*;

/// Initializes tracing for tests.
///
/// Honors `RUST_LOG` and defaults the sync crates to debug. Safe to call
/// from every test.
pub fn init_test_logging() {
    let filter = EnvFilter::from_default_env()
        .add_directive("suitesync_engine=debug".parse().expect("valid directive"));
    let _ = fmt().with_env_filter(filter).with_test_writer().try_init();
}
