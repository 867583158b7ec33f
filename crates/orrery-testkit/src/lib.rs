//! Orrery Testing Infrastructure
//!
//! Shared setup for runtime tests: probe components that record every
//! lifecycle hook into an [`EventLog`], description fixtures, and tracing
//! initialization.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
//!
//! # Usage
//!
//! ```rust,no_run
//! use orrery_testkit::*;
//!
//! #[test]
//! fn my_test() {
//!     init_tracing();
//!     let log = EventLog::new();
//!     let engine = engine_with_probes(&log, &["a", "b"]);
//!     // ... test logic
//! }
//! ```

pub mod events;
pub mod fixtures;
pub mod probe;

pub use events::*;
pub use fixtures::*;
pub use probe::*;

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test-writer subscriber once per process
///
/// Honours `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
