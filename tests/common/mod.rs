//! Common test utilities.
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//!
//! #[test]
//! fn my_test() {
//!     common::init_tracing();
//!     // ...
//! }
//! ```
//!
//! Filter with `RUST_LOG`, e.g. `RUST_LOG=bztree=debug` (requires building
//! the crate with `--features tracing` for events to exist).

#![allow(dead_code)]

use std::sync::Once;

static INIT: Once = Once::new();

/// Install a fmt subscriber driven by `RUST_LOG`. Safe to call from every
/// test; only the first call wins.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
