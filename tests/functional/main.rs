// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Functional tests for orbit-controller.
//!
//! These tests drive the watch framework, the reconcilers and the admission
//! webhooks end to end WITHOUT a Kubernetes cluster. Cluster access, Helm and
//! the build service are replaced by the in-memory fakes in
//! `tests/common/fixtures.rs`; indexes are reflector stores fed by hand.
//!
//! ```bash
//! cargo test --test functional
//! ```

#[path = "../common/mod.rs"]
mod common;

mod reconciler_tests;
mod watch_tests;
mod webhook_tests;
