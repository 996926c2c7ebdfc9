//! Caravel Integration Tests
//!
//! End-to-end tests for the Caravel client runtime, driven against the
//! in-memory broker. Not published to crates.io.
//!
//! # Test Categories
//!
//! - **delivery**: delivery-guarantee behavior per semantics preset
//! - **pipeline**: consumer ingestion, retry, dead-lettering, shutdown
//! - **transactions**: transactional session lifecycle and recovery
//! - **pool**: shared client registry and eviction
//! - **watermark**: partition watermark totals, lag, and flush
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test -p caravel-integration-tests
//!
//! # Run one suite with logging
//! RUST_LOG=caravel_client=debug cargo test -p caravel-integration-tests --test delivery -- --nocapture
//! ```

pub mod fixtures;
pub mod helpers;
pub mod mocks;

pub use fixtures::*;
pub use helpers::*;
