//! Integration tests for the Kadabra LSP runtime.
//!
//! The runtime talks to in-process mock servers (see `common::mock_server`)
//! over in-memory pipes, so no language server needs to be installed.
//!
//! To run these tests:
//! - Standard run: `cargo test --test integration_test`
//! - With debug output: `RUST_LOG=debug cargo test --test integration_test`
//! - Run single test: `cargo test --test integration_test test_two_editors_share_one_server_document`

mod common;
mod document_sync_test;
