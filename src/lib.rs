//! Kadabra LSP Runtime
//!
//! A Language Server Protocol client runtime for editors: it finds the
//! right language server for each open file, owns the server processes,
//! mirrors documents to them and turns their answers into editor actions.
//!
//! # Overview
//!
//! This library provides:
//! - A registry of server definitions keyed by file kind and project
//! - Connection lifecycle with crash detection and backoff restarts
//! - Document synchronization with strictly increasing versions
//! - Per-editor sessions for completion, hover, references, formatting,
//!   goto definition and delta-aware semantic highlighting
//! - Handlers for server-initiated edits, registrations, messages and
//!   diagnostics
//! - Per-operation timeouts and failure telemetry
//! - Workspace symbol search across servers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐  editor events  ┌──────────────────┐
//! │      Host       │────────────────►│    LspRuntime    │
//! │ (editor / CLI)  │◄────────────────│ registry, timeouts│
//! └─────────────────┘   UI jobs       └────────┬─────────┘
//!                                              │
//!                                    ┌─────────▼─────────┐
//!                                    │ ServerConnection  │  per (definition, project)
//!                                    │ DocumentSync      │
//!                                    └─────────┬─────────┘
//!                                              │ JSON-RPC
//!                                      ┌───────▼───────┐
//!                                      │   Language    │
//!                                      │    Server     │
//!                                      └───────────────┘
//! ```
//!
//! # Modules
//!
//! - [`error`] - Error types for the entire crate
//! - [`config`] - Configuration file loading
//! - [`host`] - Editor host traits and the in-memory host
//! - [`lsp`] - The runtime itself
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use kadabra_lsp_runtime::host::MemoryHost;
//! use kadabra_lsp_runtime::lsp::{LspRuntime, ServerDefinition};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let host = Arc::new(MemoryHost::new());
//!     let runtime = LspRuntime::new(host.clone());
//!     runtime
//!         .register_definition(ServerDefinition::builder("zls").kind_key("zig").build(), None)
//!         .await;
//!
//!     let uri = host.load_file("src/main.zig".as_ref())?;
//!     let editor = host.open_editor(&uri, None);
//!     if let Some(session) = runtime.editor_opened(editor).await {
//!         println!("{}", session.hover(0).await);
//!     }
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

// Enforce documentation and other quality attributes
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are too strict
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod error;
pub mod host;
pub mod lsp;

// Re-export commonly used types at the crate root
pub use error::{Error, Result};
pub use lsp::LspRuntime;
