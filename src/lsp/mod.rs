//! LSP (Language Server Protocol) client runtime.
//!
//! This module discovers language servers per file kind, owns each server's
//! lifecycle, mirrors editor documents to the server and turns responses
//! into editor artifacts.
//!
//! # Architecture
//!
//! The LSP module is organized into:
//! - `registry`: kind key and project scope to definition / connection maps
//! - `connection`: one server process per (definition, project)
//! - `requests`: capability-gated request façade over the wire
//! - `document`: per-document mirror state and versioning
//! - `session`: per-editor state and request helpers
//! - `handlers`: server-to-client requests and notifications
//! - `timeouts`: per-operation timeouts and success/failure telemetry
//! - `symbols`: workspace symbol fan-out
//! - `runtime`: the root value tying the pieces to a host
//!
//! # Usage
//!
//! ```ignore
//! use kadabra_lsp_runtime::lsp::{LspRuntime, ServerDefinition};
//!
//! let runtime = LspRuntime::new(host);
//! runtime
//!     .register_definition(ServerDefinition::builder("zls").kind_key("zig").command("zls", Vec::<String>::new()).build(), None)
//!     .await;
//! let session = runtime.editor_opened(editor).await;
//! ```

pub mod capabilities;
pub mod connection;
pub mod definition;
pub mod document;
pub mod edits;
pub mod extension;
pub mod handlers;
pub mod registry;
pub mod requests;
pub mod runtime;
pub mod semantic;
pub mod session;
pub mod symbols;
pub mod timeouts;
pub mod transport;
pub mod types;

use crate::error::LspError;

/// Result type for LSP operations.
pub type LspResult<T> = std::result::Result<T, LspError>;

pub use capabilities::{Capabilities, DynamicRegistrations, Feature};
pub use connection::{ConnectionEnv, ServerConnection, ServerStatus};
pub use definition::{KindKey, LaunchSpec, ProcessSpec, ProjectScope, ServerDefinition};
pub use document::{DocumentChange, DocumentSync};
pub use extension::LspExtension;
pub use handlers::{ClientContext, ClientHandlers, DefaultClientHandlers};
pub use registry::{Registry, Resolution};
pub use requests::{DefaultRequestManager, RequestFuture, RequestManager};
pub use runtime::{LspRuntime, RuntimeOptions};
pub use semantic::{SemanticCache, SemanticToken};
pub use session::{EditorSession, References};
pub use symbols::{NavigationItem, WorkspaceSymbols};
pub use timeouts::{OpKind, OpStats, RestartPolicy, Telemetry, Timeouts};
pub use transport::{Channel, Connector};

// Re-export commonly used types from lsp-types
pub use lsp_types::{Diagnostic, Location, Position, Url};
