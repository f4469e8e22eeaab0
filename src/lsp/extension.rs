//! Per-language customization points.

use std::sync::Arc;

use async_lsp::ServerSocket;
use lsp_types::Url;

use super::capabilities::Capabilities;
use super::definition::ServerDefinition;
use super::handlers::{ClientHandlers, DefaultClientHandlers};
use super::requests::{DefaultRequestManager, RequestManager};

/// Customizes the runtime for one kind key.
///
/// Every method has a default, so an extension only overrides what its
/// server needs.
pub trait LspExtension: Send + Sync {
    /// Builds the request manager for a freshly initialized server.
    fn request_manager(
        &self,
        definition: &ServerDefinition,
        socket: ServerSocket,
        capabilities: Arc<Capabilities>,
    ) -> Arc<dyn RequestManager> {
        Arc::new(DefaultRequestManager::new(definition.name(), socket, capabilities))
    }

    /// Builds the handlers for server-initiated messages.
    fn client_handlers(&self, modal: bool) -> Arc<dyn ClientHandlers> {
        Arc::new(DefaultClientHandlers::new(modal))
    }

    /// Whether a file of this kind should be attached at all.
    fn is_file_supported(&self, _uri: &Url) -> bool {
        true
    }
}
