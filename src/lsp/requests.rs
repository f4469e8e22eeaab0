//! Capability-gated request façade.
//!
//! Every request method returns `None` when the server cannot serve the
//! feature, so callers never put an unsupported request on the wire.
//! Returned futures own everything they need and are only sent when first
//! polled, which lets the connection wrap them in its timeout.

use std::any::Any;
use std::sync::Arc;

use async_lsp::ServerSocket;
use futures::FutureExt;
use futures::future::BoxFuture;
use lsp_types::notification::{self, Notification};
use lsp_types::request::{self, Request};
use lsp_types::{
    CodeActionParams, CodeActionResponse, CompletionParams, CompletionResponse,
    DidChangeConfigurationParams, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, DidSaveTextDocumentParams, DocumentFormattingParams,
    DocumentRangeFormattingParams, DocumentSymbolParams, DocumentSymbolResponse,
    ExecuteCommandParams, GotoDefinitionParams, GotoDefinitionResponse, Hover, HoverParams,
    Location, ReferenceParams, SemanticTokensDeltaParams, SemanticTokensFullDeltaResult,
    SemanticTokensParams, SemanticTokensResult, TextEdit, WorkspaceSymbolParams,
    WorkspaceSymbolResponse,
};
use serde_json::Value;
use tracing::{debug, warn};

use super::capabilities::{Capabilities, Feature};

/// A request in flight.
pub type RequestFuture<T> = BoxFuture<'static, Result<T, async_lsp::Error>>;

/// Typed requests and notifications towards one server.
pub trait RequestManager: Send + Sync {
    /// The capabilities requests are gated on.
    fn capabilities(&self) -> &Capabilities;

    /// `textDocument/didOpen`
    fn did_open(&self, params: DidOpenTextDocumentParams);
    /// `textDocument/didChange`
    fn did_change(&self, params: DidChangeTextDocumentParams);
    /// `textDocument/didClose`
    fn did_close(&self, params: DidCloseTextDocumentParams);
    /// `textDocument/didSave`
    fn did_save(&self, params: DidSaveTextDocumentParams);
    /// `workspace/didChangeConfiguration`
    fn did_change_configuration(&self, params: DidChangeConfigurationParams);

    /// `textDocument/completion`
    fn completion(&self, params: CompletionParams) -> Option<RequestFuture<Option<CompletionResponse>>>;
    /// `textDocument/hover`
    fn hover(&self, params: HoverParams) -> Option<RequestFuture<Option<Hover>>>;
    /// `textDocument/definition`
    fn definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Option<RequestFuture<Option<GotoDefinitionResponse>>>;
    /// `textDocument/references`
    fn references(&self, params: ReferenceParams) -> Option<RequestFuture<Option<Vec<Location>>>>;
    /// `textDocument/formatting`
    fn formatting(&self, params: DocumentFormattingParams) -> Option<RequestFuture<Option<Vec<TextEdit>>>>;
    /// `textDocument/rangeFormatting`
    fn range_formatting(
        &self,
        params: DocumentRangeFormattingParams,
    ) -> Option<RequestFuture<Option<Vec<TextEdit>>>>;
    /// `textDocument/documentSymbol`
    fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Option<RequestFuture<Option<DocumentSymbolResponse>>>;
    /// `textDocument/codeAction`
    fn code_action(&self, params: CodeActionParams) -> Option<RequestFuture<Option<CodeActionResponse>>>;
    /// `workspace/executeCommand`
    fn execute_command(&self, params: ExecuteCommandParams) -> Option<RequestFuture<Option<Value>>>;
    /// `workspace/symbol`
    fn workspace_symbol(
        &self,
        params: WorkspaceSymbolParams,
    ) -> Option<RequestFuture<Option<WorkspaceSymbolResponse>>>;
    /// `textDocument/semanticTokens/full`
    fn semantic_tokens_full(
        &self,
        params: SemanticTokensParams,
    ) -> Option<RequestFuture<Option<SemanticTokensResult>>>;
    /// `textDocument/semanticTokens/full/delta`
    fn semantic_tokens_full_delta(
        &self,
        params: SemanticTokensDeltaParams,
    ) -> Option<RequestFuture<Option<SemanticTokensFullDeltaResult>>>;

    /// Downcasting hook for extensions with non-standard methods.
    fn as_any(&self) -> &dyn Any;
}

/// [`RequestManager`] speaking plain LSP over a server socket.
#[derive(Debug)]
pub struct DefaultRequestManager {
    server: String,
    socket: ServerSocket,
    capabilities: Arc<Capabilities>,
}

impl DefaultRequestManager {
    /// Creates a manager for a named server.
    pub fn new(server: impl Into<String>, socket: ServerSocket, capabilities: Arc<Capabilities>) -> Self {
        Self {
            server: server.into(),
            socket,
            capabilities,
        }
    }

    /// The underlying socket, for requests outside the standard set.
    pub fn socket(&self) -> &ServerSocket {
        &self.socket
    }

    /// Sends a typed request if `feature` is supported.
    pub fn request<R>(&self, feature: Feature, params: R::Params) -> Option<RequestFuture<R::Result>>
    where
        R: Request,
    {
        if !self.capabilities.supports(feature) {
            debug!(server = %self.server, method = R::METHOD, "capability not supported; request skipped");
            return None;
        }
        let socket = self.socket.clone();
        Some(async move { socket.request::<R>(params).await }.boxed())
    }

    /// Sends a typed notification, logging transport failures.
    pub fn notify<N>(&self, params: N::Params)
    where
        N: Notification,
    {
        if let Err(e) = self.socket.notify::<N>(params) {
            warn!(server = %self.server, method = N::METHOD, "failed to send notification: {e:?}");
        }
    }
}

impl RequestManager for DefaultRequestManager {
    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn did_open(&self, params: DidOpenTextDocumentParams) {
        self.notify::<notification::DidOpenTextDocument>(params);
    }

    fn did_change(&self, params: DidChangeTextDocumentParams) {
        self.notify::<notification::DidChangeTextDocument>(params);
    }

    fn did_close(&self, params: DidCloseTextDocumentParams) {
        self.notify::<notification::DidCloseTextDocument>(params);
    }

    fn did_save(&self, params: DidSaveTextDocumentParams) {
        self.notify::<notification::DidSaveTextDocument>(params);
    }

    fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        self.notify::<notification::DidChangeConfiguration>(params);
    }

    fn completion(&self, params: CompletionParams) -> Option<RequestFuture<Option<CompletionResponse>>> {
        self.request::<request::Completion>(Feature::Completion, params)
    }

    fn hover(&self, params: HoverParams) -> Option<RequestFuture<Option<Hover>>> {
        self.request::<request::HoverRequest>(Feature::Hover, params)
    }

    fn definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Option<RequestFuture<Option<GotoDefinitionResponse>>> {
        self.request::<request::GotoDefinition>(Feature::Definition, params)
    }

    fn references(&self, params: ReferenceParams) -> Option<RequestFuture<Option<Vec<Location>>>> {
        self.request::<request::References>(Feature::References, params)
    }

    fn formatting(&self, params: DocumentFormattingParams) -> Option<RequestFuture<Option<Vec<TextEdit>>>> {
        self.request::<request::Formatting>(Feature::Formatting, params)
    }

    fn range_formatting(
        &self,
        params: DocumentRangeFormattingParams,
    ) -> Option<RequestFuture<Option<Vec<TextEdit>>>> {
        self.request::<request::RangeFormatting>(Feature::RangeFormatting, params)
    }

    fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Option<RequestFuture<Option<DocumentSymbolResponse>>> {
        self.request::<request::DocumentSymbolRequest>(Feature::DocumentSymbol, params)
    }

    fn code_action(&self, params: CodeActionParams) -> Option<RequestFuture<Option<CodeActionResponse>>> {
        self.request::<request::CodeActionRequest>(Feature::CodeAction, params)
    }

    fn execute_command(&self, params: ExecuteCommandParams) -> Option<RequestFuture<Option<Value>>> {
        self.request::<request::ExecuteCommand>(Feature::ExecuteCommand, params)
    }

    fn workspace_symbol(
        &self,
        params: WorkspaceSymbolParams,
    ) -> Option<RequestFuture<Option<WorkspaceSymbolResponse>>> {
        self.request::<request::WorkspaceSymbolRequest>(Feature::WorkspaceSymbol, params)
    }

    fn semantic_tokens_full(
        &self,
        params: SemanticTokensParams,
    ) -> Option<RequestFuture<Option<SemanticTokensResult>>> {
        self.request::<request::SemanticTokensFullRequest>(Feature::SemanticTokensFull, params)
    }

    fn semantic_tokens_full_delta(
        &self,
        params: SemanticTokensDeltaParams,
    ) -> Option<RequestFuture<Option<SemanticTokensFullDeltaResult>>> {
        self.request::<request::SemanticTokensFullDeltaRequest>(Feature::SemanticTokensDelta, params)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
