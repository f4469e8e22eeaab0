//! In-process language server for integration tests.
//!
//! Each `connect` spawns a fresh async-lsp server over an in-memory duplex
//! pipe. All servers spawned by one [`MockConnector`] share a message log and
//! a response table, so a test can look at traffic across restarts.

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_lsp::router::Router;
use async_lsp::{ClientSocket, ErrorCode, MainLoop, ResponseError};
use kadabra_lsp_runtime::lsp::{Channel, Connector, LspResult};
use lsp_types::request::{self, Request};
use lsp_types::{
    InitializeResult, OneOf, SaveOptions, SemanticTokenType, SemanticTokensFullOptions,
    SemanticTokensLegend, SemanticTokensOptions, SemanticTokensServerCapabilities,
    ServerCapabilities, TextDocumentSyncCapability, TextDocumentSyncKind,
    TextDocumentSyncOptions, TextDocumentSyncSaveOptions,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

/// How long `wait_for` polls before giving up.
const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// One message the mock received from the client.
#[derive(Debug, Clone)]
pub struct Received {
    /// JSON-RPC method.
    pub method: String,
    /// Raw params.
    pub params: Value,
    /// Which spawned server got it, starting at 0.
    pub server: usize,
}

#[derive(Debug)]
struct Shared {
    capabilities: Mutex<ServerCapabilities>,
    responses: Mutex<HashMap<String, Value>>,
    delays: Mutex<HashMap<String, Duration>>,
    log: Mutex<Vec<Received>>,
}

#[derive(Clone)]
struct ServerState {
    shared: Arc<Shared>,
    index: usize,
}

impl ServerState {
    fn record(&self, method: &str, params: Value) {
        self.shared.log.lock().push(Received {
            method: method.to_string(),
            params,
            server: self.index,
        });
    }

    async fn respond<R: Request + 'static>(self, params: R::Params) -> Result<R::Result, ResponseError> {
        self.record(R::METHOD, serde_json::to_value(&params).unwrap_or(Value::Null));
        let delay = self.shared.delays.lock().get(R::METHOD).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let value = self
            .shared
            .responses
            .lock()
            .get(R::METHOD)
            .cloned()
            .unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| ResponseError::new(ErrorCode::INTERNAL_ERROR, e))
    }
}

/// A running mock server.
pub struct MockServer {
    client: ClientSocket,
    task: JoinHandle<()>,
}

impl MockServer {
    /// Socket for server-to-client traffic.
    pub fn client(&self) -> ClientSocket {
        self.client.clone()
    }

    /// Drops the server side of the pipe, as if the process died.
    pub fn kill(&self) {
        self.task.abort();
    }
}

/// Connector that spawns mock servers.
#[derive(Clone)]
pub struct MockConnector {
    shared: Arc<Shared>,
    servers: Arc<Mutex<Vec<Arc<MockServer>>>>,
}

impl fmt::Debug for MockConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockConnector")
            .field("servers", &self.servers.lock().len())
            .finish_non_exhaustive()
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new(full_capabilities())
    }
}

impl MockConnector {
    /// Creates a connector whose servers advertise `capabilities`.
    pub fn new(capabilities: ServerCapabilities) -> Self {
        Self {
            shared: Arc::new(Shared {
                capabilities: Mutex::new(capabilities),
                responses: Mutex::new(HashMap::new()),
                delays: Mutex::new(HashMap::new()),
                log: Mutex::new(Vec::new()),
            }),
            servers: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Same connector as a trait object for a definition.
    pub fn arc(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    /// Answers every later `R` request with `result`.
    pub fn respond<R: Request>(&self, result: R::Result) {
        let value = serde_json::to_value(result).expect("serializable response");
        self.shared.responses.lock().insert(R::METHOD.to_string(), value);
    }

    /// Delays every later `method` request by `delay`.
    pub fn delay(&self, method: &str, delay: Duration) {
        self.shared.delays.lock().insert(method.to_string(), delay);
    }

    /// Never answers `method` within a test's lifetime.
    pub fn stall(&self, method: &str) {
        self.delay(method, Duration::from_secs(3600));
    }

    /// Replaces the capabilities later servers advertise.
    pub fn set_capabilities(&self, capabilities: ServerCapabilities) {
        *self.shared.capabilities.lock() = capabilities;
    }

    /// Server spawned by the `index`-th connect.
    pub fn server(&self, index: usize) -> Arc<MockServer> {
        Arc::clone(&self.servers.lock()[index])
    }

    /// Most recently spawned server.
    pub fn latest(&self) -> Arc<MockServer> {
        let servers = self.servers.lock();
        Arc::clone(servers.last().expect("no server spawned"))
    }

    /// Number of servers spawned so far.
    pub fn spawned(&self) -> usize {
        self.servers.lock().len()
    }

    /// Every message received so far.
    pub fn log(&self) -> Vec<Received> {
        self.shared.log.lock().clone()
    }

    /// Messages received for one method.
    pub fn received(&self, method: &str) -> Vec<Received> {
        self.shared
            .log
            .lock()
            .iter()
            .filter(|m| m.method == method)
            .cloned()
            .collect()
    }

    /// Waits until `count` messages for `method` arrived.
    ///
    /// ## Panics
    /// Panics if they do not arrive in time.
    pub async fn wait_for(&self, method: &str, count: usize) -> Vec<Received> {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let received = self.received(method);
            if received.len() >= count {
                return received;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} x {method}, got {}",
                received.len()
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Connector for MockConnector {
    fn connect(&self, _root: Option<&Path>) -> LspResult<Channel> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let index = self.servers.lock().len();
        let state = ServerState {
            shared: Arc::clone(&self.shared),
            index,
        };
        let (main_loop, client) = MainLoop::new_server(|_client| server_router(state));
        let (read, write) = tokio::io::split(server_io);
        let task = tokio::spawn(async move {
            let _ = main_loop.run_buffered(read.compat(), write.compat_write()).await;
        });
        self.servers.lock().push(Arc::new(MockServer { client, task }));

        let (read, write) = tokio::io::split(client_io);
        Ok(Channel::new(read.compat(), write.compat_write()))
    }
}

fn canned<R>(router: &mut Router<ServerState>)
where
    R: Request + 'static,
{
    router.request::<R, _>(|st, params| st.clone().respond::<R>(params));
}

fn server_router(state: ServerState) -> Router<ServerState> {
    let mut router = Router::new(state);
    router.request::<request::Initialize, _>(|st, params| {
        let st = st.clone();
        st.record(
            request::Initialize::METHOD,
            serde_json::to_value(&params).unwrap_or(Value::Null),
        );
        let capabilities = st.shared.capabilities.lock().clone();
        let delay = st.shared.delays.lock().get(request::Initialize::METHOD).copied();
        async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(InitializeResult {
                capabilities,
                server_info: None,
            })
        }
    });
    canned::<request::Shutdown>(&mut router);
    canned::<request::Completion>(&mut router);
    canned::<request::HoverRequest>(&mut router);
    canned::<request::GotoDefinition>(&mut router);
    canned::<request::References>(&mut router);
    canned::<request::Formatting>(&mut router);
    canned::<request::RangeFormatting>(&mut router);
    canned::<request::DocumentSymbolRequest>(&mut router);
    canned::<request::CodeActionRequest>(&mut router);
    canned::<request::ExecuteCommand>(&mut router);
    canned::<request::WorkspaceSymbolRequest>(&mut router);
    canned::<request::SemanticTokensFullRequest>(&mut router);
    canned::<request::SemanticTokensFullDeltaRequest>(&mut router);
    router.unhandled_notification(|st, notif| {
        st.record(&notif.method, notif.params);
        if notif.method == "exit" {
            ControlFlow::Break(Ok(()))
        } else {
            ControlFlow::Continue(())
        }
    });
    router
}

/// Semantic token types the mock advertises.
pub fn legend() -> SemanticTokensLegend {
    SemanticTokensLegend {
        token_types: vec![
            SemanticTokenType::KEYWORD,
            SemanticTokenType::FUNCTION,
            SemanticTokenType::VARIABLE,
        ],
        token_modifiers: vec![],
    }
}

/// Capabilities with every feature the runtime uses, incremental sync and
/// save with text.
pub fn full_capabilities() -> ServerCapabilities {
    ServerCapabilities {
        text_document_sync: Some(TextDocumentSyncCapability::Options(TextDocumentSyncOptions {
            open_close: Some(true),
            change: Some(TextDocumentSyncKind::INCREMENTAL),
            save: Some(TextDocumentSyncSaveOptions::SaveOptions(SaveOptions {
                include_text: Some(true),
            })),
            ..TextDocumentSyncOptions::default()
        })),
        completion_provider: Some(lsp_types::CompletionOptions::default()),
        hover_provider: Some(lsp_types::HoverProviderCapability::Simple(true)),
        definition_provider: Some(OneOf::Left(true)),
        references_provider: Some(OneOf::Left(true)),
        document_formatting_provider: Some(OneOf::Left(true)),
        document_range_formatting_provider: Some(OneOf::Left(true)),
        document_symbol_provider: Some(OneOf::Left(true)),
        code_action_provider: Some(lsp_types::CodeActionProviderCapability::Simple(true)),
        execute_command_provider: Some(lsp_types::ExecuteCommandOptions {
            commands: vec!["mock.run".to_string()],
            ..lsp_types::ExecuteCommandOptions::default()
        }),
        workspace_symbol_provider: Some(OneOf::Left(true)),
        semantic_tokens_provider: Some(
            SemanticTokensServerCapabilities::SemanticTokensOptions(SemanticTokensOptions {
                legend: legend(),
                full: Some(SemanticTokensFullOptions::Delta { delta: Some(true) }),
                ..SemanticTokensOptions::default()
            }),
        ),
        ..ServerCapabilities::default()
    }
}

/// `full_capabilities` with a different text sync kind.
pub fn capabilities_with_sync(kind: TextDocumentSyncKind) -> ServerCapabilities {
    ServerCapabilities {
        text_document_sync: Some(TextDocumentSyncCapability::Kind(kind)),
        ..full_capabilities()
    }
}
