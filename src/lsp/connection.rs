//! One language server per (definition, project).
//!
//! A [`ServerConnection`] owns the transport, the initialize handshake, the
//! document mirror table and the restart policy. Its status moves through
//!
//! ```text
//! STOPPED -> STARTING -> STARTED -> INITIALIZED -> STOPPING -> STOPPED
//!                 \          \            \
//!                  +----------+------------+--> CRASHED -> STARTING ...
//! ```
//!
//! Requests are only issued while INITIALIZED. A crash reopens every
//! attached document once the server is back.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use lsp_types::notification;
use lsp_types::request;
use lsp_types::{
    DidChangeConfigurationParams, DidSaveTextDocumentParams, InitializedParams,
    TextDocumentIdentifier, Url,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::LspError;
use crate::host::{EditorId, Host, Notice, Severity};

use super::LspResult;
use super::capabilities::{Capabilities, DynamicRegistrations, initialize_params};
use super::definition::{ProjectScope, ServerDefinition};
use super::document::{DocumentChange, DocumentSync};
use super::extension::LspExtension;
use super::handlers::{ClientContext, ClientHandlers, ClientState};
use super::requests::{DefaultRequestManager, RequestFuture, RequestManager};
use super::session::EditorSession;
use super::timeouts::{OpKind, RestartPolicy, Telemetry, Timeouts};
use super::transport::{Transport, open_channel};

/// Upper bound for waiting on the server to exit after `exit`.
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle status of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    /// Not running.
    Stopped,
    /// Transport is being opened.
    Starting,
    /// Transport is up, `initialize` is in flight.
    Started,
    /// Handshake done; requests allowed.
    Initialized,
    /// Shutting down.
    Stopping,
    /// The server died or failed to start.
    Crashed,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Initialized => "initialized",
            Self::Stopping => "stopping",
            Self::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Everything a connection borrows from the runtime.
#[derive(Clone)]
pub struct ConnectionEnv {
    /// The editor host.
    pub host: Arc<dyn Host>,
    /// Shared timeout table.
    pub timeouts: Arc<Timeouts>,
    /// Handlers for server-initiated messages.
    pub handlers: Arc<dyn ClientHandlers>,
    /// Extension for the definition's kind key, if any.
    pub extension: Option<Arc<dyn LspExtension>>,
    /// Restart policy.
    pub restart: RestartPolicy,
}

/// A language server process bound to one project.
pub struct ServerConnection {
    definition: Arc<ServerDefinition>,
    project: ProjectScope,
    env: ConnectionEnv,
    this: Weak<Self>,
    lifecycle: tokio::sync::Mutex<()>,
    status: RwLock<ServerStatus>,
    generation: AtomicU64,
    transport: Mutex<Option<Transport>>,
    requests: RwLock<Option<Arc<dyn RequestManager>>>,
    registrations: Arc<DynamicRegistrations>,
    documents: Mutex<DocumentSync>,
    sessions: Mutex<HashMap<EditorId, Weak<EditorSession>>>,
    diagnostics: RwLock<HashMap<Url, Vec<lsp_types::Diagnostic>>>,
    telemetry: Telemetry,
    restarts: AtomicU32,
    restart_pending: AtomicBool,
    retired: AtomicBool,
    crash_reported: AtomicBool,
    initialized_at: Mutex<Option<Instant>>,
}

impl fmt::Debug for ServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConnection")
            .field("server", &self.definition.name())
            .field("project", &self.project)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl ServerConnection {
    /// Creates a stopped connection.
    pub fn new(definition: Arc<ServerDefinition>, project: ProjectScope, env: ConnectionEnv) -> Arc<Self> {
        let telemetry = Telemetry::new(env.restart);
        Arc::new_cyclic(|this| Self {
            definition,
            project,
            env,
            this: this.clone(),
            lifecycle: tokio::sync::Mutex::new(()),
            status: RwLock::new(ServerStatus::Stopped),
            generation: AtomicU64::new(0),
            transport: Mutex::new(None),
            requests: RwLock::new(None),
            registrations: Arc::new(DynamicRegistrations::new()),
            documents: Mutex::new(DocumentSync::new()),
            sessions: Mutex::new(HashMap::new()),
            diagnostics: RwLock::new(HashMap::new()),
            telemetry,
            restarts: AtomicU32::new(0),
            restart_pending: AtomicBool::new(false),
            retired: AtomicBool::new(false),
            crash_reported: AtomicBool::new(false),
            initialized_at: Mutex::new(None),
        })
    }

    /// The server definition.
    pub fn definition(&self) -> &Arc<ServerDefinition> {
        &self.definition
    }

    /// The project this connection serves.
    pub fn project(&self) -> &ProjectScope {
        &self.project
    }

    /// Current status.
    pub fn status(&self) -> ServerStatus {
        *self.status.read()
    }

    /// Request outcome counters.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// The shared timeout table.
    pub fn timeouts(&self) -> &Timeouts {
        &self.env.timeouts
    }

    /// The request manager, while the server is initialized.
    pub fn request_manager(&self) -> Option<Arc<dyn RequestManager>> {
        if self.status() != ServerStatus::Initialized {
            return None;
        }
        self.requests.read().clone()
    }

    /// When the current server lifetime finished initializing.
    pub fn initialized_at(&self) -> Option<Instant> {
        *self.initialized_at.lock()
    }

    /// Documents currently open on the server.
    pub fn open_documents(&self) -> Vec<Url> {
        self.documents.lock().open_documents()
    }

    /// Version last sent for a document, while it is open.
    pub fn document_version(&self, uri: &Url) -> Option<i32> {
        self.documents.lock().version(uri)
    }

    /// Last diagnostics the server published for a document.
    pub fn diagnostics(&self, uri: &Url) -> Vec<lsp_types::Diagnostic> {
        self.diagnostics.read().get(uri).cloned().unwrap_or_default()
    }

    /// Restart attempts since the last stable period.
    pub fn restart_attempts(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// True while a restart is scheduled.
    pub fn restart_pending(&self) -> bool {
        self.restart_pending.load(Ordering::SeqCst)
    }

    /// False once the connection crashed for good or was removed.
    pub fn is_reusable(&self) -> bool {
        !self.retired.load(Ordering::SeqCst)
            && !(self.status() == ServerStatus::Crashed && !self.restart_pending())
    }

    /// Starts the server and performs the initialize handshake.
    ///
    /// Returns immediately if the server is already running. Documents
    /// attached in the meantime are opened once the handshake completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport cannot be opened, `initialize`
    /// fails or times out. The connection is then CRASHED.
    pub async fn start(&self) -> LspResult<()> {
        let _guard = self.lifecycle.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> LspResult<()> {
        if self.retired.load(Ordering::SeqCst) {
            return Err(LspError::ServerExited("connection was removed".to_string()));
        }
        if matches!(
            self.status(),
            ServerStatus::Starting | ServerStatus::Started | ServerStatus::Initialized
        ) {
            return Ok(());
        }
        self.set_status(ServerStatus::Starting);
        info!(server = %self.definition.name(), project = %self.project, "starting language server");

        let root = self.project.root_path();
        let channel = match open_channel(self.definition.launch(), root.as_deref()) {
            Ok(channel) => channel,
            Err(e) => {
                self.crash(&e.to_string(), false);
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.registrations.clear();
        let ctx = Arc::new(ClientContext::new(
            self.definition.name(),
            self.project.clone(),
            Arc::clone(&self.env.host),
            Arc::clone(&self.registrations),
            self.this.clone(),
        ));
        let weak = self.this.clone();
        let transport = Transport::start(
            channel,
            ClientState::new(ctx, Arc::clone(&self.env.handlers)),
            move |cause| {
                if let Some(connection) = weak.upgrade() {
                    connection.transport_closed(generation, &cause);
                }
            },
        );
        let socket = transport.socket().clone();
        *self.transport.lock() = Some(transport);
        self.set_status(ServerStatus::Started);

        let params = initialize_params(&self.definition, self.project.root_url());
        let init_timeout = self.env.timeouts.get(OpKind::Init);
        let result = match tokio::time::timeout(
            init_timeout,
            socket.request::<request::Initialize>(params),
        )
        .await
        {
            Ok(Ok(result)) => {
                self.telemetry.notify_success(OpKind::Init);
                result
            }
            Ok(Err(e)) => {
                let err = LspError::InitializationFailed(format!("initialize request failed: {e:?}"));
                self.crash(&err.to_string(), true);
                return Err(err);
            }
            Err(_) => {
                self.telemetry.notify_failure(OpKind::Init);
                let err = LspError::Timeout(init_timeout);
                self.crash(&err.to_string(), true);
                return Err(err);
            }
        };
        if self.status() != ServerStatus::Started {
            return Err(LspError::ServerExited(format!(
                "server went {} during initialization",
                self.status()
            )));
        }

        let capabilities = Arc::new(Capabilities::new(
            result.capabilities,
            Arc::clone(&self.registrations),
        ));
        let manager: Arc<dyn RequestManager> = match &self.env.extension {
            Some(extension) => extension.request_manager(&self.definition, socket.clone(), capabilities),
            None => Arc::new(DefaultRequestManager::new(
                self.definition.name(),
                socket.clone(),
                capabilities,
            )),
        };
        if let Err(e) = socket.notify::<notification::Initialized>(InitializedParams {}) {
            let err = LspError::InitializationFailed(format!("initialized notification failed: {e:?}"));
            self.crash(&err.to_string(), true);
            return Err(err);
        }

        *self.requests.write() = Some(Arc::clone(&manager));
        *self.initialized_at.lock() = Some(Instant::now());
        self.crash_reported.store(false, Ordering::SeqCst);

        let sessions = {
            let mut documents = self.documents.lock();
            let sessions = self.live_sessions();
            self.set_status(ServerStatus::Initialized);
            for session in &sessions {
                let language_id = self.definition.language_id_for(session.kind_key());
                documents.attach(session.uri(), session.kind_key(), &language_id, session.editor_id());
            }
            for uri in documents.pending() {
                let Some(text) = self.document_text(&uri, &sessions) else {
                    warn!(uri = %uri, "no text for pending document; not opened");
                    continue;
                };
                if let Some(params) = documents.open_on_server(&uri, text) {
                    manager.did_open(params);
                }
            }
            sessions
        };
        info!(
            server = %self.definition.name(),
            project = %self.project,
            documents = sessions.len(),
            "language server initialized"
        );
        Ok(())
    }

    /// Stops the server gracefully: `shutdown`, then `exit`, bounded by the
    /// shutdown timeout.
    pub async fn stop(&self) {
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(true).await;
    }

    /// Stops the server for good; pending restarts are cancelled.
    pub async fn shutdown(&self) {
        self.retired.store(true, Ordering::SeqCst);
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(true).await;
        self.documents.lock().reset();
    }

    /// Kills the server without the shutdown handshake and retires the
    /// connection.
    pub async fn terminate(&self) {
        self.retired.store(true, Ordering::SeqCst);
        let _guard = self.lifecycle.lock().await;
        self.stop_locked(false).await;
        self.documents.lock().reset();
    }

    async fn stop_locked(&self, graceful: bool) {
        let previous = {
            let mut status = self.status.write();
            let previous = *status;
            if previous == ServerStatus::Stopped {
                return;
            }
            *status = ServerStatus::Stopping;
            previous
        };
        info!(server = %self.definition.name(), project = %self.project, %previous, "stopping language server");

        self.requests.write().take();
        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            let mut grace = Duration::ZERO;
            if graceful && previous == ServerStatus::Initialized {
                let timeout = self.env.timeouts.get(OpKind::Shutdown);
                let socket = transport.socket().clone();
                match tokio::time::timeout(timeout, socket.request::<request::Shutdown>(())).await {
                    Ok(Ok(())) => {
                        self.telemetry.notify_success(OpKind::Shutdown);
                        if let Err(e) = socket.notify::<notification::Exit>(()) {
                            debug!("exit notification failed: {e:?}");
                        }
                        grace = timeout.min(EXIT_GRACE);
                    }
                    Ok(Err(e)) => warn!(server = %self.definition.name(), "shutdown request failed: {e:?}"),
                    Err(_) => {
                        self.telemetry.notify_failure(OpKind::Shutdown);
                        warn!(server = %self.definition.name(), ?timeout, "shutdown request timed out");
                    }
                }
            }
            transport.close(grace).await;
        }

        self.documents.lock().clear();
        self.diagnostics.write().clear();
        self.registrations.clear();
        self.set_status(ServerStatus::Stopped);
    }

    /// Runs a request under its timeout.
    ///
    /// `None` in, `None` out: an unsupported request never reaches the wire.
    /// Timeouts count as failures and may trigger a restart; transport loss
    /// crashes the connection.
    pub async fn execute<T>(&self, kind: OpKind, request: Option<RequestFuture<T>>) -> Option<T> {
        let request = request?;
        let timeout = self.env.timeouts.get(kind);
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(value)) => {
                self.telemetry.notify_success(kind);
                Some(value)
            }
            Ok(Err(e)) => {
                self.request_failed(kind, e);
                None
            }
            Err(_) => {
                warn!(server = %self.definition.name(), %kind, ?timeout, "request timed out");
                self.notify_failure(kind);
                None
            }
        }
    }

    /// Records a failed request; restarts the server when the failure rate
    /// crosses the policy threshold.
    pub fn notify_failure(&self, kind: OpKind) {
        if self.telemetry.notify_failure(kind) {
            warn!(server = %self.definition.name(), %kind, "failure threshold reached");
            self.schedule_restart(&format!("too many {kind} failures"));
        }
    }

    fn request_failed(&self, kind: OpKind, error: async_lsp::Error) {
        match error {
            async_lsp::Error::ServiceStopped => {
                self.crash(&format!("{kind} request: service stopped"), true);
            }
            async_lsp::Error::Response(response) => {
                warn!(server = %self.definition.name(), %kind, "request failed: {response:?}");
            }
            other => {
                warn!(server = %self.definition.name(), %kind, "request failed: {other:?}");
                self.notify_failure(kind);
            }
        }
    }

    /// Attaches an editor session and opens its document if the server is
    /// ready; otherwise the open is replayed after initialization.
    pub(crate) fn connect(&self, session: &Arc<EditorSession>) {
        self.sessions
            .lock()
            .insert(session.editor_id(), Arc::downgrade(session));
        let language_id = self.definition.language_id_for(session.kind_key());
        {
            let mut documents = self.documents.lock();
            documents.attach(session.uri(), session.kind_key(), &language_id, session.editor_id());
            if let Some(manager) = self.request_manager()
                && let Some(params) = documents.open_on_server(session.uri(), session.text())
            {
                manager.did_open(params);
            }
        }
        let known = self.diagnostics.read().get(session.uri()).cloned();
        if let Some(diagnostics) = known {
            session.set_diagnostics(diagnostics);
        }
    }

    /// Detaches an editor; the document is closed on the server when its
    /// last editor goes away.
    ///
    /// Holds the document table while the session leaves so a concurrent
    /// initialize either opens the document and sees the close, or never
    /// sees the session.
    pub(crate) fn disconnect(&self, editor: EditorId, uri: &Url) {
        let mut documents = self.documents.lock();
        self.sessions.lock().remove(&editor);
        if let Some(params) = documents.detach(uri, editor)
            && let Some(manager) = self.request_manager()
        {
            manager.did_close(params);
        }
    }

    /// Mirrors an edit to the server.
    pub fn document_changed(&self, uri: &Url, change: &DocumentChange, text_after: &str) {
        let Some(manager) = self.request_manager() else {
            return;
        };
        let sync = manager.capabilities().sync_kind();
        let mut documents = self.documents.lock();
        if let Some(params) = documents.change(uri, change, text_after, sync) {
            manager.did_change(params);
        }
    }

    /// Sends `didSave` if the server asked for it.
    pub fn document_saved(&self, uri: &Url, text: &str) {
        let Some(manager) = self.request_manager() else {
            return;
        };
        if !self.documents.lock().is_open(uri) {
            return;
        }
        let Some(include_text) = manager.capabilities().save() else {
            return;
        };
        manager.did_save(DidSaveTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            text: include_text.then(|| text.to_string()),
        });
    }

    /// Forwards new settings to the server.
    pub fn did_change_configuration(&self, settings: Value) {
        if let Some(manager) = self.request_manager() {
            manager.did_change_configuration(DidChangeConfigurationParams { settings });
        }
    }

    /// Stores diagnostics and pushes them to every editor on the document.
    pub(crate) fn publish_diagnostics(&self, uri: Url, diagnostics: Vec<lsp_types::Diagnostic>) {
        debug!(server = %self.definition.name(), uri = %uri, count = diagnostics.len(), "diagnostics published");
        self.diagnostics
            .write()
            .insert(uri.clone(), diagnostics.clone());
        for session in self.sessions_for(&uri) {
            session.set_diagnostics(diagnostics.clone());
        }
    }

    /// Live sessions on a document.
    pub fn sessions_for(&self, uri: &Url) -> Vec<Arc<EditorSession>> {
        self.live_sessions()
            .into_iter()
            .filter(|session| session.uri() == uri)
            .collect()
    }

    fn live_sessions(&self) -> Vec<Arc<EditorSession>> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, session| session.strong_count() > 0);
        let mut live: Vec<Arc<EditorSession>> = sessions.values().filter_map(Weak::upgrade).collect();
        live.sort_by_key(|session| session.editor_id());
        live
    }

    fn document_text(&self, uri: &Url, sessions: &[Arc<EditorSession>]) -> Option<String> {
        self.env.host.document_text(uri).or_else(|| {
            sessions
                .iter()
                .find(|session| session.uri() == uri)
                .map(|session| session.text())
        })
    }

    fn set_status(&self, status: ServerStatus) {
        let previous = std::mem::replace(&mut *self.status.write(), status);
        if previous != status {
            debug!(server = %self.definition.name(), %previous, %status, "status changed");
        }
    }

    fn transport_closed(&self, generation: u64, cause: &str) {
        if generation != self.generation.load(Ordering::SeqCst) {
            return;
        }
        match self.status() {
            ServerStatus::Stopping | ServerStatus::Stopped | ServerStatus::Crashed => {
                debug!(server = %self.definition.name(), cause, "transport closed");
            }
            _ => self.crash(&format!("transport closed: {cause}"), true),
        }
    }

    fn crash(&self, cause: &str, retry: bool) {
        {
            let mut status = self.status.write();
            if matches!(
                *status,
                ServerStatus::Stopping | ServerStatus::Stopped | ServerStatus::Crashed
            ) {
                return;
            }
            *status = ServerStatus::Crashed;
        }
        error!(server = %self.definition.name(), project = %self.project, cause, "language server crashed");

        self.requests.write().take();
        let transport = self.transport.lock().take();
        if let Some(mut transport) = transport {
            transport.abort();
        }
        self.documents.lock().mark_all_unopened();

        if !self.crash_reported.swap(true, Ordering::SeqCst) {
            let notice = Notice {
                title: format!("{} crashed", self.definition.name()),
                message: cause.to_string(),
                severity: Severity::Error,
            };
            let host = Arc::clone(&self.env.host);
            self.env
                .host
                .run_on_ui(Box::new(move || host.notify(notice)));
        }
        if retry {
            self.schedule_restart(cause);
        }
    }

    fn schedule_restart(&self, reason: &str) {
        if self.retired.load(Ordering::SeqCst) || self.restart_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let policy = *self.telemetry.policy();
        if self
            .initialized_at()
            .is_some_and(|at| at.elapsed() > policy.window)
        {
            self.restarts.store(0, Ordering::SeqCst);
        }
        let attempt = self.restarts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > policy.max_restarts {
            self.restart_pending.store(false, Ordering::SeqCst);
            warn!(
                server = %self.definition.name(),
                attempts = policy.max_restarts,
                "restart limit reached; connection stays crashed"
            );
            return;
        }
        let Some(this) = self.this.upgrade() else {
            self.restart_pending.store(false, Ordering::SeqCst);
            return;
        };
        let delay = policy.backoff(attempt);
        info!(server = %self.definition.name(), attempt, ?delay, reason, "scheduling restart");
        tokio::spawn(async move {
            {
                let _guard = this.lifecycle.lock().await;
                if matches!(
                    this.status(),
                    ServerStatus::Starting | ServerStatus::Started | ServerStatus::Initialized
                ) {
                    this.stop_locked(false).await;
                }
            }
            tokio::time::sleep(delay).await;
            let _guard = this.lifecycle.lock().await;
            this.restart_pending.store(false, Ordering::SeqCst);
            if this.retired.load(Ordering::SeqCst) {
                return;
            }
            if matches!(this.status(), ServerStatus::Stopped | ServerStatus::Crashed)
                && let Err(e) = this.start_locked().await
            {
                warn!(server = %this.definition.name(), "restart failed: {e}");
            }
        });
    }
}

impl Drop for ServerConnection {
    fn drop(&mut self) {
        if let Some(mut transport) = self.transport.get_mut().take() {
            transport.abort();
        }
    }
}
