//! Handlers for messages the server sends to the client.
//!
//! The router installed on every connection forwards each server request or
//! notification to a [`ClientHandlers`] implementation. The defaults cover
//! edits, capability registration, diagnostics, messages and configuration;
//! extensions override individual methods.

use std::ops::ControlFlow;
use std::sync::{Arc, Weak};

use async_lsp::router::Router;
use futures::FutureExt;
use futures::future::BoxFuture;
use lsp_types::notification::{self, Notification};
use lsp_types::request;
use lsp_types::{
    ApplyWorkspaceEditParams, ApplyWorkspaceEditResponse, ConfigurationParams, Diagnostic,
    LogMessageParams, MessageActionItem, MessageType, PublishDiagnosticsParams, RegistrationParams,
    ShowMessageParams, ShowMessageRequestParams, UnregistrationParams, Url, WorkspaceFolder,
};
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::host::{Host, Notice, Prompt, Severity, on_ui};

use super::capabilities::DynamicRegistrations;
use super::connection::ServerConnection;
use super::definition::ProjectScope;
use super::edits::resolve_workspace_edit;
use super::types::sanitize_uri;

/// What a handler can reach: the host, the owning connection and its
/// registration table.
pub struct ClientContext {
    server: String,
    project: ProjectScope,
    host: Arc<dyn Host>,
    registrations: Arc<DynamicRegistrations>,
    connection: Weak<ServerConnection>,
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("server", &self.server)
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

impl ClientContext {
    /// Creates a context. `connection` may be empty when handlers run
    /// without a live connection.
    pub fn new(
        server: impl Into<String>,
        project: ProjectScope,
        host: Arc<dyn Host>,
        registrations: Arc<DynamicRegistrations>,
        connection: Weak<ServerConnection>,
    ) -> Self {
        Self {
            server: server.into(),
            project,
            host,
            registrations,
            connection,
        }
    }

    /// Display name of the server.
    pub fn server_name(&self) -> &str {
        &self.server
    }

    /// Project the connection belongs to.
    pub fn project(&self) -> &ProjectScope {
        &self.project
    }

    /// The editor host.
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// Dynamic capability registrations of the connection.
    pub fn registrations(&self) -> &DynamicRegistrations {
        &self.registrations
    }

    /// The owning connection, while it is alive.
    pub fn connection(&self) -> Option<Arc<ServerConnection>> {
        self.connection.upgrade()
    }

    /// Version last mirrored to the server for a document.
    pub fn document_version(&self, uri: &Url) -> Option<i32> {
        self.connection()?.document_version(uri)
    }
}

/// Server-to-client message handling.
pub trait ClientHandlers: Send + Sync {
    /// Whether messages are shown as blocking dialogs.
    fn modal(&self) -> bool {
        false
    }

    /// `workspace/applyEdit`
    fn apply_edit(
        &self,
        ctx: Arc<ClientContext>,
        params: ApplyWorkspaceEditParams,
    ) -> BoxFuture<'static, ApplyWorkspaceEditResponse> {
        apply_workspace_edit(ctx, params)
    }

    /// `client/registerCapability`
    fn register_capability(&self, ctx: &ClientContext, params: RegistrationParams) {
        for registration in params.registrations {
            ctx.registrations().register(
                registration.id,
                registration.method,
                registration.register_options,
            );
        }
    }

    /// `client/unregisterCapability`
    fn unregister_capability(&self, ctx: &ClientContext, params: UnregistrationParams) {
        for unregistration in params.unregisterations {
            ctx.registrations()
                .unregister(&unregistration.id, &unregistration.method);
        }
    }

    /// `textDocument/publishDiagnostics`
    fn publish_diagnostics(&self, ctx: &ClientContext, params: PublishDiagnosticsParams) {
        let uri = sanitize_uri(&params.uri);
        match ctx.connection() {
            Some(connection) => connection.publish_diagnostics(uri, params.diagnostics),
            None => debug!(uri = %uri, "diagnostics for a released connection dropped"),
        }
    }

    /// `window/showMessage`
    fn show_message(&self, ctx: &ClientContext, params: ShowMessageParams) {
        show_message(ctx, params, self.modal());
    }

    /// `window/logMessage`
    fn log_message(&self, ctx: &ClientContext, params: LogMessageParams) {
        log_message(ctx.server_name(), &params);
    }

    /// `window/showMessageRequest`
    fn show_message_request(
        &self,
        ctx: Arc<ClientContext>,
        params: ShowMessageRequestParams,
    ) -> BoxFuture<'static, Option<MessageActionItem>> {
        show_message_request(ctx, params, self.modal())
    }

    /// `workspace/configuration`: one null per requested item.
    fn configuration(&self, _ctx: &ClientContext, params: ConfigurationParams) -> Vec<Value> {
        params.items.iter().map(|_| Value::Null).collect()
    }

    /// `workspace/workspaceFolders`
    fn workspace_folders(&self, _ctx: &ClientContext) -> Option<Vec<WorkspaceFolder>> {
        None
    }

    /// `telemetry/event`
    fn telemetry_event(&self, ctx: &ClientContext, event: Value) {
        info!(server = %ctx.server_name(), %event, "telemetry event");
    }
}

/// The stock handler set.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultClientHandlers {
    modal: bool,
}

impl DefaultClientHandlers {
    /// Creates handlers, optionally showing messages as dialogs.
    pub fn new(modal: bool) -> Self {
        Self { modal }
    }
}

impl ClientHandlers for DefaultClientHandlers {
    fn modal(&self) -> bool {
        self.modal
    }
}

/// Resolves a workspace edit against current text and applies it as one
/// undoable batch, all or nothing.
pub fn apply_workspace_edit(
    ctx: Arc<ClientContext>,
    params: ApplyWorkspaceEditParams,
) -> BoxFuture<'static, ApplyWorkspaceEditResponse> {
    let label = params.label.unwrap_or_else(|| "LSP edits".to_string());
    let host = Arc::clone(ctx.host());
    let resolved = resolve_workspace_edit(
        &params.edit,
        &label,
        |uri| host.document_text(uri),
        |uri| ctx.document_version(uri),
    );
    async move {
        let batch = match resolved {
            Ok(batch) => batch,
            Err(e) => {
                warn!(server = %ctx.server_name(), label, "rejecting workspace edit: {e}");
                return ApplyWorkspaceEditResponse {
                    applied: false,
                    failure_reason: Some(e.to_string()),
                    failed_change: None,
                };
            }
        };
        let edits = batch.len();
        let applied = on_ui(&host, move |h| h.apply_edits(batch))
            .await
            .unwrap_or(false);
        debug!(server = %ctx.server_name(), label, edits, applied, "workspace edit");
        ApplyWorkspaceEditResponse {
            applied,
            failure_reason: (!applied).then(|| "edit was not applied by the editor".to_string()),
            failed_change: None,
        }
    }
    .boxed()
}

/// Shows a server message as a notification or dialog.
pub fn show_message(ctx: &ClientContext, params: ShowMessageParams, modal: bool) {
    let severity = Severity::from_message_type(params.typ);
    let notice = Notice {
        title: ctx.server_name().to_string(),
        message: params.message,
        severity,
    };
    let host = Arc::clone(ctx.host());
    ctx.host().run_on_ui(Box::new(move || {
        if modal {
            host.show_dialog(notice);
        } else {
            host.notify(notice);
        }
    }));
}

/// Forwards a server log line to tracing at the matching level.
pub fn log_message(server: &str, params: &LogMessageParams) {
    match params.typ {
        MessageType::ERROR => error!(target: "lsp", server, message = %params.message, "server log"),
        MessageType::WARNING => warn!(target: "lsp", server, message = %params.message, "server log"),
        MessageType::INFO => info!(target: "lsp", server, message = %params.message, "server log"),
        _ => debug!(target: "lsp", server, message = %params.message, "server log"),
    }
}

/// Asks the user to pick one of the server's actions.
///
/// Resolves to `None` when the prompt is dismissed.
pub fn show_message_request(
    ctx: Arc<ClientContext>,
    params: ShowMessageRequestParams,
    modal: bool,
) -> BoxFuture<'static, Option<MessageActionItem>> {
    let actions = params.actions.unwrap_or_default();
    let severity = Severity::from_message_type(params.typ);
    let prompt = Prompt {
        title: format!("{} {}", ctx.server_name(), severity.label()),
        message: params.message,
        severity,
        actions: actions.iter().map(|a| a.title.clone()).collect(),
        modal,
    };
    async move {
        let reply = on_ui(ctx.host(), move |h| h.prompt(prompt)).await?;
        let choice = reply.await.ok()?;
        actions.get(choice).cloned()
    }
    .boxed()
}

/// Shared state of the router installed on a connection's main loop.
#[derive(Clone)]
pub(crate) struct ClientState {
    ctx: Arc<ClientContext>,
    handlers: Arc<dyn ClientHandlers>,
}

impl ClientState {
    pub(crate) fn new(ctx: Arc<ClientContext>, handlers: Arc<dyn ClientHandlers>) -> Self {
        Self { ctx, handlers }
    }
}

/// Builds the router for server-to-client traffic.
pub(crate) fn client_router(state: ClientState) -> Router<ClientState> {
    let mut router = Router::new(state);
    router
        .request::<request::ApplyWorkspaceEdit, _>(|st, params| {
            let reply = st.handlers.apply_edit(Arc::clone(&st.ctx), params);
            async move { Ok(reply.await) }
        })
        .request::<request::RegisterCapability, _>(|st, params| {
            st.handlers.register_capability(&st.ctx, params);
            async { Ok(()) }
        })
        .request::<request::UnregisterCapability, _>(|st, params| {
            st.handlers.unregister_capability(&st.ctx, params);
            async { Ok(()) }
        })
        .request::<request::ShowMessageRequest, _>(|st, params| {
            let reply = st.handlers.show_message_request(Arc::clone(&st.ctx), params);
            async move { Ok(reply.await) }
        })
        .request::<request::WorkspaceConfiguration, _>(|st, params| {
            let values = st.handlers.configuration(&st.ctx, params);
            async move { Ok(values) }
        })
        .request::<request::WorkspaceFoldersRequest, _>(|st, ()| {
            let folders = st.handlers.workspace_folders(&st.ctx);
            async move { Ok(folders) }
        })
        .request::<request::WorkDoneProgressCreate, _>(|_, _| async { Ok(()) })
        .notification::<notification::PublishDiagnostics>(|st, params| {
            st.handlers.publish_diagnostics(&st.ctx, params);
            ControlFlow::Continue(())
        })
        .notification::<notification::ShowMessage>(|st, params| {
            st.handlers.show_message(&st.ctx, params);
            ControlFlow::Continue(())
        })
        .notification::<notification::LogMessage>(|st, params| {
            st.handlers.log_message(&st.ctx, params);
            ControlFlow::Continue(())
        })
        .notification::<notification::Progress>(|_, _| ControlFlow::Continue(()))
        .unhandled_notification(|st, notif| {
            if notif.method == notification::TelemetryEvent::METHOD {
                st.handlers.telemetry_event(&st.ctx, notif.params);
            } else {
                trace!(method = %notif.method, "unhandled notification");
            }
            ControlFlow::Continue(())
        });
    router
}

/// Sorts diagnostics for display: errors first, then by position.
pub fn sort_diagnostics(diagnostics: &mut [Diagnostic]) {
    diagnostics.sort_by_key(|d| {
        (
            d.severity.map_or(u8::MAX, severity_rank),
            d.range.start.line,
            d.range.start.character,
        )
    });
}

fn severity_rank(severity: lsp_types::DiagnosticSeverity) -> u8 {
    if severity == lsp_types::DiagnosticSeverity::ERROR {
        0
    } else if severity == lsp_types::DiagnosticSeverity::WARNING {
        1
    } else if severity == lsp_types::DiagnosticSeverity::INFORMATION {
        2
    } else {
        3
    }
}
