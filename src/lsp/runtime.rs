//! The root value an editor integration holds.
//!
//! [`LspRuntime`] owns the registry and the timeout table, builds
//! connections for newly opened editors and routes editor events to the
//! connections serving each document.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use lsp_types::Url;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::host::{Editor, EditorId, Host};

use super::connection::{ConnectionEnv, ServerConnection, ServerStatus};
use super::definition::{ProjectScope, ServerDefinition};
use super::document::DocumentChange;
use super::extension::LspExtension;
use super::handlers::{ClientHandlers, DefaultClientHandlers};
use super::registry::Registry;
use super::session::EditorSession;
use super::symbols::{NavigationItem, WorkspaceSymbols};
use super::timeouts::{OpKind, RestartPolicy, Timeouts};
use super::types::{file_extension, file_name, sanitize_uri};

/// Runtime-wide settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeOptions {
    /// When and how crashed servers are restarted.
    pub restart: RestartPolicy,
    /// Show server messages as blocking dialogs.
    pub modal_messages: bool,
}

/// Registry, timeouts and live editor sessions for one host.
pub struct LspRuntime {
    registry: Registry,
    timeouts: Arc<Timeouts>,
    host: Arc<dyn Host>,
    options: RuntimeOptions,
    extensions: RwLock<HashMap<String, Arc<dyn LspExtension>>>,
    sessions: Mutex<HashMap<EditorId, Arc<EditorSession>>>,
    unattached: Mutex<HashMap<EditorId, Arc<dyn Editor>>>,
    symbols: WorkspaceSymbols,
}

impl std::fmt::Debug for LspRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LspRuntime")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .field("sessions", &self.sessions.lock().len())
            .finish_non_exhaustive()
    }
}

impl LspRuntime {
    /// Creates a runtime with default options and timeouts.
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self::with_options(host, RuntimeOptions::default(), Arc::new(Timeouts::new()))
    }

    /// Creates a runtime with explicit options and a timeout table.
    pub fn with_options(host: Arc<dyn Host>, options: RuntimeOptions, timeouts: Arc<Timeouts>) -> Self {
        Self {
            registry: Registry::new(),
            timeouts,
            symbols: WorkspaceSymbols::new(Arc::clone(&host)),
            host,
            options,
            extensions: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            unattached: Mutex::new(HashMap::new()),
        }
    }

    /// The definition and connection registry.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The shared timeout table.
    pub fn timeouts(&self) -> &Arc<Timeouts> {
        &self.timeouts
    }

    /// The host.
    pub fn host(&self) -> &Arc<dyn Host> {
        &self.host
    }

    /// Installs an extension for a kind key. Applies to connections created
    /// afterwards.
    pub fn register_extension(&self, kind_key: impl Into<String>, extension: Arc<dyn LspExtension>) {
        self.extensions.write().insert(kind_key.into(), extension);
    }

    /// Registers a definition application-wide (`project == None`) or for
    /// one project, then attaches editors that were waiting for a server.
    ///
    /// Returns the sessions created for those editors.
    pub async fn register_definition(
        &self,
        definition: ServerDefinition,
        project: Option<Url>,
    ) -> Vec<Arc<EditorSession>> {
        let scope = ProjectScope::from(project);
        self.registry.register_definition(Arc::new(definition), scope);

        let mut waiting: Vec<Arc<dyn Editor>> = self
            .unattached
            .lock()
            .values()
            .filter(|editor| !editor.is_disposed())
            .cloned()
            .collect();
        waiting.extend(
            self.orphaned_sessions()
                .iter()
                .map(|session| Arc::clone(session.editor())),
        );
        let mut attached = Vec::new();
        for editor in waiting {
            if let Some(session) = self.editor_opened(editor).await {
                attached.push(session);
            }
        }
        if !attached.is_empty() {
            info!(count = attached.len(), "attached waiting editors");
        }
        attached
    }

    /// Binds an editor to the server for its file, starting the server if
    /// needed.
    ///
    /// Returns `None` when no definition matches; the editor is then
    /// attached by a later matching [`register_definition`](Self::register_definition).
    /// An editor whose server is gone is moved to a replacement.
    pub async fn editor_opened(&self, editor: Arc<dyn Editor>) -> Option<Arc<EditorSession>> {
        let id = editor.id();
        let orphan = match self.sessions.lock().get(&id) {
            Some(existing) if !existing.is_orphaned() => return Some(Arc::clone(existing)),
            existing => existing.cloned(),
        };
        let uri = sanitize_uri(&editor.uri());
        let project = ProjectScope::from(editor.project());

        let Some(resolution) = self.registry.resolve(&uri, &project) else {
            debug!(uri = %uri, project = %project, "no server definition; editor waits");
            self.unattached.lock().insert(id, editor);
            return None;
        };
        let extension = self.extensions.read().get(&resolution.kind_key).cloned();
        if let Some(extension) = &extension
            && !extension.is_file_supported(&uri)
        {
            debug!(uri = %uri, kind_key = %resolution.kind_key, "file rejected by extension");
            return None;
        }

        let (connection, created) = self.registry.get_or_insert(
            &resolution.definition,
            &project,
            &resolution.kind_key,
            || {
                ServerConnection::new(
                    Arc::clone(&resolution.definition),
                    project.clone(),
                    self.connection_env(extension.clone()),
                )
            },
        );
        let session = match orphan {
            Some(session) if session.kind_key() == resolution.kind_key => {
                self.rebind(&session, &connection);
                session
            }
            orphan => {
                if let Some(previous) = orphan {
                    previous.dispose();
                    if let Some(old) = previous.connection() {
                        old.disconnect(id, previous.uri());
                    }
                }
                let session = EditorSession::new(
                    editor,
                    resolution.kind_key.as_str(),
                    &connection,
                    Arc::clone(&self.host),
                );
                self.sessions.lock().insert(id, Arc::clone(&session));
                connection.connect(&session);
                session
            }
        };
        self.unattached.lock().remove(&id);
        if created {
            self.adopt_orphans(&connection);
        }

        if created || connection.status() == ServerStatus::Stopped {
            if let Err(e) = connection.start().await {
                warn!(server = %resolution.definition.name(), project = %project, "failed to start language server: {e}");
                if !connection.restart_pending()
                    && let Err(e) = self.registry.remove(&connection)
                {
                    warn!("could not remove failed connection: {e}");
                }
            }
        }
        Some(session)
    }

    /// Detaches an editor; its document is closed on the server when no
    /// other editor shows it.
    pub fn editor_closed(&self, editor: EditorId) {
        self.unattached.lock().remove(&editor);
        let Some(session) = self.sessions.lock().remove(&editor) else {
            return;
        };
        session.dispose();
        if let Some(connection) = session.connection() {
            connection.disconnect(editor, session.uri());
        }
    }

    /// The session of an editor.
    pub fn session(&self, editor: EditorId) -> Option<Arc<EditorSession>> {
        self.sessions.lock().get(&editor).cloned()
    }

    /// Sessions showing a document, by editor id.
    pub fn sessions_for(&self, uri: &Url) -> Vec<Arc<EditorSession>> {
        let mut sessions: Vec<Arc<EditorSession>> = self
            .sessions
            .lock()
            .values()
            .filter(|session| session.uri() == uri)
            .cloned()
            .collect();
        sessions.sort_by_key(|session| session.editor_id());
        sessions
    }

    /// Mirrors an edit of `uri` to every server the document is open on.
    pub fn document_changed(&self, uri: &Url, change: &DocumentChange) {
        let sessions = self.sessions_for(uri);
        let Some(text) = self
            .host
            .document_text(uri)
            .or_else(|| sessions.first().map(|session| session.text()))
        else {
            return;
        };
        for connection in distinct_connections(&sessions) {
            connection.document_changed(uri, change, &text);
        }
    }

    /// Forwards a save of `uri`.
    pub fn document_saved(&self, uri: &Url) {
        let sessions = self.sessions_for(uri);
        let Some(text) = self
            .host
            .document_text(uri)
            .or_else(|| sessions.first().map(|session| session.text()))
        else {
            return;
        };
        for connection in distinct_connections(&sessions) {
            connection.document_saved(uri, &text);
        }
    }

    /// Starts the servers registered for a project ahead of any editor.
    pub async fn project_opened(&self, root: Url) -> Vec<Arc<ServerConnection>> {
        let scope = ProjectScope::Project(root);
        let mut started: Vec<Arc<ServerConnection>> = Vec::new();
        for (kind_key, definition) in self.registry.definitions(&scope) {
            let extension = self.extensions.read().get(&kind_key).cloned();
            let (connection, created) = self.registry.get_or_insert(&definition, &scope, &kind_key, || {
                ServerConnection::new(Arc::clone(&definition), scope.clone(), self.connection_env(extension))
            });
            if created {
                self.adopt_orphans(&connection);
                started.push(connection);
            }
        }
        let results = join_all(started.iter().map(|connection| connection.start())).await;
        for (connection, result) in started.iter().zip(results) {
            if let Err(e) = result {
                warn!(server = %connection.definition().name(), project = %scope, "failed to start language server: {e}");
            }
        }
        started
    }

    /// Kills every server of a project and forgets its definitions and
    /// sessions.
    pub async fn project_closed(&self, root: Url) {
        let scope = ProjectScope::Project(root);
        let connections = self.registry.forget_project(&scope);
        self.registry.forget_project_definitions(&scope);

        let closed: Vec<Arc<EditorSession>> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<EditorId> = sessions
                .iter()
                .filter(|(_, session)| {
                    session
                        .connection()
                        .is_some_and(|c| connections.iter().any(|d| Arc::ptr_eq(&c, d)))
                })
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in &closed {
            session.dispose();
        }
        self.unattached
            .lock()
            .retain(|_, editor| ProjectScope::from(editor.project()) != scope);

        join_all(connections.iter().map(|connection| connection.terminate())).await;
        info!(project = %scope, connections = connections.len(), sessions = closed.len(), "project closed");
    }

    /// Connections of a project; `None` means application scope.
    pub fn connections(&self, project: Option<Url>) -> Vec<Arc<ServerConnection>> {
        self.registry.connections(&ProjectScope::from(project))
    }

    /// Sends new settings to every server of a project.
    pub fn did_change_configuration(&self, project: Option<Url>, settings: &Value) {
        for connection in self.connections(project) {
            connection.did_change_configuration(settings.clone());
        }
    }

    /// Searches symbols across the project's initialized servers.
    pub async fn workspace_symbols(&self, project: Option<Url>, query: &str) -> Vec<NavigationItem> {
        let connections = self.connections(project);
        self.symbols.search(&connections, query).await
    }

    /// Current timeout of an operation kind, in milliseconds.
    pub fn timeout(&self, kind: OpKind) -> u64 {
        self.timeouts.millis(kind)
    }

    /// Overrides one timeout.
    pub fn set_timeout(&self, kind: OpKind, millis: u64) {
        self.timeouts.set(kind, millis);
    }

    /// Overrides several timeouts at once.
    pub fn set_timeouts(&self, overrides: impl IntoIterator<Item = (OpKind, u64)>) {
        self.timeouts.set_all(overrides);
    }

    /// True if some registered definition could serve the file.
    pub fn is_supported(&self, uri: &Url) -> bool {
        let uri = sanitize_uri(uri);
        self.registry
            .is_kind_supported(file_name(&uri).unwrap_or_default(), file_extension(&uri))
    }

    /// Shuts every server down gracefully and drops all sessions.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<EditorSession>> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        for session in &sessions {
            session.dispose();
        }
        self.unattached.lock().clear();
        let connections = self.registry.all_connections();
        join_all(connections.iter().map(|connection| connection.shutdown())).await;
        for connection in &connections {
            if let Err(e) = self.registry.remove(connection) {
                debug!("{e}");
            }
        }
        info!(connections = connections.len(), "runtime shut down");
    }

    fn orphaned_sessions(&self) -> Vec<Arc<EditorSession>> {
        let mut orphans: Vec<Arc<EditorSession>> = self
            .sessions
            .lock()
            .values()
            .filter(|session| !session.is_disposed() && session.is_orphaned())
            .cloned()
            .collect();
        orphans.sort_by_key(|session| session.editor_id());
        orphans
    }

    /// Moves a session off its dead connection onto `connection`.
    fn rebind(&self, session: &Arc<EditorSession>, connection: &Arc<ServerConnection>) {
        if let Some(previous) = session.connection() {
            previous.disconnect(session.editor_id(), session.uri());
        }
        session.rebind(connection);
        connection.connect(session);
        debug!(editor = session.editor_id(), uri = %session.uri(), server = %connection.definition().name(), "session rebound");
    }

    /// Rebinds orphaned sessions that a new connection would serve.
    fn adopt_orphans(&self, connection: &Arc<ServerConnection>) {
        for session in self.orphaned_sessions() {
            let project = ProjectScope::from(session.editor().project());
            if project != *connection.project() {
                continue;
            }
            let uri = sanitize_uri(session.uri());
            let served = self.registry.resolve(&uri, &project).is_some_and(|resolution| {
                Arc::ptr_eq(&resolution.definition, connection.definition())
                    && resolution.kind_key == session.kind_key()
            });
            if served {
                self.rebind(&session, connection);
            }
        }
    }

    fn connection_env(&self, extension: Option<Arc<dyn LspExtension>>) -> ConnectionEnv {
        let modal = self.options.modal_messages;
        let handlers: Arc<dyn ClientHandlers> = match &extension {
            Some(extension) => extension.client_handlers(modal),
            None => Arc::new(DefaultClientHandlers::new(modal)),
        };
        ConnectionEnv {
            host: Arc::clone(&self.host),
            timeouts: Arc::clone(&self.timeouts),
            handlers,
            extension,
            restart: self.options.restart,
        }
    }
}

fn distinct_connections(sessions: &[Arc<EditorSession>]) -> Vec<Arc<ServerConnection>> {
    let mut connections: Vec<Arc<ServerConnection>> = Vec::new();
    for connection in sessions.iter().filter_map(|session| session.connection()) {
        if !connections.iter().any(|c| Arc::ptr_eq(c, &connection)) {
            connections.push(connection);
        }
    }
    connections
}
