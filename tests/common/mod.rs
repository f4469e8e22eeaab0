//! Common test helpers and utilities.

#![allow(dead_code)]

pub mod mock_server;
pub mod temp_workspace;

use std::sync::Arc;
use std::time::Duration;

use kadabra_lsp_runtime::host::{MemoryEditor, MemoryHost};
use kadabra_lsp_runtime::lsp::{
    EditorSession, LspRuntime, RestartPolicy, RuntimeOptions, ServerDefinition, Timeouts, Url,
};

// Re-export for convenience
pub use mock_server::{MockConnector, capabilities_with_sync, full_capabilities, legend};
pub use temp_workspace::TestWorkspace;

/// Restart policy with delays short enough for tests.
pub fn fast_restarts() -> RestartPolicy {
    RestartPolicy {
        max_failures: 3,
        window: Duration::from_secs(60),
        initial_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
        max_restarts: 3,
    }
}

/// Project root URL for a synthetic project.
pub fn project_url(name: &str) -> Url {
    Url::parse(&format!("file:///{name}/")).expect("valid project url")
}

/// Definition served by a mock connector.
pub fn mock_definition(name: &str, kind_keys: &[&str], mock: &MockConnector) -> ServerDefinition {
    ServerDefinition::builder(name)
        .kind_keys(kind_keys.iter().copied())
        .connector(mock.arc())
        .build()
}

/// A runtime over an in-memory host.
pub struct Harness {
    pub host: Arc<MemoryHost>,
    pub runtime: Arc<LspRuntime>,
    pub project: Url,
}

impl Harness {
    /// Harness with fast restarts and default timeouts.
    pub fn new() -> Self {
        Self::with_host(Arc::new(MemoryHost::new()), fast_restarts())
    }

    /// Harness with a custom host and restart policy.
    pub fn with_host(host: Arc<MemoryHost>, restart: RestartPolicy) -> Self {
        Self::with_options(
            host,
            RuntimeOptions {
                restart,
                ..RuntimeOptions::default()
            },
        )
    }

    /// Harness with custom runtime options.
    ///
    /// Every text change made through the host reaches the runtime.
    pub fn with_options(host: Arc<MemoryHost>, options: RuntimeOptions) -> Self {
        let runtime = Arc::new(LspRuntime::with_options(
            host.clone(),
            options,
            Arc::new(Timeouts::new()),
        ));
        let listener = Arc::downgrade(&runtime);
        host.on_change(move |uri, change| {
            if let Some(runtime) = listener.upgrade() {
                runtime.document_changed(uri, change);
            }
        });
        Self {
            host,
            runtime,
            project: project_url("work"),
        }
    }

    /// Registers a mock-backed definition for the harness project.
    pub async fn register(&self, name: &str, kind_keys: &[&str], mock: &MockConnector) {
        self.runtime
            .register_definition(mock_definition(name, kind_keys, mock), Some(self.project.clone()))
            .await;
    }

    /// Adds a document under the harness project.
    pub fn document(&self, file: &str, text: &str) -> Url {
        let uri = self.project.join(file).expect("valid document url");
        self.host.open_document(&uri, text);
        uri
    }

    /// Opens an editor on a known document and binds it.
    ///
    /// ## Panics
    /// Panics if no server handles the document.
    pub async fn open(&self, uri: &Url) -> (Arc<MemoryEditor>, Arc<EditorSession>) {
        let editor = self.host.open_editor(uri, Some(self.project.clone()));
        let session = self
            .runtime
            .editor_opened(editor.clone())
            .await
            .expect("a server handles the document");
        (editor, session)
    }

    /// Types `text` at `offset`.
    pub fn type_at(&self, uri: &Url, offset: usize, text: &str) {
        self.host
            .edit(uri, offset..offset, text)
            .expect("edit applies");
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Gives fire-and-forget traffic time to reach the mock.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Polls `check` until it holds.
///
/// ## Panics
/// Panics if it does not hold within five seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
