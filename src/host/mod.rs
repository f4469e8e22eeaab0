//! The editor host the runtime runs inside.
//!
//! The runtime never touches UI state directly. Anything user-visible goes
//! through [`Host`], and UI-affecting calls are scheduled with
//! [`Host::run_on_ui`] so a host with a single UI thread can marshal them.

pub mod memory;

use std::ops::Range;
use std::sync::Arc;

use lsp_types::{Diagnostic, FormattingOptions, Location, MessageType, Url};
use tokio::sync::oneshot;

use crate::lsp::edits::EditBatch;
use crate::lsp::semantic::SemanticToken;

pub use memory::{MemoryEditor, MemoryHost};

/// Identifies an open editor.
pub type EditorId = u64;

/// A unit of work to run on the UI thread.
pub type UiJob = Box<dyn FnOnce() + Send + 'static>;

/// An open editor over one document.
pub trait Editor: Send + Sync {
    /// Stable identifier.
    fn id(&self) -> EditorId;

    /// The document shown in the editor.
    fn uri(&self) -> Url;

    /// Root of the project the editor belongs to, if any.
    fn project(&self) -> Option<Url>;

    /// Current document text.
    fn text(&self) -> String;

    /// Caret position as a byte offset.
    fn caret_offset(&self) -> usize;

    /// Selected byte range, if any.
    fn selection(&self) -> Option<Range<usize>>;

    /// True once the editor has been closed.
    fn is_disposed(&self) -> bool;

    /// Formatting preferences for the document.
    fn formatting_options(&self) -> FormattingOptions {
        FormattingOptions {
            tab_size: 4,
            insert_spaces: true,
            ..FormattingOptions::default()
        }
    }
}

/// Severity of a user-facing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Error.
    Error,
    /// Warning.
    Warning,
    /// Information.
    Info,
    /// Log entry.
    Log,
}

impl Severity {
    /// Maps an LSP message type; unknown types are treated as info.
    pub fn from_message_type(kind: MessageType) -> Self {
        if kind == MessageType::ERROR {
            Self::Error
        } else if kind == MessageType::WARNING {
            Self::Warning
        } else if kind == MessageType::LOG {
            Self::Log
        } else {
            Self::Info
        }
    }

    /// Human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "Error",
            Self::Warning => "Warning",
            Self::Info => "Info",
            Self::Log => "Log",
        }
    }
}

/// A non-interactive message for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    /// Title.
    pub title: String,
    /// Message body.
    pub message: String,
    /// Severity.
    pub severity: Severity,
}

/// A message with actions the user picks from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Title.
    pub title: String,
    /// Message body.
    pub message: String,
    /// Severity.
    pub severity: Severity,
    /// Action labels, in server order.
    pub actions: Vec<String>,
    /// Blocking dialog rather than a notification balloon.
    pub modal: bool,
}

/// Locations to present in a usages view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageView {
    /// View title.
    pub title: String,
    /// Every location, in server order.
    pub locations: Vec<Location>,
    /// Distinct files, in first-seen order.
    pub files: Vec<Url>,
}

/// Services the runtime needs from the editor.
pub trait Host: Send + Sync {
    /// Schedules a job on the UI thread. Headless hosts run it inline.
    fn run_on_ui(&self, job: UiJob) {
        job();
    }

    /// Current text of a document, if the host knows it.
    fn document_text(&self, uri: &Url) -> Option<String>;

    /// True if the URI resolves to a file the host can navigate to.
    fn is_known_file(&self, uri: &Url) -> bool {
        self.document_text(uri).is_some() || uri.to_file_path().is_ok_and(|path| path.exists())
    }

    /// Shows a notification.
    fn notify(&self, notice: Notice);

    /// Shows a blocking dialog. Defaults to a notification.
    fn show_dialog(&self, notice: Notice) {
        self.notify(notice);
    }

    /// Asks the user to pick an action.
    ///
    /// The receiver yields the chosen action index; dropping the sender
    /// means the prompt was dismissed.
    fn prompt(&self, prompt: Prompt) -> oneshot::Receiver<usize>;

    /// Applies a batch of edits as one undoable action. Returns false if
    /// nothing was applied.
    ///
    /// Applied edits are ordinary text changes: the host reports them
    /// through `LspRuntime::document_changed` like typing.
    fn apply_edits(&self, batch: EditBatch) -> bool;

    /// Shows a transient hint in an editor.
    fn show_hint(&self, editor: EditorId, offset: usize, text: &str);

    /// Presents a usages view.
    fn show_usages(&self, view: UsageView);

    /// Replaces the diagnostics shown in an editor.
    fn publish_diagnostics(&self, editor: EditorId, diagnostics: &[Diagnostic]);

    /// Replaces the semantic highlighting of an editor.
    fn set_decorations(&self, editor: EditorId, tokens: &[SemanticToken]);
}

/// Runs a closure on the host's UI thread and waits for its result.
///
/// Returns `None` if the host dropped the job without running it.
pub async fn on_ui<T, F>(host: &Arc<dyn Host>, f: F) -> Option<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Host) -> T + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    let target = Arc::clone(host);
    host.run_on_ui(Box::new(move || {
        let _ = tx.send(f(target.as_ref()));
    }));
    rx.await.ok()
}
