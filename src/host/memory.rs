//! A headless, in-memory host.
//!
//! Backs the command-line client and the test suite. Documents live in a
//! map, every user-facing call is recorded and edit batches are applied with
//! an undo stack.

use std::collections::HashMap;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use lsp_types::{Diagnostic, Url};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::error::{LspError, Result};
use crate::lsp::document::DocumentChange;
use crate::lsp::edits::{EditBatch, OffsetEdit, apply_offset_edits};
use crate::lsp::semantic::SemanticToken;
use crate::lsp::types::path_to_url;

use super::{Editor, EditorId, Host, Notice, Prompt, UsageView};

#[derive(Debug, Default)]
struct MemoryDocument {
    text: String,
    undo: Vec<(String, String)>,
}

/// A prompt waiting for an answer.
#[derive(Debug)]
pub struct PendingPrompt {
    /// The prompt as shown.
    pub prompt: Prompt,
    reply: Option<oneshot::Sender<usize>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    documents: HashMap<Url, MemoryDocument>,
    notices: Vec<Notice>,
    dialogs: Vec<Notice>,
    prompts: Vec<PendingPrompt>,
    hints: Vec<(EditorId, usize, String)>,
    usages: Vec<UsageView>,
    diagnostics: HashMap<EditorId, Vec<Diagnostic>>,
    decorations: HashMap<EditorId, Vec<SemanticToken>>,
}

/// Callback told about a text change made through a [`MemoryHost`].
pub type ChangeListener = Arc<dyn Fn(&Url, &DocumentChange) + Send + Sync>;

#[derive(Default)]
struct Listeners(Mutex<Vec<ChangeListener>>);

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Listeners").field(&self.0.lock().len()).finish()
    }
}

/// Headless host keeping documents and UI output in memory.
#[derive(Debug, Default)]
pub struct MemoryHost {
    state: Mutex<MemoryState>,
    next_editor: AtomicU64,
    dismiss_prompts: bool,
    listeners: Listeners,
}

impl MemoryHost {
    /// Creates an empty host that keeps prompts pending until answered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a host that dismisses every prompt immediately.
    pub fn dismissing_prompts() -> Self {
        Self {
            dismiss_prompts: true,
            ..Self::default()
        }
    }

    /// Registers a callback run after every later text change.
    ///
    /// Typing, applied edit batches and undo all report here, so wiring
    /// this to [`LspRuntime::document_changed`] keeps servers in step.
    ///
    /// [`LspRuntime::document_changed`]: crate::lsp::LspRuntime::document_changed
    pub fn on_change(&self, listener: impl Fn(&Url, &DocumentChange) + Send + Sync + 'static) {
        self.listeners.0.lock().push(Arc::new(listener));
    }

    /// Runs the listeners. Must be called without the state lock held.
    fn changed(&self, uri: &Url, changes: &[DocumentChange]) {
        let listeners = self.listeners.0.lock().clone();
        for change in changes {
            for listener in &listeners {
                listener(uri, change);
            }
        }
    }

    /// Adds or replaces a document.
    pub fn open_document(&self, uri: &Url, text: impl Into<String>) {
        self.state.lock().documents.insert(
            uri.clone(),
            MemoryDocument {
                text: text.into(),
                undo: Vec::new(),
            },
        );
    }

    /// Loads a file from disk as a document.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or has no URI form.
    pub fn load_file(&self, path: &Path) -> Result<Url> {
        let text = std::fs::read_to_string(path)?;
        let uri = path_to_url(path)?;
        self.open_document(&uri, text);
        Ok(uri)
    }

    /// Current text of a document.
    pub fn text(&self, uri: &Url) -> Option<String> {
        self.state.lock().documents.get(uri).map(|d| d.text.clone())
    }

    /// Replaces `range` of a document with `text`, as if typed.
    ///
    /// # Errors
    ///
    /// Returns an error if the document is unknown or the range is not on
    /// character boundaries.
    pub fn edit(&self, uri: &Url, range: Range<usize>, text: &str) -> Result<DocumentChange> {
        let change = {
            let mut state = self.state.lock();
            let document = state
                .documents
                .get_mut(uri)
                .ok_or_else(|| LspError::DocumentNotFound(uri.to_string()))?;
            let old_text = document
                .text
                .get(range.clone())
                .ok_or_else(|| LspError::DocumentNotFound(format!("{uri}: range {range:?} out of bounds")))?
                .to_string();
            document.text.replace_range(range.clone(), text);
            DocumentChange::new(range.start, old_text, text)
        };
        self.changed(uri, std::slice::from_ref(&change));
        Ok(change)
    }

    /// Reverts the last applied edit batch on a document.
    pub fn undo(&self, uri: &Url) -> bool {
        let change = {
            let mut state = self.state.lock();
            let Some(document) = state.documents.get_mut(uri) else {
                return false;
            };
            let Some((label, previous)) = document.undo.pop() else {
                return false;
            };
            debug!(uri = %uri, label, "undo");
            let current = std::mem::replace(&mut document.text, previous.clone());
            DocumentChange::new(0, current, previous)
        };
        self.changed(uri, &[change]);
        true
    }

    /// Label of the edit batch `undo` would revert.
    pub fn undo_label(&self, uri: &Url) -> Option<String> {
        self.state
            .lock()
            .documents
            .get(uri)
            .and_then(|d| d.undo.last().map(|(label, _)| label.clone()))
    }

    /// Notifications shown so far.
    pub fn notices(&self) -> Vec<Notice> {
        self.state.lock().notices.clone()
    }

    /// Dialogs shown so far.
    pub fn dialogs(&self) -> Vec<Notice> {
        self.state.lock().dialogs.clone()
    }

    /// Prompts shown so far, answered or not.
    pub fn prompts(&self) -> Vec<Prompt> {
        self.state
            .lock()
            .prompts
            .iter()
            .map(|p| p.prompt.clone())
            .collect()
    }

    /// Answers prompt `index` with action `choice`.
    pub fn answer_prompt(&self, index: usize, choice: usize) -> bool {
        let reply = self
            .state
            .lock()
            .prompts
            .get_mut(index)
            .and_then(|p| p.reply.take());
        reply.is_some_and(|reply| reply.send(choice).is_ok())
    }

    /// Dismisses prompt `index` without choosing an action.
    pub fn dismiss_prompt(&self, index: usize) -> bool {
        self.state
            .lock()
            .prompts
            .get_mut(index)
            .and_then(|p| p.reply.take())
            .is_some()
    }

    /// Hints shown so far as (editor, offset, text).
    pub fn hints(&self) -> Vec<(EditorId, usize, String)> {
        self.state.lock().hints.clone()
    }

    /// Usage views shown so far.
    pub fn usages(&self) -> Vec<UsageView> {
        self.state.lock().usages.clone()
    }

    /// Diagnostics currently shown in an editor.
    pub fn diagnostics(&self, editor: EditorId) -> Vec<Diagnostic> {
        self.state
            .lock()
            .diagnostics
            .get(&editor)
            .cloned()
            .unwrap_or_default()
    }

    /// Semantic highlighting currently shown in an editor.
    pub fn decorations(&self, editor: EditorId) -> Vec<SemanticToken> {
        self.state
            .lock()
            .decorations
            .get(&editor)
            .cloned()
            .unwrap_or_default()
    }

    /// Opens an editor on a document the host already knows.
    pub fn open_editor(self: &Arc<Self>, uri: &Url, project: Option<Url>) -> Arc<MemoryEditor> {
        let id = self.next_editor.fetch_add(1, Ordering::SeqCst) + 1;
        Arc::new(MemoryEditor {
            id,
            uri: uri.clone(),
            project,
            host: Arc::clone(self),
            caret: Mutex::new(0),
            selection: Mutex::new(None),
            disposed: AtomicBool::new(false),
        })
    }
}

impl Host for MemoryHost {
    fn document_text(&self, uri: &Url) -> Option<String> {
        self.text(uri)
    }

    fn notify(&self, notice: Notice) {
        info!(title = %notice.title, severity = notice.severity.label(), "{}", notice.message);
        self.state.lock().notices.push(notice);
    }

    fn show_dialog(&self, notice: Notice) {
        info!(title = %notice.title, severity = notice.severity.label(), "dialog: {}", notice.message);
        self.state.lock().dialogs.push(notice);
    }

    fn prompt(&self, prompt: Prompt) -> oneshot::Receiver<usize> {
        let (tx, rx) = oneshot::channel();
        let reply = (!self.dismiss_prompts).then_some(tx);
        self.state.lock().prompts.push(PendingPrompt { prompt, reply });
        rx
    }

    fn apply_edits(&self, batch: EditBatch) -> bool {
        let mut reported = Vec::with_capacity(batch.documents.len());
        {
            let mut state = self.state.lock();
            if batch
                .documents
                .iter()
                .any(|d| !state.documents.contains_key(&d.uri))
            {
                warn!(label = %batch.label, "edit batch targets an unknown document");
                return false;
            }
            for document_edits in &batch.documents {
                if let Some(document) = state.documents.get_mut(&document_edits.uri) {
                    let changes = sequential_changes(&document.text, &document_edits.edits);
                    let updated = apply_offset_edits(&document.text, &document_edits.edits);
                    let previous = std::mem::replace(&mut document.text, updated);
                    document.undo.push((batch.label.clone(), previous));
                    reported.push((document_edits.uri.clone(), changes));
                }
            }
        }
        for (uri, changes) in &reported {
            self.changed(uri, changes);
        }
        true
    }

    fn show_hint(&self, editor: EditorId, offset: usize, text: &str) {
        self.state.lock().hints.push((editor, offset, text.to_string()));
    }

    fn show_usages(&self, view: UsageView) {
        self.state.lock().usages.push(view);
    }

    fn publish_diagnostics(&self, editor: EditorId, diagnostics: &[Diagnostic]) {
        self.state
            .lock()
            .diagnostics
            .insert(editor, diagnostics.to_vec());
    }

    fn set_decorations(&self, editor: EditorId, tokens: &[SemanticToken]) {
        self.state.lock().decorations.insert(editor, tokens.to_vec());
    }
}

/// Splits sorted offset edits into changes that can be replayed one after
/// another, each in offsets of the text left by the ones before it.
fn sequential_changes(text: &str, edits: &[OffsetEdit]) -> Vec<DocumentChange> {
    let mut shift = 0isize;
    edits
        .iter()
        .map(|edit| {
            let old_text = &text[edit.range.clone()];
            let offset = edit.range.start.saturating_add_signed(shift);
            shift += edit.text.len() as isize - old_text.len() as isize;
            DocumentChange::new(offset, old_text, edit.text.as_str())
        })
        .collect()
}

/// An editor over a [`MemoryHost`] document.
#[derive(Debug)]
pub struct MemoryEditor {
    id: EditorId,
    uri: Url,
    project: Option<Url>,
    host: Arc<MemoryHost>,
    caret: Mutex<usize>,
    selection: Mutex<Option<Range<usize>>>,
    disposed: AtomicBool,
}

impl MemoryEditor {
    /// Moves the caret.
    pub fn set_caret(&self, offset: usize) {
        *self.caret.lock() = offset;
    }

    /// Selects a byte range; `None` clears the selection.
    pub fn select(&self, range: Option<Range<usize>>) {
        *self.selection.lock() = range;
    }

    /// Marks the editor closed.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
    }
}

impl Editor for MemoryEditor {
    fn id(&self) -> EditorId {
        self.id
    }

    fn uri(&self) -> Url {
        self.uri.clone()
    }

    fn project(&self) -> Option<Url> {
        self.project.clone()
    }

    fn text(&self) -> String {
        self.host.text(&self.uri).unwrap_or_default()
    }

    fn caret_offset(&self) -> usize {
        *self.caret.lock()
    }

    fn selection(&self) -> Option<Range<usize>> {
        self.selection.lock().clone()
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use crate::lsp::edits::DocumentEdits;

    use super::*;

    fn uri() -> Url {
        Url::parse("file:///p/a.zig").unwrap()
    }

    #[test]
    fn test_apply_edits_is_one_undo_step() {
        let host = MemoryHost::new();
        host.open_document(&uri(), "abc");
        let batch = EditBatch {
            label: "Reformat Code".into(),
            documents: vec![DocumentEdits {
                uri: uri(),
                edits: vec![
                    OffsetEdit { range: 0..1, text: "A".into() },
                    OffsetEdit { range: 2..3, text: "C".into() },
                ],
            }],
        };
        assert!(host.apply_edits(batch));
        assert_eq!(host.text(&uri()).unwrap(), "AbC");
        assert_eq!(host.undo_label(&uri()).as_deref(), Some("Reformat Code"));
        assert!(host.undo(&uri()));
        assert_eq!(host.text(&uri()).unwrap(), "abc");
        assert!(!host.undo(&uri()));
    }

    #[test]
    fn test_apply_edits_with_unknown_document_changes_nothing() {
        let host = MemoryHost::new();
        host.open_document(&uri(), "abc");
        let batch = EditBatch {
            label: "Rename".into(),
            documents: vec![
                DocumentEdits {
                    uri: uri(),
                    edits: vec![OffsetEdit { range: 0..1, text: "x".into() }],
                },
                DocumentEdits {
                    uri: Url::parse("file:///p/gone.zig").unwrap(),
                    edits: vec![],
                },
            ],
        };
        assert!(!host.apply_edits(batch));
        assert_eq!(host.text(&uri()).unwrap(), "abc");
    }

    #[test]
    fn test_listeners_see_batch_edits_in_replay_order() {
        let host = MemoryHost::new();
        host.open_document(&uri(), "one two three");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        host.on_change(move |uri, change| sink.lock().push((uri.clone(), change.clone())));
        let batch = EditBatch {
            label: "Rename".into(),
            documents: vec![DocumentEdits {
                uri: uri(),
                edits: vec![
                    OffsetEdit { range: 0..3, text: "1".into() },
                    OffsetEdit { range: 8..13, text: "3".into() },
                ],
            }],
        };

        assert!(host.apply_edits(batch));
        assert!(host.undo(&uri()));

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].1, DocumentChange::new(0, "one", "1"));
        assert_eq!(seen[1].1, DocumentChange::new(6, "three", "3"));
        assert_eq!(seen[2].1, DocumentChange::new(0, "1 two 3", "one two three"));
        assert!(seen.iter().all(|(seen_uri, _)| *seen_uri == uri()));
    }

    #[test]
    fn test_edit_reports_change() {
        let host = MemoryHost::new();
        host.open_document(&uri(), "const a = 1;");
        let change = host.edit(&uri(), 6..7, "bb").unwrap();
        assert_eq!(change, DocumentChange::new(6, "a", "bb"));
        assert_eq!(host.text(&uri()).unwrap(), "const bb = 1;");
        assert!(host.edit(&uri(), 40..41, "x").is_err());
    }

    #[tokio::test]
    async fn test_prompt_answer_and_dismiss() {
        let host = MemoryHost::new();
        let prompt = Prompt {
            title: "t".into(),
            message: "m".into(),
            severity: super::super::Severity::Info,
            actions: vec!["A".into(), "B".into()],
            modal: false,
        };
        let answered = host.prompt(prompt.clone());
        let dismissed = host.prompt(prompt);
        assert!(host.answer_prompt(0, 1));
        assert!(host.dismiss_prompt(1));
        assert_eq!(answered.await.unwrap(), 1);
        assert!(dismissed.await.is_err());
    }

    #[test]
    fn test_editor_reads_host_text() {
        let host = Arc::new(MemoryHost::new());
        host.open_document(&uri(), "x");
        let editor = host.open_editor(&uri(), None);
        let other = host.open_editor(&uri(), None);
        assert_ne!(editor.id(), other.id());
        assert_eq!(editor.text(), "x");
        editor.set_caret(1);
        assert_eq!(editor.caret_offset(), 1);
        editor.dispose();
        assert!(editor.is_disposed());
    }
}
