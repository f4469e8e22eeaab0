//! Per-editor request plumbing.
//!
//! An [`EditorSession`] binds one open editor to the connection serving its
//! document. It turns caret offsets into LSP positions, runs requests under
//! the connection's timeouts and drops responses that arrive for a disposed
//! editor, a moved caret or an older document version.

use std::ops::Range;
use std::sync::{Arc, Weak};

use lsp_types::{
    CodeActionContext, CodeActionOrCommand, CodeActionParams, CompletionItem, CompletionParams,
    CompletionResponse, Diagnostic, DocumentFormattingParams, DocumentRangeFormattingParams,
    DocumentSymbolParams, DocumentSymbolResponse, ExecuteCommandParams, GotoDefinitionParams,
    GotoDefinitionResponse, HoverContents, HoverParams, Location, MarkedString,
    PartialResultParams, Position, ReferenceContext, ReferenceParams, SemanticTokens,
    SemanticTokensDelta, SemanticTokensDeltaParams, SemanticTokensFullDeltaResult,
    SemanticTokensLegend, SemanticTokensParams, SemanticTokensResult, TextDocumentIdentifier,
    TextDocumentPositionParams, Url, WorkDoneProgressParams,
};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::host::{Editor, EditorId, Host, UsageView, on_ui};

use super::capabilities::Feature;
use super::connection::ServerConnection;
use super::edits::{DocumentEdits, EditBatch, resolve_text_edits};
use super::handlers::sort_diagnostics;
use super::requests::{RequestFuture, RequestManager};
use super::semantic::{SemanticCache, SemanticToken};
use super::timeouts::OpKind;
use super::types::offset_to_position;

/// Undo label for formatting edits.
pub const REFORMAT_LABEL: &str = "Reformat Code";

/// Hint shown when a reference search comes back empty.
pub const NO_REFERENCES_HINT: &str = "No references found";

/// Result of a reference search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct References {
    /// Every location, in server order.
    pub locations: Vec<Location>,
    /// Distinct files, in first-seen order.
    pub files: Vec<Url>,
}

impl References {
    fn from_locations(locations: Vec<Location>) -> Self {
        let mut files: Vec<Url> = Vec::new();
        for location in &locations {
            if !files.contains(&location.uri) {
                files.push(location.uri.clone());
            }
        }
        Self { locations, files }
    }

    /// True when nothing was found.
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    diagnostics: Vec<Diagnostic>,
    semantic: SemanticCache,
}

/// What a response is checked against when it arrives.
#[derive(Debug, Clone, Copy)]
struct Snapshot {
    version: Option<i32>,
    caret: Option<usize>,
}

/// One open editor bound to a server connection.
pub struct EditorSession {
    editor: Arc<dyn Editor>,
    editor_id: EditorId,
    uri: Url,
    kind_key: String,
    connection: RwLock<Weak<ServerConnection>>,
    host: Arc<dyn Host>,
    cancel: CancellationToken,
    state: Mutex<SessionState>,
}

impl std::fmt::Debug for EditorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EditorSession")
            .field("editor", &self.editor_id)
            .field("uri", &self.uri.as_str())
            .field("kind_key", &self.kind_key)
            .finish_non_exhaustive()
    }
}

impl EditorSession {
    /// Creates a session. It is not attached until the connection accepts it.
    pub fn new(
        editor: Arc<dyn Editor>,
        kind_key: impl Into<String>,
        connection: &Arc<ServerConnection>,
        host: Arc<dyn Host>,
    ) -> Arc<Self> {
        Arc::new(Self {
            editor_id: editor.id(),
            uri: editor.uri(),
            editor,
            kind_key: kind_key.into(),
            connection: RwLock::new(Arc::downgrade(connection)),
            host,
            cancel: CancellationToken::new(),
            state: Mutex::new(SessionState::default()),
        })
    }

    /// Identifier of the editor.
    pub fn editor_id(&self) -> EditorId {
        self.editor_id
    }

    /// The document the editor shows.
    pub fn uri(&self) -> &Url {
        &self.uri
    }

    /// Kind key the document was resolved with.
    pub fn kind_key(&self) -> &str {
        &self.kind_key
    }

    /// The editor.
    pub fn editor(&self) -> &Arc<dyn Editor> {
        &self.editor
    }

    /// Current document text.
    pub fn text(&self) -> String {
        self.editor.text()
    }

    /// The serving connection, while it exists.
    pub fn connection(&self) -> Option<Arc<ServerConnection>> {
        self.connection.read().upgrade()
    }

    /// True when the serving connection is gone or crashed for good.
    pub fn is_orphaned(&self) -> bool {
        self.connection().is_none_or(|connection| !connection.is_reusable())
    }

    /// Points the session at a replacement connection. Caches tied to the
    /// previous server are dropped.
    pub(crate) fn rebind(&self, connection: &Arc<ServerConnection>) {
        *self.connection.write() = Arc::downgrade(connection);
        self.state.lock().semantic.reset();
        self.set_diagnostics(Vec::new());
    }

    /// True once the editor or the session has been closed.
    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled() || self.editor.is_disposed()
    }

    /// Cancels every outstanding request of the session.
    pub fn dispose(&self) {
        self.cancel.cancel();
    }

    /// Completion items matching the identifier prefix before `offset`.
    pub async fn completion(&self, offset: usize) -> Vec<CompletionItem> {
        let text = self.editor.text();
        let prefix = completion_prefix(&text, offset).to_string();
        let params = CompletionParams {
            text_document_position: self.position_params(offset_to_position(&text, offset)),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: None,
        };
        let items = match self
            .request(OpKind::Completion, true, |m| m.completion(params))
            .await
            .flatten()
        {
            Some(CompletionResponse::Array(items)) => items,
            Some(CompletionResponse::List(list)) => list.items,
            None => return Vec::new(),
        };
        let total = items.len();
        let items: Vec<CompletionItem> = items
            .into_iter()
            .filter(|item| matches_prefix(item, &prefix))
            .collect();
        debug!(uri = %self.uri, prefix, total, kept = items.len(), "completion");
        items
    }

    /// Hover text at `offset` as markdown; empty when there is nothing to show.
    pub async fn hover(&self, offset: usize) -> String {
        let text = self.editor.text();
        let params = HoverParams {
            text_document_position_params: self.position_params(offset_to_position(&text, offset)),
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.request(OpKind::Hover, true, |m| m.hover(params))
            .await
            .flatten()
            .map(|hover| hover_markdown(&hover.contents))
            .unwrap_or_default()
    }

    /// Finds references, declaration included, and presents them.
    ///
    /// An empty result shows a hint at `offset` instead of a usages view.
    pub async fn references(&self, offset: usize) -> References {
        let text = self.editor.text();
        let params = ReferenceParams {
            text_document_position: self.position_params(offset_to_position(&text, offset)),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
            context: ReferenceContext {
                include_declaration: true,
            },
        };
        let locations = self
            .request(OpKind::References, false, |m| m.references(params))
            .await
            .flatten()
            .unwrap_or_default();
        if self.is_disposed() {
            return References::default();
        }
        let references = References::from_locations(locations);

        let host = Arc::clone(&self.host);
        let editor = self.editor_id;
        if references.is_empty() {
            self.host
                .run_on_ui(Box::new(move || host.show_hint(editor, offset, NO_REFERENCES_HINT)));
        } else {
            let view = UsageView {
                title: format!("References to '{}'", identifier_at(&text, offset)),
                locations: references.locations.clone(),
                files: references.files.clone(),
            };
            self.host.run_on_ui(Box::new(move || host.show_usages(view)));
        }
        references
    }

    /// Definition targets of the symbol at `offset`.
    pub async fn definition(&self, offset: usize) -> Vec<Location> {
        let text = self.editor.text();
        let params = GotoDefinitionParams {
            text_document_position_params: self.position_params(offset_to_position(&text, offset)),
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        match self
            .request(OpKind::Definition, false, |m| m.definition(params))
            .await
            .flatten()
        {
            Some(GotoDefinitionResponse::Scalar(location)) => vec![location],
            Some(GotoDefinitionResponse::Array(locations)) => locations,
            Some(GotoDefinitionResponse::Link(links)) => links
                .into_iter()
                .map(|link| Location {
                    uri: link.target_uri,
                    range: link.target_selection_range,
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Formats the selection, or the whole document when nothing is
    /// selected, as one undoable edit. Returns true if edits were applied.
    pub async fn reformat(&self) -> bool {
        let text = self.editor.text();
        let options = self.editor.formatting_options();
        let document = TextDocumentIdentifier {
            uri: self.uri.clone(),
        };
        let edits = match self.editor.selection().filter(|range| !range.is_empty()) {
            Some(range) => {
                let params = DocumentRangeFormattingParams {
                    text_document: document,
                    range: lsp_types::Range {
                        start: offset_to_position(&text, range.start),
                        end: offset_to_position(&text, range.end),
                    },
                    options,
                    work_done_progress_params: WorkDoneProgressParams::default(),
                };
                self.request(OpKind::Formatting, false, |m| m.range_formatting(params))
                    .await
            }
            None => {
                let params = DocumentFormattingParams {
                    text_document: document,
                    options,
                    work_done_progress_params: WorkDoneProgressParams::default(),
                };
                self.request(OpKind::Formatting, false, |m| m.formatting(params))
                    .await
            }
        };
        let Some(edits) = edits.flatten().filter(|edits| !edits.is_empty()) else {
            return false;
        };
        let edits = match resolve_text_edits(&self.uri, &text, &edits) {
            Ok(edits) => edits,
            Err(e) => {
                warn!(uri = %self.uri, "discarding formatting edits: {e}");
                return false;
            }
        };
        let batch = EditBatch {
            label: REFORMAT_LABEL.to_string(),
            documents: vec![DocumentEdits {
                uri: self.uri.clone(),
                edits,
            }],
        };
        on_ui(&self.host, move |h| h.apply_edits(batch))
            .await
            .unwrap_or(false)
    }

    /// Symbols of the document, flat or nested as the server sends them.
    pub async fn document_symbols(&self) -> Option<DocumentSymbolResponse> {
        let params = DocumentSymbolParams {
            text_document: TextDocumentIdentifier {
                uri: self.uri.clone(),
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.request(OpKind::Symbols, false, |m| m.document_symbol(params))
            .await
            .flatten()
    }

    /// Code actions for a byte range, with the diagnostics it overlaps.
    pub async fn code_actions(&self, range: Range<usize>) -> Vec<CodeActionOrCommand> {
        let text = self.editor.text();
        let range = lsp_types::Range {
            start: offset_to_position(&text, range.start),
            end: offset_to_position(&text, range.end),
        };
        let diagnostics = self
            .state
            .lock()
            .diagnostics
            .iter()
            .filter(|d| overlaps(d.range, range))
            .cloned()
            .collect();
        let params = CodeActionParams {
            text_document: TextDocumentIdentifier {
                uri: self.uri.clone(),
            },
            range,
            context: CodeActionContext {
                diagnostics,
                only: None,
                trigger_kind: None,
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        self.request(OpKind::CodeAction, false, |m| m.code_action(params))
            .await
            .flatten()
            .unwrap_or_default()
    }

    /// Runs a server command.
    pub async fn execute_command(&self, command: impl Into<String>, arguments: Vec<Value>) -> Option<Value> {
        let params = ExecuteCommandParams {
            command: command.into(),
            arguments,
            work_done_progress_params: WorkDoneProgressParams::default(),
        };
        self.request(OpKind::ExecuteCommand, false, |m| m.execute_command(params))
            .await
            .flatten()
    }

    /// Refreshes semantic highlighting and pushes it to the editor.
    ///
    /// Asks for a delta against the last result id when the server supports
    /// it, otherwise for the full set. A delta that does not fit the cache
    /// falls back to a full request.
    pub async fn semantic_highlighting(&self) -> Vec<SemanticToken> {
        let Some(manager) = self.connection().and_then(|c| c.request_manager()) else {
            return self.semantic_tokens();
        };
        let Some(legend) = manager.capabilities().semantic_legend() else {
            return self.semantic_tokens();
        };
        let previous = self
            .state
            .lock()
            .semantic
            .result_id()
            .map(str::to_string)
            .filter(|_| manager.capabilities().supports(Feature::SemanticTokensDelta));

        let tokens = match previous {
            Some(previous_result_id) => {
                let delta = self.semantic_delta(previous_result_id, &legend).await;
                let reset = self.semantic_result_id().is_none();
                match delta {
                    Some(tokens) => Some(tokens),
                    None if reset => self.semantic_full(&legend).await,
                    None => None,
                }
            }
            None => self.semantic_full(&legend).await,
        };
        let Some(tokens) = tokens else {
            return self.semantic_tokens();
        };
        if !self.is_disposed() {
            let host = Arc::clone(&self.host);
            let editor = self.editor_id;
            let decorations = tokens.clone();
            self.host
                .run_on_ui(Box::new(move || host.set_decorations(editor, &decorations)));
        }
        tokens
    }

    /// Cached semantic tokens.
    pub fn semantic_tokens(&self) -> Vec<SemanticToken> {
        self.state.lock().semantic.tokens().to_vec()
    }

    /// Result id of the cached semantic tokens.
    pub fn semantic_result_id(&self) -> Option<String> {
        self.state.lock().semantic.result_id().map(str::to_string)
    }

    /// Diagnostics last published for the document.
    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.state.lock().diagnostics.clone()
    }

    /// Sends `didSave` for the document.
    pub fn save(&self) {
        if let Some(connection) = self.connection() {
            connection.document_saved(&self.uri, &self.editor.text());
        }
    }

    pub(crate) fn set_diagnostics(&self, mut diagnostics: Vec<Diagnostic>) {
        sort_diagnostics(&mut diagnostics);
        self.state.lock().diagnostics = diagnostics.clone();
        if self.is_disposed() {
            return;
        }
        let host = Arc::clone(&self.host);
        let editor = self.editor_id;
        self.host
            .run_on_ui(Box::new(move || host.publish_diagnostics(editor, &diagnostics)));
    }

    async fn semantic_full(&self, legend: &SemanticTokensLegend) -> Option<Vec<SemanticToken>> {
        let params = SemanticTokensParams {
            text_document: TextDocumentIdentifier {
                uri: self.uri.clone(),
            },
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let full = match self
            .request(OpKind::Highlighting, false, |m| m.semantic_tokens_full(params))
            .await
            .flatten()?
        {
            SemanticTokensResult::Tokens(tokens) => tokens,
            SemanticTokensResult::Partial(partial) => SemanticTokens {
                result_id: None,
                data: partial.data,
            },
        };
        Some(self.state.lock().semantic.apply_full(full, legend).to_vec())
    }

    async fn semantic_delta(
        &self,
        previous_result_id: String,
        legend: &SemanticTokensLegend,
    ) -> Option<Vec<SemanticToken>> {
        let params = SemanticTokensDeltaParams {
            text_document: TextDocumentIdentifier {
                uri: self.uri.clone(),
            },
            previous_result_id,
            work_done_progress_params: WorkDoneProgressParams::default(),
            partial_result_params: PartialResultParams::default(),
        };
        let response = self
            .request(OpKind::Highlighting, false, |m| m.semantic_tokens_full_delta(params))
            .await
            .flatten()?;
        let mut state = self.state.lock();
        match response {
            SemanticTokensFullDeltaResult::Tokens(full) => {
                Some(state.semantic.apply_full(full, legend).to_vec())
            }
            SemanticTokensFullDeltaResult::TokensDelta(delta) => {
                state.semantic.apply_delta(delta, legend).map(<[_]>::to_vec)
            }
            SemanticTokensFullDeltaResult::PartialTokensDelta { edits } => state
                .semantic
                .apply_delta(SemanticTokensDelta { result_id: None, edits }, legend)
                .map(<[_]>::to_vec),
        }
    }

    async fn request<T>(
        &self,
        kind: OpKind,
        track_caret: bool,
        build: impl FnOnce(&dyn RequestManager) -> Option<RequestFuture<T>>,
    ) -> Option<T> {
        if self.is_disposed() {
            return None;
        }
        let connection = self.connection()?;
        let manager = connection.request_manager()?;
        let before = Snapshot {
            version: connection.document_version(&self.uri),
            caret: track_caret.then(|| self.editor.caret_offset()),
        };
        let request = build(manager.as_ref())?;

        let result = tokio::select! {
            () = self.cancel.cancelled() => {
                debug!(uri = %self.uri, %kind, "request cancelled");
                return None;
            }
            result = connection.execute(kind, Some(request)) => result,
        };
        if self.is_stale(&connection, before) {
            debug!(uri = %self.uri, %kind, "discarding stale response");
            return None;
        }
        result
    }

    fn is_stale(&self, connection: &ServerConnection, before: Snapshot) -> bool {
        self.is_disposed()
            || connection.document_version(&self.uri) != before.version
            || before
                .caret
                .is_some_and(|caret| caret != self.editor.caret_offset())
    }

    fn position_params(&self, position: Position) -> TextDocumentPositionParams {
        TextDocumentPositionParams {
            text_document: TextDocumentIdentifier {
                uri: self.uri.clone(),
            },
            position,
        }
    }
}

/// Renders hover contents as markdown.
///
/// Plain strings are joined with newlines and language strings are fenced.
pub fn hover_markdown(contents: &HoverContents) -> String {
    fn marked(s: &MarkedString) -> String {
        match s {
            MarkedString::String(s) => s.clone(),
            MarkedString::LanguageString(ls) => format!("```{}\n{}\n```", ls.language, ls.value),
        }
    }
    match contents {
        HoverContents::Scalar(s) => marked(s),
        HoverContents::Array(items) => items
            .iter()
            .map(marked)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        HoverContents::Markup(markup) => markup.value.clone(),
    }
}

fn is_identifier_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn clamp_to_boundary(text: &str, offset: usize) -> usize {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

/// Identifier characters immediately before `offset`.
pub fn completion_prefix(text: &str, offset: usize) -> &str {
    let end = clamp_to_boundary(text, offset);
    let start = text[..end]
        .char_indices()
        .rev()
        .take_while(|(_, c)| is_identifier_char(*c))
        .last()
        .map_or(end, |(i, _)| i);
    &text[start..end]
}

fn identifier_at(text: &str, offset: usize) -> &str {
    let offset = clamp_to_boundary(text, offset);
    let start = offset - completion_prefix(text, offset).len();
    let end = text[offset..]
        .char_indices()
        .find(|(_, c)| !is_identifier_char(*c))
        .map_or(text.len(), |(i, _)| offset + i);
    &text[start..end]
}

/// Case-insensitive prefix match on the item's filter text or label.
pub fn matches_prefix(item: &CompletionItem, prefix: &str) -> bool {
    if prefix.is_empty() {
        return true;
    }
    let candidate = item.filter_text.as_deref().unwrap_or(&item.label);
    candidate.to_lowercase().starts_with(&prefix.to_lowercase())
}

fn overlaps(a: lsp_types::Range, b: lsp_types::Range) -> bool {
    a.start <= b.end && b.start <= a.end
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{LanguageString, MarkupContent, MarkupKind};

    fn item(label: &str, filter: Option<&str>) -> CompletionItem {
        CompletionItem {
            label: label.to_string(),
            filter_text: filter.map(str::to_string),
            ..CompletionItem::default()
        }
    }

    #[test]
    fn test_completion_prefix() {
        assert_eq!(completion_prefix("const foo_ba", 12), "foo_ba");
        assert_eq!(completion_prefix("x.", 2), "");
        assert_eq!(completion_prefix("", 0), "");
        assert_eq!(completion_prefix("abc", 99), "abc");
        assert_eq!(completion_prefix("a(bé", 5), "bé");
    }

    #[test]
    fn test_matches_prefix() {
        assert!(matches_prefix(&item("println", None), "Pri"));
        assert!(!matches_prefix(&item("println", None), "x"));
        assert!(matches_prefix(&item("@import", Some("import")), "imp"));
        assert!(matches_prefix(&item("anything", None), ""));
    }

    #[test]
    fn test_identifier_at() {
        let text = "let value = other;";
        assert_eq!(identifier_at(text, 6), "value");
        assert_eq!(identifier_at(text, 4), "value");
        assert_eq!(identifier_at(text, 17), "other");
    }

    #[test]
    fn test_hover_markdown() {
        let markup = HoverContents::Markup(MarkupContent {
            kind: MarkupKind::Markdown,
            value: "**fn** main".to_string(),
        });
        assert_eq!(hover_markdown(&markup), "**fn** main");

        let array = HoverContents::Array(vec![
            MarkedString::String("first".to_string()),
            MarkedString::LanguageString(LanguageString {
                language: "zig".to_string(),
                value: "const x = 1;".to_string(),
            }),
            MarkedString::String(String::new()),
        ]);
        assert_eq!(hover_markdown(&array), "first\n```zig\nconst x = 1;\n```");

        assert_eq!(hover_markdown(&HoverContents::Array(Vec::new())), "");
    }

    #[test]
    fn test_references_collect_distinct_files() {
        let a = Url::parse("file:///p/a.zig").unwrap();
        let b = Url::parse("file:///p/b.zig").unwrap();
        let loc = |uri: &Url, line| Location {
            uri: uri.clone(),
            range: lsp_types::Range::new(Position::new(line, 0), Position::new(line, 1)),
        };
        let refs = References::from_locations(vec![loc(&a, 0), loc(&b, 1), loc(&a, 2)]);
        assert_eq!(refs.locations.len(), 3);
        assert_eq!(refs.files, vec![a, b]);
    }
}
