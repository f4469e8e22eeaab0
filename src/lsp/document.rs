//! Document mirroring.
//!
//! [`DocumentSync`] tracks which documents a connection has opened on its
//! server, which editors keep each one alive and the version last sent. It
//! is pure bookkeeping: every transition returns the notification params to
//! emit and the caller sends them while still holding the lock, which keeps
//! the per-document notification order intact.

use std::collections::{BTreeSet, HashMap};

use lsp_types::{
    DidChangeTextDocumentParams, DidCloseTextDocumentParams, DidOpenTextDocumentParams, Range,
    TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem, TextDocumentSyncKind,
    Url, VersionedTextDocumentIdentifier,
};

use crate::host::EditorId;

use super::types::{advance_position, offset_to_position};

/// One edit made to a document, in byte offsets of the text before the edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    /// Byte offset where the edit starts.
    pub offset: usize,
    /// Text that was replaced.
    pub old_text: String,
    /// Text that was inserted.
    pub new_text: String,
}

impl DocumentChange {
    /// Creates a change.
    pub fn new(offset: usize, old_text: impl Into<String>, new_text: impl Into<String>) -> Self {
        Self {
            offset,
            old_text: old_text.into(),
            new_text: new_text.into(),
        }
    }

    /// Builds the incremental content change for this edit.
    ///
    /// The text before `offset` is the same before and after the edit, so
    /// the start position can be computed from the new text.
    pub fn to_incremental(&self, text_after: &str) -> TextDocumentContentChangeEvent {
        let start = offset_to_position(text_after, self.offset);
        let end = advance_position(start, &self.old_text);
        TextDocumentContentChangeEvent {
            range: Some(Range { start, end }),
            range_length: None,
            text: self.new_text.clone(),
        }
    }
}

/// The server-side view of one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DocumentMirror {
    /// Document URI.
    pub uri: Url,
    /// Kind key the document was resolved with.
    pub kind_key: String,
    /// LSP language id sent in `didOpen`.
    pub language_id: String,
    /// Version last sent to the server.
    pub version: i32,
    /// Editors keeping the mirror alive.
    pub editors: BTreeSet<EditorId>,
    /// Whether `didOpen` has been sent in the current server lifetime.
    pub opened: bool,
}

/// Mirror table for one connection.
#[derive(Debug, Default)]
pub struct DocumentSync {
    mirrors: HashMap<Url, DocumentMirror>,
    last_versions: HashMap<Url, i32>,
}

impl DocumentSync {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an editor on a document. Returns true when this is the
    /// first editor for it.
    pub fn attach(&mut self, uri: &Url, kind_key: &str, language_id: &str, editor: EditorId) -> bool {
        let mirror = self
            .mirrors
            .entry(uri.clone())
            .or_insert_with(|| DocumentMirror {
                uri: uri.clone(),
                kind_key: kind_key.to_string(),
                language_id: language_id.to_string(),
                version: -1,
                editors: BTreeSet::new(),
                opened: false,
            });
        mirror.editors.insert(editor);
        mirror.editors.len() == 1
    }

    /// Documents with editors that have not been opened on the server yet.
    pub fn pending(&self) -> Vec<Url> {
        let mut pending: Vec<Url> = self
            .mirrors
            .values()
            .filter(|m| !m.opened && !m.editors.is_empty())
            .map(|m| m.uri.clone())
            .collect();
        pending.sort();
        pending
    }

    /// Marks a document opened and returns the `didOpen` params.
    ///
    /// Returns `None` if the document is unknown or already open.
    pub fn open_on_server(&mut self, uri: &Url, text: String) -> Option<DidOpenTextDocumentParams> {
        let mirror = self.mirrors.get(uri)?;
        if mirror.opened {
            return None;
        }
        let version = self.next_version(uri);
        let mirror = self.mirrors.get_mut(uri)?;
        mirror.opened = true;
        mirror.version = version;
        Some(DidOpenTextDocumentParams {
            text_document: TextDocumentItem {
                uri: uri.clone(),
                language_id: mirror.language_id.clone(),
                version,
                text,
            },
        })
    }

    /// Records an edit and returns the `didChange` params to send.
    ///
    /// The version advances for every edit of an open document; nothing is
    /// sent when the server asked for no sync.
    pub fn change(
        &mut self,
        uri: &Url,
        change: &DocumentChange,
        text_after: &str,
        sync: TextDocumentSyncKind,
    ) -> Option<DidChangeTextDocumentParams> {
        if !self.mirrors.get(uri).is_some_and(|m| m.opened) {
            return None;
        }
        let version = self.next_version(uri);
        if let Some(mirror) = self.mirrors.get_mut(uri) {
            mirror.version = version;
        }
        let content_change = if sync == TextDocumentSyncKind::FULL {
            TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text: text_after.to_string(),
            }
        } else if sync == TextDocumentSyncKind::INCREMENTAL {
            change.to_incremental(text_after)
        } else {
            return None;
        };
        Some(DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: uri.clone(),
                version,
            },
            content_changes: vec![content_change],
        })
    }

    /// Removes an editor from a document and returns the `didClose` params
    /// when it was the last one and the document was open.
    pub fn detach(&mut self, uri: &Url, editor: EditorId) -> Option<DidCloseTextDocumentParams> {
        let mirror = self.mirrors.get_mut(uri)?;
        mirror.editors.remove(&editor);
        if !mirror.editors.is_empty() {
            return None;
        }
        let opened = mirror.opened;
        self.mirrors.remove(uri);
        opened.then(|| DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
        })
    }

    /// Version last sent for a document, while it is open.
    pub fn version(&self, uri: &Url) -> Option<i32> {
        self.mirrors.get(uri).filter(|m| m.opened).map(|m| m.version)
    }

    /// Whether `didOpen` has been sent for a document.
    pub fn is_open(&self, uri: &Url) -> bool {
        self.mirrors.get(uri).is_some_and(|m| m.opened)
    }

    /// URIs of every open document.
    pub fn open_documents(&self) -> Vec<Url> {
        let mut open: Vec<Url> = self
            .mirrors
            .values()
            .filter(|m| m.opened)
            .map(|m| m.uri.clone())
            .collect();
        open.sort();
        open
    }

    /// Marks every mirror unopened after the server went away, keeping the
    /// editor sets and versions for the next server lifetime.
    pub fn mark_all_unopened(&mut self) {
        for mirror in self.mirrors.values_mut() {
            mirror.opened = false;
        }
    }

    /// Drops every mirror. Versions are kept, so a reopened document keeps
    /// counting up.
    pub fn clear(&mut self) {
        self.mirrors.clear();
    }

    /// Drops mirrors and version history, for a connection that will not
    /// serve again.
    pub fn reset(&mut self) {
        self.mirrors.clear();
        self.last_versions.clear();
    }

    fn next_version(&mut self, uri: &Url) -> i32 {
        let version = self.last_versions.entry(uri.clone()).or_insert(-1);
        *version += 1;
        *version
    }
}
