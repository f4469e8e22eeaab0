//! Resolution of LSP text and workspace edits into offset edits.
//!
//! A [`WorkspaceEdit`] is resolved against the current text of every
//! document it touches before anything is applied, so the host receives an
//! [`EditBatch`] that either applies as a whole or not at all.

use std::collections::BTreeMap;
use std::ops::Range;

use lsp_types::{
    DocumentChangeOperation, DocumentChanges, OneOf, TextEdit, Url, WorkspaceEdit,
};

use crate::error::EditError;

use super::types::position_to_offset;

/// A replacement expressed in byte offsets of the current text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetEdit {
    /// Byte range replaced.
    pub range: Range<usize>,
    /// Replacement text.
    pub text: String,
}

/// All edits for one document, sorted by start and non-overlapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEdits {
    /// Target document.
    pub uri: Url,
    /// Edits in ascending order.
    pub edits: Vec<OffsetEdit>,
}

/// A labelled group of document edits applied as one undoable action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditBatch {
    /// Undo label.
    pub label: String,
    /// Per-document edits, ordered by URI.
    pub documents: Vec<DocumentEdits>,
}

impl EditBatch {
    /// Total number of edits across documents.
    pub fn len(&self) -> usize {
        self.documents.iter().map(|d| d.edits.len()).sum()
    }

    /// True when the batch changes nothing.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Converts text edits for one document into sorted offset edits.
///
/// Edits starting at the same position keep their original order.
///
/// # Errors
///
/// Returns an error if a position does not exist in `text` or two edits
/// overlap.
pub fn resolve_text_edits(uri: &Url, text: &str, edits: &[TextEdit]) -> Result<Vec<OffsetEdit>, EditError> {
    let out_of_range = |p: lsp_types::Position| EditError::PositionOutOfRange {
        uri: uri.to_string(),
        line: p.line,
        character: p.character,
    };
    let mut resolved = edits
        .iter()
        .map(|edit| {
            let start = position_to_offset(text, edit.range.start).ok_or_else(|| out_of_range(edit.range.start))?;
            let end = position_to_offset(text, edit.range.end).ok_or_else(|| out_of_range(edit.range.end))?;
            if end < start {
                return Err(out_of_range(edit.range.end));
            }
            Ok(OffsetEdit {
                range: start..end,
                text: edit.new_text.clone(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    resolved.sort_by_key(|edit| edit.range.start);
    if resolved
        .windows(2)
        .any(|pair| pair[0].range.end > pair[1].range.start)
    {
        return Err(EditError::Overlapping(uri.to_string()));
    }
    Ok(resolved)
}

/// Applies sorted, non-overlapping offset edits to a text.
pub fn apply_offset_edits(text: &str, edits: &[OffsetEdit]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for edit in edits {
        out.push_str(&text[cursor..edit.range.start]);
        out.push_str(&edit.text);
        cursor = edit.range.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Resolves a workspace edit into an edit batch.
///
/// `text_of` supplies current document text, `version_of` the version last
/// mirrored to the server. Versioned edits whose version differs from the
/// mirrored one are rejected.
///
/// # Errors
///
/// Returns an error if any document is unknown, any position is invalid,
/// edits overlap, a version is stale or the edit contains resource
/// operations.
pub fn resolve_workspace_edit(
    edit: &WorkspaceEdit,
    label: &str,
    text_of: impl Fn(&Url) -> Option<String>,
    version_of: impl Fn(&Url) -> Option<i32>,
) -> Result<EditBatch, EditError> {
    let mut grouped: BTreeMap<Url, Vec<TextEdit>> = BTreeMap::new();

    if let Some(document_changes) = &edit.document_changes {
        let text_document_edits = match document_changes {
            DocumentChanges::Edits(edits) => edits.iter().collect::<Vec<_>>(),
            DocumentChanges::Operations(operations) => operations
                .iter()
                .map(|op| match op {
                    DocumentChangeOperation::Edit(edit) => Ok(edit),
                    DocumentChangeOperation::Op(op) => Err(EditError::UnsupportedOperation(format!("{op:?}"))),
                })
                .collect::<Result<Vec<_>, _>>()?,
        };
        for document_edit in text_document_edits {
            let uri = &document_edit.text_document.uri;
            if let Some(expected) = document_edit.text_document.version
                && let Some(actual) = version_of(uri)
                && expected != actual
            {
                return Err(EditError::VersionMismatch {
                    uri: uri.to_string(),
                    expected,
                    actual,
                });
            }
            grouped.entry(uri.clone()).or_default().extend(
                document_edit.edits.iter().map(|e| match e {
                    OneOf::Left(edit) => edit.clone(),
                    OneOf::Right(annotated) => annotated.text_edit.clone(),
                }),
            );
        }
    } else if let Some(changes) = &edit.changes {
        for (uri, edits) in changes {
            grouped.entry(uri.clone()).or_default().extend(edits.iter().cloned());
        }
    }

    let documents = grouped
        .into_iter()
        .map(|(uri, edits)| {
            let text = text_of(&uri).ok_or_else(|| EditError::UnknownDocument(uri.to_string()))?;
            let edits = resolve_text_edits(&uri, &text, &edits)?;
            Ok(DocumentEdits { uri, edits })
        })
        .collect::<Result<Vec<_>, EditError>>()?;

    Ok(EditBatch {
        label: label.to_string(),
        documents,
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use lsp_types::{
        CreateFile, OptionalVersionedTextDocumentIdentifier, Position, Range as LspRange,
        ResourceOp, TextDocumentEdit,
    };

    use super::*;

    fn uri(name: &str) -> Url {
        Url::parse(&format!("file:///p/{name}")).unwrap()
    }

    fn edit(sl: u32, sc: u32, el: u32, ec: u32, text: &str) -> TextEdit {
        TextEdit {
            range: LspRange {
                start: Position { line: sl, character: sc },
                end: Position { line: el, character: ec },
            },
            new_text: text.to_string(),
        }
    }

    #[test]
    fn test_resolve_and_apply_text_edits() {
        let text = "const a = 1;\nconst b = 2;\n";
        let edits = [edit(1, 6, 1, 7, "c"), edit(0, 6, 0, 7, "x")];
        let resolved = resolve_text_edits(&uri("a.zig"), text, &edits).unwrap();
        assert_eq!(resolved[0].range, 6..7);
        assert_eq!(
            apply_offset_edits(text, &resolved),
            "const x = 1;\nconst c = 2;\n"
        );
    }

    #[test]
    fn test_same_position_inserts_keep_order() {
        let edits = [edit(0, 0, 0, 0, "a"), edit(0, 0, 0, 0, "b")];
        let resolved = resolve_text_edits(&uri("a.zig"), "x", &edits).unwrap();
        assert_eq!(apply_offset_edits("x", &resolved), "abx");
    }

    #[test]
    fn test_overlapping_edits_are_rejected() {
        let edits = [edit(0, 0, 0, 3, ""), edit(0, 2, 0, 4, "")];
        let err = resolve_text_edits(&uri("a.zig"), "abcdef", &edits).unwrap_err();
        assert!(matches!(err, EditError::Overlapping(_)));
    }

    #[test]
    fn test_missing_line_is_out_of_range() {
        let edits = [edit(5, 0, 5, 1, "")];
        let err = resolve_text_edits(&uri("a.zig"), "abc", &edits).unwrap_err();
        assert!(matches!(err, EditError::PositionOutOfRange { line: 5, .. }));
    }

    #[test]
    fn test_workspace_edit_changes_map() {
        let mut changes = HashMap::new();
        changes.insert(uri("b.zig"), vec![edit(0, 0, 0, 1, "B")]);
        changes.insert(uri("a.zig"), vec![edit(0, 0, 0, 1, "A")]);
        let workspace_edit = WorkspaceEdit {
            changes: Some(changes),
            ..WorkspaceEdit::default()
        };
        let batch = resolve_workspace_edit(
            &workspace_edit,
            "Rename",
            |_| Some("x".to_string()),
            |_| None,
        )
        .unwrap();
        assert_eq!(batch.label, "Rename");
        assert_eq!(batch.documents[0].uri, uri("a.zig"));
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_workspace_edit_unknown_document_fails_whole_batch() {
        let mut changes = HashMap::new();
        changes.insert(uri("a.zig"), vec![edit(0, 0, 0, 1, "A")]);
        changes.insert(uri("gone.zig"), vec![edit(0, 0, 0, 1, "G")]);
        let workspace_edit = WorkspaceEdit {
            changes: Some(changes),
            ..WorkspaceEdit::default()
        };
        let known = uri("a.zig");
        let err = resolve_workspace_edit(
            &workspace_edit,
            "Rename",
            |u| (*u == known).then(|| "x".to_string()),
            |_| None,
        )
        .unwrap_err();
        assert_eq!(err, EditError::UnknownDocument(uri("gone.zig").to_string()));
    }

    #[test]
    fn test_document_changes_version_check() {
        let workspace_edit = WorkspaceEdit {
            document_changes: Some(DocumentChanges::Edits(vec![TextDocumentEdit {
                text_document: OptionalVersionedTextDocumentIdentifier {
                    uri: uri("a.zig"),
                    version: Some(1),
                },
                edits: vec![OneOf::Left(edit(0, 0, 0, 0, "x"))],
            }])),
            ..WorkspaceEdit::default()
        };
        let stale = resolve_workspace_edit(&workspace_edit, "Fix", |_| Some(String::new()), |_| Some(4));
        assert!(matches!(stale, Err(EditError::VersionMismatch { expected: 1, actual: 4, .. })));

        let fresh = resolve_workspace_edit(&workspace_edit, "Fix", |_| Some(String::new()), |_| Some(1));
        assert_eq!(fresh.unwrap().len(), 1);
    }

    #[test]
    fn test_resource_operations_are_unsupported() {
        let workspace_edit = WorkspaceEdit {
            document_changes: Some(DocumentChanges::Operations(vec![DocumentChangeOperation::Op(
                ResourceOp::Create(CreateFile {
                    uri: uri("new.zig"),
                    options: None,
                    annotation_id: None,
                }),
            )])),
            ..WorkspaceEdit::default()
        };
        let err = resolve_workspace_edit(&workspace_edit, "Create", |_| None, |_| None).unwrap_err();
        assert!(matches!(err, EditError::UnsupportedOperation(_)));
    }
}
