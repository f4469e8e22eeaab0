//! Semantic token decoding and delta application.
//!
//! Servers send tokens as a flat array of `u32` groups of five
//! (delta line, delta start, length, type index, modifier bits). The cache
//! keeps that flat array with its result id so `full/delta` responses can be
//! applied as splices.

use lsp_types::{SemanticTokens, SemanticTokensDelta, SemanticTokensEdit, SemanticTokensLegend};
use tracing::{debug, warn};

/// A decoded token with absolute coordinates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemanticToken {
    /// Zero-based line.
    pub line: u32,
    /// Zero-based UTF-16 column.
    pub start: u32,
    /// Length in UTF-16 units.
    pub length: u32,
    /// Token type name from the legend.
    pub token_type: String,
    /// Modifier names from the legend.
    pub modifiers: Vec<String>,
}

/// Flattens typed tokens into the wire integer array.
pub fn flatten(tokens: &[lsp_types::SemanticToken]) -> Vec<u32> {
    tokens
        .iter()
        .flat_map(|t| {
            [
                t.delta_line,
                t.delta_start,
                t.length,
                t.token_type,
                t.token_modifiers_bitset,
            ]
        })
        .collect()
}

/// Decodes a flat token array against a legend.
///
/// Tokens whose type index is missing from the legend are dropped; a
/// trailing incomplete group is ignored.
pub fn decode(data: &[u32], legend: &SemanticTokensLegend) -> Vec<SemanticToken> {
    let mut tokens = Vec::with_capacity(data.len() / 5);
    let mut line = 0u32;
    let mut start = 0u32;
    for group in data.chunks_exact(5) {
        let [delta_line, delta_start, length, type_index, bits] =
            [group[0], group[1], group[2], group[3], group[4]];
        if delta_line > 0 {
            line += delta_line;
            start = delta_start;
        } else {
            start += delta_start;
        }
        let Some(token_type) = legend.token_types.get(type_index as usize) else {
            debug!(type_index, "dropping semantic token with unknown type");
            continue;
        };
        let modifiers = legend
            .token_modifiers
            .iter()
            .enumerate()
            .filter(|(bit, _)| *bit < 32 && bits & (1 << bit) != 0)
            .map(|(_, modifier)| modifier.as_str().to_string())
            .collect();
        tokens.push(SemanticToken {
            line,
            start,
            length,
            token_type: token_type.as_str().to_string(),
            modifiers,
        });
    }
    tokens
}

/// Applies delta edits to a flat token array.
///
/// Edit offsets refer to the array before any edit, so edits are applied
/// from the highest start down. Returns false, leaving `data` untouched,
/// when an edit falls outside the array or edits overlap.
pub fn apply_edits(data: &mut Vec<u32>, edits: &[SemanticTokensEdit]) -> bool {
    let mut ordered: Vec<&SemanticTokensEdit> = edits.iter().collect();
    ordered.sort_by_key(|edit| edit.start);

    let mut covered = 0usize;
    for edit in &ordered {
        let start = edit.start as usize;
        let end = start + edit.delete_count as usize;
        if start < covered || end > data.len() {
            return false;
        }
        covered = end;
    }

    for edit in ordered.into_iter().rev() {
        let start = edit.start as usize;
        let end = start + edit.delete_count as usize;
        let replacement = edit.data.as_deref().map(flatten).unwrap_or_default();
        data.splice(start..end, replacement);
    }
    true
}

/// Last full token set received for one document.
#[derive(Debug, Default, Clone)]
pub struct SemanticCache {
    result_id: Option<String>,
    data: Vec<u32>,
    tokens: Vec<SemanticToken>,
}

impl SemanticCache {
    /// Result id of the cached set, if the server sent one.
    pub fn result_id(&self) -> Option<&str> {
        self.result_id.as_deref()
    }

    /// The cached decoded tokens.
    pub fn tokens(&self) -> &[SemanticToken] {
        &self.tokens
    }

    /// Replaces the cache with a full response.
    pub fn apply_full(&mut self, full: SemanticTokens, legend: &SemanticTokensLegend) -> &[SemanticToken] {
        self.result_id = full.result_id;
        self.data = flatten(&full.data);
        self.tokens = decode(&self.data, legend);
        &self.tokens
    }

    /// Applies a delta response on top of the cached array.
    ///
    /// Returns `None` and clears the cache when the edits do not fit, so the
    /// next request asks for a full set.
    pub fn apply_delta(
        &mut self,
        delta: SemanticTokensDelta,
        legend: &SemanticTokensLegend,
    ) -> Option<&[SemanticToken]> {
        if !apply_edits(&mut self.data, &delta.edits) {
            warn!(
                result_id = ?self.result_id,
                "semantic token delta does not match cached tokens; resetting"
            );
            self.reset();
            return None;
        }
        self.result_id = delta.result_id;
        self.tokens = decode(&self.data, legend);
        Some(&self.tokens)
    }

    /// Forgets everything.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
