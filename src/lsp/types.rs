//! Position, offset and URI helpers shared by the runtime.
//!
//! Editors address text with byte offsets while the wire protocol uses
//! zero-based lines and UTF-16 code unit columns. Everything that crosses
//! that boundary goes through this module.

use lsp_types::{Position, Url};
use std::path::Path;

use crate::error::LspError;

use super::LspResult;

/// Canonicalizes a path, relative to the working directory if needed,
/// and turns it into a `file://` URL.
///
/// # Errors
///
/// Returns [`LspError::DocumentNotFound`] if the path does not exist.
pub fn path_to_url(path: &Path) -> LspResult<Url> {
    let canonical = std::fs::canonicalize(path)
        .map_err(|e| LspError::DocumentNotFound(format!("{}: {e}", path.display())))?;
    Url::from_file_path(&canonical)
        .map_err(|()| LspError::DocumentNotFound(format!("not a file path: {}", canonical.display())))
}

/// Normalizes a server-supplied file URI so it compares equal to the URIs
/// the runtime hands out: percent-encoded drive colons are decoded and
/// Windows drive letters are lower-cased.
pub fn sanitize_uri(uri: &Url) -> Url {
    if uri.scheme() != "file" {
        return uri.clone();
    }
    let mut path = uri.path().replace("%3A", ":").replace("%3a", ":");
    let bytes = path.as_bytes();
    if bytes.len() >= 3 && bytes[0] == b'/' && bytes[1].is_ascii_alphabetic() && bytes[2] == b':'
    {
        let drive = path[1..2].to_ascii_lowercase();
        path.replace_range(1..2, &drive);
    }
    let mut sanitized = uri.clone();
    sanitized.set_path(&path);
    sanitized
}

/// Returns the file name component of a URI path, if any.
pub fn file_name(uri: &Url) -> Option<&str> {
    uri.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty())
}

/// Returns the extension of the URI's file name, without the dot.
pub fn file_extension(uri: &Url) -> Option<&str> {
    let name = file_name(uri)?;
    let (stem, ext) = name.rsplit_once('.')?;
    (!stem.is_empty()).then_some(ext)
}

/// Converts a byte offset into an LSP position.
///
/// Offsets past the end of the text clamp to the end, and offsets inside a
/// multi-byte character snap back to the character start.
pub fn offset_to_position(text: &str, offset: usize) -> Position {
    let mut offset = offset.min(text.len());
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    let before = &text[..offset];
    let line = before.matches('\n').count();
    let line_start = before.rfind('\n').map_or(0, |idx| idx + 1);
    let character = before[line_start..].encode_utf16().count();
    Position {
        line: u32::try_from(line).unwrap_or(u32::MAX),
        character: u32::try_from(character).unwrap_or(u32::MAX),
    }
}

/// Converts an LSP position into a byte offset.
///
/// A column past the end of its line clamps to the line end, as the
/// protocol requires. Returns `None` when the line does not exist.
pub fn position_to_offset(text: &str, position: Position) -> Option<usize> {
    let mut line_start = 0;
    for _ in 0..position.line {
        line_start += text[line_start..].find('\n')? + 1;
    }
    let line_end = text[line_start..]
        .find('\n')
        .map_or(text.len(), |idx| line_start + idx);
    let line_text = text[line_start..line_end]
        .strip_suffix('\r')
        .unwrap_or(&text[line_start..line_end]);

    let mut utf16 = 0u32;
    for (idx, ch) in line_text.char_indices() {
        if utf16 >= position.character {
            return Some(line_start + idx);
        }
        utf16 += u32::try_from(ch.len_utf16()).unwrap_or(2);
    }
    Some(line_start + line_text.len())
}

/// Returns the position reached after writing `text` starting at `start`.
pub fn advance_position(start: Position, text: &str) -> Position {
    match text.rfind('\n') {
        None => Position {
            line: start.line,
            character: start.character + utf16_len(text),
        },
        Some(idx) => Position {
            line: start.line + u32::try_from(text.matches('\n').count()).unwrap_or(u32::MAX),
            character: utf16_len(&text[idx + 1..]),
        },
    }
}

/// Length of a string in UTF-16 code units.
pub fn utf16_len(text: &str) -> u32 {
    u32::try_from(text.encode_utf16().count()).unwrap_or(u32::MAX)
}

/// Converts user-facing 1-indexed position to LSP 0-indexed position.
///
/// # Errors
///
/// Returns error if line or column is 0.
pub fn to_lsp_position(line: u32, column: u32) -> LspResult<Position> {
    if line == 0 || column == 0 {
        return Err(LspError::InvalidPosition { line, column });
    }
    Ok(Position {
        line: line - 1,
        character: column - 1,
    })
}

/// Converts LSP 0-indexed position to user-facing 1-indexed position.
pub fn from_lsp_position(position: Position) -> (u32, u32) {
    (position.line + 1, position.character + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(line: u32, character: u32) -> Position {
        Position { line, character }
    }

    #[test]
    fn test_to_lsp_position() {
        assert_eq!(to_lsp_position(1, 1).unwrap(), pos(0, 0));
        assert_eq!(to_lsp_position(10, 5).unwrap(), pos(9, 4));
        assert!(to_lsp_position(0, 1).is_err());
        assert!(to_lsp_position(1, 0).is_err());
    }

    #[test]
    fn test_from_lsp_position() {
        assert_eq!(from_lsp_position(pos(9, 4)), (10, 5));
    }

    #[test]
    fn test_offset_to_position_counts_utf16_units() {
        let text = "const a = 1;\nconst π = \"😀x\";\n";
        assert_eq!(offset_to_position(text, 0), pos(0, 0));
        assert_eq!(offset_to_position(text, 13), pos(1, 0));
        let x = text.find('x').unwrap();
        // 'π' is one unit, the emoji is two.
        assert_eq!(offset_to_position(text, x), pos(1, 13));
        assert_eq!(offset_to_position(text, text.len()), pos(2, 0));
        assert_eq!(offset_to_position(text, 10_000), pos(2, 0));
    }

    #[test]
    fn test_position_to_offset_inverts_offset_to_position() {
        let text = "fn main() {\r\n    let 😀 = 1;\n}";
        for offset in (0..=text.len()).filter(|o| text.is_char_boundary(*o)) {
            let position = offset_to_position(text, offset);
            let back = position_to_offset(text, position).unwrap();
            if text.as_bytes().get(offset) == Some(&b'\n') && offset > 0 && &text[offset - 1..offset] == "\r" {
                continue;
            }
            assert_eq!(back, offset, "offset {offset} -> {position:?}");
        }
    }

    #[test]
    fn test_position_to_offset_clamps_column_and_rejects_missing_line() {
        let text = "ab\ncd";
        assert_eq!(position_to_offset(text, pos(0, 99)), Some(2));
        assert_eq!(position_to_offset(text, pos(1, 1)), Some(4));
        assert_eq!(position_to_offset(text, pos(2, 0)), None);
        assert_eq!(position_to_offset("ab\n", pos(1, 0)), Some(3));
    }

    #[test]
    fn test_advance_position() {
        assert_eq!(advance_position(pos(2, 4), "abc"), pos(2, 7));
        assert_eq!(advance_position(pos(2, 4), "a\nbc"), pos(3, 2));
        assert_eq!(advance_position(pos(2, 4), "a\n"), pos(3, 0));
        assert_eq!(advance_position(pos(0, 0), ""), pos(0, 0));
    }

    #[test]
    fn test_sanitize_uri_normalizes_drive_letters() {
        let uri = Url::parse("file:///C%3A/work/main.zig").unwrap();
        assert_eq!(sanitize_uri(&uri).as_str(), "file:///c:/work/main.zig");

        let unix = Url::parse("file:///p/a.zig").unwrap();
        assert_eq!(sanitize_uri(&unix), unix);
    }

    #[test]
    fn test_file_name_and_extension() {
        let uri = Url::parse("file:///p/build.zig.zon").unwrap();
        assert_eq!(file_name(&uri), Some("build.zig.zon"));
        assert_eq!(file_extension(&uri), Some("zon"));

        let dotfile = Url::parse("file:///p/.gitignore").unwrap();
        assert_eq!(file_extension(&dotfile), None);
    }

    #[test]
    fn test_path_to_url_canonicalizes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.zig"), "").unwrap();

        let url = path_to_url(&dir.path().join("src/../src/main.zig")).unwrap();
        assert_eq!(url.scheme(), "file");
        assert!(url.path().ends_with("/src/main.zig"));
        assert!(!url.path().contains(".."));
        assert!(matches!(
            path_to_url(&dir.path().join("missing.zig")),
            Err(LspError::DocumentNotFound(_))
        ));
    }
}
