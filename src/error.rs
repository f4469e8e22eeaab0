//! Error types for the kadabra LSP runtime.
//!
//! This module defines all error types used throughout the crate,
//! organized by subsystem: LSP transport and requests, the server registry,
//! workspace edits, and configuration.

use thiserror::Error;

/// Errors related to language server connections and requests.
#[derive(Debug, Error)]
pub enum LspError {
    /// The language server process failed to start.
    #[error("failed to start language server: {0}")]
    ServerStartFailed(String),

    /// The language server process exited unexpectedly.
    #[error("language server exited unexpectedly: {0}")]
    ServerExited(String),

    /// Failed to initialize the language server.
    #[error("language server initialization failed: {0}")]
    InitializationFailed(String),

    /// A request to the language server timed out.
    #[error("language server request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Invalid position in document.
    #[error("invalid position: line {line}, column {column}")]
    InvalidPosition {
        /// The line number.
        line: u32,
        /// The column number.
        column: u32,
    },

    /// Document not found or not open.
    #[error("document not found: {0}")]
    DocumentNotFound(String),
}

/// Errors raised by the server definition registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The connection is not bound to a project, so its entries cannot be located.
    #[error("connection '{0}' has no project scope")]
    UnknownProject(String),
}

/// Errors raised while resolving a workspace edit against document text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    /// The document referenced by the edit is not known to the host.
    #[error("unknown document: {0}")]
    UnknownDocument(String),

    /// A position does not exist in the current document text.
    #[error("position {line}:{character} is outside of {uri}")]
    PositionOutOfRange {
        /// Target document.
        uri: String,
        /// Zero-based line.
        line: u32,
        /// Zero-based UTF-16 column.
        character: u32,
    },

    /// Two edits touch the same text.
    #[error("overlapping edits in {0}")]
    Overlapping(String),

    /// The edit was computed against another document version.
    #[error("version mismatch for {uri}: edit targets {expected}, document is at {actual}")]
    VersionMismatch {
        /// Target document.
        uri: String,
        /// Version the server computed the edit against.
        expected: i32,
        /// Version currently mirrored to the server.
        actual: i32,
    },

    /// Create, rename and delete resource operations are not applied.
    #[error("unsupported resource operation: {0}")]
    UnsupportedOperation(String),
}

/// Errors related to loading runtime configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read config '{path}': {source}")]
    Read {
        /// Path that was read.
        path: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The configuration file is not valid JSON for the schema.
    #[error("failed to parse config '{path}': {source}")]
    Parse {
        /// Path that was parsed.
        path: String,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// A value in the configuration is out of range or unknown.
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// A unified error type for the entire crate.
#[derive(Debug, Error)]
pub enum Error {
    /// LSP-related error.
    #[error("LSP error: {0}")]
    Lsp(#[from] LspError),

    /// Registry-related error.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Workspace edit error.
    #[error("edit error: {0}")]
    Edit(#[from] EditError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Generic IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lsp_error_display() {
        let err = LspError::ServerStartFailed("connection refused".to_string());
        assert_eq!(
            err.to_string(),
            "failed to start language server: connection refused"
        );
    }

    #[test]
    fn test_error_conversion() {
        let lsp_err = LspError::ServerExited("broken pipe".to_string());
        let err: Error = lsp_err.into();
        assert!(matches!(err, Error::Lsp(LspError::ServerExited(_))));
    }

    #[test]
    fn test_edit_error_display() {
        let err = EditError::VersionMismatch {
            uri: "file:///p/a.zig".to_string(),
            expected: 3,
            actual: 5,
        };
        assert_eq!(
            err.to_string(),
            "version mismatch for file:///p/a.zig: edit targets 3, document is at 5"
        );
    }

    #[test]
    fn test_registry_error_into_unified() {
        let err: Error = RegistryError::UnknownProject("zls".to_string()).into();
        assert!(matches!(err, Error::Registry(RegistryError::UnknownProject(_))));
    }
}
