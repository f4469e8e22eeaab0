//! Client capabilities sent at initialization and the server capability
//! view used to gate requests.
//!
//! A feature is available when the server advertised it statically in its
//! `initialize` result or registered it later through
//! `client/registerCapability`.

use std::collections::HashMap;
use std::path::Path;

use lsp_types::{
    ClientCapabilities, ClientInfo, CodeActionClientCapabilities, CompletionClientCapabilities,
    CompletionItemCapability, DidChangeWatchedFilesClientCapabilities,
    DocumentFormattingClientCapabilities, DocumentRangeFormattingClientCapabilities,
    DocumentSymbolClientCapabilities, DynamicRegistrationClientCapabilities, GotoCapability,
    HoverClientCapabilities, HoverProviderCapability, InitializeParams, MarkupKind, OneOf,
    PublishDiagnosticsClientCapabilities, SemanticTokensClientCapabilities,
    SemanticTokensClientCapabilitiesRequests, SemanticTokensFullOptions, SemanticTokensLegend,
    SemanticTokensRegistrationOptions, SemanticTokensServerCapabilities, ServerCapabilities,
    TextDocumentClientCapabilities, TextDocumentSyncCapability, TextDocumentSyncClientCapabilities,
    TextDocumentSyncKind, TextDocumentSyncSaveOptions, TokenFormat, TraceValue, Url,
    WindowClientCapabilities, WorkDoneProgressParams, WorkspaceClientCapabilities,
    WorkspaceEditClientCapabilities, WorkspaceFolder, WorkspaceSymbolClientCapabilities,
};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use super::definition::ServerDefinition;

/// Request features that can be gated on server capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    /// `textDocument/completion`
    Completion,
    /// `textDocument/hover`
    Hover,
    /// `textDocument/definition`
    Definition,
    /// `textDocument/references`
    References,
    /// `textDocument/formatting`
    Formatting,
    /// `textDocument/rangeFormatting`
    RangeFormatting,
    /// `textDocument/documentSymbol`
    DocumentSymbol,
    /// `textDocument/codeAction`
    CodeAction,
    /// `workspace/executeCommand`
    ExecuteCommand,
    /// `workspace/symbol`
    WorkspaceSymbol,
    /// `textDocument/semanticTokens/full`
    SemanticTokensFull,
    /// `textDocument/semanticTokens/full/delta`
    SemanticTokensDelta,
}

impl Feature {
    /// The LSP method name used in dynamic registrations.
    pub const fn method(self) -> &'static str {
        match self {
            Self::Completion => "textDocument/completion",
            Self::Hover => "textDocument/hover",
            Self::Definition => "textDocument/definition",
            Self::References => "textDocument/references",
            Self::Formatting => "textDocument/formatting",
            Self::RangeFormatting => "textDocument/rangeFormatting",
            Self::DocumentSymbol => "textDocument/documentSymbol",
            Self::CodeAction => "textDocument/codeAction",
            Self::ExecuteCommand => "workspace/executeCommand",
            Self::WorkspaceSymbol => "workspace/symbol",
            Self::SemanticTokensFull | Self::SemanticTokensDelta => "textDocument/semanticTokens",
        }
    }
}

#[derive(Debug, Clone)]
struct Registration {
    method: String,
    options: Option<Value>,
}

/// Capabilities registered at runtime, keyed by registration id.
#[derive(Debug, Default)]
pub struct DynamicRegistrations {
    entries: RwLock<HashMap<String, Registration>>,
}

impl DynamicRegistrations {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a registration.
    pub fn register(&self, id: impl Into<String>, method: impl Into<String>, options: Option<Value>) {
        let id = id.into();
        let method = method.into();
        debug!(id, method, "capability registered");
        self.entries.write().insert(id, Registration { method, options });
    }

    /// Removes a registration by id.
    ///
    /// Falls back to removing the only registration of `method` when the id
    /// is unknown. Returns false if nothing was removed.
    pub fn unregister(&self, id: &str, method: &str) -> bool {
        let mut entries = self.entries.write();
        if entries.remove(id).is_some() {
            debug!(id, method, "capability unregistered");
            return true;
        }
        let matching: Vec<String> = entries
            .iter()
            .filter(|(_, r)| r.method == method)
            .map(|(id, _)| id.clone())
            .collect();
        match matching.as_slice() {
            [only] => {
                warn!(id, method, registered_as = %only, "unregistering capability by method");
                entries.remove(only);
                true
            }
            [] => {
                warn!(id, method, "unregister for unknown capability");
                false
            }
            _ => {
                warn!(id, method, count = matching.len(), "ambiguous unregister ignored");
                false
            }
        }
    }

    /// True if any registration exists for `method`.
    pub fn contains_method(&self, method: &str) -> bool {
        self.entries.read().values().any(|r| r.method == method)
    }

    /// Registration options of the first registration for `method`.
    pub fn options(&self, method: &str) -> Option<Value> {
        self.entries
            .read()
            .values()
            .find(|r| r.method == method)
            .and_then(|r| r.options.clone())
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True if there are no registrations.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Forgets every registration.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

/// The server's capabilities combined with its dynamic registrations.
#[derive(Debug)]
pub struct Capabilities {
    server: ServerCapabilities,
    registrations: std::sync::Arc<DynamicRegistrations>,
}

impl Capabilities {
    /// Combines static capabilities with a registration table.
    pub fn new(server: ServerCapabilities, registrations: std::sync::Arc<DynamicRegistrations>) -> Self {
        Self {
            server,
            registrations,
        }
    }

    /// Static capabilities from the `initialize` result.
    pub fn server(&self) -> &ServerCapabilities {
        &self.server
    }

    /// The dynamic registration table.
    pub fn registrations(&self) -> &DynamicRegistrations {
        &self.registrations
    }

    /// True if the server can serve `feature`.
    pub fn supports(&self, feature: Feature) -> bool {
        self.supports_statically(feature) || self.supports_dynamically(feature)
    }

    fn supports_dynamically(&self, feature: Feature) -> bool {
        if !self.registrations.contains_method(feature.method()) {
            return false;
        }
        match feature {
            Feature::SemanticTokensDelta => self
                .registered_semantic_options()
                .is_some_and(|options| full_supports_delta(options.semantic_tokens_options.full.as_ref())),
            _ => true,
        }
    }

    fn supports_statically(&self, feature: Feature) -> bool {
        let caps = &self.server;
        match feature {
            Feature::Completion => caps.completion_provider.is_some(),
            Feature::Hover => match &caps.hover_provider {
                Some(HoverProviderCapability::Simple(enabled)) => *enabled,
                Some(HoverProviderCapability::Options(_)) => true,
                None => false,
            },
            Feature::Definition => one_of_enabled(caps.definition_provider.as_ref()),
            Feature::References => one_of_enabled(caps.references_provider.as_ref()),
            Feature::Formatting => one_of_enabled(caps.document_formatting_provider.as_ref()),
            Feature::RangeFormatting => one_of_enabled(caps.document_range_formatting_provider.as_ref()),
            Feature::DocumentSymbol => one_of_enabled(caps.document_symbol_provider.as_ref()),
            Feature::CodeAction => match &caps.code_action_provider {
                Some(lsp_types::CodeActionProviderCapability::Simple(enabled)) => *enabled,
                Some(lsp_types::CodeActionProviderCapability::Options(_)) => true,
                None => false,
            },
            Feature::ExecuteCommand => caps.execute_command_provider.is_some(),
            Feature::WorkspaceSymbol => one_of_enabled(caps.workspace_symbol_provider.as_ref()),
            Feature::SemanticTokensFull => caps.semantic_tokens_provider.is_some(),
            Feature::SemanticTokensDelta => match &caps.semantic_tokens_provider {
                Some(SemanticTokensServerCapabilities::SemanticTokensOptions(options)) => {
                    full_supports_delta(options.full.as_ref())
                }
                Some(SemanticTokensServerCapabilities::SemanticTokensRegistrationOptions(options)) => {
                    full_supports_delta(options.semantic_tokens_options.full.as_ref())
                }
                None => false,
            },
        }
    }

    /// How the server wants document changes synchronized.
    pub fn sync_kind(&self) -> TextDocumentSyncKind {
        match &self.server.text_document_sync {
            Some(TextDocumentSyncCapability::Kind(kind)) => *kind,
            Some(TextDocumentSyncCapability::Options(options)) => {
                options.change.unwrap_or(TextDocumentSyncKind::NONE)
            }
            None => TextDocumentSyncKind::NONE,
        }
    }

    /// Whether `didSave` is wanted, and whether it should carry the text.
    pub fn save(&self) -> Option<bool> {
        match &self.server.text_document_sync {
            Some(TextDocumentSyncCapability::Options(options)) => match &options.save {
                Some(TextDocumentSyncSaveOptions::Supported(true)) => Some(false),
                Some(TextDocumentSyncSaveOptions::SaveOptions(save)) => {
                    Some(save.include_text.unwrap_or(false))
                }
                _ => None,
            },
            _ => None,
        }
    }

    /// The semantic token legend, from static or registered options.
    pub fn semantic_legend(&self) -> Option<SemanticTokensLegend> {
        match &self.server.semantic_tokens_provider {
            Some(SemanticTokensServerCapabilities::SemanticTokensOptions(options)) => {
                Some(options.legend.clone())
            }
            Some(SemanticTokensServerCapabilities::SemanticTokensRegistrationOptions(options)) => {
                Some(options.semantic_tokens_options.legend.clone())
            }
            None => self
                .registered_semantic_options()
                .map(|options| options.semantic_tokens_options.legend),
        }
    }

    fn registered_semantic_options(&self) -> Option<SemanticTokensRegistrationOptions> {
        let options = self.registrations.options(Feature::SemanticTokensFull.method())?;
        serde_json::from_value(options).ok()
    }
}

fn one_of_enabled<T>(capability: Option<&OneOf<bool, T>>) -> bool {
    match capability {
        Some(OneOf::Left(enabled)) => *enabled,
        Some(OneOf::Right(_)) => true,
        None => false,
    }
}

fn full_supports_delta(full: Option<&SemanticTokensFullOptions>) -> bool {
    matches!(
        full,
        Some(SemanticTokensFullOptions::Delta { delta: Some(true) })
    )
}

/// Capabilities this client advertises.
///
/// Completion documentation and hover content are requested as markdown,
/// and diagnostics are published.
pub fn client_capabilities() -> ClientCapabilities {
    ClientCapabilities {
        workspace: Some(WorkspaceClientCapabilities {
            apply_edit: Some(true),
            workspace_edit: Some(WorkspaceEditClientCapabilities {
                document_changes: Some(true),
                ..Default::default()
            }),
            did_change_configuration: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(false),
            }),
            did_change_watched_files: Some(DidChangeWatchedFilesClientCapabilities {
                dynamic_registration: Some(false),
                relative_pattern_support: None,
            }),
            symbol: Some(WorkspaceSymbolClientCapabilities {
                dynamic_registration: Some(true),
                ..Default::default()
            }),
            execute_command: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(true),
            }),
            configuration: Some(true),
            workspace_folders: Some(true),
            ..Default::default()
        }),
        text_document: Some(TextDocumentClientCapabilities {
            synchronization: Some(TextDocumentSyncClientCapabilities {
                dynamic_registration: Some(false),
                will_save: Some(false),
                will_save_wait_until: Some(false),
                did_save: Some(true),
            }),
            completion: Some(CompletionClientCapabilities {
                dynamic_registration: Some(true),
                completion_item: Some(CompletionItemCapability {
                    snippet_support: Some(false),
                    documentation_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            hover: Some(HoverClientCapabilities {
                dynamic_registration: Some(true),
                content_format: Some(vec![MarkupKind::Markdown, MarkupKind::PlainText]),
            }),
            definition: Some(GotoCapability {
                dynamic_registration: Some(true),
                link_support: Some(false),
            }),
            references: Some(DynamicRegistrationClientCapabilities {
                dynamic_registration: Some(true),
            }),
            document_symbol: Some(DocumentSymbolClientCapabilities {
                dynamic_registration: Some(true),
                hierarchical_document_symbol_support: Some(true),
                ..Default::default()
            }),
            formatting: Some(DocumentFormattingClientCapabilities {
                dynamic_registration: Some(true),
            }),
            range_formatting: Some(DocumentRangeFormattingClientCapabilities {
                dynamic_registration: Some(true),
            }),
            code_action: Some(CodeActionClientCapabilities {
                dynamic_registration: Some(true),
                ..Default::default()
            }),
            publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
                related_information: Some(true),
                ..Default::default()
            }),
            semantic_tokens: Some(SemanticTokensClientCapabilities {
                dynamic_registration: Some(true),
                requests: SemanticTokensClientCapabilitiesRequests {
                    range: Some(false),
                    full: Some(SemanticTokensFullOptions::Delta { delta: Some(true) }),
                },
                token_types: Vec::new(),
                token_modifiers: Vec::new(),
                formats: vec![TokenFormat::RELATIVE],
                overlapping_token_support: Some(false),
                multiline_token_support: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }),
        window: Some(WindowClientCapabilities {
            work_done_progress: Some(true),
            show_message: None,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Builds the `initialize` params for a definition rooted at `root`.
pub fn initialize_params(definition: &ServerDefinition, root: Option<&Url>) -> InitializeParams {
    let workspace_folders = root.map(|uri| {
        let name = uri
            .to_file_path()
            .ok()
            .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| definition.name().to_string());
        vec![WorkspaceFolder {
            uri: uri.clone(),
            name,
        }]
    });
    #[allow(deprecated)]
    let params = InitializeParams {
        process_id: Some(std::process::id()),
        root_uri: root.cloned(),
        root_path: root
            .and_then(|uri| uri.to_file_path().ok())
            .as_deref()
            .and_then(Path::to_str)
            .map(str::to_string),
        workspace_folders,
        initialization_options: definition.initialization_options().cloned(),
        capabilities: client_capabilities(),
        trace: Some(TraceValue::Off),
        client_info: Some(ClientInfo {
            name: "kadabra-lsp".to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
        locale: None,
        work_done_progress_params: WorkDoneProgressParams::default(),
    };
    params
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use lsp_types::{
        SemanticTokenType, SemanticTokensOptions, TextDocumentSyncOptions, WorkDoneProgressOptions,
    };

    use super::*;

    fn capabilities(server: ServerCapabilities) -> Capabilities {
        Capabilities::new(server, Arc::new(DynamicRegistrations::new()))
    }

    #[test]
    fn test_static_gating() {
        let caps = capabilities(ServerCapabilities {
            hover_provider: Some(HoverProviderCapability::Simple(true)),
            references_provider: Some(OneOf::Left(false)),
            ..Default::default()
        });
        assert!(caps.supports(Feature::Hover));
        assert!(!caps.supports(Feature::References));
        assert!(!caps.supports(Feature::Completion));
    }

    #[test]
    fn test_dynamic_registration_enables_and_disables() {
        let caps = capabilities(ServerCapabilities::default());
        assert!(!caps.supports(Feature::Formatting));
        caps.registrations()
            .register("fmt-1", "textDocument/formatting", None);
        assert!(caps.supports(Feature::Formatting));
        assert!(caps.registrations().unregister("fmt-1", "textDocument/formatting"));
        assert!(!caps.supports(Feature::Formatting));
    }

    #[test]
    fn test_unregister_falls_back_to_method() {
        let registrations = DynamicRegistrations::new();
        registrations.register("a", "workspace/symbol", None);
        assert!(registrations.unregister("unknown", "workspace/symbol"));
        assert!(registrations.is_empty());
        assert!(!registrations.unregister("unknown", "workspace/symbol"));
    }

    #[test]
    fn test_sync_kind_and_save() {
        let caps = capabilities(ServerCapabilities {
            text_document_sync: Some(TextDocumentSyncCapability::Options(TextDocumentSyncOptions {
                open_close: Some(true),
                change: Some(TextDocumentSyncKind::INCREMENTAL),
                save: Some(TextDocumentSyncSaveOptions::Supported(true)),
                ..Default::default()
            })),
            ..Default::default()
        });
        assert_eq!(caps.sync_kind(), TextDocumentSyncKind::INCREMENTAL);
        assert_eq!(caps.save(), Some(false));
        assert_eq!(
            capabilities(ServerCapabilities::default()).sync_kind(),
            TextDocumentSyncKind::NONE
        );
    }

    #[test]
    fn test_semantic_legend_and_delta() {
        let caps = capabilities(ServerCapabilities {
            semantic_tokens_provider: Some(SemanticTokensServerCapabilities::SemanticTokensOptions(
                SemanticTokensOptions {
                    work_done_progress_options: WorkDoneProgressOptions::default(),
                    legend: SemanticTokensLegend {
                        token_types: vec![SemanticTokenType::KEYWORD],
                        token_modifiers: vec![],
                    },
                    range: None,
                    full: Some(SemanticTokensFullOptions::Delta { delta: Some(true) }),
                },
            )),
            ..Default::default()
        });
        assert!(caps.supports(Feature::SemanticTokensFull));
        assert!(caps.supports(Feature::SemanticTokensDelta));
        assert_eq!(caps.semantic_legend().unwrap().token_types.len(), 1);
    }

    #[test]
    fn test_client_capabilities_request_markdown_and_diagnostics() {
        let caps = client_capabilities();
        let text_document = caps.text_document.unwrap();
        assert_eq!(
            text_document.hover.unwrap().content_format.unwrap()[0],
            MarkupKind::Markdown
        );
        assert!(text_document.publish_diagnostics.is_some());
        let item = text_document.completion.unwrap().completion_item.unwrap();
        assert_eq!(item.documentation_format.unwrap()[0], MarkupKind::Markdown);
    }

    #[test]
    fn test_initialize_params_carry_root_and_options() {
        let definition = ServerDefinition::builder("zls")
            .kind_key("zig")
            .initialization_options(serde_json::json!({"enable_snippets": false}))
            .build();
        let root = Url::parse("file:///work/project").unwrap();
        let params = initialize_params(&definition, Some(&root));
        let folders = params.workspace_folders.unwrap();
        assert_eq!(folders[0].name, "project");
        assert_eq!(folders[0].uri, root);
        assert!(params.initialization_options.is_some());
    }
}
