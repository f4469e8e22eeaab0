//! Workspace symbol search across every server of a project.

use std::sync::Arc;

use futures::future::join_all;
use lsp_types::{
    Location, OneOf, PartialResultParams, Position, Range, SymbolInformation, SymbolKind,
    SymbolTag, WorkDoneProgressParams, WorkspaceSymbol, WorkspaceSymbolParams,
    WorkspaceSymbolResponse,
};
use tracing::debug;

use crate::host::Host;

use super::connection::{ServerConnection, ServerStatus};
use super::timeouts::OpKind;

/// A symbol the user can navigate to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationItem {
    /// Symbol name.
    pub name: String,
    /// Enclosing symbol, if the server reported one.
    pub container_name: Option<String>,
    /// Symbol kind.
    pub kind: SymbolKind,
    /// Where the symbol lives. URI-only results get an empty range at the
    /// start of the file.
    pub location: Location,
    /// Symbol tags.
    pub tags: Vec<SymbolTag>,
    /// Deprecated flag, or the deprecated tag.
    pub deprecated: bool,
    /// Name of the server that reported it.
    pub server: String,
}

/// Converts either response shape into navigation items.
pub fn normalize(server: &str, response: WorkspaceSymbolResponse) -> Vec<NavigationItem> {
    match response {
        WorkspaceSymbolResponse::Flat(symbols) => symbols
            .into_iter()
            .map(|symbol| from_information(server, symbol))
            .collect(),
        WorkspaceSymbolResponse::Nested(symbols) => symbols
            .into_iter()
            .map(|symbol| from_workspace_symbol(server, symbol))
            .collect(),
    }
}

#[allow(deprecated)]
fn from_information(server: &str, symbol: SymbolInformation) -> NavigationItem {
    let tags = symbol.tags.unwrap_or_default();
    let deprecated = symbol.deprecated.unwrap_or(false) || tags.contains(&SymbolTag::DEPRECATED);
    NavigationItem {
        name: symbol.name,
        container_name: symbol.container_name,
        kind: symbol.kind,
        location: symbol.location,
        tags,
        deprecated,
        server: server.to_string(),
    }
}

fn from_workspace_symbol(server: &str, symbol: WorkspaceSymbol) -> NavigationItem {
    let tags = symbol.tags.unwrap_or_default();
    let location = match symbol.location {
        OneOf::Left(location) => location,
        OneOf::Right(workspace_location) => Location {
            uri: workspace_location.uri,
            range: Range::new(Position::new(0, 0), Position::new(0, 0)),
        },
    };
    NavigationItem {
        name: symbol.name,
        container_name: symbol.container_name,
        kind: symbol.kind,
        location,
        deprecated: tags.contains(&SymbolTag::DEPRECATED),
        tags,
        server: server.to_string(),
    }
}

/// Fans a query out to the initialized servers of a project.
pub struct WorkspaceSymbols {
    host: Arc<dyn Host>,
}

impl WorkspaceSymbols {
    /// Creates a searcher resolving files through `host`.
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self { host }
    }

    /// Queries every initialized connection concurrently.
    ///
    /// Servers that time out or fail contribute nothing. Items pointing at
    /// files the host cannot open are dropped.
    pub async fn search(&self, connections: &[Arc<ServerConnection>], query: &str) -> Vec<NavigationItem> {
        let requests = connections
            .iter()
            .filter(|connection| connection.status() == ServerStatus::Initialized)
            .map(|connection| {
                let params = WorkspaceSymbolParams {
                    query: query.to_string(),
                    work_done_progress_params: WorkDoneProgressParams::default(),
                    partial_result_params: PartialResultParams::default(),
                };
                async move {
                    let manager = connection.request_manager()?;
                    let response = connection
                        .execute(OpKind::Symbols, manager.workspace_symbol(params))
                        .await
                        .flatten()?;
                    Some(normalize(connection.definition().name(), response))
                }
            });

        let items: Vec<NavigationItem> = join_all(requests).await.into_iter().flatten().flatten().collect();
        let total = items.len();
        let items: Vec<NavigationItem> = items
            .into_iter()
            .filter(|item| self.host.is_known_file(&item.location.uri))
            .collect();
        debug!(query, total, kept = items.len(), "workspace symbols");
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{Url, WorkspaceLocation};

    #[allow(deprecated)]
    fn information(name: &str, uri: &str) -> SymbolInformation {
        SymbolInformation {
            name: name.to_string(),
            kind: SymbolKind::FUNCTION,
            tags: None,
            deprecated: None,
            location: Location {
                uri: Url::parse(uri).unwrap(),
                range: Range::new(Position::new(0, 0), Position::new(0, 3)),
            },
            container_name: None,
        }
    }

    #[test]
    fn test_normalize_flat() {
        let items = normalize("a", WorkspaceSymbolResponse::Flat(vec![information("foo", "file:///p/a.x")]));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, "foo");
        assert_eq!(items[0].location.range.end, Position::new(0, 3));
        assert!(!items[0].deprecated);
        assert_eq!(items[0].server, "a");
    }

    #[test]
    #[allow(deprecated)]
    fn test_normalize_flat_deprecated_field() {
        let mut symbol = information("old", "file:///p/a.x");
        symbol.deprecated = Some(true);
        let items = normalize("a", WorkspaceSymbolResponse::Flat(vec![symbol]));
        assert!(items[0].deprecated);
    }

    #[test]
    fn test_normalize_nested_uri_only() {
        let symbol = WorkspaceSymbol {
            name: "bar".to_string(),
            kind: SymbolKind::STRUCT,
            tags: Some(vec![SymbolTag::DEPRECATED]),
            container_name: Some("mod".to_string()),
            location: OneOf::Right(WorkspaceLocation {
                uri: Url::parse("file:///p/b.x").unwrap(),
            }),
            data: None,
        };
        let items = normalize("b", WorkspaceSymbolResponse::Nested(vec![symbol]));
        assert_eq!(items.len(), 1);
        assert!(items[0].deprecated);
        assert_eq!(items[0].tags, vec![SymbolTag::DEPRECATED]);
        assert_eq!(items[0].location.range, Range::new(Position::new(0, 0), Position::new(0, 0)));
        assert_eq!(items[0].container_name.as_deref(), Some("mod"));
    }
}
