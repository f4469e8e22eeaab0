//! Server definitions and live connections, keyed by kind key and project.
//!
//! A file resolves to a definition in this order:
//!
//! 1. its extension, registered for the file's project
//! 2. a filename pattern registered for the project
//! 3. its extension, registered application-wide
//! 4. a filename pattern registered application-wide
//!
//! Connections are keyed the same way, with the project of the editor that
//! caused them. Every kind key of a definition maps to the one connection
//! it runs for a project.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use lsp_types::Url;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::RegistryError;

use super::connection::ServerConnection;
use super::definition::{ProjectScope, ServerDefinition};
use super::types::{file_extension, file_name};

type Key = (String, ProjectScope);

/// A definition selected for a file, with the kind key that matched.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The definition.
    pub definition: Arc<ServerDefinition>,
    /// The kind key the file matched.
    pub kind_key: String,
    /// Scope the definition was registered in.
    pub scope: ProjectScope,
}

#[derive(Default)]
struct RegistryState {
    definitions: BTreeMap<Key, Arc<ServerDefinition>>,
    connections: HashMap<Key, Arc<ServerConnection>>,
    projects: HashMap<ProjectScope, Vec<Arc<ServerConnection>>>,
}

/// Process-wide table of definitions and connections.
#[derive(Default)]
pub struct Registry {
    state: Mutex<RegistryState>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Registry")
            .field("definitions", &state.definitions.len())
            .field("connections", &state.connections.len())
            .finish()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition for each of its kind keys in `scope`,
    /// replacing whatever was registered for the same key.
    pub fn register_definition(&self, definition: Arc<ServerDefinition>, scope: ProjectScope) {
        let mut state = self.state.lock();
        for key in definition.kind_keys() {
            let previous = state
                .definitions
                .insert((key.as_str().to_string(), scope.clone()), Arc::clone(&definition));
            match previous {
                Some(previous) => info!(
                    kind_key = key.as_str(),
                    scope = %scope,
                    replaced = previous.name(),
                    server = definition.name(),
                    "server definition replaced"
                ),
                None => debug!(kind_key = key.as_str(), scope = %scope, server = definition.name(), "server definition registered"),
            }
        }
    }

    /// Removes the definitions registered for a kind key in `scope`.
    pub fn unregister_definition(&self, kind_key: &str, scope: &ProjectScope) -> Option<Arc<ServerDefinition>> {
        self.state
            .lock()
            .definitions
            .remove(&(kind_key.to_string(), scope.clone()))
    }

    /// Definitions registered directly in `scope`, by kind key.
    pub fn definitions(&self, scope: &ProjectScope) -> Vec<(String, Arc<ServerDefinition>)> {
        self.state
            .lock()
            .definitions
            .iter()
            .filter(|((_, s), _)| s == scope)
            .map(|((key, _), definition)| (key.clone(), Arc::clone(definition)))
            .collect()
    }

    /// Picks the definition serving `uri` in `project`.
    pub fn resolve(&self, uri: &Url, project: &ProjectScope) -> Option<Resolution> {
        let extension = file_extension(uri);
        let name = file_name(uri).unwrap_or_default();
        let state = self.state.lock();

        let mut scopes = vec![project.clone()];
        if *project != ProjectScope::Application {
            scopes.push(ProjectScope::Application);
        }
        for scope in scopes {
            if let Some(extension) = extension
                && let Some(definition) = state.definitions.get(&(extension.to_string(), scope.clone()))
            {
                return Some(Resolution {
                    definition: Arc::clone(definition),
                    kind_key: extension.to_string(),
                    scope,
                });
            }
            let pattern = state.definitions.iter().find(|((key, s), definition)| {
                *s == scope
                    && definition
                        .kind_key(key)
                        .is_some_and(|kind_key| kind_key.matches_file_name(name))
            });
            if let Some(((key, _), definition)) = pattern {
                return Some(Resolution {
                    definition: Arc::clone(definition),
                    kind_key: key.clone(),
                    scope,
                });
            }
        }
        None
    }

    /// True if any registered key matches the extension exactly or the
    /// file name as a pattern.
    pub fn is_kind_supported(&self, file_name: &str, extension: Option<&str>) -> bool {
        self.state.lock().definitions.iter().any(|((key, _), definition)| {
            definition.kind_key(key).is_some_and(|kind_key| {
                kind_key.matches_extension(extension) || kind_key.matches_file_name(file_name)
            })
        })
    }

    /// Returns the live connection for `(kind_key, project)`, or registers
    /// the one `create` builds under every kind key of `definition`.
    ///
    /// Runs under the registry lock, so at most one connection exists per
    /// definition and project. A connection that crashed for good is
    /// replaced. The boolean is true when `create` was called; starting the
    /// new connection is up to the caller.
    pub fn get_or_insert(
        &self,
        definition: &Arc<ServerDefinition>,
        project: &ProjectScope,
        kind_key: &str,
        create: impl FnOnce() -> Arc<ServerConnection>,
    ) -> (Arc<ServerConnection>, bool) {
        let mut state = self.state.lock();
        let key = (kind_key.to_string(), project.clone());
        if let Some(existing) = state.connections.get(&key)
            && existing.is_reusable()
            && Arc::ptr_eq(existing.definition(), definition)
        {
            return (Arc::clone(existing), false);
        }

        let connection = create();
        if let Some(stale) = state.connections.get(&key).cloned() {
            debug!(server = stale.definition().name(), project = %project, "replacing stale connection");
            state.connections.retain(|_, c| !Arc::ptr_eq(c, &stale));
            if let Some(list) = state.projects.get_mut(project) {
                list.retain(|c| !Arc::ptr_eq(c, &stale));
            }
        }
        for key in definition.kind_keys() {
            state
                .connections
                .insert((key.as_str().to_string(), project.clone()), Arc::clone(&connection));
        }
        state
            .projects
            .entry(project.clone())
            .or_default()
            .push(Arc::clone(&connection));
        info!(server = definition.name(), project = %project, kind_key, "connection registered");
        (connection, true)
    }

    /// The connection serving `kind_key` in `project`, if any.
    pub fn connection_for(&self, kind_key: &str, project: &ProjectScope) -> Option<Arc<ServerConnection>> {
        self.state
            .lock()
            .connections
            .get(&(kind_key.to_string(), project.clone()))
            .cloned()
    }

    /// Connections of one project, in creation order.
    pub fn connections(&self, project: &ProjectScope) -> Vec<Arc<ServerConnection>> {
        self.state
            .lock()
            .projects
            .get(project)
            .cloned()
            .unwrap_or_default()
    }

    /// Every connection.
    pub fn all_connections(&self) -> Vec<Arc<ServerConnection>> {
        self.state.lock().projects.values().flatten().cloned().collect()
    }

    /// Removes every entry pointing at `connection`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownProject`] and removes nothing if no
    /// entry maps to the connection, since its project cannot be located.
    pub fn remove(&self, connection: &Arc<ServerConnection>) -> Result<(), RegistryError> {
        let mut state = self.state.lock();
        let scopes: Vec<ProjectScope> = state
            .connections
            .iter()
            .filter(|(_, c)| Arc::ptr_eq(c, connection))
            .map(|((_, scope), _)| scope.clone())
            .collect();
        if scopes.is_empty() {
            return Err(RegistryError::UnknownProject(connection.definition().name().to_string()));
        }
        state.connections.retain(|_, c| !Arc::ptr_eq(c, connection));
        for scope in scopes {
            if let Some(list) = state.projects.get_mut(&scope) {
                list.retain(|c| !Arc::ptr_eq(c, connection));
                if list.is_empty() {
                    state.projects.remove(&scope);
                }
            }
        }
        debug!(server = connection.definition().name(), project = %connection.project(), "connection removed");
        Ok(())
    }

    /// Drops every connection of a project and returns them.
    pub fn forget_project(&self, project: &ProjectScope) -> Vec<Arc<ServerConnection>> {
        let mut state = self.state.lock();
        state.connections.retain(|(_, scope), _| scope != project);
        state.projects.remove(project).unwrap_or_default()
    }

    /// Drops the definitions registered for a project.
    pub fn forget_project_definitions(&self, project: &ProjectScope) {
        self.state
            .lock()
            .definitions
            .retain(|(_, scope), _| scope != project);
    }
}
