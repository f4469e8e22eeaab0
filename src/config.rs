//! Runtime configuration file.
//!
//! A JSON document describing server definitions, timeout overrides, the
//! restart policy and how server messages are shown:
//!
//! ```json
//! {
//!   "servers": [
//!     { "name": "zls", "command": ["zls"], "kind_keys": ["zig", "zon"],
//!       "language_ids": { "zon": "zig" } }
//!   ],
//!   "timeouts": { "completion": 1500 },
//!   "increase_timeouts": 2,
//!   "restart": { "max_failures": 5, "window": 60000 },
//!   "modal_messages": false
//! }
//! ```
//!
//! The file is looked up at an explicit path, then at `$KADABRA_LSP_CONFIG`,
//! then at `.kadabra-lsp.json` in the workspace root.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ConfigError;
use crate::lsp::types::path_to_url;
use crate::lsp::{OpKind, RestartPolicy, RuntimeOptions, ServerDefinition, Timeouts, Url};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "KADABRA_LSP_CONFIG";

/// Config file name looked up in the workspace root.
pub const CONFIG_FILE_NAME: &str = ".kadabra-lsp.json";

/// One language server entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Display name.
    pub name: String,
    /// Program followed by its arguments.
    pub command: Vec<String>,
    /// Extensions or filename patterns served.
    pub kind_keys: Vec<String>,
    /// Language id per kind key, when it differs from the key.
    #[serde(default)]
    pub language_ids: BTreeMap<String, String>,
    /// Sent as `initializationOptions`.
    #[serde(default)]
    pub initialization_options: Option<Value>,
    /// Extra environment for the server process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Restricts the server to one project; relative to the workspace.
    #[serde(default)]
    pub project: Option<PathBuf>,
}

impl ServerConfig {
    /// Builds the server definition.
    pub fn definition(&self) -> ServerDefinition {
        let (program, args) = self
            .command
            .split_first()
            .map_or((self.name.as_str(), &[][..]), |(program, args)| (program.as_str(), args));
        let mut builder = ServerDefinition::builder(&self.name)
            .kind_keys(self.kind_keys.iter().cloned())
            .command(program, args.iter().cloned());
        for (key, value) in &self.env {
            builder = builder.env(key, value);
        }
        for (key, id) in &self.language_ids {
            builder = builder.language_id(key, id);
        }
        if let Some(options) = &self.initialization_options {
            builder = builder.initialization_options(options.clone());
        }
        builder.build()
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Server definitions.
    pub servers: Vec<ServerConfig>,
    /// Timeout overrides in milliseconds, keyed by operation kind.
    pub timeouts: BTreeMap<String, u64>,
    /// Multiplier applied to every default timeout before overrides.
    pub increase_timeouts: u64,
    /// Restart policy.
    pub restart: RestartPolicy,
    /// Show server messages as blocking dialogs.
    pub modal_messages: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            timeouts: BTreeMap::new(),
            increase_timeouts: 1,
            restart: RestartPolicy::default(),
            modal_messages: false,
        }
    }
}

impl RuntimeConfig {
    /// Parses and validates a config document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and
    /// [`ConfigError::Invalid`] for values that fail validation.
    pub fn from_json(source: &str, origin: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(source).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks names, commands, kind keys and timeout keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for server in &self.servers {
            if server.name.trim().is_empty() {
                return Err(ConfigError::Invalid("server name must not be empty".to_string()));
            }
            if server.command.first().is_none_or(|program| program.trim().is_empty()) {
                return Err(ConfigError::Invalid(format!(
                    "server '{}' has an empty command",
                    server.name
                )));
            }
            if server.kind_keys.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "server '{}' has no kind keys",
                    server.name
                )));
            }
        }
        for key in self.timeouts.keys() {
            key.parse::<OpKind>().map_err(ConfigError::Invalid)?;
        }
        if self.increase_timeouts == 0 {
            return Err(ConfigError::Invalid("increase_timeouts must be at least 1".to_string()));
        }
        Ok(())
    }

    /// The timeout table: scaled defaults, then overrides.
    pub fn timeouts(&self) -> Timeouts {
        let timeouts = Timeouts::scaled(self.increase_timeouts);
        timeouts.set_all(
            self.timeouts
                .iter()
                .filter_map(|(key, millis)| key.parse::<OpKind>().ok().map(|kind| (kind, *millis))),
        );
        timeouts
    }

    /// Runtime options.
    pub fn options(&self) -> RuntimeOptions {
        RuntimeOptions {
            restart: self.restart,
            modal_messages: self.modal_messages,
        }
    }

    /// Definitions with their project scope, project paths resolved
    /// against `workspace`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if a project directory does not exist.
    pub fn definitions(&self, workspace: &Path) -> Result<Vec<(ServerDefinition, Option<Url>)>, ConfigError> {
        self.servers
            .iter()
            .map(|server| {
                let project = match &server.project {
                    Some(path) => Some(path_to_url(&workspace.join(path)).map_err(|e| {
                        ConfigError::Invalid(format!("project of server '{}': {e}", server.name))
                    })?),
                    None => None,
                };
                Ok((server.definition(), project))
            })
            .collect()
    }
}

/// Picks the config file: explicit path, then the environment variable,
/// then the workspace file if it exists.
pub fn resolve_path(explicit: Option<&Path>, workspace: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(CONFIG_ENV).filter(|value| !value.is_empty()) {
        return Some(PathBuf::from(path));
    }
    let candidate = workspace.join(CONFIG_FILE_NAME);
    candidate.is_file().then_some(candidate)
}

/// Reads and validates a config file.
///
/// # Errors
///
/// Returns [`ConfigError::Read`] if the file cannot be read, otherwise the
/// errors of [`RuntimeConfig::from_json`].
pub fn load(path: &Path) -> Result<RuntimeConfig, ConfigError> {
    let source = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    RuntimeConfig::from_json(&source, &path.display().to_string())
}

/// Loads the config for a workspace; defaults when no file is found.
///
/// # Errors
///
/// Returns an error if a config file was found but is unreadable or invalid.
pub fn load_for_workspace(explicit: Option<&Path>, workspace: &Path) -> anyhow::Result<RuntimeConfig> {
    let Some(path) = resolve_path(explicit, workspace) else {
        debug!(workspace = %workspace.display(), "no config file; using defaults");
        return Ok(RuntimeConfig::default());
    };
    debug!(path = %path.display(), "loading config");
    load(&path).with_context(|| format!("failed to load config from {}", path.display()))
}
