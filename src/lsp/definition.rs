//! Server definitions, kind keys and project scopes.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use lsp_types::Url;
use regex::Regex;
use serde_json::Value;

use super::transport::Connector;

/// The scope a definition or connection belongs to.
///
/// `Application` is the empty scope that applies to every project.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProjectScope {
    /// Applies to all projects.
    Application,
    /// A single project, identified by its root URI.
    Project(Url),
}

impl ProjectScope {
    /// Returns the project root URI, if this is a project scope.
    pub fn root_url(&self) -> Option<&Url> {
        match self {
            Self::Application => None,
            Self::Project(url) => Some(url),
        }
    }

    /// Returns the project root as a filesystem path, if it has one.
    pub fn root_path(&self) -> Option<PathBuf> {
        self.root_url().and_then(|url| url.to_file_path().ok())
    }

    /// The scope's string form; empty for the application scope.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Application => "",
            Self::Project(url) => url.as_str(),
        }
    }
}

impl From<Option<Url>> for ProjectScope {
    fn from(project: Option<Url>) -> Self {
        project.map_or(Self::Application, Self::Project)
    }
}

impl fmt::Display for ProjectScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Application => f.write_str("<application>"),
            Self::Project(url) => f.write_str(url.as_str()),
        }
    }
}

/// A file kind key: either a file extension or a filename pattern.
///
/// Every key is tried both ways. The pattern form must match the whole file
/// name; keys that are not valid regular expressions only match extensions.
#[derive(Debug, Clone)]
pub struct KindKey {
    key: String,
    pattern: Option<Regex>,
}

impl KindKey {
    /// Creates a kind key, compiling its filename pattern form.
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let pattern = Regex::new(&format!("^(?:{key})$")).ok();
        Self { key, pattern }
    }

    /// The raw key.
    pub fn as_str(&self) -> &str {
        &self.key
    }

    /// True if the key equals the given extension.
    pub fn matches_extension(&self, extension: Option<&str>) -> bool {
        extension == Some(self.key.as_str())
    }

    /// True if the key, read as a pattern, matches the whole file name.
    pub fn matches_file_name(&self, file_name: &str) -> bool {
        self.pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(file_name))
    }
}

impl PartialEq for KindKey {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for KindKey {}

/// How to launch a language server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Program to execute.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

/// Transport to a language server.
#[derive(Debug, Clone)]
pub enum LaunchSpec {
    /// Spawn a subprocess and talk over its stdin/stdout.
    Process(ProcessSpec),
    /// Obtain a byte stream from a custom connector.
    Connector(Arc<dyn Connector>),
}

/// Describes a language server and the files it serves.
///
/// Immutable once built; re-registering a definition for the same key
/// replaces it in the registry.
#[derive(Debug, Clone)]
pub struct ServerDefinition {
    name: String,
    kind_keys: Vec<KindKey>,
    launch: LaunchSpec,
    language_ids: HashMap<String, String>,
    initialization_options: Option<Value>,
}

impl ServerDefinition {
    /// Creates a new builder for a definition with the given display name.
    pub fn builder(name: impl Into<String>) -> ServerDefinitionBuilder {
        ServerDefinitionBuilder::new(name)
    }

    /// Display name of the server.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordered, de-duplicated kind keys served by this definition.
    pub fn kind_keys(&self) -> &[KindKey] {
        &self.kind_keys
    }

    /// Looks up one of this definition's kind keys.
    pub fn kind_key(&self, key: &str) -> Option<&KindKey> {
        self.kind_keys.iter().find(|k| k.as_str() == key)
    }

    /// How to reach the server.
    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    /// Options forwarded in the `initialize` request.
    pub fn initialization_options(&self) -> Option<&Value> {
        self.initialization_options.as_ref()
    }

    /// The LSP language id for documents of the given kind key.
    ///
    /// Falls back to the key itself when no explicit id was configured.
    pub fn language_id_for(&self, key: &str) -> String {
        self.language_ids
            .get(key)
            .cloned()
            .unwrap_or_else(|| key.to_string())
    }
}

impl fmt::Display for ServerDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<&str> = self.kind_keys.iter().map(KindKey::as_str).collect();
        write!(f, "{} [{}]", self.name, keys.join(","))
    }
}

/// Builder for [`ServerDefinition`].
#[derive(Debug)]
pub struct ServerDefinitionBuilder {
    name: String,
    kind_keys: Vec<KindKey>,
    launch: LaunchSpec,
    language_ids: HashMap<String, String>,
    initialization_options: Option<Value>,
}

impl ServerDefinitionBuilder {
    fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            launch: LaunchSpec::Process(ProcessSpec {
                program: name.clone(),
                args: Vec::new(),
                env: Vec::new(),
            }),
            name,
            kind_keys: Vec::new(),
            language_ids: HashMap::new(),
            initialization_options: None,
        }
    }

    /// Adds a kind key. Duplicates are ignored.
    #[must_use]
    pub fn kind_key(mut self, key: impl Into<String>) -> Self {
        let key = KindKey::new(key);
        if !self.kind_keys.contains(&key) {
            self.kind_keys.push(key);
        }
        self
    }

    /// Adds several kind keys, in order.
    #[must_use]
    pub fn kind_keys(self, keys: impl IntoIterator<Item = impl Into<String>>) -> Self {
        keys.into_iter().fold(self, |builder, key| builder.kind_key(key))
    }

    /// Launches the server as a subprocess.
    #[must_use]
    pub fn command(
        mut self,
        program: impl Into<String>,
        args: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let env = match &self.launch {
            LaunchSpec::Process(spec) => spec.env.clone(),
            LaunchSpec::Connector(_) => Vec::new(),
        };
        self.launch = LaunchSpec::Process(ProcessSpec {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env,
        });
        self
    }

    /// Sets an environment variable for the server subprocess.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let LaunchSpec::Process(spec) = &mut self.launch {
            spec.env.push((key.into(), value.into()));
        }
        self
    }

    /// Reaches the server through a custom connector.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.launch = LaunchSpec::Connector(connector);
        self
    }

    /// Maps a kind key to an LSP language id.
    #[must_use]
    pub fn language_id(mut self, key: impl Into<String>, id: impl Into<String>) -> Self {
        self.language_ids.insert(key.into(), id.into());
        self
    }

    /// Sets the `initializationOptions` payload.
    #[must_use]
    pub fn initialization_options(mut self, options: Value) -> Self {
        self.initialization_options = Some(options);
        self
    }

    /// Builds the definition.
    pub fn build(self) -> ServerDefinition {
        ServerDefinition {
            name: self.name,
            kind_keys: self.kind_keys,
            launch: self.launch,
            language_ids: self.language_ids,
            initialization_options: self.initialization_options,
        }
    }
}
