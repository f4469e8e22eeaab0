use std::path::PathBuf;

use kadabra_lsp_runtime::host::MemoryHost;
use kadabra_lsp_runtime::lsp::Url;
use kadabra_lsp_runtime::lsp::types::path_to_url;
use tempfile::TempDir;

/// Represents a test fixture with files and a cursor position.
#[derive(Debug)]
pub struct Fixture {
    /// files in fixture
    pub files: Vec<(PathBuf, String)>,
    /// File holding the cursor and its byte offset
    pub cursor: (PathBuf, usize),
}

/// Parses fixture text into file contents and paths.
/// ## Panics
/// if input is malformed or cursor is not found
pub fn parse_fixture(input: &str) -> Fixture {
    let mut files = Vec::new();
    let mut current_path: Option<PathBuf> = None;
    let mut current_content = String::new();

    let mut cursor = None;

    for line in input.lines() {
        if let Some(path) = line.strip_prefix("//- ") {
            if let Some(p) = current_path.take() {
                files.push((p, current_content.clone()));
                current_content.clear();
            }
            // Store relative path (trim leading slash)
            current_path = Some(PathBuf::from(path.trim_start_matches('/')));
        } else if current_path.is_some() {
            let mut l = line.to_string();
            if let Some(idx) = l.find("$0") {
                let path = current_path.clone().expect("cursor outside a file");
                cursor = Some((path, current_content.len() + idx));
                l = l.replace("$0", "");
            }
            current_content.push_str(&l);
            current_content.push('\n');
        }
    }

    if let Some(p) = current_path {
        files.push((p, current_content));
    }

    Fixture {
        files,
        cursor: cursor.expect("missing $0 cursor"),
    }
}

/// Fixture files written to a temporary directory.
pub struct TestWorkspace {
    /// Temporary folder for the workspace
    pub root: TempDir,
    /// fixture for the workspace
    pub fixture: Fixture,
    /// Canonicalized root path (resolves symlinks like /var -> /private/var on macOS)
    canonical_root: PathBuf,
}

impl TestWorkspace {
    /// Writes the fixture files.
    /// ## Panics
    /// Panics if the files cannot be written.
    pub fn new(fixture: &str) -> Self {
        let root = TempDir::new().expect("Failed to create temp directory");
        let fixture = parse_fixture(fixture);

        for (path, content) in &fixture.files {
            let abs = root.path().join(path);
            std::fs::create_dir_all(abs.parent().unwrap()).unwrap();
            std::fs::write(&abs, content).unwrap();
        }

        let canonical_root = root
            .path()
            .canonicalize()
            .expect("Failed to canonicalize root");

        Self {
            root,
            fixture,
            canonical_root,
        }
    }

    /// Returns the canonicalized root path
    pub fn canonical_root(&self) -> &PathBuf {
        &self.canonical_root
    }

    /// Converts a relative path to an absolute path
    pub fn apath(&self, path: &str) -> PathBuf {
        self.canonical_root.join(path)
    }

    /// Root directory as a project URL.
    pub fn project(&self) -> Url {
        path_to_url(&self.canonical_root).expect("root has a file url")
    }

    /// Loads every fixture file into `host`, returning their URIs.
    pub fn load_into(&self, host: &MemoryHost) -> Vec<Url> {
        self.fixture
            .files
            .iter()
            .map(|(path, _)| {
                host.load_file(&self.canonical_root.join(path))
                    .expect("fixture file loads")
            })
            .collect()
    }

    /// URI and byte offset of the `$0` cursor.
    pub fn cursor(&self) -> (Url, usize) {
        let (path, offset) = &self.fixture.cursor;
        let uri = path_to_url(&self.canonical_root.join(path)).expect("cursor file has a url");
        (uri, *offset)
    }
}
