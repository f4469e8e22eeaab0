//! Kadabra LSP client - Entry Point
//!
//! Runs the runtime headless against a real language server and prints
//! what an editor would show: workspace symbols, hover text, diagnostics
//! or the formatted document.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use kadabra_lsp_runtime::config;
use kadabra_lsp_runtime::host::MemoryHost;
use kadabra_lsp_runtime::lsp::types::{from_lsp_position, position_to_offset, to_lsp_position};
use kadabra_lsp_runtime::lsp::{EditorSession, LspRuntime, ServerDefinition, Url};

/// Headless client for language servers.
#[derive(Parser, Debug)]
#[command(name = "kadabra-lsp")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file; defaults to $KADABRA_LSP_CONFIG or .kadabra-lsp.json.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Workspace root directory.
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Language server command when no config file is found.
    #[arg(short, long, default_value = "zls")]
    language_server: String,

    /// Arguments to pass to the language server.
    #[arg(long)]
    language_server_args: Vec<String>,

    /// File extension the fallback server handles.
    #[arg(short, long, default_value = "zig")]
    kind_key: String,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Searches workspace symbols.
    Symbols {
        /// Symbol query.
        query: String,
        /// File to open first so its server starts.
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Prints hover text at a 1-based line and column.
    Hover {
        /// Source file.
        file: PathBuf,
        /// Line, 1-based.
        line: u32,
        /// Column, 1-based.
        column: u32,
    },
    /// Prints the diagnostics the server publishes for a file.
    Diagnostics {
        /// Source file.
        file: PathBuf,
        /// How long to wait for diagnostics, in milliseconds.
        #[arg(long, default_value_t = 2000)]
        wait_ms: u64,
    },
    /// Formats a file and prints the result.
    Format {
        /// Source file.
        file: PathBuf,
        /// Write the result back to the file.
        #[arg(long)]
        write: bool,
    },
}

impl Args {
    /// Parses the log level string into a tracing Level.
    fn parse_log_level(&self) -> Result<Level> {
        match self.log_level.to_lowercase().as_str() {
            "trace" => Ok(Level::TRACE),
            "debug" => Ok(Level::DEBUG),
            "info" => Ok(Level::INFO),
            "warn" => Ok(Level::WARN),
            "error" => Ok(Level::ERROR),
            other => bail!("invalid log level: {}", other),
        }
    }
}

/// Initializes the tracing subscriber for logging.
fn init_tracing(level: Level) -> Result<()> {
    // Create an env filter that respects RUST_LOG but has a default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "kadabra_lsp_runtime={level},kadabra_lsp={level},lsp={level},async_lsp={level}"
        ))
    });

    // Logs go to stderr so stdout only carries results
    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .context("failed to initialize tracing subscriber")?;

    Ok(())
}

struct Workbench {
    host: Arc<MemoryHost>,
    runtime: LspRuntime,
    project: Url,
}

impl Workbench {
    async fn open(&self, file: &Path) -> Result<(Url, Arc<EditorSession>)> {
        let uri = self
            .host
            .load_file(file)
            .with_context(|| format!("failed to open {}", file.display()))?;
        let editor = self.host.open_editor(&uri, Some(self.project.clone()));
        let session = self
            .runtime
            .editor_opened(editor)
            .await
            .with_context(|| format!("no language server configured for {}", file.display()))?;
        Ok((uri, session))
    }

    fn offset(&self, uri: &Url, line: u32, column: u32) -> Result<usize> {
        let text = self.host.text(uri).context("document vanished")?;
        let position = to_lsp_position(line, column)?;
        position_to_offset(&text, position)
            .with_context(|| format!("position {line}:{column} is outside the file"))
    }
}

async fn run(args: Args, workspace: PathBuf) -> Result<()> {
    let config = config::load_for_workspace(args.config.as_deref(), &workspace)?;
    let host = Arc::new(MemoryHost::new());
    let runtime = LspRuntime::with_options(host.clone(), config.options(), Arc::new(config.timeouts()));
    let project = kadabra_lsp_runtime::lsp::types::path_to_url(&workspace)?;

    let definitions = config.definitions(&workspace)?;
    if definitions.is_empty() {
        let definition = ServerDefinition::builder(&args.language_server)
            .kind_key(&args.kind_key)
            .command(&args.language_server, args.language_server_args.clone())
            .build();
        runtime.register_definition(definition, Some(project.clone())).await;
    } else {
        for (definition, scope) in definitions {
            runtime.register_definition(definition, scope).await;
        }
    }

    let workbench = Workbench {
        host,
        runtime,
        project: project.clone(),
    };
    let result: Result<()> = async {
        match args.command {
            Command::Symbols { query, file } => {
                if let Some(file) = file {
                    workbench.open(&file).await?;
                }
                workbench.runtime.project_opened(project.clone()).await;
                if workbench.runtime.connections(Some(project.clone())).is_empty() {
                    bail!("no language server running for the workspace; pass --file");
                }
                for item in workbench.runtime.workspace_symbols(Some(project), &query).await {
                    let (line, column) = from_lsp_position(item.location.range.start);
                    println!(
                        "{}\t{:?}\t{}:{}:{}{}",
                        item.name,
                        item.kind,
                        item.location.uri,
                        line,
                        column,
                        if item.deprecated { "\t(deprecated)" } else { "" }
                    );
                }
                Ok(())
            }
            Command::Hover { file, line, column } => {
                let (uri, session) = workbench.open(&file).await?;
                let offset = workbench.offset(&uri, line, column)?;
                println!("{}", session.hover(offset).await);
                Ok(())
            }
            Command::Diagnostics { file, wait_ms } => {
                let (_, session) = workbench.open(&file).await?;
                tokio::time::sleep(Duration::from_millis(wait_ms)).await;
                for diagnostic in session.diagnostics() {
                    let (line, column) = from_lsp_position(diagnostic.range.start);
                    let severity = diagnostic
                        .severity
                        .map_or_else(|| "unknown".to_string(), |s| format!("{s:?}"));
                    println!("{}:{}:{}: {}: {}", file.display(), line, column, severity, diagnostic.message);
                }
                Ok(())
            }
            Command::Format { file, write } => {
                let (uri, session) = workbench.open(&file).await?;
                if !session.reformat().await {
                    info!("formatter returned no edits");
                }
                let text = workbench.host.text(&uri).context("document vanished")?;
                if write {
                    std::fs::write(&file, &text).with_context(|| format!("failed to write {}", file.display()))?;
                } else {
                    print!("{text}");
                }
                Ok(())
            }
        }
    }
    .await;

    workbench.runtime.shutdown().await;
    result
}

/// Main entry point.
#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Initialize tracing
    let log_level = args.parse_log_level()?;
    init_tracing(log_level)?;

    // Canonicalize the workspace path
    let workspace = args.workspace.canonicalize().context(format!(
        "failed to canonicalize workspace path: {}",
        args.workspace.display()
    ))?;

    info!(
        workspace = %workspace.display(),
        language_server = %args.language_server,
        "starting kadabra-lsp"
    );

    run(args, workspace).await
}
