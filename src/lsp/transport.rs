//! Byte-stream transports and the client main loop.
//!
//! A server is reached either by spawning a subprocess and talking over its
//! stdio, or through a [`Connector`] that hands back any duplex stream. The
//! stream is driven by an async-lsp main loop with tracing, panic catching
//! and concurrency layers in front of the client router.

use std::fmt;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::time::Duration;

use async_lsp::concurrency::ConcurrencyLayer;
use async_lsp::panic::CatchUnwindLayer;
use async_lsp::tracing::TracingLayer;
use async_lsp::{MainLoop, ServerSocket};
use futures::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tracing::{debug, warn};

use crate::error::LspError;

use super::LspResult;
use super::definition::{LaunchSpec, ProcessSpec};
use super::handlers::{ClientState, client_router};

/// A duplex byte stream to a language server.
pub struct Channel {
    reader: Pin<Box<dyn AsyncRead + Send>>,
    writer: Pin<Box<dyn AsyncWrite + Send>>,
    child: Option<async_process::Child>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("process", &self.child.as_ref().map(async_process::Child::id))
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Wraps a reader/writer pair.
    pub fn new(
        reader: impl AsyncRead + Send + 'static,
        writer: impl AsyncWrite + Send + 'static,
    ) -> Self {
        Self {
            reader: Box::pin(reader),
            writer: Box::pin(writer),
            child: None,
        }
    }
}

/// Produces a stream to a server that is not spawned as a subprocess.
pub trait Connector: Send + Sync + fmt::Debug {
    /// Opens a stream for a server rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the server cannot be reached.
    fn connect(&self, root: Option<&Path>) -> LspResult<Channel>;
}

/// Spawns a server subprocess and connects to its stdio.
///
/// # Errors
///
/// Returns [`LspError::ServerStartFailed`] if the process cannot be spawned
/// or its pipes cannot be captured.
pub fn spawn_process(spec: &ProcessSpec, root: Option<&Path>) -> LspResult<Channel> {
    let mut cmd = async_process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(root) = root.filter(|root| root.is_dir()) {
        cmd.current_dir(root);
    }

    let mut child = cmd.spawn().map_err(|e| {
        LspError::ServerStartFailed(format!("failed to spawn '{}': {}", spec.program, e))
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| LspError::ServerStartFailed("failed to capture stdout".to_string()))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| LspError::ServerStartFailed("failed to capture stdin".to_string()))?;

    debug!(program = %spec.program, pid = child.id(), "spawned language server");
    let mut channel = Channel::new(stdout, stdin);
    channel.child = Some(child);
    Ok(channel)
}

/// Opens the channel a launch spec describes.
///
/// # Errors
///
/// Returns an error if the process cannot be spawned or the connector
/// fails.
pub fn open_channel(launch: &LaunchSpec, root: Option<&Path>) -> LspResult<Channel> {
    match launch {
        LaunchSpec::Process(spec) => spawn_process(spec, root),
        LaunchSpec::Connector(connector) => connector.connect(root),
    }
}

/// A running main loop over a channel.
#[derive(Debug)]
pub(crate) struct Transport {
    socket: ServerSocket,
    mainloop: JoinHandle<()>,
    child: Option<async_process::Child>,
}

impl Transport {
    /// Starts the main loop. `on_exit` runs once when the stream closes or
    /// the loop fails, unless the transport was closed first.
    pub(crate) fn start(
        channel: Channel,
        state: ClientState,
        on_exit: impl FnOnce(String) + Send + 'static,
    ) -> Self {
        let (mainloop, socket) = MainLoop::new_client(|_server| {
            ServiceBuilder::new()
                .layer(TracingLayer::default())
                .layer(CatchUnwindLayer::default())
                .layer(ConcurrencyLayer::default())
                .service(client_router(state))
        });

        let Channel {
            reader,
            writer,
            child,
        } = channel;
        let mainloop = tokio::spawn(async move {
            let cause = match mainloop.run_buffered(reader, writer).await {
                Ok(()) => "stream closed".to_string(),
                Err(e) => format!("main loop failed: {e:?}"),
            };
            on_exit(cause);
        });

        Self {
            socket,
            mainloop,
            child,
        }
    }

    pub(crate) fn socket(&self) -> &ServerSocket {
        &self.socket
    }

    /// Waits up to `grace` for the loop to end by itself, then tears it
    /// down and kills the process.
    pub(crate) async fn close(mut self, grace: Duration) {
        if !grace.is_zero() && tokio::time::timeout(grace, &mut self.mainloop).await.is_ok() {
            debug!("main loop finished");
        }
        self.abort();
    }

    /// Tears the transport down immediately.
    pub(crate) fn abort(&mut self) {
        self.mainloop.abort();
        if let Some(mut child) = self.child.take()
            && let Err(e) = child.kill()
        {
            warn!("failed to kill language server process: {e}");
        }
    }
}
