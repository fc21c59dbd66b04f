//! Local HTTP listener that receives the OAuth2 redirect.
//!
//! Binds `127.0.0.1:<port>` and answers every request with a static page.
//! The first `code` (or provider `error`) found in a request's query string
//! is handed to [`RedirectListener::wait`]. Connections are served
//! concurrently, so an idle socket cannot hold up the redirect. Accept
//! errors are logged and retried. The serving task and its connections are
//! always stopped and joined before `wait` or `shutdown` return.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use url::Url;

pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);
const MAX_REQUEST_HEAD: u64 = 8 * 1024;

const CONFIRMATION_PAGE: &str = "<!DOCTYPE html>\n<html><head><title>Dropbox CLI</title></head>\
<body><p>You can close this page and return to your CLI. It is now authenticated.</p></body></html>\n";

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to start server on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("authorization denied: {error} {description}")]
    Denied { error: String, description: String },

    #[error("redirect server stopped: {0}")]
    Stopped(#[source] io::Error),
}

/// What the browser delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Redirect {
    Code(String),
    Denied { error: String, description: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Code(String),
    Interrupted,
}

pub struct RedirectListener {
    local_addr: SocketAddr,
    redirect_rx: oneshot::Receiver<Redirect>,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RedirectListener {
    /// Bind and start serving. Port 0 picks a free port.
    pub async fn bind(port: u16) -> Result<Self, ListenerError> {
        let bind_err = |source| ListenerError::Bind { port, source };
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        tracing::info!(%local_addr, "redirect listener started");

        let (redirect_tx, redirect_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(serve(listener, redirect_tx, shutdown_rx));

        Ok(Self {
            local_addr,
            redirect_rx,
            shutdown_tx,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://localhost:{}", self.local_addr.port())
    }

    /// Wait until a code arrives, the provider reports an error, the server
    /// task exits, or `interrupt` completes. The listener is shut down either way.
    pub async fn wait<F>(mut self, interrupt: F) -> Result<WaitOutcome, ListenerError>
    where
        F: Future<Output = ()>,
    {
        let outcome = tokio::select! {
            redirect = &mut self.redirect_rx => match redirect {
                Ok(Redirect::Code(code)) => Ok(WaitOutcome::Code(code)),
                Ok(Redirect::Denied { error, description }) => {
                    Err(ListenerError::Denied { error, description })
                }
                Err(_) => Err(ListenerError::Stopped(io::Error::other("server task exited"))),
            },
            _ = interrupt => {
                tracing::info!("interrupted while waiting for authorization");
                Ok(WaitOutcome::Interrupted)
            }
        };

        self.shutdown().await;
        outcome
    }

    /// Stop serving and join the task, aborting it after [`SHUTDOWN_GRACE`].
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        let mut task = self.task;
        match tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await {
            Ok(Ok(())) => tracing::debug!("redirect listener stopped"),
            Ok(Err(e)) => tracing::warn!("redirect listener task failed: {e}"),
            Err(_) => {
                tracing::warn!("redirect listener did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

/// Source of incoming connections.
trait Accept: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

async fn serve<A: Accept>(
    listener: A,
    redirect_tx: oneshot::Sender<Redirect>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut redirect_tx = Some(redirect_tx);
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(async move {
                        let served =
                            tokio::time::timeout(CONNECTION_TIMEOUT, handle_connection(stream)).await;
                        (peer, served)
                    });
                }
                Err(e) => {
                    tracing::warn!("failed to accept connection: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
            Some(joined) = connections.join_next() => match joined {
                Ok((peer, Ok(Ok(Some(redirect))))) => {
                    if let Some(tx) = redirect_tx.take() {
                        tracing::debug!(%peer, "redirect received");
                        let _ = tx.send(redirect);
                    }
                }
                Ok((_, Ok(Ok(None)))) => {}
                Ok((peer, Ok(Err(e)))) => tracing::warn!(%peer, "failed to serve request: {e}"),
                Ok((peer, Err(_))) => tracing::debug!(%peer, "idle connection timed out"),
                Err(e) => tracing::warn!("connection task failed: {e}"),
            },
        }
    }

    connections.shutdown().await;
}

async fn handle_connection(stream: TcpStream) -> io::Result<Option<Redirect>> {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read.take(MAX_REQUEST_HEAD));

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    loop {
        let mut header = String::new();
        let n = reader.read_line(&mut header).await?;
        if n == 0 || header.trim_end().is_empty() {
            break;
        }
    }

    let redirect = parse_request_line(&request_line);

    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        CONFIRMATION_PAGE.len(),
        CONFIRMATION_PAGE
    );
    write.write_all(response.as_bytes()).await?;
    write.shutdown().await?;

    Ok(redirect)
}

/// Extract the redirect from `GET <target> HTTP/1.1`.
fn parse_request_line(line: &str) -> Option<Redirect> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let target = parts.next()?;
    if method != "GET" {
        return None;
    }

    let url = Url::parse("http://localhost/").ok()?.join(target).ok()?;
    let mut code = None;
    let mut error = None;
    let mut description = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "code" if code.is_none() => code = Some(value.into_owned()),
            "error" => error = Some(value.into_owned()),
            "error_description" => description = Some(value.into_owned()),
            _ => {}
        }
    }

    if let Some(error) = error {
        return Some(Redirect::Denied {
            error,
            description: description.unwrap_or_default(),
        });
    }
    code.filter(|c| !c.is_empty()).map(Redirect::Code)
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
pub async fn interrupt_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
