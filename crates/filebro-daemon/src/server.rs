//! Socket server for JSON-RPC clients.
//!
//! Listens on a Unix socket and, when configured, on a loopback TCP port.
//! Every connection becomes one session: requests are answered in order on
//! the connection, and a per-session task drains the outbound queue into the
//! same writer.

use crate::navigation::NavigationHistory;
use crate::outbound::OutboundQueue;
use crate::scheduler::{SchedulerSettings, TaskScheduler};
use crate::session_manager::{Dispatch, SessionError, SessionManager};
use anyhow::{bail, Context, Result};
use filebro_config::DaemonConfig;
use filebro_drivers::DriverRegistry;
use filebro_protocol::{remove_socket, EventMessage, SessionId};
use filebro_watch::ChangeWatcher;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, WriteHalf};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The running services behind the listeners.
pub struct Daemon {
    manager: Arc<SessionManager>,
    scheduler: TaskScheduler,
    watcher: Arc<ChangeWatcher>,
    scheduler_task: JoinHandle<()>,
    multiplexer: JoinHandle<()>,
    shutdown_grace: Duration,
}

impl Daemon {
    /// Wire the registry, watcher, scheduler and session manager together.
    pub async fn start(config: &DaemonConfig, registry: DriverRegistry) -> Self {
        let registry = Arc::new(registry);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let watcher = Arc::new(ChangeWatcher::new(
            registry.clone(),
            outbound_tx.clone(),
            config.watch.debounce(),
        ));
        let (scheduler, scheduler_task) =
            TaskScheduler::start(SchedulerSettings::from(&config.scheduler), outbound_tx);
        let navigation = Arc::new(NavigationHistory::load(&config.navigation).await);

        let manager = Arc::new(SessionManager::new(
            registry,
            watcher.clone(),
            scheduler.clone(),
            navigation,
            config.session.outbound_queue_capacity,
        ));
        let multiplexer = tokio::spawn(manager.clone().run_multiplexer(outbound_rx));

        Self {
            manager,
            scheduler,
            watcher,
            scheduler_task,
            multiplexer,
            shutdown_grace: config.scheduler.cancel_grace(),
        }
    }

    pub fn manager(&self) -> Arc<SessionManager> {
        self.manager.clone()
    }

    /// Stop workers and watches. Sessions still connected see their
    /// connections close.
    pub async fn shutdown(self) {
        self.scheduler.shutdown(self.shutdown_grace).await;
        if tokio::time::timeout(Duration::from_secs(5), self.scheduler_task)
            .await
            .is_err()
        {
            warn!("Scheduler did not stop within timeout");
        }
        self.watcher.shutdown();
        self.multiplexer.abort();
    }
}

/// Daemon server listening on a Unix socket and optional TCP port.
pub struct Server {
    unix: UnixListener,
    tcp: Option<TcpListener>,
    socket_path: PathBuf,
    daemon: Daemon,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind the listeners and start the daemon services.
    pub async fn bind(config: &DaemonConfig, registry: DriverRegistry) -> Result<Self> {
        let socket_path = config.server.socket_path();
        let unix = bind_unix(&socket_path)?;
        let tcp = match config.server.tcp_port {
            Some(port) => Some(bind_port_range(port, config.server.port_range).await?),
            None => None,
        };

        let daemon = Daemon::start(config, registry).await;
        info!(socket = %socket_path.display(), "Daemon listening");
        Ok(Self {
            unix,
            tcp,
            socket_path,
            daemon,
            shutdown: CancellationToken::new(),
        })
    }

    /// Cancelling the token stops the server.
    pub fn shutdown_handle(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn manager(&self) -> Arc<SessionManager> {
        self.daemon.manager()
    }

    /// Accept connections until shutdown.
    pub async fn run(self) -> Result<()> {
        let Self {
            unix,
            tcp,
            socket_path,
            daemon,
            shutdown,
        } = self;
        let manager = daemon.manager();

        loop {
            tokio::select! {
                accepted = unix.accept() => match accepted {
                    Ok((stream, _)) => {
                        spawn_connection(stream, "unix".to_string(), manager.clone(), shutdown.child_token());
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                accepted = accept_tcp(tcp.as_ref()) => match accepted {
                    Ok((stream, peer)) => {
                        spawn_connection(stream, peer.to_string(), manager.clone(), shutdown.child_token());
                    }
                    Err(e) => error!("Accept error: {}", e),
                },
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(unix);
        daemon.shutdown().await;
        remove_socket(&socket_path);
        info!("Daemon stopped");
        Ok(())
    }
}

fn bind_unix(path: &Path) -> Result<UnixListener> {
    // Remove stale socket
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating socket directory {}", parent.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("binding {}", path.display()))
}

/// Bind the first free loopback port in `[first, first + range)`.
pub async fn bind_port_range(first: u16, range: u16) -> Result<TcpListener> {
    let last = first.saturating_add(range.max(1) - 1);
    for port in first..=last {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                info!(port, "Listening on loopback TCP");
                return Ok(listener);
            }
            Err(e) => debug!(port, error = %e, "Port unavailable"),
        }
    }
    bail!("no free TCP port in {first}..={last}")
}

async fn accept_tcp(
    listener: Option<&TcpListener>,
) -> std::io::Result<(tokio::net::TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

fn spawn_connection<S>(
    stream: S,
    peer: String,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = handle_connection(stream, &peer, manager, shutdown).await {
            match e.reason() {
                filebro_protocol::Reason::ConnectionLost => debug!(peer = %peer, "{}", e),
                _ => warn!(peer = %peer, "{}", e),
            }
        }
    });
}

/// Serve one client connection as one session.
pub async fn handle_connection<S>(
    stream: S,
    peer: &str,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
) -> std::result::Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (session, queue) = manager.connect();
    debug!(session_id = %session, peer, "Session started");
    let (reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));

    let event_task = tokio::spawn(forward_events(
        session,
        queue,
        writer.clone(),
        manager.clone(),
    ));

    let mut lines = BufReader::new(reader).lines();
    let outcome = loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(SessionError::ConnectionLost(e.to_string())),
        };
        if line.trim().is_empty() {
            continue;
        }

        let dispatch = manager.handle_line(session, &line).await;
        if let Err(e) = write_line(&writer, dispatch.response().to_json_line()).await {
            break Err(e);
        }
        if let Dispatch::Close(response) = dispatch {
            break match response.error {
                Some(error) => Err(SessionError::ProtocolViolation(error.message)),
                None => Ok(()),
            };
        }
    };

    manager.disconnect(session);
    let _ = tokio::time::timeout(Duration::from_millis(100), event_task).await;
    outcome
}

async fn forward_events<W>(
    session: SessionId,
    queue: Arc<OutboundQueue>,
    writer: Arc<Mutex<WriteHalf<W>>>,
    manager: Arc<SessionManager>,
) where
    W: AsyncWrite,
{
    while let Some(event) = queue.pop().await {
        let line = EventMessage::new(event).to_json_line();
        if let Err(e) = write_line(&writer, line).await {
            debug!(session_id = %session, error = %e, "Event delivery failed");
            manager.disconnect(session);
            break;
        }
    }
}

async fn write_line<W>(
    writer: &Mutex<WriteHalf<W>>,
    line: std::result::Result<String, serde_json::Error>,
) -> std::result::Result<(), SessionError>
where
    W: AsyncWrite,
{
    let line = line.map_err(|e| SessionError::ProtocolViolation(e.to_string()))?;
    let mut w = writer.lock().await;
    w.write_all(line.as_bytes())
        .await
        .map_err(|e| SessionError::ConnectionLost(e.to_string()))?;
    w.flush()
        .await
        .map_err(|e| SessionError::ConnectionLost(e.to_string()))
}
