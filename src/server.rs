//! TCP server accepting echo connections.
//!
//! The accept loop keeps exactly one accept outstanding. Every accepted
//! stream is handed to its own task running a [`Connection`], and the loop
//! immediately goes back to accepting, so a slow client never delays new
//! arrivals. Accept failures are logged and never stop the loop.

use crate::config::Config;
use crate::connection::{stopped, Connection, ConnectionSettings};
use crate::registry::ConnectionRegistry;
use socket2::{Domain, Protocol, Socket, Type};
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Pause before re-accepting when the process is out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Source of inbound connections.
pub trait Acceptor: Send + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next inbound connection.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Stream, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Acceptor for TcpListener {
    type Stream = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Startup errors. Fatal to the process.
#[derive(Debug)]
pub enum ServerError {
    /// The address could not be bound (e.g. already in use).
    Bind { addr: SocketAddr, source: io::Error },
    /// The socket could not start listening.
    Listen { addr: SocketAddr, source: io::Error },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Bind { addr, source } => {
                write!(f, "Failed to bind {}: {}", addr, source)
            }
            ServerError::Listen { addr, source } => {
                write!(f, "Failed to listen on {}: {}", addr, source)
            }
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind { source, .. } | ServerError::Listen { source, .. } => Some(source),
        }
    }
}

/// Stops a running server.
///
/// Stopping ends the accept loop and closes every connection that is
/// waiting for input. Writes already in flight complete first.
///
/// The stopped state is sticky: a stop issued before the server starts
/// running, or before a connection starts reading, is still observed.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Server instance
pub struct Server<A = TcpListener> {
    acceptor: A,
    settings: Arc<ConnectionSettings>,
    registry: Arc<ConnectionRegistry>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Server<TcpListener> {
    /// Bind and listen on the configured address.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = config.listen_addr();
        let listener = bind_listener(addr, config.backlog)?;

        let limits = config.limits;
        if !limits.accepts_every_read() {
            warn!(
                read_capacity = limits.read_capacity(),
                write_capacity = limits.write_capacity(),
                "Write buffer cannot hold a full read plus terminator; full reads will be dropped"
            );
        }

        Ok(Self::with_acceptor(
            listener,
            config.connection_settings(),
            config.max_connections,
        ))
    }
}

impl<A: Acceptor> Server<A> {
    /// Create a server over an existing connection source.
    pub fn with_acceptor(
        acceptor: A,
        settings: ConnectionSettings,
        max_connections: Option<usize>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Server {
            acceptor,
            settings: Arc::new(settings),
            registry: ConnectionRegistry::new(max_connections),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Active connections, for observation only.
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: Arc::clone(&self.shutdown),
        }
    }

    /// Run the accept loop until stopped.
    pub async fn run(mut self) {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = self.acceptor.accept() => match result {
                    Ok((stream, peer)) => self.spawn_connection(stream, peer),
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                        if is_fd_exhausted(&e) {
                            tokio::time::sleep(ACCEPT_BACKOFF).await;
                        }
                    }
                },
                _ = stopped(&mut shutdown) => {
                    info!(active = self.registry.len(), "Server stopping");
                    break;
                }
            }
        }
    }

    fn spawn_connection(&self, stream: A::Stream, peer: SocketAddr) {
        let Some(registration) = self.registry.register(peer) else {
            warn!(
                %peer,
                max = ?self.registry.capacity(),
                "Connection limit reached, dropping connection"
            );
            return;
        };

        info!(
            %peer,
            id = registration.id(),
            active = self.registry.len(),
            "New connection"
        );

        let connection = Connection::new(
            stream,
            peer,
            Arc::clone(&self.settings),
            self.shutdown.subscribe(),
        );

        tokio::spawn(async move {
            let disconnect = connection.run().await;
            debug!(%peer, id = registration.id(), reason = ?disconnect, "Connection released");
            drop(registration);
        });
    }
}

/// Create a listening socket with `SO_REUSEADDR`.
fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener, ServerError> {
    let bind_err = |source| ServerError::Bind { addr, source };
    let listen_err = |source| ServerError::Listen { addr, source };

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(backlog).map_err(listen_err)?;

    let listener = TcpListener::from_std(socket.into()).map_err(listen_err)?;
    let local = listener.local_addr().unwrap_or(addr);
    info!(address = %local, backlog, "Server listening");
    Ok(listener)
}

fn is_fd_exhausted(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE))
}
