//! Per-connection echo cycle.
//!
//! A [`Connection`] exclusively owns one accepted stream and its two fixed
//! buffers, and alternates strictly between reading a message and writing
//! its echo. The spawned task that calls [`Connection::run`] owns the
//! connection, so it stays alive for as long as a read or write is pending.

use crate::protocol::{frame_message, BufferLimits};
use bytes::{Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

/// Settings shared by every connection of a server.
#[derive(Debug, Clone, Default)]
pub struct ConnectionSettings {
    pub limits: BufferLimits,
    /// Sent once, through the normal write phase, before the first read.
    pub greeting: Option<Bytes>,
    /// Close the connection when no bytes arrive for this long.
    pub idle_timeout: Option<Duration>,
}

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, cycle not started.
    Created,
    /// Waiting for inbound bytes.
    Reading,
    /// Writing an echo.
    Writing {
        /// Bytes in the outstanding write, terminator included.
        len: usize,
    },
    /// Stream released.
    Closed,
}

/// Why a connection ended.
#[derive(Debug)]
pub enum Disconnect {
    /// EOF or a reset from the peer.
    PeerClosed,
    /// The server was stopped.
    Shutdown,
    /// No bytes arrived within the idle timeout.
    IdleTimeout,
    ReadFailed(io::Error),
    WriteFailed(io::Error),
}

/// A single client connection.
pub struct Connection<S> {
    stream: S,
    peer: SocketAddr,
    read_buf: Box<[u8]>,
    write_buf: BytesMut,
    state: ConnState,
    settings: Arc<ConnectionSettings>,
    shutdown: watch::Receiver<bool>,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an accepted stream.
    pub fn new(
        stream: S,
        peer: SocketAddr,
        settings: Arc<ConnectionSettings>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let limits = settings.limits;
        Self {
            stream,
            peer,
            read_buf: vec![0u8; limits.read_capacity()].into_boxed_slice(),
            write_buf: BytesMut::with_capacity(limits.write_capacity()),
            state: ConnState::Created,
            settings,
            shutdown,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Start the cycle and drive it until the connection ends.
    ///
    /// The stream is dropped (closed) when this returns.
    pub async fn run(mut self) -> Disconnect {
        let disconnect = self.serve().await;
        self.state = ConnState::Closed;

        let peer = self.peer;
        match &disconnect {
            Disconnect::PeerClosed => debug!(%peer, "Connection closed by peer"),
            Disconnect::Shutdown => debug!(%peer, "Connection closed for shutdown"),
            Disconnect::IdleTimeout => info!(%peer, "Connection idle, closing"),
            Disconnect::ReadFailed(e) => warn!(%peer, error = %e, "Read failed"),
            Disconnect::WriteFailed(e) => error!(%peer, error = %e, "Write failed"),
        }

        disconnect
    }

    async fn serve(&mut self) -> Disconnect {
        let capacity = self.settings.limits.write_capacity();

        if let Some(greeting) = self.settings.greeting.clone() {
            match frame_message(&greeting, &mut self.write_buf, capacity) {
                Ok(len) => {
                    if let Err(disconnect) = self.write_phase(len).await {
                        return disconnect;
                    }
                }
                Err(e) => warn!(peer = %self.peer, error = %e, "Greeting not sent"),
            }
        }

        loop {
            let n = match self.read_phase().await {
                Ok(n) => n,
                Err(disconnect) => return disconnect,
            };

            let message = &self.read_buf[..n];
            trace!(
                peer = %self.peer,
                bytes = n,
                message = %String::from_utf8_lossy(message),
                "Received message"
            );

            match frame_message(message, &mut self.write_buf, capacity) {
                Ok(len) => {
                    if let Err(disconnect) = self.write_phase(len).await {
                        return disconnect;
                    }
                }
                Err(e) => {
                    // Dropped without notifying the peer; keep reading.
                    warn!(
                        peer = %self.peer,
                        size = e.size,
                        capacity = e.capacity,
                        "Message too large for write buffer, dropping"
                    );
                }
            }
        }
    }

    /// Issue a single read of up to the read buffer capacity.
    async fn read_phase(&mut self) -> Result<usize, Disconnect> {
        self.state = ConnState::Reading;

        let Self {
            stream,
            read_buf,
            settings,
            shutdown,
            ..
        } = self;
        let idle_timeout = settings.idle_timeout;

        let read = async {
            match idle_timeout {
                Some(limit) => tokio::time::timeout(limit, stream.read(&mut read_buf[..]))
                    .await
                    .ok(),
                None => Some(stream.read(&mut read_buf[..]).await),
            }
        };

        let result = tokio::select! {
            result = read => result,
            _ = stopped(shutdown) => return Err(Disconnect::Shutdown),
        };

        match result {
            None => Err(Disconnect::IdleTimeout),
            Some(Ok(0)) => Err(Disconnect::PeerClosed),
            Some(Ok(n)) => Ok(n),
            Some(Err(e)) if is_peer_closed(&e) => Err(Disconnect::PeerClosed),
            Some(Err(e)) => Err(Disconnect::ReadFailed(e)),
        }
    }

    /// Write the first `len` bytes of the write buffer.
    async fn write_phase(&mut self, len: usize) -> Result<(), Disconnect> {
        self.state = ConnState::Writing { len };

        let result = async {
            self.stream.write_all(&self.write_buf[..len]).await?;
            self.stream.flush().await
        }
        .await;

        result.map_err(Disconnect::WriteFailed)
    }
}

/// Resolves once the server is stopped or its stop signal is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

fn is_peer_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn settings() -> Arc<ConnectionSettings> {
        Arc::new(ConnectionSettings::default())
    }

    fn connection<S>(
        stream: S,
        settings: Arc<ConnectionSettings>,
    ) -> (Connection<S>, watch::Sender<bool>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (tx, rx) = watch::channel(false);
        (Connection::new(stream, peer(), settings, rx), tx)
    }

    #[tokio::test]
    async fn test_echo_hello() {
        let mock = Builder::new().read(b"hello").write(b"hello\n").build();
        let (conn, _tx) = connection(mock, settings());

        assert_eq!(conn.state(), ConnState::Created);
        assert!(matches!(conn.run().await, Disconnect::PeerClosed));
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let mock = Builder::new().read(b"hi").write(b"hi\n").build();
        let (mut conn, _tx) = connection(mock, settings());
        assert_eq!(conn.state(), ConnState::Created);

        let n = conn.read_phase().await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(conn.state(), ConnState::Reading);

        let len = frame_message(&conn.read_buf[..n], &mut conn.write_buf, 32).unwrap();
        conn.write_phase(len).await.unwrap();
        assert_eq!(conn.state(), ConnState::Writing { len: 3 });

        assert!(matches!(conn.read_phase().await, Err(Disconnect::PeerClosed)));
        assert_eq!(conn.state(), ConnState::Reading);
    }

    #[tokio::test]
    async fn test_oversized_message_dropped_and_connection_continues() {
        let mock = Builder::new()
            .read(&[b'a'; 32])
            .read(b"hi")
            .write(b"hi\n")
            .build();
        let (conn, _tx) = connection(mock, settings());

        assert!(matches!(conn.run().await, Disconnect::PeerClosed));
    }

    #[tokio::test]
    async fn test_largest_message_that_fits() {
        let message = [b'z'; 31];
        let mut expected = message.to_vec();
        expected.push(b'\n');

        let mock = Builder::new().read(&message).write(&expected).build();
        let (conn, _tx) = connection(mock, settings());

        assert!(matches!(conn.run().await, Disconnect::PeerClosed));
    }

    #[tokio::test]
    async fn test_messages_echoed_in_order() {
        let mock = Builder::new()
            .read(b"hi")
            .write(b"hi\n")
            .read(b"there")
            .write(b"there\n")
            .read(b"hi")
            .write(b"hi\n")
            .build();
        let (conn, _tx) = connection(mock, settings());

        assert!(matches!(conn.run().await, Disconnect::PeerClosed));
    }

    #[tokio::test]
    async fn test_greeting_sent_before_first_read() {
        let settings = Arc::new(ConnectionSettings {
            greeting: Some(Bytes::from_static(b"Connected to Server.")),
            ..ConnectionSettings::default()
        });
        let mock = Builder::new()
            .write(b"Connected to Server.\n")
            .read(b"x")
            .write(b"x\n")
            .build();
        let (conn, _tx) = connection(mock, settings);

        assert!(matches!(conn.run().await, Disconnect::PeerClosed));
    }

    #[tokio::test]
    async fn test_oversized_greeting_is_skipped() {
        let settings = Arc::new(ConnectionSettings {
            limits: BufferLimits::new(8, 8).unwrap(),
            greeting: Some(Bytes::from_static(b"much too long")),
            idle_timeout: None,
        });
        let mock = Builder::new().read(b"ok").write(b"ok\n").build();
        let (conn, _tx) = connection(mock, settings);

        assert!(matches!(conn.run().await, Disconnect::PeerClosed));
    }

    #[tokio::test]
    async fn test_read_error_closes_connection() {
        let mock = Builder::new()
            .read_error(io::Error::new(io::ErrorKind::Other, "boom"))
            .build();
        let (conn, _tx) = connection(mock, settings());

        match conn.run().await {
            Disconnect::ReadFailed(e) => assert_eq!(e.kind(), io::ErrorKind::Other),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reset_counts_as_peer_closed() {
        let mock = Builder::new()
            .read_error(io::Error::from(io::ErrorKind::ConnectionReset))
            .build();
        let (conn, _tx) = connection(mock, settings());

        assert!(matches!(conn.run().await, Disconnect::PeerClosed));
    }

    #[tokio::test]
    async fn test_write_error_closes_connection() {
        let mock = Builder::new()
            .read(b"hi")
            .write_error(io::Error::from(io::ErrorKind::BrokenPipe))
            .build();
        let (conn, _tx) = connection(mock, settings());

        match conn.run().await {
            Disconnect::WriteFailed(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_read() {
        let (_client, server) = duplex(64);
        let (conn, tx) = connection(server, settings());

        let task = tokio::spawn(conn.run());
        tx.send_replace(true);

        assert!(matches!(task.await.unwrap(), Disconnect::Shutdown));
    }

    #[tokio::test]
    async fn test_stop_before_start_is_observed() {
        let (_client, server) = duplex(64);
        let (conn, tx) = connection(server, settings());
        tx.send_replace(true);

        let disconnect = tokio::time::timeout(Duration::from_secs(5), conn.run())
            .await
            .unwrap();
        assert!(matches!(disconnect, Disconnect::Shutdown));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_client, server) = duplex(64);
        let settings = Arc::new(ConnectionSettings {
            idle_timeout: Some(Duration::from_millis(50)),
            ..ConnectionSettings::default()
        });
        let (conn, _tx) = connection(server, settings);

        assert!(matches!(conn.run().await, Disconnect::IdleTimeout));
    }

    #[tokio::test]
    async fn test_duplex_round_trip() {
        let (mut client, server) = duplex(64);
        let (conn, _tx) = connection(server, settings());
        let task = tokio::spawn(conn.run());

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello\n");

        drop(client);
        assert!(matches!(task.await.unwrap(), Disconnect::PeerClosed));
    }
}
