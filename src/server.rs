//! TCP listener for the ISO switch simulator.
//!
//! Accepts connections, registers each one with the session manager and
//! spawns its read and write loops.

use crate::config::Config;
use crate::iso::BodyCodec;
use crate::responder::{Responder, RoutingTable};
use crate::session::{ManagerHandle, Session, SessionManager, SessionSettings};
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for open sessions to finish writing.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    /// Listen address could not be resolved.
    InvalidAddress(String, io::Error),
    /// Listener could not be bound. Fatal at startup.
    Bind(SocketAddr, io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::InvalidAddress(addr, e) => {
                write!(f, "Invalid listen address '{addr}': {e}")
            }
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {addr}: {e}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::InvalidAddress(_, e) | ServerError::Bind(_, e) => Some(e),
        }
    }
}

/// Server instance
pub struct Server {
    config: Config,
    responder: Arc<Responder>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let table = Arc::new(RoutingTable::standard());
        let codec = BodyCodec::new(config.live_timestamps);
        let responder = Arc::new(Responder::new(table, codec, config.unrecognized));

        Server { config, responder }
    }

    /// Bind the configured address.
    pub fn bind(&self) -> Result<TcpListener, ServerError> {
        let addr = resolve(&self.config.listen)?;
        create_listener(addr, self.config.backlog).map_err(|e| ServerError::Bind(addr, e))
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run<F>(&self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await;
        Ok(())
    }

    /// Accept connections on `listener` until `shutdown` resolves, then
    /// close every session and wait for them to drain.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, dispatch = ?self.config.dispatch, "Server listening");
        }

        let (manager, handle) =
            SessionManager::new(self.config.max_sessions, self.config.dispatch);
        let manager_task = tokio::spawn(manager.run());

        // Every session task holds a clone; recv() returns None once all are gone
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "New connection");
                        self.start_session(stream, peer, &handle, &done_tx).await;
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        drop(listener);
        handle.shutdown().await;
        if let Err(e) = manager_task.await {
            error!(error = %e, "Session manager task failed");
        }

        drop(done_tx);
        if tokio::time::timeout(DRAIN_TIMEOUT, done_rx.recv())
            .await
            .is_err()
        {
            warn!("Timed out waiting for sessions to close");
        }
        info!("Server stopped");
    }

    async fn start_session(
        &self,
        stream: tokio::net::TcpStream,
        peer: SocketAddr,
        manager: &ManagerHandle,
        done: &mpsc::Sender<()>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let (mailbox_tx, mailbox_rx) = mpsc::channel(self.config.mailbox_capacity);
        let Some(id) = manager.register(peer, mailbox_tx).await else {
            warn!(peer = %peer, "Connection rejected");
            return;
        };

        let settings = SessionSettings {
            idle_timeout: self.config.idle_timeout,
            write_timeout: self.config.write_timeout,
        };
        let (reader, writer) = stream.into_split();
        Session {
            id,
            mailbox: mailbox_rx,
            manager: manager.clone(),
            responder: Arc::clone(&self.responder),
            settings,
            done: done.clone(),
        }
        .spawn(reader, writer);
    }
}

/// Resolve a `host:port` string, accepting names such as `localhost`.
fn resolve(listen: &str) -> Result<SocketAddr, ServerError> {
    listen
        .to_socket_addrs()
        .map_err(|e| ServerError::InvalidAddress(listen.to_string(), e))?
        .next()
        .ok_or_else(|| {
            ServerError::InvalidAddress(
                listen.to_string(),
                io::Error::new(io::ErrorKind::InvalidInput, "no addresses resolved"),
            )
        })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    TcpListener::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatchMode;
    use crate::framing;
    use crate::iso::payment::parse_response;
    use crate::responder::sign_on_ack;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    fn test_config(dispatch: DispatchMode) -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            dispatch,
            ..Config::default()
        }
    }

    async fn start(config: Config) -> (SocketAddr, oneshot::Sender<()>, JoinHandle<()>) {
        let server = Server::new(config);
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            server
                .serve(listener, async {
                    let _ = stop_rx.await;
                })
                .await;
        });
        (addr, stop_tx, task)
    }

    async fn read_exact(stream: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[test]
    fn test_resolve() {
        assert_eq!(
            resolve("127.0.0.1:8091").unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 8091))
        );
        assert!(matches!(
            resolve("not an address"),
            Err(ServerError::InvalidAddress(..))
        ));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_an_error() {
        let (addr, stop, task) = start(test_config(DispatchMode::Unicast)).await;

        let mut config = test_config(DispatchMode::Unicast);
        config.listen = addr.to_string();
        // SO_REUSEADDR does not allow two listeners on the same port
        assert!(matches!(Server::new(config).bind(), Err(ServerError::Bind(..))));

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_sign_on_scenario() {
        let (addr, stop, task) = start(test_config(DispatchMode::Unicast)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b" QISO0150000170800").await.unwrap();

        let ack = sign_on_ack();
        assert_eq!(read_exact(&mut client, ack.len()).await, ack.to_vec());

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_payment_scenario() {
        let (addr, stop, task) = start(test_config(DispatchMode::Unicast)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client
            .write_all(b"\x00QISO0150000170200 0000 81288888800 0002500000")
            .await
            .unwrap();

        let body = framing::read_frame(&mut client).await.unwrap().unwrap();
        let msg = parse_response(&body).unwrap();
        assert_eq!(msg.mti, "0210");
        assert_eq!(msg.get_str(39), Some("00"));

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_framed_payment_scenario() {
        let (addr, stop, task) = start(test_config(DispatchMode::Unicast)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // 265 and 288 byte bodies put 0x09 and 0x20 in the low header byte
        for len in [264, 265, 288] {
            let mut body = b"ISO0150000170200 7234 81288888812 ".to_vec();
            body.resize(len, b'0');
            client.write_all(&framing::frame(&body).unwrap()).await.unwrap();

            let reply = framing::read_frame(&mut client).await.unwrap().unwrap();
            let msg = parse_response(&reply).unwrap();
            assert_eq!(msg.get_str(39), Some("12"), "body length {len}");
        }

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unrecognized_gets_empty_frame() {
        let (addr, stop, task) = start(test_config(DispatchMode::Unicast)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        client.write_all(b"hello switch").await.unwrap();
        assert_eq!(read_exact(&mut client, 2).await, vec![0, 0]);

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unicast_replies_only_to_sender() {
        let (addr, stop, task) = start(test_config(DispatchMode::Unicast)).await;
        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();

        a.write_all(b" QISO0150000170800").await.unwrap();
        let ack = sign_on_ack();
        assert_eq!(read_exact(&mut a, ack.len()).await, ack.to_vec());

        b.write_all(b"unknown").await.unwrap();
        // b's first bytes are its own empty frame, not a's acknowledgement
        assert_eq!(read_exact(&mut b, 2).await, vec![0, 0]);

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_broadcast_replies_on_every_session() {
        let (addr, stop, task) = start(test_config(DispatchMode::Broadcast)).await;
        let mut a = TcpStream::connect(addr).await.unwrap();
        let mut b = TcpStream::connect(addr).await.unwrap();

        // b must be registered before a sends
        b.write_all(b"x").await.unwrap();
        assert_eq!(read_exact(&mut a, 2).await, vec![0, 0]);
        assert_eq!(read_exact(&mut b, 2).await, vec![0, 0]);

        a.write_all(b" QISO0150000170800").await.unwrap();
        let ack = sign_on_ack();
        assert_eq!(read_exact(&mut a, ack.len()).await, ack.to_vec());
        assert_eq!(read_exact(&mut b, ack.len()).await, ack.to_vec());

        stop.send(()).unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions() {
        let (addr, stop, task) = start(test_config(DispatchMode::Unicast)).await;
        let mut client = TcpStream::connect(addr).await.unwrap();

        // Round trip so the session is registered before shutdown
        client.write_all(b"ping").await.unwrap();
        assert_eq!(read_exact(&mut client, 2).await, vec![0, 0]);

        stop.send(()).unwrap();
        task.await.unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_client_close_removes_session() {
        let config = Config {
            max_sessions: 1,
            ..test_config(DispatchMode::Unicast)
        };
        let (addr, stop, task) = start(config).await;

        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"x").await.unwrap();
        assert_eq!(read_exact(&mut first, 2).await, vec![0, 0]);
        drop(first);

        // The single slot frees up once the first session is gone
        let mut attempts = 0;
        loop {
            let mut second = TcpStream::connect(addr).await.unwrap();
            let _ = second.write_all(b"x").await;
            let mut buf = [0u8; 2];
            if second.read_exact(&mut buf).await.is_ok() {
                assert_eq!(buf, [0, 0]);
                break;
            }
            attempts += 1;
            assert!(attempts < 50, "slot never freed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        stop.send(()).unwrap();
        task.await.unwrap();
    }
}
