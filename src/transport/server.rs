//! Listening side
//!
//! Accepts inbound connections and keeps a remote node attached to the relay
//! for the lifetime of each one.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::relay::Relay;
use crate::transport::framed::{tcp_socket, DEFAULT_MAX_FRAME_SIZE};
use crate::transport::reconnect::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_KEEPALIVE_INTERVAL};
use crate::transport::remote::{serve_socket, RemoteNodeConfig};
use crate::transport::socket::Socket;
use crate::transport::{websocket, Result, TransportError, TransportEvent};

/// Wire protocol spoken by a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerProtocol {
    #[default]
    WebSocket,
    Tcp,
}

impl fmt::Display for ServerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WebSocket => write!(f, "websocket"),
            Self::Tcp => write!(f, "tcp"),
        }
    }
}

impl FromStr for ServerProtocol {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "tcp" => Ok(Self::Tcp),
            other => Err(format!("unknown protocol '{}', expected websocket or tcp", other)),
        }
    }
}

impl ServerProtocol {
    /// URL scheme clients use for this protocol
    pub fn scheme(&self) -> &'static str {
        match self {
            Self::WebSocket => "ws",
            Self::Tcp => "tcp",
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub protocol: ServerProtocol,

    /// Upper bound on one WebSocket upgrade
    pub connect_timeout: Duration,

    pub keepalive_interval: Duration,
    pub max_frame_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            protocol: ServerProtocol::WebSocket,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

struct Running {
    stop: oneshot::Sender<()>,
    accept_loop: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Accepts peers and attaches each one to the relay while connected
pub struct Server {
    relay: Arc<Relay>,
    config: ServerConfig,
    node_config: RemoteNodeConfig,
    events: broadcast::Sender<TransportEvent>,
    running: Mutex<Option<Running>>,
}

impl Server {
    pub fn new(
        relay: Arc<Relay>,
        config: ServerConfig,
        node_config: RemoteNodeConfig,
        events: broadcast::Sender<TransportEvent>,
    ) -> Self {
        Self {
            relay,
            config,
            node_config,
            events,
            running: Mutex::new(None),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.running().is_some()
    }

    /// Bound address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running().as_ref().map(|r| r.local_addr)
    }

    /// Bind and start accepting; returns the bound address
    #[instrument(skip(self), fields(addr = %self.config.listen_addr, protocol = %self.config.protocol))]
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.is_active() {
            return Err(TransportError::AlreadyActive);
        }

        let listener = TcpListener::bind(self.config.listen_addr)
            .await
            .map_err(|e| TransportError::Connection {
                message: format!("Failed to listen on {}: {}", self.config.listen_addr, e),
            })?;
        let local_addr = listener.local_addr()?;

        let mut running = self.running();
        if running.is_some() {
            // Lost a race with a concurrent start
            return Err(TransportError::AlreadyActive);
        }

        let (stop, stopped) = oneshot::channel();
        let accept_loop = tokio::spawn(accept_loop(
            listener,
            stopped,
            Arc::clone(&self.relay),
            self.config.clone(),
            self.node_config.clone(),
            self.events.clone(),
        ));
        *running = Some(Running {
            stop,
            accept_loop,
            local_addr,
        });
        drop(running);

        info!(
            "Listening for {} peers on {}",
            self.config.protocol, local_addr
        );
        let _ = self
            .events
            .send(TransportEvent::Listening { addr: local_addr });
        Ok(local_addr)
    }

    /// Stop accepting and drop every connected peer
    pub async fn stop(&self) {
        let running = self.running().take();
        let Some(running) = running else {
            return;
        };

        let _ = running.stop.send(());
        if let Err(e) = running.accept_loop.await {
            warn!("Accept loop ended abnormally: {}", e);
        }

        info!("Server on {} stopped", running.local_addr);
        let _ = self.events.send(TransportEvent::ServerStopped);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let running = match self.running.get_mut() {
            Ok(running) => running.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(running) = running {
            running.accept_loop.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    mut stopped: oneshot::Receiver<()>,
    relay: Arc<Relay>,
    config: ServerConfig,
    node_config: RemoteNodeConfig,
    events: broadcast::Sender<TransportEvent>,
) {
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut stopped => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    sessions.spawn(session(
                        stream,
                        Arc::clone(&relay),
                        config.clone(),
                        node_config.clone(),
                        events.clone(),
                    ));
                }
                Err(e) => warn!("Failed to accept connection: {}", e),
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    // Every session detaches its node as it is cancelled
    sessions.shutdown().await;
}

async fn handshake(stream: TcpStream, config: &ServerConfig) -> Result<Socket> {
    match config.protocol {
        ServerProtocol::Tcp => tcp_socket(stream, config.max_frame_size),
        ServerProtocol::WebSocket => timeout(
            config.connect_timeout,
            websocket::accept(stream, config.max_frame_size),
        )
        .await
        .map_err(|_| TransportError::Timeout)?,
    }
}

async fn session(
    stream: TcpStream,
    relay: Arc<Relay>,
    config: ServerConfig,
    node_config: RemoteNodeConfig,
    events: broadcast::Sender<TransportEvent>,
) {
    let socket = match handshake(stream, &config).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!("Handshake failed: {}", e);
            return;
        }
    };

    let peer = socket.peer.clone();
    let mut attached = false;
    let served = serve_socket(
        &relay,
        socket,
        node_config,
        config.keepalive_interval,
        |peer| {
            attached = true;
            let _ = events.send(TransportEvent::PeerAttached {
                peer: peer.to_string(),
            });
        },
    )
    .await;
    if let Err(e) = served {
        warn!("Session with {} failed: {}", peer, e);
    }
    if attached {
        let _ = events.send(TransportEvent::PeerDetached { peer });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::settle;
    use crate::transport::framed::framed_socket;
    use pretty_assertions::assert_eq;

    fn local_config(protocol: ServerProtocol) -> ServerConfig {
        ServerConfig {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            protocol,
            ..Default::default()
        }
    }

    fn server(protocol: ServerProtocol) -> (Server, Arc<Relay>, broadcast::Receiver<TransportEvent>) {
        let relay = Arc::new(Relay::new());
        let (events, rx) = broadcast::channel(16);
        let server = Server::new(
            relay.clone(),
            local_config(protocol),
            RemoteNodeConfig::default(),
            events,
        );
        (server, relay, rx)
    }

    #[rstest::rstest]
    #[case("websocket", ServerProtocol::WebSocket)]
    #[case("WS", ServerProtocol::WebSocket)]
    #[case("tcp", ServerProtocol::Tcp)]
    fn test_protocol_parsing(#[case] input: &str, #[case] expected: ServerProtocol) {
        assert_eq!(input.parse::<ServerProtocol>().unwrap(), expected);
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        assert!("quic".parse::<ServerProtocol>().is_err());
    }

    #[tokio::test]
    async fn test_start_twice_rejected_and_stop_is_idempotent() {
        let (server, _relay, mut events) = server(ServerProtocol::Tcp);

        let addr = server.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(server.local_addr(), Some(addr));
        assert!(matches!(server.start().await, Err(TransportError::AlreadyActive)));

        server.stop().await;
        server.stop().await;
        assert!(!server.is_active());

        assert_eq!(events.recv().await.unwrap(), TransportEvent::Listening { addr });
        assert_eq!(events.recv().await.unwrap(), TransportEvent::ServerStopped);
    }

    #[tokio::test]
    async fn test_tcp_peer_attached_for_connection_lifetime() {
        let (server, relay, _events) = server(ServerProtocol::Tcp);
        let addr = server.start().await.unwrap();

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = framed_socket(stream, DEFAULT_MAX_FRAME_SIZE, "client");
        settle().await;
        assert_eq!(relay.len(), 1);

        drop(client);
        settle().await;
        assert!(relay.is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_peer_attached_event_follows_attach() {
        let (server, relay, mut events) = server(ServerProtocol::Tcp);
        let addr = server.start().await.unwrap();
        assert!(matches!(events.recv().await.unwrap(), TransportEvent::Listening { .. }));

        let stream = TcpStream::connect(addr).await.unwrap();
        let client = framed_socket(stream, DEFAULT_MAX_FRAME_SIZE, "client");
        let peer = match events.recv().await.unwrap() {
            TransportEvent::PeerAttached { peer } => peer,
            other => panic!("unexpected event {:?}", other),
        };
        assert_eq!(relay.len(), 1);

        drop(client);
        assert_eq!(
            events.recv().await.unwrap(),
            TransportEvent::PeerDetached { peer }
        );
        assert!(relay.is_empty());
        server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_detaches_sessions() {
        let (server, relay, _events) = server(ServerProtocol::WebSocket);
        let addr = server.start().await.unwrap();

        let _client = websocket::connect(&format!("ws://{}", addr), DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        settle().await;
        assert_eq!(relay.len(), 1);

        server.stop().await;
        assert!(relay.is_empty());
    }
}
