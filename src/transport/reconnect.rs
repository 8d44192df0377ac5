//! Outbound connection lifecycle
//!
//! A [`ConnectionManager`] keeps one link to a server alive: it connects,
//! attaches a remote node to the relay for as long as the socket lives, and
//! after any failure waits a fixed delay and tries again until the user
//! disconnects.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, warn};

use crate::relay::Relay;
use crate::transport::framed::tcp_socket;
use crate::transport::remote::{serve_socket, RemoteNodeConfig};
use crate::transport::socket::Socket;
use crate::transport::{websocket, ConnectionState, Result, TransportError, TransportEvent};

/// Delay before a new attempt after a failure or a lost connection
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Upper bound on one connection handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(7);

/// Interval between keep-alive frames
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectionConfig {
    /// Wait between attempts
    pub reconnect_delay: Duration,

    /// Connection timeout for each attempt
    pub connect_timeout: Duration,

    /// Keep-alive interval while connected
    pub keepalive_interval: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
        }
    }
}

/// Opens sockets to one endpoint
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Socket>;

    /// Endpoint description for logs and events
    fn endpoint(&self) -> &str;
}

/// `ws://` endpoints
pub struct WebSocketConnector {
    url: String,
    max_frame_size: usize,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>, max_frame_size: usize) -> Self {
        Self {
            url: url.into(),
            max_frame_size,
        }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Socket> {
        websocket::connect(&self.url, self.max_frame_size).await
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// `tcp://` endpoints with length-prefixed framing
pub struct TcpConnector {
    url: String,
    addr: String,
    max_frame_size: usize,
}

impl TcpConnector {
    pub fn new(url: impl Into<String>, addr: impl Into<String>, max_frame_size: usize) -> Self {
        Self {
            url: url.into(),
            addr: addr.into(),
            max_frame_size,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Socket> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| TransportError::Connection {
                message: format!("Failed to reach {}: {}", self.addr, e),
            })?;
        tcp_socket(stream, self.max_frame_size)
    }

    fn endpoint(&self) -> &str {
        &self.url
    }
}

/// Pick a connector from the URL scheme. Inbound frames above
/// `max_frame_size` fail the connection.
pub fn connector_for_url(url: &str, max_frame_size: usize) -> Result<Arc<dyn Connector>> {
    let invalid = |reason: &str| TransportError::InvalidEndpoint {
        endpoint: url.to_string(),
        reason: reason.to_string(),
    };

    if let Some(rest) = url.strip_prefix("ws://") {
        if rest.is_empty() {
            return Err(invalid("missing host"));
        }
        Ok(Arc::new(WebSocketConnector::new(url, max_frame_size)))
    } else if let Some(rest) = url.strip_prefix("tcp://") {
        let addr = rest.trim_end_matches('/');
        if addr.is_empty() || !addr.contains(':') {
            return Err(invalid("expected host:port"));
        }
        Ok(Arc::new(TcpConnector::new(url, addr, max_frame_size)))
    } else if url.starts_with("wss://") {
        Err(invalid("TLS endpoints are not supported"))
    } else {
        Err(invalid("unknown scheme"))
    }
}

/// Lifecycle of one outbound connection
pub struct ConnectionManager {
    relay: Arc<Relay>,
    connector: Arc<dyn Connector>,
    config: ReconnectionConfig,
    node_config: RemoteNodeConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<TransportEvent>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(
        relay: Arc<Relay>,
        connector: Arc<dyn Connector>,
        config: ReconnectionConfig,
        node_config: RemoteNodeConfig,
        events: broadcast::Sender<TransportEvent>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            relay,
            connector,
            config,
            node_config,
            state: Arc::new(state),
            events,
            task: Mutex::new(None),
        }
    }

    fn task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.connector.endpoint()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Connecting, connected or waiting to reconnect
    pub fn is_active(&self) -> bool {
        !matches!(
            self.state(),
            ConnectionState::Idle | ConnectionState::Disconnected
        )
    }

    /// Start connecting.
    ///
    /// Rejected while a connection is being made or is up. While waiting to
    /// reconnect, the wait is cut short.
    #[instrument(skip(self), fields(endpoint = %self.connector.endpoint()))]
    pub fn connect(&self) -> Result<()> {
        let mut task = self.task();
        if self.state().is_busy() {
            return Err(TransportError::AlreadyActive);
        }
        if let Some(previous) = task.take() {
            previous.abort();
        }

        set_state(&self.state, ConnectionState::Connecting);
        let lifecycle = Lifecycle {
            relay: Arc::clone(&self.relay),
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
            node_config: self.node_config.clone(),
            state: Arc::clone(&self.state),
            events: self.events.clone(),
        };
        *task = Some(tokio::spawn(lifecycle.run()));
        Ok(())
    }

    /// Stop the connection and any pending reconnect; never reconnects
    pub async fn disconnect(&self) {
        let handle = self.task().take();
        if let Some(handle) = handle {
            handle.abort();
            // Teardown of the attached node happens as the task unwinds
            let _ = handle.await;
        }

        set_state(&self.state, ConnectionState::Disconnected);
        info!("Disconnected from {}", self.connector.endpoint());
        let _ = self.events.send(TransportEvent::Disconnected {
            endpoint: self.connector.endpoint().to_string(),
        });
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let task = match self.task.get_mut() {
            Ok(task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = task {
            handle.abort();
        }
    }
}

fn set_state(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    state.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });
}

struct Lifecycle {
    relay: Arc<Relay>,
    connector: Arc<dyn Connector>,
    config: ReconnectionConfig,
    node_config: RemoteNodeConfig,
    state: Arc<watch::Sender<ConnectionState>>,
    events: broadcast::Sender<TransportEvent>,
}

impl Lifecycle {
    async fn run(self) {
        let endpoint = self.connector.endpoint().to_string();

        loop {
            set_state(&self.state, ConnectionState::Connecting);
            info!("Connecting to {}", endpoint);
            let _ = self.events.send(TransportEvent::Connecting {
                endpoint: endpoint.clone(),
            });

            match timeout(self.config.connect_timeout, self.connector.connect()).await {
                Ok(Ok(socket)) => {
                    let served = serve_socket(
                        &self.relay,
                        socket,
                        self.node_config.clone(),
                        self.config.keepalive_interval,
                        |_| {
                            set_state(&self.state, ConnectionState::Connected);
                            info!("Connected to {}", endpoint);
                            let _ = self.events.send(TransportEvent::Connected {
                                endpoint: endpoint.clone(),
                            });
                        },
                    )
                    .await;
                    match served {
                        Ok(()) => warn!("Connection to {} lost", endpoint),
                        Err(e) => warn!("Connection to {} failed: {}", endpoint, e),
                    }
                    let _ = self.events.send(TransportEvent::ConnectionLost {
                        endpoint: endpoint.clone(),
                    });
                }
                Ok(Err(e)) => warn!("Failed to connect to {}: {}", endpoint, e),
                Err(_) => warn!(
                    "Connecting to {} timed out after {:?}",
                    endpoint, self.config.connect_timeout
                ),
            }

            set_state(&self.state, ConnectionState::Reconnecting);
            debug!(
                "Reconnecting to {} in {:?}",
                endpoint, self.config.reconnect_delay
            );
            sleep(self.config.reconnect_delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::framed::framed_socket;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` attempts, then hands out duplex sockets
    struct FakeConnector {
        attempts: AtomicUsize,
        failures: usize,
        hang: bool,
        peers: Mutex<Vec<tokio::io::DuplexStream>>,
    }

    impl FakeConnector {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                attempts: AtomicUsize::new(0),
                failures,
                hang: false,
                peers: Mutex::new(Vec::new()),
            })
        }

        fn attempts(&self) -> usize {
            self.attempts.load(Ordering::SeqCst)
        }

        /// Simulate the server dropping every open connection
        fn drop_peers(&self) {
            self.peers.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl Connector for FakeConnector {
        async fn connect(&self) -> Result<Socket> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                std::future::pending::<()>().await;
            }
            if attempt < self.failures {
                return Err(TransportError::Connection {
                    message: "refused".to_string(),
                });
            }
            let (ours, theirs) = tokio::io::duplex(4096);
            self.peers.lock().unwrap().push(theirs);
            Ok(framed_socket(ours, 4096, "fake"))
        }

        fn endpoint(&self) -> &str {
            "fake://server"
        }
    }

    fn manager(connector: Arc<FakeConnector>) -> (ConnectionManager, Arc<Relay>) {
        let relay = Arc::new(Relay::new());
        let (events, _) = broadcast::channel(16);
        let manager = ConnectionManager::new(
            relay.clone(),
            connector,
            ReconnectionConfig::default(),
            RemoteNodeConfig::default(),
            events,
        );
        (manager, relay)
    }

    async fn wait_for(manager: &ConnectionManager, wanted: ConnectionState) {
        let mut rx = manager.subscribe_state();
        timeout(Duration::from_secs(60), rx.wait_for(|s| *s == wanted))
            .await
            .expect("state not reached")
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_attaches_node() {
        let connector = FakeConnector::new(0);
        let (manager, relay) = manager(connector.clone());

        manager.connect().unwrap();
        wait_for(&manager, ConnectionState::Connected).await;
        tokio::task::yield_now().await;

        assert_eq!(connector.attempts(), 1);
        assert_eq!(relay.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_while_active_rejected() {
        let connector = FakeConnector::new(0);
        let (manager, _relay) = manager(connector.clone());

        manager.connect().unwrap();
        assert_eq!(manager.state(), ConnectionState::Connecting);
        assert!(matches!(manager.connect(), Err(TransportError::AlreadyActive)));

        wait_for(&manager, ConnectionState::Connected).await;
        assert!(matches!(manager.connect(), Err(TransportError::AlreadyActive)));
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempts_retry_after_delay() {
        let connector = FakeConnector::new(2);
        let (manager, _relay) = manager(connector.clone());
        let start = tokio::time::Instant::now();

        manager.connect().unwrap();
        wait_for(&manager, ConnectionState::Connected).await;

        assert_eq!(connector.attempts(), 3);
        assert!(start.elapsed() >= DEFAULT_RECONNECT_DELAY * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_connection_detaches_and_reconnects() {
        let connector = FakeConnector::new(0);
        let (manager, relay) = manager(connector.clone());
        let mut events = manager.events.subscribe();

        manager.connect().unwrap();
        wait_for(&manager, ConnectionState::Connected).await;

        connector.drop_peers();
        wait_for(&manager, ConnectionState::Reconnecting).await;
        assert!(relay.is_empty());

        wait_for(&manager, ConnectionState::Connected).await;
        assert_eq!(connector.attempts(), 2);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let endpoint = "fake://server".to_string();
        assert_eq!(
            seen,
            vec![
                TransportEvent::Connecting { endpoint: endpoint.clone() },
                TransportEvent::Connected { endpoint: endpoint.clone() },
                TransportEvent::ConnectionLost { endpoint: endpoint.clone() },
                TransportEvent::Connecting { endpoint: endpoint.clone() },
                TransportEvent::Connected { endpoint },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_during_reconnect_wait_skips_delay() {
        let connector = FakeConnector::new(1);
        let (manager, _relay) = manager(connector.clone());

        manager.connect().unwrap();
        wait_for(&manager, ConnectionState::Reconnecting).await;
        let start = tokio::time::Instant::now();

        manager.connect().unwrap();
        wait_for(&manager, ConnectionState::Connected).await;
        assert!(start.elapsed() < DEFAULT_RECONNECT_DELAY);
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_counts_as_failure() {
        let connector = Arc::new(FakeConnector {
            attempts: AtomicUsize::new(0),
            failures: 0,
            hang: true,
            peers: Mutex::new(Vec::new()),
        });
        let (manager, _relay) = manager(connector.clone());

        manager.connect().unwrap();
        wait_for(&manager, ConnectionState::Reconnecting).await;
        assert_eq!(connector.attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_while_connecting_cancels_attempt() {
        let connector = Arc::new(FakeConnector {
            attempts: AtomicUsize::new(0),
            failures: 0,
            hang: true,
            peers: Mutex::new(Vec::new()),
        });
        let (manager, _relay) = manager(connector.clone());

        manager.connect().unwrap();
        while connector.attempts() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.state(), ConnectionState::Connecting);

        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_detaches_and_never_reconnects() {
        let connector = FakeConnector::new(0);
        let (manager, relay) = manager(connector.clone());
        let mut events = manager.events.subscribe();

        manager.connect().unwrap();
        wait_for(&manager, ConnectionState::Connected).await;
        manager.disconnect().await;

        assert_eq!(manager.state(), ConnectionState::Disconnected);
        assert!(relay.is_empty());
        assert!(!manager.is_active());

        tokio::time::sleep(DEFAULT_RECONNECT_DELAY * 3).await;
        assert_eq!(connector.attempts(), 1);
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        let endpoint = "fake://server".to_string();
        assert_eq!(
            seen,
            vec![
                TransportEvent::Connecting { endpoint: endpoint.clone() },
                TransportEvent::Connected { endpoint: endpoint.clone() },
                TransportEvent::Disconnected { endpoint },
            ]
        );

        // Reconnecting after a user disconnect is allowed
        manager.connect().unwrap();
        wait_for(&manager, ConnectionState::Connected).await;
    }

    #[tokio::test]
    async fn test_tcp_connector_applies_configured_frame_limit() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = framed_socket(stream, 1 << 20, "server");
            socket.sink.send_frame(vec![1; 2048]).await.unwrap();
            socket
        });

        let url = format!("tcp://{}", addr);
        let connector = connector_for_url(&url, 1024).unwrap();
        let mut socket = connector.connect().await.unwrap();
        let _server_socket = server.await.unwrap();

        assert!(matches!(
            socket.source.next_frame().await,
            Some(Err(TransportError::FrameTooLarge { size: 2048, max: 1024 }))
        ));
    }

    #[rstest::rstest]
    #[case("ws://localhost:8000", true)]
    #[case("tcp://127.0.0.1:9000", true)]
    #[case("tcp://no-port", false)]
    #[case("wss://secure:443", false)]
    #[case("http://localhost", false)]
    #[case("ws://", false)]
    fn test_connector_for_url(#[case] url: &str, #[case] valid: bool) {
        let result = connector_for_url(url, 1024 * 1024);
        assert_eq!(result.is_ok(), valid);
        if let Ok(connector) = result {
            assert_eq!(connector.endpoint(), url);
        }
    }
}
