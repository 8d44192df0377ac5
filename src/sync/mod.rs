//! Sync service
//!
//! Owns the relay with the local clipboard attached to it, plus the optional
//! server and client roles, and keeps them in line with the current
//! configuration.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{info, warn};

use crate::clipboard::ClipboardProvider;
use crate::config::Config;
use crate::progress::{ProgressEvent, ProgressSignaler};
use crate::relay::{LocalNode, NodeGuard, Relay};
use crate::transport::{
    connector_for_url, ConnectionManager, ConnectionState, Server, TransportEvent,
};

/// Capacity of the connection event channel
const EVENT_CHANNEL_CAPACITY: usize = 100;

pub struct SyncService {
    config: Config,
    relay: Arc<Relay>,
    clipboard: Arc<dyn ClipboardProvider>,
    local: Option<NodeGuard>,
    server: Option<Server>,
    client: Option<ConnectionManager>,
    events: broadcast::Sender<TransportEvent>,
    progress: ProgressSignaler,
}

impl SyncService {
    pub fn new(config: Config, clipboard: Arc<dyn ClipboardProvider>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            relay: Arc::new(Relay::new()),
            clipboard,
            local: None,
            server: None,
            client: None,
            events,
            progress: ProgressSignaler::new(),
        }
    }

    /// Attach the local clipboard and start the configured roles
    pub async fn start(&mut self) -> crate::Result<()> {
        info!("Starting sync service");
        self.attach_local().await?;
        let config = self.config.clone();
        self.reconcile(&config, false).await
    }

    /// Bring the running roles in line with `config`
    pub async fn apply_settings(&mut self, config: &Config) -> crate::Result<()> {
        config.validate()?;
        let previous = std::mem::replace(&mut self.config, config.clone());
        let transport_changed = config.transport != previous.transport;

        let restart_local = self.local.is_some()
            && (config.clipboard != previous.clipboard
                || config.transport.split_size != previous.transport.split_size);
        if restart_local {
            self.local = None;
            self.attach_local().await?;
        }
        self.reconcile(config, transport_changed).await
    }

    async fn attach_local(&mut self) -> crate::Result<()> {
        if self.local.is_some() {
            return Ok(());
        }
        let node = Arc::new(LocalNode::new(
            Arc::clone(&self.clipboard),
            self.config.transport.split_size,
            self.config.clipboard.max_size,
        ));
        self.local = Some(self.relay.attach(node).await?);
        Ok(())
    }

    /// Restart whatever no longer matches `config`; every role restarts when
    /// `transport_changed`
    async fn reconcile(&mut self, config: &Config, transport_changed: bool) -> crate::Result<()> {
        // Server
        let wanted_server = if config.server.enabled {
            Some(config.server_config()?)
        } else {
            None
        };
        if let Some(server) = &self.server {
            if transport_changed || wanted_server.as_ref() != Some(server.config()) {
                server.stop().await;
                self.server = None;
            }
        }
        if let (None, Some(server_config)) = (&self.server, wanted_server) {
            let server = Server::new(
                Arc::clone(&self.relay),
                server_config,
                config.transport.remote_node(self.progress.clone()),
                self.events.clone(),
            );
            server.start().await?;
            self.server = Some(server);
        }

        // Client
        let wanted_url = config.client.enabled.then(|| config.client.url.clone());
        if let Some(client) = &self.client {
            if transport_changed || wanted_url.as_deref() != Some(client.endpoint()) {
                client.disconnect().await;
                self.client = None;
            }
        }
        if let (None, Some(url)) = (&self.client, wanted_url) {
            let client = ConnectionManager::new(
                Arc::clone(&self.relay),
                connector_for_url(&url, config.transport.max_frame_size)?,
                config.transport.reconnection(),
                config.transport.remote_node(self.progress.clone()),
                self.events.clone(),
            );
            client.connect()?;
            self.client = Some(client);
        }

        if !config.server.enabled && !config.client.enabled {
            warn!("Both server and client are disabled; clipboard changes will stay on this device");
        }

        self.config = config.clone();
        Ok(())
    }

    /// Stop both roles and detach the local clipboard
    pub async fn shutdown(&mut self) {
        info!("Shutting down sync service");
        if let Some(client) = self.client.take() {
            client.disconnect().await;
        }
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
        self.local = None;
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Address the server is bound to, if running
    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().and_then(Server::local_addr)
    }

    pub fn client_state(&self) -> Option<ConnectionState> {
        self.client.as_ref().map(ConnectionManager::state)
    }

    pub fn subscribe_client_state(&self) -> Option<watch::Receiver<ConnectionState>> {
        self.client.as_ref().map(ConnectionManager::subscribe_state)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::MemoryClipboard;
    use crate::transport::server::ServerProtocol;
    use pretty_assertions::assert_eq;

    fn local_config() -> Config {
        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:0".to_string();
        config
    }

    fn service(config: Config) -> SyncService {
        SyncService::new(config, Arc::new(MemoryClipboard::new()))
    }

    #[tokio::test]
    async fn test_start_attaches_local_and_starts_server() {
        let mut service = service(local_config());
        service.start().await.unwrap();

        assert_eq!(service.relay().len(), 1);
        assert!(service.server_addr().is_some());
        assert_eq!(service.client_state(), None);

        service.shutdown().await;
        assert!(service.relay().is_empty());
        assert!(service.server_addr().is_none());
    }

    #[tokio::test]
    async fn test_disabling_server_stops_it() {
        let mut service = service(local_config());
        service.start().await.unwrap();
        let mut events = service.subscribe_events();

        let mut config = service.config().clone();
        config.server.enabled = false;
        service.apply_settings(&config).await.unwrap();

        assert!(service.server_addr().is_none());
        assert_eq!(events.recv().await.unwrap(), TransportEvent::ServerStopped);
        assert_eq!(service.relay().len(), 1);
    }

    #[tokio::test]
    async fn test_protocol_change_restarts_server() {
        let mut service = service(local_config());
        service.start().await.unwrap();
        let mut events = service.subscribe_events();

        let mut config = service.config().clone();
        config.server.protocol = ServerProtocol::Tcp;
        service.apply_settings(&config).await.unwrap();

        assert!(service.server_addr().is_some());
        assert_eq!(events.recv().await.unwrap(), TransportEvent::ServerStopped);
        assert!(matches!(
            events.recv().await.unwrap(),
            TransportEvent::Listening { .. }
        ));
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_unchanged_settings_leave_roles_running() {
        let mut service = service(local_config());
        service.start().await.unwrap();
        let addr = service.server_addr();

        let config = service.config().clone();
        service.apply_settings(&config).await.unwrap();
        assert_eq!(service.server_addr(), addr);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_enabling_client_starts_connecting() {
        let mut config = local_config();
        config.server.enabled = false;
        let mut service = service(config.clone());
        service.start().await.unwrap();
        assert_eq!(service.client_state(), None);

        config.client.enabled = true;
        config.client.url = "tcp://127.0.0.1:9".to_string();
        service.apply_settings(&config).await.unwrap();
        assert!(service.client_state().is_some());

        config.client.enabled = false;
        service.apply_settings(&config).await.unwrap();
        assert_eq!(service.client_state(), None);
    }

    #[tokio::test]
    async fn test_transport_change_restarts_both_roles() {
        let mut config = local_config();
        config.client.enabled = true;
        config.client.url = "tcp://127.0.0.1:9".to_string();
        let mut service = service(config.clone());
        service.start().await.unwrap();
        let mut events = service.subscribe_events();

        config.transport.split_size = 5000;
        service.apply_settings(&config).await.unwrap();

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(seen.contains(&TransportEvent::ServerStopped));
        assert!(seen
            .iter()
            .any(|e| matches!(e, TransportEvent::Listening { .. })));
        assert!(seen.contains(&TransportEvent::Disconnected {
            endpoint: "tcp://127.0.0.1:9".to_string()
        }));
        assert!(service.client_state().is_some());
        assert_eq!(service.config().transport.split_size, 5000);
        assert_eq!(service.relay().len(), 1);
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_settings_rejected_and_not_applied() {
        let mut service = service(local_config());
        service.start().await.unwrap();

        let mut config = service.config().clone();
        config.transport.split_size = 0;
        assert!(service.apply_settings(&config).await.is_err());
        assert_eq!(service.config().transport.split_size, 100_000);
        service.shutdown().await;
    }
}
