//! Remote relay node
//!
//! Represents one connected peer. Messages accepted from the relay are
//! streamed to the peer chunk by chunk; chunks read from the peer are
//! rejoined and handed to the relay as complete messages.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::progress::{ProgressSignaler, TransferDirection, TransferProgress};
use crate::relay::{Announcement, Node, NodeHandler, Relay};
use crate::transport::chunk::{Chunk, Rejoiner, RejoinerConfig};
use crate::transport::socket::{Frame, FrameSink, FrameSource, Socket};
use crate::transport::reconnect::DEFAULT_KEEPALIVE_INTERVAL;
use crate::transport::{Message, TransportError};

/// Settings shared by every remote node of a client or server
#[derive(Debug, Clone)]
pub struct RemoteNodeConfig {
    /// Chunk size for messages rebuilt from this peer
    pub split_size: usize,
    pub rejoiner: RejoinerConfig,
    pub progress: ProgressSignaler,

    /// The connection counts as dead after this long without any inbound
    /// frame, keep-alives included
    pub idle_timeout: Duration,
}

impl Default for RemoteNodeConfig {
    fn default() -> Self {
        Self {
            split_size: crate::DEFAULT_SPLIT_SIZE,
            rejoiner: RejoinerConfig::default(),
            progress: ProgressSignaler::new(),
            idle_timeout: DEFAULT_KEEPALIVE_INTERVAL * 2,
        }
    }
}

/// Relay node backed by one framed socket
pub struct RemoteNode {
    id: Uuid,
    peer: String,
    // Held for a whole message so two messages never interleave
    sink: tokio::sync::Mutex<Box<dyn FrameSink>>,
    source: Mutex<Option<Box<dyn FrameSource>>>,
    closed: Arc<watch::Sender<bool>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    config: RemoteNodeConfig,
}

impl RemoteNode {
    pub fn new(socket: Socket, config: RemoteNodeConfig) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            peer: socket.peer,
            sink: tokio::sync::Mutex::new(socket.sink),
            source: Mutex::new(Some(socket.source)),
            closed: Arc::new(closed),
            reader: Mutex::new(None),
            config,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn mark_closed(&self) {
        self.closed.send_replace(true);
    }

    /// Resolves once the connection is gone
    pub async fn closed(&self) {
        wait_closed(self.closed.subscribe()).await
    }

    /// Send keep-alives every `period` until the connection is gone
    pub async fn keepalive_until_closed(&self, period: Duration) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        let closed = wait_closed(self.closed.subscribe());
        tokio::pin!(closed);

        loop {
            tokio::select! {
                _ = &mut closed => return,
                _ = ticker.tick() => {
                    let result = self.sink.lock().await.send_keepalive().await;
                    if let Err(e) = result {
                        warn!("Keep-alive to {} failed: {}", self.peer, e);
                        self.mark_closed();
                        return;
                    }
                    debug!("Keep-alive sent to {}", self.peer);
                }
            }
        }
    }

    /// Close the sending side of the socket
    pub async fn close(&self) {
        self.mark_closed();
        if let Err(e) = self.sink.lock().await.close().await {
            debug!("Closing socket to {}: {}", self.peer, e);
        }
    }
}

async fn wait_closed(mut closed: watch::Receiver<bool>) {
    loop {
        let is_closed = *closed.borrow_and_update();
        if is_closed || closed.changed().await.is_err() {
            return;
        }
    }
}

impl Drop for RemoteNode {
    fn drop(&mut self) {
        let reader = match self.reader.get_mut() {
            Ok(reader) => reader.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = reader {
            handle.abort();
        }
    }
}

#[async_trait]
impl Node for RemoteNode {
    async fn start(&self, handler: Arc<dyn NodeHandler>) -> crate::Result<()> {
        let source = match self.source.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        let source = source.ok_or(TransportError::AlreadyActive)?;

        let reader = tokio::spawn(read_loop(
            source,
            handler,
            self.config.clone(),
            Arc::clone(&self.closed),
            self.peer.clone(),
        ));

        match self.reader.lock() {
            Ok(mut guard) => *guard = Some(reader),
            Err(poisoned) => *poisoned.into_inner() = Some(reader),
        }
        Ok(())
    }

    async fn accept(&self, message: Message) -> crate::Result<()> {
        let mut sink = self.sink.lock().await;
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed.into());
        }

        let fingerprint = message.fingerprint();
        let total = message.num_chunks();
        let progress = &self.config.progress;
        debug!("Sending {:?} to {}", message, self.peer);
        progress.signal(
            TransferDirection::Outgoing,
            fingerprint,
            TransferProgress::started(total),
        );

        for chunk in message.chunks() {
            let index = chunk.index;
            let frame = chunk.encode()?;
            if let Err(e) = sink.send_frame(frame).await {
                warn!(
                    "Failed to send chunk {}/{} of {} to {}: {}",
                    index + 1,
                    total,
                    fingerprint.short(),
                    self.peer,
                    e
                );
                self.mark_closed();
                return Err(e.into());
            }
            progress.signal(
                TransferDirection::Outgoing,
                fingerprint,
                TransferProgress {
                    total,
                    completed: index + 1,
                },
            );
        }

        Ok(())
    }

    fn describe(&self) -> String {
        format!("remote {} ({})", self.peer, self.id)
    }
}

async fn read_loop(
    mut source: Box<dyn FrameSource>,
    handler: Arc<dyn NodeHandler>,
    config: RemoteNodeConfig,
    closed: Arc<watch::Sender<bool>>,
    peer: String,
) {
    let mut rejoiner = Rejoiner::new(config.rejoiner.clone());

    loop {
        let frame = match timeout(config.idle_timeout, source.next_frame()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(_) => {
                warn!(
                    "Nothing heard from {} for {:?}, dropping connection",
                    peer, config.idle_timeout
                );
                break;
            }
        };
        match frame {
            Ok(Frame::KeepAlive) => {}
            Ok(Frame::Data(bytes)) => {
                handle_frame(&mut rejoiner, &bytes, handler.as_ref(), &config, &peer)
            }
            Err(e) => {
                warn!("Read from {} failed: {}", peer, e);
                break;
            }
        }
    }

    debug!(
        "Connection to {} ended with {} partial message(s)",
        peer,
        rejoiner.in_flight()
    );
    closed.send_replace(true);
}

fn handle_frame(
    rejoiner: &mut Rejoiner,
    bytes: &[u8],
    handler: &dyn NodeHandler,
    config: &RemoteNodeConfig,
    peer: &str,
) {
    rejoiner.evict_stale();

    let chunk = match Chunk::decode(bytes) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("Dropping malformed frame from {}: {}", peer, e);
            return;
        }
    };

    let reassembly = match rejoiner.process_incoming(chunk) {
        Ok(reassembly) => reassembly,
        Err(e) => {
            warn!("Dropping chunk from {}: {}", peer, e);
            return;
        }
    };

    let fingerprint = reassembly.fingerprint;
    let total = reassembly.total;
    if reassembly.newly_started {
        handler.on_incoming(Announcement { fingerprint, total });
        config.progress.signal(
            TransferDirection::Incoming,
            fingerprint,
            TransferProgress::started(total),
        );
    }
    config.progress.signal(
        TransferDirection::Incoming,
        fingerprint,
        TransferProgress {
            total,
            completed: reassembly.received,
        },
    );

    let Some(payload) = reassembly.payload else {
        return;
    };

    match Message::from_serialized(payload, config.split_size) {
        Ok(message) => {
            if message.fingerprint() != fingerprint {
                warn!(
                    "Rejoined message from {} does not match fingerprint {}",
                    peer,
                    fingerprint.short()
                );
                return;
            }
            debug!("Received {:?} from {}", message, peer);
            handler.on_message(message);
        }
        Err(e) => warn!("Dropping undecodable message from {}: {}", peer, e),
    }
}

/// Attach a remote node for `socket` to `relay` and keep it there until the
/// connection closes. Detaches on return and on cancellation.
///
/// `on_attached` runs once the node is in the relay and never runs when the
/// attach fails.
#[instrument(skip_all, fields(peer = %socket.peer))]
pub async fn serve_socket(
    relay: &Arc<Relay>,
    socket: Socket,
    config: RemoteNodeConfig,
    keepalive_interval: Duration,
    on_attached: impl FnOnce(&str) + Send,
) -> crate::Result<()> {
    let node = Arc::new(RemoteNode::new(socket, config));
    let guard = relay.attach(node.clone()).await?;
    info!("Peer {} attached", node.peer());
    on_attached(node.peer());

    node.keepalive_until_closed(keepalive_interval).await;

    drop(guard);
    node.close().await;
    info!("Peer {} detached", node.peer());
    Ok(())
}
