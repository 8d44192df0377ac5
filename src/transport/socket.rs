//! Framed socket abstraction
//!
//! A remote node talks to its peer through one [`Socket`]: a sink and a
//! source of whole frames. WebSocket and length-prefixed TCP both provide it.

use async_trait::async_trait;

use crate::transport::Result;

/// One unit read from a socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One encoded chunk
    Data(Vec<u8>),
    /// Liveness signal, carries nothing
    KeepAlive,
}

/// Sending half of a framed socket
#[async_trait]
pub trait FrameSink: Send {
    /// Send one data frame
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()>;

    /// Send a keep-alive frame
    async fn send_keepalive(&mut self) -> Result<()>;

    /// Close the sending direction
    async fn close(&mut self) -> Result<()>;
}

/// Receiving half of a framed socket
#[async_trait]
pub trait FrameSource: Send {
    /// Next frame, or `None` once the peer has closed the stream
    async fn next_frame(&mut self) -> Option<Result<Frame>>;
}

/// Both halves of one connection
pub struct Socket {
    pub sink: Box<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
    /// Peer description for logs
    pub peer: String,
}

impl Socket {
    pub fn new(
        sink: impl FrameSink + 'static,
        source: impl FrameSource + 'static,
        peer: impl Into<String>,
    ) -> Self {
        Self {
            sink: Box::new(sink),
            source: Box::new(source),
            peer: peer.into(),
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("peer", &self.peer).finish()
    }
}
