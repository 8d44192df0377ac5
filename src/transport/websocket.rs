//! WebSocket framing
//!
//! One binary WebSocket message carries one frame. Pings are the keep-alive
//! and are answered by tungstenite itself.

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{accept_async_with_config, connect_async_with_config, WebSocketStream};
use tracing::{debug, info, instrument, warn};

use crate::transport::socket::{Frame, FrameSink, FrameSource, Socket};
use crate::transport::{Result, TransportError};

fn ws_error(e: tungstenite::Error) -> TransportError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            TransportError::ConnectionClosed
        }
        tungstenite::Error::Io(io) => TransportError::Io(io),
        other => TransportError::WebSocket {
            message: other.to_string(),
        },
    }
}

/// Sending half of a WebSocket
pub struct WebSocketSink<S> {
    sink: SplitSink<WebSocketStream<S>, WsMessage>,
}

#[async_trait]
impl<S> FrameSink for WebSocketSink<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        self.sink
            .send(WsMessage::Binary(frame.into()))
            .await
            .map_err(ws_error)
    }

    async fn send_keepalive(&mut self) -> Result<()> {
        self.sink
            .send(WsMessage::Ping(Default::default()))
            .await
            .map_err(ws_error)
    }

    async fn close(&mut self) -> Result<()> {
        self.sink.close().await.map_err(ws_error)
    }
}

/// Receiving half of a WebSocket
pub struct WebSocketSource<S> {
    stream: SplitStream<WebSocketStream<S>>,
    max_frame_size: usize,
}

#[async_trait]
impl<S> FrameSource for WebSocketSource<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None
                }
                Err(e) => return Some(Err(ws_error(e))),
            };

            match message {
                WsMessage::Binary(data) => {
                    if data.len() > self.max_frame_size {
                        return Some(Err(TransportError::FrameTooLarge {
                            size: data.len(),
                            max: self.max_frame_size,
                        }));
                    }
                    return Some(Ok(Frame::Data(data.to_vec())));
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => return Some(Ok(Frame::KeepAlive)),
                WsMessage::Close(_) => {
                    debug!("WebSocket closed by peer");
                    return None;
                }
                WsMessage::Text(text) => {
                    warn!("Ignoring unexpected text message of {} bytes", text.len());
                }
                WsMessage::Frame(_) => {
                    warn!("Ignoring unexpected raw frame");
                }
            }
        }
    }
}

/// Split an established WebSocket into a framed socket
pub fn websocket_socket<S>(
    ws_stream: WebSocketStream<S>,
    max_frame_size: usize,
    peer: impl Into<String>,
) -> Socket
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws_stream.split();
    Socket::new(
        WebSocketSink { sink },
        WebSocketSource {
            stream,
            max_frame_size,
        },
        peer,
    )
}

/// tungstenite refuses messages and frames above `max_frame_size` while reading
fn ws_config(max_frame_size: usize) -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(max_frame_size))
        .max_frame_size(Some(max_frame_size))
}

/// Open a client WebSocket to `url`
#[instrument]
pub async fn connect(url: &str, max_frame_size: usize) -> Result<Socket> {
    let config = ws_config(max_frame_size);
    let connected = connect_async_with_config(url, Some(config), false).await;
    let (ws_stream, _response) = connected.map_err(|e| match e {
        tungstenite::Error::Io(io) => TransportError::Connection {
            message: format!("Failed to reach {}: {}", url, io),
        },
        other => TransportError::WebSocket {
            message: format!("Failed to establish WebSocket connection to {}: {}", url, other),
        },
    })?;

    info!("WebSocket connected to {}", url);
    Ok(websocket_socket(ws_stream, max_frame_size, url))
}

/// Perform the server side of the WebSocket upgrade
pub async fn accept(stream: TcpStream, max_frame_size: usize) -> Result<Socket> {
    let peer = stream.peer_addr()?.to_string();
    let ws_stream = accept_async_with_config(stream, Some(ws_config(max_frame_size)))
        .await
        .map_err(|e| TransportError::WebSocket {
            message: format!("Failed to accept WebSocket connection from {}: {}", peer, e),
        })?;

    debug!("WebSocket upgrade completed for {}", peer);
    Ok(websocket_socket(ws_stream, max_frame_size, peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::framed::DEFAULT_MAX_FRAME_SIZE;
    use pretty_assertions::assert_eq;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_binary_frames_and_pings_over_localhost() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept(stream, DEFAULT_MAX_FRAME_SIZE).await.unwrap();
            let mut frames = Vec::new();
            while let Some(frame) = socket.source.next_frame().await {
                frames.push(frame.unwrap());
            }
            frames
        });

        let mut client = connect(&format!("ws://{}", addr), DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        client.sink.send_frame(vec![1, 2, 3]).await.unwrap();
        client.sink.send_keepalive().await.unwrap();
        client.sink.send_frame(vec![4]).await.unwrap();
        client.sink.close().await.unwrap();

        let frames = server.await.unwrap();
        assert_eq!(
            frames,
            vec![Frame::Data(vec![1, 2, 3]), Frame::KeepAlive, Frame::Data(vec![4])]
        );
    }

    #[tokio::test]
    async fn test_connect_refused_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(connect(&format!("ws://{}", addr), DEFAULT_MAX_FRAME_SIZE)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_frame_over_configured_limit_is_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = accept(stream, 1024).await.unwrap();
            let first = socket.source.next_frame().await;
            let second = socket.source.next_frame().await;
            (first, second)
        });

        let mut client = connect(&format!("ws://{}", addr), DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        client.sink.send_frame(vec![7; 1000]).await.unwrap();
        // The server may already have torn the socket down
        let _ = client.sink.send_frame(vec![7; 4096]).await;

        let (first, second) = server.await.unwrap();
        assert_eq!(first.unwrap().unwrap(), Frame::Data(vec![7; 1000]));
        assert!(!matches!(second, Some(Ok(Frame::Data(_)))));
    }
}
