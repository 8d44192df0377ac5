//! Length-prefixed framing over any byte stream
//!
//! Every frame is a 4-byte big-endian length followed by that many bytes. A
//! zero-length frame is a keep-alive. A length above the configured maximum
//! is a fatal stream error.

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::transport::socket::{Frame, FrameSink, FrameSource, Socket};
use crate::transport::{Result, TransportError};

/// Default upper bound on one frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Writes length-prefixed frames
pub struct FramedWriter<W> {
    inner: W,
    max_frame_size: usize,
}

impl<W: AsyncWrite + Unpin + Send> FramedWriter<W> {
    pub fn new(inner: W, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }

    async fn write_prefixed(&mut self, frame: &[u8]) -> Result<()> {
        if frame.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                size: frame.len(),
                max: self.max_frame_size,
            });
        }
        let len = u32::try_from(frame.len()).map_err(|_| TransportError::FrameTooLarge {
            size: frame.len(),
            max: u32::MAX as usize,
        })?;

        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> FrameSink for FramedWriter<W> {
    async fn send_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        if frame.is_empty() {
            // Would read back as a keep-alive
            return Err(TransportError::Encode {
                message: "empty data frame".to_string(),
            });
        }
        self.write_prefixed(&frame).await
    }

    async fn send_keepalive(&mut self) -> Result<()> {
        self.write_prefixed(&[]).await
    }

    async fn close(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Reads length-prefixed frames
pub struct FramedReader<R> {
    inner: R,
    max_frame_size: usize,
}

impl<R: AsyncRead + Unpin + Send> FramedReader<R> {
    pub fn new(inner: R, max_frame_size: usize) -> Self {
        Self {
            inner,
            max_frame_size,
        }
    }

    async fn read_frame(&mut self) -> Option<Result<Frame>> {
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return None,
            Err(e) => return Some(Err(e.into())),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 {
            return Some(Ok(Frame::KeepAlive));
        }
        if len > self.max_frame_size {
            return Some(Err(TransportError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            }));
        }

        let mut data = vec![0u8; len];
        if let Err(e) = self.inner.read_exact(&mut data).await {
            return Some(Err(e.into()));
        }
        Some(Ok(Frame::Data(data)))
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> FrameSource for FramedReader<R> {
    async fn next_frame(&mut self) -> Option<Result<Frame>> {
        self.read_frame().await
    }
}

/// Wrap any duplex byte stream as a framed socket
pub fn framed_socket<S>(stream: S, max_frame_size: usize, peer: impl Into<String>) -> Socket
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read, write) = tokio::io::split(stream);
    Socket::new(
        FramedWriter::new(write, max_frame_size),
        FramedReader::new(read, max_frame_size),
        peer,
    )
}

/// Framed socket over a TCP connection
pub fn tcp_socket(stream: TcpStream, max_frame_size: usize) -> Result<Socket> {
    let peer = stream.peer_addr()?.to_string();
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    Ok(Socket::new(
        FramedWriter::new(write, max_frame_size),
        FramedReader::new(read, max_frame_size),
        peer,
    ))
}
