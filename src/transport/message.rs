//! Relayed clipboard message

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::clipboard::Payload;
use crate::transport::chunk::{chunk_count, wire_config, Chunks, Fingerprint};
use crate::transport::{Result, TransportError};

/// A clipboard payload ready to be relayed.
///
/// The payload is serialized once on construction; the fingerprint and every
/// chunk are derived from those bytes. Clones share the same buffer.
#[derive(Clone)]
pub struct Message {
    inner: Arc<Inner>,
}

struct Inner {
    payload: Payload,
    serialized: Bytes,
    fingerprint: Fingerprint,
    split_size: usize,
}

impl Message {
    /// Build a message that will be streamed in chunks of `split_size` bytes
    pub fn new(payload: Payload, split_size: usize) -> Result<Self> {
        let serialized = bincode::encode_to_vec(&payload, bincode::config::standard())
            .map_err(|e| TransportError::Encode {
                message: e.to_string(),
            })?;
        Self::build(payload, serialized, split_size)
    }

    /// Rebuild a message from rejoined bytes
    pub fn from_serialized(serialized: Vec<u8>, split_size: usize) -> Result<Self> {
        let (payload, read): (Payload, usize) =
            bincode::decode_from_slice(&serialized, wire_config()).map_err(|e| {
                TransportError::Decode {
                    message: e.to_string(),
                }
            })?;

        if read != serialized.len() {
            return Err(TransportError::Decode {
                message: format!("{} trailing bytes after payload", serialized.len() - read),
            });
        }

        Self::build(payload, serialized, split_size)
    }

    fn build(payload: Payload, serialized: Vec<u8>, split_size: usize) -> Result<Self> {
        if split_size == 0 {
            return Err(TransportError::Configuration {
                message: "split size must be at least 1 byte".to_string(),
            });
        }

        let fingerprint = Fingerprint::of(&serialized);
        Ok(Self {
            inner: Arc::new(Inner {
                payload,
                serialized: Bytes::from(serialized),
                fingerprint,
                split_size,
            }),
        })
    }

    pub fn payload(&self) -> &Payload {
        &self.inner.payload
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.inner.fingerprint
    }

    pub fn split_size(&self) -> usize {
        self.inner.split_size
    }

    /// Size of the serialized form in bytes
    pub fn size(&self) -> usize {
        self.inner.serialized.len()
    }

    pub fn num_chunks(&self) -> usize {
        chunk_count(self.inner.serialized.len(), self.inner.split_size)
    }

    /// Fresh chunk sequence starting at index 0
    pub fn chunks(&self) -> Chunks {
        Chunks::new(
            self.inner.fingerprint,
            self.inner.serialized.clone(),
            self.inner.split_size,
        )
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.inner.fingerprint == other.inner.fingerprint
    }
}

impl Eq for Message {}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("fingerprint", &self.inner.fingerprint)
            .field("size", &self.size())
            .field("chunks", &self.num_chunks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::chunk::Rejoiner;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_identical_payloads_share_fingerprint() {
        let a = Message::new(Payload::text("same"), 4).unwrap();
        let b = Message::new(Payload::text("same"), 100).unwrap();
        let c = Message::new(Payload::text("different"), 4).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a, b);
    }

    #[test]
    fn test_chunks_restart_each_call() {
        let message = Message::new(Payload::text("a fairly long clipboard entry"), 5).unwrap();
        let first: Vec<_> = message.chunks().collect();
        let second: Vec<_> = message.chunks().collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), message.num_chunks());
        assert!(first.iter().all(|c| c.fingerprint == message.fingerprint()));
    }

    #[test]
    fn test_rejoined_chunks_rebuild_the_message() {
        let payload = Payload::text("hello").with_format("image/png", vec![9; 300]);
        let message = Message::new(payload.clone(), 64).unwrap();

        let mut rejoiner = Rejoiner::default();
        let rejoined = message
            .chunks()
            .filter_map(|c| rejoiner.process_incoming(c).unwrap().payload)
            .next()
            .unwrap();

        let rebuilt = Message::from_serialized(rejoined, 64).unwrap();
        assert_eq!(rebuilt.payload(), &payload);
        assert_eq!(rebuilt.fingerprint(), message.fingerprint());
    }

    #[test]
    fn test_zero_split_size_rejected() {
        assert!(matches!(
            Message::new(Payload::text("x"), 0),
            Err(TransportError::Configuration { .. })
        ));
    }

    #[test]
    fn test_garbage_is_not_a_message() {
        assert!(Message::from_serialized(vec![0xff; 8], 10).is_err());
    }

    #[test]
    fn test_oversized_format_length_is_rejected() {
        // one format named "a" whose data claims 2^45 bytes
        let mut serialized = vec![1, 1, b'a', 0xFD];
        serialized.extend_from_slice(&(1u64 << 45).to_le_bytes());

        assert!(matches!(
            Message::from_serialized(serialized, 10),
            Err(TransportError::Decode { .. })
        ));
    }
}
