//! Chunk codec for large clipboard payloads
//!
//! A serialized payload is cut into fixed-size [`Chunk`]s that all carry the
//! payload's [`Fingerprint`], their index and the total count. The receiving
//! side feeds them into a [`Rejoiner`], which fills index-addressed slots and
//! hands back the original bytes once every slot is present.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use bincode::{Decode, Encode};
use bytes::Bytes;
use tokio::time::Instant;
use tracing::debug;

use crate::transport::{Result, TransportError};

/// Upper bound on the chunk count a peer may announce for one message
pub const DEFAULT_MAX_CHUNKS: usize = 65_536;

/// Partial reassemblies idle for longer than this are dropped
pub const DEFAULT_REASSEMBLY_TIMEOUT: Duration = Duration::from_secs(300);

/// Hard ceiling on what one frame or one serialized message may decode into
pub const MAX_DECODE_SIZE: usize = 64 * 1024 * 1024;

/// Decoding config for bytes received from peers. Length prefixes claiming
/// more than [`MAX_DECODE_SIZE`] fail instead of allocating.
pub(crate) fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_DECODE_SIZE>()
}

/// Content-derived identifier of a serialized payload.
///
/// 128-bit MD5 digest. Collisions are possible in theory; the fingerprint is
/// only used to address chunks and to suppress echoed updates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Encode, Decode)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    /// Compute the fingerprint of a byte slice
    pub fn of(data: &[u8]) -> Self {
        Self(md5::compute(data).0)
    }

    /// Raw digest bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// First 8 hex characters, for log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

/// One bounded fragment of a serialized message
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Chunk {
    /// Fingerprint of the whole serialized message
    pub fingerprint: Fingerprint,

    /// Zero-based position of this chunk
    pub index: usize,

    /// Number of chunks in the message
    pub total: usize,

    /// Chunk bytes
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn is_first(&self) -> bool {
        self.index == 0
    }

    pub fn is_last(&self) -> bool {
        self.index + 1 == self.total
    }

    /// Serialize into one wire frame
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::encode_to_vec(self, bincode::config::standard()).map_err(|e| {
            TransportError::Encode {
                message: e.to_string(),
            }
        })
    }

    /// Parse one wire frame
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (chunk, read): (Chunk, usize) =
            bincode::decode_from_slice(frame, wire_config()).map_err(|e| {
                TransportError::Decode {
                    message: e.to_string(),
                }
            })?;

        if read != frame.len() {
            return Err(TransportError::Decode {
                message: format!("{} trailing bytes after chunk", frame.len() - read),
            });
        }

        Ok(chunk)
    }
}

/// Number of chunks `split` produces for a payload of `len` bytes.
///
/// An empty payload still produces one (empty) chunk so that the receiver
/// has something to complete on.
pub fn chunk_count(len: usize, split_size: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(split_size)
    }
}

/// Split `data` into chunks of at most `split_size` bytes
pub fn split(data: Bytes, split_size: usize) -> Result<Chunks> {
    if split_size == 0 {
        return Err(TransportError::Configuration {
            message: "split size must be at least 1 byte".to_string(),
        });
    }

    Ok(Chunks::new(Fingerprint::of(&data), data, split_size))
}

/// Lazy, finite sequence of chunks over one payload.
///
/// Chunks are cut on demand, so a large payload can start streaming before
/// the rest of it has been sliced. Cloning restarts from the same position.
#[derive(Debug, Clone)]
pub struct Chunks {
    fingerprint: Fingerprint,
    data: Bytes,
    split_size: usize,
    total: usize,
    next: usize,
}

impl Chunks {
    pub(crate) fn new(fingerprint: Fingerprint, data: Bytes, split_size: usize) -> Self {
        let total = chunk_count(data.len(), split_size);
        Self {
            fingerprint,
            data,
            split_size,
            total,
            next: 0,
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.next >= self.total {
            return None;
        }

        let start = self.next * self.split_size;
        let end = (start + self.split_size).min(self.data.len());
        let chunk = Chunk {
            fingerprint: self.fingerprint,
            index: self.next,
            total: self.total,
            data: self.data.slice(start..end).to_vec(),
        };

        self.next += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total - self.next;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Chunks {}

/// Limits applied by a [`Rejoiner`]
#[derive(Debug, Clone)]
pub struct RejoinerConfig {
    /// Largest `total` accepted from a peer
    pub max_chunks: usize,

    /// Idle time after which a partial message is evicted
    pub reassembly_timeout: Duration,
}

impl Default for RejoinerConfig {
    fn default() -> Self {
        Self {
            max_chunks: DEFAULT_MAX_CHUNKS,
            reassembly_timeout: DEFAULT_REASSEMBLY_TIMEOUT,
        }
    }
}

/// Result of feeding one chunk to a [`Rejoiner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reassembly {
    pub fingerprint: Fingerprint,

    /// This chunk was the first one seen for its fingerprint
    pub newly_started: bool,

    /// Distinct chunks received so far (equals `total` on completion)
    pub received: usize,

    pub total: usize,

    /// The rejoined bytes, once every chunk has arrived
    pub payload: Option<Vec<u8>>,
}

impl Reassembly {
    pub fn is_complete(&self) -> bool {
        self.payload.is_some()
    }
}

#[derive(Debug)]
struct InProgress {
    slots: Vec<Option<Vec<u8>>>,
    received: usize,
    touched_at: Instant,
}

impl InProgress {
    fn new(total: usize) -> Self {
        Self {
            slots: vec![None; total],
            received: 0,
            touched_at: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.slots.len()
    }

    fn assemble(self) -> Vec<u8> {
        self.slots.into_iter().flatten().flatten().collect()
    }
}

/// Reassembly state for one receive stream.
///
/// Entries exist only while a message is incomplete; the entry is removed in
/// the same call that completes it. Must be driven by a single receive loop.
#[derive(Debug, Default)]
pub struct Rejoiner {
    in_flight: HashMap<Fingerprint, InProgress>,
    config: RejoinerConfig,
}

impl Rejoiner {
    pub fn new(config: RejoinerConfig) -> Self {
        Self {
            in_flight: HashMap::new(),
            config,
        }
    }

    /// Store one chunk, returning the full payload if it was the last missing one
    pub fn process_incoming(&mut self, chunk: Chunk) -> Result<Reassembly> {
        let Chunk {
            fingerprint,
            index,
            total,
            data,
        } = chunk;

        if total == 0 || total > self.config.max_chunks {
            return Err(TransportError::MalformedChunk {
                message: format!(
                    "chunk count {} outside 1..={}",
                    total, self.config.max_chunks
                ),
            });
        }
        if index >= total {
            return Err(TransportError::MalformedChunk {
                message: format!("chunk index {} out of range for {} chunks", index, total),
            });
        }

        let (entry, newly_started) = match self.in_flight.entry(fingerprint) {
            Entry::Occupied(occupied) => {
                if occupied.get().slots.len() != total {
                    return Err(TransportError::MalformedChunk {
                        message: format!(
                            "chunk count {} disagrees with {} already announced for {}",
                            total,
                            occupied.get().slots.len(),
                            fingerprint.short()
                        ),
                    });
                }
                (occupied.into_mut(), false)
            }
            Entry::Vacant(vacant) => (vacant.insert(InProgress::new(total)), true),
        };

        // Same index twice: last write wins, counted once
        if entry.slots[index].replace(data).is_none() {
            entry.received += 1;
        }
        entry.touched_at = Instant::now();

        let received = entry.received;
        let payload = if entry.is_complete() {
            self.in_flight.remove(&fingerprint).map(InProgress::assemble)
        } else {
            None
        };

        Ok(Reassembly {
            fingerprint,
            newly_started,
            received,
            total,
            payload,
        })
    }

    /// Drop partial messages that have not seen a chunk within the timeout
    pub fn evict_stale(&mut self) -> usize {
        let timeout = self.config.reassembly_timeout;
        let before = self.in_flight.len();

        self.in_flight.retain(|fingerprint, entry| {
            let keep = entry.touched_at.elapsed() < timeout;
            if !keep {
                debug!(
                    "Evicting stale reassembly {} ({}/{} chunks)",
                    fingerprint.short(),
                    entry.received,
                    entry.slots.len()
                );
            }
            keep
        });

        before - self.in_flight.len()
    }

    /// Number of incomplete messages being tracked
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_tracking(&self, fingerprint: &Fingerprint) -> bool {
        self.in_flight.contains_key(fingerprint)
    }
}
