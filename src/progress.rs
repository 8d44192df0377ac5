//! Transfer progress for chunked messages
//!
//! Remote nodes report how many chunks of a message have been sent or
//! received. Observers subscribe to a [`ProgressSignaler`] and receive a
//! [`ProgressEvent`] per step.

use std::fmt;

use tokio::sync::broadcast;

use crate::transport::Fingerprint;

/// Capacity of the progress broadcast channel
const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// Which way a message is moving relative to this process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    Outgoing,
    Incoming,
}

impl fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outgoing => write!(f, "outgoing"),
            Self::Incoming => write!(f, "incoming"),
        }
    }
}

/// Chunks done out of chunks in the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub total: usize,
    pub completed: usize,
}

impl TransferProgress {
    pub fn started(total: usize) -> Self {
        Self {
            total,
            completed: 0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.completed >= self.total
    }

    /// Completion as a whole percentage
    pub fn percentage(&self) -> u8 {
        if self.total == 0 {
            return 100;
        }
        (self.completed.min(self.total) * 100 / self.total) as u8
    }

    /// Text progress bar `width` cells wide
    pub fn bar(&self, width: usize) -> String {
        let filled = width * usize::from(self.percentage()) / 100;
        "█".repeat(filled) + &"░".repeat(width - filled)
    }
}

impl fmt::Display for TransferProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}% ({}/{})",
            self.bar(20),
            self.percentage(),
            self.completed,
            self.total
        )
    }
}

/// One progress step of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub direction: TransferDirection,
    pub fingerprint: Fingerprint,
    pub progress: TransferProgress,
}

/// Fan-out of progress events to any number of observers
#[derive(Debug, Clone)]
pub struct ProgressSignaler {
    sender: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressSignaler {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSignaler {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }

    /// Publish one step; dropped silently when nobody listens
    pub fn signal(
        &self,
        direction: TransferDirection,
        fingerprint: Fingerprint,
        progress: TransferProgress,
    ) {
        let _ = self.sender.send(ProgressEvent {
            direction,
            fingerprint,
            progress,
        });
    }
}

/// Format bytes in human-readable format
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}
