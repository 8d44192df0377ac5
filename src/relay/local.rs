//! Local clipboard node

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{Announcement, Node, NodeHandler};
use crate::clipboard::ClipboardProvider;
use crate::transport::Message;

/// Relays changes of the local clipboard and applies messages to it
pub struct LocalNode {
    clipboard: Arc<dyn ClipboardProvider>,
    split_size: usize,
    max_size: usize,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl LocalNode {
    /// `split_size` is used for messages this node produces; payloads larger
    /// than `max_size` are not relayed.
    pub fn new(clipboard: Arc<dyn ClipboardProvider>, split_size: usize, max_size: usize) -> Self {
        Self {
            clipboard,
            split_size,
            max_size,
            watcher: Mutex::new(None),
        }
    }
}

impl Drop for LocalNode {
    fn drop(&mut self) {
        let watcher = match self.watcher.get_mut() {
            Ok(watcher) => watcher.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = watcher {
            handle.abort();
        }
    }
}

#[async_trait]
impl Node for LocalNode {
    async fn start(&self, handler: Arc<dyn NodeHandler>) -> crate::Result<()> {
        let mut watcher = self.clipboard.watch().await?;
        let split_size = self.split_size;
        let max_size = self.max_size;
        let name = self.clipboard.name().to_string();

        let handle = tokio::spawn(async move {
            while let Some(event) = watcher.recv().await {
                let payload = event.payload;
                if payload.is_empty() {
                    continue;
                }
                if payload.size() > max_size {
                    warn!(
                        "Not relaying {} clipboard content of {} bytes (limit {})",
                        name,
                        payload.size(),
                        max_size
                    );
                    continue;
                }

                match Message::new(payload, split_size) {
                    Ok(message) => {
                        debug!("Local clipboard changed: {:?}", message);
                        handler.on_message(message);
                    }
                    Err(e) => warn!("Failed to encode clipboard content: {}", e),
                }
            }
            debug!("Clipboard watcher for {} ended", name);
        });

        let previous = match self.watcher.lock() {
            Ok(mut guard) => guard.replace(handle),
            Err(poisoned) => poisoned.into_inner().replace(handle),
        };
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    async fn accept(&self, message: Message) -> crate::Result<()> {
        debug!("Applying {:?} to {} clipboard", message, self.clipboard.name());
        self.clipboard.set_content(message.payload()).await?;
        Ok(())
    }

    async fn prepare(&self, announcement: &Announcement) -> crate::Result<()> {
        // Stale content must not be pasted while a new one is on its way
        debug!(
            "Clearing {} clipboard for incoming {} ({} chunks)",
            self.clipboard.name(),
            announcement.fingerprint.short(),
            announcement.total
        );
        self.clipboard.clear().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("local {} clipboard", self.clipboard.name())
    }
}
