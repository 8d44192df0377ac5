//! Echo suppression
//!
//! Remembers the fingerprint of the last message each node produced or was
//! given, and drops a delivery of that same message back to it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use super::{Announcement, Node, NodeHandler};
use crate::transport::{Fingerprint, Message};

type Last = Arc<Mutex<Option<Fingerprint>>>;

fn get(last: &Last) -> Option<Fingerprint> {
    match last.lock() {
        Ok(guard) => *guard,
        Err(poisoned) => *poisoned.into_inner(),
    }
}

fn set(last: &Last, fingerprint: Option<Fingerprint>) {
    match last.lock() {
        Ok(mut guard) => *guard = fingerprint,
        Err(poisoned) => *poisoned.into_inner() = fingerprint,
    }
}

/// A node that never receives the message it last produced or accepted
pub struct EchoSuppressed {
    inner: Arc<dyn Node>,
    last: Last,
}

impl EchoSuppressed {
    pub fn new(inner: Arc<dyn Node>) -> Self {
        Self {
            inner,
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Fingerprint of the last message seen in either direction
    pub fn last(&self) -> Option<Fingerprint> {
        get(&self.last)
    }
}

/// Records outbound fingerprints before passing events on
struct Recording {
    inner: Arc<dyn NodeHandler>,
    last: Last,
}

impl NodeHandler for Recording {
    fn on_message(&self, message: Message) {
        set(&self.last, Some(message.fingerprint()));
        self.inner.on_message(message);
    }

    fn on_incoming(&self, announcement: Announcement) {
        self.inner.on_incoming(announcement);
    }
}

#[async_trait]
impl Node for EchoSuppressed {
    async fn start(&self, handler: Arc<dyn NodeHandler>) -> crate::Result<()> {
        let recording = Recording {
            inner: handler,
            last: Arc::clone(&self.last),
        };
        self.inner.start(Arc::new(recording)).await
    }

    async fn accept(&self, message: Message) -> crate::Result<()> {
        let fingerprint = message.fingerprint();
        {
            let mut last = match self.last.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *last == Some(fingerprint) {
                debug!(
                    "{} blocked a redundant update {}",
                    self.inner.describe(),
                    fingerprint.short()
                );
                return Ok(());
            }
            *last = Some(fingerprint);
        }

        let result = self.inner.accept(message).await;
        if result.is_err() {
            // Let a retry of the same payload through
            let mut last = match self.last.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *last == Some(fingerprint) {
                *last = None;
            }
        }
        result
    }

    async fn prepare(&self, announcement: &Announcement) -> crate::Result<()> {
        if get(&self.last) == Some(announcement.fingerprint) {
            return Ok(());
        }
        self.inner.prepare(announcement).await
    }

    fn describe(&self) -> String {
        self.inner.describe()
    }
}
