//! System clipboard via arboard
//!
//! Carries text and images. Images leave the machine as PNG and are decoded
//! back to RGBA before they reach arboard. arboard calls block, so every
//! access runs on the blocking pool and changes are detected by polling.

use std::borrow::Cow;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arboard::ImageData;
use async_trait::async_trait;
use image::{ImageFormat, RgbaImage};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, warn};

use super::{
    AbortOnDrop, ClipboardError, ClipboardEvent, ClipboardProvider, ClipboardWatcher, Payload,
    IMAGE_PNG, MAX_CLIPBOARD_SIZE,
};

/// Default polling interval for change detection
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// What the system clipboard held at one poll
enum Contents {
    Text(String),
    Image(ImageData<'static>),
}

/// Cheap identity of [`Contents`] for change detection
#[derive(Debug, Clone, PartialEq, Eq)]
enum Snapshot {
    Text(String),
    Image {
        width: usize,
        height: usize,
        digest: md5::Digest,
    },
}

impl Contents {
    fn snapshot(&self) -> Snapshot {
        match self {
            Contents::Text(text) => Snapshot::Text(text.clone()),
            Contents::Image(image) => image_snapshot(image),
        }
    }

    fn into_payload(self) -> Result<Payload, ClipboardError> {
        match self {
            Contents::Text(text) => Ok(Payload::text(text)),
            Contents::Image(image) => {
                Ok(Payload::new().with_format(IMAGE_PNG, encode_png(&image)?))
            }
        }
    }
}

fn image_snapshot(image: &ImageData<'_>) -> Snapshot {
    Snapshot::Image {
        width: image.width,
        height: image.height,
        digest: md5::compute(&image.bytes[..]),
    }
}

/// Text first, then an image
fn read_contents(clipboard: &mut arboard::Clipboard) -> Result<Contents, arboard::Error> {
    match clipboard.get_text() {
        Ok(text) => return Ok(Contents::Text(text)),
        Err(arboard::Error::ContentNotAvailable) => {}
        Err(e) => return Err(e),
    }
    clipboard.get_image().map(Contents::Image)
}

fn encode_png(image: &ImageData<'_>) -> Result<Vec<u8>, ClipboardError> {
    let invalid = || {
        ClipboardError::Platform(format!(
            "clipboard image {}x{} does not match its {} bytes",
            image.width,
            image.height,
            image.bytes.len()
        ))
    };
    let width = u32::try_from(image.width).map_err(|_| invalid())?;
    let height = u32::try_from(image.height).map_err(|_| invalid())?;
    let rgba = RgbaImage::from_raw(width, height, image.bytes.to_vec()).ok_or_else(invalid)?;

    let mut png = Vec::new();
    rgba.write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| ClipboardError::Platform(format!("Failed to encode PNG: {}", e)))?;
    Ok(png)
}

fn decode_png(png: &[u8]) -> Result<ImageData<'static>, ClipboardError> {
    let rgba = image::load_from_memory_with_format(png, ImageFormat::Png)
        .map_err(|e| ClipboardError::Platform(format!("Failed to decode PNG: {}", e)))?
        .to_rgba8();

    Ok(ImageData {
        width: rgba.width() as usize,
        height: rgba.height() as usize,
        bytes: Cow::Owned(rgba.into_raw()),
    })
}

/// System clipboard provider
pub struct SystemClipboard {
    clipboard: Arc<Mutex<arboard::Clipboard>>,
    poll_interval: Duration,
    /// Last contents seen by the poller or written by us
    last: Arc<Mutex<Option<Snapshot>>>,
}

impl SystemClipboard {
    /// Open the system clipboard
    pub fn new(poll_interval: Duration) -> Result<Self, ClipboardError> {
        let clipboard = arboard::Clipboard::new().map_err(|e| {
            ClipboardError::Platform(format!("Failed to open system clipboard: {}", e))
        })?;

        Ok(Self {
            clipboard: Arc::new(Mutex::new(clipboard)),
            poll_interval,
            last: Arc::new(Mutex::new(None)),
        })
    }

    async fn with_clipboard<T, F>(&self, f: F) -> Result<T, ClipboardError>
    where
        T: Send + 'static,
        F: FnOnce(&mut arboard::Clipboard) -> Result<T, arboard::Error> + Send + 'static,
    {
        with_clipboard(Arc::clone(&self.clipboard), f).await
    }

    fn remember(&self, snapshot: Snapshot) {
        replace_last(&self.last, snapshot);
    }
}

/// Store `snapshot`, returning whether it differs from the previous one
fn replace_last(last: &Mutex<Option<Snapshot>>, snapshot: Snapshot) -> bool {
    let mut last = match last.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if last.as_ref() == Some(&snapshot) {
        return false;
    }
    *last = Some(snapshot);
    true
}

async fn with_clipboard<T, F>(
    clipboard: Arc<Mutex<arboard::Clipboard>>,
    f: F,
) -> Result<T, ClipboardError>
where
    T: Send + 'static,
    F: FnOnce(&mut arboard::Clipboard) -> Result<T, arboard::Error> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut guard = clipboard
            .lock()
            .map_err(|_| ClipboardError::Platform("clipboard lock poisoned".to_string()))?;
        f(&mut guard).map_err(|e| match e {
            arboard::Error::ContentNotAvailable => ClipboardError::NoContent,
            other => ClipboardError::Platform(other.to_string()),
        })
    })
    .await
    .map_err(|e| ClipboardError::Platform(format!("clipboard task failed: {}", e)))?
}

#[async_trait]
impl ClipboardProvider for SystemClipboard {
    async fn watch(&self) -> Result<ClipboardWatcher, ClipboardError> {
        let (tx, rx) = mpsc::channel(100);
        let clipboard = Arc::clone(&self.clipboard);
        let poll_interval = self.poll_interval;
        let last = Arc::clone(&self.last);

        // Seed with the current contents so they are not reported as a change
        match self.with_clipboard(read_contents).await {
            Ok(contents) => self.remember(contents.snapshot()),
            Err(ClipboardError::NoContent) => {}
            Err(e) => return Err(ClipboardError::WatchError(e.to_string())),
        }

        let handle = tokio::spawn(async move {
            let mut ticker = interval(poll_interval);

            loop {
                ticker.tick().await;

                let contents = match with_clipboard(Arc::clone(&clipboard), read_contents).await {
                    Ok(contents) => contents,
                    Err(ClipboardError::NoContent) => continue,
                    Err(e) => {
                        warn!("Failed to poll system clipboard: {}", e);
                        continue;
                    }
                };

                // Our own writes were remembered by set_content
                if !replace_last(&last, contents.snapshot()) {
                    continue;
                }

                let payload =
                    match tokio::task::spawn_blocking(move || contents.into_payload()).await {
                        Ok(Ok(payload)) => payload,
                        Ok(Err(e)) => {
                            warn!("Skipping clipboard change: {}", e);
                            continue;
                        }
                        Err(e) => {
                            warn!("Clipboard conversion task failed: {}", e);
                            continue;
                        }
                    };
                debug!("System clipboard changed ({} bytes)", payload.size());

                if tx.send(ClipboardEvent { payload }).await.is_err() {
                    break;
                }
            }
        });

        Ok(ClipboardWatcher::new(rx, AbortOnDrop(handle)))
    }

    async fn set_content(&self, payload: &Payload) -> Result<(), ClipboardError> {
        if payload.size() > MAX_CLIPBOARD_SIZE {
            return Err(ClipboardError::TooLarge {
                size: payload.size(),
                max: MAX_CLIPBOARD_SIZE,
            });
        }

        if let Some(text) = payload.as_text() {
            let text = text.to_string();
            self.remember(Snapshot::Text(text.clone()));
            return self.with_clipboard(move |c| c.set_text(text)).await;
        }

        let png = payload.get(IMAGE_PNG).ok_or(ClipboardError::NoContent)?.to_vec();
        let image = tokio::task::spawn_blocking(move || decode_png(&png))
            .await
            .map_err(|e| ClipboardError::Platform(format!("clipboard task failed: {}", e)))??;
        self.remember(image_snapshot(&image));
        self.with_clipboard(move |c| c.set_image(image)).await
    }

    async fn clear(&self) -> Result<(), ClipboardError> {
        self.with_clipboard(|c| c.clear()).await
    }

    fn name(&self) -> &str {
        "system"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn checkerboard(width: usize, height: usize) -> ImageData<'static> {
        let bytes = (0..width * height)
            .flat_map(|i| {
                if i % 2 == 0 {
                    [255, 0, 0, 255]
                } else {
                    [0, 0, 255, 128]
                }
            })
            .collect::<Vec<u8>>();
        ImageData {
            width,
            height,
            bytes: Cow::Owned(bytes),
        }
    }

    #[test]
    fn test_image_survives_png_conversion() {
        let image = checkerboard(7, 3);
        let png = encode_png(&image).unwrap();
        assert_eq!(&png[1..4], b"PNG");

        let back = decode_png(&png).unwrap();
        assert_eq!((back.width, back.height), (7, 3));
        assert_eq!(back.bytes, image.bytes);
    }

    #[test]
    fn test_image_with_wrong_byte_count_is_rejected() {
        let image = ImageData {
            width: 4,
            height: 4,
            bytes: Cow::Owned(vec![0; 10]),
        };
        assert!(matches!(encode_png(&image), Err(ClipboardError::Platform(_))));
        assert!(matches!(decode_png(b"not a png"), Err(ClipboardError::Platform(_))));
    }

    #[test]
    fn test_image_becomes_png_payload() {
        let payload = Contents::Image(checkerboard(2, 2)).into_payload().unwrap();
        assert_eq!(payload.as_text(), None);
        let png = payload.get(IMAGE_PNG).unwrap();
        assert_eq!(decode_png(png).unwrap().bytes, checkerboard(2, 2).bytes);
    }

    #[test]
    fn test_remembered_write_is_not_a_change() {
        let last = Mutex::new(None);
        assert!(replace_last(&last, Contents::Image(checkerboard(3, 3)).snapshot()));
        assert!(!replace_last(&last, Contents::Image(checkerboard(3, 3)).snapshot()));
        assert!(replace_last(&last, Snapshot::Text("copied".to_string())));
        assert!(!replace_last(&last, Snapshot::Text("copied".to_string())));
    }

    #[test]
    fn test_snapshot_tracks_pixel_changes() {
        let first = Contents::Image(checkerboard(2, 2)).snapshot();
        let mut changed = checkerboard(2, 2);
        changed.bytes.to_mut()[0] = 0;

        assert_eq!(first, Contents::Image(checkerboard(2, 2)).snapshot());
        assert_ne!(first, Contents::Image(changed).snapshot());
        assert_ne!(
            Contents::Text("a".to_string()).snapshot(),
            Contents::Text("b".to_string()).snapshot()
        );
    }
}
