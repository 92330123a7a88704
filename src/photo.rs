use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

/// The external asset host that owns room photos.
///
/// Uploads happen before a room reaches the engine; the engine only hands
/// references back once a room no longer points at them.
#[async_trait]
pub trait PhotoHost: Send + Sync {
    async fn release(&self, photo_url: &str) -> Result<(), String>;
}

/// Host used when no asset service is wired in: logs and forgets.
#[derive(Debug, Default)]
pub struct DetachedPhotoHost;

#[async_trait]
impl PhotoHost for DetachedPhotoHost {
    async fn release(&self, photo_url: &str) -> Result<(), String> {
        info!("photo released: {photo_url}");
        Ok(())
    }
}

/// Records released references. For tests and local runs.
#[derive(Debug, Default)]
pub struct RecordingPhotoHost {
    released: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingPhotoHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// A host whose every release fails.
    pub fn failing() -> Self {
        Self {
            released: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn released(&self) -> Vec<String> {
        self.released
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PhotoHost for RecordingPhotoHost {
    async fn release(&self, photo_url: &str) -> Result<(), String> {
        if self.fail {
            return Err(format!("asset host refused to release {photo_url}"));
        }
        if let Ok(mut released) = self.released.lock() {
            released.push(photo_url.to_string());
        }
        Ok(())
    }
}
