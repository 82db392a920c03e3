//! Headless browser control, as narrow as the watch session controller needs.

use async_trait::async_trait;
use std::fmt;

use crate::error::MinerError;

/// Handle to one opened watch page.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct WatchHandle {
    pub id: String,
    pub channel: String,
}

impl fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "WatchHandle({} @ {})", self.id, self.channel)
    }
}

#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open_watch(&self, channel_id: &str) -> Result<WatchHandle, MinerError>;

    async fn close_watch(&self, handle: &WatchHandle) -> Result<(), MinerError>;

    /// True when the page's video is playing and advancing. An `Err` means
    /// the page or the browser itself is gone.
    async fn is_stream_playing(&self, handle: &WatchHandle) -> Result<bool, MinerError>;
}
