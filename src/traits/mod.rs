//! Seams to the collaborators the miner core does not own: the platform
//! HTTP API, the headless browser, the credential store, the user's queue
//! and the thumbnail cache.

pub mod browser_driver;
pub mod drops_api;
pub mod queue_store;
pub mod session_store;
pub mod thumbnail_sink;

pub use browser_driver::{BrowserDriver, WatchHandle};
pub use drops_api::DropsApi;
pub use queue_store::QueueStore;
pub use session_store::SessionStore;
pub use thumbnail_sink::{NoopThumbnailSink, ThumbnailSink};
