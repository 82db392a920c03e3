use async_trait::async_trait;

/// Write-only sink for reward images. Never read back by the core.
#[async_trait]
pub trait ThumbnailSink: Send + Sync {
    async fn store(&self, reward_id: &str, image_url: &str);
}

/// Sink that drops everything, for runs without an image cache.
pub struct NoopThumbnailSink;

#[async_trait]
impl ThumbnailSink for NoopThumbnailSink {
    async fn store(&self, _reward_id: &str, _image_url: &str) {}
}
