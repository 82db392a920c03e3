use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::services::cookie_jar_service::get_app_data_dir;
use crate::traits::ThumbnailSink;

const KNOWN_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "gif"];

/// Get the reward image cache directory
pub fn get_thumbnail_dir() -> Result<PathBuf> {
    let dir = get_app_data_dir()?.join("cache").join("rewards");
    if !dir.exists() {
        fs::create_dir_all(&dir).context("Failed to create thumbnail cache directory")?;
    }
    Ok(dir)
}

/// Cache file name for an image URL: sha256 of the URL plus its extension.
pub fn cache_file_name(image_url: &str) -> String {
    let digest = Sha256::digest(image_url.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();

    let extension = url::Url::parse(image_url)
        .ok()
        .and_then(|u| {
            Path::new(u.path())
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
        })
        .filter(|e| KNOWN_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or_else(|| "img".to_string());

    format!("{}.{}", hex, extension)
}

/// Downloads reward images once into a flat directory. Failures are logged
/// and otherwise ignored.
pub struct ThumbnailCacheService {
    dir: PathBuf,
    client: reqwest::Client,
}

impl ThumbnailCacheService {
    pub fn new(dir: PathBuf) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { dir, client }
    }

    pub fn new_default() -> Result<Self> {
        Ok(Self::new(get_thumbnail_dir()?))
    }

    pub fn path_for(&self, image_url: &str) -> PathBuf {
        self.dir.join(cache_file_name(image_url))
    }

    async fn download(&self, image_url: &str) -> Result<Option<PathBuf>> {
        let path = self.path_for(image_url);
        if path.exists() {
            return Ok(None);
        }

        let bytes = self
            .client
            .get(image_url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        fs::create_dir_all(&self.dir).context("Failed to create thumbnail cache directory")?;
        fs::write(&path, &bytes).context("Failed to write thumbnail")?;
        Ok(Some(path))
    }
}

#[async_trait]
impl ThumbnailSink for ThumbnailCacheService {
    async fn store(&self, reward_id: &str, image_url: &str) {
        if image_url.is_empty() {
            return;
        }
        match self.download(image_url).await {
            Ok(Some(path)) => debug!("[Thumbnails] Cached {} at {:?}", reward_id, path),
            Ok(None) => {}
            Err(e) => warn!("[Thumbnails] Failed to cache image for {}: {}", reward_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_cache_file_name() {
        let a = cache_file_name("https://files.kick.com/drops/reward.PNG?v=2");
        assert!(a.ends_with(".png"));
        assert_eq!(a.len(), 64 + 4);
        assert_ne!(a, cache_file_name("https://files.kick.com/drops/other.png"));
        assert!(cache_file_name("https://x/y").ends_with(".img"));
    }

    #[tokio::test]
    async fn test_downloads_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/reward.png"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = ThumbnailCacheService::new(dir.path().to_path_buf());
        let url = format!("{}/reward.png", server.uri());

        cache.store("r1", &url).await;
        cache.store("r1", &url).await;

        assert_eq!(fs::read(cache.path_for(&url)).unwrap(), vec![1u8, 2, 3]);
    }

    #[tokio::test]
    async fn test_failed_download_writes_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = ThumbnailCacheService::new(dir.path().to_path_buf());
        let url = format!("{}/missing.png", server.uri());
        cache.store("r1", &url).await;
        assert!(!cache.path_for(&url).exists());
    }
}
