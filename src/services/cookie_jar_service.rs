use anyhow::{Context, Result};
use async_trait::async_trait;
use cookie_store::{CookieStore, RawCookie};
use log::{debug, error};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use url::Url;

use crate::error::MinerError;
use crate::models::user::Credentials;
use crate::traits::SessionStore;

const COOKIES_FILE: &str = "cookies_kick.json";
const KICK_URL: &str = "https://kick.com";
const KICK_DOMAIN: &str = "kick.com";
const PERSIST_MAX_AGE_SECS: u64 = 60 * 60 * 24 * 365;

/// Get the app data directory (works consistently in dev and release)
pub fn get_app_data_dir() -> Result<PathBuf> {
    if let Some(config_dir) = dirs::config_dir() {
        return Ok(config_dir.join("KickDropsMiner"));
    }

    if let Some(data_dir) = dirs::data_dir() {
        let app_dir = data_dir.join("KickDropsMiner");
        debug!("[COOKIE_JAR] Fallback to data directory: {:?}", app_dir);
        return Ok(app_dir);
    }

    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            let app_dir = exe_dir.join("data");
            debug!("[COOKIE_JAR] Fallback to exe directory: {:?}", app_dir);
            return Ok(app_dir);
        }
    }

    Err(anyhow::anyhow!("Could not determine app data directory"))
}

/// Kick login cookies persisted as a cookie_store JSON jar.
///
/// The file is re-read on every `load_session`, so a login performed by
/// another process (or a manual cookie import) is picked up while the
/// miner waits for fresh credentials.
pub struct CookieJarService {
    store: Arc<Mutex<CookieStore>>,
    file_path: PathBuf,
}

impl CookieJarService {
    /// Jar in the default app data directory
    pub fn new_default() -> Result<Self> {
        let dir = get_app_data_dir()?;
        Ok(Self::with_path(dir.join(COOKIES_FILE)))
    }

    pub fn with_path(file_path: PathBuf) -> Self {
        let store = Self::read_store(&file_path);
        Self {
            store: Arc::new(Mutex::new(store)),
            file_path,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn read_store(path: &Path) -> CookieStore {
        if !path.exists() {
            debug!("[COOKIE_JAR] No cookie file at {:?}", path);
            return CookieStore::default();
        }
        match Self::load_from_file(path) {
            Ok(store) => {
                debug!("[COOKIE_JAR] ✅ Loaded {} cookies", store.iter_any().count());
                store
            }
            Err(e) => {
                error!("[COOKIE_JAR] ⚠️ Failed to load cookies: {:?}", e);
                CookieStore::default()
            }
        }
    }

    fn load_from_file(path: &Path) -> Result<CookieStore> {
        let file = File::open(path).with_context(|| format!("opening {:?}", path))?;
        let reader = BufReader::new(file);
        CookieStore::load_json(reader).map_err(|e| anyhow::anyhow!("Failed to parse cookie store: {:?}", e))
    }

    async fn save(&self) -> Result<()> {
        let store = self.store.lock().await;

        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(&self.file_path)?;
        let mut writer = BufWriter::new(file);
        store
            .save_json(&mut writer)
            .map_err(|e| anyhow::anyhow!("Failed to save cookies: {:?}", e))?;

        debug!(
            "[COOKIE_JAR] ✅ Saved {} cookies to {:?}",
            store.iter_any().count(),
            self.file_path
        );
        Ok(())
    }

    async fn reload(&self) {
        let fresh = Self::read_store(&self.file_path);
        *self.store.lock().await = fresh;
    }

    async fn credentials(&self) -> Credentials {
        let store = self.store.lock().await;
        let mut credentials = Credentials::default();
        for cookie in store.iter_unexpired() {
            let domain = cookie.domain().unwrap_or(KICK_DOMAIN).trim_start_matches('.');
            if domain == KICK_DOMAIN || domain.ends_with(".kick.com") {
                credentials
                    .cookies
                    .insert(cookie.name().to_string(), cookie.value().to_string());
            }
        }
        credentials
    }

    async fn insert(&self, credentials: &Credentials) -> Result<()> {
        let url = Url::parse(KICK_URL)?;
        let mut store = self.store.lock().await;
        for (name, value) in &credentials.cookies {
            // Needs an expiry, session cookies are not written by save_json
            let cookie = RawCookie::parse(format!(
                "{}={}; Domain={}; Path=/; Max-Age={}",
                name, value, KICK_DOMAIN, PERSIST_MAX_AGE_SECS
            ))
            .map_err(|e| anyhow::anyhow!("Invalid cookie {}: {:?}", name, e))?;
            store
                .insert_raw(&cookie, &url)
                .map_err(|e| anyhow::anyhow!("Failed to insert cookie {}: {:?}", name, e))?;
        }
        Ok(())
    }

    /// Remove every cookie and delete the file
    pub async fn clear(&self) -> Result<()> {
        *self.store.lock().await = CookieStore::default();
        if self.file_path.exists() {
            fs::remove_file(&self.file_path)?;
            debug!("[COOKIE_JAR] Cleared cookies and deleted {:?}", self.file_path);
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for CookieJarService {
    async fn load_session(&self) -> Result<Option<Credentials>, MinerError> {
        self.reload().await;
        let credentials = self.credentials().await;
        if credentials.is_empty() {
            debug!("[COOKIE_JAR] No {} cookie in jar", Credentials::SESSION_COOKIE);
            return Ok(None);
        }
        Ok(Some(credentials))
    }

    async fn persist_session(&self, credentials: &Credentials) -> Result<(), MinerError> {
        self.insert(credentials)
            .await
            .map_err(|e| MinerError::Config(e.to_string()))?;
        self.save().await.map_err(|e| MinerError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_jar_has_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let jar = CookieJarService::with_path(dir.path().join("jar.json"));
        assert_eq!(jar.load_session().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("jar.json");
        let jar = CookieJarService::with_path(path.clone());

        let mut creds = Credentials::from_session_token("42%7Csecret");
        creds.cookies.insert("XSRF-TOKEN".to_string(), "xsrf".to_string());
        jar.persist_session(&creds).await.unwrap();
        assert!(path.exists());

        let reopened = CookieJarService::with_path(path);
        let loaded = reopened.load_session().await.unwrap().unwrap();
        assert_eq!(loaded.session_token().as_deref(), Some("42|secret"));
        assert_eq!(loaded.cookies.get("XSRF-TOKEN").map(String::as_str), Some("xsrf"));
    }

    #[tokio::test]
    async fn test_load_picks_up_external_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jar.json");
        let jar = CookieJarService::with_path(path.clone());
        assert_eq!(jar.load_session().await.unwrap(), None);

        let writer = CookieJarService::with_path(path);
        writer
            .persist_session(&Credentials::from_session_token("fresh"))
            .await
            .unwrap();

        let loaded = jar.load_session().await.unwrap().unwrap();
        assert_eq!(loaded.session_token().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn test_corrupt_file_yields_empty_jar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jar.json");
        fs::write(&path, "not json at all").unwrap();
        let jar = CookieJarService::with_path(path);
        assert_eq!(jar.load_session().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jar.json");
        let jar = CookieJarService::with_path(path.clone());
        jar.persist_session(&Credentials::from_session_token("t")).await.unwrap();
        jar.clear().await.unwrap();
        assert!(!path.exists());
        assert_eq!(jar.load_session().await.unwrap(), None);
    }
}
