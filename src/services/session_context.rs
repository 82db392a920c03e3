use log::{info, warn};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::MinerError;
use crate::models::user::Credentials;
use crate::traits::SessionStore;

/// The credentials currently in use, shared by the API client and the browser.
///
/// Once the platform rejects a credential set it is remembered as invalid and
/// `refresh` refuses to bring it back; only a different, non-empty set from the
/// store re-authenticates.
pub struct SessionContext {
    store: Arc<dyn SessionStore>,
    current: RwLock<Option<Credentials>>,
    rejected: RwLock<Option<Credentials>>,
}

impl SessionContext {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            current: RwLock::new(None),
            rejected: RwLock::new(None),
        }
    }

    /// Re-read the store. Returns true when usable credentials are loaded.
    pub async fn refresh(&self) -> Result<bool, MinerError> {
        let loaded = self.store.load_session().await?;
        let Some(credentials) = loaded.filter(|c| !c.is_empty()) else {
            *self.current.write().await = None;
            return Ok(false);
        };

        if self.rejected.read().await.as_ref() == Some(&credentials) {
            *self.current.write().await = None;
            return Ok(false);
        }

        let changed = self.current.read().await.as_ref() != Some(&credentials);
        if changed {
            info!("[SessionContext] 🔑 Loaded credentials ({:?})", credentials);
        }
        *self.rejected.write().await = None;
        *self.current.write().await = Some(credentials);
        Ok(true)
    }

    /// Mark the current credentials as rejected by the platform.
    pub async fn invalidate(&self) {
        let previous = self.current.write().await.take();
        if previous.is_some() {
            warn!("[SessionContext] Credentials rejected, waiting for a new login");
            *self.rejected.write().await = previous;
        }
    }

    pub async fn is_authenticated(&self) -> bool {
        self.current.read().await.is_some()
    }

    pub async fn credentials(&self) -> Option<Credentials> {
        self.current.read().await.clone()
    }

    /// Bearer token for the drops API
    pub async fn session_token(&self) -> Option<String> {
        self.current.read().await.as_ref().and_then(|c| c.session_token())
    }

    /// Save credentials (e.g. after an interactive login) and start using them.
    pub async fn adopt(&self, credentials: Credentials) -> Result<(), MinerError> {
        self.store.persist_session(&credentials).await?;
        *self.rejected.write().await = None;
        *self.current.write().await = Some(credentials);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::FakeSessionStore;

    #[tokio::test]
    async fn test_refresh_without_credentials() {
        let ctx = SessionContext::new(Arc::new(FakeSessionStore::default()));
        assert!(!ctx.refresh().await.unwrap());
        assert!(!ctx.is_authenticated().await);
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_not_reused() {
        let store = Arc::new(FakeSessionStore::with_token("old"));
        let ctx = SessionContext::new(store.clone());

        assert!(ctx.refresh().await.unwrap());
        assert_eq!(ctx.session_token().await.as_deref(), Some("old"));

        ctx.invalidate().await;
        assert!(!ctx.is_authenticated().await);
        // Same cookies still on disk: stay suspended
        assert!(!ctx.refresh().await.unwrap());

        store.set_token(Some("new"));
        assert!(ctx.refresh().await.unwrap());
        assert_eq!(ctx.session_token().await.as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_blank_token_is_not_authenticated() {
        let ctx = SessionContext::new(Arc::new(FakeSessionStore::with_token("  ")));
        assert!(!ctx.refresh().await.unwrap());
    }

    #[tokio::test]
    async fn test_adopt_persists() {
        let store = Arc::new(FakeSessionStore::default());
        let ctx = SessionContext::new(store.clone());
        ctx.adopt(Credentials::from_session_token("abc")).await.unwrap();
        assert!(ctx.is_authenticated().await);
        assert!(store.stored().is_some());
    }
}
