use async_trait::async_trait;

use crate::error::MinerError;
use crate::models::user::Credentials;

/// Where credentials live between runs. The core treats them as opaque.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load_session(&self) -> Result<Option<Credentials>, MinerError>;

    async fn persist_session(&self, credentials: &Credentials) -> Result<(), MinerError>;
}
