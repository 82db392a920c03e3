//! Error types shared by the miner core.
//!
//! Every public operation of the core returns one of these instead of
//! panicking. Errors are `Clone` so they can travel inside loop events and be
//! kept in the status snapshot.

use std::time::Duration;
use thiserror::Error;

use crate::models::mining::WatchSessionState;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MinerError {
    /// Catalog or liveness fetch failed (network, bad payload, server error).
    #[error("fetch failed: {0}")]
    Fetch(String),

    /// A watch session could not be started on the requested channel.
    #[error("watch session failed to start on {channel}: {reason}")]
    SessionStart { channel: String, reason: String },

    /// `start()` was called while a session is still non-idle.
    #[error("watch session busy (state: {state:?})")]
    SessionBusy { state: WatchSessionState },

    /// Claim request failed. Transient failures are retried, terminal ones are surfaced.
    #[error("claim failed: {message}")]
    Claim { transient: bool, message: String },

    /// The platform rejected our credentials.
    #[error("authentication expired: {0}")]
    AuthExpired(String),

    /// Browser driver level failure (process gone, protocol error).
    #[error("browser driver error: {0}")]
    Browser(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl MinerError {
    pub fn is_auth_expired(&self) -> bool {
        matches!(self, MinerError::AuthExpired(_))
    }

    pub fn fetch_timeout(what: &str, after: Duration) -> Self {
        MinerError::Fetch(format!("{} timed out after {:?}", what, after))
    }

    pub fn transient_claim(message: impl Into<String>) -> Self {
        MinerError::Claim {
            transient: true,
            message: message.into(),
        }
    }

    pub fn terminal_claim(message: impl Into<String>) -> Self {
        MinerError::Claim {
            transient: false,
            message: message.into(),
        }
    }
}

pub type MinerResult<T> = Result<T, MinerError>;
