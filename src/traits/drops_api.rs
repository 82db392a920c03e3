//! Platform API used by the catalog, the liveness oracle and the claimer.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::MinerError;
use crate::models::drops::{Campaign, ClaimOutcome};
use crate::models::stream::Liveness;

#[async_trait]
pub trait DropsApi: Send + Sync {
    /// Every campaign currently visible to the user, with the user's progress merged in.
    async fn fetch_campaigns(&self) -> Result<Vec<Campaign>, MinerError>;

    /// Live state for each requested channel slug. Channels that could not be
    /// checked are reported as `Liveness::Unknown`.
    async fn fetch_liveness(&self, channel_ids: &[String]) -> Result<HashMap<String, Liveness>, MinerError>;

    /// Claim one reward. A reward that was already claimed is `Ok(AlreadyClaimed)`.
    async fn claim_reward(&self, campaign_id: &str, tier_id: &str) -> Result<ClaimOutcome, MinerError>;
}
