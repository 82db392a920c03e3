use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    #[default]
    Active,
    Expired,
    Completed,
}

impl CampaignStatus {
    /// Expired and completed campaigns never change status again.
    pub fn is_terminal(self) -> bool {
        !matches!(self, CampaignStatus::Active)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardTier {
    pub id: String,
    pub name: String,
    /// Watched units (minutes) needed to unlock this reward
    pub required_units: u64,
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub claimed: bool,
}

impl RewardTier {
    pub fn threshold_met(&self, progress_units: u64) -> bool {
        progress_units >= self.required_units
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignChannel {
    pub slug: String,
    pub display_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub game: String,
    #[serde(default)]
    pub game_slug: String,
    #[serde(default)]
    pub category_id: Option<u64>,
    #[serde(default)]
    pub starts_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ends_at: Option<DateTime<Utc>>,
    pub tiers: Vec<RewardTier>,
    pub channels: Vec<CampaignChannel>,
    #[serde(default)]
    pub progress_units: u64,
    #[serde(default)]
    pub status: CampaignStatus,
}

impl Campaign {
    pub fn has_started(&self, now: DateTime<Utc>) -> bool {
        self.starts_at.map_or(true, |start| start <= now)
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.ends_at.map_or(false, |end| end <= now)
    }

    pub fn all_tiers_claimed(&self) -> bool {
        !self.tiers.is_empty() && self.tiers.iter().all(|t| t.claimed)
    }

    /// Remaining units until the nearest tier that is neither met nor claimed.
    /// `None` when watching no longer helps this campaign.
    pub fn remaining_to_next_tier(&self) -> Option<u64> {
        self.tiers
            .iter()
            .filter(|t| !t.claimed && !t.threshold_met(self.progress_units))
            .map(|t| t.required_units - self.progress_units)
            .min()
    }

    /// Active, already started and still has a tier to work towards.
    pub fn is_watchable(&self, now: DateTime<Utc>) -> bool {
        self.status == CampaignStatus::Active
            && self.has_started(now)
            && !self.has_ended(now)
            && self.remaining_to_next_tier().is_some()
    }

    pub fn has_channel(&self, slug: &str) -> bool {
        self.channels.iter().any(|c| c.slug == slug)
    }

    pub fn tier(&self, tier_id: &str) -> Option<&RewardTier> {
        self.tiers.iter().find(|t| t.id == tier_id)
    }

    /// Tiers whose threshold is met but which have not been claimed yet.
    pub fn claimable_tiers(&self) -> impl Iterator<Item = &RewardTier> {
        self.tiers
            .iter()
            .filter(move |t| !t.claimed && t.threshold_met(self.progress_units))
    }
}

/// Emitted by the catalog whenever a campaign's progress, claimed flags or
/// status changed during a merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressDelta {
    pub campaign_id: String,
    pub previous_units: u64,
    pub current_units: u64,
    pub status: CampaignStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimKey {
    pub campaign_id: String,
    pub tier_id: String,
}

impl ClaimKey {
    pub fn new(campaign_id: impl Into<String>, tier_id: impl Into<String>) -> Self {
        Self {
            campaign_id: campaign_id.into(),
            tier_id: tier_id.into(),
        }
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.campaign_id, self.tier_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimTaskState {
    Pending,
    InFlight,
    RetryScheduled,
    /// Gave up; kept visible until the tier gets claimed or the campaign expires
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimTask {
    pub key: ClaimKey,
    pub reward_name: String,
    pub attempts: u32,
    pub state: ClaimTaskState,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedReward {
    pub campaign_id: String,
    pub campaign_name: String,
    pub tier_id: String,
    pub reward_name: String,
    pub claimed_at: DateTime<Utc>,
}

/// Per-campaign progress line for the status snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignProgress {
    pub campaign_id: String,
    pub campaign_name: String,
    pub game: String,
    pub status: CampaignStatus,
    pub progress_units: u64,
    pub next_threshold: Option<u64>,
    pub claimed_tiers: usize,
    pub total_tiers: usize,
}

impl From<&Campaign> for CampaignProgress {
    fn from(campaign: &Campaign) -> Self {
        Self {
            campaign_id: campaign.id.clone(),
            campaign_name: campaign.name.clone(),
            game: campaign.game.clone(),
            status: campaign.status,
            progress_units: campaign.progress_units,
            next_threshold: campaign
                .remaining_to_next_tier()
                .map(|remaining| campaign.progress_units + remaining),
            claimed_tiers: campaign.tiers.iter().filter(|t| t.claimed).count(),
            total_tiers: campaign.tiers.len(),
        }
    }
}
