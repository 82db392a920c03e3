use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::MinerError;
use crate::models::drops::{Campaign, CampaignProgress, ClaimKey, ClaimOutcome, ClaimTask, ClaimedReward};
use crate::models::queue::QueueEntry;
use crate::models::stream::Liveness;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WatchSessionState {
    #[default]
    Idle,
    Starting,
    Active,
    Degraded,
    Stopped,
    Failed,
}

impl WatchSessionState {
    pub fn is_idle(self) -> bool {
        self == WatchSessionState::Idle
    }
}

/// What the scheduler is currently pointing the watch session at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub channel: String,
    pub campaign_id: String,
    pub campaign_name: String,
    pub selected_at: DateTime<Utc>,
}

/// Reports the watch worker sends back into the mining loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionReport {
    /// Playback confirmed, session is now active
    Confirmed,
    StartFailed(String),
    Stalled,
    Recovered,
    /// Browser or page died under us
    Died(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthState {
    #[default]
    Unknown,
    Authenticated,
    /// No credentials or the platform rejected them; network activity suspended
    Suspended,
}

/// Everything the loop consumes. Pollers, the watch worker and claim tasks
/// only ever talk to the loop through this.
#[derive(Debug)]
pub enum MinerEvent {
    CatalogFetched(Result<Vec<Campaign>, MinerError>),
    LivenessFetched(Result<HashMap<String, Liveness>, MinerError>),
    Session {
        session_id: u64,
        report: SessionReport,
    },
    ClaimFinished {
        key: ClaimKey,
        result: Result<ClaimOutcome, MinerError>,
    },
    ClaimRetryDue(ClaimKey),
    /// Operator asked to move away from the current channel
    SkipCurrent,
    Shutdown,
}

/// Snapshot published after every loop iteration, for UI and diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MinerStatus {
    pub target: Option<WatchTarget>,
    pub session_state: WatchSessionState,
    pub auth: AuthState,
    pub campaigns: Vec<CampaignProgress>,
    pub pending_claims: Vec<ClaimTask>,
    pub claimed: Vec<ClaimedReward>,
    /// Queue with this run's watch time folded into `elapsed_seconds`
    pub queue: Vec<QueueEntry>,
    pub idle_since: Option<DateTime<Utc>>,
    pub warnings: Vec<String>,
    pub last_update: Option<DateTime<Utc>>,
}
