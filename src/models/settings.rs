use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::models::queue::QueueEntry;

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct MinerSettings {
    pub catalog_refresh_secs: u64,  // Campaign + progress poll
    pub liveness_poll_secs: u64,    // Live/viewer poll for candidate channels
    pub tick_secs: u64,             // Periodic scheduler recompute
    pub fetch_retry_base_secs: u64, // First retry delay after a failed poll
    pub session_start_timeout_secs: u64,
    pub confirm_poll_millis: u64,   // Playback confirmation poll while starting
    pub health_check_secs: u64,
    pub stall_checks: u32,          // Consecutive "not playing" checks before degraded
    pub driver_call_timeout_secs: u64,
    pub stop_grace_secs: u64,
    pub claim_max_attempts: u32,
    pub claim_backoff_base_secs: u64,
    pub claim_backoff_cap_secs: u64,
    pub auth_recheck_secs: u64,
    pub idle_warning_secs: u64,
    pub failover_cooldown_ticks: u32, // Ticks a failed-over channel sits out
    pub auto_claim: bool,             // Off: claimable tiers are only listed
    pub preferred_games: Vec<String>, // Empty = all games
}

impl Default for MinerSettings {
    fn default() -> Self {
        Self {
            catalog_refresh_secs: 120,
            liveness_poll_secs: 20,
            tick_secs: 60,
            fetch_retry_base_secs: 5,
            session_start_timeout_secs: 45,
            confirm_poll_millis: 1500,
            health_check_secs: 15,
            stall_checks: 3,
            driver_call_timeout_secs: 20,
            stop_grace_secs: 10,
            claim_max_attempts: 5,
            claim_backoff_base_secs: 5,
            claim_backoff_cap_secs: 300,
            auth_recheck_secs: 60,
            idle_warning_secs: 30 * 60,
            failover_cooldown_ticks: 3,
            auto_claim: true,
            preferred_games: vec![],
        }
    }
}

impl MinerSettings {
    pub fn catalog_refresh(&self) -> Duration {
        Duration::from_secs(self.catalog_refresh_secs.max(1))
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_secs(self.liveness_poll_secs.max(1))
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }

    pub fn session_start_timeout(&self) -> Duration {
        Duration::from_secs(self.session_start_timeout_secs.max(1))
    }

    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_secs.max(1))
    }

    pub fn driver_call_timeout(&self) -> Duration {
        Duration::from_secs(self.driver_call_timeout_secs.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs.max(1))
    }

    /// Capped exponential backoff for the n-th failed claim attempt (1-based).
    pub fn claim_backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let secs = self
            .claim_backoff_base_secs
            .saturating_mul(1u64 << exp)
            .min(self.claim_backoff_cap_secs);
        Duration::from_secs(secs)
    }

    /// Backoff for pollers after `failures` consecutive errors, never above the normal interval.
    pub fn fetch_backoff(&self, failures: u32, interval: Duration) -> Duration {
        let exp = failures.saturating_sub(1).min(16);
        let delay = Duration::from_secs(self.fetch_retry_base_secs.saturating_mul(1u64 << exp));
        delay.min(interval)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct ApiSettings {
    pub campaigns_url: String,
    pub progress_url: String,
    pub channel_url: String, // `{slug}` is replaced with the channel slug
    pub claim_url: String,
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            campaigns_url: "https://web.kick.com/api/v1/drops/campaigns".to_string(),
            progress_url: "https://web.kick.com/api/v1/drops/progress".to_string(),
            channel_url: "https://kick.com/api/v2/channels/{slug}".to_string(),
            claim_url: "https://web.kick.com/api/v1/drops/claim".to_string(),
            request_timeout_secs: 20,
            user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36".to_string(),
        }
    }
}

impl ApiSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(default)]
pub struct BrowserSettings {
    pub binary: Option<PathBuf>, // Autodetected when unset
    pub headless: bool,
    pub hide_player: bool,
    pub profile_dir: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            binary: None,
            headless: true,
            hide_player: true,
            profile_dir: None,
            extra_args: vec![],
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Settings {
    pub miner: MinerSettings,
    pub api: ApiSettings,
    pub browser: BrowserSettings,
    pub queue: Vec<QueueEntry>,
    pub diagnostics_enabled: bool,
}
