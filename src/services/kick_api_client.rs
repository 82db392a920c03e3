use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use log::{debug, warn};
use reqwest::header::{ACCEPT, AUTHORIZATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::MinerError;
use crate::models::drops::{Campaign, CampaignChannel, CampaignStatus, ClaimOutcome, RewardTier};
use crate::models::settings::ApiSettings;
use crate::models::stream::Liveness;
use crate::services::session_context::SessionContext;
use crate::traits::DropsApi;

/// Concurrent channel lookups per liveness poll
const LIVENESS_CONCURRENCY: usize = 8;

// Kick returns ids and counters as numbers or strings depending on the endpoint
fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => s,
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    })
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    Ok(value_as_u64(&Value::deserialize(deserializer)?).unwrap_or(0))
}

fn lenient_date<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::String(s) => DateTime::parse_from_rfc3339(&s).ok().map(|d| d.with_timezone(&Utc)),
        _ => None,
    })
}

fn value_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse<T> {
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ApiCategory {
    #[serde(deserialize_with = "lenient_u64")]
    id: u64,
    #[serde(deserialize_with = "lenient_string")]
    name: String,
    #[serde(deserialize_with = "lenient_string")]
    slug: String,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ApiReward {
    #[serde(deserialize_with = "lenient_string")]
    id: String,
    #[serde(deserialize_with = "lenient_string")]
    name: String,
    #[serde(deserialize_with = "lenient_u64")]
    required_units: u64,
    image_url: Option<String>,
    image: Option<String>,
    claimed: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ApiUser {
    username: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ApiChannel {
    #[serde(deserialize_with = "lenient_string")]
    slug: String,
    user: Option<ApiUser>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ApiCampaign {
    #[serde(deserialize_with = "lenient_string")]
    id: String,
    #[serde(deserialize_with = "lenient_string")]
    name: String,
    status: Option<String>,
    #[serde(deserialize_with = "lenient_date")]
    starts_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "lenient_date")]
    ends_at: Option<DateTime<Utc>>,
    category: Option<ApiCategory>,
    rewards: Vec<ApiReward>,
    channels: Vec<ApiChannel>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ApiProgressReward {
    #[serde(deserialize_with = "lenient_string")]
    id: String,
    claimed: Option<bool>,
    #[serde(deserialize_with = "lenient_u64")]
    required_units: u64,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ApiProgress {
    #[serde(deserialize_with = "lenient_string")]
    id: String,
    status: Option<String>,
    #[serde(deserialize_with = "lenient_u64")]
    progress_units: u64,
    rewards: Vec<ApiProgressReward>,
}

fn is_expired_token(status: &str) -> bool {
    matches!(status.to_lowercase().as_str(), "expired" | "ended" | "closed" | "past")
}

fn is_finished_token(status: &str) -> bool {
    matches!(
        status.to_lowercase().as_str(),
        "claimed" | "completed" | "finished" | "done"
    )
}

impl ApiCampaign {
    fn into_campaign(self, progress: Option<&ApiProgress>) -> Campaign {
        let category = self.category.unwrap_or_default();
        let progress_rewards: HashMap<&str, &ApiProgressReward> = progress
            .map(|p| p.rewards.iter().map(|r| (r.id.as_str(), r)).collect())
            .unwrap_or_default();

        let tiers: Vec<RewardTier> = self
            .rewards
            .into_iter()
            .filter(|r| !r.id.is_empty())
            .map(|r| {
                let from_progress = progress_rewards.get(r.id.as_str());
                let required_units = from_progress
                    .map(|p| p.required_units)
                    .filter(|units| *units > 0)
                    .unwrap_or(r.required_units);
                RewardTier {
                    name: if r.name.is_empty() { "Unknown Reward".to_string() } else { r.name },
                    required_units,
                    image_url: r.image_url.or(r.image).unwrap_or_default(),
                    claimed: r.claimed.unwrap_or(false) || from_progress.map_or(false, |p| p.claimed.unwrap_or(false)),
                    id: r.id,
                }
            })
            .collect();

        let mut status = CampaignStatus::Active;
        if self.status.as_deref().map_or(false, is_expired_token) {
            status = CampaignStatus::Expired;
        } else if progress
            .and_then(|p| p.status.as_deref())
            .map_or(false, is_finished_token)
        {
            status = CampaignStatus::Completed;
        }

        Campaign {
            id: self.id,
            name: if self.name.is_empty() { "Unknown Campaign".to_string() } else { self.name },
            game: if category.name.is_empty() { "Unknown Game".to_string() } else { category.name },
            game_slug: category.slug,
            category_id: Some(category.id).filter(|id| *id != 0),
            starts_at: self.starts_at,
            ends_at: self.ends_at,
            tiers,
            channels: self
                .channels
                .into_iter()
                .filter(|c| !c.slug.trim().is_empty())
                .map(|c| {
                    let slug = c.slug.trim().to_lowercase();
                    CampaignChannel {
                        display_name: c.user.and_then(|u| u.username).unwrap_or_else(|| slug.clone()),
                        slug,
                    }
                })
                .collect(),
            progress_units: progress.map_or(0, |p| p.progress_units),
            status,
        }
    }
}

/// Reads Kick's channel payload, whose shape differs between API versions.
pub fn parse_channel_liveness(payload: &Value) -> Liveness {
    let data = match payload.get("data") {
        Some(inner) if inner.is_object() => inner,
        _ => payload,
    };
    let stream = ["livestream", "stream", "live_stream"]
        .iter()
        .filter_map(|key| data.get(*key))
        .find(|v| v.is_object())
        .cloned()
        .unwrap_or(Value::Null);

    let mut live = None;
    for key in ["is_live", "isLive", "live", "online"] {
        if let Some(flag) = stream.get(key).and_then(Value::as_bool) {
            live = Some(flag);
            break;
        }
        if let Some(flag) = data.get(key).and_then(Value::as_bool) {
            live = Some(flag);
            break;
        }
    }
    let live = live.unwrap_or_else(|| {
        ["id", "session_title", "created_at", "playback_url", "key"]
            .iter()
            .any(|k| stream.get(*k).map_or(false, |v| !v.is_null()))
    });
    if !live {
        return Liveness::Offline;
    }

    let viewers = [stream.get("viewer_count"), stream.get("viewers"), data.get("viewer_count")]
        .into_iter()
        .flatten()
        .find_map(value_as_u64)
        .unwrap_or(0);

    let category = stream
        .get("category")
        .filter(|c| c.is_object())
        .or_else(|| stream.get("categories").and_then(|c| c.get(0)))
        .or_else(|| data.get("category").filter(|c| c.is_object()));
    let category_id = category.and_then(|c| c.get("id")).and_then(value_as_u64);

    Liveness::Live { viewers, category_id }
}

/// `DropsApi` over Kick's public web endpoints.
pub struct KickApiClient {
    client: Client,
    settings: ApiSettings,
    session: Arc<SessionContext>,
}

impl KickApiClient {
    pub fn new(settings: ApiSettings, session: Arc<SessionContext>) -> Result<Self> {
        let client = Client::builder()
            .timeout(settings.request_timeout())
            .connect_timeout(std::time::Duration::from_secs(10))
            .user_agent(settings.user_agent.clone())
            .gzip(true)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            client,
            settings,
            session,
        })
    }

    async fn bearer(&self) -> Result<String, MinerError> {
        self.session
            .session_token()
            .await
            .ok_or_else(|| MinerError::AuthExpired("no session token".to_string()))
    }

    /// Only requests carrying the bearer token (`authenticated`) can report
    /// expired credentials; a 401/403 on an anonymous endpoint is a plain
    /// fetch failure (Cloudflare challenges, rate limiting).
    async fn send(&self, request: RequestBuilder, what: &str, authenticated: bool) -> Result<Response, MinerError> {
        let response = request
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| MinerError::Fetch(format!("{}: {}", what, e)))?;
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN if authenticated => Err(MinerError::AuthExpired(
                format!("{} returned {}", what, response.status()),
            )),
            status if !status.is_success() => Err(MinerError::Fetch(format!("{} returned {}", what, status))),
            _ => Ok(response),
        }
    }

    async fn fetch_progress(&self) -> Result<Vec<ApiProgress>, MinerError> {
        let token = self.bearer().await?;
        let request = self
            .client
            .get(&self.settings.progress_url)
            .header(AUTHORIZATION, format!("Bearer {}", token));
        let response = self.send(request, "drops progress", true).await?;
        let body: ListResponse<ApiProgress> = response
            .json()
            .await
            .map_err(|e| MinerError::Fetch(format!("drops progress payload: {}", e)))?;
        Ok(body.data.into_iter().filter(|p| !p.id.is_empty()).collect())
    }

    async fn channel_liveness(&self, slug: &str) -> Result<Liveness, MinerError> {
        let url = self.settings.channel_url.replace("{slug}", slug);
        let response = match self.send(self.client.get(&url), "channel lookup", false).await {
            Ok(response) => response,
            Err(MinerError::Fetch(message)) if message.ends_with("404 Not Found") => return Ok(Liveness::Offline),
            Err(e) => return Err(e),
        };
        let payload: Value = response
            .json()
            .await
            .map_err(|e| MinerError::Fetch(format!("channel payload for {}: {}", slug, e)))?;
        Ok(parse_channel_liveness(&payload))
    }
}

#[async_trait]
impl DropsApi for KickApiClient {
    async fn fetch_campaigns(&self) -> Result<Vec<Campaign>, MinerError> {
        let response = self
            .send(self.client.get(&self.settings.campaigns_url), "drops campaigns", false)
            .await?;
        let body: ListResponse<ApiCampaign> = response
            .json()
            .await
            .map_err(|e| MinerError::Fetch(format!("drops campaigns payload: {}", e)))?;

        let progress = self.fetch_progress().await?;
        let by_id: HashMap<&str, &ApiProgress> = progress.iter().map(|p| (p.id.as_str(), p)).collect();

        let campaigns: Vec<Campaign> = body
            .data
            .into_iter()
            .filter(|c| !c.id.is_empty())
            .map(|c| {
                let p = by_id.get(c.id.as_str()).copied();
                c.into_campaign(p)
            })
            .collect();
        debug!(
            "[KickApi] Fetched {} campaigns, {} with progress",
            campaigns.len(),
            progress.len()
        );
        Ok(campaigns)
    }

    async fn fetch_liveness(&self, channel_ids: &[String]) -> Result<HashMap<String, Liveness>, MinerError> {
        let results: Vec<(String, Result<Liveness, MinerError>)> = stream::iter(channel_ids.iter().cloned())
            .map(|slug| async move {
                let result = self.channel_liveness(&slug).await;
                (slug, result)
            })
            .buffer_unordered(LIVENESS_CONCURRENCY)
            .collect()
            .await;

        let mut report = HashMap::with_capacity(results.len());
        let mut failures = 0usize;
        let mut last_error = None;
        for (slug, result) in results {
            match result {
                Ok(liveness) => {
                    report.insert(slug, liveness);
                }
                Err(e) => {
                    debug!("[KickApi] Liveness check failed for {}: {}", slug, e);
                    failures += 1;
                    last_error = Some(e);
                    report.insert(slug, Liveness::Unknown);
                }
            }
        }

        if failures > 0 && failures == channel_ids.len() {
            if let Some(e) = last_error {
                warn!("[KickApi] Every liveness check failed ({} channels)", failures);
                return Err(e);
            }
        }
        Ok(report)
    }

    async fn claim_reward(&self, campaign_id: &str, tier_id: &str) -> Result<ClaimOutcome, MinerError> {
        let token = self.bearer().await?;
        let response = self
            .client
            .post(&self.settings.claim_url)
            .header(ACCEPT, "application/json")
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(&serde_json::json!({
                "campaign_id": campaign_id,
                "reward_id": tier_id,
            }))
            .send()
            .await
            .map_err(|e| MinerError::transient_claim(e.to_string()))?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let already = body.to_lowercase().contains("already claimed");

        match status {
            s if s.is_success() && already => Ok(ClaimOutcome::AlreadyClaimed),
            s if s.is_success() => Ok(ClaimOutcome::Claimed),
            StatusCode::CONFLICT => Ok(ClaimOutcome::AlreadyClaimed),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(MinerError::AuthExpired(format!("claim returned {}", status)))
            }
            StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                Err(MinerError::transient_claim(format!("{}: {}", status, body)))
            }
            s if s.is_server_error() => Err(MinerError::transient_claim(format!("{}: {}", status, body))),
            _ if already => Ok(ClaimOutcome::AlreadyClaimed),
            _ => Err(MinerError::terminal_claim(format!("{}: {}", status, body))),
        }
    }
}
