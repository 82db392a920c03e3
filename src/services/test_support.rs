//! In-memory fakes of the platform API and the browser, shared by the
//! service tests.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::MinerError;
use crate::models::drops::{Campaign, CampaignChannel, CampaignStatus, ClaimKey, ClaimOutcome, RewardTier};
use crate::models::stream::Liveness;
use crate::models::user::Credentials;
use crate::traits::{BrowserDriver, DropsApi, SessionStore, WatchHandle};

/// Active campaign `id` with one tier per threshold (`{id}-t{index}`).
pub fn campaign(id: &str, progress: u64, thresholds: &[u64], channel_slugs: &[&str]) -> Campaign {
    Campaign {
        id: id.to_string(),
        name: format!("Campaign {}", id),
        game: "Rust".to_string(),
        game_slug: "rust".to_string(),
        category_id: None,
        starts_at: None,
        ends_at: None,
        tiers: thresholds
            .iter()
            .enumerate()
            .map(|(i, required)| RewardTier {
                id: format!("{}-t{}", id, i),
                name: format!("Reward {} #{}", id, i),
                required_units: *required,
                image_url: String::new(),
                claimed: false,
            })
            .collect(),
        channels: channel_slugs
            .iter()
            .map(|slug| CampaignChannel {
                slug: slug.to_string(),
                display_name: slug.to_string(),
            })
            .collect(),
        progress_units: progress,
        status: CampaignStatus::Active,
    }
}

pub fn live(viewers: u64) -> Liveness {
    Liveness::Live {
        viewers,
        category_id: None,
    }
}

pub struct FakeApi {
    campaigns: Mutex<Result<Vec<Campaign>, MinerError>>,
    liveness: Mutex<HashMap<String, Liveness>>,
    liveness_error: Mutex<Option<MinerError>>,
    claim_results: Mutex<HashMap<ClaimKey, VecDeque<Result<ClaimOutcome, MinerError>>>>,
    claim_log: Mutex<Vec<ClaimKey>>,
    campaign_calls: AtomicUsize,
    liveness_calls: AtomicUsize,
    hang_liveness: AtomicBool,
    hang_claims: AtomicBool,
}

impl FakeApi {
    pub fn new() -> Self {
        Self {
            campaigns: Mutex::new(Ok(Vec::new())),
            liveness: Mutex::new(HashMap::new()),
            liveness_error: Mutex::new(None),
            claim_results: Mutex::new(HashMap::new()),
            claim_log: Mutex::new(Vec::new()),
            campaign_calls: AtomicUsize::new(0),
            liveness_calls: AtomicUsize::new(0),
            hang_liveness: AtomicBool::new(false),
            hang_claims: AtomicBool::new(false),
        }
    }

    pub fn set_campaigns(&self, campaigns: Vec<Campaign>) {
        *self.campaigns.lock().unwrap() = Ok(campaigns);
    }

    pub fn fail_campaigns(&self, err: MinerError) {
        *self.campaigns.lock().unwrap() = Err(err);
    }

    pub fn set_live(&self, channel: &str, liveness: Liveness) {
        self.liveness.lock().unwrap().insert(channel.to_string(), liveness);
    }

    pub fn fail_liveness(&self, err: Option<MinerError>) {
        *self.liveness_error.lock().unwrap() = err;
    }

    pub fn hang_liveness(&self, hang: bool) {
        self.hang_liveness.store(hang, Ordering::SeqCst);
    }

    pub fn hang_claims(&self, hang: bool) {
        self.hang_claims.store(hang, Ordering::SeqCst);
    }

    /// Queue results for the next claim attempts of `key`. Once drained,
    /// claims succeed.
    pub fn script_claims(&self, key: &ClaimKey, results: Vec<Result<ClaimOutcome, MinerError>>) {
        self.claim_results
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .extend(results);
    }

    pub fn claim_log(&self) -> Vec<ClaimKey> {
        self.claim_log.lock().unwrap().clone()
    }

    pub fn claim_count(&self, key: &ClaimKey) -> usize {
        self.claim_log.lock().unwrap().iter().filter(|k| *k == key).count()
    }

    pub fn campaign_calls(&self) -> usize {
        self.campaign_calls.load(Ordering::SeqCst)
    }

    pub fn liveness_calls(&self) -> usize {
        self.liveness_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DropsApi for FakeApi {
    async fn fetch_campaigns(&self) -> Result<Vec<Campaign>, MinerError> {
        self.campaign_calls.fetch_add(1, Ordering::SeqCst);
        self.campaigns.lock().unwrap().clone()
    }

    async fn fetch_liveness(&self, channel_ids: &[String]) -> Result<HashMap<String, Liveness>, MinerError> {
        self.liveness_calls.fetch_add(1, Ordering::SeqCst);
        if self.hang_liveness.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if let Some(err) = self.liveness_error.lock().unwrap().clone() {
            return Err(err);
        }
        let known = self.liveness.lock().unwrap();
        Ok(channel_ids
            .iter()
            .map(|id| (id.clone(), known.get(id).copied().unwrap_or(Liveness::Offline)))
            .collect())
    }

    async fn claim_reward(&self, campaign_id: &str, tier_id: &str) -> Result<ClaimOutcome, MinerError> {
        let key = ClaimKey::new(campaign_id, tier_id);
        self.claim_log.lock().unwrap().push(key.clone());
        if self.hang_claims.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let scripted = self
            .claim_results
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or(Ok(ClaimOutcome::Claimed))
    }
}

#[derive(Default)]
struct DriverState {
    open: BTreeSet<String>,
    opened: Vec<String>,
    closed: Vec<String>,
    max_open: usize,
    next_id: usize,
    fail_open: BTreeSet<String>,
    not_playing: BTreeSet<String>,
    dead: BTreeSet<String>,
}

/// Browser fake. Channels play by default; tests can make them fail to
/// open, never start playing or die.
#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<DriverState>,
    hang_open: AtomicBool,
    close_delay: Mutex<Duration>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_open(&self, channel: &str) {
        self.state.lock().unwrap().fail_open.insert(channel.to_string());
    }

    pub fn set_playing(&self, channel: &str, playing: bool) {
        let mut state = self.state.lock().unwrap();
        if playing {
            state.not_playing.remove(channel);
        } else {
            state.not_playing.insert(channel.to_string());
        }
    }

    pub fn kill(&self, channel: &str) {
        self.state.lock().unwrap().dead.insert(channel.to_string());
    }

    pub fn hang_open(&self, hang: bool) {
        self.hang_open.store(hang, Ordering::SeqCst);
    }

    /// Make every close take `delay` before the page goes away
    pub fn close_delay(&self, delay: Duration) {
        *self.close_delay.lock().unwrap() = delay;
    }

    /// Channels opened, in order
    pub fn opened(&self) -> Vec<String> {
        self.state.lock().unwrap().opened.clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.state.lock().unwrap().closed.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state.lock().unwrap().open.len()
    }

    /// Highest number of simultaneously open pages ever observed
    pub fn max_open(&self) -> usize {
        self.state.lock().unwrap().max_open
    }
}

#[async_trait]
impl BrowserDriver for FakeDriver {
    async fn open_watch(&self, channel_id: &str) -> Result<WatchHandle, MinerError> {
        if self.hang_open.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let mut state = self.state.lock().unwrap();
        if state.fail_open.contains(channel_id) {
            return Err(MinerError::Browser(format!("cannot open {}", channel_id)));
        }
        state.next_id += 1;
        let handle = WatchHandle {
            id: format!("page-{}", state.next_id),
            channel: channel_id.to_string(),
        };
        state.open.insert(handle.id.clone());
        state.opened.push(channel_id.to_string());
        state.max_open = state.max_open.max(state.open.len());
        Ok(handle)
    }

    async fn close_watch(&self, handle: &WatchHandle) -> Result<(), MinerError> {
        let delay = *self.close_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        if state.open.remove(&handle.id) {
            state.closed.push(handle.channel.clone());
        }
        Ok(())
    }

    async fn is_stream_playing(&self, handle: &WatchHandle) -> Result<bool, MinerError> {
        let state = self.state.lock().unwrap();
        if state.dead.contains(&handle.channel) {
            return Err(MinerError::Browser("page crashed".to_string()));
        }
        Ok(!state.not_playing.contains(&handle.channel))
    }
}

/// Session store holding at most one credential set in memory.
#[derive(Default)]
pub struct FakeSessionStore {
    credentials: Mutex<Option<Credentials>>,
    loads: AtomicUsize,
}

impl FakeSessionStore {
    pub fn with_token(token: &str) -> Self {
        let store = Self::default();
        store.set_token(Some(token));
        store
    }

    pub fn set_token(&self, token: Option<&str>) {
        *self.credentials.lock().unwrap() = token.map(Credentials::from_session_token);
    }

    pub fn stored(&self) -> Option<Credentials> {
        self.credentials.lock().unwrap().clone()
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for FakeSessionStore {
    async fn load_session(&self) -> Result<Option<Credentials>, MinerError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.credentials.lock().unwrap().clone())
    }

    async fn persist_session(&self, credentials: &Credentials) -> Result<(), MinerError> {
        *self.credentials.lock().unwrap() = Some(credentials.clone());
        Ok(())
    }
}
