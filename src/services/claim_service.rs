use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::MinerError;
use crate::models::drops::{
    CampaignStatus, ClaimKey, ClaimOutcome, ClaimTask, ClaimTaskState, ClaimedReward, ProgressDelta,
};
use crate::models::mining::MinerEvent;
use crate::models::settings::MinerSettings;
use crate::services::campaign_catalog::CampaignCatalog;
use crate::traits::DropsApi;

/// What a finished claim meant for the loop.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimUpdate {
    /// Tier is now claimed; carries the history entry on the first transition
    Claimed(Option<ClaimedReward>),
    RetryScheduled(Duration),
    Failed(String),
    /// Credentials rejected; the task waits for `resume`
    AuthExpired(MinerError),
    /// Result for a task we no longer track
    Ignored,
}

/// Keeps one ClaimTask per (campaign, tier) whose threshold is met, whose
/// campaign has not expired and which is not claimed yet. Claim requests run
/// as their own tasks and report back through `MinerEvent::ClaimFinished`.
pub struct RewardClaimer {
    api: Arc<dyn DropsApi>,
    events: mpsc::Sender<MinerEvent>,
    settings: MinerSettings,
    request_timeout: Duration,
    tasks: BTreeMap<ClaimKey, ClaimTask>,
    in_flight: HashMap<ClaimKey, JoinHandle<()>>,
    retry_timers: HashMap<ClaimKey, JoinHandle<()>>,
    history: Vec<ClaimedReward>,
    suspended: bool,
}

impl RewardClaimer {
    pub fn new(
        api: Arc<dyn DropsApi>,
        events: mpsc::Sender<MinerEvent>,
        settings: MinerSettings,
        request_timeout: Duration,
    ) -> Self {
        Self {
            api,
            events,
            settings,
            request_timeout,
            tasks: BTreeMap::new(),
            in_flight: HashMap::new(),
            retry_timers: HashMap::new(),
            history: Vec::new(),
            suspended: false,
        }
    }

    /// Bring the task set in line with the catalog and issue every new task.
    /// Runs on every tick so campaigns that end between fetches drop out.
    pub fn reconcile(&mut self, catalog: &CampaignCatalog, now: DateTime<Utc>) {
        self.reconcile_where(catalog, now, |_| true);
    }

    /// Reconcile only the campaigns a catalog merge reported as changed.
    pub fn apply_deltas(&mut self, catalog: &CampaignCatalog, deltas: &[ProgressDelta], now: DateTime<Utc>) {
        if deltas.is_empty() {
            return;
        }
        let changed: HashSet<&str> = deltas.iter().map(|d| d.campaign_id.as_str()).collect();
        debug!("[Claimer] Applying {} campaign deltas", changed.len());
        self.reconcile_where(catalog, now, |campaign_id| changed.contains(campaign_id));
    }

    fn reconcile_where(&mut self, catalog: &CampaignCatalog, now: DateTime<Utc>, in_scope: impl Fn(&str) -> bool) {
        let mut eligible: BTreeMap<ClaimKey, String> = BTreeMap::new();
        for campaign in catalog.campaigns().filter(|c| in_scope(&c.id)) {
            if campaign.status == CampaignStatus::Expired || campaign.has_ended(now) {
                continue;
            }
            for tier in campaign.claimable_tiers() {
                eligible.insert(ClaimKey::new(&campaign.id, &tier.id), tier.name.clone());
            }
        }

        let stale: Vec<ClaimKey> = self
            .tasks
            .keys()
            .filter(|key| in_scope(&key.campaign_id) && !eligible.contains_key(*key))
            .cloned()
            .collect();
        for key in stale {
            debug!("[Claimer] Dropping task {}, no longer claimable", key);
            self.forget(&key);
        }

        for (key, reward_name) in eligible {
            if self.tasks.contains_key(&key) {
                continue;
            }
            if self.settings.auto_claim {
                info!("[Claimer] 🎁 {} ({}) is ready to claim", reward_name, key);
            } else {
                info!("[Claimer] 🎁 {} ({}) is ready, auto-claim is off", reward_name, key);
            }
            self.tasks.insert(
                key.clone(),
                ClaimTask {
                    key: key.clone(),
                    reward_name,
                    attempts: 0,
                    state: ClaimTaskState::Pending,
                    last_error: None,
                    created_at: now,
                },
            );
            self.issue(&key);
        }
    }

    /// Handle the result of one claim request.
    pub fn on_claim_finished(
        &mut self,
        key: &ClaimKey,
        result: Result<ClaimOutcome, MinerError>,
        catalog: &mut CampaignCatalog,
        now: DateTime<Utc>,
    ) -> ClaimUpdate {
        self.in_flight.remove(key);
        let Some(task) = self.tasks.get_mut(key) else {
            // The catalog may have caught up first; still record a success
            if result.is_ok() {
                return ClaimUpdate::Claimed(self.record_claim(key, catalog, now));
            }
            return ClaimUpdate::Ignored;
        };

        match result {
            Ok(outcome) => {
                if outcome == ClaimOutcome::AlreadyClaimed {
                    debug!("[Claimer] {} was already claimed", key);
                }
                self.tasks.remove(key);
                ClaimUpdate::Claimed(self.record_claim(key, catalog, now))
            }
            Err(err) if err.is_auth_expired() => {
                task.state = ClaimTaskState::Pending;
                task.last_error = Some(err.to_string());
                warn!("[Claimer] Claim for {} rejected, credentials expired", key);
                ClaimUpdate::AuthExpired(err)
            }
            Err(MinerError::Claim { transient: true, message }) | Err(MinerError::Fetch(message)) => {
                task.last_error = Some(message.clone());
                if task.attempts >= self.settings.claim_max_attempts {
                    error!("[Claimer] ❌ Giving up on {} after {} attempts: {}", key, task.attempts, message);
                    task.state = ClaimTaskState::Failed;
                    return ClaimUpdate::Failed(message);
                }
                let delay = self.settings.claim_backoff(task.attempts);
                task.state = ClaimTaskState::RetryScheduled;
                warn!(
                    "[Claimer] Claim {} failed (attempt {}), retrying in {:?}: {}",
                    key, task.attempts, delay, message
                );
                self.schedule_retry(key, delay);
                ClaimUpdate::RetryScheduled(delay)
            }
            Err(err) => {
                let message = err.to_string();
                error!("[Claimer] ❌ Claim {} failed permanently: {}", key, message);
                task.state = ClaimTaskState::Failed;
                task.last_error = Some(message.clone());
                ClaimUpdate::Failed(message)
            }
        }
    }

    pub fn on_retry_due(&mut self, key: &ClaimKey) {
        self.retry_timers.remove(key);
        if let Some(task) = self.tasks.get_mut(key) {
            if task.state == ClaimTaskState::RetryScheduled {
                task.state = ClaimTaskState::Pending;
                self.issue(key);
            }
        }
    }

    /// Stop issuing requests (credentials rejected).
    pub fn suspend(&mut self) {
        self.suspended = true;
    }

    /// Allow requests again and issue everything still pending.
    pub fn resume(&mut self) {
        self.suspended = false;
        let pending: Vec<ClaimKey> = self
            .tasks
            .values()
            .filter(|t| t.state == ClaimTaskState::Pending)
            .map(|t| t.key.clone())
            .collect();
        for key in pending {
            self.issue(&key);
        }
    }

    pub fn tasks(&self) -> Vec<ClaimTask> {
        self.tasks.values().cloned().collect()
    }

    pub fn task(&self, key: &ClaimKey) -> Option<&ClaimTask> {
        self.tasks.get(key)
    }

    pub fn history(&self) -> &[ClaimedReward] {
        &self.history
    }

    /// Abort retry timers and wait for in-flight requests to settle.
    pub async fn shutdown(&mut self) {
        for (_, timer) in self.retry_timers.drain() {
            timer.abort();
        }
        let grace = self.request_timeout + Duration::from_secs(1);
        for (key, request) in self.in_flight.drain() {
            if tokio::time::timeout(grace, request).await.is_err() {
                warn!("[Claimer] In-flight claim {} did not settle during shutdown", key);
            }
        }
    }

    fn issue(&mut self, key: &ClaimKey) {
        if self.suspended || !self.settings.auto_claim || self.in_flight.contains_key(key) {
            return;
        }
        let Some(task) = self.tasks.get_mut(key) else {
            return;
        };
        if task.state != ClaimTaskState::Pending {
            return;
        }
        task.state = ClaimTaskState::InFlight;
        task.attempts += 1;

        let api = self.api.clone();
        let events = self.events.clone();
        let timeout = self.request_timeout;
        let key_owned = key.clone();
        debug!("[Claimer] Claiming {} (attempt {})", key, task.attempts);

        let request = tokio::spawn(async move {
            let result = match tokio::time::timeout(
                timeout,
                api.claim_reward(&key_owned.campaign_id, &key_owned.tier_id),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(MinerError::transient_claim(format!("timed out after {:?}", timeout))),
            };
            let _ = events
                .send(MinerEvent::ClaimFinished {
                    key: key_owned,
                    result,
                })
                .await;
        });
        self.in_flight.insert(key.clone(), request);
    }

    fn schedule_retry(&mut self, key: &ClaimKey, delay: Duration) {
        let events = self.events.clone();
        let key_owned = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(MinerEvent::ClaimRetryDue(key_owned)).await;
        });
        if let Some(previous) = self.retry_timers.insert(key.clone(), timer) {
            previous.abort();
        }
    }

    fn forget(&mut self, key: &ClaimKey) {
        self.tasks.remove(key);
        if let Some(timer) = self.retry_timers.remove(key) {
            timer.abort();
        }
    }

    fn record_claim(&mut self, key: &ClaimKey, catalog: &mut CampaignCatalog, now: DateTime<Utc>) -> Option<ClaimedReward> {
        if !catalog.mark_claimed(key) {
            return None;
        }
        let campaign = catalog.get(&key.campaign_id)?;
        let tier = campaign.tier(&key.tier_id)?;
        let reward = ClaimedReward {
            campaign_id: campaign.id.clone(),
            campaign_name: campaign.name.clone(),
            tier_id: tier.id.clone(),
            reward_name: tier.name.clone(),
            claimed_at: now,
        };
        info!("[Claimer] ✅ Claimed {} from {}", reward.reward_name, reward.campaign_name);
        self.history.push(reward.clone());
        Some(reward)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{campaign, FakeApi};

    struct Harness {
        api: Arc<FakeApi>,
        claimer: RewardClaimer,
        catalog: CampaignCatalog,
        rx: mpsc::Receiver<MinerEvent>,
    }

    fn harness() -> Harness {
        harness_with(MinerSettings {
            claim_max_attempts: 3,
            claim_backoff_base_secs: 5,
            claim_backoff_cap_secs: 60,
            auto_claim: true,
            ..MinerSettings::default()
        })
    }

    fn harness_with(settings: MinerSettings) -> Harness {
        let api = Arc::new(FakeApi::new());
        let (tx, rx) = mpsc::channel(64);
        Harness {
            claimer: RewardClaimer::new(api.clone(), tx, settings, Duration::from_secs(10)),
            api,
            catalog: CampaignCatalog::new(),
            rx,
        }
    }

    impl Harness {
        /// Route the next event into the claimer, as the mining loop would.
        async fn pump(&mut self) -> Option<ClaimUpdate> {
            match self.rx.recv().await? {
                MinerEvent::ClaimFinished { key, result } => {
                    Some(self.claimer.on_claim_finished(&key, result, &mut self.catalog, Utc::now()))
                }
                MinerEvent::ClaimRetryDue(key) => {
                    self.claimer.on_retry_due(&key);
                    None
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crossing_threshold_claims_exactly_once() {
        let mut h = harness();
        let now = Utc::now();
        h.catalog.merge(vec![campaign("x", 49, &[50], &["a"])], now);
        h.claimer.reconcile(&h.catalog, now);
        assert!(h.claimer.tasks().is_empty());

        h.catalog.merge(vec![campaign("x", 50, &[50], &["a"])], now);
        h.claimer.reconcile(&h.catalog, now);
        // A second delta before the claim lands must not issue again
        h.claimer.reconcile(&h.catalog, now);
        assert_eq!(h.claimer.tasks().len(), 1);

        let update = h.pump().await.unwrap();
        assert!(matches!(update, ClaimUpdate::Claimed(Some(_))));
        assert_eq!(h.api.claim_count(&ClaimKey::new("x", "x-t0")), 1);
        assert!(h.claimer.tasks().is_empty());
        assert!(h.catalog.get("x").unwrap().tier("x-t0").unwrap().claimed);

        h.claimer.reconcile(&h.catalog, now);
        assert_eq!(h.api.claim_log().len(), 1);
        assert_eq!(h.claimer.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_claimed_is_idempotent() {
        let mut h = harness();
        let now = Utc::now();
        let key = ClaimKey::new("x", "x-t0");
        h.catalog.merge(vec![campaign("x", 50, &[50, 100], &["a"])], now);
        h.api.script_claims(&key, vec![Ok(ClaimOutcome::AlreadyClaimed)]);
        h.claimer.reconcile(&h.catalog, now);
        assert!(matches!(h.pump().await.unwrap(), ClaimUpdate::Claimed(Some(_))));

        // A duplicate response for the same tier is not a second success
        let again = h
            .claimer
            .on_claim_finished(&key, Ok(ClaimOutcome::Claimed), &mut h.catalog, now);
        assert_eq!(again, ClaimUpdate::Claimed(None));
        let again = h
            .claimer
            .on_claim_finished(&key, Ok(ClaimOutcome::AlreadyClaimed), &mut h.catalog, now);
        assert_eq!(again, ClaimUpdate::Claimed(None));
        assert_eq!(h.claimer.history().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_back_off_then_succeed() {
        let mut h = harness();
        let now = Utc::now();
        let key = ClaimKey::new("x", "x-t0");
        h.api.script_claims(
            &key,
            vec![
                Err(MinerError::transient_claim("503")),
                Err(MinerError::transient_claim("503")),
            ],
        );
        h.catalog.merge(vec![campaign("x", 50, &[50], &["a"])], now);
        h.claimer.reconcile(&h.catalog, now);

        let started = tokio::time::Instant::now();
        assert_eq!(h.pump().await.unwrap(), ClaimUpdate::RetryScheduled(Duration::from_secs(5)));
        assert_eq!(h.claimer.task(&key).unwrap().state, ClaimTaskState::RetryScheduled);
        assert!(h.pump().await.is_none());
        assert_eq!(h.pump().await.unwrap(), ClaimUpdate::RetryScheduled(Duration::from_secs(10)));
        assert!(h.pump().await.is_none());
        assert!(matches!(h.pump().await.unwrap(), ClaimUpdate::Claimed(Some(_))));
        assert!(started.elapsed() >= Duration::from_secs(15));
        assert_eq!(h.api.claim_count(&key), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_failure_stays_visible() {
        let mut h = harness();
        let now = Utc::now();
        let key = ClaimKey::new("x", "x-t0");
        h.api.script_claims(&key, (0..3).map(|_| Err(MinerError::transient_claim("503"))).collect());
        h.catalog.merge(vec![campaign("x", 50, &[50], &["a"])], now);
        h.claimer.reconcile(&h.catalog, now);

        for _ in 0..2 {
            assert!(matches!(h.pump().await.unwrap(), ClaimUpdate::RetryScheduled(_)));
            assert!(h.pump().await.is_none());
        }
        assert!(matches!(h.pump().await.unwrap(), ClaimUpdate::Failed(_)));
        let task = h.claimer.task(&key).unwrap();
        assert_eq!(task.state, ClaimTaskState::Failed);
        assert_eq!(task.attempts, 3);

        // Not re-issued by later deltas
        h.claimer.reconcile(&h.catalog, now);
        assert_eq!(h.api.claim_count(&key), 3);

        // Dropped once the campaign expires
        h.catalog.merge(vec![], now);
        h.claimer.reconcile(&h.catalog, now);
        assert!(h.claimer.tasks().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_is_not_retried() {
        let mut h = harness();
        let now = Utc::now();
        let key = ClaimKey::new("x", "x-t0");
        h.api.script_claims(&key, vec![Err(MinerError::terminal_claim("404"))]);
        h.catalog.merge(vec![campaign("x", 50, &[50], &["a"])], now);
        h.claimer.reconcile(&h.catalog, now);
        assert!(matches!(h.pump().await.unwrap(), ClaimUpdate::Failed(_)));
        assert_eq!(h.claimer.task(&key).unwrap().attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_expiry_holds_task_until_resume() {
        let mut h = harness();
        let now = Utc::now();
        let key = ClaimKey::new("x", "x-t0");
        h.api.script_claims(&key, vec![Err(MinerError::AuthExpired("401".to_string()))]);
        h.catalog.merge(vec![campaign("x", 50, &[50], &["a"])], now);
        h.claimer.reconcile(&h.catalog, now);

        assert!(matches!(h.pump().await.unwrap(), ClaimUpdate::AuthExpired(_)));
        h.claimer.suspend();
        assert_eq!(h.claimer.task(&key).unwrap().state, ClaimTaskState::Pending);

        h.claimer.resume();
        assert!(matches!(h.pump().await.unwrap(), ClaimUpdate::Claimed(Some(_))));
        assert_eq!(h.api.claim_count(&key), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deltas_only_touch_changed_campaigns() {
        let mut h = harness();
        let now = Utc::now();
        h.catalog.merge(vec![campaign("x", 50, &[50], &["a"]), campaign("y", 10, &[50], &["b"])], now);

        // Only y moved, so only y is looked at
        let merge = h
            .catalog
            .merge(vec![campaign("x", 50, &[50], &["a"]), campaign("y", 50, &[50], &["b"])], now);
        assert_eq!(merge.deltas.len(), 1);
        h.claimer.apply_deltas(&h.catalog, &merge.deltas, now);
        let keys: Vec<ClaimKey> = h.claimer.tasks().into_iter().map(|t| t.key).collect();
        assert_eq!(keys, vec![ClaimKey::new("y", "y-t0")]);

        // The periodic full pass still finds x
        h.claimer.reconcile(&h.catalog, now);
        assert_eq!(h.claimer.tasks().len(), 2);

        // Expiry arrives as a delta and drops the task
        let merge = h.catalog.merge(vec![campaign("y", 50, &[50], &["b"])], now);
        h.claimer.apply_deltas(&h.catalog, &merge.deltas, now);
        assert!(h.claimer.task(&ClaimKey::new("x", "x-t0")).is_none());
        assert!(h.claimer.task(&ClaimKey::new("y", "y-t0")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_claim_off_keeps_tasks_pending() {
        let mut h = harness_with(MinerSettings {
            auto_claim: false,
            ..MinerSettings::default()
        });
        let now = Utc::now();
        let key = ClaimKey::new("x", "x-t0");
        h.catalog.merge(vec![campaign("x", 50, &[50], &["a"])], now);
        h.claimer.reconcile(&h.catalog, now);
        h.claimer.resume();

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(h.rx.try_recv().is_err());
        assert!(h.api.claim_log().is_empty());
        assert_eq!(h.claimer.task(&key).unwrap().state, ClaimTaskState::Pending);
        assert_eq!(h.claimer.task(&key).unwrap().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_retry_timers() {
        let mut h = harness();
        let now = Utc::now();
        let key = ClaimKey::new("x", "x-t0");
        h.api.script_claims(&key, vec![Err(MinerError::transient_claim("503"))]);
        h.catalog.merge(vec![campaign("x", 50, &[50], &["a"])], now);
        h.claimer.reconcile(&h.catalog, now);
        assert!(matches!(h.pump().await.unwrap(), ClaimUpdate::RetryScheduled(_)));

        h.claimer.shutdown().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(h.rx.try_recv().is_err());
        assert_eq!(h.api.claim_count(&key), 1);
    }
}
