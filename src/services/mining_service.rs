use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::MinerError;
use crate::models::drops::{CampaignProgress, ClaimTaskState};
use crate::models::mining::{AuthState, MinerEvent, MinerStatus, SessionReport, WatchSessionState, WatchTarget};
use crate::models::queue::QueueProgress;
use crate::models::settings::MinerSettings;
use crate::services::campaign_catalog::CampaignCatalog;
use crate::services::channel_scheduler::{ChannelScheduler, Decision, ScheduleInput};
use crate::services::claim_service::{ClaimUpdate, RewardClaimer};
use crate::services::liveness_service::LivenessOracle;
use crate::services::session_context::SessionContext;
use crate::services::watch_session_service::{SessionTimings, WatchSessionController};
use crate::traits::{BrowserDriver, DropsApi, QueueStore, ThumbnailSink};

const EVENT_QUEUE: usize = 256;

/// Whether the pollers should be hitting the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    Suspended,
    Stopping,
}

/// Control surface of a running miner.
pub struct MiningHandle {
    events: mpsc::Sender<MinerEvent>,
    status: watch::Receiver<MinerStatus>,
    task: JoinHandle<()>,
}

impl MiningHandle {
    pub fn status(&self) -> watch::Receiver<MinerStatus> {
        self.status.clone()
    }

    /// Move away from the current channel now. It sits out the failover cooldown.
    pub async fn skip_current(&self) -> Result<(), MinerError> {
        self.events
            .send(MinerEvent::SkipCurrent)
            .await
            .map_err(|_| MinerError::Config("miner is not running".to_string()))
    }

    /// Stop the watch session, settle in-flight claims and join the pollers.
    pub async fn shutdown(self) {
        let _ = self.events.send(MinerEvent::Shutdown).await;
        if let Err(e) = self.task.await {
            error!("[Miner] Loop ended abnormally: {}", e);
        }
    }
}

/// The single serialized loop. It alone owns the catalog, the liveness view,
/// the scheduler, the watch session and the claimer; everything else talks
/// to it through `MinerEvent`s.
pub struct MiningService {
    settings: MinerSettings,
    request_timeout: Duration,
    api: Arc<dyn DropsApi>,
    session: Arc<SessionContext>,
    queue: Arc<dyn QueueStore>,
    thumbnails: Arc<dyn ThumbnailSink>,

    events_tx: mpsc::Sender<MinerEvent>,
    events_rx: mpsc::Receiver<MinerEvent>,
    status_tx: watch::Sender<MinerStatus>,
    run_state: watch::Sender<RunState>,
    liveness_ids: watch::Sender<Vec<String>>,

    catalog: CampaignCatalog,
    oracle: LivenessOracle,
    scheduler: ChannelScheduler,
    controller: WatchSessionController,
    claimer: RewardClaimer,
    queue_progress: QueueProgress,

    target: Option<WatchTarget>,
    auth: AuthState,
    /// Stalls reported for the current target
    degradations: u32,
    /// The current target already got its one restart after a stall
    restarted: bool,
    /// Start of the watch time not yet credited to the queue; set while Active
    accrual_mark: Option<Instant>,
    idle_since: Option<DateTime<Utc>>,
    catalog_error: Option<String>,
    liveness_error: Option<String>,
}

impl MiningService {
    pub fn new(
        settings: MinerSettings,
        request_timeout: Duration,
        api: Arc<dyn DropsApi>,
        driver: Arc<dyn BrowserDriver>,
        session: Arc<SessionContext>,
        queue: Arc<dyn QueueStore>,
        thumbnails: Arc<dyn ThumbnailSink>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (status_tx, _) = watch::channel(MinerStatus::default());
        let (run_state, _) = watch::channel(RunState::Suspended);
        let (liveness_ids, _) = watch::channel(Vec::new());

        let controller = WatchSessionController::new(driver, events_tx.clone(), SessionTimings::from(&settings));
        let claimer = RewardClaimer::new(api.clone(), events_tx.clone(), settings.clone(), request_timeout);
        let scheduler = ChannelScheduler::new(settings.failover_cooldown_ticks);

        Self {
            settings,
            request_timeout,
            api,
            session,
            queue,
            thumbnails,
            events_tx,
            events_rx,
            status_tx,
            run_state,
            liveness_ids,
            catalog: CampaignCatalog::new(),
            oracle: LivenessOracle::new(),
            scheduler,
            controller,
            claimer,
            queue_progress: QueueProgress::new(),
            target: None,
            auth: AuthState::Unknown,
            degradations: 0,
            restarted: false,
            accrual_mark: None,
            idle_since: None,
            catalog_error: None,
            liveness_error: None,
        }
    }

    /// Start the pollers and the loop.
    pub fn spawn(self) -> MiningHandle {
        let events = self.events_tx.clone();
        let status = self.status_tx.subscribe();
        let task = tokio::spawn(self.run());
        MiningHandle { events, status, task }
    }

    async fn run(mut self) {
        info!("[Miner] ⛏️ Mining loop starting");
        let pollers = vec![
            tokio::spawn(catalog_poller(
                self.api.clone(),
                self.settings.clone(),
                self.request_timeout,
                self.run_state.subscribe(),
                self.events_tx.clone(),
            )),
            tokio::spawn(liveness_poller(
                self.api.clone(),
                self.settings.clone(),
                self.request_timeout,
                self.run_state.subscribe(),
                self.liveness_ids.subscribe(),
                self.events_tx.clone(),
            )),
        ];

        self.idle_since = Some(Utc::now());
        match self.session.refresh().await {
            Ok(true) => self.set_authenticated(),
            Ok(false) => {
                warn!("[Miner] Not logged in, waiting for credentials");
                self.set_suspended();
            }
            Err(e) => {
                error!("[Miner] Could not read session store: {}", e);
                self.set_suspended();
            }
        }
        self.publish_status();

        let mut tick = tokio::time::interval(self.settings.tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut auth_recheck = tokio::time::interval(Duration::from_secs(self.settings.auth_recheck_secs.max(1)));
        auth_recheck.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut queue_changes = self.queue.subscribe();
        let mut queue_open = true;

        loop {
            tokio::select! {
                Some(event) = self.events_rx.recv() => {
                    if matches!(event, MinerEvent::Shutdown) {
                        break;
                    }
                    self.handle_event(event).await;
                }
                _ = tick.tick() => self.on_tick().await,
                _ = auth_recheck.tick() => self.recheck_auth().await,
                changed = queue_changes.changed(), if queue_open => {
                    if changed.is_ok() {
                        self.recompute("queue changed").await;
                    } else {
                        queue_open = false;
                    }
                }
            }
            self.publish_status();
        }

        self.shutdown(pollers).await;
        self.publish_status();
        info!("[Miner] Mining loop stopped");
    }

    async fn handle_event(&mut self, event: MinerEvent) {
        let now = Utc::now();
        let budget_spent = self.accrue_watch_time();
        match event {
            MinerEvent::CatalogFetched(Ok(campaigns)) => {
                self.catalog_error = None;
                let merge = self.catalog.merge(campaigns, now);
                for (reward_id, image_url) in merge.new_rewards {
                    let sink = self.thumbnails.clone();
                    tokio::spawn(async move { sink.store(&reward_id, &image_url).await });
                }
                self.sync_channels(now);
                self.claimer.apply_deltas(&self.catalog, &merge.deltas, now);
                self.recompute("catalog refreshed").await;
            }
            MinerEvent::CatalogFetched(Err(err)) => {
                if err.is_auth_expired() {
                    self.on_auth_expired(err).await;
                } else {
                    warn!("[Miner] Campaign refresh failed, keeping stale catalog: {}", err);
                    self.catalog_error = Some(err.to_string());
                }
            }
            MinerEvent::LivenessFetched(Ok(report)) => {
                self.liveness_error = None;
                let change = self.oracle.apply(&report, now);
                let target_offline = self
                    .target
                    .as_ref()
                    .is_some_and(|t| change.went_offline.contains(&t.channel));
                if target_offline {
                    self.fail_over("target went offline").await;
                } else if change.changed {
                    self.recompute("liveness changed").await;
                }
            }
            MinerEvent::LivenessFetched(Err(err)) => {
                if err.is_auth_expired() {
                    self.on_auth_expired(err).await;
                } else {
                    warn!("[Miner] Liveness check failed, keeping last known state: {}", err);
                    self.liveness_error = Some(err.to_string());
                }
            }
            MinerEvent::Session { session_id, report } => match self.controller.on_report(session_id, report) {
                Some(SessionReport::Stalled) => {
                    self.degradations += 1;
                    if self.degradations >= 2 {
                        self.fail_over("repeated degradation").await;
                    }
                }
                Some(SessionReport::StartFailed(_)) | Some(SessionReport::Died(_)) => {
                    self.fail_over("watch session failed").await;
                }
                Some(SessionReport::Confirmed) => {
                    self.accrual_mark = Some(Instant::now());
                    // A switch held back while starting can happen now
                    self.recompute("session confirmed").await;
                }
                Some(SessionReport::Recovered) => {
                    self.accrual_mark = Some(Instant::now());
                    self.degradations = 0;
                    self.restarted = false;
                }
                None => {}
            },
            MinerEvent::ClaimFinished { key, result } => {
                match self.claimer.on_claim_finished(&key, result, &mut self.catalog, now) {
                    ClaimUpdate::Claimed(Some(reward)) => {
                        info!("[Miner] 🎉 Claimed {} from {}", reward.reward_name, reward.campaign_name);
                        self.sync_channels(now);
                        self.recompute("reward claimed").await;
                    }
                    ClaimUpdate::Claimed(None) => {
                        self.sync_channels(now);
                    }
                    ClaimUpdate::AuthExpired(err) => self.on_auth_expired(err).await,
                    ClaimUpdate::Failed(_) | ClaimUpdate::RetryScheduled(_) | ClaimUpdate::Ignored => {}
                }
            }
            MinerEvent::ClaimRetryDue(key) => self.claimer.on_retry_due(&key),
            MinerEvent::SkipCurrent => {
                if self.target.is_some() {
                    self.fail_over("skipped by user").await;
                } else {
                    debug!("[Miner] Nothing to skip");
                }
            }
            MinerEvent::Shutdown => {}
        }
        if budget_spent {
            self.recompute("queue budget spent").await;
        }
    }

    async fn on_tick(&mut self) {
        self.accrue_watch_time();
        self.scheduler.on_tick();
        if self.auth != AuthState::Authenticated {
            return;
        }
        let now = Utc::now();
        self.claimer.reconcile(&self.catalog, now);

        // One restart per target after a stall, then it has to fail over
        if self.controller.state() == WatchSessionState::Degraded && !self.restarted {
            if let Some(target) = self.target.clone() {
                info!("[Miner] 🔄 Restarting stalled session on {}", target.channel);
                self.restarted = true;
                self.controller.stop().await;
                if let Err(e) = self.controller.start(&target.channel) {
                    error!("[Miner] Could not restart session: {}", e);
                }
                return;
            }
        }

        self.recompute("tick").await;
    }

    async fn recompute(&mut self, reason: &str) {
        if self.auth != AuthState::Authenticated {
            return;
        }
        let now = Utc::now();
        let queue = self.queue.entries();
        let input = ScheduleInput {
            catalog: &self.catalog,
            oracle: &self.oracle,
            queue: &queue,
            queue_progress: &self.queue_progress,
            preferred_games: &self.settings.preferred_games,
            now,
        };
        let starting = self.controller.state() == WatchSessionState::Starting;
        let decision = self.scheduler.recompute(self.target.as_ref(), &input, starting);
        debug!("[Miner] Recompute ({}): {:?}", reason, decision);

        match decision {
            Decision::Keep => {
                if self.controller.state().is_idle() {
                    if let Some(target) = self.target.clone() {
                        self.start_watching(target).await;
                    }
                }
            }
            Decision::Retarget(candidate) => {
                if let Some(target) = self.target.as_mut() {
                    info!(
                        "[Miner] {} now counts toward {}",
                        candidate.channel, candidate.campaign_name
                    );
                    target.campaign_id = candidate.campaign_id;
                    target.campaign_name = candidate.campaign_name;
                }
                if self.controller.state().is_idle() {
                    if let Some(target) = self.target.clone() {
                        self.start_watching(target).await;
                    }
                }
            }
            Decision::Switch(candidate) => {
                self.controller.stop().await;
                self.start_watching(candidate.to_target(now)).await;
            }
            Decision::Clear => {
                self.controller.stop().await;
                if self.target.take().is_some() {
                    info!("[Miner] 💤 No channel qualifies, idling");
                }
                self.idle_since.get_or_insert(now);
            }
        }
    }

    async fn start_watching(&mut self, target: WatchTarget) {
        match self.controller.start(&target.channel) {
            Ok(_) => {
                info!("[Miner] 👀 Watching {} for {}", target.channel, target.campaign_name);
                self.degradations = 0;
                self.restarted = false;
                self.idle_since = None;
                self.target = Some(target);
            }
            Err(e) => {
                error!("[Miner] Could not start watching {}: {}", target.channel, e);
                self.target = None;
            }
        }
    }

    /// Put the current target on cooldown, stop its session, pick the next.
    async fn fail_over(&mut self, reason: &str) {
        if let Some(target) = self.target.take() {
            warn!("[Miner] Leaving {} ({})", target.channel, reason);
            self.scheduler.exclude(&target.channel);
        }
        self.controller.stop().await;
        self.idle_since.get_or_insert(Utc::now());
        self.recompute(reason).await;
    }

    /// Credit Active time since the last mark to the queue entry being
    /// served. Returns true when that entry's budget ran out.
    fn accrue_watch_time(&mut self) -> bool {
        let Some(mark) = self.accrual_mark else {
            return false;
        };
        if self.controller.state() != WatchSessionState::Active {
            self.accrual_mark = None;
            return false;
        }
        let Some(target) = self.target.as_ref() else {
            self.accrual_mark = None;
            return false;
        };
        let secs = Instant::now().saturating_duration_since(mark).as_secs();
        if secs == 0 {
            return false;
        }
        self.accrual_mark = Some(mark + Duration::from_secs(secs));
        let entries = self.queue.entries();
        let spent = self
            .queue_progress
            .credit(&entries, &target.campaign_id, &target.channel, secs);
        if spent {
            info!("[Miner] ⌛ Queue time for {} used up", target.channel);
        }
        spent
    }

    fn sync_channels(&mut self, now: DateTime<Utc>) {
        self.oracle.sync_membership(&self.catalog, now);
        let ids = self.oracle.channel_ids();
        self.liveness_ids.send_if_modified(|current| {
            if *current == ids {
                false
            } else {
                *current = ids;
                true
            }
        });
    }

    async fn on_auth_expired(&mut self, err: MinerError) {
        if self.auth == AuthState::Suspended {
            return;
        }
        warn!("[Miner] 🔒 {}; pausing until new credentials show up", err);
        self.session.invalidate().await;
        self.controller.stop().await;
        if self.target.take().is_some() {
            self.idle_since = Some(Utc::now());
        }
        self.set_suspended();
    }

    async fn recheck_auth(&mut self) {
        if self.auth != AuthState::Suspended {
            return;
        }
        match self.session.refresh().await {
            Ok(true) => {
                info!("[Miner] 🔓 New credentials found, resuming");
                self.set_authenticated();
                self.recompute("credentials restored").await;
            }
            Ok(false) => debug!("[Miner] Still waiting for credentials"),
            Err(e) => warn!("[Miner] Session store check failed: {}", e),
        }
    }

    fn set_authenticated(&mut self) {
        self.auth = AuthState::Authenticated;
        self.claimer.resume();
        self.run_state.send_replace(RunState::Running);
    }

    fn set_suspended(&mut self) {
        self.auth = AuthState::Suspended;
        self.claimer.suspend();
        self.run_state.send_replace(RunState::Suspended);
    }

    fn warnings(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.auth == AuthState::Suspended {
            warnings.push("Not logged in or login expired; log in to Kick again to resume mining".to_string());
        }
        if let Some(err) = &self.catalog_error {
            warnings.push(format!("Campaign refresh failing: {}", err));
        }
        if let Some(err) = &self.liveness_error {
            warnings.push(format!("Liveness checks failing: {}", err));
        }
        if let Some(since) = self.idle_since {
            let idle_secs = (now - since).num_seconds().max(0) as u64;
            if self.auth == AuthState::Authenticated && idle_secs >= self.settings.idle_warning_secs {
                warnings.push(format!(
                    "No channel has qualified for {} minutes; check the queue and campaign channels",
                    idle_secs / 60
                ));
            }
        }
        if let Some(err) = self.controller.last_error() {
            warnings.push(format!("Last watch session error: {}", err));
        }
        for task in self.claimer.tasks() {
            if task.state == ClaimTaskState::Failed {
                warnings.push(format!(
                    "Could not claim {}: {}",
                    task.reward_name,
                    task.last_error.as_deref().unwrap_or("unknown error")
                ));
            }
        }
        warnings
    }

    fn publish_status(&self) {
        let now = Utc::now();
        let status = MinerStatus {
            target: self.target.clone(),
            session_state: self.controller.state(),
            auth: self.auth,
            campaigns: self.catalog.campaigns().map(CampaignProgress::from).collect(),
            pending_claims: self.claimer.tasks(),
            claimed: self.claimer.history().to_vec(),
            queue: self.queue_progress.snapshot(&self.queue.entries()),
            idle_since: self.idle_since,
            warnings: self.warnings(now),
            last_update: Some(now),
        };
        self.status_tx.send_replace(status);
    }

    async fn shutdown(&mut self, pollers: Vec<JoinHandle<()>>) {
        info!("[Miner] Shutting down");
        self.run_state.send_replace(RunState::Stopping);
        self.controller.stop().await;
        self.target = None;

        // Keep draining so nobody blocks on a full queue while we wait
        let rx = &mut self.events_rx;
        let joined = futures::future::join_all(pollers);
        tokio::pin!(joined);
        loop {
            tokio::select! {
                _ = &mut joined => break,
                _ = rx.recv() => {}
            }
        }

        let settled = self.claimer.shutdown();
        tokio::pin!(settled);
        loop {
            tokio::select! {
                _ = &mut settled => break,
                _ = rx.recv() => {}
            }
        }
    }
}

/// Waits until the miner is running. False once it is stopping.
async fn wait_until_running(state: &mut watch::Receiver<RunState>) -> bool {
    loop {
        match *state.borrow_and_update() {
            RunState::Running => return true,
            RunState::Stopping => return false,
            RunState::Suspended => {}
        }
        if state.changed().await.is_err() {
            return false;
        }
    }
}

/// Sleep for `delay`, waking early on a run state change. False once stopping.
async fn pause(delay: Duration, state: &mut watch::Receiver<RunState>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        changed = state.changed() => changed.is_ok() && *state.borrow() != RunState::Stopping,
    }
}

async fn catalog_poller(
    api: Arc<dyn DropsApi>,
    settings: MinerSettings,
    timeout: Duration,
    mut state: watch::Receiver<RunState>,
    events: mpsc::Sender<MinerEvent>,
) {
    let interval = settings.catalog_refresh();
    let mut failures = 0u32;
    while wait_until_running(&mut state).await {
        let result = match tokio::time::timeout(timeout, api.fetch_campaigns()).await {
            Ok(result) => result,
            Err(_) => Err(MinerError::fetch_timeout("campaign fetch", timeout)),
        };
        let delay = if result.is_ok() {
            failures = 0;
            interval
        } else {
            failures += 1;
            settings.fetch_backoff(failures, interval)
        };
        if events.send(MinerEvent::CatalogFetched(result)).await.is_err() {
            return;
        }
        if !pause(delay, &mut state).await {
            return;
        }
    }
    debug!("[Miner] Catalog poller stopped");
}

async fn liveness_poller(
    api: Arc<dyn DropsApi>,
    settings: MinerSettings,
    timeout: Duration,
    mut state: watch::Receiver<RunState>,
    mut ids: watch::Receiver<Vec<String>>,
    events: mpsc::Sender<MinerEvent>,
) {
    let interval = settings.liveness_poll();
    let mut failures = 0u32;
    while wait_until_running(&mut state).await {
        let channel_ids = ids.borrow_and_update().clone();
        let mut delay = interval;
        if !channel_ids.is_empty() {
            let result = LivenessOracle::query(api.as_ref(), &channel_ids, timeout).await;
            if result.is_ok() {
                failures = 0;
            } else {
                failures += 1;
                delay = settings.fetch_backoff(failures, interval);
            }
            if events.send(MinerEvent::LivenessFetched(result)).await.is_err() {
                return;
            }
        }

        // New channels get checked right away
        tokio::select! {
            proceed = pause(delay, &mut state) => {
                if !proceed {
                    return;
                }
            }
            changed = ids.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
    debug!("[Miner] Liveness poller stopped");
}
