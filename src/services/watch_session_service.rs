use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::error::MinerError;
use crate::models::mining::{MinerEvent, SessionReport, WatchSessionState};
use crate::models::settings::MinerSettings;
use crate::traits::{BrowserDriver, WatchHandle};

/// Timing knobs the worker needs, copied out of the settings at start.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimings {
    pub start_timeout: Duration,
    pub confirm_poll: Duration,
    pub health_check: Duration,
    pub stall_checks: u32,
    pub driver_call_timeout: Duration,
    pub stop_grace: Duration,
}

impl From<&MinerSettings> for SessionTimings {
    fn from(settings: &MinerSettings) -> Self {
        Self {
            start_timeout: settings.session_start_timeout(),
            confirm_poll: Duration::from_millis(settings.confirm_poll_millis.max(1)),
            health_check: settings.health_check(),
            stall_checks: settings.stall_checks.max(1),
            driver_call_timeout: settings.driver_call_timeout(),
            stop_grace: settings.stop_grace(),
        }
    }
}

struct Worker {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    /// Page opened by the worker, so it can still be closed after an abort
    page: Arc<Mutex<Option<WatchHandle>>>,
}

/// Owns the single watch session. Only the mining loop calls into this, so
/// state changes are serialized; the worker task reports back through
/// `MinerEvent::Session`.
pub struct WatchSessionController {
    driver: Arc<dyn BrowserDriver>,
    events: mpsc::Sender<MinerEvent>,
    timings: SessionTimings,
    state: WatchSessionState,
    channel: Option<String>,
    session_id: u64,
    last_error: Option<String>,
    worker: Option<Worker>,
}

impl WatchSessionController {
    pub fn new(driver: Arc<dyn BrowserDriver>, events: mpsc::Sender<MinerEvent>, timings: SessionTimings) -> Self {
        Self {
            driver,
            events,
            timings,
            state: WatchSessionState::Idle,
            channel: None,
            session_id: 0,
            last_error: None,
            worker: None,
        }
    }

    pub fn state(&self) -> WatchSessionState {
        self.state
    }

    pub fn channel(&self) -> Option<&str> {
        self.channel.as_deref()
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Begin watching `channel`. Only allowed from `Idle`.
    pub fn start(&mut self, channel: &str) -> Result<u64, MinerError> {
        if !self.state.is_idle() {
            return Err(MinerError::SessionBusy { state: self.state });
        }

        self.session_id += 1;
        let session_id = self.session_id;
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let page = Arc::new(Mutex::new(None));

        let task = tokio::spawn(run_worker(
            self.driver.clone(),
            channel.to_string(),
            session_id,
            self.timings,
            self.events.clone(),
            cancel_rx,
            page.clone(),
        ));

        info!("[WatchSession] ▶️ Starting session #{} on {}", session_id, channel);
        self.state = WatchSessionState::Starting;
        self.channel = Some(channel.to_string());
        self.last_error = None;
        self.worker = Some(Worker {
            cancel: Some(cancel_tx),
            task,
            page,
        });
        Ok(session_id)
    }

    /// Tear the session down. Idempotent; a no-op when idle.
    pub async fn stop(&mut self) {
        if self.state.is_idle() {
            return;
        }
        if self.state != WatchSessionState::Failed {
            self.state = WatchSessionState::Stopped;
        }

        if let Some(mut worker) = self.worker.take() {
            if let Some(cancel) = worker.cancel.take() {
                let _ = cancel.send(());
            }
            let grace = self.timings.stop_grace;
            match tokio::time::timeout(grace, &mut worker.task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("[WatchSession] Worker did not stop within {:?}, aborting", grace);
                    worker.task.abort();
                    let _ = (&mut worker.task).await;
                    // Closed inline so the next start cannot open a second page.
                    // A close_watch that hangs past the call timeout leaves the
                    // page to the driver's own cleanup.
                    let leftover = worker.page.lock().await.take();
                    if let Some(handle) = leftover {
                        let call_timeout = self.timings.driver_call_timeout;
                        match tokio::time::timeout(call_timeout, self.driver.close_watch(&handle)).await {
                            Ok(Ok(())) => debug!("[WatchSession] Closed leftover {:?}", handle),
                            Ok(Err(e)) => warn!("[WatchSession] close_watch failed for {:?}: {}", handle, e),
                            Err(_) => warn!("[WatchSession] close_watch timed out for {:?}", handle),
                        }
                    }
                }
            }
        }

        if let Some(channel) = self.channel.take() {
            info!("[WatchSession] ⏹️ Session #{} on {} stopped", self.session_id, channel);
        }
        self.state = WatchSessionState::Idle;
    }

    /// Apply a worker report. Returns the report when it belongs to the
    /// current session and changed the state, `None` when it was ignored.
    pub fn on_report(&mut self, session_id: u64, report: SessionReport) -> Option<SessionReport> {
        if session_id != self.session_id || self.worker.is_none() {
            debug!("[WatchSession] Ignoring stale report {:?} from session #{}", report, session_id);
            return None;
        }

        let next = match (&report, self.state) {
            (SessionReport::Confirmed, WatchSessionState::Starting) => WatchSessionState::Active,
            (SessionReport::StartFailed(_), WatchSessionState::Starting) => WatchSessionState::Failed,
            (SessionReport::Stalled, WatchSessionState::Active) => WatchSessionState::Degraded,
            (SessionReport::Recovered, WatchSessionState::Degraded) => WatchSessionState::Active,
            (SessionReport::Died(_), WatchSessionState::Starting)
            | (SessionReport::Died(_), WatchSessionState::Active)
            | (SessionReport::Died(_), WatchSessionState::Degraded) => WatchSessionState::Failed,
            _ => {
                debug!("[WatchSession] Report {:?} does not apply in state {:?}", report, self.state);
                return None;
            }
        };

        match &report {
            SessionReport::StartFailed(reason) | SessionReport::Died(reason) => {
                let channel = self.channel.clone().unwrap_or_default();
                let err = if matches!(report, SessionReport::StartFailed(_)) {
                    MinerError::SessionStart {
                        channel,
                        reason: reason.clone(),
                    }
                } else {
                    MinerError::Browser(reason.clone())
                };
                error!("[WatchSession] ❌ {}", err);
                self.last_error = Some(err.to_string());
            }
            SessionReport::Stalled => warn!("[WatchSession] ⚠️ Playback stalled on {:?}", self.channel),
            SessionReport::Confirmed => info!("[WatchSession] ✅ Playback confirmed on {:?}", self.channel),
            SessionReport::Recovered => info!("[WatchSession] Playback recovered on {:?}", self.channel),
        }

        self.state = next;
        Some(report)
    }
}

async fn run_worker(
    driver: Arc<dyn BrowserDriver>,
    channel: String,
    session_id: u64,
    timings: SessionTimings,
    events: mpsc::Sender<MinerEvent>,
    mut cancel: oneshot::Receiver<()>,
    page: Arc<Mutex<Option<WatchHandle>>>,
) {
    let report = |report: SessionReport| {
        let events = events.clone();
        async move {
            let _ = events.send(MinerEvent::Session { session_id, report }).await;
        }
    };

    let opened = tokio::select! {
        _ = &mut cancel => return,
        result = tokio::time::timeout(timings.driver_call_timeout, driver.open_watch(&channel)) => result,
    };
    let handle = match opened {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            report(SessionReport::StartFailed(e.to_string())).await;
            return;
        }
        Err(_) => {
            report(SessionReport::StartFailed(format!(
                "open_watch timed out after {:?}",
                timings.driver_call_timeout
            )))
            .await;
            return;
        }
    };
    *page.lock().await = Some(handle.clone());

    tokio::select! {
        _ = &mut cancel => {}
        _ = supervise(&*driver, &handle, timings, &report) => {}
    }

    match tokio::time::timeout(timings.driver_call_timeout, driver.close_watch(&handle)).await {
        Ok(Ok(())) => debug!("[WatchSession] Closed {:?}", handle),
        Ok(Err(e)) => warn!("[WatchSession] close_watch failed for {:?}: {}", handle, e),
        Err(_) => warn!("[WatchSession] close_watch timed out for {:?}", handle),
    }
    // Only released once closed; an abort before this point leaves it to stop()
    page.lock().await.take();
}

/// Confirm playback, then keep checking health until the page dies.
/// Returns when the session cannot continue.
async fn supervise<F, Fut>(driver: &dyn BrowserDriver, handle: &WatchHandle, timings: SessionTimings, report: &F)
where
    F: Fn(SessionReport) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let confirmed = tokio::time::timeout(timings.start_timeout, async {
        loop {
            match tokio::time::timeout(timings.driver_call_timeout, driver.is_stream_playing(handle)).await {
                Ok(Ok(true)) => return Ok(()),
                Ok(Ok(false)) => {}
                Ok(Err(e)) => return Err(e.to_string()),
                Err(_) => debug!("[WatchSession] Playback check timed out for {:?}", handle),
            }
            tokio::time::sleep(timings.confirm_poll).await;
        }
    })
    .await;

    match confirmed {
        Ok(Ok(())) => report(SessionReport::Confirmed).await,
        Ok(Err(reason)) => {
            report(SessionReport::StartFailed(reason)).await;
            return;
        }
        Err(_) => {
            report(SessionReport::StartFailed(format!(
                "playback not confirmed within {:?}",
                timings.start_timeout
            )))
            .await;
            return;
        }
    }

    let mut misses = 0u32;
    let mut stalled = false;
    let mut interval = tokio::time::interval(timings.health_check);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    interval.tick().await;

    loop {
        interval.tick().await;
        let playing = match tokio::time::timeout(timings.driver_call_timeout, driver.is_stream_playing(handle)).await {
            Ok(Ok(playing)) => playing,
            Ok(Err(e)) => {
                report(SessionReport::Died(e.to_string())).await;
                return;
            }
            // A hung check counts as a miss
            Err(_) => false,
        };

        if playing {
            misses = 0;
            if stalled {
                stalled = false;
                report(SessionReport::Recovered).await;
            }
        } else {
            misses += 1;
            if !stalled && misses >= timings.stall_checks {
                stalled = true;
                report(SessionReport::Stalled).await;
            }
        }
    }
}
