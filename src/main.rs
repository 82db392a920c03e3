use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use kick_drops_miner::models::mining::MinerStatus;
use kick_drops_miner::models::settings::Settings;
use kick_drops_miner::services::cdp_browser_driver::CdpBrowserDriver;
use kick_drops_miner::services::cookie_jar_service::{get_app_data_dir, CookieJarService};
use kick_drops_miner::services::diagnostic_logger;
use kick_drops_miner::services::kick_api_client::KickApiClient;
use kick_drops_miner::services::mining_service::MiningService;
use kick_drops_miner::services::queue_service::MemoryQueueStore;
use kick_drops_miner::services::session_context::SessionContext;
use kick_drops_miner::services::thumbnail_cache_service::ThumbnailCacheService;
use kick_drops_miner::traits::{NoopThumbnailSink, ThumbnailSink};

#[derive(Parser, Debug)]
#[command(version, about = "Watches Kick drop campaigns and claims the rewards")]
struct Args {
    /// Settings file (defaults to settings.json in the app data directory)
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Show debug/info logs regardless of the settings file
    #[arg(long)]
    diagnostics: bool,

    /// Print the default settings as JSON and exit
    #[arg(long)]
    print_default_settings: bool,
}

/// Load settings, falling back to defaults when the file does not exist
fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }
    let json = std::fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    serde_json::from_str(&json).with_context(|| format!("parsing {:?}", path))
}

fn log_status_change(previous: &MinerStatus, current: &MinerStatus) {
    if previous.target != current.target || previous.session_state != current.session_state {
        match &current.target {
            Some(target) => info!(
                "📺 {} for {} ({:?})",
                target.channel, target.campaign_name, current.session_state
            ),
            None => info!("💤 Idle ({:?})", current.session_state),
        }
    }
    if previous.auth != current.auth {
        info!("🔑 Auth: {:?}", current.auth);
    }
    for reward in current.claimed.iter().skip(previous.claimed.len()) {
        info!("🎁 Claimed {} ({})", reward.reward_name, reward.campaign_name);
    }
    for warning in current.warnings.iter().filter(|w| !previous.warnings.contains(w)) {
        warn!("⚠️ {}", warning);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_default_settings {
        println!("{}", serde_json::to_string_pretty(&Settings::default())?);
        return Ok(());
    }

    let settings_path = match args.settings {
        Some(path) => path,
        None => get_app_data_dir()?.join("settings.json"),
    };
    let settings = load_settings(&settings_path)?;
    diagnostic_logger::init_logging(args.diagnostics || settings.diagnostics_enabled);
    info!("Using settings from {:?}", settings_path);

    let cookie_jar = Arc::new(CookieJarService::new_default()?);
    info!("Cookie jar: {:?}", cookie_jar.file_path());
    let session = Arc::new(SessionContext::new(cookie_jar));

    let api = Arc::new(KickApiClient::new(settings.api.clone(), session.clone())?);
    let driver = Arc::new(CdpBrowserDriver::new(settings.browser.clone(), session.clone()));
    let queue = Arc::new(MemoryQueueStore::new(settings.queue.clone()));
    let thumbnails: Arc<dyn ThumbnailSink> = match ThumbnailCacheService::new_default() {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            warn!("Reward image cache disabled: {}", e);
            Arc::new(NoopThumbnailSink)
        }
    };

    let service = MiningService::new(
        settings.miner.clone(),
        settings.api.request_timeout(),
        api,
        driver.clone(),
        session,
        queue,
        thumbnails,
    );
    let handle = service.spawn();

    let mut status = handle.status();
    let status_logger = tokio::spawn(async move {
        let mut previous = status.borrow_and_update().clone();
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            log_status_change(&previous, &current);
            previous = current;
        }
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Ctrl-C received, shutting down");

    handle.shutdown().await;
    status_logger.abort();
    driver.shutdown().await;
    Ok(())
}
