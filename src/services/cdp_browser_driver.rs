use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

use crate::error::MinerError;
use crate::models::settings::BrowserSettings;
use crate::services::cookie_jar_service::get_app_data_dir;
use crate::services::session_context::SessionContext;
use crate::traits::{BrowserDriver, WatchHandle};

const BROWSER_CANDIDATES: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
    "chrome",
    "msedge",
    "microsoft-edge",
];

#[cfg(target_os = "windows")]
const WELL_KNOWN_PATHS: &[&str] = &[
    r"C:\Program Files\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
];

#[cfg(target_os = "macos")]
const WELL_KNOWN_PATHS: &[&str] = &[
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
];

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
const WELL_KNOWN_PATHS: &[&str] = &["/usr/bin/google-chrome", "/usr/bin/chromium", "/snap/bin/chromium"];

/// Mutes every video, nudges it to play and optionally hides it.
const TWEAK_SCRIPT: &str = r#"
(() => {
  const videos = Array.from(document.querySelectorAll("video"));
  for (const v of videos) {
    v.muted = true;
    try { v.volume = 0; } catch (_) {}
    try { v.play().catch(() => {}); } catch (_) {}
    if (__HIDE__) {
      v.style.visibility = "hidden";
      v.style.opacity = "0";
    }
  }
  return videos.length;
})()
"#;

const PLAYBACK_SAMPLE: &str = r#"
(() => {
  const v = document.querySelector("video");
  if (!v) return { present: false, paused: true, current_time: 0, ready_state: 0 };
  return { present: true, paused: v.paused, current_time: v.currentTime, ready_state: v.readyState };
})()
"#;

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct PlaybackSample {
    pub present: bool,
    pub paused: bool,
    pub current_time: f64,
    pub ready_state: u8,
}

/// Playing means a video element exists, is not paused, has data and its
/// clock moved since the previous sample.
pub fn playback_advanced(sample: &PlaybackSample, previous_time: Option<f64>) -> bool {
    if !sample.present || sample.paused || sample.ready_state < 2 {
        return false;
    }
    match previous_time {
        Some(previous) => sample.current_time > previous,
        None => sample.current_time > 0.0,
    }
}

/// Command line for a Chromium started only for watching.
pub fn launch_args(settings: &BrowserSettings, port: u16, profile_dir: &Path) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", port),
        format!("--user-data-dir={}", profile_dir.display()),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        "--mute-audio".to_string(),
        "--autoplay-policy=no-user-gesture-required".to_string(),
        "--disable-background-timer-throttling".to_string(),
        "--disable-renderer-backgrounding".to_string(),
        "--disable-backgrounding-occluded-windows".to_string(),
    ];
    if settings.headless {
        args.push("--headless=new".to_string());
        args.push("--window-size=1280,720".to_string());
    }
    args.extend(settings.extra_args.iter().cloned());
    args.push("about:blank".to_string());
    args
}

fn resolve_binary(settings: &BrowserSettings) -> Result<PathBuf> {
    if let Some(binary) = &settings.binary {
        return Ok(binary.clone());
    }
    if let Some(path_var) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path_var) {
            for name in BROWSER_CANDIDATES {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Ok(candidate);
                }
                let exe = dir.join(format!("{}.exe", name));
                if exe.is_file() {
                    return Ok(exe);
                }
            }
        }
    }
    WELL_KNOWN_PATHS
        .iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
        .ok_or_else(|| anyhow::anyhow!("No Chrome/Chromium/Edge binary found; set browser.binary"))
}

/// Random debugging port in a quiet range, falling back to an OS-assigned one.
fn free_local_port() -> Result<u16> {
    for _ in 0..20 {
        let port = rand::rng().random_range(30000..40000);
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

type CdpSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One DevTools websocket. Commands are answered in order of ids; events
/// in between are dropped.
pub struct CdpConnection {
    socket: CdpSocket,
    next_id: u64,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (socket, _) = connect_async(ws_url)
            .await
            .with_context(|| format!("connecting to {}", ws_url))?;
        Ok(Self { socket, next_id: 0 })
    }

    pub async fn call(&mut self, method: &str, params: Value) -> Result<Value> {
        self.next_id += 1;
        let id = self.next_id;
        let request = json!({ "id": id, "method": method, "params": params });
        self.socket.send(Message::text(request.to_string())).await?;

        while let Some(message) = self.socket.next().await {
            match message? {
                Message::Text(text) => {
                    let reply: Value = serde_json::from_str(&text)?;
                    if reply.get("id").and_then(Value::as_u64) != Some(id) {
                        continue;
                    }
                    if let Some(error) = reply.get("error") {
                        return Err(anyhow::anyhow!("{} failed: {}", method, error));
                    }
                    return Ok(reply.get("result").cloned().unwrap_or(Value::Null));
                }
                Message::Ping(data) => self.socket.send(Message::Pong(data)).await?,
                Message::Close(_) => break,
                _ => {}
            }
        }
        Err(anyhow::anyhow!("DevTools connection closed during {}", method))
    }

    /// Evaluate `expression` in the page and return its value.
    pub async fn evaluate(&mut self, expression: &str) -> Result<Value> {
        let result = self
            .call(
                "Runtime.evaluate",
                json!({ "expression": expression, "returnByValue": true, "awaitPromise": false }),
            )
            .await?;
        if let Some(details) = result.get("exceptionDetails") {
            return Err(anyhow::anyhow!("script threw: {}", details));
        }
        Ok(result
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn close(mut self) {
        let _ = self.socket.close(None).await;
    }
}

#[derive(Debug, Deserialize)]
struct TargetInfo {
    id: String,
    #[serde(rename = "webSocketDebuggerUrl")]
    ws_url: String,
}

struct Page {
    conn: CdpConnection,
    last_time: Option<f64>,
}

struct BrowserProcess {
    child: Child,
    port: u16,
}

/// `BrowserDriver` backed by a Chromium process driven over the DevTools
/// protocol. The process is started on first use and reused for every
/// subsequent watch page.
pub struct CdpBrowserDriver {
    settings: BrowserSettings,
    session: Arc<SessionContext>,
    http: reqwest::Client,
    browser: Mutex<Option<BrowserProcess>>,
    pages: Mutex<HashMap<String, Page>>,
}

impl CdpBrowserDriver {
    pub fn new(settings: BrowserSettings, session: Arc<SessionContext>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            settings,
            session,
            http,
            browser: Mutex::new(None),
            pages: Mutex::new(HashMap::new()),
        }
    }

    fn profile_dir(&self) -> Result<PathBuf> {
        match &self.settings.profile_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(get_app_data_dir()?.join("browser-profile")),
        }
    }

    /// Port of a running browser, launching one if needed.
    async fn ensure_browser(&self) -> Result<u16> {
        let mut guard = self.browser.lock().await;
        if let Some(browser) = guard.as_mut() {
            match browser.child.try_wait() {
                Ok(None) => return Ok(browser.port),
                Ok(Some(status)) => warn!("[Cdp] Browser exited ({}), relaunching", status),
                Err(e) => warn!("[Cdp] Could not poll browser process: {}", e),
            }
            self.pages.lock().await.clear();
        }

        let binary = resolve_binary(&self.settings)?;
        let port = free_local_port()?;
        let profile = self.profile_dir()?;
        std::fs::create_dir_all(&profile).with_context(|| format!("creating {:?}", profile))?;

        info!("[Cdp] 🚀 Launching {:?} on port {}", binary, port);
        let child = Command::new(&binary)
            .args(launch_args(&self.settings, port, &profile))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning {:?}", binary))?;

        let version_url = format!("http://127.0.0.1:{}/json/version", port);
        let mut ready = false;
        for _ in 0..60 {
            if let Ok(response) = self.http.get(&version_url).send().await {
                if response.status().is_success() {
                    ready = true;
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }
        if !ready {
            return Err(anyhow::anyhow!("DevTools endpoint on port {} never came up", port));
        }

        *guard = Some(BrowserProcess { child, port });
        Ok(port)
    }

    async fn new_target(&self, port: u16) -> Result<TargetInfo> {
        let url = format!("http://127.0.0.1:{}/json/new?about:blank", port);
        let target: TargetInfo = self
            .http
            .put(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("parsing /json/new response")?;
        Ok(target)
    }

    async fn close_target(&self, target_id: &str) {
        let port = match self.browser.lock().await.as_ref() {
            Some(browser) => browser.port,
            None => return,
        };
        let url = format!("http://127.0.0.1:{}/json/close/{}", port, target_id);
        if let Err(e) = self.http.get(&url).send().await {
            debug!("[Cdp] Closing target {} failed: {}", target_id, e);
        }
    }

    async fn prime_cookies(&self, conn: &mut CdpConnection) -> Result<()> {
        let Some(credentials) = self.session.credentials().await else {
            warn!("[Cdp] No credentials to prime, watching anonymously");
            return Ok(());
        };
        conn.call("Network.enable", json!({})).await?;
        for (name, value) in &credentials.cookies {
            conn.call(
                "Network.setCookie",
                json!({
                    "name": name,
                    "value": value,
                    "domain": ".kick.com",
                    "path": "/",
                    "secure": true,
                }),
            )
            .await?;
        }
        debug!("[Cdp] Primed {} cookies", credentials.cookies.len());
        Ok(())
    }

    async fn open_page(&self, channel_id: &str) -> Result<WatchHandle> {
        let port = self.ensure_browser().await?;
        let target = self.new_target(port).await?;
        let mut conn = CdpConnection::connect(&target.ws_url).await?;

        self.prime_cookies(&mut conn).await?;
        let url = format!("https://kick.com/{}", channel_id);
        conn.call("Page.enable", json!({})).await?;
        conn.call("Page.navigate", json!({ "url": url })).await?;

        let handle = WatchHandle {
            id: target.id,
            channel: channel_id.to_string(),
        };
        info!("[Cdp] 📺 Opened {} as {:?}", url, handle);
        self.pages.lock().await.insert(
            handle.id.clone(),
            Page {
                conn,
                last_time: None,
            },
        );
        Ok(handle)
    }

    async fn sample_playback(&self, handle: &WatchHandle) -> Result<bool> {
        let mut pages = self.pages.lock().await;
        let page = pages
            .get_mut(&handle.id)
            .ok_or_else(|| anyhow::anyhow!("page {} is not open", handle.id))?;

        let tweak = TWEAK_SCRIPT.replace("__HIDE__", if self.settings.hide_player { "true" } else { "false" });
        page.conn.evaluate(&tweak).await?;

        let sample: PlaybackSample = serde_json::from_value(page.conn.evaluate(PLAYBACK_SAMPLE).await?)
            .context("unexpected playback sample")?;
        let playing = playback_advanced(&sample, page.last_time);
        if sample.present {
            page.last_time = Some(sample.current_time);
        }
        Ok(playing)
    }

    /// Kill the browser process, if one is running.
    pub async fn shutdown(&self) {
        let pages: Vec<(String, Page)> = self.pages.lock().await.drain().collect();
        for (_, page) in pages {
            page.conn.close().await;
        }
        if let Some(mut browser) = self.browser.lock().await.take() {
            info!("[Cdp] Shutting down browser");
            if let Err(e) = browser.child.kill().await {
                warn!("[Cdp] Failed to kill browser: {}", e);
            }
        }
    }
}

#[async_trait]
impl BrowserDriver for CdpBrowserDriver {
    async fn open_watch(&self, channel_id: &str) -> Result<WatchHandle, MinerError> {
        self.open_page(channel_id)
            .await
            .map_err(|e| MinerError::Browser(format!("opening {}: {:#}", channel_id, e)))
    }

    async fn close_watch(&self, handle: &WatchHandle) -> Result<(), MinerError> {
        let page = self.pages.lock().await.remove(&handle.id);
        if let Some(page) = page {
            page.conn.close().await;
        }
        self.close_target(&handle.id).await;
        Ok(())
    }

    async fn is_stream_playing(&self, handle: &WatchHandle) -> Result<bool, MinerError> {
        self.sample_playback(handle)
            .await
            .map_err(|e| MinerError::Browser(format!("{:?}: {:#}", handle, e)))
    }
}
