//! Browser session lifecycle
//!
//! Handles launching (or attaching to) a Chrome/Chromium instance and owning
//! it until `stop()`. Three strategies:
//!
//!   Standard: launch a fresh browser, no extras.
//!   Stealth:  launch with anti-detection flags and script patches.
//!   Cdp:      attach to an already-running browser via DevTools; the
//!             external process is never terminated on stop.
//!
//! `BrowserSession::with` is the scoped form: it guarantees `stop()` runs on
//! every exit path, including errors raised by the caller's closure.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetLocaleOverrideParams, SetTimezoneOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, CookieSameSite, TimeSinceEpoch};
use chromiumoxide::cdp::browser_protocol::page::AddScriptToEvaluateOnNewDocumentParams;
use chromiumoxide::cdp::js_protocol::runtime::EvaluateParams;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Handler, Page};
use futures::StreamExt;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use super::config::{BrowserSessionConfig, LaunchMode};
use super::state::{OriginState, StorageEntry, StorageState, StoredCookie};
use super::BrowserError;

/// Extra launch flags applied in stealth mode on top of the configured args.
const STEALTH_ARGS: &[&str] = &[
    "--disable-blink-features=AutomationControlled",
    "--disable-infobars",
    "--no-default-browser-check",
    "--disable-site-isolation-trials",
];

/// Script injected before any page script runs in stealth mode. Masks the
/// automation markers that commercial bot detection checks first.
const STEALTH_INIT_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
window.chrome = window.chrome || { runtime: {} };
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3, 4, 5] });
if (window.navigator.permissions && window.navigator.permissions.query) {
  const originalQuery = window.navigator.permissions.query.bind(window.navigator.permissions);
  window.navigator.permissions.query = (parameters) =>
    parameters && parameters.name === 'notifications'
      ? Promise.resolve({ state: Notification.permission })
      : originalQuery(parameters);
}
"#;

/// Expression that dumps the current origin's localStorage as an object.
const LOCAL_STORAGE_DUMP: &str = r#"(() => {
  const out = {};
  for (let i = 0; i < localStorage.length; i += 1) {
    const key = localStorage.key(i);
    out[key] = localStorage.getItem(key);
  }
  return out;
})()"#;

/// Live engine resources held between `start()` and `stop()`.
struct EngineHandle {
    browser: Browser,
    pump: JoinHandle<()>,
    alive: Arc<AtomicBool>,
    /// Scripts re-registered on every page this session creates.
    init_scripts: Vec<String>,
}

enum LifecycleState {
    Created,
    Started(EngineHandle),
    Stopped,
}

/// A browser session for automation.
///
/// Owns the engine instance exclusively: created on `start()`, released on
/// `stop()`. `stop()` is idempotent; `start()` on a running session fails.
pub struct BrowserSession {
    config: BrowserSessionConfig,
    lifecycle: RwLock<LifecycleState>,
}

impl BrowserSession {
    /// Create a session in the `Created` state. Nothing is launched yet.
    pub fn new(config: BrowserSessionConfig) -> Self {
        Self {
            config,
            lifecycle: RwLock::new(LifecycleState::Created),
        }
    }

    /// The configuration this session was created with.
    pub fn config(&self) -> &BrowserSessionConfig {
        &self.config
    }

    /// Run `f` against a started session, guaranteeing `stop()` on every exit
    /// path.
    pub async fn with<T, F, Fut>(config: BrowserSessionConfig, f: F) -> Result<T, BrowserError>
    where
        F: FnOnce(Arc<BrowserSession>) -> Fut,
        Fut: Future<Output = Result<T, BrowserError>>,
    {
        let browser = Arc::new(BrowserSession::new(config));
        browser.start().await?;
        let result = f(Arc::clone(&browser)).await;
        let stopped = browser.stop().await;
        let value = result?;
        stopped?;
        Ok(value)
    }

    /// Launch or attach according to the configured mode.
    ///
    /// Fails with `InvalidState` if the session is already running. A failure
    /// partway through releases whatever was already acquired.
    pub async fn start(&self) -> Result<(), BrowserError> {
        self.config.validate()?;

        let mut lifecycle = self.lifecycle.write().await;
        if matches!(&*lifecycle, LifecycleState::Started(_)) {
            return Err(BrowserError::InvalidState(
                "browser already started; call stop() before starting again".to_string(),
            ));
        }

        info!("Starting browser in {:?} mode", self.config.mode);

        // Read persisted state up front so a corrupt file fails before any
        // browser process is spawned.
        let snapshot = match (self.config.mode, &self.config.state_path) {
            (LaunchMode::Cdp, _) | (_, None) => None,
            (_, Some(path)) if path.exists() => {
                info!("Restoring browser state from {}", path.display());
                Some(StorageState::load(path)?)
            }
            (_, Some(path)) => {
                warn!(
                    "State path {} does not exist; starting without stored state",
                    path.display()
                );
                None
            }
        };

        let (browser, handler) = match self.config.mode {
            LaunchMode::Cdp => connect_over_cdp(&self.config).await?,
            LaunchMode::Standard | LaunchMode::Stealth => launch_browser(&self.config).await?,
        };

        let alive = Arc::new(AtomicBool::new(true));
        let pump = spawn_event_pump(handler, Arc::clone(&alive));
        let mut handle = EngineHandle {
            browser,
            pump,
            alive,
            init_scripts: Vec::new(),
        };

        if self.config.mode != LaunchMode::Cdp {
            if let Err(err) = self.prepare_initial_page(&mut handle, snapshot).await {
                teardown_engine(self.config.mode, handle).await;
                return Err(err);
            }
        }

        *lifecycle = LifecycleState::Started(handle);
        Ok(())
    }

    /// Release the engine. Idempotent: safe to call on a session that never
    /// started or was already stopped. In CDP mode this disconnects without
    /// terminating the external browser.
    pub async fn stop(&self) -> Result<(), BrowserError> {
        let previous = {
            let mut lifecycle = self.lifecycle.write().await;
            std::mem::replace(&mut *lifecycle, LifecycleState::Stopped)
        };
        match previous {
            LifecycleState::Started(handle) => {
                teardown_engine(self.config.mode, handle).await;
                info!("Browser stopped");
            }
            _ => debug!("stop() called on a browser that is not running"),
        }
        Ok(())
    }

    /// Whether the engine is still connected. Flips to false when the browser
    /// process dies or the connection drops.
    pub async fn is_alive(&self) -> bool {
        match &*self.lifecycle.read().await {
            LifecycleState::Started(handle) => handle.alive.load(Ordering::Relaxed),
            _ => false,
        }
    }

    /// Return the page at `index`, creating a new one if it doesn't exist.
    pub async fn get_page(&self, index: usize) -> Result<Page, BrowserError> {
        let lifecycle = self.lifecycle.read().await;
        let LifecycleState::Started(handle) = &*lifecycle else {
            return Err(BrowserError::InvalidState(
                "browser not started; call start() or use BrowserSession::with".to_string(),
            ));
        };

        let pages = handle.browser.pages().await?;
        if let Some(page) = pages.into_iter().nth(index) {
            return Ok(page);
        }

        let page = handle.browser.new_page("about:blank").await?;
        if self.config.mode != LaunchMode::Cdp {
            self.prepare_page(&page, &handle.init_scripts).await?;
        }
        Ok(page)
    }

    /// Save cookies and localStorage for all open pages' origins.
    ///
    /// `path` takes precedence over `config.state_path`. Not available in CDP
    /// mode: the attached browser's profile belongs to someone else.
    pub async fn save_state(&self, path: Option<&Path>) -> Result<(), BrowserError> {
        if self.config.mode == LaunchMode::Cdp {
            return Err(BrowserError::Unsupported(
                "save_state is not available in CDP mode".to_string(),
            ));
        }
        let save_path: PathBuf = match path {
            Some(p) => p.to_path_buf(),
            None => self.config.state_path.clone().ok_or_else(|| {
                BrowserError::Configuration("no state path provided".to_string())
            })?,
        };

        let state = {
            let lifecycle = self.lifecycle.read().await;
            let LifecycleState::Started(handle) = &*lifecycle else {
                return Err(BrowserError::InvalidState(
                    "browser not started; call start() or use BrowserSession::with".to_string(),
                ));
            };
            collect_storage_state(&handle.browser).await?
        };

        state.save(&save_path)
    }

    /// Set up the blank page the launched browser opens with, restoring any
    /// persisted state before the caller gets a chance to navigate.
    async fn prepare_initial_page(
        &self,
        handle: &mut EngineHandle,
        snapshot: Option<StorageState>,
    ) -> Result<(), BrowserError> {
        let pages = handle.browser.pages().await?;
        let page = match pages.into_iter().next() {
            Some(page) => page,
            None => handle.browser.new_page("about:blank").await?,
        };

        if let Some(state) = snapshot {
            restore_cookies(&page, &state.cookies).await?;
            if !state.origins.is_empty() {
                handle.init_scripts.push(storage_seed_script(&state.origins));
            }
        }

        self.prepare_page(&page, &handle.init_scripts).await
    }

    /// Apply per-page overrides: user agent, locale, timezone, stealth
    /// patches, and any session init scripts.
    async fn prepare_page(&self, page: &Page, init_scripts: &[String]) -> Result<(), BrowserError> {
        apply_emulation_overrides(page, &self.config).await?;
        if self.config.mode == LaunchMode::Stealth {
            page.execute(AddScriptToEvaluateOnNewDocumentParams::new(
                STEALTH_INIT_SCRIPT,
            ))
            .await?;
        }
        for script in init_scripts {
            page.execute(AddScriptToEvaluateOnNewDocumentParams::new(script.clone()))
                .await?;
        }
        Ok(())
    }
}

/// Launch a fresh browser process.
async fn launch_browser(
    config: &BrowserSessionConfig,
) -> Result<(Browser, Handler), BrowserError> {
    let executable = config
        .chrome_path
        .clone()
        .or_else(|| find_browser(&config.channel));
    let Some(executable) = executable else {
        return Err(BrowserError::LaunchFailed(
            "no Chrome or Chromium executable found; install one or set chrome_path".to_string(),
        ));
    };
    debug!("Using browser executable at {}", executable.display());

    let (width, height) = config.viewport;
    let mut builder = BrowserConfig::builder()
        .chrome_executable(executable)
        .window_size(width, height)
        .viewport(Viewport {
            width,
            height,
            ..Default::default()
        });
    if !config.headless {
        builder = builder.with_head();
    }
    for arg in &config.args {
        builder = builder.arg(arg.clone());
    }
    if config.mode == LaunchMode::Stealth {
        for arg in STEALTH_ARGS {
            builder = builder.arg(*arg);
        }
    }

    let browser_config = builder.build().map_err(BrowserError::LaunchFailed)?;
    match tokio::time::timeout(
        Duration::from_secs(config.launch_timeout_secs),
        Browser::launch(browser_config),
    )
    .await
    {
        Ok(result) => result.map_err(|e| BrowserError::LaunchFailed(e.to_string())),
        Err(_) => Err(BrowserError::LaunchFailed(format!(
            "browser did not come up within {}s",
            config.launch_timeout_secs
        ))),
    }
}

/// Attach to an already-running browser via its DevTools endpoint.
async fn connect_over_cdp(
    config: &BrowserSessionConfig,
) -> Result<(Browser, Handler), BrowserError> {
    let ws_url = resolve_debugger_url(&config.cdp_url).await?;
    debug!("Connecting to browser at {}", ws_url);
    Browser::connect(ws_url).await.map_err(|e| {
        BrowserError::Connection(format!(
            "could not attach to browser at {}: {}",
            config.cdp_url, e
        ))
    })
}

/// Resolve the WebSocket debugger URL behind an http(s) DevTools endpoint.
async fn resolve_debugger_url(cdp_url: &str) -> Result<String, BrowserError> {
    if cdp_url.starts_with("ws://") || cdp_url.starts_with("wss://") {
        return Ok(cdp_url.to_string());
    }
    let version_url = format!("{}/json/version", cdp_url.trim_end_matches('/'));
    let client = reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()?;
    let info: serde_json::Value = client
        .get(&version_url)
        .send()
        .await
        .map_err(|e| {
            BrowserError::Connection(format!("no browser reachable at {}: {}", cdp_url, e))
        })?
        .json()
        .await
        .map_err(|e| {
            BrowserError::Connection(format!("unexpected response from {}: {}", version_url, e))
        })?;
    info.get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            BrowserError::Connection(format!(
                "{} did not report a webSocketDebuggerUrl",
                version_url
            ))
        })
}

/// Drive the engine's event stream until it ends; ending means the browser
/// disconnected or crashed.
fn spawn_event_pump(mut handler: Handler, alive: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(err) = event {
                debug!("Browser event error: {}", err);
                break;
            }
        }
        warn!("Browser disconnected (event handler ended)");
        alive.store(false, Ordering::Relaxed);
    })
}

/// Release engine resources for the given mode.
async fn teardown_engine(mode: LaunchMode, mut handle: EngineHandle) {
    handle.alive.store(false, Ordering::Relaxed);

    if mode == LaunchMode::Cdp {
        // The browser belongs to someone else; drop the connection only.
        handle.pump.abort();
        debug!("Detached from external browser");
        return;
    }

    // Graceful close first, brief grace period, then force kill so no
    // orphaned renderer processes survive.
    let _ = handle.browser.close().await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    let _ = handle.browser.kill().await;
    handle.pump.abort();
}

/// Find a Chrome/Chromium executable on the system, preferring the configured
/// channel.
fn find_browser(channel: &str) -> Option<PathBuf> {
    let prefer_chromium = channel.eq_ignore_ascii_case("chromium");

    let mut candidates: Vec<PathBuf> = if cfg!(target_os = "windows") {
        let mut paths = vec![
            PathBuf::from(r"C:\Program Files\Google\Chrome\Application\chrome.exe"),
            PathBuf::from(r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe"),
        ];
        if let Ok(local) = std::env::var("LOCALAPPDATA") {
            paths.push(PathBuf::from(format!(
                r"{}\Google\Chrome\Application\chrome.exe",
                local
            )));
        }
        paths
    } else if cfg!(target_os = "macos") {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    } else {
        vec![
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/chromium-browser"),
        ]
    };

    if prefer_chromium {
        candidates.sort_by_key(|p| {
            let name = p
                .file_name()
                .map(|n| n.to_string_lossy().to_ascii_lowercase())
                .unwrap_or_default();
            !name.contains("chromium")
        });
    }

    candidates.into_iter().find(|p| p.exists())
}

/// Apply user agent, timezone, and locale overrides at the protocol level.
async fn apply_emulation_overrides(
    page: &Page,
    config: &BrowserSessionConfig,
) -> Result<(), BrowserError> {
    page.execute(SetUserAgentOverrideParams {
        user_agent: config.user_agent.clone(),
        accept_language: Some(config.locale.clone()),
        platform: None,
        user_agent_metadata: None,
    })
    .await?;
    page.execute(SetTimezoneOverrideParams::new(config.timezone.as_str()))
        .await?;
    page.execute(SetLocaleOverrideParams {
        locale: Some(config.locale.clone()),
    })
    .await?;
    Ok(())
}

/// Install persisted cookies into the fresh browser.
async fn restore_cookies(page: &Page, cookies: &[StoredCookie]) -> Result<(), BrowserError> {
    if cookies.is_empty() {
        return Ok(());
    }
    let mut params = Vec::with_capacity(cookies.len());
    for cookie in cookies {
        let mut builder = CookieParam::builder()
            .name(cookie.name.as_str())
            .value(cookie.value.as_str())
            .domain(cookie.domain.as_str())
            .path(cookie.path.as_str())
            .secure(cookie.secure)
            .http_only(cookie.http_only);
        if let Some(expires) = cookie.expires {
            builder = builder.expires(TimeSinceEpoch::new(expires));
        }
        if let Some(same_site) = cookie.same_site.as_deref().and_then(parse_same_site) {
            builder = builder.same_site(same_site);
        }
        params.push(builder.build().map_err(BrowserError::CorruptState)?);
    }
    debug!("Restoring {} cookies", params.len());
    page.set_cookies(params).await?;
    Ok(())
}

fn parse_same_site(raw: &str) -> Option<CookieSameSite> {
    match raw {
        "Strict" => Some(CookieSameSite::Strict),
        "Lax" => Some(CookieSameSite::Lax),
        "None" => Some(CookieSameSite::None),
        _ => None,
    }
}

/// Script that seeds localStorage for matching origins before the first page
/// script runs.
fn storage_seed_script(origins: &[OriginState]) -> String {
    let mut seeds = serde_json::Map::new();
    for origin in origins {
        let mut entries = serde_json::Map::new();
        for entry in &origin.local_storage {
            entries.insert(
                entry.name.clone(),
                serde_json::Value::String(entry.value.clone()),
            );
        }
        seeds.insert(origin.origin.clone(), serde_json::Value::Object(entries));
    }
    format!(
        r#"(() => {{
  const seeds = {seeds};
  const entries = seeds[location.origin];
  if (!entries) return;
  for (const [key, value] of Object.entries(entries)) {{
    try {{ localStorage.setItem(key, value); }} catch (_) {{}}
  }}
}})();"#,
        seeds = serde_json::Value::Object(seeds)
    )
}

/// Snapshot cookies and per-origin localStorage across all open pages.
async fn collect_storage_state(browser: &Browser) -> Result<StorageState, BrowserError> {
    let mut cookies: Vec<StoredCookie> = Vec::new();
    let mut seen_cookies: HashSet<(String, String, String)> = HashSet::new();
    let mut origins: Vec<OriginState> = Vec::new();
    let mut seen_origins: HashSet<String> = HashSet::new();

    for page in browser.pages().await? {
        match page.get_cookies().await {
            Ok(list) => {
                for cookie in list {
                    let key = (
                        cookie.name.clone(),
                        cookie.domain.clone(),
                        cookie.path.clone(),
                    );
                    if seen_cookies.insert(key) {
                        cookies.push(StoredCookie {
                            name: cookie.name.clone(),
                            value: cookie.value.clone(),
                            domain: cookie.domain.clone(),
                            path: cookie.path.clone(),
                            expires: (cookie.expires >= 0.0).then_some(cookie.expires),
                            secure: cookie.secure,
                            http_only: cookie.http_only,
                            same_site: cookie.same_site.as_ref().map(same_site_label),
                        });
                    }
                }
            }
            Err(err) => debug!("Could not read cookies for a page: {}", err),
        }

        let Some(url) = page.url().await.ok().flatten() else {
            continue;
        };
        let Ok(parsed) = Url::parse(&url) else {
            continue;
        };
        let origin = parsed.origin();
        if !origin.is_tuple() {
            // about:blank and friends have no storage to snapshot
            continue;
        }
        let origin = origin.ascii_serialization();
        if !seen_origins.insert(origin.clone()) {
            continue;
        }
        let entries = dump_local_storage(&page).await;
        if !entries.is_empty() {
            origins.push(OriginState {
                origin,
                local_storage: entries,
            });
        }
    }

    Ok(StorageState { cookies, origins })
}

fn same_site_label(same_site: &CookieSameSite) -> String {
    match same_site {
        CookieSameSite::Strict => "Strict",
        CookieSameSite::Lax => "Lax",
        CookieSameSite::None => "None",
    }
    .to_string()
}

async fn dump_local_storage(page: &Page) -> Vec<StorageEntry> {
    let params = match EvaluateParams::builder()
        .expression(LOCAL_STORAGE_DUMP)
        .return_by_value(true)
        .build()
    {
        Ok(params) => params,
        Err(_) => return Vec::new(),
    };
    match page.evaluate(params).await {
        Ok(result) => result
            .into_value::<BTreeMap<String, String>>()
            .map(|map| {
                map.into_iter()
                    .map(|(name, value)| StorageEntry { name, value })
                    .collect()
            })
            .unwrap_or_default(),
        Err(err) => {
            debug!("Could not read localStorage: {}", err);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_page_before_start_fails() {
        let session = BrowserSession::new(BrowserSessionConfig::default());
        let err = session.get_page(0).await.unwrap_err();
        assert!(matches!(err, BrowserError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_without_start() {
        let session = BrowserSession::new(BrowserSessionConfig::default());
        assert!(session.stop().await.is_ok());
        assert!(session.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_is_alive_false_before_start() {
        let session = BrowserSession::new(BrowserSessionConfig::default());
        assert!(!session.is_alive().await);
    }

    #[tokio::test]
    async fn test_save_state_rejected_in_cdp_mode() {
        let session = BrowserSession::new(BrowserSessionConfig::new(LaunchMode::Cdp));
        let err = session.save_state(None).await.unwrap_err();
        assert!(matches!(err, BrowserError::Unsupported(_)));
    }

    #[tokio::test]
    async fn test_save_state_without_path_fails() {
        let session = BrowserSession::new(BrowserSessionConfig::default());
        let err = session.save_state(None).await.unwrap_err();
        assert!(matches!(err, BrowserError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_save_state_before_start_fails() {
        let config = BrowserSessionConfig::default().state_path("/tmp/sessionbridge-state.json");
        let session = BrowserSession::new(config);
        let err = session.save_state(None).await.unwrap_err();
        assert!(matches!(err, BrowserError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_start_with_invalid_config_fails_fast() {
        let session = BrowserSession::new(BrowserSessionConfig::default().viewport(0, 0));
        let err = session.start().await.unwrap_err();
        assert!(matches!(err, BrowserError::Configuration(_)));
    }

    #[test]
    fn test_storage_seed_script_embeds_origin_entries() {
        let origins = vec![OriginState {
            origin: "https://example.com".to_string(),
            local_storage: vec![StorageEntry {
                name: "token".to_string(),
                value: "xyz".to_string(),
            }],
        }];
        let script = storage_seed_script(&origins);

        assert!(script.contains("https://example.com"));
        assert!(script.contains("\"token\":\"xyz\""));
        assert!(script.contains("localStorage.setItem"));
    }

    #[test]
    fn test_parse_same_site_round_trip() {
        for label in ["Strict", "Lax", "None"] {
            let parsed = parse_same_site(label).unwrap();
            assert_eq!(same_site_label(&parsed), label);
        }
        assert!(parse_same_site("Whatever").is_none());
    }
}
