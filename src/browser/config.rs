//! Browser session configuration
//!
//! One immutable config drives all three launch strategies. CDP-only field:
//! `cdp_url`. All other launch fields (headless, state path, viewport,
//! user agent, locale, timezone, args) are ignored when attaching over CDP.

use std::path::PathBuf;

use url::Url;

use super::BrowserError;

/// Default desktop user agent sent by launched browsers.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/136.0.0.0 Safari/537.36";

/// How a browser handle is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchMode {
    /// Launch a fresh browser with no extras.
    Standard,
    /// Launch a fresh browser with anti-detection flags and script patches.
    Stealth,
    /// Attach to an already-running browser via its DevTools endpoint.
    Cdp,
}

impl Default for LaunchMode {
    fn default() -> Self {
        LaunchMode::Standard
    }
}

/// Configuration for a browser session
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserSessionConfig {
    /// Launch strategy.
    pub mode: LaunchMode,
    /// Run in headless mode (ignored in CDP mode)
    pub headless: bool,
    /// Where cookies and localStorage are persisted across runs
    pub state_path: Option<PathBuf>,
    /// Browser channel preferred by executable discovery ("chrome" or "chromium")
    pub channel: String,
    /// Explicit path to the Chrome/Chromium executable
    pub chrome_path: Option<PathBuf>,
    /// DevTools endpoint for CDP mode. Accepts http:// (probed for the
    /// WebSocket URL) or a ws:// URL directly.
    pub cdp_url: String,
    /// Viewport width and height
    pub viewport: (u32, u32),
    /// User agent applied to every page
    pub user_agent: String,
    /// BCP 47 locale applied to every page
    pub locale: String,
    /// IANA timezone applied to every page
    pub timezone: String,
    /// Extra command-line arguments passed to the launched browser
    pub args: Vec<String>,
    /// How long to wait for the browser to come up before failing
    pub launch_timeout_secs: u64,
}

impl Default for BrowserSessionConfig {
    fn default() -> Self {
        Self {
            mode: LaunchMode::Standard,
            headless: true,
            state_path: None,
            channel: "chrome".to_string(),
            chrome_path: None,
            cdp_url: "http://localhost:9222".to_string(),
            viewport: (1920, 1080),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            locale: "en-US".to_string(),
            timezone: "America/New_York".to_string(),
            args: vec![
                "--disable-blink-features=AutomationControlled".to_string(),
                "--no-sandbox".to_string(),
            ],
            launch_timeout_secs: 45,
        }
    }
}

impl BrowserSessionConfig {
    /// Create a config for the given launch mode with default options.
    pub fn new(mode: LaunchMode) -> Self {
        Self {
            mode,
            ..Default::default()
        }
    }

    /// Set headless mode
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Set the state persistence path
    pub fn state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Set the preferred browser channel
    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Set an explicit browser executable path
    pub fn chrome_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.chrome_path = Some(path.into());
        self
    }

    /// Set the DevTools endpoint used in CDP mode
    pub fn cdp_url(mut self, url: impl Into<String>) -> Self {
        self.cdp_url = url.into();
        self
    }

    /// Set viewport dimensions
    pub fn viewport(mut self, width: u32, height: u32) -> Self {
        self.viewport = (width, height);
        self
    }

    /// Set the user agent
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Set the locale
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// Set the timezone
    pub fn timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = timezone.into();
        self
    }

    /// Replace the extra browser arguments
    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set the launch timeout
    pub fn launch_timeout(mut self, secs: u64) -> Self {
        self.launch_timeout_secs = secs;
        self
    }

    /// Check the config for values that can never produce a working session.
    pub fn validate(&self) -> Result<(), BrowserError> {
        let (width, height) = self.viewport;
        if width == 0 || height == 0 {
            return Err(BrowserError::Configuration(format!(
                "viewport dimensions must be non-zero, got {}x{}",
                width, height
            )));
        }
        if self.mode == LaunchMode::Cdp {
            Url::parse(&self.cdp_url).map_err(|e| {
                BrowserError::Configuration(format!("invalid CDP URL {:?}: {}", self.cdp_url, e))
            })?;
        }
        Ok(())
    }
}
