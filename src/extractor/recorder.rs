//! Session extractor
//!
//! Wraps a `BrowserSession` with response recording: a recorder task
//! subscribes to the page's network event streams, correlates request and
//! response halves by request id, and appends every JSON-bodied exchange to
//! the capture log. A captured exchange can then be turned into a standalone
//! authenticated `reqwest` session.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chromiumoxide::cdp::browser_protocol::network::{
    Cookie as CdpCookie, CookieSameSite, EventLoadingFailed, EventLoadingFinished,
    EventRequestWillBeSent, EventResponseReceived, GetCookiesParams, GetResponseBodyParams,
    Headers, RequestId,
};
use chromiumoxide::Page;
use futures::{Stream, StreamExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::capture::{CaptureLog, CapturedCookie, CapturedResponse};
use super::http::ExtractedSession;
use crate::browser::{BrowserError, BrowserSession, BrowserSessionConfig};

/// A browser session that records JSON responses and converts them into
/// authenticated HTTP client sessions.
///
/// Composition, not inheritance: the plain lifecycle surface is delegated to
/// the wrapped [`BrowserSession`], which is also reachable via [`browser`].
///
/// [`browser`]: SessionExtractor::browser
pub struct SessionExtractor {
    browser: BrowserSession,
    log: Arc<CaptureLog>,
    recording: Mutex<Option<JoinHandle<()>>>,
}

impl SessionExtractor {
    /// Create an extractor with an unbounded capture log.
    pub fn new(config: BrowserSessionConfig) -> Self {
        Self {
            browser: BrowserSession::new(config),
            log: Arc::new(CaptureLog::new()),
            recording: Mutex::new(None),
        }
    }

    /// Create an extractor that retains at most `limit` captures, evicting
    /// the oldest once the bound is reached.
    pub fn with_capture_limit(config: BrowserSessionConfig, limit: usize) -> Self {
        Self {
            browser: BrowserSession::new(config),
            log: Arc::new(CaptureLog::with_capacity(limit)),
            recording: Mutex::new(None),
        }
    }

    /// Run `f` against a started extractor, guaranteeing recording teardown
    /// and `stop()` on every exit path.
    pub async fn with<T, F, Fut>(config: BrowserSessionConfig, f: F) -> Result<T, BrowserError>
    where
        F: FnOnce(Arc<SessionExtractor>) -> Fut,
        Fut: Future<Output = Result<T, BrowserError>>,
    {
        let extractor = Arc::new(SessionExtractor::new(config));
        extractor.start().await?;
        let result = f(Arc::clone(&extractor)).await;
        let stopped = extractor.stop().await;
        let value = result?;
        stopped?;
        Ok(value)
    }

    /// The wrapped browser session.
    pub fn browser(&self) -> &BrowserSession {
        &self.browser
    }

    /// Start the wrapped browser session.
    pub async fn start(&self) -> Result<(), BrowserError> {
        self.browser.start().await
    }

    /// Stop recording, then stop the wrapped browser session. Idempotent.
    pub async fn stop(&self) -> Result<(), BrowserError> {
        self.stop_recording().await;
        self.browser.stop().await
    }

    /// Return the page at `index`, creating a new one if it doesn't exist.
    pub async fn get_page(&self, index: usize) -> Result<Page, BrowserError> {
        self.browser.get_page(index).await
    }

    /// Save cookies and localStorage to disk. See [`BrowserSession::save_state`].
    pub async fn save_state(&self, path: Option<&Path>) -> Result<(), BrowserError> {
        self.browser.save_state(path).await
    }

    /// Begin intercepting JSON responses on `page`.
    ///
    /// Resets the capture log, then records every subsequent JSON-bodied
    /// response on that page. Fails with `InvalidState` if a recording is
    /// already in progress.
    pub async fn start_recording(&self, page: &Page) -> Result<(), BrowserError> {
        let mut recording = self.recording.lock().await;
        if recording.is_some() {
            return Err(BrowserError::InvalidState(
                "already recording; call stop_recording() first".to_string(),
            ));
        }

        let requests = page.event_listener::<EventRequestWillBeSent>().await?;
        let responses = page.event_listener::<EventResponseReceived>().await?;
        let finished = page.event_listener::<EventLoadingFinished>().await?;
        let failed = page.event_listener::<EventLoadingFailed>().await?;

        self.log.clear();
        info!("Recording JSON responses");
        let task = tokio::spawn(record_exchanges(
            page.clone(),
            Arc::clone(&self.log),
            requests,
            responses,
            finished,
            failed,
        ));
        *recording = Some(task);
        Ok(())
    }

    /// Stop intercepting responses. Safe to call if recording was never
    /// started. Captured responses are kept until the next recording starts.
    pub async fn stop_recording(&self) {
        if let Some(task) = self.recording.lock().await.take() {
            task.abort();
            info!("Recording stopped ({} captures kept)", self.log.len());
        }
    }

    /// Most recent captured response whose URL contains `url_contains`.
    pub fn find_response(&self, url_contains: &str) -> Option<Arc<CapturedResponse>> {
        self.log.find(url_contains)
    }

    /// All captured responses whose URL contains `url_contains`, in capture
    /// order.
    pub fn find_all_responses(&self, url_contains: &str) -> Vec<Arc<CapturedResponse>> {
        self.log.find_all(url_contains)
    }

    /// Every capture so far, in capture order.
    pub fn responses(&self) -> Vec<Arc<CapturedResponse>> {
        self.log.snapshot()
    }

    /// Suspend until a matching response is captured or `timeout` elapses.
    ///
    /// Fails with `InvalidState` when no recording is in progress and
    /// `Timeout` on expiry. Returns the most recent match on success.
    pub async fn wait_for_response(
        &self,
        url_contains: &str,
        timeout: Duration,
    ) -> Result<Arc<CapturedResponse>, BrowserError> {
        if self.recording.lock().await.is_none() {
            return Err(BrowserError::InvalidState(
                "no recording in progress; call start_recording() first".to_string(),
            ));
        }
        self.log.wait_for(url_contains, timeout).await
    }

    /// Build an authenticated `reqwest` session from a captured response.
    ///
    /// The session carries the capture's cookies and forwardable request
    /// headers and needs no further help from the browser. If the captured
    /// auth material has expired server-side, requests fail exactly as the
    /// server says they do; there is no re-authentication here.
    pub fn to_session(&self, captured: &CapturedResponse) -> Result<ExtractedSession, BrowserError> {
        ExtractedSession::from_capture(captured)
    }
}

/// Request-side context held until the exchange finishes loading.
struct PendingExchange {
    method: String,
    request_headers: Vec<(String, String)>,
    post_data: Option<String>,
    response: Option<ResponseMeta>,
}

struct ResponseMeta {
    url: String,
    status: i64,
    headers: Vec<(String, String)>,
}

/// Correlate network events by request id and append completed JSON
/// exchanges to the log. Runs until the page's event streams end.
async fn record_exchanges(
    page: Page,
    log: Arc<CaptureLog>,
    mut requests: impl Stream<Item = Arc<EventRequestWillBeSent>> + Unpin,
    mut responses: impl Stream<Item = Arc<EventResponseReceived>> + Unpin,
    mut finished: impl Stream<Item = Arc<EventLoadingFinished>> + Unpin,
    mut failed: impl Stream<Item = Arc<EventLoadingFailed>> + Unpin,
) {
    let mut pending: HashMap<RequestId, PendingExchange> = HashMap::new();

    loop {
        tokio::select! {
            maybe = requests.next() => {
                let Some(event) = maybe else { break };
                pending.insert(event.request_id.clone(), PendingExchange {
                    method: event.request.method.clone(),
                    request_headers: without_pseudo_headers(headers_to_pairs(&event.request.headers)),
                    post_data: request_post_data(&event.request),
                    response: None,
                });
            }
            maybe = responses.next() => {
                let Some(event) = maybe else { break };
                if !is_json_mime(&event.response.mime_type) {
                    // Not an error, simply not captured.
                    pending.remove(&event.request_id);
                    continue;
                }
                if let Some(exchange) = pending.get_mut(&event.request_id) {
                    exchange.response = Some(ResponseMeta {
                        url: event.response.url.clone(),
                        status: event.response.status,
                        headers: headers_to_pairs(&event.response.headers),
                    });
                }
            }
            maybe = finished.next() => {
                let Some(event) = maybe else { break };
                if let Some(mut exchange) = pending.remove(&event.request_id) {
                    if let Some(meta) = exchange.response.take() {
                        capture_exchange(&page, &log, &event.request_id, exchange, meta).await;
                    }
                }
            }
            maybe = failed.next() => {
                let Some(event) = maybe else { break };
                pending.remove(&event.request_id);
            }
        }
    }

    debug!("Response recorder detached");
}

/// Fetch the finished response's body, parse it as JSON, snapshot the cookie
/// context, and publish one fully built capture.
async fn capture_exchange(
    page: &Page,
    log: &CaptureLog,
    request_id: &RequestId,
    exchange: PendingExchange,
    meta: ResponseMeta,
) {
    let body = match page
        .execute(GetResponseBodyParams::new(request_id.clone()))
        .await
    {
        Ok(response) => {
            let returns = response.result;
            let parsed = if returns.base64_encoded {
                BASE64
                    .decode(returns.body.as_bytes())
                    .ok()
                    .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
            } else {
                serde_json::from_str::<serde_json::Value>(&returns.body).ok()
            };
            match parsed {
                Some(value) => value,
                None => {
                    debug!("Failed to decode JSON from {}", meta.url);
                    return;
                }
            }
        }
        Err(err) => {
            debug!("Could not fetch response body for {}: {}", meta.url, err);
            return;
        }
    };

    let cookies = match page
        .execute(GetCookiesParams {
            urls: Some(vec![meta.url.clone()]),
        })
        .await
    {
        Ok(response) => response.result.cookies.iter().map(captured_cookie).collect(),
        Err(err) => {
            warn!("Could not read cookies for {}: {}", meta.url, err);
            Vec::new()
        }
    };

    debug!(
        "Captured JSON response {} {} ({})",
        exchange.method, meta.url, meta.status
    );
    log.push(CapturedResponse {
        url: meta.url,
        method: exchange.method,
        status: meta.status,
        headers: meta.headers,
        body,
        request_headers: exchange.request_headers,
        request_post_data: exchange.post_data,
        cookies,
    });
}

fn captured_cookie(cookie: &CdpCookie) -> CapturedCookie {
    CapturedCookie {
        name: cookie.name.clone(),
        value: cookie.value.clone(),
        domain: cookie.domain.clone(),
        path: cookie.path.clone(),
        expires: (cookie.expires >= 0.0).then_some(cookie.expires),
        secure: cookie.secure,
        http_only: cookie.http_only,
        same_site: cookie.same_site.as_ref().map(|s| {
            match s {
                CookieSameSite::Strict => "Strict",
                CookieSameSite::Lax => "Lax",
                CookieSameSite::None => "None",
            }
            .to_string()
        }),
    }
}

/// Whether a declared MIME type indicates a JSON body.
fn is_json_mime(mime: &str) -> bool {
    let mime = mime.to_ascii_lowercase();
    mime == "application/json" || mime == "text/json" || mime.ends_with("+json")
}

fn headers_to_pairs(headers: &Headers) -> Vec<(String, String)> {
    match serde_json::to_value(headers) {
        Ok(serde_json::Value::Object(map)) => map
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (name, value)
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Reassemble a request's POST body from its CDP post-data entries. `None`
/// when the request carried no body.
fn request_post_data(
    request: &chromiumoxide::cdp::browser_protocol::network::Request,
) -> Option<String> {
    request.post_data_entries.as_ref().map(|entries| {
        entries
            .iter()
            .filter_map(|entry| entry.bytes.clone())
            .map(String::from)
            .collect::<String>()
    })
}

/// Drop protocol pseudo-headers; they are control data, not forwardable
/// application headers.
fn without_pseudo_headers(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| !name.starts_with(':'))
        .collect()
}
