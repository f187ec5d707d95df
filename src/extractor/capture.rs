//! Captured responses and the capture log
//!
//! A `CapturedResponse` is one intercepted JSON exchange frozen at capture
//! time. The `CaptureLog` is the append-only, insertion-ordered store shared
//! between the recorder task (sole writer) and query callers (readers).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::debug;

use crate::browser::BrowserError;

/// How often `wait_for` re-checks the log between suspensions.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A cookie visible to a captured response's URL at capture time.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    /// Seconds since the UNIX epoch. Absent for session cookies.
    pub expires: Option<f64>,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: Option<String>,
}

/// One intercepted JSON response plus its request and cookie context.
///
/// Created once by the recorder, never mutated afterwards.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub url: String,
    pub method: String,
    pub status: i64,
    /// Response headers, name case preserved.
    pub headers: Vec<(String, String)>,
    /// Parsed JSON body. Responses whose body is not valid JSON are never
    /// captured in the first place.
    pub body: serde_json::Value,
    /// Request headers with protocol pseudo-headers (`:method`, `:authority`,
    /// ...) already stripped.
    pub request_headers: Vec<(String, String)>,
    pub request_post_data: Option<String>,
    pub cookies: Vec<CapturedCookie>,
}

impl CapturedResponse {
    /// Look up a response header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Look up a request header, case-insensitive.
    pub fn request_header(&self, name: &str) -> Option<&str> {
        self.request_headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Append-only, insertion-ordered store of captured responses.
///
/// Unbounded by default. With a capacity set, the oldest captures are evicted
/// once the bound is reached, so the log always holds the most recent N.
pub struct CaptureLog {
    entries: RwLock<VecDeque<Arc<CapturedResponse>>>,
    capacity: Option<usize>,
}

impl Default for CaptureLog {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureLog {
    /// Create an unbounded log.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: None,
        }
    }

    /// Create a log that retains at most `capacity` captures.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            capacity: Some(capacity),
        }
    }

    /// Append a fully built capture. Publication is atomic: readers see
    /// either the previous log or the new entry, never a partial record.
    pub fn push(&self, response: CapturedResponse) {
        let mut entries = self.entries.write();
        if let Some(capacity) = self.capacity {
            while entries.len() >= capacity {
                match entries.pop_front() {
                    Some(dropped) => {
                        debug!("Capture log full; evicting oldest entry {}", dropped.url)
                    }
                    None => break,
                }
            }
        }
        entries.push_back(Arc::new(response));
    }

    /// Most recent capture whose URL contains `url_contains`, if any.
    pub fn find(&self, url_contains: &str) -> Option<Arc<CapturedResponse>> {
        self.entries
            .read()
            .iter()
            .rev()
            .find(|r| r.url.contains(url_contains))
            .cloned()
    }

    /// All captures whose URL contains `url_contains`, in insertion order.
    pub fn find_all(&self, url_contains: &str) -> Vec<Arc<CapturedResponse>> {
        self.entries
            .read()
            .iter()
            .filter(|r| r.url.contains(url_contains))
            .cloned()
            .collect()
    }

    /// Snapshot of every capture, in insertion order.
    pub fn snapshot(&self) -> Vec<Arc<CapturedResponse>> {
        self.entries.read().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every capture. Only a new recording session does this.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Suspend until a capture matching `url_contains` appears, or fail with
    /// `Timeout` once `timeout` elapses. Returns the most recent match at the
    /// moment of success.
    pub async fn wait_for(
        &self,
        url_contains: &str,
        timeout: Duration,
    ) -> Result<Arc<CapturedResponse>, BrowserError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(hit) = self.find(url_contains) {
                return Ok(hit);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(BrowserError::Timeout(format!(
                    "no captured response matching {:?} within {:?}",
                    url_contains, timeout
                )));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
