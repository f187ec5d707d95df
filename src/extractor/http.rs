//! Reconstructed HTTP sessions
//!
//! Turns one captured browser exchange into a standalone `reqwest` client:
//! the capture's cookies become a cookie jar, its request headers become
//! default headers, and from then on the browser is out of the picture.

use std::collections::HashSet;
use std::sync::Arc;

use once_cell::sync::Lazy;
use reqwest::cookie::Jar;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, RequestBuilder};
use tracing::{debug, warn};
use url::Url;

use super::capture::{CapturedCookie, CapturedResponse};
use crate::browser::BrowserError;

/// Headers never forwarded into a reconstructed session: connection-scoped
/// values the client must recompute per request, plus `cookie`, which is
/// owned by the session's jar.
static UNFORWARDABLE_HEADERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "host",
        "content-length",
        "connection",
        "keep-alive",
        "proxy-connection",
        "transfer-encoding",
        "upgrade",
        "te",
        "trailer",
        "accept-encoding",
        "cookie",
    ]
    .into_iter()
    .collect()
});

/// An HTTP client session primed with a captured exchange's cookies and
/// forwardable request headers. Lives independently of the browser engine.
pub struct ExtractedSession {
    client: Client,
    cookie_jar: Arc<Jar>,
    headers: HeaderMap,
    cookies: Vec<CapturedCookie>,
}

impl ExtractedSession {
    /// Build a session from a captured response.
    pub fn from_capture(captured: &CapturedResponse) -> Result<Self, BrowserError> {
        let cookie_jar = Arc::new(Jar::default());
        for cookie in &captured.cookies {
            let Some(origin) = cookie_origin(cookie) else {
                warn!(
                    "Skipping cookie {} with unusable domain {:?}",
                    cookie.name, cookie.domain
                );
                continue;
            };
            cookie_jar.add_cookie_str(&set_cookie_line(cookie), &origin);
        }

        let headers = forwardable_headers(&captured.request_headers);
        let client = Client::builder()
            .cookie_provider(Arc::clone(&cookie_jar))
            .default_headers(headers.clone())
            .build()?;

        Ok(Self {
            client,
            cookie_jar,
            headers,
            cookies: captured.cookies.clone(),
        })
    }

    /// The underlying `reqwest` client with cookies and headers applied.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Default headers every request of this session carries.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The cookies this session was primed with.
    pub fn cookies(&self) -> &[CapturedCookie] {
        &self.cookies
    }

    /// The live cookie jar. Set-Cookie responses received through this
    /// session update it.
    pub fn cookie_jar(&self) -> &Arc<Jar> {
        &self.cookie_jar
    }

    /// Start a GET request.
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.client.get(url)
    }

    /// Start a POST request.
    pub fn post(&self, url: &str) -> RequestBuilder {
        self.client.post(url)
    }
}

/// Build the default-header set from captured request headers, dropping
/// pseudo-headers and connection-scoped headers.
fn forwardable_headers(request_headers: &[(String, String)]) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in request_headers {
        if name.starts_with(':') {
            continue;
        }
        if UNFORWARDABLE_HEADERS.contains(name.to_ascii_lowercase().as_str()) {
            continue;
        }
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!("Skipping unrepresentable header name {:?}", name);
            continue;
        };
        let Ok(header_value) = HeaderValue::from_str(value) else {
            debug!("Skipping unrepresentable value for header {:?}", name);
            continue;
        };
        headers.insert(header_name, header_value);
    }
    headers
}

/// URL a captured cookie is scoped to, derived from its recorded domain.
fn cookie_origin(cookie: &CapturedCookie) -> Option<Url> {
    let host = cookie.domain.trim_start_matches('.');
    if host.is_empty() {
        return None;
    }
    Url::parse(&format!("https://{}/", host)).ok()
}

/// Render a capture as a `Set-Cookie` line the jar understands.
fn set_cookie_line(cookie: &CapturedCookie) -> String {
    let mut line = format!(
        "{}={}; Domain={}; Path={}",
        cookie.name, cookie.value, cookie.domain, cookie.path
    );
    if cookie.secure {
        line.push_str("; Secure");
    }
    if cookie.http_only {
        line.push_str("; HttpOnly");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::cookie::CookieStore;

    fn sample_capture() -> CapturedResponse {
        CapturedResponse {
            url: "https://example.com/api/data".to_string(),
            method: "GET".to_string(),
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: serde_json::json!({"key": "value"}),
            request_headers: vec![
                ("authorization".to_string(), "Bearer token".to_string()),
                ("x-api-key".to_string(), "k123".to_string()),
                ("user-agent".to_string(), "Mozilla/5.0".to_string()),
                (":method".to_string(), "GET".to_string()),
                (":authority".to_string(), "example.com".to_string()),
                ("host".to_string(), "example.com".to_string()),
                ("content-length".to_string(), "42".to_string()),
                ("connection".to_string(), "keep-alive".to_string()),
                ("cookie".to_string(), "session=abc123".to_string()),
            ],
            request_post_data: None,
            cookies: vec![
                CapturedCookie {
                    name: "session".to_string(),
                    value: "abc123".to_string(),
                    domain: ".example.com".to_string(),
                    path: "/".to_string(),
                    expires: None,
                    secure: true,
                    http_only: true,
                    same_site: Some("Lax".to_string()),
                },
                CapturedCookie {
                    name: "pref".to_string(),
                    value: "dark".to_string(),
                    domain: "example.com".to_string(),
                    path: "/".to_string(),
                    expires: Some(1_900_000_000.0),
                    secure: false,
                    http_only: false,
                    same_site: None,
                },
            ],
        }
    }

    #[test]
    fn test_session_headers_keep_auth_material() {
        let session = ExtractedSession::from_capture(&sample_capture()).unwrap();

        assert_eq!(session.headers()["authorization"], "Bearer token");
        assert_eq!(session.headers()["x-api-key"], "k123");
        assert_eq!(session.headers()["user-agent"], "Mozilla/5.0");
    }

    #[test]
    fn test_session_headers_exclude_pseudo_headers() {
        let session = ExtractedSession::from_capture(&sample_capture()).unwrap();

        for (name, _) in sample_capture().request_headers {
            if name.starts_with(':') {
                assert!(!session.headers().contains_key(name.trim_start_matches(':')));
            }
        }
        assert!(!session.headers().contains_key("method"));
        assert!(!session.headers().contains_key("authority"));
    }

    #[test]
    fn test_session_headers_exclude_connection_scoped() {
        let session = ExtractedSession::from_capture(&sample_capture()).unwrap();

        assert!(!session.headers().contains_key("host"));
        assert!(!session.headers().contains_key("content-length"));
        assert!(!session.headers().contains_key("connection"));
        assert!(!session.headers().contains_key("cookie"));
    }

    #[test]
    fn test_cookie_jar_matches_captured_cookies() {
        let session = ExtractedSession::from_capture(&sample_capture()).unwrap();

        let url = Url::parse("https://example.com/").unwrap();
        let header = session
            .cookie_jar()
            .cookies(&url)
            .expect("jar should produce a Cookie header for the captured domain");
        let value = header.to_str().unwrap();

        assert!(value.contains("session=abc123"));
        assert!(value.contains("pref=dark"));
    }

    #[test]
    fn test_cookie_domain_scoping() {
        let session = ExtractedSession::from_capture(&sample_capture()).unwrap();

        let other = Url::parse("https://other.com/").unwrap();
        assert!(session.cookie_jar().cookies(&other).is_none());
    }

    #[test]
    fn test_cookie_list_is_preserved_verbatim() {
        let capture = sample_capture();
        let session = ExtractedSession::from_capture(&capture).unwrap();
        assert_eq!(session.cookies(), capture.cookies.as_slice());
    }

    #[test]
    fn test_unrepresentable_header_values_are_skipped() {
        let mut capture = sample_capture();
        capture
            .request_headers
            .push(("x-bad".to_string(), "line\nbreak".to_string()));

        let session = ExtractedSession::from_capture(&capture).unwrap();
        assert!(!session.headers().contains_key("x-bad"));
    }

    #[test]
    fn test_cookie_with_empty_domain_is_skipped() {
        let mut capture = sample_capture();
        capture.cookies.push(CapturedCookie {
            name: "broken".to_string(),
            value: "x".to_string(),
            domain: String::new(),
            path: "/".to_string(),
            expires: None,
            secure: false,
            http_only: false,
            same_site: None,
        });

        let session = ExtractedSession::from_capture(&capture).unwrap();
        let url = Url::parse("https://example.com/").unwrap();
        let header = session.cookie_jar().cookies(&url).unwrap();
        assert!(!header.to_str().unwrap().contains("broken=x"));
    }

    #[test]
    fn test_set_cookie_line_renders_flags() {
        let cookie = CapturedCookie {
            name: "session".to_string(),
            value: "abc".to_string(),
            domain: ".example.com".to_string(),
            path: "/app".to_string(),
            expires: None,
            secure: true,
            http_only: true,
            same_site: None,
        };
        let line = set_cookie_line(&cookie);

        assert!(line.starts_with("session=abc"));
        assert!(line.contains("Domain=.example.com"));
        assert!(line.contains("Path=/app"));
        assert!(line.contains("Secure"));
        assert!(line.contains("HttpOnly"));
    }
}
