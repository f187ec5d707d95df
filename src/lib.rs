//! sessionbridge
//!
//! Drive a real Chrome/Chromium instance, intercept the JSON API responses it
//! receives, and replay the authenticated context as a plain `reqwest` client
//! session, no browser required afterwards.
//!
//! Three ways to obtain a browser handle:
//!
//!   - [`LaunchMode::Standard`]: launch a fresh browser, no extras.
//!   - [`LaunchMode::Stealth`]: launch with anti-detection patches.
//!   - [`LaunchMode::Cdp`]: attach to an already-running browser over the
//!     DevTools protocol.
//!
//! ```no_run
//! use std::time::Duration;
//! use sessionbridge::{BrowserSessionConfig, LaunchMode, SessionExtractor};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), sessionbridge::BrowserError> {
//!     let config = BrowserSessionConfig::new(LaunchMode::Stealth);
//!     SessionExtractor::with(config, |extractor| async move {
//!         let page = extractor.get_page(0).await?;
//!         extractor.start_recording(&page).await?;
//!         page.goto("https://example.com").await?;
//!
//!         let capture = extractor
//!             .wait_for_response("api/data", Duration::from_secs(10))
//!             .await?;
//!         let session = extractor.to_session(&capture)?;
//!         let body = session
//!             .get("https://example.com/api/data")
//!             .send()
//!             .await?
//!             .text()
//!             .await?;
//!         println!("{body}");
//!         Ok(())
//!     })
//!     .await
//! }
//! ```

pub mod browser;
pub mod extractor;

pub use browser::{
    BrowserError, BrowserSession, BrowserSessionConfig, LaunchMode, OriginState, StorageEntry,
    StorageState, StoredCookie,
};
pub use extractor::{CaptureLog, CapturedCookie, CapturedResponse, ExtractedSession, SessionExtractor};
