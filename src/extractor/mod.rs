//! Session extraction module
//!
//! Records the JSON responses a page receives and reconstructs authenticated
//! HTTP client sessions from them.

mod capture;
mod http;
mod recorder;

pub use capture::{CaptureLog, CapturedCookie, CapturedResponse};
pub use http::ExtractedSession;
pub use recorder::SessionExtractor;
