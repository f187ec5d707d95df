//! Browser control module
//!
//! Launching, attaching to, and tearing down Chrome/Chromium instances, plus
//! persistence of cookie/localStorage state across runs.

mod config;
mod errors;
mod session;
mod state;

pub use config::{BrowserSessionConfig, LaunchMode, DEFAULT_USER_AGENT};
pub use errors::BrowserError;
pub use session::BrowserSession;
pub use state::{OriginState, StorageEntry, StorageState, StoredCookie};
