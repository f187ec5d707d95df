//! Browser error types

use thiserror::Error;

/// Errors surfaced by browser control, response capture, and session extraction.
#[derive(Error, Debug)]
pub enum BrowserError {
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Failed to launch browser: {0}")]
    LaunchFailed(String),

    #[error("Failed to connect to browser: {0}")]
    Connection(String),

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Corrupt state file: {0}")]
    CorruptState(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Browser engine error: {0}")]
    Engine(#[from] chromiumoxide::error::CdpError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
