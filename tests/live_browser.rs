//! Integration tests that drive a real Chrome/Chromium instance.
//!
//! All tests are `#[ignore]`d because they need a local browser install (and,
//! for the attach tests, an instance already listening on port 9222):
//!
//!   cargo test --test live_browser -- --ignored

use std::time::Duration;

use sessionbridge::{
    BrowserError, BrowserSessionConfig, LaunchMode, SessionExtractor, StorageState,
};

fn headless_config() -> BrowserSessionConfig {
    BrowserSessionConfig::new(LaunchMode::Standard).headless(true)
}

#[tokio::test]
#[ignore] // Requires a local Chrome/Chromium
async fn test_launch_navigate_stop() {
    sessionbridge::BrowserSession::with(headless_config(), |browser| async move {
        let page = browser.get_page(0).await?;
        page.goto("https://example.com").await?;
        assert!(browser.is_alive().await);
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
#[ignore] // Requires a local Chrome/Chromium
async fn test_double_start_fails() {
    let browser = sessionbridge::BrowserSession::new(headless_config());
    browser.start().await.unwrap();

    let err = browser.start().await.unwrap_err();
    assert!(matches!(err, BrowserError::InvalidState(_)));

    browser.stop().await.unwrap();
}

#[tokio::test]
#[ignore] // Requires a local Chrome/Chromium
async fn test_record_and_replay_json_response() {
    let capture = SessionExtractor::with(headless_config(), |extractor| async move {
        let page = extractor.get_page(0).await?;
        extractor.start_recording(&page).await?;
        page.goto("https://httpbin.org/json").await?;

        let capture = extractor
            .wait_for_response("httpbin.org/json", Duration::from_secs(30))
            .await?;
        Ok(capture)
    })
    .await
    .unwrap();

    assert_eq!(capture.method, "GET");
    assert!(capture.body.is_object());
    assert!(capture
        .request_headers
        .iter()
        .all(|(name, _)| !name.starts_with(':')));

    // The reconstructed session must work without any browser running.
    let session = sessionbridge::ExtractedSession::from_capture(&capture).unwrap();
    let response = session.get(&capture.url).send().await.unwrap();
    assert!(response.status().is_success());
}

#[tokio::test]
#[ignore] // Requires a local Chrome/Chromium
async fn test_non_json_responses_are_not_captured() {
    SessionExtractor::with(headless_config(), |extractor| async move {
        let page = extractor.get_page(0).await?;
        extractor.start_recording(&page).await?;
        page.goto("https://example.com").await?;
        page.wait_for_navigation().await?;

        // The document is text/html; nothing should have been captured.
        assert!(extractor.find_response("example.com").is_none());
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
#[ignore] // Requires a local Chrome/Chromium
async fn test_start_recording_twice_fails() {
    SessionExtractor::with(headless_config(), |extractor| async move {
        let page = extractor.get_page(0).await?;
        extractor.start_recording(&page).await?;

        let err = extractor.start_recording(&page).await.unwrap_err();
        assert!(matches!(err, BrowserError::InvalidState(_)));
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
#[ignore] // Requires a local Chrome/Chromium
async fn test_save_state_round_trips_through_disk() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");

    let config = headless_config().state_path(&state_path);
    sessionbridge::BrowserSession::with(config.clone(), |browser| async move {
        let page = browser.get_page(0).await?;
        page.goto("https://example.com").await?;
        page.wait_for_navigation().await?;
        page.evaluate(r#"localStorage.setItem("token", "xyz")"#).await?;
        browser.save_state(None).await?;
        Ok(())
    })
    .await
    .unwrap();

    let state = StorageState::load(&state_path).unwrap();
    assert!(state
        .origins
        .iter()
        .any(|o| o.origin.contains("example.com")
            && o.local_storage.iter().any(|e| e.name == "token" && e.value == "xyz")));

    // A second launch restores the same storage.
    sessionbridge::BrowserSession::with(config, |browser| async move {
        let page = browser.get_page(0).await?;
        page.goto("https://example.com").await?;
        page.wait_for_navigation().await?;
        let token: String = page
            .evaluate(r#"localStorage.getItem("token")"#)
            .await?
            .into_value()
            .unwrap_or_default();
        assert_eq!(token, "xyz");
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
#[ignore] // Requires a Chrome listening on http://localhost:9222
async fn test_attach_over_cdp() {
    let config = BrowserSessionConfig::new(LaunchMode::Cdp);
    sessionbridge::BrowserSession::with(config, |browser| async move {
        let page = browser.get_page(0).await?;
        let _ = page.url().await?;
        let err = browser.save_state(None).await.unwrap_err();
        assert!(matches!(err, BrowserError::Unsupported(_)));
        Ok(())
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_attach_to_unreachable_endpoint_fails_with_connection_error() {
    // No browser listens here; this one runs without any install.
    let config = BrowserSessionConfig::new(LaunchMode::Cdp).cdp_url("http://127.0.0.1:1");
    let browser = sessionbridge::BrowserSession::new(config);

    let err = browser.start().await.unwrap_err();
    assert!(matches!(err, BrowserError::Connection(_)));
}
