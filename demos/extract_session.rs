//! Capture a JSON API response and replay it without the browser
//!
//! Run with: cargo run --example extract_session [url] [url-fragment]

use std::time::Duration;

use sessionbridge::{BrowserSessionConfig, LaunchMode, SessionExtractor};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("info,sessionbridge=debug")
        .init();

    let mut args = std::env::args().skip(1);
    let target = args
        .next()
        .unwrap_or_else(|| "https://httpbin.org/json".to_string());
    let fragment = args.next().unwrap_or_else(|| "json".to_string());

    println!("=== Session Extraction Demo ===\n");
    println!("Target URL:   {}", target);
    println!("URL fragment: {}\n", fragment);

    let config = BrowserSessionConfig::new(LaunchMode::Standard).headless(true);

    let capture = SessionExtractor::with(config, |extractor| {
        let target = target.clone();
        let fragment = fragment.clone();
        async move {
            println!("Step 1: Browser started, beginning recording...");
            let page = extractor.get_page(0).await?;
            extractor.start_recording(&page).await?;

            println!("Step 2: Navigating to {}...", target);
            page.goto(target.as_str()).await?;

            println!("Step 3: Waiting for a JSON response matching {:?}...", fragment);
            let capture = extractor
                .wait_for_response(&fragment, Duration::from_secs(20))
                .await?;

            println!("\nCaptured {} {} ({})", capture.method, capture.url, capture.status);
            println!("  {} request headers forwarded", capture.request_headers.len());
            println!("  {} cookies in scope", capture.cookies.len());

            Ok(capture)
        }
    })
    .await?;

    println!("\nStep 4: Replaying outside the browser...");
    let session = sessionbridge::ExtractedSession::from_capture(&capture)?;
    let response = session.get(&capture.url).send().await?;

    println!("  Replay status: {}", response.status());
    let body = response.text().await?;
    let preview: String = body.chars().take(200).collect();
    println!("  Replay body ({} bytes): {}", body.len(), preview);

    Ok(())
}
