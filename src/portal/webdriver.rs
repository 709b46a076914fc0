use anyhow::{Context, Result, bail};
use fantoccini::{Client, ClientBuilder};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::map::Map as JsonMap;
use std::time::Duration;

use crate::{common::truncate_for_log, config::BrowserSettings};

const STATUS_ATTEMPTS: u32 = 5;
const STATUS_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct StatusResponse {
    value: StatusValue,
}

#[derive(Debug, Deserialize)]
struct StatusValue {
    #[serde(default)]
    ready: bool,
    #[serde(default)]
    message: String,
}

fn status_url(webdriver_url: &str) -> String {
    format!("{}/status", webdriver_url.trim_end_matches('/'))
}

fn parse_status(body: &str) -> Result<StatusValue> {
    let parsed: StatusResponse = serde_json::from_str(body)
        .with_context(|| format!("Invalid WebDriver status body: {}", truncate_for_log(body)))?;
    Ok(parsed.value)
}

/// Polls `GET {webdriver}/status` until the driver reports ready.
pub async fn wait_until_ready(http: &reqwest::Client, webdriver_url: &str) -> Result<()> {
    let url = status_url(webdriver_url);
    let mut backoff = Duration::from_secs(1);

    for attempt in 1..=STATUS_ATTEMPTS {
        let outcome = match http.get(&url).timeout(STATUS_TIMEOUT).send().await {
            Ok(resp) if resp.status() == StatusCode::OK => match resp.text().await {
                Ok(body) => parse_status(&body).map(|status| {
                    if status.ready {
                        None
                    } else {
                        Some(format!("driver not ready: {}", status.message))
                    }
                }),
                Err(err) => Ok(Some(format!("failed reading status body: {err}"))),
            },
            Ok(resp) => Ok(Some(format!("status endpoint returned {}", resp.status()))),
            Err(err) => Ok(Some(format!("status request failed: {err}"))),
        };

        match outcome? {
            None => {
                tracing::debug!(target: "portal_webdriver", attempt, "WebDriver is ready at {url}");
                return Ok(());
            }
            Some(reason) if attempt < STATUS_ATTEMPTS => {
                tracing::warn!(target: "portal_webdriver", attempt, "{reason}; retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
                backoff = (backoff + backoff).min(Duration::from_secs(10));
            }
            Some(reason) => {
                bail!("WebDriver at {webdriver_url} not ready after {STATUS_ATTEMPTS} attempts: {reason}");
            }
        }
    }
    bail!("WebDriver at {webdriver_url} not ready")
}

fn chrome_capabilities(headless: bool) -> JsonMap<String, serde_json::Value> {
    let mut args = vec![
        "--no-sandbox",
        "--disable-gpu",
        "--disable-dev-shm-usage",
        "--window-size=1366,900",
        "--disable-extensions",
        "--disable-background-networking",
        "--disable-sync",
        "--disable-translate",
        "--mute-audio",
        "--ignore-certificate-errors",
        "--log-level=1",
    ];
    if headless {
        args.insert(0, "--headless=new");
    }

    let mut chrome_opts = JsonMap::new();
    chrome_opts.insert("args".to_string(), serde_json::json!(args));

    let mut caps = JsonMap::new();
    caps.insert("browserName".to_string(), serde_json::json!("chrome"));
    caps.insert("goog:chromeOptions".to_string(), serde_json::json!(chrome_opts));
    caps
}

/// Opens a Chrome session on the configured WebDriver endpoint.
pub async fn connect(http: &reqwest::Client, settings: &BrowserSettings) -> Result<Client> {
    wait_until_ready(http, &settings.webdriver_url).await?;

    let caps = chrome_capabilities(settings.headless);
    tracing::trace!(target: "portal_webdriver", "WebDriver capabilities: {:?}", caps);

    let mut builder = ClientBuilder::native();
    builder.capabilities(caps);
    let client = builder
        .connect(&settings.webdriver_url)
        .await
        .with_context(|| format!("Failed connecting to WebDriver at {}", settings.webdriver_url))?;

    tracing::info!(
        target: "portal_webdriver",
        headless = settings.headless,
        "WebDriver session opened"
    );
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_url_ignores_trailing_slash() {
        assert_eq!(status_url("http://localhost:9515/"), "http://localhost:9515/status");
        assert_eq!(status_url("http://selenium:4444/wd/hub"), "http://selenium:4444/wd/hub/status");
    }

    #[test]
    fn parses_driver_status() {
        let ready = parse_status(r#"{"value":{"ready":true,"message":"ChromeDriver ready for new sessions."}}"#)
            .unwrap();
        assert!(ready.ready);

        let busy = parse_status(r#"{"value":{"message":"busy"}}"#).unwrap();
        assert!(!busy.ready);
        assert_eq!(busy.message, "busy");

        assert!(parse_status("<html>").is_err());
    }

    #[test]
    fn headless_flag_controls_chrome_args() {
        let caps = chrome_capabilities(true);
        let args = caps["goog:chromeOptions"]["args"].as_array().unwrap();
        assert_eq!(args[0], "--headless=new");

        let caps = chrome_capabilities(false);
        let args = caps["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(args.iter().all(|arg| arg != "--headless=new"));
    }
}
