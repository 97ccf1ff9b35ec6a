use std::sync::OnceLock;
use std::time::Duration;

use anyhow::anyhow;
use log::warn;
use reqwest::{Client, StatusCode};

const TIMEOUT_ENV: &str = "LE_CERT_MANAGER_HTTP_TIMEOUT_SECS";

pub struct HttpClient;

impl HttpClient {
    pub fn shared() -> Client {
        static CLIENT: OnceLock<Client> = OnceLock::new();
        CLIENT
            .get_or_init(|| {
                let timeout = resolve_timeout();
                Client::builder()
                    .timeout(timeout)
                    .build()
                    .unwrap_or_else(|err| {
                        warn!("[http] failed to build shared client: {err}");
                        Client::new()
                    })
            })
            .clone()
    }
}

fn resolve_timeout() -> Duration {
    const DEFAULT_TIMEOUT_SECS: u64 = 30;
    let timeout = std::env::var(TIMEOUT_ENV)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    if timeout == 0 {
        warn!("[http] invalid timeout value; using default");
        return Duration::from_secs(DEFAULT_TIMEOUT_SECS);
    }
    Duration::from_secs(timeout)
}

pub fn status_error(service: &str, status: StatusCode, body: Option<String>) -> anyhow::Error {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return anyhow!("{service} authentication failed ({status})");
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        return anyhow!("{service} rate limit exceeded");
    }
    match body {
        Some(body) if !body.trim().is_empty() => anyhow!("{service} API error {status}: {body}"),
        _ => anyhow!("{service} API error: {status}"),
    }
}
