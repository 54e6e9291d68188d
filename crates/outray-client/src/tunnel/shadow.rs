//! Shadow traffic: replays sampled requests against a second local server
//! and reports where its answer differs from the one the tunnel got.
//!
//! The shadow call runs after the primary response has been sent, so it
//! never delays or alters tunnel traffic. Bodies are compared by SHA-256 of
//! their first [`ShadowConfig::max_body_bytes`] bytes.

use std::time::{Duration, Instant};

use reqwest::Url;
use sha2::{Digest, Sha256};
use tracing::debug;

use outray_proto::Headers;

use super::config::ShadowConfig;
use super::proxy::{collect_headers, error_text};

/// Error recorded when the shadow server does not answer in time.
pub const SHADOW_TIMEOUT: &str = "Shadow request timed out";

/// One server's answer, reduced to what is compared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseSummary {
    /// Absent when the request failed.
    pub status_code: Option<u16>,
    pub headers: Headers,
    /// Hex SHA-256 of the hashed prefix; absent for an empty body.
    pub body_hash: Option<String>,
    /// Full body length, including any part past the hashed prefix.
    pub body_bytes: usize,
    pub duration: Duration,
    pub truncated: bool,
    pub error: Option<String>,
}

/// Which aspects of the two responses disagree.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Differences {
    pub status: bool,
    /// Compared header names whose values differ, as configured.
    pub headers: Vec<String>,
    pub body: bool,
}

impl Differences {
    pub fn any(&self) -> bool {
        self.status || self.body || !self.headers.is_empty()
    }
}

/// Reported through [`TunnelHooks::on_shadow_diff`](super::hooks::TunnelHooks::on_shadow_diff).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShadowDiff {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub primary: ResponseSummary,
    pub shadow: ResponseSummary,
    pub differences: Differences,
}

/// Sampling and summarizing for one shadow target.
#[derive(Debug, Clone)]
pub struct ShadowMirror {
    config: ShadowConfig,
}

/// A sampled request, ready to be replayed once the primary response is out.
#[derive(Debug)]
pub struct PendingShadow {
    http: reqwest::Client,
    request: reqwest::Request,
    request_id: String,
    path: String,
    primary: ResponseSummary,
    config: ShadowConfig,
}

impl ShadowMirror {
    pub const fn new(config: ShadowConfig) -> Self {
        Self { config }
    }

    /// Whether this request should be mirrored.
    pub fn should_sample(&self) -> bool {
        let rate = self.config.sample_rate;
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        rand::random::<f64>() < rate
    }

    /// Copy of `request` aimed at the shadow target. `None` when the body
    /// cannot be cloned or the target URL does not parse.
    pub fn retarget(&self, request: &reqwest::Request) -> Option<reqwest::Request> {
        let mut copy = request.try_clone()?;
        let path = request.url().path();
        let query = request.url().query().map(|q| format!("?{q}")).unwrap_or_default();
        let url = Url::parse(&format!("{}{path}{query}", self.config.base_url()))
            .inspect_err(|e| debug!(error = %e, "Invalid shadow target URL"))
            .ok()?;
        *copy.url_mut() = url;
        Some(copy)
    }

    pub fn summarize(
        &self,
        status_code: u16,
        headers: Headers,
        body: &[u8],
        duration: Duration,
    ) -> ResponseSummary {
        let hashed = &body[..body.len().min(self.config.max_body_bytes)];
        ResponseSummary {
            status_code: Some(status_code),
            headers,
            body_hash: body_hash(hashed),
            body_bytes: body.len(),
            duration,
            truncated: body.len() > hashed.len(),
            error: None,
        }
    }

    pub fn pending(
        &self,
        http: reqwest::Client,
        request: reqwest::Request,
        request_id: String,
        path: String,
        primary: ResponseSummary,
    ) -> PendingShadow {
        PendingShadow {
            http,
            request,
            request_id,
            path,
            primary,
            config: self.config.clone(),
        }
    }
}

impl PendingShadow {
    /// Send the shadow request and compare. `None` when both agree.
    pub async fn run(self) -> Option<ShadowDiff> {
        let Self {
            http,
            request,
            request_id,
            path,
            primary,
            config,
        } = self;
        let method = request.method().to_string();
        let shadow = forward(&http, request, &config).await;
        let differences = compare(&primary, &shadow, &config.compare_headers);
        if !differences.any() {
            debug!(request_id = %request_id, "Shadow response matches");
            return None;
        }
        Some(ShadowDiff {
            request_id,
            method,
            path,
            primary,
            shadow,
            differences,
        })
    }
}

/// Replay `request`, keeping at most `max_body_bytes` of the body for hashing.
async fn forward(
    http: &reqwest::Client,
    request: reqwest::Request,
    config: &ShadowConfig,
) -> ResponseSummary {
    let started = Instant::now();
    let max = config.max_body_bytes;

    let exchange = async {
        let mut resp = http.execute(request).await?;
        let status_code = resp.status().as_u16();
        let headers = collect_headers(resp.headers());
        let mut kept = Vec::new();
        let mut total = 0usize;
        while let Some(chunk) = resp.chunk().await? {
            let room = max.saturating_sub(kept.len()).min(chunk.len());
            kept.extend_from_slice(&chunk[..room]);
            total += chunk.len();
        }
        Ok::<_, reqwest::Error>((status_code, headers, kept, total))
    };

    match tokio::time::timeout(config.timeout, exchange).await {
        Ok(Ok((status_code, headers, kept, total))) => ResponseSummary {
            status_code: Some(status_code),
            headers,
            body_hash: body_hash(&kept),
            body_bytes: total,
            duration: started.elapsed(),
            truncated: total > kept.len(),
            error: None,
        },
        Ok(Err(e)) => failed(error_text(&e), started),
        Err(_) => failed(SHADOW_TIMEOUT.into(), started),
    }
}

fn failed(error: String, started: Instant) -> ResponseSummary {
    ResponseSummary {
        duration: started.elapsed(),
        error: Some(error),
        ..ResponseSummary::default()
    }
}

fn body_hash(body: &[u8]) -> Option<String> {
    (!body.is_empty()).then(|| hex::encode(Sha256::digest(body)))
}

/// Status and body hash always; headers only those named in `compare_headers`.
fn compare(
    primary: &ResponseSummary,
    shadow: &ResponseSummary,
    compare_headers: &[String],
) -> Differences {
    let headers = compare_headers
        .iter()
        .filter(|name| {
            let key = name.to_ascii_lowercase();
            primary.headers.get(&key) != shadow.headers.get(&key)
        })
        .cloned()
        .collect();
    Differences {
        status: primary.status_code != shadow.status_code,
        headers,
        body: primary.body_hash != shadow.body_hash,
    }
}
