//! Replays tunneled requests against the local HTTP server.

use std::time::Instant;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue as HttpHeaderValue};
use reqwest::{Method, Url, redirect};
use thiserror::Error;
use tracing::{debug, warn};

use outray_proto::{HeaderValue, Headers, RequestMessage, ResponseMessage};

use super::config::TunnelConfig;
use super::error::TunnelClientError;
use super::hooks::RequestInfo;
use super::shadow::{PendingShadow, ShadowMirror};

/// Status sent back whenever the local server cannot produce a response.
pub const BAD_GATEWAY: u16 = 502;

/// Request headers that describe the tunnel hop rather than the request and
/// are recomputed for the local call.
const SKIPPED_REQUEST_HEADERS: [&str; 3] = ["host", "content-length", "transfer-encoding"];

/// Failures before the local server is contacted.
#[derive(Debug, Error)]
enum ProxyError {
    #[error("Failed to decode body: {0}")]
    BodyDecode(#[from] base64::DecodeError),

    #[error("Failed to create request: {0}")]
    RequestBuild(String),
}

/// Result of proxying one request.
#[derive(Debug)]
pub struct ProxyOutcome {
    /// Frame to send back, tagged with the original request id.
    pub response: ResponseMessage,
    /// Observer notification; absent when no local call was attempted.
    pub info: Option<RequestInfo>,
    /// Shadow replay to run once the response has been sent.
    pub shadow: Option<PendingShadow>,
}

/// HTTP client bound to the local server.
#[derive(Debug, Clone)]
pub struct RequestProxy {
    http: reqwest::Client,
    base_url: String,
    shadow: Option<ShadowMirror>,
}

impl RequestProxy {
    pub fn new(config: &TunnelConfig) -> Result<Self, TunnelClientError> {
        // reqwest is built with rustls-no-provider.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .redirect(redirect::Policy::none())
            .no_proxy()
            .build()
            .map_err(|e| TunnelClientError::Config(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: config.local_base_url(),
            shadow: config.shadow.clone().map(ShadowMirror::new),
        })
    }

    /// Fulfil `req` against the local server. Always yields exactly one
    /// response frame; failures become `502`s.
    pub async fn handle(&self, req: RequestMessage) -> ProxyOutcome {
        let started = Instant::now();

        let request = match self.build_request(&req) {
            Ok(r) => r,
            Err(e) => {
                warn!(request_id = %req.request_id, error = %e, "Could not build local request");
                return ProxyOutcome {
                    response: error_response(&req.request_id, &e.to_string()),
                    info: None,
                    shadow: None,
                };
            }
        };

        let mirror = self
            .shadow
            .as_ref()
            .filter(|m| m.should_sample())
            .and_then(|m| Some((m, m.retarget(&request)?)));

        let resp = match self.http.execute(request).await {
            Ok(resp) => resp,
            Err(e) => {
                let error = error_text(&e);
                warn!(
                    request_id = %req.request_id,
                    method = %req.method,
                    path = %req.path,
                    error = %error,
                    "Local server unreachable"
                );
                return ProxyOutcome {
                    response: error_response(&req.request_id, &format!("Bad Gateway: {error}")),
                    info: Some(RequestInfo {
                        method: req.method,
                        path: req.path,
                        status_code: BAD_GATEWAY,
                        duration: started.elapsed(),
                        error: Some(error),
                    }),
                    shadow: None,
                };
            }
        };

        let status_code = resp.status().as_u16();
        let headers = collect_headers(resp.headers());
        let body = match resp.bytes().await {
            Ok(body) => body,
            Err(e) => {
                warn!(request_id = %req.request_id, error = %e, "Failed to read local response");
                return ProxyOutcome {
                    response: error_response(
                        &req.request_id,
                        &format!("Failed to read response: {}", error_text(&e)),
                    ),
                    info: None,
                    shadow: None,
                };
            }
        };

        let duration = started.elapsed();
        debug!(
            request_id = %req.request_id,
            status = status_code,
            bytes = body.len(),
            duration_ms = duration.as_millis(),
            "Proxied request"
        );

        let shadow = mirror.map(|(mirror, request)| {
            let primary = mirror.summarize(status_code, headers.clone(), &body, duration);
            mirror.pending(
                self.http.clone(),
                request,
                req.request_id.clone(),
                req.path.clone(),
                primary,
            )
        });

        ProxyOutcome {
            response: ResponseMessage {
                request_id: req.request_id,
                status_code,
                headers,
                body: (!body.is_empty()).then(|| BASE64.encode(&body)),
            },
            info: Some(RequestInfo {
                method: req.method,
                path: req.path,
                status_code,
                duration,
                error: None,
            }),
            shadow,
        }
    }

    fn build_request(&self, req: &RequestMessage) -> Result<reqwest::Request, ProxyError> {
        let body = match req.body.as_deref() {
            Some(encoded) if !encoded.is_empty() => Some(BASE64.decode(encoded)?),
            _ => None,
        };

        let method = Method::from_bytes(req.method.as_bytes())
            .map_err(|e| ProxyError::RequestBuild(format!("invalid method {:?}: {e}", req.method)))?;

        let separator = if req.path.starts_with('/') { "" } else { "/" };
        let url = Url::parse(&format!("{}{separator}{}", self.base_url, req.path))
            .map_err(|e| ProxyError::RequestBuild(format!("invalid path {:?}: {e}", req.path)))?;

        let mut builder = self.http.request(method, url).headers(apply_headers(&req.headers)?);
        if let Some(body) = body {
            builder = builder.body(body);
        }
        builder
            .build()
            .map_err(|e| ProxyError::RequestBuild(e.to_string()))
    }
}

/// Single values replace, list values append in order.
fn apply_headers(headers: &Headers) -> Result<HeaderMap, ProxyError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::RequestBuild(format!("invalid header name {name:?}: {e}")))?;
        if SKIPPED_REQUEST_HEADERS.contains(&name.as_str()) {
            continue;
        }
        let parse = |v: &str| {
            HttpHeaderValue::from_str(v).map_err(|e| {
                ProxyError::RequestBuild(format!("invalid value for header {name}: {e}"))
            })
        };
        match value {
            HeaderValue::Single(v) => {
                map.insert(name.clone(), parse(v)?);
            }
            HeaderValue::Multi(vs) => {
                for v in vs {
                    map.append(name.clone(), parse(v)?);
                }
            }
        }
    }
    Ok(map)
}

/// Lower-cased names; one value collapses to a scalar, several to a list.
pub(super) fn collect_headers(headers: &HeaderMap) -> Headers {
    headers
        .keys()
        .map(|name| {
            let values: Vec<String> = headers
                .get_all(name)
                .iter()
                .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
                .collect();
            (name.as_str().to_ascii_lowercase(), HeaderValue::from(values))
        })
        .collect()
}

/// Plain-text `502` frame for `request_id`.
pub fn error_response(request_id: &str, message: &str) -> ResponseMessage {
    ResponseMessage {
        request_id: request_id.to_string(),
        status_code: BAD_GATEWAY,
        headers: Headers::from([("content-type".to_string(), HeaderValue::from("text/plain"))]),
        body: Some(BASE64.encode(message.as_bytes())),
    }
}

/// Flatten an error and its sources into one line.
pub(super) fn error_text(err: &dyn std::error::Error) -> String {
    let mut text = err.to_string();
    let mut current = err.source();
    while let Some(e) = current {
        text.push_str(": ");
        text.push_str(&e.to_string());
        current = e.source();
    }
    text
}

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;
