use anyhow::Context;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Method, Response};
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ProxyConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("downstream timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },
    #[error("downstream unreachable after {attempts} attempt(s): {reason}")]
    Unavailable { attempts: u32, reason: String },
}

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers named in `Connection` are hop-by-hop as well.
    let named: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|n| HeaderName::from_bytes(n.trim().as_bytes()).ok())
        .collect();
    for name in HOP_BY_HOP.iter().chain(named.iter()) {
        headers.remove(name);
    }
}

pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::DELETE | Method::TRACE
    )
}

/// Outbound HTTP client for downstream services.
#[derive(Debug, Clone)]
pub struct ProxyClient {
    client: reqwest::Client,
    max_retries: u32,
    backoff: Duration,
}

impl ProxyClient {
    pub fn new(cfg: &ProxyConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("creating downstream HTTP client")?;
        Ok(Self {
            client,
            max_retries: cfg.max_retries,
            backoff: Duration::from_millis(cfg.retry_backoff_ms),
        })
    }

    /// Send the request and buffer the response. Transport failures are
    /// retried for idempotent methods only; any HTTP response, including a
    /// 5xx, is relayed as received.
    pub async fn forward(
        &self,
        method: Method,
        url: &str,
        mut headers: HeaderMap,
        body: Bytes,
    ) -> Result<Response<Body>, ProxyError> {
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        headers.remove(header::CONTENT_LENGTH);

        let attempts_allowed = if is_idempotent(&method) { self.max_retries + 1 } else { 1 };
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .request(method.clone(), url)
                .headers(headers.clone())
                .body(body.clone())
                .send()
                .await;

            let err = match result {
                Ok(resp) => return relay(resp, attempt).await,
                Err(err) => err,
            };

            if attempt >= attempts_allowed {
                warn!(%method, url, attempt, error = %err, "downstream request failed");
                return Err(if err.is_timeout() {
                    ProxyError::Timeout { attempts: attempt }
                } else {
                    ProxyError::Unavailable {
                        attempts: attempt,
                        reason: err.to_string(),
                    }
                });
            }
            debug!(%method, url, attempt, error = %err, "retrying downstream request");
            tokio::time::sleep(self.backoff * attempt).await;
        }
    }
}

async fn relay(resp: reqwest::Response, attempts: u32) -> Result<Response<Body>, ProxyError> {
    let status = resp.status();
    let mut headers = resp.headers().clone();
    let body = resp.bytes().await.map_err(|e| {
        if e.is_timeout() {
            ProxyError::Timeout { attempts }
        } else {
            ProxyError::Unavailable {
                attempts,
                reason: e.to_string(),
            }
        }
    })?;
    strip_hop_by_hop(&mut headers);
    headers.remove(header::CONTENT_LENGTH);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}
