use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderValue, Method};
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use uuid::Uuid;

use crate::security::auth::AuthError;
use crate::security::token::VerifiedIdentity;
use crate::waf::RuleMatch;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_REQUEST_ID_LEN: usize = 128;

/// Peer address of the connection, or loopback when the router runs without
/// connect info (tests, in-process calls).
///
/// `x-forwarded-for` is ignored: it is client controlled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(ConnectInfo(addr)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
            return Ok(ClientIp(addr.ip()));
        }
        if let Some(addr) = parts.extensions.get::<SocketAddr>() {
            return Ok(ClientIp(addr.ip()));
        }
        Ok(ClientIp(IpAddr::from([127, 0, 0, 1])))
    }
}

/// Reuse a caller-supplied request id when it is short printable ASCII,
/// otherwise mint a UUIDv4.
pub fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| is_well_formed_request_id(id))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn is_well_formed_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_REQUEST_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':'))
}

/// Everything the pipeline knows about one request. Owned by that request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub client_ip: IpAddr,
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    /// At most `max_body_bytes` of the body.
    pub body: Bytes,
    /// The body was longer than the cap and was not read in full.
    pub body_truncated: bool,
    pub matched_rule: Option<RuleMatch>,
    pub auth_result: Option<Result<VerifiedIdentity, AuthError>>,
}

impl RequestContext {
    pub fn new(request_id: String, client_ip: IpAddr, method: Method, path: &str, query: Option<&str>, headers: HeaderMap) -> Self {
        Self {
            request_id,
            client_ip,
            method,
            path: path.to_string(),
            query: query.map(str::to_string),
            headers,
            body: Bytes::new(),
            body_truncated: false,
            matched_rule: None,
            auth_result: None,
        }
    }

    pub fn with_body(mut self, body: Bytes, truncated: bool) -> Self {
        self.body = body;
        self.body_truncated = truncated;
        self
    }

    /// Path plus query as sent by the client.
    pub fn uri_len(&self) -> usize {
        self.path.len() + self.query.as_ref().map(|q| q.len() + 1).unwrap_or(0)
    }

    pub fn request_id_header(&self) -> Option<HeaderValue> {
        HeaderValue::from_str(&self.request_id).ok()
    }
}
