use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

use crate::security::auth::AuthError;
use crate::security::token::VerificationError;
use crate::waf::{Category, RuleMatch};

/// Every way the gateway can refuse or fail a request.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Malformed service token")]
    MalformedToken,
    #[error("Unknown signing key")]
    UnknownKeyId,
    #[error("Invalid token signature")]
    BadSignature,
    #[error("Service token expired")]
    ExpiredToken,
    #[error("Service identity revoked")]
    RevokedIdentity,
    #[error("Insufficient scope: {0} required")]
    ScopeDenied(String),
    #[error("Request blocked by WAF ({0})")]
    WafBlocked(Category),
    #[error("Payload too large")]
    PayloadTooLarge,
    #[error("Malformed request header")]
    MalformedHeader,
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Duration },
    #[error("No route for request path")]
    RouteNotFound,
    #[error("Authentication temporarily unavailable")]
    AuthUnavailable,
    #[error("Downstream service timed out")]
    DownstreamTimeout,
    #[error("Downstream service unavailable")]
    DownstreamUnavailable,
    #[error("Internal server error")]
    Internal,
}

/// Wire shape of every error the gateway produces.
#[derive(Debug, Serialize)]
pub struct ErrorEnvelope {
    pub error: bool,
    pub message: String,
    pub status_code: u16,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::MalformedToken
            | GatewayError::UnknownKeyId
            | GatewayError::BadSignature
            | GatewayError::ExpiredToken => StatusCode::UNAUTHORIZED,
            GatewayError::RevokedIdentity | GatewayError::ScopeDenied(_) => StatusCode::FORBIDDEN,
            GatewayError::WafBlocked(_) | GatewayError::MalformedHeader => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
            GatewayError::AuthUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::DownstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::DownstreamUnavailable => StatusCode::BAD_GATEWAY,
            GatewayError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short stage-independent name, used in metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::MalformedToken => "malformed_token",
            GatewayError::UnknownKeyId => "unknown_key_id",
            GatewayError::BadSignature => "bad_signature",
            GatewayError::ExpiredToken => "expired_token",
            GatewayError::RevokedIdentity => "revoked_identity",
            GatewayError::ScopeDenied(_) => "scope_denied",
            GatewayError::WafBlocked(_) => "waf_blocked",
            GatewayError::PayloadTooLarge => "payload_too_large",
            GatewayError::MalformedHeader => "malformed_header",
            GatewayError::RateLimited { .. } => "rate_limited",
            GatewayError::RouteNotFound => "route_not_found",
            GatewayError::AuthUnavailable => "auth_unavailable",
            GatewayError::DownstreamTimeout => "downstream_timeout",
            GatewayError::DownstreamUnavailable => "downstream_unavailable",
            GatewayError::Internal => "internal",
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: true,
            message: self.to_string(),
            status_code: self.status().as_u16(),
        }
    }
}

impl From<&RuleMatch> for GatewayError {
    fn from(m: &RuleMatch) -> Self {
        match m.category {
            Category::OversizedBody => GatewayError::PayloadTooLarge,
            Category::MalformedHeader => GatewayError::MalformedHeader,
            other => GatewayError::WafBlocked(other),
        }
    }
}

impl From<VerificationError> for GatewayError {
    fn from(e: VerificationError) -> Self {
        match e {
            VerificationError::MalformedToken(_) => GatewayError::MalformedToken,
            VerificationError::UnknownKeyId => GatewayError::UnknownKeyId,
            VerificationError::BadSignature => GatewayError::BadSignature,
            VerificationError::ExpiredToken => GatewayError::ExpiredToken,
            VerificationError::RevokedIdentity => GatewayError::RevokedIdentity,
            VerificationError::Unavailable => GatewayError::AuthUnavailable,
        }
    }
}

impl From<AuthError> for GatewayError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::Verification(v) => v.into(),
            AuthError::ScopeDenied { scope, .. } => GatewayError::ScopeDenied(scope),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), Json(self.envelope())).into_response();
        if let GatewayError::RateLimited { retry_after } = &self {
            let secs = retry_after.as_secs().max(1).to_string();
            if let Ok(v) = HeaderValue::from_str(&secs) {
                response.headers_mut().insert(header::RETRY_AFTER, v);
            }
        }
        response
    }
}
