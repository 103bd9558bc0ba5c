use axum::http::{HeaderMap, HeaderName};
use std::sync::Arc;
use thiserror::Error;

use crate::security::audit_log::AuditLogger;
use crate::security::scopes::Scopes;
use crate::security::token::{TokenManager, VerificationError, VerifiedIdentity};

pub const DEFAULT_TOKEN_HEADER: &str = "x-service-token";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("service {service} lacks required scope {scope}")]
    ScopeDenied { service: String, scope: String },
}

/// Pulls the service token off a request, verifies it and checks the
/// route's scope requirement.
#[derive(Debug, Clone)]
pub struct AuthGuard {
    tokens: Arc<TokenManager>,
    header: HeaderName,
    audit: AuditLogger,
}

impl AuthGuard {
    pub fn new(tokens: Arc<TokenManager>, header: &str) -> anyhow::Result<Self> {
        let header = HeaderName::from_bytes(header.to_ascii_lowercase().as_bytes())
            .map_err(|e| anyhow::anyhow!("invalid token header name {header:?}: {e}"))?;
        Ok(Self {
            tokens,
            header,
            audit: AuditLogger::new(),
        })
    }

    pub fn header(&self) -> &HeaderName {
        &self.header
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Raw token value. Exactly one header is accepted.
    pub fn extract<'a>(&self, headers: &'a HeaderMap) -> Result<&'a str, VerificationError> {
        let mut values = headers.get_all(&self.header).iter();
        let value = values
            .next()
            .ok_or(VerificationError::MalformedToken("missing token header"))?;
        if values.next().is_some() {
            return Err(VerificationError::MalformedToken("duplicate token header"));
        }
        let raw = value
            .to_str()
            .map_err(|_| VerificationError::MalformedToken("token header not ascii"))?
            .trim();
        if raw.is_empty() {
            return Err(VerificationError::MalformedToken("empty token"));
        }
        Ok(raw)
    }

    pub fn authenticate(
        &self,
        headers: &HeaderMap,
        required: &Scopes,
        request_id: &str,
    ) -> Result<VerifiedIdentity, AuthError> {
        let raw = match self.extract(headers) {
            Ok(raw) => raw,
            Err(e) => {
                self.audit.auth_failure(None, request_id, &e.to_string());
                return Err(e.into());
            }
        };

        let identity = match self.tokens.verify(raw) {
            Ok(identity) => identity,
            Err(e) => {
                let claimed = crate::security::token::ServiceToken::peek_issuer(raw);
                self.audit
                    .auth_failure(claimed.as_deref(), request_id, &e.to_string());
                return Err(e.into());
            }
        };

        if let Some(scope) = identity.scopes.first_missing(required) {
            self.audit.scope_denied(&identity.service, request_id, scope);
            return Err(AuthError::ScopeDenied {
                service: identity.service,
                scope: scope.to_string(),
            });
        }

        self.audit.auth_success(&identity.service, request_id, &identity.kid);
        Ok(identity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::keys::{KeyAlgorithm, KeyRegistry};
    use crate::utils::clock::ManualClock;
    use axum::http::HeaderValue;
    use std::time::Duration;

    fn guard() -> AuthGuard {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        let registry = Arc::new(KeyRegistry::new(clock, chrono::Duration::hours(1), KeyAlgorithm::Hmac));
        registry
            .provision("fraud", Scopes::parse_csv("fraud:score,fraud:read").unwrap())
            .unwrap();
        let tm = Arc::new(TokenManager::new(registry, Duration::from_secs(3600)));
        AuthGuard::new(tm, "X-Service-Token").unwrap()
    }

    fn headers_with(guard: &AuthGuard, scopes: &str) -> HeaderMap {
        let token = guard
            .tokens()
            .issue("fraud", Scopes::parse_csv(scopes).unwrap(), Duration::from_secs(60))
            .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(DEFAULT_TOKEN_HEADER, HeaderValue::from_str(&token.encode()).unwrap());
        headers
    }

    #[test]
    fn missing_header_is_malformed() {
        let g = guard();
        let err = g.authenticate(&HeaderMap::new(), &Scopes::new(), "req-1").unwrap_err();
        assert!(matches!(
            err,
            AuthError::Verification(VerificationError::MalformedToken(_))
        ));
    }

    #[test]
    fn duplicate_header_is_malformed() {
        let g = guard();
        let mut headers = headers_with(&g, "fraud:score");
        headers.append(DEFAULT_TOKEN_HEADER, HeaderValue::from_static("other"));
        assert!(matches!(
            g.authenticate(&headers, &Scopes::new(), "req-1"),
            Err(AuthError::Verification(VerificationError::MalformedToken(_)))
        ));
    }

    #[test]
    fn scopes_enforced() {
        let g = guard();
        let headers = headers_with(&g, "fraud:read");
        let need = Scopes::parse_csv("fraud:score").unwrap();
        assert_eq!(
            g.authenticate(&headers, &need, "req-2"),
            Err(AuthError::ScopeDenied {
                service: "fraud".into(),
                scope: "fraud:score".into()
            })
        );
    }

    #[test]
    fn valid_token_passes() {
        let g = guard();
        let headers = headers_with(&g, "fraud:read,fraud:score");
        let need = Scopes::parse_csv("fraud:score").unwrap();
        let identity = g.authenticate(&headers, &need, "req-3").unwrap();
        assert_eq!(identity.service, "fraud");
    }
}
