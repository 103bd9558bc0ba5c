use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use super::keys::{IdentityStatus, KeyAlgorithm, KeyRegistry, RegistryError, RotationState};
use super::scopes::Scopes;
use super::signing::{decode_b64url, encode_b64url, SigningError};

/// Upper bound on the encoded token; anything longer is rejected unparsed.
pub const MAX_TOKEN_LEN: usize = 4096;

const CANONICAL_PREFIX: &[u8] = b"service-token/v1\n";

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("unknown or revoked service: {0}")]
    UnknownService(String),
    #[error("service {service} may not be granted scope {scope}")]
    ScopeNotAllowed { service: String, scope: String },
    #[error("ttl must be between 1s and {max_secs}s")]
    InvalidTtl { max_secs: u64 },
    #[error("signing keys unavailable for {0}")]
    Unavailable(String),
    #[error("invalid subject")]
    InvalidSubject,
    #[error(transparent)]
    Signing(#[from] SigningError),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VerificationError {
    #[error("malformed token: {0}")]
    MalformedToken(&'static str),
    #[error("unknown key id")]
    UnknownKeyId,
    #[error("bad signature")]
    BadSignature,
    #[error("token expired")]
    ExpiredToken,
    #[error("issuer identity revoked")]
    RevokedIdentity,
    #[error("signing keys unavailable")]
    Unavailable,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct WireClaims {
    iss: String,
    sub: String,
    scp: Scopes,
    kid: String,
    iat: i64,
    exp: i64,
    alg: String,
}

/// Signed bearer credential. Built per call and never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceToken {
    pub issuer: String,
    pub subject: String,
    pub scopes: Scopes,
    pub kid: String,
    pub issued_at: i64,
    pub expires_at: i64,
    pub alg: KeyAlgorithm,
    pub signature: Vec<u8>,
}

impl ServiceToken {
    /// Bytes covered by the signature. Each field is length-prefixed so no
    /// two distinct claim sets share an encoding.
    pub fn signing_input(&self) -> Vec<u8> {
        canonical_bytes(
            &self.issuer,
            &self.subject,
            &self.scopes,
            &self.kid,
            self.issued_at,
            self.expires_at,
        )
    }

    pub fn encode(&self) -> String {
        let claims = WireClaims {
            iss: self.issuer.clone(),
            sub: self.subject.clone(),
            scp: self.scopes.clone(),
            kid: self.kid.clone(),
            iat: self.issued_at,
            exp: self.expires_at,
            alg: self.alg.token_alg().to_string(),
        };
        // Serializing plain strings and integers cannot fail.
        let payload = serde_json::to_vec(&claims).unwrap_or_default();
        format!("{}.{}", encode_b64url(&payload), encode_b64url(&self.signature))
    }

    pub fn parse(raw: &str) -> Result<Self, VerificationError> {
        if raw.is_empty() {
            return Err(VerificationError::MalformedToken("empty token"));
        }
        if raw.len() > MAX_TOKEN_LEN {
            return Err(VerificationError::MalformedToken("token too long"));
        }
        let (payload, signature) = raw
            .split_once('.')
            .ok_or(VerificationError::MalformedToken("expected payload.signature"))?;
        if signature.contains('.') {
            return Err(VerificationError::MalformedToken("expected payload.signature"));
        }

        let payload = decode_b64url(payload).ok_or(VerificationError::MalformedToken("payload encoding"))?;
        let signature = decode_b64url(signature).ok_or(VerificationError::MalformedToken("signature encoding"))?;
        let claims: WireClaims =
            serde_json::from_slice(&payload).map_err(|_| VerificationError::MalformedToken("claims"))?;
        let alg = KeyAlgorithm::from_token_alg(&claims.alg)
            .ok_or(VerificationError::MalformedToken("unsupported alg"))?;
        if claims.iss.is_empty() || claims.kid.is_empty() || claims.sub.is_empty() {
            return Err(VerificationError::MalformedToken("missing claim"));
        }
        if claims.exp <= claims.iat {
            return Err(VerificationError::MalformedToken("exp before iat"));
        }

        Ok(ServiceToken {
            issuer: claims.iss,
            subject: claims.sub,
            scopes: claims.scp,
            kid: claims.kid,
            issued_at: claims.iat,
            expires_at: claims.exp,
            alg,
            signature,
        })
    }

    /// Claimed issuer without any verification. Only good for bucketing
    /// requests before authentication has run.
    pub fn peek_issuer(raw: &str) -> Option<String> {
        Self::parse(raw).ok().map(|t| t.issuer)
    }
}

fn canonical_bytes(iss: &str, sub: &str, scopes: &Scopes, kid: &str, iat: i64, exp: i64) -> Vec<u8> {
    let scopes = scopes.to_csv();
    let iat = iat.to_string();
    let exp = exp.to_string();
    let mut out = CANONICAL_PREFIX.to_vec();
    for field in [iss, sub, scopes.as_str(), kid, iat.as_str(), exp.as_str()] {
        out.extend_from_slice(field.len().to_string().as_bytes());
        out.push(b':');
        out.extend_from_slice(field.as_bytes());
        out.push(b'\n');
    }
    out
}

/// What a successfully verified token asserts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifiedIdentity {
    pub service: String,
    pub subject: String,
    pub scopes: Scopes,
    pub kid: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct TokenManager {
    registry: Arc<KeyRegistry>,
    max_ttl: Duration,
}

impl TokenManager {
    pub fn new(registry: Arc<KeyRegistry>, max_ttl: Duration) -> Self {
        Self { registry, max_ttl }
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    pub fn issue(&self, service: &str, scopes: Scopes, ttl: Duration) -> Result<ServiceToken, IssueError> {
        self.issue_for(service, service, scopes, ttl)
    }

    /// Issue a token for `service` acting on behalf of `subject`.
    pub fn issue_for(
        &self,
        service: &str,
        subject: &str,
        scopes: Scopes,
        ttl: Duration,
    ) -> Result<ServiceToken, IssueError> {
        let ttl_secs = ttl.as_secs();
        if ttl_secs == 0 || ttl > self.max_ttl {
            return Err(IssueError::InvalidTtl {
                max_secs: self.max_ttl.as_secs(),
            });
        }
        if subject.is_empty() || subject.len() > 128 || subject.chars().any(char::is_control) {
            return Err(IssueError::InvalidSubject);
        }

        // The key is fetched once; a concurrent rotation cannot change which
        // key signs this token.
        let key = self.registry.get_active_key(service).map_err(|e| match e {
            RegistryError::Unavailable(s) => IssueError::Unavailable(s),
            _ => IssueError::UnknownService(service.to_string()),
        })?;
        let identity = self
            .registry
            .identity(service)
            .ok_or_else(|| IssueError::UnknownService(service.to_string()))?;
        if let Some(scope) = identity.allowed_scopes.first_missing(&scopes) {
            return Err(IssueError::ScopeNotAllowed {
                service: service.to_string(),
                scope: scope.to_string(),
            });
        }

        let issued_at = self.registry.clock().now().timestamp();
        let expires_at = issued_at + ttl_secs as i64;
        let mut token = ServiceToken {
            issuer: service.to_string(),
            subject: subject.to_string(),
            scopes,
            kid: key.kid.clone(),
            issued_at,
            expires_at,
            alg: key.algorithm(),
            signature: Vec::new(),
        };
        token.signature = key.material.sign(&token.signing_input())?;
        debug!(service, kid = %token.kid, expires_at, "issued service token");
        Ok(token)
    }

    /// Verify an encoded token. Reads registry state only.
    pub fn verify(&self, raw: &str) -> Result<VerifiedIdentity, VerificationError> {
        let token = ServiceToken::parse(raw)?;
        self.verify_token(&token)
    }

    pub fn verify_token(&self, token: &ServiceToken) -> Result<VerifiedIdentity, VerificationError> {
        let lookup = self
            .registry
            .lookup(&token.issuer, &token.kid)
            .map_err(|e| match e {
                RegistryError::Unavailable(_) => VerificationError::Unavailable,
                _ => VerificationError::UnknownKeyId,
            })?;

        let key = &lookup.key;
        // The key decides the algorithm; a mismatched `alg` claim never
        // selects a different verifier.
        if key.algorithm() != token.alg || !key.material.verify(&token.signing_input(), &token.signature) {
            return Err(VerificationError::BadSignature);
        }

        let now = self.registry.clock().now();
        if now.timestamp() >= token.expires_at {
            return Err(VerificationError::ExpiredToken);
        }
        if lookup.identity_status == IdentityStatus::Revoked {
            return Err(VerificationError::RevokedIdentity);
        }
        if key.rotation_state == RotationState::Revoked {
            // Revoked key of a since-reinstated identity.
            return Err(VerificationError::UnknownKeyId);
        }

        Ok(VerifiedIdentity {
            service: token.issuer.clone(),
            subject: token.subject.clone(),
            scopes: token.scopes.clone(),
            kid: token.kid.clone(),
            expires_at: DateTime::from_timestamp(token.expires_at, 0).unwrap_or(now),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::keys::SecretGeneration;
    use crate::utils::clock::ManualClock;

    const START: i64 = 1_700_000_000;

    fn setup(alg: KeyAlgorithm) -> (Arc<ManualClock>, TokenManager) {
        let clock = Arc::new(ManualClock::at_unix(START));
        let registry = Arc::new(
            KeyRegistry::new(clock.clone(), chrono::Duration::seconds(120), alg)
                .with_max_token_ttl(chrono::Duration::seconds(3600)),
        );
        registry
            .provision("forecast", Scopes::parse_csv("forecast:read,forecast:write").unwrap())
            .unwrap();
        (clock, TokenManager::new(registry, Duration::from_secs(3600)))
    }

    fn scopes(raw: &str) -> Scopes {
        Scopes::parse_csv(raw).unwrap()
    }

    #[test]
    fn issue_then_verify_round_trip() {
        for alg in [KeyAlgorithm::Hmac, KeyAlgorithm::Ed25519] {
            let (_, tm) = setup(alg);
            let token = tm
                .issue("forecast", scopes("forecast:read"), Duration::from_secs(60))
                .unwrap();
            let verified = tm.verify(&token.encode()).unwrap();
            assert_eq!(verified.service, "forecast");
            assert_eq!(verified.subject, "forecast");
            assert_eq!(verified.scopes, scopes("forecast:read"));
            assert_eq!(verified.kid, "v1");
        }
    }

    #[test]
    fn expires_exactly_at_ttl() {
        let (clock, tm) = setup(KeyAlgorithm::Hmac);
        let raw = tm
            .issue("forecast", scopes("forecast:read"), Duration::from_secs(60))
            .unwrap()
            .encode();

        clock.advance(chrono::Duration::seconds(59));
        assert!(tm.verify(&raw).is_ok());
        clock.advance(chrono::Duration::seconds(1));
        assert_eq!(tm.verify(&raw), Err(VerificationError::ExpiredToken));
    }

    #[test]
    fn issue_rejects_unknown_and_bad_requests() {
        let (_, tm) = setup(KeyAlgorithm::Hmac);
        assert!(matches!(
            tm.issue("nobody", Scopes::new(), Duration::from_secs(10)),
            Err(IssueError::UnknownService(_))
        ));
        assert!(matches!(
            tm.issue("forecast", scopes("fraud:score"), Duration::from_secs(10)),
            Err(IssueError::ScopeNotAllowed { .. })
        ));
        assert!(matches!(
            tm.issue("forecast", Scopes::new(), Duration::from_millis(500)),
            Err(IssueError::InvalidTtl { .. })
        ));
        assert!(matches!(
            tm.issue("forecast", Scopes::new(), Duration::from_secs(7200)),
            Err(IssueError::InvalidTtl { .. })
        ));
        assert!(matches!(
            tm.issue_for("forecast", "", Scopes::new(), Duration::from_secs(10)),
            Err(IssueError::InvalidSubject)
        ));
    }

    #[test]
    fn tampered_claims_fail_signature() {
        let (_, tm) = setup(KeyAlgorithm::Hmac);
        let mut token = tm
            .issue("forecast", scopes("forecast:read"), Duration::from_secs(60))
            .unwrap();
        token.scopes = scopes("forecast:read,forecast:write");
        assert_eq!(tm.verify(&token.encode()), Err(VerificationError::BadSignature));
    }

    #[test]
    fn alg_claim_cannot_switch_verifier() {
        let (_, tm) = setup(KeyAlgorithm::Ed25519);
        let mut token = tm.issue("forecast", Scopes::new(), Duration::from_secs(60)).unwrap();
        token.alg = KeyAlgorithm::Hmac;
        assert_eq!(tm.verify(&token.encode()), Err(VerificationError::BadSignature));
    }

    #[test]
    fn malformed_inputs() {
        let (_, tm) = setup(KeyAlgorithm::Hmac);
        for raw in ["", "abc", "a.b.c", "!!!.???", &"x".repeat(MAX_TOKEN_LEN + 1)] {
            assert!(matches!(tm.verify(raw), Err(VerificationError::MalformedToken(_))));
        }
        let payload = encode_b64url(br#"{"iss":"forecast"}"#);
        assert!(matches!(
            tm.verify(&format!("{payload}.AAAA")),
            Err(VerificationError::MalformedToken(_))
        ));
    }

    #[test]
    fn unknown_issuer_or_kid() {
        let (_, tm) = setup(KeyAlgorithm::Hmac);
        let mut token = tm.issue("forecast", Scopes::new(), Duration::from_secs(60)).unwrap();
        token.kid = "v9".to_string();
        assert_eq!(tm.verify(&token.encode()), Err(VerificationError::UnknownKeyId));

        token.kid = "v1".to_string();
        token.issuer = "ghost".to_string();
        assert_eq!(tm.verify(&token.encode()), Err(VerificationError::UnknownKeyId));
    }

    #[test]
    fn rotation_grace_then_unknown_kid() {
        let (clock, tm) = setup(KeyAlgorithm::Hmac);
        let old = tm.issue("forecast", Scopes::new(), Duration::from_secs(3600)).unwrap().encode();

        tm.registry().rotate("forecast").unwrap();
        let fresh = tm.issue("forecast", Scopes::new(), Duration::from_secs(60)).unwrap();
        assert_eq!(fresh.kid, "v2");
        assert!(tm.verify(&old).is_ok());

        clock.advance(chrono::Duration::seconds(120));
        assert_eq!(tm.verify(&old), Err(VerificationError::UnknownKeyId));
    }

    #[test]
    fn revoke_invalidates_outstanding_tokens() {
        let (_, tm) = setup(KeyAlgorithm::Hmac);
        let raw = tm.issue("forecast", Scopes::new(), Duration::from_secs(600)).unwrap().encode();
        tm.registry().revoke("forecast").unwrap();
        assert_eq!(tm.verify(&raw), Err(VerificationError::RevokedIdentity));
        assert!(matches!(
            tm.issue("forecast", Scopes::new(), Duration::from_secs(60)),
            Err(IssueError::UnknownService(_))
        ));
    }

    #[test]
    fn revoked_tokens_stay_revoked_past_grace() {
        let (clock, tm) = setup(KeyAlgorithm::Hmac);
        let raw = tm.issue("forecast", Scopes::new(), Duration::from_secs(600)).unwrap().encode();
        tm.registry().revoke("forecast").unwrap();

        // Past the 120s grace period but inside the token's lifetime.
        clock.advance(chrono::Duration::seconds(300));
        tm.registry().sweep();
        assert_eq!(tm.verify(&raw), Err(VerificationError::RevokedIdentity));

        clock.advance(chrono::Duration::seconds(300));
        assert_eq!(tm.verify(&raw), Err(VerificationError::ExpiredToken));
    }

    #[test]
    fn reinstated_identity_rejects_pre_revocation_tokens() {
        let (_, tm) = setup(KeyAlgorithm::Hmac);
        let raw = tm.issue("forecast", Scopes::new(), Duration::from_secs(600)).unwrap().encode();
        tm.registry().revoke("forecast").unwrap();
        tm.registry().provision("forecast", Scopes::new()).unwrap();
        assert_eq!(tm.verify(&raw), Err(VerificationError::UnknownKeyId));
    }

    #[test]
    fn verify_is_idempotent_and_read_only() {
        let (_, tm) = setup(KeyAlgorithm::Hmac);
        let raw = tm.issue("forecast", scopes("forecast:read"), Duration::from_secs(60)).unwrap().encode();
        let keys_before = tm.registry().keys("forecast").len();
        let first = tm.verify(&raw);
        for _ in 0..5 {
            assert_eq!(tm.verify(&raw), first);
        }
        assert_eq!(tm.registry().keys("forecast").len(), keys_before);
    }

    #[test]
    fn env_style_generations_verify_by_kid() {
        let clock = Arc::new(ManualClock::at_unix(START));
        let registry = Arc::new(KeyRegistry::new(clock, chrono::Duration::seconds(60), KeyAlgorithm::Hmac));
        let gen = |n: u32| SecretGeneration {
            generation: n,
            secret: format!("recommendation-secret-{n:03}").into_bytes(),
        };
        registry
            .install_generations("recs", Scopes::new(), vec![gen(1)])
            .unwrap();
        let tm = TokenManager::new(registry.clone(), Duration::from_secs(600));
        let v1 = tm.issue("recs", Scopes::new(), Duration::from_secs(60)).unwrap().encode();

        registry.adopt_generations("recs", vec![gen(1), gen(2)]).unwrap();
        let v2 = tm.issue("recs", Scopes::new(), Duration::from_secs(60)).unwrap();
        assert_eq!(v2.kid, "v2");
        assert!(tm.verify(&v1).is_ok());
        assert!(tm.verify(&v2.encode()).is_ok());
    }

    #[test]
    fn unavailable_registry_fails_closed() {
        let (_, tm) = setup(KeyAlgorithm::Hmac);
        let raw = tm.issue("forecast", Scopes::new(), Duration::from_secs(60)).unwrap().encode();
        tm.registry().mark_unavailable("forecast", Scopes::new());
        assert_eq!(tm.verify(&raw), Err(VerificationError::Unavailable));
    }

    #[test]
    fn canonical_encoding_is_unambiguous() {
        let a = canonical_bytes("ab", "c", &Scopes::new(), "v1", 1, 2);
        let b = canonical_bytes("a", "bc", &Scopes::new(), "v1", 1, 2);
        assert_ne!(a, b);
    }
}
