use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use super::signing::{KeyAlgorithm, KeyMaterial};
use super::scopes::Scopes;
use crate::utils::clock::Clock;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown service: {0}")]
    UnknownService(String),
    #[error("service identity revoked: {0}")]
    IdentityRevoked(String),
    #[error("key {kid} not found for service {service}")]
    KeyNotFound { service: String, kid: String },
    #[error("key {kid} for service {service} is revoked")]
    KeyRevoked { service: String, kid: String },
    #[error("signing keys for service {0} are unavailable")]
    Unavailable(String),
    #[error("service {0} already provisioned")]
    AlreadyProvisioned(String),
    #[error("invalid secret generation for {service}: {reason}")]
    InvalidSecret { service: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityStatus {
    Active,
    Revoked,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceIdentity {
    pub name: String,
    pub allowed_scopes: Scopes,
    pub status: IdentityStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationState {
    Active,
    Retiring,
    Revoked,
}

/// One generation of signing material for a service.
#[derive(Debug, Clone)]
pub struct SigningKey {
    pub service_name: String,
    pub kid: String,
    pub material: Arc<KeyMaterial>,
    pub created_at: DateTime<Utc>,
    pub rotation_state: RotationState,
    /// Set once the key stops being active; the key is purged after this.
    pub purge_after: Option<DateTime<Utc>>,
}

impl SigningKey {
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.material.algorithm()
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.purge_after.is_some_and(|t| now >= t)
    }
}

/// Externally provisioned secret for generation `N` (kid `vN`).
#[derive(Clone)]
pub struct SecretGeneration {
    pub generation: u32,
    pub secret: Vec<u8>,
}

impl std::fmt::Debug for SecretGeneration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretGeneration")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

pub fn kid_for_generation(generation: u32) -> String {
    format!("v{generation}")
}

/// Result of a verification-time lookup: the key (possibly a revoked
/// tombstone) and the current status of its owner.
#[derive(Debug, Clone)]
pub(crate) struct KeyLookup {
    pub key: SigningKey,
    pub identity_status: IdentityStatus,
}

#[derive(Debug)]
struct ServiceEntry {
    identity: ServiceIdentity,
    keys: Vec<SigningKey>,
    last_generation: u32,
    available: bool,
}

impl ServiceEntry {
    fn active_key(&self) -> Option<&SigningKey> {
        self.keys
            .iter()
            .find(|k| k.rotation_state == RotationState::Active)
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.keys.len();
        self.keys.retain(|k| !k.is_expired(now));
        before - self.keys.len()
    }

    fn has_expired(&self, now: DateTime<Utc>) -> bool {
        self.keys.iter().any(|k| k.is_expired(now))
    }
}

/// Public half of an Ed25519 key, as published for discovery.
#[derive(Debug, Clone, Serialize)]
pub struct PublicKeyInfo {
    pub service: String,
    pub kid: String,
    pub public_key: [u8; 32],
    pub state: RotationState,
}

/// Owns every service identity and its signing keys.
///
/// All mutation happens under one short write lock, so issuance either sees
/// the registry before a rotation or after it, never in between. Verification
/// and issuance only take the read lock.
#[derive(Debug)]
pub struct KeyRegistry {
    services: RwLock<HashMap<String, ServiceEntry>>,
    clock: Arc<dyn Clock>,
    grace_period: Duration,
    /// Longest lifetime a token may be issued with. Revocation tombstones
    /// outlive it so every outstanding token keeps failing as revoked.
    max_token_ttl: Duration,
    algorithm: KeyAlgorithm,
}

impl KeyRegistry {
    pub fn new(clock: Arc<dyn Clock>, grace_period: Duration, algorithm: KeyAlgorithm) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            clock,
            grace_period,
            max_token_ttl: Duration::zero(),
            algorithm,
        }
    }

    pub fn with_max_token_ttl(mut self, ttl: Duration) -> Self {
        self.max_token_ttl = ttl;
        self
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Register a service and generate its first key.
    ///
    /// Re-provisioning a revoked service reinstates it under a new generation;
    /// keys from before the revocation stay rejected until purged.
    pub fn provision(&self, service: &str, allowed_scopes: Scopes) -> Result<SigningKey, RegistryError> {
        let now = self.clock.now();
        let mut services = self.services.write();

        if let Some(entry) = services.get_mut(service) {
            if entry.identity.status == IdentityStatus::Active && entry.available {
                return Err(RegistryError::AlreadyProvisioned(service.to_string()));
            }
            entry.purge_expired(now);
            entry.identity.status = IdentityStatus::Active;
            entry.identity.allowed_scopes = allowed_scopes;
            entry.available = true;
            entry.last_generation += 1;
            let key = self.new_key(service, entry.last_generation, KeyMaterial::generate(self.algorithm), now);
            entry.keys.push(key.clone());
            info!(service, kid = %key.kid, "service identity reinstated");
            return Ok(key);
        }

        let key = self.new_key(service, 1, KeyMaterial::generate(self.algorithm), now);
        services.insert(
            service.to_string(),
            ServiceEntry {
                identity: ServiceIdentity {
                    name: service.to_string(),
                    allowed_scopes,
                    status: IdentityStatus::Active,
                },
                keys: vec![key.clone()],
                last_generation: 1,
                available: true,
            },
        );
        info!(service, kid = %key.kid, alg = key.algorithm().token_alg(), "service provisioned");
        Ok(key)
    }

    /// Register a service from externally supplied secret generations. The
    /// newest generation becomes active, older ones retire with a fresh grace
    /// period.
    pub fn install_generations(
        &self,
        service: &str,
        allowed_scopes: Scopes,
        mut generations: Vec<SecretGeneration>,
    ) -> Result<SigningKey, RegistryError> {
        let now = self.clock.now();
        generations.sort_by_key(|g| g.generation);
        generations.dedup_by_key(|g| g.generation);
        let newest = generations
            .last()
            .map(|g| g.generation)
            .ok_or_else(|| RegistryError::InvalidSecret {
                service: service.to_string(),
                reason: "no secret generations supplied".to_string(),
            })?;

        let mut keys = Vec::with_capacity(generations.len());
        for g in &generations {
            let material = KeyMaterial::hmac_from_secret(&g.secret).map_err(|e| RegistryError::InvalidSecret {
                service: service.to_string(),
                reason: format!("generation {}: {e}", g.generation),
            })?;
            let mut key = self.new_key(service, g.generation, material, now);
            if g.generation != newest {
                key.rotation_state = RotationState::Retiring;
                key.purge_after = Some(now + self.grace_period);
            }
            keys.push(key);
        }

        let mut services = self.services.write();
        if let Some(existing) = services.get(service) {
            if existing.identity.status == IdentityStatus::Revoked {
                return Err(RegistryError::IdentityRevoked(service.to_string()));
            }
            if existing.available {
                return Err(RegistryError::AlreadyProvisioned(service.to_string()));
            }
        }
        let active = keys
            .iter()
            .find(|k| k.rotation_state == RotationState::Active)
            .cloned()
            .ok_or_else(|| RegistryError::Unavailable(service.to_string()))?;
        services.insert(
            service.to_string(),
            ServiceEntry {
                identity: ServiceIdentity {
                    name: service.to_string(),
                    allowed_scopes,
                    status: IdentityStatus::Active,
                },
                keys,
                last_generation: newest,
                available: true,
            },
        );
        info!(service, kid = %active.kid, generations = generations.len(), "service secrets installed");
        Ok(active)
    }

    /// Adopt generations newer than the newest one known, as produced by an
    /// out-of-band rotation in the secret store. Returns the adopted kids.
    pub fn adopt_generations(
        &self,
        service: &str,
        mut generations: Vec<SecretGeneration>,
    ) -> Result<Vec<String>, RegistryError> {
        let now = self.clock.now();
        generations.sort_by_key(|g| g.generation);

        let mut services = self.services.write();
        let entry = services
            .get_mut(service)
            .ok_or_else(|| RegistryError::UnknownService(service.to_string()))?;
        if entry.identity.status == IdentityStatus::Revoked {
            return Err(RegistryError::IdentityRevoked(service.to_string()));
        }

        let known = entry.last_generation;
        let mut adopted = Vec::new();
        for g in generations.into_iter().filter(|g| g.generation > known) {
            let material = KeyMaterial::hmac_from_secret(&g.secret).map_err(|e| RegistryError::InvalidSecret {
                service: service.to_string(),
                reason: format!("generation {}: {e}", g.generation),
            })?;
            self.demote_active(entry, now);
            let key = self.new_key(service, g.generation, material, now);
            adopted.push(key.kid.clone());
            entry.keys.push(key);
            entry.last_generation = g.generation;
        }
        if !adopted.is_empty() {
            entry.available = true;
            info!(service, kids = ?adopted, "adopted externally rotated secrets");
        }
        Ok(adopted)
    }

    /// Record a service whose secrets could not be loaded. Every issuance and
    /// verification for it fails closed until secrets arrive.
    pub fn mark_unavailable(&self, service: &str, allowed_scopes: Scopes) {
        let mut services = self.services.write();
        let entry = services.entry(service.to_string()).or_insert_with(|| ServiceEntry {
            identity: ServiceIdentity {
                name: service.to_string(),
                allowed_scopes,
                status: IdentityStatus::Active,
            },
            keys: Vec::new(),
            last_generation: 0,
            available: false,
        });
        entry.available = false;
        warn!(service, "signing keys unavailable; failing closed");
    }

    pub fn unavailable_services(&self) -> Vec<String> {
        self.services
            .read()
            .values()
            .filter(|e| !e.available)
            .map(|e| e.identity.name.clone())
            .collect()
    }

    /// Key to sign new tokens with.
    pub fn get_active_key(&self, service: &str) -> Result<SigningKey, RegistryError> {
        let services = self.services.read();
        let entry = services
            .get(service)
            .ok_or_else(|| RegistryError::UnknownService(service.to_string()))?;
        if entry.identity.status == IdentityStatus::Revoked {
            return Err(RegistryError::IdentityRevoked(service.to_string()));
        }
        if !entry.available {
            return Err(RegistryError::Unavailable(service.to_string()));
        }
        entry
            .active_key()
            .cloned()
            .ok_or_else(|| RegistryError::Unavailable(service.to_string()))
    }

    /// Key named by `kid`, if it is still valid for verification (active, or
    /// retiring within its grace period).
    pub fn resolve_key(&self, service: &str, kid: &str) -> Result<SigningKey, RegistryError> {
        let lookup = self.lookup(service, kid)?;
        match lookup.key.rotation_state {
            RotationState::Revoked => Err(RegistryError::KeyRevoked {
                service: service.to_string(),
                kid: kid.to_string(),
            }),
            _ => Ok(lookup.key),
        }
    }

    /// Verification-time lookup that also returns revoked tombstones, so the
    /// caller can tell a revoked identity apart from an unknown key.
    pub(crate) fn lookup(&self, service: &str, kid: &str) -> Result<KeyLookup, RegistryError> {
        let now = self.clock.now();
        let mut saw_expired = false;
        let result = {
            let services = self.services.read();
            let entry = services
                .get(service)
                .ok_or_else(|| RegistryError::UnknownService(service.to_string()))?;
            if !entry.available {
                return Err(RegistryError::Unavailable(service.to_string()));
            }
            match entry.keys.iter().find(|k| k.kid == kid) {
                Some(key) if key.is_expired(now) => {
                    saw_expired = true;
                    Err(RegistryError::KeyNotFound {
                        service: service.to_string(),
                        kid: kid.to_string(),
                    })
                }
                Some(key) => Ok(KeyLookup {
                    key: key.clone(),
                    identity_status: entry.identity.status,
                }),
                None => Err(RegistryError::KeyNotFound {
                    service: service.to_string(),
                    kid: kid.to_string(),
                }),
            }
        };

        if saw_expired {
            self.purge_service(service, now);
        }
        result
    }

    /// Make a fresh key active; the previous active key retires for the grace
    /// period.
    pub fn rotate(&self, service: &str) -> Result<SigningKey, RegistryError> {
        let now = self.clock.now();
        let mut services = self.services.write();
        let entry = services
            .get_mut(service)
            .ok_or_else(|| RegistryError::UnknownService(service.to_string()))?;
        if entry.identity.status == IdentityStatus::Revoked {
            return Err(RegistryError::IdentityRevoked(service.to_string()));
        }

        entry.purge_expired(now);
        let retired = self.demote_active(entry, now);
        entry.last_generation += 1;
        let key = self.new_key(service, entry.last_generation, KeyMaterial::generate(self.algorithm), now);
        entry.keys.push(key.clone());
        entry.available = true;
        info!(
            service,
            kid = %key.kid,
            retired = retired.as_deref().unwrap_or(""),
            grace_secs = self.grace_period.num_seconds(),
            "signing key rotated"
        );
        Ok(key)
    }

    /// Revoke the identity and every key it owns, effective immediately.
    pub fn revoke(&self, service: &str) -> Result<(), RegistryError> {
        let now = self.clock.now();
        let mut services = self.services.write();
        let entry = services
            .get_mut(service)
            .ok_or_else(|| RegistryError::UnknownService(service.to_string()))?;

        entry.identity.status = IdentityStatus::Revoked;
        let hold = self.grace_period.max(self.max_token_ttl);
        for key in entry.keys.iter_mut() {
            if key.rotation_state != RotationState::Revoked {
                key.rotation_state = RotationState::Revoked;
                // Tombstones outlive every token the key could have signed.
                key.purge_after = Some(now + hold);
            }
        }
        warn!(service, keys = entry.keys.len(), "service identity revoked");
        Ok(())
    }

    pub fn identity(&self, service: &str) -> Option<ServiceIdentity> {
        self.services.read().get(service).map(|e| e.identity.clone())
    }

    pub fn identities(&self) -> Vec<ServiceIdentity> {
        let mut all: Vec<_> = self
            .services
            .read()
            .values()
            .map(|e| e.identity.clone())
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// All keys still held for a service, oldest first.
    pub fn keys(&self, service: &str) -> Vec<SigningKey> {
        self.services
            .read()
            .get(service)
            .map(|e| e.keys.clone())
            .unwrap_or_default()
    }

    /// Ed25519 public keys of non-revoked, non-expired keys.
    pub fn public_keys(&self) -> Vec<PublicKeyInfo> {
        let now = self.clock.now();
        let services = self.services.read();
        let mut out: Vec<PublicKeyInfo> = services
            .values()
            .filter(|e| e.identity.status == IdentityStatus::Active)
            .flat_map(|e| e.keys.iter())
            .filter(|k| k.rotation_state != RotationState::Revoked && !k.is_expired(now))
            .filter_map(|k| {
                k.material.public_key().map(|pk| PublicKeyInfo {
                    service: k.service_name.clone(),
                    kid: k.kid.clone(),
                    public_key: pk.to_bytes(),
                    state: k.rotation_state,
                })
            })
            .collect();
        out.sort_by(|a, b| (&a.service, &a.kid).cmp(&(&b.service, &b.kid)));
        out
    }

    /// Purge keys past their grace period across all services.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let mut services = self.services.write();
        let purged: usize = services.values_mut().map(|e| e.purge_expired(now)).sum();
        if purged > 0 {
            debug!(purged, "purged expired signing keys");
        }
        purged
    }

    fn purge_service(&self, service: &str, now: DateTime<Utc>) {
        let mut services = self.services.write();
        if let Some(entry) = services.get_mut(service) {
            if entry.has_expired(now) {
                let purged = entry.purge_expired(now);
                debug!(service, purged, "purged expired signing keys on access");
            }
        }
    }

    fn demote_active(&self, entry: &mut ServiceEntry, now: DateTime<Utc>) -> Option<String> {
        let grace = self.grace_period;
        entry
            .keys
            .iter_mut()
            .find(|k| k.rotation_state == RotationState::Active)
            .map(|k| {
                k.rotation_state = RotationState::Retiring;
                k.purge_after = Some(now + grace);
                k.kid.clone()
            })
    }

    fn new_key(&self, service: &str, generation: u32, material: KeyMaterial, now: DateTime<Utc>) -> SigningKey {
        SigningKey {
            service_name: service.to_string(),
            kid: kid_for_generation(generation),
            material: Arc::new(material),
            created_at: now,
            rotation_state: RotationState::Active,
            purge_after: None,
        }
    }
}
