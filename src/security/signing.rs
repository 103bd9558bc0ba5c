use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ed25519_dalek::{Signature, Signer, SigningKey as Ed25519SigningKey, VerifyingKey};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use subtle::ConstantTimeEq;
use thiserror::Error;

// HS256: HMAC-SHA256(canonical claims, service secret)
// EdDSA: Ed25519(canonical claims, service keypair)

type HmacSha256 = Hmac<Sha256>;

const HMAC_SECRET_LEN: usize = 32;
const MIN_HMAC_SECRET_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid hmac key")]
    InvalidHmacKey,
    #[error("hmac secret must be at least {MIN_HMAC_SECRET_LEN} bytes")]
    SecretTooShort,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    #[default]
    Hmac,
    Ed25519,
}

impl KeyAlgorithm {
    /// Value of the `alg` claim for tokens signed with this algorithm.
    pub fn token_alg(self) -> &'static str {
        match self {
            KeyAlgorithm::Hmac => "HS256",
            KeyAlgorithm::Ed25519 => "EdDSA",
        }
    }

    pub fn from_token_alg(alg: &str) -> Option<Self> {
        match alg {
            "HS256" => Some(KeyAlgorithm::Hmac),
            "EdDSA" => Some(KeyAlgorithm::Ed25519),
            _ => None,
        }
    }
}

/// Secret half of a signing key. Never serialized, never printed.
#[derive(Clone)]
pub enum KeyMaterial {
    Hmac(Vec<u8>),
    Ed25519(Box<Ed25519SigningKey>),
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyMaterial::Hmac(_) => f.write_str("KeyMaterial::Hmac(<redacted>)"),
            KeyMaterial::Ed25519(_) => f.write_str("KeyMaterial::Ed25519(<redacted>)"),
        }
    }
}

impl KeyMaterial {
    pub fn generate(algorithm: KeyAlgorithm) -> Self {
        match algorithm {
            KeyAlgorithm::Hmac => {
                let mut secret = vec![0u8; HMAC_SECRET_LEN];
                rand::thread_rng().fill_bytes(&mut secret);
                KeyMaterial::Hmac(secret)
            }
            KeyAlgorithm::Ed25519 => {
                // Raw 32-byte seed; the public key is always derived from it.
                let mut seed = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut seed);
                KeyMaterial::Ed25519(Box::new(Ed25519SigningKey::from_bytes(&seed)))
            }
        }
    }

    pub fn hmac_from_secret(secret: &[u8]) -> Result<Self, SigningError> {
        if secret.len() < MIN_HMAC_SECRET_LEN {
            return Err(SigningError::SecretTooShort);
        }
        Ok(KeyMaterial::Hmac(secret.to_vec()))
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        match self {
            KeyMaterial::Hmac(_) => KeyAlgorithm::Hmac,
            KeyMaterial::Ed25519(_) => KeyAlgorithm::Ed25519,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        match self {
            KeyMaterial::Hmac(secret) => {
                let mut mac = HmacSha256::new_from_slice(secret)
                    .map_err(|_| SigningError::InvalidHmacKey)?;
                mac.update(message);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            KeyMaterial::Ed25519(key) => Ok(key.sign(message).to_bytes().to_vec()),
        }
    }

    /// Constant-time for HMAC; Ed25519 verification does not branch on
    /// secret data.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match self {
            KeyMaterial::Hmac(secret) => {
                let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
                    return false;
                };
                mac.update(message);
                let expected = mac.finalize().into_bytes();
                signature.ct_eq(expected.as_slice()).unwrap_u8() == 1
            }
            KeyMaterial::Ed25519(key) => {
                let Ok(sig) = Signature::from_slice(signature) else {
                    return false;
                };
                key.verifying_key().verify_strict(message, &sig).is_ok()
            }
        }
    }

    pub fn public_key(&self) -> Option<VerifyingKey> {
        match self {
            KeyMaterial::Hmac(_) => None,
            KeyMaterial::Ed25519(key) => Some(key.verifying_key()),
        }
    }

    /// Short hex digest identifying the material without revealing it.
    /// Lets operators confirm which secret generation a kid was built from.
    pub fn fingerprint(&self) -> String {
        use sha2::Digest;
        let digest = match self {
            KeyMaterial::Hmac(secret) => Sha256::digest(secret),
            KeyMaterial::Ed25519(key) => Sha256::digest(key.verifying_key().as_bytes()),
        };
        hex::encode(&digest[..8])
    }
}

pub fn encode_b64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn decode_b64url(s: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(s).ok()
}

/// Equality for secrets supplied by operators (admin token), in constant time.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).unwrap_u8() == 1
}
