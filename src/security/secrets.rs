use anyhow::Result;
use tracing::debug;

use crate::security::keys::SecretGeneration;
use crate::security::vault_client::VaultClient;

pub const ENV_SECRET_PREFIX: &str = "SERVICE_AUTH_SECRET_";

#[cfg(test)]
static TEST_ENV_LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();

/// Serializes tests that touch process environment variables.
#[cfg(test)]
pub(crate) fn lock_env() -> std::sync::MutexGuard<'static, ()> {
    match TEST_ENV_LOCK.get_or_init(|| std::sync::Mutex::new(())).lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Where per-service signing secrets come from.
#[derive(Debug, Clone)]
pub enum SecretSource {
    Env,
    Vault(VaultClient),
}

impl SecretSource {
    pub fn name(&self) -> &'static str {
        match self {
            SecretSource::Env => "env",
            SecretSource::Vault(_) => "vault",
        }
    }

    /// All generations currently published for `service`. Empty when the
    /// source holds nothing for it; an error when the source is unreachable.
    pub async fn fetch(&self, service: &str) -> Result<Vec<SecretGeneration>> {
        match self {
            SecretSource::Env => Ok(generations_from_vars(service, std::env::vars())),
            SecretSource::Vault(client) => client.fetch_service_secrets(service).await,
        }
    }
}

/// `SERVICE_AUTH_SECRET_<NAME>` with the name upper-cased and `-` mapped to `_`.
pub fn env_var_name(service: &str) -> String {
    format!("{ENV_SECRET_PREFIX}{}", service.to_ascii_uppercase().replace('-', "_"))
}

/// Collect the base variable (generation 1) and `_V<N>` variants (N >= 2).
pub fn generations_from_vars<I>(service: &str, vars: I) -> Vec<SecretGeneration>
where
    I: IntoIterator<Item = (String, String)>,
{
    let base = env_var_name(service);
    let versioned = format!("{base}_V");
    let mut out: Vec<SecretGeneration> = vars
        .into_iter()
        .filter_map(|(key, value)| {
            let generation = if key == base {
                1
            } else {
                let n: u32 = key.strip_prefix(&versioned)?.parse().ok()?;
                if n < 2 {
                    return None;
                }
                n
            };
            if value.is_empty() {
                return None;
            }
            Some(SecretGeneration {
                generation,
                secret: value.into_bytes(),
            })
        })
        .collect();
    out.sort_by_key(|g| g.generation);
    debug!(service, generations = out.len(), "read service secrets from environment");
    out
}
