use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::config::ServiceConfig;
use crate::security::keys::{IdentityStatus, KeyRegistry};
use crate::security::scopes::Scopes;
use crate::security::secrets::SecretSource;

/// Load signing material for every configured service.
///
/// Services with published secrets get those generations; services with
/// none get a freshly generated key. A source that cannot be reached leaves
/// the service unavailable (fail closed) for the sweeper to retry.
pub async fn load_service_keys(
    registry: &KeyRegistry,
    source: &SecretSource,
    services: &[ServiceConfig],
) -> Result<()> {
    for svc in services {
        let scopes = Scopes::parse_list(&svc.allowed_scopes)
            .with_context(|| format!("allowed_scopes for service {}", svc.name))?;
        match source.fetch(&svc.name).await {
            Ok(generations) if generations.is_empty() => {
                registry
                    .provision(&svc.name, scopes)
                    .with_context(|| format!("provisioning service {}", svc.name))?;
            }
            Ok(generations) => {
                registry
                    .install_generations(&svc.name, scopes, generations)
                    .with_context(|| format!("installing secrets for service {}", svc.name))?;
            }
            Err(err) => {
                warn!(
                    service = %svc.name,
                    source = source.name(),
                    error = %err,
                    "Failed to load service secrets (failing closed, will retry)"
                );
                registry.mark_unavailable(&svc.name, scopes);
            }
        }
    }
    Ok(())
}

/// One maintenance pass: purge keys past grace, retry unavailable services
/// and adopt generations rotated in the secret store. Returns the number of
/// keys purged.
pub async fn sweep_once(registry: &KeyRegistry, source: &SecretSource, services: &[ServiceConfig]) -> usize {
    let purged = registry.sweep();
    let unavailable = registry.unavailable_services();

    for svc in services {
        let Some(identity) = registry.identity(&svc.name) else {
            continue;
        };
        if identity.status == IdentityStatus::Revoked {
            continue;
        }

        let generations = match source.fetch(&svc.name).await {
            Ok(g) if g.is_empty() => continue,
            Ok(g) => g,
            Err(err) => {
                warn!(service = %svc.name, error = %err, "Failed to refresh service secrets (will retry)");
                continue;
            }
        };

        if unavailable.contains(&svc.name) {
            match registry.install_generations(&svc.name, identity.allowed_scopes, generations) {
                Ok(key) => info!(service = %svc.name, kid = %key.kid, "Service secrets recovered"),
                Err(err) => warn!(service = %svc.name, error = %err, "Failed to install recovered secrets"),
            }
            continue;
        }

        match registry.adopt_generations(&svc.name, generations) {
            Ok(kids) if !kids.is_empty() => {
                info!(service = %svc.name, kids = ?kids, "Signing key rotated from secret store");
            }
            Ok(_) => debug!(service = %svc.name, "Secrets unchanged"),
            Err(err) => warn!(service = %svc.name, error = %err, "Failed to adopt rotated secrets"),
        }
    }
    purged
}

/// Background task running [`sweep_once`] every `interval` plus 1-5s jitter.
pub fn spawn_key_sweeper(
    registry: Arc<KeyRegistry>,
    source: SecretSource,
    services: Vec<ServiceConfig>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            // Jitter is drawn before the await so the rng never crosses it.
            let jitter = {
                use rand::Rng;
                rand::thread_rng().gen_range(1..5)
            };
            sleep(interval + Duration::from_secs(jitter)).await;

            let purged = sweep_once(&registry, &source, &services).await;
            if purged > 0 {
                debug!(purged, "Key sweep finished");
            }
        }
    })
}
