use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, info};

use crate::security::keys::SecretGeneration;

/// Vault KV v2 response envelope.
#[derive(Debug, Deserialize)]
struct VaultKvResponse {
    #[serde(default)]
    data: VaultKvData,
}

#[derive(Debug, Deserialize, Default)]
struct VaultKvData {
    #[serde(default)]
    data: HashMap<String, serde_json::Value>,
}

/// Vault client for fetching per-service signing secrets.
#[derive(Debug, Clone)]
pub struct VaultClient {
    base_url: String,
    token: String,
    prefix: String,
    http_client: reqwest::Client,
}

impl VaultClient {
    /// Create a new Vault client from environment variables.
    ///
    /// Environment variables:
    /// - `VAULT_ADDRESS`: Base URL (e.g., http://127.0.0.1:8200)
    /// - `VAULT_TOKEN`: Authentication token
    /// - `VAULT_AGENT_PATH_PREFIX`: KV mount/prefix (e.g., secret/data/gateway)
    pub fn from_env() -> Result<Option<Self>> {
        let base_url = std::env::var("VAULT_ADDRESS").ok();
        let token = std::env::var("VAULT_TOKEN").ok();
        let prefix = std::env::var("VAULT_AGENT_PATH_PREFIX").ok();

        match (base_url, token, prefix) {
            (Some(base), Some(tok), Some(pref)) => Ok(Some(Self::new(base, tok, pref)?)),
            _ => {
                debug!("Vault not configured (missing VAULT_ADDRESS, VAULT_TOKEN, or VAULT_AGENT_PATH_PREFIX)");
                Ok(None)
            }
        }
    }

    pub fn new(base_url: String, token: String, prefix: String) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("creating HTTP client")?;

        debug!("Vault client initialized with base_url={}", base_url);

        Ok(VaultClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            prefix: prefix.trim_matches('/').to_string(),
            http_client,
        })
    }

    fn secret_path(&self, service: &str) -> String {
        format!("{}/v1/{}/service_auth/{}", self.base_url, self.prefix, service)
    }

    /// Fetch every secret generation stored for a service.
    ///
    /// Path: GET {base_url}/v1/{prefix}/service_auth/{service}
    /// Expects response: {"data":{"data":{"secret":"...","secret_v2":"..."}}}
    /// A 404 means nothing is stored yet and yields no generations.
    pub async fn fetch_service_secrets(&self, service: &str) -> Result<Vec<SecretGeneration>> {
        let url = self.secret_path(service);
        debug!("Fetching service secrets from Vault: {}", url);

        let response = self
            .http_client
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await
            .context("sending Vault request")?;

        if response.status() == 404 {
            return Ok(Vec::new());
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!(
                "Vault fetch failed with status {}: {}",
                status,
                body
            ));
        }

        let vault_resp: VaultKvResponse =
            response.json().await.context("parsing Vault response")?;

        let mut generations = Vec::new();
        for (field, value) in vault_resp.data.data {
            let Some(generation) = generation_for_field(&field) else {
                continue;
            };
            let secret = value
                .as_str()
                .with_context(|| format!("Vault field {field} for {service} is not a string"))?;
            generations.push(SecretGeneration {
                generation,
                secret: secret.as_bytes().to_vec(),
            });
        }
        generations.sort_by_key(|g| g.generation);

        info!(
            "Fetched {} secret generations from Vault for {}",
            generations.len(),
            service
        );
        Ok(generations)
    }
}

/// `secret` is generation 1, `secret_vN` is generation N (N >= 2).
fn generation_for_field(field: &str) -> Option<u32> {
    if field == "secret" {
        return Some(1);
    }
    let n: u32 = field.strip_prefix("secret_v")?.parse().ok()?;
    (n >= 2).then_some(n)
}
