use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::security::keys::KeyAlgorithm;
use crate::security::scopes::Scopes;

const MAX_GRACE_SECS: u64 = 30 * 24 * 3600;
const MAX_WINDOW_SECS: u64 = 24 * 3600;
const MIN_BODY_BYTES: usize = 1024;
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const MAX_RETRIES: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ListenConfig {
    pub port: u16,
    pub admin_port: u16,
    /// Bind address of the admin listener; loopback keeps administrative
    /// operations off the public request path.
    pub admin_bind: String,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            admin_port: 9090,
            admin_bind: "127.0.0.1".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretSourceKind {
    #[default]
    Env,
    Vault,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyConfig {
    /// Algorithm used for keys the gateway generates itself (provisioning and
    /// rotation). Externally supplied secrets are always HMAC.
    pub algorithm: KeyAlgorithm,
    pub grace_period_secs: u64,
    pub sweep_interval_secs: u64,
    pub secret_source: SecretSourceKind,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            algorithm: KeyAlgorithm::Hmac,
            grace_period_secs: 3600,
            sweep_interval_secs: 60,
            secret_source: SecretSourceKind::Env,
        }
    }
}

impl KeyConfig {
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_period_secs as i64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TokenConfig {
    pub header: String,
    pub default_ttl_secs: u64,
    pub max_ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            header: "x-service-token".to_string(),
            default_ttl_secs: 300,
            max_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Requests per window for one registered service identity at one address.
    pub limit: u64,
    /// Requests per window for one client address, whatever token it carries.
    pub per_ip_limit: u64,
    pub window_secs: u64,
    pub idle_ttl_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit: 100,
            per_ip_limit: 1000,
            window_secs: 60,
            idle_ttl_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WafConfig {
    pub max_body_bytes: usize,
    pub max_header_value_bytes: usize,
    pub max_headers: usize,
    pub max_uri_bytes: usize,
    /// JSON rule file; the built-in rule set is used when absent.
    pub rules_file: Option<PathBuf>,
}

impl Default for WafConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            max_header_value_bytes: 8 * 1024,
            max_headers: 100,
            max_uri_bytes: 8 * 1024,
            rules_file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 2,
            retry_backoff_ms: 100,
        }
    }
}

impl ProxyConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// One downstream service: where it lives, which path prefix routes to it,
/// and which scopes a caller must hold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    pub name: String,
    pub base_url: String,
    pub route_prefix: String,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    /// Scopes tokens issued to this service may carry.
    #[serde(default)]
    pub allowed_scopes: Vec<String>,
    #[serde(default = "default_true")]
    pub strip_prefix: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    pub listen: ListenConfig,
    pub keys: KeyConfig,
    pub tokens: TokenConfig,
    pub rate_limit: RateLimitConfig,
    pub waf: WafConfig,
    pub proxy: ProxyConfig,
    pub services: Vec<ServiceConfig>,
}

impl GatewayConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading config file")?;
        let cfg: GatewayConfig = serde_json::from_str(&raw).context("parsing JSON")?;
        cfg.validate().context("validating config")?;
        Ok(cfg)
    }

    /// Reject out-of-range or inconsistent settings before anything binds.
    pub fn validate(&self) -> Result<()> {
        if self.listen.port == self.listen.admin_port {
            bail!("listen.port and listen.admin_port must differ");
        }

        let grace = self.keys.grace_period_secs;
        if grace == 0 || grace > MAX_GRACE_SECS {
            bail!("keys.grace_period_secs must be within 1..={MAX_GRACE_SECS}, got {grace}");
        }
        if self.keys.sweep_interval_secs == 0 {
            bail!("keys.sweep_interval_secs must be at least 1");
        }

        let tokens = &self.tokens;
        if axum::http::HeaderName::from_bytes(tokens.header.as_bytes()).is_err() {
            bail!("tokens.header is not a valid header name: {}", tokens.header);
        }
        if tokens.max_ttl_secs == 0 {
            bail!("tokens.max_ttl_secs must be at least 1");
        }
        if tokens.default_ttl_secs == 0 || tokens.default_ttl_secs > tokens.max_ttl_secs {
            bail!(
                "tokens.default_ttl_secs must be within 1..={}, got {}",
                tokens.max_ttl_secs,
                tokens.default_ttl_secs
            );
        }

        let rl = &self.rate_limit;
        if rl.limit == 0 {
            bail!("rate_limit.limit must be at least 1");
        }
        if rl.per_ip_limit < rl.limit {
            bail!("rate_limit.per_ip_limit must be >= limit");
        }
        if rl.window_secs == 0 || rl.window_secs > MAX_WINDOW_SECS {
            bail!("rate_limit.window_secs must be within 1..={MAX_WINDOW_SECS}, got {}", rl.window_secs);
        }
        if rl.idle_ttl_secs < rl.window_secs {
            bail!("rate_limit.idle_ttl_secs must be >= window_secs");
        }

        let waf = &self.waf;
        if waf.max_body_bytes < MIN_BODY_BYTES || waf.max_body_bytes > MAX_BODY_BYTES {
            bail!(
                "waf.max_body_bytes must be within {MIN_BODY_BYTES}..={MAX_BODY_BYTES}, got {}",
                waf.max_body_bytes
            );
        }
        if waf.max_header_value_bytes == 0 || waf.max_headers == 0 || waf.max_uri_bytes == 0 {
            bail!("waf header and uri limits must be non-zero");
        }

        if self.proxy.timeout_ms == 0 {
            bail!("proxy.timeout_ms must be at least 1");
        }
        if self.proxy.max_retries > MAX_RETRIES {
            bail!("proxy.max_retries must be at most {MAX_RETRIES}");
        }

        let mut names = HashSet::new();
        for svc in &self.services {
            validate_service_name(&svc.name)?;
            if !names.insert(svc.name.as_str()) {
                bail!("duplicate service name: {}", svc.name);
            }
            if !(svc.base_url.starts_with("http://") || svc.base_url.starts_with("https://")) {
                bail!("service {}: base_url must be an absolute http(s) URL", svc.name);
            }
            if !svc.route_prefix.starts_with('/') {
                bail!("service {}: route_prefix must start with '/'", svc.name);
            }
            Scopes::parse_list(&svc.required_scopes)
                .with_context(|| format!("service {}: required_scopes", svc.name))?;
            Scopes::parse_list(&svc.allowed_scopes)
                .with_context(|| format!("service {}: allowed_scopes", svc.name))?;
        }

        Ok(())
    }
}

/// Service names end up in env var names and token claims, so keep them to a
/// conservative alphabet.
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 {
        bail!("service name must be 1..=64 characters");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("service name contains unsupported characters: {name}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(body: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "{body}").unwrap();
        file
    }

    #[test]
    fn test_config_parsing_with_defaults() {
        let file = write_config(
            r#"{
                "rate_limit": {"limit": 5, "window_secs": 10, "idle_ttl_secs": 60},
                "services": [{
                    "name": "forecasting",
                    "base_url": "http://127.0.0.1:9001",
                    "route_prefix": "/api/forecast",
                    "required_scopes": ["forecast:read"]
                }]
            }"#,
        );

        let config = GatewayConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.rate_limit.limit, 5);
        assert_eq!(config.keys.grace_period_secs, 3600);
        assert_eq!(config.tokens.header, "x-service-token");
        assert_eq!(config.services.len(), 1);
        assert!(config.services[0].strip_prefix);
    }

    #[test]
    fn test_config_missing_file() {
        assert!(GatewayConfig::from_file("/nonexistent/path/gateway.json").is_err());
    }

    #[test]
    fn test_config_invalid_json() {
        let file = write_config("{invalid json");
        assert!(GatewayConfig::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let file = write_config(r#"{"rate_limit": {"limt": 5}}"#);
        assert!(GatewayConfig::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let mut cfg = GatewayConfig::default();
        cfg.keys.grace_period_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = GatewayConfig::default();
        cfg.rate_limit.limit = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = GatewayConfig::default();
        cfg.rate_limit.per_ip_limit = cfg.rate_limit.limit - 1;
        assert!(cfg.validate().is_err());

        let mut cfg = GatewayConfig::default();
        cfg.waf.max_body_bytes = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = GatewayConfig::default();
        cfg.tokens.default_ttl_secs = cfg.tokens.max_ttl_secs + 1;
        assert!(cfg.validate().is_err());

        let mut cfg = GatewayConfig::default();
        cfg.proxy.max_retries = 9;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_service_validation() {
        let svc = |name: &str, url: &str, prefix: &str| ServiceConfig {
            name: name.to_string(),
            base_url: url.to_string(),
            route_prefix: prefix.to_string(),
            required_scopes: vec![],
            allowed_scopes: vec![],
            strip_prefix: true,
        };

        let mut cfg = GatewayConfig::default();
        cfg.services = vec![svc("fraud", "http://fraud:80", "/api/fraud")];
        assert!(cfg.validate().is_ok());

        cfg.services.push(svc("fraud", "http://fraud:80", "/api/fraud2"));
        assert!(cfg.validate().is_err());

        cfg.services = vec![svc("fraud", "fraud:80", "/api/fraud")];
        assert!(cfg.validate().is_err());

        cfg.services = vec![svc("fraud", "http://fraud:80", "api/fraud")];
        assert!(cfg.validate().is_err());

        cfg.services = vec![svc("fr aud", "http://fraud:80", "/api/fraud")];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(GatewayConfig::default().validate().is_ok());
    }
}
