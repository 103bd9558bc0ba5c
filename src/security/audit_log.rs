use tracing::{error, info, warn};

/// Security events on the `audit` target.
#[derive(Debug, Clone, Default)]
pub struct AuditLogger;

impl AuditLogger {
    pub fn new() -> Self {
        Self
    }

    pub fn auth_success(&self, service: &str, request_id: &str, kid: &str) {
        info!(target: "audit", event = "auth_success", service, request_id, kid);
    }

    pub fn auth_failure(&self, service: Option<&str>, request_id: &str, reason: &str) {
        warn!(target: "audit", event = "auth_failure", service = service.unwrap_or(""), request_id, reason);
    }

    pub fn scope_denied(&self, service: &str, request_id: &str, scope: &str) {
        warn!(target: "audit", event = "scope_denied", service, request_id, scope);
    }

    pub fn rate_limited(&self, key: &str, request_id: &str) {
        warn!(target: "audit", event = "rate_limited", key, request_id);
    }

    pub fn waf_blocked(&self, client_ip: &str, request_id: &str, category: &str, rule: &str) {
        warn!(target: "audit", event = "waf_blocked", client_ip, request_id, category, rule);
    }

    pub fn waf_observed(&self, client_ip: &str, request_id: &str, category: &str, rule: &str) {
        info!(target: "audit", event = "waf_observed", client_ip, request_id, category, rule);
    }

    pub fn key_provisioned(&self, service: &str, kid: &str) {
        info!(target: "audit", event = "key_provisioned", service, kid);
    }

    pub fn key_rotated(&self, service: &str, kid: &str) {
        info!(target: "audit", event = "key_rotated", service, kid);
    }

    pub fn identity_revoked(&self, service: &str) {
        warn!(target: "audit", event = "identity_revoked", service);
    }

    pub fn token_issued(&self, service: &str, subject: &str, kid: &str) {
        info!(target: "audit", event = "token_issued", service, subject, kid);
    }

    pub fn rules_reloaded(&self, rule_count: usize) {
        info!(target: "audit", event = "rules_reloaded", rule_count);
    }

    pub fn rules_reload_failed(&self, error_msg: &str) {
        error!(target: "audit", event = "rules_reload_failed", error = error_msg);
    }

    pub fn admin_denied(&self, path: &str) {
        warn!(target: "audit", event = "admin_denied", path);
    }

    pub fn internal_error(&self, request_id: Option<&str>, error_msg: &str) {
        error!(target: "audit", event = "internal_error", request_id = request_id.unwrap_or(""), error = error_msg);
    }
}
