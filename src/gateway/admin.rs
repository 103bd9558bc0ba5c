use axum::{
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::info;

use super::error::ErrorEnvelope;
use super::server::SharedState;
use crate::config::validate_service_name;
use crate::security::keys::{RegistryError, RotationState, SigningKey};
use crate::security::scopes::Scopes;
use crate::security::signing::{constant_time_eq, encode_b64url};
use crate::security::token::IssueError;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

/// Admin API failure, rendered with the gateway error envelope.
#[derive(Debug)]
pub struct AdminError {
    status: StatusCode,
    message: String,
}

impl AdminError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope {
            error: true,
            message: self.message,
            status_code: self.status.as_u16(),
        };
        (self.status, Json(envelope)).into_response()
    }
}

impl From<RegistryError> for AdminError {
    fn from(e: RegistryError) -> Self {
        let status = match &e {
            RegistryError::UnknownService(_)
            | RegistryError::KeyNotFound { .. }
            | RegistryError::KeyRevoked { .. } => StatusCode::NOT_FOUND,
            RegistryError::IdentityRevoked(_) | RegistryError::AlreadyProvisioned(_) => StatusCode::CONFLICT,
            RegistryError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RegistryError::InvalidSecret { .. } => StatusCode::BAD_REQUEST,
        };
        Self::new(status, e.to_string())
    }
}

impl From<IssueError> for AdminError {
    fn from(e: IssueError) -> Self {
        let status = match &e {
            IssueError::UnknownService(_) => StatusCode::NOT_FOUND,
            IssueError::ScopeNotAllowed { .. } => StatusCode::FORBIDDEN,
            IssueError::InvalidTtl { .. } | IssueError::InvalidSubject => StatusCode::BAD_REQUEST,
            IssueError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            IssueError::Signing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

/// Proof that the request carried the admin token.
#[derive(Debug, Clone, Copy)]
pub struct AdminAuth;

impl FromRequestParts<SharedState> for AdminAuth {
    type Rejection = AdminError;

    async fn from_request_parts(parts: &mut Parts, state: &SharedState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.admin_token.as_deref() else {
            state.audit.admin_denied(parts.uri.path());
            return Err(AdminError::new(StatusCode::SERVICE_UNAVAILABLE, "Admin API disabled"));
        };
        let supplied = parts
            .headers
            .get(ADMIN_TOKEN_HEADER)
            .map(|v| v.as_bytes())
            .unwrap_or_default();
        if !constant_time_eq(supplied, expected.as_bytes()) {
            state.audit.admin_denied(parts.uri.path());
            return Err(AdminError::new(StatusCode::UNAUTHORIZED, "Invalid admin token"));
        }
        Ok(AdminAuth)
    }
}

#[derive(Debug, Serialize)]
pub struct KeyView {
    pub kid: String,
    pub alg: &'static str,
    pub state: RotationState,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub purge_after: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl From<&SigningKey> for KeyView {
    fn from(k: &SigningKey) -> Self {
        Self {
            kid: k.kid.clone(),
            alg: k.algorithm().token_alg(),
            state: k.rotation_state,
            created_at: k.created_at,
            fingerprint: k.material.fingerprint(),
            purge_after: k.purge_after,
            public_key: k.material.public_key().map(|pk| encode_b64url(pk.as_bytes())),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvisionRequest {
    pub name: String,
    #[serde(default)]
    pub allowed_scopes: Scopes,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IssueRequest {
    pub service: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub scopes: Scopes,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IssueResponse {
    pub token: String,
    pub kid: String,
    pub expires_at: i64,
}

async fn list_services(_: AdminAuth, State(state): State<SharedState>) -> impl IntoResponse {
    let services: Vec<_> = state
        .registry
        .identities()
        .into_iter()
        .map(|identity| {
            let keys: Vec<KeyView> = state.registry.keys(&identity.name).iter().map(KeyView::from).collect();
            json!({
                "name": identity.name,
                "status": identity.status,
                "allowed_scopes": identity.allowed_scopes,
                "keys": keys,
            })
        })
        .collect();
    Json(json!({ "services": services }))
}

async fn provision_service(
    _: AdminAuth,
    State(state): State<SharedState>,
    Json(req): Json<ProvisionRequest>,
) -> Result<impl IntoResponse, AdminError> {
    validate_service_name(&req.name).map_err(|e| AdminError::new(StatusCode::BAD_REQUEST, e.to_string()))?;
    let key = state.registry.provision(&req.name, req.allowed_scopes)?;
    state.audit.key_provisioned(&req.name, &key.kid);
    Ok((
        StatusCode::CREATED,
        Json(json!({"service": req.name, "key": KeyView::from(&key)})),
    ))
}

async fn rotate_key(
    _: AdminAuth,
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    let key = state.registry.rotate(&name)?;
    state.audit.key_rotated(&name, &key.kid);
    let retiring: Vec<KeyView> = state
        .registry
        .keys(&name)
        .iter()
        .filter(|k| k.rotation_state == RotationState::Retiring)
        .map(KeyView::from)
        .collect();
    Ok(Json(json!({
        "service": name,
        "active": KeyView::from(&key),
        "retiring": retiring,
        "grace_period_secs": state.registry.grace_period().num_seconds(),
    })))
}

async fn revoke_service(
    _: AdminAuth,
    State(state): State<SharedState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, AdminError> {
    state.registry.revoke(&name)?;
    state.audit.identity_revoked(&name);
    Ok(Json(json!({"service": name, "status": "revoked"})))
}

async fn issue_token(
    _: AdminAuth,
    State(state): State<SharedState>,
    Json(req): Json<IssueRequest>,
) -> Result<impl IntoResponse, AdminError> {
    let ttl = Duration::from_secs(req.ttl_secs.unwrap_or(state.config.tokens.default_ttl_secs));
    let subject = req.subject.as_deref().unwrap_or(&req.service);
    let token = state.tokens.issue_for(&req.service, subject, req.scopes, ttl)?;
    state.audit.token_issued(&req.service, subject, &token.kid);
    Ok(Json(IssueResponse {
        token: token.encode(),
        kid: token.kid,
        expires_at: token.expires_at,
    }))
}

async fn reload_waf(_: AdminAuth, State(state): State<SharedState>) -> Result<impl IntoResponse, AdminError> {
    match state.waf.reload() {
        Ok(count) => {
            state.audit.rules_reloaded(count);
            info!(rules = count, "WAF rules reloaded");
            Ok(Json(json!({"status": "reloaded", "rules": count})))
        }
        Err(e) => {
            state.audit.rules_reload_failed(&e.to_string());
            Err(AdminError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("reload failed, previous rules kept: {e}"),
            ))
        }
    }
}

async fn metrics(_: AdminAuth, State(state): State<SharedState>) -> impl IntoResponse {
    let mut snapshot = serde_json::to_value(state.metrics.snapshot()).unwrap_or_default();
    snapshot["rate_limit_buckets"] = json!(state.limiter.bucket_count());
    snapshot["waf_rules"] = json!(state.waf.rule_count());
    Json(snapshot)
}

pub fn routes() -> Router<SharedState> {
    Router::new()
        .route("/admin/services", get(list_services).post(provision_service))
        .route("/admin/services/{name}/rotate", post(rotate_key))
        .route("/admin/services/{name}/revoke", post(revoke_service))
        .route("/admin/tokens", post(issue_token))
        .route("/admin/waf/reload", post(reload_waf))
        .route("/admin/metrics", get(metrics))
}
