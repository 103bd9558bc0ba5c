use anyhow::{Context, Result};
use axum::{
    extract::{Request, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::any::Any;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::admin;
use super::context::ClientIp;
use super::dispatcher::{Dispatcher, RouteTable};
use super::error::GatewayError;
use super::proxy::ProxyClient;
use crate::config::GatewayConfig;
use crate::monitoring::{spawn_heartbeat, GatewayMetrics};
use crate::security::audit_log::AuditLogger;
use crate::security::auth::AuthGuard;
use crate::security::key_sweeper::{load_service_keys, spawn_key_sweeper};
use crate::security::keys::KeyRegistry;
use crate::security::rate_limit::RateLimiter;
use crate::security::secrets::SecretSource;
use crate::security::signing::encode_b64url;
use crate::security::token::TokenManager;
use crate::utils::clock::{Clock, SystemClock};
use crate::waf::WafFilter;

pub type SharedState = Arc<GatewayState>;

pub const ADMIN_TOKEN_ENV: &str = "GATEWAY_ADMIN_TOKEN";

/// Everything both listeners share. Built once at startup.
#[derive(Debug)]
pub struct GatewayState {
    pub config: Arc<GatewayConfig>,
    pub registry: Arc<KeyRegistry>,
    pub tokens: Arc<TokenManager>,
    pub waf: Arc<WafFilter>,
    pub limiter: RateLimiter,
    pub dispatcher: Arc<Dispatcher>,
    pub metrics: Arc<GatewayMetrics>,
    /// Read from the environment at startup; `None` disables the admin API.
    pub admin_token: Option<String>,
    pub audit: AuditLogger,
}

impl GatewayState {
    pub async fn build(
        config: GatewayConfig,
        source: &SecretSource,
        clock: Arc<dyn Clock>,
        admin_token: Option<String>,
    ) -> Result<Self> {
        let max_ttl = Duration::from_secs(config.tokens.max_ttl_secs);
        let registry = Arc::new(
            KeyRegistry::new(clock.clone(), config.keys.grace_period(), config.keys.algorithm)
                .with_max_token_ttl(chrono::Duration::seconds(max_ttl.as_secs() as i64)),
        );
        load_service_keys(&registry, source, &config.services).await?;

        let tokens = Arc::new(TokenManager::new(registry.clone(), max_ttl));
        let waf = Arc::new(WafFilter::from_config(&config.waf).context("loading WAF rules")?);
        let limiter = RateLimiter::new(
            config.rate_limit.limit,
            Duration::from_secs(config.rate_limit.window_secs),
            Duration::from_secs(config.rate_limit.idle_ttl_secs),
            clock,
        );
        let auth = AuthGuard::new(tokens.clone(), &config.tokens.header)?;
        let routes = RouteTable::from_config(&config.services).context("building route table")?;
        let proxy = ProxyClient::new(&config.proxy)?;
        let metrics = Arc::new(GatewayMetrics::new());
        let dispatcher = Arc::new(Dispatcher::new(
            waf.clone(),
            limiter.clone(),
            config.rate_limit.per_ip_limit,
            auth,
            routes,
            proxy,
            metrics.clone(),
        ));

        Ok(Self {
            config: Arc::new(config),
            registry,
            tokens,
            waf,
            limiter,
            dispatcher,
            metrics,
            admin_token: admin_token.filter(|t| !t.is_empty()),
            audit: AuditLogger::new(),
        })
    }
}

// Health check
async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    let unavailable = state.registry.unavailable_services();
    let status = if unavailable.is_empty() { "ok" } else { "degraded" };
    Json(json!({"status": status, "unavailable": unavailable}))
}

#[derive(Debug, Serialize)]
struct Jwk {
    kty: &'static str,
    crv: &'static str,
    alg: &'static str,
    #[serde(rename = "use")]
    usage: &'static str,
    kid: String,
    iss: String,
    x: String,
    status: crate::security::keys::RotationState,
}

/// Ed25519 verification keys for every active identity; retiring keys stay
/// listed until their grace period ends.
async fn jwks(State(state): State<SharedState>) -> impl IntoResponse {
    let keys: Vec<Jwk> = state
        .registry
        .public_keys()
        .into_iter()
        .map(|k| Jwk {
            kty: "OKP",
            crv: "Ed25519",
            alg: "EdDSA",
            usage: "sig",
            kid: k.kid,
            iss: k.service,
            x: encode_b64url(&k.public_key),
            status: k.state,
        })
        .collect();
    (
        [(header::CACHE_CONTROL, "no-cache")],
        Json(json!({ "keys": keys })),
    )
}

async fn gateway_fallback(
    State(state): State<SharedState>,
    ClientIp(ip): ClientIp,
    req: Request,
) -> Response {
    state.dispatcher.handle(ip, req).await
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    AuditLogger::new().internal_error(None, detail);
    GatewayError::Internal.into_response()
}

/// Public listener: health, key discovery, and everything else through the
/// dispatcher.
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/.well-known/jwks.json", get(jwks))
        .fallback(gateway_fallback)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn create_admin_router(state: SharedState) -> Router {
    admin::routes()
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub fn secret_source(config: &GatewayConfig) -> Result<SecretSource> {
    use crate::config::SecretSourceKind;
    use crate::security::vault_client::VaultClient;

    match config.keys.secret_source {
        SecretSourceKind::Env => Ok(SecretSource::Env),
        SecretSourceKind::Vault => {
            let client = VaultClient::from_env()?.context(
                "keys.secret_source is vault but VAULT_ADDRESS, VAULT_TOKEN or VAULT_AGENT_PATH_PREFIX is unset",
            )?;
            Ok(SecretSource::Vault(client))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

pub async fn serve(config: GatewayConfig) -> Result<()> {
    let source = secret_source(&config)?;
    let admin_token = std::env::var(ADMIN_TOKEN_ENV).ok();
    if admin_token.as_deref().map_or(true, str::is_empty) {
        info!("{} not set; admin API will reject every request", ADMIN_TOKEN_ENV);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = Arc::new(GatewayState::build(config, &source, clock, admin_token).await?);
    let cfg = state.config.clone();

    spawn_key_sweeper(
        state.registry.clone(),
        source,
        cfg.services.clone(),
        Duration::from_secs(cfg.keys.sweep_interval_secs),
    );
    let limiter = state.limiter.clone();
    let evict_every = Duration::from_secs(cfg.rate_limit.window_secs);
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(evict_every).await;
            limiter.evict_idle();
        }
    });
    spawn_heartbeat(state.metrics.clone(), Duration::from_secs(60));

    let public_addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen.port));
    let admin_ip: std::net::IpAddr = cfg
        .listen
        .admin_bind
        .parse()
        .with_context(|| format!("invalid listen.admin_bind {}", cfg.listen.admin_bind))?;
    let admin_addr = SocketAddr::new(admin_ip, cfg.listen.admin_port);

    let public_listener = tokio::net::TcpListener::bind(public_addr)
        .await
        .with_context(|| format!("binding {public_addr}"))?;
    let admin_listener = tokio::net::TcpListener::bind(admin_addr)
        .await
        .with_context(|| format!("binding {admin_addr}"))?;
    info!(
        routes = state.dispatcher.routes().routes().len(),
        waf_rules = state.waf.rule_count(),
        "gateway listening on {} (admin on {})",
        public_addr,
        admin_addr
    );

    let public = axum::serve(
        public_listener,
        create_router(state.clone()).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .into_future();
    let admin = axum::serve(admin_listener, create_admin_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .into_future();

    tokio::try_join!(public, admin)?;
    Ok(())
}
