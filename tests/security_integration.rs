use axum::body::Body;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use chrono::Duration as ChronoDuration;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use service_gateway::config::{GatewayConfig, ServiceConfig};
use service_gateway::gateway::{create_admin_router, create_router, GatewayState, SharedState};
use service_gateway::security::scopes::Scopes;
use service_gateway::security::secrets::SecretSource;
use service_gateway::security::token::ServiceToken;
use service_gateway::utils::clock::{Clock, ManualClock};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt; // for Router::oneshot

const NOW: i64 = 1_700_000_020;
const ADMIN: &str = "admin-secret";

struct Harness {
    state: SharedState,
    clock: Arc<ManualClock>,
    public: Router,
    admin: Router,
}

fn service(name: &str, base_url: &str, prefix: &str, required: &[&str], allowed: &[&str]) -> ServiceConfig {
    ServiceConfig {
        name: name.to_string(),
        base_url: base_url.to_string(),
        route_prefix: prefix.to_string(),
        required_scopes: required.iter().map(|s| s.to_string()).collect(),
        allowed_scopes: allowed.iter().map(|s| s.to_string()).collect(),
        strip_prefix: true,
    }
}

fn test_config(downstream: &str) -> GatewayConfig {
    let mut cfg = GatewayConfig::default();
    cfg.proxy.max_retries = 0;
    cfg.waf.max_body_bytes = 1024;
    cfg.services = vec![
        service("inventory", downstream, "/inventory", &["inventory:read"], &[]),
        service("billing", downstream, "/billing", &[], &["inventory:read", "inventory:write"]),
        service("reports", downstream, "/reports", &[], &[]),
    ];
    cfg
}

async fn harness_with(cfg: GatewayConfig, admin_token: Option<&str>) -> Harness {
    let clock = Arc::new(ManualClock::at_unix(NOW));
    let dyn_clock: Arc<dyn Clock> = clock.clone();
    let state = Arc::new(
        GatewayState::build(cfg, &SecretSource::Env, dyn_clock, admin_token.map(str::to_string))
            .await
            .unwrap(),
    );
    Harness {
        public: create_router(state.clone()),
        admin: create_admin_router(state.clone()),
        state,
        clock,
    }
}

async fn harness(downstream: &str) -> Harness {
    harness_with(test_config(downstream), Some(ADMIN)).await
}

fn issue(state: &SharedState, service: &str, scopes: &[&str], ttl_secs: u64) -> String {
    state
        .tokens
        .issue(service, Scopes::parse_list(scopes).unwrap(), Duration::from_secs(ttl_secs))
        .unwrap()
        .encode()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, body)
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(t) = token {
        builder = builder.header("x-service-token", t);
    }
    builder.body(Body::empty()).unwrap()
}

fn admin_post(uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(uri);
    if let Some(t) = token {
        builder = builder.header("x-admin-token", t);
    }
    match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn downstream_ok(server: &mut mockito::ServerGuard, path: &str) -> mockito::Mock {
    server
        .mock("GET", path)
        .with_status(200)
        .with_body("ok")
        .create_async()
        .await
}

#[tokio::test]
async fn missing_token_is_unauthorized() {
    let h = harness("http://127.0.0.1:1").await;
    let (status, _, body) = send(&h.public, get("/inventory/items", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Malformed service token");
}

#[tokio::test]
async fn tampered_token_is_rejected() {
    let h = harness("http://127.0.0.1:1").await;
    let token = issue(&h.state, "billing", &["inventory:read"], 60);
    let (payload, _) = token.split_once('.').unwrap();
    let forged = format!("{payload}.AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA");

    let (status, _, body) = send(&h.public, get("/inventory/items", Some(&forged))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Invalid token signature");
}

#[tokio::test]
async fn insufficient_scope_is_forbidden() {
    let h = harness("http://127.0.0.1:1").await;
    let token = issue(&h.state, "billing", &["inventory:write"], 60);

    let (status, _, body) = send(&h.public, get("/inventory/items", Some(&token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Insufficient scope: inventory:read required");
}

#[tokio::test]
async fn token_expires_at_ttl() {
    let mut server = mockito::Server::new_async().await;
    let _m = downstream_ok(&mut server, "/items").await;
    let h = harness(&server.url()).await;
    let token = issue(&h.state, "billing", &["inventory:read"], 60);

    h.clock.advance(ChronoDuration::seconds(59));
    let (status, _, _) = send(&h.public, get("/inventory/items", Some(&token))).await;
    assert_eq!(status, StatusCode::OK);

    h.clock.advance(ChronoDuration::seconds(1));
    let (status, _, body) = send(&h.public, get("/inventory/items", Some(&token))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Service token expired");
}

#[tokio::test]
async fn waf_runs_before_auth() {
    let h = harness("http://127.0.0.1:1").await;

    // No token at all: the WAF answers first.
    let (status, _, body) = send(
        &h.public,
        get("/inventory/items?q=%27%20OR%20%271%27%3D%271", None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("sql_injection"));

    let req = Request::builder()
        .method("POST")
        .uri("/billing/notes")
        .body(Body::from(r#"{"note":"<script>alert(1)</script>"}"#))
        .unwrap();
    let (status, _, body) = send(&h.public, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("xss"));
    assert_eq!(h.state.metrics.snapshot().rejected_waf, 2);
    assert_eq!(h.state.metrics.snapshot().rejected_auth, 0);
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let h = harness("http://127.0.0.1:1").await;
    let token = issue(&h.state, "billing", &[], 60);
    let req = Request::builder()
        .method("POST")
        .uri("/billing/upload")
        .header("x-service-token", token)
        .body(Body::from(vec![b'a'; 4096]))
        .unwrap();

    let (status, _, body) = send(&h.public, req).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["status_code"], 413);
}

#[tokio::test]
async fn rate_limit_applies_before_auth() {
    let mut cfg = test_config("http://127.0.0.1:1");
    cfg.rate_limit.limit = 2;
    cfg.rate_limit.per_ip_limit = 2;
    let h = harness_with(cfg, Some(ADMIN)).await;

    for _ in 0..2 {
        let (status, _, _) = send(&h.public, get("/inventory/items", Some("garbage"))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    let (status, headers, body) = send(&h.public, get("/inventory/items", Some("garbage"))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["status_code"], 429);
    // Window is 60s and the clock sits 40s into it.
    assert_eq!(headers["retry-after"], "20");

    // The next window starts fresh.
    h.clock.advance(ChronoDuration::seconds(20));
    let (status, _, _) = send(&h.public, get("/inventory/items", Some("garbage"))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn forged_issuers_share_the_client_address_bucket() {
    let mut cfg = test_config("http://127.0.0.1:1");
    cfg.rate_limit.limit = 2;
    cfg.rate_limit.per_ip_limit = 2;
    let h = harness_with(cfg, Some(ADMIN)).await;
    let genuine = issue(&h.state, "billing", &["inventory:read"], 300);

    let forge = |issuer: String| {
        let mut token = ServiceToken::parse(&genuine).unwrap();
        token.issuer = issuer;
        token.encode()
    };

    for i in 0..2 {
        let (status, _, _) = send(&h.public, get("/inventory/items", Some(&forge(format!("forged-{i}"))))).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
    for i in 2..10 {
        let (status, _, _) = send(&h.public, get("/inventory/items", Some(&forge(format!("forged-{i}"))))).await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    }
    // A genuine token from the same address is throttled too.
    let (status, _, _) = send(&h.public, get("/inventory/items", Some(&genuine))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(h.state.limiter.bucket_count(), 1);
}

#[tokio::test]
async fn registered_issuer_gets_its_own_bucket() {
    let mut server = mockito::Server::new_async().await;
    let _m = downstream_ok(&mut server, "/items").await;
    let mut cfg = test_config(&server.url());
    cfg.rate_limit.limit = 2;
    cfg.rate_limit.per_ip_limit = 10;
    let h = harness_with(cfg, Some(ADMIN)).await;
    let billing = issue(&h.state, "billing", &["inventory:read"], 300);

    for _ in 0..2 {
        let (status, _, _) = send(&h.public, get("/inventory/items", Some(&billing))).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _, _) = send(&h.public, get("/inventory/items", Some(&billing))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);

    // Other callers at the address still have headroom in the address bucket.
    let (status, _, _) = send(&h.public, get("/inventory/items", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.state.limiter.bucket_count(), 2);
}

#[tokio::test]
async fn rotation_keeps_old_tokens_valid_for_grace() {
    let mut server = mockito::Server::new_async().await;
    let _m = downstream_ok(&mut server, "/items").await;
    let h = harness(&server.url()).await;
    let old = issue(&h.state, "billing", &["inventory:read"], 3600);

    let (status, _, body) = send(
        &h.admin,
        admin_post("/admin/services/billing/rotate", Some(ADMIN), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"]["kid"], "v2");
    assert_eq!(body["retiring"][0]["kid"], "v1");

    let new = issue(&h.state, "billing", &["inventory:read"], 3600);
    assert_ne!(old, new);
    for token in [&old, &new] {
        let (status, _, _) = send(&h.public, get("/inventory/items", Some(token))).await;
        assert_eq!(status, StatusCode::OK);
    }

    // Past the grace period the retiring key is gone.
    h.clock.advance(ChronoDuration::seconds(3601));
    h.state.registry.sweep();
    let (status, _, body) = send(&h.public, get("/inventory/items", Some(&old))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Unknown signing key");
}

#[tokio::test]
async fn revoked_identity_is_forbidden() {
    let h = harness("http://127.0.0.1:1").await;
    let token = issue(&h.state, "billing", &["inventory:read"], 60);

    let (status, _, body) = send(
        &h.admin,
        admin_post("/admin/services/billing/revoke", Some(ADMIN), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "revoked");

    let (status, _, body) = send(&h.public, get("/inventory/items", Some(&token))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Service identity revoked");

    // A revoked identity cannot be issued new tokens either.
    let (status, _, _) = send(
        &h.admin,
        admin_post(
            "/admin/tokens",
            Some(ADMIN),
            Some(json!({"service": "billing", "scopes": ["inventory:read"]})),
        ),
    )
    .await;
    assert_ne!(status, StatusCode::OK);
}

#[tokio::test]
async fn admin_issued_token_passes_the_gateway() {
    let mut server = mockito::Server::new_async().await;
    let _m = downstream_ok(&mut server, "/items").await;
    let h = harness(&server.url()).await;

    let (status, _, body) = send(
        &h.admin,
        admin_post(
            "/admin/tokens",
            Some(ADMIN),
            Some(json!({"service": "billing", "scopes": ["inventory:read"], "ttl_secs": 120})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kid"], "v1");
    assert_eq!(body["expires_at"], NOW + 120);

    let token = body["token"].as_str().unwrap();
    let (status, _, _) = send(&h.public, get("/inventory/items", Some(token))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn admin_rejects_disallowed_scope_and_ttl() {
    let h = harness("http://127.0.0.1:1").await;

    let (status, _, _) = send(
        &h.admin,
        admin_post(
            "/admin/tokens",
            Some(ADMIN),
            Some(json!({"service": "reports", "scopes": ["inventory:read"]})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = send(
        &h.admin,
        admin_post(
            "/admin/tokens",
            Some(ADMIN),
            Some(json!({"service": "reports", "ttl_secs": 999_999})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_requires_token() {
    let h = harness("http://127.0.0.1:1").await;

    let (status, _, body) = send(&h.admin, admin_post("/admin/services/billing/rotate", None, None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], true);

    let (status, _, _) = send(
        &h.admin,
        admin_post("/admin/services/billing/rotate", Some("wrong"), None),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(h.state.registry.keys("billing").len(), 1);
}

#[tokio::test]
async fn admin_disabled_without_configured_token() {
    let h = harness_with(test_config("http://127.0.0.1:1"), None).await;
    let (status, _, body) = send(
        &h.admin,
        admin_post("/admin/services/billing/rotate", Some(ADMIN), None),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["message"], "Admin API disabled");
}

#[tokio::test]
async fn admin_provisions_new_service() {
    let h = harness("http://127.0.0.1:1").await;
    let (status, _, body) = send(
        &h.admin,
        admin_post(
            "/admin/services",
            Some(ADMIN),
            Some(json!({"name": "ledger", "allowed_scopes": ["ledger:read"]})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["key"]["kid"], "v1");

    let (status, _, _) = send(
        &h.admin,
        admin_post("/admin/services", Some(ADMIN), Some(json!({"name": "ledger"}))),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, _) = send(
        &h.admin,
        admin_post("/admin/services", Some(ADMIN), Some(json!({"name": "bad name!"}))),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn waf_reload_without_rule_file_keeps_rules() {
    let h = harness("http://127.0.0.1:1").await;
    let before = h.state.waf.rule_count();
    let (status, _, body) = send(&h.admin, admin_post("/admin/waf/reload", Some(ADMIN), None)).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["message"].as_str().unwrap().contains("previous rules kept"));
    assert_eq!(h.state.waf.rule_count(), before);
}
