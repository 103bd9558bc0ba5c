use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::context::{request_id_from, RequestContext, REQUEST_ID_HEADER};
use super::error::GatewayError;
use super::proxy::{ProxyClient, ProxyError};
use crate::config::ServiceConfig;
use crate::monitoring::GatewayMetrics;
use crate::security::audit_log::AuditLogger;
use crate::security::auth::AuthGuard;
use crate::security::rate_limit::RateLimiter;
use crate::security::scopes::{InvalidScope, Scopes};
use crate::security::token::ServiceToken;
use crate::waf::{Decision, WafFilter};

pub const SERVICE_HEADER: &str = "x-gateway-service";
pub const SUBJECT_HEADER: &str = "x-gateway-subject";
pub const SCOPES_HEADER: &str = "x-gateway-scopes";

const IDENTITY_HEADERS: [&str; 3] = [SERVICE_HEADER, SUBJECT_HEADER, SCOPES_HEADER];

#[derive(Debug, Clone)]
pub struct Route {
    pub service: String,
    pub prefix: String,
    pub base_url: String,
    pub required_scopes: Scopes,
    pub strip_prefix: bool,
}

impl Route {
    fn matches(&self, path: &str) -> bool {
        match path.strip_prefix(self.prefix.as_str()) {
            Some(rest) => self.prefix.ends_with('/') || rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Downstream URL for an inbound path and query.
    pub fn target_url(&self, path: &str, query: Option<&str>) -> String {
        let forwarded = if self.strip_prefix {
            let rest = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
            if rest.starts_with('/') {
                rest.to_string()
            } else {
                format!("/{rest}")
            }
        } else {
            path.to_string()
        };
        let mut url = format!("{}{}", self.base_url.trim_end_matches('/'), forwarded);
        if let Some(q) = query {
            url.push('?');
            url.push_str(q);
        }
        url
    }
}

/// Static prefix routes, longest prefix first.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: Vec<Route>,
}

impl RouteTable {
    pub fn from_config(services: &[ServiceConfig]) -> Result<Self, InvalidScope> {
        let mut routes = services
            .iter()
            .map(|svc| {
                Ok(Route {
                    service: svc.name.clone(),
                    prefix: svc.route_prefix.clone(),
                    base_url: svc.base_url.clone(),
                    required_scopes: Scopes::parse_list(&svc.required_scopes)?,
                    strip_prefix: svc.strip_prefix,
                })
            })
            .collect::<Result<Vec<_>, InvalidScope>>()?;
        routes.sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
        Ok(Self { routes })
    }

    pub fn resolve(&self, path: &str) -> Option<&Route> {
        self.routes.iter().find(|r| r.matches(path))
    }

    pub fn routes(&self) -> &[Route] {
        &self.routes
    }
}

/// Runs every inbound request through WAF, rate limit and auth, in that
/// order, before proxying it. The first stage to object ends the request.
#[derive(Debug)]
pub struct Dispatcher {
    waf: Arc<WafFilter>,
    limiter: RateLimiter,
    per_ip_limit: u64,
    auth: AuthGuard,
    routes: RouteTable,
    proxy: ProxyClient,
    metrics: Arc<GatewayMetrics>,
    audit: AuditLogger,
}

impl Dispatcher {
    pub fn new(
        waf: Arc<WafFilter>,
        limiter: RateLimiter,
        per_ip_limit: u64,
        auth: AuthGuard,
        routes: RouteTable,
        proxy: ProxyClient,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            waf,
            limiter,
            per_ip_limit,
            auth,
            routes,
            proxy,
            metrics,
            audit: AuditLogger::new(),
        }
    }

    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    pub async fn handle(&self, client_ip: IpAddr, req: Request<Body>) -> Response {
        self.metrics.received();
        let (parts, body) = req.into_parts();
        let request_id = request_id_from(&parts.headers);
        let mut ctx = RequestContext::new(
            request_id,
            client_ip,
            parts.method,
            parts.uri.path(),
            parts.uri.query(),
            parts.headers,
        );

        let result = match self.read_body(&ctx.headers, body).await {
            Ok((bytes, truncated)) => {
                ctx = ctx.with_body(bytes, truncated);
                self.dispatch(&mut ctx).await
            }
            Err(e) => Err(e),
        };

        let mut response = match result {
            Ok(resp) => {
                self.metrics.dispatched();
                resp
            }
            Err(err) => {
                self.metrics.rejected(&err);
                if matches!(err, GatewayError::Internal) {
                    self.audit.internal_error(Some(&ctx.request_id), "request pipeline failure");
                }
                info!(
                    request_id = %ctx.request_id,
                    client_ip = %ctx.client_ip,
                    method = %ctx.method,
                    path = %ctx.path,
                    status = err.status().as_u16(),
                    reason = err.kind(),
                    "request rejected"
                );
                err.into_response()
            }
        };
        if let Some(v) = ctx.request_id_header() {
            response.headers_mut().insert(REQUEST_ID_HEADER, v);
        }
        response
    }

    /// Read at most `max_body_bytes`. Anything longer is flagged as
    /// truncated and left for the WAF size check to reject.
    async fn read_body(&self, headers: &HeaderMap, body: Body) -> Result<(Bytes, bool), GatewayError> {
        let max = self.waf.limits().max_body_bytes;
        let declared = headers
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        if declared.is_some_and(|n| n > max as u64) {
            return Ok((Bytes::new(), true));
        }

        match Limited::new(body, max).collect().await {
            Ok(collected) => Ok((collected.to_bytes(), false)),
            Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Ok((Bytes::new(), true)),
            Err(e) => {
                error!(error = %e, "failed to read request body");
                Err(GatewayError::Internal)
            }
        }
    }

    pub async fn dispatch(&self, ctx: &mut RequestContext) -> Result<Response, GatewayError> {
        // WAF
        let inspection = self.waf.inspect(ctx);
        let client_ip = ctx.client_ip.to_string();
        if !inspection.observed.is_empty() {
            self.metrics.observed(inspection.observed.len());
            for m in &inspection.observed {
                self.audit
                    .waf_observed(&client_ip, &ctx.request_id, m.category.as_str(), &m.rule_id);
            }
        }
        if let Decision::Block(m) = inspection.decision {
            self.audit
                .waf_blocked(&client_ip, &ctx.request_id, m.category.as_str(), &m.rule_id);
            let err = GatewayError::from(&m);
            ctx.matched_rule = Some(m);
            return Err(err);
        }

        // Rate limit
        let ip_key = format!("ip:{}", ctx.client_ip);
        let mut decision = self.limiter.check_with_limit(&ip_key, self.per_ip_limit);
        let mut key = ip_key;
        if decision.allowed {
            if let Some(service_key) = self.service_rate_key(ctx) {
                decision = self.limiter.check(&service_key);
                key = service_key;
            }
        }
        if !decision.allowed {
            self.audit.rate_limited(&key, &ctx.request_id);
            return Err(GatewayError::RateLimited {
                retry_after: decision.retry_after,
            });
        }

        // Route
        let route = self.routes.resolve(&ctx.path).ok_or(GatewayError::RouteNotFound)?;

        // Auth
        let auth = self
            .auth
            .authenticate(&ctx.headers, &route.required_scopes, &ctx.request_id);
        ctx.auth_result = Some(auth.clone());
        let identity = auth?;

        // Proxy
        let mut headers = ctx.headers.clone();
        for name in IDENTITY_HEADERS {
            headers.remove(name);
        }
        headers.remove(self.auth.header());
        insert_header(&mut headers, SERVICE_HEADER, &identity.service);
        insert_header(&mut headers, SUBJECT_HEADER, &identity.subject);
        insert_header(&mut headers, SCOPES_HEADER, &identity.scopes.to_csv());
        insert_header(&mut headers, REQUEST_ID_HEADER, &ctx.request_id);

        let url = route.target_url(&ctx.path, ctx.query.as_deref());
        debug!(request_id = %ctx.request_id, service = %route.service, %url, "dispatching");
        self.proxy
            .forward(ctx.method.clone(), &url, headers, ctx.body.clone())
            .await
            .map_err(|e| match e {
                ProxyError::Timeout { .. } => GatewayError::DownstreamTimeout,
                ProxyError::Unavailable { .. } => GatewayError::DownstreamUnavailable,
            })
    }

    /// Per-service bucket, charged on top of the client address bucket.
    /// The issuer claim is unverified here, so only names of registered
    /// services get a bucket of their own.
    fn service_rate_key(&self, ctx: &RequestContext) -> Option<String> {
        let issuer = self
            .auth
            .extract(&ctx.headers)
            .ok()
            .and_then(ServiceToken::peek_issuer)?;
        self.auth.tokens().registry().identity(&issuer)?;
        Some(format!("svc:{issuer}@{}", ctx.client_ip))
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), v);
    }
}
