use anyhow::{anyhow, Context, Result};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::{Client, Method};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::gateway::admin::{IssueResponse, ADMIN_TOKEN_HEADER};

/// Client for the gateway's admin listener, used by the CLI.
#[derive(Debug, Clone)]
pub struct AdminClient {
    base_url: String,
    client: Client,
}

impl AdminClient {
    pub fn new(base_url: &str, admin_token: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut token = HeaderValue::from_str(admin_token).context("admin token is not a valid header value")?;
        token.set_sensitive(true);
        headers.insert(ADMIN_TOKEN_HEADER, token);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .context("building http client")?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn call<T: Serialize>(&self, method: Method, path: &str, payload: Option<&T>) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, url = %url, "admin request");

        let mut req = self.client.request(method, &url);
        if let Some(p) = payload {
            req = req.json(p);
        }
        let resp = req.send().await.with_context(|| format!("sending admin request to {url}"))?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("no error message");
            return Err(anyhow!("admin request failed with status {}: {}", status, message));
        }
        Ok(body)
    }

    pub async fn rotate_key(&self, service: &str) -> Result<Value> {
        self.call::<()>(Method::POST, &format!("/admin/services/{service}/rotate"), None)
            .await
    }

    pub async fn revoke(&self, service: &str) -> Result<Value> {
        self.call::<()>(Method::POST, &format!("/admin/services/{service}/revoke"), None)
            .await
    }

    pub async fn provision(&self, service: &str, allowed_scopes: &[String]) -> Result<Value> {
        let payload = json!({"name": service, "allowed_scopes": allowed_scopes});
        self.call(Method::POST, "/admin/services", Some(&payload)).await
    }

    pub async fn reload_waf(&self) -> Result<Value> {
        self.call::<()>(Method::POST, "/admin/waf/reload", None).await
    }

    pub async fn metrics(&self) -> Result<Value> {
        self.call::<()>(Method::GET, "/admin/metrics", None).await
    }

    pub async fn issue_token(
        &self,
        service: &str,
        subject: Option<&str>,
        scopes: &[String],
        ttl_secs: Option<u64>,
    ) -> Result<IssueResponse> {
        let payload = json!({
            "service": service,
            "subject": subject,
            "scopes": scopes,
            "ttl_secs": ttl_secs,
        });
        let body = self.call(Method::POST, "/admin/tokens", Some(&payload)).await?;
        serde_json::from_value(body).context("parsing issue-token response")
    }
}
