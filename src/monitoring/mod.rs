use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tracing::info;

use crate::gateway::error::GatewayError;

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
	pub timestamp_ms: u128,
	pub requests_received: u64,
	pub requests_dispatched: u64,
	pub rejected_waf: u64,
	pub rejected_rate_limit: u64,
	pub rejected_route: u64,
	pub rejected_auth: u64,
	pub downstream_failures: u64,
	pub internal_errors: u64,
	pub waf_observed: u64,
}

/// Request counters, updated lock-free from the request path.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
	requests_received: AtomicU64,
	requests_dispatched: AtomicU64,
	rejected_waf: AtomicU64,
	rejected_rate_limit: AtomicU64,
	rejected_route: AtomicU64,
	rejected_auth: AtomicU64,
	downstream_failures: AtomicU64,
	internal_errors: AtomicU64,
	waf_observed: AtomicU64,
}

impl GatewayMetrics {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn received(&self) {
		self.requests_received.fetch_add(1, Ordering::Relaxed);
	}

	pub fn dispatched(&self) {
		self.requests_dispatched.fetch_add(1, Ordering::Relaxed);
	}

	pub fn observed(&self, n: usize) {
		self.waf_observed.fetch_add(n as u64, Ordering::Relaxed);
	}

	/// Count a rejection under the stage that produced it.
	pub fn rejected(&self, err: &GatewayError) {
		let counter = match err {
			GatewayError::WafBlocked(_) | GatewayError::PayloadTooLarge | GatewayError::MalformedHeader => &self.rejected_waf,
			GatewayError::RateLimited { .. } => &self.rejected_rate_limit,
			GatewayError::RouteNotFound => &self.rejected_route,
			GatewayError::MalformedToken
			| GatewayError::UnknownKeyId
			| GatewayError::BadSignature
			| GatewayError::ExpiredToken
			| GatewayError::RevokedIdentity
			| GatewayError::ScopeDenied(_)
			| GatewayError::AuthUnavailable => &self.rejected_auth,
			GatewayError::DownstreamTimeout | GatewayError::DownstreamUnavailable => &self.downstream_failures,
			GatewayError::Internal => &self.internal_errors,
		};
		counter.fetch_add(1, Ordering::Relaxed);
	}

	pub fn snapshot(&self) -> MetricsSnapshot {
		MetricsSnapshot {
			timestamp_ms: SystemTime::now()
				.duration_since(UNIX_EPOCH)
				.map(|d| d.as_millis())
				.unwrap_or_default(),
			requests_received: self.requests_received.load(Ordering::Relaxed),
			requests_dispatched: self.requests_dispatched.load(Ordering::Relaxed),
			rejected_waf: self.rejected_waf.load(Ordering::Relaxed),
			rejected_rate_limit: self.rejected_rate_limit.load(Ordering::Relaxed),
			rejected_route: self.rejected_route.load(Ordering::Relaxed),
			rejected_auth: self.rejected_auth.load(Ordering::Relaxed),
			downstream_failures: self.downstream_failures.load(Ordering::Relaxed),
			internal_errors: self.internal_errors.load(Ordering::Relaxed),
			waf_observed: self.waf_observed.load(Ordering::Relaxed),
		}
	}
}

/// Periodically log a lightweight heartbeat with the current counters.
pub fn spawn_heartbeat(metrics: Arc<GatewayMetrics>, interval: Duration) -> JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			tokio::time::sleep(interval).await;
			let snapshot = metrics.snapshot();
			info!(
				received = snapshot.requests_received,
				dispatched = snapshot.requests_dispatched,
				rejected_waf = snapshot.rejected_waf,
				rejected_rate_limit = snapshot.rejected_rate_limit,
				rejected_auth = snapshot.rejected_auth,
				downstream_failures = snapshot.downstream_failures,
				"heartbeat metrics"
			);
		}
	})
}
