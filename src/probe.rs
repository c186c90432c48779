//! Single-node health probing and state classification.
//!
//! One probe, one node, one tri-state answer. Never errors: every transport
//! failure collapses into [`ConnectionState::Disconnected`] with a reason
//! code, so callers race probes freely without error plumbing.
//!
//! Wire order: `GET /healthz` (liveness) → `GET /readyz` (readiness with a
//! loaded-model count) → `GET /v1/models` as a fallback for older nodes that
//! predate `/readyz`.

use std::fmt;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::time::timeout;

/// Observable node state. `Degraded` means the process answers but cannot
/// serve inference yet (typically: no model loaded).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Degraded,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
            ConnectionState::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

/// Outcome of a single probe call. `reason` is a stable short code for
/// diagnostics (`no_models_loaded`, `healthz_http_503`, ...) — never used
/// for control flow beyond `state`.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub state: ConnectionState,
    pub latency_ms: u64,
    pub models_loaded: u32,
    pub reason: Option<String>,
}

impl ProbeResult {
    fn disconnected(start: Instant, reason: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            latency_ms: start.elapsed().as_millis() as u64,
            models_loaded: 0,
            reason: Some(reason.into()),
        }
    }

    fn degraded(start: Instant, models_loaded: u32, reason: impl Into<String>) -> Self {
        Self {
            state: ConnectionState::Degraded,
            latency_ms: start.elapsed().as_millis() as u64,
            models_loaded,
            reason: Some(reason.into()),
        }
    }

    fn connected(start: Instant, models_loaded: u32) -> Self {
        Self {
            state: ConnectionState::Connected,
            latency_ms: start.elapsed().as_millis() as u64,
            models_loaded,
            reason: None,
        }
    }
}

/// Build an HTTP base URL, bracketing bare IPv6 hosts.
pub(crate) fn http_base_url(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("http://[{}]:{}", host, port)
    } else {
        format!("http://{}:{}", host, port)
    }
}

/// Health-check client for a single host:port.
#[derive(Clone)]
pub struct ProbeClient {
    client: reqwest::Client,
}

impl ProbeClient {
    /// The HTTP client carries a hard ceiling; per-call budgets are enforced
    /// with `tokio::time::timeout` around each request.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Probe one node. Infallible: every failure mode maps onto a state.
    ///
    /// `admin_key` is forwarded as `X-Admin-Key` so nodes with locked-down
    /// readiness endpoints still answer.
    pub async fn probe(
        &self,
        host: &str,
        port: u16,
        budget: Duration,
        admin_key: Option<&str>,
    ) -> ProbeResult {
        let start = Instant::now();
        let base = http_base_url(host, port);
        let deadline = start + budget;

        // Liveness first; nothing else matters if the process is gone.
        match self.get_json(&format!("{}/healthz", base), deadline, admin_key).await {
            Ok((status, _)) if (200..300).contains(&status) => {}
            Ok((status, _)) => {
                return ProbeResult::disconnected(start, format!("healthz_http_{}", status));
            }
            Err(reason) => {
                tracing::debug!(host, port, %reason, "probe_healthz_failed");
                return ProbeResult::disconnected(start, reason);
            }
        }

        // Readiness: 200 = serving, 503-style = alive but not ready.
        match self.get_json(&format!("{}/readyz", base), deadline, admin_key).await {
            Ok((200, body)) => {
                let count = body
                    .get("models_loaded")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                ProbeResult::connected(start, count)
            }
            // Older nodes have no /readyz at all — fall back to the models list.
            Ok((404, _)) | Err(_) => {
                self.probe_models_fallback(&base, start, deadline, admin_key).await
            }
            Ok((status, body)) => {
                // Not-ready bodies may still carry a partial count.
                let count = body
                    .get("models_loaded")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as u32;
                let reason = body
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(normalize_reason)
                    .unwrap_or_else(|| format!("readyz_http_{}", status));
                ProbeResult::degraded(start, count, reason)
            }
        }
    }

    /// `GET /v1/models` fallback: empty list → degraded, non-empty → connected.
    async fn probe_models_fallback(
        &self,
        base: &str,
        start: Instant,
        deadline: Instant,
        admin_key: Option<&str>,
    ) -> ProbeResult {
        match self.get_json(&format!("{}/v1/models", base), deadline, admin_key).await {
            Ok((status, body)) if (200..300).contains(&status) => {
                let count = body
                    .get("data")
                    .and_then(Value::as_array)
                    .map(|a| a.len() as u32)
                    .unwrap_or(0);
                if count == 0 {
                    ProbeResult::degraded(start, 0, "no_models_loaded")
                } else {
                    ProbeResult::connected(start, count)
                }
            }
            Ok((status, _)) => {
                ProbeResult::degraded(start, 0, format!("models_http_{}", status))
            }
            Err(reason) => {
                // healthz answered but everything else is unreachable —
                // the process is alive, so classify as degraded.
                ProbeResult::degraded(start, 0, reason)
            }
        }
    }

    /// GET a URL within the remaining budget; returns (status, parsed body).
    /// An unparseable body becomes `Value::Null` rather than an error.
    async fn get_json(
        &self,
        url: &str,
        deadline: Instant,
        admin_key: Option<&str>,
    ) -> Result<(u16, Value), String> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err("probe_timeout".to_string());
        }

        let mut req = self.client.get(url);
        if let Some(key) = admin_key {
            req = req.header("X-Admin-Key", key);
        }

        match timeout(remaining, req.send()).await {
            Ok(Ok(resp)) => {
                let status = resp.status().as_u16();
                let body = match timeout(
                    deadline.saturating_duration_since(Instant::now()),
                    resp.json::<Value>(),
                )
                .await
                {
                    Ok(Ok(v)) => v,
                    _ => Value::Null,
                };
                Ok((status, body))
            }
            Ok(Err(e)) => Err(classify_transport_error(&e)),
            Err(_) => Err("probe_timeout".to_string()),
        }
    }
}

impl Default for ProbeClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse a reqwest error into a short stable reason code.
fn classify_transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "probe_timeout".to_string()
    } else if e.is_connect() {
        "connection_refused".to_string()
    } else {
        "transport_error".to_string()
    }
}

/// Turn a server-provided reason string into a stable snake_case code.
fn normalize_reason(reason: &str) -> String {
    let code: String = reason
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    let collapsed: String = code.split('_').filter(|s| !s.is_empty()).collect::<Vec<_>>().join("_");
    if collapsed.is_empty() {
        "not_ready".to_string()
    } else {
        collapsed
    }
}
