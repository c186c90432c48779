//! Endpoint resolution: race probes across candidates, favour the primary.
//!
//! All candidates are probed concurrently. A connected fallback does not win
//! outright — the primary gets a grace window to also come up, so a briefly
//! slow primary is not abandoned for a fallback that happened to answer
//! first. When nothing connects inside the budget the primary is returned
//! with an `Unknown` state rather than an error, so callers can still try
//! to connect. Results are cached per (host-set, port) until cleared.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::errors::LinkError;
use crate::probe::{ConnectionState, ProbeClient};

/// Whether an endpoint came from the configured primary or a fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSource {
    Primary,
    Fallback,
}

/// Endpoint state at resolution time. `Unknown` only appears on the
/// non-failing default returned when no candidate connected in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Connected,
    Degraded,
    Disconnected,
    Unknown,
}

impl From<ConnectionState> for EndpointState {
    fn from(s: ConnectionState) -> Self {
        match s {
            ConnectionState::Connected => EndpointState::Connected,
            ConnectionState::Degraded => EndpointState::Degraded,
            ConnectionState::Disconnected => EndpointState::Disconnected,
        }
    }
}

/// A resolved (host, port) pair with provenance. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub source: EndpointSource,
    pub state: EndpointState,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Knobs for one resolution call.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Overall budget for the whole resolution.
    pub timeout: Duration,
    /// How long a connected fallback waits for the primary. Capped at the
    /// remaining budget, so `primary_grace >= timeout` degenerates sanely.
    pub primary_grace: Duration,
    pub admin_key: Option<String>,
    pub cancel: Option<CancellationToken>,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(8),
            primary_grace: Duration::from_millis(750),
            admin_key: None,
            cancel: None,
        }
    }
}

/// Picks one live endpoint among the primary and its fallbacks.
pub struct EndpointResolver {
    probe: ProbeClient,
    cache: Mutex<HashMap<(String, u16), Endpoint>>,
}

impl EndpointResolver {
    pub fn new(probe: ProbeClient) -> Self {
        Self {
            probe,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve one endpoint. Never fails except on explicit cancellation.
    pub async fn resolve(
        &self,
        primary: &str,
        fallbacks: &[String],
        port: u16,
        opts: ResolveOptions,
    ) -> Result<Endpoint, LinkError> {
        let candidates = candidate_list(primary, fallbacks);
        let cache_key = (candidates.join(","), port);

        if let Some(cached) = self.cache.lock().unwrap().get(&cache_key).cloned() {
            tracing::debug!(endpoint = %cached, "resolve_cache_hit");
            return Ok(cached);
        }

        let endpoint = self.race(&candidates, port, &opts).await?;
        tracing::info!(
            endpoint = %endpoint,
            source = ?endpoint.source,
            state = ?endpoint.state,
            "endpoint_resolved"
        );

        self.cache
            .lock()
            .unwrap()
            .insert(cache_key, endpoint.clone());
        Ok(endpoint)
    }

    /// Drop every cached endpoint (reconnect forced, config changed).
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    async fn race(
        &self,
        candidates: &[String],
        port: u16,
        opts: &ResolveOptions,
    ) -> Result<Endpoint, LinkError> {
        let start = Instant::now();
        let deadline = start + opts.timeout;
        let cancel = opts.cancel.clone().unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(LinkError::Cancelled);
        }

        let mut probes: FuturesUnordered<_> = candidates
            .iter()
            .enumerate()
            .map(|(idx, host)| {
                let probe = self.probe.clone();
                let host = host.clone();
                let admin_key = opts.admin_key.clone();
                async move {
                    let result = probe
                        .probe(&host, port, opts.timeout, admin_key.as_deref())
                        .await;
                    (idx, host, result)
                }
            })
            .collect();

        let overall = sleep_until(deadline);
        tokio::pin!(overall);

        // Set once a fallback connects while the primary is still pending.
        let mut grace_deadline: Option<Instant> = None;
        let mut winning_fallback: Option<Endpoint> = None;
        let mut primary_settled = false;

        loop {
            let grace = async move {
                match grace_deadline {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(LinkError::Cancelled),
                _ = &mut overall => break,
                _ = grace => {
                    // Grace expired with the primary still unresolved.
                    if let Some(ep) = winning_fallback {
                        return Ok(ep);
                    }
                    break;
                }
                item = probes.next() => {
                    let Some((idx, host, result)) = item else {
                        // All probes settled without a connected primary.
                        match winning_fallback {
                            Some(ep) => return Ok(ep),
                            None => break,
                        }
                    };

                    let connected = result.state == ConnectionState::Connected;
                    tracing::debug!(
                        host = %host,
                        state = %result.state,
                        latency_ms = result.latency_ms,
                        reason = result.reason.as_deref().unwrap_or(""),
                        "resolve_probe_settled"
                    );

                    if idx == 0 {
                        primary_settled = true;
                        if connected {
                            return Ok(Endpoint {
                                host,
                                port,
                                source: EndpointSource::Primary,
                                state: EndpointState::Connected,
                            });
                        }
                        // Primary is out of the race — an already-connected
                        // fallback wins without waiting out the grace.
                        if let Some(ep) = winning_fallback {
                            return Ok(ep);
                        }
                    } else if connected && winning_fallback.is_none() {
                        let ep = Endpoint {
                            host,
                            port,
                            source: EndpointSource::Fallback,
                            state: EndpointState::Connected,
                        };
                        if primary_settled {
                            return Ok(ep);
                        }
                        winning_fallback = Some(ep);
                        // Grace is capped at the remaining overall budget.
                        let at = Instant::now() + opts.primary_grace;
                        grace_deadline = Some(at.min(deadline));
                    }
                }
            }
        }

        // Budget exhausted. A connected fallback beats the unknown default.
        if let Some(ep) = winning_fallback {
            return Ok(ep);
        }
        Ok(Endpoint {
            host: candidates[0].clone(),
            port,
            source: EndpointSource::Primary,
            state: EndpointState::Unknown,
        })
    }
}

/// `[primary, fallbacks...]`, trimmed, deduplicated, order preserved.
fn candidate_list(primary: &str, fallbacks: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(1 + fallbacks.len());
    for host in std::iter::once(primary).chain(fallbacks.iter().map(|s| s.as_str())) {
        let trimmed = host.trim();
        if !trimmed.is_empty() && !out.iter().any(|h| h == trimmed) {
            out.push(trimmed.to_string());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_list_trims_and_dedups() {
        let fallbacks = vec![
            " mini.local ".to_string(),
            "192.168.1.40".to_string(),
            "mini.local".to_string(),
            "".to_string(),
        ];
        let list = candidate_list("192.168.1.40", &fallbacks);
        assert_eq!(list, vec!["192.168.1.40", "mini.local"]);
    }

    #[test]
    fn test_candidate_list_keeps_order() {
        let fallbacks = vec!["b".to_string(), "c".to_string()];
        assert_eq!(candidate_list("a", &fallbacks), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_endpoint_state_from_connection_state() {
        assert_eq!(
            EndpointState::from(ConnectionState::Connected),
            EndpointState::Connected
        );
        assert_eq!(
            EndpointState::from(ConnectionState::Degraded),
            EndpointState::Degraded
        );
        assert_eq!(
            EndpointState::from(ConnectionState::Disconnected),
            EndpointState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_resolve_pre_cancelled_token_rejects() {
        let resolver = EndpointResolver::new(ProbeClient::new());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let opts = ResolveOptions {
            cancel: Some(cancel),
            ..Default::default()
        };
        let err = resolver
            .resolve("127.0.0.1", &[], 59_990, opts)
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Cancelled));
    }

    #[tokio::test]
    async fn test_resolve_unreachable_defaults_to_unknown_primary() {
        let resolver = EndpointResolver::new(ProbeClient::new());
        let opts = ResolveOptions {
            timeout: Duration::from_millis(300),
            primary_grace: Duration::from_millis(50),
            ..Default::default()
        };
        // Nothing listens on these ports; both probes settle disconnected.
        let ep = resolver
            .resolve("127.0.0.1", &["127.0.0.2".to_string()], 59_991, opts)
            .await
            .unwrap();
        assert_eq!(ep.host, "127.0.0.1");
        assert_eq!(ep.source, EndpointSource::Primary);
        assert_eq!(ep.state, EndpointState::Unknown);
    }

    #[tokio::test]
    async fn test_resolve_caches_until_cleared() {
        let resolver = EndpointResolver::new(ProbeClient::new());
        let opts = ResolveOptions {
            timeout: Duration::from_millis(200),
            primary_grace: Duration::from_millis(50),
            ..Default::default()
        };
        let first = resolver
            .resolve("127.0.0.1", &[], 59_992, opts.clone())
            .await
            .unwrap();

        // Second call must come from cache: give it a zero-ish budget that
        // a real probe round could never satisfy cleanly.
        let fast = ResolveOptions {
            timeout: Duration::from_millis(1),
            ..opts.clone()
        };
        let second = resolver
            .resolve("127.0.0.1", &[], 59_992, fast)
            .await
            .unwrap();
        assert_eq!(first, second);

        resolver.clear_cache();
        let third = resolver
            .resolve("127.0.0.1", &[], 59_992, opts)
            .await
            .unwrap();
        assert_eq!(third.state, EndpointState::Unknown);
    }
}
