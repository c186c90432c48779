//! Zero-config node discovery: LAN announcements + subnet sweep.
//!
//! Two strategies run concurrently and their results merge into one ranked
//! list. Hosts found by both strategies collapse to a single entry keyed by
//! IP; announcement entries win conflicts but model counts survive from
//! either side. Discovery never errors — total failure is an empty list,
//! returned within the caller's budget.

mod mdns;
pub(crate) mod packet;
mod sweep;

use std::collections::HashMap;
use std::time::Duration;

use crate::config::DiscoveryConfig;

pub use packet::AnnouncedService;

/// Which strategy produced (or contributed to) a discovered host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    Mdns,
    Sweep,
    Both,
}

/// One candidate node, alive for the duration of a single discovery call.
#[derive(Debug, Clone)]
pub struct DiscoveredHost {
    /// IP address (or resolved name) — the deduplication key.
    pub host: String,
    pub port: u16,
    pub source: DiscoverySource,
    /// Loaded-model count, when a strategy could read one.
    pub model_count: Option<usize>,
    pub latency_ms: u64,
    /// Node version from the discovery document, for diagnostics.
    pub version: Option<String>,
}

/// Finds candidate nodes on the local network.
pub struct DiscoveryService {
    config: DiscoveryConfig,
    client: reqwest::Client,
}

impl DiscoveryService {
    pub fn new(config: DiscoveryConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .connect_timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    /// Run both strategies concurrently and merge. Returns within `budget`;
    /// a zero budget returns an empty list near-instantly.
    pub async fn discover(&self, budget: Duration) -> Vec<DiscoveredHost> {
        if budget.is_zero() {
            return Vec::new();
        }

        let (announced, swept) = tokio::join!(
            mdns::query_announcements(budget),
            sweep::sweep_subnet(
                &self.client,
                self.config.sweep_port,
                self.config.sweep_concurrency,
                budget,
            ),
        );

        tracing::debug!(
            announced = announced.len(),
            swept = swept.len(),
            "discovery_strategies_complete"
        );

        merge_hosts(announced, swept)
    }
}

/// Merge and rank. Announcement entries beat sweep entries for the same IP,
/// but a model count observed by either strategy is kept. Ranking:
/// announcement-backed hosts first, then by latency.
pub(crate) fn merge_hosts(
    announced: Vec<DiscoveredHost>,
    swept: Vec<DiscoveredHost>,
) -> Vec<DiscoveredHost> {
    let mut by_ip: HashMap<String, DiscoveredHost> = HashMap::new();

    // Later entries of the same strategy overwrite earlier ones
    // (most-recent-seen wins within a sweep).
    for host in announced.into_iter().chain(swept) {
        match by_ip.remove(&host.host) {
            None => {
                by_ip.insert(host.host.clone(), host);
            }
            Some(existing) => {
                let merged = merge_pair(existing, host);
                by_ip.insert(merged.host.clone(), merged);
            }
        }
    }

    let mut hosts: Vec<DiscoveredHost> = by_ip.into_values().collect();
    hosts.sort_by(|a, b| {
        let confidence = |h: &DiscoveredHost| match h.source {
            DiscoverySource::Both | DiscoverySource::Mdns => 0,
            DiscoverySource::Sweep => 1,
        };
        confidence(a)
            .cmp(&confidence(b))
            .then(a.latency_ms.cmp(&b.latency_ms))
    });
    hosts
}

fn merge_pair(existing: DiscoveredHost, incoming: DiscoveredHost) -> DiscoveredHost {
    let both = existing.source != incoming.source;
    // Same strategy: most-recent-seen wins. Across strategies: the
    // announcement entry's fields win the conflict.
    let (mut winner, loser) = if existing.source == incoming.source
        || incoming.source == DiscoverySource::Mdns
    {
        (incoming, existing)
    } else if existing.source == DiscoverySource::Sweep {
        (incoming, existing)
    } else {
        (existing, incoming)
    };
    if winner.model_count.is_none() {
        winner.model_count = loser.model_count;
    }
    if winner.version.is_none() {
        winner.version = loser.version;
    }
    if both {
        winner.source = DiscoverySource::Both;
    }
    winner
}
