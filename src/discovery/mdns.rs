//! LAN announcement strategy: one-shot multicast query + reply harvest.
//!
//! Sends a single PTR query for the node service type to 224.0.0.251:5353
//! with the unicast-response bit set, then collects replies on the same
//! ephemeral socket until the deadline. Malformed packets are dropped
//! silently; one clean reply is enough to register a host.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use crate::config::MDNS_SERVICE_TYPE;
use crate::discovery::packet::{build_query, parse_response};
use crate::discovery::{DiscoveredHost, DiscoverySource};

const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;

/// Query the LAN for announced nodes. Never errors; socket failures
/// (no network, multicast blocked) degrade to an empty list.
pub async fn query_announcements(budget: Duration) -> Vec<DiscoveredHost> {
    let start = Instant::now();
    let deadline = start + budget;

    let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(error = %e, "mdns_bind_failed");
            return Vec::new();
        }
    };
    let _ = socket.set_multicast_ttl_v4(1);

    let txn_id = std::process::id() as u16 ^ start.elapsed().subsec_nanos() as u16;
    let query = build_query(txn_id, MDNS_SERVICE_TYPE);
    let target = SocketAddr::from((MDNS_GROUP, MDNS_PORT));
    if let Err(e) = socket.send_to(&query, target).await {
        tracing::debug!(error = %e, "mdns_query_send_failed");
        return Vec::new();
    }

    let mut hosts = Vec::new();
    let mut buf = [0u8; 1500];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, from))) => {
                if let Some(svc) = parse_response(&buf[..n]) {
                    tracing::debug!(
                        host = %svc.host_name,
                        port = svc.port,
                        addr = %svc.addr,
                        "mdns_node_announced"
                    );
                    hosts.push(DiscoveredHost {
                        host: svc.addr.to_string(),
                        port: svc.port,
                        source: DiscoverySource::Mdns,
                        model_count: None,
                        latency_ms: start.elapsed().as_millis() as u64,
                        version: None,
                    });
                } else {
                    tracing::trace!(from = %from, bytes = n, "mdns_packet_dropped");
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "mdns_recv_failed");
                break;
            }
            Err(_) => break, // deadline
        }
    }

    hosts
}
