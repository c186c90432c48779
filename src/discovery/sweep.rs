//! Subnet-sweep strategy: probe the host's /24 for nodes over HTTP.
//!
//! Derives the LAN /24 from the host's own RFC-1918 address, then issues
//! bounded-concurrency `GET /.well-known/opta-lmx` probes across the range.
//! A 200 whose JSON carries the service marker registers a host, with
//! `model_count` taken from the `loaded_models` list.

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use serde_json::Value;

use crate::config::{SERVICE_MARKER, WELL_KNOWN_PATH};
use crate::discovery::{DiscoveredHost, DiscoverySource};

/// Per-address probe timeout; short because refused connections on a LAN
/// resolve in microseconds and absent hosts should not stall the sweep.
const ADDR_PROBE_TIMEOUT: Duration = Duration::from_millis(1_500);

/// Sweep the local /24 on `port`, probing `concurrency` addresses at once.
/// Returns within `budget`; no LAN interface means an empty result.
pub async fn sweep_subnet(
    client: &reqwest::Client,
    port: u16,
    concurrency: usize,
    budget: Duration,
) -> Vec<DiscoveredHost> {
    let deadline = Instant::now() + budget;

    let Some(own_ip) = find_lan_ip() else {
        tracing::debug!("sweep_no_lan_interface");
        return Vec::new();
    };

    let mut found = Vec::new();
    for batch in subnet_ips(own_ip).chunks(concurrency.max(1)) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }

        let mut futs: FuturesUnordered<_> = batch
            .iter()
            .map(|ip| {
                let client = client.clone();
                let ip = *ip;
                async move { probe_well_known(&client, ip, port).await }
            })
            .collect();

        let batch_run = async {
            while let Some(maybe_host) = futs.next().await {
                if let Some(host) = maybe_host {
                    tracing::info!(host = %host.host, models = ?host.model_count, "sweep_node_found");
                    found.push(host);
                }
            }
        };
        if tokio::time::timeout(remaining, batch_run).await.is_err() {
            break;
        }
    }

    found
}

/// Probe one address for the discovery document.
async fn probe_well_known(
    client: &reqwest::Client,
    ip: Ipv4Addr,
    port: u16,
) -> Option<DiscoveredHost> {
    let start = Instant::now();
    let url = format!("http://{}:{}{}", ip, port, WELL_KNOWN_PATH);

    let resp = tokio::time::timeout(ADDR_PROBE_TIMEOUT, client.get(&url).send())
        .await
        .ok()?
        .ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body: Value = resp.json().await.ok()?;
    if body.get("service").and_then(Value::as_str) != Some(SERVICE_MARKER) {
        return None;
    }

    let model_count = body
        .get("loaded_models")
        .and_then(Value::as_array)
        .map(|a| a.len());
    let version = body
        .get("version")
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    Some(DiscoveredHost {
        host: ip.to_string(),
        port,
        source: DiscoverySource::Sweep,
        model_count,
        latency_ms: start.elapsed().as_millis() as u64,
        version,
    })
}

/// All .1–.254 addresses in the /24 containing `own_ip`, excluding it.
pub fn subnet_ips(own_ip: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = own_ip.octets();
    (1u8..=254)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .filter(|ip| *ip != own_ip)
        .collect()
}

/// Find the host's RFC-1918 IPv4 address, preferring the interface holding
/// the default route so container bridge addresses are skipped in favour of
/// the real LAN address.
fn find_lan_ip() -> Option<Ipv4Addr> {
    #[cfg(target_os = "linux")]
    {
        let route = std::fs::read_to_string("/proc/net/route").ok();
        let fib = std::fs::read_to_string("/proc/net/fib_trie").ok();
        if let (Some(route), Some(fib)) = (&route, &fib) {
            if let Some(ip) = lan_ip_near_gateway(route, fib) {
                return Some(ip);
            }
        }
        fib.as_deref().and_then(|f| local_ips_from_fib_trie(f).into_iter().next())
    }

    #[cfg(not(target_os = "linux"))]
    {
        find_lan_ip_bsd()
    }
}

/// Pick the fib_trie candidate on the same /20 as the default gateway.
fn lan_ip_near_gateway(route_content: &str, fib_content: &str) -> Option<Ipv4Addr> {
    let iface = default_route_interface(route_content)?;
    let gw = gateway_ip(route_content, &iface)?;
    let gw_oct = gw.octets();
    local_ips_from_fib_trie(fib_content).into_iter().find(|ip| {
        let o = ip.octets();
        o[0] == gw_oct[0] && o[1] == gw_oct[1] && (o[2] >> 4) == (gw_oct[2] >> 4)
    })
}

/// Interface name of the default route (`Destination == 00000000`).
fn default_route_interface(route_content: &str) -> Option<String> {
    route_content.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split('\t').collect();
        (fields.len() >= 2 && fields[1] == "00000000").then(|| fields[0].trim().to_string())
    })
}

/// Gateway IP of `iface`'s default route. The Gateway column is hex in
/// native (little-endian) byte order; `to_be()` swaps it into the network
/// order `Ipv4Addr::from` expects.
fn gateway_ip(route_content: &str, iface: &str) -> Option<Ipv4Addr> {
    for line in route_content.lines().skip(1) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() >= 3 && fields[0].trim() == iface && fields[1] == "00000000" {
            let val = u32::from_str_radix(fields[2].trim(), 16).ok()?;
            return Some(Ipv4Addr::from(val.to_be()));
        }
    }
    None
}

/// All RFC-1918 host addresses from `/proc/net/fib_trie` content. Entries
/// look like an address line followed by a `/32 host LOCAL` line.
fn local_ips_from_fib_trie(content: &str) -> Vec<Ipv4Addr> {
    let lines: Vec<&str> = content.lines().collect();
    let mut result = Vec::new();
    for i in 0..lines.len().saturating_sub(1) {
        let Some(token) = lines[i].split_whitespace().last() else {
            continue;
        };
        if !token.contains('.') || token.contains('/') {
            continue;
        }
        if let Ok(ip) = token.parse::<Ipv4Addr>() {
            let next = lines[i + 1];
            if next.contains("/32 host") && next.contains("LOCAL") && is_rfc1918(ip) {
                result.push(ip);
            }
        }
    }
    result
}

/// True if `ip` is an RFC 1918 private address.
fn is_rfc1918(ip: Ipv4Addr) -> bool {
    let o = ip.octets();
    match o[0] {
        10 => true,
        172 => (16..=31).contains(&o[1]),
        192 => o[1] == 168,
        _ => false,
    }
}

/// macOS/BSD fallback: `route -n get default` + `ifconfig <iface>`.
#[cfg(not(target_os = "linux"))]
fn find_lan_ip_bsd() -> Option<Ipv4Addr> {
    use std::process::Command;

    let route_out = Command::new("route").args(["-n", "get", "default"]).output().ok()?;
    let route_str = String::from_utf8_lossy(&route_out.stdout);
    let iface = route_str
        .lines()
        .find(|l| l.trim().starts_with("interface:"))?
        .trim()
        .strip_prefix("interface:")?
        .trim()
        .to_string();

    let ifconfig_out = Command::new("ifconfig").arg(&iface).output().ok()?;
    let ifconfig_str = String::from_utf8_lossy(&ifconfig_out.stdout);
    for line in ifconfig_str.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("inet ") {
            if let Some(addr) = trimmed.split_whitespace().nth(1) {
                if let Ok(ip) = addr.parse::<Ipv4Addr>() {
                    if is_rfc1918(ip) {
                        return Some(ip);
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subnet_ips_excludes_own_and_broadcast() {
        let own: Ipv4Addr = "192.168.1.100".parse().unwrap();
        let ips = subnet_ips(own);
        assert_eq!(ips.len(), 253);
        assert!(!ips.contains(&own));
        assert!(!ips.contains(&"192.168.1.0".parse().unwrap()));
        assert!(!ips.contains(&"192.168.1.255".parse().unwrap()));
        assert!(ips.contains(&"192.168.1.1".parse().unwrap()));
        assert!(ips.contains(&"192.168.1.254".parse().unwrap()));
    }

    #[test]
    fn test_is_rfc1918_ranges() {
        assert!(is_rfc1918("10.0.0.1".parse().unwrap()));
        assert!(is_rfc1918("172.16.0.1".parse().unwrap()));
        assert!(is_rfc1918("172.31.255.255".parse().unwrap()));
        assert!(is_rfc1918("192.168.0.1".parse().unwrap()));
        assert!(!is_rfc1918("172.15.0.1".parse().unwrap()));
        assert!(!is_rfc1918("172.32.0.1".parse().unwrap()));
        assert!(!is_rfc1918("8.8.8.8".parse().unwrap()));
        assert!(!is_rfc1918("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_default_route_interface() {
        let content = "\
Iface\tDestination\tGateway\tFlags\n\
wlan0\t00000000\t0101A8C0\t0003\n\
wlan0\t0001A8C0\t00000000\t0001\n";
        assert_eq!(default_route_interface(content).as_deref(), Some("wlan0"));
    }

    #[test]
    fn test_default_route_interface_none() {
        let content = "Iface\tDestination\tGateway\n\
eth0\t0001A8C0\t00000000\n";
        assert_eq!(default_route_interface(content), None);
    }

    #[test]
    fn test_gateway_ip_byte_order() {
        // 0101A8C0 little-endian is 192.168.1.1.
        let content = "\
Iface\tDestination\tGateway\tFlags\n\
wlan0\t00000000\t0101A8C0\t0003\n";
        assert_eq!(
            gateway_ip(content, "wlan0"),
            Some("192.168.1.1".parse().unwrap())
        );
        assert_eq!(gateway_ip(content, "eth0"), None);
    }

    #[test]
    fn test_local_ips_from_fib_trie() {
        let content = "\
     |-- 172.17.0.1\n\
           /32 host LOCAL\n\
     |-- 192.168.1.50\n\
           /32 host LOCAL\n\
     |-- 127.0.0.1\n\
           /32 host LOCAL\n";
        let ips = local_ips_from_fib_trie(content);
        assert_eq!(ips.len(), 2);
        assert!(ips.contains(&"172.17.0.1".parse().unwrap()));
        assert!(ips.contains(&"192.168.1.50".parse().unwrap()));
    }

    #[test]
    fn test_lan_ip_near_gateway_skips_bridge() {
        // Docker bridge 172.17.0.1 appears first; the gateway sits on the
        // 192.168.1.x net, so the real LAN address must win.
        let route = "\
Iface\tDestination\tGateway\tFlags\n\
wlan0\t00000000\t0101A8C0\t0003\n";
        let fib = "\
     |-- 172.17.0.1\n\
           /32 host LOCAL\n\
     |-- 192.168.1.50\n\
           /32 host LOCAL\n";
        assert_eq!(
            lan_ip_near_gateway(route, fib),
            Some("192.168.1.50".parse().unwrap())
        );
    }

    #[test]
    fn test_lan_ip_near_gateway_none_when_no_match() {
        let route = "\
Iface\tDestination\tGateway\tFlags\n\
wlan0\t00000000\t0101A8C0\t0003\n";
        let fib = "\
     |-- 10.99.0.5\n\
           /32 host LOCAL\n";
        assert_eq!(lan_ip_near_gateway(route, fib), None);
    }
}
