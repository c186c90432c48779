//! DNS wire codec for the LAN announcement strategy.
//!
//! Builds one-shot mDNS queries and parses responder packets down to the
//! SRV + A records we care about. Names may be stored as 2-byte big-endian
//! compression pointers (`0xC0..`) back into earlier parts of the same
//! packet; [`read_name`] follows pointer chains with a bounded jump count
//! so cyclic or malicious packets are rejected instead of looping.

use std::net::Ipv4Addr;

/// Resource record types we decode.
const TYPE_A: u16 = 1;
const TYPE_PTR: u16 = 12;
const TYPE_SRV: u16 = 33;

/// IN class; the top bit doubles as the mDNS unicast-response flag.
const CLASS_IN: u16 = 0x0001;
const UNICAST_RESPONSE: u16 = 0x8000;

/// Pointer chains longer than this are treated as malformed.
const MAX_POINTER_JUMPS: usize = 8;

/// A service instance recovered from one announcement packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnouncedService {
    /// SRV target host name with the trailing dot removed.
    pub host_name: String,
    pub port: u16,
    pub addr: Ipv4Addr,
}

/// Build a one-shot PTR query for `service` (e.g. `_opta-lmx._tcp.local`)
/// with the unicast-response bit set, so responders reply directly to our
/// ephemeral port instead of the multicast group.
pub fn build_query(txn_id: u16, service: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + service.len() + 6);
    buf.extend_from_slice(&txn_id.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes()); // flags: standard query
    buf.extend_from_slice(&1u16.to_be_bytes()); // qdcount
    buf.extend_from_slice(&0u16.to_be_bytes()); // ancount
    buf.extend_from_slice(&0u16.to_be_bytes()); // nscount
    buf.extend_from_slice(&0u16.to_be_bytes()); // arcount

    for label in service.trim_end_matches('.').split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0); // root label

    buf.extend_from_slice(&TYPE_PTR.to_be_bytes());
    buf.extend_from_slice(&(CLASS_IN | UNICAST_RESPONSE).to_be_bytes());
    buf
}

/// Parse a responder packet into the announced service it describes.
///
/// Requires one SRV record (port + target name) and one A record. When
/// several A records are present, the one whose owner name matches the SRV
/// target wins; otherwise the first A record is used. Returns `None` for
/// anything malformed or incomplete — callers drop such packets silently.
pub fn parse_response(packet: &[u8]) -> Option<AnnouncedService> {
    if packet.len() < 12 {
        return None;
    }

    let flags = read_u16(packet, 2)?;
    if flags & 0x8000 == 0 {
        return None; // not a response
    }

    let qdcount = read_u16(packet, 4)? as usize;
    let ancount = read_u16(packet, 6)? as usize;
    let nscount = read_u16(packet, 8)? as usize;
    let arcount = read_u16(packet, 10)? as usize;

    let mut pos = 12;

    // Skip the echoed question section.
    for _ in 0..qdcount {
        let (_, after) = read_name(packet, pos)?;
        pos = after + 4; // qtype + qclass
    }

    let mut srv: Option<(String, u16)> = None;
    let mut a_records: Vec<(String, Ipv4Addr)> = Vec::new();

    for _ in 0..(ancount + nscount + arcount) {
        let (owner, after) = read_name(packet, pos)?;
        let rr_type = read_u16(packet, after)?;
        // class (2) + ttl (4) between type and rdlength
        let rdlen = read_u16(packet, after + 8)? as usize;
        let rdata = after + 10;
        if rdata + rdlen > packet.len() {
            return None;
        }

        match rr_type {
            TYPE_SRV if rdlen >= 7 => {
                // priority(2) weight(2) port(2) target(name)
                let port = read_u16(packet, rdata + 4)?;
                let (target, _) = read_name(packet, rdata + 6)?;
                srv = Some((target, port));
            }
            TYPE_A if rdlen == 4 => {
                let addr = Ipv4Addr::new(
                    packet[rdata],
                    packet[rdata + 1],
                    packet[rdata + 2],
                    packet[rdata + 3],
                );
                a_records.push((owner, addr));
            }
            _ => {}
        }

        pos = rdata + rdlen;
    }

    let (host_name, port) = srv?;
    let addr = a_records
        .iter()
        .find(|(owner, _)| owner.eq_ignore_ascii_case(&host_name))
        .or_else(|| a_records.first())
        .map(|(_, addr)| *addr)?;

    Some(AnnouncedService { host_name, port, addr })
}

/// Decode a possibly-compressed name starting at `start`.
///
/// Returns the dotted name and the offset just past the name in the
/// original (non-jumped) byte stream. Pointer targets must lie strictly
/// before the pointer itself; forward or cyclic chains fail.
pub(crate) fn read_name(packet: &[u8], start: usize) -> Option<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = start;
    let mut after: Option<usize> = None;
    let mut jumps = 0;

    loop {
        let len = *packet.get(pos)? as usize;

        if len == 0 {
            pos += 1;
            break;
        }

        if len & 0xC0 == 0xC0 {
            let lo = *packet.get(pos + 1)? as usize;
            let target = ((len & 0x3F) << 8) | lo;
            if target >= pos {
                return None; // forward pointer: malformed
            }
            if after.is_none() {
                after = Some(pos + 2);
            }
            jumps += 1;
            if jumps > MAX_POINTER_JUMPS {
                return None;
            }
            pos = target;
            continue;
        }

        if len & 0xC0 != 0 {
            return None; // reserved label type
        }

        let bytes = packet.get(pos + 1..pos + 1 + len)?;
        labels.push(std::str::from_utf8(bytes).ok()?.to_string());
        pos += 1 + len;
    }

    Some((labels.join("."), after.unwrap_or(pos)))
}

fn read_u16(packet: &[u8], pos: usize) -> Option<u16> {
    let bytes = packet.get(pos..pos + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Append a name as inline labels, returning the offset where it starts.
    fn push_name(buf: &mut Vec<u8>, name: &str) -> usize {
        let at = buf.len();
        for label in name.split('.') {
            buf.push(label.len() as u8);
            buf.extend_from_slice(label.as_bytes());
        }
        buf.push(0);
        at
    }

    fn push_pointer(buf: &mut Vec<u8>, target: usize) {
        buf.push(0xC0 | ((target >> 8) as u8));
        buf.push((target & 0xFF) as u8);
    }

    fn header(ancount: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&0x1234u16.to_be_bytes());
        buf.extend_from_slice(&0x8400u16.to_be_bytes()); // response, authoritative
        buf.extend_from_slice(&0u16.to_be_bytes()); // qdcount
        buf.extend_from_slice(&ancount.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf
    }

    /// Append the fixed RR fields after the owner name; returns the offset
    /// of the 2-byte rdlength so the caller can patch it.
    fn push_rr_fixed(buf: &mut Vec<u8>, rr_type: u16) -> usize {
        buf.extend_from_slice(&rr_type.to_be_bytes());
        buf.extend_from_slice(&CLASS_IN.to_be_bytes());
        buf.extend_from_slice(&120u32.to_be_bytes()); // ttl
        let rdlen_at = buf.len();
        buf.extend_from_slice(&0u16.to_be_bytes());
        rdlen_at
    }

    fn patch_rdlen(buf: &mut [u8], rdlen_at: usize) {
        let len = (buf.len() - rdlen_at - 2) as u16;
        buf[rdlen_at..rdlen_at + 2].copy_from_slice(&len.to_be_bytes());
    }

    #[test]
    fn test_build_query_shape() {
        let q = build_query(0xBEEF, "_opta-lmx._tcp.local");
        assert_eq!(&q[0..2], &0xBEEFu16.to_be_bytes());
        assert_eq!(&q[4..6], &1u16.to_be_bytes()); // one question
        // First label is "_opta-lmx".
        assert_eq!(q[12] as usize, "_opta-lmx".len());
        // Last four bytes: PTR + IN|unicast.
        let n = q.len();
        assert_eq!(&q[n - 4..n - 2], &TYPE_PTR.to_be_bytes());
        assert_eq!(&q[n - 2..], &(CLASS_IN | UNICAST_RESPONSE).to_be_bytes());
    }

    #[test]
    fn test_parse_inline_srv_and_a() {
        let mut buf = header(2);

        // SRV record: owner inline, target inline.
        push_name(&mut buf, "node._opta-lmx._tcp.local");
        let rdlen_at = push_rr_fixed(&mut buf, TYPE_SRV);
        buf.extend_from_slice(&0u16.to_be_bytes()); // priority
        buf.extend_from_slice(&0u16.to_be_bytes()); // weight
        buf.extend_from_slice(&1234u16.to_be_bytes()); // port
        let target_at = push_name(&mut buf, "studio.local");
        patch_rdlen(&mut buf, rdlen_at);

        // A record: owner points back at the SRV target.
        push_pointer(&mut buf, target_at);
        let rdlen_at = push_rr_fixed(&mut buf, TYPE_A);
        buf.extend_from_slice(&[192, 168, 1, 40]);
        patch_rdlen(&mut buf, rdlen_at);

        let svc = parse_response(&buf).unwrap();
        assert_eq!(svc.host_name, "studio.local");
        assert_eq!(svc.port, 1234);
        assert_eq!(svc.addr, Ipv4Addr::new(192, 168, 1, 40));
    }

    #[test]
    fn test_parse_pointer_aliased_srv_target_and_a_name() {
        // Both the SRV target and the A-record owner are pointers to the
        // same inline name earlier in the packet.
        let mut buf = header(2);

        let name_at = push_name(&mut buf, "mini.local");
        // Pad the name into a harmless A record so the packet stays well-formed.
        let rdlen_at = push_rr_fixed(&mut buf, TYPE_A);
        buf.extend_from_slice(&[10, 0, 0, 7]);
        patch_rdlen(&mut buf, rdlen_at);

        // SRV with pointer-compressed owner and target.
        push_pointer(&mut buf, name_at);
        let rdlen_at = push_rr_fixed(&mut buf, TYPE_SRV);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&4321u16.to_be_bytes());
        push_pointer(&mut buf, name_at);
        patch_rdlen(&mut buf, rdlen_at);

        let svc = parse_response(&buf).unwrap();
        assert_eq!(svc.host_name, "mini.local");
        assert_eq!(svc.port, 4321);
        assert_eq!(svc.addr, Ipv4Addr::new(10, 0, 0, 7));
    }

    #[test]
    fn test_parse_prefers_a_record_matching_srv_target() {
        let mut buf = header(3);

        // Unrelated A record first.
        push_name(&mut buf, "other.local");
        let rdlen_at = push_rr_fixed(&mut buf, TYPE_A);
        buf.extend_from_slice(&[192, 168, 1, 99]);
        patch_rdlen(&mut buf, rdlen_at);

        // SRV pointing at studio.local.
        push_name(&mut buf, "node._opta-lmx._tcp.local");
        let rdlen_at = push_rr_fixed(&mut buf, TYPE_SRV);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&1234u16.to_be_bytes());
        push_name(&mut buf, "studio.local");
        patch_rdlen(&mut buf, rdlen_at);

        // Matching A record last.
        push_name(&mut buf, "studio.local");
        let rdlen_at = push_rr_fixed(&mut buf, TYPE_A);
        buf.extend_from_slice(&[192, 168, 1, 40]);
        patch_rdlen(&mut buf, rdlen_at);

        let svc = parse_response(&buf).unwrap();
        assert_eq!(svc.addr, Ipv4Addr::new(192, 168, 1, 40));
    }

    #[test]
    fn test_parse_rejects_query_packets() {
        let q = build_query(1, "_opta-lmx._tcp.local");
        assert_eq!(parse_response(&q), None);
    }

    #[test]
    fn test_parse_rejects_truncated_packet() {
        let mut buf = header(1);
        push_name(&mut buf, "node.local");
        buf.extend_from_slice(&TYPE_SRV.to_be_bytes());
        // Truncated before class/ttl/rdlength.
        assert_eq!(parse_response(&buf), None);
    }

    #[test]
    fn test_parse_rejects_missing_a_record() {
        let mut buf = header(1);
        push_name(&mut buf, "node._opta-lmx._tcp.local");
        let rdlen_at = push_rr_fixed(&mut buf, TYPE_SRV);
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&0u16.to_be_bytes());
        buf.extend_from_slice(&1234u16.to_be_bytes());
        push_name(&mut buf, "studio.local");
        patch_rdlen(&mut buf, rdlen_at);

        assert_eq!(parse_response(&buf), None);
    }

    #[test]
    fn test_read_name_rejects_forward_pointer() {
        // Pointer at offset 0 targeting offset 10 (ahead of itself).
        let mut buf = vec![0u8; 16];
        buf[0] = 0xC0;
        buf[1] = 10;
        assert_eq!(read_name(&buf, 0), None);
    }

    #[test]
    fn test_read_name_rejects_pointer_cycle() {
        // Two pointers that target each other would loop forever without
        // the backward-only rule; verify a self-referential chain dies.
        let mut buf = vec![0u8; 8];
        buf[2] = 0xC0;
        buf[3] = 2; // points at itself
        assert_eq!(read_name(&buf, 2), None);
    }

    #[test]
    fn test_read_name_inline_returns_offset_after_name() {
        let mut buf = Vec::new();
        let at = push_name(&mut buf, "a.bc");
        let (name, after) = read_name(&buf, at).unwrap();
        assert_eq!(name, "a.bc");
        assert_eq!(after, buf.len());
    }

    #[test]
    fn test_read_name_after_pointer_is_two_bytes() {
        let mut buf = Vec::new();
        let at = push_name(&mut buf, "studio.local");
        let ptr_at = buf.len();
        push_pointer(&mut buf, at);
        buf.push(0xFF); // trailing byte that must not be consumed

        let (name, after) = read_name(&buf, ptr_at).unwrap();
        assert_eq!(name, "studio.local");
        assert_eq!(after, ptr_at + 2);
    }
}
