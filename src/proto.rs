use std::net::IpAddr;

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::Name;

/// Number of label separators in a question name ("example.com." has one).
pub fn name_dots(name: &Name) -> usize {
    (name.num_labels() as usize).saturating_sub(1)
}

/// Lowercased presentation form with a trailing dot.
pub fn fqdn_lower(name: &Name) -> String {
    let mut s = name.to_lowercase().to_string();
    if !s.ends_with('.') {
        s.push('.');
    }
    s
}

/// `name` suffixed with a search domain, lowercased, trailing dot kept.
pub fn append_search_domain(name: &str, domain: &str) -> String {
    let mut out = format!("{}.{}", name.trim_end_matches('.'), domain.trim_end_matches('.'));
    out.make_ascii_lowercase();
    out.push('.');
    out
}

/// Skeleton response for `req`: same id, opcode and question, RA set.
pub fn build_reply(req: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(req.op_code());
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_response_code(rcode);
    if let Some(q) = req.queries().first() {
        msg.add_query(q.clone());
    }
    msg
}

pub fn is_reverse_zone(qname: &str) -> bool {
    qname.ends_with(".in-addr.arpa.") || qname.ends_with(".ip6.arpa.")
}

/// Extracts the address encoded in a reverse-zone question name.
/// Returns `None` for names that do not spell a full address, letting the
/// caller fall through to forwarding.
pub fn parse_reverse_name(qname: &str) -> Option<IpAddr> {
    let qname = qname.trim_end_matches('.');
    if let Some(rest) = qname.strip_suffix(".in-addr.arpa") {
        let octets: Vec<&str> = rest.split('.').collect();
        if octets.len() != 4 {
            return None;
        }
        let mut addr = [0u8; 4];
        for (i, octet) in octets.iter().enumerate() {
            addr[3 - i] = octet.parse().ok()?;
        }
        return Some(IpAddr::from(addr));
    }
    if let Some(rest) = qname.strip_suffix(".ip6.arpa") {
        let nibbles: Vec<&str> = rest.split('.').collect();
        if nibbles.len() != 32 {
            return None;
        }
        let mut addr = [0u8; 16];
        for (i, nibble) in nibbles.iter().enumerate() {
            if nibble.len() != 1 {
                return None;
            }
            let value = u8::from_str_radix(nibble, 16).ok()?;
            // ip6.arpa names run least-significant nibble first
            let byte = 15 - i / 2;
            if i % 2 == 0 {
                addr[byte] |= value;
            } else {
                addr[byte] |= value << 4;
            }
        }
        return Some(IpAddr::from(addr));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use std::str::FromStr;

    #[test]
    fn name_dots_counts_label_separators() {
        let name = Name::from_str("foo.example.com.").unwrap();
        assert_eq!(name_dots(&name), 2);
        let short = Name::from_str("foo.").unwrap();
        assert_eq!(name_dots(&short), 0);
        assert_eq!(name_dots(&Name::root()), 0);
    }

    #[test]
    fn append_search_domain_joins_and_lowercases() {
        assert_eq!(
            append_search_domain("Foo.", "svc.Cluster.local."),
            "foo.svc.cluster.local."
        );
        assert_eq!(append_search_domain("bar", "example.com"), "bar.example.com.");
    }

    #[test]
    fn reverse_name_round_trips_v4() {
        assert_eq!(
            parse_reverse_name("4.3.2.1.in-addr.arpa."),
            Some(IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)))
        );
        assert_eq!(parse_reverse_name("3.2.1.in-addr.arpa."), None);
    }

    #[test]
    fn reverse_name_round_trips_v6() {
        let expected: Ipv6Addr = "2001:db8::1".parse().unwrap();
        let qname = "1.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.0.8.b.d.0.1.0.0.2.ip6.arpa.";
        assert_eq!(parse_reverse_name(qname), Some(IpAddr::V6(expected)));
    }

    #[test]
    fn reverse_zone_matches_arpa_suffixes() {
        assert!(is_reverse_zone("4.3.2.1.in-addr.arpa."));
        assert!(is_reverse_zone("0.0.8.b.d.0.1.0.0.2.ip6.arpa."));
        assert!(!is_reverse_zone("example.com."));
    }
}
