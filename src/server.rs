use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, PTR};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use tracing::{debug, warn};

use crate::cache::{fingerprint, MessageCache};
use crate::config::Config;
use crate::forward::Forwarder;
use crate::hosts::Hosts;
use crate::proto::{build_reply, fqdn_lower, is_reverse_zone, parse_reverse_name};
use crate::stats::Stats;
use crate::upstream::Transport;

/// TTL on answers synthesized from the hosts table.
const HOSTS_TTL: u32 = 300;

/// Owns the full lifecycle of one query: cache read, local hosts answers,
/// forwarding with stale fallback, cache write-back.
#[derive(Clone)]
pub struct Handler {
    config: Arc<Config>,
    cache: Arc<MessageCache>,
    hosts: Hosts,
    forwarder: Forwarder,
    stats: Arc<Stats>,
}

impl Handler {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<MessageCache>,
        hosts: Hosts,
        forwarder: Forwarder,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            config,
            cache,
            hosts,
            forwarder,
            stats,
        }
    }

    /// Wire bytes in, wire bytes out. `None` drops the query (unparseable
    /// beyond even a FORMERR).
    pub async fn handle_packet(&self, packet: &[u8], transport: Transport) -> Option<Bytes> {
        let req = match Message::from_vec(packet) {
            Ok(msg) => msg,
            Err(err) => {
                debug!(error = %err, "malformed query");
                return formerr_for(packet);
            }
        };
        let resp = self.serve(&req, transport).await;
        match resp.to_vec() {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(err) => {
                warn!(id = req.id(), error = %err, "failed to encode response");
                None
            }
        }
    }

    async fn serve(&self, req: &Message, transport: Transport) -> Message {
        self.stats.request_count.inc();
        let Some(question) = req.queries().first().cloned() else {
            return build_reply(req, ResponseCode::FormErr);
        };
        let dnssec = req
            .extensions()
            .as_ref()
            .map(|edns| edns.dnssec_ok())
            .unwrap_or(false);
        if dnssec {
            self.stats.dnssec_ok_count.inc();
        }
        let tcp = transport == Transport::Tcp;

        if let Some(resp) = self
            .cache
            .hit(&question, dnssec, tcp, req.id(), true, false)
        {
            self.stats.cache_hit.inc();
            return resp;
        }
        self.stats.cache_miss.inc();
        if dnssec {
            self.stats.dnssec_cache_miss.inc();
        }

        // capture a possible stale fallback now; the entry stays alive until
        // the forwarder decides whether it is needed
        let stale = self
            .cache
            .hit(&question, dnssec, tcp, req.id(), true, true);

        let qname = fqdn_lower(question.name());
        if is_reverse_zone(&qname) {
            if let Some(resp) = self.serve_reverse(req, &qname) {
                return resp;
            }
        } else if let Some(resp) = self.serve_hosts(req, &question, &qname) {
            return resp;
        }

        let (resp, served_stale) = self.forwarder.serve_forward(req, transport, stale).await;

        let storable = if self.config.cache_non_negative {
            resp.response_code() == ResponseCode::NoError
        } else {
            true
        };
        if !served_stale && storable {
            let key = fingerprint(&question, dnssec, tcp);
            self.cache.insert(key, &resp);
        }
        resp
    }

    /// A/AAAA answers from the static hosts table.
    fn serve_hosts(&self, req: &Message, question: &Query, qname: &str) -> Option<Message> {
        let qtype = question.query_type();
        if qtype != RecordType::A && qtype != RecordType::AAAA {
            return None;
        }
        let table = self.hosts.current();
        let ips = table.lookup_ips(qname)?;
        let records: Vec<Record> = ips
            .iter()
            .filter_map(|ip| match (qtype, ip) {
                (RecordType::A, IpAddr::V4(v4)) => Some(Record::from_rdata(
                    question.name().clone(),
                    HOSTS_TTL,
                    RData::A(A(*v4)),
                )),
                (RecordType::AAAA, IpAddr::V6(v6)) => Some(Record::from_rdata(
                    question.name().clone(),
                    HOSTS_TTL,
                    RData::AAAA(AAAA(*v6)),
                )),
                _ => None,
            })
            .collect();
        if records.is_empty() {
            return None;
        }
        self.stats.lookup_count.inc();
        debug!(qname, "answering from hosts table");
        let mut resp = build_reply(req, ResponseCode::NoError);
        for record in records {
            resp.add_answer(record);
        }
        Some(resp)
    }

    /// PTR answers from the hosts table; `None` falls through to forwarding.
    fn serve_reverse(&self, req: &Message, qname: &str) -> Option<Message> {
        let addr = parse_reverse_name(qname)?;
        let table = self.hosts.current();
        let names = table.lookup_names(addr)?;
        let records: Vec<Record> = names
            .iter()
            .filter_map(|name| {
                let target = Name::from_ascii(name).ok()?;
                Some(Record::from_rdata(
                    req.queries().first()?.name().clone(),
                    HOSTS_TTL,
                    RData::PTR(PTR(target)),
                ))
            })
            .collect();
        if records.is_empty() {
            return None;
        }
        self.stats.lookup_count.inc();
        debug!(qname, "answering reverse query from hosts table");
        let mut resp = build_reply(req, ResponseCode::NoError);
        resp.set_authoritative(false);
        for record in records {
            resp.add_answer(record);
        }
        Some(resp)
    }
}

/// Minimal FORMERR reply when only the header id is recoverable.
fn formerr_for(packet: &[u8]) -> Option<Bytes> {
    if packet.len() < 2 {
        return None;
    }
    let id = u16::from_be_bytes([packet[0], packet[1]]);
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Response);
    msg.set_response_code(ResponseCode::FormErr);
    msg.to_vec().ok().map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::Exchanger;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::net::UdpSocket;

    fn test_config(nameservers: Vec<SocketAddr>) -> Config {
        Config {
            listen: "127.0.0.1:53".parse().unwrap(),
            nameservers,
            stub_zones: Vec::new(),
            search_domains: Vec::new(),
            enable_search: false,
            no_recursion: false,
            fwd_ndots: 0,
            ndots: 1,
            cache_capacity: 100,
            cache_ttl: 60,
            cache_stale_ttl: 300,
            cache_ttl_from_response: false,
            cache_ttl_max: 3600,
            cache_non_negative: false,
            read_timeout: Duration::from_millis(300),
        }
    }

    fn handler_for(config: Config, hosts: Hosts) -> (Handler, Arc<Stats>) {
        let config = Arc::new(config);
        let stats = Arc::new(Stats::new());
        let cache = Arc::new(MessageCache::new(
            config.cache_capacity,
            config.cache_ttl,
            config.cache_stale_ttl,
            config.cache_ttl_from_response,
            config.cache_ttl_max,
        ));
        let exchanger = Exchanger::new(config.read_timeout);
        let forwarder = Forwarder::new(Arc::clone(&config), exchanger, Arc::clone(&stats));
        (
            Handler::new(config, cache, hosts, forwarder, Arc::clone(&stats)),
            stats,
        )
    }

    fn query(zone: &str, qtype: RecordType) -> Message {
        let mut msg = Message::new();
        msg.set_id(0x2222);
        msg.set_recursion_desired(true);
        let mut q = Query::new();
        q.set_name(Name::from_str(zone).unwrap());
        q.set_query_type(qtype);
        msg.add_query(q);
        msg
    }

    async fn spawn_counting_upstream(
        addr_answer: Ipv4Addr,
        max_answers: usize,
    ) -> (SocketAddr, Arc<AtomicUsize>) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((len, peer)) = sock.recv_from(&mut buf).await {
                let n = seen.fetch_add(1, Ordering::SeqCst);
                if n >= max_answers {
                    continue; // swallow the query, let the client time out
                }
                if let Ok(req) = Message::from_vec(&buf[..len]) {
                    let mut resp = build_reply(&req, ResponseCode::NoError);
                    resp.add_answer(Record::from_rdata(
                        req.queries()[0].name().clone(),
                        30,
                        RData::A(A(addr_answer)),
                    ));
                    if let Ok(bytes) = resp.to_vec() {
                        let _ = sock.send_to(&bytes, peer).await;
                    }
                }
            }
        });
        (addr, calls)
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let (upstream, calls) = spawn_counting_upstream(Ipv4Addr::new(9, 9, 9, 9), 100).await;
        let (handler, stats) = handler_for(test_config(vec![upstream]), Hosts::empty());

        let req = query("cached.example.com.", RecordType::A).to_vec().unwrap();
        let first = handler.handle_packet(&req, Transport::Udp).await.unwrap();
        let second = handler.handle_packet(&req, Transport::Udp).await.unwrap();

        let first = Message::from_vec(&first).unwrap();
        let second = Message::from_vec(&second).unwrap();
        assert_eq!(first.answers(), second.answers());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(stats.cache_miss.count(), 1);
        assert_eq!(stats.cache_hit.count(), 1);
    }

    #[tokio::test]
    async fn stale_entry_served_when_upstreams_go_dark() {
        let (upstream, _) = spawn_counting_upstream(Ipv4Addr::new(1, 2, 3, 4), 1).await;
        let mut config = test_config(vec![upstream]);
        config.cache_ttl = 0; // entries expire immediately, stale window stays
        config.cache_stale_ttl = 60;
        let (handler, stats) = handler_for(config, Hosts::empty());

        let req = query("flaky.example.com.", RecordType::A).to_vec().unwrap();
        let first = handler.handle_packet(&req, Transport::Udp).await.unwrap();
        let second = handler.handle_packet(&req, Transport::Udp).await.unwrap();

        let first = Message::from_vec(&first).unwrap();
        let second = Message::from_vec(&second).unwrap();
        assert_eq!(first.answers(), second.answers());
        assert_eq!(stats.stale_cache_hit.count(), 1);
        assert_eq!(stats.request_fail.count(), 0);
    }

    #[tokio::test]
    async fn hosts_table_answers_locally() {
        let path = std::env::temp_dir().join(format!("dnsrelay-hosts-{}", std::process::id()));
        std::fs::write(&path, "10.5.6.7 static.example.com\n").unwrap();
        let hosts = Hosts::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let (handler, stats) = handler_for(test_config(vec![]), hosts);

        let req = query("static.example.com.", RecordType::A).to_vec().unwrap();
        let resp = handler.handle_packet(&req, Transport::Udp).await.unwrap();
        let resp = Message::from_vec(&resp).unwrap();

        assert_eq!(resp.response_code(), ResponseCode::NoError);
        match resp.answers()[0].data() {
            Some(RData::A(a)) => assert_eq!(a.0, Ipv4Addr::new(10, 5, 6, 7)),
            other => panic!("expected A record, got {other:?}"),
        }
        assert_eq!(stats.lookup_count.count(), 1);
    }

    #[tokio::test]
    async fn reverse_query_answers_from_hosts() {
        let path = std::env::temp_dir().join(format!("dnsrelay-ptr-{}", std::process::id()));
        std::fs::write(&path, "10.5.6.7 static.example.com\n").unwrap();
        let hosts = Hosts::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        let (handler, _) = handler_for(test_config(vec![]), hosts);

        let req = query("7.6.5.10.in-addr.arpa.", RecordType::PTR)
            .to_vec()
            .unwrap();
        let resp = handler.handle_packet(&req, Transport::Udp).await.unwrap();
        let resp = Message::from_vec(&resp).unwrap();

        assert_eq!(resp.response_code(), ResponseCode::NoError);
        match resp.answers()[0].data() {
            Some(RData::PTR(ptr)) => {
                assert_eq!(ptr.0, Name::from_str("static.example.com.").unwrap());
            }
            other => panic!("expected PTR record, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn reverse_query_without_local_entry_is_forwarded() {
        // no hosts entry and no upstreams: the forwarder refuses
        let (handler, _) = handler_for(test_config(vec![]), Hosts::empty());
        let req = query("1.0.0.127.in-addr.arpa.", RecordType::PTR)
            .to_vec()
            .unwrap();
        let resp = handler.handle_packet(&req, Transport::Udp).await.unwrap();
        let resp = Message::from_vec(&resp).unwrap();
        assert_eq!(resp.response_code(), ResponseCode::Refused);
    }

    #[tokio::test]
    async fn nxdomain_not_cached_with_non_negative() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let upstream = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            while let Ok((len, peer)) = sock.recv_from(&mut buf).await {
                if let Ok(req) = Message::from_vec(&buf[..len]) {
                    let resp = build_reply(&req, ResponseCode::NXDomain);
                    if let Ok(bytes) = resp.to_vec() {
                        let _ = sock.send_to(&bytes, peer).await;
                    }
                }
            }
        });

        let mut config = test_config(vec![upstream]);
        config.cache_non_negative = true;
        let (handler, stats) = handler_for(config, Hosts::empty());

        let req = query("gone.example.com.", RecordType::A).to_vec().unwrap();
        handler.handle_packet(&req, Transport::Udp).await.unwrap();
        handler.handle_packet(&req, Transport::Udp).await.unwrap();

        // both lookups reached upstream, nothing was cached
        assert_eq!(stats.cache_hit.count(), 0);
        assert_eq!(stats.cache_miss.count(), 2);
    }

    #[tokio::test]
    async fn malformed_packet_gets_formerr() {
        let (handler, _) = handler_for(test_config(vec![]), Hosts::empty());
        // header promises one question but the body is missing
        let mut packet = vec![0u8; 12];
        packet[0] = 0xab;
        packet[1] = 0xcd;
        packet[5] = 1;
        let resp = handler.handle_packet(&packet, Transport::Udp).await.unwrap();
        let resp = Message::from_vec(&resp).unwrap();
        assert_eq!(resp.id(), 0xabcd);
        assert_eq!(resp.response_code(), ResponseCode::FormErr);
    }

    #[tokio::test]
    async fn tiny_garbage_is_dropped() {
        let (handler, _) = handler_for(test_config(vec![]), Hosts::empty());
        assert!(handler.handle_packet(&[0xff], Transport::Udp).await.is_none());
    }
}
