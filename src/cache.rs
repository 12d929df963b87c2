use std::collections::HashMap;
use std::fmt::Write as _;

use hickory_proto::op::{Message, Query};
use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::debug;

type Map = HashMap<Vec<u8>, CacheEntry, FxBuildHasher>;

/// Key for one cached response: lowercased wire-form name, query type,
/// one marker byte each for DNSSEC-OK and TCP, then a SHA-256 digest of that
/// prefix. The prefix stays in the key, so distinct questions can never
/// collide even if the digest were truncated.
pub fn fingerprint(question: &Query, dnssec: bool, tcp: bool) -> Vec<u8> {
    let mut key = Vec::with_capacity(96);
    let name = question.name().to_lowercase();
    for label in name.iter() {
        key.push(label.len() as u8);
        key.extend_from_slice(label);
    }
    key.push(0);
    key.extend_from_slice(&u16::from(question.query_type()).to_be_bytes());
    if dnssec {
        key.push(0xff);
    }
    if tcp {
        key.push(0xfe);
    }
    let digest = Sha256::digest(&key);
    key.extend_from_slice(&digest);
    key
}

#[derive(Debug, Clone)]
struct CacheEntry {
    msg: Message,
    fresh_expiration: OffsetDateTime,
    stale_expiration: OffsetDateTime,
    /// TTL used for `fresh_expiration`; 0 when it came from static configuration.
    ttl_seconds: u32,
    hits: u64,
    stale_hits: u64,
}

/// Bounded response cache with two-tier expiry: entries are served normally
/// until `fresh_expiration`, then only as a last-resort stale fallback until
/// `stale_expiration`. Eviction is randomized, discarding stale entries first.
///
/// A capacity of zero or less disables the cache; every operation is a no-op.
pub struct MessageCache {
    inner: RwLock<Map>,
    capacity: i64,
    ttl: Duration,
    stale_ttl: Duration,
    ttl_from_response: bool,
    ttl_min_seconds: u32,
    ttl_max_seconds: u32,
}

impl MessageCache {
    pub fn new(
        capacity: i64,
        ttl_secs: u32,
        stale_ttl_secs: u32,
        ttl_from_response: bool,
        ttl_max_secs: u32,
    ) -> Self {
        Self {
            inner: RwLock::new(Map::default()),
            capacity,
            ttl: Duration::seconds(i64::from(ttl_secs)),
            stale_ttl: Duration::seconds(i64::from(stale_ttl_secs)),
            ttl_from_response,
            ttl_min_seconds: ttl_secs,
            ttl_max_seconds: ttl_max_secs,
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[allow(dead_code)]
    pub fn remove(&self, key: &[u8]) {
        self.inner.write().remove(key);
    }

    /// Stores a defensive copy of `msg` under `key`.
    ///
    /// An existing entry that is still fresh is left untouched. An entry that
    /// is fresh-expired but within its stale window is renewed: new
    /// expirations, counters preserved. Eviction runs after every call.
    pub fn insert(&self, key: Vec<u8>, msg: &Message) {
        if self.capacity <= 0 {
            return;
        }
        let now = OffsetDateTime::now_utc();
        let mut map = self.inner.write();

        enum Disposition {
            Fresh,
            Renew,
            New,
        }
        let disposition = match map.get(&key) {
            Some(entry) if now < entry.fresh_expiration => Disposition::Fresh,
            Some(entry) if now < entry.stale_expiration => Disposition::Renew,
            Some(_) | None => Disposition::New,
        };

        match disposition {
            Disposition::Fresh => {}
            Disposition::Renew | Disposition::New => {
                let (fresh_expiration, ttl_seconds) = self.expiration_for(msg, now);
                let stale_expiration = (now + self.stale_ttl).max(fresh_expiration);
                let (hits, stale_hits) = match (&disposition, map.get(&key)) {
                    (Disposition::Renew, Some(entry)) => (entry.hits, entry.stale_hits),
                    _ => (0, 0),
                };
                debug!(
                    renew = matches!(disposition, Disposition::Renew),
                    ttl_seconds, "insert into cache"
                );
                map.insert(
                    key,
                    CacheEntry {
                        msg: msg.clone(),
                        fresh_expiration,
                        stale_expiration,
                        ttl_seconds,
                        hits,
                        stale_hits,
                    },
                );
            }
        }

        Self::evict(&mut map, self.capacity as usize);
    }

    fn expiration_for(&self, msg: &Message, now: OffsetDateTime) -> (OffsetDateTime, u32) {
        if !self.ttl_from_response {
            return (now + self.ttl, 0);
        }
        let secs = lowest_ttl(msg, self.ttl_min_seconds, self.ttl_max_seconds);
        (now + Duration::seconds(i64::from(secs)), secs)
    }

    /// Removes random victims until the map fits the capacity, considering
    /// entries past their stale expiration before anything else.
    fn evict(map: &mut Map, capacity: usize) {
        while map.len() > capacity {
            let now = OffsetDateTime::now_utc();
            let mut stale: Vec<Vec<u8>> = map
                .iter()
                .filter(|(_, entry)| now >= entry.stale_expiration)
                .map(|(key, _)| key.clone())
                .collect();
            let victim = if stale.is_empty() {
                map.keys().nth(fastrand::usize(..map.len())).cloned()
            } else {
                Some(stale.swap_remove(fastrand::usize(..stale.len())))
            };
            match victim {
                Some(key) => {
                    map.remove(&key);
                    debug!("evicted cache entry");
                }
                None => break,
            }
        }
    }

    /// Read-only lookup returning a defensive copy and both expirations.
    #[allow(dead_code)]
    pub fn search(&self, key: &[u8]) -> Option<(Message, OffsetDateTime, OffsetDateTime)> {
        if self.capacity <= 0 {
            return None;
        }
        let map = self.inner.read();
        map.get(key)
            .map(|entry| (entry.msg.clone(), entry.fresh_expiration, entry.stale_expiration))
    }

    /// The user-facing cache read.
    ///
    /// A fresh entry is always served. A fresh-expired entry is served only
    /// when `return_stale` is set, and an entry past its stale expiration is
    /// served one last time before being dropped. An expired entry that is
    /// not served is dropped unless `keep_stale` asks to retain it for a
    /// later stale fallback.
    pub fn hit(
        &self,
        question: &Query,
        dnssec: bool,
        tcp: bool,
        msg_id: u16,
        keep_stale: bool,
        return_stale: bool,
    ) -> Option<Message> {
        if self.capacity <= 0 {
            return None;
        }
        let key = fingerprint(question, dnssec, tcp);
        let now = OffsetDateTime::now_utc();
        let mut map = self.inner.write();
        let entry = map.get_mut(&key)?;
        let fresh = now < entry.fresh_expiration;
        let stale_expired = now >= entry.stale_expiration;

        if fresh || return_stale {
            let mut msg = entry.msg.clone();
            msg.set_id(msg_id);
            msg.set_truncated(false);
            if fresh {
                entry.hits += 1;
            } else {
                entry.stale_hits += 1;
            }
            if stale_expired {
                map.remove(&key);
            }
            return Some(msg);
        }

        if !keep_stale {
            map.remove(&key);
        }
        None
    }

    /// Human-readable snapshot of every entry.
    pub fn dump(&self) -> String {
        let now = OffsetDateTime::now_utc();
        let map = self.inner.read();
        let mut out = String::new();
        let _ = writeln!(out, "=== BEGIN CACHE DUMP ===");
        let _ = writeln!(out);
        let _ = writeln!(out, "Capacity: {}", self.capacity);
        let _ = writeln!(out, "Current Size: {}", map.len());
        let _ = writeln!(out, "Default TTL (s): {}", self.ttl.whole_seconds());
        let _ = writeln!(out, "Stale TTL (s): {}", self.stale_ttl.whole_seconds());
        let _ = writeln!(out, "Max TTL (s): {}", self.ttl_max_seconds);
        let _ = writeln!(out);
        let dumped_at = now.format(&Rfc3339).unwrap_or_else(|_| now.to_string());
        let _ = writeln!(out, "Dumped at: {dumped_at}");
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{:<7} {:<8} {:<13} {:<7} {:<10} {:<15} {:<40} {:<6} {}",
            "QType",
            "Expired",
            "StaleExpired",
            "TTL(s)",
            "Expire In",
            "StaleExpire In",
            "Question",
            "Hits",
            "StaleHits"
        );
        for entry in map.values() {
            let qtype = entry
                .msg
                .queries()
                .first()
                .map(|q| q.query_type().to_string())
                .unwrap_or_else(|| "0".to_string());
            let question = entry
                .msg
                .queries()
                .iter()
                .map(|q| q.name().to_string())
                .collect::<Vec<_>>()
                .join(",");
            let _ = writeln!(
                out,
                "{:<7} {:<8} {:<13} {:<7} {:<10} {:<15} {:<40} {:<6} {}",
                qtype,
                now >= entry.fresh_expiration,
                now >= entry.stale_expiration,
                entry.ttl_seconds,
                format!("{}s", (entry.fresh_expiration - now).whole_seconds()),
                format!("{}s", (entry.stale_expiration - now).whole_seconds()),
                question,
                entry.hits,
                entry.stale_hits,
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(out, "=== END CACHE DUMP ===");
        out
    }

    #[cfg(test)]
    fn entry_counters(&self, question: &Query, dnssec: bool, tcp: bool) -> Option<(u64, u64)> {
        let key = fingerprint(question, dnssec, tcp);
        let map = self.inner.read();
        map.get(&key).map(|entry| (entry.hits, entry.stale_hits))
    }
}

/// Lowest TTL over the answer section, clamped to `[min, max]`; an empty
/// answer counts as 0.
fn lowest_ttl(msg: &Message, min: u32, max: u32) -> u32 {
    let lowest = msg.answers().iter().map(|rr| rr.ttl()).min().unwrap_or(0);
    if lowest < min {
        min
    } else if lowest > max {
        max
    } else {
        lowest
    }
}
