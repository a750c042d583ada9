//! The response cache: records owned by this host and records learned from
//! the network, keyed by lowercase name.
//!
//! Own records carry the `-1` TTL sentinel and never expire; learned records
//! expire against their insertion timestamp. The expiry sweep is driven by
//! the engine on every wake cycle rather than by its own timer.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};

use crate::dns_parser::{encode_name, DnsRecord, RRType};
use std::collections::HashMap;

/// The duration a record superseded by a cache-flush answer stays alive,
/// per [RFC 6762 section 10.2](https://datatracker.ietf.org/doc/html/rfc6762#section-10.2).
const CACHE_FLUSH_GRACE_MILLIS: u64 = 1000;

/// How long a record withdrawn by a goodbye (TTL 0) answer is retained,
/// per [RFC 6762 section 10.1](https://datatracker.ietf.org/doc/html/rfc6762#section-10.1).
const GOODBYE_GRACE_MILLIS: u64 = 1000;

#[derive(Default)]
pub struct DnsCache {
    /// k: lowercase record name, v: records under that name.
    records: HashMap<String, Vec<DnsRecord>>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_count(&self) -> usize {
        self.records.values().map(|v| v.len()).sum()
    }

    /// Inserts or refreshes `incoming`. Returns true if the record was
    /// stored or refreshed.
    ///
    /// A goodbye record (TTL 0) is not stored; its match is retained for
    /// one more second, then evicted. A record matching an existing one
    /// (name, type and data) refreshes it in place. A cache-flush record
    /// additionally marks all other records of the same name and type to
    /// expire after a short grace period.
    pub fn upsert(&mut self, incoming: DnsRecord, now: u64) -> bool {
        if incoming.is_goodbye() {
            if let Some(entries) = self.records.get_mut(&incoming.name().to_lowercase()) {
                for existing in entries.iter_mut() {
                    if existing.matches(&incoming) && !existing.is_own() {
                        existing.set_expire_sooner(now + GOODBYE_GRACE_MILLIS);
                    }
                }
            }
            trace!("cache: goodbye for {}", incoming.name());
            return false;
        }

        let entries = self.records.entry(incoming.name().to_string()).or_default();

        if incoming.cache_flush() {
            for existing in entries.iter_mut() {
                if existing.rr_type() == incoming.rr_type() && !existing.matches(&incoming) {
                    existing.set_expire_sooner(now + CACHE_FLUSH_GRACE_MILLIS);
                }
            }
        }

        match entries.iter_mut().find(|r| r.matches(&incoming)) {
            Some(existing) => {
                // Own records keep their sentinel TTL.
                if !existing.is_own() {
                    existing.reset_ttl(&incoming);
                }
            }
            None => {
                trace!("cache: insert {}", &incoming);
                entries.insert(0, incoming);
            }
        }
        true
    }

    /// Removes all records under `name` of type `ty` (or every type if
    /// `ty` is ANY). Returns how many were removed.
    pub fn delete_by_name_type(&mut self, name: &str, ty: RRType) -> usize {
        let key = name.to_lowercase();
        let Some(entries) = self.records.get_mut(&key) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|r| ty != RRType::ANY && r.rr_type() != ty);
        let removed = before - entries.len();
        if entries.is_empty() {
            self.records.remove(&key);
        }
        removed
    }

    /// Removes this host's own records (TTL sentinel) under `name`.
    /// Learned records of the same name stay. Returns how many were
    /// removed.
    pub fn delete_own(&mut self, name: &str) -> usize {
        let key = name.to_lowercase();
        let Some(entries) = self.records.get_mut(&key) else {
            return 0;
        };
        let before = entries.len();
        entries.retain(|r| !r.is_own());
        let removed = before - entries.len();
        if entries.is_empty() {
            self.records.remove(&key);
        }
        if removed > 0 {
            debug!("cache: removed {} own record(s) of '{}'", removed, key);
        }
        removed
    }

    /// Removes records whose encoded name equals `name_bytes`. Used when a
    /// PTR is withdrawn: the cached records for its target are dropped by
    /// the target's wire-encoded name.
    pub fn delete_by_data_match(&mut self, name_bytes: &[u8]) -> usize {
        let mut removed = 0;
        self.records.retain(|name, entries| {
            let matched = encode_name(name)
                .map(|encoded| encoded == name_bytes)
                .unwrap_or(false);
            if matched {
                removed += entries.len();
                debug!("cache: delete_by_data_match removed '{}'", name);
            }
            !matched
        });
        removed
    }

    /// Returns records under `name` with type `ty`; ANY matches all types.
    pub fn lookup_exact(&self, name: &str, ty: RRType) -> Vec<&DnsRecord> {
        let key = name.to_lowercase();
        match self.records.get(&key) {
            Some(entries) => entries
                .iter()
                .filter(|r| ty == RRType::ANY || r.rr_type() == ty)
                .collect(),
            None => Vec::new(),
        }
    }

    /// Returns records whose encoded name contains `encoded` as a byte
    /// subsequence: the "does this answer belong to domain X" check.
    pub fn lookup_suffix(&self, encoded: &[u8]) -> Vec<&DnsRecord> {
        if encoded.is_empty() {
            return Vec::new();
        }
        // Drop the terminating zero so mid-name matches work too.
        let needle = match encoded.last() {
            Some(0) => &encoded[..encoded.len() - 1],
            _ => encoded,
        };
        if needle.is_empty() {
            return Vec::new();
        }

        self.records
            .iter()
            .filter(|(name, _)| {
                encode_name(name)
                    .map(|hay| hay.windows(needle.len()).any(|w| w == needle))
                    .unwrap_or(false)
            })
            .flat_map(|(_, entries)| entries.iter())
            .collect()
    }

    /// Evicts expired records. Own records (TTL sentinel) are never evicted.
    pub fn sweep_expired(&mut self, now: u64) -> usize {
        let mut evicted = 0;
        self.records.retain(|name, entries| {
            let before = entries.len();
            entries.retain(|r| !r.is_expired(now));
            let dropped = before - entries.len();
            if dropped > 0 {
                evicted += dropped;
                debug!("cache: evicted {} expired record(s) of '{}'", dropped, name);
            }
            !entries.is_empty()
        });
        evicted
    }

    /// Cached answers suitable for the known-answer section of an outgoing
    /// query: shared records whose TTL has not passed its half-life.
    pub fn known_answers(&self, name: &str, ty: RRType, now: u64) -> Vec<DnsRecord> {
        self.lookup_exact(name, ty)
            .into_iter()
            .filter(|r| !r.cache_flush() && !r.halflife_passed(now))
            .cloned()
            .collect()
    }

    /// A point-in-time copy of every cached record, for status reporting.
    pub fn dump(&self) -> Vec<DnsRecord> {
        self.records.values().flatten().cloned().collect()
    }

}
