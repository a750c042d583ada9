//! Query and response handling for a running identity.
//!
//! Pure logic: the engine decodes a packet, hands it here together with the
//! records it currently owns, and gets back a response plan (what to answer
//! and after how much random delay). Sending and timing live in the engine
//! and the send scheduler.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};

use crate::dns_parser::{
    names_equal, DnsIncoming, DnsOutgoing, DnsRecord, RData, RRType, FLAGS_AA, FLAGS_QR_RESPONSE,
};
use std::{
    fmt,
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

/// Both variants share the standard mDNS port.
pub const MDNS_PORT: u16 = 5353;

const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const XMDNS_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 239);

/// The protocol variant a packet or identity belongs to. Each variant has
/// its own multicast group and top-level domain; which group a packet was
/// sent to decides its variant.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ServiceVariant {
    /// Standard mDNS: `224.0.0.251`, domain `local`.
    Mdns,
    /// Extended mDNS for larger site networks: `239.255.255.239`, domain `site`.
    Xmdns,
}

impl ServiceVariant {
    pub const fn group(&self) -> Ipv4Addr {
        match self {
            ServiceVariant::Mdns => MDNS_GROUP,
            ServiceVariant::Xmdns => XMDNS_GROUP,
        }
    }

    pub fn group_sockaddr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group(), MDNS_PORT))
    }

    /// The top-level domain of names in this variant, without dots.
    pub const fn domain(&self) -> &'static str {
        match self {
            ServiceVariant::Mdns => "local",
            ServiceVariant::Xmdns => "site",
        }
    }

    pub fn from_group(addr: Ipv4Addr) -> Option<Self> {
        if addr == MDNS_GROUP {
            Some(ServiceVariant::Mdns)
        } else if addr == XMDNS_GROUP {
            Some(ServiceVariant::Xmdns)
        } else {
            None
        }
    }

    /// Whether `name` belongs to this variant's domain.
    pub fn owns_name(&self, name: &str) -> bool {
        let trimmed = name.strip_suffix('.').unwrap_or(name);
        let tld = match trimmed.rfind('.') {
            Some(idx) => &trimmed[idx + 1..],
            None => trimmed,
        };
        tld.eq_ignore_ascii_case(self.domain())
    }
}

impl fmt::Display for ServiceVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceVariant::Mdns => write!(f, "mDNS"),
            ServiceVariant::Xmdns => write!(f, "xmDNS"),
        }
    }
}

/// The DNS-SD meta-query name for enumerating service types.
pub fn meta_query_name(variant: ServiceVariant) -> String {
    format!("_services._dns-sd._udp.{}.", variant.domain())
}

/// A planned response: what to send, how long to wait first, and whether
/// the querier asked for a unicast reply.
#[derive(Debug)]
pub struct AnswerPlan {
    pub out: DnsOutgoing,
    pub delay_ms: u64,
    pub unicast: bool,
}

/// Random delay window for responses containing shared records, per
/// [RFC 6762 section 6](https://datatracker.ietf.org/doc/html/rfc6762#section-6).
const SHARED_DELAY_MIN_MS: u64 = 20;
const SHARED_DELAY_MAX_MS: u64 = 120;

/// Extra wait when the query had the TC flag set: more known-answer
/// packets are on their way.
const TRUNCATED_EXTRA_MIN_MS: u64 = 400;
const TRUNCATED_EXTRA_MAX_MS: u64 = 500;

/// Matches a query against the records this host owns and plans a response.
///
/// `own_records` are the active identity's records (host A, reverse PTR and
/// any registered DNS-SD records). `service_types` are the registered
/// service type names, answered to the DNS-SD meta-query. Known-answer
/// suppression drops any answer the querier already holds at half TTL or
/// better. Returns None if nothing is left to say.
pub fn handle_query(
    msg: &DnsIncoming,
    own_records: &[DnsRecord],
    service_types: &[String],
    variant: ServiceVariant,
) -> Option<AnswerPlan> {
    let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
    let mut has_shared = false;
    let mut all_unicast = !msg.questions().is_empty();
    let meta_name = meta_query_name(variant);

    for question in msg.questions() {
        if !question.wants_unicast() {
            all_unicast = false;
        }

        // Service type enumeration.
        if names_equal(question.name(), &meta_name)
            && matches!(question.ty(), RRType::PTR | RRType::ANY)
        {
            for ty_domain in service_types {
                let ptr = DnsRecord::own_shared(&meta_name, RData::Ptr(ty_domain.clone()));
                if !ptr.suppressed_by(msg) {
                    out.add_answer(ptr);
                    has_shared = true;
                }
            }
            continue;
        }

        for record in own_records {
            if !names_equal(record.name(), question.name()) {
                continue;
            }
            if question.ty() != RRType::ANY && record.rr_type() != question.ty() {
                continue;
            }
            if record.suppressed_by(msg) {
                trace!("query: '{}' suppressed by known answer", record.name());
                continue;
            }
            if !record.cache_flush() {
                has_shared = true;
            }
            out.add_answer(record.clone());
        }
    }

    if out.answers_count() == 0 {
        return None;
    }

    add_additionals(&mut out, own_records);

    let mut delay_ms = if has_shared {
        fastrand::u64(SHARED_DELAY_MIN_MS..=SHARED_DELAY_MAX_MS)
    } else {
        0
    };
    if msg.is_truncated() {
        delay_ms += fastrand::u64(TRUNCATED_EXTRA_MIN_MS..=TRUNCATED_EXTRA_MAX_MS);
    }

    Some(AnswerPlan {
        out,
        delay_ms,
        unicast: all_unicast,
    })
}

/// Fills the additional section per
/// [RFC 6763 section 12](https://datatracker.ietf.org/doc/html/rfc6763#section-12):
/// SRV and TXT for each answered PTR target, address records for each
/// answered SRV host.
fn add_additionals(out: &mut DnsOutgoing, own_records: &[DnsRecord]) {
    let mut wanted_names: Vec<String> = Vec::new();
    let mut wanted_hosts: Vec<String> = Vec::new();

    // Names referenced by answered PTRs, and hosts referenced by SRVs.
    for record in own_records {
        match record.rdata() {
            RData::Ptr(target) => {
                if out_has_answer_for(out, record) {
                    wanted_names.push(target.clone());
                }
            }
            RData::Srv { host, .. } => {
                if out_has_answer_for(out, record) {
                    wanted_hosts.push(host.clone());
                }
            }
            _ => {}
        }
    }

    for name in &wanted_names {
        for record in own_records {
            if !names_equal(record.name(), name) {
                continue;
            }
            match record.rdata() {
                RData::Srv { host, .. } => {
                    wanted_hosts.push(host.clone());
                    out.add_additional(record.clone());
                }
                RData::Txt(_) => out.add_additional(record.clone()),
                _ => {}
            }
        }
    }

    for host in &wanted_hosts {
        for record in own_records {
            if names_equal(record.name(), host) && matches!(record.rdata(), RData::A(_)) {
                out.add_additional(record.clone());
            }
        }
    }
}

fn out_has_answer_for(out: &DnsOutgoing, record: &DnsRecord) -> bool {
    out.answers_iter().any(|a| a.matches(record))
}

/// Looks for a steady-state conflict: a response in which another host
/// answers for one of our unique names with different data. Returns the
/// conflicted own record name.
pub fn find_conflict(msg: &DnsIncoming, own_records: &[DnsRecord]) -> Option<String> {
    if !msg.is_response() {
        return None;
    }
    for theirs in msg.answers().iter().chain(msg.additionals().iter()) {
        for ours in own_records {
            // Shared (PTR) records coexist by design.
            if !ours.cache_flush() {
                continue;
            }
            if ours.conflicts_with(theirs) {
                debug!(
                    "conflict: '{}' also answered by another host with {}",
                    ours.name(),
                    theirs.rdata()
                );
                return Some(ours.name().to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::{find_conflict, handle_query, meta_query_name, ServiceVariant};
    use crate::dns_parser::{
        DnsIncoming, DnsOutgoing, DnsRecord, RData, RRType, CLASS_IN, FLAGS_AA, FLAGS_QR_QUERY,
        FLAGS_QR_RESPONSE, FLAGS_TC,
    };
    use std::net::Ipv4Addr;

    fn own_set() -> Vec<DnsRecord> {
        vec![
            DnsRecord::own("myhost.local.", RData::A(Ipv4Addr::new(10, 0, 0, 5))),
            DnsRecord::own_shared(
                "_http._tcp.local.",
                RData::Ptr("web._http._tcp.local.".to_string()),
            ),
            DnsRecord::own(
                "web._http._tcp.local.",
                RData::Srv {
                    priority: 0,
                    weight: 0,
                    port: 80,
                    host: "myhost.local.".to_string(),
                },
            ),
            DnsRecord::own("web._http._tcp.local.", RData::Txt(b"\x00".to_vec())),
        ]
    }

    fn decode(out: DnsOutgoing) -> DnsIncoming {
        let wire = out.to_data_on_wire().into_iter().next().unwrap();
        DnsIncoming::new(wire).unwrap()
    }

    #[test]
    fn test_answer_a_question_no_delay() {
        let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
        query.add_question("myhost.local.", RRType::A);
        let msg = decode(query);

        let plan = handle_query(&msg, &own_set(), &[], ServiceVariant::Mdns).unwrap();
        assert_eq!(plan.out.answers_count(), 1);
        // Unique records are answered without delay.
        assert_eq!(plan.delay_ms, 0);
        assert!(!plan.unicast);
    }

    #[test]
    fn test_ptr_answer_brings_additionals_and_delay() {
        let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
        query.add_question("_http._tcp.local.", RRType::PTR);
        let msg = decode(query);

        let plan = handle_query(&msg, &own_set(), &[], ServiceVariant::Mdns).unwrap();
        assert_eq!(plan.out.answers_count(), 1);
        // SRV + TXT for the instance, A for the host.
        assert_eq!(plan.out.additionals().len(), 3);
        assert!((20..=120).contains(&plan.delay_ms));
    }

    #[test]
    fn test_truncated_query_waits_longer() {
        let mut query = DnsOutgoing::new(FLAGS_QR_QUERY | FLAGS_TC);
        query.add_question("_http._tcp.local.", RRType::PTR);
        let msg = decode(query);

        let plan = handle_query(&msg, &own_set(), &[], ServiceVariant::Mdns).unwrap();
        assert!(plan.delay_ms >= 420);
        assert!(plan.delay_ms <= 620);
    }

    #[test]
    fn test_known_answer_suppression() {
        let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
        query.add_question("_http._tcp.local.", RRType::PTR);
        // The querier already knows our PTR with more than half TTL left.
        query.add_known_answer(
            DnsRecord::new(
                "_http._tcp.local.",
                CLASS_IN,
                4000,
                RData::Ptr("web._http._tcp.local.".to_string()),
            ),
            0,
        );
        let msg = decode(query);

        assert!(handle_query(&msg, &own_set(), &[], ServiceVariant::Mdns).is_none());
    }

    #[test]
    fn test_meta_query_lists_service_types() {
        let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
        query.add_question(&meta_query_name(ServiceVariant::Mdns), RRType::PTR);
        let msg = decode(query);

        let types = vec!["_http._tcp.local.".to_string()];
        let plan = handle_query(&msg, &own_set(), &types, ServiceVariant::Mdns).unwrap();
        assert_eq!(plan.out.answers_count(), 1);
    }

    #[test]
    fn test_unicast_bit_honored() {
        let mut query = DnsOutgoing::new(FLAGS_QR_QUERY);
        query.add_question_unicast("myhost.local.", RRType::A);
        let msg = decode(query);

        let plan = handle_query(&msg, &own_set(), &[], ServiceVariant::Mdns).unwrap();
        assert!(plan.unicast);
    }

    #[test]
    fn test_find_conflict_on_unique_record() {
        let mut response = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        response.add_answer(DnsRecord::new(
            "myhost.local.",
            CLASS_IN,
            120,
            RData::A(Ipv4Addr::new(10, 0, 0, 200)),
        ));
        let msg = decode(response);

        let conflicted = find_conflict(&msg, &own_set());
        assert_eq!(conflicted.as_deref(), Some("myhost.local."));
    }

    #[test]
    fn test_shared_ptr_is_not_a_conflict() {
        // Another host advertising a different instance under the same
        // service type is normal.
        let mut response = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        response.add_answer(DnsRecord::new(
            "_http._tcp.local.",
            CLASS_IN,
            4500,
            RData::Ptr("other._http._tcp.local.".to_string()),
        ));
        let msg = decode(response);

        assert!(find_conflict(&msg, &own_set()).is_none());
    }

    #[test]
    fn test_variant_classification() {
        assert_eq!(
            ServiceVariant::from_group(Ipv4Addr::new(224, 0, 0, 251)),
            Some(ServiceVariant::Mdns)
        );
        assert_eq!(
            ServiceVariant::from_group(Ipv4Addr::new(239, 255, 255, 239)),
            Some(ServiceVariant::Xmdns)
        );
        assert_eq!(ServiceVariant::from_group(Ipv4Addr::new(224, 0, 0, 1)), None);

        assert!(ServiceVariant::Mdns.owns_name("a.b.local."));
        assert!(ServiceVariant::Xmdns.owns_name("a.site"));
        assert!(!ServiceVariant::Xmdns.owns_name("a.local."));
    }
}
