//! DNS wire format support for the discovery engine.
//!
//! [DnsIncoming] is the logic representation of an incoming DNS packet,
//! decoded with a forward-only cursor. [DnsOutgoing] is the logic
//! representation of an outgoing DNS message of one or more packets.
//! [DnsOutPacket] is the encoded one packet for [DnsOutgoing].
//!
//! Record data is the [RData] enum: every record owns its payload fully
//! decoded, so nothing in the engine ever keeps an offset into a receive
//! buffer. `RData::to_bytes` re-encodes the payload without compression,
//! which is the canonical form used for cache identity and for probe
//! tie-breaking.

#[cfg(feature = "logging")]
use crate::log::trace;
use crate::{Error, Result};

use std::{
    cmp,
    collections::HashMap,
    convert::TryInto,
    fmt,
    net::{Ipv4Addr, Ipv6Addr},
    str,
    time::SystemTime,
};

/// DNS resource record types, stored as `u16`. Can do `as u16` when needed.
///
/// See [RFC 1035 section 3.2.2](https://datatracker.ietf.org/doc/html/rfc1035#section-3.2.2)
#[derive(Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash)]
#[non_exhaustive]
#[repr(u16)]
pub enum RRType {
    /// DNS record type for IPv4 address
    A = 1,
    /// DNS record type for Pointer
    PTR = 12,
    /// DNS record type for Host Info
    HINFO = 13,
    /// DNS record type for Text
    TXT = 16,
    /// DNS record type for IPv6 address
    AAAA = 28,
    /// DNS record type for Service
    SRV = 33,
    /// DNS record type for Next Secure
    NSEC = 47,
    /// DNS record type for Any (only valid in questions)
    ANY = 255,
}

impl RRType {
    /// Converts `u16` into `RRType` if possible.
    pub const fn from_u16(value: u16) -> Option<RRType> {
        match value {
            1 => Some(RRType::A),
            12 => Some(RRType::PTR),
            13 => Some(RRType::HINFO),
            16 => Some(RRType::TXT),
            28 => Some(RRType::AAAA),
            33 => Some(RRType::SRV),
            47 => Some(RRType::NSEC),
            255 => Some(RRType::ANY),
            _ => None,
        }
    }
}

impl fmt::Display for RRType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RRType::A => write!(f, "TYPE_A"),
            RRType::PTR => write!(f, "TYPE_PTR"),
            RRType::HINFO => write!(f, "TYPE_HINFO"),
            RRType::TXT => write!(f, "TYPE_TXT"),
            RRType::AAAA => write!(f, "TYPE_AAAA"),
            RRType::SRV => write!(f, "TYPE_SRV"),
            RRType::NSEC => write!(f, "TYPE_NSEC"),
            RRType::ANY => write!(f, "TYPE_ANY"),
        }
    }
}

/// The class of a DNS record: the Internet.
pub const CLASS_IN: u16 = 1;
/// Masks off the cache-flush / unicast-response bit.
pub const CLASS_MASK: u16 = 0x7FFF;

/// The top bit of the class field. In a resource record it is the
/// "cache flush" bit; in a question it requests a unicast response.
/// See [RFC 6762 section 10.2](https://datatracker.ietf.org/doc/html/rfc6762#section-10.2)
pub const CLASS_CACHE_FLUSH: u16 = 0x8000;

/// Max size of UDP datagram payload: 9000 bytes - IP header 20 bytes - UDP header 8 bytes.
/// Reference: RFC6762: https://datatracker.ietf.org/doc/html/rfc6762#section-17
pub const MAX_MSG_ABSOLUTE: usize = 8972;

/// The fixed header of every DNS message: id, flags and four counts.
const MSG_HEADER_LEN: usize = 12;

/// Max encoded length of a domain name, including label length bytes and
/// the terminating zero.
pub const MAX_DOMAIN_NAME_LEN: usize = 128;

/// Max length of a single label inside a domain name.
pub const MAX_LABEL_LEN: usize = 63;

// Definitions for DNS message header "flags" field
//
// The "flags" field format:
//
//   0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
// |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
// +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+

/// mask for query/response bit
pub const FLAGS_QR_MASK: u16 = 0x8000;
/// the flag for Query
pub const FLAGS_QR_QUERY: u16 = 0x0000;
/// the flag for Response
pub const FLAGS_QR_RESPONSE: u16 = 0x8000;
/// mask for Authoritative answer
pub const FLAGS_AA: u16 = 0x0400;
/// mask for Truncated
pub const FLAGS_TC: u16 = 0x0200;

/// TTL sentinel for records owned by this host. They never expire from the
/// cache; their wire TTL comes from [DnsRecord::wire_ttl].
pub const TTL_NEVER_EXPIRE: i64 = -1;

/// Default TTL for host records (A / reverse PTR), in seconds.
pub const HOST_TTL: u32 = 120;
/// Default TTL for service records (PTR / SRV / TXT / NSEC), in seconds.
pub const OTHER_TTL: u32 = 4500;

const U16_SIZE: usize = 2;

/// Encodes a dotted domain name into uncompressed wire bytes:
/// length-prefixed labels followed by a zero byte.
///
/// The name is in presentation form: a `.` inside a label is escaped as
/// `\.` and a literal backslash as `\\` (the form [DnsIncoming] decodes
/// names into).
///
/// Enforces the engine's name limits: every label at most
/// [MAX_LABEL_LEN] bytes, the whole encoding at most [MAX_DOMAIN_NAME_LEN].
pub fn encode_name(name: &str) -> Result<Vec<u8>> {
    let trimmed = strip_name_dot(name);
    let mut out = Vec::with_capacity(trimmed.len() + 2);

    for label in split_labels(trimmed) {
        let raw = unescape_label(label)?;
        if raw.is_empty() {
            return Err(Error::Msg(format!("empty label in name '{}'", name)));
        }
        if raw.len() > MAX_LABEL_LEN {
            return Err(Error::Msg(format!(
                "label '{}' exceeds {} bytes",
                label, MAX_LABEL_LEN
            )));
        }
        out.push(raw.len() as u8);
        out.extend_from_slice(&raw);
    }
    out.push(0);

    if out.len() > MAX_DOMAIN_NAME_LEN {
        return Err(Error::Msg(format!(
            "encoded name '{}' exceeds {} bytes",
            name, MAX_DOMAIN_NAME_LEN
        )));
    }
    Ok(out)
}

/// Strips the trailing label separator, leaving an escaped final dot alone.
fn strip_name_dot(name: &str) -> &str {
    let Some(body) = name.strip_suffix('.') else {
        return name;
    };
    let escapes = body.bytes().rev().take_while(|b| *b == b'\\').count();
    if escapes % 2 == 0 {
        body
    } else {
        name
    }
}

/// Splits a presentation-form name at unescaped dots.
fn split_labels(name: &str) -> Vec<&str> {
    let bytes = name.as_bytes();
    let mut labels = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'.' => {
                labels.push(&name[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    labels.push(&name[start.min(name.len())..]);
    labels
}

/// Byte index of the first unescaped dot in `s`, or its length.
fn label_end(s: &str) -> usize {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'.' => return i,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Resolves the `\.` and `\\` escapes of one label back to raw bytes.
fn unescape_label(label: &str) -> Result<Vec<u8>> {
    let bytes = label.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' {
            i += 1;
            if i >= bytes.len() {
                return Err(Error::Msg(format!("dangling escape in label '{}'", label)));
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    Ok(out)
}

/// Escapes one raw label for inclusion in a dotted name.
fn push_escaped_label(out: &mut String, raw: &str) {
    for ch in raw.chars() {
        if ch == '.' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
}

/// Compares two domain names ignoring ASCII case and any trailing dot.
pub fn names_equal(a: &str, b: &str) -> bool {
    let a = a.strip_suffix('.').unwrap_or(a);
    let b = b.strip_suffix('.').unwrap_or(b);
    a.eq_ignore_ascii_case(b)
}

/// Builds the NSEC "Type Bit Map" (window block 0) covering `types`.
pub fn nsec_type_bitmap(types: &[RRType]) -> Vec<u8> {
    let max_byte = types
        .iter()
        .map(|ty| (*ty as u16 as usize) / 8)
        .max()
        .unwrap_or(0);
    let mut bitmap = vec![0u8; max_byte + 1];
    for ty in types {
        let t = *ty as u16 as usize;
        bitmap[t / 8] |= 0x80 >> (t % 8);
    }
    bitmap
}

/// A question in the question section of a DNS message.
#[derive(Clone, Debug)]
pub struct DnsQuestion {
    name: String,
    ty: RRType,
    class: u16,
}

impl DnsQuestion {
    pub fn new(name: &str, ty: RRType, class: u16) -> Self {
        Self {
            name: name.to_lowercase(),
            ty,
            class,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn ty(&self) -> RRType {
        self.ty
    }

    /// Whether the top class bit requests a unicast response (the "QU" bit).
    pub const fn wants_unicast(&self) -> bool {
        (self.class & CLASS_CACHE_FLUSH) != 0
    }
}

/// Fully decoded record data.
///
/// Name-bearing payloads (PTR target, SRV host, NSEC next name) are stored
/// as decoded strings. Their canonical wire form, produced by
/// [RData::to_bytes], is always uncompressed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Ptr(String),
    Txt(Vec<u8>),
    Srv {
        priority: u16,
        weight: u16,
        port: u16,
        host: String,
    },
    Hinfo {
        cpu: String,
        os: String,
    },
    Nsec {
        next_name: String,
        type_bitmap: Vec<u8>,
    },
}

impl RData {
    pub const fn rr_type(&self) -> RRType {
        match self {
            RData::A(_) => RRType::A,
            RData::Aaaa(_) => RRType::AAAA,
            RData::Ptr(_) => RRType::PTR,
            RData::Txt(_) => RRType::TXT,
            RData::Srv { .. } => RRType::SRV,
            RData::Hinfo { .. } => RRType::HINFO,
            RData::Nsec { .. } => RRType::NSEC,
        }
    }

    /// The canonical (uncompressed) wire encoding of this payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            RData::A(addr) => out.extend_from_slice(&addr.octets()),
            RData::Aaaa(addr) => out.extend_from_slice(&addr.octets()),
            RData::Ptr(target) => out.extend_from_slice(&name_bytes_lossy(target)),
            RData::Txt(bytes) => out.extend_from_slice(bytes),
            RData::Srv {
                priority,
                weight,
                port,
                host,
            } => {
                out.extend_from_slice(&priority.to_be_bytes());
                out.extend_from_slice(&weight.to_be_bytes());
                out.extend_from_slice(&port.to_be_bytes());
                out.extend_from_slice(&name_bytes_lossy(host));
            }
            RData::Hinfo { cpu, os } => {
                out.push(cpu.len() as u8);
                out.extend_from_slice(cpu.as_bytes());
                out.push(os.len() as u8);
                out.extend_from_slice(os.as_bytes());
            }
            RData::Nsec {
                next_name,
                type_bitmap,
            } => {
                out.extend_from_slice(&name_bytes_lossy(next_name));
                out.push(0); // window block 0
                out.push(type_bitmap.len() as u8);
                out.extend_from_slice(type_bitmap);
            }
        }
        out
    }
}

impl fmt::Display for RData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RData::A(addr) => write!(f, "{}", addr),
            RData::Aaaa(addr) => write!(f, "{}", addr),
            RData::Ptr(target) => write!(f, "{}", target),
            RData::Txt(bytes) => write!(f, "len {}", bytes.len()),
            RData::Srv { port, host, .. } => write!(f, "{}:{}", host, port),
            RData::Hinfo { cpu, os } => write!(f, "{} {}", cpu, os),
            RData::Nsec { next_name, .. } => write!(f, "{}", next_name),
        }
    }
}

/// Canonical wire bytes of an embedded name. Names inside RData were
/// validated when the record was built or decoded, so [encode_name] only
/// fails here on a length limit; the fallback re-encodes label by label,
/// truncating oversized ones, so the bytes still identify the record.
fn name_bytes_lossy(name: &str) -> Vec<u8> {
    match encode_name(name) {
        Ok(bytes) => bytes,
        Err(_) => {
            let mut out = Vec::with_capacity(name.len() + 2);
            for label in split_labels(strip_name_dot(name)) {
                let raw =
                    unescape_label(label).unwrap_or_else(|_| label.as_bytes().to_vec());
                let len = raw.len().min(MAX_LABEL_LEN);
                out.push(len as u8);
                out.extend_from_slice(&raw[..len]);
            }
            out.push(0);
            out
        }
    }
}

/// A DNS resource record with its cache bookkeeping.
#[derive(Clone, Debug)]
pub struct DnsRecord {
    /// Lowercase owned name.
    name: String,
    class: u16,
    cache_flush: bool,
    /// TTL in seconds. `-1` marks an own record that never expires;
    /// `0` is a goodbye.
    ttl: i64,
    /// UNIX time in millis when this record was created or last refreshed.
    created: u64,
    /// Absolute expiry override in UNIX millis, set when a goodbye or a
    /// cache-flush answer cuts this record's life short.
    expire_override: Option<u64>,
    rdata: RData,
}

impl DnsRecord {
    pub fn new(name: &str, class: u16, ttl: i64, rdata: RData) -> Self {
        Self {
            name: name.to_lowercase(),
            class,
            cache_flush: false,
            ttl,
            created: current_time_millis(),
            expire_override: None,
            rdata,
        }
    }

    /// An own record: never expires, announced with the cache-flush bit.
    pub fn own(name: &str, rdata: RData) -> Self {
        let mut record = Self::new(name, CLASS_IN, TTL_NEVER_EXPIRE, rdata);
        record.cache_flush = true;
        record
    }

    /// A shared own record (PTR): never expires, no cache-flush bit.
    pub fn own_shared(name: &str, rdata: RData) -> Self {
        Self::new(name, CLASS_IN, TTL_NEVER_EXPIRE, rdata)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn rr_type(&self) -> RRType {
        self.rdata.rr_type()
    }

    pub const fn class(&self) -> u16 {
        self.class
    }

    pub const fn cache_flush(&self) -> bool {
        self.cache_flush
    }

    pub fn set_cache_flush(&mut self, on: bool) {
        self.cache_flush = on;
    }

    pub const fn ttl(&self) -> i64 {
        self.ttl
    }

    pub const fn created(&self) -> u64 {
        self.created
    }

    pub const fn rdata(&self) -> &RData {
        &self.rdata
    }

    pub const fn is_own(&self) -> bool {
        self.ttl < 0
    }

    pub const fn is_goodbye(&self) -> bool {
        self.ttl == 0
    }

    /// The TTL to put on the wire when announcing this record.
    pub fn wire_ttl(&self) -> u32 {
        if self.ttl >= 0 {
            return self.ttl as u32;
        }
        match self.rr_type() {
            RRType::A | RRType::AAAA | RRType::HINFO => HOST_TTL,
            _ => OTHER_TTL,
        }
    }

    /// Remaining TTL in seconds as seen by a cache reader at `now`.
    pub fn remaining_ttl(&self, now: u64) -> u32 {
        if self.ttl < 0 {
            return self.wire_ttl();
        }
        let expire = self.created + (self.ttl as u64) * 1000;
        (expire.saturating_sub(now) / 1000) as u32
    }

    pub fn is_expired(&self, now: u64) -> bool {
        if self.ttl < 0 {
            return false;
        }
        if let Some(at) = self.expire_override {
            if now >= at {
                return true;
            }
        }
        now >= self.created + (self.ttl as u64) * 1000
    }

    /// True once more than half of the TTL has elapsed.
    pub fn halflife_passed(&self, now: u64) -> bool {
        if self.ttl < 0 {
            return false;
        }
        now > self.created + (self.ttl as u64) * 500
    }

    /// Refreshes bookkeeping from a newly received copy of this record.
    pub fn reset_ttl(&mut self, other: &DnsRecord) {
        self.ttl = other.ttl;
        self.created = other.created;
        self.expire_override = None;
    }

    /// Forces expiry at `expire_at` if that is sooner than the current one.
    /// The override is an absolute deadline in millis; the TTL itself is
    /// left alone so no precision is lost to second rounding.
    pub fn set_expire_sooner(&mut self, expire_at: u64) {
        if self.ttl < 0 {
            return;
        }
        let natural = self.created + (self.ttl as u64) * 1000;
        let current = self.expire_override.map_or(natural, |at| at.min(natural));
        if expire_at < current {
            self.expire_override = Some(expire_at);
        }
    }

    /// Applies a name change from `old` to `new`: the owned name itself and
    /// any reference to `old` inside the payload (PTR target, SRV host,
    /// NSEC next name) are updated.
    pub fn rename(&mut self, old: &str, new: &str) {
        if names_equal(&self.name, old) {
            self.name = new.to_lowercase();
        }
        match &mut self.rdata {
            RData::Ptr(target) => {
                if names_equal(target, old) {
                    *target = new.to_string();
                }
            }
            RData::Srv { host, .. } => {
                if names_equal(host, old) {
                    *host = new.to_string();
                }
            }
            RData::Nsec { next_name, .. } => {
                if names_equal(next_name, old) {
                    *next_name = new.to_string();
                }
            }
            _ => {}
        }
    }

    /// Whether `other` refers to the same record: same name, type and data.
    pub fn matches(&self, other: &DnsRecord) -> bool {
        names_equal(&self.name, &other.name)
            && self.rr_type() == other.rr_type()
            && self.rdata == other.rdata
    }

    /// Same name and type but different data: the definition of a conflict
    /// with a record someone else answered for.
    pub fn conflicts_with(&self, other: &DnsRecord) -> bool {
        names_equal(&self.name, &other.name)
            && self.rr_type() == other.rr_type()
            && (other.class & CLASS_MASK) == (self.class & CLASS_MASK)
            && self.rdata != other.rdata
    }

    /// Lexicographic comparison of the canonical rdata over the first
    /// `min(len)` bytes; a longer rdata wins when one is a prefix of the
    /// other. Used by simultaneous-probe tie-breaking.
    pub fn compare_rdata(&self, other: &DnsRecord) -> cmp::Ordering {
        let ours = self.rdata.to_bytes();
        let theirs = other.rdata.to_bytes();
        let common = ours.len().min(theirs.len());
        match ours[..common].cmp(&theirs[..common]) {
            cmp::Ordering::Equal => ours.len().cmp(&theirs.len()),
            ordering => ordering,
        }
    }

    /// Full record comparison for tie-breaking, per
    /// [RFC 6762 section 8.2](https://datatracker.ietf.org/doc/html/rfc6762#section-8.2):
    /// class first, then type, then rdata.
    pub fn compare(&self, other: &DnsRecord) -> cmp::Ordering {
        (self.class & CLASS_MASK)
            .cmp(&(other.class & CLASS_MASK))
            .then((self.rr_type() as u16).cmp(&(other.rr_type() as u16)))
            .then_with(|| self.compare_rdata(other))
    }

    /// Known-answer suppression: an answer in a query suppresses ours if it
    /// matches and its TTL is at least half of what we would send.
    /// See [RFC 6762 section 7.1](https://datatracker.ietf.org/doc/html/rfc6762#section-7.1)
    pub fn suppressed_by_answer(&self, other: &DnsRecord) -> bool {
        self.matches(other) && other.ttl >= (self.wire_ttl() as i64) / 2
    }

    /// Whether any answer in `msg` suppresses this record.
    pub fn suppressed_by(&self, msg: &DnsIncoming) -> bool {
        msg.is_query() && msg.answers().iter().any(|a| self.suppressed_by_answer(a))
    }
}

impl fmt::Display for DnsRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ttl {}: {}",
            self.name,
            self.rr_type(),
            self.ttl,
            self.rdata
        )
    }
}

enum PacketState {
    Init = 0,
    Finished = 1,
}

/// A single packet for outgoing DNS message.
pub struct DnsOutPacket {
    /// All bytes in `data` concatenated is the actual packet on the wire.
    data: Vec<Vec<u8>>,

    /// Current logical size of the packet. It starts with the size of the mandatory header.
    size: usize,

    /// An internal state, not defined by DNS.
    state: PacketState,

    /// k: name, v: offset
    names: HashMap<String, u16>,
}

impl DnsOutPacket {
    fn new() -> Self {
        Self {
            data: Vec::new(),
            size: MSG_HEADER_LEN, // Header is mandatory.
            state: PacketState::Init,
            names: HashMap::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.data.concat()
    }

    fn write_question(&mut self, question: &DnsQuestion) {
        self.write_name(&question.name);
        self.write_short(question.ty as u16);
        self.write_short(question.class);
    }

    /// Writes a record (answer, authoritative answer, additional).
    /// Returns false if the packet exceeds the max size with this record,
    /// and nothing is written to the packet; otherwise returns true.
    ///
    /// `now == 0` writes the record's full wire TTL (own records being
    /// announced); a non-zero `now` writes the remaining TTL (cached records
    /// carried as known answers).
    fn write_record(&mut self, record: &DnsRecord, now: u64) -> bool {
        let start_data_length = self.data.len();
        let start_size = self.size;

        self.write_name(record.name());
        self.write_short(record.rr_type() as u16);
        if record.cache_flush() {
            self.write_short(record.class() | CLASS_CACHE_FLUSH);
        } else {
            self.write_short(record.class());
        }

        if now == 0 {
            self.write_u32(record.wire_ttl());
        } else {
            self.write_u32(record.remaining_ttl(now));
        }

        let index = self.data.len();

        // Adjust size for the short we will write before this rdata.
        self.size += 2;
        self.write_rdata(record.rdata());
        self.size -= 2;

        let length: usize = self.data[index..].iter().map(|x| x.len()).sum();
        self.insert_short(index, length as u16);

        if self.size > MAX_MSG_ABSOLUTE {
            self.data.truncate(start_data_length);
            self.size = start_size;
            self.state = PacketState::Finished;
            return false;
        }

        true
    }

    /// Writes the rdata, compressing embedded names against this packet.
    fn write_rdata(&mut self, rdata: &RData) {
        match rdata {
            RData::A(addr) => self.write_bytes(&addr.octets()),
            RData::Aaaa(addr) => self.write_bytes(&addr.octets()),
            RData::Ptr(target) => self.write_name(target),
            RData::Txt(bytes) => self.write_bytes(bytes),
            RData::Srv {
                priority,
                weight,
                port,
                host,
            } => {
                self.write_short(*priority);
                self.write_short(*weight);
                self.write_short(*port);
                self.write_name(host);
            }
            RData::Hinfo { cpu, os } => {
                self.write_utf8(cpu);
                self.write_utf8(os);
            }
            RData::Nsec {
                next_name,
                type_bitmap,
            } => {
                self.write_name(next_name);
                self.write_byte(0); // window block 0
                self.write_byte(type_bitmap.len() as u8);
                self.write_bytes(type_bitmap);
            }
        }
    }

    fn insert_short(&mut self, index: usize, value: u16) {
        self.data.insert(index, value.to_be_bytes().to_vec());
        self.size += 2;
    }

    // Write name to packet
    //
    // [RFC1035]
    // 4.1.4. Message compression
    //
    // In order to reduce the size of messages, the domain system utilizes a
    // compression scheme which eliminates the repetition of domain names in a
    // message. In this scheme, an entire domain name or a list of labels at
    // the end of a domain name is replaced with a pointer to a prior occurrence
    // of the same name.
    // The pointer takes the form of a two octet sequence:
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    //     | 1  1|                OFFSET                   |
    //     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
    fn write_name(&mut self, name: &str) {
        const POINTER_MASK: u16 = 0xC000;
        let trimmed = strip_name_dot(name);

        let mut here = 0;
        while here < trimmed.len() {
            let remaining = &trimmed[here..];

            // Check if 'remaining' already appeared in this message
            if let Some(offset) = self.names.get(remaining) {
                let pointer = *offset | POINTER_MASK;
                self.write_short(pointer);
                return;
            }

            // Remember the remaining parts so we can point to it
            self.names.insert(remaining.to_string(), self.size as u16);

            // Find the current label; escaped dots stay inside the label.
            let stop = here + label_end(remaining);
            let label = unescape_label(&trimmed[here..stop])
                .unwrap_or_else(|_| trimmed[here..stop].as_bytes().to_vec());
            self.write_label(&label);

            here = stop + 1; // move past the separator
        }
        self.write_byte(0); // name ends with 0 if not using a pointer
    }

    fn write_label(&mut self, label: &[u8]) {
        assert!(label.len() < 64);
        self.write_byte(label.len() as u8);
        self.write_bytes(label);
    }

    fn write_utf8(&mut self, utf: &str) {
        assert!(utf.len() < 64);
        self.write_byte(utf.len() as u8);
        self.write_bytes(utf.as_bytes());
    }

    fn write_bytes(&mut self, s: &[u8]) {
        self.data.push(s.to_vec());
        self.size += s.len();
    }

    fn write_u32(&mut self, int: u32) {
        self.data.push(int.to_be_bytes().to_vec());
        self.size += 4;
    }

    fn write_short(&mut self, short: u16) {
        self.data.push(short.to_be_bytes().to_vec());
        self.size += 2;
    }

    fn write_byte(&mut self, byte: u8) {
        self.data.push(vec![byte]);
        self.size += 1;
    }

    /// Writes the header fields and finishes the packet.
    ///
    /// The header format is based on RFC 1035 section 4.1.1:
    /// https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.1
    fn write_header(
        &mut self,
        id: u16,
        flags: u16,
        q_count: u16,
        a_count: u16,
        auth_count: u16,
        addi_count: u16,
    ) {
        self.insert_short(0, addi_count);
        self.insert_short(0, auth_count);
        self.insert_short(0, a_count);
        self.insert_short(0, q_count);
        self.insert_short(0, flags);
        self.insert_short(0, id);

        // Adjust the size as it was already initialized to include the header.
        self.size -= MSG_HEADER_LEN;

        self.state = PacketState::Finished;
    }
}

/// Representation of one outgoing DNS message that could be sent in one or more packet(s).
#[derive(Debug)]
pub struct DnsOutgoing {
    flags: u16,
    id: u16,
    questions: Vec<DnsQuestion>,
    /// Answers paired with the `now` timestamp used for their wire TTL:
    /// 0 for own records, the current time for known answers.
    answers: Vec<(DnsRecord, u64)>,
    authorities: Vec<DnsRecord>,
    additionals: Vec<DnsRecord>,
}

impl DnsOutgoing {
    pub fn new(flags: u16) -> Self {
        Self {
            flags,
            id: 0,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn questions(&self) -> &[DnsQuestion] {
        &self.questions
    }

    pub fn answers_count(&self) -> usize {
        self.answers.len()
    }

    pub fn answers_iter(&self) -> impl Iterator<Item = &DnsRecord> {
        self.answers.iter().map(|(a, _)| a)
    }

    pub fn authorities(&self) -> &[DnsRecord] {
        &self.authorities
    }

    pub fn additionals(&self) -> &[DnsRecord] {
        &self.additionals
    }

    pub const fn is_query(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_QUERY
    }

    const fn is_response(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_RESPONSE
    }

    pub fn add_question(&mut self, name: &str, qtype: RRType) {
        self.questions
            .push(DnsQuestion::new(name, qtype, CLASS_IN));
    }

    /// Adds a question requesting a unicast response (probe queries do this
    /// for their first round).
    pub fn add_question_unicast(&mut self, name: &str, qtype: RRType) {
        self.questions
            .push(DnsQuestion::new(name, qtype, CLASS_IN | CLASS_CACHE_FLUSH));
    }

    /// Adds an answer to be sent with its full wire TTL. Duplicates
    /// (matching records) are not added again.
    pub fn add_answer(&mut self, answer: DnsRecord) {
        if !self.answers.iter().any(|(a, _)| a.matches(&answer)) {
            self.answers.push((answer, 0));
        }
    }

    /// Adds a known answer from the cache; its wire TTL is the remaining TTL
    /// at `now`.
    pub fn add_known_answer(&mut self, answer: DnsRecord, now: u64) {
        if !self.answers.iter().any(|(a, _)| a.matches(&answer)) {
            self.answers.push((answer, now));
        }
    }

    pub fn add_authority(&mut self, record: DnsRecord) {
        self.authorities.push(record);
    }

    pub fn add_additional(&mut self, record: DnsRecord) {
        self.additionals.push(record);
    }

    pub fn to_data_on_wire(&self) -> Vec<Vec<u8>> {
        let packet_list = self.to_packets();
        packet_list.iter().map(|p| p.to_bytes()).collect()
    }

    /// Encodes into one or more packets. A query whose known answers do not
    /// fit a single packet is split: earlier packets carry the TC flag and
    /// the remaining answers continue in fresh packets.
    pub fn to_packets(&self) -> Vec<DnsOutPacket> {
        let mut packet_list = Vec::new();
        let mut packet = DnsOutPacket::new();

        let mut question_count = self.questions.len() as u16;
        let mut answer_count = 0;
        let mut auth_count = 0;
        let mut addi_count = 0;

        for question in self.questions.iter() {
            packet.write_question(question);
        }

        for (answer, time) in self.answers.iter() {
            if packet.write_record(answer, *time) {
                answer_count += 1;
                continue;
            }

            // Overflowing answers are dropped from responses; for a query
            // they are known answers and continue in a new packet.
            if self.is_response() {
                continue;
            }

            packet.write_header(
                self.id,
                self.flags | FLAGS_TC,
                question_count,
                answer_count,
                auth_count,
                addi_count,
            );
            packet_list.push(packet);

            packet = DnsOutPacket::new();
            packet.write_record(answer, *time);
            question_count = 0;
            answer_count = 1;
            auth_count = 0;
            addi_count = 0;
        }

        for auth in self.authorities.iter() {
            auth_count += u16::from(packet.write_record(auth, 0));
        }

        for addi in self.additionals.iter() {
            addi_count += u16::from(packet.write_record(addi, 0));
        }

        packet.write_header(
            self.id,
            self.flags,
            question_count,
            answer_count,
            auth_count,
            addi_count,
        );

        packet_list.push(packet);
        packet_list
    }
}

/// An incoming DNS message. It could be a query or a response.
///
/// Decoding walks the buffer with a single forward cursor (`offset`); every
/// read checks bounds and any inconsistency rejects the whole message.
#[derive(Debug)]
pub struct DnsIncoming {
    offset: usize,
    data: Vec<u8>,
    questions: Vec<DnsQuestion>,
    answers: Vec<DnsRecord>,
    authorities: Vec<DnsRecord>,
    additionals: Vec<DnsRecord>,
    id: u16,
    flags: u16,
    num_questions: u16,
    num_answers: u16,
    num_authorities: u16,
    num_additionals: u16,
}

impl DnsIncoming {
    pub fn new(data: Vec<u8>) -> Result<Self> {
        let mut incoming = Self {
            offset: 0,
            data,
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
            id: 0,
            flags: 0,
            num_questions: 0,
            num_answers: 0,
            num_authorities: 0,
            num_additionals: 0,
        };

        incoming.read_header()?;
        incoming.read_questions()?;
        incoming.answers = incoming.read_rr_records(incoming.num_answers)?;
        incoming.authorities = incoming.read_rr_records(incoming.num_authorities)?;
        incoming.additionals = incoming.read_rr_records(incoming.num_additionals)?;

        Ok(incoming)
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn questions(&self) -> &[DnsQuestion] {
        &self.questions
    }

    pub fn answers(&self) -> &[DnsRecord] {
        &self.answers
    }

    pub fn authorities(&self) -> &[DnsRecord] {
        &self.authorities
    }

    pub fn additionals(&self) -> &[DnsRecord] {
        &self.additionals
    }

    pub fn all_records(self) -> impl Iterator<Item = DnsRecord> {
        self.answers
            .into_iter()
            .chain(self.authorities)
            .chain(self.additionals)
    }

    pub fn num_authorities(&self) -> u16 {
        self.num_authorities
    }

    pub const fn is_query(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_QUERY
    }

    pub const fn is_response(&self) -> bool {
        (self.flags & FLAGS_QR_MASK) == FLAGS_QR_RESPONSE
    }

    pub const fn is_truncated(&self) -> bool {
        (self.flags & FLAGS_TC) != 0
    }

    fn read_header(&mut self) -> Result<()> {
        if self.data.len() < MSG_HEADER_LEN {
            return Err(Error::Msg(format!(
                "DNS incoming: header is too short: {} bytes",
                self.data.len()
            )));
        }

        let data = &self.data[0..];
        self.id = u16_from_be_slice(&data[..2]);
        self.flags = u16_from_be_slice(&data[2..4]);
        self.num_questions = u16_from_be_slice(&data[4..6]);
        self.num_answers = u16_from_be_slice(&data[6..8]);
        self.num_authorities = u16_from_be_slice(&data[8..10]);
        self.num_additionals = u16_from_be_slice(&data[10..12]);

        self.offset = MSG_HEADER_LEN;

        trace!(
            "read_header: id {}, {} questions {} answers {} authorities {} additionals",
            self.id,
            self.num_questions,
            self.num_answers,
            self.num_authorities,
            self.num_additionals
        );
        Ok(())
    }

    fn read_questions(&mut self) -> Result<()> {
        for i in 0..self.num_questions {
            let name = self.read_name()?;

            let data = &self.data[self.offset..];
            if data.len() < 4 {
                return Err(Error::Msg(format!(
                    "DNS incoming: question idx {} too short: {}",
                    i,
                    data.len()
                )));
            }
            let ty = u16_from_be_slice(&data[..2]);
            let class = u16_from_be_slice(&data[2..4]);
            self.offset += 4;

            let rr_type = match RRType::from_u16(ty) {
                Some(t) => t,
                None => {
                    return Err(Error::Msg(format!(
                        "DNS incoming: question idx {} qtype unknown: {}",
                        i, ty
                    )))
                }
            };

            self.questions.push(DnsQuestion::new(&name, rr_type, class));
        }
        Ok(())
    }

    /// Decodes a sequence of resource records (answers, authorities or
    /// additionals).
    fn read_rr_records(&mut self, count: u16) -> Result<Vec<DnsRecord>> {
        let mut rr_records = Vec::new();

        // Each RR must have at least TYPE, CLASS, TTL, RDLENGTH: 10 bytes
        // after the name.
        const RR_HEADER_REMAIN: usize = 10;

        for _ in 0..count {
            let name = self.read_name()?;
            let slice = &self.data[self.offset..];

            if slice.len() < RR_HEADER_REMAIN {
                return Err(Error::Msg(format!(
                    "read_rr_records: RR '{}' is too short after name: {} bytes",
                    &name,
                    slice.len()
                )));
            }

            let ty = u16_from_be_slice(&slice[..2]);
            let class = u16_from_be_slice(&slice[2..4]);
            // TTL 0 is kept as-is: the cache applies the one second grace of
            // RFC 6762 section 10.1 when it sees the goodbye.
            let ttl = u32_from_be_slice(&slice[4..8]) as i64;
            let rdata_len = u16_from_be_slice(&slice[8..10]) as usize;
            self.offset += RR_HEADER_REMAIN;
            let next_offset = self.offset + rdata_len;

            if next_offset > self.data.len() {
                return Err(Error::Msg(format!(
                    "RR {} RDATA length {} is invalid: remain data len: {}",
                    name,
                    rdata_len,
                    self.data.len() - self.offset
                )));
            }

            let rdata = match RRType::from_u16(ty) {
                Some(RRType::A) => Some(RData::A(self.read_ipv4()?)),
                Some(RRType::AAAA) => Some(RData::Aaaa(self.read_ipv6()?)),
                // The embedded name may be compressed against this packet;
                // read_name yields the decoded form, which RData stores, so
                // the cached record is independent of this buffer.
                Some(RRType::PTR) => Some(RData::Ptr(self.read_name()?)),
                Some(RRType::TXT) => Some(RData::Txt(self.read_vec(rdata_len))),
                Some(RRType::SRV) => Some(RData::Srv {
                    priority: self.read_u16()?,
                    weight: self.read_u16()?,
                    port: self.read_u16()?,
                    host: self.read_name()?,
                }),
                Some(RRType::HINFO) => Some(RData::Hinfo {
                    cpu: self.read_char_string()?,
                    os: self.read_char_string()?,
                }),
                Some(RRType::NSEC) => Some(RData::Nsec {
                    next_name: self.read_name()?,
                    type_bitmap: self.read_type_bitmap()?,
                }),
                _ => None,
            };

            match rdata {
                Some(rdata) => {
                    let mut record = DnsRecord::new(&name, class & CLASS_MASK, ttl, rdata);
                    record.set_cache_flush((class & CLASS_CACHE_FLUSH) != 0);
                    trace!("read_rr_records: {}", &record);
                    rr_records.push(record);
                }
                None => {
                    trace!("Unsupported DNS record type: {} name: {}", ty, &name);
                    self.offset += rdata_len;
                }
            }

            // The rdata decode must consume exactly `rdata_len` bytes.
            if self.offset != next_offset {
                return Err(Error::Msg(format!(
                    "read_rr_records: decode offset error for RData type {} offset: {} expected offset: {}",
                    ty, self.offset, next_offset,
                )));
            }
        }

        Ok(rr_records)
    }

    fn read_char_string(&mut self) -> Result<String> {
        if self.offset >= self.data.len() {
            return Err(Error::Msg(format!(
                "read_char_string: no length byte at offset {}",
                self.offset
            )));
        }
        let length = self.data[self.offset] as usize;
        self.offset += 1;
        self.read_string(length)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let slice = &self.data[self.offset..];
        if slice.len() < U16_SIZE {
            return Err(Error::Msg(format!(
                "read_u16: slice len is only {}",
                slice.len()
            )));
        }
        let num = u16_from_be_slice(&slice[..U16_SIZE]);
        self.offset += U16_SIZE;
        Ok(num)
    }

    /// Reads the "Type Bit Map" block of an NSEC record.
    /// Per [RFC 6762 section 6.1](https://datatracker.ietf.org/doc/html/rfc6762#section-6.1)
    /// the block number is 0 and the block length is 1-32.
    fn read_type_bitmap(&mut self) -> Result<Vec<u8>> {
        if self.data.len() < self.offset + 2 {
            return Err(Error::Msg(format!(
                "DnsIncoming is too short: {} at NSEC Type Bit Map offset {}",
                self.data.len(),
                self.offset
            )));
        }

        let block_num = self.data[self.offset];
        self.offset += 1;
        if block_num != 0 {
            return Err(Error::Msg(format!(
                "NSEC block number is not 0: {}",
                block_num
            )));
        }

        let block_len = self.data[self.offset] as usize;
        if !(1..=32).contains(&block_len) {
            return Err(Error::Msg(format!(
                "NSEC block length must be in the range 1-32: {}",
                block_len
            )));
        }
        self.offset += 1;

        let end = self.offset + block_len;
        if end > self.data.len() {
            return Err(Error::Msg(format!(
                "NSEC block overflow: {} over data len {}",
                end,
                self.data.len()
            )));
        }
        let bitmap = self.data[self.offset..end].to_vec();
        self.offset += block_len;

        Ok(bitmap)
    }

    fn read_vec(&mut self, length: usize) -> Vec<u8> {
        let v = self.data[self.offset..self.offset + length].to_vec();
        self.offset += length;
        v
    }

    fn read_ipv4(&mut self) -> Result<Ipv4Addr> {
        let slice = &self.data[self.offset..];
        if slice.len() < 4 {
            return Err(Error::Msg(format!(
                "read_ipv4: remaining len is only {}",
                slice.len()
            )));
        }
        let bytes: [u8; 4] = slice[..4].try_into().map_err(|_| Error::Again)?;
        self.offset += 4;
        Ok(Ipv4Addr::from(bytes))
    }

    fn read_ipv6(&mut self) -> Result<Ipv6Addr> {
        let slice = &self.data[self.offset..];
        if slice.len() < 16 {
            return Err(Error::Msg(format!(
                "read_ipv6: remaining len is only {}",
                slice.len()
            )));
        }
        let bytes: [u8; 16] = slice[..16].try_into().map_err(|_| Error::Again)?;
        self.offset += 16;
        Ok(Ipv6Addr::from(bytes))
    }

    fn read_string(&mut self, length: usize) -> Result<String> {
        let end = self.offset + length;
        if end > self.data.len() {
            return Err(Error::Msg(format!(
                "read_string: end {} exceeds data length {}",
                end,
                self.data.len()
            )));
        }
        let s = str::from_utf8(&self.data[self.offset..end])
            .map_err(|e| Error::Msg(format!("read_string: from_utf8: {}", e)))?;
        self.offset += length;
        Ok(s.to_string())
    }

    /// Reads a domain name at the current cursor position.
    ///
    /// Compression pointers must point strictly backward: a pointer at or
    /// past the start of this name rejects the message, which also rules
    /// out pointer loops. The decoded name is lowercased presentation form:
    /// a dot byte inside a label comes out as `\.` so the name splits back
    /// into the same labels when re-encoded.
    fn read_name(&mut self) -> Result<String> {
        let data = &self.data[..];
        let start_offset = self.offset;
        let mut offset = start_offset;
        let mut name = "".to_string();
        let mut at_end = false;
        // Uncompressed wire length, including the terminating zero.
        let mut wire_len = 1;

        loop {
            if offset >= data.len() {
                return Err(Error::Msg(format!(
                    "read_name: offset: {} data len {}",
                    offset,
                    data.len(),
                )));
            }
            let length = data[offset];

            // A domain name is terminated by a length byte of zero.
            if length == 0 {
                if !at_end {
                    self.offset = offset + 1;
                }
                break;
            }

            // Check the first 2 bits for possible message compression.
            match length & 0xC0 {
                0x00 => {
                    // regular label with length
                    offset += 1;
                    let ending = offset + length as usize;

                    if ending > data.len() {
                        return Err(Error::Msg(format!(
                            "read_name: ending {} exceeds data length {}",
                            ending,
                            data.len()
                        )));
                    }

                    let label = str::from_utf8(&data[offset..ending])
                        .map_err(|e| Error::Msg(format!("read_name: from_utf8: {}", e)))?;
                    push_escaped_label(&mut name, label);
                    name += ".";
                    offset += length as usize;

                    wire_len += 1 + length as usize;
                    if wire_len > MAX_DOMAIN_NAME_LEN {
                        return Err(Error::Msg(format!(
                            "read_name: name exceeds {} bytes",
                            MAX_DOMAIN_NAME_LEN
                        )));
                    }
                }
                0xC0 => {
                    // Message compression.
                    // See https://datatracker.ietf.org/doc/html/rfc1035#section-4.1.4
                    let slice = &data[offset..];
                    if slice.len() < U16_SIZE {
                        return Err(Error::Msg(format!(
                            "read_name: u16 slice len is only {}",
                            slice.len()
                        )));
                    }
                    let pointer = (u16_from_be_slice(slice) ^ 0xC000) as usize;
                    if pointer >= start_offset {
                        return Err(Error::Msg(format!(
                            "Invalid name compression: pointer {} must be less than the start offset {}",
                            pointer, start_offset
                        )));
                    }

                    // A pointer marks the end of a domain name on the wire.
                    if !at_end {
                        self.offset = offset + U16_SIZE;
                        at_end = true;
                    }
                    offset = pointer;
                }
                _ => {
                    return Err(Error::Msg(format!(
                        "Bad name with invalid length: 0x{:x} offset {}",
                        length, offset,
                    )));
                }
            };
        }

        Ok(name.to_lowercase())
    }
}

/// Returns UNIX time in millis
pub(crate) fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

const fn u16_from_be_slice(bytes: &[u8]) -> u16 {
    let u8_array: [u8; 2] = [bytes[0], bytes[1]];
    u16::from_be_bytes(u8_array)
}

const fn u32_from_be_slice(s: &[u8]) -> u32 {
    let u8_array: [u8; 4] = [s[0], s[1], s[2], s[3]];
    u32::from_be_bytes(u8_array)
}

#[cfg(test)]
mod tests {
    use super::{
        encode_name, names_equal, nsec_type_bitmap, DnsIncoming, DnsOutgoing, DnsRecord, RData,
        RRType, CLASS_CACHE_FLUSH, CLASS_IN, FLAGS_AA, FLAGS_QR_QUERY, FLAGS_QR_RESPONSE,
    };
    use std::net::Ipv4Addr;

    #[test]
    fn test_encode_name_limits() {
        let encoded = encode_name("abc.local.").unwrap();
        assert_eq!(encoded, b"\x03abc\x05local\x00".to_vec());

        // 64-byte label is rejected.
        let long_label = format!("{}.local.", "a".repeat(64));
        assert!(encode_name(&long_label).is_err());

        // 63-byte label is fine.
        let ok_label = format!("{}.local.", "a".repeat(63));
        assert!(encode_name(&ok_label).is_ok());

        // Whole name exceeding MAX_DOMAIN_NAME_LEN when encoded.
        let long_name = format!("{}.{}.local.", "a".repeat(63), "b".repeat(63));
        assert!(encode_name(&long_name).is_err());

        assert!(encode_name("a..local.").is_err());
    }

    #[test]
    fn test_names_equal_ignores_case_and_dot() {
        assert!(names_equal("MyHost.Local.", "myhost.local"));
        assert!(!names_equal("myhost.local.", "myhost.site."));
    }

    #[test]
    fn test_roundtrip_response_with_records() {
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        out.add_answer(DnsRecord::own(
            "MyHost.local.",
            RData::A(Ipv4Addr::new(192, 168, 1, 9)),
        ));
        out.add_answer(DnsRecord::own_shared(
            "_http._tcp.local.",
            RData::Ptr("printer._http._tcp.local.".to_string()),
        ));

        let packets = out.to_data_on_wire();
        assert_eq!(packets.len(), 1);

        let decoded = DnsIncoming::new(packets.into_iter().next().unwrap()).unwrap();
        assert!(decoded.is_response());
        assert_eq!(decoded.answers().len(), 2);

        // Names are normalized to lowercase on decode.
        assert_eq!(decoded.answers()[0].name(), "myhost.local.");
        assert!(decoded.answers()[0].cache_flush());
        assert_eq!(decoded.answers()[0].rdata(), &RData::A(Ipv4Addr::new(192, 168, 1, 9)));

        assert!(!decoded.answers()[1].cache_flush());
        match decoded.answers()[1].rdata() {
            RData::Ptr(target) => assert_eq!(target, "printer._http._tcp.local."),
            other => panic!("expected PTR rdata, got {:?}", other),
        }
    }

    #[test]
    fn test_compressed_ptr_rdata_reencodes_uncompressed() {
        // The PTR target shares the "_http._tcp.local." suffix with the
        // record name, so the encoder compresses it on the wire. The decoded
        // record must still produce full uncompressed rdata bytes.
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        out.add_answer(DnsRecord::own_shared(
            "_http._tcp.local.",
            RData::Ptr("printer._http._tcp.local.".to_string()),
        ));
        let wire = out.to_data_on_wire().into_iter().next().unwrap();

        let decoded = DnsIncoming::new(wire).unwrap();
        let rdata_bytes = decoded.answers()[0].rdata().to_bytes();
        assert_eq!(
            rdata_bytes,
            encode_name("printer._http._tcp.local.").unwrap()
        );
    }

    #[test]
    fn test_forward_pointer_rejected() {
        // Header with 1 question whose name is a pointer to itself.
        let mut packet = vec![0u8; 12];
        packet[5] = 1; // qdcount = 1
        packet.extend_from_slice(&[0xC0, 12]); // pointer to offset 12 (its own start)
        packet.extend_from_slice(&[0, 1, 0, 1]); // qtype A, class IN

        assert!(DnsIncoming::new(packet).is_err());
    }

    #[test]
    fn test_count_mismatch_rejected() {
        // Declares one answer but carries no data beyond the header.
        let mut packet = vec![0u8; 12];
        packet[3] = 0x80; // response flag
        packet[7] = 1; // ancount = 1
        assert!(DnsIncoming::new(packet).is_err());
    }

    #[test]
    fn test_response_ttl_zero_is_goodbye() {
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        out.add_answer(DnsRecord::new(
            "gone.local.",
            CLASS_IN,
            0,
            RData::A(Ipv4Addr::new(10, 0, 0, 1)),
        ));
        let wire = out.to_data_on_wire().into_iter().next().unwrap();

        let decoded = DnsIncoming::new(wire).unwrap();
        assert_eq!(decoded.answers()[0].ttl(), 0);
        assert!(decoded.answers()[0].is_goodbye());
    }

    #[test]
    fn test_query_with_unicast_question() {
        let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
        out.add_question_unicast("myhost.local.", RRType::ANY);
        let wire = out.to_data_on_wire().into_iter().next().unwrap();

        let decoded = DnsIncoming::new(wire).unwrap();
        assert!(decoded.is_query());
        assert_eq!(decoded.questions().len(), 1);
        assert_eq!(decoded.questions()[0].ty(), RRType::ANY);
        assert!(decoded.questions()[0].wants_unicast());
    }

    #[test]
    fn test_compare_rdata_prefix_and_length() {
        let shorter = DnsRecord::own("h.local.", RData::Txt(b"\x03abc".to_vec()));
        let longer = DnsRecord::own("h.local.", RData::Txt(b"\x03abc\x01d".to_vec()));
        let bigger = DnsRecord::own("h.local.", RData::Txt(b"\x03abd".to_vec()));

        // Equal prefix: longer rdata wins.
        assert_eq!(
            shorter.compare_rdata(&longer),
            std::cmp::Ordering::Less
        );
        // First differing byte decides.
        assert_eq!(longer.compare_rdata(&bigger), std::cmp::Ordering::Less);
        assert_eq!(
            shorter.compare_rdata(&shorter),
            std::cmp::Ordering::Equal
        );
    }

    #[test]
    fn test_conflict_and_match() {
        let ours = DnsRecord::own("host.local.", RData::A(Ipv4Addr::new(10, 0, 0, 1)));
        let same = DnsRecord::new(
            "HOST.local.",
            CLASS_IN,
            120,
            RData::A(Ipv4Addr::new(10, 0, 0, 1)),
        );
        let different = DnsRecord::new(
            "host.local.",
            CLASS_IN,
            120,
            RData::A(Ipv4Addr::new(10, 0, 0, 2)),
        );

        assert!(ours.matches(&same));
        assert!(!ours.conflicts_with(&same));
        assert!(ours.conflicts_with(&different));
    }

    #[test]
    fn test_known_answer_suppression_threshold() {
        let ours = DnsRecord::own_shared(
            "_http._tcp.local.",
            RData::Ptr("p._http._tcp.local.".to_string()),
        );
        // Our wire TTL is 4500; half is 2250.
        let strong = DnsRecord::new(
            "_http._tcp.local.",
            CLASS_IN,
            2250,
            RData::Ptr("p._http._tcp.local.".to_string()),
        );
        let weak = DnsRecord::new(
            "_http._tcp.local.",
            CLASS_IN,
            100,
            RData::Ptr("p._http._tcp.local.".to_string()),
        );
        assert!(ours.suppressed_by_answer(&strong));
        assert!(!ours.suppressed_by_answer(&weak));
    }

    #[test]
    fn test_nsec_roundtrip() {
        let bitmap = nsec_type_bitmap(&[RRType::SRV, RRType::TXT]);
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        out.add_answer(DnsRecord::own(
            "inst._http._tcp.local.",
            RData::Nsec {
                next_name: "inst._http._tcp.local.".to_string(),
                type_bitmap: bitmap.clone(),
            },
        ));
        let wire = out.to_data_on_wire().into_iter().next().unwrap();

        let decoded = DnsIncoming::new(wire).unwrap();
        match decoded.answers()[0].rdata() {
            RData::Nsec {
                next_name,
                type_bitmap,
            } => {
                assert_eq!(next_name, "inst._http._tcp.local.");
                assert_eq!(type_bitmap, &bitmap);
            }
            other => panic!("expected NSEC rdata, got {:?}", other),
        }
    }

    #[test]
    fn test_cache_flush_class_bit() {
        let mut record = DnsRecord::new(
            "x.local.",
            CLASS_IN,
            120,
            RData::A(Ipv4Addr::new(1, 2, 3, 4)),
        );
        record.set_cache_flush(true);
        assert_eq!(record.class() & CLASS_CACHE_FLUSH, 0); // kept out of class
        assert!(record.cache_flush());
    }

    #[test]
    fn test_encode_name_escaped_dot() {
        // A dot inside a label is escaped in presentation form and must
        // come out as part of the label, not a separator.
        let encoded = encode_name("a\\.b.local.").unwrap();
        assert_eq!(encoded, b"\x03a.b\x05local\x00".to_vec());

        let encoded = encode_name("tricky\\\\.local.").unwrap();
        assert_eq!(encoded, b"\x07tricky\\\x05local\x00".to_vec());

        assert!(encode_name("dangling\\").is_err());
    }

    #[test]
    fn test_label_with_dot_survives_decode_and_reencode() {
        // A wire-legal PTR target whose single label is "a." (a dot byte
        // inside the label).
        let mut packet = vec![0u8; 12];
        packet[2] = 0x84; // response + AA
        packet[7] = 1; // ancount = 1
        packet.extend_from_slice(b"\x04host\x05local\x00");
        packet.extend_from_slice(&(RRType::PTR as u16).to_be_bytes());
        packet.extend_from_slice(&CLASS_IN.to_be_bytes());
        packet.extend_from_slice(&120u32.to_be_bytes());
        packet.extend_from_slice(&4u16.to_be_bytes()); // rdlength
        packet.extend_from_slice(b"\x02a.\x00");

        let decoded = DnsIncoming::new(packet).unwrap();
        let record = &decoded.answers()[0];
        match record.rdata() {
            RData::Ptr(target) => assert_eq!(target, "a\\.."),
            other => panic!("expected PTR rdata, got {:?}", other),
        }
        // Canonical rdata restores the original label bytes.
        assert_eq!(record.rdata().to_bytes(), vec![2, b'a', b'.', 0]);

        // Re-sending the record keeps the label intact on the wire too.
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        out.add_answer(record.clone());
        let wire = out.to_data_on_wire().into_iter().next().unwrap();
        let again = DnsIncoming::new(wire).unwrap();
        assert_eq!(again.answers()[0].rdata(), record.rdata());
    }

    #[test]
    fn test_expire_sooner_keeps_millis_precision() {
        let mut record = DnsRecord::new(
            "peer.local.",
            CLASS_IN,
            120,
            RData::A(Ipv4Addr::new(10, 0, 0, 2)),
        );
        let now = record.created();

        // A mid-life cutoff expires at exactly the requested moment, not
        // rounded down to a whole second.
        record.set_expire_sooner(now + 2500);
        assert!(!record.is_expired(now + 2499));
        assert!(record.is_expired(now + 2500));

        // A later deadline never pushes the expiry back out.
        record.set_expire_sooner(now + 9000);
        assert!(record.is_expired(now + 2500));

        // A refresh clears the cutoff.
        let fresh = DnsRecord::new(
            "peer.local.",
            CLASS_IN,
            120,
            RData::A(Ipv4Addr::new(10, 0, 0, 2)),
        );
        record.reset_ttl(&fresh);
        assert!(!record.is_expired(now + 2500));
    }
}
