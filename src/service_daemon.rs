//! The service daemon: a cloneable handle in front of a single engine
//! thread that owns all mutable state.
//!
//! The engine owns the response cache, the send scheduler, the probers and
//! the per-variant identities. Commands travel over a bounded flume channel;
//! a loopback UDP datagram wakes the engine's mio poll so commands are
//! handled promptly without busy polling.
//!
//! Some naming conventions in this source code:
//!
//! `ty_domain` refers to a service type together with its domain,
//! e.g. `_http._tcp.local.`
//!
//! `fullname` refers to a full service instance name,
//! e.g. `web._http._tcp.local.`
//!
//! An `identity` is a claimed hostname on one variant (mDNS or xmDNS),
//! together with the socket joined to that variant's multicast group.

#[cfg(feature = "logging")]
use crate::log::{debug, trace};
use crate::{
    dns_cache::DnsCache,
    dns_parser::{
        current_time_millis, DnsIncoming, DnsOutgoing, DnsRecord, RData, RRType, CLASS_IN,
        FLAGS_AA, FLAGS_QR_QUERY, FLAGS_QR_RESPONSE, MAX_MSG_ABSOLUTE,
    },
    dns_sd::{check_browse_domain, decode_txt, RegistrationKind, ServiceRegistration},
    error::{Error, Result},
    probe::{ProbeTiming, Prober},
    responder::{self, ServiceVariant, MDNS_PORT},
    sender::{PendingSend, SendScheduler, SendTag},
    Receiver,
};
use flume::{bounded, Sender, TrySendError};
use mio::{net::UdpSocket as MioUdpSocket, Poll, Token};
use socket2::Socket;
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket},
    thread,
    time::Duration,
};

/// A simple macro to report all kinds of errors.
macro_rules! e_fmt {
  ($($arg:tt)+) => {
      Error::Msg(format!($($arg)+))
  };
}

const LOOPBACK_V4: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

/// Default wait budget for browse / lookup / address queries, in millis.
pub const QUERY_WAIT_DEFAULT_MILLIS: u64 = 500;

/// How many times announcements are repeated, and how they are spaced.
const ANNOUNCE_REPEAT: u8 = 3;
const ANNOUNCE_INTERVAL_MILLIS: u64 = 1000;
const GOODBYE_REPEAT: u8 = 2;
const GOODBYE_INTERVAL_MILLIS: u64 = 1000;

/// How long a query of ours counts as "recently sent" when deciding whether
/// an incoming query is just our own multicast echo.
const OWN_QUERY_ECHO_MILLIS: u64 = 1000;

const IP_CHECK_INTERVAL_MILLIS: u64 = 30_000;

const SIGNAL_SOCK_EVENT_KEY: usize = usize::MAX - 1; // avoid overlap with engine.poll_ids

/// Status code for the service daemon.
#[derive(Debug, PartialEq, Clone, Eq)]
#[non_exhaustive]
pub enum DaemonStatus {
    /// The daemon is running as normal.
    Running,

    /// The daemon has been shutdown.
    Shutdown,
}

/// A snapshot of one variant's state, as returned by [`ServiceDaemon::status`].
#[derive(Clone, Debug)]
pub struct VariantStatus {
    pub running: bool,
    /// Still probing or announcing, not yet settled.
    pub probing: bool,
    /// The current full hostname, if running. May differ from the requested
    /// one after a conflict rename.
    pub hostname: Option<String>,
    pub address: Option<Ipv4Addr>,
}

/// A resolved service instance, as returned by [`ServiceDaemon::lookup`].
#[derive(Clone, Debug)]
pub struct ResolvedService {
    pub fullname: String,
    /// Target host from the SRV record.
    pub host: String,
    pub port: u16,
    /// The host's IPv4 address, when an A record was cached too.
    pub address: Option<Ipv4Addr>,
    /// Decoded TXT properties.
    pub txt_properties: Vec<(String, String)>,
}

/// A daemon thread for mDNS / xmDNS.
///
/// This struct provides a handle and an API to the daemon. It is cloneable.
#[derive(Clone)]
pub struct ServiceDaemon {
    /// Sender handle of the channel to the daemon.
    sender: Sender<Command>,

    /// Send to this addr to signal that a `Command` is coming.
    ///
    /// The daemon listens on this addr together with the multicast sockets,
    /// to avoid busy polling the flume channel.
    signal_addr: SocketAddr,
}

impl ServiceDaemon {
    /// Creates a new daemon and spawns a thread to run the engine.
    ///
    /// The daemon (re)uses the default mDNS port 5353 for both variants.
    pub fn new() -> Result<Self> {
        // Port 0 lets the system assign a random available port.
        let signal_addr = SocketAddrV4::new(LOOPBACK_V4, 0);

        let signal_sock = UdpSocket::bind(signal_addr)
            .map_err(|e| e_fmt!("failed to create signal_sock for daemon: {}", e))?;

        let signal_addr = signal_sock
            .local_addr()
            .map_err(|e| e_fmt!("failed to get signal sock addr: {}", e))?;

        // Must be nonblocking so it can be polled together with the
        // multicast sockets.
        signal_sock
            .set_nonblocking(true)
            .map_err(|e| e_fmt!("failed to set nonblocking for signal socket: {}", e))?;

        let poller = Poll::new().map_err(|e| e_fmt!("failed to create mio Poll: {}", e))?;

        let (sender, receiver) = bounded(100);

        let mio_sock = MioUdpSocket::from_std(signal_sock);
        thread::Builder::new()
            .name("zeroconf_engine".to_string())
            .spawn(move || Engine::daemon_thread(mio_sock, poller, receiver))
            .map_err(|e| e_fmt!("thread builder failed to spawn: {}", e))?;

        Ok(Self {
            sender,
            signal_addr,
        })
    }

    /// Sends `cmd` to the daemon via its channel, and sends a signal
    /// to its sock addr to notify.
    fn send_cmd(&self, cmd: Command) -> Result<()> {
        let cmd_name = cmd.to_string();

        // First, send to the flume channel.
        self.sender.try_send(cmd).map_err(|e| match e {
            TrySendError::Full(_) => Error::Again,
            e => e_fmt!("flume::channel::send failed: {}", e),
        })?;

        // Second, send a signal to notify the daemon.
        let addr = SocketAddrV4::new(LOOPBACK_V4, 0);
        let socket = UdpSocket::bind(addr)
            .map_err(|e| e_fmt!("failed to create socket to send signal: {}", e))?;
        socket
            .send_to(cmd_name.as_bytes(), self.signal_addr)
            .map_err(|e| {
                e_fmt!(
                    "signal socket send_to {} ({}) failed: {}",
                    self.signal_addr,
                    cmd_name,
                    e
                )
            })?;

        Ok(())
    }

    /// Starts a variant: claims `hostname` (a single label, without the
    /// domain) on the variant's multicast group, probing for uniqueness
    /// first.
    ///
    /// With `skip_probe` the name is assumed unique and announced directly.
    ///
    /// Starting an already running variant reports `Error::AlreadyRunning`
    /// on the returned channel.
    pub fn start(
        &self,
        variant: ServiceVariant,
        hostname: &str,
        skip_probe: bool,
    ) -> Result<Receiver<Result<()>>> {
        check_hostname(hostname)?;
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Start(
            variant,
            hostname.to_string(),
            skip_probe,
            resp_s,
        ))?;
        Ok(resp_r)
    }

    /// Stops a variant: multicasts goodbye packets for its records and drops
    /// the identity. Stopping a stopped variant reports `Error::NotRunning`.
    pub fn stop(&self, variant: ServiceVariant) -> Result<Receiver<Result<()>>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Stop(variant, resp_s))?;
        Ok(resp_r)
    }

    /// Stops every running variant. Variants that are not running are left
    /// alone.
    pub fn stop_all(&self) -> Result<()> {
        self.send_cmd(Command::StopAll)
    }

    /// Restarts every running variant: re-reads the interface address and
    /// probes again with the originally requested hostname.
    pub fn restart_all(&self) -> Result<()> {
        self.send_cmd(Command::RestartAll)
    }

    /// Changes the hostname of a running variant. Implemented as the restart
    /// flow with the new base name.
    pub fn change_hostname(
        &self,
        variant: ServiceVariant,
        hostname: &str,
    ) -> Result<Receiver<Result<()>>> {
        check_hostname(hostname)?;
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::ChangeHostname(
            variant,
            hostname.to_string(),
            resp_s,
        ))?;
        Ok(resp_r)
    }

    /// Registers a DNS-SD service. The variant named by the registration's
    /// domain must be running and settled, and only one registration of each
    /// kind (local, proxy) can be active at a time.
    pub fn register(&self, registration: ServiceRegistration) -> Result<Receiver<Result<()>>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::RegisterService(Box::new(registration), resp_s))?;
        Ok(resp_r)
    }

    /// Unregisters the active service of `kind`: multicasts goodbye packets
    /// and frees the slot. Reports `Error::NotFound` if the slot is empty.
    pub fn unregister(&self, kind: RegistrationKind) -> Result<Receiver<Result<()>>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::UnregisterService(kind, resp_s))?;
        Ok(resp_r)
    }

    /// Browses for instances of a service type, e.g. `_http._tcp.local.`.
    /// Multicasts a PTR query, then reports the instance full names found in
    /// the cache once `wait_millis` has passed.
    pub fn browse(
        &self,
        ty_domain: &str,
        wait_millis: u64,
    ) -> Result<Receiver<Result<Vec<String>>>> {
        let variant = variant_for_name(ty_domain)?;
        check_browse_domain(ty_domain, variant)?;
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Browse(ty_domain.to_string(), wait_millis, resp_s))?;
        Ok(resp_r)
    }

    /// Resolves one service instance: queries SRV and TXT for its full name
    /// and reports host, port, address and TXT properties. Reports
    /// `Error::NotFound` when no SRV record arrived within the wait budget.
    pub fn lookup(
        &self,
        fullname: &str,
        wait_millis: u64,
    ) -> Result<Receiver<Result<ResolvedService>>> {
        let variant = variant_for_name(fullname)?;
        check_browse_domain(fullname, variant)?;
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Lookup(fullname.to_string(), wait_millis, resp_s))?;
        Ok(resp_r)
    }

    /// Multicasts a one-shot query for any name and record type. Responses
    /// land in the cache; see [`ServiceDaemon::cache_dump`].
    pub fn query(&self, name: &str, ty: RRType, variant: ServiceVariant) -> Result<()> {
        check_browse_domain(name, variant)?;
        self.send_cmd(Command::Query(name.to_string(), ty, variant))
    }

    /// Resolves a hostname (e.g. `otherhost.local.`) to its IPv4 address,
    /// waiting up to `wait_millis` for an answer. Reports `Error::NotFound`
    /// if none arrives.
    pub fn get_ipv4_address_by_name(
        &self,
        name: &str,
        wait_millis: u64,
    ) -> Result<Receiver<Result<Ipv4Addr>>> {
        let variant = variant_for_name(name)?;
        check_browse_domain(name, variant)?;
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::GetAddr(name.to_string(), wait_millis, resp_s))?;
        Ok(resp_r)
    }

    /// Reads the current probe timing knobs.
    pub fn probe_timing(&self) -> Result<Receiver<ProbeTiming>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::GetProbeTiming(resp_s))?;
        Ok(resp_r)
    }

    /// Sets the probe timing knobs for probers created from now on.
    pub fn set_probe_timing(&self, timing: ProbeTiming) -> Result<()> {
        self.send_cmd(Command::SetProbeTiming(timing))
    }

    /// Reads a snapshot of one variant's state.
    pub fn status(&self, variant: ServiceVariant) -> Result<Receiver<VariantStatus>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::GetStatus(variant, resp_s))?;
        Ok(resp_r)
    }

    /// Reads a snapshot of the response cache. Rendering is left to the
    /// caller.
    pub fn cache_dump(&self) -> Result<Receiver<Vec<DnsRecord>>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::CacheDump(resp_s))?;
        Ok(resp_r)
    }

    /// Shuts down the daemon thread and returns a channel to receive the
    /// final status. Running variants get goodbye packets on the way out.
    ///
    /// When an error is returned, the caller should retry only when
    /// the error is `Error::Again`, otherwise should log and move on.
    pub fn shutdown(&self) -> Result<Receiver<DaemonStatus>> {
        let (resp_s, resp_r) = bounded(1);
        self.send_cmd(Command::Exit(resp_s))?;
        Ok(resp_r)
    }
}

/// Validates a hostname base label: what goes before `.local.` / `.site.`.
fn check_hostname(hostname: &str) -> Result<()> {
    if hostname.is_empty() || hostname.len() > crate::dns_parser::MAX_LABEL_LEN {
        return Err(Error::InvalidParam(format!(
            "hostname must be 1-{} bytes, got {}",
            crate::dns_parser::MAX_LABEL_LEN,
            hostname.len()
        )));
    }
    if !hostname
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-')
    {
        return Err(Error::InvalidParam(format!(
            "hostname '{}' must contain only letters, digits and hyphens",
            hostname
        )));
    }
    Ok(())
}

/// Classifies a name into a variant by its top-level domain.
pub fn variant_for_name(name: &str) -> Result<ServiceVariant> {
    if ServiceVariant::Mdns.owns_name(name) {
        Ok(ServiceVariant::Mdns)
    } else if ServiceVariant::Xmdns.owns_name(name) {
        Ok(ServiceVariant::Xmdns)
    } else {
        Err(Error::InvalidParam(format!(
            "name '{}' is neither under 'local' nor 'site'",
            name
        )))
    }
}

/// The reverse-lookup name for an IPv4 address, e.g. `5.0.0.10.in-addr.arpa.`
fn reverse_name(ip: Ipv4Addr) -> String {
    let octets = ip.octets();
    format!(
        "{}.{}.{}.{}.in-addr.arpa.",
        octets[3], octets[2], octets[1], octets[0]
    )
}

/// The records an identity claims: the host A record, the reverse PTR, and
/// an NSEC asserting that only A exists under the hostname.
fn identity_records(hostname: &str, ip: Ipv4Addr) -> Vec<DnsRecord> {
    vec![
        DnsRecord::own(hostname, RData::A(ip)),
        DnsRecord::own(&reverse_name(ip), RData::Ptr(hostname.to_string())),
        DnsRecord::own(
            hostname,
            RData::Nsec {
                next_name: hostname.to_string(),
                type_bitmap: crate::dns_parser::nsec_type_bitmap(&[RRType::A]),
            },
        ),
    ]
}

/// Picks the host's IPv4 address: the first non-loopback interface address,
/// preferring a routable one over link-local.
fn host_ipv4() -> Result<Ipv4Addr> {
    let ifaddrs =
        if_addrs::get_if_addrs().map_err(|e| e_fmt!("failed to list interfaces: {}", e))?;
    let mut link_local = None;
    for intf in ifaddrs {
        if intf.is_loopback() {
            continue;
        }
        if let IpAddr::V4(ip) = intf.ip() {
            if ip.is_link_local() {
                link_local.get_or_insert(ip);
            } else {
                return Ok(ip);
            }
        }
    }
    link_local.ok_or_else(|| e_fmt!("no usable IPv4 interface address found"))
}

/// Creates the multicast socket for one variant. The socket binds to the
/// variant's group address, so the kernel only delivers packets sent to that
/// group: which socket a packet arrives on decides its variant.
fn new_variant_socket(variant: ServiceVariant, ip: Ipv4Addr) -> Result<MioUdpSocket> {
    let group = variant.group();
    let addr = SocketAddr::V4(SocketAddrV4::new(group, MDNS_PORT));
    let sock = new_socket(addr, true)?;

    sock.join_multicast_v4(&group, &ip)
        .map_err(|e| e_fmt!("join multicast group {} on addr {}: {}", group, ip, e))?;

    // Set IP_MULTICAST_IF to send packets.
    sock.set_multicast_if_v4(&ip)
        .map_err(|e| e_fmt!("set multicast_if on addr {}: {}", ip, e))?;

    Ok(MioUdpSocket::from_std(UdpSocket::from(sock)))
}

/// Creates a new UDP socket bound to `addr` with the REUSEADDR/REUSEPORT
/// options, so it can share port 5353 with other mDNS responders.
fn new_socket(addr: SocketAddr, non_block: bool) -> Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };

    let fd = Socket::new(domain, socket2::Type::DGRAM, None)
        .map_err(|e| e_fmt!("create socket failed: {}", e))?;

    fd.set_reuse_address(true)
        .map_err(|e| e_fmt!("set ReuseAddr failed: {}", e))?;
    #[cfg(unix)] // this is currently restricted to Unix's in socket2
    fd.set_reuse_port(true)
        .map_err(|e| e_fmt!("set ReusePort failed: {}", e))?;

    if non_block {
        fd.set_nonblocking(true)
            .map_err(|e| e_fmt!("set O_NONBLOCK: {}", e))?;
    }

    fd.bind(&addr.into())
        .map_err(|e| e_fmt!("socket bind to {} failed: {}", &addr, e))?;

    trace!("new socket bind to {}", &addr);
    Ok(fd)
}

/// Whose records a prober is claiming. Selects the scheduler tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ProberRole {
    Host,
    LocalService,
    ProxyService,
}

impl ProberRole {
    const fn probe_tag(self, variant: ServiceVariant) -> SendTag {
        match self {
            Self::Host => SendTag::HostProbe(variant),
            Self::LocalService | Self::ProxyService => SendTag::ServiceProbe(variant),
        }
    }

    const fn announce_tag(self, variant: ServiceVariant) -> SendTag {
        match self {
            Self::Host => SendTag::HostAnnounce(variant),
            Self::LocalService | Self::ProxyService => SendTag::ServiceAnnounce(variant),
        }
    }
}

const fn role_for_kind(kind: RegistrationKind) -> ProberRole {
    match kind {
        RegistrationKind::Local => ProberRole::LocalService,
        RegistrationKind::Proxy => ProberRole::ProxyService,
    }
}

/// A claimed hostname on one variant, with its multicast socket.
struct Identity {
    sock: MioUdpSocket,
    poll_key: usize,
    ip: Ipv4Addr,
    /// The originally requested base label, kept for restarts.
    base_name: String,
    prober: Prober,
    /// Goodbyes are on the wire; the identity is reaped once they drain.
    closing: bool,
}

/// One DNS-SD registration slot (local or proxy).
struct ServiceSlot {
    reg: ServiceRegistration,
    prober: Prober,
}

/// What a pending query is waiting to report.
enum QueryWant {
    Browse {
        ty_domain: String,
        resp: Sender<Result<Vec<String>>>,
    },
    Lookup {
        fullname: String,
        resp: Sender<Result<ResolvedService>>,
    },
    HostAddr {
        name: String,
        resp: Sender<Result<Ipv4Addr>>,
    },
}

struct PendingQuery {
    /// UNIX timestamp in millis when the wait budget runs out.
    deadline: u64,
    want: QueryWant,
}

/// A query we multicast recently, kept to recognize our own echo.
struct SentQuery {
    name: String,
    ty: RRType,
    when: u64,
}

struct Engine {
    /// Waits for incoming packets and command signals.
    poller: Poll,

    /// Socket for signaling.
    signal_sock: MioUdpSocket,

    /// Map poll id to variant.
    poll_ids: HashMap<usize, ServiceVariant>,

    /// Next poll id value.
    poll_id_count: usize,

    /// Per-variant claimed identities.
    identities: HashMap<ServiceVariant, Identity>,

    /// The two DNS-SD registration slots.
    local_service: Option<ServiceSlot>,
    proxy_service: Option<ServiceSlot>,

    /// Received DNS records.
    cache: DnsCache,

    /// Outgoing packets waiting for their moment.
    scheduler: SendScheduler,

    /// Browse / lookup / address queries waiting for answers.
    pending_queries: Vec<PendingQuery>,

    /// Recently multicast queries of our own.
    sent_queries: Vec<SentQuery>,

    probe_timing: ProbeTiming,

    /// Timestamps marking where the run loop needs another iteration.
    timers: BinaryHeap<Reverse<u64>>,
}

impl Engine {
    fn daemon_thread(signal_sock: MioUdpSocket, poller: Poll, receiver: Receiver<Command>) {
        let engine = Self::new(signal_sock, poller);

        if let Some(cmd) = Self::run(engine, receiver) {
            match cmd {
                Command::Exit(resp_s) => {
                    if let Err(e) = resp_s.send(DaemonStatus::Shutdown) {
                        debug!("exit: failed to send response of shutdown: {}", e);
                    }
                }
                _ => {
                    debug!("unexpected command at exit: {:?}", cmd);
                }
            }
        }
    }

    fn new(signal_sock: MioUdpSocket, poller: Poll) -> Self {
        Self {
            poller,
            signal_sock,
            poll_ids: HashMap::new(),
            poll_id_count: 0,
            identities: HashMap::new(),
            local_service: None,
            proxy_service: None,
            cache: DnsCache::new(),
            scheduler: SendScheduler::new(),
            pending_queries: Vec::new(),
            sent_queries: Vec::new(),
            probe_timing: ProbeTiming::default(),
            timers: BinaryHeap::new(),
        }
    }

    /// The main event loop of the engine thread.
    ///
    /// In each round, it will:
    /// 1. poll the sockets with a timeout from the earliest deadline.
    /// 2. process incoming packets if any.
    /// 3. try_recv on its channel and execute commands.
    /// 4. drive prober timeouts and flush due scheduler entries.
    /// 5. sweep the cache and reply to timed-out queries.
    fn run(mut engine: Engine, receiver: Receiver<Command>) -> Option<Command> {
        if let Err(e) = engine.poller.registry().register(
            &mut engine.signal_sock,
            Token(SIGNAL_SOCK_EVENT_KEY),
            mio::Interest::READABLE,
        ) {
            debug!("failed to add signal socket to the poller: {}", e);
            return None;
        }

        let mut next_ip_check = current_time_millis() + IP_CHECK_INTERVAL_MILLIS;
        engine.add_timer(next_ip_check);

        let mut events = mio::Events::with_capacity(1024);
        loop {
            let now = current_time_millis();

            let timeout = engine.next_wake().map(|wake| {
                let millis = if wake > now { wake - now } else { 1 };
                Duration::from_millis(millis)
            });

            events.clear();
            match engine.poller.poll(&mut events, timeout) {
                Ok(_) => engine.handle_poller_events(&events),
                Err(e) => debug!("failed to select from sockets: {}", e),
            }

            let now = current_time_millis();

            // Remove passed timers.
            while let Some(Reverse(timer)) = engine.timers.peek().copied() {
                if now >= timer {
                    engine.timers.pop();
                } else {
                    break;
                }
            }

            // Process commands from the command channel.
            while let Ok(command) = receiver.try_recv() {
                if matches!(command, Command::Exit(_)) {
                    engine.exec_exit();
                    return Some(command);
                }
                engine.exec_command(command, now);
            }

            engine.drive_prober_timeouts(now);
            engine.flush_scheduler(now);
            engine.reap_closing_identities();
            engine.flush_pending_queries(now);
            engine.prune_sent_queries(now);
            engine.cache.sweep_expired(now);

            if now >= next_ip_check {
                next_ip_check = now + IP_CHECK_INTERVAL_MILLIS;
                engine.check_ip_changes(now);
                engine.add_timer(next_ip_check);
            }
        }
    }

    fn handle_poller_events(&mut self, events: &mio::Events) {
        for ev in events.iter() {
            trace!("event received with key {:?}", ev.token());
            if ev.token().0 == SIGNAL_SOCK_EVENT_KEY {
                // Drain signals as we will drain commands as well.
                self.signal_sock_drain();

                if let Err(e) = self.poller.registry().reregister(
                    &mut self.signal_sock,
                    ev.token(),
                    mio::Interest::READABLE,
                ) {
                    debug!("failed to modify poller for signal socket: {}", e);
                }
                continue; // Next event.
            }

            let variant = match self.poll_ids.get(&ev.token().0) {
                Some(variant) => *variant,
                None => {
                    debug!("variant for event key {} not found", ev.token().0);
                    continue;
                }
            };

            // Read until no more packets available.
            while self.handle_read(variant) {}

            if let Some(identity) = self.identities.get_mut(&variant) {
                if let Err(e) = self.poller.registry().reregister(
                    &mut identity.sock,
                    ev.token(),
                    mio::Interest::READABLE,
                ) {
                    debug!("modify poller for {}: {}", variant, e);
                }
            }
        }
    }

    fn signal_sock_drain(&self) {
        let mut signal_buf = [0; 1024];

        // This recv is non-blocking as the socket is non-blocking.
        while let Ok(sz) = self.signal_sock.recv(&mut signal_buf) {
            trace!(
                "signal socket recvd: {}",
                String::from_utf8_lossy(&signal_buf[0..sz])
            );
        }
    }

    /// Reads one packet off a variant's socket. Returns false when the
    /// socket would block (or the variant is gone).
    fn handle_read(&mut self, variant: ServiceVariant) -> bool {
        let mut buf = vec![0u8; MAX_MSG_ABSOLUTE];
        let (sz, src) = {
            let identity = match self.identities.get(&variant) {
                Some(identity) => identity,
                None => return false,
            };
            match identity.sock.recv_from(&mut buf) {
                Ok(received) => received,
                Err(_) => return false,
            }
        };
        buf.truncate(sz);

        match DnsIncoming::new(buf) {
            Ok(msg) => {
                let now = current_time_millis();
                if msg.is_query() {
                    self.handle_query_msg(&msg, src, variant, now);
                } else {
                    self.handle_response_msg(&msg, variant, now);
                }
            }
            Err(e) => debug!("{}: invalid packet from {}: {}", variant, src, e),
        }
        true
    }

    fn handle_query_msg(
        &mut self,
        msg: &DnsIncoming,
        src: SocketAddr,
        variant: ServiceVariant,
        now: u64,
    ) {
        // A query with authorities may be a simultaneous probe: run the
        // tie-break in every prober on this variant.
        let actions = match self.identities.get_mut(&variant) {
            Some(identity) => identity.prober.on_query(msg, now),
            None => Vec::new(),
        };
        self.apply_actions(variant, ProberRole::Host, actions, now);
        for role in [ProberRole::LocalService, ProberRole::ProxyService] {
            let actions = match self.slot_mut(role) {
                Some(slot) if slot.reg.variant() == variant => slot.prober.on_query(msg, now),
                _ => continue,
            };
            self.apply_actions(variant, role, actions, now);
        }

        if self.is_own_query(msg, now) {
            trace!("{}: ignoring our own multicast query echo", variant);
            return;
        }

        let own = self.visible_records(variant);
        let types = self.service_types(variant);
        let plan = match responder::handle_query(msg, &own, &types, variant) {
            Some(plan) => plan,
            None => return,
        };

        let dest = if plan.unicast {
            src
        } else {
            variant.group_sockaddr()
        };
        for packet in plan.out.to_data_on_wire() {
            if plan.delay_ms == 0 {
                self.send_packet(&packet, dest, variant);
            } else {
                self.scheduler.enqueue(PendingSend::once_after(
                    packet,
                    dest,
                    plan.delay_ms,
                    now,
                    SendTag::Generic,
                ));
            }
        }
    }

    fn handle_response_msg(&mut self, msg: &DnsIncoming, variant: ServiceVariant, now: u64) {
        // Conflicts with names still being probed.
        let actions = match self.identities.get_mut(&variant) {
            Some(identity) => identity.prober.on_response(msg, now),
            None => Vec::new(),
        };
        self.apply_actions(variant, ProberRole::Host, actions, now);
        for role in [ProberRole::LocalService, ProberRole::ProxyService] {
            let actions = match self.slot_mut(role) {
                Some(slot) if slot.reg.variant() == variant => slot.prober.on_response(msg, now),
                _ => continue,
            };
            self.apply_actions(variant, role, actions, now);
        }

        // Steady-state conflicts with already claimed names.
        let own = self.visible_records(variant);
        if let Some(conflicted) = responder::find_conflict(msg, &own) {
            self.handle_steady_conflict(variant, &conflicted, now);
        }

        // Everything else feeds the cache, honoring goodbyes. A withdrawn
        // PTR takes the cached records of its target instance with it, and
        // a withdrawn SRV takes the instance's TXT.
        for record in msg.answers().iter().chain(msg.additionals().iter()) {
            if record.is_goodbye() {
                match record.rdata() {
                    RData::Ptr(target) => {
                        if let Ok(encoded) = crate::dns_parser::encode_name(target) {
                            self.cache.delete_by_data_match(&encoded);
                        }
                    }
                    RData::Srv { .. } => {
                        self.cache.delete_by_name_type(record.name(), RRType::TXT);
                    }
                    _ => {}
                }
            }
            self.cache.upsert(record.clone(), now);
        }

        self.flush_pending_queries(now);
    }

    /// Another host answered for one of our claimed unique names: re-probe,
    /// which renames if the conflict persists.
    fn handle_steady_conflict(&mut self, variant: ServiceVariant, name: &str, now: u64) {
        let mut matching_role = None;
        for role in [ProberRole::LocalService, ProberRole::ProxyService] {
            if let Some(slot) = self.slot_ref(role) {
                if crate::dns_parser::names_equal(slot.prober.subject(), name) {
                    matching_role = Some(role);
                    break;
                }
            }
        }

        if let Some(role) = matching_role {
            debug!(
                "{}: service name conflict on '{}', re-probing",
                variant, name
            );
            self.scheduler.purge(role.announce_tag(variant));
            let timing = self.probe_timing;
            let mut actions = Vec::new();
            let mut old_records = Vec::new();
            if let Some(slot) = self.slot_mut(role) {
                let records = slot.prober.records().to_vec();
                old_records = records.clone();
                let subject = slot.prober.subject().to_string();
                let mut prober = Prober::new(&subject, records, timing);
                actions = prober.start(now, false);
                slot.prober = prober;
            }
            // The records are contested again; they stop being cached facts
            // until the re-probe settles.
            self.uncache_own_records(&old_records);
            self.apply_actions(variant, role, actions, now);
            return;
        }

        let is_host = self
            .identities
            .get(&variant)
            .map(|identity| {
                identity
                    .prober
                    .records()
                    .iter()
                    .any(|r| crate::dns_parser::names_equal(r.name(), name))
            })
            .unwrap_or(false);
        if is_host {
            debug!("{}: hostname conflict on '{}', restarting", variant, name);
            if let Err(e) = self.restart_identity(variant, None, now) {
                debug!("{}: restart after conflict failed: {}", variant, e);
            }
        }
    }

    /// Whether `msg` is just the multicast echo of a query we sent.
    fn is_own_query(&self, msg: &DnsIncoming, now: u64) -> bool {
        if msg.num_authorities() > 0 || msg.questions().is_empty() {
            return false;
        }
        msg.questions().iter().all(|q| {
            self.sent_queries.iter().any(|sent| {
                now.saturating_sub(sent.when) < OWN_QUERY_ECHO_MILLIS
                    && sent.ty == q.ty()
                    && crate::dns_parser::names_equal(&sent.name, q.name())
            })
        })
    }

    /// The records this variant currently answers for: identity records plus
    /// the records of settled (announcing or active) registrations.
    fn visible_records(&self, variant: ServiceVariant) -> Vec<DnsRecord> {
        let mut records = Vec::new();
        if let Some(identity) = self.identities.get(&variant) {
            if !identity.closing && prober_settled(&identity.prober) {
                records.extend(identity.prober.records().iter().cloned());
            }
        }
        for slot in self.local_service.iter().chain(self.proxy_service.iter()) {
            if slot.reg.variant() == variant && prober_settled(&slot.prober) {
                records.extend(slot.prober.records().iter().cloned());
            }
        }
        records
    }

    /// The service type names registered on this variant, for the meta-query.
    fn service_types(&self, variant: ServiceVariant) -> Vec<String> {
        self.local_service
            .iter()
            .chain(self.proxy_service.iter())
            .filter(|slot| slot.reg.variant() == variant && prober_settled(&slot.prober))
            .map(|slot| slot.reg.ty_domain())
            .collect()
    }

    fn slot_ref(&self, role: ProberRole) -> Option<&ServiceSlot> {
        match role {
            ProberRole::LocalService => self.local_service.as_ref(),
            ProberRole::ProxyService => self.proxy_service.as_ref(),
            ProberRole::Host => None,
        }
    }

    fn slot_mut(&mut self, role: ProberRole) -> Option<&mut ServiceSlot> {
        match role {
            ProberRole::LocalService => self.local_service.as_mut(),
            ProberRole::ProxyService => self.proxy_service.as_mut(),
            ProberRole::Host => None,
        }
    }

    fn apply_actions(
        &mut self,
        variant: ServiceVariant,
        role: ProberRole,
        actions: Vec<crate::probe::ProbeAction>,
        now: u64,
    ) {
        use crate::probe::ProbeAction;

        for action in actions {
            match action {
                ProbeAction::SendProbe(out) => {
                    for packet in out.to_data_on_wire() {
                        self.send_packet(&packet, variant.group_sockaddr(), variant);
                    }
                }
                ProbeAction::Announce(records) => {
                    // The claimed records join the cache as own entries,
                    // next to everything learned from the network.
                    for record in records.iter() {
                        self.cache.upsert(record.clone(), now);
                    }
                    let out = Prober::build_announcement(&records);
                    for packet in out.to_data_on_wire() {
                        self.scheduler.enqueue(PendingSend::repeated(
                            packet,
                            variant.group_sockaddr(),
                            ANNOUNCE_REPEAT,
                            ANNOUNCE_INTERVAL_MILLIS,
                            2,
                            role.announce_tag(variant),
                        ));
                    }
                }
                ProbeAction::Renamed { old, new } => {
                    debug!("{}: '{}' renamed to '{}' after conflict", variant, old, new);
                }
                ProbeAction::BecameActive => {
                    debug!("{}: {:?} records are now active", variant, role);
                }
            }
        }
    }

    fn drive_prober_timeouts(&mut self, now: u64) {
        let variants: Vec<ServiceVariant> = self.identities.keys().copied().collect();
        for variant in variants {
            let actions = match self.identities.get_mut(&variant) {
                Some(identity) if !identity.closing => identity.prober.on_timeout(now),
                _ => continue,
            };
            self.apply_actions(variant, ProberRole::Host, actions, now);
        }

        for role in [ProberRole::LocalService, ProberRole::ProxyService] {
            let (variant, actions) = match self.slot_mut(role) {
                Some(slot) => (slot.reg.variant(), slot.prober.on_timeout(now)),
                None => continue,
            };
            self.apply_actions(variant, role, actions, now);
        }
    }

    fn flush_scheduler(&mut self, now: u64) {
        for (packet, dest, tag) in self.scheduler.collect_due(now) {
            let variant = match tag {
                SendTag::HostProbe(v)
                | SendTag::HostAnnounce(v)
                | SendTag::ServiceProbe(v)
                | SendTag::ServiceAnnounce(v)
                | SendTag::Goodbye(v) => v,
                SendTag::Generic => match self.variant_for_dest(dest) {
                    Some(v) => v,
                    None => continue,
                },
            };
            self.send_packet(&packet, dest, variant);
        }
    }

    /// Routes a scheduled packet to a socket: by destination group, or for
    /// unicast destinations any running variant will do.
    fn variant_for_dest(&self, dest: SocketAddr) -> Option<ServiceVariant> {
        if let SocketAddr::V4(v4) = dest {
            if let Some(variant) = ServiceVariant::from_group(*v4.ip()) {
                return Some(variant);
            }
        }
        self.identities.keys().next().copied()
    }

    fn send_packet(&self, packet: &[u8], dest: SocketAddr, variant: ServiceVariant) {
        let identity = match self.identities.get(&variant) {
            Some(identity) => identity,
            None => return,
        };
        match identity.sock.send_to(packet, dest) {
            Ok(sz) => trace!("{}: sent {} bytes to {}", variant, sz, dest),
            Err(e) => debug!("{}: send to {} failed: {}", variant, dest, e),
        }
    }

    /// Drops identities whose goodbye packets have all gone out.
    fn reap_closing_identities(&mut self) {
        let done: Vec<ServiceVariant> = self
            .identities
            .iter()
            .filter(|(variant, identity)| {
                identity.closing && !self.scheduler.has_tag(SendTag::Goodbye(**variant))
            })
            .map(|(variant, _)| *variant)
            .collect();
        for variant in done {
            self.remove_identity(variant);
            debug!("{}: identity closed", variant);
        }
    }

    fn remove_identity(&mut self, variant: ServiceVariant) {
        if let Some(identity) = self.identities.remove(&variant) {
            self.poll_ids.remove(&identity.poll_key);
        }
    }

    /// Drops the cached own copies of `records`, by name. Called whenever
    /// announced records are withdrawn or go back to probing.
    fn uncache_own_records(&mut self, records: &[DnsRecord]) {
        for record in records {
            self.cache.delete_own(record.name());
        }
    }

    fn add_timer(&mut self, when: u64) {
        self.timers.push(Reverse(when));
    }

    /// The earliest moment anything needs attention.
    fn next_wake(&self) -> Option<u64> {
        let mut wake = self.timers.peek().map(|Reverse(t)| *t);

        let mut fold = |candidate: Option<u64>| {
            if let Some(c) = candidate {
                wake = Some(match wake {
                    Some(w) => w.min(c),
                    None => c,
                });
            }
        };

        fold(self.scheduler.next_deadline());
        for identity in self.identities.values() {
            fold(identity.prober.deadline());
        }
        for slot in self.local_service.iter().chain(self.proxy_service.iter()) {
            fold(slot.prober.deadline());
        }
        fold(self.pending_queries.iter().map(|pq| pq.deadline).min());
        wake
    }

    /// Replies to pending queries that are answerable now, and to those
    /// whose wait budget ran out.
    fn flush_pending_queries(&mut self, now: u64) {
        let mut i = 0;
        while i < self.pending_queries.len() {
            let due = now >= self.pending_queries[i].deadline;
            let ready = self.query_ready(&self.pending_queries[i].want);
            if ready || due {
                let pending = self.pending_queries.remove(i);
                self.reply_query(pending.want);
            } else {
                i += 1;
            }
        }
    }

    /// Browse always waits out its budget; lookups and address queries can
    /// complete as soon as the decisive record lands in the cache.
    fn query_ready(&self, want: &QueryWant) -> bool {
        match want {
            QueryWant::Browse { .. } => false,
            QueryWant::Lookup { fullname, .. } => {
                !self.cache.lookup_exact(fullname, RRType::SRV).is_empty()
            }
            QueryWant::HostAddr { name, .. } => {
                !self.cache.lookup_exact(name, RRType::A).is_empty()
            }
        }
    }

    fn reply_query(&mut self, want: QueryWant) {
        match want {
            QueryWant::Browse { ty_domain, resp } => {
                // Suffix containment rather than exact-name lookup, so PTR
                // records published under subtypes show up too.
                let encoded = crate::dns_parser::encode_name(&ty_domain).unwrap_or_default();
                let instances: Vec<String> = self
                    .cache
                    .lookup_suffix(&encoded)
                    .iter()
                    .filter(|record| record.rr_type() == RRType::PTR)
                    .filter_map(|record| match record.rdata() {
                        RData::Ptr(target) => Some(target.clone()),
                        _ => None,
                    })
                    .collect();
                if let Err(e) = resp.send(Ok(instances)) {
                    debug!("browse '{}': failed to send reply: {}", ty_domain, e);
                }
            }
            QueryWant::Lookup { fullname, resp } => {
                let result = self.resolve_from_cache(&fullname);
                if let Err(e) = resp.send(result) {
                    debug!("lookup '{}': failed to send reply: {}", fullname, e);
                }
            }
            QueryWant::HostAddr { name, resp } => {
                let result = self
                    .cache
                    .lookup_exact(&name, RRType::A)
                    .first()
                    .and_then(|record| match record.rdata() {
                        RData::A(ip) => Some(*ip),
                        _ => None,
                    })
                    .ok_or(Error::NotFound);
                if let Err(e) = resp.send(result) {
                    debug!("get addr '{}': failed to send reply: {}", name, e);
                }
            }
        }
    }

    fn resolve_from_cache(&self, fullname: &str) -> Result<ResolvedService> {
        let srv = self
            .cache
            .lookup_exact(fullname, RRType::SRV)
            .into_iter()
            .next()
            .ok_or(Error::NotFound)?;
        let (host, port) = match srv.rdata() {
            RData::Srv { host, port, .. } => (host.clone(), *port),
            _ => return Err(Error::NotFound),
        };

        let txt_properties = self
            .cache
            .lookup_exact(fullname, RRType::TXT)
            .first()
            .map(|record| match record.rdata() {
                RData::Txt(bytes) => decode_txt(bytes),
                _ => Vec::new(),
            })
            .unwrap_or_default();

        let address = self
            .cache
            .lookup_exact(&host, RRType::A)
            .first()
            .and_then(|record| match record.rdata() {
                RData::A(ip) => Some(*ip),
                _ => None,
            });

        Ok(ResolvedService {
            fullname: fullname.to_string(),
            host,
            port,
            address,
            txt_properties,
        })
    }

    fn prune_sent_queries(&mut self, now: u64) {
        self.sent_queries
            .retain(|sent| now.saturating_sub(sent.when) < OWN_QUERY_ECHO_MILLIS);
    }

    /// Multicasts a query, attaching known answers from the cache so remote
    /// responders can suppress what we already hold. Identical questions
    /// already on the wire within the echo window are not repeated.
    fn send_query(&mut self, variant: ServiceVariant, name: &str, types: &[RRType], now: u64) {
        let name = name.to_lowercase();
        let types: Vec<RRType> = types
            .iter()
            .copied()
            .filter(|ty| {
                !self.sent_queries.iter().any(|sent| {
                    sent.ty == *ty
                        && sent.name == name
                        && now.saturating_sub(sent.when) < OWN_QUERY_ECHO_MILLIS
                })
            })
            .collect();
        if types.is_empty() {
            return;
        }

        let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
        for ty in &types {
            out.add_question(&name, *ty);
            for known in self.cache.known_answers(&name, *ty, now) {
                out.add_known_answer(known, now);
            }
        }
        for packet in out.to_data_on_wire() {
            self.send_packet(&packet, variant.group_sockaddr(), variant);
        }
        for ty in types {
            self.sent_queries.push(SentQuery {
                name: name.clone(),
                ty,
                when: now,
            });
        }
    }

    /// The entry point that executes all commands received by the daemon.
    fn exec_command(&mut self, command: Command, now: u64) {
        match command {
            Command::Start(variant, hostname, skip_probe, resp) => {
                let result = self.start_identity(variant, &hostname, skip_probe, now);
                if let Err(e) = resp.send(result) {
                    debug!("start: failed to send response: {}", e);
                }
            }
            Command::Stop(variant, resp) => {
                let result = self.stop_identity(variant);
                if let Err(e) = resp.send(result) {
                    debug!("stop: failed to send response: {}", e);
                }
            }
            Command::StopAll => {
                for variant in [ServiceVariant::Mdns, ServiceVariant::Xmdns] {
                    if self.running(variant) {
                        let _ = self.stop_identity(variant);
                    }
                }
            }
            Command::RestartAll => {
                for variant in [ServiceVariant::Mdns, ServiceVariant::Xmdns] {
                    if self.running(variant) {
                        if let Err(e) = self.restart_identity(variant, None, now) {
                            debug!("{}: restart failed: {}", variant, e);
                        }
                    }
                }
            }
            Command::ChangeHostname(variant, hostname, resp) => {
                let result = self.restart_identity(variant, Some(hostname), now);
                if let Err(e) = resp.send(result) {
                    debug!("change_hostname: failed to send response: {}", e);
                }
            }
            Command::RegisterService(registration, resp) => {
                let result = self.register_service(*registration, now);
                if let Err(e) = resp.send(result) {
                    debug!("register: failed to send response: {}", e);
                }
            }
            Command::UnregisterService(kind, resp) => {
                let result = self.unregister_service(kind);
                if let Err(e) = resp.send(result) {
                    debug!("unregister: failed to send response: {}", e);
                }
            }
            Command::Browse(ty_domain, wait, resp) => {
                match self.start_pending_query(&ty_domain, &[RRType::PTR], now) {
                    Ok(()) => self.pending_queries.push(PendingQuery {
                        deadline: now + wait,
                        want: QueryWant::Browse { ty_domain, resp },
                    }),
                    Err(e) => {
                        if let Err(e) = resp.send(Err(e)) {
                            debug!("browse: failed to send error: {}", e);
                        }
                    }
                }
            }
            Command::Lookup(fullname, wait, resp) => {
                match self.start_pending_query(&fullname, &[RRType::SRV, RRType::TXT], now) {
                    Ok(()) => self.pending_queries.push(PendingQuery {
                        deadline: now + wait,
                        want: QueryWant::Lookup { fullname, resp },
                    }),
                    Err(e) => {
                        if let Err(e) = resp.send(Err(e)) {
                            debug!("lookup: failed to send error: {}", e);
                        }
                    }
                }
            }
            Command::Query(name, ty, variant) => {
                if self.running(variant) {
                    self.send_query(variant, &name, &[ty], now);
                } else {
                    debug!("{}: query '{}' dropped, variant not running", variant, name);
                }
            }
            Command::GetAddr(name, wait, resp) => {
                match self.start_pending_query(&name, &[RRType::A], now) {
                    Ok(()) => {
                        self.pending_queries.push(PendingQuery {
                            deadline: now + wait,
                            want: QueryWant::HostAddr { name, resp },
                        });
                        // An answer may already sit in the cache.
                        self.flush_pending_queries(now);
                    }
                    Err(e) => {
                        if let Err(e) = resp.send(Err(e)) {
                            debug!("get addr: failed to send error: {}", e);
                        }
                    }
                }
            }
            Command::GetProbeTiming(resp) => {
                if let Err(e) = resp.send(self.probe_timing) {
                    debug!("get probe timing: failed to send response: {}", e);
                }
            }
            Command::SetProbeTiming(timing) => {
                debug!("probe timing set to {:?}", timing);
                self.probe_timing = timing;
            }
            Command::GetStatus(variant, resp) => {
                let status = match self.identities.get(&variant) {
                    Some(identity) if !identity.closing => VariantStatus {
                        running: true,
                        probing: !identity.prober.is_active(),
                        hostname: Some(identity.prober.subject().to_string()),
                        address: Some(identity.ip),
                    },
                    _ => VariantStatus {
                        running: false,
                        probing: false,
                        hostname: None,
                        address: None,
                    },
                };
                if let Err(e) = resp.send(status) {
                    debug!("status: failed to send response: {}", e);
                }
            }
            Command::CacheDump(resp) => {
                trace!("cache dump: {} records", self.cache.record_count());
                if let Err(e) = resp.send(self.cache.dump()) {
                    debug!("cache dump: failed to send response: {}", e);
                }
            }
            Command::Exit(_) => {
                debug!("unexpected Exit in exec_command");
            }
        }
    }

    fn running(&self, variant: ServiceVariant) -> bool {
        self.identities
            .get(&variant)
            .map(|identity| !identity.closing)
            .unwrap_or(false)
    }

    /// Validates and multicasts the query backing a browse / lookup /
    /// address request. The variant of the queried name must be running.
    fn start_pending_query(&mut self, name: &str, types: &[RRType], now: u64) -> Result<()> {
        let variant = variant_for_name(name)?;
        if !self.running(variant) {
            return Err(Error::NotRunning);
        }
        self.send_query(variant, name, types, now);
        Ok(())
    }

    fn start_identity(
        &mut self,
        variant: ServiceVariant,
        base_name: &str,
        skip_probe: bool,
        now: u64,
    ) -> Result<()> {
        if self.identities.contains_key(&variant) {
            return Err(Error::AlreadyRunning);
        }
        check_hostname(base_name)?;

        let ip = host_ipv4()?;
        let mut sock = new_variant_socket(variant, ip)?;

        let poll_key = self.poll_id_count;
        self.poll_id_count += 1;
        self.poller
            .registry()
            .register(&mut sock, Token(poll_key), mio::Interest::READABLE)
            .map_err(|e| e_fmt!("add socket of {} to poller: {}", variant, e))?;
        self.poll_ids.insert(poll_key, variant);

        let base_name = base_name.to_lowercase();
        let hostname = format!("{}.{}.", base_name, variant.domain());
        let records = identity_records(&hostname, ip);
        let mut prober = Prober::new(&hostname, records, self.probe_timing);
        let actions = prober.start(now, skip_probe);

        debug!("{}: starting identity '{}' on {}", variant, hostname, ip);
        self.identities.insert(
            variant,
            Identity {
                sock,
                poll_key,
                ip,
                base_name,
                prober,
                closing: false,
            },
        );
        self.apply_actions(variant, ProberRole::Host, actions, now);
        Ok(())
    }

    fn stop_identity(&mut self, variant: ServiceVariant) -> Result<()> {
        if !self.running(variant) {
            return Err(Error::NotRunning);
        }

        // Collect goodbye records before anything is torn down.
        let mut records = self.visible_records(variant);
        self.uncache_own_records(&records);

        // Registrations on this variant go away with the identity.
        for role in [ProberRole::LocalService, ProberRole::ProxyService] {
            let belongs = self
                .slot_ref(role)
                .map(|slot| slot.reg.variant() == variant)
                .unwrap_or(false);
            if belongs {
                self.scheduler.purge(role.probe_tag(variant));
                self.scheduler.purge(role.announce_tag(variant));
                match role {
                    ProberRole::LocalService => self.local_service = None,
                    ProberRole::ProxyService => self.proxy_service = None,
                    ProberRole::Host => {}
                }
            }
        }

        self.scheduler.purge(SendTag::HostProbe(variant));
        self.scheduler.purge(SendTag::HostAnnounce(variant));

        if records.is_empty() {
            // Nothing was announced yet; no goodbye owed.
            self.remove_identity(variant);
            debug!("{}: identity stopped before announcing", variant);
            return Ok(());
        }

        records.sort_by(|a, b| a.name().cmp(b.name()));
        records.dedup_by(|a, b| a.matches(b));
        let out = goodbye_outgoing(&records);
        for packet in out.to_data_on_wire() {
            self.scheduler.enqueue(PendingSend::repeated(
                packet,
                variant.group_sockaddr(),
                GOODBYE_REPEAT,
                GOODBYE_INTERVAL_MILLIS,
                1,
                SendTag::Goodbye(variant),
            ));
        }
        if let Some(identity) = self.identities.get_mut(&variant) {
            identity.closing = true;
        }
        debug!("{}: stopping, goodbyes queued", variant);
        Ok(())
    }

    /// The restart flow: drop the identity without goodbyes (the records are
    /// about to be re-claimed), re-read the interface address and probe
    /// again. `new_base` switches the hostname.
    fn restart_identity(
        &mut self,
        variant: ServiceVariant,
        new_base: Option<String>,
        now: u64,
    ) -> Result<()> {
        let base_name = match self.identities.get(&variant) {
            Some(identity) if !identity.closing => identity.base_name.clone(),
            _ => return Err(Error::NotRunning),
        };
        let base_name = new_base.unwrap_or(base_name);

        self.scheduler.purge(SendTag::HostProbe(variant));
        self.scheduler.purge(SendTag::HostAnnounce(variant));
        let host_records = self
            .identities
            .get(&variant)
            .map(|identity| identity.prober.records().to_vec())
            .unwrap_or_default();
        self.uncache_own_records(&host_records);
        self.remove_identity(variant);

        self.start_identity(variant, &base_name, false, now)
    }

    fn register_service(&mut self, reg: ServiceRegistration, now: u64) -> Result<()> {
        let variant = reg.variant();
        let identity = match self.identities.get(&variant) {
            Some(identity) if !identity.closing => identity,
            _ => return Err(Error::NotRunning),
        };
        if !identity.prober.is_active() {
            // The hostname is not settled; SRV targets could change.
            return Err(Error::InProgress);
        }
        let host = identity.prober.subject().to_string();

        let role = role_for_kind(reg.kind());
        if self.slot_ref(role).is_some() {
            return Err(Error::AlreadyRegistered);
        }

        let records = reg.records(&host);
        let mut prober = Prober::new(&reg.fullname(), records, self.probe_timing);
        let actions = prober.start(now, false);

        debug!("{}: registering service '{}'", variant, reg.fullname());
        let slot = ServiceSlot { reg, prober };
        match role {
            ProberRole::LocalService => self.local_service = Some(slot),
            ProberRole::ProxyService => self.proxy_service = Some(slot),
            ProberRole::Host => {}
        }
        self.apply_actions(variant, role, actions, now);
        Ok(())
    }

    fn unregister_service(&mut self, kind: RegistrationKind) -> Result<()> {
        let role = role_for_kind(kind);
        let slot = match role {
            ProberRole::LocalService => self.local_service.take(),
            ProberRole::ProxyService => self.proxy_service.take(),
            ProberRole::Host => None,
        }
        .ok_or(Error::NotFound)?;

        let variant = slot.reg.variant();
        self.scheduler.purge(role.probe_tag(variant));
        self.scheduler.purge(role.announce_tag(variant));
        self.uncache_own_records(slot.prober.records());

        if prober_settled(&slot.prober) {
            let out = goodbye_outgoing(slot.prober.records());
            for packet in out.to_data_on_wire() {
                self.scheduler.enqueue(PendingSend::repeated(
                    packet,
                    variant.group_sockaddr(),
                    GOODBYE_REPEAT,
                    GOODBYE_INTERVAL_MILLIS,
                    1,
                    SendTag::Goodbye(variant),
                ));
            }
        }
        debug!(
            "{}: unregistered service '{}'",
            variant,
            slot.prober.subject()
        );
        Ok(())
    }

    /// On exit every announced record gets a best-effort immediate goodbye.
    fn exec_exit(&mut self) {
        for variant in [ServiceVariant::Mdns, ServiceVariant::Xmdns] {
            let records = self.visible_records(variant);
            if records.is_empty() {
                continue;
            }
            let out = goodbye_outgoing(&records);
            for packet in out.to_data_on_wire() {
                self.send_packet(&packet, variant.group_sockaddr(), variant);
            }
        }
        debug!("engine exiting");
    }

    /// Restarts identities whose interface address changed since start.
    fn check_ip_changes(&mut self, now: u64) {
        let current = match host_ipv4() {
            Ok(ip) => ip,
            Err(e) => {
                debug!("ip check failed: {}", e);
                return;
            }
        };
        let changed: Vec<ServiceVariant> = self
            .identities
            .iter()
            .filter(|(_, identity)| !identity.closing && identity.ip != current)
            .map(|(variant, _)| *variant)
            .collect();
        for variant in changed {
            debug!("{}: interface address changed to {}", variant, current);
            if let Err(e) = self.restart_identity(variant, None, now) {
                debug!("{}: restart after ip change failed: {}", variant, e);
            }
        }
    }
}

fn prober_settled(prober: &Prober) -> bool {
    matches!(
        prober.state(),
        crate::probe::ProbeState::Announcing | crate::probe::ProbeState::Active
    )
}

/// A response withdrawing `records`: same answers with TTL zero.
fn goodbye_outgoing(records: &[DnsRecord]) -> DnsOutgoing {
    let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
    for record in records {
        let mut bye = DnsRecord::new(record.name(), CLASS_IN, 0, record.rdata().clone());
        bye.set_cache_flush(record.cache_flush());
        out.add_answer(bye);
    }
    out
}

enum Command {
    /// Start a variant: (variant, base hostname, skip_probe, response channel).
    Start(ServiceVariant, String, bool, Sender<Result<()>>),

    /// Stop a variant with goodbye packets.
    Stop(ServiceVariant, Sender<Result<()>>),

    /// Stop every running variant.
    StopAll,

    /// Restart every running variant (re-read address, re-probe).
    RestartAll,

    /// Restart one variant under a new hostname.
    ChangeHostname(ServiceVariant, String, Sender<Result<()>>),

    /// Register a DNS-SD service (local or proxy).
    RegisterService(Box<ServiceRegistration>, Sender<Result<()>>),

    /// Unregister the active service of this kind.
    UnregisterService(RegistrationKind, Sender<Result<()>>),

    /// Browse a service type: (ty_domain, wait budget in millis, channel).
    Browse(String, u64, Sender<Result<Vec<String>>>),

    /// Resolve a service instance: (fullname, wait budget in millis, channel).
    Lookup(String, u64, Sender<Result<ResolvedService>>),

    /// Multicast a one-shot query.
    Query(String, RRType, ServiceVariant),

    /// Resolve a hostname to an IPv4 address.
    GetAddr(String, u64, Sender<Result<Ipv4Addr>>),

    GetProbeTiming(Sender<ProbeTiming>),

    SetProbeTiming(ProbeTiming),

    /// Get the current status of one variant.
    GetStatus(ServiceVariant, Sender<VariantStatus>),

    /// Read a snapshot of the response cache.
    CacheDump(Sender<Vec<DnsRecord>>),

    Exit(Sender<DaemonStatus>),
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start(..) => write!(f, "Command Start"),
            Self::Stop(..) => write!(f, "Command Stop"),
            Self::StopAll => write!(f, "Command StopAll"),
            Self::RestartAll => write!(f, "Command RestartAll"),
            Self::ChangeHostname(..) => write!(f, "Command ChangeHostname"),
            Self::RegisterService(..) => write!(f, "Command RegisterService"),
            Self::UnregisterService(..) => write!(f, "Command UnregisterService"),
            Self::Browse(..) => write!(f, "Command Browse"),
            Self::Lookup(..) => write!(f, "Command Lookup"),
            Self::Query(..) => write!(f, "Command Query"),
            Self::GetAddr(..) => write!(f, "Command GetAddr"),
            Self::GetProbeTiming(..) => write!(f, "Command GetProbeTiming"),
            Self::SetProbeTiming(..) => write!(f, "Command SetProbeTiming"),
            Self::GetStatus(..) => write!(f, "Command GetStatus"),
            Self::CacheDump(..) => write!(f, "Command CacheDump"),
            Self::Exit(..) => write!(f, "Command Exit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        check_hostname, goodbye_outgoing, identity_records, reverse_name, variant_for_name,
        Engine, ProberRole, ServiceSlot,
    };
    use crate::dns_parser::{DnsIncoming, DnsRecord, RData, RRType, TTL_NEVER_EXPIRE};
    use crate::dns_sd::{RegistrationKind, ServiceRegistration};
    use crate::probe::{ProbeTiming, Prober};
    use crate::responder::ServiceVariant;
    use std::net::Ipv4Addr;

    fn test_engine() -> Engine {
        let poller = mio::Poll::new().unwrap();
        let sock = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sock.set_nonblocking(true).unwrap();
        Engine::new(mio::net::UdpSocket::from_std(sock), poller)
    }

    #[test]
    fn test_check_hostname() {
        assert!(check_hostname("my-host2").is_ok());
        assert!(check_hostname("").is_err());
        assert!(check_hostname("has.dot").is_err());
        assert!(check_hostname("has space").is_err());
        assert!(check_hostname(&"x".repeat(64)).is_err());
    }

    #[test]
    fn test_variant_for_name() {
        assert_eq!(
            variant_for_name("myhost.local.").unwrap(),
            ServiceVariant::Mdns
        );
        assert_eq!(
            variant_for_name("_http._tcp.site.").unwrap(),
            ServiceVariant::Xmdns
        );
        assert!(variant_for_name("example.com.").is_err());
    }

    #[test]
    fn test_reverse_name() {
        assert_eq!(
            reverse_name(Ipv4Addr::new(10, 0, 0, 5)),
            "5.0.0.10.in-addr.arpa."
        );
    }

    #[test]
    fn test_identity_records() {
        let records = identity_records("myhost.local.", Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].rr_type(), RRType::A);
        assert_eq!(records[1].name(), "5.0.0.10.in-addr.arpa.");
        match records[1].rdata() {
            RData::Ptr(target) => assert_eq!(target, "myhost.local."),
            other => panic!("expected PTR, got {:?}", other),
        }
        assert!(records.iter().all(|r| r.cache_flush()));
    }

    #[test]
    fn test_announced_records_enter_cache_as_own() {
        let mut engine = test_engine();
        let records = identity_records("device.local.", Ipv4Addr::new(192, 0, 2, 2));
        let mut prober = Prober::new("device.local.", records, ProbeTiming::default());
        let actions = prober.start(1_000, true);
        engine.apply_actions(ServiceVariant::Mdns, ProberRole::Host, actions, 1_000);

        // The claimed A record sits in the cache with the own-TTL sentinel.
        let dump = engine.cache.dump();
        assert!(dump.iter().any(|r| {
            r.name() == "device.local."
                && r.rr_type() == RRType::A
                && r.ttl() == TTL_NEVER_EXPIRE
        }));
        assert!(dump.iter().all(|r| r.is_own()));

        // Hearing our own multicast echo must not demote it to a finite TTL.
        let echo = DnsRecord::new(
            "device.local.",
            crate::dns_parser::CLASS_IN,
            120,
            RData::A(Ipv4Addr::new(192, 0, 2, 2)),
        );
        engine.cache.upsert(echo, 2_000);
        assert!(engine
            .cache
            .dump()
            .iter()
            .filter(|r| r.rr_type() == RRType::A)
            .all(|r| r.ttl() == TTL_NEVER_EXPIRE));
    }

    #[test]
    fn test_unregister_drops_own_records_from_cache() {
        let mut engine = test_engine();
        let reg =
            ServiceRegistration::new_local("web", "_http._tcp", "local", 8080, &[]).unwrap();
        let variant = reg.variant();
        let records = reg.records("device.local.");
        let mut prober = Prober::new(&reg.fullname(), records, ProbeTiming::default());
        let actions = prober.start(1_000, true);
        engine.local_service = Some(ServiceSlot { reg, prober });
        engine.apply_actions(variant, ProberRole::LocalService, actions, 1_000);
        assert!(engine.cache.dump().iter().any(|r| r.is_own()));

        engine.unregister_service(RegistrationKind::Local).unwrap();
        assert!(engine.cache.dump().iter().all(|r| !r.is_own()));
    }

    #[test]
    fn test_goodbye_has_zero_ttl() {
        let records = vec![DnsRecord::own(
            "myhost.local.",
            RData::A(Ipv4Addr::new(10, 0, 0, 5)),
        )];
        let out = goodbye_outgoing(&records);
        let wire = out.to_data_on_wire().into_iter().next().unwrap();
        let msg = DnsIncoming::new(wire).unwrap();
        assert_eq!(msg.answers().len(), 1);
        assert!(msg.answers()[0].is_goodbye());
    }
}
