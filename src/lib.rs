//! A zero-configuration service discovery library based on mDNS and DNS-SD,
//! with an optional site-scoped xmDNS variant.
//!
//! This library claims a hostname on the `local` (mDNS) and/or `site`
//! (xmDNS) multicast domains, answers queries for it, and can register one
//! local and one proxy DNS-SD service instance. It also browses and resolves
//! services published by other hosts.
//!
//! This library uses one dedicated thread per daemon and does not depend on
//! an async runtime.
//!
//! # Examples
//!
//! ```no_run
//! use zeroconf_sd::{ServiceDaemon, ServiceRegistration, ServiceVariant};
//!
//! let daemon = ServiceDaemon::new().expect("failed to create daemon");
//!
//! // Claim "my-host.local." on the mDNS group, probing for uniqueness.
//! let receiver = daemon
//!     .start(ServiceVariant::Mdns, "my-host", false)
//!     .expect("failed to send start command");
//! receiver.recv().expect("channel closed").expect("start failed");
//!
//! // Publish a web server instance once the hostname has settled.
//! let registration = ServiceRegistration::new_local(
//!     "my-host-web",
//!     "_http._tcp",
//!     "local",
//!     8080,
//!     &[("path", "/")],
//! )
//! .expect("invalid registration");
//! let receiver = daemon.register(registration).expect("failed to send");
//! receiver.recv().expect("channel closed").expect("register failed");
//!
//! // Browse for other web servers on the network.
//! let receiver = daemon.browse("_http._tcp.local.", 500).expect("failed to send");
//! for instance in receiver.recv().expect("channel closed").expect("browse failed") {
//!     println!("found: {}", instance);
//! }
//!
//! daemon.shutdown().expect("failed to send shutdown command");
//! ```

#![forbid(unsafe_code)]

// log for logging (optional).
#[cfg(feature = "logging")]
mod log {
    pub(crate) use log::{debug, trace};
}

#[cfg(not(feature = "logging"))]
#[macro_use]
mod log {
    // Empty definitions when logging is disabled.
    macro_rules! debug {
        ($($arg:tt)*) => {};
    }

    macro_rules! trace {
        ($($arg:tt)*) => {};
    }
}

mod dns_cache;
mod dns_parser;
mod dns_sd;
mod error;
mod probe;
mod responder;
mod sender;
mod service_daemon;

pub use dns_parser::{DnsIncoming, DnsOutgoing, DnsRecord, RData, RRType};
pub use dns_sd::{
    check_service_type, decode_txt, encode_txt, RegistrationKind, ServiceRegistration,
};
pub use error::{Error, Result};
pub use probe::ProbeTiming;
pub use responder::ServiceVariant;
pub use service_daemon::{
    variant_for_name, DaemonStatus, ResolvedService, ServiceDaemon, VariantStatus,
    QUERY_WAIT_DEFAULT_MILLIS,
};

/// Re-export `flume` channel receiver so that the users of this crate do not
/// have to depend on `flume` explicitly.
pub use flume::Receiver;
