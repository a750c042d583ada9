//! Tests of the daemon API that do not depend on multicast reachability.
//!
//! Anything that needs a second responder on the network lives elsewhere;
//! these run fine in a sandbox.

use zeroconf_sd::{
    DaemonStatus, Error, ProbeTiming, RRType, ServiceDaemon, ServiceVariant,
};

#[test_log::test]
fn daemon_shutdown() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");
    let receiver = daemon.shutdown().expect("failed to send shutdown");
    let status = receiver.recv().expect("channel closed");
    assert_eq!(status, DaemonStatus::Shutdown);
}

#[test_log::test]
fn probe_timing_roundtrip() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    let timing = daemon
        .probe_timing()
        .expect("failed to send")
        .recv()
        .expect("channel closed");
    assert_eq!(timing, ProbeTiming::default());

    let custom = ProbeTiming {
        probe_ms: 500,
        ..ProbeTiming::default()
    };
    daemon.set_probe_timing(custom).expect("failed to send");

    let timing = daemon
        .probe_timing()
        .expect("failed to send")
        .recv()
        .expect("channel closed");
    assert_eq!(timing, custom);

    daemon.shutdown().expect("failed to send shutdown");
}

#[test_log::test]
fn start_rejects_bad_hostname() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    // Checked on the caller side, before the command is sent.
    let result = daemon.start(ServiceVariant::Mdns, "bad.name", false);
    assert!(matches!(result, Err(Error::InvalidParam(_))));

    let result = daemon.start(ServiceVariant::Mdns, "", false);
    assert!(matches!(result, Err(Error::InvalidParam(_))));

    daemon.shutdown().expect("failed to send shutdown");
}

#[test_log::test]
fn browse_rejects_bad_domain() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    let result = daemon.browse("_http._tcp.example.com.", 100);
    assert!(matches!(result, Err(Error::InvalidParam(_))));

    daemon.shutdown().expect("failed to send shutdown");
}

#[test_log::test]
fn stop_when_not_running() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    let result = daemon
        .stop(ServiceVariant::Xmdns)
        .expect("failed to send")
        .recv()
        .expect("channel closed");
    assert!(matches!(result, Err(Error::NotRunning)));

    daemon.shutdown().expect("failed to send shutdown");
}

#[test_log::test]
fn status_when_not_running() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    let status = daemon
        .status(ServiceVariant::Mdns)
        .expect("failed to send")
        .recv()
        .expect("channel closed");
    assert!(!status.running);
    assert!(!status.probing);
    assert!(status.hostname.is_none());
    assert!(status.address.is_none());

    daemon.shutdown().expect("failed to send shutdown");
}

#[test_log::test]
fn cache_starts_empty() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    let records = daemon
        .cache_dump()
        .expect("failed to send")
        .recv()
        .expect("channel closed");
    assert!(records.is_empty());

    daemon.shutdown().expect("failed to send shutdown");
}

#[test_log::test]
fn query_when_not_running() {
    let daemon = ServiceDaemon::new().expect("failed to create daemon");

    // Valid name, variant not started: the command is accepted and dropped
    // by the engine. Only a bad domain fails on the caller side.
    daemon
        .query("somehost.local.", RRType::A, ServiceVariant::Mdns)
        .expect("failed to send");
    let result = daemon.query("somehost.example.", RRType::A, ServiceVariant::Mdns);
    assert!(matches!(result, Err(Error::InvalidParam(_))));

    daemon.shutdown().expect("failed to send shutdown");
}
