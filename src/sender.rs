//! The send scheduler: a queue of serialized packets waiting to go out,
//! each with its own repeat count and backoff.
//!
//! The engine asks for the earliest deadline to size its poll timeout, then
//! collects due packets on every wake. An entry is dropped once its sent
//! count reaches its max, or when its tag is purged on teardown.

#[cfg(feature = "logging")]
use crate::log::trace;

use crate::responder::ServiceVariant;
use std::net::SocketAddr;

/// What a queued packet is for. Purging by tag removes every entry of that
/// purpose, e.g. dropping the pending announcements of a service going away.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendTag {
    HostProbe(ServiceVariant),
    HostAnnounce(ServiceVariant),
    ServiceProbe(ServiceVariant),
    ServiceAnnounce(ServiceVariant),
    Goodbye(ServiceVariant),
    Generic,
}

/// One queued outgoing packet.
#[derive(Debug)]
pub struct PendingSend {
    /// The full serialized packet.
    pub packet: Vec<u8>,
    /// Where to send it.
    pub dest: SocketAddr,
    /// How many times to send in total.
    pub max_count: u8,
    /// How many times it has been sent so far.
    pub sent_count: u8,
    /// Current interval until the next send, in millis.
    pub interval: u64,
    /// The interval is multiplied by this after every send.
    pub mult_factor: u64,
    /// When it was last sent (0 = not yet; due immediately).
    pub last_sent: u64,
    pub tag: SendTag,
}

impl PendingSend {
    /// An entry sent once, `delay` millis from now.
    pub fn once_after(packet: Vec<u8>, dest: SocketAddr, delay: u64, now: u64, tag: SendTag) -> Self {
        Self {
            packet,
            dest,
            max_count: 1,
            sent_count: 0,
            interval: delay,
            mult_factor: 1,
            last_sent: now,
            tag,
        }
    }

    /// An entry repeated `max_count` times, the first send due immediately,
    /// subsequent sends spaced by `interval` growing by `mult_factor`.
    pub fn repeated(
        packet: Vec<u8>,
        dest: SocketAddr,
        max_count: u8,
        interval: u64,
        mult_factor: u64,
        tag: SendTag,
    ) -> Self {
        Self {
            packet,
            dest,
            max_count,
            sent_count: 0,
            interval,
            mult_factor,
            last_sent: 0,
            tag,
        }
    }

    fn is_due(&self, now: u64) -> bool {
        self.last_sent == 0 || now >= self.last_sent + self.interval
    }

    fn deadline(&self) -> u64 {
        if self.last_sent == 0 {
            0
        } else {
            self.last_sent + self.interval
        }
    }
}

#[derive(Default)]
pub struct SendScheduler {
    queue: Vec<PendingSend>,
}

impl SendScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, entry: PendingSend) {
        trace!(
            "scheduler: enqueue {:?} x{} to {}",
            entry.tag,
            entry.max_count,
            entry.dest
        );
        self.queue.push(entry);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn has_tag(&self, tag: SendTag) -> bool {
        self.queue.iter().any(|e| e.tag == tag)
    }

    /// Removes all entries carrying `tag`. Returns how many were removed.
    pub fn purge(&mut self, tag: SendTag) -> usize {
        let before = self.queue.len();
        self.queue.retain(|e| e.tag != tag);
        before - self.queue.len()
    }

    /// The earliest time any entry becomes due, if the queue is non-empty.
    pub fn next_deadline(&self) -> Option<u64> {
        self.queue.iter().map(|e| e.deadline()).min()
    }

    /// Collects packets due at `now`, advancing their bookkeeping: bumps the
    /// sent count, stamps the send time and applies the backoff multiplier.
    /// Entries that reached their max count are dropped from the queue.
    pub fn collect_due(&mut self, now: u64) -> Vec<(Vec<u8>, SocketAddr, SendTag)> {
        let mut out = Vec::new();
        for entry in self.queue.iter_mut() {
            if !entry.is_due(now) {
                continue;
            }
            out.push((entry.packet.clone(), entry.dest, entry.tag));
            entry.sent_count += 1;
            entry.last_sent = now;
            // The first send is immediate and does not consume an interval;
            // backoff kicks in from the second send onward.
            if entry.sent_count > 1 {
                entry.interval = entry.interval.saturating_mul(entry.mult_factor.max(1));
            }
        }
        self.queue.retain(|e| e.sent_count < e.max_count);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::{PendingSend, SendScheduler, SendTag};
    use crate::responder::ServiceVariant;
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

    fn dest() -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(224, 0, 0, 251), 5353))
    }

    #[test]
    fn test_repeat_and_backoff() {
        let mut sched = SendScheduler::new();
        sched.enqueue(PendingSend::repeated(
            vec![1, 2, 3],
            dest(),
            3,
            1000,
            2,
            SendTag::HostAnnounce(ServiceVariant::Mdns),
        ));

        // First send is due immediately.
        let now = 10_000;
        assert_eq!(sched.collect_due(now).len(), 1);
        // Not due again before the interval elapses.
        assert!(sched.collect_due(now + 500).is_empty());
        assert_eq!(sched.next_deadline(), Some(now + 1000));

        // Second send after 1000ms; interval doubles.
        assert_eq!(sched.collect_due(now + 1000).len(), 1);
        assert_eq!(sched.next_deadline(), Some(now + 1000 + 2000));

        // Third and final send; the entry is destroyed.
        assert_eq!(sched.collect_due(now + 3000).len(), 1);
        assert!(sched.is_empty());
        assert_eq!(sched.next_deadline(), None);
    }

    #[test]
    fn test_once_after_delay() {
        let mut sched = SendScheduler::new();
        let now = 5_000;
        sched.enqueue(PendingSend::once_after(
            vec![9],
            dest(),
            120,
            now,
            SendTag::Generic,
        ));

        assert!(sched.collect_due(now + 100).is_empty());
        let due = sched.collect_due(now + 120);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, vec![9]);
        assert!(sched.is_empty());
    }

    #[test]
    fn test_purge_by_tag() {
        let mut sched = SendScheduler::new();
        sched.enqueue(PendingSend::repeated(
            vec![1],
            dest(),
            3,
            250,
            1,
            SendTag::HostProbe(ServiceVariant::Mdns),
        ));
        sched.enqueue(PendingSend::repeated(
            vec![2],
            dest(),
            3,
            250,
            1,
            SendTag::HostProbe(ServiceVariant::Xmdns),
        ));
        sched.enqueue(PendingSend::repeated(
            vec![3],
            dest(),
            1,
            0,
            1,
            SendTag::Generic,
        ));

        assert_eq!(sched.purge(SendTag::HostProbe(ServiceVariant::Mdns)), 1);
        assert!(sched.has_tag(SendTag::HostProbe(ServiceVariant::Xmdns)));
        assert!(!sched.has_tag(SendTag::HostProbe(ServiceVariant::Mdns)));
        assert_eq!(sched.len(), 2);
    }
}
