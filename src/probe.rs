//! The prober: claims unique ownership of a set of records before they are
//! announced, per [RFC 6762 section 8](https://datatracker.ietf.org/doc/html/rfc6762#section-8).
//!
//! This is a pure state machine. The engine feeds it timer expirations and
//! decoded messages; it answers with actions (send a probe, announce,
//! renamed). All timing is expressed as absolute deadlines in UNIX millis so
//! the engine can fold them into its poll timeout.

#[cfg(feature = "logging")]
use crate::log::debug;

use crate::dns_parser::{
    names_equal, DnsIncoming, DnsOutgoing, DnsRecord, RRType, FLAGS_AA, FLAGS_QR_QUERY,
};
use std::cmp::Ordering;

/// How many probe queries are sent before a name is considered won.
pub const PROBE_ROUNDS: u8 = 3;

/// After this many conflicts the per-round probe timeout is stretched to
/// the conflict timeout, to back off on a hostile or crowded network.
pub const CONFLICT_RENAME_LIMIT: u8 = 15;

/// How long the announcing phase lasts before the prober settles into
/// `Active` (the announcements themselves repeat via the send scheduler).
const ANNOUNCING_PERIOD_MS: u64 = 3000;

/// Random delay bound before the first probe and after a conflict restart,
/// per RFC 6762 section 8.1.
const PROBE_START_JITTER_MS: u64 = 250;

/// Probe timing knobs, all in milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeTiming {
    /// Wait between probe rounds.
    pub probe_ms: u64,
    /// How far the next probe round is pushed out after winning a
    /// simultaneous-probe tie-break, giving the loser room to rename.
    pub tiebreak_defer_ms: u64,
    /// Per-round wait once the conflict count exceeded the rename limit.
    pub conflict_probe_ms: u64,
}

impl Default for ProbeTiming {
    fn default() -> Self {
        Self {
            probe_ms: 250,
            tiebreak_defer_ms: 150,
            conflict_probe_ms: 1000,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeState {
    Idle,
    /// Probing with `n` rounds already sent.
    Probing(u8),
    /// Won a simultaneous-probe comparison; a short grace before the
    /// remaining rounds gives the loser room to rename. Carries the round
    /// count so probing resumes where it left off.
    TieBreak(u8),
    Announcing,
    Active,
}

/// What the engine should do in reaction to a prober event.
#[derive(Debug)]
pub enum ProbeAction {
    /// Multicast this probe query.
    SendProbe(DnsOutgoing),
    /// Probing succeeded: announce these records (cache-flush answers).
    Announce(Vec<DnsRecord>),
    /// The probed name changed after a conflict.
    Renamed { old: String, new: String },
    /// The announcing phase finished.
    BecameActive,
}

pub struct Prober {
    state: ProbeState,
    /// The contested name this prober defends, e.g. `myhost.local.`.
    subject: String,
    /// First label of the subject, without any `-N` suffix.
    base_label: String,
    /// Everything after the first label, including the leading dot.
    suffix: String,
    /// Proposed records; names reference the current subject.
    records: Vec<DnsRecord>,
    /// How many renames happened (0 = original name).
    attempt: u32,
    conflict_count: u8,
    timing: ProbeTiming,
    deadline: Option<u64>,
}

impl Prober {
    /// `records` are the records to claim; every record whose name (or
    /// name-bearing payload) references `subject` is renamed along with it
    /// on conflicts.
    pub fn new(subject: &str, records: Vec<DnsRecord>, timing: ProbeTiming) -> Self {
        let subject = subject.to_lowercase();
        let (base_label, suffix) = match subject.find('.') {
            Some(idx) => (subject[..idx].to_string(), subject[idx..].to_string()),
            None => (subject.clone(), String::new()),
        };
        Self {
            state: ProbeState::Idle,
            subject,
            base_label,
            suffix,
            records,
            attempt: 0,
            conflict_count: 0,
            timing,
            deadline: None,
        }
    }

    pub const fn state(&self) -> ProbeState {
        self.state
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn records(&self) -> &[DnsRecord] {
        &self.records
    }

    pub const fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    pub const fn is_active(&self) -> bool {
        matches!(self.state, ProbeState::Active)
    }

    /// Kicks off probing. With `skip_probe` the names are assumed unique
    /// and the prober goes straight to announcing.
    pub fn start(&mut self, now: u64, skip_probe: bool) -> Vec<ProbeAction> {
        if skip_probe {
            debug!("prober '{}': skipping probe, announcing", self.subject);
            self.state = ProbeState::Announcing;
            self.deadline = Some(now + ANNOUNCING_PERIOD_MS);
            return vec![ProbeAction::Announce(self.records.clone())];
        }

        self.state = ProbeState::Probing(0);
        self.deadline = Some(now + fastrand::u64(0..PROBE_START_JITTER_MS));
        Vec::new()
    }

    /// Drives the state machine when the current deadline expires.
    pub fn on_timeout(&mut self, now: u64) -> Vec<ProbeAction> {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return Vec::new(),
        }

        match self.state {
            ProbeState::Probing(round) if round < PROBE_ROUNDS => {
                let probe = self.build_probe(round);
                self.state = ProbeState::Probing(round + 1);
                self.deadline = Some(now + self.probe_interval());
                vec![ProbeAction::SendProbe(probe)]
            }
            ProbeState::Probing(_) => {
                // All rounds went unanswered: the name is won.
                debug!("prober '{}': probing done, announcing", self.subject);
                self.state = ProbeState::Announcing;
                self.deadline = Some(now + ANNOUNCING_PERIOD_MS);
                vec![ProbeAction::Announce(self.records.clone())]
            }
            ProbeState::TieBreak(round) => {
                debug!("prober '{}': tie-break grace over, resuming", self.subject);
                self.state = ProbeState::Probing(round);
                self.deadline = Some(now);
                self.on_timeout(now)
            }
            ProbeState::Announcing => {
                self.state = ProbeState::Active;
                self.deadline = None;
                vec![ProbeAction::BecameActive]
            }
            ProbeState::Idle | ProbeState::Active => Vec::new(),
        }
    }

    /// Inspects an incoming response for a conflict with the probed name:
    /// someone already answers for it with different data. Triggers a
    /// rename and a probing restart.
    pub fn on_response(&mut self, msg: &DnsIncoming, now: u64) -> Vec<ProbeAction> {
        if !matches!(self.state, ProbeState::Probing(_) | ProbeState::TieBreak(_)) {
            return Vec::new();
        }

        let conflicted = msg
            .answers()
            .iter()
            .chain(msg.additionals().iter())
            .any(|theirs| self.records.iter().any(|ours| ours.conflicts_with(theirs)));
        if !conflicted {
            return Vec::new();
        }

        vec![self.rename_and_restart(now)]
    }

    /// Inspects an incoming query for a simultaneous probe of our subject
    /// (authority records under the probed name). Losing the comparison
    /// means their claim stands: we rename and probe the new name. Winning
    /// pushes our next round out a little so the loser can back off.
    pub fn on_query(&mut self, msg: &DnsIncoming, now: u64) -> Vec<ProbeAction> {
        let round = match self.state {
            ProbeState::Probing(n) | ProbeState::TieBreak(n) => n,
            _ => return Vec::new(),
        };
        if msg.num_authorities() == 0 {
            return Vec::new();
        }

        let theirs: Vec<&DnsRecord> = msg
            .authorities()
            .iter()
            .filter(|r| names_equal(r.name(), &self.subject))
            .collect();
        if theirs.is_empty() {
            return Vec::new();
        }

        if self.tiebreak(&theirs) == Ordering::Less {
            debug!(
                "prober '{}': lost simultaneous probe tie-break, renaming",
                self.subject
            );
            return vec![self.rename_and_restart(now)];
        }

        debug!("prober '{}': won simultaneous probe tie-break", self.subject);
        self.state = ProbeState::TieBreak(round);
        self.deadline = Some(now + self.timing.tiebreak_defer_ms);
        Vec::new()
    }

    /// Picks the next `base-N` name, applies it to every record and restarts
    /// probing from the first round.
    fn rename_and_restart(&mut self, now: u64) -> ProbeAction {
        self.conflict_count = self.conflict_count.saturating_add(1);
        let old = self.subject.clone();
        self.attempt += 1;
        let new = format!("{}-{}{}", self.base_label, self.attempt, self.suffix);
        debug!(
            "prober: conflict #{} for '{}', renaming to '{}'",
            self.conflict_count, old, new
        );

        for record in self.records.iter_mut() {
            record.rename(&old, &new);
        }
        self.subject = new.clone();

        self.state = ProbeState::Probing(0);
        self.deadline = Some(now + fastrand::u64(0..PROBE_START_JITTER_MS));

        ProbeAction::Renamed { old, new }
    }

    /// Compares our proposed records against a simultaneous prober's
    /// authority records, per RFC 6762 section 8.2: both sets sorted
    /// ascending, compared pairwise; a longer set wins a tie.
    fn tiebreak(&self, theirs: &[&DnsRecord]) -> Ordering {
        let mut ours: Vec<&DnsRecord> = self
            .records
            .iter()
            .filter(|r| names_equal(r.name(), &self.subject))
            .collect();
        let mut theirs: Vec<&DnsRecord> = theirs.to_vec();

        ours.sort_by(|a, b| a.compare(b));
        theirs.sort_by(|a, b| a.compare(b));

        for (ours_rr, theirs_rr) in ours.iter().zip(theirs.iter()) {
            let order = ours_rr.compare(theirs_rr);
            if order != Ordering::Equal {
                return order;
            }
        }
        ours.len().cmp(&theirs.len())
    }

    fn probe_interval(&self) -> u64 {
        if self.conflict_count >= CONFLICT_RENAME_LIMIT {
            self.timing.conflict_probe_ms
        } else {
            self.timing.probe_ms
        }
    }

    /// A probe query: one ANY question per probed name, the proposed
    /// records in the authority section. The first round requests a unicast
    /// response.
    fn build_probe(&self, round: u8) -> DnsOutgoing {
        let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);

        let mut asked: Vec<&str> = Vec::new();
        for record in self.records.iter() {
            if asked.iter().any(|name| names_equal(name, record.name())) {
                continue;
            }
            asked.push(record.name());
            if round == 0 {
                out.add_question_unicast(record.name(), RRType::ANY);
            } else {
                out.add_question(record.name(), RRType::ANY);
            }
        }

        for record in self.records.iter() {
            out.add_authority(record.clone());
        }
        out
    }

    /// The response announcing won records: cache-flush answers with the AA
    /// flag set.
    pub fn build_announcement(records: &[DnsRecord]) -> DnsOutgoing {
        let mut out = DnsOutgoing::new(crate::dns_parser::FLAGS_QR_RESPONSE | FLAGS_AA);
        for record in records {
            out.add_answer(record.clone());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::{ProbeAction, ProbeState, ProbeTiming, Prober, CONFLICT_RENAME_LIMIT, PROBE_ROUNDS};
    use crate::dns_parser::{
        DnsIncoming, DnsOutgoing, DnsRecord, RData, RRType, CLASS_IN, FLAGS_AA, FLAGS_QR_QUERY,
        FLAGS_QR_RESPONSE,
    };
    use std::net::Ipv4Addr;

    fn host_records(name: &str, ip: [u8; 4]) -> Vec<DnsRecord> {
        vec![DnsRecord::own(name, RData::A(Ipv4Addr::from(ip)))]
    }

    fn fire(prober: &mut Prober, now: u64) -> Vec<ProbeAction> {
        let deadline = prober.deadline().unwrap();
        prober.on_timeout(deadline.max(now))
    }

    fn conflict_response(name: &str, ip: [u8; 4]) -> DnsIncoming {
        let mut out = DnsOutgoing::new(FLAGS_QR_RESPONSE | FLAGS_AA);
        out.add_answer(DnsRecord::new(
            name,
            CLASS_IN,
            120,
            RData::A(Ipv4Addr::from(ip)),
        ));
        let wire = out.to_data_on_wire().into_iter().next().unwrap();
        DnsIncoming::new(wire).unwrap()
    }

    fn simultaneous_probe(name: &str, ip: [u8; 4]) -> DnsIncoming {
        let mut out = DnsOutgoing::new(FLAGS_QR_QUERY);
        out.add_question(name, RRType::ANY);
        out.add_authority(DnsRecord::own(name, RData::A(Ipv4Addr::from(ip))));
        let wire = out.to_data_on_wire().into_iter().next().unwrap();
        DnsIncoming::new(wire).unwrap()
    }

    #[test]
    fn test_three_rounds_then_announce_then_active() {
        let mut prober = Prober::new(
            "myhost.local.",
            host_records("myhost.local.", [10, 0, 0, 1]),
            ProbeTiming::default(),
        );

        let now = 1_000_000;
        assert!(prober.start(now, false).is_empty());
        assert_eq!(prober.state(), ProbeState::Probing(0));

        for round in 0..PROBE_ROUNDS {
            let actions = fire(&mut prober, now);
            assert_eq!(actions.len(), 1);
            match &actions[0] {
                ProbeAction::SendProbe(out) => {
                    assert_eq!(out.questions().len(), 1);
                    assert_eq!(out.questions()[0].ty(), RRType::ANY);
                    assert_eq!(out.authorities().len(), 1);
                    // First round asks for a unicast response.
                    assert_eq!(out.questions()[0].wants_unicast(), round == 0);
                }
                other => panic!("expected SendProbe, got {:?}", other),
            }
        }
        assert_eq!(prober.state(), ProbeState::Probing(3));

        let actions = fire(&mut prober, now);
        assert!(matches!(actions[0], ProbeAction::Announce(_)));
        assert_eq!(prober.state(), ProbeState::Announcing);

        let actions = fire(&mut prober, now);
        assert!(matches!(actions[0], ProbeAction::BecameActive));
        assert_eq!(prober.state(), ProbeState::Active);
        assert!(prober.deadline().is_none());
    }

    #[test]
    fn test_skip_probe_goes_to_announcing() {
        let mut prober = Prober::new(
            "myhost.local.",
            host_records("myhost.local.", [10, 0, 0, 1]),
            ProbeTiming::default(),
        );
        let actions = prober.start(2_000, true);
        assert!(matches!(actions[0], ProbeAction::Announce(_)));
        assert_eq!(prober.state(), ProbeState::Announcing);
    }

    #[test]
    fn test_conflict_renames_and_restarts() {
        let mut prober = Prober::new(
            "myhost.local.",
            host_records("myhost.local.", [10, 0, 0, 1]),
            ProbeTiming::default(),
        );
        let now = 5_000;
        prober.start(now, false);
        fire(&mut prober, now);

        // Someone answers for our name with a different address; the first
        // conflict appends "-1".
        let msg = conflict_response("myhost.local.", [10, 0, 0, 77]);
        let actions = prober.on_response(&msg, now);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ProbeAction::Renamed { old, new } => {
                assert_eq!(old, "myhost.local.");
                assert_eq!(new, "myhost-1.local.");
            }
            other => panic!("expected Renamed, got {:?}", other),
        }
        assert_eq!(prober.subject(), "myhost-1.local.");
        assert_eq!(prober.records()[0].name(), "myhost-1.local.");
        assert_eq!(prober.state(), ProbeState::Probing(0));

        // A second conflict keeps counting up.
        let msg = conflict_response("myhost-1.local.", [10, 0, 0, 78]);
        let actions = prober.on_response(&msg, now);
        assert!(matches!(&actions[0], ProbeAction::Renamed { new, .. } if new == "myhost-2.local."));
    }

    #[test]
    fn test_conflict_threshold_extends_timeout() {
        let timing = ProbeTiming::default();
        let mut prober = Prober::new(
            "myhost.local.",
            host_records("myhost.local.", [10, 0, 0, 1]),
            timing,
        );
        let now = 9_000;
        prober.start(now, false);

        for _ in 0..CONFLICT_RENAME_LIMIT {
            let msg = conflict_response(prober.subject(), [10, 0, 0, 99]);
            prober.on_response(&msg, now);
        }

        // The next probe round waits the conflict timeout, not the default.
        let actions = fire(&mut prober, now);
        assert!(matches!(actions[0], ProbeAction::SendProbe(_)));
        let sent_at = now.max(prober.deadline().unwrap() - timing.conflict_probe_ms);
        assert_eq!(
            prober.deadline().unwrap(),
            sent_at + timing.conflict_probe_ms
        );
    }

    #[test]
    fn test_tiebreak_lost_renames_and_restarts() {
        // Our address 10.0.0.1 loses lexicographically to 10.0.0.2.
        let mut prober = Prober::new(
            "myhost.local.",
            host_records("myhost.local.", [10, 0, 0, 1]),
            ProbeTiming::default(),
        );
        let now = 50_000;
        prober.start(now, false);
        fire(&mut prober, now);

        let msg = simultaneous_probe("myhost.local.", [10, 0, 0, 2]);
        let actions = prober.on_query(&msg, now);
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            ProbeAction::Renamed { old, new } => {
                assert_eq!(old, "myhost.local.");
                assert_eq!(new, "myhost-1.local.");
            }
            other => panic!("expected Renamed, got {:?}", other),
        }
        assert_eq!(prober.subject(), "myhost-1.local.");
        assert_eq!(prober.records()[0].name(), "myhost-1.local.");

        // Probing restarts from round one under the new name.
        assert_eq!(prober.state(), ProbeState::Probing(0));
        let actions = fire(&mut prober, now + 1_000);
        match &actions[0] {
            ProbeAction::SendProbe(out) => {
                assert_eq!(out.questions()[0].name(), "myhost-1.local.");
            }
            other => panic!("expected SendProbe, got {:?}", other),
        }
    }

    #[test]
    fn test_tiebreak_won_defers_next_round() {
        // Our address 10.0.0.9 wins against 10.0.0.2.
        let timing = ProbeTiming {
            probe_ms: 250,
            tiebreak_defer_ms: 1000,
            conflict_probe_ms: 1000,
        };
        let mut prober = Prober::new(
            "myhost.local.",
            host_records("myhost.local.", [10, 0, 0, 9]),
            timing,
        );
        let now = 60_000;
        prober.start(now, false);
        let sent_at = prober.deadline().unwrap().max(now);
        prober.on_timeout(sent_at);

        let msg = simultaneous_probe("myhost.local.", [10, 0, 0, 2]);
        assert!(prober.on_query(&msg, sent_at).is_empty());

        // The name is kept; the next round waits out the loser's back-off.
        assert_eq!(prober.subject(), "myhost.local.");
        assert_eq!(prober.state(), ProbeState::TieBreak(1));
        assert_eq!(
            prober.deadline().unwrap(),
            sent_at + timing.tiebreak_defer_ms
        );

        // The grace elapses and the probe count continues where it left off.
        let actions = fire(&mut prober, sent_at + timing.tiebreak_defer_ms);
        assert!(matches!(actions[0], ProbeAction::SendProbe(_)));
        assert_eq!(prober.state(), ProbeState::Probing(2));
    }
}
