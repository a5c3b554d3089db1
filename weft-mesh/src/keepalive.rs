#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Connection keepalive.
//!
//! Machines exchanged with recently are "active" and receive periodic pings
//! so NAT mappings stay open. After a network or classification change the
//! interval tightens for a short period to re-establish mappings quickly.
//! Ping send times are remembered per target so the matching pong yields a
//! round-trip estimate, which the warm-relay selector consumes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use weft_core::MachineId;

/// A machine sent to or received from within this window is active.
pub const ACTIVE_WINDOW: Duration = Duration::from_secs(5 * 60);

/// Tightened interval after a network change, and how long it lasts.
pub const AGGRESSIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const AGGRESSIVE_PERIOD: Duration = Duration::from_secs(30);

/// Tracks activity, ping schedules, and round trips.
#[derive(Debug, Default)]
pub struct KeepaliveTracker {
    activity: HashMap<MachineId, Instant>,
    last_ping: HashMap<MachineId, Instant>,
    outstanding: HashMap<MachineId, (u64, Instant)>,
    rtt: HashMap<MachineId, Duration>,
    aggressive_until: Option<Instant>,
}

impl KeepaliveTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record traffic to or from a machine.
    pub fn note_activity(&mut self, machine: &MachineId, now: Instant) {
        self.activity.insert(machine.clone(), now);
    }

    /// Switch to the aggressive interval for [`AGGRESSIVE_PERIOD`].
    pub fn note_network_change(&mut self, now: Instant) {
        self.aggressive_until = Some(now + AGGRESSIVE_PERIOD);
    }

    /// The interval currently in force.
    pub fn interval(&self, baseline: Duration, now: Instant) -> Duration {
        match self.aggressive_until {
            Some(until) if now < until => AGGRESSIVE_INTERVAL,
            _ => baseline,
        }
    }

    /// Machines whose keepalive is due: active within the window and not
    /// pinged within the current interval.
    pub fn due_peers(&self, baseline: Duration, now: Instant) -> Vec<MachineId> {
        let interval = self.interval(baseline, now);
        self.activity
            .iter()
            .filter(|(_, last)| now.duration_since(**last) < ACTIVE_WINDOW)
            .filter(|(machine, _)| {
                self.last_ping
                    .get(*machine)
                    .map_or(true, |at| now.duration_since(*at) >= interval)
            })
            .map(|(machine, _)| machine.clone())
            .collect()
    }

    /// Whether a specific machine (e.g. a warm relay) is due for a ping at
    /// the given interval, regardless of the activity window.
    pub fn ping_due(&self, machine: &MachineId, interval: Duration, now: Instant) -> bool {
        let interval = self.interval(interval, now);
        self.last_ping
            .get(machine)
            .map_or(true, |at| now.duration_since(*at) >= interval)
    }

    /// Record an outbound ping so the echoing pong can be timed.
    pub fn note_ping_sent(&mut self, machine: &MachineId, seq: u64, now: Instant) {
        self.last_ping.insert(machine.clone(), now);
        self.outstanding.insert(machine.clone(), (seq, now));
    }

    /// Match a pong's echoed sequence number; returns the round trip.
    pub fn note_pong(&mut self, machine: &MachineId, echo_seq: u64, now: Instant) -> Option<Duration> {
        match self.outstanding.get(machine) {
            Some((seq, sent_at)) if *seq == echo_seq => {
                let rtt = now.duration_since(*sent_at);
                self.outstanding.remove(machine);
                self.rtt.insert(machine.clone(), rtt);
                Some(rtt)
            }
            _ => None,
        }
    }

    /// Smoothed-enough round trip: the last measured value.
    pub fn rtt(&self, machine: &MachineId) -> Option<Duration> {
        self.rtt.get(machine).copied()
    }

    /// Drop tracking for machines inactive beyond the window.
    pub fn prune(&mut self, now: Instant) {
        self.activity
            .retain(|_, last| now.duration_since(*last) < ACTIVE_WINDOW);
        self.last_ping
            .retain(|machine, _| self.activity.contains_key(machine));
        self.outstanding
            .retain(|machine, _| self.activity.contains_key(machine));
    }

    pub fn active_count(&self, now: Instant) -> usize {
        self.activity
            .values()
            .filter(|last| now.duration_since(**last) < ACTIVE_WINDOW)
            .count()
    }

    /// Machines currently inside the activity window.
    pub fn active_machines(&self, now: Instant) -> Vec<MachineId> {
        self.activity
            .iter()
            .filter(|(_, last)| now.duration_since(**last) < ACTIVE_WINDOW)
            .map(|(machine, _)| machine.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mid(b: u8) -> MachineId {
        MachineId::from_bytes(vec![b])
    }

    const BASELINE: Duration = Duration::from_secs(25);

    #[test]
    fn active_peer_is_due_until_pinged() {
        let t0 = Instant::now();
        let mut k = KeepaliveTracker::new();
        k.note_activity(&mid(1), t0);
        assert_eq!(k.due_peers(BASELINE, t0), vec![mid(1)]);
        k.note_ping_sent(&mid(1), 1, t0);
        assert!(k.due_peers(BASELINE, t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(k.due_peers(BASELINE, t0 + Duration::from_secs(26)), vec![mid(1)]);
    }

    #[test]
    fn inactive_peer_is_never_due() {
        let t0 = Instant::now();
        let mut k = KeepaliveTracker::new();
        k.note_activity(&mid(1), t0);
        let later = t0 + ACTIVE_WINDOW + Duration::from_secs(1);
        assert!(k.due_peers(BASELINE, later).is_empty());
    }

    #[test]
    fn aggressive_interval_applies_then_reverts() {
        let t0 = Instant::now();
        let mut k = KeepaliveTracker::new();
        k.note_network_change(t0);
        assert_eq!(k.interval(BASELINE, t0), AGGRESSIVE_INTERVAL);
        assert_eq!(
            k.interval(BASELINE, t0 + AGGRESSIVE_PERIOD + Duration::from_secs(1)),
            BASELINE
        );
    }

    #[test]
    fn pong_yields_rtt_only_for_matching_seq() {
        let t0 = Instant::now();
        let mut k = KeepaliveTracker::new();
        k.note_ping_sent(&mid(1), 7, t0);
        assert_eq!(k.note_pong(&mid(1), 8, t0 + Duration::from_millis(40)), None);
        let rtt = k.note_pong(&mid(1), 7, t0 + Duration::from_millis(40)).unwrap();
        assert_eq!(rtt, Duration::from_millis(40));
        assert_eq!(k.rtt(&mid(1)), Some(rtt));
    }
}
