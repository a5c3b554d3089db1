#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Per-destination connection state.
//!
//! The path selector's memory: which way the last datagram to each machine
//! went, when it last worked, and how many consecutive failures have
//! accumulated. The decision ladder itself lives with the node, because it
//! needs the transport and the punch/relay engines; this table only holds
//! the serialized state those decisions read and write.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use weft_core::MachineId;

/// A direct path is trusted without re-probing for this long after the last
/// confirmed success.
pub const DIRECT_FRESH: Duration = Duration::from_secs(30);

/// Connection states with no sends for this long are torn down.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// The chosen way to reach a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathChoice {
    None,
    /// Sending straight to the machine's endpoint.
    Direct { endpoint: SocketAddr },
    /// A punch is in flight via this coordinator; traffic is parked.
    HolePunch {
        endpoint: Option<SocketAddr>,
        coordinator: MachineId,
    },
    /// Forwarding through a warm relay.
    Relay { relay: MachineId },
}

#[derive(Debug)]
pub struct ConnectionState {
    pub path: PathChoice,
    pub last_success: Option<Instant>,
    pub failures: u32,
    pub last_send: Instant,
}

impl ConnectionState {
    fn new(now: Instant) -> Self {
        Self {
            path: PathChoice::None,
            last_success: None,
            failures: 0,
            last_send: now,
        }
    }

    /// Whether the current direct path can be used without re-validation.
    pub fn direct_is_fresh(&self, now: Instant) -> Option<SocketAddr> {
        match (&self.path, self.last_success) {
            (PathChoice::Direct { endpoint }, Some(at))
                if now.duration_since(at) < DIRECT_FRESH =>
            {
                Some(*endpoint)
            }
            _ => None,
        }
    }
}

/// Table of connection states, created on first outbound send.
#[derive(Debug, Default)]
pub struct PathTable {
    conns: HashMap<MachineId, ConnectionState>,
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, machine: &MachineId) -> Option<&ConnectionState> {
        self.conns.get(machine)
    }

    pub fn get_or_create(&mut self, machine: &MachineId, now: Instant) -> &mut ConnectionState {
        let conn = self
            .conns
            .entry(machine.clone())
            .or_insert_with(|| ConnectionState::new(now));
        conn.last_send = now;
        conn
    }

    /// A datagram went out (or came back) over `path` successfully.
    pub fn note_success(&mut self, machine: &MachineId, path: PathChoice, now: Instant) {
        let conn = self.get_or_create(machine, now);
        conn.path = path;
        conn.last_success = Some(now);
        conn.failures = 0;
    }

    pub fn note_failure(&mut self, machine: &MachineId, now: Instant) {
        let conn = self.get_or_create(machine, now);
        conn.failures += 1;
    }

    /// Roaming recovery step one: no direct path survives an endpoint or
    /// classification change. Returns the machines that were affected.
    pub fn invalidate_direct(&mut self) -> Vec<MachineId> {
        let mut affected = Vec::new();
        for (machine, conn) in &mut self.conns {
            if matches!(conn.path, PathChoice::Direct { .. }) {
                conn.path = PathChoice::None;
                conn.last_success = None;
                affected.push(machine.clone());
            }
        }
        affected
    }

    /// Roaming recovery step two: point a machine at a warm relay.
    pub fn promote_relay(&mut self, machine: &MachineId, relay: MachineId, now: Instant) {
        let conn = self.get_or_create(machine, now);
        conn.path = PathChoice::Relay { relay };
    }

    /// Tear down states idle past the timeout.
    pub fn purge_idle(&mut self, now: Instant) {
        self.conns
            .retain(|_, c| now.duration_since(c.last_send) < IDLE_TIMEOUT);
    }

    pub fn direct_count(&self) -> usize {
        self.conns
            .values()
            .filter(|c| matches!(c.path, PathChoice::Direct { .. }))
            .count()
    }

    pub fn relay_count(&self) -> usize {
        self.conns
            .values()
            .filter(|c| matches!(c.path, PathChoice::Relay { .. }))
            .count()
    }

    /// The endpoint the upper layer should aim a tunnel at, if any: the
    /// direct endpoint when one is live, otherwise nothing (relay endpoints
    /// belong to the relay, not the peer).
    pub fn current_endpoint(&self, machine: &MachineId) -> Option<SocketAddr> {
        match self.conns.get(machine).map(|c| &c.path) {
            Some(PathChoice::Direct { endpoint }) => Some(*endpoint),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mid(b: u8) -> MachineId {
        MachineId::from_bytes(vec![b])
    }
    fn ep(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 0, 2, 1], port))
    }

    #[test]
    fn direct_freshness_expires() {
        let t0 = Instant::now();
        let mut t = PathTable::new();
        t.note_success(&mid(1), PathChoice::Direct { endpoint: ep(1000) }, t0);
        let conn = t.get(&mid(1)).unwrap();
        assert_eq!(conn.direct_is_fresh(t0 + Duration::from_secs(29)), Some(ep(1000)));
        assert_eq!(conn.direct_is_fresh(t0 + Duration::from_secs(31)), None);
    }

    #[test]
    fn invalidate_direct_spares_relay_paths() {
        let t0 = Instant::now();
        let mut t = PathTable::new();
        t.note_success(&mid(1), PathChoice::Direct { endpoint: ep(1000) }, t0);
        t.note_success(&mid(2), PathChoice::Relay { relay: mid(9) }, t0);
        let affected = t.invalidate_direct();
        assert_eq!(affected, vec![mid(1)]);
        assert_eq!(t.get(&mid(1)).unwrap().path, PathChoice::None);
        assert_eq!(t.get(&mid(2)).unwrap().path, PathChoice::Relay { relay: mid(9) });
        assert_eq!(t.direct_count(), 0);
        assert_eq!(t.relay_count(), 1);
    }

    #[test]
    fn idle_states_are_purged() {
        let t0 = Instant::now();
        let mut t = PathTable::new();
        t.get_or_create(&mid(1), t0);
        t.purge_idle(t0 + IDLE_TIMEOUT + Duration::from_secs(1));
        assert!(t.get(&mid(1)).is_none());
    }

    #[test]
    fn failure_counter_resets_on_success() {
        let t0 = Instant::now();
        let mut t = PathTable::new();
        t.note_failure(&mid(1), t0);
        t.note_failure(&mid(1), t0);
        assert_eq!(t.get(&mid(1)).unwrap().failures, 2);
        t.note_success(&mid(1), PathChoice::Direct { endpoint: ep(1000) }, t0);
        assert_eq!(t.get(&mid(1)).unwrap().failures, 0);
    }

    #[test]
    fn relay_paths_expose_no_tunnel_endpoint() {
        let t0 = Instant::now();
        let mut t = PathTable::new();
        t.note_success(&mid(1), PathChoice::Relay { relay: mid(9) }, t0);
        assert_eq!(t.current_endpoint(&mid(1)), None);
        t.note_success(&mid(1), PathChoice::Direct { endpoint: ep(1000) }, t0);
        assert_eq!(t.current_endpoint(&mid(1)), Some(ep(1000)));
    }
}
