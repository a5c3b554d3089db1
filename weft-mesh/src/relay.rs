#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Single-hop relaying.
//!
//! A publicly reachable node advertises `can_relay` in its gossip; remote
//! peers open warm sessions with it so datagrams can be forwarded when no
//! direct path exists. The relay never interprets forwarded bytes and never
//! forwards to or from machines without a live session.
//!
//! The client half keeps a small set of warm relays registered even while
//! no traffic flows, so a roaming node can fail over instantly.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

use weft_core::{MachineId, NatClass, PeerId};

use crate::registry::Registry;

/// Relay-register exchange timeout.
pub const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// Session lifetime requested by the client half, in seconds.
pub const SESSION_TTL_S: u32 = 3600;

/// Warm relays whose observed round trips differ by at least this much are
/// considered path-diverse.
pub const DIVERSITY_RTT_GAP: Duration = Duration::from_millis(30);

/// One warm registration at this relay.
#[derive(Debug, Clone)]
pub struct RelaySession {
    pub peer: PeerId,
    pub slot: u32,
    pub nat_class: NatClass,
    pub endpoint: SocketAddr,
    pub registered_at: Instant,
    pub last_traffic: Instant,
    pub keepalive: Duration,
}

impl RelaySession {
    // Sessions age out after 2x the granted keepalive with no traffic.
    fn is_fresh(&self, now: Instant) -> bool {
        now.duration_since(self.last_traffic) < self.keepalive * 2
    }
}

/// Reasons a forward is refused, reported back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardDenied {
    SourceNotRegistered,
    DestinationNotRegistered,
    DestinationStale,
}

impl ForwardDenied {
    pub fn as_str(self) -> &'static str {
        match self {
            ForwardDenied::SourceNotRegistered => "source-not-registered",
            ForwardDenied::DestinationNotRegistered => "destination-not-registered",
            ForwardDenied::DestinationStale => "destination-stale",
        }
    }
}

/// Server half: the sessions this node is relaying for.
#[derive(Debug, Default)]
pub struct RelaySessionTable {
    sessions: HashMap<MachineId, RelaySession>,
    next_slot: u32,
    forwarded: u64,
}

impl RelaySessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open or refresh a session; returns the assigned slot.
    pub fn register(
        &mut self,
        machine: &MachineId,
        peer: PeerId,
        nat_class: NatClass,
        endpoint: SocketAddr,
        keepalive: Duration,
        now: Instant,
    ) -> u32 {
        if let Some(existing) = self.sessions.get_mut(machine) {
            existing.endpoint = endpoint;
            existing.nat_class = nat_class;
            existing.last_traffic = now;
            return existing.slot;
        }
        self.next_slot = self.next_slot.wrapping_add(1);
        let slot = self.next_slot;
        self.sessions.insert(
            machine.clone(),
            RelaySession {
                peer,
                slot,
                nat_class,
                endpoint,
                registered_at: now,
                last_traffic: now,
                keepalive,
            },
        );
        debug!(machine = %machine, slot, "relay session opened");
        slot
    }

    pub fn unregister(&mut self, machine: &MachineId) {
        if self.sessions.remove(machine).is_some() {
            debug!(machine = %machine, "relay session closed");
        }
    }

    /// Refresh the traffic timestamp for a registrant (any datagram counts).
    pub fn note_traffic(&mut self, machine: &MachineId, now: Instant) {
        if let Some(s) = self.sessions.get_mut(machine) {
            s.last_traffic = now;
        }
    }

    /// Authorize a forward from `src` to `dst`. The source must hold a live
    /// session (never relay for strangers); the destination must be
    /// registered and fresh. On success returns the destination endpoint.
    pub fn authorize_forward(
        &mut self,
        src: &MachineId,
        dst: &MachineId,
        now: Instant,
    ) -> Result<SocketAddr, ForwardDenied> {
        let src_ok = self
            .sessions
            .get(src)
            .is_some_and(|s| s.is_fresh(now));
        if !src_ok {
            return Err(ForwardDenied::SourceNotRegistered);
        }
        match self.sessions.get(dst) {
            None => Err(ForwardDenied::DestinationNotRegistered),
            Some(s) if !s.is_fresh(now) => Err(ForwardDenied::DestinationStale),
            Some(s) => {
                self.forwarded += 1;
                Ok(s.endpoint)
            }
        }
    }

    /// Whether `machine` currently holds a fresh session here.
    pub fn is_registered(&self, machine: &MachineId, now: Instant) -> bool {
        self.sessions.get(machine).is_some_and(|s| s.is_fresh(now))
    }

    /// Datagrams forwarded since start.
    pub fn forwarded(&self) -> u64 {
        self.forwarded
    }

    /// Drop sessions past 2x keepalive with no traffic.
    pub fn sweep(&mut self, now: Instant) {
        self.sessions.retain(|_, s| s.is_fresh(now));
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

/// One relay this node keeps warm.
#[derive(Debug, Clone)]
pub struct WarmRelay {
    pub relay: MachineId,
    pub endpoint: SocketAddr,
    pub slot: u32,
    pub registered_at: Instant,
    pub last_ack: Instant,
    pub rtt: Option<Duration>,
}

/// Client half: warm registrations this node maintains, plus what it has
/// learned about which machines are registered where.
#[derive(Debug, Default)]
pub struct WarmRelaySet {
    relays: HashMap<MachineId, WarmRelay>,
    /// Registration requests awaiting an ack.
    pending: HashMap<MachineId, Instant>,
    /// target machine → relays known to hold a session for it, learned from
    /// endpoint responses.
    known_sessions: HashMap<MachineId, HashSet<MachineId>>,
}

impl WarmRelaySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.relays.len()
    }

    pub fn contains(&self, relay: &MachineId) -> bool {
        self.relays.contains_key(relay)
    }

    pub fn relays(&self) -> impl Iterator<Item = &WarmRelay> {
        self.relays.values()
    }

    /// Candidates to register with next, given the configured bounds.
    /// Prefers low round trip, then path diversity: once one relay is held,
    /// the next pick favors a round trip differing by the diversity gap.
    pub fn registration_candidates(
        &self,
        registry: &Registry,
        rtt_of: impl Fn(&MachineId) -> Option<Duration>,
        max_warm: usize,
        now: Instant,
    ) -> Vec<(MachineId, SocketAddr)> {
        let need = max_warm.saturating_sub(self.relays.len() + self.pending.len());
        if need == 0 {
            return Vec::new();
        }
        let mut candidates: Vec<(MachineId, SocketAddr, Option<Duration>)> = registry
            .fresh_records(now)
            .into_iter()
            .filter(|r| r.can_relay && r.nat_class == NatClass::Public)
            .filter(|r| !self.relays.contains_key(&r.machine) && !self.pending.contains_key(&r.machine))
            .filter_map(|r| r.endpoint.map(|ep| (r.machine.clone(), ep, rtt_of(&r.machine))))
            .collect();
        // Unmeasured candidates sort last.
        candidates.sort_by_key(|(_, _, rtt)| rtt.unwrap_or(Duration::MAX));

        let held_rtts: Vec<Duration> = self.relays.values().filter_map(|w| w.rtt).collect();
        let (diverse, similar): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|(_, _, rtt)| match rtt {
                Some(rtt) => held_rtts
                    .iter()
                    .all(|held| rtt.checked_sub(*held).unwrap_or_else(|| *held - *rtt) >= DIVERSITY_RTT_GAP),
                None => true,
            });
        diverse
            .into_iter()
            .chain(similar)
            .take(need)
            .map(|(m, ep, _)| (m, ep))
            .collect()
    }

    pub fn note_register_sent(&mut self, relay: &MachineId, now: Instant) {
        self.pending.insert(relay.clone(), now);
    }

    /// An ack arrived: the relay is warm now.
    pub fn note_registered(
        &mut self,
        relay: &MachineId,
        endpoint: SocketAddr,
        slot: u32,
        rtt: Option<Duration>,
        now: Instant,
    ) {
        self.pending.remove(relay);
        let entry = self.relays.entry(relay.clone()).or_insert(WarmRelay {
            relay: relay.clone(),
            endpoint,
            slot,
            registered_at: now,
            last_ack: now,
            rtt,
        });
        entry.endpoint = endpoint;
        entry.slot = slot;
        entry.last_ack = now;
        if rtt.is_some() {
            entry.rtt = rtt;
        }
    }

    pub fn note_rtt(&mut self, relay: &MachineId, rtt: Duration) {
        if let Some(w) = self.relays.get_mut(relay) {
            w.rtt = Some(rtt);
        }
    }

    /// Registrations that never got an ack within the exchange timeout.
    pub fn sweep_pending(&mut self, now: Instant) -> Vec<MachineId> {
        let expired: Vec<MachineId> = self
            .pending
            .iter()
            .filter(|(_, at)| now.duration_since(**at) >= REGISTER_TIMEOUT)
            .map(|(m, _)| m.clone())
            .collect();
        for m in &expired {
            self.pending.remove(m);
        }
        expired
    }

    /// Drop a relay that stopped acking or went cold.
    pub fn drop_relay(&mut self, relay: &MachineId) {
        self.relays.remove(relay);
        for set in self.known_sessions.values_mut() {
            set.remove(relay);
        }
    }

    /// Best warm relay for a target: one known to hold the target's session,
    /// else the lowest-round-trip relay as an optimistic fallback.
    pub fn relay_for(&self, target: &MachineId) -> Option<&WarmRelay> {
        if let Some(known) = self.known_sessions.get(target) {
            let best_known = self
                .relays
                .values()
                .filter(|w| known.contains(&w.relay))
                .min_by_key(|w| w.rtt.unwrap_or(Duration::MAX));
            if best_known.is_some() {
                return best_known;
            }
        }
        self.relays
            .values()
            .min_by_key(|w| w.rtt.unwrap_or(Duration::MAX))
    }

    /// Record (or revoke) knowledge that `relay` holds a session for `target`.
    pub fn note_session_knowledge(&mut self, relay: &MachineId, target: &MachineId, registered: bool) {
        if registered {
            self.known_sessions
                .entry(target.clone())
                .or_default()
                .insert(relay.clone());
        } else if let Some(set) = self.known_sessions.get_mut(target) {
            set.remove(relay);
            if set.is_empty() {
                self.known_sessions.remove(target);
            }
        }
    }
}
