#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Three-party hole punching.
//!
//! Roles: an initiator that wants a direct path, a target behind (possibly)
//! a restrictive translator, and a coordinator that both parties already
//! talk to first-hand. The coordinator tells both sides to emit a small
//! burst toward each other's external endpoint at the same instant; the
//! first datagram that lands in either direction opens the pair of NAT
//! mappings. Coordination is bidirectional even when the initiator is
//! public, keeping the protocol single-flow for every NAT combination.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

use weft_core::MachineId;
use weft_wire::{PunchExecuteBody, PunchFailReason};

use crate::registry::Registry;

/// Packets in the simultaneous burst, and their spacing.
pub const PUNCH_BURST: usize = 3;
pub const PUNCH_BURST_SPACING: Duration = Duration::from_millis(50);

/// Coordinator-side state for one (initiator, target) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordPhase {
    /// Execute delivered to both parties; counting results.
    ExecuteSent { results: u8 },
}

#[derive(Debug)]
struct CoordEntry {
    phase: CoordPhase,
    started: Instant,
}

/// What the coordinator should do with an incoming punch request.
#[derive(Debug, PartialEq, Eq)]
pub enum CoordDecision {
    /// Send an execute to each party; the punch is now in flight.
    Execute {
        to_initiator: (SocketAddr, PunchExecuteBody),
        to_target: (SocketAddr, PunchExecuteBody),
    },
    /// Refuse, with the reason to report back to the initiator.
    Reject(PunchFailReason),
    /// A punch for this pair is already in flight; collapse the duplicate.
    Duplicate,
}

/// Mediates punches between third parties.
#[derive(Debug, Default)]
pub struct PunchCoordinator {
    entries: HashMap<(MachineId, MachineId), CoordEntry>,
}

impl PunchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    // Concurrent A-about-B and B-about-A requests collapse onto one entry.
    fn pair_key(a: &MachineId, b: &MachineId) -> (MachineId, MachineId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    /// Handle a punch request from `initiator` about `target`. Both must be
    /// first-hand contacts with known endpoints; targets with per-peer
    /// mappings are not punchable and the initiator is told so.
    pub fn handle_request(
        &mut self,
        initiator: &MachineId,
        initiator_endpoint: SocketAddr,
        target: &MachineId,
        registry: &Registry,
        now: Instant,
    ) -> CoordDecision {
        let key = Self::pair_key(initiator, target);
        if self.entries.contains_key(&key) {
            debug!(initiator = %initiator, target = %target, "punch already in flight, collapsing");
            return CoordDecision::Duplicate;
        }

        let Some(target_rec) = registry.get_machine(target) else {
            return CoordDecision::Reject(PunchFailReason::CoordinatorLostPeer);
        };
        if !target_rec.is_first_hand(now) {
            return CoordDecision::Reject(PunchFailReason::CoordinatorLostPeer);
        }
        let Some(target_endpoint) = target_rec.endpoint else {
            return CoordDecision::Reject(PunchFailReason::CoordinatorLostPeer);
        };
        if !target_rec.nat_class.allows_hole_punch() {
            return CoordDecision::Reject(PunchFailReason::NotPunchable);
        }

        self.entries.insert(
            key,
            CoordEntry {
                phase: CoordPhase::ExecuteSent { results: 0 },
                started: now,
            },
        );
        CoordDecision::Execute {
            to_initiator: (
                initiator_endpoint,
                PunchExecuteBody {
                    peer: target.clone(),
                    peer_endpoint: target_endpoint,
                    simultaneous: true,
                },
            ),
            to_target: (
                target_endpoint,
                PunchExecuteBody {
                    peer: initiator.clone(),
                    peer_endpoint: initiator_endpoint,
                    simultaneous: true,
                },
            ),
        }
    }

    /// A party reported its punch result. Returns true when the pair is done
    /// (both results in) and the entry has been retired.
    pub fn note_result(&mut self, from: &MachineId, about: &MachineId) -> bool {
        let key = Self::pair_key(from, about);
        let Some(entry) = self.entries.get_mut(&key) else {
            return false;
        };
        let CoordPhase::ExecuteSent { results } = &mut entry.phase;
        *results += 1;
        if *results >= 2 {
            self.entries.remove(&key);
            true
        } else {
            false
        }
    }

    /// Retire pairs whose punch window has elapsed.
    pub fn sweep(&mut self, timeout: Duration, now: Instant) {
        self.entries
            .retain(|_, e| now.duration_since(e.started) < timeout);
    }

    pub fn in_flight(&self) -> usize {
        self.entries.len()
    }
}

/// An application payload parked while a punch (or relay fallback) resolves.
#[derive(Debug)]
pub struct QueuedSend {
    pub frame: Vec<u8>,
    pub deadline: Instant,
}

#[derive(Debug)]
struct Attempt {
    coordinator: MachineId,
    started: Instant,
    queued: Vec<QueuedSend>,
}

/// Initiator-side single-flight table: at most one outstanding punch per
/// target; concurrent sends pile their payloads onto the existing attempt.
#[derive(Debug, Default)]
pub struct PunchAttempts {
    in_flight: HashMap<MachineId, Attempt>,
}

impl PunchAttempts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start an attempt toward `target` via `coordinator`. Returns false if
    /// one is already outstanding (the caller must not send another request).
    pub fn begin(&mut self, target: &MachineId, coordinator: MachineId, now: Instant) -> bool {
        if self.in_flight.contains_key(target) {
            return false;
        }
        self.in_flight.insert(
            target.clone(),
            Attempt {
                coordinator,
                started: now,
                queued: Vec::new(),
            },
        );
        true
    }

    pub fn is_pending(&self, target: &MachineId) -> bool {
        self.in_flight.contains_key(target)
    }

    pub fn coordinator_of(&self, target: &MachineId) -> Option<&MachineId> {
        self.in_flight.get(target).map(|a| &a.coordinator)
    }

    /// Park a payload on the pending attempt.
    pub fn queue_payload(&mut self, target: &MachineId, frame: Vec<u8>, deadline: Instant) -> bool {
        match self.in_flight.get_mut(target) {
            Some(attempt) => {
                attempt.queued.push(QueuedSend { frame, deadline });
                true
            }
            None => false,
        }
    }

    /// The punch landed: retire the attempt and hand back parked payloads.
    pub fn complete(&mut self, target: &MachineId) -> Option<Vec<QueuedSend>> {
        self.in_flight.remove(target).map(|a| a.queued)
    }

    /// Attempts past the punch timeout, with their parked payloads.
    pub fn sweep(&mut self, timeout: Duration, now: Instant) -> Vec<(MachineId, Vec<QueuedSend>)> {
        let expired: Vec<MachineId> = self
            .in_flight
            .iter()
            .filter(|(_, a)| now.duration_since(a.started) >= timeout)
            .map(|(m, _)| m.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|m| self.in_flight.remove(&m).map(|a| (m, a.queued)))
            .collect()
    }
}
