#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Peer/machine registry.
//!
//! One record per known machine, plus a contact multimap recording who has
//! gossiped about whom. Records are created on first observation (direct
//! contact or gossip), refreshed on every subsequent contact, and dropped
//! once cold. The registry is a plain struct; the owning node serializes
//! access behind its state lock.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::debug;

use weft_core::{MachineId, NatClass, PeerId};
use weft_wire::MachineAnnouncement;

/// How recently a machine must have been heard from directly to count as a
/// first-hand contact.
pub const FIRST_HAND_WINDOW: Duration = Duration::from_secs(120);

/// A record with no evidence from any source for this long is cold and
/// eligible for eviction.
pub const COLD_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Contact entries older than this are purged lazily on query.
pub const CONTACT_FRESHNESS: Duration = Duration::from_secs(30 * 60);

/// Everything known about one machine.
#[derive(Debug, Clone)]
pub struct MachineRecord {
    pub machine: MachineId,
    pub owner: PeerId,
    /// Last-known external endpoint, if any.
    pub endpoint: Option<SocketAddr>,
    pub nat_class: NatClass,
    pub can_relay: bool,
    pub last_seen: Instant,
    /// When this node last received a datagram from the machine directly.
    first_hand_at: Option<Instant>,
    /// Endpoint each gossiping machine last told us, for change detection.
    endpoint_sent_to_us_by: HashMap<MachineId, SocketAddr>,
}

impl MachineRecord {
    pub fn is_first_hand(&self, now: Instant) -> bool {
        self.first_hand_at
            .is_some_and(|at| now.duration_since(at) < FIRST_HAND_WINDOW)
    }

    pub fn is_cold(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) >= COLD_TIMEOUT
    }

    /// The endpoint as it may appear in outbound gossip: present only for
    /// shareable NAT classes.
    pub fn shareable_endpoint(&self) -> Option<SocketAddr> {
        if self.nat_class.is_shareable() {
            self.endpoint
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ContactEntry {
    last_heard: Instant,
    /// Whether the contact claims first-hand knowledge of the machine.
    first_hand: bool,
}

/// Outcome of an upsert, used to decide whether paths and gossip need a nudge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub is_new: bool,
    pub endpoint_changed: bool,
}

/// Registry of machines, their owners, and the gossip contact graph.
#[derive(Debug, Default)]
pub struct Registry {
    machines: HashMap<MachineId, MachineRecord>,
    /// about-machine → (contact machine → entry). "Contact has gossiped
    /// about machine"; used to choose whom to ask for help reaching it.
    contacts: HashMap<MachineId, HashMap<MachineId, ContactEntry>>,
    /// Owner index.
    peers: HashMap<PeerId, HashSet<MachineId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record direct evidence: a datagram arrived from this machine at this
    /// endpoint. NAT class is only overwritten when the caller knows it.
    pub fn upsert_observation(
        &mut self,
        machine: &MachineId,
        owner: &PeerId,
        endpoint: SocketAddr,
        nat_class: Option<NatClass>,
        can_relay: Option<bool>,
        now: Instant,
    ) -> UpsertOutcome {
        let is_new = !self.machines.contains_key(machine);
        let rec = self.machines.entry(machine.clone()).or_insert_with(|| MachineRecord {
            machine: machine.clone(),
            owner: owner.clone(),
            endpoint: None,
            nat_class: NatClass::Unknown,
            can_relay: false,
            last_seen: now,
            first_hand_at: None,
            endpoint_sent_to_us_by: HashMap::new(),
        });
        let endpoint_changed = rec.endpoint != Some(endpoint);
        if endpoint_changed && !is_new {
            debug!(machine = %machine, old = ?rec.endpoint, new = %endpoint, "machine endpoint moved");
        }
        rec.endpoint = Some(endpoint);
        rec.last_seen = now;
        rec.first_hand_at = Some(now);
        if let Some(class) = nat_class {
            rec.nat_class = class;
        }
        if let Some(relay) = can_relay {
            rec.can_relay = relay;
        }
        self.peers
            .entry(owner.clone())
            .or_default()
            .insert(machine.clone());
        UpsertOutcome {
            is_new,
            endpoint_changed,
        }
    }

    /// Record second-hand evidence from a gossip announcement, and remember
    /// the gossiper as a contact for the announced machine.
    pub fn record_gossip(
        &mut self,
        from: &MachineId,
        ann: &MachineAnnouncement,
        now: Instant,
    ) -> UpsertOutcome {
        let is_new = !self.machines.contains_key(&ann.machine);
        let rec = self.machines.entry(ann.machine.clone()).or_insert_with(|| MachineRecord {
            machine: ann.machine.clone(),
            owner: ann.owner.clone(),
            endpoint: None,
            nat_class: NatClass::Unknown,
            can_relay: false,
            last_seen: now,
            first_hand_at: None,
            endpoint_sent_to_us_by: HashMap::new(),
        });
        rec.last_seen = now;
        rec.nat_class = ann.nat_class;
        rec.can_relay = ann.can_relay;

        // Gossip never downgrades first-hand knowledge of an endpoint; only
        // adopt the gossiped endpoint when we have none, or when the same
        // gossiper reports a change from what it previously told us.
        let mut endpoint_changed = false;
        if let Some(ep) = ann.endpoint {
            let previous_from_sender = rec.endpoint_sent_to_us_by.insert(from.clone(), ep);
            let sender_reports_change = previous_from_sender != Some(ep);
            if rec.endpoint.is_none() || (sender_reports_change && !rec.is_first_hand(now)) {
                endpoint_changed = rec.endpoint != Some(ep);
                rec.endpoint = Some(ep);
            }
        }

        self.peers
            .entry(ann.owner.clone())
            .or_default()
            .insert(ann.machine.clone());
        self.contacts
            .entry(ann.machine.clone())
            .or_default()
            .insert(
                from.clone(),
                ContactEntry {
                    last_heard: now,
                    first_hand: ann.first_hand,
                },
            );
        UpsertOutcome {
            is_new,
            endpoint_changed,
        }
    }

    pub fn get_machine(&self, machine: &MachineId) -> Option<&MachineRecord> {
        self.machines.get(machine)
    }

    /// Contacts that might help reach `machine`, best first. Ordering policy:
    /// (1) first-hand claim and shareable class, (2) first-hand claim,
    /// (3) shareable class, (4) the rest; ties broken by freshness. Entries
    /// past the freshness window are purged here.
    pub fn contacts_for(&mut self, machine: &MachineId, now: Instant) -> Vec<MachineId> {
        let Some(entries) = self.contacts.get_mut(machine) else {
            return Vec::new();
        };
        entries.retain(|_, e| now.duration_since(e.last_heard) < CONTACT_FRESHNESS);

        let mut ranked: Vec<(u8, Instant, MachineId)> = entries
            .iter()
            .filter_map(|(contact, e)| {
                let rec = self.machines.get(contact)?;
                let shareable = rec.nat_class.is_shareable();
                let tier = match (e.first_hand, shareable) {
                    (true, true) => 0u8,
                    (true, false) => 1,
                    (false, true) => 2,
                    (false, false) => 3,
                };
                Some((tier, e.last_heard, contact.clone()))
            })
            .collect();
        ranked.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.cmp(&a.1)));
        ranked.into_iter().map(|(_, _, c)| c).collect()
    }

    /// The machine to use for outbound traffic to a peer: most recently
    /// seen, non-cold.
    pub fn machine_for_peer(&self, peer: &PeerId, now: Instant) -> Option<&MachineRecord> {
        self.peers
            .get(peer)?
            .iter()
            .filter_map(|m| self.machines.get(m))
            .filter(|r| !r.is_cold(now))
            .max_by_key(|r| r.last_seen)
    }

    /// All peers with at least one non-cold machine.
    pub fn known_peers(&self, now: Instant) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|(_, machines)| {
                machines
                    .iter()
                    .filter_map(|m| self.machines.get(m))
                    .any(|r| !r.is_cold(now))
            })
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Non-cold records, most recent first; the gossip engine's source set.
    pub fn fresh_records(&self, now: Instant) -> Vec<&MachineRecord> {
        let mut recs: Vec<&MachineRecord> =
            self.machines.values().filter(|r| !r.is_cold(now)).collect();
        recs.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        recs
    }

    /// Whether any machine qualifies as a first-hand contact right now.
    pub fn has_first_hand_contacts(&self, now: Instant) -> bool {
        self.machines.values().any(|r| r.is_first_hand(now))
    }

    /// Drop cold records and their index entries.
    pub fn purge_cold(&mut self, now: Instant) -> usize {
        let cold: Vec<MachineId> = self
            .machines
            .iter()
            .filter(|(_, r)| r.is_cold(now))
            .map(|(m, _)| m.clone())
            .collect();
        for machine in &cold {
            if let Some(rec) = self.machines.remove(machine) {
                if let Some(set) = self.peers.get_mut(&rec.owner) {
                    set.remove(machine);
                    if set.is_empty() {
                        self.peers.remove(&rec.owner);
                    }
                }
            }
            self.contacts.remove(machine);
        }
        for entries in self.contacts.values_mut() {
            entries.retain(|contact, _| self.machines.contains_key(contact));
        }
        cold.len()
    }

    pub fn machine_count(&self) -> usize {
        self.machines.len()
    }
}
