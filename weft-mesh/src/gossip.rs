#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Gossip engine.
//!
//! Machine-endpoint records piggyback on every ping and pong. Each remote
//! peer gets a ledger of what was last sent to it, so ordinary exchanges
//! carry only deltas; a full list goes out when the peer asks for one or
//! has not been heard from in a while. Per-peer endpoints are never placed
//! in gossip: the machine id is announced with an empty endpoint field.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::seq::IteratorRandom;

use weft_core::{MachineId, NatClass};
use weft_wire::MachineAnnouncement;

use crate::registry::Registry;

/// A peer not exchanged with for this long gets a full list on next contact.
pub const FULL_LIST_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Fan-out cap per message; excess records are deferred by recency.
pub const MAX_RECORDS_PER_MESSAGE: usize = 32;

/// Interval of the proactive freshness ping to a random known machine.
pub const PROACTIVE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Default)]
struct PeerLedger {
    /// None until the first exchange, which always gets the full list.
    last_exchange: Option<Instant>,
    /// (endpoint, nat class) pairs as last sent, for delta suppression.
    sent: HashMap<MachineId, (Option<SocketAddr>, NatClass)>,
}

/// Chooses which records accompany each outbound ping/pong.
#[derive(Debug, Default)]
pub struct GossipEngine {
    ledgers: HashMap<MachineId, PeerLedger>,
}

impl GossipEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Select the announcements to piggyback on a message to `to`. The
    /// records considered are the registry's fresh records plus the caller's
    /// self-announcement; the destination machine itself is excluded.
    pub fn select_for(
        &mut self,
        registry: &Registry,
        to: &MachineId,
        full_requested: bool,
        self_announcement: Option<MachineAnnouncement>,
        now: Instant,
    ) -> Vec<MachineAnnouncement> {
        let ledger = self.ledgers.entry(to.clone()).or_default();
        let full = full_requested
            || ledger
                .last_exchange
                .map_or(true, |t| now.duration_since(t) >= FULL_LIST_INTERVAL);

        let mut candidates: Vec<MachineAnnouncement> = Vec::new();
        if let Some(me) = self_announcement {
            candidates.push(me);
        }
        for rec in registry.fresh_records(now) {
            if &rec.machine == to {
                continue;
            }
            candidates.push(MachineAnnouncement {
                machine: rec.machine.clone(),
                owner: rec.owner.clone(),
                endpoint: rec.shareable_endpoint(),
                nat_class: rec.nat_class,
                can_relay: rec.can_relay,
                first_hand: rec.is_first_hand(now),
            });
        }

        // Candidates arrive most-recent first (self-announcement leads), so
        // truncation defers the oldest records to a later exchange.
        let selected: Vec<MachineAnnouncement> = candidates
            .into_iter()
            .filter(|ann| {
                full || ledger.sent.get(&ann.machine) != Some(&(ann.endpoint, ann.nat_class))
            })
            .take(MAX_RECORDS_PER_MESSAGE)
            .collect();

        ledger.last_exchange = Some(now);
        for ann in &selected {
            ledger
                .sent
                .insert(ann.machine.clone(), (ann.endpoint, ann.nat_class));
        }
        selected
    }

    /// Pick the target of the proactive freshness ping: a random known
    /// machine with a shareable class and a usable endpoint.
    pub fn pick_proactive_target(
        &self,
        registry: &Registry,
        now: Instant,
    ) -> Option<(MachineId, SocketAddr)> {
        let mut rng = rand::thread_rng();
        registry
            .fresh_records(now)
            .into_iter()
            .filter(|r| r.nat_class.is_shareable())
            .filter_map(|r| r.endpoint.map(|ep| (r.machine.clone(), ep)))
            .choose(&mut rng)
    }

    /// Forget a peer's ledger (e.g. when its record goes cold).
    pub fn forget(&mut self, peer: &MachineId) {
        self.ledgers.remove(peer);
    }
}
