#![cfg_attr(test, allow(clippy::unwrap_used))]

//! NAT class inference.
//!
//! Every pong carries the endpoint the responder saw our ping arrive from.
//! Collecting those observations, tagged by observer, tells this node what
//! kind of translator sits in front of it: one agreed endpoint that matches
//! a local interface means no translation at all; one agreed endpoint that
//! does not means a shared mapping; disagreement between observers means
//! per-destination mappings.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::info;

use weft_core::{MachineId, NatClass};

/// Observations older than this are ignored when classifying.
pub const OBSERVATION_HORIZON: Duration = Duration::from_secs(10 * 60);

/// Minimum distinct observers before a classification is attempted.
const MIN_OBSERVERS: usize = 2;

/// Infers this node's NAT class from endpoints reported by remote peers.
#[derive(Debug)]
pub struct NatClassifier {
    local_addrs: Vec<IpAddr>,
    /// Latest reflexive endpoint reported by each observer.
    observations: HashMap<MachineId, (SocketAddr, Instant)>,
    current: NatClass,
}

impl NatClassifier {
    pub fn new(local_addrs: Vec<IpAddr>) -> Self {
        Self {
            local_addrs,
            observations: HashMap::new(),
            current: NatClass::Unknown,
        }
    }

    /// Feed one observation. Returns the new class if it changed.
    pub fn observe(
        &mut self,
        observer: &MachineId,
        endpoint: SocketAddr,
        now: Instant,
    ) -> Option<NatClass> {
        self.observations.insert(observer.clone(), (endpoint, now));
        self.reevaluate(now)
    }

    /// Re-run classification against the current horizon; returns the new
    /// class if it changed. Called on each observation and on a timer so
    /// aging observations eventually demote a stale classification.
    pub fn reevaluate(&mut self, now: Instant) -> Option<NatClass> {
        let fresh: Vec<SocketAddr> = self
            .observations
            .values()
            .filter(|(_, at)| now.duration_since(*at) < OBSERVATION_HORIZON)
            .map(|(ep, _)| *ep)
            .collect();

        let new_class = if fresh.len() < MIN_OBSERVERS {
            NatClass::Unknown
        } else {
            let mut distinct = fresh.clone();
            distinct.sort();
            distinct.dedup();
            if distinct.len() >= 2 {
                NatClass::PerPeerEndpoint
            } else if self.local_addrs.contains(&distinct[0].ip()) {
                NatClass::Public
            } else {
                NatClass::SharedEndpoint
            }
        };

        if new_class != self.current {
            info!(old = %self.current, new = %new_class, "NAT classification changed");
            self.current = new_class;
            Some(new_class)
        } else {
            None
        }
    }

    pub fn current(&self) -> NatClass {
        self.current
    }

    /// The agreed external endpoint, when observers agree on exactly one.
    pub fn public_endpoint(&self, now: Instant) -> Option<SocketAddr> {
        if !self.current.is_shareable() {
            return None;
        }
        let mut fresh: Vec<SocketAddr> = self
            .observations
            .values()
            .filter(|(_, at)| now.duration_since(*at) < OBSERVATION_HORIZON)
            .map(|(ep, _)| *ep)
            .collect();
        fresh.sort();
        fresh.dedup();
        match fresh.as_slice() {
            [only] => Some(*only),
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
    fn ep(a: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::from((a, port))
    }

    #[test]
    fn single_observer_stays_unknown() {
        let now = Instant::now();
        let mut c = NatClassifier::new(vec![]);
        assert_eq!(c.observe(&mid(1), ep([198, 51, 100, 20], 45678), now), None);
        assert_eq!(c.current(), NatClass::Unknown);
    }

    #[test]
    fn agreeing_observers_with_foreign_addr_mean_shared_endpoint() {
        let now = Instant::now();
        let mut c = NatClassifier::new(vec![IpAddr::from([10, 0, 0, 5])]);
        let seen = ep([198, 51, 100, 20], 45678);
        c.observe(&mid(1), seen, now);
        let changed = c.observe(&mid(2), seen, now);
        assert_eq!(changed, Some(NatClass::SharedEndpoint));
        assert_eq!(c.public_endpoint(now), Some(seen));
    }

    #[test]
    fn agreeing_observers_with_local_addr_mean_public() {
        let now = Instant::now();
        let local = IpAddr::from([203, 0, 113, 50]);
        let mut c = NatClassifier::new(vec![local]);
        let seen = ep([203, 0, 113, 50], 9000);
        c.observe(&mid(1), seen, now);
        assert_eq!(c.observe(&mid(2), seen, now), Some(NatClass::Public));
    }

    #[test]
    fn disagreeing_observers_mean_per_peer_endpoint() {
        let now = Instant::now();
        let mut c = NatClassifier::new(vec![]);
        c.observe(&mid(1), ep([198, 51, 100, 20], 45678), now);
        let changed = c.observe(&mid(2), ep([198, 51, 100, 20], 45679), now);
        assert_eq!(changed, Some(NatClass::PerPeerEndpoint));
        assert_eq!(c.public_endpoint(now), None);
    }

    #[test]
    fn stale_observations_age_out_and_demote() {
        let t0 = Instant::now();
        let mut c = NatClassifier::new(vec![]);
        let seen = ep([198, 51, 100, 20], 45678);
        c.observe(&mid(1), seen, t0);
        c.observe(&mid(2), seen, t0);
        assert_eq!(c.current(), NatClass::SharedEndpoint);
        let later = t0 + OBSERVATION_HORIZON + Duration::from_secs(1);
        assert_eq!(c.reevaluate(later), Some(NatClass::Unknown));
    }

    #[test]
    fn reclassification_on_endpoint_move() {
        let now = Instant::now();
        let mut c = NatClassifier::new(vec![]);
        let old = ep([198, 51, 100, 20], 45678);
        c.observe(&mid(1), old, now);
        c.observe(&mid(2), old, now);
        assert_eq!(c.current(), NatClass::SharedEndpoint);
        // One observer now reports a second mapping: per-peer behavior.
        c.observe(&mid(1), ep([198, 51, 100, 20], 54321), now);
        assert_eq!(c.current(), NatClass::PerPeerEndpoint);
    }
}
