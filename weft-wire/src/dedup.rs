//! Duplicate suppression for retransmitted datagrams.
//!
//! Each sender machine stamps a monotonically increasing sequence number on
//! every datagram. Receivers remember the (machine, seq) pairs seen over a
//! short window and drop repeats. This is loss-tolerant deduplication, not
//! anti-replay: gaps are legal, only exact repeats within the window matter.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use weft_core::MachineId;

/// How long a (machine, seq) pair stays remembered.
pub const DEDUP_WINDOW: Duration = Duration::from_secs(5);

// Sweep expired entries at most this often, amortized over observe() calls.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Sliding-window duplicate detector keyed by sender machine.
#[derive(Debug)]
pub struct SeqDeduper {
    window: Duration,
    seen: HashMap<MachineId, HashMap<u64, Instant>>,
    last_sweep: Instant,
    accepted: u64,
    duplicates: u64,
}

impl SeqDeduper {
    pub fn new(now: Instant) -> Self {
        Self::with_window(DEDUP_WINDOW, now)
    }

    pub fn with_window(window: Duration, now: Instant) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            last_sweep: now,
            accepted: 0,
            duplicates: 0,
        }
    }

    /// Record an observation. Returns true when the datagram is fresh and
    /// should be processed; false when it is a duplicate within the window.
    pub fn observe(&mut self, sender: &MachineId, seq: u64, now: Instant) -> bool {
        self.maybe_sweep(now);

        let per_sender = self.seen.entry(sender.clone()).or_default();
        match per_sender.get(&seq) {
            Some(seen_at) if now.duration_since(*seen_at) < self.window => {
                self.duplicates += 1;
                false
            }
            _ => {
                per_sender.insert(seq, now);
                self.accepted += 1;
                true
            }
        }
    }

    /// Datagrams accepted as fresh.
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Datagrams rejected as duplicates.
    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    fn maybe_sweep(&mut self, now: Instant) {
        if now.duration_since(self.last_sweep) < SWEEP_INTERVAL {
            return;
        }
        self.last_sweep = now;
        let window = self.window;
        self.seen.retain(|_, per_sender| {
            per_sender.retain(|_, seen_at| now.duration_since(*seen_at) < window);
            !per_sender.is_empty()
        });
    }
}
