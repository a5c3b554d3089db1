#![forbid(unsafe_code)]

//! Mesh configuration handling. Parses a TOML file into a strongly-typed
//! structure. Configuration is process-lifetime: it is read once before
//! `start()` and never reloaded.

use serde::Deserialize;
use std::{fs, path::Path, time::Duration};

use crate::error::{Error, Result};
use crate::types::PeerId;

/// A bootstrap contact in `peer_id@host:port` form, split into its parts.
/// The host part is kept as written; name resolution happens at contact time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPeer {
    pub peer_id: PeerId,
    pub addr: String,
}

impl BootstrapPeer {
    /// Parse `peer_id@host:port`. The peer id is hex-encoded.
    pub fn parse(s: &str) -> Result<Self> {
        let (pid, addr) = s
            .split_once('@')
            .ok_or_else(|| Error::config(format!("bootstrap entry missing '@': {s}")))?;
        let peer_id = PeerId::from_hex(pid)
            .ok_or_else(|| Error::config(format!("bootstrap entry has non-hex peer id: {s}")))?;
        if peer_id.is_empty() {
            return Err(Error::config(format!("bootstrap entry has empty peer id: {s}")));
        }
        if addr.rsplit_once(':').map_or(true, |(h, p)| {
            h.is_empty() || p.parse::<u16>().is_err()
        }) {
            return Err(Error::config(format!("bootstrap entry has bad host:port: {s}")));
        }
        Ok(Self {
            peer_id,
            addr: addr.to_string(),
        })
    }
}

/// Process-lifetime mesh configuration. All fields are optional in the TOML
/// source; defaults follow the wire-protocol constants.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MeshConfig {
    /// Ordered bootstrap contacts, `peer_id@host:port` each.
    pub bootstrap_peers: Vec<String>,

    /// Local UDP port; 0 lets the OS assign one.
    pub listen_port: u16,

    /// Serve as a relay for other peers. Unset: relay iff classified Public.
    pub can_relay: Option<bool>,

    /// Coordinate hole punches between third parties. Unset: coordinate iff
    /// first-hand contacts are available.
    pub can_coordinate_punch: Option<bool>,

    /// Warm relays to keep registered at minimum.
    pub min_warm_relays: u8,

    /// Warm relays to keep registered at most.
    pub max_warm_relays: u8,

    /// Baseline keepalive interval in milliseconds.
    pub keepalive_interval_ms: u64,

    /// Keepalive interval toward warm relays in milliseconds.
    pub warm_keepalive_ms: u64,

    /// Hole punch attempt timeout in milliseconds.
    pub punch_timeout_ms: u64,

    /// Overall outbound send deadline in milliseconds.
    pub send_deadline_ms: u64,

    /// Per-source-endpoint ingress rate limit, packets per second.
    pub rate_limit_pps: u32,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: Vec::new(),
            listen_port: 0,
            can_relay: None,
            can_coordinate_punch: None,
            min_warm_relays: 2,
            max_warm_relays: 3,
            keepalive_interval_ms: 25_000,
            warm_keepalive_ms: 30_000,
            punch_timeout_ms: 10_000,
            send_deadline_ms: 15_000,
            rate_limit_pps: 200,
        }
    }
}

impl MeshConfig {
    /// Load and validate a TOML configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let cfg: MeshConfig = toml::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check cross-field constraints and bootstrap entry syntax.
    pub fn validate(&self) -> Result<()> {
        if self.min_warm_relays > self.max_warm_relays {
            return Err(Error::config(format!(
                "min_warm_relays ({}) exceeds max_warm_relays ({})",
                self.min_warm_relays, self.max_warm_relays
            )));
        }
        if self.rate_limit_pps == 0 {
            return Err(Error::config("rate_limit_pps must be non-zero"));
        }
        if self.punch_timeout_ms == 0 || self.send_deadline_ms == 0 {
            return Err(Error::config("timeouts must be non-zero"));
        }
        for entry in &self.bootstrap_peers {
            BootstrapPeer::parse(entry)?;
        }
        Ok(())
    }

    /// Parsed bootstrap contacts, in configured order.
    pub fn bootstrap(&self) -> Vec<BootstrapPeer> {
        // validate() already proved each entry parses
        self.bootstrap_peers
            .iter()
            .filter_map(|e| BootstrapPeer::parse(e).ok())
            .collect()
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }
    pub fn warm_keepalive(&self) -> Duration {
        Duration::from_millis(self.warm_keepalive_ms)
    }
    pub fn punch_timeout(&self) -> Duration {
        Duration::from_millis(self.punch_timeout_ms)
    }
    pub fn send_deadline(&self) -> Duration {
        Duration::from_millis(self.send_deadline_ms)
    }
}
