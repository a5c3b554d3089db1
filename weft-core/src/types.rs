#![cfg_attr(test, allow(clippy::unwrap_used))]

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a peer: an opaque byte string chosen by its holder,
/// typically a public-key fingerprint or a stable UUID. Equality is by bytes.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "serde_bytes")] Vec<u8>);

impl PeerId {
    /// Wrap raw identity bytes. The bytes are not interpreted.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse a hex-encoded identity, as used in bootstrap strings.
    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", short_hex(&self.0))
    }
}

/// A device under a peer's control. A peer may have several machines;
/// endpoints and NAT classes attach to machines, not peers.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineId(#[serde(with = "serde_bytes")] Vec<u8>);

impl MachineId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        hex::decode(s).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0))
    }
}

impl fmt::Debug for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MachineId({})", short_hex(&self.0))
    }
}

/// Observed behavior of the translator between a machine and the public
/// Internet, inferred from the endpoints remote peers report seeing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NatClass {
    /// Globally reachable; the node never receives a translated mapping.
    Public,
    /// All outside observers see the same translated endpoint (full-cone-like).
    SharedEndpoint,
    /// Each destination causes a different external mapping. Such endpoints
    /// are meaningless to third parties and must not be shared.
    PerPeerEndpoint,
    /// Not enough observations yet.
    Unknown,
}

impl NatClass {
    /// Whether an endpoint of this class may be handed to third peers in
    /// gossip or endpoint responses. `Unknown` is conservatively unshareable.
    pub fn is_shareable(self) -> bool {
        matches!(self, NatClass::Public | NatClass::SharedEndpoint)
    }

    /// Whether a machine of this class can participate in a coordinated
    /// hole punch. Per-peer mappings cannot be predicted by the other side.
    pub fn allows_hole_punch(self) -> bool {
        !matches!(self, NatClass::PerPeerEndpoint)
    }
}

impl fmt::Display for NatClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NatClass::Public => "public",
            NatClass::SharedEndpoint => "shared-endpoint",
            NatClass::PerPeerEndpoint => "per-peer-endpoint",
            NatClass::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

// Full identifiers are noisy in logs; Debug prints a short hex prefix.
fn short_hex(bytes: &[u8]) -> String {
    let h = hex::encode(bytes);
    if h.len() > 16 {
        format!("{}..", &h[..16])
    } else {
        h
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_hex_roundtrip() {
        let id = PeerId::from_bytes([0x01, 0xa2, 0xff]);
        assert_eq!(format!("{id}"), "01a2ff");
        assert_eq!(PeerId::from_hex("01a2ff").unwrap(), id);
        assert!(PeerId::from_hex("xyz").is_none());
    }

    #[test]
    fn machine_id_equality_is_by_bytes() {
        let a = MachineId::from_bytes(vec![0xa1]);
        let b = MachineId::from_hex("a1").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, MachineId::from_bytes(vec![0xb1]));
    }

    #[test]
    fn nat_class_policies() {
        assert!(NatClass::Public.is_shareable());
        assert!(NatClass::SharedEndpoint.is_shareable());
        assert!(!NatClass::PerPeerEndpoint.is_shareable());
        assert!(!NatClass::Unknown.is_shareable());

        assert!(NatClass::Public.allows_hole_punch());
        assert!(NatClass::Unknown.allows_hole_punch());
        assert!(!NatClass::PerPeerEndpoint.allows_hole_punch());
    }
}
