#![forbid(unsafe_code)]

//! Weft mesh overlay core.
//!
//! A best-effort, datagram-oriented transport between long-lived peer
//! identities over the public Internet, in the presence of NATs and churn.
//! Given a destination peer, the node delivers opaque payloads over a
//! direct UDP path, a hole-punched direct path coordinated by a mutual
//! contact, or a single-hop relay through a publicly reachable peer.
//!
//! ## Design
//! - One UDP socket, one task-serialized state block
//! - Endpoint discovery and NAT-class inference from peer observations
//! - Machine-endpoint gossip piggybacked on ping/pong
//! - Three-party hole punching with single-flight attempts
//! - Warm relays kept registered for instant roaming failover

pub mod classifier;
pub mod gossip;
pub mod keepalive;
pub mod node;
pub mod path;
pub mod punch;
pub mod registry;
pub mod relay;

pub use node::{MeshNode, MeshStatistics, MessageHandler, SendOutcome};
pub use path::PathChoice;
pub use registry::{MachineRecord, Registry};

// Re-export the identity and configuration types callers need.
pub use weft_core::{BootstrapPeer, Error, MachineId, MeshConfig, NatClass, PeerId, Result};
