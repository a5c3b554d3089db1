use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use weft_core::{Error, MachineId, NatClass, PeerId, Result};

/// Message kinds carried in the header's second byte. Unknown values are
/// dropped at decode time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgKind {
    Ping = 1,
    Pong = 2,
    HolePunchRequest = 3,
    HolePunchExecute = 4,
    HolePunchResult = 5,
    RelayRegister = 6,
    RelayRegisterAck = 7,
    RelayForward = 8,
    RelayForwardResult = 9,
    EndpointQuery = 10,
    EndpointResponse = 11,
    AppData = 12,
}

impl TryFrom<u8> for MsgKind {
    type Error = u8;

    fn try_from(v: u8) -> core::result::Result<Self, u8> {
        Ok(match v {
            1 => MsgKind::Ping,
            2 => MsgKind::Pong,
            3 => MsgKind::HolePunchRequest,
            4 => MsgKind::HolePunchExecute,
            5 => MsgKind::HolePunchResult,
            6 => MsgKind::RelayRegister,
            7 => MsgKind::RelayRegisterAck,
            8 => MsgKind::RelayForward,
            9 => MsgKind::RelayForwardResult,
            10 => MsgKind::EndpointQuery,
            11 => MsgKind::EndpointResponse,
            12 => MsgKind::AppData,
            other => return Err(other),
        })
    }
}

/// A decoded mesh datagram: header fields plus the raw body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MsgKind,
    pub sender_pid: PeerId,
    pub sender_mid: MachineId,
    pub seq: u64,
    pub body: Vec<u8>,
}

impl Message {
    /// Build a message with a CBOR-encoded control body.
    pub fn control<T: Serialize>(
        kind: MsgKind,
        sender_pid: PeerId,
        sender_mid: MachineId,
        seq: u64,
        body: &T,
    ) -> Result<Self> {
        Ok(Self {
            kind,
            sender_pid,
            sender_mid,
            seq,
            body: encode_body(body)?,
        })
    }

    /// Build an `AppData` message around opaque application bytes.
    pub fn app_data(sender_pid: PeerId, sender_mid: MachineId, seq: u64, payload: Vec<u8>) -> Self {
        Self {
            kind: MsgKind::AppData,
            sender_pid,
            sender_mid,
            seq,
            body: payload,
        }
    }

    /// Decode the body as the given control type.
    pub fn body_as<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        decode_body(&self.body)
    }
}

fn encode_body<T: Serialize>(v: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(v, &mut out).map_err(|e| Error::codec(format!("cbor encode: {e}")))?;
    Ok(out)
}

fn decode_body<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| Error::codec(format!("cbor decode: {e}")))
}

/// One machine-endpoint record as exchanged in gossip. The endpoint field is
/// empty whenever the record's class is not shareable; the machine id is
/// still announced so receivers learn of its existence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineAnnouncement {
    pub machine: MachineId,
    pub owner: PeerId,
    pub endpoint: Option<SocketAddr>,
    pub nat_class: NatClass,
    pub can_relay: bool,
    /// Whether the sender itself has heard from this machine directly within
    /// the freshness window. Receivers use it to rank hole-punch coordinators.
    pub first_hand: bool,
}

/// Ping body: optional full-list request plus piggybacked gossip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GossipBody {
    pub request_full_list: bool,
    pub gossip: Vec<MachineAnnouncement>,
}

/// Pong body: echoes the observed source endpoint of the ping so the sender
/// can infer its own NAT class, plus the same gossip piggyback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongBody {
    /// The endpoint this ping arrived from, as seen by the responder.
    pub your_endpoint: SocketAddr,
    /// Sequence number of the ping being answered, for RTT measurement.
    pub echo_seq: u64,
    pub request_full_list: bool,
    pub gossip: Vec<MachineAnnouncement>,
}

/// Initiator → coordinator: please mediate a punch toward `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchRequestBody {
    pub target: MachineId,
}

/// Coordinator → both parties: start the simultaneous burst now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchExecuteBody {
    /// The machine to punch toward.
    pub peer: MachineId,
    /// Its external endpoint as known to the coordinator.
    pub peer_endpoint: SocketAddr,
    /// Always true in this revision; both sides burst at the same instant.
    pub simultaneous: bool,
}

/// Failure reasons a coordinator can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PunchFailReason {
    #[serde(rename = "not-punchable")]
    NotPunchable,
    #[serde(rename = "coordinator-lost-peer")]
    CoordinatorLostPeer,
    #[serde(rename = "timeout")]
    Timeout,
}

/// Punch outcome, flowing party → coordinator and coordinator → initiator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunchResultBody {
    pub target: MachineId,
    pub success: bool,
    pub reason: Option<PunchFailReason>,
}

/// Peer → relay: open (ttl > 0) or close (ttl = 0) a warm session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRegisterBody {
    pub peer: PeerId,
    pub nat_class: NatClass,
    /// Requested session lifetime in seconds; 0 unregisters.
    pub ttl_s: u32,
}

/// Relay → peer: registration accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRegisterAckBody {
    pub slot: u32,
    pub keepalive_interval_ms: u64,
}

/// A forwarded datagram. Sender → relay carries `from = None`; the relay
/// stamps the source machine before passing it on. `inner` is a complete
/// encoded mesh datagram and is never interpreted by the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayForwardBody {
    pub dst: MachineId,
    pub from: Option<MachineId>,
    pub inner: serde_bytes::ByteBuf,
}

/// Relay → sender: forward outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayForwardResultBody {
    pub dst: MachineId,
    pub ok: bool,
    pub reason: Option<String>,
}

/// Ask a contact what it knows about a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointQueryBody {
    pub about: MachineId,
}

/// Answer to an endpoint query. `endpoint` obeys the shareability rule;
/// `registered` reports whether the machine holds a warm relay session here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointResponseBody {
    pub about: MachineId,
    pub endpoint: Option<SocketAddr>,
    pub registered: bool,
}
