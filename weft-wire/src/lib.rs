#![forbid(unsafe_code)]

//! Weft mesh wire format.
//!
//! Every mesh datagram carries a fixed big-endian header (version, kind,
//! sender peer and machine ids, sequence number) followed by a kind-specific
//! body. Control bodies are CBOR; `AppData` bodies are opaque application
//! octets that this crate never inspects.

pub mod codec;
pub mod dedup;
pub mod message;

pub use codec::{decode, encode, encoded_len, MAX_DATAGRAM, WIRE_VERSION};
pub use dedup::SeqDeduper;
pub use message::{
    EndpointQueryBody, EndpointResponseBody, GossipBody, MachineAnnouncement, Message, MsgKind,
    PongBody, PunchExecuteBody, PunchFailReason, PunchRequestBody, PunchResultBody,
    RelayForwardBody, RelayForwardResultBody, RelayRegisterAckBody, RelayRegisterBody,
};
