#![cfg_attr(test, allow(clippy::unwrap_used))]

//! Datagram header codec.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! +------+---------+------------+------------+---------+------------+
//! | ver  | kind    | pid        | mid        | seq     | body       |
//! | u8   | u8      | u16 len +  | u16 len +  | u64     | u16 len +  |
//! |      |         | bytes      | bytes      |         | bytes      |
//! +------+---------+------------+------------+---------+------------+
//! ```

use bytes::{Buf, BufMut};

use crate::message::{Message, MsgKind};
use weft_core::{Error, MachineId, PeerId, Result};

/// Wire protocol version. Packets with any other version byte are dropped.
pub const WIRE_VERSION: u8 = 1;

/// Hard datagram cap; larger packets are dropped without fragmentation.
pub const MAX_DATAGRAM: usize = 1400;

// ver + kind + two id length prefixes + seq + body length prefix
const FIXED_OVERHEAD: usize = 1 + 1 + 2 + 2 + 8 + 2;

/// Size of the encoded datagram for the given header fields and body length,
/// so callers can reject oversize payloads before building the message.
pub fn encoded_len(pid: &PeerId, mid: &MachineId, body_len: usize) -> usize {
    FIXED_OVERHEAD + pid.as_bytes().len() + mid.as_bytes().len() + body_len
}

/// Encode a message into a fresh buffer. Fails if the result would exceed
/// [`MAX_DATAGRAM`] or any variable-length field overflows its prefix.
pub fn encode(msg: &Message) -> Result<Vec<u8>> {
    let pid = msg.sender_pid.as_bytes();
    let mid = msg.sender_mid.as_bytes();
    if pid.len() > u16::MAX as usize || mid.len() > u16::MAX as usize {
        return Err(Error::codec("sender id exceeds length prefix"));
    }
    let total = encoded_len(&msg.sender_pid, &msg.sender_mid, msg.body.len());
    if total > MAX_DATAGRAM {
        return Err(Error::codec(format!(
            "datagram {total} bytes exceeds {MAX_DATAGRAM}"
        )));
    }

    let mut out = Vec::with_capacity(total);
    out.put_u8(WIRE_VERSION);
    out.put_u8(msg.kind as u8);
    out.put_u16(pid.len() as u16);
    out.put_slice(pid);
    out.put_u16(mid.len() as u16);
    out.put_slice(mid);
    out.put_u64(msg.seq);
    out.put_u16(msg.body.len() as u16);
    out.put_slice(&msg.body);
    Ok(out)
}

/// Decode a datagram. Any malformation, unknown version, or unknown kind is
/// an error; the dispatcher drops such packets silently.
pub fn decode(buf: &[u8]) -> Result<Message> {
    let mut cur = buf;
    if cur.remaining() < 2 {
        return Err(Error::codec("datagram shorter than header"));
    }
    let ver = cur.get_u8();
    if ver != WIRE_VERSION {
        return Err(Error::codec(format!("unsupported version {ver}")));
    }
    let kind_byte = cur.get_u8();
    let kind =
        MsgKind::try_from(kind_byte).map_err(|k| Error::codec(format!("unknown kind {k}")))?;

    let pid = read_len_prefixed(&mut cur, "sender pid")?;
    if pid.is_empty() {
        return Err(Error::codec("empty sender pid"));
    }
    let mid = read_len_prefixed(&mut cur, "sender mid")?;
    if mid.is_empty() {
        return Err(Error::codec("empty sender mid"));
    }

    if cur.remaining() < 8 {
        return Err(Error::codec("truncated seq"));
    }
    let seq = cur.get_u64();

    let body = read_len_prefixed(&mut cur, "body")?;
    if cur.has_remaining() {
        return Err(Error::codec("trailing bytes after body"));
    }

    Ok(Message {
        kind,
        sender_pid: PeerId::from_bytes(pid),
        sender_mid: MachineId::from_bytes(mid),
        seq,
        body,
    })
}

fn read_len_prefixed(cur: &mut &[u8], what: &str) -> Result<Vec<u8>> {
    if cur.remaining() < 2 {
        return Err(Error::codec(format!("truncated {what} length")));
    }
    let len = cur.get_u16() as usize;
    if cur.remaining() < len {
        return Err(Error::codec(format!("truncated {what}")));
    }
    let out = cur[..len].to_vec();
    cur.advance(len);
    Ok(out)
}
