//! Byte-exact little-endian wire codec.
//!
//! The layout is normative; peers built from different revisions must agree
//! on every byte:
//!
//! ```text
//! header   := u8 kind | u32 seq | u32 frame | u16 payload_len   (11 bytes)
//! string   := u16 len | len bytes of UTF-8
//! snapshot := u8[64] bios | u8[32] disc_id | u8 skip_mpeg | u32 toggles
//! address  := u8 family(4|6) | u8[4|16] ip | u16 port
//! input    := u8 side | u32 ack_frontier | u8 count | count * u8[N] records
//! ```
//!
//! All multi-byte integers are little-endian. Unlike the rest of the crate's
//! types this module never uses a serialization framework: the format is
//! fixed down to the byte, so the encoder and decoder are written by hand
//! against the layout above.

use crate::error::CodecError;
use crate::network::messages::{Message, MessageBody, MessageKind, PeerEntry};
use crate::sync_state::{SyncState, BIOS_VERSION_LEN, DISC_ID_LEN};
use crate::{Frame, Side, NUM_SYNC_INPUTS};

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 11;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Encodes a message into a fresh buffer.
///
/// # Errors
///
/// Fails only if a string or the assembled payload exceeds its u16 length
/// prefix; well-formed protocol traffic never does.
pub(crate) fn encode(msg: &Message) -> CodecResult<Vec<u8>> {
    let mut payload = Vec::with_capacity(32);
    encode_body(&msg.body, &mut payload)?;
    if payload.len() > usize::from(u16::MAX) {
        return Err(CodecError::PayloadTooLong(payload.len()));
    }

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(msg.kind() as u8);
    out.extend_from_slice(&msg.seq.to_le_bytes());
    out.extend_from_slice(&msg.frame.as_u32().to_le_bytes());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decodes one message from a datagram.
///
/// # Errors
///
/// Any structural problem yields a [`CodecError`]; the caller drops and
/// counts the datagram.
pub(crate) fn decode(bytes: &[u8]) -> CodecResult<Message> {
    let mut reader = Reader::new(bytes);
    let tag = reader.u8()?;
    let kind = MessageKind::from_u8(tag).ok_or(CodecError::UnknownKind(tag))?;
    let seq = reader.u32()?;
    let frame = Frame::new(reader.u32()?);
    let payload_len = usize::from(reader.u16()?);
    if reader.remaining() != payload_len {
        return Err(CodecError::PayloadLengthMismatch {
            announced: payload_len,
            actual: reader.remaining(),
        });
    }

    let body = decode_body(kind, &mut reader)?;
    if reader.remaining() != 0 {
        return Err(CodecError::PayloadLengthMismatch {
            announced: payload_len,
            actual: payload_len + reader.remaining(),
        });
    }
    Ok(Message { seq, frame, body })
}

fn encode_body(body: &MessageBody, out: &mut Vec<u8>) -> CodecResult<()> {
    match body {
        MessageBody::Join {
            username,
            observer,
            sync_state,
        } => {
            put_string(out, username)?;
            out.push(u8::from(*observer));
            put_sync_state(out, sync_state);
        },
        MessageBody::Accept {
            num_players,
            your_side,
            peers,
            sync_state,
        } => {
            out.push(*num_players);
            out.push(*your_side);
            out.push(peers.len() as u8);
            for peer in peers {
                out.push(peer.side);
                put_string(out, &peer.username)?;
                put_addr(out, peer.addr);
            }
            put_sync_state(out, sync_state);
        },
        MessageBody::Reject { code, text } => {
            out.push(*code);
            put_string(out, text)?;
        },
        MessageBody::Delay { input_delay } => out.push(*input_delay),
        MessageBody::Ready | MessageBody::EndSession => {},
        MessageBody::Input {
            side,
            ack_frontier,
            bytes,
        } => {
            debug_assert!(bytes.len() % NUM_SYNC_INPUTS == 0);
            out.push(side.as_u8());
            out.extend_from_slice(&ack_frontier.as_u32().to_le_bytes());
            out.push((bytes.len() / NUM_SYNC_INPUTS) as u8);
            out.extend_from_slice(bytes);
        },
        MessageBody::Ack { acked_seq } => out.extend_from_slice(&acked_seq.to_le_bytes()),
        MessageBody::Chat { username, text } => {
            put_string(out, username)?;
            put_string(out, text)?;
        },
        MessageBody::Ping { nonce } | MessageBody::Pong { nonce } => {
            out.extend_from_slice(&nonce.to_le_bytes());
        },
    }
    Ok(())
}

fn decode_body(kind: MessageKind, reader: &mut Reader<'_>) -> CodecResult<MessageBody> {
    Ok(match kind {
        MessageKind::Join => MessageBody::Join {
            username: reader.string()?,
            observer: reader.u8()? != 0,
            sync_state: reader.sync_state()?,
        },
        MessageKind::Accept => {
            let num_players = reader.u8()?;
            let your_side = reader.u8()?;
            let peer_count = usize::from(reader.u8()?);
            let mut peers = Vec::with_capacity(peer_count);
            for _ in 0..peer_count {
                let side = reader.u8()?;
                let username = reader.string()?;
                let addr = reader.addr()?;
                peers.push(PeerEntry {
                    side,
                    username,
                    addr,
                });
            }
            MessageBody::Accept {
                num_players,
                your_side,
                peers,
                sync_state: reader.sync_state()?,
            }
        },
        MessageKind::Reject => MessageBody::Reject {
            code: reader.u8()?,
            text: reader.string()?,
        },
        MessageKind::Delay => MessageBody::Delay {
            input_delay: reader.u8()?,
        },
        MessageKind::Ready => MessageBody::Ready,
        MessageKind::Input => {
            let side = reader.u8()?;
            let ack_frontier = Frame::new(reader.u32()?);
            let count = usize::from(reader.u8()?);
            if count == 0 {
                return Err(CodecError::InvalidField("input batch count"));
            }
            let bytes = reader.bytes(count * NUM_SYNC_INPUTS)?.to_vec();
            MessageBody::Input {
                side: Side::new(side),
                ack_frontier,
                bytes,
            }
        },
        MessageKind::Ack => MessageBody::Ack {
            acked_seq: reader.u32()?,
        },
        MessageKind::Chat => MessageBody::Chat {
            username: reader.string()?,
            text: reader.string()?,
        },
        MessageKind::EndSession => MessageBody::EndSession,
        MessageKind::Ping => MessageBody::Ping {
            nonce: reader.u32()?,
        },
        MessageKind::Pong => MessageBody::Pong {
            nonce: reader.u32()?,
        },
    })
}

fn put_string(out: &mut Vec<u8>, s: &str) -> CodecResult<()> {
    let bytes = s.as_bytes();
    if bytes.len() > usize::from(u16::MAX) {
        return Err(CodecError::StringTooLong(bytes.len()));
    }
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn put_addr(out: &mut Vec<u8>, addr: std::net::SocketAddr) {
    match addr.ip() {
        std::net::IpAddr::V4(ip) => {
            out.push(4);
            out.extend_from_slice(&ip.octets());
        },
        std::net::IpAddr::V6(ip) => {
            out.push(6);
            out.extend_from_slice(&ip.octets());
        },
    }
    out.extend_from_slice(&addr.port().to_le_bytes());
}

fn put_sync_state(out: &mut Vec<u8>, state: &SyncState) {
    out.extend_from_slice(&state.bios_version);
    out.extend_from_slice(&state.disc_id);
    out.push(u8::from(state.skip_mpeg_hack));
    out.extend_from_slice(&state.toggles.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn bytes(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(CodecError::Truncated {
                needed: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn u8(&mut self) -> CodecResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> CodecResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> CodecResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn string(&mut self) -> CodecResult<String> {
        let len = usize::from(self.u16()?);
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    fn addr(&mut self) -> CodecResult<std::net::SocketAddr> {
        let ip = match self.u8()? {
            4 => {
                let b = self.bytes(4)?;
                std::net::IpAddr::V4(std::net::Ipv4Addr::new(b[0], b[1], b[2], b[3]))
            },
            6 => {
                let b = self.bytes(16)?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(b);
                std::net::IpAddr::V6(std::net::Ipv6Addr::from(octets))
            },
            _ => return Err(CodecError::InvalidField("address family")),
        };
        let port = self.u16()?;
        Ok(std::net::SocketAddr::new(ip, port))
    }

    fn sync_state(&mut self) -> CodecResult<SyncState> {
        let mut bios_version = [0u8; BIOS_VERSION_LEN];
        bios_version.copy_from_slice(self.bytes(BIOS_VERSION_LEN)?);
        let mut disc_id = [0u8; DISC_ID_LEN];
        disc_id.copy_from_slice(self.bytes(DISC_ID_LEN)?);
        let skip_mpeg_hack = self.u8()? != 0;
        let toggles = self.u32()?;
        Ok(SyncState {
            bios_version,
            disc_id,
            skip_mpeg_hack,
            toggles,
        })
    }
}
