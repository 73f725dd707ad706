// src/packet.rs
//! Danmaku server packet framing.
//!
//! Every packet starts with a 16 byte big-endian header:
//! `packet_len: u32 | header_len: u16 | protover: u16 | operation: u32 | sequence: u32`.
//! Protocol 2 bodies are zlib streams holding further packets.

use crate::error::FrameError;
use crate::types::{LiveMessage, RoomId};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use serde_json::Value;
use std::io::Read;

pub const HEADER_LEN: usize = 16;

pub const OP_HEARTBEAT: u32 = 2;
pub const OP_HEARTBEAT_REPLY: u32 = 3;
pub const OP_MESSAGE: u32 = 5;
pub const OP_ENTER: u32 = 7;
pub const OP_ENTER_REPLY: u32 = 8;

const PROTO_JSON: u16 = 0;
const PROTO_INT: u16 = 1;
const PROTO_ZLIB: u16 = 2;

pub fn encode(operation: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + body.len());
    buf.put_u32((HEADER_LEN + body.len()) as u32);
    buf.put_u16(HEADER_LEN as u16);
    buf.put_u16(PROTO_INT);
    buf.put_u32(operation);
    buf.put_u32(1);
    buf.put_slice(body);
    buf.freeze()
}

/// The enter-room packet. Asks for zlib bodies so flate2 can read everything we receive.
pub fn enter_room(room: RoomId, guest_uid: i64) -> Bytes {
    let body = serde_json::json!({
        "uid": guest_uid,
        "roomid": room,
        "protover": PROTO_ZLIB,
        "platform": "web",
        "type": 2,
    });
    encode(OP_ENTER, body.to_string().as_bytes())
}

pub fn heartbeat() -> Bytes {
    encode(OP_HEARTBEAT, b"[object Object]")
}

/// Decodes one WebSocket frame, which may carry several packets.
pub fn decode(frame: &[u8]) -> Result<Vec<LiveMessage>, FrameError> {
    let mut out = Vec::new();
    decode_into(frame, &mut out)?;
    Ok(out)
}

fn decode_into(mut buf: &[u8], out: &mut Vec<LiveMessage>) -> Result<(), FrameError> {
    while !buf.is_empty() {
        if buf.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                available: buf.len(),
            });
        }

        let mut header = &buf[..HEADER_LEN];
        let packet_len = header.get_u32() as usize;
        let header_len = header.get_u16() as usize;
        let protover = header.get_u16();
        let operation = header.get_u32();

        if header_len < HEADER_LEN || header_len > packet_len {
            return Err(FrameError::InvalidHeader(header_len));
        }
        if buf.len() < packet_len {
            return Err(FrameError::Truncated {
                needed: packet_len,
                available: buf.len(),
            });
        }

        let body = &buf[header_len..packet_len];
        match operation {
            OP_HEARTBEAT_REPLY => {
                let mut body = body;
                let popularity = if body.len() >= 4 { body.get_u32() } else { 0 };
                out.push(LiveMessage::heartbeat_reply(popularity));
            }
            OP_MESSAGE => match protover {
                PROTO_JSON | PROTO_INT => out.push(parse_message(body)?),
                PROTO_ZLIB => {
                    let mut inflated = Vec::new();
                    ZlibDecoder::new(body).read_to_end(&mut inflated)?;
                    decode_into(&inflated, out)?;
                }
                other => return Err(FrameError::UnsupportedProtocol(other)),
            },
            // enter acknowledgement and anything unknown carry nothing for subscribers
            _ => {}
        }

        buf = &buf[packet_len..];
    }
    Ok(())
}

fn parse_message(body: &[u8]) -> Result<LiveMessage, FrameError> {
    let value: Value = serde_json::from_slice(body)?;
    let cmd = value
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingCommand)?;
    // some commands carry a suffix, e.g. `DANMU_MSG:4:0:2:2:2:0`
    let cmd = cmd.split(':').next().unwrap_or(cmd);
    Ok(LiveMessage::new(cmd, Bytes::copy_from_slice(body)))
}
