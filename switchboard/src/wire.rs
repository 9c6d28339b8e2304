//! Wire format for peer-to-peer frames.
//!
//! Every frame is a 4-byte big-endian length prefix followed by a
//! type-tagged payload:
//!
//! ```text
//! +--------+---------+
//! | len:u32| payload |
//! +--------+---------+
//!
//! payload (message frames):
//!   type:u8  send:u8
//!   replyAddrLen:u32  replyAddr:utf8
//!   addrLen:u32  addr:utf8
//!   senderPort:u32  senderHostLen:u32  senderHost:utf8
//!   bodyLen:u32  body:bytes (type-dependent)
//!
//! payload (ping frames): type:u8 followed by the sender NodeId only.
//! ```
//!
//! The pong is the raw single byte `0x01`, not a frame: the sending side's
//! connection holder treats any inbound byte as a liveness signal, so the
//! pong never enters the frame parser.

use std::io::{Cursor, Read, Write};
use std::sync::Arc;
use switchboard_cluster::NodeId;

use crate::body::Body;
use crate::codec::CodecRegistry;
use crate::error::WireError;
use crate::message::MessageData;

/// Maximum payload size: 1MB.
pub(crate) const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// The pong liveness byte.
pub(crate) const PONG: u8 = 0x01;

const TAG_PING: u8 = 0;
const TAG_NULL: u8 = 1;
const TAG_BOOL: u8 = 2;
const TAG_I32: u8 = 3;
const TAG_I64: u8 = 4;
const TAG_F32: u8 = 5;
const TAG_F64: u8 = 6;
const TAG_STRING: u8 = 7;
const TAG_BYTES: u8 = 8;
const TAG_JSON_OBJECT: u8 = 9;
const TAG_JSON_ARRAY: u8 = 10;
const TAG_OBJECT: u8 = 11;
const TAG_FAILURE: u8 = 12;

/// A decoded inbound frame.
#[derive(Debug)]
pub(crate) enum Frame {
    /// Liveness probe carrying the sender's identity.
    Ping { sender: NodeId },
    /// An application message.
    Message(MessageData),
}

fn body_tag(body: &Body) -> u8 {
    match body {
        Body::Null => TAG_NULL,
        Body::Bool(_) => TAG_BOOL,
        Body::I32(_) => TAG_I32,
        Body::I64(_) => TAG_I64,
        Body::F32(_) => TAG_F32,
        Body::F64(_) => TAG_F64,
        Body::String(_) => TAG_STRING,
        Body::Bytes(_) => TAG_BYTES,
        Body::JsonObject(_) => TAG_JSON_OBJECT,
        Body::JsonArray(_) => TAG_JSON_ARRAY,
        Body::Object { .. } => TAG_OBJECT,
        Body::Failure { .. } => TAG_FAILURE,
    }
}

/// Encode a message into a complete frame (length prefix included).
///
/// # Errors
///
/// Fails when an object body has no codec, the codec fails, or the encoded
/// payload exceeds [`MAX_FRAME_SIZE`].
pub(crate) fn encode_message(
    msg: &MessageData,
    codecs: &CodecRegistry,
) -> Result<Vec<u8>, WireError> {
    let mut payload = Vec::with_capacity(64);
    payload.write_all(&[body_tag(&msg.body), u8::from(msg.send)])?;
    write_string(&mut payload, msg.reply_address.as_deref().unwrap_or(""))?;
    write_string(&mut payload, &msg.address)?;
    write_sender(&mut payload, msg.sender.as_ref())?;

    let body = encode_body(&msg.body, codecs)?;
    payload.write_all(&(body.len() as u32).to_be_bytes())?;
    payload.write_all(&body)?;

    finish_frame(payload)
}

/// Encode a ping frame announcing this node's identity.
pub(crate) fn encode_ping(sender: &NodeId) -> Result<Vec<u8>, WireError> {
    let mut payload = Vec::with_capacity(32);
    payload.write_all(&[TAG_PING])?;
    write_sender(&mut payload, Some(sender))?;
    finish_frame(payload)
}

fn finish_frame(payload: Vec<u8>) -> Result<Vec<u8>, WireError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(WireError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

fn encode_body(body: &Body, codecs: &CodecRegistry) -> Result<Vec<u8>, WireError> {
    Ok(match body {
        Body::Null => Vec::new(),
        Body::Bool(v) => vec![u8::from(*v)],
        Body::I32(v) => v.to_be_bytes().to_vec(),
        Body::I64(v) => v.to_be_bytes().to_vec(),
        Body::F32(v) => v.to_bits().to_be_bytes().to_vec(),
        Body::F64(v) => v.to_bits().to_be_bytes().to_vec(),
        Body::String(v) => v.as_bytes().to_vec(),
        Body::Bytes(v) => v.to_vec(),
        Body::JsonObject(v) => serde_json::to_vec(&**v)?,
        Body::JsonArray(v) => serde_json::to_vec(&**v)?,
        Body::Object { type_name, value } => {
            let codec = codecs
                .get(type_name)
                .ok_or_else(|| WireError::UnknownBodyType(type_name.clone()))?;
            let encoded = codec.encode(value.as_ref())?;
            let mut out = Vec::with_capacity(4 + type_name.len() + encoded.len());
            write_string(&mut out, type_name)?;
            out.extend_from_slice(&encoded);
            out
        }
        Body::Failure { code, message } => {
            let mut out = Vec::with_capacity(4 + message.len());
            out.extend_from_slice(&code.to_be_bytes());
            out.extend_from_slice(message.as_bytes());
            out
        }
    })
}

/// Extract the next complete frame from `buf`, if one is available.
///
/// TCP reads deliver partial frames, whole frames and runs of concatenated
/// frames; callers accumulate into `buf` and loop this until it returns
/// `Ok(None)` (more data needed). Consumed bytes are drained from the
/// front of `buf`. A malformed frame is consumed before the error is
/// returned, so the caller can keep parsing subsequent frames.
pub(crate) fn try_decode_frame(
    buf: &mut Vec<u8>,
    codecs: &CodecRegistry,
) -> Result<Option<Frame>, WireError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_SIZE {
        // Unrecoverable: the stream offset is lost.
        buf.clear();
        return Err(WireError::FrameTooLarge {
            size: len,
            max: MAX_FRAME_SIZE,
        });
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let payload: Vec<u8> = buf.drain(..4 + len).skip(4).collect();
    decode_payload(&payload, codecs).map(Some)
}

fn decode_payload(payload: &[u8], codecs: &CodecRegistry) -> Result<Frame, WireError> {
    let mut cursor = Cursor::new(payload);
    let tag = read_u8(&mut cursor)?;

    if tag == TAG_PING {
        let sender = read_sender(&mut cursor)?
            .ok_or_else(|| WireError::Codec("ping frame without sender".to_string()))?;
        return Ok(Frame::Ping { sender });
    }

    let send = read_u8(&mut cursor)? != 0;
    let reply_address = read_string(&mut cursor, "reply address")?;
    let address = read_string(&mut cursor, "address")?;
    let sender = read_sender(&mut cursor)?;

    let body_len = read_u32(&mut cursor)? as usize;
    check_remaining(&cursor, body_len)?;
    let mut body_bytes = vec![0u8; body_len];
    cursor.read_exact(&mut body_bytes)?;
    let body = decode_body(tag, &body_bytes, codecs)?;

    Ok(Frame::Message(MessageData {
        send,
        address,
        reply_address: if reply_address.is_empty() {
            None
        } else {
            Some(reply_address)
        },
        sender,
        body,
    }))
}

fn decode_body(tag: u8, bytes: &[u8], codecs: &CodecRegistry) -> Result<Body, WireError> {
    let mut cursor = Cursor::new(bytes);
    Ok(match tag {
        TAG_NULL => Body::Null,
        TAG_BOOL => Body::Bool(read_u8(&mut cursor)? != 0),
        TAG_I32 => Body::I32(i32::from_be_bytes(read_array(&mut cursor)?)),
        TAG_I64 => Body::I64(i64::from_be_bytes(read_array(&mut cursor)?)),
        TAG_F32 => Body::F32(f32::from_bits(u32::from_be_bytes(read_array(&mut cursor)?))),
        TAG_F64 => Body::F64(f64::from_bits(u64::from_be_bytes(read_array(&mut cursor)?))),
        TAG_STRING => Body::String(Arc::from(
            std::str::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8("string body"))?,
        )),
        TAG_BYTES => Body::Bytes(Arc::from(bytes)),
        TAG_JSON_OBJECT => Body::JsonObject(Arc::new(serde_json::from_slice(bytes)?)),
        TAG_JSON_ARRAY => Body::JsonArray(Arc::new(serde_json::from_slice(bytes)?)),
        TAG_OBJECT => {
            let type_name = read_string(&mut cursor, "body type name")?;
            let codec = codecs
                .get(&type_name)
                .ok_or_else(|| WireError::UnknownBodyType(type_name.clone()))?;
            let rest = &bytes[cursor.position() as usize..];
            Body::Object {
                value: codec.decode(rest)?,
                type_name,
            }
        }
        TAG_FAILURE => {
            let code = i32::from_be_bytes(read_array(&mut cursor)?);
            let rest = &bytes[cursor.position() as usize..];
            Body::Failure {
                code,
                message: std::str::from_utf8(rest)
                    .map_err(|_| WireError::InvalidUtf8("failure message"))?
                    .to_string(),
            }
        }
        other => return Err(WireError::InvalidTypeTag(other)),
    })
}

fn write_string(out: &mut Vec<u8>, s: &str) -> Result<(), WireError> {
    out.write_all(&(s.len() as u32).to_be_bytes())?;
    out.write_all(s.as_bytes())?;
    Ok(())
}

fn write_sender(out: &mut Vec<u8>, sender: Option<&NodeId>) -> Result<(), WireError> {
    match sender {
        Some(node) => {
            out.write_all(&u32::from(node.port()).to_be_bytes())?;
            write_string(out, node.host())?;
        }
        None => {
            out.write_all(&0u32.to_be_bytes())?;
            write_string(out, "")?;
        }
    }
    Ok(())
}

fn read_sender(cursor: &mut Cursor<&[u8]>) -> Result<Option<NodeId>, WireError> {
    let port = read_u32(cursor)?;
    let host = read_string(cursor, "sender host")?;
    if host.is_empty() {
        Ok(None)
    } else {
        Ok(Some(NodeId::new(host, port as u16)))
    }
}

fn read_u8(cursor: &mut Cursor<&[u8]>) -> Result<u8, WireError> {
    let mut buf = [0u8; 1];
    cursor.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>) -> Result<u32, WireError> {
    let mut buf = [0u8; 4];
    cursor.read_exact(&mut buf)?;
    Ok(u32::from_be_bytes(buf))
}

fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>) -> Result<[u8; N], WireError> {
    let mut buf = [0u8; N];
    cursor.read_exact(&mut buf)?;
    Ok(buf)
}

/// Guard allocations against corrupt length fields: never trust a length
/// beyond what the frame actually holds.
fn check_remaining(cursor: &Cursor<&[u8]>, needed: usize) -> Result<(), WireError> {
    let remaining = cursor
        .get_ref()
        .len()
        .saturating_sub(cursor.position() as usize);
    if needed > remaining {
        return Err(WireError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "truncated frame",
        )));
    }
    Ok(())
}

fn read_string(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<String, WireError> {
    let len = read_u32(cursor)? as usize;
    check_remaining(cursor, len)?;
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8(field))
}
