//! Framed binary protocol codec.
//!
//! Stateless encode/decode of the key/value wire format. A packet is a
//! 24-byte header followed by frame-extras, extras, key, and value; the body
//! length field covers all four sections. Two request magics exist: the
//! normal request and the alt request, which carries a one-byte frame-extras
//! length (byte 2) and shrinks the key length to one byte (byte 3).
//!
//! Decoding returns views into the inbound buffer (`Bytes::split_to`); the
//! hot path never copies payload bytes.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Fixed header size for both requests and responses.
pub const HEADER_LEN: usize = 24;
/// Protocol limit on key length, before any collection-id prefix.
pub const MAX_KEY_LEN: usize = 250;

/// Magic byte for a normal request.
pub const MAGIC_REQUEST: u8 = 0x80;
/// Magic byte for a response.
pub const MAGIC_RESPONSE: u8 = 0x81;
/// Magic byte for a request carrying frame-extras.
pub const MAGIC_ALT_REQUEST: u8 = 0x08;

/// Datatype bit: uninterpreted bytes.
pub const DATATYPE_RAW: u8 = 0x00;
/// Datatype bit: the value is JSON.
pub const DATATYPE_JSON: u8 = 0x01;
/// Datatype bit: the value is snappy-compressed.
pub const DATATYPE_SNAPPY: u8 = 0x02;

/// Opcodes used by the KV pipeline and the proxy tool.
pub mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const REPLACE: u8 = 0x03;
    pub const DELETE: u8 = 0x04;
    pub const VERSION: u8 = 0x0b;
    pub const APPEND: u8 = 0x0e;
    pub const PREPEND: u8 = 0x0f;
    pub const STAT: u8 = 0x10;
    pub const GET_AND_TOUCH: u8 = 0x1d;
    pub const GET_REPLICA: u8 = 0x83;
    pub const OBSERVE_SEQNO: u8 = 0x91;
    pub const OBSERVE: u8 = 0x92;
    pub const GET_LOCKED: u8 = 0x94;
    pub const GET_COLLECTION_ID: u8 = 0xbb;
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    TooBig,
    Invalid,
    NotStored,
    NotMyVbucket,
    Locked,
    OutOfMemory,
    Busy,
    TemporaryFailure,
    UnknownCollection,
    Unknown(u16),
}

impl Status {
    /// Decode a wire status.
    pub fn from_u16(raw: u16) -> Status {
        match raw {
            0x00 => Status::Success,
            0x01 => Status::KeyNotFound,
            0x02 => Status::KeyExists,
            0x03 => Status::TooBig,
            0x04 => Status::Invalid,
            0x05 => Status::NotStored,
            0x07 => Status::NotMyVbucket,
            0x09 => Status::Locked,
            0x82 => Status::OutOfMemory,
            0x85 => Status::Busy,
            0x86 => Status::TemporaryFailure,
            0x88 => Status::UnknownCollection,
            other => Status::Unknown(other),
        }
    }

    /// Encode to the wire representation.
    pub fn to_u16(self) -> u16 {
        match self {
            Status::Success => 0x00,
            Status::KeyNotFound => 0x01,
            Status::KeyExists => 0x02,
            Status::TooBig => 0x03,
            Status::Invalid => 0x04,
            Status::NotStored => 0x05,
            Status::NotMyVbucket => 0x07,
            Status::Locked => 0x09,
            Status::OutOfMemory => 0x82,
            Status::Busy => 0x85,
            Status::TemporaryFailure => 0x86,
            Status::UnknownCollection => 0x88,
            Status::Unknown(other) => other,
        }
    }
}

/// A request as it appears on the wire, minus the opaque assigned at dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestPacket {
    pub opcode: u8,
    pub datatype: u8,
    pub vbucket: u16,
    pub opaque: u32,
    pub cas: u64,
    /// Non-empty frame-extras switch the packet to the alt-request magic.
    pub frame_extras: Bytes,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl RequestPacket {
    /// Empty request for the given opcode.
    pub fn new(opcode: u8) -> RequestPacket {
        RequestPacket {
            opcode,
            datatype: DATATYPE_RAW,
            vbucket: 0,
            opaque: 0,
            cas: 0,
            frame_extras: Bytes::new(),
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Total body length: frame-extras + extras + key + value.
    pub fn body_len(&self) -> usize {
        self.frame_extras.len() + self.extras.len() + self.key.len() + self.value.len()
    }
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponsePacket {
    pub opcode: u8,
    pub datatype: u8,
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl ResponsePacket {
    /// Empty response for the given opcode and status.
    pub fn new(opcode: u8, status: Status) -> ResponsePacket {
        ResponsePacket {
            opcode,
            datatype: DATATYPE_RAW,
            status,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Total body length: extras + key + value.
    pub fn body_len(&self) -> usize {
        self.extras.len() + self.key.len() + self.value.len()
    }
}

fn protocol_error(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Write a request, selecting the alt magic when frame-extras are present.
pub fn put_request(pkt: &RequestPacket, dst: &mut BytesMut) -> io::Result<()> {
    let alt = !pkt.frame_extras.is_empty();
    if alt && (pkt.frame_extras.len() > u8::MAX as usize || pkt.key.len() > u8::MAX as usize) {
        return Err(protocol_error(
            "alt request frame-extras or key too long".to_string(),
        ));
    }
    if pkt.key.len() > u16::MAX as usize || pkt.extras.len() > u8::MAX as usize {
        return Err(protocol_error("request key or extras too long".to_string()));
    }
    dst.reserve(HEADER_LEN + pkt.body_len());
    if alt {
        dst.put_u8(MAGIC_ALT_REQUEST);
        dst.put_u8(pkt.opcode);
        dst.put_u8(pkt.frame_extras.len() as u8);
        dst.put_u8(pkt.key.len() as u8);
    } else {
        dst.put_u8(MAGIC_REQUEST);
        dst.put_u8(pkt.opcode);
        dst.put_u16(pkt.key.len() as u16);
    }
    dst.put_u8(pkt.extras.len() as u8);
    dst.put_u8(pkt.datatype);
    dst.put_u16(pkt.vbucket);
    dst.put_u32(pkt.body_len() as u32);
    dst.put_u32(pkt.opaque);
    dst.put_u64(pkt.cas);
    dst.extend_from_slice(&pkt.frame_extras);
    dst.extend_from_slice(&pkt.extras);
    dst.extend_from_slice(&pkt.key);
    dst.extend_from_slice(&pkt.value);
    Ok(())
}

/// Write a response header and body.
pub fn put_response(pkt: &ResponsePacket, dst: &mut BytesMut) -> io::Result<()> {
    if pkt.key.len() > u16::MAX as usize || pkt.extras.len() > u8::MAX as usize {
        return Err(protocol_error("response key or extras too long".to_string()));
    }
    dst.reserve(HEADER_LEN + pkt.body_len());
    dst.put_u8(MAGIC_RESPONSE);
    dst.put_u8(pkt.opcode);
    dst.put_u16(pkt.key.len() as u16);
    dst.put_u8(pkt.extras.len() as u8);
    dst.put_u8(pkt.datatype);
    dst.put_u16(pkt.status.to_u16());
    dst.put_u32(pkt.body_len() as u32);
    dst.put_u32(pkt.opaque);
    dst.put_u64(pkt.cas);
    dst.extend_from_slice(&pkt.extras);
    dst.extend_from_slice(&pkt.key);
    dst.extend_from_slice(&pkt.value);
    Ok(())
}

/// Split a whole frame off `src` once the header and body are buffered.
///
/// Returns `None` until enough bytes have accumulated.
fn take_frame(src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let body_len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
    let frame_len = HEADER_LEN + body_len;
    if src.len() < frame_len {
        src.reserve(frame_len - src.len());
        return Ok(None);
    }
    Ok(Some(src.split_to(frame_len)))
}

fn parse_request(mut frame: BytesMut) -> io::Result<RequestPacket> {
    let magic = frame[0];
    let opcode = frame[1];
    let (frame_extras_len, key_len) = match magic {
        MAGIC_REQUEST => (0usize, u16::from_be_bytes([frame[2], frame[3]]) as usize),
        MAGIC_ALT_REQUEST => (frame[2] as usize, frame[3] as usize),
        other => {
            return Err(protocol_error(format!(
                "unexpected request magic 0x{other:02x}"
            )))
        }
    };
    let extras_len = frame[4] as usize;
    let datatype = frame[5];
    let vbucket = u16::from_be_bytes([frame[6], frame[7]]);
    let body_len = u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]) as usize;
    let opaque = u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]);
    let cas = u64::from_be_bytes([
        frame[16], frame[17], frame[18], frame[19], frame[20], frame[21], frame[22], frame[23],
    ]);
    if frame_extras_len + extras_len + key_len > body_len {
        return Err(protocol_error("request sections exceed body length".to_string()));
    }
    frame.advance(HEADER_LEN);
    let frame_extras = frame.split_to(frame_extras_len).freeze();
    let extras = frame.split_to(extras_len).freeze();
    let key = frame.split_to(key_len).freeze();
    let value = frame.freeze();
    Ok(RequestPacket {
        opcode,
        datatype,
        vbucket,
        opaque,
        cas,
        frame_extras,
        extras,
        key,
        value,
    })
}

fn parse_response(mut frame: BytesMut) -> io::Result<ResponsePacket> {
    let magic = frame[0];
    if magic != MAGIC_RESPONSE {
        return Err(protocol_error(format!(
            "unexpected response magic 0x{magic:02x}"
        )));
    }
    let opcode = frame[1];
    let key_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
    let extras_len = frame[4] as usize;
    let datatype = frame[5];
    let status = Status::from_u16(u16::from_be_bytes([frame[6], frame[7]]));
    let body_len = u32::from_be_bytes([frame[8], frame[9], frame[10], frame[11]]) as usize;
    let opaque = u32::from_be_bytes([frame[12], frame[13], frame[14], frame[15]]);
    let cas = u64::from_be_bytes([
        frame[16], frame[17], frame[18], frame[19], frame[20], frame[21], frame[22], frame[23],
    ]);
    if extras_len + key_len > body_len {
        return Err(protocol_error("response sections exceed body length".to_string()));
    }
    frame.advance(HEADER_LEN);
    let extras = frame.split_to(extras_len).freeze();
    let key = frame.split_to(key_len).freeze();
    let value = frame.freeze();
    Ok(ResponsePacket {
        opcode,
        datatype,
        status,
        opaque,
        cas,
        extras,
        key,
        value,
    })
}

/// Client-side codec: encodes requests, decodes responses.
#[derive(Debug, Default)]
pub struct ClientCodec;

impl Encoder<RequestPacket> for ClientCodec {
    type Error = io::Error;

    fn encode(&mut self, pkt: RequestPacket, dst: &mut BytesMut) -> io::Result<()> {
        put_request(&pkt, dst)
    }
}

impl Decoder for ClientCodec {
    type Item = ResponsePacket;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<ResponsePacket>> {
        match take_frame(src)? {
            Some(frame) => parse_response(frame).map(Some),
            None => Ok(None),
        }
    }
}

/// Server-side codec: decodes requests (both magics), encodes responses.
///
/// Used by the proxy's listener and by test harnesses that impersonate a
/// data node.
#[derive(Debug, Default)]
pub struct ServerCodec;

impl Encoder<ResponsePacket> for ServerCodec {
    type Error = io::Error;

    fn encode(&mut self, pkt: ResponsePacket, dst: &mut BytesMut) -> io::Result<()> {
        put_response(&pkt, dst)
    }
}

impl Decoder for ServerCodec {
    type Item = RequestPacket;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<RequestPacket>> {
        match take_frame(src)? {
            Some(frame) => parse_request(frame).map(Some),
            None => Ok(None),
        }
    }
}

/// Prefix `key` with the unsigned-LEB128 encoding of a collection id.
pub fn key_with_collection_id(cid: u32, key: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(key.len() + 5);
    let mut rest = cid;
    loop {
        let byte = (rest & 0x7f) as u8;
        rest >>= 7;
        if rest == 0 {
            out.put_u8(byte);
            break;
        }
        out.put_u8(byte | 0x80);
    }
    out.extend_from_slice(key);
    out.freeze()
}

/// Split a collection-id prefix off a wire key.
///
/// Returns `None` when the prefix is truncated or longer than a `u32`.
pub fn split_collection_id(key: &[u8]) -> Option<(u32, &[u8])> {
    let mut cid: u32 = 0;
    for (idx, byte) in key.iter().enumerate() {
        if idx >= 5 {
            return None;
        }
        cid |= u32::from(byte & 0x7f) << (7 * idx);
        if byte & 0x80 == 0 {
            return Some((cid, &key[idx + 1..]));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> RequestPacket {
        RequestPacket {
            opcode: opcode::SET,
            datatype: DATATYPE_JSON,
            vbucket: 0x0123,
            opaque: 0xdeadbeef,
            cas: 0x1122334455667788,
            frame_extras: Bytes::new(),
            extras: Bytes::from_static(&[0, 0, 0, 7, 0, 0, 0, 9]),
            key: Bytes::from_static(b"doc-1"),
            value: Bytes::from_static(b"{\"a\":1}"),
        }
    }

    #[test]
    fn request_round_trip() {
        let pkt = sample_request();
        let mut buf = BytesMut::new();
        put_request(&pkt, &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN + pkt.body_len());
        let decoded = ServerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, pkt);
        assert!(buf.is_empty());
    }

    #[test]
    fn alt_request_round_trip() {
        let mut pkt = sample_request();
        pkt.frame_extras = Bytes::from_static(&[0x13, 0x01, 0x03, 0xe8]);
        let mut buf = BytesMut::new();
        put_request(&pkt, &mut buf).unwrap();
        assert_eq!(buf[0], MAGIC_ALT_REQUEST);
        assert_eq!(buf[2], 4);
        assert_eq!(buf[3], pkt.key.len() as u8);
        let decoded = ServerCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn response_round_trip() {
        let pkt = ResponsePacket {
            opcode: opcode::GET,
            datatype: DATATYPE_RAW,
            status: Status::NotMyVbucket,
            opaque: 42,
            cas: 7,
            extras: Bytes::from_static(&[0, 0, 0, 1]),
            key: Bytes::new(),
            value: Bytes::from_static(b"value"),
        };
        let mut buf = BytesMut::new();
        put_response(&pkt, &mut buf).unwrap();
        let decoded = ClientCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let pkt = sample_request();
        let mut buf = BytesMut::new();
        put_request(&pkt, &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..HEADER_LEN + 3]);
        assert!(ServerCodec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&buf[HEADER_LEN + 3..]);
        assert_eq!(ServerCodec.decode(&mut partial).unwrap().unwrap(), pkt);
    }

    #[test]
    fn bad_magic_is_an_error() {
        let mut buf = BytesMut::new();
        put_response(&ResponsePacket::new(opcode::GET, Status::Success), &mut buf).unwrap();
        buf[0] = 0x42;
        assert!(ClientCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn status_codes_round_trip() {
        for raw in [0x00u16, 0x01, 0x02, 0x03, 0x04, 0x05, 0x07, 0x09, 0x82, 0x85, 0x86, 0x88, 0x1234] {
            assert_eq!(Status::from_u16(raw).to_u16(), raw);
        }
    }

    #[test]
    fn collection_id_prefix_round_trip() {
        for cid in [0u32, 1, 0x7f, 0x80, 0x1234, 0xff_ffff, u32::MAX] {
            let wire = key_with_collection_id(cid, b"doc");
            let (decoded, rest) = split_collection_id(&wire).unwrap();
            assert_eq!(decoded, cid);
            assert_eq!(rest, b"doc");
        }
    }
}
