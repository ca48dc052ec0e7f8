//! Binary frames multiplexed over one websocket message stream
//!
//! Every websocket binary message carries exactly one frame:
//!
//! ```text
//! varint(message_id) varint(stream_id) varint(kind) payload...
//! ```
//!
//! `Connect` payloads are `"<proto>/<host:port>"`, `Error` payloads are a
//! UTF-8 reason, `Data` payloads are raw stream bytes. `Close` and
//! `Keepalive` carry nothing.

use crate::error::{Result, TunnelError};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Data,
    Connect,
    Error,
    Close,
    Keepalive,
}

impl FrameKind {
    fn tag(&self) -> u64 {
        match self {
            FrameKind::Data => 1,
            FrameKind::Connect => 2,
            FrameKind::Error => 3,
            FrameKind::Close => 4,
            FrameKind::Keepalive => 5,
        }
    }

    fn from_tag(tag: u64) -> Result<Self> {
        match tag {
            1 => Ok(FrameKind::Data),
            2 => Ok(FrameKind::Connect),
            3 => Ok(FrameKind::Error),
            4 => Ok(FrameKind::Close),
            5 => Ok(FrameKind::Keepalive),
            other => Err(TunnelError::protocol(format!("unknown frame kind {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Sequence number assigned by the sender, zero until written
    pub message_id: u64,
    pub stream_id: u64,
    pub kind: FrameKind,
    pub payload: Bytes,
}

impl Frame {
    fn new(stream_id: u64, kind: FrameKind, payload: Bytes) -> Self {
        Self {
            message_id: 0,
            stream_id,
            kind,
            payload,
        }
    }

    pub fn data(stream_id: u64, payload: Bytes) -> Self {
        Self::new(stream_id, FrameKind::Data, payload)
    }

    pub fn connect(stream_id: u64, proto: &str, address: &str) -> Self {
        Self::new(
            stream_id,
            FrameKind::Connect,
            Bytes::from(format!("{}/{}", proto, address)),
        )
    }

    pub fn error(stream_id: u64, reason: impl Into<String>) -> Self {
        Self::new(stream_id, FrameKind::Error, Bytes::from(reason.into()))
    }

    pub fn close(stream_id: u64) -> Self {
        Self::new(stream_id, FrameKind::Close, Bytes::new())
    }

    pub fn keepalive() -> Self {
        Self::new(0, FrameKind::Keepalive, Bytes::new())
    }

    pub fn with_message_id(mut self, message_id: u64) -> Self {
        self.message_id = message_id;
        self
    }

    /// Split a `Connect` payload into `(proto, address)`
    pub fn connect_target(&self) -> Result<(String, String)> {
        if self.kind != FrameKind::Connect {
            return Err(TunnelError::protocol("not a connect frame"));
        }
        let text = std::str::from_utf8(&self.payload)
            .map_err(|_| TunnelError::protocol("connect target is not UTF-8"))?;
        match text.split_once('/') {
            Some((proto, address)) if !proto.is_empty() && !address.is_empty() => {
                Ok((proto.to_string(), address.to_string()))
            }
            _ => Err(TunnelError::protocol(format!(
                "malformed connect target '{}'",
                text
            ))),
        }
    }

    /// Reason carried by an `Error` frame
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + 12);
        put_varint(&mut buf, self.message_id);
        put_varint(&mut buf, self.stream_id);
        put_varint(&mut buf, self.kind.tag());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    pub fn decode(mut bytes: Bytes) -> Result<Self> {
        let message_id = get_varint(&mut bytes)?;
        let stream_id = get_varint(&mut bytes)?;
        let kind = FrameKind::from_tag(get_varint(&mut bytes)?)?;
        Ok(Self {
            message_id,
            stream_id,
            kind,
            payload: bytes,
        })
    }
}

fn put_varint(buf: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

fn get_varint(buf: &mut Bytes) -> Result<u64> {
    let mut value = 0u64;
    for shift in (0..64).step_by(7) {
        if !buf.has_remaining() {
            return Err(TunnelError::protocol("truncated frame header"));
        }
        let byte = buf.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(TunnelError::protocol("varint overflows u64"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_frame_keeps_payload() {
        let frame = Frame::data(300, Bytes::from_static(b"GET / HTTP/1.1\r\n")).with_message_id(7);
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.stream_id, 300);
    }

    #[test]
    fn test_connect_target() {
        let frame = Frame::connect(1, "tcp", "127.0.0.1:8440");
        let decoded = Frame::decode(frame.encode()).unwrap();
        assert_eq!(
            decoded.connect_target().unwrap(),
            ("tcp".to_string(), "127.0.0.1:8440".to_string())
        );

        let bad = Frame::new(1, FrameKind::Connect, Bytes::from_static(b"nohost"));
        assert!(bad.connect_target().is_err());
        assert!(Frame::close(1).connect_target().is_err());
    }

    #[test]
    fn test_large_ids_use_multibyte_varints() {
        let frame = Frame::close(u64::MAX).with_message_id(1 << 40);
        let encoded = frame.encode();
        assert!(encoded.len() > 3);
        assert_eq!(Frame::decode(encoded).unwrap(), frame);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Frame::decode(Bytes::new()).is_err());
        assert!(Frame::decode(Bytes::from_static(&[0x80])).is_err());
        // message 0, stream 0, kind 99
        assert!(Frame::decode(Bytes::from_static(&[0, 0, 99])).is_err());
    }

    #[test]
    fn test_error_reason() {
        let frame = Frame::error(3, "dial refused");
        assert_eq!(Frame::decode(frame.encode()).unwrap().reason(), "dial refused");
    }
}
