// Tunnel frame codec - wire format for the multiplexed tunnel stream.
//
// Every frame on the tunnel is a 7-byte header followed by a body:
// `session_id(u32) | cmd(u8) | datalen(u16) | body`. This module only
// concerns itself with the header and with the INIT body layout; NORMAL
// bodies are opaque payload and CLOSE/CLOSE_ACK bodies are always empty.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::Cursor;
use thiserror::Error;

/// Size in bytes of the frame header (`session_id | cmd | datalen`).
pub const HEADER_SIZE: usize = 7;

/// Frame control commands carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Cmd {
    Init = 0x01,
    Normal = 0x02,
    Close = 0x04,
    CloseAck = 0x05,
}

/// Address type carried in an INIT frame's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum Atyp {
    Ipv4 = 0x01,
    DomainName = 0x03,
    Ipv6 = 0x04,
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub session_id: u32,
    pub cmd: Cmd,
    pub datalen: u16,
}

impl Header {
    /// Decode a header from exactly `HEADER_SIZE` bytes.
    pub fn decode(buf: &mut Cursor<&[u8]>) -> Result<Self, CodecError> {
        if buf.remaining() < HEADER_SIZE {
            return Err(CodecError::Incomplete);
        }

        let session_id = buf.get_u32();
        let cmd_raw = buf.get_u8();
        let cmd = Cmd::try_from(cmd_raw).map_err(|_| CodecError::InvalidCmd(cmd_raw))?;
        let datalen = buf.get_u16();

        Ok(Header {
            session_id,
            cmd,
            datalen,
        })
    }

    /// Encode this header to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.session_id);
        buf.put_u8(self.cmd.into());
        buf.put_u16(self.datalen);
    }
}

/// Build a complete wire frame: header followed by `body`.
///
/// Panics if `body.len()` does not fit in a `u16`; callers are expected to
/// have already checked this (the only body that can legitimately grow
/// without bound is an upstream read, which is itself capped by the read
/// buffer size used by the caller).
pub fn encode_frame(session_id: u32, cmd: Cmd, body: &[u8]) -> Bytes {
    assert!(body.len() <= u16::MAX as usize, "frame body too large");

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    let header = Header {
        session_id,
        cmd,
        datalen: body.len() as u16,
    };
    header.encode(&mut buf);
    buf.put_slice(body);
    buf.freeze()
}

/// Decoded INIT frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitBody {
    pub atyp: Atyp,
    pub addr: Bytes,
    pub port: u16,
    pub payload: Bytes,
}

impl InitBody {
    /// Parse an INIT frame body laid out as
    /// `atyp(1) | addrlen(1) | addr(addrlen) | port(2) | payload(rest)`.
    pub fn decode(body: &[u8]) -> Result<Self, CodecError> {
        let mut buf = Cursor::new(body);

        if buf.remaining() < 2 {
            return Err(CodecError::Incomplete);
        }
        let atyp_raw = buf.get_u8();
        let atyp = Atyp::try_from(atyp_raw).map_err(|_| CodecError::InvalidAtyp(atyp_raw))?;
        let addrlen = buf.get_u8() as usize;

        if buf.remaining() < addrlen + 2 {
            return Err(CodecError::Incomplete);
        }
        let addr = Bytes::copy_from_slice(&buf.chunk()[..addrlen]);
        buf.advance(addrlen);
        let port = buf.get_u16();

        let payload = Bytes::copy_from_slice(buf.chunk());

        Ok(InitBody {
            atyp,
            addr,
            port,
            payload,
        })
    }

    /// Render this body back to wire form (used by tests and tooling).
    pub fn encode(&self) -> Bytes {
        let mut buf =
            BytesMut::with_capacity(2 + self.addr.len() + 2 + self.payload.len());
        buf.put_u8(self.atyp.into());
        buf.put_u8(self.addr.len() as u8);
        buf.put_slice(&self.addr);
        buf.put_u16(self.port);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Errors that can occur while decoding wire data.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("incomplete frame: need more data")]
    Incomplete,

    #[error("invalid cmd byte: {0:#x}")]
    InvalidCmd(u8),

    #[error("invalid address type: {0:#x}")]
    InvalidAtyp(u8),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = Header {
            session_id: 0x0102_0304,
            cmd: Cmd::Normal,
            datalen: 0x0506,
        };

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let mut cursor = Cursor::new(buf.as_ref());
        let decoded = Header::decode(&mut cursor).unwrap();
        assert_eq!(header, decoded);
    }

    #[test]
    fn header_decode_incomplete() {
        let data = [0u8; HEADER_SIZE - 1];
        let mut cursor = Cursor::new(&data[..]);
        assert!(matches!(Header::decode(&mut cursor), Err(CodecError::Incomplete)));
    }

    #[test]
    fn header_decode_invalid_cmd() {
        let data = [0, 0, 0, 1, 0xFF, 0, 0];
        let mut cursor = Cursor::new(&data[..]);
        assert!(matches!(
            Header::decode(&mut cursor),
            Err(CodecError::InvalidCmd(0xFF))
        ));
    }

    #[test]
    fn encode_frame_matches_s1() {
        // Session 1, INIT, atyp=IPv4, 127.0.0.1:80, payload "GE"
        let body = InitBody {
            atyp: Atyp::Ipv4,
            addr: Bytes::from_static(&[127, 0, 0, 1]),
            port: 80,
            payload: Bytes::from_static(b"GE"),
        }
        .encode();

        let frame = encode_frame(1, Cmd::Init, &body);
        let expected: &[u8] = &[
            0x00, 0x00, 0x00, 0x01, // session_id
            0x01, // cmd = INIT
            0x00, 0x0A, // datalen = 10
            0x01, // atyp = IPv4
            0x04, // addrlen
            0x7F, 0x00, 0x00, 0x01, // 127.0.0.1
            0x00, 0x50, // port 80
            b'G', b'E',
        ];
        assert_eq!(frame.as_ref(), expected);
    }

    #[test]
    fn init_body_roundtrip_domain() {
        let body = InitBody {
            atyp: Atyp::DomainName,
            addr: Bytes::from_static(b"foo"),
            port: 80,
            payload: Bytes::new(),
        };
        let encoded = body.encode();
        let decoded = InitBody::decode(&encoded).unwrap();
        assert_eq!(body, decoded);
    }

    #[test]
    fn init_body_decode_truncated() {
        let data = [0x01u8, 0x04, 0x7F, 0x00];
        assert!(matches!(InitBody::decode(&data), Err(CodecError::Incomplete)));
    }

    #[test]
    fn close_and_close_ack_frames_are_headers_only() {
        let frame = encode_frame(42, Cmd::Close, &[]);
        assert_eq!(frame.len(), HEADER_SIZE);

        let mut cursor = Cursor::new(frame.as_ref());
        let header = Header::decode(&mut cursor).unwrap();
        assert_eq!(header.session_id, 42);
        assert_eq!(header.cmd, Cmd::Close);
        assert_eq!(header.datalen, 0);
    }
}
