//! Tunnel wire protocol
//!
//! Every WebSocket binary message carries exactly one frame. A frame is a
//! type byte followed by length-prefixed fields; strings are u16-prefixed
//! UTF-8, payloads u32-prefixed raw bytes.
//!
//! Data frames carry source and destination addresses on every frame, not
//! just the first: the receiving side may hold no state for an id (a fresh
//! connection, or a replaced worker) and uses the addresses to dial.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Largest payload placed in a single data frame. Larger writes are chunked.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024;

/// Hard ceiling on a decoded frame, as a guard against corrupt length fields.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

const TYPE_DATA: u8 = 0x01;
const TYPE_CLOSE: u8 = 0x02;
const TYPE_DNS_REQUEST: u8 = 0x03;
const TYPE_DNS_RESPONSE: u8 = 0x04;
const TYPE_REGISTRATION: u8 = 0x05;
const TYPE_FATAL: u8 = 0x06;

/// Bytes for one logical connection, addressed on every frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFrame {
    /// Connection id in canonical `srcIP:srcPort->dstIP:dstPort` form
    pub id: String,
    /// Sender-side source address, `host:port`
    pub src_addr: String,
    /// Destination address, `host:port`; consulted when the id is unknown
    pub dst_addr: String,
    /// Opaque payload; empty on the frame that opens a connection
    pub payload: Bytes,
}

/// Terminates one logical connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    pub id: String,
    /// Set when the connection died abnormally (e.g. upstream dial failure)
    pub error: Option<String>,
}

/// Unary DNS resolve request, correlated by `rpc_id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsRequestFrame {
    pub rpc_id: u32,
    pub hostname: String,
}

/// Response to a [`DnsRequestFrame`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsResponseFrame {
    pub rpc_id: u32,
    pub addresses: Vec<Ipv4Addr>,
    pub error: Option<String>,
}

/// First frame after connect; identifies the endpoint role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationFrame {
    pub is_server: bool,
    /// Pairing key for relayed deployments; empty when dialing directly
    pub connection_key: String,
}

/// Terminal error: the whole stream is ending
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalFrame {
    pub message: String,
}

/// One tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(DataFrame),
    Close(CloseFrame),
    DnsRequest(DnsRequestFrame),
    DnsResponse(DnsResponseFrame),
    Registration(RegistrationFrame),
    Fatal(FatalFrame),
}

impl Frame {
    /// Shorthand for a data frame
    #[must_use]
    pub fn data(
        id: impl Into<String>,
        src_addr: impl Into<String>,
        dst_addr: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self::Data(DataFrame {
            id: id.into(),
            src_addr: src_addr.into(),
            dst_addr: dst_addr.into(),
            payload,
        })
    }

    /// Shorthand for a clean close frame
    #[must_use]
    pub fn close(id: impl Into<String>) -> Self {
        Self::Close(CloseFrame {
            id: id.into(),
            error: None,
        })
    }

    /// Shorthand for a close frame carrying an error
    #[must_use]
    pub fn close_with_error(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self::Close(CloseFrame {
            id: id.into(),
            error: Some(error.into()),
        })
    }

    /// Encode the frame into a buffer ready to be sent as one message
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Self::Data(f) => {
                buf.put_u8(TYPE_DATA);
                put_str(buf, &f.id);
                put_str(buf, &f.src_addr);
                put_str(buf, &f.dst_addr);
                buf.put_u32(f.payload.len() as u32);
                buf.put_slice(&f.payload);
            }
            Self::Close(f) => {
                buf.put_u8(TYPE_CLOSE);
                put_str(buf, &f.id);
                put_str(buf, f.error.as_deref().unwrap_or(""));
            }
            Self::DnsRequest(f) => {
                buf.put_u8(TYPE_DNS_REQUEST);
                buf.put_u32(f.rpc_id);
                put_str(buf, &f.hostname);
            }
            Self::DnsResponse(f) => {
                buf.put_u8(TYPE_DNS_RESPONSE);
                buf.put_u32(f.rpc_id);
                put_str(buf, f.error.as_deref().unwrap_or(""));
                buf.put_u16(f.addresses.len() as u16);
                for addr in &f.addresses {
                    buf.put_slice(&addr.octets());
                }
            }
            Self::Registration(f) => {
                buf.put_u8(TYPE_REGISTRATION);
                buf.put_u8(u8::from(f.is_server));
                put_str(buf, &f.connection_key);
            }
            Self::Fatal(f) => {
                buf.put_u8(TYPE_FATAL);
                put_str(buf, &f.message);
            }
        }
    }

    /// Encode into a fresh byte vector
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(&mut buf);
        buf.to_vec()
    }

    /// Decode one frame from a complete message.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError` on an unknown type byte, a truncated field, an
    /// oversized frame, or invalid UTF-8 in a string field.
    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        if buf.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::Oversized {
                size: buf.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        ensure(&buf, 1, "frame type")?;
        let ty = buf.get_u8();
        match ty {
            TYPE_DATA => {
                let id = get_str(&mut buf, "id")?;
                let src_addr = get_str(&mut buf, "src_addr")?;
                let dst_addr = get_str(&mut buf, "dst_addr")?;
                ensure(&buf, 4, "payload length")?;
                let len = buf.get_u32() as usize;
                ensure(&buf, len, "payload")?;
                let payload = buf.split_to(len);
                Ok(Self::Data(DataFrame {
                    id,
                    src_addr,
                    dst_addr,
                    payload,
                }))
            }
            TYPE_CLOSE => {
                let id = get_str(&mut buf, "id")?;
                let error = get_str(&mut buf, "error")?;
                Ok(Self::Close(CloseFrame {
                    id,
                    error: (!error.is_empty()).then_some(error),
                }))
            }
            TYPE_DNS_REQUEST => {
                ensure(&buf, 4, "rpc_id")?;
                let rpc_id = buf.get_u32();
                let hostname = get_str(&mut buf, "hostname")?;
                Ok(Self::DnsRequest(DnsRequestFrame { rpc_id, hostname }))
            }
            TYPE_DNS_RESPONSE => {
                ensure(&buf, 4, "rpc_id")?;
                let rpc_id = buf.get_u32();
                let error = get_str(&mut buf, "error")?;
                ensure(&buf, 2, "address count")?;
                let count = buf.get_u16() as usize;
                ensure(&buf, count * 4, "addresses")?;
                let mut addresses = Vec::with_capacity(count);
                for _ in 0..count {
                    let mut octets = [0u8; 4];
                    buf.copy_to_slice(&mut octets);
                    addresses.push(Ipv4Addr::from(octets));
                }
                Ok(Self::DnsResponse(DnsResponseFrame {
                    rpc_id,
                    addresses,
                    error: (!error.is_empty()).then_some(error),
                }))
            }
            TYPE_REGISTRATION => {
                ensure(&buf, 1, "registration flags")?;
                let is_server = buf.get_u8() != 0;
                let connection_key = get_str(&mut buf, "connection_key")?;
                Ok(Self::Registration(RegistrationFrame {
                    is_server,
                    connection_key,
                }))
            }
            TYPE_FATAL => {
                let message = get_str(&mut buf, "message")?;
                Ok(Self::Fatal(FatalFrame { message }))
            }
            other => Err(ProtocolError::UnknownFrameType(other)),
        }
    }
}

/// Canonical connection id for a source/destination pair
#[must_use]
pub fn connection_id(src: SocketAddr, dst: SocketAddr) -> String {
    format!("{src}->{dst}")
}

fn put_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= usize::from(u16::MAX));
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut Bytes, field: &'static str) -> Result<String, ProtocolError> {
    ensure(buf, 2, field)?;
    let len = buf.get_u16() as usize;
    ensure(buf, len, field)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidString(field))
}

fn ensure(buf: &Bytes, expected: usize, field: &'static str) -> Result<(), ProtocolError> {
    if buf.len() < expected {
        return Err(ProtocolError::Truncated {
            field,
            expected,
            available: buf.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: &Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        Frame::decode(buf.freeze()).unwrap()
    }

    #[test]
    fn test_data_frame_round_trip() {
        let frame = Frame::data(
            "127.0.0.1:39882->10.43.0.15:6379",
            "127.0.0.1:39882",
            "10.43.0.15:6379",
            Bytes::from_static(b"PING\r\n"),
        );
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let frame = Frame::data("a->b", "10.0.0.7:55442", "127.0.0.1:3000", Bytes::new());
        assert_eq!(round_trip(&frame), frame);
    }

    #[test]
    fn test_close_frame_round_trip() {
        let clean = Frame::close("127.0.0.1:1->2.2.2.2:2");
        assert_eq!(round_trip(&clean), clean);

        let failed = Frame::close_with_error("127.0.0.1:1->2.2.2.2:2", "dial timeout");
        assert_eq!(round_trip(&failed), failed);
    }

    #[test]
    fn test_dns_frames_round_trip() {
        let req = Frame::DnsRequest(DnsRequestFrame {
            rpc_id: 7,
            hostname: "redis.prod.svc.cluster.local".into(),
        });
        assert_eq!(round_trip(&req), req);

        let ok = Frame::DnsResponse(DnsResponseFrame {
            rpc_id: 7,
            addresses: vec!["10.43.0.15".parse().unwrap(), "10.43.0.16".parse().unwrap()],
            error: None,
        });
        assert_eq!(round_trip(&ok), ok);

        let err = Frame::DnsResponse(DnsResponseFrame {
            rpc_id: 8,
            addresses: vec![],
            error: Some("no such host".into()),
        });
        assert_eq!(round_trip(&err), err);
    }

    #[test]
    fn test_registration_and_fatal_round_trip() {
        let reg = Frame::Registration(RegistrationFrame {
            is_server: true,
            connection_key: "a1b2c3".into(),
        });
        assert_eq!(round_trip(&reg), reg);

        let fatal = Frame::Fatal(FatalFrame {
            message: "tunnel already active".into(),
        });
        assert_eq!(round_trip(&fatal), fatal);
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = Frame::decode(Bytes::from_static(&[0x7f])).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownFrameType(0x7f)));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = Frame::data("id", "1.1.1.1:1", "2.2.2.2:2", Bytes::from_static(b"hello"));
        let encoded = frame.to_bytes();
        for cut in 1..encoded.len() {
            let err = Frame::decode(Bytes::copy_from_slice(&encoded[..cut]));
            assert!(err.is_err(), "truncation at {cut} must not decode");
        }
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let huge = vec![0u8; MAX_FRAME_SIZE + 1];
        let err = Frame::decode(Bytes::from(huge)).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { .. }));
    }

    #[test]
    fn test_connection_id_format() {
        let src: SocketAddr = "127.0.0.1:39882".parse().unwrap();
        let dst: SocketAddr = "10.43.0.15:6379".parse().unwrap();
        assert_eq!(connection_id(src, dst), "127.0.0.1:39882->10.43.0.15:6379");
    }
}
