//! Wire format of LaMP packets.
//!
//! Every datagram exchanged between client and server is a [`Packet`]. This
//! module only turns packets into bytes and back; no I/O happens here.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Ident (0xAA) |     Type      |          Session id           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |        Sequence number        |        Payload length         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                     Timestamp seconds (64)                    |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  Timestamp microseconds (64)                  |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 24 bytes, so that a 1448-byte payload
//! fills a 1500-byte Ethernet MTU together with the IPv4 and UDP headers.
//!
//! The timestamp field holds the sender instant for DATA/ACK/END packets and
//! the server processing-time estimate for FOLLOWUP packets.

use std::fmt;

use thiserror::Error;

use crate::config::{Direction, FollowupMode};
use crate::timestamp::{LatencyType, Timestamp};

/// First byte of every LaMP header.
pub const LAMP_IDENT: u8 = 0xAA;

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 24;

/// Largest payload accepted with UDP encapsulation.
pub const MAX_PAYLOAD_LEN: usize = 1448;

/// Length of the INIT / INIT-ACK negotiation block.
pub const INIT_PARAMS_LEN: usize = 3;

/// Length of the REPORT payload.
pub const REPORT_LEN: usize = 48;

const OFF_IDENT: usize = 0;
const OFF_TYPE: usize = 1;
const OFF_SESSION: usize = 2;
const OFF_SEQ: usize = 4;
const OFF_LEN: usize = 6;
const OFF_SEC: usize = 8;
const OFF_USEC: usize = 16;

/// Packet type carried in the second header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Init,
    InitAck,
    Data,
    Ack,
    Followup,
    FollowupAck,
    /// Client has sent its last probe.
    End,
    /// Server-side statistics, answer to END.
    Report,
}

impl PacketType {
    pub fn code(self) -> u8 {
        match self {
            PacketType::Init => 0x01,
            PacketType::InitAck => 0x02,
            PacketType::Data => 0x03,
            PacketType::Ack => 0x04,
            PacketType::Followup => 0x05,
            PacketType::FollowupAck => 0x06,
            PacketType::End => 0x07,
            PacketType::Report => 0x08,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => PacketType::Init,
            0x02 => PacketType::InitAck,
            0x03 => PacketType::Data,
            0x04 => PacketType::Ack,
            0x05 => PacketType::Followup,
            0x06 => PacketType::FollowupAck,
            0x07 => PacketType::End,
            0x08 => PacketType::Report,
            _ => return None,
        })
    }

    /// Smallest payload a packet of this type may carry.
    fn min_payload(self) -> usize {
        match self {
            PacketType::Init | PacketType::InitAck => INIT_PARAMS_LEN,
            PacketType::Report => REPORT_LEN,
            _ => 0,
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Init => "INIT",
            PacketType::InitAck => "INIT-ACK",
            PacketType::Data => "DATA",
            PacketType::Ack => "ACK",
            PacketType::Followup => "FOLLOWUP",
            PacketType::FollowupAck => "FOLLOWUP-ACK",
            PacketType::End => "END",
            PacketType::Report => "REPORT",
        };
        f.write_str(name)
    }
}

/// A complete LaMP datagram: header fields + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: PacketType,
    pub session_id: u16,
    pub seq: u16,
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn new(kind: PacketType, session_id: u16, seq: u16) -> Self {
        Self {
            kind,
            session_id,
            seq,
            timestamp: Timestamp::ZERO,
            payload: Vec::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// The payload length field is computed from the actual payload.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge(payload_len));
        }
        let mut buf = vec![0u8; HEADER_LEN + payload_len];

        buf[OFF_IDENT] = LAMP_IDENT;
        buf[OFF_TYPE] = self.kind.code();
        buf[OFF_SESSION..OFF_SESSION + 2].copy_from_slice(&self.session_id.to_be_bytes());
        buf[OFF_SEQ..OFF_SEQ + 2].copy_from_slice(&self.seq.to_be_bytes());
        buf[OFF_LEN..OFF_LEN + 2].copy_from_slice(&(payload_len as u16).to_be_bytes());
        buf[OFF_SEC..OFF_SEC + 8].copy_from_slice(&self.timestamp.sec.to_be_bytes());
        buf[OFF_USEC..OFF_USEC + 8].copy_from_slice(&self.timestamp.usec.to_be_bytes());
        buf[HEADER_LEN..].copy_from_slice(&self.payload);

        Ok(buf)
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Returns [`Err`] if the buffer is shorter than [`HEADER_LEN`], the
    /// identifier or type byte is unknown, the length field disagrees with the
    /// remaining bytes or exceeds [`MAX_PAYLOAD_LEN`], a control packet is
    /// shorter than its type requires, or the microseconds field is out of range.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::BufferTooShort(buf.len()));
        }
        if buf[OFF_IDENT] != LAMP_IDENT {
            return Err(PacketError::BadIdent(buf[OFF_IDENT]));
        }
        let kind =
            PacketType::from_code(buf[OFF_TYPE]).ok_or(PacketError::UnknownType(buf[OFF_TYPE]))?;

        let session_id = read_u16(buf, OFF_SESSION);
        let seq = read_u16(buf, OFF_SEQ);
        let payload_len = usize::from(read_u16(buf, OFF_LEN));
        let sec = read_u64(buf, OFF_SEC);
        let usec = read_u64(buf, OFF_USEC);

        if payload_len > MAX_PAYLOAD_LEN {
            return Err(PacketError::PayloadTooLarge(payload_len));
        }
        if buf.len() != HEADER_LEN + payload_len {
            return Err(PacketError::LengthMismatch {
                declared: payload_len,
                actual: buf.len() - HEADER_LEN,
            });
        }
        if payload_len < kind.min_payload() {
            return Err(PacketError::ControlTooShort(kind));
        }
        if usec >= 1_000_000 {
            return Err(PacketError::BadTimestamp);
        }

        Ok(Packet {
            kind,
            session_id,
            seq,
            timestamp: Timestamp { sec, usec },
            payload: buf[HEADER_LEN..].to_vec(),
        })
    }
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(bytes)
}

fn read_f64(buf: &[u8], off: usize) -> f64 {
    f64::from_bits(read_u64(buf, off))
}

/// Payload of `len` bytes filled with the `i mod 256` pattern.
pub fn pattern_payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 256) as u8).collect()
}

/// Errors that can arise when parsing a raw datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("buffer of {0} bytes is too short to contain a LaMP header")]
    BufferTooShort(usize),
    #[error("unexpected identifier byte {0:#04x}")]
    BadIdent(u8),
    #[error("unknown packet type {0:#04x}")]
    UnknownType(u8),
    #[error("payload of {0} bytes exceeds the maximum")]
    PayloadTooLarge(usize),
    #[error("payload length field says {declared} bytes, {actual} present")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("{0} payload too short")]
    ControlTooShort(PacketType),
    #[error("microseconds field out of range")]
    BadTimestamp,
    #[error("invalid negotiation parameters")]
    BadParams,
}

/// Negotiation block carried by INIT (requested) and INIT-ACK (granted).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InitParams {
    pub direction: Direction,
    pub latency_type: LatencyType,
    pub followup: FollowupMode,
}

impl InitParams {
    pub fn to_payload(self) -> Vec<u8> {
        vec![
            self.direction.code(),
            self.latency_type.code(),
            self.followup.code(),
        ]
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, PacketError> {
        if payload.len() < INIT_PARAMS_LEN {
            return Err(PacketError::ControlTooShort(PacketType::Init));
        }
        Ok(Self {
            direction: Direction::from_code(payload[0]).ok_or(PacketError::BadParams)?,
            latency_type: LatencyType::from_code(payload[1]).ok_or(PacketError::BadParams)?,
            followup: FollowupMode::from_code(payload[2]).ok_or(PacketError::BadParams)?,
        })
    }
}

/// Server-side statistics returned in a REPORT packet.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ServerReport {
    pub received: u64,
    pub out_of_order: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub variance: f64,
}

impl ServerReport {
    pub fn to_payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(REPORT_LEN);
        out.extend_from_slice(&self.received.to_be_bytes());
        out.extend_from_slice(&self.out_of_order.to_be_bytes());
        for v in [self.min_ms, self.max_ms, self.mean_ms, self.variance] {
            out.extend_from_slice(&v.to_bits().to_be_bytes());
        }
        out
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, PacketError> {
        if payload.len() < REPORT_LEN {
            return Err(PacketError::ControlTooShort(PacketType::Report));
        }
        Ok(Self {
            received: read_u64(payload, 0),
            out_of_order: read_u64(payload, 8),
            min_ms: read_f64(payload, 16),
            max_ms: read_f64(payload, 24),
            mean_ms: read_f64(payload, 32),
            variance: read_f64(payload, 40),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(seq: u16, payload: &[u8]) -> Packet {
        Packet::new(PacketType::Data, 0x1234, seq)
            .with_timestamp(Timestamp::new(1_700_000_000, 123_456))
            .with_payload(payload.to_vec())
    }

    #[test]
    fn encode_decode_roundtrip() {
        let pkt = data(42, b"hello");
        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(decoded, pkt);
    }

    #[test]
    fn control_packets_roundtrip() {
        let params = InitParams {
            direction: Direction::PingLike,
            latency_type: LatencyType::Krt,
            followup: FollowupMode::KernelRx,
        };
        let init = Packet::new(PacketType::Init, 7, 0).with_payload(params.to_payload());
        let decoded = Packet::decode(&init.encode().unwrap()).unwrap();
        assert_eq!(InitParams::from_payload(&decoded.payload).unwrap(), params);

        let report = ServerReport {
            received: 10,
            out_of_order: 1,
            min_ms: 0.25,
            max_ms: 3.5,
            mean_ms: 1.125,
            variance: 0.5,
        };
        let pkt = Packet::new(PacketType::Report, 7, 11).with_payload(report.to_payload());
        let decoded = Packet::decode(&pkt.encode().unwrap()).unwrap();
        assert_eq!(ServerReport::from_payload(&decoded.payload).unwrap(), report);
    }

    #[test]
    fn header_is_big_endian_on_wire() {
        let bytes = data(0x0102, b"").encode().unwrap();
        assert_eq!(bytes[OFF_IDENT], LAMP_IDENT);
        assert_eq!(bytes[OFF_TYPE], 0x03);
        assert_eq!(&bytes[OFF_SESSION..OFF_SESSION + 2], &[0x12, 0x34]);
        assert_eq!(&bytes[OFF_SEQ..OFF_SEQ + 2], &[0x01, 0x02]);
        assert_eq!(bytes.len(), HEADER_LEN);
    }

    #[test]
    fn encode_sets_payload_len() {
        let bytes = data(1, b"world").encode().unwrap();
        assert_eq!(read_u16(&bytes, OFF_LEN), 5);
        assert_eq!(bytes.len(), HEADER_LEN + 5);
    }

    #[test]
    fn decode_empty_buffer_returns_error() {
        assert_eq!(Packet::decode(&[]), Err(PacketError::BufferTooShort(0)));
    }

    #[test]
    fn decode_short_header_returns_error() {
        let bytes = data(1, b"").encode().unwrap();
        assert_eq!(
            Packet::decode(&bytes[..HEADER_LEN - 1]),
            Err(PacketError::BufferTooShort(HEADER_LEN - 1))
        );
    }

    #[test]
    fn decode_truncated_payload_returns_error() {
        let mut bytes = data(0, b"data").encode().unwrap();
        bytes.pop();
        assert_eq!(
            Packet::decode(&bytes),
            Err(PacketError::LengthMismatch {
                declared: 4,
                actual: 3
            })
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let mut bytes = data(0, b"").encode().unwrap();
        bytes[OFF_TYPE] = 0x7f;
        assert_eq!(Packet::decode(&bytes), Err(PacketError::UnknownType(0x7f)));
    }

    #[test]
    fn decode_rejects_foreign_ident() {
        let mut bytes = data(0, b"").encode().unwrap();
        bytes[OFF_IDENT] = 0x45;
        assert_eq!(Packet::decode(&bytes), Err(PacketError::BadIdent(0x45)));
    }

    #[test]
    fn decode_rejects_oversized_declared_payload() {
        let mut bytes = data(0, b"").encode().unwrap();
        bytes[OFF_LEN..OFF_LEN + 2].copy_from_slice(&((MAX_PAYLOAD_LEN + 1) as u16).to_be_bytes());
        bytes.resize(HEADER_LEN + MAX_PAYLOAD_LEN + 1, 0);
        assert_eq!(
            Packet::decode(&bytes),
            Err(PacketError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1))
        );
    }

    #[test]
    fn decode_rejects_short_init() {
        let bytes = Packet::new(PacketType::Init, 1, 0)
            .with_payload(vec![0])
            .encode()
            .unwrap();
        assert_eq!(
            Packet::decode(&bytes),
            Err(PacketError::ControlTooShort(PacketType::Init))
        );
    }

    #[test]
    fn decode_rejects_out_of_range_usec() {
        let mut bytes = data(0, b"").encode().unwrap();
        bytes[OFF_USEC..OFF_USEC + 8].copy_from_slice(&2_000_000u64.to_be_bytes());
        assert_eq!(Packet::decode(&bytes), Err(PacketError::BadTimestamp));
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let pkt = data(0, &vec![0u8; MAX_PAYLOAD_LEN + 1]);
        assert_eq!(
            pkt.encode(),
            Err(PacketError::PayloadTooLarge(MAX_PAYLOAD_LEN + 1))
        );
        assert!(data(0, &vec![0u8; MAX_PAYLOAD_LEN]).encode().is_ok());
    }

    #[test]
    fn init_params_reject_unknown_codes() {
        assert_eq!(
            InitParams::from_payload(&[9, 1, 0]),
            Err(PacketError::BadParams)
        );
        assert_eq!(
            InitParams::from_payload(&[0, 0, 0]),
            Err(PacketError::BadParams)
        );
    }

    #[test]
    fn pattern_payload_wraps_every_256_bytes() {
        let p = pattern_payload(300);
        assert_eq!(p.len(), 300);
        assert_eq!(p[0], 0);
        assert_eq!(p[255], 255);
        assert_eq!(p[256], 0);
    }

    #[test]
    fn header_len_constant_is_correct() {
        // ident(1) + type(1) + session(2) + seq(2) + len(2) + sec(8) + usec(8) = 24
        assert_eq!(HEADER_LEN, 24);
        assert_eq!(20 + 8 + HEADER_LEN + MAX_PAYLOAD_LEN, 1500);
    }
}
