//! Binary frames of the OSPF API daemon.
//!
//! Every message starts with an 8 byte big-endian header:
//!
//! | offset | size | field    |
//! |--------|------|----------|
//! | 0      | 1    | version  |
//! | 1      | 1    | type     |
//! | 2      | 2    | length   |
//! | 4      | 4    | sequence |
//!
//! followed by `length` body bytes. LSA update messages put a 12 byte change
//! header and a 20 byte LSA header at the start of the body.

use std::io::Cursor;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use log::debug;

use super::{Codec, Encoded, Payload, Response, Status};
use crate::error::ProtocolError;
use crate::transport::Framing;

/// The only protocol version the daemon speaks.
pub const OSPF_API_VERSION: u8 = 1;

/// Request for a full LSDB dump: `sync-lsdb`, length 4, sequence 2,
/// all LSA types, no areas.
pub const SYNC_LSDB_REQUEST: [u8; 12] = [
    0x01, 0x04, 0x00, 0x04, 0x00, 0x00, 0x00, 0x02, 0xff, 0xff, 0x02, 0x00,
];

/// Logical command understood by [`OspfCodec::encode`].
pub const SYNC_LSDB_COMMAND: &str = "sync-lsdb";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OspfHeader {
    pub version: u8,
    pub msg_type: u8,
    /// Body length, header excluded.
    pub length: u16,
    pub sequence: u32,
}

impl OspfHeader {
    pub const SIZE: usize = 8;

    pub fn new(msg_type: u8, length: u16, sequence: u32) -> Self {
        Self {
            version: OSPF_API_VERSION,
            msg_type,
            length,
            sequence,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.version;
        bytes[1] = self.msg_type;
        BigEndian::write_u16(&mut bytes[2..4], self.length);
        BigEndian::write_u32(&mut bytes[4..8], self.sequence);
        bytes
    }

    /// Parses a header, rejecting short input and foreign versions.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::MalformedIo(format!(
                "expecting header of {} bytes, got {} bytes",
                Self::SIZE,
                bytes.len()
            )));
        }
        let header = Self {
            version: bytes[0],
            msg_type: bytes[1],
            length: BigEndian::read_u16(&bytes[2..4]),
            sequence: BigEndian::read_u32(&bytes[4..8]),
        };
        if header.version != OSPF_API_VERSION {
            return Err(ProtocolError::MalformedIo(format!(
                "received wrong version {}, misalignment?",
                header.version
            )));
        }
        Ok(header)
    }

    pub fn body_len(&self) -> usize {
        usize::from(self.length)
    }
}

/// A header plus its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OspfFrame {
    pub header: OspfHeader,
    pub body: Vec<u8>,
}

impl OspfFrame {
    pub fn new(header: OspfHeader, body: Vec<u8>) -> Result<Self, ProtocolError> {
        if body.len() != header.body_len() {
            return Err(ProtocolError::MalformedIo(format!(
                "expecting body of length {}, got {} bytes",
                header.length,
                body.len()
            )));
        }
        Ok(Self { header, body })
    }

    /// Header and body as they travel on the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(OspfHeader::SIZE + self.body.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.body);
        bytes
    }

    /// Change header of an LSA update message.
    pub fn change_header(&self) -> Result<ChangeHeader, ProtocolError> {
        ChangeHeader::parse(&self.body)
    }

    /// LSA header following the change header.
    pub fn lsa_header(&self) -> Result<LsaHeader, ProtocolError> {
        let lsa = self.body.get(ChangeHeader::SIZE..).unwrap_or_default();
        LsaHeader::parse(lsa)
    }
}

/// Per-update information the daemon prepends to an LSA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeHeader {
    pub interface: Ipv4Addr,
    pub area_id: u32,
    pub self_originated: bool,
}

impl ChangeHeader {
    pub const SIZE: usize = 12;

    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Parsing(format!(
                "change header needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let mut cursor = Cursor::new(bytes);
        let interface = Ipv4Addr::from(cursor.read_u32::<BigEndian>()?);
        let area_id = cursor.read_u32::<BigEndian>()?;
        let self_originated = cursor.read_u8()? != 0;
        Ok(Self {
            interface,
            area_id,
            self_originated,
        })
    }
}

/// Kind of link state advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LsaType {
    Router,
    Network,
    Summary,
    AsbrSummary,
    AsExternal,
    OpaqueLink,
    OpaqueArea,
    OpaqueAs,
    Other(u8),
}

impl From<u8> for LsaType {
    fn from(value: u8) -> Self {
        match value {
            1 => LsaType::Router,
            2 => LsaType::Network,
            3 => LsaType::Summary,
            4 => LsaType::AsbrSummary,
            5 => LsaType::AsExternal,
            9 => LsaType::OpaqueLink,
            10 => LsaType::OpaqueArea,
            11 => LsaType::OpaqueAs,
            other => LsaType::Other(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LsaHeader {
    pub age: u16,
    pub options: u8,
    pub lsa_type: LsaType,
    pub link_state_id: Ipv4Addr,
    pub advertising_router: Ipv4Addr,
    pub sequence: u32,
    pub checksum: u16,
    /// Length of the LSA, this header included.
    pub length: u16,
}

impl LsaHeader {
    pub const SIZE: usize = 20;

    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < Self::SIZE {
            return Err(ProtocolError::Parsing(format!(
                "LSA header needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }
        let mut cursor = Cursor::new(bytes);
        Ok(Self {
            age: cursor.read_u16::<BigEndian>()?,
            options: cursor.read_u8()?,
            lsa_type: LsaType::from(cursor.read_u8()?),
            link_state_id: Ipv4Addr::from(cursor.read_u32::<BigEndian>()?),
            advertising_router: Ipv4Addr::from(cursor.read_u32::<BigEndian>()?),
            sequence: cursor.read_u32::<BigEndian>()?,
            checksum: cursor.read_u16::<BigEndian>()?,
            length: cursor.read_u16::<BigEndian>()?,
        })
    }
}

/// Codec for OSPF API frames. Frames carry no correlation identifier; the
/// transport hands over exactly one frame per chunk.
#[derive(Debug, Default, Clone, Copy)]
pub struct OspfCodec;

impl OspfCodec {
    pub fn new() -> Self {
        Self
    }

    /// Splits a frame-sized chunk into header and body.
    pub fn frame(&self, chunk: &[u8]) -> Result<OspfFrame, ProtocolError> {
        let header = OspfHeader::parse(chunk)?;
        OspfFrame::new(header, chunk[OspfHeader::SIZE..].to_vec())
    }
}

impl Codec for OspfCodec {
    fn encode(&self, command: &str) -> Result<Encoded, ProtocolError> {
        if command.trim() != SYNC_LSDB_COMMAND {
            return Err(ProtocolError::InvalidCommand(format!(
                "the OSPF API only understands '{SYNC_LSDB_COMMAND}', got {command:?}"
            )));
        }
        Ok(Encoded {
            identifier: None,
            wire: SYNC_LSDB_REQUEST.to_vec(),
        })
    }

    fn decode(&self, chunk: &[u8]) -> Result<Response, ProtocolError> {
        let frame = self.frame(chunk)?;
        debug!(
            "Received frame of type {} with {} body bytes",
            frame.header.msg_type,
            frame.body.len()
        );
        Ok(Response {
            identifier: None,
            payload: Payload::Bytes(frame.to_bytes()),
            status: Status::Flag(true),
        })
    }

    /// A header followed by the body length it announces.
    fn framing(&self) -> Framing {
        Framing::LengthPrefixed {
            header: OspfHeader::SIZE,
            length_at: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lsa_update_body() -> Vec<u8> {
        let mut body = vec![10, 0, 0, 1, 0, 0, 0, 0, 1, 0, 0, 0];
        body.extend_from_slice(&[
            0x00, 0x2a, // age
            0x02, // options
            0x01, // router LSA
            192, 168, 1, 1, // link state id
            192, 168, 1, 254, // advertising router
            0x80, 0x00, 0x00, 0x01, // sequence
            0xbe, 0xef, // checksum
            0x00, 0x24, // length
        ]);
        body
    }

    #[test]
    fn header_round_trips_through_big_endian_bytes() {
        let header = OspfHeader::new(4, 0x0102, 0x0a0b0c0d);
        let bytes = header.to_bytes();
        assert_eq!(bytes, [1, 4, 0x01, 0x02, 0x0a, 0x0b, 0x0c, 0x0d]);
        assert_eq!(OspfHeader::parse(&bytes).expect("parses"), header);
    }

    #[test]
    fn sync_request_is_a_valid_frame() {
        let frame = OspfCodec::new().frame(&SYNC_LSDB_REQUEST).expect("frame");
        assert_eq!(frame.header.msg_type, 4);
        assert_eq!(frame.header.sequence, 2);
        assert_eq!(frame.body, [0xff, 0xff, 0x02, 0x00]);
    }

    #[test]
    fn wrong_version_is_misalignment() {
        let err = OspfHeader::parse(&[2, 1, 0, 0, 0, 0, 0, 1]).expect_err("version 2");
        assert!(matches!(err, ProtocolError::MalformedIo(ref msg) if msg.contains("misalignment")));
    }

    #[test]
    fn body_length_must_match_header() {
        let err = OspfCodec::new()
            .frame(&[1, 1, 0, 4, 0, 0, 0, 1, 0xaa])
            .expect_err("short body");
        assert!(matches!(err, ProtocolError::MalformedIo(_)));
    }

    #[test]
    fn parses_change_and_lsa_headers() {
        let body = lsa_update_body();
        let header = OspfHeader::new(5, body.len() as u16, 9);
        let frame = OspfFrame::new(header, body).expect("frame");

        let change = frame.change_header().expect("change header");
        assert_eq!(change.interface, Ipv4Addr::new(10, 0, 0, 1));
        assert!(change.self_originated);

        let lsa = frame.lsa_header().expect("lsa header");
        assert_eq!(lsa.age, 42);
        assert_eq!(lsa.lsa_type, LsaType::Router);
        assert_eq!(lsa.link_state_id, Ipv4Addr::new(192, 168, 1, 1));
        assert_eq!(lsa.advertising_router, Ipv4Addr::new(192, 168, 1, 254));
        assert_eq!(lsa.sequence, 0x8000_0001);
        assert_eq!(lsa.checksum, 0xbeef);
        assert_eq!(lsa.length, 36);
    }

    #[test]
    fn only_sync_lsdb_can_be_encoded() {
        let codec = OspfCodec::new();
        assert_eq!(
            codec.encode("sync-lsdb").expect("encodes").wire,
            SYNC_LSDB_REQUEST
        );
        assert!(matches!(
            codec.encode("show ip ospf"),
            Err(ProtocolError::InvalidCommand(_))
        ));
    }
}
