//! OB20 packet header encoding/decoding
//!
//! The header is 31 bytes, little endian:
//!
//! ```text
//! +---------------------------+-------+---------+---------+--------+
//! | MySQL compressed hdr (7)  | magic | version | conn id | req id |
//! |                           |  (2)  |   (2)   |   (4)   |  (3)   |
//! +---------+-----------------+-------+---------+---------+--------+
//! | pkt seq | payload len (4) | flags (4) | reserved (2) | hdr crc (2) |
//! |   (1)   |                 |           |              |             |
//! +---------+-----------------+-----------+--------------+-------------+
//! ```
//!
//! The payload follows the header and is itself followed by a 4-byte tail
//! checksum. The compressed header's length field covers the 24 OB20 header
//! bytes, the payload and the tail.

use std::fmt;

use bytes::{Buf, BufMut};

use super::checksum::header_checksum;
use super::error::ProtocolError;
use super::flags::{Ob20ProtocolFlags, Ob20ProtocolHeaderParam};
use super::packet::{get_u24_le, put_u24_le, CompressedHeader, COMPRESSED_HEADER_SIZE};

pub const OB20_MAGIC_NUM: u16 = 0x20AB;
pub const OB20_VERSION: u16 = 20;
/// OB20 header bytes after the compressed header
pub const OB20_HEADER_BODY_LEN: usize = 24;
/// Full header length including the compressed header
pub const OB20_HEADER_LEN: usize = COMPRESSED_HEADER_SIZE + OB20_HEADER_BODY_LEN;
pub const OB20_TAIL_CHECKSUM_LEN: usize = 4;
/// Offset of the header checksum; everything before it is checksummed
const CHECKSUM_OFFSET: usize = OB20_HEADER_LEN - 2;
/// Request ids travel as 24-bit values
pub const REQUEST_ID_MASK: u32 = 0x00FF_FFFF;

/// OB20 packet header
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ob20ProtocolHeader {
    pub cp_hdr: CompressedHeader,
    pub magic_num: u16,
    pub header_checksum: u16,
    pub connection_id: u32,
    pub request_id: u32,
    pub pkt_seq: u8,
    pub payload_len: u32,
    pub flag: Ob20ProtocolFlags,
    pub version: u16,
    pub reserved: u16,
}

impl Ob20ProtocolHeader {
    /// Build an outbound header for a payload of `payload_len` bytes
    pub fn new(param: &Ob20ProtocolHeaderParam, payload_len: u32, extra_info_exist: bool) -> Self {
        let compressed_len =
            (OB20_HEADER_BODY_LEN + payload_len as usize + OB20_TAIL_CHECKSUM_LEN) as u32;
        Self {
            cp_hdr: CompressedHeader::new(compressed_len, param.compressed_seq()),
            magic_num: OB20_MAGIC_NUM,
            header_checksum: 0,
            connection_id: param.connection_id(),
            request_id: param.request_id() & REQUEST_ID_MASK,
            pkt_seq: param.pkt_seq(),
            payload_len,
            flag: Ob20ProtocolFlags::from_param(param, extra_info_exist),
            version: OB20_VERSION,
            reserved: 0,
        }
    }

    /// Zero every field, ready for reuse
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Bytes the transport must have buffered for the whole packet
    pub fn total_len(&self) -> usize {
        OB20_HEADER_LEN + self.payload_len as usize + OB20_TAIL_CHECKSUM_LEN
    }

    /// Write the header and fill in its checksum
    pub fn encode(&mut self, dst: &mut impl BufMut) {
        let mut buf = [0u8; OB20_HEADER_LEN];
        {
            let mut w = &mut buf[..CHECKSUM_OFFSET];
            self.cp_hdr.encode(&mut w);
            w.put_u16_le(self.magic_num);
            w.put_u16_le(self.version);
            w.put_u32_le(self.connection_id);
            put_u24_le(&mut w, self.request_id);
            w.put_u8(self.pkt_seq);
            w.put_u32_le(self.payload_len);
            w.put_u32_le(self.flag.to_wire());
            // Reserved bits are never forwarded
            self.reserved = 0;
            w.put_u16_le(0);
        }
        self.header_checksum = header_checksum(&buf[..CHECKSUM_OFFSET]);
        buf[CHECKSUM_OFFSET..].copy_from_slice(&self.header_checksum.to_le_bytes());
        dst.put_slice(&buf);
    }

    /// Parse and validate a header from the first 31 bytes of `src`
    ///
    /// The checksum is verified before any field is interpreted.
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        if src.len() < OB20_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                needed: OB20_HEADER_LEN,
                available: src.len(),
            });
        }

        let expected = u16::from_le_bytes([src[CHECKSUM_OFFSET], src[CHECKSUM_OFFSET + 1]]);
        let computed = header_checksum(&src[..CHECKSUM_OFFSET]);
        if expected != computed {
            return Err(ProtocolError::HeaderChecksum { expected, computed });
        }

        let mut buf = &src[..CHECKSUM_OFFSET];
        let cp_hdr = CompressedHeader::read(&mut buf);
        let magic_num = buf.get_u16_le();
        let version = buf.get_u16_le();
        let connection_id = buf.get_u32_le();
        let request_id = get_u24_le(&mut buf);
        let pkt_seq = buf.get_u8();
        let payload_len = buf.get_u32_le();
        let flag = Ob20ProtocolFlags::new(buf.get_u32_le());
        let reserved = buf.get_u16_le();

        if magic_num != OB20_MAGIC_NUM {
            return Err(ProtocolError::BadMagic {
                expected: OB20_MAGIC_NUM,
                actual: magic_num,
            });
        }
        if version != OB20_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version));
        }
        let framed_len = OB20_HEADER_BODY_LEN as u64
            + payload_len as u64
            + OB20_TAIL_CHECKSUM_LEN as u64;
        if cp_hdr.compressed_len as u64 != framed_len {
            return Err(ProtocolError::LengthMismatch {
                compressed_len: cp_hdr.compressed_len,
                payload_len,
            });
        }

        Ok(Self {
            cp_hdr,
            magic_num,
            header_checksum: expected,
            connection_id,
            request_id,
            pkt_seq,
            payload_len,
            flag,
            version,
            reserved,
        })
    }

    /// Transfer object describing this header
    pub fn to_param(&self) -> Ob20ProtocolHeaderParam {
        Ob20ProtocolHeaderParam::from_flags(
            self.connection_id,
            self.request_id,
            self.cp_hdr.seq,
            self.pkt_seq,
            self.flag,
        )
    }
}

impl fmt::Display for Ob20ProtocolHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ob 20 protocol header {{{}, magic_num={:#06x}, header_checksum={:#06x}, connection_id={}, request_id={}, pkt_seq={}, payload_len={}, version={}, flags={:#x}, reserved={}}}",
            self.cp_hdr,
            self.magic_num,
            self.header_checksum,
            self.connection_id,
            self.request_id,
            self.pkt_seq,
            self.payload_len,
            self.version,
            self.flag.bits(),
            self.reserved,
        )
    }
}
