//! Checksums used by OB20 packets
//!
//! The header is protected by a CRC-16 (CCITT polynomial, zero initial value)
//! over every header byte that precedes the checksum field. The payload is
//! followed by a 4-byte CRC-32C tail; a tail of zero means the sender did not
//! compute one.

use crc::{Crc, CRC_16_XMODEM, CRC_32_ISCSI};

const HEADER_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
const PAYLOAD_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Checksum of the header bytes preceding the checksum field
pub fn header_checksum(header: &[u8]) -> u16 {
    HEADER_CRC.checksum(header)
}

/// Tail checksum of an OB20 payload
pub fn payload_checksum(payload: &[u8]) -> u32 {
    PAYLOAD_CRC.checksum(payload)
}
