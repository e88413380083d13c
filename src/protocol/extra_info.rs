//! OB20 extra info region and session sync fragments
//!
//! When the extra-info flag is set, an OB20 payload starts with a 4-byte
//! little endian length followed by that many bytes of extra info. In the
//! new format the region is a sequence of
//!
//! ```text
//! key type (u16) | value length (u32) | value
//! ```
//!
//! Key types come from three ranges: `[0, 999]` belongs to the driver,
//! `[1001, 1999]` to the proxy and `[2001, 65535]` is shared by server,
//! driver and proxy. A `SESS_INFO` value is a run of session sync fragments,
//! each `info type (u16) | length (u32) | data`.
//!
//! Peers that do not speak the new format get their region kept verbatim.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use super::error::ProtocolError;
use super::flags::Ob20ProtocolFlags;

pub const OB_V20_PRO_EXTRA_KV_NAME_SYNC_SESSION_INFO: &str = "sess_inf";
pub const OB_V20_PRO_EXTRA_KV_NAME_FULL_LINK_TRACE: &str = "full_trc";
pub const OB_SESSION_INFO_VERI: &str = "sess_ver";
pub const OB_TRACE_INFO_VAR_NAME: &str = "ob_trace_info";
pub const OB_TRACE_INFO_CLIENT_IP: &str = "client_ip";

pub const OB20_DRIVER_END: u16 = 1000;
pub const OB20_PROXY_END: u16 = 2000;

/// Size of the length prefix in front of the extra info region
pub const EXTRA_LEN_SIZE: usize = 4;
/// Size of a key type + value length pair
pub const KV_HEADER_SIZE: usize = 6;
/// Size of a session sync fragment header
pub const SESS_FRAGMENT_HEADER_SIZE: usize = 6;

/// Extra info keys the proxy understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ExtraInfoKey {
    TraceInfo = 2001,
    SessInfo = 2002,
    FullTrc = 2003,
    SessInfoVeri = 2004,
}

impl ExtraInfoKey {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            2001 => Some(ExtraInfoKey::TraceInfo),
            2002 => Some(ExtraInfoKey::SessInfo),
            2003 => Some(ExtraInfoKey::FullTrc),
            2004 => Some(ExtraInfoKey::SessInfoVeri),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExtraInfoKey::TraceInfo => OB_TRACE_INFO_VAR_NAME,
            ExtraInfoKey::SessInfo => OB_V20_PRO_EXTRA_KV_NAME_SYNC_SESSION_INFO,
            ExtraInfoKey::FullTrc => OB_V20_PRO_EXTRA_KV_NAME_FULL_LINK_TRACE,
            ExtraInfoKey::SessInfoVeri => OB_SESSION_INFO_VERI,
        }
    }
}

/// Owner of a key type, decided by its numeric range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyRange {
    Driver,
    Proxy,
    Shared,
    /// The range end markers 1000 and 2000
    Invalid,
}

impl KeyRange {
    pub fn of(key: u16) -> Self {
        match key {
            0..=999 => KeyRange::Driver,
            OB20_DRIVER_END | OB20_PROXY_END => KeyRange::Invalid,
            1001..=1999 => KeyRange::Proxy,
            _ => KeyRange::Shared,
        }
    }
}

/// Kinds of session state carried in `SESS_INFO` fragments
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum SessionSyncInfoType {
    ApplicationInfo = 0,
    ApplicationContext = 1,
    ClientId = 2,
    ControlInfo = 3,
    SysVar = 4,
    TxnStaticInfo = 5,
    TxnDynamicInfo = 6,
    TxnParticipantsInfo = 7,
    TxnExtraInfo = 8,
}

impl SessionSyncInfoType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(SessionSyncInfoType::ApplicationInfo),
            1 => Some(SessionSyncInfoType::ApplicationContext),
            2 => Some(SessionSyncInfoType::ClientId),
            3 => Some(SessionSyncInfoType::ControlInfo),
            4 => Some(SessionSyncInfoType::SysVar),
            5 => Some(SessionSyncInfoType::TxnStaticInfo),
            6 => Some(SessionSyncInfoType::TxnDynamicInfo),
            7 => Some(SessionSyncInfoType::TxnParticipantsInfo),
            8 => Some(SessionSyncInfoType::TxnExtraInfo),
            _ => None,
        }
    }
}

/// One session sync fragment, borrowed from a segment store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSyncFragment<'a> {
    /// Raw type; unknown types are passed through for the session layer
    pub info_type: u16,
    pub data: &'a [u8],
}

impl<'a> SessionSyncFragment<'a> {
    /// Split a fragment into its type and data
    pub fn parse(fragment: &'a [u8]) -> Result<Self, ProtocolError> {
        let (fragment_len, info_type) = read_fragment_header(fragment)?;
        if fragment_len != fragment.len() {
            return Err(ProtocolError::Truncated {
                needed: fragment_len,
                available: fragment.len(),
            });
        }
        Ok(Self {
            info_type,
            data: &fragment[SESS_FRAGMENT_HEADER_SIZE..],
        })
    }

    pub fn known_type(&self) -> Option<SessionSyncInfoType> {
        SessionSyncInfoType::from_u16(self.info_type)
    }

    /// Serialize a fragment, header included
    pub fn encode(info_type: SessionSyncInfoType, data: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(SESS_FRAGMENT_HEADER_SIZE + data.len());
        buf.put_u16_le(info_type as u16);
        buf.put_u32_le(data.len() as u32);
        buf.extend_from_slice(data);
        buf
    }
}

/// Returns the full length of the fragment at the start of `src` and its type
fn read_fragment_header(src: &[u8]) -> Result<(usize, u16), ProtocolError> {
    if src.len() < SESS_FRAGMENT_HEADER_SIZE {
        return Err(ProtocolError::Truncated {
            needed: SESS_FRAGMENT_HEADER_SIZE,
            available: src.len(),
        });
    }
    let mut buf = src;
    let info_type = buf.get_u16_le();
    let data_len = buf.get_u32_le() as usize;
    let fragment_len = SESS_FRAGMENT_HEADER_SIZE + data_len;
    if fragment_len > src.len() {
        return Err(ProtocolError::Truncated {
            needed: fragment_len,
            available: src.len(),
        });
    }
    Ok((fragment_len, info_type))
}

/// Extra info of one OB20 packet, including the session sync segment store
#[derive(Debug, Default, Clone)]
pub struct Ob20ExtraInfo {
    is_exist_sess_info: bool,
    /// Region kept verbatim for peers using the old format
    extra_info_buf: BytesMut,
    /// Recognized non-session values, in arrival order
    values: Vec<(ExtraInfoKey, Bytes)>,
    sess_info_buf: BytesMut,
    sess_info_count: u32,
    extra_len: u32,
    sess_info_length: Vec<usize>,
    sess_info_cur_idx: u32,
    sess_info_offset: usize,
}

impl Ob20ExtraInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear everything for the next packet
    pub fn reset(&mut self) {
        self.is_exist_sess_info = false;
        self.extra_info_buf.clear();
        self.values.clear();
        self.sess_info_buf.clear();
        self.sess_info_count = 0;
        self.extra_len = 0;
        self.sess_info_length.clear();
        self.sess_info_cur_idx = 0;
        self.sess_info_offset = 0;
    }

    pub fn exist_sess_info(&self) -> bool {
        self.is_exist_sess_info
    }

    pub fn get_sess_info_count(&self) -> u32 {
        self.sess_info_count
    }

    /// Byte length of the serialized region, as last encoded or decoded
    pub fn extra_len(&self) -> u32 {
        self.extra_len
    }

    /// Nothing to put on the wire
    pub fn is_empty(&self) -> bool {
        !self.is_exist_sess_info && self.values.is_empty() && self.extra_info_buf.is_empty()
    }

    /// Region bytes kept for the old format
    pub fn raw_extra_info(&self) -> &[u8] {
        &self.extra_info_buf
    }

    /// Append one session sync fragment
    pub fn add_sess_info_buf(&mut self, value: &[u8]) -> Result<(), ProtocolError> {
        if value.is_empty() {
            warn!(len = value.len(), "invalid argument: empty session info");
            return Err(ProtocolError::InvalidArgument("empty session info fragment"));
        }
        self.sess_info_buf.extend_from_slice(value);
        self.sess_info_length.push(value.len());
        self.is_exist_sess_info = true;
        self.sess_info_count += 1;
        Ok(())
    }

    /// Next fragment, borrowed from the store
    pub fn get_next_sess_info(&mut self) -> Result<&[u8], ProtocolError> {
        let Some(&length) = self.sess_info_length.get(self.sess_info_cur_idx as usize) else {
            warn!(
                cur_idx = self.sess_info_cur_idx,
                count = self.sess_info_count,
                "session info iterator exhausted"
            );
            return Err(ProtocolError::SessInfoExhausted {
                count: self.sess_info_count,
            });
        };
        let buf_length = self.sess_info_buf.len();
        if self.sess_info_offset + length > buf_length {
            warn!(
                offset = self.sess_info_offset,
                length,
                buf_length,
                "unexpected length of sess info buffer"
            );
            return Err(ProtocolError::Truncated {
                needed: self.sess_info_offset + length,
                available: buf_length,
            });
        }
        let start = self.sess_info_offset;
        self.sess_info_offset += length;
        self.sess_info_cur_idx += 1;
        Ok(&self.sess_info_buf[start..start + length])
    }

    /// Rewind the iterator without dropping any fragment
    pub fn reset_sess_info_iterate_idx(&mut self) {
        self.sess_info_cur_idx = 0;
        self.sess_info_offset = 0;
    }

    /// Byte offset of the iterator in the concatenated buffer
    pub fn sess_info_offset(&self) -> usize {
        self.sess_info_offset
    }

    /// Total bytes of all fragments
    pub fn sess_info_len(&self) -> usize {
        self.sess_info_buf.len()
    }

    /// Store a recognized non-session value, replacing an earlier one
    pub fn set_value(&mut self, key: ExtraInfoKey, value: impl Into<Bytes>) -> Result<(), ProtocolError> {
        if key == ExtraInfoKey::SessInfo {
            return Err(ProtocolError::InvalidArgument(
                "session info goes through add_sess_info_buf",
            ));
        }
        let value = value.into();
        match self.values.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.values.push((key, value)),
        }
        Ok(())
    }

    pub fn value(&self, key: ExtraInfoKey) -> Option<&[u8]> {
        self.values
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_ref())
    }

    /// Decode the extra info at the start of an OB20 payload
    ///
    /// Returns the extra info and the rest of the payload (the inner MySQL
    /// packets). Without the extra-info flag the payload is returned whole.
    pub fn decode(
        payload: &[u8],
        flags: Ob20ProtocolFlags,
    ) -> Result<(Self, &[u8]), ProtocolError> {
        let mut info = Self::new();
        if !flags.is_extra_info_exist() {
            return Ok((info, payload));
        }

        if payload.len() < EXTRA_LEN_SIZE {
            return Err(ProtocolError::Truncated {
                needed: EXTRA_LEN_SIZE,
                available: payload.len(),
            });
        }
        let extra_len = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        let end = EXTRA_LEN_SIZE + extra_len as usize;
        if end > payload.len() {
            warn!(extra_len, payload_len = payload.len(), "extra info exceeds payload");
            return Err(ProtocolError::Truncated {
                needed: end,
                available: payload.len(),
            });
        }

        info.decode_region(&payload[EXTRA_LEN_SIZE..end], flags)?;
        info.extra_len = extra_len;
        Ok((info, &payload[end..]))
    }

    fn decode_region(&mut self, region: &[u8], flags: Ob20ProtocolFlags) -> Result<(), ProtocolError> {
        if !flags.is_new_extra_info() {
            self.extra_info_buf.extend_from_slice(region);
            return Ok(());
        }

        let mut buf = region;
        while !buf.is_empty() {
            if buf.len() < KV_HEADER_SIZE {
                return Err(ProtocolError::Truncated {
                    needed: KV_HEADER_SIZE,
                    available: buf.len(),
                });
            }
            let key = buf.get_u16_le();
            let len = buf.get_u32_le() as usize;
            if len > buf.len() {
                warn!(key, len, remaining = buf.len(), "extra info value exceeds region");
                return Err(ProtocolError::Truncated {
                    needed: len,
                    available: buf.len(),
                });
            }
            let (value, rest) = buf.split_at(len);
            buf = rest;

            match KeyRange::of(key) {
                KeyRange::Invalid => return Err(ProtocolError::InvalidExtraInfoKey(key)),
                KeyRange::Driver | KeyRange::Proxy => {
                    debug!(key, len, "skip extra info key not meant for proxy");
                }
                KeyRange::Shared => match ExtraInfoKey::from_u16(key) {
                    Some(ExtraInfoKey::SessInfo) => self.split_sess_info(value)?,
                    Some(known) => self.set_value(known, Bytes::copy_from_slice(value))?,
                    None => debug!(key, len, "skip unknown extra info key"),
                },
            }
        }
        Ok(())
    }

    fn split_sess_info(&mut self, mut value: &[u8]) -> Result<(), ProtocolError> {
        while !value.is_empty() {
            let (fragment_len, info_type) = read_fragment_header(value)?;
            debug!(info_type, fragment_len, "session sync fragment");
            let (fragment, rest) = value.split_at(fragment_len);
            self.add_sess_info_buf(fragment)?;
            value = rest;
        }
        Ok(())
    }

    /// Serialized size of the region, without the 4-byte length prefix
    fn region_len(&self, flags: Ob20ProtocolFlags) -> usize {
        if !flags.is_new_extra_info() {
            return self.extra_info_buf.len();
        }
        let values: usize = self.values.iter().map(|(_, v)| KV_HEADER_SIZE + v.len()).sum();
        let sess = if self.is_exist_sess_info {
            KV_HEADER_SIZE + self.sess_info_buf.len()
        } else {
            0
        };
        values + sess
    }

    /// Write the length prefix and the region; returns the region length
    ///
    /// Must run before the enclosing header is finalized, since the payload
    /// length depends on it. Content that the requested format cannot carry
    /// is rejected and nothing is written.
    pub fn encode(&mut self, flags: Ob20ProtocolFlags, dst: &mut BytesMut) -> Result<u32, ProtocolError> {
        if flags.is_new_extra_info() {
            if !self.extra_info_buf.is_empty() {
                warn!(len = self.extra_info_buf.len(), "old format extra info cannot be sent as new format");
                return Err(ProtocolError::InvalidArgument(
                    "old format extra info with new format flag",
                ));
            }
        } else if self.is_exist_sess_info || !self.values.is_empty() {
            warn!(
                sess_info_count = self.sess_info_count,
                values = self.values.len(),
                "key-value extra info cannot be sent as old format"
            );
            return Err(ProtocolError::InvalidArgument(
                "key-value extra info without new format flag",
            ));
        }

        let region_len = self.region_len(flags);
        let extra_len = u32::try_from(region_len).map_err(|_| ProtocolError::PayloadTooLarge {
            len: region_len,
            max: u32::MAX as usize,
        })?;

        dst.reserve(EXTRA_LEN_SIZE + region_len);
        dst.put_u32_le(extra_len);
        if flags.is_new_extra_info() {
            for (key, value) in &self.values {
                dst.put_u16_le(*key as u16);
                dst.put_u32_le(value.len() as u32);
                dst.extend_from_slice(value);
            }
            if self.is_exist_sess_info {
                dst.put_u16_le(ExtraInfoKey::SessInfo as u16);
                dst.put_u32_le(self.sess_info_buf.len() as u32);
                dst.extend_from_slice(&self.sess_info_buf);
            }
        } else {
            dst.extend_from_slice(&self.extra_info_buf);
        }

        self.extra_len = extra_len;
        Ok(extra_len)
    }
}

impl fmt::Display for Ob20ExtraInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "is_exist_sess_info={}, sess_info_count={}, extra_len={}",
            self.is_exist_sess_info, self.sess_info_count, self.extra_len
        )?;
        for (key, value) in &self.values {
            write!(f, ", {}={}B", key.name(), value.len())?;
        }
        Ok(())
    }
}
