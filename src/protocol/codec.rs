use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{trace, warn};

use super::checksum::payload_checksum;
use super::error::ProtocolError;
use super::extra_info::Ob20ExtraInfo;
use super::flags::{Ob20ProtocolFlags, Ob20ProtocolHeaderParam};
use super::header::{Ob20ProtocolHeader, OB20_HEADER_LEN, OB20_TAIL_CHECKSUM_LEN};
use crate::metrics::metrics;

/// Default upper bound on a single OB20 payload (16MB)
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// One OB20 packet: header plus payload (extra info and inner packets)
#[derive(Debug, Clone)]
pub struct Ob20Packet {
    pub header: Ob20ProtocolHeader,
    pub payload: Bytes,
}

impl Ob20Packet {
    /// Assemble an outbound packet
    ///
    /// The extra info is serialized first so that the header is built with
    /// the final payload length.
    pub fn build(
        param: &Ob20ProtocolHeaderParam,
        extra_info: &mut Ob20ExtraInfo,
        inner: &[u8],
    ) -> Result<Self, ProtocolError> {
        let extra_info_exist = !extra_info.is_empty();
        let mut payload = BytesMut::with_capacity(inner.len());
        if extra_info_exist {
            let flags = Ob20ProtocolFlags::from_param(param, true);
            extra_info.encode(flags, &mut payload)?;
        }
        payload.extend_from_slice(inner);

        let payload_len = u32::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLarge {
            len: payload.len(),
            max: u32::MAX as usize,
        })?;
        let header = Ob20ProtocolHeader::new(param, payload_len, extra_info_exist);
        Ok(Self {
            header,
            payload: payload.freeze(),
        })
    }

    /// Split the payload into its extra info and the inner packet bytes
    pub fn split_extra_info(&self) -> Result<(Ob20ExtraInfo, Bytes), ProtocolError> {
        let (info, inner) = Ob20ExtraInfo::decode(&self.payload, self.header.flag)?;
        let inner = self.payload.slice_ref(inner);
        Ok((info, inner))
    }
}

/// OB20 packet codec for use with tokio Framed
///
/// After a framing error the codec drops what it buffered and refuses to
/// decode anything else: there is no resynchronization, the transport has to
/// close the connection.
#[derive(Debug)]
pub struct Ob20Codec {
    max_payload_len: usize,
    enable_tail_checksum: bool,
    poisoned: bool,
}

impl Default for Ob20Codec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD_LEN, true)
    }
}

impl Ob20Codec {
    pub fn new(max_payload_len: usize, enable_tail_checksum: bool) -> Self {
        Self {
            max_payload_len,
            enable_tail_checksum,
            poisoned: false,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    fn poison(&mut self, src: &mut BytesMut, err: ProtocolError) -> ProtocolError {
        warn!(error = %err, buffered = src.len(), "OB20 framing error, discarding stream");
        metrics()
            .ob20_framing_errors_total
            .with_label_values(&[err.kind()])
            .inc();
        self.poisoned = true;
        src.clear();
        err
    }
}

impl Decoder for Ob20Codec {
    type Item = Ob20Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.poisoned {
            return Err(ProtocolError::Poisoned);
        }
        if src.len() < OB20_HEADER_LEN {
            return Ok(None);
        }

        let header = match Ob20ProtocolHeader::decode(&src[..OB20_HEADER_LEN]) {
            Ok(header) => header,
            Err(e) => return Err(self.poison(src, e)),
        };
        let payload_len = header.payload_len as usize;
        if payload_len > self.max_payload_len {
            let err = ProtocolError::PayloadTooLarge {
                len: payload_len,
                max: self.max_payload_len,
            };
            return Err(self.poison(src, err));
        }

        let total_len = header.total_len();
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(OB20_HEADER_LEN);
        let payload = src.split_to(payload_len).freeze();
        let expected = src.get_u32_le();
        if expected != 0 {
            let computed = payload_checksum(&payload);
            if computed != expected {
                return Err(self.poison(src, ProtocolError::TailChecksum { expected, computed }));
            }
        }

        trace!(header = %header, "decoded OB20 packet");
        metrics().ob20_frames_total.with_label_values(&["in"]).inc();
        Ok(Some(Ob20Packet { header, payload }))
    }
}

impl Encoder<Ob20Packet> for Ob20Codec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Ob20Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let mut header = item.header;
        if header.payload_len as usize != item.payload.len() {
            return Err(ProtocolError::LengthMismatch {
                compressed_len: header.cp_hdr.compressed_len,
                payload_len: item.payload.len() as u32,
            });
        }

        dst.reserve(OB20_HEADER_LEN + item.payload.len() + OB20_TAIL_CHECKSUM_LEN);
        header.encode(dst);
        dst.extend_from_slice(&item.payload);
        let tail = if self.enable_tail_checksum {
            payload_checksum(&item.payload)
        } else {
            0
        };
        dst.put_u32_le(tail);

        metrics().ob20_frames_total.with_label_values(&["out"]).inc();
        Ok(())
    }
}
