//! OB20 negotiation flags
//!
//! The 32-bit flag word travels in every OB20 header. Bit layout, low bit
//! first:
//!
//! ```text
//! bit 0  extra info exists
//! bit 1  last packet of the response
//! bit 2  proxy reroute
//! bit 3  new extra info format
//! bit 4  weak read
//! bit 5  transaction internal routing
//! bit 6  proxy switch route
//! 7..31  reserved
//! ```

use std::fmt;

pub const OB_EXTRA_INFO_EXIST: u32 = 1;
pub const OB_IS_LAST_PACKET: u32 = 1 << 1;
pub const OB_IS_PROXY_REROUTE: u32 = 1 << 2;
pub const OB_IS_NEW_EXTRA_INFO: u32 = 1 << 3;
pub const OB_IS_WEAK_READ: u32 = 1 << 4;
pub const OB_IS_TRANS_INTERNAL_ROUTING: u32 = 1 << 5;
pub const OB_PROXY_SWITCH_ROUTE: u32 = 1 << 6;

/// Every bit with a defined meaning
pub const KNOWN_FLAGS_MASK: u32 = 0x7F;
/// Bits that must be zero on the wire
pub const RESERVED_FLAGS_MASK: u32 = !KNOWN_FLAGS_MASK;

/// Feature bits that are agreed per connection rather than set per packet
pub const NEGOTIABLE_FLAGS_MASK: u32 =
    OB_IS_NEW_EXTRA_INFO | OB_IS_WEAK_READ | OB_IS_TRANS_INTERNAL_ROUTING | OB_PROXY_SWITCH_ROUTE;

/// Flag word of an OB20 header
///
/// Reserved bits survive decoding untouched so that a newer peer is not
/// rejected, but they are never produced by [`Ob20ProtocolFlags::to_wire`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ob20ProtocolFlags(u32);

impl Ob20ProtocolFlags {
    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// Raw value as received, reserved bits included
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Value to put on the wire: reserved bits cleared
    pub fn to_wire(&self) -> u32 {
        self.0 & KNOWN_FLAGS_MASK
    }

    fn has(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    fn with(self, bit: u32, on: bool) -> Self {
        if on {
            Self(self.0 | bit)
        } else {
            Self(self.0 & !bit)
        }
    }

    pub fn is_extra_info_exist(&self) -> bool {
        self.has(OB_EXTRA_INFO_EXIST)
    }

    pub fn is_last_packet(&self) -> bool {
        self.has(OB_IS_LAST_PACKET)
    }

    pub fn is_proxy_reroute(&self) -> bool {
        self.has(OB_IS_PROXY_REROUTE)
    }

    pub fn is_new_extra_info(&self) -> bool {
        self.has(OB_IS_NEW_EXTRA_INFO)
    }

    pub fn is_weak_read(&self) -> bool {
        self.has(OB_IS_WEAK_READ)
    }

    pub fn is_trans_internal_routing(&self) -> bool {
        self.has(OB_IS_TRANS_INTERNAL_ROUTING)
    }

    pub fn is_proxy_switch_route(&self) -> bool {
        self.has(OB_PROXY_SWITCH_ROUTE)
    }

    pub fn set_extra_info_exist(self, on: bool) -> Self {
        self.with(OB_EXTRA_INFO_EXIST, on)
    }

    pub fn set_last_packet(self, on: bool) -> Self {
        self.with(OB_IS_LAST_PACKET, on)
    }

    pub fn set_proxy_reroute(self, on: bool) -> Self {
        self.with(OB_IS_PROXY_REROUTE, on)
    }

    pub fn set_new_extra_info(self, on: bool) -> Self {
        self.with(OB_IS_NEW_EXTRA_INFO, on)
    }

    pub fn set_weak_read(self, on: bool) -> Self {
        self.with(OB_IS_WEAK_READ, on)
    }

    pub fn set_trans_internal_routing(self, on: bool) -> Self {
        self.with(OB_IS_TRANS_INTERNAL_ROUTING, on)
    }

    pub fn set_proxy_switch_route(self, on: bool) -> Self {
        self.with(OB_PROXY_SWITCH_ROUTE, on)
    }

    /// Build the flag word for an outbound header
    pub fn from_param(param: &Ob20ProtocolHeaderParam, extra_info_exist: bool) -> Self {
        Self::default()
            .set_extra_info_exist(extra_info_exist)
            .set_last_packet(param.is_last_packet())
            .set_proxy_reroute(param.is_need_reroute())
            .set_new_extra_info(param.is_new_extra_info())
            .set_weak_read(param.is_weak_read())
            .set_trans_internal_routing(param.is_trans_internal_routing())
            .set_proxy_switch_route(param.is_switch_route())
    }

    /// Downgrade the negotiable features to what both sides support
    ///
    /// Per-packet bits (extra info, last packet, reroute) are taken from
    /// `self` unchanged.
    pub fn negotiate(self, peer: Ob20ProtocolFlags) -> Self {
        let per_packet = self.0 & !NEGOTIABLE_FLAGS_MASK;
        let shared = self.0 & peer.0 & NEGOTIABLE_FLAGS_MASK;
        Self((per_packet | shared) & KNOWN_FLAGS_MASK)
    }
}

impl From<u32> for Ob20ProtocolFlags {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Ob20ProtocolFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flags={:#x} {{extra_info_exist={}, last_packet={}, proxy_reroute={}, new_extra_info={}, weak_read={}, trans_internal_routing={}, proxy_switch_route={}}}",
            self.0,
            self.is_extra_info_exist(),
            self.is_last_packet(),
            self.is_proxy_reroute(),
            self.is_new_extra_info(),
            self.is_weak_read(),
            self.is_trans_internal_routing(),
            self.is_proxy_switch_route(),
        )
    }
}

/// Values needed to build an outbound OB20 header
///
/// Carries intent between layers. It is deliberately a separate type from
/// the wire flags; [`Ob20ProtocolFlags::from_param`] does the mirroring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ob20ProtocolHeaderParam {
    connection_id: u32,
    request_id: u32,
    compressed_seq: u8,
    pkt_seq: u8,
    is_last_packet: bool,
    is_weak_read: bool,
    is_need_reroute: bool,
    is_new_extra_info: bool,
    is_trans_internal_routing: bool,
    /// Only meaningful towards the server
    is_switch_route: bool,
}

impl Ob20ProtocolHeaderParam {
    pub fn new(connection_id: u32, request_id: u32, compressed_seq: u8, pkt_seq: u8) -> Self {
        Self {
            connection_id,
            request_id,
            compressed_seq,
            pkt_seq,
            ..Default::default()
        }
    }

    /// Recover the intent carried by a received header's flags
    pub fn from_flags(
        connection_id: u32,
        request_id: u32,
        compressed_seq: u8,
        pkt_seq: u8,
        flags: Ob20ProtocolFlags,
    ) -> Self {
        Self::new(connection_id, request_id, compressed_seq, pkt_seq)
            .with_last_packet(flags.is_last_packet())
            .with_weak_read(flags.is_weak_read())
            .with_need_reroute(flags.is_proxy_reroute())
            .with_new_extra_info(flags.is_new_extra_info())
            .with_trans_internal_routing(flags.is_trans_internal_routing())
            .with_switch_route(flags.is_proxy_switch_route())
    }

    pub fn with_last_packet(mut self, on: bool) -> Self {
        self.is_last_packet = on;
        self
    }

    pub fn with_weak_read(mut self, on: bool) -> Self {
        self.is_weak_read = on;
        self
    }

    pub fn with_need_reroute(mut self, on: bool) -> Self {
        self.is_need_reroute = on;
        self
    }

    pub fn with_new_extra_info(mut self, on: bool) -> Self {
        self.is_new_extra_info = on;
        self
    }

    pub fn with_trans_internal_routing(mut self, on: bool) -> Self {
        self.is_trans_internal_routing = on;
        self
    }

    pub fn with_switch_route(mut self, on: bool) -> Self {
        self.is_switch_route = on;
        self
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn compressed_seq(&self) -> u8 {
        self.compressed_seq
    }

    pub fn pkt_seq(&self) -> u8 {
        self.pkt_seq
    }

    pub fn is_last_packet(&self) -> bool {
        self.is_last_packet
    }

    pub fn is_weak_read(&self) -> bool {
        self.is_weak_read
    }

    pub fn is_need_reroute(&self) -> bool {
        self.is_need_reroute
    }

    pub fn is_new_extra_info(&self) -> bool {
        self.is_new_extra_info
    }

    pub fn is_trans_internal_routing(&self) -> bool {
        self.is_trans_internal_routing
    }

    pub fn is_switch_route(&self) -> bool {
        self.is_switch_route
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Display for Ob20ProtocolHeaderParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connection_id={}, request_id={}, compressed_seq={}, pkt_seq={}, is_last_packet={}, is_weak_read={}, is_need_reroute={}, is_new_extra_info={}, is_trans_internal_routing={}, is_switch_route={}",
            self.connection_id,
            self.request_id,
            self.compressed_seq,
            self.pkt_seq,
            self.is_last_packet,
            self.is_weak_read,
            self.is_need_reroute,
            self.is_new_extra_info,
            self.is_trans_internal_routing,
            self.is_switch_route,
        )
    }
}
