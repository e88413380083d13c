//! OB20 framing tests across the public protocol API

use bytes::{BufMut, BytesMut};
use futures::{SinkExt, StreamExt};
use obproxy::protocol::{
    ExtraInfoKey, Ob20Codec, Ob20ExtraInfo, Ob20Packet, Ob20ProtocolFlags, Ob20ProtocolHeader,
    Ob20ProtocolHeaderParam, ProtocolError, SessionSyncFragment, SessionSyncInfoType,
    OB20_HEADER_LEN,
};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::{command_packet, COM_QUERY};

fn request_param() -> Ob20ProtocolHeaderParam {
    Ob20ProtocolHeaderParam::new(3_000_001, 42, 0, 0)
        .with_last_packet(true)
        .with_new_extra_info(true)
}

#[tokio::test]
async fn test_session_sync_fragments_survive_the_wire() {
    let (a, b) = tokio::io::duplex(4096);
    let mut sender = Framed::new(a, Ob20Codec::default());
    let mut receiver = Framed::new(b, Ob20Codec::default());

    let fragments = [
        SessionSyncFragment::encode(SessionSyncInfoType::SysVar, b"autocommit=1"),
        SessionSyncFragment::encode(SessionSyncInfoType::TxnStaticInfo, b""),
        SessionSyncFragment::encode(SessionSyncInfoType::ClientId, b"app-7"),
    ];
    let mut extra = Ob20ExtraInfo::new();
    for fragment in &fragments {
        extra.add_sess_info_buf(fragment).unwrap();
    }
    extra
        .set_value(ExtraInfoKey::TraceInfo, &b"trace-1"[..])
        .unwrap();

    let inner = command_packet(COM_QUERY, b"SELECT 1");
    let packet = Ob20Packet::build(&request_param(), &mut extra, &inner).unwrap();
    sender.send(packet).await.unwrap();

    let received = receiver.next().await.unwrap().unwrap();
    assert_eq!(received.header.connection_id, 3_000_001);
    assert_eq!(received.header.request_id, 42);
    assert!(received.header.flag.is_last_packet());

    let (mut decoded, inner_bytes) = received.split_extra_info().unwrap();
    assert_eq!(&inner_bytes[..], &inner[..]);
    assert_eq!(decoded.value(ExtraInfoKey::TraceInfo), Some(&b"trace-1"[..]));
    assert_eq!(decoded.get_sess_info_count(), 3);
    for fragment in &fragments {
        assert_eq!(decoded.get_next_sess_info().unwrap(), &fragment[..]);
    }
    assert_eq!(decoded.sess_info_offset(), decoded.sess_info_len());
    assert!(matches!(
        decoded.get_next_sess_info(),
        Err(ProtocolError::SessInfoExhausted { count: 3 })
    ));

    decoded.reset_sess_info_iterate_idx();
    let first = SessionSyncFragment::parse(decoded.get_next_sess_info().unwrap()).unwrap();
    assert_eq!(first.known_type(), Some(SessionSyncInfoType::SysVar));
    assert_eq!(first.data, b"autocommit=1");
}

#[test]
fn test_driver_keys_skipped_and_shared_keys_kept() {
    let mut region = BytesMut::new();
    for (key, value) in [(999u16, &b"driver"[..]), (2001, &b"trc"[..]), (1500, &b"proxy"[..])] {
        region.put_u16_le(key);
        region.put_u32_le(value.len() as u32);
        region.extend_from_slice(value);
    }
    let mut payload = BytesMut::new();
    payload.put_u32_le(region.len() as u32);
    payload.extend_from_slice(&region);
    payload.extend_from_slice(&command_packet(COM_QUERY, b"SELECT 2"));

    let flags = Ob20ProtocolFlags::default()
        .set_extra_info_exist(true)
        .set_new_extra_info(true);
    let (info, inner) = Ob20ExtraInfo::decode(&payload, flags).unwrap();
    assert_eq!(info.value(ExtraInfoKey::TraceInfo), Some(&b"trc"[..]));
    assert!(!info.exist_sess_info());
    assert_eq!(inner, &command_packet(COM_QUERY, b"SELECT 2")[..]);
}

#[test]
fn test_range_end_keys_are_rejected() {
    for key in [1000u16, 2000] {
        let mut payload = BytesMut::new();
        payload.put_u32_le(6);
        payload.put_u16_le(key);
        payload.put_u32_le(0);

        let flags = Ob20ProtocolFlags::default()
            .set_extra_info_exist(true)
            .set_new_extra_info(true);
        assert_eq!(
            Ob20ExtraInfo::decode(&payload, flags).unwrap_err(),
            ProtocolError::InvalidExtraInfoKey(key)
        );
    }
}

#[test]
fn test_every_header_bit_flip_is_detected() {
    let param = request_param();
    let mut codec = Ob20Codec::default();
    let packet = Ob20Packet::build(&param, &mut Ob20ExtraInfo::new(), &command_packet(COM_QUERY, b"x")).unwrap();
    let mut clean = BytesMut::new();
    codec.encode(packet, &mut clean).unwrap();

    // The checksum field itself sits at bytes 29 and 30
    for byte in 0..OB20_HEADER_LEN - 2 {
        for bit in 0..8 {
            let mut corrupted = clean.clone();
            corrupted[byte] ^= 1 << bit;
            assert!(
                matches!(
                    Ob20ProtocolHeader::decode(&corrupted[..OB20_HEADER_LEN]),
                    Err(ProtocolError::HeaderChecksum { .. })
                ),
                "flip of byte {} bit {} went unnoticed",
                byte,
                bit
            );
        }
    }
}

#[test]
fn test_header_param_flags_round_trip() {
    let param = Ob20ProtocolHeaderParam::new(1, 2, 3, 4)
        .with_last_packet(true)
        .with_weak_read(false)
        .with_trans_internal_routing(true);
    let flags = Ob20ProtocolFlags::from_param(&param, false);
    assert!(flags.is_last_packet());
    assert!(!flags.is_weak_read());
    assert!(flags.is_trans_internal_routing());
    assert!(!flags.is_extra_info_exist());
    assert_eq!(flags.to_wire() & !0x7F, 0);

    let back = Ob20ProtocolHeaderParam::from_flags(1, 2, 3, 4, flags);
    assert_eq!(back, param);
}

#[test]
fn test_poisoned_codec_refuses_further_input() {
    let mut codec = Ob20Codec::default();
    let mut garbage = BytesMut::from(&[0xAAu8; 64][..]);
    assert!(codec.decode(&mut garbage).is_err());
    assert!(codec.is_poisoned());

    let mut clean = BytesMut::new();
    let packet = Ob20Packet::build(&request_param(), &mut Ob20ExtraInfo::new(), &command_packet(COM_QUERY, b"y")).unwrap();
    Ob20Codec::default().encode(packet, &mut clean).unwrap();
    assert_eq!(codec.decode(&mut clean).unwrap_err(), ProtocolError::Poisoned);
}
