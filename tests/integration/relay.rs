//! Relay tests: traffic forwarding and disconnection classification

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use obproxy::config::ProtocolConfig;
use obproxy::diagnosis::{vc_event, DiagnosisDetail, InactivityTimeoutEvent, TraceType, VcDisconnectInitiator};
use obproxy::protocol::{Ob20ProtocolHeaderParam, ProtocolError, OB_ERR_UNEXPECTED};
use obproxy::relay::RelayError;
use tokio::io::AsyncWriteExt;

use crate::{ob20_command, RelayHarness, COM_QUERY, COM_QUIT};

const WAIT: Duration = Duration::from_secs(30);

fn vc_detail(trace: &obproxy::diagnosis::ConnectionDiagnosisTrace) -> (i32, VcDisconnectInitiator, i64) {
    let info = trace.diagnosis_info().expect("diagnosis recorded");
    match info.detail {
        DiagnosisDetail::Vc {
            vc_event,
            disconnect_initiator,
        } => (vc_event, disconnect_initiator, info.error_code),
        other => panic!("unexpected detail {:?}", other),
    }
}

#[tokio::test]
async fn test_forwards_and_records_server_close() {
    let RelayHarness {
        mut client,
        mut server,
        trace,
        handle,
    } = RelayHarness::start(ProtocolConfig::default(), WAIT);

    let param = Ob20ProtocolHeaderParam::new(1, 10, 0, 0)
        .with_last_packet(true)
        .with_weak_read(true);
    client.send(ob20_command(param, COM_QUERY, b"SELECT 1")).await.unwrap();

    let request = server.next().await.unwrap().unwrap();
    assert_eq!(request.header.request_id, 10);
    assert!(request.header.flag.is_last_packet());
    // weak read is not offered by default
    assert!(!request.header.flag.is_weak_read());

    let response_param = Ob20ProtocolHeaderParam::new(1, 10, 1, 1).with_last_packet(true);
    server
        .send(ob20_command(response_param, 0x00, b"\x00\x00\x02\x00\x00\x00"))
        .await
        .unwrap();
    let response = client.next().await.unwrap().unwrap();
    assert_eq!(response.header.pkt_seq, 1);

    drop(server);
    handle.await.unwrap().unwrap();

    assert_eq!(trace.trace_type(), TraceType::ServerVc);
    assert_eq!(
        vc_detail(&trace),
        (vc_event::VC_EVENT_EOS, VcDisconnectInitiator::Server, 0)
    );
}

#[tokio::test]
async fn test_records_client_close_after_traffic() {
    let RelayHarness {
        mut client,
        server,
        trace,
        handle,
    } = RelayHarness::start(ProtocolConfig::default(), WAIT);

    let param = Ob20ProtocolHeaderParam::new(1, 1, 0, 0).with_last_packet(true);
    client.send(ob20_command(param, COM_QUERY, b"SELECT 1")).await.unwrap();
    drop(client);
    handle.await.unwrap().unwrap();
    drop(server);

    assert_eq!(trace.trace_type(), TraceType::ClientVc);
    assert_eq!(
        vc_detail(&trace),
        (vc_event::VC_EVENT_EOS, VcDisconnectInitiator::Client, 0)
    );
}

#[tokio::test]
async fn test_com_quit_is_not_a_diagnosis() {
    let RelayHarness {
        mut client,
        mut server,
        trace,
        handle,
    } = RelayHarness::start(ProtocolConfig::default(), WAIT);

    let param = Ob20ProtocolHeaderParam::new(1, 1, 0, 0).with_last_packet(true);
    client.send(ob20_command(param, COM_QUIT, b"")).await.unwrap();
    assert!(server.next().await.unwrap().is_ok());
    drop(client);
    handle.await.unwrap().unwrap();

    assert_eq!(trace.trace_type(), TraceType::Unknown);
    assert!(trace.diagnosis_info().is_none());
}

#[tokio::test]
async fn test_close_before_first_packet_is_not_recorded() {
    let RelayHarness {
        client,
        server: _server,
        trace,
        handle,
    } = RelayHarness::start(ProtocolConfig::default(), WAIT);

    drop(client);
    handle.await.unwrap().unwrap();
    assert!(trace.diagnosis_info().is_none());
}

#[tokio::test]
async fn test_framing_error_closes_connection() {
    let RelayHarness {
        mut client,
        server: _server,
        trace,
        handle,
    } = RelayHarness::start(ProtocolConfig::default(), WAIT);

    client.get_mut().write_all(&[0xAA; 64]).await.unwrap();
    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        RelayError::Client(ProtocolError::HeaderChecksum { .. })
    ));

    assert_eq!(trace.trace_type(), TraceType::VcDisconnect);
    assert_eq!(
        vc_detail(&trace),
        (vc_event::EVENT_ERROR, VcDisconnectInitiator::Proxy, OB_ERR_UNEXPECTED as i64)
    );
}

#[tokio::test(start_paused = true)]
async fn test_client_wait_timeout() {
    let RelayHarness {
        client: _client,
        server: _server,
        trace,
        handle,
    } = RelayHarness::start(ProtocolConfig::default(), WAIT);

    let err = handle.await.unwrap().unwrap_err();
    assert!(matches!(err, RelayError::ClientWaitTimeout(d) if d == WAIT));

    assert_eq!(trace.trace_type(), TraceType::TimeoutDisconnect);
    let info = trace.diagnosis_info().unwrap();
    assert_eq!(
        info.detail,
        DiagnosisDetail::InactivityTimeout {
            event: InactivityTimeoutEvent::ClientWaitTimeout,
            timeout: 30_000_000_000,
        }
    );
    assert!(info.to_string().contains("client wait timeout"));
}
