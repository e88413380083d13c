//! Connection diagnosis tests through the public API

use std::sync::Arc;

use obproxy::config::DiagnosisConfig;
use obproxy::diagnosis::{
    ConnectionDiagnosisTrace, DiagnosisDetail, DiagnosisInfoPool, InactivityTimeoutEvent,
    RecordPolicy, TraceType,
};
use obproxy::protocol::{Command, OB_ALLOCATE_MEMORY_FAILED, OB_INVALID_ARGUMENT};

#[test]
fn test_client_wait_timeout_record() {
    let trace = ConnectionDiagnosisTrace::new(RecordPolicy::all(), DiagnosisInfoPool::unbounded());
    assert!(trace.classify(TraceType::TimeoutDisconnect));
    trace
        .record_inactivity_timeout_disconnection(
            InactivityTimeoutEvent::ClientWaitTimeout,
            5_000_000,
            -1,
            "wait timeout",
        )
        .unwrap();

    let info = trace.diagnosis_info().unwrap();
    assert_eq!(info.error_code, -1);
    match info.detail {
        DiagnosisDetail::InactivityTimeout { event, timeout } => {
            assert_eq!(event, InactivityTimeoutEvent::ClientWaitTimeout);
            assert_eq!(timeout, 5_000_000);
        }
        ref other => panic!("unexpected detail {:?}", other),
    }
    assert!(info.to_string().contains("wait timeout"));
    trace.log_diagnosis_info();
}

#[test]
fn test_shared_pool_exhaustion() {
    let pool = DiagnosisInfoPool::new(2);
    let traces: Vec<_> = (0..3)
        .map(|_| ConnectionDiagnosisTrace::new(RecordPolicy::all(), pool.clone()))
        .collect();

    for trace in &traces {
        assert!(trace.classify(TraceType::ProxyInternal));
    }
    for trace in &traces[..2] {
        trace
            .record_obproxy_internal_disconnection("SELECT 1", Command::Query, Command::Query, -4016, "x")
            .unwrap();
    }
    let err = traces[2]
        .record_obproxy_internal_disconnection("SELECT 1", Command::Query, Command::Query, -4016, "x")
        .unwrap_err();
    assert_eq!(err.code(), OB_ALLOCATE_MEMORY_FAILED);
    assert!(traces[2].diagnosis_info().is_none());
    // Logging an empty trace is fine
    traces[2].log_diagnosis_info();

    // Releasing one connection frees room for the next
    let mut traces = traces.into_iter();
    assert!(traces.next().unwrap().free());
    let last = traces.nth(1).unwrap();
    last
        .record_obproxy_internal_disconnection("SELECT 1", Command::Query, Command::Query, -4016, "retry")
        .unwrap();
    assert!(last.diagnosis_info().is_some());
}

#[test]
fn test_late_record_keeps_classified_info() {
    let trace = ConnectionDiagnosisTrace::new(RecordPolicy::all(), DiagnosisInfoPool::unbounded());
    assert!(trace.classify(TraceType::ServerVc));
    trace
        .record_vc_disconnection(
            obproxy::diagnosis::vc_event::VC_EVENT_EOS,
            obproxy::diagnosis::VcDisconnectInitiator::Server,
            0,
            "server closed",
        )
        .unwrap();

    // The idle timer firing afterwards cannot overwrite the server close
    assert!(!trace.classify(TraceType::TimeoutDisconnect));
    let err = trace
        .record_inactivity_timeout_disconnection(
            InactivityTimeoutEvent::ClientWaitTimeout,
            5_000_000,
            0,
            "wait timeout",
        )
        .unwrap_err();
    assert_eq!(err.code(), OB_INVALID_ARGUMENT);

    let info = trace.diagnosis_info().unwrap();
    assert_eq!(info.error_msg, "server closed");
    assert!(matches!(info.detail, DiagnosisDetail::Vc { .. }));
}

#[test]
fn test_policy_from_config() {
    let config = DiagnosisConfig {
        record: vec![TraceType::ServerVc],
        ..Default::default()
    };
    let trace = ConnectionDiagnosisTrace::new(RecordPolicy::from(&config), DiagnosisInfoPool::unbounded());
    assert!(!trace.classify(TraceType::TimeoutDisconnect));
    assert!(trace.classify(TraceType::ServerVc));

    let disabled = DiagnosisConfig {
        enabled: false,
        ..Default::default()
    };
    assert!(!RecordPolicy::from(&disabled).is_enabled());
}

#[test]
fn test_trace_shared_between_halves() {
    let trace = ConnectionDiagnosisTrace::new(RecordPolicy::all(), DiagnosisInfoPool::unbounded());
    let server_half = Arc::clone(&trace);

    std::thread::spawn(move || {
        assert!(server_half.classify(TraceType::ServerVc));
        server_half
            .record_vc_disconnection(
                obproxy::diagnosis::vc_event::VC_EVENT_EOS,
                obproxy::diagnosis::VcDisconnectInitiator::Server,
                0,
                "server closed",
            )
            .unwrap();
        server_half.free()
    })
    .join()
    .map(|last| assert!(!last))
    .unwrap();

    assert!(!trace.classify(TraceType::ClientVc));
    assert_eq!(trace.trace_type(), TraceType::ServerVc);
    assert!(trace.free());
}
