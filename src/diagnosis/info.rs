//! Diagnosis payloads stored by a connection trace
//!
//! Every variant shares the connection identity (ids, addresses, cluster,
//! tenant and user) plus an error code and a bounded error message.

use std::fmt;
use std::net::SocketAddr;

use super::TraceType;
use crate::protocol::Command;

/// Error messages are cut to this many bytes
pub const MAX_MSG_BUF_LEN: usize = 128;
/// Login-time internal SQL is cut to this many bytes
pub const OB_SHORT_SQL_LENGTH: usize = 64;

/// High resolution time in nanoseconds
pub type HrTime = i64;

/// Transport event codes, as delivered by the event system
pub mod vc_event {
    pub const EVENT_IMMEDIATE: i32 = 1;
    pub const EVENT_ERROR: i32 = 3;
    pub const VC_EVENT_READ_READY: i32 = 100;
    pub const VC_EVENT_WRITE_READY: i32 = 101;
    pub const VC_EVENT_READ_COMPLETE: i32 = 102;
    pub const VC_EVENT_WRITE_COMPLETE: i32 = 103;
    pub const VC_EVENT_EOS: i32 = 104;
    pub const VC_EVENT_INACTIVITY_TIMEOUT: i32 = 105;
    pub const VC_EVENT_ACTIVE_TIMEOUT: i32 = 106;

    pub fn name(event: i32) -> &'static str {
        match event {
            EVENT_IMMEDIATE => "EVENT_IMMEDIATE",
            EVENT_ERROR => "EVENT_ERROR",
            VC_EVENT_READ_READY => "VC_EVENT_READ_READY",
            VC_EVENT_WRITE_READY => "VC_EVENT_WRITE_READY",
            VC_EVENT_READ_COMPLETE => "VC_EVENT_READ_COMPLETE",
            VC_EVENT_WRITE_COMPLETE => "VC_EVENT_WRITE_COMPLETE",
            VC_EVENT_EOS => "VC_EVENT_EOS",
            VC_EVENT_INACTIVITY_TIMEOUT => "VC_EVENT_INACTIVITY_TIMEOUT",
            VC_EVENT_ACTIVE_TIMEOUT => "VC_EVENT_ACTIVE_TIMEOUT",
            _ => "UNKNOWN_EVENT",
        }
    }
}

/// Which side closed the virtual connection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VcDisconnectInitiator {
    #[default]
    Unknown,
    Client,
    Server,
    Proxy,
}

impl VcDisconnectInitiator {
    pub fn name(&self) -> &'static str {
        match self {
            VcDisconnectInitiator::Unknown => "OB_UNKNOWN",
            VcDisconnectInitiator::Client => "OB_CLIENT",
            VcDisconnectInitiator::Server => "OB_SERVER",
            VcDisconnectInitiator::Proxy => "OB_PROXY",
        }
    }
}

/// Which inactivity timeout fired
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InactivityTimeoutEvent {
    #[default]
    Unknown,
    ClientDeleteClusterResource,
    ClientInternalCmdTimeout,
    ClientConnectTimeout,
    ClientNetReadTimeout,
    ClientExecutePlanTimeout,
    ClientWaitTimeout,
    ClientNetWriteTimeout,
    ServerQueryTimeout,
    ServerTrxTimeout,
    ServerWaitTimeout,
}

impl InactivityTimeoutEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InactivityTimeoutEvent::Unknown => "OB_TIMEOUT_UNKNOWN_EVENT",
            InactivityTimeoutEvent::ClientDeleteClusterResource => "OB_CLIENT_DELETE_CLUSTER_RESOURCE",
            InactivityTimeoutEvent::ClientInternalCmdTimeout => "OB_CLIENT_INTERNAL_CMD_TIMEOUT",
            InactivityTimeoutEvent::ClientConnectTimeout => "OB_CLIENT_CONNECT_TIMEOUT",
            InactivityTimeoutEvent::ClientNetReadTimeout => "OB_CLIENT_NET_READ_TIMEOUT",
            InactivityTimeoutEvent::ClientExecutePlanTimeout => "OB_CLIENT_EXECEUTE_PLAN_TIMEOUT",
            InactivityTimeoutEvent::ClientWaitTimeout => "OB_CLIENT_WAIT_TIMEOUT",
            InactivityTimeoutEvent::ClientNetWriteTimeout => "OB_CLIENT_NET_WRITE_TIMEOUT",
            InactivityTimeoutEvent::ServerQueryTimeout => "OB_SERVER_QUERY_TIMEOUT",
            InactivityTimeoutEvent::ServerTrxTimeout => "OB_SERVER_TRX_TIMEOUT",
            InactivityTimeoutEvent::ServerWaitTimeout => "OB_SERVER_WAIT_TIMEOUT",
        }
    }
}

/// Identity of the connection a diagnosis belongs to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosisContext {
    pub cs_id: i64,
    pub ss_id: i64,
    pub proxy_session_id: i64,
    pub server_session_id: i64,
    pub client_addr: Option<SocketAddr>,
    pub server_addr: Option<SocketAddr>,
    pub cluster_name: String,
    pub tenant_name: String,
    pub user_name: String,
}

/// Variant specific part of a diagnosis
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosisDetail {
    Login {
        internal_sql: String,
    },
    Vc {
        vc_event: i32,
        disconnect_initiator: VcDisconnectInitiator,
    },
    InactivityTimeout {
        event: InactivityTimeoutEvent,
        timeout: HrTime,
    },
    ProxyInternal {
        sql: String,
        sql_cmd: Command,
        request_cmd: Command,
    },
}

impl DiagnosisDetail {
    pub fn name(&self) -> &'static str {
        match self {
            DiagnosisDetail::Login { .. } => "login",
            DiagnosisDetail::Vc { .. } => "vc",
            DiagnosisDetail::InactivityTimeout { .. } => "inactivity_timeout",
            DiagnosisDetail::ProxyInternal { .. } => "proxy_internal",
        }
    }

    /// Whether this detail describes a disconnection classified as `trace_type`
    pub fn fits(&self, trace_type: TraceType) -> bool {
        match self {
            DiagnosisDetail::Login { .. } => trace_type == TraceType::LoginDisconnect,
            DiagnosisDetail::Vc { .. } => matches!(
                trace_type,
                TraceType::ClientVc
                    | TraceType::ServerVc
                    | TraceType::VcDisconnect
                    | TraceType::InternalRequestVc
            ),
            DiagnosisDetail::InactivityTimeout { .. } => trace_type == TraceType::TimeoutDisconnect,
            DiagnosisDetail::ProxyInternal { .. } => trace_type == TraceType::ProxyInternal,
        }
    }
}

/// One recorded disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDiagnosisInfo {
    pub context: DiagnosisContext,
    pub error_code: i64,
    pub error_msg: String,
    pub detail: DiagnosisDetail,
}

impl ConnectionDiagnosisInfo {
    pub fn new(context: DiagnosisContext, error_code: i64, error_msg: &str, detail: DiagnosisDetail) -> Self {
        Self {
            context,
            error_code,
            error_msg: truncate_to(error_msg, MAX_MSG_BUF_LEN).to_string(),
            detail,
        }
    }
}

/// Longest prefix of `s` within `max_len` bytes that ends on a char boundary
pub(crate) fn truncate_to(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn fmt_addr(addr: &Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_default()
}

impl fmt::Display for ConnectionDiagnosisInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ctx = &self.context;
        write!(
            f,
            "cs_id:{}, ss_id:{}, proxy_session_id:{}, server_session_id:{}, client_addr:\"{}\", server_addr:\"{}\", cluster_name:\"{}\", tenant_name:\"{}\", user_name:\"{}\", error_code:{}, error_msg:\"{}\"",
            ctx.cs_id,
            ctx.ss_id,
            ctx.proxy_session_id,
            ctx.server_session_id,
            fmt_addr(&ctx.client_addr),
            fmt_addr(&ctx.server_addr),
            ctx.cluster_name,
            ctx.tenant_name,
            ctx.user_name,
            self.error_code,
            self.error_msg,
        )?;
        match &self.detail {
            DiagnosisDetail::Login { internal_sql } => {
                write!(f, ", internal_sql:\"{}\"", internal_sql)
            }
            DiagnosisDetail::Vc {
                vc_event,
                disconnect_initiator,
            } => write!(
                f,
                ", vc_event:\"{}\", disconnect_initiator:\"{}\"",
                vc_event::name(*vc_event),
                disconnect_initiator.name()
            ),
            DiagnosisDetail::InactivityTimeout { event, timeout } => write!(
                f,
                ", timeout_event:\"{}\", timeout:{}",
                event.name(),
                timeout
            ),
            DiagnosisDetail::ProxyInternal {
                sql,
                sql_cmd,
                request_cmd,
            } => write!(
                f,
                ", sql:\"{}\", sql_cmd:\"{}\", request_cmd:\"{}\"",
                sql, sql_cmd, request_cmd
            ),
        }
    }
}
