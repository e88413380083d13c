//! Connection diagnosis
//!
//! Each connection owns one [`ConnectionDiagnosisTrace`], shared between the
//! client-facing and server-facing halves. When the connection goes away the
//! half that noticed it classifies the event and records one diagnosis info,
//! which is logged when the connection is torn down.
//!
//! Recording is a two step call: [`ConnectionDiagnosisTrace::classify`]
//! decides whether the event wins, then one of the `record_*` methods fills
//! the info.

pub mod info;
pub mod pool;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::DiagnosisConfig;
use crate::metrics::metrics;
use crate::protocol::{Command, OB_ALLOCATE_MEMORY_FAILED, OB_INVALID_ARGUMENT};

pub use info::{
    vc_event, ConnectionDiagnosisInfo, DiagnosisContext, DiagnosisDetail, HrTime,
    InactivityTimeoutEvent, VcDisconnectInitiator, MAX_MSG_BUF_LEN, OB_SHORT_SQL_LENGTH,
};
pub use pool::{DiagnosisInfoPool, InfoSlot};

/// Log target for rendered diagnosis records
pub const DIAGNOSIS_LOG_TARGET: &str = "obproxy::diagnosis";

/// Classification of a disconnection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceType {
    #[default]
    Unknown,
    LoginDisconnect,
    ProxyInternal,
    ClientVc,
    ServerVc,
    VcDisconnect,
    InternalRequestVc,
    TimeoutDisconnect,
}

impl TraceType {
    pub const ALL: [TraceType; 7] = [
        TraceType::LoginDisconnect,
        TraceType::ProxyInternal,
        TraceType::ClientVc,
        TraceType::ServerVc,
        TraceType::VcDisconnect,
        TraceType::InternalRequestVc,
        TraceType::TimeoutDisconnect,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TraceType::Unknown => "UNKNOWN_TRACE_TYPE",
            TraceType::LoginDisconnect => "LOGIN_DISCONNECT_TRACE",
            TraceType::ProxyInternal => "PROXY_INTERNAL_TRACE",
            TraceType::ClientVc => "CLIENT_VC_TRACE",
            TraceType::ServerVc => "SERVER_VC_TRACE",
            TraceType::VcDisconnect => "VC_DISCONNECT_TRACE",
            TraceType::InternalRequestVc => "INTERNAL_REQUEST_VC_TRACE",
            TraceType::TimeoutDisconnect => "TIMEOUT_DISCONNECT_TRACE",
        }
    }

    fn bit(&self) -> u16 {
        1 << (*self as u16)
    }
}

impl fmt::Display for TraceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which trace types a connection is allowed to record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordPolicy {
    enabled: bool,
    mask: u16,
}

impl RecordPolicy {
    pub fn all() -> Self {
        Self::from_types(&TraceType::ALL)
    }

    pub fn none() -> Self {
        Self {
            enabled: false,
            mask: 0,
        }
    }

    pub fn from_types(types: &[TraceType]) -> Self {
        let mask = types
            .iter()
            .filter(|t| **t != TraceType::Unknown)
            .fold(0, |mask, t| mask | t.bit());
        Self {
            enabled: true,
            mask,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn allows(&self, trace_type: TraceType) -> bool {
        self.enabled && self.mask & trace_type.bit() != 0
    }
}

impl Default for RecordPolicy {
    fn default() -> Self {
        Self::all()
    }
}

impl From<&DiagnosisConfig> for RecordPolicy {
    fn from(config: &DiagnosisConfig) -> Self {
        if !config.enabled {
            return Self::none();
        }
        Self::from_types(&config.record)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiagnosisError {
    #[error("Failed to allocate diagnosis info for {0}")]
    AllocateMemoryFailed(TraceType),

    #[error("Cannot record {detail} diagnosis for {trace_type}")]
    TraceTypeMismatch {
        trace_type: TraceType,
        detail: &'static str,
    },
}

impl DiagnosisError {
    pub fn code(&self) -> i32 {
        match self {
            DiagnosisError::AllocateMemoryFailed(_) => OB_ALLOCATE_MEMORY_FAILED,
            DiagnosisError::TraceTypeMismatch { .. } => OB_INVALID_ARGUMENT,
        }
    }
}

#[derive(Debug)]
struct TraceState {
    trace_type: TraceType,
    info: Option<(ConnectionDiagnosisInfo, InfoSlot)>,
    is_user_client: bool,
    is_first_packet_received: bool,
    is_com_quit: bool,
    context: DiagnosisContext,
}

impl TraceState {
    fn new() -> Self {
        Self {
            trace_type: TraceType::Unknown,
            info: None,
            is_user_client: true,
            is_first_packet_received: false,
            is_com_quit: false,
            context: DiagnosisContext::default(),
        }
    }
}

/// Per-connection disconnection trace
#[derive(Debug)]
pub struct ConnectionDiagnosisTrace {
    policy: RecordPolicy,
    pool: Arc<DiagnosisInfoPool>,
    state: Mutex<TraceState>,
}

impl ConnectionDiagnosisTrace {
    pub fn new(policy: RecordPolicy, pool: Arc<DiagnosisInfoPool>) -> Arc<Self> {
        Arc::new(Self {
            policy,
            pool,
            state: Mutex::new(TraceState::new()),
        })
    }

    /// Drop the recorded info and return to the unclassified state
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.trace_type = TraceType::Unknown;
        state.info = None;
        state.is_first_packet_received = false;
        state.is_com_quit = false;
    }

    pub fn trace_type(&self) -> TraceType {
        self.state.lock().trace_type
    }

    /// Force the classification, bypassing the recording policy
    pub fn set_trace_type(&self, trace_type: TraceType) {
        self.state.lock().trace_type = trace_type;
    }

    pub fn set_user_client(&self, is_user_client: bool) {
        self.state.lock().is_user_client = is_user_client;
    }

    pub fn set_first_packet_received(&self, received: bool) {
        self.state.lock().is_first_packet_received = received;
    }

    pub fn set_com_quit(&self, is_com_quit: bool) {
        self.state.lock().is_com_quit = is_com_quit;
    }

    pub fn set_context(&self, context: DiagnosisContext) {
        self.state.lock().context = context;
    }

    pub fn update_context<F: FnOnce(&mut DiagnosisContext)>(&self, f: F) {
        f(&mut self.state.lock().context);
    }

    pub fn context(&self) -> DiagnosisContext {
        self.state.lock().context.clone()
    }

    /// Whether an event of `trace_type` should be recorded now
    pub fn need_record_diagnosis_log(&self, trace_type: TraceType) -> bool {
        let state = self.state.lock();
        self.need_record(&state, trace_type)
    }

    fn need_record(&self, state: &TraceState, trace_type: TraceType) -> bool {
        if !self.policy.allows(trace_type) {
            return false;
        }
        match trace_type {
            TraceType::Unknown => return false,
            TraceType::ClientVc => {
                // A client that sent COM_QUIT or never spoke closed on purpose
                if !state.is_user_client || state.is_com_quit || !state.is_first_packet_received {
                    return false;
                }
            }
            TraceType::InternalRequestVc => {
                if state.is_user_client {
                    return false;
                }
            }
            _ => {}
        }
        match state.trace_type {
            TraceType::Unknown => true,
            TraceType::VcDisconnect => {
                matches!(trace_type, TraceType::ClientVc | TraceType::ServerVc)
            }
            _ => false,
        }
    }

    /// Classify the disconnection as `trace_type` if it wins
    ///
    /// Returns true when the caller should go on and record the info.
    pub fn classify(&self, trace_type: TraceType) -> bool {
        let mut state = self.state.lock();
        if !self.need_record(&state, trace_type) {
            return false;
        }
        debug!(from = %state.trace_type, to = %trace_type, "classified disconnection");
        state.trace_type = trace_type;
        true
    }

    /// Fill the info for a classified disconnection
    ///
    /// The detail must fit the current classification, see
    /// [`DiagnosisDetail::fits`].
    pub fn record_vc_disconnection(
        &self,
        vc_event: i32,
        disconnect_initiator: VcDisconnectInitiator,
        error_code: i64,
        error_msg: &str,
    ) -> Result<(), DiagnosisError> {
        self.record(
            error_code,
            error_msg,
            DiagnosisDetail::Vc {
                vc_event,
                disconnect_initiator,
            },
        )
    }

    pub fn record_inactivity_timeout_disconnection(
        &self,
        event: InactivityTimeoutEvent,
        timeout: HrTime,
        error_code: i64,
        error_msg: &str,
    ) -> Result<(), DiagnosisError> {
        self.record(
            error_code,
            error_msg,
            DiagnosisDetail::InactivityTimeout { event, timeout },
        )
    }

    pub fn record_obproxy_internal_disconnection(
        &self,
        sql: &str,
        sql_cmd: Command,
        request_cmd: Command,
        error_code: i64,
        error_msg: &str,
    ) -> Result<(), DiagnosisError> {
        self.record(
            error_code,
            error_msg,
            DiagnosisDetail::ProxyInternal {
                sql: sql.to_string(),
                sql_cmd,
                request_cmd,
            },
        )
    }

    pub fn record_login_disconnection(
        &self,
        internal_sql: &str,
        error_code: i64,
        error_msg: &str,
    ) -> Result<(), DiagnosisError> {
        let internal_sql = info::truncate_to(internal_sql, OB_SHORT_SQL_LENGTH).to_string();
        self.record(error_code, error_msg, DiagnosisDetail::Login { internal_sql })
    }

    fn record(
        &self,
        error_code: i64,
        error_msg: &str,
        detail: DiagnosisDetail,
    ) -> Result<(), DiagnosisError> {
        if !self.policy.is_enabled() {
            return Ok(());
        }

        let mut state = self.state.lock();
        let trace_type = state.trace_type;
        // Only the classified kind of disconnection may be recorded
        if !detail.fits(trace_type) {
            let err = DiagnosisError::TraceTypeMismatch {
                trace_type,
                detail: detail.name(),
            };
            warn!(
                trace_type = %trace_type,
                detail = detail.name(),
                code = err.code(),
                "Diagnosis record does not match classification"
            );
            return Err(err);
        }
        let info = ConnectionDiagnosisInfo::new(state.context.clone(), error_code, error_msg, detail);

        match state.info.as_mut() {
            Some((existing, _)) => *existing = info,
            None => {
                let Some(slot) = self.pool.try_acquire() else {
                    let err = DiagnosisError::AllocateMemoryFailed(trace_type);
                    warn!(
                        trace_type = %trace_type,
                        code = err.code(),
                        in_use = self.pool.in_use(),
                        "Failed to allocate diagnosis info"
                    );
                    metrics().diagnosis_alloc_failures_total.inc();
                    return Err(err);
                };
                state.info = Some((info, slot));
            }
        }

        metrics()
            .diagnosis_records_total
            .with_label_values(&[trace_type.name()])
            .inc();
        Ok(())
    }

    /// Copy of the recorded info, if any
    pub fn diagnosis_info(&self) -> Option<ConnectionDiagnosisInfo> {
        self.state.lock().info.as_ref().map(|(info, _)| info.clone())
    }

    /// Emit the recorded info to the diagnosis log target
    pub fn log_diagnosis_info(&self) {
        let state = self.state.lock();
        match &state.info {
            Some((info, _)) => warn!(
                target: DIAGNOSIS_LOG_TARGET,
                trace_type = %state.trace_type,
                "connection diagnosis: {}",
                info
            ),
            None => debug!(
                target: DIAGNOSIS_LOG_TARGET,
                trace_type = %state.trace_type,
                "no connection diagnosis recorded"
            ),
        }
    }

    /// Release one handle; the info goes back to its pool with the last one
    ///
    /// Returns true when this was the last handle.
    pub fn free(self: Arc<Self>) -> bool {
        Arc::try_unwrap(self).is_ok()
    }
}

impl fmt::Display for ConnectionDiagnosisTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        write!(
            f,
            "trace_type:\"{}\", is_user_client:{}, is_first_packet_received:{}, is_com_quit:{}",
            state.trace_type, state.is_user_client, state.is_first_packet_received, state.is_com_quit
        )?;
        if let Some((info, _)) = &state.info {
            write!(f, ", {}", info)?;
        }
        Ok(())
    }
}
