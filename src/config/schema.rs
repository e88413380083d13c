use serde::Deserialize;

use crate::diagnosis::TraceType;
use crate::protocol::codec::DEFAULT_MAX_PAYLOAD_LEN;
use crate::protocol::Ob20ProtocolFlags;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    /// Backend observer (or downstream proxy) OB20 traffic is relayed to
    pub backend: BackendConfig,
    /// OB20 protocol options
    #[serde(default)]
    pub protocol: ProtocolConfig,
    /// Connection diagnosis options
    #[serde(default)]
    pub diagnosis: DiagnosisConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_port() -> u16 {
    2883
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    #[serde(default = "default_backend_port")]
    pub port: u16,
}

fn default_backend_port() -> u16 {
    2881
}

impl BackendConfig {
    /// Get the address string (host:port)
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_backend_port(),
        }
    }
}

// ============================================================================
// Protocol Configuration
// ============================================================================

/// OB20 capabilities offered by the proxy
///
/// The effective set on a connection is the negotiation of these with what
/// the peer announces.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolConfig {
    /// Compute the payload tail checksum on outbound packets
    #[serde(default = "default_true")]
    pub enable_tail_checksum: bool,
    /// Largest payload accepted from a peer (bytes)
    #[serde(default = "default_max_payload_len")]
    pub max_payload_len: usize,
    #[serde(default = "default_true")]
    pub enable_new_extra_info: bool,
    #[serde(default)]
    pub enable_trans_internal_routing: bool,
    #[serde(default)]
    pub enable_weak_read: bool,
    #[serde(default)]
    pub enable_proxy_switch_route: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_payload_len() -> usize {
    DEFAULT_MAX_PAYLOAD_LEN
}

impl ProtocolConfig {
    /// Negotiable features the proxy is willing to keep on forwarded packets
    pub fn offered_flags(&self) -> Ob20ProtocolFlags {
        Ob20ProtocolFlags::default()
            .set_new_extra_info(self.enable_new_extra_info)
            .set_weak_read(self.enable_weak_read)
            .set_trans_internal_routing(self.enable_trans_internal_routing)
            .set_proxy_switch_route(self.enable_proxy_switch_route)
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            enable_tail_checksum: true,
            max_payload_len: default_max_payload_len(),
            enable_new_extra_info: true,
            enable_trans_internal_routing: false,
            enable_weak_read: false,
            enable_proxy_switch_route: false,
        }
    }
}

// ============================================================================
// Diagnosis Configuration
// ============================================================================

/// Connection diagnosis configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DiagnosisConfig {
    /// Whether disconnections are recorded at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Trace types to record
    #[serde(default = "default_record_types")]
    pub record: Vec<TraceType>,
    /// Maximum diagnosis infos alive at once (0 = unbounded)
    #[serde(default)]
    pub info_pool_capacity: usize,
    /// Idle time after which a client connection is closed (milliseconds)
    #[serde(default = "default_client_wait_timeout_ms")]
    pub client_wait_timeout_ms: u64,
}

fn default_record_types() -> Vec<TraceType> {
    TraceType::ALL.to_vec()
}

fn default_client_wait_timeout_ms() -> u64 {
    28_800_000
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            record: default_record_types(),
            info_pool_capacity: 0,
            client_wait_timeout_ms: default_client_wait_timeout_ms(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: default_listen_port(),
            },
            backend: BackendConfig::default(),
            protocol: ProtocolConfig::default(),
            diagnosis: DiagnosisConfig::default(),
        }
    }
}
