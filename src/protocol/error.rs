/// OceanBase result code for a rejected argument
pub const OB_INVALID_ARGUMENT: i32 = -4002;
/// OceanBase result code for a failed allocation
pub const OB_ALLOCATE_MEMORY_FAILED: i32 = -4013;
/// OceanBase result code for corrupted or inconsistent input
pub const OB_ERR_UNEXPECTED: i32 = -4016;

/// OB20 protocol errors
///
/// Framing errors (magic, checksums, version, lengths) leave the connection
/// unusable. Bounds errors are fatal for the packet being decoded. Invalid
/// arguments are rejected before any mutation happens.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("Bad magic number: expected {expected:#06x}, got {actual:#06x}")]
    BadMagic { expected: u16, actual: u16 },

    #[error("Header checksum mismatch: expected {expected:#06x}, computed {computed:#06x}")]
    HeaderChecksum { expected: u16, computed: u16 },

    #[error("Unsupported OB20 version: {0}")]
    UnsupportedVersion(u16),

    #[error("Compressed length {compressed_len} does not match payload length {payload_len}")]
    LengthMismatch { compressed_len: u32, payload_len: u32 },

    #[error("Tail checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    TailChecksum { expected: u32, computed: u32 },

    #[error("Payload length {len} exceeds limit {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Buffer too short: need {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Invalid extra info key: {0}")]
    InvalidExtraInfoKey(u16),

    #[error("Session info iterator exhausted after {count} fragments")]
    SessInfoExhausted { count: u32 },

    #[error("Codec is unusable after a framing error")]
    Poisoned,

    #[error("IO error: {0}")]
    Io(String),
}

impl ProtocolError {
    /// OceanBase result code for this error
    pub fn code(&self) -> i32 {
        match self {
            ProtocolError::InvalidArgument(_) => OB_INVALID_ARGUMENT,
            _ => OB_ERR_UNEXPECTED,
        }
    }

    /// Whether the error means the byte stream can no longer be trusted
    pub fn is_framing(&self) -> bool {
        matches!(
            self,
            ProtocolError::BadMagic { .. }
                | ProtocolError::HeaderChecksum { .. }
                | ProtocolError::UnsupportedVersion(_)
                | ProtocolError::LengthMismatch { .. }
                | ProtocolError::TailChecksum { .. }
                | ProtocolError::PayloadTooLarge { .. }
                | ProtocolError::Poisoned
        )
    }

    /// Short label used for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::InvalidArgument(_) => "invalid_argument",
            ProtocolError::BadMagic { .. } => "bad_magic",
            ProtocolError::HeaderChecksum { .. } => "header_checksum",
            ProtocolError::UnsupportedVersion(_) => "unsupported_version",
            ProtocolError::LengthMismatch { .. } => "length_mismatch",
            ProtocolError::TailChecksum { .. } => "tail_checksum",
            ProtocolError::PayloadTooLarge { .. } => "payload_too_large",
            ProtocolError::Truncated { .. } => "truncated",
            ProtocolError::InvalidExtraInfoKey(_) => "invalid_extra_info_key",
            ProtocolError::SessInfoExhausted { .. } => "sess_info_exhausted",
            ProtocolError::Poisoned => "poisoned",
            ProtocolError::Io(_) => "io",
        }
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e.to_string())
    }
}
