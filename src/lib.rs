//! OB20 protocol layer and connection diagnosis for an OceanBase-compatible
//! MySQL proxy.

pub mod config;
pub mod diagnosis;
pub mod metrics;
pub mod protocol;
pub mod relay;
