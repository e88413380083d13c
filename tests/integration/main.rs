//! Integration test entry point
//!
//! Drives the library through its public API. Sockets are replaced by
//! in-memory `tokio::io::duplex` pipes, so no external server is needed.
//!
//! Run with: cargo test --test integration

mod diagnosis;
mod ob20;
mod relay;

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use obproxy::config::ProtocolConfig;
use obproxy::diagnosis::{ConnectionDiagnosisTrace, DiagnosisInfoPool, RecordPolicy};
use obproxy::protocol::{Ob20Codec, Ob20ExtraInfo, Ob20Packet, Ob20ProtocolHeaderParam, Packet};
use obproxy::relay::{Relay, RelayError};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub const COM_QUIT: u8 = 0x01;
pub const COM_QUERY: u8 = 0x03;

/// One MySQL command packet, header included
pub fn command_packet(command: u8, arg: &[u8]) -> BytesMut {
    let mut payload = vec![command];
    payload.extend_from_slice(arg);
    let mut buf = BytesMut::new();
    Packet::new(0, payload).encode(&mut buf);
    buf
}

/// OB20 packet wrapping a single command and no extra info
pub fn ob20_command(param: Ob20ProtocolHeaderParam, command: u8, arg: &[u8]) -> Ob20Packet {
    Ob20Packet::build(&param, &mut Ob20ExtraInfo::new(), &command_packet(command, arg)).unwrap()
}

/// A relay running between two in-memory peers
pub struct RelayHarness {
    pub client: Framed<DuplexStream, Ob20Codec>,
    pub server: Framed<DuplexStream, Ob20Codec>,
    pub trace: Arc<ConnectionDiagnosisTrace>,
    pub handle: JoinHandle<Result<(), RelayError>>,
}

impl RelayHarness {
    pub fn start(protocol: ProtocolConfig, client_wait_timeout: Duration) -> Self {
        let (client, proxy_client) = tokio::io::duplex(64 * 1024);
        let (proxy_server, server) = tokio::io::duplex(64 * 1024);

        let trace = ConnectionDiagnosisTrace::new(RecordPolicy::all(), DiagnosisInfoPool::unbounded());
        let relay = Relay::new(7, &protocol, client_wait_timeout, trace.clone());
        let handle = tokio::spawn(relay.run(proxy_client, proxy_server));

        Self {
            client: Framed::new(client, Ob20Codec::default()),
            server: Framed::new(server, Ob20Codec::default()),
            trace,
            handle,
        }
    }
}
