//! OB20 pass-through relay
//!
//! Forwards whole OB20 packets between a client and its backend, downgrading
//! the negotiable features to what the proxy offers, and classifies how the
//! connection ended into the connection's diagnosis trace.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, trace, warn};

use crate::config::ProtocolConfig;
use crate::diagnosis::{
    vc_event, ConnectionDiagnosisTrace, HrTime, InactivityTimeoutEvent, TraceType,
    VcDisconnectInitiator,
};
use crate::protocol::{
    Command, Ob20Codec, Ob20Packet, Ob20ProtocolFlags, Packet, ProtocolError, SessionSyncFragment,
};

/// Which end of the relay an event came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn initiator(&self) -> VcDisconnectInitiator {
        match self {
            Side::Client => VcDisconnectInitiator::Client,
            Side::Server => VcDisconnectInitiator::Server,
        }
    }

    fn trace_type(&self) -> TraceType {
        match self {
            Side::Client => TraceType::ClientVc,
            Side::Server => TraceType::ServerVc,
        }
    }
}

/// Relay for one client connection
pub struct Relay {
    session_id: u32,
    offered: Ob20ProtocolFlags,
    max_payload_len: usize,
    enable_tail_checksum: bool,
    client_wait_timeout: Duration,
    trace: Arc<ConnectionDiagnosisTrace>,
}

impl Relay {
    pub fn new(
        session_id: u32,
        protocol: &ProtocolConfig,
        client_wait_timeout: Duration,
        trace: Arc<ConnectionDiagnosisTrace>,
    ) -> Self {
        Self {
            session_id,
            offered: protocol.offered_flags(),
            max_payload_len: protocol.max_payload_len,
            enable_tail_checksum: protocol.enable_tail_checksum,
            client_wait_timeout,
            trace,
        }
    }

    fn codec(&self) -> Ob20Codec {
        Ob20Codec::new(self.max_payload_len, self.enable_tail_checksum)
    }

    /// Relay until either side goes away
    ///
    /// A peer closing its end is a normal exit; framing errors, write
    /// failures and the client wait timeout are returned as errors. In every
    /// case the reason is recorded in the trace first.
    pub async fn run<C, S>(self, client_stream: C, server_stream: S) -> Result<(), RelayError>
    where
        C: AsyncRead + AsyncWrite + Unpin,
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut client = Framed::new(client_stream, self.codec());
        let mut server = Framed::new(server_stream, self.codec());

        let idle = tokio::time::sleep(self.client_wait_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                _ = &mut idle => {
                    self.on_client_wait_timeout();
                    return Err(RelayError::ClientWaitTimeout(self.client_wait_timeout));
                }
                frame = client.next() => {
                    let packet = match frame {
                        Some(Ok(p)) => p,
                        Some(Err(e)) => return Err(self.on_read_error(Side::Client, e)),
                        None => {
                            self.on_peer_closed(Side::Client);
                            return Ok(());
                        }
                    };
                    idle.as_mut().reset(Instant::now() + self.client_wait_timeout);

                    self.trace.set_first_packet_received(true);
                    if let Err(e) = self.inspect_request(&packet) {
                        return Err(self.on_read_error(Side::Client, e));
                    }
                    let packet = self.downgrade(packet, Side::Server);
                    if let Err(e) = server.send(packet).await {
                        return Err(self.on_write_error(Side::Server, e));
                    }
                }
                frame = server.next() => {
                    let packet = match frame {
                        Some(Ok(p)) => p,
                        Some(Err(e)) => return Err(self.on_read_error(Side::Server, e)),
                        None => {
                            self.on_peer_closed(Side::Server);
                            return Ok(());
                        }
                    };
                    idle.as_mut().reset(Instant::now() + self.client_wait_timeout);

                    let packet = self.downgrade(packet, Side::Client);
                    if let Err(e) = client.send(packet).await {
                        return Err(self.on_write_error(Side::Client, e));
                    }
                }
            }
        }
    }

    /// Look into a client packet: session sync fragments and the command
    fn inspect_request(&self, packet: &Ob20Packet) -> Result<(), ProtocolError> {
        let (mut extra_info, inner) = packet.split_extra_info()?;
        for _ in 0..extra_info.get_sess_info_count() {
            let fragment = SessionSyncFragment::parse(extra_info.get_next_sess_info()?)?;
            trace!(
                session_id = self.session_id,
                info_type = ?fragment.known_type(),
                len = fragment.data.len(),
                "session sync fragment"
            );
        }

        let mut inner = BytesMut::from(&inner[..]);
        if let Some(request) = Packet::decode(&mut inner) {
            if request.sequence_id == 0 && request.command() == Some(Command::Quit) {
                debug!(session_id = self.session_id, "Client sent COM_QUIT");
                self.trace.set_com_quit(true);
            }
        }
        Ok(())
    }

    /// Clear feature bits the proxy does not offer towards `to`
    ///
    /// The extra info format bit follows the sender, since the region is
    /// forwarded as is. Switch route is a request to the server and never
    /// goes back to the client.
    fn downgrade(&self, mut packet: Ob20Packet, to: Side) -> Ob20Packet {
        let flag = packet.header.flag;
        let mut offered = self.offered.set_new_extra_info(flag.is_new_extra_info());
        if to == Side::Client {
            offered = offered.set_proxy_switch_route(false);
        }
        let negotiated = flag.negotiate(offered);
        if negotiated != flag {
            trace!(
                session_id = self.session_id,
                from = flag.bits(),
                to = negotiated.bits(),
                "downgraded OB20 flags"
            );
            packet.header.flag = negotiated;
        }
        packet
    }

    fn on_peer_closed(&self, side: Side) {
        info!(session_id = self.session_id, side = ?side, "Peer closed connection");
        let msg = match side {
            Side::Client => "client closed connection",
            Side::Server => "server closed connection",
        };
        self.record_vc(side.trace_type(), vc_event::VC_EVENT_EOS, side.initiator(), 0, msg);
    }

    fn on_read_error(&self, side: Side, e: ProtocolError) -> RelayError {
        warn!(session_id = self.session_id, side = ?side, error = %e, "Failed to read OB20 packet");
        let (trace_type, initiator) = if matches!(e, ProtocolError::Io(_)) {
            (side.trace_type(), side.initiator())
        } else {
            // The bytes on the wire can no longer be trusted
            (TraceType::VcDisconnect, VcDisconnectInitiator::Proxy)
        };
        self.record_vc(trace_type, vc_event::EVENT_ERROR, initiator, e.code() as i64, &e.to_string());
        RelayError::from_side(side, e)
    }

    fn on_write_error(&self, side: Side, e: ProtocolError) -> RelayError {
        warn!(session_id = self.session_id, side = ?side, error = %e, "Failed to write OB20 packet");
        self.record_vc(
            side.trace_type(),
            vc_event::EVENT_ERROR,
            side.initiator(),
            e.code() as i64,
            &e.to_string(),
        );
        RelayError::from_side(side, e)
    }

    fn on_client_wait_timeout(&self) {
        info!(
            session_id = self.session_id,
            timeout_ms = self.client_wait_timeout.as_millis() as u64,
            "Client wait timeout"
        );
        if self.trace.classify(TraceType::TimeoutDisconnect) {
            let timeout = HrTime::try_from(self.client_wait_timeout.as_nanos()).unwrap_or(HrTime::MAX);
            // Allocation failures are logged and counted by the trace
            let _ = self.trace.record_inactivity_timeout_disconnection(
                InactivityTimeoutEvent::ClientWaitTimeout,
                timeout,
                0,
                "client wait timeout",
            );
        }
    }

    fn record_vc(
        &self,
        trace_type: TraceType,
        event: i32,
        initiator: VcDisconnectInitiator,
        error_code: i64,
        error_msg: &str,
    ) {
        if self.trace.classify(trace_type) {
            let _ = self
                .trace
                .record_vc_disconnection(event, initiator, error_code, error_msg);
        }
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Client stream error: {0}")]
    Client(ProtocolError),

    #[error("Server stream error: {0}")]
    Server(ProtocolError),

    #[error("Client idle for {0:?}")]
    ClientWaitTimeout(Duration),
}

impl RelayError {
    fn from_side(side: Side, e: ProtocolError) -> Self {
        match side {
            Side::Client => RelayError::Client(e),
            Side::Server => RelayError::Server(e),
        }
    }
}
