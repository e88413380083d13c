use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use obproxy::config::{self, Config};
use obproxy::diagnosis::{
    vc_event, ConnectionDiagnosisTrace, DiagnosisInfoPool, RecordPolicy, TraceType,
    VcDisconnectInitiator,
};
use obproxy::metrics::metrics;
use obproxy::protocol::OB_ERR_UNEXPECTED;
use obproxy::relay::Relay;

/// Global connection counter for generating unique session IDs
static CONNECTION_COUNTER: AtomicU32 = AtomicU32::new(1);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(Level::INFO.into())
                .from_env_lossy(),
        )
        .init();

    // Load configuration
    let config = Arc::new(load_or_default_config());

    let info_pool = DiagnosisInfoPool::new(config.diagnosis.info_pool_capacity);
    let policy = RecordPolicy::from(&config.diagnosis);

    info!(
        enabled = policy.is_enabled(),
        info_pool_capacity = config.diagnosis.info_pool_capacity,
        client_wait_timeout_ms = config.diagnosis.client_wait_timeout_ms,
        "Connection diagnosis configured"
    );
    info!(
        offered_flags = %config.protocol.offered_flags(),
        tail_checksum = config.protocol.enable_tail_checksum,
        max_payload_len = config.protocol.max_payload_len,
        "OB20 protocol configured"
    );

    let addr = format!("{}:{}", config.server.listen_addr, config.server.listen_port);
    let listener = TcpListener::bind(&addr).await?;

    info!(addr = %addr, backend = %config.backend.addr(), "OB20 proxy listening");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "Failed to accept connection");
                continue;
            }
        };

        let session_id = CONNECTION_COUNTER.fetch_add(1, Ordering::SeqCst);
        let config = config.clone();
        let trace = ConnectionDiagnosisTrace::new(policy, info_pool.clone());
        trace.update_context(|ctx| {
            ctx.cs_id = session_id as i64;
            ctx.client_addr = Some(peer_addr);
        });

        info!(session_id = session_id, peer = %peer_addr, "New connection");
        metrics().record_connection_accepted();

        tokio::spawn(async move {
            handle_connection(session_id, stream, &config, trace.clone()).await;
            trace.log_diagnosis_info();
            trace.free();
            metrics().record_connection_closed();
        });
    }
}

async fn handle_connection(
    session_id: u32,
    client: TcpStream,
    config: &Config,
    trace: Arc<ConnectionDiagnosisTrace>,
) {
    let backend_addr = config.backend.addr();
    let server = match TcpStream::connect(&backend_addr).await {
        Ok(s) => s,
        Err(e) => {
            warn!(session_id = session_id, backend = %backend_addr, error = %e, "Backend connection failed");
            if trace.classify(TraceType::ServerVc) {
                let _ = trace.record_vc_disconnection(
                    vc_event::EVENT_ERROR,
                    VcDisconnectInitiator::Proxy,
                    OB_ERR_UNEXPECTED as i64,
                    &e.to_string(),
                );
            }
            return;
        }
    };
    trace.update_context(|ctx| ctx.server_addr = server.peer_addr().ok());

    let client_wait_timeout = Duration::from_millis(config.diagnosis.client_wait_timeout_ms);
    let relay = Relay::new(session_id, &config.protocol, client_wait_timeout, trace);
    match relay.run(client, server).await {
        Ok(()) => info!(session_id = session_id, "Session ended"),
        Err(e) => warn!(session_id = session_id, error = %e, "Session ended with error"),
    }
}

fn load_or_default_config() -> Config {
    // Try to load from config file
    let config_paths = ["config/obproxy.toml", "obproxy.toml"];

    for path in config_paths {
        match config::load_config(path) {
            Ok(config) => {
                info!(path = path, "Loaded configuration");
                return config;
            }
            Err(e) => {
                warn!(path = path, error = %e, "Failed to load config");
            }
        }
    }

    info!("Using default configuration");
    Config::default()
}
