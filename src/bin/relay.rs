//! Process entry point: reads configuration, loads the node/peer
//! directory, opens the mutually-authenticated TLS connections, and
//! drives both relay loops to completion.
//!
//! Wiring style follows `swedishembedded-sven`'s `main.rs`: parse with
//! `clap`, initialize `tracing-subscriber` first, then hand off to an
//! async body that returns an exit code instead of unwinding panics.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use swpt_relay::broker::{BrokerAdapter, MemoryBroker};
use swpt_relay::config::RelayConfig;
use swpt_relay::directory::{get_database_instance, NodePeersDatabase};
use swpt_relay::protocol::client::{self, ClientConfig};
use swpt_relay::protocol::server::{self, ServerConfig};
use swpt_relay::relay::{ClientSide, ServerSide};
use swpt_relay::tls::{self, NodeIdentity};
use swpt_relay::translate::TranslatorConfig;

/// Configuration error: bad flags, an unreadable directory tree, or a
/// malformed certificate/key pair.
const EXIT_CONFIG_ERROR: u8 = 1;
/// The peer/node directory database could not be loaded.
const EXIT_DATABASE_ERROR: u8 = 2;
/// Every connection attempt to the peer failed, or the listener
/// terminated unexpectedly.
const EXIT_CONNECTION_ERROR: u8 = 3;

fn main() -> ExitCode {
    let cfg = RelayConfig::parse();
    init_logging(&cfg.log_filter);

    let runtime = match swpt_relay::async_runtime::init(cfg.worker_threads()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    runtime.block_on(run(cfg))
}

fn init_logging(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry().with(fmt::layer()).with(env_filter).init();
}

async fn run(cfg: RelayConfig) -> ExitCode {
    let identity = match load_identity(&cfg).await {
        Ok(identity) => identity,
        Err(e) => {
            error!(error = %e, "failed to load node identity");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let db = match get_database_instance(&cfg.db_url) {
        Ok(db) => db,
        Err(e) => {
            error!(error = %e, "unsupported database URL");
            return ExitCode::from(EXIT_DATABASE_ERROR);
        }
    };

    let node = match db.get_node_data().await {
        Ok(node) => Arc::new(node),
        Err(e) => {
            error!(error = %e, "failed to load node data");
            return ExitCode::from(EXIT_DATABASE_ERROR);
        }
    };
    let peer = match db.get_peer_data(&cfg.peer_node_id).await {
        Ok(peer) => Arc::new(peer),
        Err(e) => {
            error!(error = %e, peer_node_id = %cfg.peer_node_id, "failed to load peer data");
            return ExitCode::from(EXIT_DATABASE_ERROR);
        }
    };

    info!(node_id = %node.node_id, peer_node_id = %peer.node_id, "starting relay");

    let broker: Arc<dyn BrokerAdapter> = Arc::new(MemoryBroker::new(Vec::new()));
    let translator_config = TranslatorConfig::default();

    let client_config = match tls::client_config(&peer, &identity) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to build client TLS config");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    let server_config = match tls::server_config(&node, &peer, &identity) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to build server TLS config");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };

    let outbound = tokio::spawn(run_outbound(
        node.clone(),
        peer.clone(),
        cfg.clone(),
        broker.clone(),
        client_config,
    ));
    let inbound = tokio::spawn(run_inbound(
        node.clone(),
        peer.clone(),
        translator_config,
        cfg.clone(),
        broker.clone(),
        server_config,
    ));

    let (outbound, inbound) = tokio::join!(outbound, inbound);
    match (outbound, inbound) {
        (Ok(Ok(())), Ok(Ok(()))) => ExitCode::SUCCESS,
        (Ok(Err(e)), _) | (_, Ok(Err(e))) => {
            error!(error = %e, "relay connection terminated");
            ExitCode::from(EXIT_CONNECTION_ERROR)
        }
        _ => {
            error!("relay task panicked");
            ExitCode::from(EXIT_CONNECTION_ERROR)
        }
    }
}

async fn load_identity(cfg: &RelayConfig) -> std::io::Result<NodeIdentity> {
    Ok(NodeIdentity {
        cert_pem: tokio::fs::read(&cfg.node_cert).await?,
        key_pem: tokio::fs::read(&cfg.node_key).await?,
    })
}

async fn run_outbound(
    node: Arc<swpt_relay::directory::NodeInfo>,
    peer: Arc<swpt_relay::directory::PeerInfo>,
    cfg: RelayConfig,
    broker: Arc<dyn BrokerAdapter>,
    tls_config: Arc<rustls::ClientConfig>,
) -> swpt_relay::error::Result<()> {
    let (host, port) = peer
        .servers
        .first()
        .cloned()
        .ok_or_else(|| swpt_relay::error::ServerError::simple("peer has no servers configured"))?;

    let tcp = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
    let server_name = rustls::pki_types::ServerName::try_from(host.clone())
        .map_err(|_| swpt_relay::error::ServerError::simple("invalid TLS server name"))?;
    let connector = TlsConnector::from(tls_config);
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| swpt_relay::error::ServerError::simple(format!("TLS handshake failed: {e}")))?;

    let conn = client::connect(
        tls_stream,
        ClientConfig {
            host: peer.stomp_host.clone().unwrap_or_else(|| node.node_id.clone()),
            send_destination: peer.stomp_destination.clone().unwrap_or(cfg.send_destination),
            hb_send_min: cfg.hb_send_min,
            hb_recv_desired: cfg.hb_recv_desired,
            max_network_delay: cfg.max_network_delay(),
            send_capacity: 64,
            recv_capacity: 64,
        },
    )
    .await?;

    ClientSide::new(node, peer, broker, conn).run().await
}

async fn run_inbound(
    node: Arc<swpt_relay::directory::NodeInfo>,
    peer: Arc<swpt_relay::directory::PeerInfo>,
    translator_config: TranslatorConfig,
    cfg: RelayConfig,
    broker: Arc<dyn BrokerAdapter>,
    tls_config: Arc<rustls::ServerConfig>,
) -> swpt_relay::error::Result<()> {
    let listener = tokio::net::TcpListener::bind(&cfg.listen_addr).await?;
    let acceptor = TlsAcceptor::from(tls_config);

    loop {
        let (tcp, peer_addr) = listener.accept().await?;
        info!(%peer_addr, "accepted inbound connection");
        let acceptor = acceptor.clone();
        let node = node.clone();
        let peer_info = peer.clone();
        let translator_config = translator_config.clone();
        let broker = broker.clone();
        let hb_send = cfg.hb_send_min;
        let hb_recv = cfg.hb_recv_desired;
        let max_network_delay = cfg.max_network_delay();

        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(tcp).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!(error = %e, %peer_addr, "TLS handshake failed");
                    return;
                }
            };

            let conn = match server::accept(
                tls_stream,
                ServerConfig {
                    hb_send,
                    hb_recv,
                    max_network_delay,
                    send_capacity: 64,
                    recv_capacity: 64,
                },
            )
            .await
            {
                Ok(conn) => conn,
                Err(e) => {
                    error!(error = %e, %peer_addr, "STOMP handshake failed");
                    return;
                }
            };

            if let Err(e) = ServerSide::new(node, peer_info, translator_config, broker, conn).run().await {
                error!(error = %e, %peer_addr, "inbound connection ended with an error");
            }
        });
    }
}
