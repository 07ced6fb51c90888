//! Process configuration, built the way `swedishembedded-sven`'s
//! `cli.rs` layers `clap` flags over environment variables: every
//! setting is a flag with an `env` fallback, so a container can be
//! configured without a command line at all.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Top-level CLI/environment configuration for the relay process.
#[derive(Parser, Debug, Clone)]
#[command(name = "swpt-relay", about = "STOMP/TLS relay bridging a local broker to settlement peer nodes", version)]
pub struct RelayConfig {
    /// Node/peer directory database URL. Only `file://` is supported.
    #[arg(long, env = "SWPT_DB_URL")]
    pub db_url: String,

    /// `node_id` of the single peer this process relays to.
    #[arg(long, env = "SWPT_PEER_NODE_ID")]
    pub peer_node_id: String,

    /// Path to this node's own TLS certificate (PEM), presented during
    /// the mutual handshake.
    #[arg(long, env = "SWPT_NODE_CERT")]
    pub node_cert: PathBuf,

    /// Path to this node's own TLS private key (PEM).
    #[arg(long, env = "SWPT_NODE_KEY")]
    pub node_key: PathBuf,

    /// TCP address to listen on for inbound (server-role) connections.
    #[arg(long, env = "SWPT_LISTEN_ADDR", default_value = "0.0.0.0:1234")]
    pub listen_addr: String,

    /// STOMP destination used when sending outbound messages.
    #[arg(long, env = "SWPT_SEND_DESTINATION", default_value = "/exchange/smp/out")]
    pub send_destination: String,

    /// Minimum heartbeat interval this process is willing to send, in
    /// milliseconds. 0 disables sending heartbeats.
    #[arg(long, env = "SWPT_HB_SEND_MIN", default_value_t = 3000)]
    pub hb_send_min: u64,

    /// Heartbeat interval this process asks its peer to send, in
    /// milliseconds. 0 means no heartbeat is required.
    #[arg(long, env = "SWPT_HB_RECV_DESIRED", default_value_t = 3000)]
    pub hb_recv_desired: u64,

    /// Extra slack added to the negotiated heartbeat interval before a
    /// silent connection is treated as dead.
    #[arg(long, env = "SWPT_MAX_NETWORK_DELAY_MS", default_value_t = 10_000)]
    pub max_network_delay_ms: u64,

    /// Worker thread count for the Tokio runtime. 0 picks the number of
    /// available CPUs.
    #[arg(long, env = "SWPT_WORKER_THREADS", default_value_t = 0)]
    pub worker_threads: usize,

    /// `tracing-subscriber` `EnvFilter` directive, e.g. `info` or
    /// `swpt_relay=debug,tokio=warn`.
    #[arg(long, env = "SWPT_LOG", default_value = "info")]
    pub log_filter: String,
}

impl RelayConfig {
    pub fn max_network_delay(&self) -> Duration {
        Duration::from_millis(self.max_network_delay_ms)
    }

    pub fn worker_threads(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get()
        } else {
            self.worker_threads
        }
    }
}
