//! Runs one cluster node until ctrl-c.
//!
//! The node uses in-memory stores, so a set of nodes only forms a cluster
//! when they share a process.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, ValueEnum};
use mqcluster_core::SystemClock;
use mqcluster_server::cluster::discovery::InMemoryPortMapper;
use mqcluster_server::cluster::integration::MemoryIntegrator;
use mqcluster_server::config::{AutoRollback, ClusterConfig, TlsConfig, TransportKind};
use mqcluster_server::node::{ClusterNode, NodeServices};
use mqcluster_server::store::{MemoryConfigChangeStore, MemoryHaStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RollbackArg {
    All,
    NotPrepared,
    Never,
}

impl From<RollbackArg> for AutoRollback {
    fn from(arg: RollbackArg) -> Self {
        match arg {
            RollbackArg::All => Self::All,
            RollbackArg::NotPrepared => Self::NotPrepared,
            RollbackArg::Never => Self::Never,
        }
    }
}

/// Cluster coordination node.
#[derive(Parser, Debug)]
#[command(name = "mqcluster-node", version)]
struct NodeArgs {
    /// JSON file with a full `ClusterConfig`; flags below override it.
    #[arg(long, env = "MQCLUSTER_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "MQCLUSTER_BROKER_ID")]
    broker_id: Option<String>,

    #[arg(long, env = "MQCLUSTER_HOST")]
    host: Option<String>,

    #[arg(long, env = "MQCLUSTER_PORT")]
    port: Option<u16>,

    /// Certificate chain; enables TLS together with `--tls-key`.
    #[arg(long, env = "MQCLUSTER_TLS_CERT", requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    #[arg(long, env = "MQCLUSTER_TLS_KEY", requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    #[arg(long, env = "MQCLUSTER_HA")]
    ha: Option<bool>,

    #[arg(long, env = "MQCLUSTER_HEARTBEAT_MS")]
    heartbeat_ms: Option<u64>,

    #[arg(long, env = "MQCLUSTER_MONITOR_MS")]
    monitor_ms: Option<u64>,

    #[arg(long, env = "MQCLUSTER_AUTO_ROLLBACK", value_enum)]
    auto_rollback: Option<RollbackArg>,

    #[arg(long, env = "MQCLUSTER_TXNLOG_DIR")]
    txnlog_dir: Option<PathBuf>,

    #[arg(long, env = "MQCLUSTER_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Seconds to wait for running takeovers and handovers on shutdown.
    #[arg(long, env = "MQCLUSTER_DRAIN_SECS", default_value_t = 30)]
    drain_secs: u64,
}

impl NodeArgs {
    fn into_config(self) -> anyhow::Result<ClusterConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => ClusterConfig::default(),
        };
        if let Some(broker_id) = self.broker_id {
            config.broker_id = broker_id;
        }
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let (Some(cert_path), Some(key_path)) = (self.tls_cert, self.tls_key) {
            config.transport = TransportKind::Tls;
            config.tls = Some(TlsConfig {
                cert_path,
                key_path,
            });
        }
        if let Some(ha) = self.ha {
            config.ha_enabled = ha;
        }
        if let Some(ms) = self.heartbeat_ms {
            config.heartbeat_interval_ms = ms;
        }
        if let Some(ms) = self.monitor_ms {
            config.monitor_interval_ms = ms;
        }
        if let Some(rollback) = self.auto_rollback {
            config.auto_rollback = rollback.into();
        }
        if let Some(dir) = self.txnlog_dir {
            config.txnlog.dir = dir;
        }
        Ok(config)
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = NodeArgs::parse();
    init_tracing(args.log_format);
    let drain = Duration::from_secs(args.drain_secs);
    let config = args.into_config()?;

    let services = NodeServices {
        clock: Arc::new(SystemClock),
        store: Arc::new(MemoryHaStore::new()),
        config_store: Arc::new(MemoryConfigChangeStore::with_master(&config.broker_id)),
        integrator: Arc::new(MemoryIntegrator::new()),
        port_mapper: Arc::new(InMemoryPortMapper::new()),
    };
    let node = ClusterNode::start(config, services).await?;
    let mut stopped = node.context().lifecycle.subscribe();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("installing ctrl-c handler")?;
            info!("Received ctrl-c, shutting down");
        }
        _ = stopped.changed() => info!("Node is shutting down on its own"),
    }
    node.shutdown(drain).await;
    Ok(())
}
