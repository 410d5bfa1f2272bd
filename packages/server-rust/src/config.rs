//! Configuration types for a cluster node.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Transport used by the cluster service listener and outbound links.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Tls,
}

impl TransportKind {
    /// Protocol name registered with the port mapper.
    #[must_use]
    pub fn protocol_name(self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Tls => "ssl",
        }
    }
}

/// Which in-flight transactions of a taken-over broker are rolled back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AutoRollback {
    /// Every unresolved transaction.
    All,
    /// Only transactions that never reached `PREPARED`.
    #[default]
    NotPrepared,
    /// Leave everything for an administrator.
    Never,
}

/// TLS certificate configuration.
///
/// No `Default` impl because certificate paths have no sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// PEM certificate chain.
    pub cert_path: PathBuf,
    /// PEM private key (PKCS#8 or RSA).
    pub key_path: PathBuf,
}

/// Transaction event log settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TxnLogConfig {
    pub dir: PathBuf,
    /// Call `sync_data` after every append.
    pub sync: bool,
}

impl Default for TxnLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("txnlog"),
            sync: true,
        }
    }
}

/// Configuration for one broker's cluster coordination core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterConfig {
    pub broker_id: String,
    /// Bind address for the cluster service.
    pub host: String,
    /// Port to listen on. 0 means OS-assigned.
    pub port: u16,
    pub transport: TransportKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    pub tcp_nodelay: bool,
    /// Name the listener registers with the port mapper.
    pub service_name: String,
    pub heartbeat_interval_ms: u64,
    pub monitor_interval_ms: u64,
    /// Consecutive stale monitor passes before a broker is taken over.
    pub max_monitor_count: u32,
    pub reply_timeout_ms: u64,
    pub ha_enabled: bool,
    pub auto_rollback: AutoRollback,
    /// Pause after a resource-exhaustion accept failure.
    pub accept_backoff_ms: u64,
    pub outbound_channel_capacity: usize,
    pub send_timeout_ms: u64,
    /// Bound on the transport upgrade and the `LINK_INIT` exchange of a new
    /// link.
    pub handshake_timeout_ms: u64,
    pub txnlog: TxnLogConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            broker_id: String::new(),
            host: "0.0.0.0".to_string(),
            port: 0,
            transport: TransportKind::Tcp,
            tls: None,
            tcp_nodelay: true,
            service_name: "cluster".to_string(),
            heartbeat_interval_ms: 10_000,
            monitor_interval_ms: 30_000,
            max_monitor_count: 3,
            reply_timeout_ms: 60_000,
            ha_enabled: true,
            auto_rollback: AutoRollback::NotPrepared,
            accept_backoff_ms: 1000,
            outbound_channel_capacity: 256,
            send_timeout_ms: 5000,
            handshake_timeout_ms: 10_000,
            txnlog: TxnLogConfig::default(),
        }
    }
}

impl ClusterConfig {
    #[must_use]
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    #[must_use]
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    #[must_use]
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    #[must_use]
    pub fn accept_backoff(&self) -> Duration {
        Duration::from_millis(self.accept_backoff_ms)
    }

    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    #[must_use]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// How long a heartbeat may stand still before its broker is in doubt.
    #[must_use]
    pub fn heartbeat_stale_after_ms(&self) -> u64 {
        self.heartbeat_interval_ms
            .saturating_mul(u64::from(self.max_monitor_count.max(1)))
    }

    /// Checks settings that have no usable fallback.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.broker_id.is_empty() {
            anyhow::bail!("brokerId must be set");
        }
        if self.transport == TransportKind::Tls && self.tls.is_none() {
            anyhow::bail!("transport tls requires a tls section with certPath and keyPath");
        }
        if self.max_monitor_count == 0 {
            anyhow::bail!("maxMonitorCount must be at least 1");
        }
        if self.handshake_timeout_ms == 0 {
            anyhow::bail!("handshakeTimeoutMs must be at least 1");
        }
        if self.outbound_channel_capacity == 0 {
            anyhow::bail!("outboundChannelCapacity must be at least 1");
        }
        Ok(())
    }
}
