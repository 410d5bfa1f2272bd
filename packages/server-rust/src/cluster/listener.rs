//! Cluster service listener.
//!
//! Binds the cluster port, registers it with the port mapper, and runs the
//! accept loop on its own task. Each accepted socket is upgraded by the
//! transport on a separate task and handed to the accept callback. An
//! upgrade that does not finish within the handshake timeout drops the
//! socket.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::discovery::{PortMapper, CLUSTER_SERVICE_TYPE};
use super::transport::{set_nodelay, ClusterStream, TransportFactory};
use crate::config::ClusterConfig;

/// Receives every upgraded inbound link.
pub type AcceptCallback = Arc<dyn Fn(ClusterStream, SocketAddr) + Send + Sync>;

const ENOMEM: i32 = 12;
const ENFILE: i32 = 23;
const EMFILE: i32 = 24;
#[cfg(target_os = "linux")]
const ENOBUFS: i32 = 105;
#[cfg(not(target_os = "linux"))]
const ENOBUFS: i32 = 55;

/// Accept failures caused by running out of descriptors or memory.
#[must_use]
pub fn is_resource_exhaustion(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::OutOfMemory
        || matches!(err.raw_os_error(), Some(ENOMEM | ENFILE | EMFILE | ENOBUFS))
}

pub struct ClusterListener;

impl ClusterListener {
    /// Binds, registers the bound port, and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns an error if the address can not be bound.
    pub async fn start(
        config: &ClusterConfig,
        transport: Arc<dyn TransportFactory>,
        port_mapper: Arc<dyn PortMapper>,
        on_accept: AcceptCallback,
    ) -> anyhow::Result<ListenerHandle> {
        let listener = transport.bind(&config.host, config.port).await?;
        let local = listener.local_addr()?;
        let protocol = transport.kind().protocol_name();
        info!(
            "Cluster listener ({protocol}) bound to {}:{}",
            config.host,
            local.port()
        );

        let mut metadata = BTreeMap::new();
        metadata.insert("hostname".to_string(), config.host.clone());
        metadata.insert("hostaddr".to_string(), local.ip().to_string());
        port_mapper.add_service(
            &config.service_name,
            protocol,
            CLUSTER_SERVICE_TYPE,
            local.port(),
            metadata,
        );
        info!(
            "Registered cluster service '{}' on port {}",
            config.service_name,
            local.port()
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stopping = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicBool::new(true));
        let accept_loop = AcceptLoop {
            listener,
            transport,
            on_accept,
            tcp_nodelay: config.tcp_nodelay,
            backoff: config.accept_backoff(),
            handshake_timeout: config.handshake_timeout(),
            stopping: Arc::clone(&stopping),
            running: Arc::clone(&running),
        };
        let task = tokio::spawn(accept_loop.run(shutdown_rx));

        Ok(ListenerHandle {
            port: local.port(),
            service_name: config.service_name.clone(),
            port_mapper,
            shutdown_tx,
            stopping,
            running,
            task: Some(task),
        })
    }
}

struct AcceptLoop {
    listener: TcpListener,
    transport: Arc<dyn TransportFactory>,
    on_accept: AcceptCallback,
    tcp_nodelay: bool,
    backoff: Duration,
    handshake_timeout: Duration,
    stopping: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl AcceptLoop {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, peer)) => {
                        if self.tcp_nodelay {
                            set_nodelay(&socket);
                        }
                        let transport = Arc::clone(&self.transport);
                        let on_accept = Arc::clone(&self.on_accept);
                        let limit = self.handshake_timeout;
                        tokio::spawn(async move {
                            match tokio::time::timeout(limit, transport.accept(socket)).await {
                                Ok(Ok(stream)) => on_accept(stream, peer),
                                Ok(Err(e)) => {
                                    warn!("Cluster link handshake with {peer} failed: {e}");
                                }
                                Err(_) => warn!(
                                    "Cluster link handshake with {peer} timed out after {limit:?}"
                                ),
                            }
                        });
                    }
                    Err(_) if self.stopping.load(Ordering::Acquire) => break,
                    Err(e) if is_resource_exhaustion(&e) => {
                        warn!(
                            "Cluster accept ran out of resources: {e}; retrying in {:?}",
                            self.backoff
                        );
                        tokio::time::sleep(self.backoff).await;
                    }
                    Err(e) => warn!("Cluster accept failed: {e}"),
                },
            }
        }
        self.running.store(false, Ordering::Release);
        debug!("Cluster accept loop exited");
    }
}

/// Running listener. Dropping it without [`shutdown`](Self::shutdown)
/// leaves the accept task running until the runtime stops.
pub struct ListenerHandle {
    port: u16,
    service_name: String,
    port_mapper: Arc<dyn PortMapper>,
    shutdown_tx: watch::Sender<bool>,
    stopping: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops accepting, deregisters the service, and waits for the loop.
    pub async fn shutdown(&mut self) {
        self.stopping.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(true);
        self.port_mapper.remove_service(&self.service_name);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Cluster accept task ended abnormally: {e}");
            }
        }
        info!("Cluster listener on port {} stopped", self.port);
    }
}
