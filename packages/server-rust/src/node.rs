//! Assembly of one cluster node: listener, peer links, HA monitor, and the
//! transaction log, started and stopped in a fixed order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mqcluster_core::{ClockSource, StoreSessionUid};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cluster::connection::{PeerLink, PeerRegistry, PeerSender};
use crate::cluster::discovery::PortMapper;
use crate::cluster::ha_monitor::HaMonitor;
use crate::cluster::handover::{HandoverCoordinator, HandoverParticipant};
use crate::cluster::integration::TakeoverIntegrator;
use crate::cluster::listener::{AcceptCallback, ClusterListener, ListenerHandle};
use crate::cluster::protocol::ProtocolHandler;
use crate::cluster::transport::{build_transport, ClusterStream, TransportFactory};
use crate::cluster::types::{BrokerAddress, BrokerState, ClusteredBroker};
use crate::config::ClusterConfig;
use crate::context::BrokerContext;
use crate::error::ClusterError;
use crate::store::{ConfigChangeStore, HaStore};
use crate::txnlog::TxnLog;

/// External collaborators a node is built from.
pub struct NodeServices {
    pub clock: Arc<dyn ClockSource>,
    pub store: Arc<dyn HaStore>,
    pub config_store: Arc<dyn ConfigChangeStore>,
    pub integrator: Arc<dyn TakeoverIntegrator>,
    pub port_mapper: Arc<dyn PortMapper>,
}

/// A running cluster node.
pub struct ClusterNode {
    ctx: Arc<BrokerContext>,
    registry: Arc<PeerRegistry>,
    transport: Arc<dyn TransportFactory>,
    handler: Arc<ProtocolHandler>,
    monitor: Arc<HaMonitor>,
    coordinator: HandoverCoordinator,
    txnlog: Arc<TxnLog>,
    store_session: StoreSessionUid,
    listener: ListenerHandle,
    accept_task: JoinHandle<()>,
    monitor_task: JoinHandle<()>,
}

impl ClusterNode {
    /// Opens the transaction log, binds the listener, registers this broker
    /// in the shared store, links to every registered peer, and starts the
    /// HA monitor.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, an unreadable transaction log, a bind
    /// failure, or a store error while registering.
    pub async fn start(config: ClusterConfig, services: NodeServices) -> anyhow::Result<Self> {
        config.validate()?;

        let txnlog = Arc::new(TxnLog::open(&config.txnlog, Arc::clone(&services.clock))?);
        let unresolved = txnlog.unresolved()?;
        if !unresolved.is_empty() {
            warn!(
                "{} prepared transaction(s) in {} have no outcome",
                unresolved.len(),
                txnlog.path().display()
            );
        }

        let transport = build_transport(&config)?;
        let (accept_tx, accept_rx) = mpsc::unbounded_channel::<(ClusterStream, SocketAddr)>();
        let on_accept: AcceptCallback = Arc::new(move |stream, peer| {
            if accept_tx.send((stream, peer)).is_err() {
                debug!("dropping inbound link from {peer}: node is stopping");
            }
        });
        let listener = ClusterListener::start(
            &config,
            Arc::clone(&transport),
            services.port_mapper,
            on_accept,
        )
        .await?;

        let registry = Arc::new(PeerRegistry::new(
            config.outbound_channel_capacity,
            config.send_timeout(),
        ));
        let peers: Arc<dyn PeerSender> = registry.clone();
        let ctx = BrokerContext::new(
            config,
            listener.local_port(),
            services.clock,
            services.store,
            services.config_store,
            peers,
        );

        let store_session = ctx.uids.store_session();
        ctx.store
            .register_broker(&ctx.local, Some(store_session), ctx.now())
            .await?;
        let master = ctx.config_store.master().await?;
        {
            let guard = ctx.brokers.lock();
            let mut entry = ClusteredBroker::new(ctx.local.clone(), BrokerState::Operating);
            entry.is_up = true;
            entry.store_session = Some(store_session);
            ctx.brokers.add_broker(&guard, entry);
            if master.is_some() {
                ctx.brokers.set_master(&guard, master);
            }
        }

        let participant = Arc::new(HandoverParticipant::new(Arc::clone(&ctx)));
        let monitor = Arc::new(HaMonitor::new(Arc::clone(&ctx), services.integrator));
        let handler = Arc::new(ProtocolHandler::new(
            Arc::clone(&ctx),
            participant,
            Arc::clone(&monitor),
        ));

        let accept_task = tokio::spawn(accept_links(
            accept_rx,
            Arc::clone(&ctx),
            Arc::clone(&registry),
            Arc::clone(&handler),
            store_session,
        ));
        let monitor_task = tokio::spawn(run_monitor(Arc::clone(&monitor), Arc::clone(&ctx)));

        let node = Self {
            coordinator: HandoverCoordinator::new(Arc::clone(&ctx)),
            ctx,
            registry,
            transport,
            handler,
            monitor,
            txnlog,
            store_session,
            listener,
            accept_task,
            monitor_task,
        };
        node.connect_registered_peers().await?;
        node.ctx.lifecycle.set_operating();
        info!(
            "Cluster node {} operating on port {}",
            node.ctx.local,
            node.listener.local_port()
        );
        Ok(node)
    }

    #[must_use]
    pub fn context(&self) -> &Arc<BrokerContext> {
        &self.ctx
    }

    #[must_use]
    pub fn local_port(&self) -> u16 {
        self.listener.local_port()
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<HaMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn txnlog(&self) -> &Arc<TxnLog> {
        &self.txnlog
    }

    /// Opens a link to `peer` on a background task.
    pub fn connect(&self, peer: BrokerAddress) {
        let link = PeerLink::new(
            Arc::clone(&self.registry),
            self.handler.clone(),
            ProtocolHandler::link_init(&self.ctx, Some(self.store_session)),
        )
        .with_handshake_timeout(self.ctx.config.handshake_timeout());
        let transport = Arc::clone(&self.transport);
        tokio::spawn(async move {
            if let Err(e) = link.connect(transport.as_ref(), &peer).await {
                warn!("Cluster link to {peer} failed: {e}");
            }
        });
    }

    /// Moves the master role to `new_master`. Only valid on the master.
    ///
    /// # Errors
    ///
    /// See [`HandoverCoordinator::handover`].
    pub async fn handover(&self, new_master: &BrokerAddress) -> Result<(), ClusterError> {
        self.coordinator.handover(new_master).await
    }

    async fn connect_registered_peers(&self) -> Result<(), ClusterError> {
        for record in self.ctx.store.all_brokers().await? {
            if record.broker_id() == self.ctx.broker_id() || record.state.is_shutdown() {
                continue;
            }
            self.connect(record.address);
        }
        Ok(())
    }

    /// Stops accepting links, waits up to `drain_timeout` for running
    /// takeovers and handovers, marks this broker cleanly shut down, and
    /// says goodbye to every peer.
    pub async fn shutdown(mut self, drain_timeout: Duration) {
        let lifecycle = Arc::clone(&self.ctx.lifecycle);
        lifecycle.begin_shutdown();
        self.listener.shutdown().await;
        self.accept_task.abort();

        if !lifecycle.wait_for_drain(drain_timeout).await {
            warn!(
                "{} cluster operation(s) still running after {:?}",
                lifecycle.in_flight(),
                drain_timeout
            );
        }
        if let Err(e) = self
            .ctx
            .store
            .update_state(self.ctx.broker_id(), BrokerState::ShutdownComplete)
            .await
        {
            warn!("Failed to record clean shutdown of {}: {e}", self.ctx.local);
        }
        self.registry.say_goodbye(&self.ctx.local);
        if let Err(e) = self.monitor_task.await {
            warn!("HA monitor task ended abnormally: {e}");
        }
        info!("Cluster node {} stopped", self.ctx.local);
    }
}

async fn accept_links(
    mut accept_rx: mpsc::UnboundedReceiver<(ClusterStream, SocketAddr)>,
    ctx: Arc<BrokerContext>,
    registry: Arc<PeerRegistry>,
    handler: Arc<ProtocolHandler>,
    store_session: StoreSessionUid,
) {
    while let Some((stream, remote)) = accept_rx.recv().await {
        let link = PeerLink::new(
            Arc::clone(&registry),
            handler.clone(),
            ProtocolHandler::link_init(&ctx, Some(store_session)),
        )
        .with_handshake_timeout(ctx.config.handshake_timeout());
        tokio::spawn(async move {
            if let Err(e) = link.run(stream).await {
                warn!("Inbound cluster link from {remote} failed: {e}");
            }
        });
    }
}

/// Runs the monitor until shutdown. A monitor failure means this broker can
/// no longer prove it is alive, so it shuts the node down.
async fn run_monitor(monitor: Arc<HaMonitor>, ctx: Arc<BrokerContext>) {
    if let Err(e) = monitor.run(ctx.lifecycle.subscribe()).await {
        error!("HA monitor failed: {e}; shutting down {}", ctx.local);
        ctx.lifecycle.begin_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use mqcluster_core::SystemClock;

    use super::*;
    use crate::cluster::discovery::InMemoryPortMapper;
    use crate::cluster::integration::MemoryIntegrator;
    use crate::store::{MemoryConfigChangeStore, MemoryHaStore};

    fn config(broker_id: &str, dir: &std::path::Path) -> ClusterConfig {
        let mut config = ClusterConfig {
            broker_id: broker_id.to_string(),
            host: "127.0.0.1".to_string(),
            ..ClusterConfig::default()
        };
        config.txnlog.dir = dir.join(broker_id);
        config.txnlog.sync = false;
        config
    }

    fn services(
        store: &Arc<MemoryHaStore>,
        config_store: &Arc<MemoryConfigChangeStore>,
    ) -> NodeServices {
        NodeServices {
            clock: Arc::new(SystemClock),
            store: store.clone(),
            config_store: config_store.clone(),
            integrator: Arc::new(MemoryIntegrator::new()),
            port_mapper: Arc::new(InMemoryPortMapper::new()),
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn nodes_link_through_the_shared_store_and_part_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryHaStore::new());
        let config_store = Arc::new(MemoryConfigChangeStore::with_master("b1"));

        let b1 = ClusterNode::start(config("b1", dir.path()), services(&store, &config_store))
            .await
            .unwrap();
        let b2 = ClusterNode::start(config("b2", dir.path()), services(&store, &config_store))
            .await
            .unwrap();

        let b2_local = b2.context().local.clone();
        let b1_ctx = Arc::clone(b1.context());
        let b2_ctx = Arc::clone(b2.context());
        wait_until(|| b1_ctx.active_peers().contains(&b2_local)).await;
        wait_until(|| b2_ctx.active_peers().len() == 1).await;
        assert_eq!(b2_ctx.brokers.master().as_deref(), Some("b1"));

        b2.shutdown(Duration::from_secs(1)).await;
        wait_until(|| b1_ctx.active_peers().is_empty()).await;
        assert!(!b1.monitor().is_in_doubt("b2"));
        let record = store.broker_record("b2").await.unwrap().unwrap();
        assert_eq!(record.state, BrokerState::ShutdownComplete);

        b1.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn invalid_config_is_refused_before_binding() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryHaStore::new());
        let config_store = Arc::new(MemoryConfigChangeStore::new());
        let result =
            ClusterNode::start(config("", dir.path()), services(&store, &config_store)).await;
        assert!(result.is_err());
        assert!(store.all_brokers().await.unwrap().is_empty());
    }
}
