//! Peer links: one task per inter-broker stream, a registry of live links,
//! and the [`PeerSender`] seam used by every protocol that talks to peers.
//!
//! Each link has a bounded outbound channel for backpressure. The link task
//! owns the framed stream and multiplexes outbound packets with inbound
//! frames on a single `select!` loop.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use mqcluster_core::{ClusterPacket, PacketError};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use super::messages::{notification, GoodbyePayload, LinkInitPayload, PacketType};
use super::transport::{ClusterStream, TransportFactory};
use super::types::BrokerAddress;

/// Packet queued for a link's writer.
#[derive(Debug)]
pub enum OutboundPacket {
    Packet(ClusterPacket),
    /// Flush what is queued, then close the link.
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("outbound queue stayed full until the send timeout")]
    Timeout,
    #[error("link closed")]
    Disconnected,
    #[error("outbound queue full")]
    Full,
    #[error("no live link to that broker incarnation")]
    UnknownPeer,
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("link closed before LINK_INIT")]
    ClosedBeforeInit,
    #[error("first packet was type {0}, expected LINK_INIT")]
    NotLinkInit(u16),
    #[error("no LINK_INIT within {0:?}")]
    HandshakeTimeout(Duration),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// PeerHandle / PeerRegistry
// ---------------------------------------------------------------------------

/// Sending half of one live link.
#[derive(Debug)]
pub struct PeerHandle {
    pub address: BrokerAddress,
    pub tx: mpsc::Sender<OutboundPacket>,
    pub connected_at: Instant,
    /// Whether the peer runs with HA enabled.
    pub ha: bool,
}

impl PeerHandle {
    #[must_use]
    pub fn try_send(&self, packet: OutboundPacket) -> bool {
        self.tx.try_send(packet).is_ok()
    }

    /// # Errors
    ///
    /// [`SendError::Timeout`] if the queue stays full for `timeout`,
    /// [`SendError::Disconnected`] if the link task has exited.
    pub async fn send_timeout(
        &self,
        packet: OutboundPacket,
        timeout: Duration,
    ) -> Result<(), SendError> {
        match tokio::time::timeout(timeout, self.tx.send(packet)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendError::Disconnected),
            Err(_) => Err(SendError::Timeout),
        }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Live links keyed by broker id. A newer link for the same broker replaces
/// the older one, whose task then drains and exits.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: DashMap<String, Arc<PeerHandle>>,
    capacity: usize,
    send_timeout: Duration,
}

impl PeerRegistry {
    #[must_use]
    pub fn new(capacity: usize, send_timeout: Duration) -> Self {
        Self {
            peers: DashMap::new(),
            capacity: capacity.max(1),
            send_timeout,
        }
    }

    pub fn register(
        &self,
        address: BrokerAddress,
        ha: bool,
    ) -> (Arc<PeerHandle>, mpsc::Receiver<OutboundPacket>) {
        let (tx, rx) = mpsc::channel(self.capacity);
        let handle = Arc::new(PeerHandle {
            address: address.clone(),
            tx,
            connected_at: Instant::now(),
            ha,
        });
        if let Some(old) = self
            .peers
            .insert(address.broker_id().to_string(), Arc::clone(&handle))
        {
            debug!("link to {} replaced by a newer link", old.address);
        }
        (handle, rx)
    }

    pub fn remove(&self, broker_id: &str) -> Option<Arc<PeerHandle>> {
        self.peers.remove(broker_id).map(|(_, h)| h)
    }

    /// Removes the entry only if it is still `handle`.
    pub fn remove_if_same(&self, handle: &Arc<PeerHandle>) -> bool {
        self.peers
            .remove_if(handle.address.broker_id(), |_, current| {
                Arc::ptr_eq(current, handle)
            })
            .is_some()
    }

    #[must_use]
    pub fn get(&self, broker_id: &str) -> Option<Arc<PeerHandle>> {
        self.peers.get(broker_id).map(|r| Arc::clone(r.value()))
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn peers(&self) -> Vec<Arc<PeerHandle>> {
        self.peers.iter().map(|e| Arc::clone(e.value())).collect()
    }

    /// Queues GOODBYE and a close on every link, then forgets them all.
    pub fn say_goodbye(&self, local: &BrokerAddress) {
        let mut goodbye = notification(PacketType::Goodbye);
        if let Err(e) = goodbye.set_payload_value(&GoodbyePayload {
            address: local.clone(),
        }) {
            warn!("failed to encode GOODBYE: {e}");
        }
        for handle in self.drain_all() {
            let _ = handle.try_send(OutboundPacket::Packet(goodbye.clone()));
            let _ = handle.try_send(OutboundPacket::Close);
        }
    }

    pub fn drain_all(&self) -> Vec<Arc<PeerHandle>> {
        let keys: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|k| self.peers.remove(&k).map(|(_, h)| h))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// PeerSender
// ---------------------------------------------------------------------------

/// Delivers packets to specific peer incarnations.
///
/// Used as `Arc<dyn PeerSender>`.
#[async_trait]
pub trait PeerSender: Send + Sync {
    /// # Errors
    ///
    /// [`SendError::UnknownPeer`] when no link to that exact incarnation
    /// exists, or the link's own send failure.
    async fn send(&self, to: &BrokerAddress, packet: ClusterPacket) -> Result<(), SendError>;

    fn connected_peers(&self) -> Vec<BrokerAddress>;
}

#[async_trait]
impl PeerSender for PeerRegistry {
    async fn send(&self, to: &BrokerAddress, packet: ClusterPacket) -> Result<(), SendError> {
        let handle = self
            .get(to.broker_id())
            .filter(|h| h.address == *to)
            .ok_or(SendError::UnknownPeer)?;
        handle
            .send_timeout(OutboundPacket::Packet(packet), self.send_timeout)
            .await
    }

    fn connected_peers(&self) -> Vec<BrokerAddress> {
        self.peers
            .iter()
            .filter(|e| e.value().is_connected())
            .map(|e| e.value().address.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Link task
// ---------------------------------------------------------------------------

/// Receives link lifecycle events and inbound packets.
///
/// Used as `Arc<dyn LinkHandler>`.
#[async_trait]
pub trait LinkHandler: Send + Sync {
    async fn on_link_up(&self, peer: &LinkInitPayload);

    /// Every packet after `LINK_INIT` except `GOODBYE`.
    async fn on_packet(&self, from: &BrokerAddress, packet: ClusterPacket);

    /// The current link to `peer` ended; `goodbyed` when the peer said so.
    async fn on_link_down(&self, peer: &BrokerAddress, goodbyed: bool);
}

/// Drives one inter-broker stream until either side closes it.
/// Bound on connecting and on the `LINK_INIT` exchange unless overridden.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct PeerLink {
    registry: Arc<PeerRegistry>,
    handler: Arc<dyn LinkHandler>,
    local: LinkInitPayload,
    handshake_timeout: Duration,
}

impl PeerLink {
    #[must_use]
    pub fn new(
        registry: Arc<PeerRegistry>,
        handler: Arc<dyn LinkHandler>,
        local: LinkInitPayload,
    ) -> Self {
        Self {
            registry,
            handler,
            local,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    #[must_use]
    pub fn with_handshake_timeout(mut self, limit: Duration) -> Self {
        self.handshake_timeout = limit;
        self
    }

    /// Opens a link to `peer` and runs it to completion.
    ///
    /// # Errors
    ///
    /// Fails if the connection or the `LINK_INIT` exchange fails or does
    /// not finish within the handshake timeout.
    pub async fn connect(
        self,
        transport: &dyn TransportFactory,
        peer: &BrokerAddress,
    ) -> Result<(), LinkError> {
        let limit = self.handshake_timeout;
        let stream = tokio::time::timeout(limit, transport.connect(peer))
            .await
            .map_err(|_| LinkError::HandshakeTimeout(limit))??;
        self.run(stream).await
    }

    /// Exchanges `LINK_INIT`, then pumps packets both ways.
    ///
    /// # Errors
    ///
    /// Fails only during the `LINK_INIT` exchange, including when the peer
    /// stays silent past the handshake timeout. Errors after that end the
    /// link and are logged.
    pub async fn run(self, stream: ClusterStream) -> Result<(), LinkError> {
        let mut framed = Framed::new(stream, LengthDelimitedCodec::new());
        let limit = self.handshake_timeout;
        let peer_init = tokio::time::timeout(limit, self.exchange_init(&mut framed))
            .await
            .map_err(|_| LinkError::HandshakeTimeout(limit))??;
        let peer = peer_init.address.clone();
        let (handle, mut rx) = self.registry.register(peer.clone(), peer_init.ha);
        info!("cluster link up: {}", peer);
        self.handler.on_link_up(&peer_init).await;

        let mut goodbyed = false;
        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(OutboundPacket::Packet(pkt)) => {
                        let bytes = match pkt.to_bytes() {
                            Ok(b) => b,
                            Err(e) => {
                                warn!("dropping unencodable packet for {peer}: {e}");
                                continue;
                            }
                        };
                        if let Err(e) = framed.send(Bytes::from(bytes)).await {
                            warn!("write to {peer} failed: {e}");
                            break;
                        }
                    }
                    Some(OutboundPacket::Close) | None => break,
                },
                inbound = framed.next() => match inbound {
                    Some(Ok(frame)) => match ClusterPacket::from_bytes(&frame) {
                        Ok(pkt) if pkt.packet_type() == PacketType::Goodbye.as_u16() => {
                            goodbyed = true;
                            break;
                        }
                        Ok(pkt) => self.handler.on_packet(&peer, pkt).await,
                        Err(e) => warn!("malformed packet from {peer}: {e}"),
                    },
                    Some(Err(e)) => {
                        warn!("read from {peer} failed: {e}");
                        break;
                    }
                    None => break,
                },
            }
        }

        if self.registry.remove_if_same(&handle) {
            info!(
                "cluster link down: {} ({})",
                peer,
                if goodbyed { "goodbye" } else { "lost" }
            );
            self.handler.on_link_down(&peer, goodbyed).await;
        }
        Ok(())
    }

    async fn exchange_init(
        &self,
        framed: &mut Framed<ClusterStream, LengthDelimitedCodec>,
    ) -> Result<LinkInitPayload, LinkError> {
        let mut init = notification(PacketType::LinkInit);
        init.set_payload_value(&self.local)?;
        framed.send(Bytes::from(init.to_bytes()?)).await?;

        let first = framed.next().await.ok_or(LinkError::ClosedBeforeInit)??;
        let first = ClusterPacket::from_bytes(&first)?;
        if first.packet_type() != PacketType::LinkInit.as_u16() {
            return Err(LinkError::NotLinkInit(first.packet_type()));
        }
        Ok(first.payload_value()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mqcluster_core::BrokerSessionUid;
    use parking_lot::Mutex;

    fn addr(id: &str) -> BrokerAddress {
        BrokerAddress::new(id, "127.0.0.1", 7000, BrokerSessionUid(1))
    }

    fn init(id: &str) -> LinkInitPayload {
        LinkInitPayload {
            address: addr(id),
            ha: true,
            store_session: None,
            master: None,
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LinkHandler for Recorder {
        async fn on_link_up(&self, peer: &LinkInitPayload) {
            self.events.lock().push(format!("up {}", peer.address.broker_id()));
        }

        async fn on_packet(&self, from: &BrokerAddress, packet: ClusterPacket) {
            self.events
                .lock()
                .push(format!("packet {} {}", from.broker_id(), packet.packet_type()));
        }

        async fn on_link_down(&self, peer: &BrokerAddress, goodbyed: bool) {
            self.events
                .lock()
                .push(format!("down {} {goodbyed}", peer.broker_id()));
        }
    }

    #[test]
    fn newer_link_replaces_older_one() {
        let registry = PeerRegistry::new(4, Duration::from_secs(1));
        let (old, _rx1) = registry.register(addr("b2"), true);
        let (new, _rx2) = registry.register(addr("b2"), true);
        assert_eq!(registry.count(), 1);
        assert!(!registry.remove_if_same(&old));
        assert!(registry.remove_if_same(&new));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn send_requires_the_exact_incarnation() {
        let registry = PeerRegistry::new(1, Duration::from_millis(20));
        let (_handle, mut rx) = registry.register(addr("b2"), true);

        let stale = BrokerAddress::new("b2", "127.0.0.1", 7000, BrokerSessionUid(0));
        let pkt = notification(PacketType::Heartbeat);
        assert_eq!(
            registry.send(&stale, pkt.clone()).await,
            Err(SendError::UnknownPeer)
        );
        assert!(registry.send(&addr("b2"), pkt.clone()).await.is_ok());
        assert_eq!(
            registry.send(&addr("b2"), pkt).await,
            Err(SendError::Timeout)
        );
        assert!(matches!(rx.recv().await, Some(OutboundPacket::Packet(_))));
    }

    #[tokio::test]
    async fn links_exchange_init_packets_and_goodbye() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let reg_a = Arc::new(PeerRegistry::new(8, Duration::from_secs(1)));
        let reg_b = Arc::new(PeerRegistry::new(8, Duration::from_secs(1)));
        let rec_a = Arc::new(Recorder::default());
        let rec_b = Arc::new(Recorder::default());

        let link_a = PeerLink::new(Arc::clone(&reg_a), rec_a.clone(), init("b1"));
        let link_b = PeerLink::new(Arc::clone(&reg_b), rec_b.clone(), init("b2"));
        let task_a = tokio::spawn(link_a.run(Box::new(a)));
        let task_b = tokio::spawn(link_b.run(Box::new(b)));

        while reg_a.count() == 0 || reg_b.count() == 0 {
            tokio::task::yield_now().await;
        }
        reg_a
            .send(&addr("b2"), notification(PacketType::Heartbeat))
            .await
            .unwrap();
        reg_a.say_goodbye(&addr("b1"));

        task_a.await.unwrap().unwrap();
        task_b.await.unwrap().unwrap();

        let heartbeat = PacketType::Heartbeat.as_u16();
        assert_eq!(
            *rec_b.events.lock(),
            vec![
                "up b1".to_string(),
                format!("packet b1 {heartbeat}"),
                "down b1 true".to_string(),
            ]
        );
        // b1 removed the link itself while saying goodbye.
        assert_eq!(*rec_a.events.lock(), vec!["up b2".to_string()]);
        assert_eq!(reg_b.count(), 0);
    }

    #[tokio::test]
    async fn first_packet_must_be_link_init() {
        let (a, b) = tokio::io::duplex(4096);
        let registry = Arc::new(PeerRegistry::new(8, Duration::from_secs(1)));
        let link = PeerLink::new(registry, Arc::new(Recorder::default()), init("b1"));
        let task = tokio::spawn(link.run(Box::new(a)));

        let mut raw = Framed::new(b, LengthDelimitedCodec::new());
        let _their_init = raw.next().await.unwrap().unwrap();
        let bogus = notification(PacketType::Heartbeat).to_bytes().unwrap();
        raw.send(Bytes::from(bogus)).await.unwrap();

        assert!(matches!(
            task.await.unwrap(),
            Err(LinkError::NotLinkInit(t)) if t == PacketType::Heartbeat.as_u16()
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_fails_the_handshake() {
        let (a, _silent) = tokio::io::duplex(4096);
        let registry = Arc::new(PeerRegistry::new(8, Duration::from_secs(1)));
        let recorder = Arc::new(Recorder::default());
        let link = PeerLink::new(Arc::clone(&registry), recorder.clone(), init("b1"))
            .with_handshake_timeout(Duration::from_secs(3));

        let result = link.run(Box::new(a)).await;
        assert!(matches!(
            result,
            Err(LinkError::HandshakeTimeout(d)) if d == Duration::from_secs(3)
        ));
        assert_eq!(registry.count(), 0);
        assert!(recorder.events.lock().is_empty());
    }
}
