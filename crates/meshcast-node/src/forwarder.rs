//! The forwarder: a peer that relays blocks within its mesh.
//!
//! A forwarder holds one upstream link to its distributor and any number of
//! peer links. Outbound peer links follow the distributor's
//! `UpdateNeighbours` instructions; inbound ones are accepted from peers
//! that announce themselves. Every peer link change is acknowledged
//! upstream on a fixed interval.
//!
//! Chunks pushed by the distributor are stored and relayed to every
//! outbound peer while their time-to-live allows; chunks relayed by peers
//! are stored and relayed on first sight only.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use meshcast_protocols::{
    AcknowledgeAccumulator, AcknowledgeDiff, AcknowledgeFlusher, ChannelRef, Connection, ConnectionEvent, Connector,
    Error as ProtocolError, Identity, InboundPeers, Inbox, MemoryListener, Message, PeerConnectionManager, PeerLink,
    SharedAccumulator,
};
use meshcast_transfer::{Assembly, BlockAssembler, BlockHeader, ChunkMessage, DeliveryTracker};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::error::Result;
use crate::lock;

/// How a forwarder tells the distributor where peers can reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advertise {
    /// Listening port; the distributor pairs it with the IP it sees.
    Port(u16),
    /// Full listening address, for peers behind a different interface.
    Address(SocketAddr),
}

/// A fully reassembled, verified block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedBlock {
    pub header: BlockHeader,
    pub payload: Bytes,
}

/// Receiving end for completed blocks.
pub type CompletedBlocks = mpsc::UnboundedReceiver<CompletedBlock>;

struct Inner {
    identity: Identity,
    config: NodeConfig,
    upstream: ChannelRef,
    manager: PeerConnectionManager,
    inbound: InboundPeers,
    accumulator: SharedAccumulator,
    flusher: AcknowledgeFlusher,
    assembler: Mutex<BlockAssembler>,
    completed: mpsc::UnboundedSender<CompletedBlock>,
}

/// A running forwarder. Dropping it shuts it down.
pub struct Forwarder {
    inner: Arc<Inner>,
    tasks: Vec<JoinHandle<()>>,
}

impl Forwarder {
    /// Connect to the distributor at `distributor` and obtain an identity.
    pub async fn join(
        connector: Arc<dyn Connector>,
        distributor: SocketAddr,
        advertise: Advertise,
        config: NodeConfig,
    ) -> Result<(Self, CompletedBlocks)> {
        let Connection {
            channel: upstream,
            inbox: mut upstream_inbox,
        } = connector.connect(distributor).await?;

        let identity = match request_identity(&upstream, &mut upstream_inbox, advertise).await {
            Ok(identity) => identity,
            Err(e) => {
                upstream.close();
                return Err(e.into());
            }
        };
        info!(identity = %identity, distributor = %distributor, "Joined distributor");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (completed_tx, completed_rx) = mpsc::unbounded_channel();
        let accumulator: SharedAccumulator = Arc::new(Mutex::new(AcknowledgeAccumulator::new()));

        let flusher = AcknowledgeFlusher::spawn(Arc::clone(&accumulator), Arc::clone(&upstream), config.ack_interval);
        let inner = Arc::new(Inner {
            identity,
            manager: PeerConnectionManager::new(identity, connector, config.reconnect_policy(), events_tx.clone()),
            inbound: InboundPeers::with_handshake_timeout(events_tx, config.handshake_timeout),
            accumulator,
            flusher,
            assembler: Mutex::new(BlockAssembler::new()),
            completed: completed_tx,
            upstream,
            config,
        });

        let tasks = vec![
            tokio::spawn(Arc::clone(&inner).route_events(events_rx)),
            tokio::spawn(Arc::clone(&inner).run_upstream(upstream_inbox)),
        ];

        Ok((
            Self { inner, tasks },
            completed_rx,
        ))
    }

    pub fn identity(&self) -> Identity {
        self.inner.identity
    }

    /// Handle one incoming peer link on its own task.
    pub fn accept(&self, connection: Connection) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(&self.inner).run_inbound(connection))
    }

    /// Accept peer links from `listener` until it closes.
    pub fn serve(&self, mut listener: MemoryListener) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            debug!(identity = %inner.identity, address = %listener.local_addr(), "Forwarder listening");
            while let Some(connection) = listener.accept().await {
                tokio::spawn(Arc::clone(&inner).run_inbound(connection));
            }
        })
    }

    /// Peers we hold an engaged outbound link to.
    pub fn outbound_peers(&self) -> Vec<Identity> {
        let mut peers: Vec<Identity> = self.inner.manager.engaged().into_iter().map(|link| link.identity).collect();
        peers.sort();
        peers
    }

    /// Peers holding an engaged link to us.
    pub fn inbound_peers(&self) -> Vec<Identity> {
        let mut peers = self.inner.inbound.identities();
        peers.sort();
        peers
    }

    /// True while acknowledgements are still being flushed upstream.
    pub fn is_acknowledging(&self) -> bool {
        !self.inner.flusher.is_stopped()
    }

    /// Changes recorded since the last flush was issued.
    pub fn pending_acknowledgement(&self) -> AcknowledgeDiff {
        lock(&self.inner.accumulator).pending().clone()
    }

    /// Close every link and stop all background work.
    pub fn shutdown(&self) {
        info!(identity = %self.inner.identity, "Forwarder shutting down");
        self.inner.flusher.stop();
        self.inner.manager.close_all();
        self.inner.inbound.close_all();
        self.inner.upstream.close();
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("identity", &self.inner.identity)
            .field("manager", &self.inner.manager)
            .finish()
    }
}

async fn request_identity(
    upstream: &ChannelRef,
    inbox: &mut Inbox,
    advertise: Advertise,
) -> std::result::Result<Identity, ProtocolError> {
    let request = match advertise {
        Advertise::Port(port) => Message::AnnouncePort { port },
        Advertise::Address(address) => Message::SetCollectorAddress { address },
    };
    upstream.send(request).await?;

    match (advertise, inbox.recv().await) {
        (Advertise::Port(_), Some(Message::AssignedIdentity { identity }))
        | (Advertise::Address(_), Some(Message::SetLocalIdentity { identity })) => Ok(identity),
        (_, Some(other)) => Err(ProtocolError::ProtocolViolation(format!(
            "expected identity assignment, got {}",
            other.kind()
        ))),
        (_, None) => Err(ProtocolError::ChannelClosed(upstream.id())),
    }
}

impl Inner {
    async fn route_events(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        while let Some(event) = events.recv().await {
            trace!(identity = %self.identity, event = ?event, "Connection event");
            lock(&self.accumulator).record(&event);
        }
    }

    async fn run_upstream(self: Arc<Self>, mut inbox: Inbox) {
        while let Some(message) = inbox.recv().await {
            match message {
                Message::UpdateNeighbours { add, remove } => {
                    debug!(
                        identity = %self.identity,
                        add = add.len(),
                        remove = remove.len(),
                        "Topology update"
                    );
                    self.manager.reconcile(&add, &remove);
                }
                Message::ChunkPush { chunk } => self.receive(chunk, None),
                Message::AssignedIdentity { .. } | Message::SetLocalIdentity { .. } => {
                    warn!(identity = %self.identity, "Protocol violation: identity assigned twice");
                    break;
                }
                other => {
                    warn!(identity = %self.identity, kind = other.kind(), "Protocol violation: unexpected upstream message");
                    break;
                }
            }
        }

        info!(identity = %self.identity, "Distributor link closed");
        self.flusher.stop();
        self.upstream.close();
        self.manager.close_all();
        self.inbound.close_all();
    }

    async fn run_inbound(self: Arc<Self>, connection: Connection) {
        let mut peer = match self.inbound.accept(connection).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "Rejected peer link");
                return;
            }
        };

        while let Some(message) = peer.inbox.recv().await {
            match message {
                Message::ChunkForward { chunk } => self.receive(chunk, Some(peer.identity)),
                other => {
                    warn!(peer = %peer.identity, kind = other.kind(), "Protocol violation on peer link");
                    break;
                }
            }
        }

        peer.channel.close();
        self.inbound.closed(peer.channel.id());
    }

    /// Store a chunk and relay it if it is new and may travel further.
    fn receive(&self, chunk: ChunkMessage, source: Option<Identity>) {
        let assembly = match lock(&self.assembler).insert(&chunk) {
            Ok(assembly) => assembly,
            Err(e) => {
                warn!(identity = %self.identity, error = %e, "Dropping invalid chunk");
                return;
            }
        };
        if !assembly.is_new() {
            trace!(
                identity = %self.identity,
                sequence = chunk.block.sequence,
                index = chunk.chunk.chunk_index,
                "Duplicate chunk"
            );
            return;
        }

        if let Assembly::Complete { block, payload } = assembly {
            info!(identity = %self.identity, sequence = block.sequence, hash = %block.short_hash(), "Block complete");
            let _ = self.completed.send(CompletedBlock { header: block, payload });
        }

        if chunk.block.time_to_live > 0 {
            self.relay(chunk, source);
        }
    }

    fn relay(&self, chunk: ChunkMessage, source: Option<Identity>) {
        let targets: Vec<PeerLink> = self
            .manager
            .engaged()
            .into_iter()
            .filter(|link| Some(link.identity) != source)
            .collect();
        if targets.is_empty() {
            return;
        }

        let relayed = ChunkMessage {
            block: chunk.block.relayed(),
            ..chunk
        };
        let sequence = relayed.block.sequence;
        let index = relayed.chunk.chunk_index;
        let result = DeliveryTracker::forward(&relayed, targets, self.config.delivery_config(), move |report| {
            if !report.all_succeeded() {
                debug!(sequence, index, failed = report.failed.len(), "Relay partially failed");
            }
        });
        if let Err(e) = result {
            warn!(identity = %self.identity, error = %e, "Relay not dispatched");
        }
    }
}
