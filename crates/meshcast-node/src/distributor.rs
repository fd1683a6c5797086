//! The distributor: the coordinating node of a Meshcast overlay.
//!
//! Each accepted connection runs one session task:
//!
//! ```text
//! AnnouncePort(port)          → register ip:port → AssignedIdentity
//! SetCollectorAddress(addr)   → register addr    → SetLocalIdentity
//!        │
//!        ▼
//! join topology: newcomer ← UpdateNeighbours{add: everyone else}
//!                everyone ← UpdateNeighbours{add: newcomer}
//!        │
//!        ▼
//! AcknowledgeNeighbours(diff) → fold into the reporter's view   (repeat)
//!        │
//!        ▼ link closed or protocol violation
//! leave topology: everyone ← UpdateNeighbours{remove: departed}
//! ```
//!
//! Mesh candidates are resolved from the folded views whenever a block is
//! pushed, so they always reflect the latest acknowledgements.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use meshcast_protocols::{
    AcknowledgeDiff, ChannelRef, Connection, ConnectionGroup, ConnectionId, Identity, IdentityRegistry, IdentitySet,
    Inbox, MemoryListener, Message, PeerLink,
};
use meshcast_topology::{find_meshes, NeighbourViews, NodeGroup};
use meshcast_transfer::{BlockHeader, DeliveryReport, DeliveryTracker};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::lock;

/// Coordinates forwarders and pushes blocks to the best mesh.
#[derive(Clone)]
pub struct Distributor {
    inner: Arc<Inner>,
}

struct Inner {
    identity: Identity,
    config: NodeConfig,
    registry: IdentityRegistry,
    connections: ConnectionGroup,
    forwarders: Mutex<BTreeMap<Identity, ChannelRef>>,
    views: Mutex<NeighbourViews<Identity>>,
    next_sequence: AtomicU64,
}

impl Distributor {
    /// Create a distributor reachable at `address`.
    ///
    /// Its own identity is reserved so no peer can be issued the same token.
    pub fn new(address: SocketAddr, config: NodeConfig) -> Self {
        let identity = Identity::generate(address);
        let registry = IdentityRegistry::new();
        registry.blacklist(&identity);
        info!(identity = %identity, "Distributor starting");

        Self {
            inner: Arc::new(Inner {
                identity,
                config,
                registry,
                connections: ConnectionGroup::new(),
                forwarders: Mutex::new(BTreeMap::new()),
                views: Mutex::new(NeighbourViews::new()),
                next_sequence: AtomicU64::new(0),
            }),
        }
    }

    pub fn identity(&self) -> Identity {
        self.inner.identity
    }

    /// Handle one incoming connection on its own task.
    pub fn accept(&self, connection: Connection) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_session(connection).await })
    }

    /// Accept connections from `listener` until it closes.
    pub fn serve(&self, mut listener: MemoryListener) -> JoinHandle<()> {
        let distributor = self.clone();
        tokio::spawn(async move {
            info!(address = %listener.local_addr(), "Distributor listening");
            while let Some(connection) = listener.accept().await {
                if distributor.inner.connections.is_closed() {
                    connection.channel.close();
                    break;
                }
                distributor.accept(connection);
            }
        })
    }

    /// Identities of the forwarders currently in the topology.
    pub fn forwarders(&self) -> Vec<Identity> {
        lock(&self.inner.forwarders).keys().copied().collect()
    }

    /// Mesh candidates around this distributor, largest first.
    pub fn meshes(&self) -> Vec<NodeGroup<Identity>> {
        self.inner.meshes()
    }

    /// Push a block to the top-ranked mesh and wait for every send to
    /// resolve.
    ///
    /// The payload is split into one chunk per mesh member; member `i` (in
    /// identity order) receives chunk `i` and relays it to the others.
    pub async fn push_block(&self, payload: Bytes, priority: u8) -> Result<DeliveryReport<Identity>> {
        let mesh = self.meshes().into_iter().next().ok_or(NodeError::NoMesh)?;
        let links: Vec<PeerLink> = {
            let forwarders = lock(&self.inner.forwarders);
            mesh.iter()
                .filter_map(|identity| {
                    forwarders.get(identity).map(|channel| PeerLink {
                        identity: *identity,
                        channel: Arc::clone(channel),
                    })
                })
                .collect()
        };
        if links.is_empty() {
            return Err(NodeError::NoMesh);
        }

        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        let block = BlockHeader::new(
            sequence,
            priority,
            self.inner.config.block_ttl,
            &payload,
            links.len() as u32,
        )?;
        info!(
            sequence,
            hash = %block.short_hash(),
            size = block.size,
            members = links.len(),
            "Pushing block"
        );

        let (tx, rx) = oneshot::channel();
        let assignments = links.into_iter().zip(0u32..).collect();
        DeliveryTracker::push(
            &block,
            &payload,
            assignments,
            self.inner.config.delivery_config(),
            move |report| {
                let _ = tx.send(report);
            },
        )?;

        let report = rx.await.map_err(|_| NodeError::DeliveryAbandoned(sequence))?;
        if report.all_succeeded() {
            debug!(sequence, "Block pushed to every member");
        } else {
            warn!(sequence, failed = report.failed.len(), "Block push partially failed");
        }
        Ok(report)
    }

    /// Close every connection, including ones accepted from now on.
    pub fn shutdown(&self) {
        info!(identity = %self.inner.identity, "Distributor shutting down");
        self.inner.connections.close();
    }
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor")
            .field("identity", &self.inner.identity)
            .field("forwarders", &lock(&self.inner.forwarders).len())
            .finish()
    }
}

impl Inner {
    async fn run_session(&self, connection: Connection) {
        let Connection { channel, mut inbox } = connection;
        if !self.connections.add(Arc::clone(&channel)) {
            return;
        }

        let Some(identity) = self.handshake(&channel, &mut inbox).await else {
            self.connections.remove(channel.id());
            channel.close();
            return;
        };

        self.join(identity, &channel);

        while let Some(message) = inbox.recv().await {
            match message {
                Message::AcknowledgeNeighbours { diff } => self.acknowledge(identity, diff),
                Message::AnnouncePort { .. } | Message::SetCollectorAddress { .. } => {
                    warn!(peer = %identity, "Protocol violation: identity requested twice");
                    break;
                }
                other => {
                    warn!(peer = %identity, kind = other.kind(), "Protocol violation: unexpected message");
                    break;
                }
            }
        }

        self.leave(identity, channel.id());
        channel.close();
    }

    async fn handshake(&self, channel: &ChannelRef, inbox: &mut Inbox) -> Option<Identity> {
        let first = match tokio::time::timeout(self.config.handshake_timeout, inbox.recv()).await {
            Ok(first) => first?,
            Err(_) => {
                warn!(
                    connection = %channel.id(),
                    after = ?self.config.handshake_timeout,
                    "Protocol violation: no identity handshake"
                );
                return None;
            }
        };
        let (address, collector) = match first {
            Message::AnnouncePort { port } => (SocketAddr::new(channel.remote_addr().ip(), port), false),
            Message::SetCollectorAddress { address } => (address, true),
            other => {
                warn!(
                    connection = %channel.id(),
                    kind = other.kind(),
                    "Protocol violation: message before identity handshake"
                );
                return None;
            }
        };

        let identity = match self.registry.register(address) {
            Ok(identity) => identity,
            Err(e) => {
                warn!(connection = %channel.id(), error = %e, "Registration refused");
                return None;
            }
        };

        let reply = if collector {
            Message::SetLocalIdentity { identity }
        } else {
            Message::AssignedIdentity { identity }
        };
        if let Err(e) = channel.send(reply).await {
            debug!(peer = %identity, error = %e, "Peer left during handshake");
            self.registry.unregister(&identity);
            return None;
        }
        info!(peer = %identity, connection = %channel.id(), "Forwarder identified");
        Some(identity)
    }

    fn join(&self, newcomer: Identity, channel: &ChannelRef) {
        let mut forwarders = lock(&self.forwarders);
        let existing: IdentitySet = forwarders.keys().copied().collect();

        if !existing.is_empty() {
            notify(
                channel,
                Message::UpdateNeighbours {
                    add: existing,
                    remove: IdentitySet::new(),
                },
            );
        }
        let add: IdentitySet = [newcomer].into_iter().collect();
        for peer in forwarders.values() {
            notify(
                peer,
                Message::UpdateNeighbours {
                    add: add.clone(),
                    remove: IdentitySet::new(),
                },
            );
        }

        forwarders.insert(newcomer, Arc::clone(channel));
        debug!(peer = %newcomer, forwarders = forwarders.len(), "Forwarder joined topology");
    }

    fn leave(&self, departed: Identity, id: ConnectionId) {
        let mut forwarders = lock(&self.forwarders);
        forwarders.remove(&departed);

        let remove: IdentitySet = [departed].into_iter().collect();
        for peer in forwarders.values() {
            notify(
                peer,
                Message::UpdateNeighbours {
                    add: IdentitySet::new(),
                    remove: remove.clone(),
                },
            );
        }
        drop(forwarders);

        lock(&self.views).forget(&departed);
        self.registry.unregister(&departed);
        self.connections.remove(id);
        info!(peer = %departed, "Forwarder left topology");
    }

    fn acknowledge(&self, reporter: Identity, diff: AcknowledgeDiff) {
        trace!(
            peer = %reporter,
            added_outbound = diff.added_outbound().len(),
            removed_outbound = diff.removed_outbound().len(),
            added_inbound = diff.added_inbound().len(),
            removed_inbound = diff.removed_inbound().len(),
            "Neighbour acknowledgement"
        );
        lock(&self.views).apply(reporter, &diff.outbound, &diff.inbound);
    }

    fn meshes(&self) -> Vec<NodeGroup<Identity>> {
        let engaged: Vec<Identity> = lock(&self.forwarders).keys().copied().collect();
        let (outbound, inbound) = lock(&self.views).graphs(&self.identity, &engaged);
        let meshes = find_meshes(&self.identity, &outbound, &inbound);
        debug!(
            candidates = meshes.len(),
            largest = meshes.first().map_or(0, NodeGroup::len),
            "Resolved meshes"
        );
        meshes
    }
}

/// Queue a control message; failures only matter to the peer's own session.
fn notify(channel: &ChannelRef, message: Message) {
    let kind = message.kind();
    let id = channel.id();
    let send = channel.send(message);
    tokio::spawn(async move {
        if let Err(e) = send.await {
            debug!(connection = %id, kind, error = %e, "Control message not delivered");
        }
    });
}
