//! Peer connection management.
//!
//! The [`PeerConnectionManager`] keeps the outbound links of one forwarder
//! in line with what the distributor asks for. Each peer is absent,
//! pending (an attempt is running) or engaged (link open and announced).
//!
//! ```text
//!            reconcile(add)          connected + announced
//!   Absent ─────────────────▶ Pending ─────────────────────▶ Engaged
//!     ▲                          │                             │
//!     │  attempts exhausted      │ reconcile(remove)           │ remove / link lost
//!     └──────────────────────────┴─────────────────────────────┘
//! ```
//!
//! Only engaged peers produce `Connected`/`Disconnected` events. Cancelling
//! a pending attempt is silent; giving up on one produces
//! `ConnectionRefused`.
//!
//! [`InboundPeers`] handles the accepting side: a link is engaged once the
//! remote has announced itself with `SetForwarderIdentity`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::FutureExt;
use meshcast_transfer::{ChunkKind, ChunkMessage, ChunkTarget, SendFuture};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::acknowledge::{ConnectionEvent, Direction};
use crate::channel::{ChannelRef, Connection, ConnectionId, Connector, Inbox};
use crate::error::{Error, Result};
use crate::group::ConnectionGroup;
use crate::identity::{Identity, IdentitySet};
use crate::lock;
use crate::message::Message;

/// Sender half of the connection event stream.
pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// Retry policy for outbound connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Attempts before giving up (at least one is always made)
    pub max_attempts: u32,
    /// Delay after the first failure; doubles after each further failure
    pub initial_backoff: Duration,
    /// Upper bound on the delay
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
        }
    }
}

impl ReconnectPolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = backoff;
        self
    }

    /// Delay after `failures` consecutive failures.
    pub fn backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_backoff)
    }
}

/// Observable state of one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Pending,
    Engaged,
}

#[derive(Debug)]
enum PeerSlot {
    Pending { attempt: u64 },
    Engaged { channel: ChannelRef },
}

/// An engaged peer that chunks can be sent to.
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub identity: Identity,
    pub channel: ChannelRef,
}

impl ChunkTarget for PeerLink {
    type Key = Identity;

    fn key(&self) -> Identity {
        self.identity
    }

    fn send_chunk(&self, kind: ChunkKind, chunk: ChunkMessage) -> SendFuture {
        let message = match kind {
            ChunkKind::Push => Message::ChunkPush { chunk },
            ChunkKind::Forward => Message::ChunkForward { chunk },
        };
        self.channel
            .send(message)
            .map(|result| result.map_err(anyhow::Error::from))
            .boxed()
    }
}

struct Shared {
    local: Identity,
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    peers: Mutex<HashMap<Identity, PeerSlot>>,
    events: EventSender,
    next_attempt: AtomicU64,
}

/// Default bound on how long an accepted link may stay silent before
/// announcing itself.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// Callers hold their peer table lock, so events for one peer are emitted in
// the order their transitions happened.
fn emit(events: &EventSender, event: ConnectionEvent) {
    if events.send(event).is_err() {
        trace!("Connection event receiver dropped");
    }
}

impl Shared {
    fn emit(&self, event: ConnectionEvent) {
        emit(&self.events, event);
    }

    fn is_current(&self, identity: &Identity, attempt: u64) -> bool {
        matches!(
            lock(&self.peers).get(identity),
            Some(PeerSlot::Pending { attempt: a }) if *a == attempt
        )
    }

    fn refuse(&self, identity: &Identity, attempt: u64, reason: String) {
        let mut peers = lock(&self.peers);
        if !matches!(peers.get(identity), Some(PeerSlot::Pending { attempt: a }) if *a == attempt) {
            return;
        }
        peers.remove(identity);
        warn!(peer = %identity, reason = %reason, "Giving up on peer");
        self.emit(ConnectionEvent::ConnectionRefused {
            identity: *identity,
            reason,
        });
    }

    fn engage(&self, identity: &Identity, attempt: u64, channel: &ChannelRef) -> bool {
        let mut peers = lock(&self.peers);
        if !matches!(peers.get(identity), Some(PeerSlot::Pending { attempt: a }) if *a == attempt) {
            return false;
        }
        peers.insert(
            *identity,
            PeerSlot::Engaged {
                channel: Arc::clone(channel),
            },
        );
        self.emit(ConnectionEvent::Connected {
            identity: *identity,
            direction: Direction::Outbound,
        });
        true
    }

    fn lost(&self, identity: &Identity, id: ConnectionId) {
        let mut peers = lock(&self.peers);
        if !matches!(peers.get(identity), Some(PeerSlot::Engaged { channel }) if channel.id() == id) {
            return;
        }
        peers.remove(identity);
        info!(peer = %identity, "Outbound peer lost");
        self.emit(ConnectionEvent::Disconnected {
            identity: *identity,
            direction: Direction::Outbound,
        });
    }
}

/// Maintains the outbound peer links of one forwarder.
pub struct PeerConnectionManager {
    shared: Arc<Shared>,
}

impl PeerConnectionManager {
    pub fn new(
        local: Identity,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        events: EventSender,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                local,
                connector,
                policy,
                peers: Mutex::new(HashMap::new()),
                events,
                next_attempt: AtomicU64::new(0),
            }),
        }
    }

    pub fn local(&self) -> Identity {
        self.shared.local
    }

    /// Move towards the requested neighbour set. Idempotent.
    ///
    /// Removals are applied before additions. Adding a pending or engaged
    /// peer, removing an absent one, or adding ourselves does nothing.
    pub fn reconcile(&self, add: &IdentitySet, remove: &IdentitySet) {
        let mut peers = lock(&self.shared.peers);

        for identity in remove {
            match peers.remove(identity) {
                Some(PeerSlot::Pending { .. }) => {
                    debug!(peer = %identity, "Cancelled pending connection");
                }
                Some(PeerSlot::Engaged { channel }) => {
                    info!(peer = %identity, "Disconnecting peer");
                    channel.close();
                    self.shared.emit(ConnectionEvent::Disconnected {
                        identity: *identity,
                        direction: Direction::Outbound,
                    });
                }
                None => {}
            }
        }

        for identity in add {
            if *identity == self.shared.local || peers.contains_key(identity) {
                continue;
            }
            let attempt = self.shared.next_attempt.fetch_add(1, Ordering::Relaxed);
            peers.insert(*identity, PeerSlot::Pending { attempt });
            debug!(peer = %identity, "Connecting to peer");
            tokio::spawn(run_outbound(Arc::clone(&self.shared), *identity, attempt));
        }
    }

    pub fn state(&self, identity: &Identity) -> Option<PeerState> {
        lock(&self.shared.peers).get(identity).map(|slot| match slot {
            PeerSlot::Pending { .. } => PeerState::Pending,
            PeerSlot::Engaged { .. } => PeerState::Engaged,
        })
    }

    /// Snapshot of the engaged peers.
    pub fn engaged(&self) -> Vec<PeerLink> {
        lock(&self.shared.peers)
            .iter()
            .filter_map(|(identity, slot)| match slot {
                PeerSlot::Engaged { channel } => Some(PeerLink {
                    identity: *identity,
                    channel: Arc::clone(channel),
                }),
                PeerSlot::Pending { .. } => None,
            })
            .collect()
    }

    pub fn engaged_count(&self) -> usize {
        self.count(PeerState::Engaged)
    }

    pub fn pending_count(&self) -> usize {
        self.count(PeerState::Pending)
    }

    /// Cancel every attempt and close every link.
    pub fn close_all(&self) {
        let mut peers = lock(&self.shared.peers);
        for (identity, slot) in peers.drain() {
            if let PeerSlot::Engaged { channel } = slot {
                channel.close();
                self.shared.emit(ConnectionEvent::Disconnected {
                    identity,
                    direction: Direction::Outbound,
                });
            }
        }
    }

    fn count(&self, state: PeerState) -> usize {
        lock(&self.shared.peers)
            .values()
            .filter(|slot| match slot {
                PeerSlot::Pending { .. } => state == PeerState::Pending,
                PeerSlot::Engaged { .. } => state == PeerState::Engaged,
            })
            .count()
    }
}

impl std::fmt::Debug for PeerConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionManager")
            .field("local", &self.shared.local)
            .field("engaged", &self.engaged_count())
            .field("pending", &self.pending_count())
            .finish()
    }
}

async fn run_outbound(shared: Arc<Shared>, identity: Identity, attempt: u64) {
    let mut failures = 0;
    let connection = loop {
        if !shared.is_current(&identity, attempt) {
            trace!(peer = %identity, "Attempt superseded");
            return;
        }
        match shared.connector.connect(identity.address).await {
            Ok(connection) => break connection,
            Err(e) => {
                failures += 1;
                if failures >= shared.policy.max_attempts.max(1) {
                    shared.refuse(&identity, attempt, e.to_string());
                    return;
                }
                let delay = shared.policy.backoff(failures);
                debug!(peer = %identity, failures, ?delay, error = %e, "Connection attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }
    };

    let Connection { channel, mut inbox } = connection;
    let announce = Message::SetForwarderIdentity {
        identity: shared.local,
    };
    if let Err(e) = channel.send(announce).await {
        channel.close();
        shared.refuse(&identity, attempt, e.to_string());
        return;
    }
    if !shared.engage(&identity, attempt, &channel) {
        channel.close();
        return;
    }
    info!(peer = %identity, connection = %channel.id(), "Engaged outbound peer");

    // Nothing is expected back on an outbound link.
    while let Some(message) = inbox.recv().await {
        trace!(peer = %identity, kind = message.kind(), "Ignoring message on outbound link");
    }
    shared.lost(&identity, channel.id());
}

/// A peer that connected to us and announced itself.
#[derive(Debug)]
pub struct InboundPeer {
    pub identity: Identity,
    pub channel: ChannelRef,
    pub inbox: Inbox,
}

/// Tracks the inbound links of one forwarder.
#[derive(Debug)]
pub struct InboundPeers {
    group: ConnectionGroup,
    peers: Mutex<HashMap<ConnectionId, Identity>>,
    events: EventSender,
    handshake_timeout: Duration,
}

impl InboundPeers {
    pub fn new(events: EventSender) -> Self {
        Self::with_handshake_timeout(events, DEFAULT_HANDSHAKE_TIMEOUT)
    }

    /// Close links that have not announced themselves within `timeout`.
    pub fn with_handshake_timeout(events: EventSender, timeout: Duration) -> Self {
        Self {
            group: ConnectionGroup::new(),
            peers: Mutex::new(HashMap::new()),
            events,
            handshake_timeout: timeout,
        }
    }

    /// Wait for the remote to announce itself, then engage the link.
    ///
    /// Anything other than `SetForwarderIdentity` as the first message, or
    /// an identity already engaged on another inbound link, is a protocol
    /// violation; so is silence past the handshake timeout. The link is
    /// closed in every such case.
    pub async fn accept(&self, connection: Connection) -> Result<InboundPeer> {
        let Connection { channel, mut inbox } = connection;
        let first = match tokio::time::timeout(self.handshake_timeout, inbox.recv()).await {
            Ok(first) => first,
            Err(_) => {
                channel.close();
                return Err(Error::HandshakeTimeout {
                    connection: channel.id(),
                    after: self.handshake_timeout,
                });
            }
        };
        let identity = match first {
            Some(Message::SetForwarderIdentity { identity }) => identity,
            Some(other) => {
                channel.close();
                return Err(Error::ProtocolViolation(format!(
                    "expected set_forwarder_identity, got {}",
                    other.kind()
                )));
            }
            None => return Err(Error::ChannelClosed(channel.id())),
        };

        let mut peers = lock(&self.peers);
        if peers.values().any(|engaged| *engaged == identity) {
            drop(peers);
            channel.close();
            return Err(Error::ProtocolViolation(format!(
                "{identity} is already engaged on another inbound link"
            )));
        }
        if !self.group.add(Arc::clone(&channel)) {
            return Err(Error::ChannelClosed(channel.id()));
        }
        peers.insert(channel.id(), identity);
        info!(peer = %identity, connection = %channel.id(), "Engaged inbound peer");
        emit(
            &self.events,
            ConnectionEvent::Connected {
                identity,
                direction: Direction::Inbound,
            },
        );
        drop(peers);

        Ok(InboundPeer {
            identity,
            channel,
            inbox,
        })
    }

    /// Report that an accepted link has ended.
    pub fn closed(&self, id: ConnectionId) {
        let mut peers = lock(&self.peers);
        let Some(identity) = peers.remove(&id) else {
            return;
        };
        self.group.remove(id);
        info!(peer = %identity, "Inbound peer lost");
        emit(
            &self.events,
            ConnectionEvent::Disconnected {
                identity,
                direction: Direction::Inbound,
            },
        );
    }

    pub fn identities(&self) -> Vec<Identity> {
        lock(&self.peers).values().copied().collect()
    }

    /// Close every inbound link, including ones engaged after this call.
    pub fn close_all(&self) {
        self.group.close();
    }
}
