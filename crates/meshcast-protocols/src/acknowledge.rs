//! Neighbour acknowledgement: forwarders report connection changes upstream.
//!
//! Connection events are folded into an [`AcknowledgeAccumulator`]. A
//! periodic task flushes the accumulated [`AcknowledgeDiff`] to the
//! distributor, with at most one flush in flight. A failed flush is folded
//! back underneath whatever accumulated meanwhile, so nothing is lost and
//! the net result is the same as if the send had never been attempted.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use meshcast_topology::NeighbourDelta;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::channel::ChannelRef;
use crate::error::Result;
use crate::identity::Identity;
use crate::lock;
use crate::message::Message;

/// Which side opened a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// The peer connected to us.
    Inbound,
    /// We connected to the peer.
    Outbound,
}

/// Lifecycle events produced by the connection layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected { identity: Identity, direction: Direction },
    Disconnected { identity: Identity, direction: Direction },
    /// An outbound attempt gave up. The peer was never engaged.
    ConnectionRefused { identity: Identity, reason: String },
}

impl ConnectionEvent {
    pub fn identity(&self) -> &Identity {
        match self {
            ConnectionEvent::Connected { identity, .. }
            | ConnectionEvent::Disconnected { identity, .. }
            | ConnectionEvent::ConnectionRefused { identity, .. } => identity,
        }
    }
}

/// Net neighbour changes in both directions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcknowledgeDiff {
    pub outbound: NeighbourDelta<Identity>,
    pub inbound: NeighbourDelta<Identity>,
}

impl AcknowledgeDiff {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a diff from explicit sets, rejecting a peer listed as both
    /// added and removed in the same direction.
    pub fn from_sets(
        added_outbound: BTreeSet<Identity>,
        removed_outbound: BTreeSet<Identity>,
        added_inbound: BTreeSet<Identity>,
        removed_inbound: BTreeSet<Identity>,
    ) -> Result<Self> {
        Ok(Self {
            outbound: NeighbourDelta::from_sets(added_outbound, removed_outbound)?,
            inbound: NeighbourDelta::from_sets(added_inbound, removed_inbound)?,
        })
    }

    /// Fold one connection event into the diff.
    pub fn record(&mut self, event: &ConnectionEvent) {
        match event {
            ConnectionEvent::Connected { identity, direction } => {
                self.direction_mut(*direction).record_added(*identity)
            }
            ConnectionEvent::Disconnected { identity, direction } => {
                self.direction_mut(*direction).record_removed(*identity)
            }
            ConnectionEvent::ConnectionRefused { .. } => {}
        }
    }

    /// Fold a later diff into this one.
    pub fn merge(&mut self, later: AcknowledgeDiff) {
        self.outbound.merge(later.outbound);
        self.inbound.merge(later.inbound);
    }

    /// Fold an earlier diff underneath this one.
    pub fn prepend(&mut self, earlier: AcknowledgeDiff) {
        self.outbound.prepend(earlier.outbound);
        self.inbound.prepend(earlier.inbound);
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.inbound.is_empty()
    }

    pub fn added_outbound(&self) -> &BTreeSet<Identity> {
        self.outbound.added()
    }

    pub fn removed_outbound(&self) -> &BTreeSet<Identity> {
        self.outbound.removed()
    }

    pub fn added_inbound(&self) -> &BTreeSet<Identity> {
        self.inbound.added()
    }

    pub fn removed_inbound(&self) -> &BTreeSet<Identity> {
        self.inbound.removed()
    }

    fn direction_mut(&mut self, direction: Direction) -> &mut NeighbourDelta<Identity> {
        match direction {
            Direction::Inbound => &mut self.inbound,
            Direction::Outbound => &mut self.outbound,
        }
    }
}

/// Collects connection events between flushes.
#[derive(Debug, Default)]
pub struct AcknowledgeAccumulator {
    current: AcknowledgeDiff,
    in_flight: bool,
}

impl AcknowledgeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: &ConnectionEvent) {
        self.current.record(event);
    }

    /// Take the accumulated diff for sending.
    ///
    /// Returns `None` if a flush is already in flight or nothing changed.
    pub fn begin_flush(&mut self) -> Option<AcknowledgeDiff> {
        if self.in_flight || self.current.is_empty() {
            return None;
        }
        self.in_flight = true;
        Some(std::mem::take(&mut self.current))
    }

    /// Settle the in-flight flush. On failure the unsent diff is restored
    /// underneath anything recorded since.
    pub fn finish_flush(&mut self, outcome: std::result::Result<(), AcknowledgeDiff>) {
        self.in_flight = false;
        if let Err(unsent) = outcome {
            self.current.prepend(unsent);
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Changes not yet handed to a flush.
    pub fn pending(&self) -> &AcknowledgeDiff {
        &self.current
    }
}

/// Accumulator shared between the event router and the flusher.
pub type SharedAccumulator = Arc<Mutex<AcknowledgeAccumulator>>;

/// Periodically sends accumulated diffs upstream. Stops when dropped.
#[derive(Debug)]
pub struct AcknowledgeFlusher {
    task: JoinHandle<()>,
}

impl AcknowledgeFlusher {
    /// Start flushing `accumulator` to `upstream` every `interval`.
    pub fn spawn(accumulator: SharedAccumulator, upstream: ChannelRef, interval: Duration) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(diff) = lock(&accumulator).begin_flush() else {
                    trace!("Nothing to acknowledge");
                    continue;
                };

                debug!(
                    added_outbound = diff.added_outbound().len(),
                    removed_outbound = diff.removed_outbound().len(),
                    added_inbound = diff.added_inbound().len(),
                    removed_inbound = diff.removed_inbound().len(),
                    "Flushing neighbour acknowledgement"
                );

                let send = upstream.send(Message::AcknowledgeNeighbours { diff: diff.clone() });
                let accumulator = Arc::clone(&accumulator);
                tokio::spawn(async move {
                    let outcome = match send.await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            warn!(error = %e, "Acknowledgement send failed, keeping diff");
                            Err(diff)
                        }
                    };
                    lock(&accumulator).finish_flush(outcome);
                });
            }
        });
        Self { task }
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for AcknowledgeFlusher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Channel, ConnectionId};
    use crate::error::Error;
    use crate::identity::Token;
    use futures::future::{BoxFuture, FutureExt};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn peer(n: u8) -> Identity {
        Identity {
            token: Token([n; 16]),
            address: SocketAddr::from(([10, 0, 0, n], 7000)),
        }
    }

    fn connected(n: u8, direction: Direction) -> ConnectionEvent {
        ConnectionEvent::Connected {
            identity: peer(n),
            direction,
        }
    }

    fn disconnected(n: u8, direction: Direction) -> ConnectionEvent {
        ConnectionEvent::Disconnected {
            identity: peer(n),
            direction,
        }
    }

    #[test]
    fn events_land_in_their_direction() {
        let mut diff = AcknowledgeDiff::new();
        diff.record(&connected(1, Direction::Outbound));
        diff.record(&connected(2, Direction::Inbound));
        diff.record(&disconnected(3, Direction::Inbound));

        assert!(diff.added_outbound().contains(&peer(1)));
        assert!(diff.added_inbound().contains(&peer(2)));
        assert!(diff.removed_inbound().contains(&peer(3)));
        assert!(diff.removed_outbound().is_empty());
    }

    #[test]
    fn reconnect_within_window_cancels() {
        let mut diff = AcknowledgeDiff::new();
        diff.record(&disconnected(1, Direction::Outbound));
        diff.record(&connected(1, Direction::Outbound));
        assert!(diff.is_empty());
    }

    #[test]
    fn refused_is_not_recorded() {
        let mut diff = AcknowledgeDiff::new();
        diff.record(&ConnectionEvent::ConnectionRefused {
            identity: peer(1),
            reason: "no route".into(),
        });
        assert!(diff.is_empty());
    }

    #[test]
    fn overlapping_sets_rejected() {
        let both: BTreeSet<_> = [peer(1)].into_iter().collect();
        let result = AcknowledgeDiff::from_sets(both.clone(), both, BTreeSet::new(), BTreeSet::new());
        assert!(matches!(result, Err(Error::ConflictingDiff(_))));
    }

    #[test]
    fn overlapping_sets_rejected_on_decode() {
        let json = serde_json::json!({
            "outbound": { "added": [], "removed": [] },
            "inbound": {
                "added": [serde_json::to_value(peer(1)).unwrap()],
                "removed": [serde_json::to_value(peer(1)).unwrap()],
            },
        });
        assert!(serde_json::from_value::<AcknowledgeDiff>(json).is_err());
    }

    #[test]
    fn one_flush_in_flight() {
        let mut acc = AcknowledgeAccumulator::new();
        assert!(acc.begin_flush().is_none());

        acc.record(&connected(1, Direction::Outbound));
        let first = acc.begin_flush().unwrap();
        assert!(first.added_outbound().contains(&peer(1)));
        assert!(acc.is_in_flight());

        acc.record(&connected(2, Direction::Outbound));
        assert!(acc.begin_flush().is_none());

        acc.finish_flush(Ok(()));
        let second = acc.begin_flush().unwrap();
        assert_eq!(second.added_outbound().len(), 1);
        assert!(second.added_outbound().contains(&peer(2)));
    }

    #[test]
    fn failed_flush_is_restored_underneath() {
        let mut acc = AcknowledgeAccumulator::new();
        acc.record(&connected(1, Direction::Outbound));
        acc.record(&connected(2, Direction::Inbound));
        let unsent = acc.begin_flush().unwrap();

        // Peer 1 drops while the flush is in flight.
        acc.record(&disconnected(1, Direction::Outbound));
        acc.finish_flush(Err(unsent));

        let pending = acc.pending();
        assert!(pending.added_outbound().is_empty());
        assert!(pending.removed_outbound().is_empty());
        assert!(pending.added_inbound().contains(&peer(2)));
        assert!(!acc.is_in_flight());
    }

    #[derive(Debug)]
    struct RecordingChannel {
        id: ConnectionId,
        fail: AtomicBool,
        sent: Mutex<Vec<Message>>,
    }

    impl Channel for RecordingChannel {
        fn id(&self) -> ConnectionId {
            self.id
        }

        fn remote_addr(&self) -> SocketAddr {
            SocketAddr::from(([127, 0, 0, 1], 1))
        }

        fn send(&self, message: Message) -> BoxFuture<'static, Result<()>> {
            let result = if self.fail.load(Ordering::SeqCst) {
                Err(Error::ChannelClosed(self.id))
            } else {
                self.sent.lock().unwrap().push(message);
                Ok(())
            };
            futures::future::ready(result).boxed()
        }

        fn close(&self) {}

        fn is_closed(&self) -> bool {
            false
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flusher_sends_then_retries_failures() {
        let channel = Arc::new(RecordingChannel {
            id: ConnectionId::next(),
            fail: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        });
        let acc: SharedAccumulator = Arc::default();
        lock(&acc).record(&connected(1, Direction::Outbound));

        let flusher = AcknowledgeFlusher::spawn(Arc::clone(&acc), channel.clone(), Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(channel.sent.lock().unwrap().is_empty());
        assert!(lock(&acc).pending().added_outbound().contains(&peer(1)));

        channel.fail.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(1)).await;
        {
            let sent = channel.sent.lock().unwrap();
            assert_eq!(sent.len(), 1);
            match &sent[0] {
                Message::AcknowledgeNeighbours { diff } => {
                    assert!(diff.added_outbound().contains(&peer(1)))
                }
                other => panic!("unexpected message {other:?}"),
            }
        }
        assert!(lock(&acc).pending().is_empty());

        // Quiet period: nothing more is sent.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(channel.sent.lock().unwrap().len(), 1);

        flusher.stop();
        lock(&acc).record(&connected(2, Direction::Inbound));
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(channel.sent.lock().unwrap().len(), 1);
    }
}
