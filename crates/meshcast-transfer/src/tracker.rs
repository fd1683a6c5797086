//! Fan-out delivery tracking.
//!
//! A [`DeliveryTracker`] is created per dispatch. It starts one asynchronous
//! send per target immediately, records each outcome exactly once, and
//! invokes its completion callback exactly once when the last send resolves.
//!
//! The resolution counter is a plain atomic. Each resolver inserts its
//! outcome into the result set first and bumps the counter second, so the
//! resolver that observes `resolved == targets` knows every outcome is
//! already recorded and can fire the callback without holding any lock.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use tracing::{debug, trace, warn};

use crate::error::{Result, TransferError};
use crate::lock;
use crate::types::{BlockHeader, ChunkKind, ChunkMessage, Sequence};

/// Future returned by a single chunk send
pub type SendFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Default upper bound on a single chunk send
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Something a chunk can be sent to.
pub trait ChunkTarget: Send + Sync + 'static {
    /// Stable key identifying this target in delivery reports.
    type Key: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static;

    fn key(&self) -> Self::Key;

    /// Start sending one chunk. Resolves once the send succeeded or failed.
    fn send_chunk(&self, kind: ChunkKind, message: ChunkMessage) -> SendFuture;
}

/// Dispatch configuration
#[derive(Debug, Clone, Copy)]
pub struct DeliveryConfig {
    /// Per-send bound; `None` waits indefinitely.
    pub send_timeout: Option<Duration>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout: Some(DEFAULT_SEND_TIMEOUT),
        }
    }
}

impl DeliveryConfig {
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn without_send_timeout(mut self) -> Self {
        self.send_timeout = None;
        self
    }
}

/// Final outcome of one dispatch.
///
/// `succeeded` and `failed` are disjoint and together equal the target set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport<K: Eq + Hash> {
    pub sequence: Sequence,
    pub succeeded: HashSet<K>,
    pub failed: HashSet<K>,
}

impl<K: Eq + Hash> DeliveryReport<K> {
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

type CompletionCallback<K> = Box<dyn FnOnce(DeliveryReport<K>) + Send>;

/// Tracks the asynchronous sends of one block or chunk dispatch.
pub struct DeliveryTracker<K: Eq + Hash> {
    sequence: Sequence,
    targets: HashSet<K>,
    resolved: AtomicUsize,
    succeeded: Mutex<HashSet<K>>,
    failed: Mutex<HashSet<K>>,
    on_complete: Mutex<Option<CompletionCallback<K>>>,
}

impl<K> DeliveryTracker<K>
where
    K: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static,
{
    /// Push a block: each target receives the chunk it is assigned.
    ///
    /// Fails without sending anything if a target is listed twice, an index
    /// is out of range, or the payload does not match the header.
    pub fn push<T, F>(
        block: &BlockHeader,
        payload: &Bytes,
        assignments: Vec<(T, u32)>,
        config: DeliveryConfig,
        on_complete: F,
    ) -> Result<Arc<Self>>
    where
        T: ChunkTarget<Key = K>,
        F: FnOnce(DeliveryReport<K>) + Send + 'static,
    {
        let mut seen = HashSet::with_capacity(assignments.len());
        let mut messages = Vec::with_capacity(assignments.len());
        for (target, index) in assignments {
            let key = target.key();
            if !seen.insert(key.clone()) {
                return Err(TransferError::DuplicateTarget(key.to_string()));
            }
            let message = ChunkMessage {
                block: block.clone(),
                chunk: block.chunk(index)?,
                payload: block.chunk_payload(payload, index)?,
            };
            messages.push((target, key, message));
        }

        let sends = messages
            .into_iter()
            .map(|(target, key, message)| (key, target.send_chunk(ChunkKind::Push, message)))
            .collect();

        Ok(Self::dispatch(block.sequence, sends, config, on_complete))
    }

    /// Relay one chunk unchanged to every target.
    pub fn forward<T, F>(
        message: &ChunkMessage,
        targets: Vec<T>,
        config: DeliveryConfig,
        on_complete: F,
    ) -> Result<Arc<Self>>
    where
        T: ChunkTarget<Key = K>,
        F: FnOnce(DeliveryReport<K>) + Send + 'static,
    {
        let mut seen = HashSet::with_capacity(targets.len());
        for target in &targets {
            let key = target.key();
            if !seen.insert(key.clone()) {
                return Err(TransferError::DuplicateTarget(key.to_string()));
            }
        }

        let sends = targets
            .into_iter()
            .map(|target| (target.key(), target.send_chunk(ChunkKind::Forward, message.clone())))
            .collect();

        Ok(Self::dispatch(message.block.sequence, sends, config, on_complete))
    }

    fn dispatch<F>(
        sequence: Sequence,
        sends: Vec<(K, SendFuture)>,
        config: DeliveryConfig,
        on_complete: F,
    ) -> Arc<Self>
    where
        F: FnOnce(DeliveryReport<K>) + Send + 'static,
    {
        let tracker = Arc::new(Self {
            sequence,
            targets: sends.iter().map(|(key, _)| key.clone()).collect(),
            resolved: AtomicUsize::new(0),
            succeeded: Mutex::new(HashSet::new()),
            failed: Mutex::new(HashSet::new()),
            on_complete: Mutex::new(Some(Box::new(on_complete))),
        });

        debug!(sequence, targets = tracker.targets.len(), "Dispatching block");

        if tracker.targets.is_empty() {
            tracker.complete();
            return tracker;
        }

        for (key, send) in sends {
            let tracker = Arc::clone(&tracker);
            let send_timeout = config.send_timeout;
            tokio::spawn(async move {
                let outcome = match send_timeout {
                    Some(limit) => match tokio::time::timeout(limit, send).await {
                        Ok(outcome) => outcome,
                        Err(_) => Err(anyhow::anyhow!("send timed out after {:?}", limit)),
                    },
                    None => send.await,
                };
                tracker.resolve(key, outcome);
            });
        }

        tracker
    }

    fn resolve(&self, key: K, outcome: anyhow::Result<()>) {
        match outcome {
            Ok(()) => {
                trace!(sequence = self.sequence, target = %key, "Chunk delivered");
                lock(&self.succeeded).insert(key);
            }
            Err(e) => {
                warn!(sequence = self.sequence, target = %key, error = %e, "Chunk send failed");
                lock(&self.failed).insert(key);
            }
        }

        // The insert above happens-before this increment.
        let resolved = self.resolved.fetch_add(1, Ordering::AcqRel) + 1;
        if resolved == self.targets.len() {
            self.complete();
        }
    }

    fn complete(&self) {
        let callback = lock(&self.on_complete).take();
        let report = self.report();
        debug!(
            sequence = self.sequence,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "Dispatch complete"
        );
        if let Some(callback) = callback {
            callback(report);
        }
    }
}

impl<K: Clone + Eq + Hash> DeliveryTracker<K> {
    /// True once every send has resolved. Safe to poll at any time.
    pub fn is_completed(&self) -> bool {
        self.resolved.load(Ordering::Acquire) == self.targets.len()
    }

    pub fn sequence(&self) -> Sequence {
        self.sequence
    }

    pub fn targets(&self) -> &HashSet<K> {
        &self.targets
    }

    /// Snapshot of the outcomes recorded so far.
    pub fn report(&self) -> DeliveryReport<K> {
        DeliveryReport {
            sequence: self.sequence,
            succeeded: lock(&self.succeeded).clone(),
            failed: lock(&self.failed).clone(),
        }
    }
}

impl<K: Eq + Hash> fmt::Debug for DeliveryTracker<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryTracker")
            .field("sequence", &self.sequence)
            .field("targets", &self.targets.len())
            .field("resolved", &self.resolved.load(Ordering::Relaxed))
            .finish()
    }
}
