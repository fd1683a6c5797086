//! Connection groups: close many connections at once.
//!
//! A group may be closed while connections are still being added from
//! other tasks. Every connection added to a closed group is closed too,
//! regardless of how `add` and `close` interleave.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tracing::debug;

use crate::channel::{ChannelRef, ConnectionId};
use crate::lock;

#[derive(Debug, Default)]
pub struct ConnectionGroup {
    closed: AtomicBool,
    members: Mutex<HashMap<ConnectionId, ChannelRef>>,
}

impl ConnectionGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connection. Returns false if the group is already closed, in
    /// which case the connection has been closed.
    pub fn add(&self, channel: ChannelRef) -> bool {
        let id = channel.id();
        lock(&self.members).insert(id, channel);

        // Checked after the insert: either close() sees the member, or we
        // see the flag.
        if self.closed.load(Ordering::SeqCst) {
            if let Some(channel) = self.remove(id) {
                channel.close();
            }
            return false;
        }
        true
    }

    /// Stop tracking a connection without closing it.
    pub fn remove(&self, id: ConnectionId) -> Option<ChannelRef> {
        lock(&self.members).remove(&id)
    }

    /// Close every member, now and in the future. Idempotent.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let members: Vec<ChannelRef> = lock(&self.members).drain().map(|(_, c)| c).collect();
        if !members.is_empty() {
            debug!(connections = members.len(), "Closing connection group");
        }
        for channel in members {
            channel.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        lock(&self.members).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.members).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::connection_pair;
    use std::net::SocketAddr;
    use std::sync::Arc;

    fn channel() -> ChannelRef {
        let a = SocketAddr::from(([127, 0, 0, 1], 1));
        let b = SocketAddr::from(([127, 0, 0, 1], 2));
        connection_pair(a, b).0.channel
    }

    #[test]
    fn close_closes_members() {
        let group = ConnectionGroup::new();
        let a = channel();
        let b = channel();
        assert!(group.add(Arc::clone(&a)));
        assert!(group.add(Arc::clone(&b)));

        group.close();

        assert!(a.is_closed() && b.is_closed());
        assert!(group.is_empty());
    }

    #[test]
    fn add_after_close_closes_immediately() {
        let group = ConnectionGroup::new();
        group.close();

        let late = channel();
        assert!(!group.add(Arc::clone(&late)));
        assert!(late.is_closed());
        assert!(group.is_empty());
    }

    #[test]
    fn removed_member_is_left_open() {
        let group = ConnectionGroup::new();
        let a = channel();
        group.add(Arc::clone(&a));
        assert!(group.remove(a.id()).is_some());

        group.close();
        assert!(!a.is_closed());
    }

    #[test]
    fn concurrent_add_and_close_never_leaks() {
        for _ in 0..50 {
            let group = Arc::new(ConnectionGroup::new());
            let channels: Vec<ChannelRef> = (0..64).map(|_| channel()).collect();

            let adders: Vec<_> = channels
                .chunks(16)
                .map(|batch| {
                    let group = Arc::clone(&group);
                    let batch = batch.to_vec();
                    std::thread::spawn(move || {
                        for channel in batch {
                            group.add(channel);
                        }
                    })
                })
                .collect();
            let closer = {
                let group = Arc::clone(&group);
                std::thread::spawn(move || group.close())
            };

            for handle in adders {
                handle.join().unwrap();
            }
            closer.join().unwrap();

            assert!(channels.iter().all(|c| c.is_closed()));
            assert!(group.is_empty());
        }
    }
}
