//! Transport seam: message channels and the connector that opens them.
//!
//! A [`Connection`] pairs the sending half ([`Channel`]) with the receiving
//! half ([`Inbox`]). Messages on one connection are delivered in send order.
//! Closing either end closes both: pending and future sends fail, and both
//! inboxes stop yielding messages.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};

use crate::error::Result;
use crate::message::Message;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique connection handle. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sending half of a connection.
pub trait Channel: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnectionId;

    /// Address of the remote end.
    fn remote_addr(&self) -> SocketAddr;

    /// Queue a message. Messages are queued in call order; the returned
    /// future only reports whether the transport accepted this one.
    fn send(&self, message: Message) -> BoxFuture<'static, Result<()>>;

    /// Close both ends. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Shared handle to a channel.
pub type ChannelRef = Arc<dyn Channel>;

/// Receiving half of a connection.
#[derive(Debug)]
pub struct Inbox {
    messages: mpsc::UnboundedReceiver<Message>,
    closed: watch::Receiver<bool>,
}

impl Inbox {
    /// Wrap a transport's message queue and close signal.
    pub fn new(messages: mpsc::UnboundedReceiver<Message>, closed: watch::Receiver<bool>) -> Self {
        Self { messages, closed }
    }

    /// Next message, or `None` once the connection is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        if *self.closed.borrow() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.closed.wait_for(|closed| *closed) => None,
            message = self.messages.recv() => message,
        }
    }
}

/// An open connection.
#[derive(Debug)]
pub struct Connection {
    pub channel: ChannelRef,
    pub inbox: Inbox,
}

/// Opens outbound connections.
pub trait Connector: Send + Sync + 'static {
    fn connect(&self, address: SocketAddr) -> BoxFuture<'static, Result<Connection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_ids_are_unique_and_increasing() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert!(b > a);
        assert_ne!(a.to_string(), b.to_string());
    }

    #[tokio::test]
    async fn inbox_stops_when_closed() {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_tx, closed_rx) = watch::channel(false);
        let mut inbox = Inbox::new(rx, closed_rx);

        tx.send(Message::AnnouncePort { port: 1 }).unwrap();
        assert_eq!(inbox.recv().await, Some(Message::AnnouncePort { port: 1 }));

        closed_tx.send_replace(true);
        tx.send(Message::AnnouncePort { port: 2 }).unwrap();
        assert_eq!(inbox.recv().await, None);
    }

    #[tokio::test]
    async fn inbox_ends_when_transport_is_dropped() {
        let (tx, rx) = mpsc::unbounded_channel::<Message>();
        let (closed_tx, closed_rx) = watch::channel(false);
        let mut inbox = Inbox::new(rx, closed_rx);

        drop(tx);
        drop(closed_tx);
        assert_eq!(inbox.recv().await, None);
    }
}
