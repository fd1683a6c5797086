//! In-process transport.
//!
//! [`MemoryNetwork`] routes connections between listeners registered on
//! socket addresses, with no sockets involved. It backs the swarm tests and
//! any embedding that runs distributor and forwarders in one process.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace};

use crate::channel::{Channel, Connection, ConnectionId, Connector, Inbox};
use crate::error::{Error, Result};
use crate::lock;
use crate::message::Message;

const FIRST_EPHEMERAL_PORT: u16 = 49152;

/// One end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryChannel {
    id: ConnectionId,
    remote: SocketAddr,
    outgoing: mpsc::UnboundedSender<Message>,
    closed: Arc<watch::Sender<bool>>,
}

impl Channel for MemoryChannel {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn send(&self, message: Message) -> BoxFuture<'static, Result<()>> {
        let result = if self.is_closed() {
            Err(Error::ChannelClosed(self.id))
        } else {
            trace!(connection = %self.id, kind = message.kind(), "Sending message");
            self.outgoing
                .send(message)
                .map_err(|_| Error::ChannelClosed(self.id))
        };
        futures::future::ready(result).boxed()
    }

    fn close(&self) {
        if !self.closed.send_replace(true) {
            debug!(connection = %self.id, remote = %self.remote, "Connection closed");
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

/// Build both ends of a connection between `a` and `b`.
///
/// The first connection's remote address is `b`, the second's is `a`.
pub fn connection_pair(a: SocketAddr, b: SocketAddr) -> (Connection, Connection) {
    let (a_to_b, b_inbox) = mpsc::unbounded_channel();
    let (b_to_a, a_inbox) = mpsc::unbounded_channel();
    let (closed, closed_rx) = watch::channel(false);
    let closed = Arc::new(closed);

    let a_end = Connection {
        channel: Arc::new(MemoryChannel {
            id: ConnectionId::next(),
            remote: b,
            outgoing: a_to_b,
            closed: Arc::clone(&closed),
        }),
        inbox: Inbox::new(a_inbox, closed_rx.clone()),
    };
    let b_end = Connection {
        channel: Arc::new(MemoryChannel {
            id: ConnectionId::next(),
            remote: a,
            outgoing: b_to_a,
            closed,
        }),
        inbox: Inbox::new(b_inbox, closed_rx),
    };
    (a_end, b_end)
}

#[derive(Debug, Default)]
struct NetworkState {
    listeners: HashMap<SocketAddr, mpsc::UnboundedSender<Connection>>,
}

/// Registry of in-memory listeners. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
    next_port: Arc<AtomicU16>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            next_port: Arc::new(AtomicU16::new(FIRST_EPHEMERAL_PORT)),
        }
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept connections addressed to `address`.
    pub fn listen(&self, address: SocketAddr) -> Result<MemoryListener> {
        let mut state = lock(&self.state);
        if state.listeners.contains_key(&address) {
            return Err(Error::AddressInUse(address));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.listeners.insert(address, tx);
        debug!(address = %address, "Listening");
        Ok(MemoryListener {
            address,
            incoming: rx,
            network: self.clone(),
        })
    }

    /// Connect from an explicit local address.
    pub fn connect_from(&self, local: SocketAddr, remote: SocketAddr) -> Result<Connection> {
        let state = lock(&self.state);
        let refused = |reason: &str| Error::ConnectionRefused {
            address: remote,
            reason: reason.to_string(),
        };
        let listener = state.listeners.get(&remote).ok_or_else(|| refused("no listener"))?;

        let (dialer, acceptor) = connection_pair(local, remote);
        listener
            .send(acceptor)
            .map_err(|_| refused("listener shut down"))?;
        trace!(local = %local, remote = %remote, "Connected");
        Ok(dialer)
    }

    fn ephemeral_addr(&self) -> SocketAddr {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn unlisten(&self, address: &SocketAddr) {
        lock(&self.state).listeners.remove(address);
    }
}

impl Connector for MemoryNetwork {
    fn connect(&self, address: SocketAddr) -> BoxFuture<'static, Result<Connection>> {
        let result = self.connect_from(self.ephemeral_addr(), address);
        futures::future::ready(result).boxed()
    }
}

/// Incoming connections for one address. Stops listening when dropped.
#[derive(Debug)]
pub struct MemoryListener {
    address: SocketAddr,
    incoming: mpsc::UnboundedReceiver<Connection>,
    network: MemoryNetwork,
}

impl MemoryListener {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Next incoming connection.
    pub async fn accept(&mut self) -> Option<Connection> {
        self.incoming.recv().await
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.unlisten(&self.address);
    }
}
