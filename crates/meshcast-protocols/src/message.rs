//! Wire messages exchanged between distributor and forwarders.
//!
//! # Sequences
//!
//! ```text
//! forwarder → distributor   AnnouncePort                  (handshake, first)
//! distributor → forwarder   AssignedIdentity              (reply)
//! distributor → collector   SetCollectorAddress / SetLocalIdentity
//! distributor → forwarder   UpdateNeighbours              (topology)
//! forwarder → forwarder     SetForwarderIdentity          (first on a link)
//! forwarder → distributor   AcknowledgeNeighbours         (periodic)
//! distributor → forwarder   ChunkPush
//! forwarder → forwarder     ChunkForward
//! ```

use std::net::SocketAddr;

use meshcast_transfer::ChunkMessage;
use serde::{Deserialize, Serialize};

use crate::acknowledge::AcknowledgeDiff;
use crate::identity::{Identity, IdentitySet};

/// Every message the overlay speaks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// A forwarder announces the port it accepts peer links on.
    AnnouncePort { port: u16 },
    /// The distributor's reply carrying the forwarder's identity.
    AssignedIdentity { identity: Identity },
    /// A collector announces its full address.
    SetCollectorAddress { address: SocketAddr },
    /// The distributor's reply carrying the collector's identity.
    SetLocalIdentity { identity: Identity },
    /// Peers to connect to and disconnect from.
    UpdateNeighbours { add: IdentitySet, remove: IdentitySet },
    /// Sent first on every forwarder-to-forwarder link.
    SetForwarderIdentity { identity: Identity },
    /// Neighbour changes since the last acknowledgement.
    AcknowledgeNeighbours { diff: AcknowledgeDiff },
    /// A chunk pushed by the distributor.
    ChunkPush { chunk: ChunkMessage },
    /// A chunk relayed between forwarders.
    ChunkForward { chunk: ChunkMessage },
}

impl Message {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::AnnouncePort { .. } => "announce_port",
            Message::AssignedIdentity { .. } => "assigned_identity",
            Message::SetCollectorAddress { .. } => "set_collector_address",
            Message::SetLocalIdentity { .. } => "set_local_identity",
            Message::UpdateNeighbours { .. } => "update_neighbours",
            Message::SetForwarderIdentity { .. } => "set_forwarder_identity",
            Message::AcknowledgeNeighbours { .. } => "acknowledge_neighbours",
            Message::ChunkPush { .. } => "chunk_push",
            Message::ChunkForward { .. } => "chunk_forward",
        }
    }

    /// Messages that open a session with the distributor.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Message::AnnouncePort { .. } | Message::SetCollectorAddress { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Token;
    use meshcast_transfer::BlockHeader;

    fn identity(n: u8) -> Identity {
        Identity {
            token: Token([n; 16]),
            address: SocketAddr::from(([10, 0, 0, 1], 7000 + n as u16)),
        }
    }

    #[test]
    fn serialized_with_type_tag() {
        let json = serde_json::to_value(Message::AnnouncePort { port: 9000 }).unwrap();
        assert_eq!(json["type"], "announce_port");
        assert_eq!(json["port"], 9000);
    }

    #[test]
    fn update_neighbours_survives_json() {
        let message = Message::UpdateNeighbours {
            add: [identity(1), identity(2)].into_iter().collect(),
            remove: [identity(3)].into_iter().collect(),
        };
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(serde_json::from_str::<Message>(&json).unwrap(), message);
    }

    #[test]
    fn chunk_push_carries_payload() {
        let payload = bytes::Bytes::from_static(b"hello");
        let block = BlockHeader::single(4, 0, 1, &payload);
        let chunk = block.chunk(0).unwrap();
        let message = Message::ChunkPush {
            chunk: ChunkMessage {
                block,
                chunk,
                payload,
            },
        };

        let json = serde_json::to_string(&message).unwrap();
        let decoded: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.kind(), "chunk_push");
        assert_eq!(decoded, message);
    }

    #[test]
    fn handshake_messages() {
        assert!(Message::AnnouncePort { port: 1 }.is_handshake());
        assert!(!Message::SetForwarderIdentity {
            identity: identity(1)
        }
        .is_handshake());
    }
}
