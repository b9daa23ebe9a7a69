//! Built-in messages that hand each client its session id.
//!
//! On connect a client asks the root view for an id, or re-registers the id
//! it already has. The server answers with the id it stored for that peer.

use serde::{Deserialize, Serialize};

use crate::message::{EntityMessage, RESERVED_TYPE_IDS};
use crate::network_id::NetworkId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestPeerId;

impl EntityMessage for RequestPeerId {
    const TYPE_ID: u16 = RESERVED_TYPE_IDS;
    const NAME: &'static str = "RequestPeerId";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterPeerId {
    pub peer_id: NetworkId,
}

impl EntityMessage for RegisterPeerId {
    const TYPE_ID: u16 = RESERVED_TYPE_IDS + 1;
    const NAME: &'static str = "RegisterPeerId";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePeerId {
    pub peer_id: NetworkId,
}

impl EntityMessage for ResponsePeerId {
    const TYPE_ID: u16 = RESERVED_TYPE_IDS + 2;
    const NAME: &'static str = "ResponsePeerId";
}

/// Name of the RPC that tells remote mirrors a view was destroyed.
pub const DESTROY_VIEW_RPC: &str = "DestroyView";

/// Id handed to the `nth` peer by a server whose own id is `server`.
pub fn assign_peer_id(server: NetworkId, nth: u16) -> NetworkId {
    NetworkId::generate(NetworkId::generate(server, 0), nth)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network_id::IdKind;

    #[test]
    fn test_assigned_ids_are_sessions() {
        let first = assign_peer_id(NetworkId::ROOT, 1);
        let second = assign_peer_id(NetworkId::ROOT, 2);
        assert_eq!(first.kind(), IdKind::SessionId);
        assert_ne!(first, second);
        assert_eq!(first.parent_session(), Some(NetworkId::ROOT));
    }

    #[test]
    fn test_handshake_ids_are_reserved() {
        for type_id in [
            RequestPeerId::TYPE_ID,
            RegisterPeerId::TYPE_ID,
            ResponsePeerId::TYPE_ID,
        ] {
            assert!(type_id >= RESERVED_TYPE_IDS);
        }
    }
}
