//! Where a synchronization pass sends its results.

use tessera_multiplayer::{
    EntityMessage, MessageRegistry, NetworkController, NetworkId, NodeKey, PeerHandle, RpcValue,
};

use crate::grid::CellIndex;
use crate::object::{GameObjectKey, GameObjectSnapshot};

/// Entity message announcing an object to a peer.
pub type SynchronizeGameObject = GameObjectSnapshot;

impl EntityMessage for GameObjectSnapshot {
    const TYPE_ID: u16 = 0x0100;
    const NAME: &'static str = "SynchronizeGameObject";
}

/// RPC telling a peer an object left its view. Takes the object's id.
pub const REMOVE_GAME_OBJECT_RPC: &str = "RemoveGameObject";

/// Register the scene's entity messages.
pub fn register_scene_messages(registry: &mut MessageRegistry) {
    registry.register::<SynchronizeGameObject>();
}

/// A peer's neighbourhood moved during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellChange {
    pub avatar: GameObjectKey,
    pub removed: Vec<CellIndex>,
    pub added: Vec<CellIndex>,
}

/// Receives the outcome of a synchronization pass.
///
/// Every `object_disappeared` of a pass is delivered before its first
/// `object_appeared`.
pub trait VisibilitySink {
    fn object_appeared(&mut self, peer: PeerHandle, object: &GameObjectSnapshot);

    fn object_disappeared(&mut self, peer: PeerHandle, object: &GameObjectSnapshot);

    fn peer_cells_changed(&mut self, _peer: PeerHandle, _change: &CellChange) {}
}

/// Sends visibility changes to peers through a [`NetworkController`].
pub struct ControllerSink<'a> {
    controller: &'a mut NetworkController,
    scene_view: NetworkId,
}

impl<'a> ControllerSink<'a> {
    pub fn new(controller: &'a mut NetworkController, scene_view: NetworkId) -> Self {
        Self {
            controller,
            scene_view,
        }
    }
}

impl VisibilitySink for ControllerSink<'_> {
    fn object_appeared(&mut self, peer: PeerHandle, object: &GameObjectSnapshot) {
        if let Err(e) = self
            .controller
            .send_message_to(NodeKey::Peer(peer), self.scene_view, object)
        {
            tracing::warn!(%peer, id = %object.id, "failed to announce object: {e}");
        }
    }

    fn object_disappeared(&mut self, peer: PeerHandle, object: &GameObjectSnapshot) {
        let args = [RpcValue::NetworkId(object.id)];
        if let Err(e) = self.controller.rpc_to(
            NodeKey::Peer(peer),
            self.scene_view,
            REMOVE_GAME_OBJECT_RPC,
            &args,
        ) {
            tracing::warn!(%peer, id = %object.id, "failed to remove object: {e}");
        }
    }
}
