//! Client-side table of the objects the server currently shows us.

use rustc_hash::FxHashMap;
use tessera_multiplayer::{Component, HandlerError, NetworkId, RpcType};

use crate::object::GameObjectSnapshot;
use crate::sink::{REMOVE_GAME_OBJECT_RPC, SynchronizeGameObject};

/// Id of the scene view: the first object a root server spawns.
pub fn default_scene_view() -> NetworkId {
    NetworkId::generate(NetworkId::ROOT, 1)
}

/// Remote objects announced on the scene view.
#[derive(Debug, Default)]
pub struct SceneMirror {
    objects: FxHashMap<NetworkId, GameObjectSnapshot>,
}

impl SceneMirror {
    /// Component name on the scene view.
    pub const NAME: &'static str = "SceneMirror";

    /// A component that keeps a `SceneMirror` up to date. Read it back with
    /// `controller.component_state::<SceneMirror>(scene_view, SceneMirror::NAME)`.
    pub fn component() -> Component {
        Component::with_state(Self::NAME, SceneMirror::default())
            .with_message::<SynchronizeGameObject, _>(|mirror, _ctx, object| {
                mirror.insert(object);
                Ok(())
            })
            .with_rpc(REMOVE_GAME_OBJECT_RPC, &[RpcType::NetworkId], |mirror, _ctx, args| {
                let id = args[0].as_network_id().ok_or_else(|| HandlerError::Argument {
                    method: REMOVE_GAME_OBJECT_RPC.to_owned(),
                    index: 0,
                })?;
                if mirror.objects.remove(&id).is_none() {
                    tracing::warn!(%id, "removal of unknown object");
                }
                Ok(())
            })
            .build()
    }

    fn insert(&mut self, object: GameObjectSnapshot) {
        if let Some(previous) = self.objects.insert(object.id, object) {
            tracing::warn!(id = %previous.id, "object announced twice");
        }
    }

    pub fn get(&self, id: NetworkId) -> Option<&GameObjectSnapshot> {
        self.objects.get(&id)
    }

    pub fn contains(&self, id: NetworkId) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GameObjectSnapshot> {
        self.objects.values()
    }
}
