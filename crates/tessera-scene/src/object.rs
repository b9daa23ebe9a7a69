//! Server-side scene objects.

use glam::Vec2;
use serde::{Deserialize, Serialize};
use tessera_multiplayer::NetworkId;

use crate::arena::SlotKey;
use crate::grid::CellIndex;

pub type GameObjectKey = SlotKey;

/// What a peer is told when an object enters its view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameObjectSnapshot {
    /// Prefab the client instantiates for this object.
    pub prefab: String,
    pub name: String,
    pub id: NetworkId,
    pub position: Vec2,
    pub rotation: f32,
}

/// Parameters for [`GameSceneServer::spawn_object`](crate::GameSceneServer::spawn_object).
#[derive(Debug, Clone, PartialEq)]
pub struct GameObjectDesc {
    pub snapshot: GameObjectSnapshot,
    /// Objects that synchronize themselves are bucketed but never announced.
    pub custom_synchronization: bool,
}

impl GameObjectDesc {
    pub fn new(prefab: impl Into<String>, name: impl Into<String>, id: NetworkId, position: Vec2) -> Self {
        Self {
            snapshot: GameObjectSnapshot {
                prefab: prefab.into(),
                name: name.into(),
                id,
                position,
                rotation: 0.0,
            },
            custom_synchronization: false,
        }
    }

    pub fn with_rotation(mut self, rotation: f32) -> Self {
        self.snapshot.rotation = rotation;
        self
    }

    pub fn with_custom_synchronization(mut self) -> Self {
        self.custom_synchronization = true;
        self
    }
}

#[derive(Debug)]
pub(crate) struct GameObject {
    pub(crate) snapshot: GameObjectSnapshot,
    pub(crate) custom_synchronization: bool,
    pub(crate) cell: Option<CellIndex>,
    pub(crate) dirty: bool,
}

impl GameObject {
    pub(crate) fn new(desc: GameObjectDesc) -> Self {
        Self {
            snapshot: desc.snapshot,
            custom_synchronization: desc.custom_synchronization,
            cell: None,
            dirty: false,
        }
    }
}
