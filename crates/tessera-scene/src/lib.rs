//! Interest management for a 2-D scene: a fixed grid of cells, per-peer
//! neighbourhoods around each avatar, and a synchronization pass that tells
//! peers which objects appeared or disappeared.

pub mod arena;
pub mod grid;
pub mod mirror;
pub mod object;
pub mod peer;
pub mod server;
pub mod sink;

pub use arena::{SlotKey, Slots};
pub use grid::{CellIndex, Grid, GridCell, diff_neighbourhoods};
pub use mirror::{SceneMirror, default_scene_view};
pub use object::{GameObjectDesc, GameObjectKey, GameObjectSnapshot};
pub use peer::ScenePeer;
pub use server::GameSceneServer;
pub use sink::{
    CellChange, ControllerSink, REMOVE_GAME_OBJECT_RPC, SynchronizeGameObject, VisibilitySink,
    register_scene_messages,
};
