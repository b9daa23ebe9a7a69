//! Per-peer synchronization state.

use rustc_hash::FxHashSet;

use crate::grid::CellIndex;
use crate::object::GameObjectKey;

/// A peer that entered the scene.
#[derive(Debug, Default)]
pub struct ScenePeer {
    pub(crate) avatar: Option<GameObjectKey>,
    pub(crate) last_cells: Vec<CellIndex>,
    pub(crate) last_center: Option<CellIndex>,
    pub(crate) appeared: Vec<GameObjectKey>,
    pub(crate) disappeared: Vec<GameObjectKey>,
    pub(crate) has_sync_job: bool,
    pub(crate) has_unsync_job: bool,
    sent: FxHashSet<GameObjectKey>,
}

impl ScenePeer {
    pub fn avatar(&self) -> Option<GameObjectKey> {
        self.avatar
    }

    /// Cells this peer is subscribed to.
    pub fn cells(&self) -> &[CellIndex] {
        &self.last_cells
    }

    /// Whether the peer was told about `object` and not told it left.
    pub fn has_object(&self, object: GameObjectKey) -> bool {
        self.sent.contains(&object)
    }

    pub fn object_count(&self) -> usize {
        self.sent.len()
    }

    /// Queue `object` to appear; cancels a pending disappearance.
    pub(crate) fn queue_appear(&mut self, object: GameObjectKey) {
        debug_assert!(!self.appeared.contains(&object), "{object} queued to appear twice");
        self.has_sync_job = true;
        if let Some(index) = self.disappeared.iter().position(|&o| o == object) {
            self.disappeared.swap_remove(index);
        } else {
            self.appeared.push(object);
        }
    }

    /// Queue `object` to disappear; cancels a pending appearance.
    pub(crate) fn queue_disappear(&mut self, object: GameObjectKey) {
        debug_assert!(
            !self.disappeared.contains(&object),
            "{object} queued to disappear twice"
        );
        self.has_unsync_job = true;
        if let Some(index) = self.appeared.iter().position(|&o| o == object) {
            self.appeared.swap_remove(index);
        } else {
            self.disappeared.push(object);
        }
    }

    pub(crate) fn mark_sent(&mut self, object: GameObjectKey) {
        let fresh = self.sent.insert(object);
        debug_assert!(fresh, "{object} is already on the peer");
    }

    pub(crate) fn mark_unsent(&mut self, object: GameObjectKey) -> bool {
        self.sent.remove(&object)
    }
}
