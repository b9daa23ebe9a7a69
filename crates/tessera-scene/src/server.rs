//! Interest-grid scheduler: decides which objects each peer sees.
//!
//! Mutations are recorded cheaply and resolved in
//! [`synchronize`](GameSceneServer::synchronize), which:
//!
//! 1. re-buckets every object that moved,
//! 2. re-subscribes every peer whose avatar changed cell,
//! 3. runs the removal half of every touched cell, then the addition half,
//! 4. flushes every peer's disappearances, then every peer's appearances.

use std::collections::{BTreeMap, VecDeque};

use glam::Vec2;
use tessera_config::{NetworkConfig, SceneConfig, UpdateCheckType};
use tessera_multiplayer::PeerHandle;

use crate::arena::Slots;
use crate::grid::{CellIndex, Grid, GridCell, diff_neighbourhoods};
use crate::object::{GameObject, GameObjectDesc, GameObjectKey, GameObjectSnapshot};
use crate::peer::ScenePeer;
use crate::sink::{CellChange, VisibilitySink};

pub struct GameSceneServer {
    grid: Grid,
    objects: Slots<GameObject>,
    peers: BTreeMap<PeerHandle, ScenePeer>,
    dirty: VecDeque<GameObjectKey>,
    cells_with_job: Vec<CellIndex>,
    peers_with_unsync_job: Vec<PeerHandle>,
    peers_with_sync_job: Vec<PeerHandle>,
    synchronizing: bool,
    update_check: UpdateCheckType,
    update_period: u64,
    synchronize_every_ticks: u64,
    tick: u64,
    last_synchronize: u64,
}

impl GameSceneServer {
    pub fn new(scene: &SceneConfig, network: &NetworkConfig) -> Self {
        Self {
            grid: Grid::new(scene.grid_size, scene.cell_length),
            objects: Slots::new(),
            peers: BTreeMap::new(),
            dirty: VecDeque::new(),
            cells_with_job: Vec::new(),
            peers_with_unsync_job: Vec::new(),
            peers_with_sync_job: Vec::new(),
            synchronizing: false,
            update_check: network.update_check,
            update_period: network.update_period,
            synchronize_every_ticks: scene.synchronize_every_ticks.max(1),
            tick: 0,
            last_synchronize: 0,
        }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn is_synchronizing(&self) -> bool {
        self.synchronizing
    }

    fn assert_idle(&self) {
        debug_assert!(!self.synchronizing, "scene mutated during a synchronization pass");
    }

    // -----------------------------------------------------------------------
    // Objects
    // -----------------------------------------------------------------------

    /// Add an object. It is bucketed on the next pass.
    pub fn spawn_object(&mut self, desc: GameObjectDesc) -> GameObjectKey {
        self.assert_idle();
        let key = self.objects.insert(GameObject::new(desc));
        self.mark_dirty(key);
        key
    }

    pub fn object(&self, key: GameObjectKey) -> Option<&GameObjectSnapshot> {
        self.objects.get(key).map(|object| &object.snapshot)
    }

    /// Cell the object was bucketed into by the last pass.
    pub fn object_cell(&self, key: GameObjectKey) -> Option<CellIndex> {
        self.objects.get(key)?.cell
    }

    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub fn set_position(&mut self, key: GameObjectKey, position: Vec2) -> bool {
        self.assert_idle();
        let Some(object) = self.objects.get_mut(key) else {
            return false;
        };
        object.snapshot.position = position;
        self.mark_dirty(key);
        true
    }

    pub fn set_rotation(&mut self, key: GameObjectKey, rotation: f32) -> bool {
        self.assert_idle();
        match self.objects.get_mut(key) {
            Some(object) => {
                object.snapshot.rotation = rotation;
                true
            }
            None => false,
        }
    }

    fn mark_dirty(&mut self, key: GameObjectKey) {
        if let Some(object) = self.objects.get_mut(key)
            && !object.dirty
        {
            object.dirty = true;
            self.dirty.push_back(key);
        }
    }

    /// Remove an object. Peers that were shown it are told right away.
    pub fn destroy_object(
        &mut self,
        key: GameObjectKey,
        sink: &mut dyn VisibilitySink,
    ) -> Option<GameObjectSnapshot> {
        self.assert_idle();
        let object = self.objects.remove(key)?;

        if let Some(cell) = object.cell {
            let cell = self.grid.get_mut(cell);
            debug_assert!(!cell.added_objects.contains(&key) && !cell.removed_objects.contains(&key));
            cell.objects.retain(|&o| o != key);
        }
        if object.dirty {
            self.dirty.retain(|&o| o != key);
        }

        for (&handle, peer) in self.peers.iter_mut() {
            if peer.avatar == Some(key) {
                tracing::debug!(%handle, "avatar {key} destroyed");
                peer.avatar = None;
            }
            if peer.mark_unsent(key) {
                sink.object_disappeared(handle, &object.snapshot);
            }
        }
        Some(object.snapshot)
    }

    // -----------------------------------------------------------------------
    // Peers
    // -----------------------------------------------------------------------

    pub fn enter_peer(&mut self, peer: PeerHandle) {
        self.assert_idle();
        let previous = self.peers.insert(peer, ScenePeer::default());
        debug_assert!(previous.is_none(), "{peer} entered the scene twice");
        tracing::debug!(%peer, "peer entered scene");
    }

    pub fn peer(&self, peer: PeerHandle) -> Option<&ScenePeer> {
        self.peers.get(&peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerHandle> + '_ {
        self.peers.keys().copied()
    }

    /// The object whose cell decides what `peer` sees.
    pub fn set_avatar(&mut self, peer: PeerHandle, avatar: Option<GameObjectKey>) -> bool {
        self.assert_idle();
        debug_assert!(
            avatar.is_none_or(|key| self.objects.contains(key)),
            "avatar for {peer} is not a live object"
        );
        match self.peers.get_mut(&peer) {
            Some(scene_peer) => {
                scene_peer.avatar = avatar;
                true
            }
            None => false,
        }
    }

    /// Take a peer out of the scene and destroy its avatar.
    pub fn remove_peer(&mut self, peer: PeerHandle, sink: &mut dyn VisibilitySink) -> bool {
        self.assert_idle();
        let Some(scene_peer) = self.peers.remove(&peer) else {
            return false;
        };
        for &cell in &scene_peer.last_cells {
            let cell = self.grid.get_mut(cell);
            debug_assert!(cell.active_peers.contains(&peer), "{peer} was not active in its cell");
            cell.active_peers.retain(|&p| p != peer);
        }
        self.peers_with_sync_job.retain(|&p| p != peer);
        self.peers_with_unsync_job.retain(|&p| p != peer);

        if let Some(avatar) = scene_peer.avatar {
            self.destroy_object(avatar, sink);
        }
        tracing::debug!(%peer, "peer left scene");
        true
    }

    // -----------------------------------------------------------------------
    // Synchronization
    // -----------------------------------------------------------------------

    /// Call once per scene tick; `true` when a pass is due.
    pub fn should_synchronize(&mut self) -> bool {
        self.tick += 1;
        match self.update_check {
            UpdateCheckType::Time => self.tick % self.synchronize_every_ticks == 0,
            UpdateCheckType::Frame => {
                if self.tick - self.last_synchronize >= self.update_period {
                    self.last_synchronize = self.tick;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Run one synchronization pass.
    pub fn synchronize(&mut self, sink: &mut dyn VisibilitySink) {
        self.assert_idle();
        self.synchronizing = true;

        while let Some(key) = self.dirty.pop_front() {
            self.update_on_grid(key);
        }

        let handles: Vec<_> = self.peers.keys().copied().collect();
        for handle in handles {
            if let Some(change) = self.update_peer_cells(handle) {
                sink.peer_cells_changed(handle, &change);
            }
        }

        let cells = std::mem::take(&mut self.cells_with_job);
        for &cell in &cells {
            self.unsynchronize_cell(cell);
        }
        for &cell in &cells {
            self.synchronize_cell(cell);
        }

        let (disappeared, appeared) = self.flush(sink);
        if disappeared + appeared > 0 {
            tracing::debug!(cells = cells.len(), disappeared, appeared, "scene synchronized");
        }

        self.synchronizing = false;
    }

    fn update_on_grid(&mut self, key: GameObjectKey) {
        let Some(object) = self.objects.get_mut(key) else {
            return;
        };
        object.dirty = false;
        let new_cell = self.grid.cell_at(object.snapshot.position);
        let old_cell = object.cell;
        if old_cell == Some(new_cell) {
            return;
        }
        object.cell = Some(new_cell);
        let announce = !object.custom_synchronization;

        if let Some(old_cell) = old_cell {
            let cell = self.grid.get_mut(old_cell);
            debug_assert!(cell.objects.contains(&key), "{key} missing from its cell");
            cell.objects.retain(|&o| o != key);
            if announce {
                debug_assert!(!cell.removed_objects.contains(&key));
                cell.removed_objects.push(key);
                Self::job_added(&mut self.cells_with_job, cell, old_cell);
            }
        }

        let cell = self.grid.get_mut(new_cell);
        debug_assert!(!cell.objects.contains(&key), "{key} already in its new cell");
        cell.objects.push(key);
        if announce {
            debug_assert!(!cell.added_objects.contains(&key));
            cell.added_objects.push(key);
            Self::job_added(&mut self.cells_with_job, cell, new_cell);
        }
    }

    fn job_added(cells_with_job: &mut Vec<CellIndex>, cell: &mut GridCell, index: CellIndex) {
        if !cell.has_job {
            cell.has_job = true;
            cells_with_job.push(index);
        }
    }

    /// Follow the avatar into its current neighbourhood. Peers without an
    /// avatar keep the cells they had.
    fn update_peer_cells(&mut self, handle: PeerHandle) -> Option<CellChange> {
        let peer = self.peers.get_mut(&handle)?;
        let avatar = peer.avatar?;
        let center = self.objects.get(avatar)?.cell;
        if center == peer.last_center {
            return None;
        }

        let old = self.grid.cells_around(peer.last_center);
        let new = self.grid.cells_around(center);
        let (removed, added) = diff_neighbourhoods(&old, &new);

        for &index in &removed {
            let cell = self.grid.get_mut(index);
            debug_assert!(cell.active_peers.contains(&handle), "{handle} not active in a cell it leaves");
            cell.removed_peers.push(handle);
            Self::job_added(&mut self.cells_with_job, cell, index);
        }
        for &index in &added {
            let cell = self.grid.get_mut(index);
            cell.added_peers.push(handle);
            Self::job_added(&mut self.cells_with_job, cell, index);
        }

        peer.last_cells = new;
        peer.last_center = center;
        Some(CellChange { avatar, removed, added })
    }

    fn unsynchronize_cell(&mut self, index: CellIndex) {
        let cell = self.grid.get_mut(index);

        for key in cell.removed_objects.drain(..) {
            for &handle in &cell.active_peers {
                Self::queue(&mut self.peers, &mut self.peers_with_unsync_job, handle, key, false);
            }
        }

        // Objects that arrived this pass were never shown to leaving peers.
        for &handle in &cell.removed_peers {
            for &key in cell.objects.iter().filter(|&&key| !cell.added_objects.contains(&key)) {
                if self.objects.get(key).is_some_and(|o| !o.custom_synchronization) {
                    Self::queue(&mut self.peers, &mut self.peers_with_unsync_job, handle, key, false);
                }
            }
        }
        for handle in cell.removed_peers.drain(..) {
            cell.active_peers.retain(|&p| p != handle);
        }
    }

    fn synchronize_cell(&mut self, index: CellIndex) {
        let cell = self.grid.get_mut(index);

        for key in cell.added_objects.drain(..) {
            debug_assert!(cell.objects.contains(&key), "{key} added but not in the cell");
            for &handle in &cell.active_peers {
                Self::queue(&mut self.peers, &mut self.peers_with_sync_job, handle, key, true);
            }
        }

        for &handle in &cell.added_peers {
            for &key in &cell.objects {
                if self.objects.get(key).is_some_and(|o| !o.custom_synchronization) {
                    Self::queue(&mut self.peers, &mut self.peers_with_sync_job, handle, key, true);
                }
            }
        }
        let added_peers = std::mem::take(&mut cell.added_peers);
        cell.active_peers.extend(added_peers);
        cell.has_job = false;
    }

    fn queue(
        peers: &mut BTreeMap<PeerHandle, ScenePeer>,
        with_job: &mut Vec<PeerHandle>,
        handle: PeerHandle,
        key: GameObjectKey,
        appear: bool,
    ) {
        let Some(peer) = peers.get_mut(&handle) else {
            return;
        };
        let had_job = if appear { peer.has_sync_job } else { peer.has_unsync_job };
        if !had_job {
            with_job.push(handle);
        }
        if appear {
            peer.queue_appear(key);
        } else {
            peer.queue_disappear(key);
        }
    }

    /// Deliver queued changes: all disappearances, then all appearances.
    fn flush(&mut self, sink: &mut dyn VisibilitySink) -> (usize, usize) {
        let mut disappeared = 0;
        for handle in std::mem::take(&mut self.peers_with_unsync_job) {
            let Some(peer) = self.peers.get_mut(&handle) else {
                continue;
            };
            peer.has_unsync_job = false;
            for key in std::mem::take(&mut peer.disappeared) {
                debug_assert!(peer.avatar != Some(key), "{handle} told to drop its own avatar");
                let was_sent = peer.mark_unsent(key);
                debug_assert!(was_sent, "{key} was never shown to {handle}");
                if let Some(object) = self.objects.get(key) {
                    sink.object_disappeared(handle, &object.snapshot);
                    disappeared += 1;
                }
            }
        }

        let mut appeared = 0;
        for handle in std::mem::take(&mut self.peers_with_sync_job) {
            let Some(peer) = self.peers.get_mut(&handle) else {
                continue;
            };
            peer.has_sync_job = false;
            for key in std::mem::take(&mut peer.appeared) {
                if let Some(object) = self.objects.get(key) {
                    peer.mark_sent(key);
                    sink.object_appeared(handle, &object.snapshot);
                    appeared += 1;
                }
            }
        }
        (disappeared, appeared)
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
