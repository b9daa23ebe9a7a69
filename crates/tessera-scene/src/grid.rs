//! Fixed square grid of interest cells plus one outer cell for everything
//! outside it.

use glam::Vec2;
use tessera_multiplayer::PeerHandle;

use crate::object::GameObjectKey;

/// Index of a cell in its [`Grid`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellIndex(u32);

/// One spatial bucket.
///
/// The `added_*`/`removed_*` lists only hold entries while a synchronization
/// pass is running.
#[derive(Debug, Default)]
pub struct GridCell {
    pub(crate) objects: Vec<GameObjectKey>,
    pub(crate) active_peers: Vec<PeerHandle>,
    pub(crate) added_objects: Vec<GameObjectKey>,
    pub(crate) removed_objects: Vec<GameObjectKey>,
    pub(crate) added_peers: Vec<PeerHandle>,
    pub(crate) removed_peers: Vec<PeerHandle>,
    pub(crate) has_job: bool,
}

impl GridCell {
    /// Objects currently bucketed here.
    pub fn objects(&self) -> &[GameObjectKey] {
        &self.objects
    }

    /// Peers whose neighbourhood includes this cell.
    pub fn active_peers(&self) -> &[PeerHandle] {
        &self.active_peers
    }

    pub fn has_job(&self) -> bool {
        self.has_job
    }
}

pub struct Grid {
    size: u32,
    cell_length: f32,
    cells: Vec<GridCell>,
}

impl Grid {
    /// Allocate `size × size` cells of side `cell_length`, plus the outer cell.
    pub fn new(size: u32, cell_length: f32) -> Self {
        debug_assert!(size > 0, "grid needs at least one cell");
        debug_assert!(cell_length > 0.0, "cell length must be positive");
        let count = size as usize * size as usize + 1;
        Self {
            size,
            cell_length,
            cells: (0..count).map(|_| GridCell::default()).collect(),
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn cell_length(&self) -> f32 {
        self.cell_length
    }

    pub fn outer(&self) -> CellIndex {
        CellIndex(self.size * self.size)
    }

    pub fn is_outer(&self, cell: CellIndex) -> bool {
        cell == self.outer()
    }

    /// The cell at grid coordinates `(x, y)`; the outer cell when out of range.
    pub fn cell(&self, x: i64, y: i64) -> CellIndex {
        let size = i64::from(self.size);
        if !(0..size).contains(&x) || !(0..size).contains(&y) {
            return self.outer();
        }
        CellIndex((y * size + x) as u32)
    }

    /// The cell containing `position`.
    pub fn cell_at(&self, position: Vec2) -> CellIndex {
        let x = (position.x / self.cell_length).floor();
        let y = (position.y / self.cell_length).floor();
        if !x.is_finite() || !y.is_finite() {
            return self.outer();
        }
        self.cell(x as i64, y as i64)
    }

    /// Grid coordinates of `cell`, `None` for the outer cell.
    pub fn coords(&self, cell: CellIndex) -> Option<(u32, u32)> {
        if self.is_outer(cell) {
            return None;
        }
        Some((cell.0 % self.size, cell.0 / self.size))
    }

    /// The 3×3 neighbourhood around `center`, without duplicates.
    ///
    /// The outer cell's neighbourhood is just itself; no center means an
    /// empty neighbourhood.
    pub fn cells_around(&self, center: Option<CellIndex>) -> Vec<CellIndex> {
        let Some(center) = center else {
            return Vec::new();
        };
        let Some((cx, cy)) = self.coords(center) else {
            return vec![center];
        };

        let mut cells = Vec::with_capacity(9);
        for dy in -1..=1 {
            for dx in -1..=1 {
                let cell = self.cell(i64::from(cx) + dx, i64::from(cy) + dy);
                if !cells.contains(&cell) {
                    cells.push(cell);
                }
            }
        }
        cells
    }

    pub fn get(&self, cell: CellIndex) -> &GridCell {
        &self.cells[cell.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, cell: CellIndex) -> &mut GridCell {
        &mut self.cells[cell.0 as usize]
    }
}

/// Cells in `old` but not `new`, then cells in `new` but not `old`.
pub fn diff_neighbourhoods(old: &[CellIndex], new: &[CellIndex]) -> (Vec<CellIndex>, Vec<CellIndex>) {
    let removed = old.iter().filter(|c| !new.contains(c)).copied().collect();
    let added = new.iter().filter(|c| !old.contains(c)).copied().collect();
    (removed, added)
}
