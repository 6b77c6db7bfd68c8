//! Per-tile error tracking with hierarchical refinement.
//!
//! A fine grid holds one error per tile; a coarse overlay of 4x4-tile cells
//! averages its children and marks converged cells so later refinement
//! passes skip them. The master owns the authoritative grid; workers get a
//! copy through `sync` at the start of every frame.

use bitvec::prelude::{BitVec, Lsb0};
use model::TileCoord;
use transport::{Transport, TransportError};

/// Tiles per coarse overlay cell, along each axis.
const CELL_TILES: u32 = 4;

#[derive(Debug)]
pub(crate) struct ErrorRegion {
    tiles_x: u32,
    tiles_y: u32,
    errors: Vec<f32>,
    cells_x: u32,
    converged: BitVec<usize, Lsb0>,
}

impl ErrorRegion {
    /// Pass a zero-sized grid when no variance buffer is configured; every
    /// operation degenerates to a no-op and reads return unknown.
    pub fn new(tiles_x: u32, tiles_y: u32) -> Self {
        let tiles = tiles_x as usize * tiles_y as usize;
        let cells_x = tiles_x.div_ceil(CELL_TILES);
        let cells_y = tiles_y.div_ceil(CELL_TILES);
        Self {
            tiles_x,
            tiles_y,
            errors: vec![f32::INFINITY; tiles],
            cells_x,
            converged: BitVec::repeat(false, cells_x as usize * cells_y as usize),
        }
    }

    pub fn enabled(&self) -> bool {
        !self.errors.is_empty()
    }

    fn tile_index(&self, tile: TileCoord) -> Option<usize> {
        if tile.x >= self.tiles_x || tile.y >= self.tiles_y {
            None
        } else {
            Some((tile.y * self.tiles_x + tile.x) as usize)
        }
    }

    fn cell_index(&self, tile: TileCoord) -> usize {
        let cx = tile.x / CELL_TILES;
        let cy = tile.y / CELL_TILES;
        (cy * self.cells_x + cx) as usize
    }

    pub fn get(&self, tile: TileCoord) -> f32 {
        match self.tile_index(tile) {
            Some(index) => self.errors[index],
            None => f32::INFINITY,
        }
    }

    /// Records a fresh error estimate. Unknown (non-finite) estimates are
    /// ignored so a stale finite value is never overwritten by `+inf`.
    pub fn update(&mut self, tile: TileCoord, error: f32) {
        if !error.is_finite() {
            return;
        }
        if let Some(index) = self.tile_index(tile) {
            self.errors[index] = error;
        }
    }

    pub fn cell_converged(&self, tile: TileCoord) -> bool {
        if !self.enabled() || self.tile_index(tile).is_none() {
            return false;
        }
        self.converged[self.cell_index(tile)]
    }

    /// Marks every coarse cell whose child average is at or below
    /// `threshold` as converged, then returns the image-level maximum
    /// error. Converged cells stay pruned until `clear`.
    pub fn refine(&mut self, threshold: f32) -> f32 {
        if !self.enabled() {
            return f32::INFINITY;
        }

        let cells_y = self.tiles_y.div_ceil(CELL_TILES);
        for cy in 0..cells_y {
            for cx in 0..self.cells_x {
                let cell = (cy * self.cells_x + cx) as usize;
                if self.converged[cell] {
                    continue;
                }
                let mut sum = 0.0f32;
                let mut children = 0u32;
                for ty in cy * CELL_TILES..((cy + 1) * CELL_TILES).min(self.tiles_y) {
                    for tx in cx * CELL_TILES..((cx + 1) * CELL_TILES).min(self.tiles_x) {
                        sum += self.errors[(ty * self.tiles_x + tx) as usize];
                        children += 1;
                    }
                }
                if children > 0 && sum / children as f32 <= threshold {
                    self.converged.set(cell, true);
                }
            }
        }

        self.errors
            .iter()
            .fold(f32::NEG_INFINITY, |acc, &e| acc.max(e))
    }

    /// Broadcast the fine grid from the master so every rank starts the
    /// frame with the same view of converged tiles.
    pub fn sync(&mut self, transport: &dyn Transport) -> Result<(), TransportError> {
        if !self.enabled() {
            return Ok(());
        }
        let root = transport.group().master();
        transport.bcast_f32(root, &mut self.errors)
    }

    pub fn clear(&mut self) {
        self.errors.fill(f32::INFINITY);
        self.converged.fill(false);
    }
}
