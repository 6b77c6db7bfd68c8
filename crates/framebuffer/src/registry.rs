//! Tile descriptor registry: the global grid, the ownership map, and the
//! owned-tile slots of this rank. Built once at construction and rebuilt
//! from scratch on a compositing-mode change; never mutated concurrently
//! afterwards.

use std::sync::Mutex;

use model::{ChannelMask, FrameMode, TileGridLayout, Vec2i};
use transport::{Rank, RankGroup};

use crate::modes::OwnedTile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TileDesc {
    pub origin: Vec2i,
    pub tile_id: usize,
    pub owner: Rank,
}

impl TileDesc {
    pub fn mine(&self, this: Rank) -> bool {
        self.owner == this
    }
}

pub(crate) struct TileRegistry {
    descs: Vec<TileDesc>,
    /// Indexed by tile id; `Some` only for tiles this rank owns. The lane
    /// pinning of the router keeps each mutex uncontended.
    owned: Vec<Option<Mutex<OwnedTile>>>,
    my_tile_ids: Vec<usize>,
}

impl TileRegistry {
    /// Round-robin ownership over the rendering ranks. With an idle master
    /// the modulus runs over workers only, so rank 0 holds zero tiles.
    pub fn owner_of(tile_id: usize, group: &RankGroup, master_is_worker: bool) -> Rank {
        if master_is_worker {
            Rank(tile_id % group.num_ranks())
        } else {
            group.worker_global_rank(tile_id % group.num_workers())
        }
    }

    pub fn build(
        layout: &TileGridLayout,
        group: &RankGroup,
        master_is_worker: bool,
        mode: FrameMode,
        channels: ChannelMask,
    ) -> Self {
        assert!(
            master_is_worker || group.num_ranks() > 1,
            "an idle master needs at least one worker rank to own tiles"
        );
        let has_variance =
            channels.contains(ChannelMask::ACCUM) && channels.contains(ChannelMask::VARIANCE);
        let has_aux =
            channels.contains(ChannelMask::NORMAL) || channels.contains(ChannelMask::ALBEDO);
        let num_parts = if master_is_worker {
            group.num_ranks()
        } else {
            group.num_workers()
        };
        let this = group.this_rank();
        let total = layout.total_tiles();
        let mut descs = Vec::with_capacity(total);
        let mut owned: Vec<Option<Mutex<OwnedTile>>> = Vec::with_capacity(total);
        let mut my_tile_ids = Vec::new();

        for tile_id in 0..total {
            let coord = layout
                .tile_coord(tile_id)
                .expect("tile id below total_tiles");
            let origin = layout.origin_of(coord);
            let owner = Self::owner_of(tile_id, group, master_is_worker);
            descs.push(TileDesc {
                origin,
                tile_id,
                owner,
            });
            if owner == this {
                my_tile_ids.push(tile_id);
                owned.push(Some(Mutex::new(OwnedTile::new(
                    mode,
                    origin,
                    tile_id,
                    layout.pixels_per_tile(),
                    has_variance,
                    has_aux,
                    num_parts,
                ))));
            } else {
                owned.push(None);
            }
        }

        Self {
            descs,
            owned,
            my_tile_ids,
        }
    }

    pub fn desc(&self, tile_id: usize) -> &TileDesc {
        &self.descs[tile_id]
    }

    pub fn owned(&self, tile_id: usize) -> Option<&Mutex<OwnedTile>> {
        self.owned[tile_id].as_ref()
    }

    pub fn my_tile_ids(&self) -> &[usize] {
        &self.my_tile_ids
    }

    pub fn my_tile_count(&self) -> usize {
        self.my_tile_ids.len()
    }

    pub fn total_tiles(&self) -> usize {
        self.descs.len()
    }
}
