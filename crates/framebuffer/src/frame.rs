//! Frame lifecycle: clear, begin, start (arm the router), completion
//! counting, close, wait + gather hand-off, end.
//!
//! `start_new_frame` holds the frame and completion mutexes across the
//! collective setup; `active` flips to true as the very last step so the
//! router cannot apply a contribution before the per-frame state is ready.

use std::sync::atomic::Ordering;
use std::time::Instant;

use log::debug;
use model::{ChannelMask, FrameMode, PixelTile, TileCoord};
use rayon::prelude::*;
use transport::Message;
use wire::MasterTileWriter;

use crate::modes::OwnedTile;
use crate::registry::TileRegistry;
use crate::{accum, lock, DistributedFrameBuffer, FrameError};

impl DistributedFrameBuffer {
    /// Zero the requested channels of every owned tile. Clearing ACCUM
    /// also resets the accumulation ids and the error region; the frame id
    /// restarts and is advanced again by `begin_frame`.
    pub fn clear(&self, mask: ChannelMask) {
        self.frame_id.store(-1, Ordering::Relaxed);

        let registry = self.registry.read().expect("tile registry poisoned");
        let has_accum = self.has_accum();
        let has_depth = self.has_depth();
        registry.my_tile_ids().par_iter().for_each(|&tile_id| {
            let mut owned = registry
                .owned(tile_id)
                .expect("owned id points at an owned tile")
                .lock()
                .expect("owned tile poisoned");
            owned.clear(mask, has_accum, has_depth);
        });

        if has_accum && mask.contains(ChannelMask::ACCUM) {
            for accum_id in &self.accum_ids {
                accum_id.store(0, Ordering::Relaxed);
            }
            lock(&self.error_region, "error region").clear();
        }
    }

    /// Reset the cancel flag and advance the frame id.
    pub fn begin_frame(&self) {
        self.cancel.store(false, Ordering::Release);
        self.frame_id.fetch_add(1, Ordering::Relaxed);
    }

    /// Arm the frame: collective setup, per-tile reset, converged
    /// pre-count, then `active = true` and the delayed-queue replay.
    pub fn start_new_frame(&self, error_threshold: f32) -> Result<(), FrameError> {
        lock(&self.stats, "frame stats").clear_task_samples();
        self.next_gather_offset.store(0, Ordering::Relaxed);

        if self.color_format != model::PixelFormat::None {
            let bytes = self.my_tile_count() * self.wire_tile_bytes();
            let mut buffer = lock(&self.gather_buffer, "gather buffer");
            buffer.clear();
            buffer.resize(bytes, 0);
        }

        let replay: Vec<Message>;
        {
            let mut frame = lock(&self.frame, "frame state");
            let mut completed = lock(&self.completed, "completion count");

            if self.frame_is_active() {
                panic!("attempt to start a new frame while the current frame is active");
            }
            debug!("{} starting new frame", self.group.this_rank());

            if let Some(operator) = self.pixel_operator() {
                operator.begin_frame();
            }

            replay = std::mem::take(&mut frame.delayed);

            // both broadcasts must finish before any tile of this frame is
            // processed; new_frame below consumes the instance counts
            lock(&self.error_region, "error region").sync(self.transport.as_ref())?;
            let mut counts: Vec<i32> = self
                .instances
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect();
            self.transport
                .bcast_i32(self.group.master(), &mut counts)?;
            for (slot, value) in self.instances.iter().zip(&counts) {
                slot.store(*value, Ordering::Relaxed);
            }

            if self.color_format == model::PixelFormat::None {
                let mut pending = lock(&self.pending_errors, "pending tile errors");
                pending.ids.clear();
                pending.errors.clear();
                let my_tiles = self.my_tile_count();
                pending.ids.reserve(my_tiles);
                pending.errors.reserve(my_tiles);
            }

            let registry = self.registry.read().expect("tile registry poisoned");
            for &tile_id in registry.my_tile_ids() {
                let instances = self.instances[tile_id].load(Ordering::Relaxed);
                registry
                    .owned(tile_id)
                    .expect("owned id points at an owned tile")
                    .lock()
                    .expect("owned tile poisoned")
                    .new_frame(instances);
            }

            *completed = 0;
            if self.has_accum() {
                let region = lock(&self.error_region, "error region");
                let idle_master = self.is_idle_master();
                for tile_id in 0..self.layout.total_tiles() {
                    let desc = registry.desc(tile_id);
                    let tracked = desc.mine(self.group.this_rank()) || idle_master;
                    if !tracked {
                        continue;
                    }
                    let coord = self.layout.coord_of_origin(desc.origin);
                    if region.get(coord) <= error_threshold {
                        *completed += 1;
                    }
                }
            }

            frame.done = false;
            // the router reads this flag without the lock; it must flip
            // after all per-frame state above is in place
            self.active.store(true, Ordering::Release);
        }

        for message in replay {
            self.schedule_processing(message);
        }

        if self.is_frame_complete(0) {
            self.close_current_frame();
        }
        Ok(())
    }

    /// Add `delta` completed tiles and report whether this rank's target
    /// is reached. Rendering ranks wait for their owned tiles; the idle
    /// master tracks the whole image.
    pub(crate) fn is_frame_complete(&self, delta: usize) -> bool {
        let mut completed = lock(&self.completed, "completion count");
        *completed += delta;
        *completed == self.expected_tile_count()
    }

    fn expected_tile_count(&self) -> usize {
        if self.is_idle_master() {
            self.layout.total_tiles()
        } else {
            self.my_tile_count()
        }
    }

    /// Close the frame: deactivate the router and wake the waiter.
    /// Idempotent within a frame; the state transition carries it.
    pub(crate) fn close_current_frame(&self) {
        let mut frame = lock(&self.frame, "frame state");
        debug!("{} closes the frame", self.group.this_rank());
        self.active.store(false, Ordering::Release);
        frame.done = true;
        self.frame_done_cv.notify_all();
    }

    /// Block until the frame is done, then run the end-of-frame gather
    /// matching the configuration: color tiles, error-only records, or a
    /// bare barrier.
    pub fn wait_until_finished(&self) -> Result<(), FrameError> {
        let wait_started = Instant::now();
        {
            let mut frame = lock(&self.frame, "frame state");
            while !frame.done {
                frame = self
                    .frame_done_cv
                    .wait(frame)
                    .expect("frame state poisoned");
            }
        }
        lock(&self.stats, "frame stats").wait_frame = wait_started.elapsed();

        if self.color_format != model::PixelFormat::None {
            self.gather_final_tiles()
        } else if self.has_variance() {
            self.gather_final_errors()
        } else {
            self.transport.barrier()?;
            Ok(())
        }
    }

    /// Finish the frame: run the operator hook, reset per-frame instance
    /// counts, advance every accumulation id, and return the refined
    /// image error (master only; workers learn it at the next sync).
    pub fn end_frame(&self, error_threshold: f32) -> f32 {
        if !self.is_idle_master() {
            if let Some(operator) = self.pixel_operator() {
                operator.end_frame();
            }
        }

        for instance in &self.instances {
            instance.store(0, Ordering::Relaxed);
        }
        for accum_id in &self.accum_ids {
            accum_id.fetch_add(1, Ordering::Relaxed);
        }

        if self.group.is_master() {
            lock(&self.error_region, "error region").refine(error_threshold)
        } else {
            f32::INFINITY
        }
    }

    /// Ingress from the renderer: local tiles are processed on the calling
    /// thread, remote ones are shipped to their owner.
    pub fn set_tile(&self, tile: PixelTile) -> Result<(), FrameError> {
        assert!(
            tile.planes_consistent() && tile.pixels() == self.layout.pixels_per_tile(),
            "tile at {} does not match the {}-pixel tile layout",
            tile.origin,
            self.layout.pixels_per_tile()
        );

        let coord = self.layout.coord_of_origin(tile.origin);
        let tile_id = self
            .layout
            .tile_index(coord)
            .unwrap_or_else(|err| panic!("tile origin {}: {err}", tile.origin));

        let desc = {
            let registry = self.registry.read().expect("tile registry poisoned");
            *registry.desc(tile_id)
        };

        if !desc.mine(self.group.this_rank()) {
            let message = Message::new(wire::encode_worker_tile(&tile));
            self.transport.send_to(desc.owner, message)?;
            return Ok(());
        }

        if !self.frame_is_active() {
            panic!("cannot set a tile while the frame is inactive");
        }
        self.process_tile(tile);
        Ok(())
    }

    /// Recreate every tile in a new compositing mode; a no-op when the
    /// mode is unchanged.
    pub fn set_frame_mode(&self, mode: FrameMode) {
        let mut current = lock(&self.frame_mode, "frame mode");
        if *current == mode {
            return;
        }
        if self.frame_is_active() {
            panic!("cannot switch compositing mode while a frame is active");
        }
        *current = mode;
        let mut registry = self.registry.write().expect("tile registry poisoned");
        *registry = TileRegistry::build(
            &self.layout,
            &self.group,
            self.master_is_worker,
            mode,
            self.channels,
        );
    }

    /// Accumulation id of a tile; the query also registers one per-frame
    /// usage of the tile, which the master broadcasts as the expected
    /// contribution count at the next frame start.
    pub fn accum_id(&self, tile: TileCoord) -> i32 {
        if !self.has_accum() {
            return 0;
        }
        let tile_id = self
            .layout
            .tile_index(tile)
            .unwrap_or_else(|err| panic!("tile coordinate ({}, {}): {err}", tile.x, tile.y));
        self.instances[tile_id].fetch_add(1, Ordering::Relaxed);
        self.accum_ids[tile_id].load(Ordering::Relaxed)
    }

    pub fn tile_error(&self, tile: TileCoord) -> f32 {
        lock(&self.error_region, "error region").get(tile)
    }

    /// Whether the tile's coarse error cell was pruned by refinement;
    /// converged regions need no further rendering work.
    pub fn region_converged(&self, tile: TileCoord) -> bool {
        lock(&self.error_region, "error region").cell_converged(tile)
    }

    /// Fan a cancel request out to every rank, point-to-point; the
    /// transport multiplexes live traffic, so a broadcast is off-limits.
    pub fn request_cancel(&self) -> Result<(), FrameError> {
        for rank in 0..self.group.num_ranks() {
            self.transport
                .send_to(transport::Rank(rank), Message::new(wire::encode_cancel()))?;
        }
        Ok(())
    }

    /// Pack the completed tile and stage it for the gather: a master tile
    /// record in the gather buffer, or an id/error pair when no pixels
    /// ship back.
    pub(crate) fn finalize_completed_tile(&self, owned: &mut OwnedTile) {
        debug!(
            "{} completed tile {} at {}",
            self.group.this_rank(),
            owned.tile_id,
            owned.origin
        );
        if let Some(operator) = self.pixel_operator() {
            operator.post_accum(&mut owned.final_tile);
        }

        if self.color_format == model::PixelFormat::None {
            let coord = self.layout.coord_of_origin(owned.origin);
            let mut pending = lock(&self.pending_errors, "pending tile errors");
            pending.ids.push(coord);
            pending.errors.push(owned.error);
            return;
        }

        accum::pack_color(&owned.final_tile, self.color_format, &mut owned.color);

        let record_bytes = self.wire_tile_bytes();
        let offset = self
            .next_gather_offset
            .fetch_add(record_bytes, Ordering::Relaxed);
        let mut buffer = lock(&self.gather_buffer, "gather buffer");
        let slot = &mut buffer[offset..offset + record_bytes];
        let mut writer = MasterTileWriter::new(
            slot,
            self.color_format,
            self.has_depth(),
            self.has_normal(),
            self.has_albedo(),
            self.layout.tile_size(),
            owned.origin,
            owned.error,
        );
        writer.set_color(&owned.color);
        writer.set_depth(&owned.final_tile.z);
        if let Some(aux) = &owned.final_tile.aux {
            writer.set_normal(&aux.nx, &aux.ny, &aux.nz);
            writer.set_albedo(&aux.ar, &aux.ag, &aux.ab);
        }
    }
}
