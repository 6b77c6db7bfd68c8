//! Inbound message routing.
//!
//! `handle_incoming` runs on the transport's receiver thread and must not
//! block beyond enqueueing: it either parks the message in the delayed
//! queue (frame not active) or hands it to a worker lane. Lanes are
//! dedicated threads; a tile task always lands on lane `tile_id % lanes`,
//! which serializes processing per tile without per-tile locking in the
//! hot path.

use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::trace;
use model::PixelTile;
use transport::Message;

use crate::accum::AccumContext;
use crate::{lock, DistributedFrameBuffer};

type LaneTask = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct WorkLanes {
    senders: Vec<Sender<LaneTask>>,
    handles: Vec<std::thread::JoinHandle<()>>,
}

impl WorkLanes {
    pub fn new(lanes: usize) -> Self {
        assert!(lanes > 0, "router needs at least one lane");
        let mut senders = Vec::with_capacity(lanes);
        let mut handles = Vec::with_capacity(lanes);
        for lane in 0..lanes {
            let (sender, receiver): (Sender<LaneTask>, Receiver<LaneTask>) = unbounded();
            let handle = std::thread::Builder::new()
                .name(format!("tile-lane-{lane}"))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })
                .expect("failed to spawn router lane");
            senders.push(sender);
            handles.push(handle);
        }
        Self { senders, handles }
    }

    pub fn dispatch(&self, lane: usize, task: LaneTask) {
        let lane = lane % self.senders.len();
        self.senders[lane]
            .send(task)
            .unwrap_or_else(|_| panic!("router lane {lane} disconnected"));
    }
}

impl Drop for WorkLanes {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

impl DistributedFrameBuffer {
    /// Transport ingress. Snapshot `active` without the lock; when the
    /// frame is not active, re-check under the lock and buffer.
    pub(crate) fn handle_incoming(&self, message: Message) {
        if !self.frame_is_active() {
            let mut frame = lock(&self.frame, "frame state");
            if !self.frame_is_active() {
                trace!(
                    "{}: delaying {}-byte message until frame start",
                    self.group.this_rank(),
                    message.len()
                );
                frame.delayed.push(message);
                return;
            }
        }
        self.schedule_processing(message);
    }

    pub(crate) fn schedule_processing(&self, message: Message) {
        let me = self
            .self_ref
            .upgrade()
            .expect("framebuffer dropped while messages are in flight");

        let lane = match wire::peek_command(message.data()) {
            Ok(command) if command & wire::WORKER_WRITE_TILE != 0 => {
                let origin = wire::peek_worker_origin(message.data())
                    .unwrap_or_else(|err| panic!("malformed worker tile message: {err}"));
                let coord = self.layout.coord_of_origin(origin);
                self.layout
                    .tile_index(coord)
                    .unwrap_or_else(|err| panic!("worker tile origin {origin}: {err}"))
            }
            _ => 0,
        };

        let queued_at = Instant::now();
        self.lanes.dispatch(
            lane,
            Box::new(move || {
                let started_at = Instant::now();
                me.dispatch_message(&message);
                let finished_at = Instant::now();

                let mut stats = lock(&me.stats, "frame stats");
                stats.queue_times.push(started_at - queued_at);
                stats.work_times.push(finished_at - started_at);
            }),
        );
    }

    /// Decode the command bitmask and route. Master tile records never
    /// travel point-to-point; meeting one here is a protocol error.
    fn dispatch_message(&self, message: &Message) {
        let command = wire::peek_command(message.data())
            .unwrap_or_else(|err| panic!("malformed tile message: {err}"));

        if command & (wire::MASTER_WRITE_TILE_I8 | wire::MASTER_WRITE_TILE_F32) != 0 {
            panic!("master tile records travel only through the final gather");
        } else if command & wire::WORKER_WRITE_TILE != 0 {
            let mut tile =
                wire::decode_worker_tile(message.data(), self.layout.pixels_per_tile())
                    .unwrap_or_else(|err| panic!("malformed worker tile message: {err}"));
            if let Some(operator) = self.pixel_operator() {
                operator.pre_accum(&mut tile);
            }
            self.process_tile(tile);
        } else if command & wire::CANCEL_RENDERING != 0 {
            self.cancel.store(true, std::sync::atomic::Ordering::Release);
        } else {
            panic!("unknown tile message command {command:#x}");
        }
    }

    /// Apply one contribution to the owned tile it addresses; on tile
    /// completion, finalize and advance the frame counter.
    pub(crate) fn process_tile(&self, tile: PixelTile) {
        let coord = self.layout.coord_of_origin(tile.origin);
        let tile_id = self
            .layout
            .tile_index(coord)
            .unwrap_or_else(|err| panic!("tile origin {}: {err}", tile.origin));

        let registry = self.registry.read().expect("tile registry poisoned");
        let slot = registry.owned(tile_id).unwrap_or_else(|| {
            panic!(
                "{} received a contribution for tile {tile_id} it does not own",
                self.group.this_rank()
            )
        });

        let completed = {
            let mut owned = slot.lock().expect("owned tile poisoned");
            let ctx = AccumContext {
                accum_id: self.accum_ids[tile_id].load(std::sync::atomic::Ordering::Relaxed),
                has_accum: self.has_accum(),
                has_variance: self.has_variance(),
            };
            let done = owned.process(tile, ctx);
            if done {
                self.finalize_completed_tile(&mut owned);
            }
            done
        };
        drop(registry);

        if completed && self.is_frame_complete(1) {
            self.close_current_frame();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn lanes_run_tasks_in_dispatch_order() {
        let lanes = WorkLanes::new(1);
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..8 {
            let seen = seen.clone();
            lanes.dispatch(
                0,
                Box::new(move || seen.lock().expect("seen poisoned").push(i)),
            );
        }
        drop(lanes);
        assert_eq!(*seen.lock().expect("seen poisoned"), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn lane_selection_wraps_around() {
        let lanes = WorkLanes::new(3);
        let counter = Arc::new(AtomicUsize::new(0));
        for tile_id in 0..9 {
            let counter = counter.clone();
            lanes.dispatch(
                tile_id,
                Box::new(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        drop(lanes);
        assert_eq!(counter.load(Ordering::SeqCst), 9);
    }
}
