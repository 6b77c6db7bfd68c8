//! Per-owned-tile compositing state.
//!
//! Each owned tile carries its accumulation buffers plus one mode-specific
//! state machine. The contract is the same for all three modes: `new_frame`
//! resets per-frame state, `process` integrates one contribution and
//! reports completion, and the completed tile's `final_tile`/`color`/`error`
//! are then shipped by the owner.

use model::{ChannelMask, FrameMode, PixelTile, Vec2i};
use smallvec::SmallVec;

use crate::accum::{self, AccumContext};

/// Planar running-sum buffers with channels r, g, b, a, z.
#[derive(Debug)]
pub(crate) struct ChannelTile {
    pub r: Box<[f32]>,
    pub g: Box<[f32]>,
    pub b: Box<[f32]>,
    pub a: Box<[f32]>,
    pub z: Box<[f32]>,
}

impl ChannelTile {
    fn new(pixels: usize) -> Self {
        Self {
            r: vec![0.0; pixels].into_boxed_slice(),
            g: vec![0.0; pixels].into_boxed_slice(),
            b: vec![0.0; pixels].into_boxed_slice(),
            a: vec![0.0; pixels].into_boxed_slice(),
            z: vec![f32::INFINITY; pixels].into_boxed_slice(),
        }
    }

    pub fn clear_color(&mut self) {
        self.r.fill(0.0);
        self.g.fill(0.0);
        self.b.fill(0.0);
        self.a.fill(0.0);
    }
}

#[derive(Debug)]
pub struct AuxPlanes {
    pub nx: Box<[f32]>,
    pub ny: Box<[f32]>,
    pub nz: Box<[f32]>,
    pub ar: Box<[f32]>,
    pub ag: Box<[f32]>,
    pub ab: Box<[f32]>,
}

impl AuxPlanes {
    fn new(pixels: usize) -> Self {
        Self {
            nx: vec![0.0; pixels].into_boxed_slice(),
            ny: vec![0.0; pixels].into_boxed_slice(),
            nz: vec![0.0; pixels].into_boxed_slice(),
            ar: vec![0.0; pixels].into_boxed_slice(),
            ag: vec![0.0; pixels].into_boxed_slice(),
            ab: vec![0.0; pixels].into_boxed_slice(),
        }
    }
}

/// The normalized, post-processed tile that is ready to transmit.
#[derive(Debug)]
pub struct FinalTile {
    pub r: Box<[f32]>,
    pub g: Box<[f32]>,
    pub b: Box<[f32]>,
    pub a: Box<[f32]>,
    pub z: Box<[f32]>,
    pub aux: Option<AuxPlanes>,
}

impl FinalTile {
    fn new(pixels: usize, with_aux: bool) -> Self {
        Self {
            r: vec![0.0; pixels].into_boxed_slice(),
            g: vec![0.0; pixels].into_boxed_slice(),
            b: vec![0.0; pixels].into_boxed_slice(),
            a: vec![0.0; pixels].into_boxed_slice(),
            z: vec![f32::INFINITY; pixels].into_boxed_slice(),
            aux: with_aux.then(|| AuxPlanes::new(pixels)),
        }
    }
}

#[derive(Debug)]
enum ModeState {
    WriteMultiple {
        expected: i32,
        arrived: i32,
        /// The highest-instance contribution seen so far; authoritative
        /// once the expected count is in.
        staged: Option<PixelTile>,
    },
    AlphaBlend {
        expected: i32,
        fragments: SmallVec<[PixelTile; 4]>,
    },
    ZComposite {
        expected: usize,
        received: usize,
        reduced: Option<PixelTile>,
    },
}

#[derive(Debug)]
pub(crate) struct OwnedTile {
    pub origin: Vec2i,
    pub tile_id: usize,
    pub accum: ChannelTile,
    pub variance: Option<ChannelTile>,
    pub final_tile: FinalTile,
    /// Packed pixels in the negotiated output format; empty for format None.
    pub color: Vec<u8>,
    pub error: f32,
    mode: ModeState,
}

impl OwnedTile {
    pub fn new(
        mode: FrameMode,
        origin: Vec2i,
        tile_id: usize,
        pixels: usize,
        has_variance: bool,
        has_aux: bool,
        num_parts: usize,
    ) -> Self {
        let mode = match mode {
            FrameMode::WriteMultiple => ModeState::WriteMultiple {
                expected: 0,
                arrived: 0,
                staged: None,
            },
            FrameMode::AlphaBlend => ModeState::AlphaBlend {
                expected: 0,
                fragments: SmallVec::new(),
            },
            FrameMode::ZComposite => ModeState::ZComposite {
                expected: num_parts,
                received: 0,
                reduced: None,
            },
        };
        Self {
            origin,
            tile_id,
            accum: ChannelTile::new(pixels),
            variance: has_variance.then(|| ChannelTile::new(pixels)),
            final_tile: FinalTile::new(pixels, has_aux),
            color: Vec::new(),
            error: f32::INFINITY,
            mode,
        }
    }

    /// Reset per-frame state. `instances` is the per-frame usage count
    /// broadcast from the master before any tile of the frame is processed.
    pub fn new_frame(&mut self, instances: i32) {
        match &mut self.mode {
            ModeState::WriteMultiple {
                expected,
                arrived,
                staged,
            } => {
                *expected = instances;
                *arrived = 0;
                *staged = None;
            }
            ModeState::AlphaBlend {
                expected,
                fragments,
            } => {
                *expected = instances;
                fragments.clear();
            }
            ModeState::ZComposite {
                received, reduced, ..
            } => {
                *received = 0;
                *reduced = None;
            }
        }
    }

    /// Integrate one contribution. Returns true when this contribution
    /// completed the tile; the accumulation buffers, `final_tile` and
    /// `error` are then up to date.
    pub fn process(&mut self, tile: PixelTile, ctx: AccumContext) -> bool {
        let ready = match &mut self.mode {
            ModeState::WriteMultiple {
                expected,
                arrived,
                staged,
            } => {
                *arrived += 1;
                let supersedes = staged
                    .as_ref()
                    .map_or(true, |s| tile.instance_id >= s.instance_id);
                if supersedes {
                    *staged = Some(tile);
                }
                if *arrived >= (*expected).max(1) {
                    staged.take()
                } else {
                    None
                }
            }
            ModeState::AlphaBlend {
                expected,
                fragments,
            } => {
                fragments.push(tile);
                if fragments.len() as i32 >= (*expected).max(1) {
                    let taken = std::mem::take(fragments);
                    Some(accum::blend_fragments(taken.into_vec()))
                } else {
                    None
                }
            }
            ModeState::ZComposite {
                expected,
                received,
                reduced,
            } => {
                *received += 1;
                match reduced {
                    None => *reduced = Some(tile),
                    Some(current) => accum::z_reduce(current, &tile),
                }
                if *received >= (*expected).max(1) {
                    reduced.take()
                } else {
                    None
                }
            }
        };

        match ready {
            Some(contribution) => {
                accum::integrate(self, &contribution, ctx);
                true
            }
            None => false,
        }
    }

    /// Per-channel clear, following the accumulation semantics: clearing
    /// ACCUM also clears the variance buffer and resets the tile error.
    pub fn clear(&mut self, mask: ChannelMask, has_accum: bool, has_depth: bool) {
        if has_accum && mask.contains(ChannelMask::ACCUM) {
            self.accum.clear_color();
            self.accum.z.fill(f32::INFINITY);
            if let Some(variance) = &mut self.variance {
                variance.clear_color();
            }
            self.error = f32::INFINITY;
        }
        if has_depth && mask.contains(ChannelMask::DEPTH) {
            self.final_tile.z.fill(f32::INFINITY);
        }
        if mask.contains(ChannelMask::COLOR) {
            self.final_tile.r.fill(0.0);
            self.final_tile.g.fill(0.0);
            self.final_tile.b.fill(0.0);
            self.final_tile.a.fill(0.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_tile(value: f32, instance_id: i32, pixels: usize) -> PixelTile {
        let mut tile = PixelTile::zeroed(Vec2i::new(0, 0), pixels);
        tile.instance_id = instance_id;
        tile.r.fill(value);
        tile.g.fill(value);
        tile.b.fill(value);
        tile.a.fill(1.0);
        tile.z.fill(0.5);
        tile
    }

    fn plain_ctx() -> AccumContext {
        AccumContext {
            accum_id: 0,
            has_accum: false,
            has_variance: false,
        }
    }

    #[test]
    fn write_multiple_takes_the_highest_instance() {
        let mut owned = OwnedTile::new(FrameMode::WriteMultiple, Vec2i::new(0, 0), 0, 4, false, false, 0);
        owned.new_frame(3);

        // arrival order B, A, C with C carrying the highest instance id
        assert!(!owned.process(flat_tile(0.25, 1, 4), plain_ctx()));
        assert!(!owned.process(flat_tile(0.5, 2, 4), plain_ctx()));
        assert!(owned.process(flat_tile(0.75, 3, 4), plain_ctx()));
        assert_eq!(owned.final_tile.r[0], 0.75);
    }

    #[test]
    fn write_multiple_is_arrival_order_independent() {
        let mut owned = OwnedTile::new(FrameMode::WriteMultiple, Vec2i::new(0, 0), 0, 4, false, false, 0);
        owned.new_frame(3);

        // the highest instance arrives first; later, lower instances must
        // not displace it
        assert!(!owned.process(flat_tile(0.75, 3, 4), plain_ctx()));
        assert!(!owned.process(flat_tile(0.25, 1, 4), plain_ctx()));
        assert!(owned.process(flat_tile(0.5, 2, 4), plain_ctx()));
        assert_eq!(owned.final_tile.r[0], 0.75);
    }

    #[test]
    fn write_multiple_single_instance_completes_immediately() {
        let mut owned = OwnedTile::new(FrameMode::WriteMultiple, Vec2i::new(0, 0), 0, 4, false, false, 0);
        owned.new_frame(0);
        assert!(owned.process(flat_tile(0.1, 0, 4), plain_ctx()));
    }

    #[test]
    fn alpha_blend_sorts_by_depth_before_compositing() {
        let mut owned = OwnedTile::new(FrameMode::AlphaBlend, Vec2i::new(0, 0), 0, 1, false, false, 0);
        owned.new_frame(2);

        // back fragment arrives first; the front one must still win where
        // it is opaque
        let mut back = flat_tile(1.0, 0, 1);
        back.z.fill(2.0);
        back.a.fill(1.0);
        back.r.fill(1.0);
        back.g.fill(0.0);
        back.b.fill(0.0);

        let mut front = flat_tile(1.0, 0, 1);
        front.z.fill(1.0);
        front.a.fill(1.0);
        front.r.fill(0.0);
        front.g.fill(1.0);
        front.b.fill(0.0);

        assert!(!owned.process(back, plain_ctx()));
        assert!(owned.process(front, plain_ctx()));
        assert_eq!(owned.final_tile.r[0], 0.0);
        assert_eq!(owned.final_tile.g[0], 1.0);
        assert_eq!(owned.final_tile.z[0], 1.0);
    }

    #[test]
    fn alpha_blend_accumulates_translucency_front_to_back() {
        let mut owned = OwnedTile::new(FrameMode::AlphaBlend, Vec2i::new(0, 0), 0, 1, false, false, 0);
        owned.new_frame(2);

        // premultiplied half-transparent red over opaque blue
        let mut front = flat_tile(0.0, 0, 1);
        front.z.fill(0.5);
        front.r.fill(0.5);
        front.a.fill(0.5);

        let mut back = flat_tile(0.0, 0, 1);
        back.z.fill(1.5);
        back.b.fill(1.0);
        back.a.fill(1.0);

        assert!(!owned.process(front, plain_ctx()));
        assert!(owned.process(back, plain_ctx()));
        assert_eq!(owned.final_tile.r[0], 0.5);
        assert_eq!(owned.final_tile.b[0], 0.5);
        assert_eq!(owned.final_tile.a[0], 1.0);
    }

    #[test]
    fn z_composite_keeps_the_nearest_sample() {
        let mut owned = OwnedTile::new(FrameMode::ZComposite, Vec2i::new(0, 0), 0, 2, false, false, 2);
        owned.new_frame(0);

        let mut near = flat_tile(0.25, 0, 2);
        near.z.fill(0.4);
        let mut far = flat_tile(0.75, 0, 2);
        far.z.fill(0.8);

        assert!(!owned.process(far, plain_ctx()));
        assert!(owned.process(near, plain_ctx()));
        assert_eq!(owned.final_tile.z[0], 0.4);
        assert_eq!(owned.final_tile.r[0], 0.25);
    }

    #[test]
    fn clear_resets_requested_channels_only() {
        let mut owned = OwnedTile::new(FrameMode::WriteMultiple, Vec2i::new(0, 0), 0, 2, true, false, 0);
        owned.accum.r.fill(3.0);
        owned.final_tile.r.fill(0.5);
        owned.final_tile.z.fill(0.25);
        owned.error = 0.1;

        owned.clear(ChannelMask::ACCUM, true, true);
        assert_eq!(owned.accum.r[0], 0.0);
        assert!(owned.error.is_infinite());
        // color and depth untouched
        assert_eq!(owned.final_tile.r[0], 0.5);
        assert_eq!(owned.final_tile.z[0], 0.25);

        owned.clear(ChannelMask::COLOR | ChannelMask::DEPTH, true, true);
        assert_eq!(owned.final_tile.r[0], 0.0);
        assert!(owned.final_tile.z[0].is_infinite());
    }
}
