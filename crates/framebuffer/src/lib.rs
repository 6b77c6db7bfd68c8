//! Distributed tile framebuffer.
//!
//! Aggregates per-tile rendering results produced across many ranks into
//! one coherent image on the master, while letting every rank own a
//! disjoint subset of tiles and receive partial contributions from peers.
//! The frame lifecycle is `clear` -> `begin_frame` -> `start_new_frame` ->
//! contributions via `set_tile` / the router -> `wait_until_finished`
//! (collective gather) -> `end_frame`.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, RwLock, Weak};

use model::{
    ChannelMask, FrameMode, PixelFormat, PixelTile, TileCoord, TileGridLayout, Vec2i, TILE_SIZE,
};
use transport::{Message, MessageHandler, RankGroup, Transport, TransportError};

mod accum;
mod error_region;
mod frame;
mod gather;
mod local_image;
mod modes;
mod registry;
mod router;
mod stats;

pub use modes::{AuxPlanes, FinalTile};

use error_region::ErrorRegion;
use local_image::LocalImage;
use registry::TileRegistry;
use router::WorkLanes;
use stats::FrameStats;

#[derive(Debug)]
pub enum FrameError {
    Transport(TransportError),
    Io(io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameError::Transport(err) => write!(formatter, "transport fault: {err}"),
            FrameError::Io(err) => write!(formatter, "timing report failed: {err}"),
        }
    }
}

impl std::error::Error for FrameError {}

impl From<TransportError> for FrameError {
    fn from(err: TransportError) -> Self {
        FrameError::Transport(err)
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        FrameError::Io(err)
    }
}

/// Host-installed pixel post-processing hooks. `pre_accum` runs on the
/// owner for contributions arriving over the wire, `post_accum` on every
/// completed tile before it is packed and shipped.
pub trait PixelOperator: Send + Sync {
    fn begin_frame(&self) {}
    fn pre_accum(&self, _tile: &mut PixelTile) {}
    fn post_accum(&self, _tile: &mut FinalTile) {}
    fn end_frame(&self) {}
}

/// Construction parameters of a framebuffer instance.
#[derive(Debug, Clone, Copy)]
pub struct FrameBufferDesc {
    pub image_size: Vec2i,
    pub tile_size: u32,
    pub color_format: PixelFormat,
    pub channels: ChannelMask,
    /// When false, rank 0 owns no tiles and only assembles the image.
    pub master_is_worker: bool,
    pub router_lanes: usize,
}

impl FrameBufferDesc {
    pub fn new(image_size: Vec2i, color_format: PixelFormat, channels: ChannelMask) -> Self {
        Self {
            image_size,
            tile_size: TILE_SIZE,
            color_format,
            channels,
            master_is_worker: false,
            router_lanes: default_router_lanes(),
        }
    }
}

fn default_router_lanes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
        .min(8)
}

pub(crate) struct FrameState {
    pub done: bool,
    /// Messages that arrived while no frame was active, in arrival order.
    pub delayed: Vec<Message>,
}

pub(crate) struct PendingErrors {
    pub ids: Vec<TileCoord>,
    pub errors: Vec<f32>,
}

pub struct DistributedFrameBuffer {
    pub(crate) self_ref: Weak<DistributedFrameBuffer>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) group: RankGroup,
    pub(crate) layout: TileGridLayout,
    pub(crate) color_format: PixelFormat,
    pub(crate) channels: ChannelMask,
    pub(crate) master_is_worker: bool,

    pub(crate) registry: RwLock<TileRegistry>,
    pub(crate) frame_mode: Mutex<FrameMode>,
    pub(crate) accum_ids: Vec<AtomicI32>,
    pub(crate) instances: Vec<AtomicI32>,
    pub(crate) error_region: Mutex<ErrorRegion>,
    pub(crate) local_image: Option<Mutex<LocalImage>>,

    pub(crate) frame: Mutex<FrameState>,
    pub(crate) frame_done_cv: Condvar,
    pub(crate) active: AtomicBool,
    pub(crate) frame_id: AtomicI32,
    pub(crate) completed: Mutex<usize>,

    pub(crate) gather_buffer: Mutex<Vec<u8>>,
    pub(crate) next_gather_offset: AtomicUsize,
    pub(crate) pending_errors: Mutex<PendingErrors>,

    pub(crate) cancel: AtomicBool,
    pub(crate) pixel_op: Mutex<Option<Arc<dyn PixelOperator>>>,
    pub(crate) stats: Mutex<FrameStats>,
    pub(crate) lanes: WorkLanes,
}

impl DistributedFrameBuffer {
    /// Builds the framebuffer on this rank and registers it as the
    /// transport's message handler. Tiles start in write-multiple mode.
    pub fn new(desc: FrameBufferDesc, transport: Arc<dyn Transport>) -> Arc<Self> {
        let group = transport.group();
        let layout = TileGridLayout::new(desc.image_size, desc.tile_size);
        let total = layout.total_tiles();
        let mode = FrameMode::WriteMultiple;

        let has_variance = desc.channels.contains(ChannelMask::ACCUM)
            && desc.channels.contains(ChannelMask::VARIANCE);
        let error_region = if has_variance {
            ErrorRegion::new(layout.tiles_x(), layout.tiles_y())
        } else {
            ErrorRegion::new(0, 0)
        };

        let local_image = (group.is_master() && desc.color_format != PixelFormat::None).then(|| {
            // the mappable copy carries no accumulation state
            Mutex::new(LocalImage::new(layout, desc.color_format, desc.channels))
        });

        let fb = Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            transport: transport.clone(),
            group,
            layout,
            color_format: desc.color_format,
            channels: desc.channels,
            master_is_worker: desc.master_is_worker,
            registry: RwLock::new(TileRegistry::build(
                &layout,
                &group,
                desc.master_is_worker,
                mode,
                desc.channels,
            )),
            frame_mode: Mutex::new(mode),
            accum_ids: (0..total).map(|_| AtomicI32::new(0)).collect(),
            instances: (0..total).map(|_| AtomicI32::new(0)).collect(),
            error_region: Mutex::new(error_region),
            local_image,
            frame: Mutex::new(FrameState {
                done: false,
                delayed: Vec::new(),
            }),
            frame_done_cv: Condvar::new(),
            active: AtomicBool::new(false),
            frame_id: AtomicI32::new(-1),
            completed: Mutex::new(0),
            gather_buffer: Mutex::new(Vec::new()),
            next_gather_offset: AtomicUsize::new(0),
            pending_errors: Mutex::new(PendingErrors {
                ids: Vec::new(),
                errors: Vec::new(),
            }),
            cancel: AtomicBool::new(false),
            pixel_op: Mutex::new(None),
            stats: Mutex::new(FrameStats::default()),
            lanes: WorkLanes::new(desc.router_lanes),
        });
        transport.set_handler(fb.clone());
        fb
    }

    pub fn layout(&self) -> &TileGridLayout {
        &self.layout
    }

    pub fn color_format(&self) -> PixelFormat {
        self.color_format
    }

    pub fn frame_mode(&self) -> FrameMode {
        *lock(&self.frame_mode, "frame mode")
    }

    pub fn frame_id(&self) -> i32 {
        self.frame_id.load(Ordering::Relaxed)
    }

    pub fn my_tile_count(&self) -> usize {
        self.registry
            .read()
            .expect("tile registry poisoned")
            .my_tile_count()
    }

    pub fn total_tiles(&self) -> usize {
        self.layout.total_tiles()
    }

    pub fn set_pixel_operator(&self, operator: Arc<dyn PixelOperator>) {
        *lock(&self.pixel_op, "pixel operator") = Some(operator);
    }

    pub fn render_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Access the assembled image on the master. Mapping a framebuffer
    /// without a master-side image is a hard protocol error; mapping is
    /// meaningful only while no frame is active.
    pub fn map(&self) -> MappedImage<'_> {
        match &self.local_image {
            None => panic!("tried to map a frame buffer without a master-side image"),
            Some(image) => MappedImage {
                guard: image.lock().expect("master image poisoned"),
            },
        }
    }

    pub(crate) fn has_accum(&self) -> bool {
        self.channels.contains(ChannelMask::ACCUM)
    }

    pub(crate) fn has_variance(&self) -> bool {
        self.channels
            .contains(ChannelMask::ACCUM | ChannelMask::VARIANCE)
    }

    pub(crate) fn has_depth(&self) -> bool {
        self.channels.contains(ChannelMask::DEPTH)
    }

    pub(crate) fn has_normal(&self) -> bool {
        self.channels.contains(ChannelMask::NORMAL)
    }

    pub(crate) fn has_albedo(&self) -> bool {
        self.channels.contains(ChannelMask::ALBEDO)
    }

    pub(crate) fn frame_is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn wire_tile_bytes(&self) -> usize {
        wire::wire_tile_bytes(
            self.color_format,
            self.has_depth(),
            self.has_normal(),
            self.has_albedo(),
            self.layout.tile_size(),
        )
    }

    /// True for the rank that assembles but never renders.
    pub(crate) fn is_idle_master(&self) -> bool {
        self.group.is_master() && !self.master_is_worker
    }

    pub(crate) fn pixel_operator(&self) -> Option<Arc<dyn PixelOperator>> {
        lock(&self.pixel_op, "pixel operator").clone()
    }
}

impl MessageHandler for DistributedFrameBuffer {
    fn incoming(&self, message: Message) {
        self.handle_incoming(message);
    }
}

/// Read access to the master's assembled planes; dropping the guard is the
/// unmap.
pub struct MappedImage<'a> {
    guard: MutexGuard<'a, LocalImage>,
}

impl MappedImage<'_> {
    pub fn format(&self) -> PixelFormat {
        self.guard.format()
    }

    pub fn color(&self) -> &[u8] {
        self.guard.color()
    }

    pub fn depth(&self) -> Option<&[f32]> {
        self.guard.depth()
    }

    pub fn normal(&self) -> Option<&[f32]> {
        self.guard.normal()
    }

    pub fn albedo(&self) -> Option<&[f32]> {
        self.guard.albedo()
    }
}

pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    mutex
        .lock()
        .unwrap_or_else(|_| panic!("{what} mutex poisoned"))
}
