//! Rank-level communication seams of the distributed framebuffer.
//!
//! This crate sits at the bottom of the workspace: it defines the rank
//! group, the message payload, and the `Transport` contract (collectives
//! plus point-to-point messaging). It must not depend on the tile crates
//! above it. The in-process [`mesh`] implementation backs the multi-rank
//! tests; a production deployment binds the same trait to MPI.

use std::fmt;
use std::sync::Arc;

mod mesh;

pub use mesh::{create_mesh, MeshEndpoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rank(pub usize);

impl fmt::Display for Rank {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "rank {}", self.0)
    }
}

/// The fixed set of ranks of one job, seen from one member.
/// Rank 0 is the master; workers are the remaining ranks in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankGroup {
    this: Rank,
    count: usize,
}

impl RankGroup {
    pub fn new(this: Rank, count: usize) -> Self {
        assert!(count > 0, "rank group must have at least one rank");
        assert!(
            this.0 < count,
            "rank {} is outside a group of {count} ranks",
            this.0
        );
        Self { this, count }
    }

    pub const fn this_rank(&self) -> Rank {
        self.this
    }

    pub const fn num_ranks(&self) -> usize {
        self.count
    }

    pub const fn master(&self) -> Rank {
        Rank(0)
    }

    pub const fn is_master(&self) -> bool {
        self.this.0 == 0
    }

    /// Ranks that render when the master does not: everyone but rank 0.
    pub const fn num_workers(&self) -> usize {
        self.count - 1
    }

    /// Global rank of the `index`-th worker when the master is excluded.
    pub fn worker_global_rank(&self, index: usize) -> Rank {
        assert!(
            index < self.num_workers(),
            "worker index {index} is outside a group of {} workers",
            self.num_workers()
        );
        Rank(index + 1)
    }
}

/// A reference-counted wire payload. Cloning shares the bytes; the router
/// consumes each message exactly once.
#[derive(Debug, Clone)]
pub struct Message {
    bytes: Arc<[u8]>,
}

impl Message {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    Disconnected { channel: &'static str },
    RankOutOfRange { rank: usize, count: usize },
    CountMismatch { what: &'static str, expected: usize, actual: usize },
}

impl fmt::Display for TransportError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Disconnected { channel } => {
                write!(formatter, "transport channel disconnected: {channel}")
            }
            TransportError::RankOutOfRange { rank, count } => {
                write!(formatter, "rank {rank} out of range for {count} ranks")
            }
            TransportError::CountMismatch {
                what,
                expected,
                actual,
            } => {
                write!(
                    formatter,
                    "collective count mismatch in {what}: expected {expected}, got {actual}"
                )
            }
        }
    }
}

impl std::error::Error for TransportError {}

/// Receiver side of point-to-point messaging. The framebuffer registers
/// itself as the handler; `incoming` runs on the transport's receiver
/// thread and must not block beyond enqueueing.
pub trait MessageHandler: Send + Sync {
    fn incoming(&self, message: Message);
}

/// Collectives and point-to-point messaging of one rank.
///
/// Collectives block the calling thread until every rank of the group has
/// entered the same operation, exactly like their MPI counterparts, and
/// must be issued in the same order on every rank. Root-only results come
/// back as `Some` on the root and `None` elsewhere.
pub trait Transport: Send + Sync {
    fn group(&self) -> RankGroup;

    fn set_handler(&self, handler: Arc<dyn MessageHandler>);

    fn send_to(&self, rank: Rank, message: Message) -> Result<(), TransportError>;

    fn barrier(&self) -> Result<(), TransportError>;

    /// Root broadcasts `buf`; every other rank's `buf` is overwritten.
    fn bcast_i32(&self, root: Rank, buf: &mut [i32]) -> Result<(), TransportError>;

    fn bcast_f32(&self, root: Rank, buf: &mut [f32]) -> Result<(), TransportError>;

    /// Gathers one value per rank, in rank order, to the root.
    fn gather_i32(&self, root: Rank, send: i32) -> Result<Option<Vec<i32>>, TransportError>;

    /// Gathers a variable-length byte block per rank; the root receives
    /// the blocks concatenated in rank order.
    fn gatherv_bytes(&self, root: Rank, send: &[u8]) -> Result<Option<Vec<u8>>, TransportError>;

    fn reduce_f64_min(&self, root: Rank, value: f64) -> Result<Option<f64>, TransportError>;

    fn reduce_f64_max(&self, root: Rank, value: f64) -> Result<Option<f64>, TransportError>;
}
