//! Error taxonomy of the crate: topology, index-window, and exchange
//! failures. All of these are fatal to the rank that observes them; no
//! local recovery is attempted.

use thiserror::Error;

use crate::forest::{EdgeLoc, FaceId};
use crate::input::InputError;
use crate::loc::LogicalLocation;

/// An inconsistency in the macro topology or in a face's refinement tree.
///
/// Topology errors surface during forest or mesh construction and are
/// always fatal.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// A face was created with a corner node unknown to the forest.
    #[error("face corner node is not registered in this forest")]
    UnknownNode,
    /// A face was created with fewer than four distinct corner nodes.
    #[error("face corners must be four distinct nodes")]
    DegenerateFace,
    /// An interior edge has no counterpart with non-zero orientation in any
    /// other face.
    #[error("edge {edge:?} of face {face:?} has no orientation match")]
    UnmatchedEdge {
        /// Face owning the unmatched edge.
        face: FaceId,
        /// Location of the unmatched edge on that face.
        edge: EdgeLoc,
    },
    /// Two keys of one refinement tree overlap (ancestor and descendant are
    /// both present).
    #[error("tree of face {face:?} overlaps: {outer} contains {inner}")]
    OverlappingKeys {
        /// Face owning the invalid tree.
        face: FaceId,
        /// The ancestor key.
        outer: LogicalLocation,
        /// The contained descendant key.
        inner: LogicalLocation,
    },
    /// A sibling group of a refinement tree is only partially present.
    #[error("tree of face {face:?} holds {found} of {expected} siblings of {parent}")]
    PartialSiblings {
        /// Face owning the invalid tree.
        face: FaceId,
        /// Parent location of the sibling group.
        parent: LogicalLocation,
        /// Number of siblings present.
        found: usize,
        /// Number of siblings a complete group has.
        expected: usize,
    },
    /// A location's coordinates are outside `[0, 2^level)`.
    #[error("location {loc} is out of bounds for its level")]
    OutOfTree {
        /// The offending location.
        loc: LogicalLocation,
    },
    /// A tree operation addressed a location with no leaf entry.
    #[error("no leaf at {loc} in face {face:?}")]
    NoSuchLeaf {
        /// Face whose tree was queried.
        face: FaceId,
        /// The queried location.
        loc: LogicalLocation,
    },
    /// Two leaves in the forest carry the same global id.
    #[error("global block id {gid} is assigned to more than one leaf")]
    DuplicateGid {
        /// The duplicated id.
        gid: u64,
    },
    /// A block is its own neighbor. Periodic directions need at least two
    /// blocks of extent.
    #[error("block {gid} would neighbor itself; periodic directions need at least two blocks")]
    SelfNeighbor {
        /// The offending block id.
        gid: u64,
    },
    /// Neighboring leaves differ by more than one refinement level.
    #[error("blocks at {a} and {b} differ by more than one level")]
    UnbalancedRefinement {
        /// First leaf location.
        a: LogicalLocation,
        /// Second leaf location.
        b: LogicalLocation,
    },
    /// Two faces meet with a quarter-turn between their frames, which the
    /// exchange index mapping does not support.
    #[error("faces {face:?} and {other:?} meet with rotated frames")]
    RotatedJunction {
        /// One face at the junction.
        face: FaceId,
        /// The other face.
        other: FaceId,
    },
    /// More than two blocks meet through one block boundary.
    #[error("block {gid} has colliding neighbor slots at a non-manifold junction")]
    NonManifold {
        /// The block observing the collision.
        gid: u64,
    },
}

/// A computed source or destination index window fell outside the bounds of
/// the array it addresses.
///
/// This indicates a mismatch between the sender- and receiver-side window
/// routines and must never be silently clipped.
#[derive(Debug, Error)]
#[error(
    "index window i:[{si},{ei}] j:[{sj},{ej}] k:[{sk},{ek}] exceeds array extents {dims:?}"
)]
pub struct WindowError {
    /// First i index of the window.
    pub si: i64,
    /// Last i index of the window.
    pub ei: i64,
    /// First j index of the window.
    pub sj: i64,
    /// Last j index of the window.
    pub ej: i64,
    /// First k index of the window.
    pub sk: i64,
    /// Last k index of the window.
    pub ek: i64,
    /// Extents `(k, j, i)` of the addressed array.
    pub dims: [usize; 3],
}

/// Failures of the send/receive/set pipeline.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// `receive_boundary_buffers` exceeded its wall-clock timeout with
    /// messages still outstanding.
    #[error("receive timed out after {waited_ms} ms with {outstanding} buffers outstanding")]
    ReceiveTimeout {
        /// Milliseconds waited since the first poll of this exchange.
        waited_ms: u128,
        /// Number of buffers that never arrived.
        outstanding: usize,
    },
    /// The allocation status observed while filling a buffer disagrees with
    /// the status recorded at cache build. Indicates a cache-invalidation
    /// bug.
    #[error("allocation of field `{field}` on block {gid} changed after cache build")]
    AllocationMismatch {
        /// Block owning the field.
        gid: u64,
        /// Name of the field.
        field: String,
    },
    /// Two distinct buffers between one pair of ranks derived the same MPI
    /// tag.
    #[error("message tag {tag} is shared by two buffers between ranks {rank_a} and {rank_b}")]
    TagCollision {
        /// The colliding tag.
        tag: i32,
        /// One endpoint rank.
        rank_a: i32,
        /// The other endpoint rank.
        rank_b: i32,
    },
    /// A neighbor lives on another rank but no transport is attached.
    #[error("block {gid} has an off-rank neighbor but no transport is attached")]
    TransportUnavailable {
        /// Block with the off-rank neighbor.
        gid: u64,
    },
    /// The task graph contains a dependency cycle.
    #[error("task list contains a dependency cycle involving `{task}`")]
    DependencyCycle {
        /// Name of a task on the cycle.
        task: String,
    },
    /// An index window was out of bounds.
    #[error(transparent)]
    Window(#[from] WindowError),
}

/// Umbrella error for fallible crate entry points.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Forest or mesh construction failed.
    #[error(transparent)]
    Topology(#[from] TopologyError),
    /// An index window was out of bounds.
    #[error(transparent)]
    Window(#[from] WindowError),
    /// The exchange pipeline failed.
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    /// The parameter input was invalid.
    #[error(transparent)]
    Input(#[from] InputError),
}
