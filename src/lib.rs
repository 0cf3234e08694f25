#![doc = include_str!("../README.md")]
#![warn(missing_docs)]

pub mod block;
#[cfg(feature = "serde")]
pub mod checkpoint;
pub mod error;
pub mod exchange;
pub mod field;
pub mod forest;
pub mod input;
pub mod loc;
pub mod mesh;
pub mod task;
pub mod window;

/// Cell scalar type used throughout the crate.
pub type Real = f64;

pub use block::{buffer_id, MeshBlock, NeighborBlock};
pub use error::{ExchangeError, MeshError, TopologyError, WindowError};
pub use exchange::{
    deallocate_sparse_fields, receive_boundary_buffers, send_boundary_buffers, set_boundaries,
};
pub use field::{Field, FieldDescriptor, Metadata, MetadataFlag};
pub use forest::{Corner, Edge, EdgeLoc, Face, FaceId, Forest, Node, NodeId, TreeEntry};
pub use input::{BoundaryKind, MeshParams, ParameterInput, Refinement};
pub use loc::LogicalLocation;
pub use mesh::{Mesh, MeshConfig, SparseConfig};
pub use task::{TaskId, TaskList, TaskStatus};

#[cfg(feature = "mpi")]
pub use exchange::mpi::MpiTransport;
