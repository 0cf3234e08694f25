//! The mesh: the set of locally-owned blocks over a forest, their fields,
//! and the memoized boundary-buffer caches.
//!
//! All exchange phases consume one canonical iteration order, produced by
//! a single iterator: block, then field (declaration order, ghost-filled
//! fields only), then neighbor (in `buf_id` order). The caches record the
//! per-triple allocation bits observed at build time and are rebuilt
//! whenever the current bits differ.

use std::time::{Duration, Instant};

use fxhash::FxHashMap;
use log::debug;

use crate::block::{enumerate_neighbors, MeshBlock, NeighborBlock};
use crate::error::{MeshError, TopologyError, WindowError};
use crate::field::{FieldDescriptor, MetadataFlag};
use crate::forest::{FaceId, Forest, TreeEntry};
use crate::input::{MeshParams, ParameterInput, Refinement};
use crate::loc::LogicalLocation;
use crate::window::{
    fine_selectors, load_same_window, load_to_coarser_window, load_to_finer_window,
    set_from_coarser_window, set_from_finer_window, set_same_window, IndexWindow,
};
use crate::Real;

/// Sparse-field configuration, fixed at startup.
#[derive(Debug, Clone, Copy)]
pub struct SparseConfig {
    /// Whether sparse fields may be unallocated at all. When disabled,
    /// sparse fields behave like dense ones.
    pub enabled: bool,
    /// Values strictly above this magnitude count as non-zero for the
    /// allocation protocol; values at or below it are treated as zero.
    pub allocation_threshold: Real,
    /// Number of consecutive all-zero sweeps after which a sparse field is
    /// deallocated.
    pub deallocation_count: u32,
}

impl Default for SparseConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allocation_threshold: 1e-12,
            deallocation_count: 1,
        }
    }
}

/// Process-wide mesh and exchange configuration, carried explicitly
/// through the exchange API.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Cell extents of every block.
    pub block_nx: [usize; 3],
    /// Ghost width of active directions.
    pub nghost: usize,
    /// Per-direction in-tree periodic wrap, for directions periodic with a
    /// single face of extent.
    pub periodic: [bool; 3],
    /// This process's rank.
    pub my_rank: i32,
    /// Total number of ranks.
    pub n_ranks: i32,
    /// Wall-clock guard for `receive_boundary_buffers`.
    pub receive_timeout: Duration,
    /// Sparse-field configuration.
    pub sparse: SparseConfig,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            block_nx: [4, 4, 1],
            nghost: 2,
            periodic: [false; 3],
            my_rank: 0,
            n_ranks: 1,
            receive_timeout: Duration::from_secs(300),
            sparse: SparseConfig::default(),
        }
    }
}

/// Which phase a buffer cache serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CacheKind {
    /// Source windows for packing.
    Load,
    /// Destination windows for setting ghosts.
    Set,
}

/// One precomputed (block, field, neighbor) cache row.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BoundaryEntry {
    /// Block index within the mesh.
    pub block: usize,
    /// Field index within the block.
    pub field: usize,
    /// Neighbor index within the block's descriptor list.
    pub nb: usize,
    /// Source or destination window.
    pub window: IndexWindow,
    /// The window addresses the coarse array rather than the fine one.
    pub on_coarse: bool,
    /// The fine data must be restricted into the coarse array before
    /// loading.
    pub restrict: bool,
    /// Number of components.
    pub nv: usize,
    /// Payload length in elements, excluding the trailing tag.
    pub len: usize,
    /// Allocation bit observed at cache build.
    pub allocated: bool,
}

/// A memoized flat list of boundary cache rows plus the allocation bits
/// recorded when it was built.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct BufferCache {
    pub entries: Vec<BoundaryEntry>,
    pub alloc_status: Vec<bool>,
}

/// The locally-owned portion of the simulation mesh.
#[derive(Debug)]
pub struct Mesh {
    pub(crate) forest: Forest,
    pub(crate) blocks: Vec<MeshBlock>,
    gid_to_idx: FxHashMap<u64, usize>,
    pub(crate) config: MeshConfig,
    pub(crate) load_cache: Option<BufferCache>,
    pub(crate) set_cache: Option<BufferCache>,
    pub(crate) recv_started: Option<Instant>,
    #[cfg(feature = "mpi")]
    pub(crate) transport: Option<crate::exchange::mpi::MpiTransport>,
}

impl Mesh {
    /// Build a mesh over a forest whose trees have been seeded with block
    /// ownership, instantiating the given fields on every local block.
    pub fn build(
        forest: Forest,
        config: MeshConfig,
        fields: Vec<FieldDescriptor>,
    ) -> Result<Self, MeshError> {
        forest.validate_trees()?;
        let active = config.block_nx.map(|n| n > 1);
        // Load windows reach at most 2 * nghost cells deep (restriction
        // halves the interior); smaller blocks would ship unfilled ghost
        // data.
        if (0..3).any(|d| active[d] && config.block_nx[d] < 2 * config.nghost) {
            return Err(crate::input::InputError::Unsupported(format!(
                "block extents {:?} must be at least twice the ghost width {}",
                config.block_nx, config.nghost
            ))
            .into());
        }

        let mut leaves: Vec<(FaceId, LogicalLocation, TreeEntry)> = Vec::new();
        for (face_id, face) in forest.faces() {
            for (loc, entry) in face.leaves() {
                leaves.push((face_id, *loc, *entry));
            }
        }
        leaves.sort_by_key(|(_, _, entry)| entry.gid);
        if let Some(dup) = leaves.windows(2).find(|w| w[0].2.gid == w[1].2.gid) {
            return Err(TopologyError::DuplicateGid { gid: dup[0].2.gid }.into());
        }

        let mut blocks = Vec::new();
        for (face_id, loc, entry) in &leaves {
            if entry.rank != config.my_rank {
                continue;
            }
            let neighbors =
                enumerate_neighbors(&forest, *face_id, loc, entry.gid, config.periodic, active)?;
            let mut block = MeshBlock::new(
                entry.gid,
                entry.rank,
                *face_id,
                *loc,
                config.block_nx,
                config.nghost,
                neighbors,
            );
            for desc in &fields {
                block.add_field(desc.clone(), config.sparse.enabled);
            }
            size_buffers(&mut block)?;
            blocks.push(block);
        }

        let gid_to_idx = blocks
            .iter()
            .enumerate()
            .map(|(idx, b)| (b.gid(), idx))
            .collect();
        debug!(
            "mesh built: {} local of {} total blocks, {} faces",
            blocks.len(),
            leaves.len(),
            forest.n_faces()
        );
        Ok(Self {
            forest,
            blocks,
            gid_to_idx,
            config,
            load_cache: None,
            set_cache: None,
            recv_started: None,
            #[cfg(feature = "mpi")]
            transport: None,
        })
    }

    /// Build a uniform mesh from a parameter input: one face per root
    /// block, glued by shared nodes, with periodic directions closed into
    /// rings.
    pub fn from_input(
        pin: &ParameterInput,
        fields: Vec<FieldDescriptor>,
    ) -> Result<Self, MeshError> {
        Self::from_input_on_rank(pin, fields, 0, 1)
    }

    /// As [`Mesh::from_input`], on one rank of a multi-rank run. Blocks are
    /// assigned to ranks in contiguous gid chunks.
    pub fn from_input_on_rank(
        pin: &ParameterInput,
        fields: Vec<FieldDescriptor>,
        my_rank: i32,
        n_ranks: i32,
    ) -> Result<Self, MeshError> {
        use crate::input::InputError;

        let params = MeshParams::from_input(pin)?;
        let nb = [0, 1, 2].map(|d| params.nx[d] / params.block_nx[d]);
        if nb[2] != 1 {
            return Err(InputError::Unsupported(
                "more than one block layer in direction 3".to_string(),
            )
            .into());
        }
        let level = match params.refinement {
            Refinement::Static => params.numlevel.saturating_sub(1) as u32,
            _ => 0,
        };
        if level > 0 && params.ndim() > 2 {
            return Err(InputError::Unsupported(
                "static refinement of a three-dimensional mesh".to_string(),
            )
            .into());
        }

        let periodic_x = params.is_periodic(0) && nb[0] > 1;
        let periodic_y = params.is_periodic(1) && nb[1] > 1;
        let mut forest = Forest::new(params.ndim());
        let ncols = if periodic_x { nb[0] } else { nb[0] + 1 };
        let nrows = if periodic_y { nb[1] } else { nb[1] + 1 };
        let mut nodes = vec![Vec::with_capacity(ncols); nrows];
        for (r, row) in nodes.iter_mut().enumerate() {
            for c in 0..ncols {
                row.push(forest.add_node([c as Real, r as Real]));
            }
        }

        let mut gid = 0u64;
        let n_blocks = (nb[0] * nb[1]) as u64 * 1u64 << (params.ndim().min(2) as u32 * level);
        for r in 0..nb[1] {
            for c in 0..nb[0] {
                let (r1, c1) = ((r + 1) % nrows, (c + 1) % ncols);
                let face = forest.add_face([
                    nodes[r][c],
                    nodes[r][c1],
                    nodes[r1][c],
                    nodes[r1][c1],
                ])?;
                let mut locs: Vec<LogicalLocation> = Vec::new();
                let n = 1i64 << level;
                for lx2 in 0..if params.ndim() > 1 { n } else { 1 } {
                    for lx1 in 0..n {
                        locs.push(LogicalLocation::new(level, lx1, lx2, 0));
                    }
                }
                locs.sort();
                for loc in locs {
                    let rank = (gid as i64 * n_ranks as i64 / n_blocks as i64) as i32;
                    forest.seed(face, loc, TreeEntry { gid, rank })?;
                    gid += 1;
                }
            }
        }

        let config = MeshConfig {
            block_nx: params.block_nx,
            nghost: pin.get_integer_or("parthenon/mesh", "nghost", 2)? as usize,
            periodic: [
                params.is_periodic(0) && nb[0] == 1,
                params.is_periodic(1) && nb[1] == 1,
                params.is_periodic(2),
            ],
            my_rank,
            n_ranks,
            receive_timeout: Duration::from_secs_f64(pin.get_real_or(
                "parthenon/mesh",
                "receive_timeout_seconds",
                300.0,
            )?),
            sparse: SparseConfig {
                enabled: pin.get_bool_or("parthenon/sparse", "enable_sparse", true)?,
                allocation_threshold: pin.get_real_or(
                    "parthenon/sparse",
                    "allocation_threshold",
                    1e-12,
                )?,
                deallocation_count: pin.get_integer_or("parthenon/sparse", "deallocation_count", 1)?
                    as u32,
            },
        };
        Self::build(forest, config, fields)
    }

    /// The mesh configuration.
    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// The forest underlying this mesh.
    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    /// All locally-owned blocks, sorted by gid.
    pub fn blocks(&self) -> &[MeshBlock] {
        &self.blocks
    }

    /// The local block with the given gid.
    pub fn block(&self, gid: u64) -> Option<&MeshBlock> {
        self.gid_to_idx.get(&gid).map(|&idx| &self.blocks[idx])
    }

    /// Mutable access to the local block with the given gid.
    pub fn block_mut(&mut self, gid: u64) -> Option<&mut MeshBlock> {
        let idx = *self.gid_to_idx.get(&gid)?;
        Some(&mut self.blocks[idx])
    }

    /// Index of the local block with the given gid.
    pub(crate) fn block_index(&self, gid: u64) -> Option<usize> {
        self.gid_to_idx.get(&gid).copied()
    }

    /// Disjoint mutable borrows of two distinct blocks.
    pub(crate) fn pair_mut(&mut self, a: usize, b: usize) -> (&mut MeshBlock, &mut MeshBlock) {
        assert_ne!(a, b, "pair_mut requires distinct blocks");
        if a < b {
            let (lo, hi) = self.blocks.split_at_mut(b);
            (&mut lo[a], &mut hi[0])
        } else {
            let (lo, hi) = self.blocks.split_at_mut(a);
            (&mut hi[0], &mut lo[b])
        }
    }

    /// The canonical (block, field, neighbor) iteration order consumed by
    /// every exchange phase.
    pub(crate) fn boundary_triples(&self) -> Vec<(usize, usize, usize)> {
        let mut out = Vec::new();
        for (b, block) in self.blocks.iter().enumerate() {
            for (f, field) in block.fields().iter().enumerate() {
                if !field.metadata().has(MetadataFlag::FillGhost) {
                    continue;
                }
                for n in 0..block.neighbors().len() {
                    out.push((b, f, n));
                }
            }
        }
        out
    }

    /// The current allocation bits in canonical triple order.
    pub(crate) fn alloc_status(&self) -> Vec<bool> {
        self.boundary_triples()
            .iter()
            .map(|&(b, f, _)| self.blocks[b].fields()[f].is_allocated())
            .collect()
    }

    /// Build a load- or set-side cache from the canonical triple order.
    pub(crate) fn build_cache(&self, kind: CacheKind) -> Result<BufferCache, WindowError> {
        let mut entries = Vec::new();
        let mut alloc_status = Vec::new();
        for (b, f, n) in self.boundary_triples() {
            let block = &self.blocks[b];
            let field = &block.fields()[f];
            let nb = &block.neighbors()[n];
            let (window, on_coarse, restrict) = match kind {
                CacheKind::Load => load_window(block, nb),
                CacheKind::Set => set_window(block, nb),
            };
            let bounds = if on_coarse {
                block.c_cellbounds()
            } else {
                block.cellbounds()
            };
            window.check(bounds.dims())?;
            let allocated = field.is_allocated();
            entries.push(BoundaryEntry {
                block: b,
                field: f,
                nb: n,
                window,
                on_coarse,
                restrict,
                nv: field.nv(),
                len: field.nv() * window.count(),
                allocated,
            });
            alloc_status.push(allocated);
        }
        debug!(
            "{:?} cache rebuilt with {} entries",
            kind,
            entries.len()
        );
        Ok(BufferCache {
            entries,
            alloc_status,
        })
    }

    /// Attach an MPI transport for cross-rank neighbors.
    ///
    /// Verifies up front that no two expected incoming buffers of one rank
    /// pair share a message tag; a collision would alias two buffers and
    /// is rejected rather than guessed around.
    #[cfg(feature = "mpi")]
    pub fn attach_transport(
        &mut self,
        transport: crate::exchange::mpi::MpiTransport,
    ) -> Result<(), crate::error::ExchangeError> {
        use crate::error::ExchangeError;
        use crate::exchange::message_tag;

        let mut seen: FxHashMap<(i32, i32), u64> = FxHashMap::default();
        for (b, f, n) in self.boundary_triples() {
            let nb = self.blocks[b].neighbors()[n];
            if nb.rank == self.config.my_rank {
                continue;
            }
            let tag = message_tag(nb.gid, nb.buf_id, f, transport.tag_ub());
            if seen.insert((nb.rank, tag), nb.gid).is_some() {
                return Err(ExchangeError::TagCollision {
                    tag,
                    rank_a: self.config.my_rank,
                    rank_b: nb.rank,
                });
            }
        }
        self.transport = Some(transport);
        Ok(())
    }

    /// Allocate a sparse field on one local block, as the sparse protocol
    /// does when non-zero data arrives.
    pub fn allocate_sparse(&mut self, gid: u64, name: &str) {
        if let Some(block) = self.block_mut(gid) {
            if let Some(field) = block.field_mut(name) {
                field.allocate();
            }
        }
    }
}

/// The source window for one neighbor: `(window, on_coarse, restrict)`.
pub(crate) fn load_window(block: &MeshBlock, nb: &NeighborBlock) -> (IndexWindow, bool, bool) {
    let bounds = block.cellbounds();
    let level = block.loc().level();
    let g = bounds.nghost();
    let cg = block.c_cellbounds().nghost();
    let active = [0, 1, 2].map(|d| bounds.is_active(d));
    if nb.level == level {
        (load_same_window(nb.ox, bounds), false, false)
    } else if nb.level < level {
        (
            load_to_coarser_window(nb.ox, block.c_cellbounds(), g),
            true,
            true,
        )
    } else {
        let fi = fine_selectors(nb.ox, nb.fi1, nb.fi2, active);
        (load_to_finer_window(nb.ox, fi, bounds, cg), false, false)
    }
}

/// The destination window for one neighbor: `(window, on_coarse, restrict)`.
pub(crate) fn set_window(block: &MeshBlock, nb: &NeighborBlock) -> (IndexWindow, bool, bool) {
    let bounds = block.cellbounds();
    let level = block.loc().level();
    let cg = block.c_cellbounds().nghost();
    let active = [0, 1, 2].map(|d| bounds.is_active(d));
    if nb.level == level {
        (set_same_window(nb.ox, bounds), false, false)
    } else if nb.level < level {
        (
            set_from_coarser_window(nb.ox, block.c_cellbounds(), block.loc(), cg),
            true,
            false,
        )
    } else {
        let fi = fine_selectors(nb.ox, nb.fi1, nb.fi2, active);
        (set_from_finer_window(nb.ox, fi, bounds), false, false)
    }
}

/// Size every field's send and receive buffers from the neighbor windows.
fn size_buffers(block: &mut MeshBlock) -> Result<(), WindowError> {
    let sizes: Vec<(usize, usize, usize)> = block
        .neighbors()
        .iter()
        .map(|nb| {
            let (load, load_coarse, _) = load_window(block, nb);
            let (set, set_coarse, _) = set_window(block, nb);
            let lb = if load_coarse {
                block.c_cellbounds()
            } else {
                block.cellbounds()
            };
            let sb = if set_coarse {
                block.c_cellbounds()
            } else {
                block.cellbounds()
            };
            load.check(lb.dims())?;
            set.check(sb.dims())?;
            Ok((nb.buf_id, load.count(), set.count()))
        })
        .collect::<Result<_, WindowError>>()?;
    for field in &mut block.fields {
        let nv = field.nv();
        for &(buf_id, load_count, set_count) in &sizes {
            field.init_buffers(buf_id, nv * load_count, nv * set_count);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;
    use crate::field::Metadata;

    fn two_block_mesh() -> Mesh {
        let mut forest = Forest::new(2);
        let n: Vec<_> = [
            [0.0, 0.0],
            [1.0, 0.0],
            [2.0, 0.0],
            [0.0, 1.0],
            [1.0, 1.0],
            [2.0, 1.0],
        ]
        .into_iter()
        .map(|p| forest.add_node(p))
        .collect();
        let fa = forest.add_face([n[0], n[1], n[3], n[4]]).unwrap();
        let fb = forest.add_face([n[1], n[2], n[4], n[5]]).unwrap();
        forest
            .seed(fa, LogicalLocation::ROOT, TreeEntry { gid: 0, rank: 0 })
            .unwrap();
        forest
            .seed(fb, LogicalLocation::ROOT, TreeEntry { gid: 1, rank: 0 })
            .unwrap();
        let fields = vec![
            FieldDescriptor::new("rho", Metadata::new().with(MetadataFlag::FillGhost)),
            FieldDescriptor::new(
                "s",
                Metadata::new()
                    .with(MetadataFlag::FillGhost)
                    .with(MetadataFlag::Sparse),
            ),
        ];
        Mesh::build(forest, MeshConfig::default(), fields).unwrap()
    }

    #[test]
    fn canonical_order_is_block_field_neighbor() {
        let mesh = two_block_mesh();
        let triples = mesh.boundary_triples();
        // Two blocks, two ghost-filled fields, one neighbor each.
        assert_eq!(triples.len(), 4);
        assert_eq!(triples[0], (0, 0, 0));
        assert_eq!(triples[1], (0, 1, 0));
        assert_eq!(triples[2], (1, 0, 0));
        assert_eq!(triples[3], (1, 1, 0));
    }

    #[test]
    fn cache_rebuild_is_stable_under_identical_alloc_status() {
        let mesh = two_block_mesh();
        let a = mesh.build_cache(CacheKind::Load).unwrap();
        let b = mesh.build_cache(CacheKind::Load).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn alloc_status_tracks_sparse_allocation() {
        let mut mesh = two_block_mesh();
        let before = mesh.alloc_status();
        assert_eq!(before, vec![true, false, true, false]);

        mesh.allocate_sparse(0, "s");
        let after = mesh.alloc_status();
        assert_eq!(after, vec![true, true, true, false]);
    }

    #[test]
    fn buffers_are_sized_from_windows() {
        let mesh = two_block_mesh();
        // Same-level east neighbor with nx = (4, 4, 1) and g = 2: the load
        // window is 2 x 4 cells, plus the trailing tag element.
        let block = mesh.block(0).unwrap();
        let nb = &block.neighbors()[0];
        let field = block.field("rho").unwrap();
        assert_eq!(field.send_buf(nb.buf_id).data.len(), 2 * 4 + 1);
        assert_eq!(field.recv_buf(nb.buf_id).data.len(), 2 * 4 + 1);
    }

    #[test]
    fn from_input_builds_a_periodic_row() {
        let text = "\
<parthenon/mesh>
nx1 = 16
nx2 = 4
ix1_bc = periodic
ox1_bc = periodic
<parthenon/meshblock>
nx1 = 4
nx2 = 4
";
        let pin = ParameterInput::from_str(text).unwrap();
        let fields = vec![FieldDescriptor::new(
            "rho",
            Metadata::new().with(MetadataFlag::FillGhost),
        )];
        let mesh = Mesh::from_input(&pin, fields).unwrap();
        assert_eq!(mesh.blocks().len(), 4);
        // Every block of the ring has east and west neighbors and nothing
        // else.
        for block in mesh.blocks() {
            assert_eq!(block.neighbors().len(), 2);
        }
        let b0 = mesh.block(0).unwrap();
        let west = b0.neighbors().iter().find(|nb| nb.ox == [-1, 0, 0]).unwrap();
        assert_eq!(west.gid, 3);
    }

    #[test]
    fn duplicate_gids_are_rejected() {
        let mut forest = Forest::new(2);
        let n: Vec<_> = (0..4).map(|i| forest.add_node([i as Real, 0.0])).collect();
        let f = forest.add_face([n[0], n[1], n[2], n[3]]).unwrap();
        forest
            .seed(f, LogicalLocation::ROOT, TreeEntry { gid: 0, rank: 0 })
            .unwrap();
        let n2: Vec<_> = (0..4).map(|i| forest.add_node([i as Real, 5.0])).collect();
        let f2 = forest.add_face([n2[0], n2[1], n2[2], n2[3]]).unwrap();
        forest
            .seed(f2, LogicalLocation::ROOT, TreeEntry { gid: 0, rank: 0 })
            .unwrap();
        assert!(matches!(
            Mesh::build(forest, MeshConfig::default(), Vec::new()),
            Err(MeshError::Topology(TopologyError::DuplicateGid { gid: 0 }))
        ));
    }
}
