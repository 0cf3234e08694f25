//! Mesh blocks and their neighbor descriptors.
//!
//! A [`MeshBlock`] is a concrete, logically-rectangular patch of cells
//! occupying one leaf of a face's refinement tree. Its [`NeighborBlock`]
//! descriptors enumerate every occupied `(ox1, ox2, ox3, fi1, fi2)`
//! combination; both endpoints of an exchange derive matching buffer slots
//! from their own descriptors, so the enumeration here must be exactly
//! symmetric.

use crate::error::TopologyError;
use crate::field::{Field, FieldDescriptor};
use crate::forest::{CellRef, FaceId, Forest};
use crate::loc::LogicalLocation;
use crate::window::CellBounds;

/// Deterministic buffer slot for a neighbor at offset `(ox1, ox2, ox3)`
/// with fine-neighbor selectors `(fi1, fi2)`.
///
/// Both endpoints compute ids from their own frames; a sender addresses the
/// peer slot through `target_id`, the id the peer derives for the reverse
/// direction.
pub fn buffer_id(ox: [i8; 3], fi1: u8, fi2: u8) -> usize {
    let o = (ox[0] + 1) as usize + 3 * (ox[1] + 1) as usize + 9 * (ox[2] + 1) as usize;
    4 * o + 2 * fi1 as usize + fi2 as usize
}

/// Descriptor of one neighbor of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborBlock {
    /// Global id of the neighboring block.
    pub gid: u64,
    /// Rank owning the neighboring block.
    pub rank: i32,
    /// Refinement level of the neighboring block.
    pub level: u32,
    /// Offset of the neighbor in this block's frame, per direction.
    pub ox: [i8; 3],
    /// First fine-neighbor selector; zero for same-level and coarser
    /// neighbors.
    pub fi1: u8,
    /// Second fine-neighbor selector.
    pub fi2: u8,
    /// Buffer slot this block uses for the neighbor.
    pub buf_id: usize,
    /// Buffer slot the neighbor uses for this block.
    pub target_id: usize,
    /// Relative orientation of the junction: `+1` aligned, `-1` mirrored.
    pub orientation: i8,
    /// Axes of this block's frame packed in reverse order for the
    /// neighbor.
    pub flip: [bool; 3],
}

/// A concrete mesh block: one leaf of the forest, its cell bounds, its
/// fields, and its neighbor descriptors.
#[derive(Debug)]
pub struct MeshBlock {
    gid: u64,
    rank: i32,
    face: FaceId,
    loc: LogicalLocation,
    cellbounds: CellBounds,
    c_cellbounds: CellBounds,
    pub(crate) fields: Vec<Field>,
    neighbors: Vec<NeighborBlock>,
}

impl MeshBlock {
    pub(crate) fn new(
        gid: u64,
        rank: i32,
        face: FaceId,
        loc: LogicalLocation,
        block_nx: [usize; 3],
        nghost: usize,
        neighbors: Vec<NeighborBlock>,
    ) -> Self {
        let c_nx = block_nx.map(|n| if n > 1 { n / 2 } else { n });
        Self {
            gid,
            rank,
            face,
            loc,
            cellbounds: CellBounds::new(block_nx, nghost),
            c_cellbounds: CellBounds::new(c_nx, nghost / 2),
            fields: Vec::new(),
            neighbors,
        }
    }

    /// Global id of the block.
    pub fn gid(&self) -> u64 {
        self.gid
    }

    /// Rank owning the block.
    pub fn rank(&self) -> i32 {
        self.rank
    }

    /// The face whose tree holds this block.
    pub fn face(&self) -> FaceId {
        self.face
    }

    /// Logical location of the block within its face's tree.
    pub fn loc(&self) -> &LogicalLocation {
        &self.loc
    }

    /// Cell bounds at the block's own resolution.
    pub fn cellbounds(&self) -> &CellBounds {
        &self.cellbounds
    }

    /// Cell bounds of the block's half-resolution coarse arrays.
    pub fn c_cellbounds(&self) -> &CellBounds {
        &self.c_cellbounds
    }

    /// Neighbor descriptors, sorted by `buf_id`.
    pub fn neighbors(&self) -> &[NeighborBlock] {
        &self.neighbors
    }

    /// All fields, in declaration order.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// The field named `name`, if declared.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name() == name)
    }

    /// Mutable access to the field named `name`.
    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.name() == name)
    }

    pub(crate) fn add_field(&mut self, desc: FieldDescriptor, sparse_enabled: bool) {
        self.fields.push(Field::new(
            desc,
            &self.cellbounds,
            &self.c_cellbounds,
            sparse_enabled,
        ));
    }
}

/// Enumerate the neighbor descriptors of the block at `(face, loc)`.
///
/// Every occupied `(ox1, ox2, ox3, fi1, fi2)` yields exactly one
/// descriptor; a finer neighbor face yields one descriptor per adjacent
/// child. The result is sorted by `buf_id`.
pub(crate) fn enumerate_neighbors(
    forest: &Forest,
    face: FaceId,
    loc: &LogicalLocation,
    gid: u64,
    periodic: [bool; 3],
    active: [bool; 3],
) -> Result<Vec<NeighborBlock>, TopologyError> {
    let mut out: Vec<NeighborBlock> = Vec::new();
    let offsets = |a: bool| if a { -1..=1i64 } else { 0..=0i64 };

    for ox3 in offsets(active[2]) {
        for ox2 in offsets(active[1]) {
            for ox1 in offsets(active[0]) {
                if (ox1, ox2, ox3) == (0, 0, 0) {
                    continue;
                }
                let shift = [ox1, ox2, ox3];
                let ox = [ox1 as i8, ox2 as i8, ox3 as i8];
                for cell in forest.shifted_cells(face, loc, shift, periodic) {
                    // A quarter-turn junction would permute axes between the
                    // two frames; the index mapping only supports aligned
                    // and mirrored junctions.
                    if (0..2).any(|d| cell.rev_ox[d].abs() != ox[d].abs()) {
                        return Err(TopologyError::RotatedJunction {
                            face,
                            other: cell.face,
                        });
                    }
                    let tree = forest.face(cell.face);
                    if let Some((found, entry)) = tree.find_containing(&cell.loc) {
                        if found.level() == loc.level() {
                            push_same_level(&mut out, loc, &cell, entry.gid, entry.rank, ox, gid)?;
                        } else {
                            if loc.level() - found.level() > 1 {
                                return Err(TopologyError::UnbalancedRefinement {
                                    a: *loc,
                                    b: found,
                                });
                            }
                            push_coarser(
                                forest, &mut out, face, loc, &cell, found, entry.gid, entry.rank,
                                ox, periodic, active, gid,
                            )?;
                        }
                    } else if tree.has_descendant(&cell.loc) {
                        push_finer(forest, &mut out, loc, &cell, ox, active, gid)?;
                    }
                    // No entry at all: the offset leaves the mesh through a
                    // physical boundary of this face's tree.
                }
            }
        }
    }

    out.sort_by_key(|nb| nb.buf_id);
    if out.windows(2).any(|w| w[0].buf_id == w[1].buf_id) {
        return Err(TopologyError::NonManifold { gid });
    }
    Ok(out)
}

fn push_same_level(
    out: &mut Vec<NeighborBlock>,
    loc: &LogicalLocation,
    cell: &CellRef,
    nb_gid: u64,
    nb_rank: i32,
    ox: [i8; 3],
    gid: u64,
) -> Result<(), TopologyError> {
    if nb_gid == gid {
        return Err(TopologyError::SelfNeighbor { gid });
    }
    out.push(NeighborBlock {
        gid: nb_gid,
        rank: nb_rank,
        level: loc.level(),
        ox,
        fi1: 0,
        fi2: 0,
        buf_id: buffer_id(ox, 0, 0),
        target_id: buffer_id(cell.rev_ox, 0, 0),
        orientation: cell.orientation,
        flip: cell.flip,
    });
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn push_coarser(
    forest: &Forest,
    out: &mut Vec<NeighborBlock>,
    face: FaceId,
    loc: &LogicalLocation,
    cell: &CellRef,
    found: LogicalLocation,
    nb_gid: u64,
    nb_rank: i32,
    ox: [i8; 3],
    periodic: [bool; 3],
    active: [bool; 3],
    gid: u64,
) -> Result<(), TopologyError> {
    if nb_gid == gid {
        return Err(TopologyError::SelfNeighbor { gid });
    }
    // A corner or edge offset whose region belongs to the same coarse leaf
    // as an adjacent face region is served by that face buffer's parity
    // extension; only offsets that are visible from the parent cell get a
    // descriptor of their own.
    let parent = loc.ancestor_at(loc.level() - 1);
    let visible = forest
        .shifted_cells(face, &parent, [ox[0] as i64, ox[1] as i64, ox[2] as i64], periodic)
        .iter()
        .any(|c| c.face == cell.face && c.loc == found);
    if !visible {
        return Ok(());
    }
    // The selectors the coarse endpoint derives for this block determine
    // the slot it serves us through.
    let mine = cell.loc.offset(
        cell.rev_ox[0] as i64,
        cell.rev_ox[1] as i64,
        cell.rev_ox[2] as i64,
    );
    let mut fi = [0u8; 2];
    let mut next = 0;
    for d in 0..3 {
        if cell.rev_ox[d] == 0 && active[d] && next < 2 {
            fi[next] = (mine.lx(d) & 1) as u8;
            next += 1;
        }
    }
    out.push(NeighborBlock {
        gid: nb_gid,
        rank: nb_rank,
        level: found.level(),
        ox,
        fi1: 0,
        fi2: 0,
        buf_id: buffer_id(ox, 0, 0),
        target_id: buffer_id(cell.rev_ox, fi[0], fi[1]),
        orientation: cell.orientation,
        flip: cell.flip,
    });
    Ok(())
}

fn push_finer(
    forest: &Forest,
    out: &mut Vec<NeighborBlock>,
    loc: &LogicalLocation,
    cell: &CellRef,
    ox: [i8; 3],
    active: [bool; 3],
    gid: u64,
) -> Result<(), TopologyError> {
    let tree = forest.face(cell.face);
    // Children of the shifted cell on the side facing this block.
    let options = |d: usize| -> Vec<i64> {
        if !active[d] {
            vec![0]
        } else {
            match cell.rev_ox[d] {
                -1 => vec![0],
                1 => vec![1],
                _ => vec![0, 1],
            }
        }
    };
    for o3 in options(2) {
        for o2 in options(1) {
            for o1 in options(0) {
                let child = cell.loc.child(o1, o2, o3);
                let Some(entry) = tree.entry(&child) else {
                    return Err(TopologyError::UnbalancedRefinement {
                        a: *loc,
                        b: child,
                    });
                };
                if entry.gid == gid {
                    return Err(TopologyError::SelfNeighbor { gid });
                }
                // Selectors are assigned over this block's zero-offset
                // directions; a mirrored junction reverses the child order
                // along the flipped axis.
                let o = [o1, o2, o3];
                let mut fi = [0u8; 2];
                let mut next = 0;
                for d in 0..3 {
                    if ox[d] == 0 && active[d] && next < 2 {
                        let sel = if cell.flip[d] { 1 - o[d] } else { o[d] };
                        fi[next] = sel as u8;
                        next += 1;
                    }
                }
                out.push(NeighborBlock {
                    gid: entry.gid,
                    rank: entry.rank,
                    level: loc.level() + 1,
                    ox,
                    fi1: fi[0],
                    fi2: fi[1],
                    buf_id: buffer_id(ox, fi[0], fi[1]),
                    target_id: buffer_id(cell.rev_ox, 0, 0),
                    orientation: cell.orientation,
                    flip: cell.flip,
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use itertools::Itertools;

    use super::*;
    use crate::forest::TreeEntry;
    use crate::Real;

    #[test]
    fn buffer_ids_are_unique_per_offset_and_selector() {
        let mut seen = Vec::new();
        for ox1 in -1..=1i8 {
            for ox2 in -1..=1i8 {
                for ox3 in -1..=1i8 {
                    for fi1 in 0..2u8 {
                        for fi2 in 0..2u8 {
                            seen.push(buffer_id([ox1, ox2, ox3], fi1, fi2));
                        }
                    }
                }
            }
        }
        assert_eq!(seen.iter().unique().count(), seen.len());
    }

    /// A single face refined once: four same-level sibling blocks.
    fn quad_tree_forest() -> (Forest, FaceId) {
        let mut forest = Forest::new(2);
        let n: Vec<_> = (0..4).map(|i| forest.add_node([i as Real, 0.0])).collect();
        let f = forest.add_face([n[0], n[1], n[2], n[3]]).unwrap();
        forest
            .seed(f, LogicalLocation::ROOT, TreeEntry { gid: 0, rank: 0 })
            .unwrap();
        let entries = (0..4).map(|gid| TreeEntry { gid, rank: 0 }).collect();
        forest.refine(f, LogicalLocation::ROOT, entries).unwrap();
        (forest, f)
    }

    #[test]
    fn sibling_neighbors_pair_their_slots() {
        let (forest, f) = quad_tree_forest();
        let sw = LogicalLocation::new(1, 0, 0, 0);
        let ne = LogicalLocation::new(1, 1, 1, 0);
        let active = [true, true, false];

        let nbs_sw = enumerate_neighbors(&forest, f, &sw, 0, [false; 3], active).unwrap();
        // East sibling, north sibling, and the diagonal.
        assert_eq!(nbs_sw.len(), 3);

        let nbs_ne = enumerate_neighbors(&forest, f, &ne, 3, [false; 3], active).unwrap();
        let east = nbs_sw.iter().find(|nb| nb.ox == [1, 0, 0]).unwrap();
        assert_eq!(east.gid, 1);
        // gid 1 sits at (1, 1, 0, 0); its west descriptor points at gid 0.
        let nbs_se = enumerate_neighbors(
            &forest,
            f,
            &LogicalLocation::new(1, 1, 0, 0),
            1,
            [false; 3],
            active,
        )
        .unwrap();
        let back = nbs_se.iter().find(|nb| nb.ox == [-1, 0, 0]).unwrap();
        assert_eq!(back.gid, 0);
        assert_eq!(back.buf_id, east.target_id);
        assert_eq!(back.target_id, east.buf_id);

        // Diagonal pairing between SW and NE siblings.
        let diag = nbs_sw.iter().find(|nb| nb.ox == [1, 1, 0]).unwrap();
        let gaid = nbs_ne.iter().find(|nb| nb.ox == [-1, -1, 0]).unwrap();
        assert_eq!(diag.gid, 3);
        assert_eq!(gaid.gid, 0);
        assert_eq!(diag.target_id, gaid.buf_id);
        assert_eq!(gaid.target_id, diag.buf_id);
    }

    /// Two root faces east-west; the eastern face refined once.
    fn level_jump_forest() -> (Forest, FaceId, FaceId) {
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
        let entries = (1..5).map(|gid| TreeEntry { gid, rank: 0 }).collect();
        forest.refine(fb, LogicalLocation::ROOT, entries).unwrap();
        (forest, fa, fb)
    }

    #[test]
    fn coarse_block_fans_out_over_fine_children() {
        let (forest, fa, _) = level_jump_forest();
        let active = [true, true, false];
        let nbs = enumerate_neighbors(&forest, fa, &LogicalLocation::ROOT, 0, [false; 3], active)
            .unwrap();
        // Two fine children share the east edge; the corner-adjacent child
        // is reached through the east descriptors' windows, not separately.
        let east: Vec<_> = nbs.iter().filter(|nb| nb.ox == [1, 0, 0]).collect();
        assert_eq!(east.len(), 2);
        assert_eq!(east.iter().map(|nb| nb.fi1).sorted().collect_vec(), [0, 1]);
        assert!(east.iter().all(|nb| nb.level == 1));
        assert_eq!(nbs.len(), 2);
    }

    #[test]
    fn fine_block_pairs_with_coarse_descriptor() {
        let (forest, _, fb) = level_jump_forest();
        let active = [true, true, false];
        // West-edge child (gid 1) at (1, 0, 0, 0).
        let loc = LogicalLocation::new(1, 0, 0, 0);
        let nbs = enumerate_neighbors(&forest, fb, &loc, 1, [false; 3], active).unwrap();
        let west = nbs.iter().find(|nb| nb.ox == [-1, 0, 0]).unwrap();
        assert_eq!(west.gid, 0);
        assert_eq!(west.level, 0);
        assert_eq!((west.fi1, west.fi2), (0, 0));

        // The coarse endpoint's east descriptor with fi1 = 0 must address
        // this block's slot and vice versa.
        let (forest, fa, _) = level_jump_forest();
        let coarse =
            enumerate_neighbors(&forest, fa, &LogicalLocation::ROOT, 0, [false; 3], active)
                .unwrap();
        let mine = coarse
            .iter()
            .find(|nb| nb.ox == [1, 0, 0] && nb.fi1 == 0)
            .unwrap();
        assert_eq!(mine.gid, 1);
        assert_eq!(mine.buf_id, west.target_id);
        assert_eq!(mine.target_id, west.buf_id);

        // The south-west offset of the north-east-of-coarse fine child
        // resolves to the coarse block but is covered by the face buffer:
        // no duplicate descriptor.
        let nb_count = nbs.iter().filter(|nb| nb.gid == 0).count();
        assert_eq!(nb_count, 1);
    }

    #[test]
    fn corner_offsets_into_same_coarse_leaf_are_filtered() {
        let (forest, _, fb) = level_jump_forest();
        let active = [true, true, false];
        // North-west child of fb at (1, 0, 1, 0): its south-west offset
        // lands in fa at the parent level too.
        let loc = LogicalLocation::new(1, 0, 1, 0);
        let nbs = enumerate_neighbors(&forest, fb, &loc, 3, [false; 3], active).unwrap();
        let toward_coarse: Vec<_> = nbs.iter().filter(|nb| nb.gid == 0).collect();
        // West face buffer only: the south-west corner of this block lies
        // inside the same coarse leaf and is served by the parity
        // extension.
        assert_eq!(toward_coarse.len(), 1);
        assert_eq!(toward_coarse[0].ox, [-1, 0, 0]);
    }

    #[test]
    fn self_neighbor_is_rejected() {
        let mut forest = Forest::new(2);
        let n: Vec<_> = (0..4).map(|i| forest.add_node([i as Real, 0.0])).collect();
        let f = forest.add_face([n[0], n[1], n[2], n[3]]).unwrap();
        forest
            .seed(f, LogicalLocation::ROOT, TreeEntry { gid: 0, rank: 0 })
            .unwrap();
        let err = enumerate_neighbors(
            &forest,
            f,
            &LogicalLocation::ROOT,
            0,
            [true, false, false],
            [true, true, false],
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::SelfNeighbor { gid: 0 }));
    }
}
