//! The macro topology of the domain: a forest of quadrilateral faces joined
//! along edges, each face carrying a refinement tree of logical locations.
//!
//! Faces and nodes live in flat arenas keyed by [`FaceId`] and [`NodeId`].
//! A [`Face`] owns its four corner node ids in canonical `[SW, SE, NW, NE]`
//! order and is the sole owner of its refinement tree; a [`Node`] holds a
//! non-owning, sorted back-index of the faces that touch it, sufficient to
//! answer "which faces share this vertex?".

use std::collections::BTreeMap;
use std::ops::Bound;

use itertools::Itertools;
use slotmap::{new_key_type, SlotMap};

use crate::error::TopologyError;
use crate::loc::LogicalLocation;
use crate::Real;

new_key_type! {
    /// Identifier of a forest vertex.
    pub struct NodeId;

    /// Identifier of a forest face.
    pub struct FaceId;
}

/// A forest vertex: a physical coordinate and the faces that touch it.
#[derive(Debug, Clone)]
pub struct Node {
    /// Physical coordinate of the vertex.
    pub pos: [Real; 2],
    faces: Vec<FaceId>,
}

impl Node {
    /// The faces sharing this vertex, sorted by id.
    pub fn faces(&self) -> &[FaceId] {
        &self.faces
    }
}

/// A corner of a face, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Corner {
    /// South-west corner (index 0).
    Sw = 0,
    /// South-east corner (index 1).
    Se = 1,
    /// North-west corner (index 2).
    Nw = 2,
    /// North-east corner (index 3).
    Ne = 3,
}

impl Corner {
    /// All four corners in canonical order.
    pub const ALL: [Corner; 4] = [Corner::Sw, Corner::Se, Corner::Nw, Corner::Ne];

    /// The two edges meeting at this corner.
    pub fn edges(self) -> [EdgeLoc; 2] {
        match self {
            Corner::Sw => [EdgeLoc::South, EdgeLoc::West],
            Corner::Se => [EdgeLoc::South, EdgeLoc::East],
            Corner::Nw => [EdgeLoc::North, EdgeLoc::West],
            Corner::Ne => [EdgeLoc::North, EdgeLoc::East],
        }
    }
}

/// One of the four edges of a face.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeLoc {
    /// Low-`lx2` edge, ordered by increasing `lx1`.
    South,
    /// High-`lx2` edge, ordered by increasing `lx1`.
    North,
    /// Low-`lx1` edge, ordered by increasing `lx2`.
    West,
    /// High-`lx1` edge, ordered by increasing `lx2`.
    East,
}

impl EdgeLoc {
    /// All four edge locations.
    pub const ALL: [EdgeLoc; 4] = [EdgeLoc::South, EdgeLoc::North, EdgeLoc::West, EdgeLoc::East];

    /// The corners bounding this edge, in the edge's canonical order.
    pub fn corners(self) -> (Corner, Corner) {
        match self {
            EdgeLoc::South => (Corner::Sw, Corner::Se),
            EdgeLoc::North => (Corner::Nw, Corner::Ne),
            EdgeLoc::West => (Corner::Sw, Corner::Nw),
            EdgeLoc::East => (Corner::Se, Corner::Ne),
        }
    }

    /// The tree axis running along this edge (0 = `lx1`, 1 = `lx2`).
    pub fn along_axis(self) -> usize {
        match self {
            EdgeLoc::South | EdgeLoc::North => 0,
            EdgeLoc::West | EdgeLoc::East => 1,
        }
    }
}

/// An ordered pair of forest vertices: one edge of a face in the face's
/// canonical orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    /// The two endpoints, in canonical order.
    pub nodes: [NodeId; 2],
}

impl Edge {
    /// Relative orientation of two edges: `+1` if they join the same
    /// vertices in the same order, `-1` if reversed, `0` if they are not
    /// the same edge.
    pub fn relative_orientation(&self, other: &Edge) -> i8 {
        if self.nodes == other.nodes {
            1
        } else if self.nodes == [other.nodes[1], other.nodes[0]] {
            -1
        } else {
            0
        }
    }
}

/// Ownership entry of one leaf in a face's refinement tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeEntry {
    /// Global id of the block occupying the leaf.
    pub gid: u64,
    /// Rank that owns the block.
    pub rank: i32,
}

/// A quadrilateral element of the macro topology, owner of a refinement
/// tree mapping logical locations to block ownership.
#[derive(Debug, Clone)]
pub struct Face {
    nodes: [NodeId; 4],
    tree: BTreeMap<LogicalLocation, TreeEntry>,
}

impl Face {
    /// The four corner nodes in `[SW, SE, NW, NE]` order.
    pub fn nodes(&self) -> [NodeId; 4] {
        self.nodes
    }

    /// The node at `corner`.
    pub fn corner_node(&self, corner: Corner) -> NodeId {
        self.nodes[corner as usize]
    }

    /// The edge at `loc`, ordered by the face's canonical orientation.
    pub fn edge(&self, loc: EdgeLoc) -> Edge {
        let (a, b) = loc.corners();
        Edge {
            nodes: [self.corner_node(a), self.corner_node(b)],
        }
    }

    /// The leaf entry at exactly `loc`, if present.
    pub fn entry(&self, loc: &LogicalLocation) -> Option<&TreeEntry> {
        self.tree.get(loc)
    }

    /// Whether `loc` is a leaf of this tree.
    pub fn has_leaf(&self, loc: &LogicalLocation) -> bool {
        self.tree.contains_key(loc)
    }

    /// The leaf containing `loc` (itself or an ancestor), if any.
    pub fn find_containing(&self, loc: &LogicalLocation) -> Option<(LogicalLocation, &TreeEntry)> {
        for level in (0..=loc.level()).rev() {
            let anc = loc.ancestor_at(level);
            if let Some(entry) = self.tree.get(&anc) {
                return Some((anc, entry));
            }
        }
        None
    }

    /// Whether any strict descendant of `loc` is a leaf.
    ///
    /// Descendants of a key sort contiguously after it, so one probe past
    /// `loc` suffices.
    pub fn has_descendant(&self, loc: &LogicalLocation) -> bool {
        self.tree
            .range((Bound::Excluded(*loc), Bound::Unbounded))
            .next()
            .is_some_and(|(k, _)| loc.contains(k))
    }

    /// Iterate over the tree's leaves in Morton order.
    pub fn leaves(&self) -> impl Iterator<Item = (&LogicalLocation, &TreeEntry)> {
        self.tree.iter()
    }

    /// Number of leaves in the tree.
    pub fn n_leaves(&self) -> usize {
        self.tree.len()
    }
}

/// A neighbor face sharing an edge: where the shared edge sits in the
/// neighbor's frame, and the relative orientation of the two edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeNeighbor {
    /// The neighboring face.
    pub face: FaceId,
    /// Location of the shared edge on the neighboring face.
    pub edge: EdgeLoc,
    /// `+1` if the edges agree in order, `-1` if mirrored.
    pub orientation: i8,
}

/// A same-level cell produced by a neighbor query, possibly expressed in a
/// different face's coordinate frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRef {
    /// Face the cell lives in.
    pub face: FaceId,
    /// The cell, in `face`'s frame.
    pub loc: LogicalLocation,
    /// Orientation of the crossed edge; `+1` when no face boundary was
    /// crossed.
    pub orientation: i8,
    /// Query-frame axes whose traversal order is reversed in the neighbor
    /// frame: the edge-parallel axis under a mirrored junction, the
    /// crossing axis when both faces meet through same-side edges.
    pub flip: [bool; 3],
    /// Offset from the referenced cell back to the query cell, in the
    /// referenced cell's frame.
    pub rev_ox: [i8; 3],
}

/// A forest of faces: the macro topology of the simulation domain.
#[derive(Debug, Clone)]
pub struct Forest {
    ndim: usize,
    nodes: SlotMap<NodeId, Node>,
    faces: SlotMap<FaceId, Face>,
}

impl Forest {
    /// Create an empty forest for an `ndim`-dimensional domain
    /// (`1 ≤ ndim ≤ 3`).
    pub fn new(ndim: usize) -> Self {
        assert!((1..=3).contains(&ndim), "ndim must be 1, 2 or 3");
        Self {
            ndim,
            nodes: SlotMap::with_key(),
            faces: SlotMap::with_key(),
        }
    }

    /// Dimensionality of the domain.
    pub fn ndim(&self) -> usize {
        self.ndim
    }

    /// Add a vertex at `pos` and return its id.
    pub fn add_node(&mut self, pos: [Real; 2]) -> NodeId {
        self.nodes.insert(Node {
            pos,
            faces: Vec::new(),
        })
    }

    /// Add a face with corners in `[SW, SE, NW, NE]` order.
    ///
    /// Registers the new face with each of its four nodes.
    pub fn add_face(&mut self, corners: [NodeId; 4]) -> Result<FaceId, TopologyError> {
        if corners.iter().any(|id| !self.nodes.contains_key(*id)) {
            return Err(TopologyError::UnknownNode);
        }
        if !corners.iter().all_unique() {
            return Err(TopologyError::DegenerateFace);
        }
        let id = self.faces.insert(Face {
            nodes: corners,
            tree: BTreeMap::new(),
        });
        for corner in corners {
            let faces = &mut self.nodes[corner].faces;
            if let Err(pos) = faces.binary_search(&id) {
                faces.insert(pos, id);
            }
        }
        Ok(id)
    }

    /// The node with the given id.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// The face with the given id.
    pub fn face(&self, id: FaceId) -> &Face {
        &self.faces[id]
    }

    /// Iterate over all faces in insertion order.
    pub fn faces(&self) -> impl Iterator<Item = (FaceId, &Face)> {
        self.faces.iter()
    }

    /// Number of faces in the forest.
    pub fn n_faces(&self) -> usize {
        self.faces.len()
    }

    /// All faces joined to `face` along the edge at `edge_loc`.
    ///
    /// Candidates are drawn from the face sets of the edge's two endpoints;
    /// any candidate edge with a non-zero relative orientation is a match.
    /// More than one match can occur at non-manifold junctions; the result
    /// order carries no meaning.
    pub fn find_edge_neighbors(&self, face: FaceId, edge_loc: EdgeLoc) -> Vec<EdgeNeighbor> {
        let edge = self.faces[face].edge(edge_loc);
        let candidates = edge
            .nodes
            .iter()
            .flat_map(|&n| self.nodes[n].faces.iter().copied())
            .filter(|&f| f != face)
            .unique();
        let mut out = Vec::new();
        for candidate in candidates {
            for loc in EdgeLoc::ALL {
                let orientation = edge.relative_orientation(&self.faces[candidate].edge(loc));
                if orientation != 0 {
                    out.push(EdgeNeighbor {
                        face: candidate,
                        edge: loc,
                        orientation,
                    });
                }
            }
        }
        out
    }

    /// All faces sharing only the given corner of `face`: faces that touch
    /// the corner node without sharing either incident edge.
    pub fn find_corner_neighbors(&self, face: FaceId, corner: Corner) -> Vec<(FaceId, Corner)> {
        let node_id = self.faces[face].corner_node(corner);
        let incident: Vec<Edge> = corner
            .edges()
            .into_iter()
            .map(|e| self.faces[face].edge(e))
            .collect();
        let mut out = Vec::new();
        for &candidate in self.nodes[node_id].faces.iter().filter(|&&f| f != face) {
            let cand = &self.faces[candidate];
            let shares_edge = incident.iter().any(|e| {
                EdgeLoc::ALL
                    .iter()
                    .any(|&l| e.relative_orientation(&cand.edge(l)) != 0)
            });
            if shares_edge {
                continue;
            }
            if let Some(pos) = cand.nodes.iter().position(|&n| n == node_id) {
                out.push((candidate, Corner::ALL[pos]));
            }
        }
        out
    }

    /// Insert a leaf entry at `loc` into the tree of `face`.
    ///
    /// Fails if `loc` lies outside the tree or overlaps an existing key.
    pub fn seed(
        &mut self,
        face: FaceId,
        loc: LogicalLocation,
        entry: TreeEntry,
    ) -> Result<(), TopologyError> {
        if !loc.is_in_tree() {
            return Err(TopologyError::OutOfTree { loc });
        }
        let tree = &self.faces[face].tree;
        for (key, _) in tree.iter() {
            if key.contains(&loc) {
                return Err(TopologyError::OverlappingKeys {
                    face,
                    outer: *key,
                    inner: loc,
                });
            }
            if loc.contains(key) {
                return Err(TopologyError::OverlappingKeys {
                    face,
                    outer: loc,
                    inner: *key,
                });
            }
        }
        self.faces[face].tree.insert(loc, entry);
        Ok(())
    }

    /// Replace the leaf at `loc` with its `2^ndim` children.
    ///
    /// `entries` assigns ownership to the children in child-index order
    /// (`o1` fastest).
    pub fn refine(
        &mut self,
        face: FaceId,
        loc: LogicalLocation,
        entries: Vec<TreeEntry>,
    ) -> Result<(), TopologyError> {
        let children = loc.children(self.ndim);
        assert_eq!(
            entries.len(),
            children.len(),
            "refine needs one entry per child"
        );
        let tree = &mut self.faces[face].tree;
        if tree.remove(&loc).is_none() {
            return Err(TopologyError::NoSuchLeaf { face, loc });
        }
        for (child, entry) in children.into_iter().zip(entries) {
            tree.insert(child, entry);
        }
        Ok(())
    }

    /// Replace the `2^ndim` children of `parent` with a single leaf owned by
    /// `entry`.
    pub fn derefine(
        &mut self,
        face: FaceId,
        parent: LogicalLocation,
        entry: TreeEntry,
    ) -> Result<(), TopologyError> {
        let children = parent.children(self.ndim);
        let tree = &mut self.faces[face].tree;
        if let Some(missing) = children.iter().find(|c| !tree.contains_key(c)) {
            return Err(TopologyError::NoSuchLeaf {
                face,
                loc: *missing,
            });
        }
        for child in &children {
            tree.remove(child);
        }
        tree.insert(parent, entry);
        Ok(())
    }

    /// Same-level cell(s) adjacent to `loc` at offset `(ox1, ox2, ox3)`,
    /// following face junctions where the offset leaves the tree.
    ///
    /// `periodic` wraps the corresponding direction within the tree itself
    /// (used when a direction is periodic with a single face of extent).
    /// An empty result means the offset leaves the domain through a
    /// physical boundary.
    pub fn shifted_cells(
        &self,
        face: FaceId,
        loc: &LogicalLocation,
        ox: [i64; 3],
        periodic: [bool; 3],
    ) -> Vec<CellRef> {
        let n = 1i64 << loc.level();
        let mut t = [loc.lx1() + ox[0], loc.lx2() + ox[1], loc.lx3() + ox[2]];

        // Direction 3 never crosses a face junction.
        if !(0..n).contains(&t[2]) {
            if periodic[2] {
                t[2] = t[2].rem_euclid(n);
            } else {
                return Vec::new();
            }
        }
        for d in 0..2 {
            if periodic[d] {
                t[d] = t[d].rem_euclid(n);
            }
        }
        let cross1 = !(0..n).contains(&t[0]);
        let cross2 = !(0..n).contains(&t[1]);

        match (cross1, cross2) {
            (false, false) => {
                let rev = [-ox[0] as i8, -ox[1] as i8, -ox[2] as i8];
                vec![CellRef {
                    face,
                    loc: LogicalLocation::new(loc.level(), t[0], t[1], t[2]),
                    orientation: 1,
                    flip: [false; 3],
                    rev_ox: rev,
                }]
            }
            (true, false) | (false, true) => self.cells_across_edge(face, loc.level(), t, ox),
            (true, true) => self.cells_across_corner(face, loc.level(), t, ox),
        }
    }

    fn cells_across_edge(
        &self,
        face: FaceId,
        level: u32,
        t: [i64; 3],
        ox: [i64; 3],
    ) -> Vec<CellRef> {
        let n = 1i64 << level;
        let (edge_loc, along) = if !(0..n).contains(&t[0]) {
            (
                if t[0] < 0 { EdgeLoc::West } else { EdgeLoc::East },
                1usize,
            )
        } else {
            (
                if t[1] < 0 { EdgeLoc::South } else { EdgeLoc::North },
                0usize,
            )
        };
        let a = t[along];
        let crossed = 1 - along;
        let mut out = Vec::new();
        for nb in self.find_edge_neighbors(face, edge_loc) {
            let a2 = if nb.orientation == 1 { a } else { n - 1 - a };
            let (u1, u2) = match nb.edge {
                EdgeLoc::West => (0, a2),
                EdgeLoc::East => (n - 1, a2),
                EdgeLoc::South => (a2, 0),
                EdgeLoc::North => (a2, n - 1),
            };
            let along2 = nb.edge.along_axis();
            let crossed2 = 1 - along2;
            let mut rev = [0i8; 3];
            rev[crossed2] = match nb.edge {
                EdgeLoc::West | EdgeLoc::South => -1,
                EdgeLoc::East | EdgeLoc::North => 1,
            };
            rev[along2] = -nb.orientation * ox[along] as i8;
            rev[2] = -ox[2] as i8;
            let mut flip = [false; 3];
            flip[along] = nb.orientation == -1;
            // Same-side entry (east-to-east style gluing) reverses the
            // crossing axis as well.
            flip[crossed] = i64::from(rev[crossed2]) == ox[crossed];
            out.push(CellRef {
                face: nb.face,
                loc: LogicalLocation::new(level, u1, u2, t[2]),
                orientation: nb.orientation,
                flip,
                rev_ox: rev,
            });
        }
        out
    }

    fn cells_across_corner(
        &self,
        face: FaceId,
        level: u32,
        t: [i64; 3],
        ox: [i64; 3],
    ) -> Vec<CellRef> {
        let n = 1i64 << level;
        let corner = match (t[0] >= n, t[1] >= n) {
            (false, false) => Corner::Sw,
            (true, false) => Corner::Se,
            (false, true) => Corner::Nw,
            (true, true) => Corner::Ne,
        };
        let mut out = Vec::new();
        for (f2, c2) in self.find_corner_neighbors(face, corner) {
            let (u1, u2, r1, r2) = match c2 {
                Corner::Sw => (0, 0, -1, -1),
                Corner::Se => (n - 1, 0, 1, -1),
                Corner::Nw => (0, n - 1, -1, 1),
                Corner::Ne => (n - 1, n - 1, 1, 1),
            };
            out.push(CellRef {
                face: f2,
                loc: LogicalLocation::new(level, u1, u2, t[2]),
                orientation: 1,
                flip: [false; 3],
                rev_ox: [r1, r2, -ox[2] as i8],
            });
        }
        out
    }

    /// Face edges with no orientation match in any other face.
    ///
    /// Such edges must coincide with the physical domain boundary; a mesh
    /// build checks them against its boundary configuration.
    pub fn unmatched_edges(&self) -> Vec<(FaceId, EdgeLoc)> {
        let mut out = Vec::new();
        for (id, _) in self.faces.iter() {
            for loc in EdgeLoc::ALL {
                if self.find_edge_neighbors(id, loc).is_empty() {
                    out.push((id, loc));
                }
            }
        }
        out
    }

    /// Validate every face's refinement tree: no overlapping keys, and the
    /// leaves cover the face exactly.
    pub fn validate_trees(&self) -> Result<(), TopologyError> {
        for (id, face) in self.faces.iter() {
            if face.tree.is_empty() {
                continue;
            }
            for ((a, _), (b, _)) in face.tree.iter().tuple_windows() {
                if a.contains(b) {
                    return Err(TopologyError::OverlappingKeys {
                        face: id,
                        outer: *a,
                        inner: *b,
                    });
                }
            }
            // Exact cover: leaf volumes sum to the whole face.
            let max_level = face.tree.keys().map(|l| l.level()).max().unwrap_or(0);
            let full = 1u128 << (self.ndim as u32 * max_level);
            let covered: u128 = face
                .tree
                .keys()
                .map(|l| 1u128 << (self.ndim as u32 * (max_level - l.level())))
                .sum();
            if covered != full {
                // Report the shallowest incomplete sibling group.
                let (loc, _) = face.tree.iter().next_back().unwrap();
                let parent = loc.ancestor_at(loc.level().saturating_sub(1));
                let expected = 1 << self.ndim;
                let found = parent
                    .children(self.ndim)
                    .iter()
                    .filter(|c| face.tree.contains_key(c))
                    .count();
                return Err(TopologyError::PartialSiblings {
                    face: id,
                    parent,
                    found,
                    expected,
                });
            }
        }
        Ok(())
    }
}
