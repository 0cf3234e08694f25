//! The ghost-zone exchange pipelines: pack and deliver send buffers, poll
//! receives, and set ghost zones.
//!
//! Each pipeline is one pass over the canonical cache order. Packing writes
//! the on-wire layout directly (`i` fastest, then `j`, `k`, component),
//! already expressed in the receiver's index order (mirrored junction axes
//! are traversed in reverse), with a trailing tag element that is `1.0`
//! exactly when some packed value exceeds the allocation threshold.
//!
//! [`receive_boundary_buffers`] is the only routine that can return
//! [`TaskStatus::Incomplete`] and be re-polled; the others complete in one
//! call.

#[cfg(feature = "mpi")]
pub mod mpi;

use std::time::Instant;

use log::{debug, trace};
use ndarray::Array4;

use crate::error::ExchangeError;
use crate::field::BufferState;
use crate::mesh::{CacheKind, Mesh};
use crate::task::TaskStatus;
use crate::window::IndexWindow;
use crate::Real;

/// Derive the message tag for one buffer from symmetric endpoint data.
///
/// Both endpoints compute the same value: the sender from its own gid and
/// `target_id`, the receiver from the sender's gid and its own `buf_id`.
#[allow(dead_code)]
pub(crate) fn message_tag(sender_gid: u64, target_id: usize, field_slot: usize, tag_ub: i32) -> i32 {
    let h = fxhash::hash64(&(sender_gid, target_id, field_slot));
    (h % tag_ub as u64) as i32
}

/// Pack, tag, and deliver every send buffer of the mesh.
///
/// Local-rank neighbors receive their data by direct copy into the peer's
/// receive buffer (allocating sparse peers that are sent non-zero data);
/// off-rank neighbors are posted through the attached transport.
pub fn send_boundary_buffers(mesh: &mut Mesh) -> Result<TaskStatus, ExchangeError> {
    let status = mesh.alloc_status();
    if mesh
        .load_cache
        .as_ref()
        .map_or(true, |c| c.alloc_status != status)
    {
        mesh.load_cache = Some(mesh.build_cache(CacheKind::Load)?);
    }
    let cache = mesh.load_cache.take().expect("load cache just built");
    let threshold = mesh.config.sparse.allocation_threshold;

    // Reset all progress flags before any packing so that local delivery
    // within this pass cannot be clobbered.
    for entry in &cache.entries {
        let buf_id = mesh.blocks[entry.block].neighbors()[entry.nb].buf_id;
        let field = &mut mesh.blocks[entry.block].fields[entry.field];
        field.send_buf_mut(buf_id).state = BufferState::Pending;
        field.recv_buf_mut(buf_id).state = BufferState::Pending;
    }

    // Pack kernel: restriction, then the flat on-wire layout plus tag.
    let mut nonzero = vec![false; cache.entries.len()];
    for (idx, entry) in cache.entries.iter().enumerate() {
        let block = &mut mesh.blocks[entry.block];
        let gid = block.gid();
        let bounds = *block.cellbounds();
        let c_bounds = *block.c_cellbounds();
        let nb = block.neighbors()[entry.nb];
        let field = &mut block.fields[entry.field];
        if field.is_allocated() != entry.allocated {
            return Err(ExchangeError::AllocationMismatch {
                gid,
                field: field.name().to_string(),
            });
        }
        if entry.restrict {
            let (data, coarse) = field.restrict_parts();
            if let (Some(data), Some(coarse)) = (data, coarse) {
                let active = [0, 1, 2].map(|d| bounds.is_active(d));
                let fine_s = [0, 1, 2].map(|d| bounds.interior(d).s);
                let coarse_s = [0, 1, 2].map(|d| c_bounds.interior(d).s);
                restrict_window(data, coarse, &entry.window, entry.nv, fine_s, coarse_s, active);
            }
        }
        let (data, coarse, buf) = field.load_parts(nb.buf_id);
        let src = if entry.on_coarse { coarse } else { data };
        let sent_nonzero = pack_window(
            src,
            &entry.window,
            nb.flip,
            entry.nv,
            &mut buf.data,
            threshold,
        );
        buf.data[entry.len] = if sent_nonzero { 1.0 } else { 0.0 };
        buf.state = BufferState::Filled;
        nonzero[idx] = sent_nonzero;
    }

    // The pack loops above are synchronous, so the fence between packing
    // and posting is implicit.

    // Delivery: local copy or transport post.
    for (idx, entry) in cache.entries.iter().enumerate() {
        let nb = mesh.blocks[entry.block].neighbors()[entry.nb];
        let sender_gid = mesh.blocks[entry.block].gid();
        if nb.rank == mesh.config.my_rank {
            let peer = mesh
                .block_index(nb.gid)
                .expect("local neighbor block not found");
            let (src_block, dst_block) = mesh.pair_mut(entry.block, peer);
            let dst_field = &mut dst_block.fields[entry.field];
            if nonzero[idx] && !dst_field.is_allocated() {
                debug!(
                    "allocating sparse field `{}` on block {} for non-zero data from {}",
                    dst_field.name(),
                    nb.gid,
                    sender_gid
                );
                dst_field.allocate();
            }
            let src = &src_block.fields[entry.field].send_buf(nb.buf_id).data;
            let dst = dst_field.recv_buf_mut(nb.target_id);
            dst.data.copy_from_slice(src);
            dst.state = BufferState::Arrived;
        } else {
            #[cfg(feature = "mpi")]
            {
                let transport = mesh
                    .transport
                    .as_mut()
                    .ok_or(ExchangeError::TransportUnavailable { gid: sender_gid })?;
                let tag = message_tag(sender_gid, nb.target_id, entry.field, transport.tag_ub());
                let buf = &mesh.blocks[entry.block].fields[entry.field]
                    .send_buf(nb.buf_id)
                    .data;
                transport.post_send(nb.rank, tag, buf);
            }
            #[cfg(not(feature = "mpi"))]
            {
                return Err(ExchangeError::TransportUnavailable { gid: sender_gid });
            }
        }
        let buf_id = nb.buf_id;
        mesh.blocks[entry.block].fields[entry.field]
            .send_buf_mut(buf_id)
            .state = BufferState::Completed;
    }
    trace!("sent {} boundary buffers", cache.entries.len());
    mesh.load_cache = Some(cache);
    Ok(TaskStatus::Complete)
}

/// Poll every receive buffer; [`TaskStatus::Complete`] once all have
/// arrived.
///
/// Guards the poll loop with the configured wall-clock timeout; expiry is
/// fatal, since a missing message cannot be recovered locally.
pub fn receive_boundary_buffers(mesh: &mut Mesh) -> Result<TaskStatus, ExchangeError> {
    let started = *mesh.recv_started.get_or_insert_with(Instant::now);
    let mut outstanding = 0usize;
    for (b, f, n) in mesh.boundary_triples() {
        let nb = mesh.blocks[b].neighbors()[n];
        let state = mesh.blocks[b].fields[f].recv_buf(nb.buf_id).state;
        if matches!(state, BufferState::Arrived | BufferState::Completed) {
            continue;
        }
        if nb.rank != mesh.config.my_rank {
            #[cfg(feature = "mpi")]
            if try_receive(mesh, b, f, n)? {
                continue;
            }
        }
        outstanding += 1;
    }
    if outstanding == 0 {
        mesh.recv_started = None;
        return Ok(TaskStatus::Complete);
    }
    if started.elapsed() > mesh.config.receive_timeout {
        mesh.recv_started = None;
        return Err(ExchangeError::ReceiveTimeout {
            waited_ms: started.elapsed().as_millis(),
            outstanding,
        });
    }
    Ok(TaskStatus::Incomplete)
}

/// Probe the transport for one buffer; on arrival, apply the sparse
/// allocation protocol before marking the buffer arrived.
#[cfg(feature = "mpi")]
fn try_receive(mesh: &mut Mesh, b: usize, f: usize, n: usize) -> Result<bool, ExchangeError> {
    let nb = mesh.blocks[b].neighbors()[n];
    let Some(transport) = mesh.transport.as_mut() else {
        return Err(ExchangeError::TransportUnavailable {
            gid: mesh.blocks[b].gid(),
        });
    };
    let tag = message_tag(nb.gid, nb.buf_id, f, transport.tag_ub());
    let sparse_enabled = mesh.config.sparse.enabled;
    let field = &mut mesh.blocks[b].fields[f];
    let arrived = {
        let buf = field.recv_buf_mut(nb.buf_id);
        if transport.try_recv(nb.rank, tag, &mut buf.data) {
            buf.state = BufferState::Arrived;
            true
        } else {
            false
        }
    };
    if arrived {
        let tagged_nonzero = *field.recv_buf(nb.buf_id).data.last().expect("tag element") != 0.0;
        if tagged_nonzero && sparse_enabled && field.is_sparse() && !field.is_allocated() {
            field.allocate();
        }
    }
    Ok(arrived)
}

/// Unpack every arrived buffer into its ghost window and mark the
/// receives complete.
///
/// Sparse fields receiving an all-zero tag get zeros written instead of an
/// unpack; unallocated destinations are skipped entirely.
pub fn set_boundaries(mesh: &mut Mesh) -> Result<TaskStatus, ExchangeError> {
    let status = mesh.alloc_status();
    if mesh
        .set_cache
        .as_ref()
        .map_or(true, |c| c.alloc_status != status)
    {
        mesh.set_cache = Some(mesh.build_cache(CacheKind::Set)?);
    }
    let cache = mesh.set_cache.take().expect("set cache just built");
    let sparse_enabled = mesh.config.sparse.enabled;

    for entry in &cache.entries {
        let block = &mut mesh.blocks[entry.block];
        let gid = block.gid();
        let nb = block.neighbors()[entry.nb];
        let field = &mut block.fields[entry.field];
        if field.is_allocated() != entry.allocated {
            return Err(ExchangeError::AllocationMismatch {
                gid,
                field: field.name().to_string(),
            });
        }
        let sparse = sparse_enabled && field.is_sparse();
        let (buf, data, coarse) = field.set_parts(nb.buf_id);
        let dst = if entry.on_coarse { coarse } else { data };
        if let Some(dst) = dst {
            if sparse && buf.data[entry.len] == 0.0 {
                fill_window(dst, &entry.window, entry.nv, 0.0);
            } else {
                unpack_window(&buf.data, &entry.window, entry.nv, dst);
            }
        }
        buf.state = BufferState::Completed;
    }
    trace!("set {} boundary windows", cache.entries.len());
    mesh.set_cache = Some(cache);
    Ok(TaskStatus::Complete)
}

/// Deallocation sweep for sparse fields.
///
/// A sparse field deallocates after `deallocation_count` consecutive
/// sweeps in which no interior or ghost value exceeds the allocation
/// threshold; any qualifying value resets the streak.
pub fn deallocate_sparse_fields(mesh: &mut Mesh) {
    if !mesh.config.sparse.enabled {
        return;
    }
    let threshold = mesh.config.sparse.allocation_threshold;
    let count = mesh.config.sparse.deallocation_count;
    for block in &mut mesh.blocks {
        let gid = block.gid();
        for field in &mut block.fields {
            if !field.is_sparse() || !field.is_allocated() {
                continue;
            }
            if field.has_value_above(threshold) {
                field.reset_zero_streak();
            } else if field.bump_zero_streak() >= count {
                debug!("deallocating sparse field `{}` on block {}", field.name(), gid);
                field.deallocate();
            }
        }
    }
}

fn axis_index(r: crate::window::IndexRange, flip: bool, offset: usize) -> usize {
    if flip {
        (r.e - offset as i64) as usize
    } else {
        (r.s + offset as i64) as usize
    }
}

/// Pack `src` over `window` into `buf` in the receiver's index order,
/// returning whether any packed value exceeds `threshold`. An unallocated
/// source packs zeros.
fn pack_window(
    src: Option<&Array4<Real>>,
    window: &IndexWindow,
    flip: [bool; 3],
    nv: usize,
    buf: &mut [Real],
    threshold: Real,
) -> bool {
    let [ri, rj, rk] = window.ranges;
    let mut nonzero = false;
    let mut at = 0usize;
    for v in 0..nv {
        for kk in 0..rk.count() {
            let k = axis_index(rk, flip[2], kk);
            for jj in 0..rj.count() {
                let j = axis_index(rj, flip[1], jj);
                for ii in 0..ri.count() {
                    let i = axis_index(ri, flip[0], ii);
                    let value = src.map_or(0.0, |d| d[[v, k, j, i]]);
                    nonzero |= value.abs() > threshold;
                    buf[at] = value;
                    at += 1;
                }
            }
        }
    }
    nonzero
}

/// Unpack `buf` into `dst` over `window` in ascending index order.
fn unpack_window(buf: &[Real], window: &IndexWindow, nv: usize, dst: &mut Array4<Real>) {
    let [ri, rj, rk] = window.ranges;
    let mut at = 0usize;
    for v in 0..nv {
        for k in rk.s..=rk.e {
            for j in rj.s..=rj.e {
                for i in ri.s..=ri.e {
                    dst[[v, k as usize, j as usize, i as usize]] = buf[at];
                    at += 1;
                }
            }
        }
    }
}

/// Write a constant into `dst` over `window`.
fn fill_window(dst: &mut Array4<Real>, window: &IndexWindow, nv: usize, value: Real) {
    let [ri, rj, rk] = window.ranges;
    for v in 0..nv {
        for k in rk.s..=rk.e {
            for j in rj.s..=rj.e {
                for i in ri.s..=ri.e {
                    dst[[v, k as usize, j as usize, i as usize]] = value;
                }
            }
        }
    }
}

/// Average the fine data into the coarse array over a coarse-index window.
fn restrict_window(
    fine: &Array4<Real>,
    coarse: &mut Array4<Real>,
    window: &IndexWindow,
    nv: usize,
    fine_s: [i64; 3],
    coarse_s: [i64; 3],
    active: [bool; 3],
) {
    let [ri, rj, rk] = window.ranges;
    let reps = active.map(|a| if a { 2i64 } else { 1 });
    let norm = 1.0 / (reps[0] * reps[1] * reps[2]) as Real;
    let base = |d: usize, c: i64| {
        if active[d] {
            fine_s[d] + 2 * (c - coarse_s[d])
        } else {
            c
        }
    };
    for v in 0..nv {
        for k in rk.s..=rk.e {
            for j in rj.s..=rj.e {
                for i in ri.s..=ri.e {
                    let (fi, fj, fk) = (base(0, i), base(1, j), base(2, k));
                    let mut sum = 0.0;
                    for o3 in 0..reps[2] {
                        for o2 in 0..reps[1] {
                            for o1 in 0..reps[0] {
                                sum += fine[[
                                    v,
                                    (fk + o3) as usize,
                                    (fj + o2) as usize,
                                    (fi + o1) as usize,
                                ]];
                            }
                        }
                    }
                    coarse[[v, k as usize, j as usize, i as usize]] = sum * norm;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::time::Duration;

    use super::*;
    use crate::field::{FieldDescriptor, Metadata, MetadataFlag};
    use crate::forest::{Forest, NodeId, TreeEntry};
    use crate::input::ParameterInput;
    use crate::loc::LogicalLocation;
    use crate::mesh::{load_window, set_window, MeshConfig, SparseConfig};
    use crate::window::IndexRange;

    fn dense(name: &str) -> FieldDescriptor {
        FieldDescriptor::new(name, Metadata::new().with(MetadataFlag::FillGhost))
    }

    fn sparse(name: &str) -> FieldDescriptor {
        FieldDescriptor::new(
            name,
            Metadata::new()
                .with(MetadataFlag::FillGhost)
                .with(MetadataFlag::Sparse),
        )
    }

    fn exchange(mesh: &mut Mesh) {
        send_boundary_buffers(mesh).unwrap();
        assert_eq!(
            receive_boundary_buffers(mesh).unwrap(),
            TaskStatus::Complete
        );
        set_boundaries(mesh).unwrap();
    }

    fn fill_interior(mesh: &mut Mesh, gid: u64, name: &str, f: impl Fn(i64, i64) -> Real) {
        let block = mesh.block_mut(gid).unwrap();
        let (ri, rj) = {
            let b = block.cellbounds();
            (b.interior(0), b.interior(1))
        };
        let data = block.field_mut(name).unwrap().data_mut().unwrap();
        for j in rj.s..=rj.e {
            for i in ri.s..=ri.e {
                data[[0, 0, j as usize, i as usize]] = f(i, j);
            }
        }
    }

    fn cell(mesh: &Mesh, gid: u64, name: &str, i: i64, j: i64) -> Real {
        mesh.block(gid).unwrap().field(name).unwrap().data().unwrap()[[0, 0, j as usize, i as usize]]
    }

    fn periodic_row_mesh() -> Mesh {
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
        Mesh::from_input(&pin, vec![dense("rho")]).unwrap()
    }

    /// Two root faces east-west with aligned orientation.
    fn pair_mesh(fields: Vec<FieldDescriptor>, sparse_cfg: SparseConfig) -> Mesh {
        let mut forest = Forest::new(2);
        let n: Vec<NodeId> = [
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
        let config = MeshConfig {
            sparse: sparse_cfg,
            ..MeshConfig::default()
        };
        Mesh::build(forest, config, fields).unwrap()
    }

    fn sparse_cfg() -> SparseConfig {
        SparseConfig {
            enabled: true,
            allocation_threshold: 1e-6,
            deallocation_count: 1,
        }
    }

    /// Invariant: every descriptor's load window pairs with the peer's set
    /// window of equal cell count, and the slot ids cross-reference.
    fn assert_symmetric_windows(mesh: &Mesh) {
        for block in mesh.blocks() {
            for nb in block.neighbors() {
                let peer = mesh.block(nb.gid).unwrap();
                let peer_nb = peer
                    .neighbors()
                    .iter()
                    .find(|p| p.buf_id == nb.target_id)
                    .unwrap_or_else(|| {
                        panic!("no reverse descriptor for {} -> {}", block.gid(), nb.gid)
                    });
                assert_eq!(peer_nb.gid, block.gid());
                assert_eq!(peer_nb.target_id, nb.buf_id);
                let (load, _, _) = load_window(block, nb);
                let (set, _, _) = set_window(peer, peer_nb);
                assert_eq!(
                    load.count(),
                    set.count(),
                    "windows of {} -> {} differ",
                    block.gid(),
                    nb.gid
                );
            }
        }
    }

    #[test]
    fn windows_are_symmetric_across_all_topologies() {
        assert_symmetric_windows(&periodic_row_mesh());
        assert_symmetric_windows(&pair_mesh(vec![dense("rho")], SparseConfig::default()));
        assert_symmetric_windows(&level_jump_mesh());
        assert_symmetric_windows(&mirror_mesh());
    }

    #[test]
    fn periodic_row_carries_values_both_ways() {
        let mut mesh = periodic_row_mesh();
        fill_interior(&mut mesh, 0, "rho", |_, _| 1.0);
        exchange(&mut mesh);

        for j in 2..=5 {
            // Block 1 sees block 0 through its west ghosts.
            assert_eq!(cell(&mesh, 1, "rho", 0, j), 1.0);
            assert_eq!(cell(&mesh, 1, "rho", 1, j), 1.0);
            assert_eq!(cell(&mesh, 1, "rho", 6, j), 0.0);
            // Block 3 sees block 0 through its east ghosts via the wrap.
            assert_eq!(cell(&mesh, 3, "rho", 6, j), 1.0);
            assert_eq!(cell(&mesh, 3, "rho", 7, j), 1.0);
            assert_eq!(cell(&mesh, 3, "rho", 0, j), 0.0);
            // Block 2 is two blocks away on either side.
            assert_eq!(cell(&mesh, 2, "rho", 0, j), 0.0);
            assert_eq!(cell(&mesh, 2, "rho", 7, j), 0.0);
        }
    }

    #[test]
    fn exchange_is_idempotent() {
        let mut mesh = periodic_row_mesh();
        for gid in 0..4 {
            fill_interior(&mut mesh, gid, "rho", |i, j| (gid as i64 * 100 + i + 10 * j) as Real);
        }
        exchange(&mut mesh);
        let snapshot: Vec<_> = mesh
            .blocks()
            .iter()
            .map(|b| b.field("rho").unwrap().data().unwrap().clone())
            .collect();
        exchange(&mut mesh);
        for (block, before) in mesh.blocks().iter().zip(&snapshot) {
            assert_eq!(block.field("rho").unwrap().data().unwrap(), before);
        }
    }

    /// Coarse face A west, refined face B east (four fine blocks 1..=4).
    fn level_jump_mesh() -> Mesh {
        let mut forest = Forest::new(2);
        let n: Vec<NodeId> = [
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
        Mesh::build(forest, MeshConfig::default(), vec![dense("rho")]).unwrap()
    }

    #[test]
    fn level_jump_restricts_and_forwards_coarse_data() {
        let mut mesh = level_jump_mesh();
        // Coarse ramp on A, offset ramp on the west-edge fine block.
        fill_interior(&mut mesh, 0, "rho", |i, j| (i + j) as Real);
        fill_interior(&mut mesh, 1, "rho", |i, j| 100.0 + (i + j) as Real);
        exchange(&mut mesh);

        // The fine block's coarse ghost column equals A's boundary column:
        // coarse cells are A-sized, so the copy is direct.
        let b1 = mesh.block(1).unwrap();
        let coarse = b1.field("rho").unwrap().coarse().unwrap();
        for cj in 1..=3 {
            assert_eq!(coarse[[0, 0, cj, 0]], (5 + cj as i64 + 1) as Real);
        }

        // A's east ghosts hold the restricted averages of the fine data.
        assert_eq!(cell(&mesh, 0, "rho", 6, 2), 105.0);
        assert_eq!(cell(&mesh, 0, "rho", 6, 3), 107.0);
        assert_eq!(cell(&mesh, 0, "rho", 7, 2), 107.0);
        assert_eq!(cell(&mesh, 0, "rho", 7, 3), 109.0);
    }

    /// Two faces joined along one mirrored edge.
    fn mirror_mesh() -> Mesh {
        let mut forest = Forest::new(2);
        let n: Vec<NodeId> = (0..6)
            .map(|i| forest.add_node([i as Real, 0.0]))
            .collect();
        let f0 = forest.add_face([n[0], n[1], n[2], n[3]]).unwrap();
        let f1 = forest.add_face([n[3], n[4], n[1], n[5]]).unwrap();
        forest
            .seed(f0, LogicalLocation::ROOT, TreeEntry { gid: 0, rank: 0 })
            .unwrap();
        forest
            .seed(f1, LogicalLocation::ROOT, TreeEntry { gid: 1, rank: 0 })
            .unwrap();
        Mesh::build(forest, MeshConfig::default(), vec![dense("rho")]).unwrap()
    }

    #[test]
    fn mirrored_junction_reflects_ghost_data() {
        let mut mesh = mirror_mesh();
        fill_interior(&mut mesh, 0, "rho", |i, j| (i + 10 * j) as Real);
        exchange(&mut mesh);

        // Receiver cell (di, j) pairs with sender cell (4 + di, 7 - j):
        // the edge-parallel axis is reflected.
        for j in 2..=5i64 {
            for di in 0..2i64 {
                assert_eq!(
                    cell(&mesh, 1, "rho", di, j),
                    ((4 + di) + 10 * (7 - j)) as Real
                );
            }
        }
    }

    #[test]
    fn sparse_nonzero_data_allocates_the_receiver() {
        let mut mesh = pair_mesh(vec![sparse("s")], sparse_cfg());
        mesh.allocate_sparse(0, "s");
        fill_interior(&mut mesh, 0, "s", |_, _| 1e-3);
        // A stray ghost value on the sender: the all-zero reply from the
        // unallocated side must overwrite it with zeros.
        mesh.block_mut(0)
            .unwrap()
            .field_mut("s")
            .unwrap()
            .data_mut()
            .unwrap()[[0, 0, 3, 6]] = 7.0;
        exchange(&mut mesh);

        let b = mesh.block(1).unwrap().field("s").unwrap();
        assert!(b.is_allocated());
        for j in 2..=5 {
            assert_eq!(cell(&mesh, 1, "s", 0, j), 1e-3);
            assert_eq!(cell(&mesh, 1, "s", 1, j), 1e-3);
        }
        // Interior keeps the default fill.
        assert_eq!(cell(&mesh, 1, "s", 3, 3), 0.0);
        // The stray ghost value was overwritten by zeros.
        assert_eq!(cell(&mesh, 0, "s", 6, 3), 0.0);
    }

    #[test]
    fn sparse_zero_data_leaves_receiver_unallocated() {
        let mut mesh = pair_mesh(vec![sparse("s")], sparse_cfg());
        mesh.allocate_sparse(0, "s");
        fill_interior(&mut mesh, 0, "s", |_, _| 0.0);
        exchange(&mut mesh);

        assert!(!mesh.block(1).unwrap().field("s").unwrap().is_allocated());
        // Both directions carried a clear tag.
        let a = mesh.block(0).unwrap();
        let nb = a.neighbors()[0];
        let field = a.field("s").unwrap();
        let send = &field.send_buf(nb.buf_id).data;
        let recv = &field.recv_buf(nb.buf_id).data;
        assert_eq!(*send.last().unwrap(), 0.0);
        assert_eq!(*recv.last().unwrap(), 0.0);
    }

    #[test]
    fn values_at_threshold_count_as_zero() {
        let mut mesh = pair_mesh(vec![sparse("s")], sparse_cfg());
        mesh.allocate_sparse(0, "s");
        fill_interior(&mut mesh, 0, "s", |_, _| 1e-6);
        exchange(&mut mesh);
        assert!(!mesh.block(1).unwrap().field("s").unwrap().is_allocated());
    }

    #[test]
    fn deallocation_rebuilds_the_cache_and_reallocates() {
        let mut mesh = pair_mesh(vec![sparse("s")], sparse_cfg());
        mesh.allocate_sparse(0, "s");
        mesh.allocate_sparse(1, "s");
        fill_interior(&mut mesh, 0, "s", |_, _| 2e-3);
        exchange(&mut mesh);
        assert_eq!(cell(&mesh, 1, "s", 0, 3), 2e-3);

        mesh.block_mut(1)
            .unwrap()
            .field_mut("s")
            .unwrap()
            .deallocate();
        exchange(&mut mesh);
        let b = mesh.block(1).unwrap().field("s").unwrap();
        assert!(b.is_allocated());
        assert_eq!(cell(&mesh, 1, "s", 0, 3), 2e-3);
        assert_eq!(cell(&mesh, 1, "s", 1, 3), 2e-3);
    }

    #[test]
    fn sweep_deallocates_after_configured_streak() {
        let mut mesh = pair_mesh(
            vec![sparse("s")],
            SparseConfig {
                enabled: true,
                allocation_threshold: 1e-6,
                deallocation_count: 2,
            },
        );
        mesh.allocate_sparse(0, "s");
        deallocate_sparse_fields(&mut mesh);
        assert!(mesh.block(0).unwrap().field("s").unwrap().is_allocated());
        deallocate_sparse_fields(&mut mesh);
        assert!(!mesh.block(0).unwrap().field("s").unwrap().is_allocated());
    }

    #[test]
    fn receive_times_out_when_nothing_was_sent() {
        let mut mesh = pair_mesh(vec![dense("rho")], SparseConfig::default());
        send_boundary_buffers(&mut mesh).unwrap();
        assert_eq!(
            receive_boundary_buffers(&mut mesh).unwrap(),
            TaskStatus::Complete
        );

        // A fresh mesh that never sends: polling returns Incomplete, then
        // the zero timeout trips fatally.
        let mut mesh = pair_mesh(vec![dense("rho")], SparseConfig::default());
        mesh.config.receive_timeout = Duration::from_secs(3600);
        // Reset flags as a send would, without delivering anything.
        for block in &mut mesh.blocks {
            let ids: Vec<usize> = block.neighbors().iter().map(|nb| nb.buf_id).collect();
            for field in &mut block.fields {
                for &id in &ids {
                    field.recv_buf_mut(id).state = BufferState::Pending;
                }
            }
        }
        assert_eq!(
            receive_boundary_buffers(&mut mesh).unwrap(),
            TaskStatus::Incomplete
        );
        mesh.config.receive_timeout = Duration::ZERO;
        let err = receive_boundary_buffers(&mut mesh).unwrap_err();
        assert!(matches!(err, ExchangeError::ReceiveTimeout { .. }));
    }

    #[test]
    fn pack_applies_flips_in_receiver_order() {
        use ndarray::Array4;
        let mut data = Array4::zeros([1, 1, 4, 4]);
        for j in 0..4 {
            for i in 0..4 {
                data[[0, 0, j, i]] = (10 * j + i) as Real;
            }
        }
        let window = IndexWindow::new([
            IndexRange::new(2, 3),
            IndexRange::new(0, 3),
            IndexRange::new(0, 0),
        ]);
        let mut buf = vec![0.0; 9];
        let nonzero = pack_window(
            Some(&data),
            &window,
            [false, true, false],
            1,
            &mut buf,
            0.0,
        );
        assert!(nonzero);
        // j runs 3, 2, 1, 0; i runs 2, 3.
        assert_eq!(&buf[..8], &[32.0, 33.0, 22.0, 23.0, 12.0, 13.0, 2.0, 3.0]);
    }
}
