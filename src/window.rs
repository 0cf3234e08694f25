//! Source and destination index windows for ghost-zone exchange.
//!
//! Each routine computes one inclusive per-axis range; a full
//! [`IndexWindow`] is composed per neighbor from three of them. Sender and
//! receiver derive their windows independently from the shared
//! `(ox, fi, level, lx, cellbounds)` data, so every pair of routines here
//! must agree bit-exactly on cell counts.

use crate::error::WindowError;
use crate::loc::LogicalLocation;

/// Inclusive index range along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRange {
    /// First index.
    pub s: i64,
    /// Last index.
    pub e: i64,
}

impl IndexRange {
    /// Create a range from first and last index.
    pub fn new(s: i64, e: i64) -> Self {
        Self { s, e }
    }

    /// Number of indices in the range.
    pub fn count(&self) -> usize {
        (self.e - self.s + 1).max(0) as usize
    }
}

/// Cell index bounds of a block: per-direction interior ranges plus the
/// ghost width. Directions of extent one are collapsed to `[0, 0]` and
/// carry no ghosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellBounds {
    interior: [IndexRange; 3],
    nghost: i64,
    active: [bool; 3],
}

impl CellBounds {
    /// Bounds for a block of interior extents `nx` with `nghost` ghost
    /// cells on each active side.
    pub fn new(nx: [usize; 3], nghost: usize) -> Self {
        let g = nghost as i64;
        let mut interior = [IndexRange::new(0, 0); 3];
        let mut active = [false; 3];
        for d in 0..3 {
            if nx[d] > 1 {
                interior[d] = IndexRange::new(g, g + nx[d] as i64 - 1);
                active[d] = true;
            }
        }
        Self {
            interior,
            nghost: g,
            active,
        }
    }

    /// Interior range along direction `d`.
    pub fn interior(&self, d: usize) -> IndexRange {
        self.interior[d]
    }

    /// Interior plus ghost range along direction `d`.
    pub fn entire(&self, d: usize) -> IndexRange {
        if self.active[d] {
            IndexRange::new(self.interior[d].s - self.nghost, self.interior[d].e + self.nghost)
        } else {
            self.interior[d]
        }
    }

    /// Whether direction `d` has extent greater than one.
    pub fn is_active(&self, d: usize) -> bool {
        self.active[d]
    }

    /// Ghost width of active directions.
    pub fn nghost(&self) -> i64 {
        self.nghost
    }

    /// Total (interior plus ghost) extents per direction.
    pub fn dims(&self) -> [usize; 3] {
        [0, 1, 2].map(|d| self.entire(d).count())
    }
}

/// A 3-D inclusive index window, one range per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexWindow {
    /// Ranges along directions 1, 2, 3.
    pub ranges: [IndexRange; 3],
}

impl IndexWindow {
    /// Compose a window from three per-direction ranges.
    pub fn new(ranges: [IndexRange; 3]) -> Self {
        Self { ranges }
    }

    /// Number of cells in the window.
    pub fn count(&self) -> usize {
        self.ranges.iter().map(IndexRange::count).product()
    }

    /// Fail unless the window lies within arrays of the given per-direction
    /// extents. Out-of-bounds windows are a sender/receiver mismatch and
    /// must not be clipped.
    pub fn check(&self, dims: [usize; 3]) -> Result<(), WindowError> {
        let ok = self
            .ranges
            .iter()
            .zip(dims)
            .all(|(r, d)| r.s >= 0 && r.e < d as i64 && r.s <= r.e);
        if ok {
            Ok(())
        } else {
            Err(WindowError {
                si: self.ranges[0].s,
                ei: self.ranges[0].e,
                sj: self.ranges[1].s,
                ej: self.ranges[1].e,
                sk: self.ranges[2].s,
                ek: self.ranges[2].e,
                dims: [dims[2], dims[1], dims[0]],
            })
        }
    }
}

/// Source range for a same-level neighbor: the interior for `ox = 0`, or
/// the `w` interior cells adjacent to the crossed boundary.
pub fn load_same(ox: i8, r: IndexRange, w: i64) -> IndexRange {
    match ox {
        0 => r,
        _ if ox > 0 => IndexRange::new(r.e - w + 1, r.e),
        _ => IndexRange::new(r.s, r.s + w - 1),
    }
}

/// Destination range for a same-level neighbor: symmetric to [`load_same`]
/// across the boundary, writing the `w` ghost cells outside the interior.
pub fn set_same(ox: i8, r: IndexRange, w: i64) -> IndexRange {
    match ox {
        0 => r,
        _ if ox > 0 => IndexRange::new(r.e + 1, r.e + w),
        _ => IndexRange::new(r.s - w, r.s - 1),
    }
}

/// Source range on the coarse bounds when sending to a coarser neighbor.
///
/// Identical in shape to [`load_same`]; the fine sender restricts into its
/// coarse array first, whose cells are the same size as the receiver's.
pub fn load_to_coarser(ox: i8, cr: IndexRange, w: i64) -> IndexRange {
    load_same(ox, cr, w)
}

/// Source range when sending to a finer neighbor, on the sender's own
/// bounds.
///
/// Zero-offset directions select the half interval covered by the fine
/// neighbor and extend it by `cn` cells on the inward side; crossed
/// directions take the `cn` cells at the boundary.
pub fn load_to_finer(ox: i8, r: IndexRange, fi: u8, cn: i64, active: bool) -> IndexRange {
    if !active {
        return r;
    }
    match ox {
        0 => {
            let h = (r.count() as i64) / 2;
            if fi == 0 {
                IndexRange::new(r.s, r.s + h - 1 + cn)
            } else {
                IndexRange::new(r.s + h - cn, r.e)
            }
        }
        _ if ox > 0 => IndexRange::new(r.e - cn + 1, r.e),
        _ => IndexRange::new(r.s, r.s + cn - 1),
    }
}

/// Destination range on the receiver's coarse bounds when receiving from a
/// coarser neighbor.
///
/// Zero-offset directions cover the coarse interior extended by `cg` on the
/// side selected by the parity of the receiver's own `lx`; crossed
/// directions take the `cg` coarse ghost cells outside the interior.
pub fn set_from_coarser(ox: i8, cr: IndexRange, lx_even: bool, cg: i64, active: bool) -> IndexRange {
    if !active {
        return cr;
    }
    match ox {
        0 => {
            if lx_even {
                IndexRange::new(cr.s, cr.e + cg)
            } else {
                IndexRange::new(cr.s - cg, cr.e)
            }
        }
        _ if ox > 0 => IndexRange::new(cr.e + 1, cr.e + cg),
        _ => IndexRange::new(cr.s - cg, cr.s - 1),
    }
}

/// Destination range when receiving from a finer neighbor, on the
/// receiver's own bounds.
///
/// Zero-offset directions take the half interval covered by the fine
/// sender; crossed directions take the `w` ghost cells outside the
/// interior.
pub fn set_from_finer(ox: i8, r: IndexRange, fi: u8, w: i64, active: bool) -> IndexRange {
    if !active {
        return r;
    }
    match ox {
        0 => {
            let h = (r.count() as i64) / 2;
            if fi == 0 {
                IndexRange::new(r.s, r.s + h - 1)
            } else {
                IndexRange::new(r.s + h, r.e)
            }
        }
        _ => set_same(ox, r, w),
    }
}

/// Distribute the two fine-neighbor selectors over the zero-offset
/// directions: in `(x1, x2, x3)` order, the first active zero-offset
/// direction consumes `fi1`, the second `fi2`.
pub fn fine_selectors(ox: [i8; 3], fi1: u8, fi2: u8, active: [bool; 3]) -> [u8; 3] {
    let mut out = [0u8; 3];
    let mut pending = [fi1, fi2].into_iter();
    for d in 0..3 {
        if ox[d] == 0 && active[d] {
            out[d] = pending.next().unwrap_or(0);
        }
    }
    out
}

/// Compose the same-level source window.
pub fn load_same_window(ox: [i8; 3], b: &CellBounds) -> IndexWindow {
    IndexWindow::new([0, 1, 2].map(|d| load_same(ox[d], b.interior(d), b.nghost())))
}

/// Compose the same-level destination window.
pub fn set_same_window(ox: [i8; 3], b: &CellBounds) -> IndexWindow {
    IndexWindow::new([0, 1, 2].map(|d| set_same(ox[d], b.interior(d), b.nghost())))
}

/// Compose the source window for a coarser neighbor on the sender's coarse
/// bounds; `w` is the receiver's ghost width.
pub fn load_to_coarser_window(ox: [i8; 3], cb: &CellBounds, w: i64) -> IndexWindow {
    IndexWindow::new([0, 1, 2].map(|d| load_to_coarser(ox[d], cb.interior(d), w)))
}

/// Compose the source window for a finer neighbor on the sender's own
/// bounds; `cn` is the inward extension width.
pub fn load_to_finer_window(ox: [i8; 3], fi: [u8; 3], b: &CellBounds, cn: i64) -> IndexWindow {
    IndexWindow::new(
        [0, 1, 2].map(|d| load_to_finer(ox[d], b.interior(d), fi[d], cn, b.is_active(d))),
    )
}

/// Compose the destination window for a coarser neighbor on the receiver's
/// coarse bounds; parity comes from the receiver's own location.
pub fn set_from_coarser_window(
    ox: [i8; 3],
    cb: &CellBounds,
    loc: &LogicalLocation,
    cg: i64,
) -> IndexWindow {
    IndexWindow::new([0, 1, 2].map(|d| {
        set_from_coarser(
            ox[d],
            cb.interior(d),
            loc.lx(d) % 2 == 0,
            cg,
            cb.is_active(d),
        )
    }))
}

/// Compose the destination window for a finer neighbor on the receiver's
/// own bounds.
pub fn set_from_finer_window(ox: [i8; 3], fi: [u8; 3], b: &CellBounds) -> IndexWindow {
    IndexWindow::new(
        [0, 1, 2].map(|d| set_from_finer(ox[d], b.interior(d), fi[d], b.nghost(), b.is_active(d))),
    )
}
