//! Logical locations within a face's refinement tree.
//!
//! A [`LogicalLocation`] names one cell of a refinement tree by its level
//! and per-direction integer coordinates. Interleaving the coordinate bits
//! at a fixed reference level yields a [`Morton`] number that totally
//! orders all locations of a tree, with every ancestor sorting immediately
//! before its descendants.

use std::cmp::Ordering;
use std::fmt;

use derive_more::{From, Into};

/// Finest refinement level representable by the Morton interleave
/// (3 × 21 = 63 bits).
pub const MAX_LEVEL: u32 = 21;

/// A Morton (Z-order) number derived from a [`LogicalLocation`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, From, Into)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Morton(u64);

/// A position in a refinement tree: a level and integer coordinates
/// `0 ≤ lx < 2^level` per direction.
///
/// Coordinates outside that range are permitted transiently while a
/// neighbor query decides whether it crossed a face boundary; they are
/// rejected when a location is inserted into a tree.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LogicalLocation {
    level: u32,
    lx1: i64,
    lx2: i64,
    lx3: i64,
}

impl LogicalLocation {
    /// The root of a refinement tree.
    pub const ROOT: LogicalLocation = LogicalLocation {
        level: 0,
        lx1: 0,
        lx2: 0,
        lx3: 0,
    };

    /// Create a location from a level and per-direction coordinates.
    pub fn new(level: u32, lx1: i64, lx2: i64, lx3: i64) -> Self {
        Self {
            level,
            lx1,
            lx2,
            lx3,
        }
    }

    /// The refinement level.
    pub fn level(&self) -> u32 {
        self.level
    }

    /// Coordinate along direction 1.
    pub fn lx1(&self) -> i64 {
        self.lx1
    }

    /// Coordinate along direction 2.
    pub fn lx2(&self) -> i64 {
        self.lx2
    }

    /// Coordinate along direction 3.
    pub fn lx3(&self) -> i64 {
        self.lx3
    }

    /// Coordinate along direction `d ∈ {0, 1, 2}`.
    pub fn lx(&self, d: usize) -> i64 {
        match d {
            0 => self.lx1,
            1 => self.lx2,
            2 => self.lx3,
            _ => panic!("direction index must be 0, 1 or 2"),
        }
    }

    /// Check that all coordinates lie in `[0, 2^level)`.
    pub fn is_in_tree(&self) -> bool {
        let n = 1i64 << self.level;
        [self.lx1, self.lx2, self.lx3]
            .iter()
            .all(|&lx| (0..n).contains(&lx))
    }

    /// The unique parent at `level − 1`, or `None` at the root.
    pub fn parent(&self) -> Option<LogicalLocation> {
        (self.level > 0).then(|| LogicalLocation {
            level: self.level - 1,
            lx1: self.lx1 >> 1,
            lx2: self.lx2 >> 1,
            lx3: self.lx3 >> 1,
        })
    }

    /// The child at `level + 1` selected by the per-direction bits
    /// `o1, o2, o3 ∈ {0, 1}`.
    pub fn child(&self, o1: i64, o2: i64, o3: i64) -> LogicalLocation {
        debug_assert!([o1, o2, o3].iter().all(|&o| o == 0 || o == 1));
        LogicalLocation {
            level: self.level + 1,
            lx1: (self.lx1 << 1) | o1,
            lx2: (self.lx2 << 1) | o2,
            lx3: (self.lx3 << 1) | o3,
        }
    }

    /// All `2^ndim` children in child-index order (`o1` fastest).
    pub fn children(&self, ndim: usize) -> Vec<LogicalLocation> {
        let (n3, n2) = (if ndim > 2 { 2 } else { 1 }, if ndim > 1 { 2 } else { 1 });
        let mut out = Vec::with_capacity(n3 * n2 * 2);
        for o3 in 0..n3 as i64 {
            for o2 in 0..n2 as i64 {
                for o1 in 0..2 {
                    out.push(self.child(o1, o2, o3));
                }
            }
        }
        out
    }

    /// The ancestor at `level ≤ self.level()` (or `self` at its own level).
    pub fn ancestor_at(&self, level: u32) -> LogicalLocation {
        assert!(level <= self.level, "ancestor level must not exceed own level");
        let shift = self.level - level;
        LogicalLocation {
            level,
            lx1: self.lx1 >> shift,
            lx2: self.lx2 >> shift,
            lx3: self.lx3 >> shift,
        }
    }

    /// Whether `other` is `self` or one of its descendants.
    pub fn contains(&self, other: &LogicalLocation) -> bool {
        if other.level < self.level {
            return false;
        }
        let shift = other.level - self.level;
        other.lx1 >> shift == self.lx1
            && other.lx2 >> shift == self.lx2
            && other.lx3 >> shift == self.lx3
    }

    /// The same-level location shifted by `(ox1, ox2, ox3)`.
    ///
    /// The result may lie outside the tree; see [`Self::is_in_tree`].
    pub fn offset(&self, ox1: i64, ox2: i64, ox3: i64) -> LogicalLocation {
        LogicalLocation {
            level: self.level,
            lx1: self.lx1 + ox1,
            lx2: self.lx2 + ox2,
            lx3: self.lx3 + ox3,
        }
    }

    /// The Morton number of this location, computed at [`MAX_LEVEL`].
    ///
    /// An ancestor shares the number of its first descendant chain, so the
    /// total order on locations is `(morton, level)`.
    pub fn morton(&self) -> Morton {
        debug_assert!(self.level <= MAX_LEVEL && self.is_in_tree());
        let up = MAX_LEVEL - self.level;
        let m = spread_bits((self.lx1 as u64) << up)
            | spread_bits((self.lx2 as u64) << up) << 1
            | spread_bits((self.lx3 as u64) << up) << 2;
        Morton(m)
    }
}

impl PartialOrd for LogicalLocation {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogicalLocation {
    fn cmp(&self, other: &Self) -> Ordering {
        self.morton()
            .cmp(&other.morton())
            .then(self.level.cmp(&other.level))
    }
}

impl fmt::Debug for LogicalLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(L{}: {}, {}, {})",
            self.level, self.lx1, self.lx2, self.lx3
        )
    }
}

impl fmt::Display for LogicalLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Insert two zero bits between each of the low 21 bits of `x`.
fn spread_bits(x: u64) -> u64 {
    let mut x = x & 0x1f_ffff;
    x = (x | x << 32) & 0x1f_0000_0000_ffff;
    x = (x | x << 16) & 0x1f_0000_ff00_00ff;
    x = (x | x << 8) & 0x100f_00f0_0f00_f00f;
    x = (x | x << 4) & 0x10c3_0c30_c30c_30c3;
    x = (x | x << 2) & 0x1249_2492_4924_9249;
    x
}
