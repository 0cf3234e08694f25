//! Simulation fields: metadata flags, cell data, and per-neighbor exchange
//! buffers.
//!
//! A [`Field`] exclusively owns its data arrays and its send buffers. The
//! receive buffers it owns may be written by a local sender during the
//! delivery phase of an exchange; the two writers (local pack or message
//! arrival) are mutually exclusive per buffer, decided at pack time.

use std::collections::BTreeMap;

use ndarray::Array4;

use crate::window::CellBounds;
use crate::Real;

/// A single metadata flag of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataFlag {
    /// Ghost zones of this field are filled by boundary exchange.
    FillGhost = 1 << 0,
    /// The field carries flux data alongside cell values.
    WithFluxes = 1 << 1,
    /// The field may be unallocated on some blocks.
    Sparse = 1 << 2,
    /// The field is evolved independently (not derived from others).
    Independent = 1 << 3,
}

/// A set of metadata flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Metadata(u8);

impl Metadata {
    /// The empty flag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a flag.
    pub fn with(self, flag: MetadataFlag) -> Self {
        Self(self.0 | flag as u8)
    }

    /// Whether the set contains `flag`.
    pub fn has(&self, flag: MetadataFlag) -> bool {
        self.0 & flag as u8 != 0
    }
}

/// Progress of one boundary buffer through an exchange.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BufferState {
    /// Freshly created, never reset.
    #[default]
    Uninitialized,
    /// Reset for the current exchange; not yet packed (send) or arrived
    /// (receive).
    Pending,
    /// Packed and ready to post (send side only).
    Filled,
    /// Message content is present (receive side only).
    Arrived,
    /// This exchange is done with the buffer.
    Completed,
}

/// One flat exchange buffer and its progress flag.
#[derive(Debug, Clone)]
pub struct BoundaryBuffer {
    /// Buffer payload plus one trailing tag element.
    pub data: Vec<Real>,
    /// Progress flag.
    pub state: BufferState,
}

impl BoundaryBuffer {
    fn new(len: usize) -> Self {
        Self {
            data: vec![0.0; len + 1],
            state: BufferState::Uninitialized,
        }
    }
}

/// Static description of a field, shared by all blocks of a mesh.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    /// Field name, unique within a mesh.
    pub name: String,
    /// Metadata flags.
    pub meta: Metadata,
    /// Number of components.
    pub nv: usize,
    /// Value written into newly allocated cells.
    pub default_value: Real,
}

impl FieldDescriptor {
    /// A one-component field with the given flags and zero default fill.
    pub fn new(name: impl Into<String>, meta: Metadata) -> Self {
        Self {
            name: name.into(),
            meta,
            nv: 1,
            default_value: 0.0,
        }
    }

    /// Set the number of components.
    pub fn with_nv(mut self, nv: usize) -> Self {
        self.nv = nv;
        self
    }

    /// Set the default fill value.
    pub fn with_default(mut self, value: Real) -> Self {
        self.default_value = value;
        self
    }
}

/// A block-local variable with optionally unallocated (sparse) data.
#[derive(Debug, Clone)]
pub struct Field {
    desc: FieldDescriptor,
    dims: [usize; 4],
    c_dims: [usize; 4],
    data: Option<Array4<Real>>,
    coarse: Option<Array4<Real>>,
    send: BTreeMap<usize, BoundaryBuffer>,
    recv: BTreeMap<usize, BoundaryBuffer>,
    zero_streak: u32,
}

impl Field {
    /// Create a field on a block with the given fine and coarse bounds.
    ///
    /// Dense fields are allocated immediately; sparse fields start
    /// unallocated when `sparse_enabled`.
    pub(crate) fn new(
        desc: FieldDescriptor,
        bounds: &CellBounds,
        c_bounds: &CellBounds,
        sparse_enabled: bool,
    ) -> Self {
        let [n1, n2, n3] = bounds.dims();
        let [c1, c2, c3] = c_bounds.dims();
        let dims = [desc.nv, n3, n2, n1];
        let c_dims = [desc.nv, c3, c2, c1];
        let mut field = Self {
            desc,
            dims,
            c_dims,
            data: None,
            coarse: None,
            send: BTreeMap::new(),
            recv: BTreeMap::new(),
            zero_streak: 0,
        };
        if !(sparse_enabled && field.is_sparse()) {
            field.allocate();
        }
        field
    }

    /// Field name.
    pub fn name(&self) -> &str {
        &self.desc.name
    }

    /// Metadata flags.
    pub fn metadata(&self) -> Metadata {
        self.desc.meta
    }

    /// Number of components.
    pub fn nv(&self) -> usize {
        self.desc.nv
    }

    /// Value written into newly allocated cells.
    pub fn default_value(&self) -> Real {
        self.desc.default_value
    }

    /// Whether the field carries the `Sparse` flag.
    pub fn is_sparse(&self) -> bool {
        self.desc.meta.has(MetadataFlag::Sparse)
    }

    /// Whether the field's data is currently allocated.
    pub fn is_allocated(&self) -> bool {
        self.data.is_some()
    }

    /// Allocate the data arrays, filling cells with the default value.
    ///
    /// Allocating resets the zero-observation streak used by the
    /// deallocation sweep. Idempotent when already allocated.
    pub fn allocate(&mut self) {
        self.zero_streak = 0;
        if self.data.is_none() {
            self.data = Some(Array4::from_elem(self.dims, self.desc.default_value));
            self.coarse = Some(Array4::zeros(self.c_dims));
        }
    }

    /// Drop the data arrays.
    pub fn deallocate(&mut self) {
        self.data = None;
        self.coarse = None;
        self.zero_streak = 0;
    }

    /// The `(v, k, j, i)` data array, if allocated.
    pub fn data(&self) -> Option<&Array4<Real>> {
        self.data.as_ref()
    }

    /// Mutable access to the data array, if allocated.
    pub fn data_mut(&mut self) -> Option<&mut Array4<Real>> {
        self.data.as_mut()
    }

    /// The half-resolution coarse array, if allocated.
    pub fn coarse(&self) -> Option<&Array4<Real>> {
        self.coarse.as_ref()
    }

    /// Mutable access to the coarse array, if allocated.
    pub fn coarse_mut(&mut self) -> Option<&mut Array4<Real>> {
        self.coarse.as_mut()
    }

    /// Whether any cell value strictly exceeds `threshold` in magnitude.
    pub fn has_value_above(&self, threshold: Real) -> bool {
        self.data
            .as_ref()
            .is_some_and(|d| d.iter().any(|v| v.abs() > threshold))
    }

    /// Advance the deallocation streak after a sweep that observed no
    /// qualifying value; returns the new streak length.
    pub(crate) fn bump_zero_streak(&mut self) -> u32 {
        self.zero_streak += 1;
        self.zero_streak
    }

    /// Reset the deallocation streak after observing a qualifying value.
    pub(crate) fn reset_zero_streak(&mut self) {
        self.zero_streak = 0;
    }

    /// Split borrow for restriction: the fine data read-only, the coarse
    /// array writable.
    pub(crate) fn restrict_parts(&mut self) -> (Option<&Array4<Real>>, Option<&mut Array4<Real>>) {
        (self.data.as_ref(), self.coarse.as_mut())
    }

    /// Split borrow for packing: both arrays read-only plus the writable
    /// send buffer for `buf_id`.
    pub(crate) fn load_parts(
        &mut self,
        buf_id: usize,
    ) -> (
        Option<&Array4<Real>>,
        Option<&Array4<Real>>,
        &mut BoundaryBuffer,
    ) {
        let buf = self
            .send
            .get_mut(&buf_id)
            .expect("send buffer not initialized");
        (self.data.as_ref(), self.coarse.as_ref(), buf)
    }

    /// Split borrow for unpacking: the receive buffer for `buf_id` plus
    /// both arrays writable.
    pub(crate) fn set_parts(
        &mut self,
        buf_id: usize,
    ) -> (
        &mut BoundaryBuffer,
        Option<&mut Array4<Real>>,
        Option<&mut Array4<Real>>,
    ) {
        let buf = self
            .recv
            .get_mut(&buf_id)
            .expect("recv buffer not initialized");
        (buf, self.data.as_mut(), self.coarse.as_mut())
    }

    /// Create the send and receive buffers for the neighbor slot `buf_id`.
    pub(crate) fn init_buffers(&mut self, buf_id: usize, send_len: usize, recv_len: usize) {
        self.send.insert(buf_id, BoundaryBuffer::new(send_len));
        self.recv.insert(buf_id, BoundaryBuffer::new(recv_len));
    }

    /// The send buffer for the neighbor slot `buf_id`.
    pub(crate) fn send_buf(&self, buf_id: usize) -> &BoundaryBuffer {
        self.send.get(&buf_id).expect("send buffer not initialized")
    }

    /// Mutable send buffer for the neighbor slot `buf_id`.
    pub(crate) fn send_buf_mut(&mut self, buf_id: usize) -> &mut BoundaryBuffer {
        self.send
            .get_mut(&buf_id)
            .expect("send buffer not initialized")
    }

    /// The receive buffer for the neighbor slot `buf_id`.
    pub(crate) fn recv_buf(&self, buf_id: usize) -> &BoundaryBuffer {
        self.recv.get(&buf_id).expect("recv buffer not initialized")
    }

    /// Mutable receive buffer for the neighbor slot `buf_id`.
    pub(crate) fn recv_buf_mut(&mut self, buf_id: usize) -> &mut BoundaryBuffer {
        self.recv
            .get_mut(&buf_id)
            .expect("recv buffer not initialized")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bounds() -> (CellBounds, CellBounds) {
        (CellBounds::new([4, 4, 1], 2), CellBounds::new([2, 2, 1], 1))
    }

    #[test]
    fn metadata_flags_compose() {
        let meta = Metadata::new()
            .with(MetadataFlag::FillGhost)
            .with(MetadataFlag::Sparse);
        assert!(meta.has(MetadataFlag::FillGhost));
        assert!(meta.has(MetadataFlag::Sparse));
        assert!(!meta.has(MetadataFlag::WithFluxes));
    }

    #[test]
    fn dense_fields_allocate_on_creation() {
        let (b, cb) = bounds();
        let desc = FieldDescriptor::new("rho", Metadata::new().with(MetadataFlag::FillGhost));
        let field = Field::new(desc, &b, &cb, true);
        assert!(field.is_allocated());
        assert_eq!(field.data().unwrap().shape(), &[1, 1, 8, 8]);
    }

    #[test]
    fn sparse_fields_start_unallocated() {
        let (b, cb) = bounds();
        let desc = FieldDescriptor::new(
            "s",
            Metadata::new()
                .with(MetadataFlag::FillGhost)
                .with(MetadataFlag::Sparse),
        )
        .with_default(3.5);
        let mut field = Field::new(desc, &b, &cb, true);
        assert!(!field.is_allocated());

        field.allocate();
        assert!(field.is_allocated());
        assert!(field.data().unwrap().iter().all(|&v| v == 3.5));
        assert_eq!(field.coarse().unwrap().shape(), &[1, 1, 4, 4]);
    }

    #[test]
    fn threshold_scan_is_strict() {
        let (b, cb) = bounds();
        let desc = FieldDescriptor::new("s", Metadata::new().with(MetadataFlag::Sparse));
        let mut field = Field::new(desc, &b, &cb, false);
        assert!(!field.has_value_above(0.0));
        field.data_mut().unwrap()[[0, 0, 3, 3]] = 1e-6;
        assert!(!field.has_value_above(1e-6));
        assert!(field.has_value_above(9e-7));
    }
}
