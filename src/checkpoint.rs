//! Checkpoint state of a mesh: per-block field values in a dense interior
//! layout. Ghost zones are not persisted; an exchange after restore
//! refills them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mesh::Mesh;
use crate::Real;

/// A failure while applying checkpoint state to a mesh.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// The named field is not declared on the target block.
    #[error("block {gid} has no field `{name}`")]
    UnknownField {
        /// Target block id.
        gid: u64,
        /// Field name from the checkpoint.
        name: String,
    },
    /// The stored data length does not match the block's interior.
    #[error("field `{name}` on block {gid}: expected {expected} values, found {found}")]
    LengthMismatch {
        /// Target block id.
        gid: u64,
        /// Field name.
        name: String,
        /// Interior cell count times components.
        expected: usize,
        /// Values present in the checkpoint.
        found: usize,
    },
}

/// Serialized state of one field on one block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldState {
    /// Global id of the owning block.
    pub gid: u64,
    /// Field name.
    pub name: String,
    /// Whether the field was allocated.
    pub allocated: bool,
    /// Number of components.
    pub nv: usize,
    /// Interior values in `(v, k, j, i)` order; empty when unallocated.
    pub data: Vec<Real>,
}

/// Capture the state of every field on every local block.
pub fn save_state(mesh: &Mesh) -> Vec<FieldState> {
    let mut out = Vec::new();
    for block in mesh.blocks() {
        let b = block.cellbounds();
        for field in block.fields() {
            let mut data = Vec::new();
            if let Some(arr) = field.data() {
                for v in 0..field.nv() {
                    for k in b.interior(2).s..=b.interior(2).e {
                        for j in b.interior(1).s..=b.interior(1).e {
                            for i in b.interior(0).s..=b.interior(0).e {
                                data.push(arr[[v, k as usize, j as usize, i as usize]]);
                            }
                        }
                    }
                }
            }
            out.push(FieldState {
                gid: block.gid(),
                name: field.name().to_string(),
                allocated: field.is_allocated(),
                nv: field.nv(),
                data,
            });
        }
    }
    out
}

/// Apply checkpoint state to the local blocks of a mesh.
///
/// States addressed to blocks this rank does not own are skipped. Ghost
/// zones are untouched; run an exchange afterwards to refill them.
pub fn restore_state(mesh: &mut Mesh, states: &[FieldState]) -> Result<(), CheckpointError> {
    for state in states {
        let Some(block) = mesh.block_mut(state.gid) else {
            continue;
        };
        let bounds = *block.cellbounds();
        let interior: usize = [0, 1, 2].map(|d| bounds.interior(d).count()).iter().product();
        let field = block
            .field_mut(&state.name)
            .ok_or_else(|| CheckpointError::UnknownField {
                gid: state.gid,
                name: state.name.clone(),
            })?;
        if !state.allocated {
            field.deallocate();
            continue;
        }
        let expected = state.nv * interior;
        if state.data.len() != expected {
            return Err(CheckpointError::LengthMismatch {
                gid: state.gid,
                name: state.name.clone(),
                expected,
                found: state.data.len(),
            });
        }
        field.allocate();
        let arr = field.data_mut().expect("just allocated");
        let mut at = 0usize;
        for v in 0..state.nv {
            for k in bounds.interior(2).s..=bounds.interior(2).e {
                for j in bounds.interior(1).s..=bounds.interior(1).e {
                    for i in bounds.interior(0).s..=bounds.interior(0).e {
                        arr[[v, k as usize, j as usize, i as usize]] = state.data[at];
                        at += 1;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::{FieldDescriptor, Metadata, MetadataFlag};
    use crate::forest::{Forest, TreeEntry};
    use crate::loc::LogicalLocation;
    use crate::mesh::MeshConfig;

    fn small_mesh() -> Mesh {
        let mut forest = Forest::new(2);
        let n: Vec<_> = (0..4)
            .map(|i| forest.add_node([i as Real, 0.0]))
            .collect();
        let f = forest.add_face([n[0], n[1], n[2], n[3]]).unwrap();
        forest
            .seed(f, LogicalLocation::ROOT, TreeEntry { gid: 0, rank: 0 })
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
    fn state_roundtrips_through_json() {
        let mut mesh = small_mesh();
        {
            let block = mesh.block_mut(0).unwrap();
            let data = block.field_mut("rho").unwrap().data_mut().unwrap();
            data[[0, 0, 2, 2]] = 42.0;
            data[[0, 0, 0, 0]] = 7.0; // a ghost cell, not persisted
        }
        let states = save_state(&mesh);
        assert_eq!(states.len(), 2);
        assert_eq!(states[0].data.len(), 16);
        assert!(!states[1].allocated);
        assert!(states[1].data.is_empty());

        let text = serde_json::to_string(&states).unwrap();
        let parsed: Vec<FieldState> = serde_json::from_str(&text).unwrap();

        let mut restored = small_mesh();
        restore_state(&mut restored, &parsed).unwrap();
        let block = restored.block(0).unwrap();
        let data = block.field("rho").unwrap().data().unwrap();
        assert_eq!(data[[0, 0, 2, 2]], 42.0);
        assert_eq!(data[[0, 0, 0, 0]], 0.0);
        assert!(!block.field("s").unwrap().is_allocated());
    }

    #[test]
    fn restore_checks_data_length() {
        let mut mesh = small_mesh();
        let states = vec![FieldState {
            gid: 0,
            name: "rho".to_string(),
            allocated: true,
            nv: 1,
            data: vec![0.0; 3],
        }];
        assert!(matches!(
            restore_state(&mut mesh, &states),
            Err(CheckpointError::LengthMismatch { expected: 16, .. })
        ));
    }
}
