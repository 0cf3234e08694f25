//! Key=value parameter input with `<section>` headers.
//!
//! ```text
//! <parthenon/mesh>
//! refinement = static    # none, static or adaptive
//! nx1 = 16
//! nx2 = 4
//! ```
//!
//! Duplicate keys within a section follow last-wins semantics. Package
//! sections are free-form; the mesh sections recognized here are
//! `parthenon/mesh`, `parthenon/meshblock` and `parthenon/sparse`.

use std::collections::BTreeMap;
use std::str::FromStr;

use thiserror::Error;

use crate::Real;

/// A failure while parsing or interpreting the parameter input.
#[derive(Debug, Error)]
pub enum InputError {
    /// A line was neither a section header, a key=value pair, a comment,
    /// nor blank.
    #[error("malformed input at line {line}: `{text}`")]
    Syntax {
        /// 1-based line number.
        line: usize,
        /// The offending line.
        text: String,
    },
    /// A required key was absent.
    #[error("missing key `{key}` in section <{section}>")]
    MissingKey {
        /// Section name.
        section: String,
        /// Key name.
        key: String,
    },
    /// A value failed to parse as the requested type.
    #[error("value `{value}` of `{section}/{key}` is not a valid {kind}")]
    BadValue {
        /// Section name.
        section: String,
        /// Key name.
        key: String,
        /// The raw value.
        value: String,
        /// The requested type.
        kind: &'static str,
    },
    /// Mesh block extents do not divide the mesh extents.
    #[error("meshblock nx{dir} = {block} does not divide mesh nx{dir} = {mesh}")]
    BlockMismatch {
        /// Direction index (1-based).
        dir: usize,
        /// Block extent.
        block: usize,
        /// Mesh extent.
        mesh: usize,
    },
    /// Inner and outer boundaries of a periodic direction must both be
    /// periodic.
    #[error("direction {dir} is periodic on one side only")]
    HalfPeriodic {
        /// Direction index (1-based).
        dir: usize,
    },
    /// A configuration this implementation does not support.
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
}

/// Parsed parameter input: sections of key=value pairs.
#[derive(Debug, Clone, Default)]
pub struct ParameterInput {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl FromStr for ParameterInput {
    type Err = InputError;

    fn from_str(text: &str) -> Result<Self, InputError> {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current = String::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('<').and_then(|l| l.strip_suffix('>')) {
                current = name.trim().to_string();
                sections.entry(current.clone()).or_default();
            } else if let Some((key, value)) = line.split_once('=') {
                sections
                    .entry(current.clone())
                    .or_default()
                    .insert(key.trim().to_string(), value.trim().to_string());
            } else {
                return Err(InputError::Syntax {
                    line: idx + 1,
                    text: raw.to_string(),
                });
            }
        }
        Ok(Self { sections })
    }
}

impl ParameterInput {
    /// Whether the input has a section of the given name.
    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// The raw string value of `section/key`, if present.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    fn require(&self, section: &str, key: &str) -> Result<&str, InputError> {
        self.get(section, key).ok_or_else(|| InputError::MissingKey {
            section: section.to_string(),
            key: key.to_string(),
        })
    }

    fn parse<T: FromStr>(
        &self,
        section: &str,
        key: &str,
        value: &str,
        kind: &'static str,
    ) -> Result<T, InputError> {
        value.parse().map_err(|_| InputError::BadValue {
            section: section.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            kind,
        })
    }

    /// A required integer value.
    pub fn get_integer(&self, section: &str, key: &str) -> Result<i64, InputError> {
        let value = self.require(section, key)?;
        self.parse(section, key, value, "integer")
    }

    /// An integer value with a default.
    pub fn get_integer_or(&self, section: &str, key: &str, default: i64) -> Result<i64, InputError> {
        match self.get(section, key) {
            Some(value) => self.parse(section, key, value, "integer"),
            None => Ok(default),
        }
    }

    /// A required real value.
    pub fn get_real(&self, section: &str, key: &str) -> Result<Real, InputError> {
        let value = self.require(section, key)?;
        self.parse(section, key, value, "real")
    }

    /// A real value with a default.
    pub fn get_real_or(&self, section: &str, key: &str, default: Real) -> Result<Real, InputError> {
        match self.get(section, key) {
            Some(value) => self.parse(section, key, value, "real"),
            None => Ok(default),
        }
    }

    /// A boolean value (`true`/`false`) with a default.
    pub fn get_bool_or(&self, section: &str, key: &str, default: bool) -> Result<bool, InputError> {
        match self.get(section, key) {
            Some(value) => self.parse(section, key, value, "boolean"),
            None => Ok(default),
        }
    }

    /// A required string value.
    pub fn get_string(&self, section: &str, key: &str) -> Result<String, InputError> {
        Ok(self.require(section, key)?.to_string())
    }

    /// A string value with a default.
    pub fn get_string_or(&self, section: &str, key: &str, default: &str) -> String {
        self.get(section, key).unwrap_or(default).to_string()
    }
}

/// Mesh refinement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Refinement {
    /// A uniform mesh at the root level.
    #[default]
    None,
    /// A statically refined mesh, fixed at startup.
    Static,
    /// Runtime-adaptive refinement.
    Adaptive,
}

impl FromStr for Refinement {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Refinement::None),
            "static" => Ok(Refinement::Static),
            "adaptive" => Ok(Refinement::Adaptive),
            _ => Err(()),
        }
    }
}

/// Physical boundary condition of one side of the domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BoundaryKind {
    /// Zero-gradient outflow.
    #[default]
    Outflow,
    /// Periodic wrap onto the opposite side.
    Periodic,
    /// Reflecting wall.
    Reflecting,
    /// Application-defined condition.
    User,
}

impl FromStr for BoundaryKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outflow" => Ok(BoundaryKind::Outflow),
            "periodic" => Ok(BoundaryKind::Periodic),
            "reflecting" => Ok(BoundaryKind::Reflecting),
            "user" => Ok(BoundaryKind::User),
            _ => Err(()),
        }
    }
}

/// The mesh geometry read from `parthenon/mesh` and `parthenon/meshblock`.
#[derive(Debug, Clone)]
pub struct MeshParams {
    /// Total mesh extents per direction.
    pub nx: [usize; 3],
    /// Block extents per direction; each divides the mesh extent.
    pub block_nx: [usize; 3],
    /// Refinement mode.
    pub refinement: Refinement,
    /// Number of refinement levels (1 = root only).
    pub numlevel: usize,
    /// `[inner, outer]` boundary per direction.
    pub bcs: [[BoundaryKind; 2]; 3],
}

impl MeshParams {
    /// Read and validate the mesh sections of an input.
    pub fn from_input(pin: &ParameterInput) -> Result<Self, InputError> {
        const MESH: &str = "parthenon/mesh";
        const BLOCK: &str = "parthenon/meshblock";

        let refinement = {
            let value = pin.get_string_or(MESH, "refinement", "none");
            pin.parse::<Refinement>(MESH, "refinement", &value, "refinement mode")?
        };
        let numlevel = pin.get_integer_or(MESH, "numlevel", 1)? as usize;

        let mut nx = [1usize; 3];
        let mut block_nx = [1usize; 3];
        let mut bcs = [[BoundaryKind::Outflow; 2]; 3];
        for d in 0..3 {
            let key = format!("nx{}", d + 1);
            nx[d] = pin.get_integer_or(MESH, &key, 1)? as usize;
            block_nx[d] = match pin.get(BLOCK, &key) {
                Some(value) => pin.parse::<usize>(BLOCK, &key, value, "integer")?,
                None => nx[d],
            };
            if nx[d] % block_nx[d] != 0 {
                return Err(InputError::BlockMismatch {
                    dir: d + 1,
                    block: block_nx[d],
                    mesh: nx[d],
                });
            }
            for (side, prefix) in ["ix", "ox"].iter().enumerate() {
                let key = format!("{}{}_bc", prefix, d + 1);
                let value = pin.get_string_or(MESH, &key, "outflow");
                bcs[d][side] = pin.parse(MESH, &key, &value, "boundary kind")?;
            }
            if (bcs[d][0] == BoundaryKind::Periodic) != (bcs[d][1] == BoundaryKind::Periodic) {
                return Err(InputError::HalfPeriodic { dir: d + 1 });
            }
        }

        Ok(Self {
            nx,
            block_nx,
            refinement,
            numlevel,
            bcs,
        })
    }

    /// Whether direction `d` is periodic.
    pub fn is_periodic(&self, d: usize) -> bool {
        self.bcs[d][0] == BoundaryKind::Periodic
    }

    /// Number of active dimensions.
    pub fn ndim(&self) -> usize {
        (0..3).rev().find(|&d| self.nx[d] > 1).map_or(1, |d| d + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# advection test setup
<parthenon/mesh>
refinement = none
nx1 = 16
nx2 = 4
ix1_bc = periodic
ox1_bc = periodic

<parthenon/meshblock>
nx1 = 4
nx2 = 4

<sparse_advection>
cfl = 0.45   # trailing comment
";

    #[test]
    fn parses_sections_and_comments() {
        let pin = ParameterInput::from_str(SAMPLE).unwrap();
        assert_eq!(pin.get_integer("parthenon/mesh", "nx1").unwrap(), 16);
        assert_eq!(pin.get_real("sparse_advection", "cfl").unwrap(), 0.45);
        assert_eq!(pin.get_integer_or("parthenon/mesh", "nx3", 1).unwrap(), 1);
        assert!(pin.has_section("parthenon/meshblock"));
    }

    #[test]
    fn last_value_wins() {
        let pin = ParameterInput::from_str("<a>\nx = 1\nx = 2\n").unwrap();
        assert_eq!(pin.get_integer("a", "x").unwrap(), 2);
    }

    #[test]
    fn syntax_errors_carry_line_numbers() {
        let err = ParameterInput::from_str("<a>\nnot a pair\n").unwrap_err();
        assert!(matches!(err, InputError::Syntax { line: 2, .. }));
    }

    #[test]
    fn mesh_params_validate_divisibility() {
        let pin = ParameterInput::from_str(SAMPLE).unwrap();
        let params = MeshParams::from_input(&pin).unwrap();
        assert_eq!(params.nx, [16, 4, 1]);
        assert_eq!(params.block_nx, [4, 4, 1]);
        assert!(params.is_periodic(0));
        assert!(!params.is_periodic(1));
        assert_eq!(params.ndim(), 2);

        let bad = ParameterInput::from_str(
            "<parthenon/mesh>\nnx1 = 10\n<parthenon/meshblock>\nnx1 = 4\n",
        )
        .unwrap();
        assert!(matches!(
            MeshParams::from_input(&bad),
            Err(InputError::BlockMismatch { dir: 1, .. })
        ));
    }

    #[test]
    fn half_periodic_is_rejected() {
        let pin = ParameterInput::from_str("<parthenon/mesh>\nnx1 = 8\nix1_bc = periodic\n")
            .unwrap();
        assert!(matches!(
            MeshParams::from_input(&pin),
            Err(InputError::HalfPeriodic { dir: 1 })
        ));
    }
}
