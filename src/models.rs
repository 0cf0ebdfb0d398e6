use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{FeaError, FeaResult};

/// Fixed key names of the candidate record supplied by the analytical front end.
pub mod keys {
    pub const LENGTH: &str = "length";
    pub const PLATE_THICKNESS: &str = "plate_thickness";
    pub const PLATE_WIDTH: &str = "plate_width";
    pub const PROFILE_NAME: &str = "profile_name";
    pub const PROFILE_HEIGHT: &str = "profile_height";
    pub const PROFILE_WIDTH: &str = "profile_width";
    pub const WEB_THICKNESS: &str = "web_thickness";
    pub const FLANGE_THICKNESS: &str = "flange_thickness";
    pub const ELASTIC_MODULUS: &str = "elastic_modulus";
    pub const SHEAR_MODULUS: &str = "shear_modulus";
    pub const POISSON_RATIO: &str = "poisson_ratio";
    pub const MATERIAL: &str = "material";
    pub const AXIAL_FORCE: &str = "axial_force";
    pub const SHEAR_FORCE_Y: &str = "shear_force_y";
    pub const SHEAR_FORCE_Z: &str = "shear_force_z";
    pub const MOMENT_X: &str = "moment_x";
    pub const MOMENT_Y: &str = "moment_y";
    pub const MOMENT_Z: &str = "moment_z";
    pub const LOAD_OFFSET_Y: &str = "load_offset_y";
    pub const LOAD_OFFSET_Z: &str = "load_offset_z";
}

/// Flat key → value record describing one candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct CandidateRecord(pub BTreeMap<String, serde_json::Value>);

impl CandidateRecord {
    pub fn number(&self, key: &str) -> Option<f64> {
        match self.0.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn text(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn require(&self, key: &str) -> FeaResult<f64> {
        self.number(key).ok_or_else(|| {
            FeaError::InputGeometry(format!("candidate record is missing numeric field '{}'", key))
        })
    }

    pub fn set_number(&mut self, key: &str, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.0.insert(key.to_string(), serde_json::Value::Number(n));
        }
    }

    /// All numeric fields, for use as expression symbols.
    pub fn numeric_symbols(&self) -> BTreeMap<String, f64> {
        self.0
            .keys()
            .filter_map(|k| self.number(k).map(|v| (k.clone(), v)))
            .collect()
    }
}

/// Plate + channel cross-section dimensions (mm).
///
/// The channel hangs below the plate with its flange toes welded to the plate
/// underside; the beam axis is global X, Y is transverse and Z is vertical.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SectionGeometry {
    /// Channel height (h)
    pub profile_height: f64,
    /// Channel width (b)
    pub profile_width: f64,
    /// Web thickness (tw)
    pub web_thickness: f64,
    /// Flange thickness (tf)
    pub flange_thickness: f64,
    /// Plate thickness (tp)
    pub plate_thickness: f64,
    /// Plate width (bp)
    pub plate_width: f64,
}

impl SectionGeometry {
    pub fn from_record(record: &CandidateRecord) -> FeaResult<Self> {
        Ok(Self {
            profile_height: record.require(keys::PROFILE_HEIGHT)?,
            profile_width: record.require(keys::PROFILE_WIDTH)?,
            web_thickness: record.require(keys::WEB_THICKNESS)?,
            flange_thickness: record.require(keys::FLANGE_THICKNESS)?,
            plate_thickness: record.require(keys::PLATE_THICKNESS)?,
            plate_width: record.require(keys::PLATE_WIDTH)?,
        })
    }

    /// Symbol table for probe expressions.
    pub fn symbols(&self, length: f64) -> BTreeMap<String, f64> {
        [
            ("h", self.profile_height),
            ("b", self.profile_width),
            ("tw", self.web_thickness),
            ("tf", self.flange_thickness),
            ("tp", self.plate_thickness),
            ("bp", self.plate_width),
            ("L", length),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }
}

/// How the elastic constants were obtained.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MaterialSpec {
    /// E and ν supplied directly
    Direct { elastic_modulus: f64, poisson_ratio: f64 },
    /// E and G supplied explicitly by the candidate; ν is derived and must be physical
    Explicit { elastic_modulus: f64, shear_modulus: f64 },
    /// Some elastic constants supplied but not a usable pair
    Incomplete {
        elastic_modulus: Option<f64>,
        shear_modulus: Option<f64>,
        poisson_ratio: Option<f64>,
    },
    /// Looked up by name in the material catalogue
    Catalogue { name: String },
    /// Nothing specified
    Default,
}

impl MaterialSpec {
    pub fn from_record(record: &CandidateRecord) -> Self {
        match (
            record.number(keys::ELASTIC_MODULUS),
            record.number(keys::SHEAR_MODULUS),
            record.number(keys::POISSON_RATIO),
        ) {
            (Some(e), Some(g), _) => MaterialSpec::Explicit {
                elastic_modulus: e,
                shear_modulus: g,
            },
            (Some(e), None, Some(nu)) => MaterialSpec::Direct {
                elastic_modulus: e,
                poisson_ratio: nu,
            },
            (None, None, None) => match record.text(keys::MATERIAL) {
                Some(name) if !name.trim().is_empty() => MaterialSpec::Catalogue { name },
                _ => MaterialSpec::Default,
            },
            (e, g, nu) => MaterialSpec::Incomplete {
                elastic_modulus: e,
                shear_modulus: g,
                poisson_ratio: nu,
            },
        }
    }
}

/// Six load components applied at the reference node (N, N·mm).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct LoadVector {
    pub fx: f64,
    pub fy: f64,
    pub fz: f64,
    pub mx: f64,
    pub my: f64,
    pub mz: f64,
}

impl LoadVector {
    pub fn from_record(record: &CandidateRecord) -> Self {
        let get = |k: &str| record.number(k).unwrap_or(0.0);
        Self {
            fx: get(keys::AXIAL_FORCE),
            fy: get(keys::SHEAR_FORCE_Y),
            fz: get(keys::SHEAR_FORCE_Z),
            mx: get(keys::MOMENT_X),
            my: get(keys::MOMENT_Y),
            mz: get(keys::MOMENT_Z),
        }
    }

    pub fn forces(&self) -> [f64; 3] {
        [self.fx, self.fy, self.fz]
    }

    pub fn moments(&self) -> [f64; 3] {
        [self.mx, self.my, self.mz]
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SolverKind {
    #[default]
    Direct,
    Iterative,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeshOrder {
    Linear,
    #[default]
    Quadratic,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ModelKind {
    #[default]
    Solid,
    Shell,
}

impl ModelKind {
    /// Load components at or below this magnitude are not written to the deck.
    pub fn load_threshold(&self) -> f64 {
        match self {
            ModelKind::Solid => 1e-9,
            ModelKind::Shell => 1e-5,
        }
    }
}

/// Everything the deck needs besides the mesh itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParameters {
    pub length: f64,
    pub geometry: SectionGeometry,
    pub material: MaterialSpec,
    pub loads: LoadVector,
    /// Transverse position (y, z) of the reference node at the loaded end
    pub load_offset: (f64, f64),
    pub solver: SolverKind,
    pub mesh_size: f64,
    pub mesh_order: MeshOrder,
    pub model: ModelKind,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeDisplacement {
    pub node_id: usize,
    pub dx: f64,
    pub dy: f64,
    pub dz: f64,
}

impl NodeDisplacement {
    pub fn magnitude(&self) -> f64 {
        (self.dx * self.dx + self.dy * self.dy + self.dz * self.dz).sqrt()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeReaction {
    pub node_id: usize,
    pub fx: f64,
    pub fy: f64,
    pub fz: f64,
}

/// Symmetric stress tensor in CalculiX component order.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct StressTensor {
    pub sxx: f64,
    pub syy: f64,
    pub szz: f64,
    pub sxy: f64,
    pub sxz: f64,
    pub syz: f64,
}

impl StressTensor {
    pub fn from_slice(v: &[f64]) -> Option<Self> {
        if v.len() < 6 {
            return None;
        }
        Some(Self {
            sxx: v[0],
            syy: v[1],
            szz: v[2],
            sxy: v[3],
            sxz: v[4],
            syz: v[5],
        })
    }

    pub fn von_mises(&self) -> f64 {
        (0.5 * ((self.sxx - self.syy).powi(2)
            + (self.syy - self.szz).powi(2)
            + (self.szz - self.sxx).powi(2)
            + 6.0 * (self.sxy.powi(2) + self.syz.powi(2) + self.sxz.powi(2))))
        .sqrt()
    }

    /// Mean of a set of tensors; zero tensor for an empty set.
    pub fn mean<'a>(tensors: impl IntoIterator<Item = &'a StressTensor>) -> Self {
        let mut acc = StressTensor::default();
        let mut count = 0usize;
        for t in tensors {
            acc.sxx += t.sxx;
            acc.syy += t.syy;
            acc.szz += t.szz;
            acc.sxy += t.sxy;
            acc.sxz += t.sxz;
            acc.syz += t.syz;
            count += 1;
        }
        if count == 0 {
            return acc;
        }
        let n = count as f64;
        StressTensor {
            sxx: acc.sxx / n,
            syy: acc.syy / n,
            szz: acc.szz / n,
            sxy: acc.sxy / n,
            sxz: acc.sxz / n,
            syz: acc.syz / n,
        }
    }
}

/// Nodal-averaged stress
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeStress {
    pub node_id: usize,
    pub tensor: StressTensor,
    pub von_mises: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SensorReading {
    pub key: String,
    pub node_id: usize,
    pub station: f64,
    pub displacement: [f64; 3],
    pub displacement_magnitude: f64,
    pub von_mises: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct InterfaceShearPoint {
    pub node_id: usize,
    /// Beam-axis coordinate
    pub x: f64,
    pub shear: f64,
}

/// Summed support reactions; moments about the global origin.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ReactionSummary {
    pub force: [f64; 3],
    pub moment: [f64; 3],
}

/// Advisory solve cost derived from the node count.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceEstimate {
    pub node_count: usize,
    pub equations: usize,
    pub ram_mb: f64,
    pub solve_seconds: f64,
}

impl ResourceEstimate {
    const BASE_RAM_MB: f64 = 50.0;
    const RAM_MB_PER_NODE: f64 = 0.0035;
    const TIME_COEFFICIENT: f64 = 2.0e-5;
    const TIME_EXPONENT: f64 = 1.15;

    pub fn from_node_count(node_count: usize) -> Self {
        let n = node_count as f64;
        Self {
            node_count,
            equations: 3 * node_count,
            ram_mb: Self::BASE_RAM_MB + n * Self::RAM_MB_PER_NODE,
            solve_seconds: Self::TIME_COEFFICIENT * n.powf(Self::TIME_EXPONENT),
        }
    }
}

/// Parsed outcome of one solve.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IterationResult {
    pub iteration: usize,
    pub mesh_size: f64,
    pub node_count: usize,
    pub max_von_mises: f64,
    pub max_von_mises_node: Option<usize>,
    pub max_displacement: f64,
    pub buckling_factors: Vec<f64>,
    pub reactions: ReactionSummary,
    /// Torsional rotation of the loaded end (rad)
    pub rotation: f64,
    pub sensors: Vec<SensorReading>,
    pub max_interface_shear: f64,
    pub interface_shear: Vec<InterfaceShearPoint>,
    /// The solver produced usable output (max von Mises > 0)
    pub converged: bool,
    #[serde(default)]
    pub estimate: Option<ResourceEstimate>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MeshConvergence {
    Converged,
    NotConverged,
    /// Single-iteration batch mode: nothing to compare against
    NotDetermined,
}

/// Final record of one candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CandidateResult {
    pub candidate: String,
    pub iterations: usize,
    pub final_mesh_size: f64,
    pub mesh_convergence: MeshConvergence,
    pub result: IterationResult,
    pub history: Vec<IterationResult>,
    pub buckling: Option<IterationResult>,
    pub buckling_error: Option<String>,
    pub timestamp: String,
}
