//! CalculiX input deck assembly.
//!
//! The deck is the mesh file copied verbatim, followed by node/element sets,
//! a rigid-body load introduction at the free end, material and section
//! cards, and the analysis steps.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{FeaError, FeaResult};
use crate::material::{self, ElasticConstants};
use crate::mesh::{groups, ElementFamily, MeshConnectivity, NodeGroups};
use crate::models::{ModelKind, RunParameters, SolverKind};
use crate::sensors::SensorMap;

/// IDs per data line in `*NSET` / `*ELSET` blocks.
pub const SET_LINE_WIDTH: usize = 16;
pub const BUCKLING_MODES: usize = 5;

pub const REF_SET: &str = "REF";
pub const ALL_NODES_SET: &str = "NALL";
pub const ALL_ELEMENTS_SET: &str = "EALL";
pub const SENSOR_SET: &str = "SENSORS";
const MATERIAL_NAME: &str = "STEEL";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisPlan {
    /// Linear static step followed by linear buckling
    StaticAndBuckling,
    /// Linear buckling only, used for the follow-up run on a converged mesh
    BucklingOnly,
}

pub struct DeckInput<'a> {
    pub mesh_text: &'a str,
    pub connectivity: &'a MeshConnectivity,
    pub groups: &'a NodeGroups,
    pub params: &'a RunParameters,
    pub sensors: &'a SensorMap,
    pub plan: AnalysisPlan,
}

/// Synthetic node IDs above every mesh-owned ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReferenceNodes {
    pub reference: usize,
    pub rotation: usize,
}

impl ReferenceNodes {
    pub fn above(max_mesh_node: usize) -> Self {
        Self {
            reference: max_mesh_node + 1,
            rotation: max_mesh_node + 2,
        }
    }
}

pub struct DeckBuilder;

impl DeckBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self, input: &DeckInput) -> FeaResult<String> {
        let params = input.params;
        let mesh = input.connectivity;

        if mesh.node_ids.is_empty() {
            return Err(FeaError::InputGeometry("mesh has no nodes".to_string()));
        }
        if mesh.elements.is_empty() {
            return Err(FeaError::InputGeometry("mesh has no supported elements".to_string()));
        }
        for required in [groups::SUPPORT, groups::LOAD] {
            if input.groups.get(required).map_or(true, |ids| ids.is_empty()) {
                return Err(FeaError::InputGeometry(format!(
                    "node group '{}' is missing or empty",
                    required
                )));
            }
        }

        let elastic = material::resolve(&params.material)?;
        let refs = ReferenceNodes::above(mesh.max_node_id());
        let mut inp = String::new();

        // 1. Mesh
        inp.push_str(&format!(
            "** calculix-runner deck: mesh size {:.4}, {} nodes, {} elements\n",
            params.mesh_size,
            mesh.node_ids.len(),
            mesh.elements.len()
        ));
        inp.push_str(input.mesh_text);
        if !input.mesh_text.ends_with('\n') {
            inp.push('\n');
        }

        // 2. Node sets from the geometry collaborator
        for (name, ids) in input.groups {
            if ids.is_empty() {
                tracing::warn!("Node group '{}' is empty; not declared", name);
                continue;
            }
            push_set(&mut inp, "*NSET, NSET", name, ids);
        }

        // 3. All-node, element and sensor sets
        push_set(&mut inp, "*NSET, NSET", ALL_NODES_SET, &mesh.node_ids);
        let all_elements: Vec<usize> = mesh.elements.iter().map(|e| e.id).collect();
        push_set(&mut inp, "*ELSET, ELSET", ALL_ELEMENTS_SET, &all_elements);
        for family in mesh.families() {
            push_set(&mut inp, "*ELSET, ELSET", family_set(family), &mesh.element_ids(family));
        }
        let mut sensor_nodes: Vec<usize> = input.sensors.values().map(|s| s.node_id).collect();
        sensor_nodes.sort_unstable();
        sensor_nodes.dedup();
        if !sensor_nodes.is_empty() {
            push_set(&mut inp, "*NSET, NSET", SENSOR_SET, &sensor_nodes);
        }

        // 4. Reference node at the loaded end
        let (offset_y, offset_z) = params.load_offset;
        inp.push_str(&format!("*NODE, NSET={}\n", REF_SET));
        inp.push_str(&format!("{}, {:.6}, {:.6}, {:.6}\n", refs.reference, params.length, offset_y, offset_z));
        inp.push_str(&format!("{}, {:.6}, {:.6}, {:.6}\n", refs.rotation, params.length, offset_y, offset_z));

        // 5. Rigid coupling of the load face
        inp.push_str(&format!(
            "*RIGID BODY, NSET={}, REF NODE={}, ROT NODE={}\n",
            groups::LOAD,
            refs.reference,
            refs.rotation
        ));

        // 6. Material
        push_material(&mut inp, &elastic);

        // 7. Sections
        for family in mesh.families() {
            match family {
                ElementFamily::Solid => {
                    inp.push_str(&format!("*SOLID SECTION, ELSET={}, MATERIAL={}\n", family_set(family), MATERIAL_NAME));
                }
                ElementFamily::Shell => {
                    inp.push_str(&format!("*SHELL SECTION, ELSET={}, MATERIAL={}\n", family_set(family), MATERIAL_NAME));
                    inp.push_str(&format!("{:.6}\n", params.geometry.plate_thickness));
                }
            }
        }

        // 8. Steps
        let cloads = Self::cload_lines(params, &refs);
        if cloads.is_empty() {
            tracing::warn!("All load components are zero; deck carries no *CLOAD");
        }

        if input.plan == AnalysisPlan::StaticAndBuckling {
            inp.push_str("*STEP\n");
            match params.solver {
                SolverKind::Direct => inp.push_str("*STATIC, SOLVER=SPOOLES\n"),
                SolverKind::Iterative => inp.push_str("*STATIC, SOLVER=ITERATIVE CHOLESKY\n"),
            }
            Self::push_support(&mut inp, params.model);
            Self::push_cloads(&mut inp, &cloads);

            // Full-field displacement first: the report parser only captures
            // the first displacement block of a step.
            inp.push_str(&format!("*NODE PRINT, NSET={}\nU\n", ALL_NODES_SET));
            inp.push_str(&format!("*NODE PRINT, NSET={}, TOTALS=YES\nRF\n", groups::SUPPORT));
            let mut watched = vec![groups::LOAD, REF_SET];
            if input.groups.get(groups::INTERFACE).map_or(false, |ids| !ids.is_empty()) {
                watched.push(groups::INTERFACE);
            }
            if !sensor_nodes.is_empty() {
                watched.push(SENSOR_SET);
            }
            for set in watched {
                inp.push_str(&format!("*NODE PRINT, NSET={}\nU\n", set));
            }
            inp.push_str(&format!("*EL PRINT, ELSET={}\nS\n", ALL_ELEMENTS_SET));
            inp.push_str("*NODE FILE\nU\n*EL FILE\nS\n");
            inp.push_str("*END STEP\n");
        }

        inp.push_str("*STEP\n");
        inp.push_str(&format!("*BUCKLE\n{}\n", BUCKLING_MODES));
        if input.plan == AnalysisPlan::BucklingOnly {
            Self::push_support(&mut inp, params.model);
        }
        Self::push_cloads(&mut inp, &cloads);
        inp.push_str(&format!("*NODE PRINT, NSET={}\nU\n", ALL_NODES_SET));
        inp.push_str("*END STEP\n");

        Ok(inp)
    }

    /// One line per non-negligible component: forces on the reference node,
    /// moments on the rotation node.
    pub fn cload_lines(params: &RunParameters, refs: &ReferenceNodes) -> Vec<String> {
        let threshold = params.model.load_threshold();
        let mut lines = Vec::new();
        for (dof, value) in params.loads.forces().iter().enumerate() {
            if value.abs() > threshold {
                lines.push(format!("{}, {}, {:.6e}", refs.reference, dof + 1, value));
            }
        }
        for (dof, value) in params.loads.moments().iter().enumerate() {
            if value.abs() > threshold {
                lines.push(format!("{}, {}, {:.6e}", refs.rotation, dof + 1, value));
            }
        }
        lines
    }

    fn push_cloads(inp: &mut String, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        inp.push_str("*CLOAD\n");
        for line in lines {
            inp.push_str(line);
            inp.push('\n');
        }
    }

    fn push_support(inp: &mut String, model: ModelKind) {
        inp.push_str("*BOUNDARY\n");
        match model {
            ModelKind::Solid => inp.push_str(&format!("{}, 1, 3, 0.0\n", groups::SUPPORT)),
            ModelKind::Shell => inp.push_str(&format!("{}, 1, 6, 0.0\n", groups::SUPPORT)),
        }
    }

    /// Write the deck next to the mesh as `<mesh-stem>_<timestamp>.inp`.
    pub fn write(&self, deck: &str, mesh_file: &Path) -> FeaResult<PathBuf> {
        let dir = mesh_file.parent().unwrap_or_else(|| Path::new("."));
        let stem = mesh_file
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "mesh".to_string());
        let mut path = dir.join(format!("{}_{}.inp", stem, timestamp()));
        let mut suffix = 1;
        while path.exists() {
            path = dir.join(format!("{}_{}_{}.inp", stem, timestamp(), suffix));
            suffix += 1;
        }
        fs::write(&path, deck)?;
        tracing::info!("Deck written to {:?}", path);
        Ok(path)
    }
}

impl Default for DeckBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn timestamp() -> String {
    chrono::Local::now().format("%Y%m%d_%H%M%S_%3f").to_string()
}

fn family_set(family: ElementFamily) -> &'static str {
    match family {
        ElementFamily::Solid => "ESOLID",
        ElementFamily::Shell => "ESHELL",
    }
}

fn push_set(inp: &mut String, keyword: &str, name: &str, ids: &[usize]) {
    inp.push_str(&format!("{}={}\n", keyword, name));
    for chunk in ids.chunks(SET_LINE_WIDTH) {
        let line: Vec<String> = chunk.iter().map(|id| id.to_string()).collect();
        inp.push_str(&format!("{},\n", line.join(", ")));
    }
}

fn push_material(inp: &mut String, elastic: &ElasticConstants) {
    inp.push_str(&format!("*MATERIAL, NAME={}\n", MATERIAL_NAME));
    inp.push_str("*ELASTIC\n");
    inp.push_str(&format!("{:.4}, {:.6}\n", elastic.elastic_modulus, elastic.poisson_ratio));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LoadVector, MaterialSpec, MeshOrder, SectionGeometry};

    const MESH: &str = "\
*NODE, NSET=Nall
1, 0.0, 0.0, 0.0
2, 100.0, 0.0, 0.0
3, 0.0, 10.0, 0.0
4, 0.0, 0.0, 10.0
*ELEMENT, TYPE=C3D4, ELSET=Volume1
1, 1, 2, 3, 4
";

    fn params(loads: LoadVector) -> RunParameters {
        RunParameters {
            length: 100.0,
            geometry: SectionGeometry {
                profile_height: 10.0,
                profile_width: 10.0,
                web_thickness: 1.0,
                flange_thickness: 1.0,
                plate_thickness: 2.0,
                plate_width: 20.0,
            },
            material: MaterialSpec::Default,
            loads,
            load_offset: (0.0, 5.0),
            solver: SolverKind::Direct,
            mesh_size: 5.0,
            mesh_order: MeshOrder::Linear,
            model: ModelKind::Solid,
        }
    }

    fn groups() -> NodeGroups {
        let mut g = NodeGroups::new();
        g.insert("SUPPORT".into(), vec![1, 3, 4]);
        g.insert("LOAD".into(), vec![2]);
        g
    }

    fn generate(params: &RunParameters, plan: AnalysisPlan) -> FeaResult<String> {
        let connectivity = MeshConnectivity::parse(MESH);
        let groups = groups();
        let sensors = SensorMap::new();
        DeckBuilder::new().generate(&DeckInput {
            mesh_text: MESH,
            connectivity: &connectivity,
            groups: &groups,
            params,
            sensors: &sensors,
            plan,
        })
    }

    #[test]
    fn test_zero_components_have_no_cload_line() {
        let p = params(LoadVector { fx: 0.0, fy: 1e-12, fz: -1500.0, mx: 0.0, my: 2.5e5, mz: 0.0 });
        let refs = ReferenceNodes::above(4);
        let lines = DeckBuilder::cload_lines(&p, &refs);
        assert_eq!(lines, vec!["5, 3, -1.500000e3".to_string(), "6, 2, 2.500000e5".to_string()]);

        let deck = generate(&p, AnalysisPlan::StaticAndBuckling).unwrap();
        assert!(!deck.contains("5, 1,"));
        assert!(!deck.contains("5, 2,"));
        assert_eq!(deck.matches("5, 3, -1.500000e3").count(), 2);
    }

    #[test]
    fn test_shell_threshold_is_coarser() {
        let mut p = params(LoadVector { fx: 5e-6, ..Default::default() });
        assert_eq!(DeckBuilder::cload_lines(&p, &ReferenceNodes::above(4)).len(), 1);
        p.model = ModelKind::Shell;
        assert!(DeckBuilder::cload_lines(&p, &ReferenceNodes::above(4)).is_empty());
    }

    #[test]
    fn test_deck_section_order() {
        let p = params(LoadVector { fz: -1000.0, ..Default::default() });
        let deck = generate(&p, AnalysisPlan::StaticAndBuckling).unwrap();
        let pos = |needle: &str| deck.find(needle).unwrap_or_else(|| panic!("missing {needle}"));

        assert!(pos("*ELEMENT, TYPE=C3D4") < pos("*NSET, NSET=LOAD"));
        assert!(pos("*NSET, NSET=SUPPORT") < pos("*NSET, NSET=NALL"));
        assert!(pos("*NSET, NSET=NALL") < pos("*NODE, NSET=REF"));
        assert!(pos("*NODE, NSET=REF") < pos("*RIGID BODY, NSET=LOAD, REF NODE=5, ROT NODE=6"));
        assert!(pos("*RIGID BODY") < pos("*MATERIAL"));
        assert!(pos("*MATERIAL") < pos("*SOLID SECTION, ELSET=ESOLID"));
        assert!(pos("*STATIC") < pos("*BUCKLE"));
        assert!(pos("*NODE PRINT, NSET=NALL\nU") < pos("*NODE PRINT, NSET=LOAD\nU"));
        assert!(deck.contains("5, 100.000000, 0.000000, 5.000000"));
        assert!(deck.contains("*BUCKLE\n5\n"));
    }

    #[test]
    fn test_buckling_only_plan() {
        let p = params(LoadVector { fx: -1000.0, ..Default::default() });
        let deck = generate(&p, AnalysisPlan::BucklingOnly).unwrap();
        assert!(!deck.contains("*STATIC"));
        assert_eq!(deck.matches("*STEP").count(), 1);
        assert!(deck.contains("*BOUNDARY\nSUPPORT, 1, 3, 0.0"));
    }

    #[test]
    fn test_sets_are_chunked() {
        let mut inp = String::new();
        let ids: Vec<usize> = (1..=40).collect();
        push_set(&mut inp, "*NSET, NSET", "BIG", &ids);
        let lines: Vec<&str> = inp.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[1].split(',').filter(|t| !t.trim().is_empty()).count(), 16);
        assert!(lines[3].starts_with("33, "));
    }

    #[test]
    fn test_explicit_material_error_aborts_deck() {
        let mut p = params(LoadVector { fx: 1.0, ..Default::default() });
        p.material = MaterialSpec::Explicit { elastic_modulus: 210_000.0, shear_modulus: 10_000.0 };
        assert!(matches!(
            generate(&p, AnalysisPlan::StaticAndBuckling),
            Err(FeaError::MaterialData(_))
        ));
    }

    #[test]
    fn test_lone_modulus_aborts_deck() {
        let mut p = params(LoadVector { fx: 1.0, ..Default::default() });
        p.material = MaterialSpec::Incomplete {
            elastic_modulus: Some(70_000.0),
            shear_modulus: None,
            poisson_ratio: None,
        };
        assert!(matches!(
            generate(&p, AnalysisPlan::StaticAndBuckling),
            Err(FeaError::MaterialData(_))
        ));
    }

    #[test]
    fn test_card_lines_are_terminated() {
        let mut p = params(LoadVector { fz: -10.0, ..Default::default() });
        p.material = MaterialSpec::Direct { elastic_modulus: 70_000.0, poisson_ratio: 0.33 };
        let deck = generate(&p, AnalysisPlan::StaticAndBuckling).unwrap();
        assert!(deck.starts_with("** calculix-runner deck: mesh size 5.0000, 4 nodes, 1 elements\n*NODE"));
        assert!(deck.contains("*MATERIAL, NAME=STEEL\n*ELASTIC\n70000.0000, 0.330000\n"));
        assert!(deck.contains("*RIGID BODY, NSET=LOAD, REF NODE=5, ROT NODE=6\n*MATERIAL"));
        assert!(deck.contains("*BOUNDARY\nSUPPORT, 1, 3, 0.0\n*CLOAD\n5, 3, -1.000000e1\n"));
        assert!(deck.ends_with("*NODE PRINT, NSET=NALL\nU\n*END STEP\n"));
    }

    #[test]
    fn test_write_never_overwrites_mesh() {
        let dir = tempfile::tempdir().unwrap();
        let mesh_file = dir.path().join("mesh.inp");
        fs::write(&mesh_file, MESH).unwrap();
        let builder = DeckBuilder::new();
        let a = builder.write("deck a", &mesh_file).unwrap();
        let b = builder.write("deck b", &mesh_file).unwrap();
        assert_ne!(a, b);
        assert_ne!(a, mesh_file);
        assert_eq!(fs::read_to_string(&mesh_file).unwrap(), MESH);
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("mesh_"));
    }
}
