//! Read-only view of the geometry collaborator's output.
//!
//! A mesh arrives as four files in the iteration directory: the CalculiX
//! mesh (`mesh.inp`), a node table (`nodes.csv`), node groups
//! (`groups.json`) and a statistics summary (`stats.json`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FeaError, FeaResult};

pub const MESH_FILE: &str = "mesh.inp";
pub const NODE_TABLE_FILE: &str = "nodes.csv";
pub const GROUPS_FILE: &str = "groups.json";
pub const STATS_FILE: &str = "stats.json";

/// Well-known node group names.
pub mod groups {
    pub const SUPPORT: &str = "SUPPORT";
    pub const LOAD: &str = "LOAD";
    pub const INTERFACE: &str = "INTERFACE";
}

/// Paths of one generated mesh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshArtifacts {
    pub mesh_file: PathBuf,
    pub node_table: PathBuf,
    pub groups_file: PathBuf,
    pub stats_file: PathBuf,
}

impl MeshArtifacts {
    /// Artifacts at their conventional names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            mesh_file: dir.join(MESH_FILE),
            node_table: dir.join(NODE_TABLE_FILE),
            groups_file: dir.join(GROUPS_FILE),
            stats_file: dir.join(STATS_FILE),
        }
    }

    pub fn check_present(&self) -> FeaResult<()> {
        for path in [&self.mesh_file, &self.node_table, &self.groups_file] {
            if !path.exists() {
                return Err(FeaError::InputGeometry(format!(
                    "mesh artifact {:?} is missing",
                    path
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct MeshStats {
    pub node_count: usize,
    #[serde(default)]
    pub element_count: usize,
}

impl MeshStats {
    pub fn load(path: &Path) -> FeaResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| FeaError::InputGeometry(format!("failed to read {:?}: {}", path, e)))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Named node groups, `{"SUPPORT": [1, 2, ...], ...}`.
pub type NodeGroups = BTreeMap<String, Vec<usize>>;

pub fn load_groups(path: &Path) -> FeaResult<NodeGroups> {
    let content = fs::read_to_string(path)
        .map_err(|e| FeaError::InputGeometry(format!("failed to read {:?}: {}", path, e)))?;
    let groups: NodeGroups = serde_json::from_str(&content)
        .map_err(|e| FeaError::InputGeometry(format!("malformed node groups {:?}: {}", path, e)))?;
    Ok(groups)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ElementFamily {
    Solid,
    Shell,
}

/// CalculiX element types this crate understands, with their node counts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ElementType {
    C3D4,
    C3D10,
    C3D8,
    C3D20,
    S3,
    S6,
    S4,
    S8,
}

impl ElementType {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "C3D4" => Some(Self::C3D4),
            "C3D10" => Some(Self::C3D10),
            "C3D8" => Some(Self::C3D8),
            "C3D20" => Some(Self::C3D20),
            "S3" => Some(Self::S3),
            "S6" => Some(Self::S6),
            "S4" => Some(Self::S4),
            "S8" => Some(Self::S8),
            _ => None,
        }
    }

    pub fn node_count(&self) -> usize {
        match self {
            Self::C3D4 => 4,
            Self::C3D10 => 10,
            Self::C3D8 => 8,
            Self::C3D20 => 20,
            Self::S3 => 3,
            Self::S6 => 6,
            Self::S4 => 4,
            Self::S8 => 8,
        }
    }

    pub fn family(&self) -> ElementFamily {
        match self {
            Self::C3D4 | Self::C3D10 | Self::C3D8 | Self::C3D20 => ElementFamily::Solid,
            Self::S3 | Self::S6 | Self::S4 | Self::S8 => ElementFamily::Shell,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Element {
    pub id: usize,
    pub kind: ElementType,
    pub nodes: Vec<usize>,
}

/// Connectivity and node IDs read from a CalculiX mesh file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct MeshConnectivity {
    pub node_ids: Vec<usize>,
    pub elements: Vec<Element>,
}

impl MeshConnectivity {
    pub fn load(path: &Path) -> FeaResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| FeaError::InputGeometry(format!("failed to read mesh {:?}: {}", path, e)))?;
        Ok(Self::parse(&content))
    }

    /// Scan `*NODE` and `*ELEMENT` blocks. Element blocks of unknown type are
    /// skipped; element records may continue over several lines.
    pub fn parse(content: &str) -> Self {
        enum Block {
            None,
            Nodes,
            Elements(Option<ElementType>),
        }

        let mut mesh = MeshConnectivity::default();
        let mut block = Block::None;
        let mut pending: Vec<usize> = Vec::new();

        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("**") {
                continue;
            }
            if trimmed.starts_with('*') {
                pending.clear();
                let upper = trimmed.to_ascii_uppercase();
                block = if upper.starts_with("*NODE") && !upper.starts_with("*NODE PRINT")
                    && !upper.starts_with("*NODE FILE")
                {
                    Block::Nodes
                } else if upper.starts_with("*ELEMENT") {
                    let kind = keyword_parameter(trimmed, "TYPE").and_then(|t| ElementType::parse(&t));
                    if kind.is_none() {
                        tracing::debug!("Skipping element block with unsupported type: {}", trimmed);
                    }
                    Block::Elements(kind)
                } else {
                    Block::None
                };
                continue;
            }

            match block {
                Block::Nodes => {
                    if let Some(Ok(id)) = trimmed.split(',').next().map(|t| t.trim().parse::<usize>()) {
                        mesh.node_ids.push(id);
                    }
                }
                Block::Elements(Some(kind)) => {
                    pending.extend(
                        trimmed
                            .split(',')
                            .map(str::trim)
                            .filter(|t| !t.is_empty())
                            .filter_map(|t| t.parse::<usize>().ok()),
                    );
                    if pending.len() >= kind.node_count() + 1 {
                        let id = pending[0];
                        let nodes = pending[1..=kind.node_count()].to_vec();
                        mesh.elements.push(Element { id, kind, nodes });
                        pending.clear();
                    }
                }
                _ => {}
            }
        }

        mesh
    }

    pub fn max_node_id(&self) -> usize {
        self.node_ids.iter().copied().max().unwrap_or(0)
    }

    pub fn families(&self) -> Vec<ElementFamily> {
        let mut families = Vec::new();
        for family in [ElementFamily::Solid, ElementFamily::Shell] {
            if self.elements.iter().any(|e| e.kind.family() == family) {
                families.push(family);
            }
        }
        families
    }

    pub fn element_ids(&self, family: ElementFamily) -> Vec<usize> {
        self.elements
            .iter()
            .filter(|e| e.kind.family() == family)
            .map(|e| e.id)
            .collect()
    }
}

/// Value of `NAME=value` on a keyword line, case-insensitive on the name.
pub fn keyword_parameter(line: &str, name: &str) -> Option<String> {
    line.split(',').skip(1).find_map(|part| {
        let (key, value) = part.split_once('=')?;
        if key.trim().eq_ignore_ascii_case(name) {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}
