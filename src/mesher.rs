//! Boundary to the external geometry/mesh generator.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::error::{FeaError, FeaResult};
use crate::mesh::MeshArtifacts;
use crate::models::{MeshOrder, ModelKind, SectionGeometry};

pub const REQUEST_FILE: &str = "mesh_request.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MeshRequest {
    pub length: f64,
    pub geometry: SectionGeometry,
    pub mesh_size: f64,
    pub order: MeshOrder,
    pub model: ModelKind,
}

#[allow(async_fn_in_trait)]
pub trait MeshPort {
    /// Produce the mesh artifacts for `request` inside `work_dir`.
    async fn generate(&self, request: &MeshRequest, work_dir: &Path) -> FeaResult<MeshArtifacts>;
}

/// Runs `<program> [args…] <work_dir>/mesh_request.json <work_dir>` and
/// expects the mesher to leave its four files in `work_dir`.
pub struct CommandMesher {
    command: Vec<String>,
}

impl CommandMesher {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl MeshPort for CommandMesher {
    async fn generate(&self, request: &MeshRequest, work_dir: &Path) -> FeaResult<MeshArtifacts> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(FeaError::Config("mesher command is empty".to_string()));
        };

        fs::create_dir_all(work_dir)?;
        let request_path = work_dir.join(REQUEST_FILE);
        fs::write(&request_path, serde_json::to_string_pretty(request)?)?;

        tracing::info!(
            "Meshing: size {:.3}, order {:?}, model {:?}",
            request.mesh_size,
            request.order,
            request.model
        );

        let output = Command::new(program)
            .args(args)
            .arg(&request_path)
            .arg(work_dir)
            .current_dir(work_dir)
            .output()
            .await
            .map_err(|e| FeaError::Mesher(format!("failed to execute {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FeaError::Mesher(format!(
                "{} exited with status {}: {}",
                program,
                output.status,
                stderr.trim()
            )));
        }

        let artifacts = MeshArtifacts::in_dir(work_dir);
        artifacts.check_present()?;
        Ok(artifacts)
    }
}
