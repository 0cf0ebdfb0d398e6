//! Run configuration: JSON file plus environment overrides

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FeaError, FeaResult};
use crate::models::{MeshOrder, ModelKind, SolverKind};
use crate::sensors::ProbeDefinition;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunConfig {
    /// Relative change of max von Mises below which the mesh is converged
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Mesh size multiplier applied after a non-converged iteration
    pub refinement_factor: f64,
    pub initial_mesh_size: f64,
    pub mesh_order: MeshOrder,
    pub model: ModelKind,
    pub solver: SolverKind,
    pub station_step: f64,
    pub threads: usize,
    pub solver_path: String,
    /// Warn when 3 × nodes exceeds this
    pub equation_limit: usize,
    pub work_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub probes: Vec<ProbeDefinition>,
    /// Program (and leading arguments) of the external mesher
    pub mesher_command: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.02,
            max_iterations: 5,
            refinement_factor: 0.7,
            initial_mesh_size: 20.0,
            mesh_order: MeshOrder::Quadratic,
            model: ModelKind::Solid,
            solver: SolverKind::Direct,
            station_step: 100.0,
            threads: 4,
            solver_path: "ccx".to_string(),
            equation_limit: 3_000_000,
            work_dir: std::env::temp_dir().join("calculix_runner"),
            archive_dir: PathBuf::from("archive"),
            probes: Vec::new(),
            mesher_command: vec!["section-mesher".to_string()],
        }
    }
}

impl RunConfig {
    /// Defaults, then the optional JSON file, then environment overrides.
    pub fn load(path: Option<&Path>) -> FeaResult<Self> {
        let mut config = match path {
            Some(path) => {
                let content = fs::read_to_string(path).map_err(|e| {
                    FeaError::Config(format!("failed to read config {:?}: {}", path, e))
                })?;
                serde_json::from_str(&content)
                    .map_err(|e| FeaError::Config(format!("invalid config {:?}: {}", path, e)))?
            }
            None => RunConfig::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var("CALCULIX_PATH") {
            self.solver_path = path;
        }
        if let Some(threads) = std::env::var("CALCULIX_THREADS")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&v| v > 0)
        {
            self.threads = threads;
        }
        if let Ok(dir) = std::env::var("CALCULIX_WORK_DIR") {
            self.work_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> FeaResult<()> {
        if !(self.tolerance > 0.0) {
            return Err(FeaError::Config("tolerance must be positive".to_string()));
        }
        if self.max_iterations == 0 {
            return Err(FeaError::Config("max_iterations must be at least 1".to_string()));
        }
        if !(self.refinement_factor > 0.0 && self.refinement_factor < 1.0) {
            return Err(FeaError::Config("refinement_factor must lie in (0, 1)".to_string()));
        }
        if !(self.initial_mesh_size > 0.0) {
            return Err(FeaError::Config("initial_mesh_size must be positive".to_string()));
        }
        if self.mesher_command.is_empty() {
            return Err(FeaError::Config("mesher_command is empty".to_string()));
        }
        Ok(())
    }

    /// Single-iteration runs cannot judge mesh convergence.
    pub fn is_batch_mode(&self) -> bool {
        self.max_iterations == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"tolerance": 0.01, "model": "shell", "max_iterations": 1}"#).unwrap();
        let config = RunConfig::load(Some(&path)).unwrap();
        assert_eq!(config.tolerance, 0.01);
        assert_eq!(config.model, ModelKind::Shell);
        assert_eq!(config.refinement_factor, 0.7);
        assert!(config.is_batch_mode());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = RunConfig::default();
        config.refinement_factor = 1.5;
        assert!(matches!(config.validate(), Err(FeaError::Config(_))));
        config.refinement_factor = 0.5;
        config.max_iterations = 0;
        assert!(config.validate().is_err());
    }
}
