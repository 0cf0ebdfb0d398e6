//! Mesh-convergence loop for a single candidate.
//!
//! Each iteration meshes, estimates cost, maps sensors, writes a deck, solves
//! and parses. The loop stops once the max von Mises stress changes by less
//! than the tolerance between two usable iterations, then one buckling-only
//! solve runs on the converged mesh.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::config::RunConfig;
use crate::deck::{AnalysisPlan, DeckBuilder, DeckInput};
use crate::error::{FeaError, FeaResult};
use crate::mesh::{self, MeshArtifacts, MeshConnectivity, MeshStats, NodeGroups};
use crate::mesher::{MeshPort, MeshRequest};
use crate::models::{
    keys, CandidateRecord, CandidateResult, IterationResult, LoadVector, MaterialSpec,
    MeshConvergence, ResourceEstimate, RunParameters, SectionGeometry,
};
use crate::postprocess::ResultsParser;
use crate::sensors::{SensorMap, SensorMapBuilder};
use crate::solver::{LineSink, SolverPort};
use crate::spatial::SpatialNodeIndex;
use crate::store::{self, ANALYTICAL_FILE, CANDIDATE_FILE, RESULTS_FILE};

/// Previous max stress at or below this is treated as no reference.
const NEGLIGIBLE_STRESS: f64 = 1e-12;

pub const FINAL_DIR: &str = "final";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Meshing,
    Estimating,
    MappingSensors,
    BuildingDeck,
    Solving,
    Parsing,
    ConvergenceCheck,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunState::Meshing => "meshing",
            RunState::Estimating => "estimating",
            RunState::MappingSensors => "mapping sensors",
            RunState::BuildingDeck => "building deck",
            RunState::Solving => "solving",
            RunState::Parsing => "parsing",
            RunState::ConvergenceCheck => "convergence check",
        };
        f.write_str(name)
    }
}

/// Terminal state of a candidate run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Converged,
    NotConverged,
    Stopped,
    Error,
}

/// One candidate ready to run.
#[derive(Debug, Clone)]
pub struct CandidateInput {
    pub key: String,
    pub record: CandidateRecord,
    pub params: RunParameters,
}

impl CandidateInput {
    /// Build run parameters from a record; `loads` are already resolved.
    pub fn from_record(
        key: String,
        record: CandidateRecord,
        loads: LoadVector,
        config: &RunConfig,
    ) -> FeaResult<Self> {
        let length = record.require(keys::LENGTH)?;
        if !(length > 0.0) {
            return Err(FeaError::InputGeometry(format!("length must be positive, got {}", length)));
        }
        let params = RunParameters {
            length,
            geometry: SectionGeometry::from_record(&record)?,
            material: MaterialSpec::from_record(&record),
            loads,
            load_offset: (
                record.number(keys::LOAD_OFFSET_Y).unwrap_or(0.0),
                record.number(keys::LOAD_OFFSET_Z).unwrap_or(0.0),
            ),
            solver: config.solver,
            mesh_size: config.initial_mesh_size,
            mesh_order: config.mesh_order,
            model: config.model,
        };
        Ok(Self { key, record, params })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub status: RunStatus,
    pub history: Vec<IterationResult>,
    pub result: Option<CandidateResult>,
    pub final_dir: Option<PathBuf>,
    pub error: Option<String>,
}

/// Relative change of the max stress, `None` without a usable reference.
pub fn relative_delta(previous: f64, current: f64) -> Option<f64> {
    if previous.abs() <= NEGLIGIBLE_STRESS {
        return None;
    }
    Some((current - previous).abs() / previous.abs())
}

/// 1-based position at which a history of usable max stresses first converges.
pub fn converged_at(max_stresses: &[f64], tolerance: f64) -> Option<usize> {
    max_stresses
        .windows(2)
        .position(|w| relative_delta(w[0], w[1]).map_or(false, |d| d < tolerance))
        .map(|i| i + 2)
}

/// Mesh, index and sensors of one iteration, kept for the buckling rerun.
struct MeshContext {
    artifacts: MeshArtifacts,
    mesh_text: String,
    connectivity: MeshConnectivity,
    groups: NodeGroups,
    index: SpatialNodeIndex,
    sensors: SensorMap,
}

struct IterationOutput {
    result: IterationResult,
    mesh: MeshContext,
    dir: PathBuf,
}

struct StageError {
    state: RunState,
    error: FeaError,
}

fn at(state: RunState) -> impl FnOnce(FeaError) -> StageError {
    move |error| StageError { state, error }
}

fn progress(sink: &mut (dyn FnMut(&str) + Send), message: &str) {
    tracing::info!("{}", message);
    sink(message);
}

pub struct RunController<M, S> {
    mesher: M,
    solver: S,
    config: RunConfig,
    deck_builder: DeckBuilder,
}

impl<M: MeshPort, S: SolverPort> RunController<M, S> {
    pub fn new(mesher: M, solver: S, config: RunConfig) -> Self {
        Self {
            mesher,
            solver,
            config,
            deck_builder: DeckBuilder::new(),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub async fn run(
        &self,
        candidate: &CandidateInput,
        work_dir: &Path,
        cancel: &CancellationToken,
        sink: LineSink<'_>,
    ) -> RunReport {
        let tolerance = self.config.tolerance;
        let mut mesh_size = candidate.params.mesh_size;
        let mut history: Vec<IterationResult> = Vec::new();
        let mut best: Option<IterationOutput> = None;
        // Max stress of each usable iteration, in order
        let mut usable_max: Vec<f64> = Vec::new();
        let mut status = RunStatus::NotConverged;

        progress(
            sink,
            &format!(
                "Candidate {}: up to {} iterations, tolerance {:.2}%",
                candidate.key,
                self.config.max_iterations,
                tolerance * 100.0
            ),
        );

        for iteration in 1..=self.config.max_iterations {
            if cancel.is_cancelled() {
                progress(sink, &format!("Stop requested before iteration {}", iteration));
                status = RunStatus::Stopped;
                break;
            }

            let iter_dir = work_dir.join(format!("iter_{:02}", iteration));
            let output = match self
                .iterate(candidate, iteration, mesh_size, &iter_dir, &mut *sink)
                .await
            {
                Ok(output) => output,
                Err(StageError { state, error }) => {
                    let message = format!(
                        "Candidate {} failed in iteration {} while {} (mesh size {:.4}): {}",
                        candidate.key, iteration, state, mesh_size, error
                    );
                    tracing::error!("{}", message);
                    sink(&format!("ERROR: {}", message));
                    return RunReport {
                        status: RunStatus::Error,
                        history,
                        result: None,
                        final_dir: None,
                        error: Some(message),
                    };
                }
            };

            history.push(output.result.clone());

            // Convergence check against the last usable iteration
            if output.result.converged {
                let current = output.result.max_von_mises;
                let delta = usable_max
                    .last()
                    .and_then(|&previous| relative_delta(previous, current));
                usable_max.push(current);
                best = Some(output);
                match delta {
                    Some(delta) => progress(
                        sink,
                        &format!(
                            "Iteration {}: max von Mises {:.4}, change {:.3}%",
                            iteration,
                            current,
                            delta * 100.0
                        ),
                    ),
                    None => progress(
                        sink,
                        &format!("Iteration {}: max von Mises {:.4}", iteration, current),
                    ),
                }
                if converged_at(&usable_max, tolerance).is_some() {
                    status = RunStatus::Converged;
                    break;
                }
            } else {
                progress(
                    sink,
                    &format!("Iteration {}: no usable stress output, refining", iteration),
                );
            }

            mesh_size *= self.config.refinement_factor;
        }

        if status == RunStatus::Stopped {
            return RunReport {
                status,
                history,
                result: None,
                final_dir: None,
                error: None,
            };
        }

        let mesh_convergence = match status {
            RunStatus::Converged => MeshConvergence::Converged,
            _ if self.config.is_batch_mode() => MeshConvergence::NotDetermined,
            _ => MeshConvergence::NotConverged,
        };

        let Some(chosen) = best else {
            let message = format!("Candidate {} produced no usable result", candidate.key);
            progress(sink, &message);
            return RunReport {
                status: RunStatus::NotConverged,
                history,
                result: None,
                final_dir: None,
                error: Some(message),
            };
        };

        let (buckling, buckling_error) = if status == RunStatus::Converged {
            match self.buckling_rerun(candidate, &chosen, &mut *sink).await {
                Ok(result) => (Some(result), None),
                Err(e) => {
                    let message = format!("Buckling follow-up failed: {}", e);
                    tracing::warn!("{}", message);
                    sink(&format!("WARNING: {}", message));
                    (None, Some(message))
                }
            }
        } else {
            (None, None)
        };

        let result = CandidateResult {
            candidate: candidate.key.clone(),
            iterations: history.len(),
            final_mesh_size: chosen.result.mesh_size,
            mesh_convergence,
            result: chosen.result.clone(),
            history: history.clone(),
            buckling,
            buckling_error,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        let final_dir = work_dir.join(FINAL_DIR);
        let persisted = store::replace_dir(&chosen.dir, &final_dir)
            .and_then(|_| store::write_json(&final_dir.join(CANDIDATE_FILE), &result));
        let final_dir = match persisted {
            Ok(()) => {
                progress(sink, &format!("Final result stored in {}", final_dir.display()));
                Some(final_dir)
            }
            Err(e) => {
                tracing::error!("Failed to persist final result: {}", e);
                sink(&format!("ERROR: failed to persist final result: {}", e));
                None
            }
        };

        RunReport {
            status,
            history,
            result: Some(result),
            final_dir,
            error: None,
        }
    }

    async fn iterate(
        &self,
        candidate: &CandidateInput,
        iteration: usize,
        mesh_size: f64,
        dir: &Path,
        sink: LineSink<'_>,
    ) -> Result<IterationOutput, StageError> {
        fs::create_dir_all(dir).map_err(|e| at(RunState::Meshing)(e.into()))?;
        let params = RunParameters {
            mesh_size,
            ..candidate.params.clone()
        };

        // Meshing
        progress(sink, &format!("[{}] iteration {}: mesh size {:.4}", RunState::Meshing, iteration, mesh_size));
        let request = MeshRequest {
            length: params.length,
            geometry: params.geometry,
            mesh_size,
            order: params.mesh_order,
            model: params.model,
        };
        let artifacts = self.mesher.generate(&request, dir).await.map_err(at(RunState::Meshing))?;
        artifacts.check_present().map_err(at(RunState::Meshing))?;
        let mesh_text = fs::read_to_string(&artifacts.mesh_file)
            .map_err(|e| at(RunState::Meshing)(FeaError::InputGeometry(format!(
                "failed to read mesh {:?}: {}",
                artifacts.mesh_file, e
            ))))?;
        let connectivity = MeshConnectivity::parse(&mesh_text);
        let groups = mesh::load_groups(&artifacts.groups_file).map_err(at(RunState::Meshing))?;

        // Estimating
        let node_count = MeshStats::load(&artifacts.stats_file)
            .map(|s| s.node_count)
            .unwrap_or(connectivity.node_ids.len());
        let estimate = ResourceEstimate::from_node_count(node_count);
        progress(
            sink,
            &format!(
                "[{}] {} nodes, {} equations, ~{:.0} MB RAM, ~{:.1} s",
                RunState::Estimating,
                node_count,
                estimate.equations,
                estimate.ram_mb,
                estimate.solve_seconds
            ),
        );
        if estimate.equations > self.config.equation_limit {
            let message = format!(
                "WARNING: {} equations exceed the configured limit of {}",
                estimate.equations, self.config.equation_limit
            );
            tracing::warn!("{}", message);
            sink(&message);
        }

        // Mapping sensors
        let index = SpatialNodeIndex::load(&artifacts.node_table);
        if !index.is_loaded() {
            return Err(at(RunState::MappingSensors)(FeaError::InputGeometry(format!(
                "node table {:?} is missing or malformed",
                artifacts.node_table
            ))));
        }
        let sensors = SensorMapBuilder::new(&index).build(
            params.length,
            &params.geometry,
            &self.config.probes,
            self.config.station_step,
        );
        progress(sink, &format!("[{}] {} sensor points", RunState::MappingSensors, sensors.len()));

        // Building deck
        let deck_text = self
            .deck_builder
            .generate(&DeckInput {
                mesh_text: &mesh_text,
                connectivity: &connectivity,
                groups: &groups,
                params: &params,
                sensors: &sensors,
                plan: AnalysisPlan::StaticAndBuckling,
            })
            .map_err(at(RunState::BuildingDeck))?;
        let deck_path = self
            .deck_builder
            .write(&deck_text, &artifacts.mesh_file)
            .map_err(at(RunState::BuildingDeck))?;
        progress(sink, &format!("[{}] {}", RunState::BuildingDeck, deck_path.display()));

        // Solving
        let deck_dir = deck_path.parent().unwrap_or(dir).to_path_buf();
        progress(sink, &format!("[{}] {} threads", RunState::Solving, self.config.threads));
        let outcome = {
            let mut forward = |line: &str| {
                tracing::debug!(target: "ccx", "{}", line);
                sink(line);
            };
            self.solver
                .run(&deck_path, &deck_dir, self.config.threads, &mut forward)
                .await
        };
        if !outcome.success {
            return Err(at(RunState::Solving)(FeaError::SolverFailed(format!(
                "deck {:?} exited with code {:?}",
                deck_path, outcome.exit_code
            ))));
        }

        // Parsing
        let parser = ResultsParser {
            connectivity: &connectivity,
            groups: &groups,
            index: &index,
            sensors: &sensors,
        };
        let mut result = match parser.parse(&outcome.report) {
            Ok(result) => result,
            Err(e) => {
                let message = format!("WARNING: {}; iteration counts as not converged", e);
                tracing::warn!("{}", message);
                sink(&message);
                IterationResult::default()
            }
        };
        result.iteration = iteration;
        result.mesh_size = mesh_size;
        result.node_count = node_count;
        result.estimate = Some(estimate);
        progress(
            sink,
            &format!(
                "[{}] max von Mises {:.4}, max displacement {:.5}, buckling factors {:?}",
                RunState::Parsing,
                result.max_von_mises,
                result.max_displacement,
                result.buckling_factors
            ),
        );

        store::write_json(&dir.join(RESULTS_FILE), &result).map_err(at(RunState::Parsing))?;
        store::write_json(&dir.join(ANALYTICAL_FILE), &candidate.record).map_err(at(RunState::Parsing))?;

        Ok(IterationOutput {
            result,
            mesh: MeshContext {
                artifacts,
                mesh_text,
                connectivity,
                groups,
                index,
                sensors,
            },
            dir: dir.to_path_buf(),
        })
    }

    /// Buckling-only solve on the mesh of `converged`.
    async fn buckling_rerun(
        &self,
        candidate: &CandidateInput,
        converged: &IterationOutput,
        sink: LineSink<'_>,
    ) -> FeaResult<IterationResult> {
        let mesh = &converged.mesh;
        let params = RunParameters {
            mesh_size: converged.result.mesh_size,
            ..candidate.params.clone()
        };
        progress(sink, "Buckling follow-up on converged mesh");

        let deck_text = self.deck_builder.generate(&DeckInput {
            mesh_text: &mesh.mesh_text,
            connectivity: &mesh.connectivity,
            groups: &mesh.groups,
            params: &params,
            sensors: &mesh.sensors,
            plan: AnalysisPlan::BucklingOnly,
        })?;
        let deck_path = self.deck_builder.write(&deck_text, &mesh.artifacts.mesh_file)?;
        let deck_dir = deck_path.parent().unwrap_or(&converged.dir).to_path_buf();

        let outcome = self
            .solver
            .run(&deck_path, &deck_dir, self.config.threads, &mut *sink)
            .await;
        if !outcome.success {
            return Err(FeaError::SolverFailed(format!(
                "buckling deck {:?} exited with code {:?}",
                deck_path, outcome.exit_code
            )));
        }

        let parser = ResultsParser {
            connectivity: &mesh.connectivity,
            groups: &mesh.groups,
            index: &mesh.index,
            sensors: &mesh.sensors,
        };
        let mut result = parser.parse(&outcome.report)?;
        if result.buckling_factors.is_empty() {
            return Err(FeaError::Parse("buckling report contains no buckling factors".to_string()));
        }
        result.iteration = converged.result.iteration;
        result.mesh_size = converged.result.mesh_size;
        progress(sink, &format!("Buckling factors: {:?}", result.buckling_factors));
        Ok(result)
    }
}
