//! Candidate sweep: one convergence run per record, archived by key.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::controller::{CandidateInput, RunController, RunStatus};
use crate::error::FeaResult;
use crate::expr;
use crate::mesher::MeshPort;
use crate::models::{keys, CandidateRecord, CandidateResult, LoadVector};
use crate::solver::{LineSink, SolverPort};
use crate::store;

/// Per-component replacements for the analytical loads of every candidate.
///
/// Forces are plain numbers. Moments are expressions over the numeric fields
/// of the candidate record, e.g. `"axial_force * (profile_height / 2 + plate_thickness)"`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoadOverrides {
    pub axial_force: Option<f64>,
    pub shear_force_y: Option<f64>,
    pub shear_force_z: Option<f64>,
    pub moment_x: Option<String>,
    pub moment_y: Option<String>,
    pub moment_z: Option<String>,
}

impl LoadOverrides {
    pub fn resolve(&self, record: &CandidateRecord) -> LoadVector {
        let mut loads = LoadVector::from_record(record);
        if let Some(fx) = self.axial_force {
            loads.fx = fx;
        }
        if let Some(fy) = self.shear_force_y {
            loads.fy = fy;
        }
        if let Some(fz) = self.shear_force_z {
            loads.fz = fz;
        }

        let symbols = record.numeric_symbols();
        let moment = |expression: &Option<String>, analytical: f64, name: &str| -> f64 {
            let Some(expression) = expression else {
                return analytical;
            };
            match expr::evaluate(expression, &symbols) {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("{} override ignored, keeping {}: {}", name, analytical, e);
                    analytical
                }
            }
        };
        loads.mx = moment(&self.moment_x, loads.mx, keys::MOMENT_X);
        loads.my = moment(&self.moment_y, loads.my, keys::MOMENT_Y);
        loads.mz = moment(&self.moment_z, loads.mz, keys::MOMENT_Z);
        loads
    }
}

fn unsafe_chars() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[^A-Za-z0-9._-]+").expect("valid regex"))
}

fn format_dimension(value: Option<f64>) -> String {
    match value {
        Some(v) if v.fract() == 0.0 => format!("{}", v as i64),
        Some(v) => format!("{}", v),
        None => "na".to_string(),
    }
}

/// `<profile>_tp<plate thickness>_bp<plate width>`, safe as a directory name.
pub fn candidate_key(record: &CandidateRecord) -> String {
    let profile = record
        .text(keys::PROFILE_NAME)
        .unwrap_or_else(|| "candidate".to_string());
    let raw = format!(
        "{}_tp{}_bp{}",
        profile.trim(),
        format_dimension(record.number(keys::PLATE_THICKNESS)),
        format_dimension(record.number(keys::PLATE_WIDTH))
    );
    unsafe_chars().replace_all(&raw, "_").into_owned()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateOutcome {
    pub key: String,
    pub status: RunStatus,
    pub archive: Option<PathBuf>,
    pub result: Option<CandidateResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReport {
    pub outcomes: Vec<CandidateOutcome>,
    /// Candidates never started because of a stop request
    pub skipped: Vec<String>,
    pub stopped: bool,
}

pub struct BatchOptimizer<M, S> {
    controller: RunController<M, S>,
    overrides: LoadOverrides,
}

impl<M: MeshPort, S: SolverPort> BatchOptimizer<M, S> {
    pub fn new(controller: RunController<M, S>, overrides: LoadOverrides) -> Self {
        Self {
            controller,
            overrides,
        }
    }

    pub fn prepare(&self, record: CandidateRecord) -> FeaResult<CandidateInput> {
        let key = candidate_key(&record);
        let loads = self.overrides.resolve(&record);
        CandidateInput::from_record(key, record, loads, self.controller.config())
    }

    pub async fn run(
        &self,
        records: Vec<CandidateRecord>,
        cancel: &CancellationToken,
        sink: LineSink<'_>,
    ) -> BatchReport {
        let config = self.controller.config();
        let total = records.len();
        let mut report = BatchReport::default();

        for (i, record) in records.into_iter().enumerate() {
            let key = candidate_key(&record);
            if report.stopped || cancel.is_cancelled() {
                report.stopped = true;
                report.skipped.push(key);
                continue;
            }

            let message = format!("Candidate {}/{}: {}", i + 1, total, key);
            tracing::info!("{}", message);
            sink(&message);

            let candidate = match self.prepare(record) {
                Ok(candidate) => candidate,
                Err(e) => {
                    tracing::error!("Candidate {} rejected: {}", key, e);
                    sink(&format!("ERROR: candidate {} rejected: {}", key, e));
                    report.outcomes.push(CandidateOutcome {
                        key,
                        status: RunStatus::Error,
                        archive: None,
                        result: None,
                        error: Some(e.to_string()),
                    });
                    continue;
                }
            };

            let work_dir = config
                .work_dir
                .join(&key)
                .join(uuid::Uuid::new_v4().to_string());
            let run = self
                .controller
                .run(&candidate, &work_dir, cancel, &mut *sink)
                .await;

            if run.status == RunStatus::Stopped {
                report.stopped = true;
            }

            let archive = match &run.final_dir {
                Some(final_dir) => archive_result(final_dir, &config.archive_dir, &key, &mut *sink),
                None => None,
            };

            report.outcomes.push(CandidateOutcome {
                key,
                status: run.status,
                archive,
                result: run.result,
                error: run.error,
            });
        }

        tracing::info!(
            "Batch finished: {} run, {} skipped, stopped: {}",
            report.outcomes.len(),
            report.skipped.len(),
            report.stopped
        );
        report
    }
}

/// Copy `final_dir` to `<archive_root>/<key>`, replacing any earlier archive.
pub fn archive_result(
    final_dir: &Path,
    archive_root: &Path,
    key: &str,
    sink: LineSink<'_>,
) -> Option<PathBuf> {
    let target = archive_root.join(key);
    match store::replace_dir(final_dir, &target) {
        Ok(()) => {
            let message = format!("Archived {} to {}", key, target.display());
            tracing::info!("{}", message);
            sink(&message);
            Some(target)
        }
        Err(e) => {
            tracing::error!("Archiving {} failed: {}", key, e);
            sink(&format!("ERROR: archiving {} failed: {}", key, e));
            None
        }
    }
}
