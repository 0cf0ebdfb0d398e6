//! Line scanner for the CalculiX `.dat` report.
//!
//! Each line is classified once, then a pure transition function decides the
//! next scan state. Data lines are consumed according to the state they land
//! in.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{FeaError, FeaResult};
use crate::models::StressTensor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    Idle,
    Displacements,
    Stresses,
    Reactions,
    Buckling,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LineKind<'a> {
    Blank,
    StepMarker,
    DisplacementHeader,
    StressHeader,
    /// `forces (fx,fy,fz) for set <support>`
    ReactionHeader,
    BucklingHeader,
    /// `MODE NO` / `FACTOR` captions under the buckling header
    BucklingCaption,
    Data(Vec<&'a str>),
    Other,
}

/// How often each block header has been seen in the current step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderTally {
    pub displacements: u32,
    pub stresses: u32,
    pub buckling_step: bool,
}

impl HeaderTally {
    /// The first header of a kind opens capture; any repeat closes it.
    fn toggle(count: &mut u32) -> bool {
        *count += 1;
        *count == 1
    }
}

fn reaction_header() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)^\s*forces\s*\(fx,\s*fy,\s*fz\)\s*for\s+set\s+(\S+)")
            .expect("static regex")
    })
}

pub fn classify<'a>(line: &'a str, support_set: &str) -> LineKind<'a> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineKind::Blank;
    }
    if trimmed.starts_with("S T E P") {
        return LineKind::StepMarker;
    }
    if trimmed.contains("B U C K L I N G") {
        return LineKind::BucklingHeader;
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("displacements") {
        return LineKind::DisplacementHeader;
    }
    if lower.starts_with("stresses") {
        return LineKind::StressHeader;
    }
    if let Some(caps) = reaction_header().captures(trimmed) {
        return if caps[1].eq_ignore_ascii_case(support_set) {
            LineKind::ReactionHeader
        } else {
            LineKind::Other
        };
    }
    if lower.starts_with("mode no") || lower == "factor" {
        return LineKind::BucklingCaption;
    }
    let tokens: Vec<&str> = trimmed.split_whitespace().collect();
    if tokens[0].parse::<usize>().is_ok() {
        return LineKind::Data(tokens);
    }
    LineKind::Other
}

/// Next scan state for a classified line.
pub fn transition(state: ScanState, kind: &LineKind, tally: &mut HeaderTally) -> ScanState {
    match kind {
        LineKind::Blank => state,
        LineKind::StepMarker => {
            *tally = HeaderTally::default();
            ScanState::Idle
        }
        LineKind::DisplacementHeader => {
            // Mode shapes of a buckling step are not static displacements
            if !tally.buckling_step && HeaderTally::toggle(&mut tally.displacements) {
                ScanState::Displacements
            } else {
                ScanState::Idle
            }
        }
        LineKind::StressHeader => {
            if !tally.buckling_step && HeaderTally::toggle(&mut tally.stresses) {
                ScanState::Stresses
            } else {
                ScanState::Idle
            }
        }
        LineKind::ReactionHeader => ScanState::Reactions,
        LineKind::BucklingHeader => {
            tally.buckling_step = true;
            ScanState::Buckling
        }
        LineKind::BucklingCaption if state == ScanState::Buckling => ScanState::Buckling,
        LineKind::Data(_) => state,
        LineKind::BucklingCaption | LineKind::Other => ScanState::Idle,
    }
}

/// Raw tables extracted from one report.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawReport {
    pub displacements: BTreeMap<usize, [f64; 3]>,
    /// Element ID → tensors at its integration points
    pub element_stresses: BTreeMap<usize, Vec<StressTensor>>,
    pub reactions: BTreeMap<usize, [f64; 3]>,
    /// Ascending mode number
    pub buckling_factors: Vec<f64>,
}

impl RawReport {
    pub fn load(path: &Path, support_set: &str) -> FeaResult<Self> {
        if !path.exists() {
            return Err(FeaError::Parse(format!("no report at {:?}", path)));
        }
        let content = fs::read_to_string(path)
            .map_err(|e| FeaError::Parse(format!("failed to read {:?}: {}", path, e)))?;
        Ok(Self::scan(&content, support_set))
    }

    pub fn scan(content: &str, support_set: &str) -> Self {
        let mut report = RawReport::default();
        let mut state = ScanState::Idle;
        let mut tally = HeaderTally::default();

        for line in content.lines() {
            let kind = classify(line, support_set);
            state = transition(state, &kind, &mut tally);
            if let LineKind::Data(tokens) = kind {
                report.consume(state, &tokens);
            }
        }

        tracing::debug!(
            "Report scan: {} displacements, {} stressed elements, {} reactions, {} buckling factors",
            report.displacements.len(),
            report.element_stresses.len(),
            report.reactions.len(),
            report.buckling_factors.len()
        );
        report
    }

    fn consume(&mut self, state: ScanState, tokens: &[&str]) {
        match state {
            ScanState::Displacements | ScanState::Reactions => {
                let Some((id, v)) = id_and_vector(tokens) else {
                    return;
                };
                if state == ScanState::Displacements {
                    self.displacements.insert(id, v);
                } else {
                    self.reactions.insert(id, v);
                }
            }
            ScanState::Stresses => {
                if tokens.len() < 8 {
                    return;
                }
                let (Ok(elem_id), Ok(_int_pt)) = (tokens[0].parse::<usize>(), tokens[1].parse::<usize>()) else {
                    return;
                };
                let values: Vec<f64> = tokens[2..8].iter().filter_map(|t| t.parse().ok()).collect();
                if let Some(tensor) = StressTensor::from_slice(&values) {
                    self.element_stresses.entry(elem_id).or_default().push(tensor);
                }
            }
            ScanState::Buckling => {
                if tokens.len() < 2 {
                    return;
                }
                if let Some(Ok(factor)) = tokens.last().map(|t| t.parse::<f64>()) {
                    self.buckling_factors.push(factor);
                }
            }
            ScanState::Idle => {}
        }
    }
}

fn id_and_vector(tokens: &[&str]) -> Option<(usize, [f64; 3])> {
    if tokens.len() < 4 {
        return None;
    }
    let id = tokens[0].parse::<usize>().ok()?;
    let x = tokens[1].parse::<f64>().ok()?;
    let y = tokens[2].parse::<f64>().ok()?;
    let z = tokens[3].parse::<f64>().ok()?;
    Some((id, [x, y, z]))
}
