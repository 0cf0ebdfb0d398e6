//! Error types for the run pipeline

use thiserror::Error;

/// Failure taxonomy for a candidate run.
///
/// Parse anomalies and cancellation have no variant here: an empty report
/// only marks the iteration as not converged, and a stop request is a run
/// outcome.
#[derive(Error, Debug)]
pub enum FeaError {
    #[error("Input/geometry error: {0}")]
    InputGeometry(String),

    #[error("Material data error: {0}")]
    MaterialData(String),

    #[error("Expression error in '{expression}': {message}")]
    Expression { expression: String, message: String },

    #[error("Solver launch error: {0}")]
    SolverLaunch(String),

    #[error("Solver failed: {0}")]
    SolverFailed(String),

    #[error("Mesher failed: {0}")]
    Mesher(String),

    #[error("Parsing error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FeaError {
    pub fn expression(expression: &str, message: impl Into<String>) -> Self {
        FeaError::Expression {
            expression: expression.to_string(),
            message: message.into(),
        }
    }
}

/// Result type for pipeline operations
pub type FeaResult<T> = Result<T, FeaError>;
