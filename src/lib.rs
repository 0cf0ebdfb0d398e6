//! Mesh-convergence orchestration for CalculiX analyses of welded
//! plate + channel members.

pub mod batch;
pub mod cancel;
pub mod config;
pub mod controller;
pub mod deck;
pub mod error;
pub mod expr;
pub mod material;
pub mod mesh;
pub mod mesher;
pub mod models;
pub mod parser;
pub mod postprocess;
pub mod sensors;
pub mod solver;
pub mod spatial;
pub mod store;

pub use batch::{BatchOptimizer, BatchReport, LoadOverrides};
pub use cancel::CancellationToken;
pub use config::RunConfig;
pub use controller::{CandidateInput, RunController, RunReport, RunStatus};
pub use error::{FeaError, FeaResult};
pub use mesher::{CommandMesher, MeshPort};
pub use solver::{CalculixRunner, SolverPort};
