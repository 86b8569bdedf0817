//! Plan model, wire conversion, and structural validation.

mod build;
mod model;
mod validate;

pub use build::build;
pub use model::{
    ConfigurationRef, Edge, EdgeCondition, ExecutionPlan, PlanOptions, Step,
};
pub use validate::{resolve_end, resolve_start, validate};

use thiserror::Error;

/// Failure converting a wire payload into a typed plan.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("{0}")]
    Shape(String),
}

/// Structural defect found by [`validate`]. Any of these is fatal before the
/// first step runs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("circular dependency: {0} <-> {1}")]
    CircularDependency(String, String),
    #[error("multiple dependencies detected for: {0}")]
    MultipleDependencies(String),
    #[error("duplicate step id: {0}")]
    DuplicateStep(String),
    #[error("edge from {step} references unknown step {target}")]
    UnknownTarget { step: String, target: String },
    #[error("start step not found")]
    StartNotFound,
    #[error("multiple candidate start steps")]
    AmbiguousStart,
    #[error("no start step could be resolved")]
    NoStart,
    #[error("end step not found")]
    EndNotFound,
    #[error("end pattern matched multiple steps")]
    AmbiguousEnd,
}
