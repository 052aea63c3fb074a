//! Workflow-level error types.

use thiserror::Error;

use crate::plan::PlanError;

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Invalid duration literal '{0}'")]
    InvalidDuration(String),

    #[error("Workflow deadline exceeded")]
    DeadlineExceeded,

    #[error("Cancelled")]
    Cancelled,

    #[error("Skill composition exceeds maximum depth {0}")]
    DepthExceeded(usize),

    #[error("Skill composition cycle: '{0}' is already executing")]
    CompositionCycle(String),
}
