//! Declarative workflow execution.
//!
//! A workflow is an acyclic graph of tool invocations with templated
//! arguments. Planning layers the graph into levels; execution runs each
//! level with bounded parallelism, applying per-step conditions, retries,
//! timeouts and error policies.
//!
//! ## Modules
//!
//! - [`types`]: step, input and output definitions (shared with skill
//!   frontmatter)
//! - [`plan`]: deterministic topological layering
//! - [`template`]: `{{ … }}` argument expansion and condition expressions
//! - [`executor`]: level-by-level execution over a [`ToolInvoker`]
//! - [`output`]: final output assembly

pub mod error;
pub mod executor;
pub mod output;
pub mod plan;
pub mod template;
pub mod types;

pub use error::WorkflowError;
pub use executor::{
    ExecutionContext, ExecutorLimits, InvokeError, InvokeOutcome, StepRecord, ToolInvoker,
    WorkflowExecutor, WorkflowReport, WorkflowRun,
};
pub use plan::{plan, ExecutionPlan, PlanError};
pub use template::{TemplateContext, TemplateError};
pub use types::{
    parse_duration, InputSpec, InputType, OnErrorPolicy, OutputFormat, OutputSpec, RetrySpec,
    StepResult, StepStatus, WorkflowStatus, WorkflowStep,
};
