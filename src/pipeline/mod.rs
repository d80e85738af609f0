//! Stage domain model
//!
//! Typed model of a CI stage as handed to the planner: the execution tree,
//! step kinds, codebase, infrastructure and variables.

pub mod codebase;
pub mod errors;
pub mod infra;
pub mod node;
pub mod quantity;
pub mod resolved;
pub mod stage;
pub mod steps;
pub mod types;
pub mod variables;

pub use codebase::{
    Build, CodeBase, ExecutionArgs, ExecutionSource, GitProvider, ManualExecutionSource,
    PrCloneStrategy, TriggerInfo, TriggerType, WebhookEvent, WebhookExecutionSource,
};
pub use errors::{StageExecutionError, ValidationError};
pub use infra::{InfraFamily, Infrastructure};
pub use node::{ExecutionNode, StepGroup};
pub use resolved::Resolved;
pub use stage::{Caching, IntegrationStage, PipelineProperties, ServiceDependency};
pub use steps::{ExecutionEnvironment, StepKind, StepNode, StepSpec};
pub use types::{ArchType, ImagePullPolicy, OsType, ResourceKind, Validate};
pub use variables::{Variable, VariableValue};
