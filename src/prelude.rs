//! Prelude module for common imports

// Stage model
pub use crate::pipeline::codebase::{CodeBase, ExecutionSource, TriggerInfo, TriggerType};
pub use crate::pipeline::errors::{StageExecutionError, ValidationError};
pub use crate::pipeline::infra::{InfraFamily, Infrastructure};
pub use crate::pipeline::node::{ExecutionNode, StepGroup};
pub use crate::pipeline::stage::{IntegrationStage, PipelineProperties, ServiceDependency};
pub use crate::pipeline::steps::{StepKind, StepNode, StepSpec};
pub use crate::pipeline::types::{OsType, ResourceKind, Validate};
pub use crate::pipeline::{Resolved, Variable};

// Planning
pub use crate::backend::{BackendTask, ExecutionIds, TaskParams};
pub use crate::planner::{
    Collaborators, ContainerDefinition, ExecutionPlanOrchestrator, ExpandedStage, InitializePlan,
    PlanRequest, ResourceAccountant, ResourceRequest,
};

// Collaborators and configuration
pub use crate::infrastructure::config::Config;
pub use crate::infrastructure::services::{
    ConnectorDetails, ConnectorType, Edition, FeatureFlag, ServiceKind, StaticConnectors,
    StaticFeatureFlags, StaticLicense, StaticTokens,
};
pub use crate::infrastructure::sweeping::{InMemoryStore, JsonFileStore, SweepingOutputStore};
