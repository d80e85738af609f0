//! Stage planning
//!
//! Everything between the stage model and the backend task: execution
//! source resolution, build env, implicit steps, resource accounting, port
//! allocation, connector binding and container expansion. The
//! [`ExecutionPlanOrchestrator`] runs these in order.

pub mod connectors;
pub mod container;
pub mod env;
pub mod expander;
pub mod image;
pub mod injector;
pub mod orchestrator;
pub mod plugin_settings;
pub mod ports;
pub mod resources;
pub mod source;
pub mod stage_utils;

pub use connectors::{ConnectorBinding, ConnectorResolver, ConnectorSecret};
pub use container::{
    ContainerDefinition, ContainerResourceParams, ContainerType, SecretSource, SecretVariable,
};
pub use env::{build_environment, inject_loop_env_vars};
pub use expander::{ExpandedStage, ExpansionContext, StepPlanExpander};
pub use image::{ImageDetails, fully_qualified_image, image_info};
pub use injector::{ImplicitStepInjector, InjectionPolicy};
pub use orchestrator::{
    Collaborators, ExecutionPlanOrchestrator, InitializePlan, InitializeStepInfo, PlanRequest,
    PlannedNode,
};
pub use ports::PortFinder;
pub use resources::{
    AccountingPolicy, ResourceAccountant, ResourceRequest, StageAllocation, StepAllocation,
    StrategyInfo, StrategyMap,
};
pub use source::resolve_execution_source;
