//! # Stageplan - CI stage initialization planner
//!
//! Stageplan turns the definition of a CI integration stage into the
//! parameters of the task that brings up its build environment: a build pod
//! for Kubernetes, a setup request for VM pools and hosted VMs, or a runtime
//! setup for local Docker runners.
//!
//! ## Quick Start
//!
//! ```no_run
//! use stageplan::prelude::*;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let connectors = StaticConnectors::new();
//! let flags = StaticFeatureFlags::new();
//! let license = StaticLicense(Some(Edition::Team));
//! let tokens = StaticTokens::new().with_token(ServiceKind::Log, "token");
//! let outputs = InMemoryStore::new();
//!
//! let orchestrator = ExecutionPlanOrchestrator::new(
//!     &config,
//!     Collaborators {
//!         flags: &flags,
//!         connectors: &connectors,
//!         license: &license,
//!         tokens: &tokens,
//!         outputs: &outputs,
//!     },
//! );
//!
//! let request: PlanRequest = serde_yaml::from_str(&std::fs::read_to_string("stage.yaml")?)?;
//! let plan = orchestrator.plan(&request)?;
//! println!("{}", serde_json::to_string_pretty(&plan)?);
//! # Ok(())
//! # }
//! ```
//!
//! ## Layout
//!
//! - [`pipeline`]: typed stage model
//! - [`planner`]: execution source, implicit steps, resources, ports and
//!   container expansion
//! - [`backend`]: initialize task builders per infrastructure family
//! - [`infrastructure`]: configuration, logging, retries, service clients
//!   and the sweeping output store

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod backend;
pub mod infrastructure;
pub mod pipeline;
pub mod planner;

// Prelude module for common imports
pub mod prelude;

// Re-export commonly used types
pub use backend::{BackendTask, BackendTaskBuilder, ExecutionIds, TaskParams, builder_for};
pub use infrastructure::{
    Config, ConfigError, InMemoryStore, JsonFileStore, RetryPolicy, SweepingOutputStore,
};
pub use pipeline::{
    ExecutionNode, Infrastructure, IntegrationStage, StageExecutionError, StepNode, Validate,
    ValidationError,
};
pub use planner::{
    Collaborators, ExecutionPlanOrchestrator, ExpandedStage, InitializePlan, PlanRequest,
    ResourceAccountant,
};

/// Version of the stageplan crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
