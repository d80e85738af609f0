//! Error types for stage planning

use thiserror::Error;

/// Fatal errors raised while building a stage initialization plan.
///
/// Every variant is terminal for the stage: nothing is dispatched when one is
/// returned. The `Display` output is the message surfaced to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StageExecutionError {
    /// Structural validation of the input model failed
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Generic configuration problem reported verbatim
    #[error("{0}")]
    Configuration(String),

    /// The stage declares no infrastructure
    #[error("Input infrastructure can not be empty")]
    MissingInfrastructure,

    /// Infrastructure kind not handled by the requested operation
    #[error("unexpected type of infra received")]
    UnexpectedInfrastructure,

    /// A mandatory field is absent or still an expression
    #[error("Failed to resolve mandatory field {field} in step type {step_type} with identifier {identifier}")]
    UnresolvedMandatoryField {
        /// Name of the field.
        field: String,
        /// Step type carrying the field.
        step_type: String,
        /// Step identifier.
        identifier: String,
    },

    /// Step type only runs on cloud-hosted infrastructure
    #[error("{step_type} step is only applicable for builds on cloud infrastructure")]
    CloudOnlyStep {
        /// Offending step type.
        step_type: String,
    },

    /// Step type cannot run on Windows Kubernetes pods
    #[error("{step_type} step not allowed in windows kubernetes builds")]
    WindowsUnsupportedStep {
        /// Offending step type.
        step_type: String,
    },

    /// Port bindings declared on Kubernetes infrastructure
    #[error("portBindings should be empty in k8s infrastructure")]
    PortBindingsOnKubernetes,

    /// A parallel block mixes lite-engine and CI-manager steps
    #[error("All steps in parallel block [{steps}] must run in the same execution environment")]
    MixedExecutionEnvironment {
        /// Comma separated identifiers of the parallel block.
        steps: String,
    },

    /// Strategy metadata missing for an expanded node
    #[error("Strategy metadata is missing for node with uuid {uuid}")]
    MissingStrategyMetadata {
        /// Uuid shared by the expanded nodes.
        uuid: String,
    },

    /// Base image connector of an unsupported type
    #[error("Unexpected base connector: {connector_type}")]
    UnexpectedBaseConnector {
        /// Type of the rejected connector.
        connector_type: String,
    },

    /// Mandatory plugin setting resolved to nothing
    #[error("Environment variable {name} can't be empty or null")]
    EmptyEnvironmentVariable {
        /// Environment variable name.
        name: String,
    },

    /// Trigger type cannot start a CI stage
    #[error("CI stage cannot be triggered by trigger of type: {trigger_type}")]
    UnsupportedTrigger {
        /// Effective trigger type.
        trigger_type: String,
    },

    /// Registry URL of a Docker connector does not parse
    #[error("Malformed registryUrl {url} in docker connector id: {connector}")]
    MalformedRegistryUrl {
        /// Registry URL as configured.
        url: String,
        /// Connector identifier.
        connector: String,
    },

    /// Hosted builds need a CI license
    #[error("Please enable CI free plan or reach out to support.")]
    MissingLicense,

    /// A document node could not be deserialized
    #[error("failed to deserialize {node} node: {message}")]
    Deserialization {
        /// Node kind (step, parallel, stepGroup, stage).
        node: String,
        /// Underlying parser message.
        message: String,
    },

    /// Connector lookup failed
    #[error("Failed to resolve connector {connector_ref}: {message}")]
    Connector {
        /// Connector reference as written in the stage.
        connector_ref: String,
        /// Lookup failure.
        message: String,
    },

    /// A mandatory external service could not be reached
    #[error("Failed to fetch {service} service token: {message}")]
    ServiceUnavailable {
        /// Service name.
        service: String,
        /// Last failure message.
        message: String,
    },

    /// No free port left in the allocator range
    #[error("No free port available after {last}")]
    PortsExhausted {
        /// Last port handed out.
        last: u16,
    },

    /// Internal request for an unknown resource kind
    #[error("Invalid resource type: {0}")]
    InvalidResourceType(String),
}

impl StageExecutionError {
    /// Builds a [`StageExecutionError::Configuration`] from any message.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}

/// Validation errors for the stage input model
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Identifier cannot be empty
    #[error("{kind} identifier cannot be empty")]
    EmptyIdentifier {
        /// Kind of node (step, stepGroup, service).
        kind: String,
    },

    /// Two steps collapse to the same identifier after prefixing
    #[error("Duplicate step identifier '{identifier}'")]
    DuplicateStepIdentifier {
        /// The duplicated identifier.
        identifier: String,
    },

    /// Parallel block without sections
    #[error("Parallel block must have at least one section")]
    EmptyParallel,

    /// Step group without steps
    #[error("Step group '{identifier}' must have at least one step")]
    EmptyStepGroup {
        /// Step group identifier.
        identifier: String,
    },

    /// Quantity string could not be parsed
    #[error("Invalid {kind} quantity '{value}'")]
    InvalidQuantity {
        /// Resource kind (cpu or memory).
        kind: String,
        /// Offending value.
        value: String,
    },

    /// Duration string could not be parsed
    #[error("Invalid timeout '{value}'")]
    InvalidTimeout {
        /// Offending value.
        value: String,
    },
}
