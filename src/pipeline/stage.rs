//! CI stage definition
//!
//! An [`IntegrationStage`] is the unit the planner works on: its execution
//! tree, service dependencies, caching policy and infrastructure.

#![allow(clippy::must_use_candidate, clippy::return_self_not_must_use)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::codebase::CodeBase;
use super::errors::ValidationError;
use super::infra::Infrastructure;
use super::node::{ExecutionNode, validate_execution};
use super::resolved::Resolved;
use super::steps::ContainerOptions;
use super::types::Validate;
use super::variables::Variable;

fn default_true() -> bool {
    true
}

/// Steps of a stage
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    /// Top-level nodes, run serially
    #[serde(default)]
    pub steps: Vec<ExecutionNode>,
}

/// Cache intelligence settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Caching {
    /// Turn caching on
    pub enabled: bool,
    /// Cache key template
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// Paths to cache
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<String>,
}

/// Long-running service container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDependency {
    /// Service identifier
    pub identifier: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Container fields
    #[serde(default)]
    pub spec: ServiceSpec,
}

/// Container fields of a service
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceSpec {
    /// Image, connector, env and resources
    #[serde(flatten)]
    pub container: ContainerOptions,
    /// Entrypoint override
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub entrypoint: Resolved<Vec<String>>,
    /// Entrypoint arguments
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub args: Resolved<Vec<String>>,
    /// Host to container ports (VM and Docker only)
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub port_bindings: Resolved<BTreeMap<String, String>>,
}

impl ServiceDependency {
    /// Creates a service running `image`.
    pub fn new(identifier: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            spec: ServiceSpec {
                container: ContainerOptions {
                    image: Resolved::Literal(image.into()),
                    ..ContainerOptions::default()
                },
                ..ServiceSpec::default()
            },
        }
    }

    /// Sets the image connector
    pub fn with_connector(mut self, connector_ref: impl Into<String>) -> Self {
        self.spec.container.connector_ref = Resolved::Literal(connector_ref.into());
        self
    }
}

/// The CI stage being planned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationStage {
    /// Stage identifier
    pub identifier: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Stage variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    /// Clone the pipeline codebase before the user steps
    #[serde(default = "default_true")]
    pub clone_codebase: bool,
    /// Cache intelligence settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caching: Option<Caching>,
    /// Services running for the whole stage
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_dependencies: Vec<ServiceDependency>,
    /// Paths shared between step containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_paths: Vec<String>,
    /// Build infrastructure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure: Option<Infrastructure>,
    /// Steps
    #[serde(default)]
    pub execution: Execution,
    /// Stage timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl IntegrationStage {
    /// Creates a stage with the given steps and clone enabled.
    pub fn new(identifier: impl Into<String>, steps: Vec<ExecutionNode>) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            variables: Vec::new(),
            clone_codebase: true,
            caching: None,
            service_dependencies: Vec::new(),
            shared_paths: Vec::new(),
            infrastructure: None,
            execution: Execution { steps },
            timeout: None,
        }
    }

    /// Sets the infrastructure
    pub fn with_infrastructure(mut self, infrastructure: Infrastructure) -> Self {
        self.infrastructure = Some(infrastructure);
        self
    }

    /// Enables or disables the implicit clone
    pub fn with_clone_codebase(mut self, clone: bool) -> Self {
        self.clone_codebase = clone;
        self
    }

    /// Sets the caching policy
    pub fn with_caching(mut self, caching: Caching) -> Self {
        self.caching = Some(caching);
        self
    }

    /// Adds a service dependency
    pub fn with_service(mut self, service: ServiceDependency) -> Self {
        self.service_dependencies.push(service);
        self
    }

    /// Adds a stage variable
    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    /// True when caching is switched on
    pub fn caching_enabled(&self) -> bool {
        self.caching.as_ref().is_some_and(|c| c.enabled)
    }
}

impl Validate for IntegrationStage {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        if self.identifier.trim().is_empty() {
            return Err(ValidationError::EmptyIdentifier {
                kind: "stage".to_string(),
            });
        }
        if self
            .service_dependencies
            .iter()
            .any(|s| s.identifier.trim().is_empty())
        {
            return Err(ValidationError::EmptyIdentifier {
                kind: "service".to_string(),
            });
        }
        validate_execution(&self.execution.steps)
    }
}

/// Pipeline-level properties visible to the stage
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineProperties {
    /// Pipeline identifier
    pub identifier: String,
    /// Pipeline variables
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<Variable>,
    /// Codebase to clone
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codebase: Option<CodeBase>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::node::tests::run;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_deserialize_stage_defaults() {
        let stage: IntegrationStage = serde_yaml::from_str(
            r#"
identifier: build
caching:
  enabled: true
  paths: [/root/.m2]
serviceDependencies:
  - identifier: db
    spec:
      image: postgres:15
      connectorRef: account.docker
      portBindings:
        "5432": "5432"
infrastructure:
  type: KubernetesHosted
  spec: {}
execution:
  steps:
    - step:
        identifier: test
        type: Run
        spec:
          command: make test
"#,
        )
        .unwrap();

        assert!(stage.clone_codebase);
        assert!(stage.caching_enabled());
        assert_eq!(stage.service_dependencies[0].identifier, "db");
        assert_eq!(
            stage.service_dependencies[0].spec.container.image,
            Resolved::Literal("postgres:15".to_string())
        );
        assert!(stage.service_dependencies[0].spec.port_bindings.literal().is_some());
        assert_eq!(stage.execution.steps.len(), 1);
        assert!(stage.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_service_identifier() {
        let stage = IntegrationStage::new("build", vec![run("a")])
            .with_service(ServiceDependency::new(" ", "redis"));
        assert_eq!(
            stage.validate(),
            Err(ValidationError::EmptyIdentifier {
                kind: "service".to_string()
            })
        );
    }

    #[test]
    fn test_validate_rejects_empty_stage_identifier() {
        assert!(IntegrationStage::new("", vec![run("a")]).validate().is_err());
    }
}
