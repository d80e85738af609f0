//! Backend task builders
//!
//! An expanded stage is turned into the initialize task of its
//! infrastructure family: a build pod for Kubernetes, a setup request for VM
//! pools and hosted VMs, and a runtime setup for local Docker runners.

pub mod k8s;
pub mod vm;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub use k8s::{K8sInitializeTaskParams, K8sTaskBuilder, PodSpec, SystemContainer};
pub use vm::{
    DetachedStepRequest, DliteVmInitializeTaskParams, DockerInitializeTaskParams, DockerTaskBuilder,
    SetupVmRequest, VmInitializeTaskParams, VmTaskBuilder,
};

use crate::infrastructure::config::Config;
use crate::infrastructure::sweeping::{StageCleanupDetails, StageInfraDetails};
use crate::pipeline::codebase::CodeBase;
use crate::pipeline::infra::{InfraFamily, Infrastructure};
use crate::pipeline::{IntegrationStage, StageExecutionError, Variable};
use crate::planner::connectors::ConnectorResolver;
use crate::planner::container::SecretVariable;
use crate::planner::expander::{EnvLayers, ExpandedStage};

/// Identity of the execution being planned
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExecutionIds {
    /// Account
    pub account_id: String,
    /// Organization
    pub org_id: String,
    /// Project
    pub project_id: String,
    /// Pipeline
    pub pipeline_id: String,
    /// Plan execution id
    pub execution_id: String,
    /// Id of this run of the stage
    pub stage_runtime_id: String,
    /// Build number
    pub run_sequence: String,
}

/// Per-account tokens of the platform services
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceTokens {
    /// Log service token
    pub log: String,
    /// Test intelligence token
    pub ti: String,
    /// Security testing token
    pub sto: String,
}

/// Endpoint and token of a platform service
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServiceEndpoint {
    /// Base URL
    pub url: String,
    /// Account token
    pub token: String,
}

/// Platform services reachable from the build
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PlatformServices {
    /// Log service
    pub log: ServiceEndpoint,
    /// Test intelligence
    pub ti: ServiceEndpoint,
    /// Security testing orchestration
    pub sto: ServiceEndpoint,
}

/// Everything a builder reads besides the expanded stage
#[derive(Clone, Copy)]
pub struct BackendContext<'a> {
    /// Configuration
    pub config: &'a Config,
    /// Execution identity
    pub ids: &'a ExecutionIds,
    /// Stage being built
    pub stage: &'a IntegrationStage,
    /// Stage infrastructure
    pub infra: &'a Infrastructure,
    /// Pipeline codebase
    pub codebase: Option<&'a CodeBase>,
    /// Pipeline variables
    pub pipeline_variables: &'a [Variable],
    /// Build env derived from the execution source
    pub build_env: &'a BTreeMap<String, String>,
    /// Platform service tokens
    pub tokens: &'a ServiceTokens,
    /// Longest time the stage may run
    pub ttl: Duration,
    /// Infra record left by an earlier attempt of this stage
    pub previous: Option<&'a StageInfraDetails>,
    /// Connector lookup
    pub connectors: &'a ConnectorResolver<'a>,
}

impl BackendContext<'_> {
    /// Log, TI and STO endpoints with their tokens
    #[must_use]
    pub fn platform_services(&self) -> PlatformServices {
        let endpoint = |url: &str, token: &str| ServiceEndpoint {
            url: url.to_string(),
            token: token.to_string(),
        };
        let services = &self.config.services;
        PlatformServices {
            log: endpoint(&services.log_url, &self.tokens.log),
            ti: endpoint(&services.ti_url, &self.tokens.ti),
            sto: endpoint(&services.sto_url, &self.tokens.sto),
        }
    }

    /// Stage-wide environment: pipeline variables, stage variables, then
    /// the build env
    #[must_use]
    pub fn stage_environment(&self) -> (BTreeMap<String, String>, Vec<SecretVariable>) {
        let mut env = EnvLayers::default();
        env.variables(self.pipeline_variables);
        env.variables(&self.stage.variables);
        env.extend(self.build_env.iter().map(|(k, v)| (k.clone(), v.clone())));
        env.finish()
    }
}

/// Parameters of the initialize task sent to the runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TaskParams {
    /// Build pod
    Kubernetes(K8sInitializeTaskParams),
    /// VM pool or runs-on machine
    Vm(VmInitializeTaskParams),
    /// Hosted VM
    DliteVm(DliteVmInitializeTaskParams),
    /// Local Docker runner
    Docker(DockerInitializeTaskParams),
}

/// Output of a builder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendTask {
    /// Task sent to the runner
    pub params: TaskParams,
    /// Where the stage runs
    pub infra_details: StageInfraDetails,
    /// What to tear down after the stage
    pub cleanup: StageCleanupDetails,
}

/// Turns an expanded stage into an initialize task
#[allow(clippy::missing_errors_doc)]
pub trait BackendTaskBuilder: Send + Sync {
    /// Family this builder serves
    fn family(&self) -> InfraFamily;

    /// Builds the task for `expanded`
    fn build(
        &self,
        ctx: &BackendContext<'_>,
        expanded: &ExpandedStage,
    ) -> Result<BackendTask, StageExecutionError>;
}

/// Builder for the family of `infra`.
///
/// # Errors
///
/// Returns [`StageExecutionError::MissingInfrastructure`] when the stage has
/// no infrastructure.
pub fn builder_for(
    infra: Option<&Infrastructure>,
) -> Result<Box<dyn BackendTaskBuilder>, StageExecutionError> {
    let infra = infra.ok_or(StageExecutionError::MissingInfrastructure)?;
    Ok(match infra.family() {
        InfraFamily::Kubernetes => Box::new(K8sTaskBuilder),
        InfraFamily::Vm => Box::new(VmTaskBuilder),
        InfraFamily::Docker => Box::new(DockerTaskBuilder),
    })
}

/// Name of the volume backing the `index`-th shared path
#[must_use]
pub fn shared_volume_name(index: usize) -> String {
    format!("shared-{index}")
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::infrastructure::services::{ConnectorDetails, ConnectorType, StaticConnectors};
    use crate::pipeline::infra::{DockerInfra, K8sHostedInfra, VmInfra};
    use crate::pipeline::node::tests::run_with;
    use crate::pipeline::stage::ServiceDependency;
    use crate::planner::expander::{ExpansionContext, StepPlanExpander};
    use crate::planner::resources::ResourceAccountant;

    /// Stage with one Run step and one service, built on the given infra
    pub(crate) struct Fixture {
        pub(crate) config: Config,
        pub(crate) ids: ExecutionIds,
        pub(crate) tokens: ServiceTokens,
        pub(crate) pipeline_variables: Vec<Variable>,
        pub(crate) build_env: BTreeMap<String, String>,
        pub(crate) connectors: StaticConnectors,
        pub(crate) stage: IntegrationStage,
    }

    impl Fixture {
        pub(crate) fn new(infra: Infrastructure) -> Self {
            let stage = IntegrationStage::new(
                "Build_And_Test_Everything",
                vec![run_with("compile", None, None)],
            )
            .with_clone_codebase(false)
            .with_service(
                ServiceDependency::new("db", "postgres:15").with_connector("account.docker"),
            )
            .with_infrastructure(infra);
            Self {
                config: Config::default(),
                ids: ExecutionIds {
                    account_id: "acc".to_string(),
                    org_id: "default".to_string(),
                    project_id: "web".to_string(),
                    pipeline_id: "ci".to_string(),
                    execution_id: "exec-1".to_string(),
                    stage_runtime_id: "rt-1".to_string(),
                    run_sequence: "12".to_string(),
                },
                tokens: ServiceTokens {
                    log: "log-token".to_string(),
                    ..ServiceTokens::default()
                },
                pipeline_variables: Vec::new(),
                build_env: BTreeMap::from([("DRONE_BUILD_NUMBER".to_string(), "12".to_string())]),
                connectors: StaticConnectors::new().with(
                    ConnectorDetails::new("account.docker", ConnectorType::DockerRegistry)
                        .with_url("https://registry.acme.io"),
                ),
                stage,
            }
        }

        pub(crate) fn build(
            &self,
            previous: Option<&StageInfraDetails>,
        ) -> Result<BackendTask, StageExecutionError> {
            let infra = self
                .stage
                .infrastructure
                .as_ref()
                .ok_or(StageExecutionError::MissingInfrastructure)?;
            let resolver = ConnectorResolver::new(&self.connectors);
            let expanded = StepPlanExpander::new(
                ExpansionContext {
                    config: &self.config,
                    infra,
                    pipeline_variables: &self.pipeline_variables,
                    build_env: &self.build_env,
                    cache_service_key: None,
                },
                ResourceAccountant::default(),
                ConnectorResolver::new(&self.connectors),
            )
            .expand(&self.stage, &self.stage.execution.steps)?;
            let ctx = BackendContext {
                config: &self.config,
                ids: &self.ids,
                stage: &self.stage,
                infra,
                codebase: None,
                pipeline_variables: &self.pipeline_variables,
                build_env: &self.build_env,
                tokens: &self.tokens,
                ttl: Duration::from_secs(3600),
                previous,
                connectors: &resolver,
            };
            builder_for(Some(infra))?.build(&ctx, &expanded)
        }
    }

    #[test]
    fn test_builder_selection() {
        let k8s = Infrastructure::KubernetesHosted(K8sHostedInfra::default());
        let vm = Infrastructure::Vm(VmInfra::default());
        let docker = Infrastructure::Docker(DockerInfra::default());

        assert_eq!(builder_for(Some(&k8s)).unwrap().family(), InfraFamily::Kubernetes);
        assert_eq!(builder_for(Some(&vm)).unwrap().family(), InfraFamily::Vm);
        assert_eq!(builder_for(Some(&docker)).unwrap().family(), InfraFamily::Docker);
        assert!(matches!(
            builder_for(None).err(),
            Some(StageExecutionError::MissingInfrastructure)
        ));
    }

    #[test]
    fn test_stage_environment_layers() {
        let mut fixture = Fixture::new(Infrastructure::Docker(DockerInfra::default()));
        fixture.pipeline_variables = vec![Variable::Secret {
            name: "TOKEN".to_string(),
            value: "account.token".to_string(),
        }];
        fixture.stage = fixture.stage.clone().with_variable(Variable::String {
            name: "DRONE_BUILD_NUMBER".to_string(),
            value: crate::pipeline::Resolved::Literal("stage".to_string()),
            default: None,
        });
        let resolver = ConnectorResolver::new(&fixture.connectors);
        let ctx = BackendContext {
            config: &fixture.config,
            ids: &fixture.ids,
            stage: &fixture.stage,
            infra: fixture.stage.infrastructure.as_ref().unwrap(),
            codebase: None,
            pipeline_variables: &fixture.pipeline_variables,
            build_env: &fixture.build_env,
            tokens: &fixture.tokens,
            ttl: Duration::ZERO,
            previous: None,
            connectors: &resolver,
        };

        let (env, secrets) = ctx.stage_environment();
        assert_eq!(env["DRONE_BUILD_NUMBER"], "12");
        assert_eq!(secrets, vec![SecretVariable::reference("TOKEN", "account.token")]);
        assert_eq!(ctx.platform_services().log.token, "log-token");
    }

    #[test]
    fn test_shared_volume_name() {
        assert_eq!(shared_volume_name(0), "shared-0");
    }
}
