//! Execution plan orchestration
//!
//! Runs the whole planning sequence for one stage:
//!
//! 1. resolve the execution source from the trigger,
//! 2. derive the build env and inject implicit steps,
//! 3. expand steps and services into container definitions,
//! 4. fetch service tokens and the stage TTL,
//! 5. hand everything to the backend builder of the infra family and record
//!    the sweeping outputs.
//!
//! Either a complete [`InitializePlan`] comes out or an error does; no
//! partial plan is returned.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

use super::connectors::ConnectorResolver;
use super::env::{build_environment, inject_loop_env_vars};
use super::expander::{ExpansionContext, StepPlanExpander};
use super::injector::{ImplicitStepInjector, InjectionPolicy};
use super::resources::{AccountingPolicy, ResourceAccountant, ResourceRequest, StrategyMap};
use super::source::resolve_execution_source;
use super::stage_utils::{build_os, git_url, init_timeout, stage_ttl};
use crate::backend::{BackendContext, ExecutionIds, ServiceTokens, TaskParams, builder_for};
use crate::infrastructure::config::Config;
use crate::infrastructure::retry::RetryPolicy;
use crate::infrastructure::services::{
    ConnectorDirectory, FeatureFlag, FeatureFlagService, LicenseService, ServiceError, ServiceKind,
    ServiceTokenClient,
};
use crate::infrastructure::sweeping::{
    STAGE_CLEANUP_DETAILS, STAGE_INFRA_DETAILS, StageCleanupDetails, StageInfraDetails,
    SweepingOutput, SweepingOutputStore,
};
use crate::pipeline::codebase::{
    CodeBase, ExecutionArgs, ExecutionSource, TriggerInfo, TriggerType, WebhookExecutionSource,
};
use crate::pipeline::node::{ExecutionNode, validate_execution};
use crate::pipeline::{
    InfraFamily, Infrastructure, IntegrationStage, PipelineProperties, ResourceKind,
    StageExecutionError, Validate,
};

const INITIALIZE_STEP_ID: &str = "liteEngineTask";
const INITIALIZE_STEP_NAME: &str = "Initialize";

fn manual_trigger() -> TriggerInfo {
    TriggerInfo::new(TriggerType::Manual)
}

/// One stage to plan, with the execution it belongs to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    /// Execution identity
    #[serde(default)]
    pub ids: ExecutionIds,
    /// Pipeline variables and codebase
    #[serde(default)]
    pub pipeline: PipelineProperties,
    /// Stage to plan
    pub stage: IntegrationStage,
    /// How the execution was started
    #[serde(default = "manual_trigger")]
    pub trigger: TriggerInfo,
    /// Parsed webhook payload for webhook triggered runs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookExecutionSource>,
    /// Concurrency of strategy-expanded steps keyed by uuid
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub strategy: StrategyMap,
}

impl PlanRequest {
    /// Request for `stage` started manually
    #[must_use]
    pub fn new(ids: ExecutionIds, stage: IntegrationStage) -> Self {
        Self {
            ids,
            pipeline: PipelineProperties::default(),
            stage,
            trigger: manual_trigger(),
            webhook: None,
            strategy: StrategyMap::new(),
        }
    }

    /// Sets the pipeline properties
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: PipelineProperties) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Scope of the sweeping outputs of this stage run
    #[must_use]
    pub fn output_scope(&self) -> String {
        format!("{}/{}", self.ids.execution_id, self.stage.identifier)
    }

    fn codebase(&self) -> Option<&CodeBase> {
        self.pipeline.codebase.as_ref()
    }
}

/// External services the planner consults
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    /// Feature flags
    pub flags: &'a dyn FeatureFlagService,
    /// Connector metadata
    pub connectors: &'a dyn ConnectorDirectory,
    /// Account license
    pub license: &'a dyn LicenseService,
    /// Platform service tokens
    pub tokens: &'a dyn ServiceTokenClient,
    /// Sweeping outputs of earlier attempts
    pub outputs: &'a dyn SweepingOutputStore,
}

/// The initialize step placed in front of the stage's steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeStepInfo {
    /// Step identifier
    pub identifier: String,
    /// Display name
    pub name: String,
    /// Owning stage
    pub stage_identifier: String,
    /// Stage infrastructure
    pub infrastructure: Infrastructure,
    /// Pipeline codebase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codebase: Option<CodeBase>,
    /// Resolved execution source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_source: Option<ExecutionSource>,
    /// Time allowed for the infrastructure to come up
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Implicit and user steps, in execution order
    pub steps: Vec<ExecutionNode>,
}

/// Result of planning a stage
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializePlan {
    /// Initialize step
    pub initialize: InitializeStepInfo,
    /// Task for the runner
    pub task: TaskParams,
    /// Peak requirement of the stage
    pub stage_resources: ResourceRequest,
    /// Where the stage runs
    pub infra_details: StageInfraDetails,
    /// What to tear down after the stage
    pub cleanup: StageCleanupDetails,
    /// Stage execution after planning: the initialize step, then every node
    /// of the combined list scheduled on its own
    pub execution: Vec<PlannedNode>,
}

/// Entry of the planned stage execution
#[derive(Debug, Clone, PartialEq)]
pub enum PlannedNode {
    /// The initialize step, by identifier
    Initialize(String),
    /// Implicit or user node
    Node(ExecutionNode),
}

impl PlannedNode {
    /// Identifiers of the steps this entry schedules
    #[must_use]
    pub fn identifiers(&self) -> Vec<String> {
        match self {
            Self::Initialize(identifier) => vec![identifier.clone()],
            Self::Node(node) => node.step_identifiers(""),
        }
    }
}

impl Serialize for PlannedNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Initialize(identifier) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("initialize", identifier)?;
                map.end()
            }
            Self::Node(node) => node.serialize(serializer),
        }
    }
}

/// Steps of a stage ready for expansion
struct PreparedStage<'r> {
    infra: &'r Infrastructure,
    source: Option<ExecutionSource>,
    build_env: BTreeMap<String, String>,
    steps: Vec<ExecutionNode>,
    accountant: ResourceAccountant,
}

/// Plans stages against a set of collaborators
pub struct ExecutionPlanOrchestrator<'a> {
    config: &'a Config,
    collaborators: Collaborators<'a>,
    retry: RetryPolicy,
}

impl<'a> ExecutionPlanOrchestrator<'a> {
    /// Orchestrator retrying service calls per `config.retry`
    #[must_use]
    pub fn new(config: &'a Config, collaborators: Collaborators<'a>) -> Self {
        Self {
            config,
            collaborators,
            retry: RetryPolicy::from(config.retry),
        }
    }

    /// Replaces the retry policy of service calls
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Builds the initialize plan of `request.stage`.
    ///
    /// # Errors
    ///
    /// Any validation, resolution, accounting, connector, license or log
    /// token failure aborts planning.
    pub fn plan(&self, request: &PlanRequest) -> Result<InitializePlan, StageExecutionError> {
        let stage = &request.stage;
        let account = request.ids.account_id.as_str();
        tracing::info!(stage = %stage.identifier, account, "Planning stage");

        let prepared = self.prepare(request)?;
        let infra = prepared.infra;
        let builder = builder_for(Some(infra))?;

        let cache_service_key = self.cache_service_key(infra, stage, account);
        let expanded = self
            .expander(request, &prepared, cache_service_key.as_deref())
            .expand(stage, &prepared.steps)?;

        let ttl = stage_ttl(infra, self.collaborators.license, account, &self.config.timeouts)?;
        let tokens = self.service_tokens(account)?;

        let outputs = self.collaborators.outputs;
        let scope = request.output_scope();
        let previous = match outputs.get(&scope, STAGE_INFRA_DETAILS).map_err(store_error)? {
            Some(SweepingOutput::InfraDetails(details)) => Some(details),
            _ => None,
        };

        let resolver = ConnectorResolver::new(self.collaborators.connectors);
        let ctx = BackendContext {
            config: self.config,
            ids: &request.ids,
            stage,
            infra,
            codebase: request.codebase(),
            pipeline_variables: &request.pipeline.variables,
            build_env: &prepared.build_env,
            tokens: &tokens,
            ttl,
            previous: previous.as_ref(),
            connectors: &resolver,
        };
        let task = builder.build(&ctx, &expanded)?;

        outputs
            .put_if_absent(
                &scope,
                STAGE_INFRA_DETAILS,
                SweepingOutput::InfraDetails(task.infra_details.clone()),
            )
            .map_err(store_error)?;
        outputs
            .put_if_absent(
                &scope,
                STAGE_CLEANUP_DETAILS,
                SweepingOutput::CleanupDetails(task.cleanup.clone()),
            )
            .map_err(store_error)?;

        tracing::info!(
            stage = %stage.identifier,
            infra = %infra,
            runtime = %task.infra_details.runtime_name(),
            "Stage planned"
        );
        let execution = std::iter::once(PlannedNode::Initialize(INITIALIZE_STEP_ID.to_string()))
            .chain(prepared.steps.iter().cloned().map(PlannedNode::Node))
            .collect();
        Ok(InitializePlan {
            initialize: InitializeStepInfo {
                identifier: INITIALIZE_STEP_ID.to_string(),
                name: INITIALIZE_STEP_NAME.to_string(),
                stage_identifier: stage.identifier.clone(),
                infrastructure: infra.clone(),
                codebase: request.codebase().cloned(),
                execution_source: prepared.source,
                timeout: init_timeout(infra, &self.config.timeouts),
                steps: prepared.steps,
            },
            task: task.params,
            stage_resources: expanded.allocation.stage,
            infra_details: task.infra_details,
            cleanup: task.cleanup,
            execution,
        })
    }

    /// Peak resource requirement of the stage, implicit steps included.
    ///
    /// # Errors
    ///
    /// See [`ExecutionPlanOrchestrator::plan`].
    pub fn stage_requirement(
        &self,
        request: &PlanRequest,
        kind: ResourceKind,
    ) -> Result<u32, StageExecutionError> {
        let prepared = self.prepare(request)?;
        prepared.accountant.stage_request(&prepared.steps, kind)
    }

    /// Structural and step-type validation without building anything.
    ///
    /// # Errors
    ///
    /// See [`ExecutionPlanOrchestrator::plan`].
    pub fn validate(&self, request: &PlanRequest) -> Result<(), StageExecutionError> {
        let prepared = self.prepare(request)?;
        self.expander(request, &prepared, None)
            .validate_step_types(&prepared.steps)
    }

    fn prepare<'r>(
        &self,
        request: &'r PlanRequest,
    ) -> Result<PreparedStage<'r>, StageExecutionError> {
        let stage = &request.stage;
        stage.validate()?;
        let infra = stage
            .infrastructure
            .as_ref()
            .ok_or(StageExecutionError::MissingInfrastructure)?;
        let account = request.ids.account_id.as_str();
        let codebase = request.codebase();

        let codebase_url = match (codebase, &request.webhook) {
            (Some(codebase), Some(_)) => Some(self.codebase_url(codebase)?),
            _ => None,
        };
        let source = resolve_execution_source(
            &request.trigger,
            codebase,
            request.webhook.as_ref(),
            codebase_url.as_deref(),
        )?;
        let build_env = build_environment(&ExecutionArgs {
            run_sequence: request.ids.run_sequence.clone(),
            execution_source: source.clone(),
        });

        let flags = self.collaborators.flags;
        let injector = ImplicitStepInjector::new(InjectionPolicy {
            account_id: account,
            os: build_os(Some(infra))?,
            hosted: infra.is_hosted(),
            cache_intelligence: flags.is_enabled(FeatureFlag::CiCacheIntelligence, account),
            cache_image: &self.config.images.cache,
        });
        let mut steps = injector.inject(stage, codebase, source.as_ref())?;
        inject_loop_env_vars(&mut steps);
        validate_execution(&steps)?;

        let policy = AccountingPolicy::from_config(
            &self.config.resources,
            flags.is_enabled(FeatureFlag::CiIncreaseDefaultResources, account),
            flags.is_enabled(FeatureFlag::CiDisableResourceOptimization, account),
            account,
        )?;
        Ok(PreparedStage {
            infra,
            source,
            build_env,
            steps,
            accountant: ResourceAccountant::new(policy, request.strategy.clone()),
        })
    }

    fn expander<'e>(
        &'e self,
        request: &'e PlanRequest,
        prepared: &'e PreparedStage<'_>,
        cache_service_key: Option<&'e str>,
    ) -> StepPlanExpander<'e> {
        StepPlanExpander::new(
            ExpansionContext {
                config: self.config,
                infra: prepared.infra,
                pipeline_variables: &request.pipeline.variables,
                build_env: &prepared.build_env,
                cache_service_key,
            },
            prepared.accountant.clone(),
            ConnectorResolver::new(self.collaborators.connectors),
        )
    }

    fn codebase_url(&self, codebase: &CodeBase) -> Result<String, StageExecutionError> {
        let connector = ConnectorResolver::new(self.collaborators.connectors)
            .resolve(&codebase.connector_ref)?;
        git_url(&connector, codebase.repo_name.as_deref())
    }

    /// Service account key for cache intelligence on hosted clusters
    fn cache_service_key(
        &self,
        infra: &Infrastructure,
        stage: &IntegrationStage,
        account: &str,
    ) -> Option<String> {
        let wanted = infra.is_hosted()
            && infra.family() == InfraFamily::Kubernetes
            && stage.caching_enabled()
            && self
                .collaborators
                .flags
                .is_enabled(FeatureFlag::CiCacheIntelligence, account);
        let path = &self.config.cache_intelligence.service_key_path;
        if !wanted || path.trim().is_empty() {
            return None;
        }
        match std::fs::read_to_string(path) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::warn!(path = %path, error = %e, "Cache intelligence key unavailable");
                None
            }
        }
    }

    /// Log token is mandatory; TI and STO fall back to empty tokens.
    fn service_tokens(&self, account: &str) -> Result<ServiceTokens, StageExecutionError> {
        let fetch = |service: ServiceKind| {
            self.retry.run(
                &format!("fetch {service} service token"),
                || self.collaborators.tokens.token(service, account),
                ServiceError::is_transient,
            )
        };
        let log = fetch(ServiceKind::Log).map_err(|e| StageExecutionError::ServiceUnavailable {
            service: ServiceKind::Log.to_string(),
            message: e.to_string(),
        })?;
        let optional = |service: ServiceKind| {
            fetch(service).unwrap_or_else(|e| {
                tracing::warn!(%service, error = %e, "Continuing without service token");
                String::new()
            })
        };
        Ok(ServiceTokens {
            log,
            ti: optional(ServiceKind::Ti),
            sto: optional(ServiceKind::Sto),
        })
    }
}

fn store_error(e: impl std::fmt::Display) -> StageExecutionError {
    StageExecutionError::configuration(format!("Failed to access sweeping outputs: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::services::{
        ConnectionType, ConnectorDetails, ConnectorType, Edition, StaticConnectors,
        StaticFeatureFlags, StaticLicense, StaticTokens,
    };
    use crate::infrastructure::sweeping::InMemoryStore;
    use crate::pipeline::codebase::Build;
    use crate::pipeline::infra::{HostedVmInfra, K8sDirectInfra, K8sHostedInfra};
    use crate::pipeline::node::tests::run_with;
    use crate::pipeline::stage::Caching;
    use crate::pipeline::Resolved;
    use crate::planner::injector::{GIT_CLONE_STEP_ID, RESTORE_CACHE_STEP_ID, SAVE_CACHE_STEP_ID};
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    struct Harness {
        config: Config,
        flags: StaticFeatureFlags,
        connectors: StaticConnectors,
        license: StaticLicense,
        tokens: Box<dyn ServiceTokenClient>,
        outputs: InMemoryStore,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                config: Config::default(),
                flags: StaticFeatureFlags::new(),
                connectors: StaticConnectors::new()
                    .with(
                        ConnectorDetails::new("account.github", ConnectorType::Github)
                            .with_url("https://github.com/acme")
                            .with_connection_type(ConnectionType::Account),
                    )
                    .with(
                        ConnectorDetails::new("account.docker", ConnectorType::DockerRegistry)
                            .with_url("https://index.docker.io/v1/"),
                    ),
                license: StaticLicense(Some(Edition::Team)),
                tokens: Box::new(
                    StaticTokens::new()
                        .with_token(ServiceKind::Log, "log-token")
                        .with_token(ServiceKind::Ti, "ti-token"),
                ),
                outputs: InMemoryStore::new(),
            }
        }

        fn orchestrator(&self) -> ExecutionPlanOrchestrator<'_> {
            ExecutionPlanOrchestrator::new(
                &self.config,
                Collaborators {
                    flags: &self.flags,
                    connectors: &self.connectors,
                    license: &self.license,
                    tokens: self.tokens.as_ref(),
                    outputs: &self.outputs,
                },
            )
            .with_retry(RetryPolicy::immediate(3))
        }
    }

    fn ids() -> ExecutionIds {
        ExecutionIds {
            account_id: "acc".to_string(),
            execution_id: "exec-1".to_string(),
            stage_runtime_id: "rt-1".to_string(),
            run_sequence: "3".to_string(),
            ..ExecutionIds::default()
        }
    }

    fn k8s() -> Infrastructure {
        Infrastructure::KubernetesDirect(K8sDirectInfra {
            namespace: Resolved::Literal("builds".to_string()),
            ..K8sDirectInfra::default()
        })
    }

    fn request(infra: Infrastructure) -> PlanRequest {
        let stage = IntegrationStage::new("build", vec![run_with("compile", None, None)])
            .with_infrastructure(infra);
        PlanRequest::new(ids(), stage).with_pipeline(PipelineProperties {
            identifier: "ci".to_string(),
            variables: Vec::new(),
            codebase: Some(CodeBase {
                connector_ref: "account.github".to_string(),
                repo_name: Some("app".to_string()),
                build: Resolved::Literal(Build::Branch {
                    branch: Resolved::Literal("main".to_string()),
                }),
                ..CodeBase::default()
            }),
        })
    }

    #[test]
    fn test_plan_kubernetes_stage() {
        let harness = Harness::new();
        let plan = harness.orchestrator().plan(&request(k8s())).unwrap();

        assert_eq!(
            crate::pipeline::node::step_identifiers(&plan.initialize.steps),
            vec![GIT_CLONE_STEP_ID, "compile"]
        );
        assert!(matches!(
            plan.initialize.execution_source,
            Some(ExecutionSource::Manual(_))
        ));
        let TaskParams::Kubernetes(params) = &plan.task else {
            unreachable!()
        };
        let env = &params.pod.lite_engine.env;
        assert_eq!(env["HARNESS_LOG_SERVICE_TOKEN"], "log-token");
        assert_eq!(env["HARNESS_TI_SERVICE_TOKEN"], "ti-token");
        assert_eq!(env["HARNESS_STO_SERVICE_TOKEN"], "");

        let stored = harness
            .outputs
            .get("exec-1/build", STAGE_INFRA_DETAILS)
            .unwrap();
        assert_eq!(stored, Some(SweepingOutput::InfraDetails(plan.infra_details.clone())));
        assert!(
            harness
                .outputs
                .get("exec-1/build", STAGE_CLEANUP_DETAILS)
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_outer_execution_order() {
        let mut harness = Harness::new();
        harness.flags = StaticFeatureFlags::new().with_flag(FeatureFlag::CiCacheIntelligence);
        let mut request = request(Infrastructure::KubernetesHosted(K8sHostedInfra::default()));
        request.stage = request.stage.clone().with_caching(Caching {
            enabled: true,
            key: None,
            paths: vec!["node_modules".to_string()],
        });

        let plan = harness.orchestrator().plan(&request).unwrap();
        let scheduled: Vec<String> = plan
            .execution
            .iter()
            .flat_map(PlannedNode::identifiers)
            .collect();
        assert_eq!(
            scheduled,
            vec![
                INITIALIZE_STEP_ID,
                GIT_CLONE_STEP_ID,
                RESTORE_CACHE_STEP_ID,
                "compile",
                SAVE_CACHE_STEP_ID,
            ]
        );
        assert_eq!(plan.execution[0], PlannedNode::Initialize(INITIALIZE_STEP_ID.to_string()));

        let json = serde_json::to_value(&plan.execution).unwrap();
        assert_eq!(json[0]["initialize"], "liteEngineTask");
        assert_eq!(json[1]["step"]["identifier"], GIT_CLONE_STEP_ID);
    }

    #[test]
    fn test_replanning_reuses_pod_name() {
        let harness = Harness::new();
        let request = request(k8s());
        let first = harness.orchestrator().plan(&request).unwrap();
        let second = harness.orchestrator().plan(&request).unwrap();
        assert_eq!(
            first.infra_details.runtime_name(),
            second.infra_details.runtime_name()
        );
    }

    #[test]
    fn test_missing_log_token_is_fatal() {
        let mut harness = Harness::new();
        harness.tokens = Box::new(StaticTokens::new().with_token(ServiceKind::Ti, "ti"));
        let err = harness.orchestrator().plan(&request(k8s())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to fetch log service token: log request failed: no token configured"
        );
        assert!(harness.outputs.is_empty());
    }

    struct FlakyTokens {
        failures: Mutex<u32>,
    }

    impl ServiceTokenClient for FlakyTokens {
        fn token(&self, service: ServiceKind, _account_id: &str) -> Result<String, ServiceError> {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(ServiceError::Status {
                    service: service.to_string(),
                    status: 503,
                });
            }
            Ok(format!("{service}-token"))
        }
    }

    #[test]
    fn test_transient_token_failures_retried() {
        let mut harness = Harness::new();
        harness.tokens = Box::new(FlakyTokens {
            failures: Mutex::new(2),
        });
        let plan = harness.orchestrator().plan(&request(k8s())).unwrap();
        let TaskParams::Kubernetes(params) = &plan.task else {
            unreachable!()
        };
        assert_eq!(params.pod.lite_engine.env["HARNESS_LOG_SERVICE_TOKEN"], "log-token");
        assert_eq!(params.pod.lite_engine.env["HARNESS_STO_SERVICE_TOKEN"], "sto-token");
    }

    #[test]
    fn test_hosted_build_needs_license() {
        let mut harness = Harness::new();
        harness.license = StaticLicense(None);
        let err = harness
            .orchestrator()
            .plan(&request(Infrastructure::HostedVm(HostedVmInfra::default())))
            .unwrap_err();
        assert_eq!(err, StageExecutionError::MissingLicense);
    }

    #[test]
    fn test_missing_infrastructure() {
        let harness = Harness::new();
        let mut request = request(k8s());
        request.stage.infrastructure = None;
        assert_eq!(
            harness.orchestrator().plan(&request).unwrap_err().to_string(),
            "Input infrastructure can not be empty"
        );
    }

    #[test]
    fn test_stage_requirement_and_validation() {
        let harness = Harness::new();
        let orchestrator = harness.orchestrator();
        let request = request(k8s());
        assert_eq!(
            orchestrator
                .stage_requirement(&request, ResourceKind::Cpu)
                .unwrap(),
            400
        );
        assert!(orchestrator.validate(&request).is_ok());

        let mut duplicated = request.clone();
        duplicated.stage.execution.steps.push(run_with("compile", None, None));
        assert!(matches!(
            orchestrator.validate(&duplicated),
            Err(StageExecutionError::Validation(_))
        ));
    }
}
