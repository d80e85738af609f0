//! Step plan expansion
//!
//! Walks the combined execution tree of a stage and turns every step that
//! needs a container, plus every service dependency, into a
//! [`ContainerDefinition`]. Kubernetes stages get one container per step;
//! VM and Docker stages only carry their services at initialization, steps
//! are dispatched one by one later.
//!
//! Environment layering, lowest precedence first:
//!
//! - user containers: pipeline variables, stage variables, step env, build
//!   metadata;
//! - plugin-compatible steps: pipeline variables, stage variables, build
//!   metadata, `container=docker` for hosted image builds, plugin settings.

use ahash::AHashSet;
use std::collections::BTreeMap;

use super::connectors::{ConnectorBinding, ConnectorResolver};
use super::container::{
    ContainerDefinition, ContainerResourceParams, ContainerType, SecretSource, SecretVariable,
    addon_args, addon_command, secret_source, service_container_name, step_container_name,
};
use super::image::image_info;
use super::injector::{GIT_CLONE_STEP_ID, RESTORE_CACHE_STEP_ID, SAVE_CACHE_STEP_ID};
use super::plugin_settings::{PluginContext, plugin_settings};
use super::ports::PortFinder;
use super::resources::{ResourceAccountant, StageAllocation};
use crate::infrastructure::config::Config;
use crate::pipeline::node::{ExecutionNode, STEP_GROUP_SEPARATOR, all_steps};
use crate::pipeline::stage::ServiceDependency;
use crate::pipeline::steps::{ContainerOptions, ExecutionEnvironment, StepKind, StepNode, StepSpec};
use crate::pipeline::{
    InfraFamily, Infrastructure, IntegrationStage, OsType, Resolved, StageExecutionError,
    Variable, VariableValue,
};

pub const SERVICE_ENTRYPOINT_ENV: &str = "HARNESS_SERVICE_ENTRYPOINT";
pub const SERVICE_ARGS_ENV: &str = "HARNESS_SERVICE_ARGS";
const BUILD_NUMBER_ENV: &str = "DRONE_BUILD_NUMBER";

/// Inputs shared by every container of a stage
#[derive(Debug, Clone, Copy)]
pub struct ExpansionContext<'a> {
    /// Planner configuration
    pub config: &'a Config,
    /// Stage infrastructure
    pub infra: &'a Infrastructure,
    /// Pipeline-level variables
    pub pipeline_variables: &'a [Variable],
    /// Build metadata env of the execution
    pub build_env: &'a BTreeMap<String, String>,
    /// Service account key handed to cache intelligence steps on hosted Kubernetes
    pub cache_service_key: Option<&'a str>,
}

/// Containers and bookkeeping of an expanded stage
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExpandedStage {
    /// One container per step, in document order
    pub steps: Vec<ContainerDefinition>,
    /// One container per service dependency
    pub services: Vec<ContainerDefinition>,
    /// Resource allocation of the step containers
    pub allocation: StageAllocation,
    /// Every port handed out
    pub ports: Vec<u16>,
    /// Connector bindings keyed by stage-unique step identifier
    pub connector_bindings: BTreeMap<String, Vec<ConnectorBinding>>,
}

impl ExpandedStage {
    /// Step containers followed by service containers
    pub fn containers(&self) -> impl Iterator<Item = &ContainerDefinition> {
        self.steps.iter().chain(&self.services)
    }
}

/// Plain and secret env accumulated layer by layer
#[derive(Debug, Default)]
pub(crate) struct EnvLayers {
    plain: BTreeMap<String, String>,
    secrets: BTreeMap<String, SecretSource>,
}

impl EnvLayers {
    pub(crate) fn set(&mut self, name: String, value: String) {
        match secret_source(&value) {
            Some(source) => {
                self.plain.remove(&name);
                self.secrets.insert(name, source);
            }
            None => {
                self.secrets.remove(&name);
                self.plain.insert(name, value);
            }
        }
    }

    pub(crate) fn extend<K: Into<String>, V: Into<String>>(
        &mut self,
        env: impl IntoIterator<Item = (K, V)>,
    ) {
        for (name, value) in env {
            self.set(name.into(), value.into());
        }
    }

    pub(crate) fn variables(&mut self, variables: &[Variable]) {
        for variable in variables {
            let name = variable.name().to_string();
            match variable.value() {
                VariableValue::Plain(value) => self.set(name, value),
                VariableValue::Secret(secret_id) => {
                    self.plain.remove(&name);
                    self.secrets.insert(name, SecretSource::Reference(secret_id));
                }
            }
        }
    }

    pub(crate) fn finish(self) -> (BTreeMap<String, String>, Vec<SecretVariable>) {
        let secrets = self
            .secrets
            .into_iter()
            .map(|(name, source)| SecretVariable { name, source })
            .collect();
        (self.plain, secrets)
    }
}

/// Leaf steps with their stage-unique identifiers, in document order
fn prefixed_steps<'n>(nodes: &'n [ExecutionNode]) -> Vec<(String, &'n StepNode)> {
    fn walk<'n>(node: &'n ExecutionNode, prefix: &str, out: &mut Vec<(String, &'n StepNode)>) {
        match node {
            ExecutionNode::Step(step) => out.push((format!("{prefix}{}", step.identifier), step)),
            ExecutionNode::Parallel(sections) => {
                for section in sections {
                    walk(section, prefix, out);
                }
            }
            ExecutionNode::StepGroup(group) => {
                let nested = format!("{prefix}{}{STEP_GROUP_SEPARATOR}", group.identifier);
                for child in &group.steps {
                    walk(child, &nested, out);
                }
            }
        }
    }

    let mut out = Vec::new();
    for node in nodes {
        walk(node, "", &mut out);
    }
    out
}

/// Rejects parallel blocks whose steps do not share an execution environment.
///
/// # Errors
///
/// Returns [`StageExecutionError::MixedExecutionEnvironment`] naming the
/// steps of the first offending block.
pub fn check_parallel_environments(nodes: &[ExecutionNode]) -> Result<(), StageExecutionError> {
    for node in nodes {
        match node {
            ExecutionNode::Step(_) => {}
            ExecutionNode::Parallel(sections) => {
                let steps: Vec<&StepNode> = sections.iter().flat_map(ExecutionNode::steps).collect();
                let environments: AHashSet<ExecutionEnvironment> = steps
                    .iter()
                    .map(|step| step.kind().execution_environment())
                    .collect();
                if environments.len() > 1 {
                    let ids: Vec<&str> = steps.iter().map(|s| s.identifier.as_str()).collect();
                    return Err(StageExecutionError::MixedExecutionEnvironment {
                        steps: ids.join(", "),
                    });
                }
                check_parallel_environments(sections)?;
            }
            ExecutionNode::StepGroup(group) => check_parallel_environments(&group.steps)?,
        }
    }
    Ok(())
}

fn declares_port_bindings(bindings: &Resolved<BTreeMap<String, String>>) -> bool {
    match bindings {
        Resolved::Literal(map) => !map.is_empty(),
        Resolved::Unresolved(_) => true,
        Resolved::Absent => false,
    }
}

fn is_cache_intelligence_step(step: &StepNode) -> bool {
    matches!(&step.spec, StepSpec::Plugin(plugin) if plugin.harness_managed_image)
        && (step.identifier == RESTORE_CACHE_STEP_ID || step.identifier == SAVE_CACHE_STEP_ID)
}

/// Expands a stage into container definitions
pub struct StepPlanExpander<'a> {
    ctx: ExpansionContext<'a>,
    accountant: ResourceAccountant,
    connectors: ConnectorResolver<'a>,
}

impl<'a> StepPlanExpander<'a> {
    /// Creates an expander.
    pub fn new(
        ctx: ExpansionContext<'a>,
        accountant: ResourceAccountant,
        connectors: ConnectorResolver<'a>,
    ) -> Self {
        Self {
            ctx,
            accountant,
            connectors,
        }
    }

    fn family(&self) -> InfraFamily {
        self.ctx.infra.family()
    }

    fn os(&self) -> OsType {
        self.ctx.infra.os()
    }

    /// Checks that every step type may run on the stage infrastructure and
    /// that parallel blocks do not mix execution environments.
    ///
    /// # Errors
    ///
    /// Fails on cloud-only steps outside hosted VMs, image builds on Windows
    /// pods and mixed parallel blocks.
    pub fn validate_step_types(&self, nodes: &[ExecutionNode]) -> Result<(), StageExecutionError> {
        for step in all_steps(nodes) {
            let kind = step.kind();
            let step_type = || kind.type_name().to_string();
            match self.family() {
                InfraFamily::Kubernetes => {
                    if kind.is_cloud_only() {
                        return Err(StageExecutionError::CloudOnlyStep {
                            step_type: step_type(),
                        });
                    }
                    if self.os().is_windows() && kind.is_image_build() {
                        return Err(StageExecutionError::WindowsUnsupportedStep {
                            step_type: step_type(),
                        });
                    }
                }
                InfraFamily::Vm | InfraFamily::Docker => {
                    if kind.is_cloud_only() && !matches!(self.ctx.infra, Infrastructure::HostedVm(_))
                    {
                        return Err(StageExecutionError::CloudOnlyStep {
                            step_type: step_type(),
                        });
                    }
                }
            }
        }
        check_parallel_environments(nodes)
    }

    /// Expands `nodes`, the stage's combined step list, and its services.
    ///
    /// Ports go to services first, then to step containers in document order.
    ///
    /// # Errors
    ///
    /// Fails on any validation, resolution, accounting or connector error;
    /// nothing is returned partially.
    pub fn expand(
        &self,
        stage: &IntegrationStage,
        nodes: &[ExecutionNode],
    ) -> Result<ExpandedStage, StageExecutionError> {
        self.validate_step_types(nodes)?;

        let ports_config = self.ctx.config.ports;
        let mut ports = PortFinder::new(ports_config.first_step, [ports_config.lite_engine]);

        let services = stage
            .service_dependencies
            .iter()
            .enumerate()
            .map(|(index, service)| self.service_container(index, service, stage, &mut ports))
            .collect::<Result<Vec<_>, _>>()?;

        let connector_bindings = self.connectors.step_bindings(nodes)?;

        let mut expanded = ExpandedStage {
            services,
            connector_bindings,
            ..ExpandedStage::default()
        };

        if self.family() == InfraFamily::Kubernetes {
            expanded.allocation = self.accountant.allocate(nodes)?;
            for (identifier, step) in prefixed_steps(nodes) {
                if !step.kind().needs_container() {
                    continue;
                }
                let index = expanded.steps.len() + 1;
                let port = ports.next_port()?;
                let container = self.step_container(
                    index,
                    &identifier,
                    step,
                    port,
                    &expanded.allocation,
                    stage,
                )?;
                expanded.steps.push(container);
            }
        }

        expanded.ports = ports.used_ports();
        tracing::debug!(
            stage = %stage.identifier,
            steps = expanded.steps.len(),
            services = expanded.services.len(),
            "Expanded stage containers"
        );
        Ok(expanded)
    }

    fn harness_image_connector(&self) -> Option<String> {
        let from_infra = match self.ctx.infra {
            Infrastructure::KubernetesDirect(k8s) => k8s.harness_image_connector_ref.as_deref(),
            Infrastructure::Vm(vm) => vm.harness_image_connector_ref.as_deref(),
            _ => None,
        };
        from_infra
            .or(self.ctx.config.harness_image_connector.as_deref())
            .filter(|c| !c.trim().is_empty())
            .map(str::to_string)
    }

    fn base_env(&self, stage: &IntegrationStage) -> EnvLayers {
        let mut env = EnvLayers::default();
        env.variables(self.ctx.pipeline_variables);
        env.variables(&stage.variables);
        env
    }

    fn service_container(
        &self,
        index: usize,
        service: &ServiceDependency,
        stage: &IntegrationStage,
        ports: &mut PortFinder,
    ) -> Result<ContainerDefinition, StageExecutionError> {
        let spec = &service.spec;
        let on_kubernetes = self.family() == InfraFamily::Kubernetes;
        if on_kubernetes && declares_port_bindings(&spec.port_bindings) {
            return Err(StageExecutionError::PortBindingsOnKubernetes);
        }

        let image = spec
            .container
            .image
            .require("image", "Service", &service.identifier)?;
        let mut image = image_info(image)?;
        image.connector_ref = spec.container.connector_ref.non_empty().map(str::to_string);

        let port = ports.next_port()?;
        let mut env = self.base_env(stage);
        if let Some(service_env) = spec.container.env_variables.literal() {
            env.extend(service_env.clone());
        }
        if let Some(entrypoint) = spec.entrypoint.literal().filter(|e| !e.is_empty()) {
            env.set(SERVICE_ENTRYPOINT_ENV.to_string(), shell_words::join(entrypoint));
        }
        if let Some(args) = spec.args.literal().filter(|a| !a.is_empty()) {
            env.set(SERVICE_ARGS_ENV.to_string(), shell_words::join(args));
        }
        let (env, secrets) = env.finish();

        let limit = self.accountant.declared_limit(spec.container.resources.as_ref())?;
        Ok(ContainerDefinition {
            name: service_container_name(index),
            container_type: ContainerType::Service,
            step_identifier: service.identifier.clone(),
            step_name: service.name.clone(),
            image,
            commands: addon_command(self.os()),
            args: addon_args(port),
            env,
            secrets,
            resources: ContainerResourceParams::guaranteed(limit),
            ports: vec![port],
            privileged: spec.container.privileged.resolve_or(false),
            run_as_user: spec.container.run_as_user.literal().copied(),
            image_pull_policy: spec.container.image_pull_policy,
            security_context: None,
            port_bindings: if on_kubernetes {
                BTreeMap::new()
            } else {
                spec.port_bindings.resolve_or(BTreeMap::new())
            },
        })
    }

    fn step_container(
        &self,
        index: usize,
        identifier: &str,
        step: &StepNode,
        port: u16,
        allocation: &StageAllocation,
        stage: &IntegrationStage,
    ) -> Result<ContainerDefinition, StageExecutionError> {
        let resources = allocation
            .step(identifier)
            .copied()
            .map(ContainerResourceParams::from)
            .ok_or_else(|| {
                StageExecutionError::configuration(format!(
                    "No resources allocated for step {identifier}"
                ))
            })?;

        let mut container = match step.spec.container_options() {
            Some(options) => self.user_container(step, options, stage)?,
            None => self.plugin_container(step, stage)?,
        };
        container.name = step_container_name(index);
        container.step_identifier = identifier.to_string();
        container.step_name = step.name.clone();
        container.commands = addon_command(self.os());
        container.args = addon_args(port);
        container.ports = vec![port];
        container.resources = resources;
        Ok(container)
    }

    /// Run, RunTests, Background and Plugin steps
    fn user_container(
        &self,
        step: &StepNode,
        options: &ContainerOptions,
        stage: &IntegrationStage,
    ) -> Result<ContainerDefinition, StageExecutionError> {
        let kind = step.kind();
        let container_type = match kind {
            StepKind::Run => ContainerType::Run,
            StepKind::RunTests => ContainerType::TestIntelligence,
            StepKind::Background => ContainerType::Background,
            _ => ContainerType::Plugin,
        };

        if let StepSpec::Background(background) = &step.spec {
            if declares_port_bindings(&background.port_bindings) {
                return Err(StageExecutionError::PortBindingsOnKubernetes);
            }
        }

        let image = options.image.non_empty().ok_or_else(|| {
            StageExecutionError::configuration("image can't be empty in k8s infrastructure")
        })?;
        let cache_step = is_cache_intelligence_step(step);
        let harness_managed = matches!(&step.spec, StepSpec::Plugin(p) if p.harness_managed_image);
        let connector_ref = if harness_managed {
            self.harness_image_connector()
        } else {
            match options.connector_ref.non_empty() {
                Some(connector) => Some(connector.to_string()),
                None if kind == StepKind::Plugin => None,
                None if kind == StepKind::Background => {
                    return Err(StageExecutionError::configuration(
                        "connectorRef can't be empty in k8s infrastructure",
                    ));
                }
                None => {
                    return Err(StageExecutionError::configuration(
                        "connector ref can't be empty in k8s infrastructure",
                    ));
                }
            }
        };
        let mut image = image_info(image)?;
        image.connector_ref = connector_ref;

        let mut env = self.base_env(stage);
        if let Some(step_env) = options.env_variables.literal() {
            env.extend(step_env.clone());
        } else if options.env_variables.is_unresolved() {
            tracing::debug!(step = %step.identifier, "Skipping unresolved step environment");
        }
        if cache_step && matches!(self.ctx.infra, Infrastructure::KubernetesHosted(_)) {
            env.extend(self.cache_intelligence_env());
        }
        env.extend(self.ctx.build_env.clone());
        let (env, secrets) = env.finish();

        Ok(ContainerDefinition {
            name: String::new(),
            container_type,
            step_identifier: step.identifier.clone(),
            step_name: None,
            image,
            commands: Vec::new(),
            args: Vec::new(),
            env,
            secrets,
            resources: ContainerResourceParams::default(),
            ports: Vec::new(),
            privileged: options.privileged.resolve_or(false),
            run_as_user: options.run_as_user.literal().copied(),
            image_pull_policy: options.image_pull_policy,
            security_context: None,
            port_bindings: BTreeMap::new(),
        })
    }

    fn cache_intelligence_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::from([
            (
                "PLUGIN_BUCKET".to_string(),
                self.ctx.config.cache_intelligence.bucket.clone(),
            ),
            ("PLUGIN_BACKEND".to_string(), "gcs".to_string()),
            ("PLUGIN_ARCHIVE_FORMAT".to_string(), "tar".to_string()),
        ]);
        if let Some(key) = self.ctx.cache_service_key {
            env.insert("PLUGIN_JSON_KEY".to_string(), key.to_string());
        }
        env
    }

    /// Steps whose image and settings come from the platform
    fn plugin_container(
        &self,
        step: &StepNode,
        stage: &IntegrationStage,
    ) -> Result<ContainerDefinition, StageExecutionError> {
        let kind = step.kind();
        let unresolved = |field: &str| StageExecutionError::UnresolvedMandatoryField {
            field: field.to_string(),
            step_type: kind.type_name().to_string(),
            identifier: step.identifier.clone(),
        };
        let plugin = step.spec.plugin_options().ok_or_else(|| unresolved("spec"))?;

        let image = self
            .ctx
            .config
            .images
            .step_image(kind, self.family())
            .filter(|image| !image.trim().is_empty())
            .ok_or_else(|| {
                StageExecutionError::configuration(format!("No image configured for {kind} steps"))
            })?;
        let mut image = image_info(image)?;
        image.connector_ref = self.harness_image_connector();

        let git_connector = if kind == StepKind::GitClone {
            let connector_ref = plugin
                .connector_ref
                .non_empty()
                .ok_or_else(|| unresolved("connectorRef"))?;
            Some(self.connectors.resolve(connector_ref)?)
        } else {
            None
        };
        let settings = plugin_settings(
            step,
            &PluginContext {
                family: self.family(),
                os: self.os(),
                git_connector: git_connector.as_ref(),
                implicit_clone: step.identifier == GIT_CLONE_STEP_ID,
            },
        )?;

        let mut env = self.base_env(stage);
        if kind == StepKind::GitClone {
            env.extend(
                self.ctx
                    .build_env
                    .iter()
                    .filter(|(name, _)| name.as_str() == BUILD_NUMBER_ENV)
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
        } else {
            env.extend(self.ctx.build_env.clone());
        }
        if kind.is_image_build() && self.ctx.infra.is_hosted() {
            env.set("container".to_string(), "docker".to_string());
        }
        env.extend(settings);
        let (env, secrets) = env.finish();

        Ok(ContainerDefinition {
            name: String::new(),
            container_type: ContainerType::Plugin,
            step_identifier: step.identifier.clone(),
            step_name: None,
            image,
            commands: Vec::new(),
            args: Vec::new(),
            env,
            secrets,
            resources: ContainerResourceParams::default(),
            ports: Vec::new(),
            privileged: false,
            run_as_user: plugin.run_as_user.literal().copied(),
            image_pull_policy: None,
            security_context: None,
            port_bindings: BTreeMap::new(),
        })
    }
}
