//! VM and Docker setup requests
//!
//! VM pools, hosted VMs and local Docker runners all receive one setup
//! request describing the stage environment. Step containers are not part
//! of it: the runner starts them one by one as the steps execute.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{
    BackendContext, BackendTask, BackendTaskBuilder, ExecutionIds, PlatformServices, TaskParams,
    shared_volume_name,
};
use crate::infrastructure::sweeping::{StageCleanupDetails, StageInfraDetails};
use crate::pipeline::infra::{InfraFamily, Infrastructure};
use crate::pipeline::stage::ServiceDependency;
use crate::pipeline::{ArchType, ImagePullPolicy, IntegrationStage, OsType, StageExecutionError};
use crate::planner::container::{ContainerDefinition, SecretVariable};
use crate::planner::expander::{ExpandedStage, SERVICE_ARGS_ENV, SERVICE_ENTRYPOINT_ENV};
use crate::planner::stage_utils::{init_timeout, stage_connector_refs};

/// Host directory shared by the step containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmVolume {
    /// Volume name
    pub name: String,
    /// Host path
    pub path: String,
}

/// Stage environment handed to the runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupVmRequest {
    /// Stage runtime id
    pub id: String,
    /// Pool to take the machine from; empty for Docker runners
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pool_id: String,
    /// Machine OS
    pub os: OsType,
    /// Machine architecture
    pub arch: ArchType,
    /// Execution identity
    pub ids: ExecutionIds,
    /// Stage environment
    pub env: BTreeMap<String, String>,
    /// Secret variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretVariable>,
    /// Shared paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VmVolume>,
    /// Log, TI and STO endpoints
    pub services: PlatformServices,
    /// Connectors used anywhere in the stage
    pub connectors: Vec<String>,
    /// Services the runner starts before the first step
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub service_dependencies: Vec<ContainerDefinition>,
    /// Connector to pull platform images with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harness_image_connector_ref: Option<String>,
    /// Seconds before the machine is reclaimed
    pub ttl_secs: u64,
    /// Seconds to wait for the machine
    pub init_timeout_secs: u64,
}

/// Service started as a detached step on a hosted VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedStepRequest {
    /// Service identifier
    pub id: String,
    /// Container name
    pub name: String,
    /// Image
    pub image: String,
    /// Registry connector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_ref: Option<String>,
    /// Entrypoint and arguments as one shell command line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Environment
    pub env: BTreeMap<String, String>,
    /// Secret variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretVariable>,
    /// Host to container ports
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub port_bindings: BTreeMap<String, String>,
    /// Run privileged
    pub privileged: bool,
    /// Pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_policy: Option<ImagePullPolicy>,
    /// Keep running after the step returns
    pub detach: bool,
}

/// Initialize task of a VM pool stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmInitializeTaskParams {
    /// Setup request
    pub setup: SetupVmRequest,
}

/// Initialize task of a hosted VM stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DliteVmInitializeTaskParams {
    /// Setup request without services
    pub setup: SetupVmRequest,
    /// Services started as detached steps
    pub services: Vec<DetachedStepRequest>,
}

/// Initialize task of a local Docker stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerInitializeTaskParams {
    /// Setup request
    pub setup: SetupVmRequest,
}

/// Builds setup requests for VM pools, hosted VMs and runs-on labels
#[derive(Debug, Clone, Copy, Default)]
pub struct VmTaskBuilder;

impl BackendTaskBuilder for VmTaskBuilder {
    fn family(&self) -> InfraFamily {
        InfraFamily::Vm
    }

    fn build(
        &self,
        ctx: &BackendContext<'_>,
        expanded: &ExpandedStage,
    ) -> Result<BackendTask, StageExecutionError> {
        let pool_id = pool_id(ctx.infra)?;
        let runtime_id = stage_runtime_id(ctx);
        let mut setup = setup_request(ctx, expanded, pool_id.clone(), runtime_id.clone());
        tracing::info!(pool = %pool_id, stage_runtime_id = %runtime_id, "Built VM setup request");

        let params = if ctx.infra.is_hosted() {
            let services =
                detached_services(ctx.stage, std::mem::take(&mut setup.service_dependencies));
            TaskParams::DliteVm(DliteVmInitializeTaskParams { setup, services })
        } else {
            TaskParams::Vm(VmInitializeTaskParams { setup })
        };
        Ok(BackendTask {
            params,
            infra_details: StageInfraDetails::Vm {
                pool_id,
                stage_runtime_id: runtime_id.clone(),
            },
            cleanup: cleanup(InfraFamily::Vm, runtime_id, expanded),
        })
    }
}

/// Builds setup requests for local Docker runners
#[derive(Debug, Clone, Copy, Default)]
pub struct DockerTaskBuilder;

impl BackendTaskBuilder for DockerTaskBuilder {
    fn family(&self) -> InfraFamily {
        InfraFamily::Docker
    }

    fn build(
        &self,
        ctx: &BackendContext<'_>,
        expanded: &ExpandedStage,
    ) -> Result<BackendTask, StageExecutionError> {
        if !matches!(ctx.infra, Infrastructure::Docker(_)) {
            return Err(StageExecutionError::UnexpectedInfrastructure);
        }
        let runtime_id = stage_runtime_id(ctx);
        let setup = setup_request(ctx, expanded, String::new(), runtime_id.clone());
        tracing::info!(stage_runtime_id = %runtime_id, "Built Docker setup request");
        Ok(BackendTask {
            params: TaskParams::Docker(DockerInitializeTaskParams { setup }),
            infra_details: StageInfraDetails::Docker {
                stage_runtime_id: runtime_id.clone(),
            },
            cleanup: cleanup(InfraFamily::Docker, runtime_id, expanded),
        })
    }
}

fn pool_id(infra: &Infrastructure) -> Result<String, StageExecutionError> {
    match infra {
        Infrastructure::Vm(vm) => vm
            .pool_name
            .non_empty()
            .map(str::to_string)
            .ok_or_else(|| {
                StageExecutionError::configuration("Pool name can't be empty in VM infrastructure")
            }),
        Infrastructure::HostedVm(hosted) => {
            Ok(format!("{}-{}", hosted.platform.os, hosted.platform.arch))
        }
        Infrastructure::RunsOn(runs_on) => runs_on
            .label
            .non_empty()
            .map(str::to_string)
            .ok_or_else(|| StageExecutionError::configuration("Runner label can't be empty")),
        _ => Err(StageExecutionError::UnexpectedInfrastructure),
    }
}

/// Runtime id of an earlier attempt, else the id assigned to this run
fn stage_runtime_id(ctx: &BackendContext<'_>) -> String {
    match ctx.previous {
        Some(
            StageInfraDetails::Vm {
                stage_runtime_id, ..
            }
            | StageInfraDetails::Docker { stage_runtime_id },
        ) => stage_runtime_id.clone(),
        _ if !ctx.ids.stage_runtime_id.is_empty() => ctx.ids.stage_runtime_id.clone(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

fn setup_request(
    ctx: &BackendContext<'_>,
    expanded: &ExpandedStage,
    pool_id: String,
    runtime_id: String,
) -> SetupVmRequest {
    let (env, secrets) = ctx.stage_environment();
    let volumes = ctx
        .stage
        .shared_paths
        .iter()
        .enumerate()
        .map(|(index, path)| VmVolume {
            name: shared_volume_name(index),
            path: path.clone(),
        })
        .collect();
    let harness_image_connector_ref = match ctx.infra {
        Infrastructure::Vm(vm) => vm.harness_image_connector_ref.clone(),
        _ => None,
    }
    .or_else(|| ctx.config.harness_image_connector.clone());

    SetupVmRequest {
        id: runtime_id,
        pool_id,
        os: ctx.infra.os(),
        arch: ctx.infra.arch(),
        ids: ctx.ids.clone(),
        env,
        secrets,
        volumes,
        services: ctx.platform_services(),
        connectors: stage_connector_refs(ctx.stage, ctx.codebase)
            .into_iter()
            .collect(),
        service_dependencies: expanded.services.clone(),
        harness_image_connector_ref,
        ttl_secs: ctx.ttl.as_secs(),
        init_timeout_secs: init_timeout(ctx.infra, &ctx.config.timeouts).as_secs(),
    }
}

fn detached_services(
    stage: &IntegrationStage,
    services: Vec<ContainerDefinition>,
) -> Vec<DetachedStepRequest> {
    services
        .into_iter()
        .map(|mut container| {
            let words: Vec<String> = stage
                .service_dependencies
                .iter()
                .find(|service| service.identifier == container.step_identifier)
                .map(command_words)
                .unwrap_or_default();
            container.env.remove(SERVICE_ENTRYPOINT_ENV);
            container.env.remove(SERVICE_ARGS_ENV);
            DetachedStepRequest {
                id: container.step_identifier,
                name: container.name,
                image: container.image.reference(),
                connector_ref: container.image.connector_ref,
                command: (!words.is_empty()).then(|| shell_words::join(&words)),
                env: container.env,
                secrets: container.secrets,
                port_bindings: container.port_bindings,
                privileged: container.privileged,
                pull_policy: container.image_pull_policy,
                detach: true,
            }
        })
        .collect()
}

fn command_words(service: &ServiceDependency) -> Vec<String> {
    let part = |value: Option<&Vec<String>>| value.cloned().unwrap_or_default();
    let mut words = part(service.spec.entrypoint.literal());
    words.extend(part(service.spec.args.literal()));
    words
}

fn cleanup(
    family: InfraFamily,
    runtime_id: String,
    expanded: &ExpandedStage,
) -> StageCleanupDetails {
    StageCleanupDetails {
        infra_family: family,
        runtime_name: runtime_id,
        namespace: None,
        container_names: expanded.services.iter().map(|s| s.name.clone()).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::Fixture;
    use crate::pipeline::Resolved;
    use crate::pipeline::infra::{DockerInfra, HostedVmInfra, Platform, RunsOnInfra, VmInfra};
    use pretty_assertions::assert_eq;

    fn pool(name: &str) -> Infrastructure {
        Infrastructure::Vm(VmInfra {
            pool_name: Resolved::Literal(name.to_string()),
            ..VmInfra::default()
        })
    }

    #[test]
    fn test_vm_pool_setup() {
        let mut fixture = Fixture::new(pool("linux-pool"));
        fixture.stage.shared_paths = vec!["/cache".to_string()];
        let task = fixture.build(None).unwrap();

        let TaskParams::Vm(params) = &task.params else {
            unreachable!()
        };
        let setup = &params.setup;
        assert_eq!(setup.pool_id, "linux-pool");
        assert_eq!(setup.id, "rt-1");
        assert_eq!(setup.env["DRONE_BUILD_NUMBER"], "12");
        assert_eq!(setup.connectors, vec!["account.docker"]);
        assert_eq!(
            setup.volumes,
            vec![VmVolume {
                name: "shared-0".to_string(),
                path: "/cache".to_string(),
            }]
        );
        assert_eq!(setup.service_dependencies.len(), 1);
        assert_eq!(setup.ttl_secs, 3600);
        assert_eq!(
            task.infra_details,
            StageInfraDetails::Vm {
                pool_id: "linux-pool".to_string(),
                stage_runtime_id: "rt-1".to_string(),
            }
        );
        assert_eq!(task.cleanup.container_names, vec!["service-0"]);
    }

    #[test]
    fn test_missing_pool_rejected() {
        let fixture = Fixture::new(pool(""));
        assert_eq!(
            fixture.build(None).unwrap_err().to_string(),
            "Pool name can't be empty in VM infrastructure"
        );
    }

    #[test]
    fn test_runs_on_label_is_pool() {
        let fixture = Fixture::new(Infrastructure::RunsOn(RunsOnInfra {
            label: Resolved::Literal("gpu".to_string()),
            ..RunsOnInfra::default()
        }));
        let task = fixture.build(None).unwrap();
        assert!(matches!(
            task.infra_details,
            StageInfraDetails::Vm { ref pool_id, .. } if pool_id == "gpu"
        ));
    }

    #[test]
    fn test_hosted_vm_detaches_services() {
        let mut fixture = Fixture::new(Infrastructure::HostedVm(HostedVmInfra {
            platform: Platform {
                os: OsType::Linux,
                arch: ArchType::Arm64,
            },
            init_timeout: None,
        }));
        let service = &mut fixture.stage.service_dependencies[0];
        service.spec.entrypoint = Resolved::Literal(vec!["postgres".to_string()]);
        service.spec.args = Resolved::Literal(vec!["-c".to_string(), "max connections".to_string()]);
        let task = fixture.build(None).unwrap();

        let TaskParams::DliteVm(params) = &task.params else {
            unreachable!()
        };
        assert_eq!(params.setup.pool_id, "linux-arm64");
        assert!(params.setup.service_dependencies.is_empty());

        let db = &params.services[0];
        assert_eq!(db.id, "db");
        assert_eq!(db.image, "postgres:15");
        assert_eq!(db.command.as_deref(), Some("postgres -c 'max connections'"));
        assert!(db.detach);
        assert!(!db.env.contains_key(SERVICE_ENTRYPOINT_ENV));
    }

    #[test]
    fn test_runtime_id_reused() {
        let fixture = Fixture::new(Infrastructure::Docker(DockerInfra::default()));
        let previous = StageInfraDetails::Docker {
            stage_runtime_id: "rt-0".to_string(),
        };
        let task = fixture.build(Some(&previous)).unwrap();

        let TaskParams::Docker(params) = &task.params else {
            unreachable!()
        };
        assert_eq!(params.setup.id, "rt-0");
        assert!(params.setup.pool_id.is_empty());
        assert_eq!(task.cleanup.infra_family, InfraFamily::Docker);
        assert_eq!(task.cleanup.runtime_name, "rt-0");
    }
}
