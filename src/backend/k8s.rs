//! Build pod
//!
//! The pod holds a setup-addon init container that copies the addon binary
//! into a shared volume, the lite engine, and one container per step and
//! service. Step containers idle on the addon until the lite engine hands
//! them work.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{BackendContext, BackendTask, BackendTaskBuilder, TaskParams, shared_volume_name};
use crate::infrastructure::services::ConnectorDetails;
use crate::infrastructure::sweeping::{StageCleanupDetails, StageInfraDetails};
use crate::pipeline::infra::{
    InfraFamily, Infrastructure, K8sDirectInfra, SecurityContext, Toleration, VolumeSource,
};
use crate::pipeline::{OsType, StageExecutionError};
use crate::planner::connectors::ConnectorBinding;
use crate::planner::container::{ContainerDefinition, ContainerResourceParams};
use crate::planner::expander::ExpandedStage;
use crate::planner::image::fully_qualified_image;
use crate::planner::plugin_settings::STEP_MOUNT_PATH;
use crate::planner::resources::ResourceRequest;
use crate::planner::stage_utils::{init_timeout, k8s_os, sanitize_label};

/// Name of the lite engine container
pub const LITE_ENGINE_CONTAINER: &str = "lite-engine";
/// Name of the init container installing the addon
pub const SETUP_ADDON_CONTAINER: &str = "setup-addon";

const WORKSPACE_VOLUME: &str = "harness";
const ADDON_VOLUME: &str = "addon";
const ADDON_MOUNT_PATH: &str = "/addon";
const HOSTED_NAMESPACE: &str = "default";

const STAGE_ID_LEN: usize = 15;
const POD_SUFFIX_LEN: usize = 8;

const LITE_ENGINE_CPU: u32 = 100;
const LITE_ENGINE_MEMORY: u32 = 100;
const SETUP_ADDON_CPU: u32 = 100;
const SETUP_ADDON_MEMORY: u32 = 100;

/// Pod volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    /// Volume name
    pub name: String,
    /// Backing storage
    #[serde(flatten)]
    pub source: VolumeSource,
}

/// Mount shared by every container of the pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume mounted
    pub name: String,
    /// Path inside the containers
    pub mount_path: String,
}

/// Container the platform adds to every pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemContainer {
    /// Container name
    pub name: String,
    /// Fully qualified image
    pub image: String,
    /// Command line
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<String>,
    /// Environment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Exposed ports
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,
    /// Requests and limits
    pub resources: ContainerResourceParams,
}

/// Pod the stage runs in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    /// Pod name
    pub name: String,
    /// Namespace
    pub namespace: String,
    /// Infra labels plus the execution identity
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Tolerations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Service account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Mount the service account token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,
    /// Priority class
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    /// Copies the addon binary into the shared volume
    pub init_container: SystemContainer,
    /// Runs the steps
    pub lite_engine: SystemContainer,
    /// Step and service containers
    pub containers: Vec<ContainerDefinition>,
    /// Pod volumes
    pub volumes: Vec<Volume>,
    /// Mounts common to every container
    pub volume_mounts: Vec<VolumeMount>,
    /// Seconds before Kubernetes kills the pod
    pub active_deadline_seconds: u64,
}

impl PodSpec {
    /// Names of every container in the pod, lite engine first
    #[must_use]
    pub fn container_names(&self) -> Vec<String> {
        std::iter::once(self.lite_engine.name.clone())
            .chain(self.containers.iter().map(|c| c.name.clone()))
            .collect()
    }
}

/// Initialize task of a Kubernetes stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sInitializeTaskParams {
    /// Cluster connector; absent for hosted clusters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_ref: Option<String>,
    /// Node OS
    pub os: OsType,
    /// Build pod
    pub pod: PodSpec,
    /// Connector secrets per container
    pub connector_bindings: BTreeMap<String, Vec<ConnectorBinding>>,
    /// Peak requirement of the stage
    pub stage_resources: ResourceRequest,
    /// Seconds to wait for the pod
    pub init_timeout_secs: u64,
}

/// Builds the pod of Kubernetes stages
#[derive(Debug, Clone, Copy, Default)]
pub struct K8sTaskBuilder;

impl BackendTaskBuilder for K8sTaskBuilder {
    fn family(&self) -> InfraFamily {
        InfraFamily::Kubernetes
    }

    fn build(
        &self,
        ctx: &BackendContext<'_>,
        expanded: &ExpandedStage,
    ) -> Result<BackendTask, StageExecutionError> {
        let os = k8s_os(Some(ctx.infra))?;
        let direct = match ctx.infra {
            Infrastructure::KubernetesDirect(k8s) => Some(k8s),
            Infrastructure::KubernetesHosted(_) => None,
            _ => return Err(StageExecutionError::UnexpectedInfrastructure),
        };
        let namespace = match direct {
            Some(k8s) => k8s
                .namespace
                .non_empty()
                .ok_or_else(|| {
                    StageExecutionError::configuration("Namespace can't be empty in k8s infrastructure")
                })?
                .to_string(),
            None => HOSTED_NAMESPACE.to_string(),
        };
        let pod_name = pod_name(ctx);

        let mut containers: Vec<ContainerDefinition> = expanded.containers().cloned().collect();
        qualify_images(ctx, &mut containers)?;
        if let Some(k8s) = direct {
            apply_security(k8s, &mut containers);
        }

        let (volumes, volume_mounts) = volumes(ctx, direct);
        let pod = PodSpec {
            name: pod_name.clone(),
            namespace: namespace.clone(),
            labels: labels(ctx, direct),
            annotations: direct.map(|k| k.annotations.clone()).unwrap_or_default(),
            node_selector: direct.map(|k| k.node_selector.clone()).unwrap_or_default(),
            tolerations: direct.map(|k| k.tolerations.clone()).unwrap_or_default(),
            service_account_name: direct.and_then(|k| k.service_account_name.clone()),
            automount_service_account_token: direct
                .and_then(|k| k.automount_service_account_token),
            priority_class_name: direct.and_then(|k| k.priority_class_name.clone()),
            init_container: setup_addon_container(ctx, os),
            lite_engine: lite_engine_container(ctx, expanded.allocation.stage),
            containers,
            volumes,
            volume_mounts,
            active_deadline_seconds: ctx.ttl.as_secs(),
        };
        let container_names = pod.container_names();
        tracing::info!(
            pod = %pod.name,
            namespace = %pod.namespace,
            containers = container_names.len(),
            "Built stage pod"
        );

        let params = K8sInitializeTaskParams {
            connector_ref: direct.and_then(|k| k.connector_ref.non_empty().map(str::to_string)),
            os,
            pod,
            connector_bindings: expanded.connector_bindings.clone(),
            stage_resources: expanded.allocation.stage,
            init_timeout_secs: init_timeout(ctx.infra, &ctx.config.timeouts).as_secs(),
        };
        Ok(BackendTask {
            params: TaskParams::Kubernetes(params),
            infra_details: StageInfraDetails::Kubernetes {
                pod_name: pod_name.clone(),
                namespace: namespace.clone(),
                container_names: container_names.clone(),
            },
            cleanup: StageCleanupDetails {
                infra_family: InfraFamily::Kubernetes,
                runtime_name: pod_name,
                namespace: Some(namespace),
                container_names,
            },
        })
    }
}

/// `<prefix>-<stage>-<suffix>`, or the pod of an earlier attempt
fn pod_name(ctx: &BackendContext<'_>) -> String {
    if let Some(StageInfraDetails::Kubernetes { pod_name, .. }) = ctx.previous {
        tracing::debug!(pod = %pod_name, "Reusing pod name of earlier attempt");
        return pod_name.clone();
    }
    let stage: String = ctx
        .stage
        .identifier
        .to_ascii_lowercase()
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .take(STAGE_ID_LEN)
        .collect();
    let suffix: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(POD_SUFFIX_LEN)
        .collect();
    let prefix = &ctx.config.pod_name_prefix;
    if stage.is_empty() {
        format!("{prefix}-{suffix}")
    } else {
        format!("{prefix}-{stage}-{suffix}")
    }
}

fn labels(ctx: &BackendContext<'_>, direct: Option<&K8sDirectInfra>) -> BTreeMap<String, String> {
    let mut labels = direct.map(|k| k.labels.clone()).unwrap_or_default();
    let ids = ctx.ids;
    let platform = [
        ("accountID", ids.account_id.as_str()),
        ("orgID", ids.org_id.as_str()),
        ("projectID", ids.project_id.as_str()),
        ("pipelineID", ids.pipeline_id.as_str()),
        ("pipelineExecutionID", ids.execution_id.as_str()),
        ("stageID", ctx.stage.identifier.as_str()),
        ("buildNumber", ids.run_sequence.as_str()),
    ];
    for (key, value) in platform {
        let value = sanitize_label(value);
        if !value.is_empty() {
            labels.insert(key.to_string(), value);
        }
    }
    labels
}

fn volumes(
    ctx: &BackendContext<'_>,
    direct: Option<&K8sDirectInfra>,
) -> (Vec<Volume>, Vec<VolumeMount>) {
    let empty_dir = || VolumeSource::EmptyDir {
        medium: None,
        size: None,
    };
    let mut pairs = vec![
        (WORKSPACE_VOLUME.to_string(), STEP_MOUNT_PATH.to_string(), empty_dir()),
        (ADDON_VOLUME.to_string(), ADDON_MOUNT_PATH.to_string(), empty_dir()),
    ];
    for (index, path) in ctx.stage.shared_paths.iter().enumerate() {
        pairs.push((shared_volume_name(index), path.clone(), empty_dir()));
    }
    if let Some(k8s) = direct {
        for (index, volume) in k8s.volumes.iter().enumerate() {
            pairs.push((
                format!("volume-{index}"),
                volume.mount_path.clone(),
                volume.source.clone(),
            ));
        }
    }

    pairs
        .into_iter()
        .map(|(name, mount_path, source)| {
            (
                Volume {
                    name: name.clone(),
                    source,
                },
                VolumeMount { name, mount_path },
            )
        })
        .unzip()
}

/// Prefixes images pulled through Docker registry connectors with the
/// registry host
fn qualify_images(
    ctx: &BackendContext<'_>,
    containers: &mut [ContainerDefinition],
) -> Result<(), StageExecutionError> {
    let mut resolved: BTreeMap<String, ConnectorDetails> = BTreeMap::new();
    for container in containers {
        let Some(connector_ref) = container.image.connector_ref.clone() else {
            continue;
        };
        if !resolved.contains_key(&connector_ref) {
            let details = ctx.connectors.resolve(&connector_ref)?;
            resolved.insert(connector_ref.clone(), details);
        }
        container.image.name =
            fully_qualified_image(&container.image.name, &resolved[&connector_ref])?;
    }
    Ok(())
}

/// Infra-level security context and user for containers without their own
fn apply_security(k8s: &K8sDirectInfra, containers: &mut [ContainerDefinition]) {
    let run_as_user = k8s.run_as_user.literal().copied();
    for container in containers {
        if container.security_context.is_none() {
            container
                .security_context
                .clone_from(&k8s.container_security_context);
        }
        if container.run_as_user.is_none() {
            container.run_as_user = run_as_user;
        }
        if let Some(SecurityContext {
            privileged: Some(true),
            ..
        }) = container.security_context
        {
            container.privileged = true;
        }
    }
}

fn setup_addon_container(ctx: &BackendContext<'_>, os: OsType) -> SystemContainer {
    let commands = if os.is_windows() {
        vec![
            "pwsh".to_string(),
            "-Command".to_string(),
            "mkdir /addon/bin; cp C:/addon.exe /addon/bin/ci-addon.exe".to_string(),
        ]
    } else {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            "mkdir -p /addon/bin /addon/tmp && chmod -R 776 /addon/tmp && cp /usr/local/bin/ci-addon /addon/bin/ci-addon"
                .to_string(),
        ]
    };
    SystemContainer {
        name: SETUP_ADDON_CONTAINER.to_string(),
        image: ctx.config.images.addon.clone(),
        commands,
        env: BTreeMap::new(),
        ports: Vec::new(),
        resources: ContainerResourceParams::guaranteed(ResourceRequest {
            cpu: SETUP_ADDON_CPU,
            memory: SETUP_ADDON_MEMORY,
        }),
    }
}

/// The lite engine reserves the stage peak on top of its own needs, since
/// step containers only request a token amount.
fn lite_engine_container(ctx: &BackendContext<'_>, stage: ResourceRequest) -> SystemContainer {
    let ids = ctx.ids;
    let services = ctx.platform_services();
    let env = [
        ("HARNESS_ACCOUNT_ID", ids.account_id.clone()),
        ("HARNESS_ORG_ID", ids.org_id.clone()),
        ("HARNESS_PROJECT_ID", ids.project_id.clone()),
        ("HARNESS_PIPELINE_ID", ids.pipeline_id.clone()),
        ("HARNESS_EXECUTION_ID", ids.execution_id.clone()),
        ("HARNESS_STAGE_ID", ctx.stage.identifier.clone()),
        ("HARNESS_BUILD_ID", ids.run_sequence.clone()),
        ("HARNESS_WORKSPACE", STEP_MOUNT_PATH.to_string()),
        ("HARNESS_LOG_SERVICE_ENDPOINT", services.log.url),
        ("HARNESS_LOG_SERVICE_TOKEN", services.log.token),
        ("HARNESS_TI_SERVICE_ENDPOINT", services.ti.url),
        ("HARNESS_TI_SERVICE_TOKEN", services.ti.token),
        ("HARNESS_STO_SERVICE_ENDPOINT", services.sto.url),
        ("HARNESS_STO_SERVICE_TOKEN", services.sto.token),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();

    SystemContainer {
        name: LITE_ENGINE_CONTAINER.to_string(),
        image: ctx.config.images.lite_engine.clone(),
        commands: Vec::new(),
        env,
        ports: vec![ctx.config.ports.lite_engine],
        resources: ContainerResourceParams::guaranteed(ResourceRequest {
            cpu: stage.cpu + LITE_ENGINE_CPU,
            memory: stage.memory + LITE_ENGINE_MEMORY,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::tests::Fixture;
    use crate::pipeline::Resolved;
    use crate::pipeline::infra::{K8sHostedInfra, PodVolume};
    use pretty_assertions::assert_eq;

    fn direct() -> K8sDirectInfra {
        K8sDirectInfra {
            connector_ref: Resolved::Literal("account.cluster".to_string()),
            namespace: Resolved::Literal("builds".to_string()),
            ..K8sDirectInfra::default()
        }
    }

    fn pod(task: &BackendTask) -> &PodSpec {
        let TaskParams::Kubernetes(params) = &task.params else {
            unreachable!()
        };
        &params.pod
    }

    #[test]
    fn test_pod_layout() {
        let fixture = Fixture::new(Infrastructure::KubernetesDirect(direct()));
        let task = fixture.build(None).unwrap();
        let pod = pod(&task);

        assert!(pod.name.starts_with("harnessci-buildandtesteve-"));
        assert_eq!(pod.name.len(), "harnessci-buildandtesteve-".len() + 8);
        assert_eq!(pod.namespace, "builds");
        assert_eq!(pod.active_deadline_seconds, 3600);
        assert_eq!(
            pod.container_names(),
            vec!["lite-engine", "step-1", "service-0"]
        );
        assert_eq!(pod.lite_engine.ports, vec![20001]);
        assert_eq!(pod.lite_engine.env["HARNESS_LOG_SERVICE_TOKEN"], "log-token");
        assert_eq!(pod.labels["stageID"], "Build_And_Test_Everything");
        assert_eq!(pod.labels["buildNumber"], "12");

        let mounts: Vec<&str> = pod.volume_mounts.iter().map(|m| m.mount_path.as_str()).collect();
        assert_eq!(mounts, vec!["/harness", "/addon"]);
    }

    #[test]
    fn test_service_image_qualified_with_registry() {
        let fixture = Fixture::new(Infrastructure::KubernetesDirect(direct()));
        let task = fixture.build(None).unwrap();
        let service = &pod(&task).containers[1];
        assert_eq!(service.name, "service-0");
        assert_eq!(service.image.name, "registry.acme.io/postgres");
        assert_eq!(service.image.tag, "15");
    }

    #[test]
    fn test_lite_engine_reserves_stage_peak() {
        let fixture = Fixture::new(Infrastructure::KubernetesDirect(direct()));
        let task = fixture.build(None).unwrap();
        let TaskParams::Kubernetes(params) = &task.params else {
            unreachable!()
        };
        let resources = params.pod.lite_engine.resources;
        assert_eq!(resources.limit_milli_cpu, params.stage_resources.cpu + 100);
        assert_eq!(resources.limit_memory_mib, params.stage_resources.memory + 100);
    }

    #[test]
    fn test_pod_name_reused() {
        let fixture = Fixture::new(Infrastructure::KubernetesDirect(direct()));
        let previous = StageInfraDetails::Kubernetes {
            pod_name: "harnessci-build-abcd1234".to_string(),
            namespace: "builds".to_string(),
            container_names: Vec::new(),
        };
        let task = fixture.build(Some(&previous)).unwrap();
        assert_eq!(pod(&task).name, "harnessci-build-abcd1234");
        assert_eq!(task.cleanup.runtime_name, "harnessci-build-abcd1234");
        assert_eq!(task.cleanup.namespace.as_deref(), Some("builds"));
    }

    #[test]
    fn test_security_context_and_volumes() {
        let mut fixture = Fixture::new(Infrastructure::KubernetesDirect(K8sDirectInfra {
            run_as_user: Resolved::Literal(1000),
            container_security_context: Some(SecurityContext {
                privileged: Some(true),
                ..SecurityContext::default()
            }),
            volumes: vec![PodVolume {
                mount_path: "/cache".to_string(),
                source: VolumeSource::PersistentVolumeClaim {
                    claim_name: "ci-cache".to_string(),
                    read_only: false,
                },
            }],
            ..direct()
        }));
        fixture.stage.shared_paths = vec!["/shared".to_string()];
        let task = fixture.build(None).unwrap();
        let pod = pod(&task);

        for container in &pod.containers {
            assert_eq!(container.run_as_user, Some(1000));
            assert!(container.privileged);
        }
        let names: Vec<&str> = pod.volumes.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["harness", "addon", "shared-0", "volume-0"]);
    }

    #[test]
    fn test_empty_namespace_rejected() {
        let fixture = Fixture::new(Infrastructure::KubernetesDirect(K8sDirectInfra {
            namespace: Resolved::Literal(" ".to_string()),
            ..direct()
        }));
        assert_eq!(
            fixture.build(None).unwrap_err().to_string(),
            "Namespace can't be empty in k8s infrastructure"
        );
    }

    #[test]
    fn test_hosted_cluster() {
        let fixture = Fixture::new(Infrastructure::KubernetesHosted(K8sHostedInfra::default()));
        let task = fixture.build(None).unwrap();
        let TaskParams::Kubernetes(params) = &task.params else {
            unreachable!()
        };
        assert_eq!(params.connector_ref, None);
        assert_eq!(params.pod.namespace, "default");
        assert!(matches!(task.infra_details, StageInfraDetails::Kubernetes { .. }));
    }
}
