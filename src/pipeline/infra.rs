//! Build infrastructure of a stage

#![allow(clippy::must_use_candidate)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::resolved::Resolved;
use super::types::{ArchType, OsType};

/// Where the stage runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec")]
pub enum Infrastructure {
    /// User-managed Kubernetes cluster
    KubernetesDirect(K8sDirectInfra),
    /// Platform-managed Kubernetes cluster
    KubernetesHosted(K8sHostedInfra),
    /// User VM pool
    #[serde(rename = "VM")]
    Vm(VmInfra),
    /// Platform-managed VM
    #[serde(alias = "Cloud")]
    HostedVm(HostedVmInfra),
    /// Local Docker daemon
    Docker(DockerInfra),
    /// VM pool selected by label
    RunsOn(RunsOnInfra),
}

/// Backend family handling an infrastructure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InfraFamily {
    /// Pod based
    Kubernetes,
    /// VM setup request based
    Vm,
    /// Docker daemon based
    Docker,
}

impl Infrastructure {
    /// Infra type name as written in YAML
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::KubernetesDirect(_) => "KubernetesDirect",
            Self::KubernetesHosted(_) => "KubernetesHosted",
            Self::Vm(_) => "VM",
            Self::HostedVm(_) => "HostedVm",
            Self::Docker(_) => "Docker",
            Self::RunsOn(_) => "RunsOn",
        }
    }

    /// Backend family
    pub fn family(&self) -> InfraFamily {
        match self {
            Self::KubernetesDirect(_) | Self::KubernetesHosted(_) => InfraFamily::Kubernetes,
            Self::Vm(_) | Self::HostedVm(_) | Self::RunsOn(_) => InfraFamily::Vm,
            Self::Docker(_) => InfraFamily::Docker,
        }
    }

    /// Managed by the platform rather than the user
    pub fn is_hosted(&self) -> bool {
        matches!(self, Self::KubernetesHosted(_) | Self::HostedVm(_))
    }

    /// Operating system; Linux unless declared
    pub fn os(&self) -> OsType {
        match self {
            Self::KubernetesDirect(k8s) => k8s.os.unwrap_or_default(),
            Self::Vm(vm) => vm.os.unwrap_or_default(),
            Self::HostedVm(HostedVmInfra { platform, .. })
            | Self::Docker(DockerInfra { platform, .. }) => platform.os,
            Self::RunsOn(runs_on) => runs_on.os.unwrap_or_default(),
            Self::KubernetesHosted(_) => OsType::Linux,
        }
    }

    /// Architecture; amd64 unless declared
    pub fn arch(&self) -> ArchType {
        match self {
            Self::Vm(vm) => vm.arch.unwrap_or_default(),
            Self::HostedVm(HostedVmInfra { platform, .. })
            | Self::Docker(DockerInfra { platform, .. }) => platform.arch,
            Self::RunsOn(runs_on) => runs_on.arch.unwrap_or_default(),
            Self::KubernetesDirect(_) | Self::KubernetesHosted(_) => ArchType::Amd64,
        }
    }

    /// Explicit init timeout string, if any
    pub fn init_timeout(&self) -> Option<&str> {
        match self {
            Self::KubernetesDirect(k8s) => k8s.init_timeout.as_deref(),
            Self::KubernetesHosted(hosted) => hosted.init_timeout.as_deref(),
            Self::Vm(vm) => vm.init_timeout.as_deref(),
            Self::HostedVm(hosted) => hosted.init_timeout.as_deref(),
            Self::Docker(docker) => docker.init_timeout.as_deref(),
            Self::RunsOn(runs_on) => runs_on.init_timeout.as_deref(),
        }
    }
}

impl fmt::Display for Infrastructure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

/// OS and architecture of hosted machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Platform {
    /// Operating system
    pub os: OsType,
    /// Architecture
    pub arch: ArchType,
}

/// User-managed Kubernetes cluster
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct K8sDirectInfra {
    /// Cluster connector
    pub connector_ref: Resolved<String>,
    /// Namespace for build pods
    pub namespace: Resolved<String>,
    /// Node OS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsType>,
    /// Extra pod volumes
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<PodVolume>,
    /// Pod tolerations
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    /// Node selector
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    /// Extra pod labels
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Pod annotations
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Pod-level user id
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub run_as_user: Resolved<i64>,
    /// Priority class
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority_class_name: Option<String>,
    /// Service account
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    /// Mount the service account token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,
    /// Security context applied to every container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_security_context: Option<SecurityContext>,
    /// Pod start timeout (`10m`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_timeout: Option<String>,
    /// Connector used to pull platform images
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harness_image_connector_ref: Option<String>,
}

/// Platform-managed Kubernetes cluster
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct K8sHostedInfra {
    /// Cluster identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    /// Pod start timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_timeout: Option<String>,
}

/// User VM pool
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VmInfra {
    /// Pool name
    #[serde(alias = "poolId")]
    pub pool_name: Resolved<String>,
    /// VM OS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsType>,
    /// VM architecture
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<ArchType>,
    /// Connector used to pull platform images
    #[serde(skip_serializing_if = "Option::is_none")]
    pub harness_image_connector_ref: Option<String>,
    /// VM setup timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_timeout: Option<String>,
}

/// Platform-managed VM
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HostedVmInfra {
    /// Machine platform
    pub platform: Platform,
    /// VM setup timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_timeout: Option<String>,
}

/// Local Docker daemon
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DockerInfra {
    /// Machine platform
    pub platform: Platform,
    /// Setup timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_timeout: Option<String>,
}

/// VM pool chosen by runner label
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunsOnInfra {
    /// Runner label
    pub label: Resolved<String>,
    /// VM OS
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<OsType>,
    /// VM architecture
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<ArchType>,
    /// Setup timeout
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_timeout: Option<String>,
}

/// Volume mounted into every build container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodVolume {
    /// Mount path inside containers
    pub mount_path: String,
    /// Volume source
    #[serde(flatten)]
    pub source: VolumeSource,
}

/// Source of a pod volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec")]
pub enum VolumeSource {
    /// Scratch space
    EmptyDir {
        /// Storage medium (`Memory`)
        #[serde(default, skip_serializing_if = "Option::is_none")]
        medium: Option<String>,
        /// Size limit
        #[serde(default, skip_serializing_if = "Option::is_none")]
        size: Option<String>,
    },
    /// Node directory
    HostPath {
        /// Path on the node
        path: String,
        /// Host path type
        #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
        host_path_type: Option<String>,
    },
    /// Existing claim
    #[serde(rename_all = "camelCase")]
    PersistentVolumeClaim {
        /// Claim name
        claim_name: String,
        /// Mount read only
        #[serde(default)]
        read_only: bool,
    },
}

/// Pod toleration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Toleration {
    /// Taint key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    /// `Equal` or `Exists`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    /// Taint value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Taint effect
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<String>,
    /// Seconds the pod tolerates the taint
    #[serde(skip_serializing_if = "Option::is_none")]
    pub toleration_seconds: Option<i64>,
}

/// Container security context
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityContext {
    /// Privileged container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub privileged: Option<bool>,
    /// Allow privilege escalation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allow_privilege_escalation: Option<bool>,
    /// Read-only root filesystem
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_only_root_filesystem: Option<bool>,
    /// Refuse to run as root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as_non_root: Option<bool>,
    /// User id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    /// Capabilities added
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub add_capabilities: Vec<String>,
    /// Capabilities dropped
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub drop_capabilities: Vec<String>,
}
