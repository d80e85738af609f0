//! Backend-agnostic container definitions
//!
//! A [`ContainerDefinition`] is produced once per step or service during
//! expansion and consumed by the backend builders.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::image::ImageDetails;
use super::resources::{ResourceRequest, StepAllocation};
use crate::pipeline::infra::SecurityContext;
use crate::pipeline::{ImagePullPolicy, OsType};

/// Full-value secret reference: `<+secrets.getValue("account.token")>`
static SECRET_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^<\+secrets\.getValue\(\s*["']([^"']+)["']\s*\)>$"#).expect("valid regex")
});

/// Any secret lookup embedded in a larger value
static SECRET_EXPRESSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<\+secrets\.getValue\(").expect("valid regex"));

const LINUX_ADDON_BINARY: &str = "/addon/bin/ci-addon";
const WINDOWS_ADDON_BINARY: &str = r"C:\addon\bin\ci-addon.exe";

/// Role of a container in the pod or VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContainerType {
    /// Run step
    Run,
    /// Plugin or plugin-compatible step
    Plugin,
    /// Service dependency
    Service,
    /// Background step
    Background,
    /// RunTests step
    TestIntelligence,
}

/// Request and limit in milli-cores and MiB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerResourceParams {
    /// CPU request
    pub request_milli_cpu: u32,
    /// Memory request
    pub request_memory_mib: u32,
    /// CPU limit
    pub limit_milli_cpu: u32,
    /// Memory limit
    pub limit_memory_mib: u32,
}

impl ContainerResourceParams {
    /// Request equal to the limit
    #[must_use]
    pub fn guaranteed(limit: ResourceRequest) -> Self {
        Self {
            request_milli_cpu: limit.cpu,
            request_memory_mib: limit.memory,
            limit_milli_cpu: limit.cpu,
            limit_memory_mib: limit.memory,
        }
    }
}

impl From<StepAllocation> for ContainerResourceParams {
    fn from(allocation: StepAllocation) -> Self {
        Self {
            request_milli_cpu: allocation.request.cpu,
            request_memory_mib: allocation.request.memory,
            limit_milli_cpu: allocation.limit.cpu,
            limit_memory_mib: allocation.limit.memory,
        }
    }
}

/// Where the value of a secret env var comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum SecretSource {
    /// Secret manager identifier
    Reference(String),
    /// Value mixing secret lookups with other text, rendered at runtime
    Expression(String),
}

/// Env var delivered through the secret channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretVariable {
    /// Env var name
    pub name: String,
    /// Value source
    pub source: SecretSource,
}

impl SecretVariable {
    /// Secret identified by `secret_id`
    pub fn reference(name: impl Into<String>, secret_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: SecretSource::Reference(secret_id.into()),
        }
    }
}

/// Classifies an env value; `None` for plain values
#[must_use]
pub fn secret_source(value: &str) -> Option<SecretSource> {
    if let Some(captures) = SECRET_REFERENCE.captures(value) {
        return Some(SecretSource::Reference(captures[1].to_string()));
    }
    SECRET_EXPRESSION
        .is_match(value)
        .then(|| SecretSource::Expression(value.to_string()))
}

/// Moves secret-valued entries of `env` into a secret list.
#[must_use]
pub fn split_env(env: BTreeMap<String, String>) -> (BTreeMap<String, String>, Vec<SecretVariable>) {
    let mut plain = BTreeMap::new();
    let mut secrets = Vec::new();
    for (name, value) in env {
        match secret_source(&value) {
            Some(source) => secrets.push(SecretVariable { name, source }),
            None => {
                plain.insert(name, value);
            }
        }
    }
    (plain, secrets)
}

/// Name of the n-th step container, counting from 1
#[must_use]
pub fn step_container_name(index: usize) -> String {
    format!("step-{index}")
}

/// Name of the n-th service container, counting from 0
#[must_use]
pub fn service_container_name(index: usize) -> String {
    format!("service-{index}")
}

/// Entrypoint of every step and service container
#[must_use]
pub fn addon_command(os: OsType) -> Vec<String> {
    let binary = if os.is_windows() {
        WINDOWS_ADDON_BINARY
    } else {
        LINUX_ADDON_BINARY
    };
    vec![binary.to_string()]
}

/// Arguments telling the addon which port to serve on
#[must_use]
pub fn addon_args(port: u16) -> Vec<String> {
    vec!["--port".to_string(), port.to_string()]
}

/// An expanded container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDefinition {
    /// Container name within the pod
    pub name: String,
    /// Role
    pub container_type: ContainerType,
    /// Stage-unique identifier of the step or service
    pub step_identifier: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_name: Option<String>,
    /// Image and pulling connector
    pub image: ImageDetails,
    /// Entrypoint
    pub commands: Vec<String>,
    /// Arguments
    pub args: Vec<String>,
    /// Plain environment
    pub env: BTreeMap<String, String>,
    /// Secret environment
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub secrets: Vec<SecretVariable>,
    /// Request and limit
    pub resources: ContainerResourceParams,
    /// Ports the container listens on
    pub ports: Vec<u16>,
    /// Run privileged
    #[serde(default)]
    pub privileged: bool,
    /// User id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_as_user: Option<i64>,
    /// Pull policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<ImagePullPolicy>,
    /// Security context grafted by the backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<SecurityContext>,
    /// Host to container port mapping (VM and Docker only)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub port_bindings: BTreeMap<String, String>,
}
