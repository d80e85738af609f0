//! Stage-level helpers shared by the expander and the backends

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;

use super::image::{ImageDetails, image_info};
use crate::infrastructure::config::TimeoutConfig;
use crate::infrastructure::services::{ConnectionType, ConnectorDetails, Edition, LicenseService};
use crate::pipeline::codebase::CodeBase;
use crate::pipeline::node::{ExecutionNode, all_steps};
use crate::pipeline::steps::StepSpec;
use crate::pipeline::{
    ArchType, InfraFamily, Infrastructure, IntegrationStage, OsType, StageExecutionError,
};

/// Characters outside the Kubernetes label alphabet
static LABEL_INVALID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("valid regex"));

/// Longest Kubernetes label value
pub const MAX_LABEL_LEN: usize = 63;

const DEFAULT_REPO_NAME: &str = "repository";

/// OS of a Kubernetes stage.
///
/// # Errors
///
/// Fails when the stage has no infrastructure or runs elsewhere.
pub fn k8s_os(infra: Option<&Infrastructure>) -> Result<OsType, StageExecutionError> {
    match infra {
        None => Err(StageExecutionError::MissingInfrastructure),
        Some(infra) if infra.family() == InfraFamily::Kubernetes => Ok(infra.os()),
        Some(_) => Err(StageExecutionError::UnexpectedInfrastructure),
    }
}

/// OS of any stage.
///
/// # Errors
///
/// Fails when the stage has no infrastructure.
pub fn build_os(infra: Option<&Infrastructure>) -> Result<OsType, StageExecutionError> {
    infra
        .map(Infrastructure::os)
        .ok_or(StageExecutionError::MissingInfrastructure)
}

/// Who operates the build machines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InfraHost {
    /// The user
    SelfHosted,
    /// The platform
    HarnessHosted,
}

/// Summary of a stage's infrastructure for reporting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CiInfraDetails {
    /// Infra type name
    pub infra_type: String,
    /// Operating system
    pub os: OsType,
    /// Architecture
    pub arch: ArchType,
    /// Operator
    pub host: InfraHost,
}

/// Infra summary of `infra`
#[must_use]
pub fn ci_infra_details(infra: &Infrastructure) -> CiInfraDetails {
    CiInfraDetails {
        infra_type: infra.type_name().to_string(),
        os: infra.os(),
        arch: infra.arch(),
        host: if infra.is_hosted() {
            InfraHost::HarnessHosted
        } else {
            InfraHost::SelfHosted
        },
    }
}

/// Longest time the stage may run.
///
/// Hosted builds are capped lower for free accounts.
///
/// # Errors
///
/// Returns [`StageExecutionError::MissingLicense`] for hosted builds of an
/// unlicensed account.
pub fn stage_ttl(
    infra: &Infrastructure,
    license: &dyn LicenseService,
    account_id: &str,
    timeouts: &TimeoutConfig,
) -> Result<Duration, StageExecutionError> {
    if !infra.is_hosted() {
        return Ok(timeouts.stage_max_ttl);
    }
    let edition = license.edition(account_id).map_err(|e| {
        tracing::warn!(account = account_id, error = %e, "License lookup failed");
        StageExecutionError::MissingLicense
    })?;
    match edition {
        None => Err(StageExecutionError::MissingLicense),
        Some(Edition::Free) => Ok(timeouts.hosted_free_ttl),
        Some(_) => Ok(timeouts.stage_max_ttl),
    }
}

/// Billing multiplier of hosted build minutes
#[must_use]
pub fn build_time_multiplier(infra: &Infrastructure) -> u32 {
    if !infra.is_hosted() {
        return 1;
    }
    match infra.os() {
        OsType::MacOS => 10,
        OsType::Windows => 2,
        OsType::Linux => 1,
    }
}

/// Init timeout: the infra's own value when it parses, else 15m for VM pools
/// and 10m for everything else.
#[must_use]
pub fn init_timeout(infra: &Infrastructure, timeouts: &TimeoutConfig) -> Duration {
    let fallback = match infra {
        Infrastructure::Vm(_) => timeouts.vm_init,
        _ => timeouts.k8s_init,
    };
    match infra.init_timeout() {
        Some(raw) => humantime::parse_duration(raw.trim()).unwrap_or_else(|e| {
            tracing::warn!(timeout = raw, error = %e, "Ignoring unparseable init timeout");
            fallback
        }),
        None => fallback,
    }
}

/// Connector references used anywhere in the stage
#[must_use]
pub fn stage_connector_refs(
    stage: &IntegrationStage,
    codebase: Option<&CodeBase>,
) -> BTreeSet<String> {
    let mut refs = BTreeSet::new();
    let mut add = |value: Option<&str>| {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            refs.insert(value.to_string());
        }
    };

    for step in all_steps(&stage.execution.steps) {
        if let Some(container) = step.spec.container_options() {
            add(container.connector_ref.non_empty());
        }
        if let Some(plugin) = step.spec.plugin_options() {
            add(plugin.connector_ref.non_empty());
        }
        if let Some(bases) = step
            .spec
            .image_build_options()
            .and_then(|b| b.base_image_connector_refs.literal())
        {
            for base in bases {
                add(Some(base));
            }
        }
    }
    for service in &stage.service_dependencies {
        add(service.spec.container.connector_ref.non_empty());
    }
    if stage.clone_codebase {
        add(codebase.map(|c| c.connector_ref.as_str()));
    }
    refs
}

/// Build tool and language of a test intelligence step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiBuildDetails {
    /// Build tool (`Maven`, `Gradle`, ...)
    pub build_tool: String,
    /// Language
    pub language: String,
}

/// Test intelligence details of every RunTests step
#[must_use]
pub fn ti_build_details(nodes: &[ExecutionNode]) -> Vec<TiBuildDetails> {
    all_steps(nodes)
        .into_iter()
        .filter_map(|step| match &step.spec {
            StepSpec::RunTests(run_tests) => Some(TiBuildDetails {
                build_tool: run_tests.build_tool.resolve_or(String::new()),
                language: run_tests.language.resolve_or(String::new()),
            }),
            _ => None,
        })
        .collect()
}

/// Images of the Run, RunTests and Plugin steps with literal images
#[must_use]
pub fn ci_image_details(nodes: &[ExecutionNode]) -> Vec<ImageDetails> {
    all_steps(nodes)
        .into_iter()
        .filter(|step| {
            matches!(
                step.spec,
                StepSpec::Run(_) | StepSpec::RunTests(_) | StepSpec::Plugin(_)
            )
        })
        .filter_map(|step| step.spec.container_options())
        .filter_map(|container| container.image.non_empty())
        .filter_map(|image| image_info(image).ok())
        .collect()
}

/// Clone URL of a repository behind a git connector.
///
/// # Errors
///
/// Fails when the connector has no URL, or when an account-level connector
/// is used without a repository name.
pub fn git_url(
    connector: &ConnectorDetails,
    repo_name: Option<&str>,
) -> Result<String, StageExecutionError> {
    let url = connector
        .url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| {
            StageExecutionError::configuration(format!(
                "Git connector {} has no URL",
                connector.identifier
            ))
        })?;

    match connector.connection_type {
        ConnectionType::Repo => Ok(url.to_string()),
        ConnectionType::Account => {
            let repo = repo_name.filter(|r| !r.trim().is_empty()).ok_or_else(|| {
                StageExecutionError::configuration(format!(
                    "Repository name is required for account level git connector {}",
                    connector.identifier
                ))
            })?;
            Ok(format!(
                "{}/{}",
                url.trim_end_matches('/'),
                repo.trim_start_matches('/')
            ))
        }
    }
}

/// Repository name from a clone URL: last path segment up to the first `.`
#[must_use]
pub fn repo_name_from_url(url: &str) -> String {
    url.trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .and_then(|segment| segment.split('.').next())
        .filter(|name| !name.is_empty())
        .unwrap_or(DEFAULT_REPO_NAME)
        .to_string()
}

/// Value made safe for a Kubernetes label
#[must_use]
pub fn sanitize_label(value: &str) -> String {
    let replaced = LABEL_INVALID.replace_all(value, "");
    let truncated: String = replaced.chars().take(MAX_LABEL_LEN).collect();
    truncated
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}
