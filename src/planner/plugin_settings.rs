//! Plugin settings
//!
//! Plugin-compatible steps run stock plugin images configured entirely
//! through `PLUGIN_*` env vars. This module derives those vars from the
//! typed step fields.

use std::collections::BTreeMap;
use url::Url;

use super::stage_utils::{git_url, repo_name_from_url};
use crate::infrastructure::services::{ConnectorDetails, ConnectorType};
use crate::pipeline::codebase::Build;
use crate::pipeline::steps::{
    ArchiveFormat, GitCloneStep, ImageBuildOptions, StepNode, StepSpec,
};
use crate::pipeline::{InfraFamily, OsType, Resolved, StageExecutionError};

/// Workspace every container mounts
pub const STEP_MOUNT_PATH: &str = "/harness";

/// Depth of clones that do not declare one
pub const DEFAULT_CLONE_DEPTH: u32 = 50;

const LINUX_ARTIFACT_FILE: &str = "/addon/tmp/.plugin/artifact";
const WINDOWS_ARTIFACT_FILE: &str = r"C:\addon\tmp\.plugin\artifact";

/// What plugin settings depend on besides the step itself
#[derive(Debug, Clone, Copy)]
pub struct PluginContext<'a> {
    /// Backend family
    pub family: InfraFamily,
    /// Build OS
    pub os: OsType,
    /// Connector of the repository for clone steps
    pub git_connector: Option<&'a ConnectorDetails>,
    /// True for the clone step injected from the codebase
    pub implicit_clone: bool,
}

type Env = BTreeMap<String, String>;

struct Settings<'s> {
    env: Env,
    step: &'s StepNode,
}

impl<'s> Settings<'s> {
    fn new(step: &'s StepNode) -> Self {
        Self {
            env: Env::new(),
            step,
        }
    }

    fn unresolved(&self, field: &str) -> StageExecutionError {
        StageExecutionError::UnresolvedMandatoryField {
            field: field.to_string(),
            step_type: self.step.kind().type_name().to_string(),
            identifier: self.step.identifier.clone(),
        }
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.env.insert(key.to_string(), value.into());
    }

    fn mandatory(
        &mut self,
        key: &str,
        field: &str,
        value: &Resolved<String>,
    ) -> Result<(), StageExecutionError> {
        match value {
            Resolved::Literal(v) if v.trim().is_empty() => {
                Err(StageExecutionError::EmptyEnvironmentVariable {
                    name: key.to_string(),
                })
            }
            Resolved::Literal(v) => {
                self.set(key, v.clone());
                Ok(())
            }
            Resolved::Unresolved(_) | Resolved::Absent => Err(self.unresolved(field)),
        }
    }

    fn mandatory_list(
        &mut self,
        key: &str,
        field: &str,
        value: &Resolved<Vec<String>>,
    ) -> Result<(), StageExecutionError> {
        match value {
            Resolved::Literal(items) if items.iter().all(|i| i.trim().is_empty()) => {
                Err(StageExecutionError::EmptyEnvironmentVariable {
                    name: key.to_string(),
                })
            }
            Resolved::Literal(items) => {
                self.set(key, items.join(","));
                Ok(())
            }
            Resolved::Unresolved(_) | Resolved::Absent => Err(self.unresolved(field)),
        }
    }

    fn optional(&mut self, key: &str, value: &Resolved<String>) {
        if let Some(v) = value.non_empty() {
            self.set(key, v);
        }
    }

    fn optional_bool(&mut self, key: &str, value: &Resolved<bool>) {
        if let Some(v) = value.literal() {
            self.set(key, v.to_string());
        }
    }

    fn optional_map(&mut self, key: &str, value: &Resolved<BTreeMap<String, String>>) {
        if let Some(map) = value.literal().filter(|m| !m.is_empty()) {
            let joined: Vec<String> = map.iter().map(|(k, v)| format!("{k}={v}")).collect();
            self.set(key, joined.join(","));
        }
    }

    fn archive_format(&mut self, format: Option<ArchiveFormat>) {
        if let Some(format) = format {
            self.set("PLUGIN_ARCHIVE_FORMAT", format.to_string());
        }
    }
}

fn artifact_file(os: OsType) -> &'static str {
    if os.is_windows() {
        WINDOWS_ARTIFACT_FILE
    } else {
        LINUX_ARTIFACT_FILE
    }
}

/// Settings env of a plugin-compatible step.
///
/// Steps of other kinds yield an empty map.
///
/// # Errors
///
/// Fails when a mandatory field is absent, unresolved or blank, and for
/// clone steps without a usable git connector.
pub fn plugin_settings(
    step: &StepNode,
    ctx: &PluginContext<'_>,
) -> Result<BTreeMap<String, String>, StageExecutionError> {
    let mut s = Settings::new(step);

    match &step.spec {
        StepSpec::BuildAndPushDockerRegistry(docker) => {
            s.mandatory("PLUGIN_REPO", "repo", &docker.repo)?;
            image_build_settings(&mut s, &docker.build, ctx)?;
        }
        StepSpec::BuildAndPushEcr(ecr) => {
            let account = ecr.account.require("account", "BuildAndPushECR", &step.identifier)?;
            let region = ecr.region.require("region", "BuildAndPushECR", &step.identifier)?;
            s.set(
                "PLUGIN_REGISTRY",
                format!("{account}.dkr.ecr.{region}.amazonaws.com"),
            );
            s.set("PLUGIN_REGION", region.clone());
            s.mandatory("PLUGIN_REPO", "imageName", &ecr.image_name)?;
            image_build_settings(&mut s, &ecr.build, ctx)?;
        }
        StepSpec::BuildAndPushGcr(gcr) => {
            let host = gcr.host.require("host", "BuildAndPushGCR", &step.identifier)?;
            let project = gcr
                .project_id
                .require("projectID", "BuildAndPushGCR", &step.identifier)?;
            s.set("PLUGIN_REGISTRY", format!("{host}/{project}"));
            s.mandatory("PLUGIN_REPO", "imageName", &gcr.image_name)?;
            image_build_settings(&mut s, &gcr.build, ctx)?;
        }
        StepSpec::BuildAndPushAcr(acr) => {
            let repository =
                acr.repository
                    .require("repository", "BuildAndPushACR", &step.identifier)?;
            let registry = repository.split('/').next().unwrap_or_default();
            s.set("PLUGIN_REGISTRY", registry);
            s.mandatory("PLUGIN_REPO", "repository", &acr.repository)?;
            s.optional("PLUGIN_SUBSCRIPTION_ID", &acr.subscription_id);
            image_build_settings(&mut s, &acr.build, ctx)?;
        }
        StepSpec::SaveCacheS3(save) => {
            s.mandatory("PLUGIN_CACHE_KEY", "key", &save.key)?;
            s.mandatory("PLUGIN_BUCKET", "bucket", &save.bucket)?;
            s.mandatory_list("PLUGIN_MOUNT", "sourcePaths", &save.source_paths)?;
            s.optional("PLUGIN_ENDPOINT", &save.endpoint);
            s.optional("PLUGIN_REGION", &save.region);
            s.optional_bool("PLUGIN_PATH_STYLE", &save.path_style);
            s.set("PLUGIN_OVERRIDE", save.override_cache.resolve_or(true).to_string());
            s.archive_format(save.archive_format);
            s.set("PLUGIN_REBUILD", "true");
            s.set("PLUGIN_EXIT_CODE", "true");
            s.set("PLUGIN_BACKEND", "s3");
        }
        StepSpec::RestoreCacheS3(restore) => {
            s.mandatory("PLUGIN_CACHE_KEY", "key", &restore.key)?;
            s.mandatory("PLUGIN_BUCKET", "bucket", &restore.bucket)?;
            s.optional("PLUGIN_ENDPOINT", &restore.endpoint);
            s.optional("PLUGIN_REGION", &restore.region);
            s.optional_bool("PLUGIN_PATH_STYLE", &restore.path_style);
            s.optional_bool(
                "PLUGIN_FAIL_RESTORE_IF_KEY_NOT_PRESENT",
                &restore.fail_if_key_not_found,
            );
            s.archive_format(restore.archive_format);
            s.set("PLUGIN_RESTORE", "true");
            s.set("PLUGIN_EXIT_CODE", "true");
            s.set("PLUGIN_BACKEND", "s3");
        }
        StepSpec::SaveCacheGcs(save) => {
            s.mandatory("PLUGIN_CACHE_KEY", "key", &save.key)?;
            s.mandatory("PLUGIN_BUCKET", "bucket", &save.bucket)?;
            s.mandatory_list("PLUGIN_MOUNT", "sourcePaths", &save.source_paths)?;
            s.set("PLUGIN_OVERRIDE", save.override_cache.resolve_or(true).to_string());
            s.archive_format(save.archive_format);
            s.set("PLUGIN_REBUILD", "true");
            s.set("PLUGIN_EXIT_CODE", "true");
            s.set("PLUGIN_BACKEND", "gcs");
        }
        StepSpec::RestoreCacheGcs(restore) => {
            s.mandatory("PLUGIN_CACHE_KEY", "key", &restore.key)?;
            s.mandatory("PLUGIN_BUCKET", "bucket", &restore.bucket)?;
            s.optional_bool(
                "PLUGIN_FAIL_RESTORE_IF_KEY_NOT_PRESENT",
                &restore.fail_if_key_not_found,
            );
            s.archive_format(restore.archive_format);
            s.set("PLUGIN_RESTORE", "true");
            s.set("PLUGIN_EXIT_CODE", "true");
            s.set("PLUGIN_BACKEND", "gcs");
        }
        StepSpec::S3Upload(upload) => {
            s.mandatory("PLUGIN_BUCKET", "bucket", &upload.bucket)?;
            s.mandatory("PLUGIN_SOURCE", "sourcePaths", &upload.source_path)?;
            s.optional("PLUGIN_TARGET", &upload.target);
            s.optional("PLUGIN_ENDPOINT", &upload.endpoint);
            s.optional("PLUGIN_REGION", &upload.region);
            s.optional("PLUGIN_STRIP_PREFIX", &upload.strip_prefix);
            s.set("PLUGIN_ARTIFACT_FILE", artifact_file(ctx.os));
        }
        StepSpec::GcsUpload(upload) => {
            let bucket = upload.bucket.require("bucket", "GCSUpload", &step.identifier)?;
            if bucket.trim().is_empty() {
                return Err(StageExecutionError::EmptyEnvironmentVariable {
                    name: "PLUGIN_TARGET".to_string(),
                });
            }
            let target = match upload.target.non_empty() {
                Some(target) => format!("{bucket}/{target}"),
                None => bucket.clone(),
            };
            s.set("PLUGIN_TARGET", target);
            s.mandatory("PLUGIN_SOURCE", "sourcePaths", &upload.source_path)?;
            s.set("PLUGIN_ARTIFACT_FILE", artifact_file(ctx.os));
        }
        StepSpec::ArtifactoryUpload(upload) => {
            s.mandatory("PLUGIN_SOURCE", "sourcePath", &upload.source_path)?;
            s.mandatory("PLUGIN_TARGET", "target", &upload.target)?;
            s.set("PLUGIN_ARTIFACT_FILE", artifact_file(ctx.os));
        }
        StepSpec::Security(security) => {
            if let Some(settings) = security.settings.literal() {
                for (key, value) in settings {
                    let rendered = match value {
                        serde_json::Value::String(text) => text.clone(),
                        other => other.to_string(),
                    };
                    s.set(&format!("SECURITY_{}", key.to_uppercase()), rendered);
                }
            }
            s.set("PLUGIN_STEP_ID", step.identifier.clone());
        }
        StepSpec::GitClone(clone) => git_clone_settings(&mut s, clone, ctx)?,
        _ => {}
    }
    Ok(s.env)
}

fn image_build_settings(
    s: &mut Settings<'_>,
    build: &ImageBuildOptions,
    ctx: &PluginContext<'_>,
) -> Result<(), StageExecutionError> {
    s.mandatory_list("PLUGIN_TAGS", "tags", &build.tags)?;
    s.optional("PLUGIN_DOCKERFILE", &build.dockerfile);
    s.optional("PLUGIN_CONTEXT", &build.context);
    s.optional("PLUGIN_TARGET", &build.target);
    s.optional_map("PLUGIN_BUILD_ARGS", &build.build_args);
    s.optional_map("PLUGIN_CUSTOM_LABELS", &build.labels);

    match ctx.family {
        InfraFamily::Kubernetes => {
            if build.optimize.resolve_or(true) {
                s.set("PLUGIN_SNAPSHOT_MODE", "redo");
            }
            s.set("PLUGIN_ARTIFACT_FILE", artifact_file(ctx.os));
            if let Some(cache_repo) = build.remote_cache_image.non_empty() {
                s.set("PLUGIN_ENABLE_CACHE", "true");
                s.set("PLUGIN_CACHE_REPO", cache_repo);
            }
        }
        InfraFamily::Vm => s.set("PLUGIN_DAEMON_OFF", "true"),
        InfraFamily::Docker => {}
    }
    Ok(())
}

/// Provider-specific ref of a pull request head
fn pull_request_ref(connector_type: ConnectorType, number: &str) -> String {
    match connector_type {
        ConnectorType::Gitlab => format!("refs/merge-requests/{number}/head"),
        ConnectorType::Bitbucket => format!("refs/pull-requests/{number}/from"),
        ConnectorType::AzureRepo => format!("refs/pull/{number}/merge"),
        _ => format!("refs/pull/{number}/head"),
    }
}

/// Host used for the netrc entry of a clone URL
fn netrc_machine(remote_url: &str) -> Option<String> {
    if let Ok(url) = Url::parse(remote_url) {
        return url.host_str().map(str::to_string);
    }
    // scp-like `git@host:owner/repo.git`
    let after_user = remote_url.rsplit_once('@').map_or(remote_url, |(_, rest)| rest);
    after_user
        .split_once(':')
        .map(|(host, _)| host.to_string())
        .filter(|host| !host.is_empty())
}

fn git_clone_settings(
    s: &mut Settings<'_>,
    clone: &GitCloneStep,
    ctx: &PluginContext<'_>,
) -> Result<(), StageExecutionError> {
    for key in [
        "DRONE_TAG",
        "DRONE_NETRC_MACHINE",
        "DRONE_BUILD_EVENT",
        "DRONE_COMMIT_BRANCH",
        "DRONE_REMOTE_URL",
        "DRONE_COMMIT_SHA",
    ] {
        s.set(key, "");
    }

    let connector = ctx
        .git_connector
        .ok_or_else(|| s.unresolved("connectorRef"))?;
    let remote_url = git_url(connector, clone.repo_name.non_empty())?;
    s.set("DRONE_REMOTE_URL", remote_url.clone());
    if let Some(machine) = netrc_machine(&remote_url) {
        s.set("DRONE_NETRC_MACHINE", machine);
    }

    if let Some(build) = clone.build.literal() {
        match build {
            Build::Branch { branch } => {
                if let Some(branch) = branch.non_empty() {
                    s.set("DRONE_COMMIT_BRANCH", branch);
                }
            }
            Build::Tag { tag } => {
                if let Some(tag) = tag.non_empty() {
                    s.set("DRONE_TAG", tag);
                    s.set("DRONE_BUILD_EVENT", "tag");
                }
            }
            Build::PullRequest { number } => {
                if let Some(number) = number.non_empty() {
                    s.set("DRONE_BUILD_EVENT", "pull_request");
                    s.set(
                        "DRONE_COMMIT_REF",
                        pull_request_ref(connector.connector_type, number),
                    );
                }
            }
        }
    }

    if let Some(ssl_verify) = clone.ssl_verify.literal() {
        s.set("GIT_SSL_NO_VERIFY", (!ssl_verify).to_string());
    }

    let depth = match &clone.depth {
        Resolved::Literal(depth) => *depth,
        Resolved::Unresolved(_) | Resolved::Absent => DEFAULT_CLONE_DEPTH,
    };
    if depth != 0 {
        s.set("PLUGIN_DEPTH", depth.to_string());
    }

    if let Some(strategy) = clone.pr_clone_strategy {
        s.set("PLUGIN_PR_CLONE_STRATEGY", strategy.to_string());
    }

    let workspace = match clone.clone_directory.non_empty() {
        Some(dir) if dir.trim_end_matches('/') == STEP_MOUNT_PATH && !ctx.implicit_clone => {
            return Err(StageExecutionError::configuration(format!(
                "Clone directory {STEP_MOUNT_PATH} is reserved, choose a different cloneDirectory for step {}",
                s.step.identifier
            )));
        }
        Some(dir) => dir.to_string(),
        None => format!("{STEP_MOUNT_PATH}/{}", repo_name_from_url(&remote_url)),
    };
    s.set("DRONE_WORKSPACE", workspace);
    Ok(())
}
