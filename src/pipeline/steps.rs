//! Step definitions
//!
//! Every step kind is a variant of the closed [`StepSpec`] enum carrying its
//! own strongly typed fields. Document shape follows the pipeline YAML:
//!
//! ```yaml
//! identifier: build
//! type: Run
//! spec:
//!   image: golang:1.22
//!   connectorRef: account.dockerhub
//!   command: go build ./...
//! ```

#![allow(clippy::must_use_candidate)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::codebase::{Build, PrCloneStrategy};
use super::resolved::Resolved;
use super::types::ImagePullPolicy;

/// Declared resource limits of a container
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerResource {
    /// Limits section
    pub limits: ResourceLimits,
}

/// CPU and memory limits as quantity strings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceLimits {
    /// CPU quantity (`500m`, `1`)
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub cpu: Resolved<String>,
    /// Memory quantity (`500Mi`, `1Gi`)
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub memory: Resolved<String>,
}

impl ContainerResource {
    /// Builds limits from literal quantities.
    pub fn limits(cpu: Option<&str>, memory: Option<&str>) -> Self {
        let to_resolved = |value: Option<&str>| {
            value.map_or(Resolved::Absent, |v| Resolved::Literal(v.to_string()))
        };
        Self {
            limits: ResourceLimits {
                cpu: to_resolved(cpu),
                memory: to_resolved(memory),
            },
        }
    }
}

/// Matrix/parallelism strategy declared on a step or step group
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StrategyConfig {
    /// Matrix axes, exclusions and `maxConcurrency`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matrix: Option<BTreeMap<String, serde_json::Value>>,
    /// Plain parallelism count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<u32>,
    /// Repeat configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repeat: Option<serde_json::Value>,
}

/// Failure strategy attached to a step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureStrategy {
    /// Ignore every error raised by the step
    IgnoreAll,
    /// Abort the stage
    Abort,
    /// Mark the step failed and continue
    MarkAsFailure,
}

/// A step in the stage execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepNode {
    /// Step identifier, unique within its parent
    pub identifier: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Step timeout (`10m`, `1h 30m`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Strategy declared on the step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyConfig>,
    /// Uuid shared by every instance expanded from the same strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Failure strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_strategy: Option<FailureStrategy>,
    /// Step type and type-specific fields
    #[serde(flatten)]
    pub spec: StepSpec,
}

impl StepNode {
    /// Creates a step without strategy, timeout or display name.
    pub fn new(identifier: impl Into<String>, spec: StepSpec) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            timeout: None,
            strategy: None,
            uuid: None,
            failure_strategy: None,
            spec,
        }
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the strategy uuid.
    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Sets the strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: StrategyConfig) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Kind of the step
    pub fn kind(&self) -> StepKind {
        self.spec.kind()
    }
}

/// Container fields shared by user-defined container steps
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ContainerOptions {
    /// Image, possibly templated
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub image: Resolved<String>,
    /// Registry connector for the image
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub connector_ref: Resolved<String>,
    /// Step environment
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub env_variables: Resolved<BTreeMap<String, String>>,
    /// Privileged container
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub privileged: Resolved<bool>,
    /// User id for the container process
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub run_as_user: Resolved<i64>,
    /// Pull policy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<ImagePullPolicy>,
    /// Declared limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ContainerResource>,
}

/// Fields shared by plugin-compatible steps whose image is chosen by the platform
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginOptions {
    /// Connector providing credentials to the plugin
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub connector_ref: Resolved<String>,
    /// User id for the container process
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub run_as_user: Resolved<i64>,
    /// Declared limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ContainerResource>,
}

/// Fields shared by the build-and-push steps
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageBuildOptions {
    /// Image tags
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub tags: Resolved<Vec<String>>,
    /// Dockerfile path
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub dockerfile: Resolved<String>,
    /// Build context
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub context: Resolved<String>,
    /// Build target stage
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub target: Resolved<String>,
    /// Build arguments
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub build_args: Resolved<BTreeMap<String, String>>,
    /// Image labels
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub labels: Resolved<BTreeMap<String, String>>,
    /// Snapshot optimisation on Kubernetes (defaults to true)
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub optimize: Resolved<bool>,
    /// Remote layer cache
    #[serde(alias = "remoteCacheRepo", skip_serializing_if = "Resolved::is_absent")]
    pub remote_cache_image: Resolved<String>,
    /// Connectors for base images pulled during the build
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub base_image_connector_refs: Resolved<Vec<String>>,
}

/// Shell used by a Run step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Shell {
    /// `sh`
    Sh,
    /// `bash`
    Bash,
    /// `powershell`
    Powershell,
    /// `pwsh`
    Pwsh,
    /// `python`
    Python,
}

/// Runs a script in a user image
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunStep {
    /// Container fields
    #[serde(flatten)]
    pub container: ContainerOptions,
    /// Script
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub command: Resolved<String>,
    /// Shell
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shell: Option<Shell>,
    /// Variables exported to later steps
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub output_variables: Vec<String>,
}

/// Long-running container for the rest of the stage
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BackgroundStep {
    /// Container fields
    #[serde(flatten)]
    pub container: ContainerOptions,
    /// Script
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub command: Resolved<String>,
    /// Entrypoint override
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub entrypoint: Resolved<Vec<String>>,
    /// Host to container port mapping (VM and Docker only)
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub port_bindings: Resolved<BTreeMap<String, String>>,
}

/// Runs a plugin image
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PluginStep {
    /// Container fields
    #[serde(flatten)]
    pub container: ContainerOptions,
    /// Entrypoint override
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub entrypoint: Resolved<Vec<String>>,
    /// Image managed by the platform rather than the user
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub harness_managed_image: bool,
}

/// Runs tests with test intelligence
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RunTestsStep {
    /// Container fields
    #[serde(flatten)]
    pub container: ContainerOptions,
    /// Language (`Java`, `Csharp`, ...)
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub language: Resolved<String>,
    /// Build tool (`Maven`, `Gradle`, ...)
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub build_tool: Resolved<String>,
    /// Build tool arguments
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub args: Resolved<String>,
    /// Packages to instrument
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub packages: Resolved<String>,
    /// Only run tests selected by test intelligence
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub run_only_selected_tests: Resolved<bool>,
}

/// Clones a repository
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GitCloneStep {
    /// Plugin fields (connector is the git connector)
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Repository name for account-level connectors
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub repo_name: Resolved<String>,
    /// Branch, tag or pull request to clone
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub build: Resolved<Build>,
    /// Target directory
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub clone_directory: Resolved<String>,
    /// Clone depth, 0 for full history
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub depth: Resolved<u32>,
    /// Verify TLS certificates
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub ssl_verify: Resolved<bool>,
    /// How pull requests are checked out
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_clone_strategy: Option<PrCloneStrategy>,
    /// Platform specific entrypoint
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,
}

/// Saves a cache archive to S3
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SaveCacheS3Step {
    /// Plugin fields
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Cache key
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub key: Resolved<String>,
    /// Bucket
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub bucket: Resolved<String>,
    /// Paths to archive
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub source_paths: Resolved<Vec<String>>,
    /// Custom endpoint
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub endpoint: Resolved<String>,
    /// Region
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub region: Resolved<String>,
    /// Archive format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_format: Option<ArchiveFormat>,
    /// Path-style bucket addressing
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub path_style: Resolved<bool>,
    /// Overwrite an existing cache
    #[serde(rename = "override", skip_serializing_if = "Resolved::is_absent")]
    pub override_cache: Resolved<bool>,
}

/// Restores a cache archive from S3
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RestoreCacheS3Step {
    /// Plugin fields
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Cache key
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub key: Resolved<String>,
    /// Bucket
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub bucket: Resolved<String>,
    /// Custom endpoint
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub endpoint: Resolved<String>,
    /// Region
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub region: Resolved<String>,
    /// Archive format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_format: Option<ArchiveFormat>,
    /// Path-style bucket addressing
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub path_style: Resolved<bool>,
    /// Fail when the key has no archive
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub fail_if_key_not_found: Resolved<bool>,
}

/// Saves a cache archive to GCS
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SaveCacheGcsStep {
    /// Plugin fields
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Cache key
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub key: Resolved<String>,
    /// Bucket
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub bucket: Resolved<String>,
    /// Paths to archive
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub source_paths: Resolved<Vec<String>>,
    /// Archive format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_format: Option<ArchiveFormat>,
    /// Overwrite an existing cache
    #[serde(rename = "override", skip_serializing_if = "Resolved::is_absent")]
    pub override_cache: Resolved<bool>,
}

/// Restores a cache archive from GCS
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RestoreCacheGcsStep {
    /// Plugin fields
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Cache key
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub key: Resolved<String>,
    /// Bucket
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub bucket: Resolved<String>,
    /// Archive format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive_format: Option<ArchiveFormat>,
    /// Fail when the key has no archive
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub fail_if_key_not_found: Resolved<bool>,
}

/// Cache archive format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ArchiveFormat {
    /// Plain tar
    #[default]
    Tar,
    /// Gzip compressed tar
    Gzip,
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tar => write!(f, "tar"),
            Self::Gzip => write!(f, "gzip"),
        }
    }
}

/// Builds and pushes to a Docker registry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DockerBuildStep {
    /// Plugin fields
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Build fields
    #[serde(flatten)]
    pub build: ImageBuildOptions,
    /// Target repository
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub repo: Resolved<String>,
}

/// Builds and pushes to Amazon ECR
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EcrBuildStep {
    /// Plugin fields
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Build fields
    #[serde(flatten)]
    pub build: ImageBuildOptions,
    /// AWS account id
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub account: Resolved<String>,
    /// AWS region
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub region: Resolved<String>,
    /// Image name
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub image_name: Resolved<String>,
}

/// Builds and pushes to Google Container Registry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GcrBuildStep {
    /// Plugin fields
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Build fields
    #[serde(flatten)]
    pub build: ImageBuildOptions,
    /// Registry host
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub host: Resolved<String>,
    /// GCP project
    #[serde(rename = "projectID", skip_serializing_if = "Resolved::is_absent")]
    pub project_id: Resolved<String>,
    /// Image name
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub image_name: Resolved<String>,
}

/// Builds and pushes to Azure Container Registry
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AcrBuildStep {
    /// Plugin fields
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Build fields
    #[serde(flatten)]
    pub build: ImageBuildOptions,
    /// `<registry>/<repository>`
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub repository: Resolved<String>,
    /// Azure subscription
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub subscription_id: Resolved<String>,
}

/// Security scan
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecurityStep {
    /// Plugin fields
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Scanner settings, exported as `SECURITY_<KEY>`
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub settings: Resolved<BTreeMap<String, serde_json::Value>>,
}

/// Uploads files to Artifactory
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ArtifactoryUploadStep {
    /// Plugin fields
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Files to upload
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub source_path: Resolved<String>,
    /// Repository path
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub target: Resolved<String>,
}

/// Uploads files to S3
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct S3UploadStep {
    /// Plugin fields
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Bucket
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub bucket: Resolved<String>,
    /// Files to upload
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub source_path: Resolved<String>,
    /// Key prefix
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub target: Resolved<String>,
    /// Custom endpoint
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub endpoint: Resolved<String>,
    /// Region
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub region: Resolved<String>,
    /// Prefix stripped from uploaded paths
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub strip_prefix: Resolved<String>,
}

/// Uploads files to GCS
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GcsUploadStep {
    /// Plugin fields
    #[serde(flatten)]
    pub plugin: PluginOptions,
    /// Bucket
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub bucket: Resolved<String>,
    /// Files to upload
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub source_path: Resolved<String>,
    /// Object prefix
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub target: Resolved<String>,
}

/// Reuses a third-party action or Bitrise step (hosted VM only)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExternalActionStep {
    /// Action reference
    pub uses: String,
    /// Action inputs
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub with: BTreeMap<String, String>,
    /// Action environment
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

/// HTTP call made by the CI manager
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HttpStep {
    /// Target URL
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub url: Resolved<String>,
    /// HTTP method
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub method: Resolved<String>,
}

/// Pause handled by the CI manager
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WaitStep {
    /// Wait duration
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub duration: Resolved<String>,
}

/// Step type with its type-specific fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec")]
pub enum StepSpec {
    /// Script in a user image
    Run(RunStep),
    /// Stage-long service container
    Background(BackgroundStep),
    /// Plugin image
    Plugin(PluginStep),
    /// Test intelligence run
    RunTests(RunTestsStep),
    /// Repository clone
    GitClone(GitCloneStep),
    /// Cache save to S3
    SaveCacheS3(SaveCacheS3Step),
    /// Cache restore from S3
    RestoreCacheS3(RestoreCacheS3Step),
    /// Cache save to GCS
    #[serde(rename = "SaveCacheGCS")]
    SaveCacheGcs(SaveCacheGcsStep),
    /// Cache restore from GCS
    #[serde(rename = "RestoreCacheGCS")]
    RestoreCacheGcs(RestoreCacheGcsStep),
    /// Docker registry build and push
    BuildAndPushDockerRegistry(DockerBuildStep),
    /// ECR build and push
    #[serde(rename = "BuildAndPushECR")]
    BuildAndPushEcr(EcrBuildStep),
    /// GCR build and push
    #[serde(rename = "BuildAndPushGCR")]
    BuildAndPushGcr(GcrBuildStep),
    /// ACR build and push
    #[serde(rename = "BuildAndPushACR")]
    BuildAndPushAcr(AcrBuildStep),
    /// Security scan
    Security(SecurityStep),
    /// Artifactory upload
    ArtifactoryUpload(ArtifactoryUploadStep),
    /// S3 upload
    S3Upload(S3UploadStep),
    /// GCS upload
    #[serde(rename = "GCSUpload")]
    GcsUpload(GcsUploadStep),
    /// Third-party action
    Action(ExternalActionStep),
    /// Bitrise step
    Bitrise(ExternalActionStep),
    /// HTTP call
    Http(HttpStep),
    /// Wait
    Wait(WaitStep),
}

/// Step kind without payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// Run
    Run,
    /// Background
    Background,
    /// Plugin
    Plugin,
    /// RunTests
    RunTests,
    /// GitClone
    GitClone,
    /// SaveCacheS3
    SaveCacheS3,
    /// RestoreCacheS3
    RestoreCacheS3,
    /// SaveCacheGCS
    SaveCacheGcs,
    /// RestoreCacheGCS
    RestoreCacheGcs,
    /// BuildAndPushDockerRegistry
    Docker,
    /// BuildAndPushECR
    Ecr,
    /// BuildAndPushGCR
    Gcr,
    /// BuildAndPushACR
    Acr,
    /// Security
    Security,
    /// ArtifactoryUpload
    ArtifactoryUpload,
    /// S3Upload
    S3Upload,
    /// GCSUpload
    GcsUpload,
    /// Action
    Action,
    /// Bitrise
    Bitrise,
    /// Http
    Http,
    /// Wait
    Wait,
}

/// Where a step executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExecutionEnvironment {
    /// Inside the build infrastructure, driven by the lite engine
    LiteEngine,
    /// Synchronously by the CI manager
    CiManager,
}

impl StepKind {
    /// Type name as written in pipeline YAML
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Run => "Run",
            Self::Background => "Background",
            Self::Plugin => "Plugin",
            Self::RunTests => "RunTests",
            Self::GitClone => "GitClone",
            Self::SaveCacheS3 => "SaveCacheS3",
            Self::RestoreCacheS3 => "RestoreCacheS3",
            Self::SaveCacheGcs => "SaveCacheGCS",
            Self::RestoreCacheGcs => "RestoreCacheGCS",
            Self::Docker => "BuildAndPushDockerRegistry",
            Self::Ecr => "BuildAndPushECR",
            Self::Gcr => "BuildAndPushGCR",
            Self::Acr => "BuildAndPushACR",
            Self::Security => "Security",
            Self::ArtifactoryUpload => "ArtifactoryUpload",
            Self::S3Upload => "S3Upload",
            Self::GcsUpload => "GCSUpload",
            Self::Action => "Action",
            Self::Bitrise => "Bitrise",
            Self::Http => "Http",
            Self::Wait => "Wait",
        }
    }

    /// Steps whose image and settings are derived by the platform
    pub fn is_plugin_compatible(&self) -> bool {
        matches!(
            self,
            Self::GitClone
                | Self::SaveCacheS3
                | Self::RestoreCacheS3
                | Self::SaveCacheGcs
                | Self::RestoreCacheGcs
                | Self::Docker
                | Self::Ecr
                | Self::Gcr
                | Self::Acr
                | Self::Security
                | Self::ArtifactoryUpload
                | Self::S3Upload
                | Self::GcsUpload
        )
    }

    /// Docker-family build steps
    pub fn is_image_build(&self) -> bool {
        matches!(self, Self::Docker | Self::Ecr | Self::Gcr | Self::Acr)
    }

    /// Steps that only run on hosted VMs
    pub fn is_cloud_only(&self) -> bool {
        matches!(self, Self::Action | Self::Bitrise)
    }

    /// Execution environment of the kind
    pub fn execution_environment(&self) -> ExecutionEnvironment {
        match self {
            Self::Http | Self::Wait => ExecutionEnvironment::CiManager,
            _ => ExecutionEnvironment::LiteEngine,
        }
    }

    /// Whether the step gets its own container in a Kubernetes pod
    pub fn needs_container(&self) -> bool {
        self.execution_environment() == ExecutionEnvironment::LiteEngine && !self.is_cloud_only()
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.type_name())
    }
}

impl StepSpec {
    /// Kind of the spec
    pub fn kind(&self) -> StepKind {
        match self {
            Self::Run(_) => StepKind::Run,
            Self::Background(_) => StepKind::Background,
            Self::Plugin(_) => StepKind::Plugin,
            Self::RunTests(_) => StepKind::RunTests,
            Self::GitClone(_) => StepKind::GitClone,
            Self::SaveCacheS3(_) => StepKind::SaveCacheS3,
            Self::RestoreCacheS3(_) => StepKind::RestoreCacheS3,
            Self::SaveCacheGcs(_) => StepKind::SaveCacheGcs,
            Self::RestoreCacheGcs(_) => StepKind::RestoreCacheGcs,
            Self::BuildAndPushDockerRegistry(_) => StepKind::Docker,
            Self::BuildAndPushEcr(_) => StepKind::Ecr,
            Self::BuildAndPushGcr(_) => StepKind::Gcr,
            Self::BuildAndPushAcr(_) => StepKind::Acr,
            Self::Security(_) => StepKind::Security,
            Self::ArtifactoryUpload(_) => StepKind::ArtifactoryUpload,
            Self::S3Upload(_) => StepKind::S3Upload,
            Self::GcsUpload(_) => StepKind::GcsUpload,
            Self::Action(_) => StepKind::Action,
            Self::Bitrise(_) => StepKind::Bitrise,
            Self::Http(_) => StepKind::Http,
            Self::Wait(_) => StepKind::Wait,
        }
    }

    /// Declared resource limits, if the kind has a container
    pub fn resources(&self) -> Option<&ContainerResource> {
        match self {
            Self::Run(RunStep { container, .. })
            | Self::Background(BackgroundStep { container, .. })
            | Self::Plugin(PluginStep { container, .. })
            | Self::RunTests(RunTestsStep { container, .. }) => container.resources.as_ref(),
            _ => self.plugin_options().and_then(|p| p.resources.as_ref()),
        }
    }

    /// Image fields of user-defined container steps
    pub fn container_options(&self) -> Option<&ContainerOptions> {
        match self {
            Self::Run(RunStep { container, .. })
            | Self::Background(BackgroundStep { container, .. })
            | Self::Plugin(PluginStep { container, .. })
            | Self::RunTests(RunTestsStep { container, .. }) => Some(container),
            _ => None,
        }
    }

    /// Mutable environment of user-defined container steps
    pub fn env_variables_mut(&mut self) -> Option<&mut Resolved<BTreeMap<String, String>>> {
        match self {
            Self::Run(RunStep { container, .. })
            | Self::Background(BackgroundStep { container, .. })
            | Self::Plugin(PluginStep { container, .. })
            | Self::RunTests(RunTestsStep { container, .. }) => Some(&mut container.env_variables),
            _ => None,
        }
    }

    /// Plugin fields of plugin-compatible steps
    pub fn plugin_options(&self) -> Option<&PluginOptions> {
        match self {
            Self::GitClone(GitCloneStep { plugin, .. })
            | Self::SaveCacheS3(SaveCacheS3Step { plugin, .. })
            | Self::RestoreCacheS3(RestoreCacheS3Step { plugin, .. })
            | Self::SaveCacheGcs(SaveCacheGcsStep { plugin, .. })
            | Self::RestoreCacheGcs(RestoreCacheGcsStep { plugin, .. })
            | Self::BuildAndPushDockerRegistry(DockerBuildStep { plugin, .. })
            | Self::BuildAndPushEcr(EcrBuildStep { plugin, .. })
            | Self::BuildAndPushGcr(GcrBuildStep { plugin, .. })
            | Self::BuildAndPushAcr(AcrBuildStep { plugin, .. })
            | Self::Security(SecurityStep { plugin, .. })
            | Self::ArtifactoryUpload(ArtifactoryUploadStep { plugin, .. })
            | Self::S3Upload(S3UploadStep { plugin, .. })
            | Self::GcsUpload(GcsUploadStep { plugin, .. }) => Some(plugin),
            _ => None,
        }
    }

    /// Build fields of build-and-push steps
    pub fn image_build_options(&self) -> Option<&ImageBuildOptions> {
        match self {
            Self::BuildAndPushDockerRegistry(DockerBuildStep { build, .. })
            | Self::BuildAndPushEcr(EcrBuildStep { build, .. })
            | Self::BuildAndPushGcr(GcrBuildStep { build, .. })
            | Self::BuildAndPushAcr(AcrBuildStep { build, .. }) => Some(build),
            _ => None,
        }
    }
}
