//! Configuration management
//!
//! Planner settings loaded from YAML. Every section has defaults so an empty
//! document is a valid configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::infra::InfraFamily;
use crate::pipeline::steps::StepKind;

/// Errors raised while loading the configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// File could not be read
    #[error("Failed to read config file {path}: {message}")]
    Io {
        /// Path of the file.
        path: String,
        /// Underlying error.
        message: String,
    },

    /// Document could not be parsed
    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Application configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port layout
    pub ports: PortConfig,
    /// Resource defaults
    pub resources: ResourceConfig,
    /// Platform images
    pub images: ImageConfig,
    /// Log, TI and STO endpoints
    pub services: ServiceEndpoints,
    /// Hosted cache intelligence backend
    pub cache_intelligence: CacheIntelligenceConfig,
    /// Init timeouts and TTLs
    pub timeouts: TimeoutConfig,
    /// Retry policy for service calls
    pub retry: RetryConfig,
    /// Connector used to pull platform images
    pub harness_image_connector: Option<String>,
    /// Prefix of generated pod names
    pub pod_name_prefix: String,
    /// Log level used when `RUST_LOG` is not set
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ports: PortConfig::default(),
            resources: ResourceConfig::default(),
            images: ImageConfig::default(),
            services: ServiceEndpoints::default(),
            cache_intelligence: CacheIntelligenceConfig::default(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
            harness_image_connector: None,
            pod_name_prefix: "harnessci".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Loads the configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parses the configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on malformed input.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

/// Port layout of a build pod or VM
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Lite engine port
    pub lite_engine: u16,
    /// First port handed to services and steps
    pub first_step: u16,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            lite_engine: 20001,
            first_step: 20002,
        }
    }
}

/// Default container resources
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Default CPU limit
    pub default_cpu: String,
    /// Default memory limit
    pub default_memory: String,
    /// CPU limit for accounts on the increased tier
    pub increased_cpu: String,
    /// Memory limit for accounts on the increased tier
    pub increased_memory: String,
    /// CPU request of step containers
    pub step_request_cpu: String,
    /// Memory request of step containers
    pub step_request_memory: String,
    /// Accounts never receiving redistributed resources
    pub legacy_accounts: Vec<String>,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            default_cpu: "400m".to_string(),
            default_memory: "500Mi".to_string(),
            increased_cpu: "1000m".to_string(),
            increased_memory: "3000Mi".to_string(),
            step_request_cpu: "10m".to_string(),
            step_request_memory: "10Mi".to_string(),
            legacy_accounts: Vec::new(),
        }
    }
}

/// Platform images
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageConfig {
    /// Addon image copied in by the init container
    pub addon: String,
    /// Lite engine image
    pub lite_engine: String,
    /// Plugin images for Kubernetes builds
    pub kubernetes: StepImages,
    /// Plugin images for VM and Docker builds
    pub vm: StepImages,
    /// Cache intelligence plugin
    pub cache: String,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            addon: "harness/ci-addon:1.16.22".to_string(),
            lite_engine: "harness/ci-lite-engine:1.16.22".to_string(),
            kubernetes: StepImages::kubernetes(),
            vm: StepImages::vm(),
            cache: "plugins/cache:1.6.2".to_string(),
        }
    }
}

impl ImageConfig {
    /// Image of a plugin-compatible step for the given backend family
    #[must_use]
    pub fn step_image(&self, kind: StepKind, family: InfraFamily) -> Option<&str> {
        let images = match family {
            InfraFamily::Kubernetes => &self.kubernetes,
            InfraFamily::Vm | InfraFamily::Docker => &self.vm,
        };
        images.image_for(kind)
    }
}

/// Plugin images per step kind
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StepImages {
    /// Git clone
    pub git_clone: String,
    /// Docker registry build
    pub docker: String,
    /// ECR build
    pub ecr: String,
    /// GCR build
    pub gcr: String,
    /// ACR build
    pub acr: String,
    /// S3 cache save and restore
    pub cache_s3: String,
    /// GCS cache save and restore
    pub cache_gcs: String,
    /// S3 upload
    pub s3_upload: String,
    /// GCS upload
    pub gcs_upload: String,
    /// Artifactory upload
    pub artifactory_upload: String,
    /// Security scan
    pub security: String,
}

impl StepImages {
    fn kubernetes() -> Self {
        Self {
            git_clone: "harness/drone-git:1.5.6-rootless".to_string(),
            docker: "plugins/kaniko:1.8.5".to_string(),
            ecr: "plugins/kaniko-ecr:1.8.5".to_string(),
            gcr: "plugins/kaniko-gcr:1.8.5".to_string(),
            acr: "plugins/kaniko-acr:1.8.5".to_string(),
            ..Self::shared()
        }
    }

    fn vm() -> Self {
        Self {
            git_clone: "harness/drone-git:1.5.6".to_string(),
            docker: "plugins/docker:20.17.4".to_string(),
            ecr: "plugins/ecr:20.17.4".to_string(),
            gcr: "plugins/gcr:20.17.4".to_string(),
            acr: "plugins/acr:20.17.4".to_string(),
            ..Self::shared()
        }
    }

    fn shared() -> Self {
        Self {
            cache_s3: "plugins/cache:1.6.2".to_string(),
            cache_gcs: "plugins/cache:1.6.2".to_string(),
            s3_upload: "plugins/s3:1.2.8".to_string(),
            gcs_upload: "plugins/gcs:1.3.0".to_string(),
            artifactory_upload: "plugins/artifactory:1.4.0".to_string(),
            security: "harness/sto-plugin:latest".to_string(),
            ..Self::default()
        }
    }

    /// Image for a plugin-compatible kind; `None` for user-image kinds
    #[must_use]
    pub fn image_for(&self, kind: StepKind) -> Option<&str> {
        let image = match kind {
            StepKind::GitClone => &self.git_clone,
            StepKind::Docker => &self.docker,
            StepKind::Ecr => &self.ecr,
            StepKind::Gcr => &self.gcr,
            StepKind::Acr => &self.acr,
            StepKind::SaveCacheS3 | StepKind::RestoreCacheS3 => &self.cache_s3,
            StepKind::SaveCacheGcs | StepKind::RestoreCacheGcs => &self.cache_gcs,
            StepKind::S3Upload => &self.s3_upload,
            StepKind::GcsUpload => &self.gcs_upload,
            StepKind::ArtifactoryUpload => &self.artifactory_upload,
            StepKind::Security => &self.security,
            _ => return None,
        };
        Some(image.as_str())
    }
}

/// Endpoints of the log, TI and STO services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEndpoints {
    /// Log service base URL
    pub log_url: String,
    /// Test intelligence base URL
    pub ti_url: String,
    /// Security testing base URL
    pub sto_url: String,
    /// Token used to request per-account tokens
    pub global_token: String,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        Self {
            log_url: "http://localhost:8079".to_string(),
            ti_url: "http://localhost:8078".to_string(),
            sto_url: "http://localhost:4000".to_string(),
            global_token: String::new(),
        }
    }
}

/// Backend of hosted cache intelligence
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheIntelligenceConfig {
    /// GCS bucket
    pub bucket: String,
    /// Path of the service account key
    pub service_key_path: String,
}

/// Init timeouts and stage TTLs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// VM setup timeout
    #[serde(with = "humantime_serde")]
    pub vm_init: Duration,
    /// Pod start timeout
    #[serde(with = "humantime_serde")]
    pub k8s_init: Duration,
    /// Stage TTL
    #[serde(with = "humantime_serde")]
    pub stage_max_ttl: Duration,
    /// Stage TTL on the hosted free plan
    #[serde(with = "humantime_serde")]
    pub hosted_free_ttl: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            vm_init: Duration::from_secs(15 * 60),
            k8s_init: Duration::from_secs(10 * 60),
            stage_max_ttl: Duration::from_secs(86_400),
            hosted_free_ttl: Duration::from_secs(3_600),
        }
    }
}

/// Retry policy for external service calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first one
    pub max_attempts: u32,
    /// Fixed delay between attempts
    #[serde(with = "humantime_serde")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.ports.lite_engine, 20001);
        assert_eq!(config.ports.first_step, 20002);
        assert_eq!(config.resources.default_cpu, "400m");
        assert_eq!(config.timeouts.vm_init, Duration::from_secs(900));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.pod_name_prefix, "harnessci");
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml_str(
            "resources:\n  legacy_accounts: [acct-1]\ntimeouts:\n  k8s_init: 5m\nretry:\n  delay: 0s\n",
        )
        .unwrap();

        assert_eq!(config.resources.legacy_accounts, vec!["acct-1".to_string()]);
        assert_eq!(config.resources.default_memory, "500Mi");
        assert_eq!(config.timeouts.k8s_init, Duration::from_secs(300));
        assert_eq!(config.timeouts.vm_init, Duration::from_secs(900));
        assert_eq!(config.retry.delay, Duration::ZERO);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pod_name_prefix: ci").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.pod_name_prefix, "ci");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/stageplan.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_step_images_per_family() {
        let images = ImageConfig::default();
        assert_eq!(
            images.step_image(StepKind::Docker, InfraFamily::Kubernetes),
            Some("plugins/kaniko:1.8.5")
        );
        assert_eq!(
            images.step_image(StepKind::Docker, InfraFamily::Vm),
            Some("plugins/docker:20.17.4")
        );
        assert_eq!(images.step_image(StepKind::Run, InfraFamily::Vm), None);
    }
}
