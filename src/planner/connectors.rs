//! Connector bindings of plugin-compatible steps
//!
//! Each step that talks to an external registry or store is bound to its
//! connector together with the env vars that receive the connector's
//! credentials. Credentials themselves are injected by the runtime.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::infrastructure::services::{ConnectorDetails, ConnectorDirectory, ConnectorType};
use crate::pipeline::node::{ExecutionNode, STEP_GROUP_SEPARATOR};
use crate::pipeline::steps::{StepKind, StepNode};
use crate::pipeline::{Resolved, StageExecutionError};

/// Credential field exposed by a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectorSecret {
    /// Registry user
    Username,
    /// Registry password
    Password,
    /// Registry host
    Registry,
    /// Service URL
    Url,
    /// AWS access key
    AccessKey,
    /// AWS secret key
    SecretKey,
    /// AWS role to assume
    AssumeRole,
    /// AWS external id
    ExternalId,
    /// GCP service account key
    JsonKey,
    /// Azure client id
    ClientId,
    /// Azure client secret
    ClientSecret,
    /// Azure tenant id
    TenantId,
    /// Azure client certificate
    ClientCertificate,
}

/// A connector and the env vars its credentials land in
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorBinding {
    /// Connector reference
    pub connector_ref: String,
    /// Env var name to credential field
    pub env_to_secret: BTreeMap<String, ConnectorSecret>,
}

fn env_map(entries: &[(&str, ConnectorSecret)]) -> BTreeMap<String, ConnectorSecret> {
    entries
        .iter()
        .map(|(name, secret)| ((*name).to_string(), *secret))
        .collect()
}

/// Credential env vars of a step kind's connector
#[must_use]
pub fn connector_secret_env_map(kind: StepKind) -> BTreeMap<String, ConnectorSecret> {
    use ConnectorSecret::{
        AccessKey, AssumeRole, ClientCertificate, ClientId, ClientSecret, ExternalId, JsonKey,
        Password, Registry, SecretKey, TenantId, Url, Username,
    };

    match kind {
        StepKind::Docker | StepKind::Security => env_map(&[
            ("PLUGIN_USERNAME", Username),
            ("PLUGIN_PASSW", Password),
            ("PLUGIN_REGISTRY", Registry),
        ]),
        StepKind::Ecr => env_map(&[
            ("PLUGIN_ACCESS_KEY", AccessKey),
            ("PLUGIN_SECRET_KEY", SecretKey),
            ("PLUGIN_ASSUME_ROLE", AssumeRole),
            ("PLUGIN_EXTERNAL_ID", ExternalId),
        ]),
        StepKind::SaveCacheS3 | StepKind::RestoreCacheS3 | StepKind::S3Upload => env_map(&[
            ("PLUGIN_ACCESS_KEY", AccessKey),
            ("PLUGIN_SECRET_KEY", SecretKey),
            ("PLUGIN_ASSUME_ROLE", AssumeRole),
        ]),
        StepKind::Acr => env_map(&[
            ("CLIENT_SECRET", ClientSecret),
            ("CLIENT_ID", ClientId),
            ("TENANT_ID", TenantId),
            ("CLIENT_CERTIFICATE", ClientCertificate),
        ]),
        StepKind::Gcr
        | StepKind::SaveCacheGcs
        | StepKind::RestoreCacheGcs
        | StepKind::GcsUpload => env_map(&[("PLUGIN_JSON_KEY", JsonKey)]),
        StepKind::ArtifactoryUpload => env_map(&[
            ("PLUGIN_URL", Url),
            ("PLUGIN_USERNAME", Username),
            ("PLUGIN_PASSW", Password),
        ]),
        _ => BTreeMap::new(),
    }
}

/// Credential env vars of the base image registry of a build step
#[must_use]
pub fn base_image_secret_env_map() -> BTreeMap<String, ConnectorSecret> {
    env_map(&[
        ("PLUGIN_BASE_IMAGE_USERNAME", ConnectorSecret::Username),
        ("PLUGIN_BASE_IMAGE_PASSWORD", ConnectorSecret::Password),
        ("PLUGIN_BASE_IMAGE_REGISTRY", ConnectorSecret::Registry),
    ])
}

/// Step kinds that cannot run without a connector
fn requires_connector(kind: StepKind) -> bool {
    kind.is_plugin_compatible() && kind != StepKind::Security
}

/// Looks up connectors and binds them to steps
pub struct ConnectorResolver<'a> {
    directory: &'a dyn ConnectorDirectory,
}

impl<'a> ConnectorResolver<'a> {
    /// Resolver backed by `directory`
    pub fn new(directory: &'a dyn ConnectorDirectory) -> Self {
        Self { directory }
    }

    /// Connector metadata for `connector_ref`.
    ///
    /// # Errors
    ///
    /// Returns [`StageExecutionError::Connector`] when the lookup fails.
    pub fn resolve(&self, connector_ref: &str) -> Result<ConnectorDetails, StageExecutionError> {
        self.directory
            .connector(connector_ref)
            .map_err(|e| StageExecutionError::Connector {
                connector_ref: connector_ref.to_string(),
                message: e.to_string(),
            })
    }

    /// Bindings of every plugin-compatible step, keyed by stage-unique
    /// step identifier.
    ///
    /// # Errors
    ///
    /// Fails on a missing mandatory connector, a failed lookup or a base
    /// image connector that is not a Docker registry.
    pub fn step_bindings(
        &self,
        nodes: &[ExecutionNode],
    ) -> Result<BTreeMap<String, Vec<ConnectorBinding>>, StageExecutionError> {
        let mut out = BTreeMap::new();
        for node in nodes {
            self.collect(node, "", &mut out)?;
        }
        Ok(out)
    }

    fn collect(
        &self,
        node: &ExecutionNode,
        prefix: &str,
        out: &mut BTreeMap<String, Vec<ConnectorBinding>>,
    ) -> Result<(), StageExecutionError> {
        match node {
            ExecutionNode::Step(step) => {
                let bindings = self.bindings_for(step)?;
                if !bindings.is_empty() {
                    out.insert(format!("{prefix}{}", step.identifier), bindings);
                }
            }
            ExecutionNode::Parallel(sections) => {
                for section in sections {
                    self.collect(section, prefix, out)?;
                }
            }
            ExecutionNode::StepGroup(group) => {
                let nested = format!("{prefix}{}{STEP_GROUP_SEPARATOR}", group.identifier);
                for child in &group.steps {
                    self.collect(child, &nested, out)?;
                }
            }
        }
        Ok(())
    }

    /// Bindings of a single step; empty for steps without connectors.
    ///
    /// # Errors
    ///
    /// See [`ConnectorResolver::step_bindings`].
    pub fn bindings_for(&self, step: &StepNode) -> Result<Vec<ConnectorBinding>, StageExecutionError> {
        let kind = step.kind();
        let Some(plugin) = step.spec.plugin_options() else {
            return Ok(Vec::new());
        };

        let connector_ref = match &plugin.connector_ref {
            Resolved::Literal(value) if !value.trim().is_empty() => value.clone(),
            Resolved::Absent | Resolved::Unresolved(_) | Resolved::Literal(_)
                if !requires_connector(kind) =>
            {
                return Ok(Vec::new());
            }
            _ => {
                return Err(StageExecutionError::UnresolvedMandatoryField {
                    field: "connectorRef".to_string(),
                    step_type: kind.type_name().to_string(),
                    identifier: step.identifier.clone(),
                });
            }
        };

        let mut bindings = vec![ConnectorBinding {
            connector_ref,
            env_to_secret: connector_secret_env_map(kind),
        }];

        let base_refs = step
            .spec
            .image_build_options()
            .and_then(|build| build.base_image_connector_refs.literal());
        if let Some(base_ref) = base_refs.and_then(|refs| refs.first()) {
            let details = self.resolve(base_ref)?;
            if details.connector_type != ConnectorType::DockerRegistry {
                return Err(StageExecutionError::UnexpectedBaseConnector {
                    connector_type: details.connector_type.to_string(),
                });
            }
            bindings.push(ConnectorBinding {
                connector_ref: base_ref.clone(),
                env_to_secret: base_image_secret_env_map(),
            });
        }
        Ok(bindings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::services::StaticConnectors;
    use crate::pipeline::node::StepGroup;
    use crate::pipeline::steps::{
        EcrBuildStep, ImageBuildOptions, PluginOptions, SecurityStep, StepSpec,
    };
    use pretty_assertions::assert_eq;

    fn ecr(id: &str, base: Vec<&str>) -> StepNode {
        StepNode::new(
            id,
            StepSpec::BuildAndPushEcr(EcrBuildStep {
                plugin: PluginOptions {
                    connector_ref: Resolved::Literal("account.aws".to_string()),
                    ..PluginOptions::default()
                },
                build: ImageBuildOptions {
                    base_image_connector_refs: Resolved::Literal(
                        base.into_iter().map(str::to_string).collect(),
                    ),
                    ..ImageBuildOptions::default()
                },
                ..EcrBuildStep::default()
            }),
        )
    }

    fn directory() -> StaticConnectors {
        StaticConnectors::new()
            .with(ConnectorDetails::new("account.dockerhub", ConnectorType::DockerRegistry))
            .with(ConnectorDetails::new("account.gcp", ConnectorType::Gcp))
    }

    #[test]
    fn test_ecr_with_base_image_connector() {
        let directory = directory();
        let resolver = ConnectorResolver::new(&directory);
        let nodes = vec![ExecutionNode::StepGroup(StepGroup::new(
            "sg",
            vec![ExecutionNode::Step(ecr("push", vec!["account.dockerhub"]))],
        ))];

        let bindings = resolver.step_bindings(&nodes).unwrap();
        let push = &bindings["sg_push"];
        assert_eq!(push.len(), 2);
        assert_eq!(push[0].connector_ref, "account.aws");
        assert_eq!(
            push[0].env_to_secret["PLUGIN_ACCESS_KEY"],
            ConnectorSecret::AccessKey
        );
        assert_eq!(push[1].connector_ref, "account.dockerhub");
        assert!(push[1].env_to_secret.contains_key("PLUGIN_BASE_IMAGE_PASSWORD"));
    }

    #[test]
    fn test_non_docker_base_connector_rejected() {
        let directory = directory();
        let resolver = ConnectorResolver::new(&directory);
        let err = resolver.bindings_for(&ecr("push", vec!["account.gcp"])).unwrap_err();
        assert_eq!(err.to_string(), "Unexpected base connector: Gcp");
    }

    #[test]
    fn test_missing_connector_ref() {
        let directory = directory();
        let resolver = ConnectorResolver::new(&directory);
        let mut step = ecr("push", vec![]);
        let StepSpec::BuildAndPushEcr(spec) = &mut step.spec else {
            unreachable!()
        };
        spec.plugin.connector_ref = Resolved::Absent;

        let err = resolver.bindings_for(&step).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Failed to resolve mandatory field connectorRef in step type BuildAndPushECR with identifier push"
        );
    }

    #[test]
    fn test_security_step_connector_is_optional() {
        let directory = directory();
        let resolver = ConnectorResolver::new(&directory);
        for connector_ref in [
            Resolved::Absent,
            Resolved::Unresolved("<+pipeline.variables.scanner>".to_string()),
        ] {
            let step = StepNode::new(
                "scan",
                StepSpec::Security(SecurityStep {
                    plugin: PluginOptions {
                        connector_ref,
                        ..PluginOptions::default()
                    },
                    ..SecurityStep::default()
                }),
            );
            assert!(resolver.bindings_for(&step).unwrap().is_empty());
        }
    }

    #[test]
    fn test_run_steps_have_no_bindings() {
        let directory = directory();
        let resolver = ConnectorResolver::new(&directory);
        let nodes = vec![crate::pipeline::node::tests::run("a")];
        assert!(resolver.step_bindings(&nodes).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_connector() {
        let directory = directory();
        let resolver = ConnectorResolver::new(&directory);
        assert!(matches!(
            resolver.resolve("account.missing"),
            Err(StageExecutionError::Connector { .. })
        ));
    }
}
