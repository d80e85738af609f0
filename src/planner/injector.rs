//! Implicit steps around the user's execution
//!
//! Depending on stage policy the planner clones the codebase before the
//! user's steps and wraps them with cache restore and save steps.

use std::collections::BTreeMap;

use super::plugin_settings::{DEFAULT_CLONE_DEPTH, STEP_MOUNT_PATH};
use crate::pipeline::codebase::{CodeBase, ExecutionSource};
use crate::pipeline::node::ExecutionNode;
use crate::pipeline::steps::{
    ContainerOptions, FailureStrategy, GitCloneStep, PluginOptions, PluginStep, StepNode, StepSpec,
};
use crate::pipeline::{IntegrationStage, OsType, Resolved, StageExecutionError};

/// Identifier of the injected clone step
pub const GIT_CLONE_STEP_ID: &str = "harness-git-clone";
/// Identifier of the injected cache restore step
pub const RESTORE_CACHE_STEP_ID: &str = "restore-cache-harness";
/// Identifier of the injected cache save step
pub const SAVE_CACHE_STEP_ID: &str = "save-cache-harness";

const GIT_CLONE_STEP_NAME: &str = "Git Clone";
const RESTORE_CACHE_STEP_NAME: &str = "Restore Cache";
const SAVE_CACHE_STEP_NAME: &str = "Save Cache";

const LINUX_CLONE_ENTRYPOINT: &str = "/usr/local/bin/clone";
const WINDOWS_CLONE_ENTRYPOINT: &str = "C:\\bin\\clone.exe";

/// Stage facts the injection decision depends on
#[derive(Debug, Clone, Copy)]
pub struct InjectionPolicy<'a> {
    /// Account running the build
    pub account_id: &'a str,
    /// Build OS
    pub os: OsType,
    /// Infra is hosted VM or hosted Kubernetes
    pub hosted: bool,
    /// Cache intelligence flag of the account
    pub cache_intelligence: bool,
    /// Cache intelligence plugin image
    pub cache_image: &'a str,
}

/// Builds the combined step list of a stage
#[derive(Debug, Clone, Copy)]
pub struct ImplicitStepInjector<'a> {
    policy: InjectionPolicy<'a>,
}

impl<'a> ImplicitStepInjector<'a> {
    /// Injector applying `policy`
    #[must_use]
    pub fn new(policy: InjectionPolicy<'a>) -> Self {
        Self { policy }
    }

    /// Returns `[GitClone?, RestoreCache?, ...user steps, SaveCache?]`.
    ///
    /// # Errors
    ///
    /// Fails when cloning is enabled but the pipeline has no codebase.
    pub fn inject(
        &self,
        stage: &IntegrationStage,
        codebase: Option<&CodeBase>,
        source: Option<&ExecutionSource>,
    ) -> Result<Vec<ExecutionNode>, StageExecutionError> {
        let mut steps = Vec::with_capacity(stage.execution.steps.len() + 3);

        if stage.clone_codebase {
            let codebase = codebase.ok_or_else(|| {
                StageExecutionError::configuration(
                    "CI codebase configuration is missing. Codebase is required to fetch code",
                )
            })?;
            steps.push(ExecutionNode::Step(self.git_clone_step(codebase, source)));
            tracing::debug!(stage = %stage.identifier, "Injected git clone step");
        }

        let cache = self.cache_intelligence(stage);
        if cache {
            steps.push(ExecutionNode::Step(self.cache_step(stage, false)));
        }
        steps.extend(stage.execution.steps.iter().cloned());
        if cache {
            steps.push(ExecutionNode::Step(self.cache_step(stage, true)));
            tracing::debug!(stage = %stage.identifier, "Injected cache intelligence steps");
        }
        Ok(steps)
    }

    fn cache_intelligence(&self, stage: &IntegrationStage) -> bool {
        stage.caching_enabled() && self.policy.cache_intelligence && self.policy.hosted
    }

    fn git_clone_step(&self, codebase: &CodeBase, source: Option<&ExecutionSource>) -> StepNode {
        let depth = match codebase.depth {
            Some(depth) => depth,
            None if targets_fixed_ref(source) => DEFAULT_CLONE_DEPTH,
            None => 0,
        };
        let entrypoint = if self.policy.os.is_windows() {
            WINDOWS_CLONE_ENTRYPOINT
        } else {
            LINUX_CLONE_ENTRYPOINT
        };

        let clone = GitCloneStep {
            plugin: PluginOptions {
                connector_ref: Resolved::Literal(codebase.connector_ref.clone()),
                resources: codebase.resources.clone(),
                ..PluginOptions::default()
            },
            repo_name: codebase.repo_name.clone().map_or(Resolved::Absent, Resolved::Literal),
            build: codebase.build.clone(),
            clone_directory: Resolved::Literal(STEP_MOUNT_PATH.to_string()),
            depth: Resolved::Literal(depth),
            ssl_verify: codebase.ssl_verify.map_or(Resolved::Absent, Resolved::Literal),
            pr_clone_strategy: codebase.pr_clone_strategy,
            entrypoint: vec![entrypoint.to_string()],
        };
        StepNode::new(GIT_CLONE_STEP_ID, StepSpec::GitClone(clone)).with_name(GIT_CLONE_STEP_NAME)
    }

    fn cache_step(&self, stage: &IntegrationStage, save: bool) -> StepNode {
        let mut env = BTreeMap::from([
            ("PLUGIN_AUTO_DETECT".to_string(), "true".to_string()),
            (
                "PLUGIN_AUTO_CACHE_ACCOUNT_ID".to_string(),
                self.policy.account_id.to_string(),
            ),
        ]);
        if let Some(caching) = &stage.caching {
            if let Some(key) = caching.key.as_deref().filter(|k| !k.trim().is_empty()) {
                env.insert("PLUGIN_CACHE_KEY".to_string(), key.to_string());
            }
            if !caching.paths.is_empty() {
                env.insert("PLUGIN_MOUNT".to_string(), caching.paths.join(","));
            }
        }
        if save {
            env.insert("PLUGIN_REBUILD".to_string(), "true".to_string());
            env.insert("PLUGIN_EXIT_CODE".to_string(), "true".to_string());
        } else {
            env.insert("PLUGIN_RESTORE".to_string(), "true".to_string());
        }

        let plugin = PluginStep {
            container: ContainerOptions {
                image: Resolved::Literal(self.policy.cache_image.to_string()),
                env_variables: Resolved::Literal(env),
                ..ContainerOptions::default()
            },
            entrypoint: Resolved::Absent,
            harness_managed_image: true,
        };
        let (identifier, name) = if save {
            (SAVE_CACHE_STEP_ID, SAVE_CACHE_STEP_NAME)
        } else {
            (RESTORE_CACHE_STEP_ID, RESTORE_CACHE_STEP_NAME)
        };
        let mut step = StepNode::new(identifier, StepSpec::Plugin(plugin)).with_name(name);
        if save {
            step.failure_strategy = Some(FailureStrategy::IgnoreAll);
        }
        step
    }
}

/// Manual runs pinned to a branch or tag clone shallowly
fn targets_fixed_ref(source: Option<&ExecutionSource>) -> bool {
    match source {
        Some(ExecutionSource::Manual(manual)) => manual.branch.is_some() || manual.tag.is_some(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::codebase::{Build, ManualExecutionSource};
    use crate::pipeline::node::tests::run;
    use crate::pipeline::stage::Caching;
    use crate::pipeline::steps::StepKind;
    use pretty_assertions::assert_eq;

    fn policy(hosted: bool, cache_intelligence: bool) -> InjectionPolicy<'static> {
        InjectionPolicy {
            account_id: "acc",
            os: OsType::Linux,
            hosted,
            cache_intelligence,
            cache_image: "plugins/cache:1.6.2",
        }
    }

    fn codebase() -> CodeBase {
        CodeBase {
            connector_ref: "account.github".to_string(),
            repo_name: Some("app".to_string()),
            build: Resolved::Literal(Build::Branch {
                branch: Resolved::Literal("main".to_string()),
            }),
            ..CodeBase::default()
        }
    }

    fn caching_stage() -> IntegrationStage {
        IntegrationStage::new("build", vec![run("a"), run("b")])
            .with_clone_codebase(true)
            .with_caching(Caching {
                enabled: true,
                key: Some("cache-<+input>".to_string()),
                paths: vec!["/root/.m2".to_string(), "node_modules".to_string()],
            })
    }

    fn identifiers(nodes: &[ExecutionNode]) -> Vec<String> {
        crate::pipeline::node::step_identifiers(nodes)
    }

    #[test]
    fn test_full_injection_order() {
        let injector = ImplicitStepInjector::new(policy(true, true));
        let steps = injector
            .inject(&caching_stage(), Some(&codebase()), None)
            .unwrap();

        assert_eq!(
            identifiers(&steps),
            vec![GIT_CLONE_STEP_ID, RESTORE_CACHE_STEP_ID, "a", "b", SAVE_CACHE_STEP_ID]
        );
        let save = steps.last().and_then(ExecutionNode::as_step).unwrap();
        assert_eq!(save.failure_strategy, Some(FailureStrategy::IgnoreAll));
        let env = save.spec.container_options().unwrap().env_variables.literal().unwrap();
        assert_eq!(env["PLUGIN_MOUNT"], "/root/.m2,node_modules");
        assert_eq!(env["PLUGIN_AUTO_CACHE_ACCOUNT_ID"], "acc");
        assert_eq!(env["PLUGIN_CACHE_KEY"], "cache-<+input>");

        let restore = steps[1].as_step().unwrap();
        assert_eq!(restore.kind(), StepKind::Plugin);
        assert!(restore.failure_strategy.is_none());
    }

    #[test]
    fn test_no_cache_steps_on_self_hosted_infra() {
        let injector = ImplicitStepInjector::new(policy(false, true));
        let steps = injector
            .inject(&caching_stage(), Some(&codebase()), None)
            .unwrap();
        assert_eq!(identifiers(&steps), vec![GIT_CLONE_STEP_ID, "a", "b"]);
    }

    #[test]
    fn test_no_cache_steps_without_flag() {
        let injector = ImplicitStepInjector::new(policy(true, false));
        let stage = caching_stage().with_clone_codebase(false);
        let steps = injector.inject(&stage, None, None).unwrap();
        assert_eq!(identifiers(&steps), vec!["a", "b"]);
    }

    #[test]
    fn test_clone_without_codebase_rejected() {
        let injector = ImplicitStepInjector::new(policy(false, false));
        assert!(injector.inject(&caching_stage(), None, None).is_err());
    }

    #[test]
    fn test_clone_depth() {
        let injector = ImplicitStepInjector::new(policy(false, false));
        let stage = IntegrationStage::new("build", vec![]).with_clone_codebase(true);
        let depth_of = |source: Option<&ExecutionSource>, codebase: &CodeBase| {
            let steps = injector.inject(&stage, Some(codebase), source).unwrap();
            let StepSpec::GitClone(clone) = &steps[0].as_step().unwrap().spec else {
                unreachable!()
            };
            clone.depth.clone()
        };

        let manual = ExecutionSource::Manual(ManualExecutionSource {
            tag: Some("v1".to_string()),
            ..ManualExecutionSource::default()
        });
        assert_eq!(depth_of(Some(&manual), &codebase()), Resolved::Literal(50));
        assert_eq!(depth_of(None, &codebase()), Resolved::Literal(0));

        let pinned = CodeBase {
            depth: Some(5),
            ..codebase()
        };
        assert_eq!(depth_of(Some(&manual), &pinned), Resolved::Literal(5));
    }

    #[test]
    fn test_windows_clone_entrypoint() {
        let injector = ImplicitStepInjector::new(InjectionPolicy {
            os: OsType::Windows,
            ..policy(false, false)
        });
        let stage = IntegrationStage::new("build", vec![]).with_clone_codebase(true);
        let steps = injector.inject(&stage, Some(&codebase()), None).unwrap();
        let StepSpec::GitClone(clone) = &steps[0].as_step().unwrap().spec else {
            unreachable!()
        };
        assert_eq!(clone.entrypoint, vec![WINDOWS_CLONE_ENTRYPOINT]);
        assert_eq!(clone.clone_directory, Resolved::Literal("/harness".to_string()));
    }
}
