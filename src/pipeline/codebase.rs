//! Codebase configuration, triggers and execution sources

#![allow(clippy::must_use_candidate)]

use serde::{Deserialize, Serialize};
use std::fmt;

use super::resolved::Resolved;
use super::steps::ContainerResource;

/// What the codebase build points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec", rename_all = "lowercase")]
pub enum Build {
    /// A branch
    Branch {
        /// Branch name
        branch: Resolved<String>,
    },
    /// A tag
    Tag {
        /// Tag name
        tag: Resolved<String>,
    },
    /// A pull request
    #[serde(rename = "PR")]
    PullRequest {
        /// Pull request number
        number: Resolved<String>,
    },
}

impl Build {
    /// Branch, tag or PR number as written
    pub fn value(&self) -> &Resolved<String> {
        match self {
            Self::Branch { branch } => branch,
            Self::Tag { tag } => tag,
            Self::PullRequest { number } => number,
        }
    }
}

/// How pull requests are checked out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrCloneStrategy {
    /// Merge the PR into the target branch
    MergeCommit,
    /// Check out the source branch as is
    SourceBranch,
}

impl fmt::Display for PrCloneStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MergeCommit => write!(f, "MergeCommit"),
            Self::SourceBranch => write!(f, "SourceBranch"),
        }
    }
}

/// Pipeline-level codebase
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CodeBase {
    /// Git connector
    pub connector_ref: String,
    /// Repository name for account-level connectors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repo_name: Option<String>,
    /// What to build
    #[serde(skip_serializing_if = "Resolved::is_absent")]
    pub build: Resolved<Build>,
    /// Clone depth
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    /// Verify TLS certificates
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_verify: Option<bool>,
    /// PR checkout strategy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_clone_strategy: Option<PrCloneStrategy>,
    /// Limits for the clone container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<ContainerResource>,
}

/// Expressions that only resolve from a webhook payload
const TRIGGER_EXPRESSIONS: [&str; 3] = ["<+trigger.branch>", "<+trigger.prNumber>", "<+trigger.tag>"];

impl CodeBase {
    /// True when the build targets a fixed ref rather than the triggering event.
    pub fn should_clone_manually(&self) -> bool {
        let value = match &self.build {
            Resolved::Literal(build) => build.value(),
            Resolved::Unresolved(_) | Resolved::Absent => return false,
        };
        match value {
            Resolved::Literal(v) => !v.trim().is_empty(),
            Resolved::Unresolved(expr) => !TRIGGER_EXPRESSIONS.contains(&expr.as_str()),
            Resolved::Absent => false,
        }
    }
}

/// Trigger that started the execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerType {
    /// Started from the UI or API
    Manual,
    /// Cron schedule
    SchedulerCron,
    /// SCM webhook
    Webhook,
    /// Custom webhook
    WebhookCustom,
    /// Artifact trigger
    Artifact,
    /// Manifest trigger
    Manifest,
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Manual => "MANUAL",
            Self::SchedulerCron => "SCHEDULER_CRON",
            Self::Webhook => "WEBHOOK",
            Self::WebhookCustom => "WEBHOOK_CUSTOM",
            Self::Artifact => "ARTIFACT",
            Self::Manifest => "MANIFEST",
        };
        f.write_str(name)
    }
}

/// Trigger metadata of the execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInfo {
    /// Trigger of this run
    pub trigger_type: TriggerType,
    /// This run re-executes an earlier one
    #[serde(default)]
    pub is_rerun: bool,
    /// Trigger of the original run, for reruns
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_trigger_type: Option<TriggerType>,
}

impl TriggerInfo {
    /// Trigger of a first run.
    pub fn new(trigger_type: TriggerType) -> Self {
        Self {
            trigger_type,
            is_rerun: false,
            root_trigger_type: None,
        }
    }

    /// Trigger deciding the execution source
    pub fn effective_type(&self) -> TriggerType {
        if self.is_rerun {
            self.root_trigger_type.unwrap_or(self.trigger_type)
        } else {
            self.trigger_type
        }
    }
}

/// SCM provider of a webhook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GitProvider {
    /// GitHub
    #[default]
    Github,
    /// GitLab
    Gitlab,
    /// Bitbucket Cloud
    BitbucketCloud,
    /// Bitbucket Server
    BitbucketServer,
    /// Azure Repos
    AzureRepos,
}

/// Repository described by a webhook
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Repository {
    /// Repository name
    pub name: String,
    /// Owner or namespace
    pub namespace: String,
    /// `namespace/name`
    pub slug: String,
    /// Web link
    pub link: String,
    /// Default branch
    pub branch: String,
    /// HTTP clone URL
    pub http_url: String,
    /// SSH clone URL
    pub ssh_url: String,
    /// Private repository
    pub private: bool,
}

/// Commit and author data common to every webhook event
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WebhookBaseAttributes {
    /// Commit message
    pub message: String,
    /// Commit link
    pub link: String,
    /// Commit before the event
    pub before: String,
    /// Commit after the event
    pub after: String,
    /// Git ref
    #[serde(rename = "ref")]
    pub git_ref: String,
    /// Source branch
    pub source: String,
    /// Target branch
    pub target: String,
    /// Author login
    pub author_login: String,
    /// Author name
    pub author_name: String,
    /// Author email
    pub author_email: String,
    /// Author avatar URL
    pub author_avatar: String,
}

/// Event carried by a webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WebhookEvent {
    /// Push to a branch
    #[serde(rename_all = "camelCase")]
    Branch {
        /// Branch name
        branch_name: String,
        /// Branch link
        #[serde(default)]
        link: String,
        /// Repository
        repository: Repository,
        /// Commit data
        #[serde(default)]
        base_attributes: WebhookBaseAttributes,
    },
    /// Pull request event
    #[serde(rename = "PR", rename_all = "camelCase")]
    PullRequest {
        /// Pull request number
        pull_request_id: u64,
        /// Pull request link
        #[serde(default)]
        pull_request_link: String,
        /// Pull request title
        #[serde(default)]
        title: String,
        /// Source branch
        source_branch: String,
        /// Target branch
        target_branch: String,
        /// Repository
        repository: Repository,
        /// Commit data
        #[serde(default)]
        base_attributes: WebhookBaseAttributes,
    },
    /// Release event
    #[serde(rename_all = "camelCase")]
    Release {
        /// Release tag
        tag: String,
        /// Repository
        repository: Repository,
        /// Commit data
        #[serde(default)]
        base_attributes: WebhookBaseAttributes,
    },
}

impl WebhookEvent {
    /// Repository of the event
    pub fn repository(&self) -> &Repository {
        match self {
            Self::Branch { repository, .. }
            | Self::PullRequest { repository, .. }
            | Self::Release { repository, .. } => repository,
        }
    }

    /// Commit data of the event
    pub fn base_attributes(&self) -> &WebhookBaseAttributes {
        match self {
            Self::Branch {
                base_attributes, ..
            }
            | Self::PullRequest {
                base_attributes, ..
            }
            | Self::Release {
                base_attributes, ..
            } => base_attributes,
        }
    }
}

/// Execution source from an SCM webhook
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookExecutionSource {
    /// SCM provider
    #[serde(default)]
    pub provider: GitProvider,
    /// Parsed event
    pub event: WebhookEvent,
}

/// Fixed ref chosen by a user, schedule or custom webhook
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ManualExecutionSource {
    /// Branch to build
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    /// Tag to build
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    /// Pull request to build
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<String>,
}

/// Source of the code being built
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec")]
pub enum ExecutionSource {
    /// Manual or scheduled
    Manual(ManualExecutionSource),
    /// Webhook
    Webhook(WebhookExecutionSource),
    /// Custom webhook
    Custom(ManualExecutionSource),
}

/// Arguments describing the build number and code source
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionArgs {
    /// Build number
    pub run_sequence: String,
    /// Code source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_source: Option<ExecutionSource>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn branch_codebase(value: Resolved<String>) -> CodeBase {
        CodeBase {
            connector_ref: "account.github".to_string(),
            build: Resolved::Literal(Build::Branch { branch: value }),
            ..CodeBase::default()
        }
    }

    #[rstest]
    #[case(Resolved::Literal("main".to_string()), true)]
    #[case(Resolved::Literal("  ".to_string()), false)]
    #[case(Resolved::Unresolved("<+trigger.branch>".to_string()), false)]
    #[case(Resolved::Unresolved("<+pipeline.variables.branch>".to_string()), true)]
    #[case(Resolved::Absent, false)]
    fn test_should_clone_manually(#[case] value: Resolved<String>, #[case] expected: bool) {
        assert_eq!(branch_codebase(value).should_clone_manually(), expected);
    }

    #[test]
    fn test_build_deserialize() {
        let build: Build = serde_yaml::from_str("type: PR\nspec:\n  number: \"42\"\n").unwrap();
        assert_eq!(
            build,
            Build::PullRequest {
                number: Resolved::Literal("42".to_string())
            }
        );
        let build: Build = serde_yaml::from_str("type: tag\nspec:\n  tag: v1\n").unwrap();
        assert!(matches!(build, Build::Tag { .. }));
    }

    #[test]
    fn test_rerun_uses_root_trigger() {
        let info = TriggerInfo {
            trigger_type: TriggerType::Manual,
            is_rerun: true,
            root_trigger_type: Some(TriggerType::Webhook),
        };
        assert_eq!(info.effective_type(), TriggerType::Webhook);
        assert_eq!(TriggerInfo::new(TriggerType::Manual).effective_type(), TriggerType::Manual);
    }
}
