//! Build metadata environment
//!
//! Steps see the code being built through Drone-compatible variables
//! (`DRONE_BRANCH`, `DRONE_COMMIT_SHA`, ...) derived from the execution
//! source. Steps running under a looping strategy also receive their
//! iteration indexes.

use std::collections::BTreeMap;

use crate::pipeline::codebase::{
    ExecutionArgs, ExecutionSource, GitProvider, ManualExecutionSource, WebhookBaseAttributes,
    WebhookEvent, WebhookExecutionSource,
};
use crate::pipeline::node::ExecutionNode;
use crate::pipeline::resolved::Resolved;

/// Longest env value accepted on every platform
pub const MAX_ENV_VALUE_LEN: usize = 8191;

const ELLIPSIS: &str = "...";

/// Iteration variables of strategy steps and the expressions they render from
pub const LOOP_ENV_VARS: [(&str, &str); 6] = [
    ("HARNESS_STAGE_INDEX", "<+stage.iteration>"),
    ("HARNESS_STAGE_TOTAL", "<+stage.iterations>"),
    ("HARNESS_STEP_INDEX", "<+step.iteration>"),
    ("HARNESS_STEP_TOTAL", "<+step.iterations>"),
    ("HARNESS_NODE_INDEX", "<+strategy.iteration>"),
    ("HARNESS_NODE_TOTAL", "<+strategy.iterations>"),
];

/// Shortens `value` to at most [`MAX_ENV_VALUE_LEN`] characters.
#[must_use]
pub fn abbreviate(value: &str) -> String {
    if value.chars().count() <= MAX_ENV_VALUE_LEN {
        return value.to_string();
    }
    let mut out: String = value
        .chars()
        .take(MAX_ENV_VALUE_LEN - ELLIPSIS.len())
        .collect();
    out.push_str(ELLIPSIS);
    out
}

fn insert_non_empty(env: &mut BTreeMap<String, String>, key: &str, value: &str) {
    if !value.is_empty() {
        env.insert(key.to_string(), value.to_string());
    }
}

/// Build metadata env vars for `args`.
#[must_use]
pub fn build_environment(args: &ExecutionArgs) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    insert_non_empty(&mut env, "DRONE_BUILD_NUMBER", &args.run_sequence);

    match &args.execution_source {
        Some(ExecutionSource::Manual(manual) | ExecutionSource::Custom(manual)) => {
            manual_environment(manual, &mut env);
        }
        Some(ExecutionSource::Webhook(webhook)) => webhook_environment(webhook, &mut env),
        None => {}
    }
    env
}

// Branch builds carry no build event.
fn manual_environment(source: &ManualExecutionSource, env: &mut BTreeMap<String, String>) {
    if let Some(branch) = source.branch.as_deref() {
        insert_non_empty(env, "DRONE_COMMIT_BRANCH", branch);
    }
    if let Some(tag) = source.tag.as_deref().filter(|t| !t.is_empty()) {
        env.insert("DRONE_TAG".to_string(), tag.to_string());
        env.insert("DRONE_BUILD_EVENT".to_string(), "tag".to_string());
    }
    if let Some(number) = source.pr_number.as_deref().filter(|n| !n.is_empty()) {
        env.insert("DRONE_PULL_REQUEST".to_string(), number.to_string());
        env.insert("DRONE_BUILD_EVENT".to_string(), "pull_request".to_string());
    }
}

fn webhook_environment(source: &WebhookExecutionSource, env: &mut BTreeMap<String, String>) {
    let repository = source.event.repository();
    env.insert("DRONE_REPO_SCM".to_string(), "git".to_string());
    insert_non_empty(env, "DRONE_REPO", &repository.slug);
    insert_non_empty(env, "DRONE_REPO_OWNER", &repository.namespace);
    insert_non_empty(env, "DRONE_REPO_NAMESPACE", &repository.namespace);
    insert_non_empty(env, "DRONE_REPO_NAME", &repository.name);
    insert_non_empty(env, "DRONE_REPO_LINK", &repository.link);
    insert_non_empty(env, "DRONE_REPO_BRANCH", &repository.branch);
    insert_non_empty(env, "DRONE_GIT_HTTP_URL", &repository.http_url);
    insert_non_empty(env, "DRONE_GIT_SSH_URL", &repository.ssh_url);
    env.insert(
        "DRONE_REPO_PRIVATE".to_string(),
        repository.private.to_string(),
    );

    commit_environment(source.event.base_attributes(), env);

    match &source.event {
        WebhookEvent::Branch { branch_name, .. } => {
            env.insert("DRONE_BUILD_EVENT".to_string(), "push".to_string());
            insert_non_empty(env, "DRONE_BRANCH", branch_name);
            insert_non_empty(env, "DRONE_COMMIT_BRANCH", branch_name);
        }
        WebhookEvent::PullRequest {
            pull_request_id,
            pull_request_link,
            title,
            source_branch,
            target_branch,
            ..
        } => {
            env.insert("DRONE_BUILD_EVENT".to_string(), "pull_request".to_string());
            env.insert(
                "DRONE_PULL_REQUEST".to_string(),
                pull_request_id.to_string(),
            );
            insert_non_empty(env, "DRONE_PULL_REQUEST_TITLE", &abbreviate(title));
            insert_non_empty(env, "DRONE_SOURCE_BRANCH", source_branch);
            insert_non_empty(env, "DRONE_TARGET_BRANCH", target_branch);
            insert_non_empty(env, "DRONE_BRANCH", target_branch);
            insert_non_empty(env, "DRONE_COMMIT_BRANCH", target_branch);
            insert_non_empty(env, "DRONE_COMMIT_LINK", pull_request_link);
            if source.provider == GitProvider::BitbucketCloud {
                env.insert(
                    "DRONE_COMMIT_REF".to_string(),
                    format!("+refs/heads/{source_branch}"),
                );
            }
        }
        WebhookEvent::Release { tag, .. } => {
            env.insert("DRONE_BUILD_EVENT".to_string(), "release".to_string());
            insert_non_empty(env, "DRONE_TAG", tag);
        }
    }
}

fn commit_environment(commit: &WebhookBaseAttributes, env: &mut BTreeMap<String, String>) {
    insert_non_empty(env, "DRONE_COMMIT", &commit.after);
    insert_non_empty(env, "DRONE_COMMIT_SHA", &commit.after);
    insert_non_empty(env, "DRONE_COMMIT_BEFORE", &commit.before);
    insert_non_empty(env, "DRONE_COMMIT_AFTER", &commit.after);
    insert_non_empty(env, "DRONE_COMMIT_REF", &commit.git_ref);
    insert_non_empty(env, "DRONE_COMMIT_LINK", &commit.link);
    insert_non_empty(env, "DRONE_COMMIT_MESSAGE", &abbreviate(&commit.message));
    insert_non_empty(env, "DRONE_COMMIT_AUTHOR", &commit.author_login);
    insert_non_empty(env, "DRONE_COMMIT_AUTHOR_NAME", &commit.author_name);
    insert_non_empty(env, "DRONE_COMMIT_AUTHOR_EMAIL", &commit.author_email);
    insert_non_empty(env, "DRONE_COMMIT_AUTHOR_AVATAR", &commit.author_avatar);
}

/// Adds the iteration variables to every step declaring a strategy.
pub fn inject_loop_env_vars(nodes: &mut [ExecutionNode]) {
    for node in nodes {
        match node {
            ExecutionNode::Step(step) => {
                if step.strategy.is_none() {
                    continue;
                }
                let identifier = step.identifier.clone();
                let Some(env) = step.spec.env_variables_mut() else {
                    continue;
                };
                match env {
                    Resolved::Literal(map) => upsert_loop_vars(map),
                    Resolved::Absent => {
                        let mut map = BTreeMap::new();
                        upsert_loop_vars(&mut map);
                        *env = Resolved::Literal(map);
                    }
                    Resolved::Unresolved(_) => {
                        tracing::debug!(step = %identifier, "Env map is an expression, loop variables skipped");
                    }
                }
            }
            ExecutionNode::Parallel(sections) => inject_loop_env_vars(sections),
            ExecutionNode::StepGroup(group) => inject_loop_env_vars(&mut group.steps),
        }
    }
}

fn upsert_loop_vars(env: &mut BTreeMap<String, String>) {
    for (name, expression) in LOOP_ENV_VARS {
        env.insert(name.to_string(), expression.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::codebase::Repository;
    use crate::pipeline::node::StepGroup;
    use crate::pipeline::node::tests::run;
    use crate::pipeline::steps::StrategyConfig;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn manual(branch: Option<&str>, tag: Option<&str>, pr: Option<&str>) -> ExecutionArgs {
        ExecutionArgs {
            run_sequence: "7".to_string(),
            execution_source: Some(ExecutionSource::Manual(ManualExecutionSource {
                branch: branch.map(str::to_string),
                tag: tag.map(str::to_string),
                pr_number: pr.map(str::to_string),
            })),
        }
    }

    fn env_of(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[rstest]
    #[case(manual(Some("main"), None, None), &[("DRONE_BUILD_NUMBER", "7"), ("DRONE_COMMIT_BRANCH", "main")])]
    #[case(
        manual(None, Some("v1.2.3"), None),
        &[("DRONE_BUILD_EVENT", "tag"), ("DRONE_BUILD_NUMBER", "7"), ("DRONE_TAG", "v1.2.3")]
    )]
    #[case(
        manual(None, None, Some("42")),
        &[("DRONE_BUILD_EVENT", "pull_request"), ("DRONE_BUILD_NUMBER", "7"), ("DRONE_PULL_REQUEST", "42")]
    )]
    fn test_manual_build_environment(
        #[case] args: ExecutionArgs,
        #[case] expected: &[(&str, &str)],
    ) {
        assert_eq!(build_environment(&args), env_of(expected));
    }

    fn repository() -> Repository {
        Repository {
            name: "app".to_string(),
            namespace: "acme".to_string(),
            slug: "acme/app".to_string(),
            link: "https://bitbucket.org/acme/app".to_string(),
            branch: "main".to_string(),
            http_url: "https://bitbucket.org/acme/app.git".to_string(),
            ssh_url: "git@bitbucket.org:acme/app.git".to_string(),
            private: true,
        }
    }

    #[test]
    fn test_bitbucket_cloud_pr_overrides_commit_ref() {
        let args = ExecutionArgs {
            run_sequence: "3".to_string(),
            execution_source: Some(ExecutionSource::Webhook(WebhookExecutionSource {
                provider: GitProvider::BitbucketCloud,
                event: WebhookEvent::PullRequest {
                    pull_request_id: 12,
                    pull_request_link: String::new(),
                    title: "Add feature".to_string(),
                    source_branch: "feature".to_string(),
                    target_branch: "main".to_string(),
                    repository: repository(),
                    base_attributes: WebhookBaseAttributes {
                        after: "abc123".to_string(),
                        git_ref: "refs/pull-requests/12/from".to_string(),
                        ..WebhookBaseAttributes::default()
                    },
                },
            })),
        };
        let env = build_environment(&args);

        assert_eq!(env["DRONE_BUILD_EVENT"], "pull_request");
        assert_eq!(env["DRONE_COMMIT_REF"], "+refs/heads/feature");
        assert_eq!(env["DRONE_SOURCE_BRANCH"], "feature");
        assert_eq!(env["DRONE_TARGET_BRANCH"], "main");
        assert_eq!(env["DRONE_COMMIT_SHA"], "abc123");
        assert_eq!(env["DRONE_REPO"], "acme/app");
        assert_eq!(env["DRONE_REPO_SCM"], "git");
        assert_eq!(env["DRONE_REPO_PRIVATE"], "true");
    }

    #[test]
    fn test_push_event() {
        let args = ExecutionArgs {
            run_sequence: "1".to_string(),
            execution_source: Some(ExecutionSource::Webhook(WebhookExecutionSource {
                provider: GitProvider::Github,
                event: WebhookEvent::Branch {
                    branch_name: "develop".to_string(),
                    link: String::new(),
                    repository: repository(),
                    base_attributes: WebhookBaseAttributes {
                        git_ref: "refs/heads/develop".to_string(),
                        message: "fix".to_string(),
                        ..WebhookBaseAttributes::default()
                    },
                },
            })),
        };
        let env = build_environment(&args);

        assert_eq!(env["DRONE_BUILD_EVENT"], "push");
        assert_eq!(env["DRONE_BRANCH"], "develop");
        assert_eq!(env["DRONE_COMMIT_REF"], "refs/heads/develop");
        assert_eq!(env["DRONE_COMMIT_MESSAGE"], "fix");
        assert!(!env.contains_key("DRONE_COMMIT_SHA"));
    }

    #[test]
    fn test_abbreviate_long_message() {
        let message = "x".repeat(MAX_ENV_VALUE_LEN + 100);
        let short = abbreviate(&message);
        assert_eq!(short.chars().count(), MAX_ENV_VALUE_LEN);
        assert!(short.ends_with("..."));
        assert_eq!(abbreviate("short"), "short");
    }

    #[test]
    fn test_loop_env_vars_reach_nested_strategy_steps() {
        let ExecutionNode::Step(mut looped) = run("looped") else {
            unreachable!()
        };
        looped.strategy = Some(StrategyConfig {
            parallelism: Some(3),
            ..StrategyConfig::default()
        });
        let mut nodes = vec![
            run("plain"),
            ExecutionNode::StepGroup(StepGroup::new(
                "sg",
                vec![ExecutionNode::Parallel(vec![ExecutionNode::Step(looped)])],
            )),
        ];

        inject_loop_env_vars(&mut nodes);

        let steps = crate::pipeline::node::all_steps(&nodes);
        let plain = steps[0].spec.container_options().unwrap();
        assert!(plain.env_variables.is_absent());
        let looped = steps[1].spec.container_options().unwrap();
        let env = looped.env_variables.literal().unwrap();
        assert_eq!(env["HARNESS_NODE_INDEX"], "<+strategy.iteration>");
        assert_eq!(env.len(), LOOP_ENV_VARS.len());
    }
}
