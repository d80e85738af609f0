//! Execution source resolution
//!
//! Decides which ref a stage builds: a fixed ref from the codebase
//! (manual, scheduled, custom webhook) or the ref carried by an SCM webhook.

use crate::pipeline::codebase::{
    Build, CodeBase, ExecutionSource, ManualExecutionSource, TriggerInfo, TriggerType,
    WebhookEvent, WebhookExecutionSource,
};
use crate::pipeline::{Resolved, StageExecutionError};

/// Manual source pointing at the codebase build ref
#[must_use]
pub fn manual_source(codebase: &CodeBase) -> ManualExecutionSource {
    let mut source = ManualExecutionSource::default();
    let Some(build) = codebase.build.literal() else {
        return source;
    };
    let value = build.value().non_empty().map(str::to_string);
    match build {
        Build::Branch { .. } => source.branch = value,
        Build::Tag { .. } => source.tag = value,
        Build::PullRequest { .. } => source.pr_number = value,
    }
    source
}

fn same_repository(codebase_url: &str, webhook: &WebhookExecutionSource) -> bool {
    let repository = webhook.event.repository();
    [&repository.http_url, &repository.ssh_url]
        .iter()
        .any(|url| !url.is_empty() && url.eq_ignore_ascii_case(codebase_url))
}

/// Execution source of a stage.
///
/// `codebase_url` is the clone URL of the codebase connector, used to tell
/// whether a webhook belongs to the repository being built. Stages without
/// a codebase have no execution source.
///
/// # Errors
///
/// Fails for trigger types that cannot start a CI stage, a webhook trigger
/// without payload, a PR build started by a push, and a blank branch.
pub fn resolve_execution_source(
    trigger: &TriggerInfo,
    codebase: Option<&CodeBase>,
    webhook: Option<&WebhookExecutionSource>,
    codebase_url: Option<&str>,
) -> Result<Option<ExecutionSource>, StageExecutionError> {
    let Some(codebase) = codebase else {
        return Ok(None);
    };

    let source = match trigger.effective_type() {
        TriggerType::Manual | TriggerType::SchedulerCron => {
            ExecutionSource::Manual(manual_source(codebase))
        }
        TriggerType::WebhookCustom => ExecutionSource::Custom(manual_source(codebase)),
        TriggerType::Webhook => webhook_source(codebase, webhook, codebase_url)?,
        other => {
            return Err(StageExecutionError::UnsupportedTrigger {
                trigger_type: other.to_string(),
            });
        }
    };
    Ok(Some(source))
}

fn webhook_source(
    codebase: &CodeBase,
    webhook: Option<&WebhookExecutionSource>,
    codebase_url: Option<&str>,
) -> Result<ExecutionSource, StageExecutionError> {
    let webhook = webhook.ok_or_else(|| {
        StageExecutionError::configuration("Webhook payload is missing for webhook triggered execution")
    })?;

    let foreign_repository =
        codebase_url.is_some_and(|url| !same_repository(url, webhook));
    if codebase.should_clone_manually() || foreign_repository {
        tracing::debug!(
            foreign_repository,
            "Webhook execution builds the codebase ref instead of the event ref"
        );
        return Ok(ExecutionSource::Manual(manual_source(codebase)));
    }

    match codebase.build.literal() {
        Some(Build::PullRequest { .. })
            if matches!(webhook.event, WebhookEvent::Branch { .. }) =>
        {
            Err(StageExecutionError::configuration(
                "Building PR with execution triggered by push webhook is not supported",
            ))
        }
        Some(Build::Branch {
            branch: Resolved::Literal(branch),
        }) if branch.trim().is_empty() => Err(StageExecutionError::configuration(
            "Branch should not be empty for branch build type",
        )),
        Some(Build::Tag {
            tag: Resolved::Literal(tag),
        }) if tag.trim().is_empty() => Err(StageExecutionError::configuration(
            "Tag should not be empty for tag build type",
        )),
        Some(Build::Tag { .. }) => Ok(ExecutionSource::Manual(manual_source(codebase))),
        _ => Ok(ExecutionSource::Webhook(webhook.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::codebase::{GitProvider, Repository, WebhookBaseAttributes};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn codebase(build: Build) -> CodeBase {
        CodeBase {
            connector_ref: "account.github".to_string(),
            build: Resolved::Literal(build),
            ..CodeBase::default()
        }
    }

    fn branch(value: &str) -> Build {
        Build::Branch {
            branch: if value.starts_with("<+") {
                Resolved::Unresolved(value.to_string())
            } else {
                Resolved::Literal(value.to_string())
            },
        }
    }

    fn push_webhook(http_url: &str) -> WebhookExecutionSource {
        WebhookExecutionSource {
            provider: GitProvider::Github,
            event: WebhookEvent::Branch {
                branch_name: "main".to_string(),
                link: String::new(),
                repository: Repository {
                    http_url: http_url.to_string(),
                    ..Repository::default()
                },
                base_attributes: WebhookBaseAttributes::default(),
            },
        }
    }

    #[rstest]
    #[case(TriggerType::Manual)]
    #[case(TriggerType::SchedulerCron)]
    fn test_manual_triggers(#[case] trigger_type: TriggerType) {
        let source = resolve_execution_source(
            &TriggerInfo::new(trigger_type),
            Some(&codebase(branch("release"))),
            None,
            None,
        )
        .unwrap();
        assert_eq!(
            source,
            Some(ExecutionSource::Manual(ManualExecutionSource {
                branch: Some("release".to_string()),
                ..ManualExecutionSource::default()
            }))
        );
    }

    #[test]
    fn test_no_codebase() {
        let source =
            resolve_execution_source(&TriggerInfo::new(TriggerType::Manual), None, None, None);
        assert_eq!(source, Ok(None));
    }

    #[test]
    fn test_webhook_uses_event() {
        let webhook = push_webhook("https://github.com/acme/app.git");
        let source = resolve_execution_source(
            &TriggerInfo::new(TriggerType::Webhook),
            Some(&codebase(branch("<+trigger.branch>"))),
            Some(&webhook),
            Some("https://GitHub.com/acme/app.git"),
        )
        .unwrap();
        assert_eq!(source, Some(ExecutionSource::Webhook(webhook)));
    }

    #[test]
    fn test_webhook_from_other_repository_builds_manually() {
        let webhook = push_webhook("https://github.com/acme/other.git");
        let source = resolve_execution_source(
            &TriggerInfo::new(TriggerType::Webhook),
            Some(&codebase(branch("<+trigger.branch>"))),
            Some(&webhook),
            Some("https://github.com/acme/app.git"),
        )
        .unwrap();
        assert!(matches!(source, Some(ExecutionSource::Manual(_))));
    }

    #[test]
    fn test_pr_build_on_push_rejected() {
        let webhook = push_webhook("https://github.com/acme/app.git");
        let pr = Build::PullRequest {
            number: Resolved::Unresolved("<+trigger.prNumber>".to_string()),
        };
        let err = resolve_execution_source(
            &TriggerInfo::new(TriggerType::Webhook),
            Some(&codebase(pr)),
            Some(&webhook),
            None,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Building PR with execution triggered by push webhook is not supported"
        );
    }

    #[test]
    fn test_rerun_maps_to_root_trigger() {
        let trigger = TriggerInfo {
            trigger_type: TriggerType::Manual,
            is_rerun: true,
            root_trigger_type: Some(TriggerType::WebhookCustom),
        };
        let source =
            resolve_execution_source(&trigger, Some(&codebase(branch("main"))), None, None)
                .unwrap();
        assert!(matches!(source, Some(ExecutionSource::Custom(_))));
    }

    #[test]
    fn test_unsupported_trigger() {
        let err = resolve_execution_source(
            &TriggerInfo::new(TriggerType::Artifact),
            Some(&codebase(branch("main"))),
            None,
            None,
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "CI stage cannot be triggered by trigger of type: ARTIFACT"
        );
    }
}
