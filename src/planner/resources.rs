//! CPU and memory accounting for a stage
//!
//! Every step container gets a limit from its declared resources or the
//! account default. The stage requirement is the peak of concurrently
//! running containers along the execution tree:
//!
//! - serial nodes take the maximum of their children;
//! - parallel sections add up;
//! - copies expanded from one strategy (same uuid) add up to at most
//!   `maxConcurrency` of the largest copies.
//!
//! Capacity left between a node's own requirement and the stage peak is then
//! handed back to the steps that can use it, so a lone step in a serial path
//! ends up with the whole stage budget and parallel siblings split the rest
//! evenly. Background steps and strategy copies never receive extra.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::infrastructure::config::ResourceConfig;
use crate::pipeline::node::{ExecutionNode, STEP_GROUP_SEPARATOR};
use crate::pipeline::quantity::{cpu_millis, memory_mib};
use crate::pipeline::steps::{ContainerResource, StepKind, StepNode};
use crate::pipeline::{ResourceKind, StageExecutionError};

/// CPU in milli-cores and memory in MiB
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    /// Milli-cores
    pub cpu: u32,
    /// MiB
    pub memory: u32,
}

impl ResourceRequest {
    /// Nothing requested
    pub const ZERO: Self = Self { cpu: 0, memory: 0 };

    /// Creates a request.
    #[must_use]
    pub const fn new(cpu: u32, memory: u32) -> Self {
        Self { cpu, memory }
    }

    /// Value of one dimension
    #[must_use]
    pub fn get(&self, kind: ResourceKind) -> u32 {
        match kind {
            ResourceKind::Cpu => self.cpu,
            ResourceKind::Memory => self.memory,
        }
    }

    /// Per-dimension maximum
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        Self::new(self.cpu.max(other.cpu), self.memory.max(other.memory))
    }

    /// Per-dimension sum
    #[must_use]
    pub fn saturating_add(self, other: Self) -> Self {
        Self::new(
            self.cpu.saturating_add(other.cpu),
            self.memory.saturating_add(other.memory),
        )
    }

    /// Per-dimension difference, floored at zero
    #[must_use]
    pub fn saturating_sub(self, other: Self) -> Self {
        Self::new(
            self.cpu.saturating_sub(other.cpu),
            self.memory.saturating_sub(other.memory),
        )
    }

    /// Even share for `parts` siblings
    #[must_use]
    pub fn share(self, parts: u32) -> Self {
        if parts == 0 {
            return Self::ZERO;
        }
        Self::new(self.cpu / parts, self.memory / parts)
    }
}

/// Strategy metadata of expanded nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyInfo {
    /// Copies allowed to run at the same time
    pub max_concurrency: u32,
}

/// Strategy metadata keyed by the uuid shared by expanded copies
pub type StrategyMap = BTreeMap<String, StrategyInfo>;

/// Defaults and switches applied by the accountant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountingPolicy {
    /// Limit of a container without declared resources
    pub default_limit: ResourceRequest,
    /// Request of every step container
    pub step_request: ResourceRequest,
    /// Redistribute spare capacity
    pub optimize: bool,
}

impl Default for AccountingPolicy {
    fn default() -> Self {
        Self {
            default_limit: ResourceRequest::new(400, 500),
            step_request: ResourceRequest::new(10, 10),
            optimize: true,
        }
    }
}

impl AccountingPolicy {
    /// Policy for `account_id`.
    ///
    /// `increased_defaults` selects the larger default tier. Redistribution is
    /// off when `disable_optimization` is set or the account is listed as a
    /// legacy account.
    ///
    /// # Errors
    ///
    /// Returns a validation error when a configured quantity does not parse.
    pub fn from_config(
        config: &ResourceConfig,
        increased_defaults: bool,
        disable_optimization: bool,
        account_id: &str,
    ) -> Result<Self, StageExecutionError> {
        let default_limit = if increased_defaults {
            tracing::info!(account = account_id, "Using increased default resources");
            ResourceRequest::new(
                cpu_millis(&config.increased_cpu)?,
                memory_mib(&config.increased_memory)?,
            )
        } else {
            ResourceRequest::new(
                cpu_millis(&config.default_cpu)?,
                memory_mib(&config.default_memory)?,
            )
        };
        let legacy = config.legacy_accounts.iter().any(|a| a == account_id);

        Ok(Self {
            default_limit,
            step_request: ResourceRequest::new(
                cpu_millis(&config.step_request_cpu)?,
                memory_mib(&config.step_request_memory)?,
            ),
            optimize: !(disable_optimization || legacy),
        })
    }
}

/// Request and limit of one container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepAllocation {
    /// Scheduling request
    pub request: ResourceRequest,
    /// Limit including redistributed capacity
    pub limit: ResourceRequest,
}

/// Result of accounting a whole stage
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAllocation {
    /// Peak requirement of the stage
    pub stage: ResourceRequest,
    /// Allocation per stage-unique step identifier
    pub steps: BTreeMap<String, StepAllocation>,
}

impl StageAllocation {
    /// Allocation of a step by its stage-unique identifier
    #[must_use]
    pub fn step(&self, identifier: &str) -> Option<&StepAllocation> {
        self.steps.get(identifier)
    }
}

/// Step kinds whose container counts toward the stage peak
fn counts_toward_stage(kind: StepKind) -> bool {
    kind.needs_container() && kind != StepKind::Background
}

fn declares_strategy(node: &ExecutionNode) -> bool {
    match node {
        ExecutionNode::Step(step) => step.uuid.is_some() || step.strategy.is_some(),
        ExecutionNode::StepGroup(group) => group.uuid.is_some() || group.strategy.is_some(),
        ExecutionNode::Parallel(_) => false,
    }
}

/// Whether a node can take a share of spare capacity
fn eligible_for_extra(node: &ExecutionNode) -> bool {
    if declares_strategy(node) {
        return false;
    }
    match node {
        ExecutionNode::Step(step) => counts_toward_stage(step.kind()),
        ExecutionNode::Parallel(sections) => sections.iter().any(eligible_for_extra),
        ExecutionNode::StepGroup(group) => group.steps.iter().any(eligible_for_extra),
    }
}

/// Sum of the `cap` largest values of each dimension
fn top_sum(members: &[ResourceRequest], cap: usize) -> ResourceRequest {
    let top = |mut values: Vec<u32>| {
        values.sort_unstable_by(|a, b| b.cmp(a));
        values
            .into_iter()
            .take(cap)
            .fold(0u32, u32::saturating_add)
    };
    ResourceRequest::new(
        top(members.iter().map(|r| r.cpu).collect()),
        top(members.iter().map(|r| r.memory).collect()),
    )
}

/// Computes stage requirements and per-container allocations
#[derive(Debug, Clone, Default)]
pub struct ResourceAccountant {
    policy: AccountingPolicy,
    strategy: StrategyMap,
}

impl ResourceAccountant {
    /// Creates an accountant.
    #[must_use]
    pub fn new(policy: AccountingPolicy, strategy: StrategyMap) -> Self {
        Self { policy, strategy }
    }

    /// Policy in use
    #[must_use]
    pub fn policy(&self) -> &AccountingPolicy {
        &self.policy
    }

    /// Declared limit of the step container, or the default.
    ///
    /// Expressions and blank values fall back to the default.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed literal quantity.
    pub fn container_limit(&self, step: &StepNode) -> Result<ResourceRequest, StageExecutionError> {
        self.declared_limit(step.spec.resources())
    }

    /// Limit declared by `resources`, or the default.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed literal quantity.
    pub fn declared_limit(
        &self,
        resources: Option<&ContainerResource>,
    ) -> Result<ResourceRequest, StageExecutionError> {
        let limits = resources.map(|r| &r.limits);
        let cpu = match limits.and_then(|l| l.cpu.non_empty()) {
            Some(value) => cpu_millis(value)?,
            None => self.policy.default_limit.cpu,
        };
        let memory = match limits.and_then(|l| l.memory.non_empty()) {
            Some(value) => memory_mib(value)?,
            None => self.policy.default_limit.memory,
        };
        Ok(ResourceRequest::new(cpu, memory))
    }

    /// What the step contributes to the stage peak.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed literal quantity.
    pub fn step_request(&self, step: &StepNode) -> Result<ResourceRequest, StageExecutionError> {
        if counts_toward_stage(step.kind()) {
            self.container_limit(step)
        } else {
            Ok(ResourceRequest::ZERO)
        }
    }

    /// Requirement of a single node.
    ///
    /// # Errors
    ///
    /// Fails on malformed quantities or a uuid missing from the strategy map.
    pub fn node_request(&self, node: &ExecutionNode) -> Result<ResourceRequest, StageExecutionError> {
        match node {
            ExecutionNode::Step(step) => self.step_request(step),
            ExecutionNode::Parallel(sections) => self.parallel_request(sections),
            ExecutionNode::StepGroup(group) => self.serial_request(&group.steps),
        }
    }

    /// Requirement of nodes running one after another.
    ///
    /// # Errors
    ///
    /// Fails on malformed quantities or a uuid missing from the strategy map.
    pub fn serial_request(
        &self,
        nodes: &[ExecutionNode],
    ) -> Result<ResourceRequest, StageExecutionError> {
        Ok(self
            .units(nodes)?
            .into_iter()
            .fold(ResourceRequest::ZERO, ResourceRequest::max))
    }

    /// Requirement of sections running concurrently.
    ///
    /// # Errors
    ///
    /// Fails on malformed quantities or a uuid missing from the strategy map.
    pub fn parallel_request(
        &self,
        sections: &[ExecutionNode],
    ) -> Result<ResourceRequest, StageExecutionError> {
        Ok(self
            .units(sections)?
            .into_iter()
            .fold(ResourceRequest::ZERO, ResourceRequest::saturating_add))
    }

    /// Peak requirement of a stage in one dimension.
    ///
    /// # Errors
    ///
    /// Fails on malformed quantities or a uuid missing from the strategy map.
    pub fn stage_request(
        &self,
        nodes: &[ExecutionNode],
        kind: ResourceKind,
    ) -> Result<u32, StageExecutionError> {
        Ok(self.serial_request(nodes)?.get(kind))
    }

    /// Siblings as scheduling units: plain nodes stand alone, copies of one
    /// strategy collapse into a single unit bounded by `maxConcurrency`.
    fn units(&self, nodes: &[ExecutionNode]) -> Result<Vec<ResourceRequest>, StageExecutionError> {
        let mut units = Vec::with_capacity(nodes.len());
        let mut copies: AHashMap<&str, Vec<ResourceRequest>> = AHashMap::new();

        for node in nodes {
            let request = self.node_request(node)?;
            match node.uuid() {
                Some(uuid) => copies.entry(uuid).or_default().push(request),
                None => units.push(request),
            }
        }

        for (uuid, members) in copies {
            let info = self.strategy.get(uuid).ok_or_else(|| {
                StageExecutionError::MissingStrategyMetadata {
                    uuid: uuid.to_string(),
                }
            })?;
            let cap = usize::try_from(info.max_concurrency).unwrap_or(usize::MAX);
            units.push(top_sum(&members, cap));
        }
        Ok(units)
    }

    /// Allocates every step container of the stage.
    ///
    /// # Errors
    ///
    /// Fails on malformed quantities or a uuid missing from the strategy map.
    pub fn allocate(&self, nodes: &[ExecutionNode]) -> Result<StageAllocation, StageExecutionError> {
        let stage = self.serial_request(nodes)?;
        let mut steps = BTreeMap::new();
        for node in nodes {
            self.distribute(node, "", stage, false, &mut steps)?;
        }
        tracing::debug!(
            cpu = stage.cpu,
            memory = stage.memory,
            containers = steps.len(),
            "Stage resources allocated"
        );
        Ok(StageAllocation { stage, steps })
    }

    fn distribute(
        &self,
        node: &ExecutionNode,
        prefix: &str,
        budget: ResourceRequest,
        under_strategy: bool,
        out: &mut BTreeMap<String, StepAllocation>,
    ) -> Result<(), StageExecutionError> {
        let under_strategy = under_strategy || declares_strategy(node);
        match node {
            ExecutionNode::Step(step) => self.assign(step, prefix, budget, under_strategy, out),
            ExecutionNode::Parallel(sections) => {
                self.distribute_parallel(sections, prefix, budget, under_strategy, out)
            }
            ExecutionNode::StepGroup(group) => {
                let nested = format!("{prefix}{}{STEP_GROUP_SEPARATOR}", group.identifier);
                for child in &group.steps {
                    self.distribute(child, &nested, budget, under_strategy, out)?;
                }
                Ok(())
            }
        }
    }

    fn distribute_parallel(
        &self,
        sections: &[ExecutionNode],
        prefix: &str,
        budget: ResourceRequest,
        under_strategy: bool,
        out: &mut BTreeMap<String, StepAllocation>,
    ) -> Result<(), StageExecutionError> {
        let eligible = |section: &ExecutionNode| !under_strategy && eligible_for_extra(section);
        let sum = self.parallel_request(sections)?;
        let count = u32::try_from(sections.iter().filter(|&s| eligible(s)).count()).unwrap_or(u32::MAX);
        let share = budget.saturating_sub(sum).share(count);

        for section in sections {
            let own = self.node_request(section)?;
            let section_budget = if eligible(section) {
                own.saturating_add(share)
            } else {
                own
            };
            self.distribute(section, prefix, section_budget, under_strategy, out)?;
        }
        Ok(())
    }

    fn assign(
        &self,
        step: &StepNode,
        prefix: &str,
        budget: ResourceRequest,
        under_strategy: bool,
        out: &mut BTreeMap<String, StepAllocation>,
    ) -> Result<(), StageExecutionError> {
        let kind = step.kind();
        if !kind.needs_container() {
            return Ok(());
        }

        let own = self.container_limit(step)?;
        let allocation = if kind == StepKind::Background {
            StepAllocation {
                request: own,
                limit: own,
            }
        } else {
            let extra = if self.policy.optimize && !under_strategy {
                budget.saturating_sub(own)
            } else {
                ResourceRequest::ZERO
            };
            StepAllocation {
                request: self.policy.step_request,
                limit: own.saturating_add(extra),
            }
        };
        out.insert(format!("{prefix}{}", step.identifier), allocation);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::node::StepGroup;
    use crate::pipeline::node::tests::run_with;
    use crate::pipeline::steps::{BackgroundStep, ContainerOptions, ContainerResource, StepSpec};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn background(id: &str, cpu: &str) -> ExecutionNode {
        ExecutionNode::Step(StepNode::new(
            id,
            StepSpec::Background(BackgroundStep {
                container: ContainerOptions {
                    resources: Some(ContainerResource::limits(Some(cpu), None)),
                    ..ContainerOptions::default()
                },
                ..BackgroundStep::default()
            }),
        ))
    }

    fn with_uuid(node: ExecutionNode, uuid: &str) -> ExecutionNode {
        match node {
            ExecutionNode::Step(step) => ExecutionNode::Step(step.with_uuid(uuid)),
            other => other,
        }
    }

    fn accountant() -> ResourceAccountant {
        ResourceAccountant::default()
    }

    fn limit(allocation: &StageAllocation, id: &str) -> ResourceRequest {
        allocation.step(id).unwrap().limit
    }

    #[test]
    fn test_parallel_redistribution_scenario() {
        let nodes = vec![
            ExecutionNode::Parallel(vec![
                run_with("a", Some("500m"), None),
                run_with("b", Some("1000m"), None),
            ]),
            run_with("c", Some("2000m"), None),
        ];

        let allocation = accountant().allocate(&nodes).unwrap();

        assert_eq!(allocation.stage, ResourceRequest::new(2000, 1000));
        assert_eq!(limit(&allocation, "a"), ResourceRequest::new(750, 500));
        assert_eq!(limit(&allocation, "b"), ResourceRequest::new(1250, 500));
        assert_eq!(limit(&allocation, "c"), ResourceRequest::new(2000, 1000));
        assert_eq!(
            allocation.step("a").unwrap().request,
            ResourceRequest::new(10, 10)
        );
    }

    #[test]
    fn test_empty_stage_requests_nothing() {
        let allocation = accountant().allocate(&[]).unwrap();
        assert_eq!(allocation.stage, ResourceRequest::ZERO);
        assert!(allocation.steps.is_empty());
    }

    #[test]
    fn test_unresolved_limits_use_default() {
        let mut node = run_with("a", None, None);
        if let ExecutionNode::Step(step) = &mut node {
            if let StepSpec::Run(run) = &mut step.spec {
                run.container.resources = Some(ContainerResource {
                    limits: crate::pipeline::steps::ResourceLimits {
                        cpu: crate::pipeline::Resolved::Unresolved("<+input>".to_string()),
                        memory: crate::pipeline::Resolved::Literal("1Gi".to_string()),
                    },
                });
            }
        }
        let request = accountant().node_request(&node).unwrap();
        assert_eq!(request, ResourceRequest::new(400, 1024));
    }

    #[test]
    fn test_malformed_limit_is_rejected() {
        let node = run_with("a", Some("lots"), None);
        let err = accountant().node_request(&node).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation failed: Invalid cpu quantity 'lots'"
        );
    }

    #[test]
    fn test_background_never_gets_extra() {
        let nodes = vec![
            ExecutionNode::Parallel(vec![
                background("db", "300m"),
                run_with("a", Some("500m"), None),
            ]),
            run_with("big", Some("3000m"), None),
        ];

        let allocation = accountant().allocate(&nodes).unwrap();

        let db = allocation.step("db").unwrap();
        assert_eq!(db.limit, ResourceRequest::new(300, 500));
        assert_eq!(db.request, db.limit);
        // The single eligible sibling takes the whole spare share
        assert_eq!(limit(&allocation, "a").cpu, 3000);
    }

    #[test]
    fn test_step_group_prefix_and_budget() {
        let nodes = vec![
            ExecutionNode::StepGroup(StepGroup::new(
                "sg",
                vec![
                    run_with("x", Some("200m"), None),
                    ExecutionNode::Parallel(vec![
                        run_with("y", Some("300m"), None),
                        run_with("z", Some("300m"), None),
                    ]),
                ],
            )),
            run_with("big", Some("1000m"), None),
        ];

        let allocation = accountant().allocate(&nodes).unwrap();

        assert_eq!(allocation.stage.cpu, 1000);
        assert_eq!(limit(&allocation, "sg_x").cpu, 1000);
        assert_eq!(limit(&allocation, "sg_y").cpu, 500);
        assert_eq!(limit(&allocation, "sg_z").cpu, 500);
    }

    #[test]
    fn test_strategy_copies_bounded_by_max_concurrency() {
        let strategy = StrategyMap::from([(
            "u1".to_string(),
            StrategyInfo { max_concurrency: 2 },
        )]);
        let accountant = ResourceAccountant::new(AccountingPolicy::default(), strategy);
        let nodes = vec![ExecutionNode::Parallel(vec![
            with_uuid(run_with("m_0", Some("100m"), None), "u1"),
            with_uuid(run_with("m_1", Some("300m"), None), "u1"),
            with_uuid(run_with("m_2", Some("200m"), None), "u1"),
            run_with("plain", Some("100m"), None),
        ])];

        let stage = accountant.serial_request(&nodes).unwrap();
        assert_eq!(stage.cpu, 300 + 200 + 100);

        let allocation = accountant.allocate(&nodes).unwrap();
        assert_eq!(limit(&allocation, "m_1").cpu, 300);
        assert_eq!(limit(&allocation, "plain").cpu, 100);
    }

    #[test]
    fn test_serial_strategy_copies_count_as_one_unit() {
        let strategy = StrategyMap::from([(
            "u1".to_string(),
            StrategyInfo { max_concurrency: 3 },
        )]);
        let accountant = ResourceAccountant::new(AccountingPolicy::default(), strategy);
        let nodes = vec![
            with_uuid(run_with("m_0", Some("400m"), None), "u1"),
            with_uuid(run_with("m_1", Some("400m"), None), "u1"),
            run_with("after", Some("1000m"), None),
        ];

        assert_eq!(accountant.stage_request(&nodes, ResourceKind::Cpu).unwrap(), 1000);
        let allocation = accountant.allocate(&nodes).unwrap();
        assert_eq!(limit(&allocation, "m_0").cpu, 400);
        assert_eq!(limit(&allocation, "after").cpu, 1000);
    }

    #[test]
    fn test_missing_strategy_metadata_is_fatal() {
        let nodes = vec![with_uuid(run_with("m_0", None, None), "missing")];
        assert_eq!(
            accountant().allocate(&nodes),
            Err(StageExecutionError::MissingStrategyMetadata {
                uuid: "missing".to_string()
            })
        );
    }

    #[test]
    fn test_optimization_disabled_for_legacy_account() {
        let config = ResourceConfig {
            legacy_accounts: vec!["legacy".to_string()],
            ..ResourceConfig::default()
        };
        let policy = AccountingPolicy::from_config(&config, false, false, "legacy").unwrap();
        assert!(!policy.optimize);

        let accountant = ResourceAccountant::new(policy, StrategyMap::new());
        let nodes = vec![
            run_with("small", Some("100m"), None),
            run_with("big", Some("900m"), None),
        ];
        let allocation = accountant.allocate(&nodes).unwrap();
        assert_eq!(limit(&allocation, "small").cpu, 100);
    }

    #[test]
    fn test_policy_tiers() {
        let config = ResourceConfig::default();
        let standard = AccountingPolicy::from_config(&config, false, false, "acct").unwrap();
        assert_eq!(standard, AccountingPolicy::default());

        let increased = AccountingPolicy::from_config(&config, true, true, "acct").unwrap();
        assert_eq!(increased.default_limit, ResourceRequest::new(1000, 3000));
        assert!(!increased.optimize);
    }

    fn cpu_steps(values: &[u32]) -> Vec<ExecutionNode> {
        values
            .iter()
            .enumerate()
            .map(|(i, cpu)| run_with(&format!("s{i}"), Some(format!("{cpu}m").as_str()), None))
            .collect()
    }

    proptest! {
        #[test]
        fn test_parallel_request_between_max_and_sum(
            values in proptest::collection::vec(1u32..8000, 1..8),
        ) {
            let nodes = vec![ExecutionNode::Parallel(cpu_steps(&values))];
            let stage = accountant().stage_request(&nodes, ResourceKind::Cpu).unwrap();
            let max = values.iter().copied().max().unwrap();
            let sum: u32 = values.iter().sum();
            prop_assert!(stage >= max);
            prop_assert!(stage <= sum);
        }

        #[test]
        fn test_lone_step_receives_stage_peak(own in 1u32..4000, peak in 4000u32..16000) {
            let nodes = cpu_steps(&[own, peak]);
            let allocation = accountant().allocate(&nodes).unwrap();
            prop_assert_eq!(allocation.stage.cpu, peak);
            prop_assert_eq!(limit(&allocation, "s0").cpu, peak);
        }

        #[test]
        fn test_parallel_limits_stay_within_peak(
            values in proptest::collection::vec(1u32..4000, 1..6),
            peak in 1u32..40000,
        ) {
            let nodes = vec![
                ExecutionNode::Parallel(cpu_steps(&values)),
                run_with("peak", Some(format!("{peak}m").as_str()), None),
            ];
            let allocation = accountant().allocate(&nodes).unwrap();
            let total: u32 = (0..values.len())
                .map(|i| limit(&allocation, &format!("s{i}")).cpu)
                .sum();
            prop_assert!(total <= allocation.stage.cpu);
        }
    }
}
