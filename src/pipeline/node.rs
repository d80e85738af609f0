//! Execution tree of a stage
//!
//! A stage execution is an ordered list of [`ExecutionNode`]s. Steps inside a
//! step group are addressed as `<group>_<step>`.

#![allow(clippy::must_use_candidate)]

use ahash::AHashSet;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use super::errors::ValidationError;
use super::steps::{StepNode, StrategyConfig};
use super::types::Validate;

/// Separator between a step group identifier and its children
pub const STEP_GROUP_SEPARATOR: &str = "_";

/// A node of the execution tree.
///
/// Written as a single-key map (`step`, `parallel` or `stepGroup`), which
/// reads the same from YAML and JSON.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "NodeDocument")]
pub enum ExecutionNode {
    /// A single step
    Step(StepNode),
    /// Sections running concurrently
    Parallel(Vec<ExecutionNode>),
    /// Named group of nodes running serially
    StepGroup(StepGroup),
}

/// Wire shape of [`ExecutionNode`]
#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct NodeDocument {
    #[serde(default)]
    step: Option<StepNode>,
    #[serde(default)]
    parallel: Option<Vec<ExecutionNode>>,
    #[serde(default)]
    step_group: Option<StepGroup>,
}

impl TryFrom<NodeDocument> for ExecutionNode {
    type Error = String;

    fn try_from(doc: NodeDocument) -> Result<Self, Self::Error> {
        match (doc.step, doc.parallel, doc.step_group) {
            (Some(step), None, None) => Ok(Self::Step(step)),
            (None, Some(nodes), None) => Ok(Self::Parallel(nodes)),
            (None, None, Some(group)) => Ok(Self::StepGroup(group)),
            _ => Err(
                "execution node must contain exactly one of step, parallel or stepGroup"
                    .to_string(),
            ),
        }
    }
}

impl Serialize for ExecutionNode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        match self {
            Self::Step(step) => map.serialize_entry("step", step)?,
            Self::Parallel(nodes) => map.serialize_entry("parallel", nodes)?,
            Self::StepGroup(group) => map.serialize_entry("stepGroup", group)?,
        }
        map.end()
    }
}

/// Group of steps sharing an identifier prefix
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepGroup {
    /// Group identifier
    pub identifier: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Strategy declared on the group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyConfig>,
    /// Uuid shared by every instance expanded from the same strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Nested nodes
    pub steps: Vec<ExecutionNode>,
}

impl StepGroup {
    /// Creates a group without strategy.
    pub fn new(identifier: impl Into<String>, steps: Vec<ExecutionNode>) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            strategy: None,
            uuid: None,
            steps,
        }
    }
}

impl ExecutionNode {
    /// Uuid shared by strategy-expanded copies; parallel blocks have none
    pub fn uuid(&self) -> Option<&str> {
        match self {
            Self::Step(step) => step.uuid.as_deref(),
            Self::StepGroup(group) => group.uuid.as_deref(),
            Self::Parallel(_) => None,
        }
    }

    /// Returns the step if this node is a step
    pub fn as_step(&self) -> Option<&StepNode> {
        match self {
            Self::Step(step) => Some(step),
            Self::Parallel(_) | Self::StepGroup(_) => None,
        }
    }

    /// Leaf steps in document order
    pub fn steps(&self) -> Vec<&StepNode> {
        let mut out = Vec::new();
        collect_steps(self, &mut out);
        out
    }

    /// Stage-unique identifiers of the leaf steps in document order
    pub fn step_identifiers(&self, parent_prefix: &str) -> Vec<String> {
        let mut out = Vec::new();
        collect_identifiers(self, parent_prefix, &mut out);
        out
    }
}

fn collect_steps<'a>(node: &'a ExecutionNode, out: &mut Vec<&'a StepNode>) {
    match node {
        ExecutionNode::Step(step) => out.push(step),
        ExecutionNode::Parallel(sections) => {
            for section in sections {
                collect_steps(section, out);
            }
        }
        ExecutionNode::StepGroup(group) => {
            for child in &group.steps {
                collect_steps(child, out);
            }
        }
    }
}

fn collect_identifiers(node: &ExecutionNode, prefix: &str, out: &mut Vec<String>) {
    match node {
        ExecutionNode::Step(step) => out.push(format!("{prefix}{}", step.identifier)),
        ExecutionNode::Parallel(sections) => {
            for section in sections {
                collect_identifiers(section, prefix, out);
            }
        }
        ExecutionNode::StepGroup(group) => {
            let nested = format!("{prefix}{}{STEP_GROUP_SEPARATOR}", group.identifier);
            for child in &group.steps {
                collect_identifiers(child, &nested, out);
            }
        }
    }
}

/// Stage-unique identifiers of every leaf step.
pub fn step_identifiers(nodes: &[ExecutionNode]) -> Vec<String> {
    nodes.iter().flat_map(|n| n.step_identifiers("")).collect()
}

/// Every leaf step in document order.
pub fn all_steps(nodes: &[ExecutionNode]) -> Vec<&StepNode> {
    nodes.iter().flat_map(ExecutionNode::steps).collect()
}

impl Validate for ExecutionNode {
    type Error = ValidationError;

    fn validate(&self) -> Result<(), Self::Error> {
        match self {
            Self::Step(step) => {
                if step.identifier.trim().is_empty() {
                    return Err(ValidationError::EmptyIdentifier {
                        kind: "step".to_string(),
                    });
                }
                Ok(())
            }
            Self::Parallel(sections) => {
                if sections.is_empty() {
                    return Err(ValidationError::EmptyParallel);
                }
                sections.iter().try_for_each(Validate::validate)
            }
            Self::StepGroup(group) => {
                if group.identifier.trim().is_empty() {
                    return Err(ValidationError::EmptyIdentifier {
                        kind: "stepGroup".to_string(),
                    });
                }
                if group.steps.is_empty() {
                    return Err(ValidationError::EmptyStepGroup {
                        identifier: group.identifier.clone(),
                    });
                }
                group.steps.iter().try_for_each(Validate::validate)
            }
        }
    }
}

/// Validates every node and checks prefixed identifiers are unique.
///
/// # Errors
///
/// Returns the first structural problem found.
pub fn validate_execution(nodes: &[ExecutionNode]) -> Result<(), ValidationError> {
    nodes.iter().try_for_each(Validate::validate)?;

    let mut seen = AHashSet::new();
    for identifier in step_identifiers(nodes) {
        if !seen.insert(identifier.clone()) {
            return Err(ValidationError::DuplicateStepIdentifier { identifier });
        }
    }
    Ok(())
}
