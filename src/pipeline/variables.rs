//! Pipeline and stage variables

use serde::{Deserialize, Serialize};

use super::resolved::Resolved;

/// A typed variable declared on the pipeline or the stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Variable {
    /// Plain string value
    String {
        /// Variable name.
        name: String,
        /// Value, possibly an expression.
        #[serde(default, skip_serializing_if = "Resolved::is_absent")]
        value: Resolved<String>,
        /// Fallback when the value is not set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<String>,
    },
    /// Numeric value
    Number {
        /// Variable name.
        name: String,
        /// Value, possibly an expression.
        #[serde(default, skip_serializing_if = "Resolved::is_absent")]
        value: Resolved<f64>,
        /// Fallback when the value is not set.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default: Option<f64>,
    },
    /// Reference to a secret in the secret manager
    Secret {
        /// Variable name.
        name: String,
        /// Secret identifier (`account.token`, `org.key`, ...).
        value: String,
    },
}

/// Plain or secret variable after resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariableValue {
    /// Goes to the container env
    Plain(String),
    /// Goes to the secret list
    Secret(String),
}

impl Variable {
    /// Variable name
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::String { name, .. } | Self::Number { name, .. } | Self::Secret { name, .. } => {
                name
            }
        }
    }

    /// Resolves the value for env injection.
    ///
    /// Unresolved expressions are passed through for the step runtime to
    /// render; absent values fall back to the default, then to empty.
    #[must_use]
    pub fn value(&self) -> VariableValue {
        match self {
            Self::String { value, default, .. } => VariableValue::Plain(match value {
                Resolved::Literal(v) => v.clone(),
                Resolved::Unresolved(expr) => default.clone().unwrap_or_else(|| expr.clone()),
                Resolved::Absent => default.clone().unwrap_or_default(),
            }),
            Self::Number { value, default, .. } => VariableValue::Plain(match value {
                Resolved::Literal(v) => format_number(*v),
                Resolved::Unresolved(expr) => default.map_or_else(|| expr.clone(), format_number),
                Resolved::Absent => default.map(format_number).unwrap_or_default(),
            }),
            Self::Secret { value, .. } => VariableValue::Secret(value.clone()),
        }
    }
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_deserialize_variables() {
        let vars: Vec<Variable> = serde_yaml::from_str(
            r#"
- name: region
  type: String
  value: us-east-1
- name: retries
  type: Number
  value: 3
- name: token
  type: Secret
  value: account.token
"#,
        )
        .unwrap();

        assert_eq!(vars[0].value(), VariableValue::Plain("us-east-1".to_string()));
        assert_eq!(vars[1].value(), VariableValue::Plain("3".to_string()));
        assert_eq!(
            vars[2].value(),
            VariableValue::Secret("account.token".to_string())
        );
        assert_eq!(vars[2].name(), "token");
    }

    #[test]
    fn test_defaults_apply() {
        let var = Variable::String {
            name: "x".to_string(),
            value: Resolved::Unresolved("<+input>".to_string()),
            default: Some("fallback".to_string()),
        };
        assert_eq!(var.value(), VariableValue::Plain("fallback".to_string()));

        let number = Variable::Number {
            name: "n".to_string(),
            value: Resolved::Absent,
            default: Some(2.5),
        };
        assert_eq!(number.value(), VariableValue::Plain("2.5".to_string()));
    }
}
