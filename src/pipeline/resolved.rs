//! Values that may still be expressions at planning time

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::errors::StageExecutionError;

static EXPRESSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"<\+[^>]*>").expect("valid regex"));

/// Returns true when `value` contains an unresolved `<+...>` expression.
#[must_use]
pub fn is_expression(value: &str) -> bool {
    EXPRESSION.is_match(value)
}

/// A configuration field after expression resolution.
///
/// Planning runs after the pipeline engine has rendered what it could, so a
/// field is either a concrete value, an expression that stayed unresolved, or
/// missing altogether.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<T> {
    /// Concrete value
    Literal(T),
    /// Expression left unresolved
    Unresolved(String),
    /// Field not set
    Absent,
}

impl<T> Default for Resolved<T> {
    fn default() -> Self {
        Self::Absent
    }
}

impl<T> Resolved<T> {
    /// Returns the literal value, if any.
    #[must_use]
    pub fn literal(&self) -> Option<&T> {
        match self {
            Self::Literal(value) => Some(value),
            Self::Unresolved(_) | Self::Absent => None,
        }
    }

    /// Consumes `self`, returning the literal value if any.
    #[must_use]
    pub fn into_literal(self) -> Option<T> {
        match self {
            Self::Literal(value) => Some(value),
            Self::Unresolved(_) | Self::Absent => None,
        }
    }

    /// Returns true if the field was not set.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }

    /// Returns true if the field is an unresolved expression.
    #[must_use]
    pub fn is_unresolved(&self) -> bool {
        matches!(self, Self::Unresolved(_))
    }

    /// Maps the literal value, keeping expressions and absence.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Resolved<U> {
        match self {
            Self::Literal(value) => Resolved::Literal(f(value)),
            Self::Unresolved(expr) => Resolved::Unresolved(expr),
            Self::Absent => Resolved::Absent,
        }
    }

    /// Resolves a mandatory field.
    ///
    /// # Errors
    ///
    /// Returns [`StageExecutionError::UnresolvedMandatoryField`] when the
    /// field is absent or unresolved.
    pub fn require(
        &self,
        field: &str,
        step_type: &str,
        identifier: &str,
    ) -> Result<&T, StageExecutionError> {
        self.literal()
            .ok_or_else(|| StageExecutionError::UnresolvedMandatoryField {
                field: field.to_string(),
                step_type: step_type.to_string(),
                identifier: identifier.to_string(),
            })
    }
}

impl<T: Clone> Resolved<T> {
    /// Literal value or `default` for expressions and absence.
    #[must_use]
    pub fn resolve_or(&self, default: T) -> T {
        self.literal().cloned().unwrap_or(default)
    }
}

impl Resolved<String> {
    /// Literal string, `None` when absent, unresolved or blank.
    #[must_use]
    pub fn non_empty(&self) -> Option<&str> {
        self.literal()
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }
}

impl<T> From<T> for Resolved<T> {
    fn from(value: T) -> Self {
        Self::Literal(value)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Resolved<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        match raw {
            serde_json::Value::Null => Ok(Self::Absent),
            serde_json::Value::String(ref text) if is_expression(text) => {
                Ok(Self::Unresolved(text.clone()))
            }
            other => serde_json::from_value(other)
                .map(Self::Literal)
                .map_err(D::Error::custom),
        }
    }
}

impl<T: Serialize> Serialize for Resolved<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Literal(value) => value.serialize(serializer),
            Self::Unresolved(expr) => serializer.serialize_str(expr),
            Self::Absent => serializer.serialize_none(),
        }
    }
}
