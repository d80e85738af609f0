//! Core types shared by the stage model
//!
//! Small closed enums describing the build platform, plus the
//! [`Validate`] trait implemented by model nodes.

#![allow(clippy::must_use_candidate)]

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::StageExecutionError;

/// Operating system of the build infrastructure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum OsType {
    /// Linux
    #[default]
    Linux,
    /// Windows
    Windows,
    /// macOS
    MacOS,
}

impl OsType {
    /// Returns true for Windows
    #[must_use]
    pub fn is_windows(&self) -> bool {
        matches!(self, Self::Windows)
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Linux => write!(f, "linux"),
            Self::Windows => write!(f, "windows"),
            Self::MacOS => write!(f, "macos"),
        }
    }
}

/// CPU architecture of the build infrastructure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ArchType {
    /// x86-64
    #[default]
    Amd64,
    /// 64-bit ARM
    Arm64,
}

impl fmt::Display for ArchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Amd64 => write!(f, "amd64"),
            Self::Arm64 => write!(f, "arm64"),
        }
    }
}

/// Image pull policy of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImagePullPolicy {
    /// Always pull
    Always,
    /// Never pull
    Never,
    /// Pull when missing locally
    IfNotPresent,
}

/// Resource dimension handled by the accountant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// CPU in milli-cores
    Cpu,
    /// Memory in MiB
    Memory,
}

impl FromStr for ResourceKind {
    type Err = StageExecutionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "memory" | "mem" => Ok(Self::Memory),
            _ => Err(StageExecutionError::InvalidResourceType(s.to_string())),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Trait for validating model nodes
pub trait Validate {
    /// Error type returned by validation
    type Error;

    /// Validates the node
    #[allow(clippy::missing_errors_doc)]
    fn validate(&self) -> Result<(), Self::Error>;
}
