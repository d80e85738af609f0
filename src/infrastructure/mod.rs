//! Infrastructure layer
//!
//! Configuration, logging and the adapters to external collaborators.

pub mod config;
mod logging;
pub mod retry;
pub mod services;
pub mod sweeping;

pub use config::{Config, ConfigError};
pub use logging::init_logging;
pub use retry::RetryPolicy;
pub use services::{
    ConnectorDetails, ConnectorDirectory, ConnectorType, Edition, FeatureFlag, FeatureFlagService,
    LicenseService, ServiceError, ServiceKind, ServiceTokenClient,
};
pub use sweeping::{InMemoryStore, JsonFileStore, SweepingOutput, SweepingOutputStore};
