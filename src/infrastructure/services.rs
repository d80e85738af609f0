//! External collaborators
//!
//! Narrow interfaces to the feature-flag store, connector directory, license
//! service and the log/TI/STO token endpoints, each with a static
//! implementation fed from the plan request. Tokens can also be fetched over
//! HTTP.

use ahash::AHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use super::config::ServiceEndpoints;

/// Errors raised by external collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// Transport failure
    #[error("{service} request failed: {message}")]
    Request {
        /// Service name.
        service: String,
        /// Transport error.
        message: String,
    },

    /// Non-success status
    #[error("{service} returned status {status}")]
    Status {
        /// Service name.
        service: String,
        /// HTTP status code.
        status: u16,
    },

    /// Connector reference unknown to the directory
    #[error("Connector {0} not found")]
    ConnectorNotFound(String),

    /// Endpoint URL does not parse
    #[error("Invalid endpoint {0}")]
    InvalidEndpoint(String),
}

impl ServiceError {
    /// Failures worth retrying
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request { .. } => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::ConnectorNotFound(_) | Self::InvalidEndpoint(_) => false,
        }
    }
}

/// Account-level feature flags read by the planner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeatureFlag {
    /// Never redistribute spare resources
    CiDisableResourceOptimization,
    /// Use the increased default resources
    CiIncreaseDefaultResources,
    /// Inject cache intelligence steps on hosted builds
    CiCacheIntelligence,
}

/// Feature flag lookups
pub trait FeatureFlagService: Send + Sync {
    /// Whether `flag` is on for `account_id`
    fn is_enabled(&self, flag: FeatureFlag, account_id: &str) -> bool;
}

/// Flags enabled for every account
#[derive(Debug, Clone, Default)]
pub struct StaticFeatureFlags {
    enabled: AHashSet<FeatureFlag>,
}

impl StaticFeatureFlags {
    /// No flags enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables a flag
    #[must_use]
    pub fn with_flag(mut self, flag: FeatureFlag) -> Self {
        self.enabled.insert(flag);
        self
    }
}

impl FromIterator<FeatureFlag> for StaticFeatureFlags {
    fn from_iter<I: IntoIterator<Item = FeatureFlag>>(iter: I) -> Self {
        Self {
            enabled: iter.into_iter().collect(),
        }
    }
}

impl FeatureFlagService for StaticFeatureFlags {
    fn is_enabled(&self, flag: FeatureFlag, _account_id: &str) -> bool {
        self.enabled.contains(&flag)
    }
}

/// Connector kinds the planner distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorType {
    /// Docker registry
    DockerRegistry,
    /// AWS account
    Aws,
    /// GCP account
    Gcp,
    /// Azure account
    Azure,
    /// Artifactory
    Artifactory,
    /// GitHub
    Github,
    /// GitLab
    Gitlab,
    /// Bitbucket
    Bitbucket,
    /// Azure Repos
    AzureRepo,
    /// Generic git
    Git,
}

impl ConnectorType {
    /// SCM connectors usable as codebase connectors
    #[must_use]
    pub fn is_git(&self) -> bool {
        matches!(
            self,
            Self::Github | Self::Gitlab | Self::Bitbucket | Self::AzureRepo | Self::Git
        )
    }
}

impl fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DockerRegistry => "DockerRegistry",
            Self::Aws => "Aws",
            Self::Gcp => "Gcp",
            Self::Azure => "Azure",
            Self::Artifactory => "Artifactory",
            Self::Github => "Github",
            Self::Gitlab => "Gitlab",
            Self::Bitbucket => "Bitbucket",
            Self::AzureRepo => "AzureRepo",
            Self::Git => "Git",
        };
        f.write_str(name)
    }
}

/// Scope of a git connector URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionType {
    /// URL points at an account or organization
    Account,
    /// URL points at a single repository
    #[default]
    Repo,
}

/// Connector metadata; credentials stay with the connector service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectorDetails {
    /// Fully qualified identifier (`account.docker`)
    pub identifier: String,
    /// Kind
    pub connector_type: ConnectorType,
    /// Registry or repository URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Git URL scope
    #[serde(default)]
    pub connection_type: ConnectionType,
}

impl ConnectorDetails {
    /// Creates connector metadata.
    #[must_use]
    pub fn new(identifier: impl Into<String>, connector_type: ConnectorType) -> Self {
        Self {
            identifier: identifier.into(),
            connector_type,
            url: None,
            connection_type: ConnectionType::Repo,
        }
    }

    /// Sets the URL
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Sets the connection type
    #[must_use]
    pub fn with_connection_type(mut self, connection_type: ConnectionType) -> Self {
        self.connection_type = connection_type;
        self
    }
}

/// Connector lookups
pub trait ConnectorDirectory: Send + Sync {
    /// Metadata for `connector_ref`
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::ConnectorNotFound`] for unknown references.
    fn connector(&self, connector_ref: &str) -> Result<ConnectorDetails, ServiceError>;
}

/// Directory backed by a map
#[derive(Debug, Clone, Default)]
pub struct StaticConnectors {
    connectors: BTreeMap<String, ConnectorDetails>,
}

impl StaticConnectors {
    /// Empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connector under its identifier
    #[must_use]
    pub fn with(mut self, details: ConnectorDetails) -> Self {
        self.connectors.insert(details.identifier.clone(), details);
        self
    }
}

impl FromIterator<ConnectorDetails> for StaticConnectors {
    fn from_iter<I: IntoIterator<Item = ConnectorDetails>>(iter: I) -> Self {
        iter.into_iter().fold(Self::new(), Self::with)
    }
}

impl ConnectorDirectory for StaticConnectors {
    fn connector(&self, connector_ref: &str) -> Result<ConnectorDetails, ServiceError> {
        self.connectors
            .get(connector_ref)
            .cloned()
            .ok_or_else(|| ServiceError::ConnectorNotFound(connector_ref.to_string()))
    }
}

/// CI license edition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Edition {
    /// Free plan
    Free,
    /// Team plan
    Team,
    /// Enterprise plan
    Enterprise,
}

/// License lookups
pub trait LicenseService: Send + Sync {
    /// CI edition of the account, `None` when unlicensed
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] when the license service fails.
    fn edition(&self, account_id: &str) -> Result<Option<Edition>, ServiceError>;
}

/// Same edition for every account
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticLicense(pub Option<Edition>);

impl LicenseService for StaticLicense {
    fn edition(&self, _account_id: &str) -> Result<Option<Edition>, ServiceError> {
        Ok(self.0)
    }
}

/// Platform services issuing per-account tokens
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    /// Log streaming
    Log,
    /// Test intelligence
    Ti,
    /// Security testing orchestration
    Sto,
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log => write!(f, "log"),
            Self::Ti => write!(f, "ti"),
            Self::Sto => write!(f, "sto"),
        }
    }
}

/// Token issuance
pub trait ServiceTokenClient: Send + Sync {
    /// Token for `account_id`
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError`] when the service cannot issue a token.
    fn token(&self, service: ServiceKind, account_id: &str) -> Result<String, ServiceError>;
}

/// Fixed tokens per service; missing services fail like an unreachable one
#[derive(Debug, Clone, Default)]
pub struct StaticTokens {
    tokens: BTreeMap<ServiceKind, String>,
}

impl StaticTokens {
    /// No tokens.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the token of a service
    #[must_use]
    pub fn with_token(mut self, service: ServiceKind, token: impl Into<String>) -> Self {
        self.tokens.insert(service, token.into());
        self
    }
}

impl ServiceTokenClient for StaticTokens {
    fn token(&self, service: ServiceKind, _account_id: &str) -> Result<String, ServiceError> {
        self.tokens
            .get(&service)
            .cloned()
            .ok_or_else(|| ServiceError::Request {
                service: service.to_string(),
                message: "no token configured".to_string(),
            })
    }
}

/// Fetches tokens from the configured endpoints
#[derive(Debug, Clone)]
pub struct HttpTokenClient {
    endpoints: ServiceEndpoints,
    timeout: Duration,
}

impl HttpTokenClient {
    /// Client for the given endpoints.
    #[must_use]
    pub fn new(endpoints: ServiceEndpoints) -> Self {
        Self {
            endpoints,
            timeout: Duration::from_secs(10),
        }
    }

    /// Sets the request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Token endpoint URL of a service
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::InvalidEndpoint`] if the base URL is malformed.
    pub fn token_url(&self, service: ServiceKind, account_id: &str) -> Result<Url, ServiceError> {
        let (base, path, account_param) = match service {
            ServiceKind::Log => (&self.endpoints.log_url, "token", "accountID"),
            ServiceKind::Ti => (&self.endpoints.ti_url, "token", "accountId"),
            ServiceKind::Sto => (&self.endpoints.sto_url, "api/v2/token", "accountId"),
        };
        let base = if base.ends_with('/') {
            base.clone()
        } else {
            format!("{base}/")
        };
        let mut url = Url::parse(&base)
            .and_then(|u| u.join(path))
            .map_err(|_| ServiceError::InvalidEndpoint(base.clone()))?;
        url.query_pairs_mut().append_pair(account_param, account_id);
        Ok(url)
    }

    async fn fetch(&self, service: ServiceKind, url: Url) -> Result<String, ServiceError> {
        let request_error = |e: reqwest::Error| ServiceError::Request {
            service: service.to_string(),
            message: e.to_string(),
        };
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(request_error)?;
        let response = client
            .get(url)
            .header("X-Harness-Token", &self.endpoints.global_token)
            .send()
            .await
            .map_err(request_error)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::Status {
                service: service.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.text().await.map_err(request_error)?;
        Ok(body.trim().trim_matches('"').to_string())
    }
}

impl ServiceTokenClient for HttpTokenClient {
    fn token(&self, service: ServiceKind, account_id: &str) -> Result<String, ServiceError> {
        let url = self.token_url(service, account_id)?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ServiceError::Request {
                service: service.to_string(),
                message: format!("Failed to create runtime: {e}"),
            })?;
        runtime.block_on(self.fetch(service, url))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_static_flags() {
        let flags = StaticFeatureFlags::new().with_flag(FeatureFlag::CiCacheIntelligence);
        assert!(flags.is_enabled(FeatureFlag::CiCacheIntelligence, "acct"));
        assert!(!flags.is_enabled(FeatureFlag::CiIncreaseDefaultResources, "acct"));
    }

    #[test]
    fn test_static_connectors() {
        let directory: StaticConnectors = [ConnectorDetails::new(
            "account.docker",
            ConnectorType::DockerRegistry,
        )]
        .into_iter()
        .collect();
        assert_eq!(
            directory.connector("account.docker").unwrap().connector_type,
            ConnectorType::DockerRegistry
        );
        assert_eq!(
            directory.connector("missing").unwrap_err(),
            ServiceError::ConnectorNotFound("missing".to_string())
        );
    }

    #[test]
    fn test_transient_classification() {
        let status = |status| ServiceError::Status {
            service: "log".to_string(),
            status,
        };
        assert!(status(503).is_transient());
        assert!(status(429).is_transient());
        assert!(!status(401).is_transient());
        assert!(!ServiceError::ConnectorNotFound("x".to_string()).is_transient());
    }

    #[test]
    fn test_token_urls() {
        let client = HttpTokenClient::new(ServiceEndpoints {
            log_url: "https://app.example.io/log-service".to_string(),
            ti_url: "https://app.example.io/ti-service/".to_string(),
            sto_url: "https://app.example.io/sto".to_string(),
            global_token: "secret".to_string(),
        });
        assert_eq!(
            client.token_url(ServiceKind::Log, "acct").unwrap().as_str(),
            "https://app.example.io/log-service/token?accountID=acct"
        );
        assert_eq!(
            client.token_url(ServiceKind::Ti, "acct").unwrap().as_str(),
            "https://app.example.io/ti-service/token?accountId=acct"
        );
        assert_eq!(
            client.token_url(ServiceKind::Sto, "acct").unwrap().as_str(),
            "https://app.example.io/sto/api/v2/token?accountId=acct"
        );
    }

    #[test]
    fn test_invalid_endpoint() {
        let client = HttpTokenClient::new(ServiceEndpoints {
            log_url: "not a url".to_string(),
            ..ServiceEndpoints::default()
        });
        assert!(matches!(
            client.token_url(ServiceKind::Log, "acct"),
            Err(ServiceError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn test_static_tokens() {
        let tokens = StaticTokens::new().with_token(ServiceKind::Log, "log-token");
        assert_eq!(tokens.token(ServiceKind::Log, "acct").unwrap(), "log-token");
        assert!(tokens.token(ServiceKind::Ti, "acct").unwrap_err().is_transient());
    }
}
