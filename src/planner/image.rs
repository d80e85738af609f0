//! Image references

use serde::{Deserialize, Serialize};
use url::Url;

use crate::infrastructure::services::{ConnectorDetails, ConnectorType};
use crate::pipeline::StageExecutionError;

/// Registry hosts whose images are referenced without a host prefix
const DOCKER_HUB_HOSTS: [&str; 2] = ["index.docker.io", "registry.hub.docker.com"];

/// Image of a container together with the connector pulling it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDetails {
    /// Image name, possibly qualified with a registry host
    pub name: String,
    /// Tag; empty means the registry default
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    /// Registry connector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connector_ref: Option<String>,
}

impl ImageDetails {
    /// Image reference as passed to the runtime
    #[must_use]
    pub fn reference(&self) -> String {
        if self.tag.is_empty() {
            self.name.clone()
        } else {
            format!("{}:{}", self.name, self.tag)
        }
    }
}

/// Splits an image reference into name and tag.
///
/// The tag is whatever follows the last `:` unless that colon belongs to a
/// registry port (`host:5000/app`).
///
/// # Errors
///
/// Fails when the image is blank.
pub fn image_info(image: &str) -> Result<ImageDetails, StageExecutionError> {
    let image = image.trim();
    if image.is_empty() {
        return Err(StageExecutionError::configuration(
            "ConnectorRef and Image should not be empty",
        ));
    }

    let (name, tag) = match image.rsplit_once(':') {
        Some((name, tag)) if !tag.contains('/') => (name, tag),
        _ => (image, ""),
    };
    Ok(ImageDetails {
        name: name.to_string(),
        tag: tag.to_string(),
        connector_ref: None,
    })
}

/// Prefixes `image` with the registry of a Docker connector.
///
/// Images already carrying the registry host, and images on Docker Hub, are
/// returned unchanged. Connectors of any other type leave the image alone.
///
/// # Errors
///
/// Returns [`StageExecutionError::MalformedRegistryUrl`] when the connector
/// URL does not parse.
pub fn fully_qualified_image(
    image: &str,
    connector: &ConnectorDetails,
) -> Result<String, StageExecutionError> {
    if connector.connector_type != ConnectorType::DockerRegistry {
        return Ok(image.to_string());
    }
    let Some(registry_url) = connector.url.as_deref() else {
        return Ok(image.to_string());
    };

    let malformed = || StageExecutionError::MalformedRegistryUrl {
        url: registry_url.to_string(),
        connector: connector.identifier.clone(),
    };
    let url = Url::parse(registry_url).map_err(|_| malformed())?;
    let host = url.host_str().ok_or_else(malformed)?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };

    if image.contains(&host) || DOCKER_HUB_HOSTS.contains(&host.as_str()) {
        return Ok(image.to_string());
    }

    let prefix = format!("{host}{}", url.path());
    Ok(format!(
        "{}/{}",
        prefix.trim_end_matches('/'),
        image.trim_start_matches('/')
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn docker(url: &str) -> ConnectorDetails {
        ConnectorDetails::new("account.registry", ConnectorType::DockerRegistry).with_url(url)
    }

    #[rstest]
    #[case("golang:1.22", "golang", "1.22")]
    #[case("alpine", "alpine", "")]
    #[case("registry.local:5000/team/app", "registry.local:5000/team/app", "")]
    #[case("registry.local:5000/team/app:2.1", "registry.local:5000/team/app", "2.1")]
    fn test_image_info(#[case] image: &str, #[case] name: &str, #[case] tag: &str) {
        let info = image_info(image).unwrap();
        assert_eq!(info.name, name);
        assert_eq!(info.tag, tag);
        assert_eq!(info.reference(), image);
    }

    #[test]
    fn test_blank_image_rejected() {
        assert_eq!(
            image_info("  ").unwrap_err().to_string(),
            "ConnectorRef and Image should not be empty"
        );
    }

    #[rstest]
    #[case("https://registry.local:5000/v2/", "app:1", "registry.local:5000/v2/app:1")]
    #[case("https://registry.local", "team/app", "registry.local/team/app")]
    #[case("https://registry.local", "registry.local/team/app", "registry.local/team/app")]
    #[case("https://index.docker.io/v1/", "library/alpine", "library/alpine")]
    fn test_fully_qualified_image(#[case] url: &str, #[case] image: &str, #[case] expected: &str) {
        assert_eq!(fully_qualified_image(image, &docker(url)).unwrap(), expected);
    }

    #[test]
    fn test_malformed_registry_url() {
        let err = fully_qualified_image("app", &docker("not a url")).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Malformed registryUrl not a url in docker connector id: account.registry"
        );
    }

    #[test]
    fn test_non_docker_connector_untouched() {
        let aws = ConnectorDetails::new("account.aws", ConnectorType::Aws);
        assert_eq!(fully_qualified_image("app:1", &aws).unwrap(), "app:1");
    }
}
