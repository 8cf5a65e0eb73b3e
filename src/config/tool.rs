// file: src/config/tool.rs
// version: 1.0.0
// guid: 5d1a8c3e-2f47-4b90-a6e3-7c8d9e0f1a2b

//! Typed tool configuration
//!
//! Every field is optional at load time; the pipelines ask for the values
//! they need through the `require` helpers, which name the missing key.

use crate::error::CloudImagesError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    #[serde(default)]
    pub azure: AzureConfig,
    #[serde(default)]
    pub ec2: Ec2Config,
    #[serde(default)]
    pub gce: GceConfig,
    #[serde(default)]
    pub publish: PublishConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AzureConfig {
    #[serde(default)]
    pub auth: AzureAuthConfig,
    #[serde(default)]
    pub cloudpartner: AzureCloudPartnerConfig,
    #[serde(default)]
    pub storage: AzureStorageConfig,
    #[serde(default)]
    pub image: AzureImageConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AzureAuthConfig {
    pub tenant: Option<String>,
    pub client: Option<String>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AzureCloudPartnerConfig {
    pub tenant: Option<String>,
    pub publisher: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AzureStorageConfig {
    pub tenant: Option<String>,
    pub subscription: Option<String>,
    pub group: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AzureImageConfig {
    pub subscription: Option<String>,
    pub group: Option<String>,
    pub gallery: Option<String>,
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ec2Config {
    #[serde(default)]
    pub auth: Ec2AuthConfig,
    #[serde(default)]
    pub image: Ec2ImageConfig,
    #[serde(default)]
    pub storage: Ec2StorageConfig,
    #[serde(default)]
    pub ssm: Ec2SsmConfig,
    #[serde(default)]
    pub marketplace: Ec2MarketplaceConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ec2AuthConfig {
    pub key: Option<String>,
    pub secret: Option<String>,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ec2ImageConfig {
    /// Target regions; `all` selects every enabled region, empty means the
    /// bucket region only
    #[serde(default)]
    pub regions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ec2StorageConfig {
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ec2SsmConfig {
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Ec2MarketplaceConfig {
    pub role: Option<String>,
    pub api_region: Option<String>,
    #[serde(default)]
    pub listings: BTreeMap<String, MarketplaceListing>,
}

/// Marketplace product per release
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketplaceListing {
    #[serde(default)]
    pub entities: BTreeMap<String, MarketplaceEntity>,
    pub releasenotes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MarketplaceEntity {
    pub id: String,
    pub instancetype: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GceConfig {
    #[serde(default)]
    pub auth: GceAuthConfig,
    #[serde(default)]
    pub image: GceImageConfig,
    #[serde(default)]
    pub storage: GceStorageConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GceAuthConfig {
    pub credentialsfile: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GceImageConfig {
    pub project: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GceStorageConfig {
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PublishConfig {
    pub root: Option<PathBuf>,
    pub provider: Option<String>,
}

/// Value of an optional setting, or a `ConfigError` naming its key
pub fn require<'a, T: ?Sized>(value: Option<&'a T>, key: &str) -> Result<&'a T> {
    value.ok_or_else(|| CloudImagesError::config(format!("Missing configuration value '{}'", key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = r#"
azure:
  auth:
    client: 0e1c1b2e
ec2:
  image:
    regions: [eu-west-1, us-east-1]
  marketplace:
    api_region: us-east-1
    listings:
      bookworm:
        entities:
          amd64: {id: prod-abc, instancetype: t3.micro}
"#;
        let config: ToolConfig = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(config.azure.auth.client.as_deref(), Some("0e1c1b2e"));
        assert_eq!(config.azure.auth.secret, None);
        assert_eq!(config.ec2.image.regions.len(), 2);
        assert_eq!(
            config.ec2.marketplace.listings["bookworm"].entities["amd64"].instancetype,
            "t3.micro"
        );
        assert_eq!(config.gce, GceConfig::default());
    }

    #[test]
    fn test_require_names_key() {
        let config = ToolConfig::default();
        let err = require(config.gce.image.project.as_deref(), "gce.image.project").unwrap_err();
        assert!(err.to_string().contains("gce.image.project"));
    }
}
