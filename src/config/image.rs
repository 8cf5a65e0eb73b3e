// file: src/config/image.rs
// version: 2.0.0
// guid: c3d4e5f6-a7b8-9012-3456-789012cdefab

//! Static image catalog
//!
//! The catalog lists the architectures, releases, vendors and build types
//! images can be produced for. It decides which combinations are enabled,
//! which may be uploaded, how artifacts are named and which FAI classes the
//! installer receives.

use super::Classes;
use crate::error::CloudImagesError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const BUILTIN_CATALOG: &str = include_str!("images.yaml");

/// Action of a match rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchOp {
    Enable,
    EnableUpload,
    Disable,
    DisableUpload,
}

/// One conditional rule; empty match lists match everything
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRule {
    pub op: MatchOp,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_arches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_releases: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_vendors: Vec<String>,
}

impl MatchRule {
    fn applies(&self, image: &ImageKey<'_>) -> bool {
        fn hit(list: &[String], value: &str) -> bool {
            list.is_empty() || list.iter().any(|v| v == value)
        }
        hit(&self.match_arches, image.arch)
            && hit(&self.match_releases, image.release)
            && hit(&self.match_types, image.build_type)
            && hit(&self.match_vendors, image.vendor)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ArchConfig {
    #[serde(default)]
    pub fai_classes: Vec<String>,
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<MatchRule>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReleaseConfig {
    pub basename: String,
    pub id: String,
    #[serde(default)]
    pub fai_classes: Vec<String>,
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<MatchRule>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VendorConfig {
    #[serde(default)]
    pub fai_classes: Vec<String>,
    /// Disk size handed to the installer
    pub size_gb: u64,
    #[serde(default, rename = "match", skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<MatchRule>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TypeConfig {
    #[serde(default)]
    pub fai_classes: Vec<String>,
    pub output_name: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PublicTypeConfig {
    /// Directory below the release directory of the public catalog
    pub path: String,
}

/// Identity of one image combination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageKey<'a> {
    pub arch: &'a str,
    pub release: &'a str,
    pub vendor: &'a str,
    pub build_type: &'a str,
}

/// Outcome of rule evaluation for one combination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    pub enabled: bool,
    pub upload_enabled: bool,
}

/// Values substituted into output name templates
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameVars {
    pub release_id: String,
    pub vendor: String,
    pub arch: String,
    pub build_id: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub archs: BTreeMap<String, ArchConfig>,
    #[serde(default)]
    pub releases: BTreeMap<String, ReleaseConfig>,
    #[serde(default)]
    pub vendors: BTreeMap<String, VendorConfig>,
    #[serde(default)]
    pub types: BTreeMap<String, TypeConfig>,
    #[serde(default)]
    pub public_types: BTreeMap<String, PublicTypeConfig>,
}

impl ImageConfig {
    /// Catalog shipped with the tool
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_CATALOG)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ImageConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency of the catalog
    pub fn validate(&self) -> Result<()> {
        for (name, release) in &self.releases {
            if release.id.is_empty() {
                return Err(CloudImagesError::validation(format!(
                    "Release '{}' has no id",
                    name
                )));
            }
        }
        for (name, t) in &self.types {
            if !t.output_name.contains("{version}") {
                return Err(CloudImagesError::validation(format!(
                    "Output name of type '{}' lacks the {{version}} placeholder",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn arch(&self, name: &str) -> Result<&ArchConfig> {
        lookup(&self.archs, "architecture", name)
    }

    pub fn release(&self, name: &str) -> Result<&ReleaseConfig> {
        lookup(&self.releases, "release", name)
    }

    pub fn vendor(&self, name: &str) -> Result<&VendorConfig> {
        lookup(&self.vendors, "vendor", name)
    }

    pub fn build_type(&self, name: &str) -> Result<&TypeConfig> {
        lookup(&self.types, "type", name)
    }

    pub fn public_type(&self, name: &str) -> Result<&PublicTypeConfig> {
        lookup(&self.public_types, "public type", name)
    }

    /// Evaluate arch, release and vendor rules in that order; the last
    /// applicable rule wins
    pub fn evaluate(&self, image: &ImageKey<'_>) -> Result<MatchResult> {
        let rules = self
            .arch(image.arch)?
            .rules
            .iter()
            .chain(&self.release(image.release)?.rules)
            .chain(&self.vendor(image.vendor)?.rules);

        let mut result = MatchResult {
            enabled: true,
            upload_enabled: true,
        };
        for rule in rules.filter(|rule| rule.applies(image)) {
            match rule.op {
                MatchOp::Enable => result.enabled = true,
                MatchOp::EnableUpload => result.upload_enabled = true,
                MatchOp::Disable => result.enabled = false,
                MatchOp::DisableUpload => result.upload_enabled = false,
            }
        }
        result.upload_enabled &= result.enabled;
        Ok(result)
    }

    /// FAI classes for one combination: DEBIAN, CLOUD, then type, release,
    /// arch and vendor classes, then LAST
    pub fn classes(&self, image: &ImageKey<'_>) -> Result<Classes> {
        let mut classes: Classes = ["DEBIAN", "CLOUD"].into_iter().collect();
        classes.extend(self.build_type(image.build_type)?.fai_classes.iter().cloned());
        classes.extend(self.release(image.release)?.fai_classes.iter().cloned());
        classes.extend(self.arch(image.arch)?.fai_classes.iter().cloned());
        classes.extend(self.vendor(image.vendor)?.fai_classes.iter().cloned());
        classes.add("LAST");
        Ok(classes)
    }

    /// Artifact name of a build
    pub fn output_name(&self, build_type: &str, vars: &NameVars) -> Result<String> {
        Ok(render(&self.build_type(build_type)?.output_name, vars))
    }

    /// Artifact name without the version suffix, used for "latest" aliases
    pub fn output_name_latest(&self, build_type: &str, vars: &NameVars) -> Result<String> {
        let template = self
            .build_type(build_type)?
            .output_name
            .replace("-{version}", "")
            .replace("{version}", "");
        Ok(render(&template, vars))
    }
}

fn lookup<'a, T>(map: &'a BTreeMap<String, T>, what: &str, name: &str) -> Result<&'a T> {
    map.get(name)
        .ok_or_else(|| CloudImagesError::validation(format!("Unknown {}: {}", what, name)))
}

fn render(template: &str, vars: &NameVars) -> String {
    template
        .replace("{release_id}", &vars.release_id)
        .replace("{vendor}", &vars.vendor)
        .replace("{arch}", &vars.arch)
        .replace("{build_id}", &vars.build_id)
        .replace("{version}", &vars.version)
}
