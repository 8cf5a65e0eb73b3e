// file: src/config/mod.rs
// version: 2.0.0
// guid: a1b2c3d4-e5f6-7a8b-9c0d-1e2f3a4b5c6d

//! Configuration module for the image tooling
//!
//! Handles the static image catalog, FAI class sets and the tool
//! configuration with its environment overrides.

pub mod classes;
pub mod image;
pub mod loader;
pub mod tool;

pub use classes::Classes;
pub use image::{ImageConfig, ImageKey, MatchOp, MatchRule, NameVars};
pub use loader::ConfigLoader;
pub use tool::ToolConfig;

use serde::{Deserialize, Serialize};

/// Supported image architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "amd64")]
    Amd64,
    #[serde(rename = "arm64")]
    Arm64,
}

impl Architecture {
    /// Debian architecture name
    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "amd64",
            Architecture::Arm64 => "arm64",
        }
    }

    /// Architecture name used by Azure compute APIs
    pub fn azure_name(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "x64",
            Architecture::Arm64 => "arm64",
        }
    }

    /// Architecture name used by EC2
    pub fn ec2_name(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "x86_64",
            Architecture::Arm64 => "arm64",
        }
    }

    /// GPT partition type of the root filesystem
    pub fn root_partition_type(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "4f68bce3-e8cd-4db1-96e7-fbcaf984b709",
            Architecture::Arm64 => "b921b045-1df0-41c3-af44-4c6f280d3fae",
        }
    }

    /// Whether images boot with legacy BIOS support in addition to UEFI
    pub fn has_bios_boot(&self) -> bool {
        matches!(self, Architecture::Amd64)
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Architecture {
    type Err = crate::error::CloudImagesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd64" | "x86_64" => Ok(Architecture::Amd64),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            _ => Err(crate::error::CloudImagesError::validation(format!(
                "Unknown architecture: {}",
                s
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_names() {
        assert_eq!("aarch64".parse::<Architecture>().unwrap(), Architecture::Arm64);
        assert_eq!(Architecture::Amd64.azure_name(), "x64");
        assert_eq!(Architecture::Arm64.ec2_name(), "arm64");
        assert!("riscv64".parse::<Architecture>().is_err());
    }
}
