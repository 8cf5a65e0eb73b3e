// file: src/oci/layout.rs
// version: 1.0.0
// guid: 6a4f2e8d-1c3b-4d57-9e80-a2b3c4d5e6f7

//! OCI image layout documents and media types

use crate::error::CloudImagesError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const OCI_LAYOUT_FILE: &str = "oci-layout";
pub const OCI_LAYOUT_VERSION: &str = "1.0.0";
pub const INDEX_FILE: &str = "index.json";

pub const MEDIA_TYPE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const MEDIA_TYPE_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
pub const MEDIA_TYPE_LAYER_TAR_ZSTD: &str = "application/vnd.oci.image.layer.v1.tar+zstd";
pub const MEDIA_TYPE_DEBIAN_CONFIG: &str = "application/vnd.debian.cloud.oci.image.config.v1+json";
pub const MEDIA_TYPE_DEBIAN_MANIFEST: &str =
    "application/vnd.debian.cloud.oci.image.manifest.v1+json";

pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";
pub const ANNOTATION_PART_TYPE: &str = "org.debian.cloud.images.internal.part.type";
pub const ANNOTATION_PART_UUID: &str = "org.debian.cloud.images.internal.part.uuid";
pub const ANNOTATION_PART_FS_UUID: &str = "org.debian.cloud.images.internal.part.fs.uuid";

/// Ref name of the plain OCI manifest in the index
pub const REF_NAME_OCI: &str = "oci";
/// Ref name of the Debian specific manifest in the index
pub const REF_NAME_DEBIAN: &str = "debian";

/// The `oci-layout` marker file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OciLayout {
    #[serde(rename = "imageLayoutVersion")]
    pub image_layout_version: String,
}

impl Default for OciLayout {
    fn default() -> Self {
        Self {
            image_layout_version: OCI_LAYOUT_VERSION.to_string(),
        }
    }
}

/// Digest and size of a stored blob
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobInfo {
    pub algorithm: &'static str,
    pub digest: String,
    pub size: u64,
}

impl BlobInfo {
    pub fn sha256(digest: impl Into<String>, size: u64) -> Self {
        Self {
            algorithm: "sha256",
            digest: digest.into(),
            size,
        }
    }

    /// `algorithm:hex` form used in descriptors
    pub fn digest_ref(&self) -> String {
        format!("{}:{}", self.algorithm, self.digest)
    }

    pub fn descriptor(&self, media_type: &str) -> Descriptor {
        Descriptor {
            media_type: media_type.to_string(),
            digest: self.digest_ref(),
            size: self.size,
            annotations: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    /// Hex part of a sha256 digest
    pub fn sha256_hex(&self) -> Result<&str> {
        let hex = self.digest.strip_prefix("sha256:").ok_or_else(|| {
            CloudImagesError::integrity(format!("Unsupported digest algorithm: {}", self.digest))
        })?;
        if hex.len() != 64 || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CloudImagesError::integrity(format!(
                "Malformed digest: {}",
                self.digest
            )));
        }
        Ok(hex)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageIndex {
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: MEDIA_TYPE_INDEX.to_string(),
            manifests,
            annotations: BTreeMap::new(),
        }
    }

    /// Manifest descriptor registered under a ref name
    pub fn manifest_by_ref(&self, name: &str) -> Result<&Descriptor> {
        self.manifests
            .iter()
            .find(|m| m.annotation(ANNOTATION_REF_NAME) == Some(name))
            .ok_or_else(|| CloudImagesError::not_found(format!("No manifest with ref name '{}'", name)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != 2 || self.media_type != MEDIA_TYPE_INDEX {
            return Err(CloudImagesError::integrity(format!(
                "Unsupported index: schemaVersion {} mediaType {}",
                self.schema_version, self.media_type
            )));
        }
        for manifest in &self.manifests {
            if manifest.media_type != MEDIA_TYPE_MANIFEST
                && manifest.media_type != MEDIA_TYPE_DEBIAN_MANIFEST
            {
                return Err(CloudImagesError::integrity(format!(
                    "Unknown manifest media type: {}",
                    manifest.media_type
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl ImageManifest {
    pub fn new(media_type: &str, config: Descriptor, layers: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: media_type.to_string(),
            config,
            layers,
            annotations: BTreeMap::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.config.media_type != MEDIA_TYPE_CONFIG
            && self.config.media_type != MEDIA_TYPE_DEBIAN_CONFIG
        {
            return Err(CloudImagesError::integrity(format!(
                "Unknown config media type: {}",
                self.config.media_type
            )));
        }
        for layer in &self.layers {
            if layer.media_type != MEDIA_TYPE_LAYER_TAR && layer.media_type != MEDIA_TYPE_LAYER_TAR_ZSTD {
                return Err(CloudImagesError::integrity(format!(
                    "Unknown layer media type: {}",
                    layer.media_type
                )));
            }
        }
        Ok(())
    }

    /// Layer carrying the given partition
    pub fn partition_layer(&self, part: PartitionKind) -> Result<&Descriptor> {
        self.layers
            .iter()
            .find(|layer| layer.annotation(ANNOTATION_PART_TYPE) == Some(part.as_str()))
            .ok_or_else(|| {
                CloudImagesError::integrity(format!("Manifest lacks a {} partition layer", part.as_str()))
            })
    }
}

/// Partition a layer is destined for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionKind {
    Root,
    Efi,
}

impl PartitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionKind::Root => "root",
            PartitionKind::Efi => "efi",
        }
    }
}
