// file: src/api/documents.rs
// version: 1.0.0
// guid: b81e5a3d-4c2f-4e69-9a7d-1f0c6e8b2a57

//! Typed documents exchanged between the build and upload stages

use super::meta::ObjectMeta;
use super::wellknown;
use crate::config::{ImageConfig, ToolConfig};
use crate::error::CloudImagesError;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const API_VERSION_V1ALPHA1: &str = "cloud.debian.org/v1alpha1";
pub const API_VERSION_V1: &str = "v1";

/// Build info key recording that the catalog disabled uploads
pub const INFO_UPLOAD: &str = "upload";

/// A schema registered by (apiVersion, kind)
pub trait Document: Serialize + DeserializeOwned + Clone + Into<AnyDocument> {
    const KIND: &'static str;
    const API_VERSION: &'static str;

    /// Containers for fields unknown to the schema, by location
    fn extra_fields(&mut self) -> Vec<(&'static str, &mut Map<String, Value>)>;
}

/// One installed package of a build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
}

impl Package {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BuildData {
    #[serde(default)]
    pub info: BTreeMap<String, String>,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Result of one image build, written once by the builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Build {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub data: BuildData,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Build {
    pub fn new(info: BTreeMap<String, String>, packages: Vec<Package>) -> Self {
        Self {
            metadata: ObjectMeta::new(),
            data: BuildData {
                info,
                packages,
                extra: Map::new(),
            },
            extra: Map::new(),
        }
    }

    /// Required entry of the build info
    pub fn info(&self, key: &str) -> Result<&str> {
        self.data
            .info
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| CloudImagesError::validation(format!("Build info lacks '{}'", key)))
    }

    /// Whether upload stages may publish this build. Builds carry
    /// `upload: "false"` in their info when the catalog disabled uploads.
    pub fn upload_enabled(&self) -> bool {
        self.info_opt(INFO_UPLOAD) != Some("false")
    }

    /// Optional entry of the build info
    pub fn info_opt(&self, key: &str) -> Option<&str> {
        self.data.info.get(key).map(String::as_str)
    }

    pub fn arch(&self) -> Result<&str> {
        self.info("arch")
    }

    pub fn release(&self) -> Result<&str> {
        self.info("release")
    }

    pub fn release_id(&self) -> Result<&str> {
        self.info("release_id")
    }

    pub fn vendor(&self) -> Result<&str> {
        self.info("vendor")
    }

    pub fn version(&self) -> Result<&str> {
        self.info("version")
    }

    /// Fill the well-known labels from the build info
    pub fn apply_info_labels(&mut self) {
        let pairs = [
            ("arch", wellknown::LABEL_ARCH),
            ("release", wellknown::LABEL_RELEASE),
            ("release_id", wellknown::LABEL_DIST),
            ("vendor", wellknown::LABEL_VENDOR),
            ("version", wellknown::LABEL_VERSION),
            ("build_id", wellknown::LABEL_BUILD_ID),
            ("type", wellknown::LABEL_BUILD_TYPE),
        ];
        for (info_key, label) in pairs {
            if let Some(value) = self.data.info.get(info_key) {
                self.metadata.labels.insert(label.to_string(), value.clone());
            }
        }
    }
}

impl Document for Build {
    const KIND: &'static str = "Build";
    const API_VERSION: &'static str = API_VERSION_V1ALPHA1;

    fn extra_fields(&mut self) -> Vec<(&'static str, &mut Map<String, Value>)> {
        vec![
            ("", &mut self.extra),
            ("metadata", &mut self.metadata.extra),
            ("data", &mut self.data.extra),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct UploadData {
    pub provider: String,
    #[serde(rename = "ref")]
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family_ref: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Record of one artifact published to a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upload {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub data: UploadData,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Upload {
    pub fn new(
        metadata: ObjectMeta,
        provider: impl Into<String>,
        reference: impl Into<String>,
        family_ref: Option<String>,
    ) -> Self {
        Self {
            metadata,
            data: UploadData {
                provider: provider.into(),
                reference: reference.into(),
                family_ref,
                extra: Map::new(),
            },
            extra: Map::new(),
        }
    }

    pub fn provider(&self) -> &str {
        &self.data.provider
    }

    pub fn reference(&self) -> &str {
        &self.data.reference
    }
}

impl Document for Upload {
    const KIND: &'static str = "Upload";
    const API_VERSION: &'static str = API_VERSION_V1ALPHA1;

    fn extra_fields(&mut self) -> Vec<(&'static str, &mut Map<String, Value>)> {
        vec![
            ("", &mut self.extra),
            ("metadata", &mut self.metadata.extra),
            ("data", &mut self.data.extra),
        ]
    }
}

/// Image catalog wrapped as a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageConfigDocument {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub data: ImageConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document for ImageConfigDocument {
    const KIND: &'static str = "ImageConfig";
    const API_VERSION: &'static str = API_VERSION_V1ALPHA1;

    fn extra_fields(&mut self) -> Vec<(&'static str, &mut Map<String, Value>)> {
        vec![("", &mut self.extra), ("metadata", &mut self.metadata.extra)]
    }
}

/// Tool configuration wrapped as a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfigDocument {
    #[serde(default)]
    pub metadata: ObjectMeta,
    pub data: ToolConfig,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Document for ToolConfigDocument {
    const KIND: &'static str = "ToolConfig";
    const API_VERSION: &'static str = API_VERSION_V1ALPHA1;

    fn extra_fields(&mut self) -> Vec<(&'static str, &mut Map<String, Value>)> {
        vec![("", &mut self.extra), ("metadata", &mut self.metadata.extra)]
    }
}

/// Polymorphic list of documents
#[derive(Debug, Clone, PartialEq, Default)]
pub struct List {
    pub items: Vec<AnyDocument>,
}

impl List {
    pub const KIND: &'static str = "List";
    pub const API_VERSION: &'static str = API_VERSION_V1;

    pub fn new(items: Vec<AnyDocument>) -> Self {
        Self { items }
    }

    /// All items of the given document type
    pub fn of<D: Document>(&self) -> Vec<&D>
    where
        AnyDocument: AsDocument<D>,
    {
        self.items.iter().filter_map(|item| item.as_document()).collect()
    }
}

/// Any registered document
#[derive(Debug, Clone, PartialEq)]
pub enum AnyDocument {
    Build(Build),
    Upload(Upload),
    List(List),
    ImageConfig(ImageConfigDocument),
    ToolConfig(ToolConfigDocument),
}

impl AnyDocument {
    pub fn kind(&self) -> &'static str {
        match self {
            AnyDocument::Build(_) => Build::KIND,
            AnyDocument::Upload(_) => Upload::KIND,
            AnyDocument::List(_) => List::KIND,
            AnyDocument::ImageConfig(_) => ImageConfigDocument::KIND,
            AnyDocument::ToolConfig(_) => ToolConfigDocument::KIND,
        }
    }
}

/// Typed view of an `AnyDocument` variant
pub trait AsDocument<D> {
    fn as_document(&self) -> Option<&D>;
}

macro_rules! document_variant {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for AnyDocument {
            fn from(doc: $ty) -> Self {
                AnyDocument::$variant(doc)
            }
        }

        impl AsDocument<$ty> for AnyDocument {
            fn as_document(&self) -> Option<&$ty> {
                match self {
                    AnyDocument::$variant(doc) => Some(doc),
                    _ => None,
                }
            }
        }
    };
}

document_variant!(Build, Build);
document_variant!(Upload, Upload);
document_variant!(List, List);
document_variant!(ImageConfig, ImageConfigDocument);
document_variant!(ToolConfig, ToolConfigDocument);
