// file: src/api/wellknown.rs
// version: 1.0.0
// guid: 6c4b9e2f-1d8a-4f37-a05c-7e3b2d9c8f41

//! Well-known label and annotation keys

pub const LABEL_VENDOR: &str = "cloud.debian.org/vendor";
pub const LABEL_VERSION: &str = "cloud.debian.org/version";

pub const LABEL_ARCH: &str = "debian.org/arch";
pub const LABEL_DIST: &str = "debian.org/dist";
pub const LABEL_RELEASE: &str = "debian.org/release";

pub const LABEL_UPLOAD_IMAGE_FORMAT: &str = "upload.cloud.debian.org/image-format";
pub const LABEL_UPLOAD_PROVIDER: &str = "upload.cloud.debian.org/provider";
pub const LABEL_UPLOAD_TYPE: &str = "upload.cloud.debian.org/type";

pub const LABEL_AZURE_ARCH: &str = "azure.upload.cloud.debian.org/arch";
pub const LABEL_AWS_REGION: &str = "aws.upload.cloud.debian.org/region";
pub const LABEL_GCE_PROJECT: &str = "gce.upload.cloud.debian.org/project";

pub const LABEL_BUILD_ID: &str = "build.cloud.debian.org/build-id";
pub const LABEL_BUILD_TYPE: &str = "build.cloud.debian.org/type";

pub const ANNOTATION_DIGEST: &str = "cloud.debian.org/digest";
