// file: src/gce/pipeline.rs
// version: 1.0.0
// guid: 8f2a6c0e-5b7d-4e39-a1c4-9b0c1d2e3f4a

//! GCE publishing: gzip the disk archive, upload it to Cloud Storage and
//! create an image from it

use super::client::{GceClient, ImageSpec};
use crate::api::{wellknown, Upload};
use crate::config::tool::{require, GceConfig};
use crate::config::Architecture;
use crate::error::CloudImagesError;
use crate::image::ImageArchive;
use crate::manifest::bus::provider_labels;
use crate::manifest::{BuildManifest, ManifestBus, StageResult};
use crate::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const GCE_PROVIDER: &str = "googleapis.com";
pub const STAGE_GCE: &str = "upload-gce";

const GZIP_LEVEL: u32 = 3;
const READ_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GceTarget {
    pub project: String,
    pub bucket: String,
}

impl GceTarget {
    pub fn from_config(config: &GceConfig) -> Result<Self> {
        Ok(Self {
            project: require(config.image.project.as_deref(), "gce.image.project")?.to_string(),
            bucket: require(config.storage.name.as_deref(), "gce.storage.name")?.to_string(),
        })
    }
}

/// Image family per release and architecture
pub fn image_family(release_id: &str, arch: Architecture) -> String {
    match arch {
        Architecture::Amd64 => format!("debian-{}", release_id),
        Architecture::Arm64 => format!("debian-{}-arm64", release_id),
    }
}

fn gce_architecture(arch: Architecture) -> &'static str {
    match arch {
        Architecture::Amd64 => "X86_64",
        Architecture::Arm64 => "ARM64",
    }
}

/// Gzip the archive into `dest`, decompressing `.tar.xz` input on the way.
///
/// Returns the compressed size.
pub fn gzip_archive(archive: &ImageArchive, dest: &Path) -> Result<u64> {
    let input = File::open(archive.path())?;
    let mut reader: Box<dyn Read> = if archive.is_compressed() {
        Box::new(xz2::read::XzDecoder::new(input))
    } else {
        Box::new(input)
    };

    let mut encoder = GzEncoder::new(BufWriter::new(File::create(dest)?), Compression::new(GZIP_LEVEL));
    let mut buf = vec![0u8; READ_SIZE];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        encoder.write_all(&buf[..n])?;
    }
    let mut writer = encoder.finish()?;
    writer.flush()?;
    Ok(std::fs::metadata(dest)?.len())
}

pub struct GcePipeline {
    client: Arc<GceClient>,
    target: GceTarget,
}

impl GcePipeline {
    pub fn new(client: Arc<GceClient>, target: GceTarget) -> Self {
        Self { client, target }
    }

    /// Publish one build as a GCE image
    pub async fn upload(&self, manifest: &BuildManifest) -> Result<Upload> {
        let build = &manifest.build;
        let arch: Architecture = build.arch()?.parse()?;
        let release_id = build.release_id()?;
        let name = &manifest.name;
        let project = &self.target.project;

        if self.client.image_exists(project, name).await? {
            return Err(CloudImagesError::precondition(format!(
                "Image {} already exists in {}",
                name, project
            )));
        }

        let archive = ImageArchive::open(manifest.artifact_path()?)?;
        let dir = tempfile::Builder::new().prefix("gce-").tempdir()?;
        let object = format!("{}.tar.gz", name);
        let compressed = dir.path().join(&object);
        let size = gzip_archive(&archive, &compressed)?;
        info!("Compressed {} to {} bytes", archive.path().display(), size);

        let bucket = &self.target.bucket;
        self.client.upload_object(bucket, &object, &compressed).await?;

        let family = image_family(release_id, arch);
        let image = ImageSpec {
            name: name.clone(),
            family: family.clone(),
            description: format!("Debian {} ({})", release_id, build.version()?),
            source_uri: self.client.object_url(bucket, &object),
            architecture: gce_architecture(arch).to_string(),
        };
        let created = self.client.create_image(project, &image).await;

        if let Err(e) = self.client.delete_object(bucket, &object).await {
            warn!("Failed to delete gs://{}/{}: {}", bucket, object, e);
        }
        created?;

        let build_type = build.info_opt("type").unwrap_or("dev");
        let [provider, upload_type] = provider_labels(GCE_PROVIDER, build_type);
        Ok(manifest.derive_upload(
            GCE_PROVIDER,
            &format!("projects/{}/global/images/{}", project, name),
            Some(format!("projects/{}/global/images/family/{}", project, family)),
            &[provider, upload_type, (wellknown::LABEL_GCE_PROJECT, project.as_str())],
        ))
    }

    pub async fn run(&self, bus: &ManifestBus) -> Result<Vec<Upload>> {
        bus.run_stage(STAGE_GCE, |manifest| async move {
            StageResult::from(self.upload(&manifest).await)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gce::auth::testing::token_response;
    use crate::gce::client::testing::client;
    use crate::manifest::bus::testing::{build, write_artifact};
    use crate::network::http::testing::MockTransport;
    use crate::network::http::HttpResponse;
    use flate2::read::GzDecoder;
    use serde_json::json;
    use tempfile::TempDir;

    fn target() -> GceTarget {
        GceTarget {
            project: "debian-cloud".to_string(),
            bucket: "debian-cloud-images".to_string(),
        }
    }

    fn gce(request: &crate::network::http::testing::RecordedRequest, exists: bool) -> HttpResponse {
        let route = request.route();
        match route.as_str() {
            "POST /token" => token_response(),
            r if r.starts_with("GET /compute/v1/projects/debian-cloud/global/images/") => {
                if exists {
                    HttpResponse::new(200).with_body("{}")
                } else {
                    HttpResponse::new(404)
                }
            }
            "POST /compute/v1/projects/debian-cloud/global/images" => {
                HttpResponse::new(200).with_json(&json!({"name": "op-1", "status": "RUNNING"}))
            }
            r if r.contains("/operations/") => {
                HttpResponse::new(200).with_json(&json!({"name": "op-1", "status": "DONE"}))
            }
            _ => HttpResponse::new(200).with_body("{}"),
        }
    }

    #[tokio::test]
    async fn test_upload_creates_image_from_gzip() {
        let dir = TempDir::new().unwrap();
        let manifest = write_artifact(
            dir.path(),
            "debian-12-gce-arm64-daily-20240904-1860",
            &build("gce", "arm64", "20240904-1860", "daily"),
            b"disk",
        );
        let http = Arc::new(MockTransport::new(|r| gce(r, false)));

        let upload = GcePipeline::new(client(http.clone()), target())
            .upload(&manifest)
            .await
            .unwrap();

        assert_eq!(
            upload.reference(),
            "projects/debian-cloud/global/images/debian-12-gce-arm64-daily-20240904-1860"
        );
        assert_eq!(
            upload.data.family_ref.as_deref(),
            Some("projects/debian-cloud/global/images/family/debian-12-arm64")
        );

        let recorded = http.recorded();
        let routes: Vec<String> = recorded.iter().map(|r| r.route()).filter(|r| r != "POST /token").collect();
        assert_eq!(
            routes,
            vec![
                "GET /compute/v1/projects/debian-cloud/global/images/debian-12-gce-arm64-daily-20240904-1860",
                "POST /upload/storage/v1/b/debian-cloud-images/o",
                "POST /compute/v1/projects/debian-cloud/global/images",
                "GET /compute/v1/projects/debian-cloud/global/operations/op-1",
                "DELETE /storage/v1/b/debian-cloud-images/o/debian-12-gce-arm64-daily-20240904-1860.tar.gz",
            ]
        );

        // The uploaded object is the gzipped tar
        let object = recorded
            .iter()
            .find(|r| r.route() == "POST /upload/storage/v1/b/debian-cloud-images/o")
            .unwrap();
        let mut tar = Vec::new();
        GzDecoder::new(object.body.as_slice()).read_to_end(&mut tar).unwrap();
        assert_eq!(tar, std::fs::read(dir.path().join("debian-12-gce-arm64-daily-20240904-1860.tar")).unwrap());

        let insert = recorded
            .iter()
            .find(|r| r.route() == "POST /compute/v1/projects/debian-cloud/global/images")
            .unwrap()
            .json();
        assert_eq!(insert["architecture"], "ARM64");
        assert_eq!(insert["family"], "debian-12-arm64");
    }

    #[tokio::test]
    async fn test_existing_image_is_not_replaced() {
        let dir = TempDir::new().unwrap();
        let manifest = write_artifact(
            dir.path(),
            "debian-12-gce-amd64-daily-20240904-1860",
            &build("gce", "amd64", "20240904-1860", "daily"),
            b"disk",
        );
        let http = Arc::new(MockTransport::new(|r| gce(r, true)));

        let result = GcePipeline::new(client(http.clone()), target()).upload(&manifest).await;

        assert!(matches!(result, Err(CloudImagesError::PreconditionError(_))));
        assert!(!http.routes().iter().any(|r| r.starts_with("POST /upload")));
    }

    #[tokio::test]
    async fn test_run_writes_stage_manifest() {
        let dir = TempDir::new().unwrap();
        write_artifact(
            dir.path(),
            "debian-12-gce-amd64-daily-20240904-1860",
            &build("gce", "amd64", "20240904-1860", "daily"),
            b"disk",
        );
        let http = Arc::new(MockTransport::new(|r| gce(r, false)));
        let bus = ManifestBus::new(dir.path());

        GcePipeline::new(client(http), target()).run(&bus).await.unwrap();

        let stage = bus.read_stage("debian-12-gce-amd64-daily-20240904-1860", STAGE_GCE).unwrap();
        assert_eq!(
            stage[0].metadata.label(wellknown::LABEL_GCE_PROJECT),
            Some("debian-cloud")
        );
    }

    #[test]
    fn test_target_from_config() {
        let mut config = GceConfig::default();
        assert!(GceTarget::from_config(&config).is_err());
        config.image.project = Some("debian-cloud".to_string());
        config.storage.name = Some("bucket".to_string());
        assert_eq!(GceTarget::from_config(&config).unwrap().bucket, "bucket");
    }
}
