// file: src/cli/commands.rs
// version: 2.0.0
// guid: g7h8i9j0-k1l2-3456-7890-123456ghijkl

//! Command implementations for the CLI

use crate::{
    api::Upload,
    aws::{AwsClient, AwsCredentials, Ec2Pipeline, Ec2Target},
    azure::{
        AzureAuth, AzureClient, BlobService, Credentials, GalleryPipeline, GalleryTarget,
        PartnerPipeline, PartnerTarget,
    },
    config::{tool::require, Architecture, ConfigLoader, ImageConfig, ToolConfig},
    error::CloudImagesError,
    gce::{GceClient, GcePipeline, GceTarget, GoogleAuth, ServiceAccountKey},
    image::{BuildRequest, DiskAssembler, ImageArchive, ImageBuilder, ImageVersion, Sandbox},
    logging::with_operation_span,
    manifest::{BuildManifest, ManifestBus},
    network::{HttpTransport, ReqwestTransport},
    oci::OciStore,
    publish::PublicStorage,
    utils::{CommandRunner, ImageConverter, ImageFormat, SystemRunner},
    Result,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

/// Configuration and shared transports for one invocation
pub struct AppContext {
    pub tool: ToolConfig,
    pub catalog: Arc<ImageConfig>,
    pub runner: Arc<dyn CommandRunner>,
    pub http: Arc<dyn HttpTransport>,
}

impl AppContext {
    pub fn load(config: Option<&Path>, image_config: Option<&Path>) -> Result<Self> {
        let loader = ConfigLoader::new();
        Ok(Self {
            tool: loader.load_tool_config(config)?,
            catalog: Arc::new(loader.load_image_config(image_config)?),
            runner: Arc::new(SystemRunner),
            http: Arc::new(ReqwestTransport::new()?),
        })
    }

    fn azure_auth(&self, tenant: Option<&str>) -> Arc<AzureAuth> {
        let credentials = Credentials::from_config(&self.tool.azure.auth, tenant);
        Arc::new(AzureAuth::new(credentials, self.http.clone(), self.runner.clone()))
    }
}

/// One line of `list-builds`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildRow {
    pub name: String,
    pub release: String,
    pub vendor: String,
    pub arch: String,
    pub build_type: String,
    pub version: String,
}

impl BuildRow {
    pub fn from_manifest(manifest: &BuildManifest) -> Self {
        let info = |key: &str| manifest.build.info_opt(key).unwrap_or("-").to_string();
        Self {
            name: manifest.name.clone(),
            release: info("release"),
            vendor: info("vendor"),
            arch: info("arch"),
            build_type: info("type"),
            version: info("version"),
        }
    }
}

/// List the build manifests in a directory
pub async fn list_builds_command(dir: &Path, json: bool) -> Result<()> {
    let manifests = with_operation_span("discover", || ManifestBus::new(dir).discover())?;
    let rows: Vec<BuildRow> = manifests
        .iter()
        .map(BuildRow::from_manifest)
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        info!("No build manifests in {}", dir.display());
        return Ok(());
    }

    println!(
        "{:<48} {:<10} {:<14} {:<6} {:<8} {}",
        "NAME", "RELEASE", "VENDOR", "ARCH", "TYPE", "VERSION"
    );
    for row in rows {
        println!(
            "{:<48} {:<10} {:<14} {:<6} {:<8} {}",
            row.name, row.release, row.vendor, row.arch, row.build_type, row.version
        );
    }
    Ok(())
}

/// Arguments of `build`
pub struct BuildArgs {
    pub release: String,
    pub vendor: String,
    pub arch: Architecture,
    pub build_type: String,
    pub version: String,
    pub build_id: String,
    pub config_space: PathBuf,
    pub output: PathBuf,
    pub compress: bool,
}

/// Build one image inside the user sandbox
pub async fn build_command(ctx: &AppContext, args: BuildArgs) -> Result<()> {
    let request = BuildRequest {
        release: args.release,
        vendor: args.vendor,
        arch: args.arch,
        build_type: args.build_type,
        version: ImageVersion::from_string(&args.version)?,
        build_id: args.build_id,
        config_space: args.config_space,
        output_dir: args.output,
        compress: args.compress,
    };

    let sandbox = Sandbox::for_current_user(ctx.runner.clone())?;
    let manifest = ImageBuilder::new(ctx.runner.clone(), ctx.catalog.clone())
        .build(sandbox, &request)
        .await?;

    info!("Build manifest written to {}", manifest.path.display());
    Ok(())
}

/// Convert a raw disk, or the disk inside a build archive
pub async fn convert_command(
    ctx: &AppContext,
    input: &Path,
    output: &Path,
    format: ImageFormat,
) -> Result<()> {
    if !input.is_file() {
        return Err(CloudImagesError::not_found(format!(
            "Input {} does not exist",
            input.display()
        )));
    }

    let converter = ImageConverter::new(ctx.runner.clone());
    if is_archive(input) {
        let disk = ImageArchive::open(input)?.extract_disk_temp()?;
        converter.convert(disk.path(), output, format).await?;
    } else {
        converter.convert(input, output, format).await?;
    }

    info!("Converted {} to {}", input.display(), output.display());
    Ok(())
}

fn is_archive(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
    name.ends_with(".tar") || name.ends_with(".tar.xz")
}

/// Assemble a GPT disk from an OCI layout
pub async fn assemble_command(
    ctx: &AppContext,
    store: &Path,
    output: &Path,
    arch: Architecture,
    size_gb: u64,
) -> Result<()> {
    if size_gb == 0 {
        return Err(CloudImagesError::validation("Disk size must be at least 1 GiB"));
    }
    let store = OciStore::init(store)?;
    let sandbox = Sandbox::for_current_user(ctx.runner.clone())?;
    let layout = DiskAssembler::new(ctx.runner.clone(), arch, size_gb << 30)
        .assemble(sandbox, &store, output)
        .await?;

    info!(
        "Assembled {} ({} bytes) with {} partitions",
        output.display(),
        layout.disk_size,
        layout.partitions.len()
    );
    Ok(())
}

/// Publish builds to Azure
pub async fn upload_azure_command(ctx: &AppContext, dir: &Path, partner: bool) -> Result<()> {
    let bus = ManifestBus::new(dir);
    let azure = &ctx.tool.azure;

    let uploads = if partner {
        let target = PartnerTarget::from_config(azure)?;
        let auth = ctx.azure_auth(azure.storage.tenant.as_deref());
        let client = Arc::new(AzureClient::new(auth.clone(), ctx.http.clone()));
        let blobs = BlobService::new(&target.account, auth, ctx.http.clone());
        PartnerPipeline::new(client, blobs, ctx.runner.clone(), target)
            .run(&bus)
            .await?
    } else {
        let target = GalleryTarget::from_config(azure)?;
        let client = Arc::new(AzureClient::new(ctx.azure_auth(None), ctx.http.clone()));
        GalleryPipeline::new(client, ctx.runner.clone(), target)
            .run(&bus)
            .await?
    };

    report_uploads(&uploads);
    Ok(())
}

/// Publish builds as EC2 AMIs
pub async fn upload_ec2_command(ctx: &AppContext, dir: &Path) -> Result<()> {
    let target = Ec2Target::from_config(&ctx.tool.ec2)?;
    let credentials = AwsCredentials::from_config(&ctx.tool.ec2.auth)?;
    let client = Arc::new(AwsClient::new(credentials, ctx.http.clone()));

    let uploads = Ec2Pipeline::new(client, ctx.runner.clone(), target)
        .run(&ManifestBus::new(dir))
        .await?;
    report_uploads(&uploads);
    Ok(())
}

/// Publish builds as GCE images
pub async fn upload_gce_command(ctx: &AppContext, dir: &Path) -> Result<()> {
    let gce = &ctx.tool.gce;
    let target = GceTarget::from_config(gce)?;
    let key_file = require(gce.auth.credentialsfile.as_deref(), "gce.auth.credentialsfile")?;
    let auth = GoogleAuth::new(ServiceAccountKey::from_file(key_file)?, ctx.http.clone())?;
    let client = Arc::new(GceClient::new(Arc::new(auth), ctx.http.clone()));

    let uploads = GcePipeline::new(client, target)
        .run(&ManifestBus::new(dir))
        .await?;
    report_uploads(&uploads);
    Ok(())
}

/// Publish builds into the public storage tree
pub async fn publish_command(
    ctx: &AppContext,
    dir: &Path,
    root: Option<PathBuf>,
    provider: Option<String>,
) -> Result<()> {
    let publish = &ctx.tool.publish;
    let root = match root {
        Some(root) => root,
        None => require(publish.root.as_deref(), "publish.root")?.to_path_buf(),
    };

    let mut storage = PublicStorage::new(root, ctx.catalog.clone(), ctx.runner.clone());
    if let Some(provider) = provider.or_else(|| publish.provider.clone()) {
        storage = storage.with_provider(provider);
    }

    let uploads = storage.run(&ManifestBus::new(dir)).await?;
    report_uploads(&uploads);
    Ok(())
}

fn report_uploads(uploads: &[Upload]) {
    for upload in uploads {
        println!("{:<20} {}", upload.data.provider, upload.data.reference);
    }
    info!("{} upload(s) recorded", uploads.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::bus::testing;
    use tempfile::TempDir;

    #[test]
    fn test_build_row_from_manifest() {
        let dir = TempDir::new().unwrap();
        let build = testing::build("generic", "amd64", "20240904-1860", "daily");
        let manifest = testing::write_artifact(dir.path(), "debian-12-generic-amd64", &build, b"disk");

        let row = BuildRow::from_manifest(&manifest);
        assert_eq!(row.name, "debian-12-generic-amd64");
        assert_eq!(row.release, "bookworm");
        assert_eq!(row.build_type, "daily");
        assert_eq!(row.version, "20240904-1860");
    }

    #[test]
    fn test_archive_detection() {
        assert!(is_archive(Path::new("out/debian-12-generic-amd64.tar")));
        assert!(is_archive(Path::new("debian-12-generic-amd64.tar.xz")));
        assert!(!is_archive(Path::new("disk.raw")));
    }

    #[tokio::test]
    async fn test_list_builds_empty_dir() {
        let dir = TempDir::new().unwrap();
        assert!(list_builds_command(dir.path(), true).await.is_ok());
    }
}
