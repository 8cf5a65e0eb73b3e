// file: src/image/builder/mod.rs
// version: 2.0.0
// guid: e1e2e3e4-f5f6-7890-1234-567890efghij

//! Image builds with FAI inside the sandbox

pub mod sandbox;

pub use sandbox::Sandbox;

use crate::api::documents::INFO_UPLOAD;
use crate::api::{Build, Package};
use crate::config::{Architecture, ImageConfig, ImageKey, NameVars};
use crate::error::CloudImagesError;
use crate::image::archive::DISK_IMAGE_NAME;
use crate::image::version::{AzureImageVersion, ImageVersion};
use crate::manifest::{BuildManifest, ManifestBus};
use crate::utils::system::{run_checked, CommandRunner, CommandSpec};
use crate::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Package list left by the installer, `dpkg-query -W` format
pub const PACKAGES_FILE: &str = "packages.txt";

/// One image to build
#[derive(Debug, Clone, PartialEq)]
pub struct BuildRequest {
    pub release: String,
    pub vendor: String,
    pub arch: Architecture,
    pub build_type: String,
    pub version: ImageVersion,
    pub build_id: String,
    /// FAI config space
    pub config_space: PathBuf,
    pub output_dir: PathBuf,
    /// Pack as `.tar.xz` instead of `.tar`
    pub compress: bool,
}

impl BuildRequest {
    fn key(&self) -> ImageKey<'_> {
        ImageKey {
            arch: self.arch.as_str(),
            release: &self.release,
            vendor: &self.vendor,
            build_type: &self.build_type,
        }
    }
}

/// Golden image builder driving `fai-diskimage`
pub struct ImageBuilder {
    runner: Arc<dyn CommandRunner>,
    catalog: Arc<ImageConfig>,
}

impl ImageBuilder {
    pub fn new(runner: Arc<dyn CommandRunner>, catalog: Arc<ImageConfig>) -> Self {
        Self { runner, catalog }
    }

    /// Artifact name of the request
    pub fn output_name(&self, request: &BuildRequest) -> Result<String> {
        let release = self.catalog.release(&request.release)?;
        self.catalog.output_name(
            &request.build_type,
            &NameVars {
                release_id: release.id.clone(),
                vendor: request.vendor.clone(),
                arch: request.arch.to_string(),
                build_id: request.build_id.clone(),
                version: request.version.to_string(),
            },
        )
    }

    /// Installer arguments for the request
    pub fn installer_args(&self, request: &BuildRequest) -> Result<Vec<String>> {
        let classes = self.catalog.classes(&request.key())?;
        let size_gb = self.catalog.vendor(&request.vendor)?.size_gb;
        Ok(vec![
            "fai-diskimage".to_string(),
            "--verbose".to_string(),
            "--hostname".to_string(),
            "debian".to_string(),
            "--class".to_string(),
            classes.to_arg(),
            "--size".to_string(),
            format!("{}G", size_gb),
            "--cspace".to_string(),
            "/config".to_string(),
            format!("/output/{}", DISK_IMAGE_NAME),
        ])
    }

    fn build_info(&self, request: &BuildRequest, upload_enabled: bool) -> Result<BTreeMap<String, String>> {
        let release = self.catalog.release(&request.release)?;
        let mut info = BTreeMap::new();
        info.insert("arch".to_string(), request.arch.to_string());
        info.insert("build_id".to_string(), request.build_id.clone());
        info.insert("release".to_string(), release.basename.clone());
        info.insert("release_id".to_string(), release.id.clone());
        info.insert("type".to_string(), request.build_type.clone());
        info.insert("vendor".to_string(), request.vendor.clone());
        info.insert("version".to_string(), request.version.to_string());
        info.insert(
            "version_azure".to_string(),
            AzureImageVersion::from_image_version(&request.version).to_string(),
        );
        if !upload_enabled {
            info.insert(INFO_UPLOAD.to_string(), "false".to_string());
        }
        Ok(info)
    }

    /// Build the image, pack it and write its build manifest
    pub async fn build(&self, sandbox: Sandbox, request: &BuildRequest) -> Result<BuildManifest> {
        let matched = self.catalog.evaluate(&request.key())?;
        if !matched.enabled {
            return Err(CloudImagesError::precondition(format!(
                "Image {} {} {} {} is disabled in the catalog",
                request.release, request.vendor, request.arch, request.build_type
            )));
        }
        let name = self.output_name(request)?;
        info!("Building image {}", name);

        fs::create_dir_all(&request.output_dir)?;
        let work = tempfile::Builder::new()
            .prefix(".build-")
            .tempdir_in(&request.output_dir)?;

        let release = self.catalog.release(&request.release)?;
        let sandbox = sandbox
            .bind(&request.config_space, "/config", false)
            .bind(work.path(), "/output", true)
            .env("CLOUD_BUILD_DATA", "/output")
            .env("CLOUD_RELEASE_ID", release.id.clone())
            .env("CLOUD_RELEASE_VERSION", request.version.to_string());
        sandbox.run(&self.installer_args(request)?).await?;

        let archive = self.pack(work.path(), &request.output_dir, &name, request.compress).await?;
        info!("Packed {}", archive.display());

        let packages = read_packages(&work.path().join(PACKAGES_FILE))?;
        let mut build = Build::new(self.build_info(request, matched.upload_enabled)?, packages);
        build.apply_info_labels();

        let bus = ManifestBus::new(&request.output_dir);
        let path = bus.write_build(&name, &build)?;
        if !matched.upload_enabled {
            warn!("Uploads are disabled for {}, upload stages will skip it", name);
        }
        Ok(BuildManifest { name, path, build })
    }

    async fn pack(&self, work: &Path, output_dir: &Path, name: &str, compress: bool) -> Result<PathBuf> {
        let archive = output_dir.join(if compress {
            format!("{}.tar.xz", name)
        } else {
            format!("{}.tar", name)
        });
        let mut command = CommandSpec::new("tar")
            .args(["--sparse", "--create", "--file"])
            .arg(archive.display().to_string());
        if compress {
            command = command.arg("--xz");
        }
        command = command
            .arg("--directory")
            .arg(work.display().to_string())
            .arg(DISK_IMAGE_NAME);

        if let Err(e) = run_checked(self.runner.as_ref(), &command).await {
            // No half-written artifact next to the manifests
            let _ = fs::remove_file(&archive);
            return Err(e);
        }
        Ok(archive)
    }
}

/// Parse `name<TAB>version` lines as written by `dpkg-query -W`
pub fn parse_packages(content: &str) -> Vec<Package> {
    content
        .lines()
        .filter_map(|line| {
            let (name, version) = line.split_once('\t')?;
            let name = name.trim();
            (!name.is_empty()).then(|| Package::new(name, version.trim()))
        })
        .collect()
}

fn read_packages(path: &Path) -> Result<Vec<Package>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(parse_packages(&content)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Installer left no package list at {}", path.display());
            Ok(Vec::new())
        }
        Err(e) => Err(e.into()),
    }
}
