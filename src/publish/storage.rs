// file: src/publish/storage.rs
// version: 1.0.0
// guid: 4f8a1c3e-6d2b-4b97-a0e5-2c9d8e7f6a5b

//! Public image tree
//!
//! Layout below the root:
//!
//! ```text
//! {release}/{public_type}/{version}/{name}.tar[.xz]
//! {release}/{public_type}/{version}/{name}.json
//! {release}/{public_type}/{version}/{name}.{raw,qcow2}   (generic vendors)
//! {release}/{public_type}/{version}/SHA512SUMS
//! {release}/{public_type}/{version}/.latest/...          (unversioned names)
//! {release}/{public_type}/latest -> {version}/.latest
//! ```

use super::staging::{replace_symlink, set_mode, StagingDir, DIR_MODE, FILE_MODE};
use crate::api::{wellknown, Upload};
use crate::config::{ImageConfig, NameVars};
use crate::error::CloudImagesError;
use crate::image::version::ImageVersion;
use crate::image::ImageArchive;
use crate::manifest::bus::{provider_labels, write_merged};
use crate::manifest::{BuildManifest, ManifestBus};
use crate::utils::crypto::{sha512_annotation, sha512_file};
use crate::utils::qemu::{ImageConverter, ImageFormat};
use crate::utils::system::CommandRunner;
use crate::Result;
use sha2::{Digest, Sha512};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

pub const DEFAULT_PROVIDER: &str = "cloud.debian.org";
pub const STAGE_PUBLIC: &str = "upload-public";
pub const SUMS_FILE: &str = "SHA512SUMS";
pub const LATEST_DIR: &str = ".latest";
pub const LATEST_LINK: &str = "latest";

/// Vendors whose images are also published as raw and qcow2 disks
pub const DISK_VENDORS: &[&str] = &["generic", "genericcloud", "nocloud"];

const FORMAT_INTERNAL: &str = "internal";

/// One published file: name in the version directory, name in `.latest`,
/// and its digest
#[derive(Debug, Clone)]
struct PublishedFile {
    name: String,
    latest_name: String,
    digest: Vec<u8>,
}

/// Files of one version directory, checksummed as they are written
#[derive(Debug, Default)]
struct VersionFiles {
    files: Vec<PublishedFile>,
}

impl VersionFiles {
    fn add(&mut self, dir: &Path, latest_dir: &Path, file: PublishedFile) -> Result<()> {
        set_mode(&dir.join(&file.name), FILE_MODE)?;
        fs::hard_link(dir.join(&file.name), latest_dir.join(&file.latest_name))?;
        self.files.push(file);
        Ok(())
    }

    fn sums(&self, latest: bool) -> String {
        let mut entries: Vec<(&str, &[u8])> = self
            .files
            .iter()
            .map(|f| {
                let name = if latest { &f.latest_name } else { &f.name };
                (name.as_str(), f.digest.as_slice())
            })
            .collect();
        entries.sort();
        entries
            .into_iter()
            .map(|(name, digest)| format!("{}  {}\n", hex::encode(digest), name))
            .collect()
    }

    fn write_sums(&self, dir: &Path, latest: bool) -> Result<()> {
        let path = dir.join(SUMS_FILE);
        let mut file = File::create(&path)?;
        file.write_all(self.sums(latest).as_bytes())?;
        file.sync_all()?;
        set_mode(&path, FILE_MODE)
    }
}

/// Publisher into a local public image tree
pub struct PublicStorage {
    root: PathBuf,
    provider: String,
    catalog: Arc<ImageConfig>,
    converter: ImageConverter,
}

impl PublicStorage {
    pub fn new(
        root: impl Into<PathBuf>,
        catalog: Arc<ImageConfig>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            root: root.into(),
            provider: DEFAULT_PROVIDER.to_string(),
            catalog,
            converter: ImageConverter::new(runner),
        }
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Publish every build on the bus. Versions are committed one at a
    /// time; a failing version leaves the others in place and its error is
    /// returned after all were tried.
    pub async fn run(&self, bus: &ManifestBus) -> Result<Vec<Upload>> {
        let (manifests, mut first_error) = bus.scan()?.into_parts();
        let mut groups: BTreeMap<(String, String, String), Vec<BuildManifest>> = BTreeMap::new();
        for manifest in manifests {
            if !manifest.build.upload_enabled() {
                info!("Uploads are disabled for {}, not publishing", manifest.name);
                continue;
            }
            match version_key(&manifest) {
                Ok(key) => groups.entry(key).or_default().push(manifest),
                Err(e) => {
                    error!("Cannot publish {}: {}", manifest.name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        let mut uploads = Vec::new();
        for ((release, build_type, version), manifests) in groups {
            match self.publish_version(&release, &build_type, &version, &manifests).await {
                Ok(published) => {
                    for (manifest, produced) in manifests.iter().zip(published) {
                        match bus.write_stage(&manifest.name, STAGE_PUBLIC, &produced) {
                            Ok(_) => uploads.extend(produced),
                            Err(e) => {
                                error!("Failed to record {} for {}: {}", STAGE_PUBLIC, manifest.name, e);
                                first_error.get_or_insert(e);
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Publishing {} {} {} failed: {}", release, build_type, version, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(uploads),
        }
    }

    /// Publish all builds of one version into `{release}/{public_type}/{version}`.
    ///
    /// Returns the uploads per build, in input order.
    pub async fn publish_version(
        &self,
        release: &str,
        build_type: &str,
        version: &str,
        manifests: &[BuildManifest],
    ) -> Result<Vec<Vec<Upload>>> {
        ImageVersion::from_string(version)?;
        let public_type = self.catalog.public_type(build_type)?;
        let relative = Path::new(release).join(&public_type.path);
        let base = self.root.join(&relative);
        fs::create_dir_all(&base)?;

        info!("Publishing {} builds to {}/{}", manifests.len(), base.display(), version);

        let staging = StagingDir::create(&base, version)?;
        let latest_dir = staging.path().join(LATEST_DIR);
        fs::create_dir(&latest_dir)?;
        set_mode(&latest_dir, DIR_MODE)?;

        let mut files = VersionFiles::default();
        let mut published = Vec::with_capacity(manifests.len());
        for manifest in manifests {
            let reference_dir = relative.join(version);
            published.push(
                self.publish_build(manifest, staging.path(), &latest_dir, &reference_dir, &mut files)
                    .await?,
            );
        }

        files.write_sums(staging.path(), false)?;
        files.write_sums(&latest_dir, true)?;

        staging.commit(&base.join(version))?;
        replace_symlink(&Path::new(version).join(LATEST_DIR), &base.join(LATEST_LINK))?;
        Ok(published)
    }

    async fn publish_build(
        &self,
        manifest: &BuildManifest,
        dir: &Path,
        latest_dir: &Path,
        reference_dir: &Path,
        files: &mut VersionFiles,
    ) -> Result<Vec<Upload>> {
        let build = &manifest.build;
        let build_type = build.info("type")?;
        let vars = NameVars {
            release_id: build.release_id()?.to_string(),
            vendor: build.vendor()?.to_string(),
            arch: build.arch()?.to_string(),
            build_id: build.info_opt("build_id").unwrap_or_default().to_string(),
            version: build.version()?.to_string(),
        };
        let file_base = self.catalog.output_name(build_type, &vars)?;
        let latest_base = self.catalog.output_name_latest(build_type, &vars)?;

        let artifact = ImageArchive::open(manifest.artifact_path()?)?;
        let tar_ext = if artifact.is_compressed() { "tar.xz" } else { "tar" };

        let mut produced = Vec::new();
        let mut outputs: Vec<(String, String, &str)> = Vec::new();

        let tar_name = format!("{}.{}", file_base, tar_ext);
        let digest = copy_hashed(artifact.path(), &dir.join(&tar_name))?;
        outputs.push((tar_name, format!("{}.{}", latest_base, tar_ext), FORMAT_INTERNAL));
        let mut digests = vec![digest];

        if DISK_VENDORS.contains(&build.vendor()?) {
            let raw_name = format!("{}.raw", file_base);
            let raw_path = dir.join(&raw_name);
            artifact.extract_disk(&raw_path)?;
            digests.push(sha512_file(&raw_path)?);
            outputs.push((raw_name, format!("{}.raw", latest_base), ImageFormat::Raw.as_str()));

            let qcow2_name = format!("{}.qcow2", file_base);
            let qcow2_path = dir.join(&qcow2_name);
            self.converter
                .convert(&raw_path, &qcow2_path, ImageFormat::Qcow2)
                .await?;
            digests.push(sha512_file(&qcow2_path)?);
            outputs.push((qcow2_name, format!("{}.qcow2", latest_base), ImageFormat::Qcow2.as_str()));
        }

        for ((name, latest_name, format), digest) in outputs.into_iter().zip(digests) {
            let reference = reference_dir.join(&name);
            let [provider, upload_type] = provider_labels(&self.provider, build_type);
            let mut upload = manifest.derive_upload(
                &self.provider,
                &reference.to_string_lossy(),
                None,
                &[provider, upload_type, (wellknown::LABEL_UPLOAD_IMAGE_FORMAT, format)],
            );
            upload.metadata = upload
                .metadata
                .with_annotation(wellknown::ANNOTATION_DIGEST, sha512_annotation(&digest));
            produced.push(upload);
            files.add(
                dir,
                latest_dir,
                PublishedFile {
                    name,
                    latest_name,
                    digest,
                },
            )?;
        }

        let json_name = format!("{}.json", file_base);
        let json_path = dir.join(&json_name);
        write_merged(&json_path, build, &produced)?;
        let digest = sha512_file(&json_path)?;
        files.add(
            dir,
            latest_dir,
            PublishedFile {
                name: json_name,
                latest_name: format!("{}.json", latest_base),
                digest,
            },
        )?;

        info!("Published {} as {} ({} files)", manifest.name, file_base, produced.len() + 1);
        Ok(produced)
    }
}

/// Release, type and version a build is published under
fn version_key(manifest: &BuildManifest) -> Result<(String, String, String)> {
    let build = &manifest.build;
    Ok((
        build.release()?.to_string(),
        build.info("type")?.to_string(),
        build.version()?.to_string(),
    ))
}

/// Copy `src` to `dst`, returning the SHA-512 of the content
fn copy_hashed(src: &Path, dst: &Path) -> Result<Vec<u8>> {
    let mut input = File::open(src)
        .map_err(|e| CloudImagesError::not_found(format!("{}: {}", src.display(), e)))?;
    let mut output = File::create(dst)?;
    let mut hasher = Sha512::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        output.write_all(&buf[..n])?;
    }
    output.sync_all()?;
    Ok(hasher.finalize().to_vec())
}
