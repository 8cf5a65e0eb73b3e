// file: src/manifest/bus.rs
// version: 1.0.0
// guid: 7e2c5a9f-3b1d-4e86-9fa0-b1c2d3e4f5a6

//! Stage manifests on disk
//!
//! A build leaves `{name}.build.json` next to its `{name}.tar(.xz)`. Every
//! upload stage reads those and writes `{name}.{stage}.json` holding a list
//! of `Upload` records whose metadata is derived from the build.

use crate::api::documents::AnyDocument;
use crate::api::registry::{dump_typed, to_canonical_string, Registry, UnknownPolicy};
use crate::api::{wellknown, Build, List, ObjectMeta, Upload};
use crate::error::CloudImagesError;
use crate::Result;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

pub const BUILD_SUFFIX: &str = ".build.json";

/// A build manifest found on disk
#[derive(Debug, Clone, PartialEq)]
pub struct BuildManifest {
    /// File name prefix before `.build.json`
    pub name: String,
    pub path: PathBuf,
    pub build: Build,
}

impl BuildManifest {
    fn dir(&self) -> &Path {
        self.path.parent().unwrap_or_else(|| Path::new("."))
    }

    /// The artifact archive belonging to this build, `.tar` preferred
    pub fn artifact_path(&self) -> Result<PathBuf> {
        ["tar", "tar.xz"]
            .iter()
            .map(|ext| self.dir().join(format!("{}.{}", self.name, ext)))
            .find(|path| path.is_file())
            .ok_or_else(|| {
                CloudImagesError::not_found(format!(
                    "No artifact {}.tar or {}.tar.xz in {}",
                    self.name,
                    self.name,
                    self.dir().display()
                ))
            })
    }

    /// Metadata for a new upload: the build's labels and uid plus
    /// `labels`, which win over inherited values
    pub fn derive_metadata(&self, labels: &[(&str, &str)]) -> ObjectMeta {
        derive_metadata(&self.build, labels)
    }

    /// New upload record inheriting this build's metadata
    pub fn derive_upload(
        &self,
        provider: &str,
        reference: &str,
        family_ref: Option<String>,
        labels: &[(&str, &str)],
    ) -> Upload {
        Upload::new(self.derive_metadata(labels), provider, reference, family_ref)
    }
}

/// See [`BuildManifest::derive_metadata`]
pub fn derive_metadata(build: &Build, labels: &[(&str, &str)]) -> ObjectMeta {
    let mut source = build.clone();
    source.apply_info_labels();

    let mut metadata = build.metadata.copy();
    for (key, value) in source.metadata.labels {
        metadata.labels.entry(key).or_insert(value);
    }
    for (key, value) in labels {
        metadata.labels.insert(key.to_string(), value.to_string());
    }
    metadata
}

/// Outcome of scanning a manifest directory
#[derive(Debug, Default)]
pub struct Discovery {
    pub manifests: Vec<BuildManifest>,
    pub failures: Vec<(PathBuf, CloudImagesError)>,
}

impl Discovery {
    /// Readable manifests and the first failure, if any
    pub fn into_parts(self) -> (Vec<BuildManifest>, Option<CloudImagesError>) {
        (self.manifests, self.failures.into_iter().next().map(|(_, e)| e))
    }
}

/// Directory holding build and stage manifests
#[derive(Debug, Clone)]
pub struct ManifestBus {
    dir: PathBuf,
}

impl ManifestBus {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Every `*.build.json` in the directory, ordered by name. Manifests
    /// that cannot be read are reported in `failures` instead of stopping
    /// the scan.
    pub fn scan(&self) -> Result<Discovery> {
        let mut discovery = Discovery::default();
        for entry in fs::read_dir(&self.dir)? {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    discovery.failures.push((self.dir.clone(), e.into()));
                    continue;
                }
            };
            let Some(name) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(BUILD_SUFFIX))
                .map(str::to_string)
            else {
                continue;
            };
            if name.is_empty() || !path.is_file() {
                continue;
            }
            match read_build(&path) {
                Ok(build) => {
                    debug!("Discovered build manifest {}", path.display());
                    discovery.manifests.push(BuildManifest { name, path, build });
                }
                Err(e) => {
                    error!("Unreadable build manifest {}: {}", path.display(), e);
                    discovery.failures.push((path, e));
                }
            }
        }
        discovery.manifests.sort_by(|a, b| a.name.cmp(&b.name));
        discovery.failures.sort_by(|a, b| a.0.cmp(&b.0));
        info!(
            "Found {} build manifests in {}",
            discovery.manifests.len(),
            self.dir.display()
        );
        Ok(discovery)
    }

    /// The readable build manifests; unreadable ones are logged and skipped
    pub fn discover(&self) -> Result<Vec<BuildManifest>> {
        Ok(self.scan()?.manifests)
    }

    pub fn build_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}{}", name, BUILD_SUFFIX))
    }

    pub fn stage_path(&self, name: &str, stage: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.json", name, stage))
    }

    /// Write `{name}.build.json`
    pub fn write_build(&self, name: &str, build: &Build) -> Result<PathBuf> {
        let path = self.build_path(name);
        write_value(&path, &dump_typed(build)?)?;
        Ok(path)
    }

    /// Write `{name}.{stage}.json` holding the uploads of one stage
    pub fn write_stage(&self, name: &str, stage: &str, uploads: &[Upload]) -> Result<PathBuf> {
        let path = self.stage_path(name, stage);
        let list = List::new(uploads.iter().cloned().map(Into::into).collect());
        write_document(&path, &list.into())?;
        info!("Wrote {} upload records to {}", uploads.len(), path.display());
        Ok(path)
    }

    /// Uploads recorded by a stage
    pub fn read_stage(&self, name: &str, stage: &str) -> Result<Vec<Upload>> {
        let path = self.stage_path(name, stage);
        match read_document(&path)? {
            AnyDocument::List(list) => Ok(list.of::<Upload>().into_iter().cloned().collect()),
            other => Err(CloudImagesError::validation(format!(
                "{} holds a {}, expected a List",
                path.display(),
                other.kind()
            ))),
        }
    }
}

/// Outcome of one build in an upload stage: everything that was uploaded
/// plus the first failure, if any target failed
#[derive(Debug, Default)]
pub struct StageResult {
    pub uploads: Vec<Upload>,
    pub error: Option<CloudImagesError>,
}

impl StageResult {
    pub fn failed(error: CloudImagesError) -> Self {
        Self {
            uploads: Vec::new(),
            error: Some(error),
        }
    }
}

impl From<Result<Vec<Upload>>> for StageResult {
    fn from(result: Result<Vec<Upload>>) -> Self {
        match result {
            Ok(uploads) => Self { uploads, error: None },
            Err(e) => Self::failed(e),
        }
    }
}

impl From<Result<Upload>> for StageResult {
    fn from(result: Result<Upload>) -> Self {
        result.map(|upload| vec![upload]).into()
    }
}

impl ManifestBus {
    /// Run `upload` for every upload-enabled build, writing
    /// `{name}.{stage}.json` for each build that produced uploads. Builds
    /// are independent; the first error, including unreadable manifests,
    /// is returned once all of them were tried.
    pub async fn run_stage<F, Fut>(&self, stage: &str, mut upload: F) -> Result<Vec<Upload>>
    where
        F: FnMut(BuildManifest) -> Fut,
        Fut: std::future::Future<Output = StageResult>,
    {
        let (manifests, mut first_error) = self.scan()?.into_parts();
        let mut uploads = Vec::new();
        for manifest in manifests {
            if !manifest.build.upload_enabled() {
                info!("Uploads are disabled for {}, skipping {}", manifest.name, stage);
                continue;
            }
            let name = manifest.name.clone();
            let result = upload(manifest).await;
            if !result.uploads.is_empty() {
                match self.write_stage(&name, stage, &result.uploads) {
                    Ok(_) => uploads.extend(result.uploads),
                    Err(e) => {
                        error!("Failed to record stage {} for {}: {}", stage, name, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
            if let Some(e) = result.error {
                error!("Stage {} failed for {}: {}", stage, name, e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(uploads),
        }
    }
}

/// Parse a build manifest
pub fn read_build(path: &Path) -> Result<Build> {
    let value: Value = serde_json::from_slice(&fs::read(path)?)?;
    Registry::global().load_as(value, UnknownPolicy::Raise)
}

/// Parse any registered document from a file
pub fn read_document(path: &Path) -> Result<AnyDocument> {
    let value: Value = serde_json::from_slice(&fs::read(path)?)?;
    Registry::global().load(value, UnknownPolicy::Raise)
}

pub fn write_document(path: &Path, doc: &AnyDocument) -> Result<()> {
    write_value(path, &Registry::global().dump(doc)?)
}

/// Merged manifest listing a build and what was produced from it
pub fn write_merged(path: &Path, build: &Build, uploads: &[Upload]) -> Result<()> {
    let items = std::iter::once(AnyDocument::from(build.clone()))
        .chain(uploads.iter().cloned().map(AnyDocument::from))
        .collect();
    write_document(path, &List::new(items).into())
}

/// Write canonical JSON through a temporary file in the same directory
fn write_value(path: &Path, value: &Value) -> Result<()> {
    let text = to_canonical_string(value)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(text.as_bytes())?;
    tmp.persist(path).map_err(|e| CloudImagesError::IoError(e.error))?;
    debug!("Wrote {}", path.display());
    Ok(())
}

/// Labels every upload carries about its destination
pub fn provider_labels<'a>(provider: &'a str, upload_type: &'a str) -> [(&'static str, &'a str); 2] {
    [
        (wellknown::LABEL_UPLOAD_PROVIDER, provider),
        (wellknown::LABEL_UPLOAD_TYPE, upload_type),
    ]
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::api::Package;
    use std::collections::BTreeMap;

    /// Build of `vendor`/`arch` for bookworm with the given version and type
    pub fn build(vendor: &str, arch: &str, version: &str, build_type: &str) -> Build {
        let info: BTreeMap<String, String> = [
            ("arch", arch),
            ("build_id", "ci-1"),
            ("release", "bookworm"),
            ("release_id", "12"),
            ("type", build_type),
            ("vendor", vendor),
            ("version", version),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Build::new(info, vec![Package::new("base-files", "12.4")])
    }

    /// Write `{name}.build.json` and a `{name}.tar` holding `disk`
    pub fn write_artifact(dir: &Path, name: &str, build: &Build, disk: &[u8]) -> BuildManifest {
        let bus = ManifestBus::new(dir);
        let path = bus.write_build(name, build).unwrap();

        let mut tar = tar::Builder::new(fs::File::create(dir.join(format!("{}.tar", name))).unwrap());
        let mut header = tar::Header::new_gnu();
        header.set_size(disk.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, "disk.raw", disk).unwrap();
        tar.finish().unwrap();

        BuildManifest {
            name: name.to_string(),
            path,
            build: build.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Package;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn build() -> Build {
        let info: BTreeMap<String, String> = [
            ("arch", "arm64"),
            ("release", "bookworm"),
            ("release_id", "12"),
            ("vendor", "ec2"),
            ("version", "20240901-1850"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let mut build = Build::new(info, vec![Package::new("bash", "5.2.15-2+b7")]);
        build.metadata = build.metadata.with_label(wellknown::LABEL_VENDOR, "aws");
        build
    }

    #[test]
    fn test_discover_keys_by_basename() {
        let dir = TempDir::new().unwrap();
        let bus = ManifestBus::new(dir.path());
        let build = build();
        bus.write_build("debian-12-ec2-arm64", &build).unwrap();
        fs::write(dir.path().join("debian-12-ec2-arm64.tar"), b"").unwrap();
        fs::write(dir.path().join("notes.json"), b"{}").unwrap();

        let found = bus.discover().unwrap();

        assert_eq!(found.len(), 1);
        assert_eq!(found[0].name, "debian-12-ec2-arm64");
        assert_eq!(found[0].build, build);
        assert_eq!(
            found[0].artifact_path().unwrap(),
            dir.path().join("debian-12-ec2-arm64.tar")
        );
    }

    #[tokio::test]
    async fn test_unreadable_manifest_does_not_stop_stage() {
        let dir = TempDir::new().unwrap();
        let bus = ManifestBus::new(dir.path());
        fs::write(dir.path().join("a-broken.build.json"), b"{ not json").unwrap();
        bus.write_build("b-good", &build()).unwrap();

        let discovery = bus.scan().unwrap();
        assert_eq!(discovery.manifests.len(), 1);
        assert_eq!(discovery.failures.len(), 1);
        assert_eq!(discovery.failures[0].0, dir.path().join("a-broken.build.json"));
        assert_eq!(bus.discover().unwrap().len(), 1);

        let mut seen = Vec::new();
        let result = bus
            .run_stage("upload-test", |manifest| {
                seen.push(manifest.name.clone());
                let upload = Upload::new(manifest.derive_metadata(&[]), "test", "ref-b", None);
                async move { StageResult::from(Ok(upload)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(seen, ["b-good"]);
        assert_eq!(bus.read_stage("b-good", "upload-test").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_stage_write_does_not_stop_later_builds() {
        let dir = TempDir::new().unwrap();
        let bus = ManifestBus::new(dir.path());
        bus.write_build("a-first", &build()).unwrap();
        bus.write_build("b-second", &build()).unwrap();
        // A directory where the stage file would go makes the write fail
        fs::create_dir(bus.stage_path("a-first", "upload-test")).unwrap();

        let mut seen = Vec::new();
        let result = bus
            .run_stage("upload-test", |manifest| {
                seen.push(manifest.name.clone());
                let upload = Upload::new(manifest.derive_metadata(&[]), "test", "ref", None);
                async move { StageResult::from(Ok(upload)) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(seen, ["a-first", "b-second"]);
        assert_eq!(bus.read_stage("b-second", "upload-test").unwrap().len(), 1);
    }

    #[test]
    fn test_artifact_falls_back_to_xz() {
        let dir = TempDir::new().unwrap();
        let bus = ManifestBus::new(dir.path());
        bus.write_build("img", &build()).unwrap();
        let manifest = &bus.discover().unwrap()[0];

        assert!(matches!(manifest.artifact_path(), Err(CloudImagesError::NotFound(_))));
        fs::write(dir.path().join("img.tar.xz"), b"").unwrap();
        assert_eq!(manifest.artifact_path().unwrap(), dir.path().join("img.tar.xz"));
    }

    #[test]
    fn test_derived_upload_inherits_metadata() {
        let build = build();
        let manifest = BuildManifest {
            name: "img".to_string(),
            path: PathBuf::from("img.build.json"),
            build: build.clone(),
        };

        let upload = manifest.derive_upload(
            "ec2.eu-west-1.amazonaws.com",
            "ami-0123",
            None,
            &[(wellknown::LABEL_ARCH, "aarch64")],
        );

        assert_eq!(upload.metadata.uid, build.metadata.uid);
        // Explicit build labels survive, info labels are added
        assert_eq!(upload.metadata.label(wellknown::LABEL_VENDOR), Some("aws"));
        assert_eq!(upload.metadata.label(wellknown::LABEL_RELEASE), Some("bookworm"));
        // Stage labels override
        assert_eq!(upload.metadata.label(wellknown::LABEL_ARCH), Some("aarch64"));
        for key in build.metadata.labels.keys() {
            assert!(upload.metadata.labels.contains_key(key));
        }
    }

    #[test]
    fn test_stage_round_trip() {
        let dir = TempDir::new().unwrap();
        let bus = ManifestBus::new(dir.path());
        let build = build();
        let upload = Upload::new(build.metadata.copy(), "gce", "debian-12-arm64-v20240901", None);

        let path = bus.write_stage("img", "upload-gce", &[upload.clone()]).unwrap();

        assert_eq!(path, dir.path().join("img.upload-gce.json"));
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("{\n    \"apiVersion\": \"v1\",\n    \"items\": ["));
        assert!(text.ends_with("}\n"));
        assert_eq!(bus.read_stage("img", "upload-gce").unwrap(), vec![upload]);
    }

    #[test]
    fn test_merged_manifest_lists_build_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("img.json");
        let build = build();
        let upload = Upload::new(build.metadata.copy(), "cdimage.debian.org", "bookworm/img.tar", None);

        write_merged(&path, &build, &[upload]).unwrap();

        let AnyDocument::List(list) = read_document(&path).unwrap() else {
            panic!("expected a list");
        };
        assert_eq!(list.items[0].kind(), "Build");
        assert_eq!(list.of::<Upload>().len(), 1);
    }
}
