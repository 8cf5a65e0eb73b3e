// file: src/oci/store.rs
// version: 1.0.0
// guid: 0f7b3d9e-4a21-4c6e-8d95-b7c8d9e0f1a3

//! Content-addressed OCI blob store
//!
//! Append-only: blobs are written once under `blobs/sha256/<hex>` and never
//! removed. Writers of the same digest race harmlessly since the content is
//! identical by construction.

use super::layout::{BlobInfo, ImageIndex, OciLayout, INDEX_FILE, OCI_LAYOUT_FILE, OCI_LAYOUT_VERSION};
use crate::error::CloudImagesError;
use crate::utils::crypto::{sha256_file, sha256_hex};
use crate::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Local OCI layout directory
#[derive(Debug, Clone)]
pub struct OciStore {
    root: PathBuf,
}

impl OciStore {
    /// Create the layout at `path`, or validate an existing one
    pub fn init(path: &Path) -> Result<Self> {
        let store = Self {
            root: path.to_path_buf(),
        };
        fs::create_dir_all(store.blob_dir())?;
        fs::create_dir_all(store.tmp_dir())?;

        let marker = path.join(OCI_LAYOUT_FILE);
        match fs::read(&marker) {
            Ok(content) => {
                let layout: OciLayout = serde_json::from_slice(&content).map_err(|e| {
                    CloudImagesError::integrity(format!("Unreadable {}: {}", marker.display(), e))
                })?;
                if layout.image_layout_version != OCI_LAYOUT_VERSION {
                    return Err(CloudImagesError::integrity(format!(
                        "Unsupported OCI layout version {} in {}",
                        layout.image_layout_version,
                        path.display()
                    )));
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                store.write_atomic(&marker, &serde_json::to_vec(&OciLayout::default())?)?;
            }
            Err(e) => return Err(e.into()),
        }

        debug!("Initialized OCI store at {}", path.display());
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    /// Staging directory for blobs produced by external tools
    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn tmp_path(&self, name: &str) -> PathBuf {
        self.tmp_dir().join(name)
    }

    pub fn blob_path(&self, hex: &str) -> PathBuf {
        self.blob_dir().join(hex)
    }

    /// Store the JSON encoding of `value` as a blob
    pub fn store_blob<T: Serialize + ?Sized>(&self, value: &T) -> Result<BlobInfo> {
        let bytes = serde_json::to_vec(value)?;
        self.store_bytes(&bytes)
    }

    pub fn store_bytes(&self, bytes: &[u8]) -> Result<BlobInfo> {
        let hex = sha256_hex(bytes);
        let path = self.blob_path(&hex);
        if path.exists() {
            debug!("Blob {} already present", hex);
        } else {
            self.write_atomic(&path, bytes)?;
            debug!("Stored blob {} ({} bytes)", hex, bytes.len());
        }
        Ok(BlobInfo::sha256(hex, bytes.len() as u64))
    }

    /// Hash `tmp/<name>` and hardlink it into the blob tree
    pub fn store_blob_from_tmp(&self, name: &str) -> Result<BlobInfo> {
        let src = self.tmp_path(name);
        let (hex, size) = sha256_file(&src)?;
        match fs::hard_link(&src, self.blob_path(&hex)) {
            Ok(()) => debug!("Linked {} as blob {}", src.display(), hex),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Blob {} already present", hex)
            }
            Err(e) => return Err(e.into()),
        }
        Ok(BlobInfo::sha256(hex, size))
    }

    /// Replace `index.json`
    pub fn store_index(&self, index: &ImageIndex) -> Result<()> {
        let bytes = serde_json::to_vec(index)?;
        self.write_atomic(&self.root.join(INDEX_FILE), &bytes)
    }

    pub fn read_index(&self) -> Result<ImageIndex> {
        let path = self.root.join(INDEX_FILE);
        let index: ImageIndex = serde_json::from_slice(&fs::read(&path)?)?;
        index.validate()?;
        Ok(index)
    }

    /// Read a blob and check it against its digest
    pub fn read_blob(&self, hex: &str) -> Result<Vec<u8>> {
        let bytes = fs::read(self.blob_path(hex)).map_err(|e| match e.kind() {
            ErrorKind::NotFound => CloudImagesError::not_found(format!("Blob sha256:{}", hex)),
            _ => e.into(),
        })?;
        if sha256_hex(&bytes) != hex {
            return Err(CloudImagesError::integrity(format!(
                "Blob sha256:{} does not match its digest",
                hex
            )));
        }
        Ok(bytes)
    }

    pub fn read_blob_json<T: DeserializeOwned>(&self, hex: &str) -> Result<T> {
        Ok(serde_json::from_slice(&self.read_blob(hex)?)?)
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(self.tmp_dir())?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| CloudImagesError::IoError(e.error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::layout::{ImageManifest, MEDIA_TYPE_DEBIAN_CONFIG, MEDIA_TYPE_DEBIAN_MANIFEST};
    use serde_json::json;
    use tempfile::TempDir;

    const EMPTY_OBJECT_DIGEST: &str = "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a";

    #[test]
    fn test_init_writes_layout_marker() {
        let dir = TempDir::new().unwrap();
        OciStore::init(dir.path()).unwrap();

        let marker = fs::read_to_string(dir.path().join("oci-layout")).unwrap();
        assert_eq!(marker, r#"{"imageLayoutVersion":"1.0.0"}"#);
        assert!(dir.path().join("blobs/sha256").is_dir());

        // A second init accepts the existing layout
        OciStore::init(dir.path()).unwrap();
    }

    #[test]
    fn test_init_rejects_other_version() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("oci-layout"), r#"{"imageLayoutVersion":"2.0.0"}"#).unwrap();

        assert!(matches!(
            OciStore::init(dir.path()),
            Err(CloudImagesError::IntegrityError(_))
        ));
    }

    #[test]
    fn test_store_blob_is_idempotent() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let store = OciStore::init(dir.path()).unwrap();

        // Act
        let first = store.store_blob(&json!({})).unwrap();
        let second = store.store_blob(&json!({})).unwrap();

        // Assert
        assert_eq!(first, BlobInfo::sha256(EMPTY_OBJECT_DIGEST, 2));
        assert_eq!(first, second);
        assert_eq!(first.algorithm, "sha256");
        let blobs: Vec<_> = fs::read_dir(dir.path().join("blobs/sha256")).unwrap().collect();
        assert_eq!(blobs.len(), 1);
        assert_eq!(store.read_blob(EMPTY_OBJECT_DIGEST).unwrap(), b"{}");
    }

    #[test]
    fn test_store_blob_from_tmp_hardlinks() {
        use std::os::unix::fs::MetadataExt;

        let dir = TempDir::new().unwrap();
        let store = OciStore::init(dir.path()).unwrap();
        fs::write(store.tmp_path("root.tar"), b"layer contents").unwrap();

        let info = store.store_blob_from_tmp("root.tar").unwrap();

        assert_eq!(info.size, 14);
        let blob = fs::metadata(store.blob_path(&info.digest)).unwrap();
        let tmp = fs::metadata(store.tmp_path("root.tar")).unwrap();
        assert_eq!(blob.ino(), tmp.ino());
        assert_eq!(store.store_blob_from_tmp("root.tar").unwrap(), info);
    }

    #[test]
    fn test_index_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = OciStore::init(dir.path()).unwrap();
        let config = store.store_blob(&json!({"arch": "amd64"})).unwrap();
        let manifest = ImageManifest::new(
            MEDIA_TYPE_DEBIAN_MANIFEST,
            config.descriptor(MEDIA_TYPE_DEBIAN_CONFIG),
            vec![],
        );
        let manifest_info = store.store_blob(&manifest).unwrap();
        let index = ImageIndex::new(vec![manifest_info.descriptor(MEDIA_TYPE_DEBIAN_MANIFEST)]);

        store.store_index(&index).unwrap();

        assert_eq!(store.read_index().unwrap(), index);
        let loaded: ImageManifest = store.read_blob_json(&manifest_info.digest).unwrap();
        assert_eq!(loaded, manifest);
    }

    #[test]
    fn test_corrupted_blob_detected() {
        let dir = TempDir::new().unwrap();
        let store = OciStore::init(dir.path()).unwrap();
        let info = store.store_bytes(b"payload").unwrap();
        fs::write(store.blob_path(&info.digest), b"tampered").unwrap();

        assert!(matches!(
            store.read_blob(&info.digest),
            Err(CloudImagesError::IntegrityError(_))
        ));
    }
}
