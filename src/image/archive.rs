// file: src/image/archive.rs
// version: 1.0.0
// guid: 4a7e2c9b-1d3f-4b58-8e6a-0c2d4f6b8a1e

//! Build artifact archives holding `disk.raw`

use crate::error::CloudImagesError;
use crate::Result;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::debug;
use xz2::read::XzDecoder;

pub const DISK_IMAGE_NAME: &str = "disk.raw";

const BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// `{name}.tar` or `{name}.tar.xz` produced by the builder
#[derive(Debug, Clone)]
pub struct ImageArchive {
    path: PathBuf,
}

impl ImageArchive {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_file() {
            return Err(CloudImagesError::not_found(format!(
                "Image archive {}",
                path.display()
            )));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_compressed(&self) -> bool {
        self.path.extension().is_some_and(|ext| ext == "xz")
    }

    fn reader(&self) -> Result<Box<dyn Read>> {
        let file = BufReader::new(File::open(&self.path)?);
        Ok(if self.is_compressed() {
            Box::new(XzDecoder::new(file))
        } else {
            Box::new(file)
        })
    }

    /// Extract `disk.raw` into `dest`, keeping zero blocks as holes.
    /// Returns the image size.
    pub fn extract_disk(&self, dest: &Path) -> Result<u64> {
        let mut archive = tar::Archive::new(self.reader()?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            let is_disk = entry
                .path()?
                .file_name()
                .is_some_and(|name| name == DISK_IMAGE_NAME);
            if !is_disk {
                continue;
            }
            let size = entry.size();
            debug!("Extracting {} ({} bytes) from {}", DISK_IMAGE_NAME, size, self.path.display());
            let mut out = File::create(dest)?;
            let written = write_sparse(&mut entry, &mut out)?;
            if written != size {
                return Err(CloudImagesError::integrity(format!(
                    "Short {} in {}: {} of {} bytes",
                    DISK_IMAGE_NAME,
                    self.path.display(),
                    written,
                    size
                )));
            }
            return Ok(size);
        }
        Err(CloudImagesError::not_found(format!(
            "{} in {}",
            DISK_IMAGE_NAME,
            self.path.display()
        )))
    }

    /// Extract `disk.raw` into a private temporary directory
    pub fn extract_disk_temp(&self) -> Result<ExtractedDisk> {
        let dir = tempfile::Builder::new().prefix("dci-disk-").tempdir()?;
        let path = dir.path().join(DISK_IMAGE_NAME);
        let size = self.extract_disk(&path)?;
        Ok(ExtractedDisk {
            _dir: dir,
            path,
            size,
        })
    }
}

/// Extracted raw image, removed together with this handle
#[derive(Debug)]
pub struct ExtractedDisk {
    _dir: TempDir,
    path: PathBuf,
    size: u64,
}

impl ExtractedDisk {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Copy `reader` into `out`, seeking over all-zero blocks
pub fn write_sparse(reader: &mut impl Read, out: &mut File) -> Result<u64> {
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut total = 0u64;
    loop {
        let n = read_full(reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let block = &buf[..n];
        if block.iter().all(|&b| b == 0) {
            out.seek(SeekFrom::Current(n as i64))?;
        } else {
            out.write_all(block)?;
        }
        total += n as u64;
    }
    // Trailing holes need the length set explicitly
    out.set_len(total)?;
    Ok(total)
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use xz2::write::XzEncoder;

    fn disk_contents() -> Vec<u8> {
        let mut data = vec![0u8; 3 * BLOCK_SIZE + 100];
        data[10..20].copy_from_slice(b"bootsector");
        data[2 * BLOCK_SIZE + 5] = 0x42;
        data
    }

    fn write_tar<W: Write>(writer: W, data: &[u8]) -> W {
        let mut builder = tar::Builder::new(writer);
        let mut header = tar::Header::new_gnu();
        header.set_size(4);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "README", &b"test"[..]).unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, DISK_IMAGE_NAME, data).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_extract_from_plain_tar() {
        let dir = tempfile::tempdir().unwrap();
        let data = disk_contents();
        let tar_path = dir.path().join("image.tar");
        write_tar(File::create(&tar_path).unwrap(), &data);

        let dest = dir.path().join("disk.raw");
        let size = ImageArchive::open(&tar_path).unwrap().extract_disk(&dest).unwrap();

        assert_eq!(size, data.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), data);

        let extracted = ImageArchive::open(&tar_path).unwrap().extract_disk_temp().unwrap();
        assert_eq!(extracted.size(), data.len() as u64);
        let temp_path = extracted.path().to_path_buf();
        assert!(temp_path.is_file());
        drop(extracted);
        assert!(!temp_path.exists());
    }

    #[test]
    fn test_extract_from_xz_tar() {
        let dir = tempfile::tempdir().unwrap();
        let data = disk_contents();
        let tar_path = dir.path().join("image.tar.xz");
        let encoder = write_tar(XzEncoder::new(File::create(&tar_path).unwrap(), 1), &data);
        encoder.finish().unwrap();

        let archive = ImageArchive::open(&tar_path).unwrap();
        assert!(archive.is_compressed());
        let dest = dir.path().join("disk.raw");
        archive.extract_disk(&dest).unwrap();

        assert_eq!(fs::read(&dest).unwrap(), data);
    }

    #[test]
    fn test_trailing_zeros_keep_length() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = vec![1u8; 10];
        data.resize(BLOCK_SIZE * 2, 0);
        let mut out = File::create(dir.path().join("out")).unwrap();

        let written = write_sparse(&mut data.as_slice(), &mut out).unwrap();

        assert_eq!(written, data.len() as u64);
        assert_eq!(fs::metadata(dir.path().join("out")).unwrap().len(), data.len() as u64);
    }

    #[test]
    fn test_missing_disk_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("empty.tar");
        let mut builder = tar::Builder::new(File::create(&tar_path).unwrap());
        builder.finish().unwrap();
        drop(builder);

        let result = ImageArchive::open(&tar_path)
            .unwrap()
            .extract_disk(&dir.path().join("disk.raw"));
        assert!(matches!(result, Err(CloudImagesError::NotFound(_))));
        assert!(ImageArchive::open(dir.path().join("missing.tar")).is_err());
    }
}
