// file: src/utils/qemu.rs
// version: 2.0.0
// guid: h9i0j1k2-l3m4-5678-9012-345678hijklm

//! Disk image format conversion via qemu-img

use crate::error::CloudImagesError;
use crate::utils::system::{run_checked, CommandRunner, CommandSpec};
use crate::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::{debug, info};

/// Output formats supported by the converter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Vhd,
    Vmdk,
}

impl ImageFormat {
    /// Name used in labels and file extensions
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vhd => "vhd",
            ImageFormat::Vmdk => "vmdk",
        }
    }

    /// Format name understood by `qemu-img -O`
    pub fn qemu_format(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Vhd => "vpc",
            ImageFormat::Vmdk => "vmdk",
        }
    }

    fn convert_args(&self) -> Vec<&'static str> {
        match self {
            ImageFormat::Raw => vec![],
            ImageFormat::Qcow2 => vec!["-c", "-o", "compat=0.10"],
            ImageFormat::Vhd => vec!["-o", "subformat=fixed,force_size"],
            ImageFormat::Vmdk => vec!["-o", "subformat=streamOptimized"],
        }
    }
}

impl std::str::FromStr for ImageFormat {
    type Err = CloudImagesError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "raw" => Ok(ImageFormat::Raw),
            "qcow2" => Ok(ImageFormat::Qcow2),
            "vhd" | "vpc" => Ok(ImageFormat::Vhd),
            "vmdk" => Ok(ImageFormat::Vmdk),
            _ => Err(CloudImagesError::validation(format!(
                "Unknown image format: {}",
                s
            ))),
        }
    }
}

/// Raw image converter backed by `qemu-img`
#[derive(Clone)]
pub struct ImageConverter {
    runner: Arc<dyn CommandRunner>,
}

impl ImageConverter {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Build the qemu-img invocation for a conversion
    pub fn convert_command(src: &Path, dst: &Path, format: ImageFormat) -> CommandSpec {
        CommandSpec::new("qemu-img")
            .args(["convert", "-f", "raw", "-O", format.qemu_format()])
            .args(format.convert_args())
            .arg(src.to_string_lossy())
            .arg(dst.to_string_lossy())
    }

    /// Convert a raw image into `format`
    pub async fn convert(&self, src: &Path, dst: &Path, format: ImageFormat) -> Result<()> {
        info!(
            "Converting {} to {} ({})",
            src.display(),
            dst.display(),
            format.as_str()
        );
        run_checked(self.runner.as_ref(), &Self::convert_command(src, dst, format)).await?;
        debug!("Image conversion completed");
        Ok(())
    }

    /// Convert into a private temporary directory and hand out a read handle.
    ///
    /// The converted file lives as long as the returned value.
    pub async fn open_converted(&self, src: &Path, format: ImageFormat) -> Result<ConvertedImage> {
        let dir = tempfile::Builder::new().prefix("convert-").tempdir()?;
        let path = dir.path().join(format!("image.{}", format.as_str()));
        self.convert(src, &path, format).await?;
        Ok(ConvertedImage {
            _dir: dir,
            path,
            format,
        })
    }
}

/// A converted image that is removed together with this handle
#[derive(Debug)]
pub struct ConvertedImage {
    _dir: TempDir,
    path: PathBuf,
    format: ImageFormat,
}

impl ConvertedImage {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn len(&self) -> Result<u64> {
        Ok(std::fs::metadata(&self.path)?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Sequential read handle on the converted file
    pub async fn open(&self) -> Result<tokio::fs::File> {
        Ok(tokio::fs::File::open(&self.path).await?)
    }
}
