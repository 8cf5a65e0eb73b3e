// file: src/cli/args.rs
// version: 2.0.0
// guid: f6g7h8i9-j0k1-2345-6789-012345fghijk

//! Command line argument definitions

use crate::config::Architecture;
use crate::utils::qemu::ImageFormat;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "debian-cloud-images")]
#[command(about = "Build, assemble and publish Debian cloud images")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// JSON log lines filtered by RUST_LOG
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Tool configuration (YAML)
    #[arg(short, long, global = true, env = "DCI_CONFIG")]
    pub config: Option<PathBuf>,

    /// Image catalog replacing the built-in one
    #[arg(long, global = true)]
    pub image_config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List build manifests in a directory
    ListBuilds {
        #[arg(default_value = ".")]
        manifests: PathBuf,

        #[arg(short, long)]
        json: bool,
    },

    /// Build an image with fai-diskimage inside the sandbox
    Build {
        release: String,
        vendor: String,

        #[arg(short, long, value_enum, default_value = "amd64")]
        arch: ArchArg,

        #[arg(short = 't', long = "type", default_value = "dev")]
        build_type: String,

        /// `YYYYMMDD-N` or `N`
        #[arg(long)]
        version: String,

        #[arg(long, default_value = "manual")]
        build_id: String,

        #[arg(long, help = "FAI config space")]
        config_space: PathBuf,

        #[arg(short, long, default_value = ".")]
        output: PathBuf,

        #[arg(long, help = "Pack the disk as .tar.xz")]
        compress: bool,
    },

    /// Convert a raw disk or build archive to another format
    Convert {
        input: PathBuf,
        output: PathBuf,

        #[arg(short, long, value_enum)]
        format: FormatArg,
    },

    /// Assemble a GPT disk from an OCI image layout
    Assemble {
        #[arg(long, help = "OCI image layout directory")]
        store: PathBuf,

        output: PathBuf,

        #[arg(short, long, value_enum, default_value = "amd64")]
        arch: ArchArg,

        #[arg(long, default_value = "2", help = "Disk size in GiB")]
        size_gb: u64,
    },

    /// Publish builds to an Azure Compute Gallery or partner storage
    UploadAzure {
        #[arg(default_value = ".")]
        manifests: PathBuf,

        #[arg(long, help = "Upload VHD blobs for partner offers instead")]
        partner: bool,
    },

    /// Publish builds as EC2 AMIs
    UploadEc2 {
        #[arg(default_value = ".")]
        manifests: PathBuf,
    },

    /// Publish builds as GCE images
    UploadGce {
        #[arg(default_value = ".")]
        manifests: PathBuf,
    },

    /// Publish builds into the public image tree
    Publish {
        #[arg(default_value = ".")]
        manifests: PathBuf,

        #[arg(long, help = "Root of the public tree (publish.root)")]
        root: Option<PathBuf>,

        #[arg(long, help = "Provider recorded in uploads (publish.provider)")]
        provider: Option<String>,
    },
}

/// Architecture argument for CLI
#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum ArchArg {
    Amd64,
    Arm64,
}

impl Commands {
    /// Subcommand name used for the operation span
    pub fn name(&self) -> &'static str {
        match self {
            Commands::ListBuilds { .. } => "list-builds",
            Commands::Build { .. } => "build",
            Commands::Convert { .. } => "convert",
            Commands::Assemble { .. } => "assemble",
            Commands::UploadAzure { .. } => "upload-azure",
            Commands::UploadEc2 { .. } => "upload-ec2",
            Commands::UploadGce { .. } => "upload-gce",
            Commands::Publish { .. } => "publish",
        }
    }
}

impl From<ArchArg> for Architecture {
    fn from(arch: ArchArg) -> Self {
        match arch {
            ArchArg::Amd64 => Architecture::Amd64,
            ArchArg::Arm64 => Architecture::Arm64,
        }
    }
}

/// Output format argument
#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum FormatArg {
    Raw,
    Qcow2,
    Vhd,
    Vmdk,
}

impl From<FormatArg> for ImageFormat {
    fn from(format: FormatArg) -> Self {
        match format {
            FormatArg::Raw => ImageFormat::Raw,
            FormatArg::Qcow2 => ImageFormat::Qcow2,
            FormatArg::Vhd => ImageFormat::Vhd,
            FormatArg::Vmdk => ImageFormat::Vmdk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upload_ec2() {
        let cli = Cli::try_parse_from(["debian-cloud-images", "-v", "upload-ec2", "out"]).unwrap();
        assert!(cli.verbose);
        assert_eq!(cli.command.name(), "upload-ec2");
        assert!(matches!(cli.command, Commands::UploadEc2 { manifests } if manifests == PathBuf::from("out")));
    }

    #[test]
    fn test_parse_build() {
        let cli = Cli::try_parse_from([
            "debian-cloud-images",
            "build",
            "bookworm",
            "generic",
            "--arch",
            "arm64",
            "--type",
            "daily",
            "--version",
            "20240904-1860",
            "--config-space",
            "config_space",
        ])
        .unwrap();
        match cli.command {
            Commands::Build {
                release,
                arch,
                build_type,
                compress,
                ..
            } => {
                assert_eq!(release, "bookworm");
                assert!(matches!(arch, ArchArg::Arm64));
                assert_eq!(build_type, "daily");
                assert!(!compress);
            }
            _ => panic!("expected build"),
        }
    }

    #[test]
    fn test_convert_requires_format() {
        assert!(Cli::try_parse_from(["debian-cloud-images", "convert", "a.tar", "a.qcow2"]).is_err());
    }
}
