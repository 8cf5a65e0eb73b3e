// file: src/image/assembler/mod.rs
// version: 1.0.0
// guid: 6c1e4a8d-2b5f-4d93-a7e0-9f8e7d6c5b4a

//! Raw disk assembly from partition layers in an OCI layout
//!
//! The `debian` manifest of the store names a root and an EFI layer.
//! Both filesystems are built inside the sandbox, then the disk is
//! partitioned with `sfdisk` and the filesystem images are copied into
//! their partitions. On amd64 GRUB is installed for BIOS boot.

pub mod gpt;
pub mod grub;

pub use gpt::{GptLayout, Partition, PartitionUuids};

use crate::config::Architecture;
use crate::error::CloudImagesError;
use crate::image::builder::sandbox::Sandbox;
use crate::oci::layout::{ANNOTATION_PART_FS_UUID, ANNOTATION_PART_UUID, REF_NAME_DEBIAN};
use crate::oci::{Descriptor, ImageManifest, OciStore, PartitionKind};
use crate::utils::sparse::sparse_copy;
use crate::utils::system::{run_checked, CommandRunner, CommandSpec};
use crate::Result;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Everything needed to build the disk, resolved from the store
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyPlan {
    pub arch: Architecture,
    pub layout: GptLayout,
    pub root_blob: String,
    pub efi_blob: String,
    pub root_fs_uuid: Uuid,
}

/// Filesystem images ready to be placed into partitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionImages {
    pub root: PathBuf,
    pub efi: PathBuf,
    /// boot.img and core.img, amd64 only
    pub grub: Option<(PathBuf, PathBuf)>,
}

impl PartitionImages {
    /// Images at their well-known names below `dir`
    pub fn in_dir(dir: &Path, arch: Architecture) -> Self {
        Self {
            root: dir.join("root.img"),
            efi: dir.join("efi.img"),
            grub: arch
                .has_bios_boot()
                .then(|| (dir.join("boot.img"), dir.join("core.img"))),
        }
    }
}

pub struct DiskAssembler {
    runner: Arc<dyn CommandRunner>,
    arch: Architecture,
    disk_size: u64,
}

fn layer_uuid(layer: &Descriptor, key: &str) -> Result<Uuid> {
    let value = layer.annotation(key).ok_or_else(|| {
        CloudImagesError::integrity(format!("Layer {} lacks annotation {}", layer.digest, key))
    })?;
    Uuid::parse_str(value)
        .map_err(|e| CloudImagesError::integrity(format!("Bad uuid in {}: {}", key, e)))
}

impl DiskAssembler {
    pub fn new(runner: Arc<dyn CommandRunner>, arch: Architecture, disk_size: u64) -> Self {
        Self {
            runner,
            arch,
            disk_size,
        }
    }

    /// Resolve layers and partition layout from the store
    pub fn plan(&self, store: &OciStore) -> Result<AssemblyPlan> {
        let index = store.read_index()?;
        let manifest_desc = index.manifest_by_ref(REF_NAME_DEBIAN)?;
        let manifest: ImageManifest = store.read_blob_json(manifest_desc.sha256_hex()?)?;
        manifest.validate()?;

        let root = manifest.partition_layer(PartitionKind::Root)?;
        let efi = manifest.partition_layer(PartitionKind::Efi)?;

        let uuids = PartitionUuids {
            bios: Uuid::new_v4(),
            esp: layer_uuid(efi, ANNOTATION_PART_UUID)?,
            root: layer_uuid(root, ANNOTATION_PART_UUID)?,
        };
        let layout = GptLayout::new(self.arch, self.disk_size, uuids)?;

        Ok(AssemblyPlan {
            arch: self.arch,
            layout,
            root_blob: root.sha256_hex()?.to_string(),
            efi_blob: efi.sha256_hex()?.to_string(),
            root_fs_uuid: layer_uuid(root, ANNOTATION_PART_FS_UUID)?,
        })
    }

    /// Build the filesystem images into `work_dir` inside the sandbox
    pub async fn build_filesystems(
        &self,
        sandbox: Sandbox,
        store: &OciStore,
        plan: &AssemblyPlan,
        work_dir: &Path,
    ) -> Result<PartitionImages> {
        let sandbox = sandbox
            .bind(store.root().join("blobs").join("sha256"), "/blobs", false)
            .bind(work_dir, "/output", true);

        info!("Building filesystems for {}", plan.arch);
        sandbox.run_script(&filesystem_script(plan)?).await?;

        let images = PartitionImages::in_dir(work_dir, plan.arch);
        for path in [&images.root, &images.efi] {
            if !path.is_file() {
                return Err(CloudImagesError::not_found(format!(
                    "Filesystem image {}",
                    path.display()
                )));
            }
        }
        Ok(images)
    }

    /// Partition `output` and place the filesystem images
    pub async fn write_disk(&self, layout: &GptLayout, images: &PartitionImages, output: &Path) -> Result<()> {
        let disk = File::options()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(output)?;
        disk.set_len(layout.disk_size)?;

        let sfdisk = CommandSpec::new("sfdisk")
            .args(["--quiet", "--no-reread", "--no-tell-kernel"])
            .arg(output.display().to_string())
            .stdin(layout.sfdisk_script());
        run_checked(self.runner.as_ref(), &sfdisk).await?;

        for (image, partition) in [(&images.root, layout.root()?), (&images.efi, layout.esp()?)] {
            let size = fs::metadata(image)?.len();
            if size > partition.size {
                return Err(CloudImagesError::validation(format!(
                    "{} ({} bytes) exceeds partition {} ({} bytes)",
                    image.display(),
                    size,
                    partition.nr,
                    partition.size
                )));
            }
            sparse_copy(image, &disk, partition.start)?;
        }

        if let Some((boot_img, core_img)) = &images.grub {
            grub::install(&disk, boot_img, core_img, layout.bios_boot()?)?;
        }

        disk.sync_all()?;
        debug!("Wrote {} bytes of disk layout to {}", layout.disk_size, output.display());
        Ok(())
    }

    /// Plan, build and write the disk in one go
    pub async fn assemble(&self, sandbox: Sandbox, store: &OciStore, output: &Path) -> Result<GptLayout> {
        let plan = self.plan(store)?;
        let work = tempfile::Builder::new()
            .prefix("dci-assemble-")
            .tempdir_in(store.tmp_dir())?;

        let images = self.build_filesystems(sandbox, store, &plan, work.path()).await?;
        self.write_disk(&plan.layout, &images, output).await?;

        info!(
            "Assembled {} ({} bytes) from {}",
            output.display(),
            plan.layout.disk_size,
            store.root().display()
        );
        Ok(plan.layout)
    }
}

/// Shell script building `root.img`, `efi.img` and the GRUB images
pub fn filesystem_script(plan: &AssemblyPlan) -> Result<String> {
    let root = plan.layout.root()?;
    let esp = plan.layout.esp()?;

    let mut lines = vec![
        "mkdir -p /target/root /target/efi".to_string(),
        format!(
            "tar -xf /blobs/{} -C /target/root --numeric-owner --xattrs --xattrs-include='*'",
            plan.root_blob
        ),
        format!("truncate -s {} /output/root.img", root.size),
        format!(
            "mkfs.ext4 -q -F -U {} -d /target/root /output/root.img",
            plan.root_fs_uuid
        ),
        format!("tar -xf /blobs/{} -C /target/efi --numeric-owner", plan.efi_blob),
        format!("truncate -s {} /output/efi.img", esp.size),
        "mkfs.vfat -F 32 -n EFI /output/efi.img".to_string(),
        "if [ -d /target/efi/boot/efi ]; then mcopy -s -i /output/efi.img /target/efi/boot/efi/* ::/; fi"
            .to_string(),
    ];
    if plan.arch.has_bios_boot() {
        lines.push("cp /target/root/usr/lib/grub/i386-pc/boot.img /output/boot.img".to_string());
        lines.push(
            "grub-mkimage -O i386-pc -d /target/root/usr/lib/grub/i386-pc -o /output/core.img \
             -p '(hd0,gpt1)/boot/grub' biosdisk part_gpt ext2"
                .to_string(),
        );
    }
    Ok(lines.join("\n") + "\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::builder::sandbox::testing as sandbox_testing;
    use crate::oci::layout::{
        ANNOTATION_PART_TYPE, ANNOTATION_REF_NAME, MEDIA_TYPE_DEBIAN_CONFIG, MEDIA_TYPE_DEBIAN_MANIFEST,
        MEDIA_TYPE_LAYER_TAR,
    };
    use crate::oci::ImageIndex;
    use crate::utils::system::testing::RecordingRunner;
    use crate::utils::system::CommandOutput;
    use std::os::unix::fs::FileExt;

    const ROOT_UUID: &str = "0fc63daf-8483-4772-8e79-3d69d8477de4";
    const ROOT_FS_UUID: &str = "1d0c5f2a-6d1e-4b7a-9c3e-5f2a6d1e4b7a";
    const ESP_UUID: &str = "2e1d6a3b-7e2f-4c8b-ad4f-6a3b7e2f4c8b";

    fn store_with_layers(dir: &Path) -> OciStore {
        let store = OciStore::init(dir).unwrap();
        let root = store.store_bytes(b"root layer").unwrap();
        let efi = store.store_bytes(b"efi layer").unwrap();
        let config = store.store_blob(&serde_json::json!({"architecture": "amd64"})).unwrap();

        let manifest = ImageManifest::new(
            MEDIA_TYPE_DEBIAN_MANIFEST,
            config.descriptor(MEDIA_TYPE_DEBIAN_CONFIG),
            vec![
                root.descriptor(MEDIA_TYPE_LAYER_TAR)
                    .with_annotation(ANNOTATION_PART_TYPE, "root")
                    .with_annotation(ANNOTATION_PART_UUID, ROOT_UUID)
                    .with_annotation(ANNOTATION_PART_FS_UUID, ROOT_FS_UUID),
                efi.descriptor(MEDIA_TYPE_LAYER_TAR)
                    .with_annotation(ANNOTATION_PART_TYPE, "efi")
                    .with_annotation(ANNOTATION_PART_UUID, ESP_UUID),
            ],
        );
        let manifest = store.store_blob(&manifest).unwrap();
        store
            .store_index(&ImageIndex::new(vec![manifest
                .descriptor(MEDIA_TYPE_DEBIAN_MANIFEST)
                .with_annotation(ANNOTATION_REF_NAME, REF_NAME_DEBIAN)]))
            .unwrap();
        store
    }

    #[test]
    fn test_plan_resolves_layers() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_layers(dir.path());
        let assembler = DiskAssembler::new(
            Arc::new(RecordingRunner::succeeding()),
            Architecture::Amd64,
            gpt::MIN_DISK_SIZE,
        );

        let plan = assembler.plan(&store).unwrap();

        assert_eq!(plan.root_fs_uuid.to_string(), ROOT_FS_UUID);
        assert_eq!(plan.layout.root().unwrap().part_uuid.to_string(), ROOT_UUID);
        assert_eq!(plan.layout.esp().unwrap().part_uuid.to_string(), ESP_UUID);
        assert_eq!(plan.root_blob, crate::utils::crypto::sha256_hex(b"root layer"));
    }

    #[test]
    fn test_filesystem_script_skips_grub_on_arm64() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_layers(dir.path());
        let runner = Arc::new(RecordingRunner::succeeding());

        let amd64 = DiskAssembler::new(runner.clone(), Architecture::Amd64, 0).plan(&store).unwrap();
        let arm64 = DiskAssembler::new(runner, Architecture::Arm64, 0).plan(&store).unwrap();

        let script = filesystem_script(&amd64).unwrap();
        assert!(script.contains(&format!("mkfs.ext4 -q -F -U {}", ROOT_FS_UUID)));
        assert!(script.contains("grub-mkimage"));
        assert!(!filesystem_script(&arm64).unwrap().contains("grub"));
    }

    #[tokio::test]
    async fn test_assemble_places_filesystems() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_with_layers(&dir.path().join("oci"));

        // Stand in for the sandboxed mkfs run
        let runner = Arc::new(RecordingRunner::with_handler(|cmd| {
            if cmd.program == "crun" {
                let out = sandbox_testing::bound_dir(cmd, "/output").unwrap();
                let root = File::create(out.join("root.img")).unwrap();
                root.set_len(8 * 1024 * 1024).unwrap();
                root.write_all_at(b"ext4", 1024).unwrap();
                fs::write(out.join("efi.img"), b"FAT32").unwrap();
                fs::write(out.join("boot.img"), vec![0xebu8; 512]).unwrap();
                fs::write(out.join("core.img"), vec![0x52u8; 1024]).unwrap();
            }
            CommandOutput::default()
        }));
        let assembler = DiskAssembler::new(runner.clone(), Architecture::Amd64, gpt::MIN_DISK_SIZE);
        let output = dir.path().join("disk.raw");

        let layout = assembler
            .assemble(sandbox_testing::sandbox(runner.clone()), &store, &output)
            .await
            .unwrap();

        assert_eq!(runner.programs(), ["crun", "sfdisk"]);
        let sfdisk = runner.calls.lock().unwrap()[1].clone();
        assert_eq!(sfdisk.stdin.unwrap(), layout.sfdisk_script().into_bytes());

        let disk = File::open(&output).unwrap();
        assert_eq!(disk.metadata().unwrap().len(), layout.disk_size);
        let mut buf = [0u8; 5];
        disk.read_exact_at(&mut buf[..4], layout.root().unwrap().start + 1024).unwrap();
        assert_eq!(&buf[..4], b"ext4");
        disk.read_exact_at(&mut buf, layout.esp().unwrap().start).unwrap();
        assert_eq!(&buf, b"FAT32");
        disk.read_exact_at(&mut buf[..4], 0x5c).unwrap();
        assert_eq!(&buf[..4], &2048u32.to_le_bytes());
        // Work directory is cleaned up
        assert_eq!(fs::read_dir(store.tmp_dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_oversized_filesystem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root.img");
        File::create(&root).unwrap().set_len(3 * gpt::MIB * 1024).unwrap();
        fs::write(dir.path().join("efi.img"), b"x").unwrap();
        let layout = GptLayout::new(Architecture::Arm64, gpt::MIN_DISK_SIZE, PartitionUuids::random()).unwrap();
        let assembler = DiskAssembler::new(
            Arc::new(RecordingRunner::succeeding()),
            Architecture::Arm64,
            gpt::MIN_DISK_SIZE,
        );

        let result = assembler
            .write_disk(
                &layout,
                &PartitionImages::in_dir(dir.path(), Architecture::Arm64),
                &dir.path().join("disk.raw"),
            )
            .await;

        assert!(matches!(result, Err(CloudImagesError::ValidationError(_))));
    }
}
