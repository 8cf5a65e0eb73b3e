// file: src/image/assembler/grub.rs
// version: 1.0.0
// guid: 0b6d2e8a-3c4f-4f1a-9e27-5a8b9c0d1e2f

//! BIOS GRUB installation into the protective MBR and the BIOS boot
//! partition

use super::gpt::{Partition, SECTOR_SIZE};
use crate::error::CloudImagesError;
use crate::Result;
use std::fs::{self, File};
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::debug;

/// Bytes of boot.img that go into the MBR, before the partition table
pub const BOOT_IMG_SIZE: usize = 440;
pub const CORE_IMG_MAX: usize = 3 * 1024 * 1024;

const BOOT_KERNEL_SECTOR: usize = 0x5c;
const BOOT_DRIVE: usize = 0x64;
const BOOT_DRIVE_CHECK: usize = 0x66;
const CORE_BLOCKLIST_START: usize = 0x1f4;

/// Point boot.img at the core image starting at `start_sector`
pub fn patch_boot_img(boot: &[u8], start_sector: u64) -> Result<Vec<u8>> {
    if boot.len() < BOOT_IMG_SIZE {
        return Err(CloudImagesError::validation(format!(
            "boot.img too small: {} bytes",
            boot.len()
        )));
    }
    let sector = u32::try_from(start_sector).map_err(|_| {
        CloudImagesError::validation(format!("Core image sector {} out of MBR range", start_sector))
    })?;

    let mut out = boot[..BOOT_IMG_SIZE].to_vec();
    out[BOOT_KERNEL_SECTOR..BOOT_KERNEL_SECTOR + 4].copy_from_slice(&sector.to_le_bytes());
    // Boot from whatever drive the BIOS hands over
    out[BOOT_DRIVE] = 0xff;
    out[BOOT_DRIVE_CHECK] = 0x90;
    out[BOOT_DRIVE_CHECK + 1] = 0x90;
    Ok(out)
}

/// Set the first blocklist entry of core.img to the sector after its own
pub fn patch_core_img(core: &[u8], start_sector: u64) -> Result<Vec<u8>> {
    if core.len() < CORE_BLOCKLIST_START + 8 {
        return Err(CloudImagesError::validation(format!(
            "core.img too small: {} bytes",
            core.len()
        )));
    }
    if core.len() > CORE_IMG_MAX {
        return Err(CloudImagesError::validation(format!(
            "core.img too large: {} bytes",
            core.len()
        )));
    }

    let mut out = core.to_vec();
    out[CORE_BLOCKLIST_START..CORE_BLOCKLIST_START + 8]
        .copy_from_slice(&(start_sector + 1).to_le_bytes());
    Ok(out)
}

/// Write patched boot.img and core.img into `disk`
pub fn install(disk: &File, boot_img: &Path, core_img: &Path, bios_boot: &Partition) -> Result<()> {
    let boot = fs::read(boot_img)?;
    let core = fs::read(core_img)?;
    if core.len() as u64 > bios_boot.size {
        return Err(CloudImagesError::validation(format!(
            "core.img ({} bytes) does not fit the BIOS boot partition",
            core.len()
        )));
    }

    let sector = bios_boot.start_sector();
    debug!("Installing GRUB core image at sector {}", sector);

    disk.write_all_at(&patch_boot_img(&boot, sector)?, 0)?;
    disk.write_all_at(&patch_core_img(&core, sector)?, sector * SECTOR_SIZE)?;
    Ok(())
}
