// file: src/image/assembler/gpt.rs
// version: 1.0.0
// guid: e2b08e3f-0d7b-4a9f-92e8-e3f4a5b6c7d8

//! GPT layout of assembled disks
//!
//! Partitions are laid out in table order behind a 1 MiB gap: BIOS boot
//! (14), EFI system (15), then root (1) up to 1 MiB before the end of the
//! disk. Every boundary sits on 1 MiB.

use crate::config::Architecture;
use crate::error::CloudImagesError;
use crate::Result;
use std::fmt::Write;
use uuid::Uuid;

pub const SECTOR_SIZE: u64 = 512;
pub const MIB: u64 = 1024 * 1024;
pub const ALIGNMENT: u64 = MIB;
pub const MIN_DISK_SIZE: u64 = 2 * 1024 * MIB;

pub const BIOS_BOOT_SIZE: u64 = 3 * MIB;
pub const ESP_SIZE: u64 = 124 * MIB;

pub const TYPE_BIOS_BOOT: &str = "21686148-6449-6E6F-744E-656564454649";
pub const TYPE_ESP: &str = "C12A7328-F81F-11D2-BA4B-00A0C93EC93B";

pub const PART_BIOS_BOOT: u32 = 14;
pub const PART_ESP: u32 = 15;
pub const PART_ROOT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub nr: u32,
    pub type_uuid: String,
    pub part_uuid: Uuid,
    /// Offset in bytes
    pub start: u64,
    /// Size in bytes
    pub size: u64,
}

impl Partition {
    pub fn start_sector(&self) -> u64 {
        self.start / SECTOR_SIZE
    }

    pub fn size_sectors(&self) -> u64 {
        self.size / SECTOR_SIZE
    }

    /// First byte after the partition
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Partition uuids of the three partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionUuids {
    pub bios: Uuid,
    pub esp: Uuid,
    pub root: Uuid,
}

impl PartitionUuids {
    pub fn random() -> Self {
        Self {
            bios: Uuid::new_v4(),
            esp: Uuid::new_v4(),
            root: Uuid::new_v4(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptLayout {
    pub disk_size: u64,
    pub partitions: Vec<Partition>,
}

fn align_up(value: u64) -> u64 {
    value.div_ceil(ALIGNMENT) * ALIGNMENT
}

impl GptLayout {
    /// Layout for a disk of at least `disk_size` bytes
    pub fn new(arch: Architecture, disk_size: u64, uuids: PartitionUuids) -> Result<Self> {
        let disk_size = align_up(disk_size.max(MIN_DISK_SIZE));

        let bios = Partition {
            nr: PART_BIOS_BOOT,
            type_uuid: TYPE_BIOS_BOOT.to_string(),
            part_uuid: uuids.bios,
            start: ALIGNMENT,
            size: BIOS_BOOT_SIZE,
        };
        let esp = Partition {
            nr: PART_ESP,
            type_uuid: TYPE_ESP.to_string(),
            part_uuid: uuids.esp,
            start: bios.end(),
            size: ESP_SIZE,
        };
        let root_start = esp.end();
        let root_end = disk_size - ALIGNMENT;
        if root_end <= root_start {
            return Err(CloudImagesError::validation(format!(
                "Disk size {} leaves no room for the root partition",
                disk_size
            )));
        }
        let root = Partition {
            nr: PART_ROOT,
            type_uuid: arch.root_partition_type().to_ascii_uppercase(),
            part_uuid: uuids.root,
            start: root_start,
            size: root_end - root_start,
        };

        Ok(Self {
            disk_size,
            partitions: vec![bios, esp, root],
        })
    }

    /// Smallest layout whose root partition holds `root_size` bytes
    pub fn for_root_size(arch: Architecture, root_size: u64, uuids: PartitionUuids) -> Result<Self> {
        let needed = ALIGNMENT + BIOS_BOOT_SIZE + ESP_SIZE + align_up(root_size) + ALIGNMENT;
        Self::new(arch, needed, uuids)
    }

    pub fn partition(&self, nr: u32) -> Result<&Partition> {
        self.partitions
            .iter()
            .find(|p| p.nr == nr)
            .ok_or_else(|| CloudImagesError::not_found(format!("Partition {}", nr)))
    }

    pub fn bios_boot(&self) -> Result<&Partition> {
        self.partition(PART_BIOS_BOOT)
    }

    pub fn esp(&self) -> Result<&Partition> {
        self.partition(PART_ESP)
    }

    pub fn root(&self) -> Result<&Partition> {
        self.partition(PART_ROOT)
    }

    /// Input for `sfdisk`
    pub fn sfdisk_script(&self) -> String {
        let mut script = String::from("label: gpt\nunit: sectors\nsector-size: 512\n\n");
        for p in &self.partitions {
            // Writing into a String cannot fail
            let _ = writeln!(
                script,
                "p{} : start={}, size={}, type={}, uuid={}",
                p.nr,
                p.start_sector(),
                p.size_sectors(),
                p.type_uuid,
                p.part_uuid.hyphenated().to_string().to_ascii_uppercase()
            );
        }
        script
    }
}
