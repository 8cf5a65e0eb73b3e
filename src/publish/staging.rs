// file: src/publish/staging.rs
// version: 1.0.0
// guid: 9d4b2e6f-3a1c-4e87-b5d0-7c6e5f4a3b2c

//! Scoped staging directories
//!
//! A staging directory lives next to its final location under a hidden
//! name. Committing renames it into place; dropping it uncommitted removes
//! it with everything inside.

use crate::error::CloudImagesError;
use crate::Result;
use chrono::{SecondsFormat, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

pub const DIR_MODE: u32 = 0o755;
pub const FILE_MODE: u32 = 0o444;

fn random_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect()
}

pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

/// Temporary directory `.{name}_<random>` below a parent
#[derive(Debug)]
pub struct StagingDir {
    path: PathBuf,
    committed: bool,
}

impl StagingDir {
    pub fn create(parent: &Path, name: &str) -> Result<Self> {
        let path = parent.join(format!(".{}_{}", name, random_suffix()));
        fs::create_dir(&path)?;
        set_mode(&path, DIR_MODE)?;
        debug!("Staging in {}", path.display());
        Ok(Self {
            path,
            committed: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the directory to `target`. An existing `target` is first moved
    /// aside to `.{name}_{timestamp}`, whose path is returned.
    pub fn commit(mut self, target: &Path) -> Result<Option<PathBuf>> {
        let backup = if target.exists() {
            let name = target
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| CloudImagesError::validation(format!("Bad target {}", target.display())))?;
            let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
            let backup = target.with_file_name(format!(".{}_{}", name, stamp));
            fs::rename(target, &backup)?;
            info!("Moved previous {} aside to {}", target.display(), backup.display());
            Some(backup)
        } else {
            None
        };

        if let Err(e) = fs::rename(&self.path, target) {
            if let Some(backup) = &backup {
                match fs::rename(backup, target) {
                    Ok(()) => info!("Restored {} after failed commit", target.display()),
                    Err(restore) => error!(
                        "Failed to restore {} from {}: {}",
                        target.display(),
                        backup.display(),
                        restore
                    ),
                }
            }
            return Err(e.into());
        }
        self.committed = true;
        info!("Committed {}", target.display());
        Ok(backup)
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        match fs::remove_dir_all(&self.path) {
            Ok(()) => debug!("Removed staging directory {}", self.path.display()),
            Err(e) => warn!("Failed to remove staging directory {}: {}", self.path.display(), e),
        }
    }
}

/// Point symlink `link` at `target`, replacing it atomically
pub fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    let name = link
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CloudImagesError::validation(format!("Bad link {}", link.display())))?;
    let tmp = link.with_file_name(format!(".{}_{}", name, random_suffix()));
    symlink(target, &tmp)?;
    if let Err(e) = fs::rename(&tmp, link) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    debug!("{} -> {}", link.display(), target.display());
    Ok(())
}
