//! Mounting update payloads.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::error::EngineError;

pub trait DiskImageMounter: Send + Sync {
    /// Mount `image` and return the directory its contents appear in.
    fn mount(&self, image: &Path) -> Result<PathBuf, EngineError>;

    fn unmount(&self, mount_point: &Path) -> Result<(), EngineError>;
}

/// Attaches `.dmg` files with `hdiutil`, hidden and without verification.
pub struct HdiutilMounter;

impl HdiutilMounter {
    fn run(args: &[&str], image: &Path) -> Result<String, EngineError> {
        let output = Command::new("/usr/bin/hdiutil")
            .args(args)
            .output()
            .map_err(|source| EngineError::Command {
                command: format!("hdiutil {}", args.join(" ")),
                source,
            })?;
        if !output.status.success() {
            return Err(EngineError::DiskImage {
                path: image.display().to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl DiskImageMounter for HdiutilMounter {
    fn mount(&self, image: &Path) -> Result<PathBuf, EngineError> {
        let image_arg = image.display().to_string();
        let stdout = Self::run(
            &["attach", "-nobrowse", "-noverify", "-noautoopen", &image_arg],
            image,
        )?;
        // The last tab-separated column of the last line is the mount point.
        stdout
            .lines()
            .rev()
            .filter_map(|line| line.rsplit('\t').next())
            .map(str::trim)
            .find(|col| col.starts_with('/') && !col.starts_with("/dev/"))
            .map(PathBuf::from)
            .ok_or_else(|| EngineError::DiskImage {
                path: image.display().to_string(),
                message: "hdiutil reported no mount point".into(),
            })
    }

    fn unmount(&self, mount_point: &Path) -> Result<(), EngineError> {
        let arg = mount_point.display().to_string();
        Self::run(&["detach", "-force", &arg], mount_point).map(|_| ())
    }
}

/// Treats the "image" as an already-expanded directory.
pub struct DirectoryMounter;

impl DiskImageMounter for DirectoryMounter {
    fn mount(&self, image: &Path) -> Result<PathBuf, EngineError> {
        if image.is_dir() {
            Ok(image.to_path_buf())
        } else {
            Err(EngineError::DiskImage {
                path: image.display().to_string(),
                message: "not a directory".into(),
            })
        }
    }

    fn unmount(&self, _mount_point: &Path) -> Result<(), EngineError> {
        Ok(())
    }
}

/// `hdiutil` where it exists, plain directories elsewhere.
pub fn default_mounter() -> Arc<dyn DiskImageMounter> {
    if cfg!(target_os = "macos") {
        Arc::new(HdiutilMounter)
    } else {
        Arc::new(DirectoryMounter)
    }
}
