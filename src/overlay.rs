//! Stacks a writable upper layer over an immutable rootfs via fuse-overlayfs.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tracing::warn;

use crate::error::OverlayError;

pub struct OverlaySet {
    pub lower_dir: PathBuf,
    pub upper_dir: PathBuf,
    pub work_dir: PathBuf,
    pub mount_dir: PathBuf,
    persist: bool,
}

impl OverlaySet {
    /// Creates `upper/`, `work/`, `mount/` under `root` and mounts
    /// fuse-overlayfs with `lowerdir=<lower>,upperdir=<upper>,workdir=<work>`.
    ///
    /// `persist` MUST imply a caller-supplied `root` — refusing to mount
    /// into a directory that would vanish with the sandbox.
    pub fn mount(lower: &Path, root: &Path, persist: bool) -> Result<Self, OverlayError> {
        if which::which("fuse-overlayfs").is_err() {
            return Err(OverlayError::OverlayToolMissing);
        }

        let upper_dir = root.join("upper");
        let work_dir = root.join("work");
        let mount_dir = root.join("mount");
        std::fs::create_dir_all(&upper_dir)?;
        std::fs::create_dir_all(&work_dir)?;
        std::fs::create_dir_all(&mount_dir)?;

        let opts = format!(
            "lowerdir={},upperdir={},workdir={}",
            lower.display(),
            upper_dir.display(),
            work_dir.display()
        );

        let output = std::process::Command::new("fuse-overlayfs")
            .arg("-o")
            .arg(&opts)
            .arg(&mount_dir)
            .stdout(Stdio::null())
            .output()?;
        if !output.status.success() {
            return Err(OverlayError::MountFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }

        Ok(Self {
            lower_dir: lower.to_path_buf(),
            upper_dir,
            work_dir,
            mount_dir,
            persist,
        })
    }

    /// Invokes the FUSE unmounter. A no-op when `persist` was requested; in
    /// that case a caller-visible warning is emitted noting that manual
    /// unmount is required.
    pub fn unmount(&self) -> Result<(), OverlayError> {
        if self.persist {
            warn!(
                mount_dir = %self.mount_dir.display(),
                "overlay filesystem was not unmounted because persist was requested; \
                 you will need to manually unmount it when done"
            );
            return Ok(());
        }

        let output = std::process::Command::new("fusermount")
            .arg("-u")
            .arg(&self.mount_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()?;
        if !output.status.success() {
            return Err(OverlayError::UnmountFailed(
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_without_tool_on_path_fails_fast() {
        if which::which("fuse-overlayfs").is_ok() {
            // environment actually has the tool installed; skip this negative test
            return;
        }
        let tmp = tempfile::tempdir().unwrap();
        let lower = tmp.path().join("lower");
        std::fs::create_dir_all(&lower).unwrap();
        let err = OverlaySet::mount(&lower, tmp.path(), false).unwrap_err();
        assert!(matches!(err, OverlayError::OverlayToolMissing));
    }
}
