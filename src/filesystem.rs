//! Root filesystem setup for the container init process.
//!
//! Everything here runs inside the new mount namespace, in the init
//! process only. Order matters: propagation on `/` is made private before
//! any other mount so nothing leaks to or from the host mount table, and
//! chroot happens before mounting `/proc` because the mount target is
//! resolved relative to the new root.

use std::path::Path;

use anyhow::{Context, Result, bail};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::unistd::{chdir, chroot};

/// Stops mount events on `/` from propagating across the namespace
/// boundary in either direction.
pub fn make_mounts_private() -> Result<()> {
    mount(
        None::<&str>,
        "/",
        None::<&str>,
        MsFlags::MS_REC | MsFlags::MS_PRIVATE,
        None::<&str>,
    )
    .context("failed to make mount propagation on / private")
}

/// Changes root and working directory to `rootfs`.
///
/// The path must already be populated; the runtime only checks that it
/// exists. Missing paths are a precondition error, reported before any
/// mount is touched.
pub fn enter_rootfs(rootfs: &Path) -> Result<()> {
    if !rootfs.exists() {
        bail!("root filesystem not found at {}", rootfs.display());
    }
    chroot(rootfs).with_context(|| format!("chroot to {} failed", rootfs.display()))?;
    chdir("/").context("chdir to the new root failed")?;
    tracing::info!(rootfs = %rootfs.display(), "root filesystem changed");
    Ok(())
}

/// Mounts procfs at `/proc` inside the (already chrooted) container root,
/// creating the mount point if the image ships without one.
pub fn mount_proc() -> Result<()> {
    if !Path::new("/proc").exists() {
        std::fs::create_dir("/proc").context("failed to create /proc in the container root")?;
    }
    mount(
        Some("proc"),
        "/proc",
        Some("proc"),
        MsFlags::empty(),
        None::<&str>,
    )
    .context("failed to mount /proc")?;
    tracing::debug!("/proc mounted");
    Ok(())
}

/// Unmounts `/proc` after the shell has exited, so the init process
/// leaves the mount table as it found it.
pub fn unmount_proc() -> Result<()> {
    umount2("/proc", MntFlags::empty()).context("failed to unmount /proc")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_rootfs_is_reported_before_chroot() {
        let err = enter_rootfs(Path::new("/definitely/not/a/rootfs")).unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");
    }
}
