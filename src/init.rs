//! The container init process (PID 1 of the new PID namespace).
//!
//! Init does the in-namespace setup, then forks once more and runs the
//! shell as a child. PID 1 of a namespace has reaping duties, so the
//! supervisor/shell split keeps init trivial: it waits for the shell,
//! unmounts `/proc`, and exits with the shell's status.

use std::ffi::CString;
use std::path::Path;
use std::process;

use anyhow::{Context, Result};
use nix::sys::wait::waitpid;
use nix::unistd::{ForkResult, execv, fork, sethostname};

use crate::config::ContainerConfig;
use crate::filesystem;
use crate::launcher::exit_code;

/// Full init sequence; returns the exit code the init process should
/// terminate with. Runs only inside the new namespaces.
pub fn run(config: &ContainerConfig, rootfs: &Path) -> Result<i32> {
    sethostname(&config.hostname).context("failed to set the container hostname")?;

    // Private propagation must come before any mount, chroot before the
    // /proc mount (its target lives under the new root).
    filesystem::make_mounts_private()?;
    filesystem::enter_rootfs(rootfs)?;
    filesystem::mount_proc()?;

    match unsafe { fork() }.context("failed to fork the container shell")? {
        ForkResult::Child => {
            process::exit(exec_shell(&config.shell));
        }
        ForkResult::Parent { child } => {
            let status = waitpid(child, None).context("failed to wait for the container shell")?;
            filesystem::unmount_proc()?;
            Ok(exit_code(&status))
        }
    }
}

/// Replaces the current process with the shell; only returns on failure.
fn exec_shell(shell: &str) -> i32 {
    let cmd = match CString::new(shell) {
        Ok(cmd) => cmd,
        Err(_) => {
            tracing::error!(shell, "shell path contains a NUL byte");
            return 127;
        }
    };
    let args = [cmd.clone()];
    let Err(err) = execv(&cmd, &args);
    tracing::error!(shell, error = %err, "failed to exec the container shell");
    127
}
