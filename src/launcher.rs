//! Namespace launcher: the double fork that places the container init
//! inside fresh UTS, mount, network and PID namespaces.
//!
//! Unsharing a PID namespace does not move the calling process into it;
//! only its next child is born there. So the tree is: coordinator forks an
//! intermediate process, the intermediate unshares, then forks init, which
//! becomes PID 1 of the new namespace. The intermediate runs no container
//! logic of its own: it relays init's host-visible PID through the handoff
//! channel, waits for init, and exits with init's status.

use std::path::Path;
use std::process;

use anyhow::{Context, Result};
use nix::sched::{CloneFlags, unshare};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};

use crate::channel::{PidSender, pid_channel};
use crate::config::ContainerConfig;
use crate::init;

/// Handle to a directly forked child, joinable exactly like a thread.
pub struct ChildHandle {
    pid: Pid,
}

impl ChildHandle {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Blocks until the child exits and returns its wait status.
    pub fn join(&self) -> Result<WaitStatus> {
        waitpid(self.pid, None)
            .with_context(|| format!("failed to wait for child process {}", self.pid))
    }
}

/// Result of a successful launch: the intermediate process to join on,
/// and the host-visible PID of the container init.
pub struct Launch {
    pub intermediate: ChildHandle,
    pub init_pid: Pid,
}

/// Forks the intermediate process and receives the init PID from it.
///
/// On return the namespaces exist and init is running inside them; the
/// caller may configure cgroups and networking against `init_pid`, which
/// is valid in the host's PID namespace.
pub fn spawn(config: &ContainerConfig, rootfs: &Path) -> Result<Launch> {
    let (sender, receiver) = pid_channel()?;

    match unsafe { fork() }.context("failed to fork the intermediate process")? {
        ForkResult::Child => {
            // The intermediate never reads; close that end now so the
            // coordinator sees EOF if this process dies before sending.
            drop(receiver);
            let code = match intermediate(config, rootfs, sender) {
                Ok(code) => code,
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "namespace setup failed");
                    1
                }
            };
            process::exit(code);
        }
        ForkResult::Parent { child } => {
            drop(sender);
            let init_pid = receiver
                .recv()
                .context("did not receive the container PID from the intermediate process")?;
            Ok(Launch {
                intermediate: ChildHandle { pid: child },
                init_pid,
            })
        }
    }
}

/// Body of the intermediate process: unshare, fork init, relay its PID,
/// then wait for it. Returns the exit code this process should exit with.
fn intermediate(config: &ContainerConfig, rootfs: &Path, sender: PidSender) -> Result<i32> {
    unshare(
        CloneFlags::CLONE_NEWUTS
            | CloneFlags::CLONE_NEWNS
            | CloneFlags::CLONE_NEWNET
            | CloneFlags::CLONE_NEWPID,
    )
    .context("failed to unshare UTS/mount/net/PID namespaces (root required)")?;

    match unsafe { fork() }.context("failed to fork the container init process")? {
        ForkResult::Child => {
            // PID 1 of the new PID namespace.
            let code = match init::run(config, rootfs) {
                Ok(code) => code,
                Err(err) => {
                    tracing::error!(error = %format!("{err:#}"), "container init failed");
                    1
                }
            };
            process::exit(code);
        }
        ForkResult::Parent { child } => {
            // `child` is init's PID as seen from the host namespace, which
            // is exactly what cgroup and `ip`/`nsenter` calls need.
            sender.send(child)?;
            let status = waitpid(child, None).context("failed to wait for the container init")?;
            Ok(exit_code(&status))
        }
    }
}

/// Maps a wait status onto a shell-style exit code.
pub fn exit_code(status: &WaitStatus) -> i32 {
    match status {
        WaitStatus::Exited(_, code) => *code,
        WaitStatus::Signaled(_, signal, _) => 128 + *signal as i32,
        _ => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn exit_code_passes_through_normal_exits() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 3);
        assert_eq!(exit_code(&status), 3);
    }

    #[test]
    fn exit_code_encodes_fatal_signals() {
        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(exit_code(&status), 128 + libc::SIGKILL);
    }
}
