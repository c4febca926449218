//! Lifecycle coordinator: the outermost process that sequences
//! provisioning, waits for the container to exit, and guarantees cleanup.
//!
//! The coordinator validates preconditions before creating anything,
//! then runs setup step by step while recording every kernel object it
//! has created in a [`ProvisionedResources`] value. Cleanup consumes that
//! record and releases each resource independently, so a failure halfway
//! through setup still tears down exactly what exists.

use std::fmt;
use std::path::Path;

use anyhow::{Context, Result, bail};
use nix::sys::signal::{SigHandler, Signal, kill, signal};
use nix::unistd::{Pid, setpgid};

use crate::cgroup::{self, Cgroup};
use crate::config::ContainerConfig;
use crate::launcher::{self, exit_code};
use crate::network::{self, Network};

/// Progress of one container run, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LifecycleState {
    Init,
    NamespacesCreated,
    PidKnown,
    ResourcesLimited,
    NetworkUp,
    Running,
    Exiting,
    CleanedUp,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::NamespacesCreated => "NAMESPACES_CREATED",
            Self::PidKnown => "PID_KNOWN",
            Self::ResourcesLimited => "RESOURCES_LIMITED",
            Self::NetworkUp => "NETWORK_UP",
            Self::Running => "RUNNING",
            Self::Exiting => "EXITING",
            Self::CleanedUp => "CLEANED_UP",
        };
        f.write_str(name)
    }
}

fn enter(state: LifecycleState) {
    tracing::info!(state = %state, "lifecycle");
}

/// Kernel objects created so far. Whatever is present when cleanup runs
/// gets released; fields stay `None` for steps that never happened.
#[derive(Default)]
pub struct ProvisionedResources {
    cgroup: Option<Cgroup>,
    network: Option<Network>,
}

/// Aggregated, non-fatal outcome of the cleanup pass.
pub struct CleanupReport {
    pub errors: Vec<anyhow::Error>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Runs one container to completion and returns the shell's exit code.
///
/// Blocks for the lifetime of the interactive session. Cleanup runs on
/// every path that gets past the launch, including provisioning
/// failures.
pub fn run_container(config: &ContainerConfig, rootfs: &Path) -> Result<i32> {
    // Precondition check: a missing rootfs must fail before any
    // namespace, mount, or network side effect.
    if !rootfs.exists() {
        bail!("root filesystem not found at {}", rootfs.display());
    }

    // Own process group, SIGINT ignored: Ctrl-C belongs to the shell in
    // the container, not to the coordinator supervising it.
    setpgid(Pid::from_raw(0), Pid::from_raw(0))
        .context("failed to move the coordinator into its own process group")?;
    unsafe { signal(Signal::SIGINT, SigHandler::SigIgn) }.context("failed to ignore SIGINT")?;

    enter(LifecycleState::Init);
    let launch = launcher::spawn(config, rootfs)?;
    enter(LifecycleState::NamespacesCreated);
    enter(LifecycleState::PidKnown);
    tracing::info!(init_pid = %launch.init_pid, "container started");

    let mut resources = ProvisionedResources::default();
    let setup = provision(config, launch.init_pid, &mut resources);

    let status = match &setup {
        Ok(()) => {
            enter(LifecycleState::Running);
            launch.intermediate.join()
        }
        Err(_) => {
            // Provisioning failed: do not leave a half-configured
            // container attached to the terminal. Kill init, then
            // collect the subtree so the cgroup becomes removable.
            if let Err(err) = kill(launch.init_pid, Signal::SIGKILL) {
                tracing::warn!(pid = %launch.init_pid, error = %err, "failed to kill init");
            }
            launch.intermediate.join()
        }
    };

    enter(LifecycleState::Exiting);
    let report = cleanup(resources);
    for err in &report.errors {
        tracing::warn!(error = %format!("{err:#}"), "cleanup step failed");
    }
    enter(LifecycleState::CleanedUp);
    tracing::info!(
        clean = report.is_clean(),
        "container exited and resources released"
    );

    setup?;
    Ok(exit_code(&status?))
}

/// The ordered setup sequence; each created resource lands in
/// `resources` before the next step runs, so a later failure cannot
/// orphan it.
fn provision(
    config: &ContainerConfig,
    init_pid: Pid,
    resources: &mut ProvisionedResources,
) -> Result<()> {
    network::enable_ip_forwarding()?;

    resources.cgroup = Some(cgroup::limit_resources(
        &config.cgroup_name,
        config.cpu_quota_us,
        config.cpu_period_us,
        init_pid,
    )?);
    enter(LifecycleState::ResourcesLimited);

    let net = resources.network.insert(network::create_veth_pair(config)?);
    net.attach(config, init_pid)?;
    net.install_nat()?;
    enter(LifecycleState::NetworkUp);
    Ok(())
}

/// Releases everything in the record. Each release runs regardless of
/// the others; failures are collected, never propagated.
pub fn cleanup(resources: ProvisionedResources) -> CleanupReport {
    let mut errors = Vec::new();
    if let Some(cgroup) = resources.cgroup {
        if let Err(err) = cgroup.remove() {
            errors.push(err);
        }
    }
    if let Some(net) = resources.network {
        errors.extend(net.teardown());
    }
    CleanupReport { errors }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_rootfs_fails_before_any_side_effect() {
        let config = ContainerConfig::default();
        let err = run_container(&config, Path::new("/no/such/rootfs")).unwrap_err();
        assert!(err.to_string().contains("not found"), "{err}");
    }

    #[test]
    fn cleanup_with_nothing_provisioned_is_clean() {
        let report = cleanup(ProvisionedResources::default());
        assert!(report.is_clean());
    }

    #[test]
    fn states_render_like_the_lifecycle_diagram() {
        assert_eq!(LifecycleState::PidKnown.to_string(), "PID_KNOWN");
        assert_eq!(LifecycleState::CleanedUp.to_string(), "CLEANED_UP");
    }
}
