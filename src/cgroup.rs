//! CPU limiting through a dedicated cgroup-v2 directory.
//!
//! Setup errors propagate: the quota is a required precondition of the
//! run, not best-effort. Removal is the opposite: the kernel refuses to
//! delete a cgroup that still has members, so the coordinator treats a
//! failed removal as a cleanup warning, not an abort.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use nix::unistd::Pid;

const CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// An owned, created cgroup directory. Carried by the coordinator from
/// setup to cleanup; nothing else remembers the path.
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

/// Creates the container cgroup, writes the CPU quota, and moves `pid`
/// into it. `pid` must be host-visible; inside its own namespace the
/// init process is always PID 1, which means nothing to the host kernel.
pub fn limit_resources(name: &str, quota_us: u64, period_us: u64, pid: Pid) -> Result<Cgroup> {
    let path = Path::new(CGROUP_ROOT).join(name);
    fs::create_dir_all(&path)
        .with_context(|| format!("failed to create cgroup {}", path.display()))?;

    let cpu_max = path.join("cpu.max");
    fs::write(&cpu_max, cpu_max_value(quota_us, period_us))
        .with_context(|| format!("failed to write CPU quota to {}", cpu_max.display()))?;

    let procs = path.join("cgroup.procs");
    let mut file = fs::OpenOptions::new()
        .write(true)
        .open(&procs)
        .with_context(|| format!("failed to open {}", procs.display()))?;
    writeln!(file, "{pid}")
        .with_context(|| format!("failed to add {pid} to {}", procs.display()))?;

    tracing::info!(cgroup = %path.display(), %pid, quota_us, period_us, "resources limited");
    Ok(Cgroup { path })
}

impl Cgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Deletes the cgroup directory. Fails while a member process is
    /// still alive, so call it only after the container has exited.
    pub fn remove(&self) -> Result<()> {
        fs::remove_dir(&self.path)
            .with_context(|| format!("failed to remove cgroup {}", self.path.display()))
    }
}

/// Renders the cgroup-v2 `cpu.max` value: quota then period, space
/// separated, both in microseconds.
fn cpu_max_value(quota_us: u64, period_us: u64) -> String {
    format!("{quota_us} {period_us}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_max_is_quota_then_period() {
        assert_eq!(cpu_max_value(10_000, 100_000), "10000 100000");
    }

    #[test]
    fn cgroup_path_is_under_the_v2_root() {
        let cgroup = Cgroup {
            path: Path::new(CGROUP_ROOT).join("rustainer"),
        };
        assert_eq!(cgroup.path(), Path::new("/sys/fs/cgroup/rustainer"));
    }
}
