use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use tempfile::TempDir;

fn is_root() -> bool {
    nix::unistd::getuid().is_root()
}

fn rustainer() -> Command {
    Command::new(env!("CARGO_BIN_EXE_rustainer"))
}

/// Builds a throwaway rootfs with a static-enough shell if the host has
/// one. The lifecycle tests only need `exit` to work.
fn create_test_rootfs(temp_dir: &TempDir) -> Result<String, Box<dyn std::error::Error>> {
    let rootfs_path = temp_dir.path().join("rootfs");
    fs::create_dir_all(rootfs_path.join("bin"))?;
    fs::create_dir_all(rootfs_path.join("proc"))?;
    fs::create_dir_all(rootfs_path.join("dev"))?;

    for candidate in ["/bin/busybox", "/bin/sh"] {
        if Path::new(candidate).exists() {
            fs::copy(candidate, rootfs_path.join("bin/sh"))?;
            break;
        }
    }

    Ok(rootfs_path.to_string_lossy().to_string())
}

fn host_has_leftovers() -> bool {
    Path::new("/sys/class/net/veth0").exists() || Path::new("/sys/fs/cgroup/rustainer").exists()
}

#[test]
#[ignore] // Use `cargo test -- --ignored` to run privileged tests
fn test_container_lifecycle_cleans_up_host_state() {
    if !is_root() {
        println!("Skipping privileged test - not running as root");
        return;
    }

    let temp_dir = TempDir::new().unwrap();
    let rootfs = create_test_rootfs(&temp_dir).unwrap();

    // Run twice: deterministic names mean a leaked veth/cgroup/rule from
    // the first run would make the second one fail to provision.
    for attempt in 0..2 {
        let mut child = rustainer()
            .args(["run", "--rootfs", &rootfs])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("Failed to start container");

        child
            .stdin
            .take()
            .expect("stdin not captured")
            .write_all(b"exit\n")
            .expect("Failed to write to container shell");

        let output = child.wait_with_output().expect("Failed to wait for container");
        println!(
            "attempt {attempt}: status={:?}\nstderr={}",
            output.status,
            String::from_utf8_lossy(&output.stderr)
        );

        assert!(
            !host_has_leftovers(),
            "veth interface or cgroup left behind after run {attempt}"
        );
    }

    // NAT symmetry: nothing referencing the container subnet survives.
    let nat = Command::new("iptables")
        .args(["-t", "nat", "-S", "POSTROUTING"])
        .output()
        .expect("Failed to list NAT rules");
    assert!(
        !String::from_utf8_lossy(&nat.stdout).contains("192.168.1.0/24"),
        "masquerade rule leaked"
    );
}

#[test]
#[ignore] // Use `cargo test -- --ignored` to run privileged tests
fn test_missing_rootfs_changes_no_host_state() {
    if !is_root() {
        println!("Skipping privileged test - not running as root");
        return;
    }

    let output = rustainer()
        .args(["run", "--rootfs", "/definitely/not/a/rootfs"])
        .output()
        .expect("Failed to execute");

    assert!(!output.status.success());
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("not found"),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(
        !host_has_leftovers(),
        "precondition failure must not create host state"
    );
}

#[test]
fn test_run_without_root_is_refused() {
    if is_root() {
        println!("Skipping unprivileged test - running as root");
        return;
    }

    let output = rustainer()
        .args(["run", "--rootfs", "/tmp"])
        .output()
        .expect("Failed to execute");

    assert!(!output.status.success());
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("root"),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn test_run_needs_an_image_or_rootfs() {
    if !is_root() {
        // The privilege check fires first for unprivileged callers.
        return;
    }
    let output = rustainer().arg("run").output().expect("Failed to execute");
    assert!(!output.status.success());
    assert!(
        String::from_utf8_lossy(&output.stderr).contains("--rootfs"),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

#[test]
fn test_cgroup_v2_cpu_controller_detection() {
    let controllers_file = Path::new("/sys/fs/cgroup/cgroup.controllers");
    if !controllers_file.exists() {
        println!("cgroup v2 not mounted; skipping");
        return;
    }
    let controllers = fs::read_to_string(controllers_file).expect("Failed to read controllers");
    println!("Available cgroup controllers: {controllers}");
    if !controllers.split_whitespace().any(|c| c == "cpu") {
        println!("cpu controller not available; CPU limiting would fail on this host");
    }
}

#[test]
fn test_help_and_usage() {
    for args in [vec!["--help"], vec!["run", "--help"], vec!["pull", "--help"]] {
        let output = rustainer()
            .args(&args)
            .output()
            .expect("Failed to execute help command");

        assert!(
            output.status.success(),
            "help failed for {:?}: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
        assert!(!output.stdout.is_empty());
    }
}
