//! Virtual networking for the container: a veth pair bridged to the host
//! with NAT, driven entirely from the coordinator via `ip`, `nsenter` and
//! `iptables`.
//!
//! The container process never configures its own network. The
//! coordinator enters the container's net namespace through
//! `/proc/<pid>/ns/net`, which is why it must hold the host-visible PID.
//! Setup steps have no reordering freedom: an interface cannot be
//! addressed before it exists, nor routed before it is up.
//!
//! Every firewall rule is described once as a match tuple; install
//! appends it and teardown deletes the same tuple, so add/delete
//! symmetry holds by construction.

use std::process::Command;

use anyhow::{Context, Result, ensure};
use nix::unistd::Pid;

use crate::config::ContainerConfig;

const IP_FORWARD_SYSCTL: &str = "/proc/sys/net/ipv4/ip_forward";

/// Enables routing between interfaces host-wide. Idempotent; left
/// enabled after teardown like most container runtimes do.
pub fn enable_ip_forwarding() -> Result<()> {
    std::fs::write(IP_FORWARD_SYSCTL, "1")
        .with_context(|| format!("failed to enable IP forwarding via {IP_FORWARD_SYSCTL}"))?;
    tracing::info!("IP forwarding enabled");
    Ok(())
}

/// The provisioned network state the coordinator carries into cleanup:
/// which host interface exists and whether the NAT rules were installed.
#[derive(Debug)]
pub struct Network {
    veth_host: String,
    subnet: String,
    nat_installed: bool,
}

/// Creates the veth pair. The host-side end exists from this point on,
/// so the returned record must reach the cleanup path even if a later
/// setup step fails.
pub fn create_veth_pair(config: &ContainerConfig) -> Result<Network> {
    run(
        "ip",
        &[
            "link",
            "add",
            &config.veth_host,
            "type",
            "veth",
            "peer",
            "name",
            &config.veth_container,
        ],
    )?;
    tracing::info!(
        host = %config.veth_host,
        container = %config.veth_container,
        "veth pair created"
    );
    Ok(Network {
        veth_host: config.veth_host.clone(),
        subnet: config.subnet.clone(),
        nat_installed: false,
    })
}

impl Network {
    /// Moves the container-side end into `pid`'s net namespace and
    /// configures both ends: host address and link up, then (inside the
    /// namespace) container address, link up, and a default route via
    /// the host.
    pub fn attach(&self, config: &ContainerConfig, pid: Pid) -> Result<()> {
        let netns = format!("--net=/proc/{pid}/ns/net");

        run(
            "ip",
            &["link", "set", &config.veth_container, "netns", &pid.to_string()],
        )?;
        run("ip", &["addr", "add", &config.host_addr, "dev", &config.veth_host])?;
        run("ip", &["link", "set", &config.veth_host, "up"])?;

        run(
            "nsenter",
            &[&netns, "ip", "addr", "add", &config.container_addr, "dev", &config.veth_container],
        )?;
        run(
            "nsenter",
            &[&netns, "ip", "link", "set", &config.veth_container, "up"],
        )?;
        run(
            "nsenter",
            &[&netns, "ip", "route", "add", "default", "via", &config.gateway],
        )?;

        tracing::info!(%pid, "container network configured");
        Ok(())
    }

    /// Installs the masquerade and forward-accept rules for the
    /// container subnet.
    pub fn install_nat(&mut self) -> Result<()> {
        for rule in nat_rules(&self.veth_host, &self.subnet) {
            apply_rule("-A", &rule)?;
        }
        self.nat_installed = true;
        tracing::info!(subnet = %self.subnet, "NAT and forwarding rules installed");
        Ok(())
    }

    /// Removes whatever this record says exists: the NAT rules (if they
    /// were installed) and then the host-side interface, whose deletion
    /// takes the in-namespace peer with it. Each step runs regardless of
    /// earlier failures; errors are returned for the cleanup report.
    pub fn teardown(&self) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        if self.nat_installed {
            for rule in nat_rules(&self.veth_host, &self.subnet) {
                if let Err(err) = apply_rule("-D", &rule) {
                    errors.push(err);
                }
            }
        }
        if let Err(err) = run("ip", &["link", "delete", &self.veth_host]) {
            errors.push(err);
        }
        errors
    }
}

/// One iptables rule as a match tuple, identical for append and delete.
struct RuleSpec {
    table: Option<&'static str>,
    chain: &'static str,
    matches: Vec<String>,
}

/// The three rules that make the container subnet routable: masquerade
/// traffic leaving through any interface but the veth, and accept
/// forwarding in both directions on the veth.
fn nat_rules(veth_host: &str, subnet: &str) -> Vec<RuleSpec> {
    let owned = |parts: &[&str]| parts.iter().map(ToString::to_string).collect();
    vec![
        RuleSpec {
            table: Some("nat"),
            chain: "POSTROUTING",
            matches: owned(&["-s", subnet, "!", "-o", veth_host, "-j", "MASQUERADE"]),
        },
        RuleSpec {
            table: None,
            chain: "FORWARD",
            matches: owned(&["-i", veth_host, "-j", "ACCEPT"]),
        },
        RuleSpec {
            table: None,
            chain: "FORWARD",
            matches: owned(&["-o", veth_host, "-j", "ACCEPT"]),
        },
    ]
}

/// Builds the full iptables argument list for one rule; `op` is `-A` to
/// install or `-D` to remove, everything else is shared.
fn iptables_args(op: &str, rule: &RuleSpec) -> Vec<String> {
    let mut args = Vec::new();
    if let Some(table) = rule.table {
        args.push("-t".to_string());
        args.push(table.to_string());
    }
    args.push(op.to_string());
    args.push(rule.chain.to_string());
    args.extend(rule.matches.iter().cloned());
    args
}

fn apply_rule(op: &str, rule: &RuleSpec) -> Result<()> {
    let args = iptables_args(op, rule);
    let refs: Vec<&str> = args.iter().map(String::as_str).collect();
    run("iptables", &refs)
}

/// Runs an external network tool and treats any non-zero exit as an
/// error naming the exact invocation.
fn run(program: &str, args: &[&str]) -> Result<()> {
    tracing::debug!(%program, ?args, "running network command");
    let status = Command::new(program)
        .args(args)
        .status()
        .with_context(|| format!("failed to run {program}"))?;
    ensure!(
        status.success(),
        "`{program} {}` exited with {status}",
        args.join(" ")
    );
    Ok(())
}
