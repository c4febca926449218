//! Container configuration with documented defaults.
//!
//! Every name and address the runtime creates on the host comes from this
//! struct, so a second container could run with a different config without
//! touching the rest of the code. The defaults describe a single fixed
//! container: one cgroup, one veth pair, one /24 subnet.

/// Names, addresses and limits for one container instance.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Hostname set inside the UTS namespace.
    pub hostname: String,
    /// Shell executed as the container's foreground process.
    pub shell: String,
    /// Directory name under `/sys/fs/cgroup` for this container.
    pub cgroup_name: String,
    /// CPU quota in microseconds per period (cgroup v2 `cpu.max`).
    pub cpu_quota_us: u64,
    /// CPU period in microseconds.
    pub cpu_period_us: u64,
    /// Host-side veth interface name.
    pub veth_host: String,
    /// Container-side veth interface name (moved into the net namespace).
    pub veth_container: String,
    /// Address assigned to the host-side interface, CIDR notation.
    pub host_addr: String,
    /// Address assigned to the container-side interface, CIDR notation.
    pub container_addr: String,
    /// Default-route gateway as seen from inside the container.
    pub gateway: String,
    /// Container subnet, used by the NAT rules.
    pub subnet: String,
}

impl Default for ContainerConfig {
    /// 10% of one core, `veth0`/`veth1`, 192.168.1.0/24 with the host
    /// at .1 and the container at .2.
    fn default() -> Self {
        Self {
            hostname: "rustainer".to_string(),
            shell: "/bin/sh".to_string(),
            cgroup_name: "rustainer".to_string(),
            cpu_quota_us: 10_000,
            cpu_period_us: 100_000,
            veth_host: "veth0".to_string(),
            veth_container: "veth1".to_string(),
            host_addr: "192.168.1.1/24".to_string(),
            container_addr: "192.168.1.2/24".to_string(),
            gateway: "192.168.1.1".to_string(),
            subnet: "192.168.1.0/24".to_string(),
        }
    }
}
