//! System baseline: swap, firewall, SELinux, kernel tuning, limits, time sync,
//! hostname and the cluster's /etc/hosts block
//!
//! Every command here converges to the same state when re-run.

use tracing::debug;

use super::StepOutcome;
use crate::channel::{shell_quote, CommandChannel};
use crate::spec::{ClusterConfig, NodeSpec};
use crate::Result;

const SYSCTL_PATH: &str = "/etc/sysctl.d/99-kubernetes.conf";
const MODULES_PATH: &str = "/etc/modules-load.d/kubernetes.conf";
const LIMITS_PATH: &str = "/etc/security/limits.d/99-kubernetes.conf";
const HOSTS_BLOCK_PATH: &str = "/tmp/kubestrap/hosts.block";

const SYSCTL_CONF: &str = "\
net.bridge.bridge-nf-call-iptables = 1
net.bridge.bridge-nf-call-ip6tables = 1
net.ipv4.ip_forward = 1
net.ipv4.conf.all.rp_filter = 0
vm.swappiness = 0
vm.overcommit_memory = 1
fs.inotify.max_user_watches = 1048576
fs.inotify.max_user_instances = 8192
fs.file-max = 2097152
net.core.somaxconn = 32768
net.netfilter.nf_conntrack_max = 1048576
";

const KERNEL_MODULES: &[&str] = &["overlay", "br_netfilter", "nf_conntrack"];

const LIMITS_CONF: &str = "\
* soft nofile 1048576
* hard nofile 1048576
* soft nproc unlimited
* hard nproc unlimited
* soft memlock unlimited
* hard memlock unlimited
";

const TUNE_SCRIPT: &str = r#"swapoff -a
sed -ri '/\sswap\s/s/^([^#])/#\1/' /etc/fstab
systemctl disable --now firewalld 2>/dev/null || true
ufw disable 2>/dev/null || true
setenforce 0 2>/dev/null || true
if [ -f /etc/selinux/config ]; then sed -i 's/^SELINUX=\(enforcing\|permissive\)/SELINUX=disabled/' /etc/selinux/config; fi
for gov in /sys/devices/system/cpu/cpu*/cpufreq/scaling_governor; do [ -f "$gov" ] && echo performance > "$gov" 2>/dev/null || true; done
"#;

const TIME_SYNC_SCRIPT: &str = "\
if command -v chronyd >/dev/null 2>&1; then systemctl enable --now chronyd 2>/dev/null || systemctl enable --now chrony; \
elif command -v ntpd >/dev/null 2>&1; then systemctl enable --now ntpd; \
else timedatectl set-ntp true 2>/dev/null || true; fi";

/// Marker-delimited /etc/hosts block listing every node of the cluster
pub fn hosts_block(config: &ClusterConfig) -> String {
    let mut block = format!("{}\n", begin_marker(config.name()));
    for node in &config.spec.nodes {
        block.push_str(&format!("{}\t{}\n", node.ip, node.hostname));
    }
    block.push_str(&format!("{}\n", end_marker(config.name())));
    block
}

fn begin_marker(cluster: &str) -> String {
    format!("# BEGIN kubestrap cluster {cluster}")
}

fn end_marker(cluster: &str) -> String {
    format!("# END kubestrap cluster {cluster}")
}

/// Replace any previous block for this cluster, then append the current one
fn hosts_update_command(cluster: &str) -> String {
    let range = format!("/^{}$/,/^{}$/d", begin_marker(cluster), end_marker(cluster));
    format!(
        "sed -i {} /etc/hosts && cat {HOSTS_BLOCK_PATH} >> /etc/hosts && rm -f {HOSTS_BLOCK_PATH}",
        shell_quote(&range)
    )
}

/// Apply the baseline to one node
pub async fn apply(
    channel: &dyn CommandChannel,
    config: &ClusterConfig,
    node: &NodeSpec,
) -> Result<StepOutcome> {
    channel.execute(TUNE_SCRIPT).await?;

    channel
        .upload(SYSCTL_CONF.as_bytes(), SYSCTL_PATH, 0o644)
        .await?;
    let modules = KERNEL_MODULES.join("\n") + "\n";
    channel.upload(modules.as_bytes(), MODULES_PATH, 0o644).await?;
    let modprobe: Vec<String> = KERNEL_MODULES
        .iter()
        .map(|m| format!("modprobe {m} 2>/dev/null || true"))
        .collect();
    channel.execute(&modprobe.join("; ")).await?;
    channel.execute("sysctl --system >/dev/null").await?;

    channel.upload(LIMITS_CONF.as_bytes(), LIMITS_PATH, 0o644).await?;
    channel.execute(TIME_SYNC_SCRIPT).await?;

    channel
        .execute(&format!(
            "hostnamectl set-hostname {}",
            shell_quote(&node.hostname)
        ))
        .await?;
    channel
        .upload(hosts_block(config).as_bytes(), HOSTS_BLOCK_PATH, 0o644)
        .await?;
    channel.execute(&hosts_update_command(config.name())).await?;

    debug!(node = %node.hostname, "baseline applied");
    Ok(StepOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::load_from_str;

    fn config() -> ClusterConfig {
        load_from_str(
            r#"
metadata: {name: demo}
spec:
  nodes:
    - {role: master, ip: 10.0.0.1, ssh: {password: pw}}
    - {role: worker, ip: 10.0.0.2, ssh: {password: pw}}
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_hosts_block_lists_every_node_between_markers() {
        let block = hosts_block(&config());
        let lines: Vec<&str> = block.lines().collect();
        assert_eq!(
            lines,
            vec![
                "# BEGIN kubestrap cluster demo",
                "10.0.0.1\tdemo-master-01",
                "10.0.0.2\tdemo-node-01",
                "# END kubestrap cluster demo",
            ]
        );
    }

    #[test]
    fn test_hosts_update_removes_previous_block_first() {
        let cmd = hosts_update_command("demo");
        assert!(cmd.starts_with(
            "sed -i '/^# BEGIN kubestrap cluster demo$/,/^# END kubestrap cluster demo$/d' /etc/hosts"
        ));
        assert!(cmd.contains(">> /etc/hosts"));
    }

    #[tokio::test]
    async fn test_apply_writes_config_files() {
        let config = config();
        let fleet = crate::testing::FakeFleet::new();
        let channel = fleet.channel_for("10.0.0.1");

        let outcome = apply(channel.as_ref(), &config, &config.spec.nodes[0])
            .await
            .unwrap();

        assert_eq!(outcome, StepOutcome::Applied);
        let uploads = fleet.uploaded_paths("10.0.0.1");
        assert!(uploads.contains(&SYSCTL_PATH.to_string()));
        assert!(uploads.contains(&MODULES_PATH.to_string()));
        assert!(uploads.contains(&HOSTS_BLOCK_PATH.to_string()));
        assert!(fleet.ran("10.0.0.1", "swapoff -a"));
        assert!(fleet.ran("10.0.0.1", "hostnamectl set-hostname demo-master-01"));
    }
}
