//! Control-plane load balancer for HA clusters
//!
//! Every master runs keepalived, which holds the VIP on one master at a time,
//! and HAProxy, which forwards the VIP's frontend port to every master's API
//! server. The frontend listens on [`HA_FRONTEND_PORT`] because kube-apiserver
//! already binds 6443 on all addresses of the same machine.
//!
//! The first master starts as the VRRP `MASTER` with the highest priority, so
//! the VIP is local to it while `kubeadm init` runs. Backends that are not up
//! yet are marked down by HAProxy's health checks until they join.

use minijinja::Environment;
use serde::Serialize;
use tracing::{debug, info};

use crate::channel::CommandChannel;
use crate::spec::{ClusterConfig, NodeSpec};
use crate::{Error, Result, API_SERVER_PORT, HA_FRONTEND_PORT};

/// HAProxy configuration path
pub const HAPROXY_CONFIG_PATH: &str = "/etc/haproxy/haproxy.cfg";
/// keepalived configuration path
pub const KEEPALIVED_CONFIG_PATH: &str = "/etc/keepalived/keepalived.conf";
/// keepalived health check for the local API server
pub const CHECK_SCRIPT_PATH: &str = "/etc/keepalived/check_apiserver.sh";

const DEFAULT_INTERFACE: &str = "eth0";
const DEFAULT_ROUTER_ID: u8 = 51;

const INSTALL_SCRIPT: &str = "\
if command -v haproxy >/dev/null 2>&1 && command -v keepalived >/dev/null 2>&1; then exit 0; fi
if command -v apt-get >/dev/null 2>&1; then DEBIAN_FRONTEND=noninteractive apt-get install -y -qq haproxy keepalived; \
elif command -v dnf >/dev/null 2>&1; then dnf install -y -q haproxy keepalived; \
else yum install -y -q haproxy keepalived; fi";

const INTERFACE_COMMAND: &str = "ip -o -4 route show to default | awk '{print $5}' | head -1";

const START_SCRIPT: &str = "\
systemctl enable haproxy keepalived >/dev/null 2>&1
systemctl restart haproxy
systemctl restart keepalived
systemctl is-active --quiet haproxy
systemctl is-active --quiet keepalived";

const HAPROXY_TEMPLATE: &str = r#"global
    log /dev/log local0
    stats socket /run/haproxy/admin.sock mode 660 level admin
    stats timeout 30s
    user haproxy
    group haproxy
    daemon
    maxconn 4000

defaults
    log     global
    mode    tcp
    option  tcplog
    option  dontlognull
    timeout connect 5s
    timeout client  50s
    timeout server  50s
    retries 3

frontend kube-apiserver
    bind *:{{ frontend_port }}
    mode tcp
    default_backend kube-apiserver

backend kube-apiserver
    mode tcp
    balance roundrobin
    option tcp-check
{% for backend in backends %}
    server {{ backend.name }} {{ backend.address }}:{{ api_port }} check inter 2000 rise 2 fall 3
{% endfor %}
"#;

const KEEPALIVED_TEMPLATE: &str = r#"global_defs {
    router_id {{ node_name }}
}

vrrp_script check_apiserver {
    script "{{ check_script }}"
    interval 3
    weight -2
    fall 10
    rise 2
}

vrrp_instance VI_1 {
    state {{ state }}
    interface {{ interface }}
    virtual_router_id {{ router_id }}
    priority {{ priority }}
    advert_int 1
    authentication {
        auth_type PASS
        auth_pass {{ auth_pass }}
    }
    virtual_ipaddress {
        {{ vip }}
    }
    track_script {
        check_apiserver
    }
}
"#;

const CHECK_TEMPLATE: &str = r#"#!/bin/sh
systemctl is-active --quiet haproxy || exit 1
curl --silent --max-time 2 --insecure https://localhost:{{ api_port }}/healthz -o /dev/null || exit 1
"#;

/// One API server behind the frontend
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Backend {
    /// Server name in the HAProxy config
    pub name: String,
    /// Master address
    pub address: String,
}

/// Typed parameters for one master's load-balancer configuration
#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerParams {
    /// Node hostname, used as the VRRP router id
    pub node_name: String,
    /// `MASTER` on the first master, `BACKUP` elsewhere
    pub state: &'static str,
    /// VRRP priority; the first master wins
    pub priority: u8,
    /// Interface carrying the VIP
    pub interface: String,
    /// VRRP virtual router id
    pub router_id: u8,
    /// VRRP shared secret
    pub auth_pass: String,
    /// Virtual IP
    pub vip: String,
    /// Every master, in spec order
    pub backends: Vec<Backend>,
    /// Port HAProxy listens on
    pub frontend_port: u16,
    /// API server port on each master
    pub api_port: u16,
    /// Health check script path
    pub check_script: &'static str,
}

impl LoadBalancerParams {
    /// Parameters for the master at `index` (0-based, spec order)
    pub fn for_master(config: &ClusterConfig, node: &NodeSpec, index: usize, interface: &str) -> Self {
        let backends = config
            .masters()
            .map(|m| Backend {
                name: m.hostname.clone(),
                address: m.ip.clone(),
            })
            .collect();
        let interface = interface.trim();
        Self {
            node_name: node.hostname.clone(),
            state: if index == 0 { "MASTER" } else { "BACKUP" },
            priority: 100u8.saturating_sub((index as u8).saturating_mul(10)).max(1),
            interface: if interface.is_empty() {
                DEFAULT_INTERFACE.to_string()
            } else {
                interface.to_string()
            },
            router_id: router_id(&config.spec.ha.vip),
            auth_pass: config.name().chars().take(8).collect(),
            vip: config.spec.ha.vip.clone(),
            backends,
            frontend_port: HA_FRONTEND_PORT,
            api_port: API_SERVER_PORT,
            check_script: CHECK_SCRIPT_PATH,
        }
    }
}

/// VRRP router id from the VIP's last octet
pub fn router_id(vip: &str) -> u8 {
    vip.parse::<std::net::Ipv4Addr>()
        .ok()
        .map(|ip| ip.octets()[3])
        .filter(|octet| *octet > 0)
        .unwrap_or(DEFAULT_ROUTER_ID)
}

fn render(name: &str, template: &str, params: &LoadBalancerParams) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.add_template(name, template)?;
    Ok(env.get_template(name)?.render(params)?)
}

/// Rendered `haproxy.cfg`
pub fn render_haproxy(params: &LoadBalancerParams) -> Result<String> {
    render("haproxy", HAPROXY_TEMPLATE, params)
}

/// Rendered `keepalived.conf`
pub fn render_keepalived(params: &LoadBalancerParams) -> Result<String> {
    render("keepalived", KEEPALIVED_TEMPLATE, params)
}

/// Install and start keepalived and HAProxy on one master
pub async fn setup_master(
    channel: &dyn CommandChannel,
    config: &ClusterConfig,
    node: &NodeSpec,
    index: usize,
) -> Result<()> {
    channel.execute(INSTALL_SCRIPT).await?;

    let interface = channel.execute(INTERFACE_COMMAND).await?;
    let params = LoadBalancerParams::for_master(config, node, index, &interface);
    debug!(node = %node.hostname, interface = %params.interface, state = params.state, "load balancer parameters");

    channel
        .upload(render_haproxy(&params)?.as_bytes(), HAPROXY_CONFIG_PATH, 0o644)
        .await?;
    channel
        .execute(&format!("haproxy -c -q -f {HAPROXY_CONFIG_PATH}"))
        .await?;
    channel
        .upload(render_keepalived(&params)?.as_bytes(), KEEPALIVED_CONFIG_PATH, 0o600)
        .await?;
    channel
        .upload(
            render("check", CHECK_TEMPLATE, &params)?.as_bytes(),
            CHECK_SCRIPT_PATH,
            0o755,
        )
        .await?;
    channel.execute(START_SCRIPT).await?;

    info!(node = %node.hostname, state = params.state, priority = params.priority, "load balancer running");
    Ok(())
}

/// Set up every master in spec order, stopping at the first failure
pub async fn setup_all<F>(config: &ClusterConfig, channel_for: F) -> Result<()>
where
    F: Fn(&NodeSpec) -> std::sync::Arc<dyn CommandChannel>,
{
    let vip = &config.spec.ha.vip;
    info!(vip = %vip, port = HA_FRONTEND_PORT, "configuring control-plane load balancer");
    for (index, node) in config.masters().enumerate() {
        let channel = channel_for(node);
        let result = setup_master(channel.as_ref(), config, node, index).await;
        channel.close().await;
        result.map_err(|e| Error::node(&node.hostname, "load-balancer", e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::load_from_str;
    use crate::testing::{FakeFleet, Reply};

    fn config() -> ClusterConfig {
        load_from_str(
            r#"
metadata: {name: production}
spec:
  ha: {enabled: true, vip: 10.0.0.100}
  nodes:
    - {role: master, ip: 10.0.0.1, ssh: {password: pw}}
    - {role: master, ip: 10.0.0.2, ssh: {password: pw}}
    - {role: master, ip: 10.0.0.3, ssh: {password: pw}}
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_first_master_holds_the_vip() {
        let config = config();
        let masters: Vec<&NodeSpec> = config.masters().collect();

        let first = LoadBalancerParams::for_master(&config, masters[0], 0, "ens192\n");
        let third = LoadBalancerParams::for_master(&config, masters[2], 2, "");

        assert_eq!((first.state, first.priority), ("MASTER", 100));
        assert_eq!((third.state, third.priority), ("BACKUP", 80));
        assert_eq!(first.interface, "ens192");
        assert_eq!(third.interface, "eth0");
        assert_eq!(first.router_id, 100);
        assert_eq!(first.auth_pass, "producti");
    }

    #[test]
    fn test_haproxy_fronts_every_master() {
        let config = config();
        let node = config.first_master().unwrap();
        let rendered = render_haproxy(&LoadBalancerParams::for_master(&config, node, 0, "eth0")).unwrap();

        assert!(rendered.contains("bind *:8443"));
        assert!(!rendered.contains("bind *:6443"));
        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            assert!(rendered.contains(&format!("{ip}:6443 check")), "{ip} missing");
        }
    }

    #[test]
    fn test_keepalived_announces_vip() {
        let config = config();
        let node = config.first_master().unwrap();
        let rendered =
            render_keepalived(&LoadBalancerParams::for_master(&config, node, 0, "eth1")).unwrap();

        assert!(rendered.contains("state MASTER"));
        assert!(rendered.contains("interface eth1"));
        assert!(rendered.contains("virtual_router_id 100"));
        assert!(rendered.contains("        10.0.0.100\n"));
        assert!(rendered.contains(CHECK_SCRIPT_PATH));
    }

    #[test]
    fn test_router_id_falls_back_for_unusable_vip() {
        assert_eq!(router_id("192.168.1.0"), DEFAULT_ROUTER_ID);
        assert_eq!(router_id("not-an-ip"), DEFAULT_ROUTER_ID);
        assert_eq!(router_id("192.168.1.250"), 250);
    }

    #[tokio::test]
    async fn test_setup_all_configures_masters_in_order() {
        let config = config();
        let fleet = FakeFleet::new();
        fleet.on(None, "show to default", Reply::ok("ens3\n"));

        setup_all(&config, |n| fleet.channel_for(&n.ip)).await.unwrap();

        for (i, ip) in ["10.0.0.1", "10.0.0.2", "10.0.0.3"].iter().enumerate() {
            let keepalived = fleet.uploaded(ip, KEEPALIVED_CONFIG_PATH).unwrap();
            assert_eq!(keepalived.contains("state MASTER"), i == 0);
            assert!(fleet.ran(ip, "haproxy -c -q -f /etc/haproxy/haproxy.cfg"));
            assert!(fleet.ran(ip, "systemctl restart keepalived"));
        }
    }

    #[tokio::test]
    async fn test_invalid_haproxy_config_stops_before_start() {
        let config = config();
        let fleet = FakeFleet::new();
        fleet.on(Some("10.0.0.2"), "haproxy -c", Reply::fail("[ALERT] parsing error"));

        let err = setup_all(&config, |n| fleet.channel_for(&n.ip)).await.unwrap_err();

        assert!(err.to_string().contains("load-balancer"));
        assert!(!fleet.ran("10.0.0.2", "systemctl restart haproxy"));
        assert!(fleet.commands("10.0.0.3").is_empty());
    }
}
