//! Cluster spec validation
//!
//! Runs before any remote action. Every problem found is collected so the user
//! can fix the whole document in one pass.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use cidr::IpCidr;

use super::types::{ClusterConfig, LoadBalancerMode, NodeSpec};
use crate::{Error, Result};

/// Validate a loaded spec (hostnames must already be derived)
pub fn validate(config: &ClusterConfig) -> Result<()> {
    let mut problems = Vec::new();

    validate_metadata(config, &mut problems);
    validate_networking(config, &mut problems);
    validate_nodes(config, &mut problems);
    validate_ha(config, &mut problems);
    validate_load_balancer(config, &mut problems);

    if problems.is_empty() {
        Ok(())
    } else {
        Err(Error::validation(problems.join("; ")))
    }
}

fn validate_metadata(config: &ClusterConfig, problems: &mut Vec<String>) {
    let name = config.name();
    if name.is_empty() {
        problems.push("metadata.name is required".to_string());
    } else if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        problems.push(format!(
            "metadata.name '{name}' may only contain lowercase letters, digits and '-'"
        ));
    }

    if !is_semver_tag(&config.spec.version) {
        problems.push(format!(
            "spec.version '{}' must look like v1.34.2",
            config.spec.version
        ));
    }

    if config.spec.image_repository.trim().is_empty() {
        problems.push("spec.imageRepository is required".to_string());
    }
}

fn is_semver_tag(version: &str) -> bool {
    let Some(rest) = version.strip_prefix('v') else {
        return false;
    };
    let parts: Vec<&str> = rest.split('.').collect();
    parts.len() == 3
        && parts
            .iter()
            .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

fn validate_networking(config: &ClusterConfig, problems: &mut Vec<String>) {
    let pod = parse_cidr("spec.networking.podSubnet", &config.spec.networking.pod_subnet, problems);
    let svc = parse_cidr(
        "spec.networking.serviceSubnet",
        &config.spec.networking.service_subnet,
        problems,
    );

    if let (Some(pod), Some(svc)) = (pod, svc) {
        if cidrs_overlap(&pod, &svc) {
            problems.push(format!(
                "podSubnet {pod} overlaps serviceSubnet {svc}"
            ));
        }
    }
}

fn parse_cidr(field: &str, value: &str, problems: &mut Vec<String>) -> Option<IpCidr> {
    match IpCidr::from_str(value) {
        Ok(c) => Some(c),
        Err(e) => {
            problems.push(format!("{field} '{value}' is not a valid CIDR: {e}"));
            None
        }
    }
}

/// True when two networks share any address
pub fn cidrs_overlap(a: &IpCidr, b: &IpCidr) -> bool {
    a.contains(&b.first_address()) || b.contains(&a.first_address())
}

fn validate_nodes(config: &ClusterConfig, problems: &mut Vec<String>) {
    let nodes = &config.spec.nodes;
    if nodes.is_empty() {
        problems.push("spec.nodes must list at least one node".to_string());
        return;
    }

    let mut ips = HashSet::new();
    let mut hostnames = HashSet::new();

    for (i, node) in nodes.iter().enumerate() {
        let label = format!("nodes[{i}]");
        validate_node(&label, node, problems);

        if !ips.insert(node.ip.as_str()) {
            problems.push(format!("{label}: duplicate ip {}", node.ip));
        }
        if !node.hostname.is_empty() && !hostnames.insert(node.hostname.as_str()) {
            problems.push(format!("{label}: duplicate hostname {}", node.hostname));
        }
    }

    if config.masters().next().is_none() {
        problems.push("at least one master node is required".to_string());
    }
}

fn validate_node(label: &str, node: &NodeSpec, problems: &mut Vec<String>) {
    if node.ip.parse::<IpAddr>().is_err() {
        problems.push(format!("{label}: '{}' is not a valid IP address", node.ip));
    }

    if node.hostname.is_empty() {
        problems.push(format!("{label}: hostname could not be derived"));
    } else if !is_dns_label(&node.hostname) {
        problems.push(format!(
            "{label}: hostname '{}' is not a valid DNS label",
            node.hostname
        ));
    }

    if node.ssh.user.trim().is_empty() {
        problems.push(format!("{label}: ssh.user is required"));
    }
    if node.ssh.port == 0 {
        problems.push(format!("{label}: ssh.port must be between 1 and 65535"));
    }
    if node.ssh.key_file.is_none() && node.ssh.password.as_deref().unwrap_or("").is_empty() {
        problems.push(format!("{label}: ssh.keyFile or ssh.password is required"));
    }

    if node.is_master() && node.gpu {
        problems.push(format!("{label}: master nodes cannot be GPU nodes"));
    }
}

fn is_dns_label(name: &str) -> bool {
    name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

fn validate_ha(config: &ClusterConfig, problems: &mut Vec<String>) {
    if !config.spec.ha.enabled {
        return;
    }

    let masters = config.masters().count();
    if masters < 3 {
        problems.push(format!(
            "HA requires at least 3 master nodes, found {masters}"
        ));
    }

    if config.spec.ha.vip.parse::<IpAddr>().is_err() {
        problems.push(format!(
            "spec.ha.vip '{}' is not a valid IP address",
            config.spec.ha.vip
        ));
    }
}

fn validate_load_balancer(config: &ClusterConfig, problems: &mut Vec<String>) {
    let bgp = &config.spec.bgp;

    if bgp.enabled {
        if !(1..=65535).contains(&bgp.local_asn) {
            problems.push(format!(
                "spec.bgp.localASN {} must be between 1 and 65535",
                bgp.local_asn
            ));
        }
        if bgp.peers.is_empty() {
            problems.push("spec.bgp.peers must list at least one peer".to_string());
        }
        for (i, peer) in bgp.peers.iter().enumerate() {
            if peer.peer_address.parse::<IpAddr>().is_err() {
                problems.push(format!(
                    "spec.bgp.peers[{i}].peerAddress '{}' is not a valid IP address",
                    peer.peer_address
                ));
            }
            if !(1..=65535).contains(&peer.peer_asn) {
                problems.push(format!(
                    "spec.bgp.peers[{i}].peerASN {} must be between 1 and 65535",
                    peer.peer_asn
                ));
            }
        }
    }

    let needs_pool = bgp.enabled || config.spec.load_balancer.mode == LoadBalancerMode::L2;
    if needs_pool && bgp.load_balancer_ips.is_empty() {
        problems.push("spec.bgp.loadBalancerIPs must list at least one entry".to_string());
    }
    for (i, entry) in bgp.load_balancer_ips.iter().enumerate() {
        if let Err(reason) = check_pool_entry(entry) {
            problems.push(format!("spec.bgp.loadBalancerIPs[{i}] '{entry}': {reason}"));
        }
    }
}

/// Accept a single IP, a CIDR, or an IPv4 range `a-b` with a <= b
pub fn check_pool_entry(entry: &str) -> std::result::Result<(), String> {
    if let Some((start, end)) = entry.split_once('-') {
        let start: Ipv4Addr = start
            .trim()
            .parse()
            .map_err(|_| "range start is not an IPv4 address".to_string())?;
        let end: Ipv4Addr = end
            .trim()
            .parse()
            .map_err(|_| "range end is not an IPv4 address".to_string())?;
        if u32::from(start) > u32::from(end) {
            return Err("range start is after range end".to_string());
        }
        return Ok(());
    }

    if entry.contains('/') {
        return IpCidr::from_str(entry)
            .map(|_| ())
            .map_err(|e| format!("invalid CIDR: {e}"));
    }

    entry
        .parse::<IpAddr>()
        .map(|_| ())
        .map_err(|_| "not an IP address, CIDR or range".to_string())
}
