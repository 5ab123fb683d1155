//! Structural comparison of a persisted spec against a desired one

use std::fmt;

use crate::spec::ClusterConfig;
use crate::{Error, Result};

/// Category of a detected change; apply routines are registered per kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChangeKind {
    /// BGP peering or load-balancer address pool
    Bgp,
    /// Registry credentials
    Registry,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeKind::Bgp => write!(f, "BGP"),
            ChangeKind::Registry => write!(f, "Registry"),
        }
    }
}

/// One detected difference between two specs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigChange {
    /// Category used for dispatch
    pub kind: ChangeKind,
    /// Human readable summary
    pub description: String,
    /// Previous value, when meaningful
    pub old: Option<String>,
    /// New value, when meaningful
    pub new: Option<String>,
    /// Component the change affects
    pub component: &'static str,
    /// The component restarts to pick the change up
    pub requires_restart: bool,
}

impl ConfigChange {
    fn new(kind: ChangeKind, description: impl Into<String>, component: &'static str) -> Self {
        Self {
            kind,
            description: description.into(),
            old: None,
            new: None,
            component,
            requires_restart: false,
        }
    }

    fn values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old = old;
        self.new = new;
        self
    }

    fn restarting(mut self) -> Self {
        self.requires_restart = true;
        self
    }
}

/// A frozen field whose value differs between two specs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmutableViolation {
    /// Dotted path of the field
    pub field: &'static str,
    /// Persisted value
    pub old: String,
    /// Requested value
    pub new: String,
}

impl fmt::Display for ImmutableViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} -> {})", self.field, self.old, self.new)
    }
}

/// Every frozen field that differs, in a fixed order
pub fn immutable_violations(old: &ClusterConfig, new: &ClusterConfig) -> Vec<ImmutableViolation> {
    let frozen: [(&'static str, &str, &str); 4] = [
        ("metadata.name", old.metadata.name.as_str(), new.metadata.name.as_str()),
        (
            "spec.networking.podSubnet",
            old.spec.networking.pod_subnet.as_str(),
            new.spec.networking.pod_subnet.as_str(),
        ),
        (
            "spec.networking.serviceSubnet",
            old.spec.networking.service_subnet.as_str(),
            new.spec.networking.service_subnet.as_str(),
        ),
        ("spec.version", old.spec.version.as_str(), new.spec.version.as_str()),
    ];

    frozen
        .into_iter()
        .filter(|(_, o, n)| o != n)
        .map(|(field, o, n)| ImmutableViolation {
            field,
            old: o.to_string(),
            new: n.to_string(),
        })
        .collect()
}

/// Fail with one aggregated error when any frozen field changed
pub fn check_immutable(old: &ClusterConfig, new: &ClusterConfig) -> Result<()> {
    let violations = immutable_violations(old, new);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(Error::ImmutableFields(violations))
    }
}

fn bgp_enable_changes(new: &ClusterConfig, previously: &str) -> Vec<ConfigChange> {
    let bgp = &new.spec.bgp;
    let mut changes = vec![
        ConfigChange::new(ChangeKind::Bgp, "enable BGP", "MetalLB")
            .values(Some(previously.to_string()), Some("enabled".to_string()))
            .restarting(),
        ConfigChange::new(
            ChangeKind::Bgp,
            format!("set local ASN {}", bgp.local_asn),
            "BGP peering",
        )
        .values(None, Some(bgp.local_asn.to_string())),
    ];
    changes.extend(bgp.peers.iter().enumerate().map(|(i, peer)| {
        ConfigChange::new(
            ChangeKind::Bgp,
            format!(
                "add BGP peer {}: {} (AS {})",
                i + 1,
                peer.peer_address,
                peer.peer_asn
            ),
            "BGP peering",
        )
        .values(None, Some(format!("{}/{}", peer.peer_address, peer.peer_asn)))
    }));
    changes.extend(bgp.load_balancer_ips.iter().enumerate().map(|(i, entry)| {
        ConfigChange::new(
            ChangeKind::Bgp,
            format!("add load balancer pool entry {}: {entry}", i + 1),
            "IP pool",
        )
        .values(None, Some(entry.clone()))
    }));
    changes
}

/// BGP changes between `old` (if any) and `new`.
///
/// Only toggles, ASN changes and list *length* changes are detected; editing an
/// entry in place without changing the list length is not reported.
pub fn bgp_changes(old: Option<&ClusterConfig>, new: &ClusterConfig) -> Vec<ConfigChange> {
    let Some(old) = old else {
        return if new.spec.bgp.enabled {
            bgp_enable_changes(new, "not recorded")
        } else {
            Vec::new()
        };
    };

    let (was, is) = (&old.spec.bgp, &new.spec.bgp);
    match (was.enabled, is.enabled) {
        (false, true) => bgp_enable_changes(new, "disabled"),
        (true, false) => vec![ConfigChange::new(ChangeKind::Bgp, "disable BGP", "MetalLB")
            .values(Some("enabled".to_string()), Some("disabled".to_string()))],
        (false, false) => Vec::new(),
        (true, true) => {
            let mut changes = Vec::new();
            if was.local_asn != is.local_asn {
                changes.push(
                    ConfigChange::new(ChangeKind::Bgp, "change local ASN", "BGP peering")
                        .values(Some(was.local_asn.to_string()), Some(is.local_asn.to_string())),
                );
            }
            if was.peers.len() != is.peers.len() {
                changes.push(
                    ConfigChange::new(ChangeKind::Bgp, "update BGP peers", "BGP peering").values(
                        Some(format!("{} peers", was.peers.len())),
                        Some(format!("{} peers", is.peers.len())),
                    ),
                );
            }
            if was.load_balancer_ips.len() != is.load_balancer_ips.len() {
                changes.push(
                    ConfigChange::new(ChangeKind::Bgp, "update load balancer pool", "IP pool")
                        .values(
                            Some(format!("{} entries", was.load_balancer_ips.len())),
                            Some(format!("{} entries", is.load_balancer_ips.len())),
                        ),
                );
            }
            changes
        }
    }
}

/// Every supported change between `old` (if any) and `new`.
///
/// Without a persisted record only BGP enablement can be inferred.
pub fn diff(old: Option<&ClusterConfig>, new: &ClusterConfig) -> Vec<ConfigChange> {
    let mut changes = bgp_changes(old, new);
    if let Some(old) = old {
        let (was, is) = (&old.spec.registry, &new.spec.registry);
        if was.username != is.username || was.password != is.password {
            changes.push(ConfigChange::new(
                ChangeKind::Registry,
                "update registry credentials",
                "containerd",
            ));
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{load_from_str, BgpPeer};

    fn base() -> ClusterConfig {
        load_from_str(
            r#"
metadata: {name: demo}
spec:
  bgp:
    enabled: true
    localASN: 64512
    peers:
      - {peerAddress: 10.0.0.254, peerASN: 64513}
    loadBalancerIPs: [10.0.0.200-10.0.0.220]
  nodes:
    - {role: master, ip: 10.0.0.1, ssh: {password: pw}}
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_peer_count_change_is_one_change() {
        let old = base();
        let mut new = base();
        new.spec.bgp.peers.push(BgpPeer {
            peer_address: "10.0.0.253".to_string(),
            peer_asn: 64514,
        });

        let changes = diff(Some(&old), &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Bgp);
        assert_eq!(changes[0].old.as_deref(), Some("1 peers"));
        assert_eq!(changes[0].new.as_deref(), Some("2 peers"));
        assert!(immutable_violations(&old, &new).is_empty());
    }

    #[test]
    fn test_in_place_peer_edit_is_not_detected() {
        let old = base();
        let mut new = base();
        new.spec.bgp.peers[0].peer_address = "10.0.0.250".to_string();
        assert!(diff(Some(&old), &new).is_empty());
    }

    #[test]
    fn test_pod_cidr_change_is_one_violation() {
        let old = base();
        let mut new = base();
        new.spec.networking.pod_subnet = "10.200.0.0/16".to_string();

        let violations = immutable_violations(&old, &new);
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].field, "spec.networking.podSubnet");
        assert!(matches!(check_immutable(&old, &new), Err(Error::ImmutableFields(v)) if v.len() == 1));
    }

    #[test]
    fn test_all_frozen_fields_reported_together() {
        let old = base();
        let mut new = base();
        new.metadata.name = "other".to_string();
        new.spec.version = "v1.35.0".to_string();
        new.spec.networking.service_subnet = "10.100.0.0/16".to_string();

        let err = check_immutable(&old, &new).unwrap_err().to_string();
        assert!(err.contains("metadata.name (demo -> other)"));
        assert!(err.contains("spec.networking.serviceSubnet"));
        assert!(err.contains("spec.version (v1.34.2 -> v1.35.0)"));
    }

    #[test]
    fn test_enable_enumerates_peers_and_pool() {
        let mut old = base();
        old.spec.bgp.enabled = false;
        let changes = bgp_changes(Some(&old), &base());

        // toggle, ASN, one peer, one pool entry
        assert_eq!(changes.len(), 4);
        assert!(changes[0].requires_restart);
        assert_eq!(changes[2].new.as_deref(), Some("10.0.0.254/64513"));
    }

    #[test]
    fn test_disable_is_a_toggle_change() {
        let mut new = base();
        new.spec.bgp.enabled = false;
        let changes = diff(Some(&base()), &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].description, "disable BGP");
    }

    #[test]
    fn test_missing_record_reports_only_bgp_enable() {
        let mut new = base();
        new.spec.registry.username = "admin".to_string();
        let changes = diff(None, &new);
        assert!(changes.iter().all(|c| c.kind == ChangeKind::Bgp));
        assert_eq!(changes[0].old.as_deref(), Some("not recorded"));

        new.spec.bgp.enabled = false;
        assert!(diff(None, &new).is_empty());
    }

    #[test]
    fn test_registry_credentials_change() {
        let mut new = base();
        new.spec.registry.password = "rotated".to_string();
        let changes = diff(Some(&base()), &new);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Registry);
        assert_eq!(changes[0].old, None);
    }
}
