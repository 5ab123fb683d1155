//! MetalLB load-balancer addon
//!
//! Installed only when BGP or L2 announcement is requested. The configuration
//! resources always start with the address pool, followed by either BGP peers
//! plus a BGP advertisement or a single L2 advertisement. Every resource carries
//! the cluster label so stale ones can be found and pruned.

use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::Serialize;
use tracing::{debug, info};

use super::{cluster_labels, cluster_selector, Helm};
use crate::context::Timings;
use crate::kubectl::Kubectl;
use crate::provision::{Artifact, ArtifactStore};
use crate::retry::retry_with_backoff;
use crate::spec::{registry_prefix, ClusterConfig, LoadBalancerMode};
use crate::{Error, Result};

/// Helm release name
pub const RELEASE: &str = "metallb";
/// Namespace the release and its resources live in
pub const NAMESPACE: &str = "metallb-system";

const ROLLOUT_TIMEOUT_SECS: u64 = 180;

const PEER_KIND: &str = "bgppeers.metallb.io";
const BGP_ADVERTISEMENT_KIND: &str = "bgpadvertisements.metallb.io";
const L2_ADVERTISEMENT_KIND: &str = "l2advertisements.metallb.io";

// =============================================================================
// Resources
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Resource<S> {
    api_version: &'static str,
    kind: &'static str,
    metadata: ObjectMeta,
    spec: S,
}

#[derive(Debug, Clone, Serialize)]
struct PoolSpec {
    addresses: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct PeerSpec {
    #[serde(rename = "myASN")]
    my_asn: u32,
    #[serde(rename = "peerASN")]
    peer_asn: u32,
    peer_address: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct AdvertisementSpec {
    ip_address_pools: Vec<String>,
}

fn metadata(cluster: &str, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: Some(NAMESPACE.to_string()),
        labels: Some(cluster_labels(cluster)),
        ..Default::default()
    }
}

/// Name of the cluster's address pool
pub fn pool_name(cluster: &str) -> String {
    format!("{cluster}-ip-pool")
}

/// Name of the `index`th BGP peer
pub fn peer_name(cluster: &str, index: usize) -> String {
    format!("{cluster}-peer-{index}")
}

fn bgp_advertisement_name(cluster: &str) -> String {
    format!("{cluster}-bgp-adv")
}

fn l2_advertisement_name(cluster: &str) -> String {
    format!("{cluster}-l2-adv")
}

/// Multi-document manifest of every configuration resource `config` wants,
/// address pool first
pub fn desired_manifest(config: &ClusterConfig) -> Result<String> {
    let cluster = config.name();
    let bgp = &config.spec.bgp;
    if bgp.load_balancer_ips.is_empty() {
        return Err(Error::validation(
            "load balancer needs at least one entry in bgp.loadBalancerIPs",
        ));
    }

    let mut docs = vec![serde_yaml::to_string(&Resource {
        api_version: "metallb.io/v1beta1",
        kind: "IPAddressPool",
        metadata: metadata(cluster, pool_name(cluster)),
        spec: PoolSpec {
            addresses: bgp.load_balancer_ips.clone(),
        },
    })?];

    let advertisement = AdvertisementSpec {
        ip_address_pools: vec![pool_name(cluster)],
    };
    if bgp.enabled {
        for (index, peer) in bgp.peers.iter().enumerate() {
            docs.push(serde_yaml::to_string(&Resource {
                api_version: "metallb.io/v1beta2",
                kind: "BGPPeer",
                metadata: metadata(cluster, peer_name(cluster, index)),
                spec: PeerSpec {
                    my_asn: bgp.local_asn,
                    peer_asn: peer.peer_asn,
                    peer_address: peer.peer_address.clone(),
                },
            })?);
        }
        docs.push(serde_yaml::to_string(&Resource {
            api_version: "metallb.io/v1beta1",
            kind: "BGPAdvertisement",
            metadata: metadata(cluster, bgp_advertisement_name(cluster)),
            spec: advertisement,
        })?);
    } else {
        docs.push(serde_yaml::to_string(&Resource {
            api_version: "metallb.io/v1beta1",
            kind: "L2Advertisement",
            metadata: metadata(cluster, l2_advertisement_name(cluster)),
            spec: advertisement,
        })?);
    }

    Ok(docs.join("---\n"))
}

// =============================================================================
// Helm values
// =============================================================================

#[derive(Debug, Clone, Serialize)]
struct MetallbValues {
    controller: Component,
    speaker: Component,
}

#[derive(Debug, Clone, Serialize)]
struct Component {
    image: ImageRef,
}

#[derive(Debug, Clone, Serialize)]
struct ImageRef {
    repository: String,
}

fn values_yaml(config: &ClusterConfig) -> Result<String> {
    let prefix = registry_prefix(&config.spec.image_repository);
    let component = |name: &str| Component {
        image: ImageRef {
            repository: format!("{prefix}/metallb/{name}"),
        },
    };
    Ok(serde_yaml::to_string(&MetallbValues {
        controller: component("controller"),
        speaker: component("speaker"),
    })?)
}

// =============================================================================
// Operations
// =============================================================================

/// Install MetalLB, wait for it and apply the configuration resources
pub async fn install(
    kubectl: &Kubectl,
    config: &ClusterConfig,
    artifacts: &dyn ArtifactStore,
    timings: &Timings,
) -> Result<()> {
    let helm = Helm::for_kubectl(kubectl);
    helm.ensure_installed(artifacts).await?;
    let chart = helm.stage_chart(artifacts, Artifact::MetallbChart).await?;

    info!(
        bgp = config.spec.bgp.enabled,
        l2 = config.spec.load_balancer.mode == LoadBalancerMode::L2,
        "installing metallb"
    );
    helm.upgrade_install(RELEASE, &chart, NAMESPACE, &values_yaml(config)?)
        .await?;

    kubectl
        .rollout_status("deployment/metallb-controller", NAMESPACE, ROLLOUT_TIMEOUT_SECS)
        .await?;
    kubectl
        .rollout_status("daemonset/metallb-speaker", NAMESPACE, ROLLOUT_TIMEOUT_SECS)
        .await?;

    configure(kubectl, config, timings).await
}

/// Apply the configuration resources, then prune ones no longer wanted.
///
/// Applying is retried: the validating webhook can lag behind the rollout.
pub async fn configure(kubectl: &Kubectl, config: &ClusterConfig, timings: &Timings) -> Result<()> {
    let manifest = desired_manifest(config)?;
    retry_with_backoff(&timings.apply_retry, "apply metallb configuration", || {
        kubectl.apply(&manifest)
    })
    .await?;
    prune(kubectl, config).await
}

/// Delete this cluster's labelled resources that `config` no longer describes
pub async fn prune(kubectl: &Kubectl, config: &ClusterConfig) -> Result<()> {
    let cluster = config.name();
    let selector = cluster_selector(cluster);

    let keep: BTreeSet<String> = if config.spec.bgp.enabled {
        (0..config.spec.bgp.peers.len())
            .map(|i| format!("bgppeer.metallb.io/{}", peer_name(cluster, i)))
            .collect()
    } else {
        BTreeSet::new()
    };
    for name in kubectl
        .list_names(PEER_KIND, Some(NAMESPACE), &selector)
        .await?
    {
        if !keep.contains(&name) {
            debug!(resource = %name, "pruning bgp peer");
            kubectl.delete(&name, Some(NAMESPACE)).await?;
        }
    }

    let inactive = if config.spec.bgp.enabled {
        L2_ADVERTISEMENT_KIND
    } else {
        BGP_ADVERTISEMENT_KIND
    };
    for name in kubectl
        .list_names(inactive, Some(NAMESPACE), &selector)
        .await?
    {
        debug!(resource = %name, "pruning inactive advertisement");
        kubectl.delete(&name, Some(NAMESPACE)).await?;
    }
    Ok(())
}

/// Remove this cluster's BGP peers and advertisements
pub async fn remove_bgp(kubectl: &Kubectl, cluster: &str) -> Result<()> {
    let selector = cluster_selector(cluster);
    for kind in [PEER_KIND, BGP_ADVERTISEMENT_KIND] {
        for name in kubectl.list_names(kind, Some(NAMESPACE), &selector).await? {
            kubectl.delete(&name, Some(NAMESPACE)).await?;
        }
    }
    info!(cluster, "bgp resources removed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::load_from_str;
    use crate::testing::{FakeArtifacts, FakeFleet, Reply};
    use serde::Deserialize;

    const BGP: &str = r#"
  bgp:
    enabled: true
    localASN: 64512
    peers:
      - {peerAddress: 10.0.0.254, peerASN: 64513}
      - {peerAddress: 10.0.0.253, peerASN: 64513}
    loadBalancerIPs: [10.0.6.0/24]"#;

    const L2: &str = r#"
  loadBalancer: {mode: l2}
  bgp:
    loadBalancerIPs: [10.0.6.10-10.0.6.20]"#;

    fn config(extra: &str) -> ClusterConfig {
        load_from_str(&format!(
            r#"
metadata: {{name: demo}}
spec:{extra}
  nodes:
    - {{role: master, ip: 10.0.0.1, ssh: {{password: pw}}}}
"#
        ))
        .unwrap()
    }

    fn documents(manifest: &str) -> Vec<serde_yaml::Value> {
        serde_yaml::Deserializer::from_str(manifest)
            .map(|d| serde_yaml::Value::deserialize(d).unwrap())
            .collect()
    }

    #[test]
    fn test_bgp_manifest_starts_with_pool() {
        let docs = documents(&desired_manifest(&config(BGP)).unwrap());
        let kinds: Vec<&str> = docs.iter().map(|d| d["kind"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["IPAddressPool", "BGPPeer", "BGPPeer", "BGPAdvertisement"]);

        assert_eq!(docs[1]["apiVersion"], "metallb.io/v1beta2");
        assert_eq!(docs[1]["metadata"]["name"], "demo-peer-0");
        assert_eq!(docs[1]["spec"]["myASN"], 64512);
        assert_eq!(docs[1]["spec"]["peerAddress"], "10.0.0.254");
        assert_eq!(docs[1]["metadata"]["labels"]["kubestrap.io/cluster"], "demo");
        assert_eq!(docs[3]["spec"]["ipAddressPools"][0], "demo-ip-pool");
    }

    #[test]
    fn test_l2_manifest() {
        let docs = documents(&desired_manifest(&config(L2)).unwrap());
        let kinds: Vec<&str> = docs.iter().map(|d| d["kind"].as_str().unwrap()).collect();
        assert_eq!(kinds, vec!["IPAddressPool", "L2Advertisement"]);
        assert_eq!(docs[0]["spec"]["addresses"][0], "10.0.6.10-10.0.6.20");
    }

    #[tokio::test]
    async fn test_install_waits_for_rollout_then_configures() {
        let config = config(BGP);
        let fleet = FakeFleet::new();
        let kubectl = Kubectl::on_control_plane(fleet.channel_for("10.0.0.1"));

        install(&kubectl, &config, &FakeArtifacts, &Timings::immediate())
            .await
            .unwrap();

        let commands = fleet.commands("10.0.0.1");
        let position = |needle: &str| commands.iter().position(|c| c.contains(needle)).unwrap();
        assert!(position("upgrade --install metallb") < position("rollout status deployment/metallb-controller"));
        assert!(position("rollout status daemonset/metallb-speaker") < position(" apply -f "));
        assert!(fleet.applied("10.0.0.1")[0].contains("kind: IPAddressPool"));
    }

    #[tokio::test]
    async fn test_apply_is_retried_while_webhook_starts() {
        let config = config(L2);
        let fleet = FakeFleet::new();
        fleet.on(
            None,
            "apply -f /tmp/kubestrap-manifest-",
            Reply::fail("failed calling webhook \"ipaddresspoolvalidationwebhook.metallb.io\""),
        );
        let kubectl = Kubectl::on_control_plane(fleet.channel_for("10.0.0.1"));

        let err = configure(&kubectl, &config, &Timings::immediate())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("webhook"));
        assert_eq!(fleet.count("apply -f /tmp/kubestrap-manifest-"), Timings::immediate().apply_retry.max_attempts as usize);
    }

    #[tokio::test]
    async fn test_prune_removes_surplus_peers_and_l2() {
        let mut config = config(BGP);
        config.spec.bgp.peers.truncate(1);
        let fleet = FakeFleet::new();
        fleet.on(
            None,
            "get bgppeers.metallb.io",
            Reply::ok("bgppeer.metallb.io/demo-peer-0\nbgppeer.metallb.io/demo-peer-1\n"),
        );
        fleet.on(
            None,
            "get l2advertisements.metallb.io",
            Reply::ok("l2advertisement.metallb.io/demo-l2-adv\n"),
        );
        let kubectl = Kubectl::on_control_plane(fleet.channel_for("10.0.0.1"));

        prune(&kubectl, &config).await.unwrap();

        assert!(fleet.ran("10.0.0.1", "delete bgppeer.metallb.io/demo-peer-1"));
        assert!(!fleet.ran("10.0.0.1", "delete bgppeer.metallb.io/demo-peer-0"));
        assert!(fleet.ran("10.0.0.1", "delete l2advertisement.metallb.io/demo-l2-adv"));
    }

    #[test]
    fn test_empty_pool_is_rejected() {
        let mut config = config(BGP);
        config.spec.bgp.load_balancer_ips.clear();
        assert!(matches!(desired_manifest(&config), Err(Error::Validation(_))));
    }
}
