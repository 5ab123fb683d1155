//! Cilium networking addon
//!
//! Installed in kube-proxy replacement mode; kubeadm init skips its own
//! kube-proxy addon for that reason. Readiness means every cilium agent pod is
//! ready and no kube-proxy daemonset exists.

use serde::Serialize;
use tracing::{info, warn};

use super::{cluster_labels, Helm};
use crate::context::Timings;
use crate::kubectl::Kubectl;
use crate::poll::{poll_for, poll_until};
use crate::provision::{Artifact, ArtifactStore};
use crate::spec::{registry_prefix, ClusterConfig};
use crate::{Error, Result};

/// Helm release name
pub const RELEASE: &str = "cilium";
/// Namespace the release lives in
pub const NAMESPACE: &str = "kube-system";
/// Name of the default Gateway
pub const GATEWAY_NAME: &str = "default-gateway";

// =============================================================================
// Values
// =============================================================================

/// Helm values for the cilium chart
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CiliumValues {
    image: Image,
    operator: Operator,
    envoy: Envoy,
    kube_proxy_replacement: bool,
    k8s_service_host: String,
    k8s_service_port: u16,
    ipam: Ipam,
    load_balancer: LoadBalancer,
    bgp_control_plane: Enabled,
    hubble: Hubble,
    #[serde(rename = "gatewayAPI")]
    gateway_api: Enabled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Image {
    repository: String,
    use_digest: bool,
}

impl Image {
    fn new(prefix: &str, name: &str) -> Self {
        Self {
            repository: format!("{prefix}/cilium/{name}"),
            use_digest: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Operator {
    image: Image,
    replicas: usize,
    #[serde(rename = "clusterPoolIPv4PodCIDRList")]
    cluster_pool_ipv4_pod_cidr_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct Envoy {
    enabled: bool,
    image: Image,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Ipam {
    mode: String,
    operator: IpamOperator,
}

#[derive(Debug, Clone, Serialize)]
struct IpamOperator {
    #[serde(rename = "clusterPoolIPv4PodCIDRList")]
    cluster_pool_ipv4_pod_cidr_list: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct LoadBalancer {
    mode: String,
}

#[derive(Debug, Clone, Serialize)]
struct Enabled {
    enabled: bool,
}

#[derive(Debug, Clone, Serialize)]
struct Hubble {
    enabled: bool,
    metrics: HubbleMetrics,
    relay: Enabled,
    ui: HubbleUi,
}

#[derive(Debug, Clone, Serialize)]
struct HubbleMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    enabled: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
struct HubbleUi {
    enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    service: Option<UiService>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct UiService {
    #[serde(rename = "type")]
    type_: String,
    node_port: u16,
}

impl CiliumValues {
    /// Values for `config`
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        let host = config
            .control_plane_host()
            .ok_or_else(|| Error::validation("cluster has no control-plane node"))?;
        let prefix = registry_prefix(&config.spec.image_repository);
        let spec = &config.spec;
        let pod_cidrs = vec![spec.networking.pod_subnet.clone()];
        let hubble_ui = spec.hubble.enabled && spec.hubble.ui.enabled;

        Ok(Self {
            image: Image::new(prefix, "cilium"),
            operator: Operator {
                image: Image::new(prefix, "operator"),
                replicas: config.masters().count().min(2),
                cluster_pool_ipv4_pod_cidr_list: pod_cidrs.clone(),
            },
            envoy: Envoy {
                enabled: spec.envoy.enabled,
                image: Image::new(prefix, "cilium-envoy"),
            },
            kube_proxy_replacement: true,
            k8s_service_host: host.to_string(),
            k8s_service_port: config.control_plane_port(),
            ipam: Ipam {
                mode: "cluster-pool".to_string(),
                operator: IpamOperator {
                    cluster_pool_ipv4_pod_cidr_list: pod_cidrs,
                },
            },
            load_balancer: LoadBalancer {
                mode: spec.load_balancer.mode.datapath().to_string(),
            },
            bgp_control_plane: Enabled {
                enabled: spec.bgp.enabled,
            },
            hubble: Hubble {
                enabled: spec.hubble.enabled,
                metrics: HubbleMetrics {
                    enabled: (spec.hubble.enabled && spec.hubble.metrics.enabled).then(|| {
                        ["dns", "drop", "tcp", "flow", "icmp", "http"]
                            .into_iter()
                            .map(str::to_string)
                            .collect()
                    }),
                },
                relay: Enabled {
                    enabled: spec.hubble.enabled,
                },
                ui: HubbleUi {
                    enabled: hubble_ui,
                    service: (hubble_ui && spec.hubble.ui.node_port > 0).then(|| UiService {
                        type_: "NodePort".to_string(),
                        node_port: spec.hubble.ui.node_port,
                    }),
                },
            },
            gateway_api: Enabled {
                enabled: spec.gateway_api.enabled,
            },
        })
    }

    /// Render as a YAML values document
    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

// =============================================================================
// Gateway
// =============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Gateway {
    api_version: &'static str,
    kind: &'static str,
    metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta,
    spec: GatewaySpec,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GatewaySpec {
    gateway_class_name: &'static str,
    listeners: Vec<Listener>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Listener {
    name: &'static str,
    protocol: &'static str,
    port: u16,
    allowed_routes: AllowedRoutes,
}

#[derive(Debug, Clone, Serialize)]
struct AllowedRoutes {
    namespaces: FromNamespaces,
}

#[derive(Debug, Clone, Serialize)]
struct FromNamespaces {
    from: &'static str,
}

/// The default HTTP Gateway served by cilium
pub fn default_gateway_manifest(cluster: &str) -> Result<String> {
    let gateway = Gateway {
        api_version: "gateway.networking.k8s.io/v1",
        kind: "Gateway",
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some(GATEWAY_NAME.to_string()),
            namespace: Some("default".to_string()),
            labels: Some(cluster_labels(cluster)),
            ..Default::default()
        },
        spec: GatewaySpec {
            gateway_class_name: "cilium",
            listeners: vec![Listener {
                name: "http",
                protocol: "HTTP",
                port: 80,
                allowed_routes: AllowedRoutes {
                    namespaces: FromNamespaces { from: "All" },
                },
            }],
        },
    };
    Ok(serde_yaml::to_string(&gateway)?)
}

// =============================================================================
// Install and readiness
// =============================================================================

/// Parse `ready/desired`; ready only when both match and are nonzero
fn agents_ready(status: &str) -> bool {
    match status.trim().split_once('/') {
        Some((ready, desired)) => match (ready.parse::<u32>(), desired.parse::<u32>()) {
            (Ok(r), Ok(d)) => d > 0 && r == d,
            _ => false,
        },
        None => false,
    }
}

/// Wait until every cilium agent is ready and kube-proxy is absent
pub async fn wait_ready(kubectl: &Kubectl, timings: &Timings) -> Result<()> {
    poll_until(
        timings.network_ready_timeout,
        timings.poll_interval,
        "cilium agents ready",
        move || async move {
            let status = kubectl
                .jsonpath(
                    "daemonset/cilium",
                    Some(NAMESPACE),
                    "{.status.numberReady}/{.status.desiredNumberScheduled}",
                )
                .await?;
            if !agents_ready(&status) {
                return Ok(false);
            }
            let kube_proxy = kubectl
                .exists("daemonset/kube-proxy", Some(NAMESPACE))
                .await?;
            if kube_proxy {
                warn!("kube-proxy daemonset still present");
            }
            Ok(!kube_proxy)
        },
    )
    .await
}

/// Wait for the cilium GatewayClass, apply the default Gateway and wait for its
/// address; returns the address
pub async fn deploy_default_gateway(
    kubectl: &Kubectl,
    config: &ClusterConfig,
    timings: &Timings,
) -> Result<String> {
    poll_until(
        timings.gateway_timeout,
        timings.poll_interval,
        "gatewayclass cilium accepted",
        move || async move {
            let status = kubectl
                .jsonpath(
                    "gatewayclass/cilium",
                    None,
                    "{.status.conditions[?(@.type==\"Accepted\")].status}",
                )
                .await?;
            Ok(status == "True")
        },
    )
    .await?;

    kubectl
        .apply(&default_gateway_manifest(config.name())?)
        .await?;

    poll_for(
        timings.gateway_timeout,
        timings.poll_interval,
        "default gateway address",
        move || async move {
            let address = kubectl
                .jsonpath(
                    &format!("gateway/{GATEWAY_NAME}"),
                    Some("default"),
                    "{.status.addresses[0].value}",
                )
                .await?;
            Ok((!address.is_empty()).then_some(address))
        },
    )
    .await
}

/// Install or upgrade cilium and wait for it to become ready.
///
/// A Gateway that never obtains an address only warns: the cluster is usable
/// without it.
pub async fn install(
    kubectl: &Kubectl,
    config: &ClusterConfig,
    artifacts: &dyn ArtifactStore,
    timings: &Timings,
) -> Result<()> {
    let helm = Helm::for_kubectl(kubectl);
    helm.ensure_installed(artifacts).await?;
    let chart = helm.stage_chart(artifacts, Artifact::CiliumChart).await?;

    let values = CiliumValues::from_config(config)?.to_yaml()?;
    info!(
        bgp = config.spec.bgp.enabled,
        gateway = config.spec.gateway_api.enabled,
        "installing cilium"
    );
    helm.upgrade_install(RELEASE, &chart, NAMESPACE, &values)
        .await?;

    wait_ready(kubectl, timings).await?;
    info!("cilium ready, kube-proxy replaced");

    if config.spec.gateway_api.enabled {
        match deploy_default_gateway(kubectl, config, timings).await {
            Ok(address) => info!(%address, "default gateway ready"),
            Err(e) => warn!(error = %e, "default gateway not ready, continuing"),
        }
    }
    Ok(())
}
