//! Cluster description types
//!
//! Field names follow the YAML document users write (camelCase). Every section
//! has defaults so a minimal document only needs a name and a node list.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    API_SERVER_PORT, DEFAULT_IMAGE_REPOSITORY, DEFAULT_KUBERNETES_VERSION, DEFAULT_POD_SUBNET,
    DEFAULT_SERVICE_SUBNET, HA_FRONTEND_PORT,
};

/// Top-level cluster document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Document schema version
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Document kind
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Cluster identity
    pub metadata: ClusterMetadata,
    /// Desired cluster state
    pub spec: ClusterSpec,
}

/// Cluster identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMetadata {
    /// Cluster name, immutable after creation
    pub name: String,
}

/// Desired cluster state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Kubernetes version, immutable after creation
    #[serde(default = "default_version")]
    pub version: String,
    /// Registry all cluster images are pulled from
    #[serde(default = "default_image_repository")]
    pub image_repository: String,
    /// Private registry credentials
    #[serde(default, alias = "harbor")]
    pub registry: RegistrySpec,
    /// Pod and service networks, immutable after creation
    #[serde(default)]
    pub networking: NetworkingSpec,
    /// Control-plane high availability
    #[serde(default)]
    pub ha: HaSpec,
    /// Network observability
    #[serde(default)]
    pub hubble: HubbleSpec,
    /// Service load balancing
    #[serde(default)]
    pub load_balancer: LoadBalancerSpec,
    /// BGP peering for load-balancer addresses
    #[serde(default)]
    pub bgp: BgpSpec,
    /// Gateway API support in the networking plugin
    #[serde(default, rename = "gatewayAPI")]
    pub gateway_api: Toggle,
    /// Envoy proxy in the networking plugin
    #[serde(default)]
    pub envoy: Toggle,
    /// Machines making up the cluster
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
}

/// Private registry credentials
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrySpec {
    /// Registry username
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    /// Registry password
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    /// Skip TLS verification when pulling
    #[serde(default)]
    pub insecure: bool,
}

impl RegistrySpec {
    /// True when a username or password is configured
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }
}

/// Pod and service networks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkingSpec {
    /// Pod network CIDR
    #[serde(default = "default_pod_subnet")]
    pub pod_subnet: String,
    /// Service network CIDR
    #[serde(default = "default_service_subnet")]
    pub service_subnet: String,
}

impl Default for NetworkingSpec {
    fn default() -> Self {
        Self {
            pod_subnet: default_pod_subnet(),
            service_subnet: default_service_subnet(),
        }
    }
}

/// Control-plane high availability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HaSpec {
    /// Front the API servers with a virtual IP
    #[serde(default)]
    pub enabled: bool,
    /// Virtual IP, provided by the environment
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vip: String,
}

/// Simple on/off section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Toggle {
    /// Whether the feature is on
    #[serde(default)]
    pub enabled: bool,
}

/// Network observability
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubbleSpec {
    /// Enable Hubble
    #[serde(default)]
    pub enabled: bool,
    /// Export Hubble metrics
    #[serde(default)]
    pub metrics: Toggle,
    /// Hubble UI
    #[serde(default)]
    pub ui: HubbleUiSpec,
}

/// Hubble UI exposure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubbleUiSpec {
    /// Deploy the UI
    #[serde(default)]
    pub enabled: bool,
    /// NodePort for the UI service (0 = cluster-internal)
    #[serde(default)]
    pub node_port: u16,
}

/// Service load balancing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    /// Load-balancer implementation name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    /// Datapath / announcement mode
    #[serde(default)]
    pub mode: LoadBalancerMode,
}

/// Load-balancing mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerMode {
    /// Direct server return
    #[default]
    Dsr,
    /// Source NAT
    Snat,
    /// DSR for TCP, SNAT for UDP
    Hybrid,
    /// Layer-2 address announcement
    L2,
}

impl LoadBalancerMode {
    /// Datapath mode for the networking plugin; L2 announcement needs SNAT
    pub fn datapath(&self) -> &'static str {
        match self {
            Self::Dsr => "dsr",
            Self::Snat | Self::L2 => "snat",
            Self::Hybrid => "hybrid",
        }
    }
}

/// BGP peering for load-balancer addresses
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BgpSpec {
    /// Enable BGP advertisement
    #[serde(default)]
    pub enabled: bool,
    /// Local autonomous system number
    #[serde(default, rename = "localASN")]
    pub local_asn: u32,
    /// Upstream routers
    #[serde(default)]
    pub peers: Vec<BgpPeer>,
    /// Address pool entries (single IP, CIDR or `a-b` range)
    #[serde(default, rename = "loadBalancerIPs")]
    pub load_balancer_ips: Vec<String>,
}

/// One upstream router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BgpPeer {
    /// Router address
    #[serde(rename = "peerAddress")]
    pub peer_address: String,
    /// Router autonomous system number
    #[serde(rename = "peerASN")]
    pub peer_asn: u32,
}

/// Node role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    /// Control-plane node
    Master,
    /// Workload node
    Worker,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// One machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    /// Control plane or worker
    pub role: NodeRole,
    /// Address the node is reached on
    pub ip: String,
    /// Hostname, derived from the cluster name when omitted
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// Node has NVIDIA GPUs
    #[serde(default)]
    pub gpu: bool,
    /// How to reach the node
    #[serde(default)]
    pub ssh: SshSpec,
}

impl NodeSpec {
    /// True for control-plane nodes
    pub fn is_master(&self) -> bool {
        self.role == NodeRole::Master
    }
}

/// Supplied SSH credentials for a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshSpec {
    /// Login user
    #[serde(default = "default_ssh_user")]
    pub user: String,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Private key path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,
    /// Login password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for SshSpec {
    fn default() -> Self {
        Self {
            user: default_ssh_user(),
            port: default_ssh_port(),
            key_file: None,
            password: None,
        }
    }
}

impl ClusterConfig {
    /// Cluster name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Control-plane nodes in spec order
    pub fn masters(&self) -> impl Iterator<Item = &NodeSpec> {
        self.spec.nodes.iter().filter(|n| n.is_master())
    }

    /// Worker nodes in spec order
    pub fn workers(&self) -> impl Iterator<Item = &NodeSpec> {
        self.spec.nodes.iter().filter(|n| !n.is_master())
    }

    /// GPU nodes in spec order
    pub fn gpu_nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.spec.nodes.iter().filter(|n| n.gpu)
    }

    /// The node kubeadm init runs on
    pub fn first_master(&self) -> Option<&NodeSpec> {
        self.masters().next()
    }

    /// Masters that join after the first one, in spec order
    pub fn other_masters(&self) -> impl Iterator<Item = &NodeSpec> {
        self.masters().skip(1)
    }

    /// API server host: the VIP when HA is on, otherwise the first master address
    pub fn control_plane_host(&self) -> Option<&str> {
        if self.spec.ha.enabled {
            Some(self.spec.ha.vip.as_str())
        } else {
            self.first_master().map(|n| n.ip.as_str())
        }
    }

    /// Port clients reach the API on: the load balancer's frontend when HA is
    /// on, otherwise the API server itself
    pub fn control_plane_port(&self) -> u16 {
        if self.spec.ha.enabled {
            HA_FRONTEND_PORT
        } else {
            API_SERVER_PORT
        }
    }

    /// API server endpoint as `host:port`
    pub fn control_plane_endpoint(&self) -> Option<String> {
        self.control_plane_host()
            .map(|host| format!("{host}:{}", self.control_plane_port()))
    }

    /// API server certificate SANs: every master address plus the VIP
    pub fn cert_sans(&self) -> Vec<String> {
        let mut sans: Vec<String> = self.masters().map(|n| n.ip.clone()).collect();
        if self.spec.ha.enabled && !self.spec.ha.vip.is_empty() && !sans.contains(&self.spec.ha.vip)
        {
            sans.push(self.spec.ha.vip.clone());
        }
        sans
    }

    /// Registry host without scheme or path
    pub fn registry_host(&self) -> &str {
        registry_host(&self.spec.image_repository)
    }

    /// Copy with every secret cleared, suitable for persisting
    pub fn sanitized(&self) -> Self {
        let mut copy = self.clone();
        copy.spec.registry.username.clear();
        copy.spec.registry.password.clear();
        for node in &mut copy.spec.nodes {
            node.ssh.password = None;
        }
        copy
    }

    /// True when the load-balancer addon should be installed
    pub fn wants_load_balancer(&self) -> bool {
        self.spec.bgp.enabled || self.spec.load_balancer.mode == LoadBalancerMode::L2
    }
}

/// Strip scheme and path from an image repository reference
pub fn registry_host(image_repository: &str) -> &str {
    let without_scheme = image_repository
        .strip_prefix("https://")
        .or_else(|| image_repository.strip_prefix("http://"))
        .unwrap_or(image_repository);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
}

/// Strip only the scheme from an image repository reference
pub fn registry_prefix(image_repository: &str) -> &str {
    image_repository
        .strip_prefix("https://")
        .or_else(|| image_repository.strip_prefix("http://"))
        .unwrap_or(image_repository)
        .trim_end_matches('/')
}

fn default_api_version() -> String {
    "kubestrap.io/v1".to_string()
}

fn default_kind() -> String {
    "Cluster".to_string()
}

fn default_version() -> String {
    DEFAULT_KUBERNETES_VERSION.to_string()
}

fn default_image_repository() -> String {
    DEFAULT_IMAGE_REPOSITORY.to_string()
}

fn default_pod_subnet() -> String {
    DEFAULT_POD_SUBNET.to_string()
}

fn default_service_subnet() -> String {
    DEFAULT_SERVICE_SUBNET.to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}
