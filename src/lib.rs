//! Kubestrap - bootstrap and reconcile multi-master Kubernetes clusters on bare machines
//!
//! Kubestrap turns a declarative cluster description into a running cluster by driving
//! kubeadm, helm and kubectl over SSH, and later reconciles the live cluster against a
//! revised description.
//!
//! # Architecture
//!
//! - The bootstrap sequencer provisions every node concurrently, initializes the first
//!   control-plane node, joins the remaining masters one at a time, installs networking
//!   and load-balancing addons, joins workers concurrently and persists the applied spec
//!   inside the cluster itself.
//! - The reconciler loads that persisted spec, rejects changes to immutable fields and
//!   applies the supported delta.
//!
//! # Modules
//!
//! - [`spec`] - Cluster description types, loading, hostname derivation and validation
//! - [`channel`] - Command channels (local and SSH) with reconnect and credential fallback
//! - [`kubectl`] - Cluster API client running kubectl over a channel
//! - [`kubeadm`] - kubeadm configuration, commands and join credentials
//! - [`provision`] - Concurrent node provisioning pipeline
//! - [`addons`] - Cilium networking and MetalLB load-balancing addons
//! - [`bootstrap`] - Bootstrap sequencer state machine
//! - [`state`] - Cluster-resident persisted state
//! - [`reconcile`] - Diff, immutability enforcement and apply
//! - [`confirm`] - Interactive confirmation gates
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod addons;
pub mod bootstrap;
pub mod channel;
pub mod confirm;
pub mod context;
pub mod error;
pub mod kubeadm;
pub mod kubectl;
pub mod poll;
pub mod provision;
pub mod reconcile;
pub mod retry;
pub mod spec;
pub mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Kubernetes version used when the spec omits one
pub const DEFAULT_KUBERNETES_VERSION: &str = "v1.34.2";

/// Image registry used when the spec omits one
pub const DEFAULT_IMAGE_REPOSITORY: &str = "registry.k8s.io";

/// Default pod network CIDR
pub const DEFAULT_POD_SUBNET: &str = "10.244.0.0/16";

/// Default service network CIDR
pub const DEFAULT_SERVICE_SUBNET: &str = "10.96.0.0/12";

/// Kubernetes API server port
pub const API_SERVER_PORT: u16 = 6443;

/// HAProxy frontend port behind the VIP of an HA cluster
pub const HA_FRONTEND_PORT: u16 = 8443;

/// containerd CRI socket passed to every kubeadm invocation
pub const CRI_SOCKET: &str = "unix:///var/run/containerd/containerd.sock";

/// Version string recorded on nodes and persisted state
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Cluster-Resident Markers
// =============================================================================

/// Label applied to every node of a cluster this tool created
pub const MANAGED_LABEL: &str = "kubestrap.io/managed";

/// Label carrying the tool version on nodes and state records
pub const VERSION_LABEL: &str = "kubestrap.io/version";

/// Label carrying the cluster name on resources this tool creates
pub const CLUSTER_LABEL: &str = "kubestrap.io/cluster";

/// Namespace holding the persisted state records
pub const STATE_NAMESPACE: &str = "kube-system";

/// Path of the admin kubeconfig on control-plane nodes
pub const ADMIN_KUBECONFIG: &str = "/etc/kubernetes/admin.conf";

/// Path of the kubelet kubeconfig on any node that has joined a cluster
pub const KUBELET_KUBECONFIG: &str = "/etc/kubernetes/kubelet.conf";
