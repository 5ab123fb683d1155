//! Cluster API client running `kubectl` over a command channel
//!
//! On control-plane nodes kubectl is pointed at the admin kubeconfig; locally it
//! uses whatever kubeconfig the operator passed (or the ambient one).

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::NodeStatus;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::{shell_quote, CommandChannel};
use crate::{Result, ADMIN_KUBECONFIG};

/// Prefix of the scratch files manifests are staged in before `kubectl apply`
pub const MANIFEST_PREFIX: &str = "/tmp/kubestrap-manifest-";

/// kubectl bound to one channel and kubeconfig
#[derive(Clone)]
pub struct Kubectl {
    channel: Arc<dyn CommandChannel>,
    kubeconfig: Option<String>,
}

/// The fields of a node the orchestrator reads
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSummary {
    /// Node name
    pub name: String,
    /// Node labels
    pub labels: BTreeMap<String, String>,
    /// Ready condition is True
    pub ready: bool,
    /// Kubelet version
    pub kubelet_version: String,
    /// First InternalIP address
    pub internal_ip: Option<String>,
}

#[derive(Deserialize)]
struct ItemList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct NodeItem {
    metadata: ObjectMeta,
    #[serde(default)]
    status: Option<NodeStatus>,
}

impl From<NodeItem> for NodeSummary {
    fn from(item: NodeItem) -> Self {
        let status = item.status.unwrap_or_default();
        let ready = status
            .conditions
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|c| c.type_ == "Ready" && c.status == "True");
        let internal_ip = status
            .addresses
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|a| a.type_ == "InternalIP")
            .map(|a| a.address.clone());
        let kubelet_version = status
            .node_info
            .map(|i| i.kubelet_version)
            .unwrap_or_default();

        Self {
            name: item.metadata.name.unwrap_or_default(),
            labels: item.metadata.labels.unwrap_or_default(),
            ready,
            kubelet_version,
            internal_ip,
        }
    }
}

fn namespace_flag(namespace: Option<&str>) -> String {
    namespace
        .map(|ns| format!(" -n {}", shell_quote(ns)))
        .unwrap_or_default()
}

impl Kubectl {
    /// kubectl with an explicit kubeconfig (or the ambient one when `None`)
    pub fn new(channel: Arc<dyn CommandChannel>, kubeconfig: Option<String>) -> Self {
        Self {
            channel,
            kubeconfig,
        }
    }

    /// kubectl on a control-plane node using the admin kubeconfig
    pub fn on_control_plane(channel: Arc<dyn CommandChannel>) -> Self {
        Self::new(channel, Some(ADMIN_KUBECONFIG.to_string()))
    }

    /// Channel this client runs on
    pub fn channel(&self) -> &Arc<dyn CommandChannel> {
        &self.channel
    }

    /// Kubeconfig flag value, if any
    pub fn kubeconfig(&self) -> Option<&str> {
        self.kubeconfig.as_deref()
    }

    fn command(&self, args: &str) -> String {
        match &self.kubeconfig {
            Some(path) => format!("kubectl --kubeconfig={} {args}", shell_quote(path)),
            None => format!("kubectl {args}"),
        }
    }

    /// Run `kubectl <args>` and return its output
    pub async fn run(&self, args: &str) -> Result<String> {
        self.channel.execute(&self.command(args)).await
    }

    /// Apply a YAML manifest.
    ///
    /// The manifest is uploaded to a 0600 scratch file and never appears on a
    /// command line; Secrets pass through here.
    pub async fn apply(&self, manifest: &str) -> Result<()> {
        let path = format!("{MANIFEST_PREFIX}{:016x}.yaml", rand::random::<u64>());
        self.channel.upload(manifest.as_bytes(), &path, 0o600).await?;

        let applied = self
            .run(&format!("apply -f {}", shell_quote(&path)))
            .await;
        if let Err(e) = self
            .channel
            .execute(&format!("rm -f {}", shell_quote(&path)))
            .await
        {
            warn!(host = %self.channel.host(), path = %path, error = %e, "failed to remove staged manifest");
        }
        applied.map(|_| ())
    }

    /// Serialize a typed resource and apply it
    pub async fn apply_resource<T: Serialize>(&self, resource: &T) -> Result<()> {
        self.apply(&serde_yaml::to_string(resource)?).await
    }

    /// Set a label on a node, overwriting any existing value
    pub async fn label_node(&self, node: &str, key: &str, value: &str) -> Result<()> {
        self.run(&format!(
            "label node {} {}={} --overwrite",
            shell_quote(node),
            key,
            shell_quote(value)
        ))
        .await?;
        Ok(())
    }

    /// Read a jsonpath expression from one resource
    pub async fn jsonpath(
        &self,
        resource: &str,
        namespace: Option<&str>,
        path: &str,
    ) -> Result<String> {
        let out = self
            .run(&format!(
                "get {resource}{} -o jsonpath={}",
                namespace_flag(namespace),
                shell_quote(path)
            ))
            .await?;
        Ok(out.trim().to_string())
    }

    /// True when the resource exists; NotFound is `false`, other failures are errors
    pub async fn exists(&self, resource: &str, namespace: Option<&str>) -> Result<bool> {
        match self
            .run(&format!("get {resource}{} -o name", namespace_flag(namespace)))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Fetch a resource as JSON and deserialize it
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        resource: &str,
        namespace: Option<&str>,
    ) -> Result<T> {
        let out = self
            .run(&format!("get {resource}{} -o json", namespace_flag(namespace)))
            .await?;
        Ok(serde_json::from_str(&out)?)
    }

    /// Merge-patch a resource
    pub async fn merge_patch(
        &self,
        resource: &str,
        namespace: Option<&str>,
        patch: &serde_json::Value,
    ) -> Result<()> {
        self.run(&format!(
            "patch {resource}{} --type=merge -p {}",
            namespace_flag(namespace),
            shell_quote(&patch.to_string())
        ))
        .await?;
        Ok(())
    }

    /// Names (`kind/name`) of resources of a kind matching a label selector
    pub async fn list_names(
        &self,
        kind: &str,
        namespace: Option<&str>,
        selector: &str,
    ) -> Result<Vec<String>> {
        let out = self
            .run(&format!(
                "get {kind}{} -l {} -o name",
                namespace_flag(namespace),
                shell_quote(selector)
            ))
            .await?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Delete a resource; a missing resource is not an error
    pub async fn delete(&self, resource: &str, namespace: Option<&str>) -> Result<()> {
        debug!(resource, "deleting");
        self.run(&format!(
            "delete {resource}{} --ignore-not-found",
            namespace_flag(namespace)
        ))
        .await?;
        Ok(())
    }

    /// Wait for a workload rollout to finish
    pub async fn rollout_status(
        &self,
        resource: &str,
        namespace: &str,
        timeout_secs: u64,
    ) -> Result<()> {
        self.run(&format!(
            "rollout status {resource} -n {} --timeout={timeout_secs}s",
            shell_quote(namespace)
        ))
        .await?;
        Ok(())
    }

    /// True once the API server answers `/readyz` with `ok`
    pub async fn readyz(&self) -> Result<bool> {
        let out = self.run("get --raw=/readyz").await?;
        Ok(out.trim() == "ok")
    }

    /// Every node with its labels and readiness
    pub async fn nodes(&self) -> Result<Vec<NodeSummary>> {
        let list: ItemList<NodeItem> = self.get_json("nodes", None).await?;
        Ok(list.items.into_iter().map(NodeSummary::from).collect())
    }

    /// Raw `get pods` table for a namespace
    pub async fn pods(&self, namespace: &str) -> Result<String> {
        self.run(&format!("get pods -n {} -o wide", shell_quote(namespace)))
            .await
    }
}
