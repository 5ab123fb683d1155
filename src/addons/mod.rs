//! Cluster addons installed with helm
//!
//! - [`cilium`] - networking plugin replacing kube-proxy, optional Gateway API
//! - [`metallb`] - load-balancer addresses announced over BGP or L2
//!
//! Charts come from the offline artifact store and are staged on the host helm
//! runs on. Values documents are typed structs serialized to YAML.

pub mod cilium;
pub mod metallb;

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::channel::{shell_quote, CommandChannel};
use crate::kubectl::Kubectl;
use crate::provision::{Artifact, ArtifactStore};
use crate::{Result, CLUSTER_LABEL};

const STAGING: &str = "/tmp/kubestrap";

/// Value of the `app.kubernetes.io/managed-by` label on resources we create
pub const MANAGED_BY: &str = "kubestrap";

/// Labels identifying a resource as created for `cluster`
pub fn cluster_labels(cluster: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string()),
        (CLUSTER_LABEL.to_string(), cluster.to_string()),
    ])
}

/// Label selector matching [`cluster_labels`]
pub fn cluster_selector(cluster: &str) -> String {
    format!("{CLUSTER_LABEL}={cluster}")
}

/// helm running on the same host and kubeconfig as a [`Kubectl`]
#[derive(Clone)]
pub struct Helm {
    channel: Arc<dyn CommandChannel>,
    kubeconfig: Option<String>,
}

impl Helm {
    /// helm sharing `kubectl`'s channel and kubeconfig
    pub fn for_kubectl(kubectl: &Kubectl) -> Self {
        Self {
            channel: kubectl.channel().clone(),
            kubeconfig: kubectl.kubeconfig().map(str::to_string),
        }
    }

    fn command(&self, args: &str) -> String {
        match &self.kubeconfig {
            Some(path) => format!("helm --kubeconfig={} {args}", shell_quote(path)),
            None => format!("helm {args}"),
        }
    }

    /// Install the helm binary from the artifact store unless one is present
    pub async fn ensure_installed(&self, artifacts: &dyn ArtifactStore) -> Result<()> {
        if self.channel.execute("command -v helm").await.is_ok() {
            return Ok(());
        }
        info!(host = %self.channel.host(), "installing helm");
        let binary = artifacts.fetch(Artifact::Helm).await?;
        self.channel
            .upload(&binary, "/usr/local/bin/helm", 0o755)
            .await
    }

    /// Copy a chart archive to the helm host; returns its path there
    pub async fn stage_chart(
        &self,
        artifacts: &dyn ArtifactStore,
        chart: Artifact,
    ) -> Result<String> {
        let bytes = artifacts.fetch(chart.clone()).await?;
        let name = chart
            .relative_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "chart.tgz".to_string());
        let path = format!("{STAGING}/charts/{name}");
        self.channel.upload(&bytes, &path, 0o644).await?;
        Ok(path)
    }

    /// `helm upgrade --install` with a values document
    pub async fn upgrade_install(
        &self,
        release: &str,
        chart_path: &str,
        namespace: &str,
        values: &str,
    ) -> Result<()> {
        let values_path = format!("{STAGING}/{release}-values.yaml");
        self.channel
            .upload(values.as_bytes(), &values_path, 0o600)
            .await?;

        debug!(release, namespace, "helm upgrade --install");
        let result = self
            .channel
            .execute(&self.command(&format!(
                "upgrade --install {} {} --namespace {} --create-namespace --values {}",
                shell_quote(release),
                shell_quote(chart_path),
                shell_quote(namespace),
                shell_quote(&values_path)
            )))
            .await;
        if let Err(e) = self
            .channel
            .execute(&format!("rm -f {}", shell_quote(&values_path)))
            .await
        {
            warn!(release, path = %values_path, error = %e, "failed to remove helm values file");
        }
        result.map(|_| ())
    }

    /// True when the release exists in `namespace`
    pub async fn is_deployed(&self, release: &str, namespace: &str) -> Result<bool> {
        match self
            .channel
            .execute(&self.command(&format!(
                "status {} --namespace {}",
                shell_quote(release),
                shell_quote(namespace)
            )))
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
