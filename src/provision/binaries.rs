//! kubeadm, kubelet and kubectl from offline artifacts

use tracing::{debug, info};

use super::artifacts::{Artifact, ArtifactStore};
use super::StepOutcome;
use crate::channel::CommandChannel;
use crate::spec::{ClusterConfig, NodeSpec};
use crate::Result;

const STAGING: &str = "/tmp/kubestrap";

const KUBELET_UNIT: &str = "\
[Unit]
Description=kubelet: The Kubernetes Node Agent
Documentation=https://kubernetes.io/docs/
Wants=network-online.target
After=network-online.target

[Service]
ExecStart=/usr/local/bin/kubelet
Restart=always
StartLimitInterval=0
RestartSec=10

[Install]
WantedBy=multi-user.target
";

const KUBEADM_DROPIN: &str = "\
[Service]
Environment=\"KUBELET_KUBECONFIG_ARGS=--bootstrap-kubeconfig=/etc/kubernetes/bootstrap-kubelet.conf --kubeconfig=/etc/kubernetes/kubelet.conf\"
Environment=\"KUBELET_CONFIG_ARGS=--config=/var/lib/kubelet/config.yaml\"
EnvironmentFile=-/var/lib/kubelet/kubeadm-flags.env
EnvironmentFile=-/etc/default/kubelet
ExecStart=
ExecStart=/usr/local/bin/kubelet $KUBELET_KUBECONFIG_ARGS $KUBELET_CONFIG_ARGS $KUBELET_KUBEADM_ARGS $KUBELET_EXTRA_ARGS
";

/// Install the Kubernetes binaries unless the requested version is already present
pub async fn apply(
    channel: &dyn CommandChannel,
    config: &ClusterConfig,
    node: &NodeSpec,
    artifacts: &dyn ArtifactStore,
) -> Result<StepOutcome> {
    let version = &config.spec.version;

    if let Ok(installed) = channel.execute("kubeadm version -o short").await {
        if installed.trim() == version {
            debug!(node = %node.hostname, %version, "kubernetes binaries already installed");
            return Ok(StepOutcome::Skipped);
        }
    }

    info!(node = %node.hostname, %version, "installing kubernetes binaries");
    let binaries = [
        ("kubeadm", Artifact::Kubeadm(version.clone())),
        ("kubelet", Artifact::Kubelet(version.clone())),
        ("kubectl", Artifact::Kubectl(version.clone())),
    ];
    for (name, artifact) in binaries {
        let bytes = artifacts.fetch(artifact).await?;
        channel
            .upload(&bytes, &format!("{STAGING}/{name}"), 0o755)
            .await?;
    }

    channel
        .upload(
            KUBELET_UNIT.as_bytes(),
            "/etc/systemd/system/kubelet.service",
            0o644,
        )
        .await?;
    channel
        .upload(
            KUBEADM_DROPIN.as_bytes(),
            "/etc/systemd/system/kubelet.service.d/10-kubeadm.conf",
            0o644,
        )
        .await?;

    channel
        .execute(&format!(
            "install -m 0755 {STAGING}/kubeadm {STAGING}/kubelet {STAGING}/kubectl /usr/local/bin/ \
             && rm -f {STAGING}/kubeadm {STAGING}/kubelet {STAGING}/kubectl \
             && systemctl daemon-reload && systemctl enable kubelet"
        ))
        .await?;
    Ok(StepOutcome::Applied)
}
