//! Container runtime: containerd, runc and CNI plugins from offline artifacts
//!
//! Binaries are installed only when missing. `config.toml` and the registry's
//! `hosts.toml` are installed only when their content changed, and containerd is
//! restarted only then or when it is not running.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info};

use super::artifacts::{Artifact, ArtifactStore};
use super::StepOutcome;
use crate::channel::{shell_quote, CommandChannel};
use crate::spec::{registry_prefix, ClusterConfig, NodeSpec};
use crate::Result;

const STAGING: &str = "/tmp/kubestrap";
const CONFIG_PATH: &str = "/etc/containerd/config.toml";
const CERTS_DIR: &str = "/etc/containerd/certs.d";
const PAUSE_IMAGE: &str = "pause:3.10";

const DETECT_BINARIES: &str =
    "test -x /usr/local/bin/containerd && test -x /usr/local/sbin/runc && test -x /opt/cni/bin/bridge";

const CONTAINERD_UNIT: &str = "\
[Unit]
Description=containerd container runtime
Documentation=https://containerd.io
After=network.target local-fs.target

[Service]
ExecStartPre=-/sbin/modprobe overlay
ExecStart=/usr/local/bin/containerd
Type=notify
Delegate=yes
KillMode=process
Restart=always
RestartSec=5
LimitNPROC=infinity
LimitCORE=infinity
LimitNOFILE=infinity
TasksMax=infinity
OOMScoreAdjust=-999

[Install]
WantedBy=multi-user.target
";

#[derive(Debug, Serialize)]
struct ContainerdConfig {
    version: u32,
    plugins: Plugins,
}

#[derive(Debug, Serialize)]
struct Plugins {
    #[serde(rename = "io.containerd.grpc.v1.cri")]
    cri: CriPlugin,
}

#[derive(Debug, Serialize)]
struct CriPlugin {
    sandbox_image: String,
    containerd: CriContainerd,
    registry: CriRegistry,
}

#[derive(Debug, Serialize)]
struct CriContainerd {
    default_runtime_name: String,
    runtimes: BTreeMap<String, Runtime>,
}

#[derive(Debug, Serialize)]
struct Runtime {
    runtime_type: String,
    options: RuntimeOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct RuntimeOptions {
    systemd_cgroup: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    binary_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct CriRegistry {
    config_path: String,
}

#[derive(Debug, Serialize)]
struct HostsToml {
    server: String,
    host: BTreeMap<String, HostEntry>,
}

#[derive(Debug, Serialize)]
struct HostEntry {
    capabilities: Vec<String>,
    skip_verify: bool,
}

/// Render containerd's `config.toml` for a node
pub fn containerd_config(config: &ClusterConfig, gpu: bool) -> Result<String> {
    let runc = || Runtime {
        runtime_type: "io.containerd.runc.v2".to_string(),
        options: RuntimeOptions {
            systemd_cgroup: true,
            binary_name: None,
        },
    };

    let mut runtimes = BTreeMap::from([("runc".to_string(), runc())]);
    if gpu {
        runtimes.insert(
            "nvidia".to_string(),
            Runtime {
                options: RuntimeOptions {
                    systemd_cgroup: true,
                    binary_name: Some("/usr/bin/nvidia-container-runtime".to_string()),
                },
                ..runc()
            },
        );
    }

    let document = ContainerdConfig {
        version: 2,
        plugins: Plugins {
            cri: CriPlugin {
                sandbox_image: format!(
                    "{}/{PAUSE_IMAGE}",
                    registry_prefix(&config.spec.image_repository)
                ),
                containerd: CriContainerd {
                    default_runtime_name: if gpu { "nvidia" } else { "runc" }.to_string(),
                    runtimes,
                },
                registry: CriRegistry {
                    config_path: CERTS_DIR.to_string(),
                },
            },
        },
    };

    toml::to_string(&document).map_err(|e| crate::Error::serialization(e.to_string()))
}

/// Render the registry's `hosts.toml`
pub fn hosts_toml(config: &ClusterConfig) -> Result<String> {
    let scheme = if config.spec.registry.insecure {
        "http"
    } else {
        "https"
    };
    let server = format!("{scheme}://{}", config.registry_host());
    let document = HostsToml {
        server: server.clone(),
        host: BTreeMap::from([(
            server,
            HostEntry {
                capabilities: vec!["pull".into(), "resolve".into(), "push".into()],
                skip_verify: config.spec.registry.insecure,
            },
        )]),
    };
    toml::to_string(&document).map_err(|e| crate::Error::serialization(e.to_string()))
}

/// Stage `contents` and install it at `path` only if it differs; true when installed
async fn install_if_changed(
    channel: &dyn CommandChannel,
    contents: &str,
    path: &str,
) -> Result<bool> {
    let file_name = path.trim_start_matches('/').replace('/', "_");
    let staged = format!("{STAGING}/{file_name}");
    channel.upload(contents.as_bytes(), &staged, 0o644).await?;

    let staged = shell_quote(&staged);
    let target = shell_quote(path);
    let out = channel
        .execute(&format!(
            "if cmp -s {staged} {target}; then rm -f {staged}; else install -D -m 0644 {staged} {target} && rm -f {staged} && echo changed; fi"
        ))
        .await?;
    Ok(out.trim() == "changed")
}

async fn install_binaries(
    channel: &dyn CommandChannel,
    artifacts: &dyn ArtifactStore,
    node: &NodeSpec,
) -> Result<()> {
    info!(node = %node.hostname, "installing containerd, runc and CNI plugins");

    let containerd = artifacts.fetch(Artifact::Containerd).await?;
    let runc = artifacts.fetch(Artifact::Runc).await?;
    let cni = artifacts.fetch(Artifact::CniPlugins).await?;

    channel
        .execute("systemctl stop containerd 2>/dev/null || true")
        .await?;
    channel
        .upload(&containerd, &format!("{STAGING}/containerd.tar.gz"), 0o644)
        .await?;
    channel
        .upload(&runc, &format!("{STAGING}/runc.amd64"), 0o755)
        .await?;
    channel
        .upload(&cni, &format!("{STAGING}/cni-plugins.tgz"), 0o644)
        .await?;
    channel
        .upload(
            CONTAINERD_UNIT.as_bytes(),
            "/etc/systemd/system/containerd.service",
            0o644,
        )
        .await?;

    channel
        .execute(&format!(
            "tar -xzf {STAGING}/containerd.tar.gz -C /usr/local \
             && install -m 0755 {STAGING}/runc.amd64 /usr/local/sbin/runc \
             && mkdir -p /opt/cni/bin && tar -xzf {STAGING}/cni-plugins.tgz -C /opt/cni/bin \
             && rm -f {STAGING}/containerd.tar.gz {STAGING}/runc.amd64 {STAGING}/cni-plugins.tgz \
             && systemctl daemon-reload && systemctl enable containerd"
        ))
        .await?;
    Ok(())
}

/// Install and configure the container runtime on one node
pub async fn apply(
    channel: &dyn CommandChannel,
    config: &ClusterConfig,
    node: &NodeSpec,
    artifacts: &dyn ArtifactStore,
) -> Result<StepOutcome> {
    let installed = channel.execute(DETECT_BINARIES).await.is_ok();
    if !installed {
        install_binaries(channel, artifacts, node).await?;
    }

    let config_changed =
        install_if_changed(channel, &containerd_config(config, node.gpu)?, CONFIG_PATH).await?;
    let hosts_path = format!("{CERTS_DIR}/{}/hosts.toml", config.registry_host());
    let hosts_changed = install_if_changed(channel, &hosts_toml(config)?, &hosts_path).await?;

    let active = channel
        .execute("systemctl is-active --quiet containerd")
        .await
        .is_ok();

    if installed && !config_changed && !hosts_changed && active {
        debug!(node = %node.hostname, "container runtime already configured");
        return Ok(StepOutcome::Skipped);
    }

    channel
        .execute(
            "mkdir -p /var/run/containerd \
             && ln -sf /run/containerd/containerd.sock /var/run/containerd/containerd.sock 2>/dev/null; \
             systemctl enable containerd && systemctl restart containerd",
        )
        .await?;
    Ok(StepOutcome::Applied)
}
