//! NVIDIA driver and container toolkit for GPU nodes
//!
//! The containerd configuration already carries the nvidia runtime on GPU nodes,
//! so this step only installs packages and restarts containerd to pick them up.

use tracing::{debug, info};

use super::artifacts::{Artifact, ArtifactStore};
use super::StepOutcome;
use crate::channel::CommandChannel;
use crate::spec::NodeSpec;
use crate::Result;

const BUNDLE_PATH: &str = "/tmp/kubestrap/nvidia-bundle.tar.gz";
const UNPACK_DIR: &str = "/tmp/kubestrap/nvidia";

const DETECT: &str =
    "command -v nvidia-smi >/dev/null 2>&1 && command -v nvidia-container-runtime >/dev/null 2>&1";

/// Install the GPU stack unless driver and toolkit are both present
pub async fn apply(
    channel: &dyn CommandChannel,
    node: &NodeSpec,
    artifacts: &dyn ArtifactStore,
) -> Result<StepOutcome> {
    if channel.execute(DETECT).await.is_ok() {
        debug!(node = %node.hostname, "GPU driver and toolkit already present");
        return Ok(StepOutcome::Skipped);
    }

    info!(node = %node.hostname, "installing NVIDIA driver and container toolkit");
    let bundle = artifacts.fetch(Artifact::GpuBundle).await?;
    channel.upload(&bundle, BUNDLE_PATH, 0o644).await?;

    channel
        .execute(&format!(
            "rm -rf {UNPACK_DIR} && mkdir -p {UNPACK_DIR} && tar -xzf {BUNDLE_PATH} -C {UNPACK_DIR} \
             && (dpkg -i {UNPACK_DIR}/*.deb || apt-get install -f -y) \
             && apt-mark hold $(dpkg-deb -f {UNPACK_DIR}/*.deb Package 2>/dev/null | sort -u) >/dev/null 2>&1; \
             rm -rf {UNPACK_DIR} {BUNDLE_PATH}; \
             command -v nvidia-container-runtime >/dev/null"
        ))
        .await?;

    channel.execute("systemctl restart containerd").await?;
    Ok(StepOutcome::Applied)
}
