//! Offline artifact store
//!
//! Binaries and charts come from a local packages directory laid out as:
//!
//! ```text
//! packages/
//!   containerd.tar.gz  runc.amd64  cni-plugins.tgz  helm
//!   kubernetes/<version>/{kubeadm,kubelet,kubectl}
//!   charts/{cilium,metallb}.tgz
//!   gpu/nvidia-bundle.tar.gz
//! ```

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

use crate::spec::ClusterConfig;
use crate::{Error, Result};

/// One offline artifact
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Artifact {
    /// containerd release tarball
    Containerd,
    /// runc binary
    Runc,
    /// CNI plugins tarball
    CniPlugins,
    /// kubeadm for a version
    Kubeadm(String),
    /// kubelet for a version
    Kubelet(String),
    /// kubectl for a version
    Kubectl(String),
    /// helm binary
    Helm,
    /// Cilium chart archive
    CiliumChart,
    /// MetalLB chart archive
    MetallbChart,
    /// NVIDIA driver and container toolkit packages
    GpuBundle,
}

impl Artifact {
    /// Path relative to the packages directory
    pub fn relative_path(&self) -> PathBuf {
        match self {
            Self::Containerd => PathBuf::from("containerd.tar.gz"),
            Self::Runc => PathBuf::from("runc.amd64"),
            Self::CniPlugins => PathBuf::from("cni-plugins.tgz"),
            Self::Kubeadm(v) => PathBuf::from("kubernetes").join(v).join("kubeadm"),
            Self::Kubelet(v) => PathBuf::from("kubernetes").join(v).join("kubelet"),
            Self::Kubectl(v) => PathBuf::from("kubernetes").join(v).join("kubectl"),
            Self::Helm => PathBuf::from("helm"),
            Self::CiliumChart => PathBuf::from("charts").join("cilium.tgz"),
            Self::MetallbChart => PathBuf::from("charts").join("metallb.tgz"),
            Self::GpuBundle => PathBuf::from("gpu").join("nvidia-bundle.tar.gz"),
        }
    }
}

/// Every artifact a bootstrap of `config` reads
pub fn required(config: &ClusterConfig) -> Vec<Artifact> {
    let version = config.spec.version.clone();
    let mut artifacts = vec![
        Artifact::Containerd,
        Artifact::Runc,
        Artifact::CniPlugins,
        Artifact::Kubeadm(version.clone()),
        Artifact::Kubelet(version.clone()),
        Artifact::Kubectl(version),
        Artifact::Helm,
        Artifact::CiliumChart,
    ];
    if config.wants_load_balancer() {
        artifacts.push(Artifact::MetallbChart);
    }
    if config.gpu_nodes().next().is_some() {
        artifacts.push(Artifact::GpuBundle);
    }
    artifacts
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.relative_path().display())
    }
}

/// Source of offline artifacts
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Read an artifact's bytes
    async fn fetch(&self, artifact: Artifact) -> Result<Vec<u8>>;
}

/// Artifacts read from a local directory
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Store rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Names of required artifacts missing from the directory
    pub fn missing(&self, required: &[Artifact]) -> Vec<Artifact> {
        required
            .iter()
            .filter(|a| !self.root.join(a.relative_path()).is_file())
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn fetch(&self, artifact: Artifact) -> Result<Vec<u8>> {
        let path = self.root.join(artifact.relative_path());
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::artifact(format!("{}: {e}", path.display())))
    }
}
