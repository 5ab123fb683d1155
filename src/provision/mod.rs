//! Concurrent node provisioning
//!
//! Every node runs the same ordered pipeline in its own task:
//!
//! 1. baseline (swap, firewall, kernel tuning, limits, time sync, hostname, hosts block)
//! 2. container runtime (containerd, runc, CNI plugins, registry configuration)
//! 3. Kubernetes binaries (kubeadm, kubelet, kubectl)
//! 4. GPU stack (GPU nodes only)
//!
//! Each step detects what is already in place and skips or reinstalls, so a
//! partially provisioned fleet can simply be provisioned again. A failing node
//! never cancels its siblings: [`fan_out`] waits for every task and then reports
//! all failures at once.

pub mod access;
pub mod artifacts;
pub mod baseline;
pub mod binaries;
pub mod gpu;
pub mod ha;
pub mod runtime;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub use artifacts::{required as required_artifacts, Artifact, ArtifactStore, LocalArtifactStore};

use crate::channel::{ChannelFactory, CommandChannel};
use crate::error::NodeFailure;
use crate::spec::{ClusterConfig, NodeSpec};
use crate::{Error, Result};

/// What a pipeline step did on a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step changed the node
    Applied,
    /// The node was already in the desired state
    Skipped,
}

/// One stage of the node pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// System baseline tuning
    Baseline,
    /// Container runtime install and configuration
    Runtime,
    /// kubeadm, kubelet and kubectl
    Binaries,
    /// NVIDIA driver and container toolkit
    Gpu,
}

impl Step {
    /// Steps a node runs, in order
    pub fn pipeline(gpu: bool) -> &'static [Step] {
        if gpu {
            &[Step::Baseline, Step::Runtime, Step::Binaries, Step::Gpu]
        } else {
            &[Step::Baseline, Step::Runtime, Step::Binaries]
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Baseline => write!(f, "baseline"),
            Self::Runtime => write!(f, "container-runtime"),
            Self::Binaries => write!(f, "kubernetes-binaries"),
            Self::Gpu => write!(f, "gpu-stack"),
        }
    }
}

/// Run `task` once per node concurrently and wait for all of them.
///
/// Results come back over a channel sized to the node count, so no sender ever
/// waits. Failures are reported together, in node order, as
/// [`Error::NodeFailures`].
pub async fn fan_out<F, Fut>(phase: &str, nodes: &[NodeSpec], task: F) -> Result<()>
where
    F: Fn(NodeSpec) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<(usize, Result<()>)>(nodes.len().max(1));

    let handles: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| {
            let tx = tx.clone();
            let work = task(node.clone());
            tokio::spawn(async move {
                let result = work.await;
                let _ = tx.send((idx, result)).await;
            })
        })
        .collect();
    drop(tx);

    let mut failures: Vec<(usize, Error)> = Vec::new();
    for (idx, joined) in join_all(handles).await.into_iter().enumerate() {
        if let Err(e) = joined {
            failures.push((idx, Error::Task(e.to_string())));
        }
    }
    while let Ok((idx, result)) = rx.try_recv() {
        if let Err(e) = result {
            failures.push((idx, e));
        }
    }

    if failures.is_empty() {
        return Ok(());
    }

    failures.sort_by_key(|(idx, _)| *idx);
    for (idx, error) in &failures {
        warn!(phase, node = %nodes[*idx].hostname, error = %error, "node failed");
    }
    Err(Error::NodeFailures {
        phase: phase.to_string(),
        failures: failures
            .into_iter()
            .map(|(idx, error)| NodeFailure {
                node: nodes[idx].hostname.clone(),
                error,
            })
            .collect(),
    })
}

/// Per-node pipeline progress
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeProgress {
    /// Steps that changed the node
    pub applied: Vec<Step>,
    /// Steps that found the node already converged
    pub skipped: Vec<Step>,
    /// Step the pipeline stopped at
    pub failed: Option<Step>,
}

/// Progress of every node, shared across provisioning tasks
#[derive(Debug, Clone, Default)]
pub struct ProgressLog {
    inner: Arc<Mutex<BTreeMap<String, NodeProgress>>>,
}

impl ProgressLog {
    fn update(&self, node: &str, f: impl FnOnce(&mut NodeProgress)) {
        let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        f(map.entry(node.to_string()).or_default());
    }

    /// Record a finished step
    pub fn record(&self, node: &str, step: Step, outcome: StepOutcome) {
        self.update(node, |p| match outcome {
            StepOutcome::Applied => p.applied.push(step),
            StepOutcome::Skipped => p.skipped.push(step),
        });
    }

    /// Record the step a node failed at
    pub fn record_failure(&self, node: &str, step: Step) {
        self.update(node, |p| p.failed = Some(step));
    }

    /// Copy of the current progress
    pub fn snapshot(&self) -> BTreeMap<String, NodeProgress> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// Brings every node of a cluster to the common baseline
#[derive(Clone)]
pub struct Provisioner {
    config: Arc<ClusterConfig>,
    channels: Arc<dyn ChannelFactory>,
    artifacts: Arc<dyn ArtifactStore>,
    progress: ProgressLog,
}

impl Provisioner {
    /// Create a provisioner for `config`
    pub fn new(
        config: Arc<ClusterConfig>,
        channels: Arc<dyn ChannelFactory>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            config,
            channels,
            artifacts,
            progress: ProgressLog::default(),
        }
    }

    /// Shared progress log
    pub fn progress(&self) -> &ProgressLog {
        &self.progress
    }

    /// Probe every node once; fails with every unreachable node named
    pub async fn check_connectivity(&self) -> Result<()> {
        info!(nodes = self.config.spec.nodes.len(), "checking node connectivity");
        let channels = self.channels.clone();
        fan_out("connectivity", &self.config.spec.nodes, |node| {
            let channel = channels.channel(&node);
            async move {
                let result = channel.execute("hostname").await;
                channel.close().await;
                result.map(|_| ())
            }
        })
        .await
    }

    /// Generate the managed key if needed and authorize it for root on every
    /// node that is reached by password
    pub async fn authorize_managed_key(
        &self,
        local: &dyn CommandChannel,
        managed_key: &Path,
    ) -> Result<()> {
        let public_key = access::ensure_managed_key(local, managed_key).await?;
        let targets: Vec<NodeSpec> = self
            .config
            .spec
            .nodes
            .iter()
            .filter(|n| n.ssh.password.is_some())
            .cloned()
            .collect();
        if targets.is_empty() {
            return Ok(());
        }

        info!(nodes = targets.len(), "authorizing managed key");
        let channels = self.channels.clone();
        fan_out("ssh-setup", &targets, |node| {
            let channel = channels.channel(&node);
            let public_key = public_key.clone();
            async move {
                let result = access::authorize(channel.as_ref(), &public_key).await;
                channel.close().await;
                result.map(|_| ())
            }
        })
        .await
    }

    /// Run the pipeline on every node concurrently
    pub async fn provision_all(&self) -> Result<()> {
        info!(nodes = self.config.spec.nodes.len(), "provisioning nodes");
        let result = fan_out("provision", &self.config.spec.nodes, |node| {
            let this = self.clone();
            async move { this.provision_node(&node).await }
        })
        .await;

        for (node, progress) in self.progress.snapshot() {
            info!(
                node = %node,
                applied = progress.applied.len(),
                skipped = progress.skipped.len(),
                failed = ?progress.failed,
                "provisioning summary"
            );
        }
        result
    }

    /// Run the pipeline on one node over a channel it owns
    pub async fn provision_node(&self, node: &NodeSpec) -> Result<()> {
        let channel = self.channels.channel(node);
        let result = self.run_pipeline(channel.as_ref(), node).await;
        channel.close().await;
        result
    }

    async fn run_pipeline(&self, channel: &dyn CommandChannel, node: &NodeSpec) -> Result<()> {
        let config = self.config.as_ref();
        let artifacts = self.artifacts.as_ref();

        for &step in Step::pipeline(node.gpu) {
            let outcome = match step {
                Step::Baseline => baseline::apply(channel, config, node).await,
                Step::Runtime => runtime::apply(channel, config, node, artifacts).await,
                Step::Binaries => binaries::apply(channel, config, node, artifacts).await,
                Step::Gpu => gpu::apply(channel, node, artifacts).await,
            };
            match outcome {
                Ok(outcome) => {
                    info!(node = %node.hostname, %step, ?outcome, "step finished");
                    self.progress.record(&node.hostname, step, outcome);
                }
                Err(e) => {
                    self.progress.record_failure(&node.hostname, step);
                    return Err(Error::node(&node.hostname, step.to_string(), e));
                }
            }
        }
        Ok(())
    }
}
