//! Bootstrap sequencer
//!
//! Drives a fleet of prepared machines to a running cluster through a fixed
//! series of phases:
//!
//! ```text
//! Unconfigured → FirstMasterInitializing → FirstMasterReady → OtherMastersJoining
//!   → AddonsInstalling → WorkersJoining → GPUTagging → Validating → Done
//! ```
//!
//! # Failure model
//!
//! There is no rollback. A failing phase stops the run and leaves the fleet as it
//! is; every phase tolerates being entered again against a partially completed
//! fleet, so recovery is running `create` again.
//!
//! # Credentials
//!
//! The join credential is issued once the first master answers `/readyz` and is
//! dropped once the workers have joined. It is never persisted.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::addons::{cilium, metallb};
use crate::channel::{shell_quote, ChannelFactory, CommandChannel, LocalChannel};
use crate::confirm::Confirmer;
use crate::context::CommandContext;
use crate::kubeadm::{
    self, file_exists, issue_join_credential, CertificateKeyParser, InitParams, JoinCredential,
    UploadCertsOutputParser, INIT_CONFIG_PATH, RESET_SCRIPT,
};
use crate::kubectl::{Kubectl, NodeSummary};
use crate::poll::poll_until;
use crate::provision::{fan_out, ha, ArtifactStore, Provisioner};
use crate::spec::{ClusterConfig, NodeSpec};
use crate::{state, Error, Result, ADMIN_KUBECONFIG, CRI_SOCKET, KUBELET_KUBECONFIG};

/// Label applied to GPU workers
pub const GPU_LABEL: (&str, &str) = ("gpu", "on");

/// Sequencer phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// Nodes not yet checked or provisioned; HA clusters also get their VIP
    /// load balancer here
    Unconfigured,
    /// Resetting (if confirmed) and initializing the first master
    FirstMasterInitializing,
    /// Waiting for the API server and issuing the join credential
    FirstMasterReady,
    /// Joining additional masters one at a time
    OtherMastersJoining,
    /// Installing networking and load-balancer addons
    AddonsInstalling,
    /// Joining workers concurrently
    WorkersJoining,
    /// Labelling GPU workers
    GpuTagging,
    /// Final checks, state persistence and kubeconfig export
    Validating,
    /// Cluster is up
    Done,
}

impl Phase {
    /// Every phase in order
    pub const ALL: [Phase; 9] = [
        Phase::Unconfigured,
        Phase::FirstMasterInitializing,
        Phase::FirstMasterReady,
        Phase::OtherMastersJoining,
        Phase::AddonsInstalling,
        Phase::WorkersJoining,
        Phase::GpuTagging,
        Phase::Validating,
        Phase::Done,
    ];

    /// 1-based position, for log banners
    pub fn number(self) -> usize {
        Self::ALL.iter().position(|p| *p == self).unwrap_or(0) + 1
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Unconfigured => "Unconfigured",
            Phase::FirstMasterInitializing => "FirstMasterInitializing",
            Phase::FirstMasterReady => "FirstMasterReady",
            Phase::OtherMastersJoining => "OtherMastersJoining",
            Phase::AddonsInstalling => "AddonsInstalling",
            Phase::WorkersJoining => "WorkersJoining",
            Phase::GpuTagging => "GPUTagging",
            Phase::Validating => "Validating",
            Phase::Done => "Done",
        };
        write!(f, "{name}")
    }
}

/// What a completed run did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Cluster name
    pub cluster: String,
    /// The first master was reset before init
    pub reset_performed: bool,
    /// Masters joined after the first, in join order
    pub masters_joined: Vec<String>,
    /// Workers joined
    pub workers_joined: Vec<String>,
    /// GPU workers successfully labelled
    pub gpu_labelled: Vec<String>,
    /// Nodes as reported by the API server at validation
    pub nodes: Vec<NodeSummary>,
    /// The spec was stored in the cluster
    pub state_saved: bool,
    /// Where the admin kubeconfig was written
    pub kubeconfig: Option<PathBuf>,
    /// Best-effort steps that failed
    pub warnings: Vec<String>,
}

/// Runs the bootstrap phases for one cluster
pub struct Sequencer {
    config: Arc<ClusterConfig>,
    ctx: CommandContext,
    channels: Arc<dyn ChannelFactory>,
    local: Arc<dyn CommandChannel>,
    artifacts: Arc<dyn ArtifactStore>,
    confirmer: Arc<dyn Confirmer>,
    parser: Arc<dyn CertificateKeyParser>,
    phase: Phase,
}

impl Sequencer {
    /// Sequencer running local commands on this machine
    pub fn new(
        config: Arc<ClusterConfig>,
        ctx: CommandContext,
        channels: Arc<dyn ChannelFactory>,
        artifacts: Arc<dyn ArtifactStore>,
        confirmer: Arc<dyn Confirmer>,
    ) -> Self {
        Self {
            config,
            ctx,
            channels,
            local: Arc::new(LocalChannel::new()),
            artifacts,
            confirmer,
            parser: Arc::new(UploadCertsOutputParser),
            phase: Phase::Unconfigured,
        }
    }

    /// Replace the channel used for commands on this machine
    pub fn with_local_channel(mut self, local: Arc<dyn CommandChannel>) -> Self {
        self.local = local;
        self
    }

    /// Replace the certificate-key parser
    pub fn with_certificate_key_parser(mut self, parser: Arc<dyn CertificateKeyParser>) -> Self {
        self.parser = parser;
        self
    }

    /// Phase the sequencer is in (or failed in)
    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) {
        self.phase = phase;
        info!("[Phase {}] {}", phase.number(), phase);
    }

    /// Run every phase; on failure the error is returned and [`Self::phase`]
    /// names the phase that failed
    pub async fn run(&mut self) -> Result<BootstrapReport> {
        let result = self.run_phases().await;
        if let Err(e) = &result {
            error!(phase = %self.phase, error = %e, "bootstrap failed");
        }
        result
    }

    async fn run_phases(&mut self) -> Result<BootstrapReport> {
        let config = self.config.clone();
        let mut report = BootstrapReport {
            cluster: config.name().to_string(),
            ..Default::default()
        };
        let first = config
            .first_master()
            .cloned()
            .ok_or_else(|| Error::validation("cluster has no master node"))?;

        self.enter(Phase::Unconfigured);
        self.prepare_nodes().await?;
        if config.spec.ha.enabled {
            // the endpoint kubeadm init writes into every kubeconfig must answer first
            let channels = self.channels.clone();
            ha::setup_all(&config, |node| channels.channel(node)).await?;
        }

        self.enter(Phase::FirstMasterInitializing);
        let control_plane = self.channels.channel(&first);
        report.reset_performed = self.init_first_master(control_plane.as_ref(), &first).await?;
        let kubectl = Kubectl::on_control_plane(control_plane.clone());

        self.enter(Phase::FirstMasterReady);
        let credential = self.await_first_master(&kubectl).await?;

        self.enter(Phase::OtherMastersJoining);
        report.masters_joined = self.join_masters(&credential).await?;

        self.enter(Phase::AddonsInstalling);
        self.install_addons(&kubectl).await?;

        self.enter(Phase::WorkersJoining);
        report.workers_joined = self.join_workers(&credential).await?;
        drop(credential);

        self.enter(Phase::GpuTagging);
        self.tag_gpu_nodes(&kubectl, &mut report).await;

        self.enter(Phase::Validating);
        self.validate(&kubectl, &mut report).await?;
        self.finalize(&kubectl, control_plane.as_ref(), &mut report)
            .await;

        self.enter(Phase::Done);
        control_plane.close().await;
        print_summary(&config, &report);
        Ok(report)
    }

    async fn prepare_nodes(&self) -> Result<()> {
        let provisioner = Provisioner::new(
            self.config.clone(),
            self.channels.clone(),
            self.artifacts.clone(),
        );
        provisioner.check_connectivity().await?;
        if self.ctx.skip_ssh_setup {
            info!("skipping managed key setup");
        } else {
            provisioner
                .authorize_managed_key(self.local.as_ref(), &self.ctx.managed_key)
                .await?;
        }
        provisioner.provision_all().await
    }

    /// Reset (when confirmed) and init the first master; returns whether a
    /// reset ran
    async fn init_first_master(
        &self,
        channel: &dyn CommandChannel,
        first: &NodeSpec,
    ) -> Result<bool> {
        let mut reset = false;
        if file_exists(channel, ADMIN_KUBECONFIG).await? {
            warn!(node = %first.hostname, "first master already carries a control plane");
            let approved = self
                .confirmer
                .confirm_dangerous(&format!(
                    "{} ({}) is already initialized. Resetting it destroys the existing cluster.",
                    first.hostname, first.ip
                ))
                .await?;
            if !approved {
                return Err(Error::UserCancelled);
            }
            info!(node = %first.hostname, "resetting first master");
            channel
                .execute(RESET_SCRIPT)
                .await
                .map_err(|e| Error::node(&first.hostname, "reset", e))?;
            reset = true;
        }

        let params = InitParams::from_config(&self.config, first)?;
        let rendered = kubeadm::render_init_config(&params)?;
        channel.upload(rendered.as_bytes(), INIT_CONFIG_PATH, 0o600).await?;

        info!(node = %first.hostname, endpoint = %params.endpoint, "running kubeadm init");
        channel
            .execute(&kubeadm::init_command())
            .await
            .map_err(|e| Error::node(&first.hostname, "init", e))?;
        Ok(reset)
    }

    async fn await_first_master(&self, kubectl: &Kubectl) -> Result<JoinCredential> {
        let timings = &self.ctx.timings;
        poll_until(
            timings.api_ready_timeout,
            timings.poll_interval,
            "API server /readyz",
            move || async move { kubectl.readyz().await },
        )
        .await?;
        info!("API server ready");

        let endpoint = self
            .config
            .control_plane_endpoint()
            .ok_or_else(|| Error::validation("cluster has no control-plane endpoint"))?;
        let with_certificate_key = self.config.other_masters().next().is_some();
        issue_join_credential(
            kubectl.channel().as_ref(),
            &endpoint,
            with_certificate_key,
            self.parser.as_ref(),
        )
        .await
    }

    async fn join_masters(&self, credential: &JoinCredential) -> Result<Vec<String>> {
        let masters: Vec<NodeSpec> = self.config.other_masters().cloned().collect();
        let mut joined = Vec::with_capacity(masters.len());

        // etcd membership changes must not overlap
        for (i, node) in masters.iter().enumerate() {
            info!(node = %node.hostname, "joining master {}/{}", i + 1, masters.len());
            let command = credential.master_join_command(node)?;
            let channel = self.channels.channel(node);
            let result = join_node(channel.as_ref(), node, &command).await;
            channel.close().await;
            result.map_err(|e| Error::node(&node.hostname, "master-join", e))?;
            joined.push(node.hostname.clone());
        }
        Ok(joined)
    }

    async fn install_addons(&self, kubectl: &Kubectl) -> Result<()> {
        let timings = &self.ctx.timings;
        cilium::install(kubectl, &self.config, self.artifacts.as_ref(), timings).await?;
        if self.config.wants_load_balancer() {
            metallb::install(kubectl, &self.config, self.artifacts.as_ref(), timings).await?;
        } else {
            info!("no load balancer requested");
        }
        Ok(())
    }

    async fn join_workers(&self, credential: &JoinCredential) -> Result<Vec<String>> {
        let workers: Vec<NodeSpec> = self.config.workers().cloned().collect();
        if workers.is_empty() {
            return Ok(Vec::new());
        }

        info!(nodes = workers.len(), "joining workers");
        let channels = self.channels.clone();
        fan_out("worker-join", &workers, |node| {
            let channel = channels.channel(&node);
            let command = credential.worker_join_command(&node);
            async move {
                let result = join_node(channel.as_ref(), &node, &command).await;
                channel.close().await;
                result
            }
        })
        .await?;
        Ok(workers.into_iter().map(|n| n.hostname).collect())
    }

    async fn tag_gpu_nodes(&self, kubectl: &Kubectl, report: &mut BootstrapReport) {
        let (key, value) = GPU_LABEL;
        for node in self.config.gpu_nodes() {
            match kubectl.label_node(&node.hostname, key, value).await {
                Ok(()) => report.gpu_labelled.push(node.hostname.clone()),
                Err(e) => {
                    warn!(node = %node.hostname, error = %e, "failed to label GPU node");
                    report
                        .warnings
                        .push(format!("label {}: {e}", node.hostname));
                }
            }
        }
    }

    /// The node listing must succeed; the pod listing is informational
    async fn validate(&self, kubectl: &Kubectl, report: &mut BootstrapReport) -> Result<()> {
        let nodes = kubectl.nodes().await?;
        if nodes.is_empty() {
            return Err(Error::validation("API server reports no nodes"));
        }
        let not_ready: Vec<&str> = nodes
            .iter()
            .filter(|n| !n.ready)
            .map(|n| n.name.as_str())
            .collect();
        if !not_ready.is_empty() {
            warn!(nodes = ?not_ready, "nodes not ready yet");
        }
        report.nodes = nodes;

        match kubectl.pods("kube-system").await {
            Ok(pods) => println!("{pods}"),
            Err(e) => {
                warn!(error = %e, "failed to list system pods");
                report.warnings.push(format!("list system pods: {e}"));
            }
        }
        Ok(())
    }

    async fn finalize(
        &self,
        kubectl: &Kubectl,
        control_plane: &dyn CommandChannel,
        report: &mut BootstrapReport,
    ) {
        match state::save(kubectl, &self.config).await {
            Ok(()) => report.state_saved = true,
            Err(e) => {
                warn!(error = %e, "failed to store cluster state; `update` will not find a record");
                report.warnings.push(format!("save state: {e}"));
            }
        }

        if let Some(path) = &self.ctx.kubeconfig_out {
            match self.export_kubeconfig(control_plane, path).await {
                Ok(()) => {
                    info!(path = %path.display(), "kubeconfig written");
                    report.kubeconfig = Some(path.clone());
                }
                Err(e) => {
                    warn!(error = %e, "failed to export kubeconfig");
                    report.warnings.push(format!("export kubeconfig: {e}"));
                }
            }
        }
    }

    async fn export_kubeconfig(
        &self,
        control_plane: &dyn CommandChannel,
        path: &std::path::Path,
    ) -> Result<()> {
        let contents = control_plane
            .execute(&format!("cat {ADMIN_KUBECONFIG}"))
            .await?;
        let target = path.to_string_lossy();
        let backup = format!("{target}.backup.{}", self.config.name());
        self.local
            .execute(&format!(
                "if [ -f {t} ]; then cp -p {t} {b}; fi",
                t = shell_quote(&target),
                b = shell_quote(&backup)
            ))
            .await?;
        self.local
            .upload(contents.as_bytes(), &target, 0o600)
            .await
    }
}

/// Clear stale membership, then run the join command
async fn join_node(channel: &dyn CommandChannel, node: &NodeSpec, command: &str) -> Result<()> {
    if file_exists(channel, KUBELET_KUBECONFIG).await? {
        info!(node = %node.hostname, "node was joined before, resetting");
        channel
            .execute(&format!("kubeadm reset -f --cri-socket {CRI_SOCKET}"))
            .await?;
    }
    channel.execute(command).await?;
    info!(node = %node.hostname, "joined");
    Ok(())
}

fn print_summary(config: &ClusterConfig, report: &BootstrapReport) {
    println!("\nCluster {} is ready", config.name());
    if let Some(endpoint) = config.control_plane_endpoint() {
        println!("  API server:  https://{endpoint}");
    }
    println!("  version:     {}", config.spec.version);
    println!(
        "  nodes:       {} master(s), {} worker(s), {} GPU",
        config.masters().count(),
        config.workers().count(),
        config.gpu_nodes().count()
    );
    for node in &report.nodes {
        println!(
            "    {:<24} {:<8} {}",
            node.name,
            if node.ready { "Ready" } else { "NotReady" },
            node.kubelet_version
        );
    }
    if let Some(path) = &report.kubeconfig {
        println!("  kubeconfig:  {}", path.display());
    }
    for warning in &report.warnings {
        println!("  warning:     {warning}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::confirm::MockConfirmer;
    use crate::spec::load_from_str;
    use crate::testing::{nodes_json, FakeArtifacts, FakeFleet, Reply, CERTIFICATE_KEY};

    const LOCAL: &str = "local";

    fn config(yaml: &str) -> Arc<ClusterConfig> {
        Arc::new(load_from_str(yaml).unwrap())
    }

    fn small() -> Arc<ClusterConfig> {
        config(
            r#"
metadata: {name: demo}
spec:
  nodes:
    - {role: master, ip: 10.0.0.1, ssh: {password: pw}}
    - {role: worker, ip: 10.0.0.2, ssh: {password: pw}}
    - {role: worker, ip: 10.0.0.3, ssh: {password: pw}}
"#,
        )
    }

    fn ha() -> Arc<ClusterConfig> {
        config(
            r#"
metadata: {name: demo}
spec:
  ha: {enabled: true, vip: 10.0.0.100}
  bgp:
    enabled: true
    localASN: 64512
    peers:
      - {peerAddress: 10.0.0.254, peerASN: 64513}
    loadBalancerIPs: [10.0.0.200/29]
  nodes:
    - {role: master, ip: 10.0.0.1, ssh: {password: pw}}
    - {role: master, ip: 10.0.0.2, ssh: {password: pw}}
    - {role: master, ip: 10.0.0.3, ssh: {password: pw}}
    - {role: worker, ip: 10.0.0.4, ssh: {password: pw}}
    - {role: worker, ip: 10.0.0.5, gpu: true, ssh: {password: pw}}
"#,
        )
    }

    fn fleet() -> FakeFleet {
        let fleet = FakeFleet::new();
        fleet.on(
            None,
            "get nodes -o json",
            Reply::Ok(nodes_json(&[("demo-master-01", true)])),
        );
        fleet
    }

    fn sequencer(
        config: Arc<ClusterConfig>,
        fleet: &FakeFleet,
        confirmer: MockConfirmer,
        ctx: CommandContext,
    ) -> Sequencer {
        Sequencer::new(
            config,
            ctx,
            Arc::new(fleet.clone()),
            Arc::new(FakeArtifacts),
            Arc::new(confirmer),
        )
        .with_local_channel(fleet.channel_for(LOCAL))
    }

    fn position(fleet: &FakeFleet, host: &str, needle: &str) -> usize {
        fleet
            .commands(host)
            .iter()
            .position(|c| c.contains(needle))
            .unwrap_or_else(|| panic!("{host} never ran {needle}"))
    }

    #[tokio::test]
    async fn test_single_master_cluster_reaches_done() {
        let fleet = fleet();
        let mut confirmer = MockConfirmer::new();
        confirmer.expect_confirm_dangerous().never();

        let mut seq = sequencer(small(), &fleet, confirmer, CommandContext::for_testing());
        let report = seq.run().await.unwrap();

        assert_eq!(seq.phase(), Phase::Done);
        assert!(!report.reset_performed);
        assert!(report.masters_joined.is_empty());
        assert_eq!(report.workers_joined, vec!["demo-node-01", "demo-node-02"]);
        assert!(report.state_saved);

        assert_eq!(fleet.count("kubeadm init --config"), 1);
        assert_eq!(fleet.count("--control-plane"), 0);
        assert_eq!(fleet.count("kubeadm join"), 2);
        assert_eq!(fleet.count("upgrade --install cilium"), 1);
        assert_eq!(fleet.count("upgrade --install metallb"), 0);
        // no other masters, so no certificate bundle upload
        assert_eq!(fleet.count("upload-certs"), 0);

        let values = fleet
            .uploaded("10.0.0.1", "/tmp/kubestrap/cilium-values.yaml")
            .unwrap();
        let values: serde_yaml::Value = serde_yaml::from_str(&values).unwrap();
        assert_eq!(values["bgpControlPlane"]["enabled"], false);

        let init = fleet.uploaded("10.0.0.1", INIT_CONFIG_PATH).unwrap();
        assert!(init.contains("10.0.0.1:6443"));
    }

    #[tokio::test]
    async fn test_declined_reset_has_no_side_effects() {
        let fleet = fleet();
        fleet.on(Some("10.0.0.1"), "test -f /etc/kubernetes/admin.conf", Reply::ok(""));
        let mut confirmer = MockConfirmer::new();
        confirmer
            .expect_confirm_dangerous()
            .times(1)
            .returning(|_| Ok(false));

        let mut seq = sequencer(small(), &fleet, confirmer, CommandContext::for_testing());
        let err = seq.run().await.unwrap_err();

        assert!(matches!(err, Error::UserCancelled));
        assert_eq!(seq.phase(), Phase::FirstMasterInitializing);
        assert_eq!(fleet.count("kubeadm reset"), 0);
        assert_eq!(fleet.count("kubeadm init"), 0);
        assert_eq!(fleet.count("kubeadm join"), 0);
        assert!(fleet.uploaded("10.0.0.1", INIT_CONFIG_PATH).is_none());
    }

    #[tokio::test]
    async fn test_confirmed_reset_runs_before_init() {
        let fleet = fleet();
        fleet.on(Some("10.0.0.1"), "test -f /etc/kubernetes/admin.conf", Reply::ok(""));
        let mut confirmer = MockConfirmer::new();
        confirmer
            .expect_confirm_dangerous()
            .times(1)
            .returning(|_| Ok(true));

        let report = sequencer(small(), &fleet, confirmer, CommandContext::for_testing())
            .run()
            .await
            .unwrap();

        assert!(report.reset_performed);
        assert!(
            position(&fleet, "10.0.0.1", "kubeadm reset -f")
                < position(&fleet, "10.0.0.1", "kubeadm init --config")
        );
    }

    #[tokio::test]
    async fn test_ha_masters_join_in_order_with_certificate_key() {
        let fleet = fleet();
        // 10.0.0.4 was a member of an earlier attempt
        fleet.on(Some("10.0.0.4"), "test -f /etc/kubernetes/kubelet.conf", Reply::ok(""));
        let mut confirmer = MockConfirmer::new();
        confirmer.expect_confirm_dangerous().never();

        let report = sequencer(ha(), &fleet, confirmer, CommandContext::for_testing())
            .run()
            .await
            .unwrap();

        assert_eq!(report.masters_joined, vec!["demo-master-02", "demo-master-03"]);
        assert_eq!(report.gpu_labelled, vec!["demo-gpu-node-01"]);
        assert_eq!(fleet.count("upload-certs"), 1);
        for host in ["10.0.0.2", "10.0.0.3"] {
            assert!(fleet.ran(host, &format!("--certificate-key {CERTIFICATE_KEY}")));
            assert!(fleet.ran(host, "kubeadm join 10.0.0.100:8443"));
        }
        assert!(
            position(&fleet, "10.0.0.4", "kubeadm reset -f")
                < position(&fleet, "10.0.0.4", "kubeadm join")
        );
        assert!(!fleet.ran("10.0.0.5", "kubeadm reset"));
        assert!(fleet.ran("10.0.0.1", "label node demo-gpu-node-01 gpu=on"));
        assert_eq!(fleet.count("upgrade --install metallb"), 1);
    }

    #[tokio::test]
    async fn test_ha_load_balancer_is_up_before_init() {
        let fleet = fleet();
        let mut confirmer = MockConfirmer::new();
        confirmer.expect_confirm_dangerous().never();

        sequencer(ha(), &fleet, confirmer, CommandContext::for_testing())
            .run()
            .await
            .unwrap();

        let init = position(&fleet, "10.0.0.1", "kubeadm init --config");
        assert!(position(&fleet, "10.0.0.1", "systemctl restart keepalived") < init);
        assert!(position(&fleet, "10.0.0.1", "haproxy -c -q") < init);
        for host in ["10.0.0.2", "10.0.0.3"] {
            assert!(
                position(&fleet, host, "systemctl restart haproxy")
                    < position(&fleet, host, "kubeadm join")
            );
        }
        let keepalived = fleet.uploaded("10.0.0.1", ha::KEEPALIVED_CONFIG_PATH).unwrap();
        assert!(keepalived.contains("state MASTER"));
        // workers never carry the load balancer
        assert!(!fleet.ran("10.0.0.4", "keepalived"));
    }

    #[tokio::test]
    async fn test_single_master_skips_load_balancer() {
        let fleet = fleet();
        let mut confirmer = MockConfirmer::new();
        confirmer.expect_confirm_dangerous().never();

        sequencer(small(), &fleet, confirmer, CommandContext::for_testing())
            .run()
            .await
            .unwrap();

        assert_eq!(fleet.count("keepalived"), 0);
        assert!(fleet.uploaded("10.0.0.1", ha::HAPROXY_CONFIG_PATH).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_api_at_validation_stops_short_of_done() {
        let fleet = fleet();
        let refused = "The connection to the server 10.0.0.1:6443 was refused - did you specify the right host or port?";
        fleet.on(Some("10.0.0.1"), "get nodes -o json", Reply::fail(refused));
        fleet.on(Some("10.0.0.1"), "get pods -n kube-system", Reply::fail(refused));
        let mut confirmer = MockConfirmer::new();
        confirmer.expect_confirm_dangerous().never();

        let mut seq = sequencer(small(), &fleet, confirmer, CommandContext::for_testing());
        let err = seq.run().await.unwrap_err();

        assert_eq!(seq.phase(), Phase::Validating);
        assert!(err.to_string().contains("was refused"));
        // nothing is recorded for a cluster that was never confirmed up
        assert!(!fleet
            .applied("10.0.0.1")
            .iter()
            .any(|m| m.contains("kind: ConfigMap")));
    }

    #[tokio::test]
    async fn test_empty_node_list_fails_validation() {
        let fleet = fleet();
        fleet.on(Some("10.0.0.1"), "get nodes -o json", Reply::ok(r#"{"items": []}"#));
        let mut confirmer = MockConfirmer::new();
        confirmer.expect_confirm_dangerous().never();

        let mut seq = sequencer(small(), &fleet, confirmer, CommandContext::for_testing());
        let err = seq.run().await.unwrap_err();

        assert_eq!(seq.phase(), Phase::Validating);
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_worker_failure_is_aggregated_and_stops_in_phase() {
        let fleet = fleet();
        fleet.on(Some("10.0.0.3"), "kubeadm join", Reply::fail("preflight failed"));
        let mut confirmer = MockConfirmer::new();
        confirmer.expect_confirm_dangerous().never();

        let mut seq = sequencer(small(), &fleet, confirmer, CommandContext::for_testing());
        let err = seq.run().await.unwrap_err();

        assert_eq!(seq.phase(), Phase::WorkersJoining);
        assert_eq!(err.failed_nodes(), vec!["demo-node-02"]);
        // the sibling still joined
        assert!(fleet.ran("10.0.0.2", "kubeadm join"));
        assert!(!fleet.ran("10.0.0.1", "label node"));
    }

    #[tokio::test]
    async fn test_state_save_failure_only_warns() {
        let fleet = fleet();
        fleet.on(Some("10.0.0.1"), "kind: ConfigMap", Reply::fail("webhook unavailable"));
        let mut confirmer = MockConfirmer::new();
        confirmer.expect_confirm_dangerous().never();

        let report = sequencer(small(), &fleet, confirmer, CommandContext::for_testing())
            .run()
            .await
            .unwrap();
        assert!(!report.state_saved);
        assert_eq!(report.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_kubeconfig_export_backs_up_existing_file() {
        let fleet = fleet();
        fleet.on(
            Some("10.0.0.1"),
            "cat /etc/kubernetes/admin.conf",
            Reply::ok("apiVersion: v1\nkind: Config\n"),
        );
        let ctx = CommandContext {
            kubeconfig_out: Some(PathBuf::from("/home/op/.kube/config")),
            ..CommandContext::for_testing()
        };
        let mut confirmer = MockConfirmer::new();
        confirmer.expect_confirm_dangerous().never();

        let report = sequencer(small(), &fleet, confirmer, ctx).run().await.unwrap();

        assert_eq!(report.kubeconfig, Some(PathBuf::from("/home/op/.kube/config")));
        assert!(fleet.ran(
            LOCAL,
            "cp -p /home/op/.kube/config /home/op/.kube/config.backup.demo"
        ));
        assert_eq!(
            fleet.uploaded(LOCAL, "/home/op/.kube/config").as_deref(),
            Some("apiVersion: v1\nkind: Config\n")
        );
    }

    #[tokio::test]
    async fn test_managed_key_setup_runs_unless_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let key = dir.path().join("id_rsa");
        std::fs::write(&key, "private").unwrap();
        std::fs::write(dir.path().join("id_rsa.pub"), "ssh-rsa AAAA kubestrap\n").unwrap();

        let fleet = fleet();
        let mut confirmer = MockConfirmer::new();
        confirmer.expect_confirm_dangerous().never();
        let ctx = CommandContext {
            skip_ssh_setup: false,
            managed_key: key,
            ..CommandContext::for_testing()
        };

        sequencer(small(), &fleet, confirmer, ctx).run().await.unwrap();
        for host in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            assert!(fleet.ran(host, "'ssh-rsa AAAA kubestrap' >> /root/.ssh/authorized_keys"));
        }
        // pair already present, nothing generated
        assert!(!fleet.ran(LOCAL, "ssh-keygen"));
    }

    #[test]
    fn test_phase_order() {
        assert_eq!(Phase::Unconfigured.number(), 1);
        assert_eq!(Phase::Done.number(), 9);
        assert!(Phase::OtherMastersJoining < Phase::AddonsInstalling);
        assert_eq!(Phase::GpuTagging.to_string(), "GPUTagging");
    }
}
