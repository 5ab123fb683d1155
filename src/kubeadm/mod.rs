//! kubeadm: init configuration, init/join/reset commands and join credentials
//!
//! The init configuration is rendered from [`InitParams`]; every value goes
//! through `tojson`, so the document stays well-formed whatever the input.
//!
//! Join credentials are issued once per bootstrap run on the first master and
//! consumed by every join in that run:
//! - a bootstrap token registered with a 24h TTL
//! - the CA fingerprint (`sha256:` of the CA certificate's SubjectPublicKeyInfo)
//! - the certificate key from `upload-certs`, only when other masters will join

mod token;

pub use token::BootstrapToken;

use aws_lc_rs::digest::{digest, SHA256};
#[cfg(test)]
use mockall::automock;
use minijinja::Environment;
use serde::Serialize;
use tracing::{debug, info};

use crate::channel::{shell_quote, CommandChannel};
use crate::spec::{ClusterConfig, NodeSpec};
use crate::{Error, Result, CRI_SOCKET};

/// Where the rendered init configuration is uploaded on the first master
pub const INIT_CONFIG_PATH: &str = "/tmp/kubestrap/kubeadm-init.yaml";

/// CA certificate on control-plane nodes
pub const CA_CERT_PATH: &str = "/etc/kubernetes/pki/ca.crt";

/// TTL passed to `kubeadm token create`
pub const TOKEN_TTL: &str = "24h";

const INIT_TEMPLATE: &str = r#"apiVersion: kubeadm.k8s.io/v1beta4
kind: InitConfiguration
localAPIEndpoint:
  advertiseAddress: {{ local_ip|tojson }}
  bindPort: {{ api_port }}
nodeRegistration:
  name: {{ node_name|tojson }}
  criSocket: {{ cri_socket|tojson }}
---
apiVersion: kubeadm.k8s.io/v1beta4
kind: ClusterConfiguration
clusterName: {{ cluster_name|tojson }}
kubernetesVersion: {{ version|tojson }}
imageRepository: {{ image_repository|tojson }}
controlPlaneEndpoint: {{ endpoint|tojson }}
networking:
  podSubnet: {{ pod_subnet|tojson }}
  serviceSubnet: {{ service_subnet|tojson }}
apiServer:
  certSANs:
{% for san in cert_sans %}
    - {{ san|tojson }}
{% endfor %}
---
apiVersion: kubelet.config.k8s.io/v1beta1
kind: KubeletConfiguration
cgroupDriver: systemd
"#;

/// Full reset of a control-plane or worker node, used before a confirmed re-init
pub const RESET_SCRIPT: &str = r#"set -u
systemctl stop kubelet 2>/dev/null || true
kubeadm reset -f --cri-socket unix:///var/run/containerd/containerd.sock 2>/dev/null || true
for p in kube-apiserver kube-controller-manager kube-scheduler etcd; do pkill -9 -x "$p" 2>/dev/null || true; done
rm -rf /etc/kubernetes/* /var/lib/etcd/* /var/lib/kubelet/*
for link in cni0 flannel.1 $(ip -o link show | awk -F': ' '{print $2}' | cut -d@ -f1 | grep '^cilium_' || true); do
  ip link delete "$link" 2>/dev/null || true
done
systemctl restart containerd
"#;

/// Typed parameters for the init configuration
#[derive(Debug, Clone, Serialize)]
pub struct InitParams {
    /// Cluster name
    pub cluster_name: String,
    /// Kubernetes version
    pub version: String,
    /// Image registry
    pub image_repository: String,
    /// Control-plane endpoint (`host:port`)
    pub endpoint: String,
    /// Address the first master advertises
    pub local_ip: String,
    /// First master node name
    pub node_name: String,
    /// Pod network CIDR
    pub pod_subnet: String,
    /// Service network CIDR
    pub service_subnet: String,
    /// API server certificate SANs
    pub cert_sans: Vec<String>,
    /// CRI socket
    pub cri_socket: String,
    /// API server bind port
    pub api_port: u16,
}

impl InitParams {
    /// Parameters for initializing `first_master` of `config`
    pub fn from_config(config: &ClusterConfig, first_master: &NodeSpec) -> Result<Self> {
        let endpoint = config
            .control_plane_endpoint()
            .ok_or_else(|| Error::validation("cluster has no control-plane endpoint"))?;
        Ok(Self {
            cluster_name: config.name().to_string(),
            version: config.spec.version.clone(),
            image_repository: config.spec.image_repository.clone(),
            endpoint,
            local_ip: first_master.ip.clone(),
            node_name: first_master.hostname.clone(),
            pod_subnet: config.spec.networking.pod_subnet.clone(),
            service_subnet: config.spec.networking.service_subnet.clone(),
            cert_sans: config.cert_sans(),
            cri_socket: CRI_SOCKET.to_string(),
            api_port: crate::API_SERVER_PORT,
        })
    }
}

/// Render the InitConfiguration/ClusterConfiguration/KubeletConfiguration document
pub fn render_init_config(params: &InitParams) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.add_template("kubeadm-init", INIT_TEMPLATE)?;
    Ok(env.get_template("kubeadm-init")?.render(params)?)
}

/// `kubeadm init` against the uploaded configuration, without the kube-proxy addon
pub fn init_command() -> String {
    format!("kubeadm init --config {INIT_CONFIG_PATH} --skip-phases=addon/kube-proxy")
}

/// Everything a node needs to join the cluster
#[derive(Clone, PartialEq, Eq)]
pub struct JoinCredential {
    /// Bootstrap token
    pub token: BootstrapToken,
    /// `sha256:<hex>` of the CA public key
    pub ca_cert_hash: String,
    /// Control-plane certificate key, present when masters will join
    pub certificate_key: Option<String>,
    /// Control-plane endpoint (`host:port`)
    pub endpoint: String,
}

impl std::fmt::Debug for JoinCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinCredential")
            .field("token", &self.token)
            .field("ca_cert_hash", &self.ca_cert_hash)
            .field(
                "certificate_key",
                &self.certificate_key.as_ref().map(|_| "<redacted>"),
            )
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl JoinCredential {
    /// `kubeadm join` for a worker
    pub fn worker_join_command(&self, node: &NodeSpec) -> String {
        format!(
            "kubeadm join {} --token {} --discovery-token-ca-cert-hash {} --cri-socket {} --node-name {}",
            self.endpoint,
            self.token,
            self.ca_cert_hash,
            CRI_SOCKET,
            shell_quote(&node.hostname)
        )
    }

    /// `kubeadm join --control-plane` for an additional master
    pub fn master_join_command(&self, node: &NodeSpec) -> Result<String> {
        let key = self.certificate_key.as_deref().ok_or_else(|| {
            Error::credential_extraction("master join requires a certificate key")
        })?;
        Ok(format!(
            "{} --control-plane --certificate-key {} --apiserver-advertise-address {}",
            self.worker_join_command(node),
            key,
            shell_quote(&node.ip)
        ))
    }
}

/// Extracts the certificate key from `upload-certs` output.
///
/// kubeadm prints the key as free-form text; the format is not a stable interface,
/// so parsing sits behind this trait.
#[cfg_attr(test, automock)]
pub trait CertificateKeyParser: Send + Sync {
    /// Return the key, or [`Error::CredentialExtraction`] when none is present
    fn parse(&self, output: &str) -> Result<String>;
}

/// Parses `[upload-certs] Using certificate key:\n<hex>` output
#[derive(Debug, Default, Clone, Copy)]
pub struct UploadCertsOutputParser;

impl CertificateKeyParser for UploadCertsOutputParser {
    fn parse(&self, output: &str) -> Result<String> {
        const NEEDLE: &str = "certificate key:";
        let lowered = output.to_ascii_lowercase();
        let start = lowered
            .find(NEEDLE)
            .map(|i| i + NEEDLE.len())
            .ok_or_else(|| {
                Error::credential_extraction("no certificate key in upload-certs output")
            })?;

        let rest = output[start..].trim_start();
        let key: String = rest
            .chars()
            .take_while(|c| c.is_ascii_digit() || ('a'..='f').contains(c))
            .collect();

        if key.is_empty() {
            return Err(Error::credential_extraction(
                "certificate key marker present but no key followed it",
            ));
        }
        Ok(key)
    }
}

/// `sha256:<hex>` over the DER SubjectPublicKeyInfo of a PEM certificate
pub fn ca_cert_hash_from_pem(pem: &str) -> Result<String> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
        .map_err(|e| Error::credential_extraction(format!("invalid CA PEM: {e}")))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::credential_extraction(format!("invalid CA certificate: {e}")))?;

    let hash = digest(&SHA256, cert.public_key().raw);
    let hex: String = hash.as_ref().iter().map(|b| format!("{b:02x}")).collect();
    Ok(format!("sha256:{hex}"))
}

/// True when `path` exists on the channel's host
pub async fn file_exists(channel: &dyn CommandChannel, path: &str) -> Result<bool> {
    match channel.execute(&format!("test -f {}", shell_quote(path))).await {
        Ok(_) => Ok(true),
        Err(Error::RemoteCommand { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Create the join credential on the first master
pub async fn issue_join_credential(
    channel: &dyn CommandChannel,
    endpoint: &str,
    with_certificate_key: bool,
    parser: &dyn CertificateKeyParser,
) -> Result<JoinCredential> {
    let token = BootstrapToken::generate()?;
    channel
        .execute(&format!("kubeadm token create {token} --ttl {TOKEN_TTL}"))
        .await?;
    debug!(token_id = token.id(), "bootstrap token registered");

    let pem = channel
        .execute(&format!("cat {CA_CERT_PATH}"))
        .await?;
    let ca_cert_hash = ca_cert_hash_from_pem(&pem)?;

    let certificate_key = if with_certificate_key {
        let output = channel
            .execute("kubeadm init phase upload-certs --upload-certs")
            .await?;
        Some(parser.parse(&output)?)
    } else {
        None
    };

    info!(
        ca_cert_hash = %ca_cert_hash,
        certificate_key = certificate_key.is_some(),
        "join credential issued"
    );

    Ok(JoinCredential {
        token,
        ca_cert_hash,
        certificate_key,
        endpoint: endpoint.to_string(),
    })
}
