//! Scripted in-memory fleet for sequencer, provisioner and reconciler tests
//!
//! Every channel handed out records the commands and uploads it sees per host.
//! Replies come from rules matched by substring: rules added with
//! [`FakeFleet::on`] win over the built-in defaults, newest first. The defaults
//! describe a fresh machine on which every tool succeeds. A command naming a
//! staged manifest file is matched together with that file's contents, so a
//! rule on `kind: Secret` fires for the `kubectl apply` that reads it.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::channel::{ChannelFactory, CommandChannel};
use crate::kubectl::MANIFEST_PREFIX;
use crate::provision::{Artifact, ArtifactStore};
use crate::spec::{ClusterConfig, NodeSpec};
use crate::{state, Error, Result, MANAGED_LABEL};

/// Scripted reply to a command
#[derive(Debug, Clone)]
pub enum Reply {
    /// Exit 0 with this output
    Ok(String),
    /// Exit 1 with this error stream
    Fail(String),
    /// Transport failure
    Connection(String),
}

impl Reply {
    pub fn ok(out: &str) -> Self {
        Self::Ok(out.to_string())
    }

    pub fn fail(stderr: &str) -> Self {
        Self::Fail(stderr.to_string())
    }

    pub fn connection(message: &str) -> Self {
        Self::Connection(message.to_string())
    }
}

#[derive(Debug, Clone)]
struct Rule {
    host: Option<String>,
    pattern: String,
    reply: Reply,
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub host: String,
    pub path: String,
    pub contents: Vec<u8>,
}

#[derive(Debug, Default)]
struct FleetState {
    rules: Vec<Rule>,
    defaults: Vec<Rule>,
    commands: Vec<(String, String)>,
    uploads: Vec<Upload>,
}

/// Shared recorder and reply script for a set of fake hosts
#[derive(Debug, Clone)]
pub struct FakeFleet {
    state: Arc<Mutex<FleetState>>,
}

pub const CERTIFICATE_KEY: &str = "abc123def4567890abc123def4567890abc123def4567890abc123def4567890";

fn ca_pem() -> String {
    let key = rcgen::KeyPair::generate().unwrap();
    let mut params = rcgen::CertificateParams::new(Vec::<String>::new()).unwrap();
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    params.self_signed(&key).unwrap().pem()
}

impl FakeFleet {
    pub fn new() -> Self {
        let default = |pattern: &str, reply: Reply| Rule {
            host: None,
            pattern: pattern.to_string(),
            reply,
        };
        let defaults = vec![
            default("test -f ", Reply::fail("")),
            default("kubeadm version", Reply::fail("kubeadm: command not found")),
            default("cat /etc/kubernetes/pki/ca.crt", Reply::Ok(ca_pem())),
            default(
                "upload-certs",
                Reply::Ok(format!(
                    "[upload-certs] Storing the certificates in Secret \"kubeadm-certs\"\n\
                     [upload-certs] Using certificate key:\n{CERTIFICATE_KEY}\n"
                )),
            ),
            default("get --raw=/readyz", Reply::ok("ok")),
            default("numberReady", Reply::ok("3/3")),
            default(
                "daemonset/kube-proxy",
                Reply::fail("Error from server (NotFound): daemonsets.apps \"kube-proxy\" not found"),
            ),
            default("gatewayclass/cilium", Reply::ok("True")),
            default("gateway/default-gateway", Reply::ok("10.0.0.200")),
        ];
        Self {
            state: Arc::new(Mutex::new(FleetState {
                defaults,
                ..Default::default()
            })),
        }
    }

    /// Reply to commands containing `pattern`, on one host or all of them
    pub fn on(&self, host: Option<&str>, pattern: &str, reply: Reply) {
        self.state.lock().unwrap().rules.push(Rule {
            host: host.map(str::to_string),
            pattern: pattern.to_string(),
            reply,
        });
    }

    /// A channel to `host` recording into this fleet
    pub fn channel_for(&self, host: &str) -> Arc<dyn CommandChannel> {
        Arc::new(FakeChannel {
            host: host.to_string(),
            fleet: self.clone(),
        })
    }

    /// Commands run on `host`, in order
    pub fn commands(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(h, _)| h == host)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// True when some command on `host` contained `needle`
    pub fn ran(&self, host: &str, needle: &str) -> bool {
        self.commands(host).iter().any(|c| c.contains(needle))
    }

    /// Commands containing `needle` across every host
    pub fn count(&self, needle: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .commands
            .iter()
            .filter(|(_, c)| c.contains(needle))
            .count()
    }

    /// Every command run anywhere
    pub fn command_total(&self) -> usize {
        self.state.lock().unwrap().commands.len()
    }

    /// Paths uploaded to `host`, in order
    pub fn uploaded_paths(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .uploads
            .iter()
            .filter(|u| u.host == host)
            .map(|u| u.path.clone())
            .collect()
    }

    /// Manifests staged for `kubectl apply` on `host`, in order
    pub fn applied(&self, host: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .uploads
            .iter()
            .filter(|u| u.host == host && u.path.starts_with(MANIFEST_PREFIX))
            .map(|u| String::from_utf8_lossy(&u.contents).into_owned())
            .collect()
    }

    /// Last contents uploaded to `host` at `path`
    pub fn uploaded(&self, host: &str, path: &str) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .uploads
            .iter()
            .rev()
            .find(|u| u.host == host && u.path == path)
            .map(|u| String::from_utf8_lossy(&u.contents).into_owned())
    }

    fn reply(&self, host: &str, command: &str) -> Reply {
        let mut state = self.state.lock().unwrap();
        state.commands.push((host.to_string(), command.to_string()));

        let mut subject = command.to_string();
        if let Some(staged) = state
            .uploads
            .iter()
            .rev()
            .find(|u| {
                u.host == host && u.path.starts_with(MANIFEST_PREFIX) && command.contains(&u.path)
            })
        {
            subject.push('\n');
            subject.push_str(&String::from_utf8_lossy(&staged.contents));
        }

        let matches = |r: &&Rule| {
            subject.contains(&r.pattern) && r.host.as_deref().map_or(true, |h| h == host)
        };
        state
            .rules
            .iter()
            .rev()
            .find(matches)
            .or_else(|| state.defaults.iter().find(matches))
            .map(|r| r.reply.clone())
            .unwrap_or_else(|| Reply::ok(""))
    }
}

impl ChannelFactory for FakeFleet {
    fn channel(&self, node: &NodeSpec) -> Arc<dyn CommandChannel> {
        self.channel_for(&node.ip)
    }
}

struct FakeChannel {
    host: String,
    fleet: FakeFleet,
}

#[async_trait]
impl CommandChannel for FakeChannel {
    fn host(&self) -> String {
        self.host.clone()
    }

    async fn execute(&self, command: &str) -> Result<String> {
        match self.fleet.reply(&self.host, command) {
            Reply::Ok(out) => Ok(out),
            Reply::Fail(stderr) => Err(Error::RemoteCommand {
                host: self.host.clone(),
                command: command.to_string(),
                code: Some(1),
                stderr,
            }),
            Reply::Connection(message) => Err(Error::connection(&self.host, message)),
        }
    }

    async fn upload(&self, contents: &[u8], remote_path: &str, _mode: u32) -> Result<()> {
        self.fleet.state.lock().unwrap().uploads.push(Upload {
            host: self.host.clone(),
            path: remote_path.to_string(),
            contents: contents.to_vec(),
        });
        Ok(())
    }

    async fn close(&self) {}
}

/// Artifact store returning a short placeholder for every artifact
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeArtifacts;

#[async_trait]
impl ArtifactStore for FakeArtifacts {
    async fn fetch(&self, artifact: Artifact) -> Result<Vec<u8>> {
        Ok(format!("artifact:{artifact}").into_bytes())
    }
}

/// `kubectl get nodes -o json` output; `true` marks a node as managed
pub fn nodes_json(nodes: &[(&str, bool)]) -> String {
    let items: Vec<serde_json::Value> = nodes
        .iter()
        .map(|(name, managed)| {
            let labels = if *managed {
                serde_json::json!({ MANAGED_LABEL: "true" })
            } else {
                serde_json::json!({})
            };
            serde_json::json!({
                "metadata": { "name": name, "labels": labels },
                "status": { "conditions": [] }
            })
        })
        .collect();
    serde_json::json!({ "items": items }).to_string()
}

/// `kubectl get configmap -o json` output of a stored spec
pub fn stored_config_json(config: &ClusterConfig) -> String {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": state::CONFIG_MAP },
        "data": { (state::DATA_KEY): serde_yaml::to_string(&config.sanitized()).unwrap() },
    })
    .to_string()
}
