//! SSH transport seam
//!
//! [`Transport`] opens authenticated [`Session`]s; [`OpenSshTransport`] is the real
//! implementation and drives the system `ssh` client with a per-host control
//! master so repeated commands reuse one authenticated connection.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::strategy::Credential;
use crate::{Error, Result};

/// Where to connect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// Address or hostname
    pub host: String,
    /// SSH port
    pub port: u16,
}

/// Result of a command that ran to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Captured standard output
    pub stdout: String,
    /// Captured error stream
    pub stderr: String,
}

impl CommandOutput {
    /// True for exit code zero
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Opens authenticated sessions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    /// Authenticate to `target` with one credential.
    ///
    /// Rejected credentials are [`Error::Authentication`]; unreachable hosts
    /// and dropped transports are [`Error::Connection`].
    async fn connect(&self, target: &SshTarget, credential: &Credential)
        -> Result<Box<dyn Session>>;
}

/// An authenticated session to one host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Session: Send + Sync {
    /// Run a command, feeding `stdin` if given.
    ///
    /// Returns `Ok` whenever the command ran, whatever its exit code. `Err` is
    /// reserved for transport failures.
    async fn run(&self, command: &str, stdin: Option<Vec<u8>>) -> Result<CommandOutput>;

    /// Tear the session down
    async fn close(&self);
}

const CONNECTION_PATTERNS: &[&str] = &[
    "Connection reset",
    "Broken pipe",
    "Connection closed",
    "Connection refused",
    "Connection timed out",
    "timed out",
    "No route to host",
    "Could not resolve hostname",
    "unexpected EOF",
    "mux_client",
    "Control socket",
];

/// Classify a failed `ssh` invocation from its exit code and error stream.
///
/// `ssh` reports its own failures as exit 255; any other code came from the
/// remote command and is returned as `None`.
pub(crate) fn classify_ssh_failure(host: &str, code: Option<i32>, stderr: &str) -> Option<Error> {
    if code != Some(255) {
        return None;
    }
    let message = stderr.trim();
    if message.contains("Permission denied") || message.contains("Too many authentication failures")
    {
        return Some(Error::authentication(host, message));
    }
    if CONNECTION_PATTERNS.iter().any(|p| message.contains(p)) || message.is_empty() {
        return Some(Error::connection(host, message));
    }
    None
}

/// Spawn a process, feed it stdin and collect its output
pub(crate) async fn run_process(
    program: &str,
    args: &[String],
    env: &[(&str, &str)],
    stdin: Option<Vec<u8>>,
) -> std::io::Result<CommandOutput> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        command.env(key, value);
    }

    let mut child = command.spawn()?;

    if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(&bytes).await?;
        pipe.shutdown().await?;
        drop(pipe);
    }

    let output = child.wait_with_output().await?;
    Ok(CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

/// Transport backed by the system `ssh` client
pub struct OpenSshTransport {
    control_dir: PathBuf,
    connect_timeout_secs: u64,
}

impl OpenSshTransport {
    /// Create a transport keeping control sockets under `control_dir`
    pub fn new(control_dir: PathBuf, connect_timeout: std::time::Duration) -> Result<Self> {
        std::fs::create_dir_all(&control_dir)?;
        Ok(Self {
            control_dir,
            connect_timeout_secs: connect_timeout.as_secs().max(1),
        })
    }

    /// Create a transport with control sockets in a per-process temp directory
    pub fn with_default_control_dir(connect_timeout: std::time::Duration) -> Result<Self> {
        let dir = std::env::temp_dir().join(format!("kubestrap-ssh-{}", std::process::id()));
        Self::new(dir, connect_timeout)
    }

    fn base_args(&self, target: &SshTarget, credential: &Credential) -> Vec<String> {
        let mut args: Vec<String> = [
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
            "ControlMaster=auto",
            "-o",
            "ControlPersist=600",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("-o".to_string());
        args.push(format!(
            "ControlPath={}/%C",
            self.control_dir.display()
        ));
        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", self.connect_timeout_secs));
        args.push("-p".to_string());
        args.push(target.port.to_string());

        match (&credential.key_file, &credential.password) {
            (Some(key), _) => {
                args.extend(
                    ["-o", "BatchMode=yes", "-o", "IdentitiesOnly=yes", "-i"]
                        .iter()
                        .map(|s| s.to_string()),
                );
                args.push(key.display().to_string());
            }
            (None, Some(_)) => {
                args.extend(
                    [
                        "-o",
                        "PubkeyAuthentication=no",
                        "-o",
                        "PreferredAuthentications=password,keyboard-interactive",
                        "-o",
                        "NumberOfPasswordPrompts=1",
                    ]
                    .iter()
                    .map(|s| s.to_string()),
                );
            }
            (None, None) => args.extend(["-o", "BatchMode=yes"].iter().map(|s| s.to_string())),
        }

        args.push(format!("{}@{}", credential.user, target.host));
        args
    }
}

#[async_trait]
impl Transport for OpenSshTransport {
    async fn connect(
        &self,
        target: &SshTarget,
        credential: &Credential,
    ) -> Result<Box<dyn Session>> {
        let session = OpenSshSession {
            host: target.host.clone(),
            args: self.base_args(target, credential),
            password: credential.password.clone(),
        };

        // Authenticate once; the control master keeps the connection for later commands
        let probe = session.ssh(vec!["true".to_string()], None).await?;
        if !probe.success() {
            return Err(
                classify_ssh_failure(&target.host, probe.code, &probe.stderr).unwrap_or_else(
                    || Error::authentication(&target.host, probe.stderr.trim().to_string()),
                ),
            );
        }

        debug!(host = %target.host, user = %credential.user, kind = %credential.kind, "SSH session established");
        Ok(Box::new(session))
    }
}

struct OpenSshSession {
    host: String,
    args: Vec<String>,
    password: Option<String>,
}

impl OpenSshSession {
    async fn invoke(&self, args: Vec<String>, stdin: Option<Vec<u8>>) -> Result<CommandOutput> {
        let output = match &self.password {
            Some(password) => {
                let mut full = vec!["-e".to_string(), "ssh".to_string()];
                full.extend(args);
                run_process("sshpass", &full, &[("SSHPASS", password.as_str())], stdin).await
            }
            None => run_process("ssh", &args, &[], stdin).await,
        }
        .map_err(|e| Error::connection(&self.host, format!("failed to spawn ssh: {e}")))?;

        Ok(output)
    }

    async fn ssh(&self, extra: Vec<String>, stdin: Option<Vec<u8>>) -> Result<CommandOutput> {
        let mut args = self.args.clone();
        args.extend(extra);
        self.invoke(args, stdin).await
    }
}

#[async_trait]
impl Session for OpenSshSession {
    async fn run(&self, command: &str, stdin: Option<Vec<u8>>) -> Result<CommandOutput> {
        let output = self.ssh(vec![command.to_string()], stdin).await?;
        if !output.success() {
            if let Some(err) = classify_ssh_failure(&self.host, output.code, &output.stderr) {
                return Err(err);
            }
        }
        Ok(output)
    }

    async fn close(&self) {
        // Control operations go before the destination argument
        let mut args = self.args.clone();
        let destination = args.pop().unwrap_or_default();
        args.extend(["-O".to_string(), "exit".to_string(), destination]);

        if let Err(e) = self.invoke(args, None).await {
            debug!(host = %self.host, error = %e, "control master shutdown failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CredentialKind;

    #[test]
    fn test_exit_255_with_reset_is_connection() {
        let err = classify_ssh_failure("h", Some(255), "Connection reset by peer\n").unwrap();
        assert!(err.is_connection());

        let err = classify_ssh_failure("h", Some(255), "client_loop: send disconnect: Broken pipe")
            .unwrap();
        assert!(err.is_connection());
    }

    #[test]
    fn test_permission_denied_is_authentication() {
        let err = classify_ssh_failure(
            "h",
            Some(255),
            "root@h: Permission denied (publickey,password).",
        )
        .unwrap();
        assert!(matches!(err, Error::Authentication { .. }));
    }

    #[test]
    fn test_remote_exit_codes_are_not_transport_failures() {
        assert!(classify_ssh_failure("h", Some(1), "Connection reset").is_none());
        assert!(classify_ssh_failure("h", Some(255), "kubeadm: some remote failure").is_none());
    }

    #[test]
    fn test_key_credential_args() {
        let transport = OpenSshTransport {
            control_dir: PathBuf::from("/tmp/ks"),
            connect_timeout_secs: 30,
        };
        let credential = Credential {
            kind: CredentialKind::ManagedKey,
            user: "root".to_string(),
            key_file: Some(PathBuf::from("/root/.ssh/id_rsa")),
            password: None,
        };
        let target = SshTarget {
            host: "10.0.0.1".to_string(),
            port: 2222,
        };
        let args = transport.base_args(&target, &credential).join(" ");

        assert!(args.contains("ControlPath=/tmp/ks/%C"));
        assert!(args.contains("ConnectTimeout=30"));
        assert!(args.contains("-p 2222"));
        assert!(args.contains("-i /root/.ssh/id_rsa"));
        assert!(args.contains("BatchMode=yes"));
        assert!(args.ends_with("root@10.0.0.1"));
    }

    #[test]
    fn test_password_credential_disables_pubkey() {
        let transport = OpenSshTransport {
            control_dir: PathBuf::from("/tmp/ks"),
            connect_timeout_secs: 30,
        };
        let credential = Credential {
            kind: CredentialKind::Password,
            user: "ops".to_string(),
            key_file: None,
            password: Some("pw".to_string()),
        };
        let target = SshTarget {
            host: "10.0.0.1".to_string(),
            port: 22,
        };
        let args = transport.base_args(&target, &credential);

        assert!(args.contains(&"PubkeyAuthentication=no".to_string()));
        assert!(!args.contains(&"BatchMode=yes".to_string()));
        // The password never appears on the command line
        assert!(!args.iter().any(|a| a == "pw"));
    }

    #[tokio::test]
    async fn test_run_process_feeds_stdin() {
        let output = run_process(
            "bash",
            &["-c".to_string(), "cat; echo err >&2; exit 3".to_string()],
            &[],
            Some(b"hello".to_vec()),
        )
        .await
        .unwrap();

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout, "hello");
        assert_eq!(output.stderr.trim(), "err");
    }
}
