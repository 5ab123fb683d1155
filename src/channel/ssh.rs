//! Remote command channel
//!
//! Opens its session lazily on first use. Transport failures drop the session,
//! reconnect through the credential strategies and retry the command; a command
//! that ran and exited nonzero is never retried.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::strategy::{connect_with_strategies, Credential};
use super::transport::{Session, SshTarget, Transport};
use super::{parent_dir, shell_quote, CommandChannel};
use crate::retry::{retry_if, RetryConfig};
use crate::{Error, Result};

struct ActiveSession {
    credential: Credential,
    session: Box<dyn Session>,
}

/// Command channel to one remote host
pub struct SshChannel {
    target: SshTarget,
    strategies: Vec<Credential>,
    transport: Arc<dyn Transport>,
    retry: RetryConfig,
    active: Mutex<Option<ActiveSession>>,
}

impl SshChannel {
    /// Create an unconnected channel
    pub fn new(
        target: SshTarget,
        strategies: Vec<Credential>,
        transport: Arc<dyn Transport>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            target,
            strategies,
            transport,
            retry,
            active: Mutex::new(None),
        }
    }

    /// Credential the current session authenticated with, if connected
    pub async fn credential(&self) -> Option<Credential> {
        self.active.lock().await.as_ref().map(|a| a.credential.clone())
    }

    async fn run_once(&self, command: &str, stdin: Option<&[u8]>) -> Result<String> {
        let mut guard = self.active.lock().await;

        if guard.is_none() {
            let (credential, session) =
                connect_with_strategies(self.transport.as_ref(), &self.target, &self.strategies)
                    .await?;
            *guard = Some(ActiveSession {
                credential,
                session,
            });
        }
        let Some(active) = guard.as_ref() else {
            return Err(Error::connection(&self.target.host, "session unavailable"));
        };

        let (wrapped, input) = escalate(&active.credential, command, stdin);
        match active.session.run(&wrapped, input).await {
            Ok(output) if output.success() => Ok(output.stdout),
            Ok(output) => Err(Error::RemoteCommand {
                host: self.target.host.clone(),
                command: command.to_string(),
                code: output.code,
                stderr: output.stderr,
            }),
            Err(e) => {
                if e.is_connection() {
                    debug!(host = %self.target.host, error = %e, "dropping broken session");
                    if let Some(active) = guard.take() {
                        active.session.close().await;
                    }
                }
                Err(e)
            }
        }
    }
}

/// Wrap a command so it runs as root for the authenticated user.
///
/// Password sessions feed the password to `sudo -S` ahead of any payload.
fn escalate(credential: &Credential, command: &str, stdin: Option<&[u8]>) -> (String, Option<Vec<u8>>) {
    if !credential.needs_escalation() {
        return (command.to_string(), stdin.map(<[u8]>::to_vec));
    }

    let quoted = shell_quote(command);
    match &credential.password {
        Some(password) => {
            let mut input = format!("{password}\n").into_bytes();
            if let Some(bytes) = stdin {
                input.extend_from_slice(bytes);
            }
            (format!("sudo -S -p '' bash -c {quoted}"), Some(input))
        }
        None => (
            format!("sudo -n bash -c {quoted}"),
            stdin.map(<[u8]>::to_vec),
        ),
    }
}

#[async_trait]
impl CommandChannel for SshChannel {
    fn host(&self) -> String {
        self.target.host.clone()
    }

    async fn execute(&self, command: &str) -> Result<String> {
        retry_if(&self.retry, "ssh command", Error::is_connection, || {
            self.run_once(command, None)
        })
        .await
    }

    async fn upload(&self, contents: &[u8], remote_path: &str, mode: u32) -> Result<()> {
        let path = shell_quote(remote_path);
        let command = format!(
            "mkdir -p {} && cat > {path} && chmod {mode:o} {path}",
            shell_quote(parent_dir(remote_path)),
        );

        retry_if(&self.retry, "ssh upload", Error::is_connection, || {
            self.run_once(&command, Some(contents))
        })
        .await
        .map(|_| ())
        .map_err(|e| match e {
            Error::RemoteCommand { stderr, .. } => Error::Upload {
                host: self.target.host.clone(),
                path: remote_path.to_string(),
                message: stderr.trim().to_string(),
            },
            other => other,
        })
    }

    async fn close(&self) {
        if let Some(active) = self.active.lock().await.take() {
            active.session.close().await;
        }
    }
}
