//! Credential strategies
//!
//! A node is reached with the first credential that authenticates, tried in a
//! fixed order:
//! 1. `root` with the managed key (works once access setup has run)
//! 2. the supplied user with the supplied key
//! 3. the supplied user with the supplied password

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::transport::{Session, SshTarget, Transport};
use crate::spec::SshSpec;
use crate::{Error, Result};

/// Which strategy a credential came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// Root with the key this tool manages
    ManagedKey,
    /// The key named in the cluster document
    SuppliedKey,
    /// The password named in the cluster document
    Password,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ManagedKey => write!(f, "managed-key"),
            Self::SuppliedKey => write!(f, "supplied-key"),
            Self::Password => write!(f, "password"),
        }
    }
}

/// One way of logging in
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    /// Strategy this credential belongs to
    pub kind: CredentialKind,
    /// Login user
    pub user: String,
    /// Private key, for key strategies
    pub key_file: Option<PathBuf>,
    /// Password, for the password strategy
    pub password: Option<String>,
}

impl Credential {
    /// True when commands need `sudo` to act as root
    pub fn needs_escalation(&self) -> bool {
        self.user != "root"
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("user", &self.user)
            .field("key_file", &self.key_file)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Build the ordered strategy list for a node
pub fn credential_chain(ssh: &SshSpec, managed_key: &Path) -> Vec<Credential> {
    let mut chain = vec![Credential {
        kind: CredentialKind::ManagedKey,
        user: "root".to_string(),
        key_file: Some(managed_key.to_path_buf()),
        password: None,
    }];

    if let Some(key) = &ssh.key_file {
        let same_as_managed = ssh.user == "root" && key.as_path() == managed_key;
        if !same_as_managed {
            chain.push(Credential {
                kind: CredentialKind::SuppliedKey,
                user: ssh.user.clone(),
                key_file: Some(key.clone()),
                password: None,
            });
        }
    }

    if let Some(password) = &ssh.password {
        chain.push(Credential {
            kind: CredentialKind::Password,
            user: ssh.user.clone(),
            key_file: None,
            password: Some(password.clone()),
        });
    }

    chain
}

/// Try each credential in order and return the first session that authenticates.
///
/// When every strategy fails the result is [`Error::Connection`] if any attempt
/// failed at the transport level (so the caller may retry), otherwise
/// [`Error::Authentication`].
pub async fn connect_with_strategies(
    transport: &dyn Transport,
    target: &SshTarget,
    strategies: &[Credential],
) -> Result<(Credential, Box<dyn Session>)> {
    let mut failures = Vec::with_capacity(strategies.len());
    let mut saw_connection_error = false;

    for credential in strategies {
        match transport.connect(target, credential).await {
            Ok(session) => return Ok((credential.clone(), session)),
            Err(e) => {
                debug!(host = %target.host, strategy = %credential.kind, error = %e, "credential rejected");
                saw_connection_error |= e.is_connection();
                failures.push(format!("{}@{}: {e}", credential.kind, credential.user));
            }
        }
    }

    if failures.is_empty() {
        return Err(Error::authentication(&target.host, "no credentials configured"));
    }

    let summary = failures.join("; ");
    if saw_connection_error {
        Err(Error::connection(&target.host, summary))
    } else {
        Err(Error::authentication(&target.host, summary))
    }
}
