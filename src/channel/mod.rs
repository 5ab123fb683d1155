//! Command channels
//!
//! A [`CommandChannel`] runs shell commands against one host and uploads files to
//! it. Two variants exist:
//! - [`LocalChannel`] runs commands on this machine
//! - [`SshChannel`] runs commands on a remote machine, reconnecting through the
//!   credential strategies on transport failures and retrying the command
//!
//! Orchestration code only sees the trait, and obtains per-node channels from a
//! [`ChannelFactory`] so every concurrent task owns its own instance.

mod local;
mod ssh;
mod strategy;
mod transport;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

pub use local::LocalChannel;
pub use ssh::SshChannel;
pub use strategy::{connect_with_strategies, credential_chain, Credential, CredentialKind};
pub use transport::{CommandOutput, OpenSshTransport, Session, SshTarget, Transport};

use crate::context::Timings;
use crate::spec::NodeSpec;
use crate::Result;

/// Runs commands and uploads files on one host
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CommandChannel: Send + Sync {
    /// Host this channel talks to, for logs and errors
    fn host(&self) -> String;

    /// Run a shell command and return its standard output.
    ///
    /// A nonzero exit is an [`Error::RemoteCommand`](crate::Error::RemoteCommand)
    /// carrying the captured error stream.
    async fn execute(&self, command: &str) -> Result<String>;

    /// Write `contents` to `remote_path` with the given permission bits,
    /// creating parent directories
    async fn upload(&self, contents: &[u8], remote_path: &str, mode: u32) -> Result<()>;

    /// Drop any open session
    async fn close(&self);
}

/// Creates a fresh channel per node
pub trait ChannelFactory: Send + Sync {
    /// Open (lazily) a channel to `node`
    fn channel(&self, node: &NodeSpec) -> Arc<dyn CommandChannel>;
}

/// Factory producing [`SshChannel`]s over one shared transport
pub struct SshChannelFactory {
    transport: Arc<dyn Transport>,
    managed_key: PathBuf,
    timings: Timings,
}

impl SshChannelFactory {
    /// Create a factory; `managed_key` is tried first as root on every node
    pub fn new(transport: Arc<dyn Transport>, managed_key: PathBuf, timings: Timings) -> Self {
        Self {
            transport,
            managed_key,
            timings,
        }
    }
}

impl ChannelFactory for SshChannelFactory {
    fn channel(&self, node: &NodeSpec) -> Arc<dyn CommandChannel> {
        let target = SshTarget {
            host: node.ip.clone(),
            port: node.ssh.port,
        };
        let strategies = credential_chain(&node.ssh, &self.managed_key);
        Arc::new(SshChannel::new(
            target,
            strategies,
            self.transport.clone(),
            self.timings.channel_retry.clone(),
        ))
    }
}

/// Quote a string for safe interpolation into a POSIX shell command
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Parent directory of a remote path, for `mkdir -p`
pub(crate) fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("plain", "plain")]
    #[case("/etc/kubernetes/admin.conf", "/etc/kubernetes/admin.conf")]
    #[case("two words", "'two words'")]
    #[case("it's", r"'it'\''s'")]
    #[case("", "''")]
    #[case("$(rm -rf /)", "'$(rm -rf /)'")]
    fn test_shell_quote(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(shell_quote(input), expected);
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/tmp/x.yaml"), "/tmp");
        assert_eq!(parent_dir("/x"), "/");
        assert_eq!(parent_dir("x"), ".");
    }
}
