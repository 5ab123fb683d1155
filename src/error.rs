//! Error types for kubestrap

use std::time::Duration;

use thiserror::Error;

use crate::reconcile::ImmutableViolation;

/// Main error type for kubestrap operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Transport-level failure (reset, broken pipe, unexpected EOF). Retryable.
    #[error("connection error to {host}: {message}")]
    Connection {
        /// Host the channel was talking to
        host: String,
        /// Transport error text
        message: String,
    },

    /// Every credential strategy was rejected. Never retried.
    #[error("authentication failed for {host}: {message}")]
    Authentication {
        /// Host the channel was talking to
        host: String,
        /// Per-strategy rejection summary
        message: String,
    },

    /// Command ran and exited nonzero
    #[error("command failed on {host} (exit {}): {}", display_code(.code), .stderr.trim())]
    RemoteCommand {
        /// Host the command ran on
        host: String,
        /// The command line
        command: String,
        /// Exit code, if the process exited normally
        code: Option<i32>,
        /// Captured error stream
        stderr: String,
    },

    /// File upload failed
    #[error("upload to {host}:{path} failed: {message}")]
    Upload {
        /// Destination host
        host: String,
        /// Destination path
        path: String,
        /// Failure reason
        message: String,
    },

    /// Cluster spec rejected before any remote action
    #[error("validation error: {0}")]
    Validation(String),

    /// One or more frozen fields changed
    #[error("immutable fields cannot be changed: {}", join_display(.0))]
    ImmutableFields(Vec<ImmutableViolation>),

    /// Cluster was not created by this tool
    #[error("ownership check failed: {0}")]
    Ownership(String),

    /// A join secret could not be obtained
    #[error("credential extraction failed: {0}")]
    CredentialExtraction(String),

    /// A bounded wait ran out
    #[error("timed out after {timeout:?} waiting for {what}")]
    PollTimeout {
        /// What was being waited for
        what: String,
        /// The wait budget
        timeout: Duration,
    },

    /// The operator declined a confirmation
    #[error("operation cancelled by user")]
    UserCancelled,

    /// Aggregate of per-node failures from a fan-out batch
    #[error("{phase} failed on {} node(s): {}", .failures.len(), join_display(.failures))]
    NodeFailures {
        /// Phase the batch was running
        phase: String,
        /// One entry per failed node, in spec order
        failures: Vec<NodeFailure>,
    },

    /// Error localized to one node and phase
    #[error("[{node}] {phase}: {source}")]
    Node {
        /// Node hostname
        node: String,
        /// Phase name
        phase: String,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Template rendering error
    #[error("template error: {0}")]
    Template(String),

    /// Persisted state is unreadable or inconsistent
    #[error("state error: {0}")]
    State(String),

    /// Offline artifact missing or unreadable
    #[error("artifact error: {0}")]
    Artifact(String),

    /// A fan-out task panicked or was aborted before reporting
    #[error("task aborted: {0}")]
    Task(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// API server and helm wording for an absent object
const NOT_FOUND_MARKERS: &[&str] = &["(NotFound)", "release: not found"];

/// A single node's failure inside a fan-out batch
#[derive(Debug)]
pub struct NodeFailure {
    /// Node hostname
    pub node: String,
    /// What went wrong
    pub error: Error,
}

impl std::fmt::Display for NodeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.error {
            // already prefixed with the node
            Error::Node { node, .. } if *node == self.node => write!(f, "{}", self.error),
            _ => write!(f, "{} ({})", self.node, self.error),
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

fn join_display<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a state error with the given message
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create an ownership error with the given message
    pub fn ownership(msg: impl Into<String>) -> Self {
        Self::Ownership(msg.into())
    }

    /// Create a credential extraction error with the given message
    pub fn credential_extraction(msg: impl Into<String>) -> Self {
        Self::CredentialExtraction(msg.into())
    }

    /// Create an artifact error with the given message
    pub fn artifact(msg: impl Into<String>) -> Self {
        Self::Artifact(msg.into())
    }

    /// Create a connection error
    pub fn connection(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn authentication(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Authentication {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Create a poll timeout error
    pub fn poll_timeout(what: impl Into<String>, timeout: Duration) -> Self {
        Self::PollTimeout {
            what: what.into(),
            timeout,
        }
    }

    /// Wrap an error with the node and phase it happened in
    pub fn node(node: impl Into<String>, phase: impl Into<String>, source: Error) -> Self {
        Self::Node {
            node: node.into(),
            phase: phase.into(),
            source: Box::new(source),
        }
    }

    /// True for transport failures that warrant a reconnect and retry
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Connection { .. } => true,
            Self::Node { source, .. } => source.is_connection(),
            _ => false,
        }
    }

    /// True when kubectl or helm reported a missing resource.
    ///
    /// A missing binary (`command not found`) is not a missing resource.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::RemoteCommand { stderr, .. } => NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m)),
            Self::Node { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Hostnames named by an aggregate node failure, in spec order
    pub fn failed_nodes(&self) -> Vec<&str> {
        match self {
            Self::NodeFailures { failures, .. } => {
                failures.iter().map(|f| f.node.as_str()).collect()
            }
            Self::Node { node, .. } => vec![node.as_str()],
            _ => Vec::new(),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<minijinja::Error> for Error {
    fn from(e: minijinja::Error) -> Self {
        Self::Template(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    // ==========================================================================
    // Story Tests: Error Propagation Across a Bootstrap Run
    // ==========================================================================

    /// Story: a connection reset mid-command is the only retryable failure
    ///
    /// The channel retries transport failures but never a command that ran and
    /// exited nonzero, since re-running it could double-apply a side effect.
    #[test]
    fn story_only_connection_errors_are_retryable() {
        let reset = Error::connection("10.0.0.1", "Connection reset by peer");
        assert!(reset.is_connection());
        assert!(reset.to_string().contains("10.0.0.1"));

        let exit = Error::RemoteCommand {
            host: "10.0.0.1".to_string(),
            command: "kubeadm init".to_string(),
            code: Some(1),
            stderr: "preflight failed\n".to_string(),
        };
        assert!(!exit.is_connection());
        assert!(exit.to_string().contains("exit 1"));
        assert!(exit.to_string().ends_with("preflight failed"));

        let auth = Error::authentication("10.0.0.1", "all strategies rejected");
        assert!(!auth.is_connection());

        // Wrapping keeps the classification
        let wrapped = Error::node("demo-master-01", "provision", reset);
        assert!(wrapped.is_connection());
        assert!(wrapped.to_string().starts_with("[demo-master-01] provision:"));
    }

    /// Story: a fan-out batch reports every failed node, not just the first
    #[test]
    fn story_aggregate_failure_names_every_node() {
        let err = Error::NodeFailures {
            phase: "provision".to_string(),
            failures: vec![
                NodeFailure {
                    node: "demo-node-01".to_string(),
                    error: Error::validation("x"),
                },
                NodeFailure {
                    node: "demo-node-03".to_string(),
                    error: Error::validation("y"),
                },
            ],
        };

        assert_eq!(err.failed_nodes(), vec!["demo-node-01", "demo-node-03"]);
        let msg = err.to_string();
        assert!(msg.starts_with("provision failed on 2 node(s)"));
        assert!(msg.contains("demo-node-01"));
        assert!(msg.contains("demo-node-03"));
    }

    /// Story: kubectl NotFound is distinguishable from other failures
    #[test]
    fn story_not_found_detection() {
        let err = Error::RemoteCommand {
            host: "localhost".to_string(),
            command: "kubectl get ds kube-proxy".to_string(),
            code: Some(1),
            stderr: "Error from server (NotFound): daemonsets.apps \"kube-proxy\" not found"
                .to_string(),
        };
        assert!(err.is_not_found());
        assert!(!Error::validation("NotFound").is_not_found());
    }

    #[rstest]
    #[case("Error from server (NotFound): secrets \"x\" not found", true)]
    #[case("Error: release: not found", true)]
    #[case("bash: line 1: kubectl: command not found", false)]
    #[case("error: the server doesn't have a resource type \"gatewayclass\"", false)]
    fn test_not_found_ignores_missing_binaries(#[case] stderr: &str, #[case] expected: bool) {
        let err = Error::RemoteCommand {
            host: "10.0.0.1".to_string(),
            command: "kubectl get secret/x".to_string(),
            code: Some(127),
            stderr: stderr.to_string(),
        };
        assert_eq!(err.is_not_found(), expected);
    }

    #[test]
    fn test_user_cancelled_is_distinct() {
        let err = Error::UserCancelled;
        assert!(matches!(err, Error::UserCancelled));
        assert_eq!(err.to_string(), "operation cancelled by user");
    }

    #[test]
    fn test_signal_exit_display() {
        let err = Error::RemoteCommand {
            host: "h".to_string(),
            command: "c".to_string(),
            code: None,
            stderr: String::new(),
        };
        assert!(err.to_string().contains("exit signal"));
    }
}
