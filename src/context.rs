//! Command context threaded through every operation
//!
//! Holds the invocation flags and timing budgets explicitly instead of reading
//! process-wide state, so each call site sees exactly the options it was given.

use std::path::PathBuf;
use std::time::Duration;

use crate::retry::RetryConfig;

/// Flags and paths for one invocation
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Skip ordinary yes/no confirmations
    pub auto_confirm: bool,
    /// Pre-approve the destructive first-master reset
    pub force_reset: bool,
    /// Reconcile only the load-balancer addon
    pub only_bgp: bool,
    /// Do not authorize the managed key on nodes before provisioning
    pub skip_ssh_setup: bool,
    /// Local directory holding offline binaries and charts
    pub packages_dir: PathBuf,
    /// Private key escalated connections use (`<path>.pub` is authorized on nodes)
    pub managed_key: PathBuf,
    /// Where to write the admin kubeconfig after bootstrap (None skips the export)
    pub kubeconfig_out: Option<PathBuf>,
    /// Kubeconfig used by local kubectl during reconciliation
    pub kubeconfig: Option<PathBuf>,
    /// Wait and retry budgets
    pub timings: Timings,
}

impl Default for CommandContext {
    fn default() -> Self {
        let home = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/root"));
        Self {
            auto_confirm: false,
            force_reset: false,
            only_bgp: false,
            skip_ssh_setup: false,
            packages_dir: PathBuf::from("packages"),
            managed_key: home.join(".ssh").join("id_rsa"),
            kubeconfig_out: None,
            kubeconfig: None,
            timings: Timings::default(),
        }
    }
}

/// Wait and retry budgets
#[derive(Debug, Clone)]
pub struct Timings {
    /// Channel reconnect-and-retry policy
    pub channel_retry: RetryConfig,
    /// SSH connection establishment timeout
    pub connect_timeout: Duration,
    /// Interval between readiness polls
    pub poll_interval: Duration,
    /// Budget for the API server to answer /readyz
    pub api_ready_timeout: Duration,
    /// Budget for the networking addon to become ready
    pub network_ready_timeout: Duration,
    /// Budget for each gateway wait
    pub gateway_timeout: Duration,
    /// Retry policy for applying addon configuration resources
    pub apply_retry: RetryConfig,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            channel_retry: RetryConfig::fixed(3, Duration::from_secs(2)),
            connect_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(5),
            api_ready_timeout: Duration::from_secs(300),
            network_ready_timeout: Duration::from_secs(300),
            gateway_timeout: Duration::from_secs(60),
            apply_retry: RetryConfig::fixed(6, Duration::from_secs(5)),
        }
    }
}

impl Timings {
    /// Zero-delay timings for tests
    #[cfg(test)]
    pub fn immediate() -> Self {
        Self {
            channel_retry: RetryConfig::fixed(3, Duration::ZERO),
            connect_timeout: Duration::from_secs(1),
            poll_interval: Duration::ZERO,
            api_ready_timeout: Duration::ZERO,
            network_ready_timeout: Duration::ZERO,
            gateway_timeout: Duration::ZERO,
            apply_retry: RetryConfig::fixed(2, Duration::ZERO),
        }
    }
}

impl CommandContext {
    /// Context for tests: no waits, nothing written outside the fake fleet
    #[cfg(test)]
    pub fn for_testing() -> Self {
        Self {
            auto_confirm: true,
            skip_ssh_setup: true,
            packages_dir: PathBuf::from("/nonexistent"),
            managed_key: PathBuf::from("/nonexistent/id_rsa"),
            timings: Timings::immediate(),
            ..Default::default()
        }
    }
}
