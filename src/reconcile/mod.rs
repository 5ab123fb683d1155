//! Reconciliation of a live cluster against a revised spec
//!
//! Order of operations:
//! 1. ownership check (every node carries the management label)
//! 2. load the persisted spec; a missing record is not an error
//! 3. immutable-field check against the persisted spec
//! 4. diff, print the change table and ask for confirmation
//! 5. dispatch each change kind to its registered [`ApplyRoutine`]
//! 6. store the new spec
//!
//! Steps 1-4 have no side effects, so a rejected or declined update leaves the
//! cluster untouched.

mod diff;

pub use diff::{
    bgp_changes, check_immutable, diff, immutable_violations, ChangeKind, ConfigChange,
    ImmutableViolation,
};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::{info, warn};

use crate::addons::metallb;
use crate::confirm::Confirmer;
use crate::context::{CommandContext, Timings};
use crate::kubectl::Kubectl;
use crate::provision::ArtifactStore;
use crate::spec::ClusterConfig;
use crate::{state, Error, Result};

/// Applies every change of one kind
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApplyRoutine: Send + Sync {
    /// Bring the cluster in line with `desired`; `changes` are the detected
    /// changes of this routine's kind
    async fn apply(&self, desired: &ClusterConfig, changes: &[ConfigChange]) -> Result<()>;
}

/// Re-applies the load-balancer addon, or removes BGP resources once the
/// cluster no longer wants a load balancer
pub struct LoadBalancerRoutine {
    kubectl: Kubectl,
    artifacts: Arc<dyn ArtifactStore>,
    timings: Timings,
}

impl LoadBalancerRoutine {
    /// Routine applying through `kubectl`
    pub fn new(kubectl: Kubectl, artifacts: Arc<dyn ArtifactStore>, timings: Timings) -> Self {
        Self {
            kubectl,
            artifacts,
            timings,
        }
    }
}

#[async_trait]
impl ApplyRoutine for LoadBalancerRoutine {
    async fn apply(&self, desired: &ClusterConfig, _changes: &[ConfigChange]) -> Result<()> {
        if desired.wants_load_balancer() {
            info!(cluster = desired.name(), "applying load balancer configuration");
            metallb::install(
                &self.kubectl,
                desired,
                self.artifacts.as_ref(),
                &self.timings,
            )
            .await
        } else {
            info!(cluster = desired.name(), "removing BGP resources");
            metallb::remove_bgp(&self.kubectl, desired.name()).await
        }
    }
}

/// How a reconciliation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Desired and persisted specs agree on every supported field
    NoChanges,
    /// The operator declined the change table
    Declined,
    /// Changes were dispatched
    Applied {
        /// Every detected change
        changes: Vec<ConfigChange>,
        /// Kinds whose routine ran
        applied: Vec<ChangeKind>,
        /// Kinds with no registered routine, reported only
        reported_only: Vec<ChangeKind>,
    },
}

/// Drives one `update` invocation
pub struct Reconciler {
    kubectl: Kubectl,
    confirmer: Arc<dyn Confirmer>,
    routines: BTreeMap<ChangeKind, Arc<dyn ApplyRoutine>>,
    only_bgp: bool,
}

impl Reconciler {
    /// Reconciler with no routines registered
    pub fn new(kubectl: Kubectl, confirmer: Arc<dyn Confirmer>, ctx: &CommandContext) -> Self {
        Self {
            kubectl,
            confirmer,
            routines: BTreeMap::new(),
            only_bgp: ctx.only_bgp,
        }
    }

    /// Reconciler with the load-balancer routine registered for BGP changes
    pub fn with_default_routines(
        kubectl: Kubectl,
        confirmer: Arc<dyn Confirmer>,
        artifacts: Arc<dyn ArtifactStore>,
        ctx: &CommandContext,
    ) -> Self {
        let routine = LoadBalancerRoutine::new(kubectl.clone(), artifacts, ctx.timings.clone());
        Self::new(kubectl, confirmer, ctx).register(ChangeKind::Bgp, Arc::new(routine))
    }

    /// Register the routine for a change kind, replacing any previous one
    pub fn register(mut self, kind: ChangeKind, routine: Arc<dyn ApplyRoutine>) -> Self {
        self.routines.insert(kind, routine);
        self
    }

    /// Reconcile the cluster against `desired`
    pub async fn reconcile(&self, desired: &ClusterConfig) -> Result<Outcome> {
        if self.only_bgp && !desired.spec.bgp.enabled {
            return Err(Error::validation(
                "--only-bgp requires spec.bgp.enabled: true",
            ));
        }

        state::verify_ownership(&self.kubectl).await?;
        info!(cluster = desired.name(), "ownership verified");

        let persisted = state::load(&self.kubectl).await?;
        match &persisted {
            Some(old) => check_immutable(old, desired)?,
            None => warn!("no persisted spec found; immutable-field checks skipped"),
        }

        // with no record, a desired BGP enablement still surfaces as a change so
        // a cluster bootstrapped without state can be brought up to its spec
        let changes = if self.only_bgp {
            bgp_changes(persisted.as_ref(), desired)
        } else {
            diff(persisted.as_ref(), desired)
        };
        if changes.is_empty() {
            info!("no configuration changes detected");
            return Ok(Outcome::NoChanges);
        }

        print_changes(&changes);
        if !self.confirmer.confirm("Apply these changes?").await? {
            warn!("update declined");
            return Ok(Outcome::Declined);
        }

        let (applied, reported_only) = self.dispatch(desired, &changes).await?;

        if let Err(e) = state::update(&self.kubectl, desired).await {
            warn!(error = %e, "failed to update the persisted spec; the cluster record may be stale");
        }

        Ok(Outcome::Applied {
            changes,
            applied,
            reported_only,
        })
    }

    async fn dispatch(
        &self,
        desired: &ClusterConfig,
        changes: &[ConfigChange],
    ) -> Result<(Vec<ChangeKind>, Vec<ChangeKind>)> {
        let kinds: BTreeSet<ChangeKind> = changes.iter().map(|c| c.kind).collect();
        let mut applied = Vec::new();
        let mut reported_only = Vec::new();

        for kind in kinds {
            let of_kind: Vec<ConfigChange> =
                changes.iter().filter(|c| c.kind == kind).cloned().collect();
            match self.routines.get(&kind) {
                Some(routine) => {
                    info!(kind = %kind, changes = of_kind.len(), "applying");
                    routine.apply(desired, &of_kind).await?;
                    applied.push(kind);
                }
                None => {
                    warn!(kind = %kind, "no apply routine registered; change reported only");
                    reported_only.push(kind);
                }
            }
        }
        Ok((applied, reported_only))
    }
}

fn print_changes(changes: &[ConfigChange]) {
    println!("\nDetected {} configuration change(s):\n", changes.len());
    for (i, change) in changes.iter().enumerate() {
        println!(
            "  [{}/{}] {}: {}",
            i + 1,
            changes.len(),
            change.kind,
            change.description
        );
        if let Some(old) = &change.old {
            println!("        current: {old}");
        }
        if let Some(new) = &change.new {
            println!("        new:     {new}");
        }
        if change.requires_restart {
            println!("        affects: {} (requires restart of {})", change.component, change.component);
        } else {
            println!("        affects: {}", change.component);
        }
    }
    println!();
}
