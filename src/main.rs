//! Kubestrap - bootstrap and reconcile Kubernetes clusters on bare machines

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kubestrap::bootstrap::Sequencer;
use kubestrap::channel::{LocalChannel, OpenSshTransport, SshChannelFactory};
use kubestrap::confirm::{Confirmer, LineConfirmer, PolicyConfirmer};
use kubestrap::context::CommandContext;
use kubestrap::kubectl::Kubectl;
use kubestrap::provision::{required_artifacts, LocalArtifactStore};
use kubestrap::reconcile::{Outcome, Reconciler};
use kubestrap::spec::{load_from_file, ClusterConfig};

/// Kubestrap - multi-master Kubernetes clusters from a YAML description
#[derive(Parser, Debug)]
#[command(name = "kubestrap", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Provision every node and bootstrap a new cluster
    ///
    /// Re-running against a partially created cluster resumes it; a first master
    /// that already carries a control plane is only reset after confirmation.
    Create(CreateArgs),

    /// Reconcile a running cluster against a revised description
    ///
    /// Uses the local kubectl. Changes to the cluster name, pod or service CIDR
    /// or the Kubernetes version are rejected.
    Update(UpdateArgs),

    /// Load and validate a description, then print the derived node table
    Validate(ConfigArg),
}

#[derive(Args, Debug)]
struct ConfigArg {
    /// Path to the cluster YAML file
    #[arg(short = 'f', long = "config")]
    config: PathBuf,
}

#[derive(Args, Debug)]
struct CreateArgs {
    #[command(flatten)]
    config: ConfigArg,

    /// Answer yes to ordinary confirmations
    #[arg(short = 'y', long = "yes")]
    yes: bool,

    /// Reset an already initialized first master without asking
    #[arg(long)]
    force_reset: bool,

    /// Do not authorize the managed key on password-reached nodes
    #[arg(long)]
    skip_ssh_setup: bool,

    /// Directory holding offline binaries and charts
    #[arg(long, env = "KUBESTRAP_PACKAGES", default_value = "packages")]
    packages: PathBuf,

    /// Managed private key (`<path>.pub` is authorized on nodes)
    #[arg(long, env = "KUBESTRAP_MANAGED_KEY")]
    managed_key: Option<PathBuf>,

    /// Write the admin kubeconfig here once the cluster is up
    #[arg(long)]
    kubeconfig_out: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    #[command(flatten)]
    config: ConfigArg,

    /// Answer yes to ordinary confirmations
    #[arg(short = 'y', long = "yes")]
    yes: bool,

    /// Re-apply only the load-balancer configuration
    #[arg(long)]
    only_bgp: bool,

    /// Directory holding offline charts
    #[arg(long, env = "KUBESTRAP_PACKAGES", default_value = "packages")]
    packages: PathBuf,

    /// Kubeconfig for the local kubectl
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Create(args) => run_create(args).await,
        Commands::Update(args) => run_update(args).await,
        Commands::Validate(args) => run_validate(args),
    }
}

fn load(path: &Path) -> anyhow::Result<ClusterConfig> {
    load_from_file(path).map_err(|e| anyhow::anyhow!("{}: {e}", path.display()))
}

fn confirmer(ctx: &CommandContext) -> Arc<dyn Confirmer> {
    Arc::new(PolicyConfirmer::new(ctx, Box::new(LineConfirmer::stdin())))
}

async fn run_create(args: CreateArgs) -> anyhow::Result<()> {
    let config = Arc::new(load(&args.config.config)?);

    let defaults = CommandContext::default();
    let ctx = CommandContext {
        auto_confirm: args.yes,
        force_reset: args.force_reset,
        skip_ssh_setup: args.skip_ssh_setup,
        packages_dir: args.packages,
        managed_key: args.managed_key.unwrap_or(defaults.managed_key.clone()),
        kubeconfig_out: args.kubeconfig_out,
        ..defaults
    };

    let store = LocalArtifactStore::new(&ctx.packages_dir);
    let missing = store.missing(&required_artifacts(&config));
    if !missing.is_empty() {
        let names: Vec<String> = missing.iter().map(ToString::to_string).collect();
        anyhow::bail!(
            "missing artifacts under {}: {}",
            ctx.packages_dir.display(),
            names.join(", ")
        );
    }

    print_nodes(&config);
    let confirmer = confirmer(&ctx);
    if !confirmer
        .confirm(&format!("Create cluster {}?", config.name()))
        .await?
    {
        info!("cancelled");
        return Ok(());
    }

    let transport = Arc::new(OpenSshTransport::with_default_control_dir(
        ctx.timings.connect_timeout,
    )?);
    let channels = Arc::new(SshChannelFactory::new(
        transport,
        ctx.managed_key.clone(),
        ctx.timings.clone(),
    ));

    let mut sequencer = Sequencer::new(config, ctx, channels, Arc::new(store), confirmer);
    sequencer
        .run()
        .await
        .map_err(|e| anyhow::anyhow!("bootstrap failed in phase {}: {e}", sequencer.phase()))?;
    Ok(())
}

async fn run_update(args: UpdateArgs) -> anyhow::Result<()> {
    let config = load(&args.config.config)?;
    let ctx = CommandContext {
        auto_confirm: args.yes,
        only_bgp: args.only_bgp,
        packages_dir: args.packages,
        kubeconfig: args.kubeconfig,
        ..CommandContext::default()
    };

    let kubectl = Kubectl::new(
        Arc::new(LocalChannel::new()),
        ctx.kubeconfig
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned()),
    );
    let artifacts = Arc::new(LocalArtifactStore::new(&ctx.packages_dir));
    let reconciler =
        Reconciler::with_default_routines(kubectl, confirmer(&ctx), artifacts, &ctx);

    match reconciler.reconcile(&config).await? {
        Outcome::NoChanges => println!("Cluster {} is up to date", config.name()),
        Outcome::Declined => println!("Update cancelled"),
        Outcome::Applied {
            applied,
            reported_only,
            ..
        } => {
            for kind in applied {
                println!("applied: {kind}");
            }
            for kind in reported_only {
                println!("not applied (no apply routine): {kind}");
            }
        }
    }
    Ok(())
}

fn run_validate(args: ConfigArg) -> anyhow::Result<()> {
    let config = load(&args.config)?;
    println!("{} is valid", args.config.display());
    print_nodes(&config);
    Ok(())
}

fn print_nodes(config: &ClusterConfig) {
    println!(
        "\nCluster {} ({}), endpoint {}",
        config.name(),
        config.spec.version,
        config.control_plane_endpoint().unwrap_or_default()
    );
    println!("  {:<24} {:<16} {:<8} {}", "HOSTNAME", "IP", "ROLE", "GPU");
    for node in &config.spec.nodes {
        println!(
            "  {:<24} {:<16} {:<8} {}",
            node.hostname,
            node.ip,
            if node.is_master() { "master" } else { "worker" },
            if node.gpu { "yes" } else { "" }
        );
    }
    println!();
}
