//! addonctl - run the add-on engine by hand against a cluster.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use addon_engine::cluster::{ClusterClient, KubeClusterClient};
use addon_engine::deployer::{ClusterRef, SyncMode};
use addon_engine::feature::{FeatureContent, FeatureId, FeatureReconciler, FeatureRecord, FeatureRequest, ReconcileResult};
use addon_engine::hash::{compute_hash, HashInput};
use addon_engine::helm::{HelmCli, HelmReconciler, ReleaseRecord, ReleaseSpec};
use addon_engine::render::{ContentSource, HandlebarsRenderer, ManifestRenderer, RenderContext};
use addon_engine::resource::OwnershipLabels;
use addon_engine::{EngineConfig, EngineError};
use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod output;
mod records;

use output::OutputFormat;

/// Deploy add-ons into a cluster and keep them reconciled.
#[derive(Parser)]
#[command(name = "addonctl", version)]
#[command(about = "Run the add-on deployment engine against a cluster")]
struct Cli {
    /// Kubeconfig of the target cluster (default: in-cluster or `~/.kube/config`).
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Report format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    output: OutputFormat,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the fingerprint of manifest files.
    Hash {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Reconcile a manifest bundle into the cluster.
    Deploy(DeployArgs),

    /// Remove everything a record tracks.
    Undeploy {
        #[command(flatten)]
        source: SourceArgs,

        /// Feature record file.
        #[arg(long)]
        record: PathBuf,

        /// Report what would be deleted without deleting.
        #[arg(long)]
        dry_run: bool,
    },

    /// Reconcile Helm releases.
    Helm {
        /// YAML list of desired releases.
        #[arg(long)]
        releases: PathBuf,

        /// Release record file.
        #[arg(long)]
        record: Option<PathBuf>,

        #[arg(long)]
        dry_run: bool,
    },
}

/// The object the deployed resources belong to.
#[derive(Args)]
struct SourceArgs {
    #[arg(long, default_value = "ConfigMap")]
    source_kind: String,

    #[arg(long)]
    source_name: String,

    #[arg(long)]
    source_namespace: String,
}

impl SourceArgs {
    fn owner(&self) -> OwnershipLabels {
        OwnershipLabels::new(&self.source_kind, &self.source_name, &self.source_namespace)
    }
}

#[derive(Args)]
struct DeployArgs {
    #[command(flatten)]
    source: SourceArgs,

    /// Manifest files, applied in order.
    #[arg(long = "manifests", required = true)]
    manifests: Vec<PathBuf>,

    /// Namespace for namespaced resources that do not set one.
    #[arg(long, default_value = "default")]
    namespace: String,

    #[arg(long, value_enum, default_value_t = Mode::Continuous)]
    mode: Mode,

    /// Feature record file, read before and written after the run.
    #[arg(long)]
    record: Option<PathBuf>,

    /// Redeploy even when nothing changed.
    #[arg(long)]
    force: bool,

    /// Treat the manifest files as templates.
    #[arg(long)]
    template: bool,

    /// JSON object of named context values for templates.
    #[arg(long)]
    context: Option<PathBuf>,

    #[arg(long, default_value = "")]
    cluster_name: String,

    #[arg(long, default_value = "")]
    cluster_namespace: String,

    #[command(flatten)]
    owner: OwnerArgs,
}

/// Object set as the controlling owner of every deployed resource.
#[derive(Args)]
struct OwnerArgs {
    #[arg(long, requires = "owner_kind", requires = "owner_name", requires = "owner_uid")]
    owner_api_version: Option<String>,

    #[arg(long, requires = "owner_api_version")]
    owner_kind: Option<String>,

    #[arg(long, requires = "owner_api_version")]
    owner_name: Option<String>,

    #[arg(long, requires = "owner_api_version")]
    owner_uid: Option<String>,
}

impl OwnerArgs {
    fn reference(&self) -> Option<OwnerReference> {
        let (Some(api_version), Some(kind), Some(name), Some(uid)) =
            (&self.owner_api_version, &self.owner_kind, &self.owner_name, &self.owner_uid)
        else {
            return None;
        };
        Some(OwnerReference {
            api_version: api_version.clone(),
            kind: kind.clone(),
            name: name.clone(),
            uid: uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        })
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Continuous,
    DryRun,
    OneTime,
}

impl From<Mode> for SyncMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Continuous => Self::Continuous,
            Mode::DryRun => Self::DryRun,
            Mode::OneTime => Self::OneTime,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_json);

    let config = EngineConfig::from_env();
    match &cli.command {
        Commands::Hash { files } => hash(files),
        Commands::Deploy(args) => deploy(&cli, &config, args).await,
        Commands::Undeploy {
            source,
            record,
            dry_run,
        } => undeploy(&cli, &config, source, record, *dry_run).await,
        Commands::Helm {
            releases,
            record,
            dry_run,
        } => helm(&cli, &config, releases, record.as_deref(), *dry_run).await,
    }
}

fn init_logging(verbose: bool, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn hash(files: &[PathBuf]) -> Result<()> {
    let inputs: Vec<_> = records::read_texts(files)?
        .into_iter()
        .map(HashInput::Manifests)
        .collect();
    println!("{}", compute_hash(&inputs));
    Ok(())
}

async fn cluster_client(cli: &Cli, config: &EngineConfig) -> Result<Arc<dyn ClusterClient>> {
    let client = match &cli.kubeconfig {
        Some(path) => KubeClusterClient::from_kubeconfig(path, config).await,
        None => KubeClusterClient::try_default(config).await,
    }
    .context("Failed to create Kubernetes client")?;
    Ok(Arc::new(client))
}

/// Cancel the token on Ctrl-C so an in-flight batch stops between documents.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current document");
            token.cancel();
        }
    });
    cancel
}

async fn deploy(cli: &Cli, config: &EngineConfig, args: &DeployArgs) -> Result<()> {
    let source = args.source.owner();
    let previous: Option<FeatureRecord> = match &args.record {
        Some(path) => records::load(path)?,
        None => None,
    };

    let context: RenderContext = match &args.context {
        Some(path) => {
            let raw = std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("{} is not a JSON object", path.display()))?
        }
        None => RenderContext::new(),
    };

    let mut renderer = ManifestRenderer::new();
    let content = if args.template {
        renderer = renderer.with_templates(Arc::new(HandlebarsRenderer::default()));
        let data: BTreeMap<String, String> = args
            .manifests
            .iter()
            .zip(records::read_texts(&args.manifests)?)
            .enumerate()
            .map(|(i, (path, text))| (format!("{i:04}-{}", path.display()), text))
            .collect();
        FeatureContent::Source(ContentSource {
            kind: args.source.source_kind.clone(),
            name: args.source.source_name.clone(),
            namespace: args.source.source_namespace.clone(),
            is_template: true,
            data,
        })
    } else {
        FeatureContent::Manifests(records::read_manifests(&args.manifests)?)
    };

    let request = FeatureRequest {
        feature_id: FeatureId::Resources,
        source,
        cluster: ClusterRef {
            namespace: args.cluster_namespace.clone(),
            name: args.cluster_name.clone(),
        },
        target_namespace: args.namespace.clone(),
        owner_reference: args.owner.reference(),
        sync_mode: args.mode.into(),
        content,
        context,
    };

    let reconciler = FeatureReconciler::new(cluster_client(cli, config).await?, config).with_renderer(renderer);
    let result = match reconciler
        .reconcile(&request, previous.as_ref(), args.force, &cancel_on_interrupt())
        .await
    {
        Ok(result) => result,
        Err(err) => return Err(report_engine_error(cli, err)),
    };

    match &result {
        ReconcileResult::Unchanged(_) => info!("Nothing changed since the last apply"),
        ReconcileResult::Applied(update) => {
            if let Some(path) = &args.record {
                records::save(path, &update.record)?;
            }
        }
        ReconcileResult::DryRun { .. } => info!("Dry run, record left untouched"),
    }

    match cli.output {
        OutputFormat::Json => output::print_json(&result.report())?,
        OutputFormat::Table => {
            if let Some(report) = result.report() {
                print!("{}", output::feature_table(report));
            }
            if let Some(record) = result.record() {
                println!("{}", output::record_summary(record));
            }
        }
    }
    Ok(())
}

async fn undeploy(cli: &Cli, config: &EngineConfig, source: &SourceArgs, record_path: &Path, dry_run: bool) -> Result<()> {
    let Some(mut record) = records::load::<FeatureRecord>(record_path)? else {
        bail!("No feature record at {}", record_path.display());
    };
    if !dry_run {
        record.begin_removal();
        records::save(record_path, &record)?;
    }

    let reconciler = FeatureReconciler::new(cluster_client(cli, config).await?, config);
    let update = reconciler.undeploy(&source.owner(), &record, dry_run).await;

    if !dry_run {
        if update.record.failure_message.is_none() {
            records::remove(record_path)?;
        } else {
            records::save(record_path, &update.record)?;
        }
    }

    match cli.output {
        OutputFormat::Json => output::print_json(&update.report)?,
        OutputFormat::Table => {
            print!("{}", output::feature_table(&update.report));
            println!("{}", output::record_summary(&update.record));
        }
    }
    Ok(())
}

async fn helm(
    cli: &Cli,
    config: &EngineConfig,
    releases: &Path,
    record_path: Option<&Path>,
    dry_run: bool,
) -> Result<()> {
    let raw = std::fs::read_to_string(releases).with_context(|| format!("Failed to read {}", releases.display()))?;
    let desired: Vec<ReleaseSpec> =
        serde_yaml::from_str(&raw).with_context(|| format!("Invalid release list in {}", releases.display()))?;
    let previous: Vec<ReleaseRecord> = match record_path {
        Some(path) => records::load(path)?.unwrap_or_default(),
        None => Vec::new(),
    };

    let mut client = HelmCli::new(config);
    if let Some(kubeconfig) = &cli.kubeconfig {
        client = client.with_kubeconfig(kubeconfig.clone());
    }
    let report = HelmReconciler::new(Arc::new(client))
        .reconcile(&desired, &previous, dry_run)
        .await
        .context("Helm reconciliation failed")?;

    if let (Some(path), false) = (record_path, dry_run) {
        records::save(path, &report.records)?;
    }

    match cli.output {
        OutputFormat::Json => output::print_json(&report)?,
        OutputFormat::Table => print!("{}", output::helm_table(&report)),
    }
    if report.failed().next().is_some() {
        bail!("Some releases failed");
    }
    Ok(())
}

/// Print whatever the engine completed before failing, then hand the error back.
fn report_engine_error(cli: &Cli, err: EngineError) -> anyhow::Error {
    if let Some(outcome) = err.partial_outcome() {
        let report = addon_engine::report::FeatureReport::build(outcome, None);
        match cli.output {
            OutputFormat::Json => {
                if let Err(e) = output::print_json(&report) {
                    warn!(error = %e, "Failed to print partial report");
                }
            }
            OutputFormat::Table => print!("{}", output::feature_table(&report)),
        }
    }
    let retryable = err.is_retryable();
    anyhow::Error::new(err).context(if retryable {
        "Reconciliation failed (retryable)"
    } else {
        "Reconciliation failed"
    })
}
