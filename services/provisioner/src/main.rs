//! osc - OpenStudio cluster provisioner
//!
//! Offline entry points for the provisioning library. Both subcommands run
//! against the in-memory provider, so they need no cloud credentials:
//!
//! - **catalog**: merge an image listing into the image catalog
//! - **simulate**: walk a cluster through setup and launch

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use osc_catalog::{
    select_amis, AmiCatalogResolver, CatalogSchema, MergedCatalog, ProviderImage, SchemaTag,
    StableOverlay, Version,
};
use osc_provisioner::catalog::fetch_catalog;
use osc_provisioner::{ClusterOrchestrator, Config, MockProvider, NodeOptions};
use serde_json::json;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Provision OpenStudio server clusters.
#[derive(Debug, Parser)]
#[command(name = "osc")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Resolve an image listing into the image catalog.
    Catalog(CatalogArgs),

    /// Launch a cluster against the in-memory provider.
    Simulate(SimulateArgs),
}

#[derive(Debug, clap::Args)]
struct CatalogArgs {
    /// JSON file holding the provider's image listing.
    #[arg(long)]
    images: PathBuf,

    /// Previously resolved catalog to merge into.
    #[arg(long)]
    existing: Option<PathBuf>,

    /// Catalog layout (v1 or v2). Defaults to OSC_CATALOG_SCHEMA.
    #[arg(long)]
    schema: Option<String>,

    /// Oldest software version that gets stable entries (v2 only).
    #[arg(long)]
    stable_baseline: Option<String>,

    /// Pinned stable builds as `software=build` (v2 only).
    #[arg(long = "stable")]
    stable: Vec<String>,

    /// Print the image selection for this software version instead of
    /// the whole catalog ("latest" picks the newest).
    #[arg(long)]
    select: Option<String>,
}

#[derive(Debug, clap::Args)]
struct SimulateArgs {
    /// Number of workers to launch.
    #[arg(long, default_value_t = 2)]
    workers: usize,

    #[arg(long, default_value = "m3.2xlarge")]
    server_instance_type: String,

    #[arg(long, default_value = "c3.2xlarge")]
    worker_instance_type: String,

    /// Directory to write summaries and key files into.
    #[arg(long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Commands::Catalog(args) => run_catalog(&config, args).await,
        Commands::Simulate(args) => run_simulate(config, args).await,
    }
}

async fn run_catalog(config: &Config, args: CatalogArgs) -> Result<()> {
    let images: Vec<ProviderImage> = read_json(&args.images)?;
    let existing: Option<MergedCatalog> = args.existing.as_ref().map(read_json).transpose()?;

    let tag = match args.schema.as_deref() {
        None => config.catalog_schema,
        Some("v1") => SchemaTag::V1,
        Some("v2") => SchemaTag::V2,
        Some(other) => anyhow::bail!("unknown catalog schema {other:?}, expected v1 or v2"),
    };
    let schema = match tag {
        SchemaTag::V1 => CatalogSchema::V1,
        SchemaTag::V2 => {
            let baseline = match args.stable_baseline.as_deref() {
                Some(raw) => Version::parse(raw)?,
                None => config
                    .stable_baseline
                    .clone()
                    .context("v2 catalogs need --stable-baseline or OSC_STABLE_BASELINE")?,
            };
            CatalogSchema::V2(StableOverlay {
                baseline,
                stable: parse_stable_pins(&args.stable)?,
            })
        }
    };

    let provider = MockProvider::new().with_images(images);
    let resolver = AmiCatalogResolver::new(schema);
    let catalog = fetch_catalog(
        &provider,
        &resolver,
        existing.as_ref(),
        config.ami_owner.as_deref(),
    )
    .await?;

    let rendered = match args.select.as_deref() {
        Some(requested) => {
            let software = (requested != "latest").then_some(requested);
            let selection = select_amis(&catalog, software, tag == SchemaTag::V2)?;
            serde_json::to_string_pretty(&selection)?
        }
        None => serde_json::to_string_pretty(&catalog)?,
    };
    println!("{rendered}");
    Ok(())
}

async fn run_simulate(mut config: Config, args: SimulateArgs) -> Result<()> {
    // Instances boot after two polls.
    config.poll_interval = Duration::from_millis(50);

    let provider = Arc::new(MockProvider::new().with_boot_polls(Some(2)));
    let mut cluster = ClusterOrchestrator::new(provider, config);
    info!(group_uuid = %cluster.group_uuid(), workers = args.workers, "Simulating cluster");

    cluster.setup(None).await?;
    let options = NodeOptions::default();
    cluster
        .launch_server("ami-server", &args.server_instance_type, &options)
        .await?;
    if args.workers > 0 {
        cluster
            .launch_workers(
                "ami-worker",
                &args.worker_instance_type,
                args.workers,
                &options,
            )
            .await?;
    }

    if let Some(dir) = &args.output {
        cluster.save_private_keys(dir)?;
        cluster.save_summaries(dir)?;
    }

    let report = json!({
        "group_uuid": cluster.group_uuid(),
        "state": cluster.state().as_str(),
        "server": cluster.server_summary()?,
        "workers": cluster.worker_summaries(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn parse_stable_pins(pins: &[String]) -> Result<BTreeMap<Version, Version>> {
    pins.iter()
        .map(|pin| {
            let (software, build) = pin
                .split_once('=')
                .with_context(|| format!("stable pin {pin:?} is not software=build"))?;
            Ok((Version::parse(software)?, Version::parse(build)?))
        })
        .collect()
}
