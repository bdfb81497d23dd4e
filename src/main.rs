//! cloudup CLI - declarative cluster infrastructure provisioning

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;

use cloudup::cloud::OfflineCloud;
use cloudup::target::{DryRunTarget, TerraformTarget};
use cloudup::{
    CaStore, Cloud, CloudProvider, ClusterConfig, Context, Error, Loader, ResourceHolder,
    SecretStore, Target,
};

#[derive(Parser)]
#[command(name = "cloudup")]
#[command(about = "cloudup - declarative cluster infrastructure provisioning")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a cluster's cloud infrastructure from a model
    CreateCluster {
        /// Cloud provider to use (aws, gce)
        #[arg(long)]
        cloud: Option<String>,

        /// Comma-separated zones to target
        #[arg(long)]
        zone: Option<String>,

        /// Name for the cluster
        #[arg(long)]
        name: Option<String>,

        /// Version of kubernetes to run
        #[arg(long)]
        kubernetes_version: Option<String>,

        /// Target: direct, terraform, or dryrun
        #[arg(long, default_value = "direct")]
        target: String,

        /// Source directory to use as model
        #[arg(long, default_value = "models/cloudup")]
        model: PathBuf,

        /// Directory for local state (PKI tree, secrets)
        #[arg(long, default_value = "./state")]
        state: PathBuf,

        /// SSH public key to use
        #[arg(long)]
        ssh_public_key: Option<PathBuf>,

        /// Configuration file to load
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::CreateCluster {
            cloud,
            zone,
            name,
            kubernetes_version,
            target,
            model,
            state,
            ssh_public_key,
            config,
        } => create_cluster(CreateClusterCmd {
            cloud,
            zone,
            name,
            kubernetes_version,
            target,
            model,
            state,
            ssh_public_key,
            config,
        }),
    };

    match result {
        Ok(()) => println!("{}", "Completed successfully".green()),
        Err(e) => {
            eprintln!("{} {}", "Error:".red().bold(), e);
            std::process::exit(1);
        }
    }
}

struct CreateClusterCmd {
    cloud: Option<String>,
    zone: Option<String>,
    name: Option<String>,
    kubernetes_version: Option<String>,
    target: String,
    model: PathBuf,
    state: PathBuf,
    ssh_public_key: Option<PathBuf>,
    config: Option<PathBuf>,
}

fn create_cluster(cmd: CreateClusterCmd) -> anyhow::Result<()> {
    let mut config = match &cmd.config {
        Some(path) => ClusterConfig::from_yaml(&std::fs::read_to_string(path)?)?,
        None => ClusterConfig::default(),
    };

    // CLI flags override the configuration document.
    if let Some(cloud) = cmd.cloud {
        config.cloud_provider = cloud;
    }
    if let Some(zone) = cmd.zone {
        config.zones = zone.split(',').map(str::to_string).collect();
    }
    if let Some(name) = cmd.name {
        config.cluster_name = name;
    }
    if let Some(version) = cmd.kubernetes_version {
        config.kubernetes_version = version;
    }

    config.validate()?;
    config.apply_defaults()?;

    let provider: CloudProvider = config
        .cloud_provider
        .parse()
        .map_err(|_| Error::Config(format!("unknown cloud provider {:?}", config.cloud_provider)))?;

    let ca = CaStore::open(&cmd.state.join("pki"))?;
    let secrets = SecretStore::open(&cmd.state.join("secrets"))?;

    let mut loader = Loader::new(config.clone());
    loader.add_kinds(&cloudup::tasks::standard_kinds(provider));
    loader.add_tags(config.tags.iter().cloned());
    loader.add_tags([format!("_{provider}")]);

    if let Some(key_path) = &cmd.ssh_public_key {
        let authorized = std::fs::read_to_string(key_path)?;
        loader.add_resource("ssh-public-key", ResourceHolder::inline(authorized));
    }

    let mut cluster_tags = BTreeMap::new();
    cluster_tags.insert(
        "KubernetesCluster".to_string(),
        config.cluster_name.clone(),
    );

    // Plan-only targets run against an offline seam; the real cloud
    // client binding is provided by the deployment build.
    let cloud = Cloud::new(provider, &config.region, cluster_tags, Arc::new(OfflineCloud));

    let (target, check_existing) = match cmd.target.as_str() {
        "direct" => {
            anyhow::bail!(
                "the direct target requires a linked cloud client; use --target terraform or --target dryrun"
            );
        }
        "terraform" => {
            let t = TerraformTarget::new(
                &provider.to_string(),
                &config.region,
                Box::new(std::io::stdout()),
            );
            (Target::Terraform(t), false)
        }
        "dryrun" => (
            Target::DryRun(DryRunTarget::new(Box::new(std::io::stdout()))),
            true,
        ),
        other => anyhow::bail!("unsupported target type {other:?}"),
    };

    let mut tasks = loader.build(&cmd.model, &ca, &secrets)?;

    let mut ctx = Context::new(target, cloud, ca, secrets, check_existing);
    let run_result = ctx.run_tasks(&mut tasks);

    // Plans are still inspectable after a failed run.
    let finish_result = ctx.finish(&tasks);
    run_result?;
    finish_result?;
    Ok(())
}
