//! Courier CLI - Move filtered directory trees between nodes
//!
//! Usage:
//!   courier worker                            Serve transfer jobs over QUIC
//!   courier transfer <source> <dest>          Copy a tree (`node:path` for remote roots)
//!   courier stage <stage> --node <node> ...   Run a build-stage workspace copy
//!   courier fetch <includes> <dest>           Copy items out of the content provider
//!   courier config                            Show or generate configuration

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use courier_core::provider::{
    is_valid_base_path, is_valid_include_path, is_valid_service_address, DirectoryProvider,
    ProviderSource,
};
use courier_core::{Config, PermissionApplier, TransferSpec};
use courier_daemon::hooks::{self, HookStage, WorkspaceLayout};
use courier_daemon::{
    Endpoint, ExecutionContext, JobRunner, NodeRegistry, TransferOrchestrator, TransferSettings,
    WorkerServer,
};

#[derive(Parser)]
#[command(name = "courier")]
#[command(about = "Filtered directory-tree transfers between build nodes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (default: platform config directory)
    #[arg(short, long, global = true, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve transfer jobs for other nodes
    Worker {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Name reported in logs (default: hostname)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Copy a filtered tree; prefix a root with `node:` to place it on a node
    Transfer {
        /// Source root
        source: String,

        /// Destination root
        destination: String,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Copy a build workspace to or from the node running the job
    Stage {
        /// Which stage to run
        #[arg(value_enum)]
        stage: HookStage,

        /// Node running the job (omit when the job runs here)
        #[arg(short, long)]
        node: Option<String>,

        /// Workspace on the job's node
        #[arg(short, long, default_value = ".")]
        worker_workspace: PathBuf,

        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Copy items out of the content provider
    Fetch {
        /// Comma-separated items; a `*` or `?` in the last segment expands
        includes: String,

        /// Destination directory
        destination: PathBuf,

        /// Drop directory structure
        #[arg(short, long)]
        flatten: bool,

        /// Base path the includes are relative to
        #[arg(long)]
        base_path: Option<String>,

        /// Local mirror of the provider namespace
        #[arg(long)]
        mirror: Option<PathBuf>,
    },

    /// Show the configuration
    Config {
        /// Print a sample configuration file
        #[arg(long)]
        sample: bool,
    },
}

#[derive(clap::Args)]
struct FilterArgs {
    /// Comma/space-separated include globs
    #[arg(short, long, default_value = "**")]
    include: String,

    /// Comma/space-separated exclude globs
    #[arg(short, long, default_value = "")]
    exclude: String,

    /// Drop directory structure at the destination
    #[arg(short, long)]
    flatten: bool,

    /// Do not apply the built-in excludes (.git, CVS, *~, ...)
    #[arg(long)]
    no_default_excludes: bool,
}

impl FilterArgs {
    fn spec(&self, config: &Config) -> Result<TransferSpec, Box<dyn std::error::Error>> {
        Ok(TransferSpec::builder()
            .include(self.include.clone())
            .exclude(self.exclude.clone())
            .flatten(self.flatten)
            .honor_default_excludes(
                config.transfer.honor_default_excludes && !self.no_default_excludes,
            )
            .build()?)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Set up logging
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };

    match cli.command {
        Commands::Worker { port, bind, name } => {
            run_worker(config, port, bind, name).await?;
        }
        Commands::Transfer {
            source,
            destination,
            filter,
        } => {
            run_transfer(&config, &source, &destination, &filter).await?;
        }
        Commands::Stage {
            stage,
            node,
            worker_workspace,
            filter,
        } => {
            run_stage(&config, stage, node, worker_workspace, &filter).await?;
        }
        Commands::Fetch {
            includes,
            destination,
            flatten,
            base_path,
            mirror,
        } => {
            run_fetch(&config, includes, destination, flatten, base_path, mirror).await?;
        }
        Commands::Config { sample } => {
            show_config(&config, &cli.config, sample);
        }
    }

    Ok(())
}

async fn run_worker(
    mut config: Config,
    port: Option<u16>,
    bind: Option<IpAddr>,
    name: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(port) = port {
        config.worker.port = port;
    }
    if let Some(bind) = bind {
        config.worker.bind = bind;
    }
    if name.is_some() {
        config.worker.name = name;
    }

    info!("Starting Courier worker...");
    info!("  Permission backend: {:?}", config.permissions.backend);

    let runner = JobRunner::new(PermissionApplier::new(config.permissions.backend));
    let server = WorkerServer::bind(&config.worker, runner)?;

    // Handle Ctrl+C
    tokio::select! {
        result = server.serve() => {
            if let Err(e) = result {
                error!("Worker error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Shutting down...");
            server.close();
        }
    }

    Ok(())
}

fn orchestrator(config: &Config) -> Result<TransferOrchestrator, Box<dyn std::error::Error>> {
    let nodes = NodeRegistry::from_config(config)?;
    Ok(TransferOrchestrator::new(Arc::new(nodes)))
}

async fn run_transfer(
    config: &Config,
    source: &str,
    destination: &str,
    filter: &FilterArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let orchestrator = orchestrator(config)?;
    let is_node = |name: &str| orchestrator.nodes().contains(name);
    let source = Endpoint::parse(source, is_node);
    let destination = Endpoint::parse(destination, is_node);

    let spec = filter.spec(config)?;
    let result = orchestrator
        .transfer(&source, &destination, &spec, &TransferSettings::from(config))
        .await?;

    info!(
        "Copied {} entries ({}) [{}]",
        result.entries, result.topology, result.transfer_id
    );
    Ok(())
}

async fn run_stage(
    config: &Config,
    stage: HookStage,
    node: Option<String>,
    worker_workspace: PathBuf,
    filter: &FilterArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let context = match node {
        Some(node) => ExecutionContext::Node(node),
        None => ExecutionContext::Local,
    };
    let layout = WorkspaceLayout::from_config(&config.stages);

    let Some(plan) = hooks::plan(stage, &context, &layout, &worker_workspace) else {
        info!("Job runs on the coordinator; nothing to copy for {}", stage);
        return Ok(());
    };

    info!("Running {} hook: {} -> {}", plan.stage, plan.source, plan.destination);
    let orchestrator = orchestrator(config)?;
    let result = orchestrator
        .transfer(
            &plan.source,
            &plan.destination,
            &filter.spec(config)?,
            &TransferSettings::from(config),
        )
        .await?;

    info!("Copied {} entries ({})", result.entries, result.topology);
    Ok(())
}

async fn run_fetch(
    config: &Config,
    includes: String,
    destination: PathBuf,
    flatten: bool,
    base_path: Option<String>,
    mirror: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(address) = &config.provider.address {
        if !is_valid_service_address(address) {
            error!("Invalid provider address: {}", address);
            return Err("Invalid provider address".into());
        }
    }

    let base_path = base_path.unwrap_or_else(|| config.provider.base_path.clone());
    if !is_valid_base_path(&base_path) {
        error!("Invalid base path: {}", base_path);
        return Err("Invalid base path".into());
    }
    if let Some(bad) = includes
        .split(',')
        .map(str::trim)
        .find(|item| !is_valid_include_path(item))
    {
        error!("Invalid include path: {}", bad);
        return Err("Invalid include path".into());
    }

    let Some(mirror) = mirror.or_else(|| config.provider.mirror.clone()) else {
        error!("No provider mirror configured (set [provider] mirror or pass --mirror)");
        return Err("No provider mirror".into());
    };

    info!("Fetching {} from {} under {}", includes, mirror.display(), base_path);
    let source = ProviderSource::new(&base_path);
    let provider = DirectoryProvider::new(mirror);
    let copied = tokio::task::spawn_blocking(move || {
        source.copy_to(&provider, &includes, &destination, flatten)
    })
    .await??;

    info!("Fetched {} items", copied);
    Ok(())
}

fn show_config(config: &Config, path: &Option<PathBuf>, sample: bool) {
    if sample {
        println!("{}", Config::sample());
        return;
    }

    match path.clone().or_else(Config::default_path) {
        Some(path) => println!("# {}", path.display()),
        None => println!("# no config directory"),
    }
    println!("{:#?}", config);
}
