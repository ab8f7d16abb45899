//! pvlink CLI - move persistent volume data between clusters
//!
//! Usage:
//!   pvlink migration create <name> -n <ns> --pvc <pvc>   Attach a destination
//!   pvlink migration rsync <name> --source <dir>         Copy data into it
//!   pvlink migration delete <name>                       Tear it down
//!   pvlink migration show <name>                         Print the record
//!   pvlink list                                          List relationships
//!   pvlink config init|show                              Manage the config file

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use pvlink_core::{AccessMode, Config, CopyMethod, MoverSecurityContext, ServiceType, TransportKind};
use pvlink_mover::{KubeConnector, MigrationRequest, Orchestrator};

#[derive(Parser)]
#[command(name = "pvlink")]
#[command(about = "Persistent volume data mover", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: platform config dir)
    #[arg(long, global = true, env = "PVLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding relationship records
    #[arg(long, global = true, env = "PVLINK_RELATIONSHIP_DIR")]
    relationship_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Migrate local data into a volume
    Migration {
        #[command(subcommand)]
        command: MigrationCommands,
    },

    /// List stored relationships
    List,

    /// Write or print the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write the default configuration to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective configuration
    Show,
}

#[derive(Subcommand)]
enum MigrationCommands {
    /// Create the destination and wait until it is ready
    Create(CreateArgs),

    /// Copy a local directory into the destination
    Rsync {
        /// Relationship name
        name: String,

        /// Local directory to copy
        #[arg(short, long)]
        source: PathBuf,
    },

    /// Remove the destination and the relationship
    Delete {
        /// Relationship name
        name: String,
    },

    /// Print the stored relationship
    Show {
        /// Relationship name
        name: String,
    },
}

#[derive(Args)]
struct CreateArgs {
    /// Relationship name
    name: String,

    /// Kube context of the destination cluster
    #[arg(long, default_value = "")]
    context: String,

    /// Destination namespace
    #[arg(short, long)]
    namespace: String,

    /// Destination volume claim
    #[arg(long)]
    pvc: String,

    /// Secure channel: ssh or psk-tls
    #[arg(short, long, default_value = "ssh")]
    transport: TransportKind,

    /// Direct, None, Clone or Snapshot
    #[arg(long)]
    copy_method: Option<CopyMethod>,

    /// Size for a new volume claim (e.g. 10Gi)
    #[arg(long)]
    capacity: Option<String>,

    /// Access mode for a new volume claim (repeatable)
    #[arg(long = "access-mode")]
    access_modes: Vec<AccessMode>,

    #[arg(long)]
    storage_class: Option<String>,

    /// ClusterIP, LoadBalancer or NodePort
    #[arg(long)]
    service_type: Option<ServiceType>,

    /// Mover pod uid (psk-tls only)
    #[arg(long)]
    run_as_user: Option<i64>,

    /// Mover pod gid (psk-tls only)
    #[arg(long)]
    run_as_group: Option<i64>,

    /// Mover pod fsGroup (psk-tls only)
    #[arg(long)]
    fs_group: Option<i64>,

    /// Require a non-root mover (psk-tls only)
    #[arg(long)]
    run_as_non_root: Option<bool>,

    /// Seconds to wait for the destination (default from config)
    #[arg(long)]
    timeout: Option<u64>,
}

impl CreateArgs {
    fn request(&self) -> MigrationRequest {
        let security = MoverSecurityContext {
            run_as_user: self.run_as_user,
            run_as_group: self.run_as_group,
            fs_group: self.fs_group,
            run_as_non_root: self.run_as_non_root,
        };

        MigrationRequest {
            cluster: self.context.clone(),
            copy_method: self.copy_method,
            capacity: self.capacity.clone(),
            access_modes: self.access_modes.clone(),
            storage_class_name: self.storage_class.clone(),
            service_type: self.service_type,
            mover_security_context: Some(security).filter(|s| !s.is_empty()),
            ..MigrationRequest::new(&self.namespace, &self.pvc, self.transport)
        }
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

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load(),
    };
    if let Some(dir) = cli.relationship_dir {
        config.store.relationship_dir = Some(dir);
    }
    if let Commands::Migration {
        command: MigrationCommands::Create(CreateArgs { timeout: Some(secs), .. }),
    } = &cli.command
    {
        config.cluster.ready_timeout_secs = *secs;
    }

    let orchestrator = Orchestrator::new(config, Arc::new(KubeConnector));

    // Handle Ctrl+C
    let cancel = orchestrator.context().cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping...");
            cancel.cancel();
        }
    });

    match cli.command {
        Commands::Migration { command } => run_migration(&orchestrator, command).await?,
        Commands::List => {
            for name in orchestrator.list()? {
                println!("{}", name);
            }
        }
        Commands::Config { command } => {
            run_config(&orchestrator.context().config, cli.config.as_deref(), command)?
        }
    }

    Ok(())
}

async fn run_migration(
    orchestrator: &Orchestrator,
    command: MigrationCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        MigrationCommands::Create(args) => {
            let rel = orchestrator.create_migration(&args.name, &args.request()).await?;
            info!("Created migration {} at {:?}", rel.name(), rel.path());
        }
        MigrationCommands::Rsync { name, source } => {
            let source = source.canonicalize()?;
            orchestrator.run_migration(&name, &source).await?;
        }
        MigrationCommands::Delete { name } => {
            orchestrator.delete_migration(&name).await?;
        }
        MigrationCommands::Show { name } => {
            print!("{}", orchestrator.show_migration(&name)?);
        }
    }
    Ok(())
}

fn run_config(
    config: &Config,
    path: Option<&Path>,
    command: ConfigCommands,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        ConfigCommands::Init { force } => {
            let path = path
                .map(Path::to_path_buf)
                .or_else(Config::default_path)
                .ok_or("no config directory on this platform, pass --config")?;
            if path.exists() && !force {
                return Err(format!("{:?} already exists, pass --force to overwrite", path).into());
            }
            Config::default().save_to(&path)?;
        }
        ConfigCommands::Show => print!("{}", config.to_toml()?),
    }
    Ok(())
}
