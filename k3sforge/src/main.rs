use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use k3sforge::args::{AgentArgs, ConnectionArgs, ServerArgs};
use k3sforge::Inventory;
use k3sforge_core::{DirectoryAssets, EmbeddedAssets, EngineConfig, K3sError, SshTransport};
use k3sforge_node::component::Assets;
use k3sforge_node::operations::{
    create_agent, create_server, read_agent, read_kubeconfig, read_server, update_agent,
    update_server,
};
use k3sforge_node::{Component, HaCoordinator, HaSession, Role, SshConnector, UninstallOptions};

#[derive(Parser)]
#[command(name = "k3sforge")]
#[command(about = "Install, update and bootstrap k3s clusters over SSH", long_about = None)]
struct Cli {
    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "K3SFORGE_CONFIG")]
    engine_config: Option<PathBuf>,

    /// Read the install script from this directory instead of the built-in shim
    #[arg(long, global = true)]
    assets_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Single k3s server operations
    Server {
        #[command(subcommand)]
        command: ServerCommands,
    },
    /// Single k3s agent operations
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// HA control-plane operations driven by an inventory file
    Ha {
        #[command(subcommand)]
        command: HaCommands,
    },
    /// Engine configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(clap::Subcommand)]
enum ServerCommands {
    /// Write files, install and start a server
    Install {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Push new config and restart if anything changed
    Update {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[command(flatten)]
        server: ServerArgs,
    },
    /// Report whether the k3s unit is active
    Status {
        #[command(flatten)]
        conn: ConnectionArgs,
    },
    /// Rebuild server state from the node
    Resync {
        #[command(flatten)]
        conn: ConnectionArgs,
    },
    /// Run the server uninstall script
    Uninstall {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[arg(long)]
        bin_dir: Option<String>,
    },
    /// Print the server's kubeconfig
    Kubeconfig {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Host to put in the kubeconfig instead of the SSH host
        #[arg(long)]
        hostname: Option<String>,
        /// Print nothing instead of failing when the node has no kubeconfig
        #[arg(long)]
        allow_empty: bool,
        /// Print the kubeconfig YAML rather than a JSON report
        #[arg(long)]
        raw: bool,
    },
}

#[derive(clap::Subcommand)]
enum AgentCommands {
    /// Write files, install and start an agent
    Install {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[command(flatten)]
        agent: AgentArgs,
    },
    /// Push new config and restart if anything changed
    Update {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[command(flatten)]
        agent: AgentArgs,
    },
    Status {
        #[command(flatten)]
        conn: ConnectionArgs,
    },
    Resync {
        #[command(flatten)]
        conn: ConnectionArgs,
    },
    /// Remove the node from the cluster, then run the agent uninstall script
    Uninstall {
        #[command(flatten)]
        conn: ConnectionArgs,
        #[arg(long)]
        bin_dir: Option<String>,
        /// Cluster kubeconfig used to delete the Node object
        #[arg(long)]
        kubeconfig: Option<PathBuf>,
        /// Uninstall even if the Node object could not be deleted
        #[arg(long)]
        allow_node_delete_err: bool,
    },
}

#[derive(clap::Subcommand)]
enum HaCommands {
    /// Initialize the first node and join the rest
    Bootstrap {
        #[arg(long)]
        inventory: PathBuf,
    },
    Status {
        #[arg(long)]
        inventory: PathBuf,
    },
    Uninstall {
        #[arg(long)]
        inventory: PathBuf,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Print the effective engine configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let engine = load_engine_config(cli.engine_config.as_ref())?;

    // Initialize logging on stderr; stdout carries the JSON results
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for target in ["k3sforge", "k3sforge_core", "k3sforge_node"] {
        filter = filter.add_directive(
            format!("{}={}", target, engine.logging.level)
                .parse()
                .map_err(|e| K3sError::ConfigError(format!("Invalid log directive: {}", e)))?,
        );
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let assets: Assets = match &cli.assets_dir {
        Some(dir) => Arc::new(DirectoryAssets::new(dir)),
        None => Arc::new(EmbeddedAssets),
    };

    match cli.command {
        Commands::Server { command } => handle_server_command(command, &engine, assets).await,
        Commands::Agent { command } => handle_agent_command(command, &engine, assets).await,
        Commands::Ha { command } => handle_ha_command(command, &engine, assets).await,
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                print!("{}", toml::to_string_pretty(&engine)?);
                Ok(())
            }
        },
    }
}

fn load_engine_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading engine config {}", path.display())),
        None => {
            let mut config = EngineConfig::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn connect(conn: &ConnectionArgs, engine: &EngineConfig) -> anyhow::Result<SshTransport> {
    let auth = conn.node_auth(engine)?;
    Ok(SshTransport::new(&auth, engine)?)
}

fn bare_server_args(bin_dir: Option<String>) -> ServerArgs {
    let mut args = ServerArgs::default();
    args.component.bin_dir = bin_dir;
    args
}

async fn handle_server_command(
    command: ServerCommands,
    engine: &EngineConfig,
    assets: Assets,
) -> anyhow::Result<()> {
    match command {
        ServerCommands::Install { conn, server } => {
            let shell = connect(&conn, engine)?;
            let mut server = server.server(engine, assets)?;
            let report = create_server(&shell, &mut server).await?;
            print_json(&report)?;
            if !report.active {
                anyhow::bail!("server on {} installed but not active", conn.host);
            }
        }
        ServerCommands::Update { conn, server } => {
            let shell = connect(&conn, engine)?;
            let mut server = server.server(engine, assets)?;
            let outcome = update_server(&shell, &mut server).await?;
            print_json(&json!({ "id": Role::Server.id(&conn.host), "update": outcome }))?;
        }
        ServerCommands::Status { conn } => {
            let shell = connect(&conn, engine)?;
            let server = ServerArgs::default().server(engine, assets)?;
            let status = server.status(&shell).await?;
            print_json(&json!({ "id": Role::Server.id(&conn.host), "status": status }))?;
        }
        ServerCommands::Resync { conn } => {
            let shell = connect(&conn, engine)?;
            let mut server = ServerArgs::default().server(engine, assets)?;
            print_json(&read_server(&shell, &mut server).await?)?;
        }
        ServerCommands::Uninstall { conn, bin_dir } => {
            let shell = connect(&conn, engine)?;
            let server = bare_server_args(bin_dir).server(engine, assets)?;
            server.uninstall(&shell, &UninstallOptions::default()).await?;
            print_json(&json!({ "id": Role::Server.id(&conn.host), "uninstalled": true }))?;
        }
        ServerCommands::Kubeconfig {
            conn,
            hostname,
            allow_empty,
            raw,
        } => {
            let shell = connect(&conn, engine)?;
            let mut server = ServerArgs::default().server(engine, assets)?;
            let report =
                read_kubeconfig(&shell, &mut server, hostname.as_deref(), allow_empty).await?;
            match (report, raw) {
                (Some(report), true) => print!("{}", report.kubeconfig),
                (None, true) => {}
                (report, false) => print_json(&report)?,
            }
        }
    }
    Ok(())
}

async fn handle_agent_command(
    command: AgentCommands,
    engine: &EngineConfig,
    assets: Assets,
) -> anyhow::Result<()> {
    match command {
        AgentCommands::Install { conn, agent } => {
            let shell = connect(&conn, engine)?;
            let mut agent = agent.agent(engine, assets, true)?;
            let report = create_agent(&shell, &mut agent).await?;
            print_json(&report)?;
            if !report.active {
                anyhow::bail!("agent on {} installed but not active", conn.host);
            }
        }
        AgentCommands::Update { conn, agent } => {
            let shell = connect(&conn, engine)?;
            let mut agent = agent.agent(engine, assets, false)?;
            let outcome = update_agent(&shell, &mut agent).await?;
            print_json(&json!({ "id": Role::Agent.id(&conn.host), "update": outcome }))?;
        }
        AgentCommands::Status { conn } => {
            let shell = connect(&conn, engine)?;
            let agent = AgentArgs::default().agent(engine, assets, false)?;
            let status = agent.status(&shell).await?;
            print_json(&json!({ "id": Role::Agent.id(&conn.host), "status": status }))?;
        }
        AgentCommands::Resync { conn } => {
            let shell = connect(&conn, engine)?;
            let mut agent = AgentArgs::default().agent(engine, assets, false)?;
            print_json(&read_agent(&shell, &mut agent).await?)?;
        }
        AgentCommands::Uninstall {
            conn,
            bin_dir,
            kubeconfig,
            allow_node_delete_err,
        } => {
            let shell = connect(&conn, engine)?;
            let mut args = AgentArgs::default();
            args.component.bin_dir = bin_dir;
            let agent = args.agent(engine, assets, false)?;
            let kubeconfig = kubeconfig
                .map(|path| {
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("reading kubeconfig {}", path.display()))
                })
                .transpose()?;
            let options = UninstallOptions {
                kubeconfig,
                allow_node_delete_err,
            };
            agent.uninstall(&shell, &options).await?;
            print_json(&json!({ "id": Role::Agent.id(&conn.host), "uninstalled": true }))?;
        }
    }
    Ok(())
}

fn load_session(path: &PathBuf, engine: &EngineConfig) -> anyhow::Result<HaSession> {
    let session = Inventory::from_file(path)
        .and_then(|inventory| inventory.session(engine))
        .with_context(|| format!("loading inventory {}", path.display()))?;
    info!(
        "Loaded inventory {} with {} nodes, initializer {}",
        path.display(),
        session.nodes.len(),
        session.nodes[0].auth.host
    );
    Ok(session)
}

async fn handle_ha_command(
    command: HaCommands,
    engine: &EngineConfig,
    assets: Assets,
) -> anyhow::Result<()> {
    let coordinator = HaCoordinator::new(Box::new(SshConnector::new(engine.clone())), assets);
    let (inventory, result) = match command {
        HaCommands::Bootstrap { inventory } => {
            let session = load_session(&inventory, engine)?;
            (inventory, coordinator.bootstrap(&session).await)
        }
        HaCommands::Status { inventory } => {
            let session = load_session(&inventory, engine)?;
            (inventory, coordinator.status(&session).await)
        }
        HaCommands::Uninstall { inventory } => {
            let session = load_session(&inventory, engine)?;
            (inventory, coordinator.uninstall(&session).await)
        }
    };

    match result {
        Ok(report) => print_json(&report),
        Err(err) => {
            if let Some(report) = err.report() {
                print_json(report)?;
            }
            Err(err).with_context(|| format!("HA operation on {}", inventory.display()))
        }
    }
}
