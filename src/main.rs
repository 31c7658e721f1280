use anyhow::{Context, Result};
use broker_config::BrokerConfig;
use broker_mcp::McpBroker;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mcp-broker")]
#[command(about = "Aggregates MCP tool providers into one namespaced tool menu", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE", default_value = "config.yaml")]
    config: PathBuf,

    #[arg(short, long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, action = clap::ArgAction::SetTrue)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the aggregated tool catalog
    Tools {
        /// Rebuild the catalog even if one is cached
        #[arg(short, long, action = clap::ArgAction::SetTrue)]
        refresh: bool,
    },

    /// Route a tool call by its namespaced name
    Call {
        /// Namespaced tool name, as printed by `tools`
        name: String,

        /// Tool arguments as a JSON object
        #[arg(short, long, default_value = "{}")]
        args: String,
    },

    /// List resources across providers
    Resources,

    /// Read one resource from a provider
    Read { server: String, uri: String },

    /// Show configured and connected servers
    Servers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json)?;

    let config = if cli.config.exists() {
        info!("Loading configuration from: {:?}", cli.config);
        BrokerConfig::from_yaml(&cli.config)?
    } else {
        info!("No configuration at {:?}, starting with no servers", cli.config);
        BrokerConfig::default()
    };

    let broker = McpBroker::new(config.servers).with_default_timeout_ms(config.defaults.timeout_ms);
    broker.init().await;

    let outcome = run(&broker, cli.command).await;
    broker.shutdown().await;

    print_json(&outcome?)
}

async fn run(broker: &McpBroker, command: Commands) -> Result<Value> {
    match command {
        Commands::Tools { refresh } => {
            let tools = broker.list_tools(refresh).await;
            Ok(serde_json::to_value(tools.as_slice())?)
        }
        Commands::Call { name, args } => {
            let arguments: Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            broker.list_tools(false).await;
            Ok(broker.call_tool(&name, arguments).await?)
        }
        Commands::Resources => {
            let resources = broker.list_resources().await;
            Ok(serde_json::to_value(resources)?)
        }
        Commands::Read { server, uri } => Ok(broker.read_resource(&server, &uri).await?),
        Commands::Servers => {
            let configured: Vec<Value> = broker
                .configured_servers()
                .iter()
                .map(|s| json!({ "id": s.id, "transport": s.transport.as_str() }))
                .collect();
            Ok(json!({
                "configured": configured,
                "connected": broker.connected_servers().await,
            }))
        }
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<()> {
    let filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    // stdout carries command output, so logs go to stderr
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    Ok(())
}
