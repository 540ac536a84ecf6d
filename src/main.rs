use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use threadloom_core::config::AppConfig;
use threadloom_core::event::EventBus;
use threadloom_core::types::{GraphId, NodeId, PlanDirection, PlanWarning};
use threadloom_gateway::GatewayServer;
use threadloom_graph::ExecutionPlanner;

#[derive(Parser)]
#[command(name = "threadloom", version, about = "Node-graph planner and stream gateway for LLM conversations")]
struct Cli {
    /// Path to config file (defaults to ~/.threadloom/config.toml)
    #[arg(short, long, env = "THREADLOOM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP/WebSocket gateway
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<String>,
    },
    /// Print the execution plan for a node
    Plan {
        /// Graph id
        graph: String,
        /// Start node id
        node: String,
        /// self, upstream, downstream, all or multiple
        #[arg(short, long, default_value = "self")]
        direction: String,
        /// Comma-separated node kinds for the multiple direction
        #[arg(short, long, default_value = "")]
        kinds: String,
        /// Emit the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the effective configuration
    Config,
    /// Mint a signed client token
    Token {
        /// Token subject
        subject: String,
        /// Lifetime in seconds (defaults to gateway.token_ttl_secs)
        #[arg(long)]
        ttl: Option<u64>,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "threadloom", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.gateway.bind = bind;
            }
            let store = threadloom_store::open_store(&config.store)?;
            let backend = threadloom_llm::create_backend(&config.provider)?;
            let event_bus = std::sync::Arc::new(EventBus::default());

            info!(
                bind = %config.gateway.bind,
                store = ?config.store.backend,
                model = %config.provider.default_model,
                "Starting gateway"
            );
            if config.gateway.is_open() {
                tracing::warn!("No token secret or api keys configured, gateway is open");
            }

            let server = GatewayServer::new(config, store, backend, event_bus);
            let cancel = tokio_util::sync::CancellationToken::new();
            let cancel_clone = cancel.clone();

            // Graceful shutdown on Ctrl-C
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down gateway...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
        }
        Commands::Plan {
            graph,
            node,
            direction,
            kinds,
            json,
        } => {
            let kinds = PlanDirection::parse_kinds(&kinds)?;
            let direction = PlanDirection::parse(&direction, &kinds)?;
            let store = threadloom_store::open_store(&config.store)?;
            let planner = ExecutionPlanner::new(store);
            let plan = planner
                .plan(&GraphId::from_string(&graph), &NodeId::from(node.as_str()), &direction)
                .await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                for (i, id) in plan.nodes.iter().enumerate() {
                    println!("{:>3}. {id}", i + 1);
                }
                for warning in &plan.warnings {
                    match warning {
                        PlanWarning::CycleBroken { node } => {
                            eprintln!("warning: cycle broken at {node}");
                        }
                    }
                }
            }
        }
        Commands::Config => {
            println!("{}", config.to_toml()?);
        }
        Commands::Token { subject, ttl } => {
            let Some(secret) = config.gateway.token_secret.as_deref() else {
                anyhow::bail!("gateway.token_secret is not set");
            };
            let ttl = ttl.unwrap_or(config.gateway.token_ttl_secs);
            let now = chrono::Utc::now().timestamp();
            println!("{}", threadloom_gateway::mint_token(secret, &subject, ttl, now));
        }
        // Handled before config loading
        Commands::Completions { .. } => {}
    }

    Ok(())
}
