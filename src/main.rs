use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portero::config::{Config, LoggingConfig};
use portero::error::ConfigError;
use portero::utils::{format_duration, resolve_socket_addr};
use portero::{Algorithm, Portero, Request};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "portero")]
#[command(about = "Backend routing and connection-lifecycle engine for L4/L7 load balancers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = "Portero Team")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run health checks and connection housekeeping for the configured clusters
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config/dev.toml")]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Balancing algorithm of the example cluster
        #[arg(short, long, value_enum, default_value = "round-robin")]
        algorithm: AlgorithmArg,
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Validate configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show which node a client would be routed to
    Route {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Cluster name
        #[arg(long)]
        cluster: String,
        /// Client address, `ip:port`
        #[arg(long)]
        client: String,
    },
    /// Show version information
    Version,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum AlgorithmArg {
    RoundRobin,
    Random,
    SourceIpHash,
    FourTupleHash,
    StickySession,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::RoundRobin => Algorithm::RoundRobin,
            AlgorithmArg::Random => Algorithm::Random,
            AlgorithmArg::SourceIpHash => Algorithm::SourceIpHash,
            AlgorithmArg::FourTupleHash => Algorithm::FourTupleHash,
            AlgorithmArg::StickySession => Algorithm::StickySession,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => run_portero(config).await?,
        Commands::Config { algorithm, output } => generate_config(algorithm.into(), output)?,
        Commands::Validate { config } => validate_config(config)?,
        Commands::Route {
            config,
            cluster,
            client,
        } => route_client(config, &cluster, &client)?,
        Commands::Version => show_version(),
    }

    Ok(())
}

async fn run_portero(config_path: PathBuf) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;

    init_logging(&config.logging)?;

    info!("Starting portero v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded from: {:?}", config_path);

    let portero = Portero::from_config(&config).context("Failed to build clusters")?;
    for cluster in portero.clusters() {
        info!(
            "Cluster {}: {} nodes, algorithm {}, idle timeout {}",
            cluster.name(),
            cluster.len(),
            cluster.settings().algorithm,
            format_duration(cluster.settings().idle_timeout)
        );
    }

    portero.start().context("Failed to start controller")?;
    info!("Portero running, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down");
    portero.shutdown().await;
    Ok(())
}

fn generate_config(algorithm: Algorithm, output: PathBuf) -> Result<()> {
    println!("Generating {} configuration file: {:?}", algorithm, output);

    Config::create_example_config(&output, algorithm).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  portero run --config {:?}", output);

    Ok(())
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    match Config::load_from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration file is valid");
            println!("  Log level: {} ({})", config.logging.level, config.logging.format);
            println!("  Clusters: {}", config.clusters.len());

            for cluster in &config.clusters {
                println!(
                    "  {} ({}): {} nodes",
                    cluster.name,
                    cluster.algorithm,
                    cluster.nodes.len()
                );
                for (i, node) in cluster.nodes.iter().enumerate() {
                    let probe = node
                        .health_check
                        .as_ref()
                        .map(|check| format!("{:?}", check.protocol).to_lowercase())
                        .unwrap_or_else(|| "none".to_string());
                    println!("    {}: {} at {} (health check: {})", i + 1, node.id(), node.addr, probe);
                }
            }
        }
        Err(e) => {
            eprintln!("✗ Configuration file validation failed:");
            match &e {
                ConfigError::IoError(msg) => eprintln!("  File error: {}", msg),
                ConfigError::ParseError(msg) => eprintln!("  Parse error: {}", msg),
                ConfigError::ValidationError(msg) => eprintln!("  Validation error: {}", msg),
                ConfigError::SerializeError(msg) => eprintln!("  Serialization error: {}", msg),
            }
            return Err(e.into());
        }
    }

    Ok(())
}

fn route_client(config_path: PathBuf, cluster: &str, client: &str) -> Result<()> {
    let config = Config::load_from_file(&config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    let client = resolve_socket_addr(client).with_context(|| format!("Invalid client address {}", client))?;

    let portero = Portero::from_config(&config)?;
    let response = portero.route(cluster, &Request::new(client))?;

    println!(
        "{} -> {} ({})",
        client,
        response.node.id(),
        response.node.addr()
    );
    if let Some(cookie) = response.set_cookie {
        println!("Set-Cookie: {}", cookie);
    }
    Ok(())
}

fn show_version() {
    println!("portero v{}", env!("CARGO_PKG_VERSION"));
    println!("Backend routing and connection-lifecycle engine for L4/L7 load balancers");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • Round robin, random, source-IP, 4-tuple and sticky-cookie balancing");
    println!("  • Pooled backend connections with write backlog");
    println!("  • TCP, UDP and HTTP health checks");
    println!("  • Event-driven node lifecycle reconciliation");
}

fn init_logging(config: &LoggingConfig) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    info!("Logging initialized at level: {}", config.level);
    Ok(())
}
