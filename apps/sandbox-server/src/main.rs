use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sandbox_gateway::{HttpOptions, PipelineConfig, ResponseValidation, SandboxEngine};
use sandbox_oas::{OasDocument, OperationIndex};
use sandbox_rules::{load_rules_file, RuleEngine};
use sandbox_runtime::{
    AppConfig, CliOverrides, LoggingSettings, ResponsesMode, StoreSettings,
};
use sandbox_store::{
    FileStore, FileStoreConfig, MemoryStore, MemoryStoreConfig, RedisStore, RedisStoreConfig,
    StateStore,
};

/// Stateful, specification-driven HTTP mock sandbox.
#[derive(Parser)]
#[command(name = "sandbox-server")]
#[command(about = "Serve an OpenAPI document with stateful, scenario-driven mock responses")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the OpenAPI document (overrides config)
    #[arg(long)]
    oas: Option<String>,

    /// Path to the scenarios file (overrides config)
    #[arg(long)]
    scenarios: Option<String>,

    /// Port for the HTTP server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Seed for deterministic template RNG and data generation
    #[arg(long)]
    seed: Option<String>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server (the default)
    Run,
    /// Load the spec and scenarios, report, and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load_or_default(cli.config.as_ref())?;
    config.apply_cli_overrides(&CliOverrides {
        port: cli.port,
        oas: cli.oas.clone(),
        scenarios: cli.scenarios.clone(),
        seed: cli.seed.clone(),
        verbose: cli.verbose,
    });

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(());
    }

    sandbox_runtime::init_logging(
        &config.logging.clone().unwrap_or_else(LoggingSettings::default),
    )?;

    let oas_path = config
        .oas
        .clone()
        .context("an OpenAPI document is required (config 'oas' or --oas)")?;
    let document = OasDocument::from_file(&oas_path)
        .with_context(|| format!("failed to load spec '{oas_path}'"))?;
    let index = OperationIndex::build(&document)?;

    let rules = match &config.scenarios {
        Some(path) => {
            load_rules_file(path).with_context(|| format!("failed to load scenarios '{path}'"))?
        }
        None => Vec::new(),
    };

    if matches!(cli.command, Some(Commands::Check)) {
        println!(
            "ok: {} operations, {} rules",
            index.operations().len(),
            rules.len()
        );
        return Ok(());
    }

    let store = build_store(&config.store_settings()).await?;

    let pipeline = PipelineConfig {
        validate_requests: config.validate.requests,
        response_validation: match config.validate.responses {
            ResponsesMode::Strict => ResponseValidation::Strict,
            ResponsesMode::Warn => ResponseValidation::Warn,
            ResponsesMode::Off => ResponseValidation::Off,
        },
        seed: config.seed.clone(),
        chaos_latency: config.chaos.latency.clone(),
        chaos_error_rate: config.chaos.error_rate,
        ..Default::default()
    };

    let engine = SandboxEngine::new(index, RuleEngine::new(rules), store.clone(), pipeline);
    let router = sandbox_gateway::router(
        Arc::new(engine),
        &HttpOptions {
            cors_enabled: config.server.cors_enabled,
            ..Default::default()
        },
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid bind address '{}:{}'",
                config.server.host, config.server.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, spec = %oas_path, "sandbox server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = sandbox_runtime::wait_for_shutdown().await {
                tracing::error!(error = %e, "shutdown signal handler failed");
            }
            tracing::info!("shutting down gracefully");
        })
        .await?;

    // flush and release the store (the file backend writes its snapshot here)
    store.close().await?;
    Ok(())
}

async fn build_store(settings: &StoreSettings) -> Result<Arc<dyn StateStore>> {
    Ok(match settings {
        StoreSettings::Memory(memory) => Arc::new(MemoryStore::new(MemoryStoreConfig {
            max_size: memory.max_size,
            default_ttl: memory.default_ttl,
            ..Default::default()
        })),
        StoreSettings::File(file) => Arc::new(
            FileStore::open(FileStoreConfig {
                path: PathBuf::from(&file.path),
                compaction_interval: file.compaction_interval,
                snapshot_on_shutdown: file.snapshot_on_shutdown,
            })
            .context("failed to open file store")?,
        ),
        StoreSettings::Network(network) => Arc::new(
            RedisStore::connect(RedisStoreConfig {
                host: network.host.clone(),
                port: network.port,
                password: network.password.clone(),
                db: network.db,
                key_prefix: network.key_prefix.clone(),
            })
            .await
            .context("failed to connect to the network store")?,
        ),
    })
}
