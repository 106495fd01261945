use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lark_gateway::pipeline::TurnPipeline;
use lark_gateway::providers::{ProviderRegistry, ProviderSet};
use lark_gateway::server::{self, AppState};
use lark_gateway::tools::ToolExecutor;
use lark_gateway::{Config, EventBus};

/// Lark - Real-time voice assistant gateway
#[derive(Parser)]
#[command(name = "lark", version, about)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, env = "LARK_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(long, env = "LARK_PORT")]
    port: Option<u16>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server (default)
    Serve,
    /// Load and validate configuration, then exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,lark_gateway=info",
        1 => "info,lark_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match cli.config.as_deref() {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    if let Some(Command::CheckConfig) = cli.command {
        config.validate()?;
        let registry = ProviderRegistry::builtin();
        ProviderSet::from_config(&registry, &config.providers)?;
        println!("configuration ok");
        println!(
            "  listen      {}:{}",
            config.server.host, config.server.port
        );
        println!(
            "  audio       {} Hz, {} ch, {} ms frames",
            config.audio.sample_rate, config.audio.channels, config.audio.frame_ms
        );
        println!(
            "  providers   stt={} intent={} llm={} tts={}",
            config.providers.transcriber,
            config.providers.intent,
            config.providers.generator,
            config.providers.synthesizer
        );
        return Ok(());
    }

    config.validate()?;
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "starting lark gateway"
    );

    let registry = ProviderRegistry::builtin();
    let providers = ProviderSet::from_config(&registry, &config.providers)?;
    let tools = Arc::new(ToolExecutor::builtin());
    let pipeline = TurnPipeline::new(providers, tools, config.pipeline.clone());

    let state = Arc::new(AppState {
        pipeline,
        events: EventBus::default(),
        config,
    });

    tracing::info!("lark gateway ready");
    server::serve(state).await?;

    Ok(())
}
