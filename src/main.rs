use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use bandbot::config::{ApiCredentials, BotConfig};
use bandbot::trading_core::{SessionLoop, TradingSession};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Path to the trading parameters file
    #[arg(short, long, env = "BANDBOT_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Use the exchange testnet endpoints
    #[arg(long, env = "BANDBOT_TESTNET", default_value = "false")]
    testnet: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bandbot=info".parse().unwrap()),
        )
        .init();

    let args = Args::parse();

    let config = BotConfig::load(&args.config)?;
    let credentials = ApiCredentials::from_env()?;

    info!("Starting band bot for {}", config.pair);
    info!("Timeframe: {}m, window: {}", config.bands.timeframe_minutes, config.bands.length);
    if args.testnet {
        info!("Using testnet endpoints");
    }

    let mut session = TradingSession::connect(config, credentials, args.testnet).await?;
    session.init_trading_data().await?;
    session.start_streams();

    if let Err(e) = SessionLoop::new(session)?.run().await {
        // Stale market data is the one fault that lands here; the process
        // must stop rather than keep trading blind.
        error!("fatal: {e:#}");
        std::process::exit(2);
    }

    Ok(())
}
