//! crypto-trader - main entry point
//!
//! One subcommand: `run`, in paper (test) or live mode.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crypto_trader::clock::SystemClock;
use crypto_trader::exchange::{BitflyerClient, ExchangeApi, PaperExchange};
use crypto_trader::signals::{NullCointegrationProvider, NullSignalProvider};
use crypto_trader::store::SqliteStore;
use crypto_trader::{Config, CryptoTrader};

#[derive(Parser, Debug)]
#[command(name = "crypto-trader")]
#[command(about = "Automated crypto trading engine with trend and pair strategies", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the trading loop
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "configs/trader.json")]
        config: String,

        /// Test mode: paper exchange, no API keys required
        #[arg(long)]
        test: bool,

        /// Live mode: real orders with real funds
        #[arg(long)]
        live: bool,

        /// Cycle interval in minutes (overrides config)
        #[arg(long)]
        interval: Option<u64>,

        /// Database path
        #[arg(long, default_value = "state/trader.db")]
        state_db: String,

        /// Skip the live-mode confirmation countdown
        #[arg(short, long)]
        yes: bool,
    },
}

fn init_tracing(verbose: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily("logs", "crypto-trader.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose { "debug" } else { "info" })
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .init();
    guard
}

fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            test,
            live,
            interval,
            state_db,
            yes,
        } => {
            if !test && !live {
                bail!("specify either --test or --live");
            }
            if test && live {
                bail!("--test and --live are mutually exclusive");
            }

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to build tokio runtime")?;
            runtime.block_on(run(config, live, interval, state_db, yes))
        }
    }
}

async fn run(
    config_path: String,
    live_mode: bool,
    interval: Option<u64>,
    state_db: String,
    skip_confirmation: bool,
) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let interval_minutes = interval.unwrap_or(config.trading.trading_interval_minutes);

    if live_mode {
        warn!("⚠️  ════════════════════════════════════════════");
        warn!("⚠️  LIVE TRADING MODE - REAL MONEY AT RISK");
        warn!("⚠️  ════════════════════════════════════════════");
        if !skip_confirmation {
            print!("Continue in live mode? (yes/no): ");
            std::io::stdout().flush().ok();
            let mut answer = String::new();
            std::io::stdin().read_line(&mut answer).ok();
            if !matches!(answer.trim().to_lowercase().as_str(), "yes" | "y") {
                info!("startup cancelled");
                return Ok(());
            }
            for i in (1..=5).rev() {
                info!("starting in {}...", i);
                sleep(Duration::from_secs(1)).await;
            }
        }
    }

    let exchange: Arc<dyn ExchangeApi> = if live_mode {
        let api_key = config
            .exchange
            .api_key
            .clone()
            .context("live mode requires BITFLYER_API_KEY")?;
        let api_secret = config
            .exchange
            .api_secret
            .clone()
            .context("live mode requires BITFLYER_API_SECRET")?;
        Arc::new(BitflyerClient::new(api_key, api_secret).with_limits(
            config.exchange.max_order_cost,
            config.exchange.balance_buffer,
            config.exchange.commission_rate,
        ))
    } else {
        info!("test mode: using paper exchange");
        Arc::new(PaperExchange::new(config.trading.initial_capital))
    };

    let store = Arc::new(SqliteStore::open(&state_db)?);

    // Model backends plug in through the library API; the binary defaults
    // to providers that never signal an entry
    let mut trader = CryptoTrader::new(
        config,
        Some(PathBuf::from(&config_path)),
        exchange,
        store,
        Box::new(NullSignalProvider),
        Box::new(NullCointegrationProvider),
        Arc::new(SystemClock),
        live_mode,
    );
    trader.initialize()?;

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Ctrl+C received, shutting down...");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => error!("signal handler error: {}", e),
        }
    });

    trader.start(interval_minutes, shutdown_rx).await?;
    info!("trading session ended");
    Ok(())
}
