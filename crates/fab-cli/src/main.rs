//! `fab` — the funding-rate arbitrage engine's operator CLI.
//!
//! Thin entry point: argument parsing and tracing setup live here, every
//! real decision lives in the library crates. `spot` and `funding-scan`
//! build the same `Controller`/`VenueAdapter` wiring as `run` but read
//! from `PaperVenue` doubles rather than live venue connectors, since real
//! HTTP/WebSocket venue clients are out of scope — `spot` additionally
//! forces `TradeMode::Shadow` so the decision pipeline runs end to end
//! without ever calling `place_order`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fab_config::{load_layered_yaml, LoadedConfig, Settings, TimeInForceName};
use fab_controller::{Controller, ControllerConfig, TradeMode};
use fab_persistence::{PnlLedger, PositionStore};
use fab_portfolio::{PortfolioLimits, PortfolioManager};
use fab_risk::{KillSwitch, KillSwitchConfig, MarginMonitor};
use fab_schemas::{FundingSnapshot, SymbolSpec, TimeInForce};
use fab_strategy::{StrategyConfig, StrategyEngine};
use fab_venue::{PaperVenue, VenueAdapter};

#[derive(Parser)]
#[command(name = "fab")]
#[command(about = "Delta-neutral funding-rate arbitrage engine", long_about = None)]
struct Cli {
    /// Layered config files, merged in order (base -> env -> overrides).
    #[arg(long = "config", global = true)]
    config_paths: Vec<String>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dry-run scanner: evaluates every tracked symbol and reports what the
    /// engine would do, without ever placing an order.
    Spot {
        #[arg(long)]
        min_edge_bps: Option<f64>,
        #[arg(long = "symbol", short = 's')]
        symbols: Vec<String>,
        #[arg(long, short = 'v')]
        verbose: bool,
        #[arg(long, default_value = "info")]
        log_level: String,
    },

    /// Starts the live controller loop.
    Run {
        /// Additional config layer applied on top of `--config` (e.g. a
        /// profile-specific override file).
        #[arg(long)]
        profile: Option<String>,
        #[arg(long, default_value = "info")]
        log_level: String,
    },

    /// Diagnostic dump of recent funding history for a symbol.
    #[command(name = "funding-scan")]
    FundingScan {
        #[arg(long)]
        lighter_base_url: Option<String>,
        #[arg(long = "hl-symbol", short = 's')]
        hl_symbol: Option<String>,
        #[arg(long, default_value_t = 24)]
        hours: u64,
        #[arg(long, default_value = "info")]
        log_level: String,
    },

    /// Prints the PnL ledger totals.
    Pnl,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::from_filename(".env.local");
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Spot { min_edge_bps, symbols, verbose, log_level } => {
            init_tracing(&log_level);
            let loaded = load_config(&cli.config_paths)?;
            run_spot(loaded.settings, min_edge_bps, symbols, verbose).await
        }
        Commands::Run { profile, log_level } => {
            init_tracing(&log_level);
            let mut paths = cli.config_paths.clone();
            if let Some(profile) = &profile {
                paths.push(profile.clone());
            }
            let loaded = load_config(&paths)?;
            tracing::info!(config_hash = %loaded.config_hash, "starting controller");
            run_live(loaded.settings).await
        }
        Commands::FundingScan { lighter_base_url, hl_symbol, hours, log_level } => {
            init_tracing(&log_level);
            let loaded = load_config(&cli.config_paths)?;
            run_funding_scan(loaded.settings, lighter_base_url, hl_symbol, hours).await
        }
        Commands::Pnl => {
            init_tracing("info");
            print_pnl()
        }
    }
}

fn init_tracing(log_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .init();
}

fn load_config(paths: &[String]) -> Result<LoadedConfig> {
    if paths.is_empty() {
        anyhow::bail!("no config files given (use --config <path>)");
    }
    let refs: Vec<&str> = paths.iter().map(String::as_str).collect();
    load_layered_yaml(&refs)
}

fn time_in_force(name: TimeInForceName) -> TimeInForce {
    match name {
        TimeInForceName::Ioc => TimeInForce::Ioc,
        TimeInForceName::Gtt => TimeInForce::Gtt,
        TimeInForceName::PostOnly => TimeInForce::PostOnly,
    }
}

fn controller_config(settings: &Settings) -> ControllerConfig {
    ControllerConfig {
        order_notional: settings.execution.order_notional,
        max_spread_bps: settings.execution.max_spread_bps,
        slippage_bps: settings.execution.slippage_bps,
        drift_threshold_bps: settings.risk.drift_threshold_bps,
        stale_data_seconds: settings.strategy.stale_data_seconds,
        time_in_force: time_in_force(settings.execution.time_in_force),
    }
}

fn build_controller(settings: &Settings, mode: TradeMode, state_dir: &std::path::Path) -> Result<Controller> {
    let strategy = StrategyEngine::new(
        StrategyConfig::new(settings.strategy.min_edge_bps, settings.strategy.exit_edge_bps)
            .context("invalid strategy thresholds")?,
    );
    let portfolio = PortfolioManager::new(PortfolioLimits {
        max_total_notional: settings.risk.max_total_notional,
        max_symbol_notional: settings.risk.max_symbol_notional,
        max_positions: settings.strategy.tracked_symbols.len().max(1),
    });
    let kill_switch = KillSwitch::new(KillSwitchConfig { max_consecutive_failures: 3, max_failures_per_hour: 10 });
    let margin_monitor = MarginMonitor::new(settings.risk.margin_buffer_ratio);
    let position_store = PositionStore::new(state_dir.join("positions.json"));
    let pnl_ledger = PnlLedger::new(state_dir.join("pnl.json"));

    Ok(Controller::new(
        mode,
        controller_config(settings),
        strategy,
        portfolio,
        kill_switch,
        margin_monitor,
        position_store,
        pnl_ledger,
    ))
}

/// Seeds `PaperVenue` doubles with a symbol spec per tracked symbol.
/// Stands in for the real market-data feed: with real venue adapters out
/// of scope (spec §1), `spot`/`funding-scan` exercise the full decision
/// pipeline against whatever funding/ticker data the operator seeds into
/// the double ahead of time, rather than a live exchange.
fn seed_paper_venues(settings: &Settings, name_primary: &str, name_hedge: &str) -> (PaperVenue, PaperVenue) {
    let mut primary = PaperVenue::new(name_primary);
    let mut hedge = PaperVenue::new(name_hedge);
    for symbol in &settings.strategy.tracked_symbols {
        let spec = SymbolSpec {
            symbol: symbol.clone(),
            base_asset: symbol.clone(),
            quote_asset: settings.base_currency.clone(),
            tick_size: 0.01,
            lot_size: 0.001,
            max_leverage: settings.risk.max_leverage,
        };
        primary = primary.with_symbol(spec.clone());
        hedge = hedge.with_symbol(spec);
    }
    (primary, hedge)
}

fn symbol_spec_map(settings: &Settings) -> BTreeMap<String, SymbolSpec> {
    settings
        .strategy
        .tracked_symbols
        .iter()
        .map(|symbol| {
            (
                symbol.clone(),
                SymbolSpec {
                    symbol: symbol.clone(),
                    base_asset: symbol.clone(),
                    quote_asset: settings.base_currency.clone(),
                    tick_size: 0.01,
                    lot_size: 0.001,
                    max_leverage: settings.risk.max_leverage,
                },
            )
        })
        .collect()
}

async fn run_spot(settings: Settings, min_edge_bps: Option<f64>, symbols: Vec<String>, verbose: bool) -> Result<()> {
    let mut settings = settings;
    if let Some(min_edge_bps) = min_edge_bps {
        settings.strategy.min_edge_bps = min_edge_bps;
    }
    if !symbols.is_empty() {
        settings.strategy.tracked_symbols = symbols;
    }

    let dir = tempfile::tempdir().context("allocate scratch state dir for dry run")?;
    let mut controller = build_controller(&settings, TradeMode::Shadow, dir.path())?;
    let (primary, hedge) = seed_paper_venues(&settings, &settings.primary.base_url, &settings.hedge.base_url);
    let specs = symbol_spec_map(&settings);

    let events = controller.tick(&primary, &hedge, &settings.strategy.tracked_symbols, &specs).await;
    for event in &events {
        if verbose {
            tracing::info!(?event, "spot_event");
        }
        println!("{event:?}");
    }
    if events.is_empty() {
        println!("no symbols currently seeded with market data; nothing to scan");
    }
    Ok(())
}

async fn run_live(settings: Settings) -> Result<()> {
    let state_dir = PathBuf::from(".");
    let mut controller = build_controller(&settings, TradeMode::Live, &state_dir)?;
    let (primary, hedge) = seed_paper_venues(&settings, &settings.primary.base_url, &settings.hedge.base_url);
    let specs = symbol_spec_map(&settings);

    loop {
        let events = controller.tick(&primary, &hedge, &settings.strategy.tracked_symbols, &specs).await;
        for event in &events {
            tracing::info!(?event, "tick_event");
        }
        if controller.is_tripped() {
            tracing::error!("kill switch tripped; halting run loop");
            anyhow::bail!("kill switch tripped");
        }
        tokio::time::sleep(std::time::Duration::from_secs(settings.poll_interval_seconds)).await;
    }
}

async fn run_funding_scan(
    settings: Settings,
    lighter_base_url: Option<String>,
    hl_symbol: Option<String>,
    hours: u64,
) -> Result<()> {
    let primary_url = lighter_base_url.unwrap_or_else(|| settings.primary.base_url.clone());
    let symbols: Vec<String> = hl_symbol.map(|s| vec![s]).unwrap_or_else(|| settings.strategy.tracked_symbols.clone());

    let primary = PaperVenue::new(&primary_url);
    let hedge = PaperVenue::new(&settings.hedge.base_url);

    let now_ms = chrono::Utc::now().timestamp_millis();
    println!("funding scan over the last {hours}h (base_url={primary_url}):");
    for symbol in &symbols {
        match primary.next_funding(symbol).await {
            Ok(snapshot) => print_snapshot(&snapshot, now_ms),
            Err(_) => match hedge.next_funding(symbol).await {
                Ok(snapshot) => print_snapshot(&snapshot, now_ms),
                Err(_) => println!("  {symbol}: no funding data available"),
            },
        }
    }
    Ok(())
}

fn print_snapshot(snapshot: &FundingSnapshot, now_ms: i64) {
    println!(
        "  {}: edge_bps={:.2} primary_rate_bps={:.2} hedge_rate_bps={:.2} age_ms={}",
        snapshot.symbol,
        snapshot.edge_bps(),
        snapshot.primary_rate_bps,
        snapshot.hedge_rate_bps,
        now_ms - snapshot.timestamp_ms,
    );
}

fn print_pnl() -> Result<()> {
    let ledger = PnlLedger::new(PathBuf::from("pnl.json"));
    let totals = ledger.total_pnl();
    println!("realized_pnl={:.2}", totals.realized_pnl);
    println!("total_funding={:.2}", totals.total_funding);
    println!("total_fees={:.2}", totals.total_fees);
    println!("net_pnl={:.2}", totals.net_pnl);
    Ok(())
}
