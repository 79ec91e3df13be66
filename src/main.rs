use std::process::ExitCode;
use std::sync::Arc;

use funding_arb::config::MarketDataMode;
use funding_arb::engine::Engine;
use funding_arb::execution::ExecutionService;
use funding_arb::market::{FundingFeedClient, MarketDataService};
use funding_arb::monitoring::WebhookNotifier;
use funding_arb::persistence::StateStore;
use funding_arb::venue::VenueRouter;
use funding_arb::Config;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

// Exit codes: 0 clean shutdown, 1 configuration error,
// 2 unrecoverable state divergence, 3 lock acquisition failure.
const EXIT_CONFIG: u8 = 1;
const EXIT_DIVERGENCE: u8 = 2;
const EXIT_LOCK: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    info!("Starting Funding Arb v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return ExitCode::from(EXIT_CONFIG);
    }
    info!(
        cycle_period_secs = config.engine.cycle_period_seconds,
        universe_size = config.universe.universe_size,
        max_total_notional = %config.risk.max_total_notional_usd,
        "Configuration loaded"
    );

    let feed = match FundingFeedClient::new(&config.feed) {
        Ok(feed) => Arc::new(feed),
        Err(e) => {
            error!(error = %e, "Failed to build feed client");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    // Venue adapter handles are injected by the hosting integration;
    // the bare binary runs aggregator-only with an empty router, which
    // observes and scores but cannot execute.
    let market = match config.market_data.mode {
        MarketDataMode::AggregatorOnly => {
            MarketDataService::aggregator_only(Arc::clone(&feed), &config.market_data)
        }
        MarketDataMode::Hybrid | MarketDataMode::VenueOnly => {
            error!("hybrid/venue_only modes require injected venue adapters");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let router = VenueRouter::default();
    if router.venues().next().is_none() {
        warn!("No venue adapters registered; intents will be rejected pre-flight");
    }
    let execution =
        ExecutionService::new(router, config.execution.clone(), config.risk.max_leverage);

    let store = match StateStore::open(&config.engine.state_db_path) {
        Ok(store) => store,
        Err(e) => {
            error!(error = %e, "Failed to open state store");
            return ExitCode::from(EXIT_CONFIG);
        }
    };
    let notifier = WebhookNotifier::new(&config.monitoring);

    let mut engine = match Engine::new(config, market, execution, store, notifier) {
        Ok(engine) => engine,
        Err(e) => {
            error!(error = %e, "Failed to assemble engine");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match engine.acquire_instance_lock() {
        Ok(true) => {}
        Ok(false) => {
            error!("Another instance holds the state-store lock");
            return ExitCode::from(EXIT_LOCK);
        }
        Err(e) => {
            error!(error = %e, "Lock acquisition failed");
            return ExitCode::from(EXIT_LOCK);
        }
    }

    if let Err(e) = engine.reconcile_on_start().await {
        error!(error = %e, "Unrecoverable state divergence at startup");
        let _ = engine.release_instance_lock();
        return ExitCode::from(EXIT_DIVERGENCE);
    }

    tokio::select! {
        result = engine.run() => {
            if let Err(e) = result {
                error!(error = %e, "Engine stopped unexpectedly");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting...");
        }
    }

    if let Err(e) = engine.release_instance_lock() {
        warn!(error = %e, "Failed to release instance lock");
    }
    ExitCode::SUCCESS
}
