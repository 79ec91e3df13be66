//! Configuration management for the funding arbitrage engine.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Funding-rate aggregator feed settings
    #[serde(default)]
    pub feed: FeedConfig,
    /// Market-data service settings
    #[serde(default)]
    pub market_data: MarketDataConfig,
    /// Dynamic universe selection criteria
    #[serde(default)]
    pub universe: UniverseConfig,
    /// Pair construction and scoring parameters
    #[serde(default)]
    pub signal: SignalConfig,
    /// Risk caps and drawdown state machine thresholds
    #[serde(default)]
    pub risk: RiskConfig,
    /// Order execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Cycle engine settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Alerting settings
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedConfig {
    /// Base URL of the funding-rate aggregator
    #[serde(default = "default_feed_base_url")]
    pub base_url: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_feed_timeout")]
    pub timeout_secs: u64,
    /// Response cache lifetime in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    /// Maximum fetch attempts before surfacing an error
    #[serde(default = "default_feed_retries")]
    pub max_retries: u32,
}

/// Which market-data composition to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketDataMode {
    /// Funding rates only, from the aggregator feed
    AggregatorOnly,
    /// Funding from the feed, OI and top-of-book from venue adapters
    Hybrid,
    /// Everything from venue adapters
    VenueOnly,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    #[serde(default = "default_market_data_mode")]
    pub mode: MarketDataMode,
    /// Open-interest fallback when a venue adapter cannot supply it
    #[serde(default = "default_oi_usd")]
    pub default_oi_usd: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UniverseConfig {
    /// Number of symbols selected when the static list is empty
    #[serde(default = "default_universe_size")]
    pub universe_size: usize,
    /// Weight of the cross-venue rate spread in the composite score
    #[serde(default = "default_spread_weight")]
    pub spread_weight: Decimal,
    /// Weight of venue coverage
    #[serde(default = "default_coverage_weight")]
    pub coverage_weight: Decimal,
    /// Weight of the average absolute rate
    #[serde(default = "default_rate_weight")]
    pub rate_weight: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SignalConfig {
    /// Minimum funding-rate differential (8h fraction) for a pair
    #[serde(default = "default_fr_diff_min")]
    pub fr_diff_min: Decimal,
    /// Consecutive qualifying cycles required before entry
    #[serde(default = "default_min_persistence_windows")]
    pub min_persistence_windows: u32,
    /// Minimum quality score in [0, 1]
    #[serde(default = "default_min_pair_score")]
    pub min_pair_score: Decimal,
    /// Minimum net edge in bps per 8h
    #[serde(default = "default_expected_edge_min_bps")]
    pub expected_edge_min_bps: Decimal,
    /// Cap on new pair entries per cycle
    #[serde(default = "default_max_new_positions")]
    pub max_new_positions_per_cycle: usize,
    /// Permit both legs on the same venue
    #[serde(default = "default_allow_single_exchange_pairs")]
    pub allow_single_exchange_pairs: bool,
    /// Fraction of capital allocated to the short leg of a new pair
    #[serde(default = "default_capital_fraction")]
    pub capital_fraction: Decimal,
    /// Smallest order the venues will accept, in USD
    #[serde(default = "default_min_order_usd")]
    pub min_order_usd: Decimal,
    /// Taker fee per leg in bps, used when a venue has no explicit entry
    #[serde(default = "default_fee_bps_per_leg")]
    pub fee_bps_per_leg: Decimal,
    /// Per-venue taker fee overrides in bps
    #[serde(default)]
    pub venue_fee_bps: HashMap<String, Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    /// Cap on a single pair's base notional in USD
    #[serde(default = "default_max_notional_per_pair")]
    pub max_notional_per_pair_usd: Decimal,
    /// Cap on total open base notional in USD
    #[serde(default = "default_max_total_notional")]
    pub max_total_notional_usd: Decimal,
    /// Cap on base notional per symbol in USD
    #[serde(default = "default_max_notional_per_symbol")]
    pub max_notional_per_symbol_usd: Decimal,
    /// Cap on leg notional routed to one venue in USD
    #[serde(default = "default_max_notional_per_venue")]
    pub max_notional_per_venue_usd: Decimal,
    /// Venue leverage used for margin requirements
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    /// Leverage ceiling while NORMAL
    #[serde(default = "default_normal_leverage_cap")]
    pub normal_leverage_cap: Decimal,
    /// Leverage ceiling while REDUCE
    #[serde(default = "default_reduce_leverage_cap")]
    pub reduce_leverage_cap: Decimal,
    /// Drawdown fraction that enters REDUCE
    #[serde(default = "default_reduce_drawdown")]
    pub reduce_mode_drawdown_pct: Decimal,
    /// Drawdown fraction that enters HALT_NEW
    #[serde(default = "default_halt_drawdown")]
    pub max_drawdown_stop_pct: Decimal,
    /// Drawdown fraction below which REDUCE recovers to NORMAL
    #[serde(default = "default_recover_normal_drawdown")]
    pub recover_normal_drawdown_pct: Decimal,
    /// Drawdown fraction below which HALT_NEW relaxes to REDUCE
    #[serde(default = "default_recover_reduce_drawdown")]
    pub recover_reduce_drawdown_pct: Decimal,
    /// Leg drift fraction from target that triggers a rebalance
    #[serde(default = "default_rebalance_threshold")]
    pub rebalance_threshold_pct: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    /// Accepted notional mismatch between partially filled legs
    #[serde(default = "default_partial_fill_tolerance")]
    pub partial_fill_tolerance: Decimal,
    /// Seconds to wait for both legs to fill
    #[serde(default = "default_leg_fill_timeout")]
    pub leg_fill_timeout_secs: u64,
    /// Per-attempt network timeout in seconds
    #[serde(default = "default_order_attempt_timeout")]
    pub order_attempt_timeout_secs: u64,
    /// Overall deadline for one intent in seconds
    #[serde(default = "default_intent_deadline")]
    pub intent_deadline_secs: u64,
    /// Maximum attempts per order on transient failures
    #[serde(default = "default_execution_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Seconds between cycle starts
    #[serde(default = "default_cycle_period")]
    pub cycle_period_seconds: u64,
    /// Hard deadline for one cycle in seconds
    #[serde(default = "default_cycle_deadline")]
    pub cycle_deadline_secs: u64,
    /// Starting capital when no persisted state exists
    #[serde(default = "default_initial_capital")]
    pub initial_capital_usd: Decimal,
    /// Path of the SQLite state database
    #[serde(default = "default_state_db_path")]
    pub state_db_path: String,
    /// Venues participating in the strategy
    #[serde(default)]
    pub venues: Vec<String>,
    /// Static symbol list; empty activates dynamic universe selection
    #[serde(default)]
    pub symbols: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    /// Webhook for alert events; alerting is disabled when unset
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,
}

// Default value functions

fn default_feed_base_url() -> String {
    "https://api.loris.tools".to_string()
}

fn default_feed_timeout() -> u64 {
    10
}

fn default_cache_ttl() -> u64 {
    60
}

fn default_feed_retries() -> u32 {
    3
}

fn default_market_data_mode() -> MarketDataMode {
    MarketDataMode::AggregatorOnly
}

fn default_oi_usd() -> Decimal {
    dec!(5_000_000)
}

fn default_universe_size() -> usize {
    25
}

fn default_spread_weight() -> Decimal {
    dec!(0.60)
}

fn default_coverage_weight() -> Decimal {
    dec!(0.25)
}

fn default_rate_weight() -> Decimal {
    dec!(0.15)
}

fn default_fr_diff_min() -> Decimal {
    dec!(0.002) // 0.2% per 8h
}

fn default_min_persistence_windows() -> u32 {
    1
}

fn default_min_pair_score() -> Decimal {
    dec!(0.30)
}

fn default_expected_edge_min_bps() -> Decimal {
    dec!(1.0)
}

fn default_max_new_positions() -> usize {
    1
}

fn default_allow_single_exchange_pairs() -> bool {
    true
}

fn default_capital_fraction() -> Decimal {
    dec!(0.40)
}

fn default_min_order_usd() -> Decimal {
    dec!(10)
}

fn default_fee_bps_per_leg() -> Decimal {
    dec!(4.0)
}

fn default_max_notional_per_pair() -> Decimal {
    dec!(40)
}

fn default_max_total_notional() -> Decimal {
    dec!(50)
}

fn default_max_notional_per_symbol() -> Decimal {
    dec!(40)
}

fn default_max_notional_per_venue() -> Decimal {
    dec!(100)
}

fn default_max_leverage() -> Decimal {
    dec!(5.0)
}

fn default_normal_leverage_cap() -> Decimal {
    dec!(2.0)
}

fn default_reduce_leverage_cap() -> Decimal {
    dec!(1.0)
}

fn default_reduce_drawdown() -> Decimal {
    dec!(0.10)
}

fn default_halt_drawdown() -> Decimal {
    dec!(0.15)
}

fn default_recover_normal_drawdown() -> Decimal {
    dec!(0.08)
}

fn default_recover_reduce_drawdown() -> Decimal {
    dec!(0.13)
}

fn default_rebalance_threshold() -> Decimal {
    dec!(0.20)
}

fn default_partial_fill_tolerance() -> Decimal {
    dec!(0.10)
}

fn default_leg_fill_timeout() -> u64 {
    10
}

fn default_order_attempt_timeout() -> u64 {
    5
}

fn default_intent_deadline() -> u64 {
    30
}

fn default_execution_retries() -> u32 {
    3
}

fn default_cycle_period() -> u64 {
    600
}

fn default_cycle_deadline() -> u64 {
    120
}

fn default_initial_capital() -> Decimal {
    dec!(1000)
}

fn default_state_db_path() -> String {
    "funding_arb.db".to_string()
}

fn default_webhook_timeout() -> u64 {
    5
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            base_url: default_feed_base_url(),
            timeout_secs: default_feed_timeout(),
            cache_ttl_secs: default_cache_ttl(),
            max_retries: default_feed_retries(),
        }
    }
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            mode: default_market_data_mode(),
            default_oi_usd: default_oi_usd(),
        }
    }
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            universe_size: default_universe_size(),
            spread_weight: default_spread_weight(),
            coverage_weight: default_coverage_weight(),
            rate_weight: default_rate_weight(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            fr_diff_min: default_fr_diff_min(),
            min_persistence_windows: default_min_persistence_windows(),
            min_pair_score: default_min_pair_score(),
            expected_edge_min_bps: default_expected_edge_min_bps(),
            max_new_positions_per_cycle: default_max_new_positions(),
            allow_single_exchange_pairs: default_allow_single_exchange_pairs(),
            capital_fraction: default_capital_fraction(),
            min_order_usd: default_min_order_usd(),
            fee_bps_per_leg: default_fee_bps_per_leg(),
            venue_fee_bps: HashMap::new(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_notional_per_pair_usd: default_max_notional_per_pair(),
            max_total_notional_usd: default_max_total_notional(),
            max_notional_per_symbol_usd: default_max_notional_per_symbol(),
            max_notional_per_venue_usd: default_max_notional_per_venue(),
            max_leverage: default_max_leverage(),
            normal_leverage_cap: default_normal_leverage_cap(),
            reduce_leverage_cap: default_reduce_leverage_cap(),
            reduce_mode_drawdown_pct: default_reduce_drawdown(),
            max_drawdown_stop_pct: default_halt_drawdown(),
            recover_normal_drawdown_pct: default_recover_normal_drawdown(),
            recover_reduce_drawdown_pct: default_recover_reduce_drawdown(),
            rebalance_threshold_pct: default_rebalance_threshold(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            partial_fill_tolerance: default_partial_fill_tolerance(),
            leg_fill_timeout_secs: default_leg_fill_timeout(),
            order_attempt_timeout_secs: default_order_attempt_timeout(),
            intent_deadline_secs: default_intent_deadline(),
            max_retries: default_execution_retries(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_secs: default_webhook_timeout(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_period_seconds: default_cycle_period(),
            cycle_deadline_secs: default_cycle_deadline(),
            initial_capital_usd: default_initial_capital(),
            state_db_path: default_state_db_path(),
            venues: Vec::new(),
            symbols: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("FARB"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.signal.capital_fraction > Decimal::ZERO
                && self.signal.capital_fraction <= Decimal::ONE,
            "capital_fraction must be between 0 and 1"
        );

        anyhow::ensure!(
            self.signal.min_pair_score >= Decimal::ZERO
                && self.signal.min_pair_score <= Decimal::ONE,
            "min_pair_score must be between 0 and 1"
        );

        anyhow::ensure!(
            self.risk.reduce_mode_drawdown_pct < self.risk.max_drawdown_stop_pct,
            "reduce_mode_drawdown_pct must be below max_drawdown_stop_pct"
        );

        anyhow::ensure!(
            self.risk.recover_normal_drawdown_pct < self.risk.reduce_mode_drawdown_pct,
            "recover_normal_drawdown_pct must leave a hysteresis band below REDUCE"
        );

        anyhow::ensure!(
            self.risk.recover_reduce_drawdown_pct < self.risk.max_drawdown_stop_pct,
            "recover_reduce_drawdown_pct must leave a hysteresis band below HALT_NEW"
        );

        anyhow::ensure!(
            self.risk.reduce_leverage_cap <= self.risk.normal_leverage_cap,
            "reduce_leverage_cap must not exceed normal_leverage_cap"
        );

        let weight_sum = self.universe.spread_weight
            + self.universe.coverage_weight
            + self.universe.rate_weight;
        anyhow::ensure!(
            weight_sum == Decimal::ONE,
            "universe score weights must sum to 1, got {weight_sum}"
        );

        anyhow::ensure!(
            self.execution.partial_fill_tolerance >= Decimal::ZERO
                && self.execution.partial_fill_tolerance < Decimal::ONE,
            "partial_fill_tolerance must be in [0, 1)"
        );

        anyhow::ensure!(
            self.engine.cycle_period_seconds > 0,
            "cycle_period_seconds must be positive"
        );

        Ok(())
    }

    /// Taker fee in bps for one leg on the given venue.
    pub fn taker_fee_bps(&self, venue: &str) -> Decimal {
        self.signal.taker_fee_bps(venue)
    }
}

impl SignalConfig {
    /// Round-trip taker fee in bps for one leg on the given venue.
    pub fn taker_fee_bps(&self, venue: &str) -> Decimal {
        self.venue_fee_bps
            .get(venue)
            .copied()
            .unwrap_or(self.fee_bps_per_leg)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feed: FeedConfig::default(),
            market_data: MarketDataConfig::default(),
            universe: UniverseConfig::default(),
            signal: SignalConfig::default(),
            risk: RiskConfig::default(),
            execution: ExecutionConfig::default(),
            engine: EngineConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hysteresis_band_ordering_enforced() {
        let mut config = Config::default();
        config.risk.recover_normal_drawdown_pct = dec!(0.12);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_universe_weights_must_sum_to_one() {
        let mut config = Config::default();
        config.universe.spread_weight = dec!(0.5);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_venue_fee_fallback() {
        let mut config = Config::default();
        config
            .signal
            .venue_fee_bps
            .insert("bybit".to_string(), dec!(2.5));
        assert_eq!(config.taker_fee_bps("bybit"), dec!(2.5));
        assert_eq!(config.taker_fee_bps("binance"), dec!(4.0));
    }
}
