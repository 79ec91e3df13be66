//! Dynamic trading universe selection.
//!
//! When no static symbol list is configured, the engine picks the top-K
//! symbols by a composite of cross-venue rate spread, venue coverage, and
//! average absolute funding rate.

use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::info;

use crate::config::UniverseConfig;
use crate::market::service::SymbolQuote;

/// Scoring inputs for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolScore {
    pub symbol: String,
    /// Largest cross-venue funding-rate difference
    pub max_spread: Decimal,
    /// Number of venues quoting the symbol
    pub coverage: usize,
    /// Mean |rate| across venues
    pub avg_abs_rate: Decimal,
    /// Composite score in [0, 1]
    pub score: Decimal,
}

/// Selects the per-cycle symbol universe from the funding-rate matrix.
pub struct UniverseProvider {
    config: UniverseConfig,
    fr_diff_min: Decimal,
}

impl UniverseProvider {
    pub fn new(config: UniverseConfig, fr_diff_min: Decimal) -> Self {
        Self {
            config,
            fr_diff_min,
        }
    }

    /// Rank symbols and return the top `universe_size`, lexicographically
    /// tie-broken so the selection is deterministic across runs.
    pub fn select(&self, quotes: &HashMap<String, SymbolQuote>) -> Vec<String> {
        if self.config.universe_size == 0 {
            return Vec::new();
        }

        let eligible: Vec<(&String, &SymbolQuote)> = quotes
            .iter()
            .filter(|(_, q)| q.coverage >= 2 && q.max_spread >= self.fr_diff_min)
            .collect();

        if eligible.is_empty() {
            info!(scanned = quotes.len(), "No symbols met universe criteria");
            return Vec::new();
        }

        let max_spread = eligible
            .iter()
            .map(|(_, q)| q.max_spread)
            .max()
            .unwrap_or(Decimal::ONE);
        let max_coverage = eligible.iter().map(|(_, q)| q.coverage).max().unwrap_or(1);
        let avg_rates: HashMap<&String, Decimal> = eligible
            .iter()
            .map(|(sym, q)| {
                let sum: Decimal = q.venues.values().map(|s| s.rate.abs()).sum();
                (*sym, sum / Decimal::from(q.coverage.max(1)))
            })
            .collect();
        let max_avg_rate = avg_rates.values().copied().max().unwrap_or(Decimal::ONE);

        let mut scored: Vec<SymbolScore> = eligible
            .iter()
            .map(|(sym, q)| {
                let norm_spread = safe_ratio(q.max_spread, max_spread);
                let norm_coverage =
                    safe_ratio(Decimal::from(q.coverage), Decimal::from(max_coverage));
                let norm_rate = safe_ratio(avg_rates[*sym], max_avg_rate);

                let score = self.config.spread_weight * norm_spread
                    + self.config.coverage_weight * norm_coverage
                    + self.config.rate_weight * norm_rate;

                SymbolScore {
                    symbol: (*sym).clone(),
                    max_spread: q.max_spread,
                    coverage: q.coverage,
                    avg_abs_rate: avg_rates[*sym],
                    score,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });

        let selected: Vec<String> = scored
            .into_iter()
            .take(self.config.universe_size)
            .map(|s| s.symbol)
            .collect();

        info!(
            selected = selected.len(),
            scanned = quotes.len(),
            "Universe selected"
        );
        selected
    }
}

fn safe_ratio(value: Decimal, max: Decimal) -> Decimal {
    if max == Decimal::ZERO {
        Decimal::ZERO
    } else {
        value / max
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::feed::FundingSnapshot;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn quote(symbol: &str, rates: &[(&str, Decimal)]) -> SymbolQuote {
        let snaps = rates
            .iter()
            .map(|(venue, rate)| FundingSnapshot {
                venue: venue.to_string(),
                symbol: symbol.to_string(),
                rate: *rate,
                oi_usd: None,
                bid: None,
                ask: None,
                interval_hours: 8,
                timestamp: Utc::now(),
            })
            .collect();
        SymbolQuote::from_snapshots(symbol.to_string(), snaps)
    }

    fn quotes(entries: Vec<SymbolQuote>) -> HashMap<String, SymbolQuote> {
        entries.into_iter().map(|q| (q.symbol.clone(), q)).collect()
    }

    fn provider(size: usize) -> UniverseProvider {
        UniverseProvider::new(
            UniverseConfig {
                universe_size: size,
                ..UniverseConfig::default()
            },
            dec!(0.002),
        )
    }

    #[test]
    fn test_select_prefers_wider_spread() {
        let quotes = quotes(vec![
            quote(
                "BTC/USDT:USDT",
                &[("binance", dec!(0.003)), ("bybit", dec!(-0.002))],
            ),
            quote(
                "ETH/USDT:USDT",
                &[("binance", dec!(0.002)), ("bybit", dec!(-0.001))],
            ),
        ]);

        let selected = provider(1).select(&quotes);
        assert_eq!(selected, vec!["BTC/USDT:USDT".to_string()]);
    }

    #[test]
    fn test_filters_single_venue_coverage() {
        let quotes = quotes(vec![quote("BTC/USDT:USDT", &[("binance", dec!(0.005))])]);
        assert!(provider(5).select(&quotes).is_empty());
    }

    #[test]
    fn test_filters_narrow_spread() {
        // Spread 0.001 below fr_diff_min of 0.002
        let quotes = quotes(vec![quote(
            "BTC/USDT:USDT",
            &[("binance", dec!(0.0015)), ("bybit", dec!(0.0005))],
        )]);
        assert!(provider(5).select(&quotes).is_empty());
    }

    #[test]
    fn test_universe_size_zero_yields_empty_without_error() {
        let quotes = quotes(vec![quote(
            "BTC/USDT:USDT",
            &[("binance", dec!(0.003)), ("bybit", dec!(-0.002))],
        )]);
        assert!(provider(0).select(&quotes).is_empty());
    }

    #[test]
    fn test_tie_break_is_lexicographic() {
        // Identical metrics, selection order must be deterministic
        let quotes = quotes(vec![
            quote(
                "ETH/USDT:USDT",
                &[("binance", dec!(0.003)), ("bybit", dec!(-0.002))],
            ),
            quote(
                "ADA/USDT:USDT",
                &[("binance", dec!(0.003)), ("bybit", dec!(-0.002))],
            ),
        ]);

        let selected = provider(1).select(&quotes);
        assert_eq!(selected, vec!["ADA/USDT:USDT".to_string()]);
    }
}
