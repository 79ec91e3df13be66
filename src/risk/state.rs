//! Portfolio state and the drawdown-driven risk state machine.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::RiskConfig;
use crate::venue::OrderSide;

/// Admission-control state driven by drawdown with hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskStatus {
    Normal,
    Reduce,
    HaltNew,
}

impl fmt::Display for RiskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskStatus::Normal => write!(f, "NORMAL"),
            RiskStatus::Reduce => write!(f, "REDUCE"),
            RiskStatus::HaltNew => write!(f, "HALT_NEW"),
        }
    }
}

/// One transition step of the risk state machine.
///
/// Escalation uses the entry thresholds, recovery the hysteresis
/// thresholds; at most one transition fires per evaluation.
pub fn next_status(current: RiskStatus, drawdown: Decimal, config: &RiskConfig) -> RiskStatus {
    match current {
        RiskStatus::Normal => {
            if drawdown >= config.max_drawdown_stop_pct {
                RiskStatus::HaltNew
            } else if drawdown >= config.reduce_mode_drawdown_pct {
                RiskStatus::Reduce
            } else {
                RiskStatus::Normal
            }
        }
        RiskStatus::Reduce => {
            if drawdown >= config.max_drawdown_stop_pct {
                RiskStatus::HaltNew
            } else if drawdown < config.recover_normal_drawdown_pct {
                RiskStatus::Normal
            } else {
                RiskStatus::Reduce
            }
        }
        RiskStatus::HaltNew => {
            if drawdown < config.recover_reduce_drawdown_pct {
                RiskStatus::Reduce
            } else {
                RiskStatus::HaltNew
            }
        }
    }
}

/// Lifecycle of a position pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PairStatus {
    Open,
    /// Known-inconsistent; excluded from new risk but kept for the operator
    Zombie,
}

/// One leg of a position pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairLeg {
    pub venue: String,
    pub symbol: String,
    pub side: OrderSide,
    /// Funding rate at entry, 8h fraction
    pub entry_rate: Decimal,
    pub entry_notional_usd: Decimal,
    /// Notional the leg should hold; shrink directives move this
    pub target_notional_usd: Decimal,
    /// Notional the leg currently holds per fills and drift
    pub current_notional_usd: Decimal,
}

impl PairLeg {
    /// Drift of the current notional from target, as a fraction of target.
    pub fn drift_pct(&self) -> Decimal {
        if self.target_notional_usd == Decimal::ZERO {
            return Decimal::ZERO;
        }
        ((self.current_notional_usd - self.target_notional_usd) / self.target_notional_usd).abs()
    }
}

/// A live two-leg pair. Legs are jointly owned: the pair is the only
/// record of either leg, and a leg is never held without it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionPair {
    pub pair_id: String,
    /// Cycle that opened the pair
    pub opened_cycle_id: u64,
    pub opened_at: DateTime<Utc>,
    /// Receives funding; entry rate >= 0
    pub short_leg: PairLeg,
    /// Pays nothing or receives on the negative side; entry rate <= 0
    pub long_leg: PairLeg,
    pub entry_edge_bps: Decimal,
    pub funding_received_usd: Decimal,
    pub realized_pnl_usd: Decimal,
    pub status: PairStatus,
}

impl PositionPair {
    /// Base notional used for caps: the short leg's current size.
    pub fn base_notional_usd(&self) -> Decimal {
        self.short_leg.current_notional_usd
    }

    /// Mark-to-market PnL. For a beta-sized pair the price legs offset,
    /// so MTM reduces to accumulated funding plus realized PnL.
    pub fn mark_to_market_usd(&self) -> Decimal {
        self.funding_received_usd + self.realized_pnl_usd
    }

    /// Accrue funding at the entry rates for a fraction of one 8h
    /// settlement (1.0 = a full settlement).
    pub fn accrue_funding(&mut self, settlement_fraction: Decimal) {
        let short = self.short_leg.entry_rate.abs() * self.short_leg.current_notional_usd;
        let long = self.long_leg.entry_rate.abs() * self.long_leg.current_notional_usd;
        self.funding_received_usd += (short + long) * settlement_fraction;
    }

    pub fn legs(&self) -> [&PairLeg; 2] {
        [&self.short_leg, &self.long_leg]
    }
}

/// Portfolio snapshot owned by the orchestrator; every mutation is
/// sequenced through the cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub capital_usd: Decimal,
    pub equity_usd: Decimal,
    pub peak_equity_usd: Decimal,
    pub open_pairs: BTreeMap<String, PositionPair>,
    pub risk_status: RiskStatus,
    pub last_cycle_id: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
}

impl PortfolioState {
    pub fn new(capital_usd: Decimal) -> Self {
        Self {
            capital_usd,
            equity_usd: capital_usd,
            peak_equity_usd: capital_usd,
            open_pairs: BTreeMap::new(),
            risk_status: RiskStatus::Normal,
            last_cycle_id: 0,
            last_cycle_at: None,
        }
    }

    /// Recompute equity from capital and open-pair MTM; peak is monotone.
    pub fn recompute_equity(&mut self) {
        let mtm: Decimal = self
            .open_pairs
            .values()
            .map(|p| p.mark_to_market_usd())
            .sum();
        self.equity_usd = self.capital_usd + mtm;
        if self.equity_usd > self.peak_equity_usd {
            self.peak_equity_usd = self.equity_usd;
        }
    }

    /// Drawdown from peak, clamped to [0, 1].
    pub fn drawdown(&self) -> Decimal {
        if self.peak_equity_usd <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let dd = (self.peak_equity_usd - self.equity_usd) / self.peak_equity_usd;
        dd.clamp(Decimal::ZERO, Decimal::ONE)
    }

    /// Sum of open pairs' base notionals (Zombie pairs included: their
    /// exposure is still on the venues until the operator clears them).
    pub fn total_pair_notional_usd(&self) -> Decimal {
        self.open_pairs
            .values()
            .map(|p| p.base_notional_usd())
            .sum()
    }

    /// Sum of leg notionals currently routed to one venue.
    pub fn venue_notional_usd(&self, venue: &str) -> Decimal {
        self.open_pairs
            .values()
            .flat_map(|p| p.legs())
            .filter(|leg| leg.venue == venue)
            .map(|leg| leg.current_notional_usd)
            .sum()
    }

    /// Sum of leg notionals currently held in one symbol.
    pub fn symbol_notional_usd(&self, symbol: &str) -> Decimal {
        self.open_pairs
            .values()
            .flat_map(|p| p.legs())
            .filter(|leg| leg.symbol == symbol)
            .map(|leg| leg.current_notional_usd)
            .sum()
    }

    /// Gross leverage against equity; zero when equity is non-positive.
    pub fn leverage(&self) -> Decimal {
        if self.equity_usd <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.total_pair_notional_usd() / self.equity_usd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn config() -> RiskConfig {
        RiskConfig::default()
    }

    fn leg(venue: &str, symbol: &str, side: OrderSide, rate: Decimal, notional: Decimal) -> PairLeg {
        PairLeg {
            venue: venue.to_string(),
            symbol: symbol.to_string(),
            side,
            entry_rate: rate,
            entry_notional_usd: notional,
            target_notional_usd: notional,
            current_notional_usd: notional,
        }
    }

    fn pair(id: &str, short_notional: Decimal, long_notional: Decimal) -> PositionPair {
        PositionPair {
            pair_id: id.to_string(),
            opened_cycle_id: 1,
            opened_at: Utc::now(),
            short_leg: leg("binance", "X/USDT:USDT", OrderSide::Sell, dec!(0.003), short_notional),
            long_leg: leg("binance", "Y/USDT:USDT", OrderSide::Buy, dec!(-0.002), long_notional),
            entry_edge_bps: dec!(42),
            funding_received_usd: Decimal::ZERO,
            realized_pnl_usd: Decimal::ZERO,
            status: PairStatus::Open,
        }
    }

    #[test]
    fn test_normal_to_reduce_at_exactly_ten_pct() {
        assert_eq!(
            next_status(RiskStatus::Normal, dec!(0.10), &config()),
            RiskStatus::Reduce
        );
        assert_eq!(
            next_status(RiskStatus::Normal, dec!(0.0999), &config()),
            RiskStatus::Normal
        );
    }

    #[test]
    fn test_normal_to_halt_at_exactly_fifteen_pct() {
        assert_eq!(
            next_status(RiskStatus::Normal, dec!(0.15), &config()),
            RiskStatus::HaltNew
        );
    }

    #[test]
    fn test_reduce_hysteresis_holds_below_entry_threshold() {
        // 9.99% is below the 10% entry but above the 8% recovery band
        assert_eq!(
            next_status(RiskStatus::Reduce, dec!(0.0999), &config()),
            RiskStatus::Reduce
        );
        assert_eq!(
            next_status(RiskStatus::Reduce, dec!(0.0799), &config()),
            RiskStatus::Normal
        );
    }

    #[test]
    fn test_halt_relaxes_to_reduce_below_thirteen_pct() {
        assert_eq!(
            next_status(RiskStatus::HaltNew, dec!(0.1299), &config()),
            RiskStatus::Reduce
        );
        assert_eq!(
            next_status(RiskStatus::HaltNew, dec!(0.13), &config()),
            RiskStatus::HaltNew
        );
    }

    #[test]
    fn test_halt_never_recovers_directly_to_normal() {
        // Even at zero drawdown, HALT_NEW steps down one state at a time
        assert_eq!(
            next_status(RiskStatus::HaltNew, Decimal::ZERO, &config()),
            RiskStatus::Reduce
        );
    }

    #[test]
    fn test_drawdown_ladder() {
        let cfg = config();
        let mut state = PortfolioState::new(dec!(1000));
        let mut status = RiskStatus::Normal;

        for (equity, expected) in [
            (dec!(920), RiskStatus::Normal),  // dd 8%
            (dec!(880), RiskStatus::Reduce),  // dd 12%
            (dec!(840), RiskStatus::HaltNew), // dd 16%
            (dec!(880), RiskStatus::Reduce),  // dd 12%, below 13% band
            (dec!(930), RiskStatus::Normal),  // dd 7%
        ] {
            state.equity_usd = equity;
            status = next_status(status, state.drawdown(), &cfg);
            assert_eq!(status, expected, "equity {equity}");
        }
        assert_eq!(state.peak_equity_usd, dec!(1000));
    }

    #[test]
    fn test_equity_recompute_and_peak_monotonicity() {
        let mut state = PortfolioState::new(dec!(1000));
        let mut p = pair("p1", dec!(40), dec!(40));
        p.funding_received_usd = dec!(5);
        state.open_pairs.insert(p.pair_id.clone(), p);

        state.recompute_equity();
        assert_eq!(state.equity_usd, dec!(1005));
        assert_eq!(state.peak_equity_usd, dec!(1005));

        state
            .open_pairs
            .get_mut("p1")
            .unwrap()
            .realized_pnl_usd = dec!(-20);
        state.recompute_equity();
        assert_eq!(state.equity_usd, dec!(985));
        // Peak never decreases
        assert_eq!(state.peak_equity_usd, dec!(1005));
    }

    #[test]
    fn test_notional_aggregations() {
        let mut state = PortfolioState::new(dec!(1000));
        state
            .open_pairs
            .insert("p1".to_string(), pair("p1", dec!(40), dec!(50)));

        assert_eq!(state.total_pair_notional_usd(), dec!(40));
        assert_eq!(state.venue_notional_usd("binance"), dec!(90));
        assert_eq!(state.symbol_notional_usd("X/USDT:USDT"), dec!(40));
        assert_eq!(state.symbol_notional_usd("Y/USDT:USDT"), dec!(50));
    }

    #[test]
    fn test_funding_accrual() {
        let mut p = pair("p1", dec!(40), dec!(40));
        p.accrue_funding(Decimal::ONE);
        // 0.003 * 40 + 0.002 * 40 = 0.12 + 0.08
        assert_eq!(p.funding_received_usd, dec!(0.20));
        assert_eq!(p.mark_to_market_usd(), dec!(0.20));

        p.accrue_funding(dec!(0.5));
        assert_eq!(p.funding_received_usd, dec!(0.30));
    }

    #[test]
    fn test_portfolio_state_serde_round_trip() {
        let mut state = PortfolioState::new(dec!(1000));
        state
            .open_pairs
            .insert("p1".to_string(), pair("p1", dec!(40), dec!(40)));
        state.risk_status = RiskStatus::Reduce;
        state.last_cycle_id = 17;
        state.recompute_equity();

        let json = serde_json::to_string(&state).unwrap();
        let restored: PortfolioState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_drawdown_clamped_to_unit_interval() {
        let mut state = PortfolioState::new(dec!(1000));
        state.equity_usd = dec!(-50);
        assert_eq!(state.drawdown(), Decimal::ONE);
        state.equity_usd = dec!(1200);
        state.peak_equity_usd = dec!(1000);
        assert_eq!(state.drawdown(), Decimal::ZERO);
    }
}
