//! Admission control and exposure directives.
//!
//! The evaluator is a pure function of a portfolio snapshot and the
//! cycle's candidate intents: it advances the risk state machine one
//! step, enforces the notional and leverage caps in a fixed order, and
//! emits shrink/rebalance directives for open pairs. Admission order
//! follows the signal service's ordering.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::config::RiskConfig;
use crate::risk::state::{next_status, PairStatus, PortfolioState, RiskStatus};
use crate::strategy::signals::TradeIntent;
use crate::venue::OrderSide;

/// Why a pair adjustment was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    /// Drift from target exceeded the rebalance threshold
    Rebalance,
    /// REDUCE state: position halved
    Shrink,
}

/// One leg trade that moves a pair toward its target notionals.
#[derive(Debug, Clone, PartialEq)]
pub struct LegAdjustment {
    pub venue: String,
    pub symbol: String,
    /// Side of the adjusting order (opposite the leg to reduce it)
    pub side: OrderSide,
    pub delta_notional_usd: Decimal,
    pub new_target_notional_usd: Decimal,
}

/// Directive to adjust one open pair.
#[derive(Debug, Clone, PartialEq)]
pub struct PairAdjustment {
    pub pair_id: String,
    pub kind: DirectiveKind,
    pub legs: Vec<LegAdjustment>,
}

/// Result of one risk evaluation.
#[derive(Debug, Clone)]
pub struct RiskDecision {
    /// State after this cycle's transition
    pub status: RiskStatus,
    pub drawdown: Decimal,
    pub admitted: Vec<TradeIntent>,
    pub rejected: Vec<(TradeIntent, String)>,
    pub adjustments: Vec<PairAdjustment>,
    /// Blanket reason when nothing was admitted
    pub reason: Option<String>,
}

/// Stateless cap and state-machine evaluator.
pub struct RiskService {
    config: RiskConfig,
}

impl RiskService {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    /// Evaluate a portfolio snapshot and candidate intents.
    pub fn evaluate(&self, portfolio: &PortfolioState, intents: Vec<TradeIntent>) -> RiskDecision {
        let drawdown = portfolio.drawdown();

        // An unresolved ZOMBIE pair pins the state at HALT_NEW no matter
        // how shallow the drawdown; only the operator clears it
        let has_zombie = portfolio
            .open_pairs
            .values()
            .any(|p| p.status == PairStatus::Zombie);
        let status = if has_zombie {
            warn!("Zombie pair on the book, holding HALT_NEW");
            RiskStatus::HaltNew
        } else {
            next_status(portfolio.risk_status, drawdown, &self.config)
        };

        if status != portfolio.risk_status {
            warn!(
                from = %portfolio.risk_status,
                to = %status,
                %drawdown,
                "Risk state transition"
            );
        }

        let adjustments = match status {
            RiskStatus::Reduce => self.shrink_directives(portfolio),
            RiskStatus::Normal | RiskStatus::HaltNew => self.rebalance_directives(portfolio),
        };

        match status {
            RiskStatus::HaltNew => {
                let rejected = intents
                    .into_iter()
                    .map(|i| (i, "halt_new".to_string()))
                    .collect();
                RiskDecision {
                    status,
                    drawdown,
                    admitted: Vec::new(),
                    rejected,
                    adjustments,
                    reason: Some("halt_new".to_string()),
                }
            }
            RiskStatus::Reduce => {
                let rejected = intents
                    .into_iter()
                    .map(|i| (i, "reduce_mode".to_string()))
                    .collect();
                RiskDecision {
                    status,
                    drawdown,
                    admitted: Vec::new(),
                    rejected,
                    adjustments,
                    reason: Some("reduce_mode".to_string()),
                }
            }
            RiskStatus::Normal => {
                let (admitted, rejected) = self.admit(portfolio, intents);
                RiskDecision {
                    status,
                    drawdown,
                    admitted,
                    rejected,
                    adjustments,
                    reason: None,
                }
            }
        }
    }

    /// Apply the caps in order, preserving the incoming intent order.
    fn admit(
        &self,
        portfolio: &PortfolioState,
        intents: Vec<TradeIntent>,
    ) -> (Vec<TradeIntent>, Vec<(TradeIntent, String)>) {
        let mut admitted = Vec::new();
        let mut rejected = Vec::new();

        let mut total = portfolio.total_pair_notional_usd();
        let mut symbol_pending: HashMap<String, Decimal> = HashMap::new();
        let mut venue_pending: HashMap<String, Decimal> = HashMap::new();

        for intent in intents {
            let base = intent.short_leg.notional_usd;

            if total + base > self.config.max_total_notional_usd {
                rejected.push((intent, "total_notional_cap".to_string()));
                continue;
            }

            let symbol_breach = [&intent.short_leg, &intent.long_leg].iter().find_map(|leg| {
                let open = portfolio.symbol_notional_usd(&leg.symbol);
                let pending = symbol_pending.get(&leg.symbol).copied().unwrap_or_default();
                (open + pending + leg.notional_usd > self.config.max_notional_per_symbol_usd)
                    .then(|| leg.symbol.clone())
            });
            if let Some(symbol) = symbol_breach {
                rejected.push((intent, format!("symbol_cap:{symbol}")));
                continue;
            }

            let venue_breach = [&intent.short_leg, &intent.long_leg].iter().find_map(|leg| {
                let open = portfolio.venue_notional_usd(&leg.venue);
                let pending = venue_pending.get(&leg.venue).copied().unwrap_or_default();
                (open + pending + leg.notional_usd > self.config.max_notional_per_venue_usd)
                    .then(|| leg.venue.clone())
            });
            if let Some(venue) = venue_breach {
                rejected.push((intent, format!("venue_cap:{venue}")));
                continue;
            }

            // Leverage on post-admission total; equity <= 0 admits nothing
            if portfolio.equity_usd <= Decimal::ZERO
                || total + base > self.config.normal_leverage_cap * portfolio.equity_usd
            {
                rejected.push((intent, "leverage_cap".to_string()));
                continue;
            }

            total += base;
            for leg in [&intent.short_leg, &intent.long_leg] {
                *symbol_pending.entry(leg.symbol.clone()).or_default() += leg.notional_usd;
                *venue_pending.entry(leg.venue.clone()).or_default() += leg.notional_usd;
            }
            admitted.push(intent);
        }

        info!(
            admitted = admitted.len(),
            rejected = rejected.len(),
            "Admission evaluated"
        );
        (admitted, rejected)
    }

    /// Halve every open pair; supersedes drift rebalancing while reducing.
    fn shrink_directives(&self, portfolio: &PortfolioState) -> Vec<PairAdjustment> {
        portfolio
            .open_pairs
            .values()
            .filter(|p| p.status == PairStatus::Open)
            .map(|pair| {
                let legs = pair
                    .legs()
                    .iter()
                    .map(|leg| {
                        let new_target = leg.target_notional_usd / dec!(2);
                        LegAdjustment {
                            venue: leg.venue.clone(),
                            symbol: leg.symbol.clone(),
                            side: leg.side.opposite(),
                            delta_notional_usd: (leg.current_notional_usd - new_target)
                                .max(Decimal::ZERO),
                            new_target_notional_usd: new_target,
                        }
                    })
                    .collect();
                debug!(pair_id = %pair.pair_id, "Shrink directive");
                PairAdjustment {
                    pair_id: pair.pair_id.clone(),
                    kind: DirectiveKind::Shrink,
                    legs,
                }
            })
            .collect()
    }

    /// Trim drifted legs back to target when drift exceeds the threshold.
    fn rebalance_directives(&self, portfolio: &PortfolioState) -> Vec<PairAdjustment> {
        portfolio
            .open_pairs
            .values()
            .filter(|p| p.status == PairStatus::Open)
            .filter_map(|pair| {
                let legs: Vec<LegAdjustment> = pair
                    .legs()
                    .iter()
                    .filter(|leg| leg.drift_pct() > self.config.rebalance_threshold_pct)
                    .map(|leg| {
                        let delta = leg.current_notional_usd - leg.target_notional_usd;
                        LegAdjustment {
                            venue: leg.venue.clone(),
                            symbol: leg.symbol.clone(),
                            // Grown leg is cut with the opposite side,
                            // a shrunken leg is topped up on its own side
                            side: if delta > Decimal::ZERO {
                                leg.side.opposite()
                            } else {
                                leg.side
                            },
                            delta_notional_usd: delta.abs(),
                            new_target_notional_usd: leg.target_notional_usd,
                        }
                    })
                    .collect();

                if legs.is_empty() {
                    return None;
                }
                debug!(pair_id = %pair.pair_id, legs = legs.len(), "Rebalance directive");
                Some(PairAdjustment {
                    pair_id: pair.pair_id.clone(),
                    kind: DirectiveKind::Rebalance,
                    legs,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::state::{PairLeg, PositionPair};
    use crate::strategy::signals::TradeLeg;
    use chrono::Utc;

    fn config() -> RiskConfig {
        RiskConfig::default()
    }

    fn intent(pair_id: &str, short_notional: Decimal, long_notional: Decimal) -> TradeIntent {
        TradeIntent {
            pair_id: pair_id.to_string(),
            cycle_id: 1,
            idempotency_key: format!("fa-{pair_id}"),
            short_leg: TradeLeg {
                venue: "binance".to_string(),
                symbol: "X/USDT:USDT".to_string(),
                side: OrderSide::Sell,
                notional_usd: short_notional,
                entry_rate: dec!(0.003),
            },
            long_leg: TradeLeg {
                venue: "binance".to_string(),
                symbol: "Y/USDT:USDT".to_string(),
                side: OrderSide::Buy,
                notional_usd: long_notional,
                entry_rate: dec!(-0.002),
            },
            expected_edge_bps: dec!(42),
            score: dec!(0.8),
            beta: Decimal::ONE,
            reason_codes: Vec::new(),
        }
    }

    fn open_pair(
        pair_id: &str,
        short_current: Decimal,
        long_current: Decimal,
        target: Decimal,
    ) -> PositionPair {
        let leg = |symbol: &str, side, current| PairLeg {
            venue: "binance".to_string(),
            symbol: symbol.to_string(),
            side,
            entry_rate: dec!(0.003),
            entry_notional_usd: target,
            target_notional_usd: target,
            current_notional_usd: current,
        };
        PositionPair {
            pair_id: pair_id.to_string(),
            opened_cycle_id: 1,
            opened_at: Utc::now(),
            short_leg: leg("A/USDT:USDT", OrderSide::Sell, short_current),
            long_leg: leg("B/USDT:USDT", OrderSide::Buy, long_current),
            entry_edge_bps: dec!(42),
            funding_received_usd: Decimal::ZERO,
            realized_pnl_usd: Decimal::ZERO,
            status: PairStatus::Open,
        }
    }

    #[test]
    fn test_admits_within_caps() {
        let service = RiskService::new(config());
        let portfolio = PortfolioState::new(dec!(1000));

        let decision = service.evaluate(&portfolio, vec![intent("p1", dec!(40), dec!(40))]);
        assert_eq!(decision.status, RiskStatus::Normal);
        assert_eq!(decision.admitted.len(), 1);
        assert!(decision.rejected.is_empty());
    }

    #[test]
    fn test_total_notional_cap_blocks() {
        let service = RiskService::new(config());
        let mut portfolio = PortfolioState::new(dec!(1000));
        portfolio
            .open_pairs
            .insert("p0".to_string(), open_pair("p0", dec!(40), dec!(40), dec!(40)));

        // 40 open + 40 new > 50 total cap
        let decision = service.evaluate(&portfolio, vec![intent("p1", dec!(40), dec!(40))]);
        assert!(decision.admitted.is_empty());
        assert_eq!(decision.rejected[0].1, "total_notional_cap");
    }

    #[test]
    fn test_symbol_cap_blocks_second_intent() {
        let mut cfg = config();
        cfg.max_total_notional_usd = dec!(500);
        cfg.max_notional_per_venue_usd = dec!(500);
        let service = RiskService::new(cfg);
        let portfolio = PortfolioState::new(dec!(1000));

        // Same symbols on both intents: the second breaches the 40 cap
        let decision = service.evaluate(
            &portfolio,
            vec![
                intent("p1", dec!(30), dec!(30)),
                intent("p2", dec!(30), dec!(30)),
            ],
        );
        assert_eq!(decision.admitted.len(), 1);
        assert!(decision.rejected[0].1.starts_with("symbol_cap:"));
    }

    #[test]
    fn test_venue_cap_blocks() {
        let mut cfg = config();
        cfg.max_notional_per_venue_usd = dec!(60);
        cfg.max_total_notional_usd = dec!(500);
        cfg.max_notional_per_symbol_usd = dec!(500);
        let service = RiskService::new(cfg);
        let portfolio = PortfolioState::new(dec!(1000));

        // Both legs land on binance: 40 + 40 > 60
        let decision = service.evaluate(&portfolio, vec![intent("p1", dec!(40), dec!(40))]);
        assert!(decision.admitted.is_empty());
        assert_eq!(decision.rejected[0].1, "venue_cap:binance");
    }

    #[test]
    fn test_leverage_cap_blocks_on_thin_equity() {
        let mut cfg = config();
        cfg.max_total_notional_usd = dec!(10_000);
        cfg.max_notional_per_symbol_usd = dec!(10_000);
        cfg.max_notional_per_venue_usd = dec!(10_000);
        let service = RiskService::new(cfg);
        // Equity 15, normal cap 2.0 -> max total 30 < 40
        let portfolio = PortfolioState::new(dec!(15));

        let decision = service.evaluate(&portfolio, vec![intent("p1", dec!(40), dec!(40))]);
        assert!(decision.admitted.is_empty());
        assert_eq!(decision.rejected[0].1, "leverage_cap");
    }

    #[test]
    fn test_halt_new_admits_nothing() {
        let service = RiskService::new(config());
        let mut portfolio = PortfolioState::new(dec!(1000));
        portfolio.equity_usd = dec!(840); // dd 16%

        let decision = service.evaluate(&portfolio, vec![intent("p1", dec!(40), dec!(40))]);
        assert_eq!(decision.status, RiskStatus::HaltNew);
        assert!(decision.admitted.is_empty());
        assert_eq!(decision.reason.as_deref(), Some("halt_new"));
    }

    #[test]
    fn test_zombie_pair_pins_halt_new_at_low_drawdown() {
        let service = RiskService::new(config());
        let mut portfolio = PortfolioState::new(dec!(1000));
        portfolio.risk_status = RiskStatus::HaltNew;
        let mut zombie = open_pair("pz", dec!(40), dec!(40), dec!(40));
        zombie.status = PairStatus::Zombie;
        portfolio.open_pairs.insert("pz".to_string(), zombie);

        // Zero drawdown would otherwise relax HALT_NEW one step per cycle
        let decision = service.evaluate(&portfolio, vec![intent("p1", dec!(40), dec!(40))]);
        assert_eq!(decision.status, RiskStatus::HaltNew);
        assert!(decision.admitted.is_empty());
        assert_eq!(decision.reason.as_deref(), Some("halt_new"));

        // And it keeps pinning on the following cycle
        let again = service.evaluate(&portfolio, Vec::new());
        assert_eq!(again.status, RiskStatus::HaltNew);
    }

    #[test]
    fn test_zombie_forces_halt_new_even_from_normal() {
        let service = RiskService::new(config());
        let mut portfolio = PortfolioState::new(dec!(1000));
        let mut zombie = open_pair("pz", dec!(40), dec!(40), dec!(40));
        zombie.status = PairStatus::Zombie;
        portfolio.open_pairs.insert("pz".to_string(), zombie);

        // Restart lost the imperative HALT_NEW: the evaluator restores it
        let decision = service.evaluate(&portfolio, Vec::new());
        assert_eq!(decision.status, RiskStatus::HaltNew);
    }

    #[test]
    fn test_reduce_rejects_and_shrinks() {
        let service = RiskService::new(config());
        let mut portfolio = PortfolioState::new(dec!(1000));
        portfolio.equity_usd = dec!(880); // dd 12%
        portfolio
            .open_pairs
            .insert("p0".to_string(), open_pair("p0", dec!(40), dec!(40), dec!(40)));

        let decision = service.evaluate(&portfolio, vec![intent("p1", dec!(40), dec!(40))]);
        assert_eq!(decision.status, RiskStatus::Reduce);
        assert!(decision.admitted.is_empty());
        assert_eq!(decision.rejected[0].1, "reduce_mode");

        assert_eq!(decision.adjustments.len(), 1);
        let shrink = &decision.adjustments[0];
        assert_eq!(shrink.kind, DirectiveKind::Shrink);
        // Each leg halved: trade 20 away, new target 20
        for leg in &shrink.legs {
            assert_eq!(leg.delta_notional_usd, dec!(20));
            assert_eq!(leg.new_target_notional_usd, dec!(20));
        }
    }

    #[test]
    fn test_rebalance_trigger_on_drift() {
        let service = RiskService::new(config());
        let mut portfolio = PortfolioState::new(dec!(1000));
        // Long leg drifted 40 -> 50 = 25% over target
        portfolio
            .open_pairs
            .insert("p0".to_string(), open_pair("p0", dec!(40), dec!(50), dec!(40)));

        let decision = service.evaluate(&portfolio, Vec::new());
        assert_eq!(decision.adjustments.len(), 1);
        let adj = &decision.adjustments[0];
        assert_eq!(adj.kind, DirectiveKind::Rebalance);
        assert_eq!(adj.legs.len(), 1);
        // Long leg (Buy) trimmed by 10 with a Sell
        assert_eq!(adj.legs[0].side, OrderSide::Sell);
        assert_eq!(adj.legs[0].delta_notional_usd, dec!(10));
    }

    #[test]
    fn test_no_rebalance_within_threshold() {
        let service = RiskService::new(config());
        let mut portfolio = PortfolioState::new(dec!(1000));
        // 15% drift, below the 20% threshold
        portfolio
            .open_pairs
            .insert("p0".to_string(), open_pair("p0", dec!(40), dec!(46), dec!(40)));

        let decision = service.evaluate(&portfolio, Vec::new());
        assert!(decision.adjustments.is_empty());
    }

    #[test]
    fn test_admission_is_deterministic_and_ordered() {
        let mut cfg = config();
        cfg.max_total_notional_usd = dec!(50);
        cfg.max_notional_per_symbol_usd = dec!(500);
        cfg.max_notional_per_venue_usd = dec!(500);
        let service = RiskService::new(cfg);
        let portfolio = PortfolioState::new(dec!(1000));

        // First fits, second would breach the total cap: order preserved
        let intents = vec![
            intent("p1", dec!(40), dec!(40)),
            intent("p2", dec!(40), dec!(40)),
        ];
        let decision = service.evaluate(&portfolio, intents.clone());
        assert_eq!(decision.admitted[0].pair_id, "p1");
        assert_eq!(decision.rejected[0].0.pair_id, "p2");

        let again = service.evaluate(&portfolio, intents);
        assert_eq!(again.admitted.len(), decision.admitted.len());
        assert_eq!(again.rejected[0].1, decision.rejected[0].1);
    }
}
