//! Pair candidate construction, scoring, persistence gating, and sizing.
//!
//! Each cycle the signal service enumerates venue-symbol pairs with
//! opposite-sign or sufficiently divergent funding rates, scores them,
//! advances the persistence counters, and turns the survivors into sized
//! trade intents with deterministic idempotency keys.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, info};

use crate::config::SignalConfig;
use crate::market::service::SymbolQuote;
use crate::strategy::features::estimate_features;
use crate::utils::decimal::to_basis_points;
use crate::venue::OrderSide;

/// Consecutive qualifying cycles per pair id. Owned by the orchestrator
/// and persisted with cycle state; the signal service computes the next
/// generation from a copy.
pub type PersistenceCounters = BTreeMap<String, u32>;

/// One side of a candidate pair, before sizing.
#[derive(Debug, Clone)]
pub struct CandidateLeg {
    pub venue: String,
    pub symbol: String,
    /// 8h funding rate fraction
    pub rate: Decimal,
    pub oi_usd: Option<Decimal>,
}

impl CandidateLeg {
    pub fn leg_id(&self) -> String {
        format!("{}:{}", self.venue, self.symbol)
    }
}

/// A scored pair that qualified this cycle.
#[derive(Debug, Clone)]
pub struct PairCandidate {
    pub pair_id: String,
    /// Higher-rate side; shorted to receive funding
    pub short_leg: CandidateLeg,
    /// Lower-rate side; held long
    pub long_leg: CandidateLeg,
    pub fr_diff: Decimal,
    pub expected_edge_bps: Decimal,
    pub beta: Decimal,
    pub score: Decimal,
    /// Counter value after this cycle's increment
    pub persistence: u32,
    pub reason_codes: Vec<String>,
}

/// A sized leg of a trade intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLeg {
    pub venue: String,
    pub symbol: String,
    pub side: OrderSide,
    pub notional_usd: Decimal,
    pub entry_rate: Decimal,
}

/// Directive to open one pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub pair_id: String,
    pub cycle_id: u64,
    /// Deterministic key; resubmission after a crash collapses to one fill
    pub idempotency_key: String,
    pub short_leg: TradeLeg,
    pub long_leg: TradeLeg,
    pub expected_edge_bps: Decimal,
    pub score: Decimal,
    pub beta: Decimal,
    pub reason_codes: Vec<String>,
}

/// Derive the idempotency key for one (cycle, pair) attempt.
pub fn idempotency_key(cycle_id: u64, short_leg_id: &str, long_leg_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cycle_id.to_be_bytes());
    hasher.update(short_leg_id.as_bytes());
    hasher.update(b"|");
    hasher.update(long_leg_id.as_bytes());
    let digest = hasher.finalize();
    let mut key = String::with_capacity(19);
    key.push_str("fa-");
    for byte in &digest[..8] {
        key.push_str(&format!("{byte:02x}"));
    }
    key
}

fn pair_id(a: &CandidateLeg, b: &CandidateLeg) -> String {
    let mut ids = [a.leg_id(), b.leg_id()];
    ids.sort();
    ids.join("|")
}

/// Builds and sizes pair candidates.
pub struct SignalService {
    config: SignalConfig,
    /// Per-pair base notional ceiling, mirrored from the risk caps so an
    /// intent never exceeds what admission would allow
    max_pair_notional_usd: Decimal,
}

impl SignalService {
    pub fn new(config: SignalConfig, max_pair_notional_usd: Decimal) -> Self {
        Self {
            config,
            max_pair_notional_usd,
        }
    }

    /// Enumerate and score pair candidates, producing the next counter
    /// generation. Counters of pairs that fail to re-qualify reset to 0;
    /// qualifying pairs advance by exactly one.
    pub fn build_candidates(
        &self,
        quotes: &HashMap<String, SymbolQuote>,
        counters: &PersistenceCounters,
    ) -> (Vec<PairCandidate>, PersistenceCounters) {
        // Deterministic enumeration order regardless of map iteration
        let mut legs: Vec<CandidateLeg> = quotes
            .values()
            .flat_map(|q| {
                q.venues.values().map(|snap| CandidateLeg {
                    venue: snap.venue.clone(),
                    symbol: snap.symbol.clone(),
                    rate: snap.rate,
                    oi_usd: snap.oi_usd,
                })
            })
            .collect();
        legs.sort_by_key(|leg| leg.leg_id());

        let mut candidates = Vec::new();
        for i in 0..legs.len() {
            for j in (i + 1)..legs.len() {
                let (a, b) = (&legs[i], &legs[j]);
                if a.venue == b.venue && a.symbol == b.symbol {
                    continue;
                }
                if !self.config.allow_single_exchange_pairs && a.venue == b.venue {
                    continue;
                }

                // Orient: short the higher rate, long the lower
                let (short, long) = if a.rate >= b.rate { (a, b) } else { (b, a) };
                let fr_diff = short.rate - long.rate;

                let opposite_signs = short.rate > Decimal::ZERO && long.rate < Decimal::ZERO;
                if !opposite_signs && fr_diff < self.config.fr_diff_min {
                    continue;
                }

                let fee_bps_total = self.config.taker_fee_bps(&short.venue)
                    + self.config.taker_fee_bps(&long.venue);
                let edge_bps = to_basis_points(fr_diff) - fee_bps_total;
                if edge_bps < self.config.expected_edge_min_bps {
                    continue;
                }

                let features = estimate_features(&short.symbol, &long.symbol);
                let score = self.quality_score(edge_bps, short, long, features.beta);
                if score < self.config.min_pair_score {
                    debug!(
                        pair = %pair_id(short, long),
                        %score,
                        "Candidate below quality threshold"
                    );
                    continue;
                }

                let id = pair_id(short, long);
                let persistence = counters.get(&id).copied().unwrap_or(0) + 1;
                candidates.push(PairCandidate {
                    pair_id: id,
                    short_leg: short.clone(),
                    long_leg: long.clone(),
                    fr_diff,
                    expected_edge_bps: edge_bps,
                    beta: features.beta,
                    score,
                    persistence,
                    reason_codes: vec![
                        if opposite_signs {
                            "FR_OPPOSITE_SIGN".to_string()
                        } else {
                            "FR_DIFF".to_string()
                        },
                        format!("PERSIST_{persistence}"),
                        format!("EDGE_{edge_bps:.1}BPS"),
                    ],
                });
            }
        }

        // Next counter generation: qualified pairs advance, the rest reset
        let mut next: PersistenceCounters = counters.keys().map(|k| (k.clone(), 0)).collect();
        for c in &candidates {
            next.insert(c.pair_id.clone(), c.persistence);
        }

        info!(
            legs = legs.len(),
            candidates = candidates.len(),
            "Pair candidates built"
        );
        (candidates, next)
    }

    /// Turn gated candidates into sized intents, best score first.
    pub fn select_intents(
        &self,
        candidates: &[PairCandidate],
        open_pair_ids: &BTreeSet<String>,
        capital_usd: Decimal,
        cycle_id: u64,
    ) -> Vec<TradeIntent> {
        let mut eligible: Vec<&PairCandidate> = candidates
            .iter()
            .filter(|c| c.persistence >= self.config.min_persistence_windows)
            .filter(|c| !open_pair_ids.contains(&c.pair_id))
            .collect();

        eligible.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.pair_id.cmp(&b.pair_id))
        });

        eligible
            .into_iter()
            .take(self.config.max_new_positions_per_cycle)
            .map(|c| self.size_intent(c, capital_usd, cycle_id))
            .collect()
    }

    fn size_intent(&self, c: &PairCandidate, capital_usd: Decimal, cycle_id: u64) -> TradeIntent {
        let notional_short = (capital_usd * self.config.capital_fraction)
            .min(self.max_pair_notional_usd)
            .max(self.config.min_order_usd);
        let notional_long = notional_short * c.beta.max(dec!(0.1));

        TradeIntent {
            pair_id: c.pair_id.clone(),
            cycle_id,
            idempotency_key: idempotency_key(
                cycle_id,
                &c.short_leg.leg_id(),
                &c.long_leg.leg_id(),
            ),
            short_leg: TradeLeg {
                venue: c.short_leg.venue.clone(),
                symbol: c.short_leg.symbol.clone(),
                side: OrderSide::Sell,
                notional_usd: notional_short,
                entry_rate: c.short_leg.rate,
            },
            long_leg: TradeLeg {
                venue: c.long_leg.venue.clone(),
                symbol: c.long_leg.symbol.clone(),
                side: OrderSide::Buy,
                notional_usd: notional_long,
                entry_rate: c.long_leg.rate,
            },
            expected_edge_bps: c.expected_edge_bps,
            score: c.score,
            beta: c.beta,
            reason_codes: c.reason_codes.clone(),
        }
    }

    /// Quality blend in [0, 1]: edge, combined rate magnitude, beta
    /// affinity to 1, and open-interest adequacy.
    fn quality_score(
        &self,
        edge_bps: Decimal,
        short: &CandidateLeg,
        long: &CandidateLeg,
        beta: Decimal,
    ) -> Decimal {
        let edge_component = (edge_bps / dec!(50)).clamp(Decimal::ZERO, Decimal::ONE);
        let rate_component =
            ((short.rate.abs() + long.rate.abs()) / dec!(0.01)).clamp(Decimal::ZERO, Decimal::ONE);
        let beta_affinity = Decimal::ONE / (Decimal::ONE + (beta - Decimal::ONE).abs());
        let oi_component = match (short.oi_usd, long.oi_usd) {
            (Some(a), Some(b)) => (a.min(b) / dec!(5_000_000)).clamp(Decimal::ZERO, Decimal::ONE),
            // OI unknown on a leg: neither reward nor disqualify
            _ => dec!(0.5),
        };

        dec!(0.35) * edge_component
            + dec!(0.25) * rate_component
            + dec!(0.20) * beta_affinity
            + dec!(0.20) * oi_component
    }
}
