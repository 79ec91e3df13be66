//! Cycle orchestration.
//!
//! A single writer sequences each cycle: quotes, universe, candidates,
//! risk, execution, equity, then one atomic state persist. Cycles never
//! overlap; a cross-process lease lock in the state store keeps a second
//! instance from running against the same book.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{error, info, instrument, warn};

use crate::config::Config;
use crate::execution::{ExecutionService, IntentOutcome};
use crate::market::feed::canonical_symbol;
use crate::market::service::{MarketDataService, SymbolQuote};
use crate::market::universe::UniverseProvider;
use crate::monitoring::{AlertEvent, WebhookNotifier};
use crate::persistence::{keys, StateBatch, StateStore};
use crate::risk::{PairStatus, PortfolioState, RiskService, RiskStatus};
use crate::strategy::signals::{PersistenceCounters, SignalService};

/// Equity drop within one cycle that raises an anomaly alert.
const EQUITY_DROP_ALERT_PCT: Decimal = dec!(0.05);
/// Execution failure ratio that raises an anomaly alert.
const EXECUTION_FAILURE_ALERT_RATIO: Decimal = dec!(0.20);
/// Consecutive skipped cycles surfaced to the operator.
const CYCLE_SKIP_ALERT_THRESHOLD: u32 = 3;
/// Lock lease is this multiple of the cycle period.
const LOCK_LEASE_PERIODS: i64 = 3;

/// Persisted per-cycle event summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleSummary {
    pub cycle_id: u64,
    pub started_at: DateTime<Utc>,
    pub universe_size: usize,
    pub candidates: usize,
    pub intents: usize,
    pub executed: usize,
    pub blocked: usize,
    pub failed: usize,
    pub flattened: usize,
    pub zombies: usize,
    pub rebalanced: usize,
    pub risk_status: RiskStatus,
    pub status_changed: bool,
    pub equity_usd: Decimal,
    pub drawdown: Decimal,
    pub skipped: bool,
    pub skip_reason: Option<String>,
}

impl CycleSummary {
    fn skipped(cycle_id: u64, status: RiskStatus, equity: Decimal, reason: String) -> Self {
        Self {
            cycle_id,
            started_at: Utc::now(),
            universe_size: 0,
            candidates: 0,
            intents: 0,
            executed: 0,
            blocked: 0,
            failed: 0,
            flattened: 0,
            zombies: 0,
            rebalanced: 0,
            risk_status: status,
            status_changed: false,
            equity_usd: equity,
            drawdown: Decimal::ZERO,
            skipped: true,
            skip_reason: Some(reason),
        }
    }
}

/// The single-writer cycle orchestrator.
pub struct Engine {
    config: Config,
    market: MarketDataService,
    universe: UniverseProvider,
    signals: SignalService,
    risk: RiskService,
    execution: ExecutionService,
    store: StateStore,
    notifier: WebhookNotifier,
    lock_owner: String,
    portfolio: PortfolioState,
    counters: PersistenceCounters,
    consecutive_skips: u32,
    needs_reconcile: bool,
}

impl Engine {
    /// Assemble the engine, loading any persisted portfolio state.
    pub fn new(
        config: Config,
        market: MarketDataService,
        execution: ExecutionService,
        store: StateStore,
        notifier: WebhookNotifier,
    ) -> Result<Self> {
        let portfolio = match store.get::<PortfolioState>(keys::PORTFOLIO)? {
            Some(state) => {
                info!(
                    equity = %state.equity_usd,
                    open_pairs = state.open_pairs.len(),
                    cycle = state.last_cycle_id,
                    "Loaded persisted portfolio state"
                );
                state
            }
            None => PortfolioState::new(config.engine.initial_capital_usd),
        };
        let counters = store
            .get::<PersistenceCounters>(keys::COUNTERS)?
            .unwrap_or_default();

        let universe = UniverseProvider::new(config.universe.clone(), config.signal.fr_diff_min);
        let signals = SignalService::new(
            config.signal.clone(),
            config.risk.max_notional_per_pair_usd,
        );
        let risk = RiskService::new(config.risk.clone());
        let lock_owner = format!("funding-arb-{}", std::process::id());

        Ok(Self {
            config,
            market,
            universe,
            signals,
            risk,
            execution,
            store,
            notifier,
            lock_owner,
            portfolio,
            counters,
            consecutive_skips: 0,
            needs_reconcile: true,
        })
    }

    pub fn portfolio(&self) -> &PortfolioState {
        &self.portfolio
    }

    /// Take the cross-process instance lock. Returns false when another
    /// live instance holds it.
    pub fn acquire_instance_lock(&self) -> Result<bool> {
        self.store
            .acquire_lock(&self.lock_owner, self.lock_lease())
    }

    pub fn release_instance_lock(&self) -> Result<()> {
        self.store.release_lock(&self.lock_owner)
    }

    fn lock_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            self.config.engine.cycle_period_seconds as i64 * LOCK_LEASE_PERIODS,
        )
    }

    /// Reconcile persisted open pairs against venue positions.
    ///
    /// Default policy `flatten_or_adopt`: a pair whose both legs exist on
    /// the venues in expected sizes is adopted (book updated to venue
    /// truth); anything else is flattened. A failed flatten turns the
    /// pair ZOMBIE and halts new entries.
    #[instrument(skip(self))]
    pub async fn reconcile_on_start(&mut self) -> Result<()> {
        let pair_ids: Vec<String> = self.portfolio.open_pairs.keys().cloned().collect();
        if pair_ids.is_empty() {
            self.needs_reconcile = false;
            return Ok(());
        }
        info!(pairs = pair_ids.len(), "Reconciling open pairs against venues");

        // One positions call per involved venue
        let mut venue_positions: HashMap<String, HashMap<String, (crate::venue::OrderSide, Decimal)>> =
            HashMap::new();
        let venues: BTreeSet<String> = self
            .portfolio
            .open_pairs
            .values()
            .flat_map(|p| p.legs().into_iter().map(|l| l.venue.clone()))
            .collect();
        for venue in venues {
            let positions = self
                .execution
                .router()
                .positions(&venue)
                .await
                .with_context(|| format!("position reconciliation failed on {venue}"))?;
            let by_symbol = positions
                .into_iter()
                .map(|p| (p.symbol.clone(), (p.side, p.notional_usd)))
                .collect();
            venue_positions.insert(venue, by_symbol);
        }

        let tolerance = self.config.execution.partial_fill_tolerance;
        let mut batch = StateBatch::new();

        for pair_id in pair_ids {
            let Some(mut pair) = self.portfolio.open_pairs.remove(&pair_id) else {
                continue;
            };
            if pair.status == PairStatus::Zombie {
                self.portfolio.open_pairs.insert(pair_id, pair);
                continue;
            }

            let mut adoptable = true;
            for leg in [&pair.short_leg, &pair.long_leg] {
                let found = venue_positions
                    .get(&leg.venue)
                    .and_then(|m| m.get(&leg.symbol));
                match found {
                    Some((side, notional)) if *side == leg.side => {
                        let drift = if leg.current_notional_usd == Decimal::ZERO {
                            Decimal::ONE
                        } else {
                            ((*notional - leg.current_notional_usd)
                                / leg.current_notional_usd)
                                .abs()
                        };
                        if drift > tolerance {
                            adoptable = false;
                        }
                    }
                    _ => adoptable = false,
                }
            }

            if adoptable {
                // Adopt venue truth as the current sizes
                for leg in [&mut pair.short_leg, &mut pair.long_leg] {
                    if let Some((_, notional)) = venue_positions
                        .get(&leg.venue)
                        .and_then(|m| m.get(&leg.symbol))
                    {
                        leg.current_notional_usd = *notional;
                    }
                }
                info!(%pair_id, "Pair adopted from venue state");
                batch.put(keys::pair(&pair_id), &pair)?;
                self.portfolio.open_pairs.insert(pair_id, pair);
                continue;
            }

            // Divergence: flatten whatever actually exists on the venues
            warn!(%pair_id, "Pair diverged from venue state, flattening");
            for leg in [&mut pair.short_leg, &mut pair.long_leg] {
                let on_venue = venue_positions
                    .get(&leg.venue)
                    .and_then(|m| m.get(&leg.symbol))
                    .filter(|(side, _)| *side == leg.side)
                    .map(|(_, notional)| *notional)
                    .unwrap_or(Decimal::ZERO);
                leg.current_notional_usd = on_venue;
            }

            let close = self
                .execution
                .close_pair(&pair, self.portfolio.last_cycle_id + 1)
                .await;
            if close.success {
                self.notifier
                    .send(AlertEvent::pair_flattened(&pair.pair_id, "restart divergence"))
                    .await;
                self.portfolio.capital_usd += close.realized_pnl_usd;
                batch.delete(keys::pair(&pair.pair_id));
            } else {
                let detail = close.zombie_detail.unwrap_or_default();
                pair.status = PairStatus::Zombie;
                self.notifier
                    .send(AlertEvent::zombie_pair(&pair.pair_id, &detail))
                    .await;
                self.portfolio.risk_status = RiskStatus::HaltNew;
                batch.put(keys::pair(&pair.pair_id), &pair)?;
                self.portfolio.open_pairs.insert(pair_id, pair);
            }
        }

        self.portfolio.recompute_equity();
        batch.put(keys::PORTFOLIO, &self.portfolio)?;
        self.store.apply(&batch)?;
        self.needs_reconcile = false;
        Ok(())
    }

    /// Run cycles until the task is cancelled.
    pub async fn run(&mut self) -> Result<()> {
        let period = Duration::from_secs(self.config.engine.cycle_period_seconds);
        let deadline = Duration::from_secs(self.config.engine.cycle_deadline_secs);

        loop {
            let started = tokio::time::Instant::now();

            if self.needs_reconcile {
                if let Err(e) = self.reconcile_on_start().await {
                    error!(error = %e, "Reconciliation failed, skipping cycle");
                    self.note_skip(format!("reconcile: {e}")).await?;
                    sleep(period).await;
                    continue;
                }
            }

            match timeout(deadline, self.run_cycle()).await {
                Ok(Ok(summary)) => {
                    info!(
                        cycle = summary.cycle_id,
                        candidates = summary.candidates,
                        intents = summary.intents,
                        executed = summary.executed,
                        blocked = summary.blocked,
                        rebalanced = summary.rebalanced,
                        status = %summary.risk_status,
                        equity = %summary.equity_usd,
                        "Cycle complete"
                    );
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Cycle skipped");
                    self.note_skip(e.to_string()).await?;
                }
                Err(_) => {
                    // Deadline abort: roll forward, reconcile open legs
                    // at the next cycle start
                    error!("Cycle deadline exceeded, rolling forward");
                    self.needs_reconcile = true;
                    self.note_skip("cycle deadline exceeded".to_string()).await?;
                }
            }

            let elapsed = started.elapsed();
            if elapsed < period {
                sleep(period - elapsed).await;
            }
        }
    }

    /// Execute one full cycle. Errors skip the cycle; the next one runs
    /// against fresh data.
    #[instrument(skip(self), fields(cycle_id = self.portfolio.last_cycle_id + 1))]
    pub async fn run_cycle(&mut self) -> Result<CycleSummary> {
        let cycle_id = self.portfolio.last_cycle_id + 1;
        let started_at = Utc::now();
        let equity_before = self.portfolio.equity_usd;
        let status_before = self.portfolio.risk_status;

        // Steps 2-3: quotes, then the universe (static list wins)
        let (universe, quotes) = self.resolve_universe_and_quotes().await?;

        // Step 4: candidates and the next counter generation
        let (candidates, next_counters) = self.signals.build_candidates(&quotes, &self.counters);
        let open_ids: BTreeSet<String> = self.portfolio.open_pairs.keys().cloned().collect();
        let intents = self.signals.select_intents(
            &candidates,
            &open_ids,
            self.portfolio.capital_usd,
            cycle_id,
        );
        let intents_generated = intents.len();
        self.counters = next_counters;

        // Step 5: risk evaluation over the pre-execution snapshot
        let decision = self.risk.evaluate(&self.portfolio, intents);
        let status_changed = decision.status != self.portfolio.risk_status;
        if status_changed {
            self.notifier
                .send(AlertEvent::state_transition(
                    self.portfolio.risk_status,
                    decision.status,
                    decision.drawdown,
                ))
                .await;
        }
        self.portfolio.risk_status = decision.status;
        for (intent, reason) in &decision.rejected {
            info!(pair_id = %intent.pair_id, %reason, "Intent blocked");
        }

        // Step 6: rebalances and shrinks first, then new intents
        let mut rebalanced = 0usize;
        for adjustment in &decision.adjustments {
            let Some(pair) = self.portfolio.open_pairs.remove(&adjustment.pair_id) else {
                continue;
            };
            let updated = self
                .execution
                .execute_adjustment(pair, adjustment, cycle_id)
                .await;
            self.portfolio
                .open_pairs
                .insert(updated.pair_id.clone(), updated);
            rebalanced += 1;
        }

        let attempted = decision.admitted.len();
        let mut executed = 0usize;
        let mut flattened = 0usize;
        let mut zombies = 0usize;
        for intent in &decision.admitted {
            match self.execution.execute_intent(intent).await {
                IntentOutcome::Opened(pair) => {
                    self.portfolio
                        .open_pairs
                        .insert(pair.pair_id.clone(), pair);
                    executed += 1;
                }
                IntentOutcome::AlreadyExecuted { pair_id } => {
                    info!(%pair_id, "Intent previously executed");
                    executed += 1;
                }
                IntentOutcome::PartialFillFlattened { pair_id, detail } => {
                    flattened += 1;
                    self.notifier
                        .send(AlertEvent::pair_flattened(&pair_id, &detail))
                        .await;
                }
                IntentOutcome::Rejected { pair_id, reason } => {
                    warn!(%pair_id, %reason, "Intent execution rejected");
                }
                IntentOutcome::Zombie { pair, detail } => {
                    zombies += 1;
                    self.notifier
                        .send(AlertEvent::zombie_pair(&pair.pair_id, &detail))
                        .await;
                    self.portfolio
                        .open_pairs
                        .insert(pair.pair_id.clone(), pair);
                    // Fatal execution state halts new entries outright
                    self.portfolio.risk_status = RiskStatus::HaltNew;
                }
            }
        }

        // Step 7: accrue pro-rated funding, recompute equity and peak
        let settlement_fraction = Decimal::from(self.config.engine.cycle_period_seconds)
            / Decimal::from(8 * 3600);
        for pair in self.portfolio.open_pairs.values_mut() {
            if pair.status == PairStatus::Open {
                pair.accrue_funding(settlement_fraction);
            }
        }
        self.portfolio.recompute_equity();
        self.portfolio.last_cycle_id = cycle_id;
        self.portfolio.last_cycle_at = Some(started_at);

        let summary = CycleSummary {
            cycle_id,
            started_at,
            universe_size: universe.len(),
            candidates: candidates.len(),
            intents: intents_generated,
            executed,
            blocked: decision.rejected.len(),
            failed: attempted - executed,
            flattened,
            zombies,
            rebalanced,
            risk_status: self.portfolio.risk_status,
            status_changed,
            equity_usd: self.portfolio.equity_usd,
            drawdown: self.portfolio.drawdown(),
            skipped: false,
            skip_reason: None,
        };

        // Step 8: one atomic batch for state, counters, pairs, summary
        self.persist(&summary)?;
        self.consecutive_skips = 0;

        // Step 9: anomaly surfacing
        self.emit_anomalies(equity_before, attempted, attempted - executed)
            .await;
        if status_before != self.portfolio.risk_status {
            info!(
                from = %status_before,
                to = %self.portfolio.risk_status,
                "Cycle closed with state change"
            );
        }

        Ok(summary)
    }

    async fn resolve_universe_and_quotes(
        &self,
    ) -> Result<(Vec<String>, HashMap<String, SymbolQuote>)> {
        if !self.config.engine.symbols.is_empty() {
            // Static list honored verbatim
            let universe: Vec<String> = self
                .config
                .engine
                .symbols
                .iter()
                .map(|s| canonical_symbol(s))
                .collect();
            let quotes = self
                .market
                .snapshot(&universe)
                .await
                .context("quote refresh failed")?;
            return Ok((universe, quotes));
        }

        let supported: Vec<String> = self
            .market
            .supported_symbols()
            .await
            .context("symbol discovery failed")?
            .into_iter()
            .collect();
        let all_quotes = self
            .market
            .snapshot(&supported)
            .await
            .context("quote refresh failed")?;
        let universe = self.universe.select(&all_quotes);
        let quotes = all_quotes
            .into_iter()
            .filter(|(symbol, _)| universe.contains(symbol))
            .collect();
        Ok((universe, quotes))
    }

    fn persist(&self, summary: &CycleSummary) -> Result<()> {
        let mut batch = StateBatch::new();
        batch.put(keys::PORTFOLIO, &self.portfolio)?;
        batch.put(keys::COUNTERS, &self.counters)?;
        for (pair_id, pair) in &self.portfolio.open_pairs {
            batch.put(keys::pair(pair_id), pair)?;
        }
        // Pairs closed this cycle leave the keyspace
        for key in self.store.keys_with_prefix("pairs/")? {
            let pair_id = key.trim_start_matches("pairs/");
            if !self.portfolio.open_pairs.contains_key(pair_id) {
                batch.delete(key.clone());
            }
        }
        batch.put(keys::cycle_summary(summary.cycle_id), summary)?;
        self.store.apply(&batch)?;

        // Keep the lease ahead of the next cycle
        self.store.renew_lock(&self.lock_owner, self.lock_lease())?;
        Ok(())
    }

    async fn note_skip(&mut self, reason: String) -> Result<()> {
        self.consecutive_skips += 1;
        let cycle_id = self.portfolio.last_cycle_id + 1;
        let summary = CycleSummary::skipped(
            cycle_id,
            self.portfolio.risk_status,
            self.portfolio.equity_usd,
            reason,
        );
        let mut batch = StateBatch::new();
        batch.put(keys::cycle_summary(cycle_id), &summary)?;
        self.store.apply(&batch)?;

        if self.consecutive_skips > CYCLE_SKIP_ALERT_THRESHOLD {
            self.notifier
                .send(AlertEvent::repeated_cycle_skips(self.consecutive_skips))
                .await;
        }
        Ok(())
    }

    async fn emit_anomalies(&self, equity_before: Decimal, attempted: usize, failed: usize) {
        use crate::utils::decimal::safe_div;

        if equity_before > Decimal::ZERO {
            let drop_pct = safe_div(equity_before - self.portfolio.equity_usd, equity_before);
            if drop_pct > EQUITY_DROP_ALERT_PCT {
                self.notifier
                    .send(AlertEvent::equity_drop(
                        equity_before,
                        self.portfolio.equity_usd,
                        drop_pct * dec!(100),
                    ))
                    .await;
            }
        }

        if attempted > 0 {
            let ratio = safe_div(Decimal::from(failed), Decimal::from(attempted));
            if ratio > EXECUTION_FAILURE_ALERT_RATIO {
                self.notifier
                    .send(AlertEvent::execution_failures(failed, attempted))
                    .await;
            }
        }
    }
}
