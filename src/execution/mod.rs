//! Idempotent two-leg order execution.
//!
//! An intent either becomes a fully paired position, is flattened back to
//! zero exposure, or is marked ZOMBIE for the operator. The engine never
//! holds one leg without a record of the other. Client order ids are
//! derived from the intent's idempotency key, so a crashed attempt can be
//! resumed by querying venue order history instead of resubmitting.

use chrono::Utc;
use rust_decimal::Decimal;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use crate::config::ExecutionConfig;
use crate::risk::{PairAdjustment, PairLeg, PairStatus, PositionPair};
use crate::strategy::signals::{idempotency_key, TradeIntent, TradeLeg};
use crate::venue::{OrderAck, OrderStatus, VenueError, VenueRouter};

const FILL_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Terminal result of processing one intent.
#[derive(Debug)]
pub enum IntentOutcome {
    /// Both legs filled; the pair is live
    Opened(PositionPair),
    /// One-sided fill was market-closed; no position remains
    PartialFillFlattened { pair_id: String, detail: String },
    /// Pre-flight or venue rejection; nothing was filled
    Rejected { pair_id: String, reason: String },
    /// A prior attempt already resolved this intent
    AlreadyExecuted { pair_id: String },
    /// Exposure could not be removed; operator intervention required
    Zombie { pair: PositionPair, detail: String },
}

impl IntentOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            IntentOutcome::Opened(_) | IntentOutcome::AlreadyExecuted { .. }
        )
    }
}

/// Result of closing a pair.
#[derive(Debug)]
pub struct CloseOutcome {
    pub pair_id: String,
    pub success: bool,
    /// Set when a leg could not be closed and the pair turned ZOMBIE
    pub zombie_detail: Option<String>,
    pub realized_pnl_usd: Decimal,
}

/// Executes intents, adjustments, and exits against the venue router.
pub struct ExecutionService {
    router: VenueRouter,
    config: ExecutionConfig,
    /// Venue leverage assumed for margin requirements
    margin_leverage: Decimal,
}

impl ExecutionService {
    pub fn new(router: VenueRouter, config: ExecutionConfig, margin_leverage: Decimal) -> Self {
        Self {
            router,
            config,
            margin_leverage: margin_leverage.max(Decimal::ONE),
        }
    }

    pub fn router(&self) -> &VenueRouter {
        &self.router
    }

    /// Run the full entry protocol for one intent.
    #[instrument(skip(self, intent), fields(pair_id = %intent.pair_id))]
    pub async fn execute_intent(&self, intent: &TradeIntent) -> IntentOutcome {
        let key = &intent.idempotency_key;
        let deadline = Instant::now() + Duration::from_secs(self.config.intent_deadline_secs);

        // Resume after crash: an already-resolved attempt is terminal
        match self.prior_resolution(intent, key).await {
            Ok(Some(outcome)) => return outcome,
            Ok(None) => {}
            Err(e) => {
                return IntentOutcome::Rejected {
                    pair_id: intent.pair_id.clone(),
                    reason: format!("history check failed: {e}"),
                }
            }
        }

        if let Err(reason) = self.preflight_margin(intent).await {
            info!(%reason, "Intent aborted pre-flight");
            return IntentOutcome::Rejected {
                pair_id: intent.pair_id.clone(),
                reason,
            };
        }

        // Legs go out in parallel under the shared intent deadline
        let short_key = format!("{key}-a");
        let long_key = format!("{key}-b");
        let (short_res, long_res) = tokio::join!(
            self.place_with_retry(&intent.short_leg, &short_key, deadline),
            self.place_with_retry(&intent.long_leg, &long_key, deadline),
        );

        let fill_deadline = Instant::now()
            + Duration::from_secs(self.config.leg_fill_timeout_secs).min(
                deadline.saturating_duration_since(Instant::now()),
            );
        let short_ack = match short_res {
            Ok(ack) => Some(self.await_fill(ack, fill_deadline).await),
            Err(e) => {
                debug!(error = %e, "Short leg submission failed");
                None
            }
        };
        let long_ack = match long_res {
            Ok(ack) => Some(self.await_fill(ack, fill_deadline).await),
            Err(e) => {
                debug!(error = %e, "Long leg submission failed");
                None
            }
        };

        self.reconcile_fills(intent, key, short_ack, long_ack).await
    }

    /// Apply a shrink or rebalance directive to an open pair, returning
    /// the updated pair. Legs that fail to adjust are retried next cycle
    /// via the unchanged drift.
    #[instrument(skip(self, pair, adjustment), fields(pair_id = %pair.pair_id))]
    pub async fn execute_adjustment(
        &self,
        mut pair: PositionPair,
        adjustment: &PairAdjustment,
        cycle_id: u64,
    ) -> PositionPair {
        let deadline = Instant::now() + Duration::from_secs(self.config.intent_deadline_secs);

        for (idx, leg_adj) in adjustment.legs.iter().enumerate() {
            let target_leg = if pair.short_leg.venue == leg_adj.venue
                && pair.short_leg.symbol == leg_adj.symbol
            {
                &mut pair.short_leg
            } else {
                &mut pair.long_leg
            };
            target_leg.target_notional_usd = leg_adj.new_target_notional_usd;

            if leg_adj.delta_notional_usd == Decimal::ZERO {
                continue;
            }

            let client_id = format!(
                "{}-r{idx}",
                idempotency_key(cycle_id, &pair.pair_id, &leg_adj.symbol)
            );
            let order = TradeLeg {
                venue: leg_adj.venue.clone(),
                symbol: leg_adj.symbol.clone(),
                side: leg_adj.side,
                notional_usd: leg_adj.delta_notional_usd,
                entry_rate: Decimal::ZERO,
            };

            match self.place_with_retry(&order, &client_id, deadline).await {
                Ok(ack) => {
                    let filled = self.await_fill(ack, deadline).await.filled_notional_usd;
                    // Adjusting orders oppose the leg side when shrinking
                    if leg_adj.side == target_leg.side {
                        target_leg.current_notional_usd += filled;
                    } else {
                        target_leg.current_notional_usd =
                            (target_leg.current_notional_usd - filled).max(Decimal::ZERO);
                    }
                    info!(
                        symbol = %leg_adj.symbol,
                        %filled,
                        current = %target_leg.current_notional_usd,
                        "Leg adjusted"
                    );
                }
                Err(e) => {
                    warn!(symbol = %leg_adj.symbol, error = %e, "Leg adjustment failed");
                }
            }
        }
        pair
    }

    /// Close both legs of a pair with fresh exit keys.
    #[instrument(skip(self, pair), fields(pair_id = %pair.pair_id))]
    pub async fn close_pair(&self, pair: &PositionPair, exit_epoch: u64) -> CloseOutcome {
        let deadline = Instant::now() + Duration::from_secs(self.config.intent_deadline_secs);
        let key = idempotency_key(
            exit_epoch,
            &format!("{}:{}", pair.short_leg.venue, pair.short_leg.symbol),
            &format!("{}:{}", pair.long_leg.venue, pair.long_leg.symbol),
        );

        let mut failures = Vec::new();
        for (suffix, leg) in [("xa", &pair.short_leg), ("xb", &pair.long_leg)] {
            if leg.current_notional_usd == Decimal::ZERO {
                continue;
            }
            let order = TradeLeg {
                venue: leg.venue.clone(),
                symbol: leg.symbol.clone(),
                side: leg.side.opposite(),
                notional_usd: leg.current_notional_usd,
                entry_rate: Decimal::ZERO,
            };
            if let Err(e) = self
                .place_with_retry(&order, &format!("{key}-{suffix}"), deadline)
                .await
            {
                failures.push(format!("{}:{} {e}", leg.venue, leg.symbol));
            }
        }

        if failures.is_empty() {
            info!("Pair closed");
            CloseOutcome {
                pair_id: pair.pair_id.clone(),
                success: true,
                zombie_detail: None,
                realized_pnl_usd: pair.mark_to_market_usd(),
            }
        } else {
            let detail = failures.join("; ");
            error!(%detail, "Pair close failed");
            CloseOutcome {
                pair_id: pair.pair_id.clone(),
                success: false,
                zombie_detail: Some(detail),
                realized_pnl_usd: Decimal::ZERO,
            }
        }
    }

    /// Close every open pair. Used on unrecoverable divergence.
    pub async fn emergency_flatten(
        &self,
        pairs: Vec<PositionPair>,
        exit_epoch: u64,
    ) -> Vec<CloseOutcome> {
        warn!(count = pairs.len(), "Emergency flatten");
        let mut outcomes = Vec::new();
        for pair in pairs {
            outcomes.push(self.close_pair(&pair, exit_epoch).await);
        }
        outcomes
    }

    // ==================== Entry protocol internals ====================

    /// Check venue history for a prior attempt under the same key.
    async fn prior_resolution(
        &self,
        intent: &TradeIntent,
        key: &str,
    ) -> Result<Option<IntentOutcome>, VenueError> {
        // A flatten order on record means the attempt resolved to flatten
        let flattened = self
            .router
            .order_status(&intent.short_leg.venue, &format!("{key}-fa"))
            .await?
            .is_some()
            || self
                .router
                .order_status(&intent.long_leg.venue, &format!("{key}-fb"))
                .await?
                .is_some();
        if flattened {
            return Ok(Some(IntentOutcome::PartialFillFlattened {
                pair_id: intent.pair_id.clone(),
                detail: "resolved to flatten in a prior attempt".to_string(),
            }));
        }

        let short_prior = self
            .router
            .order_status(&intent.short_leg.venue, &format!("{key}-a"))
            .await?;
        let long_prior = self
            .router
            .order_status(&intent.long_leg.venue, &format!("{key}-b"))
            .await?;

        match (short_prior, long_prior) {
            (Some(a), Some(b))
                if a.status == OrderStatus::Filled && b.status == OrderStatus::Filled =>
            {
                info!("Intent already filled in a prior attempt");
                Ok(Some(IntentOutcome::AlreadyExecuted {
                    pair_id: intent.pair_id.clone(),
                }))
            }
            // Partial prior state falls through to the normal protocol;
            // venue-side dedupe makes resubmission a no-op
            _ => Ok(None),
        }
    }

    /// Balance must cover required margin on every involved venue.
    async fn preflight_margin(&self, intent: &TradeIntent) -> Result<(), String> {
        let mut required: std::collections::HashMap<&str, Decimal> = Default::default();
        for leg in [&intent.short_leg, &intent.long_leg] {
            *required.entry(leg.venue.as_str()).or_default() +=
                leg.notional_usd / self.margin_leverage;
        }

        for (venue, needed) in required {
            let balance = self
                .router
                .balance(venue)
                .await
                .map_err(|e| format!("balance check failed on {venue}: {e}"))?;
            if balance.available_usd < needed {
                return Err(format!(
                    "insufficient margin on {venue}: required {needed}, available {}",
                    balance.available_usd
                ));
            }
        }
        Ok(())
    }

    /// Submit one order with per-attempt timeout and transient retries.
    async fn place_with_retry(
        &self,
        leg: &TradeLeg,
        client_order_id: &str,
        deadline: Instant,
    ) -> Result<OrderAck, VenueError> {
        let attempt_timeout = Duration::from_secs(self.config.order_attempt_timeout_secs);
        let mut last_err = VenueError::Transient("no attempts made".to_string());

        for attempt in 1..=self.config.max_retries {
            if Instant::now() >= deadline {
                return Err(VenueError::Transient("intent deadline exceeded".to_string()));
            }

            let call = self.router.place_order(
                &leg.venue,
                &leg.symbol,
                leg.side,
                leg.notional_usd,
                client_order_id,
            );
            match timeout(attempt_timeout, call).await {
                Ok(Ok(ack)) => return Ok(ack),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => {
                    warn!(venue = %leg.venue, symbol = %leg.symbol, attempt, error = %e, "Order attempt failed");
                    last_err = e;
                }
                Err(_) => {
                    warn!(venue = %leg.venue, symbol = %leg.symbol, attempt, "Order attempt timed out");
                    last_err = VenueError::Transient("attempt timeout".to_string());
                }
            }

            if attempt < self.config.max_retries {
                sleep(Duration::from_millis(500 * attempt as u64)).await;
            }
        }
        Err(last_err)
    }

    /// Poll order status until filled or the deadline passes; returns the
    /// last observed state.
    async fn await_fill(&self, ack: OrderAck, deadline: Instant) -> OrderAck {
        let mut latest = ack;
        while latest.status == OrderStatus::New
            || latest.status == OrderStatus::PartiallyFilled
        {
            if Instant::now() >= deadline {
                break;
            }
            sleep(FILL_POLL_INTERVAL).await;
            match self
                .router
                .order_status(&latest.venue, &latest.client_order_id)
                .await
            {
                Ok(Some(updated)) => latest = updated,
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "Fill poll failed");
                    if Instant::now() >= deadline {
                        break;
                    }
                }
            }
        }
        latest
    }

    /// Decide the intent outcome from the observed fills.
    async fn reconcile_fills(
        &self,
        intent: &TradeIntent,
        key: &str,
        short_ack: Option<OrderAck>,
        long_ack: Option<OrderAck>,
    ) -> IntentOutcome {
        let short_filled = short_ack
            .as_ref()
            .map(|a| a.filled_notional_usd)
            .unwrap_or(Decimal::ZERO);
        let long_filled = long_ack
            .as_ref()
            .map(|a| a.filled_notional_usd)
            .unwrap_or(Decimal::ZERO);
        let short_complete =
            short_ack.as_ref().map(|a| a.status) == Some(OrderStatus::Filled);
        let long_complete = long_ack.as_ref().map(|a| a.status) == Some(OrderStatus::Filled);

        // Both legs fully filled
        if short_complete && long_complete {
            info!(%short_filled, %long_filled, "Pair opened");
            return IntentOutcome::Opened(build_pair(intent, short_filled, long_filled));
        }

        // Neither leg touched: cancel any resting orders and give up
        if short_filled == Decimal::ZERO && long_filled == Decimal::ZERO {
            self.cancel_quietly(&intent.short_leg.venue, &format!("{key}-a"))
                .await;
            self.cancel_quietly(&intent.long_leg.venue, &format!("{key}-b"))
                .await;
            return IntentOutcome::Rejected {
                pair_id: intent.pair_id.clone(),
                reason: "no fills within timeout".to_string(),
            };
        }

        // Both sides partially filled: accept within tolerance, else trim
        if !short_complete && !long_complete
            && short_filled > Decimal::ZERO
            && long_filled > Decimal::ZERO
        {
            return self
                .settle_partial_pair(intent, key, short_filled, long_filled)
                .await;
        }

        // One-sided exposure: fail-safe flatten everything that filled
        self.flatten_fills(intent, key, short_filled, long_filled)
            .await
    }

    async fn settle_partial_pair(
        &self,
        intent: &TradeIntent,
        key: &str,
        short_filled: Decimal,
        long_filled: Decimal,
    ) -> IntentOutcome {
        // Cancel resting remainders before sizing the outcome
        self.cancel_quietly(&intent.short_leg.venue, &format!("{key}-a"))
            .await;
        self.cancel_quietly(&intent.long_leg.venue, &format!("{key}-b"))
            .await;

        let frac_short = short_filled / intent.short_leg.notional_usd;
        let frac_long = long_filled / intent.long_leg.notional_usd;
        let mismatch = (frac_short - frac_long).abs();

        if mismatch <= self.config.partial_fill_tolerance {
            info!(%short_filled, %long_filled, "Partial fills within tolerance");
            return IntentOutcome::Opened(build_pair(intent, short_filled, long_filled));
        }

        // Trim the deeper-filled leg down to the other's fill fraction
        let (leg, suffix, excess) = if frac_short > frac_long {
            let target = frac_long * intent.short_leg.notional_usd;
            (&intent.short_leg, "ta", short_filled - target)
        } else {
            let target = frac_short * intent.long_leg.notional_usd;
            (&intent.long_leg, "tb", long_filled - target)
        };

        let trim = TradeLeg {
            venue: leg.venue.clone(),
            symbol: leg.symbol.clone(),
            side: leg.side.opposite(),
            notional_usd: excess,
            entry_rate: Decimal::ZERO,
        };
        let deadline = Instant::now() + Duration::from_secs(self.config.intent_deadline_secs);

        match self
            .place_with_retry(&trim, &format!("{key}-{suffix}"), deadline)
            .await
        {
            Ok(ack) => {
                let trimmed = self.await_fill(ack, deadline).await.filled_notional_usd;
                let (final_short, final_long) = if frac_short > frac_long {
                    (short_filled - trimmed, long_filled)
                } else {
                    (short_filled, long_filled - trimmed)
                };
                info!(%final_short, %final_long, "Larger leg trimmed to match");
                IntentOutcome::Opened(build_pair(intent, final_short, final_long))
            }
            Err(e) => {
                warn!(error = %e, "Trim failed, flattening pair");
                self.flatten_fills(intent, key, short_filled, long_filled)
                    .await
            }
        }
    }

    /// Market-close whatever filled on either leg.
    async fn flatten_fills(
        &self,
        intent: &TradeIntent,
        key: &str,
        short_filled: Decimal,
        long_filled: Decimal,
    ) -> IntentOutcome {
        self.cancel_quietly(&intent.short_leg.venue, &format!("{key}-a"))
            .await;
        self.cancel_quietly(&intent.long_leg.venue, &format!("{key}-b"))
            .await;

        let deadline = Instant::now() + Duration::from_secs(self.config.intent_deadline_secs);
        let mut failures = Vec::new();

        for (suffix, leg, filled) in [
            ("fa", &intent.short_leg, short_filled),
            ("fb", &intent.long_leg, long_filled),
        ] {
            if filled == Decimal::ZERO {
                continue;
            }
            let closing = TradeLeg {
                venue: leg.venue.clone(),
                symbol: leg.symbol.clone(),
                side: leg.side.opposite(),
                notional_usd: filled,
                entry_rate: Decimal::ZERO,
            };
            if let Err(e) = self
                .place_with_retry(&closing, &format!("{key}-{suffix}"), deadline)
                .await
            {
                failures.push(format!("{}:{} {e}", leg.venue, leg.symbol));
            }
        }

        if failures.is_empty() {
            warn!(pair_id = %intent.pair_id, "One-sided fill flattened");
            IntentOutcome::PartialFillFlattened {
                pair_id: intent.pair_id.clone(),
                detail: format!("flattened short={short_filled} long={long_filled}"),
            }
        } else {
            let detail = format!("flatten failed: {}", failures.join("; "));
            error!(pair_id = %intent.pair_id, %detail, "Exposure stuck");
            let mut pair = build_pair(intent, short_filled, long_filled);
            pair.status = PairStatus::Zombie;
            IntentOutcome::Zombie { pair, detail }
        }
    }

    async fn cancel_quietly(&self, venue: &str, client_order_id: &str) {
        if let Err(e) = self.router.cancel(venue, client_order_id).await {
            debug!(%venue, client_order_id, error = %e, "Cancel ignored");
        }
    }
}

fn build_pair(intent: &TradeIntent, short_filled: Decimal, long_filled: Decimal) -> PositionPair {
    let leg = |l: &TradeLeg, filled: Decimal| PairLeg {
        venue: l.venue.clone(),
        symbol: l.symbol.clone(),
        side: l.side,
        entry_rate: l.entry_rate,
        entry_notional_usd: filled,
        target_notional_usd: l.notional_usd,
        current_notional_usd: filled,
    };
    PositionPair {
        pair_id: intent.pair_id.clone(),
        opened_cycle_id: intent.cycle_id,
        opened_at: Utc::now(),
        short_leg: leg(&intent.short_leg, short_filled),
        long_leg: leg(&intent.long_leg, long_filled),
        entry_edge_bps: intent.expected_edge_bps,
        funding_received_usd: Decimal::ZERO,
        realized_pnl_usd: Decimal::ZERO,
        status: PairStatus::Open,
    }
}
