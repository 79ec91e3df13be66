//! Mock venue adapter for tests and paper trading.
//!
//! Simulates order placement with configurable fill behavior per symbol,
//! venue-side client-order-id dedupe, and a net position book, so the
//! execution protocol (partial fills, flatten, idempotent resume,
//! restart reconciliation) can be exercised without a real exchange.

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use super::{Balance, OrderAck, OrderSide, OrderStatus, VenueAdapter, VenueError, VenuePosition};

/// How the mock responds to orders on a symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillBehavior {
    /// Fill the whole notional immediately
    Fill,
    /// Fill only the given fraction and stay partially filled
    Partial(Decimal),
    /// Accept the order but never fill it
    NeverFill,
    /// Reject with a logical error
    Reject,
    /// Fail with a transient network error
    FailTransient,
}

#[derive(Debug, Default)]
struct MockBook {
    /// Signed net notional per symbol (buys positive)
    net_notional: HashMap<String, Decimal>,
    /// Orders by client id, venue-side dedupe included
    orders: HashMap<String, OrderAck>,
    /// Per-symbol behavior overrides
    behaviors: HashMap<String, FillBehavior>,
    available_usd: Decimal,
}

/// In-memory venue used by unit and scenario tests.
pub struct MockVenue {
    name: String,
    book: RwLock<MockBook>,
    order_seq: AtomicU64,
    default_price: Decimal,
}

impl MockVenue {
    pub fn new(name: &str, available_usd: Decimal) -> Self {
        Self {
            name: name.to_string(),
            book: RwLock::new(MockBook {
                available_usd,
                ..MockBook::default()
            }),
            order_seq: AtomicU64::new(1),
            default_price: dec!(100),
        }
    }

    /// Override fill behavior for one symbol.
    pub async fn set_behavior(&self, symbol: &str, behavior: FillBehavior) {
        self.book
            .write()
            .await
            .behaviors
            .insert(symbol.to_string(), behavior);
    }

    /// Seed a pre-existing position, e.g. for restart reconciliation tests.
    pub async fn set_position(&self, symbol: &str, side: OrderSide, notional_usd: Decimal) {
        let signed = match side {
            OrderSide::Buy => notional_usd,
            OrderSide::Sell => -notional_usd,
        };
        self.book
            .write()
            .await
            .net_notional
            .insert(symbol.to_string(), signed);
    }

    pub async fn set_available_balance(&self, available_usd: Decimal) {
        self.book.write().await.available_usd = available_usd;
    }

    /// Signed net notional for assertions (buys positive).
    pub async fn net_notional(&self, symbol: &str) -> Decimal {
        self.book
            .read()
            .await
            .net_notional
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn order_count(&self) -> usize {
        self.book.read().await.orders.len()
    }

    fn apply_fill(book: &mut MockBook, symbol: &str, side: OrderSide, filled: Decimal) {
        let signed = match side {
            OrderSide::Buy => filled,
            OrderSide::Sell => -filled,
        };
        let entry = book
            .net_notional
            .entry(symbol.to_string())
            .or_insert(Decimal::ZERO);
        *entry += signed;
        if entry.abs() < dec!(0.000001) {
            book.net_notional.remove(symbol);
        }
    }
}

#[async_trait]
impl VenueAdapter for MockVenue {
    fn venue(&self) -> &str {
        &self.name
    }

    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        notional_usd: Decimal,
        client_order_id: &str,
    ) -> Result<OrderAck, VenueError> {
        let mut book = self.book.write().await;

        // Venue-side idempotency: a known client id returns the original
        if let Some(existing) = book.orders.get(client_order_id) {
            debug!(venue = %self.name, client_order_id, "Duplicate client order id, returning original");
            return Ok(existing.clone());
        }

        let behavior = book
            .behaviors
            .get(symbol)
            .copied()
            .unwrap_or(FillBehavior::Fill);

        match behavior {
            FillBehavior::FailTransient => {
                return Err(VenueError::Transient("connection reset".to_string()))
            }
            FillBehavior::Reject => {
                return Err(VenueError::Rejected(format!("{symbol} not accepting orders")))
            }
            _ => {}
        }

        let (status, filled) = match behavior {
            FillBehavior::Fill => (OrderStatus::Filled, notional_usd),
            FillBehavior::Partial(fraction) => {
                (OrderStatus::PartiallyFilled, notional_usd * fraction)
            }
            FillBehavior::NeverFill => (OrderStatus::New, Decimal::ZERO),
            FillBehavior::Reject | FillBehavior::FailTransient => unreachable!(),
        };

        if filled > Decimal::ZERO {
            Self::apply_fill(&mut book, symbol, side, filled);
        }

        let ack = OrderAck {
            venue: self.name.clone(),
            symbol: symbol.to_string(),
            side,
            order_id: self.order_seq.fetch_add(1, Ordering::SeqCst).to_string(),
            client_order_id: client_order_id.to_string(),
            status,
            filled_notional_usd: filled,
            avg_price: (filled > Decimal::ZERO).then_some(self.default_price),
        };
        book.orders.insert(client_order_id.to_string(), ack.clone());
        Ok(ack)
    }

    async fn cancel(&self, client_order_id: &str) -> Result<(), VenueError> {
        let mut book = self.book.write().await;
        match book.orders.get_mut(client_order_id) {
            Some(ack) if !ack.status.is_terminal() => {
                ack.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(_) => Ok(()),
            None => Err(VenueError::Rejected(format!(
                "unknown order {client_order_id}"
            ))),
        }
    }

    async fn positions(&self) -> Result<Vec<VenuePosition>, VenueError> {
        let book = self.book.read().await;
        Ok(book
            .net_notional
            .iter()
            .map(|(symbol, net)| VenuePosition {
                venue: self.name.clone(),
                symbol: symbol.clone(),
                side: if net.is_sign_negative() {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                },
                notional_usd: net.abs(),
                entry_price: Some(self.default_price),
            })
            .collect())
    }

    async fn balance(&self) -> Result<Balance, VenueError> {
        let book = self.book.read().await;
        Ok(Balance {
            available_usd: book.available_usd,
            total_usd: book.available_usd,
        })
    }

    async fn order_status(&self, client_order_id: &str) -> Result<Option<OrderAck>, VenueError> {
        Ok(self.book.read().await.orders.get(client_order_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fill_updates_net_position() {
        let venue = MockVenue::new("mock", dec!(1000));
        let ack = venue
            .place_order("BTC/USDT:USDT", OrderSide::Buy, dec!(40), "ord-1")
            .await
            .unwrap();

        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(venue.net_notional("BTC/USDT:USDT").await, dec!(40));
    }

    #[tokio::test]
    async fn test_duplicate_client_order_id_is_deduped() {
        let venue = MockVenue::new("mock", dec!(1000));
        let first = venue
            .place_order("BTC/USDT:USDT", OrderSide::Buy, dec!(40), "ord-1")
            .await
            .unwrap();
        let second = venue
            .place_order("BTC/USDT:USDT", OrderSide::Buy, dec!(40), "ord-1")
            .await
            .unwrap();

        assert_eq!(first.order_id, second.order_id);
        // Position reflects exactly one fill
        assert_eq!(venue.net_notional("BTC/USDT:USDT").await, dec!(40));
    }

    #[tokio::test]
    async fn test_partial_fill_behavior() {
        let venue = MockVenue::new("mock", dec!(1000));
        venue
            .set_behavior("ETH/USDT:USDT", FillBehavior::Partial(dec!(0.5)))
            .await;

        let ack = venue
            .place_order("ETH/USDT:USDT", OrderSide::Sell, dec!(40), "ord-2")
            .await
            .unwrap();

        assert_eq!(ack.status, OrderStatus::PartiallyFilled);
        assert_eq!(ack.filled_notional_usd, dec!(20));
        assert_eq!(venue.net_notional("ETH/USDT:USDT").await, dec!(-20));
    }

    #[tokio::test]
    async fn test_opposite_fill_flattens_position() {
        let venue = MockVenue::new("mock", dec!(1000));
        venue
            .place_order("BTC/USDT:USDT", OrderSide::Buy, dec!(40), "open")
            .await
            .unwrap();
        venue
            .place_order("BTC/USDT:USDT", OrderSide::Sell, dec!(40), "close")
            .await
            .unwrap();

        assert_eq!(venue.net_notional("BTC/USDT:USDT").await, Decimal::ZERO);
        assert!(venue.positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_order_status_unknown_id_is_none() {
        let venue = MockVenue::new("mock", dec!(1000));
        assert!(venue.order_status("missing").await.unwrap().is_none());
    }
}
