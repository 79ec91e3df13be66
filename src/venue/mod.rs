//! Venue-agnostic execution interface.
//!
//! The engine never talks to venue REST APIs directly; it consumes opaque
//! adapter handles implementing [`VenueAdapter`]. Credentials and wire
//! protocols live in the adapter implementations, which are provided
//! externally.

pub mod mock;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Venue-reported order state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

/// Acknowledgement for a submitted or queried order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub venue: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    /// Filled notional in USD (0 until fills arrive)
    pub filled_notional_usd: Decimal,
    pub avg_price: Option<Decimal>,
}

/// An open position as reported by a venue.
#[derive(Debug, Clone)]
pub struct VenuePosition {
    pub venue: String,
    pub symbol: String,
    pub side: OrderSide,
    pub notional_usd: Decimal,
    pub entry_price: Option<Decimal>,
}

/// Account balance on one venue.
#[derive(Debug, Clone, Copy)]
pub struct Balance {
    pub available_usd: Decimal,
    pub total_usd: Decimal,
}

/// Errors from venue adapters, split along the retry boundary.
#[derive(Debug, Error)]
pub enum VenueError {
    /// Network failure, timeout, or 5xx; safe to retry
    #[error("transient venue error: {0}")]
    Transient(String),
    /// Venue throttled the request; retried with backoff
    #[error("rate limited")]
    RateLimited,
    /// Account cannot cover the required margin; terminal for the intent
    #[error("insufficient margin: required {required} available {available}")]
    InsufficientMargin {
        required: Decimal,
        available: Decimal,
    },
    /// Symbol is not tradable on the venue; terminal
    #[error("symbol not tradable: {0}")]
    SymbolNotTradable(String),
    /// Venue rejected the order for a logical reason; terminal
    #[error("order rejected: {0}")]
    Rejected(String),
    /// No adapter is registered for the venue; terminal
    #[error("unknown venue: {0}")]
    UnknownVenue(String),
}

impl VenueError {
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Transient(_) | VenueError::RateLimited)
    }
}

/// Trading capability one venue exposes to the engine.
///
/// Orders are notional-denominated: the adapter converts USD notional to
/// venue quantity internally.
#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn venue(&self) -> &str;

    /// Submit a market order. The client order id doubles as the
    /// idempotency key: resubmitting an id already known to the venue
    /// must return the original order, not create a new one.
    async fn place_order(
        &self,
        symbol: &str,
        side: OrderSide,
        notional_usd: Decimal,
        client_order_id: &str,
    ) -> Result<OrderAck, VenueError>;

    async fn cancel(&self, client_order_id: &str) -> Result<(), VenueError>;

    async fn positions(&self) -> Result<Vec<VenuePosition>, VenueError>;

    async fn balance(&self) -> Result<Balance, VenueError>;

    /// Look up an order by client id. `None` means the venue has never
    /// seen the id, which makes a resubmission safe.
    async fn order_status(&self, client_order_id: &str) -> Result<Option<OrderAck>, VenueError>;
}

/// Routes venue-keyed calls to the registered adapter handles.
#[derive(Clone, Default)]
pub struct VenueRouter {
    adapters: HashMap<String, Arc<dyn VenueAdapter>>,
}

impl VenueRouter {
    pub fn new(adapters: HashMap<String, Arc<dyn VenueAdapter>>) -> Self {
        Self { adapters }
    }

    pub fn venues(&self) -> impl Iterator<Item = &str> {
        self.adapters.keys().map(String::as_str)
    }

    pub fn adapter(&self, venue: &str) -> Result<&Arc<dyn VenueAdapter>, VenueError> {
        self.adapters
            .get(venue)
            .ok_or_else(|| VenueError::UnknownVenue(venue.to_string()))
    }

    pub async fn place_order(
        &self,
        venue: &str,
        symbol: &str,
        side: OrderSide,
        notional_usd: Decimal,
        client_order_id: &str,
    ) -> Result<OrderAck, VenueError> {
        self.adapter(venue)?
            .place_order(symbol, side, notional_usd, client_order_id)
            .await
    }

    pub async fn cancel(&self, venue: &str, client_order_id: &str) -> Result<(), VenueError> {
        self.adapter(venue)?.cancel(client_order_id).await
    }

    pub async fn positions(&self, venue: &str) -> Result<Vec<VenuePosition>, VenueError> {
        self.adapter(venue)?.positions().await
    }

    pub async fn balance(&self, venue: &str) -> Result<Balance, VenueError> {
        self.adapter(venue)?.balance().await
    }

    pub async fn order_status(
        &self,
        venue: &str,
        client_order_id: &str,
    ) -> Result<Option<OrderAck>, VenueError> {
        self.adapter(venue)?.order_status(client_order_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_error_retry_classification() {
        assert!(VenueError::Transient("timeout".into()).is_transient());
        assert!(VenueError::RateLimited.is_transient());
        assert!(!VenueError::Rejected("bad symbol".into()).is_transient());
        assert!(!VenueError::InsufficientMargin {
            required: Decimal::TEN,
            available: Decimal::ONE,
        }
        .is_transient());
    }

    #[test]
    fn test_router_unknown_venue() {
        let router = VenueRouter::default();
        assert!(matches!(
            router.adapter("binance"),
            Err(VenueError::UnknownVenue(_))
        ));
    }
}
