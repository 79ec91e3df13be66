//! Market data acquisition.
//!
//! - `feed`: funding-rate aggregator client with caching and retries
//! - `service`: per-cycle symbol quotes across three data compositions
//! - `universe`: dynamic top-K symbol selection

pub mod feed;
pub mod service;
pub mod universe;

pub use feed::{canonical_symbol, base_asset, FeedError, FundingFeedClient, FundingSnapshot};
pub use service::{BookTop, MarketDataService, SymbolQuote, VenueMarketData};
pub use universe::{SymbolScore, UniverseProvider};
