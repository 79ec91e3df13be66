//! Per-cycle market snapshots merging funding, open interest, and quotes.
//!
//! Three compositions are available, selected by configuration:
//! aggregator-only (funding rates alone), hybrid (aggregator funding plus
//! venue-adapter OI and top-of-book), and venue-only. Ancillary data is
//! best-effort: a failing adapter degrades that symbol to defaults rather
//! than failing the cycle.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, instrument, warn};

use crate::config::MarketDataConfig;
use crate::market::feed::{FundingFeedClient, FundingSnapshot};

/// Cross-venue aggregation for one symbol in one cycle.
#[derive(Debug, Clone)]
pub struct SymbolQuote {
    pub symbol: String,
    /// venue -> funding observation
    pub venues: HashMap<String, FundingSnapshot>,
    /// max(rate) - min(rate) across venues
    pub max_spread: Decimal,
    /// Number of venues quoting this symbol
    pub coverage: usize,
}

impl SymbolQuote {
    pub fn from_snapshots(symbol: String, snapshots: Vec<FundingSnapshot>) -> Self {
        let max = snapshots.iter().map(|s| s.rate).max().unwrap_or_default();
        let min = snapshots.iter().map(|s| s.rate).min().unwrap_or_default();
        let venues: HashMap<String, FundingSnapshot> = snapshots
            .into_iter()
            .map(|s| (s.venue.clone(), s))
            .collect();
        let coverage = venues.len();
        Self {
            symbol,
            venues,
            max_spread: max - min,
            coverage,
        }
    }
}

/// Top-of-book quote from a venue adapter.
#[derive(Debug, Clone, Copy)]
pub struct BookTop {
    pub bid: Decimal,
    pub ask: Decimal,
}

/// Per-venue market-data capability consumed by the hybrid and
/// venue-only compositions. Implementations are provided externally.
#[async_trait]
pub trait VenueMarketData: Send + Sync {
    fn venue(&self) -> &str;

    /// Symbols the venue quotes, in canonical form.
    async fn supported_symbols(&self) -> anyhow::Result<Vec<String>>;

    /// 8h-normalized funding observation for one symbol.
    async fn fetch_funding(&self, symbol: &str) -> anyhow::Result<FundingSnapshot>;

    /// Open interest in USD.
    async fn fetch_open_interest(&self, symbol: &str) -> anyhow::Result<Decimal>;

    /// Best bid/ask.
    async fn fetch_book_top(&self, symbol: &str) -> anyhow::Result<BookTop>;
}

/// Market-data service over the configured composition.
pub enum MarketDataService {
    AggregatorOnly {
        feed: Arc<FundingFeedClient>,
        default_oi_usd: Decimal,
    },
    Hybrid {
        feed: Arc<FundingFeedClient>,
        adapters: HashMap<String, Arc<dyn VenueMarketData>>,
        default_oi_usd: Decimal,
    },
    VenueOnly {
        adapters: HashMap<String, Arc<dyn VenueMarketData>>,
        default_oi_usd: Decimal,
    },
}

impl MarketDataService {
    pub fn aggregator_only(feed: Arc<FundingFeedClient>, config: &MarketDataConfig) -> Self {
        Self::AggregatorOnly {
            feed,
            default_oi_usd: config.default_oi_usd,
        }
    }

    pub fn hybrid(
        feed: Arc<FundingFeedClient>,
        adapters: HashMap<String, Arc<dyn VenueMarketData>>,
        config: &MarketDataConfig,
    ) -> Self {
        Self::Hybrid {
            feed,
            adapters,
            default_oi_usd: config.default_oi_usd,
        }
    }

    pub fn venue_only(
        adapters: HashMap<String, Arc<dyn VenueMarketData>>,
        config: &MarketDataConfig,
    ) -> Self {
        Self::VenueOnly {
            adapters,
            default_oi_usd: config.default_oi_usd,
        }
    }

    /// Build per-symbol quotes for the requested symbols.
    #[instrument(skip(self, symbols), fields(requested = symbols.len()))]
    pub async fn snapshot(
        &self,
        symbols: &[String],
    ) -> anyhow::Result<HashMap<String, SymbolQuote>> {
        match self {
            Self::AggregatorOnly {
                feed,
                default_oi_usd,
            } => {
                let by_symbol = feed.get_rates_by_symbols(symbols).await?;
                Ok(Self::quotes_with_default_oi(by_symbol, *default_oi_usd))
            }
            Self::Hybrid {
                feed,
                adapters,
                default_oi_usd,
            } => {
                let by_symbol = feed.get_rates_by_symbols(symbols).await?;
                let mut quotes = Self::quotes_with_default_oi(by_symbol, *default_oi_usd);
                Self::enrich_from_adapters(&mut quotes, adapters, *default_oi_usd).await;
                Ok(quotes)
            }
            Self::VenueOnly {
                adapters,
                default_oi_usd,
            } => Ok(Self::snapshot_from_venues(adapters, symbols, *default_oi_usd).await),
        }
    }

    /// Canonical symbols this composition can quote.
    pub async fn supported_symbols(&self) -> anyhow::Result<BTreeSet<String>> {
        match self {
            Self::AggregatorOnly { feed, .. } | Self::Hybrid { feed, .. } => {
                let snapshots = feed.fetch_all().await?;
                Ok(snapshots.iter().map(|s| s.symbol.clone()).collect())
            }
            Self::VenueOnly { adapters, .. } => {
                let mut out = BTreeSet::new();
                for adapter in adapters.values() {
                    match adapter.supported_symbols().await {
                        Ok(symbols) => out.extend(symbols),
                        Err(e) => {
                            warn!(venue = adapter.venue(), error = %e, "Symbol listing failed")
                        }
                    }
                }
                Ok(out)
            }
        }
    }

    fn quotes_with_default_oi(
        by_symbol: HashMap<String, HashMap<String, FundingSnapshot>>,
        default_oi_usd: Decimal,
    ) -> HashMap<String, SymbolQuote> {
        by_symbol
            .into_iter()
            .map(|(symbol, venues)| {
                let snapshots = venues
                    .into_values()
                    .map(|mut s| {
                        if s.oi_usd.is_none() {
                            s.oi_usd = Some(default_oi_usd);
                        }
                        s
                    })
                    .collect();
                (symbol.clone(), SymbolQuote::from_snapshots(symbol, snapshots))
            })
            .collect()
    }

    /// Overlay venue OI and top-of-book on aggregator funding. Failures
    /// leave the defaults in place; the cycle continues regardless.
    async fn enrich_from_adapters(
        quotes: &mut HashMap<String, SymbolQuote>,
        adapters: &HashMap<String, Arc<dyn VenueMarketData>>,
        default_oi_usd: Decimal,
    ) {
        let mut tasks: JoinSet<(String, String, Option<Decimal>, Option<BookTop>)> =
            JoinSet::new();

        for quote in quotes.values() {
            for venue in quote.venues.keys() {
                let Some(adapter) = adapters.get(venue) else {
                    continue;
                };
                let adapter = Arc::clone(adapter);
                let venue = venue.clone();
                let symbol = quote.symbol.clone();
                tasks.spawn(async move {
                    let oi = match adapter.fetch_open_interest(&symbol).await {
                        Ok(oi) => Some(oi),
                        Err(e) => {
                            warn!(%venue, %symbol, error = %e, "OI fetch failed, using default");
                            None
                        }
                    };
                    let book = match adapter.fetch_book_top(&symbol).await {
                        Ok(top) => Some(top),
                        Err(e) => {
                            warn!(%venue, %symbol, error = %e, "Book fetch failed, continuing without quotes");
                            None
                        }
                    };
                    (venue, symbol, oi, book)
                });
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((venue, symbol, oi, book)) = joined else {
                continue;
            };
            if let Some(snap) = quotes
                .get_mut(&symbol)
                .and_then(|q| q.venues.get_mut(&venue))
            {
                snap.oi_usd = Some(oi.unwrap_or(default_oi_usd));
                if let Some(top) = book {
                    snap.bid = Some(top.bid);
                    snap.ask = Some(top.ask);
                }
            }
        }
    }

    async fn snapshot_from_venues(
        adapters: &HashMap<String, Arc<dyn VenueMarketData>>,
        symbols: &[String],
        default_oi_usd: Decimal,
    ) -> HashMap<String, SymbolQuote> {
        let mut tasks: JoinSet<Vec<FundingSnapshot>> = JoinSet::new();

        for adapter in adapters.values() {
            let adapter = Arc::clone(adapter);
            let symbols = symbols.to_vec();
            tasks.spawn(async move {
                let mut out = Vec::new();
                for symbol in &symbols {
                    let mut snap = match adapter.fetch_funding(symbol).await {
                        Ok(snap) => snap,
                        Err(e) => {
                            // Data-quality gap: drop the symbol on this venue
                            debug!(venue = adapter.venue(), %symbol, error = %e, "Funding fetch failed");
                            continue;
                        }
                    };
                    snap.oi_usd = match adapter.fetch_open_interest(symbol).await {
                        Ok(oi) => Some(oi),
                        Err(_) => Some(default_oi_usd),
                    };
                    if let Ok(top) = adapter.fetch_book_top(symbol).await {
                        snap.bid = Some(top.bid);
                        snap.ask = Some(top.ask);
                    }
                    out.push(snap);
                }
                out
            });
        }

        let mut by_symbol: HashMap<String, Vec<FundingSnapshot>> = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            let Ok(snapshots) = joined else { continue };
            for snap in snapshots {
                by_symbol.entry(snap.symbol.clone()).or_default().push(snap);
            }
        }

        by_symbol
            .into_iter()
            .map(|(symbol, snaps)| (symbol.clone(), SymbolQuote::from_snapshots(symbol, snaps)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn snap(venue: &str, symbol: &str, rate: Decimal) -> FundingSnapshot {
        FundingSnapshot {
            venue: venue.to_string(),
            symbol: symbol.to_string(),
            rate,
            oi_usd: None,
            bid: None,
            ask: None,
            interval_hours: 8,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_symbol_quote_spread_and_coverage() {
        let quote = SymbolQuote::from_snapshots(
            "BTC/USDT:USDT".to_string(),
            vec![
                snap("binance", "BTC/USDT:USDT", dec!(0.0030)),
                snap("bybit", "BTC/USDT:USDT", dec!(-0.0010)),
                snap("okx", "BTC/USDT:USDT", dec!(0.0005)),
            ],
        );

        assert_eq!(quote.coverage, 3);
        assert_eq!(quote.max_spread, dec!(0.0040));
    }

    #[test]
    fn test_symbol_quote_single_venue_has_zero_spread() {
        let quote = SymbolQuote::from_snapshots(
            "ETH/USDT:USDT".to_string(),
            vec![snap("binance", "ETH/USDT:USDT", dec!(0.001))],
        );
        assert_eq!(quote.coverage, 1);
        assert_eq!(quote.max_spread, Decimal::ZERO);
    }

    struct FlakyAdapter {
        venue: String,
        fail: bool,
    }

    #[async_trait]
    impl VenueMarketData for FlakyAdapter {
        fn venue(&self) -> &str {
            &self.venue
        }

        async fn supported_symbols(&self) -> anyhow::Result<Vec<String>> {
            Ok(Vec::new())
        }

        async fn fetch_funding(&self, _symbol: &str) -> anyhow::Result<FundingSnapshot> {
            anyhow::bail!("not used")
        }

        async fn fetch_open_interest(&self, _symbol: &str) -> anyhow::Result<Decimal> {
            if self.fail {
                anyhow::bail!("adapter down")
            }
            Ok(dec!(9_000_000))
        }

        async fn fetch_book_top(&self, _symbol: &str) -> anyhow::Result<BookTop> {
            if self.fail {
                anyhow::bail!("adapter down")
            }
            Ok(BookTop {
                bid: dec!(99),
                ask: dec!(101),
            })
        }
    }

    #[tokio::test]
    async fn test_hybrid_enrichment_degrades_on_adapter_failure() {
        let mut quotes = HashMap::new();
        quotes.insert(
            "BTC/USDT:USDT".to_string(),
            SymbolQuote::from_snapshots(
                "BTC/USDT:USDT".to_string(),
                vec![
                    snap("binance", "BTC/USDT:USDT", dec!(0.003)),
                    snap("bybit", "BTC/USDT:USDT", dec!(-0.001)),
                ],
            ),
        );

        let mut adapters: HashMap<String, Arc<dyn VenueMarketData>> = HashMap::new();
        adapters.insert(
            "binance".to_string(),
            Arc::new(FlakyAdapter {
                venue: "binance".to_string(),
                fail: false,
            }),
        );
        adapters.insert(
            "bybit".to_string(),
            Arc::new(FlakyAdapter {
                venue: "bybit".to_string(),
                fail: true,
            }),
        );

        MarketDataService::enrich_from_adapters(&mut quotes, &adapters, dec!(5_000_000)).await;

        let quote = &quotes["BTC/USDT:USDT"];
        // Healthy adapter supplies real OI and quotes
        let healthy = &quote.venues["binance"];
        assert_eq!(healthy.oi_usd, Some(dec!(9_000_000)));
        assert_eq!(healthy.bid, Some(dec!(99)));
        // Failing adapter degrades to the default OI with no book
        let degraded = &quote.venues["bybit"];
        assert_eq!(degraded.oi_usd, Some(dec!(5_000_000)));
        assert_eq!(degraded.bid, None);
    }

    #[test]
    fn test_default_oi_applied_when_missing() {
        let mut by_symbol = HashMap::new();
        let mut venues = HashMap::new();
        venues.insert(
            "binance".to_string(),
            snap("binance", "BTC/USDT:USDT", dec!(0.001)),
        );
        by_symbol.insert("BTC/USDT:USDT".to_string(), venues);

        let quotes = MarketDataService::quotes_with_default_oi(by_symbol, dec!(5_000_000));
        let quote = &quotes["BTC/USDT:USDT"];
        assert_eq!(
            quote.venues["binance"].oi_usd,
            Some(dec!(5_000_000)),
            "missing OI degrades to the configured default"
        );
    }
}
