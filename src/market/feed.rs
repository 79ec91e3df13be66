//! Funding-rate aggregator client.
//!
//! Fetches per-venue funding rates from the aggregator's `/funding`
//! endpoint and normalizes them to a common 8-hour basis. Responses are
//! memoized for a short TTL so one cycle never hits the endpoint twice.

use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::config::FeedConfig;

/// Divisor converting the feed's integer rate values to decimal fractions.
/// Example: 25 -> 25 / 10_000 = 0.0025 (0.25%).
const RATE_DIVISOR: Decimal = dec!(10_000);

/// Settlement interval all venue rates are normalized to.
const BASE_INTERVAL_HOURS: u32 = 8;

/// Errors from the aggregator feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Network failure, timeout, or 5xx; retried, then surfaced to skip the cycle
    #[error("transient feed error: {0}")]
    Transient(String),
    /// 4xx or malformed payload; retrying will not help
    #[error("terminal feed error: {0}")]
    Terminal(String),
}

impl FeedError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FeedError::Transient(_))
    }
}

/// One record as returned by `GET /funding`.
#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorRecord {
    pub exchange: String,
    pub symbol: String,
    /// Integer rate, bps x 100 (divide by 10_000 for the fraction)
    pub funding_rate: i64,
    pub interval_hours: u32,
    #[serde(default)]
    pub open_interest_usd: Option<f64>,
}

/// One normalized funding observation per (venue, symbol).
#[derive(Debug, Clone, PartialEq)]
pub struct FundingSnapshot {
    pub venue: String,
    /// Canonical form, e.g. `BTC/USDT:USDT`
    pub symbol: String,
    /// Funding rate per 8h settlement, as a fraction
    pub rate: Decimal,
    pub oi_usd: Option<Decimal>,
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub interval_hours: u32,
    pub timestamp: DateTime<Utc>,
}

impl FundingSnapshot {
    /// Stable `venue:symbol` identifier used in pair keys and order ids.
    pub fn leg_id(&self) -> String {
        format!("{}:{}", self.venue, self.symbol)
    }
}

/// Canonicalize a bare base asset to `BASE/USDT:USDT`.
///
/// Feed symbols arrive either as a bare base (`BTC`) or already carrying
/// a quote suffix; venue-specific suffixes are stripped first.
pub fn canonical_symbol(raw: &str) -> String {
    let base = raw
        .split('/')
        .next()
        .unwrap_or(raw)
        .split(':')
        .next()
        .unwrap_or(raw)
        .split('-')
        .next()
        .unwrap_or(raw)
        .trim()
        .to_uppercase();
    let base = match base.strip_suffix("USDT") {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => &base,
    };
    format!("{base}/USDT:USDT")
}

/// Base asset of a canonical symbol (`BTC/USDT:USDT` -> `BTC`).
pub fn base_asset(canonical: &str) -> &str {
    canonical.split('/').next().unwrap_or(canonical)
}

/// Normalize a raw feed rate to an 8h-equivalent fraction.
///
/// Rates from venues settling more often than 8h are scaled down by
/// `interval / 8` so all venues compare on the same basis.
pub fn normalize_rate(raw: i64, interval_hours: u32) -> Decimal {
    let rate = Decimal::from(raw) / RATE_DIVISOR;
    if interval_hours > 0 && interval_hours < BASE_INTERVAL_HOURS {
        rate * Decimal::from(interval_hours) / Decimal::from(BASE_INTERVAL_HOURS)
    } else {
        rate
    }
}

fn snapshots_from_records(records: Vec<AggregatorRecord>, now: DateTime<Utc>) -> Vec<FundingSnapshot> {
    records
        .into_iter()
        .filter_map(|rec| {
            if rec.exchange.is_empty() || rec.symbol.is_empty() {
                return None;
            }
            let oi_usd = rec
                .open_interest_usd
                .and_then(Decimal::from_f64_retain)
                .filter(|oi| !oi.is_sign_negative());
            Some(FundingSnapshot {
                venue: rec.exchange.to_lowercase(),
                symbol: canonical_symbol(&rec.symbol),
                rate: normalize_rate(rec.funding_rate, rec.interval_hours),
                oi_usd,
                bid: None,
                ask: None,
                interval_hours: rec.interval_hours,
                timestamp: now,
            })
        })
        .collect()
}

struct CachedFeed {
    fetched_at: Instant,
    snapshots: Arc<Vec<FundingSnapshot>>,
}

/// HTTP client for the funding-rate aggregator with a short response cache.
pub struct FundingFeedClient {
    http: Client,
    url: String,
    cache_ttl: Duration,
    max_retries: u32,
    cache: Mutex<Option<CachedFeed>>,
}

impl FundingFeedClient {
    pub fn new(config: &FeedConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        Ok(Self {
            http,
            url: format!("{}/funding", config.base_url.trim_end_matches('/')),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            max_retries: config.max_retries,
            cache: Mutex::new(None),
        })
    }

    /// Fetch all venues and symbols, normalized to 8h rates.
    ///
    /// Serves from cache while fresh. A cache miss with a failing fetch
    /// surfaces the error; stale data is never returned.
    #[instrument(skip(self))]
    pub async fn fetch_all(&self) -> Result<Arc<Vec<FundingSnapshot>>, FeedError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            let age = cached.fetched_at.elapsed();
            if age < self.cache_ttl {
                debug!(age_secs = age.as_secs(), "Funding feed cache hit");
                return Ok(Arc::clone(&cached.snapshots));
            }
        }

        let records = self.request_with_retry().await?;
        let snapshots = Arc::new(snapshots_from_records(records, Utc::now()));
        debug!(count = snapshots.len(), "Funding feed refreshed");

        *cache = Some(CachedFeed {
            fetched_at: Instant::now(),
            snapshots: Arc::clone(&snapshots),
        });
        Ok(snapshots)
    }

    /// Rate for one (venue, symbol); `None` when the feed has no entry.
    pub async fn get_rate(
        &self,
        venue: &str,
        symbol: &str,
    ) -> Result<Option<FundingSnapshot>, FeedError> {
        let canonical = canonical_symbol(symbol);
        let snapshots = self.fetch_all().await?;
        Ok(snapshots
            .iter()
            .find(|s| s.venue == venue && s.symbol == canonical)
            .cloned())
    }

    /// Rates for a symbol set, grouped as symbol -> venue -> snapshot.
    pub async fn get_rates_by_symbols(
        &self,
        symbols: &[String],
    ) -> Result<HashMap<String, HashMap<String, FundingSnapshot>>, FeedError> {
        let wanted: std::collections::HashSet<String> =
            symbols.iter().map(|s| canonical_symbol(s)).collect();
        let snapshots = self.fetch_all().await?;

        let mut out: HashMap<String, HashMap<String, FundingSnapshot>> = HashMap::new();
        for snap in snapshots.iter() {
            if wanted.contains(&snap.symbol) {
                out.entry(snap.symbol.clone())
                    .or_default()
                    .insert(snap.venue.clone(), snap.clone());
            }
        }
        Ok(out)
    }

    /// Drop the cached response so the next call refetches.
    pub async fn invalidate_cache(&self) {
        *self.cache.lock().await = None;
    }

    async fn request_with_retry(&self) -> Result<Vec<AggregatorRecord>, FeedError> {
        let mut last_err = FeedError::Transient("no attempts made".to_string());

        for attempt in 1..=self.max_retries {
            match self.request_once().await {
                Ok(records) => return Ok(records),
                Err(err) => {
                    if !err.is_transient() {
                        return Err(err);
                    }
                    warn!(attempt, max = self.max_retries, error = %err, "Funding feed request failed");
                    last_err = err;
                    if attempt < self.max_retries {
                        // 0.5s, 1s, 2s
                        let backoff = Duration::from_millis(500 * (1 << (attempt - 1)));
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
        Err(last_err)
    }

    async fn request_once(&self) -> Result<Vec<AggregatorRecord>, FeedError> {
        let response = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FeedError::Transient(e.to_string()))?;

        let status = response.status();
        if status.is_client_error() {
            return Err(FeedError::Terminal(format!("feed returned {status}")));
        }
        if !status.is_success() {
            return Err(FeedError::Transient(format!("feed returned {status}")));
        }

        response
            .json::<Vec<AggregatorRecord>>()
            .await
            .map_err(|e| FeedError::Terminal(format!("malformed feed payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_normalization_8h_basis() {
        // 25 on an 8h venue: 25 / 10_000 = 0.0025
        assert_eq!(normalize_rate(25, 8), dec!(0.0025));
        // 1h venue rates scale down by 1/8
        assert_eq!(normalize_rate(25, 1), dec!(0.0025) / dec!(8));
        // Longer-than-8h intervals are left as-is
        assert_eq!(normalize_rate(25, 24), dec!(0.0025));
    }

    #[test]
    fn test_rate_normalization_preserves_sign() {
        assert_eq!(normalize_rate(-40, 8), dec!(-0.004));
        assert_eq!(normalize_rate(-40, 4), dec!(-0.004) / dec!(2));
    }

    #[test]
    fn test_canonical_symbol_forms() {
        assert_eq!(canonical_symbol("BTC"), "BTC/USDT:USDT");
        assert_eq!(canonical_symbol("btc"), "BTC/USDT:USDT");
        assert_eq!(canonical_symbol("BTCUSDT"), "BTC/USDT:USDT");
        assert_eq!(canonical_symbol("BTC/USDT:USDT"), "BTC/USDT:USDT");
        assert_eq!(canonical_symbol("ETH-PERP"), "ETH/USDT:USDT");
    }

    #[test]
    fn test_base_asset_extraction() {
        assert_eq!(base_asset("BTC/USDT:USDT"), "BTC");
        assert_eq!(base_asset("PEPE/USDT:USDT"), "PEPE");
    }

    #[test]
    fn test_snapshots_from_records_filters_and_normalizes() {
        let now = Utc::now();
        let records = vec![
            AggregatorRecord {
                exchange: "Binance".to_string(),
                symbol: "BTC".to_string(),
                funding_rate: 25,
                interval_hours: 8,
                open_interest_usd: Some(1_000_000.0),
            },
            AggregatorRecord {
                exchange: "hyperliquid".to_string(),
                symbol: "BTC".to_string(),
                funding_rate: 8,
                interval_hours: 1,
                open_interest_usd: None,
            },
            AggregatorRecord {
                exchange: String::new(),
                symbol: "BTC".to_string(),
                funding_rate: 1,
                interval_hours: 8,
                open_interest_usd: None,
            },
        ];

        let snaps = snapshots_from_records(records, now);
        assert_eq!(snaps.len(), 2, "record with empty exchange is dropped");

        assert_eq!(snaps[0].venue, "binance");
        assert_eq!(snaps[0].symbol, "BTC/USDT:USDT");
        assert_eq!(snaps[0].rate, dec!(0.0025));
        assert_eq!(snaps[0].oi_usd, Some(dec!(1000000)));

        // Hourly venue normalized onto the 8h basis
        assert_eq!(snaps[1].rate, dec!(0.0008) / dec!(8));
        assert_eq!(snaps[1].oi_usd, None);
    }

    #[test]
    fn test_record_parses_from_feed_json() {
        let json = r#"[{"exchange":"binance","symbol":"BTC","funding_rate":25,"interval_hours":8,"open_interest_usd":1200000.5}]"#;
        let records: Vec<AggregatorRecord> = serde_json::from_str(json).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].funding_rate, 25);
        assert_eq!(records[0].interval_hours, 8);
    }

    #[tokio::test]
    #[ignore] // Requires network access
    async fn test_live_fetch() {
        let client = FundingFeedClient::new(&FeedConfig::default()).unwrap();
        let snaps = client.fetch_all().await.unwrap();
        println!("fetched {} snapshots", snaps.len());
    }
}
