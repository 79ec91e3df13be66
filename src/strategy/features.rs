//! Pair feature estimation from symbol category profiles.
//!
//! Without a price history service, beta and correlation are estimated
//! from a static category taxonomy: symbols in the same or related
//! categories correlate, and the volatility profile ratio scaled by
//! correlation yields the hedge beta. Unknown symbols default to a beta
//! of 1.0 so sizing stays symmetric.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::market::feed::base_asset;

/// Estimated relationship between two symbols.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PairFeatures {
    /// Return correlation estimate in [0, 1]
    pub correlation: Decimal,
    /// Volatility ratio of long vs short leg, clamped to [0.1, 3.0]
    pub beta: Decimal,
}

impl Default for PairFeatures {
    fn default() -> Self {
        Self {
            correlation: dec!(0.5),
            beta: Decimal::ONE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Category {
    Btc,
    Eth,
    Sol,
    Layer1,
    Layer2,
    MajorAlt,
    NewL1,
    Defi,
    Meme,
    Ai,
    Stable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Volatility {
    VeryLow,
    Low,
    Medium,
    High,
}

fn category(symbol: &str) -> Option<Category> {
    match base_asset(symbol) {
        "BTC" | "WBTC" => Some(Category::Btc),
        "ETH" | "WETH" | "STETH" | "RETH" => Some(Category::Eth),
        "SOL" | "MSOL" | "JSOL" => Some(Category::Sol),
        "AVAX" | "FTM" | "ATOM" | "NEAR" | "DOT" | "ADA" => Some(Category::Layer1),
        "ARB" | "OP" | "MATIC" | "METIS" => Some(Category::Layer2),
        "XRP" | "LTC" | "BCH" | "LINK" | "UNI" => Some(Category::MajorAlt),
        "SUI" | "APT" | "SEI" | "TIA" => Some(Category::NewL1),
        "AAVE" | "MKR" | "CRV" | "SNX" | "COMP" => Some(Category::Defi),
        "DOGE" | "SHIB" | "PEPE" | "WIF" | "BONK" | "FLOKI" => Some(Category::Meme),
        "FET" | "RNDR" | "TAO" => Some(Category::Ai),
        "USDT" | "USDC" | "DAI" | "BUSD" | "TUSD" => Some(Category::Stable),
        _ => None,
    }
}

fn related(a: Category, b: Category) -> bool {
    use Category::*;
    matches!(
        (a, b),
        (Btc, Layer1 | MajorAlt)
            | (Layer1 | MajorAlt, Btc)
            | (Eth, Layer2 | Defi)
            | (Layer2 | Defi, Eth)
            | (Sol, NewL1)
            | (NewL1, Sol)
            | (Layer1, Layer2 | NewL1)
            | (Layer2 | NewL1, Layer1)
            | (MajorAlt, Layer1)
            | (Layer1, MajorAlt)
    )
}

fn volatility(cat: Category) -> Volatility {
    use Category::*;
    match cat {
        Stable => Volatility::VeryLow,
        Btc | Eth => Volatility::Low,
        Sol | Layer1 | Layer2 | MajorAlt | Defi => Volatility::Medium,
        NewL1 | Meme | Ai => Volatility::High,
    }
}

fn vol_ratio(vol: Volatility) -> Decimal {
    match vol {
        Volatility::VeryLow => dec!(0.2),
        Volatility::Low => dec!(0.5),
        Volatility::Medium => dec!(1.0),
        Volatility::High => dec!(2.0),
    }
}

/// Estimate features for a (short, long) symbol pair.
pub fn estimate_features(short_symbol: &str, long_symbol: &str) -> PairFeatures {
    let (Some(cat_short), Some(cat_long)) = (category(short_symbol), category(long_symbol)) else {
        // Either symbol is outside the taxonomy: fall back to symmetric sizing
        return PairFeatures::default();
    };

    let correlation = if cat_short == cat_long {
        dec!(0.85)
    } else if cat_short == Category::Stable || cat_long == Category::Stable {
        dec!(0.05)
    } else if related(cat_short, cat_long) {
        dec!(0.60)
    } else {
        dec!(0.35)
    };

    let sigma_short = vol_ratio(volatility(cat_short));
    let sigma_long = vol_ratio(volatility(cat_long));
    let beta = (sigma_long / sigma_short * correlation).clamp(dec!(0.1), dec!(3.0));

    PairFeatures { correlation, beta }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_symbol_defaults_to_unit_beta() {
        let features = estimate_features("OBSCURE/USDT:USDT", "BTC/USDT:USDT");
        assert_eq!(features.beta, Decimal::ONE);
    }

    #[test]
    fn test_same_category_high_correlation() {
        let features = estimate_features("AVAX/USDT:USDT", "DOT/USDT:USDT");
        assert_eq!(features.correlation, dec!(0.85));
        assert_eq!(features.beta, dec!(0.85));
    }

    #[test]
    fn test_related_categories_medium_correlation() {
        let features = estimate_features("ETH/USDT:USDT", "ARB/USDT:USDT");
        assert_eq!(features.correlation, dec!(0.60));
        // sigma_long / sigma_short = 1.0 / 0.5 = 2.0; beta = 2.0 * 0.6
        assert_eq!(features.beta, dec!(1.2));
    }

    #[test]
    fn test_stable_pair_low_correlation() {
        let features = estimate_features("BTC/USDT:USDT", "USDC/USDT:USDT");
        assert_eq!(features.correlation, dec!(0.05));
        // Clamped at the lower bound
        assert_eq!(features.beta, dec!(0.1));
    }

    #[test]
    fn test_beta_clamped_upper() {
        // High-vol long vs very-low-vol short would exceed 3.0 unclamped
        let features = estimate_features("USDT/USDT:USDT", "PEPE/USDT:USDT");
        assert!(features.beta <= dec!(3.0));
    }
}
