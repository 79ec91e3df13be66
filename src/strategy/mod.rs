//! Signal generation: pair candidates, scoring, persistence gating,
//! sizing, and the category-based feature estimator.

pub mod features;
pub mod signals;

pub use features::{estimate_features, PairFeatures};
pub use signals::{
    idempotency_key, CandidateLeg, PairCandidate, PersistenceCounters, SignalService, TradeIntent,
    TradeLeg,
};
