//! Risk management: portfolio state, the drawdown state machine, and
//! cap-based admission control.

mod service;
mod state;

pub use service::{DirectiveKind, LegAdjustment, PairAdjustment, RiskDecision, RiskService};
pub use state::{
    next_status, PairLeg, PairStatus, PortfolioState, PositionPair, RiskStatus,
};
