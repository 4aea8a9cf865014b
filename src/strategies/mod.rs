pub mod fair_value;
pub mod market_maker;

use rust_decimal::Decimal;

use crate::book::BookState;
use crate::config::Config;
use crate::types::{MarketMeta, OrderView, PositionSnapshot, QuoteIntent};

pub use fair_value::{FairValue, FvProvider};
pub use market_maker::MarketMaker;

/// Everything a strategy may look at for one market on one evaluation.
/// Strategies are pure: same inputs, same intents. The portfolio is visible
/// only as a cheap snapshot, never as the owning state.
pub struct StrategyCtx<'a> {
    pub book: &'a BookState,
    pub position: PositionSnapshot,
    /// When the current lot opened (0 when flat); drives the FV time-stop.
    pub position_opened_ms: i64,
    pub open_orders: &'a [OrderView],
    pub meta: &'a MarketMeta,
    pub config: &'a Config,
    /// Latest external fair value and its timestamp, if a provider is wired.
    pub fv: Option<(Decimal, i64)>,
    pub now_ms: i64,
}

/// Closed set of strategies. A uniform `evaluate` keeps live and backtest
/// paths on identical code.
pub enum Strategy {
    FairValue(FairValue),
    MarketMaker(MarketMaker),
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::FairValue(_) => fair_value::NAME,
            Strategy::MarketMaker(_) => market_maker::NAME,
        }
    }

    pub fn evaluate(&self, ctx: &StrategyCtx<'_>) -> Vec<QuoteIntent> {
        match self {
            Strategy::FairValue(s) => s.evaluate(ctx),
            Strategy::MarketMaker(s) => s.evaluate(ctx),
        }
    }
}

/// Build the enabled strategy set from config toggles.
pub fn enabled_strategies(config: &Config) -> Vec<Strategy> {
    let mut out = Vec::with_capacity(2);
    if config.strategy_fair_value {
        out.push(Strategy::FairValue(FairValue));
    }
    if config.strategy_market_maker {
        out.push(Strategy::MarketMaker(MarketMaker));
    }
    out
}

/// Evaluate every enabled strategy, appending into a shared buffer.
pub fn evaluate_all(strategies: &[Strategy], ctx: &StrategyCtx<'_>, buf: &mut Vec<QuoteIntent>) {
    buf.clear();
    for s in strategies {
        buf.extend(s.evaluate(ctx));
    }
}
