//! Stateless risk gate. Every placement passes through `check_placement`
//! before it reaches the paper broker; the first failing rule wins and is
//! surfaced as a tagged reason. Cancels are never gated.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::book::BookState;
use crate::config::Config;
use crate::portfolio::Portfolio;
use crate::types::{MarketMeta, PlaceOrder, Side};

/// Rejection tags, in rule order. Logged as `{intent, rule, context}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RiskReason {
    KillSwitch,
    DailyLoss,
    FeedLag,
    SpreadBreaker,
    PerMarketPosition,
    EventExposure,
    MaxOpenPositions,
}

impl RiskReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskReason::KillSwitch => "kill_switch",
            RiskReason::DailyLoss => "daily_loss",
            RiskReason::FeedLag => "feed_lag",
            RiskReason::SpreadBreaker => "spread_breaker",
            RiskReason::PerMarketPosition => "per_market_position",
            RiskReason::EventExposure => "event_exposure",
            RiskReason::MaxOpenPositions => "max_open_positions",
        }
    }
}

/// Everything a single placement check needs, borrowed from the scheduler.
/// `unrealized_now` is computed once per event by the caller so the gate
/// itself stays allocation-free.
pub struct RiskInputs<'a> {
    pub config: &'a Config,
    pub portfolio: &'a Portfolio,
    pub book: &'a BookState,
    pub meta: &'a MarketMeta,
    pub metas: &'a HashMap<String, MarketMeta>,
    pub kill_switch: bool,
    pub unrealized_now: Decimal,
}

/// Gate one placement. Rules run in documented order; first failure wins.
pub fn check_placement(place: &PlaceOrder, inputs: &RiskInputs<'_>) -> Result<(), RiskReason> {
    let old_net = inputs.portfolio.net_size(&place.market_id);
    let new_net = old_net + place.side.sign() * place.size;
    let strictly_reduces = new_net.abs() < old_net.abs();

    // 1. Kill switch: nothing gets placed, reduce-only included.
    if inputs.kill_switch {
        return Err(RiskReason::KillSwitch);
    }

    // 2. Daily loss limit. Flatten intents (reduce-only, strictly reducing)
    //    must still pass or the book could never be unwound.
    let day_pnl = inputs.portfolio.realized_today() + inputs.unrealized_now;
    if day_pnl <= -inputs.config.daily_loss_limit && !(place.reduce_only && strictly_reduces) {
        return Err(RiskReason::DailyLoss);
    }

    // 3. Feed lag.
    if inputs.book.feed_lag_p99_ms() > inputs.config.reject_feed_lag_ms {
        return Err(RiskReason::FeedLag);
    }

    // 4. Spread circuit breaker.
    if inputs.book.is_crossed() {
        return Err(RiskReason::SpreadBreaker);
    }
    if let Some(bps) = inputs.book.spread_bps() {
        if bps > inputs.config.max_spread_bps {
            return Err(RiskReason::SpreadBreaker);
        }
    }

    // 5. Per-market position cap, unless the order strictly reduces |net|.
    if new_net.abs() > inputs.config.max_position_per_market && !strictly_reduces {
        return Err(RiskReason::PerMarketPosition);
    }

    // 6. Per-event exposure: prospective notional across sibling markets.
    let mark_of = |id: &str| {
        if id == place.market_id {
            inputs.book.mid().or(Some(place.price))
        } else {
            // Sibling marks come from their stored avg entry; the scheduler
            // snapshots true mids separately for PnL.
            inputs.portfolio.position(id).map(|p| p.avg_price)
        }
    };
    let event_id = &inputs.meta.event_id;
    let current = inputs
        .portfolio
        .event_exposure(event_id, inputs.metas, mark_of);
    let this_mark = inputs.book.mid().unwrap_or(place.price);
    let exposure_others = current - (old_net * this_mark).abs();
    let prospective = exposure_others + (new_net * this_mark).abs();
    if prospective > inputs.config.max_event_exposure_usd {
        return Err(RiskReason::EventExposure);
    }

    // 7. Max open positions: only intents opening a fresh market count.
    if old_net.is_zero()
        && !new_net.is_zero()
        && inputs.portfolio.open_markets() >= inputs.config.max_open_positions
    {
        return Err(RiskReason::MaxOpenPositions);
    }

    Ok(())
}

/// Convenience used by scheduler flatten injection: the order that reduces
/// a position toward flat at the current touch.
pub fn flatten_side(net_size: Decimal) -> Option<Side> {
    if net_size > Decimal::ZERO {
        Some(Side::Sell)
    } else if net_size < Decimal::ZERO {
        Some(Side::Buy)
    } else {
        None
    }
}
