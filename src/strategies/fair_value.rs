//! Cross-venue fair value. An external provider supplies a belief about the
//! true resolution probability; when the market's mid strays far enough and
//! the touch is deep enough to absorb us, take the edge with a marketable
//! limit. Exit on edge collapse or time-stop.

use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::strategies::StrategyCtx;
use crate::types::{PlaceOrder, QuoteIntent, Side, TimeInForce};

pub const NAME: &str = "fair_value";

/// External fair-value source, expressed as a closed capability set. The
/// real feed implementation lives outside this crate; `Stub` serves a fixed
/// value (or nothing), `Mock` serves per-market samples for tests.
pub enum FvProvider {
    Stub { value: Option<Decimal> },
    Mock { samples: HashMap<String, (Decimal, i64)> },
}

impl FvProvider {
    pub fn latest(&self, market_id: &str, now_ms: i64) -> Option<(Decimal, i64)> {
        match self {
            // A stub value is always fresh: it represents "no moving feed".
            FvProvider::Stub { value } => value.map(|fv| (fv, now_ms)),
            FvProvider::Mock { samples } => samples.get(market_id).copied(),
        }
    }
}

pub struct FairValue;

impl FairValue {
    pub fn evaluate(&self, ctx: &StrategyCtx<'_>) -> Vec<QuoteIntent> {
        let config = ctx.config;
        let mut intents = Vec::new();

        if !ctx.book.is_quotable() {
            return intents;
        }
        let mid = match ctx.book.mid() {
            Some(m) => m,
            None => return intents,
        };

        // ── Exit management runs regardless of FV freshness ──
        let net = ctx.position.net_size;
        if !net.is_zero() {
            let held_ms = ctx.now_ms - ctx.position_opened_ms;
            let time_stopped =
                ctx.position_opened_ms > 0 && held_ms >= config.fv_time_stop_secs * 1_000;
            let edge_gone = match ctx.fv {
                Some((fv, _)) => (fv - mid).abs() < config.fv_exit_edge,
                None => false,
            };
            if time_stopped || edge_gone {
                if let Some(intent) = exit_at_touch(ctx, net) {
                    intents.push(intent);
                }
                return intents;
            }
        }

        // ── Entry ──
        let (fv, fv_ts) = match ctx.fv {
            Some(pair) => pair,
            None => return intents,
        };
        if ctx.now_ms - fv_ts > config.fv_max_staleness_ms {
            // Stale belief: never trade on it.
            return intents;
        }

        let edge = fv - mid;
        if edge.abs() <= config.fv_entry_edge {
            return intents;
        }

        let required_depth = config.target_size * config.fv_depth_mult;
        let (side, touch, depth) = if edge > Decimal::ZERO {
            (Side::Buy, ctx.book.best_ask(), ctx.book.best_ask_size())
        } else {
            (Side::Sell, ctx.book.best_bid(), ctx.book.best_bid_size())
        };
        let touch = match touch {
            Some(p) => p,
            None => return intents,
        };
        if depth < required_depth {
            return intents;
        }

        // Already holding the target on this side: nothing to add.
        let signed_target = side.sign() * config.target_size;
        if (net.is_sign_positive() == signed_target.is_sign_positive()) && net.abs() >= config.target_size {
            return intents;
        }

        intents.push(QuoteIntent::Place(PlaceOrder {
            market_id: ctx.meta.market_id.clone(),
            side,
            price: touch,
            size: config.target_size,
            tif: TimeInForce::Ioc,
            strategy: NAME,
            reduce_only: false,
        }));
        intents
    }
}

/// Flatten toward zero with an immediate-or-cancel at the current touch.
fn exit_at_touch(ctx: &StrategyCtx<'_>, net: Decimal) -> Option<QuoteIntent> {
    let (side, touch) = if net > Decimal::ZERO {
        (Side::Sell, ctx.book.best_bid()?)
    } else {
        (Side::Buy, ctx.book.best_ask()?)
    };
    Some(QuoteIntent::Place(PlaceOrder {
        market_id: ctx.meta.market_id.clone(),
        side,
        price: touch,
        size: net.abs(),
        tif: TimeInForce::Ioc,
        strategy: NAME,
        reduce_only: true,
    }))
}
