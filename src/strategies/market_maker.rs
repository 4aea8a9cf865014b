//! Inventory-aware market making: one bid and one ask per market, skewed
//! against inventory so fills push the position back toward flat.

use rust_decimal::Decimal;

use crate::book::round_tick;
use crate::strategies::StrategyCtx;
use crate::types::{OrderView, PlaceOrder, QuoteIntent, Side, TimeInForce};

pub const NAME: &str = "market_maker";

pub struct MarketMaker;

impl MarketMaker {
    pub fn evaluate(&self, ctx: &StrategyCtx<'_>) -> Vec<QuoteIntent> {
        let config = ctx.config;
        let tick = ctx.meta.tick_size;
        let mut intents = Vec::new();

        let my_bid = own_order(ctx.open_orders, Side::Buy);
        let my_ask = own_order(ctx.open_orders, Side::Sell);

        // Crossed book, blown-out spread, or stale feed: pull both sides.
        let pull = !ctx.book.is_quotable()
            || ctx.book.spread().map_or(true, |s| s > config.mm_max_spread)
            || ctx.book.feed_lag_p99_ms() > config.reject_feed_lag_ms;
        if pull {
            cancel_all(ctx, my_bid, my_ask, &mut intents);
            return intents;
        }

        let mid = match ctx.book.mid() {
            Some(m) => m,
            None => return intents,
        };
        let spread = ctx.book.spread().unwrap_or(Decimal::ZERO);

        // ── Desired quotes ──
        let half_spread = config.mm_min_half_spread.max(
            spread / Decimal::from(2) + Decimal::from(config.mm_edge_ticks) * tick,
        );
        let net = ctx.position.net_size;
        let skew = if config.max_position_per_market.is_zero() {
            Decimal::ZERO
        } else {
            -config.mm_skew_k * (net / config.max_position_per_market)
        };

        let mut bid = round_tick(mid - half_spread + skew * tick, tick);
        let mut ask = round_tick(mid + half_spread + skew * tick, tick);
        bid = bid.max(tick);
        ask = ask.min(Decimal::ONE - tick);
        if bid >= ask {
            // Grid collapse near the bounds; stand down this cycle.
            cancel_all(ctx, my_bid, my_ask, &mut intents);
            return intents;
        }

        // ── Sizes, reduce-only at the position cap ──
        let buy_room = config.max_position_per_market - net;
        let sell_room = config.max_position_per_market + net;
        let bid_size = quote_size(config.target_size, ctx.meta.min_size, buy_room);
        let ask_size = quote_size(config.target_size, ctx.meta.min_size, sell_room);

        reconcile_side(ctx, my_bid, Side::Buy, bid, bid_size, &mut intents);
        reconcile_side(ctx, my_ask, Side::Sell, ask, ask_size, &mut intents);
        intents
    }
}

fn own_order(orders: &[OrderView], side: Side) -> Option<&OrderView> {
    orders
        .iter()
        .find(|o| o.strategy == NAME && o.side == side)
}

fn cancel_all(
    ctx: &StrategyCtx<'_>,
    bid: Option<&OrderView>,
    ask: Option<&OrderView>,
    intents: &mut Vec<QuoteIntent>,
) {
    for order in [bid, ask].into_iter().flatten() {
        intents.push(QuoteIntent::Cancel {
            market_id: ctx.meta.market_id.clone(),
            order_id: order.order_id,
        });
    }
}

/// clip(TARGET_SIZE, min_size, room): None when the side has no room and
/// must go reduce-only (cancelled).
fn quote_size(target: Decimal, min_size: Decimal, room: Decimal) -> Option<Decimal> {
    if room < min_size {
        return None;
    }
    Some(target.min(room).max(min_size))
}

/// Keep / replace / place / cancel one side against its desired quote.
/// A resting order is kept while its price is within the reprice threshold,
/// and is never replaced before the minimum quote life elapses.
fn reconcile_side(
    ctx: &StrategyCtx<'_>,
    existing: Option<&OrderView>,
    side: Side,
    price: Decimal,
    size: Option<Decimal>,
    intents: &mut Vec<QuoteIntent>,
) {
    let config = ctx.config;
    let tick = ctx.meta.tick_size;

    match (existing, size) {
        (Some(order), None) => {
            intents.push(QuoteIntent::Cancel {
                market_id: ctx.meta.market_id.clone(),
                order_id: order.order_id,
            });
        }
        (None, Some(size)) => {
            intents.push(QuoteIntent::Place(PlaceOrder {
                market_id: ctx.meta.market_id.clone(),
                side,
                price,
                size,
                tif: TimeInForce::Gtc,
                strategy: NAME,
                reduce_only: false,
            }));
        }
        (Some(order), Some(size)) => {
            let drift_ticks = drift_in_ticks(order.price, price, tick);
            let rested_ms = ctx.now_ms - order.rested_since_ms;
            let old_enough = rested_ms >= config.mm_min_quote_life_secs * 1_000;
            if drift_ticks > Decimal::from(config.mm_reprice_threshold) && old_enough {
                intents.push(QuoteIntent::Replace {
                    market_id: ctx.meta.market_id.clone(),
                    order_id: order.order_id,
                    new_price: price,
                    new_size: size,
                });
            }
        }
        (None, None) => {}
    }
}

fn drift_in_ticks(a: Decimal, b: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (a - b).abs() / tick
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_book, make_config, make_meta};
    use crate::types::PositionSnapshot;
    use rust_decimal_macros::dec;

    fn ctx_with<'a>(
        book: &'a crate::book::BookState,
        meta: &'a crate::types::MarketMeta,
        config: &'a crate::config::Config,
        position: PositionSnapshot,
        open_orders: &'a [OrderView],
        now_ms: i64,
    ) -> StrategyCtx<'a> {
        StrategyCtx {
            book,
            position,
            position_opened_ms: 0,
            open_orders,
            meta,
            config,
            fv: None,
            now_ms,
        }
    }

    fn resting(order_id: u64, side: Side, price: Decimal, since_ms: i64) -> OrderView {
        OrderView {
            order_id,
            side,
            price,
            size: dec!(10),
            rested_since_ms: since_ms,
            strategy: NAME,
        }
    }

    /// Scenario: flat inventory on a 0.49/0.51 book, no resting quotes.
    /// Expected: a symmetric bid/ask pair around mid 0.50; half-spread is
    /// 0.5*0.02 + 1 tick = 0.02, so 0.48 bid / 0.52 ask, both GTC at
    /// TARGET_SIZE.
    #[test]
    fn test_fresh_symmetric_pair() {
        let config = make_config();
        let meta = make_meta("m1", "ev1", dec!(0.01));
        let book = make_book(
            dec!(0.01),
            vec![(dec!(0.49), dec!(100))],
            vec![(dec!(0.51), dec!(100))],
        );
        let ctx = ctx_with(&book, &meta, &config, PositionSnapshot::default(), &[], 10_000);
        let intents = MarketMaker.evaluate(&ctx);
        assert_eq!(intents.len(), 2);
        match (&intents[0], &intents[1]) {
            (QuoteIntent::Place(b), QuoteIntent::Place(a)) => {
                assert_eq!((b.side, b.price, b.size), (Side::Buy, dec!(0.48), dec!(10)));
                assert_eq!((a.side, a.price, a.size), (Side::Sell, dec!(0.52), dec!(10)));
                assert_eq!(b.tif, TimeInForce::Gtc);
            }
            other => panic!("expected two placements, got {other:?}"),
        }
    }

    /// Scenario: long inventory (net +50 of a 100 cap, skew_k 0.25).
    /// Expected: both quotes shifted down by skew = -0.125 ticks rounded on
    /// the grid; the bid backs off and the ask leans in to shed inventory.
    #[test]
    fn test_long_inventory_skews_down() {
        let mut config = make_config();
        config.mm_skew_k = dec!(2.5); // exaggerate so one tick shows up on a 0.01 grid
        let meta = make_meta("m1", "ev1", dec!(0.01));
        let book = make_book(
            dec!(0.01),
            vec![(dec!(0.49), dec!(100))],
            vec![(dec!(0.51), dec!(100))],
        );
        let ctx = ctx_with(
            &book, &meta, &config,
            PositionSnapshot { net_size: dec!(50), avg_price: dec!(0.50) },
            &[], 10_000,
        );
        let intents = MarketMaker.evaluate(&ctx);
        // skew = -2.5 * 0.5 = -1.25 ticks → -0.0125; bid 0.4675→0.47, ask 0.5075→0.51
        match (&intents[0], &intents[1]) {
            (QuoteIntent::Place(b), QuoteIntent::Place(a)) => {
                assert_eq!(b.price, dec!(0.47));
                assert_eq!(a.price, dec!(0.51));
            }
            other => panic!("expected two placements, got {other:?}"),
        }
    }

    /// Scenario: net position already at the +100 cap.
    /// Expected: the bid side is cancelled outright (reduce-only), the ask
    /// side still quotes.
    #[test]
    fn test_at_cap_bid_side_goes_reduce_only() {
        let config = make_config();
        let meta = make_meta("m1", "ev1", dec!(0.01));
        let book = make_book(
            dec!(0.01),
            vec![(dec!(0.49), dec!(100))],
            vec![(dec!(0.51), dec!(100))],
        );
        let orders = vec![resting(7, Side::Buy, dec!(0.48), 1_000)];
        let ctx = ctx_with(
            &book, &meta, &config,
            PositionSnapshot { net_size: dec!(100), avg_price: dec!(0.50) },
            &orders, 10_000,
        );
        let intents = MarketMaker.evaluate(&ctx);
        assert!(intents.iter().any(|i| matches!(i, QuoteIntent::Cancel { order_id: 7, .. })));
        assert!(intents.iter().any(|i| matches!(i, QuoteIntent::Place(p) if p.side == Side::Sell)));
    }

    /// Scenario: resting bid one tick off the new desired price, rested 5s.
    /// Expected: kept, because drift (1) does not exceed the 2-tick threshold.
    #[test]
    fn test_small_drift_keeps_order() {
        let config = make_config();
        let meta = make_meta("m1", "ev1", dec!(0.01));
        let book = make_book(
            dec!(0.01),
            vec![(dec!(0.49), dec!(100))],
            vec![(dec!(0.51), dec!(100))],
        );
        let orders = vec![
            resting(1, Side::Buy, dec!(0.47), 5_000),
            resting(2, Side::Sell, dec!(0.52), 5_000),
        ];
        let ctx = ctx_with(&book, &meta, &config, PositionSnapshot::default(), &orders, 10_000);
        let intents = MarketMaker.evaluate(&ctx);
        assert!(intents.is_empty(), "expected both quotes kept: {intents:?}");
    }

    /// Scenario: resting bid four ticks off desired, rested 5s (past the
    /// minimum quote life).
    /// Expected: replaced at the new price.
    #[test]
    fn test_large_drift_replaces_after_min_life() {
        let config = make_config();
        let meta = make_meta("m1", "ev1", dec!(0.01));
        let book = make_book(
            dec!(0.01),
            vec![(dec!(0.49), dec!(100))],
            vec![(dec!(0.51), dec!(100))],
        );
        let orders = vec![resting(1, Side::Buy, dec!(0.44), 5_000)];
        let ctx = ctx_with(&book, &meta, &config, PositionSnapshot::default(), &orders, 10_000);
        let intents = MarketMaker.evaluate(&ctx);
        assert!(
            intents.iter().any(|i| matches!(
                i,
                QuoteIntent::Replace { order_id: 1, new_price, .. } if *new_price == dec!(0.48)
            )),
            "expected a replace: {intents:?}"
        );
    }

    /// Scenario: same four-tick drift but the order rested only 200ms.
    /// Expected: left alone until the minimum quote life elapses.
    #[test]
    fn test_young_order_not_replaced() {
        let config = make_config();
        let meta = make_meta("m1", "ev1", dec!(0.01));
        let book = make_book(
            dec!(0.01),
            vec![(dec!(0.49), dec!(100))],
            vec![(dec!(0.51), dec!(100))],
        );
        let orders = vec![resting(1, Side::Buy, dec!(0.44), 9_800)];
        let ctx = ctx_with(&book, &meta, &config, PositionSnapshot::default(), &orders, 10_000);
        let intents = MarketMaker.evaluate(&ctx);
        assert!(
            !intents.iter().any(|i| matches!(i, QuoteIntent::Replace { .. })),
            "young order must not churn: {intents:?}"
        );
    }

    /// Scenario: spread 0.18 exceeds MM_MAX_SPREAD 0.10 with quotes resting.
    /// Expected: both sides cancelled.
    #[test]
    fn test_wide_spread_pulls_both_sides() {
        let config = make_config();
        let meta = make_meta("m1", "ev1", dec!(0.01));
        let book = make_book(
            dec!(0.01),
            vec![(dec!(0.41), dec!(100))],
            vec![(dec!(0.59), dec!(100))],
        );
        let orders = vec![
            resting(1, Side::Buy, dec!(0.44), 1_000),
            resting(2, Side::Sell, dec!(0.56), 1_000),
        ];
        let ctx = ctx_with(&book, &meta, &config, PositionSnapshot::default(), &orders, 10_000);
        let intents = MarketMaker.evaluate(&ctx);
        let cancels: Vec<u64> = intents
            .iter()
            .filter_map(|i| match i {
                QuoteIntent::Cancel { order_id, .. } => Some(*order_id),
                _ => None,
            })
            .collect();
        assert_eq!(cancels, vec![1, 2]);
    }

    /// Scenario: quoting near the floor, mid 0.015 on a 0.01 grid.
    /// Expected: bid clamped to one tick minimum, never zero or negative.
    #[test]
    fn test_quotes_clamped_to_bounds() {
        let config = make_config();
        let meta = make_meta("m1", "ev1", dec!(0.01));
        let book = make_book(
            dec!(0.01),
            vec![(dec!(0.01), dec!(100))],
            vec![(dec!(0.02), dec!(100))],
        );
        let ctx = ctx_with(&book, &meta, &config, PositionSnapshot::default(), &[], 10_000);
        let intents = MarketMaker.evaluate(&ctx);
        for intent in &intents {
            if let QuoteIntent::Place(p) = intent {
                assert!(p.price >= dec!(0.01), "price below floor: {p:?}");
                assert!(p.price <= dec!(0.99), "price above cap: {p:?}");
            }
        }
    }
}
