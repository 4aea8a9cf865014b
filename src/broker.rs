//! Paper broker: simulated open orders matched against the live tape.
//!
//! Two fill models. Maker-touch fills a resting limit when the opposing
//! best touch reaches it; trade-through only fills when an actual trade
//! print crosses the limit. Both share the marketable-at-placement rule,
//! slippage/fee frictions, and a minimum rest time before passive fills.

use std::collections::{BTreeMap, HashMap};

use rust_decimal::Decimal;
use tracing::info;

use crate::book::{price_on_grid, BookState};
use crate::config::{Config, ExecutionMode, FillModel};
use crate::types::{
    Fill, Order, OrderStatus, OrderView, PlaceOrder, Side, TimeInForce, TradePrint,
};

/// Outcome of a placement: the order's final state plus any instant fills.
pub struct PlaceOutcome {
    pub order: Order,
    pub fills: Vec<Fill>,
}

/// Outcome of a match step: fills plus the updated order rows to persist.
#[derive(Default)]
pub struct MatchOutcome {
    pub fills: Vec<Fill>,
    pub orders: Vec<Order>,
}

pub struct PaperBroker {
    execution_mode: ExecutionMode,
    fill_model: FillModel,
    slippage_bps: Decimal,
    fees_bps: Decimal,
    min_rest_ms: i64,
    participation: Decimal,
    /// market_id → order_id → order. BTreeMap keeps match order
    /// deterministic for backtest replay.
    open: HashMap<String, BTreeMap<u64, Order>>,
    next_order_id: u64,
    next_fill_id: u64,
    pub orders_placed: u64,
    pub orders_cancelled: u64,
    pub fills_emitted: u64,
}

impl PaperBroker {
    pub fn new(config: &Config) -> Self {
        Self {
            execution_mode: config.execution_mode,
            fill_model: config.fill_model,
            slippage_bps: config.slippage_bps,
            fees_bps: config.fees_bps,
            min_rest_ms: config.paper_min_rest_secs * 1_000,
            participation: config.paper_participation,
            open: HashMap::new(),
            next_order_id: 1,
            next_fill_id: 1,
            orders_placed: 0,
            orders_cancelled: 0,
            fills_emitted: 0,
        }
    }

    /// Restore persisted open orders (PAPER_RESET_ON_START=false). Id
    /// counters resume past the restored rows.
    pub fn restore(&mut self, orders: Vec<Order>) {
        for order in orders {
            if !order.is_open() {
                continue;
            }
            self.next_order_id = self.next_order_id.max(order.order_id + 1);
            self.open
                .entry(order.market_id.clone())
                .or_default()
                .insert(order.order_id, order);
        }
    }

    pub fn set_next_fill_id(&mut self, next: u64) {
        self.next_fill_id = self.next_fill_id.max(next);
    }

    // ─── Reads ───

    pub fn open_orders(&self, market_id: &str) -> Vec<OrderView> {
        self.open
            .get(market_id)
            .map(|orders| {
                orders
                    .values()
                    .map(|o| OrderView {
                        order_id: o.order_id,
                        side: o.side,
                        price: o.price,
                        size: o.size,
                        rested_since_ms: o.rested_since_ms,
                        strategy: o.strategy,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn open_order_count(&self) -> usize {
        self.open.values().map(|m| m.len()).sum()
    }

    pub fn order_side(&self, market_id: &str, order_id: u64) -> Option<Side> {
        self.open
            .get(market_id)
            .and_then(|m| m.get(&order_id))
            .map(|o| o.side)
    }

    pub fn order_view(&self, market_id: &str, order_id: u64) -> Option<OrderView> {
        self.open
            .get(market_id)
            .and_then(|m| m.get(&order_id))
            .map(|o| OrderView {
                order_id: o.order_id,
                side: o.side,
                price: o.price,
                size: o.size,
                rested_since_ms: o.rested_since_ms,
                strategy: o.strategy,
            })
    }

    // ─── Placement ───

    pub fn place(&mut self, req: PlaceOrder, book: &BookState, now_ms: i64) -> PlaceOutcome {
        let order_id = self.next_order_id;
        self.next_order_id += 1;

        let mut order = Order {
            order_id,
            market_id: req.market_id.clone(),
            side: req.side,
            price: req.price,
            size: req.size,
            status: OrderStatus::Open,
            tif: req.tif,
            strategy: req.strategy,
            created_ts_ms: now_ms,
            rested_since_ms: now_ms,
            filled_size: Decimal::ZERO,
            avg_fill_price: Decimal::ZERO,
            reason: None,
        };

        if req.size <= Decimal::ZERO || !price_on_grid(req.price, book.tick_size) {
            order.status = OrderStatus::Rejected;
            order.reason = Some("price off grid or non-positive size".to_string());
            return PlaceOutcome { order, fills: Vec::new() };
        }

        if self.execution_mode == ExecutionMode::Shadow {
            info!(
                component = "broker",
                event = "would_place",
                market_id = %req.market_id,
                side = %req.side,
                price = %req.price,
                size = %req.size,
                strategy = req.strategy,
            );
            return PlaceOutcome { order, fills: Vec::new() };
        }

        self.orders_placed += 1;
        let mut fills = Vec::new();

        // Marketable at placement: cross the touch immediately, capped at
        // the displayed top-of-book size.
        let touch = match req.side {
            Side::Buy => book.best_ask().filter(|a| req.price >= *a),
            Side::Sell => book.best_bid().filter(|b| req.price <= *b),
        };
        if let Some(touch_price) = touch {
            let available = match req.side {
                Side::Buy => book.best_ask_size(),
                Side::Sell => book.best_bid_size(),
            };
            let take = order.remaining().min(available);
            if take > Decimal::ZERO {
                fills.push(self.emit_fill(&mut order, touch_price, take, now_ms));
            }
        }

        if order.is_open() {
            match req.tif {
                TimeInForce::Gtc => {
                    self.open
                        .entry(req.market_id)
                        .or_default()
                        .insert(order_id, order.clone());
                }
                TimeInForce::Ioc => {
                    order.status = OrderStatus::Cancelled;
                    order.reason = Some("ioc remainder".to_string());
                }
            }
        }

        PlaceOutcome { order, fills }
    }

    /// Immediate and idempotent; a double-cancel (or a cancel for an
    /// already-closed order) is a no-op returning None.
    pub fn cancel(&mut self, market_id: &str, order_id: u64) -> Option<Order> {
        if self.execution_mode == ExecutionMode::Shadow {
            info!(
                component = "broker",
                event = "would_cancel",
                market_id = %market_id,
                order_id,
            );
            return None;
        }
        let orders = self.open.get_mut(market_id)?;
        let mut order = orders.remove(&order_id)?;
        order.status = OrderStatus::Cancelled;
        self.orders_cancelled += 1;
        Some(order)
    }

    /// Cancel + fresh placement preserving side, tif and owner.
    pub fn replace(
        &mut self,
        market_id: &str,
        order_id: u64,
        new_price: Decimal,
        new_size: Decimal,
        book: &BookState,
        now_ms: i64,
    ) -> Option<(Order, PlaceOutcome)> {
        let side = self.order_side(market_id, order_id)?;
        let (tif, strategy) = {
            let o = self.open.get(market_id)?.get(&order_id)?;
            (o.tif, o.strategy)
        };
        let cancelled = self.cancel(market_id, order_id)?;
        let outcome = self.place(
            PlaceOrder {
                market_id: market_id.to_string(),
                side,
                price: new_price,
                size: new_size,
                tif,
                strategy,
                reduce_only: false,
            },
            book,
            now_ms,
        );
        Some((cancelled, outcome))
    }

    pub fn cancel_all(&mut self, market_id: &str) -> Vec<Order> {
        let Some(orders) = self.open.remove(market_id) else {
            return Vec::new();
        };
        self.orders_cancelled += orders.len() as u64;
        orders
            .into_values()
            .map(|mut o| {
                o.status = OrderStatus::Cancelled;
                o
            })
            .collect()
    }

    // ─── Matching ───

    /// Maker-touch step, run after every book change for the market.
    pub fn match_book(&mut self, market_id: &str, book: &BookState, now_ms: i64) -> MatchOutcome {
        let mut out = MatchOutcome::default();
        if self.fill_model != FillModel::MakerTouch
            || self.execution_mode == ExecutionMode::Shadow
        {
            return out;
        }

        // Plan first (shared borrow), then apply (exclusive borrow): the
        // fill math needs &mut self for ids and counters.
        let mut planned: Vec<(u64, Decimal)> = Vec::new();
        if let Some(orders) = self.open.get(market_id) {
            for order in orders.values() {
                if now_ms - order.rested_since_ms < self.min_rest_ms {
                    continue;
                }
                let available = match order.side {
                    Side::Buy => match book.best_ask() {
                        Some(ask) if ask <= order.price => book.best_ask_size(),
                        _ => continue,
                    },
                    Side::Sell => match book.best_bid() {
                        Some(bid) if bid >= order.price => book.best_bid_size(),
                        _ => continue,
                    },
                };
                let take = order.remaining().min(available * self.participation);
                if take > Decimal::ZERO {
                    planned.push((order.order_id, take));
                }
            }
        }

        for (order_id, take) in planned {
            if let Some((fill, order)) = self.fill_resting(market_id, order_id, take, now_ms) {
                out.fills.push(fill);
                out.orders.push(order);
            }
        }
        out
    }

    /// Trade-through step, run for every trade print in the market.
    pub fn match_trade(
        &mut self,
        market_id: &str,
        trade: &TradePrint,
        now_ms: i64,
    ) -> MatchOutcome {
        let mut out = MatchOutcome::default();
        if self.fill_model != FillModel::TradeThrough
            || self.execution_mode == ExecutionMode::Shadow
        {
            return out;
        }

        let mut planned: Vec<(u64, Decimal)> = Vec::new();
        if let Some(orders) = self.open.get(market_id) {
            for order in orders.values() {
                if now_ms - order.rested_since_ms < self.min_rest_ms {
                    continue;
                }
                let crossed = match order.side {
                    Side::Buy => trade.price <= order.price,
                    Side::Sell => trade.price >= order.price,
                };
                if !crossed {
                    continue;
                }
                let take = order.remaining().min(trade.size * self.participation);
                if take > Decimal::ZERO {
                    planned.push((order.order_id, take));
                }
            }
        }

        for (order_id, take) in planned {
            if let Some((fill, order)) = self.fill_resting(market_id, order_id, take, now_ms) {
                out.fills.push(fill);
                out.orders.push(order);
            }
        }
        out
    }

    // ─── Internals ───

    fn emit_fill(&mut self, order: &mut Order, base_price: Decimal, size: Decimal, now_ms: i64) -> Fill {
        let price = self.slip(base_price, order.side);
        let fees = price * size * self.fees_bps / Decimal::from(10_000);

        let prev_notional = order.avg_fill_price * order.filled_size;
        order.filled_size += size;
        order.avg_fill_price = (prev_notional + price * size) / order.filled_size;
        order.status = if order.remaining().is_zero() {
            OrderStatus::Filled
        } else {
            OrderStatus::Partial
        };

        let fill_id = self.next_fill_id;
        self.next_fill_id += 1;
        self.fills_emitted += 1;
        Fill {
            fill_id,
            order_id: order.order_id,
            market_id: order.market_id.clone(),
            side: order.side,
            price,
            size,
            ts_ms: now_ms,
            fees,
        }
    }

    /// Slippage worsens the execution: buys pay up, sells give back.
    fn slip(&self, price: Decimal, side: Side) -> Decimal {
        let adj = price * self.slippage_bps / Decimal::from(10_000);
        match side {
            Side::Buy => price + adj,
            Side::Sell => price - adj,
        }
    }
}

impl PaperBroker {
    /// Fill a resting order at its own limit price (the paper assumption:
    /// we were resting and got hit). Fully-filled orders leave the map.
    fn fill_resting(
        &mut self,
        market_id: &str,
        order_id: u64,
        size: Decimal,
        now_ms: i64,
    ) -> Option<(Fill, Order)> {
        let mut order = self.open.get_mut(market_id)?.remove(&order_id)?;
        let base = order.price;
        let fill = self.emit_fill(&mut order, base, size, now_ms);
        let snapshot = order.clone();
        if order.is_open() {
            self.open.get_mut(market_id)?.insert(order_id, order);
        }
        Some((fill, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{make_book, make_config};
    use crate::types::BookDelta;
    use rust_decimal_macros::dec;

    fn place_req(side: Side, price: Decimal, size: Decimal, tif: TimeInForce) -> PlaceOrder {
        PlaceOrder {
            market_id: "m1".to_string(),
            side,
            price,
            size,
            tif,
            strategy: "market_maker",
            reduce_only: false,
        }
    }

    fn default_book() -> crate::book::BookState {
        make_book(
            dec!(0.01),
            vec![(dec!(0.49), dec!(100))],
            vec![(dec!(0.51), dec!(100))],
        )
    }

    /// Scenario: resting buy at 0.49; the ask collapses onto it with size 50
    /// after the minimum rest time (participation 0.5).
    /// Expected: one fill of min(10, 50*0.5) = 10 at the limit price 0.49;
    /// the order leaves the open set as filled.
    #[test]
    fn test_maker_touch_fill_on_ask_collapse() {
        let config = make_config();
        let mut broker = PaperBroker::new(&config);
        let mut book = default_book();

        let placed = broker.place(place_req(Side::Buy, dec!(0.49), dec!(10), TimeInForce::Gtc), &book, 1_000);
        assert_eq!(placed.order.status, OrderStatus::Open);
        assert!(placed.fills.is_empty());

        book.apply_delta(
            &BookDelta {
                bids_changed: vec![],
                asks_changed: vec![(dec!(0.49), dec!(50)), (dec!(0.51), dec!(0))],
                seq: None,
            },
            2_500,
            2_500,
        );
        let out = broker.match_book("m1", &book, 2_500);
        assert_eq!(out.fills.len(), 1);
        let fill = &out.fills[0];
        assert_eq!(fill.price, dec!(0.49));
        assert_eq!(fill.size, dec!(10));
        assert_eq!(out.orders[0].status, OrderStatus::Filled);
        assert_eq!(broker.open_order_count(), 0);
    }

    /// Scenario: same collapse but only 400ms after placement against a 1s
    /// minimum rest.
    /// Expected: no fill yet; the fill happens once rest time has elapsed.
    #[test]
    fn test_min_rest_gates_fill() {
        let config = make_config();
        let mut broker = PaperBroker::new(&config);
        let mut book = default_book();

        broker.place(place_req(Side::Buy, dec!(0.49), dec!(10), TimeInForce::Gtc), &book, 1_000);
        book.apply_delta(
            &BookDelta {
                bids_changed: vec![],
                asks_changed: vec![(dec!(0.49), dec!(50)), (dec!(0.51), dec!(0))],
                seq: None,
            },
            1_400,
            1_400,
        );
        assert!(broker.match_book("m1", &book, 1_400).fills.is_empty());
        assert_eq!(broker.match_book("m1", &book, 2_100).fills.len(), 1);
    }

    /// Scenario: trade-through model; resting buy@0.49, trade prints at
    /// 0.485 size 20 with participation 0.5.
    /// Expected: fill of min(10, 20*0.5) = 10 at 0.49; the book-touch path
    /// emits nothing under this model.
    #[test]
    fn test_trade_through_fill() {
        let mut config = make_config();
        config.fill_model = FillModel::TradeThrough;
        let mut broker = PaperBroker::new(&config);
        let book = default_book();

        broker.place(place_req(Side::Buy, dec!(0.49), dec!(10), TimeInForce::Gtc), &book, 1_000);

        // Book movement alone must not fill under trade_through.
        assert!(broker.match_book("m1", &book, 3_000).fills.is_empty());

        let trade = TradePrint { price: dec!(0.485), size: dec!(20), side: Side::Sell, ts_ms: 3_000 };
        let out = broker.match_trade("m1", &trade, 3_000);
        assert_eq!(out.fills.len(), 1);
        assert_eq!(out.fills[0].size, dec!(10));
        assert_eq!(out.fills[0].price, dec!(0.49));
    }

    /// Scenario: trade-through with a print above the buy limit.
    /// Expected: no fill, since the print did not cross the order.
    #[test]
    fn test_trade_through_requires_crossing() {
        let mut config = make_config();
        config.fill_model = FillModel::TradeThrough;
        let mut broker = PaperBroker::new(&config);
        let book = default_book();
        broker.place(place_req(Side::Buy, dec!(0.49), dec!(10), TimeInForce::Gtc), &book, 1_000);

        let trade = TradePrint { price: dec!(0.50), size: dec!(20), side: Side::Sell, ts_ms: 3_000 };
        assert!(broker.match_trade("m1", &trade, 3_000).fills.is_empty());
    }

    /// Scenario: buy placed at 0.52 with the ask sitting at 0.51 size 6.
    /// Expected: marketable at placement: instant fill of 6 at the touch,
    /// GTC remainder (4) rests at the limit.
    #[test]
    fn test_marketable_placement_partial_rests() {
        let config = make_config();
        let mut broker = PaperBroker::new(&config);
        let mut book = default_book();
        book.apply_delta(
            &BookDelta {
                bids_changed: vec![],
                asks_changed: vec![(dec!(0.51), dec!(6))],
                seq: None,
            },
            1_500,
            1_500,
        );

        let out = broker.place(place_req(Side::Buy, dec!(0.52), dec!(10), TimeInForce::Gtc), &book, 2_000);
        assert_eq!(out.fills.len(), 1);
        assert_eq!(out.fills[0].price, dec!(0.51));
        assert_eq!(out.fills[0].size, dec!(6));
        assert_eq!(out.order.status, OrderStatus::Partial);
        assert_eq!(out.order.remaining(), dec!(4));
        assert_eq!(broker.open_order_count(), 1);
    }

    /// Scenario: the same marketable buy as IOC.
    /// Expected: instant fill for the displayed size, remainder cancelled,
    /// nothing rests.
    #[test]
    fn test_marketable_ioc_cancels_remainder() {
        let config = make_config();
        let mut broker = PaperBroker::new(&config);
        let mut book = default_book();
        book.apply_delta(
            &BookDelta {
                bids_changed: vec![],
                asks_changed: vec![(dec!(0.51), dec!(6))],
                seq: None,
            },
            1_500,
            1_500,
        );

        let out = broker.place(place_req(Side::Buy, dec!(0.52), dec!(10), TimeInForce::Ioc), &book, 2_000);
        assert_eq!(out.fills.len(), 1);
        assert_eq!(out.order.status, OrderStatus::Cancelled);
        assert_eq!(broker.open_order_count(), 0);
    }

    /// Scenario: non-marketable IOC (buy below the ask).
    /// Expected: cancelled outright, no fills, nothing rests.
    #[test]
    fn test_nonmarketable_ioc_cancelled() {
        let config = make_config();
        let mut broker = PaperBroker::new(&config);
        let book = default_book();
        let out = broker.place(place_req(Side::Buy, dec!(0.49), dec!(10), TimeInForce::Ioc), &book, 2_000);
        assert!(out.fills.is_empty());
        assert_eq!(out.order.status, OrderStatus::Cancelled);
        assert_eq!(broker.open_order_count(), 0);
    }

    /// Scenario: orders at the tick boundaries on a 0.01 grid.
    /// Expected: 0.01 and 0.99 accepted; 0 and 1 rejected; off-grid 0.015
    /// rejected.
    #[test]
    fn test_price_boundaries() {
        let config = make_config();
        let mut broker = PaperBroker::new(&config);
        let book = default_book();

        let lo = broker.place(place_req(Side::Buy, dec!(0.01), dec!(5), TimeInForce::Gtc), &book, 1_000);
        assert_eq!(lo.order.status, OrderStatus::Open);
        let hi = broker.place(place_req(Side::Sell, dec!(0.99), dec!(5), TimeInForce::Gtc), &book, 1_000);
        assert_eq!(hi.order.status, OrderStatus::Open);

        let zero = broker.place(place_req(Side::Buy, dec!(0), dec!(5), TimeInForce::Gtc), &book, 1_000);
        assert_eq!(zero.order.status, OrderStatus::Rejected);
        let one = broker.place(place_req(Side::Buy, dec!(1), dec!(5), TimeInForce::Gtc), &book, 1_000);
        assert_eq!(one.order.status, OrderStatus::Rejected);
        let off = broker.place(place_req(Side::Buy, dec!(0.015), dec!(5), TimeInForce::Gtc), &book, 1_000);
        assert_eq!(off.order.status, OrderStatus::Rejected);
    }

    /// Scenario: cancel an open order, then cancel it again.
    /// Expected: first cancel returns the cancelled row; the second is a
    /// no-op returning None.
    #[test]
    fn test_cancel_idempotent() {
        let config = make_config();
        let mut broker = PaperBroker::new(&config);
        let book = default_book();
        let placed = broker.place(place_req(Side::Buy, dec!(0.49), dec!(10), TimeInForce::Gtc), &book, 1_000);
        let id = placed.order.order_id;

        let first = broker.cancel("m1", id);
        assert_eq!(first.unwrap().status, OrderStatus::Cancelled);
        assert!(broker.cancel("m1", id).is_none());
    }

    /// Scenario: partial fills across two touch events (participation caps
    /// each pass at half the displayed size).
    /// Expected: open -> partial -> filled, filled_size accumulates, avg
    /// fill price stays at the limit.
    #[test]
    fn test_partial_fill_progression() {
        let config = make_config();
        let mut broker = PaperBroker::new(&config);
        let mut book = default_book();
        broker.place(place_req(Side::Buy, dec!(0.49), dec!(10), TimeInForce::Gtc), &book, 1_000);

        // 12 on the touch -> take 6; then again -> take remaining 4.
        book.apply_delta(
            &BookDelta {
                bids_changed: vec![],
                asks_changed: vec![(dec!(0.49), dec!(12)), (dec!(0.51), dec!(0))],
                seq: None,
            },
            2_500,
            2_500,
        );
        let first = broker.match_book("m1", &book, 2_500);
        assert_eq!(first.fills[0].size, dec!(6));
        assert_eq!(first.orders[0].status, OrderStatus::Partial);

        let second = broker.match_book("m1", &book, 3_000);
        assert_eq!(second.fills[0].size, dec!(4));
        assert_eq!(second.orders[0].status, OrderStatus::Filled);
        assert_eq!(second.orders[0].filled_size, dec!(10));
        assert_eq!(second.orders[0].avg_fill_price, dec!(0.49));
    }

    /// Scenario: 100 bps slippage and 200 bps fees on a marketable buy at
    /// the 0.51 touch.
    /// Expected: fill price 0.51 * 1.01 = 0.5151; fees = price*size*0.02.
    #[test]
    fn test_slippage_and_fees() {
        let mut config = make_config();
        config.slippage_bps = dec!(100);
        config.fees_bps = dec!(200);
        let mut broker = PaperBroker::new(&config);
        let book = default_book();

        let out = broker.place(place_req(Side::Buy, dec!(0.51), dec!(10), TimeInForce::Ioc), &book, 1_000);
        let fill = &out.fills[0];
        assert_eq!(fill.price, dec!(0.5151));
        assert_eq!(fill.fees, dec!(0.5151) * dec!(10) * dec!(200) / dec!(10000));
    }

    /// Scenario: shadow execution mode.
    /// Expected: placements and cancels are recorded as would-have-beens;
    /// no fills, no resting orders, match steps are inert.
    #[test]
    fn test_shadow_mode_never_fills() {
        let mut config = make_config();
        config.execution_mode = ExecutionMode::Shadow;
        let mut broker = PaperBroker::new(&config);
        let book = default_book();

        let out = broker.place(place_req(Side::Buy, dec!(0.52), dec!(10), TimeInForce::Gtc), &book, 1_000);
        assert!(out.fills.is_empty());
        assert_eq!(broker.open_order_count(), 0);
        assert!(broker.cancel("m1", out.order.order_id).is_none());
        assert!(broker.match_book("m1", &book, 5_000).fills.is_empty());
    }

    /// Scenario: replace a resting bid with a new price.
    /// Expected: old order cancelled, new order keeps side/strategy/tif and
    /// restarts its rest clock.
    #[test]
    fn test_replace_preserves_identity() {
        let config = make_config();
        let mut broker = PaperBroker::new(&config);
        let book = default_book();
        let placed = broker.place(place_req(Side::Buy, dec!(0.47), dec!(10), TimeInForce::Gtc), &book, 1_000);

        let (old, new) = broker
            .replace("m1", placed.order.order_id, dec!(0.48), dec!(10), &book, 4_000)
            .unwrap();
        assert_eq!(old.status, OrderStatus::Cancelled);
        assert_eq!(new.order.side, Side::Buy);
        assert_eq!(new.order.price, dec!(0.48));
        assert_eq!(new.order.strategy, "market_maker");
        assert_eq!(new.order.rested_since_ms, 4_000);
        assert_eq!(broker.open_order_count(), 1);
    }

    /// Scenario: restore two persisted open orders, then place a new one.
    /// Expected: the new order id continues past the restored maximum.
    #[test]
    fn test_restore_resumes_ids() {
        let config = make_config();
        let mut broker = PaperBroker::new(&config);
        let book = default_book();

        let restored = vec![
            Order {
                order_id: 41,
                market_id: "m1".to_string(),
                side: Side::Buy,
                price: dec!(0.48),
                size: dec!(10),
                status: OrderStatus::Open,
                tif: TimeInForce::Gtc,
                strategy: "restored",
                created_ts_ms: 500,
                rested_since_ms: 500,
                filled_size: dec!(0),
                avg_fill_price: dec!(0),
                reason: None,
            },
        ];
        broker.restore(restored);
        assert_eq!(broker.open_order_count(), 1);

        let placed = broker.place(place_req(Side::Sell, dec!(0.52), dec!(5), TimeInForce::Gtc), &book, 1_000);
        assert_eq!(placed.order.order_id, 42);
    }
}
