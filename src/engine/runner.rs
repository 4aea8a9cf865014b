//! Core scheduler loop. Single task, owns all hot-path state: book caches,
//! portfolio, broker. Background tasks (selector, feed readers, storage
//! writer) talk to it only through the merged bounded channel, so no locks
//! sit on the event path.
//!
//! Per consumed event: apply to book / persist tape → broker match →
//! throttled strategy eval → risk gate → broker submit/cancel → periodic
//! snapshots and unwind injection.

use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::book::{BookApply, BookState};
use crate::broker::PaperBroker;
use crate::config::{Config, RunMode};
use crate::portfolio::Portfolio;
use crate::risk::{check_placement, flatten_side, RiskInputs, RiskReason};
use crate::storage::{StorageHandle, StoreMsg, TapeRow};
use crate::strategies::{enabled_strategies, FvProvider, Strategy, StrategyCtx};
use crate::types::{
    EngineEvent, FeedUpdate, Fill, MarketMeta, Order, PlaceOrder, PnlSnapshot, QuoteIntent,
    TapeEvent, TimeInForce, WatchlistUpdate,
};

/// Strategy tag for scheduler-injected flatten orders.
const UNWIND: &str = "unwind";
/// Cadence of the per-market diagnostics log.
const DIAG_INTERVAL_MS: i64 = 10_000;

/// Everything the scheduler needs at startup. Portfolio and broker arrive
/// pre-restored (or fresh) from `main`.
pub struct EngineDeps {
    pub config: Config,
    pub event_rx: mpsc::Receiver<EngineEvent>,
    /// Cloned into per-market feed tasks spawned on watchlist changes.
    /// None in backtest: the scheduler must not hold a sender to its own
    /// channel or replay EOF never closes it.
    pub engine_tx: Option<mpsc::Sender<EngineEvent>>,
    pub storage: StorageHandle,
    pub fv: FvProvider,
    pub portfolio: Portfolio,
    pub broker: PaperBroker,
    pub shutdown: watch::Receiver<bool>,
}

/// Session summary, logged and returned at exit.
#[derive(Debug, Default)]
pub struct EngineOutcome {
    pub events_processed: u64,
    pub orders_placed: u64,
    pub orders_cancelled: u64,
    pub fills: u64,
    pub risk_rejections: u64,
    pub markets_disabled: u64,
    pub realized: Decimal,
    pub unrealized: Decimal,
    pub dropped_tape_writes: u64,
}

#[derive(Default)]
struct StrategyCounters {
    proposed: u64,
    accepted: u64,
    rejected: u64,
}

struct Engine {
    config: Config,
    storage: StorageHandle,
    fv: FvProvider,
    portfolio: Portfolio,
    broker: PaperBroker,
    strategies: Vec<Strategy>,

    books: HashMap<String, BookState>,
    metas: HashMap<String, MarketMeta>,
    feed_tasks: HashMap<String, tokio::task::JoinHandle<()>>,
    /// Markets fail-closed for the rest of the session.
    disabled: HashSet<String>,

    last_eval_ms: HashMap<String, i64>,
    /// Top-of-book at last eval; a move beyond the reprice threshold forces
    /// an immediate re-evaluation.
    last_top: HashMap<String, (Option<Decimal>, Option<Decimal>)>,

    kill_switch: bool,
    paused: bool,
    last_snapshot_ms: i64,
    last_unwind_ms: i64,
    last_diag_ms: i64,

    counters: EngineOutcome,
    strat_counters: HashMap<&'static str, StrategyCounters>,
    intents_buf: Vec<QuoteIntent>,
}

/// Drive the core loop until shutdown (live) or channel EOF (backtest).
pub async fn run_engine(deps: EngineDeps) -> EngineOutcome {
    let EngineDeps {
        config,
        mut event_rx,
        engine_tx,
        storage,
        fv,
        portfolio,
        broker,
        mut shutdown,
    } = deps;

    let strategies = match config.run_mode {
        RunMode::Scanner => Vec::new(),
        _ => enabled_strategies(&config),
    };
    info!(
        component = "engine",
        event = "started",
        run_mode = config.run_mode.as_str(),
        strategies = strategies.len(),
        kill_switch = config.kill_switch,
    );

    let backtest = config.run_mode == RunMode::Backtest;
    let engine_tx = if backtest { None } else { engine_tx };
    let idle = std::time::Duration::from_millis(config.idle_tick_ms);
    let mut engine = Engine {
        kill_switch: config.kill_switch,
        config,
        storage,
        fv,
        portfolio,
        broker,
        strategies,
        books: HashMap::new(),
        metas: HashMap::new(),
        feed_tasks: HashMap::new(),
        disabled: HashSet::new(),
        last_eval_ms: HashMap::new(),
        last_top: HashMap::new(),
        paused: false,
        last_snapshot_ms: 0,
        last_unwind_ms: 0,
        last_diag_ms: 0,
        counters: EngineOutcome::default(),
        strat_counters: HashMap::new(),
        intents_buf: Vec::new(),
    };
    // Event time drives the clock in backtest; wall clock otherwise.
    let mut clock_ms: i64 = if backtest {
        0
    } else {
        chrono::Utc::now().timestamp_millis()
    };

    loop {
        let event = if backtest {
            match event_rx.recv().await {
                Some(e) => e,
                None => break,
            }
        } else {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                e = event_rx.recv() => match e {
                    Some(e) => e,
                    None => break,
                },
                _ = tokio::time::sleep(idle) => EngineEvent::Tick,
            }
        };

        match event {
            EngineEvent::Tape(update) => {
                if backtest {
                    clock_ms = update.local_ts_ms;
                } else {
                    clock_ms = chrono::Utc::now().timestamp_millis();
                }
                engine.on_tape(update, clock_ms).await;
            }
            EngineEvent::Watchlist(update) => {
                if !backtest {
                    clock_ms = chrono::Utc::now().timestamp_millis();
                }
                engine.on_watchlist(update, engine_tx.as_ref()).await;
            }
            EngineEvent::Tick => {
                clock_ms = chrono::Utc::now().timestamp_millis();
            }
        }

        engine.periodic(clock_ms).await;
    }

    engine.finish(clock_ms).await
}

impl Engine {
    // ─── Watchlist handling ───

    async fn on_watchlist(
        &mut self,
        update: WatchlistUpdate,
        engine_tx: Option<&mpsc::Sender<EngineEvent>>,
    ) {
        if update.degraded {
            // Serving a stale list; pause only if there has never been a
            // good one.
            if update.consecutive_failures >= 5 && update.entries.is_empty() {
                if !self.paused {
                    warn!(component = "engine", event = "paused_no_watchlist");
                }
                self.paused = true;
            }
            return;
        }
        if self.paused {
            info!(component = "engine", event = "resumed");
        }
        self.paused = false;

        for meta in &update.markets {
            if !self.metas.contains_key(&meta.market_id) {
                self.storage
                    .send_critical(StoreMsg::Market(meta.clone()))
                    .await;
            }
            self.metas.insert(meta.market_id.clone(), meta.clone());
        }

        if !update.diff.is_empty() {
            info!(
                component = "engine",
                event = "watchlist_diff",
                added = ?update.diff.added,
                removed = ?update.diff.removed,
                reranked = update.diff.reranked.len(),
            );
        }

        for market_id in &update.diff.added {
            let tick = self
                .metas
                .get(market_id)
                .map(|m| m.tick_size)
                .unwrap_or_else(|| "0.001".parse().unwrap());
            self.books
                .entry(market_id.clone())
                .or_insert_with(|| BookState::new(tick));

            if let Some(tx) = engine_tx {
                let handle = tokio::spawn(crate::feed::market_feed(
                    market_id.clone(),
                    self.config.clob_ws_url.clone(),
                    tx.clone(),
                    self.config.net_timeout_secs,
                    self.config.n_permanent_attempts,
                ));
                if let Some(old) = self.feed_tasks.insert(market_id.clone(), handle) {
                    old.abort();
                }
            }
        }

        for market_id in &update.diff.removed {
            if let Some(handle) = self.feed_tasks.remove(market_id) {
                handle.abort();
            }
            // Orders die with the subscription; the position unwinds via
            // the time stop.
            for order in self.broker.cancel_all(market_id) {
                self.counters.orders_cancelled += 1;
                self.storage.send_critical(StoreMsg::Order(order)).await;
            }
        }
    }

    // ─── Tape handling ───

    async fn on_tape(&mut self, update: FeedUpdate, now_ms: i64) {
        self.counters.events_processed += 1;
        let market_id = update.market_id.clone();

        // 1. Persist the tape row (best-effort). Replay never re-records.
        if self.config.run_mode != RunMode::Backtest {
            self.storage.send_tape(TapeRow::from_event(
                &market_id,
                &update.event,
                update.source_ts_ms,
                update.local_ts_ms,
            ));
        }

        if self.disabled.contains(&market_id) {
            return;
        }

        let tick = self
            .metas
            .get(&market_id)
            .map(|m| m.tick_size)
            .unwrap_or_else(|| "0.001".parse().unwrap());
        let book = self
            .books
            .entry(market_id.clone())
            .or_insert_with(|| BookState::new(tick));
        book.record_lag(update.local_ts_ms, update.source_ts_ms);

        let was_crossed = book.is_crossed();
        let applied = match &update.event {
            TapeEvent::Snapshot(snap) => {
                book.apply_snapshot(snap, update.source_ts_ms, update.local_ts_ms)
            }
            TapeEvent::Delta(delta) => {
                book.apply_delta(delta, update.source_ts_ms, update.local_ts_ms)
            }
            TapeEvent::Trade(trade) => book.apply_trade(trade, update.local_ts_ms),
        };

        match applied {
            BookApply::Invalid => {
                self.fail_close(&market_id, "invariant violation in feed event")
                    .await;
                return;
            }
            BookApply::SeqGap => {
                warn!(
                    component = "engine",
                    event = "seq_gap",
                    market_id = %market_id,
                );
                // Unsynced until the next snapshot; quoting stays down.
            }
            BookApply::DiscardedPreSnapshot => {
                debug!(
                    component = "engine",
                    event = "delta_discarded_pre_snapshot",
                    market_id = %market_id,
                );
                return;
            }
            BookApply::Applied => {}
        }

        if !was_crossed && self.books[&market_id].is_crossed() {
            warn!(
                component = "engine",
                event = "crossed_book",
                market_id = %market_id,
            );
        }

        if self.config.run_mode == RunMode::Scanner {
            return;
        }

        // 2. Broker match step against the updated tape.
        let outcome = match &update.event {
            TapeEvent::Trade(trade) => {
                self.broker.match_trade(&market_id, trade, now_ms)
            }
            _ => {
                let book = &self.books[&market_id];
                self.broker.match_book(&market_id, book, now_ms)
            }
        };
        self.apply_fills(outcome.fills, outcome.orders).await;

        // 3+4. Throttled strategy evaluation, risk-gated to the broker.
        if self.eval_due(&market_id, now_ms) {
            self.evaluate_market(&market_id, now_ms).await;
        }
    }

    /// Throttle: at most one eval per STRATEGY_MIN_INTERVAL, except that a
    /// top-of-book move beyond the reprice threshold re-evaluates now.
    fn eval_due(&self, market_id: &str, now_ms: i64) -> bool {
        if self.paused || self.strategies.is_empty() {
            return false;
        }
        let last = self.last_eval_ms.get(market_id).copied().unwrap_or(0);
        if now_ms - last >= self.config.strategy_min_interval_ms {
            return true;
        }
        let book = match self.books.get(market_id) {
            Some(b) => b,
            None => return false,
        };
        let (prev_bid, prev_ask) = self
            .last_top
            .get(market_id)
            .copied()
            .unwrap_or((None, None));
        let threshold = Decimal::from(self.config.mm_reprice_threshold) * book.tick_size;
        let moved = |prev: Option<Decimal>, now: Option<Decimal>| match (prev, now) {
            (Some(p), Some(n)) => (p - n).abs() >= threshold,
            (None, None) => false,
            _ => true,
        };
        moved(prev_bid, book.best_bid()) || moved(prev_ask, book.best_ask())
    }

    async fn evaluate_market(&mut self, market_id: &str, now_ms: i64) {
        let Some(meta) = self.metas.get(market_id) else {
            return;
        };
        let Some(book) = self.books.get(market_id) else {
            return;
        };

        let position = self.portfolio.snapshot(market_id);
        let position_opened_ms = self
            .portfolio
            .position(market_id)
            .map_or(0, |p| p.opened_ms);
        let open_orders = self.broker.open_orders(market_id);
        let fv = self.fv.latest(market_id, now_ms);

        let mut intents = std::mem::take(&mut self.intents_buf);
        {
            let ctx = StrategyCtx {
                book,
                position,
                position_opened_ms,
                open_orders: &open_orders,
                meta,
                config: &self.config,
                fv,
                now_ms,
            };
            crate::strategies::evaluate_all(&self.strategies, &ctx, &mut intents);
        }

        self.last_eval_ms.insert(market_id.to_string(), now_ms);
        self.last_top.insert(
            market_id.to_string(),
            (book.best_bid(), book.best_ask()),
        );

        for intent in intents.drain(..) {
            self.process_intent(intent, now_ms).await;
        }
        self.intents_buf = intents;
    }

    // ─── Intent processing (risk → broker → persistence) ───

    async fn process_intent(&mut self, intent: QuoteIntent, now_ms: i64) {
        match intent {
            QuoteIntent::Cancel {
                market_id,
                order_id,
            } => {
                if let Some(order) = self.broker.cancel(&market_id, order_id) {
                    self.counters.orders_cancelled += 1;
                    self.storage.send_critical(StoreMsg::Order(order)).await;
                }
            }
            QuoteIntent::Place(place) => {
                let strategy = place.strategy;
                self.bump_proposed(strategy);
                if let Err(reason) = self.gate(&place) {
                    self.reject(&place, reason);
                    return;
                }
                self.submit_place(place, now_ms).await;
            }
            QuoteIntent::Replace {
                market_id,
                order_id,
                new_price,
                new_size,
            } => {
                let Some(view) = self.broker.order_view(&market_id, order_id) else {
                    return; // order already gone; replace degrades to no-op
                };
                let place = PlaceOrder {
                    market_id: market_id.clone(),
                    side: view.side,
                    price: new_price,
                    size: new_size,
                    tif: TimeInForce::Gtc,
                    strategy: view.strategy,
                    reduce_only: false,
                };
                self.bump_proposed(view.strategy);
                if let Err(reason) = self.gate(&place) {
                    self.reject(&place, reason);
                    return;
                }
                let Some(book) = self.books.get(&market_id) else {
                    return;
                };
                if let Some((cancelled, outcome)) =
                    self.broker
                        .replace(&market_id, order_id, new_price, new_size, book, now_ms)
                {
                    self.counters.orders_cancelled += 1;
                    self.counters.orders_placed += 1;
                    self.bump_accepted(view.strategy);
                    self.storage.send_critical(StoreMsg::Order(cancelled)).await;
                    self.storage
                        .send_critical(StoreMsg::Order(outcome.order))
                        .await;
                    self.apply_fills(outcome.fills, Vec::new()).await;
                }
            }
        }
    }

    fn gate(&self, place: &PlaceOrder) -> Result<(), RiskReason> {
        let book = match self.books.get(&place.market_id) {
            Some(b) => b,
            None => return Err(RiskReason::SpreadBreaker),
        };
        let meta = match self.metas.get(&place.market_id) {
            Some(m) => m,
            None => return Err(RiskReason::SpreadBreaker),
        };
        let unrealized_now = self.unrealized_now();
        check_placement(
            place,
            &RiskInputs {
                config: &self.config,
                portfolio: &self.portfolio,
                book,
                meta,
                metas: &self.metas,
                kill_switch: self.kill_switch,
                unrealized_now,
            },
        )
    }

    fn reject(&mut self, place: &PlaceOrder, reason: RiskReason) {
        self.counters.risk_rejections += 1;
        self.strat_counters
            .entry(place.strategy)
            .or_default()
            .rejected += 1;
        info!(
            component = "risk",
            event = "rejected",
            rule = reason.as_str(),
            market_id = %place.market_id,
            side = %place.side,
            price = %place.price,
            size = %place.size,
            strategy = place.strategy,
        );
    }

    async fn submit_place(&mut self, place: PlaceOrder, now_ms: i64) {
        let Some(book) = self.books.get(&place.market_id) else {
            return;
        };
        let strategy = place.strategy;
        let outcome = self.broker.place(place, book, now_ms);
        if outcome.order.status != crate::types::OrderStatus::Rejected {
            self.counters.orders_placed += 1;
            self.bump_accepted(strategy);
        }
        info!(
            component = "broker",
            event = "order",
            market_id = %outcome.order.market_id,
            order_id = outcome.order.order_id,
            side = %outcome.order.side,
            price = %outcome.order.price,
            size = %outcome.order.size,
            status = outcome.order.status.as_str(),
            strategy,
        );
        self.storage
            .send_critical(StoreMsg::Order(outcome.order))
            .await;
        self.apply_fills(outcome.fills, Vec::new()).await;
    }

    /// Single entry point for fills: portfolio mutation stays with the
    /// scheduler, then everything is persisted acknowledged.
    async fn apply_fills(&mut self, fills: Vec<Fill>, order_updates: Vec<Order>) {
        for order in order_updates {
            self.storage.send_critical(StoreMsg::Order(order)).await;
        }
        for fill in fills {
            self.counters.fills += 1;
            self.portfolio.apply_fill(&fill);
            info!(
                component = "broker",
                event = "fill",
                market_id = %fill.market_id,
                order_id = fill.order_id,
                side = %fill.side,
                price = %fill.price,
                size = %fill.size,
                fees = %fill.fees,
            );
            if let Some(position) = self.portfolio.position(&fill.market_id) {
                self.storage
                    .send_critical(StoreMsg::Position(position.clone()))
                    .await;
            }
            self.storage.send_critical(StoreMsg::Fill(fill)).await;
        }
    }

    // ─── Periodic work: snapshots, unwind, diagnostics ───

    async fn periodic(&mut self, now_ms: i64) {
        if self.config.run_mode == RunMode::Scanner {
            return;
        }
        self.portfolio.roll_day(now_ms);

        if now_ms - self.last_snapshot_ms >= self.config.snapshot_interval_secs * 1_000 {
            self.last_snapshot_ms = now_ms;
            self.write_snapshot(now_ms).await;
        }

        if now_ms - self.last_unwind_ms >= self.config.unwind_interval_secs as i64 * 1_000 {
            self.last_unwind_ms = now_ms;
            self.inject_unwinds(now_ms).await;
        }

        if now_ms - self.last_diag_ms >= DIAG_INTERVAL_MS {
            self.last_diag_ms = now_ms;
            self.log_diagnostics();
        }
    }

    async fn write_snapshot(&mut self, now_ms: i64) {
        let snap = PnlSnapshot {
            ts_ms: now_ms,
            unrealized: self.unrealized_now(),
            realized: self.portfolio.realized_total(),
            open_markets: self.portfolio.open_markets(),
        };
        info!(
            component = "engine",
            event = "pnl_snapshot",
            unrealized = %snap.unrealized,
            realized = %snap.realized,
            open_markets = snap.open_markets,
        );
        let positions: Vec<_> = self.portfolio.positions().cloned().collect();
        for position in positions {
            self.storage
                .send_critical(StoreMsg::Position(position))
                .await;
        }
        self.storage.send_critical(StoreMsg::Pnl(snap)).await;
    }

    /// Time-stopped positions (and everything, once the daily loss limit is
    /// breached) are flattened with reduce-only IOC orders at the touch.
    async fn inject_unwinds(&mut self, now_ms: i64) {
        let day_pnl = self.portfolio.realized_today() + self.unrealized_now();
        let loss_tripped = day_pnl <= -self.config.daily_loss_limit;

        let mut flattens: Vec<PlaceOrder> = Vec::new();
        for position in self.portfolio.positions() {
            if position.net_size.is_zero() {
                continue;
            }
            let aged = position.opened_ms > 0
                && now_ms - position.opened_ms >= self.config.max_pos_age_secs * 1_000;
            if !aged && !loss_tripped {
                continue;
            }
            let Some(side) = flatten_side(position.net_size) else {
                continue;
            };
            let Some(book) = self.books.get(&position.market_id) else {
                continue;
            };
            let touch = match side {
                crate::types::Side::Sell => book.best_bid(),
                crate::types::Side::Buy => book.best_ask(),
            };
            let Some(price) = touch else { continue };
            flattens.push(PlaceOrder {
                market_id: position.market_id.clone(),
                side,
                price,
                size: position.net_size.abs(),
                tif: TimeInForce::Ioc,
                strategy: UNWIND,
                reduce_only: true,
            });
        }

        for place in flattens {
            info!(
                component = "engine",
                event = "unwind",
                market_id = %place.market_id,
                side = %place.side,
                size = %place.size,
                daily_loss_tripped = loss_tripped,
            );
            self.process_intent(QuoteIntent::Place(place), now_ms).await;
        }
    }

    fn log_diagnostics(&self) {
        for (market_id, book) in self.books.iter().take(5) {
            debug!(
                component = "engine",
                event = "diag",
                market_id = %market_id,
                quotable = book.is_quotable(),
                crossed = book.is_crossed(),
                spread_bps = book.spread_bps().unwrap_or(-1.0),
                lag_p99_ms = book.feed_lag_p99_ms(),
                net = %self.portfolio.net_size(market_id),
                open_orders = self.broker.open_orders(market_id).len(),
            );
        }
    }

    // ─── Fail-closed path ───

    async fn fail_close(&mut self, market_id: &str, why: &str) {
        error!(
            component = "engine",
            event = "market_disabled",
            market_id = %market_id,
            reason = why,
        );
        self.disabled.insert(market_id.to_string());
        self.counters.markets_disabled += 1;
        for order in self.broker.cancel_all(market_id) {
            self.counters.orders_cancelled += 1;
            self.storage.send_critical(StoreMsg::Order(order)).await;
        }
        if let Some(handle) = self.feed_tasks.remove(market_id) {
            handle.abort();
        }
    }

    // ─── Helpers ───

    fn unrealized_now(&self) -> Decimal {
        self.portfolio
            .unrealized_total(|id| self.books.get(id).and_then(|b| b.mid()))
    }

    fn bump_proposed(&mut self, strategy: &'static str) {
        self.strat_counters.entry(strategy).or_default().proposed += 1;
    }

    fn bump_accepted(&mut self, strategy: &'static str) {
        self.strat_counters.entry(strategy).or_default().accepted += 1;
    }

    /// Final snapshot + session summary. Open simulated orders stay open;
    /// a later run restores them unless PAPER_RESET_ON_START wipes first.
    async fn finish(mut self, now_ms: i64) -> EngineOutcome {
        for handle in self.feed_tasks.values() {
            handle.abort();
        }
        if self.config.run_mode != RunMode::Scanner {
            self.write_snapshot(now_ms).await;
        }

        self.counters.realized = self.portfolio.realized_total();
        self.counters.unrealized = self.unrealized_now();
        self.counters.dropped_tape_writes = self.storage.dropped_tape();

        info!(
            component = "engine",
            event = "session_summary",
            events = self.counters.events_processed,
            orders = self.counters.orders_placed,
            cancels = self.counters.orders_cancelled,
            fills = self.counters.fills,
            risk_rejections = self.counters.risk_rejections,
            markets_disabled = self.counters.markets_disabled,
            realized = %self.counters.realized,
            unrealized = %self.counters.unrealized,
            dropped_tape_writes = self.counters.dropped_tape_writes,
        );
        for (strategy, c) in &self.strat_counters {
            info!(
                component = "engine",
                event = "strategy_summary",
                strategy,
                proposed = c.proposed,
                accepted = c.accepted,
                rejected = c.rejected,
            );
        }
        self.counters
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{spawn_writer, Store};
    use crate::test_support::{make_config, make_meta};
    use crate::types::{
        BookDelta, BookSnapshot, Side, TradePrint, WatchlistDiff, WatchlistEntry,
    };
    use rust_decimal_macros::dec;

    fn watchlist_event(markets: Vec<crate::types::MarketMeta>) -> EngineEvent {
        let entries = markets
            .iter()
            .enumerate()
            .map(|(rank, m)| WatchlistEntry {
                market_id: m.market_id.clone(),
                score: 0.0,
                rank,
                eligible_until_ms: i64::MAX,
            })
            .collect();
        EngineEvent::Watchlist(WatchlistUpdate {
            entries,
            diff: WatchlistDiff::default(),
            markets,
            degraded: false,
            consecutive_failures: 0,
            generated_ms: 0,
        })
    }

    fn tape(market: &str, event: TapeEvent, ts: i64) -> EngineEvent {
        EngineEvent::Tape(FeedUpdate {
            market_id: market.to_string(),
            event,
            source_ts_ms: ts,
            local_ts_ms: ts,
        })
    }

    fn snapshot(bids: Vec<(Decimal, Decimal)>, asks: Vec<(Decimal, Decimal)>) -> TapeEvent {
        TapeEvent::Snapshot(BookSnapshot { bids, asks, seq: None })
    }

    /// Backtest run-mode harness: event-time clock, channel EOF exit.
    async fn run_events(
        config: Config,
        portfolio: Portfolio,
        events: Vec<EngineEvent>,
        db_path: &str,
    ) -> EngineOutcome {
        let store = Store::open(db_path).unwrap();
        let (storage, writer) = spawn_writer(store, 4096);
        let (tx, rx) = mpsc::channel(4096);
        for event in events {
            tx.send(event).await.unwrap();
        }
        drop(tx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let broker = PaperBroker::new(&config);
        let outcome = run_engine(EngineDeps {
            config,
            event_rx: rx,
            engine_tx: None,
            storage,
            fv: FvProvider::Stub { value: None },
            portfolio,
            broker,
            shutdown: shutdown_rx,
        })
        .await;
        writer.await.unwrap();
        outcome
    }

    fn scenario_config() -> Config {
        let mut config = make_config();
        config.run_mode = RunMode::Backtest;
        // One-tick half spread so quotes land on the touch (0.49 / 0.51).
        config.mm_edge_ticks = 0;
        config.strategy_fair_value = false;
        config
    }

    fn scenario_events() -> Vec<EngineEvent> {
        vec![
            watchlist_event(vec![make_meta("m1", "ev1", dec!(0.01))]),
            tape(
                "m1",
                snapshot(vec![(dec!(0.49), dec!(100))], vec![(dec!(0.51), dec!(100))]),
                1_000,
            ),
            // Ask collapses onto the resting bid after its rest time.
            tape(
                "m1",
                TapeEvent::Delta(BookDelta {
                    bids_changed: vec![],
                    asks_changed: vec![(dec!(0.49), dec!(50)), (dec!(0.51), dec!(0))],
                    seq: None,
                }),
                2_600,
            ),
            // Fresh uncrossed snapshot; quoting resumes around the new mid.
            tape(
                "m1",
                snapshot(vec![(dec!(0.48), dec!(100))], vec![(dec!(0.51), dec!(100))]),
                2_700,
            ),
        ]
    }

    /// Scenario: single-market MM cycle (maker-touch). Snapshot 0.49/0.51,
    /// MM quotes the touch, the ask collapses to 0.49.
    /// Expected: the bid fills 10 @ 0.49, position goes +10 @ 0.49, and
    /// after the resync snapshot a fresh quote pair rests.
    #[tokio::test]
    async fn test_scenario_mm_cycle_maker_touch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mm_cycle.db");
        let outcome = run_events(
            scenario_config(),
            Portfolio::new(),
            scenario_events(),
            path.to_str().unwrap(),
        )
        .await;

        assert_eq!(outcome.fills, 1);
        assert_eq!(outcome.risk_rejections, 0);

        let store = Store::open(path.to_str().unwrap()).unwrap();
        let fills = store.load_fills().unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].price, dec!(0.49));
        assert_eq!(fills[0].size, dec!(10));
        assert_eq!(fills[0].side, Side::Buy);

        let positions = store.load_positions().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].net_size, dec!(10));
        assert_eq!(positions[0].avg_price, dec!(0.49));

        // New pair re-emitted around the new mid after the resync.
        let open = store.load_open_orders().unwrap();
        assert_eq!(open.len(), 2, "expected a fresh quote pair: {open:?}");
        assert!(open.iter().any(|o| o.side == Side::Buy));
        assert!(open.iter().any(|o| o.side == Side::Sell));
    }

    /// Scenario: trade-through semantics. Same book, MM bid at 0.49; a
    /// trade prints at 0.485 size 20 (participation 0.5).
    /// Expected: fill of min(10, 20*0.5) = 10 @ 0.49; book movement alone
    /// fills nothing.
    #[tokio::test]
    async fn test_scenario_trade_through() {
        let mut config = scenario_config();
        config.fill_model = crate::config::FillModel::TradeThrough;

        let events = vec![
            watchlist_event(vec![make_meta("m1", "ev1", dec!(0.01))]),
            tape(
                "m1",
                snapshot(vec![(dec!(0.49), dec!(100))], vec![(dec!(0.51), dec!(100))]),
                1_000,
            ),
            tape(
                "m1",
                TapeEvent::Trade(TradePrint {
                    price: dec!(0.485),
                    size: dec!(20),
                    side: Side::Sell,
                    ts_ms: 2_600,
                }),
                2_600,
            ),
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trade_through.db");
        let outcome = run_events(config, Portfolio::new(), events, path.to_str().unwrap()).await;
        assert_eq!(outcome.fills, 1);

        let store = Store::open(path.to_str().unwrap()).unwrap();
        let fills = store.load_fills().unwrap();
        assert_eq!(fills[0].price, dec!(0.49));
        assert_eq!(fills[0].size, dec!(10));
    }

    /// Scenario: daily loss limit already breached (realized -100 on a 100
    /// limit) with a residual long of 10.
    /// Expected: every new MM placement is rejected daily_loss; the unwind
    /// cadence flattens the residual with a reduce-only IOC that fills at
    /// the bid.
    #[tokio::test]
    async fn test_scenario_daily_loss_flattens() {
        let mut config = scenario_config();
        config.daily_loss_limit = dec!(100);

        // Book a -100 realized day and leave 10 long at 0.99.
        let mut portfolio = Portfolio::new();
        portfolio.apply_fill(&crate::types::Fill {
            fill_id: 1,
            order_id: 1,
            market_id: "m1".to_string(),
            side: Side::Buy,
            price: dec!(0.99),
            size: dec!(1010),
            ts_ms: 500,
            fees: dec!(0),
        });
        portfolio.apply_fill(&crate::types::Fill {
            fill_id: 2,
            order_id: 2,
            market_id: "m1".to_string(),
            side: Side::Sell,
            price: dec!(0.89),
            size: dec!(1000),
            ts_ms: 600,
            fees: dec!(0),
        });
        assert_eq!(portfolio.realized_today(), dec!(-100));
        assert_eq!(portfolio.net_size("m1"), dec!(10));

        // Event time past the unwind interval so the flatten cadence fires.
        let events = vec![
            watchlist_event(vec![make_meta("m1", "ev1", dec!(0.01))]),
            tape(
                "m1",
                snapshot(vec![(dec!(0.49), dec!(100))], vec![(dec!(0.51), dec!(100))]),
                31_000,
            ),
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daily_loss.db");
        let outcome = run_events(config, portfolio, events, path.to_str().unwrap()).await;

        assert!(outcome.risk_rejections >= 2, "MM quotes must be rejected");
        assert_eq!(outcome.fills, 1, "the flatten IOC fills at the bid");

        let store = Store::open(path.to_str().unwrap()).unwrap();
        let fills = store.load_fills().unwrap();
        assert_eq!(fills[0].side, Side::Sell);
        assert_eq!(fills[0].size, dec!(10));
        let positions = store.load_positions().unwrap();
        assert_eq!(positions[0].net_size, dec!(0));
    }

    /// Scenario: the same event sequence replayed twice from scratch.
    /// Expected: identical orders and fills row-for-row (backtest
    /// determinism, timestamps included because the clock is event time).
    #[tokio::test]
    async fn test_backtest_determinism() {
        let dir = tempfile::tempdir().unwrap();
        let mut runs: Vec<(Vec<String>, Vec<String>)> = Vec::new();

        for i in 0..2 {
            let path = dir.path().join(format!("det_{i}.db"));
            run_events(
                scenario_config(),
                Portfolio::new(),
                scenario_events(),
                path.to_str().unwrap(),
            )
            .await;

            let store = Store::open(path.to_str().unwrap()).unwrap();
            let fills: Vec<String> = store
                .load_fills()
                .unwrap()
                .iter()
                .map(|f| format!("{:?}", f))
                .collect();
            let orders: Vec<String> = store
                .load_open_orders()
                .unwrap()
                .iter()
                .map(|o| format!("{:?}", o))
                .collect();
            runs.push((fills, orders));
        }
        assert_eq!(runs[0], runs[1]);
    }

    /// Scenario: positions recomputed from the persisted fills.
    /// Expected: replaying the fills through a fresh portfolio reproduces
    /// the stored position row exactly.
    #[tokio::test]
    async fn test_positions_match_fills_recompute() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recompute.db");
        run_events(
            scenario_config(),
            Portfolio::new(),
            scenario_events(),
            path.to_str().unwrap(),
        )
        .await;

        let store = Store::open(path.to_str().unwrap()).unwrap();
        let mut replayed = Portfolio::new();
        for fill in store.load_fills().unwrap() {
            replayed.apply_fill(&fill);
        }
        for stored in store.load_positions().unwrap() {
            assert_eq!(replayed.net_size(&stored.market_id), stored.net_size);
            let p = replayed.position(&stored.market_id).unwrap();
            assert_eq!(p.avg_price, stored.avg_price);
            assert_eq!(p.realized_pnl, stored.realized_pnl);
        }
    }

    /// Scenario: a watchlist update that drops a market with resting
    /// orders.
    /// Expected: its orders are cancelled; the book survives for marks.
    #[tokio::test]
    async fn test_watchlist_removal_cancels_orders() {
        let mut config = scenario_config();
        config.mm_edge_ticks = 0;

        let meta = make_meta("m1", "ev1", dec!(0.01));
        let mut events = vec![
            watchlist_event(vec![meta.clone()]),
            tape(
                "m1",
                snapshot(vec![(dec!(0.49), dec!(100))], vec![(dec!(0.51), dec!(100))]),
                1_000,
            ),
        ];
        // Second update removes m1 from the list.
        let mut removal = WatchlistUpdate {
            entries: Vec::new(),
            diff: WatchlistDiff::default(),
            markets: Vec::new(),
            degraded: false,
            consecutive_failures: 0,
            generated_ms: 2_000,
        };
        removal.diff.removed.push("m1".to_string());
        events.push(EngineEvent::Watchlist(removal));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("removal.db");
        let outcome = run_events(config, Portfolio::new(), events, path.to_str().unwrap()).await;
        assert_eq!(outcome.orders_placed, 2);
        assert_eq!(outcome.orders_cancelled, 2);

        let store = Store::open(path.to_str().unwrap()).unwrap();
        assert!(store.load_open_orders().unwrap().is_empty());
    }

    /// Scenario: an invalid feed event (negative size level) for a market
    /// with resting quotes.
    /// Expected: fail-closed: orders cancelled, market disabled, later
    /// events for it ignored.
    #[tokio::test]
    async fn test_invariant_violation_fail_closes() {
        let config = scenario_config();
        let events = vec![
            watchlist_event(vec![make_meta("m1", "ev1", dec!(0.01))]),
            tape(
                "m1",
                snapshot(vec![(dec!(0.49), dec!(100))], vec![(dec!(0.51), dec!(100))]),
                1_000,
            ),
            tape(
                "m1",
                snapshot(vec![(dec!(0.49), dec!(-5))], vec![(dec!(0.51), dec!(100))]),
                2_000,
            ),
            // Would otherwise trigger a fill against the resting bid.
            tape(
                "m1",
                TapeEvent::Delta(BookDelta {
                    bids_changed: vec![],
                    asks_changed: vec![(dec!(0.49), dec!(50))],
                    seq: None,
                }),
                3_000,
            ),
        ];

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fail_closed.db");
        let outcome = run_events(config, Portfolio::new(), events, path.to_str().unwrap()).await;
        assert_eq!(outcome.markets_disabled, 1);
        assert_eq!(outcome.fills, 0);

        let store = Store::open(path.to_str().unwrap()).unwrap();
        assert!(store.load_open_orders().unwrap().is_empty());
    }

    /// Scenario: scanner run mode over the same tape.
    /// Expected: no orders, no fills; selector/feed/storage only.
    #[tokio::test]
    async fn test_scanner_mode_never_trades() {
        let mut config = scenario_config();
        config.run_mode = RunMode::Scanner;

        // Scanner normally persists tape; here events are synthetic, so we
        // only assert trading stays off.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scanner.db");
        let store = Store::open(path.to_str().unwrap()).unwrap();
        let (storage, writer) = spawn_writer(store, 256);
        let (tx, rx) = mpsc::channel(256);
        for event in scenario_events() {
            tx.send(event).await.unwrap();
        }
        drop(tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let broker = PaperBroker::new(&config);
        let handle = tokio::spawn(run_engine(EngineDeps {
            config,
            event_rx: rx,
            engine_tx: None,
            storage,
            fv: FvProvider::Stub { value: None },
            portfolio: Portfolio::new(),
            broker,
            shutdown: shutdown_rx,
        }));
        // Scanner is not backtest mode: ask it to stop once the queue
        // drains.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        let _ = shutdown_tx.send(true);
        let outcome = handle.await.unwrap();
        writer.await.unwrap();

        assert_eq!(outcome.orders_placed, 0);
        assert_eq!(outcome.fills, 0);
        assert!(outcome.events_processed >= 3);
    }
}
