use std::collections::VecDeque;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::types::{BookDelta, BookSnapshot, TradePrint};

/// Rolling window length for the feed-lag p99 estimate.
const LAG_WINDOW: usize = 100;

/// Result of applying a feed event to the book.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BookApply {
    Applied,
    /// Delta arrived before the first post-(re)connect snapshot.
    DiscardedPreSnapshot,
    /// Sequence number was not `last_seq + 1`; a snapshot resync is needed.
    SeqGap,
    /// Negative size or price outside [0, 1]: fail-closed upstream.
    Invalid,
}

/// Per-market book state. Owned by the feed side of the scheduler; strategies
/// receive `&BookState` and never mutate it.
#[derive(Clone, Debug)]
pub struct BookState {
    /// Descending by price.
    pub bids: Vec<(Decimal, Decimal)>,
    /// Ascending by price.
    pub asks: Vec<(Decimal, Decimal)>,
    pub tick_size: Decimal,
    pub last_trade: Option<TradePrint>,
    pub last_update_ts_ms: i64,
    pub last_local_ts_ms: i64,
    /// False until a snapshot has been applied since (re)connect or gap.
    synced: bool,
    crossed: bool,
    last_seq: Option<u64>,
    lag_window: VecDeque<i64>,
}

impl BookState {
    pub fn new(tick_size: Decimal) -> Self {
        Self {
            bids: Vec::with_capacity(20),
            asks: Vec::with_capacity(20),
            tick_size,
            last_trade: None,
            last_update_ts_ms: 0,
            last_local_ts_ms: 0,
            synced: false,
            crossed: false,
            last_seq: None,
            lag_window: VecDeque::with_capacity(LAG_WINDOW),
        }
    }

    // ─── Reads ───

    #[inline]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|(p, _)| *p)
    }

    #[inline]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|(p, _)| *p)
    }

    #[inline]
    pub fn best_bid_size(&self) -> Decimal {
        self.bids.first().map_or(Decimal::ZERO, |(_, s)| *s)
    }

    #[inline]
    pub fn best_ask_size(&self) -> Decimal {
        self.asks.first().map_or(Decimal::ZERO, |(_, s)| *s)
    }

    #[inline]
    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some((b + a) / Decimal::from(2)),
            _ => None,
        }
    }

    #[inline]
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    /// Spread in basis points of mid. Ranking/threshold metric, not money.
    pub fn spread_bps(&self) -> Option<f64> {
        let spread = self.spread()?.to_f64()?;
        let mid = self.mid()?.to_f64()?;
        if mid <= 0.0 {
            return None;
        }
        Some(spread / mid * 10_000.0)
    }

    pub fn bid_depth(&self, levels: usize) -> Decimal {
        self.bids.iter().take(levels).map(|(_, s)| *s).sum()
    }

    pub fn ask_depth(&self, levels: usize) -> Decimal {
        self.asks.iter().take(levels).map(|(_, s)| *s).sum()
    }

    #[inline]
    pub fn is_synced(&self) -> bool {
        self.synced
    }

    #[inline]
    pub fn is_crossed(&self) -> bool {
        self.crossed
    }

    /// Quotable = synced, not crossed, both sides present.
    pub fn is_quotable(&self) -> bool {
        self.synced && !self.crossed && !self.bids.is_empty() && !self.asks.is_empty()
    }

    // ─── Feed lag ───

    pub fn record_lag(&mut self, local_ts_ms: i64, source_ts_ms: i64) {
        let lag = (local_ts_ms - source_ts_ms).max(0);
        if self.lag_window.len() == LAG_WINDOW {
            self.lag_window.pop_front();
        }
        self.lag_window.push_back(lag);
    }

    /// p99 feed lag over the rolling window. Zero until samples arrive.
    pub fn feed_lag_p99_ms(&self) -> i64 {
        if self.lag_window.is_empty() {
            return 0;
        }
        let mut sorted: Vec<i64> = self.lag_window.iter().copied().collect();
        sorted.sort_unstable();
        let idx = ((sorted.len() as f64) * 0.99).ceil() as usize;
        sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
    }

    // ─── Writes ───

    pub fn apply_snapshot(&mut self, snap: &BookSnapshot, source_ts_ms: i64, local_ts_ms: i64) -> BookApply {
        if !levels_valid(&snap.bids) || !levels_valid(&snap.asks) {
            return BookApply::Invalid;
        }

        let mut bids = snap.bids.clone();
        let mut asks = snap.asks.clone();
        // Defensive sort: downstream depth and touch checks depend on order.
        bids.sort_unstable_by(|a, b| b.0.cmp(&a.0));
        asks.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        bids.retain(|(_, s)| *s > Decimal::ZERO);
        asks.retain(|(_, s)| *s > Decimal::ZERO);

        self.bids = bids;
        self.asks = asks;
        self.last_seq = snap.seq;
        self.last_update_ts_ms = source_ts_ms;
        self.last_local_ts_ms = local_ts_ms;
        self.synced = true;
        self.refresh_crossed();
        BookApply::Applied
    }

    pub fn apply_delta(&mut self, delta: &BookDelta, source_ts_ms: i64, local_ts_ms: i64) -> BookApply {
        if !self.synced {
            return BookApply::DiscardedPreSnapshot;
        }
        if !levels_valid(&delta.bids_changed) || !levels_valid(&delta.asks_changed) {
            return BookApply::Invalid;
        }
        if let (Some(seq), Some(last)) = (delta.seq, self.last_seq) {
            if seq != last + 1 {
                self.synced = false;
                return BookApply::SeqGap;
            }
        }

        for &(price, size) in &delta.bids_changed {
            upsert_level(&mut self.bids, price, size, true);
        }
        for &(price, size) in &delta.asks_changed {
            upsert_level(&mut self.asks, price, size, false);
        }

        if delta.seq.is_some() {
            self.last_seq = delta.seq;
        }
        self.last_update_ts_ms = source_ts_ms;
        self.last_local_ts_ms = local_ts_ms;
        self.refresh_crossed();
        BookApply::Applied
    }

    pub fn apply_trade(&mut self, trade: &TradePrint, local_ts_ms: i64) -> BookApply {
        if trade.size < Decimal::ZERO
            || trade.price < Decimal::ZERO
            || trade.price > Decimal::ONE
        {
            return BookApply::Invalid;
        }
        self.last_update_ts_ms = trade.ts_ms;
        self.last_local_ts_ms = local_ts_ms;
        self.last_trade = Some(trade.clone());
        BookApply::Applied
    }

    fn refresh_crossed(&mut self) {
        let crossed = match (self.best_bid(), self.best_ask()) {
            (Some(b), Some(a)) => b >= a,
            _ => false,
        };
        self.crossed = crossed;
        if crossed {
            // Quoting stays suspended until a fresh, uncrossed snapshot.
            self.synced = false;
        }
    }
}

fn levels_valid(levels: &[(Decimal, Decimal)]) -> bool {
    levels.iter().all(|&(p, s)| {
        p >= Decimal::ZERO && p <= Decimal::ONE && s >= Decimal::ZERO
    })
}

fn upsert_level(levels: &mut Vec<(Decimal, Decimal)>, price: Decimal, size: Decimal, descending: bool) {
    if size.is_zero() {
        levels.retain(|(p, _)| *p != price);
        return;
    }
    if let Some(level) = levels.iter_mut().find(|(p, _)| *p == price) {
        level.1 = size;
        return;
    }
    let pos = levels
        .iter()
        .position(|(p, _)| if descending { *p < price } else { *p > price })
        .unwrap_or(levels.len());
    levels.insert(pos, (price, size));
}

/// Round to the nearest multiple of `tick`. Identity when `tick` is zero.
pub fn round_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    (price / tick).round() * tick
}

/// Valid order price: strictly inside (0, 1) and on the tick grid.
pub fn price_on_grid(price: Decimal, tick: Decimal) -> bool {
    if price <= Decimal::ZERO || price >= Decimal::ONE {
        return false;
    }
    if tick <= Decimal::ZERO {
        return true;
    }
    (price % tick).is_zero()
}
