use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ─── Sides & order lifecycle ───

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "buy" => Some(Side::Buy),
            "sell" => Some(Side::Sell),
            _ => None,
        }
    }

    /// +1 for buys, -1 for sells. Fill sizes are multiplied by this to get
    /// the signed position change.
    #[inline]
    pub fn sign(&self) -> Decimal {
        match self {
            Side::Buy => Decimal::ONE,
            Side::Sell => -Decimal::ONE,
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Partial,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Open => "open",
            OrderStatus::Partial => "partial",
            OrderStatus::Filled => "filled",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(OrderStatus::Open),
            "partial" => Some(OrderStatus::Partial),
            "filled" => Some(OrderStatus::Filled),
            "cancelled" => Some(OrderStatus::Cancelled),
            "rejected" => Some(OrderStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeInForce {
    /// Rest until filled or cancelled.
    Gtc,
    /// Fill what crosses at placement, cancel the rest.
    Ioc,
}

impl TimeInForce {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeInForce::Gtc => "gtc",
            TimeInForce::Ioc => "ioc",
        }
    }
}

// ─── Market metadata ───

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketStatus {
    Open,
    Closed,
}

impl MarketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketStatus::Open => "open",
            MarketStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(MarketStatus::Open),
            "closed" => Some(MarketStatus::Closed),
            _ => None,
        }
    }
}

/// Immutable once observed. Closed markets are retained for bookkeeping but
/// never re-enter the watchlist.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MarketMeta {
    pub market_id: String,
    /// Groups related binary markets for aggregate exposure limits.
    pub event_id: String,
    pub tick_size: Decimal,
    pub min_size: Decimal,
    pub status: MarketStatus,
}

// ─── Tape events (produced by Feed / replay, consumed by the scheduler) ───

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BookSnapshot {
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
    pub seq: Option<u64>,
}

/// Changed levels only; a size of zero removes the level.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BookDelta {
    pub bids_changed: Vec<(Decimal, Decimal)>,
    pub asks_changed: Vec<(Decimal, Decimal)>,
    pub seq: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TradePrint {
    pub price: Decimal,
    pub size: Decimal,
    pub side: Side,
    pub ts_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TapeEvent {
    Snapshot(BookSnapshot),
    Delta(BookDelta),
    Trade(TradePrint),
}

impl TapeEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            TapeEvent::Snapshot(_) => "snapshot",
            TapeEvent::Delta(_) => "delta",
            TapeEvent::Trade(_) => "trade",
        }
    }
}

/// One normalized feed update: a tape event plus its timestamps.
/// `feed_lag_ms = local_ts_ms - source_ts_ms`.
#[derive(Clone, Debug)]
pub struct FeedUpdate {
    pub market_id: String,
    pub event: TapeEvent,
    pub source_ts_ms: i64,
    pub local_ts_ms: i64,
}

// ─── Watchlist ───

#[derive(Clone, Debug)]
pub struct WatchlistEntry {
    pub market_id: String,
    pub score: f64,
    pub rank: usize,
    pub eligible_until_ms: i64,
}

#[derive(Clone, Debug, Default)]
pub struct WatchlistDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub reranked: Vec<String>,
}

impl WatchlistDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.reranked.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct WatchlistUpdate {
    pub entries: Vec<WatchlistEntry>,
    pub diff: WatchlistDiff,
    /// Metadata for every market on the new watchlist.
    pub markets: Vec<MarketMeta>,
    /// True when the selector is serving a stale watchlist after repeated
    /// fetch failures.
    pub degraded: bool,
    pub consecutive_failures: u32,
    pub generated_ms: i64,
}

// ─── Merged scheduler channel ───

pub enum EngineEvent {
    Tape(FeedUpdate),
    Watchlist(WatchlistUpdate),
    Tick,
}

// ─── Orders, fills, intents ───

#[derive(Clone, Debug)]
pub struct Order {
    pub order_id: u64,
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub status: OrderStatus,
    pub tif: TimeInForce,
    pub strategy: &'static str,
    pub created_ts_ms: i64,
    pub rested_since_ms: i64,
    pub filled_size: Decimal,
    pub avg_fill_price: Decimal,
    pub reason: Option<String>,
}

impl Order {
    #[inline]
    pub fn remaining(&self) -> Decimal {
        self.size - self.filled_size
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        matches!(self.status, OrderStatus::Open | OrderStatus::Partial)
    }
}

#[derive(Clone, Debug)]
pub struct Fill {
    pub fill_id: u64,
    pub order_id: u64,
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub ts_ms: i64,
    pub fees: Decimal,
}

/// A placement request, before the broker assigns an order id.
#[derive(Clone, Debug)]
pub struct PlaceOrder {
    pub market_id: String,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub tif: TimeInForce,
    pub strategy: &'static str,
    /// Set on flatten/unwind placements: exempt from the daily-loss gate
    /// as long as the order strictly reduces |net_size|.
    pub reduce_only: bool,
}

#[derive(Clone, Debug)]
pub enum QuoteIntent {
    Place(PlaceOrder),
    Cancel {
        market_id: String,
        order_id: u64,
    },
    Replace {
        market_id: String,
        order_id: u64,
        new_price: Decimal,
        new_size: Decimal,
    },
}

impl QuoteIntent {
    pub fn market_id(&self) -> &str {
        match self {
            QuoteIntent::Place(p) => &p.market_id,
            QuoteIntent::Cancel { market_id, .. } => market_id,
            QuoteIntent::Replace { market_id, .. } => market_id,
        }
    }

    /// Cancels pass every risk rule; placements (and the place half of a
    /// replace) are gated.
    pub fn is_cancel(&self) -> bool {
        matches!(self, QuoteIntent::Cancel { .. })
    }
}

/// Cheap read-only copy handed to strategies. Strategies never see the
/// owning `Portfolio`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PositionSnapshot {
    pub net_size: Decimal,
    pub avg_price: Decimal,
}

/// Read-only view of a resting order, for cancel/replace decisions.
#[derive(Clone, Debug)]
pub struct OrderView {
    pub order_id: u64,
    pub side: Side,
    pub price: Decimal,
    pub size: Decimal,
    pub rested_since_ms: i64,
    pub strategy: &'static str,
}

// ─── PnL snapshots ───

#[derive(Clone, Debug)]
pub struct PnlSnapshot {
    pub ts_ms: i64,
    pub unrealized: Decimal,
    pub realized: Decimal,
    pub open_markets: usize,
}
