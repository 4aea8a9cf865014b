//! SQLite persistence. The store is touched only by the writer task (and by
//! startup restore / the backtest tape reader); the scheduler posts
//! messages. Order/fill/position writes are acknowledged and retried until
//! they land; tape writes are best-effort and dropped under saturation.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::error::StorageError;
use crate::portfolio::Position;
use crate::types::{
    Fill, MarketMeta, MarketStatus, Order, OrderStatus, PnlSnapshot, Side, TapeEvent,
    TimeInForce,
};

// All numeric columns are decimal strings: no floating-point drift across
// persist/replay cycles.
const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS markets (
    market_id   TEXT PRIMARY KEY,
    event_id    TEXT NOT NULL,
    tick_size   TEXT NOT NULL,
    min_size    TEXT NOT NULL,
    status      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tape (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    market_id   TEXT NOT NULL,
    local_ts    INTEGER NOT NULL,
    source_ts   INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    payload     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_tape_replay ON tape(local_ts, id);

CREATE TABLE IF NOT EXISTS orders (
    order_id        INTEGER PRIMARY KEY,
    market_id       TEXT NOT NULL,
    side            TEXT NOT NULL,
    price           TEXT NOT NULL,
    size            TEXT NOT NULL,
    status          TEXT NOT NULL,
    created_ts      INTEGER NOT NULL,
    rested_since_ts INTEGER NOT NULL,
    filled_size     TEXT NOT NULL,
    avg_fill_price  TEXT NOT NULL,
    reason          TEXT
);

CREATE TABLE IF NOT EXISTS fills (
    fill_id     INTEGER PRIMARY KEY,
    order_id    INTEGER NOT NULL,
    market_id   TEXT NOT NULL,
    side        TEXT NOT NULL,
    price       TEXT NOT NULL,
    size        TEXT NOT NULL,
    ts          INTEGER NOT NULL,
    fees        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS positions (
    market_id    TEXT PRIMARY KEY,
    net_size     TEXT NOT NULL,
    avg_price    TEXT NOT NULL,
    realized_pnl TEXT NOT NULL,
    updated_ts   INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS pnl (
    ts           INTEGER PRIMARY KEY,
    unrealized   TEXT NOT NULL,
    realized     TEXT NOT NULL,
    open_markets INTEGER NOT NULL
);
"#;

/// One persisted tape row. `id` is assigned by SQLite on insert.
#[derive(Clone, Debug)]
pub struct TapeRow {
    pub id: i64,
    pub market_id: String,
    pub local_ts_ms: i64,
    pub source_ts_ms: i64,
    pub kind: String,
    pub payload: String,
}

impl TapeRow {
    pub fn from_event(
        market_id: &str,
        event: &TapeEvent,
        source_ts_ms: i64,
        local_ts_ms: i64,
    ) -> Self {
        Self {
            id: 0,
            market_id: market_id.to_string(),
            local_ts_ms,
            source_ts_ms,
            kind: event.kind().to_string(),
            payload: serde_json::to_string(event).unwrap_or_default(),
        }
    }

    pub fn decode(&self) -> Result<TapeEvent, StorageError> {
        serde_json::from_str(&self.payload).map_err(|e| StorageError::Malformed {
            table: "tape",
            detail: format!("row {}: {e}", self.id),
        })
    }
}

// The connection sits behind a mutex so Store is Sync and the writer task
// future stays Send; contention is nil (one writer, startup restore, and
// the replay reader each use their own Store).
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self, StorageError> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| StorageError::Malformed {
                    table: "markets",
                    detail: format!("cannot create {}: {e}", parent.display()),
                })?;
            }
        }
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let conn = Connection::open_with_flags(db_path, flags)?;
        conn.execute_batch(SCHEMA)?;
        info!(component = "storage", event = "opened", path = db_path);
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // ─── Writes ───

    pub fn begin(&self) -> Result<(), StorageError> {
        self.conn.lock().execute_batch("BEGIN")?;
        Ok(())
    }

    pub fn commit(&self) -> Result<(), StorageError> {
        self.conn.lock().execute_batch("COMMIT")?;
        Ok(())
    }

    pub fn upsert_market(&self, meta: &MarketMeta) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "INSERT INTO markets (market_id, event_id, tick_size, min_size, status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(market_id) DO UPDATE SET status = excluded.status",
            params![
                meta.market_id,
                meta.event_id,
                meta.tick_size.to_string(),
                meta.min_size.to_string(),
                meta.status.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn insert_tape(&self, row: &TapeRow) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "INSERT INTO tape (market_id, local_ts, source_ts, kind, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                row.market_id,
                row.local_ts_ms,
                row.source_ts_ms,
                row.kind,
                row.payload,
            ],
        )?;
        Ok(())
    }

    /// Insert-or-replace: orders are written on placement and on every
    /// status transition.
    pub fn upsert_order(&self, order: &Order) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO orders
             (order_id, market_id, side, price, size, status, created_ts,
              rested_since_ts, filled_size, avg_fill_price, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                order.order_id as i64,
                order.market_id,
                order.side.as_str(),
                order.price.to_string(),
                order.size.to_string(),
                order.status.as_str(),
                order.created_ts_ms,
                order.rested_since_ms,
                order.filled_size.to_string(),
                order.avg_fill_price.to_string(),
                order.reason,
            ],
        )?;
        Ok(())
    }

    pub fn insert_fill(&self, fill: &Fill) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "INSERT OR IGNORE INTO fills
             (fill_id, order_id, market_id, side, price, size, ts, fees)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fill.fill_id as i64,
                fill.order_id as i64,
                fill.market_id,
                fill.side.as_str(),
                fill.price.to_string(),
                fill.size.to_string(),
                fill.ts_ms,
                fill.fees.to_string(),
            ],
        )?;
        Ok(())
    }

    pub fn upsert_position(&self, pos: &Position) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO positions
             (market_id, net_size, avg_price, realized_pnl, updated_ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pos.market_id,
                pos.net_size.to_string(),
                pos.avg_price.to_string(),
                pos.realized_pnl.to_string(),
                pos.updated_ms,
            ],
        )?;
        Ok(())
    }

    pub fn insert_pnl(&self, snap: &PnlSnapshot) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO pnl (ts, unrealized, realized, open_markets)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                snap.ts_ms,
                snap.unrealized.to_string(),
                snap.realized.to_string(),
                snap.open_markets as i64,
            ],
        )?;
        Ok(())
    }

    /// PAPER_RESET_ON_START=true: close out any leftover open paper orders
    /// and clear positions for a fresh session.
    pub fn wipe_paper_state(&self) -> Result<(), StorageError> {
        self.conn.lock().execute(
            "UPDATE orders SET status = 'cancelled', reason = 'reset_on_start'
             WHERE status IN ('open', 'partial')",
            [],
        )?;
        self.conn.lock().execute("DELETE FROM positions", [])?;
        Ok(())
    }

    // ─── Reads ───

    pub fn load_open_orders(&self) -> Result<Vec<Order>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT order_id, market_id, side, price, size, status, created_ts,
                    rested_since_ts, filled_size, avg_fill_price, reason
             FROM orders WHERE status IN ('open', 'partial') ORDER BY order_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, String>(9)?,
                row.get::<_, Option<String>>(10)?,
            ))
        })?;

        let mut orders = Vec::new();
        for row in rows {
            let (id, market_id, side, price, size, status, created, rested, filled, avg, reason) =
                row?;
            orders.push(Order {
                order_id: id as u64,
                market_id,
                side: Side::parse(&side).ok_or_else(|| malformed("orders", &side))?,
                price: parse_dec("orders", &price)?,
                size: parse_dec("orders", &size)?,
                status: OrderStatus::parse(&status).ok_or_else(|| malformed("orders", &status))?,
                // Only GTC orders ever rest, so restored rows are GTC.
                tif: TimeInForce::Gtc,
                strategy: "restored",
                created_ts_ms: created,
                rested_since_ms: rested,
                filled_size: parse_dec("orders", &filled)?,
                avg_fill_price: parse_dec("orders", &avg)?,
                reason,
            });
        }
        Ok(orders)
    }

    pub fn load_positions(&self) -> Result<Vec<Position>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT market_id, net_size, avg_price, realized_pnl, updated_ts
             FROM positions ORDER BY market_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut positions = Vec::new();
        for row in rows {
            let (market_id, net, avg, realized, updated) = row?;
            positions.push(Position {
                market_id,
                net_size: parse_dec("positions", &net)?,
                avg_price: parse_dec("positions", &avg)?,
                realized_pnl: parse_dec("positions", &realized)?,
                opened_ms: updated,
                updated_ms: updated,
            });
        }
        Ok(positions)
    }

    pub fn load_markets(&self) -> Result<Vec<MarketMeta>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT market_id, event_id, tick_size, min_size, status FROM markets",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut metas = Vec::new();
        for row in rows {
            let (market_id, event_id, tick, min, status) = row?;
            metas.push(MarketMeta {
                market_id,
                event_id,
                tick_size: parse_dec("markets", &tick)?,
                min_size: parse_dec("markets", &min)?,
                status: MarketStatus::parse(&status).ok_or_else(|| malformed("markets", &status))?,
            });
        }
        Ok(metas)
    }

    pub fn load_fills(&self) -> Result<Vec<Fill>, StorageError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT fill_id, order_id, market_id, side, price, size, ts, fees
             FROM fills ORDER BY fill_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i64>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;
        let mut fills = Vec::new();
        for row in rows {
            let (fill_id, order_id, market_id, side, price, size, ts, fees) = row?;
            fills.push(Fill {
                fill_id: fill_id as u64,
                order_id: order_id as u64,
                market_id,
                side: Side::parse(&side).ok_or_else(|| malformed("fills", &side))?,
                price: parse_dec("fills", &price)?,
                size: parse_dec("fills", &size)?,
                ts_ms: ts,
                fees: parse_dec("fills", &fees)?,
            });
        }
        Ok(fills)
    }

    pub fn max_fill_id(&self) -> Result<u64, StorageError> {
        let id: Option<i64> =
            self.conn
                .lock()
                .query_row("SELECT MAX(fill_id) FROM fills", [], |r| r.get(0))?;
        Ok(id.unwrap_or(0) as u64)
    }

    /// Tape rows in replay order (local_ts, then insert id), optionally
    /// bounded to [start, end] on local_ts.
    pub fn read_tape(
        &self,
        start_ts: Option<i64>,
        end_ts: Option<i64>,
    ) -> Result<Vec<TapeRow>, StorageError> {
        let lo = start_ts.unwrap_or(i64::MIN);
        let hi = end_ts.unwrap_or(i64::MAX);
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, market_id, local_ts, source_ts, kind, payload
             FROM tape WHERE local_ts >= ?1 AND local_ts <= ?2
             ORDER BY local_ts, id",
        )?;
        let rows = stmt.query_map(params![lo, hi], |row| {
            Ok(TapeRow {
                id: row.get(0)?,
                market_id: row.get(1)?,
                local_ts_ms: row.get(2)?,
                source_ts_ms: row.get(3)?,
                kind: row.get(4)?,
                payload: row.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn malformed(table: &'static str, detail: &str) -> StorageError {
    StorageError::Malformed {
        table,
        detail: detail.to_string(),
    }
}

fn parse_dec(table: &'static str, s: &str) -> Result<Decimal, StorageError> {
    s.parse().map_err(|_| malformed(table, s))
}

// ─── Writer task ───

pub enum StoreMsg {
    Tape(TapeRow),
    Market(MarketMeta),
    Order(Order),
    Fill(Fill),
    Position(Position),
    Pnl(PnlSnapshot),
}

impl StoreMsg {
    fn is_tape(&self) -> bool {
        matches!(self, StoreMsg::Tape(_))
    }
}

/// Cloneable handle the scheduler and feed tasks write through.
#[derive(Clone)]
pub struct StorageHandle {
    tx: mpsc::Sender<StoreMsg>,
    dropped_tape: Arc<AtomicU64>,
}

impl StorageHandle {
    /// Best-effort tape write: dropped (and counted) on queue saturation.
    pub fn send_tape(&self, row: TapeRow) {
        if self.tx.try_send(StoreMsg::Tape(row)).is_err() {
            self.dropped_tape.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Acknowledged write path for orders/fills/positions/pnl: waits for
    /// queue room rather than dropping.
    pub async fn send_critical(&self, msg: StoreMsg) {
        if self.tx.send(msg).await.is_err() {
            error!(component = "storage", event = "writer_gone");
        }
    }

    pub fn dropped_tape(&self) -> u64 {
        self.dropped_tape.load(Ordering::Relaxed)
    }
}

/// Spawn the single writer task. Returns the handle plus the join handle;
/// the writer drains its queue and exits when every sender is dropped.
pub fn spawn_writer(
    store: Store,
    queue: usize,
) -> (StorageHandle, tokio::task::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(queue);
    let handle = StorageHandle {
        tx,
        dropped_tape: Arc::new(AtomicU64::new(0)),
    };
    let join = tokio::spawn(storage_writer(rx, store));
    (handle, join)
}

const BATCH_MAX: usize = 256;

// The rusqlite connection is Send but not Sync, so every store touch below
// is a synchronous call between await points; the future only ever owns
// the Store, never a reference across an await.
async fn storage_writer(mut rx: mpsc::Receiver<StoreMsg>, store: Store) {
    let mut batch: Vec<StoreMsg> = Vec::with_capacity(BATCH_MAX);

    while let Some(first) = rx.recv().await {
        batch.push(first);
        while batch.len() < BATCH_MAX {
            match rx.try_recv() {
                Ok(msg) => batch.push(msg),
                Err(_) => break,
            }
        }
        let failed = write_batch(&store, &mut batch);
        retry_until_landed(&store, failed).await;
    }

    // Channel closed: drain whatever is left before exiting.
    while let Ok(msg) = rx.try_recv() {
        batch.push(msg);
    }
    if !batch.is_empty() {
        let failed = write_batch(&store, &mut batch);
        retry_until_landed(&store, failed).await;
    }
    info!(component = "storage", event = "writer_stopped");
}

/// One transactional pass over the batch. Tape failures are dropped (best
/// effort); critical rows come back for retry.
fn write_batch(store: &Store, batch: &mut Vec<StoreMsg>) -> Vec<StoreMsg> {
    let _ = store.begin();
    let mut failed: Vec<StoreMsg> = Vec::new();
    for msg in batch.drain(..) {
        if let Err(e) = write_one(store, &msg) {
            if msg.is_tape() {
                warn!(component = "storage", event = "tape_write_failed", error = %e);
            } else {
                failed.push(msg);
            }
        }
    }
    let _ = store.commit();
    failed
}

/// Order/fill/position writes retry indefinitely with backoff; shutdown
/// blocks until they land.
async fn retry_until_landed(store: &Store, mut failed: Vec<StoreMsg>) {
    let mut backoff_ms: u64 = 100;
    while !failed.is_empty() {
        warn!(
            component = "storage",
            event = "retrying_critical_writes",
            pending = failed.len(),
            backoff_ms,
        );
        tokio::time::sleep(tokio::time::Duration::from_millis(backoff_ms)).await;
        backoff_ms = (backoff_ms * 2).min(5_000);

        let _ = store.begin();
        let mut still_failed = Vec::new();
        for msg in failed.drain(..) {
            if write_one(store, &msg).is_err() {
                still_failed.push(msg);
            }
        }
        let _ = store.commit();
        failed = still_failed;
    }
}

fn write_one(store: &Store, msg: &StoreMsg) -> Result<(), StorageError> {
    match msg {
        StoreMsg::Tape(row) => store.insert_tape(row),
        StoreMsg::Market(meta) => store.upsert_market(meta),
        StoreMsg::Order(order) => store.upsert_order(order),
        StoreMsg::Fill(fill) => store.insert_fill(fill),
        StoreMsg::Position(pos) => store.upsert_position(pos),
        StoreMsg::Pnl(snap) => store.insert_pnl(snap),
    }
}
