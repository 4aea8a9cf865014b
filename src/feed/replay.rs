//! Backtest tape reader: replaces the live feed with persisted tape rows,
//! replayed in `local_ts` order at a configurable multiple of wall-clock.
//! Every other component behaves identically to paper mode.

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::StorageError;
use crate::storage::Store;
use crate::types::{
    EngineEvent, FeedUpdate, WatchlistDiff, WatchlistEntry, WatchlistUpdate,
};

/// Replay the recorded tape into the engine channel. Returns the number of
/// events emitted on clean EOF; dropping the sender afterwards lets the
/// scheduler drain and exit with code 0.
pub async fn replay_task(
    config: Config,
    engine_tx: mpsc::Sender<EngineEvent>,
) -> Result<u64, StorageError> {
    let store = Store::open(&config.sqlite_path)?;

    // Seed the scheduler with the recorded market set so tick sizes and
    // event groupings match the original session.
    let markets = store.load_markets()?;
    let entries: Vec<WatchlistEntry> = markets
        .iter()
        .enumerate()
        .map(|(rank, meta)| WatchlistEntry {
            market_id: meta.market_id.clone(),
            score: 0.0,
            rank,
            eligible_until_ms: i64::MAX,
        })
        .collect();
    let seeded = EngineEvent::Watchlist(WatchlistUpdate {
        entries,
        diff: WatchlistDiff::default(),
        markets,
        degraded: false,
        consecutive_failures: 0,
        generated_ms: 0,
    });
    if engine_tx.send(seeded).await.is_err() {
        return Ok(0);
    }

    let rows = store.read_tape(config.backtest_start_ts, config.backtest_end_ts)?;
    info!(
        component = "replay",
        event = "starting",
        rows = rows.len(),
        speed = config.backtest_speed,
    );

    let mut emitted: u64 = 0;
    let mut malformed: u64 = 0;
    let mut prev_ts: Option<i64> = None;

    for row in rows {
        // Pace against recorded inter-event gaps when a speed is set;
        // speed 0 replays as fast as the scheduler can drain.
        if config.backtest_speed > 0.0 {
            if let Some(prev) = prev_ts {
                let gap_ms = (row.local_ts_ms - prev).max(0) as f64 / config.backtest_speed;
                if gap_ms >= 1.0 {
                    tokio::time::sleep(tokio::time::Duration::from_millis(gap_ms as u64)).await;
                }
            }
        }
        prev_ts = Some(row.local_ts_ms);

        let event = match row.decode() {
            Ok(event) => event,
            Err(e) => {
                malformed += 1;
                if malformed == 1 {
                    warn!(component = "replay", event = "malformed_row", error = %e);
                }
                continue;
            }
        };

        let update = FeedUpdate {
            market_id: row.market_id,
            event,
            source_ts_ms: row.source_ts_ms,
            local_ts_ms: row.local_ts_ms,
        };
        if engine_tx.send(EngineEvent::Tape(update)).await.is_err() {
            return Ok(emitted);
        }
        emitted += 1;
    }

    info!(
        component = "replay",
        event = "eof",
        emitted,
        malformed,
    );
    Ok(emitted)
}
