//! Live market-data feed: one WebSocket task per watchlisted market,
//! normalizing upstream messages into `TapeEvent`s on the merged engine
//! channel. Reconnects with backoff; the book resyncs from the snapshot
//! that every (re)subscribe produces.

pub mod replay;

use std::collections::HashSet;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{error, info, warn};

use crate::types::{
    BookDelta, BookSnapshot, EngineEvent, FeedUpdate, Side, TapeEvent, TradePrint,
};

/// Per-market feed task. Owns no shared state; only a channel sender.
pub async fn market_feed(
    market_id: String,
    ws_url: String,
    engine_tx: mpsc::Sender<EngineEvent>,
    net_timeout_secs: u64,
    n_permanent_attempts: u32,
) {
    let mut backoff_ms: u64 = 1_000;
    let mut consecutive_failures: u32 = 0;
    // Malformed payloads log once per kind, then only count.
    let mut logged_bad_kinds: HashSet<String> = HashSet::new();
    let mut dropped_deltas: u64 = 0;

    loop {
        let connect = tokio::time::timeout(
            std::time::Duration::from_secs(net_timeout_secs),
            connect_async(&ws_url),
        )
        .await;

        let ws = match connect {
            Ok(Ok((ws, _))) => {
                info!(component = "feed", event = "connected", market_id = %market_id);
                consecutive_failures = 0;
                backoff_ms = 1_000;
                ws
            }
            other => {
                consecutive_failures += 1;
                warn!(
                    component = "feed",
                    event = "connect_failed",
                    market_id = %market_id,
                    attempt = consecutive_failures,
                    timed_out = matches!(other, Err(_)),
                );
                if consecutive_failures > n_permanent_attempts {
                    error!(
                        component = "feed",
                        event = "permanent_failure",
                        market_id = %market_id,
                        attempts = consecutive_failures,
                    );
                    return;
                }
                sleep_with_jitter(backoff_ms).await;
                backoff_ms = (backoff_ms * 2).min(30_000);
                continue;
            }
        };

        let (mut write, mut read) = ws.split();
        let sub = serde_json::json!({
            "assets_ids": [&market_id],
            "type": "market",
        });
        if let Err(e) = write.send(Message::Text(sub.to_string())).await {
            warn!(component = "feed", event = "subscribe_failed", market_id = %market_id, error = %e);
            continue;
        }

        let mut ping_interval =
            tokio::time::interval(tokio::time::Duration::from_secs(10));
        let read_deadline = std::time::Duration::from_secs(net_timeout_secs);

        loop {
            tokio::select! {
                msg = tokio::time::timeout(read_deadline, read.next()) => {
                    let msg = match msg {
                        Err(_) => {
                            warn!(component = "feed", event = "read_inactivity", market_id = %market_id);
                            break;
                        }
                        Ok(Some(Ok(m))) => m,
                        Ok(Some(Err(e))) => {
                            warn!(component = "feed", event = "ws_error", market_id = %market_id, error = %e);
                            break;
                        }
                        Ok(None) => {
                            warn!(component = "feed", event = "stream_ended", market_id = %market_id);
                            break;
                        }
                    };

                    if let Message::Text(text) = msg {
                        let local_ts_ms = chrono::Utc::now().timestamp_millis();
                        let parsed = parse_ws_message(&text, local_ts_ms);
                        if parsed.is_empty() && looks_like_event(&text) {
                            let kind = event_kind_of(&text);
                            if logged_bad_kinds.insert(kind.clone()) {
                                error!(
                                    component = "feed",
                                    event = "malformed_payload",
                                    market_id = %market_id,
                                    kind = %kind,
                                );
                            }
                        }
                        for (event, source_ts_ms) in parsed {
                            let update = FeedUpdate {
                                market_id: market_id.clone(),
                                event,
                                source_ts_ms,
                                local_ts_ms,
                            };
                            if !forward(&engine_tx, update, &mut dropped_deltas).await {
                                return;
                            }
                        }
                    }
                }
                _ = ping_interval.tick() => {
                    let _ = write.send(Message::Ping(Vec::new())).await;
                }
            }
        }

        warn!(
            component = "feed",
            event = "reconnecting",
            market_id = %market_id,
            backoff_ms,
            dropped_deltas,
        );
        sleep_with_jitter(backoff_ms).await;
        backoff_ms = (backoff_ms * 2).min(30_000);
    }
}

/// Channel policy: trades and snapshots are never dropped (they can trigger
/// fills / resyncs); deltas are droppable, the next snapshot repairs the
/// book.
async fn forward(
    engine_tx: &mpsc::Sender<EngineEvent>,
    update: FeedUpdate,
    dropped_deltas: &mut u64,
) -> bool {
    match update.event {
        TapeEvent::Delta(_) => match engine_tx.try_send(EngineEvent::Tape(update)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                *dropped_deltas += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        },
        _ => engine_tx.send(EngineEvent::Tape(update)).await.is_ok(),
    }
}

async fn sleep_with_jitter(base_ms: u64) {
    let jitter = rand::thread_rng().gen_range(0.9..1.1);
    let ms = ((base_ms as f64) * jitter) as u64;
    tokio::time::sleep(tokio::time::Duration::from_millis(ms)).await;
}

// ─── Message normalization ───

/// Parse one upstream text frame into tape events. Frames may carry one
/// object or an array; unknown kinds yield nothing.
pub fn parse_ws_message(text: &str, fallback_ts_ms: i64) -> Vec<(TapeEvent, i64)> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    let events: Vec<&serde_json::Value> = if let Some(arr) = value.as_array() {
        arr.iter().collect()
    } else {
        vec![&value]
    };

    let mut out = Vec::new();
    for event in events {
        let kind = event
            .get("event_type")
            .and_then(|k| k.as_str())
            .unwrap_or("");
        let source_ts = event
            .get("timestamp")
            .and_then(parse_ts)
            .unwrap_or(fallback_ts_ms);

        match kind {
            "book" => {
                if let Some(snap) = parse_book(event) {
                    out.push((TapeEvent::Snapshot(snap), source_ts));
                }
            }
            "price_change" => {
                if let Some(delta) = parse_price_change(event) {
                    out.push((TapeEvent::Delta(delta), source_ts));
                }
            }
            "last_trade_price" | "trade" => {
                if let Some(trade) = parse_trade(event, source_ts) {
                    out.push((TapeEvent::Trade(trade), source_ts));
                }
            }
            _ => {}
        }
    }
    out
}

fn parse_ts(v: &serde_json::Value) -> Option<i64> {
    v.as_i64().or_else(|| v.as_str()?.parse().ok())
}

fn parse_dec(v: &serde_json::Value) -> Option<Decimal> {
    if let Some(s) = v.as_str() {
        return s.parse().ok();
    }
    v.as_f64().and_then(Decimal::from_f64_retain)
}

fn parse_levels(v: Option<&serde_json::Value>) -> Vec<(Decimal, Decimal)> {
    let Some(arr) = v.and_then(|v| v.as_array()) else {
        return Vec::new();
    };
    arr.iter()
        .filter_map(|level| {
            let price = parse_dec(level.get("price")?)?;
            let size = parse_dec(level.get("size")?)?;
            Some((price, size))
        })
        .collect()
}

fn parse_book(event: &serde_json::Value) -> Option<BookSnapshot> {
    let bids = parse_levels(event.get("bids").or_else(|| event.get("buys")));
    let asks = parse_levels(event.get("asks").or_else(|| event.get("sells")));
    if bids.is_empty() && asks.is_empty() {
        return None;
    }
    Some(BookSnapshot {
        bids,
        asks,
        seq: event.get("seq").and_then(|s| s.as_u64()),
    })
}

fn parse_price_change(event: &serde_json::Value) -> Option<BookDelta> {
    let mut delta = BookDelta {
        bids_changed: Vec::new(),
        asks_changed: Vec::new(),
        seq: event.get("seq").and_then(|s| s.as_u64()),
    };

    // Either a batched {"changes": [...]} or a single flat change.
    let changes: Vec<&serde_json::Value> = match event.get("changes").and_then(|c| c.as_array()) {
        Some(arr) => arr.iter().collect(),
        None => vec![event],
    };
    for change in changes {
        let price = change.get("price").and_then(parse_dec)?;
        let size = change.get("size").and_then(parse_dec)?;
        match change.get("side").and_then(|s| s.as_str()) {
            Some("BUY") | Some("buy") => delta.bids_changed.push((price, size)),
            Some("SELL") | Some("sell") => delta.asks_changed.push((price, size)),
            _ => return None,
        }
    }
    if delta.bids_changed.is_empty() && delta.asks_changed.is_empty() {
        return None;
    }
    Some(delta)
}

fn parse_trade(event: &serde_json::Value, ts_ms: i64) -> Option<TradePrint> {
    let price = event.get("price").and_then(parse_dec)?;
    let size = event
        .get("size")
        .and_then(parse_dec)
        .unwrap_or(Decimal::ZERO);
    let side = match event.get("side").and_then(|s| s.as_str()) {
        Some("BUY") | Some("buy") => Side::Buy,
        _ => Side::Sell,
    };
    Some(TradePrint {
        price,
        size,
        side,
        ts_ms,
    })
}

fn looks_like_event(text: &str) -> bool {
    text.contains("event_type")
}

fn event_kind_of(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| {
            let v = if v.is_array() { v.get(0).cloned()? } else { v };
            v.get("event_type")?.as_str().map(str::to_string)
        })
        .unwrap_or_else(|| "unknown".to_string())
}
