//! Dynamic market selector: fetch metadata, score eligibility, publish a
//! ranked top-N watchlist. Failures serve the last good list and never
//! block the scheduler.

use std::collections::HashMap;

use rand::Rng;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::SelectorError;
use crate::types::{
    EngineEvent, MarketMeta, MarketStatus, WatchlistDiff, WatchlistEntry, WatchlistUpdate,
};

/// Threshold metrics for one market, as reported by the metadata API.
#[derive(Clone, Debug)]
pub struct MarketMetrics {
    pub meta: MarketMeta,
    pub volume_24h_usd: f64,
    pub liquidity_usd: f64,
    pub spread_bps: f64,
    pub updates_per_min: f64,
}

pub struct MarketSelector {
    config: Config,
    /// Last published list, served while fetches fail.
    previous: Vec<WatchlistEntry>,
    /// Consecutive threshold misses per watchlisted market; two in a row
    /// drops the market.
    miss_counts: HashMap<String, u32>,
    pub consecutive_failures: u32,
}

impl MarketSelector {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            previous: Vec::new(),
            miss_counts: HashMap::new(),
            consecutive_failures: 0,
        }
    }

    /// One selector tick from already-fetched metrics. Pure given its
    /// inputs; idempotent per tick.
    pub fn build_watchlist(&mut self, metrics: Vec<MarketMetrics>, now_ms: i64) -> WatchlistUpdate {
        self.consecutive_failures = 0;
        let config = &self.config;
        let on_previous: HashMap<&str, usize> = self
            .previous
            .iter()
            .map(|e| (e.market_id.as_str(), e.rank))
            .collect();

        let mut scored: Vec<(String, f64, MarketMeta)> = Vec::new();
        for m in &metrics {
            if m.meta.status == MarketStatus::Closed {
                continue;
            }
            let passes = m.volume_24h_usd >= config.min_24h_volume_usd
                && m.liquidity_usd >= config.min_liquidity_usd
                && m.spread_bps >= config.min_spread_bps
                && m.updates_per_min >= config.min_updates_min;

            if passes {
                self.miss_counts.remove(&m.meta.market_id);
            } else if on_previous.contains_key(m.meta.market_id.as_str()) {
                // Grace period: drop only after two consecutive misses.
                let misses = self.miss_counts.entry(m.meta.market_id.clone()).or_insert(0);
                *misses += 1;
                if *misses >= 2 {
                    continue;
                }
            } else {
                continue;
            }

            let score = config.score_w_volume * m.volume_24h_usd.max(1.0).ln()
                + config.score_w_liquidity * m.liquidity_usd.max(1.0).ln()
                + config.score_w_spread * m.spread_bps
                + config.score_w_updates * m.updates_per_min;
            scored.push((m.meta.market_id.clone(), score, m.meta.clone()));
        }

        // Rank by score; market_id lexicographic order breaks ties so the
        // list is deterministic.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(config.top_n_markets);

        let eligible_until_ms = now_ms + 2 * config.selector_interval_secs as i64 * 1_000;
        let entries: Vec<WatchlistEntry> = scored
            .iter()
            .enumerate()
            .map(|(rank, (market_id, score, _))| WatchlistEntry {
                market_id: market_id.clone(),
                score: *score,
                rank,
                eligible_until_ms,
            })
            .collect();
        let markets: Vec<MarketMeta> = scored.into_iter().map(|(_, _, meta)| meta).collect();

        let diff = diff_watchlists(&self.previous, &entries);
        self.miss_counts
            .retain(|id, _| entries.iter().any(|e| &e.market_id == id));
        self.previous = entries.clone();

        WatchlistUpdate {
            entries,
            diff,
            markets,
            degraded: false,
            consecutive_failures: 0,
            generated_ms: now_ms,
        }
    }

    /// Failure path: serve the previous watchlist unchanged and count the
    /// miss so the scheduler can pause after five in a row.
    pub fn serve_stale(&mut self, now_ms: i64) -> WatchlistUpdate {
        self.consecutive_failures += 1;
        WatchlistUpdate {
            entries: self.previous.clone(),
            diff: WatchlistDiff::default(),
            markets: Vec::new(),
            degraded: true,
            consecutive_failures: self.consecutive_failures,
            generated_ms: now_ms,
        }
    }

    pub async fn refresh(
        &mut self,
        client: &reqwest::Client,
        now_ms: i64,
    ) -> Result<WatchlistUpdate, SelectorError> {
        let metrics = fetch_metrics(client, &self.config).await?;
        Ok(self.build_watchlist(metrics, now_ms))
    }
}

fn diff_watchlists(prev: &[WatchlistEntry], next: &[WatchlistEntry]) -> WatchlistDiff {
    let prev_ranks: HashMap<&str, usize> =
        prev.iter().map(|e| (e.market_id.as_str(), e.rank)).collect();
    let next_ids: HashMap<&str, usize> =
        next.iter().map(|e| (e.market_id.as_str(), e.rank)).collect();

    let mut diff = WatchlistDiff::default();
    for entry in next {
        match prev_ranks.get(entry.market_id.as_str()) {
            None => diff.added.push(entry.market_id.clone()),
            Some(old_rank) if *old_rank != entry.rank => {
                diff.reranked.push(entry.market_id.clone())
            }
            _ => {}
        }
    }
    for entry in prev {
        if !next_ids.contains_key(entry.market_id.as_str()) {
            diff.removed.push(entry.market_id.clone());
        }
    }
    diff
}

// ─── Metadata fetch + defensive parsing ───

async fn fetch_metrics(
    client: &reqwest::Client,
    config: &Config,
) -> Result<Vec<MarketMetrics>, SelectorError> {
    let url = format!(
        "{}/markets?active=true&closed=false&limit=500",
        config.metadata_api_url
    );
    let resp = client
        .get(&url)
        .timeout(std::time::Duration::from_secs(config.net_timeout_secs))
        .send()
        .await?;
    let body: serde_json::Value = resp.json().await?;
    let arr = body
        .as_array()
        .ok_or_else(|| SelectorError::Malformed("expected a JSON array of markets".into()))?;
    Ok(arr.iter().filter_map(parse_market).collect())
}

/// Field names vary across metadata API deployments; try the spellings we
/// have seen and skip rows that lack an id.
pub fn parse_market(v: &serde_json::Value) -> Option<MarketMetrics> {
    let market_id = str_field(v, &["market_id", "id", "conditionId"])?;
    let event_id = str_field(v, &["event_id", "eventId"]).unwrap_or_else(|| market_id.clone());

    let tick_size = dec_field(v, &["tick_size", "minimum_tick_size", "orderPriceMinTickSize"])
        .unwrap_or_else(|| "0.001".parse().unwrap());
    let min_size = dec_field(v, &["min_size", "minimum_order_size", "orderMinSize"])
        .unwrap_or(Decimal::ONE);

    let closed = v.get("closed").and_then(|c| c.as_bool()).unwrap_or(false)
        || !v.get("active").and_then(|a| a.as_bool()).unwrap_or(true);

    let volume = num_field(v, &["volume_24h", "volume24hr", "volume24hrClob"]).unwrap_or(0.0);
    let liquidity = num_field(v, &["liquidity", "liquidityClob"]).unwrap_or(0.0);
    let updates = num_field(v, &["updates_per_min", "updatesPerMin"]).unwrap_or(0.0);

    // Prefer an explicit spread_bps; fall back to best bid/ask.
    let spread_bps = num_field(v, &["spread_bps"]).or_else(|| {
        let bid = num_field(v, &["best_bid", "bestBid"])?;
        let ask = num_field(v, &["best_ask", "bestAsk"])?;
        let mid = (bid + ask) / 2.0;
        (mid > 0.0).then(|| (ask - bid) / mid * 10_000.0)
    });

    Some(MarketMetrics {
        meta: MarketMeta {
            market_id,
            event_id,
            tick_size,
            min_size,
            status: if closed {
                MarketStatus::Closed
            } else {
                MarketStatus::Open
            },
        },
        volume_24h_usd: volume,
        liquidity_usd: liquidity,
        spread_bps: spread_bps.unwrap_or(0.0),
        updates_per_min: updates,
    })
}

fn str_field(v: &serde_json::Value, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|n| v.get(n))
        .and_then(|f| f.as_str())
        .map(str::to_string)
}

fn num_field(v: &serde_json::Value, names: &[&str]) -> Option<f64> {
    let f = names.iter().find_map(|n| v.get(n))?;
    f.as_f64().or_else(|| f.as_str()?.parse().ok())
}

fn dec_field(v: &serde_json::Value, names: &[&str]) -> Option<Decimal> {
    let f = names.iter().find_map(|n| v.get(n))?;
    if let Some(s) = f.as_str() {
        return s.parse().ok();
    }
    f.as_f64().and_then(Decimal::from_f64_retain)
}

// ─── Background task ───

/// Periodic selector loop. Publishes a watchlist update per tick; on fetch
/// failure it backs off exponentially (with jitter) while serving the last
/// good list.
pub async fn selector_task(
    config: Config,
    client: reqwest::Client,
    engine_tx: mpsc::Sender<EngineEvent>,
) {
    let interval_ms = config.selector_interval_secs * 1_000;
    let mut selector = MarketSelector::new(config);
    let mut backoff_ms: u64 = 1_000;

    loop {
        let now_ms = chrono::Utc::now().timestamp_millis();
        let (update, sleep_ms) = match selector.refresh(&client, now_ms).await {
            Ok(update) => {
                backoff_ms = 1_000;
                info!(
                    component = "selector",
                    event = "watchlist",
                    markets = update.entries.len(),
                    added = update.diff.added.len(),
                    removed = update.diff.removed.len(),
                    reranked = update.diff.reranked.len(),
                );
                (update, interval_ms)
            }
            Err(e) => {
                let update = selector.serve_stale(now_ms);
                warn!(
                    component = "selector",
                    event = "fetch_failed",
                    error = %e,
                    consecutive_failures = update.consecutive_failures,
                    backoff_ms,
                );
                let jitter = rand::thread_rng().gen_range(0.9..1.1);
                let sleep = ((backoff_ms as f64) * jitter) as u64;
                backoff_ms = (backoff_ms * 2).min(30_000);
                (update, sleep)
            }
        };

        if engine_tx.send(EngineEvent::Watchlist(update)).await.is_err() {
            return;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(sleep_ms)).await;
    }
}
