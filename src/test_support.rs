//! Shared builders for unit tests. Compiled only under `cfg(test)`.

use rust_decimal::Decimal;

use crate::book::BookState;
use crate::config::{Config, ExecutionMode, FillModel, RunMode};
use crate::types::{BookSnapshot, MarketMeta, MarketStatus};

/// A fully-populated paper-mode config with the documented defaults.
/// Built literally so tests never touch process environment.
pub fn make_config() -> Config {
    Config {
        run_mode: RunMode::Paper,
        execution_mode: ExecutionMode::Paper,
        fill_model: FillModel::MakerTouch,

        metadata_api_url: String::new(),
        clob_ws_url: String::new(),

        min_24h_volume_usd: 10_000.0,
        min_liquidity_usd: 1_000.0,
        min_spread_bps: 10.0,
        min_updates_min: 6.0,
        top_n_markets: 20,
        selector_interval_secs: 60,
        score_w_volume: 1.0,
        score_w_liquidity: 1.0,
        score_w_spread: 0.5,
        score_w_updates: 0.2,

        max_position_per_market: Decimal::from(100),
        max_event_exposure_usd: Decimal::from(500),
        daily_loss_limit: Decimal::from(200),
        reject_feed_lag_ms: 100,
        max_spread_bps: 800.0,
        max_open_positions: 10,
        max_pos_age_secs: 3_600,
        unwind_interval_secs: 30,
        kill_switch: false,

        strategy_fair_value: true,
        strategy_market_maker: true,
        strategy_min_interval_ms: 50,

        fv_entry_edge: "0.02".parse().unwrap(),
        fv_exit_edge: "0.005".parse().unwrap(),
        fv_depth_mult: Decimal::from(2),
        fv_max_staleness_ms: 2_000,
        fv_time_stop_secs: 600,
        fv_stub_value: None,
        target_size: Decimal::from(10),

        mm_min_half_spread: "0.005".parse().unwrap(),
        mm_edge_ticks: 1,
        mm_skew_k: "0.25".parse().unwrap(),
        mm_min_quote_life_secs: 1,
        mm_reprice_threshold: 2,
        mm_max_spread: "0.10".parse().unwrap(),

        slippage_bps: Decimal::ZERO,
        fees_bps: Decimal::ZERO,
        paper_min_rest_secs: 1,
        paper_participation: "0.5".parse().unwrap(),

        sqlite_path: String::new(),
        paper_reset_on_start: true,
        snapshot_interval_secs: 5,

        backtest_speed: 0.0,
        backtest_start_ts: None,
        backtest_end_ts: None,

        feed_queue: 10_000,
        idle_tick_ms: 20,
        net_timeout_secs: 10,
        n_permanent_attempts: 20,
    }
}

pub fn make_meta(market_id: &str, event_id: &str, tick_size: Decimal) -> MarketMeta {
    MarketMeta {
        market_id: market_id.to_string(),
        event_id: event_id.to_string(),
        tick_size,
        min_size: Decimal::ONE,
        status: MarketStatus::Open,
    }
}

/// A synced two-sided book from explicit levels.
pub fn make_book(
    tick_size: Decimal,
    bids: Vec<(Decimal, Decimal)>,
    asks: Vec<(Decimal, Decimal)>,
) -> BookState {
    let mut book = BookState::new(tick_size);
    book.apply_snapshot(&BookSnapshot { bids, asks, seq: None }, 1_000, 1_000);
    book
}
