use rust_decimal::Decimal;

use crate::error::ConfigError;

/// Which pipeline runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Selector + feed + storage only: record the tape, no trading.
    Scanner,
    /// Full core: selector, feed, strategies, risk, paper broker.
    Paper,
    /// Feed replaced by the tape reader; everything else identical.
    Backtest,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Scanner => "scanner",
            RunMode::Paper => "paper",
            RunMode::Backtest => "backtest",
        }
    }
}

/// Broker behavior: paper simulates fills, shadow only records intents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Paper,
    Shadow,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FillModel {
    /// A resting limit fills when the opposing best touch reaches it.
    MakerTouch,
    /// A resting limit fills only when a trade print crosses its price.
    TradeThrough,
}

/// Configuration loaded from environment variables, immutable after startup.
/// A present-but-unparseable value is fatal; an absent one takes the default.
#[derive(Clone, Debug)]
pub struct Config {
    pub run_mode: RunMode,
    pub execution_mode: ExecutionMode,
    pub fill_model: FillModel,

    // Upstream endpoints
    pub metadata_api_url: String,
    pub clob_ws_url: String,

    // Selector thresholds + score weights
    pub min_24h_volume_usd: f64,
    pub min_liquidity_usd: f64,
    pub min_spread_bps: f64,
    pub min_updates_min: f64,
    pub top_n_markets: usize,
    pub selector_interval_secs: u64,
    pub score_w_volume: f64,
    pub score_w_liquidity: f64,
    pub score_w_spread: f64,
    pub score_w_updates: f64,

    // Risk
    pub max_position_per_market: Decimal,
    pub max_event_exposure_usd: Decimal,
    pub daily_loss_limit: Decimal,
    pub reject_feed_lag_ms: i64,
    pub max_spread_bps: f64,
    pub max_open_positions: usize,
    pub max_pos_age_secs: i64,
    pub unwind_interval_secs: u64,
    pub kill_switch: bool,

    // Strategy toggles + cadence
    pub strategy_fair_value: bool,
    pub strategy_market_maker: bool,
    pub strategy_min_interval_ms: i64,

    // Fair value
    pub fv_entry_edge: Decimal,
    pub fv_exit_edge: Decimal,
    pub fv_depth_mult: Decimal,
    pub fv_max_staleness_ms: i64,
    pub fv_time_stop_secs: i64,
    /// Static fair value served by the stub provider; None disables FV entry.
    pub fv_stub_value: Option<Decimal>,
    pub target_size: Decimal,

    // Market making
    pub mm_min_half_spread: Decimal,
    pub mm_edge_ticks: u32,
    pub mm_skew_k: Decimal,
    pub mm_min_quote_life_secs: i64,
    pub mm_reprice_threshold: u32,
    pub mm_max_spread: Decimal,

    // Paper frictions
    pub slippage_bps: Decimal,
    pub fees_bps: Decimal,
    pub paper_min_rest_secs: i64,
    pub paper_participation: Decimal,

    // Persistence
    pub sqlite_path: String,
    pub paper_reset_on_start: bool,
    pub snapshot_interval_secs: i64,

    // Backtest
    pub backtest_speed: f64,
    pub backtest_start_ts: Option<i64>,
    pub backtest_end_ts: Option<i64>,

    // Plumbing
    pub feed_queue: usize,
    pub idle_tick_ms: u64,
    pub net_timeout_secs: u64,
    pub n_permanent_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        // TRADE_MODE exists for parity with the config surface of a live
        // deployment; only "paper" is accepted.
        match std::env::var("TRADE_MODE").as_deref() {
            Err(_) | Ok("paper") => {}
            Ok("live") => return Err(ConfigError::LiveTradingRejected),
            Ok(other) => {
                return Err(invalid("TRADE_MODE", other, "expected paper"));
            }
        }

        let run_mode = match std::env::var("RUN_MODE").as_deref() {
            Err(_) | Ok("paper") => RunMode::Paper,
            Ok("scanner") => RunMode::Scanner,
            Ok("backtest") => RunMode::Backtest,
            Ok(other) => {
                return Err(invalid("RUN_MODE", other, "expected scanner|paper|backtest"));
            }
        };

        let execution_mode = match std::env::var("EXECUTION_MODE").as_deref() {
            Err(_) | Ok("paper") => ExecutionMode::Paper,
            Ok("shadow") => ExecutionMode::Shadow,
            Ok(other) => {
                return Err(invalid("EXECUTION_MODE", other, "expected paper|shadow"));
            }
        };

        let fill_model = match std::env::var("PAPER_FILL_MODEL").as_deref() {
            Err(_) | Ok("maker_touch") => FillModel::MakerTouch,
            Ok("trade_through") => FillModel::TradeThrough,
            Ok(other) => {
                return Err(invalid(
                    "PAPER_FILL_MODEL",
                    other,
                    "expected maker_touch|trade_through",
                ));
            }
        };

        Ok(Self {
            run_mode,
            execution_mode,
            fill_model,

            metadata_api_url: var_string(
                "METADATA_API_URL",
                "https://gamma-api.polymarket.com",
            ),
            clob_ws_url: var_string(
                "CLOB_WS_URL",
                "wss://ws-subscriptions-clob.polymarket.com/ws/market",
            ),

            min_24h_volume_usd: var_parse("MIN_24H_VOLUME_USD", 10_000.0)?,
            min_liquidity_usd: var_parse("MIN_LIQUIDITY_USD", 1_000.0)?,
            min_spread_bps: var_parse("MIN_SPREAD_BPS", 10.0)?,
            min_updates_min: var_parse("MIN_UPDATES_MIN", 6.0)?,
            top_n_markets: var_parse("TOP_N_MARKETS", 20usize)?,
            selector_interval_secs: var_parse("SELECTOR_INTERVAL_SECS", 60u64)?,
            score_w_volume: var_parse("SCORE_W_VOLUME", 1.0)?,
            score_w_liquidity: var_parse("SCORE_W_LIQUIDITY", 1.0)?,
            score_w_spread: var_parse("SCORE_W_SPREAD", 0.5)?,
            score_w_updates: var_parse("SCORE_W_UPDATES", 0.2)?,

            max_position_per_market: var_decimal("MAX_POSITION_PER_MARKET", "100")?,
            max_event_exposure_usd: var_decimal("MAX_EVENT_EXPOSURE_USD", "500")?,
            daily_loss_limit: var_decimal("DAILY_LOSS_LIMIT", "200")?,
            reject_feed_lag_ms: var_parse("REJECT_FEED_LAG_MS", 100i64)?,
            max_spread_bps: var_parse("MAX_SPREAD_BPS", 800.0)?,
            max_open_positions: var_parse("MAX_OPEN_POSITIONS", 10usize)?,
            max_pos_age_secs: var_parse("MAX_POS_AGE_SECS", 3_600i64)?,
            unwind_interval_secs: var_parse("UNWIND_INTERVAL_SECS", 30u64)?,
            kill_switch: var_bool("KILL_SWITCH", false),

            strategy_fair_value: var_bool("STRATEGY_FAIR_VALUE", true),
            strategy_market_maker: var_bool("STRATEGY_MARKET_MAKER", true),
            strategy_min_interval_ms: var_parse("STRATEGY_MIN_INTERVAL_MS", 50i64)?,

            fv_entry_edge: var_decimal("FV_ENTRY_EDGE", "0.02")?,
            fv_exit_edge: var_decimal("FV_EXIT_EDGE", "0.005")?,
            fv_depth_mult: var_decimal("FV_DEPTH_MULT", "2")?,
            fv_max_staleness_ms: var_parse("FV_MAX_STALENESS_MS", 2_000i64)?,
            fv_time_stop_secs: var_parse("FV_TIME_STOP_SECS", 600i64)?,
            fv_stub_value: var_decimal_opt("FV_STUB_VALUE")?,
            target_size: var_decimal("TARGET_SIZE", "10")?,

            mm_min_half_spread: var_decimal("MM_MIN_HALF_SPREAD", "0.005")?,
            mm_edge_ticks: var_parse("MM_EDGE_TICKS", 1u32)?,
            mm_skew_k: var_decimal("MM_SKEW_K", "0.25")?,
            mm_min_quote_life_secs: var_parse("MM_MIN_QUOTE_LIFE_SECS", 1i64)?,
            mm_reprice_threshold: var_parse("MM_REPRICE_THRESHOLD", 2u32)?,
            mm_max_spread: var_decimal("MM_MAX_SPREAD", "0.10")?,

            slippage_bps: var_decimal("SLIPPAGE_BPS", "0")?,
            fees_bps: var_decimal("FEES_BPS", "0")?,
            paper_min_rest_secs: var_parse("PAPER_MIN_REST_SECS", 1i64)?,
            paper_participation: var_decimal("PAPER_PARTICIPATION", "0.5")?,

            sqlite_path: var_string("SQLITE_PATH", "paperbook.db"),
            paper_reset_on_start: var_bool("PAPER_RESET_ON_START", true),
            snapshot_interval_secs: var_parse("SNAPSHOT_INTERVAL_SECS", 5i64)?,

            backtest_speed: var_parse("BACKTEST_SPEED", 0.0)?,
            backtest_start_ts: var_parse_opt("BACKTEST_START_TS")?,
            backtest_end_ts: var_parse_opt("BACKTEST_END_TS")?,

            feed_queue: var_parse("FEED_QUEUE", 10_000usize)?,
            idle_tick_ms: var_parse("IDLE_TICK_MS", 20u64)?,
            net_timeout_secs: var_parse("NET_TIMEOUT_SECS", 10u64)?,
            n_permanent_attempts: var_parse("N_PERMANENT_ATTEMPTS", 20u32)?,
        })
    }
}

fn invalid(name: &'static str, value: &str, hint: &'static str) -> ConfigError {
    ConfigError::Invalid {
        name,
        value: value.to_string(),
        hint,
    }
}

fn var_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn var_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(default)
}

fn var_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| invalid(name, &raw, "failed to parse")),
    }
}

fn var_parse_opt<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| invalid(name, &raw, "failed to parse")),
    }
}

fn var_decimal(name: &'static str, default: &str) -> Result<Decimal, ConfigError> {
    let raw = std::env::var(name).unwrap_or_else(|_| default.to_string());
    raw.parse()
        .map_err(|_| invalid(name, &raw, "expected a decimal number"))
}

fn var_decimal_opt(name: &'static str) -> Result<Option<Decimal>, ConfigError> {
    match std::env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| invalid(name, &raw, "expected a decimal number")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario: defaults, live-mode rejection, a garbage value, and
    /// backtest overrides, exercised in sequence. A single test because
    /// env-var mutation is process-global and the test runner is parallel.
    #[test]
    fn test_from_env_phases() {
        // Phase 1: no overrides, documented defaults.
        let config = Config::from_env().expect("defaults must parse");
        assert_eq!(config.run_mode, RunMode::Paper);
        assert_eq!(config.execution_mode, ExecutionMode::Paper);
        assert_eq!(config.fill_model, FillModel::MakerTouch);
        assert_eq!(config.top_n_markets, 20);
        assert_eq!(config.reject_feed_lag_ms, 100);
        assert_eq!(config.paper_participation, "0.5".parse().unwrap());
        assert!(!config.kill_switch);

        // Phase 2: TRADE_MODE=live is refused outright.
        std::env::set_var("TRADE_MODE", "live");
        let err = Config::from_env().unwrap_err();
        std::env::remove_var("TRADE_MODE");
        assert!(matches!(err, ConfigError::LiveTradingRejected));

        // Phase 3: present-but-unparseable value is fatal and names the
        // offending variable.
        std::env::set_var("MIN_24H_VOLUME_USD", "lots");
        let err = Config::from_env().unwrap_err();
        std::env::remove_var("MIN_24H_VOLUME_USD");
        match err {
            ConfigError::Invalid { name, value, .. } => {
                assert_eq!(name, "MIN_24H_VOLUME_USD");
                assert_eq!(value, "lots");
            }
            other => panic!("expected Invalid, got {other:?}"),
        }

        // Phase 4: backtest mode with an explicit window start.
        std::env::set_var("RUN_MODE", "backtest");
        std::env::set_var("BACKTEST_START_TS", "1700000000000");
        let config = Config::from_env().expect("must parse");
        std::env::remove_var("RUN_MODE");
        std::env::remove_var("BACKTEST_START_TS");
        assert_eq!(config.run_mode, RunMode::Backtest);
        assert_eq!(config.backtest_start_ts, Some(1_700_000_000_000));
    }
}
