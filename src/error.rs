use thiserror::Error;

/// Configuration errors are fatal at startup: the engine refuses to run
/// with a value it cannot interpret.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?} ({hint})")]
    Invalid {
        name: &'static str,
        value: String,
        hint: &'static str,
    },

    #[error("TRADE_MODE=live is not supported: this engine is paper-only")]
    LiveTradingRejected,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("malformed {table} row: {detail}")]
    Malformed { table: &'static str, detail: String },
}

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("metadata fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("metadata response malformed: {0}")]
    Malformed(String),
}
