use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use paperbook::broker::PaperBroker;
use paperbook::config::{Config, RunMode};
use paperbook::engine::{run_engine, EngineDeps};
use paperbook::feed::replay::replay_task;
use paperbook::portfolio::Portfolio;
use paperbook::selector::selector_task;
use paperbook::storage::{spawn_writer, Store};
use paperbook::strategies::FvProvider;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(component = "main", event = "config_error", error = %e);
            std::process::exit(2);
        }
    };

    info!(
        component = "main",
        event = "starting",
        run_mode = config.run_mode.as_str(),
        fill_model = ?config.fill_model,
        top_n = config.top_n_markets,
        sqlite_path = %config.sqlite_path,
        max_position_per_market = %config.max_position_per_market,
        daily_loss_limit = %config.daily_loss_limit,
    );

    if let Err(e) = run(config).await {
        error!(component = "main", event = "fatal", error = %e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(&config.sqlite_path)?;

    let mut portfolio = Portfolio::new();
    let mut broker = PaperBroker::new(&config);
    if config.paper_reset_on_start {
        store.wipe_paper_state()?;
    } else {
        // Prior paper session carries over: open orders and positions.
        let orders = store.load_open_orders()?;
        let positions = store.load_positions()?;
        info!(
            component = "main",
            event = "restored_paper_state",
            open_orders = orders.len(),
            positions = positions.len(),
        );
        broker.restore(orders);
        broker.set_next_fill_id(store.max_fill_id()? + 1);
        portfolio.restore(positions);
    }

    let (storage, writer) = spawn_writer(store, config.feed_queue);
    let (engine_tx, engine_rx) = mpsc::channel(config.feed_queue);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut selector_handle = None;
    let mut replay_handle = None;
    match config.run_mode {
        RunMode::Backtest => {
            let replay_config = config.clone();
            let tx = engine_tx.clone();
            replay_handle = Some(tokio::spawn(async move { replay_task(replay_config, tx).await }));
        }
        RunMode::Scanner | RunMode::Paper => {
            let client = reqwest::Client::new();
            let selector_config = config.clone();
            let tx = engine_tx.clone();
            selector_handle = Some(tokio::spawn(selector_task(selector_config, client, tx)));
        }
    }

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(component = "main", event = "sigint");
            let _ = shutdown_tx.send(true);
        }
    });

    let fv = FvProvider::Stub {
        value: config.fv_stub_value,
    };
    let outcome = run_engine(EngineDeps {
        config,
        event_rx: engine_rx,
        engine_tx: Some(engine_tx),
        storage: storage.clone(),
        fv,
        portfolio,
        broker,
        shutdown: shutdown_rx,
    })
    .await;

    if let Some(handle) = selector_handle {
        handle.abort();
    }
    let mut replay_error = None;
    if let Some(handle) = replay_handle {
        match handle.await {
            Ok(Ok(emitted)) => {
                info!(component = "main", event = "replay_done", emitted);
            }
            Ok(Err(e)) => replay_error = Some(e.to_string()),
            Err(_) => {}
        }
    }

    // All senders gone: the writer drains acknowledged rows, then exits.
    drop(storage);
    let _ = writer.await;

    info!(
        component = "main",
        event = "stopped",
        events = outcome.events_processed,
        orders = outcome.orders_placed,
        fills = outcome.fills,
        realized = %outcome.realized,
        unrealized = %outcome.unrealized,
    );

    match replay_error {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

/// One JSON object per line: {ts, level, component, event, ...}.
fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}
