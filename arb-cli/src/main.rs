mod config;
mod error;
mod logging;
mod simulated;

use arb_engine::{
    intent::IntentContext,
    manager::IntentManager,
    trader::Trader,
};
use arb_execution::{book::OrderBookCache, instant::InstantTradeExecutor, manager::DelayedTradeManager};
use arb_journal::journal::Journal;
use error::CliError;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), CliError> {
    logging::init_logging();

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = config::Config::load(&config_path)?;
    let secrets = config::Secrets::from_env()?;

    info!(path = %config_path, http_port = config.http_port, "loaded configuration");

    let journal = Journal::connect(&secrets.database_url).await?;
    journal.migrate().await?;

    // Out-of-scope collaborators (spec §1): a concrete deployment replaces these three with a
    // real exchange SDK adapter, a live path enumerator, and a balance poller. The simulated
    // stand-ins here keep the trader loop runnable end to end for local smoke-testing.
    let client = simulated::SimulatedExchangeClient::new();
    let enumerator = Arc::new(simulated::NullPathEnumerator);
    let balance = simulated::FixedBalanceSource::new(Default::default());

    let book_cache = Arc::new(OrderBookCache::new(client.clone()));
    let delayed_manager = DelayedTradeManager::new(client.clone(), book_cache.clone());
    let instant_executor = Arc::new(InstantTradeExecutor::with_retry_limits(
        client.clone(),
        config.instant_retry_limits.not_enough_crypto,
    ));
    let intent_manager = Arc::new(IntentManager::new());

    let ctx = IntentContext {
        book_cache,
        delayed_manager,
        instant_executor,
        enumerator,
        intent_manager,
        journal,
        config: Arc::new(config.intent_config()),
    };

    let trader = Trader::new(ctx, balance, config.trader_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c, shutting down");
        let _ = shutdown_tx.send(true);
    });

    trader.run(shutdown_rx).await;
    Ok(())
}
