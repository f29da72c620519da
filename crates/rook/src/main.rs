use std::sync::Arc;

use rook_core::{
    bot::{Bot, Services},
    config::Config,
    store::JsonFileStore,
    Error,
};
use rook_discord::{Connection, SerenityResponder};

#[tokio::main]
async fn main() -> Result<(), Error> {
    rook_core::logging::init("rook")?;

    let config = Config::load()?;
    let token = config.discord_token.clone();
    let store = Arc::new(JsonFileStore::new(config.data_dir.clone()));
    let responder = Arc::new(SerenityResponder::from_token(&token));

    let services = Services::new(config, responder, store, rook_extensions::catalog());
    let bot = Bot::new(services.clone());
    bot.start().await?;

    let Connection {
        mut client,
        shard_manager,
        events,
    } = rook_discord::connect(&token, services.registry.clone())
        .await
        .map_err(|e| Error::External(format!("discord client failed: {e:#}")))?;

    let gateway = tokio::spawn(async move {
        if let Err(e) = client.start().await {
            tracing::error!("gateway stopped: {e}");
        }
    });

    tokio::select! {
        _ = bot.run(events) => tracing::warn!("gateway event stream closed"),
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => tracing::info!("interrupt received"),
            Err(e) => tracing::error!("failed to listen for ctrl-c: {e}"),
        },
    }

    shard_manager.shutdown_all().await;
    let report = bot.shutdown().await?;
    if !report.drained {
        tracing::warn!("some invocations were cancelled during shutdown");
    }
    gateway.abort();
    Ok(())
}
