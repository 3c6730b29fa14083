use std::sync::Arc;

use anyhow::Context;
use teloxide::Bot;
use tracing::info;

use repost_core::{
    cache::ChatCache,
    config::Config,
    ports::{AlertSink, MessengerPort, StateStore},
    scheduler::ForwardScheduler,
    state::ForwardStateStore,
    store::JsonFileStore,
};
use repost_telegram::{router, TelegramAlerts, TelegramMessenger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    repost_core::logging::init("repost")?;

    let cfg = Arc::new(Config::load().context("loading configuration")?);

    let bot = Bot::new(cfg.bot_token.clone());
    let messenger: Arc<dyn MessengerPort> = Arc::new(TelegramMessenger::new(bot.clone()));
    let alerts: Arc<dyn AlertSink> = Arc::new(TelegramAlerts::new(bot.clone(), cfg.admin_ids.clone()));
    let store: Arc<dyn StateStore> = Arc::new(JsonFileStore::new(cfg.state_path.clone()));

    // A missing state file means a fresh deploy; an unreadable one means we
    // must not run, or we would re-forward from zero.
    let initial = ForwardStateStore::new(store.clone(), cfg.save_retries)
        .load()
        .await
        .context("loading forward state")?;
    info!(
        last_id = %initial.last_message_id,
        failures = initial.consecutive_failures,
        "forward state loaded"
    );

    let cache = Arc::new(
        ChatCache::load(messenger.clone(), store.clone())
            .await
            .context("loading target chat table")?,
    );

    let scheduler = ForwardScheduler::new(
        cfg.clone(),
        messenger,
        store,
        cache.clone(),
        alerts,
        initial,
    );

    // The scheduler stays idle until an admin sends /start.
    router::run_polling(bot, cfg, scheduler, cache).await
}
