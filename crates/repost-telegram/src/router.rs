use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};
use tracing::info;

use repost_core::{cache::ChatCache, config::Config, scheduler::ForwardScheduler};

use crate::handlers;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub scheduler: ForwardScheduler,
    pub cache: Arc<ChatCache>,
}

/// Long-polling entry point. Routes membership updates, channel posts and
/// admin commands; everything else is dropped.
pub async fn run_polling(
    bot: Bot,
    cfg: Arc<Config>,
    scheduler: ForwardScheduler,
    cache: Arc<ChatCache>,
) -> anyhow::Result<()> {
    if let Ok(me) = bot.get_me().await {
        info!(
            username = me.username(),
            source = %cfg.source_channel,
            admins = cfg.admin_ids.len(),
            "repost bot started"
        );
    }

    let state = Arc::new(AppState {
        cfg,
        scheduler,
        cache,
    });

    let handler = dptree::entry()
        .branch(Update::filter_my_chat_member().endpoint(handlers::handle_my_chat_member))
        .branch(Update::filter_channel_post().endpoint(handlers::handle_channel_post))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .build()
        .dispatch()
        .await;

    Ok(())
}
