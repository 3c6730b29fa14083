//! Telegram update handlers.
//!
//! Three update classes matter to this bot:
//! - `my_chat_member`: the bot was added to / removed from a group, which
//!   drives the target-chat table;
//! - `channel_post`: a new post in the source channel advances the stored
//!   candidate id so the next cycle picks it up without probing blindly;
//! - `message`: admin commands in private chats.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{ChatMemberUpdated, Message},
};
use tracing::{debug, info, warn};

use repost_core::domain::{ChannelRef, ChatId, MessageId};

use crate::router::AppState;

mod commands;

pub async fn handle_my_chat_member(
    upd: ChatMemberUpdated,
    state: Arc<AppState>,
) -> ResponseResult<()> {
    let chat = &upd.chat;
    // Only groups become forwarding targets; membership changes in channels
    // and private chats are irrelevant here.
    if !(chat.is_group() || chat.is_supergroup()) {
        return Ok(());
    }

    let chat_id = ChatId(chat.id.0);
    let title = chat.title().unwrap_or("(untitled)").to_string();

    if upd.new_chat_member.is_present() {
        info!(%chat_id, title, "added to target chat");
        if let Err(e) = state.cache.upsert(chat_id, title).await {
            warn!(%chat_id, error = %e, "failed to record new target chat");
        }
    } else {
        info!(%chat_id, title, "removed from target chat");
        if let Err(e) = state.cache.mark_inactive(chat_id).await {
            warn!(%chat_id, error = %e, "failed to demote target chat");
        }
    }

    Ok(())
}

pub async fn handle_channel_post(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if !is_source_channel(&msg, &state.cfg.source_channel) {
        return Ok(());
    }

    let id = MessageId(msg.id.0);
    debug!(%id, "new channel post observed");
    match state.scheduler.observe_channel_post(id).await {
        Ok(()) => {}
        // A running cycle will find the post through its forward sweep.
        Err(repost_core::Error::LockContention) => debug!(%id, "cycle in flight, not recorded"),
        Err(e) => warn!(%id, error = %e, "failed to record channel post"),
    }

    Ok(())
}

fn is_source_channel(msg: &Message, source: &ChannelRef) -> bool {
    match source {
        ChannelRef::Id(id) => msg.chat.id.0 == *id,
        ChannelRef::Username(name) => msg
            .chat
            .username()
            .map(|u| u.eq_ignore_ascii_case(name))
            .unwrap_or(false),
    }
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    if !msg.chat.is_private() {
        return Ok(());
    }
    let Some(user) = msg.from() else {
        return Ok(());
    };

    if !state.cfg.is_admin(user.id.0 as i64) {
        let _ = bot
            .send_message(msg.chat.id, "Unauthorized. Contact the bot owner for access.")
            .await;
        return Ok(());
    }

    if let Some(text) = msg.text() {
        if text.starts_with('/') {
            return commands::handle_command(bot, msg, state).await;
        }
    }

    let _ = bot
        .send_message(msg.chat.id, "Send /help for the list of commands.")
        .await;

    Ok(())
}
