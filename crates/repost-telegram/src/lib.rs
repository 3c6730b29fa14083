//! Telegram adapter (teloxide).
//!
//! Implements the `repost-core` ports over the Telegram Bot API:
//! [`TelegramMessenger`] for message dispatch and channel probing,
//! [`TelegramAlerts`] for operator notifications.

use async_trait::async_trait;

use teloxide::{prelude::*, types::Recipient, RequestError};
use tokio::time::sleep;
use tracing::warn;

pub mod handlers;
pub mod router;

use repost_core::{
    domain::{ChannelRef, ChatId, MessageId},
    errors::Error,
    ports::{AlertSink, ChatMeta, MessengerPort, SendOutcome},
    Result,
};

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }

    pub fn bot(&self) -> Bot {
        self.bot.clone()
    }

    fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
        teloxide::types::ChatId(chat_id.0)
    }

    fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
        teloxide::types::MessageId(message_id.0)
    }

    fn recipient(channel: &ChannelRef) -> Recipient {
        match channel {
            ChannelRef::Id(id) => Recipient::Id(teloxide::types::ChatId(*id)),
            ChannelRef::Username(name) => Recipient::ChannelUsername(format!("@{name}")),
        }
    }

    /// Retry once on 429 (RetryAfter), honoring the server-provided delay.
    /// Every other error is returned to the caller for classification.
    async fn with_retry<T, Fut>(
        &self,
        mut op: impl FnMut() -> Fut,
    ) -> std::result::Result<T, RequestError>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    sleep(d).await;
                }
                Err(other) => return Err(other),
            }
        }
    }
}

/// Map a Telegram API error onto a dispatch outcome, where one applies.
///
/// Bot API error descriptions are strings first and typed variants second,
/// so this matches on the rendered message. Membership-style errors must be
/// checked before the generic "not found" patterns ("chat not found" is a
/// membership problem, not a missing message).
fn classify_api_error(e: &RequestError) -> Option<SendOutcome> {
    let RequestError::Api(api) = e else {
        if matches!(e, RequestError::RetryAfter(_)) {
            return Some(SendOutcome::RateLimited);
        }
        return None;
    };

    let s = api.to_string().to_lowercase();
    if s.contains("chat not found")
        || s.contains("kicked")
        || s.contains("blocked")
        || s.contains("forbidden")
        || s.contains("not enough rights")
        || s.contains("deactivated")
        || s.contains("restricted")
    {
        return Some(SendOutcome::Forbidden);
    }
    if s.contains("not found") || s.contains("message_id_invalid") || s.contains("can't be copied")
    {
        return Some(SendOutcome::NotFound);
    }
    None
}

#[async_trait]
impl MessengerPort for TelegramMessenger {
    async fn send_or_copy(
        &self,
        target: ChatId,
        source: &ChannelRef,
        id: MessageId,
    ) -> Result<SendOutcome> {
        let to = Self::tg_chat(target);
        let from = Self::recipient(source);
        let mid = Self::tg_msg_id(id);

        match self
            .with_retry(|| self.bot.copy_message(to, from.clone(), mid))
            .await
        {
            Ok(copied) => Ok(SendOutcome::Sent(MessageId(copied.0))),
            Err(e) => match classify_api_error(&e) {
                Some(outcome) => Ok(outcome),
                None => Err(Error::External(format!("telegram error: {e}"))),
            },
        }
    }

    /// Existence probe: copy the message back into the channel itself and
    /// delete the copy. There is no cheaper Bot API call that answers
    /// "does channel message N still exist".
    async fn message_exists(&self, source: &ChannelRef, id: MessageId) -> Result<bool> {
        let chan = Self::recipient(source);
        let mid = Self::tg_msg_id(id);

        let copy = {
            let chan = chan.clone();
            self.with_retry(|| {
                self.bot
                    .copy_message(chan.clone(), chan.clone(), mid)
                    .disable_notification(true)
            })
            .await
        };

        match copy {
            Ok(copied) => {
                if let Err(e) = self.bot.delete_message(chan, copied).await {
                    warn!(%id, error = %e, "failed to delete probe copy");
                }
                Ok(true)
            }
            Err(e) => match classify_api_error(&e) {
                Some(SendOutcome::NotFound) => Ok(false),
                _ => Err(Error::External(format!("probe failed: {e}"))),
            },
        }
    }

    async fn pin_message(&self, chat: ChatId, id: MessageId) -> Result<()> {
        let result = self
            .with_retry(|| {
                self.bot
                    .pin_chat_message(Self::tg_chat(chat), Self::tg_msg_id(id))
                    .disable_notification(true)
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => Err(Error::External(format!("pin failed: {e}"))),
        }
    }

    async fn unpin_message(&self, chat: ChatId, id: MessageId) -> Result<()> {
        let result = self
            .with_retry(|| {
                self.bot
                    .unpin_chat_message(Self::tg_chat(chat))
                    .message_id(Self::tg_msg_id(id))
            })
            .await;
        match result {
            Ok(_) => Ok(()),
            // The previous pin may already be gone (deleted, unpinned by an
            // admin). That still leaves the chat ready for the fresh pin.
            Err(e) => match classify_api_error(&e) {
                Some(SendOutcome::NotFound) => Ok(()),
                _ => Err(Error::External(format!("unpin failed: {e}"))),
            },
        }
    }

    async fn probe_chat(&self, chat: ChatId) -> Result<Option<ChatMeta>> {
        match self.with_retry(|| self.bot.get_chat(Self::tg_chat(chat))).await {
            Ok(c) => {
                let member_count = self
                    .bot
                    .get_chat_member_count(Self::tg_chat(chat))
                    .await
                    .ok();
                Ok(Some(ChatMeta {
                    title: c
                        .title()
                        .map(str::to_string)
                        .unwrap_or_else(|| chat.to_string()),
                    member_count,
                }))
            }
            Err(e) => match classify_api_error(&e) {
                Some(SendOutcome::Forbidden) => Ok(None),
                _ => Err(Error::External(format!("chat probe failed: {e}"))),
            },
        }
    }
}

/// Sends operator alerts as plain DMs to every configured admin.
pub struct TelegramAlerts {
    bot: Bot,
    admin_ids: Vec<i64>,
}

impl TelegramAlerts {
    pub fn new(bot: Bot, admin_ids: Vec<i64>) -> Self {
        Self { bot, admin_ids }
    }
}

#[async_trait]
impl AlertSink for TelegramAlerts {
    async fn alert(&self, text: &str) {
        for &admin in &self.admin_ids {
            if let Err(e) = self
                .bot
                .send_message(teloxide::types::ChatId(admin), text)
                .await
            {
                warn!(admin, error = %e, "failed to deliver alert");
            }
        }
    }
}
