use async_trait::async_trait;

use crate::{
    domain::{ChannelRef, ChatId, MessageId},
    Result,
};

/// Outcome of a single send/copy attempt against one target chat.
///
/// `Sent` carries the id of the copy in the target chat (needed to pin it).
/// `RateLimited` is retryable, `Forbidden` means the bot was removed or
/// blocked in that chat, `NotFound` means the source message vanished
/// between resolution and dispatch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(MessageId),
    RateLimited,
    Forbidden,
    NotFound,
}

/// Metadata returned by a target-chat probe.
#[derive(Clone, Debug)]
pub struct ChatMeta {
    pub title: String,
    pub member_count: Option<u32>,
}

/// Hexagonal port for the messaging platform.
///
/// Telegram is the first implementation. The engine never touches the
/// platform API directly; everything goes through this trait so tests can
/// script platform behavior.
#[async_trait]
pub trait MessengerPort: Send + Sync {
    /// Copy the channel message into a target chat.
    async fn send_or_copy(
        &self,
        target: ChatId,
        source: &ChannelRef,
        id: MessageId,
    ) -> Result<SendOutcome>;

    /// Single existence check for one channel message.
    ///
    /// `Ok(false)` covers deleted and service messages alike (neither is
    /// forwardable). `Err` means the channel itself is unreachable.
    async fn message_exists(&self, source: &ChannelRef, id: MessageId) -> Result<bool>;

    /// Check whether the bot is still a member of `chat`.
    ///
    /// `Ok(None)` means the bot was removed; `Err` is a transport failure
    /// and leaves the membership question open.
    async fn probe_chat(&self, chat: ChatId) -> Result<Option<ChatMeta>>;

    /// Pin a message in a target chat, silently (no notification).
    async fn pin_message(&self, chat: ChatId, id: MessageId) -> Result<()>;

    /// Unpin a specific message. Implementations treat an already-gone
    /// message as success.
    async fn unpin_message(&self, chat: ChatId, id: MessageId) -> Result<()>;
}

/// Durable key-value persistence with read-your-writes semantics.
///
/// The engine stores the forward state and the target-chat table under
/// independent keys; no cross-key transaction is required.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
}

/// Operator alert channel (admin DMs in the Telegram adapter).
///
/// Alerts are best-effort; delivery failure must never affect the engine.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, text: &str);
}
