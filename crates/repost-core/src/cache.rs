use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::{
    domain::{ChatId, MessageId},
    ports::{MessengerPort, StateStore},
    Result,
};

const TARGETS_KEY: &str = "target_chats";

/// One group the bot re-posts into.
///
/// Chats are never deleted from the table; losing membership demotes the
/// entry to inactive so an operator can still see where the bot used to be.
/// `pinned_message_id` is the bot's current pin in that chat, kept so the
/// next cycle can unpin it before pinning the fresh copy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetChat {
    pub chat_id: ChatId,
    pub title: String,
    pub is_active: bool,
    pub last_verified_at: DateTime<Utc>,
    #[serde(default)]
    pub pinned_message_id: Option<MessageId>,
}

/// In-memory table of target chats, persisted through the key-value store
/// and reconciled against live membership on demand.
///
/// Mutations are event-driven (membership updates from the platform); the
/// periodic [`refresh`](ChatCache::refresh) only re-verifies entries whose
/// last verification is older than the configured max age.
pub struct ChatCache {
    messenger: Arc<dyn MessengerPort>,
    store: Arc<dyn StateStore>,
    inner: RwLock<HashMap<ChatId, TargetChat>>,
    revision: watch::Sender<u64>,
}

impl ChatCache {
    /// Load the persisted table. A missing record is an empty table; a
    /// corrupt or unreadable store propagates as `StorageUnavailable`.
    pub async fn load(
        messenger: Arc<dyn MessengerPort>,
        store: Arc<dyn StateStore>,
    ) -> Result<Self> {
        let table: HashMap<ChatId, TargetChat> = match store.get(TARGETS_KEY).await? {
            None => HashMap::new(),
            Some(raw) => {
                let entries: Vec<TargetChat> = serde_json::from_str(&raw).map_err(|e| {
                    crate::Error::StorageUnavailable(format!("corrupt target table: {e}"))
                })?;
                entries.into_iter().map(|t| (t.chat_id, t)).collect()
            }
        };

        info!(targets = table.len(), "target chat table loaded");
        let (revision, _) = watch::channel(0);
        Ok(Self {
            messenger,
            store,
            inner: RwLock::new(table),
            revision,
        })
    }

    /// Watch for table changes (revision counter bumps on every mutation).
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Active targets, ordered by chat id for deterministic dispatch.
    pub async fn list_active_targets(&self) -> Vec<TargetChat> {
        let table = self.inner.read().await;
        let mut active: Vec<_> = table.values().filter(|t| t.is_active).cloned().collect();
        active.sort_by_key(|t| t.chat_id);
        active
    }

    /// Every known target, active or not, ordered by chat id.
    pub async fn snapshot(&self) -> Vec<TargetChat> {
        let table = self.inner.read().await;
        let mut all: Vec<_> = table.values().cloned().collect();
        all.sort_by_key(|t| t.chat_id);
        all
    }

    /// Record that the bot joined (or was re-added to) a chat. A re-add
    /// keeps the remembered pin so it still gets rotated out.
    pub async fn upsert(&self, chat_id: ChatId, title: String) -> Result<()> {
        let mut table = self.inner.write().await;
        let pinned_message_id = table.get(&chat_id).and_then(|t| t.pinned_message_id);
        table.insert(
            chat_id,
            TargetChat {
                chat_id,
                title,
                is_active: true,
                last_verified_at: Utc::now(),
                pinned_message_id,
            },
        );
        self.persist_and_notify(&table).await
    }

    /// The bot's current pin in `chat`, if any.
    pub async fn pinned_message(&self, chat_id: ChatId) -> Option<MessageId> {
        let table = self.inner.read().await;
        table.get(&chat_id).and_then(|t| t.pinned_message_id)
    }

    /// Remember the message the bot just pinned in `chat`.
    pub async fn set_pinned(&self, chat_id: ChatId, id: MessageId) -> Result<()> {
        let mut table = self.inner.write().await;
        let Some(target) = table.get_mut(&chat_id) else {
            return Ok(());
        };
        target.pinned_message_id = Some(id);
        self.persist_and_notify(&table).await
    }

    /// Record that the bot left or was removed from a chat. Unknown chats
    /// are ignored.
    pub async fn mark_inactive(&self, chat_id: ChatId) -> Result<()> {
        let mut table = self.inner.write().await;
        let Some(target) = table.get_mut(&chat_id) else {
            return Ok(());
        };
        if !target.is_active {
            return Ok(());
        }
        target.is_active = false;
        target.last_verified_at = Utc::now();
        info!(%chat_id, title = %target.title, "target chat demoted to inactive");
        self.persist_and_notify(&table).await
    }

    /// Re-verify entries not checked within `max_age` against live
    /// membership. A confirmed membership refreshes title and timestamp (and
    /// reactivates the entry); confirmed removal demotes it; a transport
    /// error leaves the entry untouched for the next pass.
    pub async fn refresh(&self, max_age: Duration) -> Result<()> {
        let stale: Vec<ChatId> = {
            let table = self.inner.read().await;
            let now = Utc::now();
            table
                .values()
                .filter(|t| {
                    now.signed_duration_since(t.last_verified_at)
                        .to_std()
                        .map(|age| age >= max_age)
                        .unwrap_or(false)
                })
                .map(|t| t.chat_id)
                .collect()
        };

        if stale.is_empty() {
            return Ok(());
        }

        let mut verdicts = Vec::with_capacity(stale.len());
        for chat_id in stale {
            match self.messenger.probe_chat(chat_id).await {
                Ok(meta) => verdicts.push((chat_id, meta)),
                Err(e) => warn!(%chat_id, error = %e, "membership probe failed, keeping entry"),
            }
        }

        let mut table = self.inner.write().await;
        let mut changed = false;
        for (chat_id, meta) in verdicts {
            let Some(target) = table.get_mut(&chat_id) else {
                continue;
            };
            match meta {
                Some(meta) => {
                    target.title = meta.title;
                    target.is_active = true;
                    target.last_verified_at = Utc::now();
                }
                None => {
                    info!(%chat_id, title = %target.title, "bot no longer member, demoting");
                    target.is_active = false;
                    target.last_verified_at = Utc::now();
                }
            }
            changed = true;
        }

        if changed {
            self.persist_and_notify(&table).await?;
        }
        Ok(())
    }

    async fn persist_and_notify(&self, table: &HashMap<ChatId, TargetChat>) -> Result<()> {
        let mut entries: Vec<_> = table.values().cloned().collect();
        entries.sort_by_key(|t| t.chat_id);
        let raw = serde_json::to_string(&entries)?;
        self.store.put(TARGETS_KEY, &raw).await?;
        self.revision.send_modify(|rev| *rev += 1);
        Ok(())
    }
}
