use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    domain::MessageId,
    errors::Error,
    ports::StateStore,
    Result,
};

const STATE_KEY: &str = "forward_state";

/// Durable record of forwarding progress.
///
/// `last_message_id` is the newest channel message known to have been
/// dispatched (or explicitly set by an operator). It only ever moves forward;
/// regressions require an explicit operator override.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardState {
    pub last_message_id: MessageId,
    pub last_forwarded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl Default for ForwardState {
    fn default() -> Self {
        Self {
            last_message_id: MessageId::ZERO,
            last_forwarded_at: None,
            consecutive_failures: 0,
        }
    }
}

/// Loads and saves [`ForwardState`] through the key-value store, with bounded
/// retries on save.
///
/// Load distinguishes "no record yet" (fresh deploy, default state) from
/// "store unreadable" (refuse to proceed — starting from zero after a disk
/// hiccup would re-forward old messages).
#[derive(Clone)]
pub struct ForwardStateStore {
    store: Arc<dyn StateStore>,
    save_retries: u32,
}

impl ForwardStateStore {
    pub fn new(store: Arc<dyn StateStore>, save_retries: u32) -> Self {
        Self {
            store,
            save_retries,
        }
    }

    pub async fn load(&self) -> Result<ForwardState> {
        match self.store.get(STATE_KEY).await? {
            None => Ok(ForwardState::default()),
            Some(raw) => serde_json::from_str(&raw)
                .map_err(|e| Error::StorageUnavailable(format!("corrupt forward state: {e}"))),
        }
    }

    /// Persist `state`, retrying with backoff. The last error is returned if
    /// every attempt fails; callers decide whether that pauses the scheduler.
    pub async fn save(&self, state: &ForwardState) -> Result<()> {
        let raw = serde_json::to_string(state)?;

        let attempts = self.save_retries.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.store.put(STATE_KEY, &raw).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "state save failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            Error::StorageUnavailable("state save failed with no attempts".to_string())
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use super::*;

    /// Store that fails the first `fail_puts` put calls, then succeeds.
    struct FlakyStore {
        doc: Mutex<Option<String>>,
        fail_puts: AtomicU32,
        put_calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(fail_puts: u32) -> Self {
            Self {
                doc: Mutex::new(None),
                fail_puts: AtomicU32::new(fail_puts),
                put_calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl StateStore for FlakyStore {
        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(self.doc.lock().await.clone())
        }

        async fn put(&self, _key: &str, value: &str) -> Result<()> {
            self.put_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_puts.load(Ordering::SeqCst) > 0 {
                self.fail_puts.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::StorageUnavailable("disk on fire".to_string()));
            }
            *self.doc.lock().await = Some(value.to_string());
            Ok(())
        }
    }

    fn sample() -> ForwardState {
        ForwardState {
            last_message_id: MessageId(42),
            last_forwarded_at: Some(Utc::now()),
            consecutive_failures: 1,
        }
    }

    #[tokio::test]
    async fn load_missing_record_is_default() {
        let store = ForwardStateStore::new(Arc::new(FlakyStore::new(0)), 3);
        let state = store.load().await.unwrap();
        assert_eq!(state, ForwardState::default());
        assert_eq!(state.last_message_id, MessageId::ZERO);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = ForwardStateStore::new(Arc::new(FlakyStore::new(0)), 3);
        let state = sample();
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), state);
    }

    #[tokio::test(start_paused = true)]
    async fn save_retries_transient_failures() {
        let flaky = Arc::new(FlakyStore::new(2));
        let store = ForwardStateStore::new(flaky.clone(), 3);

        store.save(&sample()).await.unwrap();
        assert_eq!(flaky.put_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn save_gives_up_when_retries_exhausted() {
        let flaky = Arc::new(FlakyStore::new(10));
        let store = ForwardStateStore::new(flaky.clone(), 3);

        let err = store.save(&sample()).await.unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)), "{err}");
        assert_eq!(flaky.put_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn corrupt_record_is_storage_unavailable_not_default() {
        let flaky = Arc::new(FlakyStore::new(0));
        *flaky.doc.lock().await = Some("{broken".to_string());

        let store = ForwardStateStore::new(flaky, 3);
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)), "{err}");
    }
}
