//! Forward scheduler: the periodic engine that resolves the latest channel
//! message and re-posts it into every active target chat.
//!
//! One cycle = resolve candidate (via [`MessageLocator`]) → dispatch to
//! targets (bounded concurrency, per-send timeout, one retry for transient
//! failures, fresh copy pinned in place of the previous one) → persist
//! advanced state → record the cycle for `/stats`.
//!
//! Cycles never overlap: the ticker skips a tick if the previous cycle is
//! still running, and manual operations queue behind the cycle lock.

use std::{fmt, sync::Arc, time::Duration};

use chrono::Utc;
use tokio::{
    sync::Semaphore,
    task::{JoinHandle, JoinSet},
    time::{interval_at, sleep, timeout, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    cache::ChatCache,
    config::Config,
    domain::{ChatId, Direction, MessageId},
    errors::Error,
    locator::{Existence, MessageLocator, Resolution},
    ports::{AlertSink, MessengerPort, SendOutcome, StateStore},
    state::{ForwardState, ForwardStateStore},
    stats::{CycleResult, CycleStats, TargetOutcome},
    Result,
};

const TRANSIENT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Lifecycle of the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// Constructed, ticker not armed.
    Idle,
    /// Ticker armed, waiting for the next tick.
    Running,
    /// A cycle is executing right now.
    CycleInProgress,
    /// Disarmed after repeated failures or by an operator.
    Paused,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Idle => "idle",
            Mode::Running => "running",
            Mode::CycleInProgress => "cycle in progress",
            Mode::Paused => "paused",
        };
        f.write_str(s)
    }
}

#[derive(Clone)]
pub struct ForwardScheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    cfg: Arc<Config>,
    locator: MessageLocator,
    cache: Arc<ChatCache>,
    messenger: Arc<dyn MessengerPort>,
    alerts: Arc<dyn AlertSink>,
    states: ForwardStateStore,
    stats: CycleStats,
    state: tokio::sync::Mutex<SchedulerState>,
    /// Serializes cycles and manual state mutations. The ticker uses
    /// `try_lock` and skips; operator commands wait.
    cycle_lock: tokio::sync::Mutex<()>,
}

struct SchedulerState {
    mode: Mode,
    forward: ForwardState,
    ticker: Option<JoinHandle<()>>,
    ticker_cancel: Option<CancellationToken>,
}

enum Attempt {
    /// Carries the id of the copy created in the target chat.
    Sent(MessageId),
    Transient,
    Permanent,
}

impl ForwardScheduler {
    pub fn new(
        cfg: Arc<Config>,
        messenger: Arc<dyn MessengerPort>,
        store: Arc<dyn StateStore>,
        cache: Arc<ChatCache>,
        alerts: Arc<dyn AlertSink>,
        initial: ForwardState,
    ) -> Self {
        let locator = MessageLocator::new(messenger.clone(), cfg.source_channel.clone());
        let states = ForwardStateStore::new(store, cfg.save_retries);
        let stats = CycleStats::new(cfg.history_capacity);
        Self {
            inner: Arc::new(SchedulerInner {
                cfg,
                locator,
                cache,
                messenger,
                alerts,
                states,
                stats,
                state: tokio::sync::Mutex::new(SchedulerState {
                    mode: Mode::Idle,
                    forward: initial,
                    ticker: None,
                    ticker_cancel: None,
                }),
                cycle_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Arm the ticker. The first cycle runs one full interval after start,
    /// so a restart does not immediately re-post. Idempotent while already
    /// running.
    pub async fn start(&self) {
        let mut st = self.inner.state.lock().await;
        if st.ticker.is_some() {
            st.mode = Mode::Running;
            return;
        }

        let cancel = CancellationToken::new();
        st.ticker_cancel = Some(cancel.clone());

        let scheduler = self.clone();
        st.ticker = Some(tokio::spawn(async move {
            let period = scheduler.inner.cfg.tick_interval;
            let mut tick = interval_at(Instant::now() + period, period);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => scheduler.try_tick().await,
                }
            }
        }));

        st.mode = Mode::Running;
        info!(
            interval_secs = self.inner.cfg.tick_interval.as_secs(),
            "forward scheduler started"
        );
    }

    /// Disarm the ticker. The cancellation token stops the loop; the task is
    /// never aborted so an in-flight cycle always finishes cleanly.
    pub async fn pause(&self) {
        self.disarm(Mode::Paused).await;
        info!("forward scheduler paused");
    }

    /// Rearm after a pause and forget accumulated failures, so the next
    /// cycle gets a full failure window again.
    pub async fn resume(&self) -> Result<()> {
        let snapshot = {
            let mut st = self.inner.state.lock().await;
            st.forward.consecutive_failures = 0;
            st.forward.clone()
        };
        if let Err(e) = self.inner.states.save(&snapshot).await {
            warn!(error = %e, "failed to persist failure-counter reset");
        }
        self.start().await;
        Ok(())
    }

    pub async fn stop(&self) {
        self.disarm(Mode::Idle).await;
        info!("forward scheduler stopped");
    }

    async fn disarm(&self, mode: Mode) {
        let mut st = self.inner.state.lock().await;
        if let Some(tok) = st.ticker_cancel.take() {
            tok.cancel();
        }
        st.ticker.take();
        st.mode = mode;
    }

    pub async fn mode(&self) -> Mode {
        self.inner.state.lock().await.mode
    }

    pub async fn forward_state(&self) -> ForwardState {
        self.inner.state.lock().await.forward.clone()
    }

    pub async fn last_id(&self) -> MessageId {
        self.inner.state.lock().await.forward.last_message_id
    }

    pub fn stats(&self) -> &CycleStats {
        &self.inner.stats
    }

    /// Run one cycle now, waiting for any in-flight cycle to finish first.
    pub async fn forward_now(&self) -> Result<CycleResult> {
        let _guard = self.inner.cycle_lock.lock().await;
        self.run_cycle().await
    }

    /// Operator override of the stored candidate id. This is the only way
    /// the stored id can move backwards.
    pub async fn override_last_id(&self, id: MessageId) -> Result<()> {
        let _guard = self.inner.cycle_lock.lock().await;

        let mut next = self.forward_state().await;
        next.last_message_id = id;
        next.consecutive_failures = 0;
        self.inner.states.save(&next).await?;

        let mut st = self.inner.state.lock().await;
        st.forward = next;
        info!(%id, "candidate id overridden");
        Ok(())
    }

    /// A new post appeared in the source channel; advance the stored id so
    /// the next cycle picks it up without probing from an old anchor. Ids at
    /// or below the stored one are ignored (out-of-order updates).
    ///
    /// Non-blocking: while a cycle is running this returns `LockContention`
    /// and the post is simply picked up by the forward sweep instead.
    pub async fn observe_channel_post(&self, id: MessageId) -> Result<()> {
        let _guard = self
            .inner
            .cycle_lock
            .try_lock()
            .map_err(|_| Error::LockContention)?;

        let mut next = self.forward_state().await;
        if id <= next.last_message_id {
            return Ok(());
        }
        // Anchor on the post *before* the new one so the next backward probe
        // starts at the fresh post itself.
        next.last_message_id = MessageId(id.0 - 1);
        self.inner.states.save(&next).await?;

        let mut st = self.inner.state.lock().await;
        st.forward = next;
        debug!(%id, "channel post observed");
        Ok(())
    }

    /// Single existence check for one channel message (`/test`).
    pub async fn test_message(&self, id: MessageId) -> Existence {
        self.inner.locator.validate(id).await
    }

    /// Scan backwards from the stored id for the newest surviving message
    /// (`/findlast`). Read-only: the stored id is not touched.
    pub async fn find_last_valid(&self) -> Result<Resolution> {
        let from = self.last_id().await;
        self.inner
            .locator
            .find_latest_valid(from, Direction::Backward, self.inner.cfg.max_probe_steps)
            .await
    }

    async fn try_tick(&self) {
        let Ok(_guard) = self.inner.cycle_lock.try_lock() else {
            warn!("previous cycle still running, skipping tick");
            return;
        };
        if let Err(e) = self.run_cycle().await {
            warn!(error = %e, "scheduled cycle failed");
        }
    }

    /// One full cycle. Caller must hold `cycle_lock`.
    async fn run_cycle(&self) -> Result<CycleResult> {
        let started_at = Utc::now();
        let prev_mode = {
            let mut st = self.inner.state.lock().await;
            let prev = st.mode;
            st.mode = Mode::CycleInProgress;
            prev
        };

        let result = self.run_cycle_inner(started_at).await;

        // Restore mode unless a failure path already moved it (pause).
        let mut st = self.inner.state.lock().await;
        if st.mode == Mode::CycleInProgress {
            st.mode = prev_mode;
        }
        result
    }

    async fn run_cycle_inner(
        &self,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<CycleResult> {
        // Reconcile the target table first so this cycle dispatches against
        // fresh membership.
        if let Err(e) = self.inner.cache.refresh(self.inner.cfg.cache_max_age).await {
            warn!(error = %e, "target cache refresh failed, using stale table");
        }

        let anchor = self.last_id().await;
        let resolution = match self
            .inner
            .locator
            .find_latest_valid(anchor, Direction::Forward, self.inner.cfg.max_probe_steps)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                self.note_cycle_failure(&format!("source channel unreachable: {e}"))
                    .await;
                self.record_empty_cycle(anchor, started_at);
                return Err(e);
            }
        };

        if !resolution.found {
            let (lo, hi) = resolution.probed;
            self.note_cycle_failure(&format!("no forwardable message in {lo}..={hi}"))
                .await;
            self.record_empty_cycle(anchor, started_at);
            return Err(Error::ProbeExhausted { lo, hi });
        }

        let candidate = resolution.resolved_id;
        let targets = self.inner.cache.snapshot().await;
        let active: Vec<ChatId> = targets
            .iter()
            .filter(|t| t.is_active)
            .map(|t| t.chat_id)
            .collect();

        let mut per_target: Vec<(ChatId, TargetOutcome)> = targets
            .iter()
            .filter(|t| !t.is_active)
            .map(|t| (t.chat_id, TargetOutcome::SkippedInactive))
            .collect();

        per_target.extend(self.dispatch_all(&active, candidate).await);
        per_target.sort_by_key(|(chat, _)| *chat);

        let result = CycleResult {
            candidate,
            per_target,
            started_at,
            finished_at: Utc::now(),
        };
        let sent = result.sent();
        info!(
            %candidate,
            sent,
            failed = result.failed(),
            skipped = result.skipped(),
            "forward cycle finished"
        );

        if sent == 0 && !active.is_empty() {
            self.note_cycle_failure("every target dispatch failed").await;
            self.inner.stats.record(result.clone());
            return Ok(result);
        }

        // Commit progress: advance the anchor (never backwards), reset the
        // failure counter, stamp the forward time when something went out.
        let mut next = self.forward_state().await;
        next.last_message_id = candidate.max(next.last_message_id);
        next.consecutive_failures = 0;
        if sent > 0 {
            next.last_forwarded_at = Some(result.finished_at);
        }

        if let Err(e) = self.inner.states.save(&next).await {
            // Without durable progress the next cycle could double-post;
            // stop the ticker and page the operator instead.
            error!(error = %e, "state save exhausted retries, pausing");
            self.pause().await;
            self.inner
                .alerts
                .alert(&format!(
                    "\u{26a0} Forwarding paused: cannot persist state ({e}). \
                     Fix storage and /resume."
                ))
                .await;
            self.inner.stats.record(result);
            return Err(e);
        }

        {
            let mut st = self.inner.state.lock().await;
            st.forward = next;
        }
        self.inner.stats.record(result.clone());
        Ok(result)
    }

    async fn dispatch_all(
        &self,
        active: &[ChatId],
        candidate: MessageId,
    ) -> Vec<(ChatId, TargetOutcome)> {
        let semaphore = Arc::new(Semaphore::new(self.inner.cfg.send_concurrency));
        let mut join = JoinSet::new();

        for &chat in active {
            let this = self.clone();
            let sem = semaphore.clone();
            join.spawn(async move {
                let _permit = match sem.acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => return (chat, TargetOutcome::FailedTransient),
                };
                let outcome = this.dispatch_one(chat, candidate).await;
                (chat, outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(active.len());
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok(entry) => outcomes.push(entry),
                Err(e) => warn!(error = %e, "dispatch task panicked"),
            }
        }
        outcomes
    }

    /// One target: attempt, and retry once after a short delay if the
    /// failure looked transient. A delivered copy replaces the previously
    /// pinned one.
    async fn dispatch_one(&self, target: ChatId, id: MessageId) -> TargetOutcome {
        match self.attempt_send(target, id).await {
            Attempt::Sent(copy) => {
                self.rotate_pin(target, copy).await;
                TargetOutcome::Sent
            }
            Attempt::Permanent => self.demote(target).await,
            Attempt::Transient => {
                sleep(TRANSIENT_RETRY_DELAY).await;
                match self.attempt_send(target, id).await {
                    Attempt::Sent(copy) => {
                        self.rotate_pin(target, copy).await;
                        TargetOutcome::Sent
                    }
                    Attempt::Permanent => self.demote(target).await,
                    Attempt::Transient => TargetOutcome::FailedTransient,
                }
            }
        }
    }

    async fn attempt_send(&self, target: ChatId, id: MessageId) -> Attempt {
        let send = self
            .inner
            .messenger
            .send_or_copy(target, self.inner.locator.channel(), id);
        match timeout(self.inner.cfg.per_send_timeout, send).await {
            Err(_) => {
                warn!(%target, %id, "send timed out");
                Attempt::Transient
            }
            Ok(Ok(SendOutcome::Sent(copy))) => Attempt::Sent(copy),
            Ok(Ok(SendOutcome::RateLimited)) => Attempt::Transient,
            Ok(Ok(SendOutcome::NotFound)) => {
                warn!(%target, %id, "source message vanished mid-cycle");
                Attempt::Transient
            }
            Ok(Ok(SendOutcome::Forbidden)) => Attempt::Permanent,
            Ok(Err(e)) => {
                warn!(%target, %id, error = %e, "send failed");
                Attempt::Transient
            }
        }
    }

    /// Unpin the copy from the previous cycle and pin the fresh one.
    /// Best-effort: pin failures never fail the dispatch, the message is
    /// already delivered.
    async fn rotate_pin(&self, target: ChatId, copy: MessageId) {
        if let Some(previous) = self.inner.cache.pinned_message(target).await {
            if let Err(e) = self.inner.messenger.unpin_message(target, previous).await {
                warn!(%target, %previous, error = %e, "failed to unpin previous copy");
            }
        }
        match self.inner.messenger.pin_message(target, copy).await {
            Ok(()) => {
                if let Err(e) = self.inner.cache.set_pinned(target, copy).await {
                    warn!(%target, %copy, error = %e, "failed to record pinned copy");
                }
            }
            Err(e) => warn!(%target, %copy, error = %e, "failed to pin fresh copy"),
        }
    }

    async fn demote(&self, target: ChatId) -> TargetOutcome {
        if let Err(e) = self.inner.cache.mark_inactive(target).await {
            warn!(%target, error = %e, "failed to demote forbidden target");
        }
        TargetOutcome::FailedPermanent
    }

    fn record_empty_cycle(&self, anchor: MessageId, started_at: chrono::DateTime<Utc>) {
        self.inner.stats.record(CycleResult {
            candidate: anchor,
            per_target: Vec::new(),
            started_at,
            finished_at: Utc::now(),
        });
    }

    /// Bump the failure counter, persist it best-effort, and pause + alert
    /// once the threshold is hit.
    async fn note_cycle_failure(&self, context: &str) {
        let (snapshot, failures) = {
            let mut st = self.inner.state.lock().await;
            st.forward.consecutive_failures += 1;
            (st.forward.clone(), st.forward.consecutive_failures)
        };

        if let Err(e) = self.inner.states.save(&snapshot).await {
            warn!(error = %e, "failed to persist failure counter");
        }
        warn!(failures, context, "forward cycle failed");

        if failures >= self.inner.cfg.failure_threshold {
            self.pause().await;
            self.inner
                .alerts
                .alert(&format!(
                    "\u{23f8} Forwarding paused after {failures} consecutive failures. \
                     Last error: {context}. Use /resume when fixed."
                ))
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet, VecDeque},
        path::PathBuf,
    };

    use async_trait::async_trait;
    use tokio::sync::{Mutex, Notify};

    use crate::{
        domain::ChannelRef,
        ports::ChatMeta,
    };

    use super::*;

    /// Copies land in target chats at `source id + 1000`.
    const COPY_OFFSET: i32 = 1000;

    struct MockPlatform {
        existing: Mutex<HashSet<i32>>,
        unreachable: bool,
        /// Scripted outcomes per chat; defaults to a successful copy when
        /// exhausted.
        scripts: Mutex<HashMap<i64, VecDeque<SendOutcome>>>,
        sends: Mutex<Vec<(i64, i32)>>,
        pins: Mutex<Vec<(i64, i32)>>,
        unpins: Mutex<Vec<(i64, i32)>>,
        /// When set, the next send parks on `release` after signalling
        /// `entered`, letting a test observe a cycle in flight.
        hold_send: std::sync::atomic::AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl MockPlatform {
        fn new(ids: &[i32], unreachable: bool) -> Arc<Self> {
            Arc::new(Self {
                existing: Mutex::new(ids.iter().copied().collect()),
                unreachable,
                scripts: Mutex::new(HashMap::new()),
                sends: Mutex::new(Vec::new()),
                pins: Mutex::new(Vec::new()),
                unpins: Mutex::new(Vec::new()),
                hold_send: std::sync::atomic::AtomicBool::new(false),
                entered: Notify::new(),
                release: Notify::new(),
            })
        }

        fn with_ids(ids: &[i32]) -> Arc<Self> {
            Self::new(ids, false)
        }

        fn unreachable() -> Arc<Self> {
            Self::new(&[], true)
        }

        async fn script(&self, chat: i64, outcomes: &[SendOutcome]) {
            self.scripts
                .lock()
                .await
                .insert(chat, outcomes.iter().copied().collect());
        }

        async fn sends(&self) -> Vec<(i64, i32)> {
            self.sends.lock().await.clone()
        }

        fn hold_next_send(&self) {
            self.hold_send
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl MessengerPort for MockPlatform {
        async fn send_or_copy(
            &self,
            target: ChatId,
            _source: &ChannelRef,
            id: MessageId,
        ) -> Result<SendOutcome> {
            self.sends.lock().await.push((target.0, id.0));
            if self
                .hold_send
                .swap(false, std::sync::atomic::Ordering::SeqCst)
            {
                self.entered.notify_one();
                self.release.notified().await;
            }
            let mut scripts = self.scripts.lock().await;
            let outcome = scripts
                .get_mut(&target.0)
                .and_then(|q| q.pop_front())
                .unwrap_or(SendOutcome::Sent(MessageId(id.0 + COPY_OFFSET)));
            Ok(outcome)
        }

        async fn message_exists(&self, _source: &ChannelRef, id: MessageId) -> Result<bool> {
            if self.unreachable {
                return Err(Error::External("channel gone".to_string()));
            }
            Ok(self.existing.lock().await.contains(&id.0))
        }

        async fn probe_chat(&self, _chat: ChatId) -> Result<Option<ChatMeta>> {
            Ok(Some(ChatMeta {
                title: "chat".to_string(),
                member_count: None,
            }))
        }

        async fn pin_message(&self, chat: ChatId, id: MessageId) -> Result<()> {
            self.pins.lock().await.push((chat.0, id.0));
            Ok(())
        }

        async fn unpin_message(&self, chat: ChatId, id: MessageId) -> Result<()> {
            self.unpins.lock().await.push((chat.0, id.0));
            Ok(())
        }
    }

    struct MemStore {
        doc: Mutex<HashMap<String, String>>,
        fail_puts: std::sync::atomic::AtomicBool,
    }

    impl MemStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                doc: Mutex::new(HashMap::new()),
                fail_puts: std::sync::atomic::AtomicBool::new(false),
            })
        }

        fn fail_puts(&self) {
            self.fail_puts
                .store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StateStore for MemStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            Ok(self.doc.lock().await.get(key).cloned())
        }

        async fn put(&self, key: &str, value: &str) -> Result<()> {
            if self.fail_puts.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(Error::StorageUnavailable("disk gone".to_string()));
            }
            self.doc
                .lock()
                .await
                .insert(key.to_string(), value.to_string());
            Ok(())
        }
    }

    struct RecordingAlerts {
        alerts: Mutex<Vec<String>>,
    }

    impl RecordingAlerts {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                alerts: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AlertSink for RecordingAlerts {
        async fn alert(&self, text: &str) {
            self.alerts.lock().await.push(text.to_string());
        }
    }

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            bot_token: "token".to_string(),
            admin_ids: vec![1],
            source_channel: ChannelRef::Username("chan".to_string()),
            tick_interval: Duration::from_secs(300),
            max_probe_steps: 5,
            failure_threshold: 2,
            per_send_timeout: Duration::from_secs(5),
            send_concurrency: 4,
            state_path: PathBuf::from("unused.json"),
            save_retries: 1,
            cache_max_age: Duration::from_secs(3600),
            history_capacity: 20,
        })
    }

    struct Fixture {
        scheduler: ForwardScheduler,
        platform: Arc<MockPlatform>,
        cache: Arc<ChatCache>,
        store: Arc<MemStore>,
        alerts: Arc<RecordingAlerts>,
    }

    async fn fixture(platform: Arc<MockPlatform>, last_id: i32) -> Fixture {
        let store = MemStore::new();
        let alerts = RecordingAlerts::new();
        let cache = Arc::new(
            ChatCache::load(platform.clone(), store.clone())
                .await
                .unwrap(),
        );
        let initial = ForwardState {
            last_message_id: MessageId(last_id),
            ..ForwardState::default()
        };
        let scheduler = ForwardScheduler::new(
            test_config(),
            platform.clone(),
            store.clone(),
            cache.clone(),
            alerts.clone(),
            initial,
        );
        Fixture {
            scheduler,
            platform,
            cache,
            store,
            alerts,
        }
    }

    async fn persisted_last_id(store: &MemStore) -> i32 {
        let raw = store.doc.lock().await.get("forward_state").cloned().unwrap();
        let state: ForwardState = serde_json::from_str(&raw).unwrap();
        state.last_message_id.0
    }

    #[tokio::test]
    async fn cycle_forwards_latest_to_all_active_targets() {
        let f = fixture(MockPlatform::with_ids(&[101, 103]), 100).await;
        f.cache.upsert(ChatId(10), "A".to_string()).await.unwrap();
        f.cache.upsert(ChatId(20), "B".to_string()).await.unwrap();

        let result = f.scheduler.forward_now().await.unwrap();
        assert_eq!(result.candidate, MessageId(103));
        assert_eq!(result.sent(), 2);
        assert_eq!(result.failed(), 0);

        let sends = f.platform.sends().await;
        assert!(sends.contains(&(10, 103)));
        assert!(sends.contains(&(20, 103)));

        let state = f.scheduler.forward_state().await;
        assert_eq!(state.last_message_id, MessageId(103));
        assert!(state.last_forwarded_at.is_some());
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(persisted_last_id(&f.store).await, 103);
    }

    #[tokio::test]
    async fn inactive_targets_are_skipped() {
        let f = fixture(MockPlatform::with_ids(&[101]), 100).await;
        f.cache.upsert(ChatId(10), "A".to_string()).await.unwrap();
        f.cache.upsert(ChatId(20), "B".to_string()).await.unwrap();
        f.cache.mark_inactive(ChatId(20)).await.unwrap();

        let result = f.scheduler.forward_now().await.unwrap();
        assert_eq!(result.sent(), 1);
        assert_eq!(result.skipped(), 1);

        let sends = f.platform.sends().await;
        assert!(sends.iter().all(|(chat, _)| *chat != 20));
    }

    #[tokio::test]
    async fn forbidden_target_is_demoted() {
        let f = fixture(MockPlatform::with_ids(&[101]), 100).await;
        f.cache.upsert(ChatId(10), "A".to_string()).await.unwrap();
        f.cache.upsert(ChatId(20), "B".to_string()).await.unwrap();
        f.platform.script(20, &[SendOutcome::Forbidden]).await;

        let result = f.scheduler.forward_now().await.unwrap();
        assert_eq!(result.sent(), 1);
        assert_eq!(result.failed(), 1);

        let active = f.cache.list_active_targets().await;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].chat_id, ChatId(10));

        // Forwarding still succeeded, so the anchor advanced.
        assert_eq!(f.scheduler.last_id().await, MessageId(101));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_send_is_retried_once() {
        let f = fixture(MockPlatform::with_ids(&[101]), 100).await;
        f.cache.upsert(ChatId(10), "A".to_string()).await.unwrap();
        f.platform
            .script(
                10,
                &[SendOutcome::RateLimited, SendOutcome::Sent(MessageId(1101))],
            )
            .await;

        let result = f.scheduler.forward_now().await.unwrap();
        assert_eq!(result.sent(), 1);
        assert_eq!(f.platform.sends().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn twice_rate_limited_is_transient_failure() {
        let f = fixture(MockPlatform::with_ids(&[101]), 100).await;
        f.cache.upsert(ChatId(10), "A".to_string()).await.unwrap();
        f.platform
            .script(10, &[SendOutcome::RateLimited, SendOutcome::RateLimited])
            .await;

        let result = f.scheduler.forward_now().await.unwrap();
        assert_eq!(result.sent(), 0);
        assert_eq!(result.failed(), 1);

        // Nothing went out; the anchor must not move.
        assert_eq!(f.scheduler.last_id().await, MessageId(100));
        assert_eq!(f.scheduler.forward_state().await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn sent_copy_is_pinned_and_previous_pin_rotated_out() {
        let f = fixture(MockPlatform::with_ids(&[101]), 100).await;
        f.cache.upsert(ChatId(10), "A".to_string()).await.unwrap();

        f.scheduler.forward_now().await.unwrap();
        assert_eq!(f.platform.pins.lock().await.clone(), vec![(10, 1101)]);
        assert!(f.platform.unpins.lock().await.is_empty());
        assert_eq!(
            f.cache.pinned_message(ChatId(10)).await,
            Some(MessageId(1101))
        );

        // Next post: the old pin is removed before the new copy is pinned.
        f.platform.existing.lock().await.insert(102);
        f.scheduler.forward_now().await.unwrap();
        assert_eq!(f.platform.unpins.lock().await.clone(), vec![(10, 1101)]);
        assert_eq!(
            f.platform.pins.lock().await.clone(),
            vec![(10, 1101), (10, 1102)]
        );
        assert_eq!(
            f.cache.pinned_message(ChatId(10)).await,
            Some(MessageId(1102))
        );
    }

    #[tokio::test]
    async fn manual_operations_queue_behind_running_cycle() {
        let f = fixture(MockPlatform::with_ids(&[101]), 100).await;
        f.cache.upsert(ChatId(10), "A".to_string()).await.unwrap();

        f.platform.hold_next_send();
        let first = {
            let scheduler = f.scheduler.clone();
            tokio::spawn(async move { scheduler.forward_now().await })
        };
        f.platform.entered.notified().await;

        // Channel-post observation must not block on the in-flight cycle.
        let err = f
            .scheduler
            .observe_channel_post(MessageId(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LockContention), "{err}");

        // A second manual cycle waits for the lock instead.
        let second = {
            let scheduler = f.scheduler.clone();
            tokio::spawn(async move { scheduler.forward_now().await })
        };

        f.platform.release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.sent(), 1);
        let second = second.await.unwrap().unwrap();
        assert_eq!(second.sent(), 1);
        // The cycles ran back to back, never interleaved.
        assert_eq!(f.platform.sends().await.len(), 2);
    }

    #[tokio::test]
    async fn stored_id_never_regresses_on_backward_recovery() {
        // Anchor 100 was deleted; only 97 survives. It gets re-posted but
        // the anchor stays at 100.
        let f = fixture(MockPlatform::with_ids(&[97]), 100).await;
        f.cache.upsert(ChatId(10), "A".to_string()).await.unwrap();

        let result = f.scheduler.forward_now().await.unwrap();
        assert_eq!(result.candidate, MessageId(97));
        assert_eq!(result.sent(), 1);
        assert_eq!(f.scheduler.last_id().await, MessageId(100));
        assert_eq!(persisted_last_id(&f.store).await, 100);
    }

    #[tokio::test]
    async fn probe_exhaustion_pauses_at_threshold_and_alerts() {
        let f = fixture(MockPlatform::with_ids(&[]), 100).await;
        f.scheduler.start().await;

        let err = f.scheduler.forward_now().await.unwrap_err();
        assert!(matches!(err, Error::ProbeExhausted { .. }), "{err}");
        assert_eq!(f.scheduler.mode().await, Mode::Running);

        let err = f.scheduler.forward_now().await.unwrap_err();
        assert!(matches!(err, Error::ProbeExhausted { .. }), "{err}");
        assert_eq!(f.scheduler.mode().await, Mode::Paused);
        assert_eq!(f.alerts.alerts.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn inaccessible_channel_counts_as_failure() {
        let f = fixture(MockPlatform::unreachable(), 100).await;
        let err = f.scheduler.forward_now().await.unwrap_err();
        assert!(matches!(err, Error::Inaccessible(_)), "{err}");
        assert_eq!(f.scheduler.forward_state().await.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn success_resets_failure_counter() {
        let f = fixture(MockPlatform::with_ids(&[]), 100).await;
        let _ = f.scheduler.forward_now().await;
        assert_eq!(f.scheduler.forward_state().await.consecutive_failures, 1);

        f.platform.existing.lock().await.insert(101);
        f.cache.upsert(ChatId(10), "A".to_string()).await.unwrap();
        let result = f.scheduler.forward_now().await.unwrap();
        assert_eq!(result.sent(), 1);
        assert_eq!(f.scheduler.forward_state().await.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn save_failure_after_dispatch_pauses_and_alerts() {
        let f = fixture(MockPlatform::with_ids(&[101]), 100).await;
        f.cache.upsert(ChatId(10), "A".to_string()).await.unwrap();
        f.store.fail_puts();

        let err = f.scheduler.forward_now().await.unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable(_)), "{err}");
        assert_eq!(f.scheduler.mode().await, Mode::Paused);
        assert_eq!(f.alerts.alerts.lock().await.len(), 1);
        // In-memory anchor keeps the last durable value.
        assert_eq!(f.scheduler.last_id().await, MessageId(100));
    }

    #[tokio::test]
    async fn observe_channel_post_advances_monotonically() {
        let f = fixture(MockPlatform::with_ids(&[]), 100).await;

        f.scheduler
            .observe_channel_post(MessageId(105))
            .await
            .unwrap();
        assert_eq!(f.scheduler.last_id().await, MessageId(104));

        // Out-of-order lower id is ignored.
        f.scheduler
            .observe_channel_post(MessageId(103))
            .await
            .unwrap();
        assert_eq!(f.scheduler.last_id().await, MessageId(104));
    }

    #[tokio::test]
    async fn observed_post_is_forwarded_next_cycle() {
        let f = fixture(MockPlatform::with_ids(&[105]), 100).await;
        f.cache.upsert(ChatId(10), "A".to_string()).await.unwrap();

        f.scheduler
            .observe_channel_post(MessageId(105))
            .await
            .unwrap();
        let result = f.scheduler.forward_now().await.unwrap();
        assert_eq!(result.candidate, MessageId(105));
        assert_eq!(f.scheduler.last_id().await, MessageId(105));
    }

    #[tokio::test]
    async fn override_allows_regression_and_persists() {
        let f = fixture(MockPlatform::with_ids(&[]), 100).await;
        f.scheduler.override_last_id(MessageId(50)).await.unwrap();
        assert_eq!(f.scheduler.last_id().await, MessageId(50));
        assert_eq!(persisted_last_id(&f.store).await, 50);
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let f = fixture(MockPlatform::with_ids(&[]), 100).await;
        assert_eq!(f.scheduler.mode().await, Mode::Idle);

        f.scheduler.start().await;
        assert_eq!(f.scheduler.mode().await, Mode::Running);

        f.scheduler.pause().await;
        assert_eq!(f.scheduler.mode().await, Mode::Paused);

        f.scheduler.resume().await.unwrap();
        assert_eq!(f.scheduler.mode().await, Mode::Running);

        f.scheduler.stop().await;
        assert_eq!(f.scheduler.mode().await, Mode::Idle);
    }

    #[tokio::test]
    async fn cycles_are_recorded_in_stats() {
        let f = fixture(MockPlatform::with_ids(&[101]), 100).await;
        f.cache.upsert(ChatId(10), "A".to_string()).await.unwrap();

        f.scheduler.forward_now().await.unwrap();
        let _ = f.scheduler.forward_now().await;

        let totals = f.scheduler.stats().statistics();
        assert_eq!(totals.uptime_cycles, 2);
        assert!(totals.total_sent >= 1);
    }
}
