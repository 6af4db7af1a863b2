//! Wiring: stores, correlator, generator, queues, workers, background jobs.
//!
//! ```text
//! Ingestor ─► EventStore ─► correlation queue ─► Correlator
//!                                                   │ trigger
//!                                                   ▼
//!                      ActionStore ◄─ ActionGenerator ◄─ generation queue
//! ```

pub mod backoff;
pub mod dead_letter;
pub mod queue;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::correlate::{
    Correlator, HotReloadPolicy, PolicySource, StaticPolicy, UserLocks,
};
use crate::generate::{ActionGenerator, GenerationOutcome, QualityGate};
use crate::ingest::retention::{RetentionJob, RetentionPolicy};
use crate::ingest::types::EventSink;
use crate::ingest::Ingestor;
use crate::notify::{NotifierMux, NotifyQueue, PipelineNotification};
use crate::query::ActionBoard;
use crate::reasoning::{DisabledClient, DynReasoningClient};
use crate::store::snapshot::Snapshot;
use crate::store::{
    ActionStore, EventStore, GroupStore, MemoryActionStore, MemoryEventStore, MemoryGroupStore,
    QuotaCounter, RollingQuota,
};

pub use backoff::retry_backoff;
pub use dead_letter::{DeadLetter, DeadLetterLog, Stage};
pub use queue::{shard_for, ShardedQueue, WorkItem};

/// How long shutdown waits for queued notifications to be delivered.
const NOTIFY_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The in-memory stores behind an engine.
#[derive(Clone, Default)]
pub struct MemoryStores {
    pub events: Arc<MemoryEventStore>,
    pub groups: Arc<MemoryGroupStore>,
    pub actions: Arc<MemoryActionStore>,
}

impl MemoryStores {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot::capture(&self.events, &self.groups, &self.actions)
    }
}

pub struct EngineBuilder {
    config: PipelineConfig,
    stores: MemoryStores,
    client: DynReasoningClient,
    notifier: NotifierMux,
    policy: Option<Arc<dyn PolicySource>>,
    quota: Option<Arc<dyn QuotaCounter>>,
    snapshot_path: Option<PathBuf>,
}

impl EngineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            stores: MemoryStores::default(),
            client: Arc::new(DisabledClient),
            notifier: NotifierMux::new(),
            policy: None,
            quota: None,
            snapshot_path: None,
        }
    }

    pub fn reasoning(mut self, client: DynReasoningClient) -> Self {
        self.client = client;
        self
    }

    pub fn notifier(mut self, notifier: NotifierMux) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn policy(mut self, policy: Arc<dyn PolicySource>) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn quota(mut self, quota: Arc<dyn QuotaCounter>) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn stores(mut self, stores: MemoryStores) -> Self {
        self.stores = stores;
        self
    }

    /// Restore from and periodically save to this file.
    pub fn snapshot_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.snapshot_path = Some(path.into());
        self
    }

    /// Build the engine and spawn its workers. Must run inside a Tokio runtime.
    pub fn build(self) -> anyhow::Result<Arc<Engine>> {
        crate::metrics::ensure_metrics_described();
        let cfg = self.config;
        let stores = self.stores;

        if let Some(path) = &self.snapshot_path {
            if let Some(snap) = Snapshot::load(path)? {
                tracing::info!(
                    target: "pipeline",
                    path = %path.display(),
                    events = snap.events.len(),
                    groups = snap.groups.len(),
                    actions = snap.actions.len(),
                    "restored snapshot"
                );
                snap.restore_into(&stores.events, &stores.groups, &stores.actions);
            }
        }

        let events: Arc<dyn EventStore> = stores.events.clone();
        let groups: Arc<dyn GroupStore> = stores.groups.clone();
        let actions: Arc<dyn ActionStore> = stores.actions.clone();
        let locks = UserLocks::new();

        let policy: Arc<dyn PolicySource> = match (self.policy, &cfg.correlation.policy_path) {
            (Some(p), _) => p,
            (None, Some(path)) => Arc::new(HotReloadPolicy::new(path, cfg.similarity.clone())),
            (None, None) => Arc::new(StaticPolicy::new(cfg.similarity.clone())),
        };
        let quota = self
            .quota
            .unwrap_or_else(|| Arc::new(RollingQuota::daily(cfg.generation.daily_limit)));

        let correlator = Arc::new(Correlator::new(
            events.clone(),
            groups.clone(),
            policy,
            locks.clone(),
            cfg.correlator_settings(),
        ));
        let generator = Arc::new(ActionGenerator::new(
            events.clone(),
            groups.clone(),
            actions.clone(),
            quota,
            self.client,
            QualityGate::from_config(&cfg.generation),
            cfg.links.clone(),
            locks.clone(),
            cfg.reasoning_timeout(),
        ));

        let w = &cfg.workers;
        let (correlation_q, correlation_rx) =
            ShardedQueue::new("correlation", w.correlation_shards, w.queue_capacity);
        let (generation_q, generation_rx) =
            ShardedQueue::new("generation", w.generation_shards, w.queue_capacity);

        let ingestor = Ingestor::new(
            events.clone(),
            chrono::Duration::seconds(cfg.ingest.max_future_skew_secs),
        )
        .with_sink(Arc::new(correlation_q.clone()));

        let notify_stop = CancellationToken::new();
        let (notifications, notify_task) =
            NotifyQueue::spawn(self.notifier, w.notification_capacity, notify_stop.clone());

        let engine = Arc::new(Engine {
            dead_letters: Arc::new(DeadLetterLog::with_capacity(w.dead_letter_capacity)),
            board: ActionBoard::new(actions.clone(), groups.clone()),
            retention: RetentionJob::new(
                events,
                groups,
                actions,
                locks.clone(),
                RetentionPolicy {
                    event_retention: cfg.event_retention(),
                    group_ttl: cfg.group_ttl(),
                    interval: Duration::from_secs(cfg.retention.sweep_interval_secs),
                },
            ),
            config: cfg,
            stores,
            ingestor,
            correlator,
            generator,
            notifications,
            notify_stop,
            notify_task: Mutex::new(Some(notify_task)),
            locks,
            correlation_q,
            generation_q,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            snapshot_path: self.snapshot_path,
        });
        engine.spawn_workers(correlation_rx, generation_rx);
        Ok(engine)
    }
}

pub struct Engine {
    pub config: PipelineConfig,
    stores: MemoryStores,
    ingestor: Ingestor,
    correlator: Arc<Correlator>,
    generator: Arc<ActionGenerator>,
    board: ActionBoard,
    retention: RetentionJob,
    notifications: NotifyQueue,
    notify_stop: CancellationToken,
    notify_task: Mutex<Option<JoinHandle<()>>>,
    dead_letters: Arc<DeadLetterLog>,
    locks: UserLocks,
    correlation_q: ShardedQueue,
    generation_q: ShardedQueue,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    snapshot_path: Option<PathBuf>,
}

#[async_trait]
impl EventSink for ShardedQueue {
    async fn enqueue(&self, user_id: &str, event_id: &str) {
        self.send(WorkItem {
            user_id: user_id.to_string(),
            id: event_id.to_string(),
        })
        .await;
    }
}

impl Engine {
    pub fn ingestor(&self) -> &Ingestor {
        &self.ingestor
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    pub fn generator(&self) -> &ActionGenerator {
        &self.generator
    }

    pub fn board(&self) -> &ActionBoard {
        &self.board
    }

    pub fn stores(&self) -> &MemoryStores {
        &self.stores
    }

    pub fn dead_letters(&self) -> &DeadLetterLog {
        &self.dead_letters
    }

    pub fn locks(&self) -> &UserLocks {
        &self.locks
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Work items and notifications queued or in flight.
    pub fn pending(&self) -> usize {
        self.correlation_q.depth() + self.generation_q.depth() + self.notifications.depth()
    }

    /// Poll until the queues and notification delivery drain. Returns false on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.pending() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        true
    }

    fn spawn_workers(
        self: &Arc<Self>,
        correlation_rx: Vec<mpsc::Receiver<WorkItem>>,
        generation_rx: Vec<mpsc::Receiver<WorkItem>>,
    ) {
        let mut tasks = self.tasks.lock();
        for (shard, rx) in correlation_rx.into_iter().enumerate() {
            let engine = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                engine.worker_loop(rx, shard, Stage::Correlation).await
            }));
        }
        for (shard, rx) in generation_rx.into_iter().enumerate() {
            let engine = Arc::clone(self);
            tasks.push(tokio::spawn(async move {
                engine.worker_loop(rx, shard, Stage::Generation).await
            }));
        }
        tracing::info!(
            target: "pipeline",
            correlation_workers = self.correlation_q.shards(),
            generation_workers = self.generation_q.shards(),
            "pipeline workers started"
        );
    }

    /// Spawn the retention sweep (and the snapshot loop when a path is set).
    pub fn spawn_background(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.retention.clone().run(self.cancel.clone()),
        ));
        if self.snapshot_path.is_some() {
            let engine = Arc::clone(self);
            tasks.push(tokio::spawn(async move { engine.snapshot_loop().await }));
        }
    }

    async fn worker_loop(&self, mut rx: mpsc::Receiver<WorkItem>, shard: usize, stage: Stage) {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                item = rx.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };
            match stage {
                Stage::Correlation => {
                    self.handle_event(&item).await;
                    self.correlation_q.finish();
                }
                Stage::Generation => {
                    self.handle_group(&item).await;
                    self.generation_q.finish();
                }
            }
        }
        tracing::debug!(target: "pipeline", shard, ?stage, "worker stopped");
    }

    /// Correlate one event, retrying transient store failures with backoff.
    pub async fn handle_event(&self, item: &WorkItem) {
        let max_retries = self.config.workers.max_retries;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match self.correlator.process(&item.id).await {
                Ok(outcome) => {
                    if let (true, Some(cid)) = (outcome.announce, &outcome.correlation_id) {
                        self.notifications
                            .submit(PipelineNotification::CorrelationCreated {
                                user_id: outcome.user_id.clone(),
                                correlation_id: cid.clone(),
                                strength: outcome.strength,
                                platforms: outcome.platforms.clone(),
                            });
                    }
                    if let (true, Some(cid)) = (outcome.trigger_generation, outcome.correlation_id) {
                        self.generation_q
                            .send(WorkItem {
                                user_id: outcome.user_id,
                                id: cid,
                            })
                            .await;
                    }
                    return;
                }
                Err(e) if e.is_retryable() && attempt <= max_retries => {
                    let delay = retry_backoff(attempt);
                    tracing::warn!(
                        target: "pipeline",
                        user_id = %item.user_id,
                        event_id = %item.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "correlation failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    counter!("correlation_dead_letter_total").increment(1);
                    tracing::error!(
                        target: "pipeline",
                        user_id = %item.user_id,
                        event_id = %item.id,
                        attempts = attempt,
                        error = %e,
                        "correlation retries exhausted; dead-lettered"
                    );
                    self.dead_letters.push(DeadLetter {
                        at: Utc::now(),
                        stage: Stage::Correlation,
                        user_id: item.user_id.clone(),
                        item_id: item.id.clone(),
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        target: "pipeline",
                        user_id = %item.user_id,
                        event_id = %item.id,
                        error = %e,
                        "event skipped"
                    );
                    return;
                }
            }
        }
    }

    /// One generation attempt; failures leave the group open for the next trigger.
    pub async fn handle_group(&self, item: &WorkItem) {
        match self.generator.generate_detailed(&item.id).await {
            GenerationOutcome::Generated(action) => {
                self.notifications.submit(PipelineNotification::ActionGenerated {
                    user_id: action.user_id.clone(),
                    action_id: action.action_id.clone(),
                    priority: action.priority,
                    correlation_id: action.correlation_id.clone(),
                });
            }
            GenerationOutcome::Store(e) => {
                self.dead_letters.push(DeadLetter {
                    at: Utc::now(),
                    stage: Stage::Generation,
                    user_id: item.user_id.clone(),
                    item_id: item.id.clone(),
                    attempts: 1,
                    reason: e.to_string(),
                });
            }
            _ => {}
        }
    }

    async fn snapshot_loop(&self) {
        let Some(path) = self.snapshot_path.clone() else {
            return;
        };
        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.retention.snapshot_interval_secs));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.stores.snapshot().save(&path) {
                        tracing::error!(target: "pipeline", error = %e, "periodic snapshot failed");
                    }
                }
            }
        }
    }

    /// Stop pulling work, wait for in-flight items, write a final snapshot.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for t in tasks {
            if let Err(e) = t.await {
                tracing::warn!(target: "pipeline", error = %e, "worker task ended abnormally");
            }
        }
        let abandoned = self.correlation_q.depth() + self.generation_q.depth();
        if abandoned > 0 {
            tracing::warn!(target: "pipeline", abandoned, "queued items dropped at shutdown");
        }

        self.notify_stop.cancel();
        let notify_task = self.notify_task.lock().take();
        if let Some(task) = notify_task {
            match tokio::time::timeout(NOTIFY_DRAIN_TIMEOUT, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(target: "pipeline", error = %e, "notification task ended abnormally")
                }
                Err(_) => tracing::warn!(
                    target: "pipeline",
                    undelivered = self.notifications.depth(),
                    "notification drain timed out"
                ),
            }
        }
        if let Some(path) = &self.snapshot_path {
            match self.stores.snapshot().save(path) {
                Ok(()) => tracing::info!(target: "pipeline", path = %path.display(), "final snapshot written"),
                Err(e) => tracing::error!(target: "pipeline", error = %e, "final snapshot failed"),
            }
        }
        tracing::info!(target: "pipeline", "pipeline stopped");
    }
}
