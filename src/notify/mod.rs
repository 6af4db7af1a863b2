//! Outbound notifications. Delivery channels live outside this crate; they
//! plug in through [`Notifier`].

pub mod webhook;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::model::{Platform, Priority};

pub use webhook::WebhookNotifier;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineNotification {
    ActionGenerated {
        user_id: String,
        action_id: String,
        priority: Priority,
        correlation_id: String,
    },
    CorrelationCreated {
        user_id: String,
        correlation_id: String,
        strength: f32,
        platforms: Vec<Platform>,
    },
}

impl PipelineNotification {
    pub fn user_id(&self) -> &str {
        match self {
            PipelineNotification::ActionGenerated { user_id, .. }
            | PipelineNotification::CorrelationCreated { user_id, .. } => user_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PipelineNotification::ActionGenerated { .. } => "action_generated",
            PipelineNotification::CorrelationCreated { .. } => "correlation_created",
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, n: &PipelineNotification) -> anyhow::Result<()>;
    fn name(&self) -> &'static str;
}

/// Fan-out to every configured sink. A failing sink is logged and does not
/// stop the others.
#[derive(Clone, Default)]
pub struct NotifierMux {
    sinks: Vec<Arc<dyn Notifier>>,
}

impl NotifierMux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn Notifier>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Log sink plus an optional webhook from `NOTIFY_WEBHOOK_URL`.
    pub fn from_env() -> Self {
        let mut mux = Self::new().with(Arc::new(LogNotifier));
        if let Ok(url) = std::env::var("NOTIFY_WEBHOOK_URL") {
            if !url.trim().is_empty() {
                mux = mux.with(Arc::new(WebhookNotifier::new(url.trim().to_string())));
            }
        }
        mux
    }

    /// Returns how many sinks accepted the notification.
    pub async fn dispatch(&self, n: &PipelineNotification) -> usize {
        let mut ok = 0;
        for sink in &self.sinks {
            match sink.notify(n).await {
                Ok(()) => ok += 1,
                Err(e) => tracing::warn!(
                    target: "pipeline",
                    sink = sink.name(),
                    kind = n.kind(),
                    error = %e,
                    "notification sink failed"
                ),
            }
        }
        ok
    }
}

/// Bounded hand-off from the pipeline workers to the sinks. One task delivers
/// in submission order; submitting never waits on a sink.
#[derive(Clone)]
pub struct NotifyQueue {
    tx: mpsc::Sender<PipelineNotification>,
    depth: Arc<AtomicUsize>,
}

impl NotifyQueue {
    /// Spawn the delivery task. Once `stop` fires it delivers what is already
    /// queued and exits.
    pub fn spawn(
        mux: NotifierMux,
        capacity: usize,
        stop: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<PipelineNotification>(capacity.max(1));
        let depth = Arc::new(AtomicUsize::new(0));
        let in_flight = depth.clone();
        let handle = tokio::spawn(async move {
            loop {
                let n = tokio::select! {
                    biased;
                    n = rx.recv() => match n {
                        Some(n) => n,
                        None => break,
                    },
                    _ = stop.cancelled() => break,
                };
                mux.dispatch(&n).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            rx.close();
            while let Ok(n) = rx.try_recv() {
                mux.dispatch(&n).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            }
            tracing::debug!(target: "pipeline", "notification delivery stopped");
        });
        (Self { tx, depth }, handle)
    }

    /// Queue `n` for delivery. Returns false if it was dropped because the
    /// queue is full or delivery has stopped.
    pub fn submit(&self, n: PipelineNotification) -> bool {
        self.depth.fetch_add(1, Ordering::SeqCst);
        let (reason, n) = match self.tx.try_send(n) {
            Ok(()) => return true,
            Err(TrySendError::Full(n)) => ("full", n),
            Err(TrySendError::Closed(n)) => ("closed", n),
        };
        self.depth.fetch_sub(1, Ordering::SeqCst);
        counter!("notifications_dropped_total", "reason" => reason).increment(1);
        tracing::warn!(
            target: "pipeline",
            kind = n.kind(),
            user_id = %n.user_id(),
            reason,
            "notification dropped"
        );
        false
    }

    /// Notifications queued or being delivered.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

/// Writes notifications to the tracing log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, n: &PipelineNotification) -> anyhow::Result<()> {
        match n {
            PipelineNotification::ActionGenerated {
                user_id,
                action_id,
                priority,
                correlation_id,
            } => tracing::info!(target: "notify", %user_id, %action_id, %priority, %correlation_id, "action_generated"),
            PipelineNotification::CorrelationCreated {
                user_id,
                correlation_id,
                strength,
                platforms,
            } => tracing::info!(target: "notify", %user_id, %correlation_id, strength, ?platforms, "correlation_created"),
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// In-process broadcast for embedders (UI push, tests, the demo binary).
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<PipelineNotification>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineNotification> {
        self.tx.subscribe()
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, n: &PipelineNotification) -> anyhow::Result<()> {
        // No subscribers is not an error.
        let _ = self.tx.send(n.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}
