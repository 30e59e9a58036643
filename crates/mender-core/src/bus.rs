//! Typed pub/sub channel for coordination events.
//!
//! Delivery is at-least-once. Each subscriber owns an unbounded queue drained
//! by its own worker task; a handler that returns an error gets the same
//! envelope again (same `id`, bumped `delivery_attempt`) up to
//! `max_redeliveries` times. Handlers must therefore be idempotent; wrap one
//! in [`Deduplicate`] when it is not naturally so.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{AgentId, IssueId, RollbackLevel, RollbackScope};
use crate::metrics::METRICS;

/// Default number of redeliveries after the first failed delivery.
pub const DEFAULT_MAX_REDELIVERIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BusEvent {
    FixRequested {
        issue: IssueId,
        agent: AgentId,
        attempt: u32,
    },
    FixCompleted {
        issue: IssueId,
        agent: AgentId,
        attempt: u32,
        success: bool,
    },
    DependencyResolved {
        issue: IssueId,
        unlocked: Vec<IssueId>,
    },
    ConflictDetected {
        path: PathBuf,
        requester: String,
        holder: Option<String>,
    },
    RollbackTriggered {
        level: RollbackLevel,
        scope: RollbackScope,
        reason: String,
    },
}

impl BusEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FixRequested { .. } => "fix_requested",
            Self::FixCompleted { .. } => "fix_completed",
            Self::DependencyResolved { .. } => "dependency_resolved",
            Self::ConflictDetected { .. } => "conflict_detected",
            Self::RollbackTriggered { .. } => "rollback_triggered",
        }
    }
}

/// An event plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Stable across redeliveries; the idempotency key.
    pub id: Uuid,
    pub seq: u64,
    /// 1 on first delivery.
    pub delivery_attempt: u32,
    pub published_at: DateTime<Utc>,
    pub event: BusEvent,
}

#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()>;
}

/// Makes any handler idempotent by remembering envelope ids it has
/// successfully handled.
pub struct Deduplicate<H> {
    inner: H,
    seen: Mutex<HashSet<Uuid>>,
}

impl<H: BusHandler> Deduplicate<H> {
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }

    fn already_seen(&self, id: &Uuid) -> bool {
        self.seen.lock().map(|s| s.contains(id)).unwrap_or(false)
    }
}

#[async_trait]
impl<H: BusHandler> BusHandler for Deduplicate<H> {
    async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
        if self.already_seen(&envelope.id) {
            debug!(envelope = %envelope.id, "duplicate delivery skipped");
            return Ok(());
        }
        self.inner.handle(envelope).await?;
        if let Ok(mut seen) = self.seen.lock() {
            seen.insert(envelope.id);
        }
        Ok(())
    }
}

struct Subscriber {
    name: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

struct BusInner {
    seq: AtomicU64,
    max_redeliveries: u32,
    subscribers: Mutex<Vec<Subscriber>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Cloneable handle to a shared bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("published", &self.inner.seq.load(Ordering::Relaxed))
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        Self::with_max_redeliveries(DEFAULT_MAX_REDELIVERIES)
    }

    pub fn with_max_redeliveries(max_redeliveries: u32) -> Self {
        Self {
            inner: Arc::new(BusInner {
                seq: AtomicU64::new(0),
                max_redeliveries,
                subscribers: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a handler with its own queue and worker task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, name: impl Into<String>, handler: Arc<dyn BusHandler>) {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let max_redeliveries = self.inner.max_redeliveries;
        let worker_name = name.clone();

        let worker = tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                deliver(&worker_name, handler.as_ref(), envelope, max_redeliveries).await;
            }
        });

        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.push(Subscriber { name, tx });
        }
        if let Ok(mut workers) = self.inner.workers.lock() {
            workers.push(worker);
        }
    }

    /// Raw queue subscription, for callers that drive their own loop.
    pub fn subscribe_channel(&self, name: impl Into<String>) -> mpsc::UnboundedReceiver<Envelope> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.push(Subscriber {
                name: name.into(),
                tx,
            });
        }
        rx
    }

    /// Enqueue an event for every live subscriber. Never blocks.
    pub fn publish(&self, event: BusEvent) -> Envelope {
        let envelope = Envelope {
            id: Uuid::new_v4(),
            seq: self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1,
            delivery_attempt: 1,
            published_at: Utc::now(),
            event,
        };

        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.retain(|sub| {
                let delivered = sub.tx.send(envelope.clone()).is_ok();
                if !delivered {
                    debug!(subscriber = %sub.name, "subscriber gone, dropping");
                }
                delivered
            });
        }
        envelope
    }

    pub fn published(&self) -> u64 {
        self.inner.seq.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Close every queue and wait for workers to drain what is already
    /// enqueued.
    pub async fn shutdown(&self) {
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.clear();
        }
        let workers: Vec<JoinHandle<()>> = match self.inner.workers.lock() {
            Ok(mut w) => w.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for result in futures::future::join_all(workers).await {
            if let Err(e) = result {
                warn!(error = %e, "bus worker panicked");
            }
        }
    }
}

async fn deliver(name: &str, handler: &dyn BusHandler, mut envelope: Envelope, max_redeliveries: u32) {
    loop {
        match handler.handle(&envelope).await {
            Ok(()) => return,
            Err(e) if envelope.delivery_attempt <= max_redeliveries => {
                METRICS.inc_bus_redeliveries();
                debug!(
                    subscriber = %name,
                    envelope = %envelope.id,
                    attempt = envelope.delivery_attempt,
                    error = %e,
                    "handler failed, redelivering"
                );
                envelope.delivery_attempt += 1;
                tokio::task::yield_now().await;
            }
            Err(e) => {
                warn!(
                    subscriber = %name,
                    envelope = %envelope.id,
                    kind = envelope.event.kind(),
                    error = %e,
                    "handler failed after all redeliveries"
                );
                return;
            }
        }
    }
}
