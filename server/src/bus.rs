//! Typed in-process publish/subscribe bus.
//!
//! Couples indexer, searcher, model manager, and metrics without direct
//! dependencies. Delivery is at-least-once with per-topic FIFO to each
//! subscriber; every subscriber owns a bounded mailbox drained by a worker
//! task the bus owns. Overflow policy is chosen at subscription time:
//! drop-oldest for metrics-style feeds, block-publisher for index lifecycle.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::metrics::MetricSet;

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Closed set of bus topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    SearchRequest,
    SearchResponse,
    SearchStage,
    IndexRequest,
    IndexResponse,
    ChunkCreated,
    EmbedRequest,
    EmbedResponse,
    RerankRequest,
    RerankResponse,
    SparseRequest,
    SparseResponse,
    StoreCreated,
    StoreDeleted,
    ModelProgress,
}

pub const ALL_TOPICS: [Topic; 15] = [
    Topic::SearchRequest,
    Topic::SearchResponse,
    Topic::SearchStage,
    Topic::IndexRequest,
    Topic::IndexResponse,
    Topic::ChunkCreated,
    Topic::EmbedRequest,
    Topic::EmbedResponse,
    Topic::RerankRequest,
    Topic::RerankResponse,
    Topic::SparseRequest,
    Topic::SparseResponse,
    Topic::StoreCreated,
    Topic::StoreDeleted,
    Topic::ModelProgress,
];

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::SearchRequest => "search.request",
            Topic::SearchResponse => "search.response",
            Topic::SearchStage => "search.stage",
            Topic::IndexRequest => "index.request",
            Topic::IndexResponse => "index.response",
            Topic::ChunkCreated => "chunk.created",
            Topic::EmbedRequest => "embed.request",
            Topic::EmbedResponse => "embed.response",
            Topic::RerankRequest => "rerank.request",
            Topic::RerankResponse => "rerank.response",
            Topic::SparseRequest => "sparse.request",
            Topic::SparseResponse => "sparse.response",
            Topic::StoreCreated => "store.created",
            Topic::StoreDeleted => "store.deleted",
            Topic::ModelProgress => "model.progress",
        }
    }

    /// Telemetry feeds drop the oldest event on overflow; lifecycle topics
    /// push back on the publisher instead.
    pub fn default_policy(&self) -> OverflowPolicy {
        match self {
            Topic::IndexRequest
            | Topic::IndexResponse
            | Topic::ChunkCreated
            | Topic::StoreCreated
            | Topic::StoreDeleted
            | Topic::ModelProgress => OverflowPolicy::Block,
            _ => OverflowPolicy::DropOldest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    DropOldest,
    Block,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: Uuid,
    #[serde(serialize_with = "ser_topic")]
    pub topic: Topic,
    pub timestamp: DateTime<Utc>,
    pub source: String,
    pub payload: serde_json::Value,
}

fn ser_topic<S: serde::Serializer>(t: &Topic, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(t.as_str())
}

impl Event {
    pub fn new(topic: Topic, source: &str, payload: serde_json::Value) -> Self {
        Event { id: Uuid::new_v4(), topic, timestamp: Utc::now(), source: source.to_string(), payload }
    }
}

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

pub type Handler = Arc<dyn Fn(Event) -> Result<()> + Send + Sync>;

enum MailboxTx {
    Drop(broadcast::Sender<Event>),
    Block(mpsc::Sender<Event>),
}

pub struct EventBus {
    topics: RwLock<std::collections::HashMap<Topic, Vec<MailboxTx>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    metrics: Arc<MetricSet>,
}

impl EventBus {
    pub fn new(metrics: Arc<MetricSet>) -> Self {
        EventBus {
            topics: RwLock::new(std::collections::HashMap::new()),
            workers: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            metrics,
        }
    }

    /// Register a subscriber for one topic. The bus owns the worker task that
    /// drains the mailbox and invokes `handler`; handler errors are logged and
    /// counted, never propagated to publishers.
    pub async fn subscribe(
        &self,
        topic: Topic,
        policy: OverflowPolicy,
        capacity: usize,
        handler: Handler,
    ) {
        let capacity = capacity.max(1);
        let errors = self.metrics.bus_errors.with(&[topic.as_str()]);
        let dropped = self.metrics.bus_dropped.with(&[topic.as_str()]);

        let (tx, worker) = match policy {
            OverflowPolicy::DropOldest => {
                let (tx, mut rx) = broadcast::channel::<Event>(capacity);
                let handle = tokio::spawn(async move {
                    loop {
                        match rx.recv().await {
                            Ok(ev) => {
                                if let Err(e) = handler(ev) {
                                    warn!(topic = topic.as_str(), error = %e, "bus subscriber failed");
                                    errors.inc();
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                dropped.add(n as f64);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                });
                (MailboxTx::Drop(tx), handle)
            }
            OverflowPolicy::Block => {
                let (tx, mut rx) = mpsc::channel::<Event>(capacity);
                let handle = tokio::spawn(async move {
                    while let Some(ev) = rx.recv().await {
                        if let Err(e) = handler(ev) {
                            warn!(topic = topic.as_str(), error = %e, "bus subscriber failed");
                            errors.inc();
                        }
                    }
                });
                (MailboxTx::Block(tx), handle)
            }
        };

        self.topics.write().await.entry(topic).or_default().push(tx);
        self.workers.lock().await.push(worker);
    }

    /// Publish to every subscriber of the event's topic. Under block policy a
    /// full mailbox suspends the publisher; a full drop-oldest mailbox evicts
    /// the oldest undelivered event instead. Subscribers on other topics are
    /// never starved.
    pub async fn publish(&self, event: Event) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::BusClosed);
        }

        // Snapshot the senders so no lock is held across a suspension point.
        let senders: Vec<MailboxTx> = {
            let topics = self.topics.read().await;
            match topics.get(&event.topic) {
                Some(list) => list
                    .iter()
                    .map(|tx| match tx {
                        MailboxTx::Drop(t) => MailboxTx::Drop(t.clone()),
                        MailboxTx::Block(t) => MailboxTx::Block(t.clone()),
                    })
                    .collect(),
                None => return Ok(()),
            }
        };

        for tx in senders {
            match tx {
                // The ring buffer evicts the oldest entry itself; the worker
                // surfaces the loss as a Lagged count.
                MailboxTx::Drop(t) => {
                    let _ = t.send(event.clone());
                }
                MailboxTx::Block(t) => {
                    if t.send(event.clone()).await.is_err() && !self.closed.load(Ordering::Acquire)
                    {
                        warn!(topic = event.topic.as_str(), "bus mailbox receiver gone");
                    }
                }
            }
        }
        Ok(())
    }

    /// Convenience wrapper: build and publish an event, ignoring `BusClosed`
    /// during shutdown races.
    pub async fn emit(&self, topic: Topic, source: &str, payload: serde_json::Value) {
        let _ = self.publish(Event::new(topic, source, payload)).await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Shut down: reject further publishes, let workers drain their mailboxes
    /// within `grace`, then cancel stragglers.
    pub async fn close(&self, grace: Duration) {
        self.closed.store(true, Ordering::Release);
        // Dropping the senders closes every mailbox; workers exit after
        // draining what was already enqueued.
        self.topics.write().await.clear();

        let mut workers = self.workers.lock().await;
        let drain = async {
            for w in workers.iter_mut() {
                let _ = w.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            for w in workers.iter() {
                w.abort();
            }
        }
        workers.clear();
    }
}
