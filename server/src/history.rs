//! Per-metric bucketed history for charts, independent of the Prometheus
//! export path.
//!
//! Samples land in a fixed-width current bucket; crossing a boundary
//! finalizes the bucket (mean or sum), appends it, and evicts from the head
//! beyond the retention count. Finalized buckets are optionally mirrored to a
//! Redis sorted set, fire-and-forget; Redis being down degrades silently to
//! in-memory history.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use dashmap::DashMap;

/// How samples inside a bucket collapse into one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// Average of samples — latencies.
    Mean,
    /// Sum of samples — counts and rates.
    Sum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBucket {
    pub metric: String,
    /// Bucket start, unix millis, aligned to the bucket width.
    pub start_time: u64,
    pub aggregated_value: f64,
    pub sample_count: u64,
}

pub type Clock = Arc<dyn Fn() -> u64 + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(|| {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    })
}

struct Accum {
    bucket_start: u64,
    sum: f64,
    count: u64,
}

struct State {
    current: Option<Accum>,
    buckets: VecDeque<TimeBucket>,
}

/// History of one metric.
pub struct MetricHistory {
    metric: String,
    mode: Aggregation,
    width_ms: u64,
    retention: usize,
    state: Mutex<State>,
    clock: Clock,
    sink: Option<mpsc::UnboundedSender<TimeBucket>>,
}

impl MetricHistory {
    fn new(
        metric: &str,
        mode: Aggregation,
        width_ms: u64,
        retention: usize,
        clock: Clock,
        sink: Option<mpsc::UnboundedSender<TimeBucket>>,
    ) -> Self {
        MetricHistory {
            metric: metric.to_string(),
            mode,
            width_ms,
            retention,
            state: Mutex::new(State { current: None, buckets: VecDeque::new() }),
            clock,
            sink,
        }
    }

    fn aggregate(&self, acc: &Accum) -> TimeBucket {
        let value = match self.mode {
            Aggregation::Mean => {
                if acc.count == 0 {
                    0.0
                } else {
                    acc.sum / acc.count as f64
                }
            }
            Aggregation::Sum => acc.sum,
        };
        TimeBucket {
            metric: self.metric.clone(),
            start_time: acc.bucket_start,
            aggregated_value: value,
            sample_count: acc.count,
        }
    }

    fn finalize_locked(&self, state: &mut State) {
        if let Some(acc) = state.current.take() {
            let bucket = self.aggregate(&acc);
            if let Some(sink) = &self.sink {
                let _ = sink.send(bucket.clone());
            }
            state.buckets.push_back(bucket);
            while state.buckets.len() > self.retention {
                state.buckets.pop_front();
            }
        }
    }

    /// Record a sample into the bucket containing now.
    pub fn record(&self, v: f64) {
        let now = (self.clock)();
        let bucket_start = now - now % self.width_ms;
        let mut state = self.state.lock().unwrap();

        match &mut state.current {
            Some(acc) if acc.bucket_start >= bucket_start => {
                acc.sum += v;
                acc.count += 1;
            }
            _ => {
                self.finalize_locked(&mut state);
                state.current = Some(Accum { bucket_start, sum: v, count: 1 });
            }
        }
    }

    /// Snapshot of finalized buckets, oldest first. A current bucket whose
    /// window already passed is finalized on the way out.
    pub fn history(&self) -> Vec<TimeBucket> {
        let now = (self.clock)();
        let mut state = self.state.lock().unwrap();
        let stale = state
            .current
            .as_ref()
            .map(|acc| now >= acc.bucket_start + self.width_ms)
            .unwrap_or(false);
        if stale {
            self.finalize_locked(&mut state);
        }
        state.buckets.iter().cloned().collect()
    }

    /// Seed finalized buckets loaded from persistence (startup only).
    fn seed(&self, mut buckets: Vec<TimeBucket>) {
        buckets.sort_by_key(|b| b.start_time);
        let mut state = self.state.lock().unwrap();
        for b in buckets {
            state.buckets.push_back(b);
        }
        while state.buckets.len() > self.retention {
            state.buckets.pop_front();
        }
    }
}

// ---------------------------------------------------------------------------
// History set + Redis retention
// ---------------------------------------------------------------------------

fn redis_key(metric: &str) -> String {
    format!("rice:history:{metric}")
}

/// All history series, plus the optional Redis mirror.
pub struct HistorySet {
    width_ms: u64,
    retention: usize,
    clock: Clock,
    series: DashMap<String, Arc<MetricHistory>>,
    sink: Option<mpsc::UnboundedSender<TimeBucket>>,
    redis: Option<redis::aio::ConnectionManager>,
}

impl HistorySet {
    pub fn new(width: std::time::Duration, retention: usize) -> Self {
        Self::with_clock(width, retention, system_clock())
    }

    pub fn with_clock(width: std::time::Duration, retention: usize, clock: Clock) -> Self {
        HistorySet {
            width_ms: (width.as_millis() as u64).max(1),
            retention: retention.max(1),
            clock,
            series: DashMap::new(),
            sink: None,
            redis: None,
        }
    }

    /// Attach Redis retention. Failures here degrade silently: the server
    /// keeps in-memory history only.
    pub async fn connect_redis(&mut self, url: &str) {
        let client = match redis::Client::open(url) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "invalid Redis URL, metrics history is in-memory only");
                return;
            }
        };
        let manager = match client.get_connection_manager().await {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "Redis unreachable, metrics history is in-memory only");
                return;
            }
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<TimeBucket>();
        let mut writer = manager.clone();
        tokio::spawn(async move {
            while let Some(bucket) = rx.recv().await {
                let key = redis_key(&bucket.metric);
                let member = match serde_json::to_string(&bucket) {
                    Ok(m) => m,
                    Err(_) => continue,
                };
                // Fire-and-forget: a lost bucket is acceptable.
                let res: redis::RedisResult<()> =
                    redis::AsyncCommands::zadd(&mut writer, key, member, bucket.start_time).await;
                if let Err(e) = res {
                    debug!(error = %e, "Redis history write failed");
                }
            }
        });

        self.sink = Some(tx);
        self.redis = Some(manager);
        info!("Redis metrics history enabled");
    }

    /// Get-or-create the series for `metric`.
    pub fn series(&self, metric: &str, mode: Aggregation) -> Arc<MetricHistory> {
        if let Some(existing) = self.series.get(metric) {
            return Arc::clone(&existing);
        }
        let h = Arc::new(MetricHistory::new(
            metric,
            mode,
            self.width_ms,
            self.retention,
            Arc::clone(&self.clock),
            self.sink.clone(),
        ));
        self.series.entry(metric.to_string()).or_insert(h).clone()
    }

    /// Snapshot a series by name, if it exists.
    pub fn snapshot(&self, metric: &str) -> Option<Vec<TimeBucket>> {
        self.series.get(metric).map(|s| s.history())
    }

    pub fn metric_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Load the last retention window for a series from Redis, if attached.
    pub async fn preload(&self, metric: &str, mode: Aggregation) {
        let Some(manager) = &self.redis else { return };
        let mut con = manager.clone();
        let now = (self.clock)();
        let min = now.saturating_sub(self.width_ms * self.retention as u64);
        let res: redis::RedisResult<Vec<String>> = redis::AsyncCommands::zrangebyscore(
            &mut con,
            redis_key(metric),
            min as isize,
            isize::MAX,
        )
        .await;
        match res {
            Ok(members) => {
                let buckets: Vec<TimeBucket> = members
                    .iter()
                    .filter_map(|m| serde_json::from_str(m).ok())
                    .collect();
                if !buckets.is_empty() {
                    debug!(metric, buckets = buckets.len(), "loaded history from Redis");
                    self.series(metric, mode).seed(buckets);
                }
            }
            Err(e) => {
                warn!(metric, error = %e, "Redis history load failed, starting empty");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Bus-driven aggregation
// ---------------------------------------------------------------------------

/// Subscribe the history series to the telemetry topics so charts populate
/// without the searcher or indexer knowing about retention at all.
pub async fn wire_history(bus: &crate::bus::EventBus, history: &Arc<HistorySet>) {
    use crate::bus::{OverflowPolicy, Topic};

    let latency = history.series("search_latency_ms", Aggregation::Mean);
    let requests = history.series("search_requests", Aggregation::Sum);
    bus.subscribe(
        Topic::SearchResponse,
        OverflowPolicy::DropOldest,
        1024,
        Arc::new(move |ev| {
            if let Some(ms) = ev.payload["latency_ms"].as_f64() {
                latency.record(ms);
            }
            requests.record(1.0);
            Ok(())
        }),
    )
    .await;

    let index_latency = history.series("index_latency_ms", Aggregation::Mean);
    let index_docs = history.series("index_documents", Aggregation::Sum);
    bus.subscribe(
        Topic::IndexResponse,
        OverflowPolicy::Block,
        256,
        Arc::new(move |ev| {
            if let Some(ms) = ev.payload["latency_ms"].as_f64() {
                index_latency.record(ms);
            }
            if let Some(docs) = ev.payload["doc_count"].as_f64() {
                index_docs.record(docs);
            }
            Ok(())
        }),
    )
    .await;
}
