//! Native metrics substrate: counters, gauges, histograms, labeled vectors,
//! and a Prometheus text-format (0.0.4) renderer.
//!
//! Hot paths are lock-free (atomics); label-tuple lookup is a read-mostly map
//! with double-checked insertion under the write lock. A metric name plus an
//! ordered label tuple identifies one series for the lifetime of the process.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Default latency buckets (milliseconds).
pub const LATENCY_BUCKETS_MS: &[f64] =
    &[5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0];

fn atomic_f64_add(cell: &AtomicU64, delta: f64) {
    let mut cur = cell.load(Ordering::Relaxed);
    loop {
        let next = (f64::from_bits(cur) + delta).to_bits();
        match cell.compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => cur = actual,
        }
    }
}

// ---------------------------------------------------------------------------
// Scalar metrics
// ---------------------------------------------------------------------------

/// Monotonically non-decreasing counter. Negative deltas are a no-op.
#[derive(Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Counter { value: AtomicU64::new(0f64.to_bits()) }
    }

    pub fn inc(&self) {
        self.add(1.0);
    }

    pub fn add(&self, n: f64) {
        if n < 0.0 || n.is_nan() {
            return;
        }
        atomic_f64_add(&self.value, n);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

/// Gauge holding any real value.
#[derive(Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Gauge { value: AtomicU64::new(0f64.to_bits()) }
    }

    pub fn set(&self, v: f64) {
        self.value.store(v.to_bits(), Ordering::Relaxed);
    }

    pub fn inc(&self) {
        atomic_f64_add(&self.value, 1.0);
    }

    pub fn dec(&self) {
        atomic_f64_add(&self.value, -1.0);
    }

    pub fn add(&self, v: f64) {
        atomic_f64_add(&self.value, v);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

/// Histogram with cumulative (le-semantics) buckets and an implicit `+Inf`.
pub struct Histogram {
    bounds: Vec<f64>,
    buckets: Vec<AtomicU64>,
    sum: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// `bounds` must be ascending; this is asserted at construction.
    pub fn new(bounds: &[f64]) -> Self {
        assert!(bounds.windows(2).all(|w| w[0] < w[1]), "histogram bounds must be ascending");
        Histogram {
            bounds: bounds.to_vec(),
            buckets: bounds.iter().map(|_| AtomicU64::new(0)).collect(),
            sum: AtomicU64::new(0f64.to_bits()),
            count: AtomicU64::new(0),
        }
    }

    /// Increment every bucket whose upper bound is ≥ v, plus sum and count.
    pub fn observe(&self, v: f64) {
        for (i, bound) in self.bounds.iter().enumerate() {
            if v <= *bound {
                self.buckets[i].fetch_add(1, Ordering::Relaxed);
            }
        }
        atomic_f64_add(&self.sum, v);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> f64 {
        f64::from_bits(self.sum.load(Ordering::Relaxed))
    }

    /// (upper bound, cumulative count) pairs, excluding `+Inf`.
    pub fn bucket_counts(&self) -> Vec<(f64, u64)> {
        self.bounds
            .iter()
            .zip(self.buckets.iter())
            .map(|(b, c)| (*b, c.load(Ordering::Relaxed)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Labeled vectors
// ---------------------------------------------------------------------------

struct VecCore<T> {
    label_names: Vec<String>,
    children: RwLock<HashMap<Vec<String>, Arc<T>>>,
}

impl<T> VecCore<T> {
    fn new(label_names: &[&str]) -> Self {
        VecCore {
            label_names: label_names.iter().map(|s| s.to_string()).collect(),
            children: RwLock::new(HashMap::new()),
        }
    }

    /// Read-mostly lookup with double-checked insertion.
    ///
    /// # Panics
    /// Panics when the number of values does not match the declared arity.
    fn with(&self, values: &[&str], make: impl FnOnce() -> T) -> Arc<T> {
        assert_eq!(
            values.len(),
            self.label_names.len(),
            "label arity mismatch: expected {}, got {}",
            self.label_names.len(),
            values.len()
        );
        let key: Vec<String> = values.iter().map(|s| s.to_string()).collect();
        if let Some(existing) = self.children.read().unwrap().get(&key) {
            return Arc::clone(existing);
        }
        let mut w = self.children.write().unwrap();
        Arc::clone(w.entry(key).or_insert_with(|| Arc::new(make())))
    }

    fn snapshot(&self) -> Vec<(Vec<String>, Arc<T>)> {
        let r = self.children.read().unwrap();
        let mut out: Vec<(Vec<String>, Arc<T>)> =
            r.iter().map(|(k, v)| (k.clone(), Arc::clone(v))).collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

pub struct CounterVec {
    core: VecCore<Counter>,
}

impl CounterVec {
    pub fn new(label_names: &[&str]) -> Self {
        CounterVec { core: VecCore::new(label_names) }
    }

    pub fn with(&self, values: &[&str]) -> Arc<Counter> {
        self.core.with(values, Counter::new)
    }
}

pub struct GaugeVec {
    core: VecCore<Gauge>,
}

impl GaugeVec {
    pub fn new(label_names: &[&str]) -> Self {
        GaugeVec { core: VecCore::new(label_names) }
    }

    pub fn with(&self, values: &[&str]) -> Arc<Gauge> {
        self.core.with(values, Gauge::new)
    }
}

pub struct HistogramVec {
    core: VecCore<Histogram>,
    bounds: Vec<f64>,
}

impl HistogramVec {
    pub fn new(label_names: &[&str], bounds: &[f64]) -> Self {
        HistogramVec { core: VecCore::new(label_names), bounds: bounds.to_vec() }
    }

    pub fn with(&self, values: &[&str]) -> Arc<Histogram> {
        let bounds = self.bounds.clone();
        self.core.with(values, move || Histogram::new(&bounds))
    }
}

// ---------------------------------------------------------------------------
// Registry & exposition
// ---------------------------------------------------------------------------

enum Family {
    Counter(Arc<Counter>),
    Gauge(Arc<Gauge>),
    Histogram(Arc<Histogram>),
    CounterVec(Arc<CounterVec>),
    GaugeVec(Arc<GaugeVec>),
    HistogramVec(Arc<HistogramVec>),
}

struct FamilyEntry {
    help: String,
    family: Family,
}

/// Append-only registry of metric families. Registration happens once at
/// startup; `render` produces the text exposition.
#[derive(Default)]
pub struct Registry {
    families: RwLock<BTreeMap<String, FamilyEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    fn insert(&self, name: &str, help: &str, family: Family) {
        let mut w = self.families.write().unwrap();
        let prev = w.insert(name.to_string(), FamilyEntry { help: help.to_string(), family });
        assert!(prev.is_none(), "metric '{name}' registered twice");
    }

    pub fn counter(&self, name: &str, help: &str) -> Arc<Counter> {
        let c = Arc::new(Counter::new());
        self.insert(name, help, Family::Counter(Arc::clone(&c)));
        c
    }

    pub fn gauge(&self, name: &str, help: &str) -> Arc<Gauge> {
        let g = Arc::new(Gauge::new());
        self.insert(name, help, Family::Gauge(Arc::clone(&g)));
        g
    }

    pub fn histogram(&self, name: &str, help: &str, bounds: &[f64]) -> Arc<Histogram> {
        let h = Arc::new(Histogram::new(bounds));
        self.insert(name, help, Family::Histogram(Arc::clone(&h)));
        h
    }

    pub fn counter_vec(&self, name: &str, help: &str, labels: &[&str]) -> Arc<CounterVec> {
        let v = Arc::new(CounterVec::new(labels));
        self.insert(name, help, Family::CounterVec(Arc::clone(&v)));
        v
    }

    pub fn gauge_vec(&self, name: &str, help: &str, labels: &[&str]) -> Arc<GaugeVec> {
        let v = Arc::new(GaugeVec::new(labels));
        self.insert(name, help, Family::GaugeVec(Arc::clone(&v)));
        v
    }

    pub fn histogram_vec(
        &self,
        name: &str,
        help: &str,
        labels: &[&str],
        bounds: &[f64],
    ) -> Arc<HistogramVec> {
        let v = Arc::new(HistogramVec::new(labels, bounds));
        self.insert(name, help, Family::HistogramVec(Arc::clone(&v)));
        v
    }

    /// Render the Prometheus text exposition format, version 0.0.4.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let families = self.families.read().unwrap();
        for (name, entry) in families.iter() {
            let kind = match entry.family {
                Family::Counter(_) | Family::CounterVec(_) => "counter",
                Family::Gauge(_) | Family::GaugeVec(_) => "gauge",
                Family::Histogram(_) | Family::HistogramVec(_) => "histogram",
            };
            let _ = writeln!(out, "# HELP {name} {}", entry.help);
            let _ = writeln!(out, "# TYPE {name} {kind}");
            match &entry.family {
                Family::Counter(c) => {
                    let _ = writeln!(out, "{name} {}", fmt_value(c.get()));
                }
                Family::Gauge(g) => {
                    let _ = writeln!(out, "{name} {}", fmt_value(g.get()));
                }
                Family::Histogram(h) => render_histogram(&mut out, name, &[], &[], h),
                Family::CounterVec(v) => {
                    for (values, c) in v.core.snapshot() {
                        let labels = fmt_labels(&v.core.label_names, &values);
                        let _ = writeln!(out, "{name}{{{labels}}} {}", fmt_value(c.get()));
                    }
                }
                Family::GaugeVec(v) => {
                    for (values, g) in v.core.snapshot() {
                        let labels = fmt_labels(&v.core.label_names, &values);
                        let _ = writeln!(out, "{name}{{{labels}}} {}", fmt_value(g.get()));
                    }
                }
                Family::HistogramVec(v) => {
                    for (values, h) in v.core.snapshot() {
                        render_histogram(&mut out, name, &v.core.label_names, &values, &h);
                    }
                }
            }
        }
        out
    }
}

fn render_histogram(out: &mut String, name: &str, names: &[String], values: &[String], h: &Histogram) {
    let base = fmt_label_pairs(names, values);
    for (bound, count) in h.bucket_counts() {
        let le = format!("{bound:?}");
        if base.is_empty() {
            let _ = writeln!(out, "{name}_bucket{{le=\"{le}\"}} {count}");
        } else {
            let _ = writeln!(out, "{name}_bucket{{{base},le=\"{le}\"}} {count}");
        }
    }
    if base.is_empty() {
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {}", h.count());
        let _ = writeln!(out, "{name}_sum {}", fmt_value(h.sum()));
        let _ = writeln!(out, "{name}_count {}", h.count());
    } else {
        let _ = writeln!(out, "{name}_bucket{{{base},le=\"+Inf\"}} {}", h.count());
        let _ = writeln!(out, "{name}_sum{{{base}}} {}", fmt_value(h.sum()));
        let _ = writeln!(out, "{name}_count{{{base}}} {}", h.count());
    }
}

fn fmt_label_pairs(names: &[String], values: &[String]) -> String {
    let mut pairs: Vec<(&String, &String)> = names.iter().zip(values.iter()).collect();
    pairs.sort_by(|a, b| a.0.cmp(b.0));
    pairs
        .iter()
        .map(|(k, v)| format!("{k}=\"{}\"", escape_label(v)))
        .collect::<Vec<_>>()
        .join(",")
}

fn fmt_labels(names: &[String], values: &[String]) -> String {
    fmt_label_pairs(names, values)
}

fn escape_label(v: &str) -> String {
    v.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

/// Integral values print without a fractional part (`10`, not `10.0`).
fn fmt_value(v: f64) -> String {
    if v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{v}")
    }
}

// ---------------------------------------------------------------------------
// Standard series
// ---------------------------------------------------------------------------

/// Every metric the server emits, constructed once at startup and passed by
/// reference to each component.
pub struct MetricSet {
    pub registry: Arc<Registry>,

    pub search_requests: Arc<Counter>,
    pub search_latency: Arc<Histogram>,
    pub search_stage_latency: Arc<HistogramVec>,
    pub search_errors: Arc<CounterVec>,

    pub index_files: Arc<CounterVec>,
    pub index_chunks: Arc<Counter>,
    pub index_latency: Arc<Histogram>,

    pub bus_errors: Arc<CounterVec>,
    pub bus_dropped: Arc<CounterVec>,

    pub http_requests: Arc<CounterVec>,
    pub http_in_flight: Arc<Gauge>,

    pub model_loads: Arc<CounterVec>,
    pub model_evictions: Arc<CounterVec>,
    pub embed_batches: Arc<Counter>,
    pub backend_errors: Arc<CounterVec>,
}

impl MetricSet {
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());
        MetricSet {
            search_requests: registry
                .counter("rice_search_requests_total", "Total search requests"),
            search_latency: registry.histogram(
                "rice_search_latency_ms",
                "End-to-end search latency in milliseconds",
                LATENCY_BUCKETS_MS,
            ),
            search_stage_latency: registry.histogram_vec(
                "rice_search_stage_latency_ms",
                "Per-retriever stage latency in milliseconds",
                &["stage"],
                LATENCY_BUCKETS_MS,
            ),
            search_errors: registry.counter_vec(
                "rice_search_errors_total",
                "Search requests that returned an error",
                &["code"],
            ),
            index_files: registry.counter_vec(
                "rice_index_files_total",
                "Indexed files by outcome",
                &["status"],
            ),
            index_chunks: registry.counter("rice_index_chunks_total", "Chunks written to backends"),
            index_latency: registry.histogram(
                "rice_index_latency_ms",
                "Index batch latency in milliseconds",
                LATENCY_BUCKETS_MS,
            ),
            bus_errors: registry.counter_vec(
                "rice_bus_errors_total",
                "Subscriber callback errors by topic",
                &["topic"],
            ),
            bus_dropped: registry.counter_vec(
                "rice_bus_dropped_total",
                "Events dropped by overflowing drop-oldest mailboxes",
                &["topic"],
            ),
            http_requests: registry.counter_vec(
                "rice_http_requests_total",
                "HTTP requests by method, normalized path, and status class",
                &["method", "path", "status"],
            ),
            http_in_flight: registry.gauge("rice_http_in_flight", "HTTP requests in flight"),
            model_loads: registry.counter_vec(
                "rice_model_loads_total",
                "Model session loads by session kind",
                &["session"],
            ),
            model_evictions: registry.counter_vec(
                "rice_model_evictions_total",
                "TTL evictions by session kind",
                &["session"],
            ),
            embed_batches: registry.counter("rice_embed_batches_total", "Embedding batches run"),
            backend_errors: registry.counter_vec(
                "rice_backend_errors_total",
                "Backend call failures",
                &["backend"],
            ),
            registry,
        }
    }
}

impl Default for MetricSet {
    fn default() -> Self {
        MetricSet::new()
    }
}
