use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::Error;

/// Counters tracked for every route and every processor stage.
#[derive(Debug, Default)]
pub struct Counters {
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub drops: AtomicU64,
    pub errors: AtomicU64,
    pub external_timeouts: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            external_timeouts: self.external_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a `Counters`, exposed through `Engine::status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub messages_in: u64,
    pub messages_out: u64,
    pub drops: u64,
    pub errors: u64,
    pub external_timeouts: u64,
}

/// MetricsSink is the one shared mutable object in the engine. It keeps
/// an atomic in-process tally per route and per processor, and mirrors
/// every update to the `metrics` facade, where the external dashboard's
/// exporter picks them up. Transport is not the engine's concern.
#[derive(Debug, Default)]
pub struct MetricsSink {
    routes: Mutex<BTreeMap<String, Arc<Counters>>>,
    processors: Mutex<BTreeMap<(String, String), Arc<Counters>>>,
}

impl MetricsSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Counter scope for a route as a whole.
    pub fn route(&self, route: &str) -> Scope {
        let counters = self
            .routes
            .lock()
            .expect("metrics registry is never poisoned")
            .entry(route.to_string())
            .or_default()
            .clone();
        Scope {
            route: route.into(),
            processor: None,
            counters,
        }
    }

    /// Counter scope for one processor stage of a route.
    pub fn processor(&self, route: &str, processor: &str) -> Scope {
        let counters = self
            .processors
            .lock()
            .expect("metrics registry is never poisoned")
            .entry((route.to_string(), processor.to_string()))
            .or_default()
            .clone();
        Scope {
            route: route.into(),
            processor: Some(processor.into()),
            counters,
        }
    }

    pub fn route_snapshot(&self, route: &str) -> CounterSnapshot {
        self.routes
            .lock()
            .expect("metrics registry is never poisoned")
            .get(route)
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }

    pub fn processor_snapshot(&self, route: &str, processor: &str) -> CounterSnapshot {
        self.processors
            .lock()
            .expect("metrics registry is never poisoned")
            .get(&(route.to_string(), processor.to_string()))
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }
}

/// Scope binds a `Counters` to its route (and optionally processor)
/// labels, so call sites record without re-stating labels each time.
#[derive(Debug, Clone)]
pub struct Scope {
    route: Arc<str>,
    processor: Option<Arc<str>>,
    counters: Arc<Counters>,
}

impl Scope {
    pub fn messages_in(&self, n: u64) {
        self.counters.messages_in.fetch_add(n, Ordering::Relaxed);
        self.facade_counter("weir_messages_in", n);
    }

    pub fn messages_out(&self, n: u64) {
        self.counters.messages_out.fetch_add(n, Ordering::Relaxed);
        self.facade_counter("weir_messages_out", n);
    }

    pub fn drops(&self, n: u64) {
        self.counters.drops.fetch_add(n, Ordering::Relaxed);
        self.facade_counter("weir_drops", n);
    }

    /// Record an error by taxonomy kind. External timeouts additionally
    /// bump their dedicated counter.
    pub fn error(&self, err: &Error) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
        self.facade_counter("weir_errors", 1);
        if matches!(err, Error::ExternalTimeout { .. }) {
            self.counters.external_timeouts.fetch_add(1, Ordering::Relaxed);
            self.facade_counter("weir_external_timeouts", 1);
        }
    }

    pub fn processing_time(&self, elapsed: std::time::Duration) {
        metrics::histogram!(
            "weir_processing_time_ms",
            "route" => self.route.to_string(),
            "processor" => self.processor.as_deref().unwrap_or("").to_string(),
        )
        .record(elapsed.as_secs_f64() * 1e3);
    }

    pub fn queue_depth(&self, depth: usize) {
        metrics::histogram!(
            "weir_queue_depth",
            "route" => self.route.to_string(),
        )
        .record(depth as f64);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    fn facade_counter(&self, name: &'static str, n: u64) {
        metrics::counter!(
            name,
            "route" => self.route.to_string(),
            "processor" => self.processor.as_deref().unwrap_or("").to_string(),
        )
        .increment(n);
    }
}
