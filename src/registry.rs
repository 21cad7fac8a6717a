//! Counter registry adapter over the `prometheus` crate.
//!
//! A prometheus [`Registry`](prometheus::Registry) refuses to register the
//! same collector twice. Hosts that build their middleware stack more than
//! once would trip over that, so [`MetricsRegistry`] remembers what it
//! created: asking again for an identically defined counter returns the one
//! already registered, while a *different* definition under a taken name is
//! a configuration error.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use prometheus::core::Collector;
use prometheus::{Encoder, IntCounterVec, Opts, TextEncoder};
use tracing::warn;

use crate::error::Error;

static GLOBAL: Lazy<Arc<MetricsRegistry>> = Lazy::new(|| {
    Arc::new(MetricsRegistry::from_prometheus(prometheus::default_registry().clone()))
});

/// Full definition of a labelled counter. Two definitions are compatible
/// only if they are equal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CounterOpts {
    pub name: String,
    pub help: String,
    pub label_names: Vec<String>,
    pub const_labels: BTreeMap<String, String>,
}

impl CounterOpts {
    pub fn new(name: &str, help: &str, label_names: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            help: help.to_owned(),
            label_names: label_names.iter().map(|l| (*l).to_owned()).collect(),
            const_labels: BTreeMap::new(),
        }
    }

    pub fn const_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.const_labels = labels;
        self
    }
}

/// A labelled counter handle. Cheap to clone; clones share the series.
#[derive(Clone, Debug)]
pub struct Counter {
    vec: IntCounterVec,
    label_names: Arc<[String]>,
}

impl Counter {
    /// Add one to the series identified by `values`, given in the order of
    /// the counter's label names.
    ///
    /// A wrong number of values is logged and dropped: counting must never
    /// take down the request being counted.
    pub fn increment(&self, values: &[&str]) {
        match self.vec.get_metric_with_label_values(values) {
            Ok(counter) => counter.inc(),
            Err(e) => warn!(error = %e, ?values, "counter increment dropped"),
        }
    }

    /// Current value of one series. Zero for series never incremented.
    ///
    /// Reads the collected samples, so asking for an unseen series does not
    /// create it.
    pub fn get(&self, values: &[&str]) -> u64 {
        if values.len() != self.label_names.len() {
            return 0;
        }
        self.vec
            .collect()
            .iter()
            .flat_map(|family| family.get_metric())
            .find(|metric| {
                self.label_names.iter().zip(values).all(|(name, value)| {
                    metric
                        .get_label()
                        .iter()
                        .any(|pair| pair.get_name() == name.as_str() && pair.get_value() == *value)
                })
            })
            .map_or(0, |metric| metric.get_counter().get_value() as u64)
    }
}

struct Registered {
    opts: CounterOpts,
    counter: Counter,
}

/// Named, labelled counters backed by a prometheus registry.
pub struct MetricsRegistry {
    inner: prometheus::Registry,
    counters: Mutex<HashMap<String, Registered>>,
}

impl MetricsRegistry {
    /// A fresh, empty registry.
    pub fn new() -> Self {
        Self::from_prometheus(prometheus::Registry::new())
    }

    /// Adapt an existing prometheus registry, e.g. one the application
    /// already exposes.
    pub fn from_prometheus(inner: prometheus::Registry) -> Self {
        Self { inner, counters: Mutex::new(HashMap::new()) }
    }

    /// The process-wide registry, backed by `prometheus::default_registry()`.
    pub fn global() -> Arc<MetricsRegistry> {
        Arc::clone(&GLOBAL)
    }

    pub fn prometheus(&self) -> &prometheus::Registry {
        &self.inner
    }

    /// Create the counter described by `opts`, or return the existing one if
    /// an identical definition was created before.
    ///
    /// # Errors
    ///
    /// [`Error::DuplicateMetric`] if the name is taken by a different
    /// definition, or by a collector registered directly with the underlying
    /// prometheus registry. [`Error::Registry`] if prometheus rejects the
    /// definition itself (invalid names, label clashes).
    pub fn counter(&self, opts: CounterOpts) -> Result<Counter, Error> {
        let mut counters = self.counters.lock();

        if let Some(existing) = counters.get(&opts.name) {
            if existing.opts == opts {
                return Ok(existing.counter.clone());
            }
            return Err(Error::DuplicateMetric { name: opts.name });
        }

        let prom_opts = Opts::new(opts.name.as_str(), opts.help.as_str())
            .const_labels(opts.const_labels.clone().into_iter().collect());
        let label_names: Vec<&str> = opts.label_names.iter().map(String::as_str).collect();
        let vec = IntCounterVec::new(prom_opts, &label_names)?;

        self.inner.register(Box::new(vec.clone())).map_err(|e| match e {
            prometheus::Error::AlreadyReg => Error::DuplicateMetric { name: opts.name.clone() },
            other => Error::Registry(other),
        })?;

        let counter = Counter { vec, label_names: opts.label_names.clone().into() };
        counters.insert(opts.name.clone(), Registered { opts, counter: counter.clone() });
        Ok(counter)
    }

    /// Render every metric in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.inner.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self { Self::new() }
}
