//! Thin adapter over `prometheus::Registry` exposing the typed
//! increment/set/observe/state/remove operations the executor needs,
//! keyed by metric name and an unordered label map.
//!
//! `prometheus` has no native enum metric type; an enum metric is
//! registered as an `IntGaugeVec` with every declared state as its own
//! series (an extra `state` label), exactly one of which is `1` at a time
//! — the same representation Prometheus's own client libraries use for
//! `StateSet`/`Enum` metrics server-side.

use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, IntGaugeVec, Opts, Registry};
use shared::config::{MetricConfig, MetricType};
use shared::{ExporterError, Result};
use std::collections::HashMap;

enum MetricHandle {
    Counter(CounterVec),
    Gauge(GaugeVec),
    /// `prometheus` has no client-side Summary type; summaries are served
    /// as histograms, which satisfies the same `observe` update contract.
    Histogram(HistogramVec),
    Enum { vec: IntGaugeVec, states: Vec<String> },
}

pub struct MetricRegistry {
    registry: Registry,
    metrics: HashMap<String, MetricHandle>,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            metrics: HashMap::new(),
        }
    }

    pub fn prometheus_registry(&self) -> &Registry {
        &self.registry
    }

    /// Register one metric with its full, fixed label-key set: `database`
    /// plus every database-declared static label key plus the metric's own
    /// declared labels. Must be called once per metric before any update.
    pub fn register(
        &mut self,
        name: &str,
        config: &MetricConfig,
        extra_label_names: &[String],
    ) -> Result<()> {
        let mut label_names: Vec<String> = vec!["database".to_string()];
        label_names.extend(extra_label_names.iter().cloned());
        label_names.extend(config.labels.iter().cloned());
        label_names.sort();
        label_names.dedup();

        let label_refs: Vec<&str> = label_names.iter().map(String::as_str).collect();
        let description = if config.description.is_empty() {
            name.to_string()
        } else {
            config.description.clone()
        };
        let opts = Opts::new(name, description.clone());

        let handle = match config.metric_type {
            MetricType::Counter => {
                let vec = CounterVec::new(opts, &label_refs)
                    .map_err(|e| ExporterError::Config(e.to_string()))?;
                self.registry
                    .register(Box::new(vec.clone()))
                    .map_err(|e| ExporterError::Config(e.to_string()))?;
                MetricHandle::Counter(vec)
            }
            MetricType::Gauge => {
                let vec = GaugeVec::new(opts, &label_refs)
                    .map_err(|e| ExporterError::Config(e.to_string()))?;
                self.registry
                    .register(Box::new(vec.clone()))
                    .map_err(|e| ExporterError::Config(e.to_string()))?;
                MetricHandle::Gauge(vec)
            }
            MetricType::Histogram => {
                let mut hopts = HistogramOpts::new(name, description);
                if let Some(buckets) = &config.buckets {
                    hopts = hopts.buckets(buckets.clone());
                }
                let vec = HistogramVec::new(hopts, &label_refs)
                    .map_err(|e| ExporterError::Config(e.to_string()))?;
                self.registry
                    .register(Box::new(vec.clone()))
                    .map_err(|e| ExporterError::Config(e.to_string()))?;
                MetricHandle::Histogram(vec)
            }
            MetricType::Summary => {
                // No native client-side Summary type; served as a histogram
                // with the default bucket set, which exposes the same
                // `observe` update contract a summary needs.
                let vec = HistogramVec::new(HistogramOpts::new(name, description), &label_refs)
                    .map_err(|e| ExporterError::Config(e.to_string()))?;
                self.registry
                    .register(Box::new(vec.clone()))
                    .map_err(|e| ExporterError::Config(e.to_string()))?;
                MetricHandle::Histogram(vec)
            }
            MetricType::Enum => {
                let mut with_state = label_refs.clone();
                with_state.push("state");
                let vec = IntGaugeVec::new(opts, &with_state)
                    .map_err(|e| ExporterError::Config(e.to_string()))?;
                self.registry
                    .register(Box::new(vec.clone()))
                    .map_err(|e| ExporterError::Config(e.to_string()))?;
                MetricHandle::Enum {
                    vec,
                    states: config.states.clone().unwrap_or_default(),
                }
            }
        };

        self.metrics.insert(name.to_string(), handle);
        Ok(())
    }

    /// `set` — gauges, and counters configured with `increment: false`
    /// (bypasses the increment-only discipline by resetting first).
    pub fn set(&self, name: &str, labels: &HashMap<String, String>, value: f64) -> Result<()> {
        match self.metrics.get(name) {
            Some(MetricHandle::Gauge(v)) => {
                v.with(&label_map(labels)).set(value);
                Ok(())
            }
            Some(MetricHandle::Counter(v)) => {
                let c = v.with(&label_map(labels));
                c.reset();
                if value > 0.0 {
                    c.inc_by(value);
                }
                Ok(())
            }
            Some(_) => Err(ExporterError::Config(format!("metric '{name}' does not support set")).into()),
            None => Err(unknown_metric(name)),
        }
    }

    /// `inc` — counters configured with `increment: true`.
    pub fn increment(&self, name: &str, labels: &HashMap<String, String>, value: f64) -> Result<()> {
        match self.metrics.get(name) {
            Some(MetricHandle::Counter(v)) => {
                v.with(&label_map(labels)).inc_by(value);
                Ok(())
            }
            Some(_) => Err(ExporterError::Config(format!("metric '{name}' does not support inc")).into()),
            None => Err(unknown_metric(name)),
        }
    }

    /// `observe` — histograms and summaries.
    pub fn observe(&self, name: &str, labels: &HashMap<String, String>, value: f64) -> Result<()> {
        match self.metrics.get(name) {
            Some(MetricHandle::Histogram(v)) => {
                v.with(&label_map(labels)).observe(value);
                Ok(())
            }
            Some(_) => Err(ExporterError::Config(format!("metric '{name}' does not support observe")).into()),
            None => Err(unknown_metric(name)),
        }
    }

    /// `state` — enum metrics. `value` is the 0-based index into the
    /// metric's declared `states` produced by the query model.
    pub fn state(&self, name: &str, labels: &HashMap<String, String>, value: f64) -> Result<()> {
        match self.metrics.get(name) {
            Some(MetricHandle::Enum { vec, states }) => {
                let current = value.round() as usize;
                for (idx, state) in states.iter().enumerate() {
                    let mut with_state = labels.clone();
                    with_state.insert("state".to_string(), state.clone());
                    vec.with(&label_map(&with_state))
                        .set(if idx == current { 1 } else { 0 });
                }
                Ok(())
            }
            Some(_) => Err(ExporterError::Config(format!("metric '{name}' does not support state")).into()),
            None => Err(unknown_metric(name)),
        }
    }

    /// Remove a series entirely (used by expiration sweeps).
    pub fn remove(&self, name: &str, labels: &HashMap<String, String>) -> Result<()> {
        match self.metrics.get(name) {
            Some(MetricHandle::Counter(v)) => {
                let _ = v.remove(&label_map(labels));
                Ok(())
            }
            Some(MetricHandle::Gauge(v)) => {
                let _ = v.remove(&label_map(labels));
                Ok(())
            }
            Some(MetricHandle::Histogram(v)) => {
                let _ = v.remove(&label_map(labels));
                Ok(())
            }
            Some(MetricHandle::Enum { vec, states }) => {
                for state in states {
                    let mut with_state = labels.clone();
                    with_state.insert("state".to_string(), state.clone());
                    let _ = vec.remove(&label_map(&with_state));
                }
                Ok(())
            }
            None => Err(unknown_metric(name)),
        }
    }
}

fn label_map(labels: &HashMap<String, String>) -> HashMap<&str, &str> {
    labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

fn unknown_metric(name: &str) -> anyhow::Error {
    ExporterError::Config(format!("metric '{name}' is not registered")).into()
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::config::MetricType;

    fn gauge_config() -> MetricConfig {
        MetricConfig {
            metric_type: MetricType::Gauge,
            description: "a test gauge".to_string(),
            labels: vec!["l".to_string()],
            buckets: None,
            states: None,
            expiration: None,
            increment: false,
        }
    }

    #[test]
    fn set_and_remove_gauge() {
        let mut registry = MetricRegistry::new();
        registry.register("m", &gauge_config(), &[]).unwrap();

        let mut labels = HashMap::new();
        labels.insert("database".to_string(), "db".to_string());
        labels.insert("l".to_string(), "foo".to_string());

        registry.set("m", &labels, 1.0).unwrap();
        registry.remove("m", &labels).unwrap();
    }

    #[test]
    fn counter_set_bypasses_increment_only_discipline() {
        let mut config = gauge_config();
        config.metric_type = MetricType::Counter;
        let mut registry = MetricRegistry::new();
        registry.register("c", &config, &[]).unwrap();

        let mut labels = HashMap::new();
        labels.insert("database".to_string(), "db".to_string());
        labels.insert("l".to_string(), "foo".to_string());

        registry.set("c", &labels, 5.0).unwrap();
        registry.set("c", &labels, 3.0).unwrap();
    }

    #[test]
    fn enum_state_sets_exactly_one_series() {
        let config = MetricConfig {
            metric_type: MetricType::Enum,
            description: String::new(),
            labels: vec![],
            buckets: None,
            states: Some(vec!["idle".to_string(), "busy".to_string()]),
            expiration: None,
            increment: false,
        };
        let mut registry = MetricRegistry::new();
        registry.register("s", &config, &[]).unwrap();

        let mut labels = HashMap::new();
        labels.insert("database".to_string(), "db".to_string());
        registry.state("s", &labels, 1.0).unwrap();
    }
}
