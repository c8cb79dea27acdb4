//! Orchestrates query dispatch: fans timer/cron fires and on-demand scrape
//! requests out to the right `(query, database)` pairs, applies results to
//! the registry, tracks per-pair fatal state, and feeds the alert
//! generator. Everything here runs on the single task that owns
//! [`Executor::run`] — the fatal-set and alert state are mutated from
//! nowhere else, matching the "owned only on the scheduler thread" rule.

use crate::alerts::{AlertDispatcher, AlertGenerator};
use crate::database::DatabaseWorker;
use crate::last_seen::MetricsLastSeen;
use crate::query;
use crate::registry::MetricRegistry;
use crate::scheduler::{ScheduledTask, Trigger};
use shared::config::{Config, MetricType, QueryMetric};
use shared::defaults::default_query_timeout_secs;
use shared::model::MetricResult;
use shared::{ExporterError, Result};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

const DB_ERRORS_METRIC: &str = "database_errors";
const QUERIES_METRIC: &str = "queries";
const QUERY_LATENCY_METRIC: &str = "query_latency";
const QUERY_TIMESTAMP_METRIC: &str = "query_timestamp";
const QUERY_INTERVAL_METRIC: &str = "query_interval";

#[derive(Clone)]
struct ExecutionSpec {
    execution_name: String,
    query_name: String,
    databases: Vec<String>,
    metrics: Vec<QueryMetric>,
    sql: String,
    params: HashMap<String, serde_yaml::Value>,
    timeout: Duration,
    alert_names: Vec<String>,
    interval_secs: Option<u64>,
    schedule: Option<String>,
}

enum Command {
    RunAperiodic(oneshot::Sender<()>),
    ClearExpiredSeries,
}

/// Lightweight handle callers outside the executor's own task can use to
/// request work from it (the HTTP scrape handler, the expiry sweep timer).
#[derive(Clone)]
pub struct ExecutorHandle {
    command_tx: mpsc::Sender<Command>,
}

impl ExecutorHandle {
    pub async fn run_aperiodic_queries(&self) {
        let (tx, rx) = oneshot::channel();
        if self.command_tx.send(Command::RunAperiodic(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn clear_expired_series(&self) {
        let _ = self.command_tx.send(Command::ClearExpiredSeries).await;
    }
}

pub struct Executor {
    metric_configs: HashMap<String, shared::config::MetricConfig>,
    /// Full sorted label-name set each metric was registered with
    /// (`database` + every db-label key + the metric's own labels) — the
    /// same set [`apply_metric_update`] sorts and feeds to the last-seen
    /// tracker, needed to rebuild a label map from a last-seen entry's bare
    /// value tuple.
    metric_label_names: HashMap<String, Vec<String>>,
    database_labels: HashMap<String, HashMap<String, String>>,
    databases: HashMap<String, DatabaseWorker>,
    registry: Arc<MetricRegistry>,
    last_seen: MetricsLastSeen,
    fatal_set: HashMap<String, HashSet<String>>,
    alert_generator: AlertGenerator,
    alert_dispatcher: AlertDispatcher,
    alert_max_age: Duration,

    timed: HashMap<String, ExecutionSpec>,
    aperiodic: Vec<ExecutionSpec>,
    scheduled: HashMap<String, ScheduledTask>,

    ready_tx: mpsc::Sender<String>,
    ready_rx: mpsc::Receiver<String>,
    command_tx: mpsc::Sender<Command>,
    command_rx: mpsc::Receiver<Command>,
}

impl Executor {
    /// Build an executor for `config`, registering every user and builtin
    /// metric into a freshly created registry. Use [`Executor::registry`] to
    /// get a shared handle for the scrape server.
    pub fn new(config: Config) -> Result<Self> {
        let database_labels: HashMap<String, HashMap<String, String>> = config
            .databases
            .iter()
            .map(|(name, db)| (name.clone(), db.labels.clone()))
            .collect();
        let mut db_label_keys: Vec<String> = config
            .databases
            .values()
            .flat_map(|db| db.labels.keys().cloned())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        db_label_keys.sort();

        let mut registry = MetricRegistry::new();
        register_builtin_metrics(&mut registry, &db_label_keys)?;
        let mut metric_label_names: HashMap<String, Vec<String>> = HashMap::new();
        for (name, metric) in &config.metrics {
            registry.register(name, metric, &db_label_keys)?;
            let mut names: Vec<String> = vec!["database".to_string()];
            names.extend(db_label_keys.iter().cloned());
            names.extend(metric.labels.iter().cloned());
            names.sort();
            names.dedup();
            metric_label_names.insert(name.clone(), names);
        }
        let registry = Arc::new(registry);

        let expirations: HashMap<String, u64> = config
            .metrics
            .iter()
            .filter_map(|(name, m)| m.expiration.map(|e| (name.clone(), e)))
            .collect();

        let databases = config
            .databases
            .iter()
            .map(|(name, db)| (name.clone(), DatabaseWorker::spawn(name.clone(), db.clone())))
            .collect();

        let mut timed = HashMap::new();
        let mut aperiodic = Vec::new();
        for (query_name, query_cfg) in &config.queries {
            for (execution_name, params) in query_cfg.executions(query_name) {
                let spec = ExecutionSpec {
                    execution_name: execution_name.clone(),
                    query_name: query_name.clone(),
                    databases: query_cfg.databases.clone(),
                    metrics: query_cfg.metrics.clone(),
                    sql: query_cfg.sql.clone(),
                    params,
                    timeout: Duration::from_secs_f64(
                        query_cfg.timeout.unwrap_or(default_query_timeout_secs() as f64),
                    ),
                    alert_names: query_cfg.alerts.clone().unwrap_or_default(),
                    interval_secs: query_cfg.interval,
                    schedule: query_cfg.schedule.clone(),
                };
                if query_cfg.interval.is_some() || query_cfg.schedule.is_some() {
                    timed.insert(execution_name, spec);
                } else {
                    aperiodic.push(spec);
                }
            }
        }

        let alertmanager_url = config
            .alertmanager
            .as_ref()
            .map(|a| a.url.clone())
            .unwrap_or_default();
        let alertmanager_timeout = Duration::from_secs(
            config
                .alertmanager
                .as_ref()
                .map(|a| a.timeout_seconds)
                .unwrap_or(30),
        );
        let alert_max_age = Duration::from_secs(
            config
                .alertmanager
                .as_ref()
                .map(|a| a.max_age_seconds)
                .unwrap_or(3600),
        );

        let (ready_tx, ready_rx) = mpsc::channel(256);
        let (command_tx, command_rx) = mpsc::channel(16);

        Ok(Self {
            metric_configs: config.metrics.clone(),
            metric_label_names,
            database_labels,
            databases,
            registry,
            last_seen: MetricsLastSeen::new(expirations),
            fatal_set: HashMap::new(),
            alert_generator: AlertGenerator::new(config.alerts.clone()),
            alert_dispatcher: AlertDispatcher::new(alertmanager_url, alertmanager_timeout),
            alert_max_age,
            timed,
            aperiodic,
            scheduled: HashMap::new(),
            ready_tx,
            ready_rx,
            command_tx,
            command_rx,
        })
    }

    pub fn handle(&self) -> ExecutorHandle {
        ExecutorHandle {
            command_tx: self.command_tx.clone(),
        }
    }

    pub fn registry(&self) -> Arc<MetricRegistry> {
        self.registry.clone()
    }

    /// Arm every timed execution's schedule. Does not block.
    pub fn start(&mut self) {
        for (execution_name, spec) in &self.timed {
            let trigger = if let Some(cron_expr) = &spec.schedule {
                match Trigger::cron(cron_expr) {
                    Ok(t) => t,
                    Err(err) => {
                        tracing::error!(query = %execution_name, error = %err, "invalid cron schedule");
                        continue;
                    }
                }
            } else {
                Trigger::Interval(Duration::from_secs(spec.interval_secs.unwrap_or(60)))
            };
            let task = ScheduledTask::spawn(execution_name.clone(), trigger, self.ready_tx.clone());
            self.scheduled.insert(execution_name.clone(), task);
        }
    }

    /// Stop all schedules and close all database workers. Every shutdown is
    /// attempted even if an earlier one fails.
    pub async fn stop(mut self) {
        for (_, task) in self.scheduled.drain() {
            task.stop().await;
        }
        for (_, db) in self.databases.drain() {
            db.shutdown().await;
        }
    }

    /// Consume timer fires and on-demand commands until the ready channel
    /// closes (i.e. every [`ScheduledTask`] and [`ExecutorHandle`] has been
    /// dropped).
    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                Some(execution_name) = self.ready_rx.recv() => {
                    self.dispatch_timed(&execution_name).await;
                }
                Some(command) = self.command_rx.recv() => {
                    match command {
                        Command::RunAperiodic(ack) => {
                            self.run_aperiodic_queries().await;
                            let _ = ack.send(());
                        }
                        Command::ClearExpiredSeries => {
                            self.clear_expired_series();
                        }
                    }
                }
                else => break,
            }
        }
    }

    async fn dispatch_timed(&mut self, execution_name: &str) {
        let Some(spec) = self.timed.get(execution_name).cloned() else {
            return;
        };
        for db_name in spec.databases.clone() {
            if let Some(interval) = spec.interval_secs {
                self.set_query_interval(&db_name, &spec.query_name, interval as f64);
            }
            self.execute_on_database(&spec, &db_name).await;
        }
        self.remove_if_doomed(execution_name);
    }

    async fn run_aperiodic_queries(&mut self) {
        let specs = self.aperiodic.clone();
        for spec in &specs {
            for db_name in spec.databases.clone() {
                self.execute_on_database(spec, &db_name).await;
            }
        }
    }

    pub fn clear_expired_series(&mut self) {
        let expired = self.last_seen.expire_series(std::time::Instant::now());
        for (metric_name, series) in expired {
            for label_values in series {
                let labels = self.reconstruct_label_map(&metric_name, &label_values);
                if let Err(err) = self.registry.remove(&metric_name, &labels) {
                    tracing::debug!(metric = %metric_name, error = %err, "failed to remove expired series");
                }
            }
        }
        self.alert_generator.cleanup_expired(self.alert_max_age);
    }

    /// Reconstruct a label map from a sorted-by-name label-values tuple.
    /// The last-seen tracker only stores values, so this relies on
    /// [`Executor::new`] having recorded the exact same sorted label-name
    /// set used when the series was last updated.
    fn reconstruct_label_map(&self, metric_name: &str, label_values: &[String]) -> HashMap<String, String> {
        let names = self
            .metric_label_names
            .get(metric_name)
            .cloned()
            .unwrap_or_default();
        names.into_iter().zip(label_values.iter().cloned()).collect()
    }

    async fn execute_on_database(&mut self, spec: &ExecutionSpec, db_name: &str) {
        if self.is_doomed(&spec.execution_name, db_name) {
            return;
        }
        let Some(worker) = self.databases.get(db_name) else {
            return;
        };

        let outcome = worker
            .execute(&spec.execution_name, &spec.sql, spec.params.clone(), spec.timeout)
            .await;
        match outcome {
            Ok(raw) => self.handle_success(spec, db_name, raw).await,
            Err(err) => self.handle_failure(spec, db_name, err),
        }
    }

    async fn handle_success(&mut self, spec: &ExecutionSpec, db_name: &str, raw: shared::model::QueryResults) {
        self.observe_query_latency(db_name, &spec.query_name, raw.latency.as_secs_f64());
        self.set_query_timestamp(db_name, &spec.query_name, raw.timestamp.timestamp() as f64);

        let mapped = query::map_results(&spec.query_name, db_name, &spec.metrics, &self.metric_configs, &raw);
        match mapped {
            Ok(mapped) => {
                for result in &mapped.metrics {
                    self.apply_metric_update(db_name, result);
                }
                if mapped.had_invalid_value {
                    self.increment_queries_count(db_name, &spec.query_name, "invalid-value");
                } else {
                    if !spec.alert_names.is_empty() && !mapped.metrics.is_empty() {
                        self.process_alerts(spec, db_name, &mapped.metrics).await;
                    }
                    self.increment_queries_count(db_name, &spec.query_name, "success");
                }
            }
            Err(_) => {
                // A fatal column-shape mismatch; handled identically to a
                // fatal query error from the database worker.
                self.mark_fatal(&spec.execution_name, db_name);
                self.increment_queries_count(db_name, &spec.query_name, "error");
            }
        }
    }

    fn handle_failure(&mut self, spec: &ExecutionSpec, db_name: &str, err: anyhow::Error) {
        match err.downcast_ref::<ExporterError>() {
            Some(ExporterError::Connect { .. }) => {
                self.increment_database_errors(db_name);
            }
            Some(ExporterError::Timeout { .. }) => {
                self.increment_queries_count(db_name, &spec.query_name, "timeout");
            }
            Some(ExporterError::Query { fatal, .. }) => {
                self.increment_queries_count(db_name, &spec.query_name, "error");
                if *fatal {
                    self.mark_fatal(&spec.execution_name, db_name);
                }
            }
            _ => {
                tracing::error!(query = %spec.query_name, database = %db_name, error = %err, "unclassified query execution error");
                self.increment_queries_count(db_name, &spec.query_name, "error");
            }
        }
    }

    async fn process_alerts(&mut self, spec: &ExecutionSpec, db_name: &str, results: &[MetricResult]) {
        let db_labels = self
            .database_labels
            .get(db_name)
            .cloned()
            .unwrap_or_default();
        let evaluated =
            self.alert_generator
                .evaluate(&spec.query_name, &spec.alert_names, db_name, &db_labels, results);
        match evaluated {
            Ok(payloads) if !payloads.is_empty() => {
                if let Err(err) = self.alert_dispatcher.send(&payloads).await {
                    tracing::error!(query = %spec.query_name, error = %err, "failed to dispatch alerts");
                }
            }
            Ok(_) => {}
            Err(err) => {
                tracing::error!(query = %spec.query_name, error = %err, "failed to evaluate alert conditions");
            }
        }
    }

    fn mark_fatal(&mut self, execution_name: &str, db_name: &str) {
        self.fatal_set
            .entry(execution_name.to_string())
            .or_default()
            .insert(db_name.to_string());
    }

    fn is_doomed(&self, execution_name: &str, db_name: &str) -> bool {
        self.fatal_set
            .get(execution_name)
            .is_some_and(|dbs| dbs.contains(db_name))
    }

    fn remove_if_doomed(&mut self, execution_name: &str) {
        let Some(spec) = self.timed.get(execution_name) else {
            return;
        };
        let all_doomed = self
            .fatal_set
            .get(execution_name)
            .is_some_and(|dbs| spec.databases.iter().all(|d| dbs.contains(d)));
        if all_doomed {
            if let Some(task) = self.scheduled.remove(execution_name) {
                tokio::spawn(task.stop());
            }
            self.timed.remove(execution_name);
        }
    }

    fn apply_metric_update(&mut self, db_name: &str, result: &MetricResult) {
        let Some(config) = self.metric_configs.get(&result.metric_name).cloned() else {
            return;
        };
        let mut labels = self.database_labels.get(db_name).cloned().unwrap_or_default();
        labels.insert("database".to_string(), db_name.to_string());
        for (name, value) in &result.labels {
            labels.insert(name.clone(), value.clone());
        }

        let update = match config.metric_type {
            MetricType::Gauge => self.registry.set(&result.metric_name, &labels, result.value),
            MetricType::Counter if config.increment => {
                self.registry.increment(&result.metric_name, &labels, result.value)
            }
            MetricType::Counter => self.registry.set(&result.metric_name, &labels, result.value),
            MetricType::Histogram | MetricType::Summary => {
                self.registry.observe(&result.metric_name, &labels, result.value)
            }
            MetricType::Enum => self.registry.state(&result.metric_name, &labels, result.value),
        };
        if let Err(err) = update {
            tracing::debug!(metric = %result.metric_name, error = %err, "failed to update metric");
            return;
        }

        let mut sorted_labels: Vec<String> = labels.keys().cloned().collect();
        sorted_labels.sort();
        let values: Vec<String> = sorted_labels.iter().map(|k| labels[k].clone()).collect();
        self.last_seen
            .update(&result.metric_name, values, std::time::Instant::now());
    }

    fn increment_queries_count(&self, db_name: &str, query_name: &str, status: &str) {
        let labels = self.builtin_labels(db_name, &[("query", query_name), ("status", status)]);
        let _ = self.registry.increment(QUERIES_METRIC, &labels, 1.0);
    }

    fn increment_database_errors(&self, db_name: &str) {
        let labels = self.builtin_labels(db_name, &[]);
        let _ = self.registry.increment(DB_ERRORS_METRIC, &labels, 1.0);
    }

    fn observe_query_latency(&self, db_name: &str, query_name: &str, latency_secs: f64) {
        let labels = self.builtin_labels(db_name, &[("query", query_name)]);
        let _ = self.registry.observe(QUERY_LATENCY_METRIC, &labels, latency_secs);
    }

    fn set_query_timestamp(&self, db_name: &str, query_name: &str, timestamp: f64) {
        let labels = self.builtin_labels(db_name, &[("query", query_name)]);
        let _ = self.registry.set(QUERY_TIMESTAMP_METRIC, &labels, timestamp);
    }

    fn set_query_interval(&self, db_name: &str, query_name: &str, interval_secs: f64) {
        let labels = self.builtin_labels(db_name, &[("query", query_name)]);
        let _ = self.registry.set(QUERY_INTERVAL_METRIC, &labels, interval_secs);
    }

    /// Builtin metric labels carry the executing database's name and its
    /// static labels, same as a regular metric update — `_update_metric`
    /// in the source applies `{database} ∪ database.config.labels` to every
    /// builtin, not just user metrics, and builtins are registered with
    /// that same label set as `extra_label_names` so a mismatched map here
    /// would panic in `CounterVec::with`.
    fn builtin_labels(&self, db_name: &str, extra: &[(&str, &str)]) -> HashMap<String, String> {
        let mut labels = self.database_labels.get(db_name).cloned().unwrap_or_default();
        labels.insert("database".to_string(), db_name.to_string());
        for (k, v) in extra {
            labels.insert(k.to_string(), v.to_string());
        }
        labels
    }
}

fn register_builtin_metrics(registry: &mut MetricRegistry, extra_labels: &[String]) -> Result<()> {
    use shared::config::MetricConfig;

    let db_errors = MetricConfig {
        metric_type: MetricType::Counter,
        description: "Number of database errors".to_string(),
        labels: vec![],
        buckets: None,
        states: None,
        expiration: None,
        increment: true,
    };
    let queries = MetricConfig {
        metric_type: MetricType::Counter,
        description: "Number of database queries".to_string(),
        labels: vec!["query".to_string(), "status".to_string()],
        buckets: None,
        states: None,
        expiration: None,
        increment: true,
    };
    let query_timestamp = MetricConfig {
        metric_type: MetricType::Gauge,
        description: "Query last execution timestamp".to_string(),
        labels: vec!["query".to_string()],
        buckets: None,
        states: None,
        expiration: None,
        increment: false,
    };
    let query_latency = MetricConfig {
        metric_type: MetricType::Histogram,
        description: "Query execution latency".to_string(),
        labels: vec!["query".to_string()],
        buckets: None,
        states: None,
        expiration: None,
        increment: false,
    };
    let query_interval = MetricConfig {
        metric_type: MetricType::Gauge,
        description: "Query execution interval".to_string(),
        labels: vec!["query".to_string()],
        buckets: None,
        states: None,
        expiration: None,
        increment: false,
    };

    registry.register(DB_ERRORS_METRIC, &db_errors, extra_labels)?;
    registry.register(QUERIES_METRIC, &queries, extra_labels)?;
    registry.register(QUERY_TIMESTAMP_METRIC, &query_timestamp, extra_labels)?;
    registry.register(QUERY_LATENCY_METRIC, &query_latency, extra_labels)?;
    registry.register(QUERY_INTERVAL_METRIC, &query_interval, extra_labels)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_metrics_register_without_conflict() {
        let mut registry = MetricRegistry::new();
        register_builtin_metrics(&mut registry, &["region".to_string()]).unwrap();
    }

    #[test]
    fn empty_config_builds_a_runnable_executor() {
        let executor = Executor::new(Config::default()).unwrap();
        assert!(executor.timed.is_empty());
        assert!(executor.aperiodic.is_empty());
        assert!(executor.databases.is_empty());
    }

    #[test]
    fn fatal_set_tracks_per_database_and_drives_schedule_removal() {
        let mut executor = Executor::new(Config::default()).unwrap();
        executor.timed.insert(
            "q".to_string(),
            ExecutionSpec {
                execution_name: "q".to_string(),
                query_name: "q".to_string(),
                databases: vec!["a".to_string(), "b".to_string()],
                metrics: vec![],
                sql: "select 1".to_string(),
                params: HashMap::new(),
                timeout: Duration::from_secs(1),
                alert_names: vec![],
                interval_secs: Some(5),
                schedule: None,
            },
        );

        assert!(!executor.is_doomed("q", "a"));
        executor.mark_fatal("q", "a");
        assert!(executor.is_doomed("q", "a"));
        assert!(!executor.is_doomed("q", "b"));

        executor.remove_if_doomed("q");
        assert!(executor.timed.contains_key("q"), "still runnable against db b");

        executor.mark_fatal("q", "b");
        executor.remove_if_doomed("q");
        assert!(
            !executor.timed.contains_key("q"),
            "doomed on every database, should be dropped from the schedule"
        );
    }

    #[test]
    fn builtin_labels_carry_the_executing_database_and_its_static_labels() {
        use shared::config::{Dsn, DatabaseConfig};

        let mut config = Config::default();
        let mut db_labels = HashMap::new();
        db_labels.insert("region".to_string(), "eu".to_string());
        config.databases.insert(
            "db".to_string(),
            DatabaseConfig {
                dsn: Dsn("sqlite::memory:".to_string()),
                autocommit: true,
                keep_connected: true,
                connect_sql: vec![],
                labels: db_labels,
                pool_size: None,
            },
        );

        let executor = Executor::new(config).unwrap();
        let labels = executor.builtin_labels("db", &[("query", "q")]);
        assert_eq!(labels.get("database").map(String::as_str), Some("db"));
        assert_eq!(labels.get("region").map(String::as_str), Some("eu"));
        assert_eq!(labels.get("query").map(String::as_str), Some("q"));
    }
}
