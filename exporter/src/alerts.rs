//! Alert state machine and Alertmanager dispatcher.
//!
//! One [`AlertState`] tracks a single series' condition history:
//! `inactive -> pending -> firing`, gated by the alert's `for` duration and
//! a `sent` flag that suppresses repeat dispatch while a series stays
//! firing continuously (ported as-is from `AlertState.update`/`sent` in
//! `alert_manager.py` — see the recorded Open Question on whether this
//! should ever re-send).

use chrono::{DateTime, Utc};
use serde::Serialize;
use shared::config::{parse_condition, AlertConfig};
use shared::model::MetricResult;
use shared::Result;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Inactive,
    Pending,
    Firing,
}

struct AlertState {
    phase: Phase,
    start_time: Option<DateTime<Utc>>,
    last_active: Instant,
    sent: bool,
}

impl AlertState {
    fn new(now: Instant) -> Self {
        Self {
            phase: Phase::Inactive,
            start_time: None,
            last_active: now,
            sent: false,
        }
    }

    /// Apply one evaluation outcome. Returns `true` exactly on the
    /// transition into `firing` that should be dispatched.
    fn evaluate(&mut self, condition_met: bool, for_duration: Duration, now: Instant, wall_now: DateTime<Utc>) -> bool {
        self.last_active = now;

        if !condition_met {
            self.phase = Phase::Inactive;
            self.start_time = None;
            self.sent = false;
            return false;
        }

        if self.phase == Phase::Inactive {
            self.phase = Phase::Pending;
            self.start_time = Some(wall_now);
            self.sent = false;
        }

        let elapsed = self
            .start_time
            .map(|start| (wall_now - start).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO);

        if elapsed >= for_duration {
            let just_fired = self.phase != Phase::Firing;
            self.phase = Phase::Firing;
            if just_fired && !self.sent {
                self.sent = true;
                return true;
            }
        }

        false
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    #[serde(rename = "startsAt")]
    pub starts_at: String,
    #[serde(rename = "generatorURL")]
    pub generator_url: String,
}

/// Evaluates conditions and maintains per-series alert state; does not own
/// HTTP dispatch (see [`AlertDispatcher`]).
pub struct AlertGenerator {
    configs: HashMap<String, AlertConfig>,
    states: HashMap<String, AlertState>,
}

impl AlertGenerator {
    pub fn new(configs: HashMap<String, AlertConfig>) -> Self {
        Self {
            configs,
            states: HashMap::new(),
        }
    }

    /// Evaluate every alert referenced by a query against its metric
    /// results, returning payloads for any series that just transitioned to
    /// firing.
    pub fn evaluate(
        &mut self,
        query_name: &str,
        alert_names: &[String],
        database: &str,
        database_labels: &HashMap<String, String>,
        results: &[MetricResult],
    ) -> Result<Vec<AlertPayload>> {
        let mut payloads = Vec::new();
        let now = Instant::now();
        let wall_now = Utc::now();

        for alert_name in alert_names {
            let Some(config) = self.configs.get(alert_name) else {
                continue;
            };
            let (op, threshold) = parse_condition(&config.condition)?;
            let for_duration = Duration::from_secs(
                shared::utils::parse_duration_minutes_default(&config.for_duration)?,
            );

            for result in results.iter().filter(|r| r.metric_name == *alert_name) {
                let condition_met = op.evaluate(result.value, threshold);
                let key = alert_key(alert_name, database, database_labels, result);

                let state = self
                    .states
                    .entry(key)
                    .or_insert_with(|| AlertState::new(now));
                let fired = state.evaluate(condition_met, for_duration, now, wall_now);

                if fired {
                    payloads.push(build_payload(
                        alert_name,
                        config,
                        query_name,
                        database_labels,
                        result,
                        state.start_time.unwrap_or(wall_now),
                    ));
                }
            }
        }

        Ok(payloads)
    }

    /// Drop alert states that haven't been evaluated for `max_age`.
    pub fn cleanup_expired(&mut self, max_age: Duration) {
        let now = Instant::now();
        self.states
            .retain(|_, state| now.saturating_duration_since(state.last_active) <= max_age);
    }
}

fn alert_key(
    alert_name: &str,
    database: &str,
    database_labels: &HashMap<String, String>,
    result: &MetricResult,
) -> String {
    let mut parts = vec![format!("database:{database}")];
    let mut db_labels: Vec<_> = database_labels.iter().collect();
    db_labels.sort_by_key(|(k, _)| k.clone());
    parts.extend(db_labels.into_iter().map(|(k, v)| format!("{k}:{v}")));
    parts.extend(result.labels.iter().map(|(k, v)| format!("{k}:{v}")));
    format!("{alert_name}|{}", parts.join("|"))
}

fn build_payload(
    alert_name: &str,
    config: &AlertConfig,
    query_name: &str,
    database_labels: &HashMap<String, String>,
    result: &MetricResult,
    start_time: DateTime<Utc>,
) -> AlertPayload {
    let mut labels = database_labels.clone();
    for (name, value) in &result.labels {
        labels.insert(name.clone(), value.clone());
    }
    for label in &config.labels {
        if let Some(static_value) = &label.static_value {
            labels.insert(label.name.clone(), static_value.clone());
        } else if let Some((_, v)) = result.labels.iter().find(|(n, _)| n == &label.name) {
            labels.insert(label.name.clone(), v.clone());
        }
    }
    labels.insert("alertname".to_string(), alert_name.to_string());
    labels.insert("severity".to_string(), config.severity.clone());
    labels.insert("query".to_string(), query_name.to_string());

    let mut annotations = config.annotations.clone();
    annotations
        .entry("summary".to_string())
        .or_insert_with(|| config.summary.clone().unwrap_or_else(|| alert_name.to_string()));
    annotations
        .entry("description".to_string())
        .or_insert_with(|| config.description.clone().unwrap_or_default());
    annotations.insert("value".to_string(), result.value.to_string());
    let duration = (Utc::now() - start_time).num_seconds().max(0);
    annotations.insert("duration".to_string(), format!("{duration}s"));

    AlertPayload {
        labels,
        annotations,
        starts_at: start_time.to_rfc3339(),
        generator_url: format!("http://query-exporter/alerts?query={query_name}"),
    }
}

/// HTTP POST dispatcher for alert payloads.
pub struct AlertDispatcher {
    client: reqwest::Client,
    url: String,
}

impl AlertDispatcher {
    pub fn new(url: String, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, url }
    }

    pub async fn send(&self, alerts: &[AlertPayload]) -> Result<()> {
        if alerts.is_empty() || self.url.is_empty() {
            return Ok(());
        }

        let endpoint = format!("{}/api/v2/alerts", self.url.trim_end_matches('/'));
        let response = self.client.post(&endpoint).json(alerts).send().await?;

        if !response.status().is_success() {
            tracing::error!(
                status = %response.status(),
                "alertmanager rejected alert payload"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::config::AlertLabel;

    fn alert_config(condition: &str, for_duration: &str) -> AlertConfig {
        AlertConfig {
            condition: condition.to_string(),
            for_duration: for_duration.to_string(),
            severity: "warning".to_string(),
            labels: vec![AlertLabel {
                name: "l".to_string(),
                static_value: None,
            }],
            annotations: HashMap::new(),
            summary: None,
            description: None,
        }
    }

    fn result(value: f64, label: &str) -> MetricResult {
        MetricResult {
            metric_name: "HighErr".to_string(),
            value,
            labels: vec![("l".to_string(), label.to_string())],
        }
    }

    #[test]
    fn fires_only_after_sustained_duration() {
        let mut configs = HashMap::new();
        configs.insert("HighErr".to_string(), alert_config("> 0", "0s"));
        let mut generator = AlertGenerator::new(configs);

        let payloads = generator
            .evaluate("q", &["HighErr".to_string()], "db", &HashMap::new(), &[result(5.0, "foo")])
            .unwrap();
        assert_eq!(payloads.len(), 1);

        let payloads = generator
            .evaluate("q", &["HighErr".to_string()], "db", &HashMap::new(), &[result(5.0, "foo")])
            .unwrap();
        assert!(payloads.is_empty(), "already sent, should not re-fire while continuously active");
    }

    #[test]
    fn reverting_to_inactive_clears_sent_flag() {
        let mut configs = HashMap::new();
        configs.insert("HighErr".to_string(), alert_config("> 0", "0s"));
        let mut generator = AlertGenerator::new(configs);

        generator
            .evaluate("q", &["HighErr".to_string()], "db", &HashMap::new(), &[result(5.0, "foo")])
            .unwrap();
        generator
            .evaluate("q", &["HighErr".to_string()], "db", &HashMap::new(), &[result(0.0, "foo")])
            .unwrap();
        let payloads = generator
            .evaluate("q", &["HighErr".to_string()], "db", &HashMap::new(), &[result(5.0, "foo")])
            .unwrap();
        assert_eq!(payloads.len(), 1, "re-activation should dispatch again");
    }
}
